// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//
// Copyright © 2020, Microsoft  Corporation
//
// Copyright 2018-2019 CrowdStrike, Inc.
//
//

//! Conversions between the portable x86-64 `State` and the KVM register
//! structures.

use kvm_bindings::{
    kvm_debugregs, kvm_dtable, kvm_fpu, kvm_msr_entry, kvm_regs, kvm_segment, kvm_sregs,
    kvm_vcpu_events, KVM_VCPUEVENT_VALID_SHADOW,
};

use crate::arch::x86::*;

///
/// Export generically-named wrappers of kvm-bindings for Unix-based platforms
///
pub use {kvm_bindings::CpuId, kvm_bindings::Msrs as MsrEntries};

pub const KVM_TSS_ADDRESS: u64 = 0xfffb_d000;

// KVM_X86_SHADOW_INT_MOV_SS | KVM_X86_SHADOW_INT_STI
const KVM_INT_SHADOW_MASK: u8 = 0x3;
const KVM_INT_SHADOW_STI: u8 = 0x2;

pub fn segment_from_kvm(seg: &kvm_segment) -> SegmentState {
    SegmentState {
        selector: u64::from(seg.selector),
        attrib: SegmentState::make_attrib(
            seg.type_,
            seg.s,
            seg.dpl,
            seg.present,
            seg.avl,
            seg.l,
            seg.db,
            seg.g,
            seg.unusable,
        ),
        limit: u64::from(seg.limit),
        base: seg.base,
    }
}

pub fn segment_to_kvm(seg: &SegmentState) -> kvm_segment {
    kvm_segment {
        base: seg.base,
        limit: seg.limit as u32,
        selector: seg.selector as u16,
        type_: seg.segment_type(),
        present: seg.present(),
        dpl: seg.dpl(),
        db: seg.db(),
        s: seg.desc_type(),
        l: seg.long(),
        g: seg.granularity(),
        avl: seg.avl(),
        unusable: seg.unusable(),
        padding: 0,
    }
}

fn dtable_from_kvm(table: &kvm_dtable) -> SegmentState {
    SegmentState {
        limit: u64::from(table.limit),
        base: table.base,
        ..Default::default()
    }
}

fn dtable_to_kvm(seg: &SegmentState) -> kvm_dtable {
    kvm_dtable {
        base: seg.base,
        limit: seg.limit as u16,
        padding: [0; 3],
    }
}

/// Fills the segment, control register and EFER parts of `sregs` that the
/// groups in question own. `apic_base` and the interrupt bitmap are kept.
pub fn sregs_from_state(sregs: &mut kvm_sregs, state: &State, segs: bool, crs: bool, efer: bool) {
    if segs {
        sregs.es = segment_to_kvm(&state.segs[SEG_ES]);
        sregs.cs = segment_to_kvm(&state.segs[SEG_CS]);
        sregs.ss = segment_to_kvm(&state.segs[SEG_SS]);
        sregs.ds = segment_to_kvm(&state.segs[SEG_DS]);
        sregs.fs = segment_to_kvm(&state.segs[SEG_FS]);
        sregs.gs = segment_to_kvm(&state.segs[SEG_GS]);
        sregs.ldt = segment_to_kvm(&state.segs[SEG_LDT]);
        sregs.tr = segment_to_kvm(&state.segs[SEG_TR]);
        sregs.gdt = dtable_to_kvm(&state.segs[SEG_GDT]);
        sregs.idt = dtable_to_kvm(&state.segs[SEG_IDT]);
    }
    if crs {
        sregs.cr0 = state.crs[CR_CR0];
        sregs.cr2 = state.crs[CR_CR2];
        sregs.cr3 = state.crs[CR_CR3];
        sregs.cr4 = state.crs[CR_CR4];
        sregs.cr8 = state.crs[CR_CR8];
    }
    if efer {
        sregs.efer = state.msrs[MSR_EFER];
    }
}

pub fn sregs_to_state(sregs: &kvm_sregs, state: &mut State, segs: bool, crs: bool, efer: bool) {
    if segs {
        state.segs[SEG_ES] = segment_from_kvm(&sregs.es);
        state.segs[SEG_CS] = segment_from_kvm(&sregs.cs);
        state.segs[SEG_SS] = segment_from_kvm(&sregs.ss);
        state.segs[SEG_DS] = segment_from_kvm(&sregs.ds);
        state.segs[SEG_FS] = segment_from_kvm(&sregs.fs);
        state.segs[SEG_GS] = segment_from_kvm(&sregs.gs);
        state.segs[SEG_LDT] = segment_from_kvm(&sregs.ldt);
        state.segs[SEG_TR] = segment_from_kvm(&sregs.tr);
        state.segs[SEG_GDT] = dtable_from_kvm(&sregs.gdt);
        state.segs[SEG_IDT] = dtable_from_kvm(&sregs.idt);
    }
    if crs {
        state.crs[CR_CR0] = sregs.cr0;
        state.crs[CR_CR2] = sregs.cr2;
        state.crs[CR_CR3] = sregs.cr3;
        state.crs[CR_CR4] = sregs.cr4;
        state.crs[CR_CR8] = sregs.cr8;
    }
    if efer {
        state.msrs[MSR_EFER] = sregs.efer;
    }
}

pub fn regs_from_state(state: &State) -> kvm_regs {
    let g = &state.gprs;
    kvm_regs {
        rax: g[GPR_RAX],
        rbx: g[GPR_RBX],
        rcx: g[GPR_RCX],
        rdx: g[GPR_RDX],
        rsi: g[GPR_RSI],
        rdi: g[GPR_RDI],
        rsp: g[GPR_RSP],
        rbp: g[GPR_RBP],
        r8: g[GPR_R8],
        r9: g[GPR_R9],
        r10: g[GPR_R10],
        r11: g[GPR_R11],
        r12: g[GPR_R12],
        r13: g[GPR_R13],
        r14: g[GPR_R14],
        r15: g[GPR_R15],
        rip: g[GPR_RIP],
        rflags: g[GPR_RFLAGS],
    }
}

pub fn regs_to_state(regs: &kvm_regs, state: &mut State) {
    let g = &mut state.gprs;
    g[GPR_RAX] = regs.rax;
    g[GPR_RBX] = regs.rbx;
    g[GPR_RCX] = regs.rcx;
    g[GPR_RDX] = regs.rdx;
    g[GPR_RSI] = regs.rsi;
    g[GPR_RDI] = regs.rdi;
    g[GPR_RSP] = regs.rsp;
    g[GPR_RBP] = regs.rbp;
    g[GPR_R8] = regs.r8;
    g[GPR_R9] = regs.r9;
    g[GPR_R10] = regs.r10;
    g[GPR_R11] = regs.r11;
    g[GPR_R12] = regs.r12;
    g[GPR_R13] = regs.r13;
    g[GPR_R14] = regs.r14;
    g[GPR_R15] = regs.r15;
    g[GPR_RIP] = regs.rip;
    g[GPR_RFLAGS] = regs.rflags;
}

pub fn debugregs_from_state(current: &kvm_debugregs, state: &State) -> kvm_debugregs {
    kvm_debugregs {
        db: [
            state.drs[DR_DR0],
            state.drs[DR_DR1],
            state.drs[DR_DR2],
            state.drs[DR_DR3],
        ],
        dr6: state.drs[DR_DR6],
        dr7: state.drs[DR_DR7],
        ..*current
    }
}

pub fn debugregs_to_state(dregs: &kvm_debugregs, state: &mut State) {
    state.drs[DR_DR0] = dregs.db[0];
    state.drs[DR_DR1] = dregs.db[1];
    state.drs[DR_DR2] = dregs.db[2];
    state.drs[DR_DR3] = dregs.db[3];
    state.drs[DR_DR6] = dregs.dr6;
    state.drs[DR_DR7] = dregs.dr7;
}

pub fn fpu_from_state(state: &State) -> kvm_fpu {
    let f = &state.fpu;
    kvm_fpu {
        fpr: f.st,
        fcw: f.fcw,
        fsw: f.fsw,
        ftwx: f.ftw,
        pad1: 0,
        last_opcode: f.fop,
        last_ip: f.fip,
        last_dp: f.fdp,
        xmm: f.xmm,
        mxcsr: f.mxcsr,
        pad2: 0,
    }
}

/// KVM does not report MXCSR_MASK, the value already in `state` is kept.
pub fn fpu_to_state(fpu: &kvm_fpu, state: &mut State) {
    let f = &mut state.fpu;
    f.st = fpu.fpr;
    f.fcw = fpu.fcw;
    f.fsw = fpu.fsw;
    f.ftw = fpu.ftwx;
    f.fop = fpu.last_opcode;
    f.fip = fpu.last_ip;
    f.fdp = fpu.last_dp;
    f.xmm = fpu.xmm;
    f.mxcsr = fpu.mxcsr;
}

/// MSR entries owned by the MSRS group. EFER travels through `kvm_sregs`.
pub fn msr_entries_from_state(state: &State) -> Vec<kvm_msr_entry> {
    MSR_INDICES
        .iter()
        .zip(state.msrs.iter())
        .skip(MSR_EFER + 1)
        .map(|(index, data)| kvm_msr_entry {
            index: *index,
            data: *data,
            ..Default::default()
        })
        .collect()
}

pub fn msr_entries_to_state(entries: &[kvm_msr_entry], state: &mut State) {
    for entry in entries {
        if let Some(slot) = MSR_INDICES.iter().position(|index| *index == entry.index) {
            state.msrs[slot] = entry.data;
        }
    }
}

pub fn intr_from_state(events: &mut kvm_vcpu_events, state: &State) {
    events.interrupt.shadow = if state.intr.int_shadow != 0 {
        KVM_INT_SHADOW_STI
    } else {
        0
    };
    events.nmi.masked = (state.intr.nmi_masked != 0) as u8;
    events.flags |= KVM_VCPUEVENT_VALID_SHADOW;
}

pub fn intr_to_state(events: &kvm_vcpu_events, state: &mut State) {
    state.intr.int_shadow = u64::from(events.interrupt.shadow & KVM_INT_SHADOW_MASK != 0);
    state.intr.nmi_masked = u64::from(events.nmi.masked);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_conversion() {
        let seg = SegmentState::real_mode(0xf000, CODE_SEGMENT_TYPE | RWRX_SEGMENT_TYPE);
        let kvm = segment_to_kvm(&seg);
        assert_eq!(kvm.base, 0xf0000);
        assert_eq!(kvm.selector, 0xf000);
        assert_eq!(kvm.type_, 0xa);
        assert_eq!(kvm.s, 1);
        assert_eq!(kvm.present, 1);
        assert_eq!(segment_from_kvm(&kvm), seg);
    }

    #[test]
    fn test_sregs_groups() {
        let mut state = State::real_mode(0, 0x7c00);
        state.crs[CR_CR3] = 0x1000;
        state.msrs[MSR_EFER] = 0x500;

        let mut sregs = kvm_sregs {
            apic_base: 0xfee0_0900,
            ..Default::default()
        };
        sregs_from_state(&mut sregs, &state, true, false, true);
        assert_eq!(sregs.cr3, 0);
        assert_eq!(sregs.efer, 0x500);
        assert_eq!(sregs.apic_base, 0xfee0_0900);

        let mut back = State::default();
        sregs_to_state(&sregs, &mut back, true, false, true);
        assert_eq!(back.segs, state.segs);
        assert_eq!(back.msrs[MSR_EFER], 0x500);
        assert_eq!(back.crs, [0; NCRS]);
    }

    #[test]
    fn test_regs_and_fpu() {
        let mut state = State::default();
        for (i, r) in state.gprs.iter_mut().enumerate() {
            *r = i as u64 * 0x11;
        }
        state.fpu.fcw = 0x37f;
        state.fpu.xmm[3] = [7; 16];

        let mut back = State::default();
        regs_to_state(&regs_from_state(&state), &mut back);
        fpu_to_state(&fpu_from_state(&state), &mut back);
        assert_eq!(back.gprs, state.gprs);
        assert_eq!(back.fpu, state.fpu);
    }

    #[test]
    fn test_msr_entries_skip_efer() {
        let mut state = State::default();
        for (i, m) in state.msrs.iter_mut().enumerate() {
            *m = 0x100 + i as u64;
        }
        let entries = msr_entries_from_state(&state);
        assert_eq!(entries.len(), NMSRS - 1);
        assert!(entries.iter().all(|e| e.index != MSR_INDICES[MSR_EFER]));

        let mut back = State::default();
        msr_entries_to_state(&entries, &mut back);
        assert_eq!(back.msrs[MSR_EFER], 0);
        assert_eq!(back.msrs[MSR_TSC], state.msrs[MSR_TSC]);
        assert_eq!(back.msrs[MSR_STAR], state.msrs[MSR_STAR]);
    }

    #[test]
    fn test_intr_shadow() {
        let mut state = State::default();
        state.intr.int_shadow = 1;
        state.intr.nmi_masked = 1;
        let mut events = kvm_vcpu_events::default();
        intr_from_state(&mut events, &state);
        assert_ne!(events.flags & KVM_VCPUEVENT_VALID_SHADOW, 0);

        let mut back = State::default();
        intr_to_state(&events, &mut back);
        assert_eq!(back.intr.int_shadow, 1);
        assert_eq!(back.intr.nmi_masked, 1);
    }
}
