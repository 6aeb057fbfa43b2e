// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//

//! x86-64 vcpu state as exchanged between the monitor and its backends.
//!
//! The buffer passed to `Vcpu::set_state`/`Vcpu::get_state` is exactly one
//! [`State`], laid out as `#[repr(C)]` with no padding so it can be viewed as
//! plain bytes.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::cpu::{HypervisorCpuError, StateMask};

// Segment slots, in `State::segs` order.
pub const SEG_ES: usize = 0;
pub const SEG_CS: usize = 1;
pub const SEG_SS: usize = 2;
pub const SEG_DS: usize = 3;
pub const SEG_FS: usize = 4;
pub const SEG_GS: usize = 5;
pub const SEG_GDT: usize = 6;
pub const SEG_IDT: usize = 7;
pub const SEG_LDT: usize = 8;
pub const SEG_TR: usize = 9;
pub const NSEGS: usize = 10;

pub const GPR_RAX: usize = 0;
pub const GPR_RCX: usize = 1;
pub const GPR_RDX: usize = 2;
pub const GPR_RBX: usize = 3;
pub const GPR_RSP: usize = 4;
pub const GPR_RBP: usize = 5;
pub const GPR_RSI: usize = 6;
pub const GPR_RDI: usize = 7;
pub const GPR_R8: usize = 8;
pub const GPR_R9: usize = 9;
pub const GPR_R10: usize = 10;
pub const GPR_R11: usize = 11;
pub const GPR_R12: usize = 12;
pub const GPR_R13: usize = 13;
pub const GPR_R14: usize = 14;
pub const GPR_R15: usize = 15;
pub const GPR_RIP: usize = 16;
pub const GPR_RFLAGS: usize = 17;
pub const NGPRS: usize = 18;

pub const CR_CR0: usize = 0;
pub const CR_CR2: usize = 1;
pub const CR_CR3: usize = 2;
pub const CR_CR4: usize = 3;
pub const CR_CR8: usize = 4;
pub const NCRS: usize = 5;

pub const DR_DR0: usize = 0;
pub const DR_DR1: usize = 1;
pub const DR_DR2: usize = 2;
pub const DR_DR3: usize = 3;
pub const DR_DR6: usize = 4;
pub const DR_DR7: usize = 5;
pub const NDRS: usize = 6;

pub const MSR_EFER: usize = 0;
pub const MSR_STAR: usize = 1;
pub const MSR_LSTAR: usize = 2;
pub const MSR_CSTAR: usize = 3;
pub const MSR_SFMASK: usize = 4;
pub const MSR_KERNELGSBASE: usize = 5;
pub const MSR_SYSENTER_CS: usize = 6;
pub const MSR_SYSENTER_ESP: usize = 7;
pub const MSR_SYSENTER_EIP: usize = 8;
pub const MSR_PAT: usize = 9;
pub const MSR_TSC: usize = 10;
pub const NMSRS: usize = 11;

/// Architectural MSR numbers backing `State::msrs`, in slot order.
pub const MSR_INDICES: [u32; NMSRS] = [
    0xc000_0080, // EFER
    0xc000_0081, // STAR
    0xc000_0082, // LSTAR
    0xc000_0083, // CSTAR
    0xc000_0084, // SFMASK
    0xc000_0102, // KERNEL_GS_BASE
    0x0000_0174, // SYSENTER_CS
    0x0000_0175, // SYSENTER_ESP
    0x0000_0176, // SYSENTER_EIP
    0x0000_0277, // PAT
    0x0000_0010, // TSC
];

pub const RFLAGS_RESERVED_1: u64 = 1 << 1;
pub const RFLAGS_IF: u64 = 1 << 9;

pub const CR0_ET: u64 = 1 << 4;
pub const CR0_NE: u64 = 1 << 5;

// Code segment
pub const CODE_SEGMENT_TYPE: u8 = 0x8;

// Read/Write or Read/Exec segment
pub const RWRX_SEGMENT_TYPE: u8 = 0x2;

// Accessed
pub const ACCESSED_SEGMENT_TYPE: u8 = 0x1;

/// One segment register, or a descriptor table register for GDT/IDT.
///
/// `attrib` uses the VMX access-rights encoding: type in bits 0-3, S in bit 4,
/// DPL in bits 5-6, P in bit 7, AVL in bit 12, L in bit 13, D/B in bit 14,
/// G in bit 15 and "unusable" in bit 16.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SegmentState {
    pub selector: u64,
    pub attrib: u64,
    pub limit: u64,
    pub base: u64,
}

const ATTR_S: u64 = 1 << 4;
const ATTR_P: u64 = 1 << 7;
const ATTR_AVL: u64 = 1 << 12;
const ATTR_L: u64 = 1 << 13;
const ATTR_DB: u64 = 1 << 14;
const ATTR_G: u64 = 1 << 15;
const ATTR_UNUSABLE: u64 = 1 << 16;

fn attr_bit(attrib: u64, bit: u64) -> u8 {
    (attrib & bit != 0) as u8
}

impl SegmentState {
    pub fn segment_type(&self) -> u8 {
        (self.attrib & 0xf) as u8
    }

    pub fn desc_type(&self) -> u8 {
        attr_bit(self.attrib, ATTR_S)
    }

    pub fn dpl(&self) -> u8 {
        ((self.attrib >> 5) & 0x3) as u8
    }

    pub fn present(&self) -> u8 {
        attr_bit(self.attrib, ATTR_P)
    }

    pub fn avl(&self) -> u8 {
        attr_bit(self.attrib, ATTR_AVL)
    }

    pub fn long(&self) -> u8 {
        attr_bit(self.attrib, ATTR_L)
    }

    pub fn db(&self) -> u8 {
        attr_bit(self.attrib, ATTR_DB)
    }

    pub fn granularity(&self) -> u8 {
        attr_bit(self.attrib, ATTR_G)
    }

    pub fn unusable(&self) -> u8 {
        attr_bit(self.attrib, ATTR_UNUSABLE)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn make_attrib(
        segment_type: u8,
        desc_type: u8,
        dpl: u8,
        present: u8,
        avl: u8,
        long: u8,
        db: u8,
        granularity: u8,
        unusable: u8,
    ) -> u64 {
        let flag = |v: u8, bit: u64| if v != 0 { bit } else { 0 };
        u64::from(segment_type & 0xf)
            | flag(desc_type, ATTR_S)
            | (u64::from(dpl & 0x3) << 5)
            | flag(present, ATTR_P)
            | flag(avl, ATTR_AVL)
            | flag(long, ATTR_L)
            | flag(db, ATTR_DB)
            | flag(granularity, ATTR_G)
            | flag(unusable, ATTR_UNUSABLE)
    }

    /// 16-bit real-mode segment whose base is `selector << 4`.
    pub fn real_mode(selector: u16, segment_type: u8) -> Self {
        SegmentState {
            selector: u64::from(selector),
            attrib: Self::make_attrib(segment_type, 1, 0, 1, 0, 0, 0, 0, 0),
            limit: 0xffff,
            base: u64::from(selector) << 4,
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct IntrState {
    /// Interrupts are blocked by STI or MOV SS.
    pub int_shadow: u64,
    pub nmi_masked: u64,
    /// The backend exits as soon as an interrupt could be delivered.
    pub int_window_exiting: u64,
}

/// Legacy FXSAVE image, without the reserved tail.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct FpuState {
    pub fcw: u16,
    pub fsw: u16,
    /// Abridged tag word.
    pub ftw: u8,
    pub rsvd: u8,
    pub fop: u16,
    pub fip: u64,
    pub fdp: u64,
    pub mxcsr: u32,
    pub mxcsr_mask: u32,
    pub st: [[u8; 16]; 8],
    pub xmm: [[u8; 16]; 16],
}

/// Complete architectural state of one x86-64 vcpu.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct State {
    pub segs: [SegmentState; NSEGS],
    pub gprs: [u64; NGPRS],
    pub crs: [u64; NCRS],
    pub drs: [u64; NDRS],
    pub msrs: [u64; NMSRS],
    pub intr: IntrState,
    pub fpu: FpuState,
}

pub const STATE_SIZE: usize = std::mem::size_of::<State>();

impl State {
    /// Decodes a state buffer, which must be exactly `STATE_SIZE` bytes.
    pub fn from_buffer(buf: &[u8]) -> Result<Self, HypervisorCpuError> {
        State::read_from_bytes(buf).map_err(|_| HypervisorCpuError::StateSize(buf.len()))
    }

    /// Encodes into a state buffer of exactly `STATE_SIZE` bytes.
    pub fn to_buffer(&self, buf: &mut [u8]) -> Result<(), HypervisorCpuError> {
        self.write_to(buf)
            .map_err(|_| HypervisorCpuError::StateSize(buf.len()))
    }

    /// Copies the register groups selected by `mask` from `src`.
    pub fn copy_groups(&mut self, src: &State, mask: StateMask) {
        if mask.contains(StateMask::SEGS) {
            self.segs = src.segs;
        }
        if mask.contains(StateMask::GPRS) {
            self.gprs = src.gprs;
        }
        if mask.contains(StateMask::CRS) {
            self.crs = src.crs;
        }
        if mask.contains(StateMask::DRS) {
            self.drs = src.drs;
        }
        if mask.contains(StateMask::MSRS) {
            self.msrs = src.msrs;
        }
        if mask.contains(StateMask::INTR) {
            self.intr = src.intr;
        }
        if mask.contains(StateMask::FPU) {
            self.fpu = src.fpu;
        }
    }

    /// Power-on state of a 16-bit real-mode vcpu executing at `cs:ip`.
    pub fn real_mode(cs: u16, ip: u16) -> Self {
        let mut state = State::default();
        let data = RWRX_SEGMENT_TYPE | ACCESSED_SEGMENT_TYPE;
        for seg in [SEG_ES, SEG_SS, SEG_DS, SEG_FS, SEG_GS] {
            state.segs[seg] = SegmentState::real_mode(0, data);
        }
        state.segs[SEG_CS] = SegmentState::real_mode(cs, CODE_SEGMENT_TYPE | data);
        state.segs[SEG_GDT].limit = 0xffff;
        state.segs[SEG_IDT].limit = 0xffff;
        state.segs[SEG_LDT] = SegmentState {
            attrib: SegmentState::make_attrib(0x2, 0, 0, 1, 0, 0, 0, 0, 0),
            limit: 0xffff,
            ..Default::default()
        };
        state.segs[SEG_TR] = SegmentState {
            attrib: SegmentState::make_attrib(0xb, 0, 0, 1, 0, 0, 0, 0, 0),
            limit: 0xffff,
            ..Default::default()
        };
        state.gprs[GPR_RIP] = u64::from(ip);
        state.gprs[GPR_RFLAGS] = RFLAGS_RESERVED_1;
        state.crs[CR_CR0] = CR0_ET | CR0_NE;
        state.drs[DR_DR6] = 0xffff_0ff0;
        state.drs[DR_DR7] = 0x400;
        state.fpu.fcw = 0x37f;
        state.fpu.mxcsr = 0x1f80;
        state
    }
}

/// First backend configuration op of x86 backends: override CPUID bits.
pub const CONF_CPUID: usize = 0;

/// Payload of [`CONF_CPUID`].
///
/// Bits in `set` are forced on and bits in `del` forced off, per register
/// (eax, ebx, ecx, edx), for the given leaf. The two masks must not overlap.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct CpuidConf {
    pub leaf: u32,
    pub index: u32,
    pub set: [u32; 4],
    pub del: [u32; 4],
}

impl CpuidConf {
    pub fn is_consistent(&self) -> bool {
        self.set.iter().zip(self.del.iter()).all(|(s, d)| s & d == 0)
    }

    /// Applies the override to the four registers of one leaf.
    pub fn apply(&self, regs: &mut [u32; 4]) {
        for (i, reg) in regs.iter_mut().enumerate() {
            *reg = (*reg & !self.del[i]) | self.set[i];
        }
    }
}
