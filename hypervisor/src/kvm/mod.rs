// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//
// Copyright 2018-2019 CrowdStrike, Inc.
//
//

use std::path::Path;
use std::ptr;
use std::sync::atomic::AtomicU8;
use std::sync::{Arc, RwLock};

use kvm_bindings::{
    kvm_userspace_memory_region, kvm_vcpu_events, KVM_API_VERSION, KVM_MAX_CPUID_ENTRIES,
    KVM_MEM_READONLY, KVM_VCPUEVENT_VALID_NMI_PENDING,
};
use kvm_ioctls::{Kvm, VcpuExit, VcpuFd, VmFd};
use vmm_sys_util::errno;
use zerocopy::FromBytes;

use crate::arch::x86::{CpuidConf, State, CONF_CPUID, RFLAGS_IF, STATE_SIZE};
use crate::cpu::{self, EntryExitFlag, Event, EventKind, RunContext, StateMask, VmExit};
use crate::hypervisor::{self, BackendCapability, MachineDescriptor};
use crate::vm::{self, MemoryProtection, UserMemoryRegion};

pub mod x86_64;

use x86_64::*;

const KVM_DEVICE: &str = "/dev/kvm";

/// CPUID overrides one machine can hold.
pub const CPUID_MAX_OPS: usize = 16;

const CONF_SIZES: [usize; 1] = [std::mem::size_of::<CpuidConf>()];

/// KVM implementation of the backend interface.
pub struct KvmBackend {
    kvm: RwLock<Option<Arc<Kvm>>>,
}

impl KvmBackend {
    pub fn new() -> Self {
        KvmBackend {
            kvm: RwLock::new(None),
        }
    }

    fn kvm(&self) -> hypervisor::Result<Arc<Kvm>> {
        self.kvm
            .read()
            .unwrap()
            .clone()
            .ok_or(hypervisor::HypervisorError::NotInitialized)
    }

    fn open() -> hypervisor::Result<Kvm> {
        let kvm = Kvm::new().map_err(|e| hypervisor::HypervisorError::HypervisorOpen(e.into()))?;
        if kvm.get_api_version() != KVM_API_VERSION as i32 {
            return Err(hypervisor::HypervisorError::IncompatibleApiVersion);
        }
        Ok(kvm)
    }

    // XCR0 bits the host lets guests enable, from CPUID leaf 0xd.
    fn xcr0_mask(kvm: &Kvm) -> u64 {
        match kvm.get_supported_cpuid(KVM_MAX_CPUID_ENTRIES) {
            Ok(cpuid) => cpuid
                .as_slice()
                .iter()
                .find(|e| e.function == 0xd && e.index == 0)
                .map(|e| u64::from(e.eax) | (u64::from(e.edx) << 32))
                .unwrap_or(0),
            Err(e) => {
                warn!("Failed to query supported CPUID: {}", e);
                0
            }
        }
    }
}

impl Default for KvmBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl hypervisor::Backend for KvmBackend {
    fn name(&self) -> &'static str {
        "kvm"
    }

    fn probe(&self) -> bool {
        Path::new(KVM_DEVICE).exists() && Self::open().is_ok()
    }

    fn init(&self) -> hypervisor::Result<()> {
        let kvm = Self::open()?;
        *self.kvm.write().unwrap() = Some(Arc::new(kvm));
        Ok(())
    }

    fn fini(&self) {
        self.kvm.write().unwrap().take();
    }

    fn capability(&self) -> BackendCapability {
        let kvm = self.kvm().ok();
        BackendCapability {
            name: self.name().to_string(),
            version: kvm
                .as_ref()
                .map(|k| k.get_api_version() as u32)
                .unwrap_or(0),
            xcr0_mask: kvm.as_ref().map(|k| Self::xcr0_mask(k)).unwrap_or(0),
            mxcsr_mask: 0xffff,
            cpuid_max_ops: CPUID_MAX_OPS as u32,
        }
    }

    fn state_size(&self) -> usize {
        STATE_SIZE
    }

    fn conf_sizes(&self) -> &[usize] {
        &CONF_SIZES
    }

    fn machine_create(&self, desc: &MachineDescriptor) -> hypervisor::Result<Box<dyn vm::Vm>> {
        let kvm = self.kvm()?;
        let fd: VmFd;
        loop {
            match kvm.create_vm() {
                Ok(res) => fd = res,
                Err(e) => {
                    if e.errno() == libc::EINTR {
                        // If the error returned is EINTR, which means the
                        // ioctl has been interrupted, we have to retry as
                        // this can't be considered as a regular error.
                        continue;
                    } else {
                        return Err(hypervisor::HypervisorError::VmCreate(e.into()));
                    }
                }
            }
            break;
        }

        fd.set_tss_address(KVM_TSS_ADDRESS as usize)
            .map_err(|e| hypervisor::HypervisorError::VmSetup(e.into()))?;

        let supported_cpuid = kvm
            .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
            .map_err(|e| hypervisor::HypervisorError::GetCpuId(e.into()))?;

        debug!("KVM machine {} created", desc.machid);
        Ok(Box::new(KvmVm {
            fd,
            machid: desc.machid,
            supported_cpuid,
            cpuid_ops: Vec::new(),
        }))
    }
}

/// Wrapper over KVM VM ioctls.
pub struct KvmVm {
    fd: VmFd,
    machid: u32,
    supported_cpuid: CpuId,
    cpuid_ops: Vec<CpuidConf>,
}

impl KvmVm {
    fn configure_cpuid(&mut self, data: &[u8]) -> vm::Result<()> {
        let conf = CpuidConf::read_from_bytes(data)
            .map_err(|_| vm::HypervisorVmError::Configure(anyhow!("Bad CPUID payload")))?;
        if !conf.is_consistent() {
            return Err(vm::HypervisorVmError::Configure(anyhow!(
                "CPUID leaf {:#x}: set and del masks overlap",
                conf.leaf
            )));
        }

        if let Some(existing) = self
            .cpuid_ops
            .iter_mut()
            .find(|c| c.leaf == conf.leaf && c.index == conf.index)
        {
            *existing = conf;
            return Ok(());
        }
        if self.cpuid_ops.len() == CPUID_MAX_OPS {
            return Err(vm::HypervisorVmError::NoSpace);
        }
        self.cpuid_ops.push(conf);
        Ok(())
    }

    fn guest_cpuid(&self, id: u32) -> CpuId {
        let mut cpuid = self.supported_cpuid.clone();
        for entry in cpuid.as_mut_slice() {
            if entry.function == 1 {
                // Initial APIC id.
                entry.ebx = (entry.ebx & 0x00ff_ffff) | (id << 24);
            }
            for conf in self
                .cpuid_ops
                .iter()
                .filter(|c| c.leaf == entry.function && c.index == entry.index)
            {
                let mut regs = [entry.eax, entry.ebx, entry.ecx, entry.edx];
                conf.apply(&mut regs);
                [entry.eax, entry.ebx, entry.ecx, entry.edx] = regs;
            }
        }
        cpuid
    }
}

impl vm::Vm for KvmVm {
    fn configure(&mut self, op: usize, data: &[u8]) -> vm::Result<()> {
        match op {
            CONF_CPUID => self.configure_cpuid(data),
            _ => Err(vm::HypervisorVmError::UnsupportedConfig(op)),
        }
    }

    fn map_memory(&mut self, region: &UserMemoryRegion) -> vm::Result<()> {
        let mem_region = kvm_userspace_memory_region {
            slot: region.slot,
            guest_phys_addr: region.gpa,
            memory_size: region.size,
            userspace_addr: region.hva,
            flags: if region.prot.contains(MemoryProtection::WRITE) {
                0
            } else {
                KVM_MEM_READONLY
            },
        };
        // SAFETY: the caller keeps the host range alive for as long as the
        // machine exists, and guest regions never overlap.
        unsafe {
            self.fd
                .set_user_memory_region(mem_region)
                .map_err(|e| vm::HypervisorVmError::SetUserMemory(e.into()))
        }
    }

    fn create_vcpu(&mut self, id: u32) -> vm::Result<Box<dyn cpu::Vcpu>> {
        let fd = self
            .fd
            .create_vcpu(u64::from(id))
            .map_err(|e| vm::HypervisorVmError::CreateVcpu(e.into()))?;
        fd.set_cpuid2(&self.guest_cpuid(id))
            .map_err(|e| vm::HypervisorVmError::CreateVcpu(e.into()))?;
        Ok(Box::new(KvmVcpu {
            fd,
            pending: PendingEvents::default(),
        }))
    }

    fn destroy(self: Box<Self>) {
        debug!("KVM machine {} destroyed", self.machid);
    }
}

#[derive(Default)]
struct PendingEvents {
    interrupt: Option<u8>,
    nmi: bool,
    exception: Option<Event>,
}

/// Vcpu struct for KVM
pub struct KvmVcpu {
    fd: VcpuFd,
    pending: PendingEvents,
}

impl KvmVcpu {
    fn load_state(&mut self, state: &State, mask: StateMask) -> cpu::Result<()> {
        let set_err = |e: errno::Error| cpu::HypervisorCpuError::SetState(e.into());

        let segs = mask.contains(StateMask::SEGS);
        let crs = mask.contains(StateMask::CRS);
        let msrs = mask.contains(StateMask::MSRS);
        if segs || crs || msrs {
            let mut sregs = self.fd.get_sregs().map_err(set_err)?;
            sregs_from_state(&mut sregs, state, segs, crs, msrs);
            self.fd.set_sregs(&sregs).map_err(set_err)?;
        }
        if mask.contains(StateMask::GPRS) {
            self.fd.set_regs(&regs_from_state(state)).map_err(set_err)?;
        }
        if mask.contains(StateMask::DRS) {
            let current = self.fd.get_debug_regs().map_err(set_err)?;
            self.fd
                .set_debug_regs(&debugregs_from_state(&current, state))
                .map_err(set_err)?;
        }
        if msrs {
            let entries = msr_entries_from_state(state);
            let msrs = MsrEntries::from_entries(&entries)
                .map_err(|e| cpu::HypervisorCpuError::SetState(anyhow!("{:?}", e)))?;
            let written = self.fd.set_msrs(&msrs).map_err(set_err)?;
            if written != entries.len() {
                return Err(cpu::HypervisorCpuError::SetState(anyhow!(
                    "Only {} of {} MSRs written",
                    written,
                    entries.len()
                )));
            }
        }
        if mask.contains(StateMask::INTR) {
            let mut events = self.fd.get_vcpu_events().map_err(set_err)?;
            intr_from_state(&mut events, state);
            self.fd.set_vcpu_events(&events).map_err(set_err)?;
            self.request_interrupt_window(state.intr.int_window_exiting != 0);
        }
        if mask.contains(StateMask::FPU) {
            self.fd.set_fpu(&fpu_from_state(state)).map_err(set_err)?;
        }
        Ok(())
    }

    fn store_state(&mut self, state: &mut State, mask: StateMask) -> cpu::Result<()> {
        let get_err = |e: errno::Error| cpu::HypervisorCpuError::GetState(e.into());

        let segs = mask.contains(StateMask::SEGS);
        let crs = mask.contains(StateMask::CRS);
        let msrs = mask.contains(StateMask::MSRS);
        if segs || crs || msrs {
            let sregs = self.fd.get_sregs().map_err(get_err)?;
            sregs_to_state(&sregs, state, segs, crs, msrs);
        }
        if mask.contains(StateMask::GPRS) {
            regs_to_state(&self.fd.get_regs().map_err(get_err)?, state);
        }
        if mask.contains(StateMask::DRS) {
            debugregs_to_state(&self.fd.get_debug_regs().map_err(get_err)?, state);
        }
        if msrs {
            let entries = msr_entries_from_state(state);
            let mut msrs = MsrEntries::from_entries(&entries)
                .map_err(|e| cpu::HypervisorCpuError::GetState(anyhow!("{:?}", e)))?;
            let read = self.fd.get_msrs(&mut msrs).map_err(get_err)?;
            if read != entries.len() {
                return Err(cpu::HypervisorCpuError::GetState(anyhow!(
                    "Only {} of {} MSRs read",
                    read,
                    entries.len()
                )));
            }
            msr_entries_to_state(msrs.as_slice(), state);
        }
        if mask.contains(StateMask::INTR) {
            intr_to_state(&self.fd.get_vcpu_events().map_err(get_err)?, state);
            state.intr.int_window_exiting =
                u64::from(self.fd.get_kvm_run().request_interrupt_window != 0);
        }
        if mask.contains(StateMask::FPU) {
            fpu_to_state(&self.fd.get_fpu().map_err(get_err)?, state);
        }
        Ok(())
    }

    fn enter(&mut self) -> cpu::Result<VmExit> {
        match self.fd.run() {
            Ok(run) => match run {
                VcpuExit::IoIn(port, data) => {
                    // Reads are completed with all ones, as from an empty
                    // bus; the caller only learns which port was read.
                    data.fill(0xff);
                    Ok(VmExit::Io {
                        port,
                        write: false,
                        size: data.len() as u8,
                        data: data.to_vec(),
                    })
                }
                VcpuExit::IoOut(port, data) => Ok(VmExit::Io {
                    port,
                    write: true,
                    size: data.len() as u8,
                    data: data.to_vec(),
                }),
                VcpuExit::MmioRead(gpa, data) => {
                    data.fill(0xff);
                    Ok(VmExit::Mmio {
                        gpa,
                        write: false,
                        size: data.len() as u8,
                        data: data.to_vec(),
                    })
                }
                VcpuExit::MmioWrite(gpa, data) => Ok(VmExit::Mmio {
                    gpa,
                    write: true,
                    size: data.len() as u8,
                    data: data.to_vec(),
                }),
                VcpuExit::Hlt => Ok(VmExit::Halted),
                VcpuExit::Shutdown => Ok(VmExit::Shutdown),
                VcpuExit::IrqWindowOpen => Ok(VmExit::InterruptWindow),
                VcpuExit::Intr => Ok(VmExit::Interrupted),
                VcpuExit::FailEntry(reason, cpu) => {
                    warn!(
                        "KVM entry failed on host cpu {}: reason {:#x}",
                        cpu, reason
                    );
                    Ok(VmExit::Invalid)
                }
                VcpuExit::InternalError => Ok(VmExit::Invalid),
                VcpuExit::Unsupported(code) => Ok(VmExit::Unknown(u64::from(code))),
                r => Err(cpu::HypervisorCpuError::RunVcpu(anyhow!(
                    "Unexpected exit reason on vcpu run: {:?}",
                    r
                ))),
            },

            Err(ref e) => match e.errno() {
                libc::EAGAIN | libc::EINTR => Ok(VmExit::Interrupted),
                _ => Err(cpu::HypervisorCpuError::RunVcpu(anyhow!(
                    "VCPU error {:?}",
                    e
                ))),
            },
        }
    }

    /// KVM exits with `IrqWindowOpen` once the guest can take an interrupt.
    fn request_interrupt_window(&mut self, enable: bool) {
        self.fd.get_kvm_run().request_interrupt_window = u8::from(enable);
    }

    // IF set, no STI/MOV SS shadow and no interrupt already in flight.
    fn interruptible(&self, events: &kvm_vcpu_events) -> cpu::Result<bool> {
        let regs = self
            .fd
            .get_regs()
            .map_err(|e| cpu::HypervisorCpuError::Inject(e.into()))?;
        Ok(regs.rflags & RFLAGS_IF != 0
            && events.interrupt.shadow == 0
            && events.interrupt.injected == 0)
    }

    // Hands every queued event to KVM for the coming entry. An interrupt the
    // guest cannot take yet stays queued behind an interrupt window.
    fn deliver_pending(&mut self) -> cpu::Result<()> {
        if self.pending.interrupt.is_none()
            && !self.pending.nmi
            && self.pending.exception.is_none()
        {
            return Ok(());
        }

        let mut events = self
            .fd
            .get_vcpu_events()
            .map_err(|e| cpu::HypervisorCpuError::Inject(e.into()))?;
        let queued = self.pending.interrupt;
        let interrupt = match queued {
            Some(vector) if self.interruptible(&events)? => {
                self.pending.interrupt = None;
                Some(vector)
            }
            Some(_) => {
                self.request_interrupt_window(true);
                None
            }
            None => None,
        };
        if let Some(exception) = self.pending.exception.take() {
            events.exception.injected = 1;
            events.exception.nr = exception.vector;
            events.exception.has_error_code = exception.error_code.is_some() as u8;
            events.exception.error_code = exception.error_code.unwrap_or(0);
        }
        if let Some(vector) = interrupt {
            events.interrupt.injected = 1;
            events.interrupt.nr = vector;
            events.interrupt.soft = 0;
        }
        if std::mem::take(&mut self.pending.nmi) {
            events.nmi.pending = 1;
            events.flags |= KVM_VCPUEVENT_VALID_NMI_PENDING;
        }
        self.fd
            .set_vcpu_events(&events)
            .map_err(|e| cpu::HypervisorCpuError::Inject(e.into()))
    }
}

impl cpu::Vcpu for KvmVcpu {
    fn set_state(&mut self, buf: &[u8], mask: StateMask) -> cpu::Result<()> {
        let state = State::from_buffer(buf)?;
        self.load_state(&state, mask)
    }

    fn get_state(&mut self, buf: &mut [u8], mask: StateMask) -> cpu::Result<()> {
        let mut state = State::from_buffer(buf)?;
        self.store_state(&mut state, mask)?;
        state.to_buffer(buf)
    }

    fn inject(&mut self, event: &Event) -> cpu::Result<()> {
        event.validate()?;
        match event.kind {
            EventKind::Interrupt => {
                if self.pending.interrupt.is_some() {
                    return Err(cpu::HypervisorCpuError::EventPending);
                }
                let events = self
                    .fd
                    .get_vcpu_events()
                    .map_err(|e| cpu::HypervisorCpuError::Inject(e.into()))?;
                if !self.interruptible(&events)? {
                    self.request_interrupt_window(true);
                    return Err(cpu::HypervisorCpuError::NotInterruptible);
                }
                self.pending.interrupt = Some(event.vector);
            }
            EventKind::Nmi => {
                if self.pending.nmi {
                    return Err(cpu::HypervisorCpuError::EventPending);
                }
                self.pending.nmi = true;
            }
            EventKind::Exception => {
                if self.pending.exception.is_some() {
                    return Err(cpu::HypervisorCpuError::EventPending);
                }
                self.pending.exception = Some(*event);
            }
        }
        Ok(())
    }

    fn run(&mut self, _vm: &dyn vm::Vm, ctx: &mut RunContext) -> cpu::Result<VmExit> {
        self.fd.set_kvm_immediate_exit(0);
        let immediate_exit =
            ptr::addr_of_mut!(self.fd.get_kvm_run().immediate_exit).cast::<AtomicU8>();
        // SAFETY: kvm_run stays mapped as long as the vcpu fd, which outlives
        // the guard.
        let _armed = unsafe { EntryExitFlag::arm(immediate_exit) };

        if ctx.should_stop() {
            return Ok(VmExit::Interrupted);
        }
        self.deliver_pending()?;

        let exit = self.enter();
        self.fd.set_kvm_immediate_exit(0);
        if matches!(exit, Ok(VmExit::InterruptWindow)) {
            self.request_interrupt_window(false);
        }
        exit
    }

    fn destroy(self: Box<Self>) {}
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;
    use crate::arch::x86::{
        SegmentState, ACCESSED_SEGMENT_TYPE, CR_CR2, CR_CR3, DR_DR0, DR_DR3, GPR_RAX,
        GPR_RFLAGS, GPR_RIP, MSR_LSTAR, MSR_STAR, MSR_SYSENTER_CS, MSR_TSC, RWRX_SEGMENT_TYPE,
        SEG_DS,
    };
    use crate::cpu::{GuestMapping, GuestMemoryMap, MemoryFault, Vcpu as _};
    use crate::hypervisor::Backend;
    use crate::vm::Vm as _;

    struct NoMemory;

    impl GuestMemoryMap for NoMemory {
        fn translate(&self, gpa: u64) -> std::result::Result<GuestMapping, MemoryFault> {
            Err(MemoryFault::NotMapped(gpa))
        }
        fn read(&self, gpa: u64, _: &mut [u8]) -> std::result::Result<(), MemoryFault> {
            Err(MemoryFault::NotMapped(gpa))
        }
        fn write(&self, gpa: u64, _: &[u8]) -> std::result::Result<(), MemoryFault> {
            Err(MemoryFault::NotMapped(gpa))
        }
    }

    fn descriptor(machid: u32) -> MachineDescriptor {
        MachineDescriptor {
            machid,
            gpa_begin: 0,
            gpa_end: 1 << 20,
        }
    }

    fn backend() -> Option<KvmBackend> {
        let backend = KvmBackend::new();
        if !backend.probe() {
            return None;
        }
        backend.init().unwrap();
        Some(backend)
    }

    #[test]
    fn test_uninitialized_backend() {
        let backend = KvmBackend::new();
        let desc = MachineDescriptor {
            machid: 0,
            gpa_begin: 0,
            gpa_end: 1 << 20,
        };
        assert!(matches!(
            backend.machine_create(&desc),
            Err(hypervisor::HypervisorError::NotInitialized)
        ));
        assert_eq!(backend.capability().version, 0);
        assert_eq!(backend.conf_sizes(), &[40]);
    }

    #[test]
    fn test_state_round_trip() {
        let Some(backend) = backend() else {
            return;
        };
        let mut vm = backend.machine_create(&descriptor(0)).unwrap();
        let mut vcpu = vm.create_vcpu(0).unwrap();

        // Start from the reset state KVM reports so every group holds values
        // it accepts back.
        let mut buf = vec![0u8; STATE_SIZE];
        vcpu.get_state(&mut buf, StateMask::ALL).unwrap();
        let mut state = State::from_buffer(&buf).unwrap();

        state.segs[SEG_DS] =
            SegmentState::real_mode(0x40, RWRX_SEGMENT_TYPE | ACCESSED_SEGMENT_TYPE);
        state.gprs[GPR_RAX] = 0x1234;
        state.gprs[GPR_RIP] = 0x1000;
        state.crs[CR_CR2] = 0xdead_b000;
        state.crs[CR_CR3] = 0x5000;
        state.drs[DR_DR0..=DR_DR3].copy_from_slice(&[0x1000, 0x2000, 0x3000, 0x4000]);
        state.msrs[MSR_STAR] = 0x0023_0010_0000_0000;
        state.msrs[MSR_LSTAR] = 0xffff_8000_0000_1000;
        state.msrs[MSR_SYSENTER_CS] = 0x10;
        state.intr.nmi_masked = 1;
        state.intr.int_window_exiting = 1;
        state.fpu.fcw = 0x27f;
        state.fpu.mxcsr = 0x1f80;
        state.fpu.xmm[3] = [0xa5; 16];
        state.to_buffer(&mut buf).unwrap();
        vcpu.set_state(&buf, StateMask::ALL).unwrap();

        let mut out = vec![0u8; STATE_SIZE];
        vcpu.get_state(&mut out, StateMask::ALL).unwrap();
        let mut back = State::from_buffer(&out).unwrap();
        assert_eq!(back.segs[SEG_DS], state.segs[SEG_DS]);
        assert_eq!(back.gprs, state.gprs);
        assert_eq!(back.crs, state.crs);
        assert_eq!(back.drs, state.drs);
        assert_eq!(back.intr, state.intr);
        assert_eq!(back.fpu, state.fpu);
        // The TSC keeps counting between the two calls.
        assert!(back.msrs[MSR_TSC] >= state.msrs[MSR_TSC]);
        back.msrs[MSR_TSC] = state.msrs[MSR_TSC];
        assert_eq!(back.msrs, state.msrs);

        vcpu.inject(&Event::nmi()).unwrap();
        assert!(matches!(
            vcpu.inject(&Event::nmi()),
            Err(cpu::HypervisorCpuError::EventPending)
        ));

        let stop = AtomicBool::new(true);
        let mut ctx = RunContext::new(0, true, &NoMemory, &stop);
        assert_eq!(
            vcpu.run(vm.as_ref(), &mut ctx).unwrap(),
            VmExit::Interrupted
        );

        vcpu.destroy();
        vm.destroy();
        backend.fini();
    }

    #[test]
    fn test_interrupt_window() {
        let Some(backend) = backend() else {
            return;
        };
        let mut vm = backend.machine_create(&descriptor(2)).unwrap();

        let size = 0x1000;
        // SAFETY: fresh anonymous mapping, checked right below.
        let hva = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(hva, libc::MAP_FAILED);
        // SAFETY: the mapping is `size` bytes long and writable.
        unsafe { std::slice::from_raw_parts_mut(hva.cast::<u8>(), size).fill(0xf4) };
        vm.map_memory(&UserMemoryRegion {
            slot: 0,
            gpa: 0x1000,
            size: size as u64,
            hva: hva as u64,
            prot: MemoryProtection::ALL,
        })
        .unwrap();

        // Real mode with IF clear, parked on a page of HLT.
        let mut vcpu = vm.create_vcpu(0).unwrap();
        let mut buf = vec![0u8; STATE_SIZE];
        State::real_mode(0, 0x1000).to_buffer(&mut buf).unwrap();
        let mask = StateMask::SEGS | StateMask::GPRS | StateMask::CRS | StateMask::INTR;
        vcpu.set_state(&buf, mask).unwrap();

        assert!(matches!(
            vcpu.inject(&Event::interrupt(0x20)),
            Err(cpu::HypervisorCpuError::NotInterruptible)
        ));
        vcpu.get_state(&mut buf, StateMask::INTR).unwrap();
        let intr = State::from_buffer(&buf).unwrap().intr;
        assert_eq!(intr.int_window_exiting, 1);

        let stop = AtomicBool::new(false);
        let mut ctx = RunContext::new(0, true, &NoMemory, &stop);
        assert_eq!(vcpu.run(vm.as_ref(), &mut ctx).unwrap(), VmExit::Halted);

        vcpu.get_state(&mut buf, StateMask::GPRS).unwrap();
        let mut state = State::from_buffer(&buf).unwrap();
        state.gprs[GPR_RFLAGS] |= RFLAGS_IF;
        state.to_buffer(&mut buf).unwrap();
        vcpu.set_state(&buf, StateMask::GPRS).unwrap();

        assert_eq!(
            vcpu.run(vm.as_ref(), &mut ctx).unwrap(),
            VmExit::InterruptWindow
        );
        vcpu.get_state(&mut buf, StateMask::INTR).unwrap();
        let intr = State::from_buffer(&buf).unwrap().intr;
        assert_eq!(intr.int_window_exiting, 0);
        vcpu.inject(&Event::interrupt(0x20)).unwrap();

        vcpu.destroy();
        vm.destroy();
        // SAFETY: the machine that mapped the range is gone.
        unsafe { libc::munmap(hva, size) };
    }

    #[test]
    fn test_cpuid_conf_limits() {
        let Some(backend) = backend() else {
            return;
        };
        let mut vm = backend.machine_create(&descriptor(1)).unwrap();
        let bad = CpuidConf {
            leaf: 1,
            set: [1, 0, 0, 0],
            del: [1, 0, 0, 0],
            ..Default::default()
        };
        assert!(vm.configure(CONF_CPUID, zerocopy::IntoBytes::as_bytes(&bad)).is_err());

        for leaf in 0..CPUID_MAX_OPS as u32 {
            let conf = CpuidConf {
                leaf: 0x4000_0000 + leaf,
                ..Default::default()
            };
            vm.configure(CONF_CPUID, zerocopy::IntoBytes::as_bytes(&conf))
                .unwrap();
        }
        let one_more = CpuidConf {
            leaf: 0x8000_0000,
            ..Default::default()
        };
        assert!(matches!(
            vm.configure(CONF_CPUID, zerocopy::IntoBytes::as_bytes(&one_more)),
            Err(vm::HypervisorVmError::NoSpace)
        ));
        assert!(matches!(
            vm.configure(1, &[]),
            Err(vm::HypervisorVmError::UnsupportedConfig(1))
        ));
        vm.destroy();
    }
}
