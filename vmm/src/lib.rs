// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Machine-independent core of the virtualization monitor.
//!
//! [`Monitor`] owns the machine table and the active backend. Every host
//! request is a method on it: lookups and validation happen here, the
//! tables in [`machine`], [`memory`] and [`cpu`] hold the state, and the
//! backend only ever sees already-validated requests.

#[macro_use]
extern crate log;

use std::result;
use std::sync::{Arc, Once};

use hypervisor::{
    Backend, BackendCapability, Event, HypervisorCpuError, HypervisorError, HypervisorVmError,
    MachineDescriptor, StateMask, VmExit,
};
use serde::Serialize;
use thiserror::Error;
use vm_memory::MmapRegion;
use vmm_sys_util::signal::{register_signal_handler, SIGRTMIN};
use zerocopy::FromBytes;

pub mod config;
pub mod cpu;
pub mod machine;
pub mod memory;
pub mod registry;

pub use crate::cpu::VcpuInfo;
pub use crate::machine::MachineInfo;
pub use crate::memory::{SegmentConf, SegmentInfo};
pub use crate::registry::BackendRegistry;

use crate::machine::{Machine, MachineTable};

/// Compile-time limits of the monitor.
pub mod limits {
    /// Live machines per monitor.
    pub const MAX_MACHINES: usize = 128;
    /// Vcpus per machine; valid cpuids are `0..MAX_VCPUS`.
    pub const MAX_VCPUS: usize = 256;
    /// Memory segments per machine.
    pub const MAX_SEGMENTS: usize = 32;
    /// Registered host mappings per machine.
    pub const MAX_HMAPPINGS: usize = 32;
    /// Guest RAM per machine, summed over its segments.
    pub const MAX_RAM: u64 = 128 << 30;
    pub const PAGE_SIZE: u64 = 4096;
    pub const MONITOR_VERSION: u32 = 1;
}

/// Core configuration op: add a memory segment, payload [`SegmentConf`].
pub const CONF_ADD_SEGMENT: u64 = 0;
/// First backend configuration op. Op `CONF_MD_BEGIN + i` carries
/// `Backend::conf_sizes()[i]` bytes.
pub const CONF_MD_BEGIN: u64 = 100;

const CORE_CONF_SIZES: [usize; 1] = [std::mem::size_of::<SegmentConf>()];

/// Errors returned by the monitor.
#[derive(Debug, Error)]
pub enum Error {
    #[error("No hypervisor backend is usable on this host")]
    Unsupported,

    #[error("No free machine slot")]
    NoFreeMachine,

    #[error("No free segment slot")]
    NoFreeSegment,

    #[error("No free host mapping slot")]
    NoFreeHostMapping,

    #[error("Guest RAM limit exceeded: {mapped:#x} mapped, {requested:#x} requested")]
    RamLimitExceeded { mapped: u64, requested: u64 },

    #[error("Machine {0} not found")]
    MachineNotFound(u32),

    #[error("Vcpu {0} not found")]
    VcpuNotFound(u32),

    #[error("Vcpu {0} already in use")]
    VcpuExists(u32),

    #[error("Host range {0:#x} is not covered by a host mapping")]
    HvaNotMapped(u64),

    #[error("No host mapping at {0:#x}")]
    HostMappingNotFound(u64),

    #[error("Host mapping at {0:#x} overlaps an existing one")]
    HostMappingOverlap(u64),

    #[error("Invalid configuration op {0}")]
    InvalidConfigOp(u64),

    #[error("Configuration payload for op {op} is {actual} bytes, expected {expected}")]
    ConfigSizeMismatch {
        op: u64,
        expected: usize,
        actual: usize,
    },

    #[error("Segment {gpa:#x}+{size:#x} overlaps an existing segment")]
    SegmentOverlap { gpa: u64, size: u64 },

    #[error("Segment {gpa:#x}+{size:#x} is outside the machine window")]
    SegmentOutOfWindow { gpa: u64, size: u64 },

    #[error("Invalid segment {gpa:#x}+{size:#x}")]
    InvalidSegment { gpa: u64, size: u64 },

    #[error("Invalid cpuid {0}")]
    InvalidCpuid(u32),

    #[error("Invalid guest window [{0:#x}, {1:#x})")]
    InvalidWindow(u64, u64),

    #[error("State buffer is {actual} bytes, expected {expected}")]
    StateSizeMismatch { expected: usize, actual: usize },

    #[error("Machine {0} still in use")]
    MachineBusy(u32),

    #[error("Hypervisor error: {0}")]
    Hypervisor(#[source] HypervisorError),

    #[error("Hypervisor VM error: {0}")]
    Vm(#[source] HypervisorVmError),

    #[error("Hypervisor vcpu error: {0}")]
    Cpu(#[source] HypervisorCpuError),
}

pub type Result<T> = result::Result<T, Error>;

/// Coarse classification of [`Error`], what a control plane maps to its
/// status codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    ResourceExhausted,
    InvalidReference,
    InvalidArgument,
    Conflict,
    Backend,
    Unsupported,
}

impl ErrorKind {
    /// The same request may succeed later without changing its arguments.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::ResourceExhausted | ErrorKind::Conflict)
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NoFreeMachine
            | Error::NoFreeSegment
            | Error::NoFreeHostMapping
            | Error::RamLimitExceeded { .. } => ErrorKind::ResourceExhausted,
            Error::MachineNotFound(_)
            | Error::VcpuNotFound(_)
            | Error::VcpuExists(_)
            | Error::HvaNotMapped(_)
            | Error::HostMappingNotFound(_) => ErrorKind::InvalidReference,
            Error::InvalidConfigOp(_)
            | Error::ConfigSizeMismatch { .. }
            | Error::SegmentOverlap { .. }
            | Error::SegmentOutOfWindow { .. }
            | Error::InvalidSegment { .. }
            | Error::InvalidCpuid(_)
            | Error::InvalidWindow(..)
            | Error::StateSizeMismatch { .. }
            | Error::HostMappingOverlap(_) => ErrorKind::InvalidArgument,
            Error::MachineBusy(_) => ErrorKind::Conflict,
            Error::Hypervisor(_) | Error::Vm(_) | Error::Cpu(_) => ErrorKind::Backend,
            Error::Unsupported => ErrorKind::Unsupported,
        }
    }
}

/// Limits and backend data reported by [`Monitor::capability`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Capability {
    pub version: u32,
    pub state_size: usize,
    pub max_machines: usize,
    pub max_vcpus: usize,
    pub max_segments: usize,
    pub max_ram: u64,
    /// Payload sizes of the backend configuration ops, from `CONF_MD_BEGIN`.
    pub conf_sizes: Vec<usize>,
    pub backend: BackendCapability,
}

/// Parameters of [`Monitor::machine_create`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MachineConfig {
    /// Process id the machine is accounted to.
    pub owner: u32,
    pub gpa_begin: u64,
    pub gpa_end: u64,
}

impl MachineConfig {
    /// A machine owned by the calling process.
    pub fn new(gpa_begin: u64, gpa_end: u64) -> Self {
        MachineConfig {
            owner: std::process::id(),
            gpa_begin,
            gpa_end,
        }
    }
}

static KICK_HANDLER: Once = Once::new();

// The handler only needs to exist: its delivery makes KVM_RUN and other
// blocking calls in the target thread return EINTR.
fn install_kick_handler() {
    KICK_HANDLER.call_once(|| {
        extern "C" fn handle_signal(_: i32, _: *mut libc::siginfo_t, _: *mut libc::c_void) {
            hypervisor::kick_current_thread();
        }
        if let Err(e) = register_signal_handler(SIGRTMIN(), handle_signal) {
            warn!("Failed to register vcpu kick signal handler: {}", e);
        }
    });
}

/// The monitor: one backend, a table of machines.
pub struct Monitor {
    backend: Arc<dyn Backend>,
    machines: MachineTable,
}

impl Monitor {
    /// Selects a backend among those compiled into this build.
    pub fn new() -> Result<Self> {
        Self::with_registry(&BackendRegistry::new())
    }

    pub fn with_registry(registry: &BackendRegistry) -> Result<Self> {
        let backend = registry.select()?;
        install_kick_handler();
        info!(
            "Monitor v{} using the {} backend",
            limits::MONITOR_VERSION,
            backend.name()
        );
        Ok(Monitor {
            backend,
            machines: MachineTable::new(limits::MAX_MACHINES),
        })
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn capability(&self) -> Capability {
        Capability {
            version: limits::MONITOR_VERSION,
            state_size: self.backend.state_size(),
            max_machines: limits::MAX_MACHINES,
            max_vcpus: limits::MAX_VCPUS,
            max_segments: limits::MAX_SEGMENTS,
            max_ram: limits::MAX_RAM,
            conf_sizes: self.backend.conf_sizes().to_vec(),
            backend: self.backend.capability(),
        }
    }

    pub fn machine_create(&self, config: &MachineConfig) -> Result<u32> {
        let (begin, end) = (config.gpa_begin, config.gpa_end);
        if begin >= end || begin % limits::PAGE_SIZE != 0 || end % limits::PAGE_SIZE != 0 {
            return Err(Error::InvalidWindow(begin, end));
        }

        let machid = self.machines.reserve()?;
        let desc = MachineDescriptor {
            machid,
            gpa_begin: begin,
            gpa_end: end,
        };
        let vm = match self.backend.machine_create(&desc) {
            Ok(vm) => vm,
            Err(e) => {
                warn!("Backend failed to create machine {}: {}", machid, e);
                self.machines.release(machid);
                return Err(Error::Hypervisor(e));
            }
        };

        let machine = Arc::new(Machine::new(machid, config.owner, begin, end, vm));
        self.machines.publish(machid, machine);
        info!(
            "Machine {} created for process {}, window [{:#x}, {:#x})",
            machid, config.owner, begin, end
        );
        Ok(machid)
    }

    /// Core ops are handled here, backend ops are size-checked and
    /// forwarded. Nothing reaches the backend before every check passed.
    pub fn machine_configure(&self, machid: u32, op: u64, payload: &[u8]) -> Result<()> {
        let expected = self.conf_size(op)?;
        if payload.len() != expected {
            return Err(Error::ConfigSizeMismatch {
                op,
                expected,
                actual: payload.len(),
            });
        }

        let machine = self.machines.get(machid)?;
        let mut guard = machine.write()?;
        if op < CONF_MD_BEGIN {
            let conf = SegmentConf::read_from_bytes(payload).map_err(|_| {
                Error::ConfigSizeMismatch {
                    op,
                    expected,
                    actual: payload.len(),
                }
            })?;
            let slot = guard.add_segment(&conf)?;
            debug!(
                "Machine {}: segment {} at {:#x}+{:#x}",
                machid, slot, conf.gpa, conf.size
            );
            Ok(())
        } else {
            let md_op = (op - CONF_MD_BEGIN) as usize;
            guard.vm().configure(md_op, payload).map_err(|e| {
                warn!("Machine {}: backend op {} failed: {}", machid, md_op, e);
                Error::Vm(e)
            })
        }
    }

    fn conf_size(&self, op: u64) -> Result<usize> {
        let size = if op < CONF_MD_BEGIN {
            CORE_CONF_SIZES.get(op as usize)
        } else {
            self.backend
                .conf_sizes()
                .get((op - CONF_MD_BEGIN) as usize)
        };
        size.copied().ok_or(Error::InvalidConfigOp(op))
    }

    pub fn machine_destroy(&self, machid: u32) -> Result<()> {
        let machine = self.machines.get(machid)?;
        machine.destroy()?;
        self.machines.remove(machid, &machine);
        info!("Machine {} destroyed", machid);
        Ok(())
    }

    pub fn machine_info(&self, machid: u32) -> Result<MachineInfo> {
        let machine = self.machines.get(machid)?;
        let guard = machine.read()?;
        Ok(guard.info())
    }

    /// Live machines accounted to `owner`, in id order.
    pub fn machines_owned_by(&self, owner: u32) -> Vec<u32> {
        self.machines
            .live()
            .iter()
            .filter(|m| m.owner() == owner)
            .map(|m| m.id())
            .collect()
    }

    /// Tears down everything `owner` left behind: every vcpu is stopped and
    /// destroyed, then every machine. Returns the ids of the machines
    /// destroyed.
    pub fn kill_machines(&self, owner: u32) -> Vec<u32> {
        let mut killed = Vec::new();
        for machine in self.machines.live() {
            if machine.owner() != owner {
                continue;
            }
            let machid = machine.id();
            warn!("Killing machine {} of process {}", machid, owner);
            machine.kick_all();
            match machine.teardown() {
                Ok(()) => {
                    self.machines.remove(machid, &machine);
                    killed.push(machid);
                }
                // Destroyed concurrently by someone else.
                Err(Error::MachineNotFound(_)) => {}
                Err(e) => warn!("Failed to kill machine {}: {}", machid, e),
            }
        }
        killed
    }

    /// Registers host memory with a machine so segments can be carved from
    /// it. Returns the host address segments refer to it by.
    pub fn hva_map(&self, machid: u32, region: Arc<MmapRegion>) -> Result<u64> {
        let machine = self.machines.get(machid)?;
        let mut guard = machine.write()?;
        let hva = guard.memory_mut().hva_map(region)?;
        debug!("Machine {}: host mapping at {:#x}", machid, hva);
        Ok(hva)
    }

    pub fn hva_unmap(&self, machid: u32, hva: u64) -> Result<()> {
        let machine = self.machines.get(machid)?;
        let mut guard = machine.write()?;
        guard.memory_mut().hva_unmap(hva)?;
        debug!("Machine {}: host mapping at {:#x} removed", machid, hva);
        Ok(())
    }

    pub fn vcpu_create(&self, machid: u32, cpuid: u32) -> Result<()> {
        if cpuid as usize >= limits::MAX_VCPUS {
            return Err(Error::InvalidCpuid(cpuid));
        }
        let machine = self.machines.get(machid)?;
        let mut guard = machine.write()?;
        guard.vcpu_create(cpuid, self.backend.state_size())?;
        debug!("Machine {}: vcpu {} created", machid, cpuid);
        Ok(())
    }

    pub fn vcpu_destroy(&self, machid: u32, cpuid: u32) -> Result<()> {
        let machine = self.machines.get(machid)?;
        let mut guard = machine.write()?;
        guard.vcpu_destroy(cpuid)?;
        debug!("Machine {}: vcpu {} destroyed", machid, cpuid);
        Ok(())
    }

    fn check_state_size(&self, len: usize) -> Result<()> {
        let expected = self.backend.state_size();
        if len != expected {
            return Err(Error::StateSizeMismatch {
                expected,
                actual: len,
            });
        }
        Ok(())
    }

    pub fn vcpu_setstate(
        &self,
        machid: u32,
        cpuid: u32,
        state: &[u8],
        mask: StateMask,
    ) -> Result<()> {
        self.check_state_size(state.len())?;
        let machine = self.machines.get(machid)?;
        let guard = machine.read()?;
        let mut vcpu = guard.vcpu(cpuid)?;
        vcpu.set_state(state, mask)
    }

    pub fn vcpu_getstate(
        &self,
        machid: u32,
        cpuid: u32,
        state: &mut [u8],
        mask: StateMask,
    ) -> Result<()> {
        self.check_state_size(state.len())?;
        let machine = self.machines.get(machid)?;
        let guard = machine.read()?;
        let mut vcpu = guard.vcpu(cpuid)?;
        vcpu.get_state(state, mask)
    }

    pub fn vcpu_inject(&self, machid: u32, cpuid: u32, event: &Event) -> Result<()> {
        let machine = self.machines.get(machid)?;
        let guard = machine.read()?;
        let mut vcpu = guard.vcpu(cpuid)?;
        vcpu.inject(event)
    }

    /// Runs the guest on the calling thread until the backend reports an
    /// exit. Returns `VmExit::Interrupted` after `vcpu_interrupt` or a host
    /// signal.
    pub fn vcpu_run(&self, machid: u32, cpuid: u32) -> Result<VmExit> {
        let machine = self.machines.get(machid)?;
        let guard = machine.read()?;
        let mut vcpu = guard.vcpu(cpuid)?;
        let kick = machine.kick(cpuid);
        vcpu.run(guard.vm(), guard.memory(), kick)
    }

    /// Asks the vcpu to leave (or not enter) the guest. Does not wait.
    pub fn vcpu_interrupt(&self, machid: u32, cpuid: u32) -> Result<()> {
        if cpuid as usize >= limits::MAX_VCPUS {
            return Err(Error::InvalidCpuid(cpuid));
        }
        let machine = self.machines.get(machid)?;
        machine.kick(cpuid).kick();
        Ok(())
    }

    pub fn vcpu_info(&self, machid: u32, cpuid: u32) -> Result<VcpuInfo> {
        let machine = self.machines.get(machid)?;
        let guard = machine.read()?;
        let vcpu = guard.vcpu(cpuid)?;
        Ok(vcpu.info())
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        for machine in self.machines.live() {
            warn!("Machine {} still alive at shutdown", machine.id());
            machine.kick_all();
            if let Err(e) = machine.teardown() {
                warn!("Failed to tear down machine {}: {}", machine.id(), e);
            }
            self.machines.remove(machine.id(), &machine);
        }
        self.backend.fini();
        info!("Monitor stopped");
    }
}
