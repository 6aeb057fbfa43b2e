// Copyright © 2025 Cyberus Technology GmbH
//
// SPDX-License-Identifier: Apache-2.0

#[macro_use]
extern crate log;

use std::io::Write;
use std::sync::Arc;

use hypervisor::arch::x86::{State, STATE_SIZE};
use hypervisor::{MemoryProtection, StateMask, VmExit};
use thiserror::Error;
use vm_memory::{MmapRegion, VolatileMemory};
use vmm::config::GuestConfig;
use vmm::{MachineConfig, Monitor, SegmentConf, CONF_ADD_SEGMENT};
use zerocopy::IntoBytes;

/// Port of the first legacy UART; guest writes to it are forwarded to the
/// host output.
pub const SERIAL_PORT: u16 = 0x3f8;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Monitor request failed")]
    Monitor(#[source] vmm::Error),
    #[error("Backend state is {0} bytes, this tool only drives x86-64 state")]
    UnsupportedState(usize),
    #[error("Image of {size} bytes at {entry:#x} overruns {memory:#x} bytes of guest memory")]
    ImageTooLarge { size: usize, entry: u64, memory: u64 },
    #[error("Failed to allocate guest memory")]
    AllocateMemory(#[source] vm_memory::mmap::MmapRegionError),
    #[error("Failed to load the image into guest memory")]
    LoadImage(#[source] vm_memory::volatile_memory::Error),
    #[error("Failed to forward guest output")]
    Output(#[source] std::io::Error),
    #[error("Guest stopped on an unexpected exit: {0:?}")]
    UnexpectedExit(VmExit),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A machine with flat memory at GPA 0 and real-mode vcpus, owned by the
/// calling process. Dropping it destroys the machine.
pub struct Guest<'a> {
    monitor: &'a Monitor,
    machid: u32,
    cpus: u32,
}

impl<'a> Guest<'a> {
    /// Creates the machine, loads `image` at `config.entry` and points every
    /// vcpu at it.
    pub fn create(monitor: &'a Monitor, config: &GuestConfig, image: &[u8]) -> Result<Self> {
        let state_size = monitor.backend().state_size();
        if state_size != STATE_SIZE {
            return Err(Error::UnsupportedState(state_size));
        }
        let image_fits = (image.len() as u64)
            .checked_add(config.entry)
            .is_some_and(|end| end <= config.memory);
        if !image_fits {
            return Err(Error::ImageTooLarge {
                size: image.len(),
                entry: config.entry,
                memory: config.memory,
            });
        }

        let machid = monitor
            .machine_create(&MachineConfig::new(0, config.window))
            .map_err(Error::Monitor)?;
        let mut guest = Guest {
            monitor,
            machid,
            cpus: 0,
        };

        let region: Arc<MmapRegion> =
            Arc::new(MmapRegion::new(config.memory as usize).map_err(Error::AllocateMemory)?);
        region
            .get_slice(config.entry as usize, image.len())
            .map_err(Error::LoadImage)?
            .copy_from(image);
        let hva = monitor
            .hva_map(machid, region)
            .map_err(Error::Monitor)?;
        let segment = SegmentConf {
            gpa: 0,
            hva,
            size: config.memory,
            prot: u64::from(MemoryProtection::ALL.bits()),
        };
        monitor
            .machine_configure(machid, CONF_ADD_SEGMENT, segment.as_bytes())
            .map_err(Error::Monitor)?;

        let (cs, ip) = config.real_mode_entry();
        let mut state = vec![0u8; STATE_SIZE];
        State::real_mode(cs, ip)
            .to_buffer(&mut state)
            .map_err(|e| Error::Monitor(vmm::Error::Cpu(e)))?;
        for cpuid in 0..config.cpus {
            monitor
                .vcpu_create(machid, cpuid)
                .map_err(Error::Monitor)?;
            guest.cpus = cpuid + 1;
            monitor
                .vcpu_setstate(machid, cpuid, &state, StateMask::ALL)
                .map_err(Error::Monitor)?;
        }

        info!(
            "Guest loaded: {} bytes at {:#x}, entry {:04x}:{:04x}, {} vcpu(s)",
            image.len(),
            config.entry,
            cs,
            ip,
            config.cpus
        );
        Ok(guest)
    }

    pub fn machid(&self) -> u32 {
        self.machid
    }

    /// Runs vcpu 0 until the guest halts or shuts down, copying bytes the
    /// guest writes to [`SERIAL_PORT`] into `out`.
    pub fn run(&self, out: &mut dyn Write) -> Result<VmExit> {
        loop {
            let exit = self
                .monitor
                .vcpu_run(self.machid, 0)
                .map_err(Error::Monitor)?;
            match exit {
                VmExit::Halted | VmExit::Shutdown => return Ok(exit),
                VmExit::Io {
                    port: SERIAL_PORT,
                    write: true,
                    size,
                    ref data,
                } => {
                    let len = data.len().min(size as usize);
                    out.write_all(&data[..len]).map_err(Error::Output)?;
                    out.flush().map_err(Error::Output)?;
                }
                VmExit::Io { port, write, .. } => {
                    debug!(
                        "Ignoring {} on port {:#x}",
                        if write { "write" } else { "read" },
                        port
                    );
                }
                VmExit::Mmio { gpa, write, .. } => {
                    debug!(
                        "Ignoring MMIO {} at {:#x}",
                        if write { "write" } else { "read" },
                        gpa
                    );
                }
                VmExit::Interrupted | VmExit::InterruptWindow => {}
                VmExit::Invalid | VmExit::Unknown(_) => return Err(Error::UnexpectedExit(exit)),
            }
        }
    }
}

impl Drop for Guest<'_> {
    fn drop(&mut self) {
        for cpuid in 0..self.cpus {
            if let Err(e) = self.monitor.vcpu_destroy(self.machid, cpuid) {
                warn!("Failed to destroy vcpu {}: {}", cpuid, e);
            }
        }
        if let Err(e) = self.monitor.machine_destroy(self.machid) {
            warn!("Failed to destroy machine {}: {}", self.machid, e);
        }
    }
}

/// Prints a chain of errors to the user in a consistent manner.
/// The user will see a clear chain of errors, followed by debug output
/// for opening issues.
pub fn cli_print_error_chain(top_error: &dyn std::error::Error, component: &str) {
    let mut stderr = std::io::stderr().lock();
    // Nothing sensible is left to do if stderr itself is gone.
    let _ = write_error_chain(&mut stderr, top_error, component);
}

fn write_error_chain(
    out: &mut dyn Write,
    top_error: &dyn std::error::Error,
    component: &str,
) -> std::io::Result<()> {
    write!(out, "Error: {component} exited with the following ")?;
    if top_error.source().is_none() {
        writeln!(out, "error:")?;
        writeln!(out, "  {top_error}")?;
    } else {
        writeln!(out, "chain of errors:")?;
        for (level, error) in std::iter::successors(Some(top_error), |sub_error| {
            // Dereference necessary to mitigate rustc compiler bug.
            // See <https://github.com/rust-lang/rust/issues/141673>
            (*sub_error).source()
        })
        .enumerate()
        {
            writeln!(out, "  {level}: {error}")?;
        }
    }

    writeln!(out)?;
    writeln!(out, "Debug Info: {top_error:?}")
}
