// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//
// Copyright 2018-2019 CrowdStrike, Inc.
//
//

use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, Ordering};

use bitflags::bitflags;
use thiserror::Error;

use crate::vm::{MemoryProtection, Vm};

#[derive(Error, Debug)]
///
/// Enum for CPU error
pub enum HypervisorCpuError {
    ///
    /// State buffer has the wrong size for this backend
    ///
    #[error("Invalid state buffer size {0}")]
    StateSize(usize),
    ///
    /// Setting register state error
    ///
    #[error("Failed to set vcpu state: {0}")]
    SetState(#[source] anyhow::Error),
    ///
    /// Getting register state error
    ///
    #[error("Failed to get vcpu state: {0}")]
    GetState(#[source] anyhow::Error),
    ///
    /// Event can never be delivered as described
    ///
    #[error("Invalid event: {0:?}")]
    InvalidEvent(Event),
    ///
    /// An event of the same class is already waiting for delivery
    ///
    #[error("An event of this kind is already pending")]
    EventPending,
    ///
    /// The guest cannot take an external interrupt right now
    ///
    #[error("Guest is not interruptible")]
    NotInterruptible,
    ///
    /// Injecting an event failed in the backend
    ///
    #[error("Failed to inject event: {0}")]
    Inject(#[source] anyhow::Error),
    ///
    /// Running Vcpu error
    ///
    #[error("Failed to run vcpu: {0}")]
    RunVcpu(#[source] anyhow::Error),
}

///
/// Result type for returning from a function
///
pub type Result<T> = std::result::Result<T, HypervisorCpuError>;

bitflags! {
    /// Register groups selected by a state transfer.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct StateMask: u64 {
        const SEGS = 1 << 0;
        const GPRS = 1 << 1;
        const CRS = 1 << 2;
        const DRS = 1 << 3;
        const MSRS = 1 << 4;
        const INTR = 1 << 5;
        const FPU = 1 << 6;
        const ALL = Self::SEGS.bits()
            | Self::GPRS.bits()
            | Self::CRS.bits()
            | Self::DRS.bits()
            | Self::MSRS.bits()
            | Self::INTR.bits()
            | Self::FPU.bits();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// External interrupt.
    Interrupt,
    Nmi,
    /// Hardware exception.
    Exception,
}

/// An event to deliver to the guest on its next entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub vector: u8,
    pub error_code: Option<u32>,
}

pub const NMI_VECTOR: u8 = 2;

/// Exceptions that push an error code: #DF, #TS, #NP, #SS, #GP, #PF, #AC.
pub fn exception_has_error_code(vector: u8) -> bool {
    matches!(vector, 8 | 10..=14 | 17)
}

impl Event {
    pub fn interrupt(vector: u8) -> Self {
        Event {
            kind: EventKind::Interrupt,
            vector,
            error_code: None,
        }
    }

    pub fn nmi() -> Self {
        Event {
            kind: EventKind::Nmi,
            vector: NMI_VECTOR,
            error_code: None,
        }
    }

    pub fn exception(vector: u8, error_code: Option<u32>) -> Self {
        Event {
            kind: EventKind::Exception,
            vector,
            error_code,
        }
    }

    /// Rejects events no x86 backend is able to deliver. Vector 2 is only
    /// reachable as an NMI. Exceptions must be architectural faults other
    /// than #DE and #BP, and carry an error code exactly when the vector
    /// defines one.
    pub fn validate(&self) -> Result<()> {
        let valid = match self.kind {
            EventKind::Interrupt => self.error_code.is_none() && self.vector != NMI_VECTOR,
            EventKind::Nmi => self.error_code.is_none() && self.vector == NMI_VECTOR,
            EventKind::Exception => {
                !matches!(self.vector, 0 | NMI_VECTOR | 3 | 32..)
                    && exception_has_error_code(self.vector) == self.error_code.is_some()
            }
        };
        if valid {
            Ok(())
        } else {
            Err(HypervisorCpuError::InvalidEvent(*self))
        }
    }
}

/// Why `Vcpu::run` returned.
///
/// The core hands exits back to its caller untouched; only the backend
/// decides what they mean.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VmExit {
    /// Host signal or stop request, nothing happened in the guest.
    Interrupted,
    Halted,
    Shutdown,
    Io {
        port: u16,
        write: bool,
        size: u8,
        data: Vec<u8>,
    },
    Mmio {
        gpa: u64,
        write: bool,
        size: u8,
        data: Vec<u8>,
    },
    /// The guest can accept an external interrupt again.
    InterruptWindow,
    /// The guest state could not be entered.
    Invalid,
    /// Backend-specific exit code the backend did not classify.
    Unknown(u64),
}

/// Where a guest physical address lives in host memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GuestMapping {
    pub gpa: u64,
    pub hva: u64,
    /// Bytes from `gpa` to the end of the segment containing it.
    pub len: u64,
    pub prot: MemoryProtection,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryFault {
    #[error("Guest address {0:#x} is not mapped")]
    NotMapped(u64),
    #[error("Guest range at {0:#x} crosses a segment boundary")]
    Boundary(u64),
}

/// Read-only view of a machine's memory layout, given to a backend while a
/// vcpu runs.
pub trait GuestMemoryMap: Send + Sync {
    fn translate(&self, gpa: u64) -> std::result::Result<GuestMapping, MemoryFault>;
    /// Copies `buf.len()` bytes out of one segment.
    fn read(&self, gpa: u64, buf: &mut [u8]) -> std::result::Result<(), MemoryFault>;
    /// Copies `buf` into one segment.
    fn write(&self, gpa: u64, buf: &[u8]) -> std::result::Result<(), MemoryFault>;
}

/// Everything the core tells a backend about one `run` call.
pub struct RunContext<'a> {
    /// Host CPU the calling thread is on.
    pub hcpu: u32,
    /// The vcpu last ran on a different host CPU, or never ran.
    pub hcpu_changed: bool,
    pub memory: &'a dyn GuestMemoryMap,
    stop: &'a AtomicBool,
}

impl<'a> RunContext<'a> {
    pub fn new(
        hcpu: u32,
        hcpu_changed: bool,
        memory: &'a dyn GuestMemoryMap,
        stop: &'a AtomicBool,
    ) -> Self {
        RunContext {
            hcpu,
            hcpu_changed,
            memory,
            stop,
        }
    }

    pub fn translate(&self, gpa: u64) -> std::result::Result<GuestMapping, MemoryFault> {
        self.memory.translate(gpa)
    }

    pub fn read_guest(&self, gpa: u64, buf: &mut [u8]) -> std::result::Result<(), MemoryFault> {
        self.memory.read(gpa, buf)
    }

    pub fn write_guest(&self, gpa: u64, buf: &[u8]) -> std::result::Result<(), MemoryFault> {
        self.memory.write(gpa, buf)
    }

    /// Consumes a pending stop request. A backend that sees `true` must
    /// return `VmExit::Interrupted` without entering the guest.
    pub fn should_stop(&self) -> bool {
        self.stop.swap(false, Ordering::AcqRel)
    }
}

thread_local! {
    static ENTRY_EXIT_FLAG: AtomicPtr<AtomicU8> = const { AtomicPtr::new(ptr::null_mut()) };
}

/// Exit flag of the guest entry the current thread is about to make.
///
/// A backend arms it before its last `RunContext::should_stop` check.
/// [`kick_current_thread`] raises it from the kick signal handler, so a stop
/// request landing between that check and the entry still ends the entry.
pub struct EntryExitFlag {
    _not_send: PhantomData<*const ()>,
}

impl EntryExitFlag {
    /// # Safety
    ///
    /// `flag` must stay valid until the returned guard is dropped.
    pub unsafe fn arm(flag: *const AtomicU8) -> Self {
        ENTRY_EXIT_FLAG.with(|f| f.store(flag.cast_mut(), Ordering::SeqCst));
        EntryExitFlag {
            _not_send: PhantomData,
        }
    }
}

impl Drop for EntryExitFlag {
    fn drop(&mut self) {
        ENTRY_EXIT_FLAG.with(|f| f.store(ptr::null_mut(), Ordering::SeqCst));
    }
}

/// Raises the exit flag armed on the calling thread, if any.
///
/// Only touches a const-initialized thread local and an atomic, so it is
/// safe to call from a signal handler.
pub fn kick_current_thread() {
    ENTRY_EXIT_FLAG.with(|f| {
        let flag = f.load(Ordering::SeqCst);
        if !flag.is_null() {
            // SAFETY: an armed flag outlives its guard, and the guard is
            // dropped on this thread.
            unsafe { (*flag).store(1, Ordering::SeqCst) };
        }
    });
}

///
/// Trait to represent a generic Vcpu
///
/// The core never calls two methods of the same vcpu concurrently.
///
pub trait Vcpu: Send {
    ///
    /// Load the register groups selected by `mask` from `state`
    ///
    fn set_state(&mut self, state: &[u8], mask: StateMask) -> Result<()>;
    ///
    /// Store the register groups selected by `mask` into `state`
    ///
    /// Groups outside `mask` are left untouched.
    ///
    fn get_state(&mut self, state: &mut [u8], mask: StateMask) -> Result<()>;
    ///
    /// Queue an event for delivery on the next guest entry
    ///
    fn inject(&mut self, event: &Event) -> Result<()>;
    ///
    /// Enter the guest until the next exit the host has to see
    ///
    fn run(&mut self, vm: &dyn Vm, ctx: &mut RunContext) -> Result<VmExit>;
    ///
    /// Release the backend resources of the vcpu
    ///
    fn destroy(self: Box<Self>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_validation() {
        assert!(Event::interrupt(0x20).validate().is_ok());
        assert!(Event::interrupt(0x08).validate().is_ok());
        assert!(Event::interrupt(NMI_VECTOR).validate().is_err());
        assert!(Event::nmi().validate().is_ok());
        assert!(Event::exception(13, Some(0)).validate().is_ok());
        assert!(Event::exception(6, None).validate().is_ok());

        for vector in [0, 2, 3, 32, 255] {
            assert!(Event::exception(vector, None).validate().is_err());
        }
        // Error code presence must match the vector.
        assert!(Event::exception(13, None).validate().is_err());
        assert!(Event::exception(6, Some(0)).validate().is_err());
        assert!(matches!(
            Event::exception(3, None).validate(),
            Err(HypervisorCpuError::InvalidEvent(_))
        ));
    }

    #[test]
    fn test_stop_request_consumed_once() {
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

        let stop = AtomicBool::new(true);
        let ctx = RunContext::new(0, true, &NoMemory, &stop);
        assert!(ctx.should_stop());
        assert!(!ctx.should_stop());
        assert_eq!(ctx.translate(0x1000), Err(MemoryFault::NotMapped(0x1000)));
    }

    #[test]
    fn test_entry_exit_flag() {
        let flag = AtomicU8::new(0);
        kick_current_thread();
        assert_eq!(flag.load(Ordering::SeqCst), 0);

        {
            // SAFETY: `flag` outlives the guard.
            let _armed = unsafe { EntryExitFlag::arm(&flag) };
            kick_current_thread();
            assert_eq!(flag.load(Ordering::SeqCst), 1);
        }

        flag.store(0, Ordering::SeqCst);
        kick_current_thread();
        assert_eq!(flag.load(Ordering::SeqCst), 0);

        // Arming is per thread.
        // SAFETY: `flag` outlives the guard.
        let _armed = unsafe { EntryExitFlag::arm(&flag) };
        std::thread::spawn(kick_current_thread).join().unwrap();
        assert_eq!(flag.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_state_mask_all() {
        let all = StateMask::SEGS
            | StateMask::GPRS
            | StateMask::CRS
            | StateMask::DRS
            | StateMask::MSRS
            | StateMask::INTR
            | StateMask::FPU;
        assert_eq!(all, StateMask::ALL);
        assert_eq!(StateMask::all(), StateMask::ALL);
    }
}
