// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//
// Copyright 2018-2019 CrowdStrike, Inc.
//
//

//! A generic abstraction around hardware virtualization backends
//!
//! This crate offers the trait interface a machine-independent monitor uses
//! to drive a backend (`Backend`, `Vm`, `Vcpu`), the exit and event types
//! flowing across it, and the backends compiled into this build.
//!
//! # Platform support
//!
//! - x86_64
//!

#[cfg(all(feature = "kvm", target_arch = "x86_64"))]
#[macro_use]
extern crate anyhow;
#[cfg(all(feature = "kvm", target_arch = "x86_64"))]
#[macro_use]
extern crate log;

/// Architecture specific definitions
pub mod arch;

#[cfg(all(feature = "kvm", target_arch = "x86_64"))]
/// KVM implementation module
pub mod kvm;

/// Backend related module
pub mod hypervisor;

/// Vm related module
pub mod vm;

/// CPU related module
pub mod cpu;

pub use crate::hypervisor::{
    backends, Backend, BackendCapability, HypervisorError, MachineDescriptor,
};
pub use cpu::{
    kick_current_thread, EntryExitFlag, Event, EventKind, GuestMapping, GuestMemoryMap,
    HypervisorCpuError, MemoryFault, RunContext, StateMask, Vcpu, VmExit,
};
#[cfg(all(feature = "kvm", target_arch = "x86_64"))]
pub use kvm::KvmBackend;
pub use vm::{HypervisorVmError, MemoryProtection, UserMemoryRegion, Vm};
