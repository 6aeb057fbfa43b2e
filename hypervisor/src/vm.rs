// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//
// Copyright 2018-2019 CrowdStrike, Inc.
//
//

use bitflags::bitflags;
use thiserror::Error;

use crate::cpu::Vcpu;

#[derive(Error, Debug)]
///
/// Enum for VM error
pub enum HypervisorVmError {
    ///
    /// Create Vcpu error
    ///
    #[error("Failed to create Vcpu: {0}")]
    CreateVcpu(#[source] anyhow::Error),
    ///
    /// TSS address error
    ///
    #[error("Failed to set TSS address: {0}")]
    SetTssAddress(#[source] anyhow::Error),
    ///
    /// Set user memory error
    ///
    #[error("Failed to set user memory: {0}")]
    SetUserMemory(#[source] anyhow::Error),
    ///
    /// Backend configuration op failed
    ///
    #[error("Failed to configure Vm: {0}")]
    Configure(#[source] anyhow::Error),
    ///
    /// Backend configuration op is not known to this backend
    ///
    #[error("Unsupported configuration op {0}")]
    UnsupportedConfig(usize),
    ///
    /// No room left in a backend-side table
    ///
    #[error("Backend table is full")]
    NoSpace,
}

///
/// Result type for returning from a function
///
pub type Result<T> = std::result::Result<T, HypervisorVmError>;

bitflags! {
    /// Guest access rights of a memory segment.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MemoryProtection: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const ALL = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits();
    }
}

/// A guest physical range backed by host memory, as handed to the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UserMemoryRegion {
    pub slot: u32,
    pub gpa: u64,
    pub size: u64,
    pub hva: u64,
    pub prot: MemoryProtection,
}

///
/// Trait that represents the backend side of a machine
///
/// The core serializes calls on one `Vm`: everything except `create_vcpu`
/// follows from an exclusive machine lock.
///
pub trait Vm: Send + Sync {
    ///
    /// Apply a backend-specific configuration op
    ///
    /// `op` is relative to the first backend op, and `data` has already been
    /// checked against the size the backend advertised for it.
    ///
    fn configure(&mut self, op: usize, data: &[u8]) -> Result<()>;
    ///
    /// Make a guest physical range visible to the guest
    ///
    fn map_memory(&mut self, region: &UserMemoryRegion) -> Result<()>;
    ///
    /// Create the backend side of a vcpu
    ///
    fn create_vcpu(&mut self, id: u32) -> Result<Box<dyn Vcpu>>;
    ///
    /// Tear down the machine, after every vcpu has been destroyed
    ///
    fn destroy(self: Box<Self>);
}
