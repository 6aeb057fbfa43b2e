// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//
// Copyright 2018-2019 CrowdStrike, Inc.
//
//
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::vm::Vm;

#[derive(Error, Debug)]
///
///
pub enum HypervisorError {
    ///
    /// Backend device could not be opened
    ///
    #[error("Failed to open hypervisor: {0}")]
    HypervisorOpen(#[source] anyhow::Error),
    ///
    /// Backend was used before `init`
    ///
    #[error("Hypervisor backend is not initialized")]
    NotInitialized,
    ///
    /// API version error
    ///
    #[error("Failed to get API Version: {0}")]
    GetApiVersion(#[source] anyhow::Error),
    ///
    /// API version is not compatible
    ///
    #[error("Incompatible API version")]
    IncompatibleApiVersion,
    ///
    /// Vm creation failure
    ///
    #[error("Failed to create Vm: {0}")]
    VmCreate(#[source] anyhow::Error),
    ///
    /// Vm setup failure
    ///
    #[error("Failed to setup Vm: {0}")]
    VmSetup(#[source] anyhow::Error),
    ///
    /// CpuId error
    ///
    #[error("Failed to get cpuid: {0}")]
    GetCpuId(#[source] anyhow::Error),
}

///
/// Result type for returning from a function
///
pub type Result<T> = std::result::Result<T, HypervisorError>;

/// Identity and feature data a backend reports about itself.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BackendCapability {
    pub name: String,
    pub version: u32,
    /// XCR0 bits the guest may enable.
    pub xcr0_mask: u64,
    pub mxcsr_mask: u32,
    /// Number of CPUID leaves a single machine can override.
    pub cpuid_max_ops: u32,
}

/// What the core hands the backend when a machine is created.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MachineDescriptor {
    pub machid: u32,
    pub gpa_begin: u64,
    pub gpa_end: u64,
}

///
/// Trait to represent a hardware virtualization backend
///
/// A backend is process-wide and immutable once `init` has returned. All
/// per-machine and per-vcpu state lives behind the `Vm` and `Vcpu` objects it
/// hands out.
///
pub trait Backend: Send + Sync {
    /// Short identifier, e.g. "kvm".
    fn name(&self) -> &'static str;
    ///
    /// Whether the backend can work on this host
    ///
    fn probe(&self) -> bool;
    ///
    /// One-time initialization, called on the selected backend only
    ///
    fn init(&self) -> Result<()>;
    ///
    /// Undoes `init`, called once after the last machine is gone
    ///
    fn fini(&self);
    fn capability(&self) -> BackendCapability;
    /// Size in bytes of the vcpu state buffer exchanged by `Vcpu::set_state`
    /// and `Vcpu::get_state`.
    fn state_size(&self) -> usize;
    /// Payload size of each backend-specific configuration op, indexed by
    /// `op - CONF_MD_BEGIN`.
    fn conf_sizes(&self) -> &[usize];
    ///
    /// Create the backend side of a machine
    ///
    fn machine_create(&self, desc: &MachineDescriptor) -> Result<Box<dyn Vm>>;
}

/// Backends compiled into this build, in preference order.
#[allow(unused_mut)]
pub fn backends() -> Vec<Arc<dyn Backend>> {
    let mut list: Vec<Arc<dyn Backend>> = Vec::new();
    #[cfg(all(feature = "kvm", target_arch = "x86_64"))]
    list.push(Arc::new(crate::kvm::KvmBackend::new()));
    list
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_serializes() {
        let cap = BackendCapability {
            name: "test".to_string(),
            version: 1,
            xcr0_mask: 0x7,
            mxcsr_mask: 0xffbf,
            cpuid_max_ops: 16,
        };
        let json = serde_json::to_value(&cap).unwrap();
        assert_eq!(json["name"], "test");
        assert_eq!(json["cpuid_max_ops"], 16);
        assert_eq!(json["xcr0_mask"], 7);
    }

    #[test]
    fn test_backends_are_named() {
        for backend in backends() {
            assert!(!backend.name().is_empty());
            assert_eq!(backend.capability().name, backend.name());
        }
    }
}
