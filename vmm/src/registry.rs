// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

use std::sync::Arc;

use hypervisor::Backend;

use crate::{Error, Result};

/// Ordered list of candidate backends.
pub struct BackendRegistry {
    backends: Vec<Arc<dyn Backend>>,
}

impl BackendRegistry {
    /// Every backend compiled into this build.
    pub fn new() -> Self {
        Self::with_backends(hypervisor::backends())
    }

    pub fn with_backends(backends: Vec<Arc<dyn Backend>>) -> Self {
        BackendRegistry { backends }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }

    /// Initializes and returns the first backend whose probe succeeds.
    /// Later candidates are neither probed nor initialized.
    pub fn select(&self) -> Result<Arc<dyn Backend>> {
        for backend in self.backends.iter() {
            if !backend.probe() {
                debug!("Backend {} is not usable on this host", backend.name());
                continue;
            }
            backend.init().map_err(|e| {
                error!("Failed to initialize the {} backend: {}", backend.name(), e);
                Error::Hypervisor(e)
            })?;
            return Ok(backend.clone());
        }
        Err(Error::Unsupported)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use hypervisor::{BackendCapability, HypervisorError, MachineDescriptor, Vm};

    use super::*;

    struct Candidate {
        name: &'static str,
        usable: bool,
        init_fails: bool,
        probes: AtomicUsize,
        inits: AtomicUsize,
    }

    impl Candidate {
        fn new(name: &'static str, usable: bool, init_fails: bool) -> Arc<Self> {
            Arc::new(Candidate {
                name,
                usable,
                init_fails,
                probes: AtomicUsize::new(0),
                inits: AtomicUsize::new(0),
            })
        }
    }

    fn registry(candidates: &[&Arc<Candidate>]) -> BackendRegistry {
        BackendRegistry::with_backends(
            candidates
                .iter()
                .map(|&c| c.clone() as Arc<dyn Backend>)
                .collect(),
        )
    }

    impl Backend for Candidate {
        fn name(&self) -> &'static str {
            self.name
        }
        fn probe(&self) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.usable
        }
        fn init(&self) -> hypervisor::hypervisor::Result<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            if self.init_fails {
                return Err(HypervisorError::NotInitialized);
            }
            Ok(())
        }
        fn fini(&self) {}
        fn capability(&self) -> BackendCapability {
            BackendCapability::default()
        }
        fn state_size(&self) -> usize {
            0
        }
        fn conf_sizes(&self) -> &[usize] {
            &[]
        }
        fn machine_create(
            &self,
            _: &MachineDescriptor,
        ) -> hypervisor::hypervisor::Result<Box<dyn Vm>> {
            Err(HypervisorError::NotInitialized)
        }
    }

    #[test]
    fn test_select_first_usable() {
        let a = Candidate::new("a", false, false);
        let b = Candidate::new("b", true, false);
        let c = Candidate::new("c", true, false);
        let registry = registry(&[&a, &b, &c]);
        assert_eq!(registry.names(), vec!["a", "b", "c"]);

        let selected = registry.select().unwrap();
        assert_eq!(selected.name(), "b");
        assert_eq!(a.inits.load(Ordering::SeqCst), 0);
        assert_eq!(b.inits.load(Ordering::SeqCst), 1);
        assert_eq!(c.probes.load(Ordering::SeqCst), 0);
        assert_eq!(c.inits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_select_none_usable() {
        let registry = registry(&[&Candidate::new("a", false, false)]);
        assert!(matches!(registry.select(), Err(Error::Unsupported)));
        let empty = BackendRegistry::with_backends(Vec::new());
        assert!(matches!(empty.select(), Err(Error::Unsupported)));
    }

    #[test]
    fn test_select_init_failure() {
        let a = Candidate::new("a", true, true);
        let b = Candidate::new("b", true, false);
        let registry = registry(&[&a, &b]);
        assert!(matches!(registry.select(), Err(Error::Hypervisor(_))));
        assert_eq!(b.probes.load(Ordering::SeqCst), 0);
    }
}
