// Copyright © 2020, Oracle and/or its affiliates.
//
// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause
//

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use hypervisor::{Event, RunContext, StateMask, Vm, VmExit};
use serde::Serialize;
use vmm_sys_util::signal::SIGRTMIN;

use crate::memory::GuestMemory;
use crate::{Error, Result};

/// Public description of one vcpu.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct VcpuInfo {
    pub cpuid: u32,
    /// Host CPU the vcpu last ran on, if it ever ran.
    pub hcpu_last: Option<u32>,
}

struct VcpuInner {
    /// Last state exchanged with the backend.
    state: Vec<u8>,
    hcpu_last: Option<u32>,
    backend: Box<dyn hypervisor::Vcpu>,
}

/// One virtual CPU of a machine. All access goes through a [`VcpuGuard`].
pub struct Vcpu {
    cpuid: u32,
    inner: Mutex<VcpuInner>,
}

impl Vcpu {
    pub(crate) fn new(cpuid: u32, state_size: usize, backend: Box<dyn hypervisor::Vcpu>) -> Self {
        Vcpu {
            cpuid,
            inner: Mutex::new(VcpuInner {
                state: vec![0; state_size],
                hcpu_last: None,
                backend,
            }),
        }
    }

    pub(crate) fn lock(&self) -> VcpuGuard<'_> {
        VcpuGuard {
            cpuid: self.cpuid,
            inner: self.inner.lock().unwrap(),
        }
    }

    /// Runs the backend destroy hook. Taking `self` by value means nobody
    /// else can be holding the vcpu.
    pub(crate) fn destroy(self) {
        let inner = self
            .inner
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.backend.destroy();
    }
}

/// Exclusive access to one vcpu, borrowed from a machine guard.
pub struct VcpuGuard<'g> {
    cpuid: u32,
    inner: MutexGuard<'g, VcpuInner>,
}

impl VcpuGuard<'_> {
    pub fn set_state(&mut self, buf: &[u8], mask: StateMask) -> Result<()> {
        let inner = &mut *self.inner;
        inner.backend.set_state(buf, mask).map_err(Error::Cpu)?;
        inner.state.copy_from_slice(buf);
        Ok(())
    }

    pub fn get_state(&mut self, buf: &mut [u8], mask: StateMask) -> Result<()> {
        let inner = &mut *self.inner;
        inner
            .backend
            .get_state(&mut inner.state, mask)
            .map_err(Error::Cpu)?;
        buf.copy_from_slice(&inner.state);
        Ok(())
    }

    pub fn inject(&mut self, event: &Event) -> Result<()> {
        self.inner.backend.inject(event).map_err(Error::Cpu)
    }

    pub fn run(&mut self, vm: &dyn Vm, memory: &GuestMemory, kick: &VcpuKick) -> Result<VmExit> {
        let _running = kick.enter();
        let inner = &mut *self.inner;

        let hcpu = current_cpu();
        let hcpu_changed = inner.hcpu_last != Some(hcpu);
        inner.hcpu_last = Some(hcpu);

        let mut ctx = RunContext::new(hcpu, hcpu_changed, memory, &kick.stop);
        let exit = inner.backend.run(vm, &mut ctx).map_err(Error::Cpu)?;
        if exit == VmExit::Interrupted {
            // A signal may have ended the run before the backend consumed
            // the request.
            kick.stop.store(false, Ordering::SeqCst);
        }
        Ok(exit)
    }

    pub fn info(&self) -> VcpuInfo {
        VcpuInfo {
            cpuid: self.cpuid,
            hcpu_last: self.inner.hcpu_last,
        }
    }
}

fn current_cpu() -> u32 {
    // SAFETY: sched_getcpu has no preconditions.
    let cpu = unsafe { libc::sched_getcpu() };
    u32::try_from(cpu).unwrap_or(0)
}

/// Stop request slot of one `(machine, cpuid)` pair.
///
/// It lives outside the machine lock so a vcpu can be asked to stop while
/// another thread is queued on that lock.
pub struct VcpuKick {
    stop: AtomicBool,
    thread: Mutex<Option<libc::pthread_t>>,
}

impl VcpuKick {
    pub fn new() -> Self {
        VcpuKick {
            stop: AtomicBool::new(false),
            thread: Mutex::new(None),
        }
    }

    /// Requests a stop and signals the thread currently running the vcpu.
    pub fn kick(&self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = *self.thread.lock().unwrap() {
            // SAFETY: the thread is inside `run` as long as it is registered,
            // and it unregisters under the same lock before returning.
            unsafe {
                libc::pthread_kill(thread, SIGRTMIN());
            }
        }
    }

    pub fn is_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Forgets any stop request left over from a previous vcpu.
    pub(crate) fn reset(&self) {
        self.stop.store(false, Ordering::SeqCst);
    }

    fn enter(&self) -> RunningGuard<'_> {
        // SAFETY: pthread_self has no preconditions.
        *self.thread.lock().unwrap() = Some(unsafe { libc::pthread_self() });
        RunningGuard { kick: self }
    }
}

impl Default for VcpuKick {
    fn default() -> Self {
        Self::new()
    }
}

struct RunningGuard<'a> {
    kick: &'a VcpuKick,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        *self.kick.thread.lock().unwrap() = None;
    }
}
