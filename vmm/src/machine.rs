// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Machine table and per-machine locking.
//!
//! Lock order is fixed: machine table, then machine `RwLock`, then vcpu
//! `Mutex`. The table lock is never held while waiting on a machine. Vcpus
//! are only reachable through a machine guard, which the `VcpuGuard` borrows
//! from.

use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use hypervisor::Vm;
use serde::Serialize;
use vm_allocator::SlotTable;

use crate::cpu::{Vcpu, VcpuGuard, VcpuKick};
use crate::limits::{MAX_RAM, MAX_VCPUS};
use crate::memory::{GuestMemory, SegmentConf, SegmentInfo};
use crate::{Error, Result};

/// Public description of one machine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MachineInfo {
    pub machid: u32,
    pub owner: u32,
    pub gpa_begin: u64,
    pub gpa_end: u64,
    pub mapped_size: u64,
    pub segments: Vec<SegmentInfo>,
    pub vcpus: Vec<u32>,
}

struct MachineState {
    present: bool,
    vm: Option<Box<dyn Vm>>,
    memory: GuestMemory,
    vcpus: SlotTable<Vcpu>,
}

impl MachineState {
    fn vm(&self) -> &dyn Vm {
        self.vm.as_deref().expect("live machine without backend state")
    }

    fn vm_mut(&mut self) -> &mut dyn Vm {
        self.vm
            .as_deref_mut()
            .expect("live machine without backend state")
    }

    // Backend hook first, then the memory it was using, then the slot.
    fn shutdown(&mut self) {
        if let Some(vm) = self.vm.take() {
            vm.destroy();
        }
        self.memory.clear();
        self.present = false;
    }
}

pub(crate) struct Machine {
    id: u32,
    owner: u32,
    gpa_begin: u64,
    gpa_end: u64,
    state: RwLock<MachineState>,
    kicks: Vec<VcpuKick>,
}

impl Machine {
    pub(crate) fn new(id: u32, owner: u32, gpa_begin: u64, gpa_end: u64, vm: Box<dyn Vm>) -> Self {
        let mut kicks = Vec::with_capacity(MAX_VCPUS);
        kicks.resize_with(MAX_VCPUS, VcpuKick::new);
        Machine {
            id,
            owner,
            gpa_begin,
            gpa_end,
            state: RwLock::new(MachineState {
                present: true,
                vm: Some(vm),
                memory: GuestMemory::new(gpa_begin, gpa_end, MAX_RAM),
                vcpus: SlotTable::new(MAX_VCPUS),
            }),
            kicks,
        }
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn owner(&self) -> u32 {
        self.owner
    }

    /// Shared access, for operations on one existing vcpu.
    pub(crate) fn read(&self) -> Result<MachineReadGuard<'_>> {
        let state = self.state.read().unwrap();
        if !state.present {
            return Err(Error::MachineNotFound(self.id));
        }
        Ok(MachineReadGuard {
            machine: self,
            state,
        })
    }

    /// Exclusive access, for everything that changes the machine layout.
    pub(crate) fn write(&self) -> Result<MachineWriteGuard<'_>> {
        let state = self.state.write().unwrap();
        if !state.present {
            return Err(Error::MachineNotFound(self.id));
        }
        Ok(MachineWriteGuard {
            machine: self,
            state,
        })
    }

    /// `cpuid` must be below `MAX_VCPUS`.
    pub(crate) fn kick(&self, cpuid: u32) -> &VcpuKick {
        &self.kicks[cpuid as usize]
    }

    pub(crate) fn kick_all(&self) {
        for kick in self.kicks.iter() {
            kick.kick();
        }
    }

    /// Destroys the machine if it has no vcpu left.
    pub(crate) fn destroy(&self) -> Result<()> {
        let mut guard = self.write()?;
        if !guard.state.vcpus.is_empty() {
            return Err(Error::MachineBusy(self.id));
        }
        guard.state.shutdown();
        Ok(())
    }

    /// Destroys every vcpu, waiting for runs in flight, then the machine.
    pub(crate) fn teardown(&self) -> Result<()> {
        let mut guard = self.write()?;
        for (cpuid, vcpu) in guard.state.vcpus.drain() {
            debug!("Machine {}: forcing vcpu {} down", self.id, cpuid);
            vcpu.destroy();
        }
        guard.state.shutdown();
        Ok(())
    }
}

pub(crate) struct MachineReadGuard<'a> {
    machine: &'a Machine,
    state: RwLockReadGuard<'a, MachineState>,
}

impl MachineReadGuard<'_> {
    pub(crate) fn vcpu(&self, cpuid: u32) -> Result<VcpuGuard<'_>> {
        self.state
            .vcpus
            .get(cpuid as usize)
            .map(|vcpu| vcpu.lock())
            .ok_or(Error::VcpuNotFound(cpuid))
    }

    pub(crate) fn vm(&self) -> &dyn Vm {
        self.state.vm()
    }

    pub(crate) fn memory(&self) -> &GuestMemory {
        &self.state.memory
    }

    pub(crate) fn info(&self) -> MachineInfo {
        MachineInfo {
            machid: self.machine.id,
            owner: self.machine.owner,
            gpa_begin: self.machine.gpa_begin,
            gpa_end: self.machine.gpa_end,
            mapped_size: self.state.memory.mapped_size(),
            segments: self.state.memory.segments(),
            vcpus: self
                .state
                .vcpus
                .indices()
                .into_iter()
                .map(|cpuid| cpuid as u32)
                .collect(),
        }
    }
}

pub(crate) struct MachineWriteGuard<'a> {
    machine: &'a Machine,
    state: RwLockWriteGuard<'a, MachineState>,
}

impl MachineWriteGuard<'_> {
    pub(crate) fn vm(&mut self) -> &mut dyn Vm {
        self.state.vm_mut()
    }

    pub(crate) fn memory_mut(&mut self) -> &mut GuestMemory {
        &mut self.state.memory
    }

    pub(crate) fn add_segment(&mut self, conf: &SegmentConf) -> Result<usize> {
        let state = &mut *self.state;
        let vm = state
            .vm
            .as_deref_mut()
            .expect("live machine without backend state");
        state
            .memory
            .add_segment(conf, |region| vm.map_memory(region).map_err(Error::Vm))
    }

    pub(crate) fn vcpu_create(&mut self, cpuid: u32, state_size: usize) -> Result<()> {
        if self.state.vcpus.contains(cpuid as usize) {
            return Err(Error::VcpuExists(cpuid));
        }
        let machid = self.machine.id;
        let backend = self.vm().create_vcpu(cpuid).map_err(|e| {
            warn!(
                "Machine {}: backend failed to create vcpu {}: {}",
                machid, cpuid, e
            );
            Error::Vm(e)
        })?;
        if let Err(e) = self
            .state
            .vcpus
            .insert_at(cpuid as usize, Vcpu::new(cpuid, state_size, backend))
        {
            panic!("vcpu slot {} checked free but taken: {}", cpuid, e);
        }
        self.machine.kick(cpuid).reset();
        Ok(())
    }

    /// Holding the write lock means no run is in flight on any vcpu.
    pub(crate) fn vcpu_destroy(&mut self, cpuid: u32) -> Result<()> {
        let vcpu = self
            .state
            .vcpus
            .remove(cpuid as usize)
            .ok_or(Error::VcpuNotFound(cpuid))?;
        vcpu.destroy();
        Ok(())
    }
}

enum MachineSlot {
    /// Taken by a `machine_create` in progress, invisible to lookups.
    Reserved,
    Live(Arc<Machine>),
}

/// Global table of machines, indexed by machid.
pub(crate) struct MachineTable {
    slots: Mutex<SlotTable<MachineSlot>>,
}

impl MachineTable {
    pub(crate) fn new(capacity: usize) -> Self {
        MachineTable {
            slots: Mutex::new(SlotTable::new(capacity)),
        }
    }

    pub(crate) fn reserve(&self) -> Result<u32> {
        self.slots
            .lock()
            .unwrap()
            .insert(MachineSlot::Reserved)
            .map(|index| index as u32)
            .map_err(|_| Error::NoFreeMachine)
    }

    /// Gives back a reservation whose machine never came to life.
    pub(crate) fn release(&self, machid: u32) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(MachineSlot::Reserved) = slots.get(machid as usize) {
            slots.remove(machid as usize);
        }
    }

    pub(crate) fn publish(&self, machid: u32, machine: Arc<Machine>) {
        let mut slots = self.slots.lock().unwrap();
        match slots.get_mut(machid as usize) {
            Some(slot @ MachineSlot::Reserved) => *slot = MachineSlot::Live(machine),
            _ => panic!("machine slot {} published without a reservation", machid),
        }
    }

    pub(crate) fn get(&self, machid: u32) -> Result<Arc<Machine>> {
        match self.slots.lock().unwrap().get(machid as usize) {
            Some(MachineSlot::Live(machine)) => Ok(machine.clone()),
            _ => Err(Error::MachineNotFound(machid)),
        }
    }

    /// Frees the slot if it still holds `machine`.
    pub(crate) fn remove(&self, machid: u32, machine: &Arc<Machine>) {
        let mut slots = self.slots.lock().unwrap();
        if let Some(MachineSlot::Live(current)) = slots.get(machid as usize) {
            if Arc::ptr_eq(current, machine) {
                slots.remove(machid as usize);
            }
        }
    }

    /// Published machines in id order.
    pub(crate) fn live(&self) -> Vec<Arc<Machine>> {
        self.slots
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(_, slot)| match slot {
                MachineSlot::Live(machine) => Some(machine.clone()),
                MachineSlot::Reserved => None,
            })
            .collect()
    }
}
