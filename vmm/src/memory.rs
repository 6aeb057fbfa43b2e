// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Guest physical memory layout of one machine.
//!
//! Host memory is first registered as a host mapping, then exposed to the
//! guest as segments. A segment shares the backing object of the mapping it
//! was carved from, so the memory stays alive until the machine is torn down
//! even if the mapping is unregistered first.

use std::sync::Arc;

use hypervisor::{GuestMapping, GuestMemoryMap, MemoryFault, MemoryProtection, UserMemoryRegion};
use serde::Serialize;
use vm_allocator::SlotTable;
use vm_memory::{MmapRegion, VolatileMemory};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::limits::{MAX_HMAPPINGS, MAX_SEGMENTS};
use crate::{Error, Result};

/// Payload of the `CONF_ADD_SEGMENT` configuration op, in host byte order.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct SegmentConf {
    pub gpa: u64,
    pub hva: u64,
    pub size: u64,
    /// `MemoryProtection` bits.
    pub prot: u64,
}

struct HostMapping {
    hva: u64,
    size: u64,
    region: Arc<MmapRegion>,
}

impl HostMapping {
    fn contains(&self, hva: u64, size: u64) -> bool {
        hva >= self.hva && hva - self.hva <= self.size && size <= self.size - (hva - self.hva)
    }
}

struct Segment {
    gpa: u64,
    hva: u64,
    size: u64,
    prot: MemoryProtection,
    backing: Arc<MmapRegion>,
    /// Offset of `hva` inside `backing`.
    offset: usize,
}

impl Segment {
    fn end(&self) -> u64 {
        self.gpa + self.size
    }

    fn contains(&self, gpa: u64) -> bool {
        gpa >= self.gpa && gpa < self.end()
    }
}

/// Public description of one segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SegmentInfo {
    pub slot: usize,
    pub gpa: u64,
    pub hva: u64,
    pub size: u64,
    pub prot: u32,
}

pub struct GuestMemory {
    gpa_begin: u64,
    gpa_end: u64,
    ram_limit: u64,
    segments: SlotTable<Segment>,
    hmappings: SlotTable<HostMapping>,
    mapped: u64,
}

impl GuestMemory {
    pub fn new(gpa_begin: u64, gpa_end: u64, ram_limit: u64) -> Self {
        GuestMemory {
            gpa_begin,
            gpa_end,
            ram_limit,
            segments: SlotTable::new(MAX_SEGMENTS),
            hmappings: SlotTable::new(MAX_HMAPPINGS),
            mapped: 0,
        }
    }

    /// Registers `region` and returns its host address.
    pub fn hva_map(&mut self, region: Arc<MmapRegion>) -> Result<u64> {
        let hva = region.as_ptr() as u64;
        let size = region.size() as u64;
        if self
            .hmappings
            .iter()
            .any(|(_, m)| hva < m.hva + m.size && m.hva < hva + size)
        {
            return Err(Error::HostMappingOverlap(hva));
        }
        self.hmappings
            .insert(HostMapping { hva, size, region })
            .map_err(|_| Error::NoFreeHostMapping)?;
        Ok(hva)
    }

    pub fn hva_unmap(&mut self, hva: u64) -> Result<()> {
        let slot = self
            .hmappings
            .iter()
            .find(|(_, m)| m.hva == hva)
            .map(|(slot, _)| slot)
            .ok_or(Error::HostMappingNotFound(hva))?;
        self.hmappings.remove(slot);
        Ok(())
    }

    /// Validates a new segment, lets `map` publish it to the backend, then
    /// records it. Returns the segment slot, which is also the backend slot.
    pub fn add_segment<F>(&mut self, conf: &SegmentConf, map: F) -> Result<usize>
    where
        F: FnOnce(&UserMemoryRegion) -> Result<()>,
    {
        let (gpa, size) = (conf.gpa, conf.size);
        let prot = u32::try_from(conf.prot)
            .ok()
            .and_then(MemoryProtection::from_bits);
        let (end, prot) = match (gpa.checked_add(size), prot) {
            (Some(end), Some(prot)) if size > 0 && conf.hva.checked_add(size).is_some() => {
                (end, prot)
            }
            _ => return Err(Error::InvalidSegment { gpa, size }),
        };
        if gpa < self.gpa_begin || end > self.gpa_end {
            return Err(Error::SegmentOutOfWindow { gpa, size });
        }
        if self
            .segments
            .iter()
            .any(|(_, s)| gpa < s.end() && s.gpa < end)
        {
            return Err(Error::SegmentOverlap { gpa, size });
        }
        if size > self.ram_limit - self.mapped {
            return Err(Error::RamLimitExceeded {
                mapped: self.mapped,
                requested: size,
            });
        }
        let slot = self.segments.next_free().ok_or(Error::NoFreeSegment)?;
        let mapping = self
            .hmappings
            .iter()
            .map(|(_, m)| m)
            .find(|m| m.contains(conf.hva, size))
            .ok_or(Error::HvaNotMapped(conf.hva))?;

        let segment = Segment {
            gpa,
            hva: conf.hva,
            size,
            prot,
            backing: mapping.region.clone(),
            offset: (conf.hva - mapping.hva) as usize,
        };
        map(&UserMemoryRegion {
            slot: slot as u32,
            gpa,
            size,
            hva: conf.hva,
            prot,
        })?;
        if let Err(e) = self.segments.insert_at(slot, segment) {
            panic!("free segment slot {} taken: {}", slot, e);
        }
        self.mapped += size;
        Ok(slot)
    }

    fn lookup(&self, gpa: u64) -> Option<&Segment> {
        self.segments
            .iter()
            .map(|(_, s)| s)
            .find(|s| s.contains(gpa))
    }

    /// Host address backing `gpa`, with the segment's protection.
    pub fn translate(&self, gpa: u64) -> Option<(u64, MemoryProtection)> {
        self.lookup(gpa)
            .map(|s| (s.hva + (gpa - s.gpa), s.prot))
    }

    /// Bytes of guest memory mapped so far.
    pub fn mapped_size(&self) -> u64 {
        self.mapped
    }

    pub fn segments(&self) -> Vec<SegmentInfo> {
        self.segments
            .iter()
            .map(|(slot, s)| SegmentInfo {
                slot,
                gpa: s.gpa,
                hva: s.hva,
                size: s.size,
                prot: s.prot.bits(),
            })
            .collect()
    }

    /// Drops every segment and host mapping, releasing the backing memory.
    pub fn clear(&mut self) {
        self.segments.drain();
        self.hmappings.drain();
        self.mapped = 0;
    }

    fn segment_range(
        &self,
        gpa: u64,
        len: usize,
    ) -> std::result::Result<(&Segment, usize), MemoryFault> {
        let segment = self.lookup(gpa).ok_or(MemoryFault::NotMapped(gpa))?;
        let offset = gpa - segment.gpa;
        if len as u64 > segment.size - offset {
            return Err(MemoryFault::Boundary(gpa));
        }
        Ok((segment, segment.offset + offset as usize))
    }
}

impl GuestMemoryMap for GuestMemory {
    fn translate(&self, gpa: u64) -> std::result::Result<GuestMapping, MemoryFault> {
        let segment = self.lookup(gpa).ok_or(MemoryFault::NotMapped(gpa))?;
        let offset = gpa - segment.gpa;
        Ok(GuestMapping {
            gpa,
            hva: segment.hva + offset,
            len: segment.size - offset,
            prot: segment.prot,
        })
    }

    fn read(&self, gpa: u64, buf: &mut [u8]) -> std::result::Result<(), MemoryFault> {
        let (segment, offset) = self.segment_range(gpa, buf.len())?;
        let slice = segment
            .backing
            .get_slice(offset, buf.len())
            .map_err(|_| MemoryFault::Boundary(gpa))?;
        slice.copy_to(buf);
        Ok(())
    }

    fn write(&self, gpa: u64, buf: &[u8]) -> std::result::Result<(), MemoryFault> {
        let (segment, offset) = self.segment_range(gpa, buf.len())?;
        let slice = segment
            .backing
            .get_slice(offset, buf.len())
            .map_err(|_| MemoryFault::Boundary(gpa))?;
        slice.copy_from(buf);
        Ok(())
    }
}
