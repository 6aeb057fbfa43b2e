// Copyright 2018 The Chromium OS Authors. All rights reserved.
// Copyright © 2019 Intel Corporation
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// SPDX-License-Identifier: Apache-2.0 AND BSD-3-Clause

use std::result;

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("Slot index {0} is beyond the table capacity")]
    Overflow(usize),
    #[error("Slot {0} is already occupied")]
    Duplicated(usize),
    #[error("No free slot left")]
    Full,
}

pub type Result<T> = result::Result<T, Error>;

/// Fixed-capacity table of slots with an explicit occupancy flag per slot.
///
/// The capacity is chosen at construction and never grows. Slot indices are
/// stable for the lifetime of the occupant: freeing a slot never moves any
/// other one, which makes the index usable as an external identifier.
///
/// # Examples
///
/// ```
/// # use vm_allocator::SlotTable;
/// let mut table = SlotTable::new(2);
/// assert_eq!(table.insert("a"), Ok(0));
/// assert_eq!(table.insert("b"), Ok(1));
/// assert!(table.insert("c").is_err());
/// assert_eq!(table.remove(0), Some("a"));
/// assert_eq!(table.insert("d"), Ok(0));
/// ```
#[derive(Debug)]
pub struct SlotTable<T> {
    slots: Vec<Option<T>>,
    used: usize,
}

impl<T> SlotTable<T> {
    /// Creates a table able to hold `capacity` occupants.
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        SlotTable { slots, used: 0 }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of occupied slots.
    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn is_full(&self) -> bool {
        self.used == self.slots.len()
    }

    /// Index `insert` would pick next.
    pub fn next_free(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_none())
    }

    /// Stores `value` in the lowest free slot and returns its index.
    pub fn insert(&mut self, value: T) -> Result<usize> {
        let index = self.next_free().ok_or(Error::Full)?;
        self.slots[index] = Some(value);
        self.used += 1;
        Ok(index)
    }

    /// Stores `value` at a caller-chosen index.
    pub fn insert_at(&mut self, index: usize, value: T) -> Result<()> {
        let slot = self.slots.get_mut(index).ok_or(Error::Overflow(index))?;
        if slot.is_some() {
            return Err(Error::Duplicated(index));
        }
        *slot = Some(value);
        self.used += 1;
        Ok(())
    }

    pub fn contains(&self, index: usize) -> bool {
        self.get(index).is_some()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index).and_then(|s| s.as_ref())
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index).and_then(|s| s.as_mut())
    }

    /// Frees a slot, handing back its occupant.
    pub fn remove(&mut self, index: usize) -> Option<T> {
        let value = self.slots.get_mut(index).and_then(|s| s.take());
        if value.is_some() {
            self.used -= 1;
        }
        value
    }

    /// Frees every slot, in index order.
    pub fn drain(&mut self) -> Vec<(usize, T)> {
        self.used = 0;
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(index, s)| s.take().map(|v| (index, v)))
            .collect()
    }

    /// Iterates over the occupied slots in index order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, s)| s.as_ref().map(|v| (index, v)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (usize, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .filter_map(|(index, s)| s.as_mut().map(|v| (index, v)))
    }

    /// Occupied slot indices in ascending order.
    pub fn indices(&self) -> Vec<usize> {
        self.iter().map(|(index, _)| index).collect()
    }
}
