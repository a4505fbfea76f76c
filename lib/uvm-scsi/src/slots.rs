// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed controller × LUN slot grid.
//!
//! Every attachment occupies exactly one cell of the grid for its lifetime.
//! Allocation scans controllers in order, then LUNs in order, and hands out
//! the first free cell, so slot assignment is deterministic for a given
//! sequence of operations. All access happens under the owning registry's
//! lock.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// A (controller, LUN) coordinate in the device grid.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
)]
pub struct Slot {
    pub controller: u32,
    pub lun: u32,
}

impl Slot {
    pub const fn new(controller: u32, lun: u32) -> Self {
        Self { controller, lun }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "controller {} LUN {}", self.controller, self.lun)
    }
}

/// Arena of per-slot cells with first-free allocation.
pub(crate) struct SlotGrid<T> {
    cells: Vec<Vec<Option<T>>>,
    reserved: Vec<Slot>,
}

impl<T> SlotGrid<T> {
    pub fn new(controllers: u32, luns: u32, reserved: Vec<Slot>) -> Self {
        let cells = (0..controllers)
            .map(|_| (0..luns).map(|_| None).collect())
            .collect();
        Self { cells, reserved }
    }

    pub fn controllers(&self) -> u32 {
        self.cells.len() as u32
    }

    /// Find the first free, unreserved coordinate without claiming it; the
    /// caller claims it by inserting an entry via [`Self::put`].
    pub fn find_free(&self) -> Result<Slot, Error> {
        for (controller, luns) in self.cells.iter().enumerate() {
            for (lun, cell) in luns.iter().enumerate() {
                let slot = Slot::new(controller as u32, lun as u32);
                if cell.is_none() && !self.reserved.contains(&slot) {
                    return Ok(slot);
                }
            }
        }
        Err(Error::NoAvailableLocation)
    }

    /// Occupy `slot` with `value`.
    ///
    /// # Panics
    ///
    /// If the cell is already occupied; allocation and insertion happen under
    /// one lock, so an occupied cell here is a registry logic error.
    pub fn put(&mut self, slot: Slot, value: T) {
        let cell = self.cell_mut(slot).expect("slot within grid bounds");
        assert!(cell.is_none(), "slot {slot} should be free");
        *cell = Some(value);
    }

    /// Clear a cell. Freeing an already-free cell is a no-op; this is only
    /// called from teardown paths that already own the entry.
    pub fn free(&mut self, slot: Slot) {
        if let Some(cell) = self.cell_mut(slot) {
            *cell = None;
        }
    }

    pub fn get(&self, slot: Slot) -> Option<&T> {
        self.cells
            .get(slot.controller as usize)?
            .get(slot.lun as usize)?
            .as_ref()
    }

    pub fn get_mut(&mut self, slot: Slot) -> Option<&mut T> {
        self.cell_mut(slot)?.as_mut()
    }

    pub fn in_bounds(&self, slot: Slot) -> bool {
        self.cells
            .get(slot.controller as usize)
            .map(|luns| (slot.lun as usize) < luns.len())
            .unwrap_or(false)
    }

    /// Iterate occupied cells in allocation order.
    pub fn iter(&self) -> impl Iterator<Item = (Slot, &T)> {
        self.cells.iter().enumerate().flat_map(|(controller, luns)| {
            luns.iter().enumerate().filter_map(move |(lun, cell)| {
                cell.as_ref()
                    .map(|v| (Slot::new(controller as u32, lun as u32), v))
            })
        })
    }

    fn cell_mut(&mut self, slot: Slot) -> Option<&mut Option<T>> {
        self.cells.get_mut(slot.controller as usize)?.get_mut(slot.lun as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_scans_controller_then_lun() {
        let mut grid: SlotGrid<u32> = SlotGrid::new(2, 2, Vec::new());

        for expect in [
            Slot::new(0, 0),
            Slot::new(0, 1),
            Slot::new(1, 0),
            Slot::new(1, 1),
        ] {
            let slot = grid.find_free().unwrap();
            assert_eq!(slot, expect);
            grid.put(slot, 0);
        }
        assert!(matches!(grid.find_free(), Err(Error::NoAvailableLocation)));

        // Freeing re-opens exactly that coordinate.
        grid.free(Slot::new(0, 1));
        assert_eq!(grid.find_free().unwrap(), Slot::new(0, 1));
    }

    #[test]
    fn reserved_slots_are_skipped() {
        let mut grid: SlotGrid<u32> =
            SlotGrid::new(1, 3, vec![Slot::new(0, 0), Slot::new(0, 2)]);
        let slot = grid.find_free().unwrap();
        assert_eq!(slot, Slot::new(0, 1));
        grid.put(slot, 7);
        assert!(matches!(grid.find_free(), Err(Error::NoAvailableLocation)));
    }

    #[test]
    fn free_is_idempotent() {
        let mut grid: SlotGrid<u32> = SlotGrid::new(1, 1, Vec::new());
        grid.put(Slot::new(0, 0), 3);
        grid.free(Slot::new(0, 0));
        grid.free(Slot::new(0, 0));
        // Out-of-range frees are ignored rather than panicking.
        grid.free(Slot::new(5, 5));
        assert!(grid.get(Slot::new(0, 0)).is_none());
    }

    #[test]
    fn zero_controllers_never_allocates() {
        let grid: SlotGrid<u32> = SlotGrid::new(0, 64, Vec::new());
        assert_eq!(grid.controllers(), 0);
        assert!(matches!(grid.find_free(), Err(Error::NoAvailableLocation)));
    }
}
