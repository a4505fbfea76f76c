// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Attachment registry state.
//!
//! One [`AttachmentEntry`] exists per distinct host disk resource made
//! visible to the VM, keyed by host path and occupying one slot of the
//! controller/LUN grid. Entries are reference counted: concurrent callers
//! attaching the same disk share one entry (and one host-side attach call).
//!
//! All methods here require the registry lock; none of them perform I/O.
//! The lock is never held across host or guest calls — entries created
//! here carry an open [`Gate`] which late arrivals wait on outside the
//! lock.

use std::collections::BTreeMap;
use std::sync::Arc;

use scsi_api_types::AttachmentSettings;

use crate::error::Error;
use crate::gate::Gate;
use crate::mount::MountEntry;
use crate::slots::{Slot, SlotGrid};
use crate::AttachKind;

/// Where a registry record is in its lifetime relative to the external call
/// that realizes or tears it down.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Phase {
    /// Created; the host/guest call is (or is about to be) in flight.
    Adding,
    /// The external state matches the record.
    Ready,
    /// Refcount reached zero; the teardown call is in flight.
    Removing,
}

pub(crate) struct AttachmentEntry {
    pub host_path: String,
    pub kind: AttachKind,
    pub read_only: bool,
    pub encrypted: bool,
    /// Shared read-only layer; with a Linux guest this permits multiple
    /// independent guest mounts of the one attachment.
    pub is_layer: bool,
    pub ref_count: u32,
    pub phase: Phase,
    /// Gate for the phase's in-flight call; replaced when a new phase
    /// begins.
    pub gate: Arc<Gate>,
    /// Guest-visible presentations of this attachment, keyed by guest path.
    /// The empty key is an attach-only record with no guest mount.
    pub mounts: BTreeMap<String, MountEntry>,
}

impl AttachmentEntry {
    pub fn settings(&self) -> AttachmentSettings {
        AttachmentSettings {
            path: self.host_path.clone(),
            attachment_type: self.kind.type_name().to_string(),
            read_only: self.read_only,
            extensible_virtual_disk_type: self.kind.evd_type().to_string(),
        }
    }
}

/// Outcome of an attachment lookup-or-create, decided entirely under the
/// registry lock.
pub(crate) enum AttachLookup {
    /// An entry for this host path exists; its refcount has been
    /// incremented on the caller's behalf. `pending` carries the gate to
    /// wait on when the entry's attach call is still in flight.
    Existing { slot: Slot, pending: Option<Arc<Gate>> },
    /// An entry exists but is being torn down. The caller must wait on the
    /// gate (no refcount was taken) and retry from scratch.
    Busy { gate: Arc<Gate> },
    /// A new entry was created at `slot` with refcount 1 in [`Phase::Adding`];
    /// the caller owns issuing the host attach and resolving `gate`.
    Created { slot: Slot, gate: Arc<Gate> },
}

pub(crate) struct Registry {
    grid: SlotGrid<AttachmentEntry>,
}

impl Registry {
    pub fn new(controllers: u32, luns: u32, reserved: Vec<Slot>) -> Self {
        Self { grid: SlotGrid::new(controllers, luns, reserved) }
    }

    pub fn controllers(&self) -> u32 {
        self.grid.controllers()
    }

    pub fn find_by_path(&self, host_path: &str) -> Option<Slot> {
        self.grid
            .iter()
            .find(|(_, entry)| entry.host_path == host_path)
            .map(|(slot, _)| slot)
    }

    pub fn entry(&self, slot: Slot) -> Option<&AttachmentEntry> {
        self.grid.get(slot)
    }

    pub fn entry_mut(&mut self, slot: Slot) -> Option<&mut AttachmentEntry> {
        self.grid.get_mut(slot)
    }

    /// Find the attachment for `host_path`, taking a reference on it, or
    /// allocate a slot and create one.
    pub fn lookup_or_track(
        &mut self,
        host_path: &str,
        kind: &AttachKind,
        read_only: bool,
        encrypted: bool,
        is_layer: bool,
    ) -> Result<AttachLookup, Error> {
        if let Some(slot) = self.find_by_path(host_path) {
            let entry =
                self.grid.get_mut(slot).expect("found slot is occupied");
            return Ok(match entry.phase {
                Phase::Removing => {
                    AttachLookup::Busy { gate: Arc::clone(&entry.gate) }
                }
                Phase::Adding => {
                    entry.ref_count += 1;
                    AttachLookup::Existing {
                        slot,
                        pending: Some(Arc::clone(&entry.gate)),
                    }
                }
                Phase::Ready => {
                    entry.ref_count += 1;
                    AttachLookup::Existing { slot, pending: None }
                }
            });
        }

        let slot = self.grid.find_free()?;
        let gate = Gate::new();
        self.grid.put(
            slot,
            AttachmentEntry {
                host_path: host_path.to_string(),
                kind: kind.clone(),
                read_only,
                encrypted,
                is_layer,
                ref_count: 1,
                phase: Phase::Adding,
                gate: Arc::clone(&gate),
                mounts: BTreeMap::new(),
            },
        );
        Ok(AttachLookup::Created { slot, gate })
    }

    /// Drop a record and free its slot.
    pub fn untrack(&mut self, slot: Slot) {
        self.grid.free(slot);
    }

    /// Place a fully formed record (e.g. an imported clone) at `slot`.
    pub fn put(&mut self, slot: Slot, entry: AttachmentEntry) {
        self.grid.put(slot, entry);
    }

    /// Whether `slot` exists in this VM's grid at all.
    pub fn in_bounds(&self, slot: Slot) -> bool {
        self.grid.in_bounds(slot)
    }

    /// Undo a refcount increment taken by [`Self::lookup_or_track`] whose
    /// in-flight attach turned out to fail. The gate identifies the record
    /// generation; if the failed record was already replaced by a newer one
    /// for the same path, there is nothing to undo.
    pub fn undo_increment(&mut self, slot: Slot, gate: &Arc<Gate>) {
        if let Some(entry) = self.grid.get_mut(slot) {
            if Arc::ptr_eq(&entry.gate, gate) {
                entry.ref_count = entry.ref_count.saturating_sub(1);
            }
        }
    }

    /// Whether `guest_path` is already presented by an attachment other
    /// than the one at `slot`.
    pub fn guest_path_conflict(&self, guest_path: &str, slot: Slot) -> bool {
        self.grid.iter().any(|(s, entry)| {
            s != slot && entry.mounts.contains_key(guest_path)
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (Slot, &AttachmentEntry)> {
        self.grid.iter()
    }
}
