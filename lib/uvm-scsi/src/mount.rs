// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-attachment mount records and the merge rules for sharing them.
//!
//! Each attachment owns zero or more guest-visible mounts, independently
//! reference counted. Most attachments allow a single mount: repeat
//! requests merge into it, an attach-only request (empty guest path)
//! piggybacks on whatever mount exists, and an attach-only record is
//! upgraded in place when the first real mount arrives. Shared read-only
//! layer disks on Linux guests instead allow several independent mounts at
//! distinct guest paths, so sibling containers can each reference the one
//! attached layer.
//!
//! As with attachments, every method requires the registry lock and
//! performs no I/O; mounts whose guest call is in flight carry an open
//! gate.

use std::sync::Arc;

use crate::attach::{AttachmentEntry, Phase};
use crate::error::Error;
use crate::gate::Gate;
use crate::MountConfig;

pub(crate) struct MountEntry {
    pub config: MountConfig,
    pub ref_count: u32,
    pub phase: Phase,
    pub gate: Arc<Gate>,
}

/// Outcome of a mount lookup-or-create on one attachment, decided under the
/// registry lock.
pub(crate) enum MountLookup {
    /// A suitable mount exists; its refcount has been incremented. `path`
    /// is the mount's actual guest path, which for merge cases may differ
    /// from the requested one. `pending` carries the gate when its guest
    /// call is still in flight.
    Existing { path: String, pending: Option<Arc<Gate>> },
    /// The matching mount is being torn down; wait on the gate (no
    /// refcount was taken) and retry.
    Busy { gate: Arc<Gate> },
    /// A new record was created with refcount 1. `gate` is present when a
    /// guest mount call must be issued (real guest path); attach-only
    /// records are complete as created.
    Created { path: String, gate: Option<Arc<Gate>> },
    /// The existing attach-only record was renamed to the requested path
    /// and its refcount incremented; the caller owes the guest mount call.
    Upgraded { path: String, gate: Arc<Gate> },
}

/// Outcome of a mount release.
pub(crate) enum UnmountLookup {
    /// The mount (or the record as a whole) is mid add or teardown; wait
    /// and retry.
    InFlight { gate: Arc<Gate> },
    /// Refcount decremented; other users remain.
    Live,
    /// Refcount reached zero and a guest unmount call is owed: the record
    /// is now in [`Phase::Removing`] with the returned fresh gate. `unplug`
    /// is set when the attachment itself is down to its last reference.
    Teardown { path: String, unplug: bool, gate: Arc<Gate> },
    /// Refcount reached zero for an attach-only record; it has been
    /// deleted with no guest call owed.
    Removed,
}

impl AttachmentEntry {
    /// Find or create the mount for `guest_path`, applying the
    /// single-mount merge rules unless `allow_multiple`.
    pub fn lookup_or_track_mount(
        &mut self,
        guest_path: &str,
        config: &MountConfig,
        allow_multiple: bool,
    ) -> Result<MountLookup, Error> {
        if allow_multiple {
            if self.mounts.contains_key(guest_path) {
                return Ok(self.use_mount(guest_path));
            }
            return Ok(self.create_mount(guest_path, config));
        }

        // Single-mount policy: at most one record exists. An attach-only
        // request adopts it whatever its path; a real request adopts a
        // matching path, upgrades an attach-only record, and rejects a
        // different real path.
        let existing = self.mounts.keys().next().cloned();
        match existing {
            None => Ok(self.create_mount(guest_path, config)),
            Some(path) if guest_path.is_empty() || path == guest_path => {
                Ok(self.use_mount(&path))
            }
            Some(path) if path.is_empty() => {
                Ok(self.upgrade_mount(guest_path, config))
            }
            Some(_) => Err(Error::MoreMountsThanExpected),
        }
    }

    /// Release one reference on the mount for `guest_path`.
    ///
    /// An empty `guest_path` whose attach-only record was since upgraded to
    /// a real path resolves to that single record, keeping adds and
    /// releases symmetric for callers that attached without a mount.
    pub fn release_mount(
        &mut self,
        guest_path: &str,
    ) -> Result<UnmountLookup, Error> {
        if guest_path.is_empty() && self.mounts.is_empty() {
            // Nothing was ever presented to the guest (e.g. a cloned-in
            // attachment); only the attachment reference is at stake.
            return Ok(UnmountLookup::Removed);
        }
        let path = match self.mounts.contains_key(guest_path) {
            true => guest_path.to_string(),
            false if guest_path.is_empty() && self.mounts.len() == 1 => {
                self.mounts.keys().next().cloned().unwrap()
            }
            false => return Err(Error::NotAttached),
        };

        let entry = self.mounts.get_mut(&path).expect("mount present");
        if entry.phase != Phase::Ready {
            return Ok(UnmountLookup::InFlight {
                gate: Arc::clone(&entry.gate),
            });
        }

        entry.ref_count = entry.ref_count.saturating_sub(1);
        if entry.ref_count > 0 {
            return Ok(UnmountLookup::Live);
        }

        if path.is_empty() {
            self.mounts.remove(&path);
            return Ok(UnmountLookup::Removed);
        }

        let gate = Gate::new();
        entry.phase = Phase::Removing;
        entry.gate = Arc::clone(&gate);
        Ok(UnmountLookup::Teardown {
            path,
            unplug: self.ref_count == 1,
            gate,
        })
    }

    /// Undo a refcount increment on `guest_path` whose in-flight mount call
    /// failed, identified by its gate generation.
    pub fn undo_mount_increment(&mut self, guest_path: &str, gate: &Arc<Gate>) {
        if let Some(entry) = self.mounts.get_mut(guest_path) {
            if Arc::ptr_eq(&entry.gate, gate) {
                entry.ref_count = entry.ref_count.saturating_sub(1);
            }
        }
    }

    fn use_mount(&mut self, path: &str) -> MountLookup {
        let entry = self.mounts.get_mut(path).expect("mount present");
        match entry.phase {
            Phase::Removing => {
                MountLookup::Busy { gate: Arc::clone(&entry.gate) }
            }
            Phase::Adding => {
                entry.ref_count += 1;
                MountLookup::Existing {
                    path: path.to_string(),
                    pending: Some(Arc::clone(&entry.gate)),
                }
            }
            Phase::Ready => {
                entry.ref_count += 1;
                MountLookup::Existing { path: path.to_string(), pending: None }
            }
        }
    }

    fn create_mount(
        &mut self,
        guest_path: &str,
        config: &MountConfig,
    ) -> MountLookup {
        if guest_path.is_empty() {
            self.mounts.insert(
                String::new(),
                MountEntry {
                    config: config.clone(),
                    ref_count: 1,
                    phase: Phase::Ready,
                    gate: Gate::closed(),
                },
            );
            return MountLookup::Created { path: String::new(), gate: None };
        }

        let gate = Gate::new();
        self.mounts.insert(
            guest_path.to_string(),
            MountEntry {
                config: config.clone(),
                ref_count: 1,
                phase: Phase::Adding,
                gate: Arc::clone(&gate),
            },
        );
        MountLookup::Created {
            path: guest_path.to_string(),
            gate: Some(gate),
        }
    }

    fn upgrade_mount(
        &mut self,
        guest_path: &str,
        config: &MountConfig,
    ) -> MountLookup {
        let mut entry =
            self.mounts.remove("").expect("attach-only record present");
        let gate = Gate::new();
        entry.ref_count += 1;
        entry.phase = Phase::Adding;
        entry.gate = Arc::clone(&gate);
        entry.config = config.clone();
        self.mounts.insert(guest_path.to_string(), entry);
        MountLookup::Upgraded { path: guest_path.to_string(), gate }
    }

    /// Revert [`Self::lookup_or_track_mount`]'s upgrade after its guest
    /// call failed: the record becomes attach-only again and the upgrading
    /// caller's reference is dropped.
    pub fn revert_mount_upgrade(&mut self, guest_path: &str) {
        if let Some(mut entry) = self.mounts.remove(guest_path) {
            entry.ref_count = entry.ref_count.saturating_sub(1);
            entry.phase = Phase::Ready;
            entry.gate = Gate::closed();
            self.mounts.insert(String::new(), entry);
        }
    }
}
