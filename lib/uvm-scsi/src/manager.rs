// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The SCSI manager: the entrypoint for attaching disks to a utility VM
//! and mounting them in its guest OS.
//!
//! Adds run in two phases against the shared registry. The attachment
//! phase finds or creates the per-disk attachment (one slot, one host-side
//! attach, shared by every caller adding the same host path); the mount
//! phase finds or creates the guest-visible mount under that attachment.
//! Removal reverses the phases: the guest gives up the mount before the
//! host gives up the device.
//!
//! Both phases follow the same locking protocol: decide under the registry
//! lock, perform host/guest I/O outside it, then settle the record under
//! the lock again. Callers that lose the race to create a record wait on
//! its gate (see [`crate::gate`]) and inherit the winner's outcome.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use slog::{debug, warn, Logger};

use crate::access::{AccessGrant, AccessKind};
use crate::attach::{AttachLookup, Phase, Registry};
use crate::backend::{DiskParams, GuestBackend, HostBackend};
use crate::dispatch::{Dispatch, GuestOp, HostOp};
use crate::error::Error;
use crate::gate::Gate;
use crate::mount::{MountLookup, UnmountLookup};
use crate::probes;
use crate::slots::Slot;
use crate::verity::VerityReader;
use crate::{AttachKind, GuestOs, MountConfig};

/// Static configuration for one VM's SCSI topology.
#[derive(Clone, Debug)]
pub struct Config {
    /// Identity of the VM, as understood by the access-grant service.
    pub vm_id: String,
    pub guest_os: GuestOs,
    /// Number of SCSI controllers exposed to the guest. May be zero, in
    /// which case every add fails with [`Error::NoScsiControllers`].
    pub controllers: u32,
    pub luns_per_controller: u32,
    /// Slots never handed out by the allocator, e.g. the boot scratch disk
    /// attached outside this manager.
    pub reserved_slots: Vec<Slot>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vm_id: String::new(),
            guest_os: GuestOs::Linux,
            controllers: 4,
            luns_per_controller: 64,
            reserved_slots: Vec::new(),
        }
    }
}

pub(crate) struct Inner {
    pub state: Mutex<Registry>,
    pub dispatch: Dispatch,
    pub access: Arc<dyn AccessGrant>,
    pub guest_os: GuestOs,
    pub vm_id: String,
    pub log: Logger,
}

/// Tracks and manipulates the SCSI devices of one utility VM.
#[derive(Clone)]
pub struct Manager {
    pub(crate) inner: Arc<Inner>,
}

struct AddRequest {
    host_path: String,
    kind: AttachKind,
    read_only: bool,
    encrypted: bool,
    is_layer: bool,
    guest_path: String,
    config: MountConfig,
    access: AccessKind,
}

impl Manager {
    /// Create a manager over the given backends.
    ///
    /// `guest` is the control channel into the guest OS, if one is up;
    /// without it, only host-side changes are performed.
    ///
    /// # Panics
    ///
    /// If `config.controllers` exceeds the platform controller table.
    pub fn new(
        config: Config,
        host: Arc<dyn HostBackend>,
        guest: Option<Arc<dyn GuestBackend>>,
        access: Arc<dyn AccessGrant>,
        verity: Arc<dyn VerityReader>,
        log: Logger,
    ) -> Self {
        assert!(
            config.controllers as usize
                <= scsi_api_types::SCSI_CONTROLLER_IDS.len(),
            "controller count exceeds platform limit"
        );
        let dispatch = Dispatch::new(
            host,
            guest,
            verity,
            config.guest_os,
            log.clone(),
        );
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(Registry::new(
                    config.controllers,
                    config.luns_per_controller,
                    config.reserved_slots,
                )),
                dispatch,
                access,
                guest_os: config.guest_os,
                vm_id: config.vm_id,
                log,
            }),
        }
    }

    /// Attach a virtual disk (VHD) to the VM and, when `guest_path` is
    /// non-empty, mount it in the guest.
    ///
    /// Attaching the same host path again shares the existing attachment.
    /// `is_layer` marks a shared read-only layer disk, which (on Linux
    /// guests) may be mounted at several distinct guest paths at once.
    pub async fn add_virtual_disk(
        &self,
        host_path: &str,
        read_only: bool,
        encrypted: bool,
        is_layer: bool,
        guest_path: &str,
        config: MountConfig,
        access: AccessKind,
    ) -> Result<Mount, Error> {
        self.add(AddRequest {
            host_path: host_path.to_string(),
            kind: AttachKind::VirtualDisk,
            read_only,
            encrypted,
            is_layer,
            guest_path: guest_path.to_string(),
            config,
            access,
        })
        .await
    }

    /// Attach a physical disk on the host directly to the VM.
    pub async fn add_physical_disk(
        &self,
        host_path: &str,
        read_only: bool,
        guest_path: &str,
        config: MountConfig,
        access: AccessKind,
    ) -> Result<Mount, Error> {
        self.add(AddRequest {
            host_path: host_path.to_string(),
            kind: AttachKind::PassThru,
            read_only,
            encrypted: false,
            is_layer: false,
            guest_path: guest_path.to_string(),
            config,
            access,
        })
        .await
    }

    /// Attach an extensible virtual disk: a resource surfaced by a host
    /// driver speaking the synthetic SCSI interface rather than a file.
    /// `host_path` must be of the form `evd://<type>/<mount-path>`, and a
    /// guest path is required.
    pub async fn add_extensible_virtual_disk(
        &self,
        host_path: &str,
        read_only: bool,
        guest_path: &str,
        config: MountConfig,
    ) -> Result<Mount, Error> {
        if guest_path.is_empty() {
            return Err(Error::EvdGuestPathRequired);
        }
        let (evd_type, mount_path) = parse_evd_path(host_path)?;
        self.add(AddRequest {
            host_path: mount_path,
            kind: AttachKind::ExtensibleVirtualDisk { evd_type },
            read_only,
            encrypted: false,
            is_layer: false,
            guest_path: guest_path.to_string(),
            config,
            access: AccessKind::Noop,
        })
        .await
    }

    /// Release one reference on the mount of `host_path` at `guest_path`
    /// (empty for attach-only references), unmounting and detaching when
    /// the respective refcounts reach zero.
    pub async fn remove_mount(
        &self,
        host_path: &str,
        guest_path: &str,
    ) -> Result<(), Error> {
        let (slot, unplugged) =
            self.unmount_phase(host_path, guest_path).await?;
        // When the final unmount already told the guest to unplug the
        // device, the detach below skips its own eject notification.
        self.release_attachment_inner(slot, host_path, !unplugged).await
    }

    async fn add(&self, req: AddRequest) -> Result<Mount, Error> {
        // Grant the guest OS access to the backing file before any registry
        // mutation. Extensible virtual disks are not files and take no
        // grant.
        if !matches!(req.kind, AttachKind::ExtensibleVirtualDisk { .. }) {
            self.inner
                .access
                .grant(&self.inner.vm_id, &req.host_path, req.access)
                .await
                .map_err(|source| Error::AccessGrant {
                    path: req.host_path.clone(),
                    source,
                })?;
        }

        let slot = self.attach_phase(&req).await?;
        match self.mount_phase(slot, &req).await {
            Ok(guest_path) => Ok(Mount {
                mgr: self.clone(),
                slot,
                host_path: req.host_path,
                guest_path,
                released: AtomicBool::new(false),
            }),
            Err(err) => {
                // Unwind this caller's attachment reference; the disk stays
                // attached if other callers still hold it.
                if let Err(rollback) =
                    self.release_attachment(slot, &req.host_path).await
                {
                    warn!(self.inner.log,
                        "failed to roll back attachment after mount failure";
                        "hostPath" => %req.host_path,
                        "error" => %rollback,
                    );
                }
                Err(err)
            }
        }
    }

    /// Find or create the attachment for the request's host path, returning
    /// its slot with one reference taken.
    async fn attach_phase(&self, req: &AddRequest) -> Result<Slot, Error> {
        // A gate that resolved with an error but whose record is still in
        // place marks an abandoned operation (its initiator was cancelled
        // mid-call). Meeting the same gate twice means the record is not
        // going to settle; give up rather than spin.
        let mut abandoned: Option<(Arc<Gate>, Arc<Error>)> = None;
        loop {
            let lookup = {
                let mut state = self.inner.state.lock().unwrap();
                if state.controllers() == 0 {
                    return Err(Error::NoScsiControllers);
                }
                state.lookup_or_track(
                    &req.host_path,
                    &req.kind,
                    req.read_only,
                    req.encrypted,
                    req.is_layer,
                )?
            };

            match lookup {
                AttachLookup::Existing { slot, pending: None } => {
                    return Ok(slot)
                }
                AttachLookup::Existing { slot, pending: Some(gate) } => {
                    match gate.wait().await {
                        // Our reference was counted before the wait, so the
                        // completed attachment cannot be torn down from
                        // under us.
                        Ok(()) => return Ok(slot),
                        Err(err) => {
                            let mut state =
                                self.inner.state.lock().unwrap();
                            state.undo_increment(slot, &gate);
                            return Err(Error::Shared(err));
                        }
                    }
                }
                AttachLookup::Busy { gate } => {
                    // The attachment is being torn down; wait it out and
                    // retry from scratch. Its outcome is not ours to
                    // propagate.
                    if let Some((prev, err)) = &abandoned {
                        if Arc::ptr_eq(prev, &gate) {
                            return Err(Error::Shared(Arc::clone(err)));
                        }
                    }
                    if let Err(err) = gate.wait().await {
                        abandoned = Some((gate, err));
                    }
                    continue;
                }
                AttachLookup::Created { slot, gate } => {
                    return self.host_attach(slot, gate, req).await;
                }
            }
        }
    }

    /// Issue the host-side attach for a newly created attachment record,
    /// resolving its gate with the outcome.
    async fn host_attach(
        &self,
        slot: Slot,
        gate: Arc<Gate>,
        req: &AddRequest,
    ) -> Result<Slot, Error> {
        let guard = gate.arm();
        let settings = {
            let state = self.inner.state.lock().unwrap();
            state
                .entry(slot)
                .expect("created entry is present")
                .settings()
        };

        let res = self
            .inner
            .dispatch
            .modify(Some(HostOp::Attach { slot, settings }), None)
            .await;

        match res {
            Ok(()) => {
                let mut state = self.inner.state.lock().unwrap();
                if let Some(entry) = state.entry_mut(slot) {
                    entry.phase = Phase::Ready;
                }
                drop(state);
                guard.complete(Ok(()));
                debug!(self.inner.log,
                    "attached SCSI device";
                    "hostPath" => %req.host_path,
                    "slot" => %slot,
                );
                probes::scsi_attach!(|| (
                    slot.controller,
                    slot.lun,
                    req.host_path.clone()
                ));
                Ok(slot)
            }
            Err(err) => {
                let mut state = self.inner.state.lock().unwrap();
                state.untrack(slot);
                drop(state);
                let err = Arc::new(err);
                guard.complete(Err(Arc::clone(&err)));
                Err(Error::Shared(err))
            }
        }
    }

    /// Find or create the mount for the request's guest path under the
    /// attachment at `slot`, returning the mount's actual guest path.
    async fn mount_phase(
        &self,
        slot: Slot,
        req: &AddRequest,
    ) -> Result<String, Error> {
        let allow_multiple =
            req.is_layer && self.inner.guest_os == GuestOs::Linux;

        // Guard against records abandoned by a cancelled initiator, as in
        // [`Self::attach_phase`].
        let mut abandoned: Option<(Arc<Gate>, Arc<Error>)> = None;
        loop {
            let lookup = {
                let mut state = self.inner.state.lock().unwrap();
                if !req.guest_path.is_empty()
                    && state.guest_path_conflict(&req.guest_path, slot)
                {
                    return Err(Error::AlreadyAttached);
                }
                let entry =
                    state.entry_mut(slot).ok_or(Error::NotAttached)?;
                entry.lookup_or_track_mount(
                    &req.guest_path,
                    &req.config,
                    allow_multiple,
                )?
            };

            match lookup {
                MountLookup::Existing { path, pending: None } => {
                    return Ok(path)
                }
                MountLookup::Existing { path, pending: Some(gate) } => {
                    match gate.wait().await {
                        Ok(()) => return Ok(path),
                        Err(err) => {
                            let mut state =
                                self.inner.state.lock().unwrap();
                            if let Some(entry) = state.entry_mut(slot) {
                                entry.undo_mount_increment(&path, &gate);
                            }
                            return Err(Error::Shared(err));
                        }
                    }
                }
                MountLookup::Busy { gate } => {
                    if let Some((prev, err)) = &abandoned {
                        if Arc::ptr_eq(prev, &gate) {
                            return Err(Error::Shared(Arc::clone(err)));
                        }
                    }
                    if let Err(err) = gate.wait().await {
                        abandoned = Some((gate, err));
                    }
                    continue;
                }
                MountLookup::Created { path, gate: None } => {
                    // Attach-only record; nothing to ask of the guest.
                    return Ok(path);
                }
                MountLookup::Created { path, gate: Some(gate) } => {
                    let guard = gate.arm();
                    match self.guest_mount(slot, &path, req).await {
                        Ok(()) => {
                            self.settle_mount(slot, &path);
                            guard.complete(Ok(()));
                            return Ok(path);
                        }
                        Err(err) => {
                            let mut state =
                                self.inner.state.lock().unwrap();
                            if let Some(entry) = state.entry_mut(slot) {
                                entry.mounts.remove(&path);
                            }
                            drop(state);
                            let err = Arc::new(err);
                            guard.complete(Err(Arc::clone(&err)));
                            return Err(Error::Shared(err));
                        }
                    }
                }
                MountLookup::Upgraded { path, gate } => {
                    let guard = gate.arm();
                    match self.guest_mount(slot, &path, req).await {
                        Ok(()) => {
                            self.settle_mount(slot, &path);
                            guard.complete(Ok(()));
                            return Ok(path);
                        }
                        Err(err) => {
                            let mut state =
                                self.inner.state.lock().unwrap();
                            if let Some(entry) = state.entry_mut(slot) {
                                entry.revert_mount_upgrade(&path);
                            }
                            drop(state);
                            let err = Arc::new(err);
                            guard.complete(Err(Arc::clone(&err)));
                            return Err(Error::Shared(err));
                        }
                    }
                }
            }
        }
    }

    async fn guest_mount(
        &self,
        slot: Slot,
        path: &str,
        req: &AddRequest,
    ) -> Result<(), Error> {
        let res = self
            .inner
            .dispatch
            .modify(
                None,
                Some(GuestOp::Mount {
                    slot,
                    path: path.to_string(),
                    host_path: req.host_path.clone(),
                    disk: DiskParams {
                        read_only: req.read_only,
                        encrypted: req.encrypted,
                        config: req.config.clone(),
                    },
                }),
            )
            .await;
        if res.is_ok() {
            debug!(self.inner.log,
                "mounted SCSI device in guest";
                "hostPath" => %req.host_path,
                "guestPath" => path,
                "slot" => %slot,
            );
            probes::scsi_mount!(|| (
                slot.controller,
                slot.lun,
                path.to_string()
            ));
        }
        res
    }

    fn settle_mount(&self, slot: Slot, path: &str) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(entry) = state.entry_mut(slot) {
            if let Some(mount) = entry.mounts.get_mut(path) {
                mount.phase = Phase::Ready;
            }
        }
    }

    /// Release one mount reference, issuing the guest unmount when the
    /// mount's refcount reaches zero. Returns the attachment's slot for the
    /// follow-on attachment release, and whether the guest was already told
    /// to unplug the device.
    async fn unmount_phase(
        &self,
        host_path: &str,
        guest_path: &str,
    ) -> Result<(Slot, bool), Error> {
        // Guard against records abandoned by a cancelled initiator, as in
        // [`Self::attach_phase`].
        let mut abandoned: Option<(Arc<Gate>, Arc<Error>)> = None;
        loop {
            enum Action {
                Wait(Arc<Gate>),
                Done(Slot),
                Unmount {
                    slot: Slot,
                    path: String,
                    disk: DiskParams,
                    unplug: bool,
                    gate: Arc<Gate>,
                },
            }

            let action = {
                let mut state = self.inner.state.lock().unwrap();
                let slot = state
                    .find_by_path(host_path)
                    .ok_or(Error::NotAttached)?;
                let entry =
                    state.entry_mut(slot).expect("found slot is occupied");
                match entry.phase {
                    // An in-flight attach or teardown settles first.
                    Phase::Adding | Phase::Removing => {
                        Action::Wait(Arc::clone(&entry.gate))
                    }
                    Phase::Ready => match entry.release_mount(guest_path)? {
                        UnmountLookup::InFlight { gate } => {
                            Action::Wait(gate)
                        }
                        UnmountLookup::Live | UnmountLookup::Removed => {
                            Action::Done(slot)
                        }
                        UnmountLookup::Teardown { path, unplug, gate } => {
                            let disk = DiskParams {
                                read_only: entry.read_only,
                                encrypted: entry.encrypted,
                                config: entry
                                    .mounts
                                    .get(&path)
                                    .map(|m| m.config.clone())
                                    .unwrap_or_default(),
                            };
                            Action::Unmount { slot, path, disk, unplug, gate }
                        }
                    },
                }
            };

            match action {
                Action::Wait(gate) => {
                    if let Some((prev, err)) = &abandoned {
                        if Arc::ptr_eq(prev, &gate) {
                            return Err(Error::Shared(Arc::clone(err)));
                        }
                    }
                    if let Err(err) = gate.wait().await {
                        abandoned = Some((gate, err));
                    }
                    continue;
                }
                Action::Done(slot) => return Ok((slot, false)),
                Action::Unmount { slot, path, disk, unplug, gate } => {
                    let guard = gate.arm();
                    let res = self
                        .inner
                        .dispatch
                        .modify(
                            None,
                            Some(GuestOp::Unmount {
                                slot,
                                path: path.clone(),
                                host_path: host_path.to_string(),
                                disk,
                                unplug,
                            }),
                        )
                        .await;
                    match res {
                        Ok(()) => {
                            let mut state =
                                self.inner.state.lock().unwrap();
                            if let Some(entry) = state.entry_mut(slot) {
                                entry.mounts.remove(&path);
                            }
                            drop(state);
                            guard.complete(Ok(()));
                            debug!(self.inner.log,
                                "unmounted SCSI device in guest";
                                "hostPath" => host_path,
                                "guestPath" => %path,
                            );
                            probes::scsi_unmount!(|| (
                                slot.controller,
                                slot.lun,
                                path.clone()
                            ));
                            return Ok((slot, unplug));
                        }
                        Err(err) => {
                            // The guest kept its hold; the record stays (at
                            // refcount zero) so a later release can retry
                            // the unmount.
                            let mut state =
                                self.inner.state.lock().unwrap();
                            if let Some(entry) = state.entry_mut(slot) {
                                if let Some(mount) =
                                    entry.mounts.get_mut(&path)
                                {
                                    mount.phase = Phase::Ready;
                                    mount.gate = Gate::closed();
                                }
                            }
                            drop(state);
                            let err = Arc::new(err);
                            guard.complete(Err(Arc::clone(&err)));
                            return Err(Error::Shared(err));
                        }
                    }
                }
            }
        }
    }

    /// Release one attachment reference; at zero, notify the guest of the
    /// device's departure and detach it on the host.
    pub(crate) async fn release_attachment(
        &self,
        slot: Slot,
        host_path: &str,
    ) -> Result<(), Error> {
        self.release_attachment_inner(slot, host_path, true).await
    }

    async fn release_attachment_inner(
        &self,
        slot: Slot,
        host_path: &str,
        eject: bool,
    ) -> Result<(), Error> {
        let gate = {
            let mut state = self.inner.state.lock().unwrap();
            let entry =
                state.entry_mut(slot).ok_or(Error::NotAttached)?;
            entry.ref_count = entry.ref_count.saturating_sub(1);
            if entry.ref_count > 0 {
                return Ok(());
            }
            let gate = Gate::new();
            entry.phase = Phase::Removing;
            entry.gate = Arc::clone(&gate);
            gate
        };

        let guard = gate.arm();
        let res = self
            .inner
            .dispatch
            .modify(
                Some(HostOp::Detach { slot }),
                eject.then(|| GuestOp::Eject {
                    slot,
                    host_path: host_path.to_string(),
                }),
            )
            .await;

        // Success or not, the record is dropped and the slot freed: the
        // guest has already been told to let go, and keeping a half-detached
        // record would wedge the slot forever.
        let mut state = self.inner.state.lock().unwrap();
        state.untrack(slot);
        drop(state);
        guard.complete(Ok(()));

        match res {
            Ok(()) => {
                debug!(self.inner.log,
                    "detached SCSI device";
                    "hostPath" => host_path,
                    "slot" => %slot,
                );
                probes::scsi_detach!(|| (slot.controller, slot.lun));
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// The guest path at which `host_path` is mounted; empty for
    /// attach-only attachments.
    pub fn guest_path_of(&self, host_path: &str) -> Result<String, Error> {
        let state = self.inner.state.lock().unwrap();
        let slot =
            state.find_by_path(host_path).ok_or(Error::NotAttached)?;
        let entry = state.entry(slot).expect("found slot is occupied");
        Ok(entry
            .mounts
            .keys()
            .rfind(|path| !path.is_empty())
            .cloned()
            .unwrap_or_default())
    }
}

/// Handle to one reference on an attached (and possibly guest-mounted)
/// SCSI device.
pub struct Mount {
    mgr: Manager,
    slot: Slot,
    host_path: String,
    guest_path: String,
    released: AtomicBool,
}

impl Mount {
    pub fn controller(&self) -> u32 {
        self.slot.controller
    }

    pub fn lun(&self) -> u32 {
        self.slot.lun
    }

    pub fn host_path(&self) -> &str {
        &self.host_path
    }

    /// The guest path of this mount; `None` for attach-only references.
    pub fn guest_path(&self) -> Option<&str> {
        if self.guest_path.is_empty() {
            None
        } else {
            Some(self.guest_path.as_str())
        }
    }

    /// The attachment's current refcount; 0 once detached.
    pub fn ref_count(&self) -> u32 {
        let state = self.mgr.inner.state.lock().unwrap();
        state
            .entry(self.slot)
            .filter(|entry| entry.host_path == self.host_path)
            .map(|entry| entry.ref_count)
            .unwrap_or(0)
    }

    /// Release this reference. Further calls return
    /// [`Error::AlreadyReleased`].
    pub async fn release(&self) -> Result<(), Error> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyReleased);
        }
        self.mgr.remove_mount(&self.host_path, &self.guest_path).await
    }
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount")
            .field("slot", &self.slot)
            .field("host_path", &self.host_path)
            .field("guest_path", &self.guest_path)
            .field("released", &self.released)
            .finish()
    }
}

/// Split an `evd://<type>/<mount-path>` host path into its type tag and
/// mount path.
fn parse_evd_path(host_path: &str) -> Result<(String, String), Error> {
    let trimmed = host_path.strip_prefix("evd://").unwrap_or(host_path);
    match trimmed.split_once('/') {
        Some((evd_type, mount_path)) if !evd_type.is_empty() => {
            Ok((evd_type.to_string(), mount_path.to_string()))
        }
        _ => Err(Error::InvalidEvdPath(host_path.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use tokio::sync::Semaphore;

    use scsi_api_types::{
        GuestDiskSettings, GuestModifyRequest, HostModifyRequest,
        RequestType,
    };

    use crate::access::NoopAccess;
    use crate::verity::NoVerity;

    /// Host backend recording attachments by resource path, with optional
    /// failure injection and a semaphore to hold attaches in flight.
    #[derive(Default)]
    struct TestHost {
        attachments: Mutex<Vec<(String, String)>>,
        attach_calls: AtomicU32,
        detach_calls: AtomicU32,
        fail_attach: AtomicBool,
        hold_attach: Option<Arc<Semaphore>>,
    }

    #[async_trait]
    impl HostBackend for TestHost {
        async fn modify(&self, req: HostModifyRequest) -> anyhow::Result<()> {
            match req.request_type {
                RequestType::Add => {
                    self.attach_calls.fetch_add(1, Ordering::SeqCst);
                    if let Some(hold) = &self.hold_attach {
                        let _ = hold.acquire().await?;
                    }
                    if self.fail_attach.load(Ordering::SeqCst) {
                        anyhow::bail!("injected attach failure");
                    }
                    let path = req
                        .settings
                        .map(|s| s.path)
                        .unwrap_or_default();
                    self.attachments
                        .lock()
                        .unwrap()
                        .push((req.resource_path, path));
                }
                RequestType::Remove => {
                    self.detach_calls.fetch_add(1, Ordering::SeqCst);
                    self.attachments
                        .lock()
                        .unwrap()
                        .retain(|(rp, _)| *rp != req.resource_path);
                }
            }
            Ok(())
        }
    }

    impl TestHost {
        fn attachment_paths(&self) -> Vec<String> {
            self.attachments
                .lock()
                .unwrap()
                .iter()
                .map(|(_, p)| p.clone())
                .collect()
        }
    }

    /// Guest backend recording mount paths, with failure injection.
    #[derive(Default)]
    struct TestGuest {
        mounts: Mutex<Vec<String>>,
        ejects: AtomicU32,
        fail_mount: AtomicBool,
    }

    #[async_trait]
    impl GuestBackend for TestGuest {
        async fn modify(
            &self,
            req: GuestModifyRequest,
        ) -> anyhow::Result<()> {
            let settings = match req.settings {
                Some(GuestDiskSettings::Linux(s)) => s,
                other => anyhow::bail!("unexpected settings: {other:?}"),
            };
            match req.request_type {
                RequestType::Add => {
                    if self.fail_mount.load(Ordering::SeqCst) {
                        anyhow::bail!("injected mount failure");
                    }
                    self.mounts
                        .lock()
                        .unwrap()
                        .push(settings.mount_path);
                }
                RequestType::Remove => {
                    if settings.mount_path.is_empty() {
                        assert!(settings.unplug);
                        self.ejects.fetch_add(1, Ordering::SeqCst);
                    } else {
                        self.mounts
                            .lock()
                            .unwrap()
                            .retain(|p| *p != settings.mount_path);
                    }
                }
            }
            Ok(())
        }
    }

    impl TestGuest {
        fn mount_paths(&self) -> Vec<String> {
            self.mounts.lock().unwrap().clone()
        }
    }

    /// Discard logs by default; set `TEST_LOG=1` to see them.
    fn test_log() -> Logger {
        use slog::Drain;

        if std::env::var_os("TEST_LOG").is_some() {
            let decorator = slog_term::TermDecorator::new().build();
            let drain = slog_term::FullFormat::new(decorator).build().fuse();
            let drain = slog_async::Async::new(drain).build().fuse();
            Logger::root(drain, slog::o!())
        } else {
            Logger::root(slog::Discard, slog::o!())
        }
    }

    fn manager(
        config: Config,
        host: &Arc<TestHost>,
        guest: &Arc<TestGuest>,
    ) -> Manager {
        Manager::new(
            config,
            Arc::clone(host) as Arc<dyn HostBackend>,
            Some(Arc::clone(guest) as Arc<dyn GuestBackend>),
            Arc::new(NoopAccess),
            Arc::new(NoVerity),
            test_log(),
        )
    }

    fn small_config(controllers: u32, luns: u32) -> Config {
        Config {
            controllers,
            luns_per_controller: luns,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn add_add_remove_remove() {
        let host = Arc::new(TestHost::default());
        let guest = Arc::new(TestGuest::default());
        let mgr = manager(small_config(4, 64), &host, &guest);

        let m1 = mgr
            .add_virtual_disk(
                "/disk",
                true,
                false,
                false,
                "",
                MountConfig::default(),
                AccessKind::Noop,
            )
            .await
            .unwrap();
        let m2 = mgr
            .add_virtual_disk(
                "/disk",
                true,
                false,
                false,
                "",
                MountConfig::default(),
                AccessKind::Noop,
            )
            .await
            .unwrap();

        assert_eq!((m1.controller(), m1.lun()), (0, 0));
        assert_eq!((m2.controller(), m2.lun()), (0, 0));
        assert_eq!(m2.ref_count(), 2);
        assert_eq!(host.attachment_paths(), vec!["/disk".to_string()]);
        assert_eq!(host.attach_calls.load(Ordering::SeqCst), 1);

        m1.release().await.unwrap();
        assert_eq!(m2.ref_count(), 1);
        m2.release().await.unwrap();

        assert!(host.attachment_paths().is_empty());
        assert_eq!(host.detach_calls.load(Ordering::SeqCst), 1);
        // The guest was told the device went away.
        assert_eq!(guest.ejects.load(Ordering::SeqCst), 1);

        assert!(matches!(
            m2.release().await,
            Err(Error::AlreadyReleased)
        ));
    }

    #[tokio::test]
    async fn attach_only_merges_with_real_mount() {
        let host = Arc::new(TestHost::default());
        let guest = Arc::new(TestGuest::default());
        let mgr = manager(small_config(4, 64), &host, &guest);

        let m1 = mgr
            .add_virtual_disk(
                "/disk",
                false,
                false,
                false,
                "",
                MountConfig::default(),
                AccessKind::Noop,
            )
            .await
            .unwrap();
        assert!(m1.guest_path().is_none());
        assert!(guest.mount_paths().is_empty());

        // The real mount upgrades the attach-only record in place.
        let m2 = mgr
            .add_virtual_disk(
                "/disk",
                false,
                false,
                false,
                "/mnt1",
                MountConfig::default(),
                AccessKind::Noop,
            )
            .await
            .unwrap();
        assert_eq!(m2.guest_path(), Some("/mnt1"));
        assert_eq!(guest.mount_paths(), vec!["/mnt1".to_string()]);
        assert_eq!(m2.ref_count(), 2);

        // A later attach-only caller adopts the real mount.
        let m3 = mgr
            .add_virtual_disk(
                "/disk",
                false,
                false,
                false,
                "",
                MountConfig::default(),
                AccessKind::Noop,
            )
            .await
            .unwrap();
        assert_eq!(m3.guest_path(), Some("/mnt1"));
        assert_eq!(guest.mount_paths(), vec!["/mnt1".to_string()]);

        // A second distinct real path is a contract violation.
        let err = mgr
            .add_virtual_disk(
                "/disk",
                false,
                false,
                false,
                "/mnt2",
                MountConfig::default(),
                AccessKind::Noop,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err.root_cause(),
            Error::MoreMountsThanExpected
        ));

        m3.release().await.unwrap();
        m2.release().await.unwrap();
        assert_eq!(guest.mount_paths(), vec!["/mnt1".to_string()]);
        m1.release().await.unwrap();
        assert!(guest.mount_paths().is_empty());
        assert!(host.attachment_paths().is_empty());
    }

    #[tokio::test]
    async fn conflicting_guest_paths_are_rejected() {
        let host = Arc::new(TestHost::default());
        let guest = Arc::new(TestGuest::default());
        let mgr = manager(small_config(4, 64), &host, &guest);

        let _m1 = mgr
            .add_virtual_disk(
                "/disk",
                true,
                false,
                false,
                "/mnt1",
                MountConfig::default(),
                AccessKind::Noop,
            )
            .await
            .unwrap();
        let err = mgr
            .add_virtual_disk(
                "/disk2",
                true,
                false,
                false,
                "/mnt1",
                MountConfig::default(),
                AccessKind::Noop,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyAttached));
        // The second disk's attachment was rolled back with its mount.
        assert_eq!(host.attachment_paths(), vec!["/disk".to_string()]);
    }

    #[tokio::test]
    async fn layer_fan_out_and_slot_exhaustion() {
        let host = Arc::new(TestHost::default());
        let guest = Arc::new(TestGuest::default());
        let mgr = manager(small_config(1, 2), &host, &guest);

        let scratch = mgr
            .add_virtual_disk(
                "disk-scratch",
                false,
                false,
                false,
                "",
                MountConfig::default(),
                AccessKind::Individual,
            )
            .await
            .unwrap();
        assert_eq!((scratch.controller(), scratch.lun()), (0, 0));
        assert_eq!(scratch.ref_count(), 1);

        let layer_a = mgr
            .add_virtual_disk(
                "disk-layer",
                true,
                false,
                true,
                "/a",
                MountConfig::default(),
                AccessKind::Noop,
            )
            .await
            .unwrap();
        assert_eq!((layer_a.controller(), layer_a.lun()), (0, 1));

        // Same layer disk at a second guest path shares the attachment.
        let layer_b = mgr
            .add_virtual_disk(
                "disk-layer",
                true,
                false,
                true,
                "/b",
                MountConfig::default(),
                AccessKind::Noop,
            )
            .await
            .unwrap();
        assert_eq!((layer_b.controller(), layer_b.lun()), (0, 1));
        assert_eq!(layer_b.ref_count(), 2);
        assert_eq!(
            guest.mount_paths(),
            vec!["/a".to_string(), "/b".to_string()]
        );
        assert_eq!(host.attach_calls.load(Ordering::SeqCst), 2);

        // The grid is full.
        let err = mgr
            .add_virtual_disk(
                "disk-third",
                false,
                false,
                false,
                "",
                MountConfig::default(),
                AccessKind::Noop,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoAvailableLocation));

        // Dropping one layer path leaves the other and the attachment.
        layer_a.release().await.unwrap();
        assert_eq!(guest.mount_paths(), vec!["/b".to_string()]);
        assert_eq!(layer_b.ref_count(), 1);

        layer_b.release().await.unwrap();
        assert!(guest.mount_paths().is_empty());
        assert_eq!(
            host.attachment_paths(),
            vec!["disk-scratch".to_string()]
        );

        // The freed slot is immediately reusable.
        let fourth = mgr
            .add_virtual_disk(
                "disk-fourth",
                false,
                false,
                false,
                "",
                MountConfig::default(),
                AccessKind::Noop,
            )
            .await
            .unwrap();
        assert_eq!((fourth.controller(), fourth.lun()), (0, 1));
    }

    #[tokio::test]
    async fn concurrent_adds_coalesce_into_one_attach() {
        let hold = Arc::new(Semaphore::new(0));
        let host = Arc::new(TestHost {
            hold_attach: Some(Arc::clone(&hold)),
            ..Default::default()
        });
        let guest = Arc::new(TestGuest::default());
        let mgr = manager(small_config(4, 64), &host, &guest);

        let add = |mgr: Manager| async move {
            mgr.add_virtual_disk(
                "/disk",
                true,
                false,
                false,
                "",
                MountConfig::default(),
                AccessKind::Noop,
            )
            .await
        };

        let t1 = tokio::spawn(add(mgr.clone()));
        let t2 = tokio::spawn(add(mgr.clone()));

        // Let both tasks reach the attach; only one host call may be in
        // flight.
        for _ in 0..32 {
            tokio::task::yield_now().await;
        }
        assert_eq!(host.attach_calls.load(Ordering::SeqCst), 1);

        hold.add_permits(1);
        let m1 = t1.await.unwrap().unwrap();
        let m2 = t2.await.unwrap().unwrap();

        assert_eq!(host.attach_calls.load(Ordering::SeqCst), 1);
        assert_eq!(m1.ref_count(), 2);
        assert_eq!(m2.ref_count(), 2);

        m1.release().await.unwrap();
        m2.release().await.unwrap();
        assert_eq!(host.detach_calls.load(Ordering::SeqCst), 1);
        assert!(host.attachment_paths().is_empty());
    }

    #[tokio::test]
    async fn waiters_inherit_attach_failure() {
        let hold = Arc::new(Semaphore::new(0));
        let host = Arc::new(TestHost {
            hold_attach: Some(Arc::clone(&hold)),
            ..Default::default()
        });
        host.fail_attach.store(true, Ordering::SeqCst);
        let guest = Arc::new(TestGuest::default());
        let mgr = manager(small_config(4, 64), &host, &guest);

        let add = |mgr: Manager| async move {
            mgr.add_virtual_disk(
                "/disk",
                true,
                false,
                false,
                "",
                MountConfig::default(),
                AccessKind::Noop,
            )
            .await
        };

        let t1 = tokio::spawn(add(mgr.clone()));
        let t2 = tokio::spawn(add(mgr.clone()));
        for _ in 0..32 {
            tokio::task::yield_now().await;
        }
        hold.add_permits(1);

        let e1 = t1.await.unwrap().unwrap_err();
        let e2 = t2.await.unwrap().unwrap_err();
        for err in [&e1, &e2] {
            assert!(matches!(
                err.root_cause(),
                Error::HostTransport { op: "attach", .. }
            ));
        }

        // The rollback left the registry clean; a retry attaches afresh.
        host.fail_attach.store(false, Ordering::SeqCst);
        hold.add_permits(1);
        let m = add(mgr.clone()).await.unwrap();
        assert_eq!((m.controller(), m.lun()), (0, 0));
        assert_eq!(m.ref_count(), 1);
    }

    #[tokio::test]
    async fn mount_failure_rolls_back_attachment() {
        let host = Arc::new(TestHost::default());
        let guest = Arc::new(TestGuest::default());
        guest.fail_mount.store(true, Ordering::SeqCst);
        let mgr = manager(small_config(4, 64), &host, &guest);

        let err = mgr
            .add_virtual_disk(
                "/disk",
                false,
                false,
                false,
                "/mnt",
                MountConfig::default(),
                AccessKind::Noop,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err.root_cause(),
            Error::GuestTransport { op: "mount", .. }
        ));

        // Attach happened, then was unwound when the mount failed.
        assert_eq!(host.attach_calls.load(Ordering::SeqCst), 1);
        assert_eq!(host.detach_calls.load(Ordering::SeqCst), 1);
        assert!(host.attachment_paths().is_empty());
        assert!(guest.mount_paths().is_empty());
    }

    #[tokio::test]
    async fn windows_guests_reject_secondary_controllers() {
        let host = Arc::new(TestHost::default());
        let guest = Arc::new(TestGuest::default());
        let config = Config {
            guest_os: GuestOs::Windows,
            controllers: 2,
            luns_per_controller: 1,
            ..Default::default()
        };
        // Windows guest requests carry Windows settings; the recording
        // guest backend only sees requests for controller 0, which it
        // never receives in this test.
        let mgr = Manager::new(
            config,
            Arc::clone(&host) as Arc<dyn HostBackend>,
            Some(Arc::clone(&guest) as Arc<dyn GuestBackend>),
            Arc::new(NoopAccess),
            Arc::new(NoVerity),
            test_log(),
        );

        let _m0 = mgr
            .add_virtual_disk(
                "/disk0",
                false,
                false,
                false,
                "",
                MountConfig::default(),
                AccessKind::Noop,
            )
            .await
            .unwrap();

        // The second disk lands on controller 1, which Windows cannot
        // mount.
        let err = mgr
            .add_virtual_disk(
                "/disk1",
                false,
                false,
                false,
                "C:\\mnt",
                MountConfig::default(),
                AccessKind::Noop,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err.root_cause(),
            Error::WindowsController
        ));
        assert_eq!(host.attachment_paths(), vec!["/disk0".to_string()]);
    }

    #[tokio::test]
    async fn reserved_slots_are_never_allocated() {
        let host = Arc::new(TestHost::default());
        let guest = Arc::new(TestGuest::default());
        let config = Config {
            controllers: 1,
            luns_per_controller: 2,
            reserved_slots: vec![Slot::new(0, 0)],
            ..Default::default()
        };
        let mgr = manager(config, &host, &guest);

        let m = mgr
            .add_virtual_disk(
                "/disk",
                false,
                false,
                false,
                "",
                MountConfig::default(),
                AccessKind::Noop,
            )
            .await
            .unwrap();
        assert_eq!((m.controller(), m.lun()), (0, 1));

        let err = mgr
            .add_virtual_disk(
                "/disk2",
                false,
                false,
                false,
                "",
                MountConfig::default(),
                AccessKind::Noop,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoAvailableLocation));
    }

    #[tokio::test]
    async fn zero_controllers_reports_configuration() {
        let host = Arc::new(TestHost::default());
        let guest = Arc::new(TestGuest::default());
        let mgr = manager(small_config(0, 64), &host, &guest);

        let err = mgr
            .add_virtual_disk(
                "/disk",
                false,
                false,
                false,
                "",
                MountConfig::default(),
                AccessKind::Noop,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoScsiControllers));
    }

    #[tokio::test]
    async fn cancelled_add_unblocks_later_callers() {
        let hold = Arc::new(Semaphore::new(0));
        let host = Arc::new(TestHost {
            hold_attach: Some(Arc::clone(&hold)),
            ..Default::default()
        });
        let guest = Arc::new(TestGuest::default());
        let mgr = manager(small_config(4, 64), &host, &guest);

        let t1 = {
            let mgr = mgr.clone();
            tokio::spawn(async move {
                mgr.add_virtual_disk(
                    "/disk",
                    true,
                    false,
                    false,
                    "",
                    MountConfig::default(),
                    AccessKind::Noop,
                )
                .await
            })
        };
        for _ in 0..32 {
            tokio::task::yield_now().await;
        }
        assert_eq!(host.attach_calls.load(Ordering::SeqCst), 1);

        // Abandon the attach mid-call. The in-flight record stays, but its
        // gate resolves so no later caller blocks forever.
        t1.abort();
        let _ = t1.await;

        let err = mgr
            .add_virtual_disk(
                "/disk",
                true,
                false,
                false,
                "",
                MountConfig::default(),
                AccessKind::Noop,
            )
            .await
            .unwrap_err();
        assert!(matches!(err.root_cause(), Error::OperationAborted));

        let err = mgr.remove_mount("/disk", "").await.unwrap_err();
        assert!(matches!(err.root_cause(), Error::OperationAborted));
    }

    #[test]
    fn evd_paths_parse() {
        assert_eq!(
            parse_evd_path("evd://space/pool0/disk1").unwrap(),
            ("space".to_string(), "pool0/disk1".to_string())
        );
        assert!(matches!(
            parse_evd_path("evd:///pool0"),
            Err(Error::InvalidEvdPath(_))
        ));
        assert!(matches!(
            parse_evd_path("nonsense"),
            Err(Error::InvalidEvdPath(_))
        ));
    }

    #[tokio::test]
    async fn evd_requires_guest_path() {
        let host = Arc::new(TestHost::default());
        let guest = Arc::new(TestGuest::default());
        let mgr = manager(small_config(4, 64), &host, &guest);
        assert!(matches!(
            mgr.add_extensible_virtual_disk(
                "evd://space/pool0",
                true,
                "",
                MountConfig::default(),
            )
            .await,
            Err(Error::EvdGuestPathRequired)
        ));
    }
}
