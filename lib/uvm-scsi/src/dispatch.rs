// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The single choke-point through which every host-side and guest-side
//! change is issued.
//!
//! Additions run host-first: the device must exist on the host bus before
//! the guest can be asked to mount it, and a failed guest step rolls the
//! host attach back (best-effort; the rollback failure is logged and the
//! guest error is what the caller sees). Removals run guest-first: the
//! guest releases its hold on the device before the host tears it down.
//! When there is no guest-side change, or no live guest control channel,
//! only the host side runs.

use std::sync::Arc;

use slog::{debug, warn, Logger};

use scsi_api_types::{AttachmentSettings, GuestModifyRequest, VerityInfo};

use crate::backend::{
    attach_request, detach_request, eject_request, mount_request,
    unmount_request, DiskParams, GuestBackend, HostBackend,
};
use crate::error::Error;
use crate::slots::Slot;
use crate::verity::VerityReader;
use crate::GuestOs;

/// Host-side half of a modification.
pub(crate) enum HostOp {
    Attach { slot: Slot, settings: AttachmentSettings },
    Detach { slot: Slot },
}

/// Guest-side half of a modification. `host_path` identifies the backing
/// resource for integrity-metadata lookup.
pub(crate) enum GuestOp {
    Mount { slot: Slot, path: String, host_path: String, disk: DiskParams },
    Unmount {
        slot: Slot,
        path: String,
        host_path: String,
        disk: DiskParams,
        unplug: bool,
    },
    Eject { slot: Slot, host_path: String },
}

pub(crate) struct Dispatch {
    host: Arc<dyn HostBackend>,
    guest: Option<Arc<dyn GuestBackend>>,
    verity: Arc<dyn VerityReader>,
    guest_os: GuestOs,
    log: Logger,
}

impl Dispatch {
    pub fn new(
        host: Arc<dyn HostBackend>,
        guest: Option<Arc<dyn GuestBackend>>,
        verity: Arc<dyn VerityReader>,
        guest_os: GuestOs,
        log: Logger,
    ) -> Self {
        Self { host, guest, verity, guest_os, log }
    }

    /// Apply a modification consisting of an optional host-side change and
    /// an optional guest-side change, in the order the direction of the
    /// change requires.
    pub async fn modify(
        &self,
        host: Option<HostOp>,
        guest: Option<GuestOp>,
    ) -> Result<(), Error> {
        let guest_call = match guest {
            Some(op) if self.guest.is_some() => self.build_guest_call(op)?,
            _ => None,
        };

        match (host, guest_call) {
            (None, None) => Ok(()),
            (Some(op), None) => self.host_modify(op).await,
            (None, Some(call)) => self.guest_modify(call).await,
            (Some(HostOp::Attach { slot, settings }), Some(call)) => {
                self.host_modify(HostOp::Attach { slot, settings }).await?;
                if let Err(guest_err) = self.guest_modify(call).await {
                    if let Err(rollback_err) =
                        self.host.modify(detach_request(slot)).await
                    {
                        warn!(self.log,
                            "failed to roll back host attach";
                            "slot" => %slot,
                            "error" => %rollback_err,
                        );
                    }
                    return Err(guest_err);
                }
                Ok(())
            }
            (Some(HostOp::Detach { slot }), Some(call)) => {
                self.guest_modify(call).await?;
                self.host_modify(HostOp::Detach { slot }).await
            }
        }
    }

    async fn host_modify(&self, op: HostOp) -> Result<(), Error> {
        let (label, slot, req) = match op {
            HostOp::Attach { slot, settings } => {
                ("attach", slot, attach_request(slot, settings))
            }
            HostOp::Detach { slot } => ("detach", slot, detach_request(slot)),
        };
        self.host.modify(req).await.map_err(|source| {
            Error::HostTransport { op: label, slot, source }
        })
    }

    async fn guest_modify(
        &self,
        (label, slot, req): GuestCall,
    ) -> Result<(), Error> {
        let guest =
            self.guest.as_ref().expect("guest call built only when live");
        guest.modify(req).await.map_err(|source| Error::GuestTransport {
            op: label,
            slot,
            source,
        })
    }

    /// Phrase a [`GuestOp`] as a wire request. Returns `None` when the guest
    /// OS has no corresponding operation (device ejects on Windows).
    fn build_guest_call(
        &self,
        op: GuestOp,
    ) -> Result<Option<GuestCall>, Error> {
        let os = self.guest_os;
        Ok(match op {
            GuestOp::Mount { slot, path, host_path, disk } => {
                let verity = self.read_verity(&host_path);
                Some((
                    "mount",
                    slot,
                    mount_request(os, slot, &path, &disk, verity)?,
                ))
            }
            GuestOp::Unmount { slot, path, host_path, disk, unplug } => {
                let verity = self.read_verity(&host_path);
                Some((
                    "unmount",
                    slot,
                    unmount_request(os, slot, &path, &disk, unplug, verity),
                ))
            }
            GuestOp::Eject { slot, host_path } => {
                let verity = self.read_verity(&host_path);
                eject_request(os, slot, verity)
                    .map(|req| ("eject", slot, req))
            }
        })
    }

    /// Best-effort integrity metadata for Linux guest requests; failure to
    /// read it never blocks the operation.
    fn read_verity(&self, host_path: &str) -> Option<VerityInfo> {
        if self.guest_os != GuestOs::Linux {
            return None;
        }
        match self.verity.read_verity_info(host_path) {
            Ok(info) => info,
            Err(err) => {
                debug!(self.log,
                    "unable to read verity information from disk";
                    "hostPath" => host_path,
                    "error" => %err,
                );
                None
            }
        }
    }
}

type GuestCall = (&'static str, Slot, GuestModifyRequest);

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::verity::NoVerity;

    /// Records the order of backend calls across both transports, and fails
    /// calls whose label has been marked as failing.
    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        fail: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn record(&self, event: String) -> anyhow::Result<()> {
            let fail = self.fail.lock().unwrap().contains(&event);
            self.events.lock().unwrap().push(event.clone());
            if fail {
                anyhow::bail!("injected failure for {event}");
            }
            Ok(())
        }
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    struct HostRec(Arc<Recorder>);
    #[async_trait]
    impl HostBackend for HostRec {
        async fn modify(
            &self,
            req: scsi_api_types::HostModifyRequest,
        ) -> anyhow::Result<()> {
            self.0.record(format!("host-{:?}", req.request_type))
        }
    }

    struct GuestRec(Arc<Recorder>);
    #[async_trait]
    impl GuestBackend for GuestRec {
        async fn modify(
            &self,
            req: GuestModifyRequest,
        ) -> anyhow::Result<()> {
            self.0.record(format!("guest-{:?}", req.request_type))
        }
    }

    fn test_log() -> Logger {
        Logger::root(slog::Discard, slog::o!())
    }

    fn dispatch(rec: &Arc<Recorder>, guest: bool) -> Dispatch {
        Dispatch::new(
            Arc::new(HostRec(Arc::clone(rec))),
            guest.then(|| {
                Arc::new(GuestRec(Arc::clone(rec))) as Arc<dyn GuestBackend>
            }),
            Arc::new(NoVerity),
            GuestOs::Linux,
            test_log(),
        )
    }

    fn attach_op() -> HostOp {
        HostOp::Attach {
            slot: Slot::new(0, 0),
            settings: AttachmentSettings {
                path: "/disk".to_string(),
                attachment_type: "VirtualDisk".to_string(),
                read_only: false,
                extensible_virtual_disk_type: String::new(),
            },
        }
    }

    fn mount_op() -> GuestOp {
        GuestOp::Mount {
            slot: Slot::new(0, 0),
            path: "/run/m0".to_string(),
            host_path: "/disk".to_string(),
            disk: DiskParams::default(),
        }
    }

    #[tokio::test]
    async fn add_runs_host_before_guest() {
        let rec = Arc::new(Recorder::default());
        let d = dispatch(&rec, true);
        d.modify(Some(attach_op()), Some(mount_op())).await.unwrap();
        assert_eq!(rec.events(), vec!["host-Add", "guest-Add"]);
    }

    #[tokio::test]
    async fn guest_failure_rolls_back_host_add() {
        let rec = Arc::new(Recorder::default());
        rec.fail.lock().unwrap().push("guest-Add".to_string());
        let d = dispatch(&rec, true);

        let err =
            d.modify(Some(attach_op()), Some(mount_op())).await.unwrap_err();
        assert!(matches!(err, Error::GuestTransport { op: "mount", .. }));
        // The host attach is reversed after the guest failure.
        assert_eq!(
            rec.events(),
            vec!["host-Add", "guest-Add", "host-Remove"]
        );
    }

    #[tokio::test]
    async fn remove_runs_guest_before_host() {
        let rec = Arc::new(Recorder::default());
        let d = dispatch(&rec, true);
        d.modify(
            Some(HostOp::Detach { slot: Slot::new(0, 0) }),
            Some(GuestOp::Eject {
                slot: Slot::new(0, 0),
                host_path: "/disk".to_string(),
            }),
        )
        .await
        .unwrap();
        assert_eq!(rec.events(), vec!["guest-Remove", "host-Remove"]);
    }

    #[tokio::test]
    async fn host_detach_failure_is_surfaced() {
        let rec = Arc::new(Recorder::default());
        rec.fail.lock().unwrap().push("host-Remove".to_string());
        let d = dispatch(&rec, true);
        let err = d
            .modify(
                Some(HostOp::Detach { slot: Slot::new(0, 0) }),
                Some(GuestOp::Eject {
                    slot: Slot::new(0, 0),
                    host_path: "/disk".to_string(),
                }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HostTransport { op: "detach", .. }));
        assert_eq!(rec.events(), vec!["guest-Remove", "host-Remove"]);
    }

    #[tokio::test]
    async fn no_guest_channel_means_host_only() {
        let rec = Arc::new(Recorder::default());
        let d = dispatch(&rec, false);
        d.modify(Some(attach_op()), Some(mount_op())).await.unwrap();
        assert_eq!(rec.events(), vec!["host-Add"]);

        // A guest-only change with no channel is a no-op.
        d.modify(None, Some(mount_op())).await.unwrap();
        assert_eq!(rec.events(), vec!["host-Add"]);
    }
}
