// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Transport seams to the two external services, and construction of the
//! wire requests sent through them.
//!
//! The host virtualization service and the guest control channel are opaque
//! collaborators; this subsystem only knows how to phrase modification
//! requests for them. The [`HostBackend`] and [`GuestBackend`] traits are
//! the narrow waists the real transports (and the recording backends used in
//! tests) implement.

use async_trait::async_trait;

use scsi_api_types::{
    scsi_resource_path, AttachmentSettings, GuestDiskSettings,
    GuestModifyRequest, HostModifyRequest, LinuxMappedVirtualDisk,
    RequestType, VerityInfo, WindowsMappedVirtualDisk,
    RESOURCE_TYPE_MAPPED_VIRTUAL_DISK,
};

use crate::error::Error;
use crate::slots::Slot;
use crate::{GuestOs, MountConfig};

/// Issues modification requests against the host virtualization service.
#[async_trait]
pub trait HostBackend: Send + Sync {
    async fn modify(&self, req: HostModifyRequest) -> anyhow::Result<()>;
}

/// Issues modification requests over the guest control channel.
#[async_trait]
pub trait GuestBackend: Send + Sync {
    async fn modify(&self, req: GuestModifyRequest) -> anyhow::Result<()>;
}

/// Disk-level parameters reflected into guest mount/unmount requests.
#[derive(Clone, Debug, Default)]
pub(crate) struct DiskParams {
    pub read_only: bool,
    pub encrypted: bool,
    pub config: MountConfig,
}

fn resource_path(slot: Slot) -> String {
    // Manager construction rejects controller counts beyond the platform
    // table, so every live slot resolves.
    scsi_resource_path(slot.controller, slot.lun)
        .expect("controller count validated at construction")
}

pub(crate) fn attach_request(
    slot: Slot,
    settings: AttachmentSettings,
) -> HostModifyRequest {
    HostModifyRequest {
        request_type: RequestType::Add,
        resource_path: resource_path(slot),
        settings: Some(settings),
    }
}

pub(crate) fn detach_request(slot: Slot) -> HostModifyRequest {
    HostModifyRequest {
        request_type: RequestType::Remove,
        resource_path: resource_path(slot),
        settings: None,
    }
}

/// Build the guest request mapping a disk's filesystem in at `path`.
pub(crate) fn mount_request(
    os: GuestOs,
    slot: Slot,
    path: &str,
    disk: &DiskParams,
    verity: Option<VerityInfo>,
) -> Result<GuestModifyRequest, Error> {
    let settings = match os {
        GuestOs::Windows => {
            // The attachment itself enforces read-only; nothing further is
            // supported on the mount.
            check_windows_slot(slot)?;
            check_windows_config(disk)?;
            GuestDiskSettings::Windows(WindowsMappedVirtualDisk {
                container_path: path.to_string(),
                lun: slot.lun as i32,
            })
        }
        GuestOs::Linux => GuestDiskSettings::Linux(LinuxMappedVirtualDisk {
            mount_path: path.to_string(),
            lun: slot.lun as u8,
            controller: slot.controller as u8,
            partition: disk.config.partition,
            read_only: disk.read_only,
            encrypted: disk.encrypted,
            options: disk.config.options.clone(),
            block_dev: disk.config.block_dev,
            verity_info: verity,
            ensure_filesystem: disk.config.ensure_filesystem,
            filesystem: disk.config.filesystem.clone(),
            unplug: false,
        }),
    };
    Ok(GuestModifyRequest {
        resource_type: RESOURCE_TYPE_MAPPED_VIRTUAL_DISK.to_string(),
        request_type: RequestType::Add,
        settings: Some(settings),
    })
}

/// Build the guest request releasing the mount at `path`. `unplug` is set
/// exactly when the attachment's refcount is reaching zero and the device
/// itself should be removed from the guest once unmounted.
pub(crate) fn unmount_request(
    os: GuestOs,
    slot: Slot,
    path: &str,
    disk: &DiskParams,
    unplug: bool,
    verity: Option<VerityInfo>,
) -> GuestModifyRequest {
    let settings = match os {
        GuestOs::Windows => {
            GuestDiskSettings::Windows(WindowsMappedVirtualDisk {
                container_path: path.to_string(),
                lun: slot.lun as i32,
            })
        }
        GuestOs::Linux => GuestDiskSettings::Linux(LinuxMappedVirtualDisk {
            mount_path: path.to_string(),
            lun: slot.lun as u8,
            controller: slot.controller as u8,
            partition: disk.config.partition,
            verity_info: verity,
            unplug,
            ..Default::default()
        }),
    };
    GuestModifyRequest {
        resource_type: RESOURCE_TYPE_MAPPED_VIRTUAL_DISK.to_string(),
        request_type: RequestType::Remove,
        settings: Some(settings),
    }
}

/// Build the guest notification that a device is being detached, for
/// attachments with no remaining (or no ever-established) guest mount. The
/// guest is always told about a detach so its device state stays
/// synchronized with the host; on Windows there is no such operation, so no
/// request is produced.
pub(crate) fn eject_request(
    os: GuestOs,
    slot: Slot,
    verity: Option<VerityInfo>,
) -> Option<GuestModifyRequest> {
    match os {
        GuestOs::Windows => None,
        GuestOs::Linux => Some(GuestModifyRequest {
            resource_type: RESOURCE_TYPE_MAPPED_VIRTUAL_DISK.to_string(),
            request_type: RequestType::Remove,
            settings: Some(GuestDiskSettings::Linux(LinuxMappedVirtualDisk {
                lun: slot.lun as u8,
                controller: slot.controller as u8,
                verity_info: verity,
                unplug: true,
                ..Default::default()
            })),
        }),
    }
}

fn check_windows_slot(slot: Slot) -> Result<(), Error> {
    if slot.controller != 0 {
        return Err(Error::WindowsController);
    }
    Ok(())
}

fn check_windows_config(disk: &DiskParams) -> Result<(), Error> {
    let config = &disk.config;
    if disk.encrypted
        || config.partition != 0
        || !config.options.is_empty()
        || config.block_dev
        || config.ensure_filesystem
        || !config.filesystem.is_empty()
    {
        return Err(Error::WindowsMountOptions);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linux_mount_request_carries_disk_parameters() {
        let disk = DiskParams {
            read_only: true,
            encrypted: false,
            config: MountConfig {
                partition: 2,
                options: vec!["ro".to_string()],
                ..Default::default()
            },
        };
        let req = mount_request(
            GuestOs::Linux,
            Slot::new(1, 5),
            "/run/m0",
            &disk,
            None,
        )
        .unwrap();
        assert_eq!(req.request_type, RequestType::Add);
        match req.settings {
            Some(GuestDiskSettings::Linux(s)) => {
                assert_eq!(s.mount_path, "/run/m0");
                assert_eq!(s.controller, 1);
                assert_eq!(s.lun, 5);
                assert_eq!(s.partition, 2);
                assert!(s.read_only);
                assert!(!s.unplug);
            }
            other => panic!("unexpected settings: {other:?}"),
        }
    }

    #[test]
    fn windows_mounts_reject_nonzero_controller_and_options() {
        let disk = DiskParams::default();
        assert!(matches!(
            mount_request(GuestOs::Windows, Slot::new(1, 0), "C:\\m", &disk,
                None),
            Err(Error::WindowsController)
        ));

        let disk = DiskParams {
            config: MountConfig { partition: 1, ..Default::default() },
            ..Default::default()
        };
        assert!(matches!(
            mount_request(GuestOs::Windows, Slot::new(0, 0), "C:\\m", &disk,
                None),
            Err(Error::WindowsMountOptions)
        ));
    }

    #[test]
    fn unmount_request_sets_unplug_only_at_detach() {
        let disk = DiskParams::default();
        let keep = unmount_request(
            GuestOs::Linux,
            Slot::new(0, 1),
            "/run/m0",
            &disk,
            false,
            None,
        );
        let last = unmount_request(
            GuestOs::Linux,
            Slot::new(0, 1),
            "/run/m0",
            &disk,
            true,
            None,
        );
        match (keep.settings, last.settings) {
            (
                Some(GuestDiskSettings::Linux(keep)),
                Some(GuestDiskSettings::Linux(last)),
            ) => {
                assert!(!keep.unplug);
                assert!(last.unplug);
            }
            other => panic!("unexpected settings: {other:?}"),
        }
    }

    #[test]
    fn eject_is_linux_only() {
        assert!(eject_request(GuestOs::Windows, Slot::new(0, 0), None)
            .is_none());
        let req =
            eject_request(GuestOs::Linux, Slot::new(0, 3), None).unwrap();
        assert_eq!(req.request_type, RequestType::Remove);
        match req.settings {
            Some(GuestDiskSettings::Linux(s)) => {
                assert!(s.unplug);
                assert!(s.mount_path.is_empty());
            }
            other => panic!("unexpected settings: {other:?}"),
        }
    }
}
