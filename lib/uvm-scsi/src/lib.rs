// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Management of host disks attached to a utility VM over its synthetic
//! SCSI controllers, and of their filesystem presentation inside the guest.
//!
//! Disks occupy slots of a fixed controller × LUN grid and are shared:
//! attaching a host path already attached joins the existing attachment,
//! and mounting a guest path already mounted (under the same attachment)
//! joins the existing mount, each layer with its own reference count.
//! Changes reach the outside world through two narrow seams — the host
//! virtualization service and the guest control channel — coordinated so
//! that a disk is never mounted before it is attached, nor detached before
//! the guest has let go of it.
//!
//! The entrypoint is [`Manager`]; one exists per utility VM, and all of
//! its bookkeeping is scoped to that VM.

pub extern crate usdt;

use serde::{Deserialize, Serialize};

pub mod access;
mod attach;
pub mod backend;
pub mod clone;
mod dispatch;
pub mod error;
mod gate;
pub mod manager;
mod mount;
pub mod slots;
pub mod verity;

pub use error::Error;
pub use manager::{Config, Manager, Mount};
pub use slots::Slot;

#[usdt::provider(provider = "uvm_scsi")]
mod probes {
    fn scsi_attach(controller: u32, lun: u32, host_path: String) {}
    fn scsi_detach(controller: u32, lun: u32) {}
    fn scsi_mount(controller: u32, lun: u32, guest_path: String) {}
    fn scsi_unmount(controller: u32, lun: u32, guest_path: String) {}
}

/// Operating system running inside the utility VM. Decides the wire shape
/// of guest requests and the mount-sharing policy for layer disks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuestOs {
    Windows,
    Linux,
}

/// How a disk is attached to the VM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttachKind {
    /// A virtual disk image (VHD/VHDX) file on the host.
    VirtualDisk,
    /// A physical disk passed through from the host.
    PassThru,
    /// A resource surfaced by a host driver speaking the synthetic SCSI
    /// interface, identified by a sub-type tag (e.g. `space`).
    ExtensibleVirtualDisk { evd_type: String },
}

impl AttachKind {
    /// The attachment type name used on the wire.
    pub fn type_name(&self) -> &'static str {
        match self {
            AttachKind::VirtualDisk => "VirtualDisk",
            AttachKind::PassThru => "PassThru",
            AttachKind::ExtensibleVirtualDisk { .. } => {
                "ExtensibleVirtualDisk"
            }
        }
    }

    pub(crate) fn evd_type(&self) -> &str {
        match self {
            AttachKind::ExtensibleVirtualDisk { evd_type } => evd_type,
            _ => "",
        }
    }
}

/// Options applied to a guest mount of an attached disk. All of these are
/// Linux-guest features; Windows guests only accept the defaults.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct MountConfig {
    /// 1-based partition to mount on a partitioned device; 0 for the whole
    /// device.
    pub partition: u64,
    /// Mount options (flags, propagation, data) passed through to the
    /// guest's mount call.
    pub options: Vec<String>,
    /// Format the device as [`Self::filesystem`] first unless it already
    /// carries that filesystem.
    pub ensure_filesystem: bool,
    /// Filesystem type to mount as; empty lets the guest decide.
    pub filesystem: String,
    /// Surface the device as a block device node instead of mounting a
    /// filesystem.
    pub block_dev: bool,
}
