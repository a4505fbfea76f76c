// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire-level request and settings types for managing SCSI devices on a
//! utility VM.
//!
//! The host virtualization service is driven by [`HostModifyRequest`]s
//! addressed by a resource path encoding the controller identity and LUN.
//! The guest OS is driven by [`GuestModifyRequest`] envelopes sent over the
//! guest control channel. Both serialize to the JSON schema the platform
//! services expect, so field names follow that schema rather than Rust
//! convention.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Stable identifiers for the SCSI controllers exposed to the guest, indexed
/// by controller number. The virtualization service addresses attachment
/// resources by controller identity rather than index, so these are fixed for
/// the life of the platform.
pub const SCSI_CONTROLLER_IDS: [&str; 4] = [
    "df6d0690-79e5-4d07-a1c2-7a6f778b850a",
    "0110f83b-de10-4172-a91c-33a78185e5a2",
    "b5b2a8a4-3447-48f1-932d-d1e3e571bead",
    "305891a9-b251-5dfe-91a2-c25d9212275b",
];

/// Resource type tag for guest requests operating on the filesystem
/// presentation of a mapped disk.
pub const RESOURCE_TYPE_MAPPED_VIRTUAL_DISK: &str = "MappedVirtualDisk";

/// Builds the host-side resource path for the attachment at
/// `(controller, lun)`.
///
/// Returns `None` if `controller` exceeds the number of controllers the
/// platform can expose.
pub fn scsi_resource_path(controller: u32, lun: u32) -> Option<String> {
    let id = SCSI_CONTROLLER_IDS.get(controller as usize)?;
    Some(format!("VirtualMachine/Devices/Scsi/{id}/Attachments/{lun}"))
}

/// Direction of a host or guest modification.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
pub enum RequestType {
    Add,
    Remove,
}

/// Host-side view of one disk attachment, as carried in the settings of an
/// attachment-add request.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub struct AttachmentSettings {
    /// Host path of the backing resource (VHD path, physical device path, or
    /// an extensible-virtual-disk mount path).
    pub path: String,

    /// Attachment type: `VirtualDisk`, `PassThru`, or
    /// `ExtensibleVirtualDisk`.
    #[serde(rename = "Type")]
    pub attachment_type: String,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,

    /// Sub-type of an extensible virtual disk (e.g. `space`); empty for all
    /// other attachment types.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub extensible_virtual_disk_type: String,
}

/// A modification request addressed to the host virtualization service.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub struct HostModifyRequest {
    pub request_type: RequestType,

    /// Resource path identifying the controller/LUN being modified; see
    /// [`scsi_resource_path`].
    pub resource_path: String,

    /// Attachment settings; present for `Add`, absent for `Remove`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<AttachmentSettings>,
}

/// A modification request forwarded to the guest OS over the control
/// channel.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub struct GuestModifyRequest {
    /// Resource type tag; see [`RESOURCE_TYPE_MAPPED_VIRTUAL_DISK`].
    pub resource_type: String,

    pub request_type: RequestType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<GuestDiskSettings>,
}

/// Settings payload of a guest disk modification; shape depends on the guest
/// OS.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(untagged)]
pub enum GuestDiskSettings {
    Windows(WindowsMappedVirtualDisk),
    Linux(LinuxMappedVirtualDisk),
}

/// A disk mapped into a Windows guest. Windows guests only support
/// controller 0, so the LUN alone addresses the device.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "PascalCase")]
pub struct WindowsMappedVirtualDisk {
    /// Path inside the guest at which the disk contents are surfaced.
    pub container_path: String,
    pub lun: i32,
}

/// A disk mapped into a Linux guest in the V2 schema.
#[derive(
    Clone, Debug, Default, PartialEq, Deserialize, Serialize, JsonSchema,
)]
#[serde(rename_all = "PascalCase")]
pub struct LinuxMappedVirtualDisk {
    /// Guest path to mount the filesystem at; empty for attach-only devices
    /// (the guest is still notified on removal so its device state stays
    /// synchronized).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub mount_path: String,

    pub lun: u8,
    pub controller: u8,

    /// 1-based partition index on a partitioned device; 0 mounts the whole
    /// device.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub partition: u64,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub read_only: bool,

    /// Device is dm-crypt encrypted and should be opened before mounting.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub encrypted: bool,

    /// Free-form mount options (flags, propagation, data).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,

    /// Surface the device as a block device node rather than mounting a
    /// filesystem from it.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub block_dev: bool,

    /// dm-verity metadata for integrity-protected devices, so the guest can
    /// construct (on add) or tear down (on remove) the verity target.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verity_info: Option<VerityInfo>,

    /// Format the device as `filesystem` if it does not already carry that
    /// filesystem.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ensure_filesystem: bool,

    /// Target filesystem type for the mount.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filesystem: String,

    /// On removal, fully unplug the underlying SCSI device rather than just
    /// unmounting. Set exactly when the attachment itself is being detached
    /// from the VM.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unplug: bool,
}

/// dm-verity metadata of a block device. Fields map to the device-mapper
/// verity table entries.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema,
)]
#[serde(rename_all = "PascalCase")]
pub struct VerityInfo {
    /// Size of the ext4 filesystem preceding the hash tree.
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub ext4_size_in_bytes: i64,

    /// On-disk hash format version.
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub version: u32,

    /// Hash algorithm used for the hash tree (e.g. `sha256`).
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub algorithm: String,

    /// A verity superblock is present on the device.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub super_block: bool,

    /// Root hash of the hash tree.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub root_digest: String,

    /// Salt used to compute the root hash.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub salt: String,

    /// Data device block size.
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub block_size: u32,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}
fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}
fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}
