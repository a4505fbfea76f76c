// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Versioned serialization of attachment state, and replication of a live
//! attachment graph into a second VM (template/clone support).
//!
//! Payloads carry an explicit schema version, written first and validated
//! on decode. A mismatch is fatal to the decode — no migration between
//! versions is attempted, matching the template/clone contract that both
//! sides run the same code.
//!
//! Cloning replicates read-only attachments by reference (same host path,
//! same slot) and writable attachments by value: the backing file is copied
//! under the clone's scratch directory, access is re-granted for the clone
//! VM, and the new attachment points at the copy. Guest mounts are
//! duplicated verbatim.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use slog::debug;
use thiserror::Error;

use scsi_api_types::{AttachmentSettings, SCSI_CONTROLLER_IDS};

use crate::access::AccessKind;
use crate::attach::{AttachmentEntry, Phase};
use crate::error::Error as ScsiError;
use crate::gate::Gate;
use crate::manager::Manager;
use crate::mount::MountEntry;
use crate::slots::Slot;
use crate::{AttachKind, MountConfig};

/// Schema version of [`AttachmentPayload`]. Incremented whenever the
/// payload layout changes.
pub const SERIAL_VERSION_ID: u32 = 2;

/// Payload kind tag, reported alongside the offending version on mismatch.
pub const PAYLOAD_KIND: &str = "scsi-attachment";

#[derive(Debug, Error)]
pub enum PayloadError {
    /// The payload's schema version does not match [`SERIAL_VERSION_ID`].
    #[error("kind/version of payload not expected: {0} v{1}")]
    UnexpectedPayload(String, u32),

    #[error("could not serialize attachment state")]
    Serialize(#[source] serde_json::Error),

    #[error("could not deserialize attachment state")]
    Deserialize(#[source] serde_json::Error),

    #[error("unknown attachment kind: {0}")]
    UnknownKind(String),
}

/// One guest mount under a serialized attachment.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct MountPayload {
    pub guest_path: String,
    pub config: MountConfig,
}

/// Serialized form of one attachment and its mounts. Fields are written in
/// fixed order, version first.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct AttachmentPayload {
    pub version: u32,
    pub host_path: String,
    pub controller: u32,
    pub lun: u32,
    pub mounts: Vec<MountPayload>,
    pub read_only: bool,
    pub encrypted: bool,
    pub is_layer: bool,
    /// Attachment type name (`VirtualDisk`, `PassThru`,
    /// `ExtensibleVirtualDisk`).
    pub kind: String,
    /// Extensible-virtual-disk sub-type; empty otherwise.
    pub evd_type: String,
}

pub fn encode_attachment(
    payload: &AttachmentPayload,
) -> Result<Vec<u8>, PayloadError> {
    serde_json::to_vec(payload).map_err(PayloadError::Serialize)
}

/// Decode a serialized attachment, validating the schema version before
/// anything else is interpreted.
pub fn decode_attachment(
    data: &[u8],
) -> Result<AttachmentPayload, PayloadError> {
    #[derive(Deserialize)]
    struct VersionProbe {
        version: u32,
    }

    let probe: VersionProbe =
        serde_json::from_slice(data).map_err(PayloadError::Deserialize)?;
    if probe.version != SERIAL_VERSION_ID {
        return Err(PayloadError::UnexpectedPayload(
            PAYLOAD_KIND.to_string(),
            probe.version,
        ));
    }
    serde_json::from_slice(data).map_err(PayloadError::Deserialize)
}

fn kind_from_name(
    kind: &str,
    evd_type: &str,
) -> Result<AttachKind, PayloadError> {
    match kind {
        "VirtualDisk" => Ok(AttachKind::VirtualDisk),
        "PassThru" => Ok(AttachKind::PassThru),
        "ExtensibleVirtualDisk" => Ok(AttachKind::ExtensibleVirtualDisk {
            evd_type: evd_type.to_string(),
        }),
        other => Err(PayloadError::UnknownKind(other.to_string())),
    }
}

/// SCSI portion of a clone's boot document: controller identity to LUN to
/// attachment, as the virtualization service expects to find it.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceDocument {
    pub scsi: BTreeMap<String, ScsiController>,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScsiController {
    pub attachments: BTreeMap<String, AttachmentSettings>,
}

/// Destination description for a clone operation.
pub struct CloneContext {
    /// Identity of the clone VM, for re-granting access on copied disks.
    pub vm_id: String,
    /// The clone's scratch directory. The VM scratch disk (slot 0,0) is
    /// copied directly into it; any other writable attachment is copied
    /// into a per-slot subdirectory.
    pub scratch_dir: PathBuf,
    /// Accumulates the cloned attachments for boot-document assembly.
    pub document: DeviceDocument,
}

impl Manager {
    /// Snapshot every settled attachment as a versioned payload.
    pub fn export(&self) -> Vec<AttachmentPayload> {
        let state = self.inner.state.lock().unwrap();
        state
            .iter()
            .filter(|(_, entry)| entry.phase == Phase::Ready)
            .map(|(slot, entry)| AttachmentPayload {
                version: SERIAL_VERSION_ID,
                host_path: entry.host_path.clone(),
                controller: slot.controller,
                lun: slot.lun,
                mounts: entry
                    .mounts
                    .iter()
                    .map(|(path, mount)| MountPayload {
                        guest_path: path.clone(),
                        config: mount.config.clone(),
                    })
                    .collect(),
                read_only: entry.read_only,
                encrypted: entry.encrypted,
                is_layer: entry.is_layer,
                kind: entry.kind.type_name().to_string(),
                evd_type: entry.kind.evd_type().to_string(),
            })
            .collect()
    }

    /// Register a deserialized attachment record at its original slot,
    /// with a fresh refcount of 1 and its mounts re-created verbatim.
    ///
    /// No host or guest calls are made: the clone's devices are realized
    /// by the boot document, not by hot-adds.
    pub fn import(&self, payload: AttachmentPayload) -> Result<(), ScsiError> {
        if payload.version != SERIAL_VERSION_ID {
            return Err(PayloadError::UnexpectedPayload(
                PAYLOAD_KIND.to_string(),
                payload.version,
            )
            .into());
        }
        let kind = kind_from_name(&payload.kind, &payload.evd_type)?;
        let slot = Slot::new(payload.controller, payload.lun);

        let mut state = self.inner.state.lock().unwrap();
        if !state.in_bounds(slot) {
            return Err(ScsiError::NoAvailableLocation);
        }
        if state.entry(slot).is_some()
            || state.find_by_path(&payload.host_path).is_some()
        {
            return Err(ScsiError::AlreadyAttached);
        }
        let mounts = payload
            .mounts
            .into_iter()
            .map(|m| {
                (
                    m.guest_path,
                    MountEntry {
                        config: m.config,
                        ref_count: 1,
                        phase: Phase::Ready,
                        gate: Gate::closed(),
                    },
                )
            })
            .collect();
        state.put(
            slot,
            AttachmentEntry {
                host_path: payload.host_path,
                kind,
                read_only: payload.read_only,
                encrypted: payload.encrypted,
                is_layer: payload.is_layer,
                ref_count: 1,
                phase: Phase::Ready,
                gate: Gate::closed(),
                mounts,
            },
        );
        Ok(())
    }

    /// Replicate this VM's attachments into `target`, which must be a
    /// freshly created manager for the clone VM.
    ///
    /// Read-only attachments are shared by reference. Writable attachments
    /// are copied under `ctx.scratch_dir` and access is re-granted for the
    /// clone; a failure removes the partial copy and aborts the clone
    /// without touching further attachments.
    pub async fn clone_into(
        &self,
        target: &Manager,
        ctx: &mut CloneContext,
    ) -> Result<(), ScsiError> {
        for mut payload in self.export() {
            if !payload.read_only {
                payload.host_path = self
                    .copy_backing_file(target, ctx, &payload)
                    .await?;
            }

            let controller_id = SCSI_CONTROLLER_IDS
                .get(payload.controller as usize)
                .expect("controller count validated at construction");
            ctx.document
                .scsi
                .entry(controller_id.to_string())
                .or_default()
                .attachments
                .insert(
                    payload.lun.to_string(),
                    AttachmentSettings {
                        path: payload.host_path.clone(),
                        attachment_type: payload.kind.clone(),
                        read_only: payload.read_only,
                        extensible_virtual_disk_type: payload
                            .evd_type
                            .clone(),
                    },
                );

            target.import(payload)?;
        }
        Ok(())
    }

    /// Copy a writable attachment's backing file for the clone, returning
    /// the copy's path.
    async fn copy_backing_file(
        &self,
        target: &Manager,
        ctx: &CloneContext,
        payload: &AttachmentPayload,
    ) -> Result<String, ScsiError> {
        // The VM scratch disk lives at a fixed slot and is copied straight
        // into the clone's scratch directory; other writable disks get a
        // per-slot subdirectory so base names cannot collide.
        let dir = if payload.controller == 0 && payload.lun == 0 {
            ctx.scratch_dir.clone()
        } else {
            let dir = ctx.scratch_dir.join(format!(
                "clone-mount-{}-{}",
                payload.controller, payload.lun
            ));
            tokio::fs::create_dir_all(&dir).await.map_err(|source| {
                ScsiError::CloneCopy {
                    src: payload.host_path.clone(),
                    dst: dir.display().to_string(),
                    source,
                }
            })?;
            dir
        };

        let file_name = Path::new(&payload.host_path)
            .file_name()
            .ok_or_else(|| ScsiError::CloneCopy {
                src: payload.host_path.clone(),
                dst: dir.display().to_string(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "backing path has no file name",
                ),
            })?;
        let dst = dir.join(file_name);
        let dst_str = dst.display().to_string();

        debug!(self.inner.log,
            "creating a clone of SCSI attachment";
            "source" => %payload.host_path,
            "destination" => %dst_str,
            "controller" => payload.controller,
            "lun" => payload.lun,
        );

        tokio::fs::copy(&payload.host_path, &dst).await.map_err(
            |source| ScsiError::CloneCopy {
                src: payload.host_path.clone(),
                dst: dst_str.clone(),
                source,
            },
        )?;

        if let Err(source) = target
            .inner
            .access
            .grant(&ctx.vm_id, &dst_str, AccessKind::Individual)
            .await
        {
            let _ = tokio::fs::remove_file(&dst).await;
            return Err(ScsiError::AccessGrant { path: dst_str, source });
        }

        Ok(dst_str)
    }
}
