// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use thiserror::Error;

use crate::clone::PayloadError;
use crate::slots::Slot;

/// Errors surfaced by SCSI device management.
///
/// Capacity and state errors reflect the registry and are never retried
/// internally; transport errors carry the phase (host or guest) that failed,
/// with the registry rolled back (on add) so a retry starts clean.
#[derive(Debug, Error)]
pub enum Error {
    /// Every slot on every controller is either occupied or reserved.
    #[error("no available location")]
    NoAvailableLocation,

    #[error("no SCSI controllers configured for this utility VM")]
    NoScsiControllers,

    /// The requested host path has no live attachment.
    #[error("not attached")]
    NotAttached,

    /// The requested resource is already held in a way that forbids sharing,
    /// such as a guest path in use by a different attachment.
    #[error("already attached")]
    AlreadyAttached,

    /// A second, distinct guest path was requested on an attachment that
    /// only supports a single mount.
    #[error("more mounts than expected for attachment")]
    MoreMountsThanExpected,

    #[error("mount was already released")]
    AlreadyReleased,

    /// The caller that initiated the underlying host/guest call abandoned it
    /// before completion; waiters are unblocked with this error.
    #[error("operation aborted before completion")]
    OperationAborted,

    #[error("invalid extensible virtual disk path: {0}")]
    InvalidEvdPath(String),

    #[error("guest path cannot be empty for extensible virtual disk")]
    EvdGuestPathRequired,

    #[error("Windows guests only support SCSI controller 0")]
    WindowsController,

    #[error(
        "Windows guests do not support encrypted, partitioned, block-device, \
         or filesystem-option mounts"
    )]
    WindowsMountOptions,

    #[error("failed to grant VM access to {path}")]
    AccessGrant {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    /// The host-side attach/detach call failed.
    #[error("host {op} failed for device at {slot}")]
    HostTransport {
        op: &'static str,
        slot: Slot,
        #[source]
        source: anyhow::Error,
    },

    /// The guest-side mount/unmount/eject call failed.
    #[error("guest {op} failed for device at {slot}")]
    GuestTransport {
        op: &'static str,
        slot: Slot,
        #[source]
        source: anyhow::Error,
    },

    /// The outcome of an in-flight operation initiated by a concurrent
    /// caller, inherited by everyone who waited on its gate.
    #[error("{0}")]
    Shared(Arc<Error>),

    #[error("failed to copy {src} to {dst}")]
    CloneCopy {
        src: String,
        dst: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Payload(#[from] PayloadError),
}

impl Error {
    /// The underlying error, unwrapping the sharing layer added when
    /// multiple callers inherit one in-flight operation's outcome.
    pub fn root_cause(&self) -> &Error {
        match self {
            Error::Shared(inner) => inner.root_cause(),
            other => other,
        }
    }
}
