// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Integrity (dm-verity) metadata lookup.
//!
//! Layer disks may carry a verity superblock describing their hash tree.
//! When present, the metadata is forwarded with guest add and remove
//! requests so the guest can construct and later cleanly tear down the
//! integrity-checking device-mapper target. The read is strictly
//! best-effort: a failure is logged by the dispatcher and never blocks the
//! operation.

use scsi_api_types::VerityInfo;

/// Reads dm-verity metadata from a disk image, if any is present.
pub trait VerityReader: Send + Sync {
    /// Returns `Ok(None)` for disks with no verity superblock.
    fn read_verity_info(
        &self,
        host_path: &str,
    ) -> anyhow::Result<Option<VerityInfo>>;
}

/// Reader for platforms without integrity-protected disks.
pub struct NoVerity;

impl VerityReader for NoVerity {
    fn read_verity_info(
        &self,
        _host_path: &str,
    ) -> anyhow::Result<Option<VerityInfo>> {
        Ok(None)
    }
}
