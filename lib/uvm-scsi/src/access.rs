// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Filesystem access grants for the utility VM.
//!
//! Before a host file can back an attachment, the VM must be granted access
//! to it. How that happens (group ACL vs. an ACL for this one VM) is a
//! platform concern behind the [`AccessGrant`] trait; this crate only
//! decides *when* to grant, which is on every virtual-disk and pass-through
//! add, before any registry mutation, and again on the copies made while
//! cloning.

use async_trait::async_trait;

/// What access to grant the VM for a host path.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AccessKind {
    /// No additional access is needed; used for resources which were already
    /// made accessible outside this subsystem (e.g. image layers).
    #[default]
    Noop,
    /// Grant access to the group all utility VMs run under.
    Group,
    /// Grant access to this specific VM only.
    Individual,
}

/// Platform service applying filesystem ACLs for a VM.
#[async_trait]
pub trait AccessGrant: Send + Sync {
    async fn grant(
        &self,
        vm_id: &str,
        host_path: &str,
        kind: AccessKind,
    ) -> anyhow::Result<()>;
}

/// Grant implementation for platforms (or tests) where access control is
/// handled entirely outside this subsystem.
pub struct NoopAccess;

#[async_trait]
impl AccessGrant for NoopAccess {
    async fn grant(
        &self,
        _vm_id: &str,
        _host_path: &str,
        _kind: AccessKind,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}
