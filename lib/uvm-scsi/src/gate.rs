// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! One-shot completion gates for in-flight registry entries.
//!
//! A registry record is created (under the registry lock) before the host or
//! guest call that realizes it is issued (outside the lock). Any concurrent
//! caller that finds such a record waits on its [`Gate`] rather than issuing
//! a duplicate call or acting on a half-initialized entry, and inherits the
//! initiating caller's result.
//!
//! The initiating caller holds a [`GateGuard`]; if its future is dropped
//! before it reports an outcome, the guard signals the gate with
//! [`Error::OperationAborted`] so no waiter blocks forever.

use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::Error;

pub(crate) type GateResult = Result<(), Arc<Error>>;

pub(crate) struct Gate {
    state: Mutex<Option<GateResult>>,
    notify: Notify,
}

impl Gate {
    /// An open gate, to be resolved by the caller issuing the underlying
    /// host/guest call.
    pub fn new() -> Arc<Self> {
        Arc::new(Self { state: Mutex::new(None), notify: Notify::new() })
    }

    /// An already-successful gate, for records created in a final state
    /// (attach-only mounts, imported clone records).
    pub fn closed() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(Some(Ok(()))),
            notify: Notify::new(),
        })
    }

    /// Take responsibility for resolving this gate.
    pub fn arm(self: Arc<Self>) -> GateGuard {
        GateGuard { gate: self, armed: true }
    }

    /// Wait until the gate is resolved, returning the stored outcome. Gates
    /// resolve exactly once; late arrivals return immediately.
    pub async fn wait(&self) -> GateResult {
        loop {
            // The notification future must exist before the state check, or
            // a resolution landing between the check and the await would be
            // missed.
            let notified = self.notify.notified();
            if let Some(res) = self.state.lock().unwrap().clone() {
                return res;
            }
            notified.await;
        }
    }

    fn resolve(&self, res: GateResult) {
        let mut state = self.state.lock().unwrap();
        if state.is_none() {
            *state = Some(res);
            self.notify.notify_waiters();
        }
    }
}

/// RAII responsibility for resolving a [`Gate`].
pub(crate) struct GateGuard {
    gate: Arc<Gate>,
    armed: bool,
}

impl GateGuard {
    pub fn complete(mut self, res: GateResult) {
        self.armed = false;
        self.gate.resolve(res);
    }
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        if self.armed {
            self.gate.resolve(Err(Arc::new(Error::OperationAborted)));
        }
    }
}
