//! Pending request table: correlates response ids with waiting callers.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use super::error::BridgeError;
use crate::protocol::Response;

/// Settlement of a single call.
pub type CallResult = Result<Value, BridgeError>;

/// Map from outstanding request id to the sender that settles it.
///
/// Each entry is settled at most once: `resolve` and `reject_all` remove the
/// entry before sending, and `remove` drops it without sending.
#[derive(Debug, Default)]
pub struct RequestTable {
    pending: HashMap<u64, oneshot::Sender<CallResult>>,
}

impl RequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pending request and return the receiver its caller awaits.
    ///
    /// Registering an id that is already pending replaces the old entry; the
    /// displaced caller observes a dropped sender. Ids come from a monotonic
    /// counter, so this only happens on misuse.
    pub fn register(&mut self, id: u64) -> oneshot::Receiver<CallResult> {
        let (tx, rx) = oneshot::channel();
        if self.pending.insert(id, tx).is_some() {
            debug!(id, "Replaced an existing pending request");
        }
        rx
    }

    /// Settle the entry matching the response id.
    ///
    /// Returns `false` when no entry matched; the response is dropped without
    /// surfacing an error.
    pub fn resolve(&mut self, response: Response) -> bool {
        let Some(id) = response.id else {
            debug!("Dropping response without an id");
            return false;
        };

        let Some(tx) = self.pending.remove(&id) else {
            debug!(id, "Dropping response for unknown request id");
            return false;
        };

        let is_error = response.is_error();
        let outcome = match response.error {
            Some(error) if is_error => Err(BridgeError::BackendError {
                error,
                trace: response.trace,
            }),
            _ => Ok(response.result),
        };

        // The caller may have given up (e.g. dropped its future).
        if tx.send(outcome).is_err() {
            debug!(id, "Caller went away before its response arrived");
        }
        true
    }

    /// Drop an entry without settling it. Returns whether it existed.
    pub fn remove(&mut self, id: u64) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Settle every pending entry with `err` and clear the table.
    ///
    /// Returns the number of entries rejected.
    pub fn reject_all(&mut self, err: BridgeError) -> usize {
        let count = self.pending.len();
        for (_, tx) in self.pending.drain() {
            let _ = tx.send(Err(err.clone()));
        }
        count
    }

    pub fn contains(&self, id: u64) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
