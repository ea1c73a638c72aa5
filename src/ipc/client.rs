//! Public call surface of the bridge.
//!
//! `BridgeClient` owns the supervisor and the pending table. It is the only
//! value a host needs: build it once, share it by reference (or `Arc`), call
//! `stop()` on shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::debug;

use super::error::BridgeError;
use super::mode::{Mode, ProcessController};
use super::pending::RequestTable;
use super::supervisor::{ProcessSupervisor, WorkerState};
use crate::config::BridgeConfig;
use crate::protocol::Request;

/// RPC client for a worker process speaking newline-delimited JSON.
///
/// The worker is started lazily by the first `call()`, and again by the first
/// `call()` after it exits or is stopped.
///
/// # Example
///
/// ```ignore
/// use stdio_bridge::{BridgeClient, BridgeConfig};
/// use serde_json::json;
///
/// let client = BridgeClient::new(BridgeConfig::from_env());
/// let pong = client.call("ping", json!({})).await?;
/// client.stop().await;
/// ```
pub struct BridgeClient {
    supervisor: ProcessSupervisor,
    pending: Arc<Mutex<RequestTable>>,
    /// Monotonically increasing request ID counter. Never reset on respawn.
    request_id: AtomicU64,
    /// Optional per-call deadline.
    timeout: Option<Duration>,
}

impl BridgeClient {
    /// Build a client from configuration. Does not spawn anything.
    pub fn new(config: BridgeConfig) -> Self {
        let pending = Arc::new(Mutex::new(RequestTable::new()));
        let supervisor = ProcessSupervisor::new(config.mode, Arc::clone(&pending));
        Self::from_parts(supervisor, pending, config.request_timeout)
    }

    /// Build a client with an explicit process controller.
    pub fn with_controller(config: BridgeConfig, controller: Arc<dyn ProcessController>) -> Self {
        let pending = Arc::new(Mutex::new(RequestTable::new()));
        let supervisor =
            ProcessSupervisor::with_controller(config.mode, Arc::clone(&pending), controller);
        Self::from_parts(supervisor, pending, config.request_timeout)
    }

    fn from_parts(
        supervisor: ProcessSupervisor,
        pending: Arc<Mutex<RequestTable>>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            supervisor,
            pending,
            request_id: AtomicU64::new(1),
            timeout,
        }
    }

    /// Call a worker method and wait for its result.
    ///
    /// Starts the worker if it is not running. The configured deadline
    /// covers both the write and the response. Dropping the returned future
    /// abandons the call and removes its pending entry; a request already
    /// queued is still written as one whole line.
    ///
    /// # Errors
    ///
    /// - `BackendNotReady` if the worker cannot be started
    /// - `WriteFailed` if the request could not be written
    /// - `BackendError` if the worker answered with an error
    /// - `BackendCrashed` / `BackendStopped` if the worker went away first
    /// - `Timeout` if a deadline is configured and elapses
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, BridgeError> {
        let (guard, written, rx) = {
            let slot = self.supervisor.acquire().await?;

            let id = self.next_id();
            let rx = self.pending.lock().await.register(id);
            let guard = PendingGuard::new(&self.pending, id);

            debug!(id, method, "Sending request");
            let Some(written) = slot.enqueue(Request::new(method, params, id)) else {
                return Err(BridgeError::BackendNotReady(
                    "worker stdin is not available".to_string(),
                ));
            };

            (guard, written, rx)
        };
        let id = guard.id;

        let settle = async {
            // A dropped writer means the worker was stopped or exited; the
            // table entry settles with the reason.
            if let Ok(Err(e)) = written.await {
                self.pending.lock().await.remove(id);
                debug!(id, "Request write failed: {}", e);
                return Err(BridgeError::from(e));
            }

            // A dropped sender means the table lost the entry without
            // settling it; treat that like losing the worker.
            rx.await
                .unwrap_or(Err(BridgeError::BackendCrashed { code: None }))
        };

        let outcome = match self.timeout {
            Some(limit) => match timeout(limit, settle).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.pending.lock().await.remove(id);
                    Err(BridgeError::Timeout(limit))
                }
            },
            None => settle.await,
        };

        guard.disarm();
        outcome
    }

    /// Start the worker now instead of on the first call.
    pub async fn start(&self) -> Result<Option<u32>, BridgeError> {
        self.supervisor.start().await
    }

    /// Stop the worker. Pending calls fail with `BackendStopped`.
    pub async fn stop(&self) {
        self.supervisor.stop().await
    }

    pub async fn state(&self) -> WorkerState {
        self.supervisor.state().await
    }

    /// Number of worker processes spawned so far.
    pub async fn spawn_count(&self) -> u64 {
        self.supervisor.generation().await
    }

    /// Number of calls waiting for a response.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub fn mode(&self) -> &Mode {
        self.supervisor.mode()
    }

    /// Set the per-call deadline. `None` waits indefinitely.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// The id the next request will use.
    pub fn peek_next_id(&self) -> u64 {
        self.request_id.load(Ordering::Relaxed)
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// Removes a call's pending entry if the call is dropped before it settles.
struct PendingGuard<'a> {
    pending: &'a Arc<Mutex<RequestTable>>,
    id: u64,
    armed: bool,
}

impl<'a> PendingGuard<'a> {
    fn new(pending: &'a Arc<Mutex<RequestTable>>, id: u64) -> Self {
        Self {
            pending,
            id,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let id = self.id;
        match self.pending.try_lock() {
            Ok(mut table) => {
                if table.remove(id) {
                    debug!(id, "Abandoned call removed");
                }
            }
            Err(_) => {
                let pending = Arc::clone(self.pending);
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        pending.lock().await.remove(id);
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_call_without_worker_is_not_ready() {
        let client = BridgeClient::new(BridgeConfig::packaged("/nonexistent/stdio-bridge-worker"));

        let err = client.call("ping", json!({})).await.unwrap_err();
        assert!(matches!(err, BridgeError::BackendNotReady(_)));

        // No id was allocated and nothing is pending.
        assert_eq!(client.peek_next_id(), 1);
        assert_eq!(client.pending_count().await, 0);
        assert_eq!(client.state().await, WorkerState::Absent);
    }

    #[tokio::test]
    async fn test_stop_before_start_is_noop() {
        let client = BridgeClient::new(BridgeConfig::development("unused.py"));
        client.stop().await;
        assert_eq!(client.state().await, WorkerState::Absent);
        assert_eq!(client.spawn_count().await, 0);
    }

    #[tokio::test]
    async fn test_pending_guard_removes_unsettled_entry() {
        let pending = Arc::new(Mutex::new(RequestTable::new()));
        let _rx1 = pending.lock().await.register(1);
        let _rx2 = pending.lock().await.register(2);

        drop(PendingGuard::new(&pending, 1));
        PendingGuard::new(&pending, 2).disarm();

        let table = pending.lock().await;
        assert!(!table.contains(1));
        assert!(table.contains(2));
    }

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let client = BridgeClient::new(BridgeConfig::development("unused.py"));
        assert_eq!(client.next_id(), 1);
        assert_eq!(client.next_id(), 2);
        assert_eq!(client.peek_next_id(), 3);
    }
}
