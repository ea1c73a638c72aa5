//! Error taxonomy for bridge calls.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// Errors a `call()` can settle with.
///
/// Malformed worker output and responses with unknown ids are not errors a
/// caller can observe; they are logged and dropped by the reader task.
///
/// The enum is `Clone` so one crash or stop can reject every pending call;
/// underlying I/O and JSON errors are shared behind an `Arc`.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    /// No running worker with a writable stdin.
    #[error("Backend not ready: {0}")]
    BackendNotReady(String),

    /// The worker exited while the request was pending.
    #[error("Backend crashed{}", exit_suffix(.code))]
    BackendCrashed {
        /// Exit code, if the worker exited normally rather than by signal.
        code: Option<i32>,
    },

    /// The bridge was stopped while the request was pending.
    #[error("Backend stopped")]
    BackendStopped,

    /// The worker answered with an error envelope.
    #[error("{}", display_remote(.error))]
    BackendError {
        /// The `error` field exactly as the worker sent it.
        error: Value,
        /// Worker-side traceback, if provided.
        trace: Option<String>,
    },

    /// Writing the request to the worker's stdin failed.
    #[error("Failed to write request: {0}")]
    WriteFailed(#[source] Arc<std::io::Error>),

    /// The request envelope could not be encoded.
    #[error("Failed to encode request: {0}")]
    Encode(#[source] Arc<serde_json::Error>),

    /// No response arrived before the configured deadline.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),
}

impl BridgeError {
    /// Whether this error means the worker process is gone or unusable, as
    /// opposed to the worker rejecting this particular request.
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            BridgeError::BackendNotReady(_)
                | BridgeError::BackendCrashed { .. }
                | BridgeError::BackendStopped
                | BridgeError::WriteFailed(_)
        )
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::WriteFailed(Arc::new(err))
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::Encode(Arc::new(err))
    }
}

fn exit_suffix(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" (exit code {})", code),
        None => String::new(),
    }
}

/// Workers usually send `str(exception)`; show that verbatim and fall back
/// to compact JSON for structured errors.
fn display_remote(error: &Value) -> String {
    match error {
        Value::String(message) => message.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_error_display() {
        let not_ready = BridgeError::BackendNotReady("worker not running".to_string());
        assert_eq!(not_ready.to_string(), "Backend not ready: worker not running");

        let crashed = BridgeError::BackendCrashed { code: Some(1) };
        assert_eq!(crashed.to_string(), "Backend crashed (exit code 1)");

        let signalled = BridgeError::BackendCrashed { code: None };
        assert_eq!(signalled.to_string(), "Backend crashed");

        let timeout = BridgeError::Timeout(Duration::from_secs(30));
        assert_eq!(timeout.to_string(), "Request timed out after 30s");
    }

    #[test]
    fn test_backend_error_display() {
        let plain = BridgeError::BackendError {
            error: json!("bad args"),
            trace: None,
        };
        assert_eq!(plain.to_string(), "bad args");

        let structured = BridgeError::BackendError {
            error: json!({"code": 7}),
            trace: Some("Traceback".to_string()),
        };
        assert_eq!(structured.to_string(), r#"{"code":7}"#);
    }

    #[test]
    fn test_from_io_is_write_failure() {
        let err: BridgeError =
            std::io::Error::new(std::io::ErrorKind::BrokenPipe, "broken pipe").into();
        assert!(matches!(err, BridgeError::WriteFailed(_)));
        assert!(err.is_backend_failure());
        assert!(err.to_string().contains("broken pipe"));
    }

    #[test]
    fn test_remote_errors_are_not_backend_failures() {
        let err = BridgeError::BackendError {
            error: json!("nope"),
            trace: None,
        };
        assert!(!err.is_backend_failure());
        assert!(!BridgeError::Timeout(Duration::from_secs(1)).is_backend_failure());
    }
}
