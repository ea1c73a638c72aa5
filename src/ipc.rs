//! Stdio RPC bridge to a worker process.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐   stdin: request lines    ┌─────────────────────┐
//! │   Host          │ ─────────────────────────►│   Worker process    │
//! │  (BridgeClient) │ ◄─────────────────────────│  (Python script or  │
//! └─────────────────┘   stdout: response lines  │  packaged binary)   │
//!                       stderr: log only        └─────────────────────┘
//! ```
//!
//! # Protocol
//!
//! One JSON object per `\n`-terminated line:
//!
//! ```text
//! {"id":1,"method":"ping","params":{}}
//! {"id":1,"result":"pong"}
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use stdio_bridge::ipc::BridgeClient;
//! use stdio_bridge::BridgeConfig;
//! use serde_json::json;
//!
//! let client = BridgeClient::new(BridgeConfig::development("backend/helper/runtime.py"));
//! let result = client.call("add", json!({"a": 1, "b": 2})).await?;
//! client.stop().await;
//! ```

mod client;
mod error;
mod framing;
pub mod mode;
mod pending;
mod supervisor;

pub use client::BridgeClient;
pub use error::BridgeError;
pub use framing::{parse_line, write_message, LineFramer};
pub use mode::{Mode, ProcessController, Shutdown, SystemProcessController};
pub use pending::{CallResult, RequestTable};
pub use supervisor::{ProcessSupervisor, WorkerState, SHUTDOWN_GRACE};
