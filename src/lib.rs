//! stdio-bridge library
//!
//! Lets a long-lived host process call into a separately spawned worker over
//! its stdin/stdout using newline-delimited JSON:
//!
//! - `ipc` - the bridge: framing, request table, process supervision, client
//! - `protocol` - request and response envelopes
//! - `config` - mode selection and settings from the environment
//!
//! ```ignore
//! use stdio_bridge::{BridgeClient, BridgeConfig};
//!
//! let client = BridgeClient::new(BridgeConfig::from_env());
//! let pong = client.call("ping", serde_json::json!({})).await?;
//! ```

pub mod config;
pub mod ipc;
pub mod protocol;

pub use config::BridgeConfig;
pub use ipc::{BridgeClient, BridgeError, Mode, WorkerState};
