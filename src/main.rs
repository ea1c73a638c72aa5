//! stdio-bridge - line-oriented host shell for a stdio worker.
//!
//! Reads `<method> [json-params]` lines from stdin, forwards each as a call
//! to the worker, and prints one JSON result line per call to stdout. Calls
//! run concurrently; results are printed as they settle. The worker is
//! stopped on EOF (after outstanding calls finish) or on Ctrl-C.
//!
//! ```text
//! $ printf 'ping\nadd {"a": 1, "b": 2}\n' | stdio-bridge
//! {"seq":1,"method":"ping","result":"pong"}
//! {"seq":2,"method":"add","result":3}
//! ```
//!
//! Logs go to stderr; set `RUST_LOG` to adjust verbosity.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stdio_bridge::{BridgeClient, BridgeConfig};

/// One parsed input line.
#[derive(Debug, PartialEq)]
struct Command {
    method: String,
    params: Value,
}

/// Parse `<method> [json-params]`. Blank lines and `#` comments yield `None`.
fn parse_command(line: &str) -> Option<Result<Command, String>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let (method, rest) = match line.split_once(char::is_whitespace) {
        Some((method, rest)) => (method, rest.trim()),
        None => (line, ""),
    };

    let params = if rest.is_empty() {
        json!({})
    } else {
        match serde_json::from_str(rest) {
            Ok(params) => params,
            Err(e) => return Some(Err(format!("invalid params for `{}`: {}", method, e))),
        }
    };

    Some(Ok(Command {
        method: method.to_string(),
        params,
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging (stdout is reserved for results)
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "stdio_bridge=info".into()),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    tracing::info!("Starting stdio-bridge v{}", env!("CARGO_PKG_VERSION"));

    let config = BridgeConfig::from_env();
    tracing::info!("Worker mode: {}", config.mode);
    let client = Arc::new(BridgeClient::new(config));

    // Single writer so result lines never interleave.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();
    let printer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(value) = out_rx.recv().await {
            let mut line = value.to_string();
            line.push('\n');
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let mut calls = JoinSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut seq: u64 = 0;
    let mut interrupted = false;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read stdin")? else {
                    break;
                };
                let Some(parsed) = parse_command(&line) else {
                    continue;
                };
                seq += 1;

                match parsed {
                    Ok(Command { method, params }) => {
                        let client = Arc::clone(&client);
                        let out_tx = out_tx.clone();
                        calls.spawn(async move {
                            let line = match client.call(&method, params).await {
                                Ok(result) => json!({"seq": seq, "method": method, "result": result}),
                                Err(e) => json!({"seq": seq, "method": method, "error": e.to_string()}),
                            };
                            let _ = out_tx.send(line);
                        });
                    }
                    Err(message) => {
                        let _ = out_tx.send(json!({"seq": seq, "error": message}));
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                interrupted = true;
                break;
            }
        }
    }

    if !interrupted {
        // EOF: let outstanding calls finish unless interrupted meanwhile.
        tokio::select! {
            _ = async { while calls.join_next().await.is_some() {} } => {}
            _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted"),
        }
    }

    client.stop().await;
    while calls.join_next().await.is_some() {}

    drop(out_tx);
    printer.await.context("Result printer failed")?;

    tracing::info!("stdio-bridge exited cleanly");
    Ok(())
}
