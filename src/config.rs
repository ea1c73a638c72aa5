//! Bridge configuration, usually read from the environment.
//!
//! | Variable                    | Meaning                                        |
//! |-----------------------------|------------------------------------------------|
//! | `STDIO_BRIDGE_MODE`         | `PROD`/`packaged` or `DEV`/`development`       |
//! | `STDIO_BRIDGE_PYTHON`       | interpreter for development mode               |
//! | `STDIO_BRIDGE_SCRIPT`       | worker script for development mode             |
//! | `STDIO_BRIDGE_RESOURCES`    | resources dir holding the packaged executable  |
//! | `STDIO_BRIDGE_EXECUTABLE`   | explicit packaged executable                   |
//! | `STDIO_BRIDGE_TIMEOUT_SECS` | per-call timeout; `0` or unset disables it     |

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::ipc::mode::{packaged_executable_path, Mode};

/// Default development worker script, relative to the working directory.
pub const DEFAULT_SCRIPT: &str = "backend/helper/runtime.py";

/// Everything needed to build a `BridgeClient`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    pub mode: Mode,
    /// Per-call deadline. `None` waits until the worker answers or dies.
    pub request_timeout: Option<Duration>,
}

impl BridgeConfig {
    /// Development mode for `script` with default interpreter settings.
    pub fn development(script: impl Into<PathBuf>) -> Self {
        Self::from_mode(Mode::development(script))
    }

    /// Packaged mode for an explicit executable.
    pub fn packaged(executable: impl Into<PathBuf>) -> Self {
        Self::from_mode(Mode::packaged(executable))
    }

    pub fn from_mode(mode: Mode) -> Self {
        Self {
            mode,
            request_timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Read configuration from `STDIO_BRIDGE_*` environment variables.
    ///
    /// Invalid values are logged and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like `from_env`, reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let resources = var("STDIO_BRIDGE_RESOURCES")
            .map(PathBuf::from)
            .unwrap_or_else(default_resources_dir);
        let executable = var("STDIO_BRIDGE_EXECUTABLE")
            .map(PathBuf::from)
            .unwrap_or_else(|| packaged_executable_path(&resources));

        let packaged = match var("STDIO_BRIDGE_MODE").as_deref().map(parse_mode) {
            Some(Some(packaged)) => packaged,
            Some(None) => {
                tracing::warn!("Ignoring unrecognised STDIO_BRIDGE_MODE; detecting mode");
                executable.is_file()
            }
            None => executable.is_file(),
        };

        let mode = if packaged {
            tracing::info!("Using packaged worker: {}", executable.display());
            Mode::packaged(executable)
        } else {
            let script = var("STDIO_BRIDGE_SCRIPT").unwrap_or_else(|| DEFAULT_SCRIPT.to_string());
            let mut mode = Mode::development(script);
            if let (Some(python), Mode::Development { interpreter, .. }) =
                (var("STDIO_BRIDGE_PYTHON"), &mut mode)
            {
                tracing::info!("Using interpreter from STDIO_BRIDGE_PYTHON: {}", python);
                *interpreter = python;
            }
            mode
        };

        let request_timeout = var("STDIO_BRIDGE_TIMEOUT_SECS").and_then(|raw| {
            match raw.trim().parse::<u64>() {
                Ok(0) => None,
                Ok(secs) => Some(Duration::from_secs(secs)),
                Err(e) => {
                    tracing::warn!("Ignoring invalid STDIO_BRIDGE_TIMEOUT_SECS={}: {}", raw, e);
                    None
                }
            }
        });

        Self {
            mode,
            request_timeout,
        }
    }
}

/// `true` for packaged, `false` for development, `None` if unrecognised.
fn parse_mode(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "prod" | "packaged" | "production" => Some(true),
        "dev" | "development" => Some(false),
        _ => None,
    }
}

/// `<directory of the running executable>/resources`, falling back to
/// `./resources`.
fn default_resources_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_default()
        .join("resources")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_to_development_when_no_executable() {
        let config = BridgeConfig::from_lookup(lookup(&[(
            "STDIO_BRIDGE_RESOURCES",
            "/nonexistent/resources",
        )]));

        assert_eq!(config.mode, Mode::development(DEFAULT_SCRIPT));
        assert_eq!(config.request_timeout, None);
    }

    #[test]
    fn test_explicit_prod_mode() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("STDIO_BRIDGE_MODE", "PROD"),
            ("STDIO_BRIDGE_RESOURCES", "/opt/app/resources"),
        ]));

        assert_eq!(
            config.mode,
            Mode::packaged(packaged_executable_path(Path::new("/opt/app/resources")))
        );
    }

    #[test]
    fn test_packaged_detected_when_executable_exists() {
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("worker-bin");
        std::fs::write(&exe, b"").unwrap();

        let config = BridgeConfig::from_lookup(lookup(&[(
            "STDIO_BRIDGE_EXECUTABLE",
            exe.to_str().unwrap(),
        )]));

        assert_eq!(config.mode, Mode::packaged(exe));
    }

    #[test]
    fn test_dev_overrides() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("STDIO_BRIDGE_MODE", "dev"),
            ("STDIO_BRIDGE_PYTHON", "/usr/bin/python3.12"),
            ("STDIO_BRIDGE_SCRIPT", "worker/main.py"),
            ("STDIO_BRIDGE_TIMEOUT_SECS", "15"),
        ]));

        assert_eq!(
            config.mode,
            Mode::Development {
                interpreter: "/usr/bin/python3.12".to_string(),
                interpreter_args: vec!["-B".to_string(), "-u".to_string()],
                script: PathBuf::from("worker/main.py"),
            }
        );
        assert_eq!(config.request_timeout, Some(Duration::from_secs(15)));
    }

    #[test]
    fn test_invalid_values_are_ignored() {
        let config = BridgeConfig::from_lookup(lookup(&[
            ("STDIO_BRIDGE_MODE", "staging"),
            ("STDIO_BRIDGE_RESOURCES", "/nonexistent/resources"),
            ("STDIO_BRIDGE_TIMEOUT_SECS", "soon"),
        ]));

        assert_eq!(config.mode.name(), "development");
        assert_eq!(config.request_timeout, None);
    }

    #[test]
    fn test_zero_timeout_disables_deadline() {
        let config = BridgeConfig::from_lookup(lookup(&[("STDIO_BRIDGE_TIMEOUT_SECS", "0")]));
        assert_eq!(config.request_timeout, None);

        let config = BridgeConfig::development("x.py").with_timeout(Duration::from_secs(3));
        assert_eq!(config.request_timeout, Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode("PROD"), Some(true));
        assert_eq!(parse_mode(" packaged "), Some(true));
        assert_eq!(parse_mode("DEV"), Some(false));
        assert_eq!(parse_mode("development"), Some(false));
        assert_eq!(parse_mode("other"), None);
    }
}
