//! Deployment modes: how the worker is launched and how it is shut down.
//!
//! | Mode        | Spawn                                   | Shutdown                         |
//! |-------------|-----------------------------------------|----------------------------------|
//! | Development | `<interpreter> -B -u <script>`          | graceful signal to tracked pid   |
//! | Packaged    | `<resources>/app[.exe]`, no console     | forceful kill by executable name |
//!
//! # Packaged shutdown is coarse
//!
//! Packaged workers are frozen executables that may re-spawn themselves as a
//! child of a bootstrap process, so the pid we track is not necessarily the
//! one doing the work. Packaged shutdown therefore kills every process whose
//! image name matches the executable (`taskkill /F /T /IM` on Windows,
//! `pkill -x` elsewhere). Unrelated processes that happen to share the name
//! are terminated too.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

/// Base name of the packaged worker executable inside the resources dir.
pub const PACKAGED_EXECUTABLE_NAME: &str = "app";

/// Interpreter flags for development mode: no `.pyc` files, unbuffered stdio.
pub const DEFAULT_INTERPRETER_ARGS: &[&str] = &["-B", "-u"];

/// Default interpreter command for development mode.
pub fn default_interpreter() -> &'static str {
    if cfg!(windows) {
        "python"
    } else {
        "python3"
    }
}

/// How the worker process is launched and stopped. Chosen once when the
/// bridge is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Run a worker script through an interpreter.
    Development {
        interpreter: String,
        interpreter_args: Vec<String>,
        script: PathBuf,
    },
    /// Run a pre-built worker executable.
    Packaged { executable: PathBuf },
}

/// What `stop()` does to the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shutdown {
    /// Ask the tracked process to terminate.
    Graceful,
    /// Forcefully kill every process with this image name.
    KillByName(String),
}

impl Mode {
    /// Development mode with the platform's default interpreter and flags.
    pub fn development(script: impl Into<PathBuf>) -> Self {
        Mode::Development {
            interpreter: default_interpreter().to_string(),
            interpreter_args: DEFAULT_INTERPRETER_ARGS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            script: script.into(),
        }
    }

    /// Packaged mode for an explicit executable path.
    pub fn packaged(executable: impl Into<PathBuf>) -> Self {
        Mode::Packaged {
            executable: executable.into(),
        }
    }

    /// Packaged mode for the conventional executable inside `resources_dir`.
    pub fn packaged_in(resources_dir: &Path) -> Self {
        Self::packaged(packaged_executable_path(resources_dir))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Mode::Development { .. } => "development",
            Mode::Packaged { .. } => "packaged",
        }
    }

    /// The program that will be executed.
    pub fn program(&self) -> &Path {
        match self {
            Mode::Development { interpreter, .. } => Path::new(interpreter.as_str()),
            Mode::Packaged { executable } => executable,
        }
    }

    /// Build the spawn command with all three standard streams piped.
    pub fn command(&self) -> Command {
        let mut cmd = match self {
            Mode::Development {
                interpreter,
                interpreter_args,
                script,
            } => {
                let mut cmd = Command::new(interpreter);
                cmd.args(interpreter_args).arg(script);
                cmd
            }
            Mode::Packaged { executable } => {
                let mut cmd = Command::new(executable);
                #[cfg(windows)]
                {
                    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
                    cmd.creation_flags(CREATE_NO_WINDOW);
                }
                cmd
            }
        };

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Don't leave orphans behind if the runtime goes away first.
            .kill_on_drop(true);
        cmd
    }

    /// The shutdown strategy for this mode.
    pub fn shutdown(&self) -> Shutdown {
        match self {
            Mode::Development { .. } => Shutdown::Graceful,
            Mode::Packaged { executable } => Shutdown::KillByName(image_name(executable)),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Development {
                interpreter,
                script,
                ..
            } => write!(f, "development ({} {})", interpreter, script.display()),
            Mode::Packaged { executable } => write!(f, "packaged ({})", executable.display()),
        }
    }
}

/// `<resources_dir>/app` plus the platform executable suffix.
pub fn packaged_executable_path(resources_dir: &Path) -> PathBuf {
    resources_dir.join(format!(
        "{}{}",
        PACKAGED_EXECUTABLE_NAME,
        std::env::consts::EXE_SUFFIX
    ))
}

fn image_name(executable: &Path) -> String {
    executable
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| executable.display().to_string())
}

/// OS capability used by the supervisor to terminate workers.
///
/// Implementations must not block; both actions are fire-and-forget.
pub trait ProcessController: Send + Sync + fmt::Debug {
    /// Ask the process with this pid to terminate gracefully.
    fn terminate(&self, pid: u32) -> io::Result<()>;

    /// Forcefully kill every process whose image name is `image_name`.
    fn kill_by_name(&self, image_name: &str) -> io::Result<()>;
}

/// `ProcessController` backed by the host operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessController;

impl ProcessController for SystemProcessController {
    #[cfg(unix)]
    fn terminate(&self, pid: u32) -> io::Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let pid = i32::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
        kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(io::Error::from)
    }

    #[cfg(not(unix))]
    fn terminate(&self, _pid: u32) -> io::Result<()> {
        // No SIGTERM equivalent; the supervisor falls back to killing the handle.
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "graceful termination by pid is not supported on this platform",
        ))
    }

    fn kill_by_name(&self, image_name: &str) -> io::Result<()> {
        let mut cmd = if cfg!(windows) {
            let mut cmd = Command::new("taskkill");
            cmd.args(["/F", "/T", "/IM", image_name]);
            cmd
        } else {
            // Linux matches against the 15-character comm name.
            let mut cmd = Command::new("pkill");
            cmd.args(["-x", image_name]);
            cmd
        };

        // Dropped without waiting; tokio reaps the helper in the background.
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_development_defaults() {
        let mode = Mode::development("backend/helper/runtime.py");
        match &mode {
            Mode::Development {
                interpreter,
                interpreter_args,
                script,
            } => {
                assert_eq!(interpreter, default_interpreter());
                assert_eq!(interpreter_args, &vec!["-B".to_string(), "-u".to_string()]);
                assert_eq!(script, &PathBuf::from("backend/helper/runtime.py"));
            }
            other => panic!("Expected development mode, got {:?}", other),
        }
        assert_eq!(mode.shutdown(), Shutdown::Graceful);
        assert_eq!(mode.name(), "development");
    }

    #[test]
    fn test_packaged_in_resources_dir() {
        let mode = Mode::packaged_in(Path::new("/opt/myapp/resources"));
        let expected = PathBuf::from("/opt/myapp/resources")
            .join(format!("app{}", std::env::consts::EXE_SUFFIX));
        assert_eq!(mode.program(), expected.as_path());
        assert_eq!(mode.name(), "packaged");
    }

    #[test]
    fn test_packaged_shutdown_kills_by_image_name() {
        let mode = Mode::packaged("/opt/myapp/resources/app.exe");
        assert_eq!(mode.shutdown(), Shutdown::KillByName("app.exe".to_string()));
    }

    #[test]
    fn test_display() {
        let mode = Mode::Development {
            interpreter: "python3".to_string(),
            interpreter_args: vec![],
            script: PathBuf::from("runtime.py"),
        };
        assert_eq!(mode.to_string(), "development (python3 runtime.py)");

        let mode = Mode::packaged("/res/app");
        assert_eq!(mode.to_string(), "packaged (/res/app)");
    }

    #[test]
    fn test_development_command_line() {
        let mode = Mode::Development {
            interpreter: "python3".to_string(),
            interpreter_args: vec!["-B".to_string(), "-u".to_string()],
            script: PathBuf::from("runtime.py"),
        };
        let cmd = mode.command();
        let std_cmd = cmd.as_std();

        assert_eq!(std_cmd.get_program(), "python3");
        let args: Vec<_> = std_cmd.get_args().collect();
        assert_eq!(args, vec!["-B", "-u", "runtime.py"]);
    }
}
