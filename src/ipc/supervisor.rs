//! Worker process lifecycle: spawn, observe, and terminate.
//!
//! Each spawned process gets four background tasks:
//!
//! - a stdin writer that owns the pipe and writes queued requests one whole
//!   line at a time,
//! - a stdout reader that frames lines and resolves pending requests,
//! - a stderr reader that forwards output to the log (never parsed),
//! - an exit observer that owns the `Child` and rejects pending requests if
//!   the worker dies on its own.
//!
//! Every spawn bumps a generation counter. Tasks remember the generation they
//! were started for, so a late exit from a replaced or stopped worker can
//! never clobber the current one.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, oneshot, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::error::BridgeError;
use super::framing::{parse_line, write_message, LineFramer};
use super::mode::{Mode, ProcessController, Shutdown, SystemProcessController};
use super::pending::RequestTable;
use crate::protocol::Request;

/// How long a gracefully stopped worker may take before it is killed.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// How long the exit observer waits for stdout to drain after the process
/// exits. Responses written just before exit must still resolve.
const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Lifecycle state of the worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Never started, or stopped.
    Absent,
    /// Spawned and not yet observed to exit.
    Running,
    /// Exited on its own. A later call respawns it.
    Exited,
}

/// A request queued for the worker's stdin.
struct WriteJob {
    request: Request,
    /// Outcome of the write, reported back to the caller.
    done: oneshot::Sender<io::Result<()>>,
}

/// The live worker: its stdin queue and the means to kill it.
struct Worker {
    writer_tx: mpsc::UnboundedSender<WriteJob>,
    writer: JoinHandle<()>,
    pid: Option<u32>,
    /// Fires the exit observer's hard kill.
    kill_tx: oneshot::Sender<()>,
}

/// Mutable supervisor state, guarded by one mutex.
pub(crate) struct Slot {
    worker: Option<Worker>,
    state: WorkerState,
    generation: u64,
}

impl Slot {
    /// Queue a request for the running worker.
    ///
    /// The receiver yields the write outcome, or errors if the writer went
    /// away first because the worker was stopped. Returns `None` when no
    /// worker is running.
    pub(crate) fn enqueue(&self, request: Request) -> Option<oneshot::Receiver<io::Result<()>>> {
        let worker = self.worker.as_ref()?;
        let (done, rx) = oneshot::channel();
        worker.writer_tx.send(WriteJob { request, done }).ok()?;
        Some(rx)
    }

    /// Take the worker out and have its exit observer kill it.
    fn release(&mut self) -> Option<u32> {
        let worker = self.worker.take()?;
        self.state = WorkerState::Absent;
        worker.writer.abort();
        let _ = worker.kill_tx.send(());
        worker.pid
    }
}

/// Spawns, monitors, and terminates the worker process.
pub struct ProcessSupervisor {
    mode: Mode,
    controller: Arc<dyn ProcessController>,
    slot: Arc<Mutex<Slot>>,
    pending: Arc<Mutex<RequestTable>>,
}

impl ProcessSupervisor {
    /// Create a supervisor using the operating system's process controller.
    pub fn new(mode: Mode, pending: Arc<Mutex<RequestTable>>) -> Self {
        Self::with_controller(mode, pending, Arc::new(SystemProcessController))
    }

    /// Create a supervisor with an explicit process controller.
    pub fn with_controller(
        mode: Mode,
        pending: Arc<Mutex<RequestTable>>,
        controller: Arc<dyn ProcessController>,
    ) -> Self {
        Self {
            mode,
            controller,
            slot: Arc::new(Mutex::new(Slot {
                worker: None,
                state: WorkerState::Absent,
                generation: 0,
            })),
            pending,
        }
    }

    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    /// Start the worker if it is not running. Returns its pid.
    ///
    /// Idempotent: a running worker is left untouched.
    ///
    /// # Errors
    ///
    /// Returns `BridgeError::BackendNotReady` if the process cannot be
    /// spawned or its pipes cannot be captured.
    pub async fn start(&self) -> Result<Option<u32>, BridgeError> {
        let slot = self.acquire().await?;
        Ok(slot.worker.as_ref().and_then(|w| w.pid))
    }

    /// Lock the slot, spawning the worker first if needed.
    ///
    /// Holding the returned guard keeps other callers from spawning or
    /// enqueueing concurrently, so lazy start spawns exactly once and ids
    /// reach the worker in allocation order. Nothing awaits I/O under it.
    pub(crate) async fn acquire(&self) -> Result<MutexGuard<'_, Slot>, BridgeError> {
        let mut slot = self.slot.lock().await;

        if slot.worker.is_none() {
            if let Err(e) = self.spawn_locked(&mut slot) {
                error!("Failed to start {} worker: {}", self.mode.name(), e);
                return Err(BridgeError::BackendNotReady(format!(
                    "failed to start worker `{}`: {}",
                    self.mode.program().display(),
                    e
                )));
            }
        }

        Ok(slot)
    }

    fn spawn_locked(&self, slot: &mut Slot) -> io::Result<()> {
        info!("Starting worker: {}", self.mode);

        let mut child = self.mode.command().spawn()?;

        // A child dropped on these error paths is killed (kill_on_drop).
        let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

        slot.generation += 1;
        let generation = slot.generation;
        let pid = child.id();

        let (writer_tx, jobs) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_stdin(stdin, jobs, generation));
        let stdout_task = tokio::spawn(read_stdout(stdout, Arc::clone(&self.pending), generation));
        tokio::spawn(read_stderr(stderr, generation));

        let (kill_tx, kill_rx) = oneshot::channel();
        tokio::spawn(watch_exit(
            child,
            kill_rx,
            stdout_task,
            Arc::clone(&self.slot),
            Arc::clone(&self.pending),
            generation,
        ));

        slot.worker = Some(Worker {
            writer_tx,
            writer,
            pid,
            kill_tx,
        });
        slot.state = WorkerState::Running;

        info!(generation, pid = ?pid, "Worker started");
        Ok(())
    }

    /// Stop the worker and reject every pending request with
    /// `BackendStopped`.
    ///
    /// Does not wait for the process to die, nor for a write the worker is
    /// not reading; a following `start()` spawns a fresh worker regardless.
    /// Idempotent when no worker is running.
    pub async fn stop(&self) {
        let mut slot = self.slot.lock().await;

        let Some(worker) = slot.worker.take() else {
            debug!("Stop requested with no running worker");
            slot.state = WorkerState::Absent;
            return;
        };
        slot.state = WorkerState::Absent;

        let Worker {
            writer_tx,
            writer,
            pid,
            kill_tx,
        } = worker;
        // Closing stdin lets well-behaved workers exit on EOF. Aborting the
        // writer also abandons a write blocked on a full pipe.
        drop(writer_tx);
        writer.abort();

        match self.mode.shutdown() {
            Shutdown::Graceful => {
                let signalled = match pid {
                    Some(pid) => match self.controller.terminate(pid) {
                        Ok(()) => true,
                        Err(e) => {
                            warn!(pid, "Graceful termination failed: {}", e);
                            false
                        }
                    },
                    None => false,
                };

                if signalled {
                    info!(pid = ?pid, "Sent termination signal to worker");
                    tokio::spawn(async move {
                        tokio::time::sleep(SHUTDOWN_GRACE).await;
                        // Fails harmlessly if the worker is already gone.
                        let _ = kill_tx.send(());
                    });
                } else {
                    let _ = kill_tx.send(());
                }
            }
            Shutdown::KillByName(image_name) => {
                match self.controller.kill_by_name(&image_name) {
                    Ok(()) => info!(image_name = %image_name, "Killing worker processes by name"),
                    Err(e) => warn!(image_name = %image_name, "Kill by name failed: {}", e),
                }
                // A name match can miss the tracked process: Linux compares
                // at most 15 bytes of the image name.
                let _ = kill_tx.send(());
            }
        }

        let rejected = self.pending.lock().await.reject_all(BridgeError::BackendStopped);
        if rejected > 0 {
            info!(rejected, "Rejected pending requests on stop");
        }
    }

    pub async fn state(&self) -> WorkerState {
        self.slot.lock().await.state
    }

    /// Number of successful spawns so far.
    pub async fn generation(&self) -> u64 {
        self.slot.lock().await.generation
    }

    /// Pid of the running worker.
    pub async fn pid(&self) -> Option<u32> {
        self.slot.lock().await.worker.as_ref().and_then(|w| w.pid)
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        // The exit observer outlives the supervisor; tell it to kill the
        // worker instead of leaving it running until the runtime shuts down.
        match self.slot.try_lock() {
            Ok(mut slot) => {
                if let Some(pid) = slot.release() {
                    debug!(pid, "Supervisor dropped, killing worker");
                }
            }
            Err(_) => {
                let slot = Arc::clone(&self.slot);
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        slot.lock().await.release();
                    });
                }
            }
        }
    }
}

fn missing_pipe(name: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::BrokenPipe,
        format!("worker {} was not captured", name),
    )
}

/// Write queued requests to the worker's stdin in order.
///
/// Requests whose caller gave up before the write started are skipped.
async fn write_stdin(
    mut stdin: ChildStdin,
    mut jobs: mpsc::UnboundedReceiver<WriteJob>,
    generation: u64,
) {
    while let Some(job) = jobs.recv().await {
        let id = job.request.id;
        if job.done.is_closed() {
            debug!(generation, id, "Skipping abandoned request");
            continue;
        }

        let result = write_message(&mut stdin, &job.request).await;
        if let Err(e) = &result {
            debug!(generation, id, "Failed to write request: {}", e);
        }
        let _ = job.done.send(result);
    }
    debug!(generation, "Worker stdin closed");
}

/// Frame stdout into lines and resolve each parsed response in order.
async fn read_stdout<R>(mut stdout: R, pending: Arc<Mutex<RequestTable>>, generation: u64)
where
    R: AsyncRead + Unpin,
{
    let mut framer = LineFramer::new();
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    loop {
        let n = match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(generation, "Failed to read worker stdout: {}", e);
                break;
            }
        };

        let responses: Vec<_> = framer
            .push(&buf[..n])
            .iter()
            .filter_map(|line| parse_line(line))
            .collect();
        if responses.is_empty() {
            continue;
        }

        let mut table = pending.lock().await;
        for response in responses {
            table.resolve(response);
        }
    }

    if framer.pending_len() > 0 {
        debug!(
            generation,
            bytes = framer.pending_len(),
            "Discarding unterminated worker output"
        );
    }
    debug!(generation, "Worker stdout closed");
}

/// Forward worker stderr to the log, one line at a time.
async fn read_stderr<R>(stderr: R, generation: u64)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end();
                if !text.is_empty() {
                    warn!(generation, worker = %text, "Worker stderr");
                }
            }
            Err(e) => {
                debug!(generation, "Failed to read worker stderr: {}", e);
                break;
            }
        }
    }
}

/// Wait for the worker to exit, then reject pending requests if it was
/// still the current worker.
async fn watch_exit(
    mut child: Child,
    mut kill_rx: oneshot::Receiver<()>,
    stdout_task: JoinHandle<()>,
    slot: Arc<Mutex<Slot>>,
    pending: Arc<Mutex<RequestTable>>,
    generation: u64,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = &mut kill_rx => {
            debug!(generation, "Killing worker");
            if let Err(e) = child.start_kill() {
                debug!(generation, "Kill failed: {}", e);
            }
            child.wait().await
        }
    };

    let code = match &status {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(generation, "Failed to wait for worker: {}", e);
            None
        }
    };

    // Let responses written just before exit reach their callers first.
    if tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, stdout_task)
        .await
        .is_err()
    {
        debug!(generation, "Worker stdout still open after exit");
    }

    let mut current = slot.lock().await;
    if current.generation != generation || current.worker.is_none() {
        info!(generation, code = ?code, "Stopped worker exited");
        return;
    }

    current.worker = None;
    current.state = WorkerState::Exited;

    let rejected = pending
        .lock()
        .await
        .reject_all(BridgeError::BackendCrashed { code });
    warn!(
        generation,
        code = ?code,
        rejected,
        "Worker exited unexpectedly"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Default)]
    struct RecordingController {
        terminated: StdMutex<Vec<u32>>,
        killed: StdMutex<Vec<String>>,
    }

    impl ProcessController for RecordingController {
        fn terminate(&self, pid: u32) -> io::Result<()> {
            self.terminated.lock().unwrap().push(pid);
            Ok(())
        }

        fn kill_by_name(&self, image_name: &str) -> io::Result<()> {
            self.killed.lock().unwrap().push(image_name.to_string());
            Ok(())
        }
    }

    fn supervisor(mode: Mode) -> (ProcessSupervisor, Arc<RecordingController>) {
        let controller = Arc::new(RecordingController::default());
        let sup = ProcessSupervisor::with_controller(
            mode,
            Arc::new(Mutex::new(RequestTable::new())),
            controller.clone(),
        );
        (sup, controller)
    }

    #[tokio::test]
    async fn test_missing_executable_is_not_ready() {
        let (sup, _) = supervisor(Mode::packaged("/nonexistent/stdio-bridge-worker"));

        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, BridgeError::BackendNotReady(_)));
        assert!(err.to_string().contains("/nonexistent/stdio-bridge-worker"));
        assert_eq!(sup.state().await, WorkerState::Absent);
        assert_eq!(sup.generation().await, 0);
    }

    #[tokio::test]
    async fn test_stop_when_absent_is_noop() {
        let (sup, controller) = supervisor(Mode::development("unused.py"));

        sup.stop().await;
        sup.stop().await;

        assert_eq!(sup.state().await, WorkerState::Absent);
        assert!(controller.terminated.lock().unwrap().is_empty());
        assert!(controller.killed.lock().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (sup, _) = supervisor(Mode::Development {
            interpreter: "sh".to_string(),
            interpreter_args: vec!["-c".to_string(), "cat >/dev/null".to_string()],
            script: "worker".into(),
        });

        let first = sup.start().await.expect("worker should start");
        let second = sup.start().await.expect("start should be idempotent");

        assert!(first.is_some());
        assert_eq!(first, second);
        assert_eq!(sup.generation().await, 1);
        assert_eq!(sup.state().await, WorkerState::Running);

        sup.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_development_stop_signals_tracked_pid() {
        let (sup, controller) = supervisor(Mode::Development {
            interpreter: "sh".to_string(),
            interpreter_args: vec!["-c".to_string(), "cat >/dev/null".to_string()],
            script: "worker".into(),
        });

        let pid = sup.start().await.unwrap().expect("running worker has a pid");
        sup.stop().await;

        assert_eq!(*controller.terminated.lock().unwrap(), vec![pid]);
        assert!(controller.killed.lock().unwrap().is_empty());
        assert_eq!(sup.state().await, WorkerState::Absent);
        assert_eq!(sup.pid().await, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_marks_worker_exited() {
        let (sup, _) = supervisor(Mode::Development {
            interpreter: "sh".to_string(),
            interpreter_args: vec!["-c".to_string(), "exit 3".to_string()],
            script: "worker".into(),
        });

        sup.start().await.expect("worker should start");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while sup.state().await == WorkerState::Running {
            assert!(tokio::time::Instant::now() < deadline, "worker never exited");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert_eq!(sup.state().await, WorkerState::Exited);

        // A later start respawns.
        sup.start().await.expect("respawn should succeed");
        assert_eq!(sup.generation().await, 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_dropping_supervisor_kills_worker() {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        let (sup, _) = supervisor(Mode::Development {
            interpreter: "sh".to_string(),
            interpreter_args: vec!["-c".to_string(), "exec sleep 30".to_string()],
            script: "worker".into(),
        });

        let pid = sup.start().await.unwrap().expect("running worker has a pid");
        drop(sup);

        // The exit observer kills and reaps the worker, so the pid goes away.
        let pid = Pid::from_raw(pid as i32);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while kill(pid, None).is_ok() {
            assert!(tokio::time::Instant::now() < deadline, "worker outlived its supervisor");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
