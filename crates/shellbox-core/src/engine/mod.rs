//! Execution engine: launch, capture, terminate, classify
//!
//! One polymorphic engine over three backends (unconstrained host process,
//! Seatbelt-profiled process, container). Every run produces exactly one
//! [`ExecutionOutcome`] and never re-executes the command.

pub mod container;
pub mod host;
pub mod process;
pub mod seatbelt;

use async_trait::async_trait;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::environment::ExecutionPlan;
use crate::error::SandboxError;
use crate::profile::Isolation;

pub use container::ContainerBackend;
pub use host::HostBackend;
pub use seatbelt::SeatbeltBackend;

/// Lifecycle of one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Pending,
    Starting,
    Running,
    Completed,
    TimedOut,
    Crashed,
    LaunchFailed,
}

/// Appended to a stream cut off at the output limit
pub const TRUNCATION_MARKER: &str = "\n... [output truncated]";

/// Per-stream capture limit when none is configured (1MB)
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Raw terminal result of a run
#[derive(Debug)]
pub struct ExecutionOutcome {
    pub state: RunState,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Streams that hit the output limit; the rest was drained and dropped
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub timed_out: bool,
    pub cancelled: bool,
    pub signal: Option<String>,
    /// Launch or runtime failure that prevented a normal run
    pub failure: Option<SandboxError>,
    pub pid: Option<u32>,
    pub duration_ms: u64,
}

impl ExecutionOutcome {
    pub fn launch_failed(error: SandboxError) -> Self {
        Self {
            state: RunState::LaunchFailed,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
            timed_out: false,
            cancelled: false,
            signal: None,
            failure: Some(error),
            pid: None,
            duration_ms: 0,
        }
    }

    /// Exited with status 0, on its own, with nothing going wrong
    pub fn is_clean(&self) -> bool {
        self.exit_code == Some(0) && !self.timed_out && !self.cancelled && self.failure.is_none()
    }
}

/// Capability set every isolation backend provides.
///
/// Output capture is shared by the engine; backends only decide how a
/// process is launched, stopped and torn down.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Create or reuse shared resources the launch depends on.
    async fn prepare(&self, _plan: &ExecutionPlan) -> Result<(), SandboxError> {
        Ok(())
    }

    /// Command that launches the sandboxed process.
    fn command(&self, plan: &ExecutionPlan) -> Command;

    /// Recognise a launch failure reported by the mechanism itself after the
    /// launcher process exited (e.g. the engine's own diagnostic on stderr).
    fn launch_failure(
        &self,
        _status: &ExitStatus,
        _stdout: &str,
        _stderr: &str,
    ) -> Option<SandboxError> {
        None
    }

    /// Graceful termination, forced after `grace`.
    async fn terminate(&self, _plan: &ExecutionPlan, child: &mut Child, grace: Duration) {
        process::terminate_gracefully(child, grace).await;
    }

    /// Teardown awaited at the end of every run.
    async fn reclaim(&self, _plan: &ExecutionPlan, pid: Option<u32>) {
        if let Some(pid) = pid {
            process::kill_group(pid);
        }
    }

    /// Teardown for a run whose future was dropped before `reclaim` ran.
    /// Must not block; slow work is handed to the runtime.
    fn reclaim_detached(&self, _plan: &ExecutionPlan, pid: Option<u32>) {
        if let Some(pid) = pid {
            process::kill_group(pid);
        }
    }
}

/// Pick the backend for a resolved isolation mechanism.
pub fn backend_for(isolation: &Isolation) -> Box<dyn Backend> {
    match isolation {
        Isolation::Unconstrained => Box::new(HostBackend),
        Isolation::OsProfile(profile) => Box::new(SeatbeltBackend::new(*profile)),
        Isolation::Container { engine, image } => {
            Box::new(ContainerBackend::new(*engine, image.clone()))
        }
    }
}

/// Tears the run down if `run_with` is dropped before its own teardown.
struct TeardownGuard<'a> {
    backend: &'a dyn Backend,
    plan: &'a ExecutionPlan,
    pid: Option<u32>,
    armed: bool,
}

impl Drop for TeardownGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("Sandbox: run abandoned, reclaiming {} resources", self.backend.name());
            self.backend.reclaim_detached(self.plan, self.pid);
        }
    }
}

enum Ending {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Bytes captured from one stream, up to a limit
#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

impl Captured {
    fn into_text(self) -> (String, bool) {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        (text, self.truncated)
    }
}

type Sink = Arc<Mutex<Captured>>;

/// Read until EOF. Past `limit` the stream keeps being drained so the
/// child never blocks on a full pipe, but nothing more is kept.
fn spawn_capture<R>(mut reader: R, sink: Sink, limit: usize) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let mut captured = sink.lock().await;
                    let room = limit.saturating_sub(captured.bytes.len());
                    if n > room {
                        captured.truncated = true;
                    }
                    captured.bytes.extend_from_slice(&buf[..n.min(room)]);
                }
            }
        }
    })
}

/// Runs plans to completion
#[derive(Debug, Clone)]
pub struct Executor {
    grace: Duration,
    max_output_bytes: usize,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new(Duration::from_millis(2000))
    }
}

impl Executor {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    /// Cap what is kept of each output stream.
    pub fn with_output_limit(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes;
        self
    }

    /// Run a plan with the backend matching its isolation.
    pub async fn run(
        &self,
        plan: ExecutionPlan,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> ExecutionOutcome {
        let backend = backend_for(plan.isolation());
        self.run_with(backend.as_ref(), plan, timeout, cancel).await
    }

    /// Run a plan with an explicit backend.
    pub async fn run_with(
        &self,
        backend: &dyn Backend,
        plan: ExecutionPlan,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> ExecutionOutcome {
        let started = Instant::now();
        debug!("Sandbox: {:?} -> {:?} ({})", RunState::Pending, RunState::Starting, backend.name());

        if let Err(e) = backend.prepare(&plan).await {
            warn!("Sandbox: {} preparation failed: {}", backend.name(), e);
            return ExecutionOutcome::launch_failed(e);
        }

        let mut guard = TeardownGuard {
            backend,
            plan: &plan,
            pid: None,
            armed: true,
        };

        let mut cmd = backend.command(&plan);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Sandbox: failed to launch {}: {}", backend.name(), e);
                guard.armed = false;
                return ExecutionOutcome::launch_failed(SandboxError::EngineLaunch {
                    engine: backend.name().to_string(),
                    message: e.to_string(),
                });
            }
        };
        guard.pid = child.id();
        debug!("Sandbox: {:?} (pid {:?})", RunState::Running, guard.pid);

        let stdout: Sink = Arc::default();
        let stderr: Sink = Arc::default();
        let mut captures = Vec::with_capacity(2);
        if let Some(out) = child.stdout.take() {
            captures.push(spawn_capture(out, stdout.clone(), self.max_output_bytes));
        }
        if let Some(err) = child.stderr.take() {
            captures.push(spawn_capture(err, stderr.clone(), self.max_output_bytes));
        }

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let ending = tokio::select! {
            status = child.wait() => Ending::Exited(status),
            _ = &mut deadline => Ending::TimedOut,
            _ = cancel.cancelled() => Ending::Cancelled,
        };

        if matches!(ending, Ending::TimedOut | Ending::Cancelled) {
            info!(
                "Sandbox: {} after {:?}, terminating {}",
                if matches!(ending, Ending::TimedOut) { "timed out" } else { "cancelled" },
                started.elapsed(),
                backend.name()
            );
            backend.terminate(&plan, &mut child, self.grace).await;
        }

        // Join point: both streams reach EOF, or are cut off after the grace period.
        let aborts: Vec<_> = captures.iter().map(|t| t.abort_handle()).collect();
        let drained = tokio::time::timeout(self.grace, async {
            for task in captures {
                let _ = task.await;
            }
        })
        .await;
        if drained.is_err() {
            debug!("Sandbox: output still open after exit, closing capture");
            aborts.iter().for_each(|a| a.abort());
        }

        let (stdout, stdout_truncated) = std::mem::take(&mut *stdout.lock().await).into_text();
        let (stderr, stderr_truncated) = std::mem::take(&mut *stderr.lock().await).into_text();
        if stdout_truncated || stderr_truncated {
            warn!(
                "Sandbox: output exceeded {} bytes, truncated (stdout={}, stderr={})",
                self.max_output_bytes, stdout_truncated, stderr_truncated
            );
        }

        let mut outcome = ExecutionOutcome {
            state: RunState::Completed,
            exit_code: None,
            stdout,
            stderr,
            stdout_truncated,
            stderr_truncated,
            timed_out: false,
            cancelled: false,
            signal: None,
            failure: None,
            pid: guard.pid,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        match ending {
            Ending::Exited(Ok(status)) => {
                if let Some(error) =
                    backend.launch_failure(&status, &outcome.stdout, &outcome.stderr)
                {
                    warn!("Sandbox: {} reported a launch failure: {}", backend.name(), error);
                    outcome.state = RunState::LaunchFailed;
                    outcome.failure = Some(error);
                } else {
                    outcome.exit_code = status.code();
                    outcome.signal = process::signal_name(&status);
                }
            }
            Ending::Exited(Err(e)) => {
                warn!("Sandbox: lost track of {} process: {}", backend.name(), e);
                outcome.state = RunState::Crashed;
                outcome.failure = Some(SandboxError::Io(e));
            }
            Ending::TimedOut => {
                outcome.state = RunState::TimedOut;
                outcome.timed_out = true;
            }
            Ending::Cancelled => {
                outcome.state = RunState::TimedOut;
                outcome.cancelled = true;
            }
        }

        backend.reclaim(&plan, guard.pid).await;
        guard.armed = false;
        info!(
            "Sandbox: {} run finished ({:?}, exit={:?}, {}ms)",
            backend.name(),
            outcome.state,
            outcome.exit_code,
            outcome.duration_ms
        );
        outcome
    }
}
