//! Receiver process supervision: launch, observe, probe and stop.

pub mod launch;
pub mod output;
pub mod recording;

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;

pub use self::launch::LaunchSpec;
pub use self::output::{Diagnostics, LineStream};
pub use self::recording::{validate_recording, RecordingError, RecordingInfo};

/// Time allowed for stderr to drain after exit before a crash report is built.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

/// Errors raised before or while spawning a process.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("executable {program:?} not found")]
    NotFound { program: String },

    #[error("permission denied executing {}", path.display())]
    PermissionDenied { path: PathBuf },

    #[error("working directory {} does not exist", path.display())]
    WorkingDirectory { path: PathBuf },

    #[error("invalid launch arguments: {reason}")]
    InvalidArgument { reason: String },

    #[error("listen address {addr} is already in use")]
    PortInUse { addr: SocketAddr },

    #[error("spawning {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Errors raised while stopping a process.
#[derive(Debug, Error)]
pub enum ShutdownError {
    /// The process ignored SIGTERM and had to be killed. It has been reaped.
    #[error("process ignored termination for {grace:?} and was killed ({status})")]
    Unresponsive { grace: Duration, status: String },

    #[error("process still running {timeout:?} after kill")]
    KillFailed { timeout: Duration },

    #[error("waiting for process exit: {0}")]
    Wait(#[source] io::Error),
}

/// The receiver exited without being asked to.
#[derive(Debug, Clone, Error)]
#[error("receiver exited unexpectedly ({status}){}", last_line(.stderr_tail))]
pub struct CrashError {
    pub status: String,
    pub stderr_tail: Vec<String>,
}

fn last_line(tail: &[String]) -> String {
    match tail.iter().rev().find(|l| !l.trim().is_empty()) {
        Some(line) => format!(": {}", line.trim()),
        None => String::new(),
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub status: ExitStatus,
    pub runtime: Duration,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Exit code or terminating signal, for logs and crash reports.
    pub fn describe(&self) -> String {
        if let Some(code) = self.status.code() {
            return format!("exit code {code}");
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = self.status.signal() {
                return format!("killed by signal {signal}");
            }
        }

        "unknown exit status".to_string()
    }
}

/// A running (or exited but not yet released) child process.
///
/// The OS process id is deliberately not exposed.
#[derive(Debug)]
pub struct ProcessHandle {
    program: String,
    child: Child,
    started: Instant,
    lines: Option<LineStream>,
    stdout_task: Option<JoinHandle<()>>,
    stderr_task: Option<JoinHandle<()>>,
    diagnostics: Arc<Diagnostics>,
    exit: Option<ExitReport>,
}

impl ProcessHandle {
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Exit report, once the process has been reaped.
    pub fn exit_report(&self) -> Option<ExitReport> {
        self.exit
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.diagnostics.peer()
    }

    pub fn stderr_tail(&self) -> Vec<String> {
        self.diagnostics.stderr_tail()
    }

    /// Crash report for an unexpected exit, after letting stderr drain.
    pub async fn crash_error(&mut self, report: &ExitReport) -> CrashError {
        if let Some(mut task) = self.stderr_task.take() {
            if timeout(STDERR_DRAIN_TIMEOUT, &mut task).await.is_err() {
                task.abort();
            }
        }

        CrashError {
            status: report.describe(),
            stderr_tail: self.diagnostics.stderr_tail(),
        }
    }

    fn record_exit(&mut self, status: ExitStatus) -> ExitReport {
        let report = ExitReport {
            status,
            runtime: self.started.elapsed(),
        };
        self.exit = Some(report);
        report
    }

    /// Aborts the reader tasks, which ends any outstanding `LineStream`.
    fn release(&mut self) {
        if let Some(task) = self.stdout_task.take() {
            task.abort();
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        self.lines = None;
    }
}

/// Starts and stops receiver processes.
#[derive(Debug, Clone)]
pub struct Supervisor {
    cfg: SupervisorConfig,
}

impl Supervisor {
    pub fn new(cfg: SupervisorConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.cfg
    }

    /// Validates `spec` and spawns it with piped stdout and stderr.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, spec: &LaunchSpec) -> Result<ProcessHandle, LaunchError> {
        let program = launch::preflight(spec)?;

        let mut cmd = Command::new(&program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => LaunchError::NotFound {
                program: spec.program.clone(),
            },
            io::ErrorKind::PermissionDenied => LaunchError::PermissionDenied {
                path: program.clone(),
            },
            _ => LaunchError::Spawn {
                program: spec.program.clone(),
                source: e,
            },
        })?;

        let (tx, rx) = mpsc::channel(self.cfg.line_channel_capacity.max(1));
        let diagnostics = Arc::new(Diagnostics::new(self.cfg.stderr_tail_lines));

        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(output::pump_stdout(out, tx, self.cfg.max_line_bytes)));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| {
                tokio::spawn(output::pump_stderr(
                    err,
                    diagnostics.clone(),
                    self.cfg.max_line_bytes,
                ))
            });

        info!(command = %spec.display(), "process started");

        Ok(ProcessHandle {
            program: spec.program.clone(),
            child,
            started: Instant::now(),
            lines: Some(LineStream::new(rx)),
            stdout_task,
            stderr_task,
            diagnostics,
            exit: None,
        })
    }

    /// Takes the stdout line stream. Returns `None` on every later call.
    pub fn observe(&self, handle: &mut ProcessHandle) -> Option<LineStream> {
        handle.lines.take()
    }

    /// Non-blocking liveness probe. `Some` once the process has exited.
    pub fn try_exit(&self, handle: &mut ProcessHandle) -> Result<Option<ExitReport>, ShutdownError> {
        if let Some(report) = handle.exit {
            return Ok(Some(report));
        }

        match handle.child.try_wait().map_err(ShutdownError::Wait)? {
            Some(status) => Ok(Some(handle.record_exit(status))),
            None => Ok(None),
        }
    }

    /// Waits up to `limit` for the process to exit on its own.
    pub async fn wait(
        &self,
        handle: &mut ProcessHandle,
        limit: Duration,
    ) -> Result<Option<ExitReport>, ShutdownError> {
        if let Some(report) = handle.exit {
            return Ok(Some(report));
        }

        match timeout(limit, handle.child.wait()).await {
            Ok(Ok(status)) => Ok(Some(handle.record_exit(status))),
            Ok(Err(e)) => Err(ShutdownError::Wait(e)),
            Err(_) => Ok(None),
        }
    }

    /// Stops the process: SIGTERM, up to `grace` to exit, then SIGKILL.
    ///
    /// Reader tasks are released on every path. Stopping an exited process
    /// returns its existing report.
    pub async fn stop(
        &self,
        handle: &mut ProcessHandle,
        grace: Duration,
    ) -> Result<ExitReport, ShutdownError> {
        let result = self.terminate(handle, grace).await;
        handle.release();
        result
    }

    async fn terminate(
        &self,
        handle: &mut ProcessHandle,
        grace: Duration,
    ) -> Result<ExitReport, ShutdownError> {
        if let Some(report) = self.try_exit(handle)? {
            return Ok(report);
        }

        if !send_terminate(&mut handle.child) {
            debug!(program = %handle.program, "terminate signal not delivered");
        }

        match timeout(grace, handle.child.wait()).await {
            Ok(Ok(status)) => {
                let report = handle.record_exit(status);
                info!(
                    program = %handle.program,
                    status = %report.describe(),
                    runtime = ?report.runtime,
                    "process stopped"
                );
                return Ok(report);
            }
            Ok(Err(e)) => warn!(error = %e, "waiting for terminated process"),
            Err(_) => warn!(grace = ?grace, program = %handle.program, "process ignored terminate, killing"),
        }

        if let Err(e) = handle.child.start_kill() {
            debug!(error = %e, "kill signal not delivered");
        }

        match timeout(self.cfg.kill_timeout, handle.child.wait()).await {
            Ok(Ok(status)) => {
                let report = handle.record_exit(status);
                Err(ShutdownError::Unresponsive {
                    grace,
                    status: report.describe(),
                })
            }
            Ok(Err(e)) => Err(ShutdownError::Wait(e)),
            Err(_) => Err(ShutdownError::KillFailed {
                timeout: self.cfg.kill_timeout,
            }),
        }
    }
}

/// Tracks automatic restarts left in a session.
#[derive(Debug, Clone, Copy)]
pub struct RestartBudget {
    max: u32,
    used: u32,
}

impl RestartBudget {
    pub fn new(max: u32) -> Self {
        Self { max, used: 0 }
    }

    /// Consumes one restart if any remain.
    pub fn try_consume(&mut self) -> bool {
        if self.used >= self.max {
            return false;
        }
        self.used += 1;
        true
    }

    pub fn used(&self) -> u32 {
        self.used
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(raw) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return false;
    };

    kill(Pid::from_raw(raw), Signal::SIGTERM).is_ok()
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) -> bool {
    child.start_kill().is_ok()
}
