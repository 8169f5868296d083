//! Session lifecycle: source selection, ingestion wiring and status.
//!
//! At most one session is active. Starting a new one fully stops the
//! previous session first. A live session owns one ingestion task, which in
//! turn owns the receiver process; nothing outside the task touches it.

mod ingest;
pub mod state;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, ReceiverConfig};
use crate::decoder::DecodeError;
use crate::export::HealthMetrics;
use crate::reconcile::{CaptureError, CaptureRecord, IncompleteTraceError, TraceReconciler};
use crate::sample::Source;
use crate::supervisor::{CrashError, LaunchError, ShutdownError, Supervisor};
use crate::timeline::{OutOfOrderError, Timeline, TimelineView};

use self::ingest::LiveIngest;
use self::state::StatusBoard;
pub use self::state::{FailureReport, SessionId, SessionState, SessionStatus};

/// Extra time allowed for the ingestion task to wind down on stop.
const STOP_MARGIN: Duration = Duration::from_secs(1);

/// Error category surfaced to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Launch,
    Shutdown,
    Crash,
    MalformedRecord,
    UnsupportedSchema,
    IncompleteTrace,
    OutOfOrder,
    Capture,
}

impl ErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Launch => "launch",
            Self::Shutdown => "shutdown",
            Self::Crash => "crash",
            Self::MalformedRecord => "malformed_record",
            Self::UnsupportedSchema => "unsupported_schema",
            Self::IncompleteTrace => "incomplete_trace",
            Self::OutOfOrder => "out_of_order",
            Self::Capture => "capture",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Any error a session can end with.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error(transparent)]
    Shutdown(#[from] ShutdownError),

    #[error(transparent)]
    Crash(#[from] CrashError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    IncompleteTrace(#[from] IncompleteTraceError),

    #[error(transparent)]
    OutOfOrder(#[from] OutOfOrderError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("ingestion task ended abnormally: {0}")]
    Task(String),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Launch(_) => ErrorKind::Launch,
            Self::Shutdown(_) | Self::Task(_) => ErrorKind::Shutdown,
            Self::Crash(_) => ErrorKind::Crash,
            Self::Decode(DecodeError::MalformedRecord { .. }) => ErrorKind::MalformedRecord,
            Self::Decode(DecodeError::UnsupportedSchema { .. }) => ErrorKind::UnsupportedSchema,
            Self::IncompleteTrace(_) => ErrorKind::IncompleteTrace,
            Self::OutOfOrder(_) => ErrorKind::OutOfOrder,
            Self::Capture(_) => ErrorKind::Capture,
        }
    }
}

struct ActiveSession {
    id: SessionId,
    cancel: CancellationToken,
    task: Option<JoinHandle<Result<(), SessionError>>>,
    timeline: Arc<Timeline>,
}

/// Owns the current session and its timeline.
pub struct SessionController {
    cfg: Config,
    supervisor: Supervisor,
    health: Option<Arc<HealthMetrics>>,
    board: Arc<StatusBoard>,
    active: Mutex<Option<ActiveSession>>,
    timeline: RwLock<Option<Arc<Timeline>>>,
}

impl SessionController {
    pub fn new(cfg: Config, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            supervisor: Supervisor::new(cfg.supervisor.clone()),
            board: Arc::new(StatusBoard::new(health.clone())),
            cfg,
            health,
            active: Mutex::new(None),
            timeline: RwLock::new(None),
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.board.current()
    }

    /// Receives every status change.
    pub fn watch(&self) -> watch::Receiver<SessionStatus> {
        self.board.subscribe()
    }

    /// Read-only view of the current (or most recent) session's timeline.
    pub fn timeline(&self) -> Option<TimelineView> {
        self.timeline.read().clone().map(TimelineView::new)
    }

    /// Starts a live session fed by a supervised receiver.
    ///
    /// Returns once the receiver is launched; the session becomes Running
    /// with its first sample.
    pub async fn start_live(&self, receiver: &ReceiverConfig) -> Result<SessionId, SessionError> {
        let mut active = self.active.lock().await;
        self.stop_locked(&mut active).await;

        let (id, timeline) = self.begin(Source::Live);
        let session_start = Instant::now();

        let launched = receiver
            .launch_spec()
            .and_then(|spec| self.supervisor.start(&spec).map(|handle| (spec, handle)));

        let (spec, handle) = match launched {
            Ok(launched) => launched,
            Err(e) => {
                let err = SessionError::from(e);
                self.board.fail(id, &err);
                timeline.close();
                *active = Some(ActiveSession {
                    id,
                    cancel: CancellationToken::new(),
                    task: None,
                    timeline,
                });
                return Err(err);
            }
        };

        if let Some(health) = &self.health {
            health.process_starts.inc();
            health.process_running.set(1.0);
        }

        let cancel = CancellationToken::new();
        let ingest = LiveIngest {
            id,
            supervisor: self.supervisor.clone(),
            spec,
            timeline: timeline.clone(),
            board: self.board.clone(),
            health: self.health.clone(),
            cancel: cancel.clone(),
            session_start,
            max_restarts: self.cfg.supervisor.max_restarts,
        };
        let task = tokio::spawn(ingest.run(handle));

        *active = Some(ActiveSession {
            id,
            cancel,
            task: Some(task),
            timeline,
        });

        Ok(id)
    }

    /// Runs a trace session over already-extracted capture records.
    ///
    /// Every record is reconciled before any is appended, so an incomplete
    /// trace leaves the timeline empty.
    pub async fn start_trace(&self, records: Vec<CaptureRecord>) -> Result<SessionId, SessionError> {
        let mut active = self.active.lock().await;
        self.stop_locked(&mut active).await;

        let (id, timeline) = self.begin(Source::Trace);
        *active = Some(ActiveSession {
            id,
            cancel: CancellationToken::new(),
            task: None,
            timeline: timeline.clone(),
        });

        let readings = match TraceReconciler::new().reconcile_all(&records) {
            Ok(readings) => readings,
            Err(e) => {
                let err = SessionError::from(e);
                self.board.fail(id, &err);
                timeline.close();
                return Err(err);
            }
        };

        self.board.transition(id, SessionState::Running);

        let mut appended = 0usize;
        for reading in readings {
            match timeline.append(reading) {
                Ok(_) => {
                    appended += 1;
                    if let Some(health) = &self.health {
                        health.samples_appended.with_label_values(&[Source::Trace.as_str()]).inc();
                    }
                }
                Err(e) => {
                    warn!(session = %id, error = %e, "dropping out-of-order trace record");
                    if let Some(health) = &self.health {
                        health.samples_out_of_order.inc();
                    }
                }
            }
        }

        if let Some(health) = &self.health {
            health.timeline_length.set(timeline.len() as f64);
            health.timeline_evicted.set(timeline.evicted() as f64);
        }

        self.board.transition(id, SessionState::Stopping);
        timeline.close();
        self.board.transition(id, SessionState::Stopped);

        info!(session = %id, records = records.len(), appended, "trace session complete");
        Ok(id)
    }

    /// Stops the active session. Idle and terminal sessions are left as is.
    pub async fn stop(&self) -> Result<(), SessionError> {
        let mut active = self.active.lock().await;
        match self.stop_locked(&mut active).await {
            Some(Err(e)) => Err(e),
            _ => Ok(()),
        }
    }

    fn begin(&self, source: Source) -> (SessionId, Arc<Timeline>) {
        let id = SessionId::next();
        let timeline = Arc::new(Timeline::new(&self.cfg.timeline));
        *self.timeline.write() = Some(timeline.clone());
        self.board.begin(id, source);

        if let Some(health) = &self.health {
            health.timeline_length.set(0.0);
            health.timeline_evicted.set(0.0);
        }

        (id, timeline)
    }

    /// Stops whatever `active` holds and waits for its task. Returns the
    /// task's result when there was one to wait for.
    async fn stop_locked(
        &self,
        active: &mut Option<ActiveSession>,
    ) -> Option<Result<(), SessionError>> {
        let mut session = active.take()?;

        let finished = self
            .board
            .state_of(session.id)
            .map_or(true, SessionState::is_terminal);
        if !finished {
            self.board.transition(session.id, SessionState::Stopping);
        }

        session.cancel.cancel();

        let Some(task) = session.task.take() else {
            session.timeline.close();
            return None;
        };

        let limit = self.cfg.supervisor.grace_timeout + self.cfg.supervisor.kill_timeout + STOP_MARGIN;
        let result = match tokio::time::timeout(limit, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                let err = SessionError::Task(e.to_string());
                self.board.fail(session.id, &err);
                Err(err)
            }
            Err(_) => {
                let err = SessionError::Shutdown(ShutdownError::KillFailed {
                    timeout: self.cfg.supervisor.kill_timeout,
                });
                self.board.fail(session.id, &err);
                Err(err)
            }
        };

        session.timeline.close();

        // The outcome of an already finished session was reported when it ended.
        (!finished).then_some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> SessionController {
        SessionController::new(Config::default(), None)
    }

    fn record(time_s: Option<f64>, received: Option<f64>) -> CaptureRecord {
        CaptureRecord {
            time_s,
            packets_received: received,
            packets_lost: received.map(|_| 0.0),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_stop_on_idle_is_noop() {
        let ctl = controller();
        ctl.stop().await.expect("stop idle");
        assert_eq!(ctl.status().state, SessionState::Idle);
        assert!(ctl.timeline().is_none());
    }

    #[tokio::test]
    async fn test_trace_session_completes() {
        let ctl = controller();
        let records = vec![
            record(Some(10.0), Some(100.0)),
            record(Some(11.0), Some(90.0)),
            record(Some(12.0), Some(95.0)),
        ];

        let id = ctl.start_trace(records).await.expect("trace");
        let status = ctl.status();
        assert_eq!(status.id, Some(id));
        assert_eq!(status.state, SessionState::Stopped);
        assert_eq!(status.source, Some(Source::Trace));

        let view = ctl.timeline().expect("timeline");
        assert_eq!(view.len(), 3);
        assert!(view.is_closed());

        ctl.stop().await.expect("stop after completion");
        assert_eq!(ctl.status().state, SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_incomplete_trace_fails_with_empty_timeline() {
        let ctl = controller();
        let records = vec![record(Some(0.0), Some(1.0)), record(None, Some(1.0))];

        let err = ctl.start_trace(records).await.expect_err("incomplete");
        assert_eq!(err.kind(), ErrorKind::IncompleteTrace);

        let status = ctl.status();
        assert_eq!(status.state, SessionState::Failed);
        assert_eq!(
            status.failure.map(|f| f.kind),
            Some(ErrorKind::IncompleteTrace)
        );
        assert!(ctl.timeline().expect("timeline").is_empty());
    }

    #[tokio::test]
    async fn test_trace_without_loss_data_fails() {
        let ctl = controller();
        let records = vec![
            record(Some(0.0), Some(10.0)),
            CaptureRecord {
                time_s: Some(1.0),
                packets_received: Some(12.0),
                ..Default::default()
            },
        ];

        let err = ctl.start_trace(records).await.expect_err("no loss data");
        assert_eq!(err.kind(), ErrorKind::IncompleteTrace);
        assert!(err.to_string().contains("packets_lost"));

        let status = ctl.status();
        assert_eq!(status.state, SessionState::Failed);
        assert_eq!(
            status.failure.map(|f| f.kind),
            Some(ErrorKind::IncompleteTrace)
        );
        assert!(ctl.timeline().expect("timeline").is_empty());
    }

    #[tokio::test]
    async fn test_launch_failure_marks_session_failed() {
        let ctl = controller();
        let receiver = ReceiverConfig {
            binary: "no-such-receiver-binary-srtwatch".to_string(),
            host: "127.0.0.1".to_string(),
            port: 1,
            ..Default::default()
        };

        let err = ctl.start_live(&receiver).await.expect_err("missing binary");
        assert_eq!(err.kind(), ErrorKind::Launch);
        assert_eq!(ctl.status().state, SessionState::Failed);
        assert_eq!(ctl.status().source, Some(Source::Live));

        ctl.stop().await.expect("stop failed session");
        assert_eq!(ctl.status().state, SessionState::Failed);
    }

    #[tokio::test]
    async fn test_new_session_gets_new_id_and_timeline() {
        let ctl = controller();
        let first = ctl
            .start_trace(vec![record(Some(0.0), Some(1.0))])
            .await
            .expect("first");
        let second = ctl
            .start_trace(vec![record(Some(0.0), Some(1.0)), record(Some(1.0), Some(2.0))])
            .await
            .expect("second");

        assert!(second > first);
        assert_eq!(ctl.timeline().expect("timeline").len(), 2);
    }
}
