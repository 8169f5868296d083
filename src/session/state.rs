//! Session lifecycle states and the status board that publishes them.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::export::HealthMetrics;
use crate::sample::Source;

use super::{ErrorKind, SessionError};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique, monotonically assigned session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl SessionState {
    pub const ALL: [SessionState; 6] = [
        Self::Idle,
        Self::Starting,
        Self::Running,
        Self::Stopping,
        Self::Stopped,
        Self::Failed,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Starting)
                | (Starting, Running)
                | (Starting, Stopping)
                | (Starting, Failed)
                | (Running, Stopping)
                | (Running, Failed)
                | (Stopping, Stopped)
                | (Stopping, Failed)
        )
    }

    /// Stopped and Failed hold until a new session starts.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session failed, in a form the UI can show verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureReport {
    pub kind: ErrorKind,
    pub message: String,
}

/// Externally visible session status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    pub id: Option<SessionId>,
    pub state: SessionState,
    pub source: Option<Source>,
    pub started_at: Option<DateTime<Utc>>,
    pub peer: Option<SocketAddr>,
    pub restarts: u32,
    pub failure: Option<FailureReport>,
}

impl SessionStatus {
    /// Status before any session has started.
    pub fn idle() -> Self {
        Self {
            id: None,
            state: SessionState::Idle,
            source: None,
            started_at: None,
            peer: None,
            restarts: 0,
            failure: None,
        }
    }
}

/// Single owner of status changes.
///
/// Every change names the session it belongs to, so a task left over from
/// an earlier session cannot alter the current one.
pub(crate) struct StatusBoard {
    tx: watch::Sender<SessionStatus>,
    health: Option<Arc<HealthMetrics>>,
}

impl StatusBoard {
    pub(crate) fn new(health: Option<Arc<HealthMetrics>>) -> Self {
        let (tx, _) = watch::channel(SessionStatus::idle());
        if let Some(health) = &health {
            health.set_session_state(SessionState::Idle);
        }
        Self { tx, health }
    }

    pub(crate) fn current(&self) -> SessionStatus {
        self.tx.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.tx.subscribe()
    }

    /// Replaces the status with a fresh session in Starting.
    pub(crate) fn begin(&self, id: SessionId, source: Source) {
        self.tx.send_replace(SessionStatus {
            id: Some(id),
            state: SessionState::Starting,
            source: Some(source),
            started_at: Some(Utc::now()),
            peer: None,
            restarts: 0,
            failure: None,
        });

        info!(session = %id, source = %source, "session starting");

        if let Some(health) = &self.health {
            health.set_session_state(SessionState::Starting);
            health
                .sessions_started
                .with_label_values(&[source.as_str()])
                .inc();
        }
    }

    /// Applies a lifecycle transition. Returns false when it is not allowed
    /// from the current state or the session is no longer current.
    pub(crate) fn transition(&self, id: SessionId, next: SessionState) -> bool {
        let mut from = None;
        self.tx.send_if_modified(|status| {
            if status.id != Some(id) || !status.state.can_transition_to(next) {
                return false;
            }
            from = Some(status.state);
            status.state = next;
            true
        });

        let Some(from) = from else {
            return false;
        };

        info!(session = %id, from = %from, to = %next, "session state changed");
        if let Some(health) = &self.health {
            health.set_session_state(next);
        }
        true
    }

    /// Moves the session to Failed with a report built from `err`.
    pub(crate) fn fail(&self, id: SessionId, err: &SessionError) -> bool {
        let report = FailureReport {
            kind: err.kind(),
            message: err.to_string(),
        };

        let mut applied = false;
        self.tx.send_if_modified(|status| {
            if status.id != Some(id) || !status.state.can_transition_to(SessionState::Failed) {
                return false;
            }
            status.state = SessionState::Failed;
            status.failure = Some(report.clone());
            applied = true;
            true
        });

        if !applied {
            return false;
        }

        warn!(session = %id, kind = %report.kind, error = %report.message, "session failed");
        if let Some(health) = &self.health {
            health.set_session_state(SessionState::Failed);
            health
                .session_failures
                .with_label_values(&[report.kind.as_str()])
                .inc();
        }
        true
    }

    pub(crate) fn set_peer(&self, id: SessionId, peer: SocketAddr) {
        self.tx.send_if_modified(|status| {
            if status.id != Some(id) || status.peer == Some(peer) {
                return false;
            }
            info!(session = %id, peer = %peer, "stream peer connected");
            status.peer = Some(peer);
            true
        });
    }

    pub(crate) fn set_restarts(&self, id: SessionId, restarts: u32) {
        self.tx.send_if_modified(|status| {
            if status.id != Some(id) {
                return false;
            }
            status.restarts = restarts;
            true
        });
    }

    pub(crate) fn state_of(&self, id: SessionId) -> Option<SessionState> {
        let status = self.tx.borrow();
        (status.id == Some(id)).then_some(status.state)
    }
}
