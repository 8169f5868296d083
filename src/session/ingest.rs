//! Live ingestion task: receiver output to timeline, one process generation
//! at a time.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::decoder::{DecodeError, DecodeStats, LineDecoder};
use crate::export::HealthMetrics;
use crate::sample::Source;
use crate::supervisor::{ExitReport, LaunchSpec, ProcessHandle, RestartBudget, ShutdownError, Supervisor};
use crate::timeline::Timeline;

use super::state::{SessionId, SessionState, StatusBoard};
use super::SessionError;

/// Decoder counters are pushed to health metrics at least this often.
const STATS_FLUSH_LINES: u64 = 256;

/// How one process generation ended.
enum GenerationEnd {
    Exited(ExitReport),
    Cancelled,
    Failed(SessionError),
}

pub(super) struct LiveIngest {
    pub(super) id: SessionId,
    pub(super) supervisor: Supervisor,
    pub(super) spec: LaunchSpec,
    pub(super) timeline: Arc<Timeline>,
    pub(super) board: Arc<StatusBoard>,
    pub(super) health: Option<Arc<HealthMetrics>>,
    pub(super) cancel: CancellationToken,
    pub(super) session_start: Instant,
    pub(super) max_restarts: u32,
}

impl LiveIngest {
    /// Drives the session until the receiver is stopped, completes or fails.
    ///
    /// The timeline is closed on every exit path.
    pub(super) async fn run(self, handle: ProcessHandle) -> Result<(), SessionError> {
        let result = self.supervise(handle).await;

        self.timeline.close();
        if let Some(health) = &self.health {
            health.process_running.set(0.0);
            health.timeline_length.set(self.timeline.len() as f64);
            health.timeline_evicted.set(self.timeline.evicted() as f64);
        }

        result
    }

    async fn supervise(&self, mut handle: ProcessHandle) -> Result<(), SessionError> {
        let stats = Arc::new(DecodeStats::new());
        let mut budget = RestartBudget::new(self.max_restarts);
        let mut origin = Duration::ZERO;

        loop {
            let end = self.drive(&mut handle, origin, &stats).await;
            self.flush_stats(&stats);

            let report = match end {
                GenerationEnd::Cancelled => return self.shutdown(&mut handle).await,
                GenerationEnd::Failed(err) => {
                    if let Err(e) = self
                        .supervisor
                        .stop(&mut handle, self.supervisor.config().grace_timeout)
                        .await
                    {
                        warn!(session = %self.id, error = %e, "stopping receiver after failure");
                    }
                    self.board.fail(self.id, &err);
                    return Err(err);
                }
                GenerationEnd::Exited(report) => report,
            };

            if report.success() {
                info!(
                    session = %self.id,
                    runtime = ?report.runtime,
                    "receiver finished"
                );
                self.board.transition(self.id, SessionState::Stopping);
                self.board.transition(self.id, SessionState::Stopped);
                return Ok(());
            }

            if self.cancel.is_cancelled() {
                debug!(session = %self.id, status = %report.describe(), "receiver exited during stop");
                self.board.transition(self.id, SessionState::Stopped);
                return Ok(());
            }

            let crash = handle.crash_error(&report).await;
            if let Some(health) = &self.health {
                health.process_crashes.inc();
                health.process_running.set(0.0);
            }

            let running = self.board.state_of(self.id) == Some(SessionState::Running);
            if !running || !budget.try_consume() {
                let err = SessionError::from(crash);
                self.board.fail(self.id, &err);
                return Err(err);
            }

            warn!(
                session = %self.id,
                error = %crash,
                restart = budget.used(),
                "receiver crashed, restarting"
            );

            origin = self.session_start.elapsed();
            handle = match self.supervisor.start(&self.spec) {
                Ok(handle) => handle,
                Err(e) => {
                    let err = SessionError::from(e);
                    self.board.fail(self.id, &err);
                    return Err(err);
                }
            };

            self.board.set_restarts(self.id, budget.used());
            if let Some(health) = &self.health {
                health.process_restarts.inc();
                health.process_starts.inc();
                health.process_running.set(1.0);
            }
        }
    }

    /// Ingests one generation's output until it ends or the session is cancelled.
    async fn drive(
        &self,
        handle: &mut ProcessHandle,
        origin: Duration,
        stats: &Arc<DecodeStats>,
    ) -> GenerationEnd {
        let Some(mut lines) = self.supervisor.observe(handle) else {
            return self.await_exit(handle).await;
        };

        let mut decoder = LineDecoder::with_stats(origin, stats.clone());
        let idle_timeout = self.supervisor.config().idle_timeout;
        let mut peer_reported = false;
        let mut since_flush = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return GenerationEnd::Cancelled,
                next = timeout(idle_timeout, lines.next()) => match next {
                    Ok(Some(line)) => {
                        if let Err(e) = self.ingest_line(&mut decoder, &line) {
                            return GenerationEnd::Failed(e);
                        }

                        since_flush += 1;
                        if since_flush >= STATS_FLUSH_LINES {
                            self.flush_stats(stats);
                            since_flush = 0;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {
                        self.flush_stats(stats);
                        since_flush = 0;
                        match self.supervisor.try_exit(handle) {
                            Ok(Some(report)) => return GenerationEnd::Exited(report),
                            Ok(None) => debug!(session = %self.id, idle = ?idle_timeout, "receiver quiet"),
                            Err(e) => return GenerationEnd::Failed(e.into()),
                        }
                    }
                },
            }

            if !peer_reported {
                if let Some(peer) = handle.peer() {
                    self.board.set_peer(self.id, peer);
                    peer_reported = true;
                }
            }
        }

        self.await_exit(handle).await
    }

    /// Stdout has closed; the process should follow within the grace period.
    async fn await_exit(&self, handle: &mut ProcessHandle) -> GenerationEnd {
        let grace = self.supervisor.config().grace_timeout;

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => GenerationEnd::Cancelled,
            waited = self.supervisor.wait(handle, grace) => match waited {
                Ok(Some(report)) => GenerationEnd::Exited(report),
                Ok(None) => {
                    warn!(session = %self.id, "receiver closed stdout but kept running, stopping it");
                    match self.supervisor.stop(handle, grace).await {
                        Ok(report) => GenerationEnd::Exited(report),
                        Err(ShutdownError::Unresponsive { .. }) => match handle.exit_report() {
                            Some(report) => GenerationEnd::Exited(report),
                            None => GenerationEnd::Failed(SessionError::Task("receiver exit not recorded".to_string())),
                        },
                        Err(e) => GenerationEnd::Failed(e.into()),
                    }
                }
                Err(e) => GenerationEnd::Failed(e.into()),
            },
        }
    }

    fn ingest_line(&self, decoder: &mut LineDecoder, line: &str) -> Result<(), SessionError> {
        let start = Instant::now();

        let reading = match decoder.decode(line) {
            Ok(Some(reading)) => reading,
            Ok(None) => return Ok(()),
            Err(DecodeError::MalformedRecord { column, value, reason }) => {
                debug!(session = %self.id, %column, %value, reason, "skipping malformed record");
                return Ok(());
            }
            Err(e @ DecodeError::UnsupportedSchema { .. }) => {
                if let Some(health) = &self.health {
                    health.schema_unsupported.inc();
                }
                return Err(e.into());
            }
        };

        match self.timeline.append(reading) {
            Ok(sample) => {
                if self.board.state_of(self.id) == Some(SessionState::Starting) {
                    debug!(session = %self.id, sequence = sample.sequence(), "first sample ingested");
                    self.board.transition(self.id, SessionState::Running);
                }
                if let Some(health) = &self.health {
                    health
                        .samples_appended
                        .with_label_values(&[Source::Live.as_str()])
                        .inc();
                    health.timeline_length.set(self.timeline.len() as f64);
                    health.timeline_evicted.set(self.timeline.evicted() as f64);
                }
            }
            Err(e) => {
                debug!(session = %self.id, error = %e, "dropping out-of-order sample");
                if let Some(health) = &self.health {
                    health.samples_out_of_order.inc();
                }
            }
        }

        if let Some(health) = &self.health {
            health.ingest_duration.observe(start.elapsed().as_secs_f64());
        }

        Ok(())
    }

    /// Deliberate stop: the session is already Stopping.
    async fn shutdown(&self, handle: &mut ProcessHandle) -> Result<(), SessionError> {
        let grace = self.supervisor.config().grace_timeout;

        match self.supervisor.stop(handle, grace).await {
            Ok(report) => {
                info!(session = %self.id, status = %report.describe(), "receiver stopped");
                self.board.transition(self.id, SessionState::Stopped);
                Ok(())
            }
            Err(e @ ShutdownError::Unresponsive { .. }) => {
                warn!(session = %self.id, error = %e, "receiver needed a forced kill");
                if let Some(health) = &self.health {
                    health.shutdown_escalations.inc();
                }
                self.board.transition(self.id, SessionState::Stopped);
                Ok(())
            }
            Err(e) => {
                let err = SessionError::from(e);
                self.board.fail(self.id, &err);
                Err(err)
            }
        }
    }

    fn flush_stats(&self, stats: &DecodeStats) {
        let counts = stats.snapshot();
        if counts.malformed > 0 {
            warn!(session = %self.id, malformed = counts.malformed, "skipped malformed records");
        }

        let Some(health) = &self.health else { return };
        health.lines_read.inc_by(counts.lines as f64);
        health.records_malformed.inc_by(counts.malformed as f64);
        health.records_skipped.inc_by(counts.skipped as f64);
    }
}
