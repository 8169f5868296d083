use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::session::{SessionController, SessionState};

use super::{SamplesQuery, SamplesResponse, SessionResponse};

const NAMESPACE: &str = "srtwatch";

/// Prometheus metrics for the ingestion pipeline.
///
/// All metrics use the "srtwatch" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Ingestion ===
    /// Receiver stdout lines handed to the decoder.
    pub lines_read: Counter,
    /// Samples accepted into a timeline, by source.
    pub samples_appended: CounterVec,
    /// Data records skipped as malformed.
    pub records_malformed: Counter,
    /// Lines that were neither header nor data.
    pub records_skipped: Counter,
    /// Readings rejected for not advancing the timeline clock.
    pub samples_out_of_order: Counter,
    /// Headers lacking the required columns.
    pub schema_unsupported: Counter,
    /// Per-line decode and append duration (1us-10ms buckets).
    pub ingest_duration: Histogram,

    // === Timeline ===
    /// Samples retained in the current timeline.
    pub timeline_length: Gauge,
    /// Samples evicted from the current timeline by retention.
    pub timeline_evicted: Gauge,

    // === Process ===
    /// Receiver processes launched, including restarts.
    pub process_starts: Counter,
    /// Automatic restarts after an unexpected exit.
    pub process_restarts: Counter,
    /// Unexpected receiver exits.
    pub process_crashes: Counter,
    /// Stops that needed SIGKILL.
    pub shutdown_escalations: Counter,
    /// Whether a receiver process is running (1=yes, 0=no).
    pub process_running: Gauge,

    // === Session ===
    /// Current session state (1 for the active state, 0 otherwise).
    pub session_state: GaugeVec,
    /// Sessions started, by source.
    pub sessions_started: CounterVec,
    /// Sessions that ended in Failed, by error kind.
    pub session_failures: CounterVec,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Ingestion ===
        let lines_read = Counter::with_opts(
            Opts::new("lines_read_total", "Receiver stdout lines handed to the decoder.")
                .namespace(NAMESPACE),
        )?;
        let samples_appended = CounterVec::new(
            Opts::new(
                "samples_appended_total",
                "Samples accepted into a timeline by source.",
            )
            .namespace(NAMESPACE),
            &["source"],
        )?;
        let records_malformed = Counter::with_opts(
            Opts::new(
                "records_malformed_total",
                "Data records skipped because a value was unusable.",
            )
            .namespace(NAMESPACE),
        )?;
        let records_skipped = Counter::with_opts(
            Opts::new(
                "records_skipped_total",
                "Lines that were neither a header nor a data record.",
            )
            .namespace(NAMESPACE),
        )?;
        let samples_out_of_order = Counter::with_opts(
            Opts::new(
                "samples_out_of_order_total",
                "Readings rejected for not advancing the timeline clock.",
            )
            .namespace(NAMESPACE),
        )?;
        let schema_unsupported = Counter::with_opts(
            Opts::new(
                "schema_unsupported_total",
                "Statistics headers lacking the required columns.",
            )
            .namespace(NAMESPACE),
        )?;
        let ingest_duration = Histogram::with_opts(
            HistogramOpts::new(
                "ingest_duration_seconds",
                "Time to decode and append a single statistics line.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.000001, 0.00001, 0.0001, 0.001, 0.01]),
        )?;

        // === Timeline ===
        let timeline_length = Gauge::with_opts(
            Opts::new("timeline_length", "Samples retained in the current timeline.")
                .namespace(NAMESPACE),
        )?;
        let timeline_evicted = Gauge::with_opts(
            Opts::new(
                "timeline_evicted",
                "Samples evicted from the current timeline by retention.",
            )
            .namespace(NAMESPACE),
        )?;

        // === Process ===
        let process_starts = Counter::with_opts(
            Opts::new(
                "process_starts_total",
                "Receiver processes launched, including restarts.",
            )
            .namespace(NAMESPACE),
        )?;
        let process_restarts = Counter::with_opts(
            Opts::new(
                "process_restarts_total",
                "Automatic receiver restarts after an unexpected exit.",
            )
            .namespace(NAMESPACE),
        )?;
        let process_crashes = Counter::with_opts(
            Opts::new("process_crashes_total", "Unexpected receiver exits.").namespace(NAMESPACE),
        )?;
        let shutdown_escalations = Counter::with_opts(
            Opts::new(
                "shutdown_escalations_total",
                "Receiver stops that needed SIGKILL.",
            )
            .namespace(NAMESPACE),
        )?;
        let process_running = Gauge::with_opts(
            Opts::new(
                "process_running",
                "Whether a receiver process is running (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
        )?;

        // === Session ===
        let session_state = GaugeVec::new(
            Opts::new("session_state", "Current session state (1=active state).")
                .namespace(NAMESPACE),
            &["state"],
        )?;
        let sessions_started = CounterVec::new(
            Opts::new("sessions_started_total", "Sessions started by source.")
                .namespace(NAMESPACE),
            &["source"],
        )?;
        let session_failures = CounterVec::new(
            Opts::new(
                "session_failures_total",
                "Sessions that ended in Failed by error kind.",
            )
            .namespace(NAMESPACE),
            &["kind"],
        )?;

        registry.register(Box::new(lines_read.clone()))?;
        registry.register(Box::new(samples_appended.clone()))?;
        registry.register(Box::new(records_malformed.clone()))?;
        registry.register(Box::new(records_skipped.clone()))?;
        registry.register(Box::new(samples_out_of_order.clone()))?;
        registry.register(Box::new(schema_unsupported.clone()))?;
        registry.register(Box::new(ingest_duration.clone()))?;
        registry.register(Box::new(timeline_length.clone()))?;
        registry.register(Box::new(timeline_evicted.clone()))?;
        registry.register(Box::new(process_starts.clone()))?;
        registry.register(Box::new(process_restarts.clone()))?;
        registry.register(Box::new(process_crashes.clone()))?;
        registry.register(Box::new(shutdown_escalations.clone()))?;
        registry.register(Box::new(process_running.clone()))?;
        registry.register(Box::new(session_state.clone()))?;
        registry.register(Box::new(sessions_started.clone()))?;
        registry.register(Box::new(session_failures.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            lines_read,
            samples_appended,
            records_malformed,
            records_skipped,
            samples_out_of_order,
            schema_unsupported,
            ingest_duration,
            timeline_length,
            timeline_evicted,
            process_starts,
            process_restarts,
            process_crashes,
            shutdown_escalations,
            process_running,
            session_state,
            sessions_started,
            session_failures,
        })
    }

    /// Marks `state` as the current session state.
    pub fn set_session_state(&self, state: SessionState) {
        for candidate in SessionState::ALL {
            let value = if candidate == state { 1.0 } else { 0.0 };
            self.session_state
                .with_label_values(&[candidate.as_str()])
                .set(value);
        }
    }

    /// Prometheus text exposition of every registered metric.
    pub fn encode(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics, /healthz, /session and /samples.
    pub async fn start(&self, controller: Arc<SessionController>) -> Result<SocketAddr> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
            controller,
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .route("/session", get(session_handler))
            .route("/samples", get(samples_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
    controller: Arc<SessionController>,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

/// GET /session - current session status.
async fn session_handler(State(state): State<Arc<AppState>>) -> Json<SessionResponse> {
    let status = state.controller.status();
    let timeline = state.controller.timeline();
    Json(SessionResponse::new(status, timeline.as_ref()))
}

/// GET /samples?after=N - retained samples, optionally only those after a sequence.
async fn samples_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SamplesQuery>,
) -> impl IntoResponse {
    match state.controller.timeline() {
        Some(view) => (StatusCode::OK, Json(SamplesResponse::new(&view, &query))).into_response(),
        None => (StatusCode::NOT_FOUND, "no session").into_response(),
    }
}
