use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::{fmt, EnvFilter};

use srtwatch::config::{Config, ReceiverConfig, SrtMode};
use srtwatch::export::HealthMetrics;
use srtwatch::reconcile::{validate_capture, CaptureReader};
use srtwatch::session::{SessionController, SessionState, SessionStatus};
use srtwatch::supervisor::validate_recording;

/// SRT session statistics ingestion.
#[derive(Parser)]
#[command(name = "srtwatch", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Supervise a receiver and ingest its statistics until it ends or is interrupted.
    Live {
        /// SRT connection mode.
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,

        /// Address to bind (listener) or connect to (caller).
        #[arg(long)]
        host: Option<String>,

        /// UDP port of the stream.
        #[arg(long)]
        port: Option<u16>,

        /// Receiver session timeout in seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Load statistics derived from a packet capture.
    Trace {
        /// Capture-analysis export (delimited text).
        #[arg(long)]
        records: PathBuf,

        /// Capture file the export was produced from.
        #[arg(long)]
        capture: Option<PathBuf>,
    },

    /// Print version information and exit.
    Version,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Listener,
    Caller,
}

impl From<ModeArg> for SrtMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Listener => SrtMode::Listener,
            ModeArg::Caller => SrtMode::Caller,
        }
    }
}

/// Build-time version info.
mod version {
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::Version = &cli.command {
        println!("srtwatch {}", version::full());
        return Ok(());
    }

    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(level) = &cli.log_level {
        cfg.log_level = level.clone();
    }

    let filter = EnvFilter::try_new(&cfg.log_level)
        .with_context(|| format!("invalid log level: {}", cfg.log_level))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting srtwatch",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match cli.command {
        Command::Live {
            mode,
            host,
            port,
            timeout,
        } => {
            if let Some(mode) = mode {
                cfg.receiver.mode = mode.into();
            }
            if let Some(host) = host {
                cfg.receiver.host = host;
            }
            if let Some(port) = port {
                cfg.receiver.port = port;
            }
            if let Some(secs) = timeout {
                cfg.receiver.timeout = Duration::from_secs(secs);
            }
            cfg.validate().context("invalid configuration")?;

            rt.block_on(run_live(cfg))
        }
        Command::Trace { records, capture } => {
            rt.block_on(run_trace(cfg, &records, capture.as_deref()))
        }
        Command::Version => Ok(()),
    }
}

async fn run_live(cfg: Config) -> Result<()> {
    let health = if cfg.health.enabled {
        Some(Arc::new(
            HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?,
        ))
    } else {
        None
    };

    let controller = Arc::new(SessionController::new(cfg.clone(), health.clone()));

    if let Some(health) = &health {
        health
            .start(Arc::clone(&controller))
            .await
            .context("starting health server")?;
    }

    let mut status = controller.watch();

    controller
        .start_live(&cfg.receiver)
        .await
        .context("starting live session")?;

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = wait_terminal(&mut status) => {}
    }

    if let Err(e) = controller.stop().await {
        tracing::warn!(error = %e, "stopping session");
    }

    check_recording(&cfg.receiver);
    print_summary(&controller)?;

    if let Some(health) = &health {
        health.stop().await?;
    }

    let status = controller.status();
    tracing::info!(state = %status.state, "srtwatch stopped");

    check_failure(&status)
}

async fn run_trace(cfg: Config, records: &Path, capture: Option<&Path>) -> Result<()> {
    if let Some(capture) = capture {
        let format = validate_capture(capture)
            .with_context(|| format!("validating capture {}", capture.display()))?;
        tracing::info!(path = %capture.display(), format = ?format, "capture accepted");
    }

    let file = File::open(records)
        .with_context(|| format!("opening capture export {}", records.display()))?;

    let records = CaptureReader::new(cfg.trace.delimiter)
        .interval(cfg.trace.interval)
        .read(BufReader::new(file))
        .with_context(|| format!("reading capture export {}", records.display()))?;

    let controller = SessionController::new(cfg, None);

    if let Err(e) = controller.start_trace(records).await {
        tracing::error!(kind = %e.kind(), error = %e, "trace session failed");
    }

    print_summary(&controller)?;
    check_failure(&controller.status())
}

async fn wait_terminal(status: &mut tokio::sync::watch::Receiver<SessionStatus>) {
    loop {
        if status.borrow_and_update().state.is_terminal() {
            return;
        }
        if status.changed().await.is_err() {
            return;
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("received SIGINT, shutting down");
                    }
                    _ = sigterm.recv() => {
                        tracing::info!("received SIGTERM, shutting down");
                    }
                }
                return;
            }
            Err(e) => tracing::warn!(error = %e, "registering SIGTERM handler"),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "waiting for SIGINT");
        std::future::pending::<()>().await;
    }
    tracing::info!("received SIGINT, shutting down");
}

/// Logs whether the received media file is a transport stream.
fn check_recording(receiver: &ReceiverConfig) {
    let path = match &receiver.working_dir {
        Some(dir) if receiver.output.is_relative() => dir.join(&receiver.output),
        _ => receiver.output.clone(),
    };

    match validate_recording(&path) {
        Ok(info) => tracing::info!(
            path = %path.display(),
            packets = info.packets,
            trailing_bytes = info.trailing_bytes,
            "recording is a valid transport stream",
        ),
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "recording check failed"),
    }
}

fn print_summary(controller: &SessionController) -> Result<()> {
    let Some(view) = controller.timeline() else {
        return Ok(());
    };

    let summary = view.summary();
    let text = serde_json::to_string_pretty(&summary).context("encoding summary")?;
    println!("{text}");
    Ok(())
}

fn check_failure(status: &SessionStatus) -> Result<()> {
    if status.state != SessionState::Failed {
        return Ok(());
    }

    match &status.failure {
        Some(failure) => bail!("session failed ({}): {}", failure.kind, failure.message),
        None => bail!("session failed"),
    }
}
