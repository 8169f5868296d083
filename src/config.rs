use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Top-level configuration for srtwatch.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Live receiver process configuration.
    #[serde(default)]
    pub receiver: ReceiverConfig,

    /// Process supervision configuration.
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Timeline retention configuration.
    #[serde(default)]
    pub timeline: TimelineConfig,

    /// Capture-analysis input configuration.
    #[serde(default)]
    pub trace: TraceConfig,

    /// Metrics and consumer HTTP server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// SRT connection mode passed to the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SrtMode {
    Listener,
    Caller,
}

impl SrtMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Listener => "listener",
            Self::Caller => "caller",
        }
    }
}

impl fmt::Display for SrtMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live receiver process configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReceiverConfig {
    /// Receiver executable, resolved against PATH when not a path. Default: "srt-live-transmit".
    #[serde(default = "default_receiver_binary")]
    pub binary: String,

    /// Connection mode. Default: listener.
    #[serde(default = "default_mode")]
    pub mode: SrtMode,

    /// Address to bind (listener) or connect to (caller). Default: "0.0.0.0".
    #[serde(default = "default_host")]
    pub host: String,

    /// UDP port for the SRT stream. Default: 4200.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Receiver-side session timeout, 30s to 600s. Default: 60s.
    #[serde(default = "default_receiver_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Statistics report frequency in packets. Default: 100.
    #[serde(default = "default_stats_report_frequency")]
    pub stats_report_frequency: u32,

    /// Receiver log level. Default: "info".
    #[serde(default = "default_receiver_log_level")]
    pub log_level: String,

    /// File the received media is written to. Default: "srt/received.ts".
    #[serde(default = "default_output")]
    pub output: PathBuf,

    /// Working directory for the receiver. Default: current directory.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,

    /// Additional arguments appended after the fixed argument contract.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

/// Process supervision configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Time allowed for a graceful exit after SIGTERM. Default: 5s.
    #[serde(default = "default_grace_timeout", with = "humantime_serde")]
    pub grace_timeout: Duration,

    /// Time allowed for exit after SIGKILL. Default: 2s.
    #[serde(default = "default_kill_timeout", with = "humantime_serde")]
    pub kill_timeout: Duration,

    /// Automatic restarts after an unexpected exit while running. Default: 1.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Maximum wait for the next output line before probing liveness. Default: 5s.
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// Bounded line channel between the stdout reader and ingestion. Default: 1024.
    #[serde(default = "default_line_channel_capacity")]
    pub line_channel_capacity: usize,

    /// Longest accepted output line in bytes. Default: 64KiB.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,

    /// Stderr lines kept for crash diagnostics. Default: 32.
    #[serde(default = "default_stderr_tail_lines")]
    pub stderr_tail_lines: usize,
}

/// Timeline retention configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TimelineConfig {
    /// Retained sample limit; oldest samples are evicted first. Default: unbounded.
    #[serde(default)]
    pub max_samples: Option<usize>,

    /// Per-subscriber buffer before backfill kicks in. Default: 1024.
    #[serde(default = "default_subscriber_capacity")]
    pub subscriber_capacity: usize,
}

/// Capture-analysis input configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct TraceConfig {
    /// Field delimiter of the capture-analysis export. Default: ';'.
    #[serde(default = "default_trace_delimiter")]
    pub delimiter: char,

    /// Bin width when per-packet exports are aggregated. Default: 1s.
    #[serde(default = "default_trace_interval", with = "humantime_serde")]
    pub interval: Duration,
}

/// Metrics and consumer HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics, /healthz, /session and /samples. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_receiver_binary() -> String {
    "srt-live-transmit".to_string()
}

fn default_mode() -> SrtMode {
    SrtMode::Listener
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    4200
}

fn default_receiver_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_stats_report_frequency() -> u32 {
    100
}

fn default_receiver_log_level() -> String {
    "info".to_string()
}

fn default_output() -> PathBuf {
    PathBuf::from("srt/received.ts")
}

fn default_grace_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_kill_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_max_restarts() -> u32 {
    1
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_line_channel_capacity() -> usize {
    1024
}

fn default_max_line_bytes() -> usize {
    64 * 1024
}

fn default_stderr_tail_lines() -> usize {
    32
}

fn default_subscriber_capacity() -> usize {
    1024
}

fn default_trace_delimiter() -> char {
    ';'
}

fn default_trace_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_true() -> bool {
    true
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            receiver: ReceiverConfig::default(),
            supervisor: SupervisorConfig::default(),
            timeline: TimelineConfig::default(),
            trace: TraceConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            binary: default_receiver_binary(),
            mode: default_mode(),
            host: default_host(),
            port: default_port(),
            timeout: default_receiver_timeout(),
            stats_report_frequency: default_stats_report_frequency(),
            log_level: default_receiver_log_level(),
            output: default_output(),
            working_dir: None,
            extra_args: Vec::new(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace_timeout: default_grace_timeout(),
            kill_timeout: default_kill_timeout(),
            max_restarts: default_max_restarts(),
            idle_timeout: default_idle_timeout(),
            line_channel_capacity: default_line_channel_capacity(),
            max_line_bytes: default_max_line_bytes(),
            stderr_tail_lines: default_stderr_tail_lines(),
        }
    }
}

impl Default for TimelineConfig {
    fn default() -> Self {
        Self {
            max_samples: None,
            subscriber_capacity: default_subscriber_capacity(),
        }
    }
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            delimiter: default_trace_delimiter(),
            interval: default_trace_interval(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration, returning the first problem found.
    pub fn validate(&self) -> Result<()> {
        crate::supervisor::launch::validate_receiver(&self.receiver)
            .context("invalid receiver configuration")?;

        if self.supervisor.grace_timeout.is_zero() {
            bail!("supervisor.grace_timeout must be positive");
        }

        if self.supervisor.kill_timeout.is_zero() {
            bail!("supervisor.kill_timeout must be positive");
        }

        if self.supervisor.idle_timeout.is_zero() {
            bail!("supervisor.idle_timeout must be positive");
        }

        if self.supervisor.line_channel_capacity == 0 {
            bail!("supervisor.line_channel_capacity must be positive");
        }

        if self.supervisor.max_line_bytes == 0 {
            bail!("supervisor.max_line_bytes must be positive");
        }

        if self.timeline.max_samples == Some(0) {
            bail!("timeline.max_samples must be positive when set");
        }

        if self.timeline.subscriber_capacity == 0 {
            bail!("timeline.subscriber_capacity must be positive");
        }

        if self.trace.delimiter.is_alphanumeric() || self.trace.delimiter == '"' {
            bail!(
                "trace.delimiter {:?} cannot separate numeric fields",
                self.trace.delimiter
            );
        }

        if self.trace.interval.is_zero() {
            bail!("trace.interval must be positive");
        }

        if self.health.enabled && self.health.addr.is_empty() {
            bail!("health.addr is required when enabled");
        }

        Ok(())
    }
}
