//! Launch specifications and the pre-spawn checks applied to them.

use std::ffi::OsStr;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{ReceiverConfig, SrtMode};

use super::LaunchError;

/// Accepted receiver session timeout range.
const MIN_RECEIVER_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_RECEIVER_TIMEOUT: Duration = Duration::from_secs(600);

/// Everything needed to spawn one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// UDP address the process will bind; probed before spawning.
    pub listen_addr: Option<SocketAddr>,
}

impl LaunchSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            listen_addr: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = Some(addr);
        self
    }

    /// Rendered command line for logs.
    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(arg);
        }
        out
    }
}

/// Checks the receiver argument combination without touching the OS.
pub fn validate_receiver(cfg: &ReceiverConfig) -> Result<(), LaunchError> {
    if cfg.binary.trim().is_empty() {
        return Err(invalid("receiver.binary must not be empty"));
    }

    if cfg.port == 0 {
        return Err(invalid("receiver.port must be between 1 and 65535"));
    }

    if cfg.timeout < MIN_RECEIVER_TIMEOUT || cfg.timeout > MAX_RECEIVER_TIMEOUT {
        return Err(invalid(format!(
            "receiver.timeout must be within {}s..={}s, got {}s",
            MIN_RECEIVER_TIMEOUT.as_secs(),
            MAX_RECEIVER_TIMEOUT.as_secs(),
            cfg.timeout.as_secs()
        )));
    }

    if cfg.stats_report_frequency == 0 {
        return Err(invalid("receiver.stats_report_frequency must be positive"));
    }

    if cfg.host.trim().is_empty() {
        return Err(invalid("receiver.host must not be empty"));
    }

    if cfg.mode == SrtMode::Caller && is_unspecified_host(&cfg.host) {
        return Err(invalid(format!(
            "caller mode needs a concrete remote host, got {}",
            cfg.host
        )));
    }

    if cfg.output.as_os_str().is_empty() {
        return Err(invalid("receiver.output must not be empty"));
    }

    Ok(())
}

/// Builds the receiver's fixed argument contract.
///
/// Statistics are written as CSV to stdout; received media goes to the
/// configured output file.
pub fn receiver_launch_spec(cfg: &ReceiverConfig) -> Result<LaunchSpec, LaunchError> {
    validate_receiver(cfg)?;

    let source = format!("srt://{}:{}?mode={}", cfg.host, cfg.port, cfg.mode);
    let sink = format!("file://{}", cfg.output.display());

    let mut spec = LaunchSpec::new(cfg.binary.clone())
        .args([
            "-fullstats".to_string(),
            "-statspf:csv".to_string(),
            format!("-stats-report-frequency:{}", cfg.stats_report_frequency),
            format!("-loglevel:{}", cfg.log_level),
            format!("-to:{}", cfg.timeout.as_secs()),
            source,
            sink,
        ])
        .args(cfg.extra_args.iter().cloned());

    if let Some(dir) = &cfg.working_dir {
        spec = spec.working_dir(dir.clone());
    }

    if cfg.mode == SrtMode::Listener {
        let addr = resolve_listen_addr(&cfg.host, cfg.port)?;
        spec = spec.listen_addr(addr);
    }

    Ok(spec)
}

impl ReceiverConfig {
    /// Launch specification for this receiver configuration.
    pub fn launch_spec(&self) -> Result<LaunchSpec, LaunchError> {
        receiver_launch_spec(self)
    }
}

/// Runs every check `Supervisor::start` performs before spawning and
/// returns the resolved executable path.
pub fn preflight(spec: &LaunchSpec) -> Result<PathBuf, LaunchError> {
    if spec.program.is_empty() {
        return Err(LaunchError::NotFound {
            program: spec.program.clone(),
        });
    }

    if spec.args.iter().any(|a| a.contains('\0')) {
        return Err(invalid("arguments must not contain NUL bytes"));
    }

    if let Some(dir) = &spec.working_dir {
        if !dir.is_dir() {
            return Err(LaunchError::WorkingDirectory { path: dir.clone() });
        }
    }

    let program = resolve_program(&spec.program, spec.working_dir.as_deref())?;

    if let Some(addr) = spec.listen_addr {
        probe_udp_port(addr)?;
    }

    Ok(program)
}

/// Resolves a program name the way a shell would, without spawning it.
pub fn resolve_program(program: &str, working_dir: Option<&Path>) -> Result<PathBuf, LaunchError> {
    let candidate = Path::new(program);

    if candidate.components().count() > 1 || candidate.is_absolute() {
        let full = match working_dir {
            Some(dir) if candidate.is_relative() => dir.join(candidate),
            _ => candidate.to_path_buf(),
        };
        return check_executable(program, full);
    }

    let path_var = std::env::var_os("PATH").unwrap_or_default();
    let mut denied = None;

    for dir in std::env::split_paths(&path_var) {
        let full = dir.join(OsStr::new(program));
        if !full.is_file() {
            continue;
        }
        match check_executable(program, full) {
            Ok(found) => return Ok(found),
            Err(e @ LaunchError::PermissionDenied { .. }) => denied = Some(e),
            Err(_) => {}
        }
    }

    Err(denied.unwrap_or_else(|| LaunchError::NotFound {
        program: program.to_string(),
    }))
}

fn check_executable(program: &str, full: PathBuf) -> Result<PathBuf, LaunchError> {
    let meta = std::fs::metadata(&full).map_err(|_| LaunchError::NotFound {
        program: program.to_string(),
    })?;

    if !meta.is_file() {
        return Err(LaunchError::NotFound {
            program: program.to_string(),
        });
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(LaunchError::PermissionDenied { path: full });
        }
    }

    Ok(full)
}

/// Fails with `PortInUse` when another socket already holds `addr`.
fn probe_udp_port(addr: SocketAddr) -> Result<(), LaunchError> {
    match UdpSocket::bind(addr) {
        Ok(socket) => {
            drop(socket);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            Err(LaunchError::PortInUse { addr })
        }
        Err(e) => Err(invalid(format!("cannot bind {addr}: {e}"))),
    }
}

fn resolve_listen_addr(host: &str, port: u16) -> Result<SocketAddr, LaunchError> {
    (host, port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| invalid(format!("cannot resolve listen address {host}:{port}")))
}

fn is_unspecified_host(host: &str) -> bool {
    matches!(host, "0.0.0.0" | "::" | "[::]")
}

fn invalid(reason: impl Into<String>) -> LaunchError {
    LaunchError::InvalidArgument {
        reason: reason.into(),
    }
}
