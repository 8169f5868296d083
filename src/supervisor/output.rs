//! Reader tasks for a child's stdout and stderr.

use std::collections::VecDeque;
use std::net::{SocketAddr, SocketAddrV4};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::decoder::framing::LineFramer;

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Consecutive stderr read failures tolerated before the reader stops.
const MAX_STDERR_READ_ERRORS: u32 = 16;

/// Complete stdout lines of one process, in emission order.
///
/// Ends once the process closes stdout or its handle is stopped.
#[derive(Debug)]
pub struct LineStream {
    rx: mpsc::Receiver<String>,
}

impl LineStream {
    pub(crate) fn new(rx: mpsc::Receiver<String>) -> Self {
        Self { rx }
    }

    /// Next complete line, or `None` at end of stream.
    pub async fn next(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

/// Stderr state kept for crash reports.
#[derive(Debug)]
pub struct Diagnostics {
    tail: Mutex<VecDeque<String>>,
    capacity: usize,
    peer: Mutex<Option<SocketAddr>>,
}

impl Diagnostics {
    pub fn new(capacity: usize) -> Self {
        Self {
            tail: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            peer: Mutex::new(None),
        }
    }

    /// Records one stderr line, keeping only the newest `capacity` lines.
    pub fn record(&self, line: &str) {
        if self.peer.lock().is_none() {
            if let Some(addr) = extract_peer(line) {
                debug!(peer = %addr, "detected stream peer");
                *self.peer.lock() = Some(addr);
            }
        }

        if self.capacity == 0 {
            return;
        }

        let mut tail = self.tail.lock();
        if tail.len() == self.capacity {
            tail.pop_front();
        }
        tail.push_back(line.to_string());
    }

    pub fn stderr_tail(&self) -> Vec<String> {
        self.tail.lock().iter().cloned().collect()
    }

    /// First peer address seen in the receiver's diagnostics.
    pub fn peer(&self) -> Option<SocketAddr> {
        *self.peer.lock()
    }
}

/// Finds the first `a.b.c.d:port` in a diagnostic line.
pub fn extract_peer(line: &str) -> Option<SocketAddr> {
    line.split(|c: char| !(c.is_ascii_digit() || c == '.' || c == ':'))
        .map(|tok| tok.trim_matches(|c| c == '.' || c == ':'))
        .filter_map(|tok| tok.parse::<SocketAddrV4>().ok())
        .find(|addr| !addr.ip().is_unspecified() && addr.port() != 0)
        .map(SocketAddr::V4)
}

/// Frames stdout into lines and forwards them until EOF or the receiver
/// side goes away. A full channel blocks reading, which backs up the pipe.
pub(crate) async fn pump_stdout<R>(mut stdout: R, tx: mpsc::Sender<String>, max_line_bytes: usize)
where
    R: AsyncRead + Unpin,
{
    let mut framer = LineFramer::new(max_line_bytes);
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    let mut lines = Vec::new();
    let mut oversized = 0;

    loop {
        let n = match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "reading receiver stdout");
                break;
            }
        };

        framer.push(&chunk[..n], &mut lines);

        if framer.oversized() > oversized {
            warn!(
                discarded = framer.oversized() - oversized,
                limit = max_line_bytes,
                "discarded oversized stdout line"
            );
            oversized = framer.oversized();
        }

        for line in lines.drain(..) {
            if tx.send(line).await.is_err() {
                return;
            }
        }
    }

    if let Some(bytes) = framer.finish() {
        debug!(bytes, "dropped unterminated trailing stdout");
    }
}

/// Logs stderr at debug and keeps the diagnostic tail current.
///
/// Drains the pipe until EOF whatever it carries: closing it early would
/// kill the receiver with SIGPIPE on its next diagnostic write.
pub(crate) async fn pump_stderr<R>(
    mut stderr: R,
    diagnostics: std::sync::Arc<Diagnostics>,
    max_line_bytes: usize,
) where
    R: AsyncRead + Unpin,
{
    let mut framer = LineFramer::new(max_line_bytes);
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];
    let mut lines = Vec::new();
    let mut errors = 0;

    loop {
        let n = match stderr.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                errors = 0;
                n
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                errors += 1;
                debug!(error = %e, "reading receiver stderr");
                if errors >= MAX_STDERR_READ_ERRORS {
                    warn!(error = %e, "giving up on receiver stderr");
                    break;
                }
                continue;
            }
        };

        framer.push(&chunk[..n], &mut lines);
        for line in lines.drain(..) {
            debug!(target: "srtwatch::receiver", "{line}");
            diagnostics.record(&line);
        }
    }

    if let Some(bytes) = framer.finish() {
        debug!(bytes, "dropped unterminated trailing stderr");
    }
}
