use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free decoder counters.
///
/// `snapshot()` atomically reads and resets every counter, so periodic
/// reporters see per-interval deltas.
#[derive(Debug, Default)]
pub struct DecodeStats {
    lines: AtomicU64,
    headers: AtomicU64,
    records: AtomicU64,
    malformed: AtomicU64,
    skipped: AtomicU64,
}

/// Counter values taken by [`DecodeStats::snapshot`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeCounts {
    pub lines: u64,
    pub headers: u64,
    pub records: u64,
    pub malformed: u64,
    pub skipped: u64,
}

impl DecodeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_line(&self) {
        self.lines.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_header(&self) {
        self.headers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decoded(&self) {
        self.records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    /// A line that was neither a header nor a data record.
    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Atomically read and reset all counters.
    pub fn snapshot(&self) -> DecodeCounts {
        DecodeCounts {
            lines: self.lines.swap(0, Ordering::Relaxed),
            headers: self.headers.swap(0, Ordering::Relaxed),
            records: self.records.swap(0, Ordering::Relaxed),
            malformed: self.malformed.swap(0, Ordering::Relaxed),
            skipped: self.skipped.swap(0, Ordering::Relaxed),
        }
    }
}
