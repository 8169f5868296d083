//! Sample model shared by both ingestion paths.
//!
//! Producers (the line decoder and the trace reconciler) emit [`Reading`]s.
//! The timeline turns each accepted reading into an immutable [`Sample`] by
//! assigning it the next sequence number.

pub mod metric;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Serialize, Serializer};

pub use self::metric::Metric;

/// Session-relative monotonic instant.
///
/// Both paths express time as an offset from the start of the session so
/// their samples plot on comparable axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(Duration);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(Duration::ZERO);

    pub const fn from_duration(offset: Duration) -> Self {
        Self(offset)
    }

    pub const fn from_millis(ms: u64) -> Self {
        Self(Duration::from_millis(ms))
    }

    /// Converts fractional milliseconds, rejecting negative or non-finite input.
    pub fn from_millis_f64(ms: f64) -> Option<Self> {
        if !ms.is_finite() || ms < 0.0 {
            return None;
        }
        let nanos = (ms * 1_000_000.0).round();
        if nanos >= u64::MAX as f64 {
            return None;
        }
        Some(Self(Duration::from_nanos(nanos as u64)))
    }

    pub const fn as_duration(self) -> Duration {
        self.0
    }

    pub fn as_millis_f64(self) -> f64 {
        self.0.as_secs_f64() * 1000.0
    }

    /// Shifts this timestamp by a generation origin.
    pub fn offset_by(self, origin: Duration) -> Self {
        Self(self.0.saturating_add(origin))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}ms", self.as_millis_f64())
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.as_millis_f64())
    }
}

/// Ingestion path a reading came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Live,
    Trace,
}

impl Source {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Trace => "trace",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical metric values plus a bucket for columns this build does not know.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Metrics {
    values: BTreeMap<Metric, f64>,
    extra: BTreeMap<String, f64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, metric: Metric, value: f64) {
        self.values.insert(metric, value);
    }

    pub fn insert_extra(&mut self, name: impl Into<String>, value: f64) {
        self.extra.insert(name.into(), value);
    }

    pub fn get(&self, metric: Metric) -> Option<f64> {
        self.values.get(&metric).copied()
    }

    pub fn extra(&self, name: &str) -> Option<f64> {
        self.extra.get(name).copied()
    }

    /// Iterates canonical values in metric order.
    pub fn iter(&self) -> impl Iterator<Item = (Metric, f64)> + '_ {
        self.values.iter().map(|(m, v)| (*m, *v))
    }

    pub fn iter_extra(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.extra.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn canonical_keys(&self) -> Vec<Metric> {
        self.values.keys().copied().collect()
    }

    /// Total number of entries, canonical and extra.
    pub fn len(&self) -> usize {
        self.values.len() + self.extra.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.extra.is_empty()
    }
}

/// An unsequenced statistics snapshot produced by one of the ingestion paths.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reading {
    timestamp: Timestamp,
    source: Source,
    metrics: Metrics,
}

impl Reading {
    /// Builds a reading. Returns `None` when `metrics` holds no entries.
    pub fn new(timestamp: Timestamp, source: Source, metrics: Metrics) -> Option<Self> {
        if metrics.is_empty() {
            return None;
        }
        Some(Self {
            timestamp,
            source,
            metrics,
        })
    }

    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    pub fn source(&self) -> Source {
        self.source
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Shifts the reading onto a generation's time base.
    pub fn with_origin(mut self, origin: Duration) -> Self {
        self.timestamp = self.timestamp.offset_by(origin);
        self
    }
}

/// A reading accepted into a timeline. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    sequence: u64,
    #[serde(flatten)]
    reading: Reading,
}

impl Sample {
    pub(crate) fn new(sequence: u64, reading: Reading) -> Self {
        Self { sequence, reading }
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn timestamp(&self) -> Timestamp {
        self.reading.timestamp
    }

    pub fn source(&self) -> Source {
        self.reading.source
    }

    pub fn metrics(&self) -> &Metrics {
        &self.reading.metrics
    }

    pub fn reading(&self) -> &Reading {
        &self.reading
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reading_requires_metrics() {
        assert!(Reading::new(Timestamp::ZERO, Source::Live, Metrics::new()).is_none());

        let mut metrics = Metrics::new();
        metrics.insert_extra("weight", 1.0);
        let reading = Reading::new(Timestamp::ZERO, Source::Live, metrics).expect("non-empty");
        assert_eq!(reading.metrics().len(), 1);
    }

    #[test]
    fn test_timestamp_from_millis_f64_rejects_invalid() {
        assert!(Timestamp::from_millis_f64(-1.0).is_none());
        assert!(Timestamp::from_millis_f64(f64::NAN).is_none());
        assert!(Timestamp::from_millis_f64(f64::INFINITY).is_none());
        assert_eq!(
            Timestamp::from_millis_f64(1500.0),
            Some(Timestamp::from_millis(1500))
        );
    }

    #[test]
    fn test_with_origin_shifts_timestamp() {
        let mut metrics = Metrics::new();
        metrics.insert(Metric::PacketsLost, 0.0);
        let reading = Reading::new(Timestamp::from_millis(100), Source::Live, metrics)
            .expect("non-empty")
            .with_origin(Duration::from_secs(2));
        assert_eq!(reading.timestamp(), Timestamp::from_millis(2100));
    }

    #[test]
    fn test_sample_serializes_flat() {
        let mut metrics = Metrics::new();
        metrics.insert(Metric::RttMs, 12.5);
        metrics.insert_extra("SocketID", 42.0);
        let reading =
            Reading::new(Timestamp::from_millis(250), Source::Trace, metrics).expect("non-empty");
        let sample = Sample::new(7, reading);

        let value = serde_json::to_value(&sample).expect("serialize");
        assert_eq!(value["sequence"], 7);
        assert_eq!(value["timestamp"], 250.0);
        assert_eq!(value["source"], "trace");
        assert_eq!(value["metrics"]["values"]["rttMs"], 12.5);
        assert_eq!(value["metrics"]["extra"]["SocketID"], 42.0);
    }
}
