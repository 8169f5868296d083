//! Maps capture-analysis records onto the shared sample model.

pub mod capture;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sample::{Metric, Metrics, Reading, Source, Timestamp};

pub use self::capture::{read_records, validate_capture, CaptureError, CaptureFormat, CaptureReader};

/// One per-interval record produced by the capture-analysis collaborator.
///
/// Every counter is optional; which ones are present depends on what the
/// capture contained.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureRecord {
    /// Seconds since the start of the capture.
    pub time_s: Option<f64>,
    pub packets_received: Option<f64>,
    pub packets_lost: Option<f64>,
    pub retransmitted: Option<f64>,
    pub control_packets: Option<f64>,
    pub bytes_received: Option<f64>,
    /// Round-trip time in microseconds.
    pub rtt_us: Option<f64>,
    /// Estimated link bandwidth in kilobits per second.
    pub bandwidth_kbps: Option<f64>,
    pub receive_rate_mbps: Option<f64>,
    pub extra: BTreeMap<String, f64>,
}

/// A trace record that cannot become a reading.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("incomplete trace record {index}: {reason}")]
pub struct IncompleteTraceError {
    /// Zero-based position of the record in the trace.
    pub index: usize,
    pub reason: String,
}

/// Converts capture records into readings on a trace-relative time base.
///
/// The first record reconciled fixes the trace start.
#[derive(Debug, Default)]
pub struct TraceReconciler {
    start_s: Option<f64>,
    index: usize,
}

impl TraceReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reconcile(&mut self, record: &CaptureRecord) -> Result<Reading, IncompleteTraceError> {
        let index = self.index;
        self.index += 1;

        let fail = |reason: String| IncompleteTraceError { index, reason };

        let time_s = record
            .time_s
            .ok_or_else(|| fail("missing time".to_string()))?;
        if !time_s.is_finite() {
            return Err(fail(format!("time {time_s} is not finite")));
        }

        // Loss data is required on both ingestion paths.
        if record.packets_lost.is_none() {
            return Err(fail("missing packets_lost".to_string()));
        }

        let start = *self.start_s.get_or_insert(time_s);
        let offset = time_s - start;
        if offset < 0.0 {
            return Err(fail(format!(
                "time {time_s}s precedes trace start {start}s"
            )));
        }

        let mut metrics = Metrics::new();
        let fields = [
            (Metric::PacketsReceived, record.packets_received, 1.0, "packets_received"),
            (Metric::PacketsLost, record.packets_lost, 1.0, "packets_lost"),
            (Metric::Retransmitted, record.retransmitted, 1.0, "retransmitted"),
            (Metric::ControlPackets, record.control_packets, 1.0, "control_packets"),
            (Metric::BytesReceived, record.bytes_received, 1.0, "bytes_received"),
            (Metric::RttMs, record.rtt_us, 1000.0, "rtt_us"),
            (Metric::BandwidthMbps, record.bandwidth_kbps, 1000.0, "bandwidth_kbps"),
            (Metric::ReceiveRateMbps, record.receive_rate_mbps, 1.0, "receive_rate_mbps"),
        ];

        for (metric, value, divisor, name) in fields {
            let Some(value) = value else { continue };
            if !value.is_finite() || value < 0.0 {
                return Err(fail(format!("{name} value {value} is invalid")));
            }
            metrics.insert(metric, value / divisor);
        }

        for (name, value) in &record.extra {
            if value.is_finite() {
                metrics.insert_extra(name.clone(), *value);
            }
        }

        let timestamp = Timestamp::from_millis_f64(offset * 1000.0)
            .ok_or_else(|| fail(format!("time {time_s}s is out of range")))?;

        Reading::new(timestamp, Source::Trace, metrics)
            .ok_or_else(|| fail("record carries no values".to_string()))
    }

    /// Reconciles every record, failing on the first incomplete one.
    pub fn reconcile_all(&mut self, records: &[CaptureRecord]) -> Result<Vec<Reading>, IncompleteTraceError> {
        records.iter().map(|r| self.reconcile(r)).collect()
    }
}
