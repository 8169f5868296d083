//! Incremental decoding of the receiver's CSV statistics stream.
//!
//! Bytes become lines in [`framing::LineFramer`]; lines become
//! [`Reading`]s in [`LineDecoder`], which learns the column layout from the
//! header the receiver prints and tolerates the header changing mid-stream.

pub mod framing;
pub mod schema;
pub mod stats;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, NaiveDateTime};
use thiserror::Error;
use tracing::{debug, info};

use crate::sample::{Metrics, Reading, Source, Timestamp};

use self::schema::{Column, HeaderCheck, Schema, TimeSource, REQUIRED_METRICS};
pub use self::stats::{DecodeCounts, DecodeStats};

/// Timepoint layouts seen across receiver versions.
const TIMEPOINT_FORMATS: [&str; 3] = [
    "%d.%m.%Y %H:%M:%S%.f%z",
    "%Y-%m-%d %H:%M:%S%.f%z",
    "%Y%m%dT%H%M%S%.f%z",
];

/// A line that could not be turned into a reading.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DecodeError {
    /// A data record with an unusable value. The line is skipped.
    #[error("malformed record: column {column} value {value:?} {reason}")]
    MalformedRecord {
        column: String,
        value: String,
        reason: &'static str,
    },

    /// The header lacks the minimum column set.
    #[error("unsupported statistics schema: missing {}", missing.join(", "))]
    UnsupportedSchema { missing: Vec<String> },
}

/// Per-generation statistics decoder.
///
/// Stateless per line apart from the installed schema and the Timepoint
/// base, so decoding the same data line twice yields equal metrics.
#[derive(Debug)]
pub struct LineDecoder {
    schema: Option<Schema>,
    unsupported: bool,
    reported_unsupported: bool,
    origin: Duration,
    timepoint_base: Option<DateTime<FixedOffset>>,
    stats: Arc<DecodeStats>,
}

impl LineDecoder {
    /// Creates a decoder whose readings are shifted by `origin`.
    pub fn new(origin: Duration) -> Self {
        Self::with_stats(origin, Arc::new(DecodeStats::new()))
    }

    pub fn with_stats(origin: Duration, stats: Arc<DecodeStats>) -> Self {
        Self {
            schema: None,
            unsupported: false,
            reported_unsupported: false,
            origin,
            timepoint_base: None,
            stats,
        }
    }

    pub fn stats(&self) -> &Arc<DecodeStats> {
        &self.stats
    }

    pub fn schema(&self) -> Option<&Schema> {
        self.schema.as_ref()
    }

    /// Decodes one complete line.
    ///
    /// Blank lines, log output, headers and anything before the first header
    /// return `Ok(None)`.
    pub fn decode(&mut self, line: &str) -> Result<Option<Reading>, DecodeError> {
        self.stats.record_line();

        let line = line.trim_end_matches(['\r', '\n']);
        if line.trim().is_empty() {
            self.stats.record_skipped();
            return Ok(None);
        }

        let fields: Vec<&str> = line.split(',').collect();

        if let Some(check) = Schema::detect(&fields) {
            self.stats.record_header();
            return self.install(check);
        }

        let schema = match &self.schema {
            Some(schema) if !self.unsupported && schema.matches_width(&fields) => schema,
            _ => {
                self.stats.record_skipped();
                return Ok(None);
            }
        };

        match decode_record(schema, &fields, &mut self.timepoint_base) {
            Ok(reading) => {
                self.stats.record_decoded();
                Ok(Some(reading.with_origin(self.origin)))
            }
            Err(e) => {
                self.stats.record_malformed();
                Err(e)
            }
        }
    }

    fn install(&mut self, check: HeaderCheck) -> Result<Option<Reading>, DecodeError> {
        match check {
            HeaderCheck::Supported(schema) => {
                if self.schema.as_ref() == Some(&schema) && !self.unsupported {
                    return Ok(None);
                }
                if self.schema.is_some() {
                    info!(columns = schema.width(), "statistics header changed");
                } else {
                    debug!(columns = schema.width(), "statistics header detected");
                }
                self.schema = Some(schema);
                self.unsupported = false;
                Ok(None)
            }
            HeaderCheck::Unsupported(missing) => {
                self.schema = None;
                self.unsupported = true;
                if self.reported_unsupported {
                    return Ok(None);
                }
                self.reported_unsupported = true;
                Err(DecodeError::UnsupportedSchema { missing })
            }
        }
    }
}

fn decode_record(
    schema: &Schema,
    fields: &[&str],
    timepoint_base: &mut Option<DateTime<FixedOffset>>,
) -> Result<Reading, DecodeError> {
    let mut pending_base = None;
    let timestamp = match schema.time() {
        TimeSource::Millis(idx) => {
            let raw = fields[idx].trim();
            let ms = parse_value("Time", raw)?;
            Timestamp::from_millis_f64(ms).ok_or_else(|| malformed("Time", raw, "is out of range"))?
        }
        TimeSource::Timepoint(idx) => {
            let raw = fields[idx].trim();
            let at = parse_timepoint(raw).ok_or_else(|| malformed("Timepoint", raw, "is not a timestamp"))?;
            let offset = (at - timepoint_base.unwrap_or(at))
                .to_std()
                .map_err(|_| malformed("Timepoint", raw, "precedes the first record"))?;
            pending_base = Some(at);
            Timestamp::from_duration(offset)
        }
    };

    let mut metrics = Metrics::new();

    for (column, raw) in schema.columns().iter().zip(fields) {
        let raw = raw.trim();
        match column {
            Column::TimeMillis | Column::Timepoint => {}
            Column::Canonical(metric) => {
                if raw.is_empty() {
                    if REQUIRED_METRICS.contains(metric) {
                        return Err(malformed(metric.as_str(), raw, "is required"));
                    }
                    continue;
                }
                metrics.insert(*metric, parse_value(metric.as_str(), raw)?);
            }
            Column::Other(name) => {
                if let Ok(value) = raw.parse::<f64>() {
                    if value.is_finite() {
                        metrics.insert_extra(name.clone(), value);
                    }
                }
            }
        }
    }

    let reading = Reading::new(timestamp, Source::Live, metrics)
        .ok_or_else(|| malformed("record", "", "carries no values"))?;

    // The base is taken from the first record that decodes.
    if timepoint_base.is_none() {
        *timepoint_base = pending_base;
    }
    Ok(reading)
}

/// Parses a canonical value: finite and non-negative.
fn parse_value(column: &str, raw: &str) -> Result<f64, DecodeError> {
    let value: f64 = raw
        .parse()
        .map_err(|_| malformed(column, raw, "is not a number"))?;

    if !value.is_finite() {
        return Err(malformed(column, raw, "is not finite"));
    }
    if value < 0.0 {
        return Err(malformed(column, raw, "is negative"));
    }

    Ok(value)
}

fn parse_timepoint(raw: &str) -> Option<DateTime<FixedOffset>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Some(at);
    }

    for format in TIMEPOINT_FORMATS {
        if let Ok(at) = DateTime::parse_from_str(raw, format) {
            return Some(at);
        }
    }

    // Local time without an offset; treat as UTC since only deltas matter.
    NaiveDateTime::parse_from_str(raw, "%d.%m.%Y %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc().fixed_offset())
}

fn malformed(column: &str, value: &str, reason: &'static str) -> DecodeError {
    DecodeError::MalformedRecord {
        column: column.to_string(),
        value: value.to_string(),
        reason,
    }
}
