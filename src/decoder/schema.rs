//! Column layout of the receiver's CSV statistics.

use crate::sample::Metric;

/// Metrics every supported schema must carry.
pub const REQUIRED_METRICS: [Metric; 2] = [Metric::PacketsReceived, Metric::PacketsLost];

/// Meaning of one CSV column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Column {
    /// Milliseconds since the receiver created its socket.
    TimeMillis,
    /// Wall-clock text timestamp.
    Timepoint,
    Canonical(Metric),
    /// Any other column; kept when its values are numeric.
    Other(String),
}

/// Where a record's time comes from. `Time` wins over `Timepoint`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSource {
    Millis(usize),
    Timepoint(usize),
}

/// A header that can be decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    columns: Vec<Column>,
    time: TimeSource,
}

/// Outcome of inspecting a line that looks like a header.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderCheck {
    Supported(Schema),
    /// Column names missing from the minimum required set.
    Unsupported(Vec<String>),
}

impl Schema {
    /// Inspects `fields`; returns `None` when they do not form a header.
    pub fn detect(fields: &[&str]) -> Option<HeaderCheck> {
        let fields = trim_trailing_empty(fields);

        if fields.is_empty() || fields.iter().any(|f| f.trim().parse::<f64>().is_ok()) {
            return None;
        }

        let columns: Vec<Column> = fields.iter().map(|f| classify(f.trim())).collect();

        let known = columns
            .iter()
            .any(|c| !matches!(c, Column::Other(_)));
        if !known {
            return None;
        }

        let millis = columns.iter().position(|c| *c == Column::TimeMillis);
        let timepoint = columns.iter().position(|c| *c == Column::Timepoint);
        let time = millis
            .map(TimeSource::Millis)
            .or(timepoint.map(TimeSource::Timepoint));

        let mut missing = Vec::new();
        if time.is_none() {
            missing.push("Time".to_string());
        }
        for metric in REQUIRED_METRICS {
            if !columns.contains(&Column::Canonical(metric)) {
                missing.push(metric.as_str().to_string());
            }
        }

        match time {
            Some(time) if missing.is_empty() => Some(HeaderCheck::Supported(Schema { columns, time })),
            _ => Some(HeaderCheck::Unsupported(missing)),
        }
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn time(&self) -> TimeSource {
        self.time
    }

    /// Whether `fields` has the shape of a data record for this schema.
    ///
    /// One trailing empty field is tolerated since the receiver terminates
    /// rows with a comma in some versions.
    pub fn matches_width(&self, fields: &[&str]) -> bool {
        let n = fields.len();
        n == self.width() || (n == self.width() + 1 && fields[n - 1].trim().is_empty())
    }
}

fn classify(name: &str) -> Column {
    match name {
        "Time" => Column::TimeMillis,
        "Timepoint" => Column::Timepoint,
        _ => match Metric::from_receiver_column(name) {
            Some(metric) => Column::Canonical(metric),
            None => Column::Other(name.to_string()),
        },
    }
}

fn trim_trailing_empty<'a, 'b>(fields: &'a [&'b str]) -> &'a [&'b str] {
    match fields.split_last() {
        Some((last, rest)) if last.trim().is_empty() => rest,
        _ => fields,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(line: &str) -> Vec<&str> {
        line.split(',').collect()
    }

    #[test]
    fn test_detect_supported_header_prefers_time() {
        let fields = split("Timepoint,Time,SocketID,pktRecv,pktRcvLoss,msRTT,");
        let Some(HeaderCheck::Supported(schema)) = Schema::detect(&fields) else {
            panic!("expected supported header");
        };
        assert_eq!(schema.width(), 6);
        assert_eq!(schema.time(), TimeSource::Millis(1));
        assert_eq!(schema.columns()[2], Column::Other("SocketID".to_string()));
        assert_eq!(schema.columns()[5], Column::Canonical(Metric::RttMs));
    }

    #[test]
    fn test_detect_timepoint_only() {
        let fields = split("Timepoint,pktRecvTotal,pktRcvLossTotal");
        let Some(HeaderCheck::Supported(schema)) = Schema::detect(&fields) else {
            panic!("expected supported header");
        };
        assert_eq!(schema.time(), TimeSource::Timepoint(0));
    }

    #[test]
    fn test_detect_reports_missing_columns() {
        let fields = split("Time,pktRecv,msRTT");
        assert_eq!(
            Schema::detect(&fields),
            Some(HeaderCheck::Unsupported(vec!["packetsLost".to_string()]))
        );

        let fields = split("pktRecv,pktRcvLoss");
        assert_eq!(
            Schema::detect(&fields),
            Some(HeaderCheck::Unsupported(vec!["Time".to_string()]))
        );
    }

    #[test]
    fn test_detect_ignores_data_and_log_lines() {
        assert_eq!(Schema::detect(&split("100,5,0")), None);
        assert_eq!(Schema::detect(&split("Media path: srt://:4200")), None);
        assert_eq!(Schema::detect(&split("")), None);
    }

    #[test]
    fn test_matches_width_allows_one_trailing_empty() {
        let Some(HeaderCheck::Supported(schema)) = Schema::detect(&split("Time,pktRecv,pktRcvLoss"))
        else {
            panic!("expected supported header");
        };
        assert!(schema.matches_width(&split("1,2,3")));
        assert!(schema.matches_width(&split("1,2,3,")));
        assert!(!schema.matches_width(&split("1,2,3,4")));
        assert!(!schema.matches_width(&split("1,2")));
    }
}
