//! Read-only consumer surface: Prometheus metrics and JSON views.

pub mod health;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::sample::Sample;
use crate::session::SessionStatus;
use crate::timeline::{Summary, TimelineView};

pub use self::health::HealthMetrics;

/// Body of `GET /session`.
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    #[serde(flatten)]
    pub status: SessionStatus,
    pub samples: usize,
    pub evicted: u64,
    pub summary: Option<Summary>,
}

impl SessionResponse {
    pub fn new(status: SessionStatus, timeline: Option<&TimelineView>) -> Self {
        Self {
            status,
            samples: timeline.map_or(0, TimelineView::len),
            evicted: timeline.map_or(0, TimelineView::evicted),
            summary: timeline.map(TimelineView::summary),
        }
    }
}

/// Query of `GET /samples`.
#[derive(Debug, Default, Deserialize)]
pub struct SamplesQuery {
    /// Only samples with a greater sequence number.
    pub after: Option<u64>,
    /// Upper bound on returned samples, oldest first.
    pub limit: Option<usize>,
}

/// Body of `GET /samples`.
#[derive(Debug, Serialize)]
pub struct SamplesResponse {
    pub closed: bool,
    pub samples: Vec<Arc<Sample>>,
}

impl SamplesResponse {
    pub fn new(view: &TimelineView, query: &SamplesQuery) -> Self {
        let samples = view
            .snapshot()
            .into_iter()
            .filter(|s| query.after.map_or(true, |after| s.sequence() > after))
            .take(query.limit.unwrap_or(usize::MAX))
            .collect();

        Self {
            closed: view.is_closed(),
            samples,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimelineConfig;
    use crate::sample::{Metric, Metrics, Reading, Source, Timestamp};
    use crate::timeline::Timeline;

    fn view_with(n: u64) -> TimelineView {
        let timeline = Arc::new(Timeline::new(&TimelineConfig::default()));
        for i in 0..n {
            let mut metrics = Metrics::new();
            metrics.insert(Metric::PacketsReceived, i as f64);
            let reading = Reading::new(Timestamp::from_millis((i + 1) * 100), Source::Live, metrics)
                .expect("non-empty");
            timeline.append(reading).expect("append");
        }
        TimelineView::new(timeline)
    }

    #[test]
    fn test_samples_response_filters_after_and_limit() {
        let view = view_with(5);
        let query = SamplesQuery {
            after: Some(1),
            limit: Some(2),
        };
        let response = SamplesResponse::new(&view, &query);
        let seqs: Vec<u64> = response.samples.iter().map(|s| s.sequence()).collect();
        assert_eq!(seqs, vec![2, 3]);
        assert!(!response.closed);
    }

    #[test]
    fn test_session_response_serializes_flat_status() {
        let view = view_with(2);
        let response = SessionResponse::new(SessionStatus::idle(), Some(&view));
        let value = serde_json::to_value(&response).expect("serialize");
        assert_eq!(value["state"], "idle");
        assert_eq!(value["samples"], 2);
        assert_eq!(value["summary"]["samples"], 2);
    }
}
