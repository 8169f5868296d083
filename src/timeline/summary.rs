use std::sync::Arc;

use serde::Serialize;

use crate::sample::{Metric, Sample, Source};

/// Session-level aggregates over a timeline.
///
/// Live counters are cumulative, so totals come from the latest sample
/// that carries them. Trace records are per interval and are summed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Summary {
    pub samples: usize,
    pub duration_ms: f64,
    pub mean_rtt_ms: Option<f64>,
    /// Mean absolute change in RTT between consecutive samples.
    pub mean_jitter_ms: Option<f64>,
    pub mean_receive_rate_mbps: Option<f64>,
    pub mean_bandwidth_mbps: Option<f64>,
    pub packets_received: Option<f64>,
    pub packets_lost: Option<f64>,
    pub packets_dropped: Option<f64>,
    pub retransmitted: Option<f64>,
    pub bytes_received: Option<f64>,
    pub bytes_lost: Option<f64>,
    /// Lost packets as a share of received plus lost.
    pub loss_percent: Option<f64>,
    /// Control packets as a share of all packets seen.
    pub control_percent: Option<f64>,
}

impl Summary {
    pub fn from_samples(samples: &[Arc<Sample>]) -> Self {
        let (Some(first), Some(last)) = (samples.first(), samples.last()) else {
            return Self::default();
        };

        let cumulative = last.source() == Source::Live;
        let total = |metric| {
            if cumulative {
                latest(samples, metric)
            } else {
                sum(samples, metric)
            }
        };

        let rtts: Vec<f64> = samples
            .iter()
            .filter_map(|s| s.metrics().get(Metric::RttMs))
            .collect();
        let jitter: Vec<f64> = rtts.windows(2).map(|w| (w[1] - w[0]).abs()).collect();

        let packets_received = total(Metric::PacketsReceived);
        let packets_lost = total(Metric::PacketsLost);
        let control = total(Metric::ControlPackets);

        let loss_percent = match (packets_received, packets_lost) {
            (Some(rx), Some(lost)) if rx + lost > 0.0 => Some(lost / (rx + lost) * 100.0),
            _ => None,
        };
        let control_percent = match (control, packets_received) {
            (Some(ctrl), rx) if ctrl + rx.unwrap_or(0.0) > 0.0 => {
                Some(ctrl / (ctrl + rx.unwrap_or(0.0)) * 100.0)
            }
            _ => None,
        };

        Self {
            samples: samples.len(),
            duration_ms: last.timestamp().as_millis_f64() - first.timestamp().as_millis_f64(),
            mean_rtt_ms: mean(&rtts),
            mean_jitter_ms: mean(&jitter),
            mean_receive_rate_mbps: mean_of(samples, Metric::ReceiveRateMbps),
            mean_bandwidth_mbps: mean_of(samples, Metric::BandwidthMbps),
            packets_received,
            packets_lost,
            packets_dropped: total(Metric::PacketsDropped),
            retransmitted: total(Metric::Retransmitted),
            bytes_received: total(Metric::BytesReceived),
            bytes_lost: total(Metric::BytesLost),
            loss_percent,
            control_percent,
        }
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

fn mean_of(samples: &[Arc<Sample>], metric: Metric) -> Option<f64> {
    let values: Vec<f64> = samples.iter().filter_map(|s| s.metrics().get(metric)).collect();
    mean(&values)
}

fn latest(samples: &[Arc<Sample>], metric: Metric) -> Option<f64> {
    samples.iter().rev().find_map(|s| s.metrics().get(metric))
}

fn sum(samples: &[Arc<Sample>], metric: Metric) -> Option<f64> {
    let mut seen = false;
    let total = samples
        .iter()
        .filter_map(|s| s.metrics().get(metric))
        .inspect(|_| seen = true)
        .sum::<f64>();
    seen.then_some(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{Metrics, Reading, Timestamp};

    fn sample(seq: u64, ms: u64, source: Source, values: &[(Metric, f64)]) -> Arc<Sample> {
        let mut metrics = Metrics::new();
        for (metric, value) in values {
            metrics.insert(*metric, *value);
        }
        let reading = Reading::new(Timestamp::from_millis(ms), source, metrics).expect("non-empty");
        Arc::new(Sample::new(seq, reading))
    }

    #[test]
    fn test_empty_summary() {
        assert_eq!(Summary::from_samples(&[]), Summary::default());
    }

    #[test]
    fn test_live_summary_uses_latest_totals_and_rtt_jitter() {
        let samples = vec![
            sample(0, 1000, Source::Live, &[(Metric::RttMs, 10.0), (Metric::PacketsReceived, 100.0), (Metric::PacketsLost, 0.0)]),
            sample(1, 2000, Source::Live, &[(Metric::RttMs, 14.0), (Metric::PacketsReceived, 195.0), (Metric::PacketsLost, 5.0)]),
            sample(2, 3000, Source::Live, &[(Metric::RttMs, 12.0), (Metric::ReceiveRateMbps, 8.0)]),
        ];
        let summary = Summary::from_samples(&samples);

        assert_eq!(summary.samples, 3);
        assert_eq!(summary.duration_ms, 2000.0);
        assert_eq!(summary.mean_rtt_ms, Some(12.0));
        assert_eq!(summary.mean_jitter_ms, Some(3.0));
        assert_eq!(summary.mean_receive_rate_mbps, Some(8.0));
        assert_eq!(summary.packets_received, Some(195.0));
        assert_eq!(summary.packets_lost, Some(5.0));
        assert_eq!(summary.loss_percent, Some(2.5));
        assert_eq!(summary.bytes_received, None);
    }

    #[test]
    fn test_trace_summary_sums_intervals() {
        let samples = vec![
            sample(0, 0, Source::Trace, &[(Metric::PacketsReceived, 90.0), (Metric::ControlPackets, 10.0)]),
            sample(1, 1000, Source::Trace, &[(Metric::PacketsReceived, 60.0), (Metric::ControlPackets, 40.0)]),
        ];
        let summary = Summary::from_samples(&samples);

        assert_eq!(summary.packets_received, Some(150.0));
        assert_eq!(summary.control_percent, Some(25.0));
        assert_eq!(summary.mean_jitter_ms, None);
    }
}
