//! Append-only, time-ordered sample storage for one session.
//!
//! One writer appends; any number of readers take snapshots or subscribe.
//! Publication to subscribers happens under the write lock, so every
//! subscriber observes samples in sequence order.

pub mod summary;

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::config::TimelineConfig;
use crate::sample::{Reading, Sample, Timestamp};

pub use self::summary::Summary;

/// A reading that does not advance the timeline's clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("sample at {timestamp} is not after the latest sample at {latest}")]
pub struct OutOfOrderError {
    pub timestamp: Timestamp,
    pub latest: Timestamp,
}

#[derive(Debug)]
struct Inner {
    samples: VecDeque<Arc<Sample>>,
    next_sequence: u64,
    latest: Option<Timestamp>,
    evicted: u64,
    tx: Option<broadcast::Sender<Arc<Sample>>>,
}

/// Ordered samples for one session.
#[derive(Debug)]
pub struct Timeline {
    inner: RwLock<Inner>,
    max_samples: Option<usize>,
}

impl Timeline {
    pub fn new(cfg: &TimelineConfig) -> Self {
        let (tx, _) = broadcast::channel(cfg.subscriber_capacity.max(1));
        Self {
            inner: RwLock::new(Inner {
                samples: VecDeque::new(),
                next_sequence: 0,
                latest: None,
                evicted: 0,
                tx: Some(tx),
            }),
            max_samples: cfg.max_samples,
        }
    }

    /// Appends a reading, assigning the next sequence number.
    ///
    /// A reading whose timestamp is not strictly after the latest sample is
    /// rejected and the timeline is left unchanged.
    pub fn append(&self, reading: Reading) -> Result<Arc<Sample>, OutOfOrderError> {
        let mut inner = self.inner.write();

        if let Some(latest) = inner.latest {
            if reading.timestamp() <= latest {
                return Err(OutOfOrderError {
                    timestamp: reading.timestamp(),
                    latest,
                });
            }
        }

        let sample = Arc::new(Sample::new(inner.next_sequence, reading));
        inner.next_sequence += 1;
        inner.latest = Some(sample.timestamp());
        inner.samples.push_back(sample.clone());

        if let Some(max) = self.max_samples {
            while inner.samples.len() > max {
                inner.samples.pop_front();
                inner.evicted += 1;
            }
        }

        if let Some(tx) = &inner.tx {
            // No receivers is fine.
            let _ = tx.send(sample.clone());
        }

        Ok(sample)
    }

    /// All retained samples in sequence order.
    pub fn snapshot(&self) -> Vec<Arc<Sample>> {
        self.inner.read().samples.iter().cloned().collect()
    }

    /// Samples appended after this call, in order.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let inner = self.inner.read();
        Subscription {
            timeline: Arc::clone(self),
            rx: inner.tx.as_ref().map(broadcast::Sender::subscribe),
            backlog: VecDeque::new(),
            expected: inner.next_sequence,
            missed: 0,
        }
    }

    /// Ends every subscription once its buffered samples are drained.
    pub fn close(&self) {
        self.inner.write().tx = None;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.read().tx.is_none()
    }

    pub fn len(&self) -> usize {
        self.inner.read().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().samples.is_empty()
    }

    /// Sequence of the oldest retained sample.
    pub fn first_sequence(&self) -> Option<u64> {
        self.inner.read().samples.front().map(|s| s.sequence())
    }

    pub fn latest(&self) -> Option<Arc<Sample>> {
        self.inner.read().samples.back().cloned()
    }

    /// Samples dropped by retention since creation.
    pub fn evicted(&self) -> u64 {
        self.inner.read().evicted
    }

    fn retained_from(&self, sequence: u64) -> (Option<u64>, Vec<Arc<Sample>>) {
        let inner = self.inner.read();
        let first = inner.samples.front().map(|s| s.sequence());
        let tail = inner
            .samples
            .iter()
            .filter(|s| s.sequence() >= sequence)
            .cloned()
            .collect();
        (first, tail)
    }
}

/// Live feed of newly appended samples.
///
/// A subscriber that falls behind the broadcast buffer is backfilled from
/// the retained samples. Samples evicted before they could be delivered are
/// counted in [`Subscription::missed`].
#[derive(Debug)]
pub struct Subscription {
    timeline: Arc<Timeline>,
    rx: Option<broadcast::Receiver<Arc<Sample>>>,
    backlog: VecDeque<Arc<Sample>>,
    expected: u64,
    missed: u64,
}

impl Subscription {
    /// Next sample, or `None` once the timeline is closed and drained.
    pub async fn next(&mut self) -> Option<Arc<Sample>> {
        loop {
            if let Some(sample) = self.backlog.pop_front() {
                self.expected = sample.sequence() + 1;
                return Some(sample);
            }

            let rx = self.rx.as_mut()?;

            match rx.recv().await {
                Ok(sample) if sample.sequence() < self.expected => continue,
                Ok(sample) if sample.sequence() > self.expected => {
                    self.backfill();
                    if self.backlog.is_empty() {
                        self.expected = sample.sequence() + 1;
                        return Some(sample);
                    }
                }
                Ok(sample) => {
                    self.expected = sample.sequence() + 1;
                    return Some(sample);
                }
                Err(RecvError::Lagged(_)) => self.backfill(),
                Err(RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    /// Samples this subscriber never saw because retention evicted them.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    fn backfill(&mut self) {
        let (first, tail) = self.timeline.retained_from(self.expected);

        if let Some(first) = first {
            if first > self.expected {
                self.missed += first - self.expected;
                self.expected = first;
            }
        }

        self.backlog.extend(tail);
    }
}

/// Read-only handle given to consumers.
#[derive(Debug, Clone)]
pub struct TimelineView {
    timeline: Arc<Timeline>,
}

impl TimelineView {
    pub fn new(timeline: Arc<Timeline>) -> Self {
        Self { timeline }
    }

    pub fn snapshot(&self) -> Vec<Arc<Sample>> {
        self.timeline.snapshot()
    }

    pub fn subscribe(&self) -> Subscription {
        self.timeline.subscribe()
    }

    pub fn len(&self) -> usize {
        self.timeline.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timeline.is_empty()
    }

    pub fn latest(&self) -> Option<Arc<Sample>> {
        self.timeline.latest()
    }

    pub fn evicted(&self) -> u64 {
        self.timeline.evicted()
    }

    pub fn is_closed(&self) -> bool {
        self.timeline.is_closed()
    }

    pub fn summary(&self) -> Summary {
        Summary::from_samples(&self.snapshot())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{Metric, Metrics, Source};

    fn reading(ms: u64, lost: f64) -> Reading {
        let mut metrics = Metrics::new();
        metrics.insert(Metric::PacketsLost, lost);
        Reading::new(Timestamp::from_millis(ms), Source::Live, metrics).expect("non-empty")
    }

    fn timeline(max_samples: Option<usize>, subscriber_capacity: usize) -> Arc<Timeline> {
        Arc::new(Timeline::new(&TimelineConfig {
            max_samples,
            subscriber_capacity,
        }))
    }

    #[test]
    fn test_append_assigns_contiguous_sequences() {
        let tl = timeline(None, 16);
        for (i, ms) in [100, 200, 300].into_iter().enumerate() {
            let sample = tl.append(reading(ms, 0.0)).expect("append");
            assert_eq!(sample.sequence(), i as u64);
        }

        let seqs: Vec<u64> = tl.snapshot().iter().map(|s| s.sequence()).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn test_out_of_order_and_equal_timestamps_rejected() {
        let tl = timeline(None, 16);
        tl.append(reading(200, 0.0)).expect("append");

        let err = tl.append(reading(100, 0.0)).expect_err("older");
        assert_eq!(err.latest, Timestamp::from_millis(200));
        assert!(tl.append(reading(200, 0.0)).is_err());
        assert_eq!(tl.len(), 1);

        // Sequence numbers are not consumed by rejected appends.
        assert_eq!(tl.append(reading(300, 0.0)).expect("append").sequence(), 1);
    }

    #[test]
    fn test_retention_evicts_oldest() {
        let tl = timeline(Some(2), 16);
        for ms in [100, 200, 300, 400] {
            tl.append(reading(ms, 0.0)).expect("append");
        }

        assert_eq!(tl.len(), 2);
        assert_eq!(tl.evicted(), 2);
        assert_eq!(tl.first_sequence(), Some(2));
        let seqs: Vec<u64> = tl.snapshot().iter().map(|s| s.sequence()).collect();
        assert_eq!(seqs, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_subscription_sees_only_new_samples_in_order() {
        let tl = timeline(None, 16);
        tl.append(reading(100, 0.0)).expect("append");

        let mut sub = tl.subscribe();
        tl.append(reading(200, 2.0)).expect("append");
        tl.append(reading(300, 2.0)).expect("append");
        tl.close();

        assert_eq!(sub.next().await.map(|s| s.sequence()), Some(1));
        assert_eq!(sub.next().await.map(|s| s.sequence()), Some(2));
        assert!(sub.next().await.is_none());
    }

    #[tokio::test]
    async fn test_lagging_subscriber_is_backfilled() {
        let tl = timeline(None, 2);
        let mut sub = tl.subscribe();

        for ms in 1..=10 {
            tl.append(reading(ms * 100, 0.0)).expect("append");
        }
        tl.close();

        let mut seen = Vec::new();
        while let Some(sample) = sub.next().await {
            seen.push(sample.sequence());
        }
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        assert_eq!(sub.missed(), 0);
    }

    #[tokio::test]
    async fn test_lagging_subscriber_counts_evicted_samples() {
        let tl = timeline(Some(3), 2);
        let mut sub = tl.subscribe();

        for ms in 1..=10 {
            tl.append(reading(ms * 100, 0.0)).expect("append");
        }
        tl.close();

        let mut seen = Vec::new();
        while let Some(sample) = sub.next().await {
            seen.push(sample.sequence());
        }
        assert_eq!(seen, vec![7, 8, 9]);
        assert_eq!(sub.missed(), 7);
    }

    #[tokio::test]
    async fn test_subscribe_after_close_ends_immediately() {
        let tl = timeline(None, 4);
        tl.append(reading(100, 0.0)).expect("append");
        tl.close();

        let mut sub = tl.subscribe();
        assert!(sub.next().await.is_none());
        assert_eq!(TimelineView::new(tl).snapshot().len(), 1);
    }
}
