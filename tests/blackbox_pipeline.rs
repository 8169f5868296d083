use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use srtwatch::config::{Config, TimelineConfig};
use srtwatch::decoder::framing::LineFramer;
use srtwatch::decoder::{DecodeError, LineDecoder};
use srtwatch::reconcile::CaptureReader;
use srtwatch::sample::{Metric, Source, Timestamp};
use srtwatch::session::{ErrorKind, SessionController, SessionState};
use srtwatch::timeline::{Timeline, TimelineView};

const HEADER: &str = "Time,pktRecv,pktRcvLoss,pktRcvDrop,msRTT,mbpsRecvRate";

/// Feeds `chunks` through framing, decoding and the timeline, the same way
/// receiver stdout is ingested.
fn ingest(chunks: &[&[u8]], timeline: &Timeline) -> Vec<DecodeError> {
    let mut framer = LineFramer::new(64 * 1024);
    let mut decoder = LineDecoder::new(Duration::ZERO);
    let mut errors = Vec::new();
    let mut lines = Vec::new();

    for chunk in chunks {
        framer.push(chunk, &mut lines);
        for line in lines.drain(..) {
            match decoder.decode(&line) {
                Ok(Some(reading)) => {
                    let _ = timeline.append(reading);
                }
                Ok(None) => {}
                Err(e) => errors.push(e),
            }
        }
    }

    errors
}

#[tokio::test]
async fn pipeline_blackbox_live_lines_reach_subscribers_in_order() {
    let timeline = Arc::new(Timeline::new(&TimelineConfig::default()));
    let view = TimelineView::new(Arc::clone(&timeline));
    let mut sub = view.subscribe();

    // Header and records split across arbitrary chunk boundaries.
    let stream = format!(
        "Media path: 'srt://:4200' --> 'file://out.ts'\n{HEADER}\r\n100,10,0,0,0.5,1.2\n200,20,2,0,0.7,1.4\n300,30,2,1,0.6,1.3\n"
    );
    let bytes = stream.as_bytes();
    let chunks: Vec<&[u8]> = bytes.chunks(7).collect();

    let errors = ingest(&chunks, &timeline);
    assert!(errors.is_empty(), "unexpected errors: {errors:?}");

    let snapshot = view.snapshot();
    let sequences: Vec<u64> = snapshot.iter().map(|s| s.sequence()).collect();
    assert_eq!(sequences, vec![0, 1, 2]);

    let lost: Vec<Option<f64>> = snapshot
        .iter()
        .map(|s| s.metrics().get(Metric::PacketsLost))
        .collect();
    assert_eq!(lost, vec![Some(0.0), Some(2.0), Some(2.0)]);
    assert_eq!(snapshot[2].timestamp(), Timestamp::from_millis(300));
    assert!(snapshot.iter().all(|s| s.source() == Source::Live));

    timeline.close();

    let mut delivered = Vec::new();
    while let Some(sample) = sub.next().await {
        delivered.push(sample.sequence());
    }
    assert_eq!(delivered, vec![0, 1, 2]);
    assert_eq!(sub.missed(), 0);
}

#[test]
fn pipeline_blackbox_skips_bad_lines_without_losing_the_stream() {
    let timeline = Timeline::new(&TimelineConfig::default());

    let stream = format!(
        "{HEADER}\n100,10,0,0,0.5,1.2\n150,-4,0,0,0.5,1.2\n150,nan,0,0,0.5,1.2\n100,12,0,0,0.5,1.2\n200,20,0,0,0.5,1.2\npartial,line"
    );
    let errors = ingest(&[stream.as_bytes()], &timeline);

    // Two malformed records; the duplicate timestamp is rejected by the timeline.
    assert_eq!(errors.len(), 2);
    assert!(errors
        .iter()
        .all(|e| matches!(e, DecodeError::MalformedRecord { .. })));

    let snapshot = timeline.snapshot();
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0].metrics().get(Metric::PacketsReceived), Some(10.0));
    assert_eq!(snapshot[1].metrics().get(Metric::PacketsReceived), Some(20.0));
}

#[test]
fn pipeline_blackbox_unsupported_header_reports_once() {
    let timeline = Timeline::new(&TimelineConfig::default());
    let stream = "Time,msRTT,mbpsRecvRate\n100,0.5,1.0\nTime,msRTT,mbpsRecvRate\n200,0.5,1.0\n";

    let errors = ingest(&[stream.as_bytes()], &timeline);
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], DecodeError::UnsupportedSchema { .. }));
    assert!(timeline.is_empty());
}

#[test]
fn pipeline_blackbox_retention_keeps_newest_samples() {
    let cfg = TimelineConfig {
        max_samples: Some(3),
        ..Default::default()
    };
    let timeline = Timeline::new(&cfg);

    let mut stream = format!("{HEADER}\n");
    for i in 1..=10 {
        stream.push_str(&format!("{},{},0,0,0.5,1.0\n", i * 100, i * 10));
    }
    ingest(&[stream.as_bytes()], &timeline);

    let sequences: Vec<u64> = timeline.snapshot().iter().map(|s| s.sequence()).collect();
    assert_eq!(sequences, vec![7, 8, 9]);
    assert_eq!(timeline.evicted(), 7);
}

#[tokio::test]
async fn pipeline_blackbox_trace_export_becomes_a_stopped_session() {
    let export = "\
_ws.col.Time;packets_received;packets_lost;srt.rtt;srt.bw
12.5;100;0;20000;8000
13.5;98;2;21000;8100
14.5;99;1;19000;7900
";
    let records = CaptureReader::new(';')
        .read(Cursor::new(export))
        .expect("export parses");
    assert_eq!(records.len(), 3);

    let ctl = SessionController::new(Config::default(), None);
    ctl.start_trace(records).await.expect("trace session");

    let status = ctl.status();
    assert_eq!(status.state, SessionState::Stopped);
    assert_eq!(status.source, Some(Source::Trace));

    let view = ctl.timeline().expect("timeline");
    let snapshot = view.snapshot();
    assert_eq!(snapshot.len(), 3);
    assert_eq!(snapshot[0].timestamp(), Timestamp::from_millis(0));
    assert_eq!(snapshot[2].timestamp(), Timestamp::from_millis(2000));
    assert_eq!(snapshot[0].metrics().get(Metric::RttMs), Some(20.0));
    assert_eq!(snapshot[0].metrics().get(Metric::BandwidthMbps), Some(8.0));

    let summary = view.summary();
    assert_eq!(summary.samples, 3);
    assert_eq!(summary.packets_lost, Some(3.0));
    assert_eq!(summary.duration_ms, 2000.0);
}

#[tokio::test]
async fn pipeline_blackbox_incomplete_trace_fails_session() {
    let export = "\
_ws.col.Time;packets_received;packets_lost
1.0;100;0
;90;1
";
    let records = CaptureReader::new(';')
        .read(Cursor::new(export))
        .expect("export parses");

    let ctl = SessionController::new(Config::default(), None);
    let err = ctl.start_trace(records).await.expect_err("incomplete");
    assert_eq!(err.kind(), ErrorKind::IncompleteTrace);

    let status = ctl.status();
    assert_eq!(status.state, SessionState::Failed);
    assert!(ctl.timeline().expect("timeline").is_empty());
}
