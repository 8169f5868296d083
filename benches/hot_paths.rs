use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use srtwatch::config::TimelineConfig;
use srtwatch::decoder::framing::LineFramer;
use srtwatch::decoder::LineDecoder;
use srtwatch::timeline::{Summary, Timeline};

const HEADER: &str = "Time,SocketID,pktFlowWindow,pktCongestionWindow,pktFlightSize,msRTT,mbpsBandwidth,mbpsMaxBW,pktSent,pktSndLoss,pktSndDrop,pktRetrans,byteSent,byteAvailSndBuf,byteSndDrop,mbpsSendRate,usPktSndPeriod,msSndBuf,pktRecv,pktRcvLoss,pktRcvDrop,pktRcvRetrans,pktRcvBelated,byteRecv,byteAvailRcvBuf,byteRcvLoss,byteRcvDrop,mbpsRecvRate,msRcvBuf,msRcvTsbPdDelay";

fn record(time_ms: u64) -> String {
    format!(
        "{time_ms},465349474,8192,8192,0,0.245,1196.49,1000,0,0,0,0,0,12288000,0,0,10,0,855,0,0,0,0,1120860,11999040,0,0,8.96688,183,120"
    )
}

fn stream(records: u64) -> Vec<u8> {
    let mut out = String::with_capacity(HEADER.len() + records as usize * 128);
    out.push_str(HEADER);
    out.push('\n');
    for i in 1..=records {
        out.push_str(&record(i * 10));
        out.push('\n');
    }
    out.into_bytes()
}

fn bench_decode_record(c: &mut Criterion) {
    let mut decoder = LineDecoder::new(Duration::ZERO);
    let _ = decoder.decode(HEADER);
    let line = record(1003);

    c.bench_function("decoder/full_record", |b| {
        b.iter(|| black_box(decoder.decode(black_box(&line))))
    });
}

fn bench_ingest_stream(c: &mut Criterion) {
    let bytes = stream(1_000);

    c.bench_function("pipeline/frame_decode_append_1k", |b| {
        b.iter_batched(
            || Timeline::new(&TimelineConfig::default()),
            |timeline| {
                let mut framer = LineFramer::new(64 * 1024);
                let mut decoder = LineDecoder::new(Duration::ZERO);
                let mut lines = Vec::new();

                for chunk in bytes.chunks(8 * 1024) {
                    framer.push(chunk, &mut lines);
                    for line in lines.drain(..) {
                        if let Ok(Some(reading)) = decoder.decode(&line) {
                            let _ = timeline.append(reading);
                        }
                    }
                }
                black_box(timeline.len())
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_summary(c: &mut Criterion) {
    let timeline = Timeline::new(&TimelineConfig::default());
    let mut decoder = LineDecoder::new(Duration::ZERO);
    let _ = decoder.decode(HEADER);
    for i in 1..=3_600 {
        if let Ok(Some(reading)) = decoder.decode(&record(i * 1000)) {
            let _ = timeline.append(reading);
        }
    }
    let samples = timeline.snapshot();

    c.bench_function("timeline/summary_3600", |b| {
        b.iter(|| black_box(Summary::from_samples(black_box(&samples))))
    });
}

criterion_group!(benches, bench_decode_record, bench_ingest_stream, bench_summary);
criterion_main!(benches);
