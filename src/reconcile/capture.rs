//! Loading capture-analysis exports and checking capture files.
//!
//! Two export layouts are accepted. Interval exports already carry one
//! row per reporting interval. Per-packet exports (one row per SRT packet,
//! as produced by a dissector field dump) are binned into intervals here.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufRead, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use super::CaptureRecord;

/// SRT sequence numbers are 31 bits wide.
const SEQ_MASK: u32 = 0x7FFF_FFFF;
/// Forward gaps at least this large are treated as reordering, not loss.
const SEQ_REORDER_THRESHOLD: u32 = 1 << 30;

const PCAP_MAGIC: [[u8; 4]; 4] = [
    [0xd4, 0xc3, 0xb2, 0xa1],
    [0xa1, 0xb2, 0xc3, 0xd4],
    [0x4d, 0x3c, 0xb2, 0xa1],
    [0xa1, 0xb2, 0x3c, 0x4d],
];
const PCAPNG_MAGIC: [u8; 4] = [0x0a, 0x0d, 0x0d, 0x0a];

const TIME_ALIASES: &[&str] = &[
    "_ws.col.Time",
    "_ws.col.cls_time",
    "frame.time_relative",
    "time_s",
    "time",
    "Time",
];

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("reading capture export: {0}")]
    Io(#[from] io::Error),

    #[error("capture export has no header row")]
    MissingHeader,

    #[error("capture export has no time column")]
    MissingTime,

    #[error("line {line}: column {column} value {value:?} is not a number")]
    InvalidValue {
        line: usize,
        column: String,
        value: String,
    },

    #[error("{} is not a pcap or pcapng capture", path.display())]
    NotCapture { path: PathBuf },
}

/// Container format identified by a capture's magic number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureFormat {
    Pcap,
    PcapNg,
}

/// Checks the magic number of a capture file before its analysis is trusted.
pub fn validate_capture(path: &Path) -> Result<CaptureFormat, CaptureError> {
    let mut magic = [0u8; 4];
    let mut file = File::open(path)?;

    if file.read_exact(&mut magic).is_err() {
        return Err(CaptureError::NotCapture {
            path: path.to_path_buf(),
        });
    }

    if PCAP_MAGIC.contains(&magic) {
        Ok(CaptureFormat::Pcap)
    } else if magic == PCAPNG_MAGIC {
        Ok(CaptureFormat::PcapNg)
    } else {
        Err(CaptureError::NotCapture {
            path: path.to_path_buf(),
        })
    }
}

/// Loads an export with the default one-second aggregation interval.
pub fn read_records<R: BufRead>(reader: R, delimiter: char) -> Result<Vec<CaptureRecord>, CaptureError> {
    CaptureReader::new(delimiter).read(reader)
}

/// Configurable export loader.
#[derive(Debug, Clone)]
pub struct CaptureReader {
    delimiter: char,
    interval: Duration,
}

impl CaptureReader {
    pub fn new(delimiter: char) -> Self {
        Self {
            delimiter,
            interval: Duration::from_secs(1),
        }
    }

    /// Bin width used for per-packet exports.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn read<R: BufRead>(&self, reader: R) -> Result<Vec<CaptureRecord>, CaptureError> {
        let mut lines = reader.lines().enumerate();

        let header = loop {
            match lines.next() {
                Some((_, line)) => {
                    let line = line?;
                    if !line.trim().is_empty() {
                        break line;
                    }
                }
                None => return Err(CaptureError::MissingHeader),
            }
        };

        let names: Vec<String> = self.split(&header).map(str::to_string).collect();
        let layout = Layout::from_header(&names)?;

        let mut rows = Vec::new();
        for (idx, line) in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let values: Vec<&str> = self.split(&line).collect();
            rows.push(Row::parse(idx + 1, &names, &values)?);
        }

        let records = match layout {
            Layout::Interval(time) => rows.iter().map(|row| interval_record(row, time)).collect(),
            Layout::Packet(time) => bin_packets(&rows, time, self.interval),
        };

        debug!(rows = rows.len(), "loaded capture export");
        Ok(records)
    }

    fn split<'a>(&self, line: &'a str) -> impl Iterator<Item = &'a str> {
        line.split(self.delimiter).map(|f| f.trim().trim_matches('"'))
    }
}

#[derive(Debug, Clone, Copy)]
enum Layout {
    Interval(usize),
    Packet(usize),
}

impl Layout {
    fn from_header(names: &[String]) -> Result<Self, CaptureError> {
        let time = TIME_ALIASES
            .iter()
            .find_map(|alias| names.iter().position(|n| n == alias))
            .ok_or(CaptureError::MissingTime)?;

        let has = |alias: &[&str]| names.iter().any(|n| alias.contains(&n.as_str()));
        let interval = has(&["packets_received", "packets_lost"]);
        let packet = has(&["srt.iscontrol"]);

        if packet && !interval {
            Ok(Self::Packet(time))
        } else {
            Ok(Self::Interval(time))
        }
    }
}

/// One parsed export row. Empty cells are absent.
#[derive(Debug)]
struct Row {
    values: Vec<(String, Option<f64>)>,
}

impl Row {
    fn parse(line: usize, names: &[String], values: &[&str]) -> Result<Self, CaptureError> {
        let mut parsed = Vec::with_capacity(names.len());

        for (name, raw) in names.iter().zip(values) {
            // Repeated dissector fields arrive comma-joined; the first wins.
            let raw = raw.split(',').next().unwrap_or_default().trim();
            if raw.is_empty() {
                parsed.push((name.clone(), None));
                continue;
            }
            let value = parse_number(raw).ok_or_else(|| CaptureError::InvalidValue {
                line,
                column: name.clone(),
                value: raw.to_string(),
            })?;
            parsed.push((name.clone(), Some(value)));
        }

        Ok(Self { values: parsed })
    }

    fn at(&self, idx: usize) -> Option<f64> {
        self.values.get(idx).and_then(|(_, v)| *v)
    }

    fn get(&self, aliases: &[&str]) -> Option<f64> {
        self.values
            .iter()
            .find(|(name, v)| v.is_some() && aliases.contains(&name.as_str()))
            .and_then(|(_, v)| *v)
    }

    fn has_column(&self, aliases: &[&str]) -> bool {
        self.values.iter().any(|(name, _)| aliases.contains(&name.as_str()))
    }
}

fn parse_number(raw: &str) -> Option<f64> {
    if let Ok(v) = raw.parse::<f64>() {
        return Some(v);
    }
    match raw {
        "True" | "true" => Some(1.0),
        "False" | "false" => Some(0.0),
        _ => raw
            .strip_prefix("0x")
            .and_then(|hex| u64::from_str_radix(hex, 16).ok())
            .map(|v| v as f64),
    }
}

const RECEIVED: &[&str] = &["packets_received", "pktRecv"];
const LOST: &[&str] = &["packets_lost", "pktRcvLoss"];
const RETRANSMITTED: &[&str] = &["retransmitted", "pktRcvRetrans"];
const CONTROL: &[&str] = &["control_packets"];
const BYTES: &[&str] = &["bytes_received", "byteRecv"];
const RTT: &[&str] = &["rtt_us", "srt.rtt"];
const BANDWIDTH: &[&str] = &["bandwidth_kbps", "srt.bw"];
const RECV_RATE: &[&str] = &["receive_rate_mbps", "mbpsRecvRate"];

const IS_CONTROL: &[&str] = &["srt.iscontrol"];
const SEQNO: &[&str] = &["srt.seqno"];
const REXMIT: &[&str] = &["srt.msg.rexmit"];
const LENGTH: &[&str] = &["udp.length", "frame.len"];

fn interval_record(row: &Row, time: usize) -> CaptureRecord {
    let known: Vec<&str> = [RECEIVED, LOST, RETRANSMITTED, CONTROL, BYTES, RTT, BANDWIDTH, RECV_RATE]
        .concat();

    let extra = row
        .values
        .iter()
        .enumerate()
        .filter(|(idx, (name, _))| *idx != time && !known.contains(&name.as_str()))
        .filter_map(|(_, (name, v))| v.map(|v| (name.clone(), v)))
        .collect::<BTreeMap<_, _>>();

    CaptureRecord {
        time_s: row.at(time),
        packets_received: row.get(RECEIVED),
        packets_lost: row.get(LOST),
        retransmitted: row.get(RETRANSMITTED),
        control_packets: row.get(CONTROL),
        bytes_received: row.get(BYTES),
        rtt_us: row.get(RTT),
        bandwidth_kbps: row.get(BANDWIDTH),
        receive_rate_mbps: row.get(RECV_RATE),
        extra,
    }
}

#[derive(Debug, Default)]
struct Bin {
    data: u64,
    control: u64,
    retransmitted: u64,
    lost: u64,
    bytes: f64,
    rtt_sum: f64,
    rtt_count: u64,
    bw_sum: f64,
    bw_count: u64,
}

/// Aggregates per-packet rows into one record per `interval`.
fn bin_packets(rows: &[Row], time: usize, interval: Duration) -> Vec<CaptureRecord> {
    let width = interval.as_secs_f64();
    let has_seq = rows.first().is_some_and(|r| r.has_column(SEQNO));
    let has_len = rows.first().is_some_and(|r| r.has_column(LENGTH));

    let mut records = Vec::new();
    let mut current: Option<(u64, Bin)> = None;
    let mut last_seq: Option<u32> = None;

    for row in rows {
        let Some(t) = row.at(time).filter(|t| t.is_finite() && *t >= 0.0) else {
            continue;
        };
        let slot = (t / width).floor() as u64;

        // Rows are in capture order; a late row joins the open bin.
        if !matches!(&current, Some((open, _)) if slot <= *open) {
            if let Some((open, bin)) = current.take() {
                records.push(finish_bin(open, bin, width, has_seq, has_len));
            }
            current = Some((slot, Bin::default()));
        }
        let Some((_, bin)) = current.as_mut() else {
            continue;
        };

        if row.get(IS_CONTROL).unwrap_or(0.0) > 0.0 {
            bin.control += 1;
            if let Some(rtt) = row.get(RTT) {
                bin.rtt_sum += rtt;
                bin.rtt_count += 1;
            }
            if let Some(bw) = row.get(BANDWIDTH) {
                bin.bw_sum += bw;
                bin.bw_count += 1;
            }
            continue;
        }

        bin.data += 1;
        bin.bytes += row.get(LENGTH).unwrap_or(0.0);

        if row.get(REXMIT).unwrap_or(0.0) > 0.0 {
            bin.retransmitted += 1;
            continue;
        }

        if let Some(seq) = row.get(SEQNO).map(|s| s as u32 & SEQ_MASK) {
            if let Some(prev) = last_seq {
                let gap = seq.wrapping_sub(prev) & SEQ_MASK;
                if gap > 1 && gap < SEQ_REORDER_THRESHOLD {
                    bin.lost += u64::from(gap - 1);
                }
                if gap != 0 && gap < SEQ_REORDER_THRESHOLD {
                    last_seq = Some(seq);
                }
            } else {
                last_seq = Some(seq);
            }
        }
    }

    if let Some((open, bin)) = current {
        records.push(finish_bin(open, bin, width, has_seq, has_len));
    }

    records
}

fn finish_bin(slot: u64, bin: Bin, width: f64, has_seq: bool, has_len: bool) -> CaptureRecord {
    let mean = |sum: f64, n: u64| (n > 0).then(|| sum / n as f64);

    CaptureRecord {
        time_s: Some(slot as f64 * width),
        packets_received: Some(bin.data as f64),
        packets_lost: has_seq.then_some(bin.lost as f64),
        retransmitted: Some(bin.retransmitted as f64),
        control_packets: Some(bin.control as f64),
        bytes_received: has_len.then_some(bin.bytes),
        rtt_us: mean(bin.rtt_sum, bin.rtt_count),
        bandwidth_kbps: mean(bin.bw_sum, bin.bw_count),
        receive_rate_mbps: has_len.then(|| bin.bytes * 8.0 / width / 1_000_000.0),
        extra: BTreeMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_interval_export() {
        let csv = "\
time_s;packets_received;packets_lost;rtt_us;bandwidth_kbps;flow_window
0.0;100;0;20000;15000;8192
1.0;98;2;;15100;8190
";
        let records = read_records(csv.as_bytes(), ';').expect("parse");
        assert_eq!(records.len(), 2);

        assert_eq!(records[0].time_s, Some(0.0));
        assert_eq!(records[0].rtt_us, Some(20000.0));
        assert_eq!(records[1].packets_lost, Some(2.0));
        assert_eq!(records[1].rtt_us, None);
        assert_eq!(records[1].extra.get("flow_window"), Some(&8190.0));
    }

    #[test]
    fn test_read_packet_export_bins_by_interval() {
        let csv = "\
_ws.col.Time;srt.iscontrol;srt.seqno;srt.msg.rexmit;srt.rtt;srt.bw;udp.length
0.10;0;100;0;;;1316
0.20;0;101;0;;;1316
0.30;1;;;20000;12000;44
0.90;0;104;0;;;1316
1.20;0;103;1;;;1316
1.40;1;;;30000;14000;44
1.50;0;105;0;;;1316
";
        let records = read_records(csv.as_bytes(), ';').expect("parse");
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first.time_s, Some(0.0));
        assert_eq!(first.packets_received, Some(3.0));
        assert_eq!(first.control_packets, Some(1.0));
        assert_eq!(first.packets_lost, Some(2.0));
        assert_eq!(first.rtt_us, Some(20000.0));
        assert_eq!(first.bandwidth_kbps, Some(12000.0));
        assert_eq!(first.bytes_received, Some(3.0 * 1316.0));

        let second = &records[1];
        assert_eq!(second.time_s, Some(1.0));
        assert_eq!(second.packets_received, Some(2.0));
        assert_eq!(second.retransmitted, Some(1.0));
        assert_eq!(second.packets_lost, Some(0.0));
        assert_eq!(second.rtt_us, Some(30000.0));
    }

    #[test]
    fn test_missing_time_column() {
        let csv = "packets_received;packets_lost\n1;0\n";
        assert!(matches!(
            read_records(csv.as_bytes(), ';'),
            Err(CaptureError::MissingTime)
        ));
    }

    #[test]
    fn test_empty_export_has_no_header() {
        assert!(matches!(
            read_records("\n\n".as_bytes(), ';'),
            Err(CaptureError::MissingHeader)
        ));
    }

    #[test]
    fn test_invalid_value_reports_line() {
        let csv = "time;packets_received\n0;abc\n";
        let err = read_records(csv.as_bytes(), ';').expect_err("bad value");
        assert!(matches!(err, CaptureError::InvalidValue { line: 1, .. }));
    }

    #[test]
    fn test_validate_capture_magic() {
        let dir = std::env::temp_dir();
        let pcap = dir.join(format!("srtwatch-capture-{}.pcap", std::process::id()));
        let pcapng = dir.join(format!("srtwatch-capture-{}.pcapng", std::process::id()));
        let text = dir.join(format!("srtwatch-capture-{}.txt", std::process::id()));

        std::fs::write(&pcap, [0xd4, 0xc3, 0xb2, 0xa1, 0x02, 0x00]).expect("write");
        std::fs::write(&pcapng, [0x0a, 0x0d, 0x0d, 0x0a]).expect("write");
        std::fs::write(&text, b"hello").expect("write");

        assert_eq!(validate_capture(&pcap).expect("pcap"), CaptureFormat::Pcap);
        assert_eq!(validate_capture(&pcapng).expect("pcapng"), CaptureFormat::PcapNg);
        assert!(matches!(
            validate_capture(&text),
            Err(CaptureError::NotCapture { .. })
        ));

        for path in [pcap, pcapng, text] {
            std::fs::remove_file(path).ok();
        }
    }
}
