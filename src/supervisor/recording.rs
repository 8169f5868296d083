//! Post-session check of the stream the receiver wrote to disk.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use thiserror::Error;

/// MPEG transport stream packet size.
pub const TS_PACKET_SIZE: usize = 188;
const TS_SYNC_BYTE: u8 = 0x47;

/// Errors raised while checking a recorded stream.
#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("reading recording: {0}")]
    Io(#[from] io::Error),

    #[error("{} holds no complete transport stream packet", path.display())]
    Empty { path: PathBuf },

    #[error("{} is not a transport stream: packet {packet} has no sync byte", path.display())]
    NotTransportStream { path: PathBuf, packet: u64 },
}

/// What a valid recording contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordingInfo {
    pub packets: u64,
    /// Bytes after the last complete packet.
    pub trailing_bytes: usize,
}

/// Checks that `path` is an MPEG transport stream: every 188-byte packet
/// starts with the 0x47 sync byte. A partial final packet is tolerated.
pub fn validate_recording(path: &Path) -> Result<RecordingInfo, RecordingError> {
    let file = File::open(path)?;
    check_packets(BufReader::new(file), path)
}

fn check_packets<R: Read>(mut reader: R, path: &Path) -> Result<RecordingInfo, RecordingError> {
    let mut packet = [0u8; TS_PACKET_SIZE];
    let mut packets = 0u64;

    loop {
        let filled = fill(&mut reader, &mut packet)?;
        if filled < TS_PACKET_SIZE {
            if packets == 0 {
                return Err(RecordingError::Empty {
                    path: path.to_path_buf(),
                });
            }
            return Ok(RecordingInfo {
                packets,
                trailing_bytes: filled,
            });
        }

        if packet[0] != TS_SYNC_BYTE {
            return Err(RecordingError::NotTransportStream {
                path: path.to_path_buf(),
                packet: packets,
            });
        }
        packets += 1;
    }
}

/// Reads until `buf` is full or EOF; returns the bytes read.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packets(count: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(count * TS_PACKET_SIZE);
        for i in 0..count {
            let mut packet = vec![0xffu8; TS_PACKET_SIZE];
            packet[0] = TS_SYNC_BYTE;
            packet[3] = i as u8;
            out.extend_from_slice(&packet);
        }
        out
    }

    #[test]
    fn test_valid_stream_counts_packets() {
        let mut bytes = packets(3);
        bytes.extend_from_slice(&[TS_SYNC_BYTE, 0x00, 0x11]);

        let info = check_packets(bytes.as_slice(), Path::new("received.ts")).expect("valid");
        assert_eq!(info.packets, 3);
        assert_eq!(info.trailing_bytes, 3);
    }

    #[test]
    fn test_lost_sync_is_rejected() {
        let mut bytes = packets(4);
        bytes[2 * TS_PACKET_SIZE] = 0x00;

        let err = check_packets(bytes.as_slice(), Path::new("received.ts")).expect_err("no sync");
        assert!(matches!(
            err,
            RecordingError::NotTransportStream { packet: 2, .. }
        ));
    }

    #[test]
    fn test_empty_or_short_recording() {
        assert!(matches!(
            check_packets(&b""[..], Path::new("received.ts")),
            Err(RecordingError::Empty { .. })
        ));
        assert!(matches!(
            check_packets(&[TS_SYNC_BYTE; 100][..], Path::new("received.ts")),
            Err(RecordingError::Empty { .. })
        ));
    }

    #[test]
    fn test_validate_recording_reads_file() {
        let dir = std::env::temp_dir();
        let ts = dir.join(format!("srtwatch-recording-{}.ts", std::process::id()));
        let text = dir.join(format!("srtwatch-recording-{}.txt", std::process::id()));
        std::fs::write(&ts, packets(2)).expect("write");
        std::fs::write(&text, "not a stream\n".repeat(40)).expect("write");

        assert_eq!(validate_recording(&ts).expect("ts").packets, 2);
        assert!(matches!(
            validate_recording(&text),
            Err(RecordingError::NotTransportStream { packet: 0, .. })
        ));
        assert!(matches!(
            validate_recording(&dir.join("srtwatch-missing.ts")),
            Err(RecordingError::Io(_))
        ));

        for path in [ts, text] {
            std::fs::remove_file(path).ok();
        }
    }
}
