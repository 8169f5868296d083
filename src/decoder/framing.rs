//! Reassembles complete lines from arbitrarily split byte chunks.

/// Splits a byte stream into lines, holding partial input until its
/// terminator arrives.
///
/// Lines end at `\n`; a preceding `\r` is stripped. Lines longer than the
/// configured limit are discarded up to their terminator and counted in
/// [`LineFramer::oversized`]. Invalid UTF-8 is replaced lossily.
#[derive(Debug)]
pub struct LineFramer {
    buf: Vec<u8>,
    max_line_bytes: usize,
    discarding: bool,
    oversized: u64,
}

impl LineFramer {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buf: Vec::with_capacity(max_line_bytes.min(1024)),
            max_line_bytes,
            discarding: false,
            oversized: 0,
        }
    }

    /// Feeds one chunk, appending every line it completes to `out`.
    pub fn push(&mut self, mut chunk: &[u8], out: &mut Vec<String>) {
        while !chunk.is_empty() {
            match chunk.iter().position(|b| *b == b'\n') {
                Some(idx) => {
                    let head = &chunk[..idx];
                    chunk = &chunk[idx + 1..];

                    if self.discarding {
                        self.discarding = false;
                        continue;
                    }

                    if self.buf.len() + head.len() > self.max_line_bytes {
                        self.buf.clear();
                        self.oversized += 1;
                        continue;
                    }

                    self.buf.extend_from_slice(head);
                    out.push(self.take_line());
                }
                None => {
                    if !self.discarding {
                        if self.buf.len() + chunk.len() > self.max_line_bytes {
                            self.buf.clear();
                            self.discarding = true;
                            self.oversized += 1;
                        } else {
                            self.buf.extend_from_slice(chunk);
                        }
                    }
                    chunk = &[];
                }
            }
        }
    }

    /// Ends the stream. Returns the size of an unterminated trailing
    /// fragment, which is dropped rather than decoded.
    pub fn finish(&mut self) -> Option<usize> {
        self.discarding = false;
        if self.buf.is_empty() {
            return None;
        }
        let dropped = self.buf.len();
        self.buf.clear();
        Some(dropped)
    }

    /// Bytes currently waiting for a terminator.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Lines discarded for exceeding the length limit.
    pub fn oversized(&self) -> u64 {
        self.oversized
    }

    fn take_line(&mut self) -> String {
        if self.buf.last() == Some(&b'\r') {
            self.buf.pop();
        }
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(framer: &mut LineFramer, chunks: &[&[u8]]) -> Vec<String> {
        let mut out = Vec::new();
        for chunk in chunks {
            framer.push(chunk, &mut out);
        }
        out
    }

    #[test]
    fn test_split_line_is_buffered_until_terminator() {
        let mut framer = LineFramer::new(1024);
        let lines = feed(&mut framer, &[b"100,2,0", b",5"]);
        assert!(lines.is_empty());
        assert_eq!(framer.pending(), 9);

        let lines = feed(&mut framer, &[b"\n200,"]);
        assert_eq!(lines, vec!["100,2,0,5".to_string()]);
        assert_eq!(framer.pending(), 4);
    }

    #[test]
    fn test_multiple_lines_in_one_chunk_and_crlf() {
        let mut framer = LineFramer::new(1024);
        let lines = feed(&mut framer, &[b"a\r\nb\n\nc\n"]);
        assert_eq!(lines, vec!["a", "b", "", "c"]);
    }

    #[test]
    fn test_split_between_cr_and_lf() {
        let mut framer = LineFramer::new(1024);
        let lines = feed(&mut framer, &[b"abc\r", b"\n"]);
        assert_eq!(lines, vec!["abc"]);
    }

    #[test]
    fn test_oversized_line_discarded_up_to_terminator() {
        let mut framer = LineFramer::new(4);
        let lines = feed(&mut framer, &[b"abc", b"defgh", b"ij\nok\n"]);
        assert_eq!(lines, vec!["ok"]);
        assert_eq!(framer.oversized(), 1);

        let lines = feed(&mut framer, &[b"toolong\nfine\n"]);
        assert_eq!(lines, vec!["fine"]);
        assert_eq!(framer.oversized(), 2);
    }

    #[test]
    fn test_finish_drops_trailing_fragment() {
        let mut framer = LineFramer::new(1024);
        let lines = feed(&mut framer, &[b"done\npart"]);
        assert_eq!(lines, vec!["done"]);
        assert_eq!(framer.finish(), Some(4));
        assert_eq!(framer.finish(), None);
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut framer = LineFramer::new(1024);
        let lines = feed(&mut framer, &[b"a\xffb\n"]);
        assert_eq!(lines, vec!["a\u{fffd}b"]);
    }
}
