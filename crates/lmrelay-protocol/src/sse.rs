use bytes::Bytes;

/// Terminal sentinel line closing a chat-completions event stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Per-line buffer ceiling. A single line larger than this is dropped
/// whole rather than buffered without bound.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseLine {
    /// Payload of one `data:` line.
    Data(String),
    /// The terminal sentinel; no further lines follow.
    Done,
}

/// Incremental scanner turning raw bytes into `data:` payloads.
///
/// Tolerates a missing space after the `data:` marker, skips comment and
/// `event:` lines (keep-alives, forward-compatible noise), and stops at
/// the `[DONE]` sentinel. Not restartable; one instance per connection.
#[derive(Debug, Default)]
pub struct SseLineScanner {
    buffer: Vec<u8>,
    overflow: bool,
    done: bool,
}

impl SseLineScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<SseLine> {
        let mut out = Vec::new();
        if self.done {
            return out;
        }

        for &byte in chunk {
            if byte == b'\n' {
                if self.overflow {
                    self.overflow = false;
                } else {
                    let line = std::mem::take(&mut self.buffer);
                    self.scan_line(&line, &mut out);
                    if self.done {
                        return out;
                    }
                }
                continue;
            }
            if self.overflow {
                continue;
            }
            if self.buffer.len() >= MAX_LINE_BYTES {
                self.overflow = true;
                self.buffer.clear();
                continue;
            }
            self.buffer.push(byte);
        }

        out
    }

    /// Flush a trailing line that arrived without a final newline.
    pub fn finish(&mut self) -> Vec<SseLine> {
        let mut out = Vec::new();
        if self.done || self.overflow || self.buffer.is_empty() {
            self.buffer.clear();
            return out;
        }
        let line = std::mem::take(&mut self.buffer);
        self.scan_line(&line, &mut out);
        out
    }

    fn scan_line(&mut self, line: &[u8], out: &mut Vec<SseLine>) {
        let mut line = line;
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        // Anything shorter than the marker itself cannot carry data.
        let Some(rest) = line.strip_prefix(b"data:") else {
            return;
        };
        let rest = rest.strip_prefix(b" ").unwrap_or(rest);
        let payload = String::from_utf8_lossy(rest);
        if payload == DONE_SENTINEL {
            self.done = true;
            out.push(SseLine::Done);
            return;
        }
        if payload.is_empty() {
            return;
        }
        out.push(SseLine::Data(payload.into_owned()));
    }
}

/// Encode one SSE frame. `event:` is omitted for data-only protocols.
/// Multi-line payloads get one `data:` line each.
pub fn encode_sse_event(event: Option<&str>, data: &str) -> Bytes {
    let mut out = String::new();
    if let Some(event) = event {
        out.push_str("event: ");
        out.push_str(event);
        out.push('\n');
    }
    for line in data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    Bytes::from(out)
}

pub fn encode_done() -> Bytes {
    Bytes::from_static(b"data: [DONE]\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_lines(lines: Vec<SseLine>) -> Vec<String> {
        lines
            .into_iter()
            .filter_map(|line| match line {
                SseLine::Data(data) => Some(data),
                SseLine::Done => None,
            })
            .collect()
    }

    #[test]
    fn scans_data_lines_and_sentinel() {
        let mut scanner = SseLineScanner::new();
        let lines = scanner.push_bytes(b"data: {\"a\":1}\n\ndata: {\"b\":2}\ndata: [DONE]\n");
        assert_eq!(
            lines,
            vec![
                SseLine::Data("{\"a\":1}".to_string()),
                SseLine::Data("{\"b\":2}".to_string()),
                SseLine::Done,
            ]
        );
        assert!(scanner.is_done());
        assert!(scanner.push_bytes(b"data: {\"c\":3}\n").is_empty());
    }

    #[test]
    fn tolerates_missing_space_after_marker() {
        let mut scanner = SseLineScanner::new();
        let lines = scanner.push_bytes(b"data:{\"a\":1}\n");
        assert_eq!(data_lines(lines), vec!["{\"a\":1}".to_string()]);
    }

    #[test]
    fn skips_comments_events_and_short_lines() {
        let mut scanner = SseLineScanner::new();
        let lines =
            scanner.push_bytes(b": keep-alive\nevent: ping\nd\n\r\ndata: {\"a\":1}\r\n");
        assert_eq!(data_lines(lines), vec!["{\"a\":1}".to_string()]);
    }

    #[test]
    fn reassembles_lines_split_across_chunks() {
        let mut scanner = SseLineScanner::new();
        assert!(scanner.push_bytes(b"data: {\"a\"").is_empty());
        let lines = scanner.push_bytes(b":1}\n");
        assert_eq!(data_lines(lines), vec!["{\"a\":1}".to_string()]);
    }

    #[test]
    fn finish_flushes_unterminated_line() {
        let mut scanner = SseLineScanner::new();
        assert!(scanner.push_bytes(b"data: {\"a\":1}").is_empty());
        assert_eq!(data_lines(scanner.finish()), vec!["{\"a\":1}".to_string()]);
    }

    #[test]
    fn oversized_line_is_dropped_whole() {
        let mut scanner = SseLineScanner::new();
        let mut giant = Vec::from(&b"data: "[..]);
        giant.resize(MAX_LINE_BYTES + 64, b'x');
        assert!(scanner.push_bytes(&giant).is_empty());
        // The oversized line is discarded once its newline arrives and the
        // following line scans normally.
        let lines = scanner.push_bytes(b"yyy\ndata: {\"a\":1}\n");
        assert_eq!(data_lines(lines), vec!["{\"a\":1}".to_string()]);
    }

    #[test]
    fn encodes_named_and_data_only_frames() {
        let framed = encode_sse_event(Some("message_start"), "{}");
        assert_eq!(&framed[..], b"event: message_start\ndata: {}\n\n");
        let plain = encode_sse_event(None, "{}");
        assert_eq!(&plain[..], b"data: {}\n\n");
        assert_eq!(&encode_done()[..], b"data: [DONE]\n\n");
    }
}
