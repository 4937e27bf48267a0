use lmrelay_common::UpstreamErrorDetail;
use lmrelay_protocol::openai::chat::ChatCompletionChunk;
use lmrelay_protocol::sse::{SseLine, SseLineScanner};

/// One event produced by the reader.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameEvent {
    /// A decoded frame plus the exact payload it was decoded from, kept
    /// for passthrough forwarding.
    Frame {
        chunk: ChatCompletionChunk,
        raw: String,
    },
    /// The terminal sentinel was seen; the stream is over.
    Done,
}

/// Lazy, finite, non-restartable frame sequence over one byte stream.
///
/// Wraps the line scanner and decodes each data payload. Malformed JSON
/// is logged and skipped, never fatal.
#[derive(Debug, Default)]
pub struct FrameReader {
    scanner: SseLineScanner,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<FrameEvent> {
        let lines = self.scanner.push_bytes(chunk);
        self.decode_lines(lines)
    }

    pub fn finish(&mut self) -> Vec<FrameEvent> {
        let lines = self.scanner.finish();
        self.decode_lines(lines)
    }

    fn decode_lines(&self, lines: Vec<SseLine>) -> Vec<FrameEvent> {
        let mut out = Vec::new();
        for line in lines {
            match line {
                SseLine::Done => out.push(FrameEvent::Done),
                SseLine::Data(raw) => match serde_json::from_str::<ChatCompletionChunk>(&raw) {
                    Ok(chunk) => out.push(FrameEvent::Frame { chunk, raw }),
                    Err(err) => {
                        tracing::warn!(
                            error = %err,
                            bytes = raw.len(),
                            "skipping malformed stream frame"
                        );
                    }
                },
            }
        }
        out
    }
}

/// Whether the response body is an event stream. Checked before the scan
/// loop so JSON error documents never enter it.
pub fn is_event_stream(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("text/event-stream"))
}

/// Decode a JSON error document, accepting both `{"error": {...}}` and a
/// bare detail object.
pub fn decode_upstream_error(body: &[u8]) -> Option<UpstreamErrorDetail> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let detail = value.get("error").cloned().unwrap_or(value);
    serde_json::from_value(detail).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_frames_and_stops_at_sentinel() {
        let mut reader = FrameReader::new();
        let events = reader.push_bytes(
            b"data: {\"id\":\"c1\",\"object\":\"chat.completion.chunk\",\"created\":1,\
              \"model\":\"m\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"hi\"}}]}\n\
              data: [DONE]\n",
        );
        assert_eq!(events.len(), 2);
        match &events[0] {
            FrameEvent::Frame { chunk, .. } => {
                assert_eq!(chunk.id, "c1");
                assert_eq!(chunk.choices.len(), 1);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(events[1], FrameEvent::Done);
    }

    #[test]
    fn malformed_json_is_skipped_not_fatal() {
        let mut reader = FrameReader::new();
        let events = reader.push_bytes(
            b"data: {not json}\n\
              data: {\"id\":\"c2\",\"object\":\"chat.completion.chunk\",\"created\":1,\
              \"model\":\"m\",\"choices\":[]}\n",
        );
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], FrameEvent::Frame { chunk, .. } if chunk.id == "c2"));
    }

    #[test]
    fn content_type_sniffing() {
        assert!(is_event_stream("text/event-stream"));
        assert!(is_event_stream("text/event-stream; charset=utf-8"));
        assert!(!is_event_stream("application/json"));
        assert!(!is_event_stream("application/json; charset=utf-8"));
    }

    #[test]
    fn upstream_error_decoding() {
        let wrapped = br#"{"error":{"message":"quota exceeded","type":"rate_limit","code":429}}"#;
        let detail = decode_upstream_error(wrapped).unwrap();
        assert_eq!(detail.message, "quota exceeded");
        assert_eq!(detail.r#type.as_deref(), Some("rate_limit"));

        let bare = br#"{"message":"bad key"}"#;
        assert_eq!(decode_upstream_error(bare).unwrap().message, "bad key");
    }
}
