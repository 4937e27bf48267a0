use lmrelay_common::{RelayError, StreamOptions};
use lmrelay_protocol::openai::chat::{ChatCompletionChunk, DeltaContent, Usage};

use crate::thinking::ThinkingState;

/// Pre-allocation for a typical short response.
pub const INITIAL_BUF_CAPACITY: usize = 4 * 1024;
/// Capacity a buffer is reset to after tripping the ceiling.
pub const RESET_BUF_CAPACITY: usize = 64 * 1024;
/// Hard capacity ceiling; crossing it triggers a shrink after the frame.
pub const MAX_BUF_CAPACITY: usize = 1024 * 1024;

/// Divisor for the character-count token fallback.
const CHARS_PER_TOKEN: usize = 4;

/// Per-connection accumulation state for one upstream stream.
///
/// Owns the text buffers used for usage estimation, the latest upstream
/// usage record and the thinking extractor. Constructed once per
/// connection and discarded after finalization.
#[derive(Debug)]
pub struct StreamContext {
    options: StreamOptions,
    thinking: ThinkingState,
    visible: String,
    tool_args: String,
    usage: Option<Usage>,
    frames: u64,
    done: bool,
}

impl StreamContext {
    pub fn new(options: StreamOptions) -> Self {
        Self {
            options,
            thinking: ThinkingState::new(),
            visible: String::with_capacity(INITIAL_BUF_CAPACITY),
            tool_args: String::with_capacity(INITIAL_BUF_CAPACITY),
            usage: None,
            frames: 0,
            done: false,
        }
    }

    pub fn options(&self) -> &StreamOptions {
        &self.options
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn visible_text(&self) -> &str {
        &self.visible
    }

    pub fn tool_args_text(&self) -> &str {
        &self.tool_args
    }

    pub fn mark_done(&mut self) {
        self.done = true;
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Fold one frame into the context. Text is buffered before
    /// extraction so token estimation counts reasoning characters the
    /// upstream actually produced. Returns whether the frame was
    /// rewritten and must be re-encoded by passthrough paths.
    pub fn absorb_chunk(&mut self, chunk: &mut ChatCompletionChunk) -> bool {
        let mut modified = false;

        for choice in &mut chunk.choices {
            if let Some(content) = &choice.delta.content {
                let text = content.collect_text();
                self.visible.push_str(&text);

                if self.options.thinking_enabled
                    && !text.is_empty()
                    && let Some(extraction) = self.thinking.extract(&text)
                {
                    choice.delta.content = if extraction.visible.is_empty() {
                        None
                    } else {
                        Some(DeltaContent::Text(extraction.visible))
                    };
                    choice.delta.reasoning_content = extraction.reasoning;
                    modified = true;
                }
            }

            if let Some(tool_calls) = &choice.delta.tool_calls {
                for call in tool_calls {
                    if let Some(arguments) =
                        call.function.as_ref().and_then(|f| f.arguments.as_ref())
                    {
                        self.tool_args.push_str(&arguments.as_fragment());
                    }
                }
            }
        }

        // A usage-bearing frame replaces, never merges.
        if let Some(usage) = &chunk.usage {
            self.usage = Some(usage.clone());
        }

        self.frames += 1;
        shrink_if_oversized(&mut self.visible);
        shrink_if_oversized(&mut self.tool_args);
        modified
    }

    /// Zero frames and an empty visible buffer means upstream produced
    /// nothing; callers must not report that as success.
    pub fn validate(&self, bytes_in: u64) -> Result<(), RelayError> {
        if self.frames == 0 && self.visible.is_empty() {
            return Err(RelayError::EmptyStream {
                model: self.options.model.clone(),
                bytes_in,
            });
        }
        Ok(())
    }

    /// Resolve the final usage record. Upstream values win; only missing
    /// sub-fields are filled from the caller's prompt estimate and the
    /// character heuristic, and the total is recomputed only when zero.
    pub fn finalize_usage(&mut self) -> Usage {
        let prompt_estimate = self.options.prompt_tokens_estimate;
        // Character count, not byte length: multi-byte text must not be
        // billed per UTF-8 byte.
        let completion_chars = self.visible.chars().count() + self.tool_args.chars().count();
        let completion_estimate = (completion_chars / CHARS_PER_TOKEN) as i64;

        let mut usage = self.usage.take().unwrap_or_default();
        if usage.prompt_tokens == 0 {
            usage.prompt_tokens = prompt_estimate;
        }
        if usage.completion_tokens == 0 {
            usage.completion_tokens = completion_estimate;
        }
        if usage.total_tokens == 0 {
            usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
        }
        self.usage = Some(usage.clone());
        usage
    }
}

/// Once a buffer's capacity crosses the ceiling, move the content into a
/// fresh allocation sized at the reset target (or the content itself when
/// larger). Content is never lost, only slack capacity.
fn shrink_if_oversized(buf: &mut String) {
    if buf.capacity() <= MAX_BUF_CAPACITY {
        return;
    }
    let content = std::mem::take(buf);
    let mut fresh = String::with_capacity(RESET_BUF_CAPACITY.max(content.len()));
    fresh.push_str(&content);
    *buf = fresh;
}

#[cfg(test)]
mod tests {
    use super::*;
    use lmrelay_protocol::openai::chat::{
        ChunkChoice, ChunkDelta, ChunkObjectType, ToolCallArguments, ToolCallChunk,
        ToolCallChunkFunction,
    };

    fn options() -> StreamOptions {
        StreamOptions::new("test-model")
            .with_thinking(true)
            .with_prompt_tokens_estimate(9)
    }

    fn text_chunk(text: &str) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: "chatcmpl-1".to_string(),
            object: ChunkObjectType::ChatCompletionChunk,
            created: 1,
            model: "test-model".to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    content: Some(DeltaContent::Text(text.to_string())),
                    ..ChunkDelta::default()
                },
                finish_reason: None,
            }],
            usage: None,
        }
    }

    #[test]
    fn rewrites_delta_in_place() {
        let mut ctx = StreamContext::new(options());
        let mut chunk = text_chunk("Hi <think>why</think> there");
        assert!(ctx.absorb_chunk(&mut chunk));
        let delta = &chunk.choices[0].delta;
        assert_eq!(
            delta.content,
            Some(DeltaContent::Text("Hi  there".to_string()))
        );
        assert_eq!(delta.reasoning_content.as_deref(), Some("why"));
        // The buffer keeps the pre-extraction text for counting.
        assert_eq!(ctx.visible_text(), "Hi <think>why</think> there");
    }

    #[test]
    fn untouched_frames_report_unmodified() {
        let mut ctx = StreamContext::new(options());
        let mut chunk = text_chunk("plain");
        assert!(!ctx.absorb_chunk(&mut chunk));
        assert_eq!(ctx.frames(), 1);
    }

    #[test]
    fn usage_replaces_not_merges() {
        let mut ctx = StreamContext::new(options());
        let mut first = text_chunk("a");
        first.usage = Some(Usage {
            prompt_tokens: 5,
            completion_tokens: 1,
            total_tokens: 6,
            ..Usage::default()
        });
        ctx.absorb_chunk(&mut first);

        let mut second = text_chunk("b");
        second.usage = Some(Usage {
            prompt_tokens: 5,
            completion_tokens: 2,
            total_tokens: 7,
            ..Usage::default()
        });
        ctx.absorb_chunk(&mut second);

        let usage = ctx.finalize_usage();
        assert_eq!(usage.completion_tokens, 2);
        assert_eq!(usage.total_tokens, 7);
    }

    #[test]
    fn usage_fallback_heuristic() {
        let mut ctx = StreamContext::new(options());
        let mut chunk = text_chunk("Hello");
        ctx.absorb_chunk(&mut chunk);
        let usage = ctx.finalize_usage();
        assert_eq!(usage.prompt_tokens, 9);
        assert_eq!(usage.completion_tokens, 1); // 5 chars / 4
        assert_eq!(usage.total_tokens, 10);
    }

    #[test]
    fn fallback_counts_characters_not_bytes() {
        let mut ctx = StreamContext::new(options());
        let mut chunk = text_chunk("你好世界");
        ctx.absorb_chunk(&mut chunk);
        let usage = ctx.finalize_usage();
        // 4 characters (12 UTF-8 bytes) is one estimated token, not three.
        assert_eq!(usage.completion_tokens, 1);
    }

    #[test]
    fn partial_usage_fills_only_missing_fields() {
        let mut ctx = StreamContext::new(options());
        let mut chunk = text_chunk("Hello world!");
        chunk.usage = Some(Usage {
            prompt_tokens: 0,
            completion_tokens: 42,
            total_tokens: 0,
            ..Usage::default()
        });
        ctx.absorb_chunk(&mut chunk);
        let usage = ctx.finalize_usage();
        assert_eq!(usage.prompt_tokens, 9);
        assert_eq!(usage.completion_tokens, 42);
        assert_eq!(usage.total_tokens, 51);
    }

    #[test]
    fn tool_args_count_toward_fallback() {
        let mut ctx = StreamContext::new(options());
        let mut chunk = text_chunk("");
        chunk.choices[0].delta.tool_calls = Some(vec![ToolCallChunk {
            index: 0,
            id: Some("call_1".to_string()),
            r#type: None,
            function: Some(ToolCallChunkFunction {
                name: Some("lookup".to_string()),
                arguments: Some(ToolCallArguments::Text("{\"q\":\"rust\"}".to_string())),
            }),
        }]);
        ctx.absorb_chunk(&mut chunk);
        assert_eq!(ctx.tool_args_text(), "{\"q\":\"rust\"}");
        let usage = ctx.finalize_usage();
        assert_eq!(usage.completion_tokens, (12 / CHARS_PER_TOKEN) as i64);
    }

    #[test]
    fn empty_stream_is_an_error() {
        let ctx = StreamContext::new(options());
        let err = ctx.validate(0).unwrap_err();
        assert!(matches!(err, RelayError::EmptyStream { .. }));

        let mut ok = StreamContext::new(options());
        let mut chunk = text_chunk("");
        ok.absorb_chunk(&mut chunk);
        // One frame with empty content is valid empty output, not an error.
        assert!(ok.validate(10).is_ok());
    }

    #[test]
    fn buffer_capacity_is_bounded() {
        let mut ctx = StreamContext::new(options());
        let piece = "x".repeat(96 * 1024);
        for _ in 0..32 {
            let mut chunk = text_chunk(&piece);
            ctx.absorb_chunk(&mut chunk);
            let len = ctx.visible_text().len();
            // Slack capacity above the ceiling never survives a frame;
            // once the content itself outgrows the ceiling the buffer is
            // trimmed to the content every frame.
            assert!(ctx.visible.capacity() <= MAX_BUF_CAPACITY.max(len));
            if len > MAX_BUF_CAPACITY {
                assert_eq!(ctx.visible.capacity(), len);
            }
        }
        assert_eq!(ctx.visible_text().len(), 32 * 96 * 1024);
        assert!(ctx.visible_text().bytes().all(|b| b == b'x'));
    }
}
