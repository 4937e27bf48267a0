use std::collections::BTreeMap;

use bytes::Bytes;

use lmrelay_protocol::claude::messages::{
    ContentBlock, ContentBlockDelta, Message, MessageDelta, MessageRole, MessageStreamEvent,
    MessageType, MessageUsage, StopReason, TextBlock, ThinkingBlock, ToolUseBlock,
};
use lmrelay_protocol::openai::chat::{
    ChatCompletionChunk, FinishReason, ToolCallChunk, Usage,
};
use lmrelay_protocol::sse::{encode_done, encode_sse_event};

use crate::context::StreamContext;
use crate::handler::RewriteHandler;

#[derive(Debug, Clone)]
struct ToolBlock {
    block_index: u32,
}

/// Re-encodes a chat-completions stream as Messages-style wire events.
///
/// Each logical item (the text block, the thinking block, one tool-use
/// block per distinct tool call) gets a block index assigned the first
/// time it is observed; indices are unique and strictly increasing for
/// the connection.
#[derive(Debug)]
pub struct MessagesBridge {
    id: String,
    model: String,
    message_started: bool,
    next_block_index: u32,
    text_block: Option<u32>,
    thinking_block: Option<u32>,
    thinking_closed: bool,
    tool_blocks: BTreeMap<i64, ToolBlock>,
    stop_reason: Option<StopReason>,
}

impl MessagesBridge {
    pub fn new() -> Self {
        Self {
            id: "unknown".to_string(),
            model: "unknown".to_string(),
            message_started: false,
            next_block_index: 0,
            text_block: None,
            thinking_block: None,
            thinking_closed: false,
            tool_blocks: BTreeMap::new(),
            stop_reason: None,
        }
    }

    pub fn transform_chunk(&mut self, chunk: &ChatCompletionChunk) -> Vec<MessageStreamEvent> {
        let mut events = Vec::new();
        events.extend(self.ensure_message_start(Some(chunk)));

        let Some(choice) = chunk.choices.first() else {
            return events;
        };

        if let Some(reasoning) = &choice.delta.reasoning_content
            && !reasoning.is_empty()
        {
            events.extend(self.emit_thinking(reasoning));
        }

        if let Some(content) = &choice.delta.content {
            let text = content.collect_text();
            if !text.is_empty() {
                events.extend(self.emit_text(&text));
            }
        }

        if let Some(tool_calls) = &choice.delta.tool_calls {
            for call in tool_calls {
                events.extend(self.emit_tool_call(call));
            }
        }

        if let Some(reason) = choice.finish_reason {
            self.stop_reason = Some(map_finish_reason(reason));
        }

        events
    }

    /// Close whatever is open and emit the usage-bearing closing events.
    pub fn finish(&mut self, usage: &Usage) -> Vec<MessageStreamEvent> {
        let mut events = self.ensure_message_start(None);
        events.extend(self.close_open_blocks());

        events.push(MessageStreamEvent::MessageDelta {
            delta: MessageDelta {
                stop_reason: Some(self.stop_reason.unwrap_or(StopReason::EndTurn)),
                stop_sequence: None,
            },
            usage: map_usage(usage),
        });
        events.push(MessageStreamEvent::MessageStop);
        events
    }

    fn ensure_message_start(
        &mut self,
        chunk: Option<&ChatCompletionChunk>,
    ) -> Vec<MessageStreamEvent> {
        if self.message_started {
            return Vec::new();
        }
        self.message_started = true;
        if let Some(chunk) = chunk {
            self.id = chunk.id.clone();
            self.model = chunk.model.clone();
        }
        vec![MessageStreamEvent::MessageStart {
            message: Message {
                id: self.id.clone(),
                r#type: MessageType::Message,
                role: MessageRole::Assistant,
                model: self.model.clone(),
                content: Vec::new(),
                stop_reason: None,
                stop_sequence: None,
                usage: MessageUsage::default(),
            },
        }]
    }

    fn emit_thinking(&mut self, reasoning: &str) -> Vec<MessageStreamEvent> {
        if self.thinking_closed {
            // A late reasoning fragment after visible text started; fold
            // it into the text block rather than reopening the thinking
            // block and breaking index monotonicity.
            return self.emit_text(reasoning);
        }

        let mut events = Vec::new();
        let index = match self.thinking_block {
            Some(index) => index,
            None => {
                let index = self.next_block_index;
                self.next_block_index += 1;
                self.thinking_block = Some(index);
                events.push(MessageStreamEvent::ContentBlockStart {
                    index,
                    content_block: ContentBlock::Thinking(ThinkingBlock::default()),
                });
                index
            }
        };
        events.push(MessageStreamEvent::ContentBlockDelta {
            index,
            delta: ContentBlockDelta::ThinkingDelta {
                thinking: reasoning.to_string(),
            },
        });
        events
    }

    /// The signature sub-field shares the thinking block; it closes with
    /// an empty signature delta before any other block starts.
    fn close_thinking_block(&mut self) -> Vec<MessageStreamEvent> {
        let Some(index) = self.thinking_block.take() else {
            return Vec::new();
        };
        self.thinking_closed = true;
        vec![
            MessageStreamEvent::ContentBlockDelta {
                index,
                delta: ContentBlockDelta::SignatureDelta {
                    signature: String::new(),
                },
            },
            MessageStreamEvent::ContentBlockStop { index },
        ]
    }

    fn emit_text(&mut self, text: &str) -> Vec<MessageStreamEvent> {
        let mut events = self.close_thinking_block();
        let index = match self.text_block {
            Some(index) => index,
            None => {
                let index = self.next_block_index;
                self.next_block_index += 1;
                self.text_block = Some(index);
                events.push(MessageStreamEvent::ContentBlockStart {
                    index,
                    content_block: ContentBlock::Text(TextBlock::default()),
                });
                index
            }
        };
        events.push(MessageStreamEvent::ContentBlockDelta {
            index,
            delta: ContentBlockDelta::TextDelta {
                text: text.to_string(),
            },
        });
        events
    }

    fn emit_tool_call(&mut self, call: &ToolCallChunk) -> Vec<MessageStreamEvent> {
        let mut events = self.close_thinking_block();
        let call_index = call.index;

        let block_index = match self.tool_blocks.get(&call_index) {
            Some(block) => block.block_index,
            None => {
                let block_index = self.next_block_index;
                self.next_block_index += 1;
                let id = call
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("toolcall-{call_index}"));
                let name = call
                    .function
                    .as_ref()
                    .and_then(|function| function.name.clone())
                    .unwrap_or_else(|| "tool".to_string());
                events.push(MessageStreamEvent::ContentBlockStart {
                    index: block_index,
                    content_block: ContentBlock::ToolUse(ToolUseBlock {
                        id,
                        name,
                        input: Default::default(),
                    }),
                });
                self.tool_blocks.insert(call_index, ToolBlock { block_index });
                block_index
            }
        };

        if let Some(arguments) = call
            .function
            .as_ref()
            .and_then(|function| function.arguments.as_ref())
        {
            let partial_json = arguments.as_fragment();
            if !partial_json.is_empty() {
                events.push(MessageStreamEvent::ContentBlockDelta {
                    index: block_index,
                    delta: ContentBlockDelta::InputJsonDelta { partial_json },
                });
            }
        }

        events
    }

    fn close_open_blocks(&mut self) -> Vec<MessageStreamEvent> {
        let mut events = self.close_thinking_block();
        if let Some(index) = self.text_block.take() {
            events.push(MessageStreamEvent::ContentBlockStop { index });
        }
        for (_, block) in std::mem::take(&mut self.tool_blocks) {
            events.push(MessageStreamEvent::ContentBlockStop {
                index: block.block_index,
            });
        }
        events
    }
}

impl Default for MessagesBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl RewriteHandler for MessagesBridge {
    fn handle_chunk(
        &mut self,
        _ctx: &mut StreamContext,
        chunk: &ChatCompletionChunk,
        raw: &str,
        _modified: bool,
    ) -> Vec<Bytes> {
        encode_events(&self.transform_chunk(chunk), Some(raw))
    }

    fn handle_upstream_done(&mut self, _ctx: &mut StreamContext) -> Vec<Bytes> {
        Vec::new()
    }

    fn handle_done(&mut self, _ctx: &mut StreamContext, usage: &Usage) -> Vec<Bytes> {
        let mut out = encode_events(&self.finish(usage), None);
        out.push(encode_done());
        out
    }
}

fn encode_events(events: &[MessageStreamEvent], raw: Option<&str>) -> Vec<Bytes> {
    let mut out = Vec::new();
    for event in events {
        match serde_json::to_string(event) {
            Ok(json) => out.push(encode_sse_event(Some(event.event_name()), &json)),
            Err(err) => {
                tracing::warn!(error = %err, "dropping unencodable bridge event");
                if let Some(raw) = raw {
                    out.push(encode_sse_event(None, raw));
                    return out;
                }
            }
        }
    }
    out
}

pub(crate) fn map_finish_reason(reason: FinishReason) -> StopReason {
    match reason {
        FinishReason::Stop => StopReason::EndTurn,
        FinishReason::Length => StopReason::MaxTokens,
        FinishReason::ToolCalls | FinishReason::FunctionCall => StopReason::ToolUse,
        FinishReason::ContentFilter => StopReason::Refusal,
    }
}

pub(crate) fn map_usage(usage: &Usage) -> MessageUsage {
    MessageUsage {
        input_tokens: Some(usage.prompt_tokens),
        output_tokens: Some(usage.completion_tokens),
        cache_creation_input_tokens: None,
        cache_read_input_tokens: usage
            .prompt_tokens_details
            .as_ref()
            .and_then(|details| details.cached_tokens),
    }
}
