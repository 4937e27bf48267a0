use std::collections::BTreeMap;

use bytes::Bytes;
use serde_json::Value as JsonValue;

use lmrelay_protocol::openai::chat::{ChatCompletionChunk, FinishReason, ToolCallChunk, Usage};
use lmrelay_protocol::openai::responses::{
    ContentPartEvent, FunctionCallArgumentsDeltaEvent, FunctionCallArgumentsDoneEvent,
    FunctionCallItem, IncompleteDetails, IncompleteReason, ItemStatus, OutputContent, OutputItem,
    OutputItemEvent, OutputMessage, ReasoningItem, ReasoningSummaryPartEvent,
    ReasoningSummaryTextDeltaEvent, ReasoningSummaryTextDoneEvent,
    Response, ResponseEvent, ResponseObjectType, ResponseStatus, ResponseStreamEvent,
    ResponseUsage, SummaryPart, SummaryPartType, TextDeltaEvent, TextDoneEvent,
};
use lmrelay_protocol::sse::{encode_done, encode_sse_event};

use crate::context::StreamContext;
use crate::handler::RewriteHandler;

/// Request fields echoed back in the `response.created` and terminal
/// envelopes. Populated from the original request before the stream
/// starts; everything stays untyped pass-through.
#[derive(Debug, Clone, Default)]
pub struct ResponseSeed {
    pub instructions: Option<JsonValue>,
    pub metadata: Option<JsonValue>,
    pub tools: Option<JsonValue>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub parallel_tool_calls: Option<bool>,
}

#[derive(Debug)]
struct MessageState {
    output_index: i64,
    item_id: String,
    text: String,
}

#[derive(Debug)]
struct ReasoningState {
    output_index: i64,
    item_id: String,
    text: String,
}

#[derive(Debug)]
struct ToolCallState {
    output_index: i64,
    item_id: String,
    call_id: String,
    name: String,
    arguments: String,
}

/// Re-encodes a chat-completions stream as Response-style wire events.
///
/// Every emitted event carries the connection's strictly increasing
/// `sequence_number`. Output indices are assigned in observation order
/// across the reasoning item, the message item and each tool call.
#[derive(Debug)]
pub struct ResponsesBridge {
    seed: ResponseSeed,
    id: String,
    model: String,
    created_at: i64,
    started: bool,
    sequence: i64,
    next_output_index: i64,
    message: Option<MessageState>,
    reasoning: Option<ReasoningState>,
    tool_calls: BTreeMap<i64, ToolCallState>,
    finish_reason: Option<FinishReason>,
}

impl ResponsesBridge {
    pub fn new(seed: ResponseSeed) -> Self {
        Self {
            seed,
            id: "unknown".to_string(),
            model: "unknown".to_string(),
            created_at: time::OffsetDateTime::now_utc().unix_timestamp(),
            started: false,
            sequence: 0,
            next_output_index: 0,
            message: None,
            reasoning: None,
            tool_calls: BTreeMap::new(),
            finish_reason: None,
        }
    }

    fn next_sequence(&mut self) -> i64 {
        let sequence = self.sequence;
        self.sequence += 1;
        sequence
    }

    pub fn transform_chunk(&mut self, chunk: &ChatCompletionChunk) -> Vec<ResponseStreamEvent> {
        let mut events = Vec::new();
        events.extend(self.ensure_created(Some(chunk)));

        let Some(choice) = chunk.choices.first() else {
            return events;
        };

        if let Some(reasoning) = &choice.delta.reasoning_content
            && !reasoning.is_empty()
        {
            events.extend(self.emit_reasoning(reasoning));
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
            self.finish_reason = Some(reason);
        }

        events
    }

    /// Close every open item in output order, then emit the terminal
    /// envelope event with the materialized output and final usage.
    pub fn finish(&mut self, usage: &Usage) -> Vec<ResponseStreamEvent> {
        let mut events = self.ensure_created(None);

        let mut output: Vec<(i64, OutputItem)> = Vec::new();

        if let Some(reasoning) = self.reasoning.take() {
            let summary = vec![SummaryPart {
                r#type: SummaryPartType::SummaryText,
                text: reasoning.text.clone(),
            }];
            let sequence_number = self.next_sequence();
            events.push(ResponseStreamEvent::ReasoningSummaryTextDone(
                ReasoningSummaryTextDoneEvent {
                    item_id: reasoning.item_id.clone(),
                    output_index: reasoning.output_index,
                    summary_index: 0,
                    text: reasoning.text.clone(),
                    sequence_number,
                },
            ));
            let sequence_number = self.next_sequence();
            events.push(ResponseStreamEvent::ReasoningSummaryPartDone(
                ReasoningSummaryPartEvent {
                    item_id: reasoning.item_id.clone(),
                    output_index: reasoning.output_index,
                    summary_index: 0,
                    part: summary[0].clone(),
                    sequence_number,
                },
            ));
            output.push((
                reasoning.output_index,
                OutputItem::Reasoning(ReasoningItem {
                    id: reasoning.item_id,
                    summary,
                    status: Some(ItemStatus::Completed),
                }),
            ));
        }

        if let Some(message) = self.message.take() {
            let part = OutputContent::OutputText {
                text: message.text.clone(),
                annotations: Vec::new(),
            };
            let sequence_number = self.next_sequence();
            events.push(ResponseStreamEvent::OutputTextDone(TextDoneEvent {
                item_id: message.item_id.clone(),
                output_index: message.output_index,
                content_index: 0,
                text: message.text.clone(),
                sequence_number,
            }));
            let sequence_number = self.next_sequence();
            events.push(ResponseStreamEvent::ContentPartDone(ContentPartEvent {
                item_id: message.item_id.clone(),
                output_index: message.output_index,
                content_index: 0,
                part: part.clone(),
                sequence_number,
            }));
            output.push((
                message.output_index,
                OutputItem::Message(OutputMessage {
                    id: message.item_id,
                    role: "assistant".to_string(),
                    status: ItemStatus::Completed,
                    content: vec![part],
                }),
            ));
        }

        for (_, call) in std::mem::take(&mut self.tool_calls) {
            let sequence_number = self.next_sequence();
            events.push(ResponseStreamEvent::FunctionCallArgumentsDone(
                FunctionCallArgumentsDoneEvent {
                    item_id: call.item_id.clone(),
                    output_index: call.output_index,
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                    sequence_number,
                },
            ));
            output.push((
                call.output_index,
                OutputItem::FunctionCall(FunctionCallItem {
                    id: Some(call.item_id),
                    call_id: call.call_id,
                    name: call.name,
                    arguments: call.arguments,
                    status: Some(ItemStatus::Completed),
                }),
            ));
        }

        // Done events for whole items follow output order regardless of
        // which item finished streaming last.
        output.sort_by_key(|(index, _)| *index);
        for (output_index, item) in &output {
            let sequence_number = self.next_sequence();
            events.push(ResponseStreamEvent::OutputItemDone(OutputItemEvent {
                output_index: *output_index,
                item: item.clone(),
                sequence_number,
            }));
        }

        let (status, incomplete_details) = match self.finish_reason {
            Some(FinishReason::Length) => (
                ResponseStatus::Incomplete,
                Some(IncompleteDetails {
                    reason: IncompleteReason::MaxOutputTokens,
                }),
            ),
            Some(FinishReason::ContentFilter) => (
                ResponseStatus::Incomplete,
                Some(IncompleteDetails {
                    reason: IncompleteReason::ContentFilter,
                }),
            ),
            _ => (ResponseStatus::Completed, None),
        };

        let response = self.envelope(
            status,
            incomplete_details,
            output.into_iter().map(|(_, item)| item).collect(),
            Some(usage.into()),
        );
        let sequence_number = self.next_sequence();
        let event = ResponseEvent {
            response,
            sequence_number,
        };
        events.push(match status {
            ResponseStatus::Incomplete => ResponseStreamEvent::Incomplete(event),
            _ => ResponseStreamEvent::Completed(event),
        });
        events
    }

    fn ensure_created(&mut self, chunk: Option<&ChatCompletionChunk>) -> Vec<ResponseStreamEvent> {
        if self.started {
            return Vec::new();
        }
        self.started = true;
        if let Some(chunk) = chunk {
            self.id = chunk.id.clone();
            self.model = chunk.model.clone();
            if chunk.created > 0 {
                self.created_at = chunk.created;
            }
        }
        let response = self.envelope(ResponseStatus::InProgress, None, Vec::new(), None);
        let sequence_number = self.next_sequence();
        vec![ResponseStreamEvent::Created(ResponseEvent {
            response,
            sequence_number,
        })]
    }

    fn envelope(
        &self,
        status: ResponseStatus,
        incomplete_details: Option<IncompleteDetails>,
        output: Vec<OutputItem>,
        usage: Option<ResponseUsage>,
    ) -> Response {
        Response {
            id: self.id.clone(),
            object: ResponseObjectType::Response,
            created_at: self.created_at,
            status: Some(status),
            incomplete_details,
            instructions: self.seed.instructions.clone(),
            metadata: self.seed.metadata.clone(),
            model: self.model.clone(),
            output,
            output_text: None,
            parallel_tool_calls: self.seed.parallel_tool_calls,
            temperature: self.seed.temperature,
            tools: self.seed.tools.clone(),
            top_p: self.seed.top_p,
            usage,
        }
    }

    fn emit_reasoning(&mut self, reasoning: &str) -> Vec<ResponseStreamEvent> {
        let mut events = Vec::new();
        if self.reasoning.is_none() {
            let output_index = self.next_output_index;
            self.next_output_index += 1;
            let item_id = format!("rs_{output_index}");
            let sequence_number = self.next_sequence();
            events.push(ResponseStreamEvent::OutputItemAdded(OutputItemEvent {
                output_index,
                item: OutputItem::Reasoning(ReasoningItem {
                    id: item_id.clone(),
                    summary: Vec::new(),
                    status: Some(ItemStatus::InProgress),
                }),
                sequence_number,
            }));
            let sequence_number = self.next_sequence();
            events.push(ResponseStreamEvent::ReasoningSummaryPartAdded(
                ReasoningSummaryPartEvent {
                    item_id: item_id.clone(),
                    output_index,
                    summary_index: 0,
                    part: SummaryPart {
                        r#type: SummaryPartType::SummaryText,
                        text: String::new(),
                    },
                    sequence_number,
                },
            ));
            self.reasoning = Some(ReasoningState {
                output_index,
                item_id,
                text: String::new(),
            });
        }

        if let Some(state) = self.reasoning.as_mut() {
            state.text.push_str(reasoning);
            let item_id = state.item_id.clone();
            let output_index = state.output_index;
            let sequence_number = self.next_sequence();
            events.push(ResponseStreamEvent::ReasoningSummaryTextDelta(
                ReasoningSummaryTextDeltaEvent {
                    item_id,
                    output_index,
                    summary_index: 0,
                    delta: reasoning.to_string(),
                    sequence_number,
                },
            ));
        }
        events
    }

    fn emit_text(&mut self, text: &str) -> Vec<ResponseStreamEvent> {
        let mut events = Vec::new();
        if self.message.is_none() {
            let output_index = self.next_output_index;
            self.next_output_index += 1;
            let item_id = format!("msg_{output_index}");
            let sequence_number = self.next_sequence();
            events.push(ResponseStreamEvent::OutputItemAdded(OutputItemEvent {
                output_index,
                item: OutputItem::Message(OutputMessage {
                    id: item_id.clone(),
                    role: "assistant".to_string(),
                    status: ItemStatus::InProgress,
                    content: Vec::new(),
                }),
                sequence_number,
            }));
            let sequence_number = self.next_sequence();
            events.push(ResponseStreamEvent::ContentPartAdded(ContentPartEvent {
                item_id: item_id.clone(),
                output_index,
                content_index: 0,
                part: OutputContent::OutputText {
                    text: String::new(),
                    annotations: Vec::new(),
                },
                sequence_number,
            }));
            self.message = Some(MessageState {
                output_index,
                item_id,
                text: String::new(),
            });
        }

        if let Some(state) = self.message.as_mut() {
            state.text.push_str(text);
            let item_id = state.item_id.clone();
            let output_index = state.output_index;
            let sequence_number = self.next_sequence();
            events.push(ResponseStreamEvent::OutputTextDelta(TextDeltaEvent {
                item_id,
                output_index,
                content_index: 0,
                delta: text.to_string(),
                sequence_number,
            }));
        }
        events
    }

    fn emit_tool_call(&mut self, call: &ToolCallChunk) -> Vec<ResponseStreamEvent> {
        let mut events = Vec::new();
        let call_index = call.index;

        if !self.tool_calls.contains_key(&call_index) {
            let output_index = self.next_output_index;
            self.next_output_index += 1;
            let item_id = format!("fc_{output_index}");
            let call_id = call
                .id
                .clone()
                .unwrap_or_else(|| format!("toolcall-{call_index}"));
            let name = call
                .function
                .as_ref()
                .and_then(|function| function.name.clone())
                .unwrap_or_else(|| "tool".to_string());
            let sequence_number = self.next_sequence();
            events.push(ResponseStreamEvent::OutputItemAdded(OutputItemEvent {
                output_index,
                item: OutputItem::FunctionCall(FunctionCallItem {
                    id: Some(item_id.clone()),
                    call_id: call_id.clone(),
                    name: name.clone(),
                    arguments: String::new(),
                    status: Some(ItemStatus::InProgress),
                }),
                sequence_number,
            }));
            self.tool_calls.insert(
                call_index,
                ToolCallState {
                    output_index,
                    item_id,
                    call_id,
                    name,
                    arguments: String::new(),
                },
            );
        }

        if let Some(arguments) = call
            .function
            .as_ref()
            .and_then(|function| function.arguments.as_ref())
        {
            let fragment = arguments.as_fragment();
            if !fragment.is_empty()
                && let Some(state) = self.tool_calls.get_mut(&call_index)
            {
                state.arguments.push_str(&fragment);
                let item_id = state.item_id.clone();
                let output_index = state.output_index;
                let sequence_number = self.next_sequence();
                events.push(ResponseStreamEvent::FunctionCallArgumentsDelta(
                    FunctionCallArgumentsDeltaEvent {
                        item_id,
                        output_index,
                        delta: fragment,
                        sequence_number,
                    },
                ));
            }
        }

        events
    }
}

impl RewriteHandler for ResponsesBridge {
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

fn encode_events(events: &[ResponseStreamEvent], raw: Option<&str>) -> Vec<Bytes> {
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
