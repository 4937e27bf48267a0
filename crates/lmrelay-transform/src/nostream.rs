//! Non-streaming body conversion. Complete upstream response bodies are
//! probed by shape and mapped in one pass to the Messages-style object;
//! anything unrecognized returns `None` so the caller forwards the body
//! untouched.

use lmrelay_protocol::claude::messages::{
    ContentBlock, JsonObject, Message, MessageRole, MessageType, MessageUsage, StopReason,
    TextBlock, ThinkingBlock, ToolUseBlock,
};
use lmrelay_protocol::openai::chat::ChatCompletionResponse;
use lmrelay_protocol::openai::responses::{
    IncompleteReason, OutputContent, OutputItem, Response, ResponseStatus,
};

use crate::bridge::messages::{map_finish_reason, map_usage};
use crate::thinking::ThinkingState;

/// Probe the body and convert it when the shape is recognized.
pub fn convert_to_message(body: &[u8]) -> Option<Message> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    if value.get("object").and_then(|v| v.as_str()) == Some("response") {
        let response: Response = serde_json::from_value(value).ok()?;
        return Some(from_response(response));
    }
    if value.get("choices").is_some_and(|v| v.is_array()) {
        let response: ChatCompletionResponse = serde_json::from_value(value).ok()?;
        return Some(from_chat(response));
    }
    None
}

fn from_response(response: Response) -> Message {
    let mut content = Vec::new();
    let mut saw_tool_use = false;

    for item in response.output {
        match item {
            OutputItem::Reasoning(item) => {
                let thinking: String = item
                    .summary
                    .into_iter()
                    .map(|part| part.text)
                    .collect();
                if !thinking.is_empty() {
                    content.push(ContentBlock::Thinking(ThinkingBlock {
                        thinking,
                        signature: None,
                    }));
                }
            }
            OutputItem::Message(message) => {
                for part in message.content {
                    let OutputContent::OutputText { text, .. } = part;
                    content.push(ContentBlock::Text(TextBlock { text }));
                }
            }
            OutputItem::FunctionCall(call) => {
                saw_tool_use = true;
                content.push(ContentBlock::ToolUse(ToolUseBlock {
                    id: call.call_id,
                    name: call.name,
                    input: parse_arguments(&call.arguments),
                }));
            }
        }
    }

    let stop_reason = match (response.status, response.incomplete_details) {
        (Some(ResponseStatus::Incomplete), Some(details)) => match details.reason {
            IncompleteReason::MaxOutputTokens => StopReason::MaxTokens,
            IncompleteReason::ContentFilter => StopReason::Refusal,
        },
        _ if saw_tool_use => StopReason::ToolUse,
        _ => StopReason::EndTurn,
    };

    let usage = response
        .usage
        .map(|usage| MessageUsage {
            input_tokens: Some(usage.input_tokens),
            output_tokens: Some(usage.output_tokens),
            cache_creation_input_tokens: None,
            cache_read_input_tokens: Some(usage.input_tokens_details.cached_tokens),
        })
        .unwrap_or_default();

    Message {
        id: response.id,
        r#type: MessageType::Message,
        role: MessageRole::Assistant,
        model: response.model,
        content,
        stop_reason: Some(stop_reason),
        stop_sequence: None,
        usage,
    }
}

fn from_chat(response: ChatCompletionResponse) -> Message {
    let mut content = Vec::new();
    let mut stop_reason = StopReason::EndTurn;

    if let Some(choice) = response.choices.into_iter().next() {
        if let Some(reasoning) = choice.message.reasoning_content
            && !reasoning.is_empty()
        {
            content.push(ContentBlock::Thinking(ThinkingBlock {
                thinking: reasoning,
                signature: None,
            }));
        }

        if let Some(body) = choice.message.content {
            let text = body.collect_text();
            if !text.is_empty() {
                // A complete body can still carry an inline thinking
                // preamble; split it the same way the stream path does.
                let mut state = ThinkingState::new();
                match state.extract(&text) {
                    Some(extraction) => {
                        if let Some(reasoning) = extraction.reasoning
                            && !reasoning.is_empty()
                        {
                            content.push(ContentBlock::Thinking(ThinkingBlock {
                                thinking: reasoning,
                                signature: None,
                            }));
                        }
                        if !extraction.visible.is_empty() {
                            content.push(ContentBlock::Text(TextBlock {
                                text: extraction.visible,
                            }));
                        }
                    }
                    None => content.push(ContentBlock::Text(TextBlock { text })),
                }
            }
        }

        if let Some(tool_calls) = choice.message.tool_calls {
            for call in tool_calls {
                let input = parse_arguments(&call.function.arguments.as_fragment());
                content.push(ContentBlock::ToolUse(ToolUseBlock {
                    id: call.id,
                    name: call.function.name,
                    input,
                }));
            }
        }

        if let Some(reason) = choice.finish_reason {
            stop_reason = map_finish_reason(reason);
        }
    }

    let usage = response
        .usage
        .as_ref()
        .map(map_usage)
        .unwrap_or_default();

    Message {
        id: response.id,
        r#type: MessageType::Message,
        role: MessageRole::Assistant,
        model: response.model,
        content,
        stop_reason: Some(stop_reason),
        stop_sequence: None,
        usage,
    }
}

/// Accumulated argument text is expected to be a JSON object; anything
/// else degrades to an empty input rather than failing the conversion.
fn parse_arguments(arguments: &str) -> JsonObject {
    serde_json::from_str::<JsonObject>(arguments).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_body_converts_with_tool_call() {
        let body = br#"{
            "id": "chatcmpl-9",
            "created": 1,
            "model": "test-model",
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "Looking that up.",
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "lookup", "arguments": "{\"q\": \"rust\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 11, "completion_tokens": 7, "total_tokens": 18}
        }"#;
        let message = convert_to_message(body).unwrap();
        assert_eq!(message.id, "chatcmpl-9");
        assert_eq!(message.stop_reason, Some(StopReason::ToolUse));
        assert_eq!(message.usage.input_tokens, Some(11));
        assert_eq!(message.content.len(), 2);
        match &message.content[1] {
            ContentBlock::ToolUse(block) => {
                assert_eq!(block.id, "call_1");
                assert_eq!(block.name, "lookup");
                assert_eq!(
                    serde_json::to_value(&block.input).unwrap(),
                    serde_json::json!({"q": "rust"})
                );
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[test]
    fn chat_body_splits_inline_thinking() {
        let body = br#"{
            "id": "chatcmpl-10",
            "created": 1,
            "model": "m",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "<think>plan</think>done"},
                "finish_reason": "stop"
            }]
        }"#;
        let message = convert_to_message(body).unwrap();
        assert_eq!(message.content.len(), 2);
        assert!(matches!(
            &message.content[0],
            ContentBlock::Thinking(block) if block.thinking == "plan"
        ));
        assert!(matches!(
            &message.content[1],
            ContentBlock::Text(block) if block.text == "done"
        ));
    }

    #[test]
    fn response_envelope_converts() {
        let body = br#"{
            "id": "resp_1",
            "object": "response",
            "created_at": 1,
            "status": "completed",
            "model": "m",
            "output": [
                {"type": "reasoning", "id": "rs_0", "summary": [{"type": "summary_text", "text": "why"}]},
                {"type": "message", "id": "msg_1", "role": "assistant", "status": "completed",
                 "content": [{"type": "output_text", "text": "hello", "annotations": []}]}
            ],
            "usage": {"input_tokens": 3, "output_tokens": 4, "total_tokens": 7}
        }"#;
        let message = convert_to_message(body).unwrap();
        assert_eq!(message.content.len(), 2);
        assert!(matches!(
            &message.content[0],
            ContentBlock::Thinking(block) if block.thinking == "why"
        ));
        assert_eq!(message.stop_reason, Some(StopReason::EndTurn));
        assert_eq!(message.usage.output_tokens, Some(4));
    }

    #[test]
    fn incomplete_status_maps_to_max_tokens() {
        let body = br#"{
            "id": "resp_2",
            "object": "response",
            "created_at": 1,
            "status": "incomplete",
            "incomplete_details": {"reason": "max_output_tokens"},
            "model": "m",
            "output": []
        }"#;
        let message = convert_to_message(body).unwrap();
        assert_eq!(message.stop_reason, Some(StopReason::MaxTokens));
    }

    #[test]
    fn unknown_shapes_pass_through() {
        assert!(convert_to_message(br#"{"status": "ok"}"#).is_none());
        assert!(convert_to_message(b"not json at all").is_none());
    }
}
