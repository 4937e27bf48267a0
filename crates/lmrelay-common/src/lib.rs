use serde::{Deserialize, Serialize};

/// Structured error body decoded from a non-streaming upstream response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpstreamErrorDetail {
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<serde_json::Value>,
}

/// Errors surfaced by the stream relay core.
///
/// Every variant carries the model name and the byte count read so far so
/// callers can log and bill without the payload itself.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("upstream transport failure for {model}: {message} ({bytes_in} bytes read)")]
    Transport {
        model: String,
        message: String,
        bytes_in: u64,
    },
    /// Stream ended with zero parsed frames and zero accumulated content.
    /// Distinct from a stream that validly produced empty content.
    #[error("upstream produced no data for {model} ({bytes_in} bytes read)")]
    EmptyStream { model: String, bytes_in: u64 },
    /// An error document arrived where a stream was expected.
    #[error("upstream returned status {status} for {model}: {}", detail.message)]
    Upstream {
        model: String,
        status: u16,
        detail: UpstreamErrorDetail,
    },
    #[error("failed to encode {what}: {message}")]
    Encode {
        what: &'static str,
        message: String,
    },
}

/// Per-connection configuration consumed by the relay core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamOptions {
    /// Model name, used for usage records and error context.
    pub model: String,
    /// Whether the thinking-block extractor rewrites text deltas.
    pub thinking_enabled: bool,
    /// Caller-supplied prompt token estimate, used when upstream omits
    /// usage or reports a zero prompt count.
    pub prompt_tokens_estimate: i64,
}

impl StreamOptions {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            thinking_enabled: false,
            prompt_tokens_estimate: 0,
        }
    }

    pub fn with_thinking(mut self, enabled: bool) -> Self {
        self.thinking_enabled = enabled;
        self
    }

    pub fn with_prompt_tokens_estimate(mut self, tokens: i64) -> Self {
        self.prompt_tokens_estimate = tokens;
        self
    }
}
