use bytes::Bytes;

use lmrelay_protocol::openai::chat::{ChatCompletionChunk, Usage};
use lmrelay_protocol::sse::{encode_done, encode_sse_event};

use crate::context::StreamContext;

/// Per-connection hook deciding what bytes each normalized frame turns
/// into. The relay loop owns the context and calls these in order:
/// `handle_chunk` per frame, `handle_upstream_done` when the upstream
/// sentinel arrives, then `finalize_usage` and `handle_done` once input
/// is exhausted.
///
/// The two protocol bridges implement this; callers can substitute their
/// own to intercept the stream entirely.
pub trait RewriteHandler: Send {
    /// `modified` is set when the context rewrote the frame in place
    /// (thinking extraction), in which case `raw` no longer matches it.
    fn handle_chunk(
        &mut self,
        ctx: &mut StreamContext,
        chunk: &ChatCompletionChunk,
        raw: &str,
        modified: bool,
    ) -> Vec<Bytes>;

    fn handle_upstream_done(&mut self, ctx: &mut StreamContext) -> Vec<Bytes>;

    /// Emit terminal events. `usage` is the finalized record.
    fn handle_done(&mut self, ctx: &mut StreamContext, usage: &Usage) -> Vec<Bytes>;

    fn finalize_usage(&mut self, ctx: &mut StreamContext) -> Usage {
        ctx.finalize_usage()
    }
}

/// Default handler for clients speaking the upstream's own protocol:
/// frames are forwarded as-is, re-encoding only when the extractor
/// touched them.
#[derive(Debug, Default)]
pub struct PassthroughHandler;

impl PassthroughHandler {
    pub fn new() -> Self {
        Self
    }
}

impl RewriteHandler for PassthroughHandler {
    fn handle_chunk(
        &mut self,
        _ctx: &mut StreamContext,
        chunk: &ChatCompletionChunk,
        raw: &str,
        modified: bool,
    ) -> Vec<Bytes> {
        if !modified {
            return vec![encode_sse_event(None, raw)];
        }
        match serde_json::to_string(chunk) {
            Ok(json) => vec![encode_sse_event(None, &json)],
            Err(err) => {
                // Never drop content over a re-encode failure; the
                // original line is still valid for the client.
                tracing::warn!(error = %err, "re-encode failed, forwarding original frame");
                vec![encode_sse_event(None, raw)]
            }
        }
    }

    fn handle_upstream_done(&mut self, _ctx: &mut StreamContext) -> Vec<Bytes> {
        Vec::new()
    }

    /// Clients on this protocol expect the terminal sentinel.
    fn handle_done(&mut self, _ctx: &mut StreamContext, _usage: &Usage) -> Vec<Bytes> {
        vec![encode_done()]
    }
}
