use bytes::Bytes;
use tokio::sync::mpsc;

use lmrelay_common::{RelayError, StreamOptions, UpstreamErrorDetail};
use lmrelay_protocol::openai::chat::Usage;
use lmrelay_transform::context::StreamContext;
use lmrelay_transform::handler::RewriteHandler;
use lmrelay_transform::nostream;
use lmrelay_transform::reader::{decode_upstream_error, is_event_stream, FrameEvent, FrameReader};

/// Upstream response body, either fully buffered or arriving in chunks.
/// A chunk-level `Err` is a transport failure and aborts the relay.
#[derive(Debug)]
pub enum UpstreamBody {
    Full(Bytes),
    Stream(mpsc::Receiver<Result<Bytes, String>>),
}

/// The slice of an upstream HTTP response the relay needs.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub content_type: String,
    pub body: UpstreamBody,
}

/// Accounting record for one relayed connection.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamOutcome {
    pub usage: Usage,
    pub frames: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Failure carrier for one relayed connection. `outcome` holds the
/// partial accounting record when frames had already been accumulated
/// before the failure, so billing still sees what was delivered.
#[derive(Debug)]
pub struct RelayFailure {
    pub error: RelayError,
    pub outcome: Option<StreamOutcome>,
}

impl From<RelayError> for RelayFailure {
    fn from(error: RelayError) -> Self {
        Self {
            error,
            outcome: None,
        }
    }
}

impl std::fmt::Display for RelayFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error.fmt(f)
    }
}

impl std::error::Error for RelayFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Drive one upstream stream to completion.
///
/// Frames are decoded, folded into the context and handed to the rewrite
/// handler; whatever the handler emits is written to `downstream`. A
/// failed downstream send stops writing but not processing, so the
/// returned usage is finalized either way. A transport failure mid-stream
/// is fatal but still carries the partial outcome.
pub async fn relay_stream(
    response: UpstreamResponse,
    options: StreamOptions,
    handler: &mut dyn RewriteHandler,
    downstream: mpsc::Sender<Bytes>,
) -> Result<StreamOutcome, RelayFailure> {
    let model = options.model.clone();

    if response.status >= 400 || !is_event_stream(&response.content_type) {
        let body = read_full_body(response.body, &model).await?;
        let detail = decode_upstream_error(&body).unwrap_or_else(|| UpstreamErrorDetail {
            message: String::from_utf8_lossy(&body).into_owned(),
            ..UpstreamErrorDetail::default()
        });
        return Err(RelayError::Upstream {
            model,
            status: response.status,
            detail,
        }
        .into());
    }

    let mut ctx = StreamContext::new(options);
    let mut reader = FrameReader::new();
    let mut writer = DownstreamWriter::new(downstream);
    let mut bytes_in: u64 = 0;

    match response.body {
        UpstreamBody::Full(body) => {
            bytes_in = body.len() as u64;
            let mut events = reader.push_bytes(&body);
            events.extend(reader.finish());
            process_events(events, &mut ctx, handler, &mut writer).await;
        }
        UpstreamBody::Stream(mut body) => {
            while let Some(chunk) = body.recv().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(message) => {
                        // Fatal, but whatever was accumulated is still
                        // finalized so billing sees the partial stream.
                        let usage = handler.finalize_usage(&mut ctx);
                        return Err(RelayFailure {
                            error: RelayError::Transport {
                                model,
                                message,
                                bytes_in,
                            },
                            outcome: Some(StreamOutcome {
                                usage,
                                frames: ctx.frames(),
                                bytes_in,
                                bytes_out: writer.bytes_out,
                            }),
                        });
                    }
                };
                bytes_in += chunk.len() as u64;
                let events = reader.push_bytes(&chunk);
                process_events(events, &mut ctx, handler, &mut writer).await;
                if ctx.is_done() {
                    break;
                }
            }
            if !ctx.is_done() {
                let events = reader.finish();
                process_events(events, &mut ctx, handler, &mut writer).await;
            }
        }
    }

    ctx.validate(bytes_in)?;

    let usage = handler.finalize_usage(&mut ctx);
    let closing = handler.handle_done(&mut ctx, &usage);
    writer.write_all(closing).await;

    if !writer.ok {
        tracing::warn!(
            model = %ctx.options().model,
            frames = ctx.frames(),
            "downstream write failed mid-stream, usage finalized anyway"
        );
    }

    Ok(StreamOutcome {
        usage,
        frames: ctx.frames(),
        bytes_in,
        bytes_out: writer.bytes_out,
    })
}

/// Convert a complete non-streaming body to the Messages-style object.
/// Returns the replacement body; `None` means the shape was not
/// recognized and the original body should be forwarded untouched. The
/// caller re-derives `content-type: application/json` and the content
/// length from the replacement.
pub fn convert_nostream_body(body: &[u8]) -> Option<Bytes> {
    let message = nostream::convert_to_message(body)?;
    match serde_json::to_vec(&message) {
        Ok(encoded) => Some(Bytes::from(encoded)),
        Err(err) => {
            tracing::warn!(error = %err, "re-encode of converted body failed, passing through");
            None
        }
    }
}

struct DownstreamWriter {
    tx: mpsc::Sender<Bytes>,
    ok: bool,
    bytes_out: u64,
}

impl DownstreamWriter {
    fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            tx,
            ok: true,
            bytes_out: 0,
        }
    }

    async fn write_all(&mut self, frames: Vec<Bytes>) {
        for frame in frames {
            if !self.ok {
                return;
            }
            let len = frame.len() as u64;
            if self.tx.send(frame).await.is_err() {
                self.ok = false;
                return;
            }
            self.bytes_out += len;
        }
    }
}

async fn process_events(
    events: Vec<FrameEvent>,
    ctx: &mut StreamContext,
    handler: &mut dyn RewriteHandler,
    writer: &mut DownstreamWriter,
) {
    for event in events {
        match event {
            FrameEvent::Frame { mut chunk, raw } => {
                let modified = ctx.absorb_chunk(&mut chunk);
                let out = handler.handle_chunk(ctx, &chunk, &raw, modified);
                writer.write_all(out).await;
            }
            FrameEvent::Done => {
                ctx.mark_done();
                let out = handler.handle_upstream_done(ctx);
                writer.write_all(out).await;
                // Anything after the sentinel is not ours to decode.
                return;
            }
        }
    }
}

async fn read_full_body(body: UpstreamBody, model: &str) -> Result<Vec<u8>, RelayError> {
    match body {
        UpstreamBody::Full(bytes) => Ok(bytes.to_vec()),
        UpstreamBody::Stream(mut rx) => {
            let mut out = Vec::new();
            while let Some(chunk) = rx.recv().await {
                match chunk {
                    Ok(chunk) => out.extend_from_slice(&chunk),
                    Err(message) => {
                        return Err(RelayError::Transport {
                            model: model.to_string(),
                            message,
                            bytes_in: out.len() as u64,
                        });
                    }
                }
            }
            Ok(out)
        }
    }
}
