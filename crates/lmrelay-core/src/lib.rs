//! Per-connection relay core: owns the upstream body, drives the frame
//! reader, accumulation context and rewrite handler, and writes encoded
//! events downstream.

pub mod relay;

pub use relay::{
    convert_nostream_body, relay_stream, RelayFailure, StreamOutcome, UpstreamBody,
    UpstreamResponse,
};
