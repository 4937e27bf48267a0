//! Stream translation state machines: frame reader, thinking-block
//! extractor, accumulation context, the two protocol bridges and the
//! non-streaming converter.
//!
//! Everything here is per-connection state, exclusively owned by one
//! processing loop. Nothing is safe for concurrent reuse.

pub mod bridge;
pub mod context;
pub mod handler;
pub mod nostream;
pub mod reader;
pub mod thinking;
