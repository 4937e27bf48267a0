//! Wire types for the protocols the relay translates between, plus SSE
//! framing. This crate is pure data: no IO, no logging.

pub mod claude;
pub mod openai;
pub mod sse;
