//! Protocol bridges: consume the post-extraction frame sequence plus the
//! finalized usage and emit wire events for one target protocol. One
//! bridge instance per connection.

pub mod messages;
pub mod responses;
