//! Data structures for the canonical and backend wire formats.
//!
//! - `chat`: the gateway's uniform Chat Completions shapes.
//! - `coze`: the representative backend's native request/response schema.

pub mod chat;
pub mod coze;
