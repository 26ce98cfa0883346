//! Dust.tt agent API client for dustlink.
//!
//! Implements the conversation workflow against the Dust assistant API:
//! create a conversation, post a user message mentioning the agent, wait for
//! the agent message to appear, then wait for its content to complete.

mod client;
pub mod curl;
pub mod poll;
mod types;

pub use client::DustClient;
pub use poll::{Backoff, PollStatus};
pub use types::*;

/// Path segment under the workspace for conversations.
pub const CONVERSATIONS_PATH: &str = "assistant/conversations";
