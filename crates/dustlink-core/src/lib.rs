//! Core traits, types, and error handling for dustlink.
//!
//! This crate provides the foundational abstractions shared by the Dust
//! client, the MCP server and the command-line binary.

pub mod agent;
pub mod config;
pub mod error;
pub mod types;

pub use agent::AgentClient;
#[cfg(any(test, feature = "mock"))]
pub use agent::MockAgentClient;
pub use config::Config;
pub use error::{Error, Result};
pub use types::{ConversationId, MessageId};
