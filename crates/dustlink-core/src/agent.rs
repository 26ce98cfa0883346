//! Agent client trait.
//!
//! The MCP handlers drive the conversation workflow through this trait so
//! the HTTP client can be swapped for a mock in tests.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{ConversationId, MessageId};

/// Client for a hosted conversational agent.
#[cfg_attr(any(test, feature = "mock"), mockall::automock)]
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Step 1: open a new conversation with the configured agent.
    async fn create_conversation(&self, query: &str) -> Result<ConversationId>;

    /// Step 2: post a user message mentioning the agent.
    async fn send_message(&self, conversation: &ConversationId, query: &str) -> Result<MessageId>;

    /// Step 3: wait until the agent has started replying to `user_message`.
    async fn wait_for_agent_message(
        &self,
        conversation: &ConversationId,
        user_message: &MessageId,
    ) -> Result<MessageId>;

    /// Step 4: wait until the agent message is complete and return its text.
    async fn wait_for_agent_response(
        &self,
        conversation: &ConversationId,
        agent_message: &MessageId,
    ) -> Result<String>;
}
