//! Conversation state shared across tool calls.

use dustlink_core::{ConversationId, MessageId};

/// The active Dust conversation, if any.
///
/// Follow-up queries are posted into the same conversation until the client
/// asks for a new one or resets it.
#[derive(Debug, Clone, Default)]
pub struct Session {
    conversation_id: Option<ConversationId>,
    last_message_id: Option<MessageId>,
    exchanges: u32,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch to a freshly created conversation.
    pub fn start(&mut self, conversation: ConversationId) {
        self.conversation_id = Some(conversation);
        self.last_message_id = None;
        self.exchanges = 0;
    }

    pub fn record_message(&mut self, message: MessageId) {
        self.last_message_id = Some(message);
    }

    /// Count a completed query/reply round trip.
    pub fn record_exchange(&mut self) {
        self.exchanges += 1;
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn is_active(&self) -> bool {
        self.conversation_id.is_some()
    }

    pub fn conversation_id(&self) -> Option<&ConversationId> {
        self.conversation_id.as_ref()
    }

    pub fn last_message_id(&self) -> Option<&MessageId> {
        self.last_message_id.as_ref()
    }

    pub fn exchanges(&self) -> u32 {
        self.exchanges
    }
}
