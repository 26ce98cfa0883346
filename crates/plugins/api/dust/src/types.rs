//! Dust API request and response types.
//!
//! Response types keep every field optional: the client decides which
//! missing field is fatal for which workflow step.

use serde::{Deserialize, Serialize};

// =============================================================================
// Requests
// =============================================================================

/// Body of `POST /assistant/conversations`.
#[derive(Debug, Clone, Serialize)]
pub struct CreateConversationRequest {
    pub title: String,
    pub agent_configuration_id: String,
    pub visibility: String,
    /// Always `null`: the first message is posted separately.
    pub message: Option<PostMessageRequest>,
}

/// Body of `POST /assistant/conversations/{cId}/messages`.
#[derive(Debug, Clone, Serialize)]
pub struct PostMessageRequest {
    pub content: String,
    pub mentions: Vec<Mention>,
    pub context: MessageContext,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Mention {
    pub configuration_id: String,
    pub context: MentionContext,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MentionContext {
    pub timezone: String,
    pub model_settings: ModelSettings,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelSettings {
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageContext {
    pub timezone: String,
    pub username: String,
    pub full_name: String,
}

// =============================================================================
// Responses
// =============================================================================

/// Anything carrying an `sId`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SidRef {
    #[serde(default, rename = "sId")]
    pub s_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateConversationResponse {
    #[serde(default)]
    pub conversation: Option<SidRef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMessageResponse {
    #[serde(default)]
    pub message: Option<SidRef>,
    /// Agent messages created in reply, when the API already knows them.
    #[serde(default)]
    pub agent_messages: Vec<SidRef>,
}

/// Body of `GET /assistant/conversations/{cId}`.
///
/// Dust returns `conversation.content` as a list of message-version lists.
/// A flat top-level `messages` list is accepted as well.
#[derive(Debug, Clone, Deserialize)]
pub struct ConversationResponse {
    #[serde(default)]
    pub conversation: Option<ConversationBody>,
    #[serde(default)]
    pub messages: Option<Vec<ConversationMessage>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConversationBody {
    #[serde(default)]
    pub content: Option<Vec<Vec<ConversationMessage>>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    #[serde(default, rename = "sId")]
    pub s_id: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub author: Option<MessageAuthor>,
    #[serde(default)]
    pub parent_message_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageAuthor {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

impl ConversationMessage {
    /// Whether the agent (not a user) wrote this message.
    pub fn is_agent(&self) -> bool {
        self.kind.as_deref() == Some("agent_message")
            || self
                .author
                .as_ref()
                .and_then(|a| a.kind.as_deref())
                .is_some_and(|kind| kind == "assistant")
    }
}

impl ConversationResponse {
    /// Messages in conversation order, latest version of each.
    ///
    /// `None` when the body carries neither `conversation.content` nor
    /// `messages`.
    pub fn into_messages(self) -> Option<Vec<ConversationMessage>> {
        if let Some(content) = self.conversation.and_then(|body| body.content) {
            return Some(
                content
                    .into_iter()
                    .filter_map(|versions| versions.into_iter().last())
                    .collect(),
            );
        }
        self.messages
    }
}

/// Body of `GET .../messages/{mId}/events`.
#[derive(Debug, Clone, Deserialize)]
pub struct EventsResponse {
    #[serde(default)]
    pub events: Option<Vec<AgentEvent>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvent {
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub content_block: Option<ContentBlock>,
    #[serde(default)]
    pub error: Option<EventError>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContentBlock {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventError {
    #[serde(default)]
    pub message: Option<String>,
}

/// Event types that mark the agent message as finished.
pub const COMPLETION_EVENTS: &[&str] = &["generation-complete", "agent_message_success"];

/// Event type reporting an agent failure.
pub const AGENT_ERROR_EVENT: &str = "agent_error";

impl AgentEvent {
    pub fn is_completion(&self) -> bool {
        self.kind
            .as_deref()
            .is_some_and(|kind| COMPLETION_EVENTS.contains(&kind))
    }

    pub fn is_error(&self) -> bool {
        self.kind.as_deref() == Some(AGENT_ERROR_EVENT)
    }
}
