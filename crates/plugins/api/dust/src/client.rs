//! Dust API client implementation.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use dustlink_core::config::{DustSettings, PollSettings};
use dustlink_core::{AgentClient, Config, ConversationId, Error, MessageId, Result};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::curl::format_as_curl;
use crate::poll::{poll_until, Backoff, PollStatus};
use crate::types::{
    ConversationMessage, ConversationResponse, CreateConversationRequest,
    CreateConversationResponse, EventsResponse, Mention, MentionContext, MessageContext,
    ModelSettings, PostMessageRequest, PostMessageResponse,
};
use crate::CONVERSATIONS_PATH;

/// Characters of the query used in a new conversation's title.
const TITLE_QUERY_CHARS: usize = 30;

/// Dust API client.
pub struct DustClient {
    conversations_url: String,
    api_key: String,
    settings: DustSettings,
    backoff: Backoff,
    max_attempts: u32,
    http_retries: u32,
    client: reqwest::Client,
    /// user message sId -> agent message sId announced by the post response
    announced_replies: Mutex<HashMap<String, String>>,
}

impl DustClient {
    /// Create a client from a validated configuration.
    pub fn new(config: &Config) -> Result<Self> {
        let api_key = config
            .dust
            .usable_api_key()
            .ok_or_else(|| Error::Config("Missing DUST_API_KEY environment variable".into()))?
            .to_string();

        let client = reqwest::Client::builder()
            .user_agent(concat!("dustlink/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.dust.request_timeout_secs))
            .build()
            .map_err(|e| Error::Http(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self::with_http_client(
            client,
            api_key,
            config.dust.clone(),
            &config.polling,
        ))
    }

    fn with_http_client(
        client: reqwest::Client,
        api_key: String,
        settings: DustSettings,
        polling: &PollSettings,
    ) -> Self {
        let conversations_url = format!(
            "{}/api/v1/w/{}/{}",
            settings.domain.trim_end_matches('/'),
            settings.workspace_id,
            CONVERSATIONS_PATH
        );

        Self {
            conversations_url,
            api_key,
            settings,
            backoff: Backoff::from_settings(polling),
            max_attempts: polling.max_attempts.max(1),
            http_retries: polling.http_retries,
            client,
            announced_replies: Mutex::new(HashMap::new()),
        }
    }

    /// Root URL of the conversations API for the configured workspace.
    pub fn conversations_url(&self) -> &str {
        &self.conversations_url
    }

    fn conversation_url(&self, conversation: &ConversationId) -> String {
        format!("{}/{}", self.conversations_url, conversation)
    }

    fn messages_url(&self, conversation: &ConversationId) -> String {
        format!("{}/messages", self.conversation_url(conversation))
    }

    fn events_url(&self, conversation: &ConversationId, message: &MessageId) -> String {
        format!("{}/{}/events", self.messages_url(conversation), message)
    }

    fn headers(&self, with_body: bool) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            ("Authorization", format!("Bearer {}", self.api_key)),
            ("Accept", "application/json".to_string()),
        ];
        if with_body {
            headers.push(("Content-Type", "application/json".to_string()));
        }
        headers
    }

    /// Perform a request, retrying transient failures with backoff.
    async fn request_json(
        &self,
        step: u8,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<Value> {
        let headers = self.headers(body.is_some());
        let curl = || format_as_curl(method.as_str(), url, &headers, body);

        debug!(step, "{}", curl());

        let mut retry = 0;
        loop {
            match self.send_once(step, method.clone(), url, &headers, body).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && retry < self.http_retries => {
                    let delay = self.backoff.delay(retry);
                    warn!(
                        step,
                        retry = retry + 1,
                        max_retries = self.http_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient Dust API failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(e) => {
                    error!(step, error = %e, "Dust API request failed");
                    error!("Failed curl command: \n{}", curl());
                    return Err(e);
                }
            }
        }
    }

    async fn send_once(
        &self,
        step: u8,
        method: Method,
        url: &str,
        headers: &[(&'static str, String)],
        body: Option<&Value>,
    ) -> Result<Value> {
        let mut request = self.client.request(method, url);
        for (name, value) in headers {
            request = request.header(*name, value);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let status_code = status.as_u16();
            let message = response.text().await.unwrap_or_default();
            warn!(
                step,
                status = status_code,
                message = %message,
                "Dust API error response"
            );
            return Err(Error::from_status(status_code, message));
        }

        let text = response
            .text()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| Error::UnexpectedResponse {
            step,
            message: format!("invalid JSON ({}): {}", e, text),
        })
    }

    fn remember_reply(&self, user_message: &str, agent_message: &str) {
        match self.announced_replies.lock() {
            Ok(mut replies) => {
                replies.insert(user_message.to_string(), agent_message.to_string());
            }
            Err(e) => warn!(error = %e, "Reply cache lock poisoned"),
        }
    }

    fn take_announced_reply(&self, user_message: &MessageId) -> Option<MessageId> {
        self.announced_replies
            .lock()
            .ok()
            .and_then(|mut replies| replies.remove(user_message.as_str()))
            .map(MessageId::from)
    }

    fn post_message_body(&self, query: &str) -> PostMessageRequest {
        PostMessageRequest {
            content: query.to_string(),
            mentions: vec![Mention {
                configuration_id: self.settings.agent_id.clone(),
                context: MentionContext {
                    timezone: self.settings.timezone.clone(),
                    model_settings: ModelSettings {
                        provider: self.settings.model_provider.clone(),
                        model: self.settings.model.clone(),
                    },
                },
            }],
            context: MessageContext {
                timezone: self.settings.timezone.clone(),
                username: self.settings.username.clone(),
                full_name: self.settings.fullname.clone(),
            },
        }
    }

    async fn poll_agent_message(
        &self,
        conversation: &ConversationId,
        user_message: &MessageId,
    ) -> Result<PollStatus<MessageId>> {
        let url = self.conversation_url(conversation);
        let value = self.request_json(3, Method::GET, &url, None).await?;
        let response: ConversationResponse = parse(3, value.clone())?;

        let messages = response.into_messages().ok_or_else(|| Error::UnexpectedResponse {
            step: 3,
            message: value.to_string(),
        })?;

        Ok(find_reply(&messages, user_message.as_str())
            .map(|id| PollStatus::Ready(MessageId::new(id)))
            .unwrap_or(PollStatus::Pending))
    }

    async fn poll_agent_events(
        &self,
        conversation: &ConversationId,
        agent_message: &MessageId,
    ) -> Result<PollStatus<String>> {
        let url = self.events_url(conversation, agent_message);
        let value = self.request_json(4, Method::GET, &url, None).await?;
        let response: EventsResponse = parse(4, value.clone())?;

        let events = response.events.ok_or_else(|| Error::UnexpectedResponse {
            step: 4,
            message: value.to_string(),
        })?;

        let mut blocks = Vec::new();
        let mut completed = false;

        for event in &events {
            if event.is_error() {
                let message = event
                    .error
                    .as_ref()
                    .and_then(|e| e.message.clone())
                    .unwrap_or_else(|| "agent reported an error".to_string());
                return Err(Error::AgentFailed(message));
            }
            if let Some(content) = event.content_block.as_ref().and_then(|b| b.content.as_ref()) {
                blocks.push(content.as_str());
            }
            if event.is_completion() {
                completed = true;
            }
        }

        if completed {
            Ok(PollStatus::Ready(blocks.join("\n")))
        } else {
            Ok(PollStatus::Pending)
        }
    }

    fn log_exhausted(&self, step: u8, url: &str) {
        warn!(
            step,
            attempts = self.max_attempts,
            "Gave up polling Dust"
        );
        warn!(
            "Last curl command attempted: \n{}",
            format_as_curl("GET", url, &self.headers(false), None)
        );
    }
}

#[async_trait]
impl AgentClient for DustClient {
    async fn create_conversation(&self, query: &str) -> Result<ConversationId> {
        let body = serde_json::to_value(CreateConversationRequest {
            title: conversation_title(&self.settings.agent_name, query),
            agent_configuration_id: self.settings.agent_id.clone(),
            visibility: "unlisted".to_string(),
            message: None,
        })?;

        info!(url = %self.conversations_url, "Creating new conversation");
        let value = self
            .request_json(1, Method::POST, &self.conversations_url, Some(&body))
            .await?;
        debug!(response = %value, "Create conversation response");

        let response: CreateConversationResponse = parse(1, value.clone())?;
        let id = response
            .conversation
            .and_then(|c| c.s_id)
            .ok_or_else(|| Error::UnexpectedResponse {
                step: 1,
                message: value.to_string(),
            })?;

        info!(conversation_id = %id, "Step 1: Created conversation");
        Ok(ConversationId::new(id))
    }

    async fn send_message(&self, conversation: &ConversationId, query: &str) -> Result<MessageId> {
        let url = self.messages_url(conversation);
        let body = serde_json::to_value(self.post_message_body(query))?;

        info!(url = %url, "Sending message to conversation");
        let value = self.request_json(2, Method::POST, &url, Some(&body)).await?;
        debug!(response = %value, "Send message response");

        let response: PostMessageResponse = parse(2, value.clone())?;
        let id = response
            .message
            .and_then(|m| m.s_id)
            .ok_or_else(|| Error::UnexpectedResponse {
                step: 2,
                message: format!("Could not find message ID in response: {}", value),
            })?;

        if let Some(agent_id) = response.agent_messages.into_iter().find_map(|m| m.s_id) {
            debug!(user_message = %id, agent_message = %agent_id, "Agent reply announced");
            self.remember_reply(&id, &agent_id);
        }

        info!(message_id = %id, "Step 2: Sent message");
        Ok(MessageId::new(id))
    }

    async fn wait_for_agent_message(
        &self,
        conversation: &ConversationId,
        user_message: &MessageId,
    ) -> Result<MessageId> {
        if let Some(agent_message) = self.take_announced_reply(user_message) {
            info!(agent_message = %agent_message, "Step 3: Found agent response");
            return Ok(agent_message);
        }

        let url = self.conversation_url(conversation);
        info!(url = %url, "Waiting for agent message");

        let result = poll_until(3, self.max_attempts, &self.backoff, |_| {
            self.poll_agent_message(conversation, user_message)
        })
        .await;

        match &result {
            Ok(agent_message) => {
                info!(agent_message = %agent_message, "Step 3: Found agent response")
            }
            Err(Error::PollExhausted { .. }) => self.log_exhausted(3, &url),
            Err(_) => {}
        }
        result
    }

    async fn wait_for_agent_response(
        &self,
        conversation: &ConversationId,
        agent_message: &MessageId,
    ) -> Result<String> {
        let url = self.events_url(conversation, agent_message);

        let result = poll_until(4, self.max_attempts, &self.backoff, |_| {
            self.poll_agent_events(conversation, agent_message)
        })
        .await;

        match &result {
            Ok(content) => info!(
                length = content.len(),
                preview = %preview(content, 100),
                "Step 4: Received response"
            ),
            Err(Error::PollExhausted { .. }) => self.log_exhausted(4, &url),
            Err(_) => {}
        }
        result
    }
}

fn parse<T: DeserializeOwned>(step: u8, value: Value) -> Result<T> {
    let raw = value.to_string();
    serde_json::from_value(value).map_err(|e| Error::UnexpectedResponse {
        step,
        message: format!("{}: {}", e, raw),
    })
}

/// First agent message after `user_message` that answers it.
///
/// An agent message naming a different parent is skipped.
fn find_reply(messages: &[ConversationMessage], user_message: &str) -> Option<String> {
    let position = messages
        .iter()
        .position(|m| m.s_id.as_deref() == Some(user_message))?;

    messages[position + 1..]
        .iter()
        .filter(|m| m.is_agent())
        .find(|m| {
            m.parent_message_id
                .as_deref()
                .map_or(true, |parent| parent == user_message)
        })
        .and_then(|m| m.s_id.clone())
}

/// `"<agent> query: <first 30 chars>..."`, ellipsis included even for short
/// queries.
fn conversation_title(agent_name: &str, query: &str) -> String {
    let head: String = query.chars().take(TITLE_QUERY_CHARS).collect();
    format!("{} query: {}...", agent_name, head)
}

fn preview(text: &str, max_chars: usize) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}
