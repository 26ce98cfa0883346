//! Tool handlers for MCP server.
//!
//! The query tool runs the four-step Dust workflow (create conversation,
//! post message, wait for the agent message, wait for its content) against
//! an [`AgentClient`], keeping the conversation open between calls.

use std::sync::Arc;
use std::time::Duration;

use dustlink_core::{AgentClient, Config, ConversationId, Error, Result};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::Mutex;

use crate::protocol::{ToolCallResult, ToolDefinition};
use crate::session::Session;

pub use dustlink_core::config::{RESET_TOOL_NAME as RESET_TOOL, STATUS_TOOL_NAME as STATUS_TOOL};

#[derive(Debug, Deserialize)]
struct QueryArgs {
    query: String,
    #[serde(default)]
    new_conversation: bool,
}

/// Tool handler that forwards queries to the configured Dust agent.
pub struct ToolHandler {
    client: Arc<dyn AgentClient>,
    session: Mutex<Session>,
    tool_name: String,
    agent_name: String,
    workspace_id: String,
    workspace_name: String,
    call_timeout: Duration,
}

impl ToolHandler {
    pub fn new(client: Arc<dyn AgentClient>, config: &Config) -> Self {
        Self {
            client,
            session: Mutex::new(Session::new()),
            tool_name: config.tool_name(),
            agent_name: config.dust.agent_name.clone(),
            workspace_id: config.dust.workspace_id.clone(),
            workspace_name: config.dust.workspace_name.clone(),
            call_timeout: Duration::from_secs(config.mcp.timeout_secs),
        }
    }

    /// Name of the query tool.
    pub fn tool_name(&self) -> &str {
        &self.tool_name
    }

    /// Continue an existing conversation instead of creating one on the
    /// next query.
    pub async fn resume(&self, conversation: ConversationId) {
        self.session.lock().await.start(conversation);
    }

    pub async fn active_conversation(&self) -> Option<ConversationId> {
        self.session.lock().await.conversation_id().cloned()
    }

    pub fn available_tools(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition {
                name: self.tool_name.clone(),
                description: format!(
                    "Connect to the Dust {} agent to answer questions",
                    self.agent_name
                ),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "query": {
                            "type": "string",
                            "description": "The question or request to send to the agent"
                        },
                        "new_conversation": {
                            "type": "boolean",
                            "description": "Start a new conversation instead of continuing the current one (default: false)",
                            "default": false
                        }
                    },
                    "required": ["query"]
                }),
            },
            ToolDefinition {
                name: STATUS_TOOL.to_string(),
                description: "Show the agent, workspace and active Dust conversation".to_string(),
                input_schema: json!({ "type": "object", "properties": {} }),
            },
            ToolDefinition {
                name: RESET_TOOL.to_string(),
                description: "Forget the active Dust conversation so the next query starts a new one"
                    .to_string(),
                input_schema: json!({ "type": "object", "properties": {} }),
            },
        ]
    }

    /// Execute a tool by name with arguments.
    pub async fn execute(&self, name: &str, arguments: Option<Value>) -> ToolCallResult {
        match name {
            STATUS_TOOL => self.handle_status().await,
            RESET_TOOL => self.handle_reset().await,
            _ if name == self.tool_name => self.handle_query(arguments).await,
            _ => ToolCallResult::error(format!("Unknown tool: {}", name)),
        }
    }

    async fn handle_query(&self, arguments: Option<Value>) -> ToolCallResult {
        let args: QueryArgs = match serde_json::from_value(arguments.unwrap_or(Value::Null)) {
            Ok(args) => args,
            Err(e) => {
                return ToolCallResult::error(format!("Invalid arguments: {}", e));
            }
        };
        if args.query.trim().is_empty() {
            return ToolCallResult::error(
                Error::InvalidInput("query must not be empty".into()).to_string(),
            );
        }

        // Calls are serialized: a second query waits for the first to finish.
        let mut session = self.session.lock().await;
        let mut step = 1u8;

        let outcome = tokio::time::timeout(
            self.call_timeout,
            self.run_query(&mut session, &args, &mut step),
        )
        .await;

        match outcome {
            Ok(Ok(reply)) => ToolCallResult::text(reply),
            Ok(Err(e)) => {
                tracing::error!(step, error = %e, "Dust workflow failed");
                ToolCallResult::error(failure_message(step, &e))
            }
            Err(_) => {
                let e = Error::Timeout {
                    step,
                    seconds: self.call_timeout.as_secs(),
                };
                tracing::error!(
                    step,
                    timeout_secs = self.call_timeout.as_secs(),
                    "Dust workflow timed out; the last request curl is logged at debug level"
                );
                ToolCallResult::error(e.to_string())
            }
        }
    }

    async fn run_query(
        &self,
        session: &mut Session,
        args: &QueryArgs,
        step: &mut u8,
    ) -> Result<String> {
        let existing = if args.new_conversation {
            None
        } else {
            session.conversation_id().cloned()
        };
        let conversation = match existing {
            Some(existing) => {
                tracing::info!(conversation_id = %existing, "Continuing conversation");
                existing
            }
            None => {
                tracing::info!("Starting a new conversation");
                *step = 1;
                let created = self.client.create_conversation(&args.query).await?;
                session.start(created.clone());
                created
            }
        };

        *step = 2;
        let user_message = self.client.send_message(&conversation, &args.query).await?;
        session.record_message(user_message.clone());

        *step = 3;
        let agent_message = self
            .client
            .wait_for_agent_message(&conversation, &user_message)
            .await?;

        *step = 4;
        let content = self
            .client
            .wait_for_agent_response(&conversation, &agent_message)
            .await?;
        session.record_exchange();

        if content.trim().is_empty() {
            return Ok(format!("{} returned an empty response.", self.agent_name));
        }
        Ok(content)
    }

    async fn handle_status(&self) -> ToolCallResult {
        let session = self.session.lock().await;
        let workspace = if self.workspace_name.is_empty() {
            self.workspace_id.clone()
        } else {
            format!("{} ({})", self.workspace_name, self.workspace_id)
        };

        let mut lines = vec![
            format!("Agent: {}", self.agent_name),
            format!("Workspace: {}", workspace),
        ];
        match session.conversation_id() {
            Some(id) => {
                lines.push(format!("Conversation: {}", id));
                lines.push(format!(
                    "Last message: {}",
                    session
                        .last_message_id()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| "-".to_string())
                ));
                lines.push(format!("Exchanges: {}", session.exchanges()));
            }
            None => lines.push("Conversation: none".to_string()),
        }

        ToolCallResult::text(lines.join("\n"))
    }

    async fn handle_reset(&self) -> ToolCallResult {
        let mut session = self.session.lock().await;
        match session.conversation_id() {
            Some(id) => {
                tracing::info!(conversation_id = %id, "Resetting conversation");
                session.reset();
                ToolCallResult::text("Conversation reset. The next query starts a new conversation.")
            }
            None => ToolCallResult::text("No active conversation."),
        }
    }
}

/// Step-tagged failure text for the tool result.
fn failure_message(step: u8, error: &Error) -> String {
    if error.step().is_some() {
        return error.to_string();
    }
    let action = match step {
        1 => "Failed to create conversation",
        2 => "Failed to send message",
        3 => "Failed to get agent message",
        _ => "Failed to get agent response",
    };
    format!("Step {}: {}: {}", step, action, error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dustlink_core::{MessageId, MockAgentClient};

    fn config() -> Config {
        let mut config = Config::default();
        config.dust.workspace_id = "ws-1".into();
        config.dust.workspace_name = "Research".into();
        config.dust.agent_id = "agent-1".into();
        config
    }

    fn handler(mock: MockAgentClient) -> ToolHandler {
        ToolHandler::new(Arc::new(mock), &config())
    }

    fn happy_path(mock: &mut MockAgentClient, conversations: usize, reply: &'static str) {
        mock.expect_create_conversation()
            .times(conversations)
            .returning(|_| Ok(ConversationId::from("c1")));
        mock.expect_send_message()
            .returning(|_, _| Ok(MessageId::from("u1")));
        mock.expect_wait_for_agent_message()
            .returning(|_, _| Ok(MessageId::from("a1")));
        mock.expect_wait_for_agent_response()
            .returning(move |_, _| Ok(reply.to_string()));
    }

    #[test]
    fn test_available_tools() {
        let handler = handler(MockAgentClient::new());
        let tools = handler.available_tools();
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();

        assert_eq!(
            names,
            vec!["dust_systems_thinking", STATUS_TOOL, RESET_TOOL]
        );
        assert_eq!(tools[0].input_schema["required"], json!(["query"]));
        assert!(tools[0].description.contains("SystemsThinking"));
    }

    #[test]
    fn test_failure_message_prefixes_untagged_errors() {
        let msg = failure_message(2, &Error::Unauthorized("bad key".into()));
        assert_eq!(msg, "Step 2: Failed to send message: Unauthorized: bad key");

        let msg = failure_message(
            3,
            &Error::PollExhausted {
                step: 3,
                attempts: 30,
            },
        );
        assert_eq!(msg, "Step 3: No result after 30 attempts");
    }

    #[tokio::test]
    async fn test_query_returns_agent_reply() {
        let mut mock = MockAgentClient::new();
        mock.expect_create_conversation()
            .withf(|q| q == "What is a feedback loop?")
            .times(1)
            .returning(|_| Ok(ConversationId::from("c1")));
        mock.expect_send_message()
            .withf(|c, q| c.as_str() == "c1" && q.contains("feedback loop"))
            .times(1)
            .returning(|_, _| Ok(MessageId::from("u1")));
        mock.expect_wait_for_agent_message()
            .withf(|c, m| c.as_str() == "c1" && m.as_str() == "u1")
            .times(1)
            .returning(|_, _| Ok(MessageId::from("a1")));
        mock.expect_wait_for_agent_response()
            .withf(|_, m| m.as_str() == "a1")
            .times(1)
            .returning(|_, _| Ok("A loop where output feeds back as input.".into()));

        let handler = handler(mock);
        let result = handler
            .execute(
                "dust_systems_thinking",
                Some(json!({"query": "What is a feedback loop?"})),
            )
            .await;

        assert!(!result.is_error());
        assert_eq!(
            result.text_content(),
            "A loop where output feeds back as input."
        );
    }

    #[tokio::test]
    async fn test_follow_up_reuses_conversation() {
        let mut mock = MockAgentClient::new();
        happy_path(&mut mock, 1, "ok");
        let handler = handler(mock);

        for query in ["first", "second"] {
            let result = handler
                .execute("dust_systems_thinking", Some(json!({"query": query})))
                .await;
            assert!(!result.is_error());
        }

        let status = handler.execute(STATUS_TOOL, None).await.text_content();
        assert!(status.contains("Conversation: c1"));
        assert!(status.contains("Last message: u1"));
        assert!(status.contains("Exchanges: 2"));
    }

    #[tokio::test]
    async fn test_new_conversation_flag_creates_again() {
        let mut mock = MockAgentClient::new();
        happy_path(&mut mock, 2, "ok");
        let handler = handler(mock);

        handler
            .execute("dust_systems_thinking", Some(json!({"query": "a"})))
            .await;
        let result = handler
            .execute(
                "dust_systems_thinking",
                Some(json!({"query": "b", "new_conversation": true})),
            )
            .await;
        assert!(!result.is_error());
    }

    #[tokio::test]
    async fn test_reset_forgets_conversation() {
        let mut mock = MockAgentClient::new();
        happy_path(&mut mock, 2, "ok");
        let handler = handler(mock);

        handler
            .execute("dust_systems_thinking", Some(json!({"query": "a"})))
            .await;
        let reset = handler.execute(RESET_TOOL, None).await;
        assert!(reset.text_content().contains("Conversation reset"));

        let status = handler.execute(STATUS_TOOL, None).await.text_content();
        assert!(status.contains("Conversation: none"));

        handler
            .execute("dust_systems_thinking", Some(json!({"query": "b"})))
            .await;
    }

    #[tokio::test]
    async fn test_resume_skips_creation() {
        let mut mock = MockAgentClient::new();
        mock.expect_create_conversation().never();
        mock.expect_send_message()
            .withf(|c, _| c.as_str() == "existing")
            .returning(|_, _| Ok(MessageId::from("u1")));
        mock.expect_wait_for_agent_message()
            .returning(|_, _| Ok(MessageId::from("a1")));
        mock.expect_wait_for_agent_response()
            .returning(|_, _| Ok("again".into()));
        let handler = handler(mock);

        handler.resume(ConversationId::from("existing")).await;
        let result = handler
            .execute("dust_systems_thinking", Some(json!({"query": "more"})))
            .await;

        assert_eq!(result.text_content(), "again");
        assert_eq!(
            handler.active_conversation().await,
            Some(ConversationId::from("existing"))
        );
    }

    #[tokio::test]
    async fn test_reset_without_conversation() {
        let handler = handler(MockAgentClient::new());
        let result = handler.execute(RESET_TOOL, None).await;
        assert_eq!(result.text_content(), "No active conversation.");
    }

    #[tokio::test]
    async fn test_create_failure_leaves_no_conversation() {
        let mut mock = MockAgentClient::new();
        mock.expect_create_conversation()
            .returning(|_| Err(Error::Unauthorized("invalid api key".into())));
        mock.expect_send_message().never();
        let handler = handler(mock);

        let result = handler
            .execute("dust_systems_thinking", Some(json!({"query": "hi"})))
            .await;

        assert!(result.is_error());
        assert_eq!(
            result.text_content(),
            "Step 1: Failed to create conversation: Unauthorized: invalid api key"
        );
        let status = handler.execute(STATUS_TOOL, None).await.text_content();
        assert!(status.contains("Conversation: none"));
    }

    #[tokio::test]
    async fn test_send_failure_keeps_conversation() {
        let mut mock = MockAgentClient::new();
        mock.expect_create_conversation()
            .times(1)
            .returning(|_| Ok(ConversationId::from("c1")));
        mock.expect_send_message().returning(|_, _| {
            Err(Error::ServerError {
                status: 502,
                message: "bad gateway".into(),
            })
        });
        let handler = handler(mock);

        let result = handler
            .execute("dust_systems_thinking", Some(json!({"query": "hi"})))
            .await;
        assert!(result.is_error());
        assert!(result.text_content().starts_with("Step 2: Failed to send message"));

        let status = handler.execute(STATUS_TOOL, None).await.text_content();
        assert!(status.contains("Conversation: c1"));
    }

    #[tokio::test]
    async fn test_poll_exhaustion_is_reported_verbatim() {
        let mut mock = MockAgentClient::new();
        mock.expect_create_conversation()
            .returning(|_| Ok(ConversationId::from("c1")));
        mock.expect_send_message()
            .returning(|_, _| Ok(MessageId::from("u1")));
        mock.expect_wait_for_agent_message().returning(|_, _| {
            Err(Error::PollExhausted {
                step: 3,
                attempts: 30,
            })
        });
        let handler = handler(mock);

        let result = handler
            .execute("dust_systems_thinking", Some(json!({"query": "hi"})))
            .await;
        assert_eq!(result.text_content(), "Step 3: No result after 30 attempts");
    }

    #[tokio::test]
    async fn test_empty_reply_gets_note() {
        let mut mock = MockAgentClient::new();
        happy_path(&mut mock, 1, "  ");
        let handler = handler(mock);

        let result = handler
            .execute("dust_systems_thinking", Some(json!({"query": "hi"})))
            .await;
        assert!(!result.is_error());
        assert_eq!(
            result.text_content(),
            "SystemsThinking returned an empty response."
        );
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let handler = handler(MockAgentClient::new());

        let missing = handler.execute("dust_systems_thinking", None).await;
        assert!(missing.is_error());
        assert!(missing.text_content().starts_with("Invalid arguments"));

        let blank = handler
            .execute("dust_systems_thinking", Some(json!({"query": "   "})))
            .await;
        assert!(blank.is_error());
        assert!(blank.text_content().contains("query must not be empty"));
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let handler = handler(MockAgentClient::new());
        let result = handler.execute("get_issues", None).await;
        assert!(result.is_error());
        assert_eq!(result.text_content(), "Unknown tool: get_issues");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_reports_current_step() {
        let mut mock = MockAgentClient::new();
        mock.expect_create_conversation()
            .returning(|_| Ok(ConversationId::from("c1")));
        mock.expect_send_message()
            .returning(|_, _| Ok(MessageId::from("u1")));
        mock.expect_wait_for_agent_message()
            .returning(|_, _| Ok(MessageId::from("a1")));

        let mut config = config();
        config.mcp.timeout_secs = 5;
        let handler = ToolHandler::new(Arc::new(SlowStep4(mock)), &config);

        let result = handler
            .execute("dust_systems_thinking", Some(json!({"query": "hi"})))
            .await;
        assert!(result.is_error());
        assert_eq!(result.text_content(), "Step 4: Timed out after 5s");
    }

    /// Delegates to the mock but never finishes step 4.
    struct SlowStep4(MockAgentClient);

    #[async_trait::async_trait]
    impl AgentClient for SlowStep4 {
        async fn create_conversation(&self, query: &str) -> Result<ConversationId> {
            self.0.create_conversation(query).await
        }

        async fn send_message(
            &self,
            conversation: &ConversationId,
            query: &str,
        ) -> Result<MessageId> {
            self.0.send_message(conversation, query).await
        }

        async fn wait_for_agent_message(
            &self,
            conversation: &ConversationId,
            user_message: &MessageId,
        ) -> Result<MessageId> {
            self.0.wait_for_agent_message(conversation, user_message).await
        }

        async fn wait_for_agent_response(
            &self,
            _conversation: &ConversationId,
            _agent_message: &MessageId,
        ) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(String::new())
        }
    }
}
