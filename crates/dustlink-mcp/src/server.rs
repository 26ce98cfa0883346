//! MCP server implementation.
//!
//! The server handles the MCP protocol lifecycle:
//! 1. Initialize - exchange capabilities
//! 2. Handle tool calls - forward queries to the Dust agent
//! 3. Shutdown - on EOF or Ctrl-C

use std::future::Future;
use std::io;

use dustlink_core::Result;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncWrite};

use crate::handlers::ToolHandler;
use crate::protocol::{
    Implementation, InitializeParams, InitializeResult, JsonRpcError, JsonRpcRequest,
    JsonRpcResponse, RequestId, ServerCapabilities, ToolCallParams, ToolsCapability,
    ToolsListResult, MCP_VERSION,
};
use crate::transport::{IncomingMessage, StdioTransport, Transport};

/// MCP server exposing the Dust agent as tools.
pub struct McpServer {
    handler: ToolHandler,
    name: String,
    initialized: bool,
}

impl McpServer {
    /// `name` is reported to clients as `serverInfo.name`.
    pub fn new(handler: ToolHandler, name: impl Into<String>) -> Self {
        Self {
            handler,
            name: name.into(),
            initialized: false,
        }
    }

    /// Serve over stdin/stdout until EOF or Ctrl-C.
    pub async fn run(&mut self) -> Result<()> {
        tracing::info!(
            server = %self.name,
            tool = %self.handler.tool_name(),
            "Starting MCP server on stdio"
        );

        let mut transport = StdioTransport::stdio();
        let shutdown = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        self.run_with(&mut transport, shutdown).await
    }

    /// Serve over any transport, stopping at EOF or when `shutdown` resolves.
    ///
    /// Shutdown is only observed between messages: a tool call in progress
    /// finishes and its response is written first.
    pub async fn run_with<R, W, F>(
        &mut self,
        transport: &mut Transport<R, W>,
        shutdown: F,
    ) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            let next = tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Interrupt received");
                    break;
                }
                next = transport.read_message() => next,
            };

            let response = match next {
                Ok(Some(msg)) => self.handle_message(msg).await,
                Ok(None) => {
                    tracing::info!("EOF received");
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    tracing::warn!("Unreadable message: {}", e);
                    Some(JsonRpcResponse::error(
                        RequestId::Null,
                        JsonRpcError::parse_error(&e.to_string()),
                    ))
                }
                Err(e) => {
                    tracing::error!("Transport error: {}", e);
                    break;
                }
            };

            if let Some(resp) = response {
                if let Err(e) = transport.write_message(&resp).await {
                    tracing::error!("Failed to write response: {}", e);
                    break;
                }
            }
        }

        tracing::info!("Shutting down");
        Ok(())
    }

    async fn handle_message(&mut self, msg: IncomingMessage) -> Option<JsonRpcResponse> {
        match msg {
            IncomingMessage::Request(req) => Some(self.handle_request(req).await),
            IncomingMessage::Notification(notif) => {
                self.handle_notification(&notif.method);
                None
            }
            IncomingMessage::Malformed(id, error) => Some(JsonRpcResponse::error(id, error)),
        }
    }

    async fn handle_request(&mut self, req: JsonRpcRequest) -> JsonRpcResponse {
        tracing::debug!("Handling request: {} (id: {:?})", req.method, req.id);

        match req.method.as_str() {
            "initialize" => self.handle_initialize(req.id, req.params),
            "tools/list" => self.handle_tools_list(req.id),
            "tools/call" => self.handle_tools_call(req.id, req.params).await,
            "ping" => JsonRpcResponse::success(req.id, json!({})),
            method => {
                tracing::warn!("Unknown method: {}", method);
                JsonRpcResponse::error(req.id, JsonRpcError::method_not_found(method))
            }
        }
    }

    fn handle_notification(&mut self, method: &str) {
        match method {
            "notifications/initialized" | "initialized" => tracing::info!("Client initialized"),
            "notifications/cancelled" => tracing::debug!("Request cancelled by client"),
            _ => tracing::debug!("Ignoring notification: {}", method),
        }
    }

    fn handle_initialize(&mut self, id: RequestId, params: Option<Value>) -> JsonRpcResponse {
        if self.initialized {
            return JsonRpcResponse::error(
                id,
                JsonRpcError::invalid_request("Server already initialized"),
            );
        }

        if let Some(params) = params {
            match serde_json::from_value::<InitializeParams>(params) {
                Ok(InitializeParams {
                    protocol_version,
                    client_info: Some(client),
                    ..
                }) => tracing::info!(
                    "Client: {} v{} (protocol: {})",
                    client.name,
                    client.version,
                    protocol_version.as_deref().unwrap_or("unknown")
                ),
                Ok(_) => tracing::info!("Client connected without clientInfo"),
                Err(e) => tracing::warn!("Failed to parse initialize params: {}", e),
            }
        }

        self.initialized = true;

        let result = InitializeResult {
            protocol_version: MCP_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: ToolsCapability {
                    list_changed: false,
                },
            },
            server_info: Implementation {
                name: self.name.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            instructions: Some(format!(
                "Use `{}` to ask the Dust agent. Follow-up queries continue the same conversation.",
                self.handler.tool_name()
            )),
        };

        JsonRpcResponse::from_serializable(id, &result)
    }

    fn handle_tools_list(&self, id: RequestId) -> JsonRpcResponse {
        let result = ToolsListResult {
            tools: self.handler.available_tools(),
        };
        JsonRpcResponse::from_serializable(id, &result)
    }

    async fn handle_tools_call(&self, id: RequestId, params: Option<Value>) -> JsonRpcResponse {
        let params: ToolCallParams = match params {
            Some(p) => match serde_json::from_value(p) {
                Ok(params) => params,
                Err(e) => {
                    return JsonRpcResponse::error(
                        id,
                        JsonRpcError::invalid_params(&e.to_string()),
                    );
                }
            },
            None => {
                return JsonRpcResponse::error(id, JsonRpcError::invalid_params("Missing params"));
            }
        };

        tracing::info!("Calling tool: {}", params.name);

        let result = self.handler.execute(&params.name, params.arguments).await;
        JsonRpcResponse::from_serializable(id, &result)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::protocol::JSONRPC_VERSION;
    use dustlink_core::{Config, ConversationId, MessageId, MockAgentClient};

    fn server(mock: MockAgentClient) -> McpServer {
        let mut config = Config::default();
        config.dust.workspace_id = "ws-1".into();
        config.dust.agent_id = "agent-1".into();
        let handler = ToolHandler::new(Arc::new(mock), &config);
        McpServer::new(handler, config.mcp.name.clone())
    }

    fn request(id: i64, method: &str, params: Option<Value>) -> JsonRpcRequest {
        JsonRpcRequest {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: RequestId::Number(id),
            method: method.to_string(),
            params,
        }
    }

    /// Feed `input` through `run_with` and return the parsed response lines.
    async fn serve(server: &mut McpServer, input: &str) -> Vec<Value> {
        let mut transport = Transport::new(input.as_bytes(), Vec::new());
        server
            .run_with(&mut transport, std::future::pending())
            .await
            .unwrap();

        String::from_utf8(transport.into_writer())
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_initialize_reports_server_name() {
        let mut server = server(MockAgentClient::new());
        let resp = server
            .handle_request(request(
                1,
                "initialize",
                Some(json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "clientInfo": {"name": "test-client", "version": "1.0.0"}
                })),
            ))
            .await;

        let result = resp.result.unwrap();
        assert_eq!(result["serverInfo"]["name"], "Dust MCP Server");
        assert_eq!(result["protocolVersion"], MCP_VERSION);
        assert!(server.initialized);
    }

    #[tokio::test]
    async fn test_double_initialize_error() {
        let mut server = server(MockAgentClient::new());
        server.handle_request(request(1, "initialize", None)).await;
        let resp = server.handle_request(request(2, "initialize", None)).await;

        assert_eq!(resp.error.unwrap().code, JsonRpcError::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_tools_list() {
        let mut server = server(MockAgentClient::new());
        let resp = server.handle_request(request(1, "tools/list", None)).await;

        let result: ToolsListResult = serde_json::from_value(resp.result.unwrap()).unwrap();
        assert_eq!(result.tools.len(), 3);
        assert_eq!(result.tools[0].name, "dust_systems_thinking");
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let mut server = server(MockAgentClient::new());
        let resp = server
            .handle_request(request(1, "resources/list", None))
            .await;
        assert_eq!(resp.error.unwrap().code, JsonRpcError::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_tools_call_missing_or_invalid_params() {
        let mut server = server(MockAgentClient::new());

        let resp = server.handle_request(request(1, "tools/call", None)).await;
        assert_eq!(resp.error.unwrap().code, JsonRpcError::INVALID_PARAMS);

        let resp = server
            .handle_request(request(2, "tools/call", Some(json!("not an object"))))
            .await;
        assert_eq!(resp.error.unwrap().code, JsonRpcError::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_tools_call_forwards_to_agent() {
        let mut mock = MockAgentClient::new();
        mock.expect_create_conversation()
            .returning(|_| Ok(ConversationId::from("c1")));
        mock.expect_send_message()
            .returning(|_, _| Ok(MessageId::from("u1")));
        mock.expect_wait_for_agent_message()
            .returning(|_, _| Ok(MessageId::from("a1")));
        mock.expect_wait_for_agent_response()
            .returning(|_, _| Ok("Stocks and flows.".into()));
        let mut server = server(mock);

        let resp = server
            .handle_request(request(
                7,
                "tools/call",
                Some(json!({
                    "name": "dust_systems_thinking",
                    "arguments": {"query": "Explain system dynamics"}
                })),
            ))
            .await;

        assert_eq!(resp.id, RequestId::Number(7));
        let result = resp.result.unwrap();
        assert_eq!(result["content"][0]["text"], "Stocks and flows.");
        assert!(result.get("isError").is_none());
    }

    #[tokio::test]
    async fn test_run_with_answers_requests_and_skips_notifications() {
        let mut server = server(MockAgentClient::new());
        let input = concat!(
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"initialize\",\"params\":{}}\n",
            "{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n",
            "{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"ping\"}\n",
            "this is not json\n",
        );

        let responses = serve(&mut server, input).await;

        assert_eq!(responses.len(), 3);
        assert_eq!(responses[0]["id"], 1);
        assert_eq!(responses[1]["id"], 2);
        assert_eq!(responses[1]["result"], json!({}));
        assert_eq!(responses[2]["id"], Value::Null);
        assert_eq!(responses[2]["error"]["code"], JsonRpcError::PARSE_ERROR);
    }

    #[tokio::test]
    async fn test_run_with_stops_on_shutdown() {
        let mut server = server(MockAgentClient::new());
        // Keep the write half alive so the reader never sees EOF.
        let (_client, server_side) = tokio::io::duplex(64);
        let mut transport = Transport::new(tokio::io::BufReader::new(server_side), Vec::new());

        server
            .run_with(&mut transport, std::future::ready(()))
            .await
            .unwrap();

        assert!(transport.into_writer().is_empty());
    }
}
