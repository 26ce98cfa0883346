//! End-to-end tests: MCP requests in, Dust API calls out.
//!
//! The MCP server runs over an in-memory transport and talks to a mocked
//! Dust API through the real HTTP client.

use std::sync::Arc;

use dustlink_core::Config;
use dustlink_dust::DustClient;
use dustlink_mcp::transport::Transport;
use dustlink_mcp::{McpServer, ToolHandler};
use httpmock::prelude::*;
use serde_json::{json, Value};

const BASE_PATH: &str = "/api/v1/w/ws-1/assistant/conversations";

fn test_config(server: &MockServer) -> Config {
    let mut config = Config::default();
    config.dust.api_key = Some("sk-test".to_string());
    config.dust.workspace_id = "ws-1".to_string();
    config.dust.agent_id = "agent-1".to_string();
    config.dust.domain = server.base_url();
    config.polling.max_attempts = 3;
    config.polling.initial_delay_ms = 1;
    config.polling.max_delay_ms = 2;
    config.polling.http_retries = 1;
    config
}

fn build_server(config: &Config) -> McpServer {
    config.validate().unwrap();
    let client = DustClient::new(config).unwrap();
    let handler = ToolHandler::new(Arc::new(client), config);
    McpServer::new(handler, config.mcp.name.clone())
}

/// Run the server over `lines` and return one parsed response per line written.
async fn exchange(server: &mut McpServer, lines: &[Value]) -> Vec<Value> {
    let input: String = lines.iter().map(|line| format!("{}\n", line)).collect();
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

fn call(id: i64, name: &str, arguments: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": {"name": name, "arguments": arguments}
    })
}

fn mock_agent_reply(server: &MockServer, user_message: &str, agent_message: &str, text: &str) {
    let user_message = user_message.to_string();
    let agent_message = agent_message.to_string();
    server.mock(|when, then| {
        when.method(GET).path(format!("{}/conv-1", BASE_PATH));
        then.status(200).json_body(json!({
            "conversation": {
                "sId": "conv-1",
                "content": [
                    [{"sId": user_message, "type": "user_message"}],
                    [{"sId": agent_message, "type": "agent_message", "parentMessageId": user_message}]
                ]
            }
        }));
    });

    let agent_message_path = format!("{}/conv-1/messages/{}/events", BASE_PATH, agent_message);
    let text = text.to_string();
    server.mock(|when, then| {
        when.method(GET).path(agent_message_path);
        then.status(200).json_body(json!({
            "events": [
                {"type": "generation_tokens", "contentBlock": {"content": text}},
                {"type": "agent_message_success"}
            ]
        }));
    });
}

#[tokio::test]
async fn test_full_session_over_mcp() {
    let dust = MockServer::start();

    let create = dust.mock(|when, then| {
        when.method(POST)
            .path(BASE_PATH)
            .header("Authorization", "Bearer sk-test")
            .body_includes("\"visibility\":\"unlisted\"");
        then.status(200)
            .json_body(json!({"conversation": {"sId": "conv-1"}}));
    });
    let post = dust.mock(|when, then| {
        when.method(POST)
            .path(format!("{}/conv-1/messages", BASE_PATH))
            .body_includes("\"content\":\"What is a stock?\"");
        then.status(200).json_body(json!({"message": {"sId": "msg-1"}}));
    });
    mock_agent_reply(&dust, "msg-1", "agent-msg-1", "An accumulation over time.");

    let config = test_config(&dust);
    let mut server = build_server(&config);

    let responses = exchange(
        &mut server,
        &[
            json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "clientInfo": {"name": "e2e", "version": "0.0.1"}
            }}),
            json!({"jsonrpc": "2.0", "method": "notifications/initialized"}),
            json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}),
            call(3, "dust_systems_thinking", json!({"query": "What is a stock?"})),
            call(4, "dust_conversation_status", json!({})),
        ],
    )
    .await;

    assert_eq!(responses.len(), 4);
    assert_eq!(responses[0]["result"]["serverInfo"]["name"], "Dust MCP Server");

    let tools = responses[1]["result"]["tools"].as_array().unwrap();
    assert!(tools.iter().any(|t| t["name"] == "dust_systems_thinking"));

    let answer = &responses[2]["result"];
    assert_eq!(answer["content"][0]["text"], "An accumulation over time.");
    assert!(answer.get("isError").is_none());

    let status = responses[3]["result"]["content"][0]["text"].as_str().unwrap();
    assert!(status.contains("Conversation: conv-1"));
    assert!(status.contains("Last message: msg-1"));

    create.assert_calls(1);
    post.assert_calls(1);
}

#[tokio::test]
async fn test_unauthorized_reports_step_one() {
    let dust = MockServer::start();

    let create = dust.mock(|when, then| {
        when.method(POST).path(BASE_PATH);
        then.status(401).body("{\"error\":\"invalid api key\"}");
    });

    let config = test_config(&dust);
    let mut server = build_server(&config);

    let responses = exchange(
        &mut server,
        &[call(1, "dust_systems_thinking", json!({"query": "hello"}))],
    )
    .await;

    let result = &responses[0]["result"];
    assert_eq!(result["isError"], true);
    let text = result["content"][0]["text"].as_str().unwrap();
    assert!(text.starts_with("Step 1: Failed to create conversation: Unauthorized"));
    create.assert_calls(1);
}

#[tokio::test]
async fn test_agent_that_never_replies() {
    let dust = MockServer::start();

    dust.mock(|when, then| {
        when.method(POST).path(BASE_PATH);
        then.status(200)
            .json_body(json!({"conversation": {"sId": "conv-1"}}));
    });
    dust.mock(|when, then| {
        when.method(POST).path(format!("{}/conv-1/messages", BASE_PATH));
        then.status(200).json_body(json!({"message": {"sId": "msg-1"}}));
    });
    let poll = dust.mock(|when, then| {
        when.method(GET).path(format!("{}/conv-1", BASE_PATH));
        then.status(200).json_body(json!({
            "conversation": {"content": [[{"sId": "msg-1", "type": "user_message"}]]}
        }));
    });

    let config = test_config(&dust);
    let mut server = build_server(&config);

    let responses = exchange(
        &mut server,
        &[call(1, "dust_systems_thinking", json!({"query": "hello"}))],
    )
    .await;

    assert_eq!(
        responses[0]["result"]["content"][0]["text"],
        "Step 3: No result after 3 attempts"
    );
    poll.assert_calls(3);
}
