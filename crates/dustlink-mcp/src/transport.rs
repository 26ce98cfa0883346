//! Transport layer for MCP JSON-RPC communication.
//!
//! MCP over stdio is newline-delimited JSON: one message per line on stdin,
//! one response per line on stdout. Nothing else may be written to stdout.

use std::io;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::protocol::{JsonRpcError, JsonRpcNotification, JsonRpcRequest, RequestId};

/// Message received from the client.
#[derive(Debug)]
pub enum IncomingMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    /// A line that is not a valid JSON-RPC message. Carries the ID when one
    /// could be recovered.
    Malformed(RequestId, JsonRpcError),
}

/// Line-oriented JSON-RPC transport.
pub struct Transport<R, W> {
    reader: R,
    writer: W,
}

pub type StdioTransport = Transport<BufReader<tokio::io::Stdin>, tokio::io::Stdout>;

impl StdioTransport {
    pub fn stdio() -> Self {
        Transport::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout())
    }
}

impl<R, W> Transport<R, W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    /// Read the next message. Blank lines are skipped; `Ok(None)` means EOF.
    pub async fn read_message(&mut self) -> io::Result<Option<IncomingMessage>> {
        let mut line = String::new();

        loop {
            line.clear();
            if self.reader.read_line(&mut line).await? == 0 {
                return Ok(None);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            tracing::debug!("Received: {}", trimmed);
            return Ok(Some(classify(trimmed)));
        }
    }

    /// Write one message as a single line and flush.
    pub async fn write_message<T: Serialize>(&mut self, message: &T) -> io::Result<()> {
        let mut json = serde_json::to_string(message).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("Serialization error: {}", e))
        })?;

        tracing::debug!("Sending: {}", json);

        json.push('\n');
        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await
    }

    /// Consume the transport and return the writer.
    pub fn into_writer(self) -> W {
        self.writer
    }
}

fn classify(line: &str) -> IncomingMessage {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!("Failed to parse message: {}", line);
            return IncomingMessage::Malformed(
                RequestId::Null,
                JsonRpcError::parse_error(&e.to_string()),
            );
        }
    };

    let id = value
        .get("id")
        .and_then(|id| serde_json::from_value::<RequestId>(id.clone()).ok());

    match id {
        Some(id) => match serde_json::from_value::<JsonRpcRequest>(value) {
            Ok(request) => IncomingMessage::Request(request),
            Err(e) => IncomingMessage::Malformed(id, JsonRpcError::invalid_request(&e.to_string())),
        },
        None => match serde_json::from_value::<JsonRpcNotification>(value) {
            Ok(notification) => IncomingMessage::Notification(notification),
            Err(e) => IncomingMessage::Malformed(
                RequestId::Null,
                JsonRpcError::invalid_request(&e.to_string()),
            ),
        },
    }
}
