//! MCP (Model Context Protocol) server for dustlink.
//!
//! Exposes the configured Dust agent as MCP tools over newline-delimited
//! JSON-RPC on stdin/stdout.

pub mod handlers;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

pub use handlers::ToolHandler;
pub use server::McpServer;
pub use session::Session;
