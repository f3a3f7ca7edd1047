//! MCP (Model Context Protocol) Server Implementation
//!
//! JSON-RPC 2.0 over stdio exposing project search, index maintenance and
//! grounded chat as MCP tools.

#[cfg(test)]
mod tests;

pub mod protocol;
pub mod server;
pub mod tools;

use std::sync::Arc;

use crate::chat::ChatOrchestrator;
use crate::config::IndexConfig;
use crate::search::SearchService;

pub use server::{ConnectionState, McpServer, ToolHandler};

const SERVER_INSTRUCTIONS: &str = "Semantic search over real-estate project amenities. \
Use search_records to find projects, get_record for details and chat for grounded answers.";

/// Server with every tool registered
#[inline]
pub async fn build_server(
    search: SearchService,
    chat: Arc<ChatOrchestrator>,
    index_config: &IndexConfig,
) -> Arc<McpServer> {
    let server = McpServer::new(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
        .with_instructions(SERVER_INSTRUCTIONS);
    tools::register_tools(&server, search, chat, index_config).await;
    Arc::new(server)
}
