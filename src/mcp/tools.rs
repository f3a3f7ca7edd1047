//! MCP Tools Implementation
//!
//! Tool definitions and handlers for project search, index maintenance and
//! grounded chat.

use crate::chat::{ChatOrchestrator, ConversationTurn};
use crate::config::IndexConfig;
use crate::index::IndexError;
use crate::indexer::IndexManager;
use crate::mcp::protocol::*;
use crate::mcp::server::{McpServer, ToolHandler};
use crate::search::{SearchRequest, SearchService};
use crate::AmenityError;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, error, info};

/// `search_records` tool handler
pub struct SearchRecordsHandler {
    search: SearchService,
    default_k: usize,
    max_k: usize,
}

/// `rebuild_index` tool handler
pub struct RebuildIndexHandler {
    manager: Arc<IndexManager>,
}

/// `index_status` tool handler
pub struct IndexStatusHandler {
    manager: Arc<IndexManager>,
}

/// `get_record` tool handler
pub struct GetRecordHandler {
    search: SearchService,
}

/// `chat` tool handler
pub struct ChatHandler {
    orchestrator: Arc<ChatOrchestrator>,
}

/// Register every tool this server exposes
#[inline]
pub async fn register_tools(
    server: &McpServer,
    search: SearchService,
    chat: Arc<ChatOrchestrator>,
    index_config: &IndexConfig,
) {
    let manager = Arc::clone(search.manager());

    server
        .register_tool(
            SearchRecordsHandler::tool_definition(index_config.default_k, index_config.max_k),
            SearchRecordsHandler::new(search.clone(), index_config.default_k, index_config.max_k),
        )
        .await;
    server
        .register_tool(
            RebuildIndexHandler::tool_definition(),
            RebuildIndexHandler::new(Arc::clone(&manager)),
        )
        .await;
    server
        .register_tool(
            IndexStatusHandler::tool_definition(),
            IndexStatusHandler::new(manager),
        )
        .await;
    server
        .register_tool(
            GetRecordHandler::tool_definition(),
            GetRecordHandler::new(search),
        )
        .await;
    server
        .register_tool(ChatHandler::tool_definition(), ChatHandler::new(chat))
        .await;
}

fn index_error_result(context: &str, e: &IndexError) -> CallToolResult {
    error!("{}: {}", context, e);
    CallToolResult::error(format!("{}: {}", context, e))
}

impl SearchRecordsHandler {
    #[inline]
    pub fn new(search: SearchService, default_k: usize, max_k: usize) -> Self {
        Self {
            search,
            default_k,
            max_k,
        }
    }

    /// Create the search_records tool definition
    #[inline]
    pub fn tool_definition(default_k: usize, max_k: usize) -> Tool {
        Tool {
            name: "search_records".to_string(),
            description: Some(
                "Semantic search over indexed real-estate project descriptions".to_string(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "Free-text description of what to look for"
                    },
                    "k": {
                        "type": "integer",
                        "minimum": 0,
                        "maximum": max_k,
                        "description": format!("Maximum number of results (default: {})", default_k)
                    },
                    "filters": {
                        "type": "object",
                        "description": "Optional: metadata equality filters (e.g. {\"city\": \"Medellín\"}); \"ids\" restricts to record ids",
                        "additionalProperties": true
                    }
                },
                "required": ["query"],
                "additionalProperties": false
            }),
        }
    }
}

#[async_trait]
impl ToolHandler for SearchRecordsHandler {
    #[inline]
    async fn handle(&self, params: CallToolParams) -> Result<CallToolResult> {
        let args = params.arguments_value();
        let request = match SearchRequest::from_json(&args, self.default_k, self.max_k) {
            Ok(request) => request,
            Err(e) => return Ok(CallToolResult::error(e.to_string())),
        };

        debug!(
            "Searching records: query='{}', k={}, filters={:?}",
            request.text, request.k, request.filters
        );

        match self.search.search(&request).await {
            Ok(results) => Ok(CallToolResult::json(&json!({
                "version": results.version,
                "results": results.hits,
            }))?),
            Err(e) => Ok(index_error_result("Search error", &e)),
        }
    }
}

impl RebuildIndexHandler {
    #[inline]
    pub fn new(manager: Arc<IndexManager>) -> Self {
        Self { manager }
    }

    /// Create the rebuild_index tool definition
    #[inline]
    pub fn tool_definition() -> Tool {
        Tool {
            name: "rebuild_index".to_string(),
            description: Some(
                "Start rebuilding the index in the background and return immediately".to_string(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
        }
    }
}

#[async_trait]
impl ToolHandler for RebuildIndexHandler {
    #[inline]
    async fn handle(&self, _params: CallToolParams) -> Result<CallToolResult> {
        let already_running = self.manager.status().rebuilding;
        // Detached; progress is visible through index_status
        drop(self.manager.trigger_rebuild());
        info!("Rebuild requested over MCP");

        Ok(CallToolResult::json(&json!({
            "accepted": true,
            "already_running": already_running,
            "current_version": self.manager.active().map(|generation| generation.version()),
        }))?)
    }
}

impl IndexStatusHandler {
    #[inline]
    pub fn new(manager: Arc<IndexManager>) -> Self {
        Self { manager }
    }

    /// Create the index_status tool definition
    #[inline]
    pub fn tool_definition() -> Tool {
        Tool {
            name: "index_status".to_string(),
            description: Some("Report index readiness and embedding model health".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
        }
    }
}

#[async_trait]
impl ToolHandler for IndexStatusHandler {
    #[inline]
    async fn handle(&self, _params: CallToolParams) -> Result<CallToolResult> {
        Ok(CallToolResult::json(&self.manager.status())?)
    }
}

impl GetRecordHandler {
    #[inline]
    pub fn new(search: SearchService) -> Self {
        Self { search }
    }

    /// Create the get_record tool definition
    #[inline]
    pub fn tool_definition() -> Tool {
        Tool {
            name: "get_record".to_string(),
            description: Some("Fetch one project record by id".to_string()),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "id": {
                        "type": ["string", "integer"],
                        "description": "Record id"
                    }
                },
                "required": ["id"],
                "additionalProperties": false
            }),
        }
    }
}

#[async_trait]
impl ToolHandler for GetRecordHandler {
    #[inline]
    async fn handle(&self, params: CallToolParams) -> Result<CallToolResult> {
        let args = params.arguments_value();
        let id = match args.get("id") {
            Some(Value::String(id)) if !id.trim().is_empty() => id.trim().to_string(),
            Some(Value::Number(id)) => id.to_string(),
            _ => return Ok(CallToolResult::error("Missing required parameter: id")),
        };

        match self.search.get_record(&id).await {
            Ok(Some(record)) => Ok(CallToolResult::json(&record)?),
            Ok(None) => Ok(CallToolResult::error(format!("Record not found: {}", id))),
            Err(e) => Ok(index_error_result("Record lookup failed", &e)),
        }
    }
}

impl ChatHandler {
    #[inline]
    pub fn new(orchestrator: Arc<ChatOrchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Create the chat tool definition
    #[inline]
    pub fn tool_definition() -> Tool {
        Tool {
            name: "chat".to_string(),
            description: Some(
                "Answer a message about real-estate projects, grounded in search results"
                    .to_string(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "current_message": {
                        "type": "string",
                        "description": "The user's message"
                    },
                    "conversation_history": {
                        "type": "array",
                        "description": "Optional: earlier turns, oldest first",
                        "items": {
                            "type": "object",
                            "properties": {
                                "role": {"type": "string", "enum": ["system", "user", "assistant"]},
                                "content": {"type": "string"}
                            },
                            "required": ["role", "content"]
                        }
                    }
                },
                "required": ["current_message"],
                "additionalProperties": false
            }),
        }
    }
}

#[async_trait]
impl ToolHandler for ChatHandler {
    #[inline]
    async fn handle(&self, params: CallToolParams) -> Result<CallToolResult> {
        let args = params.arguments_value();
        let Some(message) = args.get("current_message").and_then(Value::as_str) else {
            return Ok(CallToolResult::error(
                "Missing required parameter: current_message",
            ));
        };

        let history: Vec<ConversationTurn> = match args.get("conversation_history") {
            None | Some(Value::Null) => Vec::new(),
            Some(value) => match serde_json::from_value(value.clone()) {
                Ok(history) => history,
                Err(e) => {
                    return Ok(CallToolResult::error(format!(
                        "Invalid conversation_history: {}",
                        e
                    )));
                }
            },
        };

        match self.orchestrator.handle_turn(message, &history).await {
            Ok(response) => Ok(CallToolResult::json(&response)?),
            Err(AmenityError::Index(e)) => Ok(CallToolResult::error(e.to_string())),
            Err(e) => {
                error!("Chat turn failed: {}", e);
                Ok(CallToolResult::error(format!("Chat failed: {}", e)))
            }
        }
    }
}
