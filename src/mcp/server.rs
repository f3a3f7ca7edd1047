//! MCP Server Implementation
//!
//! Line-delimited JSON-RPC over stdio. Every request runs on its own task
//! and responses go through one shared writer, so a slow tool call never
//! holds up `ping` or a search issued after it.

use crate::mcp::protocol::*;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Connection state tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Initializing,
    Ready,
    Closed,
}

/// Executes one tool call.
///
/// Failures the client should see belong in the returned result with
/// `is_error` set; an `Err` is reported the same way by the server.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn handle(&self, params: CallToolParams) -> Result<CallToolResult>;
}

/// MCP server state
pub struct McpServer {
    server_info: Implementation,
    instructions: Option<String>,
    tools: RwLock<BTreeMap<String, Tool>>,
    tool_handlers: RwLock<HashMap<String, Arc<dyn ToolHandler>>>,
    connection_state: RwLock<ConnectionState>,
}

impl McpServer {
    /// Create a new MCP server
    #[inline]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            server_info: Implementation {
                name: name.into(),
                version: version.into(),
            },
            instructions: None,
            tools: RwLock::new(BTreeMap::new()),
            tool_handlers: RwLock::new(HashMap::new()),
            connection_state: RwLock::new(ConnectionState::Uninitialized),
        }
    }

    #[inline]
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Register a tool with the server
    #[inline]
    pub async fn register_tool<H>(&self, tool: Tool, handler: H)
    where
        H: ToolHandler + 'static,
    {
        let tool_name = tool.name.clone();
        self.tools.write().await.insert(tool_name.clone(), tool);
        self.tool_handlers
            .write()
            .await
            .insert(tool_name.clone(), Arc::new(handler));
        debug!("Registered tool: {}", tool_name);
    }

    /// Get current connection state
    #[inline]
    pub async fn connection_state(&self) -> ConnectionState {
        *self.connection_state.read().await
    }

    /// Start the server using stdio transport
    #[inline]
    pub async fn serve_stdio(self: Arc<Self>) -> Result<()> {
        info!("Starting MCP server with stdio transport");
        self.serve(BufReader::new(io::stdin()), io::stdout()).await
    }

    /// Serve messages from `reader` until EOF, writing responses to `writer`.
    ///
    /// Returns once every in-flight request has been answered.
    #[inline]
    pub async fn serve<R, W>(self: Arc<Self>, mut reader: R, writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let writer = Arc::new(Mutex::new(writer));
        let mut in_flight = JoinSet::new();

        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => {
                    info!("EOF reached, closing connection");
                    break;
                }
                Ok(_) => {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }

                    let raw_value: Value = match serde_json::from_str(line) {
                        Ok(value) => value,
                        Err(e) => {
                            error!("Failed to parse JSON: {}", e);
                            let response =
                                JsonRpcErrorResponse::new(JsonRpcError::parse_error(), None);
                            send_message(&writer, &JsonRpcMessage::ErrorResponse(response))
                                .await?;
                            continue;
                        }
                    };

                    match parse_message(&raw_value) {
                        Ok(JsonRpcMessage::Request(request)) => {
                            let server = Arc::clone(&self);
                            let writer = Arc::clone(&writer);
                            in_flight.spawn(async move {
                                let response = server.handle_request(request).await;
                                if let Err(e) = send_message(&writer, &response).await {
                                    error!("Failed to send response: {}", e);
                                }
                            });
                        }
                        Ok(JsonRpcMessage::Notification(notification)) => {
                            self.handle_notification(notification).await;
                        }
                        Ok(JsonRpcMessage::Response(_) | JsonRpcMessage::ErrorResponse(_)) => {
                            warn!("Received unexpected response message from client");
                        }
                        Err(rpc_error) => {
                            warn!("Rejecting malformed message: {}", rpc_error.message);
                            let response =
                                JsonRpcErrorResponse::new(rpc_error, request_id_of(&raw_value));
                            send_message(&writer, &JsonRpcMessage::ErrorResponse(response))
                                .await?;
                        }
                    }
                }
                Err(e) => {
                    error!("Error reading from stdin: {}", e);
                    break;
                }
            }

            // Reap finished request tasks as we go
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!("Request task failed: {}", e);
                }
            }
        }

        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!("Request task failed: {}", e);
            }
        }

        *self.connection_state.write().await = ConnectionState::Closed;
        info!("MCP server stopped");
        Ok(())
    }

    /// Answer one request; never fails at the transport level
    #[inline]
    pub async fn handle_request(&self, request: JsonRpcRequest) -> JsonRpcMessage {
        debug!("Handling request: {}", request.method);
        let outcome = match request.method.as_str() {
            "initialize" => self.handle_initialize(request.params).await,
            "ping" => Ok(serde_json::json!({})),
            "tools/list" => self.handle_list_tools().await,
            "tools/call" => self.handle_call_tool(request.params).await,
            other => Err(JsonRpcError::method_not_found(other)),
        };

        match outcome {
            Ok(result) => JsonRpcMessage::Response(JsonRpcResponse::new(result, request.id)),
            Err(rpc_error) => {
                warn!("Request {} failed: {}", request.method, rpc_error.message);
                JsonRpcMessage::ErrorResponse(JsonRpcErrorResponse::new(
                    rpc_error,
                    Some(request.id),
                ))
            }
        }
    }

    async fn handle_notification(&self, notification: JsonRpcNotification) {
        match notification.method.as_str() {
            "initialized" | "notifications/initialized" => {
                *self.connection_state.write().await = ConnectionState::Ready;
                info!("Server ready to handle requests");
            }
            "notifications/cancelled" => {
                debug!("Received cancellation notification");
            }
            other => {
                warn!("Unknown notification method: {}", other);
            }
        }
    }

    async fn handle_initialize(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: InitializeParams = params
            .ok_or_else(|| JsonRpcError::invalid_params("Initialize request missing parameters"))
            .and_then(|p| {
                serde_json::from_value(p).map_err(|e| JsonRpcError::invalid_params(e.to_string()))
            })?;

        let protocol_version = negotiate_version(&params.protocol_version);
        if protocol_version != params.protocol_version {
            warn!(
                "Client requested protocol {}, answering with {}",
                params.protocol_version, protocol_version
            );
        }

        *self.connection_state.write().await = ConnectionState::Initializing;

        let result = InitializeResult {
            protocol_version: protocol_version.to_string(),
            capabilities: ServerCapabilities {
                tools: ToolsCapability {
                    list_changed: false,
                },
            },
            server_info: self.server_info.clone(),
            instructions: self.instructions.clone(),
        };

        info!("Client initialized: {}", params.client_info.name);
        to_result(&result)
    }

    async fn handle_list_tools(&self) -> Result<Value, JsonRpcError> {
        let tools = self.tools.read().await.values().cloned().collect();
        to_result(&ListToolsResult { tools })
    }

    async fn handle_call_tool(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: CallToolParams = params
            .ok_or_else(|| JsonRpcError::invalid_params("Tool call request missing parameters"))
            .and_then(|p| {
                serde_json::from_value(p).map_err(|e| JsonRpcError::invalid_params(e.to_string()))
            })?;

        let handler = self
            .tool_handlers
            .read()
            .await
            .get(&params.name)
            .cloned()
            .ok_or_else(|| JsonRpcError::invalid_params(format!("Unknown tool: {}", params.name)))?;

        let tool_name = params.name.clone();
        let result = match handler.handle(params).await {
            Ok(result) => result,
            Err(e) => {
                error!("Tool {} failed: {:#}", tool_name, e);
                CallToolResult::error(format!("{:#}", e))
            }
        };
        to_result(&result)
    }
}

fn to_result<T: serde::Serialize>(value: &T) -> Result<Value, JsonRpcError> {
    serde_json::to_value(value).map_err(|e| JsonRpcError::internal_error(Some(e.to_string())))
}

/// Write one message as a single line
async fn send_message<W>(writer: &Mutex<W>, message: &JsonRpcMessage) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut json = serde_json::to_string(message)?;
    json.push('\n');

    let mut writer = writer.lock().await;
    writer
        .write_all(json.as_bytes())
        .await
        .map_err(|e| anyhow!("Failed to write message: {}", e))?;
    writer.flush().await?;
    Ok(())
}
