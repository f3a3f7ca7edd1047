//! MCP server tests: protocol parsing, the stdio loop and each tool.

use super::protocol::*;
use super::tools::*;
use super::*;
use crate::chat::ChatOptions;
use crate::embeddings::EmbeddingProvider;
use crate::index::{IndexError, Record};
use crate::indexer::{IndexManager, ManagerOptions};
use crate::llm::{ChatMessage, LanguageModel};
use crate::source::DataSource;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::io::{AsyncReadExt, BufReader};

const VOCABULARY: [&str; 4] = ["pool", "gym", "rooftop", "garden"];

struct FixedSource;

#[async_trait]
impl DataSource for FixedSource {
    async fn list_records(&self) -> Result<Vec<Record>, IndexError> {
        Ok(vec![
            Record::new("1", "pool, gym").with_metadata("city", "Medellín"),
            Record::new("2", "rooftop garden").with_metadata("city", "Bogotá"),
        ])
    }

    async fn get_record(&self, id: &str) -> Result<Option<Record>, IndexError> {
        Ok(self
            .list_records()
            .await?
            .into_iter()
            .find(|record| record.id == id))
    }
}

struct BagOfWords;

#[async_trait]
impl EmbeddingProvider for BagOfWords {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, IndexError> {
        let lowered = text.to_lowercase();
        Ok(VOCABULARY
            .iter()
            .map(|word| lowered.matches(word).count() as f32)
            .collect())
    }

    fn model_name(&self) -> &str {
        "bag-of-words"
    }
}

/// Replies with how many messages the prompt had
struct CountingModel;

#[async_trait]
impl LanguageModel for CountingModel {
    async fn generate(&self, messages: &[ChatMessage]) -> crate::Result<String> {
        Ok(format!("{} messages", messages.len()))
    }

    fn model_name(&self) -> &str {
        "counting"
    }
}

struct SlowTool;

#[async_trait]
impl ToolHandler for SlowTool {
    async fn handle(&self, _params: CallToolParams) -> anyhow::Result<CallToolResult> {
        tokio::time::sleep(Duration::from_millis(300)).await;
        Ok(CallToolResult::json(&json!({"done": true}))?)
    }
}

struct BrokenTool;

#[async_trait]
impl ToolHandler for BrokenTool {
    async fn handle(&self, _params: CallToolParams) -> anyhow::Result<CallToolResult> {
        Err(anyhow::anyhow!("disk on fire"))
    }
}

fn search_service() -> SearchService {
    let manager = Arc::new(IndexManager::new(
        Arc::new(FixedSource),
        Arc::new(BagOfWords),
        ManagerOptions::default(),
    ));
    SearchService::new(manager)
}

async fn server_for(search: SearchService) -> Arc<McpServer> {
    let chat = Arc::new(ChatOrchestrator::new(
        search.clone(),
        Arc::new(CountingModel),
        ChatOptions::default(),
    ));
    build_server(search, chat, &IndexConfig::default()).await
}

fn call(name: &str, arguments: Value) -> CallToolParams {
    serde_json::from_value(json!({"name": name, "arguments": arguments})).expect("valid params")
}

fn payload(result: &CallToolResult) -> Value {
    serde_json::from_str(&result.text()).expect("tool output is JSON")
}

/// Feed `lines` to the server and collect every response it writes
async fn run_session(server: Arc<McpServer>, lines: &[String]) -> Vec<Value> {
    let input = lines.join("\n") + "\n";
    let (writer, mut output) = tokio::io::duplex(1 << 20);

    server
        .serve(BufReader::new(input.as_bytes()), writer)
        .await
        .expect("session completes");

    let mut text = String::new();
    output.read_to_string(&mut text).await.expect("readable");
    text.lines()
        .map(|line| serde_json::from_str(line).expect("each line is JSON"))
        .collect()
}

fn response_with_id(responses: &[Value], id: i64) -> &Value {
    responses
        .iter()
        .find(|response| response["id"] == json!(id))
        .unwrap_or_else(|| panic!("no response with id {}", id))
}

#[test]
fn parse_message_classifies_envelopes() {
    let request = parse_message(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}));
    assert!(matches!(request, Ok(JsonRpcMessage::Request(_))));

    let notification = parse_message(&json!({"jsonrpc": "2.0", "method": "initialized"}));
    assert!(matches!(notification, Ok(JsonRpcMessage::Notification(_))));

    let response = parse_message(&json!({"jsonrpc": "2.0", "id": "a", "result": {}}));
    assert!(matches!(response, Ok(JsonRpcMessage::Response(_))));

    for invalid in [
        json!([1, 2]),
        json!({"id": 1, "method": "ping"}),
        json!({"jsonrpc": "1.0", "id": 1, "method": "ping"}),
        json!({"jsonrpc": "2.0", "id": 1, "method": 5}),
        json!({"jsonrpc": "2.0", "id": 1}),
    ] {
        assert_eq!(
            parse_message(&invalid).map(|_| ()),
            Err(JsonRpcError::invalid_request()),
            "{}",
            invalid
        );
    }
}

#[test]
fn version_negotiation_falls_back_to_latest() {
    assert_eq!(negotiate_version("2024-11-05"), "2024-11-05");
    assert_eq!(negotiate_version("1999-01-01"), MCP_VERSION);
}

#[test]
fn search_records_definition_requires_query() {
    let tool = SearchRecordsHandler::tool_definition(5, 50);
    assert_eq!(tool.name, "search_records");

    let schema = tool.input_schema;
    let properties = schema["properties"].as_object().expect("has properties");
    assert!(properties.contains_key("query"));
    assert!(properties.contains_key("k"));
    assert!(properties.contains_key("filters"));
    assert_eq!(schema["properties"]["k"]["maximum"], 50);
    assert_eq!(schema["required"], json!(["query"]));
}

#[test]
fn parameterless_tools_take_no_arguments() {
    for tool in [
        RebuildIndexHandler::tool_definition(),
        IndexStatusHandler::tool_definition(),
    ] {
        let properties = tool.input_schema["properties"]
            .as_object()
            .expect("has properties");
        assert!(properties.is_empty(), "{}", tool.name);
    }
}

#[tokio::test]
async fn session_lists_every_tool() {
    let server = server_for(search_service()).await;
    let responses = run_session(
        Arc::clone(&server),
        &[
            json!({
                "jsonrpc": "2.0", "id": 1, "method": "initialize",
                "params": {
                    "protocolVersion": MCP_VERSION,
                    "capabilities": {},
                    "clientInfo": {"name": "test-client", "version": "0.0.1"}
                }
            })
            .to_string(),
            json!({"jsonrpc": "2.0", "method": "notifications/initialized"}).to_string(),
            json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list"}).to_string(),
            json!({"jsonrpc": "2.0", "id": 3, "method": "ping"}).to_string(),
        ],
    )
    .await;

    let init = response_with_id(&responses, 1);
    assert_eq!(init["result"]["protocolVersion"], MCP_VERSION);
    assert_eq!(init["result"]["serverInfo"]["name"], "amenity-search");
    assert!(init["result"]["capabilities"]["tools"].is_object());

    let names: Vec<&str> = response_with_id(&responses, 2)["result"]["tools"]
        .as_array()
        .expect("tool list")
        .iter()
        .filter_map(|tool| tool["name"].as_str())
        .collect();
    assert_eq!(
        names,
        vec![
            "chat",
            "get_record",
            "index_status",
            "rebuild_index",
            "search_records"
        ]
    );

    assert_eq!(response_with_id(&responses, 3)["result"], json!({}));
    assert_eq!(server.connection_state().await, ConnectionState::Closed);
}

#[tokio::test]
async fn malformed_input_gets_json_rpc_errors() {
    let server = server_for(search_service()).await;
    let responses = run_session(
        server,
        &[
            "{not json".to_string(),
            json!({"jsonrpc": "2.0", "id": 7}).to_string(),
            json!({"jsonrpc": "2.0", "id": 8, "method": "resources/list"}).to_string(),
            json!({"jsonrpc": "2.0", "id": 9, "method": "tools/call", "params": {"name": "nope"}})
                .to_string(),
        ],
    )
    .await;

    assert_eq!(responses.len(), 4);
    let parse_error = responses
        .iter()
        .find(|response| response["id"].is_null())
        .expect("parse error response");
    assert_eq!(parse_error["error"]["code"], error_codes::PARSE_ERROR);
    assert_eq!(
        response_with_id(&responses, 7)["error"]["code"],
        error_codes::INVALID_REQUEST
    );
    assert_eq!(
        response_with_id(&responses, 8)["error"]["code"],
        error_codes::METHOD_NOT_FOUND
    );
    assert_eq!(
        response_with_id(&responses, 9)["error"]["code"],
        error_codes::INVALID_PARAMS
    );
}

#[tokio::test]
async fn slow_tool_does_not_block_other_requests() {
    let server = McpServer::new("test", "0");
    server
        .register_tool(
            Tool {
                name: "slow".to_string(),
                description: None,
                input_schema: json!({"type": "object"}),
            },
            SlowTool,
        )
        .await;

    let responses = run_session(
        Arc::new(server),
        &[
            json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {"name": "slow"}})
                .to_string(),
            json!({"jsonrpc": "2.0", "id": 2, "method": "ping"}).to_string(),
        ],
    )
    .await;

    let ids: Vec<&Value> = responses.iter().map(|response| &response["id"]).collect();
    assert_eq!(ids, vec![&json!(2), &json!(1)]);
    assert_eq!(responses[1]["result"]["isError"], false);
}

#[tokio::test]
async fn handler_errors_become_error_results() {
    let server = McpServer::new("test", "0");
    server
        .register_tool(
            Tool {
                name: "broken".to_string(),
                description: None,
                input_schema: json!({"type": "object"}),
            },
            BrokenTool,
        )
        .await;

    let request: JsonRpcRequest = serde_json::from_value(json!({
        "jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {"name": "broken"}
    }))
    .expect("valid request");

    match server.handle_request(request).await {
        JsonRpcMessage::Response(response) => {
            assert_eq!(response.result["isError"], true);
            assert_eq!(response.result["content"][0]["text"], "disk on fire");
        }
        other => panic!("expected a tool result, got {:?}", other),
    }
}

#[tokio::test]
async fn search_before_build_is_an_error_result() {
    let handler = SearchRecordsHandler::new(search_service(), 5, 50);
    let result = handler
        .handle(call("search_records", json!({"query": "pool"})))
        .await
        .expect("handled");
    assert!(result.is_error);
    assert!(result.text().contains("not ready"), "{}", result.text());
}

#[tokio::test]
async fn search_records_returns_ranked_hits() {
    let search = search_service();
    search.manager().rebuild().await.expect("rebuild succeeds");
    let handler = SearchRecordsHandler::new(search, 5, 50);

    let result = handler
        .handle(call(
            "search_records",
            json!({"query": "swimming pool", "k": 1}),
        ))
        .await
        .expect("handled");
    assert!(!result.is_error);

    let body = payload(&result);
    assert_eq!(body["version"], 1);
    assert_eq!(body["results"].as_array().map(Vec::len), Some(1));
    assert_eq!(body["results"][0]["record_id"], "1");
    assert_eq!(body["results"][0]["metadata"]["city"], "Medellín");

    let invalid = handler
        .handle(call("search_records", json!({"query": "pool", "k": 500})))
        .await
        .expect("handled");
    assert!(invalid.is_error);
}

#[tokio::test]
async fn rebuild_tool_returns_immediately_and_status_catches_up() {
    let search = search_service();
    let manager = Arc::clone(search.manager());
    let rebuild = RebuildIndexHandler::new(Arc::clone(&manager));
    let status = IndexStatusHandler::new(Arc::clone(&manager));

    let before = payload(
        &status
            .handle(call("index_status", json!({})))
            .await
            .expect("handled"),
    );
    assert_eq!(before["index_ready"], false);

    let accepted = payload(
        &rebuild
            .handle(call("rebuild_index", json!({})))
            .await
            .expect("handled"),
    );
    assert_eq!(accepted["accepted"], true);

    let mut ready = false;
    for _ in 0..100 {
        if manager.status().index_ready {
            ready = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(ready, "background rebuild never published");

    let after = payload(
        &status
            .handle(call("index_status", json!({})))
            .await
            .expect("handled"),
    );
    assert_eq!(after["current_version"], 1);
    assert_eq!(after["indexed_vector_count"], 2);
}

#[tokio::test]
async fn get_record_accepts_string_or_number_ids() {
    let handler = GetRecordHandler::new(search_service());

    let found = handler
        .handle(call("get_record", json!({"id": 2})))
        .await
        .expect("handled");
    assert!(!found.is_error);
    assert_eq!(payload(&found)["text"], "rooftop garden");

    let missing = handler
        .handle(call("get_record", json!({"id": "99"})))
        .await
        .expect("handled");
    assert!(missing.is_error);

    let no_id = handler
        .handle(call("get_record", json!({})))
        .await
        .expect("handled");
    assert!(no_id.is_error);
}

#[tokio::test]
async fn chat_tool_degrades_before_build() {
    let search = search_service();
    let handler = ChatHandler::new(Arc::new(ChatOrchestrator::new(
        search,
        Arc::new(CountingModel),
        ChatOptions::default(),
    )));

    let result = handler
        .handle(call(
            "chat",
            json!({
                "current_message": "Any pools?",
                "conversation_history": [
                    {"role": "user", "content": "Hi"},
                    {"role": "assistant", "content": "Hello!"}
                ]
            }),
        ))
        .await
        .expect("handled");
    assert!(!result.is_error);

    let body = payload(&result);
    assert_eq!(body["response"], "5 messages");
    assert_eq!(body["degraded"], true);

    let bad_history = handler
        .handle(call(
            "chat",
            json!({"current_message": "Hi", "conversation_history": [{"role": "robot"}]}),
        ))
        .await
        .expect("handled");
    assert!(bad_history.is_error);

    let empty = handler
        .handle(call("chat", json!({"current_message": " "})))
        .await
        .expect("handled");
    assert!(empty.is_error);
}
