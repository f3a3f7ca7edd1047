use anyhow::{Context, Result, anyhow};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::chat::{ChatOptions, ChatOrchestrator};
use crate::config::Config;
use crate::embeddings::EmbeddingProvider;
use crate::embeddings::ollama::OllamaClient;
use crate::index::Scalar;
use crate::indexer::{BuildReport, IndexManager, ManagerOptions};
use crate::llm::OpenAiClient;
use crate::search::{SearchRequest, SearchService};
use crate::source;
use crate::AmenityError;

/// Everything a command needs, wired from one configuration
pub struct Services {
    pub config: Config,
    pub manager: Arc<IndexManager>,
    pub search: SearchService,
    pub chat: Arc<ChatOrchestrator>,
}

impl Services {
    /// Connect the data source, embedding model and language model named in `config`
    #[inline]
    pub fn from_config(config: Config) -> Result<Self> {
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(
            OllamaClient::new(&config.ollama).context("Failed to create Ollama client")?,
        );
        let data_source =
            source::from_config(&config.data_source).context("Failed to create data source")?;
        let manager = Arc::new(IndexManager::new(
            data_source,
            embedder,
            ManagerOptions::from(&config.index),
        ));
        let search = SearchService::new(Arc::clone(&manager));

        let llm = OpenAiClient::new(&config.llm).context("Failed to create language model client")?;
        if config.llm.api_key.is_none() {
            warn!("No language model API key configured; chat requests may be rejected");
        }
        let chat = Arc::new(ChatOrchestrator::new(
            search.clone(),
            Arc::new(llm),
            ChatOptions::from(&config.chat),
        ));

        Ok(Self {
            config,
            manager,
            search,
            chat,
        })
    }
}

/// Parse a `key=value` filter; the value is read as JSON when it is a scalar
/// literal (`3`, `true`) and as text otherwise
#[inline]
pub fn parse_filter(raw: &str) -> Result<(String, Value)> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("Filter must look like key=value: {}", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(anyhow!("Filter key must not be empty: {}", raw));
    }

    let value = value.trim();
    let value = if key == "ids" || key == "project_ids" {
        Value::Array(
            value
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(|id| Value::String(id.to_string()))
                .collect(),
        )
    } else {
        match serde_json::from_str::<Value>(value) {
            Ok(parsed) if Scalar::from_json(&parsed).is_some() => parsed,
            _ => Value::String(value.to_string()),
        }
    };
    Ok((key.to_string(), value))
}

/// Validate CLI search arguments the same way MCP arguments are validated
#[inline]
pub fn build_search_request(
    config: &Config,
    query: &str,
    k: Option<i64>,
    filters: &[(String, Value)],
) -> Result<SearchRequest> {
    let mut args = Map::new();
    args.insert("query".to_string(), Value::String(query.to_string()));
    if let Some(k) = k {
        args.insert("k".to_string(), json!(k));
    }
    if !filters.is_empty() {
        args.insert(
            "filters".to_string(),
            Value::Object(filters.iter().cloned().collect()),
        );
    }

    Ok(SearchRequest::from_json(
        &Value::Object(args),
        config.index.default_k,
        config.index.max_k,
    )?)
}

fn spinner(message: &str) -> ProgressBar {
    let bar = if console::user_attended_stderr() {
        match ProgressStyle::with_template("{spinner} {msg} [{elapsed}]") {
            Ok(template) => ProgressBar::new_spinner().with_style(template),
            Err(_) => ProgressBar::new_spinner(),
        }
    } else {
        ProgressBar::hidden()
    };
    bar.set_message(message.to_string());
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

/// Build one generation, showing a spinner while it runs
async fn build_with_spinner(manager: &Arc<IndexManager>) -> Result<BuildReport> {
    let bar = spinner("Building index");
    let outcome = manager.rebuild().await;
    bar.finish_and_clear();
    outcome.context("Index rebuild failed")
}

fn print_report(report: &BuildReport) {
    println!(
        "{} Index generation {} published",
        style("✓").green(),
        style(report.version).bold()
    );
    println!("  Records fetched: {}", report.records_fetched);
    println!("  Embeddings computed: {}", report.embeddings_computed);
    println!("  Embeddings reused: {}", report.embeddings_reused);
    if report.skipped > 0 {
        println!("  Duplicate ids skipped: {}", report.skipped);
    }
    println!("  Duration: {} ms", report.duration_ms);
}

/// Fetch, embed and publish once, then report
#[inline]
pub async fn rebuild_index(config: Config) -> Result<()> {
    let services = Services::from_config(config)?;
    let report = build_with_spinner(&services.manager).await?;
    print_report(&report);
    Ok(())
}

/// Build an index and run one query against it
#[inline]
pub async fn search_records(
    config: Config,
    query: &str,
    k: Option<i64>,
    filters: &[(String, Value)],
) -> Result<()> {
    let request = build_search_request(&config, query, k, filters)?;
    let services = Services::from_config(config)?;
    build_with_spinner(&services.manager).await?;

    let results = services.search.search(&request).await?;
    if results.hits.is_empty() {
        println!("No matching projects.");
        return Ok(());
    }

    println!(
        "Results from index generation {}:",
        style(results.version).bold()
    );
    for hit in &results.hits {
        println!();
        println!(
            "{}. {} (score {:.3})",
            hit.rank,
            style(format!("[{}]", hit.record_id)).cyan(),
            hit.score
        );
        println!("   {}", hit.text);
        for (key, value) in &hit.metadata {
            println!("   {}: {}", style(key).dim(), value);
        }
    }
    Ok(())
}

/// Build an index and answer one chat message
#[inline]
pub async fn chat_once(config: Config, message: &str) -> Result<()> {
    let services = Services::from_config(config)?;
    if let Err(e) = build_with_spinner(&services.manager).await {
        // The orchestrator degrades without an index
        warn!("{:#}", e);
    }

    let bar = spinner("Waiting for the language model");
    let outcome = services.chat.handle_turn(message, &[]).await;
    bar.finish_and_clear();
    let response = outcome?;

    println!("{}", response.response);
    if response.degraded {
        eprintln!(
            "{} answered without project records: {}",
            style("⚠").yellow(),
            response.degraded_reason.as_deref().unwrap_or("unknown reason")
        );
    } else if !response.used_results.is_empty() {
        let ids: Vec<&str> = response
            .used_results
            .iter()
            .map(|result| result.record_id.as_str())
            .collect();
        eprintln!("{} {}", style("Sources:").dim(), ids.join(", "));
    }
    Ok(())
}

/// Serve MCP over stdio with a background build and periodic refresh
#[inline]
pub async fn serve_mcp(config: Config) -> Result<()> {
    let services = Services::from_config(config)?;
    let index_config = services.config.index.clone();

    let ollama_url = services.config.ollama_url()?;
    if services.manager.check_model().await {
        info!(
            "Ollama reachable at {} with model {}",
            ollama_url, services.config.ollama.model
        );
    } else {
        warn!(
            "Ollama at {} is not ready; searches fail until the model is available",
            ollama_url
        );
    }

    // Initial build runs in the background; tools report not-ready until it lands
    drop(services.manager.trigger_rebuild());
    let refresh = services
        .manager
        .spawn_refresh_loop(Duration::from_secs(index_config.refresh_interval_seconds));

    let server = crate::mcp::build_server(
        services.search.clone(),
        Arc::clone(&services.chat),
        &index_config,
    )
    .await;

    info!("MCP server listening on stdio");
    let outcome = tokio::select! {
        result = Arc::clone(&server).serve_stdio() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received interrupt signal, shutting down");
            Ok(())
        }
    };

    if let Some(handle) = refresh {
        handle.abort();
    }
    outcome.map_err(|e| {
        error!("MCP server error: {:#}", e);
        AmenityError::Mcp(format!("{:#}", e)).into()
    })
}
