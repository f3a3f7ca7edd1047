use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;

use amenity_search::Result;
use amenity_search::commands::{chat_once, parse_filter, rebuild_index, search_records, serve_mcp};
use amenity_search::config::{Config, get_config_dir, run_interactive_config, show_config};

#[derive(Parser)]
#[command(name = "amenity-search")]
#[command(about = "Semantic search over project amenities with grounded chat, served over MCP")]
#[command(version)]
struct Cli {
    /// Directory holding config.toml (default: ~/.amenity-search)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure Ollama, the data source and the language model
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Start MCP server on stdio
    Serve,
    /// Build the index once and report what was indexed
    Rebuild,
    /// Build the index and run one query
    Search {
        /// Free-text query
        query: String,
        /// Maximum number of results
        #[arg(long, allow_negative_numbers = true)]
        k: Option<i64>,
        /// Metadata filter as key=value; repeat for several, ids=1,2 restricts ids
        #[arg(long = "filter", value_parser = parse_filter_arg)]
        filters: Vec<(String, Value)>,
    },
    /// Build the index and answer one message
    Chat {
        /// The message to answer
        message: String,
    },
}

fn parse_filter_arg(raw: &str) -> std::result::Result<(String, Value), String> {
    parse_filter(raw).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries MCP traffic when serving
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_dir = match cli.config_dir {
        Some(dir) => dir,
        None => get_config_dir()?,
    };

    match cli.command {
        Commands::Config { show } => {
            if show {
                show_config(&config_dir)?;
            } else {
                run_interactive_config(&config_dir)?;
            }
        }
        Commands::Serve => {
            serve_mcp(load(&config_dir)?).await?;
        }
        Commands::Rebuild => {
            rebuild_index(load(&config_dir)?).await?;
        }
        Commands::Search { query, k, filters } => {
            search_records(load(&config_dir)?, &query, k, &filters).await?;
        }
        Commands::Chat { message } => {
            chat_once(load(&config_dir)?, &message).await?;
        }
    }

    Ok(())
}

fn load(config_dir: &std::path::Path) -> anyhow::Result<Config> {
    Config::load(config_dir).context("Failed to load configuration")
}
