use thiserror::Error;

pub type Result<T> = std::result::Result<T, AmenityError>;

#[derive(Error, Debug)]
pub enum AmenityError {
    #[error(transparent)]
    Index(#[from] index::IndexError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Language model error: {0}")]
    LanguageModel(String),

    #[error("MCP error: {0}")]
    Mcp(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AmenityError {
    #[inline]
    fn from(error: config::ConfigError) -> Self {
        Self::Config(error.to_string())
    }
}

pub mod chat;
pub mod commands;
pub mod config;
pub mod embeddings;
pub mod index;
pub mod indexer;
pub mod llm;
pub mod mcp;
pub mod search;
pub mod source;
