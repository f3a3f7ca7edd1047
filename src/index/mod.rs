// Vector index module
// Immutable, versioned generations of (record, embedding) pairs with exact cosine k-NN search

pub mod generation;
pub mod record;

pub use generation::{IndexEntry, IndexGeneration};
pub use record::{Record, Scalar, SearchResult};

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the index layer and its collaborators.
///
/// Every variant carries owned data only, so a single rebuild outcome can be
/// cloned out to every caller that attached to the same in-flight build.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IndexError {
    #[error("Cannot build an index generation from zero records")]
    EmptyInput,

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Index not ready: no generation has been published yet")]
    IndexNotReady,

    #[error("Embedding provider error: {0}")]
    EmbeddingProvider(String),

    #[error("Data source error: {0}")]
    DataSource(String),

    #[error("Timed out after {millis}ms: {operation}")]
    Timeout { operation: String, millis: u64 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Rebuild aborted: {0}")]
    Rebuild(String),
}

impl IndexError {
    /// Timeout for `operation` after waiting `budget`
    #[inline]
    pub fn timeout(operation: impl Into<String>, budget: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            millis: u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Whether the failure comes from a dependency that may recover on its own.
    ///
    /// Contract violations (`EmptyInput`, `DimensionMismatch`, `InvalidRequest`)
    /// are never transient; retrying them yields the same result.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::IndexNotReady
                | Self::EmbeddingProvider(_)
                | Self::DataSource(_)
                | Self::Timeout { .. }
                | Self::Rebuild(_)
        )
    }
}
