// Data source module
// This module fetches the records to index from the project data service or a local file

pub mod file;
pub mod http;
pub mod project;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{DataSourceConfig, DataSourceKind};
use crate::index::{IndexError, Record};

pub use file::FileDataSource;
pub use http::HttpDataSource;
pub use project::ProjectDocument;

/// Supplies the current set of records at build time.
///
/// Sources are polled, never pushed, and may be eventually consistent.
/// Failures are reported as [`IndexError::DataSource`] or [`IndexError::Timeout`].
#[async_trait]
pub trait DataSource: Send + Sync {
    async fn list_records(&self) -> Result<Vec<Record>, IndexError>;

    /// Fetch one record; `Ok(None)` when the source does not know the id
    async fn get_record(&self, id: &str) -> Result<Option<Record>, IndexError>;
}

/// Build the configured data source
#[inline]
pub fn from_config(config: &DataSourceConfig) -> anyhow::Result<Arc<dyn DataSource>> {
    match config.kind {
        DataSourceKind::Http => Ok(Arc::new(HttpDataSource::new(config)?)),
        DataSourceKind::File => {
            let path = config
                .path
                .clone()
                .ok_or_else(|| anyhow::anyhow!("Data source of kind 'file' requires a path"))?;
            Ok(Arc::new(FileDataSource::new(path)))
        }
    }
}

/// Convert project documents into records, dropping those without text
pub(crate) fn records_from_projects(projects: Vec<ProjectDocument>) -> Vec<Record> {
    projects
        .into_iter()
        .filter_map(ProjectDocument::into_record)
        .collect()
}
