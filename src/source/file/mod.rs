#[cfg(test)]
mod tests;

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::info;

use super::{DataSource, ProjectDocument, records_from_projects};
use crate::index::{IndexError, Record};

/// Reads the project array from a local JSON file on every call
#[derive(Debug, Clone)]
pub struct FileDataSource {
    path: PathBuf,
}

impl FileDataSource {
    #[inline]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_projects(&self) -> Result<Vec<ProjectDocument>, IndexError> {
        let content = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            IndexError::DataSource(format!("Failed to read {}: {}", self.path.display(), e))
        })?;
        let projects: Vec<ProjectDocument> = serde_json::from_str(&content).map_err(|e| {
            IndexError::DataSource(format!("Failed to parse {}: {}", self.path.display(), e))
        })?;
        info!(
            "Loaded {} projects from {}",
            projects.len(),
            self.path.display()
        );
        Ok(projects)
    }
}

#[async_trait]
impl DataSource for FileDataSource {
    async fn list_records(&self) -> Result<Vec<Record>, IndexError> {
        Ok(records_from_projects(self.read_projects().await?))
    }

    async fn get_record(&self, id: &str) -> Result<Option<Record>, IndexError> {
        Ok(self
            .read_projects()
            .await?
            .into_iter()
            .find(|project| project.id == id)
            .and_then(ProjectDocument::into_record))
    }
}
