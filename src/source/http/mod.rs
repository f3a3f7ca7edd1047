
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};
use ureq::Agent;
use url::Url;

use super::{DataSource, ProjectDocument, records_from_projects};
use crate::config::DataSourceConfig;
use crate::index::{IndexError, Record};

const USER_AGENT: &str = concat!("amenity-search/", env!("CARGO_PKG_VERSION"));
const MAX_RETRIES: u32 = 2;
const RETRY_DELAY: Duration = Duration::from_millis(500);

/// Reads projects from the data service's `/projects` endpoints
#[derive(Debug, Clone)]
pub struct HttpDataSource {
    base_url: Url,
    agent: Agent,
    timeout: Duration,
    max_retries: u32,
    retry_delay: Duration,
}

impl HttpDataSource {
    #[inline]
    pub fn new(config: &DataSourceConfig) -> Result<Self> {
        let mut base_url = Url::parse(&config.url)
            .with_context(|| format!("Invalid data service URL: {}", config.url))?;
        // Keep any path prefix when joining endpoint names
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let timeout = Duration::from_secs(config.timeout_seconds);

        Ok(Self {
            base_url,
            agent: build_agent(timeout),
            timeout,
            max_retries: MAX_RETRIES,
            retry_delay: RETRY_DELAY,
        })
    }

    #[inline]
    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    #[inline]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Fetch and parse every project the service knows about
    #[inline]
    pub async fn fetch_projects(&self) -> Result<Vec<ProjectDocument>, IndexError> {
        let url = self.endpoint("projects")?;
        let body = self
            .get(&url)
            .await?
            .ok_or_else(|| IndexError::DataSource(format!("{} returned 404", url)))?;

        let projects: Vec<ProjectDocument> = serde_json::from_str(&body).map_err(|e| {
            IndexError::DataSource(format!("Failed to parse projects from {}: {}", url, e))
        })?;
        info!("Fetched {} projects from {}", projects.len(), url);
        Ok(projects)
    }

    fn endpoint(&self, path: &str) -> Result<Url, IndexError> {
        self.base_url
            .join(path)
            .map_err(|e| IndexError::DataSource(format!("Invalid endpoint {}: {}", path, e)))
    }

    /// GET with retry; `Ok(None)` on 404
    async fn get(&self, url: &Url) -> Result<Option<String>, IndexError> {
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                debug!("Retrying request to {} (attempt {})", url, attempt + 1);
                tokio::time::sleep(self.retry_delay).await;
            }

            let agent = self.agent.clone();
            let target = url.to_string();
            let call = tokio::task::spawn_blocking(move || try_get(&agent, &target));

            // Bounded twice: the agent's global timeout and this one
            let result = match tokio::time::timeout(self.timeout + Duration::from_secs(1), call)
                .await
            {
                Err(_) => Err(anyhow!("timeout waiting for {}", url)),
                Ok(Err(join_error)) => Err(anyhow!("request task failed: {}", join_error)),
                Ok(Ok(result)) => result,
            };

            match result {
                Ok(body) => return Ok(body),
                Err(e) if is_retryable_error(&e) && attempt < self.max_retries => {
                    warn!("Retryable error for {}: {}", url, e);
                    last_error = Some(e);
                }
                Err(e) => return Err(classify(url, &e, self.timeout)),
            }
        }

        let error = last_error.unwrap_or_else(|| anyhow!("All retry attempts failed"));
        Err(classify(url, &error, self.timeout))
    }
}

#[async_trait]
impl DataSource for HttpDataSource {
    async fn list_records(&self) -> Result<Vec<Record>, IndexError> {
        let projects = self.fetch_projects().await?;
        Ok(records_from_projects(projects))
    }

    async fn get_record(&self, id: &str) -> Result<Option<Record>, IndexError> {
        let mut url = self.endpoint("projects/")?;
        let base = url.to_string();
        url.path_segments_mut()
            .map_err(|()| IndexError::DataSource(format!("{} cannot be a base", base)))?
            .pop_if_empty()
            .push(id);

        let Some(body) = self.get(&url).await? else {
            debug!("Project {} not found", id);
            return Ok(None);
        };

        let project: ProjectDocument = serde_json::from_str(&body).map_err(|e| {
            IndexError::DataSource(format!("Failed to parse project from {}: {}", url, e))
        })?;
        Ok(project.into_record())
    }
}

/// A single GET without retry logic
fn try_get(agent: &Agent, url: &str) -> Result<Option<String>> {
    debug!("Making HTTP GET request to: {}", url);

    match agent.get(url).call() {
        Ok(mut response) => {
            let text = response
                .body_mut()
                .read_to_string()
                .with_context(|| format!("Failed to read response body from {}", url))?;
            debug!("Successfully read {} bytes from {}", text.len(), url);
            Ok(Some(text))
        }
        Err(ureq::Error::StatusCode(404)) => Ok(None),
        Err(ureq::Error::StatusCode(code)) => Err(anyhow!("HTTP error {}", code)),
        Err(e) => Err(anyhow::Error::from(e))
            .with_context(|| format!("Failed to make HTTP request to {}", url)),
    }
}

/// Network timeouts, connection failures, 5xx and 429 are worth another try
fn is_retryable_error(error: &anyhow::Error) -> bool {
    let error_str = format!("{:#}", error).to_lowercase();

    error_str.contains("timeout")
        || error_str.contains("timed out")
        || error_str.contains("connection")
        || error_str.contains("http error 5")
        || error_str.contains("http error 429")
}

fn classify(url: &Url, error: &anyhow::Error, timeout: Duration) -> IndexError {
    let message = format!("{:#}", error);
    let lowered = message.to_lowercase();
    if lowered.contains("timeout") || lowered.contains("timed out") {
        IndexError::timeout(format!("GET {}", url), timeout)
    } else {
        IndexError::DataSource(message)
    }
}

fn build_agent(timeout: Duration) -> Agent {
    Agent::config_builder()
        .timeout_global(Some(timeout))
        .user_agent(USER_AGENT)
        .build()
        .into()
}
