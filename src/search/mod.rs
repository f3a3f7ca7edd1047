// Search module
// This module turns text queries into ranked records against the active generation


use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::index::{IndexError, Record, Scalar, SearchResult};
use crate::indexer::IndexManager;

/// Keys inside `filters` that restrict results to a set of record ids
const ID_FILTER_KEYS: [&str; 2] = ["ids", "project_ids"];

/// Post-hoc restrictions applied to the ranked output
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchFilters {
    /// Keep only these record ids
    pub ids: Option<BTreeSet<String>>,
    /// Metadata equality constraints; text compares case-insensitively
    pub metadata: BTreeMap<String, Scalar>,
}

/// A validated search request
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub text: String,
    pub k: usize,
    pub filters: SearchFilters,
}

/// One ranked hit with the record it refers to
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub record_id: String,
    pub score: f32,
    pub rank: usize,
    pub text: String,
    pub metadata: BTreeMap<String, Scalar>,
}

/// Hits from exactly one generation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResults {
    pub version: u64,
    pub hits: Vec<SearchHit>,
}

impl SearchFilters {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ids.is_none() && self.metadata.is_empty()
    }

    #[inline]
    pub fn with_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    #[inline]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Scalar>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether a record passes every constraint. Unknown metadata keys never match.
    #[inline]
    pub fn matches(&self, record: &Record) -> bool {
        if self.ids.as_ref().is_some_and(|ids| !ids.contains(&record.id)) {
            return false;
        }

        self.metadata.iter().all(|(key, expected)| {
            record
                .metadata
                .get(key)
                .is_some_and(|actual| actual.matches(expected))
        })
    }

    /// Parse a JSON `filters` object.
    ///
    /// `ids` (or `project_ids`) takes an array of ids; every other key is a
    /// metadata equality constraint whose value must be a string, number or
    /// boolean.
    #[inline]
    pub fn from_json(value: &Value) -> Result<Self, IndexError> {
        let object = match value {
            Value::Null => return Ok(Self::default()),
            Value::Object(object) => object,
            other => {
                return Err(IndexError::InvalidRequest(format!(
                    "filters must be an object, got {}",
                    json_kind(other)
                )));
            }
        };

        let mut filters = Self::default();
        for (key, value) in object {
            if ID_FILTER_KEYS.contains(&key.as_str()) {
                let ids = parse_ids(key, value)?;
                filters.ids = Some(match filters.ids.take() {
                    Some(existing) => existing.intersection(&ids).cloned().collect(),
                    None => ids,
                });
                continue;
            }

            let scalar = Scalar::from_json(value).ok_or_else(|| {
                IndexError::InvalidRequest(format!(
                    "filter '{}' must be a string, number or boolean, got {}",
                    key,
                    json_kind(value)
                ))
            })?;
            filters.metadata.insert(key.clone(), scalar);
        }

        Ok(filters)
    }
}

impl SearchRequest {
    #[inline]
    pub fn new(text: impl Into<String>, k: usize) -> Self {
        Self {
            text: text.into(),
            k,
            filters: SearchFilters::default(),
        }
    }

    #[inline]
    pub fn with_filters(mut self, filters: SearchFilters) -> Self {
        self.filters = filters;
        self
    }

    /// Validate tool arguments of the form `{query, k?, filters?}`.
    ///
    /// `k <= 0` is accepted and yields no results; a missing `k` uses
    /// `default_k`; a non-integer `k` or one above `max_k` is rejected.
    #[inline]
    pub fn from_json(args: &Value, default_k: usize, max_k: usize) -> Result<Self, IndexError> {
        let text = args
            .get("query")
            .or_else(|| args.get("text"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                IndexError::InvalidRequest("missing required string 'query'".to_string())
            })?;
        if text.trim().is_empty() {
            return Err(IndexError::InvalidRequest(
                "query must not be empty".to_string(),
            ));
        }

        let k = match args.get("k") {
            None | Some(Value::Null) => default_k,
            Some(value) => parse_k(value, max_k)?,
        };

        let filters = SearchFilters::from_json(args.get("filters").unwrap_or(&Value::Null))?;

        Ok(Self {
            text: text.to_string(),
            k,
            filters,
        })
    }
}

fn parse_k(value: &Value, max_k: usize) -> Result<usize, IndexError> {
    let k = value.as_i64().ok_or_else(|| {
        IndexError::InvalidRequest(format!("k must be an integer, got {}", value))
    })?;
    if k <= 0 {
        return Ok(0);
    }
    let k = usize::try_from(k).unwrap_or(usize::MAX);
    if k > max_k {
        return Err(IndexError::InvalidRequest(format!(
            "k must be at most {}, got {}",
            max_k, k
        )));
    }
    Ok(k)
}

fn parse_ids(key: &str, value: &Value) -> Result<BTreeSet<String>, IndexError> {
    let items = value.as_array().ok_or_else(|| {
        IndexError::InvalidRequest(format!("filter '{}' must be an array of ids", key))
    })?;
    items
        .iter()
        .map(|item| match item {
            Value::String(id) => Ok(id.clone()),
            Value::Number(id) => Ok(id.to_string()),
            other => Err(IndexError::InvalidRequest(format!(
                "filter '{}' contains a non-scalar id: {}",
                key, other
            ))),
        })
        .collect()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Answers text queries using whichever generation is active when the call starts
#[derive(Clone)]
pub struct SearchService {
    manager: Arc<IndexManager>,
}

impl SearchService {
    #[inline]
    pub fn new(manager: Arc<IndexManager>) -> Self {
        Self { manager }
    }

    #[inline]
    pub fn manager(&self) -> &Arc<IndexManager> {
        &self.manager
    }

    /// Ranked results for `text`, optionally filtered
    #[inline]
    pub async fn query(
        &self,
        text: &str,
        k: usize,
        filters: Option<&SearchFilters>,
    ) -> Result<Vec<SearchResult>, IndexError> {
        let request = SearchRequest {
            text: text.to_string(),
            k,
            filters: filters.cloned().unwrap_or_default(),
        };
        let results = self.search(&request).await?;
        Ok(results
            .hits
            .into_iter()
            .map(|hit| SearchResult {
                record_id: hit.record_id,
                score: hit.score,
                rank: hit.rank,
            })
            .collect())
    }

    /// Run a validated request, returning hits with their record payloads
    #[inline]
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResults, IndexError> {
        // Captured once; a publish during this call does not affect it
        let generation = self.manager.active().ok_or(IndexError::IndexNotReady)?;

        let embedding = self.manager.embedder().embed(&request.text).await?;

        let results = if request.filters.is_empty() {
            generation.search(&embedding, request.k)?
        } else {
            generation.search_filtered(&embedding, request.k, |record| {
                request.filters.matches(record)
            })?
        };

        debug!(
            "Query matched {} records in generation {}",
            results.len(),
            generation.version()
        );

        let hits = results
            .into_iter()
            .filter_map(|result| {
                let record = generation.record(&result.record_id)?;
                Some(SearchHit {
                    record_id: result.record_id,
                    score: result.score,
                    rank: result.rank,
                    text: record.text.clone(),
                    metadata: record.metadata.clone(),
                })
            })
            .collect();

        Ok(SearchResults {
            version: generation.version(),
            hits,
        })
    }

    /// Look a record up in the active generation, falling back to the data source
    #[inline]
    pub async fn get_record(&self, id: &str) -> Result<Option<Record>, IndexError> {
        if let Some(record) = self
            .manager
            .active()
            .and_then(|generation| generation.record(id).cloned())
        {
            return Ok(Some(record));
        }

        info!("Record {} not indexed, asking the data source", id);
        self.manager.source().get_record(id).await
    }
}
