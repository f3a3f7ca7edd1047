// Indexer module
// This module owns the active index generation and coordinates rebuilds


use arc_swap::ArcSwapOption;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::IndexConfig;
use crate::embeddings::EmbeddingProvider;
use crate::index::{IndexEntry, IndexError, IndexGeneration, Record};
use crate::source::DataSource;

pub const HEALTH_OK: &str = "OK";
pub const HEALTH_MODEL_NOT_LOADED: &str = "Degraded (Model not loaded)";
pub const HEALTH_INDEX_NOT_BUILT: &str = "Degraded (Index not built)";

type RebuildOutcome = Result<BuildReport, IndexError>;
type SharedRebuild = Shared<BoxFuture<'static, RebuildOutcome>>;

/// Tunables for [`IndexManager`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerOptions {
    /// Reuse embeddings of records whose id and text are unchanged
    pub incremental: bool,
    /// Upper bound for one whole rebuild, fetch and embedding included
    pub rebuild_timeout: Duration,
}

impl Default for ManagerOptions {
    #[inline]
    fn default() -> Self {
        Self {
            incremental: true,
            rebuild_timeout: Duration::from_secs(600),
        }
    }
}

impl From<&IndexConfig> for ManagerOptions {
    #[inline]
    fn from(config: &IndexConfig) -> Self {
        Self {
            incremental: config.incremental,
            rebuild_timeout: Duration::from_secs(config.rebuild_timeout_seconds),
        }
    }
}

/// Summary of one successful rebuild
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildReport {
    pub version: u64,
    pub records_fetched: usize,
    pub embeddings_reused: usize,
    pub embeddings_computed: usize,
    /// Records dropped because their id was already seen in the same fetch
    pub skipped: usize,
    pub duration_ms: u64,
    pub built_at: DateTime<Utc>,
}

/// Read-only health snapshot of the manager
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexStatus {
    pub status: String,
    pub model_loaded: bool,
    pub index_ready: bool,
    pub current_version: Option<u64>,
    pub indexed_vector_count: usize,
    pub dimension: Option<usize>,
    pub built_at: Option<DateTime<Utc>>,
    pub rebuilding: bool,
    pub last_build_error: Option<String>,
    pub last_build: Option<BuildReport>,
}

/// Keeps one active [`IndexGeneration`] published and refreshes it.
///
/// Readers call [`IndexManager::active`] and keep the returned `Arc` for the
/// whole query, so a concurrent publish never changes what they scan and a
/// retired generation is freed when its last reader drops it. Rebuilds are
/// single-flight: a call made while one is running awaits that rebuild's
/// outcome instead of starting another.
pub struct IndexManager {
    source: Arc<dyn DataSource>,
    embedder: Arc<dyn EmbeddingProvider>,
    options: ManagerOptions,
    active: ArcSwapOption<IndexGeneration>,
    in_flight: Mutex<Option<SharedRebuild>>,
    model_loaded: AtomicBool,
    rebuilding: AtomicBool,
    last_error: ArcSwapOption<IndexError>,
    last_build: ArcSwapOption<BuildReport>,
}

impl IndexManager {
    #[inline]
    pub fn new(
        source: Arc<dyn DataSource>,
        embedder: Arc<dyn EmbeddingProvider>,
        options: ManagerOptions,
    ) -> Self {
        Self {
            source,
            embedder,
            options,
            active: ArcSwapOption::empty(),
            in_flight: Mutex::new(None),
            model_loaded: AtomicBool::new(false),
            rebuilding: AtomicBool::new(false),
            last_error: ArcSwapOption::empty(),
            last_build: ArcSwapOption::empty(),
        }
    }

    #[inline]
    pub fn source(&self) -> &Arc<dyn DataSource> {
        &self.source
    }

    #[inline]
    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    /// The generation currently answering queries, if one was ever published
    #[inline]
    pub fn active(&self) -> Option<Arc<IndexGeneration>> {
        self.active.load_full()
    }

    /// Ask the embedding provider whether its model is available and remember the answer
    #[inline]
    pub async fn check_model(&self) -> bool {
        let loaded = self.embedder.health_check().await;
        self.model_loaded.store(loaded, Ordering::Release);
        if !loaded {
            warn!(
                "Embedding model {} is not available",
                self.embedder.model_name()
            );
        }
        loaded
    }

    /// Rebuild the index, or join the rebuild already in progress.
    ///
    /// On success the new generation is active before this returns. On any
    /// failure the active generation is left untouched and the error is
    /// recorded for [`IndexManager::status`].
    #[inline]
    pub async fn rebuild(self: &Arc<Self>) -> Result<BuildReport, IndexError> {
        let rebuild = {
            let mut slot = self.in_flight.lock().await;
            if let Some(existing) = slot.as_ref() {
                debug!("Rebuild already in progress, joining it");
                existing.clone()
            } else {
                let rebuild = self.start_rebuild();
                *slot = Some(rebuild.clone());
                rebuild
            }
        };

        rebuild.await
    }

    /// Start a rebuild in the background and return immediately
    #[inline]
    pub fn trigger_rebuild(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = manager.rebuild().await {
                warn!("Triggered rebuild failed: {}", e);
            }
        })
    }

    /// Rebuild every `interval` until the manager is dropped.
    ///
    /// Returns `None` when `interval` is zero, which disables refreshing.
    #[inline]
    pub fn spawn_refresh_loop(self: &Arc<Self>, interval: Duration) -> Option<JoinHandle<()>> {
        if interval.is_zero() {
            info!("Periodic index refresh disabled");
            return None;
        }

        let manager: Weak<Self> = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    debug!("Index manager dropped, stopping refresh loop");
                    break;
                };
                info!("Scheduled index refresh starting");
                if let Err(e) = manager.rebuild().await {
                    warn!("Scheduled rebuild failed: {}", e);
                }
            }
        }))
    }

    /// Snapshot for health reporting; never waits for a rebuild
    #[inline]
    pub fn status(&self) -> IndexStatus {
        let active = self.active.load_full();
        let model_loaded = self.model_loaded.load(Ordering::Acquire);

        let status = if !model_loaded {
            HEALTH_MODEL_NOT_LOADED
        } else if active.is_none() {
            HEALTH_INDEX_NOT_BUILT
        } else {
            HEALTH_OK
        };

        IndexStatus {
            status: status.to_string(),
            model_loaded,
            index_ready: active.is_some(),
            current_version: active.as_ref().map(|g| g.version()),
            indexed_vector_count: active.as_ref().map_or(0, |g| g.len()),
            dimension: active.as_ref().map(|g| g.dimension()),
            built_at: active.as_ref().map(|g| g.built_at()),
            rebuilding: self.rebuilding.load(Ordering::Acquire),
            last_build_error: self.last_error.load_full().map(|e| e.to_string()),
            last_build: self.last_build.load_full().map(|report| (*report).clone()),
        }
    }

    /// Spawn the rebuild task and wrap its outcome for sharing.
    ///
    /// The caller holds the `in_flight` lock, so the task cannot clear the
    /// slot before it has been filled.
    fn start_rebuild(self: &Arc<Self>) -> SharedRebuild {
        let manager = Arc::clone(self);
        let task = tokio::spawn(async move {
            manager.rebuilding.store(true, Ordering::Release);

            let worker = Arc::clone(&manager);
            let timeout = manager.options.rebuild_timeout;
            let outcome = match tokio::spawn(async move {
                tokio::time::timeout(timeout, worker.build_next_generation()).await
            })
            .await
            {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Err(IndexError::timeout("index rebuild", timeout)),
                Err(join_error) => Err(IndexError::Rebuild(join_error.to_string())),
            };

            manager.record_outcome(&outcome);
            manager.rebuilding.store(false, Ordering::Release);
            manager.in_flight.lock().await.take();
            outcome
        });

        async move {
            task.await
                .unwrap_or_else(|join_error| Err(IndexError::Rebuild(join_error.to_string())))
        }
        .boxed()
        .shared()
    }

    fn record_outcome(&self, outcome: &RebuildOutcome) {
        match outcome {
            Ok(report) => {
                info!(
                    "Index generation {} active: {} records ({} reused, {} embedded) in {}ms",
                    report.version,
                    report.records_fetched - report.skipped,
                    report.embeddings_reused,
                    report.embeddings_computed,
                    report.duration_ms
                );
                self.last_error.store(None);
                self.last_build.store(Some(Arc::new(report.clone())));
            }
            Err(e) => {
                error!("Index rebuild failed, keeping the active generation: {}", e);
                self.last_error.store(Some(Arc::new(e.clone())));
            }
        }
    }

    async fn build_next_generation(&self) -> RebuildOutcome {
        let started = Instant::now();
        self.check_model().await;

        let fetched = self.source.list_records().await?;
        let records_fetched = fetched.len();
        let records = dedupe(fetched);
        let skipped = records_fetched - records.len();
        if records.is_empty() {
            return Err(IndexError::EmptyInput);
        }

        let previous = self.active.load_full();
        let mut embeddings: Vec<Option<Vec<f32>>> = records
            .iter()
            .map(|record| {
                if !self.options.incremental {
                    return None;
                }
                let previous = previous.as_deref()?;
                previous
                    .record(&record.id)
                    .filter(|old| old.text == record.text)
                    .and_then(|_| previous.embedding(&record.id))
                    .map(<[f32]>::to_vec)
            })
            .collect();

        let pending: Vec<usize> = embeddings
            .iter()
            .enumerate()
            .filter_map(|(position, embedding)| embedding.is_none().then_some(position))
            .collect();
        let embeddings_reused = records.len() - pending.len();

        if !pending.is_empty() {
            let texts: Vec<String> = pending
                .iter()
                .map(|&position| records[position].text.clone())
                .collect();
            debug!(
                "Embedding {} records with {}",
                texts.len(),
                self.embedder.model_name()
            );
            let computed = self.embedder.embed_batch(&texts).await?;
            if computed.len() != texts.len() {
                return Err(IndexError::EmbeddingProvider(format!(
                    "expected {} embeddings, provider returned {}",
                    texts.len(),
                    computed.len()
                )));
            }
            for (position, embedding) in pending.iter().zip(computed) {
                embeddings[*position] = Some(embedding);
            }
        }

        let entries = records
            .into_iter()
            .zip(embeddings)
            .map(|(record, embedding)| IndexEntry::new(record, embedding.unwrap_or_default()))
            .collect();

        let version = previous.as_ref().map_or(1, |g| g.version() + 1);
        let generation = IndexGeneration::build(version, entries)?;
        let built_at = generation.built_at();
        self.active.store(Some(Arc::new(generation)));

        Ok(BuildReport {
            version,
            records_fetched,
            embeddings_reused,
            embeddings_computed: pending.len(),
            skipped,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            built_at,
        })
    }
}

/// Keep the first record for each id
fn dedupe(records: Vec<Record>) -> Vec<Record> {
    let mut seen = HashSet::with_capacity(records.len());
    records
        .into_iter()
        .filter(|record| {
            let fresh = seen.insert(record.id.clone());
            if !fresh {
                warn!("Duplicate record id {} from data source, skipping", record.id);
            }
            fresh
        })
        .collect()
}
