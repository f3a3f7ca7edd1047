#[cfg(test)]
mod tests;

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::debug;

use super::{IndexError, Record, SearchResult};

/// A record paired with its embedding, as handed to [`IndexGeneration::build`]
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub record: Record,
    pub embedding: Vec<f32>,
}

/// One immutable, versioned snapshot of the searchable index.
///
/// Vectors are L2-normalised at build time and stored contiguously, so the
/// cosine similarity of a query against position `i` is a single dot product.
/// `records[i]` always describes `vector(i)`.
#[derive(Debug)]
pub struct IndexGeneration {
    version: u64,
    built_at: DateTime<Utc>,
    dimension: usize,
    vectors: Vec<f32>,
    records: Vec<Record>,
    positions: HashMap<String, usize>,
}

impl IndexEntry {
    #[inline]
    pub fn new(record: Record, embedding: Vec<f32>) -> Self {
        Self { record, embedding }
    }
}

impl IndexGeneration {
    /// Build a generation from a finite, non-empty set of entries.
    ///
    /// Fails with [`IndexError::EmptyInput`] for zero entries and with
    /// [`IndexError::DimensionMismatch`] when embeddings vary in length.
    #[inline]
    pub fn build(version: u64, entries: Vec<IndexEntry>) -> Result<Self, IndexError> {
        let dimension = entries
            .first()
            .map(|entry| entry.embedding.len())
            .ok_or(IndexError::EmptyInput)?;

        if dimension == 0 {
            return Err(IndexError::InvalidRequest(
                "embeddings must have at least one component".to_string(),
            ));
        }

        let mut vectors = Vec::with_capacity(entries.len() * dimension);
        let mut records = Vec::with_capacity(entries.len());
        let mut positions = HashMap::with_capacity(entries.len());

        for (position, entry) in entries.into_iter().enumerate() {
            if entry.embedding.len() != dimension {
                return Err(IndexError::DimensionMismatch {
                    expected: dimension,
                    actual: entry.embedding.len(),
                });
            }
            if entry.embedding.iter().any(|value| !value.is_finite()) {
                return Err(IndexError::InvalidRequest(format!(
                    "embedding for record {} contains non-finite values",
                    entry.record.id
                )));
            }
            if positions.insert(entry.record.id.clone(), position).is_some() {
                return Err(IndexError::InvalidRequest(format!(
                    "duplicate record id: {}",
                    entry.record.id
                )));
            }

            vectors.extend(normalize(&entry.embedding));
            records.push(entry.record);
        }

        debug!(
            "Built index generation {} with {} vectors of dimension {}",
            version,
            records.len(),
            dimension
        );

        Ok(Self {
            version,
            built_at: Utc::now(),
            dimension,
            vectors,
            records,
            positions,
        })
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[inline]
    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    #[inline]
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[inline]
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    #[inline]
    pub fn record(&self, id: &str) -> Option<&Record> {
        self.positions.get(id).map(|&position| &self.records[position])
    }

    /// The stored (normalised) embedding for a record id
    #[inline]
    pub fn embedding(&self, id: &str) -> Option<&[f32]> {
        self.positions
            .get(id)
            .map(|&position| self.vector(position))
    }

    /// Return up to `k` nearest records, strictly ordered by descending score
    /// with ties broken by ascending record id.
    ///
    /// `k == 0` yields an empty result; `k` larger than the generation returns
    /// every record ranked.
    #[inline]
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>, IndexError> {
        self.search_filtered(query, k, |_| true)
    }

    /// Like [`Self::search`], but excludes records rejected by `keep` before
    /// taking the top `k`, so the output is filled from the remaining ranking
    /// and re-ranked from 1.
    #[inline]
    pub fn search_filtered<F>(
        &self,
        query: &[f32],
        k: usize,
        keep: F,
    ) -> Result<Vec<SearchResult>, IndexError>
    where
        F: Fn(&Record) -> bool,
    {
        if query.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        if query.iter().any(|value| !value.is_finite()) {
            return Err(IndexError::InvalidRequest(
                "query embedding contains non-finite values".to_string(),
            ));
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let query = normalize(query);
        let mut scored: Vec<(usize, f32)> = (0..self.records.len())
            .filter(|&position| keep(&self.records[position]))
            .map(|position| (position, self.score(&query, position)))
            .collect();

        if k < scored.len() {
            scored.select_nth_unstable_by(k - 1, |a, b| self.compare(a, b));
            scored.truncate(k);
        }
        scored.sort_unstable_by(|a, b| self.compare(a, b));

        Ok(scored
            .into_iter()
            .enumerate()
            .map(|(index, (position, score))| SearchResult {
                record_id: self.records[position].id.clone(),
                score,
                rank: index + 1,
            })
            .collect())
    }

    fn vector(&self, position: usize) -> &[f32] {
        let start = position * self.dimension;
        &self.vectors[start..start + self.dimension]
    }

    fn score(&self, query: &[f32], position: usize) -> f32 {
        let score: f32 = self
            .vector(position)
            .iter()
            .zip(query)
            .map(|(a, b)| a * b)
            .sum();
        // Collapse -0.0 so equal scores always fall through to the id tie-break
        if score == 0.0 { 0.0 } else { score }
    }

    fn compare(&self, a: &(usize, f32), b: &(usize, f32)) -> Ordering {
        b.1.total_cmp(&a.1)
            .then_with(|| compare_ids(&self.records[a.0].id, &self.records[b.0].id))
    }
}

/// Ascending id order: integer ids by value and before any other id, the
/// rest lexicographically
#[inline]
pub fn compare_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<i64>(), b.parse::<i64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// L2-normalise a vector; zero vectors stay zero
#[inline]
pub fn normalize(vector: &[f32]) -> Vec<f32> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        return vector.to_vec();
    }
    vector.iter().map(|x| x / norm).collect()
}
