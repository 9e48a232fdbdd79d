//! Vector store adapter.
//!
//! The [`VectorStore`] trait owns the collection of embedded chunks. All
//! writes for one source go through [`VectorStore::replace_source`] so that
//! readers never see a changed source's old and new chunks side by side.
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`upsert`](VectorStore::upsert) | Write or overwrite chunks by id |
//! | [`replace_source`](VectorStore::replace_source) | Delete a source's chunks and write new ones atomically |
//! | [`delete_by_source`](VectorStore::delete_by_source) | Remove every chunk of a source |
//! | [`query`](VectorStore::query) | Nearest chunks by cosine similarity |
//! | [`count`](VectorStore::count) / [`clear`](VectorStore::clear) | Size and reset |
//!
//! Implementations: [`SqliteVectorStore`] (persistent) and
//! [`MemoryVectorStore`] (tests and throwaway runs).

pub mod memory;
pub mod sqlite;

pub use memory::MemoryVectorStore;
pub use sqlite::SqliteVectorStore;

use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::error::StoreError;
use crate::models::{Chunk, EmbeddedChunk, Hit, GLOBAL_SCOPE};

/// Metadata keys accepted for equality filtering.
const FILTER_KEYS: &[&str] = &["path", "ext", "fingerprint"];

/// Restricts which chunks a query may return.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryFilter {
    pub path_prefix: Option<String>,
    /// Allowed chunk scopes; empty means any scope.
    pub scopes: Vec<String>,
    /// Exact matches on `path`, `ext` or `fingerprint`.
    pub equals: BTreeMap<String, String>,
}

impl QueryFilter {
    /// Only chunks from the persistent index.
    pub fn global() -> Self {
        Self {
            scopes: vec![GLOBAL_SCOPE.to_string()],
            ..Self::default()
        }
    }

    pub fn scoped(scopes: &[&str]) -> Self {
        Self {
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }

    /// Build a filter from a request's `filters` object, limited to the
    /// global scope. `path_prefix` is a prefix match, the remaining keys
    /// must be in the known set and are compared for equality.
    pub fn from_json(value: Option<&serde_json::Value>) -> Result<Self, StoreError> {
        let mut filter = Self::global();
        let Some(value) = value else {
            return Ok(filter);
        };
        if value.is_null() {
            return Ok(filter);
        }
        let obj = value
            .as_object()
            .ok_or_else(|| StoreError::Filter("filters must be an object".to_string()))?;

        for (key, raw) in obj {
            let text = match raw {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                _ => {
                    return Err(StoreError::Filter(format!(
                        "filter '{}' must be a scalar",
                        key
                    )))
                }
            };
            if key == "path_prefix" {
                filter.path_prefix = Some(text);
            } else if FILTER_KEYS.contains(&key.as_str()) {
                filter.equals.insert(key.clone(), text);
            } else {
                return Err(StoreError::Filter(format!(
                    "unknown filter key '{}' (expected path_prefix, {})",
                    key,
                    FILTER_KEYS.join(", ")
                )));
            }
        }
        Ok(filter)
    }

    pub fn matches(&self, chunk: &Chunk) -> bool {
        if !self.scopes.is_empty() && !self.scopes.iter().any(|s| s == &chunk.scope) {
            return false;
        }
        if let Some(prefix) = &self.path_prefix {
            if !chunk.source_path.starts_with(prefix.as_str()) {
                return false;
            }
        }
        self.equals.iter().all(|(key, want)| match key.as_str() {
            "path" => &chunk.source_path == want,
            "ext" => chunk.ext.eq_ignore_ascii_case(want.trim_start_matches('.')),
            "fingerprint" => &chunk.fingerprint == want,
            _ => false,
        })
    }
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Write chunks, overwriting any with the same id. Idempotent.
    async fn upsert(&self, chunks: &[EmbeddedChunk]) -> Result<(), StoreError>;

    /// Delete every chunk of `path` and write `chunks` as one step.
    /// Returns the number of chunks removed.
    async fn replace_source(&self, path: &str, chunks: &[EmbeddedChunk])
        -> Result<u64, StoreError>;

    async fn delete_by_source(&self, path: &str) -> Result<u64, StoreError>;

    /// Up to `top_k` hits in descending score order, ties by chunk id.
    async fn query(
        &self,
        embedding: &[f32],
        top_k: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<Hit>, StoreError>;

    /// Distinct source paths in `scope`.
    async fn sources(&self, scope: &str) -> Result<Vec<String>, StoreError>;

    async fn count(&self) -> Result<u64, StoreError>;

    async fn clear(&self) -> Result<(), StoreError>;
}

fn ensure_embedded(chunks: &[EmbeddedChunk]) -> Result<(), StoreError> {
    match chunks.iter().find(|c| c.embedding.is_empty()) {
        Some(c) => Err(StoreError::MissingEmbedding(c.chunk.id.clone())),
        None => Ok(()),
    }
}

fn hit_from(chunk: &Chunk, score: f32) -> Hit {
    Hit {
        chunk_id: chunk.id.clone(),
        path: chunk.source_path.clone(),
        chunk_index: chunk.chunk_index,
        ext: chunk.ext.clone(),
        scope: chunk.scope.clone(),
        text: chunk.text.clone(),
        score,
    }
}

/// Sort by descending score, then ascending chunk id, and keep `top_k`.
pub(crate) fn rank_hits(mut hits: Vec<Hit>, top_k: usize) -> Vec<Hit> {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    hits.truncate(top_k);
    hits
}
