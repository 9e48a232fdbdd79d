//! In-memory [`VectorStore`] for tests and short-lived runs.
//!
//! Chunks live in a `BTreeMap` keyed by id behind a tokio `RwLock`; every
//! write takes the lock once, so a source's replacement is never observed
//! half done. Search is brute-force cosine similarity.

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ensure_embedded, hit_from, rank_hits, QueryFilter, VectorStore};
use crate::embedding::cosine_similarity;
use crate::error::StoreError;
use crate::models::{EmbeddedChunk, Hit};

#[derive(Default)]
pub struct MemoryVectorStore {
    chunks: RwLock<BTreeMap<String, EmbeddedChunk>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    async fn upsert(&self, chunks: &[EmbeddedChunk]) -> Result<(), StoreError> {
        ensure_embedded(chunks)?;
        let mut guard = self.chunks.write().await;
        for c in chunks {
            guard.insert(c.chunk.id.clone(), c.clone());
        }
        Ok(())
    }

    async fn replace_source(
        &self,
        path: &str,
        chunks: &[EmbeddedChunk],
    ) -> Result<u64, StoreError> {
        ensure_embedded(chunks)?;
        let mut guard = self.chunks.write().await;
        let before = guard.len();
        guard.retain(|_, c| c.chunk.source_path != path);
        let removed = (before - guard.len()) as u64;
        for c in chunks {
            guard.insert(c.chunk.id.clone(), c.clone());
        }
        Ok(removed)
    }

    async fn delete_by_source(&self, path: &str) -> Result<u64, StoreError> {
        let mut guard = self.chunks.write().await;
        let before = guard.len();
        guard.retain(|_, c| c.chunk.source_path != path);
        Ok((before - guard.len()) as u64)
    }

    async fn query(
        &self,
        embedding: &[f32],
        top_k: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<Hit>, StoreError> {
        let guard = self.chunks.read().await;
        let hits = guard
            .values()
            .filter(|c| filter.matches(&c.chunk))
            .map(|c| hit_from(&c.chunk, cosine_similarity(embedding, &c.embedding)))
            .collect();
        Ok(rank_hits(hits, top_k))
    }

    async fn sources(&self, scope: &str) -> Result<Vec<String>, StoreError> {
        let guard = self.chunks.read().await;
        let paths: BTreeSet<String> = guard
            .values()
            .filter(|c| c.chunk.scope == scope)
            .map(|c| c.chunk.source_path.clone())
            .collect();
        Ok(paths.into_iter().collect())
    }

    async fn count(&self) -> Result<u64, StoreError> {
        Ok(self.chunks.read().await.len() as u64)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.chunks.write().await.clear();
        Ok(())
    }
}
