//! SQLite-backed [`VectorStore`].
//!
//! One database file (`chunks.sqlite`) inside the configured vector
//! directory. Embeddings are stored as little-endian `f32` BLOBs and
//! compared in process. Every write runs inside a transaction, so a query
//! sees either none or all of a source's new chunks.

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use super::{ensure_embedded, hit_from, rank_hits, QueryFilter, VectorStore};
use crate::db;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::StoreError;
use crate::models::{Chunk, EmbeddedChunk, Hit};

const DB_FILE: &str = "chunks.sqlite";

#[derive(Clone)]
pub struct SqliteVectorStore {
    pool: SqlitePool,
}

impl SqliteVectorStore {
    /// Open (creating if needed) the collection in `dir`.
    pub async fn open(dir: &Path) -> Result<Self> {
        let pool = db::connect_path(&dir.join(DB_FILE)).await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                scope TEXT NOT NULL,
                source_path TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                start_byte INTEGER NOT NULL,
                end_byte INTEGER NOT NULL,
                fingerprint TEXT NOT NULL,
                ext TEXT NOT NULL,
                text TEXT NOT NULL,
                dims INTEGER NOT NULL,
                embedding BLOB NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(source_path)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_scope ON chunks(scope)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

async fn insert_chunk<'c, E>(executor: E, c: &EmbeddedChunk) -> Result<(), sqlx::Error>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let chunk = &c.chunk;
    sqlx::query(
        r#"
        INSERT INTO chunks (id, scope, source_path, chunk_index, start_byte, end_byte,
                            fingerprint, ext, text, dims, embedding)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            scope = excluded.scope,
            source_path = excluded.source_path,
            chunk_index = excluded.chunk_index,
            start_byte = excluded.start_byte,
            end_byte = excluded.end_byte,
            fingerprint = excluded.fingerprint,
            ext = excluded.ext,
            text = excluded.text,
            dims = excluded.dims,
            embedding = excluded.embedding
        "#,
    )
    .bind(&chunk.id)
    .bind(&chunk.scope)
    .bind(&chunk.source_path)
    .bind(chunk.chunk_index)
    .bind(chunk.start as i64)
    .bind(chunk.end as i64)
    .bind(&chunk.fingerprint)
    .bind(&chunk.ext)
    .bind(&chunk.text)
    .bind(c.embedding.len() as i64)
    .bind(vec_to_blob(&c.embedding))
    .execute(executor)
    .await?;
    Ok(())
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    async fn upsert(&self, chunks: &[EmbeddedChunk]) -> Result<(), StoreError> {
        ensure_embedded(chunks)?;
        let mut tx = self.pool.begin().await?;
        for c in chunks {
            insert_chunk(&mut *tx, c).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn replace_source(
        &self,
        path: &str,
        chunks: &[EmbeddedChunk],
    ) -> Result<u64, StoreError> {
        ensure_embedded(chunks)?;
        let mut tx = self.pool.begin().await?;
        let removed = sqlx::query("DELETE FROM chunks WHERE source_path = ?")
            .bind(path)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        for c in chunks {
            insert_chunk(&mut *tx, c).await?;
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn delete_by_source(&self, path: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM chunks WHERE source_path = ?")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn query(
        &self,
        embedding: &[f32],
        top_k: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<Hit>, StoreError> {
        if top_k == 0 {
            return Ok(Vec::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT id, scope, source_path, chunk_index, start_byte, end_byte, \
             fingerprint, ext, text, embedding FROM chunks WHERE dims = ",
        );
        qb.push_bind(embedding.len() as i64);
        if !filter.scopes.is_empty() {
            qb.push(" AND scope IN (");
            let mut sep = qb.separated(", ");
            for scope in &filter.scopes {
                sep.push_bind(scope.clone());
            }
            sep.push_unseparated(")");
        }
        if let Some(prefix) = &filter.path_prefix {
            qb.push(" AND substr(source_path, 1, length(")
                .push_bind(prefix.clone())
                .push(")) = ")
                .push_bind(prefix.clone());
        }

        let rows = qb.build().fetch_all(&self.pool).await?;

        let mut hits = Vec::new();
        for row in rows {
            let chunk = Chunk {
                id: row.get("id"),
                scope: row.get("scope"),
                source_path: row.get("source_path"),
                chunk_index: row.get("chunk_index"),
                start: row.get::<i64, _>("start_byte") as usize,
                end: row.get::<i64, _>("end_byte") as usize,
                fingerprint: row.get("fingerprint"),
                ext: row.get("ext"),
                text: row.get("text"),
            };
            // Equality filters are applied here so there is one source of truth.
            if !filter.matches(&chunk) {
                continue;
            }
            let blob: Vec<u8> = row.get("embedding");
            let score = cosine_similarity(embedding, &blob_to_vec(&blob));
            hits.push(hit_from(&chunk, score));
        }

        Ok(rank_hits(hits, top_k))
    }

    async fn sources(&self, scope: &str) -> Result<Vec<String>, StoreError> {
        let paths: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT source_path FROM chunks WHERE scope = ? ORDER BY source_path",
        )
        .bind(scope)
        .fetch_all(&self.pool)
        .await?;
        Ok(paths)
    }

    async fn count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn clear(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM chunks").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GLOBAL_SCOPE;
    use tempfile::TempDir;

    fn embedded(path: &str, index: i64, fp: &str, vector: Vec<f32>) -> EmbeddedChunk {
        EmbeddedChunk {
            chunk: Chunk {
                id: crate::chunk::chunk_id(path, index, fp),
                source_path: path.to_string(),
                scope: GLOBAL_SCOPE.to_string(),
                chunk_index: index,
                start: 0,
                end: 4,
                fingerprint: fp.to_string(),
                ext: "md".to_string(),
                text: format!("{} #{}", path, index),
            },
            embedding: vector,
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteVectorStore::open(tmp.path()).await.unwrap();
        let chunks = vec![
            embedded("/d/a.md", 0, "f", vec![1.0, 0.0]),
            embedded("/d/a.md", 1, "f", vec![0.0, 1.0]),
        ];
        store.upsert(&chunks).await.unwrap();
        store.upsert(&chunks).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_replace_source_supersedes() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteVectorStore::open(tmp.path()).await.unwrap();
        store
            .upsert(&[
                embedded("/d/a.md", 0, "old", vec![1.0, 0.0]),
                embedded("/d/a.md", 1, "old", vec![1.0, 0.1]),
                embedded("/d/b.md", 0, "b", vec![0.0, 1.0]),
            ])
            .await
            .unwrap();

        let removed = store
            .replace_source("/d/a.md", &[embedded("/d/a.md", 0, "new", vec![1.0, 0.0])])
            .await
            .unwrap();
        assert_eq!(removed, 2);

        let hits = store
            .query(&[1.0, 0.0], 10, &QueryFilter::global())
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].chunk_id, crate::chunk::chunk_id("/d/a.md", 0, "new"));
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn test_query_filters_and_delete() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteVectorStore::open(tmp.path()).await.unwrap();
        let mut upload = embedded("/u/1/x.md", 0, "u", vec![1.0, 0.0]);
        upload.chunk.scope = "upload:1".to_string();
        store
            .upsert(&[
                embedded("/d/a.md", 0, "a", vec![1.0, 0.0]),
                embedded("/e/b.md", 0, "b", vec![1.0, 0.0]),
                upload,
            ])
            .await
            .unwrap();

        let mut filter = QueryFilter::global();
        filter.path_prefix = Some("/d/".to_string());
        let hits = store.query(&[1.0, 0.0], 10, &filter).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "/d/a.md");

        let hits = store
            .query(&[1.0, 0.0], 10, &QueryFilter::scoped(&["upload:1"]))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].scope, "upload:1");

        assert_eq!(store.sources(GLOBAL_SCOPE).await.unwrap(), vec!["/d/a.md", "/e/b.md"]);
        assert_eq!(store.delete_by_source("/e/b.md").await.unwrap(), 1);
        store.clear().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }
}
