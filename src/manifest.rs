//! Persisted manifest: path → last-indexed fingerprint and chunk count.
//!
//! Only the indexing pipeline writes here.

use anyhow::Result;
use chrono::{TimeZone, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::detect::is_under;
use crate::models::ManifestEntry;

#[derive(Clone)]
pub struct Manifest {
    pool: SqlitePool,
}

impl Manifest {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, path: &str) -> Result<Option<ManifestEntry>> {
        let row = sqlx::query(
            "SELECT path, fingerprint, chunk_count, indexed_at FROM manifest WHERE path = ?",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| row_to_entry(&r)))
    }

    /// Every entry at or below one of `roots`, keyed by path.
    pub async fn load_under(&self, roots: &[PathBuf]) -> Result<HashMap<String, ManifestEntry>> {
        let rows = sqlx::query("SELECT path, fingerprint, chunk_count, indexed_at FROM manifest")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(row_to_entry)
            .filter(|e| is_under(&e.path, roots))
            .map(|e| (e.path.clone(), e))
            .collect())
    }

    pub async fn upsert(&self, entry: &ManifestEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO manifest (path, fingerprint, chunk_count, indexed_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                fingerprint = excluded.fingerprint,
                chunk_count = excluded.chunk_count,
                indexed_at = excluded.indexed_at
            "#,
        )
        .bind(&entry.path)
        .bind(&entry.fingerprint)
        .bind(entry.chunk_count)
        .bind(entry.indexed_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove(&self, path: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM manifest WHERE path = ?")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Drop every entry below `roots`; returns the removed paths.
    pub async fn remove_under(&self, roots: &[PathBuf]) -> Result<Vec<String>> {
        let mut paths: Vec<String> = self.load_under(roots).await?.into_keys().collect();
        paths.sort();
        let mut tx = self.pool.begin().await?;
        for path in &paths {
            sqlx::query("DELETE FROM manifest WHERE path = ?")
                .bind(path)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(paths)
    }

    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM manifest")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

fn row_to_entry(row: &sqlx::sqlite::SqliteRow) -> ManifestEntry {
    let ts: i64 = row.get("indexed_at");
    ManifestEntry {
        path: row.get("path"),
        fingerprint: row.get("fingerprint"),
        chunk_count: row.get("chunk_count"),
        indexed_at: Utc.timestamp_opt(ts, 0).single().unwrap_or_default(),
    }
}
