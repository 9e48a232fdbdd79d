//! Append-only event and query log.
//!
//! Indexing runs, uploads and web searches are recorded in `api_events`;
//! every search/ask invocation gets a `queries` row plus its hits, web
//! results and page fetches. Nothing here updates or deletes rows.

use anyhow::Result;
use chrono::Utc;
use sqlx::SqlitePool;

use crate::models::{Hit, QueryMode, WebFetch, WebResult};

/// User id recorded when a request does not carry one.
pub const ANONYMOUS_USER: &str = "anonymous";

/// One search/ask invocation, as written to `queries`.
#[derive(Debug, Clone)]
pub struct QueryRecord<'a> {
    pub user_id: &'a str,
    pub mode: QueryMode,
    pub query_text: &'a str,
    pub top_k: Option<usize>,
    pub filters_json: Option<String>,
    pub result_count: usize,
    /// `ok`, `error` or `skipped`.
    pub answer_status: &'a str,
    pub latency_ms: u64,
}

#[derive(Clone)]
pub struct EventLog {
    pool: SqlitePool,
}

impl EventLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Record `user_id` the first time it is seen.
    pub async fn ensure_user(&self, user_id: &str) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO users (id, created_at) VALUES (?, ?)")
            .bind(user_id)
            .bind(Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Append an API event and return its id. Ids only ever increase.
    #[allow(clippy::too_many_arguments)]
    pub async fn log_api_event(
        &self,
        user_id: Option<&str>,
        api: &str,
        request_json: &serde_json::Value,
        response_json: &serde_json::Value,
        status: &str,
        notes: Option<&str>,
        latency_ms: u64,
    ) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO api_events (user_id, api, request_json, response_json, status, notes,
                                    latency_ms, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(api)
        .bind(request_json.to_string())
        .bind(response_json.to_string())
        .bind(status)
        .bind(notes)
        .bind(latency_ms as i64)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Append a query event and return the query id.
    pub async fn log_query(&self, record: &QueryRecord<'_>) -> Result<i64> {
        self.ensure_user(record.user_id).await?;
        let result = sqlx::query(
            r#"
            INSERT INTO queries (user_id, mode, query_text, top_k, filters_json, result_count,
                                 answer_status, latency_ms, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.user_id)
        .bind(record.mode.as_str())
        .bind(record.query_text)
        .bind(record.top_k.map(|k| k as i64))
        .bind(&record.filters_json)
        .bind(record.result_count as i64)
        .bind(record.answer_status)
        .bind(record.latency_ms as i64)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn log_query_hits(&self, query_id: i64, hits: &[Hit]) -> Result<()> {
        if hits.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for (rank, hit) in hits.iter().enumerate() {
            sqlx::query(
                "INSERT INTO query_hits (query_id, rank, chunk_id, path, score) VALUES (?, ?, ?, ?, ?)",
            )
            .bind(query_id)
            .bind(rank as i64 + 1)
            .bind(&hit.chunk_id)
            .bind(&hit.path)
            .bind(hit.score as f64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn log_web_results(&self, event_id: i64, results: &[WebResult]) -> Result<()> {
        if results.is_empty() {
            return Ok(());
        }
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        for (rank, r) in results.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO web_results (event_id, engine, rank, title, url, snippet, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(event_id)
            .bind(&r.engine)
            .bind(rank as i64 + 1)
            .bind(&r.title)
            .bind(&r.url)
            .bind(&r.snippet)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn log_web_fetches(&self, event_id: i64, fetches: &[WebFetch]) -> Result<()> {
        if fetches.is_empty() {
            return Ok(());
        }
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        for f in fetches {
            sqlx::query(
                r#"
                INSERT INTO web_fetches (event_id, url, status, chars, error, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(event_id)
            .bind(&f.url)
            .bind(f.status.map(i64::from))
            .bind(f.chars as i64)
            .bind(&f.error)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Number of rows in `queries`.
    pub async fn query_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queries")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Most recent event for `api`, as `(id, status, created_at)`.
    pub async fn last_event(&self, api: &str) -> Result<Option<(i64, String, i64)>> {
        let row: Option<(i64, String, i64)> = sqlx::query_as(
            "SELECT id, status, created_at FROM api_events WHERE api = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(api)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}
