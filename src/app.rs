//! Service wiring shared by the CLI and the HTTP server.
//!
//! [`App::open`] builds every component from one [`Config`]; tests use
//! [`App::from_parts`] to swap in their own store and providers.

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use std::sync::Arc;

use crate::completion::{create_completer, Completer};
use crate::config::Config;
use crate::db;
use crate::embedding::{create_embedder, Embedder};
use crate::events::EventLog;
use crate::ingest::Indexer;
use crate::manifest::Manifest;
use crate::migrate;
use crate::query::QueryEngine;
use crate::store::{SqliteVectorStore, VectorStore};
use crate::web::WebSearcher;

#[derive(Clone)]
pub struct App {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub events: EventLog,
    pub indexer: Indexer,
    pub engine: QueryEngine,
}

impl App {
    /// Open the app database and vector store and build the configured
    /// providers.
    pub async fn open(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let pool = db::connect(&config).await?;
        let store = SqliteVectorStore::open(&config.storage.vector_dir())
            .await
            .with_context(|| {
                format!(
                    "Failed to open vector store in {}",
                    config.storage.vector_dir().display()
                )
            })?;
        let embedder = create_embedder(&config.embedding)?;
        let completer = create_completer(&config.completion)?;
        let web = WebSearcher::from_config(&config.web)?;
        Self::from_parts(
            config,
            pool,
            Arc::new(store),
            embedder,
            completer,
            Arc::new(web),
        )
        .await
    }

    pub async fn from_parts(
        config: Arc<Config>,
        pool: SqlitePool,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        completer: Arc<dyn Completer>,
        web: Arc<WebSearcher>,
    ) -> Result<Self> {
        migrate::apply(&pool).await?;
        let events = EventLog::new(pool.clone());
        let indexer = Indexer::new(
            Arc::clone(&config),
            Arc::clone(&store),
            Manifest::new(pool.clone()),
            events.clone(),
            Arc::clone(&embedder),
        );
        let engine = QueryEngine::new(
            Arc::clone(&config),
            store,
            embedder,
            completer,
            web,
            events.clone(),
        );
        Ok(Self {
            config,
            pool,
            events,
            indexer,
            engine,
        })
    }

    /// Embedder for a per-request model override, or `None` for the
    /// configured one.
    pub fn embedder_for(&self, model: Option<&str>) -> Result<Option<Arc<dyn Embedder>>> {
        let Some(model) = model.map(str::trim).filter(|m| !m.is_empty()) else {
            return Ok(None);
        };
        if self.config.embedding.model.as_deref() == Some(model) {
            return Ok(None);
        }
        let mut embedding = self.config.embedding.clone();
        embedding.model = Some(model.to_string());
        Ok(Some(create_embedder(&embedding)?))
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}
