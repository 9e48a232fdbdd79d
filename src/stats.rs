//! Index statistics and health overview.
//!
//! [`collect_stats`] backs `lrag stats`; [`check_health`] backs
//! `GET /api/v1/health`. Both only read.

use anyhow::Result;
use serde::Serialize;

use crate::app::App;
use crate::manifest::Manifest;

#[derive(Debug, Serialize)]
pub struct LastRun {
    pub event_id: i64,
    pub status: String,
    pub at: i64,
}

#[derive(Debug, Serialize)]
pub struct EngineStatus {
    pub engine: String,
    pub configured: bool,
}

#[derive(Debug, Serialize)]
pub struct Stats {
    pub app_db: String,
    pub app_db_bytes: u64,
    pub vector_dir: String,
    pub chunks: u64,
    pub manifest_entries: i64,
    pub queries: i64,
    pub last_index: Option<LastRun>,
    pub embedding_provider: String,
    pub embedding_model: String,
    pub completion_provider: String,
    pub web_engines: Vec<EngineStatus>,
}

fn engine_status(app: &App) -> Vec<EngineStatus> {
    app.engine
        .web()
        .key_status()
        .into_iter()
        .map(|(engine, configured)| EngineStatus { engine, configured })
        .collect()
}

pub async fn collect_stats(app: &App) -> Result<Stats> {
    let db_path = app.config.storage.app_db_path();
    let chunks = app.indexer.store().count().await?;
    let manifest_entries = Manifest::new(app.pool.clone()).count().await?;
    let queries = app.events.query_count().await?;

    // Prefer whichever kind of run happened last.
    let incremental = app.events.last_event("index").await?;
    let full = app.events.last_event("index-full").await?;
    let last_index = incremental
        .into_iter()
        .chain(full)
        .max_by_key(|(id, _, _)| *id)
        .map(|(event_id, status, at)| LastRun { event_id, status, at });

    Ok(Stats {
        app_db_bytes: std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0),
        app_db: db_path.display().to_string(),
        vector_dir: app.config.storage.vector_dir().display().to_string(),
        chunks,
        manifest_entries,
        queries,
        last_index,
        embedding_provider: app.indexer.embedder().provider().to_string(),
        embedding_model: app.indexer.embedder().model_name().to_string(),
        completion_provider: app.engine.completer().provider().to_string(),
        web_engines: engine_status(app),
    })
}

/// Print [`collect_stats`] for humans.
pub async fn run_stats(app: &App) -> Result<()> {
    let stats = collect_stats(app).await?;

    println!("local-rag stats");
    println!("===============");
    println!();
    println!("  App database:  {}", stats.app_db);
    println!("  Size:          {}", format_bytes(stats.app_db_bytes));
    println!("  Vector store:  {}", stats.vector_dir);
    println!();
    println!("  Chunks:        {}", stats.chunks);
    println!("  Sources:       {}", stats.manifest_entries);
    println!("  Queries:       {}", stats.queries);
    match &stats.last_index {
        Some(run) => println!(
            "  Last index:    #{} {} ({})",
            run.event_id,
            run.status,
            format_ts_relative(run.at)
        ),
        None => println!("  Last index:    never"),
    }
    println!();
    println!(
        "  Embedding:     {} ({})",
        stats.embedding_provider, stats.embedding_model
    );
    println!("  Completion:    {}", stats.completion_provider);
    for engine in &stats.web_engines {
        println!(
            "  Web {:<10} {}",
            format!("{}:", engine.engine),
            if engine.configured { "key set" } else { "no key" }
        );
    }
    println!();
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct Issue {
    pub component: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct Health {
    /// `healthy` when there are no issues, otherwise `degraded`.
    pub status: String,
    pub version: String,
    pub components: serde_json::Value,
    pub issues: Vec<Issue>,
}

pub async fn check_health(app: &App) -> Health {
    let mut issues = Vec::new();

    let vector_store = match app.indexer.store().count().await {
        Ok(chunks) => serde_json::json!({ "status": "ok", "chunks": chunks }),
        Err(e) => {
            issues.push(Issue {
                component: "vector_store".into(),
                error: e.to_string(),
            });
            serde_json::json!({ "status": "error", "chunks": 0 })
        }
    };
    let manifest = match Manifest::new(app.pool.clone()).count().await {
        Ok(entries) => serde_json::json!({ "status": "ok", "entries": entries }),
        Err(e) => {
            issues.push(Issue {
                component: "manifest".into(),
                error: e.to_string(),
            });
            serde_json::json!({ "status": "error", "entries": 0 })
        }
    };

    let embedder = app.indexer.embedder();
    if embedder.provider() == "disabled" {
        issues.push(Issue {
            component: "embedding".into(),
            error: "embedding provider is disabled".into(),
        });
    }
    let engines = engine_status(app);
    if !engines.iter().any(|e| e.configured) {
        issues.push(Issue {
            component: "web_search".into(),
            error: "no web search API key set (EXA_API_KEY, SERPER_API_KEY)".into(),
        });
    }
    let web: serde_json::Map<String, serde_json::Value> = engines
        .iter()
        .map(|e| (e.engine.clone(), serde_json::Value::Bool(e.configured)))
        .collect();

    Health {
        status: if issues.is_empty() { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        components: serde_json::json!({
            "vector_store": vector_store,
            "manifest": manifest,
            "embedding": {
                "provider": embedder.provider(),
                "model": embedder.model_name(),
            },
            "completion": { "provider": app.engine.completer().provider() },
            "web_search": web,
        }),
        issues,
    }
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// "3 hours ago" style rendering of a Unix timestamp.
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }
    let plural = |n: i64| if n == 1 { "" } else { "s" };
    match delta {
        0..=59 => "just now".to_string(),
        60..=3599 => format!("{} min{} ago", delta / 60, plural(delta / 60)),
        3600..=86399 => format!("{} hour{} ago", delta / 3600, plural(delta / 3600)),
        d if d < 86400 * 30 => format!("{} day{} ago", d / 86400, plural(d / 86400)),
        _ => format_ts_iso(ts),
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
