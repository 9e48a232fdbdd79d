//! Indexing pipeline.
//!
//! One run walks the requested roots and brings the vector store and the
//! manifest in line with what is on disk:
//!
//! 1. **Scan** roots (blocking pool) into fingerprinted sources.
//! 2. **Classify** against the manifest entries under those roots, or, for a
//!    full reset, drop those entries and their chunks and treat everything
//!    as new.
//! 3. **Process** new and changed sources: read, chunk, embed, then
//!    `replace_source` followed by the manifest upsert. A failure before the
//!    store write leaves the old chunks and the stale manifest entry in
//!    place, so the next incremental run retries exactly that path.
//! 4. **Delete** chunks and manifest entries of sources that disappeared.
//! 5. **Report** an [`IndexRunResult`] and append it to the event log.
//!
//! Per-source failures make the run `PARTIAL`. A vector store or manifest
//! write failure stops the run and makes it `FAILED`.
//!
//! Runs whose roots overlap are mutually exclusive; the second one is
//! rejected with [`IndexError::Busy`].

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;

use crate::chunk::{chunk_text, SourceRef};
use crate::config::Config;
use crate::detect::{self, classify, normalize_root, roots_overlap, Classification, ScanReport};
use crate::embedding::{embed_batched, Embedder};
use crate::error::IndexError;
use crate::events::EventLog;
use crate::manifest::Manifest;
use crate::models::{
    DocumentSource, EmbeddedChunk, IndexCounts, IndexMode, IndexRunResult, ManifestEntry,
    PathError, PathErrorKind, RunStatus, GLOBAL_SCOPE,
};
use crate::readers::{read_document, ReadError};
use crate::store::VectorStore;

/// Parameters of one run.
#[derive(Clone)]
pub struct IndexRequest {
    /// Roots to index; empty means the configured `index.roots`.
    pub roots: Vec<PathBuf>,
    pub mode: IndexMode,
    /// Re-embed sources even when their fingerprint is unchanged.
    pub force_reembed: bool,
    /// Embedder for this run only (e.g. a per-request model).
    pub embedder: Option<Arc<dyn Embedder>>,
    pub user_id: Option<String>,
}

impl IndexRequest {
    pub fn incremental(roots: Vec<PathBuf>) -> Self {
        Self {
            roots,
            mode: IndexMode::Incremental,
            force_reembed: false,
            embedder: None,
            user_id: None,
        }
    }

    pub fn full(roots: Vec<PathBuf>) -> Self {
        Self {
            mode: IndexMode::Full,
            ..Self::incremental(roots)
        }
    }
}

#[derive(Default)]
struct RunLocks {
    active: Mutex<Vec<(u64, Vec<PathBuf>)>>,
    next_id: AtomicU64,
}

/// Releases the run's roots when dropped.
struct RunGuard {
    locks: Arc<RunLocks>,
    id: u64,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut active = self.locks.active.lock().unwrap_or_else(|e| e.into_inner());
        active.retain(|(id, _)| *id != self.id);
    }
}

impl RunLocks {
    fn acquire(self: &Arc<Self>, roots: &[PathBuf]) -> Result<RunGuard, IndexError> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, held)) = active.iter().find(|(_, held)| roots_overlap(held, roots)) {
            let held: Vec<String> = held.iter().map(|p| p.display().to_string()).collect();
            return Err(IndexError::Busy(held.join(", ")));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        active.push((id, roots.to_vec()));
        Ok(RunGuard {
            locks: Arc::clone(self),
            id,
        })
    }
}

/// Owns every write to the manifest and the vector store.
#[derive(Clone)]
pub struct Indexer {
    config: Arc<Config>,
    store: Arc<dyn VectorStore>,
    manifest: Manifest,
    events: EventLog,
    embedder: Arc<dyn Embedder>,
    locks: Arc<RunLocks>,
}

/// Mutable state threaded through one run.
struct RunState {
    counts: IndexCounts,
    errors: Vec<PathError>,
    chunks_written: usize,
    chunks_deleted: u64,
    failed: bool,
}

impl RunState {
    fn storage_failure(&mut self, path: &str, message: String) {
        tracing::error!(path = %path, error = %message, "storage failure, aborting run");
        self.errors.push(PathError {
            path: path.to_string(),
            kind: PathErrorKind::Storage,
            message,
        });
        self.failed = true;
    }
}

impl Indexer {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn VectorStore>,
        manifest: Manifest,
        events: EventLog,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        Self {
            config,
            store,
            manifest,
            events,
            embedder,
            locks: Arc::new(RunLocks::default()),
        }
    }

    pub fn store(&self) -> &Arc<dyn VectorStore> {
        &self.store
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    /// Execute one indexing run.
    ///
    /// Returns `Err` only when the run could not start (no roots, busy
    /// roots). Everything after that is reported through the result's
    /// status and error list.
    pub async fn run(&self, request: IndexRequest) -> Result<IndexRunResult, IndexError> {
        let start = Instant::now();
        let roots = self.resolve_roots(&request.roots)?;
        let _guard = self.locks.acquire(&roots)?;
        let embedder = request
            .embedder
            .clone()
            .unwrap_or_else(|| Arc::clone(&self.embedder));

        tracing::info!(
            mode = ?request.mode,
            roots = roots.len(),
            force_reembed = request.force_reembed,
            model = embedder.model_name(),
            "indexing run started"
        );

        let scan_roots = roots.clone();
        let index_config = self.config.index.clone();
        let report: ScanReport =
            tokio::task::spawn_blocking(move || detect::scan_roots(&scan_roots, &index_config))
                .await
                .map_err(|e| IndexError::Storage(format!("scan task failed: {}", e)))?
                .map_err(|e| IndexError::Validation(format!("scan failed: {}", e)))?;

        let mut state = RunState {
            counts: IndexCounts {
                scanned: report.sources.len(),
                ..IndexCounts::default()
            },
            errors: report.errors.clone(),
            chunks_written: 0,
            chunks_deleted: 0,
            failed: false,
        };

        let mut plan = match request.mode {
            IndexMode::Full => {
                self.reset(&roots, &mut state).await;
                Classification {
                    new: report.sources.clone(),
                    ..Classification::default()
                }
            }
            IndexMode::Incremental => match self.manifest.load_under(&roots).await {
                Ok(mut entries) => {
                    entries.retain(|path, _| !report.protected(path));
                    classify(&report.sources, &entries)
                }
                Err(e) => {
                    state.storage_failure("manifest", e.to_string());
                    Classification::default()
                }
            },
        };
        if request.force_reembed {
            let unchanged = std::mem::take(&mut plan.unchanged);
            plan.changed.extend(unchanged);
            plan.changed.sort_by(|a, b| a.path.cmp(&b.path));
        }

        state.counts.new = plan.new.len();
        state.counts.changed = plan.changed.len();
        state.counts.unchanged = plan.unchanged.len();
        state.counts.deleted = plan.deleted.len();

        let mut pending: Vec<&DocumentSource> = plan.new.iter().chain(&plan.changed).collect();
        pending.sort_by(|a, b| a.path.cmp(&b.path));

        for source in pending {
            if state.failed {
                break;
            }
            self.process_source(source, embedder.as_ref(), &mut state)
                .await;
        }

        for path in &plan.deleted {
            if state.failed {
                break;
            }
            self.remove_source(path, &mut state).await;
        }

        state.counts.errors = state.errors.len();
        let status = if state.failed {
            RunStatus::Failed
        } else if state.errors.is_empty() {
            RunStatus::Success
        } else {
            RunStatus::Partial
        };

        let paths = |sources: &[DocumentSource]| -> Vec<String> {
            sources.iter().map(|s| s.path.clone()).collect()
        };
        let mut result = IndexRunResult {
            mode: request.mode,
            roots: roots.iter().map(|r| r.display().to_string()).collect(),
            status,
            scanned: paths(&report.sources),
            new: paths(&plan.new),
            changed: paths(&plan.changed),
            unchanged: paths(&plan.unchanged),
            deleted: plan.deleted.clone(),
            counts: state.counts,
            errors: state.errors,
            chunks_written: state.chunks_written,
            chunks_deleted: state.chunks_deleted,
            elapsed_ms: start.elapsed().as_millis() as u64,
            event_id: None,
        };
        result.event_id = self.record(&request, &result).await;

        tracing::info!(
            status = result.status.as_str(),
            scanned = result.counts.scanned,
            new = result.counts.new,
            changed = result.counts.changed,
            unchanged = result.counts.unchanged,
            deleted = result.counts.deleted,
            errors = result.counts.errors,
            chunks_written = result.chunks_written,
            elapsed_ms = result.elapsed_ms,
            "indexing run finished"
        );
        Ok(result)
    }

    fn resolve_roots(&self, requested: &[PathBuf]) -> Result<Vec<PathBuf>, IndexError> {
        let raw = if requested.is_empty() {
            &self.config.index.roots
        } else {
            requested
        };
        let roots: BTreeSet<PathBuf> = raw
            .iter()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| normalize_root(p))
            .collect();
        if roots.is_empty() {
            return Err(IndexError::Validation(
                "no index roots given and none configured".to_string(),
            ));
        }
        Ok(roots.into_iter().collect())
    }

    /// Drop every manifest entry and chunk under `roots`.
    ///
    /// Deletion is per source so runs over disjoint roots and upload
    /// scopes that commit meanwhile are never touched.
    async fn reset(&self, roots: &[PathBuf], state: &mut RunState) {
        let entries = match self.manifest.load_under(roots).await {
            Ok(entries) => entries,
            Err(e) => return state.storage_failure("manifest", e.to_string()),
        };

        let mut paths: BTreeSet<String> = entries.into_keys().collect();
        match self.store.sources(GLOBAL_SCOPE).await {
            Ok(sources) => paths.extend(
                sources
                    .into_iter()
                    .filter(|p| detect::is_under(p, roots)),
            ),
            Err(e) => return state.storage_failure("vector store", e.to_string()),
        }

        for path in &paths {
            match self.store.delete_by_source(path).await {
                Ok(n) => state.chunks_deleted += n,
                Err(e) => return state.storage_failure(path, e.to_string()),
            }
        }

        match self.manifest.remove_under(roots).await {
            Ok(removed) => {
                tracing::info!(
                    entries = removed.len(),
                    chunks = state.chunks_deleted,
                    "full reset cleared previous state"
                )
            }
            Err(e) => state.storage_failure("manifest", e.to_string()),
        }
    }

    async fn process_source(
        &self,
        source: &DocumentSource,
        embedder: &dyn Embedder,
        state: &mut RunState,
    ) {
        let path = source.path.clone();
        let read = tokio::task::spawn_blocking({
            let path = path.clone();
            move || read_document(std::path::Path::new(&path))
        })
        .await;

        let text = match read {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                let kind = match &e {
                    ReadError::Unsupported(_) => PathErrorKind::Unsupported,
                    ReadError::Empty => PathErrorKind::Empty,
                    _ => PathErrorKind::Read,
                };
                return source_error(state, &path, kind, e.to_string());
            }
            Err(e) => return source_error(state, &path, PathErrorKind::Read, e.to_string()),
        };

        let chunks = chunk_text(
            SourceRef {
                path: &source.path,
                scope: GLOBAL_SCOPE,
                fingerprint: &source.fingerprint,
                ext: &source.ext,
            },
            &text,
            &self.config.chunking,
        );
        if chunks.is_empty() {
            return source_error(
                state,
                &path,
                PathErrorKind::Empty,
                "no chunks produced".to_string(),
            );
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors =
            match embed_batched(embedder, &texts, self.config.embedding.batch_size).await {
                Ok(vectors) => vectors,
                Err(e) => {
                    return source_error(state, &path, PathErrorKind::Embed, format!("{:#}", e))
                }
            };

        let embedded: Vec<EmbeddedChunk> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, embedding)| EmbeddedChunk { chunk, embedding })
            .collect();
        let written = embedded.len();

        let removed = match self.store.replace_source(&path, &embedded).await {
            Ok(removed) => removed,
            Err(e) => return state.storage_failure(&path, e.to_string()),
        };

        let entry = ManifestEntry {
            path: path.clone(),
            fingerprint: source.fingerprint.clone(),
            chunk_count: written as i64,
            indexed_at: Utc::now(),
        };
        if let Err(e) = self.manifest.upsert(&entry).await {
            return state.storage_failure(&path, e.to_string());
        }

        tracing::debug!(path = %path, chunks = written, superseded = removed, "indexed source");
        state.chunks_written += written;
        state.chunks_deleted += removed;
        state.counts.indexed += 1;
    }

    async fn remove_source(&self, path: &str, state: &mut RunState) {
        match self.store.delete_by_source(path).await {
            Ok(n) => state.chunks_deleted += n,
            Err(e) => return state.storage_failure(path, e.to_string()),
        }
        if let Err(e) = self.manifest.remove(path).await {
            return state.storage_failure(path, e.to_string());
        }
        tracing::debug!(path = %path, "removed deleted source");
    }

    async fn record(&self, request: &IndexRequest, result: &IndexRunResult) -> Option<i64> {
        let api = match request.mode {
            IndexMode::Incremental => "index",
            IndexMode::Full => "index-full",
        };
        let request_json = serde_json::json!({
            "roots": result.roots,
            "force_reembed": request.force_reembed,
            "mode": request.mode,
        });
        let response_json = serde_json::json!({
            "status": result.status,
            "counts": result.counts,
            "chunks_written": result.chunks_written,
            "chunks_deleted": result.chunks_deleted,
        });
        let notes = result
            .errors
            .first()
            .map(|e| format!("{}: {}", e.path, e.message));

        match self
            .events
            .log_api_event(
                request.user_id.as_deref(),
                api,
                &request_json,
                &response_json,
                result.status.as_str(),
                notes.as_deref(),
                result.elapsed_ms,
            )
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(error = %e, "failed to record indexing event");
                None
            }
        }
    }
}

fn source_error(state: &mut RunState, path: &str, kind: PathErrorKind, message: String) {
    tracing::warn!(path = %path, kind = ?kind, error = %message, "source not indexed");
    state.errors.push(PathError {
        path: path.to_string(),
        kind,
        message,
    });
}
