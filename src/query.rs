//! Query and retrieval engine.
//!
//! | Operation | Retrieval | Answer attributed to |
//! |-----------|-----------|----------------------|
//! | [`search_local`](QueryEngine::search_local) | vector store, `global` scope | local paths |
//! | [`search_web`](QueryEngine::search_web) | web engines with fallback | URLs |
//! | [`ask_with_file`](QueryEngine::ask_with_file) | one uploaded file + web | paths and URLs, kept apart |
//! | [`search_unified`](QueryEngine::search_unified) | index + web, merged by strategy | both |
//!
//! Requests are validated before any retrieval starts. Synthesis runs under
//! the completion timeout and its failure is reported next to the hits
//! instead of replacing them. Every call is appended to the event log.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::chunk::{chunk_text, SourceRef};
use crate::compose::{
    local_items, merge_ranked, rescore_local, synthesize, web_items, AnswerSources, ContextItem,
    MergeStrategy, Synthesis,
};
use crate::completion::Completer;
use crate::config::Config;
use crate::detect::fingerprint_bytes;
use crate::embedding::{embed_batched, embed_query, Embedder};
use crate::error::{QueryError, ValidationError};
use crate::events::{EventLog, QueryRecord, ANONYMOUS_USER};
use crate::models::{
    AttemptError, EmbeddedChunk, Hit, QueryMode, WebFetch, WebResult, GLOBAL_SCOPE,
};
use crate::readers::{extension_of, read_bytes, Format};
use crate::store::{QueryFilter, VectorStore};
use crate::web::{parse_engines, WebSearchOutcome, WebSearcher};

const MAX_TOP_K: usize = 100;
const MAX_TOP_N: usize = 10;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocalSearchRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub filters: Option<serde_json::Value>,
    #[serde(default = "default_true")]
    pub answer: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LocalSearchResponse {
    pub hits: Vec<Hit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer_sources: Option<AnswerSources>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer_error: Option<String>,
    pub latency_ms: u64,
    pub query_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct WebSearchRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default, alias = "query")]
    pub q: String,
    /// Engine preference such as `exa|serper`; defaults to `web.engines`.
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default)]
    pub top_n: Option<usize>,
    /// Fetch full page text for results that lack it.
    #[serde(default)]
    pub data: bool,
    #[serde(default = "default_true")]
    pub answer: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebSearchResponse {
    pub results: Vec<WebResult>,
    pub engine: Option<String>,
    pub attempted_engines: Vec<String>,
    pub attempt_errors: Vec<AttemptError>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fetches: Vec<WebFetch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer_sources: Option<AnswerSources>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer_error: Option<String>,
    pub latency_ms: u64,
    pub query_id: Option<i64>,
}

impl WebSearchResponse {
    /// Every attempted engine errored.
    pub fn all_failed(&self) -> bool {
        !self.attempted_engines.is_empty()
            && self.attempt_errors.len() == self.attempted_engines.len()
    }

    /// Every attempted engine ran out of time.
    pub fn all_timed_out(&self) -> bool {
        self.all_failed() && self.attempt_errors.iter().all(|e| e.timed_out)
    }
}

/// A hybrid question about one uploaded file.
#[derive(Debug, Clone)]
pub struct AskWithFileRequest {
    pub user_id: Option<String>,
    pub query: String,
    pub file_name: String,
    pub file_bytes: Vec<u8>,
    pub engine: Option<String>,
    pub local_top_k: Option<usize>,
    pub web_top_n: Option<usize>,
    pub scrape_web: bool,
    /// Limit local retrieval to the uploaded file (default). When false the
    /// persistent index is searched too.
    pub restrict_local_to_file: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadedFile {
    pub name: String,
    pub scope: String,
    pub fingerprint: String,
    pub chunks: usize,
}

/// Web half of a hybrid or unified response.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WebSection {
    pub results: Vec<WebResult>,
    pub engine: Option<String>,
    pub attempted_engines: Vec<String>,
    pub attempt_errors: Vec<AttemptError>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fetches: Vec<WebFetch>,
}

impl WebSection {
    fn new(outcome: WebSearchOutcome, fetches: Vec<WebFetch>) -> Self {
        Self {
            results: outcome.results,
            engine: outcome.engine,
            attempted_engines: outcome.attempted_engines,
            attempt_errors: outcome.attempt_errors,
            fetches,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AskWithFileResponse {
    pub answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer_sources: Option<AnswerSources>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer_error: Option<String>,
    pub file: UploadedFile,
    pub local: Vec<Hit>,
    pub web: WebSection,
    pub latency_ms: u64,
    pub query_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UnifiedSearchRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub top_k: Option<usize>,
    #[serde(default)]
    pub top_n: Option<usize>,
    #[serde(default)]
    pub engine: Option<String>,
    /// `balanced`, `local_first`, `web_first` or `interleaved`.
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub max_results: Option<usize>,
    #[serde(default = "default_true")]
    pub answer: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnifiedSearchResponse {
    pub results: Vec<ContextItem>,
    pub local_count: usize,
    pub web_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_error: Option<String>,
    pub web: WebSection,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer_sources: Option<AnswerSources>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer_error: Option<String>,
    pub latency_ms: u64,
    pub query_id: Option<i64>,
}

/// Chunks and directory of one hybrid upload.
struct UploadCleanup {
    store: Arc<dyn VectorStore>,
    dir: PathBuf,
    path_key: String,
}

impl UploadCleanup {
    async fn run(self) {
        if let Err(e) = self.store.delete_by_source(&self.path_key).await {
            tracing::warn!(path = %self.path_key, error = %e, "failed to remove upload chunks");
        }
        discard_dir(&self.dir).await;
    }
}

/// Cleans up an upload when dropped, so a request whose future is
/// cancelled mid-flight leaves nothing behind either.
struct UploadGuard(Option<UploadCleanup>);

impl UploadGuard {
    async fn finish(mut self) {
        if let Some(cleanup) = self.0.take() {
            cleanup.run().await;
        }
    }
}

impl Drop for UploadGuard {
    fn drop(&mut self) {
        let Some(cleanup) = self.0.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!(dir = %cleanup.dir.display(), "upload abandoned, cleaning up");
                handle.spawn(cleanup.run());
            }
            Err(_) => tracing::warn!(
                dir = %cleanup.dir.display(),
                "upload abandoned outside a runtime, left for the startup sweep"
            ),
        }
    }
}

async fn discard_dir(dir: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(dir).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(dir = %dir.display(), error = %e, "failed to remove upload directory");
        }
    }
}

/// Read side of the system. Never writes to the persistent index; hybrid
/// uploads live in their own scope and are removed before returning.
#[derive(Clone)]
pub struct QueryEngine {
    config: Arc<Config>,
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    completer: Arc<dyn Completer>,
    web: Arc<WebSearcher>,
    events: EventLog,
}

fn require_query(text: &str) -> Result<String, ValidationError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::new("query must not be empty"));
    }
    Ok(trimmed.to_string())
}

fn bounded(
    name: &str,
    value: Option<usize>,
    default: usize,
    max: usize,
) -> Result<usize, ValidationError> {
    let value = value.unwrap_or(default);
    if value == 0 || value > max {
        return Err(ValidationError::new(format!(
            "{} must be between 1 and {}",
            name, max
        )));
    }
    Ok(value)
}

fn answer_status(synthesis: &Synthesis) -> &'static str {
    if synthesis.answer.is_some() {
        "ok"
    } else if synthesis.answer_error.is_some() {
        "error"
    } else {
        "skipped"
    }
}

/// Final path component of an uploaded file name, rejecting anything that
/// would resolve outside the upload directory.
pub fn sanitize_file_name(name: &str) -> Result<String, ValidationError> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or("").trim();
    if base.is_empty() || base == "." || base == ".." {
        return Err(ValidationError::new(format!("invalid file name '{}'", name)));
    }
    Ok(base.to_string())
}

impl QueryEngine {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        completer: Arc<dyn Completer>,
        web: Arc<WebSearcher>,
        events: EventLog,
    ) -> Self {
        Self {
            config,
            store,
            embedder,
            completer,
            web,
            events,
        }
    }

    pub fn completer(&self) -> &Arc<dyn Completer> {
        &self.completer
    }

    pub fn web(&self) -> &Arc<WebSearcher> {
        &self.web
    }

    fn synthesis_timeout(&self) -> Duration {
        Duration::from_secs(self.config.completion.timeout_secs)
    }

    fn engines(&self, requested: Option<&str>) -> Result<Vec<String>, ValidationError> {
        let raw = requested
            .filter(|e| !e.trim().is_empty())
            .unwrap_or(&self.config.web.engines);
        parse_engines(raw).map_err(ValidationError)
    }

    async fn answer(&self, question: &str, items: Vec<ContextItem>, wanted: bool) -> Synthesis {
        if !wanted || items.is_empty() {
            return Synthesis::default();
        }
        synthesize(
            self.completer.as_ref(),
            question,
            items,
            self.synthesis_timeout(),
            self.config.completion.max_context_chars,
        )
        .await
    }

    async fn local_hits(
        &self,
        query: &str,
        top_k: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<Hit>, QueryError> {
        let vector = embed_query(self.embedder.as_ref(), query)
            .await
            .context("failed to embed query")?;
        Ok(self.store.query(&vector, top_k, filter).await?)
    }

    async fn web_lookup(
        &self,
        engines: &[String],
        query: &str,
        top_n: usize,
        scrape: bool,
    ) -> (WebSearchOutcome, Vec<WebFetch>) {
        let mut outcome = self.web.search(engines, query, top_n, scrape).await;
        let fetches = if scrape {
            self.web.scrape(&mut outcome.results, top_n).await
        } else {
            Vec::new()
        };
        (outcome, fetches)
    }

    /// Nearest chunks from the persistent index, with an optional answer.
    pub async fn search_local(
        &self,
        request: LocalSearchRequest,
    ) -> Result<LocalSearchResponse, QueryError> {
        let start = Instant::now();
        let query = require_query(&request.query)?;
        let top_k = bounded("top_k", request.top_k, self.config.retrieval.top_k, MAX_TOP_K)?;
        let filter = QueryFilter::from_json(request.filters.as_ref())?;

        let hits = self.local_hits(&query, top_k, &filter).await?;
        let synthesis = self.answer(&query, local_items(&hits), request.answer).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        let user = request.user_id.as_deref().unwrap_or(ANONYMOUS_USER);
        let record = QueryRecord {
            user_id: user,
            mode: QueryMode::File,
            query_text: &query,
            top_k: Some(top_k),
            filters_json: request.filters.as_ref().map(|f| f.to_string()),
            result_count: hits.len(),
            answer_status: answer_status(&synthesis),
            latency_ms,
        };
        let query_id = self.log_query(&record, &hits).await;
        tracing::info!(mode = "file", hits = hits.len(), latency_ms, "query served");

        Ok(LocalSearchResponse {
            hits,
            answer: synthesis.answer,
            answer_sources: synthesis.answer_sources,
            answer_error: synthesis.answer_error,
            latency_ms,
            query_id,
        })
    }

    /// Web search with engine fallback, optional page fetches and answer.
    ///
    /// Engine failures are data, not errors: they come back in
    /// `attempt_errors`. Callers decide what "every engine failed" means.
    pub async fn search_web(
        &self,
        request: WebSearchRequest,
    ) -> Result<WebSearchResponse, QueryError> {
        let start = Instant::now();
        let query = require_query(&request.q)?;
        let top_n = bounded("top_n", request.top_n, self.config.web.top_n, MAX_TOP_N)?;
        let engines = self.engines(request.engine.as_deref())?;

        let (outcome, fetches) = self.web_lookup(&engines, &query, top_n, request.data).await;
        let synthesis = self
            .answer(&query, web_items(&outcome.results, &query), request.answer)
            .await;
        let latency_ms = start.elapsed().as_millis() as u64;

        let user = request.user_id.as_deref().unwrap_or(ANONYMOUS_USER);
        self.log_web(user, &query, &engines, &outcome, &fetches, latency_ms)
            .await;
        let record = QueryRecord {
            user_id: user,
            mode: QueryMode::Web,
            query_text: &query,
            top_k: Some(top_n),
            filters_json: None,
            result_count: outcome.results.len(),
            answer_status: answer_status(&synthesis),
            latency_ms,
        };
        let query_id = self.log_query(&record, &[]).await;
        tracing::info!(
            mode = "web",
            engine = outcome.engine.as_deref().unwrap_or("-"),
            results = outcome.results.len(),
            latency_ms,
            "query served"
        );

        Ok(WebSearchResponse {
            results: outcome.results,
            engine: outcome.engine,
            attempted_engines: outcome.attempted_engines,
            attempt_errors: outcome.attempt_errors,
            fetches,
            answer: synthesis.answer,
            answer_sources: synthesis.answer_sources,
            answer_error: synthesis.answer_error,
            latency_ms,
            query_id,
        })
    }

    /// Hybrid question: the uploaded file is indexed into a scope of its
    /// own, retrieved from alongside the web, and removed afterwards.
    pub async fn ask_with_file(
        &self,
        request: AskWithFileRequest,
    ) -> Result<AskWithFileResponse, QueryError> {
        let start = Instant::now();
        let query = require_query(&request.query)?;
        if request.file_bytes.is_empty() {
            return Err(ValidationError::new("exactly one non-empty file is required").into());
        }
        let name = sanitize_file_name(&request.file_name)?;
        let format = Format::from_extension(&extension_of(Path::new(&name))).ok_or_else(|| {
            ValidationError::new(format!("unsupported file type: {}", name))
        })?;
        let top_k = bounded(
            "local_top_k",
            request.local_top_k,
            self.config.retrieval.top_k,
            MAX_TOP_K,
        )?;
        let top_n = bounded("web_top_n", request.web_top_n, self.config.web.top_n, MAX_TOP_N)?;
        let engines = self.engines(request.engine.as_deref())?;

        let session = Uuid::new_v4().to_string();
        let scope = format!("upload:{}", session);
        let dir = self.config.storage.upload_dir().join(&session);

        let guard = UploadGuard(Some(UploadCleanup {
            store: Arc::clone(&self.store),
            path_key: dir.join(&name).display().to_string(),
            dir: dir.clone(),
        }));
        let outcome = self
            .hybrid(&request, &query, &name, format, &scope, &dir, top_k, top_n, &engines)
            .await;
        guard.finish().await;
        let (file, hits, web_outcome, fetches) = outcome?;

        let mut items = local_items(&hits);
        items.extend(web_items(&web_outcome.results, &query));
        let synthesis = self.answer(&query, items, true).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        let user = request.user_id.as_deref().unwrap_or(ANONYMOUS_USER);
        self.log_web(user, &query, &engines, &web_outcome, &fetches, latency_ms)
            .await;
        let record = QueryRecord {
            user_id: user,
            mode: QueryMode::Hybrid,
            query_text: &query,
            top_k: Some(top_k),
            filters_json: Some(
                serde_json::json!({
                    "file": file.name,
                    "restrict_local_to_file": request.restrict_local_to_file,
                })
                .to_string(),
            ),
            result_count: hits.len() + web_outcome.results.len(),
            answer_status: answer_status(&synthesis),
            latency_ms,
        };
        let query_id = self.log_query(&record, &hits).await;
        tracing::info!(
            mode = "hybrid",
            local = hits.len(),
            web = web_outcome.results.len(),
            latency_ms,
            "query served"
        );

        Ok(AskWithFileResponse {
            answer: synthesis.answer,
            answer_sources: synthesis.answer_sources,
            answer_error: synthesis.answer_error,
            file,
            local: hits,
            web: WebSection::new(web_outcome, fetches),
            latency_ms,
            query_id,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn hybrid(
        &self,
        request: &AskWithFileRequest,
        query: &str,
        name: &str,
        format: Format,
        scope: &str,
        dir: &Path,
        top_k: usize,
        top_n: usize,
        engines: &[String],
    ) -> Result<(UploadedFile, Vec<Hit>, WebSearchOutcome, Vec<WebFetch>), QueryError> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let path: PathBuf = dir.join(name);
        tokio::fs::write(&path, &request.file_bytes)
            .await
            .with_context(|| format!("failed to save upload {}", path.display()))?;
        let path_key = path.display().to_string();

        let bytes = request.file_bytes.clone();
        let text = tokio::task::spawn_blocking(move || read_bytes(&bytes, format))
            .await
            .context("reader task failed")?
            .map_err(|e| ValidationError::new(format!("could not read {}: {}", name, e)))?;

        let fingerprint = fingerprint_bytes(&request.file_bytes);
        let ext = extension_of(&path);
        let chunks = chunk_text(
            SourceRef {
                path: &path_key,
                scope,
                fingerprint: &fingerprint,
                ext: &ext,
            },
            &text,
            &self.config.chunking,
        );
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = embed_batched(
            self.embedder.as_ref(),
            &texts,
            self.config.embedding.batch_size,
        )
        .await
        .context("failed to embed uploaded file")?;
        let embedded: Vec<EmbeddedChunk> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, embedding)| EmbeddedChunk { chunk, embedding })
            .collect();
        let chunk_count = embedded.len();
        self.store.upsert(&embedded).await?;
        tracing::debug!(path = %path_key, chunks = chunk_count, scope, "upload indexed");

        let filter = if request.restrict_local_to_file {
            QueryFilter::scoped(&[scope])
        } else {
            QueryFilter::scoped(&[scope, GLOBAL_SCOPE])
        };
        let (hits, (web_outcome, fetches)) = tokio::join!(
            self.local_hits(query, top_k, &filter),
            self.web_lookup(engines, query, top_n, request.scrape_web)
        );

        let file = UploadedFile {
            name: name.to_string(),
            scope: scope.to_string(),
            fingerprint,
            chunks: chunk_count,
        };
        Ok((file, hits?, web_outcome, fetches))
    }

    /// Remove hybrid sessions a previous process left behind: every
    /// `<uuid>` directory under the upload dir and the chunks of its
    /// `upload:<uuid>` scope. Returns how many sessions were removed.
    pub async fn sweep_uploads(&self) -> anyhow::Result<usize> {
        let root = self.config.storage.upload_dir();
        let mut entries = match tokio::fs::read_dir(&root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to list {}", root.display()))
            }
        };

        let mut swept = 0;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(session) = entry
                .file_name()
                .to_str()
                .filter(|n| Uuid::parse_str(n).is_ok())
                .map(str::to_string)
            else {
                continue;
            };
            for path in self.store.sources(&format!("upload:{}", session)).await? {
                self.store.delete_by_source(&path).await?;
            }
            discard_dir(&entry.path()).await;
            swept += 1;
        }
        Ok(swept)
    }

    /// Local and web retrieval merged into one ranked list.
    ///
    /// A failing side degrades the result instead of failing the request:
    /// local errors land in `local_error`, web errors in `attempt_errors`.
    pub async fn search_unified(
        &self,
        request: UnifiedSearchRequest,
    ) -> Result<UnifiedSearchResponse, QueryError> {
        let start = Instant::now();
        let query = require_query(&request.query)?;
        let top_k = bounded("top_k", request.top_k, self.config.retrieval.top_k, MAX_TOP_K)?;
        let top_n = bounded("top_n", request.top_n, self.config.web.top_n, MAX_TOP_N)?;
        let max_results = bounded(
            "max_results",
            request.max_results,
            self.config.retrieval.max_results,
            MAX_TOP_K,
        )?;
        let strategy: MergeStrategy = request
            .strategy
            .as_deref()
            .unwrap_or(&self.config.retrieval.strategy)
            .parse()
            .map_err(ValidationError)?;
        let engines = self.engines(request.engine.as_deref())?;

        let filter = QueryFilter::global();
        let (local, (outcome, fetches)) = tokio::join!(
            self.local_hits(&query, top_k, &filter),
            self.web_lookup(&engines, &query, top_n, false)
        );
        let (hits, local_error) = match local {
            Ok(hits) => (hits, None),
            Err(e) => {
                tracing::warn!(error = %e, "local retrieval failed, continuing with web only");
                (Vec::new(), Some(e.to_string()))
            }
        };

        let local_ranked = rescore_local(local_items(&hits), &query);
        let web_ranked = web_items(&outcome.results, &query);
        let merged = merge_ranked(local_ranked, web_ranked, strategy, max_results);
        let synthesis = self.answer(&query, merged.clone(), request.answer).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        let user = request.user_id.as_deref().unwrap_or(ANONYMOUS_USER);
        self.log_web(user, &query, &engines, &outcome, &fetches, latency_ms)
            .await;
        let record = QueryRecord {
            user_id: user,
            mode: QueryMode::Unified,
            query_text: &query,
            top_k: Some(top_k),
            filters_json: None,
            result_count: merged.len(),
            answer_status: answer_status(&synthesis),
            latency_ms,
        };
        let query_id = self.log_query(&record, &hits).await;

        let local_count = merged
            .iter()
            .filter(|i| i.origin == crate::compose::Origin::Local)
            .count();
        Ok(UnifiedSearchResponse {
            web_count: merged.len() - local_count,
            local_count,
            results: merged,
            local_error,
            web: WebSection::new(outcome, fetches),
            answer: synthesis.answer,
            answer_sources: synthesis.answer_sources,
            answer_error: synthesis.answer_error,
            latency_ms,
            query_id,
        })
    }

    async fn log_query(&self, record: &QueryRecord<'_>, hits: &[Hit]) -> Option<i64> {
        let logged = async {
            let id = self.events.log_query(record).await?;
            self.events.log_query_hits(id, hits).await?;
            anyhow::Ok(id)
        }
        .await;
        match logged {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(error = %e, "failed to record query event");
                None
            }
        }
    }

    async fn log_web(
        &self,
        user: &str,
        query: &str,
        engines: &[String],
        outcome: &WebSearchOutcome,
        fetches: &[WebFetch],
        latency_ms: u64,
    ) {
        let request_json = serde_json::json!({ "q": query, "engines": engines });
        let response_json = serde_json::json!({
            "engine": outcome.engine,
            "attempted_engines": outcome.attempted_engines,
            "attempt_errors": outcome.attempt_errors,
            "results": outcome.results.len(),
        });
        let status = if outcome.all_failed() { "failed" } else { "ok" };
        let logged = async {
            let event_id = self
                .events
                .log_api_event(
                    Some(user),
                    "web",
                    &request_json,
                    &response_json,
                    status,
                    None,
                    latency_ms,
                )
                .await?;
            self.events.log_web_results(event_id, &outcome.results).await?;
            self.events.log_web_fetches(event_id, fetches).await?;
            anyhow::Ok(())
        }
        .await;
        if let Err(e) = logged {
            tracing::warn!(error = %e, "failed to record web search event");
        }
    }
}
