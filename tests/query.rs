use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use local_rag::app::App;
use local_rag::chunk::{chunk_text, SourceRef};
use local_rag::completion::{Completer, CompletionRequest, ExtractiveCompleter};
use local_rag::compose::Origin;
use local_rag::config::Config;
use local_rag::db;
use local_rag::embedding::HashEmbedder;
use local_rag::error::QueryError;
use local_rag::ingest::IndexRequest;
use local_rag::models::{EmbeddedChunk, WebResult, GLOBAL_SCOPE};
use local_rag::query::{
    AskWithFileRequest, LocalSearchRequest, UnifiedSearchRequest, WebSearchRequest,
};
use local_rag::store::MemoryVectorStore;
use local_rag::web::{WebSearchProvider, WebSearcher};

/// A web engine with a canned answer that counts its calls.
struct StubEngine {
    name: &'static str,
    reply: std::result::Result<Vec<WebResult>, String>,
    delay: Duration,
    calls: AtomicUsize,
}

impl StubEngine {
    fn ok(name: &'static str, titles: &[&str]) -> Arc<Self> {
        Self::slow(name, titles, Duration::ZERO)
    }

    /// Succeeds, but only after `delay`.
    fn slow(name: &'static str, titles: &[&str], delay: Duration) -> Arc<Self> {
        let results = titles
            .iter()
            .enumerate()
            .map(|(i, title)| WebResult {
                title: title.to_string(),
                url: format!("https://{}.example/{}", name, i),
                snippet: format!("{} explained on the web.", title),
                text: None,
                published_date: None,
                engine: name.to_string(),
            })
            .collect();
        Arc::new(Self {
            name,
            reply: Ok(results),
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    fn failing(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            reply: Err(format!("{} returned 503", name)),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl WebSearchProvider for StubEngine {
    fn name(&self) -> &str {
        self.name
    }
    fn configured(&self) -> bool {
        true
    }
    async fn search(&self, _query: &str, top_n: usize, _text: bool) -> Result<Vec<WebResult>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.reply {
            Ok(results) => Ok(results.iter().take(top_n).cloned().collect()),
            Err(e) => Err(anyhow::anyhow!(e.clone())),
        }
    }
}

struct BrokenCompleter;

#[async_trait]
impl Completer for BrokenCompleter {
    fn provider(&self) -> &str {
        "broken"
    }
    async fn complete(&self, _request: &CompletionRequest) -> Result<String> {
        anyhow::bail!("model overloaded")
    }
}

struct StalledCompleter;

#[async_trait]
impl Completer for StalledCompleter {
    fn provider(&self) -> &str {
        "stalled"
    }
    async fn complete(&self, _request: &CompletionRequest) -> Result<String> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok("too late".to_string())
    }
}

struct Harness {
    _tmp: TempDir,
    docs: PathBuf,
    app: App,
}

async fn harness(engines: Vec<Arc<StubEngine>>, completer: Arc<dyn Completer>) -> Harness {
    harness_with(engines, completer, |_| {}).await
}

async fn harness_with(
    engines: Vec<Arc<StubEngine>>,
    completer: Arc<dyn Completer>,
    tweak: impl FnOnce(&mut Config),
) -> Harness {
    let tmp = TempDir::new().unwrap();
    let docs = tmp.path().join("docs");
    fs::create_dir_all(&docs).unwrap();

    let mut config = Config::default();
    config.storage.data_dir = tmp.path().join("data");
    config.index.roots = vec![docs.clone()];
    tweak(&mut config);
    let config = Arc::new(config);

    let providers: Vec<Arc<dyn WebSearchProvider>> = engines
        .into_iter()
        .map(|e| e as Arc<dyn WebSearchProvider>)
        .collect();
    let web = WebSearcher::with_providers(&config.web, providers).unwrap();
    let pool = db::connect(&config).await.unwrap();
    let app = App::from_parts(
        Arc::clone(&config),
        pool,
        Arc::new(MemoryVectorStore::new()),
        Arc::new(HashEmbedder::new(128)),
        completer,
        Arc::new(web),
    )
    .await
    .unwrap();

    Harness {
        _tmp: tmp,
        docs,
        app,
    }
}

async fn indexed(completer: Arc<dyn Completer>) -> Harness {
    indexed_with(completer, |_| {}).await
}

async fn indexed_with(completer: Arc<dyn Completer>, tweak: impl FnOnce(&mut Config)) -> Harness {
    let h = harness_with(
        vec![StubEngine::ok("exa", &["Kubernetes"]), StubEngine::ok("serper", &["Docker"])],
        completer,
        tweak,
    )
    .await;
    fs::write(
        h.docs.join("deploy.md"),
        "Deployments run on kubernetes. Pods are scheduled onto nodes by the scheduler.",
    )
    .unwrap();
    fs::write(
        h.docs.join("cooking.md"),
        "Bread needs flour, water, salt and yeast. Knead the dough for ten minutes.",
    )
    .unwrap();
    let run = h
        .app
        .indexer
        .run(IndexRequest::incremental(Vec::new()))
        .await
        .unwrap();
    assert_eq!(run.counts.indexed, 2);
    h
}

fn local(query: &str) -> LocalSearchRequest {
    LocalSearchRequest {
        query: query.to_string(),
        answer: true,
        ..LocalSearchRequest::default()
    }
}

fn web(query: &str) -> WebSearchRequest {
    WebSearchRequest {
        q: query.to_string(),
        answer: true,
        ..WebSearchRequest::default()
    }
}

#[tokio::test]
async fn test_local_search_ranks_and_answers() {
    let h = indexed(Arc::new(ExtractiveCompleter::default())).await;

    let response = h
        .app
        .engine
        .search_local(local("how are pods scheduled on kubernetes nodes"))
        .await
        .unwrap();
    assert!(!response.hits.is_empty());
    assert!(response.hits[0].path.ends_with("deploy.md"));
    assert!(response
        .hits
        .windows(2)
        .all(|pair| pair[0].score >= pair[1].score));
    assert!(response.answer.is_some());
    let sources = response.answer_sources.unwrap();
    assert!(sources.web.is_empty());
    assert!(response.query_id.is_some());
    assert_eq!(h.app.events.query_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_synthesis_failure_keeps_hits() {
    let h = indexed(Arc::new(BrokenCompleter)).await;

    let response = h.app.engine.search_local(local("kubernetes")).await.unwrap();
    assert!(!response.hits.is_empty());
    assert!(response.answer.is_none());
    assert!(response
        .answer_error
        .as_deref()
        .unwrap()
        .contains("model overloaded"));
}

#[tokio::test]
async fn test_no_answer_skips_synthesis() {
    let h = indexed(Arc::new(BrokenCompleter)).await;

    let mut request = local("kubernetes");
    request.answer = false;
    let response = h.app.engine.search_local(request).await.unwrap();
    assert!(response.answer.is_none());
    assert!(response.answer_error.is_none());
}

#[tokio::test]
async fn test_local_search_rejects_bad_input() {
    let h = indexed(Arc::new(ExtractiveCompleter::default())).await;

    let blank = h.app.engine.search_local(local("   ")).await;
    assert!(matches!(blank, Err(QueryError::Validation(_))));

    let mut request = local("kubernetes");
    request.filters = Some(json!({ "owner": "me" }));
    let unknown = h.app.engine.search_local(request).await;
    assert!(matches!(unknown, Err(QueryError::Validation(_))));

    let mut request = local("kubernetes");
    request.top_k = Some(0);
    assert!(h.app.engine.search_local(request).await.is_err());
}

#[tokio::test]
async fn test_path_prefix_filter() {
    let h = indexed(Arc::new(ExtractiveCompleter::default())).await;
    let cooking = local_rag::detect::normalize_root(&h.docs.join("cooking.md"));

    let mut request = local("kubernetes");
    request.filters = Some(json!({ "path_prefix": cooking.display().to_string() }));
    let response = h.app.engine.search_local(request).await.unwrap();
    assert!(!response.hits.is_empty());
    assert!(response.hits.iter().all(|hit| hit.path.ends_with("cooking.md")));
}

#[tokio::test]
async fn test_web_falls_back_to_next_engine() {
    let exa = StubEngine::failing("exa");
    let serper = StubEngine::ok("serper", &["Rust", "Cargo", "Crates"]);
    let h = harness(
        vec![exa.clone(), serper.clone()],
        Arc::new(ExtractiveCompleter::default()),
    )
    .await;

    let mut request = web("rust package manager");
    request.top_n = Some(2);
    let response = h.app.engine.search_web(request).await.unwrap();
    assert_eq!(response.engine.as_deref(), Some("serper"));
    assert_eq!(response.attempted_engines, vec!["exa", "serper"]);
    assert_eq!(response.attempt_errors.len(), 1);
    assert_eq!(response.attempt_errors[0].engine, "exa");
    assert_eq!(response.results.len(), 2);
    assert!(!response.all_failed());
    assert!(response.answer.is_some());
    assert!(response.answer_sources.unwrap().local.is_empty());
}

#[tokio::test]
async fn test_web_first_success_stops_fallback() {
    let exa = StubEngine::ok("exa", &["Rust"]);
    let serper = StubEngine::ok("serper", &["Other"]);
    let h = harness(
        vec![exa.clone(), serper.clone()],
        Arc::new(ExtractiveCompleter::default()),
    )
    .await;

    let response = h.app.engine.search_web(web("rust")).await.unwrap();
    assert_eq!(response.engine.as_deref(), Some("exa"));
    assert_eq!(response.attempted_engines, vec!["exa"]);
    assert_eq!(serper.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_web_empty_result_tries_next_engine() {
    let exa = StubEngine::ok("exa", &[]);
    let serper = StubEngine::ok("serper", &["Found it"]);
    let h = harness(vec![exa, serper], Arc::new(ExtractiveCompleter::default())).await;

    let response = h.app.engine.search_web(web("anything")).await.unwrap();
    assert_eq!(response.engine.as_deref(), Some("serper"));
    assert!(response.attempt_errors.is_empty());
    assert_eq!(response.results[0].title, "Found it");
}

#[tokio::test]
async fn test_web_engine_preference_is_honoured() {
    let exa = StubEngine::ok("exa", &["Exa result"]);
    let serper = StubEngine::ok("serper", &["Serper result"]);
    let h = harness(
        vec![exa.clone(), serper.clone()],
        Arc::new(ExtractiveCompleter::default()),
    )
    .await;

    let mut request = web("anything");
    request.engine = Some("serper|exa".to_string());
    let response = h.app.engine.search_web(request).await.unwrap();
    assert_eq!(response.engine.as_deref(), Some("serper"));
    assert_eq!(exa.calls.load(Ordering::SeqCst), 0);

    let mut request = web("anything");
    request.engine = Some("bing".to_string());
    let rejected = h.app.engine.search_web(request).await;
    assert!(matches!(rejected, Err(QueryError::Validation(_))));
}

#[tokio::test]
async fn test_web_all_engines_failed() {
    let h = harness(
        vec![StubEngine::failing("exa"), StubEngine::failing("serper")],
        Arc::new(ExtractiveCompleter::default()),
    )
    .await;

    let response = h.app.engine.search_web(web("anything")).await.unwrap();
    assert!(response.all_failed());
    assert!(response.results.is_empty());
    assert!(response.engine.is_none());
    assert_eq!(response.attempt_errors.len(), 2);
    assert!(response.answer.is_none());
    assert!(h.app.events.last_event("web").await.unwrap().is_some());
}

#[tokio::test]
async fn test_ask_with_file_is_isolated_and_cleaned_up() {
    let h = indexed(Arc::new(ExtractiveCompleter::default())).await;
    let before = h.app.indexer.store().count().await.unwrap();

    let request = AskWithFileRequest {
        user_id: Some("alice".to_string()),
        query: "what does the contract say about kubernetes".to_string(),
        file_name: "../contract.txt".to_string(),
        file_bytes: b"The contract requires kubernetes clusters in two regions.".to_vec(),
        engine: None,
        local_top_k: Some(5),
        web_top_n: Some(1),
        scrape_web: false,
        restrict_local_to_file: true,
    };
    let response = h.app.engine.ask_with_file(request).await.unwrap();

    assert_eq!(response.file.name, "contract.txt");
    assert!(response.file.scope.starts_with("upload:"));
    assert_eq!(response.file.chunks, 1);
    assert!(!response.local.is_empty());
    assert!(response
        .local
        .iter()
        .all(|hit| hit.scope == response.file.scope && hit.path.ends_with("contract.txt")));
    assert_eq!(response.web.engine.as_deref(), Some("exa"));
    assert_eq!(response.web.results.len(), 1);
    assert!(response.answer.is_some());

    // Nothing from the upload outlives the request.
    assert_eq!(h.app.indexer.store().count().await.unwrap(), before);
    let upload_dir = h.app.config.storage.upload_dir();
    assert_eq!(fs::read_dir(&upload_dir).unwrap().count(), 0);
}

#[tokio::test]
async fn test_ask_with_file_can_include_index() {
    let h = indexed(Arc::new(ExtractiveCompleter::default())).await;

    let request = AskWithFileRequest {
        user_id: None,
        query: "kubernetes pods scheduler".to_string(),
        file_name: "memo.md".to_string(),
        file_bytes: b"A memo about kubernetes.".to_vec(),
        engine: Some("serper".to_string()),
        local_top_k: Some(10),
        web_top_n: Some(1),
        scrape_web: false,
        restrict_local_to_file: false,
    };
    let response = h.app.engine.ask_with_file(request).await.unwrap();
    assert!(response.local.iter().any(|hit| hit.scope == GLOBAL_SCOPE));
    assert!(response.local.iter().any(|hit| hit.scope == response.file.scope));
    assert_eq!(response.web.engine.as_deref(), Some("serper"));
}

#[tokio::test]
async fn test_ask_with_file_rejects_unsupported_type() {
    let h = indexed(Arc::new(ExtractiveCompleter::default())).await;

    let request = AskWithFileRequest {
        user_id: None,
        query: "what is this".to_string(),
        file_name: "tool.exe".to_string(),
        file_bytes: vec![0x4d, 0x5a, 0x90],
        engine: None,
        local_top_k: None,
        web_top_n: None,
        scrape_web: false,
        restrict_local_to_file: true,
    };
    let rejected = h.app.engine.ask_with_file(request).await;
    assert!(matches!(rejected, Err(QueryError::Validation(_))));
}

#[tokio::test]
async fn test_synthesis_timeout_keeps_hits() {
    let h = indexed_with(Arc::new(StalledCompleter), |config| {
        config.completion.timeout_secs = 1;
    })
    .await;

    let started = std::time::Instant::now();
    let response = h.app.engine.search_local(local("kubernetes")).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!response.hits.is_empty());
    assert!(response.answer.is_none());
    assert!(response
        .answer_error
        .as_deref()
        .unwrap()
        .contains("timed out"));
}

fn contract_upload() -> AskWithFileRequest {
    AskWithFileRequest {
        user_id: None,
        query: "what does the contract say".to_string(),
        file_name: "contract.txt".to_string(),
        file_bytes: b"The contract requires two regions.".to_vec(),
        engine: Some("exa".to_string()),
        local_top_k: Some(3),
        web_top_n: Some(1),
        scrape_web: false,
        restrict_local_to_file: true,
    }
}

#[tokio::test]
async fn test_cancelled_ask_with_file_leaves_nothing_behind() {
    let exa = StubEngine::slow("exa", &["Contracts"], Duration::from_secs(10));
    let h = harness(vec![exa.clone()], Arc::new(ExtractiveCompleter::default())).await;
    let store = h.app.indexer.store().clone();
    let before = store.count().await.unwrap();

    let cancelled = tokio::time::timeout(
        Duration::from_millis(300),
        h.app.engine.ask_with_file(contract_upload()),
    )
    .await;
    assert!(cancelled.is_err(), "request should still be waiting on the web");
    // The web search starts only after the upload is indexed.
    assert_eq!(exa.calls.load(Ordering::SeqCst), 1);

    let upload_dir = h.app.config.storage.upload_dir();
    let mut clean = false;
    for _ in 0..100 {
        let chunks = store.count().await.unwrap();
        let dirs = fs::read_dir(&upload_dir).map(|d| d.count()).unwrap_or(0);
        if chunks == before && dirs == 0 {
            clean = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(clean, "upload chunks or directory outlived the cancelled request");
}

#[tokio::test]
async fn test_sweep_removes_abandoned_sessions() {
    let h = indexed(Arc::new(ExtractiveCompleter::default())).await;
    let store = h.app.indexer.store().clone();
    let before = store.count().await.unwrap();

    let upload_dir = h.app.config.storage.upload_dir();
    let session = "0b5c7a52-4f1e-4a7e-9f0e-3d2b1c0a9e8f";
    let session_dir = upload_dir.join(session);
    fs::create_dir_all(&session_dir).unwrap();
    let leftover = session_dir.join("left.txt");
    fs::write(&leftover, "Left behind by a crash.").unwrap();
    // Files saved by upload-files sit directly in the upload dir and stay.
    fs::write(upload_dir.join("kept.md"), "Uploaded for indexing.").unwrap();

    let path = leftover.display().to_string();
    let scope = format!("upload:{}", session);
    let chunks: Vec<EmbeddedChunk> = chunk_text(
        SourceRef {
            path: &path,
            scope: &scope,
            fingerprint: "f",
            ext: "txt",
        },
        "Left behind by a crash.",
        &Config::default().chunking,
    )
    .into_iter()
    .map(|chunk| EmbeddedChunk {
        embedding: HashEmbedder::new(128).embed_one(&chunk.text),
        chunk,
    })
    .collect();
    store.upsert(&chunks).await.unwrap();
    assert!(store.count().await.unwrap() > before);

    assert_eq!(h.app.engine.sweep_uploads().await.unwrap(), 1);
    assert_eq!(store.count().await.unwrap(), before);
    assert!(!session_dir.exists());
    assert!(upload_dir.join("kept.md").exists());
    assert_eq!(h.app.engine.sweep_uploads().await.unwrap(), 0);
}

#[tokio::test]
async fn test_unified_search_merges_both_sides() {
    let h = indexed(Arc::new(ExtractiveCompleter::default())).await;

    let request = UnifiedSearchRequest {
        query: "deployments run on kubernetes".to_string(),
        strategy: Some("local_first".to_string()),
        max_results: Some(3),
        answer: true,
        ..UnifiedSearchRequest::default()
    };
    let response = h.app.engine.search_unified(request).await.unwrap();
    assert!(response.results.len() <= 3);
    assert!(response.local_count > 0);
    assert!(response.web_count > 0);
    assert_eq!(response.local_count + response.web_count, response.results.len());
    assert_eq!(response.results[0].origin, Origin::Local);
    assert!(response.local_error.is_none());

    let request = UnifiedSearchRequest {
        query: "kubernetes".to_string(),
        strategy: Some("random".to_string()),
        ..UnifiedSearchRequest::default()
    };
    let rejected = h.app.engine.search_unified(request).await;
    assert!(matches!(rejected, Err(QueryError::Validation(_))));
}
