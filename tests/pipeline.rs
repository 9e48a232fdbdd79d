use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Notify;

use local_rag::app::App;
use local_rag::completion::ExtractiveCompleter;
use local_rag::config::Config;
use local_rag::db;
use local_rag::detect::{fingerprint_bytes, normalize_root};
use local_rag::embedding::{Embedder, HashEmbedder};
use local_rag::error::{IndexError, StoreError};
use local_rag::ingest::IndexRequest;
use local_rag::models::{EmbeddedChunk, Hit, PathErrorKind, RunStatus, GLOBAL_SCOPE};
use local_rag::store::{MemoryVectorStore, QueryFilter, SqliteVectorStore, VectorStore};
use local_rag::web::WebSearcher;

struct Harness {
    _tmp: TempDir,
    docs: PathBuf,
    app: App,
}

fn test_config(tmp: &TempDir, docs: &Path) -> Config {
    let mut config = Config::default();
    config.storage.data_dir = tmp.path().join("data");
    config.index.roots = vec![docs.to_path_buf()];
    config.chunking.max_tokens = 60;
    config.chunking.overlap_tokens = 10;
    config
}

impl Harness {
    async fn new() -> Self {
        Self::with(Arc::new(MemoryVectorStore::new()), Arc::new(HashEmbedder::new(64))).await
    }

    async fn with(store: Arc<dyn VectorStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self::build(TempDir::new().unwrap(), store, embedder).await
    }

    async fn build(
        tmp: TempDir,
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        let docs = tmp.path().join("docs");
        fs::create_dir_all(&docs).unwrap();
        let config = Arc::new(test_config(&tmp, &docs));

        let pool = db::connect(&config).await.unwrap();
        let web = WebSearcher::with_providers(&config.web, Vec::new()).unwrap();
        let app = App::from_parts(
            Arc::clone(&config),
            pool,
            store,
            embedder,
            Arc::new(ExtractiveCompleter::default()),
            Arc::new(web),
        )
        .await
        .unwrap();

        Self {
            _tmp: tmp,
            docs,
            app,
        }
    }

    fn write(&self, name: &str, content: &str) -> PathBuf {
        let path = self.docs.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, content).unwrap();
        path
    }

    fn key(&self, name: &str) -> String {
        normalize_root(&self.docs.join(name)).display().to_string()
    }

    async fn index(&self) -> local_rag::models::IndexRunResult {
        self.app
            .indexer
            .run(IndexRequest::incremental(Vec::new()))
            .await
            .unwrap()
    }

    async fn index_full(&self) -> local_rag::models::IndexRunResult {
        self.app
            .indexer
            .run(IndexRequest::full(Vec::new()))
            .await
            .unwrap()
    }

    /// Store size must always equal what the manifest says it wrote.
    async fn assert_consistent(&self) {
        let entries = self
            .app
            .indexer
            .manifest()
            .load_under(&[normalize_root(&self.docs)])
            .await
            .unwrap();
        let owned: i64 = entries.values().map(|e| e.chunk_count).sum();
        let stored = self.app.indexer.store().count().await.unwrap();
        assert_eq!(stored, owned as u64, "store and manifest disagree");
    }
}

fn long_text(topic: &str, sentences: usize) -> String {
    (0..sentences)
        .map(|i| format!("Sentence {} talks about {} in some detail.", i, topic))
        .collect::<Vec<_>>()
        .join(" ")
}

fn fingerprint_filter(content: &str) -> QueryFilter {
    let filter = json!({ "fingerprint": fingerprint_bytes(content.as_bytes()) });
    QueryFilter::from_json(Some(&filter)).unwrap()
}

#[tokio::test]
async fn test_reindex_is_idempotent() {
    let h = Harness::new().await;
    h.write("alpha.md", &long_text("rust ownership", 40));
    h.write("notes/beta.txt", "Beta notes about deployment and kubernetes.");

    let first = h.index().await;
    assert_eq!(first.status, RunStatus::Success);
    assert_eq!(first.counts.new, 2);
    assert_eq!(first.counts.indexed, 2);
    assert!(first.chunks_written > 2, "alpha should span several chunks");
    h.assert_consistent().await;
    let count = h.app.indexer.store().count().await.unwrap();

    let second = h.index().await;
    assert_eq!(second.status, RunStatus::Success);
    assert_eq!(second.counts.new, 0);
    assert_eq!(second.counts.changed, 0);
    assert_eq!(second.counts.unchanged, 2);
    assert_eq!(second.chunks_written, 0);
    assert_eq!(h.app.indexer.store().count().await.unwrap(), count);
    assert!(second.event_id > first.event_id);
}

#[tokio::test]
async fn test_touch_without_edit_is_unchanged() {
    let h = Harness::new().await;
    let path = h.write("alpha.md", "Stable content.");
    h.index().await;

    std::thread::sleep(std::time::Duration::from_millis(20));
    fs::write(&path, "Stable content.").unwrap();

    let result = h.index().await;
    assert_eq!(result.unchanged, vec![h.key("alpha.md")]);
    assert!(result.changed.is_empty());
}

#[tokio::test]
async fn test_edit_supersedes_old_chunks() {
    let h = Harness::new().await;
    let old = long_text("garbage collection", 30);
    h.write("alpha.md", &old);
    h.write("beta.md", "Unrelated beta document.");
    h.index().await;

    let new = long_text("borrow checking", 12);
    h.write("alpha.md", &new);
    let result = h.index().await;
    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.changed, vec![h.key("alpha.md")]);
    assert_eq!(result.unchanged, vec![h.key("beta.md")]);
    assert!(result.chunks_deleted > 0);
    h.assert_consistent().await;

    let query_vec = HashEmbedder::new(64).embed_one("garbage collection");
    let stale = fingerprint_filter(&old);
    let hits = h.app.indexer.store().query(&query_vec, 100, &stale).await.unwrap();
    assert!(hits.is_empty(), "chunks of the old version survived");

    let current = fingerprint_filter(&new);
    let hits = h.app.indexer.store().query(&query_vec, 100, &current).await.unwrap();
    assert!(!hits.is_empty());
    assert!(hits.iter().all(|hit| hit.path == h.key("alpha.md")));
}

#[tokio::test]
async fn test_deleted_file_is_removed() {
    let h = Harness::new().await;
    h.write("alpha.md", "Alpha.");
    let beta = h.write("beta.md", "Beta.");
    h.index().await;

    fs::remove_file(beta).unwrap();
    let result = h.index().await;
    assert_eq!(result.deleted, vec![h.key("beta.md")]);
    assert_eq!(result.counts.deleted, 1);

    let sources = h.app.indexer.store().sources(GLOBAL_SCOPE).await.unwrap();
    assert_eq!(sources, vec![h.key("alpha.md")]);
    h.assert_consistent().await;
}

#[tokio::test]
async fn test_full_reset_converges_with_incremental() {
    let h = Harness::new().await;
    h.write("alpha.md", &long_text("caching", 20));
    h.write("beta.md", "Beta.");
    let gamma = h.write("gamma.md", "Gamma.");
    h.index().await;

    fs::remove_file(gamma).unwrap();
    h.write("beta.md", "Beta, edited.");

    let full = h.index_full().await;
    assert_eq!(full.status, RunStatus::Success);
    assert_eq!(full.counts.new, 2);
    assert!(full.chunks_deleted > 0);
    h.assert_consistent().await;
    let after_full = h.app.indexer.store().count().await.unwrap();

    let incremental = h.index().await;
    assert_eq!(incremental.counts.unchanged, 2);
    assert_eq!(incremental.chunks_written, 0);
    assert_eq!(h.app.indexer.store().count().await.unwrap(), after_full);
}

#[tokio::test]
async fn test_full_reset_keeps_chunks_outside_roots() {
    let h = Harness::new().await;
    h.write("alpha.md", "Alpha.");
    h.index().await;

    // A chunk from another scope (e.g. an in-flight upload) must survive.
    let foreign = local_rag::chunk::chunk_text(
        local_rag::chunk::SourceRef {
            path: "/elsewhere/upload.txt",
            scope: "upload:test",
            fingerprint: "f",
            ext: "txt",
        },
        "Uploaded text.",
        &Config::default().chunking,
    );
    let embedded: Vec<EmbeddedChunk> = foreign
        .into_iter()
        .map(|chunk| EmbeddedChunk {
            embedding: HashEmbedder::new(64).embed_one(&chunk.text),
            chunk,
        })
        .collect();
    h.app.indexer.store().upsert(&embedded).await.unwrap();

    let full = h.index_full().await;
    assert_eq!(full.status, RunStatus::Success);
    let query_vec = HashEmbedder::new(64).embed_one("Uploaded text.");
    let hits = h
        .app
        .indexer
        .store()
        .query(&query_vec, 10, &QueryFilter::scoped(&["upload:test"]))
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
}

/// Once armed, stalls the next count or delete until released. Counts are
/// taken before stalling so the caller sees a stale value.
struct StallingStore {
    inner: MemoryVectorStore,
    armed: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl StallingStore {
    async fn stall(&self) {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
    }
}

#[async_trait]
impl VectorStore for StallingStore {
    async fn upsert(&self, chunks: &[EmbeddedChunk]) -> Result<(), StoreError> {
        self.inner.upsert(chunks).await
    }
    async fn replace_source(
        &self,
        path: &str,
        chunks: &[EmbeddedChunk],
    ) -> Result<u64, StoreError> {
        self.inner.replace_source(path, chunks).await
    }
    async fn delete_by_source(&self, path: &str) -> Result<u64, StoreError> {
        self.stall().await;
        self.inner.delete_by_source(path).await
    }
    async fn query(
        &self,
        embedding: &[f32],
        top_k: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<Hit>, StoreError> {
        self.inner.query(embedding, top_k, filter).await
    }
    async fn sources(&self, scope: &str) -> Result<Vec<String>, StoreError> {
        self.inner.sources(scope).await
    }
    async fn count(&self) -> Result<u64, StoreError> {
        let count = self.inner.count().await;
        self.stall().await;
        count
    }
    async fn clear(&self) -> Result<(), StoreError> {
        self.stall().await;
        self.inner.clear().await
    }
}

#[tokio::test]
async fn test_full_reset_spares_concurrent_disjoint_run() {
    let store = Arc::new(StallingStore {
        inner: MemoryVectorStore::new(),
        armed: AtomicBool::new(false),
        entered: Notify::new(),
        release: Notify::new(),
    });
    let h = Harness::with(store.clone(), Arc::new(HashEmbedder::new(64))).await;
    h.write("alpha.md", "Alpha.");
    h.index().await;

    let other = h.docs.parent().unwrap().join("other");
    fs::create_dir_all(&other).unwrap();
    fs::write(other.join("two.md"), "Two, indexed while the reset runs.").unwrap();

    store.armed.store(true, Ordering::SeqCst);
    let indexer = h.app.indexer.clone();
    let reset = tokio::spawn(async move { indexer.run(IndexRequest::full(Vec::new())).await });
    store.entered.notified().await;

    let disjoint = h
        .app
        .indexer
        .run(IndexRequest::incremental(vec![other.clone()]))
        .await
        .unwrap();
    assert_eq!(disjoint.status, RunStatus::Success);
    assert_eq!(disjoint.counts.indexed, 1);

    store.release.notify_one();
    let full = reset.await.unwrap().unwrap();
    assert_eq!(full.status, RunStatus::Success);

    let two = normalize_root(&other.join("two.md")).display().to_string();
    let manifest = h.app.indexer.manifest();
    let two_entry = manifest.get(&two).await.unwrap().expect("two.md stays in the manifest");
    let alpha_entry = manifest.get(&h.key("alpha.md")).await.unwrap().unwrap();
    let sources = h.app.indexer.store().sources(GLOBAL_SCOPE).await.unwrap();
    assert!(sources.contains(&two), "chunks of the disjoint run were wiped");
    assert_eq!(
        h.app.indexer.store().count().await.unwrap(),
        (two_entry.chunk_count + alpha_entry.chunk_count) as u64
    );
}

#[tokio::test]
async fn test_unsupported_file_is_reported_not_fatal() {
    let h = Harness::new().await;
    h.write("alpha.md", "Alpha.");
    h.write("legacy.doc", "\u{1}\u{2}binary-ish");

    let result = h.index().await;
    assert_eq!(result.status, RunStatus::Partial);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].kind, PathErrorKind::Unsupported);
    assert_eq!(result.counts.indexed, 1);
}

/// Fails every batch that contains `poison` while `armed` is set.
struct FlakyEmbedder {
    inner: HashEmbedder,
    armed: AtomicBool,
}

#[async_trait]
impl Embedder for FlakyEmbedder {
    fn provider(&self) -> &str {
        "flaky"
    }
    fn model_name(&self) -> &str {
        "flaky"
    }
    fn dims(&self) -> Option<usize> {
        self.inner.dims()
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if self.armed.load(Ordering::SeqCst) && texts.iter().any(|t| t.contains("poison")) {
            anyhow::bail!("embedding service unavailable");
        }
        self.inner.embed(texts).await
    }
}

#[tokio::test]
async fn test_failed_source_is_retried_next_run() {
    let flaky = Arc::new(FlakyEmbedder {
        inner: HashEmbedder::new(64),
        armed: AtomicBool::new(true),
    });
    let h = Harness::with(Arc::new(MemoryVectorStore::new()), flaky.clone()).await;
    h.write("good.md", "A good document.");
    h.write("bad.md", "This one carries poison.");

    let first = h.index().await;
    assert_eq!(first.status, RunStatus::Partial);
    assert_eq!(first.errors.len(), 1);
    assert_eq!(first.errors[0].path, h.key("bad.md"));
    assert_eq!(first.errors[0].kind, PathErrorKind::Embed);
    assert!(h
        .app
        .indexer
        .manifest()
        .get(&h.key("bad.md"))
        .await
        .unwrap()
        .is_none());
    h.assert_consistent().await;

    flaky.armed.store(false, Ordering::SeqCst);
    let second = h.index().await;
    assert_eq!(second.status, RunStatus::Success);
    assert_eq!(second.new, vec![h.key("bad.md")]);
    assert_eq!(second.unchanged, vec![h.key("good.md")]);
    h.assert_consistent().await;
}

/// Accepts reads but refuses every write.
struct ReadOnlyStore {
    inner: MemoryVectorStore,
}

fn refused() -> StoreError {
    StoreError::Backend(sqlx::Error::Protocol("disk is full".to_string()))
}

#[async_trait]
impl VectorStore for ReadOnlyStore {
    async fn upsert(&self, _chunks: &[EmbeddedChunk]) -> Result<(), StoreError> {
        Err(refused())
    }
    async fn replace_source(
        &self,
        _path: &str,
        _chunks: &[EmbeddedChunk],
    ) -> Result<u64, StoreError> {
        Err(refused())
    }
    async fn delete_by_source(&self, _path: &str) -> Result<u64, StoreError> {
        Err(refused())
    }
    async fn query(
        &self,
        embedding: &[f32],
        top_k: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<Hit>, StoreError> {
        self.inner.query(embedding, top_k, filter).await
    }
    async fn sources(&self, scope: &str) -> Result<Vec<String>, StoreError> {
        self.inner.sources(scope).await
    }
    async fn count(&self) -> Result<u64, StoreError> {
        self.inner.count().await
    }
    async fn clear(&self) -> Result<(), StoreError> {
        Err(refused())
    }
}

#[tokio::test]
async fn test_storage_failure_fails_run_without_manifest_writes() {
    let store = Arc::new(ReadOnlyStore {
        inner: MemoryVectorStore::new(),
    });
    let h = Harness::with(store, Arc::new(HashEmbedder::new(64))).await;
    h.write("alpha.md", "Alpha.");
    h.write("beta.md", "Beta.");

    let result = h.index().await;
    assert_eq!(result.status, RunStatus::Failed);
    assert!(result
        .errors
        .iter()
        .any(|e| e.kind == PathErrorKind::Storage));
    assert_eq!(result.counts.indexed, 0);
    assert_eq!(h.app.indexer.manifest().count().await.unwrap(), 0);
}

/// Blocks its first call until released.
struct GateEmbedder {
    inner: HashEmbedder,
    gated: AtomicBool,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl Embedder for GateEmbedder {
    fn provider(&self) -> &str {
        "gate"
    }
    fn model_name(&self) -> &str {
        "gate"
    }
    fn dims(&self) -> Option<usize> {
        self.inner.dims()
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if self.gated.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.embed(texts).await
    }
}

#[tokio::test]
async fn test_overlapping_run_is_busy() {
    let gate = Arc::new(GateEmbedder {
        inner: HashEmbedder::new(64),
        gated: AtomicBool::new(true),
        entered: Notify::new(),
        release: Notify::new(),
    });
    let h = Harness::with(Arc::new(MemoryVectorStore::new()), gate.clone()).await;
    h.write("sub/alpha.md", "Alpha.");

    let indexer = h.app.indexer.clone();
    let running =
        tokio::spawn(async move { indexer.run(IndexRequest::incremental(Vec::new())).await });
    gate.entered.notified().await;

    let nested = h.docs.join("sub");
    let busy = h.app.indexer.run(IndexRequest::incremental(vec![nested])).await;
    assert!(matches!(busy, Err(IndexError::Busy(_))));

    gate.release.notify_one();
    let first = running.await.unwrap().unwrap();
    assert_eq!(first.status, RunStatus::Success);

    let again = h.app.indexer.run(IndexRequest::incremental(Vec::new())).await;
    assert!(again.is_ok());
}

#[tokio::test]
async fn test_missing_root_keeps_its_entries() {
    let h = Harness::new().await;
    let other = h.docs.parent().unwrap().join("other");
    fs::create_dir_all(&other).unwrap();
    fs::write(other.join("kept.md"), "Kept while the root is gone.").unwrap();
    h.write("alpha.md", "Alpha.");
    let roots = vec![h.docs.clone(), other.clone()];

    let first = h
        .app
        .indexer
        .run(IndexRequest::incremental(roots.clone()))
        .await
        .unwrap();
    assert_eq!(first.counts.indexed, 2);
    let kept = normalize_root(&other.join("kept.md")).display().to_string();

    fs::remove_dir_all(&other).unwrap();
    let second = h
        .app
        .indexer
        .run(IndexRequest::incremental(roots))
        .await
        .unwrap();
    assert_eq!(second.status, RunStatus::Partial);
    assert_eq!(second.errors[0].kind, PathErrorKind::MissingRoot);
    assert!(second.deleted.is_empty());
    assert!(h.app.indexer.manifest().get(&kept).await.unwrap().is_some());
}

#[tokio::test]
async fn test_sqlite_store_survives_reopen() {
    let tmp = TempDir::new().unwrap();
    let vector_dir = test_config(&tmp, tmp.path()).storage.vector_dir();
    let store = SqliteVectorStore::open(&vector_dir).await.unwrap();
    let h = Harness::build(tmp, Arc::new(store), Arc::new(HashEmbedder::new(64))).await;
    h.write("alpha.md", &long_text("persistence", 15));
    let result = h.index().await;
    assert_eq!(result.status, RunStatus::Success);

    let reopened = SqliteVectorStore::open(&vector_dir).await.unwrap();
    assert_eq!(reopened.count().await.unwrap(), result.chunks_written as u64);
    h.assert_consistent().await;
}
