//! Core data models shared by the indexing pipeline and the query engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Scope tag for chunks that belong to the persistent index.
pub const GLOBAL_SCOPE: &str = "global";

/// A file discovered by a directory scan. Identity is `path`.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSource {
    /// Absolute path, as a string, used as the key everywhere.
    pub path: String,
    pub modified: DateTime<Utc>,
    pub size: u64,
    /// sha256 hex of the file's bytes.
    pub fingerprint: String,
    /// Lowercase extension without the dot.
    pub ext: String,
}

/// Last-indexed state of one source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManifestEntry {
    pub path: String,
    pub fingerprint: String,
    pub chunk_count: i64,
    pub indexed_at: DateTime<Utc>,
}

/// A contiguous span of extracted text from one source.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Derived from (path, index, fingerprint); see [`crate::chunk::chunk_id`].
    pub id: String,
    pub source_path: String,
    pub scope: String,
    pub chunk_index: i64,
    /// Byte span in the extracted text.
    pub start: usize,
    pub end: usize,
    pub fingerprint: String,
    pub ext: String,
    pub text: String,
}

/// A chunk paired with its embedding, ready for the vector store.
#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    pub embedding: Vec<f32>,
}

/// A scored retrieval result.
#[derive(Debug, Clone, Serialize)]
pub struct Hit {
    pub chunk_id: String,
    pub path: String,
    pub chunk_index: i64,
    pub ext: String,
    pub scope: String,
    pub text: String,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexMode {
    Incremental,
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "SUCCESS",
            RunStatus::Partial => "PARTIAL",
            RunStatus::Failed => "FAILED",
        }
    }
}

/// Why a single path could not be indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PathErrorKind {
    Read,
    Unsupported,
    Empty,
    TooLarge,
    Embed,
    MissingRoot,
    Storage,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PathError {
    pub path: String,
    pub kind: PathErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexCounts {
    pub scanned: usize,
    pub new: usize,
    pub changed: usize,
    pub unchanged: usize,
    pub deleted: usize,
    pub indexed: usize,
    pub errors: usize,
}

/// Summary of one indexing run.
#[derive(Debug, Clone, Serialize)]
pub struct IndexRunResult {
    pub mode: IndexMode,
    pub roots: Vec<String>,
    pub status: RunStatus,
    pub scanned: Vec<String>,
    pub new: Vec<String>,
    pub changed: Vec<String>,
    pub unchanged: Vec<String>,
    pub deleted: Vec<String>,
    pub counts: IndexCounts,
    pub errors: Vec<PathError>,
    pub chunks_written: usize,
    pub chunks_deleted: u64,
    pub elapsed_ms: u64,
    pub event_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryMode {
    File,
    Web,
    Hybrid,
    Unified,
}

impl QueryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryMode::File => "file",
            QueryMode::Web => "web",
            QueryMode::Hybrid => "hybrid",
            QueryMode::Unified => "unified",
        }
    }
}

/// One result from a web search engine, optionally with page text.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published_date: Option<String>,
    pub engine: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptError {
    pub engine: String,
    pub error: String,
    /// The attempt ran into the shared search deadline.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,
}

/// Outcome of fetching one result page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WebFetch {
    pub url: String,
    pub status: Option<u16>,
    pub chars: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
