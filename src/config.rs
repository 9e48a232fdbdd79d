//! Configuration loading.
//!
//! One [`Config`] is built at startup from an optional TOML file, then
//! environment overrides are applied on top. Every section has defaults so
//! an empty (or absent) file yields a usable local setup.
//!
//! Provider API keys never live in the file; they are read from
//! `OPENAI_API_KEY`, `EXA_API_KEY` and `SERPER_API_KEY` at the point of use.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::compose::MergeStrategy;
use crate::web::parse_engines;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub completion: CompletionConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Event log and manifest database. Defaults to `<data_dir>/app.sqlite`.
    #[serde(default)]
    pub app_db_path: Option<PathBuf>,
    /// Vector store collection directory. Defaults to `<data_dir>/vectors`.
    #[serde(default)]
    pub vector_dir: Option<PathBuf>,
    /// Where uploads are written. Defaults to `<data_dir>/uploads`.
    #[serde(default)]
    pub upload_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            app_db_path: None,
            vector_dir: None,
            upload_dir: None,
        }
    }
}

impl StorageConfig {
    pub fn app_db_path(&self) -> PathBuf {
        self.app_db_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("app.sqlite"))
    }

    pub fn vector_dir(&self) -> PathBuf {
        self.vector_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("vectors"))
    }

    pub fn upload_dir(&self) -> PathBuf {
        self.upload_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("uploads"))
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Default roots used when a request names none.
    #[serde(default)]
    pub roots: Vec<PathBuf>,
    /// Lowercase extensions (no dot) eligible for indexing.
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            extensions: default_extensions(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

fn default_extensions() -> Vec<String> {
    [
        "txt", "md", "pdf", "doc", "docx", "ppt", "pptx", "xls", "xlsx", "csv", "json", "xml",
        "html", "htm",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_max_file_bytes() -> u64 {
    50 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap(),
        }
    }
}

fn default_max_tokens() -> usize {
    800
}
fn default_overlap() -> usize {
    80
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL for the ollama provider.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            url: None,
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct CompletionConfig {
    #[serde(default = "default_completion_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_completion_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_completion_timeout")]
    pub timeout_secs: u64,
    /// Upper bound on context characters handed to the model.
    #[serde(default = "default_max_context_chars")]
    pub max_context_chars: usize,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            provider: default_completion_provider(),
            model: None,
            url: None,
            temperature: default_temperature(),
            max_tokens: default_completion_max_tokens(),
            timeout_secs: default_completion_timeout(),
            max_context_chars: default_max_context_chars(),
        }
    }
}

impl CompletionConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_completion_provider() -> String {
    "extractive".to_string()
}
fn default_temperature() -> f32 {
    0.2
}
fn default_completion_max_tokens() -> u32 {
    700
}
fn default_completion_timeout() -> u64 {
    60
}
fn default_max_context_chars() -> usize {
    12_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            strategy: default_strategy(),
            max_results: default_max_results(),
        }
    }
}

fn default_top_k() -> usize {
    10
}
fn default_strategy() -> String {
    "balanced".to_string()
}
fn default_max_results() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebConfig {
    /// Ordered engine preference, e.g. `exa|serper`.
    #[serde(default = "default_engines")]
    pub engines: String,
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    #[serde(default = "default_web_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_scrape_max_chars")]
    pub scrape_max_chars: usize,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            engines: default_engines(),
            top_n: default_top_n(),
            timeout_secs: default_web_timeout(),
            scrape_max_chars: default_scrape_max_chars(),
            user_agent: default_user_agent(),
        }
    }
}

fn default_engines() -> String {
    "exa|serper".to_string()
}
fn default_top_n() -> usize {
    3
}
fn default_web_timeout() -> u64 {
    20
}
fn default_scrape_max_chars() -> usize {
    200_000
}
fn default_user_agent() -> String {
    concat!("local-rag/", env!("CARGO_PKG_VERSION")).to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}
fn default_max_upload_bytes() -> usize {
    64 * 1024 * 1024
}

/// Load the config file (if present), apply environment overrides, validate.
pub fn load_config(path: &Path) -> Result<Config> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str::<Config>(&content).with_context(|| "Failed to parse config file")?
    } else {
        tracing::debug!(path = %path.display(), "config file not found, using defaults");
        Config::default()
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    validate(&config)?;
    Ok(config)
}

/// Apply `DATA_DIR`, `INDEX_ROOTS` and friends. `lookup` is injected so tests
/// don't have to mutate the process environment.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(v) = non_empty("DATA_DIR") {
        config.storage.data_dir = PathBuf::from(v);
    }
    if let Some(v) = non_empty("APP_DB_PATH") {
        config.storage.app_db_path = Some(PathBuf::from(v));
    }
    if let Some(v) = non_empty("VECTOR_DIR") {
        config.storage.vector_dir = Some(PathBuf::from(v));
    }
    if let Some(v) = non_empty("INDEX_ROOTS") {
        config.index.roots = parse_roots(&v);
    }
    if let Some(v) = non_empty("EMBEDDING_PROVIDER") {
        config.embedding.provider = v;
    }
    if let Some(v) = non_empty("EMBEDDING_MODEL") {
        config.embedding.model = Some(v);
    }
    if let Some(v) = non_empty("COMPLETION_PROVIDER") {
        config.completion.provider = v;
    }
    if let Some(v) = non_empty("COMPLETION_MODEL") {
        config.completion.model = Some(v);
    }
}

/// Parse a roots value given either as a JSON list or comma-separated.
pub fn parse_roots(raw: &str) -> Vec<PathBuf> {
    let trimmed = raw.trim();
    if trimmed.starts_with('[') {
        if let Ok(list) = serde_json::from_str::<Vec<String>>(trimmed) {
            return list
                .into_iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect();
        }
    }
    trimmed
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect()
}

fn validate(config: &Config) -> Result<()> {
    if config.chunking.max_tokens == 0 {
        anyhow::bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        anyhow::bail!("chunking.overlap_tokens must be smaller than chunking.max_tokens");
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    if config.retrieval.top_k == 0 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if !(1..=10).contains(&config.web.top_n) {
        anyhow::bail!("web.top_n must be in [1, 10]");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "hash" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, openai, or ollama.",
            other
        ),
    }
    if config.embedding.provider == "ollama" && config.embedding.model.is_none() {
        anyhow::bail!("embedding.model must be specified when provider is 'ollama'");
    }

    match config.completion.provider.as_str() {
        "disabled" | "extractive" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown completion provider: '{}'. Must be disabled, extractive, openai, or ollama.",
            other
        ),
    }

    config
        .retrieval
        .strategy
        .parse::<MergeStrategy>()
        .map_err(|e| anyhow::anyhow!("retrieval.strategy: {}", e))?;
    parse_engines(&config.web.engines).map_err(|e| anyhow::anyhow!("web.engines: {}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.chunking.max_tokens, 800);
        assert_eq!(config.chunking.overlap_tokens, 80);
        assert_eq!(config.embedding.batch_size, 64);
        assert_eq!(config.web.engines, "exa|serper");
        assert_eq!(config.storage.app_db_path(), PathBuf::from("./data/app.sqlite"));
        assert!(config.index.extensions.contains(&"docx".to_string()));
        validate(&config).unwrap();
    }

    #[test]
    fn test_parse_roots_json_and_csv() {
        assert_eq!(
            parse_roots(r#"["/a", " /b ", ""]"#),
            vec![PathBuf::from("/a"), PathBuf::from("/b")]
        );
        assert_eq!(
            parse_roots("/a, /b,,"),
            vec![PathBuf::from("/a"), PathBuf::from("/b")]
        );
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("DATA_DIR", "/tmp/rag"),
            ("INDEX_ROOTS", "/docs,/notes"),
            ("EMBEDDING_MODEL", "text-embedding-3-large"),
            ("COMPLETION_PROVIDER", "  "),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.storage.data_dir, PathBuf::from("/tmp/rag"));
        assert_eq!(config.storage.vector_dir(), PathBuf::from("/tmp/rag/vectors"));
        assert_eq!(config.index.roots.len(), 2);
        assert_eq!(
            config.embedding.model.as_deref(),
            Some("text-embedding-3-large")
        );
        // blank values are ignored
        assert_eq!(config.completion.provider, "extractive");
    }

    #[test]
    fn test_rejects_bad_overlap_and_provider() {
        let mut config = Config::default();
        config.chunking.overlap_tokens = 800;
        assert!(validate(&config).is_err());

        let mut config = Config::default();
        config.embedding.provider = "magic".into();
        let err = validate(&config).unwrap_err().to_string();
        assert!(err.contains("Unknown embedding provider"));

        let mut config = Config::default();
        config.web.engines = "bing".into();
        assert!(validate(&config).is_err());
    }
}
