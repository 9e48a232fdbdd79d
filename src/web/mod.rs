//! Web search providers with ordered fallback.
//!
//! Engines are tried in the order given (e.g. `exa|serper`). The first
//! engine that returns a non-empty result set wins; every attempt and its
//! error is recorded so callers can report exactly what happened.

pub mod exa;
pub mod scrape;
pub mod serper;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::WebConfig;
use crate::models::{AttemptError, WebFetch, WebResult};

pub use exa::ExaProvider;
pub use serper::SerperProvider;

/// Engines with a provider implementation.
pub const KNOWN_ENGINES: &[&str] = &["exa", "serper"];
/// Longest fallback chain accepted.
pub const MAX_ENGINES: usize = 3;

#[async_trait]
pub trait WebSearchProvider: Send + Sync {
    fn name(&self) -> &str;
    /// Whether credentials are present.
    fn configured(&self) -> bool;
    /// Up to `top_n` results; `include_text` asks for page text when the
    /// engine can return it inline.
    async fn search(&self, query: &str, top_n: usize, include_text: bool)
        -> Result<Vec<WebResult>>;
}

/// Parse an engine list such as `"exa|serper"` or `"serper, exa"`.
///
/// Names are trimmed and lowercased, duplicates dropped, and the list is
/// capped at [`MAX_ENGINES`]. Unknown names are an error.
pub fn parse_engines(raw: &str) -> Result<Vec<String>, String> {
    let mut engines: Vec<String> = Vec::new();
    for name in raw.split(['|', ',']) {
        let name = name.trim().to_ascii_lowercase();
        if name.is_empty() || engines.contains(&name) {
            continue;
        }
        if !KNOWN_ENGINES.contains(&name.as_str()) {
            return Err(format!(
                "unknown engine '{}' (expected one of: {})",
                name,
                KNOWN_ENGINES.join(", ")
            ));
        }
        engines.push(name);
    }
    if engines.is_empty() {
        return Err("no search engine given".to_string());
    }
    engines.truncate(MAX_ENGINES);
    Ok(engines)
}

/// What a fallback search did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WebSearchOutcome {
    /// Engine whose results were returned.
    pub engine: Option<String>,
    pub attempted_engines: Vec<String>,
    pub attempt_errors: Vec<AttemptError>,
    pub results: Vec<WebResult>,
}

impl WebSearchOutcome {
    /// Every attempted engine errored.
    pub fn all_failed(&self) -> bool {
        !self.attempted_engines.is_empty()
            && self.attempt_errors.len() == self.attempted_engines.len()
    }
}

/// Provider registry plus the HTTP client used for page fetches.
pub struct WebSearcher {
    providers: HashMap<String, Arc<dyn WebSearchProvider>>,
    client: reqwest::Client,
    timeout: Duration,
    scrape_max_chars: usize,
}

impl WebSearcher {
    /// Register the built-in engines, with keys from `EXA_API_KEY` and
    /// `SERPER_API_KEY`.
    pub fn from_config(config: &WebConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let providers: Vec<Arc<dyn WebSearchProvider>> = vec![
            Arc::new(ExaProvider::new(std::env::var("EXA_API_KEY").ok(), timeout)?),
            Arc::new(SerperProvider::new(
                std::env::var("SERPER_API_KEY").ok(),
                timeout,
            )?),
        ];
        Self::with_providers(config, providers)
    }

    pub fn with_providers(
        config: &WebConfig,
        providers: Vec<Arc<dyn WebSearchProvider>>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            providers: providers
                .into_iter()
                .map(|p| (p.name().to_string(), p))
                .collect(),
            client,
            timeout: Duration::from_secs(config.timeout_secs),
            scrape_max_chars: config.scrape_max_chars,
        })
    }

    /// `(engine, configured)` for each registered provider, sorted by name.
    pub fn key_status(&self) -> Vec<(String, bool)> {
        let mut status: Vec<_> = self
            .providers
            .values()
            .map(|p| (p.name().to_string(), p.configured()))
            .collect();
        status.sort();
        status
    }

    /// Try `engines` in order until one returns results.
    ///
    /// All attempts share one deadline; once it passes the remaining
    /// engines are not tried.
    pub async fn search(
        &self,
        engines: &[String],
        query: &str,
        top_n: usize,
        include_text: bool,
    ) -> WebSearchOutcome {
        let deadline = Instant::now() + self.timeout;
        let mut outcome = WebSearchOutcome::default();

        for engine in engines {
            if Instant::now() >= deadline {
                tracing::warn!(engine = %engine, "web search deadline passed, skipping engine");
                break;
            }
            outcome.attempted_engines.push(engine.clone());

            let Some(provider) = self.providers.get(engine) else {
                outcome.attempt_errors.push(AttemptError {
                    engine: engine.clone(),
                    error: "engine not registered".to_string(),
                    timed_out: false,
                });
                continue;
            };

            let attempt =
                tokio::time::timeout_at(deadline, provider.search(query, top_n, include_text))
                    .await;
            match attempt {
                Ok(Ok(results)) if !results.is_empty() => {
                    tracing::info!(engine = %engine, results = results.len(), "web search succeeded");
                    outcome.engine = Some(engine.clone());
                    outcome.results = results.into_iter().take(top_n).collect();
                    return outcome;
                }
                Ok(Ok(_)) => {
                    tracing::info!(engine = %engine, "web search returned no results");
                    if outcome.engine.is_none() {
                        outcome.engine = Some(engine.clone());
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(engine = %engine, error = %e, "web search failed");
                    outcome.attempt_errors.push(AttemptError {
                        engine: engine.clone(),
                        error: e.to_string(),
                        timed_out: false,
                    });
                }
                Err(_) => {
                    tracing::warn!(engine = %engine, "web search timed out");
                    outcome.attempt_errors.push(AttemptError {
                        engine: engine.clone(),
                        error: format!("timed out after {}s", self.timeout.as_secs()),
                        timed_out: true,
                    });
                }
            }
        }

        outcome
    }

    /// Fetch page text for up to `limit` results that have none yet.
    pub async fn scrape(&self, results: &mut [WebResult], limit: usize) -> Vec<WebFetch> {
        scrape::fetch_pages(
            &self.client,
            results,
            limit,
            self.scrape_max_chars,
            self.timeout,
        )
        .await
    }
}
