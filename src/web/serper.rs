//! Serper Google search (`POST https://google.serper.dev/search`).

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use super::WebSearchProvider;
use crate::models::WebResult;

const SERPER_URL: &str = "https://google.serper.dev/search";

pub struct SerperProvider {
    api_key: Option<String>,
    client: reqwest::Client,
}

impl SerperProvider {
    pub fn new(api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            client,
        })
    }
}

#[async_trait]
impl WebSearchProvider for SerperProvider {
    fn name(&self) -> &str {
        "serper"
    }

    fn configured(&self) -> bool {
        self.api_key.is_some()
    }

    // Serper never returns page text; callers scrape when they need it.
    async fn search(&self, query: &str, top_n: usize, _include_text: bool) -> Result<Vec<WebResult>> {
        let Some(key) = &self.api_key else {
            bail!("SERPER_API_KEY not set");
        };
        let response = self
            .client
            .post(SERPER_URL)
            .header("X-API-KEY", key)
            .json(&serde_json::json!({ "q": query, "num": top_n.clamp(1, 10) }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Serper API error {}: {}", status, text);
        }
        let payload: Value = response.json().await?;
        Ok(parse_serper_response(&payload, top_n))
    }
}

pub(crate) fn parse_serper_response(payload: &Value, top_n: usize) -> Vec<WebResult> {
    let items = payload
        .get("organic")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    let mut results = Vec::new();
    for item in items {
        let field = |key: &str| {
            item.get(key)
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string()
        };
        let url = field("link");
        if url.is_empty() {
            continue;
        }
        let date = field("date");
        results.push(WebResult {
            title: field("title"),
            url,
            snippet: field("snippet"),
            text: None,
            published_date: (!date.is_empty()).then_some(date),
            engine: "serper".to_string(),
        });
        if results.len() >= top_n {
            break;
        }
    }
    results
}
