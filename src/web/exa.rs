//! Exa search (`POST https://api.exa.ai/search`).

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use super::WebSearchProvider;
use crate::models::WebResult;

const EXA_URL: &str = "https://api.exa.ai/search";
const SNIPPET_CHARS: usize = 300;

pub struct ExaProvider {
    api_key: Option<String>,
    client: reqwest::Client,
}

impl ExaProvider {
    pub fn new(api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            client,
        })
    }
}

#[async_trait]
impl WebSearchProvider for ExaProvider {
    fn name(&self) -> &str {
        "exa"
    }

    fn configured(&self) -> bool {
        self.api_key.is_some()
    }

    async fn search(&self, query: &str, top_n: usize, include_text: bool) -> Result<Vec<WebResult>> {
        let Some(key) = &self.api_key else {
            bail!("EXA_API_KEY not set");
        };
        let mut body = serde_json::json!({
            "query": query,
            "numResults": top_n.clamp(1, 10),
        });
        if include_text {
            body["contents"] = serde_json::json!({"text": true});
        }

        let response = self
            .client
            .post(EXA_URL)
            .header("x-api-key", key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("Exa API error {}: {}", status, text);
        }
        let payload: Value = response.json().await?;
        Ok(parse_exa_response(&payload))
    }
}

pub(crate) fn parse_exa_response(payload: &Value) -> Vec<WebResult> {
    let str_field = |item: &Value, key: &str| {
        item.get(key)
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    };

    payload
        .get("results")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let url = str_field(item, "url");
                    if url.is_empty() {
                        return None;
                    }
                    let text = item
                        .get("text")
                        .and_then(|v| v.as_str())
                        .filter(|t| !t.trim().is_empty())
                        .map(str::to_string);
                    let description = str_field(item, "description");
                    let snippet = if !description.is_empty() {
                        description
                    } else {
                        text.as_deref()
                            .unwrap_or("")
                            .chars()
                            .take(SNIPPET_CHARS)
                            .collect()
                    };
                    Some(WebResult {
                        title: str_field(item, "title"),
                        url,
                        snippet,
                        text,
                        published_date: item
                            .get("publishedDate")
                            .and_then(|v| v.as_str())
                            .map(str::to_string),
                        engine: "exa".to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}
