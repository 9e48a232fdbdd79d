//! Answer-synthesis capability.
//!
//! [`Completer`] turns a question plus labelled context into answer text.
//! Implementations are chosen by name in [`create_completer`]:
//! `extractive` (offline, quotes the most relevant sentences), `openai`
//! (chat completions), `ollama` (`/api/chat`) and `disabled`.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::compose::{ContextItem, Origin};
use crate::config::CompletionConfig;
use crate::embedding::post_json_with_retry;

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";
const COMPLETION_RETRIES: u32 = 2;

const SYSTEM_PROMPT: &str = "You answer questions using only the provided context. \
Each context block starts with a label such as [L1] (a local document) or [W1] (a web page). \
Cite the labels you rely on inline, e.g. [L1] or [W2]. \
If the context does not contain the answer, say so plainly.";

pub struct CompletionRequest {
    pub question: String,
    pub items: Vec<ContextItem>,
    pub max_context_chars: usize,
}

impl CompletionRequest {
    /// User prompt: labelled context blocks, then the question. Blocks are
    /// cut once `max_context_chars` is reached.
    pub fn render_prompt(&self) -> String {
        let mut context = String::new();
        for item in &self.items {
            let header = match item.origin {
                Origin::Local => format!("[{}] {} ({})\n", item.label, item.title, item.location),
                Origin::Web => format!("[{}] {} <{}>\n", item.label, item.title, item.location),
            };
            let remaining = self
                .max_context_chars
                .saturating_sub(context.chars().count() + header.chars().count());
            if remaining == 0 {
                break;
            }
            context.push_str(&header);
            context.extend(item.text.chars().take(remaining));
            context.push_str("\n\n");
        }
        if context.is_empty() {
            context.push_str("(no context available)\n\n");
        }
        format!("Context:\n\n{}Question: {}", context, self.question)
    }
}

#[async_trait]
pub trait Completer: Send + Sync {
    fn provider(&self) -> &str;
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

pub fn create_completer(config: &CompletionConfig) -> Result<Arc<dyn Completer>> {
    let completer: Arc<dyn Completer> = match config.provider.as_str() {
        "extractive" => Arc::new(ExtractiveCompleter::default()),
        "openai" => Arc::new(OpenAiCompleter::new(config)?),
        "ollama" => Arc::new(OllamaCompleter::new(config)?),
        "disabled" => Arc::new(DisabledCompleter),
        other => bail!("Unknown completion provider: {}", other),
    };
    Ok(completer)
}

pub struct DisabledCompleter;

#[async_trait]
impl Completer for DisabledCompleter {
    fn provider(&self) -> &str {
        "disabled"
    }
    async fn complete(&self, _request: &CompletionRequest) -> Result<String> {
        bail!("Completion provider is disabled")
    }
}

/// Builds an answer from the context itself: for each of the best few
/// items, the sentence sharing the most terms with the question.
pub struct ExtractiveCompleter {
    max_items: usize,
}

impl Default for ExtractiveCompleter {
    fn default() -> Self {
        Self { max_items: 3 }
    }
}

#[async_trait]
impl Completer for ExtractiveCompleter {
    fn provider(&self) -> &str {
        "extractive"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        if request.items.is_empty() {
            return Ok("No relevant context was found for this question.".to_string());
        }
        let terms: HashSet<String> = request
            .question
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() > 2)
            .map(str::to_string)
            .collect();

        let lines: Vec<String> = request
            .items
            .iter()
            .take(self.max_items)
            .map(|item| format!("{} [{}]", best_sentence(&item.text, &terms), item.label))
            .collect();
        Ok(lines.join("\n"))
    }
}

fn best_sentence(text: &str, terms: &HashSet<String>) -> String {
    let mut best = ("", 0usize);
    for sentence in text.split_inclusive(['.', '!', '?', '\n']) {
        let sentence = sentence.trim();
        if sentence.is_empty() {
            continue;
        }
        let lower = sentence.to_lowercase();
        let overlap = terms.iter().filter(|t| lower.contains(t.as_str())).count();
        if best.0.is_empty() || overlap > best.1 {
            best = (sentence, overlap);
        }
    }
    let chosen: String = best.0.chars().take(400).collect();
    chosen.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub struct OpenAiCompleter {
    client: reqwest::Client,
    api_key: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiCompleter {
    pub fn new(config: &CompletionConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key,
            model: config
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl Completer for OpenAiCompleter {
    fn provider(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": request.render_prompt()},
            ],
        });
        let auth = format!("Bearer {}", self.api_key);
        let json = post_json_with_retry(
            &self.client,
            OPENAI_CHAT_URL,
            &[("Authorization", auth.as_str())],
            &body,
            COMPLETION_RETRIES,
            "OpenAI",
        )
        .await?;
        json.pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing message content"))
    }
}

pub struct OllamaCompleter {
    client: reqwest::Client,
    url: String,
    model: String,
    temperature: f32,
}

impl OllamaCompleter {
    pub fn new(config: &CompletionConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("completion.model required for Ollama provider"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string()),
            model,
            temperature: config.temperature,
        })
    }
}

#[async_trait]
impl Completer for OllamaCompleter {
    fn provider(&self) -> &str {
        "ollama"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "stream": false,
            "options": {"temperature": self.temperature},
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": request.render_prompt()},
            ],
        });
        let json = post_json_with_retry(
            &self.client,
            &format!("{}/api/chat", self.url.trim_end_matches('/')),
            &[],
            &body,
            COMPLETION_RETRIES,
            "Ollama",
        )
        .await?;
        json.pointer("/message/content")
            .and_then(|c| c.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing message content"))
    }
}
