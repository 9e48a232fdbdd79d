//! Answer composition: turning local hits and web results into one ranked
//! context, and attributing the synthesized answer to its sources.
//!
//! Context items carry a short label (`L1`, `W2`, ...) that the completer
//! is asked to cite. When an answer cites labels, attribution is limited to
//! the cited items; otherwise every item handed to the completer counts.

use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use crate::completion::{CompletionRequest, Completer};
use crate::models::{Hit, WebResult};

/// Characters of content compared when deduplicating merged results.
const DEDUP_PREFIX_CHARS: usize = 200;
/// Characters of item text considered by [`sequence_ratio`].
const SEQUENCE_WINDOW_CHARS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Local,
    Web,
}

/// One unit of context offered to answer synthesis.
#[derive(Debug, Clone, Serialize)]
pub struct ContextItem {
    pub label: String,
    pub origin: Origin,
    pub title: String,
    /// Source path for local items, URL for web items.
    pub location: String,
    pub text: String,
    pub score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
}

/// Sources an answer is attributed to, kept apart by origin.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnswerSources {
    pub local: Vec<String>,
    pub web: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Synthesis {
    pub answer: Option<String>,
    pub answer_sources: Option<AnswerSources>,
    pub answer_error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    Balanced,
    LocalFirst,
    WebFirst,
    Interleaved,
}

impl FromStr for MergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "balanced" => Ok(MergeStrategy::Balanced),
            "local_first" => Ok(MergeStrategy::LocalFirst),
            "web_first" => Ok(MergeStrategy::WebFirst),
            "interleaved" => Ok(MergeStrategy::Interleaved),
            other => Err(format!(
                "unknown strategy '{}' (expected balanced, local_first, web_first, interleaved)",
                other
            )),
        }
    }
}

fn file_name(path: &str) -> String {
    std::path::Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string())
}

/// Local hits as context, scored by vector similarity.
pub fn local_items(hits: &[Hit]) -> Vec<ContextItem> {
    hits.iter()
        .enumerate()
        .map(|(i, hit)| ContextItem {
            label: format!("L{}", i + 1),
            origin: Origin::Local,
            title: file_name(&hit.path),
            location: hit.path.clone(),
            text: hit.text.clone(),
            score: hit.score,
            vector_score: Some(hit.score),
            engine: None,
        })
        .collect()
}

/// Web results as context, scored by engine position and content relevance.
pub fn web_items(results: &[WebResult], query: &str) -> Vec<ContextItem> {
    results
        .iter()
        .enumerate()
        .map(|(i, r)| {
            let body = r.text.as_deref().unwrap_or(&r.snippet);
            let position = (1.0 - i as f32 * 0.08).max(0.5);
            let content = relevance_score(query, &r.snippet, &r.title);
            ContextItem {
                label: format!("W{}", i + 1),
                origin: Origin::Web,
                title: r.title.clone(),
                location: r.url.clone(),
                text: body.to_string(),
                score: position * 0.4 + content * 0.6,
                vector_score: None,
                engine: Some(r.engine.clone()),
            }
        })
        .collect()
}

/// Local hits rescored by lexical relevance for cross-source ranking.
pub fn rescore_local(items: Vec<ContextItem>, query: &str) -> Vec<ContextItem> {
    items
        .into_iter()
        .map(|mut item| {
            let mut relevance = relevance_score(query, &item.text, &item.title);
            if item.vector_score.is_some_and(|s| s >= 0.5) {
                relevance *= 1.2;
            }
            item.score = relevance.min(1.0);
            item
        })
        .collect()
}

/// Lexical relevance of `text`/`title` to `query`, in `[0, 1]`.
///
/// An exact phrase in the title scores 1.0 and in the text 0.95; otherwise
/// term coverage, term frequency and sequence similarity are blended
/// 0.5 / 0.3 / 0.2.
pub fn relevance_score(query: &str, text: &str, title: &str) -> f32 {
    let query = query.trim().to_lowercase();
    let text = text.trim().to_lowercase();
    let title = title.trim().to_lowercase();
    if query.is_empty() {
        return 0.0;
    }
    if title.contains(&query) {
        return 1.0;
    }
    if text.contains(&query) {
        return 0.95;
    }

    let combined = format!("{} {}", title, text);
    let terms: HashSet<&str> = query.split_whitespace().collect();
    let words: HashSet<&str> = combined.split_whitespace().collect();
    let coverage = terms.iter().filter(|t| words.contains(*t)).count() as f32 / terms.len() as f32;

    let occurrences: usize = terms.iter().map(|t| combined.matches(*t).count()).sum();
    let frequency = (occurrences as f32 / (terms.len() as f32 * 3.0)).min(1.0);

    let window: String = combined.chars().take(SEQUENCE_WINDOW_CHARS).collect();
    let sequence = sequence_ratio(&query, &window);

    (coverage * 0.5 + frequency * 0.3 + sequence * 0.2).min(1.0)
}

/// Similarity ratio `2M / (|a| + |b|)` where `M` counts characters in
/// matching blocks found by recursive longest-common-substring.
pub fn sequence_ratio(a: &str, b: &str) -> f32 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    2.0 * matching_chars(&a, &b) as f32 / total as f32
}

fn matching_chars(a: &[char], b: &[char]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    // Longest common substring with a rolling row.
    let mut prev = vec![0usize; b.len() + 1];
    let mut best = (0usize, 0usize, 0usize); // (len, end_a, end_b)
    for i in 1..=a.len() {
        let mut row = vec![0usize; b.len() + 1];
        for j in 1..=b.len() {
            if a[i - 1] == b[j - 1] {
                row[j] = prev[j - 1] + 1;
                if row[j] > best.0 {
                    best = (row[j], i, j);
                }
            }
        }
        prev = row;
    }
    let (len, end_a, end_b) = best;
    if len == 0 {
        return 0;
    }
    len + matching_chars(&a[..end_a - len], &b[..end_b - len])
        + matching_chars(&a[end_a..], &b[end_b..])
}

fn by_score_desc(a: &ContextItem, b: &ContextItem) -> Ordering {
    b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal)
}

/// Merge two ranked lists into at most `max` items.
///
/// `local_first` / `web_first` boost one side's scores by 30% (capped at
/// 1.0) before ranking; `interleaved` alternates local and web without
/// rescoring. Ranked strategies drop repeats of a location or of the same
/// leading content.
pub fn merge_ranked(
    mut local: Vec<ContextItem>,
    mut web: Vec<ContextItem>,
    strategy: MergeStrategy,
    max: usize,
) -> Vec<ContextItem> {
    match strategy {
        MergeStrategy::Interleaved => {
            let mut merged = Vec::with_capacity(local.len() + web.len());
            let mut l = local.into_iter();
            let mut w = web.into_iter();
            loop {
                let (a, b) = (l.next(), w.next());
                if a.is_none() && b.is_none() {
                    break;
                }
                merged.extend(a);
                merged.extend(b);
            }
            merged.truncate(max);
            return merged;
        }
        MergeStrategy::LocalFirst => local
            .iter_mut()
            .for_each(|i| i.score = (i.score * 1.3).min(1.0)),
        MergeStrategy::WebFirst => web
            .iter_mut()
            .for_each(|i| i.score = (i.score * 1.3).min(1.0)),
        MergeStrategy::Balanced => {}
    }

    let mut all: Vec<ContextItem> = local.into_iter().chain(web).collect();
    all.sort_by(by_score_desc);

    let mut seen_locations = HashSet::new();
    let mut seen_content = HashSet::new();
    let mut out = Vec::new();
    for item in all {
        if out.len() >= max {
            break;
        }
        let prefix: String = item
            .text
            .chars()
            .take(DEDUP_PREFIX_CHARS)
            .collect::<String>()
            .trim()
            .to_lowercase();
        if seen_locations.contains(&item.location) && item.origin == Origin::Web {
            continue;
        }
        if !prefix.is_empty() && seen_content.contains(&prefix) {
            continue;
        }
        seen_locations.insert(item.location.clone());
        if !prefix.is_empty() {
            seen_content.insert(prefix);
        }
        out.push(item);
    }
    out
}

/// Deduplicated sources in descending-score order, limited to the labels
/// cited in `answer` when it cites any.
pub fn attribute(answer: &str, items: &[ContextItem]) -> AnswerSources {
    let cited: Vec<&ContextItem> = items
        .iter()
        .filter(|i| answer.contains(&format!("[{}]", i.label)))
        .collect();
    let mut used: Vec<&ContextItem> = if cited.is_empty() {
        items.iter().collect()
    } else {
        cited
    };
    used.sort_by(|a, b| by_score_desc(a, b));

    let mut sources = AnswerSources::default();
    let mut seen = HashSet::new();
    for item in used {
        if !seen.insert((item.origin, item.location.clone())) {
            continue;
        }
        match item.origin {
            Origin::Local => sources.local.push(item.location.clone()),
            Origin::Web => sources.web.push(item.location.clone()),
        }
    }
    sources
}

/// Run answer synthesis under `timeout`. Failures and timeouts become
/// `answer_error`; they never discard the caller's hits.
pub async fn synthesize(
    completer: &dyn Completer,
    question: &str,
    items: Vec<ContextItem>,
    timeout: Duration,
    max_context_chars: usize,
) -> Synthesis {
    if completer.provider() == "disabled" {
        return Synthesis::default();
    }

    let request = CompletionRequest {
        question: question.to_string(),
        items,
        max_context_chars,
    };
    match tokio::time::timeout(timeout, completer.complete(&request)).await {
        Ok(Ok(answer)) => {
            let sources = attribute(&answer, &request.items);
            Synthesis {
                answer: Some(answer),
                answer_sources: Some(sources),
                answer_error: None,
            }
        }
        Ok(Err(e)) => {
            tracing::warn!(provider = completer.provider(), error = %e, "answer synthesis failed");
            Synthesis {
                answer: None,
                answer_sources: None,
                answer_error: Some(format!("answer synthesis failed: {}", e)),
            }
        }
        Err(_) => {
            tracing::warn!(provider = completer.provider(), "answer synthesis timed out");
            Synthesis {
                answer: None,
                answer_sources: None,
                answer_error: Some(format!(
                    "answer synthesis timed out after {}s",
                    timeout.as_secs()
                )),
            }
        }
    }
}
