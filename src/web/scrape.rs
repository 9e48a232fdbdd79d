//! Page fetching for web results that came back without text.

use std::time::Duration;
use tokio::task::JoinSet;

use crate::models::{WebFetch, WebResult};
use crate::readers::html_to_text;

/// Fetch up to `limit` pages for results lacking `text`, concurrently.
///
/// Successful fetches fill `text` (plain text, at most `max_chars`
/// characters). One [`WebFetch`] is returned per attempted URL, in result
/// order, whether or not it succeeded.
pub async fn fetch_pages(
    client: &reqwest::Client,
    results: &mut [WebResult],
    limit: usize,
    max_chars: usize,
    timeout: Duration,
) -> Vec<WebFetch> {
    let targets: Vec<(usize, String)> = results
        .iter()
        .enumerate()
        .filter(|(_, r)| r.text.as_deref().map(str::trim).unwrap_or("").is_empty())
        .map(|(i, r)| (i, r.url.clone()))
        .take(limit)
        .collect();
    if targets.is_empty() {
        return Vec::new();
    }

    let mut set = JoinSet::new();
    for (index, url) in targets {
        let client = client.clone();
        set.spawn(async move {
            let outcome = tokio::time::timeout(timeout, fetch_one(&client, &url, max_chars)).await;
            let outcome = match outcome {
                Ok(result) => result,
                Err(_) => Err((None, format!("timed out after {}s", timeout.as_secs()))),
            };
            (index, url, outcome)
        });
    }

    let mut fetches = Vec::new();
    while let Some(joined) = set.join_next().await {
        let (index, url, outcome) = match joined {
            Ok(done) => done,
            Err(e) => {
                tracing::warn!(error = %e, "page fetch task failed");
                continue;
            }
        };
        let fetch = match outcome {
            Ok((status, text)) => {
                let chars = text.chars().count();
                results[index].text = Some(text);
                WebFetch {
                    url,
                    status: Some(status),
                    chars,
                    error: None,
                }
            }
            Err((status, error)) => {
                tracing::debug!(url = %url, error = %error, "page fetch failed");
                WebFetch {
                    url,
                    status,
                    chars: 0,
                    error: Some(error),
                }
            }
        };
        fetches.push((index, fetch));
    }

    fetches.sort_by_key(|(index, _)| *index);
    fetches.into_iter().map(|(_, f)| f).collect()
}

async fn fetch_one(
    client: &reqwest::Client,
    url: &str,
    max_chars: usize,
) -> Result<(u16, String), (Option<u16>, String)> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| (None, e.to_string()))?;
    let status = response.status().as_u16();
    if !response.status().is_success() {
        return Err((Some(status), format!("HTTP {}", status)));
    }
    let body = response
        .text()
        .await
        .map_err(|e| (Some(status), e.to_string()))?;
    let text = page_text(&body, max_chars);
    if text.is_empty() {
        return Err((Some(status), "page has no extractable text".to_string()));
    }
    Ok((status, text))
}

fn page_text(body: &str, max_chars: usize) -> String {
    html_to_text(body).chars().take(max_chars).collect()
}
