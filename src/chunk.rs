//! Overlapping window chunker.
//!
//! Splits extracted text into windows of roughly `max_tokens` tokens (at
//! about four characters per token) where consecutive windows share
//! `overlap_tokens` worth of text. A window end is pulled back to the last
//! whitespace in its final fifth when one exists, so words are rarely cut.
//!
//! Chunk identifiers are derived from (source path, sequence index,
//! fingerprint): re-chunking unchanged content yields the same ids, while
//! any content change yields fresh ones.

use sha2::{Digest, Sha256};

use crate::config::ChunkingConfig;
use crate::models::Chunk;

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;
/// Lower bound on a window, whatever `max_tokens` says.
const MIN_WINDOW_CHARS: usize = 200;

/// Identity of the source being chunked.
#[derive(Debug, Clone, Copy)]
pub struct SourceRef<'a> {
    pub path: &'a str,
    pub scope: &'a str,
    pub fingerprint: &'a str,
    pub ext: &'a str,
}

/// Deterministic chunk id: sha256 over `path \0 index \0 fingerprint`.
pub fn chunk_id(path: &str, index: i64, fingerprint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update([0u8]);
    hasher.update(index.to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(fingerprint.as_bytes());
    hex::encode(hasher.finalize())
}

/// Split `text` into overlapping chunks with contiguous indices from 0.
/// Whitespace-only text produces no chunks.
pub fn chunk_text(source: SourceRef<'_>, text: &str, settings: &ChunkingConfig) -> Vec<Chunk> {
    let window = (settings.max_tokens * CHARS_PER_TOKEN).max(MIN_WINDOW_CHARS);
    let overlap = (settings.overlap_tokens * CHARS_PER_TOKEN).min(window / 2);

    let mut chunks = Vec::new();
    let len = text.len();
    let mut start = 0usize;

    while start < len {
        let mut end = floor_boundary(text, (start + window).min(len));
        if end < len {
            let soft_floor = ceil_boundary(text, start + window * 4 / 5);
            if soft_floor < end {
                if let Some(ws) = text[soft_floor..end].rfind(|c: char| c.is_ascii_whitespace()) {
                    end = soft_floor + ws + 1;
                }
            }
        }
        if end <= start {
            // A single char wider than the window; take it whole.
            end = ceil_boundary(text, start + 1);
        }

        let piece = text[start..end].trim();
        if !piece.is_empty() {
            let index = chunks.len() as i64;
            chunks.push(Chunk {
                id: chunk_id(source.path, index, source.fingerprint),
                source_path: source.path.to_string(),
                scope: source.scope.to_string(),
                chunk_index: index,
                start,
                end,
                fingerprint: source.fingerprint.to_string(),
                ext: source.ext.to_string(),
                text: piece.to_string(),
            });
        }

        if end >= len {
            break;
        }
        let next = ceil_boundary(text, end.saturating_sub(overlap));
        start = if next > start { next } else { end };
    }

    chunks
}

fn floor_boundary(text: &str, mut idx: usize) -> usize {
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_boundary(text: &str, mut idx: usize) -> usize {
    if idx >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}
