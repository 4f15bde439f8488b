//! Overlapping window chunker.
//!
//! Splits extracted text into [`Chunk`]s of at most `max_tokens` estimated
//! tokens, with consecutive chunks sharing roughly `overlap_tokens` of
//! text. A window prefers to end on a paragraph break, then a line break,
//! then a space, as long as that break lies in the back half of the window;
//! otherwise it is cut at the nearest UTF-8 boundary.
//!
//! Chunk ids are UUID v5 values derived from `(path, fingerprint, ordinal,
//! start, end)`, so unchanged content always maps to the same point ids in
//! the vector store.

use uuid::Uuid;

use crate::config::ChunkingConfig;
use crate::models::Chunk;

/// Approximate chars-per-token ratio used for every token estimate.
pub const CHARS_PER_TOKEN: usize = 4;

const CHUNK_NAMESPACE: Uuid = Uuid::from_u128(0x6b1f_3c2e_9a47_5d08_b1e2_4f6a_8c0d_7e35);

pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(CHARS_PER_TOKEN)
}

pub fn chunk_id(path: &str, fingerprint: &str, ordinal: usize, start: usize, end: usize) -> String {
    let name = format!("{}\0{}\0{}\0{}\0{}", path, fingerprint, ordinal, start, end);
    Uuid::new_v5(&CHUNK_NAMESPACE, name.as_bytes()).to_string()
}

/// Split `text` into ordered, linked chunks. Empty or whitespace-only text
/// produces no chunks.
pub fn chunk_document(
    path: &str,
    fingerprint: &str,
    text: &str,
    config: &ChunkingConfig,
) -> Vec<Chunk> {
    let spans = split_spans(text, config.max_tokens, config.overlap_tokens);

    let mut chunks: Vec<Chunk> = spans
        .into_iter()
        .enumerate()
        .map(|(ordinal, (start, end))| {
            let piece = &text[start..end];
            Chunk {
                id: chunk_id(path, fingerprint, ordinal, start, end),
                path: path.to_string(),
                fingerprint: fingerprint.to_string(),
                ordinal,
                start,
                end,
                text: piece.to_string(),
                tokens: estimate_tokens(piece),
                prev_id: None,
                next_id: None,
            }
        })
        .collect();

    for i in 0..chunks.len() {
        if i > 0 {
            chunks[i].prev_id = Some(chunks[i - 1].id.clone());
        }
        if i + 1 < chunks.len() {
            chunks[i].next_id = Some(chunks[i + 1].id.clone());
        }
    }

    chunks
}

/// Byte ranges of each window. Ranges never start or end on whitespace.
fn split_spans(text: &str, max_tokens: usize, overlap_tokens: usize) -> Vec<(usize, usize)> {
    let max_chars = (max_tokens * CHARS_PER_TOKEN).max(1);
    let overlap_chars = overlap_tokens * CHARS_PER_TOKEN;
    let mut spans = Vec::new();
    let mut start = skip_whitespace(text, 0);

    while start < text.len() {
        let remaining = text.len() - start;
        let mut end = if remaining <= max_chars {
            text.len()
        } else {
            find_break(text, start, max_chars)
        };
        end = start + text[start..end].trim_end().len();
        if end <= start {
            // Whitespace-only tail.
            break;
        }
        spans.push((start, end));

        if end >= text.trim_end().len() {
            break;
        }

        let mut next = floor_boundary(text, end.saturating_sub(overlap_chars));
        if next <= start {
            next = end;
        } else if let Some(ws) = text[next..end].find(char::is_whitespace) {
            // Start the overlap on a word.
            next += ws;
        }
        start = skip_whitespace(text, next);
    }

    spans
}

/// End offset of a window starting at `start`.
fn find_break(text: &str, start: usize, max_chars: usize) -> usize {
    let hard = floor_boundary(text, start + max_chars);
    let window = &text[start..hard];
    let min = window.len() / 2;

    for sep in ["\n\n", "\n", " "] {
        if let Some(pos) = window.rfind(sep) {
            if pos >= min && pos > 0 {
                return start + pos;
            }
        }
    }

    if hard > start {
        hard
    } else {
        // Window narrower than one character; take the whole character.
        ceil_boundary(text, start + 1)
    }
}

fn skip_whitespace(text: &str, from: usize) -> usize {
    match text[from..].find(|c: char| !c.is_whitespace()) {
        Some(offset) => from + offset,
        None => text.len(),
    }
}

fn floor_boundary(text: &str, mut idx: usize) -> usize {
    if idx >= text.len() {
        return text.len();
    }
    while !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_boundary(text: &str, mut idx: usize) -> usize {
    while idx < text.len() && !text.is_char_boundary(idx) {
        idx += 1;
    }
    idx.min(text.len())
}
