//! Word-bounded document chunking.

use serde::{Deserialize, Serialize};

/// Where a chunk may close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkBoundary {
    /// Close exactly at the word limit.
    #[default]
    Words,
    /// Close after the last sentence terminator inside the window, or at the
    /// limit when the window has none.
    Sentence,
}

fn ends_sentence(word: &str) -> bool {
    let trimmed = word.trim_end_matches(['"', '\'', ')', ']', '\u{201d}', '\u{2019}']);
    trimmed.ends_with(['.', '!', '?', '\u{2026}'])
}

/// Splits `text` into chunks of at most `limit` whitespace-separated words.
///
/// Words inside a chunk are joined with a single space. An empty or
/// whitespace-only document yields no chunks. A `limit` of zero is treated
/// as one.
pub fn split_into_chunks(text: &str, limit: usize, boundary: ChunkBoundary) -> Vec<String> {
    let limit = limit.max(1);
    let words: Vec<&str> = text.split_whitespace().collect();
    let mut chunks = Vec::with_capacity(words.len().div_ceil(limit));

    let mut start = 0;
    while start < words.len() {
        let window_end = (start + limit).min(words.len());
        let mut end = window_end;

        if boundary == ChunkBoundary::Sentence && window_end < words.len() {
            if let Some(last) = words[start..window_end]
                .iter()
                .rposition(|w| ends_sentence(w))
            {
                end = start + last + 1;
            }
        }

        chunks.push(words[start..end].join(" "));
        start = end;
    }

    chunks
}
