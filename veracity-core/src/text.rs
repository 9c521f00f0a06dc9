//! Text utilities shared by curation, verification, and graph building.
//!
//! Normalization is the single definition of "the same text" across the crate:
//! content hashes, exact verification, and graph label idempotency all go
//! through [`normalize`].

use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "be", "been", "being", "have", "has", "had",
    "do", "does", "did", "will", "would", "shall", "should", "may", "might", "must", "can",
    "could", "of", "in", "to", "for", "with", "on", "at", "from", "by", "about", "as", "into",
    "through", "during", "before", "after", "above", "below", "between", "this", "that",
    "these", "those", "it", "its", "and", "but", "or", "than", "then", "also", "more", "most",
    "such", "which", "who", "whom", "what", "when", "where", "why", "how", "there", "their",
    "they", "them", "our", "we", "you", "your", "his", "her", "she", "him", "not", "no",
];

const NEGATIONS: &[&str] = &[
    "not", "no", "never", "neither", "nor", "without", "lack", "lacks", "cannot", "none",
    "doesn't", "don't", "isn't", "aren't", "wasn't", "weren't", "won't", "didn't", "hasn't",
    "haven't", "shouldn't", "wouldn't", "couldn't", "fails", "fail",
];

/// Text in normalized form, remembering where each character came from.
#[derive(Debug, Clone)]
pub struct NormalizedText {
    pub text: String,
    /// Original char index for every char of `text`.
    offsets: Vec<usize>,
}

impl NormalizedText {
    /// Normalize `input`: NFKC, lowercase, punctuation to spaces, whitespace collapsed.
    pub fn new(input: &str) -> Self {
        let mut text = String::with_capacity(input.len());
        let mut offsets = Vec::with_capacity(input.len());
        let mut pending_space = false;

        for (idx, ch) in input.chars().enumerate() {
            for folded in ch.nfkc().flat_map(char::to_lowercase) {
                if folded.is_alphanumeric() {
                    if pending_space && !text.is_empty() {
                        text.push(' ');
                        offsets.push(idx);
                    }
                    pending_space = false;
                    text.push(folded);
                    offsets.push(idx);
                } else {
                    pending_space = true;
                }
            }
        }

        Self { text, offsets }
    }

    /// Locate `needle` (already normalized) and return the matching original
    /// char range `[start, end)`.
    pub fn find(&self, needle: &str) -> Option<(usize, usize)> {
        if needle.is_empty() {
            return None;
        }
        let byte_start = self.text.find(needle)?;
        let char_start = self.text[..byte_start].chars().count();
        let char_len = needle.chars().count();
        let start = *self.offsets.get(char_start)?;
        let end = *self.offsets.get(char_start + char_len - 1)? + 1;
        Some((start, end))
    }
}

/// Canonical normalized form of a string.
pub fn normalize(input: &str) -> String {
    NormalizedText::new(input).text
}

/// Stable 16-hex-digit SHA-256 digest of the normalized text.
pub fn content_hash(input: &str) -> String {
    let digest = Sha256::digest(normalize(input).as_bytes());
    digest
        .iter()
        .take(8)
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Lowercase word tokens; apostrophes inside words are kept so contractions survive.
pub fn tokens(input: &str) -> Vec<String> {
    input
        .to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .map(|w| w.trim_matches('\''))
        .filter(|w| !w.is_empty())
        .map(String::from)
        .collect()
}

/// Distinct content words in first-occurrence order.
pub fn keywords(input: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    tokens(input)
        .into_iter()
        .filter(|w| w.chars().count() > 2 && !STOP_WORDS.contains(&w.as_str()))
        .filter(|w| !w.contains('\''))
        .filter(|w| seen.insert(w.clone()))
        .collect()
}

/// Whether the statement is phrased negatively.
pub fn is_negated(input: &str) -> bool {
    tokens(input)
        .iter()
        .any(|w| NEGATIONS.contains(&w.as_str()) || w.ends_with("n't"))
}

pub fn word_count(input: &str) -> usize {
    input.split_whitespace().count()
}

/// Prefix of at most `max_chars` characters.
pub fn truncate_chars(input: &str, max_chars: usize) -> &str {
    match input.char_indices().nth(max_chars) {
        Some((idx, _)) => &input[..idx],
        None => input,
    }
}

/// A contiguous slice of a longer document.
#[derive(Debug, Clone, PartialEq)]
pub struct TextWindow {
    /// Char offset of the window start in the original text.
    pub start: usize,
    pub text: String,
}

/// Split text into overlapping windows of about `size` chars, preferring to
/// end each window on a sentence boundary in its second half.
pub fn sentence_windows(input: &str, size: usize, overlap: usize) -> Vec<TextWindow> {
    let chars: Vec<char> = input.chars().collect();
    let size = size.max(1);
    let overlap = overlap.min(size / 2);

    if chars.len() <= size {
        let text = input.trim();
        return if text.is_empty() {
            Vec::new()
        } else {
            vec![TextWindow {
                start: 0,
                text: text.to_string(),
            }]
        };
    }

    let mut windows = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let mut end = (start + size).min(chars.len());
        if end < chars.len() {
            let floor = start + size / 2;
            if let Some(boundary) = (floor..end).rev().find(|&i| {
                matches!(chars[i], '.' | '!' | '?')
                    && chars.get(i + 1).is_some_and(|c| c.is_whitespace())
            }) {
                end = boundary + 1;
            }
        }

        let text: String = chars[start..end].iter().collect();
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            windows.push(TextWindow {
                start,
                text: trimmed.to_string(),
            });
        }

        if end >= chars.len() {
            break;
        }
        start = (end.saturating_sub(overlap)).max(start + 1);
    }
    windows
}

/// The original text around `[start, end)` with `context` chars on either side.
pub fn excerpt_around(input: &str, start: usize, end: usize, context: usize) -> String {
    let chars: Vec<char> = input.chars().collect();
    let from = start.saturating_sub(context);
    let to = (end + context).min(chars.len());
    let mut excerpt: String = chars[from.min(to)..to].iter().collect();
    excerpt = excerpt.split_whitespace().collect::<Vec<_>>().join(" ");
    if from > 0 {
        excerpt.insert_str(0, "...");
    }
    if to < chars.len() {
        excerpt.push_str("...");
    }
    excerpt
}
