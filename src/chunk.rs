//! Paragraph-boundary text chunker.
//!
//! Each `\n\n`-separated paragraph becomes its own chunk, so chunk numbering
//! follows the paragraph order of the document. A paragraph made only of
//! markdown headings is folded into the paragraph after it. A paragraph over
//! `max_tokens` (approximated as four characters per token) is hard-split at
//! the nearest newline or space.

use sha2::{Digest, Sha256};

const CHARS_PER_TOKEN: usize = 4;

fn is_heading_only(para: &str) -> bool {
    para.lines().all(|l| l.trim_start().starts_with('#'))
}

pub fn split_paragraphs(text: &str, max_tokens: usize) -> Vec<String> {
    let max_chars = (max_tokens * CHARS_PER_TOKEN).max(1);
    let mut chunks = Vec::new();
    let mut heading = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }
        if is_heading_only(trimmed) {
            if !heading.is_empty() {
                heading.push('\n');
            }
            heading.push_str(trimmed);
            continue;
        }

        let body = if heading.is_empty() {
            trimmed.to_string()
        } else {
            format!("{}\n{}", std::mem::take(&mut heading), trimmed)
        };
        if body.len() <= max_chars {
            chunks.push(body);
        } else {
            hard_split(&body, max_chars, &mut chunks);
        }
    }

    // Trailing headings with no body still carry searchable text.
    if !heading.is_empty() {
        hard_split(&heading, max_chars, &mut chunks);
    }
    chunks
}

fn hard_split(text: &str, max_chars: usize, chunks: &mut Vec<String>) {
    let mut remaining = text;
    while !remaining.is_empty() {
        let mut split_at = remaining.len().min(max_chars);
        while !remaining.is_char_boundary(split_at) {
            split_at -= 1;
        }
        if split_at == 0 {
            // First char is wider than the budget.
            split_at = remaining
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(remaining.len());
        }
        let actual_split = if split_at < remaining.len() {
            remaining[..split_at]
                .rfind('\n')
                .or_else(|| remaining[..split_at].rfind(' '))
                .filter(|pos| *pos > 0)
                .map(|pos| pos + 1)
                .unwrap_or(split_at)
        } else {
            split_at
        };
        let piece = remaining[..actual_split].trim();
        if !piece.is_empty() {
            chunks.push(piece.to_string());
        }
        remaining = &remaining[actual_split..];
    }
}

/// Hex SHA-256 of a chunk's text.
pub fn text_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
