//! Paragraph-boundary text chunker with optional overlap.
//!
//! Splits document text into [`Chunk`]s that respect a configurable
//! `max_tokens` limit. Splitting occurs on paragraph boundaries (`\n\n`)
//! so each chunk stays semantically coherent; paragraphs longer than the
//! limit are hard-split at the nearest newline or space.
//!
//! When `overlap_tokens > 0`, each chunk after the first begins with the
//! trailing words of its predecessor, so a sentence cut by a boundary is
//! still retrievable as a whole from one side.
//!
//! # Example
//!
//! ```rust
//! use oraculum_core::chunk::chunk_text;
//!
//! let chunks = chunk_text("doc-123", "Hello world.\n\nSecond paragraph.", 700, 0);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].chunk_index, 0);
//! ```

use uuid::Uuid;

use crate::models::{sha256_hex, Chunk};

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Split text into chunks on paragraph boundaries, respecting `max_tokens`.
///
/// # Guarantees
///
/// - Blank text yields no chunks.
/// - Chunk indices are contiguous: `0, 1, 2, …, N-1`.
/// - No chunk is longer than `max_tokens × 4` bytes, except when a single
///   word exceeds the limit.
/// - Splits never land inside a multi-byte UTF-8 sequence.
pub fn chunk_text(
    document_id: &str,
    text: &str,
    max_tokens: usize,
    overlap_tokens: usize,
) -> Vec<Chunk> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
    let overlap_chars = (overlap_tokens * CHARS_PER_TOKEN).min(max_chars / 2);

    let mut out = ChunkSink::new(document_id);
    let mut buf = String::new();
    // `fresh` is false while `buf` holds only text carried over from the
    // previous chunk.
    let mut fresh = false;

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        if trimmed.len() > max_chars {
            if fresh {
                out.push(&buf);
            }
            buf.clear();
            fresh = false;

            let pieces = split_long(trimmed, max_chars, overlap_chars);
            for piece in &pieces {
                out.push(piece);
            }
            if let Some(last) = pieces.last() {
                buf = overlap_tail(last, overlap_chars).to_string();
            }
            continue;
        }

        let would_be = if buf.is_empty() {
            trimmed.len()
        } else {
            buf.len() + 2 + trimmed.len()
        };

        if would_be > max_chars {
            if fresh {
                out.push(&buf);
                buf = overlap_tail(&buf, overlap_chars).to_string();
            }
            if !buf.is_empty() && buf.len() + 2 + trimmed.len() > max_chars {
                buf.clear();
            }
        }

        if !buf.is_empty() {
            buf.push_str("\n\n");
        }
        buf.push_str(trimmed);
        fresh = true;
    }

    if fresh {
        out.push(&buf);
    }

    out.chunks
}

struct ChunkSink<'a> {
    document_id: &'a str,
    chunks: Vec<Chunk>,
}

impl<'a> ChunkSink<'a> {
    fn new(document_id: &'a str) -> Self {
        Self {
            document_id,
            chunks: Vec::new(),
        }
    }

    fn push(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        let index = self.chunks.len() as i64;
        self.chunks.push(make_chunk(self.document_id, index, text));
    }
}

/// Hard-split an oversized paragraph into pieces of at most `max_chars`,
/// preferring newline then space boundaries. Consecutive pieces share up
/// to `overlap_chars` of text.
fn split_long(text: &str, max_chars: usize, overlap_chars: usize) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut start = 0usize;

    while start < text.len() {
        let remaining = &text[start..];
        if remaining.len() <= max_chars {
            pieces.push(remaining.trim().to_string());
            break;
        }

        let mut split_at = snap_back(remaining, max_chars);
        if split_at == 0 {
            split_at = snap_forward(remaining, 1);
        }
        let actual = remaining[..split_at]
            .rfind('\n')
            .or_else(|| remaining[..split_at].rfind(' '))
            .map(|pos| pos + 1)
            .filter(|&pos| pos > 0)
            .unwrap_or(split_at);

        let piece = remaining[..actual].trim();
        if !piece.is_empty() {
            pieces.push(piece.to_string());
        }

        let mut next = actual;
        if overlap_chars > 0 {
            let back = snap_forward(remaining, actual.saturating_sub(overlap_chars));
            let aligned = remaining[back..actual]
                .find(char::is_whitespace)
                .map(|pos| back + pos + 1)
                .unwrap_or(back);
            if aligned > 0 && aligned < actual {
                next = aligned;
            }
        }
        start += next;
    }

    pieces.retain(|p| !p.is_empty());
    pieces
}

/// The trailing words of `text` fitting in `overlap_chars` bytes.
fn overlap_tail(text: &str, overlap_chars: usize) -> &str {
    if overlap_chars == 0 || text.is_empty() {
        return "";
    }
    if text.len() <= overlap_chars {
        return text;
    }
    let start = snap_forward(text, text.len() - overlap_chars);
    let tail = &text[start..];
    match tail.find(char::is_whitespace) {
        Some(pos) => tail[pos..].trim(),
        None => tail.trim(),
    }
}

/// Largest char boundary `<= index`.
fn snap_back(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Smallest char boundary `>= index`.
fn snap_forward(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

fn make_chunk(document_id: &str, index: i64, text: &str) -> Chunk {
    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        hash: sha256_hex(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_text("doc1", "Hello, world!", 700, 0);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!(chunks[0].document_id, "doc1");
    }

    #[test]
    fn test_blank_text_has_no_chunks() {
        assert!(chunk_text("doc1", "", 700, 0).is_empty());
        assert!(chunk_text("doc1", " \n\n \n", 700, 0).is_empty());
    }

    #[test]
    fn test_multiple_paragraphs_under_limit() {
        let text = "First paragraph.\n\nSecond paragraph.\n\nThird paragraph.";
        let chunks = chunk_text("doc1", text, 700, 0);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.contains("First paragraph."));
        assert!(chunks[0].text.contains("Third paragraph."));
    }

    #[test]
    fn test_chunk_indices_contiguous() {
        let text = (0..50)
            .map(|i| format!("Paragraph number {}.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunks = chunk_text("doc1", &text, 10, 2);
        assert!(chunks.len() > 1);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64, "Index mismatch at position {}", i);
        }
    }

    #[test]
    fn test_chunks_respect_limit() {
        let text = (0..40)
            .map(|i| format!("Sentence {} about the esplanade.", i))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = chunk_text("doc1", &text, 20, 4);
        for c in &chunks {
            assert!(c.text.len() <= 80, "chunk too long: {}", c.text.len());
        }
    }

    #[test]
    fn test_overlap_carries_trailing_words() {
        let text = "Alpha beta gamma delta.\n\nEpsilon zeta eta theta.\n\nIota kappa lambda mu.";
        let chunks = chunk_text("doc1", text, 8, 2);
        assert!(chunks.len() >= 2);
        assert!(chunks[1].text.contains("delta."));
    }

    #[test]
    fn test_hard_split_overlap_makes_progress() {
        let text = "palavra ".repeat(200);
        let chunks = chunk_text("doc1", &text, 10, 3);
        assert!(chunks.len() > 1);
        let total: usize = chunks.iter().map(|c| c.text.len()).sum();
        assert!(total >= text.trim().len());
    }

    #[test]
    fn test_multibyte_utf8_chars() {
        let text = "Praça dos Três Poderes é o coração cívico de Brasília. ".repeat(30);
        let chunks = chunk_text("doc1", &text, 7, 2);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(!c.text.is_empty());
        }
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta";
        let c1 = chunk_text("doc1", text, 2, 0);
        let c2 = chunk_text("doc1", text, 2, 0);
        assert_eq!(c1.len(), c2.len());
        for (a, b) in c1.iter().zip(c2.iter()) {
            assert_eq!(a.text, b.text);
            assert_eq!(a.hash, b.hash);
            assert_eq!(a.chunk_index, b.chunk_index);
        }
    }
}
