//! Page-bounded span chunker.
//!
//! Merges a document's [`TextSpan`]s into [`ChunkDraft`]s that respect a
//! configurable `max_tokens` limit. Spans merge only when they sit on the
//! same page and are adjacent in reading order, so every chunk resolves to
//! exactly one page and one bounding box (the union of its spans).
//!
//! Each chunk receives a UUID plus a SHA-256 hash of its text.
//!
//! # Algorithm
//!
//! 1. Convert `max_tokens` to `max_chars` using a 4 chars/token ratio.
//! 2. Walk spans in reading order, skipping blank ones.
//! 3. Accumulate spans into a buffer until the page changes or adding the
//!    next span would exceed `max_chars`.
//! 4. When either happens, flush the buffer as a chunk and start a new one.
//! 5. If a single span exceeds `max_chars`, hard-split its text at the
//!    nearest newline or space boundary; each piece keeps the span's box.
//!
//! A document with no text yields no chunks.
//!
//! # Example
//!
//! ```rust
//! use casesheet_core::chunk::chunk_spans;
//! use casesheet_core::models::{BBox, TextSpan};
//!
//! let spans = vec![
//!     TextSpan { page: 1, text: "Salario diario".into(), bbox: BBox::new(0.0, 0.0, 0.5, 0.1) },
//!     TextSpan { page: 1, text: "$ 250.00".into(), bbox: BBox::new(0.0, 0.1, 0.3, 0.2) },
//! ];
//! let chunks = chunk_spans("doc-123", &spans, 700);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].bbox, BBox::new(0.0, 0.0, 0.5, 0.2));
//! ```

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{BBox, ChunkDraft, TextSpan};

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

struct Buffer {
    page: u32,
    bbox: BBox,
    text: String,
}

/// Merge spans into page-bounded chunks, respecting `max_tokens`.
///
/// # Guarantees
///
/// - Chunk indices are contiguous: `0, 1, 2, …, N-1`.
/// - Every chunk's spans come from one page, in reading order.
/// - A chunk's box is the union of the boxes of the spans it contains.
pub fn chunk_spans(document_id: &str, spans: &[TextSpan], max_tokens: usize) -> Vec<ChunkDraft> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;
    let mut chunks = Vec::new();
    let mut current: Option<Buffer> = None;

    for span in spans {
        let trimmed = span.text.trim();
        if trimmed.is_empty() {
            continue;
        }

        let fits = current.as_ref().is_some_and(|buf| {
            buf.page == span.page && buf.text.len() + 1 + trimmed.len() <= max_chars
        });

        if fits {
            if let Some(buf) = current.as_mut() {
                buf.text.push('\n');
                buf.text.push_str(trimmed);
                buf.bbox = buf.bbox.union(&span.bbox);
            }
            continue;
        }

        if let Some(buf) = current.take() {
            push_chunk(&mut chunks, document_id, buf.page, buf.bbox, &buf.text);
        }

        if trimmed.len() > max_chars {
            for piece in hard_split(trimmed, max_chars) {
                push_chunk(&mut chunks, document_id, span.page, span.bbox, piece);
            }
        } else {
            current = Some(Buffer {
                page: span.page,
                bbox: span.bbox,
                text: trimmed.to_string(),
            });
        }
    }

    if let Some(buf) = current {
        push_chunk(&mut chunks, document_id, buf.page, buf.bbox, &buf.text);
    }

    chunks
}

/// Split oversized text into pieces of at most `max_chars` bytes, preferring
/// newline or space boundaries.
fn hard_split(text: &str, max_chars: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        let split_at = snap_to_char_boundary(remaining, remaining.len().min(max_chars));
        let split_at = if split_at == 0 {
            remaining
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(remaining.len())
        } else {
            split_at
        };
        let actual_split = if split_at < remaining.len() {
            remaining[..split_at]
                .rfind('\n')
                .or_else(|| remaining[..split_at].rfind(' '))
                .map(|pos| pos + 1)
                .unwrap_or(split_at)
        } else {
            split_at
        };
        let piece = remaining[..actual_split].trim();
        if !piece.is_empty() {
            pieces.push(piece);
        }
        remaining = &remaining[actual_split..];
    }
    pieces
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn push_chunk(chunks: &mut Vec<ChunkDraft>, document_id: &str, page: u32, bbox: BBox, text: &str) {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    chunks.push(ChunkDraft {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: chunks.len() as i64,
        page,
        bbox,
        text: text.to_string(),
        hash,
    });
}
