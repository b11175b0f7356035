//! Approximate layout recovery from per-page text.
//!
//! Text extractors that only yield page text (PDF text layers, plain
//! text) still need spans with regions. Each non-blank line becomes one
//! [`TextSpan`]. Its box is derived from the line's position on the page
//! and its character extent, normalized to `[0, 1]` in both axes.

use crate::models::{BBox, ExtractedLayout, TextSpan};

/// Form feed separates pages in plain-text input.
pub const PAGE_BREAK: char = '\u{000C}';

/// Split one page of text into line spans.
///
/// `page` is 1-indexed. Blank lines produce no span but still take up
/// vertical space, so boxes keep their relative position on the page.
pub fn spans_from_page_text(page: u32, text: &str) -> Vec<TextSpan> {
    let lines: Vec<&str> = text.lines().collect();
    if lines.is_empty() {
        return Vec::new();
    }
    let rows = lines.len() as f64;
    let widest = lines
        .iter()
        .map(|l| l.trim_end().chars().count())
        .max()
        .unwrap_or(0)
        .max(1) as f64;

    lines
        .iter()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(row, line)| {
            let indent = line.chars().take_while(|c| c.is_whitespace()).count() as f64;
            let extent = line.trim_end().chars().count() as f64;
            TextSpan {
                page,
                text: line.trim().to_string(),
                bbox: BBox::new(
                    (indent / widest).min(1.0),
                    row as f64 / rows,
                    (extent / widest).min(1.0),
                    (row as f64 + 1.0) / rows,
                ),
            }
        })
        .collect()
}

/// Build a layout from already-split page texts.
pub fn layout_from_pages<S: AsRef<str>>(pages: &[S]) -> ExtractedLayout {
    let spans = pages
        .iter()
        .enumerate()
        .flat_map(|(i, text)| spans_from_page_text(i as u32 + 1, text.as_ref()))
        .collect();
    ExtractedLayout {
        page_count: pages.len() as u32,
        spans,
    }
}

/// Build a layout from plain text, treating form feeds as page breaks.
pub fn layout_from_plain_text(text: &str) -> ExtractedLayout {
    let pages: Vec<&str> = text.split(PAGE_BREAK).collect();
    layout_from_pages(&pages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_lines_keep_position() {
        let spans = spans_from_page_text(1, "Title\n\n  Body line");
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[1].text, "Body line");
        assert!((spans[1].bbox.y0 - 2.0 / 3.0).abs() < 1e-9);
        assert!(spans[1].bbox.x0 > 0.0);
        assert!(spans.iter().all(|s| s.bbox.is_valid()));
    }

    #[test]
    fn test_plain_text_pages() {
        let layout = layout_from_plain_text("page one\u{000C}\u{000C}page three");
        assert_eq!(layout.page_count, 3);
        let pages: Vec<u32> = layout.spans.iter().map(|s| s.page).collect();
        assert_eq!(pages, vec![1, 3]);
    }

    #[test]
    fn test_empty_page() {
        assert!(spans_from_page_text(1, "").is_empty());
        assert!(spans_from_page_text(1, "   \n  ").is_empty());
    }
}
