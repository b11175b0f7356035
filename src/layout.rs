//! Layout extraction for uploaded files.
//!
//! PDFs are read page by page from their text layer with `pdf-extract`;
//! plain text is split on form feeds. Both go through the core line-span
//! builder so every span carries a normalized box. Scanned PDFs with no
//! text layer yield pages without spans.

use anyhow::Result;
use async_trait::async_trait;
use casesheet_core::error::PipelineError;
use casesheet_core::layout::{layout_from_pages, layout_from_plain_text};
use casesheet_core::models::ExtractedLayout;
use casesheet_core::providers::LayoutExtractor;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_TEXT: &str = "text/plain";

/// Content type for an uploaded filename.
pub fn content_type_for(filename: &str) -> Option<&'static str> {
    let lower = filename.to_lowercase();
    if lower.ends_with(".pdf") {
        Some(MIME_PDF)
    } else if lower.ends_with(".txt") || lower.ends_with(".text") {
        Some(MIME_TEXT)
    } else {
        None
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FileLayout;

fn extract_pdf(bytes: &[u8]) -> Result<ExtractedLayout> {
    let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
        .map_err(|e| PipelineError::PermanentInput(format!("PDF extraction failed: {}", e)))?;
    if pages.is_empty() {
        return Err(PipelineError::PermanentInput("PDF has no pages".into()).into());
    }
    Ok(layout_from_pages(&pages))
}

#[async_trait]
impl LayoutExtractor for FileLayout {
    async fn extract(&self, bytes: &[u8], content_type: &str) -> Result<ExtractedLayout> {
        match content_type {
            MIME_PDF => {
                let bytes = bytes.to_vec();
                // pdf-extract is CPU-bound and can panic on malformed input.
                match tokio::task::spawn_blocking(move || extract_pdf(&bytes)).await {
                    Ok(result) => result,
                    Err(e) => Err(PipelineError::PermanentInput(format!(
                        "PDF extraction aborted: {}",
                        e
                    ))
                    .into()),
                }
            }
            MIME_TEXT => {
                let text = std::str::from_utf8(bytes).map_err(|e| {
                    PipelineError::PermanentInput(format!("not UTF-8 text: {}", e))
                })?;
                Ok(layout_from_plain_text(text))
            }
            other => Err(PipelineError::PermanentInput(format!(
                "unsupported content-type: {}",
                other
            ))
            .into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("Contrato.PDF"), Some(MIME_PDF));
        assert_eq!(content_type_for("notas.txt"), Some(MIME_TEXT));
        assert_eq!(content_type_for("foto.jpg"), None);
    }

    #[tokio::test]
    async fn test_plain_text_pages() {
        let layout = FileLayout
            .extract("Página uno\u{000C}Página dos".as_bytes(), MIME_TEXT)
            .await
            .unwrap();
        assert_eq!(layout.page_count, 2);
        assert_eq!(layout.spans[1].page, 2);
    }

    #[tokio::test]
    async fn test_corrupt_pdf_is_permanent() {
        let err = FileLayout
            .extract(b"%PDF-1.4 not really", MIME_PDF)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::PermanentInput(_))
        ));
    }

    #[tokio::test]
    async fn test_unsupported_type_is_permanent() {
        let err = FileLayout.extract(b"GIF89a", "image/gif").await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::PermanentInput(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_permanent() {
        assert!(FileLayout.extract(&[0xff, 0xfe, 0xfd], MIME_TEXT).await.is_err());
    }
}
