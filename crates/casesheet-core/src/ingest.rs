//! Ingest stage: layout extraction and document classification.
//!
//! Reads the original bytes from object storage, extracts page-anchored
//! text spans, classifies the document and persists spans, label and page
//! count in one write. A classification below the confidence threshold is
//! stored as `unknown` so downstream stages never treat a guess as a fact.

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::models::DocLabel;
use crate::providers::{DocumentClassifier, LayoutExtractor, ObjectStore};
use crate::store::{DocumentStore, IngestRecord, Store};

/// Summary of an ingest run, stored as the task result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    pub document_id: String,
    pub label: DocLabel,
    pub confidence: Option<f64>,
    pub page_count: u32,
    pub span_count: usize,
}

pub struct Ingestor<'a> {
    pub store: &'a dyn Store,
    pub objects: &'a dyn ObjectStore,
    pub layout: &'a dyn LayoutExtractor,
    pub classifier: &'a dyn DocumentClassifier,
    /// Classifications below this confidence are stored as `unknown`.
    pub min_confidence: f64,
}

impl Ingestor<'_> {
    pub async fn run(&self, document_id: &str) -> Result<IngestReport> {
        let doc = self
            .store
            .get_document(document_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("document", document_id))?;

        let bytes = self.objects.get(&doc.file_handle).await?;
        let layout = self.layout.extract(&bytes, &doc.content_type).await?;
        let text = layout.full_text();

        let (label, confidence) = if text.trim().is_empty() {
            warn!(document_id, "no extractable text, leaving unclassified");
            (DocLabel::Unknown, None)
        } else {
            match self.classifier.classify(&text, &doc.filename).await {
                Ok(c) if c.label != DocLabel::Unknown && c.confidence >= self.min_confidence => {
                    (c.label, Some(c.confidence))
                }
                Ok(c) => {
                    info!(
                        document_id,
                        candidate = %c.label,
                        confidence = c.confidence,
                        threshold = self.min_confidence,
                        "classification below threshold"
                    );
                    (DocLabel::Unknown, Some(c.confidence))
                }
                Err(e) => {
                    warn!(document_id, classifier = self.classifier.name(), error = %e, "classifier failed");
                    (DocLabel::Unknown, None)
                }
            }
        };

        let page_count = layout.page_count.max(1);
        self.store
            .record_ingest(
                document_id,
                &IngestRecord {
                    label,
                    confidence,
                    page_count,
                    spans: &layout.spans,
                },
            )
            .await?;

        info!(
            document_id,
            %label,
            page_count,
            spans = layout.spans.len(),
            "ingested document"
        );
        Ok(IngestReport {
            document_id: document_id.to_string(),
            label,
            confidence,
            page_count,
            span_count: layout.spans.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::KeywordClassifier;
    use crate::models::DocumentStage;
    use crate::store::memory::InMemoryStore;
    use crate::testing::{document, MemoryObjectStore, MockClassifier, PlainTextLayout};

    async fn ingest_with(
        text: &[u8],
        classifier: &dyn DocumentClassifier,
    ) -> (InMemoryStore, Result<IngestReport>) {
        let store = InMemoryStore::new();
        let objects = MemoryObjectStore::new();
        objects.put("d1", text).await.unwrap();
        store.insert_document(&document("d1", "C1")).await.unwrap();
        let ingestor = Ingestor {
            store: &store,
            objects: &objects,
            layout: &PlainTextLayout,
            classifier,
            min_confidence: 0.5,
        };
        let report = ingestor.run("d1").await;
        (store, report)
    }

    #[tokio::test]
    async fn test_ingest_classifies_and_persists_spans() {
        let text = "RECIBO DE NÓMINA\nPeriodo quincenal\nSalario diario: $450.00\n\u{000C}Percepciones y deducciones";
        let (store, report) = ingest_with(text.as_bytes(), &KeywordClassifier).await;
        let report = report.unwrap();
        assert_eq!(report.label, DocLabel::Payslip);
        assert_eq!(report.page_count, 2);

        let doc = store.get_document("d1").await.unwrap().unwrap();
        assert_eq!(doc.label, Some(DocLabel::Payslip));
        assert_eq!(doc.page_count, 2);
        assert_eq!(doc.stage, DocumentStage::Ingested);
        let spans = store.page_spans("d1").await.unwrap();
        assert_eq!(spans.len(), report.span_count);
        assert!(spans.iter().any(|s| s.page == 2));
    }

    #[tokio::test]
    async fn test_low_confidence_becomes_unknown() {
        let classifier = MockClassifier::new(DocLabel::Contract, 0.3);
        let (store, report) = ingest_with(b"algo de texto", &classifier).await;
        let report = report.unwrap();
        assert_eq!(report.label, DocLabel::Unknown);
        assert_eq!(report.confidence, Some(0.3));
        let doc = store.get_document("d1").await.unwrap().unwrap();
        assert_eq!(doc.label, Some(DocLabel::Unknown));
    }

    #[tokio::test]
    async fn test_blank_document_skips_classifier() {
        let classifier = MockClassifier::new(DocLabel::Contract, 0.99);
        let (store, report) = ingest_with(b"   \n  ", &classifier).await;
        assert_eq!(report.unwrap().label, DocLabel::Unknown);
        assert_eq!(classifier.call_count(), 0);
        assert_eq!(
            store.get_document("d1").await.unwrap().unwrap().stage,
            DocumentStage::Ingested
        );
    }

    #[tokio::test]
    async fn test_unreadable_bytes_are_permanent() {
        let classifier = MockClassifier::new(DocLabel::Contract, 0.99);
        let (store, report) = ingest_with(&[0xff, 0xfe, 0x00, 0xc3], &classifier).await;
        let err = report.unwrap_err();
        assert_eq!(
            crate::error::classify_error(&err),
            crate::error::ErrorClass::Permanent
        );
        let doc = store.get_document("d1").await.unwrap().unwrap();
        assert_eq!(doc.stage, DocumentStage::Uploaded);
        assert!(doc.label.is_none());
    }
}
