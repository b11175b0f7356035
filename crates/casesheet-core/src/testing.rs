//! Testing utilities including mock providers.
//!
//! These let applications and tests drive the stage pipeline without
//! network calls, model downloads or PDF parsing. Mocks record their calls
//! for assertions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{PoisonError, RwLock};

use anyhow::Result;
use async_trait::async_trait;

use crate::chunk::chunk_spans;
use crate::embedding::{Embedder, HashedEmbedder};
use crate::error::PipelineError;
use crate::layout::layout_from_plain_text;
use crate::models::{
    DocLabel, Document, DocumentStage, ExtractedLayout, FieldKey, PipelineTask, Stage, TaskStatus,
};
use crate::providers::{
    Answer, Classification, ContextChunk, DocumentClassifier, FieldAnswer, LayoutExtractor,
    ObjectStore, Reasoner,
};
use crate::store::{IngestRecord, Store};
use crate::values::find_in_text;

/// A freshly uploaded single-page plain-text document.
pub fn document(id: &str, case_id: &str) -> Document {
    Document {
        id: id.to_string(),
        case_id: case_id.to_string(),
        file_handle: format!("mem://{}", id),
        filename: format!("{}.txt", id),
        content_type: "text/plain".to_string(),
        label: None,
        label_confidence: None,
        page_count: 1,
        stage: DocumentStage::Uploaded,
        created_at: 0,
        updated_at: 0,
    }
}

/// Insert, ingest and index a plain-text document in one go.
///
/// Form feeds in `text` separate pages. Chunks are embedded with
/// [`HashedEmbedder`], the document ends at stage `indexed` and a
/// succeeded index task is on record.
pub async fn seed_document(
    store: &dyn Store,
    id: &str,
    case_id: &str,
    label: DocLabel,
    text: &str,
) -> Result<Document> {
    store.insert_document(&document(id, case_id)).await?;
    let layout = layout_from_plain_text(text);
    store
        .record_ingest(
            id,
            &IngestRecord {
                label,
                confidence: Some(0.9),
                page_count: layout.page_count,
                spans: &layout.spans,
            },
        )
        .await?;
    let drafts = chunk_spans(id, &layout.spans, 512);
    let texts: Vec<String> = drafts.iter().map(|d| d.text.clone()).collect();
    let vectors = HashedEmbedder.embed(&texts).await?;
    let chunks: Vec<_> = drafts
        .into_iter()
        .zip(vectors)
        .map(|(d, v)| d.with_embedding(v))
        .collect();
    store.replace_document_chunks(id, &chunks).await?;
    store
        .set_document_stage(id, DocumentStage::Indexed)
        .await?;
    let mut indexed = PipelineTask::new(id, Stage::Index, 1, 0);
    indexed.status = TaskStatus::Succeeded;
    store.insert_task(&indexed).await?;
    store
        .get_document(id)
        .await?
        .ok_or_else(|| PipelineError::not_found("document", id).into())
}

// ============ Object storage ============

/// Object store backed by a map.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, handle: &str) -> bool {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(handle)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, name: &str, bytes: &[u8]) -> Result<String> {
        let handle = format!("mem://{}", name);
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.clone(), bytes.to_vec());
        Ok(handle)
    }

    async fn get(&self, handle: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(handle)
            .cloned()
            .ok_or_else(|| PipelineError::not_found("object", handle).into())
    }

    async fn delete(&self, handle: &str) -> Result<()> {
        self.objects
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(handle);
        Ok(())
    }
}

// ============ Layout ============

/// Reads UTF-8 text, form feeds separating pages.
pub struct PlainTextLayout;

#[async_trait]
impl LayoutExtractor for PlainTextLayout {
    async fn extract(&self, bytes: &[u8], _content_type: &str) -> Result<ExtractedLayout> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| PipelineError::PermanentInput(format!("not UTF-8 text: {}", e)))?;
        Ok(layout_from_plain_text(text))
    }
}

// ============ Classifier ============

/// Classifier returning a fixed result and counting calls.
pub struct MockClassifier {
    result: Classification,
    calls: AtomicU32,
}

impl MockClassifier {
    pub fn new(label: DocLabel, confidence: f64) -> Self {
        Self {
            result: Classification { label, confidence },
            calls: AtomicU32::new(0),
        }
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentClassifier for MockClassifier {
    fn name(&self) -> &str {
        "mock"
    }

    async fn classify(&self, _text: &str, _filename: &str) -> Result<Classification> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.result)
    }
}

// ============ Reasoner ============

/// Scripted behaviour for one field.
#[derive(Debug, Clone)]
pub enum MockAnswer {
    /// Scan each context chunk for a value of the field's kind and cite
    /// the first chunk that has one.
    FromText,
    /// Always answer `MISSING`.
    Missing,
    /// Answer `value` citing the first context chunk.
    CiteFirst(String),
    /// Answer `value` without citing anything.
    Uncited(String),
    /// Answer `value` citing a chunk id that was never retrieved.
    CiteUnknown(String),
}

/// Record of a call made to the mock reasoner.
#[derive(Debug, Clone, PartialEq)]
pub enum MockReasonerCall {
    Extract {
        field: FieldKey,
        chunk_ids: Vec<String>,
    },
    Answer {
        question: String,
    },
}

/// Reasoner with per-field scripted answers.
///
/// Fields without a script behave as [`MockAnswer::FromText`].
#[derive(Default)]
pub struct MockReasoner {
    answers: RwLock<HashMap<FieldKey, MockAnswer>>,
    transient_failures: AtomicU32,
    calls: RwLock<Vec<MockReasonerCall>>,
}

impl MockReasoner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_answer(self, field: FieldKey, answer: MockAnswer) -> Self {
        self.answers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(field, answer);
        self
    }

    /// Fail the next `n` extract calls with a transient provider error.
    pub fn with_transient_failures(self, n: u32) -> Self {
        self.transient_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> Vec<MockReasonerCall> {
        self.calls
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn record(&self, call: MockReasonerCall) {
        self.calls
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }
}

#[async_trait]
impl Reasoner for MockReasoner {
    fn name(&self) -> &str {
        "mock"
    }

    async fn extract_field(&self, field: FieldKey, context: &[ContextChunk]) -> Result<FieldAnswer> {
        self.record(MockReasonerCall::Extract {
            field,
            chunk_ids: context.iter().map(|c| c.chunk_id.clone()).collect(),
        });
        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(PipelineError::TransientProvider("mock provider unavailable".into()).into());
        }

        let script = self
            .answers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&field)
            .cloned()
            .unwrap_or(MockAnswer::FromText);
        let first_id = context.first().map(|c| c.chunk_id.clone());
        Ok(match script {
            MockAnswer::FromText => context
                .iter()
                .find_map(|c| {
                    find_in_text(field.kind(), &c.text, "MXN").map(|(_, matched)| FieldAnswer {
                        value: Some(matched),
                        chunk_id: Some(c.chunk_id.clone()),
                    })
                })
                .unwrap_or_default(),
            MockAnswer::Missing => FieldAnswer::missing(),
            MockAnswer::CiteFirst(value) => FieldAnswer {
                value: Some(value),
                chunk_id: first_id,
            },
            MockAnswer::Uncited(value) => FieldAnswer {
                value: Some(value),
                chunk_id: None,
            },
            MockAnswer::CiteUnknown(value) => FieldAnswer {
                value: Some(value),
                chunk_id: Some("chunk-that-was-never-retrieved".to_string()),
            },
        })
    }

    async fn answer(&self, question: &str, context: &[ContextChunk]) -> Result<Answer> {
        self.record(MockReasonerCall::Answer {
            question: question.to_string(),
        });
        Ok(Answer {
            text: format!("answer from {} chunks", context.len()),
            cited_chunk_ids: context.iter().take(1).map(|c| c.chunk_id.clone()).collect(),
        })
    }
}

// ============ Embedder ============

/// Embedder producing vectors of a configurable, possibly wrong, length.
pub struct FixedDimsEmbedder(pub usize);

#[async_trait]
impl Embedder for FixedDimsEmbedder {
    fn model_name(&self) -> &str {
        "fixed-dims"
    }

    fn dims(&self) -> usize {
        self.0
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let base = HashedEmbedder.embed(texts).await?;
        Ok(base
            .into_iter()
            .map(|mut v| {
                v.resize(self.0, 0.0);
                v
            })
            .collect())
    }
}
