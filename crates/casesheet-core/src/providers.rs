//! Capability traits for the pluggable collaborators of the pipeline.
//!
//! Each stage receives the providers it needs explicitly; which
//! implementation backs a trait is decided by configuration in the app
//! crate, never by ambient process state. Tests inject the fakes in
//! [`crate::testing`].
//!
//! | Trait | Capability | Consumed by |
//! |-------|------------|-------------|
//! | [`ObjectStore`] | original file bytes | ingest, file access |
//! | [`LayoutExtractor`] | bytes → spans with boxes | ingest |
//! | [`DocumentClassifier`] | text → label + confidence | ingest |
//! | [`Reasoner`] | field value + citation, free-text answers | extract, retrieval |
//!
//! Embedding lives in [`crate::embedding::Embedder`].

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::{DocLabel, ExtractedLayout, FieldKey};

/// Storage for the original uploaded bytes.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store bytes, returning an opaque handle.
    async fn put(&self, name: &str, bytes: &[u8]) -> Result<String>;
    /// Read back the exact bytes stored under `handle`.
    async fn get(&self, handle: &str) -> Result<Vec<u8>>;
    async fn delete(&self, handle: &str) -> Result<()>;
}

/// Converts a raw file into per-page text spans with bounding boxes.
///
/// Unreadable input should fail with
/// [`PipelineError::PermanentInput`](crate::error::PipelineError::PermanentInput).
#[async_trait]
pub trait LayoutExtractor: Send + Sync {
    async fn extract(&self, bytes: &[u8], content_type: &str) -> Result<ExtractedLayout>;
}

/// A label chosen by a classifier, with its confidence in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub label: DocLabel,
    pub confidence: f64,
}

/// Labels a document by type.
#[async_trait]
pub trait DocumentClassifier: Send + Sync {
    fn name(&self) -> &str;
    async fn classify(&self, text: &str, filename: &str) -> Result<Classification>;
}

/// A retrieved chunk handed to a reasoning provider as context.
#[derive(Debug, Clone, Serialize)]
pub struct ContextChunk {
    pub chunk_id: String,
    pub page: u32,
    pub text: String,
}

/// A provider's answer for one field.
///
/// `value: None` is the explicit `MISSING` signal. `chunk_id` names the
/// single context chunk the provider judged most responsible for the
/// value, if it could name one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldAnswer {
    pub value: Option<String>,
    pub chunk_id: Option<String>,
}

impl FieldAnswer {
    pub fn missing() -> Self {
        Self::default()
    }
}

/// A free-text answer with the context chunks it cites.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub text: String,
    pub cited_chunk_ids: Vec<String>,
}

/// Reasoning provider: reads context and produces values or answers.
#[async_trait]
pub trait Reasoner: Send + Sync {
    fn name(&self) -> &str;

    /// Extract `field` from `context`, citing one chunk.
    async fn extract_field(&self, field: FieldKey, context: &[ContextChunk]) -> Result<FieldAnswer>;

    /// Answer a free-text question from `context`.
    async fn answer(&self, question: &str, context: &[ContextChunk]) -> Result<Answer>;
}
