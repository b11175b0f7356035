//! Index stage: chunk a document's spans and embed every chunk.
//!
//! Chunks are computed from the persisted spans, embedded in batches and
//! written with [`ChunkIndex::replace_document_chunks`](crate::store::ChunkIndex::replace_document_chunks),
//! which swaps the whole set atomically. Re-running the stage therefore
//! leaves exactly one chunk set per document and never a partial one.

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info};

use crate::chunk::chunk_spans;
use crate::embedding::{check_dims, Embedder};
use crate::error::PipelineError;
use crate::models::{Chunk, DocumentStage};
use crate::store::{ChunkIndex, DocumentStore, Store};

/// Summary of an index run, stored as the task result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexReport {
    pub document_id: String,
    pub chunk_count: usize,
    pub model: String,
}

pub struct Indexer<'a> {
    pub store: &'a dyn Store,
    pub embedder: &'a dyn Embedder,
    pub max_tokens: usize,
    pub batch_size: usize,
}

impl Indexer<'_> {
    pub async fn run(&self, document_id: &str) -> Result<IndexReport> {
        let doc = self
            .store
            .get_document(document_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("document", document_id))?;

        let spans = self.store.page_spans(document_id).await?;
        let drafts = chunk_spans(document_id, &spans, self.max_tokens);
        if let Some(stray) = drafts.iter().find(|d| d.page == 0 || d.page > doc.page_count) {
            return Err(PipelineError::PermanentInput(format!(
                "chunk {} lies on page {} of a {}-page document",
                stray.chunk_index, stray.page, doc.page_count
            ))
            .into());
        }

        let mut chunks: Vec<Chunk> = Vec::with_capacity(drafts.len());
        for batch in drafts.chunks(self.batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|d| d.text.clone()).collect();
            let vectors = self.embedder.embed(&texts).await?;
            if vectors.len() != batch.len() {
                return Err(PipelineError::TransientProvider(format!(
                    "embedder returned {} vectors for {} chunks",
                    vectors.len(),
                    batch.len()
                ))
                .into());
            }
            for (draft, vector) in batch.iter().zip(vectors) {
                check_dims(&vector)?;
                chunks.push(draft.clone().with_embedding(vector));
            }
            debug!(document_id, embedded = chunks.len(), total = drafts.len(), "embedded batch");
        }

        self.store
            .replace_document_chunks(document_id, &chunks)
            .await?;
        self.store
            .set_document_stage(document_id, DocumentStage::Indexed)
            .await?;

        info!(
            document_id,
            chunks = chunks.len(),
            model = self.embedder.model_name(),
            "indexed document"
        );
        Ok(IndexReport {
            document_id: document_id.to_string(),
            chunk_count: chunks.len(),
            model: self.embedder.model_name().to_string(),
        })
    }
}
