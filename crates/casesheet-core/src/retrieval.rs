//! Case-scoped question answering with citations.
//!
//! A question is embedded, matched against the chunks of the case's
//! indexed documents only, and answered by the reasoning provider from
//! those chunks. Every citation returned points at a chunk that was
//! actually retrieved for this question; citations the provider invents
//! are dropped.

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::embedding::{embed_one, Embedder};
use crate::models::BBox;
use crate::providers::{ContextChunk, Reasoner};
use crate::store::{indexed_documents, ChunkHit, Store};

/// A retrieved chunk backing an answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Citation {
    pub chunk_id: String,
    pub document_id: String,
    pub page: u32,
    pub bbox: BBox,
    pub score: f32,
    pub text: String,
}

impl From<&ChunkHit> for Citation {
    fn from(hit: &ChunkHit) -> Self {
        Self {
            chunk_id: hit.chunk_id.clone(),
            document_id: hit.document_id.clone(),
            page: hit.page,
            bbox: hit.bbox,
            score: hit.score,
            text: hit.text.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CitedAnswer {
    pub answer: String,
    pub citations: Vec<Citation>,
}

pub struct Retriever<'a> {
    pub store: &'a dyn Store,
    pub embedder: &'a dyn Embedder,
    pub reasoner: &'a dyn Reasoner,
    pub top_k: usize,
}

impl Retriever<'_> {
    /// Top-k chunks for `question` among the case's indexed documents.
    ///
    /// Indexed means an index task succeeded, the same snapshot case-level
    /// stages work from.
    pub async fn search(&self, case_id: &str, question: &str) -> Result<Vec<ChunkHit>> {
        let documents = indexed_documents(self.store, case_id).await?;
        if documents.is_empty() {
            debug!(case_id, "no indexed documents to search");
            return Ok(Vec::new());
        }
        let query = embed_one(self.embedder, question).await?;
        self.store
            .vector_search(&query, &documents, self.top_k)
            .await
    }

    pub async fn ask(&self, case_id: &str, question: &str) -> Result<CitedAnswer> {
        let hits = self.search(case_id, question).await?;
        if hits.is_empty() {
            return Ok(CitedAnswer {
                answer: String::new(),
                citations: Vec::new(),
            });
        }

        let context: Vec<ContextChunk> = hits
            .iter()
            .map(|h| ContextChunk {
                chunk_id: h.chunk_id.clone(),
                page: h.page,
                text: h.text.clone(),
            })
            .collect();
        let answer = self.reasoner.answer(question, &context).await?;

        let mut citations: Vec<Citation> = Vec::new();
        for id in &answer.cited_chunk_ids {
            match hits.iter().find(|h| &h.chunk_id == id) {
                Some(hit) if !citations.iter().any(|c| &c.chunk_id == id) => {
                    citations.push(hit.into())
                }
                Some(_) => {}
                None => warn!(case_id, chunk_id = %id, "dropping citation of a chunk that was not retrieved"),
            }
        }
        if citations.is_empty() {
            citations = hits.iter().map(Citation::from).collect();
        }

        info!(case_id, retrieved = hits.len(), cited = citations.len(), "answered question");
        Ok(CitedAnswer {
            answer: answer.text,
            citations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::chunk_spans;
    use crate::embedding::HashedEmbedder;
    use crate::layout::layout_from_plain_text;
    use crate::models::{DocLabel, DocumentStage};
    use crate::store::memory::InMemoryStore;
    use crate::store::{ChunkIndex, DocumentStore};
    use crate::testing::{document, seed_document, MockReasoner, MockReasonerCall};

    #[tokio::test]
    async fn test_answers_cite_case_chunks_only() {
        let store = InMemoryStore::new();
        seed_document(&store, "a", "C1", DocLabel::Payslip, "Salario diario: $450.00")
            .await
            .unwrap();
        seed_document(&store, "b", "C2", DocLabel::Payslip, "Salario diario: $999.00")
            .await
            .unwrap();
        let reasoner = MockReasoner::new();
        let answer = Retriever {
            store: &store,
            embedder: &HashedEmbedder,
            reasoner: &reasoner,
            top_k: 6,
        }
        .ask("C1", "¿cuál es el salario diario?")
        .await
        .unwrap();
        assert!(!answer.citations.is_empty());
        assert!(answer.citations.iter().all(|c| c.document_id == "a"));
        assert!(answer.citations[0].text.contains("450"));
    }

    #[tokio::test]
    async fn test_case_without_documents_skips_provider() {
        let store = InMemoryStore::new();
        let reasoner = MockReasoner::new();
        let answer = Retriever {
            store: &store,
            embedder: &HashedEmbedder,
            reasoner: &reasoner,
            top_k: 6,
        }
        .ask("C9", "¿fecha de ingreso?")
        .await
        .unwrap();
        assert!(answer.citations.is_empty());
        assert!(!reasoner
            .calls()
            .iter()
            .any(|c| matches!(c, MockReasonerCall::Answer { .. })));
    }

    #[tokio::test]
    async fn test_search_skips_documents_without_successful_index() {
        let store = InMemoryStore::new();
        seed_document(&store, "a", "C1", DocLabel::Payslip, "Salario diario: $450.00")
            .await
            .unwrap();

        // Chunks and stage written directly, no index task on record.
        store.insert_document(&document("b", "C1")).await.unwrap();
        let layout = layout_from_plain_text("Salario diario: $999.00");
        let drafts = chunk_spans("b", &layout.spans, 512);
        let texts: Vec<String> = drafts.iter().map(|d| d.text.clone()).collect();
        let vectors = HashedEmbedder.embed(&texts).await.unwrap();
        let chunks: Vec<_> = drafts
            .into_iter()
            .zip(vectors)
            .map(|(d, v)| d.with_embedding(v))
            .collect();
        store.replace_document_chunks("b", &chunks).await.unwrap();
        store
            .set_document_stage("b", DocumentStage::Indexed)
            .await
            .unwrap();

        let reasoner = MockReasoner::new();
        let hits = Retriever {
            store: &store,
            embedder: &HashedEmbedder,
            reasoner: &reasoner,
            top_k: 6,
        }
        .search("C1", "salario diario")
        .await
        .unwrap();
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|h| h.document_id == "a"));
    }
}
