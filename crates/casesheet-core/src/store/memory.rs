//! In-memory [`Store`](super::Store) implementation for tests and WASM targets.
//!
//! All state sits behind one `std::sync::RwLock`, so every trait method
//! is trivially atomic. Vector search is brute-force cosine similarity
//! over the chunks of the requested documents.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::embedding::{check_dims, cosine_similarity};
use crate::error::PipelineError;
use crate::models::{
    CaseSheet, Chunk, Confidence, Document, DocumentStage, FieldKey, FieldObservation,
    FieldOrigin, FieldRecord, FieldValue, PipelineTask, Stage, TaskStatus, TextSpan,
};

use super::{
    merge_field, validate_provenance, ChunkHit, ChunkIndex, Claim, DocumentStore, EnqueueResult,
    IngestRecord, SheetStore, SheetUpdate, TaskChange, TaskLedger,
};

#[derive(Default)]
struct State {
    documents: Vec<Document>,
    spans: HashMap<String, Vec<TextSpan>>,
    chunks: HashMap<String, Vec<Chunk>>,
    tasks: Vec<PipelineTask>,
    sheets: HashMap<String, CaseSheet>,
    observations: HashMap<String, Vec<FieldObservation>>,
}

impl State {
    fn document(&self, id: &str) -> Option<&Document> {
        self.documents.iter().find(|d| d.id == id)
    }

    fn document_mut(&mut self, id: &str) -> Result<&mut Document> {
        self.documents
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| PipelineError::not_found("document", id).into())
    }

    fn task_mut(&mut self, id: &str) -> Option<&mut PipelineTask> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }
}

/// In-memory store for tests and WASM environments.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state
            .read()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state
            .write()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn insert_document(&self, doc: &Document) -> Result<()> {
        let mut st = self.write()?;
        if st.document(&doc.id).is_some() {
            anyhow::bail!("document {} already exists", doc.id);
        }
        st.documents.push(doc.clone());
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.read()?.document(id).cloned())
    }

    async fn case_documents(&self, case_id: &str) -> Result<Vec<Document>> {
        let st = self.read()?;
        let mut docs: Vec<Document> = st
            .documents
            .iter()
            .filter(|d| d.case_id == case_id)
            .cloned()
            .collect();
        docs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(docs)
    }

    async fn record_ingest(&self, document_id: &str, ingest: &IngestRecord<'_>) -> Result<()> {
        let mut st = self.write()?;
        let doc = st.document_mut(document_id)?;
        doc.label = Some(ingest.label);
        doc.label_confidence = ingest.confidence;
        doc.page_count = ingest.page_count;
        doc.stage = DocumentStage::Ingested;
        doc.updated_at = now();
        st.spans
            .insert(document_id.to_string(), ingest.spans.to_vec());
        Ok(())
    }

    async fn page_spans(&self, document_id: &str) -> Result<Vec<TextSpan>> {
        Ok(self
            .read()?
            .spans
            .get(document_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn set_document_stage(&self, document_id: &str, stage: DocumentStage) -> Result<()> {
        let mut st = self.write()?;
        let doc = st.document_mut(document_id)?;
        doc.stage = stage;
        doc.updated_at = now();
        Ok(())
    }

    async fn delete_document(&self, document_id: &str) -> Result<bool> {
        let mut st = self.write()?;
        let Some(pos) = st.documents.iter().position(|d| d.id == document_id) else {
            return Ok(false);
        };
        let doc = st.documents.remove(pos);
        st.spans.remove(document_id);
        st.chunks.remove(document_id);
        if let Some(obs) = st.observations.get_mut(&doc.case_id) {
            obs.retain(|o| o.document_id != document_id);
        }
        if let Some(sheet) = st.sheets.get_mut(&doc.case_id) {
            let mut touched = false;
            for record in sheet.fields.values_mut() {
                if record
                    .provenance
                    .as_ref()
                    .is_some_and(|p| p.document_id == document_id)
                {
                    record.provenance = None;
                    touched = true;
                }
            }
            if touched {
                sheet.version += 1;
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl ChunkIndex for InMemoryStore {
    async fn replace_document_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        for c in chunks {
            check_dims(&c.embedding)?;
        }
        let mut st = self.write()?;
        if st.document(document_id).is_none() {
            return Err(PipelineError::not_found("document", document_id).into());
        }
        st.chunks.insert(document_id.to_string(), chunks.to_vec());
        Ok(())
    }

    async fn document_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let mut chunks = self
            .read()?
            .chunks
            .get(document_id)
            .cloned()
            .unwrap_or_default();
        chunks.sort_by_key(|c| c.chunk_index);
        Ok(chunks)
    }

    async fn vector_search(
        &self,
        query: &[f32],
        document_ids: &[String],
        k: usize,
    ) -> Result<Vec<ChunkHit>> {
        check_dims(query)?;
        let st = self.read()?;
        let mut hits: Vec<(ChunkHit, i64)> = document_ids
            .iter()
            .filter_map(|id| st.chunks.get(id))
            .flatten()
            .map(|c| {
                let hit = ChunkHit {
                    chunk_id: c.id.clone(),
                    document_id: c.document_id.clone(),
                    page: c.page,
                    bbox: c.bbox,
                    text: c.text.clone(),
                    score: cosine_similarity(query, &c.embedding),
                };
                (hit, c.chunk_index)
            })
            .collect();
        hits.sort_by(|(a, ai), (b, bi)| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.document_id.cmp(&b.document_id))
                .then(ai.cmp(bi))
        });
        hits.truncate(k);
        Ok(hits.into_iter().map(|(h, _)| h).collect())
    }
}

#[async_trait]
impl TaskLedger for InMemoryStore {
    async fn insert_task(&self, task: &PipelineTask) -> Result<EnqueueResult> {
        let mut st = self.write()?;
        if let Some(active) = st.tasks.iter().find(|t| {
            t.subject_id == task.subject_id && t.stage == task.stage && t.status.is_active()
        }) {
            return Ok(EnqueueResult::Duplicate(active.id.clone()));
        }
        st.tasks.push(task.clone());
        Ok(EnqueueResult::Created(task.id.clone()))
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<PipelineTask>> {
        Ok(self.read()?.tasks.iter().find(|t| t.id == task_id).cloned())
    }

    async fn subject_tasks(&self, subject_id: &str) -> Result<Vec<PipelineTask>> {
        Ok(self
            .read()?
            .tasks
            .iter()
            .filter(|t| t.subject_id == subject_id)
            .cloned()
            .collect())
    }

    async fn has_succeeded(&self, subject_id: &str, stage: Stage) -> Result<bool> {
        Ok(self.read()?.tasks.iter().any(|t| {
            t.subject_id == subject_id && t.stage == stage && t.status == TaskStatus::Succeeded
        }))
    }

    async fn ready_tasks(&self, now: i64, limit: usize) -> Result<Vec<PipelineTask>> {
        let st = self.read()?;
        let mut ready: Vec<PipelineTask> = st
            .tasks
            .iter()
            .filter(|t| t.is_claimable(now))
            .cloned()
            .collect();
        ready.sort_by_key(|t| (t.run_after, t.created_at));
        ready.truncate(limit);
        Ok(ready)
    }

    async fn try_claim(&self, task_id: &str, claim: &Claim<'_>) -> Result<bool> {
        let mut st = self.write()?;
        let Some(task) = st.task_mut(task_id) else {
            return Ok(false);
        };
        if !task.is_claimable(claim.now) {
            return Ok(false);
        }
        if task.status == TaskStatus::Running {
            task.attempts += 1;
        }
        task.status = TaskStatus::Running;
        task.worker_id = Some(claim.worker_id.to_string());
        task.lease_expires_at = Some(claim.lease_expires_at);
        task.updated_at = claim.now;
        Ok(true)
    }

    async fn transition(
        &self,
        task_id: &str,
        from: TaskStatus,
        change: &TaskChange,
    ) -> Result<bool> {
        let mut st = self.write()?;
        let Some(task) = st.task_mut(task_id) else {
            return Ok(false);
        };
        if task.status != from {
            return Ok(false);
        }
        if change.held_by.is_some() && task.worker_id != change.held_by {
            return Ok(false);
        }
        task.status = change.status;
        task.attempts = change.attempts;
        task.last_error = change.last_error.clone();
        if change.result.is_some() {
            task.result = change.result.clone();
        }
        if let Some(run_after) = change.run_after {
            task.run_after = run_after;
        }
        if change.status != TaskStatus::Running {
            task.lease_expires_at = None;
            task.worker_id = None;
        }
        task.updated_at = change.now;
        Ok(true)
    }
}

#[async_trait]
impl SheetStore for InMemoryStore {
    async fn load_sheet(&self, case_id: &str) -> Result<CaseSheet> {
        Ok(self
            .read()?
            .sheets
            .get(case_id)
            .cloned()
            .unwrap_or_else(|| CaseSheet::empty(case_id)))
    }

    async fn commit_sheet(
        &self,
        case_id: &str,
        expected_version: i64,
        update: &SheetUpdate,
    ) -> Result<i64> {
        let mut st = self.write()?;
        let current = st.sheets.get(case_id).map(|s| s.version).unwrap_or(0);
        if current != expected_version {
            return Err(PipelineError::ConcurrentModification {
                case_id: case_id.to_string(),
                expected: expected_version,
            }
            .into());
        }

        for (field, record) in &update.fields {
            if let Some(p) = &record.provenance {
                validate_provenance(*field, p, case_id, st.document(&p.document_id))?;
            }
        }
        for obs in update.observations.iter().flatten() {
            match &obs.provenance {
                Some(p) => validate_provenance(obs.field, p, case_id, st.document(&p.document_id))?,
                None if st
                    .document(&obs.document_id)
                    .is_some_and(|d| d.case_id == case_id) => {}
                None => {
                    return Err(PipelineError::ProvenanceIntegrity {
                        field: obs.field.to_string(),
                        reason: format!("observation cites unknown document {}", obs.document_id),
                    }
                    .into())
                }
            }
        }

        if let Some(obs) = &update.observations {
            st.observations.insert(case_id.to_string(), obs.clone());
        }
        let sheet = st
            .sheets
            .entry(case_id.to_string())
            .or_insert_with(|| CaseSheet::empty(case_id));
        for (field, record) in &update.fields {
            let merged = merge_field(sheet.fields.get(field), record);
            sheet.fields.insert(*field, merged);
        }
        if let Some(flags) = &update.flags {
            sheet.flags = flags.clone();
        }
        sheet.version += 1;
        Ok(sheet.version)
    }

    async fn set_manual_field(
        &self,
        case_id: &str,
        field: FieldKey,
        value: &FieldValue,
    ) -> Result<i64> {
        let mut st = self.write()?;
        let sheet = st
            .sheets
            .entry(case_id.to_string())
            .or_insert_with(|| CaseSheet::empty(case_id));
        sheet.fields.insert(
            field,
            FieldRecord {
                value: Some(value.clone()),
                provenance: None,
                origin: FieldOrigin::Manual,
                confidence: Confidence::High,
                ..FieldRecord::default()
            },
        );
        sheet.version += 1;
        Ok(sheet.version)
    }

    async fn observations(&self, case_id: &str) -> Result<Vec<FieldObservation>> {
        Ok(self
            .read()?
            .observations
            .get(case_id)
            .cloned()
            .unwrap_or_default())
    }
}


#[cfg(test)]
mod proptests {
    use proptest::collection::vec;
    use proptest::prelude::*;

    use super::*;
    use crate::embedding::EMBEDDING_DIMS;
    use crate::models::BBox;
    use crate::testing::document;

    /// Mostly index-sized, sometimes any length up to twice that.
    fn arb_dims() -> impl Strategy<Value = usize> {
        prop_oneof![
            3 => Just(EMBEDDING_DIMS),
            1 => 0usize..2 * EMBEDDING_DIMS,
        ]
    }

    /// One chunk per entry of `dims`, every component set to `fill`.
    fn chunks(doc: &str, dims: &[usize], fill: f32) -> Vec<Chunk> {
        dims.iter()
            .enumerate()
            .map(|(i, len)| Chunk {
                id: format!("{}-c{}", doc, i),
                document_id: doc.to_string(),
                chunk_index: i as i64,
                page: 1,
                bbox: BBox::new(0.0, 0.0, 1.0, 0.1),
                text: format!("chunk {}", i),
                hash: String::new(),
                embedding: vec![fill; *len],
            })
            .collect()
    }

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(future)
    }

    proptest! {
        #[test]
        fn stored_vectors_always_have_index_dims(
            prior in vec(Just(EMBEDDING_DIMS), 0..5),
            batch in vec(arb_dims(), 0..5),
        ) {
            let (accepted, stored) = block_on(async {
                let store = InMemoryStore::new();
                store.insert_document(&document("d1", "C1")).await.unwrap();
                store
                    .replace_document_chunks("d1", &chunks("d1", &prior, 0.5))
                    .await
                    .unwrap();
                let accepted = store
                    .replace_document_chunks("d1", &chunks("d1", &batch, 0.25))
                    .await
                    .is_ok();
                (accepted, store.document_chunks("d1").await.unwrap())
            });

            prop_assert_eq!(accepted, batch.iter().all(|len| *len == EMBEDDING_DIMS));
            prop_assert!(stored.iter().all(|c| c.embedding.len() == EMBEDDING_DIMS));

            // A rejected batch leaves the prior set exactly as it was.
            let (expected, fill) = if accepted { (&batch, 0.25) } else { (&prior, 0.5) };
            prop_assert_eq!(stored.len(), expected.len());
            prop_assert!(stored.iter().all(|c| c.embedding.iter().all(|x| *x == fill)));
        }
    }
}
