//! Storage abstraction for casesheet.
//!
//! Four traits cover the durable state the stages share, and [`Store`]
//! bundles them so a backend is passed around as one `Arc<dyn Store>`.
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! Every multi-row write below is atomic: a backend either applies all of
//! it or none of it.
//!
//! # Operations
//!
//! | Trait | Method | Purpose |
//! |-------|--------|---------|
//! | [`DocumentStore`] | [`record_ingest`](DocumentStore::record_ingest) | Persist spans, label and page count together |
//! | [`DocumentStore`] | [`delete_document`](DocumentStore::delete_document) | Remove a document, null provenance pointing at it |
//! | [`ChunkIndex`] | [`replace_document_chunks`](ChunkIndex::replace_document_chunks) | Swap a document's chunk set |
//! | [`ChunkIndex`] | [`vector_search`](ChunkIndex::vector_search) | Cosine top-k restricted to given documents |
//! | [`TaskLedger`] | [`insert_task`](TaskLedger::insert_task) | Insert unless an active task exists |
//! | [`TaskLedger`] | [`try_claim`](TaskLedger::try_claim) | Conditional pending/expired → running |
//! | [`TaskLedger`] | [`transition`](TaskLedger::transition) | Conditional status change |
//! | [`SheetStore`] | [`commit_sheet`](SheetStore::commit_sheet) | Versioned write of fields, observations, flags |

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::error::PipelineError;
use crate::models::{
    AuditFlag, BBox, CaseSheet, Chunk, DocLabel, Document, DocumentStage, FieldKey,
    FieldObservation, FieldRecord, FieldValue, PipelineTask, Provenance, Stage, TaskStatus,
    TextSpan,
};

/// Outcome of [`TaskLedger::insert_task`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueResult {
    /// A new task was inserted.
    Created(String),
    /// A pending or running task already existed for the subject and stage.
    Duplicate(String),
}

impl EnqueueResult {
    pub fn task_id(&self) -> &str {
        match self {
            EnqueueResult::Created(id) | EnqueueResult::Duplicate(id) => id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

/// A chunk returned from vector search, without its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkHit {
    pub chunk_id: String,
    pub document_id: String,
    pub page: u32,
    pub bbox: BBox,
    pub text: String,
    /// Cosine similarity to the query.
    pub score: f32,
}

impl ChunkHit {
    pub fn provenance(&self) -> Provenance {
        Provenance {
            document_id: self.document_id.clone(),
            page: self.page,
            bbox: self.bbox,
        }
    }
}

/// Everything the ingest stage persists for a document.
#[derive(Debug, Clone)]
pub struct IngestRecord<'a> {
    pub label: DocLabel,
    pub confidence: Option<f64>,
    pub page_count: u32,
    pub spans: &'a [TextSpan],
}

/// Conditions and lease for [`TaskLedger::try_claim`].
#[derive(Debug, Clone)]
pub struct Claim<'a> {
    pub worker_id: &'a str,
    pub now: i64,
    pub lease_expires_at: i64,
}

/// A status change applied by [`TaskLedger::transition`].
///
/// Leaving `running` always clears the lease and worker id.
#[derive(Debug, Clone)]
pub struct TaskChange {
    pub status: TaskStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub result: Option<serde_json::Value>,
    /// New earliest claim time; `None` keeps the current one.
    pub run_after: Option<i64>,
    /// Only apply while this worker holds the task. A worker whose lease
    /// was taken over must not move the new owner's run.
    pub held_by: Option<String>,
    pub now: i64,
}

/// A write to a case's technical sheet.
#[derive(Debug, Clone, Default)]
pub struct SheetUpdate {
    pub fields: Vec<(FieldKey, FieldRecord)>,
    /// Replaces all observations of the case when set.
    pub observations: Option<Vec<FieldObservation>>,
    /// Replaces all audit flags of the case when set.
    pub flags: Option<Vec<AuditFlag>>,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert_document(&self, doc: &Document) -> Result<()>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>>;

    /// All documents of a case, oldest first.
    async fn case_documents(&self, case_id: &str) -> Result<Vec<Document>>;

    /// Replace the document's spans and set label, page count and stage
    /// `ingested` in one write.
    async fn record_ingest(&self, document_id: &str, ingest: &IngestRecord<'_>) -> Result<()>;

    /// Spans in reading order.
    async fn page_spans(&self, document_id: &str) -> Result<Vec<TextSpan>>;

    async fn set_document_stage(&self, document_id: &str, stage: DocumentStage) -> Result<()>;

    /// Delete a document with its spans, chunks and observations.
    ///
    /// Sheet fields citing the document keep their value and lose the
    /// whole provenance triple. Returns false if it did not exist.
    async fn delete_document(&self, document_id: &str) -> Result<bool>;
}

#[async_trait]
pub trait ChunkIndex: Send + Sync {
    /// Atomically replace every chunk of a document.
    ///
    /// Rejects the whole set with
    /// [`PipelineError::DimensionMismatch`] if any embedding has the wrong
    /// length.
    async fn replace_document_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()>;

    /// Chunks of a document ordered by index.
    async fn document_chunks(&self, document_id: &str) -> Result<Vec<Chunk>>;

    /// Top `k` chunks by cosine similarity among `document_ids`.
    ///
    /// A query of the wrong dimension is rejected.
    async fn vector_search(
        &self,
        query: &[f32],
        document_ids: &[String],
        k: usize,
    ) -> Result<Vec<ChunkHit>>;
}

#[async_trait]
pub trait TaskLedger: Send + Sync {
    /// Insert `task` unless a pending or running task already exists for
    /// its (subject, stage). Must be atomic under concurrent callers.
    async fn insert_task(&self, task: &PipelineTask) -> Result<EnqueueResult>;

    async fn get_task(&self, task_id: &str) -> Result<Option<PipelineTask>>;

    /// All tasks for a subject, oldest first.
    async fn subject_tasks(&self, subject_id: &str) -> Result<Vec<PipelineTask>>;

    /// Whether any task for (subject, stage) has succeeded.
    async fn has_succeeded(&self, subject_id: &str, stage: Stage) -> Result<bool>;

    /// Claimable tasks at `now`, oldest first.
    async fn ready_tasks(&self, now: i64, limit: usize) -> Result<Vec<PipelineTask>>;

    /// Move a claimable task to `running` under a new lease.
    ///
    /// Claimable means pending with `run_after <= now`, or running with an
    /// expired lease. Reclaiming an expired lease counts as a failed
    /// attempt. Returns false if the task was not claimable.
    async fn try_claim(&self, task_id: &str, claim: &Claim<'_>) -> Result<bool>;

    /// Apply `change` if the task is currently in `from` and, when
    /// `change.held_by` is set, still held by that worker.
    async fn transition(&self, task_id: &str, from: TaskStatus, change: &TaskChange)
        -> Result<bool>;
}

#[async_trait]
pub trait SheetStore: Send + Sync {
    /// The case's sheet, or an empty one at version 0.
    async fn load_sheet(&self, case_id: &str) -> Result<CaseSheet>;

    /// Apply `update` if the sheet is still at `expected_version`.
    ///
    /// Manual values are never replaced by derived ones; only their risk
    /// and confidence are updated. Every provenance pointer is checked
    /// with [`validate_provenance`]. Returns the new version.
    async fn commit_sheet(
        &self,
        case_id: &str,
        expected_version: i64,
        update: &SheetUpdate,
    ) -> Result<i64>;

    /// Set a human-reviewed value with no provenance.
    async fn set_manual_field(&self, case_id: &str, field: FieldKey, value: &FieldValue)
        -> Result<i64>;

    async fn observations(&self, case_id: &str) -> Result<Vec<FieldObservation>>;
}

/// Abstract storage backend: documents, chunk index, task ledger, sheet.
pub trait Store: DocumentStore + ChunkIndex + TaskLedger + SheetStore {}

/// Documents of a case whose index stage has succeeded, oldest first.
///
/// A document counts as indexed only once an index task for it has
/// succeeded, whatever its stage column says.
pub async fn indexed_documents(store: &dyn Store, case_id: &str) -> Result<Vec<String>> {
    let mut indexed = Vec::new();
    for doc in store.case_documents(case_id).await? {
        if store.has_succeeded(&doc.id, Stage::Index).await? {
            indexed.push(doc.id);
        }
    }
    Ok(indexed)
}

impl<T: DocumentStore + ChunkIndex + TaskLedger + SheetStore> Store for T {}

/// The record to store when `incoming` is written over `existing`.
///
/// A manual value survives derived writes; only its risk and confidence
/// follow the incoming record.
pub fn merge_field(existing: Option<&FieldRecord>, incoming: &FieldRecord) -> FieldRecord {
    match existing {
        Some(current) if current.is_manual() && !incoming.is_manual() => FieldRecord {
            risk: incoming.risk,
            confidence: incoming.confidence,
            ..current.clone()
        },
        _ => incoming.clone(),
    }
}

/// Check that a provenance pointer is coherent for a case.
///
/// `document` is the document the pointer names, as currently stored.
pub fn validate_provenance(
    field: FieldKey,
    provenance: &Provenance,
    case_id: &str,
    document: Option<&Document>,
) -> Result<(), PipelineError> {
    let violation = |reason: String| PipelineError::ProvenanceIntegrity {
        field: field.to_string(),
        reason,
    };
    let doc = document.ok_or_else(|| {
        violation(format!("document {} does not exist", provenance.document_id))
    })?;
    if doc.case_id != case_id {
        return Err(violation(format!(
            "document {} belongs to case {}, not {}",
            doc.id, doc.case_id, case_id
        )));
    }
    if provenance.page == 0 || provenance.page > doc.page_count {
        return Err(violation(format!(
            "page {} outside 1..={} of document {}",
            provenance.page, doc.page_count, doc.id
        )));
    }
    if !provenance.bbox.is_valid() {
        return Err(violation("bounding box is not a valid region".to_string()));
    }
    Ok(())
}
