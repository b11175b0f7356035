//! The `Pipeline` service: everything the CLI (or an HTTP layer) calls.
//!
//! Wires the SQLite store, filesystem object storage and the configured
//! providers into the core stages, and exposes two surfaces:
//!
//! - **stage triggers**: [`upload`](Pipeline::upload),
//!   [`process`](Pipeline::process), [`index`](Pipeline::index),
//!   [`extract_metadata`](Pipeline::extract_metadata),
//!   [`audit`](Pipeline::audit) return task handles; progress is read with
//!   [`task_status`](Pipeline::task_status).
//! - **file access**: [`get_file_bytes`](Pipeline::get_file_bytes) streams
//!   the stored original unchanged.
//!
//! Stage work itself runs in [`execute`](Pipeline::execute), called by the
//! worker loop for each claimed task.

use anyhow::{bail, Context, Result};
use casesheet_core::audit::{case_risk, dimension_scores, Auditor, DimensionScores};
use casesheet_core::embedding::{Embedder, EMBEDDING_DIMS};
use casesheet_core::error::PipelineError;
use casesheet_core::extract::{ExtractOptions, FieldExtractor};
use casesheet_core::index::Indexer;
use casesheet_core::ingest::Ingestor;
use casesheet_core::models::{
    CaseSheet, Document, DocumentStage, FieldKey, FieldObservation, PipelineTask, RiskLevel, Stage,
};
use casesheet_core::orchestrator::{Orchestrator, RetryPolicy, TaskStatusReport};
use casesheet_core::providers::{DocumentClassifier, ObjectStore, Reasoner};
use casesheet_core::retrieval::{CitedAnswer, Retriever};
use casesheet_core::store::{ChunkIndex, DocumentStore, EnqueueResult, SheetStore, Store};
use casesheet_core::values::coerce;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::classify::create_classifier;
use crate::config::{Config, ReasoningPurpose};
use crate::embedding::create_embedder;
use crate::layout::{content_type_for, FileLayout};
use crate::migrate;
use crate::reasoning::create_reasoner;
use crate::sqlite_store::SqliteStore;
use crate::storage::FsObjectStore;

/// Handle returned by [`Pipeline::upload`].
#[derive(Debug, Clone, Serialize)]
pub struct UploadReceipt {
    pub document_id: String,
    /// The ingest task started for the document.
    pub task_id: String,
}

/// A case's sheet as shown to reviewers.
#[derive(Debug, Clone, Serialize)]
pub struct SheetView {
    #[serde(flatten)]
    pub sheet: CaseSheet,
    pub risk: RiskLevel,
    pub scores: DimensionScores,
    pub observations: Vec<FieldObservation>,
}

/// Counts from [`reembed`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReembedReport {
    pub documents: usize,
    pub chunks: usize,
    pub model: String,
}

fn retry_policy(config: &Config) -> RetryPolicy {
    RetryPolicy {
        max_attempts: config.pipeline.max_attempts,
        backoff_base_secs: config.pipeline.backoff_base_secs,
        backoff_max_secs: config.pipeline.backoff_max_secs,
        lease_secs: config.pipeline.lease_secs,
    }
}

pub struct Pipeline {
    config: Config,
    store: Arc<SqliteStore>,
    orchestrator: Orchestrator,
    objects: FsObjectStore,
    layout: FileLayout,
    classifier: Box<dyn DocumentClassifier>,
    embedder: Box<dyn Embedder>,
    extract_reasoner: Box<dyn Reasoner>,
    answer_reasoner: Box<dyn Reasoner>,
}

impl Pipeline {
    /// Open the database (migrating it) and build the configured providers.
    pub async fn open(config: &Config) -> Result<Self> {
        let store = Arc::new(SqliteStore::open(config).await?);
        Self::with_store(config, store)
    }

    fn with_store(config: &Config, store: Arc<SqliteStore>) -> Result<Self> {
        let dyn_store: Arc<dyn Store> = store.clone();
        Ok(Self {
            config: config.clone(),
            orchestrator: Orchestrator::new(dyn_store, retry_policy(config)),
            store,
            objects: FsObjectStore::new(&config.storage.root),
            layout: FileLayout,
            classifier: create_classifier(config)?,
            embedder: create_embedder(&config.embedding)?,
            extract_reasoner: create_reasoner(config, ReasoningPurpose::Extract)?,
            answer_reasoner: create_reasoner(config, ReasoningPurpose::Answer)?,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    // ============ Stage triggers ============

    /// Store an original file for a case and start its ingest.
    pub async fn upload(&self, case_id: &str, filename: &str, bytes: &[u8]) -> Result<UploadReceipt> {
        let content_type = content_type_for(filename).ok_or_else(|| {
            PipelineError::PermanentInput(format!(
                "unsupported file type: {} (expected .pdf or .txt)",
                filename
            ))
        })?;
        let handle = self.objects.put(filename, bytes).await?;
        let now = chrono::Utc::now().timestamp();
        let doc = Document {
            id: uuid::Uuid::new_v4().to_string(),
            case_id: case_id.to_string(),
            file_handle: handle,
            filename: filename.to_string(),
            content_type: content_type.to_string(),
            label: None,
            label_confidence: None,
            page_count: 0,
            stage: DocumentStage::Uploaded,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_document(&doc).await?;
        info!(document_id = %doc.id, case_id, filename, bytes = bytes.len(), "document uploaded");

        let task = self.process(&doc.id).await?;
        Ok(UploadReceipt {
            document_id: doc.id,
            task_id: task.task_id().to_string(),
        })
    }

    pub async fn process(&self, document_id: &str) -> Result<EnqueueResult> {
        self.require_document(document_id).await?;
        self.orchestrator.enqueue(document_id, Stage::Ingest).await
    }

    pub async fn index(&self, document_id: &str) -> Result<EnqueueResult> {
        self.require_document(document_id).await?;
        self.orchestrator.enqueue(document_id, Stage::Index).await
    }

    pub async fn extract_metadata(&self, case_id: &str) -> Result<EnqueueResult> {
        self.orchestrator.enqueue(case_id, Stage::Extract).await
    }

    pub async fn audit(&self, case_id: &str) -> Result<EnqueueResult> {
        self.orchestrator.enqueue(case_id, Stage::Audit).await
    }

    pub async fn task_status(&self, task_id: &str) -> Result<TaskStatusReport> {
        self.orchestrator.status(task_id).await
    }

    pub async fn list_tasks(&self, subject_id: &str) -> Result<Vec<TaskStatusReport>> {
        self.orchestrator.tasks_for(subject_id).await
    }

    pub async fn cancel(&self, task_id: &str) -> Result<bool> {
        self.orchestrator.cancel(task_id).await
    }

    // ============ Stage execution ============

    /// Run the stage work for a claimed task and return its JSON result.
    pub async fn execute(&self, task: &PipelineTask) -> Result<serde_json::Value> {
        let store: &dyn Store = self.store.as_ref();
        let subject = task.subject_id.as_str();
        let result = match task.stage {
            Stage::Ingest => serde_json::to_value(
                Ingestor {
                    store,
                    objects: &self.objects,
                    layout: &self.layout,
                    classifier: self.classifier.as_ref(),
                    min_confidence: self.config.classifier.min_confidence,
                }
                .run(subject)
                .await?,
            )?,
            Stage::Index => serde_json::to_value(
                Indexer {
                    store,
                    embedder: self.embedder.as_ref(),
                    max_tokens: self.config.chunking.max_tokens,
                    batch_size: self.config.embedding.batch_size,
                }
                .run(subject)
                .await?,
            )?,
            Stage::Extract => {
                let snapshot = self.orchestrator.indexed_documents(subject).await?;
                serde_json::to_value(
                    FieldExtractor {
                        store,
                        embedder: self.embedder.as_ref(),
                        reasoner: self.extract_reasoner.as_ref(),
                        options: ExtractOptions {
                            top_k: self.config.retrieval.top_k,
                            allow_unsourced: self.config.extraction.allow_unsourced,
                            currency: self.config.extraction.currency.clone(),
                        },
                    }
                    .run(subject, &snapshot)
                    .await?,
                )?
            }
            Stage::Audit => serde_json::to_value(
                Auditor {
                    store,
                    auto_resolve: self.config.audit.auto_resolve,
                }
                .run(subject)
                .await?,
            )?,
        };
        Ok(result)
    }

    // ============ Reading ============

    /// Open the stored original for streaming, byte for byte.
    pub async fn get_file_bytes(&self, document_id: &str) -> Result<tokio::fs::File> {
        let doc = self.require_document(document_id).await?;
        self.objects.open(&doc.file_handle).await
    }

    /// Answer a question from the case's indexed documents, with citations.
    pub async fn ask(&self, case_id: &str, question: &str, k: Option<usize>) -> Result<CitedAnswer> {
        Retriever {
            store: self.store.as_ref(),
            embedder: self.embedder.as_ref(),
            reasoner: self.answer_reasoner.as_ref(),
            top_k: k.unwrap_or(self.config.retrieval.top_k),
        }
        .ask(case_id, question)
        .await
    }

    pub async fn sheet(&self, case_id: &str) -> Result<SheetView> {
        let sheet = self.store.load_sheet(case_id).await?;
        let observations = self.store.observations(case_id).await?;
        Ok(SheetView {
            risk: case_risk(&sheet),
            scores: dimension_scores(&sheet),
            sheet,
            observations,
        })
    }

    // ============ Maintenance ============

    /// Record a reviewer's value for a field. Returns the new sheet version.
    pub async fn set_manual_field(&self, case_id: &str, field: FieldKey, raw: &str) -> Result<i64> {
        let value = coerce(field.kind(), raw, &self.config.extraction.currency).ok_or_else(|| {
            PipelineError::PermanentInput(format!("'{}' is not a valid {} value", raw, field))
        })?;
        let version = self.store.set_manual_field(case_id, field, &value).await?;
        info!(case_id, %field, value = %value.canonical(), version, "manual value recorded");
        Ok(version)
    }

    /// Delete a document and its original file.
    ///
    /// Sheet values read from it stay; their provenance is cleared.
    pub async fn delete_document(&self, document_id: &str) -> Result<bool> {
        let Some(doc) = self.store.get_document(document_id).await? else {
            return Ok(false);
        };
        let deleted = self.store.delete_document(document_id).await?;
        if deleted {
            if let Err(e) = self.objects.delete(&doc.file_handle).await {
                warn!(document_id, error = %e, "document removed but original file was not");
            }
            info!(document_id, case_id = %doc.case_id, "document deleted");
        }
        Ok(deleted)
    }

    async fn require_document(&self, document_id: &str) -> Result<Document> {
        Ok(self
            .store
            .get_document(document_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("document", document_id))?)
    }
}

/// Re-embed every stored chunk with the configured provider.
///
/// Works on a database whose recorded dimension differs from this build;
/// the new dimension is recorded only after every document succeeded.
pub async fn reembed(config: &Config) -> Result<ReembedReport> {
    let store = SqliteStore::open_unchecked(config).await?;
    let embedder = create_embedder(&config.embedding)?;
    let mut report = ReembedReport {
        model: embedder.model_name().to_string(),
        ..ReembedReport::default()
    };

    for document_id in store.all_document_ids().await? {
        let chunks = store.document_chunks(&document_id).await?;
        if chunks.is_empty() {
            continue;
        }
        let mut updated = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(config.embedding.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = embedder
                .embed(&texts)
                .await
                .with_context(|| format!("re-embedding document {}", document_id))?;
            if vectors.len() != batch.len() {
                bail!(
                    "embedder returned {} vectors for {} chunks",
                    vectors.len(),
                    batch.len()
                );
            }
            for (chunk, vector) in batch.iter().zip(vectors) {
                let mut chunk = chunk.clone();
                chunk.embedding = vector;
                updated.push(chunk);
            }
        }
        store.replace_document_chunks(&document_id, &updated).await?;
        report.documents += 1;
        report.chunks += updated.len();
        info!(document_id, chunks = updated.len(), "document re-embedded");
    }

    migrate::record_embedding_dims(store.pool(), EMBEDDING_DIMS).await?;
    store.pool().close().await;
    Ok(report)
}
