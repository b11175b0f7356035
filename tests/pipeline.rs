use casesheet::config::Config;
use casesheet::service::{self, Pipeline};
use casesheet::sqlite_store::SqliteStore;
use casesheet::worker::Worker;
use casesheet_core::error::{pipeline_error, PipelineError};
use casesheet_core::models::{DocLabel, FieldKey, FieldValue, FlagCode, RiskLevel, Stage, TaskStatus};
use casesheet_core::orchestrator::{Orchestrator, RetryPolicy};
use casesheet_core::store::{ChunkIndex, DocumentStore, EnqueueResult, SheetStore, TaskLedger};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

const CONTRACT: &str = "CONTRATO INDIVIDUAL DE TRABAJO\n\
Las partes celebran el presente contrato por tiempo indeterminado.\n\
Cláusula primera. Fecha de ingreso: 01/03/2021\n\
Cláusula segunda. Salario diario: $450.00\n";

const TERMINATION: &str = "AVISO DE RESCISIÓN\n\
Por medio del presente se le notifica la terminación de la relación laboral.\n\
Fecha de baja: 15/06/2023\n\
Motivo: despido por faltas injustificadas\n";

const COMPLAINT: &str = "DEMANDA LABORAL\n\
La parte actora acude ante el tribunal laboral.\n\
Fecha de despido: 30/06/2023\n";

fn test_config(tmp: &TempDir) -> Config {
    let root = tmp.path();
    let toml = format!(
        r#"[db]
path = "{}/data/sheet.sqlite"

[storage]
root = "{}/files"

[chunking]
max_tokens = 256

[pipeline]
lease_secs = 60
poll_interval_ms = 10
"#,
        root.display(),
        root.display()
    );
    let config: Config = toml::from_str(&toml).unwrap();
    config.validate().unwrap();
    config
}

async fn open(tmp: &TempDir) -> Pipeline {
    Pipeline::open(&test_config(tmp)).await.unwrap()
}

async fn drain(pipeline: &Pipeline) -> usize {
    Worker::new(pipeline).run(true).await.unwrap()
}

#[tokio::test]
async fn test_end_to_end_sheet_with_provenance() {
    let tmp = TempDir::new().unwrap();
    let pipeline = open(&tmp).await;

    let contract = pipeline
        .upload("CASE-1", "contrato.txt", CONTRACT.as_bytes())
        .await
        .unwrap();
    let letter = pipeline
        .upload("CASE-1", "aviso.txt", TERMINATION.as_bytes())
        .await
        .unwrap();
    assert!(drain(&pipeline).await >= 6);

    let status = pipeline.task_status(&contract.task_id).await.unwrap();
    assert_eq!(status.state, TaskStatus::Succeeded);

    let doc = pipeline
        .store()
        .get_document(&contract.document_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(doc.label, Some(DocLabel::Contract));
    assert_eq!(doc.page_count, 1);

    let view = pipeline.sheet("CASE-1").await.unwrap();
    let sheet = &view.sheet;

    let start = sheet.field(FieldKey::StartDate);
    assert_eq!(start.value.as_ref().unwrap().canonical(), "2021-03-01");
    let prov = start.provenance.as_ref().unwrap();
    assert_eq!(prov.document_id, contract.document_id);
    assert_eq!(prov.page, 1);
    assert!(prov.bbox.is_valid());

    let salary = sheet.field(FieldKey::DailySalary);
    assert_eq!(
        salary.value,
        Some(FieldValue::Money {
            cents: 45_000,
            currency: "MXN".into()
        })
    );

    let end = sheet.field(FieldKey::EndDate);
    assert_eq!(end.value.as_ref().unwrap().canonical(), "2023-06-15");
    assert_eq!(
        end.provenance.as_ref().unwrap().document_id,
        letter.document_id
    );

    let cause = sheet.field(FieldKey::TerminationCause);
    assert_eq!(cause.value.as_ref().unwrap().canonical(), "dismissal");

    // Every stored field is either fully sourced or has no pointer at all.
    for record in sheet.fields.values() {
        if let Some(p) = &record.provenance {
            assert!(p.page >= 1);
            assert!(record.value.is_some());
        }
    }
    assert!(sheet
        .flags
        .iter()
        .all(|f| f.code != FlagCode::Conflict));
}

#[tokio::test]
async fn test_conflicting_end_date_flagged_high_with_both_documents() {
    let tmp = TempDir::new().unwrap();
    let pipeline = open(&tmp).await;

    pipeline
        .upload("CASE-2", "contrato.txt", CONTRACT.as_bytes())
        .await
        .unwrap();
    let letter = pipeline
        .upload("CASE-2", "aviso.txt", TERMINATION.as_bytes())
        .await
        .unwrap();
    let complaint = pipeline
        .upload("CASE-2", "demanda.txt", COMPLAINT.as_bytes())
        .await
        .unwrap();
    drain(&pipeline).await;

    let view = pipeline.sheet("CASE-2").await.unwrap();
    let conflict = view
        .sheet
        .flags
        .iter()
        .find(|f| f.code == FlagCode::Conflict && f.field == Some(FieldKey::EndDate))
        .expect("end_date conflict flag");
    assert_eq!(conflict.severity, RiskLevel::High);
    assert!(conflict.document_ids.contains(&letter.document_id));
    assert!(conflict.document_ids.contains(&complaint.document_id));

    // For employment conditions the complaint outranks the termination letter.
    let end = view.sheet.field(FieldKey::EndDate);
    assert_eq!(end.value.as_ref().unwrap().canonical(), "2023-06-30");
    assert_eq!(
        end.provenance.as_ref().unwrap().document_id,
        complaint.document_id
    );
    assert_eq!(end.risk, RiskLevel::High);
    assert_eq!(view.risk, RiskLevel::High);
    assert!(view.scores.documental.score < 100);

    // A termination notice is on file, so only the required documents are missing.
    assert!(view
        .sheet
        .flags
        .iter()
        .all(|f| f.code != FlagCode::TerminationCompliance));
    assert_eq!(
        view.sheet
            .flags
            .iter()
            .filter(|f| f.code == FlagCode::MissingDocument)
            .count(),
        2
    );
    assert_eq!(view.scores.compliance.score, 70);
    assert!(view
        .observations
        .iter()
        .filter(|o| o.field == FieldKey::EndDate)
        .count()
        >= 2);
}

#[tokio::test]
async fn test_deleting_document_nulls_provenance_keeps_value() {
    let tmp = TempDir::new().unwrap();
    let pipeline = open(&tmp).await;

    let contract = pipeline
        .upload("CASE-3", "contrato.txt", CONTRACT.as_bytes())
        .await
        .unwrap();
    drain(&pipeline).await;

    let before = pipeline.sheet("CASE-3").await.unwrap().sheet;
    assert!(before.field(FieldKey::StartDate).provenance.is_some());

    assert!(pipeline.delete_document(&contract.document_id).await.unwrap());
    assert!(!pipeline.delete_document(&contract.document_id).await.unwrap());

    let after = pipeline.sheet("CASE-3").await.unwrap();
    let start = after.sheet.field(FieldKey::StartDate);
    assert_eq!(start.value.as_ref().unwrap().canonical(), "2021-03-01");
    assert!(start.provenance.is_none());
    assert!(after.sheet.version > before.version);
    assert!(after.observations.is_empty());
    assert!(pipeline
        .store()
        .document_chunks(&contract.document_id)
        .await
        .unwrap()
        .is_empty());

    let err = pipeline
        .get_file_bytes(&contract.document_id)
        .await
        .unwrap_err();
    assert!(matches!(
        pipeline_error(&err),
        Some(PipelineError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_reindex_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let pipeline = open(&tmp).await;

    let receipt = pipeline
        .upload("CASE-4", "contrato.txt", CONTRACT.as_bytes())
        .await
        .unwrap();
    drain(&pipeline).await;
    let first = pipeline
        .store()
        .document_chunks(&receipt.document_id)
        .await
        .unwrap();
    assert!(!first.is_empty());

    let again = pipeline.index(&receipt.document_id).await.unwrap();
    assert!(again.is_created());
    drain(&pipeline).await;

    let second = pipeline
        .store()
        .document_chunks(&receipt.document_id)
        .await
        .unwrap();
    assert_eq!(first.len(), second.len());
    for (a, b) in first.iter().zip(&second) {
        assert_eq!(a.text, b.text);
        assert_eq!(a.page, b.page);
        assert_eq!(a.bbox, b.bbox);
        assert_eq!(a.embedding, b.embedding);
        assert_eq!(b.embedding.len(), casesheet_core::embedding::EMBEDDING_DIMS);
    }
}

#[tokio::test]
async fn test_extract_before_indexing_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let pipeline = open(&tmp).await;

    let err = pipeline.extract_metadata("EMPTY").await.unwrap_err();
    assert!(matches!(
        pipeline_error(&err),
        Some(PipelineError::DependencyNotReady {
            stage: Stage::Extract,
            ..
        })
    ));

    let receipt = pipeline
        .upload("EMPTY", "contrato.txt", CONTRACT.as_bytes())
        .await
        .unwrap();
    let err = pipeline.index(&receipt.document_id).await.unwrap_err();
    assert!(matches!(
        pipeline_error(&err),
        Some(PipelineError::DependencyNotReady { .. })
    ));
    let err = pipeline.audit("EMPTY").await.unwrap_err();
    assert!(matches!(
        pipeline_error(&err),
        Some(PipelineError::DependencyNotReady { .. })
    ));
}

#[tokio::test]
async fn test_concurrent_enqueue_and_claim_single_winner() {
    let tmp = TempDir::new().unwrap();
    let pipeline = Arc::new(open(&tmp).await);

    let receipt = pipeline
        .upload("CASE-5", "contrato.txt", CONTRACT.as_bytes())
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let p = pipeline.clone();
        let doc = receipt.document_id.clone();
        handles.push(tokio::spawn(async move { p.process(&doc).await.unwrap() }));
    }
    for h in handles {
        let outcome = h.await.unwrap();
        assert_eq!(outcome, EnqueueResult::Duplicate(receipt.task_id.clone()));
    }

    let mut handles = Vec::new();
    for i in 0..8 {
        let p = pipeline.clone();
        let task_id = receipt.task_id.clone();
        handles.push(tokio::spawn(async move {
            p.orchestrator()
                .claim(&task_id, &format!("w{}", i))
                .await
                .is_ok()
        }));
    }
    let mut winners = 0;
    for h in handles {
        if h.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);

    let running: Vec<_> = pipeline
        .list_tasks(&receipt.document_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|t| t.state == TaskStatus::Running)
        .collect();
    assert_eq!(running.len(), 1);
}

#[tokio::test]
async fn test_cancel_pending_task() {
    let tmp = TempDir::new().unwrap();
    let pipeline = open(&tmp).await;

    let receipt = pipeline
        .upload("CASE-6", "contrato.txt", CONTRACT.as_bytes())
        .await
        .unwrap();
    assert!(pipeline.cancel(&receipt.task_id).await.unwrap());
    assert!(!pipeline.cancel(&receipt.task_id).await.unwrap());
    assert_eq!(drain(&pipeline).await, 0);

    let fresh = pipeline.process(&receipt.document_id).await.unwrap();
    assert!(fresh.is_created());
    assert_ne!(fresh.task_id(), receipt.task_id);
}

#[tokio::test]
async fn test_corrupt_pdf_fails_without_retry() {
    let tmp = TempDir::new().unwrap();
    let pipeline = open(&tmp).await;

    let receipt = pipeline
        .upload("CASE-7", "escaneo.pdf", b"%PDF-1.7 truncated")
        .await
        .unwrap();
    drain(&pipeline).await;

    let status = pipeline.task_status(&receipt.task_id).await.unwrap();
    assert_eq!(status.state, TaskStatus::Failed);
    assert_eq!(status.attempts, 1);
    assert!(status.error.unwrap().contains("permanent input"));
}

#[tokio::test]
async fn test_manual_field_survives_extraction() {
    let tmp = TempDir::new().unwrap();
    let pipeline = open(&tmp).await;

    pipeline
        .set_manual_field("CASE-8", FieldKey::DailySalary, "$ 520.50")
        .await
        .unwrap();
    pipeline
        .upload("CASE-8", "contrato.txt", CONTRACT.as_bytes())
        .await
        .unwrap();
    drain(&pipeline).await;

    let salary = pipeline
        .sheet("CASE-8")
        .await
        .unwrap()
        .sheet
        .field(FieldKey::DailySalary);
    assert_eq!(salary.value.as_ref().unwrap().canonical(), "520.50 MXN");
    assert!(salary.provenance.is_none());
    assert!(salary.is_manual());

    assert!(pipeline
        .set_manual_field("CASE-8", FieldKey::StartDate, "pronto")
        .await
        .is_err());
}

#[tokio::test]
async fn test_ask_cites_case_documents_only() {
    let tmp = TempDir::new().unwrap();
    let pipeline = open(&tmp).await;

    let contract = pipeline
        .upload("CASE-9", "contrato.txt", CONTRACT.as_bytes())
        .await
        .unwrap();
    pipeline
        .upload("OTHER", "aviso.txt", TERMINATION.as_bytes())
        .await
        .unwrap();
    drain(&pipeline).await;

    let answer = pipeline
        .ask("CASE-9", "¿Cuál es el salario diario?", Some(3))
        .await
        .unwrap();
    assert!(answer.answer.contains("450.00"));
    assert!(!answer.citations.is_empty());
    for c in &answer.citations {
        assert_eq!(c.document_id, contract.document_id);
        assert_eq!(c.page, 1);
    }
}

#[tokio::test]
async fn test_file_bytes_are_exact() {
    let tmp = TempDir::new().unwrap();
    let pipeline = open(&tmp).await;

    let receipt = pipeline
        .upload("CASE-10", "contrato.txt", CONTRACT.as_bytes())
        .await
        .unwrap();
    let mut file = pipeline.get_file_bytes(&receipt.document_id).await.unwrap();
    let mut bytes = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut file, &mut bytes)
        .await
        .unwrap();
    assert_eq!(bytes, CONTRACT.as_bytes());
}

#[tokio::test]
async fn test_dimension_mismatch_requires_reembed() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);
    {
        let pipeline = Pipeline::open(&config).await.unwrap();
        pipeline
            .upload("CASE-11", "contrato.txt", CONTRACT.as_bytes())
            .await
            .unwrap();
        drain(&pipeline).await;
        casesheet::migrate::record_embedding_dims(pipeline.store().pool(), 384)
            .await
            .unwrap();
        pipeline.store().pool().close().await;
    }

    let err = Pipeline::open(&config).await.err().expect("open must fail");
    assert!(format!("{:#}", err).contains("reembed"));

    let report = service::reembed(&config).await.unwrap();
    assert_eq!(report.documents, 1);
    assert!(report.chunks >= 1);

    let pipeline = Pipeline::open(&config).await.unwrap();
    let answer = pipeline
        .ask("CASE-11", "fecha de ingreso", None)
        .await
        .unwrap();
    assert!(!answer.citations.is_empty());
}

#[tokio::test]
async fn test_sheet_version_guards_concurrent_writes() {
    let tmp = TempDir::new().unwrap();
    let pipeline = open(&tmp).await;
    let store = pipeline.store();

    let v1 = store
        .commit_sheet("CASE-12", 0, &Default::default())
        .await
        .unwrap();
    assert_eq!(v1, 1);
    let err = store
        .commit_sheet("CASE-12", 0, &Default::default())
        .await
        .unwrap_err();
    assert!(matches!(
        pipeline_error(&err),
        Some(PipelineError::ConcurrentModification { .. })
    ));
}

#[tokio::test]
async fn test_lapsed_worker_cannot_touch_reclaimed_task() {
    let tmp = TempDir::new().unwrap();
    let pipeline = open(&tmp).await;
    let receipt = pipeline
        .upload("CASE-13", "contrato.txt", CONTRACT.as_bytes())
        .await
        .unwrap();

    let start = chrono::Utc::now().timestamp() + 1;
    let clock = Arc::new(AtomicI64::new(start));
    let c = clock.clone();
    let store = Arc::new(SqliteStore::new(pipeline.store().pool().clone()));
    let orch = Orchestrator::new(store.clone(), RetryPolicy::default())
        .without_chaining()
        .with_clock(move || c.load(Ordering::SeqCst));

    orch.claim(&receipt.task_id, "w1").await.unwrap();
    clock.store(start + RetryPolicy::default().lease_secs, Ordering::SeqCst);
    let reclaimed = orch.claim_next("w2").await.unwrap().unwrap();
    assert_eq!(reclaimed.id, receipt.task_id);

    let transient = anyhow::Error::from(PipelineError::TransientProvider("timeout".into()));
    let err = orch.fail(&receipt.task_id, "w1", &transient).await.unwrap_err();
    assert!(matches!(
        pipeline_error(&err),
        Some(PipelineError::AlreadyClaimed(_))
    ));
    assert!(orch.claim_next("w3").await.unwrap().is_none());
    assert!(orch
        .complete(&receipt.task_id, "w1", serde_json::json!({}))
        .await
        .is_err());

    let task = store.get_task(&receipt.task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.worker_id.as_deref(), Some("w2"));
}
