//! SQLite implementation of the core [`Store`](casesheet_core::store::Store) traits.
//!
//! Atomicity comes from the database: multi-row writes run in one
//! transaction, the task ledger's "one active task per subject and stage"
//! rule is a partial unique index, and claims and transitions are
//! conditional `UPDATE`s whose affected-row count says who won.
//!
//! Vector search is brute-force cosine similarity over the embeddings
//! stored in the chunk rows of the requested documents.

use anyhow::{bail, Result};
use async_trait::async_trait;
use casesheet_core::embedding::{blob_to_vec, check_dims, cosine_similarity, vec_to_blob};
use casesheet_core::error::PipelineError;
use casesheet_core::models::{
    AuditFlag, BBox, CaseSheet, Chunk, Document, DocumentStage, FieldKey, FieldObservation,
    FieldOrigin, FieldRecord, FieldValue, PipelineTask, Provenance, Stage, TaskStatus, TextSpan,
};
use casesheet_core::store::{
    merge_field, validate_provenance, ChunkHit, ChunkIndex, Claim, DocumentStore, EnqueueResult,
    IngestRecord, SheetStore, SheetUpdate, TaskChange, TaskLedger,
};
use sqlx::sqlite::{SqliteConnection, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::{db, migrate};

/// How often [`TaskLedger::insert_task`] retries when the active task it
/// collided with finished before it could be read back.
const INSERT_RACE_RETRIES: usize = 5;

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect and bring the schema up to date.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::migrate_pool(&pool).await?;
        Ok(Self { pool })
    }

    /// Connect and create missing tables without checking the stored
    /// embedding dimension. Only `reembed` should need this.
    pub async fn open_unchecked(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::apply_schema(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Ids of every stored document, oldest first.
    pub async fn all_document_ids(&self) -> Result<Vec<String>> {
        Ok(
            sqlx::query_scalar("SELECT id FROM documents ORDER BY created_at, rowid")
                .fetch_all(&self.pool)
                .await?,
        )
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn bbox_from_row(row: &SqliteRow) -> BBox {
    BBox::new(row.get("x0"), row.get("y0"), row.get("x1"), row.get("y1"))
}

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    let label: Option<String> = row.get("label");
    let stage: String = row.get("stage");
    Ok(Document {
        id: row.get("id"),
        case_id: row.get("case_id"),
        file_handle: row.get("file_handle"),
        filename: row.get("filename"),
        content_type: row.get("content_type"),
        label: label.map(|l| l.parse()).transpose()?,
        label_confidence: row.get("label_confidence"),
        page_count: row.get::<i64, _>("page_count") as u32,
        stage: stage.parse()?,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn chunk_from_row(row: &SqliteRow) -> Chunk {
    let blob: Vec<u8> = row.get("embedding");
    Chunk {
        id: row.get("id"),
        document_id: row.get("document_id"),
        chunk_index: row.get("chunk_index"),
        page: row.get::<i64, _>("page") as u32,
        bbox: bbox_from_row(row),
        text: row.get("text"),
        hash: row.get("hash"),
        embedding: blob_to_vec(&blob),
    }
}

fn task_from_row(row: &SqliteRow) -> Result<PipelineTask> {
    let stage: String = row.get("stage");
    let status: String = row.get("status");
    let result: Option<String> = row.get("result_json");
    Ok(PipelineTask {
        id: row.get("id"),
        subject_id: row.get("subject_id"),
        stage: stage.parse()?,
        status: status.parse()?,
        attempts: row.get::<i64, _>("attempts") as u32,
        max_attempts: row.get::<i64, _>("max_attempts") as u32,
        last_error: row.get("last_error"),
        result: result.map(|r| serde_json::from_str(&r)).transpose()?,
        run_after: row.get("run_after"),
        lease_expires_at: row.get("lease_expires_at"),
        worker_id: row.get("worker_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

async fn fetch_document(conn: &mut SqliteConnection, id: &str) -> Result<Option<Document>> {
    let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(document_from_row).transpose()
}

fn record_from_row(row: &SqliteRow, key: FieldKey) -> Result<FieldRecord> {
    let f = key.as_str();
    let col = |suffix: &str| format!("{f}_{suffix}");
    let value: Option<String> = row.try_get(col("value").as_str())?;
    let doc: Option<String> = row.try_get(col("source_doc_id").as_str())?;
    let page: Option<i64> = row.try_get(col("page").as_str())?;
    let bbox: Option<String> = row.try_get(col("bbox").as_str())?;
    let risk: String = row.try_get(col("risk").as_str())?;
    let confidence: String = row.try_get(col("confidence").as_str())?;
    let origin: String = row.try_get(col("origin").as_str())?;

    let provenance = match (doc, page, bbox) {
        (Some(document_id), Some(page), Some(bbox)) => Some(Provenance {
            document_id,
            page: page as u32,
            bbox: serde_json::from_str(&bbox)?,
        }),
        _ => None,
    };
    Ok(FieldRecord {
        value: value
            .map(|v| FieldValue::parse_canonical(key.kind(), &v))
            .transpose()?,
        provenance,
        origin: origin.parse()?,
        risk: risk.parse()?,
        confidence: confidence.parse()?,
        excerpt: row.try_get(col("excerpt").as_str())?,
    })
}

async fn fetch_sheet(conn: &mut SqliteConnection, case_id: &str) -> Result<Option<CaseSheet>> {
    let Some(row) = sqlx::query("SELECT * FROM case_metadata WHERE case_id = ?")
        .bind(case_id)
        .fetch_optional(&mut *conn)
        .await?
    else {
        return Ok(None);
    };
    let mut sheet = CaseSheet::empty(case_id);
    sheet.version = row.get("version");
    for key in FieldKey::ALL {
        sheet.fields.insert(key, record_from_row(&row, key)?);
    }

    let flag_rows = sqlx::query(
        "SELECT field, code, severity, message, document_ids FROM audit_flags \
         WHERE case_id = ? ORDER BY id",
    )
    .bind(case_id)
    .fetch_all(&mut *conn)
    .await?;
    for row in flag_rows {
        let field: Option<String> = row.get("field");
        let code: String = row.get("code");
        let severity: String = row.get("severity");
        let ids: String = row.get("document_ids");
        sheet.flags.push(AuditFlag {
            field: field.map(|f| f.parse()).transpose()?,
            code: code.parse()?,
            severity: severity.parse()?,
            message: row.get("message"),
            document_ids: serde_json::from_str(&ids)?,
        });
    }
    Ok(Some(sheet))
}

async fn write_field(
    conn: &mut SqliteConnection,
    case_id: &str,
    key: FieldKey,
    record: &FieldRecord,
) -> Result<()> {
    let f = key.as_str();
    let sql = format!(
        "UPDATE case_metadata SET {f}_value = ?, {f}_source_doc_id = ?, {f}_page = ?, \
         {f}_bbox = ?, {f}_risk = ?, {f}_confidence = ?, {f}_origin = ?, {f}_excerpt = ? \
         WHERE case_id = ?"
    );
    let prov = record.provenance.as_ref();
    let bbox = prov.map(|p| serde_json::to_string(&p.bbox)).transpose()?;
    sqlx::query(&sql)
        .bind(record.value.as_ref().map(|v| v.canonical()))
        .bind(prov.map(|p| p.document_id.clone()))
        .bind(prov.map(|p| p.page as i64))
        .bind(bbox)
        .bind(record.risk.as_str())
        .bind(record.confidence.as_str())
        .bind(record.origin.as_str())
        .bind(record.excerpt.as_deref())
        .bind(case_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Create the case row if needed and bump its version from `expected`.
async fn bump_version(conn: &mut SqliteConnection, case_id: &str, expected: i64) -> Result<i64> {
    sqlx::query("INSERT OR IGNORE INTO case_metadata (case_id, version) VALUES (?, 0)")
        .bind(case_id)
        .execute(&mut *conn)
        .await?;
    let updated = sqlx::query(
        "UPDATE case_metadata SET version = version + 1 WHERE case_id = ? AND version = ?",
    )
    .bind(case_id)
    .bind(expected)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(PipelineError::ConcurrentModification {
            case_id: case_id.to_string(),
            expected,
        }
        .into());
    }
    Ok(expected + 1)
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn insert_document(&self, doc: &Document) -> Result<()> {
        sqlx::query(
            "INSERT INTO documents (id, case_id, file_handle, filename, content_type, label, \
             label_confidence, page_count, stage, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&doc.id)
        .bind(&doc.case_id)
        .bind(&doc.file_handle)
        .bind(&doc.filename)
        .bind(&doc.content_type)
        .bind(doc.label.map(|l| l.as_str()))
        .bind(doc.label_confidence)
        .bind(doc.page_count as i64)
        .bind(doc.stage.as_str())
        .bind(doc.created_at)
        .bind(doc.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let mut conn = self.pool.acquire().await?;
        fetch_document(&mut conn, id).await
    }

    async fn case_documents(&self, case_id: &str) -> Result<Vec<Document>> {
        let rows = sqlx::query("SELECT * FROM documents WHERE case_id = ? ORDER BY created_at, rowid")
            .bind(case_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(document_from_row).collect()
    }

    async fn record_ingest(&self, document_id: &str, ingest: &IngestRecord<'_>) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE documents SET label = ?, label_confidence = ?, page_count = ?, \
             stage = 'ingested', updated_at = ? WHERE id = ?",
        )
        .bind(ingest.label.as_str())
        .bind(ingest.confidence)
        .bind(ingest.page_count as i64)
        .bind(now())
        .bind(document_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if updated == 0 {
            return Err(PipelineError::not_found("document", document_id).into());
        }

        sqlx::query("DELETE FROM page_spans WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        for (seq, span) in ingest.spans.iter().enumerate() {
            sqlx::query(
                "INSERT INTO page_spans (document_id, seq, page, text, x0, y0, x1, y1) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(document_id)
            .bind(seq as i64)
            .bind(span.page as i64)
            .bind(&span.text)
            .bind(span.bbox.x0)
            .bind(span.bbox.y0)
            .bind(span.bbox.x1)
            .bind(span.bbox.y1)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn page_spans(&self, document_id: &str) -> Result<Vec<TextSpan>> {
        let rows = sqlx::query("SELECT * FROM page_spans WHERE document_id = ? ORDER BY seq")
            .bind(document_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| TextSpan {
                page: row.get::<i64, _>("page") as u32,
                text: row.get("text"),
                bbox: bbox_from_row(row),
            })
            .collect())
    }

    async fn set_document_stage(&self, document_id: &str, stage: DocumentStage) -> Result<()> {
        let updated = sqlx::query("UPDATE documents SET stage = ?, updated_at = ? WHERE id = ?")
            .bind(stage.as_str())
            .bind(now())
            .bind(document_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(PipelineError::not_found("document", document_id).into());
        }
        Ok(())
    }

    async fn delete_document(&self, document_id: &str) -> Result<bool> {
        // The delete trigger clears provenance; spans, chunks and
        // observations cascade.
        let deleted = sqlx::query("DELETE FROM documents WHERE id = ?")
            .bind(document_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }
}

#[async_trait]
impl ChunkIndex for SqliteStore {
    async fn replace_document_chunks(&self, document_id: &str, chunks: &[Chunk]) -> Result<()> {
        for chunk in chunks {
            check_dims(&chunk.embedding)?;
        }
        let mut tx = self.pool.begin().await?;
        if fetch_document(&mut tx, document_id).await?.is_none() {
            return Err(PipelineError::not_found("document", document_id).into());
        }
        sqlx::query("DELETE FROM chunks WHERE document_id = ?")
            .bind(document_id)
            .execute(&mut *tx)
            .await?;
        for chunk in chunks {
            sqlx::query(
                "INSERT INTO chunks (id, document_id, chunk_index, page, x0, y0, x1, y1, text, \
                 hash, embedding) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(document_id)
            .bind(chunk.chunk_index)
            .bind(chunk.page as i64)
            .bind(chunk.bbox.x0)
            .bind(chunk.bbox.y0)
            .bind(chunk.bbox.x1)
            .bind(chunk.bbox.y1)
            .bind(&chunk.text)
            .bind(&chunk.hash)
            .bind(vec_to_blob(&chunk.embedding))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn document_chunks(&self, document_id: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query("SELECT * FROM chunks WHERE document_id = ? ORDER BY chunk_index")
            .bind(document_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(chunk_from_row).collect())
    }

    async fn vector_search(
        &self,
        query: &[f32],
        document_ids: &[String],
        k: usize,
    ) -> Result<Vec<ChunkHit>> {
        check_dims(query)?;
        if document_ids.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; document_ids.len()].join(", ");
        let sql = format!(
            "SELECT * FROM chunks WHERE document_id IN ({}) ORDER BY document_id, chunk_index",
            placeholders
        );
        let mut q = sqlx::query(&sql);
        for id in document_ids {
            q = q.bind(id);
        }
        let rows = q.fetch_all(&self.pool).await?;

        let mut hits: Vec<(ChunkHit, i64)> = Vec::with_capacity(rows.len());
        for row in &rows {
            let chunk = chunk_from_row(row);
            check_dims(&chunk.embedding)?;
            let score = cosine_similarity(query, &chunk.embedding);
            hits.push((
                ChunkHit {
                    chunk_id: chunk.id,
                    document_id: chunk.document_id,
                    page: chunk.page,
                    bbox: chunk.bbox,
                    text: chunk.text,
                    score,
                },
                chunk.chunk_index,
            ));
        }
        hits.sort_by(|(a, ai), (b, bi)| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.document_id.cmp(&b.document_id))
                .then(ai.cmp(bi))
        });
        hits.truncate(k);
        Ok(hits.into_iter().map(|(h, _)| h).collect())
    }
}

#[async_trait]
impl TaskLedger for SqliteStore {
    async fn insert_task(&self, task: &PipelineTask) -> Result<EnqueueResult> {
        for _ in 0..INSERT_RACE_RETRIES {
            let inserted = sqlx::query(
                "INSERT OR IGNORE INTO pipeline_tasks (id, subject_id, stage, status, attempts, \
                 max_attempts, last_error, result_json, run_after, lease_expires_at, worker_id, \
                 created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, NULL, NULL, ?, NULL, NULL, ?, ?)",
            )
            .bind(&task.id)
            .bind(&task.subject_id)
            .bind(task.stage.as_str())
            .bind(task.status.as_str())
            .bind(task.attempts as i64)
            .bind(task.max_attempts as i64)
            .bind(task.run_after)
            .bind(task.created_at)
            .bind(task.updated_at)
            .execute(&self.pool)
            .await?
            .rows_affected();
            if inserted == 1 {
                return Ok(EnqueueResult::Created(task.id.clone()));
            }

            let active: Option<String> = sqlx::query_scalar(
                "SELECT id FROM pipeline_tasks WHERE subject_id = ? AND stage = ? \
                 AND status IN ('pending', 'running')",
            )
            .bind(&task.subject_id)
            .bind(task.stage.as_str())
            .fetch_optional(&self.pool)
            .await?;
            if let Some(id) = active {
                return Ok(EnqueueResult::Duplicate(id));
            }
        }
        bail!(
            "could not enqueue {} for {}: active task kept changing",
            task.stage,
            task.subject_id
        )
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<PipelineTask>> {
        let row = sqlx::query("SELECT * FROM pipeline_tasks WHERE id = ?")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(task_from_row).transpose()
    }

    async fn subject_tasks(&self, subject_id: &str) -> Result<Vec<PipelineTask>> {
        let rows = sqlx::query(
            "SELECT * FROM pipeline_tasks WHERE subject_id = ? ORDER BY created_at, rowid",
        )
        .bind(subject_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn has_succeeded(&self, subject_id: &str, stage: Stage) -> Result<bool> {
        Ok(sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM pipeline_tasks WHERE subject_id = ? AND stage = ? \
             AND status = 'succeeded')",
        )
        .bind(subject_id)
        .bind(stage.as_str())
        .fetch_one(&self.pool)
        .await?)
    }

    async fn ready_tasks(&self, now: i64, limit: usize) -> Result<Vec<PipelineTask>> {
        let rows = sqlx::query(
            "SELECT * FROM pipeline_tasks \
             WHERE (status = 'pending' AND run_after <= ?) \
                OR (status = 'running' AND lease_expires_at <= ?) \
             ORDER BY run_after, created_at, rowid LIMIT ?",
        )
        .bind(now)
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(task_from_row).collect()
    }

    async fn try_claim(&self, task_id: &str, claim: &Claim<'_>) -> Result<bool> {
        let claimed = sqlx::query(
            "UPDATE pipeline_tasks SET \
                attempts = attempts + CASE WHEN status = 'running' THEN 1 ELSE 0 END, \
                status = 'running', worker_id = ?, lease_expires_at = ?, updated_at = ? \
             WHERE id = ? \
               AND ((status = 'pending' AND run_after <= ?) \
                 OR (status = 'running' AND lease_expires_at <= ?))",
        )
        .bind(claim.worker_id)
        .bind(claim.lease_expires_at)
        .bind(claim.now)
        .bind(task_id)
        .bind(claim.now)
        .bind(claim.now)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(claimed == 1)
    }

    async fn transition(
        &self,
        task_id: &str,
        from: TaskStatus,
        change: &TaskChange,
    ) -> Result<bool> {
        let result = change.result.as_ref().map(serde_json::to_string).transpose()?;
        let keep_lease = change.status == TaskStatus::Running;
        let updated = sqlx::query(
            "UPDATE pipeline_tasks SET status = ?, attempts = ?, last_error = ?, \
                result_json = COALESCE(?, result_json), run_after = COALESCE(?, run_after), \
                lease_expires_at = CASE WHEN ? THEN lease_expires_at ELSE NULL END, \
                worker_id = CASE WHEN ? THEN worker_id ELSE NULL END, \
                updated_at = ? \
             WHERE id = ? AND status = ? AND (? IS NULL OR worker_id = ?)",
        )
        .bind(change.status.as_str())
        .bind(change.attempts as i64)
        .bind(change.last_error.as_deref())
        .bind(result)
        .bind(change.run_after)
        .bind(keep_lease)
        .bind(keep_lease)
        .bind(change.now)
        .bind(task_id)
        .bind(from.as_str())
        .bind(change.held_by.as_deref())
        .bind(change.held_by.as_deref())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(updated == 1)
    }
}

#[async_trait]
impl SheetStore for SqliteStore {
    async fn load_sheet(&self, case_id: &str) -> Result<CaseSheet> {
        let mut conn = self.pool.acquire().await?;
        Ok(fetch_sheet(&mut conn, case_id)
            .await?
            .unwrap_or_else(|| CaseSheet::empty(case_id)))
    }

    async fn commit_sheet(
        &self,
        case_id: &str,
        expected_version: i64,
        update: &SheetUpdate,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let version = bump_version(&mut tx, case_id, expected_version).await?;
        let current = fetch_sheet(&mut tx, case_id)
            .await?
            .unwrap_or_else(|| CaseSheet::empty(case_id));

        for (key, record) in &update.fields {
            if let Some(p) = &record.provenance {
                let doc = fetch_document(&mut tx, &p.document_id).await?;
                validate_provenance(*key, p, case_id, doc.as_ref())?;
            }
            let merged = merge_field(current.fields.get(key), record);
            write_field(&mut tx, case_id, *key, &merged).await?;
        }

        if let Some(observations) = &update.observations {
            sqlx::query("DELETE FROM field_observations WHERE case_id = ?")
                .bind(case_id)
                .execute(&mut *tx)
                .await?;
            for obs in observations {
                let doc = fetch_document(&mut tx, &obs.document_id).await?;
                match &obs.provenance {
                    Some(p) => validate_provenance(obs.field, p, case_id, doc.as_ref())?,
                    None if doc.as_ref().is_some_and(|d| d.case_id == case_id) => {}
                    None => {
                        return Err(PipelineError::ProvenanceIntegrity {
                            field: obs.field.to_string(),
                            reason: format!("observation cites unknown document {}", obs.document_id),
                        }
                        .into())
                    }
                }
                let prov = obs.provenance.as_ref();
                let bbox = prov.map(|p| serde_json::to_string(&p.bbox)).transpose()?;
                sqlx::query(
                    "INSERT INTO field_observations (case_id, field, document_id, value, page, \
                     bbox, score, rank, excerpt) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(case_id)
                .bind(obs.field.as_str())
                .bind(&obs.document_id)
                .bind(obs.value.canonical())
                .bind(prov.map(|p| p.page as i64))
                .bind(bbox)
                .bind(obs.score as f64)
                .bind(obs.rank as i64)
                .bind(obs.excerpt.as_deref())
                .execute(&mut *tx)
                .await?;
            }
        }

        if let Some(flags) = &update.flags {
            sqlx::query("DELETE FROM audit_flags WHERE case_id = ?")
                .bind(case_id)
                .execute(&mut *tx)
                .await?;
            for flag in flags {
                sqlx::query(
                    "INSERT INTO audit_flags (case_id, field, code, severity, message, document_ids) \
                     VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(case_id)
                .bind(flag.field.map(|f| f.as_str()))
                .bind(flag.code.as_str())
                .bind(flag.severity.as_str())
                .bind(&flag.message)
                .bind(serde_json::to_string(&flag.document_ids)?)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(version)
    }

    async fn set_manual_field(
        &self,
        case_id: &str,
        field: FieldKey,
        value: &FieldValue,
    ) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT OR IGNORE INTO case_metadata (case_id, version) VALUES (?, 0)")
            .bind(case_id)
            .execute(&mut *tx)
            .await?;
        let record = FieldRecord {
            value: Some(value.clone()),
            provenance: None,
            origin: FieldOrigin::Manual,
            confidence: casesheet_core::models::Confidence::High,
            ..FieldRecord::default()
        };
        write_field(&mut tx, case_id, field, &record).await?;
        let version: i64 = sqlx::query_scalar(
            "UPDATE case_metadata SET version = version + 1 WHERE case_id = ? RETURNING version",
        )
        .bind(case_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(version)
    }

    async fn observations(&self, case_id: &str) -> Result<Vec<FieldObservation>> {
        let rows = sqlx::query("SELECT * FROM field_observations WHERE case_id = ? ORDER BY id")
            .bind(case_id)
            .fetch_all(&self.pool)
            .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let field: FieldKey = row.get::<String, _>("field").parse()?;
            let value: String = row.get("value");
            let page: Option<i64> = row.get("page");
            let bbox: Option<String> = row.get("bbox");
            let document_id: String = row.get("document_id");
            let provenance = match (page, bbox) {
                (Some(page), Some(bbox)) => Some(Provenance {
                    document_id: document_id.clone(),
                    page: page as u32,
                    bbox: serde_json::from_str(&bbox)?,
                }),
                _ => None,
            };
            out.push(FieldObservation {
                case_id: case_id.to_string(),
                field,
                document_id,
                value: FieldValue::parse_canonical(field.kind(), &value)?,
                provenance,
                score: row.get::<f64, _>("score") as f32,
                rank: row.get::<i64, _>("rank") as u32,
                excerpt: row.get("excerpt"),
            });
        }
        Ok(out)
    }
}
