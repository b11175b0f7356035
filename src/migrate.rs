//! Idempotent schema setup for the case database.
//!
//! The technical sheet is one wide row per case in `case_metadata`, with a
//! column group per field. A `BEFORE DELETE` trigger on `documents` clears
//! every provenance triple pointing at the deleted document, so a field
//! never keeps a page or box without its document. The `CHECK` constraint
//! rejects any write that would leave a triple partially set.

use anyhow::{bail, Result};
use casesheet_core::embedding::EMBEDDING_DIMS;
use casesheet_core::models::FieldKey;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

const TABLES: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS documents (
        id TEXT PRIMARY KEY,
        case_id TEXT NOT NULL,
        file_handle TEXT NOT NULL,
        filename TEXT NOT NULL,
        content_type TEXT NOT NULL,
        label TEXT,
        label_confidence REAL,
        page_count INTEGER NOT NULL DEFAULT 0,
        stage TEXT NOT NULL DEFAULT 'uploaded',
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS page_spans (
        document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
        seq INTEGER NOT NULL,
        page INTEGER NOT NULL,
        text TEXT NOT NULL,
        x0 REAL NOT NULL,
        y0 REAL NOT NULL,
        x1 REAL NOT NULL,
        y1 REAL NOT NULL,
        PRIMARY KEY (document_id, seq)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS chunks (
        id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
        chunk_index INTEGER NOT NULL,
        page INTEGER NOT NULL,
        x0 REAL NOT NULL,
        y0 REAL NOT NULL,
        x1 REAL NOT NULL,
        y1 REAL NOT NULL,
        text TEXT NOT NULL,
        hash TEXT NOT NULL,
        embedding BLOB NOT NULL,
        UNIQUE(document_id, chunk_index)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pipeline_tasks (
        id TEXT PRIMARY KEY,
        subject_id TEXT NOT NULL,
        stage TEXT NOT NULL CHECK (stage IN ('ingest', 'index', 'extract', 'audit')),
        status TEXT NOT NULL
            CHECK (status IN ('pending', 'running', 'succeeded', 'failed', 'cancelled')),
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        last_error TEXT,
        result_json TEXT,
        run_after INTEGER NOT NULL,
        lease_expires_at INTEGER,
        worker_id TEXT,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS field_observations (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        case_id TEXT NOT NULL,
        field TEXT NOT NULL,
        document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
        value TEXT NOT NULL,
        page INTEGER,
        bbox TEXT,
        score REAL NOT NULL,
        rank INTEGER NOT NULL,
        excerpt TEXT,
        CHECK ((page IS NULL) = (bbox IS NULL))
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS audit_flags (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        case_id TEXT NOT NULL,
        field TEXT,
        code TEXT NOT NULL,
        severity TEXT NOT NULL,
        message TEXT NOT NULL,
        document_ids TEXT NOT NULL DEFAULT '[]'
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS schema_meta (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )
    "#,
];

const INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_documents_case ON documents(case_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_chunks_document ON chunks(document_id)",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_active ON pipeline_tasks(subject_id, stage) \
     WHERE status IN ('pending', 'running')",
    "CREATE INDEX IF NOT EXISTS idx_tasks_ready ON pipeline_tasks(status, run_after)",
    "CREATE INDEX IF NOT EXISTS idx_tasks_subject ON pipeline_tasks(subject_id, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_observations_case ON field_observations(case_id, field)",
    "CREATE INDEX IF NOT EXISTS idx_flags_case ON audit_flags(case_id)",
];

/// `CREATE TABLE` for the wide per-case sheet row.
fn case_metadata_ddl() -> String {
    let mut columns = vec![
        "case_id TEXT PRIMARY KEY".to_string(),
        "version INTEGER NOT NULL DEFAULT 0".to_string(),
    ];
    // Table constraints must follow every column definition.
    let mut checks = Vec::new();
    for key in FieldKey::ALL {
        let f = key.as_str();
        columns.push(format!("{f}_value TEXT"));
        columns.push(format!(
            "{f}_source_doc_id TEXT REFERENCES documents(id) ON DELETE SET NULL"
        ));
        columns.push(format!("{f}_page INTEGER"));
        columns.push(format!("{f}_bbox TEXT"));
        columns.push(format!("{f}_risk TEXT NOT NULL DEFAULT 'medium'"));
        columns.push(format!("{f}_confidence TEXT NOT NULL DEFAULT 'low'"));
        columns.push(format!("{f}_origin TEXT NOT NULL DEFAULT 'derived'"));
        columns.push(format!("{f}_excerpt TEXT"));
        checks.push(format!(
            "CHECK (({f}_source_doc_id IS NULL AND {f}_page IS NULL AND {f}_bbox IS NULL) \
             OR ({f}_source_doc_id IS NOT NULL AND {f}_page IS NOT NULL AND {f}_bbox IS NOT NULL))"
        ));
    }
    columns.extend(checks);
    format!(
        "CREATE TABLE IF NOT EXISTS case_metadata (\n    {}\n)",
        columns.join(",\n    ")
    )
}

/// Trigger clearing provenance that points at a document being deleted.
fn provenance_trigger_ddl() -> String {
    let updates: Vec<String> = FieldKey::ALL
        .iter()
        .map(|key| {
            let f = key.as_str();
            format!(
                "    UPDATE case_metadata SET {f}_source_doc_id = NULL, {f}_page = NULL, \
                 {f}_bbox = NULL, version = version + 1 WHERE {f}_source_doc_id = OLD.id;"
            )
        })
        .collect();
    format!(
        "CREATE TRIGGER IF NOT EXISTS documents_clear_provenance\n\
         BEFORE DELETE ON documents\n\
         BEGIN\n{}\nEND",
        updates.join("\n")
    )
}

/// Create every table, index and trigger that does not exist yet.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    for ddl in TABLES {
        sqlx::query(ddl).execute(pool).await?;
    }
    sqlx::query(&case_metadata_ddl()).execute(pool).await?;
    sqlx::query(&provenance_trigger_ddl()).execute(pool).await?;
    for ddl in INDEXES {
        sqlx::query(ddl).execute(pool).await?;
    }
    Ok(())
}

/// The embedding dimension recorded when the index was built, if any.
pub async fn stored_embedding_dims(pool: &SqlitePool) -> Result<Option<usize>> {
    let value: Option<String> =
        sqlx::query_scalar("SELECT value FROM schema_meta WHERE key = 'embedding_dims'")
            .fetch_optional(pool)
            .await?;
    match value {
        Some(v) => Ok(Some(v.parse()?)),
        None => Ok(None),
    }
}

pub async fn record_embedding_dims(pool: &SqlitePool, dims: usize) -> Result<()> {
    sqlx::query(
        "INSERT INTO schema_meta (key, value) VALUES ('embedding_dims', ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(dims.to_string())
    .execute(pool)
    .await?;
    Ok(())
}

/// Apply the schema and check the stored embedding dimension.
///
/// Refuses to continue when the chunk index was built with a different
/// dimension than this build produces.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    apply_schema(pool).await?;
    match stored_embedding_dims(pool).await? {
        None => record_embedding_dims(pool, EMBEDDING_DIMS).await?,
        Some(d) if d == EMBEDDING_DIMS => {}
        Some(d) => bail!(
            "chunk index holds {}-dimensional vectors but this build uses {}; run `sheet reembed`",
            d,
            EMBEDDING_DIMS
        ),
    }
    Ok(())
}

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}
