//! # casesheet CLI (`sheet`)
//!
//! ## Usage
//!
//! ```bash
//! sheet --config ./config/sheet.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `sheet init` | Create the SQLite database and run schema migrations |
//! | `sheet upload <case> <file>` | Store an original and start its ingest |
//! | `sheet process <doc>` | Enqueue ingest for a document |
//! | `sheet index <doc>` | Enqueue indexing for a document |
//! | `sheet extract <case>` | Enqueue field extraction for a case |
//! | `sheet audit <case>` | Enqueue the consistency audit for a case |
//! | `sheet status <task>` | Show a task's state |
//! | `sheet tasks <subject>` | List tasks of a document or case |
//! | `sheet cancel <task>` | Cancel a pending task |
//! | `sheet work [--once]` | Run a worker |
//! | `sheet ask <case> <question>` | Answer a question with citations (JSON) |
//! | `sheet sheet <case>` | Print the technical sheet (JSON) |
//! | `sheet set-field <case> <field> <value>` | Record a reviewed value |
//! | `sheet delete-document <doc>` | Delete a document, clearing its provenance |
//! | `sheet file <doc> --out <path>` | Write the stored original to a file |
//! | `sheet reembed` | Re-embed every chunk with the configured provider |

use anyhow::{Context, Result};
use casesheet::config::{self, Config};
use casesheet::service::{self, Pipeline};
use casesheet::worker::Worker;
use casesheet::{logging, migrate};
use casesheet_core::models::FieldKey;
use casesheet_core::store::EnqueueResult;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

/// casesheet: builds a sourced technical sheet from labor-case documents.
#[derive(Parser)]
#[command(
    name = "sheet",
    about = "casesheet: an auditable pipeline from labor-case documents to a sourced technical sheet",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/sheet.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; safe to run on every deploy.
    Init,

    /// Store an original file for a case and enqueue its ingest.
    Upload {
        case_id: String,
        /// A `.pdf` or `.txt` file.
        file: PathBuf,
    },

    /// Enqueue (or re-run) ingest for a document.
    Process { document_id: String },

    /// Enqueue indexing for an ingested document.
    Index { document_id: String },

    /// Enqueue field extraction for a case.
    Extract { case_id: String },

    /// Enqueue the consistency audit for a case.
    Audit { case_id: String },

    /// Show the state of a task.
    Status { task_id: String },

    /// List every task of a document or case.
    Tasks { subject_id: String },

    /// Cancel a pending task.
    Cancel { task_id: String },

    /// Claim and run tasks.
    Work {
        /// Exit once no task is ready instead of polling.
        #[arg(long)]
        once: bool,
    },

    /// Answer a question about a case, with citations.
    Ask {
        case_id: String,
        question: String,
        /// Chunks retrieved (defaults to `[retrieval].top_k`).
        #[arg(long)]
        k: Option<usize>,
    },

    /// Print a case's technical sheet as JSON.
    Sheet { case_id: String },

    /// Record a reviewer-confirmed value for a field.
    ///
    /// Fields: start_date, end_date, daily_salary, termination_cause.
    SetField {
        case_id: String,
        field: String,
        value: String,
    },

    /// Delete a document; sheet values read from it lose their provenance.
    DeleteDocument { document_id: String },

    /// Write a document's stored original to a file.
    File {
        document_id: String,
        #[arg(long)]
        out: PathBuf,
    },

    /// Re-embed every stored chunk with the configured provider.
    Reembed,
}

fn print_enqueue(outcome: &EnqueueResult) {
    match outcome {
        EnqueueResult::Created(id) => println!("task {} enqueued", id),
        EnqueueResult::Duplicate(id) => println!("task {} already active", id),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli, cfg: Config) -> Result<()> {
    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Reembed => {
            let report = service::reembed(&cfg).await?;
            println!("reembed");
            println!("  model: {}", report.model);
            println!("  documents: {}", report.documents);
            println!("  chunks: {}", report.chunks);
        }
        command => {
            let pipeline = Pipeline::open(&cfg).await?;
            run_with_pipeline(&pipeline, command).await?;
        }
    }
    Ok(())
}

async fn run_with_pipeline(pipeline: &Pipeline, command: Commands) -> Result<()> {
    match command {
        Commands::Upload { case_id, file } => {
            let bytes = tokio::fs::read(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let filename = file
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("upload");
            let receipt = pipeline.upload(&case_id, filename, &bytes).await?;
            println!("document {}", receipt.document_id);
            println!("task {}", receipt.task_id);
        }
        Commands::Process { document_id } => print_enqueue(&pipeline.process(&document_id).await?),
        Commands::Index { document_id } => print_enqueue(&pipeline.index(&document_id).await?),
        Commands::Extract { case_id } => {
            print_enqueue(&pipeline.extract_metadata(&case_id).await?)
        }
        Commands::Audit { case_id } => print_enqueue(&pipeline.audit(&case_id).await?),
        Commands::Status { task_id } => {
            let status = pipeline.task_status(&task_id).await?;
            println!("task {}", status.task_id);
            println!("  stage: {}", status.stage);
            println!("  subject: {}", status.subject_id);
            println!("  state: {}", status.state);
            println!("  attempts: {}", status.attempts);
            if let Some(error) = &status.error {
                println!("  error: {}", error);
            }
        }
        Commands::Tasks { subject_id } => {
            for t in pipeline.list_tasks(&subject_id).await? {
                println!(
                    "{}  {:<8} {:<10} attempts={}{}",
                    t.task_id,
                    t.stage.as_str(),
                    t.state.as_str(),
                    t.attempts,
                    t.error.map(|e| format!("  error={}", e)).unwrap_or_default()
                );
            }
        }
        Commands::Cancel { task_id } => {
            if pipeline.cancel(&task_id).await? {
                println!("task {} cancelled", task_id);
            } else {
                println!("task {} is not pending; left unchanged", task_id);
            }
        }
        Commands::Work { once } => {
            let worker = Worker::new(pipeline);
            let processed = worker.run(once).await?;
            println!("{} tasks processed", processed);
        }
        Commands::Ask {
            case_id,
            question,
            k,
        } => print_json(&pipeline.ask(&case_id, &question, k).await?)?,
        Commands::Sheet { case_id } => print_json(&pipeline.sheet(&case_id).await?)?,
        Commands::SetField {
            case_id,
            field,
            value,
        } => {
            let key: FieldKey = field.parse()?;
            let version = pipeline.set_manual_field(&case_id, key, &value).await?;
            println!("{} set on case {} (version {})", key, case_id, version);
        }
        Commands::DeleteDocument { document_id } => {
            if pipeline.delete_document(&document_id).await? {
                println!("document {} deleted", document_id);
            } else {
                println!("document {} not found", document_id);
            }
        }
        Commands::File { document_id, out } => {
            let mut file = pipeline.get_file_bytes(&document_id).await?;
            let mut dest = tokio::fs::File::create(&out)
                .await
                .with_context(|| format!("Failed to create {}", out.display()))?;
            let written = tokio::io::copy(&mut file, &mut dest).await?;
            dest.flush().await?;
            println!("{} bytes written to {}", written, out.display());
        }
        Commands::Init | Commands::Reembed => {}
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    logging::init_logging(&cfg.logging);
    run(cli, cfg).await
}
