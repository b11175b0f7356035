//! # casesheet
//!
//! An auditable pipeline that turns the documents of a labor case into a
//! technical sheet: a handful of key facts, each one either tied to the
//! exact document, page and region it was read from, or explicitly
//! missing.
//!
//! ## Architecture
//!
//! ```text
//! upload ─▶ ingest ─▶ index ─▶ extract ─▶ audit
//!  (file)   (layout,  (chunks,  (fields +   (flags,
//!           label)    vectors)  provenance)  risk)
//!              │         │          │          │
//!              └─────────┴──── SQLite ─────────┘
//!                      task ledger + sheet
//! ```
//!
//! Each arrow is a task in the ledger; workers claim tasks under a lease
//! and the orchestrator chains the next stage on success. The stage logic
//! lives in [`casesheet_core`]; this crate supplies the native pieces.
//!
//! ## Quick Start
//!
//! ```bash
//! sheet init
//! sheet upload CASE-1 contrato.pdf
//! sheet work --once
//! sheet sheet CASE-1
//! sheet ask CASE-1 "¿Cuál era el salario diario?"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite implementation of the store traits |
//! | [`storage`] | Filesystem object storage |
//! | [`layout`] | PDF and plain-text layout extraction |
//! | [`classify`] | Document classifiers |
//! | [`embedding`] | Embedding providers |
//! | [`reasoning`] | Chat-model reasoning providers |
//! | [`service`] | The `Pipeline` facade |
//! | [`worker`] | Task worker loop |
//! | [`logging`] | Tracing subscriber setup |

pub mod classify;
pub mod config;
pub mod db;
pub mod embedding;
pub mod http;
pub mod layout;
pub mod logging;
pub mod migrate;
pub mod reasoning;
pub mod service;
pub mod sqlite_store;
pub mod storage;
pub mod worker;
