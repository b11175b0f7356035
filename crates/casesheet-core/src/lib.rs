//! # casesheet core
//!
//! Shared, WASM-safe logic for casesheet: the case data model, the error
//! taxonomy, value parsing, span chunking, embedding and provider
//! capability traits, the store abstraction, and the stage logic that
//! turns classified documents into a sourced technical sheet.
//!
//! This crate contains no tokio, sqlx, filesystem I/O, or other
//! native-only dependencies. Concrete providers, the SQLite store and the
//! worker loop live in the `casesheet` app crate.
//!
//! ## Stages
//!
//! | Stage | Subject | Module | Requires |
//! |-------|---------|--------|----------|
//! | ingest | document | [`ingest`] | an uploaded document |
//! | index | document | [`index`] | ingest succeeded |
//! | extract | case | [`extract`] | one or more documents indexed |
//! | audit | case | [`audit`] | extract succeeded |
//!
//! Sequencing, retries and leases are owned by [`orchestrator`].

pub mod audit;
pub mod chunk;
pub mod classify;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod heuristic;
pub mod index;
pub mod ingest;
pub mod layout;
pub mod models;
pub mod orchestrator;
pub mod precedence;
pub mod providers;
pub mod retrieval;
pub mod store;
pub mod testing;
pub mod values;
