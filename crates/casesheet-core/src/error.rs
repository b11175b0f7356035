//! Error taxonomy for the stage pipeline.
//!
//! Stage functions and store traits return `anyhow::Result`; the typed
//! [`PipelineError`] travels inside the `anyhow::Error` chain and is
//! recovered with [`classify_error`] when the orchestrator decides
//! whether a failed task is retried.

use thiserror::Error;

use crate::models::{Stage, TaskStatus};

#[derive(Debug, Error)]
pub enum PipelineError {
    /// OCR/LLM/network hiccup. Retried with backoff up to the attempt limit.
    #[error("transient provider error: {0}")]
    TransientProvider(String),

    /// Corrupt file, unreadable page, malformed value. Never retried.
    #[error("permanent input error: {0}")]
    PermanentInput(String),

    #[error("{stage} for {subject_id} is not ready: {reason}")]
    DependencyNotReady {
        stage: Stage,
        subject_id: String,
        reason: String,
    },

    /// A field would be written with a pointer outside its case or an
    /// impossible page/region.
    #[error("provenance integrity violation on {field}: {reason}")]
    ProvenanceIntegrity { field: String, reason: String },

    #[error("task {0} is already claimed")]
    AlreadyClaimed(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("case sheet {case_id} changed since version {expected}")]
    ConcurrentModification { case_id: String, expected: i64 },

    #[error("task {task_id} cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskStatus,
        to: TaskStatus,
    },
}

/// Retry decision for a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

impl PipelineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::PermanentInput(_)
            | PipelineError::ProvenanceIntegrity { .. }
            | PipelineError::DimensionMismatch { .. }
            | PipelineError::NotFound { .. }
            | PipelineError::InvalidTransition { .. } => ErrorClass::Permanent,
            PipelineError::TransientProvider(_)
            | PipelineError::DependencyNotReady { .. }
            | PipelineError::AlreadyClaimed(_)
            | PipelineError::ConcurrentModification { .. } => ErrorClass::Transient,
        }
    }

    pub fn not_found(kind: &'static str, id: &str) -> Self {
        PipelineError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

/// Classify an error by the first [`PipelineError`] in its chain.
///
/// Errors carrying no typed cause (I/O, database, timeouts) are treated as
/// transient.
pub fn classify_error(err: &anyhow::Error) -> ErrorClass {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<PipelineError>())
        .map(PipelineError::class)
        .unwrap_or(ErrorClass::Transient)
}

/// Borrow the typed error from an `anyhow` chain, if there is one.
pub fn pipeline_error(err: &anyhow::Error) -> Option<&PipelineError> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<PipelineError>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_classify_wrapped_permanent() {
        let err = Err::<(), _>(PipelineError::PermanentInput("bad pdf".into()))
            .context("ingesting doc-1")
            .unwrap_err();
        assert_eq!(classify_error(&err), ErrorClass::Permanent);
    }

    #[test]
    fn test_classify_untyped_is_transient() {
        let err = anyhow::anyhow!("connection reset");
        assert_eq!(classify_error(&err), ErrorClass::Transient);
    }

    #[test]
    fn test_dependency_message() {
        let err = PipelineError::DependencyNotReady {
            stage: Stage::Extract,
            subject_id: "C1".into(),
            reason: "no indexed documents".into(),
        };
        assert_eq!(
            err.to_string(),
            "extract for C1 is not ready: no indexed documents"
        );
    }
}
