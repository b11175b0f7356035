//! The worker loop.
//!
//! A worker claims ready tasks one at a time, runs the stage under a
//! timeout equal to the lease, and records the outcome. Any number of
//! worker processes may share one database; the ledger's conditional
//! claim decides who runs what. A stage that outlives its lease is
//! abandoned and recorded as a transient failure. Outcomes are recorded
//! only while this worker still holds the task; once another worker has
//! reclaimed it the late result is dropped.

use anyhow::Result;
use casesheet_core::error::{pipeline_error, PipelineError};
use casesheet_core::models::{Stage, TaskStatus};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::service::Pipeline;

/// What happened to one claimed task.
#[derive(Debug, Clone, Serialize)]
pub struct StepOutcome {
    pub task_id: String,
    pub stage: Stage,
    pub subject_id: String,
    pub status: TaskStatus,
}

pub struct Worker<'a> {
    pipeline: &'a Pipeline,
    id: String,
}

impl<'a> Worker<'a> {
    pub fn new(pipeline: &'a Pipeline) -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self {
            pipeline,
            id: format!("worker-{}-{}", std::process::id(), &suffix[..8]),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Claim and run one task. `None` when nothing is ready.
    pub async fn step(&self) -> Result<Option<StepOutcome>> {
        let orchestrator = self.pipeline.orchestrator();
        let Some(task) = orchestrator.claim_next(&self.id).await? else {
            return Ok(None);
        };
        info!(worker = %self.id, task_id = %task.id, stage = %task.stage, subject_id = %task.subject_id, attempts = task.attempts, "running task");

        let lease = Duration::from_secs(orchestrator.policy().lease_secs.max(1) as u64);
        let recorded = match tokio::time::timeout(lease, self.pipeline.execute(&task)).await {
            Ok(Ok(result)) => orchestrator
                .complete(&task.id, &self.id, result)
                .await
                .map(|_| TaskStatus::Succeeded),
            Ok(Err(e)) => orchestrator.fail(&task.id, &self.id, &e).await,
            Err(_) => {
                warn!(task_id = %task.id, stage = %task.stage, "task outlived its lease");
                let err: anyhow::Error = PipelineError::TransientProvider(format!(
                    "{} exceeded its {}s lease",
                    task.stage,
                    lease.as_secs()
                ))
                .into();
                orchestrator.fail(&task.id, &self.id, &err).await
            }
        };
        let status = match recorded {
            Ok(status) => status,
            Err(e) if matches!(pipeline_error(&e), Some(PipelineError::AlreadyClaimed(_))) => {
                // Another worker took the task over; its run decides the outcome.
                warn!(worker = %self.id, task_id = %task.id, "lease lost, outcome discarded");
                TaskStatus::Running
            }
            Err(e) => return Err(e),
        };

        Ok(Some(StepOutcome {
            task_id: task.id,
            stage: task.stage,
            subject_id: task.subject_id,
            status,
        }))
    }

    /// Process tasks until interrupted.
    ///
    /// With `once`, return as soon as no task is ready instead of polling.
    /// Returns the number of tasks run.
    pub async fn run(&self, once: bool) -> Result<usize> {
        let poll = Duration::from_millis(self.pipeline.config().pipeline.poll_interval_ms);
        let mut processed = 0usize;
        info!(worker = %self.id, once, "worker started");

        loop {
            match self.step().await {
                Ok(Some(outcome)) => {
                    processed += 1;
                    debug!(task_id = %outcome.task_id, status = %outcome.status, "task finished");
                    continue;
                }
                Ok(None) if once => break,
                Ok(None) => {}
                Err(e) if once => return Err(e),
                Err(e) => error!(worker = %self.id, error = %format!("{:#}", e), "worker step failed"),
            }
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!(worker = %self.id, "shutdown requested");
                    break;
                }
                _ = tokio::time::sleep(poll) => {}
            }
        }

        info!(worker = %self.id, processed, "worker stopped");
        Ok(processed)
    }
}
