//! Pipeline orchestrator over the durable task ledger.
//!
//! The orchestrator owns the task state machine:
//!
//! ```text
//!            enqueue                claim                complete
//!   (none) ──────────▶ pending ──────────▶ running ──────────▶ succeeded
//!                        ▲  │                 │
//!             transient  │  │ cancel          │ fail (permanent, or
//!             + backoff  │  ▼                 │ attempts exhausted)
//!                        │ cancelled          ▼
//!                        └─────────────────  failed
//! ```
//!
//! At most one task per (subject, stage) is pending or running at any
//! time; the ledger enforces this atomically on insert. Stage order is
//! declarative: a task is only enqueued or claimed once its prerequisite
//! has succeeded, otherwise the call fails with
//! [`PipelineError::DependencyNotReady`].
//!
//! | Stage | Prerequisite |
//! |-------|--------------|
//! | ingest | the document exists |
//! | index | ingest of the document succeeded |
//! | extract | index succeeded for one or more documents of the case |
//! | audit | extract of the case succeeded |
//!
//! A running task holds a lease. When the lease lapses the task becomes
//! claimable again, so every stage must be safe to re-run.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{classify_error, pipeline_error, ErrorClass, PipelineError};
use crate::models::{PipelineTask, Stage, SubjectKind, TaskStatus};
use crate::store::{Claim, DocumentStore, EnqueueResult, Store, TaskChange, TaskLedger};

/// How many ready tasks [`Orchestrator::claim_next`] inspects per call.
const CLAIM_SCAN: usize = 32;

/// Retry and lease settings applied to every task.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts before a transient failure becomes terminal.
    pub max_attempts: u32,
    pub backoff_base_secs: i64,
    pub backoff_max_secs: i64,
    pub lease_secs: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_secs: 2,
            backoff_max_secs: 3600,
            lease_secs: 300,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempts` (1-based): `base * 2^(attempts-1)`,
    /// capped at `backoff_max_secs`.
    pub fn backoff_secs(&self, attempts: u32) -> i64 {
        let exp = attempts.saturating_sub(1).min(30);
        self.backoff_base_secs
            .saturating_mul(1i64 << exp)
            .min(self.backoff_max_secs)
    }
}

/// What status polling returns for a task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusReport {
    pub task_id: String,
    pub stage: Stage,
    pub subject_id: String,
    pub state: TaskStatus,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub run_after: i64,
}

impl From<PipelineTask> for TaskStatusReport {
    fn from(t: PipelineTask) -> Self {
        Self {
            task_id: t.id,
            stage: t.stage,
            subject_id: t.subject_id,
            state: t.status,
            attempts: t.attempts,
            error: t.last_error,
            result: t.result,
            run_after: t.run_after,
        }
    }
}

type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Sequences stages per document and case over a [`Store`].
#[derive(Clone)]
pub struct Orchestrator {
    store: Arc<dyn Store>,
    policy: RetryPolicy,
    chain: bool,
    clock: Clock,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn Store>, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            chain: true,
            clock: Arc::new(|| chrono::Utc::now().timestamp()),
        }
    }

    /// Do not enqueue follow-up stages on completion.
    pub fn without_chaining(mut self) -> Self {
        self.chain = false;
        self
    }

    /// Replace the wall clock, in Unix seconds.
    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn now(&self) -> i64 {
        (self.clock)()
    }

    /// Enqueue `stage` for `subject_id` unless an equivalent task is active.
    pub async fn enqueue(&self, subject_id: &str, stage: Stage) -> Result<EnqueueResult> {
        self.check_ready(subject_id, stage).await?;
        let task = PipelineTask::new(subject_id, stage, self.policy.max_attempts, self.now());
        let outcome = self.store.insert_task(&task).await?;
        match &outcome {
            EnqueueResult::Created(id) => {
                info!(task_id = %id, %stage, subject_id, "enqueued task")
            }
            EnqueueResult::Duplicate(id) => {
                debug!(task_id = %id, %stage, subject_id, "task already active")
            }
        }
        Ok(outcome)
    }

    /// Claim a specific task for `worker_id`.
    ///
    /// Fails with [`PipelineError::AlreadyClaimed`] if another worker holds
    /// it or won the race. If the task's prerequisite no longer holds, the
    /// task is failed and [`PipelineError::DependencyNotReady`] returned.
    pub async fn claim(&self, task_id: &str, worker_id: &str) -> Result<PipelineTask> {
        let now = self.now();
        let task = self.load(task_id).await?;
        match task.status {
            TaskStatus::Running if !task.lease_expired(now) => {
                return Err(PipelineError::AlreadyClaimed(task_id.to_string()).into())
            }
            TaskStatus::Pending if task.run_after > now => {
                return Err(PipelineError::DependencyNotReady {
                    stage: task.stage,
                    subject_id: task.subject_id.clone(),
                    reason: format!("retry scheduled at {}", task.run_after),
                }
                .into())
            }
            status if status.is_terminal() => {
                return Err(PipelineError::InvalidTransition {
                    task_id: task_id.to_string(),
                    from: status,
                    to: TaskStatus::Running,
                }
                .into())
            }
            _ => {}
        }

        if let Err(e) = self.check_ready(&task.subject_id, task.stage).await {
            warn!(task_id, stage = %task.stage, error = %e, "prerequisite no longer holds");
            self.store
                .transition(
                    task_id,
                    task.status,
                    &TaskChange {
                        status: TaskStatus::Failed,
                        attempts: task.attempts,
                        last_error: Some(format!("{:#}", e)),
                        result: None,
                        run_after: None,
                        held_by: task.worker_id.clone(),
                        now,
                    },
                )
                .await?;
            return Err(e);
        }

        let claim = Claim {
            worker_id,
            now,
            lease_expires_at: now + self.policy.lease_secs,
        };
        if !self.store.try_claim(task_id, &claim).await? {
            return Err(PipelineError::AlreadyClaimed(task_id.to_string()).into());
        }
        if task.status == TaskStatus::Running {
            warn!(task_id, stage = %task.stage, "reclaimed task after lease expiry");
        }
        debug!(task_id, stage = %task.stage, worker_id, "claimed task");
        self.load(task_id).await
    }

    /// Claim the oldest ready task, if any.
    ///
    /// Tasks whose lease lapsed on their final attempt are failed instead
    /// of being handed out again.
    pub async fn claim_next(&self, worker_id: &str) -> Result<Option<PipelineTask>> {
        let now = self.now();
        for task in self.store.ready_tasks(now, CLAIM_SCAN).await? {
            if task.lease_expired(now) && task.attempts + 1 >= task.max_attempts {
                self.expire(&task, now).await?;
                continue;
            }
            match self.claim(&task.id, worker_id).await {
                Ok(claimed) => return Ok(Some(claimed)),
                Err(e) => match pipeline_error(&e) {
                    Some(
                        PipelineError::AlreadyClaimed(_)
                        | PipelineError::DependencyNotReady { .. }
                        | PipelineError::NotFound { .. }
                        | PipelineError::InvalidTransition { .. },
                    ) => {
                        debug!(task_id = %task.id, error = %e, "skipping task");
                        continue;
                    }
                    _ => return Err(e),
                },
            }
        }
        Ok(None)
    }

    /// Mark a task run by `worker_id` succeeded and enqueue follow-up
    /// stages.
    ///
    /// Fails with [`PipelineError::AlreadyClaimed`] when another worker
    /// has taken the task over after this worker's lease lapsed.
    pub async fn complete(
        &self,
        task_id: &str,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<Vec<EnqueueResult>> {
        let task = self.load(task_id).await?;
        let change = TaskChange {
            status: TaskStatus::Succeeded,
            attempts: task.attempts,
            last_error: None,
            result: Some(result.clone()),
            run_after: None,
            held_by: Some(worker_id.to_string()),
            now: self.now(),
        };
        if !self
            .store
            .transition(task_id, TaskStatus::Running, &change)
            .await?
        {
            return Err(self.rejected(task_id, worker_id, TaskStatus::Succeeded).await);
        }
        info!(task_id, stage = %task.stage, subject_id = %task.subject_id, "task succeeded");

        if !self.chain {
            return Ok(Vec::new());
        }
        let mut follow_ups = Vec::new();
        for (subject, stage) in self.follow_ups(&task, &result).await? {
            match self.enqueue(&subject, stage).await {
                Ok(outcome) => follow_ups.push(outcome),
                Err(e) => warn!(%subject, %stage, error = %e, "could not enqueue follow-up"),
            }
        }
        Ok(follow_ups)
    }

    /// Record a failed attempt.
    ///
    /// Transient errors return the task to `pending` with exponential
    /// backoff until `max_attempts` is reached; permanent errors and
    /// exhausted retries end in `failed`. Returns the new status. Like
    /// [`complete`](Self::complete), only the worker holding the task may
    /// record its outcome.
    pub async fn fail(
        &self,
        task_id: &str,
        worker_id: &str,
        err: &anyhow::Error,
    ) -> Result<TaskStatus> {
        let task = self.load(task_id).await?;
        let now = self.now();
        let attempts = task.attempts + 1;
        let retry = classify_error(err) == ErrorClass::Transient && attempts < task.max_attempts;
        let change = if retry {
            TaskChange {
                status: TaskStatus::Pending,
                attempts,
                last_error: Some(format!("{:#}", err)),
                result: None,
                run_after: Some(now + self.policy.backoff_secs(attempts)),
                held_by: Some(worker_id.to_string()),
                now,
            }
        } else {
            TaskChange {
                status: TaskStatus::Failed,
                attempts,
                last_error: Some(format!("{:#}", err)),
                result: None,
                run_after: None,
                held_by: Some(worker_id.to_string()),
                now,
            }
        };
        if !self
            .store
            .transition(task_id, TaskStatus::Running, &change)
            .await?
        {
            return Err(self.rejected(task_id, worker_id, change.status).await);
        }
        if retry {
            warn!(task_id, stage = %task.stage, attempts, error = %format!("{:#}", err), "task will retry");
        } else {
            error!(task_id, stage = %task.stage, attempts, error = %format!("{:#}", err), "task failed");
        }
        Ok(change.status)
    }

    /// Cancel a pending task. Running and finished tasks are left alone
    /// and `false` is returned.
    pub async fn cancel(&self, task_id: &str) -> Result<bool> {
        let task = self.load(task_id).await?;
        let cancelled = self
            .store
            .transition(
                task_id,
                TaskStatus::Pending,
                &TaskChange {
                    status: TaskStatus::Cancelled,
                    attempts: task.attempts,
                    last_error: task.last_error.clone(),
                    result: None,
                    run_after: None,
                    held_by: None,
                    now: self.now(),
                },
            )
            .await?;
        if cancelled {
            info!(task_id, stage = %task.stage, "task cancelled");
        }
        Ok(cancelled)
    }

    pub async fn status(&self, task_id: &str) -> Result<TaskStatusReport> {
        Ok(self.load(task_id).await?.into())
    }

    pub async fn tasks_for(&self, subject_id: &str) -> Result<Vec<TaskStatusReport>> {
        Ok(self
            .store
            .subject_tasks(subject_id)
            .await?
            .into_iter()
            .map(TaskStatusReport::from)
            .collect())
    }

    /// Documents of a case whose index stage has succeeded, oldest first.
    ///
    /// Case-level stages read this once when they start and work on that
    /// snapshot only.
    pub async fn indexed_documents(&self, case_id: &str) -> Result<Vec<String>> {
        crate::store::indexed_documents(self.store.as_ref(), case_id).await
    }

    async fn check_ready(&self, subject_id: &str, stage: Stage) -> Result<()> {
        let not_ready = |reason: &str| PipelineError::DependencyNotReady {
            stage,
            subject_id: subject_id.to_string(),
            reason: reason.to_string(),
        };
        if stage.subject_kind() == SubjectKind::Document
            && self.store.get_document(subject_id).await?.is_none()
        {
            return Err(PipelineError::not_found("document", subject_id).into());
        }
        match stage {
            Stage::Ingest => Ok(()),
            Stage::Index => {
                if self.store.has_succeeded(subject_id, Stage::Ingest).await? {
                    Ok(())
                } else {
                    Err(not_ready("ingest has not succeeded").into())
                }
            }
            Stage::Extract => {
                if self.indexed_documents(subject_id).await?.is_empty() {
                    Err(not_ready("no document of the case has been indexed").into())
                } else {
                    Ok(())
                }
            }
            Stage::Audit => {
                if self.store.has_succeeded(subject_id, Stage::Extract).await? {
                    Ok(())
                } else {
                    Err(not_ready("extract has not succeeded").into())
                }
            }
        }
    }

    /// Stages to enqueue after `task` succeeded with `result`.
    async fn follow_ups(
        &self,
        task: &PipelineTask,
        result: &serde_json::Value,
    ) -> Result<Vec<(String, Stage)>> {
        Ok(match task.stage {
            Stage::Ingest => vec![(task.subject_id.clone(), Stage::Index)],
            Stage::Index => match self.store.get_document(&task.subject_id).await? {
                Some(doc) => vec![(doc.case_id, Stage::Extract)],
                None => Vec::new(),
            },
            Stage::Extract => {
                let mut next = vec![(task.subject_id.clone(), Stage::Audit)];
                let seen: Vec<&str> = result
                    .get("documents")
                    .and_then(|d| d.as_array())
                    .map(|a| a.iter().filter_map(|v| v.as_str()).collect())
                    .unwrap_or_default();
                let indexed = self.indexed_documents(&task.subject_id).await?;
                if indexed.iter().any(|id| !seen.contains(&id.as_str())) {
                    info!(case_id = %task.subject_id, "documents indexed during extraction, extracting again");
                    next.push((task.subject_id.clone(), Stage::Extract));
                }
                next
            }
            Stage::Audit => Vec::new(),
        })
    }

    async fn expire(&self, task: &PipelineTask, now: i64) -> Result<()> {
        let change = TaskChange {
            status: TaskStatus::Failed,
            attempts: task.attempts + 1,
            last_error: Some(format!(
                "lease expired on attempt {} of {}",
                task.attempts + 1,
                task.max_attempts
            )),
            result: None,
            run_after: None,
            held_by: task.worker_id.clone(),
            now,
        };
        if self
            .store
            .transition(&task.id, TaskStatus::Running, &change)
            .await?
        {
            error!(task_id = %task.id, stage = %task.stage, "task failed after lease expiry");
        }
        Ok(())
    }

    async fn load(&self, task_id: &str) -> Result<PipelineTask> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| PipelineError::not_found("task", task_id).into())
    }

    /// Why `worker_id` could not move `task_id` to `to`.
    async fn rejected(&self, task_id: &str, worker_id: &str, to: TaskStatus) -> anyhow::Error {
        match self.store.get_task(task_id).await {
            Ok(Some(current))
                if current.status == TaskStatus::Running
                    && current.worker_id.as_deref() != Some(worker_id) =>
            {
                PipelineError::AlreadyClaimed(task_id.to_string()).into()
            }
            Ok(Some(current)) => PipelineError::InvalidTransition {
                task_id: task_id.to_string(),
                from: current.status,
                to,
            }
            .into(),
            Ok(None) => PipelineError::not_found("task", task_id).into(),
            Err(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DocLabel;
    use crate::store::memory::InMemoryStore;
    use crate::store::IngestRecord;
    use crate::testing::document;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn setup() -> (Arc<InMemoryStore>, Orchestrator) {
        let store = Arc::new(InMemoryStore::new());
        let orch = Orchestrator::new(store.clone(), RetryPolicy::default()).without_chaining();
        (store, orch)
    }

    async fn run_to_success(orch: &Orchestrator, subject: &str, stage: Stage) {
        let id = orch.enqueue(subject, stage).await.unwrap().task_id().to_string();
        orch.claim(&id, "w").await.unwrap();
        orch.complete(&id, "w", serde_json::json!({})).await.unwrap();
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            backoff_base_secs: 2,
            backoff_max_secs: 10,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff_secs(1), 2);
        assert_eq!(policy.backoff_secs(2), 4);
        assert_eq!(policy.backoff_secs(3), 8);
        assert_eq!(policy.backoff_secs(4), 10);
    }

    #[tokio::test]
    async fn test_enqueue_is_deduplicated_while_active() {
        let (store, orch) = setup();
        store.insert_document(&document("d1", "C1")).await.unwrap();
        let first = orch.enqueue("d1", Stage::Ingest).await.unwrap();
        let second = orch.enqueue("d1", Stage::Ingest).await.unwrap();
        assert!(first.is_created());
        assert_eq!(second, EnqueueResult::Duplicate(first.task_id().to_string()));

        orch.claim(first.task_id(), "w1").await.unwrap();
        let third = orch.enqueue("d1", Stage::Ingest).await.unwrap();
        assert!(!third.is_created());

        orch.complete(first.task_id(), "w1", serde_json::json!({})).await.unwrap();
        assert!(orch.enqueue("d1", Stage::Ingest).await.unwrap().is_created());
    }

    #[tokio::test]
    async fn test_second_claim_is_rejected() {
        let (store, orch) = setup();
        store.insert_document(&document("d1", "C1")).await.unwrap();
        let id = orch.enqueue("d1", Stage::Ingest).await.unwrap();
        orch.claim(id.task_id(), "w1").await.unwrap();
        let err = orch.claim(id.task_id(), "w2").await.unwrap_err();
        assert!(matches!(
            pipeline_error(&err),
            Some(PipelineError::AlreadyClaimed(_))
        ));
    }

    #[tokio::test]
    async fn test_index_requires_ingest() {
        let (store, orch) = setup();
        store.insert_document(&document("d1", "C1")).await.unwrap();
        let err = orch.enqueue("d1", Stage::Index).await.unwrap_err();
        assert!(matches!(
            pipeline_error(&err),
            Some(PipelineError::DependencyNotReady { .. })
        ));
        assert!(store.subject_tasks("d1").await.unwrap().is_empty());

        run_to_success(&orch, "d1", Stage::Ingest).await;
        assert!(orch.enqueue("d1", Stage::Index).await.is_ok());
    }

    #[tokio::test]
    async fn test_extract_requires_indexed_document() {
        let (store, orch) = setup();
        store.insert_document(&document("d1", "C1")).await.unwrap();
        run_to_success(&orch, "d1", Stage::Ingest).await;

        let err = orch.enqueue("C1", Stage::Extract).await.unwrap_err();
        assert!(matches!(
            pipeline_error(&err),
            Some(PipelineError::DependencyNotReady { .. })
        ));
        assert!(store.subject_tasks("C1").await.unwrap().is_empty());

        run_to_success(&orch, "d1", Stage::Index).await;
        assert!(orch.enqueue("C1", Stage::Extract).await.is_ok());
        assert!(orch.enqueue("C1", Stage::Audit).await.is_err());
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_fails() {
        let clock = Arc::new(AtomicI64::new(1_000));
        let store = Arc::new(InMemoryStore::new());
        let c = clock.clone();
        let orch = Orchestrator::new(store.clone(), RetryPolicy::default())
            .without_chaining()
            .with_clock(move || c.load(Ordering::SeqCst));
        store.insert_document(&document("d1", "C1")).await.unwrap();
        let id = orch.enqueue("d1", Stage::Ingest).await.unwrap().task_id().to_string();
        let transient = anyhow::Error::from(PipelineError::TransientProvider("timeout".into()));

        orch.claim(&id, "w").await.unwrap();
        assert_eq!(orch.fail(&id, "w", &transient).await.unwrap(), TaskStatus::Pending);
        let report = orch.status(&id).await.unwrap();
        assert_eq!(report.attempts, 1);
        assert_eq!(report.run_after, 1_002);
        assert!(orch.claim_next("w").await.unwrap().is_none());

        clock.store(1_002, Ordering::SeqCst);
        orch.claim_next("w").await.unwrap().unwrap();
        assert_eq!(orch.fail(&id, "w", &transient).await.unwrap(), TaskStatus::Pending);
        clock.store(1_010, Ordering::SeqCst);
        orch.claim_next("w").await.unwrap().unwrap();
        assert_eq!(orch.fail(&id, "w", &transient).await.unwrap(), TaskStatus::Failed);

        let report = orch.status(&id).await.unwrap();
        assert_eq!(report.state, TaskStatus::Failed);
        assert_eq!(report.attempts, 3);
        assert!(report.error.unwrap().contains("timeout"));
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let (store, orch) = setup();
        store.insert_document(&document("d1", "C1")).await.unwrap();
        let id = orch.enqueue("d1", Stage::Ingest).await.unwrap().task_id().to_string();
        orch.claim(&id, "w").await.unwrap();
        let err = anyhow::Error::from(PipelineError::PermanentInput("corrupt pdf".into()));
        assert_eq!(orch.fail(&id, "w", &err).await.unwrap(), TaskStatus::Failed);
        assert_eq!(orch.status(&id).await.unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn test_cancel_only_pending() {
        let (store, orch) = setup();
        store.insert_document(&document("d1", "C1")).await.unwrap();
        store.insert_document(&document("d2", "C1")).await.unwrap();
        let a = orch.enqueue("d1", Stage::Ingest).await.unwrap().task_id().to_string();
        let b = orch.enqueue("d2", Stage::Ingest).await.unwrap().task_id().to_string();
        orch.claim(&b, "w").await.unwrap();

        assert!(orch.cancel(&a).await.unwrap());
        assert!(!orch.cancel(&b).await.unwrap());
        assert_eq!(orch.status(&a).await.unwrap().state, TaskStatus::Cancelled);
        assert_eq!(orch.status(&b).await.unwrap().state, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_lease_expiry_allows_reclaim() {
        let clock = Arc::new(AtomicI64::new(0));
        let store = Arc::new(InMemoryStore::new());
        let c = clock.clone();
        let orch = Orchestrator::new(store.clone(), RetryPolicy::default())
            .without_chaining()
            .with_clock(move || c.load(Ordering::SeqCst));
        store.insert_document(&document("d1", "C1")).await.unwrap();
        let id = orch.enqueue("d1", Stage::Ingest).await.unwrap().task_id().to_string();
        orch.claim(&id, "w1").await.unwrap();
        assert!(orch.claim_next("w2").await.unwrap().is_none());

        clock.store(300, Ordering::SeqCst);
        let reclaimed = orch.claim_next("w2").await.unwrap().unwrap();
        assert_eq!(reclaimed.id, id);
        assert_eq!(reclaimed.worker_id.as_deref(), Some("w2"));
        assert_eq!(reclaimed.attempts, 1);

        clock.store(600, Ordering::SeqCst);
        orch.claim_next("w3").await.unwrap().unwrap();
        clock.store(900, Ordering::SeqCst);
        assert!(orch.claim_next("w4").await.unwrap().is_none());
        assert_eq!(orch.status(&id).await.unwrap().state, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_stale_worker_cannot_record_outcome_after_reclaim() {
        let clock = Arc::new(AtomicI64::new(0));
        let store = Arc::new(InMemoryStore::new());
        let c = clock.clone();
        let orch = Orchestrator::new(store.clone(), RetryPolicy::default())
            .without_chaining()
            .with_clock(move || c.load(Ordering::SeqCst));
        store.insert_document(&document("d1", "C1")).await.unwrap();
        let id = orch.enqueue("d1", Stage::Ingest).await.unwrap().task_id().to_string();
        orch.claim(&id, "w1").await.unwrap();

        clock.store(300, Ordering::SeqCst);
        orch.claim_next("w2").await.unwrap().unwrap();

        let transient = anyhow::Error::from(PipelineError::TransientProvider("timeout".into()));
        let err = orch.fail(&id, "w1", &transient).await.unwrap_err();
        assert!(matches!(
            pipeline_error(&err),
            Some(PipelineError::AlreadyClaimed(_))
        ));
        assert!(orch.claim_next("w3").await.unwrap().is_none());

        let err = orch.complete(&id, "w1", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(
            pipeline_error(&err),
            Some(PipelineError::AlreadyClaimed(_))
        ));
        let task = store.get_task(&id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.worker_id.as_deref(), Some("w2"));

        orch.complete(&id, "w2", serde_json::json!({})).await.unwrap();
        assert_eq!(orch.status(&id).await.unwrap().state, TaskStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_chaining_enqueues_next_stage() {
        let store = Arc::new(InMemoryStore::new());
        let orch = Orchestrator::new(store.clone(), RetryPolicy::default());
        store.insert_document(&document("d1", "C1")).await.unwrap();
        let id = orch.enqueue("d1", Stage::Ingest).await.unwrap().task_id().to_string();
        orch.claim(&id, "w").await.unwrap();
        store
            .record_ingest(
                "d1",
                &IngestRecord {
                    label: DocLabel::Payslip,
                    confidence: Some(0.9),
                    page_count: 1,
                    spans: &[],
                },
            )
            .await
            .unwrap();
        let follow = orch.complete(&id, "w", serde_json::json!({})).await.unwrap();
        assert_eq!(follow.len(), 1);
        let next = orch.status(follow[0].task_id()).await.unwrap();
        assert_eq!(next.stage, Stage::Index);
        assert_eq!(next.state, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_concurrent_enqueue_and_claim() {
        let (store, orch) = setup();
        store.insert_document(&document("d1", "C1")).await.unwrap();

        let mut handles = Vec::new();
        for i in 0..16 {
            let orch = orch.clone();
            handles.push(tokio::spawn(async move {
                let outcome = orch.enqueue("d1", Stage::Ingest).await.unwrap();
                orch.claim(outcome.task_id(), &format!("w{}", i)).await.is_ok()
            }));
        }
        let mut claimed = 0;
        for h in handles {
            if h.await.unwrap() {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1);
        let tasks = store.subject_tasks("d1").await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(
            tasks.iter().filter(|t| t.status == TaskStatus::Running).count(),
            1
        );
    }
}
