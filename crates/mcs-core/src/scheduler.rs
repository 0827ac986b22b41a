//! C5: Scheduler -- promotes tasks to `ready`, dispatches claims to
//! polling workers, and reverts stale claims, per spec §4.5.
//!
//! Dispatch couples a task claim with file-lease acquisition: a task is
//! only handed to a worker once every one of its declared file accesses is
//! granted. If any lease conflicts, the claim is rolled back to `ready`
//! (see [`Scheduler::dispatch`]) rather than surfaced as a distinct error
//! -- from the poller's perspective this looks identical to "no task
//! currently available".

use chrono::{Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use mcs_db::models::{AggregateStatus, FileLock, Task};
use mcs_db::queries::tasks as task_queries;

use crate::error::McsError;
use crate::lock_manager::{AcquireOutcome, LockManager};

/// A task handed to a worker, together with the file leases granted for it.
#[derive(Debug, Clone)]
pub struct DispatchedTask {
    pub task: Task,
    pub file_leases: Vec<FileLock>,
}

pub struct Scheduler<'a> {
    pool: &'a PgPool,
    claim_ttl: ChronoDuration,
    lock_ttl: ChronoDuration,
}

impl<'a> Scheduler<'a> {
    pub fn new(pool: &'a PgPool, claim_ttl: ChronoDuration, lock_ttl: ChronoDuration) -> Self {
        Self {
            pool,
            claim_ttl,
            lock_ttl,
        }
    }

    /// Promote every `pending` task in `workflow_id` whose dependencies are
    /// all `completed` to `ready`. Idempotent: returns the IDs it promoted
    /// this call, which may be empty.
    pub async fn promote(&self, workflow_id: Uuid) -> Result<Vec<Uuid>, McsError> {
        task_queries::promote_ready_tasks(self.pool, workflow_id)
            .await
            .map_err(McsError::StoreUnavailable)
    }

    /// Claim the oldest `ready` task for `role` on behalf of `worker_id`,
    /// then attempt to acquire every file lease it declares. Returns `Ok(None)`
    /// both when no task is currently `ready` for the role and when a
    /// candidate task's leases conflict with an existing holder -- in either
    /// case the caller should retry after its own backoff (spec §4.3, §4.5).
    pub async fn dispatch(
        &self,
        role: &str,
        worker_id: &str,
    ) -> Result<Option<DispatchedTask>, McsError> {
        let now = Utc::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| McsError::StoreUnavailable(e.into()))?;

        let Some(task) = task_queries::claim_next_ready(&mut tx, role, worker_id, now)
            .await
            .map_err(McsError::StoreUnavailable)?
        else {
            tx.rollback().await.ok();
            return Ok(None);
        };

        let file_deps = task_queries::list_file_dependencies(self.pool, task.id)
            .await
            .map_err(McsError::StoreUnavailable)?;

        tx.commit().await.map_err(|e| McsError::StoreUnavailable(e.into()))?;

        if file_deps.is_empty() {
            return Ok(Some(DispatchedTask {
                task,
                file_leases: vec![],
            }));
        }

        let locks = LockManager::new(self.pool, self.lock_ttl);
        let mut granted = Vec::with_capacity(file_deps.len());
        for (path, mode) in &file_deps {
            match locks
                .acquire(path, *mode, worker_id, task.id)
                .await
                .map_err(McsError::StoreUnavailable)?
            {
                AcquireOutcome::Granted(lease) => granted.push(lease),
                AcquireOutcome::Conflict { .. } => {
                    locks
                        .release_for_task(task.id)
                        .await
                        .map_err(McsError::StoreUnavailable)?;
                    task_queries::release_claim_to_ready(self.pool, task.id, worker_id)
                        .await
                        .map_err(McsError::StoreUnavailable)?;
                    return Ok(None);
                }
            }
        }

        Ok(Some(DispatchedTask {
            task,
            file_leases: granted,
        }))
    }

    /// Revert every `in_progress` claim older than `claim_ttl` back to
    /// `ready`, releasing any file leases the claim held. Intended to run on
    /// a periodic tick (spec §4.5's stale-claim edge; spec §5 and §9
    /// require a claim's FileLocks to be released on every exit path,
    /// including a server-detected timeout). Returns the reverted tasks.
    pub async fn revert_expired_claims(&self) -> Result<Vec<Task>, McsError> {
        let cutoff = Utc::now() - self.claim_ttl;
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| McsError::StoreUnavailable(e.into()))?;
        let reverted = task_queries::revert_expired_claims(&mut tx, cutoff)
            .await
            .map_err(McsError::StoreUnavailable)?;
        tx.commit().await.map_err(|e| McsError::StoreUnavailable(e.into()))?;

        let locks = LockManager::new(self.pool, self.lock_ttl);
        for task in &reverted {
            locks
                .release_for_task(task.id)
                .await
                .map_err(McsError::StoreUnavailable)?;
        }

        Ok(reverted)
    }

    /// Derive a workflow's aggregate status from its task progress counts,
    /// per spec §3's cascade rule: a workflow is `completed` only once every
    /// task is `completed`, `failed` once any task has exhausted its retry
    /// budget, `pending` before any task has left `pending`, and
    /// `in_progress` otherwise.
    pub async fn compute_workflow_status(
        &self,
        workflow_id: Uuid,
    ) -> Result<AggregateStatus, McsError> {
        let progress = task_queries::get_workflow_progress(self.pool, workflow_id)
            .await
            .map_err(McsError::StoreUnavailable)?;

        // Vacuous truth: a workflow with no tasks satisfies "every task is
        // completed" trivially, so it's completed on creation (spec §8's
        // empty-workflow boundary case) -- checked before the all-pending
        // case below.
        if progress.total == 0 || progress.completed == progress.total {
            return Ok(AggregateStatus::Completed);
        }
        if progress.total == progress.pending {
            return Ok(AggregateStatus::Pending);
        }
        if task_queries::has_exhausted_failed_task(self.pool, workflow_id)
            .await
            .map_err(McsError::StoreUnavailable)?
        {
            return Ok(AggregateStatus::Failed);
        }
        Ok(AggregateStatus::InProgress)
    }

    /// Recompute and persist the aggregate status of the project owning
    /// `workflow_id`, if any, from the statuses of all its workflows (spec
    /// §3, §4.6 step 6's cascade to the project). A no-op for workflows
    /// with no `project_id`.
    pub async fn cascade_project_status(&self, workflow_id: Uuid) -> Result<(), McsError> {
        let workflow = mcs_db::queries::workflows::get_workflow(self.pool, workflow_id)
            .await
            .map_err(McsError::StoreUnavailable)?
            .ok_or_else(|| McsError::not_found_workflow(workflow_id))?;

        let Some(project_id) = workflow.project_id else {
            return Ok(());
        };

        let status = mcs_db::queries::projects::derive_project_status(self.pool, project_id)
            .await
            .map_err(McsError::StoreUnavailable)?;
        mcs_db::queries::projects::update_project_status(self.pool, project_id, status)
            .await
            .map_err(McsError::StoreUnavailable)?;
        Ok(())
    }
}
