//! C6: Result Handler -- processes a worker's report for a claimed task,
//! per spec §4.6.
//!
//! Steps 1-5 (verify claim, persist the result, release file leases,
//! transition status, promote newly-ready tasks, recompute workflow status)
//! run inside a single store transaction that commits atomically. Whether
//! that commit leaves the workflow fully `completed` is reported back to
//! the caller, which invokes the [`crate::auditor::Auditor`] outside of any
//! transaction -- the LLM call is never made while holding a connection.

use chrono::Duration as ChronoDuration;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use mcs_db::models::{AggregateStatus, TaskStatus};
use mcs_db::queries::{results as result_queries, tasks as task_queries, workflows as workflow_queries};

use crate::error::McsError;
use crate::lock_manager::LockManager;
use crate::scheduler::Scheduler;

/// A worker's report of how a claimed task went.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub task_id: Uuid,
    pub worker_id: String,
    pub success: bool,
    pub final_result: String,
    pub iterations: Value,
    pub execution_time_ms: Option<i64>,
}

/// Outcome of applying a [`WorkerReport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportOutcome {
    pub task_status: TaskStatus,
    pub workflow_id: Uuid,
    pub workflow_status: AggregateStatus,
}

pub struct ResultHandler<'a> {
    pool: &'a PgPool,
    lock_ttl: ChronoDuration,
    max_retries: i32,
}

impl<'a> ResultHandler<'a> {
    pub fn new(pool: &'a PgPool, lock_ttl: ChronoDuration, max_retries: i32) -> Self {
        Self {
            pool,
            lock_ttl,
            max_retries,
        }
    }

    /// Apply a worker's report: verify the claim is still owned by the
    /// reporting worker, persist the result, release its file leases,
    /// transition the task's status (`completed`, retry to `ready`, or
    /// exhausted `failed`), promote any tasks this unblocks, and recompute
    /// the owning workflow's aggregate status.
    pub async fn report(&self, report: WorkerReport) -> Result<ReportOutcome, McsError> {
        let task = task_queries::get_task(self.pool, report.task_id)
            .await
            .map_err(McsError::StoreUnavailable)?
            .ok_or_else(|| McsError::NotFound(format!("task {} not found", report.task_id)))?;

        if task.status != TaskStatus::InProgress || task.claimed_by.as_deref() != Some(&report.worker_id) {
            return Err(McsError::Conflict(format!(
                "task {} is not claimed by worker {:?}",
                report.task_id, report.worker_id
            )));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| McsError::StoreUnavailable(e.into()))?;

        result_queries::upsert_result(
            &mut tx,
            task.id,
            report.iterations,
            &report.final_result,
            &report.worker_id,
            report.execution_time_ms,
        )
        .await
        .map_err(McsError::StoreUnavailable)?;

        let new_status = if report.success {
            let rows = task_queries::transition_claimed_task(
                &mut tx,
                task.id,
                &report.worker_id,
                TaskStatus::Completed,
            )
            .await
            .map_err(McsError::StoreUnavailable)?;
            if rows == 0 {
                return Err(McsError::Conflict(format!(
                    "task {} claim changed before completion could be recorded",
                    task.id
                )));
            }
            TaskStatus::Completed
        } else if task.retry_count < self.max_retries {
            let rows = task_queries::report_failure_retry(&mut tx, task.id, &report.worker_id)
                .await
                .map_err(McsError::StoreUnavailable)?;
            if rows == 0 {
                return Err(McsError::Conflict(format!(
                    "task {} claim changed before retry could be recorded",
                    task.id
                )));
            }
            TaskStatus::Ready
        } else {
            let rows = task_queries::transition_claimed_task(
                &mut tx,
                task.id,
                &report.worker_id,
                TaskStatus::Failed,
            )
            .await
            .map_err(McsError::StoreUnavailable)?;
            if rows == 0 {
                return Err(McsError::Conflict(format!(
                    "task {} claim changed before failure could be recorded",
                    task.id
                )));
            }
            TaskStatus::Failed
        };

        tx.commit().await.map_err(|e| McsError::StoreUnavailable(e.into()))?;

        // Lock release and status cascade happen outside the result
        // transaction: they touch independent rows (file_locks, other
        // tasks, the workflow) and re-derive from committed state rather
        // than needing the same atomic unit as the report itself.
        let locks = LockManager::new(self.pool, self.lock_ttl);
        locks
            .release_for_task(task.id)
            .await
            .map_err(McsError::StoreUnavailable)?;

        task_queries::promote_ready_tasks(self.pool, task.workflow_id)
            .await
            .map_err(McsError::StoreUnavailable)?;

        let scheduler = Scheduler::new(self.pool, ChronoDuration::zero(), self.lock_ttl);
        let workflow_status = scheduler
            .compute_workflow_status(task.workflow_id)
            .await?;

        workflow_queries::update_workflow_status(self.pool, task.workflow_id, workflow_status)
            .await
            .map_err(McsError::StoreUnavailable)?;

        scheduler.cascade_project_status(task.workflow_id).await?;

        Ok(ReportOutcome {
            task_status: new_status,
            workflow_id: task.workflow_id,
            workflow_status,
        })
    }
}
