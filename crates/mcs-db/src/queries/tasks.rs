//! Database query functions for the `tasks` and `task_dependencies`/
//! `task_file_dependencies` tables.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::{FileLockMode, Task, TaskStatus};

/// Insert a new task row inside an existing transaction. Returns the
/// inserted task with server-generated defaults (id, created_at,
/// updated_at, status).
pub async fn insert_task(
    tx: &mut Transaction<'_, Postgres>,
    workflow_id: Uuid,
    step_id: &str,
    description: &str,
    role: &str,
) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (workflow_id, step_id, description, role) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(workflow_id)
    .bind(step_id)
    .bind(description)
    .bind(role)
    .fetch_one(&mut **tx)
    .await
    .context("failed to insert task")?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// Fetch a task by `(workflow_id, step_id)`, the natural key used when
/// resolving dependency references inside a task graph.
pub async fn get_task_by_step_id(
    tx: &mut Transaction<'_, Postgres>,
    workflow_id: Uuid,
    step_id: &str,
) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE workflow_id = $1 AND step_id = $2",
    )
    .bind(workflow_id)
    .bind(step_id)
    .fetch_optional(&mut **tx)
    .await
    .context("failed to fetch task by step_id")?;

    Ok(task)
}

/// List all tasks for a given workflow, ordered by creation time.
pub async fn list_tasks_for_workflow(pool: &PgPool, workflow_id: Uuid) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE workflow_id = $1 ORDER BY created_at ASC",
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await
    .context("failed to list tasks for workflow")?;

    Ok(tasks)
}

/// Insert a dependency edge: `task_id` depends on `depends_on`, inside an
/// existing transaction.
pub async fn insert_task_dependency(
    tx: &mut Transaction<'_, Postgres>,
    task_id: Uuid,
    depends_on: Uuid,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO task_dependencies (task_id, depends_on) VALUES ($1, $2) \
         ON CONFLICT DO NOTHING",
    )
    .bind(task_id)
    .bind(depends_on)
    .execute(&mut **tx)
    .await
    .context("failed to insert task dependency")?;

    Ok(())
}

/// Insert a declared file access for a task, inside an existing
/// transaction.
pub async fn insert_task_file_dependency(
    tx: &mut Transaction<'_, Postgres>,
    task_id: Uuid,
    path: &str,
    mode: FileLockMode,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO task_file_dependencies (task_id, path, mode) VALUES ($1, $2, $3) \
         ON CONFLICT (task_id, path) DO UPDATE SET mode = EXCLUDED.mode",
    )
    .bind(task_id)
    .bind(path)
    .bind(mode)
    .execute(&mut **tx)
    .await
    .context("failed to insert task file dependency")?;

    Ok(())
}

/// List a task's declared file accesses.
pub async fn list_file_dependencies(
    pool: &PgPool,
    task_id: Uuid,
) -> Result<Vec<(String, FileLockMode)>> {
    let rows: Vec<(String, FileLockMode)> = sqlx::query_as(
        "SELECT path, mode FROM task_file_dependencies WHERE task_id = $1 ORDER BY path",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .context("failed to list file dependencies")?;

    Ok(rows)
}

/// Get the IDs of all tasks that a given task depends on.
pub async fn get_task_dependencies(pool: &PgPool, task_id: Uuid) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> =
        sqlx::query_as("SELECT depends_on FROM task_dependencies WHERE task_id = $1")
            .bind(task_id)
            .fetch_all(pool)
            .await
            .context("failed to get task dependencies")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

// -----------------------------------------------------------------------
// Scheduling / state machine
// -----------------------------------------------------------------------

/// Promote every `pending` task in a workflow whose dependencies are all
/// `completed` to `ready`. Returns the IDs promoted.
pub async fn promote_ready_tasks(pool: &PgPool, workflow_id: Uuid) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "UPDATE tasks t \
         SET status = 'ready', updated_at = now() \
         WHERE t.workflow_id = $1 \
           AND t.status = 'pending' \
           AND NOT EXISTS ( \
               SELECT 1 FROM task_dependencies td \
               JOIN tasks dep ON dep.id = td.depends_on \
               WHERE td.task_id = t.id AND dep.status != 'completed' \
           ) \
         RETURNING t.id",
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await
    .context("failed to promote ready tasks")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Same as [`promote_ready_tasks`] but scoped to an existing transaction, so
/// the initial promotion at workflow-creation time commits atomically with
/// the rest of the graph insert (spec.md §4.4 step 5).
pub async fn promote_ready_tasks_tx(
    tx: &mut Transaction<'_, Postgres>,
    workflow_id: Uuid,
) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "UPDATE tasks t \
         SET status = 'ready', updated_at = now() \
         WHERE t.workflow_id = $1 \
           AND t.status = 'pending' \
           AND NOT EXISTS ( \
               SELECT 1 FROM task_dependencies td \
               JOIN tasks dep ON dep.id = td.depends_on \
               WHERE td.task_id = t.id AND dep.status != 'completed' \
           ) \
         RETURNING t.id",
    )
    .bind(workflow_id)
    .fetch_all(&mut **tx)
    .await
    .context("failed to promote ready tasks")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Revert a single claimed task back to `ready`, clearing claim metadata
/// without touching `retry_count`. Used by the scheduler to un-claim a task
/// whose file leases could not be acquired at dispatch time.
pub async fn release_claim_to_ready(pool: &PgPool, task_id: Uuid, worker_id: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'ready', claimed_by = NULL, claimed_at = NULL, updated_at = now() \
         WHERE id = $1 AND status = 'in_progress' AND claimed_by = $2",
    )
    .bind(task_id)
    .bind(worker_id)
    .execute(pool)
    .await
    .context("failed to release claim to ready")?;

    Ok(result.rows_affected())
}

/// Report a task failure with retries remaining: transitions
/// `in_progress -> ready`, clears claim metadata, increments `retry_count`.
/// Scoped to an existing transaction and verifies claim ownership, matching
/// spec.md §4.5's "failure, retries left -> READY" edge.
pub async fn report_failure_retry(
    tx: &mut Transaction<'_, Postgres>,
    task_id: Uuid,
    worker_id: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'ready', \
             claimed_by = NULL, \
             claimed_at = NULL, \
             retry_count = retry_count + 1, \
             updated_at = now() \
         WHERE id = $1 AND status = 'in_progress' AND claimed_by = $2",
    )
    .bind(task_id)
    .bind(worker_id)
    .execute(&mut **tx)
    .await
    .context("failed to report retryable failure")?;

    Ok(result.rows_affected())
}

/// Atomically claim the oldest `ready` task for a given role, locking the
/// row with `FOR UPDATE SKIP LOCKED` so concurrent claimants never contend
/// on the same candidate row. Returns `None` if no task is currently
/// claimable.
pub async fn claim_next_ready(
    tx: &mut Transaction<'_, Postgres>,
    role: &str,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<Task>> {
    let candidate: Option<(Uuid,)> = sqlx::query_as(
        "SELECT id FROM tasks \
         WHERE status = 'ready' AND role = $1 \
         ORDER BY updated_at ASC, step_id ASC \
         FOR UPDATE SKIP LOCKED \
         LIMIT 1",
    )
    .bind(role)
    .fetch_optional(&mut **tx)
    .await
    .context("failed to select claim candidate")?;

    let Some((task_id,)) = candidate else {
        return Ok(None);
    };

    let task = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET status = 'in_progress', claimed_by = $1, claimed_at = $2, updated_at = $2 \
         WHERE id = $3 AND status = 'ready' \
         RETURNING *",
    )
    .bind(worker_id)
    .bind(now)
    .bind(task_id)
    .fetch_optional(&mut **tx)
    .await
    .context("failed to claim task")?;

    Ok(task)
}

/// Atomically transition a task from one status to another, optimistically
/// locked on the current status. Returns the number of rows affected (0
/// means the status did not match, e.g. a stale claim).
pub async fn transition_task_status(
    pool: &PgPool,
    task_id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET status = $1, updated_at = now() WHERE id = $2 AND status = $3",
    )
    .bind(to)
    .bind(task_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition task status")?;

    Ok(result.rows_affected())
}

/// Same as [`transition_task_status`] but scoped to an existing
/// transaction and verifying claim ownership (`claimed_by = worker_id`) as
/// part of the optimistic lock, matching spec.md's worker-report handling.
pub async fn transition_claimed_task(
    tx: &mut Transaction<'_, Postgres>,
    task_id: Uuid,
    worker_id: &str,
    to: TaskStatus,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = $1, updated_at = now() \
         WHERE id = $2 AND status = 'in_progress' AND claimed_by = $3",
    )
    .bind(to)
    .bind(task_id)
    .bind(worker_id)
    .execute(&mut **tx)
    .await
    .context("failed to transition claimed task")?;

    Ok(result.rows_affected())
}

/// Reset a `failed` task back to `pending` for a retry, incrementing
/// `retry_count` and clearing claim metadata, recording `rework_note`.
/// Optimistically locked on `retry_count` to guard against concurrent
/// retries of the same task.
pub async fn retry_task_to_pending(
    pool: &PgPool,
    task_id: Uuid,
    current_retry_count: i32,
    rework_note: Option<&str>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'pending', \
             retry_count = retry_count + 1, \
             claimed_by = NULL, \
             claimed_at = NULL, \
             rework_note = $1, \
             updated_at = now() \
         WHERE id = $2 AND status = 'failed' AND retry_count = $3",
    )
    .bind(rework_note)
    .bind(task_id)
    .bind(current_retry_count)
    .execute(pool)
    .await
    .context("failed to retry task to pending")?;

    Ok(result.rows_affected())
}

/// Find every task in a workflow that transitively depends on one of
/// `seed_step_ids`, via `task_dependencies`. Excludes the seeds themselves.
/// Used to cascade an audit's rework directive to the tasks whose results
/// it invalidates (spec.md §4.1).
pub async fn get_transitive_dependent_step_ids(
    pool: &PgPool,
    workflow_id: Uuid,
    seed_step_ids: &[String],
) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "WITH RECURSIVE dependents(id, step_id) AS ( \
             SELECT id, step_id FROM tasks WHERE workflow_id = $1 AND step_id = ANY($2) \
             UNION \
             SELECT t.id, t.step_id \
             FROM tasks t \
             JOIN task_dependencies td ON td.task_id = t.id \
             JOIN dependents d ON td.depends_on = d.id \
         ) \
         SELECT step_id FROM dependents WHERE NOT (step_id = ANY($2))",
    )
    .bind(workflow_id)
    .bind(seed_step_ids)
    .fetch_all(pool)
    .await
    .context("failed to compute transitive dependents")?;

    Ok(rows.into_iter().map(|(step_id,)| step_id).collect())
}

/// Reset every task of a workflow back to `pending` (clearing claim
/// metadata) for a rework cycle, skipping tasks that are still in flight.
/// Used when an audit directs rework scoped by affected step IDs.
pub async fn reset_tasks_for_rework(
    tx: &mut Transaction<'_, Postgres>,
    workflow_id: Uuid,
    step_ids: &[String],
    rework_note: &str,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET status = 'pending', \
             claimed_by = NULL, \
             claimed_at = NULL, \
             rework_note = $1, \
             updated_at = now() \
         WHERE workflow_id = $2 AND step_id = ANY($3) \
         RETURNING *",
    )
    .bind(rework_note)
    .bind(workflow_id)
    .bind(step_ids)
    .fetch_all(&mut **tx)
    .await
    .context("failed to reset tasks for rework")?;

    Ok(tasks)
}

/// Revert claims whose `claimed_at` is older than the claim TTL back to
/// `ready`, clearing claim metadata. Used by the periodic expiry sweep.
/// Returns the tasks that were reverted.
pub async fn revert_expired_claims(
    tx: &mut Transaction<'_, Postgres>,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "UPDATE tasks \
         SET status = 'ready', claimed_by = NULL, claimed_at = NULL, updated_at = now() \
         WHERE status = 'in_progress' AND claimed_at < $1 \
         RETURNING *",
    )
    .bind(cutoff)
    .fetch_all(&mut **tx)
    .await
    .context("failed to revert expired claims")?;

    Ok(tasks)
}

/// Status counts for a workflow's tasks.
#[derive(Debug, Clone, Default)]
pub struct WorkflowProgress {
    pub pending: i64,
    pub ready: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub failed: i64,
    pub total: i64,
}

/// Get a summary of task counts by status for a given workflow.
pub async fn get_workflow_progress(pool: &PgPool, workflow_id: Uuid) -> Result<WorkflowProgress> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status::text, COUNT(*) as cnt \
         FROM tasks \
         WHERE workflow_id = $1 \
         GROUP BY status",
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await
    .context("failed to get workflow progress")?;

    let mut progress = WorkflowProgress::default();
    for (status, count) in &rows {
        match status.as_str() {
            "pending" => progress.pending = *count,
            "ready" => progress.ready = *count,
            "in_progress" => progress.in_progress = *count,
            "completed" => progress.completed = *count,
            "failed" => progress.failed = *count,
            _ => {}
        }
        progress.total += count;
    }
    Ok(progress)
}

/// Check whether every task in a workflow has status `completed`.
pub async fn is_workflow_complete(pool: &PgPool, workflow_id: Uuid) -> Result<bool> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM tasks WHERE workflow_id = $1 AND status != 'completed'",
    )
    .bind(workflow_id)
    .fetch_one(pool)
    .await
    .context("failed to check workflow completion")?;

    Ok(row.0 == 0)
}

/// Check whether any task in a workflow has status `failed`. A task only
/// ever reaches `failed` once the result handler has exhausted its retry
/// budget (anything retryable is re-READYed instead), so `status = 'failed'`
/// alone is the exhaustion signal -- no separate `retry_count` comparison.
pub async fn has_exhausted_failed_task(pool: &PgPool, workflow_id: Uuid) -> Result<bool> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM tasks WHERE workflow_id = $1 AND status = 'failed'",
    )
    .bind(workflow_id)
    .fetch_one(pool)
    .await
    .context("failed to check for exhausted failed tasks")?;

    Ok(row.0 > 0)
}
