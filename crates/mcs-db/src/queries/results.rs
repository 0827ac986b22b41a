//! Database query functions for the `results` table.

use anyhow::{Context, Result};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::TaskResult;

/// Insert or overwrite a task's result row inside an existing transaction.
///
/// A task has at most one result row; reworked tasks overwrite the prior
/// row's `iterations`/`final_result` rather than accumulating a history of
/// rows.
pub async fn upsert_result(
    tx: &mut Transaction<'_, Postgres>,
    task_id: Uuid,
    iterations: serde_json::Value,
    final_result: &str,
    source_worker: &str,
    execution_time_ms: Option<i64>,
) -> Result<TaskResult> {
    let result = sqlx::query_as::<_, TaskResult>(
        "INSERT INTO results (task_id, iterations, final_result, source_worker, execution_time_ms) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (task_id) DO UPDATE \
             SET iterations = EXCLUDED.iterations, \
                 final_result = EXCLUDED.final_result, \
                 source_worker = EXCLUDED.source_worker, \
                 execution_time_ms = EXCLUDED.execution_time_ms, \
                 created_at = now() \
         RETURNING *",
    )
    .bind(task_id)
    .bind(iterations)
    .bind(final_result)
    .bind(source_worker)
    .bind(execution_time_ms)
    .fetch_one(&mut **tx)
    .await
    .context("failed to upsert task result")?;

    Ok(result)
}

/// Fetch the result for a given task, if any.
pub async fn get_result_for_task(pool: &PgPool, task_id: Uuid) -> Result<Option<TaskResult>> {
    let result = sqlx::query_as::<_, TaskResult>("SELECT * FROM results WHERE task_id = $1")
        .bind(task_id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task result")?;

    Ok(result)
}

/// Fetch all results for a workflow's tasks, joined through `tasks`, ordered
/// by task creation time. Used to assemble the synthesis input for the
/// workflow artifact.
pub async fn list_results_for_workflow(pool: &PgPool, workflow_id: Uuid) -> Result<Vec<TaskResult>> {
    let results = sqlx::query_as::<_, TaskResult>(
        "SELECT r.* FROM results r \
         JOIN tasks t ON t.id = r.task_id \
         WHERE t.workflow_id = $1 \
         ORDER BY t.created_at ASC",
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await
    .context("failed to list results for workflow")?;

    Ok(results)
}
