//! Database query functions for the `workflows` table.

use anyhow::{Context, Result};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::{AggregateStatus, Workflow};

/// Insert a new workflow row inside an existing transaction. Returns the
/// inserted workflow with server-generated defaults (id, created_at,
/// updated_at, status).
pub async fn insert_workflow(
    tx: &mut Transaction<'_, Postgres>,
    name: &str,
    user_request: &str,
    project_id: Option<Uuid>,
    metadata: serde_json::Value,
) -> Result<Workflow> {
    let workflow = sqlx::query_as::<_, Workflow>(
        "INSERT INTO workflows (name, user_request, project_id, metadata) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(name)
    .bind(user_request)
    .bind(project_id)
    .bind(metadata)
    .fetch_one(&mut **tx)
    .await
    .context("failed to insert workflow")?;

    Ok(workflow)
}

/// Fetch a workflow by its ID.
pub async fn get_workflow(pool: &PgPool, id: Uuid) -> Result<Option<Workflow>> {
    let workflow = sqlx::query_as::<_, Workflow>("SELECT * FROM workflows WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch workflow")?;

    Ok(workflow)
}

/// List all workflows belonging to a project, ordered by creation time.
pub async fn list_workflows_for_project(pool: &PgPool, project_id: Uuid) -> Result<Vec<Workflow>> {
    let workflows = sqlx::query_as::<_, Workflow>(
        "SELECT * FROM workflows WHERE project_id = $1 ORDER BY created_at ASC",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await
    .context("failed to list workflows for project")?;

    Ok(workflows)
}

/// Update the status of a workflow, bumping `updated_at`.
pub async fn update_workflow_status(pool: &PgPool, id: Uuid, status: AggregateStatus) -> Result<()> {
    let result = sqlx::query(
        "UPDATE workflows SET status = $1, updated_at = now() WHERE id = $2",
    )
    .bind(status)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update workflow status")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("workflow {id} not found");
    }

    Ok(())
}

/// Store the synthesized artifact and mark a workflow `completed`.
pub async fn finalize_workflow(pool: &PgPool, id: Uuid, artifact: &str) -> Result<()> {
    let result = sqlx::query(
        "UPDATE workflows \
         SET status = 'completed', artifact = $1, updated_at = now() \
         WHERE id = $2",
    )
    .bind(artifact)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to finalize workflow")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("workflow {id} not found");
    }

    Ok(())
}

/// Increment `rework_cycles` and flip the workflow back to `in_progress`
/// for another rework pass, inside an existing transaction.
pub async fn begin_rework_cycle(tx: &mut Transaction<'_, Postgres>, id: Uuid) -> Result<Workflow> {
    let workflow = sqlx::query_as::<_, Workflow>(
        "UPDATE workflows \
         SET status = 'in_progress', rework_cycles = rework_cycles + 1, updated_at = now() \
         WHERE id = $1 \
         RETURNING *",
    )
    .bind(id)
    .fetch_optional(&mut **tx)
    .await
    .context("failed to begin rework cycle")?;

    workflow.ok_or_else(|| anyhow::anyhow!("workflow {id} not found"))
}
