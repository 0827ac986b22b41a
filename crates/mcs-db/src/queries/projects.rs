//! Database query functions for the `projects` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{AggregateStatus, Project};

/// Insert a new project row. Returns the inserted project with
/// server-generated defaults (id, created_at, status).
pub async fn insert_project(pool: &PgPool, name: &str) -> Result<Project> {
    let project = sqlx::query_as::<_, Project>(
        "INSERT INTO projects (name) VALUES ($1) RETURNING *",
    )
    .bind(name)
    .fetch_one(pool)
    .await
    .context("failed to insert project")?;

    Ok(project)
}

/// Fetch a project by its ID.
pub async fn get_project(pool: &PgPool, id: Uuid) -> Result<Option<Project>> {
    let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch project")?;

    Ok(project)
}

/// List all projects, ordered by creation time (newest first).
pub async fn list_projects(pool: &PgPool) -> Result<Vec<Project>> {
    let projects = sqlx::query_as::<_, Project>("SELECT * FROM projects ORDER BY created_at DESC")
        .fetch_all(pool)
        .await
        .context("failed to list projects")?;

    Ok(projects)
}

/// Derive a project's aggregate status from the statuses of its workflows,
/// per spec.md §3: "Project status derives identically from its
/// workflows" -- the same completed/failed/in_progress/pending rule used
/// for a workflow's tasks, applied one level up. A project with no
/// workflows yet is vacuously `completed`, matching the empty-workflow
/// boundary case.
pub async fn derive_project_status(pool: &PgPool, project_id: Uuid) -> Result<AggregateStatus> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status::text, COUNT(*) as cnt \
         FROM workflows \
         WHERE project_id = $1 \
         GROUP BY status",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await
    .context("failed to derive project status")?;

    let mut total = 0i64;
    let mut completed = 0i64;
    let mut failed = 0i64;
    let mut active = 0i64;
    for (status, count) in &rows {
        total += count;
        match status.as_str() {
            "completed" => completed += count,
            "failed" => failed += count,
            "in_progress" | "ready" => active += count,
            _ => {}
        }
    }

    if total == 0 || completed == total {
        Ok(AggregateStatus::Completed)
    } else if failed > 0 {
        Ok(AggregateStatus::Failed)
    } else if active > 0 {
        Ok(AggregateStatus::InProgress)
    } else {
        Ok(AggregateStatus::Pending)
    }
}

/// Update the status of a project.
pub async fn update_project_status(
    pool: &PgPool,
    id: Uuid,
    status: AggregateStatus,
) -> Result<()> {
    let result = sqlx::query("UPDATE projects SET status = $1 WHERE id = $2")
        .bind(status)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to update project status")?;

    if result.rows_affected() == 0 {
        anyhow::bail!("project {id} not found");
    }

    Ok(())
}
