//! Database query functions for the `audit_reports` table.

use anyhow::{Context, Result};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::AuditReport;

/// Insert an audit report inside an existing transaction.
pub async fn insert_audit_report(
    tx: &mut Transaction<'_, Postgres>,
    workflow_id: Uuid,
    is_successful: bool,
    feedback: &str,
    rework_directives: serde_json::Value,
    confidence: f32,
) -> Result<AuditReport> {
    let report = sqlx::query_as::<_, AuditReport>(
        "INSERT INTO audit_reports (workflow_id, is_successful, feedback, rework_directives, confidence) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(workflow_id)
    .bind(is_successful)
    .bind(feedback)
    .bind(rework_directives)
    .bind(confidence)
    .fetch_one(&mut **tx)
    .await
    .context("failed to insert audit report")?;

    Ok(report)
}

/// List all audit reports for a workflow, oldest first.
pub async fn list_audit_reports_for_workflow(
    pool: &PgPool,
    workflow_id: Uuid,
) -> Result<Vec<AuditReport>> {
    let reports = sqlx::query_as::<_, AuditReport>(
        "SELECT * FROM audit_reports WHERE workflow_id = $1 ORDER BY created_at ASC",
    )
    .bind(workflow_id)
    .fetch_all(pool)
    .await
    .context("failed to list audit reports for workflow")?;

    Ok(reports)
}

/// Fetch the most recent audit report for a workflow, if any.
pub async fn latest_audit_report(pool: &PgPool, workflow_id: Uuid) -> Result<Option<AuditReport>> {
    let report = sqlx::query_as::<_, AuditReport>(
        "SELECT * FROM audit_reports WHERE workflow_id = $1 ORDER BY created_at DESC LIMIT 1",
    )
    .bind(workflow_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch latest audit report")?;

    Ok(report)
}
