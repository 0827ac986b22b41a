//! Database query functions for the `file_locks` table.
//!
//! Leases are rows keyed on `(path, holder_worker_id)`. Compatibility
//! (whether a new request may coexist with an existing lease on the same
//! path) is enforced by the caller via [`crate::models::FileLockMode::compatible_with`]
//! inside a transaction that locks the relevant rows with `FOR UPDATE`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::models::{FileLock, FileLockMode};

/// Take a session-scoped Postgres advisory lock keyed on `path`, held for
/// the lifetime of the enclosing transaction. `FOR UPDATE` in
/// [`lock_active_leases_for_path`] only locks rows that already exist, so it
/// locks nothing on a path with zero active leases -- two concurrent
/// first-acquires on a fresh path would both see an empty set and both
/// insert. This gate serializes on the path itself, independent of whether
/// any lease row exists yet, so the second transaction blocks until the
/// first commits or rolls back.
pub async fn advisory_lock_path(tx: &mut Transaction<'_, Postgres>, path: &str) -> Result<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(path)
        .execute(&mut **tx)
        .await
        .context("failed to take advisory lock for path")?;

    Ok(())
}

/// Fetch all non-expired leases on a path, locking the rows `FOR UPDATE` so
/// concurrent acquire attempts on the same path serialize.
pub async fn lock_active_leases_for_path(
    tx: &mut Transaction<'_, Postgres>,
    path: &str,
    now: DateTime<Utc>,
) -> Result<Vec<FileLock>> {
    let leases = sqlx::query_as::<_, FileLock>(
        "SELECT * FROM file_locks WHERE path = $1 AND expires_at > $2 FOR UPDATE",
    )
    .bind(path)
    .bind(now)
    .fetch_all(&mut **tx)
    .await
    .context("failed to lock active leases for path")?;

    Ok(leases)
}

/// Insert a new lease row inside an existing transaction. The caller must
/// have already verified compatibility against any existing leases on the
/// path.
pub async fn insert_lease(
    tx: &mut Transaction<'_, Postgres>,
    path: &str,
    holder_worker_id: &str,
    task_id: Uuid,
    mode: FileLockMode,
    expires_at: DateTime<Utc>,
) -> Result<FileLock> {
    let lease = sqlx::query_as::<_, FileLock>(
        "INSERT INTO file_locks (path, holder_worker_id, task_id, mode, expires_at) \
         VALUES ($1, $2, $3, $4, $5) \
         ON CONFLICT (path, holder_worker_id) DO UPDATE \
             SET task_id = EXCLUDED.task_id, \
                 mode = EXCLUDED.mode, \
                 acquired_at = now(), \
                 expires_at = EXCLUDED.expires_at \
         RETURNING *",
    )
    .bind(path)
    .bind(holder_worker_id)
    .bind(task_id)
    .bind(mode)
    .bind(expires_at)
    .fetch_one(&mut **tx)
    .await
    .context("failed to insert file lease")?;

    Ok(lease)
}

/// Release all leases held for a given task (its full file-access set),
/// inside an existing transaction.
pub async fn release_leases_for_task(tx: &mut Transaction<'_, Postgres>, task_id: Uuid) -> Result<u64> {
    let result = sqlx::query("DELETE FROM file_locks WHERE task_id = $1")
        .bind(task_id)
        .execute(&mut **tx)
        .await
        .context("failed to release leases for task")?;

    Ok(result.rows_affected())
}

/// Delete every lease whose `expires_at` has passed. Used by the periodic
/// expiry sweep. Returns the paths that were swept, for logging.
///
/// Takes the same [`advisory_lock_path`] gate on every distinct expired path
/// before deleting, so a sweep can't interleave with an in-flight `acquire`
/// on that path.
pub async fn sweep_expired_leases(
    tx: &mut Transaction<'_, Postgres>,
    now: DateTime<Utc>,
) -> Result<Vec<String>> {
    let candidates: Vec<(String,)> =
        sqlx::query_as("SELECT DISTINCT path FROM file_locks WHERE expires_at <= $1")
            .bind(now)
            .fetch_all(&mut **tx)
            .await
            .context("failed to list expired lease paths")?;

    for (path,) in &candidates {
        advisory_lock_path(tx, path).await?;
    }

    let rows: Vec<(String,)> =
        sqlx::query_as("DELETE FROM file_locks WHERE expires_at <= $1 RETURNING path")
            .bind(now)
            .fetch_all(&mut **tx)
            .await
            .context("failed to sweep expired leases")?;

    Ok(rows.into_iter().map(|(path,)| path).collect())
}
