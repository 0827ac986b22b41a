//! C3: Lock Manager -- grants/releases file-scoped access leases with the
//! read/write/exclusive compatibility matrix from spec §4.3.
//!
//! Every operation is serialized per path via `FOR UPDATE` row locking in
//! [`mcs_db::queries::file_locks`]; the manager never blocks a caller on the
//! server side -- a conflict is returned immediately (spec §4.3, §5).

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use mcs_db::models::{FileLock, FileLockMode};
use mcs_db::queries::file_locks as db;

/// Outcome of an [`LockManager::acquire`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Granted(FileLock),
    Conflict {
        held_by: String,
        held_mode: FileLockMode,
    },
}

/// Grants and releases file-access leases.
pub struct LockManager<'a> {
    pool: &'a PgPool,
    lock_ttl: ChronoDuration,
}

impl<'a> LockManager<'a> {
    pub fn new(pool: &'a PgPool, lock_ttl: ChronoDuration) -> Self {
        Self { pool, lock_ttl }
    }

    /// Attempt to acquire a lease on `path` in `mode` for `holder`, scoped to
    /// `task_id`. Checks compatibility against every still-active lease on
    /// the path. Returns immediately with [`AcquireOutcome::Conflict`] on any
    /// incompatibility -- never blocks the caller, though the underlying
    /// transaction briefly waits on the path's advisory lock if another
    /// acquire for the same path is mid-flight.
    pub async fn acquire(
        &self,
        path: &str,
        mode: FileLockMode,
        holder: &str,
        task_id: Uuid,
    ) -> Result<AcquireOutcome> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.context("failed to begin lock transaction")?;

        // Serializes this path across concurrent `acquire` calls: `FOR
        // UPDATE` below locks nothing on a path with zero rows, so without
        // this gate two first-acquires on a fresh path could both observe an
        // empty active set and both insert.
        db::advisory_lock_path(&mut tx, path)
            .await
            .context("failed to take advisory lock for path")?;

        let active = db::lock_active_leases_for_path(&mut tx, path, now)
            .await
            .context("failed to load active leases")?;

        for lease in &active {
            // A holder re-acquiring its own lease (e.g. a retry poll) is
            // always compatible with itself.
            if lease.holder_worker_id == holder {
                continue;
            }
            if !lease.mode.compatible_with(mode) {
                tx.rollback().await.ok();
                return Ok(AcquireOutcome::Conflict {
                    held_by: lease.holder_worker_id.clone(),
                    held_mode: lease.mode,
                });
            }
        }

        let expires_at = now + self.lock_ttl;
        let lease = db::insert_lease(&mut tx, path, holder, task_id, mode, expires_at)
            .await
            .context("failed to insert lease")?;

        tx.commit().await.context("failed to commit lock transaction")?;

        Ok(AcquireOutcome::Granted(lease))
    }

    /// Release every lease held by `holder` for a single `task_id`. Used by
    /// the Result Handler on task completion/failure (spec §4.6 step 3).
    pub async fn release_for_task(&self, task_id: Uuid) -> Result<u64> {
        let mut tx = self.pool.begin().await.context("failed to begin release transaction")?;
        let released = db::release_leases_for_task(&mut tx, task_id)
            .await
            .context("failed to release leases for task")?;
        tx.commit().await.context("failed to commit release transaction")?;
        Ok(released)
    }

    /// Delete every lease past its TTL. Intended to run on a periodic tick
    /// and opportunistically on every acquire of the same path (spec §4.3).
    pub async fn sweep_expired(&self) -> Result<Vec<String>> {
        self.sweep_expired_at(Utc::now()).await
    }

    async fn sweep_expired_at(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await.context("failed to begin sweep transaction")?;
        let swept = db::sweep_expired_leases(&mut tx, now)
            .await
            .context("failed to sweep expired leases")?;
        tx.commit().await.context("failed to commit sweep transaction")?;
        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcs_test_utils::{create_test_db, drop_test_db};
    use mcs_db::queries::{tasks, workflows};

    async fn seed_task(pool: &PgPool) -> Uuid {
        let mut tx = pool.begin().await.unwrap();
        let workflow = workflows::insert_workflow(&mut tx, "wf", "do a thing", None, serde_json::json!({}))
            .await
            .unwrap();
        let task = tasks::insert_task(&mut tx, workflow.id, "s1", "desc", "developer")
            .await
            .unwrap();
        tx.commit().await.unwrap();
        task.id
    }

    #[tokio::test]
    async fn read_read_compatible() {
        let (pool, db_name) = create_test_db().await;
        let task_id = seed_task(&pool).await;
        let mgr = LockManager::new(&pool, ChronoDuration::minutes(10));

        let a = mgr.acquire("src/main.rs", FileLockMode::Read, "w1", task_id).await.unwrap();
        assert!(matches!(a, AcquireOutcome::Granted(_)));

        let b = mgr.acquire("src/main.rs", FileLockMode::Read, "w2", task_id).await.unwrap();
        assert!(matches!(b, AcquireOutcome::Granted(_)));

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn write_read_conflicts() {
        let (pool, db_name) = create_test_db().await;
        let task_id = seed_task(&pool).await;
        let mgr = LockManager::new(&pool, ChronoDuration::minutes(10));

        mgr.acquire("src/main.rs", FileLockMode::Write, "w1", task_id).await.unwrap();

        let conflict = mgr.acquire("src/main.rs", FileLockMode::Read, "w2", task_id).await.unwrap();
        assert!(matches!(conflict, AcquireOutcome::Conflict { .. }));

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn release_then_reacquire_succeeds() {
        let (pool, db_name) = create_test_db().await;
        let task_id = seed_task(&pool).await;
        let mgr = LockManager::new(&pool, ChronoDuration::minutes(10));

        mgr.acquire("src/main.rs", FileLockMode::Exclusive, "w1", task_id).await.unwrap();
        let released = mgr.release_for_task(task_id).await.unwrap();
        assert_eq!(released, 1);

        let granted = mgr.acquire("src/main.rs", FileLockMode::Write, "w2", task_id).await.unwrap();
        assert!(matches!(granted, AcquireOutcome::Granted(_)));

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn expired_lease_is_swept_and_reacquirable() {
        let (pool, db_name) = create_test_db().await;
        let task_id = seed_task(&pool).await;
        // Negative TTL: the lease is already expired the moment it's granted.
        let mgr = LockManager::new(&pool, ChronoDuration::seconds(-1));

        mgr.acquire("src/main.rs", FileLockMode::Exclusive, "w1", task_id).await.unwrap();

        let swept = mgr.sweep_expired().await.unwrap();
        assert_eq!(swept, vec!["src/main.rs".to_string()]);

        let granted = mgr.acquire("src/main.rs", FileLockMode::Exclusive, "w2", task_id).await.unwrap();
        assert!(matches!(granted, AcquireOutcome::Granted(_)));

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    /// S5 from spec §8: concurrent first-acquires on a path with no prior
    /// lease must still serialize -- exactly one exclusive holder wins, the
    /// rest see a conflict, regardless of arrival order.
    #[tokio::test]
    async fn concurrent_first_acquires_on_fresh_path_serialize() {
        let (pool, db_name) = create_test_db().await;
        let task_id = seed_task(&pool).await;

        let mut handles = Vec::new();
        for i in 0..8 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                let mgr = LockManager::new(&pool, ChronoDuration::minutes(10));
                mgr.acquire("src/contested.rs", FileLockMode::Exclusive, &format!("worker-{i}"), task_id)
                    .await
            }));
        }

        let mut granted = 0;
        let mut conflicted = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                AcquireOutcome::Granted(_) => granted += 1,
                AcquireOutcome::Conflict { .. } => conflicted += 1,
            }
        }

        assert_eq!(granted, 1, "exactly one acquirer should win an exclusive lease on a fresh path");
        assert_eq!(conflicted, 7);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn same_holder_reacquire_is_compatible() {
        let (pool, db_name) = create_test_db().await;
        let task_id = seed_task(&pool).await;
        let mgr = LockManager::new(&pool, ChronoDuration::minutes(10));

        mgr.acquire("src/main.rs", FileLockMode::Exclusive, "w1", task_id).await.unwrap();
        let again = mgr.acquire("src/main.rs", FileLockMode::Exclusive, "w1", task_id).await.unwrap();
        assert!(matches!(again, AcquireOutcome::Granted(_)));

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
