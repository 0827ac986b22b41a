//! Integration tests for project, workflow, task, and file-lease CRUD
//! operations.
//!
//! Each test creates a unique temporary database, runs migrations, and drops
//! it on completion so tests are fully isolated.

use chrono::Utc;
use uuid::Uuid;

use mcs_db::models::{AggregateStatus, FileLockMode, TaskStatus};
use mcs_db::queries::{file_locks, projects, tasks, workflows};

use mcs_test_utils::{create_test_db, drop_test_db};

// -----------------------------------------------------------------------
// Project CRUD
// -----------------------------------------------------------------------

#[tokio::test]
async fn insert_and_get_project() {
    let (pool, db_name) = create_test_db().await;

    let project = projects::insert_project(&pool, "test-project")
        .await
        .expect("insert_project should succeed");

    assert_eq!(project.name, "test-project");
    assert_eq!(project.status, AggregateStatus::Pending);

    let fetched = projects::get_project(&pool, project.id)
        .await
        .expect("get_project should succeed")
        .expect("project should exist");

    assert_eq!(fetched.id, project.id);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn get_project_returns_none_for_missing_id() {
    let (pool, db_name) = create_test_db().await;

    let result = projects::get_project(&pool, Uuid::new_v4())
        .await
        .expect("get_project should not error");

    assert!(result.is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn update_project_status_fails_for_missing_project() {
    let (pool, db_name) = create_test_db().await;

    let result =
        projects::update_project_status(&pool, Uuid::new_v4(), AggregateStatus::Completed).await;
    assert!(result.is_err());

    pool.close().await;
    drop_test_db(&db_name).await;
}

// -----------------------------------------------------------------------
// Workflow CRUD
// -----------------------------------------------------------------------

#[tokio::test]
async fn insert_and_get_workflow() {
    let (pool, db_name) = create_test_db().await;

    let project = projects::insert_project(&pool, "proj").await.unwrap();

    let mut tx = pool.begin().await.unwrap();
    let workflow = workflows::insert_workflow(
        &mut tx,
        "build-the-widget",
        "Build a widget",
        Some(project.id),
        serde_json::json!({}),
    )
    .await
    .expect("insert_workflow should succeed");
    tx.commit().await.unwrap();

    assert_eq!(workflow.project_id, Some(project.id));
    assert_eq!(workflow.status, AggregateStatus::Pending);
    assert_eq!(workflow.rework_cycles, 0);
    assert!(workflow.artifact.is_none());

    let fetched = workflows::get_workflow(&pool, workflow.id)
        .await
        .unwrap()
        .expect("workflow should exist");
    assert_eq!(fetched.user_request, "Build a widget");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn list_workflows_for_project_returns_correct_set() {
    let (pool, db_name) = create_test_db().await;

    let project_a = projects::insert_project(&pool, "a").await.unwrap();
    let project_b = projects::insert_project(&pool, "b").await.unwrap();

    let mut tx = pool.begin().await.unwrap();
    workflows::insert_workflow(&mut tx, "wf-a1", "req", Some(project_a.id), serde_json::json!({}))
        .await
        .unwrap();
    workflows::insert_workflow(&mut tx, "wf-a2", "req", Some(project_a.id), serde_json::json!({}))
        .await
        .unwrap();
    workflows::insert_workflow(&mut tx, "wf-b1", "req", Some(project_b.id), serde_json::json!({}))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let a_workflows = workflows::list_workflows_for_project(&pool, project_a.id)
        .await
        .unwrap();
    assert_eq!(a_workflows.len(), 2);

    let b_workflows = workflows::list_workflows_for_project(&pool, project_b.id)
        .await
        .unwrap();
    assert_eq!(b_workflows.len(), 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn finalize_workflow_sets_artifact_and_status() {
    let (pool, db_name) = create_test_db().await;

    let mut tx = pool.begin().await.unwrap();
    let workflow = workflows::insert_workflow(&mut tx, "wf", "req", None, serde_json::json!({}))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    workflows::finalize_workflow(&pool, workflow.id, "final artifact text")
        .await
        .expect("finalize should succeed");

    let updated = workflows::get_workflow(&pool, workflow.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(updated.status, AggregateStatus::Completed);
    assert_eq!(updated.artifact.as_deref(), Some("final artifact text"));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn begin_rework_cycle_increments_counter() {
    let (pool, db_name) = create_test_db().await;

    let mut tx = pool.begin().await.unwrap();
    let workflow = workflows::insert_workflow(&mut tx, "wf", "req", None, serde_json::json!({}))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let mut tx = pool.begin().await.unwrap();
    let reworked = workflows::begin_rework_cycle(&mut tx, workflow.id)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(reworked.rework_cycles, 1);
    assert_eq!(reworked.status, AggregateStatus::InProgress);

    pool.close().await;
    drop_test_db(&db_name).await;
}

// -----------------------------------------------------------------------
// Task CRUD and scheduling
// -----------------------------------------------------------------------

async fn seed_workflow(pool: &sqlx::PgPool) -> Uuid {
    let mut tx = pool.begin().await.unwrap();
    let workflow = workflows::insert_workflow(&mut tx, "wf", "req", None, serde_json::json!({}))
        .await
        .unwrap();
    tx.commit().await.unwrap();
    workflow.id
}

#[tokio::test]
async fn insert_and_get_task() {
    let (pool, db_name) = create_test_db().await;
    let workflow_id = seed_workflow(&pool).await;

    let mut tx = pool.begin().await.unwrap();
    let task = tasks::insert_task(&mut tx, workflow_id, "step-1", "Do the first thing", "coder")
        .await
        .expect("insert_task should succeed");
    tx.commit().await.unwrap();

    assert_eq!(task.workflow_id, workflow_id);
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retry_count, 0);
    assert!(task.claimed_by.is_none());

    let fetched = tasks::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(fetched.step_id, "step-1");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn promote_ready_tasks_respects_dependencies() {
    let (pool, db_name) = create_test_db().await;
    let workflow_id = seed_workflow(&pool).await;

    let mut tx = pool.begin().await.unwrap();
    let a = tasks::insert_task(&mut tx, workflow_id, "a", "first", "coder")
        .await
        .unwrap();
    let b = tasks::insert_task(&mut tx, workflow_id, "b", "second", "coder")
        .await
        .unwrap();
    tasks::insert_task_dependency(&mut tx, b.id, a.id)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    // Nothing depends on `a`, so it alone should be promoted.
    let promoted = tasks::promote_ready_tasks(&pool, workflow_id).await.unwrap();
    assert_eq!(promoted, vec![a.id]);

    let a_fetched = tasks::get_task(&pool, a.id).await.unwrap().unwrap();
    assert_eq!(a_fetched.status, TaskStatus::Ready);
    let b_fetched = tasks::get_task(&pool, b.id).await.unwrap().unwrap();
    assert_eq!(b_fetched.status, TaskStatus::Pending);

    // Complete `a`; now `b` should become promotable.
    let affected =
        tasks::transition_task_status(&pool, a.id, TaskStatus::Ready, TaskStatus::Completed)
            .await
            .unwrap();
    assert_eq!(affected, 1);

    let promoted = tasks::promote_ready_tasks(&pool, workflow_id).await.unwrap();
    assert_eq!(promoted, vec![b.id]);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn claim_next_ready_is_exclusive() {
    let (pool, db_name) = create_test_db().await;
    let workflow_id = seed_workflow(&pool).await;

    let mut tx = pool.begin().await.unwrap();
    let task = tasks::insert_task(&mut tx, workflow_id, "only", "desc", "coder")
        .await
        .unwrap();
    tx.commit().await.unwrap();

    tasks::promote_ready_tasks(&pool, workflow_id).await.unwrap();

    let mut tx = pool.begin().await.unwrap();
    let claimed = tasks::claim_next_ready(&mut tx, "coder", "worker-1", Utc::now())
        .await
        .unwrap()
        .expect("a ready task should be claimable");
    tx.commit().await.unwrap();

    assert_eq!(claimed.id, task.id);
    assert_eq!(claimed.status, TaskStatus::InProgress);
    assert_eq!(claimed.claimed_by.as_deref(), Some("worker-1"));

    // No more ready work for this role.
    let mut tx = pool.begin().await.unwrap();
    let second = tasks::claim_next_ready(&mut tx, "coder", "worker-2", Utc::now())
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert!(second.is_none());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn retry_task_to_pending_increments_retry_count() {
    let (pool, db_name) = create_test_db().await;
    let workflow_id = seed_workflow(&pool).await;

    let mut tx = pool.begin().await.unwrap();
    let task = tasks::insert_task(&mut tx, workflow_id, "t", "d", "coder")
        .await
        .unwrap();
    tx.commit().await.unwrap();

    tasks::promote_ready_tasks(&pool, workflow_id).await.unwrap();
    tasks::transition_task_status(&pool, task.id, TaskStatus::Ready, TaskStatus::Failed)
        .await
        .unwrap();

    let affected = tasks::retry_task_to_pending(&pool, task.id, 0, Some("needs rework"))
        .await
        .unwrap();
    assert_eq!(affected, 1);

    let updated = tasks::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(updated.status, TaskStatus::Pending);
    assert_eq!(updated.retry_count, 1);
    assert_eq!(updated.rework_note.as_deref(), Some("needs rework"));

    // Stale retry_count should not match -- optimistic lock rejects it.
    let affected = tasks::retry_task_to_pending(&pool, task.id, 0, None)
        .await
        .unwrap();
    assert_eq!(affected, 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}

// -----------------------------------------------------------------------
// File lease compatibility
// -----------------------------------------------------------------------

#[tokio::test]
async fn file_lease_roundtrip_and_release() {
    let (pool, db_name) = create_test_db().await;
    let workflow_id = seed_workflow(&pool).await;

    let mut tx = pool.begin().await.unwrap();
    let task = tasks::insert_task(&mut tx, workflow_id, "t", "d", "coder")
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let expires_at = Utc::now() + chrono::Duration::minutes(10);

    let mut tx = pool.begin().await.unwrap();
    let active = file_locks::lock_active_leases_for_path(&mut tx, "src/lib.rs", Utc::now())
        .await
        .unwrap();
    assert!(active.is_empty());

    let lease = file_locks::insert_lease(
        &mut tx,
        "src/lib.rs",
        "worker-1",
        task.id,
        FileLockMode::Write,
        expires_at,
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    assert_eq!(lease.mode, FileLockMode::Write);

    let mut tx = pool.begin().await.unwrap();
    let released = file_locks::release_leases_for_task(&mut tx, task.id)
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert_eq!(released, 1);

    let mut tx = pool.begin().await.unwrap();
    let active = file_locks::lock_active_leases_for_path(&mut tx, "src/lib.rs", Utc::now())
        .await
        .unwrap();
    tx.commit().await.unwrap();
    assert!(active.is_empty());

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn sweep_expired_leases_removes_only_expired() {
    let (pool, db_name) = create_test_db().await;
    let workflow_id = seed_workflow(&pool).await;

    let mut tx = pool.begin().await.unwrap();
    let task = tasks::insert_task(&mut tx, workflow_id, "t", "d", "coder")
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let past = Utc::now() - chrono::Duration::minutes(5);
    let future = Utc::now() + chrono::Duration::minutes(30);

    let mut tx = pool.begin().await.unwrap();
    file_locks::insert_lease(&mut tx, "stale.rs", "w1", task.id, FileLockMode::Read, past)
        .await
        .unwrap();
    file_locks::insert_lease(&mut tx, "fresh.rs", "w2", task.id, FileLockMode::Read, future)
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let mut tx = pool.begin().await.unwrap();
    let swept = file_locks::sweep_expired_leases(&mut tx, Utc::now()).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(swept, vec!["stale.rs".to_string()]);

    pool.close().await;
    drop_test_db(&db_name).await;
}
