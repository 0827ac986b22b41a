//! C7: Auditor -- evaluates a fully-completed workflow and either accepts
//! it (synthesizing the final artifact) or sends named tasks back for
//! rework, per spec §4.7.
//!
//! Like the Planner, the LLM call itself happens outside any store
//! transaction; only the follow-on persistence (the audit report row, and
//! either `finalize_workflow` or the rework reset) is transactional.

use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use mcs_db::models::{AggregateStatus, Workflow};
use mcs_db::queries::{
    audit_reports as audit_queries, results as result_queries, tasks as task_queries,
    workflows as workflow_queries,
};

use crate::error::McsError;
use crate::llm_gateway::LlmGateway;
use crate::scheduler::Scheduler;

const SCHEMA_HINT: &str = r#"{
  "is_successful": "boolean, whether the completed work satisfies the original request",
  "confidence": "number between 0.0 and 1.0",
  "feedback": "string, a summary of what was evaluated and why",
  "rework_directives": [
    {
      "step_id": "string, matches an existing task's step_id",
      "reason": "string, what must change",
      "cascade": "boolean, optional, default true -- also reset tasks that transitively depend on this one"
    }
  ]
}"#;

fn validate_audit_shape(value: &Value) -> Result<(), String> {
    if value.get("is_successful").and_then(Value::as_bool).is_none() {
        return Err("missing boolean field `is_successful`".to_string());
    }
    let confidence = value
        .get("confidence")
        .and_then(Value::as_f64)
        .ok_or("missing numeric field `confidence`")?;
    if !(0.0..=1.0).contains(&confidence) {
        return Err("`confidence` must be between 0.0 and 1.0".to_string());
    }
    if value.get("feedback").and_then(Value::as_str).is_none() {
        return Err("missing string field `feedback`".to_string());
    }
    let directives = value
        .get("rework_directives")
        .and_then(Value::as_array)
        .ok_or("missing `rework_directives` array")?;
    for (i, directive) in directives.iter().enumerate() {
        if directive.get("step_id").and_then(Value::as_str).is_none() {
            return Err(format!("rework_directives[{i}] missing string field `step_id`"));
        }
        if directive.get("reason").and_then(Value::as_str).is_none() {
            return Err(format!("rework_directives[{i}] missing string field `reason`"));
        }
        if let Some(cascade) = directive.get("cascade") {
            if !cascade.is_boolean() {
                return Err(format!("rework_directives[{i}].cascade must be a boolean"));
            }
        }
    }
    Ok(())
}

/// One task the Auditor has flagged for rework, with whether the reset
/// should cascade to transitive dependents (spec §4.1: defaults to true).
#[derive(Debug, Clone, Serialize)]
struct ReworkDirective {
    step_id: String,
    reason: String,
    cascade: bool,
}

#[derive(Debug, Clone)]
struct AuditVerdict {
    is_successful: bool,
    confidence: f32,
    feedback: String,
    rework_directives: Vec<ReworkDirective>,
}

/// Outcome of an [`Auditor::audit`] pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditOutcome {
    Accepted,
    SentToRework { step_ids: Vec<String> },
}

pub struct Auditor<'a> {
    pool: &'a PgPool,
    gateway: &'a dyn LlmGateway,
    max_llm_attempts: u32,
    confidence_threshold: f32,
    max_rework_cycles: i32,
}

impl<'a> Auditor<'a> {
    pub fn new(
        pool: &'a PgPool,
        gateway: &'a dyn LlmGateway,
        max_llm_attempts: u32,
        confidence_threshold: f32,
        max_rework_cycles: i32,
    ) -> Self {
        Self {
            pool,
            gateway,
            max_llm_attempts,
            confidence_threshold,
            max_rework_cycles,
        }
    }

    /// Audit a workflow whose tasks are all `completed`. Accepts it
    /// (synthesizing and persisting the final artifact) or resets the
    /// directed steps for another rework cycle.
    pub async fn audit(&self, workflow_id: Uuid) -> Result<AuditOutcome, McsError> {
        let workflow = workflow_queries::get_workflow(self.pool, workflow_id)
            .await
            .map_err(McsError::StoreUnavailable)?
            .ok_or_else(|| McsError::not_found_workflow(workflow_id))?;

        let verdict = self.evaluate(&workflow).await?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| McsError::StoreUnavailable(e.into()))?;

        audit_queries::insert_audit_report(
            &mut tx,
            workflow_id,
            verdict.is_successful,
            &verdict.feedback,
            serde_json::to_value(&verdict.rework_directives).expect("directive pairs always serialize"),
            verdict.confidence,
        )
        .await
        .map_err(McsError::StoreUnavailable)?;

        // Unknown step_ids in directives are discarded (spec §4.7): an LLM
        // can name a step that was never part of the graph, and acting on it
        // would reset zero rows while still spending a rework cycle.
        let known_step_ids = task_queries::list_tasks_for_workflow(self.pool, workflow_id)
            .await
            .map_err(McsError::StoreUnavailable)?
            .into_iter()
            .map(|t| t.step_id)
            .collect::<std::collections::HashSet<_>>();
        let known_directives: Vec<&ReworkDirective> = verdict
            .rework_directives
            .iter()
            .filter(|d| known_step_ids.contains(&d.step_id))
            .collect();

        let exhausted = workflow.rework_cycles >= self.max_rework_cycles;
        let accepted = exhausted
            || (verdict.is_successful && verdict.confidence >= self.confidence_threshold)
            || known_directives.is_empty();

        if accepted {
            tx.commit().await.map_err(|e| McsError::StoreUnavailable(e.into()))?;
            self.finalize(workflow_id).await?;
            return Ok(AuditOutcome::Accepted);
        }

        let mut step_ids: Vec<String> = known_directives.iter().map(|d| d.step_id.clone()).collect();

        // Cascade: a directive reset invalidates any task that transitively
        // depends on it, unless the directive opts out (spec §4.1).
        let cascade_seeds: Vec<String> = known_directives
            .iter()
            .filter(|d| d.cascade)
            .map(|d| d.step_id.clone())
            .collect();
        if !cascade_seeds.is_empty() {
            let dependents =
                task_queries::get_transitive_dependent_step_ids(self.pool, workflow_id, &cascade_seeds)
                    .await
                    .map_err(McsError::StoreUnavailable)?;
            for step_id in dependents {
                if !step_ids.contains(&step_id) {
                    step_ids.push(step_id);
                }
            }
        }

        let combined_note = known_directives
            .iter()
            .map(|d| format!("{}: {}", d.step_id, d.reason))
            .collect::<Vec<_>>()
            .join("; ");

        task_queries::reset_tasks_for_rework(&mut tx, workflow_id, &step_ids, &combined_note)
            .await
            .map_err(McsError::StoreUnavailable)?;

        workflow_queries::begin_rework_cycle(&mut tx, workflow_id)
            .await
            .map_err(McsError::StoreUnavailable)?;

        tx.commit().await.map_err(|e| McsError::StoreUnavailable(e.into()))?;

        task_queries::promote_ready_tasks(self.pool, workflow_id)
            .await
            .map_err(McsError::StoreUnavailable)?;

        self.scheduler().cascade_project_status(workflow_id).await?;

        Ok(AuditOutcome::SentToRework { step_ids })
    }

    async fn evaluate(&self, workflow: &Workflow) -> Result<AuditVerdict, McsError> {
        let tasks = task_queries::list_tasks_for_workflow(self.pool, workflow.id)
            .await
            .map_err(McsError::StoreUnavailable)?;
        let results = result_queries::list_results_for_workflow(self.pool, workflow.id)
            .await
            .map_err(McsError::StoreUnavailable)?;

        let mut summary = String::new();
        for task in &tasks {
            let result = results.iter().find(|r| r.task_id == task.id);
            summary.push_str(&format!(
                "- [{}] {} ({}): {}\n",
                task.step_id,
                task.description,
                task.role,
                result.map(|r| r.final_result.as_str()).unwrap_or("<no result>"),
            ));
        }

        let prompt = format!(
            "Evaluate whether the following completed tasks satisfy this request:\n\n\
             Request: {}\n\nCompleted tasks:\n{summary}",
            workflow.user_request,
        );

        let value = match self
            .gateway
            .complete(&prompt, SCHEMA_HINT, validate_audit_shape, self.max_llm_attempts)
            .await
        {
            Ok(value) => value,
            Err(e) => {
                // AuditFailure policy (spec §7): failing the whole workflow
                // because the auditor's Gateway call failed is worse than
                // accepting unaudited output, so treat it as a successful
                // verdict carrying a note rather than propagating the error.
                tracing::warn!(error = %e, workflow_id = %workflow.id, "auditor LLM call failed, accepting unaudited");
                return Ok(AuditVerdict {
                    is_successful: true,
                    confidence: 1.0,
                    feedback: format!("audit skipped: LLM Gateway unavailable ({e})"),
                    rework_directives: vec![],
                });
            }
        };

        let is_successful = value["is_successful"].as_bool().expect("validated above");
        let confidence = value["confidence"].as_f64().expect("validated above") as f32;
        let feedback = value["feedback"].as_str().expect("validated above").to_string();
        let rework_directives = value["rework_directives"]
            .as_array()
            .expect("validated above")
            .iter()
            .map(|d| ReworkDirective {
                step_id: d["step_id"].as_str().expect("validated above").to_string(),
                reason: d["reason"].as_str().expect("validated above").to_string(),
                cascade: d.get("cascade").and_then(Value::as_bool).unwrap_or(true),
            })
            .collect();

        Ok(AuditVerdict {
            is_successful,
            confidence,
            feedback,
            rework_directives,
        })
    }

    async fn finalize(&self, workflow_id: Uuid) -> Result<(), McsError> {
        let results = result_queries::list_results_for_workflow(self.pool, workflow_id)
            .await
            .map_err(McsError::StoreUnavailable)?;
        let artifact = synthesize_artifact(&results);
        workflow_queries::finalize_workflow(self.pool, workflow_id, &artifact)
            .await
            .map_err(McsError::StoreUnavailable)?;
        self.scheduler().cascade_project_status(workflow_id).await?;
        Ok(())
    }

    /// A throwaway [`Scheduler`] for its `cascade_project_status` helper;
    /// the claim/lock TTLs are irrelevant to that operation.
    fn scheduler(&self) -> Scheduler<'a> {
        Scheduler::new(self.pool, chrono::Duration::zero(), chrono::Duration::zero())
    }
}

/// Join every task's final result into the workflow's delivered artifact,
/// in task-creation order. Kept intentionally simple: this is string
/// concatenation, not another LLM call -- the Auditor already confirmed
/// the results satisfy the request.
fn synthesize_artifact(results: &[mcs_db::models::TaskResult]) -> String {
    results
        .iter()
        .map(|r| r.final_result.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_gateway::MockLlmGateway;
    use mcs_db::queries::workflows;
    use mcs_test_utils::{create_test_db, drop_test_db};

    async fn seed_completed_workflow(pool: &PgPool) -> Uuid {
        let mut tx = pool.begin().await.unwrap();
        let workflow = workflows::insert_workflow(&mut tx, "wf", "ship the feature", None, serde_json::json!({}))
            .await
            .unwrap();
        let task = task_queries::insert_task(&mut tx, workflow.id, "s1", "implement it", "developer")
            .await
            .unwrap();
        result_queries::upsert_result(&mut tx, task.id, serde_json::json!([]), "feature shipped", "worker-1", Some(500))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        sqlx::query("UPDATE tasks SET status = 'completed' WHERE id = $1")
            .bind(task.id)
            .execute(pool)
            .await
            .unwrap();
        workflow_queries::update_workflow_status(pool, workflow.id, AggregateStatus::Completed)
            .await
            .unwrap();
        workflow.id
    }

    async fn seed_completed_workflow_with_dependency(pool: &PgPool) -> (Uuid, Uuid, Uuid) {
        let mut tx = pool.begin().await.unwrap();
        let workflow = workflows::insert_workflow(&mut tx, "wf", "ship the feature", None, serde_json::json!({}))
            .await
            .unwrap();
        let s1 = task_queries::insert_task(&mut tx, workflow.id, "s1", "implement it", "developer")
            .await
            .unwrap();
        let s2 = task_queries::insert_task(&mut tx, workflow.id, "s2", "verify it", "tester")
            .await
            .unwrap();
        task_queries::insert_task_dependency(&mut tx, s2.id, s1.id).await.unwrap();
        result_queries::upsert_result(&mut tx, s1.id, serde_json::json!([]), "feature shipped", "worker-1", Some(500))
            .await
            .unwrap();
        result_queries::upsert_result(&mut tx, s2.id, serde_json::json!([]), "tests pass", "worker-2", Some(200))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        sqlx::query("UPDATE tasks SET status = 'completed' WHERE workflow_id = $1")
            .bind(workflow.id)
            .execute(pool)
            .await
            .unwrap();
        workflow_queries::update_workflow_status(pool, workflow.id, AggregateStatus::Completed)
            .await
            .unwrap();
        (workflow.id, s1.id, s2.id)
    }

    fn accept_verdict() -> String {
        serde_json::json!({
            "is_successful": true,
            "confidence": 0.95,
            "feedback": "looks correct",
            "rework_directives": []
        })
        .to_string()
    }

    fn reject_verdict() -> String {
        serde_json::json!({
            "is_successful": false,
            "confidence": 0.3,
            "feedback": "missing edge case handling",
            "rework_directives": [{"step_id": "s1", "reason": "handle the empty input case"}]
        })
        .to_string()
    }

    #[tokio::test]
    async fn accepts_and_finalizes_successful_workflow() {
        let (pool, db_name) = create_test_db().await;
        let workflow_id = seed_completed_workflow(&pool).await;
        let gateway = MockLlmGateway::always(accept_verdict());
        let auditor = Auditor::new(&pool, &gateway, 3, 0.7, 3);

        let outcome = auditor.audit(workflow_id).await.unwrap();
        assert_eq!(outcome, AuditOutcome::Accepted);

        let workflow = workflow_queries::get_workflow(&pool, workflow_id).await.unwrap().unwrap();
        assert_eq!(workflow.status, AggregateStatus::Completed);
        assert_eq!(workflow.artifact.as_deref(), Some("feature shipped"));

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn finalize_cascades_completed_status_to_project() {
        let (pool, db_name) = create_test_db().await;
        let project = mcs_db::queries::projects::insert_project(&pool, "proj").await.unwrap();
        let workflow_id = seed_completed_workflow(&pool).await;
        sqlx::query("UPDATE workflows SET project_id = $1 WHERE id = $2")
            .bind(project.id)
            .bind(workflow_id)
            .execute(&pool)
            .await
            .unwrap();
        let gateway = MockLlmGateway::always(accept_verdict());
        let auditor = Auditor::new(&pool, &gateway, 3, 0.7, 3);

        auditor.audit(workflow_id).await.unwrap();

        let project = mcs_db::queries::projects::get_project(&pool, project.id).await.unwrap().unwrap();
        assert_eq!(project.status, AggregateStatus::Completed);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn sends_named_steps_to_rework_on_rejection() {
        let (pool, db_name) = create_test_db().await;
        let workflow_id = seed_completed_workflow(&pool).await;
        let gateway = MockLlmGateway::always(reject_verdict());
        let auditor = Auditor::new(&pool, &gateway, 3, 0.7, 3);

        let outcome = auditor.audit(workflow_id).await.unwrap();
        assert_eq!(
            outcome,
            AuditOutcome::SentToRework {
                step_ids: vec!["s1".to_string()]
            }
        );

        let workflow = workflow_queries::get_workflow(&pool, workflow_id).await.unwrap().unwrap();
        assert_eq!(workflow.status, AggregateStatus::InProgress);
        assert_eq!(workflow.rework_cycles, 1);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn cascades_rework_to_transitive_dependents() {
        let (pool, db_name) = create_test_db().await;
        let (workflow_id, _s1, _s2) = seed_completed_workflow_with_dependency(&pool).await;
        let gateway = MockLlmGateway::always(reject_verdict());
        let auditor = Auditor::new(&pool, &gateway, 3, 0.7, 3);

        let outcome = auditor.audit(workflow_id).await.unwrap();
        let AuditOutcome::SentToRework { step_ids } = outcome else {
            panic!("expected rework");
        };
        assert_eq!(step_ids.len(), 2);
        assert!(step_ids.contains(&"s1".to_string()));
        assert!(step_ids.contains(&"s2".to_string()), "s2 depends on s1 and should cascade");

        let tasks = task_queries::list_tasks_for_workflow(&pool, workflow_id).await.unwrap();
        for task in &tasks {
            assert_eq!(task.status, mcs_db::models::TaskStatus::Pending, "{} should be reset", task.step_id);
        }

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn accepts_unaudited_when_gateway_exhausts_retries() {
        let (pool, db_name) = create_test_db().await;
        let workflow_id = seed_completed_workflow(&pool).await;
        let gateway = MockLlmGateway::always("not json at all".to_string());
        let auditor = Auditor::new(&pool, &gateway, 1, 0.7, 3);

        let outcome = auditor.audit(workflow_id).await.unwrap();
        assert_eq!(outcome, AuditOutcome::Accepted);

        let workflow = workflow_queries::get_workflow(&pool, workflow_id).await.unwrap().unwrap();
        assert_eq!(workflow.status, AggregateStatus::Completed);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn unknown_rework_step_ids_are_discarded_and_finalize() {
        let (pool, db_name) = create_test_db().await;
        let workflow_id = seed_completed_workflow(&pool).await;
        let verdict = serde_json::json!({
            "is_successful": false,
            "confidence": 0.2,
            "feedback": "missing edge case handling",
            "rework_directives": [{"step_id": "ghost-step", "reason": "does not exist"}]
        })
        .to_string();
        let gateway = MockLlmGateway::always(verdict);
        let auditor = Auditor::new(&pool, &gateway, 3, 0.7, 3);

        let outcome = auditor.audit(workflow_id).await.unwrap();
        assert_eq!(outcome, AuditOutcome::Accepted);

        let workflow = workflow_queries::get_workflow(&pool, workflow_id).await.unwrap().unwrap();
        assert_eq!(workflow.status, AggregateStatus::Completed);
        assert_eq!(workflow.rework_cycles, 0, "a directive naming no real step should not spend a rework cycle");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn forces_acceptance_once_rework_cycles_exhausted() {
        let (pool, db_name) = create_test_db().await;
        let workflow_id = seed_completed_workflow(&pool).await;
        sqlx::query("UPDATE workflows SET rework_cycles = 3 WHERE id = $1")
            .bind(workflow_id)
            .execute(&pool)
            .await
            .unwrap();
        let gateway = MockLlmGateway::always(reject_verdict());
        let auditor = Auditor::new(&pool, &gateway, 3, 0.7, 3);

        let outcome = auditor.audit(workflow_id).await.unwrap();
        assert_eq!(outcome, AuditOutcome::Accepted);

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
