//! C4: Planner -- turns a user request into a persisted task graph, per
//! spec §4.4.
//!
//! Steps 1-3 (prompt the LLM, parse its JSON, validate the graph) happen
//! outside any database transaction; steps 4-5 (insert the workflow/tasks/
//! edges, promote the initial `ready` set) run inside a single transaction
//! so a caller never observes a partially-persisted graph.

use std::collections::HashMap;

use serde_json::Value;
use uuid::Uuid;

use mcs_db::models::Workflow;
use mcs_db::queries::{tasks as task_queries, workflows as workflow_queries};

use crate::error::{McsError, PlanValidationError};
use crate::graph::{validate_graph, PlannedTask, ValidatedTask};
use crate::llm_gateway::LlmGateway;

const SCHEMA_HINT: &str = r#"{
  "tasks": [
    {
      "step_id": "string, unique within the plan",
      "description": "string, what this task must accomplish",
      "role": "string, one of the allowed worker roles",
      "dependencies": ["step_id", "..."],
      "file_dependencies": { "path/to/file": "read|write|exclusive" }
    }
  ]
}"#;

/// Validates the top-level shape (`{"tasks": [...]}` with each task
/// carrying the required string fields) before [`validate_graph`] checks
/// graph-level invariants. Kept separate so malformed JSON shape and
/// invalid graph structure produce distinct, attributable errors.
fn validate_plan_shape(value: &Value) -> Result<(), String> {
    let tasks = value
        .get("tasks")
        .and_then(Value::as_array)
        .ok_or("missing top-level `tasks` array")?;

    if tasks.is_empty() {
        return Err("`tasks` array must not be empty".to_string());
    }

    for (i, task) in tasks.iter().enumerate() {
        for field in ["step_id", "description", "role"] {
            if task.get(field).and_then(Value::as_str).is_none() {
                return Err(format!("tasks[{i}] missing string field {field:?}"));
            }
        }
        if let Some(deps) = task.get("dependencies") {
            if !deps.is_array() {
                return Err(format!("tasks[{i}].dependencies must be an array"));
            }
        }
        if let Some(files) = task.get("file_dependencies") {
            if !files.is_object() {
                return Err(format!("tasks[{i}].file_dependencies must be an object"));
            }
        }
    }

    Ok(())
}

/// Produces and persists task graphs for new workflows.
pub struct Planner<'a> {
    pool: &'a sqlx::PgPool,
    gateway: &'a dyn LlmGateway,
    allowed_roles: Vec<String>,
    max_llm_attempts: u32,
}

/// Outcome of a successful plan: the persisted workflow plus the IDs of
/// tasks immediately promoted to `ready` (those with no dependencies).
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub workflow: Workflow,
    pub ready_task_ids: Vec<Uuid>,
}

impl<'a> Planner<'a> {
    pub fn new(
        pool: &'a sqlx::PgPool,
        gateway: &'a dyn LlmGateway,
        allowed_roles: Vec<String>,
        max_llm_attempts: u32,
    ) -> Self {
        Self {
            pool,
            gateway,
            allowed_roles,
            max_llm_attempts,
        }
    }

    /// Decompose `user_request` into a task graph and persist it under a
    /// new workflow (optionally scoped to `project_id`).
    ///
    /// Never fails on a planning error: if the Gateway exhausts its
    /// retries, or the returned graph fails validation, this falls back to
    /// a single `analyst` task carrying the raw request (spec §4.4 step 4,
    /// §7's `PlanFailure` policy) so submission always makes forward
    /// progress. Only a Store failure propagates as an error.
    pub async fn plan(
        &self,
        name: &str,
        user_request: &str,
        project_id: Option<Uuid>,
        metadata: Value,
    ) -> Result<PlanOutcome, McsError> {
        let validated = match self.generate_graph(user_request).await {
            Ok(validated) => validated,
            Err(reason) => {
                tracing::warn!(reason = %reason, "planner falling back to single-task plan");
                vec![self.fallback_task(user_request)]
            }
        };

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| McsError::StoreUnavailable(e.into()))?;

        let workflow = workflow_queries::insert_workflow(&mut tx, name, user_request, project_id, metadata)
            .await
            .map_err(McsError::StoreUnavailable)?;

        let mut ids_by_step: HashMap<String, Uuid> = HashMap::new();
        for task in &validated {
            let inserted = task_queries::insert_task(
                &mut tx,
                workflow.id,
                &task.step_id,
                &task.description,
                &task.role,
            )
            .await
            .map_err(McsError::StoreUnavailable)?;
            ids_by_step.insert(task.step_id.clone(), inserted.id);
        }

        self.insert_edges(&mut tx, &validated, &ids_by_step).await?;

        let ready_task_ids = task_queries::promote_ready_tasks_tx(&mut tx, workflow.id)
            .await
            .map_err(McsError::StoreUnavailable)?;

        tx.commit().await.map_err(|e| McsError::StoreUnavailable(e.into()))?;

        Ok(PlanOutcome {
            workflow,
            ready_task_ids,
        })
    }

    /// Prompt the Gateway for a task graph, parse it, and validate it.
    /// Returns a description of the failure (not an [`McsError`]) on any
    /// step's failure, since every failure here is absorbed by the
    /// fallback plan rather than propagated.
    async fn generate_graph(&self, user_request: &str) -> Result<Vec<ValidatedTask>, String> {
        let prompt = format!(
            "Decompose the following user request into a directed acyclic graph of tasks. \
             Each task must be assignable to exactly one of these roles: {}.\n\nRequest:\n{user_request}",
            self.allowed_roles.join(", "),
        );

        let value = self
            .gateway
            .complete(&prompt, SCHEMA_HINT, validate_plan_shape, self.max_llm_attempts)
            .await
            .map_err(|e| e.to_string())?;

        let planned: Vec<PlannedTask> = serde_json::from_value(
            value
                .get("tasks")
                .cloned()
                .expect("validate_plan_shape guarantees `tasks` is present"),
        )
        .map_err(|e| e.to_string())?;

        validate_graph(&planned, &self.allowed_roles)
            .map_err(|e: PlanValidationError| e.to_string())
    }

    /// A single `analyst` task carrying the raw request verbatim, used
    /// when the Gateway can't produce a valid graph (spec §4.4 step 4).
    fn fallback_task(&self, user_request: &str) -> ValidatedTask {
        let role = self
            .allowed_roles
            .iter()
            .find(|r| r.as_str() == "analyst")
            .or_else(|| self.allowed_roles.first())
            .expect("at least one role must be configured")
            .clone();

        ValidatedTask {
            step_id: "fallback".to_string(),
            description: user_request.to_string(),
            role,
            dependencies: vec![],
            file_dependencies: vec![],
        }
    }

    async fn insert_edges(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        validated: &[ValidatedTask],
        ids_by_step: &HashMap<String, Uuid>,
    ) -> Result<(), McsError> {
        for task in validated {
            let task_id = ids_by_step[&task.step_id];
            for dep_step_id in &task.dependencies {
                let dep_id = ids_by_step[dep_step_id];
                task_queries::insert_task_dependency(tx, task_id, dep_id)
                    .await
                    .map_err(McsError::StoreUnavailable)?;
            }
            for (path, mode) in &task.file_dependencies {
                task_queries::insert_task_file_dependency(tx, task_id, path, *mode)
                    .await
                    .map_err(McsError::StoreUnavailable)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_gateway::MockLlmGateway;
    use mcs_test_utils::{create_test_db, drop_test_db};

    fn roles() -> Vec<String> {
        vec!["analyst".to_string(), "developer".to_string(), "tester".to_string()]
    }

    fn diamond_plan_json() -> String {
        serde_json::json!({
            "tasks": [
                {"step_id": "a", "description": "survey the codebase", "role": "analyst", "dependencies": [], "file_dependencies": {}},
                {"step_id": "b", "description": "implement feature", "role": "developer", "dependencies": ["a"], "file_dependencies": {"src/lib.rs": "write"}},
                {"step_id": "c", "description": "implement docs", "role": "developer", "dependencies": ["a"], "file_dependencies": {"README.md": "write"}},
                {"step_id": "d", "description": "verify", "role": "tester", "dependencies": ["b", "c"], "file_dependencies": {}}
            ]
        })
        .to_string()
    }

    #[tokio::test]
    async fn plans_and_persists_a_diamond_graph() {
        let (pool, db_name) = create_test_db().await;
        let gateway = MockLlmGateway::always(diamond_plan_json());
        let planner = Planner::new(&pool, &gateway, roles(), 3);

        let outcome = planner
            .plan("demo workflow", "build a small feature", None, serde_json::json!({}))
            .await
            .expect("plan should succeed");

        assert_eq!(outcome.workflow.name, "demo workflow");
        // Only "a" has no dependencies, so only it promotes to ready.
        assert_eq!(outcome.ready_task_ids.len(), 1);

        let persisted = task_queries::list_tasks_for_workflow(&pool, outcome.workflow.id)
            .await
            .unwrap();
        assert_eq!(persisted.len(), 4);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn falls_back_to_single_task_on_cyclic_graph() {
        let (pool, db_name) = create_test_db().await;
        let cyclic = serde_json::json!({
            "tasks": [
                {"step_id": "a", "description": "x", "role": "developer", "dependencies": ["b"]},
                {"step_id": "b", "description": "y", "role": "developer", "dependencies": ["a"]}
            ]
        })
        .to_string();
        let gateway = MockLlmGateway::always(cyclic);
        let planner = Planner::new(&pool, &gateway, roles(), 1);

        let outcome = planner
            .plan("demo workflow", "build a cycle", None, serde_json::json!({}))
            .await
            .expect("planner must fall back rather than fail");

        let persisted = task_queries::list_tasks_for_workflow(&pool, outcome.workflow.id)
            .await
            .unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].step_id, "fallback");
        assert_eq!(persisted[0].role, "analyst");
        assert_eq!(outcome.ready_task_ids.len(), 1);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn reprompts_when_llm_output_is_malformed_json() {
        let (pool, db_name) = create_test_db().await;
        let gateway = MockLlmGateway::new(vec![
            Ok("this is not json".to_string()),
            Ok(diamond_plan_json()),
        ]);
        let planner = Planner::new(&pool, &gateway, roles(), 3);

        let outcome = planner
            .plan("demo workflow", "build a small feature", None, serde_json::json!({}))
            .await
            .expect("should succeed on second attempt");
        assert_eq!(outcome.workflow.user_request, "build a small feature");

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
