//! Task-graph shape shared by the Planner (parsing an LLM-produced graph)
//! and the Store (validating before persisting), per spec.md §3's DAG
//! invariant and §4.4 step 3's validation list.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use mcs_db::models::FileLockMode;

use crate::error::PlanValidationError;

/// One task node as produced by the Planner LLM schema (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlannedTask {
    pub step_id: String,
    pub description: String,
    pub role: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub file_dependencies: HashMap<String, String>,
}

/// A [`PlannedTask`] with its `file_dependencies` modes parsed into
/// [`FileLockMode`], produced once validation has confirmed every mode
/// string is one of `read`/`write`/`exclusive`.
#[derive(Debug, Clone)]
pub struct ValidatedTask {
    pub step_id: String,
    pub description: String,
    pub role: String,
    pub dependencies: Vec<String>,
    pub file_dependencies: Vec<(String, FileLockMode)>,
}

/// Validate a planned task graph: unique step_ids, dependency closure within
/// the graph, acyclicity, role membership, and file-mode membership. Returns
/// the graph with file-access modes parsed, in the same order as input.
pub fn validate_graph(
    tasks: &[PlannedTask],
    allowed_roles: &[String],
) -> Result<Vec<ValidatedTask>, PlanValidationError> {
    if tasks.is_empty() {
        return Err(PlanValidationError::Empty);
    }

    let mut seen = HashSet::new();
    for task in tasks {
        if !seen.insert(task.step_id.as_str()) {
            return Err(PlanValidationError::DuplicateStepId(task.step_id.clone()));
        }
    }

    for task in tasks {
        for dep in &task.dependencies {
            if !seen.contains(dep.as_str()) {
                return Err(PlanValidationError::UnknownDependency {
                    task: task.step_id.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        if !allowed_roles.iter().any(|r| r == &task.role) {
            return Err(PlanValidationError::UnknownRole {
                task: task.step_id.clone(),
                role: task.role.clone(),
            });
        }

        for (path, mode) in &task.file_dependencies {
            if parse_mode(mode).is_none() {
                return Err(PlanValidationError::UnknownFileMode {
                    task: task.step_id.clone(),
                    path: path.clone(),
                    mode: mode.clone(),
                });
            }
        }
    }

    check_for_cycles(tasks)?;

    Ok(tasks
        .iter()
        .map(|t| ValidatedTask {
            step_id: t.step_id.clone(),
            description: t.description.clone(),
            role: t.role.clone(),
            dependencies: t.dependencies.clone(),
            file_dependencies: t
                .file_dependencies
                .iter()
                .map(|(path, mode)| (path.clone(), parse_mode(mode).expect("validated above")))
                .collect(),
        })
        .collect())
}

fn parse_mode(s: &str) -> Option<FileLockMode> {
    match s {
        "read" => Some(FileLockMode::Read),
        "write" => Some(FileLockMode::Write),
        "exclusive" => Some(FileLockMode::Exclusive),
        _ => None,
    }
}

/// Kahn's algorithm topological sort; returns an error naming every task
/// still unsorted (i.e. part of a cycle) if the graph isn't a DAG.
fn check_for_cycles(tasks: &[PlannedTask]) -> Result<(), PlanValidationError> {
    let names: Vec<&str> = tasks.iter().map(|t| t.step_id.as_str()).collect();
    let index: HashMap<&str, usize> = names.iter().enumerate().map(|(i, n)| (*n, i)).collect();

    let n = names.len();
    let mut in_degree = vec![0usize; n];
    let mut adj: Vec<Vec<usize>> = vec![vec![]; n];

    for task in tasks {
        let task_idx = index[task.step_id.as_str()];
        for dep in &task.dependencies {
            let dep_idx = index[dep.as_str()];
            adj[dep_idx].push(task_idx);
            in_degree[task_idx] += 1;
        }
    }

    let mut queue: VecDeque<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, deg)| **deg == 0)
        .map(|(i, _)| i)
        .collect();

    let mut sorted = 0usize;
    while let Some(node) = queue.pop_front() {
        sorted += 1;
        for &next in &adj[node] {
            in_degree[next] -= 1;
            if in_degree[next] == 0 {
                queue.push_back(next);
            }
        }
    }

    if sorted != n {
        let cyclic: Vec<&str> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, deg)| **deg > 0)
            .map(|(i, _)| names[i])
            .collect();
        return Err(PlanValidationError::CycleDetected(cyclic.join(", ")));
    }

    Ok(())
}
