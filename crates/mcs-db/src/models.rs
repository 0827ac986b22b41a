use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of a [`Project`] or [`Workflow`]. Both entities share the same
/// four-state lifecycle (derived, never set directly by a caller except at
/// creation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AggregateStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for AggregateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for AggregateStatus {
    type Err = AggregateStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(AggregateStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`AggregateStatus`] string.
#[derive(Debug, Clone)]
pub struct AggregateStatusParseError(pub String);

impl fmt::Display for AggregateStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid status: {:?}", self.0)
    }
}

impl std::error::Error for AggregateStatusParseError {}

// ---------------------------------------------------------------------------

/// Status of a [`Task`], per spec.md §4.5's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    InProgress,
    Completed,
    Failed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = TaskStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(TaskStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskStatus`] string.
#[derive(Debug, Clone)]
pub struct TaskStatusParseError(pub String);

impl fmt::Display for TaskStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task status: {:?}", self.0)
    }
}

impl std::error::Error for TaskStatusParseError {}

// ---------------------------------------------------------------------------

/// File access mode declared by a task, per spec.md §4.3's compatibility
/// matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FileLockMode {
    Read,
    Write,
    Exclusive,
}

impl fmt::Display for FileLockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Exclusive => "exclusive",
        };
        f.write_str(s)
    }
}

impl FromStr for FileLockMode {
    type Err = FileLockModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            "exclusive" => Ok(Self::Exclusive),
            other => Err(FileLockModeParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`FileLockMode`] string.
#[derive(Debug, Clone)]
pub struct FileLockModeParseError(pub String);

impl fmt::Display for FileLockModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid file lock mode: {:?}", self.0)
    }
}

impl std::error::Error for FileLockModeParseError {}

impl FileLockMode {
    /// Whether a lease already held in `self` mode is compatible with a new
    /// request for `requested` mode, per the matrix in spec.md §4.3.
    ///
    /// Only `read` held against `read` requested is compatible; every other
    /// combination (including `read` held against `write`/`exclusive`
    /// requested) blocks.
    pub fn compatible_with(self, requested: FileLockMode) -> bool {
        matches!((self, requested), (Self::Read, Self::Read))
    }
}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// A project -- an optional grouping of workflows.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub status: AggregateStatus,
    pub created_at: DateTime<Utc>,
}

/// A workflow (task graph) -- one user request, decomposed into tasks.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub user_request: String,
    pub project_id: Option<Uuid>,
    pub status: AggregateStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
    pub artifact: Option<String>,
    pub rework_cycles: i32,
}

/// A task (task step) -- a unit of execution within a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub step_id: String,
    pub description: String,
    pub role: String,
    pub status: TaskStatus,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub retry_count: i32,
    pub rework_note: Option<String>,
}

/// An edge in the task dependency DAG: `task_id` depends on `depends_on`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskDependency {
    pub task_id: Uuid,
    pub depends_on: Uuid,
}

/// A declared file access for a task.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskFileDependency {
    pub task_id: Uuid,
    pub path: String,
    pub mode: FileLockMode,
}

/// The result of a task's execution, including the full RA iteration
/// history. At most one row per task (enforced by a unique constraint),
/// overwritten on every rework re-execution.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskResult {
    pub id: Uuid,
    pub task_id: Uuid,
    pub iterations: serde_json::Value,
    pub final_result: String,
    pub source_worker: String,
    pub execution_time_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// One audit pass over a completed workflow.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuditReport {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub is_successful: bool,
    pub feedback: String,
    pub rework_directives: serde_json::Value,
    pub confidence: f32,
    pub created_at: DateTime<Utc>,
}

/// An active file access lease.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FileLock {
    pub path: String,
    pub holder_worker_id: String,
    pub task_id: Uuid,
    pub mode: FileLockMode,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
