//! Orchestration logic for the multi-agent coordination server: planning,
//! scheduling, file locking, result handling, and auditing. Contains no
//! database access of its own beyond composing `mcs-db`'s query functions
//! into transactions -- see `mcs-db` for schema and raw queries.

pub mod auditor;
pub mod config;
pub mod error;
pub mod graph;
pub mod llm_gateway;
pub mod lock_manager;
pub mod planner;
pub mod result_handler;
pub mod scheduler;

pub use auditor::{AuditOutcome, Auditor};
pub use config::Config;
pub use error::McsError;
pub use llm_gateway::LlmGateway;
pub use lock_manager::{AcquireOutcome, LockManager};
pub use planner::{PlanOutcome, Planner};
pub use result_handler::{ReportOutcome, ResultHandler, WorkerReport};
pub use scheduler::{DispatchedTask, Scheduler};
