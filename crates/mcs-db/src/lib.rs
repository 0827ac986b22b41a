//! Schema, migrations, and raw queries for the coordination server's
//! Postgres-backed store. Contains no orchestration logic -- see `mcs-core`
//! for that.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
