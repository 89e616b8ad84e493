//! Data models for the unified database client.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod query;
pub mod schema;

// Re-export commonly used types
pub use connection::{
    BackendKind, BackendStats, EmbeddedStats, HealthStatus, LifecycleState, PoolStats,
};
pub use query::{QueryParam, QueryResult, QuerySummary, Row};
pub use schema::{AppliedMigration, ColumnInfo, TableInfo, TableType};
