//! unified-db Library
//!
//! One database client over two interchangeable backends: a pooled networked
//! MySQL server or an embedded SQLite file. The client owns the pool lifecycle
//! (lazy creation, rebuild after transport errors, terminal close), normalizes
//! both backends' results into one shape, and reports health and stats.

pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod server;

pub use client::DatabaseClient;
pub use config::Config;
pub use db::TransactionHandle;
pub use error::{DbError, DbResult};
