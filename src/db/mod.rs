//! Database abstraction layer.
//!
//! This module provides database access functionality:
//! - Pool lifecycle management
//! - The networked (MySQL) and embedded (SQLite) drivers
//! - Transaction handles
//! - Row decoding and parameter binding
//! - Statement classification (read-only enforcement)
//! - Migration bookkeeping

#[macro_use]
pub mod macros;
pub mod backend;
pub mod embedded;
pub mod lifecycle;
pub mod migrations;
pub mod networked;
pub mod params;
pub mod statement;
pub mod transaction;
pub mod types;

pub use backend::Backend;
pub use embedded::EmbeddedDriver;
pub use lifecycle::{PoolCell, PoolLease};
pub use migrations::{MigrationOutcome, Migrator};
pub use networked::NetworkedDriver;
pub use transaction::TransactionHandle;
