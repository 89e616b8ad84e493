//! Migration bookkeeping.
//!
//! The `migrations` table records one-time schema setup. Its logical layout is
//! the same on both backends; only the auto-increment syntax differs.

use crate::db::backend::Backend;
use crate::error::{DbError, DbResult};
use crate::models::{AppliedMigration, BackendKind, QueryParam, Row};
use chrono::NaiveDateTime;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

pub const MIGRATIONS_TABLE: &str = "migrations";

const MYSQL_DDL: &str = "CREATE TABLE migrations (\
    id INT AUTO_INCREMENT PRIMARY KEY, \
    name VARCHAR(255) NOT NULL, \
    executed_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP)";

const SQLITE_DDL: &str = "CREATE TABLE migrations (\
    id INTEGER PRIMARY KEY AUTOINCREMENT, \
    name TEXT NOT NULL, \
    executed_at DATETIME DEFAULT CURRENT_TIMESTAMP)";

/// Format both backends use when `executed_at` is read back as text.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// DDL creating the bookkeeping table on `kind`.
pub fn bookkeeping_ddl(kind: BackendKind) -> &'static str {
    match kind {
        BackendKind::Networked => MYSQL_DDL,
        BackendKind::Embedded => SQLITE_DDL,
    }
}

/// What `Migrator::run` found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    Created,
    AlreadyPresent,
}

/// Bookkeeping operations over one backend.
#[derive(Debug)]
pub struct Migrator<'a> {
    backend: &'a Backend,
}

impl<'a> Migrator<'a> {
    pub fn new(backend: &'a Backend) -> Self {
        Self { backend }
    }

    /// Ensure the bookkeeping table exists.
    ///
    /// Existence is checked through introspection first, so a second call
    /// issues no DDL at all.
    pub async fn run(&self) -> DbResult<MigrationOutcome> {
        let kind = self.backend.kind();
        if self.backend.table_exists(MIGRATIONS_TABLE).await? {
            info!(backend = %kind, "Migrations table already present");
            return Ok(MigrationOutcome::AlreadyPresent);
        }

        match self.backend.execute(bookkeeping_ddl(kind), &[]).await {
            Ok(_) => {
                info!(backend = %kind, "Created migrations table");
                Ok(MigrationOutcome::Created)
            }
            // Another process created it between the check and the DDL
            Err(e) if self.backend.table_exists(MIGRATIONS_TABLE).await.unwrap_or(false) => {
                warn!(backend = %kind, error = %e, "Migrations table created concurrently");
                Ok(MigrationOutcome::AlreadyPresent)
            }
            Err(e) => Err(e),
        }
    }

    /// Record a migration as applied and return its id.
    pub async fn record(&self, name: &str) -> DbResult<i64> {
        if name.trim().is_empty() {
            return Err(DbError::invalid_input("Migration name cannot be empty"));
        }
        let result = self
            .backend
            .execute(
                "INSERT INTO migrations (name) VALUES (?)",
                &[QueryParam::from(name)],
            )
            .await?;
        let id = result
            .summary
            .inserted_id
            .ok_or_else(|| DbError::internal("Insert into migrations returned no id"))?;
        info!(migration = %name, id, "Recorded migration");
        Ok(id)
    }

    /// All recorded migrations, oldest first.
    pub async fn applied(&self) -> DbResult<Vec<AppliedMigration>> {
        let sql = match self.backend.kind() {
            BackendKind::Networked => {
                "SELECT id, name, CAST(executed_at AS CHAR) AS executed_at \
                 FROM migrations ORDER BY id"
            }
            BackendKind::Embedded => "SELECT id, name, executed_at FROM migrations ORDER BY id",
        };
        let result = self.backend.query(sql, &[]).await?;
        result.rows.iter().map(parse_applied).collect()
    }

    pub async fn has_run(&self, name: &str) -> DbResult<bool> {
        let row = self
            .backend
            .query_one(
                "SELECT COUNT(*) AS n FROM migrations WHERE name = ?",
                &[QueryParam::from(name)],
            )
            .await?;
        Ok(row
            .and_then(|r| r.get("n").and_then(JsonValue::as_i64))
            .is_some_and(|n| n > 0))
    }
}

fn parse_applied(row: &Row) -> DbResult<AppliedMigration> {
    let id = row
        .get("id")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| DbError::internal("migrations row without an integer id"))?;
    let name = row
        .get("name")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| DbError::internal("migrations row without a name"))?
        .to_string();
    let executed_at = row
        .get("executed_at")
        .and_then(JsonValue::as_str)
        .and_then(parse_timestamp);
    Ok(AppliedMigration {
        id,
        name,
        executed_at,
    })
}

fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    // MySQL may append fractional seconds
    let trimmed = value.split('.').next().unwrap_or(value);
    NaiveDateTime::parse_from_str(trimmed, TIMESTAMP_FORMAT).ok()
}
