//! Embedded backend driver over a local SQLite file.
//!
//! The store is a single-connection pool: the file is created if absent and
//! opened on first use, foreign keys and WAL journaling are set on the
//! connection before any statement runs, and writers wait on a locked database
//! for at most the configured busy timeout. Because there is exactly one
//! connection, transactions and writes serialize.

use crate::config::EmbeddedConfig;
use crate::db::lifecycle::{PoolBuilder, PoolCell};
use crate::db::params::sqlite_query;
use crate::db::statement::{inserts_rows, validate_readonly};
use crate::db::transaction::{TransactionHandle, TxConn};
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{
    BackendKind, ColumnInfo, EmbeddedStats, LifecycleState, QueryParam, QueryResult, Row,
    TableInfo, TableType,
};
use humansize::{DECIMAL, format_size};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteQueryResult,
};
use sqlx::{Sqlite, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// How long a caller waits for the single connection.
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct EmbeddedDriver {
    config: EmbeddedConfig,
    cell: Arc<PoolCell<Sqlite>>,
}

impl EmbeddedDriver {
    pub fn new(config: EmbeddedConfig) -> Self {
        let builder_config = config.clone();
        let builder: PoolBuilder<Sqlite> = Box::new(move || build_pool(&builder_config));
        info!(path = %config.path, "Embedded backend configured");
        Self {
            config,
            cell: Arc::new(PoolCell::new(BackendKind::Embedded, builder)),
        }
    }

    pub fn config(&self) -> &EmbeddedConfig {
        &self.config
    }

    /// Run a read-only statement. Writes are rejected before touching the store.
    pub async fn query(&self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        validate_readonly(sql, BackendKind::Embedded)?;
        self.cell
            .run(|lease| async move {
                let rows = sqlite_query(sql, params).fetch_all(&lease.pool).await?;
                let rows: Vec<Row> = rows.iter().map(RowToJson::to_json_map).collect();
                Ok(QueryResult::from_rows(rows))
            })
            .await
    }

    pub async fn execute(&self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        self.cell
            .run(|lease| async move {
                let result = sqlite_query(sql, params).execute(&lease.pool).await?;
                Ok(sqlite_write_result(sql, &result))
            })
            .await
    }

    pub async fn query_one(&self, sql: &str, params: &[QueryParam]) -> DbResult<Option<Row>> {
        Ok(self.query(sql, params).await?.into_first())
    }

    /// Begin a transaction on the single connection.
    ///
    /// Other callers wait for the connection until the transaction finishes.
    pub async fn begin(&self) -> DbResult<TransactionHandle> {
        let cell = Arc::clone(&self.cell);
        self.cell
            .run(|lease| async move {
                let tx = lease.pool.begin().await.map_err(|e| match e {
                    sqlx::Error::PoolTimedOut => DbError::timeout(
                        "embedded transaction begin",
                        ACQUIRE_TIMEOUT.as_millis() as u64,
                    ),
                    other => DbError::from(other),
                })?;
                Ok(TransactionHandle::new(
                    TxConn::Sqlite { tx, cell },
                    lease.generation,
                ))
            })
            .await
    }

    /// `SELECT 1` on the store. Never errors.
    pub async fn ping(&self) -> bool {
        match self.query("SELECT 1", &[]).await {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "Embedded ping failed");
                false
            }
        }
    }

    pub async fn table_exists(&self, name: &str) -> DbResult<bool> {
        self.cell
            .run(|lease| async move {
                let count: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type IN ('table', 'view') AND name = ?",
                )
                .bind(name)
                .fetch_one(&lease.pool)
                .await?;
                Ok(count > 0)
            })
            .await
    }

    pub async fn list_tables(&self) -> DbResult<Vec<TableInfo>> {
        self.cell
            .run(|lease| async move {
                let rows: Vec<(String, String)> = sqlx::query_as(
                    "SELECT name, type FROM sqlite_master \
                     WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
                     ORDER BY name",
                )
                .fetch_all(&lease.pool)
                .await?;
                Ok(rows
                    .into_iter()
                    .map(|(name, kind)| TableInfo::new(name, TableType::from_backend(&kind)))
                    .collect())
            })
            .await
    }

    pub async fn describe_table(&self, name: &str) -> DbResult<Vec<ColumnInfo>> {
        let columns = self
            .cell
            .run(|lease| async move {
                let rows: Vec<(String, String, i64, Option<String>, i64)> = sqlx::query_as(
                    r#"SELECT name, type, "notnull", dflt_value, pk FROM pragma_table_info(?)"#,
                )
                .bind(name)
                .fetch_all(&lease.pool)
                .await?;
                Ok(rows
                    .into_iter()
                    .map(|(name, data_type, not_null, default_value, pk)| ColumnInfo {
                        name,
                        data_type,
                        nullable: not_null == 0 && pk == 0,
                        default_value,
                        primary_key: pk > 0,
                    })
                    .collect::<Vec<_>>())
            })
            .await?;

        if columns.is_empty() {
            return Err(DbError::invalid_input(format!(
                "Table '{}' does not exist",
                name
            )));
        }
        Ok(columns)
    }

    pub async fn stats(&self) -> EmbeddedStats {
        let state = self.cell.state().await;
        let open = match self.cell.current().await {
            Some(lease) => lease.pool.size() > 0,
            None => false,
        };

        let file_size_bytes = if self.config.is_memory() {
            None
        } else {
            tokio::fs::metadata(&self.config.path)
                .await
                .ok()
                .map(|m| m.len())
        };

        EmbeddedStats {
            state,
            path: self.config.path.clone(),
            open,
            file_size_bytes,
            file_size: file_size_bytes.map(|bytes| format_size(bytes, DECIMAL)),
            journal_mode: Some(self.journal_mode().to_string()),
            rebuilds: self.cell.rebuilds(),
        }
    }

    pub async fn state(&self) -> LifecycleState {
        self.cell.state().await
    }

    /// The lifecycle cell holding the current pool.
    pub fn lifecycle(&self) -> &PoolCell<Sqlite> {
        &self.cell
    }

    pub async fn close(&self) {
        self.cell.close().await;
    }

    fn journal_mode(&self) -> &'static str {
        if self.config.is_memory() {
            "memory"
        } else {
            "wal"
        }
    }
}

fn build_pool(config: &EmbeddedConfig) -> DbResult<SqlitePool> {
    let base = if config.is_memory() {
        SqliteConnectOptions::from_str("sqlite::memory:")?
    } else {
        ensure_parent_dir(&config.path)?;
        SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
    };
    let options = base.foreign_keys(true).busy_timeout(config.busy_timeout);

    let mut pool_options = SqlitePoolOptions::new()
        .max_connections(1)
        .acquire_timeout(ACQUIRE_TIMEOUT);
    if config.is_memory() {
        // The database lives exactly as long as its connection
        pool_options = pool_options
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None);
    }

    Ok(pool_options.connect_lazy_with(options))
}

fn ensure_parent_dir(path: &str) -> DbResult<()> {
    match Path::new(path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            std::fs::create_dir_all(parent).map_err(|e| {
                DbError::configuration(format!(
                    "Cannot create directory '{}' for the embedded database: {}",
                    parent.display(),
                    e
                ))
            })
        }
        _ => Ok(()),
    }
}

/// Normalize a SQLite write result.
///
/// SQLite keeps the last inserted rowid per connection across statements, so
/// it only counts as this statement's id when the statement inserted rows.
/// Rowid 0 is a legal id and is reported as such.
pub(crate) fn sqlite_write_result(sql: &str, result: &SqliteQueryResult) -> QueryResult {
    let affected = result.rows_affected();
    let inserted_id = (affected > 0 && inserts_rows(sql, BackendKind::Embedded))
        .then(|| result.last_insert_rowid());
    QueryResult::write_result(affected, inserted_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn memory_driver() -> EmbeddedDriver {
        EmbeddedDriver::new(EmbeddedConfig::in_memory())
    }

    #[tokio::test]
    async fn test_lazy_open() {
        let driver = memory_driver();
        assert_eq!(driver.state().await, LifecycleState::Uninitialized);
        assert!(driver.ping().await);
        assert_eq!(driver.state().await, LifecycleState::Ready);
    }

    #[tokio::test]
    async fn test_insert_reports_id_update_does_not() {
        let driver = memory_driver();
        driver
            .execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v INTEGER)", &[])
            .await
            .unwrap();

        let inserted = driver
            .execute("INSERT INTO t (v) VALUES (?)", &[QueryParam::Int(1)])
            .await
            .unwrap();
        assert_eq!(inserted.summary.affected_rows, 1);
        assert_eq!(inserted.summary.inserted_id, Some(1));

        let updated = driver
            .execute("UPDATE t SET v = 2 WHERE id = 1", &[])
            .await
            .unwrap();
        assert_eq!(updated.summary.affected_rows, 1);
        assert_eq!(updated.summary.inserted_id, None);
    }

    #[tokio::test]
    async fn test_foreign_keys_enforced() {
        let driver = memory_driver();
        driver
            .execute("CREATE TABLE parent (id INTEGER PRIMARY KEY)", &[])
            .await
            .unwrap();
        driver
            .execute(
                "CREATE TABLE child (id INTEGER PRIMARY KEY, parent_id INTEGER REFERENCES parent(id))",
                &[],
            )
            .await
            .unwrap();

        let err = driver
            .execute("INSERT INTO child (parent_id) VALUES (42)", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Constraint { .. }), "got {err:?}");
    }

    #[tokio::test]
    async fn test_syntax_error_keeps_pool() {
        let driver = memory_driver();
        assert!(driver.ping().await);
        let err = driver.query("SELEC 1", &[]).await.unwrap_err();
        assert!(matches!(err, DbError::Syntax { .. }));
        let err = driver.query("SELECT * FROM nowhere", &[]).await.unwrap_err();
        assert!(matches!(err, DbError::Syntax { code: Some(_), .. }), "got {err:?}");
        assert_eq!(driver.state().await, LifecycleState::Ready);
    }

    #[tokio::test]
    async fn test_query_refuses_writes() {
        let driver = memory_driver();
        driver
            .execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v INTEGER)", &[])
            .await
            .unwrap();

        let err = driver
            .query("INSERT INTO t (v) VALUES (1)", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Permission { .. }), "got {err:?}");

        let count = driver
            .query_one("SELECT COUNT(*) AS n FROM t", &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(count["n"], 0);
    }

    #[tokio::test]
    async fn test_insert_id_through_comments_and_ctes() {
        let driver = memory_driver();
        driver
            .execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v INTEGER)", &[])
            .await
            .unwrap();

        let commented = driver
            .execute("-- add row\nINSERT INTO t (v) VALUES (?)", &[QueryParam::Int(1)])
            .await
            .unwrap();
        assert_eq!(commented.summary.inserted_id, Some(1));

        let with_cte = driver
            .execute(
                "WITH x AS (SELECT 2 AS v) INSERT INTO t (v) SELECT v FROM x",
                &[],
            )
            .await
            .unwrap();
        assert_eq!(with_cte.summary.affected_rows, 1);
        assert_eq!(with_cte.summary.inserted_id, Some(2));
    }

    #[tokio::test]
    async fn test_rowid_zero_is_reported() {
        let driver = memory_driver();
        driver
            .execute("CREATE TABLE t (id INTEGER PRIMARY KEY, v INTEGER)", &[])
            .await
            .unwrap();
        let inserted = driver
            .execute("INSERT INTO t (id, v) VALUES (0, 1)", &[])
            .await
            .unwrap();
        assert_eq!(inserted.summary.inserted_id, Some(0));
    }

    #[tokio::test]
    async fn test_introspection() {
        let driver = memory_driver();
        assert!(!driver.table_exists("items").await.unwrap());
        driver
            .execute(
                "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL, qty INTEGER DEFAULT 0)",
                &[],
            )
            .await
            .unwrap();
        driver
            .execute("CREATE VIEW item_names AS SELECT name FROM items", &[])
            .await
            .unwrap();

        assert!(driver.table_exists("items").await.unwrap());
        let tables = driver.list_tables().await.unwrap();
        assert_eq!(
            tables,
            vec![
                TableInfo::new("item_names", TableType::View),
                TableInfo::new("items", TableType::Table),
            ]
        );

        let columns = driver.describe_table("items").await.unwrap();
        assert_eq!(columns.len(), 3);
        assert!(columns[0].primary_key);
        assert!(!columns[1].nullable);
        assert_eq!(columns[2].default_value.as_deref(), Some("0"));

        let err = driver.describe_table("missing").await.unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn test_file_store_created_with_wal() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("app.db");
        let driver = EmbeddedDriver::new(EmbeddedConfig::new(path.to_string_lossy()));

        driver
            .execute("CREATE TABLE t (id INTEGER PRIMARY KEY)", &[])
            .await
            .unwrap();
        assert!(path.exists());

        let mode = driver
            .query_one("PRAGMA journal_mode", &[])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mode["journal_mode"], "wal");

        let stats = driver.stats().await;
        assert!(stats.open);
        assert!(stats.file_size_bytes.unwrap() > 0);
        assert!(stats.file_size.is_some());
        driver.close().await;
    }

    #[tokio::test]
    async fn test_closed_driver_rejects_work() {
        let driver = memory_driver();
        driver.close().await;
        assert!(!driver.ping().await);
        let err = driver.query("SELECT 1", &[]).await.unwrap_err();
        assert!(matches!(err, DbError::Closed { .. }));
        assert_eq!(driver.stats().await.state, LifecycleState::Closed);
    }
}
