//! Networked backend driver over a pooled MySQL/MariaDB server.
//!
//! The pool is created lazily with `connect_lazy_with`, so constructing the
//! driver never touches the network. Connection acquisition is bounded by the
//! configured acquire timeout and is the only place callers wait on each other.

use crate::config::NetworkedConfig;
use crate::db::lifecycle::{PoolBuilder, PoolCell};
use crate::db::params::mysql_query;
use crate::db::statement::validate_readonly;
use crate::db::transaction::{TransactionHandle, TxConn};
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{
    BackendKind, ColumnInfo, LifecycleState, PoolStats, QueryParam, QueryResult, Row, TableInfo,
    TableType,
};
use sqlx::mysql::{MySqlConnectOptions, MySqlPoolOptions, MySqlQueryResult};
use sqlx::pool::PoolConnection;
use sqlx::{MySql, MySqlPool};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct NetworkedDriver {
    config: Arc<NetworkedConfig>,
    cell: Arc<PoolCell<MySql>>,
    /// Callers currently waiting for a connection
    acquiring: Arc<AtomicUsize>,
    server_version: Arc<OnceCell<String>>,
}

/// Counts a waiting caller for as long as it lives.
struct AcquireGuard<'a>(&'a AtomicUsize);

impl<'a> AcquireGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for AcquireGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl NetworkedDriver {
    pub fn new(config: NetworkedConfig) -> Self {
        let config = Arc::new(config);
        let builder_config = Arc::clone(&config);
        let builder: PoolBuilder<MySql> = Box::new(move || Ok(build_pool(&builder_config)));

        info!(
            url = %config.masked_url(),
            pool_limit = config.pool_options.max_connections_or_default(),
            "Networked backend configured"
        );

        Self {
            config,
            cell: Arc::new(PoolCell::new(BackendKind::Networked, builder)),
            acquiring: Arc::new(AtomicUsize::new(0)),
            server_version: Arc::new(OnceCell::new()),
        }
    }

    pub fn config(&self) -> &NetworkedConfig {
        &self.config
    }

    /// Run a read-only statement. Writes are rejected before touching the pool.
    pub async fn query(&self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        validate_readonly(sql, BackendKind::Networked)?;
        self.cell
            .run(|lease| async move {
                let mut conn = self.acquire_connection(&lease.pool).await?;
                let rows = mysql_query(sql, params).fetch_all(&mut *conn).await?;
                let rows: Vec<Row> = rows.iter().map(RowToJson::to_json_map).collect();
                Ok(QueryResult::from_rows(rows))
            })
            .await
    }

    pub async fn execute(&self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        self.cell
            .run(|lease| async move {
                let mut conn = self.acquire_connection(&lease.pool).await?;
                let result = mysql_query(sql, params).execute(&mut *conn).await?;
                Ok(mysql_write_result(&result))
            })
            .await
    }

    pub async fn query_one(&self, sql: &str, params: &[QueryParam]) -> DbResult<Option<Row>> {
        Ok(self.query(sql, params).await?.into_first())
    }

    /// Acquire one connection (bounded by the acquire timeout) and begin on it.
    pub async fn begin(&self) -> DbResult<TransactionHandle> {
        let cell = Arc::clone(&self.cell);
        self.cell
            .run(|lease| async move {
                let tx = {
                    let _waiting = AcquireGuard::new(&self.acquiring);
                    lease
                        .pool
                        .begin()
                        .await
                        .map_err(|e| self.map_acquire_error(e))?
                };
                Ok(TransactionHandle::new(
                    TxConn::MySql { tx, cell },
                    lease.generation,
                ))
            })
            .await
    }

    /// `SELECT 1` bounded by the acquire timeout. Never errors.
    pub async fn ping(&self) -> bool {
        let timeout = self.acquire_timeout();
        match tokio::time::timeout(timeout, self.query("SELECT 1", &[])).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(error = %e, "Networked ping failed");
                false
            }
            Err(_) => {
                debug!(timeout_ms = timeout.as_millis() as u64, "Networked ping timed out");
                false
            }
        }
    }

    pub async fn table_exists(&self, name: &str) -> DbResult<bool> {
        self.cell
            .run(|lease| async move {
                let mut conn = self.acquire_connection(&lease.pool).await?;
                let count: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM information_schema.TABLES \
                     WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ?",
                )
                .bind(name)
                .fetch_one(&mut *conn)
                .await?;
                Ok(count > 0)
            })
            .await
    }

    pub async fn list_tables(&self) -> DbResult<Vec<TableInfo>> {
        self.cell
            .run(|lease| async move {
                let mut conn = self.acquire_connection(&lease.pool).await?;
                let rows: Vec<(String, String)> = sqlx::query_as(
                    "SELECT CAST(TABLE_NAME AS CHAR), CAST(TABLE_TYPE AS CHAR) \
                     FROM information_schema.TABLES \
                     WHERE TABLE_SCHEMA = DATABASE() \
                     ORDER BY TABLE_NAME",
                )
                .fetch_all(&mut *conn)
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
                let mut conn = self.acquire_connection(&lease.pool).await?;
                let rows: Vec<(String, String, String, Option<String>, String)> =
                    sqlx::query_as(
                        "SELECT CAST(COLUMN_NAME AS CHAR), CAST(COLUMN_TYPE AS CHAR), \
                         CAST(IS_NULLABLE AS CHAR), CAST(COLUMN_DEFAULT AS CHAR), \
                         CAST(COLUMN_KEY AS CHAR) \
                         FROM information_schema.COLUMNS \
                         WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? \
                         ORDER BY ORDINAL_POSITION",
                    )
                    .bind(name)
                    .fetch_all(&mut *conn)
                    .await?;
                Ok(rows
                    .into_iter()
                    .map(|(name, data_type, nullable, default_value, key)| ColumnInfo {
                        name,
                        data_type,
                        nullable: nullable.eq_ignore_ascii_case("YES"),
                        default_value,
                        primary_key: key == "PRI",
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

    /// Pool counters; zeros when no pool is live.
    pub async fn stats(&self) -> PoolStats {
        let state = self.cell.state().await;
        let limit = self.config.pool_options.max_connections_or_default();

        let (total, idle) = match self.cell.current().await {
            Some(lease) => (lease.pool.size(), lease.pool.num_idle() as u32),
            None => (0, 0),
        };
        let server_version = if state == LifecycleState::Ready {
            self.server_version().await
        } else {
            self.server_version.get().cloned()
        };

        PoolStats {
            state,
            acquiring: self.acquiring.load(Ordering::SeqCst),
            total,
            idle,
            busy: total.saturating_sub(idle),
            limit,
            rebuilds: self.cell.rebuilds(),
            server_version,
        }
    }

    /// Server version string, fetched once.
    pub async fn server_version(&self) -> Option<String> {
        let fetch = async {
            let row = tokio::time::timeout(
                self.acquire_timeout(),
                self.query_one("SELECT VERSION() AS version", &[]),
            )
            .await
            .map_err(|_| DbError::timeout("server version lookup", self.acquire_timeout_ms()))??;
            row.and_then(|r| r.get("version").and_then(|v| v.as_str()).map(String::from))
                .ok_or_else(|| DbError::internal("VERSION() returned no value"))
        };
        match self.server_version.get_or_try_init(|| fetch).await {
            Ok(version) => Some(version.clone()),
            Err(e) => {
                warn!(error = %e, "Failed to get server version");
                None
            }
        }
    }

    pub async fn state(&self) -> LifecycleState {
        self.cell.state().await
    }

    /// The lifecycle cell holding the current pool.
    pub fn lifecycle(&self) -> &PoolCell<MySql> {
        &self.cell
    }

    pub async fn close(&self) {
        self.cell.close().await;
    }

    async fn acquire_connection(&self, pool: &MySqlPool) -> DbResult<PoolConnection<MySql>> {
        let _waiting = AcquireGuard::new(&self.acquiring);
        pool.acquire().await.map_err(|e| self.map_acquire_error(e))
    }

    fn map_acquire_error(&self, error: sqlx::Error) -> DbError {
        match error {
            sqlx::Error::PoolTimedOut => {
                DbError::timeout("connection pool acquire", self.acquire_timeout_ms())
            }
            other => DbError::from(other),
        }
    }

    fn acquire_timeout(&self) -> Duration {
        self.config.pool_options.acquire_timeout()
    }

    fn acquire_timeout_ms(&self) -> u64 {
        self.acquire_timeout().as_millis() as u64
    }
}

/// Connect options for a networked configuration.
pub fn connect_options(config: &NetworkedConfig) -> MySqlConnectOptions {
    let mut options = MySqlConnectOptions::new()
        .host(&config.host)
        .port(config.port)
        .username(&config.user)
        .charset("utf8mb4");
    if let Some(password) = &config.password {
        options = options.password(password);
    }
    if let Some(database) = &config.database {
        options = options.database(database);
    }
    options
}

fn build_pool(config: &NetworkedConfig) -> MySqlPool {
    let pool_opts = &config.pool_options;
    MySqlPoolOptions::new()
        .max_connections(pool_opts.max_connections_or_default())
        .acquire_timeout(pool_opts.acquire_timeout())
        .idle_timeout(Some(pool_opts.idle_timeout()))
        .test_before_acquire(true)
        .connect_lazy_with(connect_options(config))
}

/// Normalize a MySQL write result. The server reports 0 when the statement
/// generated no AUTO_INCREMENT value.
pub(crate) fn mysql_write_result(result: &MySqlQueryResult) -> QueryResult {
    let last_insert_id = result.last_insert_id();
    QueryResult::write_result(
        result.rows_affected(),
        (last_insert_id != 0).then_some(last_insert_id as i64),
    )
}
