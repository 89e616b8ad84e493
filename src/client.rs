//! The unified database client.
//!
//! [`DatabaseClient`] wraps exactly one active backend, chosen once from
//! configuration, and is the entry point for every call site. It is an
//! explicitly constructed value: startup code owns it and shares it through an
//! `Arc`.

use crate::config::{BackendConfig, ClientOptions, Config, EmbeddedConfig};
use crate::db::backend::Backend;
use crate::db::migrations::{MigrationOutcome, Migrator};
use crate::db::transaction::TransactionHandle;
use crate::error::DbResult;
use crate::models::{
    BackendKind, BackendStats, ColumnInfo, HealthStatus, QueryParam, QueryResult, Row, TableInfo,
};
use futures_util::future::BoxFuture;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug)]
pub struct DatabaseClient {
    active: Backend,
    /// Every driver this client constructed; drained by `close_all`
    registry: Mutex<Vec<Backend>>,
    options: ClientOptions,
}

impl DatabaseClient {
    /// Resolve the backend from configuration and build the client.
    ///
    /// Fails only when the configuration is incomplete and the embedded
    /// fallback is disabled.
    pub fn from_config(config: &Config) -> DbResult<Self> {
        let backend = config.resolve_backend()?;
        Ok(Self::new(&backend, config.client_options()))
    }

    pub fn new(config: &BackendConfig, options: ClientOptions) -> Self {
        let active = Backend::from_config(config);
        info!(
            backend = %active.kind(),
            engine = active.kind().engine(),
            read_retries = options.read_retries,
            "Database client created"
        );
        Self {
            registry: Mutex::new(vec![active.clone()]),
            active,
            options,
        }
    }

    /// Client over an embedded store with default options.
    pub fn embedded(config: EmbeddedConfig) -> Self {
        Self::new(&BackendConfig::Embedded(config), ClientOptions::default())
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.active.kind()
    }

    pub fn backend(&self) -> &Backend {
        &self.active
    }

    /// Run a read-only statement that returns rows.
    ///
    /// Writes are refused with a `Permission` error before they reach the
    /// backend, which is what makes the transport retry safe. Retried on a
    /// fresh pool up to `read_retries` times.
    pub async fn query(&self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        let mut attempt = 0;
        loop {
            let started = Instant::now();
            match self.active.query(sql, params).await {
                Ok(result) => {
                    debug!(
                        backend = %self.active.kind(),
                        rows = result.row_count(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Query completed"
                    );
                    return Ok(result);
                }
                Err(e) if e.is_transport() && attempt < self.options.read_retries => {
                    attempt += 1;
                    warn!(
                        backend = %self.active.kind(),
                        attempt,
                        error = %e,
                        "Transport error on read, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// First row of a query; `None` when the query returned no rows.
    pub async fn query_one(&self, sql: &str, params: &[QueryParam]) -> DbResult<Option<Row>> {
        Ok(self.query(sql, params).await?.into_first())
    }

    /// Run a mutating statement. Never retried.
    pub async fn execute(&self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        let started = Instant::now();
        let result = self.active.execute(sql, params).await?;
        debug!(
            backend = %self.active.kind(),
            affected_rows = result.summary.affected_rows,
            inserted_id = ?result.summary.inserted_id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Statement executed"
        );
        Ok(result)
    }

    /// Begin an explicit transaction. The caller must `commit` or `rollback` it.
    pub async fn begin_transaction(&self) -> DbResult<TransactionHandle> {
        self.active.begin().await
    }

    /// Run `f` inside a transaction.
    ///
    /// Commits when `f` succeeds. When it fails the transaction is rolled back
    /// and `f`'s error is returned; a failed rollback is logged, never returned
    /// in its place.
    ///
    /// ```ignore
    /// let id = client
    ///     .transaction(|tx| Box::pin(async move {
    ///         let r = tx.execute("INSERT INTO t (v) VALUES (?)", &[1.into()]).await?;
    ///         Ok(r.summary.inserted_id)
    ///     }))
    ///     .await?;
    /// ```
    pub async fn transaction<T, F>(&self, f: F) -> DbResult<T>
    where
        F: for<'c> FnOnce(&'c mut TransactionHandle) -> BoxFuture<'c, DbResult<T>>,
    {
        let mut tx = self.begin_transaction().await?;
        let tx_id = tx.id().to_string();

        match f(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    error!(
                        transaction_id = %tx_id,
                        error = %e,
                        rollback_error = %rollback_err,
                        "Rollback failed after transaction error"
                    );
                }
                Err(e)
            }
        }
    }

    /// Ping the active backend. Never errors.
    pub async fn health_check(&self) -> HealthStatus {
        let kind = self.active.kind();
        let healthy = self.active.ping().await;
        if !healthy {
            warn!(backend = %kind, "Health check failed");
        }
        HealthStatus::new(kind, healthy)
    }

    pub async fn stats(&self) -> BackendStats {
        self.active.stats().await
    }

    /// Ensure the `migrations` bookkeeping table exists. Idempotent.
    pub async fn run_migrations(&self) -> DbResult<MigrationOutcome> {
        self.migrator().run().await
    }

    pub fn migrator(&self) -> Migrator<'_> {
        Migrator::new(&self.active)
    }

    pub async fn table_exists(&self, name: &str) -> DbResult<bool> {
        self.active.table_exists(name).await
    }

    pub async fn list_tables(&self) -> DbResult<Vec<TableInfo>> {
        self.active.list_tables().await
    }

    pub async fn describe_table(&self, name: &str) -> DbResult<Vec<ColumnInfo>> {
        self.active.describe_table(name).await
    }

    /// Close every driver this client constructed and wait for their pools to drain.
    ///
    /// Idempotent. Later operations fail with a `Closed` error.
    pub async fn close_all(&self) {
        let drivers: Vec<Backend> = {
            let mut registry = self.registry.lock().await;
            registry.drain(..).collect()
        };
        for driver in &drivers {
            info!(backend = %driver.kind(), "Closing database driver");
            driver.close().await;
        }
        if !drivers.is_empty() {
            info!(count = drivers.len(), "All database drivers closed");
        }
    }
}
