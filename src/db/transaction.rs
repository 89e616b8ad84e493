//! Transaction handles.
//!
//! A [`TransactionHandle`] owns one physical connection for its whole life.
//! Statements run in invocation order on that connection, nesting is done with
//! savepoints, and exactly one of `commit` / `rollback` consumes the handle.
//! A handle dropped without either is rolled back when the connection returns
//! to its pool.

use crate::db::embedded::sqlite_write_result;
use crate::db::networked::mysql_write_result;
use crate::db::lifecycle::PoolCell;
use crate::db::params::{mysql_query, sqlite_query};
use crate::db::statement::validate_readonly;
use crate::db::types::RowToJson;
use crate::error::{DbError, DbResult};
use crate::models::{BackendKind, QueryParam, QueryResult, Row};
use sqlx::{MySql, Sqlite, Transaction};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Backend-specific transaction plus the cell its connection came from.
pub(crate) enum TxConn {
    MySql {
        tx: Transaction<'static, MySql>,
        cell: Arc<PoolCell<MySql>>,
    },
    Sqlite {
        tx: Transaction<'static, Sqlite>,
        cell: Arc<PoolCell<Sqlite>>,
    },
}

impl TxConn {
    fn backend(&self) -> BackendKind {
        match self {
            TxConn::MySql { .. } => BackendKind::Networked,
            TxConn::Sqlite { .. } => BackendKind::Embedded,
        }
    }
}

pub struct TransactionHandle {
    id: String,
    backend: BackendKind,
    conn: Option<TxConn>,
    generation: u64,
    started_at: Instant,
    savepoints: Vec<String>,
}

impl std::fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionHandle")
            .field("id", &self.id)
            .field("backend", &self.backend)
            .field("active", &self.conn.is_some())
            .field("savepoints", &self.savepoints)
            .finish()
    }
}

impl TransactionHandle {
    pub(crate) fn new(conn: TxConn, generation: u64) -> Self {
        let handle = Self {
            id: generate_transaction_id(),
            backend: conn.backend(),
            conn: Some(conn),
            generation,
            started_at: Instant::now(),
            savepoints: Vec::new(),
        };
        debug!(
            transaction_id = %handle.id,
            backend = %handle.backend,
            "Transaction started"
        );
        handle
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Number of open savepoints.
    pub fn savepoint_depth(&self) -> usize {
        self.savepoints.len()
    }

    /// Run a read-only statement that returns rows.
    pub async fn query(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        validate_readonly(sql, self.backend)?;
        let result: DbResult<Vec<Row>> = match self.conn_mut()? {
            TxConn::MySql { tx, .. } => mysql_query(sql, params)
                .fetch_all(&mut **tx)
                .await
                .map(|rows| rows.iter().map(RowToJson::to_json_map).collect())
                .map_err(DbError::from),
            TxConn::Sqlite { tx, .. } => sqlite_query(sql, params)
                .fetch_all(&mut **tx)
                .await
                .map(|rows| rows.iter().map(RowToJson::to_json_map).collect())
                .map_err(DbError::from),
        };
        let rows = self.observe(result).await?;
        Ok(QueryResult::from_rows(rows))
    }

    /// Run a mutating statement.
    pub async fn execute(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        let result = match self.conn_mut()? {
            TxConn::MySql { tx, .. } => mysql_query(sql, params)
                .execute(&mut **tx)
                .await
                .map(|r| mysql_write_result(&r))
                .map_err(DbError::from),
            TxConn::Sqlite { tx, .. } => sqlite_query(sql, params)
                .execute(&mut **tx)
                .await
                .map(|r| sqlite_write_result(sql, &r))
                .map_err(DbError::from),
        };
        self.observe(result).await
    }

    /// First row of a query, or `None` when it returned nothing.
    pub async fn query_one(&mut self, sql: &str, params: &[QueryParam]) -> DbResult<Option<Row>> {
        Ok(self.query(sql, params).await?.into_first())
    }

    /// Open a nested savepoint and return its name.
    pub async fn savepoint(&mut self) -> DbResult<String> {
        let name = format!("sp_{}", self.savepoints.len() + 1);
        self.raw(&format!("SAVEPOINT {name}")).await?;
        self.savepoints.push(name.clone());
        debug!(transaction_id = %self.id, savepoint = %name, "Savepoint created");
        Ok(name)
    }

    /// Keep the work done since the innermost savepoint.
    pub async fn release_savepoint(&mut self) -> DbResult<()> {
        let name = self.innermost_savepoint()?;
        self.raw(&format!("RELEASE SAVEPOINT {name}")).await?;
        self.savepoints.pop();
        Ok(())
    }

    /// Undo the work done since the innermost savepoint and discard it.
    pub async fn rollback_to_savepoint(&mut self) -> DbResult<()> {
        let name = self.innermost_savepoint()?;
        self.raw(&format!("ROLLBACK TO SAVEPOINT {name}")).await?;
        self.raw(&format!("RELEASE SAVEPOINT {name}")).await?;
        self.savepoints.pop();
        debug!(transaction_id = %self.id, savepoint = %name, "Rolled back to savepoint");
        Ok(())
    }

    pub async fn commit(mut self) -> DbResult<()> {
        let conn = self.take_conn()?;
        let result = match conn {
            TxConn::MySql { tx, cell } => degrade(&cell, self.generation, tx.commit().await).await,
            TxConn::Sqlite { tx, cell } => {
                degrade(&cell, self.generation, tx.commit().await).await
            }
        };
        match &result {
            Ok(()) => info!(
                transaction_id = %self.id,
                elapsed_ms = self.elapsed().as_millis() as u64,
                "Transaction committed"
            ),
            Err(e) => warn!(transaction_id = %self.id, error = %e, "Commit failed"),
        }
        result
    }

    pub async fn rollback(mut self) -> DbResult<()> {
        let conn = self.take_conn()?;
        let result = match conn {
            TxConn::MySql { tx, cell } => {
                degrade(&cell, self.generation, tx.rollback().await).await
            }
            TxConn::Sqlite { tx, cell } => {
                degrade(&cell, self.generation, tx.rollback().await).await
            }
        };
        if result.is_ok() {
            info!(
                transaction_id = %self.id,
                elapsed_ms = self.elapsed().as_millis() as u64,
                "Transaction rolled back"
            );
        }
        result
    }

    async fn raw(&mut self, sql: &str) -> DbResult<()> {
        let result = match self.conn_mut()? {
            TxConn::MySql { tx, .. } => sqlx::raw_sql(sql)
                .execute(&mut **tx)
                .await
                .map(|_| ())
                .map_err(DbError::from),
            TxConn::Sqlite { tx, .. } => sqlx::raw_sql(sql)
                .execute(&mut **tx)
                .await
                .map(|_| ())
                .map_err(DbError::from),
        };
        self.observe(result).await
    }

    fn innermost_savepoint(&self) -> DbResult<String> {
        self.savepoints
            .last()
            .cloned()
            .ok_or_else(|| DbError::transaction("No open savepoint in this transaction"))
    }

    fn conn_mut(&mut self) -> DbResult<&mut TxConn> {
        self.conn
            .as_mut()
            .ok_or_else(|| DbError::transaction("Transaction already finished"))
    }

    fn take_conn(&mut self) -> DbResult<TxConn> {
        self.conn
            .take()
            .ok_or_else(|| DbError::transaction("Transaction already finished"))
    }

    /// Degrade the owning pool when a statement failed at the transport level.
    async fn observe<T>(&self, result: DbResult<T>) -> DbResult<T> {
        if let Err(e) = &result {
            if e.is_transport() {
                match &self.conn {
                    Some(TxConn::MySql { cell, .. }) => {
                        cell.mark_degraded(self.generation, e).await;
                    }
                    Some(TxConn::Sqlite { cell, .. }) => {
                        cell.mark_degraded(self.generation, e).await;
                    }
                    None => {}
                }
            }
        }
        result
    }
}

async fn degrade<DB: sqlx::Database>(
    cell: &PoolCell<DB>,
    generation: u64,
    result: Result<(), sqlx::Error>,
) -> DbResult<()> {
    let result = result.map_err(DbError::from);
    if let Err(e) = &result {
        if e.is_transport() {
            cell.mark_degraded(generation, e).await;
        }
    }
    result
}

impl Drop for TransactionHandle {
    fn drop(&mut self) {
        if self.conn.is_some() {
            warn!(
                transaction_id = %self.id,
                backend = %self.backend,
                "Transaction dropped without commit or rollback, rolling back"
            );
        }
    }
}

/// Generate a unique transaction ID.
fn generate_transaction_id() -> String {
    format!("tx_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_id_format() {
        let id = generate_transaction_id();
        assert!(id.starts_with("tx_"));
        assert_eq!(id.len(), 3 + 32);
        assert_ne!(id, generate_transaction_id());
    }
}
