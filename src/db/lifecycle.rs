//! Pool lifecycle management.
//!
//! A [`PoolCell`] is the indirection cell between a driver and its current
//! sqlx pool. It implements the lifecycle
//! `Uninitialized → Ready → Degraded → Ready → … → Closed`:
//!
//! - The pool is built lazily on first access.
//! - A transport error moves the cell to `Degraded`; the old pool is closed in
//!   the background and the next access builds a new one.
//! - `Closed` is terminal: every later access fails with [`DbError::Closed`].
//!   Closing waits for degraded pools that are still draining.
//!
//! Each built pool carries a generation number. A failure reported against an
//! older generation is ignored, so a late error from the previous pool never
//! tears down its replacement.

use crate::error::{DbError, DbResult};
use crate::models::{BackendKind, LifecycleState};
use sqlx::{Database, Pool};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Builds a fresh pool. Must not block on I/O (use `connect_lazy_with`).
pub type PoolBuilder<DB> = Box<dyn Fn() -> DbResult<Pool<DB>> + Send + Sync>;

enum Slot<DB: Database> {
    Uninitialized,
    Ready { pool: Pool<DB>, generation: u64 },
    Degraded,
    Closed,
}

impl<DB: Database> Slot<DB> {
    fn state(&self) -> LifecycleState {
        match self {
            Slot::Uninitialized => LifecycleState::Uninitialized,
            Slot::Ready { .. } => LifecycleState::Ready,
            Slot::Degraded => LifecycleState::Degraded,
            Slot::Closed => LifecycleState::Closed,
        }
    }

    fn lease(&self) -> Option<PoolLease<DB>> {
        match self {
            Slot::Ready { pool, generation } => Some(PoolLease {
                pool: pool.clone(),
                generation: *generation,
            }),
            _ => None,
        }
    }
}

/// A handle on the current pool together with the generation it belongs to.
#[derive(Debug)]
pub struct PoolLease<DB: Database> {
    pub pool: Pool<DB>,
    pub generation: u64,
}

pub struct PoolCell<DB: Database> {
    backend: BackendKind,
    slot: RwLock<Slot<DB>>,
    builder: PoolBuilder<DB>,
    generations: AtomicU64,
    rebuilds: AtomicU64,
    /// Background closes of degraded pools
    draining: Mutex<Vec<JoinHandle<()>>>,
}

impl<DB: Database> std::fmt::Debug for PoolCell<DB> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolCell")
            .field("backend", &self.backend)
            .field("generations", &self.generations.load(Ordering::Relaxed))
            .field("rebuilds", &self.rebuilds.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<DB: Database> PoolCell<DB> {
    pub fn new(backend: BackendKind, builder: PoolBuilder<DB>) -> Self {
        Self {
            backend,
            slot: RwLock::new(Slot::Uninitialized),
            builder,
            generations: AtomicU64::new(0),
            rebuilds: AtomicU64::new(0),
            draining: Mutex::new(Vec::new()),
        }
    }

    /// Get the current pool, building it if the cell is uninitialized or degraded.
    pub async fn acquire(&self) -> DbResult<PoolLease<DB>> {
        {
            let slot = self.slot.read().await;
            match &*slot {
                Slot::Ready { .. } => return slot.lease().ok_or_else(|| self.closed_error()),
                Slot::Closed => return Err(self.closed_error()),
                Slot::Uninitialized | Slot::Degraded => {}
            }
        } // Read lock released here

        let mut slot = self.slot.write().await;
        // Another caller may have rebuilt or closed the pool while we waited
        let rebuilding = match &*slot {
            Slot::Ready { .. } => return slot.lease().ok_or_else(|| self.closed_error()),
            Slot::Closed => return Err(self.closed_error()),
            Slot::Uninitialized => false,
            Slot::Degraded => true,
        };

        let pool = (self.builder)()?;
        let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
        if rebuilding {
            self.rebuilds.fetch_add(1, Ordering::Relaxed);
            info!(backend = %self.backend, generation, "Rebuilt connection pool");
        } else {
            info!(backend = %self.backend, generation, "Initialized connection pool");
        }

        *slot = Slot::Ready {
            pool: pool.clone(),
            generation,
        };
        Ok(PoolLease { pool, generation })
    }

    /// Current pool without building one. `None` unless the cell is `Ready`.
    pub async fn current(&self) -> Option<PoolLease<DB>> {
        self.slot.read().await.lease()
    }

    /// Tear down the pool of `generation` after a transport error.
    ///
    /// Returns `true` when the pool was torn down, `false` when the cell had
    /// already moved on (different generation, degraded or closed).
    pub async fn mark_degraded(&self, generation: u64, error: &DbError) -> bool {
        let mut slot = self.slot.write().await;
        match &*slot {
            Slot::Ready { generation: g, .. } if *g == generation => {}
            _ => {
                debug!(
                    backend = %self.backend,
                    generation,
                    "Ignoring failure from a stale pool generation"
                );
                return false;
            }
        }
        let old_pool = match std::mem::replace(&mut *slot, Slot::Degraded) {
            Slot::Ready { pool, .. } => pool,
            _ => return false,
        };

        warn!(
            backend = %self.backend,
            generation,
            error = %error,
            "Transport error, connection pool degraded and will be rebuilt on next use"
        );

        // In-flight work on the old pool fails on its own. The drain is
        // registered before the slot lock is released so `close` always sees it.
        let drain = tokio::spawn(async move {
            old_pool.close().await;
        });
        let mut draining = self.draining.lock().await;
        draining.retain(|handle| !handle.is_finished());
        draining.push(drain);
        true
    }

    /// Run `op` against the current pool, degrading the cell on a transport error.
    pub async fn run<T, F, Fut>(&self, op: F) -> DbResult<T>
    where
        F: FnOnce(PoolLease<DB>) -> Fut,
        Fut: Future<Output = DbResult<T>>,
    {
        let lease = self.acquire().await?;
        let generation = lease.generation;
        let result = op(lease).await;
        if let Err(e) = &result {
            if e.is_transport() {
                self.mark_degraded(generation, e).await;
            }
        }
        result
    }

    /// Close the cell for good and drain the current pool.
    pub async fn close(&self) {
        let previous = {
            let mut slot = self.slot.write().await;
            std::mem::replace(&mut *slot, Slot::Closed)
        };

        match previous {
            Slot::Ready { pool, generation } => {
                pool.close().await;
                info!(backend = %self.backend, generation, "Connection pool closed");
            }
            Slot::Closed => debug!(backend = %self.backend, "Connection pool already closed"),
            _ => info!(backend = %self.backend, "Closed before any pool was live"),
        }

        let draining = std::mem::take(&mut *self.draining.lock().await);
        for handle in draining {
            if let Err(e) = handle.await {
                warn!(backend = %self.backend, error = %e, "Degraded pool drain failed");
            }
        }
    }

    pub async fn state(&self) -> LifecycleState {
        self.slot.read().await.state()
    }

    /// Number of rebuilds after degradation.
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds.load(Ordering::Relaxed)
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    fn closed_error(&self) -> DbError {
        DbError::closed(format!("The {} backend has been closed", self.backend))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Sqlite;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::str::FromStr;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn memory_cell() -> (PoolCell<Sqlite>, Arc<AtomicUsize>) {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&builds);
        let builder: PoolBuilder<Sqlite> = Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
            Ok(SqlitePoolOptions::new()
                .max_connections(1)
                .connect_lazy_with(options))
        });
        (PoolCell::new(BackendKind::Embedded, builder), builds)
    }

    async fn wait_closed(pool: &Pool<Sqlite>) -> bool {
        for _ in 0..100 {
            if pool.is_closed() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_lazy_initialization() {
        let (cell, builds) = memory_cell();
        assert_eq!(cell.state().await, LifecycleState::Uninitialized);
        assert!(cell.current().await.is_none());
        assert_eq!(builds.load(Ordering::SeqCst), 0);

        let lease = cell.acquire().await.unwrap();
        assert_eq!(lease.generation, 1);
        assert_eq!(cell.state().await, LifecycleState::Ready);

        // Second access reuses the pool
        let again = cell.acquire().await.unwrap();
        assert_eq!(again.generation, 1);
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_degrade_then_rebuild() {
        let (cell, builds) = memory_cell();
        let first = cell.acquire().await.unwrap();

        let err = DbError::transport("connection reset", "retry");
        assert!(cell.mark_degraded(first.generation, &err).await);
        assert_eq!(cell.state().await, LifecycleState::Degraded);
        assert!(wait_closed(&first.pool).await, "old pool should be closed");

        let second = cell.acquire().await.unwrap();
        assert_eq!(second.generation, 2);
        assert_eq!(cell.rebuilds(), 1);
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert!(!second.pool.is_closed());
    }

    #[tokio::test]
    async fn test_stale_generation_is_ignored() {
        let (cell, _) = memory_cell();
        let first = cell.acquire().await.unwrap();
        let err = DbError::transport("broken pipe", "retry");
        cell.mark_degraded(first.generation, &err).await;
        let second = cell.acquire().await.unwrap();

        // A late failure from the first pool must not tear down the second
        assert!(!cell.mark_degraded(first.generation, &err).await);
        assert_eq!(cell.state().await, LifecycleState::Ready);
        assert_eq!(cell.current().await.unwrap().generation, second.generation);
    }

    #[tokio::test]
    async fn test_old_pool_fails_explicitly() {
        let (cell, _) = memory_cell();
        let first = cell.acquire().await.unwrap();
        let err = DbError::transport("lost connection", "retry");
        cell.mark_degraded(first.generation, &err).await;
        assert!(wait_closed(&first.pool).await);

        let result = sqlx::query("SELECT 1").execute(&first.pool).await;
        let err = DbError::from(result.unwrap_err());
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_run_degrades_on_transport_error() {
        let (cell, _) = memory_cell();
        let result: DbResult<()> = cell
            .run(|_lease| async { Err(DbError::transport("server has gone away", "retry")) })
            .await;
        assert!(result.is_err());
        assert_eq!(cell.state().await, LifecycleState::Degraded);

        let value: i64 = cell
            .run(|lease| async move {
                Ok(sqlx::query_scalar("SELECT 1").fetch_one(&lease.pool).await?)
            })
            .await
            .unwrap();
        assert_eq!(value, 1);
        assert_eq!(cell.state().await, LifecycleState::Ready);
    }

    #[tokio::test]
    async fn test_run_keeps_pool_on_statement_error() {
        let (cell, _) = memory_cell();
        let result: DbResult<()> = cell
            .run(|_lease| async { Err(DbError::syntax("near \"SELEC\"", None)) })
            .await;
        assert!(result.is_err());
        assert_eq!(cell.state().await, LifecycleState::Ready);
        assert_eq!(cell.rebuilds(), 0);
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let (cell, _) = memory_cell();
        let lease = cell.acquire().await.unwrap();
        cell.close().await;

        assert_eq!(cell.state().await, LifecycleState::Closed);
        assert!(lease.pool.is_closed());
        assert!(matches!(cell.acquire().await, Err(DbError::Closed { .. })));

        let err = DbError::transport("x", "y");
        assert!(!cell.mark_degraded(lease.generation, &err).await);
        assert_eq!(cell.state().await, LifecycleState::Closed);

        // Closing twice is harmless
        cell.close().await;
    }

    #[tokio::test]
    async fn test_close_waits_for_degraded_pools() {
        let (cell, _) = memory_cell();
        let first = cell.acquire().await.unwrap();
        sqlx::query("SELECT 1").execute(&first.pool).await.unwrap();
        assert_eq!(first.pool.size(), 1);

        let err = DbError::transport("connection reset", "retry");
        assert!(cell.mark_degraded(first.generation, &err).await);
        let second = cell.acquire().await.unwrap();

        cell.close().await;
        assert!(first.pool.is_closed());
        assert_eq!(first.pool.size(), 0);
        assert!(second.pool.is_closed());
    }

    #[tokio::test]
    async fn test_close_before_use() {
        let (cell, builds) = memory_cell();
        cell.close().await;
        assert!(cell.acquire().await.is_err());
        assert_eq!(builds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_builder_failure_leaves_cell_retryable() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let builder: PoolBuilder<Sqlite> = Box::new(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(DbError::configuration("not yet"));
            }
            let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
            Ok(SqlitePoolOptions::new().connect_lazy_with(options))
        });
        let cell = PoolCell::new(BackendKind::Embedded, builder);

        assert!(cell.acquire().await.is_err());
        assert_eq!(cell.state().await, LifecycleState::Uninitialized);
        assert_eq!(cell.acquire().await.unwrap().generation, 1);
    }
}
