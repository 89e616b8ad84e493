//! The closed set of backend drivers.

use crate::config::BackendConfig;
use crate::db::embedded::EmbeddedDriver;
use crate::db::networked::NetworkedDriver;
use crate::db::transaction::TransactionHandle;
use crate::error::DbResult;
use crate::impl_backend_dispatch;
use crate::models::{
    BackendKind, BackendStats, ColumnInfo, LifecycleState, QueryParam, QueryResult, Row, TableInfo,
};

/// One physical backend. Both variants implement the same capability set,
/// transactions included.
#[derive(Debug, Clone)]
pub enum Backend {
    Networked(NetworkedDriver),
    Embedded(EmbeddedDriver),
}

impl Backend {
    /// Construct the driver for a resolved configuration. Never touches the backend.
    pub fn from_config(config: &BackendConfig) -> Self {
        match config {
            BackendConfig::Networked(c) => Backend::Networked(NetworkedDriver::new(c.clone())),
            BackendConfig::Embedded(c) => Backend::Embedded(EmbeddedDriver::new(c.clone())),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Networked(_) => BackendKind::Networked,
            Backend::Embedded(_) => BackendKind::Embedded,
        }
    }

    pub async fn query(&self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        impl_backend_dispatch!(self, d => d.query(sql, params).await)
    }

    pub async fn execute(&self, sql: &str, params: &[QueryParam]) -> DbResult<QueryResult> {
        impl_backend_dispatch!(self, d => d.execute(sql, params).await)
    }

    pub async fn query_one(&self, sql: &str, params: &[QueryParam]) -> DbResult<Option<Row>> {
        impl_backend_dispatch!(self, d => d.query_one(sql, params).await)
    }

    pub async fn begin(&self) -> DbResult<TransactionHandle> {
        impl_backend_dispatch!(self, d => d.begin().await)
    }

    pub async fn ping(&self) -> bool {
        impl_backend_dispatch!(self, d => d.ping().await)
    }

    pub async fn table_exists(&self, name: &str) -> DbResult<bool> {
        impl_backend_dispatch!(self, d => d.table_exists(name).await)
    }

    pub async fn list_tables(&self) -> DbResult<Vec<TableInfo>> {
        impl_backend_dispatch!(self, d => d.list_tables().await)
    }

    pub async fn describe_table(&self, name: &str) -> DbResult<Vec<ColumnInfo>> {
        impl_backend_dispatch!(self, d => d.describe_table(name).await)
    }

    pub async fn stats(&self) -> BackendStats {
        match self {
            Backend::Networked(d) => BackendStats::Networked(d.stats().await),
            Backend::Embedded(d) => BackendStats::Embedded(d.stats().await),
        }
    }

    pub async fn state(&self) -> LifecycleState {
        impl_backend_dispatch!(self, d => d.state().await)
    }

    /// Drain and close the driver's pool. Terminal.
    pub async fn close(&self) {
        impl_backend_dispatch!(self, d => d.close().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmbeddedConfig, NetworkedConfig};

    #[test]
    fn test_from_config_kind() {
        let embedded = Backend::from_config(&BackendConfig::Embedded(EmbeddedConfig::in_memory()));
        assert_eq!(embedded.kind(), BackendKind::Embedded);

        let net = NetworkedConfig::from_url("mysql://u:p@localhost/db").unwrap();
        let networked = Backend::from_config(&BackendConfig::Networked(net));
        assert_eq!(networked.kind(), BackendKind::Networked);
    }

    #[tokio::test]
    async fn test_stats_tagged_by_backend() {
        let backend = Backend::from_config(&BackendConfig::Embedded(EmbeddedConfig::in_memory()));
        let stats = backend.stats().await;
        assert_eq!(stats.kind(), BackendKind::Embedded);
        assert_eq!(stats.state(), LifecycleState::Uninitialized);
    }
}
