//! Backend selection and status models.
//!
//! This module defines the backend kind, the health mapping handed to
//! monitoring endpoints, and the per-backend stats records.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The two interchangeable physical backends.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
pub enum BackendKind {
    /// Pooled MySQL/MariaDB server
    #[serde(rename = "networked")]
    #[value(name = "networked", alias = "mysql")]
    Networked,
    /// Local SQLite file
    #[serde(rename = "embedded-file")]
    #[value(name = "embedded-file", alias = "sqlite", alias = "embedded")]
    Embedded,
}

impl BackendKind {
    /// Get the display name for this backend kind.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Networked => "networked",
            Self::Embedded => "embedded-file",
        }
    }

    /// Get the engine behind this backend kind.
    pub fn engine(&self) -> &'static str {
        match self {
            Self::Networked => "MySQL",
            Self::Embedded => "SQLite",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Lifecycle state of a driver's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Uninitialized,
    Ready,
    /// A transport error invalidated the pool; it is rebuilt on next access
    Degraded,
    /// Terminal
    Closed,
}

impl LifecycleState {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready => "ready",
            Self::Degraded => "degraded",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Health of the active backend, keyed by kind. Serializes as `{"networked": true}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HealthStatus(BTreeMap<BackendKind, bool>);

impl HealthStatus {
    pub fn new(kind: BackendKind, healthy: bool) -> Self {
        Self(BTreeMap::from([(kind, healthy)]))
    }

    /// Health of `kind`; `None` for the inactive backend.
    pub fn get(&self, kind: BackendKind) -> Option<bool> {
        self.0.get(&kind).copied()
    }

    /// True when every reported backend answered.
    pub fn is_healthy(&self) -> bool {
        !self.0.is_empty() && self.0.values().all(|healthy| *healthy)
    }

    pub fn backends(&self) -> impl Iterator<Item = BackendKind> + '_ {
        self.0.keys().copied()
    }
}

/// Pool counters for the networked backend. Zeros when the pool is not live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    pub state: LifecycleState,
    /// Callers currently waiting for a connection
    pub acquiring: usize,
    pub total: u32,
    pub idle: u32,
    pub busy: u32,
    pub limit: u32,
    /// Number of times the pool was rebuilt after a transport error
    pub rebuilds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
}

/// Store details for the embedded backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddedStats {
    pub state: LifecycleState,
    pub path: String,
    /// True when the single connection is currently established
    pub open: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size_bytes: Option<u64>,
    /// Human readable file size, e.g. "12.5 kB"
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub journal_mode: Option<String>,
    pub rebuilds: u64,
}

/// Backend-specific introspection record returned by `stats()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "kebab-case")]
pub enum BackendStats {
    Networked(PoolStats),
    #[serde(rename = "embedded-file")]
    Embedded(EmbeddedStats),
}

impl BackendStats {
    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Networked(_) => BackendKind::Networked,
            Self::Embedded(_) => BackendKind::Embedded,
        }
    }

    pub fn state(&self) -> LifecycleState {
        match self {
            Self::Networked(stats) => stats.state,
            Self::Embedded(stats) => stats.state,
        }
    }
}
