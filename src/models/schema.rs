//! Schema-related data models.
//!
//! This module defines types for the introspection both drivers expose and the
//! bookkeeping rows of the `migrations` table.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TableType {
    Table,
    View,
}

impl TableType {
    /// Parse from information_schema / sqlite_master type strings.
    pub fn from_backend(value: &str) -> Self {
        if value.to_uppercase().contains("VIEW") {
            Self::View
        } else {
            Self::Table
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    pub table_type: TableType,
}

impl TableInfo {
    pub fn new(name: impl Into<String>, table_type: TableType) -> Self {
        Self {
            name: name.into(),
            table_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    /// Backend-specific declared type (e.g., "int", "varchar(255)", "TEXT")
    pub data_type: String,
    pub nullable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    pub primary_key: bool,
}

/// One row of the `migrations` bookkeeping table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedMigration {
    pub id: i64,
    pub name: String,
    /// None when the stored timestamp could not be parsed
    pub executed_at: Option<NaiveDateTime>,
}
