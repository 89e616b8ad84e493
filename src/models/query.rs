//! Query-related data models.
//!
//! This module defines the statement parameters and the normalized result shape
//! both backends produce.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A single result row: column name → value, in column order.
pub type Row = serde_json::Map<String, JsonValue>;

/// A parameter value for parameterized statements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Binary data (base64 encoded in JSON)
    #[serde(with = "base64_bytes")]
    Bytes(Vec<u8>),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
        }
    }
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for QueryParam {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for QueryParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for QueryParam {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl<T: Into<QueryParam>> From<Option<T>> for QueryParam {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Custom serialization for binary data as base64.
mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

/// Summary record attached to every result.
///
/// `inserted_id` is `None` when the statement produced no identifier; a real
/// identifier is never represented by a sentinel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuerySummary {
    pub inserted_id: Option<i64>,
    pub affected_rows: u64,
    pub changed_rows: u64,
}

impl QuerySummary {
    /// Summary for a read: the affected count is the number of rows returned.
    pub fn for_read(row_count: usize) -> Self {
        Self {
            inserted_id: None,
            affected_rows: row_count as u64,
            changed_rows: 0,
        }
    }

    /// Summary for a write. The driver decides whether the statement produced
    /// an id; 0 is a valid SQLite rowid.
    pub fn for_write(affected_rows: u64, inserted_id: Option<i64>) -> Self {
        Self {
            inserted_id,
            affected_rows,
            changed_rows: affected_rows,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    pub summary: QuerySummary,
}

impl QueryResult {
    /// Result of a read statement.
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let summary = QuerySummary::for_read(rows.len());
        Self { rows, summary }
    }

    /// Result of a mutating statement (no rows).
    pub fn write_result(affected_rows: u64, inserted_id: Option<i64>) -> Self {
        Self {
            rows: Vec::new(),
            summary: QuerySummary::for_write(affected_rows, inserted_id),
        }
    }

    /// Get the number of rows in the result.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Take the first row, if any.
    pub fn into_first(self) -> Option<Row> {
        self.rows.into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_param_types() {
        assert!(QueryParam::Null.is_null());
        assert!(!QueryParam::Bool(true).is_null());
        assert_eq!(QueryParam::Int(42).type_name(), "int");
        assert_eq!(QueryParam::from("hello").type_name(), "string");
        assert_eq!(QueryParam::from(None::<i64>), QueryParam::Null);
        assert_eq!(QueryParam::from(Some(7)), QueryParam::Int(7));
    }

    #[test]
    fn test_query_param_untagged_json() {
        let params: Vec<QueryParam> = serde_json::from_str(r#"[null, true, 3, 1.5, "x"]"#).unwrap();
        assert_eq!(
            params,
            vec![
                QueryParam::Null,
                QueryParam::Bool(true),
                QueryParam::Int(3),
                QueryParam::Float(1.5),
                QueryParam::String("x".to_string()),
            ]
        );
    }

    #[test]
    fn test_write_summary_without_insert_id() {
        let summary = QuerySummary::for_write(3, None);
        assert_eq!(summary.inserted_id, None);
        assert_eq!(summary.affected_rows, 3);
    }

    #[test]
    fn test_write_summary_with_insert_id() {
        let summary = QuerySummary::for_write(1, Some(42));
        assert_eq!(summary.inserted_id, Some(42));
        assert_eq!(summary.changed_rows, 1);
    }

    #[test]
    fn test_write_summary_keeps_zero_id() {
        let summary = QuerySummary::for_write(1, Some(0));
        assert_eq!(summary.inserted_id, Some(0));
    }

    #[test]
    fn test_read_summary_counts_rows() {
        let mut row = Row::new();
        row.insert("v".to_string(), JsonValue::from(1));
        let result = QueryResult::from_rows(vec![row.clone(), row]);
        assert_eq!(result.summary.affected_rows, 2);
        assert_eq!(result.summary.inserted_id, None);
        assert_eq!(result.row_count(), 2);
    }

    #[test]
    fn test_summary_serializes_camel_case() {
        let json = serde_json::to_value(QuerySummary::for_write(1, Some(5))).unwrap();
        assert_eq!(json["insertedId"], 5);
        assert_eq!(json["affectedRows"], 1);
        assert_eq!(json["changedRows"], 1);

        let json = serde_json::to_value(QuerySummary::for_read(0)).unwrap();
        assert!(json["insertedId"].is_null());
    }

    #[test]
    fn test_into_first_on_empty() {
        assert!(QueryResult::default().into_first().is_none());
    }
}
