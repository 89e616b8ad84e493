//! SQL statement classification.
//!
//! `query` only runs read-only statements (SELECT, SHOW, DESCRIBE, EXPLAIN of a
//! read, PRAGMA reads). The embedded driver also needs to know whether a write
//! inserted rows before it trusts `last_insert_rowid`, which SQLite keeps per
//! connection across statements.
//!
//! Both decisions parse the statement with [sqlparser](https://docs.rs/sqlparser/)
//! in the backend's dialect, so comments, whitespace and CTE prefixes cannot
//! disguise what a statement does.

use crate::error::{DbError, DbResult};
use crate::models::BackendKind;
use sqlparser::ast::{Query, SetExpr, Statement};
use sqlparser::dialect::{Dialect, GenericDialect, MySqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;
use tracing::debug;

/// Type of SQL statement detected by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementType {
    /// SELECT and other read-only statements
    Read,
    /// INSERT and REPLACE, including CTE-prefixed inserts
    Insert,
    /// UPDATE, DELETE, MERGE, COPY
    Write,
    /// CREATE, DROP, ALTER, TRUNCATE
    Ddl,
    /// BEGIN, COMMIT, ROLLBACK, SAVEPOINT, RELEASE
    Transaction,
    /// CALL, EXECUTE, PREPARE
    ProcedureCall,
    /// GRANT, SET, LOCK, VACUUM, PRAGMA assignments, ...
    Administrative,
    Unknown,
}

mod error_messages {
    pub const DML_WRITE: &str =
        "Write statements are not allowed in query. Use execute for INSERT/UPDATE/DELETE.";
    pub const DDL: &str = "Schema changes are not allowed in query. Use execute.";
    pub const TRANSACTION: &str =
        "Transaction control is not allowed in query. Use a transaction handle.";
    pub const PROCEDURE: &str =
        "Procedure calls are not allowed in query. Use execute for stored procedures.";
    pub const ADMINISTRATIVE: &str = "Administrative statements are not allowed in query.";
    pub const UNKNOWN: &str = "Unrecognized statement. Only read-only statements run in query.";
    pub const PARSE_ERROR: &str = "Failed to parse SQL statement.";
}

fn dialect(kind: BackendKind) -> Box<dyn Dialect> {
    match kind {
        BackendKind::Networked => Box::new(MySqlDialect {}),
        BackendKind::Embedded => Box::new(SQLiteDialect {}),
    }
}

/// Parse `sql` in the backend's dialect.
///
/// Statements the backend dialect does not cover (SQLite's `REPLACE INTO`) get
/// a second attempt with the generic dialect before being rejected.
pub fn parse(sql: &str, kind: BackendKind) -> DbResult<Vec<Statement>> {
    let statements = match Parser::parse_sql(dialect(kind).as_ref(), sql) {
        Ok(statements) => statements,
        Err(first) => Parser::parse_sql(&GenericDialect {}, sql).map_err(|_| {
            DbError::syntax(format!("{} {}", error_messages::PARSE_ERROR, first), None)
        })?,
    };

    if statements.is_empty() {
        return Err(DbError::invalid_input("Empty SQL statement"));
    }
    Ok(statements)
}

/// Reject anything that is not a read-only statement.
///
/// The error is a non-retryable `Permission` error naming the operation.
pub fn validate_readonly(sql: &str, kind: BackendKind) -> DbResult<()> {
    for statement in parse(sql, kind)? {
        let (statement_type, operation) = classify_statement(&statement);
        let reason = match statement_type {
            StatementType::Read => continue,
            StatementType::Insert | StatementType::Write => error_messages::DML_WRITE,
            StatementType::Ddl => error_messages::DDL,
            StatementType::Transaction => error_messages::TRANSACTION,
            StatementType::ProcedureCall => error_messages::PROCEDURE,
            StatementType::Administrative => error_messages::ADMINISTRATIVE,
            StatementType::Unknown => error_messages::UNKNOWN,
        };
        return Err(DbError::permission(operation, reason));
    }
    Ok(())
}

/// True when any statement in `sql` inserts rows.
pub fn inserts_rows(sql: &str, kind: BackendKind) -> bool {
    match parse(sql, kind) {
        Ok(statements) => statements
            .iter()
            .any(|s| classify_statement(s).0 == StatementType::Insert),
        Err(e) => {
            debug!(error = %e, "Could not classify executed statement");
            false
        }
    }
}

/// Classify a parsed statement into a statement type and operation name.
pub fn classify_statement(stmt: &Statement) -> (StatementType, &'static str) {
    match stmt {
        Statement::Query(query) => classify_query(query),
        Statement::ShowTables { .. } => (StatementType::Read, "SHOW TABLES"),
        Statement::ShowColumns { .. } => (StatementType::Read, "SHOW COLUMNS"),
        Statement::ShowDatabases { .. } => (StatementType::Read, "SHOW DATABASES"),
        Statement::ShowCreate { .. } => (StatementType::Read, "SHOW CREATE"),
        Statement::ShowVariable { .. } => (StatementType::Read, "SHOW VARIABLE"),
        Statement::ShowVariables { .. } => (StatementType::Read, "SHOW VARIABLES"),
        Statement::ShowStatus { .. } => (StatementType::Read, "SHOW STATUS"),
        Statement::ShowCollation { .. } => (StatementType::Read, "SHOW COLLATION"),
        Statement::ExplainTable { .. } => (StatementType::Read, "DESCRIBE"),
        Statement::Explain { statement, .. } => match classify_statement(statement) {
            (StatementType::Read, _) => (StatementType::Read, "EXPLAIN"),
            other => other,
        },
        // `PRAGMA name` reads a setting, `PRAGMA name = value` changes it
        Statement::Pragma { value: None, .. } => (StatementType::Read, "PRAGMA"),
        Statement::Pragma { .. } => (StatementType::Administrative, "PRAGMA"),

        Statement::Insert { .. } => (StatementType::Insert, "INSERT"),
        Statement::Update { .. } => (StatementType::Write, "UPDATE"),
        Statement::Delete { .. } => (StatementType::Write, "DELETE"),
        Statement::Merge { .. } => (StatementType::Write, "MERGE"),
        Statement::Copy { .. } => (StatementType::Write, "COPY"),

        Statement::CreateTable { .. } => (StatementType::Ddl, "CREATE TABLE"),
        Statement::CreateView { .. } => (StatementType::Ddl, "CREATE VIEW"),
        Statement::CreateIndex { .. } => (StatementType::Ddl, "CREATE INDEX"),
        Statement::CreateVirtualTable { .. } => (StatementType::Ddl, "CREATE VIRTUAL TABLE"),
        Statement::CreateTrigger { .. } => (StatementType::Ddl, "CREATE TRIGGER"),
        Statement::CreateDatabase { .. } => (StatementType::Ddl, "CREATE DATABASE"),
        Statement::CreateSchema { .. } => (StatementType::Ddl, "CREATE SCHEMA"),
        Statement::CreateFunction { .. } => (StatementType::Ddl, "CREATE FUNCTION"),
        Statement::CreateProcedure { .. } => (StatementType::Ddl, "CREATE PROCEDURE"),
        Statement::AlterTable { .. } => (StatementType::Ddl, "ALTER TABLE"),
        Statement::AlterView { .. } => (StatementType::Ddl, "ALTER VIEW"),
        Statement::AlterIndex { .. } => (StatementType::Ddl, "ALTER INDEX"),
        Statement::Drop { .. } => (StatementType::Ddl, "DROP"),
        Statement::DropFunction { .. } => (StatementType::Ddl, "DROP FUNCTION"),
        Statement::DropProcedure { .. } => (StatementType::Ddl, "DROP PROCEDURE"),
        Statement::DropTrigger { .. } => (StatementType::Ddl, "DROP TRIGGER"),
        Statement::Truncate { .. } => (StatementType::Ddl, "TRUNCATE"),

        Statement::StartTransaction { .. } => (StatementType::Transaction, "BEGIN"),
        Statement::Commit { .. } => (StatementType::Transaction, "COMMIT"),
        Statement::Rollback { .. } => (StatementType::Transaction, "ROLLBACK"),
        Statement::Savepoint { .. } => (StatementType::Transaction, "SAVEPOINT"),
        Statement::ReleaseSavepoint { .. } => (StatementType::Transaction, "RELEASE SAVEPOINT"),

        Statement::Call { .. } => (StatementType::ProcedureCall, "CALL"),
        Statement::Execute { .. } => (StatementType::ProcedureCall, "EXECUTE"),
        Statement::Prepare { .. } => (StatementType::ProcedureCall, "PREPARE"),

        Statement::Grant { .. } => (StatementType::Administrative, "GRANT"),
        Statement::Revoke { .. } => (StatementType::Administrative, "REVOKE"),
        Statement::Set { .. } => (StatementType::Administrative, "SET"),
        Statement::Use { .. } => (StatementType::Administrative, "USE"),
        Statement::Kill { .. } => (StatementType::Administrative, "KILL"),
        Statement::Vacuum { .. } => (StatementType::Administrative, "VACUUM"),
        Statement::Analyze { .. } => (StatementType::Administrative, "ANALYZE"),
        Statement::LockTables { .. } => (StatementType::Administrative, "LOCK"),
        Statement::UnlockTables => (StatementType::Administrative, "UNLOCK"),
        Statement::Flush { .. } => (StatementType::Administrative, "FLUSH"),
        Statement::OptimizeTable { .. } => (StatementType::Administrative, "OPTIMIZE"),
        Statement::AttachDatabase { .. } => (StatementType::Administrative, "ATTACH"),

        _ => (StatementType::Unknown, "Unknown"),
    }
}

/// A query is only a read when its body and every CTE are reads.
fn classify_query(query: &Query) -> (StatementType, &'static str) {
    if let Some(with) = &query.with {
        for cte in &with.cte_tables {
            let classified = classify_query(&cte.query);
            if classified.0 != StatementType::Read {
                return classified;
            }
        }
    }
    classify_set_expr(&query.body)
}

fn classify_set_expr(body: &SetExpr) -> (StatementType, &'static str) {
    match body {
        SetExpr::Select(_) | SetExpr::Values(_) | SetExpr::Table(_) => {
            (StatementType::Read, "SELECT")
        }
        SetExpr::Query(query) => classify_query(query),
        SetExpr::SetOperation { left, right, .. } => {
            let classified = classify_set_expr(left);
            if classified.0 != StatementType::Read {
                return classified;
            }
            classify_set_expr(right)
        }
        // `WITH ... INSERT`
        SetExpr::Insert(statement) => classify_statement(statement),
        _ => (StatementType::Write, "DML"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SQLITE: BackendKind = BackendKind::Embedded;
    const MYSQL: BackendKind = BackendKind::Networked;

    fn classify(sql: &str, kind: BackendKind) -> StatementType {
        let statements = parse(sql, kind).unwrap();
        classify_statement(&statements[0]).0
    }

    #[test]
    fn test_reads_are_allowed() {
        assert!(validate_readonly("SELECT * FROM users WHERE id = ?", SQLITE).is_ok());
        assert!(validate_readonly("SELECT 1 UNION SELECT 2", MYSQL).is_ok());
        assert!(validate_readonly("WITH x AS (SELECT 1 AS v) SELECT v FROM x", SQLITE).is_ok());
        assert!(validate_readonly("SHOW TABLES", MYSQL).is_ok());
        assert!(validate_readonly("PRAGMA journal_mode", SQLITE).is_ok());
    }

    #[test]
    fn test_writes_are_rejected() {
        for sql in [
            "INSERT INTO t (v) VALUES (1)",
            "UPDATE t SET v = 2",
            "DELETE FROM t",
            "CREATE TABLE t (id INT)",
            "DROP TABLE t",
            "BEGIN",
            "PRAGMA user_version = 3",
        ] {
            let err = validate_readonly(sql, SQLITE).unwrap_err();
            assert!(matches!(err, DbError::Permission { .. }), "{sql}: {err:?}");
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn test_disguised_writes_are_rejected() {
        assert!(validate_readonly("-- harmless\nINSERT INTO t (v) VALUES (1)", SQLITE).is_err());
        assert!(validate_readonly("SELECT 1; DELETE FROM t", SQLITE).is_err());
        assert!(
            validate_readonly(
                "WITH x AS (SELECT 2 AS v) INSERT INTO t (v) SELECT v FROM x",
                SQLITE
            )
            .is_err()
        );
    }

    #[test]
    fn test_dml_error_mentions_execute() {
        let err = validate_readonly("INSERT INTO t VALUES (1)", MYSQL).unwrap_err();
        assert!(err.to_string().contains("execute"), "{err}");
    }

    #[test]
    fn test_unparsable_sql_is_a_syntax_error() {
        let err = validate_readonly("SELEC 1", SQLITE).unwrap_err();
        assert!(matches!(err, DbError::Syntax { .. }), "{err:?}");
    }

    #[test]
    fn test_empty_sql_is_invalid_input() {
        let err = validate_readonly("   ", SQLITE).unwrap_err();
        assert!(matches!(err, DbError::InvalidInput { .. }), "{err:?}");
    }

    #[test]
    fn test_insert_classification() {
        assert_eq!(classify("INSERT INTO t (v) VALUES (?)", SQLITE), StatementType::Insert);
        assert_eq!(classify("  insert into t values (1)", SQLITE), StatementType::Insert);
        assert_eq!(classify("INSERT OR REPLACE INTO t VALUES (1)", SQLITE), StatementType::Insert);
        assert_eq!(classify("REPLACE INTO t VALUES (1)", MYSQL), StatementType::Insert);
        assert_eq!(classify("UPDATE t SET v = 1", SQLITE), StatementType::Write);
        assert_eq!(classify("SELECT 'INSERT'", SQLITE), StatementType::Read);
    }

    #[test]
    fn test_inserts_rows_sees_through_comments_and_ctes() {
        assert!(inserts_rows("-- add row\nINSERT INTO t (v) VALUES (?)", SQLITE));
        assert!(inserts_rows("/* bulk */ INSERT INTO t (v) VALUES (1), (2)", SQLITE));
        assert!(inserts_rows(
            "WITH x AS (SELECT 2 AS v) INSERT INTO t (v) SELECT v FROM x",
            SQLITE
        ));
        assert!(inserts_rows("REPLACE INTO t (v) VALUES (1)", SQLITE));
        assert!(!inserts_rows("UPDATE t SET v = 2", SQLITE));
        assert!(!inserts_rows("DELETE FROM t", SQLITE));
    }
}
