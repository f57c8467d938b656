// # SQL Connection Seam
//
// The MySQL client itself is an external collaborator; the control plane
// only needs this narrow surface: execute a statement, run a small query,
// or stream rows from a large one. The metadata store, the task runner,
// and the result merger all speak through [`SqlConnection`]. A mock
// implementation backs tests and local bring-up.

pub mod mock;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::error::{CoreError, Result};

pub use mock::MockSqlConnection;

/// One result row; `None` is SQL NULL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlRow(pub Vec<Option<String>>);

/// A fully materialized (small) result set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlResults {
    pub columns: Vec<String>,
    pub rows: Vec<SqlRow>,
}

impl SqlResults {
    /// The single value of a one-row, one-column result.
    pub fn scalar(&self) -> Result<Option<&str>> {
        if self.rows.len() != 1 || self.rows[0].0.len() != 1 {
            return Err(CoreError::Internal(format!(
                "expected scalar result, got {} row(s)",
                self.rows.len()
            )));
        }
        Ok(self.rows[0].0[0].as_deref())
    }
}

pub type SqlRowStream = Pin<Box<dyn Stream<Item = Result<SqlRow>> + Send>>;

#[async_trait]
pub trait SqlConnection: Send + Sync {
    /// Run a statement; returns the affected row count.
    async fn execute(&self, sql: &str) -> Result<u64>;

    /// Run the statements inside one transaction; returns per-statement
    /// affected row counts. All-or-nothing.
    async fn execute_transaction(&self, stmts: &[String]) -> Result<Vec<u64>>;

    /// Run a query and materialize its (small) result set.
    async fn query(&self, sql: &str) -> Result<SqlResults>;

    /// Run a query and stream its rows without materializing them.
    async fn query_stream(&self, sql: &str) -> Result<SqlRowStream>;

    /// The auto-increment id generated by the last INSERT on this connection.
    async fn last_insert_id(&self) -> Result<u64>;
}

/// Escape a string for inclusion in a single-quoted SQL literal.
pub fn escape_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\'' => out.push_str("''"),
            '\\' => out.push_str("\\\\"),
            '\0' => out.push_str("\\0"),
            c => out.push(c),
        }
    }
    out
}

/// Build a connection from a URI. `mock://` URIs yield the in-process mock;
/// anything else requires a real driver to be wired in at deployment.
pub fn connect(uri: &str) -> Result<std::sync::Arc<dyn SqlConnection>> {
    if uri.starts_with("mock://") {
        Ok(std::sync::Arc::new(MockSqlConnection::new()))
    } else {
        Err(CoreError::Config(format!(
            "no SQL driver available for '{}'",
            uri
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escaping_quotes_and_backslashes() {
        assert_eq!(escape_string("o'brien"), "o''brien");
        assert_eq!(escape_string("a\\b"), "a\\\\b");
        assert_eq!(escape_string("plain"), "plain");
    }

    #[test]
    fn scalar_requires_single_cell() {
        let ok = SqlResults {
            columns: vec!["n".into()],
            rows: vec![SqlRow(vec![Some("5".into())])],
        };
        assert_eq!(ok.scalar().unwrap(), Some("5"));

        let empty = SqlResults::default();
        assert!(empty.scalar().is_err());
    }

    #[test]
    fn connect_rejects_unknown_scheme() {
        assert!(connect("mock://x").is_ok());
        assert!(matches!(
            connect("mysql://real"),
            Err(CoreError::Config(_))
        ));
    }
}
