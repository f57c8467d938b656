// Mock SQL connection.
//
// Records every statement it is given and replays scripted results.
// Queries with no scripted result return an empty set; executes succeed
// unless a failure is scripted. Used by tests and by `mock://` bring-up
// where no real MySQL instance is attached.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;

use super::{SqlConnection, SqlResults, SqlRow, SqlRowStream};
use crate::error::{CoreError, Result};

enum StreamScript {
    Rows(Vec<SqlRow>),
    /// A stream that never yields; models a long-running scan.
    Hang,
}

#[derive(Default)]
struct MockState {
    executed: Vec<String>,
    canned_results: VecDeque<SqlResults>,
    canned_streams: VecDeque<StreamScript>,
    fail_next: Option<CoreError>,
    fail_matching: Option<(String, CoreError)>,
    last_insert_id: u64,
}

#[derive(Clone, Default)]
pub struct MockSqlConnection {
    state: Arc<Mutex<MockState>>,
}

impl MockSqlConnection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the result of the next `query` call. Calls queue in order.
    pub fn push_result(&self, results: SqlResults) {
        self.state.lock().canned_results.push_back(results);
    }

    /// Script the rows of the next `query_stream` call.
    pub fn push_stream(&self, rows: Vec<SqlRow>) {
        self.state
            .lock()
            .canned_streams
            .push_back(StreamScript::Rows(rows));
    }

    /// Script a `query_stream` call that never produces a row.
    pub fn push_hanging_stream(&self) {
        self.state.lock().canned_streams.push_back(StreamScript::Hang);
    }

    /// Make the next operation fail with `err`.
    pub fn fail_next(&self, err: CoreError) {
        self.state.lock().fail_next = Some(err);
    }

    /// Make the next statement containing `needle` fail with `err`.
    pub fn fail_matching(&self, needle: &str, err: CoreError) {
        self.state.lock().fail_matching = Some((needle.to_string(), err));
    }

    /// Every statement seen so far, in order.
    pub fn executed(&self) -> Vec<String> {
        self.state.lock().executed.clone()
    }

    /// True if any recorded statement contains `needle`.
    pub fn saw(&self, needle: &str) -> bool {
        self.state.lock().executed.iter().any(|s| s.contains(needle))
    }

    fn record(&self, sql: &str) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(err) = state.fail_next.take() {
            return Err(err);
        }
        if let Some((needle, _)) = &state.fail_matching {
            if sql.contains(needle.as_str()) {
                let (_, err) = state.fail_matching.take().expect("guarded above");
                return Err(err);
            }
        }
        state.executed.push(sql.to_string());
        if sql.trim_start().to_ascii_uppercase().starts_with("INSERT") {
            state.last_insert_id += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl SqlConnection for MockSqlConnection {
    async fn execute(&self, sql: &str) -> Result<u64> {
        self.record(sql)?;
        Ok(1)
    }

    async fn execute_transaction(&self, stmts: &[String]) -> Result<Vec<u64>> {
        let mut counts = Vec::with_capacity(stmts.len());
        for stmt in stmts {
            self.record(stmt)?;
            counts.push(1);
        }
        Ok(counts)
    }

    async fn query(&self, sql: &str) -> Result<SqlResults> {
        self.record(sql)?;
        Ok(self
            .state
            .lock()
            .canned_results
            .pop_front()
            .unwrap_or_default())
    }

    async fn query_stream(&self, sql: &str) -> Result<SqlRowStream> {
        self.record(sql)?;
        let script = self.state.lock().canned_streams.pop_front();
        match script {
            Some(StreamScript::Hang) => Ok(Box::pin(stream::pending::<Result<SqlRow>>())),
            Some(StreamScript::Rows(rows)) => {
                Ok(Box::pin(stream::iter(rows.into_iter().map(Ok))))
            }
            None => Ok(Box::pin(stream::iter(Vec::<Result<SqlRow>>::new()))),
        }
    }

    async fn last_insert_id(&self) -> Result<u64> {
        Ok(self.state.lock().last_insert_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn records_statements_and_replays_results() {
        let conn = MockSqlConnection::new();
        conn.push_result(SqlResults {
            columns: vec!["n".into()],
            rows: vec![SqlRow(vec![Some("7".into())])],
        });

        conn.execute("INSERT INTO t VALUES (1)").await.unwrap();
        let got = conn.query("SELECT n FROM t").await.unwrap();
        assert_eq!(got.scalar().unwrap(), Some("7"));
        assert!(conn.saw("INSERT INTO t"));
        assert_eq!(conn.last_insert_id().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn scripted_failure_fires_once() {
        let conn = MockSqlConnection::new();
        conn.fail_next(CoreError::Transport("lease failed".into()));
        assert!(conn.execute("SELECT 1").await.is_err());
        assert!(conn.execute("SELECT 1").await.is_ok());
    }

    #[tokio::test]
    async fn streams_scripted_rows() {
        let conn = MockSqlConnection::new();
        conn.push_stream(vec![
            SqlRow(vec![Some("1".into())]),
            SqlRow(vec![None]),
        ]);
        let mut stream = conn.query_stream("SELECT x FROM big").await.unwrap();
        let mut rows = Vec::new();
        while let Some(row) = stream.next().await {
            rows.push(row.unwrap());
        }
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1], SqlRow(vec![None]));
    }
}
