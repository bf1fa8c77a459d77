//! Testing utilities
//!
//! Mock implementations of the execution layer and the downstream emitter so
//! the engine and the source can be exercised without a database.
//!
//! # Example
//!
//! ```rust,ignore
//! use sqlpoll_source::testing::*;
//!
//! let conn = MockConnection::new()
//!     .with_rows(vec![row(&["id"], vec![Value::Int64(1)])]);
//! let emitter = MockEmitter::new();
//!
//! let mut engine = PollingEngine::new(config, store, Box::new(conn.clone()), Arc::new(emitter.clone()));
//! engine.poll_once().await?;
//!
//! assert_eq!(emitter.records().len(), 1);
//! assert_eq!(conn.executed_queries().len(), 1);
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlpoll_rdbc::connection::{Connection, ConnectionConfig, ConnectionFactory, DatabaseType};
use sqlpoll_rdbc::error::{Error as RdbcError, Result as RdbcResult};
use sqlpoll_rdbc::types::{Row, Value};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::convert::ConvertedRecord;
use crate::emit::RecordEmitter;
use crate::error::EmissionError;

/// Build a row from column names and values
pub fn row(columns: &[&str], values: Vec<Value>) -> Row {
    Row::new(columns.iter().map(|c| c.to_string()).collect(), values)
}

// ============================================================================
// Mock Connection
// ============================================================================

/// A scripted connection.
///
/// Each query pops the next scripted response; once the script is exhausted
/// queries return no rows. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockConnection {
    responses: Arc<Mutex<VecDeque<RdbcResult<Vec<Row>>>>>,
    executed: Arc<Mutex<Vec<String>>>,
    limits: Arc<Mutex<Vec<usize>>>,
    closed: Arc<Mutex<bool>>,
}

impl MockConnection {
    /// Create a mock with an empty script
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful response
    pub fn with_rows(self, rows: Vec<Row>) -> Self {
        self.push_rows(rows);
        self
    }

    /// Queue a failing response
    pub fn with_error(self, error: RdbcError) -> Self {
        self.push_error(error);
        self
    }

    /// Queue a successful response on a shared handle
    pub fn push_rows(&self, rows: Vec<Row>) {
        self.responses.lock().push_back(Ok(rows));
    }

    /// Queue a failing response on a shared handle
    pub fn push_error(&self, error: RdbcError) {
        self.responses.lock().push_back(Err(error));
    }

    /// Statements executed so far, in order
    pub fn executed_queries(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    /// Row limits passed to `query_limited`, in order
    pub fn row_limits(&self) -> Vec<usize> {
        self.limits.lock().clone()
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    fn next_response(&self, sql: &str) -> RdbcResult<Vec<Row>> {
        self.executed.lock().push(sql.to_string());
        self.responses.lock().pop_front().unwrap_or_else(|| Ok(Vec::new()))
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn query_limited(&self, sql: &str, max_rows: usize) -> RdbcResult<Vec<Row>> {
        self.limits.lock().push(max_rows);
        let mut rows = self.next_response(sql)?;
        rows.truncate(max_rows);
        Ok(rows)
    }

    async fn close(&self) -> RdbcResult<()> {
        *self.closed.lock() = true;
        Ok(())
    }
}

// ============================================================================
// Mock Connection Factory
// ============================================================================

/// Factory handing out clones of one [`MockConnection`]
#[derive(Debug, Clone, Default)]
pub struct MockConnectionFactory {
    connection: MockConnection,
    database_type: Option<DatabaseType>,
    fail_message: Arc<Mutex<Option<String>>>,
    connect_urls: Arc<Mutex<Vec<String>>>,
}

impl MockConnectionFactory {
    /// Create a factory for `connection`
    pub fn new(connection: MockConnection) -> Self {
        Self {
            connection,
            ..Default::default()
        }
    }

    /// Make every connect attempt fail
    pub fn fail_with(self, message: impl Into<String>) -> Self {
        *self.fail_message.lock() = Some(message.into());
        self
    }

    /// Report `database_type` instead of [`DatabaseType::Unknown`]
    pub fn with_database_type(mut self, database_type: DatabaseType) -> Self {
        self.database_type = Some(database_type);
        self
    }

    /// URLs passed to `connect`, in order
    pub fn connect_urls(&self) -> Vec<String> {
        self.connect_urls.lock().clone()
    }

    /// The connection handed out
    pub fn connection(&self) -> &MockConnection {
        &self.connection
    }
}

#[async_trait]
impl ConnectionFactory for MockConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> RdbcResult<Box<dyn Connection>> {
        self.connect_urls.lock().push(config.url.clone());
        if let Some(msg) = self.fail_message.lock().clone() {
            return Err(RdbcError::connection(msg));
        }
        Ok(Box::new(self.connection.clone()))
    }

    fn database_type(&self) -> DatabaseType {
        self.database_type.unwrap_or(DatabaseType::Unknown)
    }
}

// ============================================================================
// Mock Emitter
// ============================================================================

/// Emitter recording every accepted batch.
///
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct MockEmitter {
    batches: Arc<Mutex<Vec<Vec<ConvertedRecord>>>>,
    fail_always: Arc<Mutex<Option<String>>>,
    fail_remaining: Arc<Mutex<usize>>,
    attempts: Arc<Mutex<usize>>,
}

impl MockEmitter {
    /// Create an emitter that accepts everything
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every batch
    pub fn failing(message: impl Into<String>) -> Self {
        let emitter = Self::new();
        *emitter.fail_always.lock() = Some(message.into());
        emitter
    }

    /// Reject the next `n` batches, then accept
    pub fn fail_next(&self, n: usize) {
        *self.fail_remaining.lock() = n;
    }

    /// Stop rejecting batches
    pub fn recover(&self) {
        *self.fail_always.lock() = None;
        *self.fail_remaining.lock() = 0;
    }

    /// Accepted batches, in order
    pub fn batches(&self) -> Vec<Vec<ConvertedRecord>> {
        self.batches.lock().clone()
    }

    /// Accepted records, flattened
    pub fn records(&self) -> Vec<ConvertedRecord> {
        self.batches.lock().iter().flatten().cloned().collect()
    }

    /// Calls to `emit`, accepted or not
    pub fn attempts(&self) -> usize {
        *self.attempts.lock()
    }
}

#[async_trait]
impl RecordEmitter for MockEmitter {
    async fn emit(&self, batch: &[ConvertedRecord]) -> Result<(), EmissionError> {
        *self.attempts.lock() += 1;

        if let Some(msg) = self.fail_always.lock().clone() {
            return Err(EmissionError::new(msg));
        }
        {
            let mut remaining = self.fail_remaining.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(EmissionError::new("mock emission failure"));
            }
        }

        self.batches.lock().push(batch.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_connection_script() {
        let conn = MockConnection::new()
            .with_rows(vec![row(&["id"], vec![Value::Int64(1)])])
            .with_error(RdbcError::timeout("slow"));

        assert_eq!(conn.query_limited("q1", 10).await.unwrap().len(), 1);
        assert!(conn.query_limited("q2", 10).await.is_err());
        assert!(conn.query_limited("q3", 10).await.unwrap().is_empty());
        assert_eq!(conn.executed_queries(), vec!["q1", "q2", "q3"]);
        assert_eq!(conn.row_limits(), vec![10, 10, 10]);
    }

    #[tokio::test]
    async fn test_mock_emitter_fail_next() {
        let emitter = MockEmitter::new();
        emitter.fail_next(1);

        let batch = vec![ConvertedRecord::Delimited(vec!["a".into()])];
        assert!(emitter.emit(&batch).await.is_err());
        assert!(emitter.emit(&batch).await.is_ok());
        assert_eq!(emitter.attempts(), 2);
        assert_eq!(emitter.batches().len(), 1);
    }

    #[tokio::test]
    async fn test_mock_factory_failure() {
        let factory = MockConnectionFactory::new(MockConnection::new()).fail_with("refused");
        let err = factory
            .connect(&ConnectionConfig::new("postgres://x/y"))
            .await
            .err()
            .unwrap();
        assert!(err.is_retriable());
        assert_eq!(factory.connect_urls(), vec!["postgres://x/y"]);
    }
}
