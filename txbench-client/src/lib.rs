//! Database connections for the benchmark driver.
//!
//! The driver multiplexes many clients on one thread, so every [`Connection`] is non-blocking:
//! statements are sent with one of the `send_*` methods, input is pulled in with
//! [`consume_input`](Connection::consume_input) when the socket is readable, and results are
//! collected with [`get_result`](Connection::get_result) once
//! [`is_busy`](Connection::is_busy) reports that they are available.
//!
//! Results of a statement are followed by a `None` from `get_result`, which marks the end of
//! that statement's results. In pipeline mode each queued statement is terminated this way, and
//! every sync point produces a [`ResultStatus::PipelineSync`] result followed by `None`.

use std::os::unix::io::RawFd;

mod error;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod pg;

pub use crate::error::ClientError;
pub use crate::pg::{PgConfig, PgConnection, PgConnector};

/// SQLSTATE of a serialization failure
pub const SERIALIZATION_FAILURE: &str = "40001";
/// SQLSTATE of a detected deadlock
pub const DEADLOCK_DETECTED: &str = "40P01";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    /// A statement returning no rows completed
    CommandOk,
    /// The query string was empty
    EmptyQuery,
    /// A statement returning rows completed; the rows are in the result
    TuplesOk,
    /// A pipeline sync point was reached
    PipelineSync,
    /// The statement was not executed because an earlier statement of the pipeline failed
    PipelineAborted,
    NonfatalError,
    FatalError,
}

/// The outcome of one statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult {
    pub status: ResultStatus,
    pub columns: Vec<String>,
    /// Rows in text format; `None` is SQL NULL
    pub rows: Vec<Vec<Option<String>>>,
    /// Set for error results
    pub sqlstate: Option<String>,
    pub message: Option<String>,
}

impl QueryResult {
    fn with_status(status: ResultStatus) -> Self {
        Self {
            status,
            columns: vec![],
            rows: vec![],
            sqlstate: None,
            message: None,
        }
    }

    pub fn command_ok() -> Self {
        Self::with_status(ResultStatus::CommandOk)
    }

    pub fn empty_query() -> Self {
        Self::with_status(ResultStatus::EmptyQuery)
    }

    pub fn pipeline_sync() -> Self {
        Self::with_status(ResultStatus::PipelineSync)
    }

    pub fn pipeline_aborted() -> Self {
        Self::with_status(ResultStatus::PipelineAborted)
    }

    pub fn tuples(columns: Vec<String>, rows: Vec<Vec<Option<String>>>) -> Self {
        Self {
            columns,
            rows,
            ..Self::with_status(ResultStatus::TuplesOk)
        }
    }

    pub fn error(sqlstate: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            sqlstate: Some(sqlstate.into()),
            message: Some(message.into()),
            ..Self::with_status(ResultStatus::FatalError)
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(
            self.status,
            ResultStatus::FatalError | ResultStatus::NonfatalError
        )
    }

    pub fn ntuples(&self) -> usize {
        self.rows.len()
    }

    pub fn nfields(&self) -> usize {
        self.columns.len()
    }

    pub fn value(&self, row: usize, column: usize) -> Option<&str> {
        self.rows.get(row)?.get(column)?.as_deref()
    }
}

/// Transaction status of a connection, as reported by the server after the last completed
/// command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Idle,
    /// A command is in progress
    Active,
    /// Inside a transaction block
    InTransaction,
    /// Inside a failed transaction block
    InError,
    /// The connection is broken
    Unknown,
}

/// A non-blocking connection to a database server.
pub trait Connection: Send {
    /// Sends `sql` with the simple query protocol. Not allowed in pipeline mode.
    fn send_simple(&mut self, sql: &str) -> Result<(), ClientError>;

    /// Sends `sql` as an unnamed statement with the extended protocol, binding `params` to
    /// `$1`, `$2`, ... in text format. `None` binds NULL.
    fn send_extended(&mut self, sql: &str, params: &[Option<&str>]) -> Result<(), ClientError>;

    /// Prepares `sql` as statement `name`, waiting for the server to acknowledge it.
    fn prepare(&mut self, name: &str, sql: &str) -> Result<(), ClientError>;

    /// Executes the prepared statement `name` with `params`.
    fn send_prepared(&mut self, name: &str, params: &[Option<&str>]) -> Result<(), ClientError>;

    fn enter_pipeline(&mut self) -> Result<(), ClientError>;

    /// Leaves pipeline mode. Fails while results are still outstanding.
    fn exit_pipeline(&mut self) -> Result<(), ClientError>;

    fn in_pipeline(&self) -> bool;

    /// Queues a pipeline sync point without flushing it to the server.
    fn send_pipeline_sync(&mut self) -> Result<(), ClientError>;

    /// Queues a pipeline sync point and flushes everything queued so far.
    fn pipeline_sync(&mut self) -> Result<(), ClientError>;

    /// Reads whatever input is available without blocking.
    fn consume_input(&mut self) -> Result<(), ClientError>;

    /// Whether [`get_result`](Self::get_result) would block.
    fn is_busy(&self) -> bool;

    /// Returns the next result, blocking if necessary. `None` marks the end of one statement's
    /// results, or that nothing is outstanding.
    fn get_result(&mut self) -> Result<Option<QueryResult>, ClientError>;

    fn transaction_status(&self) -> TransactionStatus;

    /// The socket to wait on for input, if the connection has one.
    fn socket_fd(&self) -> Option<RawFd>;

    /// Message of the most recent error on this connection.
    fn error_message(&self) -> &str;
}

/// Creates connections. Shared by every thread of a run.
pub trait Connector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn Connection>, ClientError>;
}
