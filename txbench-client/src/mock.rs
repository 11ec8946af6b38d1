//! An in-process backend for exercising code that drives a [`Connection`].
//!
//! Every statement is answered by a responder function shared by all connections of a
//! [`MockBackend`], and recorded in a trace that tests can inspect afterwards. The backend tracks
//! transaction blocks from `BEGIN`/`COMMIT`/`ROLLBACK` the way a server would, so a failed
//! statement inside a block leaves the connection in a failed transaction until it is rolled
//! back.

use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::{ClientError, Connection, Connector, QueryResult, TransactionStatus};

/// How a statement reached the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Simple,
    Extended,
    Prepared,
}

/// A statement as executed by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// Connection number, in order of connection
    pub connection: usize,
    pub protocol: Protocol,
    /// The statement text; for prepared statements, the text given when preparing
    pub sql: String,
    pub params: Vec<Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    Connect(usize),
    Prepare { connection: usize, name: String, sql: String },
    Execute(Statement),
    PipelineSync(usize),
    Disconnect(usize),
}

type Responder = Box<dyn FnMut(&Statement) -> Vec<QueryResult> + Send>;

struct Shared {
    responder: Responder,
    trace: Vec<TraceEvent>,
    connections: usize,
    latency: Duration,
    refuse: bool,
}

/// A scriptable database shared by all connections made through its [`MockConnector`].
#[derive(Clone)]
pub struct MockBackend {
    shared: Arc<Mutex<Shared>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// A backend that answers every statement with a plain command completion.
    pub fn new() -> Self {
        Self::with_responder(|_| vec![QueryResult::command_ok()])
    }

    /// A backend answering each statement with the results `responder` returns for it.
    pub fn with_responder(
        responder: impl FnMut(&Statement) -> Vec<QueryResult> + Send + 'static,
    ) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                responder: Box::new(responder),
                trace: vec![],
                connections: 0,
                latency: Duration::ZERO,
                refuse: false,
            })),
        }
    }

    /// Delays every result by `latency` after the statement was sent.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = latency;
        self
    }

    /// Makes every connection attempt fail.
    pub fn refusing_connections(self) -> Self {
        self.lock().refuse = true;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        // a panicking test thread must not hide the trace from the others
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn connector(&self) -> MockConnector {
        MockConnector {
            backend: self.clone(),
        }
    }

    pub fn trace(&self) -> Vec<TraceEvent> {
        self.lock().trace.clone()
    }

    /// Every statement executed so far, in order.
    pub fn statements(&self) -> Vec<Statement> {
        self.lock()
            .trace
            .iter()
            .filter_map(|e| match e {
                TraceEvent::Execute(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    /// The text of every statement executed so far, in order.
    pub fn sql(&self) -> Vec<String> {
        self.statements().into_iter().map(|s| s.sql).collect()
    }

    pub fn connections(&self) -> usize {
        self.lock().connections
    }
}

/// Opens [`MockConnection`]s to a [`MockBackend`].
#[derive(Clone)]
pub struct MockConnector {
    backend: MockBackend,
}

impl Connector for MockConnector {
    fn connect(&self) -> Result<Box<dyn Connection>, ClientError> {
        let mut shared = self.backend.lock();
        if shared.refuse {
            return Err(ClientError::Connect("connection refused".into()));
        }
        let id = shared.connections;
        shared.connections += 1;
        shared.trace.push(TraceEvent::Connect(id));
        Ok(Box::new(MockConnection {
            backend: self.backend.clone(),
            id,
            prepared: vec![],
            queued: VecDeque::new(),
            pipeline: false,
            pipeline_aborted: false,
            tx_status: TransactionStatus::Idle,
            error_message: String::new(),
        }))
    }
}

/// Results of one statement or sync point, available from `ready_at`.
struct Queued {
    ready_at: Instant,
    results: VecDeque<QueryResult>,
}

pub struct MockConnection {
    backend: MockBackend,
    id: usize,
    prepared: Vec<(String, String)>,
    queued: VecDeque<Queued>,
    pipeline: bool,
    pipeline_aborted: bool,
    tx_status: TransactionStatus,
    error_message: String,
}

fn first_word(sql: &str) -> String {
    sql.split_whitespace()
        .next()
        .unwrap_or_default()
        .trim_end_matches(';')
        .to_ascii_uppercase()
}

impl MockConnection {
    fn execute(&mut self, protocol: Protocol, sql: &str, params: &[Option<&str>]) {
        let statement = Statement {
            connection: self.id,
            protocol,
            sql: sql.to_owned(),
            params: params.iter().map(|p| p.map(str::to_owned)).collect(),
        };

        let mut shared = self.backend.lock();
        let ready_at = Instant::now() + shared.latency;
        shared.trace.push(TraceEvent::Execute(statement.clone()));

        let word = first_word(sql);
        let ends_block = matches!(word.as_str(), "COMMIT" | "END" | "ROLLBACK" | "ABORT");
        let results = if self.pipeline_aborted {
            vec![QueryResult::pipeline_aborted()]
        } else if self.tx_status == TransactionStatus::InError && !ends_block {
            vec![QueryResult::error(
                "25P02",
                "current transaction is aborted, commands ignored until end of transaction block",
            )]
        } else {
            (shared.responder)(&statement)
        };
        drop(shared);

        if let Some(failed) = results.iter().find(|r| r.is_error()) {
            self.error_message = failed.message.clone().unwrap_or_default();
            if self.pipeline {
                self.pipeline_aborted = true;
            }
            if self.tx_status == TransactionStatus::InTransaction {
                self.tx_status = TransactionStatus::InError;
            }
        } else if !self.pipeline_aborted {
            match word.as_str() {
                "BEGIN" | "START" => self.tx_status = TransactionStatus::InTransaction,
                _ if ends_block => self.tx_status = TransactionStatus::Idle,
                _ => {}
            }
        }

        self.queued.push_back(Queued {
            ready_at,
            results: results.into(),
        });
    }

    fn check_ready(&self) -> Result<(), ClientError> {
        if !self.pipeline && !self.queued.is_empty() {
            return Err(ClientError::InvalidState(
                "another command is already in progress",
            ));
        }
        Ok(())
    }
}

impl Connection for MockConnection {
    fn send_simple(&mut self, sql: &str) -> Result<(), ClientError> {
        if self.pipeline {
            return Err(ClientError::InvalidState(
                "simple query protocol is not allowed in pipeline mode",
            ));
        }
        self.check_ready()?;
        self.execute(Protocol::Simple, sql, &[]);
        Ok(())
    }

    fn send_extended(&mut self, sql: &str, params: &[Option<&str>]) -> Result<(), ClientError> {
        self.check_ready()?;
        self.execute(Protocol::Extended, sql, params);
        Ok(())
    }

    fn prepare(&mut self, name: &str, sql: &str) -> Result<(), ClientError> {
        self.check_ready()?;
        self.backend.lock().trace.push(TraceEvent::Prepare {
            connection: self.id,
            name: name.to_owned(),
            sql: sql.to_owned(),
        });
        self.prepared.push((name.to_owned(), sql.to_owned()));
        Ok(())
    }

    fn send_prepared(&mut self, name: &str, params: &[Option<&str>]) -> Result<(), ClientError> {
        self.check_ready()?;
        let sql = self
            .prepared
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, sql)| sql.clone())
            .ok_or_else(|| ClientError::Server {
                sqlstate: "26000".into(),
                message: format!("prepared statement \"{name}\" does not exist"),
            })?;
        self.execute(Protocol::Prepared, &sql, params);
        Ok(())
    }

    fn enter_pipeline(&mut self) -> Result<(), ClientError> {
        if !self.pipeline && !self.queued.is_empty() {
            return Err(ClientError::InvalidState(
                "cannot enter pipeline mode, connection not idle",
            ));
        }
        self.pipeline = true;
        Ok(())
    }

    fn exit_pipeline(&mut self) -> Result<(), ClientError> {
        if !self.queued.is_empty() {
            return Err(ClientError::InvalidState(
                "cannot exit pipeline mode with uncollected results",
            ));
        }
        self.pipeline = false;
        Ok(())
    }

    fn in_pipeline(&self) -> bool {
        self.pipeline
    }

    fn send_pipeline_sync(&mut self) -> Result<(), ClientError> {
        if !self.pipeline {
            return Err(ClientError::InvalidState(
                "cannot send pipeline sync when not in pipeline mode",
            ));
        }
        let mut shared = self.backend.lock();
        shared.trace.push(TraceEvent::PipelineSync(self.id));
        let ready_at = Instant::now() + shared.latency;
        drop(shared);
        self.pipeline_aborted = false;
        self.queued.push_back(Queued {
            ready_at,
            results: VecDeque::from([QueryResult::pipeline_sync()]),
        });
        Ok(())
    }

    fn pipeline_sync(&mut self) -> Result<(), ClientError> {
        self.send_pipeline_sync()
    }

    fn consume_input(&mut self) -> Result<(), ClientError> {
        Ok(())
    }

    fn is_busy(&self) -> bool {
        self.queued
            .front()
            .map_or(false, |q| q.ready_at > Instant::now())
    }

    fn get_result(&mut self) -> Result<Option<QueryResult>, ClientError> {
        let Some(front) = self.queued.front_mut() else {
            return Ok(None);
        };
        let now = Instant::now();
        if front.ready_at > now {
            std::thread::sleep(front.ready_at - now);
        }
        match front.results.pop_front() {
            Some(result) => Ok(Some(result)),
            None => {
                self.queued.pop_front();
                Ok(None)
            }
        }
    }

    fn transaction_status(&self) -> TransactionStatus {
        if self.queued.is_empty() {
            self.tx_status
        } else {
            TransactionStatus::Active
        }
    }

    fn socket_fd(&self) -> Option<RawFd> {
        None
    }

    fn error_message(&self) -> &str {
        &self.error_message
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.backend.lock().trace.push(TraceEvent::Disconnect(self.id));
    }
}
