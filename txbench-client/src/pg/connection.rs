use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::mem;
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use bytes::{BufMut, BytesMut};
use fallible_iterator::FallibleIterator;
use nix::errno::Errno;
use nix::sys::socket::{recv, MsgFlags};
use postgres_protocol::authentication::{md5_hash, sasl};
use postgres_protocol::message::backend::{ErrorFields, Message};
use postgres_protocol::message::frontend;
use postgres_protocol::IsNull;
use tracing::{debug, trace};

use super::PgConfig;
use crate::{ClientError, Connection, QueryResult, TransactionStatus};

const READ_CHUNK: usize = 16 * 1024;

/// Pipelined output is written out once this much has been queued.
const MAX_QUEUED_OUTPUT: usize = 64 * 1024;

enum Stream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Stream {
    fn fd(&self) -> RawFd {
        match self {
            Stream::Tcp(s) => s.as_raw_fd(),
            Stream::Unix(s) => s.as_raw_fd(),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.read(buf),
            Stream::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(s) => s.write(buf),
            Stream::Unix(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(s) => s.flush(),
            Stream::Unix(s) => s.flush(),
        }
    }
}

/// A response the server still owes us, oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    /// A statement sent outside a pipeline. Complete at the next ReadyForQuery.
    Statement,
    /// A statement queued in a pipeline. Complete at its CommandComplete or error.
    Pipelined,
    /// A pipeline sync point
    Sync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pipeline {
    Off,
    On,
    /// A statement of the pipeline failed; the server skips everything up to the next sync
    Aborted,
}

/// A PostgreSQL connection over TCP or a Unix-domain socket.
///
/// Writes block; reads done by [`consume_input`](Connection::consume_input) never do. The
/// socket itself stays in blocking mode, which [`get_result`](Connection::get_result) relies on
/// when it has to wait.
pub struct PgConnection {
    stream: Stream,
    input: BytesMut,
    output: BytesMut,
    pending: VecDeque<Pending>,
    /// Results ready to be returned; `None` ends one statement's results
    results: VecDeque<Option<QueryResult>>,
    /// Columns of the row-returning statement being received
    columns: Option<Vec<String>>,
    rows: Vec<Vec<Option<String>>>,
    pipeline: Pipeline,
    tx_status: TransactionStatus,
    error_message: String,
    broken: bool,
}

fn error_fields(mut fields: ErrorFields<'_>) -> Result<(String, String), ClientError> {
    let mut sqlstate = String::new();
    let mut message = String::new();
    while let Some(field) = fields.next()? {
        match field.type_() {
            b'C' => sqlstate = field.value().to_owned(),
            b'M' => message = field.value().to_owned(),
            _ => {}
        }
    }
    Ok((sqlstate, message))
}

fn bind(statement: &str, params: &[Option<&str>], buf: &mut BytesMut) -> Result<(), ClientError> {
    let res = frontend::bind(
        "",
        statement,
        Some(0),
        params.iter(),
        |param, buf| match param {
            Some(v) => {
                buf.put_slice(v.as_bytes());
                Ok(IsNull::No)
            }
            None => Ok(IsNull::Yes),
        },
        Some(0),
        buf,
    );
    match res {
        Ok(()) => Ok(()),
        Err(frontend::BindError::Conversion(e)) => Err(ClientError::Protocol(e.to_string())),
        Err(frontend::BindError::Serialization(e)) => Err(e.into()),
    }
}

impl PgConnection {
    /// Connects and authenticates, returning once the server is ready for queries.
    pub fn connect(config: &PgConfig) -> Result<Self, ClientError> {
        let stream = if config.is_unix_socket() {
            let path = format!("{}/.s.PGSQL.{}", config.host, config.port);
            let s = UnixStream::connect(&path)
                .map_err(|e| ClientError::Connect(format!("{path}: {e}")))?;
            Stream::Unix(s)
        } else {
            let s = TcpStream::connect((config.host.as_str(), config.port)).map_err(|e| {
                ClientError::Connect(format!("{}:{}: {e}", config.host, config.port))
            })?;
            s.set_nodelay(true)?;
            Stream::Tcp(s)
        };

        let mut conn = Self::from_stream(stream);
        conn.startup(config)?;
        debug!(host = %config.host, port = config.port, "connected");
        Ok(conn)
    }

    fn from_stream(stream: Stream) -> Self {
        Self {
            stream,
            input: BytesMut::with_capacity(READ_CHUNK),
            output: BytesMut::new(),
            pending: VecDeque::new(),
            results: VecDeque::new(),
            columns: None,
            rows: vec![],
            pipeline: Pipeline::Off,
            tx_status: TransactionStatus::Idle,
            error_message: String::new(),
            broken: false,
        }
    }

    fn password(config: &PgConfig) -> Result<&str, ClientError> {
        config.password.as_deref().ok_or_else(|| {
            ClientError::Authentication("password required but none supplied".into())
        })
    }

    fn startup(&mut self, config: &PgConfig) -> Result<(), ClientError> {
        let user = config.user();
        let dbname = config.dbname();
        frontend::startup_message(
            [
                ("user", user.as_str()),
                ("database", dbname.as_str()),
                ("application_name", "txbench"),
                ("client_encoding", "UTF8"),
            ],
            &mut self.output,
        )?;
        self.flush()?;

        let mut scram: Option<sasl::ScramSha256> = None;
        loop {
            match self.read_message()? {
                Message::AuthenticationOk
                | Message::ParameterStatus(_)
                | Message::BackendKeyData(_)
                | Message::NoticeResponse(_) => {}
                Message::AuthenticationCleartextPassword => {
                    let password = Self::password(config)?;
                    frontend::password_message(password.as_bytes(), &mut self.output)?;
                    self.flush()?;
                }
                Message::AuthenticationMd5Password(body) => {
                    let password = Self::password(config)?;
                    let hash = md5_hash(user.as_bytes(), password.as_bytes(), body.salt());
                    frontend::password_message(hash.as_bytes(), &mut self.output)?;
                    self.flush()?;
                }
                Message::AuthenticationSasl(body) => {
                    let mut mechanisms = body.mechanisms();
                    let mut supported = false;
                    while let Some(mechanism) = mechanisms.next()? {
                        supported |= mechanism == sasl::SCRAM_SHA_256;
                    }
                    if !supported {
                        return Err(ClientError::UnsupportedAuthentication(
                            "SASL without SCRAM-SHA-256",
                        ));
                    }
                    let password = Self::password(config)?;
                    let s = sasl::ScramSha256::new(
                        password.as_bytes(),
                        sasl::ChannelBinding::unsupported(),
                    );
                    frontend::sasl_initial_response(
                        sasl::SCRAM_SHA_256,
                        s.message(),
                        &mut self.output,
                    )?;
                    self.flush()?;
                    scram = Some(s);
                }
                Message::AuthenticationSaslContinue(body) => {
                    let s = scram.as_mut().ok_or_else(|| {
                        ClientError::Protocol("unexpected SASL continuation".into())
                    })?;
                    s.update(body.data())
                        .map_err(|e| ClientError::Authentication(e.to_string()))?;
                    frontend::sasl_response(s.message(), &mut self.output)?;
                    self.flush()?;
                }
                Message::AuthenticationSaslFinal(body) => {
                    let s = scram.as_mut().ok_or_else(|| {
                        ClientError::Protocol("unexpected SASL completion".into())
                    })?;
                    s.finish(body.data())
                        .map_err(|e| ClientError::Authentication(e.to_string()))?;
                }
                Message::AuthenticationKerberosV5 => {
                    return Err(ClientError::UnsupportedAuthentication("Kerberos V5"))
                }
                Message::AuthenticationScmCredential => {
                    return Err(ClientError::UnsupportedAuthentication("SCM credentials"))
                }
                Message::AuthenticationGss | Message::AuthenticationSspi => {
                    return Err(ClientError::UnsupportedAuthentication("GSSAPI"))
                }
                Message::ErrorResponse(body) => {
                    let (_, message) = error_fields(body.fields())?;
                    return Err(ClientError::Connect(message));
                }
                Message::ReadyForQuery(body) => {
                    self.set_transaction_status(body.status());
                    return Ok(());
                }
                _ => {
                    return Err(ClientError::Protocol(
                        "unexpected message during startup".into(),
                    ))
                }
            }
        }
    }

    fn read_message(&mut self) -> Result<Message, ClientError> {
        loop {
            if let Some(msg) = Message::parse(&mut self.input)? {
                return Ok(msg);
            }
            self.fill_blocking()?;
        }
    }

    fn fill_blocking(&mut self) -> Result<(), ClientError> {
        let mut chunk = [0u8; READ_CHUNK];
        let n = loop {
            match self.stream.read(&mut chunk) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(self.fail(e.into())),
            }
        };
        if n == 0 {
            return Err(self.fail(ClientError::Closed));
        }
        self.input.extend_from_slice(&chunk[..n]);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ClientError> {
        if let Err(e) = self.stream.write_all(&self.output) {
            return Err(self.fail(e.into()));
        }
        self.output.clear();
        Ok(())
    }

    fn flush_if_full(&mut self) -> Result<(), ClientError> {
        if self.output.len() >= MAX_QUEUED_OUTPUT {
            self.flush()?;
        }
        Ok(())
    }

    /// Marks the connection broken and returns `err`.
    fn fail(&mut self, err: ClientError) -> ClientError {
        self.broken = true;
        self.error_message = err.to_string();
        err
    }

    fn set_transaction_status(&mut self, status: u8) {
        self.tx_status = match status {
            b'I' => TransactionStatus::Idle,
            b'T' => TransactionStatus::InTransaction,
            b'E' => TransactionStatus::InError,
            _ => TransactionStatus::Unknown,
        };
    }

    fn process_input(&mut self) -> Result<(), ClientError> {
        while let Some(msg) = Message::parse(&mut self.input)? {
            self.handle(msg)?;
        }
        Ok(())
    }

    fn handle(&mut self, msg: Message) -> Result<(), ClientError> {
        match msg {
            Message::ParseComplete
            | Message::BindComplete
            | Message::CloseComplete
            | Message::NoData
            | Message::PortalSuspended
            | Message::ParameterDescription(_)
            | Message::ParameterStatus(_)
            | Message::NotificationResponse(_) => {}
            Message::NoticeResponse(body) => {
                let (_, message) = error_fields(body.fields())?;
                debug!(%message, "server notice");
            }
            Message::RowDescription(body) => {
                let columns = body.fields().map(|f| Ok(f.name().to_owned())).collect()?;
                self.columns = Some(columns);
            }
            Message::DataRow(body) => {
                let buf = body.buffer();
                let row = body
                    .ranges()
                    .map(|r| Ok(r.map(|r| String::from_utf8_lossy(&buf[r]).into_owned())))
                    .collect()?;
                self.rows.push(row);
            }
            Message::CommandComplete(_) => {
                let result = match self.columns.take() {
                    Some(columns) => QueryResult::tuples(columns, mem::take(&mut self.rows)),
                    None => QueryResult::command_ok(),
                };
                self.statement_done(result);
            }
            Message::EmptyQueryResponse => self.statement_done(QueryResult::empty_query()),
            Message::ErrorResponse(body) => {
                let (sqlstate, message) = error_fields(body.fields())?;
                trace!(%sqlstate, %message, "statement failed");
                self.error_message = message.clone();
                self.columns = None;
                self.rows.clear();
                if self.pipeline == Pipeline::On {
                    self.pipeline = Pipeline::Aborted;
                }
                self.statement_done(QueryResult::error(sqlstate, message));
            }
            Message::ReadyForQuery(body) => {
                self.set_transaction_status(body.status());
                self.ready_for_query();
            }
            Message::CopyInResponse(_) | Message::CopyOutResponse(_) => {
                return Err(self.fail(ClientError::Protocol("COPY is not supported".into())));
            }
            _ => {
                return Err(self.fail(ClientError::Protocol(
                    "unexpected message from server".into(),
                )))
            }
        }
        Ok(())
    }

    fn statement_done(&mut self, result: QueryResult) {
        self.results.push_back(Some(result));
        if self.pending.front() == Some(&Pending::Pipelined) {
            self.pending.pop_front();
            self.results.push_back(None);
        }
    }

    fn ready_for_query(&mut self) {
        while let Some(pending) = self.pending.pop_front() {
            match pending {
                Pending::Statement => {
                    self.results.push_back(None);
                    return;
                }
                // skipped by the server after an earlier failure
                Pending::Pipelined => {
                    self.results.push_back(Some(QueryResult::pipeline_aborted()));
                    self.results.push_back(None);
                }
                Pending::Sync => {
                    self.results.push_back(Some(QueryResult::pipeline_sync()));
                    self.results.push_back(None);
                    if self.pipeline == Pipeline::Aborted {
                        self.pipeline = Pipeline::On;
                    }
                    return;
                }
            }
        }
    }

    fn check_ready(&self) -> Result<(), ClientError> {
        if self.broken {
            return Err(ClientError::Closed);
        }
        if self.pipeline == Pipeline::Off && !self.pending.is_empty() {
            return Err(ClientError::InvalidState(
                "another command is already in progress",
            ));
        }
        Ok(())
    }

    fn bind_and_execute(&mut self, statement: &str, params: &[Option<&str>]) -> Result<(), ClientError> {
        bind(statement, params, &mut self.output)?;
        frontend::describe(b'P', "", &mut self.output)?;
        frontend::execute("", 0, &mut self.output)?;
        if self.pipeline == Pipeline::Off {
            frontend::sync(&mut self.output);
            self.pending.push_back(Pending::Statement);
            self.flush()
        } else {
            self.pending.push_back(Pending::Pipelined);
            self.flush_if_full()
        }
    }
}

impl Connection for PgConnection {
    fn send_simple(&mut self, sql: &str) -> Result<(), ClientError> {
        if self.pipeline != Pipeline::Off {
            return Err(ClientError::InvalidState(
                "simple query protocol is not allowed in pipeline mode",
            ));
        }
        self.check_ready()?;
        frontend::query(sql, &mut self.output)?;
        self.pending.push_back(Pending::Statement);
        self.flush()
    }

    fn send_extended(&mut self, sql: &str, params: &[Option<&str>]) -> Result<(), ClientError> {
        self.check_ready()?;
        frontend::parse("", sql, std::iter::empty(), &mut self.output)?;
        self.bind_and_execute("", params)
    }

    fn prepare(&mut self, name: &str, sql: &str) -> Result<(), ClientError> {
        if self.pipeline != Pipeline::Off {
            return Err(ClientError::InvalidState(
                "cannot prepare statements in pipeline mode",
            ));
        }
        self.check_ready()?;
        frontend::parse(name, sql, std::iter::empty(), &mut self.output)?;
        frontend::sync(&mut self.output);
        self.pending.push_back(Pending::Statement);
        self.flush()?;

        let mut failure = None;
        while let Some(result) = self.get_result()? {
            if result.is_error() && failure.is_none() {
                failure = Some(result);
            }
        }
        match failure {
            Some(r) => Err(ClientError::Server {
                sqlstate: r.sqlstate.unwrap_or_default(),
                message: r.message.unwrap_or_default(),
            }),
            None => Ok(()),
        }
    }

    fn send_prepared(&mut self, name: &str, params: &[Option<&str>]) -> Result<(), ClientError> {
        self.check_ready()?;
        self.bind_and_execute(name, params)
    }

    fn enter_pipeline(&mut self) -> Result<(), ClientError> {
        if self.pipeline != Pipeline::Off {
            return Ok(());
        }
        if !self.pending.is_empty() {
            return Err(ClientError::InvalidState(
                "cannot enter pipeline mode, connection not idle",
            ));
        }
        self.pipeline = Pipeline::On;
        Ok(())
    }

    fn exit_pipeline(&mut self) -> Result<(), ClientError> {
        if self.pipeline == Pipeline::Off {
            return Ok(());
        }
        if !self.pending.is_empty() || self.results.iter().any(Option::is_some) {
            return Err(ClientError::InvalidState(
                "cannot exit pipeline mode with uncollected results",
            ));
        }
        self.results.clear();
        self.pipeline = Pipeline::Off;
        Ok(())
    }

    fn in_pipeline(&self) -> bool {
        self.pipeline != Pipeline::Off
    }

    fn send_pipeline_sync(&mut self) -> Result<(), ClientError> {
        if self.pipeline == Pipeline::Off {
            return Err(ClientError::InvalidState(
                "cannot send pipeline sync when not in pipeline mode",
            ));
        }
        frontend::sync(&mut self.output);
        self.pending.push_back(Pending::Sync);
        self.flush_if_full()
    }

    fn pipeline_sync(&mut self) -> Result<(), ClientError> {
        self.send_pipeline_sync()?;
        self.flush()
    }

    fn consume_input(&mut self) -> Result<(), ClientError> {
        if self.broken {
            return Err(ClientError::Closed);
        }
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match recv(self.stream.fd(), &mut chunk, MsgFlags::MSG_DONTWAIT) {
                Ok(0) => return Err(self.fail(ClientError::Closed)),
                Ok(n) => self.input.extend_from_slice(&chunk[..n]),
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(self.fail(e.into())),
            }
        }
        self.process_input()
    }

    fn is_busy(&self) -> bool {
        self.results.is_empty() && !self.pending.is_empty()
    }

    fn get_result(&mut self) -> Result<Option<QueryResult>, ClientError> {
        loop {
            if let Some(result) = self.results.pop_front() {
                return Ok(result);
            }
            if self.pending.is_empty() {
                return Ok(None);
            }
            if !self.output.is_empty() {
                self.flush()?;
            }
            self.fill_blocking()?;
            self.process_input()?;
        }
    }

    fn transaction_status(&self) -> TransactionStatus {
        if self.broken {
            TransactionStatus::Unknown
        } else if !self.pending.is_empty() {
            TransactionStatus::Active
        } else {
            self.tx_status
        }
    }

    fn socket_fd(&self) -> Option<RawFd> {
        Some(self.stream.fd())
    }

    fn error_message(&self) -> &str {
        &self.error_message
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        if !self.broken {
            self.output.clear();
            frontend::terminate(&mut self.output);
            let _ = self.stream.write_all(&self.output);
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::ResultStatus;

    fn message(tag: u8, body: &[u8]) -> Vec<u8> {
        let mut m = vec![tag];
        m.extend_from_slice(&(body.len() as i32 + 4).to_be_bytes());
        m.extend_from_slice(body);
        m
    }

    fn cstr(buf: &mut Vec<u8>, s: &str) {
        buf.extend_from_slice(s.as_bytes());
        buf.push(0);
    }

    fn row_description(names: &[&str]) -> Vec<u8> {
        let mut body = (names.len() as i16).to_be_bytes().to_vec();
        for name in names {
            cstr(&mut body, name);
            body.extend_from_slice(&0i32.to_be_bytes()); // table oid
            body.extend_from_slice(&0i16.to_be_bytes()); // column number
            body.extend_from_slice(&25i32.to_be_bytes()); // text
            body.extend_from_slice(&(-1i16).to_be_bytes());
            body.extend_from_slice(&(-1i32).to_be_bytes());
            body.extend_from_slice(&0i16.to_be_bytes());
        }
        message(b'T', &body)
    }

    fn data_row(values: &[Option<&str>]) -> Vec<u8> {
        let mut body = (values.len() as i16).to_be_bytes().to_vec();
        for v in values {
            match v {
                Some(v) => {
                    body.extend_from_slice(&(v.len() as i32).to_be_bytes());
                    body.extend_from_slice(v.as_bytes());
                }
                None => body.extend_from_slice(&(-1i32).to_be_bytes()),
            }
        }
        message(b'D', &body)
    }

    fn command_complete(tag: &str) -> Vec<u8> {
        let mut body = vec![];
        cstr(&mut body, tag);
        message(b'C', &body)
    }

    fn error_response(code: &str, msg: &str) -> Vec<u8> {
        let mut body = vec![b'S'];
        cstr(&mut body, "ERROR");
        body.push(b'C');
        cstr(&mut body, code);
        body.push(b'M');
        cstr(&mut body, msg);
        body.push(0);
        message(b'E', &body)
    }

    fn ready(status: u8) -> Vec<u8> {
        message(b'Z', &[status])
    }

    fn pair() -> (PgConnection, UnixStream) {
        let (client, server) = UnixStream::pair().unwrap();
        (PgConnection::from_stream(Stream::Unix(client)), server)
    }

    #[test]
    fn simple_query_with_rows() {
        let (mut conn, mut server) = pair();
        conn.send_simple("SELECT 1 AS one, NULL AS two").unwrap();
        assert!(conn.is_busy());
        assert_eq!(conn.transaction_status(), TransactionStatus::Active);

        let mut reply = row_description(&["one", "two"]);
        reply.extend(data_row(&[Some("1"), None]));
        reply.extend(command_complete("SELECT 1"));
        reply.extend(ready(b'T'));
        server.write_all(&reply).unwrap();

        conn.consume_input().unwrap();
        assert!(!conn.is_busy());
        let result = conn.get_result().unwrap().unwrap();
        assert_eq!(
            result,
            QueryResult::tuples(
                vec!["one".into(), "two".into()],
                vec![vec![Some("1".into()), None]]
            )
        );
        assert_eq!(conn.get_result().unwrap(), None);
        assert_eq!(conn.transaction_status(), TransactionStatus::InTransaction);
    }

    #[test]
    fn second_command_while_busy_is_rejected() {
        let (mut conn, _server) = pair();
        conn.send_simple("SELECT 1").unwrap();
        assert!(matches!(
            conn.send_extended("SELECT 2", &[]),
            Err(ClientError::InvalidState(_))
        ));
    }

    #[test]
    fn pipeline_error_aborts_until_sync() {
        let (mut conn, mut server) = pair();
        conn.enter_pipeline().unwrap();
        assert!(conn.send_simple("SELECT 1").is_err());
        conn.send_extended("UPDATE t SET a = $1", &[Some("1")]).unwrap();
        conn.send_extended("SELECT 1/0", &[]).unwrap();
        conn.send_extended("SELECT 3", &[None]).unwrap();
        conn.pipeline_sync().unwrap();

        let mut reply = message(b'1', &[]);
        reply.extend(message(b'2', &[]));
        reply.extend(message(b'n', &[]));
        reply.extend(command_complete("UPDATE 1"));
        reply.extend(message(b'1', &[]));
        reply.extend(message(b'2', &[]));
        reply.extend(error_response("22012", "division by zero"));
        reply.extend(ready(b'I'));
        server.write_all(&reply).unwrap();
        conn.consume_input().unwrap();

        let mut statuses = vec![];
        for _ in 0..4 {
            statuses.push(conn.get_result().unwrap().map(|r| r.status));
            statuses.push(conn.get_result().unwrap().map(|r| r.status));
        }
        assert_eq!(
            statuses,
            vec![
                Some(ResultStatus::CommandOk),
                None,
                Some(ResultStatus::FatalError),
                None,
                Some(ResultStatus::PipelineAborted),
                None,
                Some(ResultStatus::PipelineSync),
                None,
            ]
        );
        assert_eq!(conn.error_message(), "division by zero");
        conn.exit_pipeline().unwrap();
        assert!(!conn.in_pipeline());
    }

    #[test]
    fn closed_socket_breaks_connection() {
        let (mut conn, server) = pair();
        conn.send_simple("SELECT 1").unwrap();
        drop(server);
        assert!(matches!(conn.consume_input(), Err(ClientError::Closed)));
        assert_eq!(conn.transaction_status(), TransactionStatus::Unknown);
    }
}
