//! The client state machine.
//!
//! A [`Client`] runs transactions (executions of a chosen script) one after the other over its
//! own connection. Its progress is an explicit [`ClientState`]; [`Client::advance`] runs the
//! machine until the client has to wait, for the server or for the clock, and then returns
//! control to the thread driver, which multiplexes all clients of the thread over one `poll`.

use std::fmt::Write as _;
use std::os::unix::io::RawFd;

use tracing::{debug, error, info};
use txbench_client::{ClientError, Connection, ResultStatus, TransactionStatus};
use txbench_script::{
    BenchRng, Capture, CaptureKind, Command, CommandKind, ConditionalStack, EvalContext,
    EvalError, Expr, IfState, Meta, QueryMode, ScriptSet, SleepDuration, SqlCommand, Value,
    Variables,
};

use crate::clock::{self, Micros};
use crate::shell;
use crate::stats::ErrorStatus;
use crate::thread::{TxOutcome, Worker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Pick the script of the next transaction
    ChooseScript,
    /// Connect if needed and start the transaction
    StartTx,
    /// Schedule the start of the next transaction under throttling
    PrepareThrottle,
    /// Wait for the scheduled start
    Throttle,
    /// Execute the current command
    StartCommand,
    /// Wait for the results of the current command, or of a pipeline
    WaitResult,
    /// Wait for a `\sleep` to elapse
    Sleep,
    /// Account for the finished command and move to the next one
    EndCommand,
    /// Skip commands of an inactive conditional branch
    SkipCommand,
    /// An error was raised in the current try
    Error,
    /// Wait for the rollback of a failed transaction block
    WaitRollbackResult,
    /// Start the transaction over
    Retry,
    /// Give up on the failed transaction
    Failure,
    /// Account for the finished transaction
    EndTx,
    Aborted,
    Finished,
}

impl ClientState {
    pub fn is_done(self) -> bool {
        matches!(self, ClientState::Aborted | ClientState::Finished)
    }

    /// Whether the client is waiting for input from its connection.
    pub fn is_waiting_for_server(self) -> bool {
        matches!(
            self,
            ClientState::WaitResult | ClientState::WaitRollbackResult
        )
    }
}

pub struct Client {
    pub id: usize,
    state: ClientState,
    conn: Option<Box<dyn Connection>>,
    variables: Variables,
    cstack: ConditionalStack,
    script: usize,
    command: usize,
    /// Finished transactions, whether successful, failed or skipped
    cnt: u64,
    sleep_until: Micros,
    txn_scheduled: Micros,
    txn_begin: Micros,
    stmt_begin: Micros,
    /// Per script and command, whether it is prepared on the current connection
    prepared: Vec<Vec<bool>>,
    /// Generator used by script expressions
    rng: BenchRng,
    /// `rng` as of the start of the current transaction, restored for retries
    txn_rng: BenchRng,
    tries: u32,
    status: ErrorStatus,
    /// Pipeline syncs sent but not yet acknowledged
    pending_syncs: u32,
}

impl Client {
    pub fn new(id: usize, rng: BenchRng, variables: Variables, scripts: &ScriptSet) -> Self {
        Self {
            id,
            state: ClientState::ChooseScript,
            conn: None,
            variables,
            cstack: ConditionalStack::new(),
            script: 0,
            command: 0,
            cnt: 0,
            sleep_until: 0,
            txn_scheduled: 0,
            txn_begin: 0,
            stmt_begin: 0,
            prepared: unprepared(scripts),
            txn_rng: rng.clone(),
            rng,
            tries: 1,
            status: ErrorStatus::NoError,
            pending_syncs: 0,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Transactions finished so far.
    pub fn transactions(&self) -> u64 {
        self.cnt
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn set_connection(&mut self, conn: Box<dyn Connection>, scripts: &ScriptSet) {
        self.conn = Some(conn);
        self.prepared = unprepared(scripts);
    }

    pub fn disconnect(&mut self) {
        self.conn = None;
    }

    pub fn socket_fd(&self) -> Option<RawFd> {
        self.conn.as_ref().and_then(|c| c.socket_fd())
    }

    /// When the client wants to run again, if it is sleeping.
    pub fn wake_time(&self) -> Option<Micros> {
        match self.state {
            ClientState::Sleep => Some(self.sleep_until),
            ClientState::Throttle => Some(self.txn_scheduled),
            _ => None,
        }
    }

    fn command_failed(&self, command: &str, message: impl std::fmt::Display) {
        error!(
            "client {} aborted in command {} ({command}) of script {}; {message}",
            self.id, self.command, self.script
        );
    }

    /// Runs the state machine until the client has to wait or is done.
    pub fn advance<'a>(&mut self, w: &mut Worker<'a>) {
        let scripts: &'a ScriptSet = w.scripts;
        let mut now: Option<Micros> = None;

        loop {
            match self.state {
                ClientState::ChooseScript => {
                    self.script = scripts.choose(&mut w.choose_rng);
                    debug_assert!(self.cstack.is_empty());
                    self.status = ErrorStatus::NoError;
                    self.tries = 1;
                    debug!(
                        "client {} executing script \"{}\"",
                        self.id,
                        scripts.get(self.script).description
                    );
                    self.state = if w.timer_exceeded() {
                        ClientState::Finished
                    } else if w.config.throttle_delay.is_some() {
                        ClientState::PrepareThrottle
                    } else {
                        ClientState::StartTx
                    };
                }

                ClientState::StartTx => {
                    let start = clock::now_lazy(&mut now);
                    if self.conn.is_none() {
                        match w.connector.connect() {
                            Ok(conn) => self.set_connection(conn, scripts),
                            Err(e) => {
                                error!(
                                    "client {} aborted while establishing connection: {e}",
                                    self.id
                                );
                                self.state = ClientState::Aborted;
                                continue;
                            }
                        }
                        let connected = clock::now();
                        w.conn_time += connected - start;
                        now = Some(connected);
                    }

                    self.txn_rng = self.rng.clone();
                    self.txn_begin = clock::now_lazy(&mut now);
                    if w.config.throttle_delay.is_none() {
                        self.txn_scheduled = self.txn_begin;
                    }
                    self.command = 0;
                    self.state = ClientState::StartCommand;
                }

                ClientState::PrepareThrottle => {
                    // Poisson-distributed delays around the mean; a late transaction starts right away
                    let delay = w.config.throttle_delay.unwrap_or_default();
                    w.throttle_trigger += w.throttle_rng.poisson(delay);
                    self.txn_scheduled = w.throttle_trigger;

                    // a slot that would miss the latency limit even if it completed instantly is
                    // skipped, and the next one scheduled
                    if let Some(limit) = w.config.latency_limit {
                        let t = clock::now_lazy(&mut now);
                        if w.throttle_trigger < t - limit {
                            self.process_transaction(w, &mut now, true);
                            // under -T, skipped slots are no longer counted once time is up
                            if w.timer_exceeded()
                                || w.config.transactions().is_some_and(|n| self.cnt >= n)
                            {
                                self.state = ClientState::Finished;
                            }
                            continue;
                        }
                    }

                    self.state = if w.end_time.is_some_and(|end| self.txn_scheduled > end) {
                        ClientState::Finished
                    } else {
                        ClientState::Throttle
                    };
                }

                ClientState::Throttle => {
                    if clock::now_lazy(&mut now) < self.txn_scheduled {
                        return;
                    }
                    self.state = if w.timer_exceeded() {
                        ClientState::Finished
                    } else {
                        ClientState::StartTx
                    };
                }

                ClientState::StartCommand => {
                    let script = scripts.get(self.script);
                    let Some(command) = script.commands.get(self.command) else {
                        if self.conn.as_ref().is_some_and(|c| c.in_pipeline()) {
                            self.command_failed("end", "end of script reached with pipeline open");
                            self.state = ClientState::Aborted;
                        } else {
                            self.state = ClientState::EndTx;
                        }
                        continue;
                    };

                    if w.config.report_per_command {
                        self.stmt_begin = clock::now_lazy(&mut now);
                    }

                    match &command.kind {
                        CommandKind::Sql(sql) => self.start_sql(w, sql),
                        CommandKind::Meta(meta) => {
                            self.state = self.execute_meta(w, meta, &mut now);
                            if self.state == ClientState::Aborted {
                                self.status = ErrorStatus::MetaCommand;
                            }
                        }
                    }
                }

                ClientState::WaitResult => {
                    let Some(conn) = self.conn.as_mut() else {
                        self.state = ClientState::Aborted;
                        continue;
                    };
                    // only read from the socket once everything fetched earlier is processed
                    if conn.is_busy() {
                        if let Err(e) = conn.consume_input() {
                            self.command_failed(
                                "SQL",
                                format_args!("perhaps the backend died while processing: {e}"),
                            );
                            self.state = ClientState::Aborted;
                            continue;
                        }
                        if conn.is_busy() {
                            return;
                        }
                    }

                    let capture = scripts
                        .get(self.script)
                        .commands
                        .get(self.command)
                        .and_then(Command::sql)
                        .and_then(|sql| sql.capture.as_ref());
                    let ok = self.read_response(w, capture);
                    now = None;
                    self.state = if ok {
                        if self.conn.as_ref().is_some_and(|c| c.in_pipeline()) {
                            ClientState::WaitResult
                        } else {
                            ClientState::EndCommand
                        }
                    } else if self.status.is_sql_error() {
                        ClientState::Error
                    } else {
                        ClientState::Aborted
                    };
                }

                ClientState::Sleep => {
                    if clock::now_lazy(&mut now) < self.sleep_until {
                        return;
                    }
                    self.state = ClientState::EndCommand;
                }

                ClientState::EndCommand => {
                    if w.config.report_per_command {
                        let t = clock::now_lazy(&mut now);
                        w.command_stats[self.script][self.command]
                            .latency
                            .add((t - self.stmt_begin) as f64);
                    }
                    self.command += 1;
                    self.state = if self.cstack.active() {
                        ClientState::StartCommand
                    } else {
                        ClientState::SkipCommand
                    };
                }

                ClientState::SkipCommand => self.skip_commands(scripts),

                ClientState::Error => {
                    debug_assert!(self.status != ErrorStatus::NoError);
                    self.cstack.clear();
                    self.state = self.handle_error(w, &mut now);
                }

                ClientState::WaitRollbackResult => {
                    let Some(conn) = self.conn.as_mut() else {
                        self.state = ClientState::Aborted;
                        continue;
                    };
                    if let Err(e) = conn.consume_input() {
                        error!(
                            "client {} aborted while rolling back the transaction after an error; \
                             perhaps the backend died while processing: {e}",
                            self.id
                        );
                        self.state = ClientState::Aborted;
                        continue;
                    }
                    if conn.is_busy() {
                        return;
                    }
                    now = None;
                    self.state = match drain_statement(conn.as_mut()) {
                        Ok(results)
                            if results
                                .first()
                                .is_some_and(|r| r.status == ResultStatus::CommandOk) =>
                        {
                            if w.timer_exceeded() {
                                ClientState::Finished
                            } else if self.can_retry(w, &mut now) {
                                ClientState::Retry
                            } else {
                                ClientState::Failure
                            }
                        }
                        Ok(_) => {
                            error!(
                                "client {} aborted while rolling back the transaction after an \
                                 error; {}",
                                self.id,
                                conn.error_message()
                            );
                            ClientState::Aborted
                        }
                        Err(e) => {
                            error!(
                                "client {} aborted while rolling back the transaction after an \
                                 error; {e}",
                                self.id
                            );
                            ClientState::Aborted
                        }
                    };
                }

                ClientState::Retry => {
                    if w.config.verbose_errors {
                        self.report_error_outcome(w, &mut now, true);
                    }
                    self.tries += 1;
                    w.command_stats[self.script][self.command].retries += 1;
                    self.rng = self.txn_rng.clone();
                    self.command = 0;
                    self.status = ErrorStatus::NoError;
                    self.state = ClientState::StartCommand;
                }

                ClientState::Failure => {
                    w.command_stats[self.script][self.command].failures += 1;
                    if w.config.verbose_errors {
                        self.report_error_outcome(w, &mut now, false);
                    }
                    self.state = ClientState::EndTx;
                }

                ClientState::EndTx => {
                    self.process_transaction(w, &mut now, false);
                    debug_assert!(self.cstack.is_empty());

                    // every transaction block opened by the script must be closed by it
                    match self.conn.as_ref().map(|c| c.transaction_status()) {
                        Some(TransactionStatus::Idle) => {}
                        Some(TransactionStatus::InTransaction | TransactionStatus::InError) => {
                            error!(
                                "client {} aborted: end of script reached without completing the \
                                 last transaction",
                                self.id
                            );
                            self.state = ClientState::Aborted;
                            continue;
                        }
                        _ => {
                            error!(
                                "client {} aborted while receiving the transaction status",
                                self.id
                            );
                            self.state = ClientState::Aborted;
                            continue;
                        }
                    }

                    if w.config.connect_per_tx {
                        let start = clock::now_lazy(&mut now);
                        self.disconnect();
                        let closed = clock::now();
                        w.conn_time += closed - start;
                        now = Some(closed);
                    }

                    if w.timer_exceeded()
                        || w.config.transactions().is_some_and(|n| self.cnt >= n)
                    {
                        self.state = ClientState::Finished;
                        continue;
                    }

                    // always yield here so a script of only meta-commands cannot starve the
                    // other clients
                    self.state = ClientState::ChooseScript;
                    return;
                }

                ClientState::Aborted | ClientState::Finished => {
                    self.disconnect();
                    return;
                }
            }
        }
    }

    fn start_sql(&mut self, w: &Worker<'_>, sql: &SqlCommand) {
        let in_pipeline = self.conn.as_ref().is_some_and(|c| c.in_pipeline());
        if in_pipeline {
            if let Some(capture) = &sql.capture {
                let name = match capture.kind {
                    CaptureKind::Gset => "gset",
                    CaptureKind::Aset => "aset",
                };
                self.command_failed(
                    name,
                    format_args!("\\{name} is not allowed in pipeline mode"),
                );
                self.state = ClientState::Aborted;
                return;
            }
        }

        match self.send_command(w.config.mode, sql) {
            Ok(()) if in_pipeline => self.state = ClientState::EndCommand,
            Ok(()) => self.state = ClientState::WaitResult,
            Err(e) => {
                debug!("client {} could not send {}: {e}", self.id, sql.text);
                self.command_failed("SQL", "SQL command send failed");
                self.state = ClientState::Aborted;
            }
        }
    }

    fn send_command(&mut self, mode: QueryMode, sql: &SqlCommand) -> Result<(), ClientError> {
        if mode == QueryMode::Prepared {
            self.prepare_command(self.script, self.command, sql);
        }
        let conn = self.conn.as_mut().ok_or(ClientError::Closed)?;
        match mode {
            QueryMode::Simple => {
                let text = sql.substitute(&self.variables);
                debug!("client {} sending {text}", self.id);
                conn.send_simple(&text)
            }
            QueryMode::Extended => {
                let params = sql.bind(&self.variables);
                let params = params.iter().map(Option::as_deref).collect::<Vec<_>>();
                debug!("client {} sending {}", self.id, sql.text);
                conn.send_extended(&sql.text, &params)
            }
            QueryMode::Prepared => {
                let params = sql.bind(&self.variables);
                let params = params.iter().map(Option::as_deref).collect::<Vec<_>>();
                debug!("client {} sending {}", self.id, sql.prepared_name);
                conn.send_prepared(&sql.prepared_name, &params)
            }
        }
    }

    /// Prepares a statement on the current connection unless that was done already. Failures
    /// are reported and surface again when the statement is executed.
    fn prepare_command(&mut self, script: usize, command: usize, sql: &SqlCommand) {
        if self.prepared[script][command] {
            return;
        }
        if let Some(conn) = self.conn.as_mut() {
            if let Err(e) = conn.prepare(&sql.prepared_name, &sql.text) {
                error!("client {} could not prepare {}: {e}", self.id, sql.prepared_name);
            }
        }
        self.prepared[script][command] = true;
    }

    /// Prepares every statement between the current `\startpipeline` and its `\endpipeline`,
    /// so that no preparation happens inside the pipeline.
    fn prepare_pipeline(&mut self, scripts: &ScriptSet) {
        let script = self.script;
        if self.prepared[script][self.command] {
            return;
        }
        let commands = &scripts.get(script).commands;
        for (i, command) in commands.iter().enumerate().skip(self.command + 1) {
            match &command.kind {
                CommandKind::Meta(Meta::EndPipeline) => break,
                CommandKind::Sql(sql) => self.prepare_command(script, i, sql),
                CommandKind::Meta(_) => {}
            }
        }
        self.prepared[script][self.command] = true;
    }

    fn evaluate(&mut self, expr: &Expr) -> Result<Value, EvalError> {
        let mut ctx = EvalContext {
            variables: &mut self.variables,
            rng: &mut self.rng,
            location: (self.script, self.command),
        };
        expr.evaluate(&mut ctx)
    }

    fn sleep_amount(&self, duration: &SleepDuration) -> Result<i64, String> {
        match duration {
            SleepDuration::Literal(n) => Ok(*n),
            SleepDuration::Variable(name) => {
                let value = self
                    .variables
                    .get_string(name)
                    .ok_or_else(|| format!("undefined variable \"{name}\""))?;
                let n = value
                    .trim()
                    .parse::<i64>()
                    .map_err(|_| format!("invalid sleep time \"{value}\""))?;
                Ok(n.max(0))
            }
        }
    }

    fn execute_meta<'a>(
        &mut self,
        w: &mut Worker<'a>,
        meta: &Meta,
        now: &mut Option<Micros>,
    ) -> ClientState {
        let scripts: &'a ScriptSet = w.scripts;
        match meta {
            Meta::Sleep { duration, unit } => {
                // the time spent sleeping is accounted for by the Sleep state
                let amount = match self.sleep_amount(duration) {
                    Ok(amount) => amount,
                    Err(message) => {
                        self.command_failed("sleep", message);
                        return ClientState::Aborted;
                    }
                };
                self.sleep_until = clock::now_lazy(now) + amount.saturating_mul(unit.micros());
                return ClientState::Sleep;
            }

            Meta::Set { variable, expr } => {
                let result = self
                    .evaluate(expr)
                    .and_then(|value| self.variables.set_value(variable, value));
                if let Err(e) = result {
                    self.command_failed("set", e);
                    return ClientState::Aborted;
                }
            }

            Meta::If(expr) => {
                let mut ctx = EvalContext {
                    variables: &mut self.variables,
                    rng: &mut self.rng,
                    location: (self.script, self.command),
                };
                if let Err(e) = self
                    .cstack
                    .enter_if(|| expr.evaluate(&mut ctx).map(|v| v.truth()))
                {
                    self.command_failed("if", e);
                    return ClientState::Aborted;
                }
            }

            Meta::Elif(expr) => {
                let mut ctx = EvalContext {
                    variables: &mut self.variables,
                    rng: &mut self.rng,
                    location: (self.script, self.command),
                };
                if let Err(e) = self
                    .cstack
                    .enter_elif(|| expr.evaluate(&mut ctx).map(|v| v.truth()))
                {
                    self.command_failed("elif", e);
                    return ClientState::Aborted;
                }
            }

            Meta::Else => self.cstack.enter_else(),

            Meta::Endif => self.cstack.exit(),

            Meta::SetShell { variable, command } => {
                let result = shell::command_line(command, &self.variables)
                    .and_then(|line| shell::run_for_integer(&line));
                match result {
                    Ok(n) => {
                        if let Err(e) = self.variables.set_int(variable, n) {
                            self.command_failed("setshell", e);
                            return ClientState::Aborted;
                        }
                        debug!("setshell: shell parameter name: \"{variable}\", value: \"{n}\"");
                    }
                    Err(e) => {
                        if !w.timer_exceeded() {
                            error!("{e}");
                        }
                        self.command_failed("setshell", "execution of meta-command failed");
                        return ClientState::Aborted;
                    }
                }
            }

            Meta::Shell { command } => {
                let result = shell::command_line(command, &self.variables)
                    .and_then(|line| shell::run(&line));
                if let Err(e) = result {
                    if !w.timer_exceeded() {
                        error!("{e}");
                    }
                    self.command_failed("shell", "execution of meta-command failed");
                    return ClientState::Aborted;
                }
            }

            Meta::StartPipeline => {
                if w.config.mode == QueryMode::Simple {
                    self.command_failed(
                        "startpipeline",
                        "cannot use pipeline mode with the simple query protocol",
                    );
                    return ClientState::Aborted;
                }
                // statements are prepared before entering the pipeline, so that e.g. a
                // serializable BEGIN inside it is not preceded by a snapshot-taking prepare
                if w.config.mode == QueryMode::Prepared {
                    self.prepare_pipeline(scripts);
                }
                let Some(conn) = self.conn.as_mut() else {
                    return ClientState::Aborted;
                };
                if conn.in_pipeline() {
                    self.command_failed("startpipeline", "already in pipeline mode");
                    return ClientState::Aborted;
                }
                if let Err(e) = conn.enter_pipeline() {
                    self.command_failed(
                        "startpipeline",
                        format_args!("failed to enter pipeline mode: {e}"),
                    );
                    return ClientState::Aborted;
                }
            }

            Meta::SyncPipeline => {
                let Some(conn) = self.conn.as_mut() else {
                    return ClientState::Aborted;
                };
                if !conn.in_pipeline() {
                    self.command_failed("syncpipeline", "not in pipeline mode");
                    return ClientState::Aborted;
                }
                if let Err(e) = conn.send_pipeline_sync() {
                    self.command_failed(
                        "syncpipeline",
                        format_args!("failed to send a pipeline sync: {e}"),
                    );
                    return ClientState::Aborted;
                }
                self.pending_syncs += 1;
            }

            Meta::EndPipeline => {
                let Some(conn) = self.conn.as_mut() else {
                    return ClientState::Aborted;
                };
                if !conn.in_pipeline() {
                    self.command_failed("endpipeline", "not in pipeline mode");
                    return ClientState::Aborted;
                }
                if let Err(e) = conn.pipeline_sync() {
                    self.command_failed(
                        "endpipeline",
                        format_args!("failed to send a pipeline sync: {e}"),
                    );
                    return ClientState::Aborted;
                }
                self.pending_syncs += 1;
                // collect everything before leaving pipeline mode
                return ClientState::WaitResult;
            }
        }

        // evaluating expressions or running shell commands may have taken a while
        *now = None;
        ClientState::EndCommand
    }

    /// Moves past the commands of inactive conditional branches, up to the next command that
    /// has to be executed.
    fn skip_commands(&mut self, scripts: &ScriptSet) {
        let commands = &scripts.get(self.script).commands;
        while self.state == ClientState::SkipCommand {
            let Some(command) = commands.get(self.command) else {
                // balanced conditionals are checked when parsing
                self.state = ClientState::StartCommand;
                break;
            };
            match command.meta() {
                Some(Meta::If(_)) => {
                    self.cstack.push(IfState::Ignored);
                    self.command += 1;
                }
                Some(Meta::Elif(_)) => {
                    if self.cstack.peek() == IfState::False {
                        // the condition has to be evaluated
                        self.state = ClientState::StartCommand;
                    } else {
                        self.command += 1;
                    }
                }
                Some(Meta::Else) => {
                    if self.cstack.peek() == IfState::False {
                        self.cstack.poke(IfState::ElseTrue);
                        self.state = ClientState::StartCommand;
                    }
                    self.command += 1;
                }
                Some(Meta::Endif) => {
                    self.cstack.pop();
                    if self.cstack.active() {
                        self.state = ClientState::StartCommand;
                    }
                    self.command += 1;
                }
                _ => self.command += 1,
            }
        }
    }

    /// Collects the results of one statement (or, in a pipeline, of the next queued statement or
    /// sync) and stores them into variables as `capture` asks. Returns false on an error, with
    /// `status` set when the server reported it.
    fn read_response(&mut self, w: &Worker<'_>, capture: Option<&Capture>) -> bool {
        let Some(conn) = self.conn.as_mut() else {
            return false;
        };
        let results = match drain_statement(conn.as_mut()) {
            Ok(results) => results,
            Err(e) => {
                error!(
                    "client {} aborted in command {} of script {}; perhaps the backend died \
                     while processing: {e}",
                    self.id, self.command, self.script
                );
                return false;
            }
        };
        if results.is_empty() {
            error!(
                "client {} script {} command {}: no results",
                self.id, self.script, self.command
            );
            return false;
        }

        let last = results.len() - 1;
        for (i, res) in results.iter().enumerate() {
            match res.status {
                ResultStatus::CommandOk | ResultStatus::EmptyQuery => {
                    if i == last && capture.is_some_and(|c| c.kind == CaptureKind::Gset) {
                        error!(
                            "client {} script {} command {} query {i}: expected one row, got 0",
                            self.id, self.script, self.command
                        );
                        self.status = ErrorStatus::MetaCommand;
                        return false;
                    }
                }

                ResultStatus::TuplesOk => {
                    let Some(capture) = capture else { continue };
                    if capture.kind == CaptureKind::Gset && i != last {
                        continue;
                    }
                    let rows = res.ntuples();
                    if capture.kind == CaptureKind::Gset && rows != 1 {
                        error!(
                            "client {} script {} command {} query {i}: expected one row, got \
                             {rows}",
                            self.id, self.script, self.command
                        );
                        self.status = ErrorStatus::MetaCommand;
                        return false;
                    }
                    if rows == 0 {
                        // \aset quietly ignores empty results
                        continue;
                    }
                    for (col, name) in res.columns.iter().enumerate() {
                        let variable = format!("{}{name}", capture.prefix);
                        let stored = match res.value(rows - 1, col) {
                            Some(v) => self.variables.set_string(&variable, v),
                            None => self.variables.set_value(&variable, Value::Null),
                        };
                        if let Err(e) = stored {
                            error!(
                                "client {} script {} command {} query {i}: error storing into \
                                 variable {variable}: {e}",
                                self.id, self.script, self.command
                            );
                            self.status = ErrorStatus::MetaCommand;
                            return false;
                        }
                    }
                }

                ResultStatus::PipelineSync => {
                    self.pending_syncs = self.pending_syncs.saturating_sub(1);
                    if self.pending_syncs == 0 {
                        if let Err(e) = conn.exit_pipeline() {
                            error!("client {} failed to exit pipeline mode: {e}", self.id);
                        }
                    }
                }

                ResultStatus::PipelineAborted => {
                    error!(
                        "client {} pipeline aborted in command {}: {}",
                        self.id,
                        self.command,
                        conn.error_message()
                    );
                    return false;
                }

                ResultStatus::NonfatalError | ResultStatus::FatalError => {
                    self.status = ErrorStatus::from_sqlstate(res.sqlstate.as_deref());
                    let message = res.message.as_deref().unwrap_or_default();
                    if w.config.verbose_errors {
                        info!(
                            "client {} got an error in command {} (SQL) of script {}; {message}",
                            self.id, self.command, self.script
                        );
                    } else {
                        debug!(
                            "client {} got an error in command {} (SQL) of script {}; {message}",
                            self.id, self.command, self.script
                        );
                    }
                    return false;
                }
            }
        }
        true
    }

    /// Decides what follows an error: rollback of an open transaction block, a retry, or a
    /// failure.
    fn handle_error(&mut self, w: &Worker<'_>, now: &mut Option<Micros>) -> ClientState {
        if self.conn.as_ref().is_some_and(|c| c.in_pipeline()) {
            if let Err(e) = self.discard_until_sync() {
                error!(
                    "client {} aborted: failed to leave pipeline mode after an error: {e}",
                    self.id
                );
                return ClientState::Aborted;
            }
        }

        let Some(conn) = self.conn.as_mut() else {
            return ClientState::Aborted;
        };
        match conn.transaction_status() {
            TransactionStatus::InTransaction | TransactionStatus::InError => {
                match conn.send_simple("ROLLBACK") {
                    Ok(()) => ClientState::WaitRollbackResult,
                    Err(e) => {
                        error!(
                            "client {} aborted: failed to send sql command for rolling back the \
                             failed transaction: {e}",
                            self.id
                        );
                        ClientState::Aborted
                    }
                }
            }
            TransactionStatus::Idle => {
                if w.timer_exceeded() {
                    ClientState::Finished
                } else if self.can_retry(w, now) {
                    ClientState::Retry
                } else {
                    ClientState::Failure
                }
            }
            status => {
                if status == TransactionStatus::Unknown {
                    error!("perhaps the backend died while processing");
                }
                error!(
                    "client {} aborted while receiving the transaction status",
                    self.id
                );
                ClientState::Aborted
            }
        }
    }

    /// Sends a sync and throws away every result up to the acknowledgement of the last
    /// outstanding sync, then leaves pipeline mode.
    fn discard_until_sync(&mut self) -> Result<(), ClientError> {
        let conn = self.conn.as_mut().ok_or(ClientError::Closed)?;
        conn.pipeline_sync()?;
        self.pending_syncs += 1;
        while self.pending_syncs > 0 {
            match conn.get_result()? {
                Some(res) if res.status == ResultStatus::PipelineSync => {
                    self.pending_syncs -= 1;
                }
                Some(_) => {}
                None if conn.transaction_status() == TransactionStatus::Active => {}
                None => {
                    return Err(ClientError::InvalidState(
                        "pipeline sync was never acknowledged",
                    ))
                }
            }
        }
        // the end marker following the last sync
        while conn.get_result()?.is_some() {}
        conn.exit_pipeline()
    }

    /// Whether the failed try may be repeated: only serialization and deadlock errors are, and
    /// only while no budget (tries, latency limit, duration) is exhausted.
    fn can_retry(&self, w: &Worker<'_>, now: &mut Option<Micros>) -> bool {
        if !self.status.is_retriable() {
            return false;
        }
        let max_tries = w.config.max_tries;
        if max_tries != 0 && self.tries >= max_tries {
            return false;
        }
        if let Some(limit) = w.config.latency_limit {
            if clock::now_lazy(now) - self.txn_scheduled > limit {
                return false;
            }
        }
        !w.timer_exceeded()
    }

    fn report_error_outcome(&self, w: &Worker<'_>, now: &mut Option<Micros>, retry: bool) {
        let mut note = format!(
            "client {} {} (try {}",
            self.id,
            if retry {
                "repeats the transaction after the error"
            } else {
                "ends the failed transaction"
            },
            self.tries
        );
        if w.config.max_tries != 0 {
            let _ = write!(note, "/{}", w.config.max_tries);
        }
        if let Some(limit) = w.config.latency_limit {
            let used = clock::now_lazy(now) - self.txn_scheduled;
            let _ = write!(
                note,
                ", {:.3}% of the maximum time of tries was used",
                100.0 * used as f64 / limit as f64
            );
        }
        note.push(')');
        info!("{note}");
    }

    /// Accounts for a finished or skipped transaction.
    fn process_transaction(&mut self, w: &mut Worker<'_>, now: &mut Option<Micros>, skipped: bool) {
        let (mut latency, mut lag) = (0.0, 0.0);
        if !skipped && self.status == ErrorStatus::NoError {
            // latency includes the schedule lag under throttling
            let t = clock::now_lazy(now);
            latency = (t - self.txn_scheduled) as f64;
            lag = (self.txn_begin - self.txn_scheduled) as f64;
        }
        self.cnt += 1;
        w.record_transaction(TxOutcome {
            client: self.id,
            client_cnt: self.cnt,
            script: self.script,
            now: clock::now_lazy(now),
            latency,
            lag,
            skipped,
            status: self.status,
            tries: self.tries,
        });
    }
}

fn unprepared(scripts: &ScriptSet) -> Vec<Vec<bool>> {
    scripts
        .scripts()
        .iter()
        .map(|s| vec![false; s.commands.len()])
        .collect()
}

/// Reads every result of the next statement, up to the end marker.
fn drain_statement(
    conn: &mut dyn Connection,
) -> Result<Vec<txbench_client::QueryResult>, ClientError> {
    let mut results = vec![];
    while let Some(res) = conn.get_result()? {
        results.push(res);
    }
    Ok(results)
}
