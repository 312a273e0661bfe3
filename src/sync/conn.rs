//! Synchronous SingleStore connection.

use std::collections::VecDeque;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, trace, warn};

use crate::auth::{Credential, with_sso_retry};
use crate::batch::{BatchCollector, BatchOutcome, BatchStrategy, select_strategy};
use crate::constant::CapabilityFlags;
use crate::error::{Error, Result};
use crate::opts::Opts;
use crate::protocol::command::{Command, write_execute};
use crate::protocol::query::names_local_file;
use crate::protocol::response::Row;
use crate::state::context::{SingleStoreVersion, StateFlags, reset_plan};
use crate::state::{
    Action, Completion, HandshakeOutcome, HandshakeStateMachine, ReadStep, Response, ResultReader,
    SessionContext, SessionProperty,
};
use crate::statement::{PreparedStatement, StatementOptions};
use crate::value::Value;

use super::cancel::{self, Watchdog};
use super::channel::{Channel, SequenceMark};
use super::stream::{SocketKiller, Stream};

/// Chunk size for LOCAL INFILE uploads.
const LOCAL_INFILE_CHUNK: usize = 1024 * 1024;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared with the timeout watcher, readable without the connection lock.
#[derive(Debug, Default)]
pub(crate) struct Control {
    closed: AtomicBool,
    timed_out: AtomicBool,
    thread_id: AtomicU32,
    killer: Mutex<Option<SocketKiller>>,
}

impl Control {
    fn attach(&self, channel: &Channel, thread_id: u32) {
        self.thread_id.store(thread_id, Ordering::SeqCst);
        *lock(&self.killer) = channel.killer();
    }

    pub(crate) fn thread_id(&self) -> u32 {
        self.thread_id.load(Ordering::SeqCst)
    }

    pub(crate) fn timed_out(&self) -> bool {
        self.timed_out.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_timed_out(&self) {
        self.timed_out.store(true, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Shut the socket down under a thread blocked on it.
    pub(crate) fn kill_socket(&self) {
        if let Some(killer) = lock(&self.killer).as_ref() {
            killer.kill();
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionClosed {
                timed_out: self.timed_out(),
            });
        }
        Ok(())
    }
}

/// Chunk of a streaming result set.
#[derive(Debug)]
pub enum Streamed {
    /// Next rows of the streaming result set
    Rows(Vec<Row>),
    /// The response is complete. The first completion is the streamed result
    /// set with its remaining rows, followed by any later results.
    End(Vec<Completion>),
}

#[derive(Debug)]
struct PendingStream {
    reader: ResultReader,
    command: Command,
}

/// Everything guarded by the connection lock.
#[derive(Debug)]
pub(crate) struct ConnInner {
    channel: Channel,
    ctx: SessionContext,
    opts: Arc<Opts>,
    control: Arc<Control>,
    streaming: Option<PendingStream>,
    /// Commands sent with `send_one` whose responses were not read yet
    unread: VecDeque<(Command, SequenceMark)>,
    infile_error: Option<Error>,
}

impl ConnInner {
    /// Open a session. `setup` runs the post-connection commands; auxiliary
    /// connections used to kill a query skip them.
    pub(crate) fn connect(opts: Arc<Opts>, control: Arc<Control>, setup: bool) -> Result<Self> {
        let provider = opts.credential_provider.as_deref();
        let (channel, outcome) = with_sso_retry(provider, || handshake(&opts))?;
        control.attach(&channel, outcome.thread_id);
        let ctx = SessionContext::new(&outcome, &opts);

        let mut inner = Self {
            channel,
            ctx,
            opts,
            control,
            streaming: None,
            unread: VecDeque::new(),
            infile_error: None,
        };
        if setup {
            if let Err(e) = inner.initialize() {
                inner.channel.close();
                return Err(Error::connection("Initialization command fail", Some(e)));
            }
        }
        Ok(inner)
    }

    fn initialize(&mut self) -> Result<()> {
        let opts = Arc::clone(&self.opts);
        let mut commands = Vec::new();
        if !opts.session_variables.is_empty() {
            let assignments: Vec<String> = opts
                .session_variables
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect();
            commands.push(Command::Query(format!("set {}", assignments.join(","))));
        }
        if let Some(level) = opts.transaction_isolation {
            commands.extend(SessionProperty::TransactionIsolation(level).command());
        }
        if let Some(autocommit) = opts.autocommit {
            commands.extend(SessionProperty::Autocommit(autocommit).command());
        }
        if opts.create_database_if_not_exist {
            if let Some(database) = &opts.database {
                let quoted = quote_identifier(database);
                commands.push(Command::Query(format!(
                    "CREATE DATABASE IF NOT EXISTS {quoted}"
                )));
                commands.push(Command::Query(format!("USE {quoted}")));
            }
        }
        commands.extend(opts.init_sql.iter().cloned().map(Command::Query));
        commands.push(Command::Query(
            "SELECT @@max_allowed_packet, @@wait_timeout".into(),
        ));

        let (_, completions) = self.run_batch(commands, StatementOptions::default())?;
        let cells = first_row(&completions)?;
        let number = |i: usize| {
            cells
                .get(i)
                .cloned()
                .flatten()
                .and_then(|text| text.parse::<u64>().ok())
        };
        if self.ctx.max_allowed_packet.is_none() {
            self.ctx.max_allowed_packet = number(0).and_then(|v| usize::try_from(v).ok());
        }
        self.ctx.wait_timeout = number(1);
        debug!(
            max_allowed_packet = ?self.ctx.max_allowed_packet,
            wait_timeout = ?self.ctx.wait_timeout,
            "session initialized"
        );
        Ok(())
    }

    /// Best-effort COM_QUIT, then close the socket.
    pub(crate) fn quit(&mut self) {
        if !self.channel.is_closed() {
            let _ = self.send(&Command::Quit);
            self.channel.close();
        }
    }

    fn loggable<'a>(&self, text: &'a str) -> &'a str {
        let max = self.opts.max_query_size_to_log;
        if text.len() <= max {
            return text;
        }
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.get(..end).unwrap_or_default()
    }

    /// Write one command. Returns the mark its response is read from.
    fn send(&mut self, command: &Command) -> Result<SequenceMark> {
        debug!(
            thread_id = self.ctx.thread_id,
            command = self.loggable(&command.description()),
            "send"
        );
        self.channel.reset_sequence();
        let no_backslash_escapes = self.ctx.no_backslash_escapes();
        let server_id = match command {
            Command::Execute { handle, .. } => Some(
                self.ctx
                    .prepare_cache
                    .server_id(*handle)
                    .ok_or_else(|| Error::InvalidUsage("prepared statement is closed".into()))?,
            ),
            _ => None,
        };

        let buffers = self.channel.buffers();
        buffers.write_buffer.clear();
        match (command, server_id) {
            (Command::Execute { params, .. }, Some(id)) => {
                write_execute(&mut buffers.write_buffer, id, params)?;
            }
            _ => command.encode(&mut buffers.write_buffer, no_backslash_escapes)?,
        }
        self.channel.write_packet(self.ctx.max_allowed_packet)?;

        if let Some(redo) = self.ctx.redo.as_mut() {
            redo.record(command);
        }
        Ok(self.channel.mark())
    }

    fn write_raw(&mut self, payload: &[u8]) -> Result<()> {
        let buffers = self.channel.buffers();
        buffers.write_buffer.clear();
        buffers.write_buffer.extend_from_slice(payload);
        self.channel.write_packet(None)
    }

    /// Feed packets to `reader` until it suspends or completes.
    fn read_until(&mut self, reader: &mut ResultReader, command: &Command) -> Result<ReadStep> {
        while !reader.is_done() {
            self.channel.read_packet()?;
            let step = reader.step(&self.channel.buffers().read_buffer, &mut self.ctx)?;
            match step {
                ReadStep::NeedPacket | ReadStep::Done => {}
                ReadStep::Suspended => return Ok(ReadStep::Suspended),
                ReadStep::LocalInfile(name) => self.send_local_file(command, &name)?,
            }
        }
        Ok(ReadStep::Done)
    }

    /// Answer a LOCAL INFILE request. The file is only sent when enabled and
    /// named by the statement itself; the empty terminator is always sent.
    fn send_local_file(&mut self, command: &Command, name: &str) -> Result<()> {
        let no_backslash_escapes = self.ctx.no_backslash_escapes();
        let named = command
            .sql()
            .is_some_and(|sql| names_local_file(sql, name, no_backslash_escapes));

        let refused = if !self.opts.allow_local_infile {
            Some("LOCAL INFILE is disabled; enable it with allow_local_infile".to_owned())
        } else if !named {
            Some(format!(
                "LOCAL INFILE asked for file {name} that does not match the query"
            ))
        } else {
            None
        };
        if let Some(reason) = refused {
            warn!(file = name, "refusing LOCAL INFILE request");
            self.infile_error = Some(Error::InvalidUsage(reason));
            return self.write_raw(&[]);
        }

        debug!(file = name, "sending local file");
        if let Err(e) = self.stream_file(name) {
            if e.is_connection_broken() {
                return Err(e);
            }
            self.infile_error = Some(e);
        }
        self.write_raw(&[])
    }

    fn stream_file(&mut self, name: &str) -> Result<()> {
        let unreadable =
            |e: std::io::Error| Error::InvalidUsage(format!("could not read local file {name}: {e}"));
        let mut file = std::fs::File::open(name).map_err(unreadable)?;
        let mut chunk = vec![0_u8; LOCAL_INFILE_CHUNK];
        loop {
            let n = file.read(&mut chunk).map_err(unreadable)?;
            let Some(data) = chunk.get(..n).filter(|data| !data.is_empty()) else {
                return Ok(());
            };
            let buffers = self.channel.buffers();
            buffers.write_buffer.clear();
            buffers.write_buffer.extend_from_slice(data);
            self.channel.write_packet(None)?;
        }
    }

    fn finish_response(&mut self, reader: ResultReader) -> Result<Response> {
        let result = reader.finish()?;
        let in_transaction = self.ctx.in_transaction();
        if let Some(redo) = self.ctx.redo.as_mut() {
            redo.observe(in_transaction);
        }
        if let Some(e) = self.infile_error.take() {
            return Err(e);
        }
        result.map_err(Error::Server)
    }

    /// Read the response of `command`, which was written at `mark`.
    fn read_for(
        &mut self,
        command: &Command,
        mark: SequenceMark,
        options: StatementOptions,
    ) -> Result<Response> {
        self.channel.restore(mark);
        let mut reader = ResultReader::new(command, self.ctx.deprecate_eof(), options);
        match self.read_until(&mut reader, command)? {
            ReadStep::Suspended => {
                let mut completions = reader.take_completions();
                completions.extend(reader.take_partial().map(Completion::ResultSet));
                self.streaming = Some(PendingStream {
                    reader,
                    command: command.clone(),
                });
                Ok(Response::Completions(completions))
            }
            _ => self.finish_response(reader),
        }
    }

    /// Register a freshly prepared statement in the cache.
    fn complete(&mut self, response: Response) -> Result<Response> {
        let Response::Prepared(statement) = response else {
            return Ok(response);
        };
        let (statement, evicted) = self.ctx.prepare_cache.insert(statement);
        for id in evicted {
            self.send(&Command::CloseStatement(id))?;
        }
        Ok(Response::Prepared(statement))
    }

    fn execute_once(&mut self, command: &Command, options: StatementOptions) -> Result<Response> {
        let mark = self.send(command)?;
        let response = self.read_for(command, mark, options)?;
        self.complete(response)
    }

    /// Finish a pending streaming result, dropping its remaining rows.
    fn settle_streaming(&mut self) -> Result<()> {
        let Some(mut pending) = self.streaming.take() else {
            return Ok(());
        };
        debug!("discarding the rest of a streaming result");
        pending.reader.discard();
        self.read_until(&mut pending.reader, &pending.command)?;
        match self.finish_response(pending.reader) {
            Err(e) if e.is_connection_broken() => Err(e),
            Err(e) => {
                debug!(error = %e, "error at the end of a discarded result");
                Ok(())
            }
            Ok(_) => Ok(()),
        }
    }

    /// Bring the connection to a state where a new command can be sent and
    /// its response read next.
    fn settle(&mut self) -> Result<()> {
        self.settle_streaming()?;
        while let Some((command, mark)) = self.unread.pop_front() {
            self.channel.restore(mark);
            let mut reader =
                ResultReader::new(&command, self.ctx.deprecate_eof(), StatementOptions::default());
            reader.discard();
            self.read_until(&mut reader, &command)?;
            match self.finish_response(reader).and_then(|r| self.complete(r)) {
                Err(e) if e.is_connection_broken() => return Err(e),
                Err(e) => debug!(error = %e, "error in an unread response"),
                Ok(Response::Prepared(statement)) => {
                    if let Some(id) = self.ctx.prepare_cache.release(statement.handle) {
                        self.send(&Command::CloseStatement(id))?;
                    }
                }
                Ok(_) => {}
            }
        }
        Ok(())
    }

    pub(crate) fn execute(
        &mut self,
        command: &Command,
        options: StatementOptions,
    ) -> Result<Response> {
        self.settle()?;
        match self.execute_once(command, options) {
            Err(e) if self.can_replay(command, &e) => {
                warn!(error = %e, "connection lost inside a transaction, replaying on a new connection");
                self.failover(command)?;
                self.execute_once(command, options)
            }
            result => result,
        }
    }

    fn send_one(&mut self, command: Command) -> Result<usize> {
        self.settle_streaming()?;
        let mark = self.send(&command)?;
        let expected = command.expected_responses();
        if expected > 0 {
            self.unread.push_back((command, mark));
        }
        Ok(expected)
    }

    fn read_response(&mut self, options: StatementOptions) -> Result<Response> {
        self.settle_streaming()?;
        let (command, mark) = self
            .unread
            .pop_front()
            .ok_or_else(|| Error::InvalidUsage("no response is pending".into()))?;
        let response = self.read_for(&command, mark, options)?;
        self.complete(response)
    }

    fn read_streaming(&mut self) -> Result<Streamed> {
        let mut pending = self
            .streaming
            .take()
            .ok_or_else(|| Error::InvalidUsage("no streaming result is pending".into()))?;
        match self.read_until(&mut pending.reader, &pending.command)? {
            ReadStep::Suspended => {
                let rows = pending.reader.take_rows();
                self.streaming = Some(pending);
                Ok(Streamed::Rows(rows))
            }
            _ => Ok(Streamed::End(
                self.finish_response(pending.reader)?.into_completions(),
            )),
        }
    }

    /// Send every command, pipelined when allowed, collecting per-item outcomes.
    fn run_batch(
        &mut self,
        commands: Vec<Command>,
        options: StatementOptions,
    ) -> Result<(Vec<BatchOutcome>, Vec<Completion>)> {
        self.settle()?;
        let options = StatementOptions {
            fetch_size: 0,
            ..options
        };
        let mut collector = BatchCollector::new();
        let strategy = select_strategy(self.opts.disable_pipeline, self.ctx.local_infile());
        trace!(?strategy, commands = commands.len(), "batch");

        match strategy {
            BatchStrategy::Sequential => {
                for command in &commands {
                    match self.execute_once(command, options) {
                        Ok(response) => collector.success(response.into_completions()),
                        Err(e) => {
                            let broken = e.is_connection_broken();
                            collector.failure(e);
                            if broken {
                                break;
                            }
                        }
                    }
                }
            }
            BatchStrategy::Pipelined => {
                let mut marks = Vec::with_capacity(commands.len());
                for command in &commands {
                    match self.send(command) {
                        Ok(mark) => marks.push(mark),
                        Err(e) => {
                            collector.abort(e);
                            break;
                        }
                    }
                }
                for (command, mark) in commands.iter().zip(marks) {
                    let response = self
                        .read_for(command, mark, options)
                        .and_then(|r| self.complete(r));
                    match response {
                        Ok(response) => collector.success(response.into_completions()),
                        Err(e) => {
                            let broken = e.is_connection_broken();
                            collector.failure(e);
                            if broken {
                                break;
                            }
                        }
                    }
                }
            }
        }
        collector.finish()
    }

    fn prepare(&mut self, sql: &str) -> Result<PreparedStatement> {
        if let Some(statement) = self.ctx.prepare_cache.acquire(sql) {
            trace!(statement_id = statement.id(), "prepare cache hit");
            return Ok(statement);
        }
        match self.execute(&Command::Prepare(Arc::from(sql)), StatementOptions::default())? {
            Response::Prepared(statement) => Ok(statement),
            _ => Err(Error::Protocol("expected a COM_STMT_PREPARE response".into())),
        }
    }

    fn close_statement(&mut self, statement: &PreparedStatement) -> Result<()> {
        if let Some(id) = self.ctx.prepare_cache.release(statement.handle) {
            self.settle_streaming()?;
            self.send(&Command::CloseStatement(id))?;
        }
        Ok(())
    }

    fn execute_batch(&mut self, sql: &str, param_sets: Vec<Vec<Value>>) -> Result<Vec<BatchOutcome>> {
        if !self.opts.use_server_prepare {
            let sql: Arc<str> = Arc::from(sql);
            let commands = param_sets
                .into_iter()
                .map(|params| Command::ClientPrepared {
                    sql: Arc::clone(&sql),
                    params,
                })
                .collect();
            let (outcomes, _) = self.run_batch(commands, StatementOptions::default())?;
            return Ok(outcomes);
        }

        let statement = self.prepare(sql)?;
        let commands = param_sets
            .into_iter()
            .map(|params| statement.execute(params))
            .collect();
        let result = self.run_batch(commands, StatementOptions::default());
        let released = self.close_statement(&statement);
        let (outcomes, _) = result?;
        released?;
        Ok(outcomes)
    }

    fn apply_property(&mut self, property: &SessionProperty) -> Result<()> {
        if let Some(command) = property.command() {
            self.execute(&command, StatementOptions::default())?;
        }
        if let SessionProperty::NetworkTimeout(timeout) = property {
            self.channel.set_timeouts(*timeout)?;
        }
        Ok(())
    }

    /// SingleStore version of the server, asked for once per session.
    fn singlestore_version(&mut self) -> Result<Option<SingleStoreVersion>> {
        if let Some(version) = self.ctx.singlestore_version {
            return Ok(version);
        }
        let command = Command::Query("SELECT @@memsql_version".into());
        let version = match self.execute_once(&command, StatementOptions::default()) {
            Ok(response) => first_row(&response.into_completions())?
                .into_iter()
                .next()
                .flatten()
                .and_then(|text| SingleStoreVersion::parse(&text)),
            Err(e) if e.is_connection_broken() => return Err(e),
            Err(e) => {
                debug!(error = %e, "server did not report a SingleStore version");
                None
            }
        };
        debug!(version = ?version, "SingleStore version");
        self.ctx.singlestore_version = Some(version);
        Ok(version)
    }

    fn reset(&mut self) -> Result<()> {
        self.settle()?;
        let opts = Arc::clone(&self.opts);
        let use_com_reset = opts.use_reset_connection
            && self
                .singlestore_version()?
                .is_some_and(SingleStoreVersion::supports_reset_connection);
        if use_com_reset {
            self.execute_once(&Command::ResetConnection, StatementOptions::default())?;
            // statement ids do not survive a session reset
            self.ctx.prepare_cache.clear();
        } else if self.ctx.in_transaction() {
            self.execute_once(&Command::Query("ROLLBACK".into()), StatementOptions::default())?;
        }
        for property in reset_plan(self.ctx.state_flags, &opts, use_com_reset) {
            debug!(property = ?property, "restoring session property");
            self.apply_property(&property)?;
        }
        self.ctx.after_reset(&opts);
        Ok(())
    }

    fn can_replay(&self, command: &Command, error: &Error) -> bool {
        self.ctx.redo.is_some()
            && command.can_redo()
            && matches!(error, Error::Io(_))
            && !self.control.timed_out()
    }

    /// Reconnect and bring the new session to where the lost one was:
    /// session properties, prepared statements and the open transaction.
    fn failover(&mut self, failed: &Command) -> Result<()> {
        let mut entries = self
            .ctx
            .redo
            .as_mut()
            .map(|redo| redo.take())
            .unwrap_or_default();
        if entries.last() == Some(failed) {
            entries.pop();
        }
        self.channel.close();

        let fresh = Self::connect(Arc::clone(&self.opts), Arc::clone(&self.control), true)?;
        let old = std::mem::replace(&mut self.ctx, fresh.ctx);
        self.channel = fresh.channel;
        self.ctx.prepare_cache = old.prepare_cache;
        self.ctx.redo = old.redo;
        self.ctx.warnings = old.warnings;
        self.ctx.read_only = old.read_only;
        self.ctx.state_flags = old.state_flags;
        self.ctx.network_timeout = old.network_timeout;
        self.channel.set_timeouts(old.network_timeout)?;

        let flags = old.state_flags;
        if flags.has(StateFlags::DATABASE) {
            if let Some(database) = old.database {
                self.replay_property(SessionProperty::Database(database))?;
            }
        }
        if flags.has(StateFlags::TRANSACTION_ISOLATION) {
            if let Some(level) = old.isolation {
                self.replay_property(SessionProperty::TransactionIsolation(level))?;
            }
        }
        if flags.has(StateFlags::AUTOCOMMIT) {
            self.replay_property(SessionProperty::Autocommit(old.status.autocommit()))?;
        }

        self.ctx.prepare_cache.forget_unreferenced();
        for statement in self.ctx.prepare_cache.referenced() {
            let command = Command::Prepare(Arc::clone(&statement.sql));
            let mark = self.send(&command)?;
            match self.read_for(&command, mark, StatementOptions::default())? {
                Response::Prepared(prepared) => {
                    self.ctx.prepare_cache.rebind(statement.handle, prepared.id);
                }
                _ => return Err(Error::Protocol("expected a COM_STMT_PREPARE response".into())),
            }
        }

        debug!(commands = entries.len(), "replaying transaction");
        for command in entries {
            if matches!(command, Command::Prepare(_)) {
                continue;
            }
            let mark = self.send(&command)?;
            self.read_for(&command, mark, StatementOptions::default())
                .map_err(|e| Error::connection("transaction replay failed", Some(e)))?;
        }
        Ok(())
    }

    fn replay_property(&mut self, property: SessionProperty) -> Result<()> {
        if let Some(command) = property.command() {
            self.execute_once(&command, StatementOptions::default())?;
        }
        self.ctx.record_property(&property);
        Ok(())
    }
}

/// Text cells of the first row of the last result set; empty without one.
fn first_row(completions: &[Completion]) -> Result<Vec<Option<String>>> {
    let Some(rs) = completions.iter().rev().find_map(Completion::result_set) else {
        return Ok(Vec::new());
    };
    let Some(row) = rs.rows.first() else {
        return Ok(Vec::new());
    };
    Ok(row
        .cells(&rs.columns)?
        .into_iter()
        .map(|cell| cell.and_then(|cell| simdutf8::basic::from_utf8(cell).ok().map(str::to_owned)))
        .collect())
}

fn quote_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Connect and authenticate; the socket is closed on failure.
fn handshake(opts: &Opts) -> Result<(Channel, HandshakeOutcome)> {
    debug!(target = %opts.target(), "connecting");
    let mut channel = Channel::new(Stream::connect(opts)?);

    let (credential, plugin_hint) = match opts.credential_provider.as_deref() {
        Some(provider) => (
            provider.credential(&opts.host)?,
            provider.default_auth_plugin().map(str::to_owned),
        ),
        None => (
            Credential {
                user: opts.user.clone(),
                password: opts.password.clone(),
            },
            None,
        ),
    };
    let mut machine = HandshakeStateMachine::new(opts, credential, plugin_hint);

    let result = drive_handshake(&mut channel, &mut machine, opts).and_then(|()| machine.into_outcome());
    match result {
        Ok(outcome) => {
            if outcome.capabilities.has(CapabilityFlags::CLIENT_COMPRESS) {
                channel.enable_compression();
            }
            debug!(
                thread_id = outcome.thread_id,
                server_version = %outcome.server_version,
                plugin = outcome.auth_plugin,
                tls = outcome.tls,
                capabilities = outcome.capabilities.0,
                "connected"
            );
            Ok((channel, outcome))
        }
        Err(e) => {
            channel.close();
            Err(match e {
                e @ (Error::Connection { .. } | Error::Unsupported(_)) => e,
                e => Error::connection(format!("could not connect to {}", opts.target()), Some(e)),
            })
        }
    }
}

fn drive_handshake(
    channel: &mut Channel,
    machine: &mut HandshakeStateMachine<'_>,
    opts: &Opts,
) -> Result<()> {
    loop {
        match machine.step(channel.buffers())? {
            Action::ReadPacket => channel.read_packet()?,
            Action::WriteAndReadPacket => {
                channel.write_packet(None)?;
                channel.read_packet()?;
            }
            Action::WriteAndUpgradeTls => {
                channel.write_packet(None)?;
                channel.upgrade_to_tls(opts)?;
                debug!("TLS established");
            }
            Action::Finished => return Ok(()),
        }
    }
}

/// Synchronous SingleStore connection.
///
/// All operations take `&self` and are serialized by an internal lock, so a
/// `Conn` can be shared between threads; a statement timeout uses that to
/// cancel a running query from a watcher thread.
#[derive(Debug)]
pub struct Conn {
    inner: Arc<Mutex<ConnInner>>,
    control: Arc<Control>,
    opts: Arc<Opts>,
}

impl Conn {
    /// Connect, authenticate and run the session setup commands.
    pub fn new(opts: Opts) -> Result<Self> {
        let opts = Arc::new(opts);
        let control = Arc::new(Control::default());
        let inner = ConnInner::connect(Arc::clone(&opts), Arc::clone(&control), true)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
            control,
            opts,
        })
    }

    fn run<T>(&self, f: impl FnOnce(&mut ConnInner) -> Result<T>) -> Result<T> {
        self.control.check_open()?;
        let mut inner = lock(&self.inner);
        self.control.check_open()?;
        let result = f(&mut *inner);
        if let Err(e) = &result {
            if self.control.timed_out() {
                inner.channel.close();
                return Err(Error::Timeout);
            }
            if e.is_connection_broken() {
                warn!(error = %e, "connection broken, closing");
                self.control.mark_closed();
                inner.channel.close();
            } else if self.is_closed() {
                // closed or aborted while the statement ran
                inner.channel.close();
            }
        }
        result
    }

    fn run_with_timeout<T>(
        &self,
        timeout: Option<Duration>,
        f: impl FnOnce(&mut ConnInner) -> Result<T>,
    ) -> Result<T> {
        let _watchdog = match timeout {
            Some(timeout) => Some(Watchdog::arm(
                timeout,
                &self.inner,
                &self.control,
                &self.opts,
            )?),
            None => None,
        };
        self.run(f)
    }

    /// Write one command without reading its response. Returns the number
    /// of responses to read with [`read_response`](Self::read_response).
    pub fn send_one(&self, command: Command) -> Result<usize> {
        self.run(|inner| inner.send_one(command))
    }

    /// Read the response of the oldest command written with `send_one`.
    pub fn read_response(&self, options: StatementOptions) -> Result<Response> {
        self.run_with_timeout(options.query_timeout, |inner| inner.read_response(options))
    }

    /// Send one command and read all of its results.
    ///
    /// With `options.fetch_size > 0` the first result set may come back
    /// partially loaded (`streaming == true`); pull the rest with
    /// [`read_streaming`](Self::read_streaming).
    pub fn execute(&self, command: Command, options: StatementOptions) -> Result<Vec<Completion>> {
        if matches!(command, Command::Prepare(_)) {
            return Err(Error::InvalidUsage(
                "prepare statements with Conn::prepare".into(),
            ));
        }
        self.run_with_timeout(options.query_timeout, |inner| {
            inner
                .execute(&command, options)
                .map(Response::into_completions)
        })
    }

    /// Run a text query.
    pub fn query(&self, sql: &str) -> Result<Vec<Completion>> {
        self.execute(Command::Query(sql.to_owned()), StatementOptions::default())
    }

    /// Send all commands back to back, then read every response in order.
    ///
    /// Falls back to one-by-one execution when pipelining is disabled or
    /// LOCAL INFILE is negotiated. A failure yields [`Error::Batch`] with
    /// the results read so far; the remaining responses are still drained.
    pub fn execute_pipeline(
        &self,
        commands: Vec<Command>,
        options: StatementOptions,
    ) -> Result<Vec<Completion>> {
        if commands.iter().any(|c| matches!(c, Command::Prepare(_))) {
            return Err(Error::InvalidUsage(
                "prepare statements with Conn::prepare".into(),
            ));
        }
        self.run_with_timeout(options.query_timeout, |inner| {
            inner
                .run_batch(commands, options)
                .map(|(_, completions)| completions)
        })
    }

    /// Next chunk of the pending streaming result set.
    pub fn read_streaming(&self) -> Result<Streamed> {
        self.run(ConnInner::read_streaming)
    }

    /// Drop the rest of the pending streaming result set.
    pub fn abandon_streaming(&self) -> Result<()> {
        self.run(ConnInner::settle_streaming)
    }

    /// Prepare `sql` on the server, reusing a cached statement when possible.
    pub fn prepare(&self, sql: &str) -> Result<PreparedStatement> {
        self.run(|inner| inner.prepare(sql))
    }

    /// Give back a statement obtained from [`prepare`](Self::prepare).
    pub fn close_statement(&self, statement: &PreparedStatement) -> Result<()> {
        self.run(|inner| inner.close_statement(statement))
    }

    /// Run `sql` once per parameter set.
    ///
    /// Every item is attempted; on failure the returned [`Error::Batch`]
    /// carries the outcome of each item.
    pub fn execute_batch(&self, sql: &str, param_sets: Vec<Vec<Value>>) -> Result<Vec<BatchOutcome>> {
        self.run(|inner| inner.execute_batch(sql, param_sets))
    }

    pub fn set_session_property(&self, property: SessionProperty) -> Result<()> {
        self.run(|inner| {
            inner.apply_property(&property)?;
            inner.ctx.record_property(&property);
            Ok(())
        })
    }

    /// Return the session to its connect-time state without reconnecting.
    pub fn reset(&self) -> Result<()> {
        self.run(ConnInner::reset)
    }

    pub fn ping(&self) -> Result<()> {
        self.run(|inner| {
            inner
                .execute(&Command::Ping, StatementOptions::default())
                .map(drop)
        })
    }

    /// Close the connection. An idle connection quits gracefully; a running
    /// statement has its socket shut down without waiting for it. Calling it
    /// again is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.control.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        cancel::shutdown(&self.inner, &self.control, &self.opts, false);
        debug!(thread_id = self.control.thread_id(), "connection closed");
        Ok(())
    }

    /// Tear the connection down from any thread. A running statement is
    /// killed on the server before its socket is shut down.
    pub fn abort(&self) {
        if self.control.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(thread_id = self.control.thread_id(), "aborting connection");
        cancel::shutdown(&self.inner, &self.control, &self.opts, true);
    }

    pub fn is_closed(&self) -> bool {
        self.control.closed.load(Ordering::SeqCst)
    }

    /// Ask the server to interrupt the running statement. The connection
    /// stays usable.
    pub fn kill_current_query(&self) -> Result<()> {
        self.control.check_open()?;
        cancel::kill(&self.opts, &format!("KILL QUERY {}", self.control.thread_id()))
    }

    /// Server session id.
    pub fn thread_id(&self) -> u32 {
        self.control.thread_id()
    }

    pub fn server_version(&self) -> String {
        lock(&self.inner).ctx.server_version.clone()
    }

    pub fn in_transaction(&self) -> bool {
        lock(&self.inner).ctx.in_transaction()
    }

    /// Warnings reported since connect or the last reset.
    pub fn warnings(&self) -> u32 {
        lock(&self.inner).ctx.warnings
    }

    pub fn database(&self) -> Option<String> {
        lock(&self.inner).ctx.database.clone()
    }

    pub fn read_only(&self) -> bool {
        lock(&self.inner).ctx.read_only
    }

    pub fn max_allowed_packet(&self) -> Option<usize> {
        lock(&self.inner).ctx.max_allowed_packet
    }

    pub fn wait_timeout(&self) -> Option<u64> {
        lock(&self.inner).ctx.wait_timeout
    }

    /// Properties changed since connect or the last reset.
    pub fn state_flags(&self) -> StateFlags {
        lock(&self.inner).ctx.state_flags
    }

    /// Distinct statements held in the prepare cache.
    pub fn cached_statements(&self) -> usize {
        lock(&self.inner).ctx.prepare_cache.cached()
    }
}

impl Drop for Conn {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
