//! Response reader: turns the packets of one command response into
//! completions.

use std::sync::Arc;

use tracing::trace;

use crate::constant::StatusFlags;
use crate::error::{Error, Result, ServerError};
use crate::protocol::command::{Command, ResponseKind};
use crate::protocol::response::{
    ColumnDefinition, EofPacket, OkPacket, PrepareOk, Row, header, is_result_end,
    parse_column_count, parse_error,
};
use crate::statement::{PreparedStatement, StatementOptions};

use super::context::SessionContext;

/// A fully read result set, or the first chunk of a streaming one.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSet {
    pub columns: Arc<[ColumnDefinition]>,
    pub rows: Vec<Row>,
    /// More rows are pending; pull them with `read_streaming`
    pub streaming: bool,
}

/// One result of a command: an update count or a result set.
#[derive(Debug, Clone, PartialEq)]
pub enum Completion {
    Ok(OkPacket),
    ResultSet(ResultSet),
}

impl Completion {
    pub fn affected_rows(&self) -> Option<u64> {
        match self {
            Completion::Ok(ok) => Some(ok.affected_rows),
            Completion::ResultSet(_) => None,
        }
    }

    pub fn result_set(&self) -> Option<&ResultSet> {
        match self {
            Completion::ResultSet(rs) => Some(rs),
            Completion::Ok(_) => None,
        }
    }
}

/// Everything one command produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Command without a response (COM_STMT_CLOSE, COM_QUIT)
    None,
    Completions(Vec<Completion>),
    Prepared(PreparedStatement),
}

impl Response {
    pub fn completions(&self) -> &[Completion] {
        match self {
            Response::Completions(completions) => completions,
            Response::None | Response::Prepared(_) => &[],
        }
    }

    pub fn into_completions(self) -> Vec<Completion> {
        match self {
            Response::Completions(completions) => completions,
            Response::None | Response::Prepared(_) => Vec::new(),
        }
    }
}

/// What the reader needs next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStep {
    /// Feed the next packet
    NeedPacket,
    /// `fetch_size` rows are buffered; take them before feeding more
    Suspended,
    /// The server asks for the content of a local file; send it, then feed
    /// the next packet
    LocalInfile(String),
    /// The response is complete
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Columns { remaining: usize },
    ColumnsEof,
    Rows,
    PrepareParams { remaining: usize },
    PrepareParamsEof,
    PrepareColumns { remaining: usize },
    PrepareColumnsEof,
    Done,
}

#[derive(Debug)]
struct PendingPrepare {
    statement_id: u32,
    num_columns: usize,
    params: Vec<ColumnDefinition>,
    columns: Vec<ColumnDefinition>,
}

/// Sans-I/O reader of one command response.
#[derive(Debug)]
pub struct ResultReader {
    kind: ResponseKind,
    sql: Option<Arc<str>>,
    state: State,
    deprecate_eof: bool,
    options: StatementOptions,
    discard: bool,
    /// A result set of this response was handed out in chunks
    suspended: bool,
    completions: Vec<Completion>,
    columns: Vec<ColumnDefinition>,
    current: Option<ResultSet>,
    rows_seen: u64,
    prepare: Option<PendingPrepare>,
    error: Option<ServerError>,
}

impl ResultReader {
    pub fn new(command: &Command, deprecate_eof: bool, options: StatementOptions) -> Self {
        let kind = command.response_kind();
        Self {
            kind,
            sql: command.sql().map(Arc::from),
            state: if kind == ResponseKind::None {
                State::Done
            } else {
                State::Start
            },
            deprecate_eof,
            options,
            discard: false,
            suspended: false,
            completions: Vec::new(),
            columns: Vec::new(),
            current: None,
            rows_seen: 0,
            prepare: None,
            error: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Drop rows instead of keeping them and stop suspending.
    pub fn discard(&mut self) {
        self.discard = true;
        self.options.fetch_size = 0;
        if let Some(current) = self.current.as_mut() {
            current.rows.clear();
        }
    }

    /// Rows buffered for the result set in progress.
    pub fn take_rows(&mut self) -> Vec<Row> {
        self.current
            .as_mut()
            .map(|rs| std::mem::take(&mut rs.rows))
            .unwrap_or_default()
    }

    /// The result set in progress, with the rows buffered so far.
    pub fn take_partial(&mut self) -> Option<ResultSet> {
        let current = self.current.as_mut()?;
        Some(ResultSet {
            columns: Arc::clone(&current.columns),
            rows: std::mem::take(&mut current.rows),
            streaming: true,
        })
    }

    /// Completions finished so far.
    pub fn take_completions(&mut self) -> Vec<Completion> {
        std::mem::take(&mut self.completions)
    }

    /// Process one packet payload.
    pub fn step(&mut self, payload: &[u8], ctx: &mut SessionContext) -> Result<ReadStep> {
        if payload.first() == Some(&header::ERR) && self.state != State::Done {
            let error = parse_error(payload)?;
            trace!(code = error.code, "error response");
            ctx.apply_error(&error);
            self.error = Some(error);
            self.current = None;
            self.prepare = None;
            self.state = State::Done;
            return Ok(ReadStep::Done);
        }

        match self.state {
            State::Start => self.handle_first(payload, ctx),
            State::Columns { remaining } => {
                self.columns.push(ColumnDefinition::parse(payload)?);
                if remaining > 1 {
                    self.state = State::Columns {
                        remaining: remaining - 1,
                    };
                } else if self.deprecate_eof {
                    self.begin_rows();
                } else {
                    self.state = State::ColumnsEof;
                }
                Ok(ReadStep::NeedPacket)
            }
            State::ColumnsEof => {
                EofPacket::parse(payload)?;
                self.begin_rows();
                Ok(ReadStep::NeedPacket)
            }
            State::Rows => self.handle_row(payload, ctx),
            State::PrepareParams { remaining } => {
                let pending = self.pending_prepare()?;
                pending.params.push(ColumnDefinition::parse(payload)?);
                self.state = if remaining > 1 {
                    State::PrepareParams {
                        remaining: remaining - 1,
                    }
                } else if self.deprecate_eof {
                    self.after_prepare_params()
                } else {
                    State::PrepareParamsEof
                };
                Ok(self.prepare_progress())
            }
            State::PrepareParamsEof => {
                EofPacket::parse(payload)?;
                self.state = self.after_prepare_params();
                Ok(self.prepare_progress())
            }
            State::PrepareColumns { remaining } => {
                let pending = self.pending_prepare()?;
                pending.columns.push(ColumnDefinition::parse(payload)?);
                self.state = if remaining > 1 {
                    State::PrepareColumns {
                        remaining: remaining - 1,
                    }
                } else if self.deprecate_eof {
                    State::Done
                } else {
                    State::PrepareColumnsEof
                };
                Ok(self.prepare_progress())
            }
            State::PrepareColumnsEof => {
                EofPacket::parse(payload)?;
                self.state = State::Done;
                Ok(ReadStep::Done)
            }
            State::Done => Err(Error::Protocol(format!(
                "unexpected packet after end of response (0x{:02x})",
                payload.first().copied().unwrap_or_default()
            ))),
        }
    }

    fn handle_first(&mut self, payload: &[u8], ctx: &mut SessionContext) -> Result<ReadStep> {
        match (self.kind, payload.first().copied()) {
            (ResponseKind::Prepare, Some(header::OK)) => {
                let ok = PrepareOk::parse(payload)?;
                let num_params = usize::from(ok.num_params.get());
                let num_columns = usize::from(ok.num_columns.get());
                ctx.warnings += u32::from(ok.warnings.get());
                self.prepare = Some(PendingPrepare {
                    statement_id: ok.statement_id.get(),
                    num_columns,
                    params: Vec::with_capacity(num_params),
                    columns: Vec::with_capacity(num_columns),
                });
                self.state = if num_params > 0 {
                    State::PrepareParams {
                        remaining: num_params,
                    }
                } else {
                    self.after_prepare_params()
                };
                Ok(self.prepare_progress())
            }
            (ResponseKind::Prepare, _) => Err(Error::Protocol(
                "expected COM_STMT_PREPARE response".into(),
            )),
            (_, Some(header::OK)) => {
                let ok = OkPacket::parse(payload)?;
                ctx.apply_ok(&ok);
                let more = ok.status.more_results();
                self.completions.push(Completion::Ok(ok));
                Ok(self.after_completion(more))
            }
            (ResponseKind::Text, Some(header::LOCAL_INFILE)) => {
                let name = String::from_utf8_lossy(&payload[1..]).into_owned();
                Ok(ReadStep::LocalInfile(name))
            }
            (_, Some(_)) => {
                let count = parse_column_count(payload)?;
                if count == 0 {
                    return Err(Error::Protocol("result set without columns".into()));
                }
                self.columns = Vec::with_capacity(count);
                self.state = State::Columns { remaining: count };
                Ok(ReadStep::NeedPacket)
            }
            (_, None) => Err(Error::Protocol("empty response packet".into())),
        }
    }

    fn begin_rows(&mut self) {
        self.rows_seen = 0;
        self.current = Some(ResultSet {
            columns: std::mem::take(&mut self.columns).into(),
            rows: Vec::new(),
            streaming: false,
        });
        self.state = State::Rows;
    }

    fn handle_row(&mut self, payload: &[u8], ctx: &mut SessionContext) -> Result<ReadStep> {
        if is_result_end(payload, self.deprecate_eof) {
            let (status, warnings) = if self.deprecate_eof {
                let ok = OkPacket::parse(payload)?;
                (ok.status, ok.warnings)
            } else {
                let eof = EofPacket::parse(payload)?;
                (eof.status, eof.warnings)
            };
            ctx.apply_status(status, warnings);
            // only the first streamed result set is chunked; the rest of the
            // response is read in full
            if self.suspended {
                self.options.fetch_size = 0;
            }
            if let Some(mut rs) = self.current.take() {
                rs.streaming = false;
                if !self.discard {
                    self.completions.push(Completion::ResultSet(rs));
                }
            }
            return Ok(self.after_completion(status.has(StatusFlags::SERVER_MORE_RESULTS_EXISTS)));
        }

        self.rows_seen += 1;
        let keep = !self.discard
            && (self.options.max_rows == 0 || self.rows_seen <= self.options.max_rows);
        let Some(current) = self.current.as_mut() else {
            return Err(Error::Protocol("row outside of a result set".into()));
        };
        if keep {
            current.rows.push(Row {
                data: payload.to_vec(),
                binary: self.kind == ResponseKind::Binary,
            });
        }
        if self.options.fetch_size > 0 && current.rows.len() >= self.options.fetch_size {
            self.suspended = true;
            return Ok(ReadStep::Suspended);
        }
        Ok(ReadStep::NeedPacket)
    }

    fn after_completion(&mut self, more_results: bool) -> ReadStep {
        if more_results {
            self.state = State::Start;
            ReadStep::NeedPacket
        } else {
            self.state = State::Done;
            ReadStep::Done
        }
    }

    fn pending_prepare(&mut self) -> Result<&mut PendingPrepare> {
        self.prepare
            .as_mut()
            .ok_or_else(|| Error::Protocol("prepare metadata without PREPARE OK".into()))
    }

    fn after_prepare_params(&self) -> State {
        match self.prepare.as_ref().map_or(0, |p| p.num_columns) {
            0 => State::Done,
            n => State::PrepareColumns { remaining: n },
        }
    }

    fn prepare_progress(&self) -> ReadStep {
        if self.state == State::Done {
            ReadStep::Done
        } else {
            ReadStep::NeedPacket
        }
    }

    /// Consume the reader once `step` returned `Done`.
    pub fn finish(self) -> Result<core::result::Result<Response, ServerError>> {
        if let Some(error) = self.error {
            return Ok(Err(error));
        }
        if self.state != State::Done {
            return Err(Error::Protocol("response is not complete".into()));
        }
        Ok(Ok(match self.kind {
            ResponseKind::None => Response::None,
            ResponseKind::Prepare => {
                let pending = self
                    .prepare
                    .ok_or_else(|| Error::Protocol("missing PREPARE OK".into()))?;
                Response::Prepared(PreparedStatement {
                    handle: 0,
                    id: pending.statement_id,
                    sql: self.sql.unwrap_or_else(|| Arc::from("")),
                    params: pending.params.into(),
                    columns: pending.columns.into(),
                })
            }
            ResponseKind::Text | ResponseKind::Binary => Response::Completions(self.completions),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constant::{CapabilityFlags, ColumnType};
    use crate::opts::Opts;
    use crate::protocol::response::tests::column;
    use crate::state::connection::HandshakeOutcome;

    fn context() -> SessionContext {
        let outcome = HandshakeOutcome {
            capabilities: CapabilityFlags::default(),
            status: StatusFlags::new(StatusFlags::SERVER_STATUS_AUTOCOMMIT),
            thread_id: 1,
            server_version: "5.7.32".into(),
            seed: Vec::new(),
            charset: 45,
            tls: false,
            auth_plugin: "mysql_native_password",
        };
        SessionContext::new(&outcome, &Opts::default())
    }

    fn eof(status: u16) -> Vec<u8> {
        let mut out = vec![0xfe, 0, 0];
        out.extend_from_slice(&status.to_le_bytes());
        out
    }

    fn ok(affected: u8, status: u16) -> Vec<u8> {
        let mut out = vec![0x00, affected, 0];
        out.extend_from_slice(&status.to_le_bytes());
        out.extend_from_slice(&[0, 0]);
        out
    }

    fn feed(reader: &mut ResultReader, ctx: &mut SessionContext, packets: &[Vec<u8>]) -> ReadStep {
        let mut last = ReadStep::NeedPacket;
        for packet in packets {
            last = reader.step(packet, ctx).unwrap();
        }
        last
    }

    fn text_result(rows: &[&[u8]], status: u16) -> Vec<Vec<u8>> {
        let mut packets = vec![vec![1], column("a", ColumnType::MYSQL_TYPE_VAR_STRING), eof(2)];
        for row in rows {
            let mut data = vec![row.len() as u8];
            data.extend_from_slice(row);
            packets.push(data);
        }
        packets.push(eof(status));
        packets
    }

    #[test]
    fn text_result_set() {
        let mut ctx = context();
        let command = Command::Query("SELECT a FROM t".into());
        let mut reader = ResultReader::new(&command, false, StatementOptions::default());
        let step = feed(&mut reader, &mut ctx, &text_result(&[b"x", b"y"], 2));
        assert_eq!(step, ReadStep::Done);

        let response = reader.finish().unwrap().unwrap();
        let rs = response.completions()[0].result_set().unwrap();
        assert_eq!(rs.columns[0].name, "a");
        assert_eq!(rs.rows.len(), 2);
        assert!(!rs.streaming);
    }

    #[test]
    fn multiple_results() {
        let mut ctx = context();
        let command = Command::Query("CALL p()".into());
        let mut reader = ResultReader::new(&command, false, StatementOptions::default());
        let more = StatusFlags::SERVER_MORE_RESULTS_EXISTS | StatusFlags::SERVER_STATUS_AUTOCOMMIT;
        let mut packets = text_result(&[b"x"], more);
        packets.push(ok(3, 2));
        assert_eq!(feed(&mut reader, &mut ctx, &packets), ReadStep::Done);

        let completions = reader.finish().unwrap().unwrap().into_completions();
        assert_eq!(completions.len(), 2);
        assert_eq!(completions[1].affected_rows(), Some(3));
    }

    #[test]
    fn error_ends_response() {
        let mut ctx = context();
        let command = Command::Query("SELECT a FROM t".into());
        let mut reader = ResultReader::new(&command, false, StatementOptions::default());
        let mut packets = text_result(&[b"x"], 2);
        packets.pop();
        let mut err = vec![0xff, 0x25, 0x05, b'#'];
        err.extend_from_slice(b"70100Query execution was interrupted");
        packets.push(err);
        assert_eq!(feed(&mut reader, &mut ctx, &packets), ReadStep::Done);

        let error = reader.finish().unwrap().unwrap_err();
        assert_eq!(error.code, 1317);
        assert!(!ctx.status.more_results());
    }

    #[test]
    fn fetch_size_suspends() {
        let mut ctx = context();
        let command = Command::Query("SELECT a FROM t".into());
        let mut reader = ResultReader::new(&command, false, StatementOptions::streaming(2));
        let packets = text_result(&[b"1", b"2", b"3"], 2);

        assert_eq!(feed(&mut reader, &mut ctx, &packets[..5]), ReadStep::Suspended);
        let partial = reader.take_partial().unwrap();
        assert!(partial.streaming);
        assert_eq!(partial.rows.len(), 2);

        assert_eq!(feed(&mut reader, &mut ctx, &packets[5..]), ReadStep::Done);
        assert_eq!(reader.take_rows(), Vec::new());
        let completions = reader.take_completions();
        let rs = completions[0].result_set().unwrap();
        assert_eq!(rs.rows.len(), 1);
    }

    #[test]
    fn only_the_first_streamed_result_is_chunked() {
        let mut ctx = context();
        let command = Command::Query("CALL p()".into());
        let mut reader = ResultReader::new(&command, false, StatementOptions::streaming(1));
        let more = StatusFlags::SERVER_MORE_RESULTS_EXISTS | StatusFlags::SERVER_STATUS_AUTOCOMMIT;
        let mut packets = text_result(&[b"1", b"2"], more);
        packets.extend(text_result(&[b"3", b"4"], 2));

        let mut chunks = 0;
        for packet in &packets {
            if reader.step(packet, &mut ctx).unwrap() == ReadStep::Suspended {
                assert_eq!(reader.take_rows().len(), 1);
                chunks += 1;
            }
        }
        assert_eq!(chunks, 2);
        assert!(reader.is_done());
        let completions = reader.take_completions();
        assert_eq!(completions.len(), 2);
        assert_eq!(completions[1].result_set().unwrap().rows.len(), 2);
    }

    #[test]
    fn max_rows_drains_the_rest() {
        let mut ctx = context();
        let command = Command::Query("SELECT a FROM t".into());
        let options = StatementOptions {
            max_rows: 1,
            ..StatementOptions::default()
        };
        let mut reader = ResultReader::new(&command, false, options);
        feed(&mut reader, &mut ctx, &text_result(&[b"1", b"2", b"3"], 2));
        let response = reader.finish().unwrap().unwrap();
        assert_eq!(response.completions()[0].result_set().unwrap().rows.len(), 1);
    }

    #[test]
    fn deprecate_eof_result() {
        let mut ctx = context();
        let command = Command::Query("SELECT a FROM t".into());
        let mut reader = ResultReader::new(&command, true, StatementOptions::default());
        let mut end = vec![0xfe, 0, 0, 0x02, 0x00, 0, 0];
        end.push(0);
        let packets = vec![
            vec![1],
            column("a", ColumnType::MYSQL_TYPE_VAR_STRING),
            vec![1, b'z'],
            end,
        ];
        assert_eq!(feed(&mut reader, &mut ctx, &packets), ReadStep::Done);
        let response = reader.finish().unwrap().unwrap();
        assert_eq!(response.completions()[0].result_set().unwrap().rows.len(), 1);
    }

    #[test]
    fn oversized_column_count_is_a_protocol_error() {
        let mut ctx = context();
        let command = Command::Query("SELECT a FROM t".into());
        let mut reader = ResultReader::new(&command, false, StatementOptions::default());
        let result = reader.step(&[0xfe, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x0f], &mut ctx);
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[test]
    fn local_infile_request() {
        let mut ctx = context();
        let command = Command::Query("LOAD DATA LOCAL INFILE 'a.csv' INTO TABLE t".into());
        let mut reader = ResultReader::new(&command, false, StatementOptions::default());
        assert_eq!(
            reader.step(b"\xfba.csv", &mut ctx).unwrap(),
            ReadStep::LocalInfile("a.csv".into())
        );
        assert_eq!(reader.step(&ok(5, 2), &mut ctx).unwrap(), ReadStep::Done);
        let response = reader.finish().unwrap().unwrap();
        assert_eq!(response.completions()[0].affected_rows(), Some(5));
    }

    #[test]
    fn prepare_response() {
        let mut ctx = context();
        let command = Command::Prepare("SELECT a FROM t WHERE b = ?".into());
        let mut reader = ResultReader::new(&command, false, StatementOptions::default());
        let packets = vec![
            vec![0x00, 9, 0, 0, 0, 1, 0, 1, 0, 0, 0, 0],
            column("?", ColumnType::MYSQL_TYPE_VAR_STRING),
            eof(2),
            column("a", ColumnType::MYSQL_TYPE_LONG),
            eof(2),
        ];
        assert_eq!(feed(&mut reader, &mut ctx, &packets), ReadStep::Done);
        let Response::Prepared(statement) = reader.finish().unwrap().unwrap() else {
            panic!("expected a prepared statement");
        };
        assert_eq!(statement.id(), 9);
        assert_eq!(statement.param_count(), 1);
        assert_eq!(statement.columns()[0].name, "a");
        assert_eq!(statement.sql(), "SELECT a FROM t WHERE b = ?");
    }

    #[test]
    fn close_has_no_response() {
        let reader = ResultReader::new(&Command::CloseStatement(1), false, StatementOptions::default());
        assert!(reader.is_done());
        assert_eq!(reader.finish().unwrap().unwrap(), Response::None);
    }
}
