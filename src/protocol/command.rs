//! Client commands.
//!
//! Every command the executor can send is one variant; encoding and the
//! response shape are decided by matching on it.

use std::sync::Arc;

use crate::constant::CommandByte;
use crate::error::{Error, Result};
use crate::protocol::codec::{write_bytes, write_u8, write_u32};
use crate::protocol::query::interpolate;
use crate::value::Value;

/// How the server answers a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// No response at all
    None,
    /// OK, ERR, LOCAL INFILE request or a text result set
    Text,
    /// OK, ERR or a binary result set
    Binary,
    /// Prepare OK followed by parameter and column definitions
    Prepare,
}

/// A command message.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// COM_QUERY with literal SQL
    Query(String),
    /// COM_QUERY whose `?` placeholders are replaced by parameter literals
    ClientPrepared { sql: Arc<str>, params: Vec<Value> },
    /// COM_STMT_PREPARE
    Prepare(Arc<str>),
    /// COM_STMT_EXECUTE of a server-side statement
    Execute {
        /// Connection-local handle of the statement, stable across failover
        handle: u32,
        /// Server id at the time the command was built
        statement_id: u32,
        sql: Arc<str>,
        params: Vec<Value>,
    },
    /// COM_STMT_CLOSE
    CloseStatement(u32),
    /// COM_RESET_CONNECTION
    ResetConnection,
    /// COM_INIT_DB
    InitDb(String),
    /// COM_PING
    Ping,
    /// COM_QUIT
    Quit,
}

impl Command {
    /// Encode the command payload (without packet headers).
    pub fn encode(&self, out: &mut Vec<u8>, no_backslash_escapes: bool) -> Result<()> {
        match self {
            Command::Query(sql) => {
                write_u8(out, CommandByte::Query as u8);
                write_bytes(out, sql.as_bytes());
            }
            Command::ClientPrepared { sql, params } => {
                write_u8(out, CommandByte::Query as u8);
                interpolate(out, sql, params, no_backslash_escapes)?;
            }
            Command::Prepare(sql) => {
                write_u8(out, CommandByte::StmtPrepare as u8);
                write_bytes(out, sql.as_bytes());
            }
            Command::Execute {
                statement_id,
                params,
                ..
            } => write_execute(out, *statement_id, params)?,
            Command::CloseStatement(statement_id) => {
                write_u8(out, CommandByte::StmtClose as u8);
                write_u32(out, *statement_id);
            }
            Command::ResetConnection => write_u8(out, CommandByte::ResetConnection as u8),
            Command::InitDb(database) => {
                write_u8(out, CommandByte::InitDb as u8);
                write_bytes(out, database.as_bytes());
            }
            Command::Ping => write_u8(out, CommandByte::Ping as u8),
            Command::Quit => write_u8(out, CommandByte::Quit as u8),
        }
        Ok(())
    }

    pub fn response_kind(&self) -> ResponseKind {
        match self {
            Command::Query(_) | Command::ClientPrepared { .. } => ResponseKind::Text,
            Command::Execute { .. } => ResponseKind::Binary,
            Command::Prepare(_) => ResponseKind::Prepare,
            Command::ResetConnection | Command::InitDb(_) | Command::Ping => ResponseKind::Text,
            Command::CloseStatement(_) | Command::Quit => ResponseKind::None,
        }
    }

    /// Number of response sequences the server sends back.
    pub fn expected_responses(&self) -> usize {
        match self.response_kind() {
            ResponseKind::None => 0,
            _ => 1,
        }
    }

    /// SQL text carried by the command, if any.
    pub fn sql(&self) -> Option<&str> {
        match self {
            Command::Query(sql) => Some(sql),
            Command::ClientPrepared { sql, .. }
            | Command::Prepare(sql)
            | Command::Execute { sql, .. } => Some(sql),
            _ => None,
        }
    }

    /// Human-readable description for logs and error context.
    pub fn description(&self) -> String {
        match self {
            Command::Prepare(sql) => format!("PREPARE {sql}"),
            Command::Execute { sql, .. } => format!("EXECUTE {sql}"),
            Command::CloseStatement(id) => format!("COM_STMT_CLOSE {id}"),
            Command::ResetConnection => "COM_RESET_CONNECTION".to_owned(),
            Command::InitDb(database) => format!("COM_INIT_DB {database}"),
            Command::Ping => "COM_PING".to_owned(),
            Command::Quit => "COM_QUIT".to_owned(),
            Command::Query(sql) => sql.clone(),
            Command::ClientPrepared { sql, .. } => sql.to_string(),
        }
    }

    /// Whether the command is recorded for transaction replay.
    pub fn can_redo(&self) -> bool {
        matches!(
            self,
            Command::Query(_)
                | Command::ClientPrepared { .. }
                | Command::Prepare(_)
                | Command::Execute { .. }
                | Command::InitDb(_)
        )
    }
}

pub(crate) fn write_execute(out: &mut Vec<u8>, statement_id: u32, params: &[Value]) -> Result<()> {
    if params.len() > usize::from(u16::MAX) {
        return Err(Error::InvalidUsage(format!(
            "too many parameters: {}",
            params.len()
        )));
    }
    write_u8(out, CommandByte::StmtExecute as u8);
    write_u32(out, statement_id);
    // CURSOR_TYPE_NO_CURSOR
    write_u8(out, 0);
    // iteration count
    write_u32(out, 1);

    if params.is_empty() {
        return Ok(());
    }

    let bitmap_start = out.len();
    out.resize(bitmap_start + params.len().div_ceil(8), 0);
    for (i, param) in params.iter().enumerate() {
        if param.is_null() {
            out[bitmap_start + i / 8] |= 1 << (i % 8);
        }
    }

    // new-params-bound flag
    write_u8(out, 1);
    for param in params {
        write_bytes(out, &param.binary_type());
    }
    for param in params {
        param.write_binary(out);
    }
    Ok(())
}
