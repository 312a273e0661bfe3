//! Prepared statement handles and per-statement execution options.

use std::sync::Arc;
use std::time::Duration;

use crate::protocol::command::Command;
use crate::protocol::response::ColumnDefinition;
use crate::value::Value;

/// A server-side prepared statement.
///
/// Obtained from [`Conn::prepare`](crate::sync::Conn::prepare); must be given back
/// with [`Conn::close_statement`](crate::sync::Conn::close_statement), which
/// releases the cache reference and closes it on the server when it is no
/// longer shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    pub(crate) handle: u32,
    pub(crate) id: u32,
    pub(crate) sql: Arc<str>,
    pub(crate) params: Arc<[ColumnDefinition]>,
    pub(crate) columns: Arc<[ColumnDefinition]>,
}

impl PreparedStatement {
    /// Server-assigned statement id.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    /// Parameter definitions sent by the server.
    pub fn params(&self) -> &[ColumnDefinition] {
        &self.params
    }

    /// Result column definitions sent by the server.
    pub fn columns(&self) -> &[ColumnDefinition] {
        &self.columns
    }

    /// Build the COM_STMT_EXECUTE command for one parameter set.
    pub fn execute(&self, params: Vec<Value>) -> Command {
        Command::Execute {
            handle: self.handle,
            statement_id: self.id,
            sql: Arc::clone(&self.sql),
            params,
        }
    }
}

/// Options applied to one `execute` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatementOptions {
    /// Rows fetched per round; `0` reads the whole result before returning.
    pub fetch_size: usize,
    /// Keep at most this many rows per result; `0` keeps all. Extra rows are
    /// still drained from the socket.
    pub max_rows: u64,
    /// Cancel the statement and close the connection when it runs longer.
    pub query_timeout: Option<Duration>,
}

impl StatementOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            query_timeout: Some(timeout),
            ..Self::default()
        }
    }

    pub fn streaming(fetch_size: usize) -> Self {
        Self {
            fetch_size,
            ..Self::default()
        }
    }
}
