//! A blocking protocol client runtime for SingleStore and other MySQL-family servers.
//!
//! # Features
//!
//! - **Sans-I/O state machines**: the handshake and the response reader consume
//!   packet payloads; [`sync`] only moves bytes
//! - **Pipelining**: commands are written back to back and responses read in order
//! - **Compression and TLS**: compressed protocol frames, TLS upgrade behind the `tls` feature
//! - **Session bookkeeping**: prepared statement cache, reset of dirty session
//!   properties, transaction replay after a lost connection
//! - **Statement timeouts**: a timed out statement is killed on the server and
//!   the connection closed
//!
//! # Example
//!
//! ```no_run
//! use zero_singlestore::sync::Conn;
//! use zero_singlestore::{Command, Opts, StatementOptions, Value};
//!
//! fn main() -> zero_singlestore::Result<()> {
//!     let opts = Opts {
//!         host: "localhost".into(),
//!         user: "root".into(),
//!         database: Some("app".into()),
//!         password: Some("secret".into()),
//!         ..Default::default()
//!     };
//!
//!     let conn = Conn::new(opts)?;
//!
//!     let completions = conn.query("SELECT 1 AS num")?;
//!     assert_eq!(completions.len(), 1);
//!
//!     let stmt = conn.prepare("INSERT INTO t (a) VALUES (?)")?;
//!     conn.execute(stmt.execute(vec![Value::Int(7)]), StatementOptions::default())?;
//!     conn.close_statement(&stmt)?;
//!
//!     conn.execute_pipeline(
//!         vec![
//!             Command::Query("INSERT INTO t (a) VALUES (1)".into()),
//!             Command::Query("INSERT INTO t (a) VALUES (2)".into()),
//!         ],
//!         StatementOptions::default(),
//!     )?;
//!
//!     conn.close()?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod batch;
pub mod buffer_pool;
pub mod buffer_set;
pub mod constant;
pub mod error;
pub mod opts;
pub mod protocol;
pub mod state;
pub mod statement;
pub mod sync;
pub mod value;

pub use batch::{BatchError, BatchOutcome};
pub use buffer_set::BufferSet;
pub use error::{Error, Result, ServerError};
pub use opts::{Opts, SslMode};
pub use protocol::{ColumnDefinition, Command, OkPacket, Row};
pub use state::{Completion, IsolationLevel, Response, ResultSet, SessionProperty, StateFlags};
pub use statement::{PreparedStatement, StatementOptions};
pub use value::Value;
