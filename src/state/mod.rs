//! Sans-I/O state for the MySQL-family protocol.
//!
//! Nothing here touches a socket: the handshake machine and the response
//! reader consume packet payloads and tell the caller what to do next, and the
//! session context keeps the per-connection bookkeeping.

pub mod action;
pub mod connection;
pub mod context;
pub mod prepare_cache;
pub mod redo;
pub mod result;

pub use action::Action;
pub use connection::{HandshakeOutcome, HandshakeState, HandshakeStateMachine};
pub use context::{IsolationLevel, SessionContext, SessionProperty, SingleStoreVersion, StateFlags};
pub use prepare_cache::PrepareCache;
pub use redo::RedoLog;
pub use result::{Completion, ReadStep, Response, ResultReader, ResultSet};
