//! MySQL-family wire protocol implementation.
//!
//! Everything here is sans-I/O: functions encode into or decode from byte
//! buffers, and the runtime in [`crate::sync`] moves those bytes.
//!
//! # Structure
//!
//! - `codec`: little-endian and length-encoded primitives
//! - `packet`: packet headers, splitting and reassembly
//! - `compress`: compressed protocol frames
//! - `handshake`: connection phase packets
//! - `response`: OK / ERR / EOF, column definitions, rows
//! - `command`: client commands
//! - `query`: SQL lexing for placeholders and LOCAL INFILE

pub mod codec;
pub mod command;
pub mod compress;
pub mod handshake;
pub mod packet;
pub mod query;
pub mod response;

pub use command::{Command, ResponseKind};
pub use response::{ColumnDefinition, OkPacket, Row};
