//! Blocking SingleStore client.

mod cancel;
mod channel;
mod conn;
mod stream;

pub use channel::{Channel, SequenceMark};
pub use conn::{Conn, Streamed};
pub use stream::{SocketKiller, Stream};
