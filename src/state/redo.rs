//! Commands of the open transaction, kept for replay on a new connection.

use crate::protocol::command::Command;

/// Append-only log of the commands sent since the last transaction boundary.
#[derive(Debug, Default)]
pub struct RedoLog {
    entries: Vec<Command>,
}

impl RedoLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a command about to be sent.
    pub fn record(&mut self, command: &Command) {
        if command.can_redo() {
            self.entries.push(command.clone());
        }
    }

    /// Apply the transaction state reported after a response: outside a
    /// transaction there is nothing to replay.
    pub fn observe(&mut self, in_transaction: bool) {
        if !in_transaction {
            self.entries.clear();
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> &[Command] {
        &self.entries
    }

    pub fn take(&mut self) -> Vec<Command> {
        std::mem::take(&mut self.entries)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
