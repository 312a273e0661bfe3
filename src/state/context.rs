//! Per-connection session state.

use std::fmt;
use std::time::Duration;

use crate::constant::{CapabilityFlags, StatusFlags};
use crate::error::ServerError;
use crate::opts::Opts;
use crate::protocol::command::Command;
use crate::protocol::response::OkPacket;

use super::connection::HandshakeOutcome;
use super::prepare_cache::PrepareCache;
use super::redo::RedoLog;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Session properties changed since connect, restored by `reset`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateFlags(u8);

impl StateFlags {
    pub const NETWORK_TIMEOUT: u8 = 0x01;
    pub const AUTOCOMMIT: u8 = 0x02;
    pub const DATABASE: u8 = 0x04;
    pub const READ_ONLY: u8 = 0x08;
    pub const TRANSACTION_ISOLATION: u8 = 0x10;

    pub fn has(&self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    pub fn set(&mut self, flag: u8) {
        self.0 |= flag;
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

/// A session property change requested by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionProperty {
    Autocommit(bool),
    Database(String),
    /// Tracked on the client only
    ReadOnly(bool),
    TransactionIsolation(IsolationLevel),
    /// Socket read/write timeout
    NetworkTimeout(Option<Duration>),
}

impl SessionProperty {
    pub fn flag(&self) -> u8 {
        match self {
            SessionProperty::Autocommit(_) => StateFlags::AUTOCOMMIT,
            SessionProperty::Database(_) => StateFlags::DATABASE,
            SessionProperty::ReadOnly(_) => StateFlags::READ_ONLY,
            SessionProperty::TransactionIsolation(_) => StateFlags::TRANSACTION_ISOLATION,
            SessionProperty::NetworkTimeout(_) => StateFlags::NETWORK_TIMEOUT,
        }
    }

    /// Command that applies the property on the server, if any.
    pub fn command(&self) -> Option<Command> {
        match self {
            SessionProperty::Autocommit(on) => Some(Command::Query(format!(
                "set autocommit={}",
                u8::from(*on)
            ))),
            SessionProperty::Database(database) => Some(Command::InitDb(database.clone())),
            SessionProperty::TransactionIsolation(level) => Some(Command::Query(format!(
                "SET SESSION TRANSACTION ISOLATION LEVEL {level}"
            ))),
            SessionProperty::ReadOnly(_) | SessionProperty::NetworkTimeout(_) => None,
        }
    }
}

/// Properties `reset` must re-apply, in order, to restore connect-time defaults.
///
/// COM_RESET_CONNECTION already restores the isolation level, so it is only
/// re-applied when the reset did not use it.
pub fn reset_plan(flags: StateFlags, opts: &Opts, used_com_reset: bool) -> Vec<SessionProperty> {
    let mut plan = Vec::new();
    if flags.has(StateFlags::NETWORK_TIMEOUT) {
        plan.push(SessionProperty::NetworkTimeout(opts.socket_timeout));
    }
    if flags.has(StateFlags::AUTOCOMMIT) {
        plan.push(SessionProperty::Autocommit(opts.autocommit.unwrap_or(true)));
    }
    if flags.has(StateFlags::DATABASE) {
        if let Some(database) = &opts.database {
            plan.push(SessionProperty::Database(database.clone()));
        }
    }
    if flags.has(StateFlags::READ_ONLY) {
        plan.push(SessionProperty::ReadOnly(false));
    }
    if !used_com_reset && flags.has(StateFlags::TRANSACTION_ISOLATION) {
        plan.push(SessionProperty::TransactionIsolation(
            opts.transaction_isolation
                .unwrap_or(IsolationLevel::RepeatableRead),
        ));
    }
    plan
}

/// SingleStore release reported by `@@memsql_version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SingleStoreVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SingleStoreVersion {
    /// First release that understands COM_RESET_CONNECTION.
    const RESET_CONNECTION: Self = Self {
        major: 7,
        minor: 5,
        patch: 2,
    };

    /// Parse `major[.minor[.patch]]`; anything after the digits of a part is ignored.
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.trim().split('.').map(|part| {
            part.split(|c: char| !c.is_ascii_digit())
                .next()
                .and_then(|digits| digits.parse::<u32>().ok())
        });
        let major = parts.next().flatten()?;
        let minor = parts.next().flatten().unwrap_or(0);
        let patch = parts.next().flatten().unwrap_or(0);
        Some(Self {
            major,
            minor,
            patch,
        })
    }

    pub fn supports_reset_connection(self) -> bool {
        self >= Self::RESET_CONNECTION
    }
}

/// Mutable state of one session, owned by the connection.
#[derive(Debug)]
pub struct SessionContext {
    pub capabilities: CapabilityFlags,
    pub status: StatusFlags,
    pub thread_id: u32,
    pub server_version: String,
    pub seed: Vec<u8>,
    pub charset: u8,
    pub tls: bool,
    pub database: Option<String>,
    pub read_only: bool,
    pub isolation: Option<IsolationLevel>,
    pub warnings: u32,
    pub state_flags: StateFlags,
    /// Socket read/write timeout currently applied
    pub network_timeout: Option<Duration>,
    /// Server `max_allowed_packet`, read after connecting
    pub max_allowed_packet: Option<usize>,
    /// Server `wait_timeout` in seconds
    pub wait_timeout: Option<u64>,
    /// `None` until asked for, then the version the server reported, if any
    pub singlestore_version: Option<Option<SingleStoreVersion>>,
    pub prepare_cache: PrepareCache,
    pub redo: Option<RedoLog>,
}

impl SessionContext {
    pub fn new(outcome: &HandshakeOutcome, opts: &Opts) -> Self {
        Self {
            capabilities: outcome.capabilities,
            status: outcome.status,
            thread_id: outcome.thread_id,
            server_version: outcome.server_version.clone(),
            seed: outcome.seed.clone(),
            charset: outcome.charset,
            tls: outcome.tls,
            database: opts.database.clone(),
            read_only: false,
            isolation: opts.transaction_isolation,
            warnings: 0,
            state_flags: StateFlags::default(),
            network_timeout: opts.socket_timeout,
            max_allowed_packet: opts.max_allowed_packet,
            wait_timeout: None,
            singlestore_version: None,
            prepare_cache: PrepareCache::new(opts.prep_stmt_cache_size, opts.cache_prep_stmts),
            redo: opts.transaction_replay.then(RedoLog::new),
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.status.in_transaction()
    }

    pub fn no_backslash_escapes(&self) -> bool {
        self.status.no_backslash_escapes()
    }

    pub fn deprecate_eof(&self) -> bool {
        self.capabilities.has(CapabilityFlags::CLIENT_DEPRECATE_EOF)
    }

    pub fn local_infile(&self) -> bool {
        self.capabilities.has(CapabilityFlags::CLIENT_LOCAL_FILES)
    }

    pub fn apply_ok(&mut self, ok: &OkPacket) {
        self.apply_status(ok.status, ok.warnings);
    }

    /// Status and warnings from an OK or EOF packet.
    pub fn apply_status(&mut self, status: StatusFlags, warnings: u16) {
        self.status = status;
        self.warnings += u32::from(warnings);
    }

    /// An ERR packet ends the response sequence.
    pub fn apply_error(&mut self, _error: &ServerError) {
        self.status.0 &= !StatusFlags::SERVER_MORE_RESULTS_EXISTS;
    }

    /// Record a property applied by the caller.
    pub fn record_property(&mut self, property: &SessionProperty) {
        self.state_flags.set(property.flag());
        match property {
            SessionProperty::Database(database) => self.database = Some(database.clone()),
            SessionProperty::ReadOnly(read_only) => self.read_only = *read_only,
            SessionProperty::TransactionIsolation(level) => self.isolation = Some(*level),
            SessionProperty::NetworkTimeout(timeout) => self.network_timeout = *timeout,
            SessionProperty::Autocommit(_) => {}
        }
    }

    /// Forget session state after COM_RESET_CONNECTION or a full reset.
    pub fn after_reset(&mut self, opts: &Opts) {
        self.warnings = 0;
        self.state_flags.clear();
        self.database = opts.database.clone();
        self.read_only = false;
        self.isolation = opts.transaction_isolation;
        self.network_timeout = opts.socket_timeout;
        if let Some(redo) = self.redo.as_mut() {
            redo.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_restores_exactly_the_dirty_properties() {
        let opts = Opts {
            database: Some("db".into()),
            ..Opts::default()
        };
        let mut flags = StateFlags::default();
        flags.set(StateFlags::AUTOCOMMIT);
        flags.set(StateFlags::DATABASE);
        flags.set(StateFlags::READ_ONLY);

        assert_eq!(
            reset_plan(flags, &opts, true),
            vec![
                SessionProperty::Autocommit(true),
                SessionProperty::Database("db".into()),
                SessionProperty::ReadOnly(false),
            ]
        );
        assert!(reset_plan(StateFlags::default(), &opts, true).is_empty());
    }

    #[test]
    fn reset_connection_needs_7_5_2() {
        let version = |text: &str| SingleStoreVersion::parse(text).map(SingleStoreVersion::supports_reset_connection);
        assert_eq!(version("7.5.2"), Some(true));
        assert_eq!(version("7.8.19"), Some(true));
        assert_eq!(version("8.0"), Some(true));
        assert_eq!(version("7.5.1"), Some(false));
        assert_eq!(version("7.3.10-4fd6a3c"), Some(false));
        assert_eq!(version("6"), Some(false));
        assert_eq!(version("@@memsql_version"), None);
        assert_eq!(
            SingleStoreVersion::parse("8.1.32-e3d3cde6da"),
            Some(SingleStoreVersion {
                major: 8,
                minor: 1,
                patch: 32
            })
        );
    }

    #[test]
    fn isolation_only_without_com_reset() {
        let opts = Opts::default();
        let mut flags = StateFlags::default();
        flags.set(StateFlags::TRANSACTION_ISOLATION);
        assert!(reset_plan(flags, &opts, true).is_empty());
        assert_eq!(
            reset_plan(flags, &opts, false),
            vec![SessionProperty::TransactionIsolation(
                IsolationLevel::RepeatableRead
            )]
        );
    }

    #[test]
    fn property_commands() {
        assert_eq!(
            SessionProperty::Autocommit(false).command(),
            Some(Command::Query("set autocommit=0".into()))
        );
        assert_eq!(
            SessionProperty::TransactionIsolation(IsolationLevel::ReadCommitted).command(),
            Some(Command::Query(
                "SET SESSION TRANSACTION ISOLATION LEVEL READ COMMITTED".into()
            ))
        );
        assert_eq!(SessionProperty::ReadOnly(true).command(), None);
    }
}
