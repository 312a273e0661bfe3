//! Protocol constants shared by the codec, the handshake and the executor.

/// Command bytes (first payload byte of every client command packet).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandByte {
    Quit = 0x01,
    InitDb = 0x02,
    Query = 0x03,
    Ping = 0x0e,
    ChangeUser = 0x11,
    StmtPrepare = 0x16,
    StmtExecute = 0x17,
    StmtSendLongData = 0x18,
    StmtClose = 0x19,
    StmtReset = 0x1a,
    SetOption = 0x1b,
    StmtFetch = 0x1c,
    ResetConnection = 0x1f,
}

/// Capability flags exchanged during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapabilityFlags(pub u64);

impl CapabilityFlags {
    pub const CLIENT_LONG_PASSWORD: u64 = 0x0000_0001;
    pub const CLIENT_FOUND_ROWS: u64 = 0x0000_0002;
    pub const CLIENT_LONG_FLAG: u64 = 0x0000_0004;
    pub const CLIENT_CONNECT_WITH_DB: u64 = 0x0000_0008;
    pub const CLIENT_NO_SCHEMA: u64 = 0x0000_0010;
    pub const CLIENT_COMPRESS: u64 = 0x0000_0020;
    pub const CLIENT_ODBC: u64 = 0x0000_0040;
    pub const CLIENT_LOCAL_FILES: u64 = 0x0000_0080;
    pub const CLIENT_IGNORE_SPACE: u64 = 0x0000_0100;
    pub const CLIENT_PROTOCOL_41: u64 = 0x0000_0200;
    pub const CLIENT_INTERACTIVE: u64 = 0x0000_0400;
    pub const CLIENT_SSL: u64 = 0x0000_0800;
    pub const CLIENT_IGNORE_SIGPIPE: u64 = 0x0000_1000;
    pub const CLIENT_TRANSACTIONS: u64 = 0x0000_2000;
    pub const CLIENT_RESERVED: u64 = 0x0000_4000;
    pub const CLIENT_SECURE_CONNECTION: u64 = 0x0000_8000;
    pub const CLIENT_MULTI_STATEMENTS: u64 = 0x0001_0000;
    pub const CLIENT_MULTI_RESULTS: u64 = 0x0002_0000;
    pub const CLIENT_PS_MULTI_RESULTS: u64 = 0x0004_0000;
    pub const CLIENT_PLUGIN_AUTH: u64 = 0x0008_0000;
    pub const CLIENT_CONNECT_ATTRS: u64 = 0x0010_0000;
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u64 = 0x0020_0000;
    pub const CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS: u64 = 0x0040_0000;
    pub const CLIENT_SESSION_TRACK: u64 = 0x0080_0000;
    pub const CLIENT_DEPRECATE_EOF: u64 = 0x0100_0000;

    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn has(&self, flag: u64) -> bool {
        (self.0 & flag) != 0
    }

    pub fn set(&mut self, flag: u64) {
        self.0 |= flag;
    }

    pub fn unset(&mut self, flag: u64) {
        self.0 &= !flag;
    }

    /// Flags present on both sides.
    pub fn intersect(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Lower 32 bits, as written in the handshake response.
    pub fn lower_u32(self) -> u32 {
        (self.0 & 0xffff_ffff) as u32
    }
}

/// Server status flags, carried by OK and EOF packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusFlags(pub u16);

impl StatusFlags {
    pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
    pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
    pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
    pub const SERVER_STATUS_NO_GOOD_INDEX_USED: u16 = 0x0010;
    pub const SERVER_STATUS_NO_INDEX_USED: u16 = 0x0020;
    pub const SERVER_STATUS_CURSOR_EXISTS: u16 = 0x0040;
    pub const SERVER_STATUS_LAST_ROW_SENT: u16 = 0x0080;
    pub const SERVER_STATUS_DB_DROPPED: u16 = 0x0100;
    pub const SERVER_STATUS_NO_BACKSLASH_ESCAPES: u16 = 0x0200;
    pub const SERVER_STATUS_METADATA_CHANGED: u16 = 0x0400;
    pub const SERVER_QUERY_WAS_SLOW: u16 = 0x0800;
    pub const SERVER_PS_OUT_PARAMS: u16 = 0x1000;
    pub const SERVER_STATUS_IN_TRANS_READONLY: u16 = 0x2000;
    pub const SERVER_SESSION_STATE_CHANGED: u16 = 0x4000;

    pub fn new(value: u16) -> Self {
        Self(value)
    }

    pub fn has(&self, flag: u16) -> bool {
        (self.0 & flag) != 0
    }

    pub fn in_transaction(&self) -> bool {
        self.has(Self::SERVER_STATUS_IN_TRANS)
    }

    pub fn autocommit(&self) -> bool {
        self.has(Self::SERVER_STATUS_AUTOCOMMIT)
    }

    pub fn more_results(&self) -> bool {
        self.has(Self::SERVER_MORE_RESULTS_EXISTS)
    }

    pub fn no_backslash_escapes(&self) -> bool {
        self.has(Self::SERVER_STATUS_NO_BACKSLASH_ESCAPES)
    }
}

/// Column type codes used by column definitions and binary parameters.
#[allow(non_camel_case_types)]
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    MYSQL_TYPE_DECIMAL = 0x00,
    MYSQL_TYPE_TINY = 0x01,
    MYSQL_TYPE_SHORT = 0x02,
    MYSQL_TYPE_LONG = 0x03,
    MYSQL_TYPE_FLOAT = 0x04,
    MYSQL_TYPE_DOUBLE = 0x05,
    MYSQL_TYPE_NULL = 0x06,
    MYSQL_TYPE_TIMESTAMP = 0x07,
    MYSQL_TYPE_LONGLONG = 0x08,
    MYSQL_TYPE_INT24 = 0x09,
    MYSQL_TYPE_DATE = 0x0a,
    MYSQL_TYPE_TIME = 0x0b,
    MYSQL_TYPE_DATETIME = 0x0c,
    MYSQL_TYPE_YEAR = 0x0d,
    MYSQL_TYPE_NEWDATE = 0x0e,
    MYSQL_TYPE_VARCHAR = 0x0f,
    MYSQL_TYPE_BIT = 0x10,
    MYSQL_TYPE_JSON = 0xf5,
    MYSQL_TYPE_NEWDECIMAL = 0xf6,
    MYSQL_TYPE_ENUM = 0xf7,
    MYSQL_TYPE_SET = 0xf8,
    MYSQL_TYPE_TINY_BLOB = 0xf9,
    MYSQL_TYPE_MEDIUM_BLOB = 0xfa,
    MYSQL_TYPE_LONG_BLOB = 0xfb,
    MYSQL_TYPE_BLOB = 0xfc,
    MYSQL_TYPE_VAR_STRING = 0xfd,
    MYSQL_TYPE_STRING = 0xfe,
    MYSQL_TYPE_GEOMETRY = 0xff,
}

impl ColumnType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::MYSQL_TYPE_DECIMAL),
            0x01 => Some(Self::MYSQL_TYPE_TINY),
            0x02 => Some(Self::MYSQL_TYPE_SHORT),
            0x03 => Some(Self::MYSQL_TYPE_LONG),
            0x04 => Some(Self::MYSQL_TYPE_FLOAT),
            0x05 => Some(Self::MYSQL_TYPE_DOUBLE),
            0x06 => Some(Self::MYSQL_TYPE_NULL),
            0x07 => Some(Self::MYSQL_TYPE_TIMESTAMP),
            0x08 => Some(Self::MYSQL_TYPE_LONGLONG),
            0x09 => Some(Self::MYSQL_TYPE_INT24),
            0x0a => Some(Self::MYSQL_TYPE_DATE),
            0x0b => Some(Self::MYSQL_TYPE_TIME),
            0x0c => Some(Self::MYSQL_TYPE_DATETIME),
            0x0d => Some(Self::MYSQL_TYPE_YEAR),
            0x0e => Some(Self::MYSQL_TYPE_NEWDATE),
            0x0f => Some(Self::MYSQL_TYPE_VARCHAR),
            0x10 => Some(Self::MYSQL_TYPE_BIT),
            0xf5 => Some(Self::MYSQL_TYPE_JSON),
            0xf6 => Some(Self::MYSQL_TYPE_NEWDECIMAL),
            0xf7 => Some(Self::MYSQL_TYPE_ENUM),
            0xf8 => Some(Self::MYSQL_TYPE_SET),
            0xf9 => Some(Self::MYSQL_TYPE_TINY_BLOB),
            0xfa => Some(Self::MYSQL_TYPE_MEDIUM_BLOB),
            0xfb => Some(Self::MYSQL_TYPE_LONG_BLOB),
            0xfc => Some(Self::MYSQL_TYPE_BLOB),
            0xfd => Some(Self::MYSQL_TYPE_VAR_STRING),
            0xfe => Some(Self::MYSQL_TYPE_STRING),
            0xff => Some(Self::MYSQL_TYPE_GEOMETRY),
            _ => None,
        }
    }
}

/// Server error codes the client reacts to.
pub mod error_code {
    /// Access denied for user.
    pub const ACCESS_DENIED: u16 = 1045;
    /// Connection closed on the client side.
    pub const CONNECTION_CLOSED: u16 = 1220;
    /// Query execution was interrupted.
    pub const QUERY_INTERRUPTED: u16 = 1317;
    /// The browser SSO token (JWT) has expired.
    pub const JWT_TOKEN_EXPIRED: u16 = 2628;
}

/// Largest payload a single wire packet can carry.
pub const MAX_PACKET_PAYLOAD: usize = 0xff_ffff;

/// `utf8mb4_general_ci`
pub const UTF8MB4_GENERAL_CI: u8 = 45;

/// `utf8_general_ci`
pub const UTF8_GENERAL_CI: u8 = 33;
