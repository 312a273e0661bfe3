//! Connection options.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use no_panic::no_panic;

use crate::auth::{CredentialProvider, GssapiProvider};
use crate::state::context::IsolationLevel;

/// SSL connection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Don't use SSL
    Disable,
    /// Use SSL when the server supports it, without certificate checks
    #[default]
    Prefer,
    /// Require SSL, without certificate checks
    Require,
    /// Require SSL and verify the server certificate chain
    VerifyCa,
    /// Require SSL, verify the chain and the host name
    VerifyFull,
}

impl SslMode {
    pub fn is_required(self) -> bool {
        !matches!(self, SslMode::Disable | SslMode::Prefer)
    }
}

/// Connection options for SingleStore.
#[derive(Debug, Clone)]
pub struct Opts {
    /// Hostname or IP address.
    ///
    /// Default: `""`
    pub host: String,

    /// Port number.
    ///
    /// Default: `3306`
    pub port: u16,

    /// Unix socket path. Takes precedence over `host`.
    ///
    /// Default: `None`
    pub socket: Option<String>,

    /// Username for authentication.
    ///
    /// Default: `""`
    pub user: String,

    /// Password for authentication.
    ///
    /// Default: `None`
    pub password: Option<String>,

    /// Database to select after connecting.
    ///
    /// Default: `None`
    pub database: Option<String>,

    /// SSL connection mode.
    ///
    /// Default: `SslMode::Prefer`
    pub ssl_mode: SslMode,

    /// PEM file with the CA certificate used by `VerifyCa` / `VerifyFull`.
    ///
    /// Default: `None`
    pub tls_ca_cert: Option<PathBuf>,

    /// Negotiate protocol compression.
    ///
    /// Default: `false`
    pub compress: bool,

    /// Overrides the server's `max_allowed_packet` for the client-side size check.
    ///
    /// Default: `None` (use the value read after connecting)
    pub max_allowed_packet: Option<usize>,

    /// TCP connect timeout.
    ///
    /// Default: `Some(30s)`
    pub connect_timeout: Option<Duration>,

    /// Socket read/write timeout.
    ///
    /// Default: `None`
    pub socket_timeout: Option<Duration>,

    /// Source of user/password, consulted on every (re)connect. Overrides `user`/`password`.
    ///
    /// Default: `None`
    pub credential_provider: Option<Arc<dyn CredentialProvider>>,

    /// GSS-API implementation for `auth_gssapi_client`.
    ///
    /// Default: `None`
    pub gssapi: Option<Arc<dyn GssapiProvider>>,

    /// Kerberos service principal name, overriding the one sent by the server.
    ///
    /// Default: `None`
    pub service_principal_name: Option<String>,

    /// Allow `mysql_clear_password` on a connection without TLS.
    ///
    /// Default: `false`
    pub enable_cleartext_plugin: bool,

    /// Use server-side prepared statements for parameterized batches.
    ///
    /// Default: `true`
    pub use_server_prepare: bool,

    /// Cache server-side prepared statements per connection.
    ///
    /// Default: `true`
    pub cache_prep_stmts: bool,

    /// Capacity of the prepared statement cache.
    ///
    /// Default: `250`
    pub prep_stmt_cache_size: usize,

    /// Record commands of the open transaction and replay them after a failover.
    ///
    /// Default: `false`
    pub transaction_replay: bool,

    /// Never pipeline commands.
    ///
    /// Default: `false`
    pub disable_pipeline: bool,

    /// Answer `LOAD DATA LOCAL INFILE` requests.
    ///
    /// Default: `false`
    pub allow_local_infile: bool,

    /// Allow several statements in one COM_QUERY.
    ///
    /// Default: `false`
    pub allow_multi_queries: bool,

    /// Use COM_RESET_CONNECTION in [`reset`](crate::sync::Conn::reset).
    ///
    /// Default: `true`
    pub use_reset_connection: bool,

    /// Autocommit mode set after connecting (`None` keeps the server default).
    ///
    /// Default: `Some(true)`
    pub autocommit: Option<bool>,

    /// Transaction isolation set after connecting.
    ///
    /// Default: `None`
    pub transaction_isolation: Option<IsolationLevel>,

    /// Session variables set after connecting.
    ///
    /// Default: `[]`
    pub session_variables: Vec<(String, String)>,

    /// Statements run after connecting, in order.
    ///
    /// Default: `[]`
    pub init_sql: Vec<String>,

    /// Create `database` if it does not exist.
    ///
    /// Default: `false`
    pub create_database_if_not_exist: bool,

    /// Truncate logged SQL to this many bytes.
    ///
    /// Default: `1024`
    pub max_query_size_to_log: usize,

    /// Extra connection attributes sent with the handshake.
    ///
    /// Default: `[]`
    pub connection_attributes: Vec<(String, String)>,
}

impl Default for Opts {
    #[no_panic]
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 3306,
            socket: None,
            user: String::new(),
            password: None,
            database: None,
            ssl_mode: SslMode::Prefer,
            tls_ca_cert: None,
            compress: false,
            max_allowed_packet: None,
            connect_timeout: Some(Duration::from_secs(30)),
            socket_timeout: None,
            credential_provider: None,
            gssapi: None,
            service_principal_name: None,
            enable_cleartext_plugin: false,
            use_server_prepare: true,
            cache_prep_stmts: true,
            prep_stmt_cache_size: 250,
            transaction_replay: false,
            disable_pipeline: false,
            allow_local_infile: false,
            allow_multi_queries: false,
            use_reset_connection: true,
            autocommit: Some(true),
            transaction_isolation: None,
            session_variables: Vec::new(),
            init_sql: Vec::new(),
            create_database_if_not_exist: false,
            max_query_size_to_log: 1024,
            connection_attributes: Vec::new(),
        }
    }
}

impl Opts {
    /// `host:port` or the socket path, for logs and errors.
    pub fn target(&self) -> String {
        match &self.socket {
            Some(path) => path.clone(),
            None => format!("{}:{}", self.host, self.port),
        }
    }
}
