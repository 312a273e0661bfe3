//! Connection phase state machine: greeting, TLS upgrade and authentication.

use tracing::debug;

use crate::auth::{AuthContext, AuthPlugin, AuthReply, Credential};
use crate::buffer_set::BufferSet;
use crate::constant::{CapabilityFlags, StatusFlags, UTF8MB4_GENERAL_CI};
use crate::error::{Error, Result};
use crate::opts::{Opts, SslMode};
use crate::protocol::handshake::{
    AuthSwitchRequest, HandshakeResponse, InitialHandshake, default_attributes,
    parse_auth_more_data, write_handshake_response, write_ssl_request,
};
use crate::protocol::response::{OkPacket, header, parse_error};

use super::action::Action;

/// Max packet size announced to the server.
const CLIENT_MAX_PACKET: u32 = 1 << 30;

/// Connection phase state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Initial,
    AwaitingGreeting,
    TlsRequested,
    Authenticating,
    Authenticated,
    Failed,
}

/// What the connection phase established.
#[derive(Debug, Clone)]
pub struct HandshakeOutcome {
    /// Negotiated capabilities (client request intersected with the server's)
    pub capabilities: CapabilityFlags,
    pub status: StatusFlags,
    pub thread_id: u32,
    pub server_version: String,
    pub seed: Vec<u8>,
    pub charset: u8,
    pub tls: bool,
    pub auth_plugin: &'static str,
}

/// Sans-I/O driver of the connection phase.
pub struct HandshakeStateMachine<'a> {
    state: HandshakeState,
    opts: &'a Opts,
    credential: Credential,
    auth_plugin_hint: Option<String>,
    greeting: Option<InitialHandshake>,
    capabilities: CapabilityFlags,
    plugin: Option<AuthPlugin>,
    tls: bool,
    status: StatusFlags,
}

impl<'a> HandshakeStateMachine<'a> {
    /// `auth_plugin_hint` overrides the plugin advertised in the greeting.
    pub fn new(opts: &'a Opts, credential: Credential, auth_plugin_hint: Option<String>) -> Self {
        Self {
            state: HandshakeState::Initial,
            opts,
            credential,
            auth_plugin_hint,
            greeting: None,
            capabilities: CapabilityFlags::default(),
            plugin: None,
            tls: false,
            status: StatusFlags::default(),
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Process the packet in `buffer_set.read_buffer` (if the current state
    /// expects one) and return the next I/O to perform.
    pub fn step(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        let result = match self.state {
            HandshakeState::Initial => {
                self.state = HandshakeState::AwaitingGreeting;
                Ok(Action::ReadPacket)
            }
            HandshakeState::AwaitingGreeting => self.handle_greeting(buffer_set),
            HandshakeState::TlsRequested => {
                self.tls = true;
                self.write_response(buffer_set)
            }
            HandshakeState::Authenticating => self.handle_auth_packet(buffer_set),
            HandshakeState::Authenticated | HandshakeState::Failed => Err(Error::Protocol(
                format!("handshake step in state {:?}", self.state),
            )),
        };
        if result.is_err() {
            self.state = HandshakeState::Failed;
        }
        result
    }

    fn handle_greeting(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        let payload = &buffer_set.read_buffer;
        if payload.first() == Some(&header::ERR) {
            return Err(Error::Server(parse_error(payload)?));
        }
        let greeting = InitialHandshake::parse(payload)?;
        debug!(
            server_version = %greeting.server_version,
            thread_id = greeting.thread_id,
            plugin = %greeting.auth_plugin,
            "received greeting"
        );

        let want_tls = self.opts.ssl_mode != SslMode::Disable;
        let server_tls = greeting.capabilities.has(CapabilityFlags::CLIENT_SSL);
        if self.opts.ssl_mode.is_required() && !server_tls {
            return Err(Error::connection(
                "Trying to connect with ssl, but ssl not enabled in the server",
                None,
            ));
        }
        let use_tls = want_tls && server_tls && tls_available(self.opts.ssl_mode)?;

        self.capabilities = client_capabilities(self.opts, use_tls).intersect(greeting.capabilities);
        self.status = greeting.status;
        self.greeting = Some(greeting);

        if use_tls {
            buffer_set.write_buffer.clear();
            write_ssl_request(
                &mut buffer_set.write_buffer,
                self.capabilities,
                CLIENT_MAX_PACKET,
                UTF8MB4_GENERAL_CI,
            );
            self.state = HandshakeState::TlsRequested;
            return Ok(Action::WriteAndUpgradeTls);
        }
        self.write_response(buffer_set)
    }

    fn write_response(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        let greeting = self
            .greeting
            .as_ref()
            .ok_or_else(|| Error::Protocol("handshake response before greeting".into()))?;
        let plugin_name = self
            .auth_plugin_hint
            .as_deref()
            .unwrap_or(&greeting.auth_plugin);
        let mut plugin = AuthPlugin::from_name(plugin_name, self.opts.gssapi.as_ref())?;
        let auth_response = plugin.initial_response(
            &greeting.seed,
            &auth_context(&self.credential, self.opts, self.tls),
        )?;

        let mut attributes = default_attributes();
        attributes.extend(self.opts.connection_attributes.iter().cloned());
        let database = if self.opts.create_database_if_not_exist {
            None
        } else {
            self.opts.database.as_deref()
        };

        buffer_set.write_buffer.clear();
        write_handshake_response(
            &mut buffer_set.write_buffer,
            &HandshakeResponse {
                capabilities: self.capabilities,
                max_packet_size: CLIENT_MAX_PACKET,
                charset: UTF8MB4_GENERAL_CI,
                user: &self.credential.user,
                auth_response: &auth_response,
                database,
                auth_plugin: plugin.name(),
                attributes: &attributes,
            },
        );
        debug!(user = %self.credential.user, plugin = plugin.name(), tls = self.tls, "sending handshake response");
        self.plugin = Some(plugin);
        self.state = HandshakeState::Authenticating;
        Ok(Action::WriteAndReadPacket)
    }

    fn handle_auth_packet(&mut self, buffer_set: &mut BufferSet) -> Result<Action> {
        let payload = &buffer_set.read_buffer;
        match payload.first().copied() {
            Some(header::OK) => {
                let ok = OkPacket::parse(payload)?;
                self.status = ok.status;
                self.state = HandshakeState::Authenticated;
                Ok(Action::Finished)
            }
            Some(header::ERR) => Err(Error::Server(parse_error(payload)?)),
            Some(header::EOF) => {
                let switch = AuthSwitchRequest::parse(payload)?;
                debug!(plugin = %switch.plugin, "auth switch");
                let mut plugin = AuthPlugin::from_name(&switch.plugin, self.opts.gssapi.as_ref())?;
                let response = plugin.initial_response(
                    &switch.data,
                    &auth_context(&self.credential, self.opts, self.tls),
                )?;
                if let Some(greeting) = self.greeting.as_mut() {
                    greeting.seed = switch.data;
                }
                self.plugin = Some(plugin);
                buffer_set.write_buffer.clear();
                buffer_set.write_buffer.extend_from_slice(&response);
                Ok(Action::WriteAndReadPacket)
            }
            Some(header::AUTH_MORE_DATA) => {
                let data = parse_auth_more_data(payload)?;
                let ctx = auth_context(&self.credential, self.opts, self.tls);
                let reply = match self.plugin.as_mut() {
                    Some(plugin) => plugin.more_data(data, &ctx)?,
                    None => return Err(Error::Protocol("AuthMoreData before plugin selection".into())),
                };
                match reply {
                    AuthReply::Send(response) => {
                        buffer_set.write_buffer.clear();
                        buffer_set.write_buffer.extend_from_slice(&response);
                        Ok(Action::WriteAndReadPacket)
                    }
                    AuthReply::Wait => Ok(Action::ReadPacket),
                }
            }
            other => Err(Error::Protocol(format!(
                "unexpected packet during authentication: {other:?}"
            ))),
        }
    }

    /// Consume the finished machine.
    pub fn into_outcome(self) -> Result<HandshakeOutcome> {
        match (self.state, self.greeting) {
            (HandshakeState::Authenticated, Some(greeting)) => Ok(HandshakeOutcome {
                capabilities: self.capabilities,
                status: self.status,
                thread_id: greeting.thread_id,
                server_version: greeting.server_version,
                seed: greeting.seed,
                charset: UTF8MB4_GENERAL_CI,
                tls: self.tls,
                auth_plugin: self.plugin.map_or("", |p| p.name()),
            }),
            (state, _) => Err(Error::Protocol(format!(
                "handshake not finished (state {state:?})"
            ))),
        }
    }
}

fn auth_context<'c>(credential: &'c Credential, opts: &'c Opts, tls: bool) -> AuthContext<'c> {
    AuthContext {
        password: credential.password.as_deref(),
        tls,
        allow_cleartext: opts.enable_cleartext_plugin,
        service_principal_name: opts.service_principal_name.as_deref(),
    }
}

fn tls_available(mode: SslMode) -> Result<bool> {
    if cfg!(feature = "tls") {
        Ok(true)
    } else if mode.is_required() {
        Err(Error::Unsupported(
            "TLS requested but the tls feature is not enabled".into(),
        ))
    } else {
        Ok(false)
    }
}

/// Capabilities requested by the client before intersecting with the server's.
pub fn client_capabilities(opts: &Opts, tls: bool) -> CapabilityFlags {
    let mut caps = CapabilityFlags::new(
        CapabilityFlags::CLIENT_LONG_PASSWORD
            | CapabilityFlags::CLIENT_LONG_FLAG
            | CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_TRANSACTIONS
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_MULTI_RESULTS
            | CapabilityFlags::CLIENT_PS_MULTI_RESULTS
            | CapabilityFlags::CLIENT_PLUGIN_AUTH
            | CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
            | CapabilityFlags::CLIENT_CONNECT_ATTRS
            | CapabilityFlags::CLIENT_DEPRECATE_EOF,
    );
    if opts.allow_multi_queries {
        caps.set(CapabilityFlags::CLIENT_MULTI_STATEMENTS);
    }
    if opts.allow_local_infile {
        caps.set(CapabilityFlags::CLIENT_LOCAL_FILES);
    }
    if opts.database.is_some() && !opts.create_database_if_not_exist {
        caps.set(CapabilityFlags::CLIENT_CONNECT_WITH_DB);
    }
    if opts.compress {
        caps.set(CapabilityFlags::CLIENT_COMPRESS);
    }
    if tls {
        caps.set(CapabilityFlags::CLIENT_SSL);
    }
    caps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::plugins;
    use crate::protocol::codec::{read_cstr, write_cstr};
    use crate::protocol::handshake::tests::greeting;

    const SERVER_CAPS: u64 = CapabilityFlags::CLIENT_LONG_PASSWORD
        | CapabilityFlags::CLIENT_PROTOCOL_41
        | CapabilityFlags::CLIENT_TRANSACTIONS
        | CapabilityFlags::CLIENT_SECURE_CONNECTION
        | CapabilityFlags::CLIENT_MULTI_RESULTS
        | CapabilityFlags::CLIENT_PLUGIN_AUTH
        | CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
        | CapabilityFlags::CLIENT_CONNECT_WITH_DB
        | CapabilityFlags::CLIENT_CONNECT_ATTRS;

    fn credential() -> Credential {
        Credential {
            user: "root".into(),
            password: Some("secret".into()),
        }
    }

    fn plain_opts() -> Opts {
        Opts {
            ssl_mode: SslMode::Disable,
            ..Opts::default()
        }
    }

    fn ok_packet() -> Vec<u8> {
        vec![0x00, 0, 0, 0x02, 0x00, 0, 0]
    }

    #[test]
    fn native_password_flow() {
        let opts = Opts {
            database: Some("db".into()),
            ..plain_opts()
        };
        let mut sm = HandshakeStateMachine::new(&opts, credential(), None);
        let mut buffers = BufferSet::new();
        assert_eq!(sm.step(&mut buffers).unwrap(), Action::ReadPacket);

        buffers.read_buffer = greeting(SERVER_CAPS, plugins::MYSQL_NATIVE_PASSWORD);
        assert_eq!(sm.step(&mut buffers).unwrap(), Action::WriteAndReadPacket);
        let (user, _) = read_cstr(&buffers.write_buffer[32..]).unwrap();
        assert_eq!(user, "root");

        buffers.read_buffer = ok_packet();
        assert_eq!(sm.step(&mut buffers).unwrap(), Action::Finished);

        let outcome = sm.into_outcome().unwrap();
        assert_eq!(outcome.thread_id, 42);
        assert_eq!(outcome.auth_plugin, plugins::MYSQL_NATIVE_PASSWORD);
        assert!(outcome.capabilities.has(CapabilityFlags::CLIENT_CONNECT_WITH_DB));
        // not offered by the server
        assert!(!outcome.capabilities.has(CapabilityFlags::CLIENT_DEPRECATE_EOF));
        assert!(!outcome.tls);
    }

    #[test]
    fn error_greeting() {
        let opts = plain_opts();
        let mut sm = HandshakeStateMachine::new(&opts, credential(), None);
        let mut buffers = BufferSet::new();
        sm.step(&mut buffers).unwrap();
        buffers.read_buffer = b"\xff\x10\x04Too many connections".to_vec();
        let err = sm.step(&mut buffers).unwrap_err();
        assert_eq!(err.error_code(), Some(1040));
        assert_eq!(sm.state(), HandshakeState::Failed);
    }

    #[test]
    fn required_tls_without_server_support() {
        let opts = Opts {
            ssl_mode: SslMode::Require,
            ..Opts::default()
        };
        let mut sm = HandshakeStateMachine::new(&opts, credential(), None);
        let mut buffers = BufferSet::new();
        sm.step(&mut buffers).unwrap();
        buffers.read_buffer = greeting(SERVER_CAPS, plugins::MYSQL_NATIVE_PASSWORD);
        assert!(matches!(
            sm.step(&mut buffers),
            Err(Error::Connection { .. })
        ));
    }

    #[test]
    fn caching_sha2_fast_auth() {
        let opts = plain_opts();
        let mut sm = HandshakeStateMachine::new(&opts, credential(), None);
        let mut buffers = BufferSet::new();
        sm.step(&mut buffers).unwrap();
        buffers.read_buffer = greeting(SERVER_CAPS, plugins::CACHING_SHA2_PASSWORD);
        assert_eq!(sm.step(&mut buffers).unwrap(), Action::WriteAndReadPacket);

        buffers.read_buffer = vec![0x01, 0x03];
        assert_eq!(sm.step(&mut buffers).unwrap(), Action::ReadPacket);
        buffers.read_buffer = ok_packet();
        assert_eq!(sm.step(&mut buffers).unwrap(), Action::Finished);
    }

    #[test]
    fn caching_sha2_full_auth_needs_tls() {
        let opts = plain_opts();
        let mut sm = HandshakeStateMachine::new(&opts, credential(), None);
        let mut buffers = BufferSet::new();
        sm.step(&mut buffers).unwrap();
        buffers.read_buffer = greeting(SERVER_CAPS, plugins::CACHING_SHA2_PASSWORD);
        sm.step(&mut buffers).unwrap();
        buffers.read_buffer = vec![0x01, 0x04];
        assert!(matches!(sm.step(&mut buffers), Err(Error::Auth(_))));
    }

    #[test]
    fn auth_switch_to_clear_password() {
        let opts = Opts {
            enable_cleartext_plugin: true,
            ..plain_opts()
        };
        let mut sm = HandshakeStateMachine::new(&opts, credential(), None);
        let mut buffers = BufferSet::new();
        sm.step(&mut buffers).unwrap();
        buffers.read_buffer = greeting(SERVER_CAPS, plugins::MYSQL_NATIVE_PASSWORD);
        sm.step(&mut buffers).unwrap();

        let mut switch = vec![0xfe];
        write_cstr(&mut switch, plugins::MYSQL_CLEAR_PASSWORD);
        buffers.read_buffer = switch;
        assert_eq!(sm.step(&mut buffers).unwrap(), Action::WriteAndReadPacket);
        assert_eq!(buffers.write_buffer, b"secret\0");

        buffers.read_buffer = ok_packet();
        assert_eq!(sm.step(&mut buffers).unwrap(), Action::Finished);
        assert_eq!(
            sm.into_outcome().unwrap().auth_plugin,
            plugins::MYSQL_CLEAR_PASSWORD
        );
    }

    #[test]
    fn clear_password_refused_without_tls() {
        let opts = plain_opts();
        let mut sm = HandshakeStateMachine::new(
            &opts,
            credential(),
            Some(plugins::MYSQL_CLEAR_PASSWORD.into()),
        );
        let mut buffers = BufferSet::new();
        sm.step(&mut buffers).unwrap();
        buffers.read_buffer = greeting(SERVER_CAPS, plugins::MYSQL_NATIVE_PASSWORD);
        assert!(matches!(sm.step(&mut buffers), Err(Error::Auth(_))));
    }

    #[test]
    fn requested_capabilities_follow_options() {
        let opts = Opts {
            allow_local_infile: true,
            compress: true,
            database: Some("db".into()),
            create_database_if_not_exist: true,
            ..Opts::default()
        };
        let caps = client_capabilities(&opts, false);
        assert!(caps.has(CapabilityFlags::CLIENT_LOCAL_FILES));
        assert!(caps.has(CapabilityFlags::CLIENT_COMPRESS));
        assert!(!caps.has(CapabilityFlags::CLIENT_CONNECT_WITH_DB));
        assert!(!caps.has(CapabilityFlags::CLIENT_SSL));
        assert!(!caps.has(CapabilityFlags::CLIENT_MULTI_STATEMENTS));
    }
}
