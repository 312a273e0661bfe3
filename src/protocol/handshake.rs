//! Connection phase packets: server greeting, SSL request, handshake response
//! and authentication exchange packets.

use crate::constant::{CapabilityFlags, StatusFlags};
use crate::error::{Error, Result};
use crate::protocol::codec::{
    read_bytes, read_cstr, read_cstring, read_u8, read_u16, read_u32, write_bytes, write_cstr,
    write_lenenc_bytes, write_lenenc_int, write_u8, write_u32,
};
use crate::protocol::response::header;

/// Initial Handshake Packet (protocol version 10).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialHandshake {
    pub protocol_version: u8,
    pub server_version: String,
    pub thread_id: u32,
    /// Scramble (auth-plugin-data parts 1 and 2, without the trailing NUL)
    pub seed: Vec<u8>,
    pub capabilities: CapabilityFlags,
    pub charset: u8,
    pub status: StatusFlags,
    pub auth_plugin: String,
}

impl InitialHandshake {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (protocol_version, data) = read_u8(payload)?;
        if protocol_version != 10 {
            return Err(Error::Protocol(format!(
                "unsupported protocol version {protocol_version}"
            )));
        }
        let (server_version, data) = read_cstr(data)?;
        let (thread_id, data) = read_u32(data)?;
        let (seed1, data) = read_bytes(data, 8)?;
        let (_filler, data) = read_u8(data)?;
        let (cap_lower, data) = read_u16(data)?;

        let mut handshake = Self {
            protocol_version,
            server_version: server_version.to_owned(),
            thread_id,
            seed: seed1.to_vec(),
            capabilities: CapabilityFlags::new(u64::from(cap_lower)),
            charset: 0,
            status: StatusFlags::default(),
            auth_plugin: String::new(),
        };
        if data.is_empty() {
            return Ok(handshake);
        }

        let (charset, data) = read_u8(data)?;
        let (status, data) = read_u16(data)?;
        let (cap_upper, data) = read_u16(data)?;
        let (auth_data_len, data) = read_u8(data)?;
        let (_reserved, mut data) = read_bytes(data, 10)?;

        handshake.charset = charset;
        handshake.status = StatusFlags::new(status);
        handshake.capabilities = CapabilityFlags::new(
            u64::from(cap_lower) | (u64::from(cap_upper) << 16),
        );

        if handshake.capabilities.has(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
            let len = usize::from(auth_data_len).saturating_sub(8).max(13).min(data.len());
            let (seed2, rest) = read_bytes(data, len)?;
            let seed2 = seed2.strip_suffix(&[0]).unwrap_or(seed2);
            handshake.seed.extend_from_slice(seed2);
            data = rest;
        }

        if handshake.capabilities.has(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
            let name = match read_cstring(data) {
                Ok((name, _)) => name,
                // some servers omit the terminator on the last field
                Err(_) => data,
            };
            handshake.auth_plugin = String::from_utf8_lossy(name).into_owned();
        }

        Ok(handshake)
    }
}

/// Write an SSLRequest packet payload.
pub fn write_ssl_request(
    out: &mut Vec<u8>,
    capabilities: CapabilityFlags,
    max_packet_size: u32,
    charset: u8,
) {
    write_u32(out, capabilities.lower_u32());
    write_u32(out, max_packet_size);
    write_u8(out, charset);
    write_bytes(out, &[0; 23]);
}

/// HandshakeResponse41 fields.
#[derive(Debug)]
pub struct HandshakeResponse<'a> {
    pub capabilities: CapabilityFlags,
    pub max_packet_size: u32,
    pub charset: u8,
    pub user: &'a str,
    pub auth_response: &'a [u8],
    pub database: Option<&'a str>,
    pub auth_plugin: &'a str,
    pub attributes: &'a [(String, String)],
}

/// Write a HandshakeResponse41 packet payload.
pub fn write_handshake_response(out: &mut Vec<u8>, response: &HandshakeResponse<'_>) {
    let caps = response.capabilities;
    write_u32(out, caps.lower_u32());
    write_u32(out, response.max_packet_size);
    write_u8(out, response.charset);
    write_bytes(out, &[0; 23]);
    write_cstr(out, response.user);

    if caps.has(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA) {
        write_lenenc_bytes(out, response.auth_response);
    } else {
        let len = response.auth_response.len().min(255);
        write_u8(out, len as u8);
        write_bytes(out, &response.auth_response[..len]);
    }

    if caps.has(CapabilityFlags::CLIENT_CONNECT_WITH_DB) {
        write_cstr(out, response.database.unwrap_or_default());
    }

    if caps.has(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
        write_cstr(out, response.auth_plugin);
    }

    if caps.has(CapabilityFlags::CLIENT_CONNECT_ATTRS) {
        let mut attrs = Vec::new();
        for (key, value) in response.attributes {
            write_lenenc_bytes(&mut attrs, key.as_bytes());
            write_lenenc_bytes(&mut attrs, value.as_bytes());
        }
        write_lenenc_int(out, attrs.len() as u64);
        write_bytes(out, &attrs);
    }
}

/// Auth Switch Request (0xfe): the server asks for another plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSwitchRequest {
    pub plugin: String,
    pub data: Vec<u8>,
}

impl AuthSwitchRequest {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (head, data) = read_u8(payload)?;
        if head != header::EOF {
            return Err(Error::Protocol(format!(
                "AuthSwitchRequest: unexpected header 0x{head:02x}"
            )));
        }
        let (plugin, data) = read_cstr(data)?;
        let data = data.strip_suffix(&[0]).unwrap_or(data);
        Ok(Self {
            plugin: plugin.to_owned(),
            data: data.to_vec(),
        })
    }
}

/// Auth More Data (0x01) body.
pub fn parse_auth_more_data(payload: &[u8]) -> Result<&[u8]> {
    match payload.split_first() {
        Some((&header::AUTH_MORE_DATA, data)) => Ok(data),
        _ => Err(Error::Protocol("AuthMoreData: unexpected header".into())),
    }
}

/// Connection attributes sent with every handshake.
pub fn default_attributes() -> Vec<(String, String)> {
    vec![
        ("_client_name".to_owned(), env!("CARGO_PKG_NAME").to_owned()),
        ("_client_version".to_owned(), env!("CARGO_PKG_VERSION").to_owned()),
        ("_os".to_owned(), std::env::consts::OS.to_owned()),
        ("_pid".to_owned(), std::process::id().to_string()),
    ]
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::codec::{read_lenenc_bytes, read_lenenc_u64};

    /// Greeting as sent by a SingleStore aggregator.
    pub(crate) fn greeting(capabilities: u64, plugin: &str) -> Vec<u8> {
        let mut out = vec![10];
        write_cstr(&mut out, "5.7.32");
        write_u32(&mut out, 42);
        write_bytes(&mut out, b"abcdefgh");
        write_u8(&mut out, 0);
        out.extend_from_slice(&((capabilities & 0xffff) as u16).to_le_bytes());
        write_u8(&mut out, 33);
        out.extend_from_slice(&StatusFlags::SERVER_STATUS_AUTOCOMMIT.to_le_bytes());
        out.extend_from_slice(&(((capabilities >> 16) & 0xffff) as u16).to_le_bytes());
        write_u8(&mut out, 21);
        write_bytes(&mut out, &[0; 10]);
        write_bytes(&mut out, b"ijklmnopqrst\0");
        write_cstr(&mut out, plugin);
        out
    }

    #[test]
    fn parse_greeting() {
        let caps = CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_PLUGIN_AUTH
            | CapabilityFlags::CLIENT_SSL;
        let hs = InitialHandshake::parse(&greeting(caps, "mysql_native_password")).unwrap();
        assert_eq!(hs.server_version, "5.7.32");
        assert_eq!(hs.thread_id, 42);
        assert_eq!(hs.seed, b"abcdefghijklmnopqrst");
        assert_eq!(hs.capabilities.0, caps);
        assert_eq!(hs.charset, 33);
        assert!(hs.status.autocommit());
        assert_eq!(hs.auth_plugin, "mysql_native_password");
    }

    #[test]
    fn reject_old_protocol() {
        assert!(InitialHandshake::parse(&[9, 0]).is_err());
    }

    #[test]
    fn handshake_response_layout() {
        let caps = CapabilityFlags::new(
            CapabilityFlags::CLIENT_PROTOCOL_41
                | CapabilityFlags::CLIENT_PLUGIN_AUTH
                | CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA
                | CapabilityFlags::CLIENT_CONNECT_WITH_DB
                | CapabilityFlags::CLIENT_CONNECT_ATTRS,
        );
        let attrs = vec![("_os".to_owned(), "linux".to_owned())];
        let mut out = Vec::new();
        write_handshake_response(
            &mut out,
            &HandshakeResponse {
                capabilities: caps,
                max_packet_size: 1 << 30,
                charset: 45,
                user: "root",
                auth_response: &[1, 2, 3],
                database: Some("db"),
                auth_plugin: "mysql_native_password",
                attributes: &attrs,
            },
        );

        assert_eq!(&out[..4], &caps.lower_u32().to_le_bytes());
        assert_eq!(out[8], 45);
        let (user, rest) = read_cstr(&out[32..]).unwrap();
        assert_eq!(user, "root");
        let (auth, rest) = read_lenenc_bytes(rest).unwrap();
        assert_eq!(auth, Some(&[1_u8, 2, 3][..]));
        let (db, rest) = read_cstr(rest).unwrap();
        assert_eq!(db, "db");
        let (plugin, rest) = read_cstr(rest).unwrap();
        assert_eq!(plugin, "mysql_native_password");
        let (attr_len, rest) = read_lenenc_u64(rest).unwrap();
        assert_eq!(attr_len as usize, rest.len());
    }

    #[test]
    fn ssl_request_is_32_bytes() {
        let mut out = Vec::new();
        write_ssl_request(&mut out, CapabilityFlags::new(CapabilityFlags::CLIENT_SSL), 1024, 45);
        assert_eq!(out.len(), 32);
    }

    #[test]
    fn auth_switch() {
        let mut payload = vec![0xfe];
        write_cstr(&mut payload, "mysql_clear_password");
        payload.push(0);
        let switch = AuthSwitchRequest::parse(&payload).unwrap();
        assert_eq!(switch.plugin, "mysql_clear_password");
        assert!(switch.data.is_empty());

        assert_eq!(parse_auth_more_data(&[0x01, 0x03]).unwrap(), &[0x03]);
    }
}
