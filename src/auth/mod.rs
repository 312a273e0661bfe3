//! Authentication plugins.
//!
//! - `mysql_native_password`: `SHA1(password) XOR SHA1(seed + SHA1(SHA1(password)))`
//! - `caching_sha2_password`: `XOR(SHA256(password), SHA256(SHA256(SHA256(password)) + seed))`,
//!   full authentication sends the password and is only allowed over TLS
//! - `mysql_clear_password`: password (or SSO token) as a NUL-terminated string
//! - `auth_gssapi_client`: token exchange driven by a [`GssapiClient`]

mod credential;
mod gssapi;
mod sso;

use std::sync::Arc;

use sha1::Sha1;
use sha2::{Digest, Sha256};

pub use credential::{Credential, CredentialProvider, StaticCredential};
pub(crate) use credential::with_sso_retry;
pub use gssapi::{GssapiClient, GssapiProvider, GssapiStep};
pub use sso::{SsoCredentialProvider, TokenCache, jwt_expiry};

use crate::error::{Error, Result};

/// Well-known authentication plugin names.
pub mod plugins {
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    pub const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";
    pub const MYSQL_CLEAR_PASSWORD: &str = "mysql_clear_password";
    pub const AUTH_GSSAPI_CLIENT: &str = "auth_gssapi_client";
}

/// caching_sha2_password AuthMoreData codes.
mod caching_sha2 {
    pub const FAST_AUTH_SUCCESS: u8 = 0x03;
    pub const PERFORM_FULL_AUTH: u8 = 0x04;
}

/// Compute the mysql_native_password scramble. Empty password sends nothing.
pub fn native_password_scramble(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let seed = seed.get(..20).unwrap_or(seed);

    let stage1: [u8; 20] = Sha1::digest(password.as_bytes()).into();
    let stage2: [u8; 20] = Sha1::digest(stage1).into();
    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(stage2);
    let stage3: [u8; 20] = hasher.finalize().into();

    stage1.iter().zip(stage3.iter()).map(|(a, b)| a ^ b).collect()
}

/// Compute the caching_sha2_password fast-auth scramble.
pub fn caching_sha2_scramble(password: &str, seed: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return Vec::new();
    }
    let seed = seed.get(..20).unwrap_or(seed);

    let hash1: [u8; 32] = Sha256::digest(password.as_bytes()).into();
    let hash2: [u8; 32] = Sha256::digest(hash1).into();
    let mut hasher = Sha256::new();
    hasher.update(hash2);
    hasher.update(seed);
    let scramble: [u8; 32] = hasher.finalize().into();

    hash1.iter().zip(scramble.iter()).map(|(a, b)| a ^ b).collect()
}

fn nul_terminated(password: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(password.len() + 1);
    out.extend_from_slice(password.as_bytes());
    out.push(0);
    out
}

/// Inputs every plugin may need.
#[derive(Debug, Clone, Copy)]
pub struct AuthContext<'a> {
    pub password: Option<&'a str>,
    /// TLS is active on the socket
    pub tls: bool,
    /// Allow mysql_clear_password on a plaintext socket
    pub allow_cleartext: bool,
    /// Overrides the principal name sent by the server
    pub service_principal_name: Option<&'a str>,
}

/// What to do after the server sent AuthMoreData.
#[derive(Debug, PartialEq, Eq)]
pub enum AuthReply {
    /// Send this payload and read the next packet
    Send(Vec<u8>),
    /// Read the next packet without writing
    Wait,
}

/// An authentication plugin selected for the current exchange.
pub enum AuthPlugin {
    NativePassword,
    CachingSha2,
    ClearPassword,
    Gssapi {
        provider: Arc<dyn GssapiProvider>,
        client: Option<Box<dyn GssapiClient>>,
    },
}

impl std::fmt::Debug for AuthPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl AuthPlugin {
    /// Select a plugin by the name the server (or credential provider) asked for.
    pub fn from_name(name: &str, gssapi: Option<&Arc<dyn GssapiProvider>>) -> Result<Self> {
        match name {
            plugins::MYSQL_NATIVE_PASSWORD | "" => Ok(Self::NativePassword),
            plugins::CACHING_SHA2_PASSWORD => Ok(Self::CachingSha2),
            plugins::MYSQL_CLEAR_PASSWORD => Ok(Self::ClearPassword),
            plugins::AUTH_GSSAPI_CLIENT => match gssapi {
                Some(provider) => Ok(Self::Gssapi {
                    provider: Arc::clone(provider),
                    client: None,
                }),
                None => Err(Error::Auth(
                    "server requested auth_gssapi_client but no GSSAPI provider is configured"
                        .into(),
                )),
            },
            other => Err(Error::Auth(format!(
                "Client does not support authentication protocol requested by server: {other}"
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NativePassword => plugins::MYSQL_NATIVE_PASSWORD,
            Self::CachingSha2 => plugins::CACHING_SHA2_PASSWORD,
            Self::ClearPassword => plugins::MYSQL_CLEAR_PASSWORD,
            Self::Gssapi { .. } => plugins::AUTH_GSSAPI_CLIENT,
        }
    }

    /// First response, computed from the greeting seed or auth switch data.
    pub fn initial_response(&mut self, data: &[u8], ctx: &AuthContext<'_>) -> Result<Vec<u8>> {
        let password = ctx.password.unwrap_or_default();
        match self {
            Self::NativePassword => Ok(native_password_scramble(password, data)),
            Self::CachingSha2 => Ok(caching_sha2_scramble(password, data)),
            Self::ClearPassword => {
                if !ctx.tls && !ctx.allow_cleartext {
                    return Err(Error::Auth(
                        "mysql_clear_password requires TLS (or enable_cleartext_plugin)".into(),
                    ));
                }
                Ok(match ctx.password {
                    Some(password) => nul_terminated(password),
                    None => Vec::new(),
                })
            }
            Self::Gssapi { provider, client } => {
                let (server_spn, mechanism) = split_gssapi_data(data);
                let spn = ctx.service_principal_name.unwrap_or(server_spn);
                if spn.is_empty() {
                    return Err(Error::Auth(
                        "No principal name defined on server. Please set server variable \
                         \"gssapi-principal-name\" or set option service_principal_name"
                            .into(),
                    ));
                }
                let mut new_client = provider.client(spn, mechanism)?;
                let step = new_client.step(&[])?;
                *client = Some(new_client);
                Ok(step.token.unwrap_or_default())
            }
        }
    }

    /// React to an AuthMoreData payload.
    pub fn more_data(&mut self, data: &[u8], ctx: &AuthContext<'_>) -> Result<AuthReply> {
        match self {
            Self::CachingSha2 => match data.first() {
                Some(&caching_sha2::FAST_AUTH_SUCCESS) => Ok(AuthReply::Wait),
                Some(&caching_sha2::PERFORM_FULL_AUTH) => {
                    if !ctx.tls {
                        return Err(Error::Auth(
                            "caching_sha2_password full authentication requires TLS".into(),
                        ));
                    }
                    Ok(AuthReply::Send(nul_terminated(
                        ctx.password.unwrap_or_default(),
                    )))
                }
                other => Err(Error::Protocol(format!(
                    "caching_sha2_password: unexpected AuthMoreData {other:?}"
                ))),
            },
            Self::Gssapi {
                client: Some(client),
                ..
            } => {
                let step = client.step(data)?;
                Ok(match step.token {
                    Some(token) => AuthReply::Send(token),
                    None => AuthReply::Wait,
                })
            }
            _ => Err(Error::Protocol(format!(
                "{}: unexpected AuthMoreData",
                self.name()
            ))),
        }
    }
}

/// `<principal name>\0<mechanisms>` sent with the auth_gssapi_client switch.
fn split_gssapi_data(data: &[u8]) -> (&str, &str) {
    let (spn, mech) = match memchr::memchr(0, data) {
        Some(pos) => (&data[..pos], &data[pos + 1..]),
        None => (data, &[][..]),
    };
    let mech = mech.strip_suffix(&[0]).unwrap_or(mech);
    (
        simdutf8::basic::from_utf8(spn).unwrap_or_default(),
        simdutf8::basic::from_utf8(mech).unwrap_or_default(),
    )
}
