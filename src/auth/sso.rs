//! Browser single sign-on: JWT credentials and their cache.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;
use tracing::debug;

use super::credential::{Credential, CredentialProvider};
use super::plugins;
use crate::error::{Error, Result};

/// Tokens expiring within this window are treated as already expired.
const EXPIRY_MARGIN: Duration = Duration::from_secs(5);

#[derive(Deserialize)]
struct Claims {
    exp: Option<u64>,
}

/// Expiry time carried in the `exp` claim of a JWT.
pub fn jwt_expiry(token: &str) -> Result<SystemTime> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| Error::Auth("malformed JWT: missing payload".into()))?;
    let json = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| Error::Auth(format!("malformed JWT payload: {e}")))?;
    let claims: Claims = serde_json::from_slice(&json)
        .map_err(|e| Error::Auth(format!("malformed JWT claims: {e}")))?;
    let exp = claims
        .exp
        .ok_or_else(|| Error::Auth("JWT has no exp claim".into()))?;
    Ok(UNIX_EPOCH + Duration::from_secs(exp))
}

/// Holds the last SSO credential until its JWT expires.
#[derive(Debug, Default)]
pub struct TokenCache {
    slot: Mutex<Option<(Credential, SystemTime)>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached credential, unless it is missing or about to expire.
    pub fn get(&self) -> Option<Credential> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        let fresh = slot
            .as_ref()
            .is_some_and(|(_, expires_at)| SystemTime::now() + EXPIRY_MARGIN < *expires_at);
        if !fresh {
            *slot = None;
        }
        slot.as_ref().map(|(credential, _)| credential.clone())
    }

    /// Cache a credential whose password is a JWT.
    pub fn put(&self, credential: Credential) -> Result<()> {
        let token = credential
            .password
            .as_deref()
            .ok_or_else(|| Error::Auth("SSO credential has no token".into()))?;
        let expires_at = jwt_expiry(token)?;
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some((credential, expires_at));
        Ok(())
    }

    pub fn clear(&self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

type FetchToken = dyn Fn(&str) -> Result<Credential> + Send + Sync;

/// Credential provider for browser SSO.
///
/// `fetch` runs the identity-provider flow for a host and returns the user and
/// JWT; results are cached until the token expires or the server rejects it.
pub struct SsoCredentialProvider {
    fetch: Box<FetchToken>,
    cache: TokenCache,
}

impl SsoCredentialProvider {
    pub fn new<F>(fetch: F) -> Self
    where
        F: Fn(&str) -> Result<Credential> + Send + Sync + 'static,
    {
        Self {
            fetch: Box::new(fetch),
            cache: TokenCache::new(),
        }
    }
}

impl std::fmt::Debug for SsoCredentialProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SsoCredentialProvider")
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl CredentialProvider for SsoCredentialProvider {
    fn credential(&self, host: &str) -> Result<Credential> {
        if let Some(credential) = self.cache.get() {
            return Ok(credential);
        }
        debug!("fetching SSO token for {host}");
        let credential = (self.fetch)(host)?;
        self.cache.put(credential.clone())?;
        Ok(credential)
    }

    fn default_auth_plugin(&self) -> Option<&str> {
        Some(plugins::MYSQL_CLEAR_PASSWORD)
    }

    fn is_browser_sso(&self) -> bool {
        true
    }

    fn clear_cache(&self) {
        self.cache.clear();
    }
}
