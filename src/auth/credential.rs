use tracing::debug;

use crate::constant::error_code;
use crate::error::Result;

/// User name and secret used for one authentication attempt.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub user: String,
    pub password: Option<String>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Source of credentials, consulted before every handshake.
pub trait CredentialProvider: std::fmt::Debug + Send + Sync {
    /// Credential for `host`.
    fn credential(&self, host: &str) -> Result<Credential>;

    /// Plugin to use instead of the one advertised by the server.
    fn default_auth_plugin(&self) -> Option<&str> {
        None
    }

    /// Tokens come from a browser single sign-on flow and can expire.
    fn is_browser_sso(&self) -> bool {
        false
    }

    /// Forget any cached token so the next `credential` call fetches a fresh one.
    fn clear_cache(&self) {}
}

/// A fixed user/password pair.
#[derive(Debug, Clone)]
pub struct StaticCredential(pub Credential);

impl CredentialProvider for StaticCredential {
    fn credential(&self, _host: &str) -> Result<Credential> {
        Ok(self.0.clone())
    }
}

/// Run `attempt`, and when a browser-SSO provider's token was rejected
/// (access denied or expired JWT), clear its cache and run it exactly once more.
pub(crate) fn with_sso_retry<T, F>(provider: Option<&dyn CredentialProvider>, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    match attempt() {
        Err(e)
            if provider.is_some_and(|p| p.is_browser_sso())
                && e.server_error().is_some_and(|s| {
                    s.code == error_code::ACCESS_DENIED || s.code == error_code::JWT_TOKEN_EXPIRED
                }) =>
        {
            debug!("SSO token rejected ({e}), retrying with a fresh token");
            if let Some(provider) = provider {
                provider.clear_cache();
            }
            attempt()
        }
        result => result,
    }
}
