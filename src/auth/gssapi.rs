use crate::error::Result;

/// Output of one GSS-API context step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GssapiStep {
    /// Token to send to the server, if the mechanism produced one
    pub token: Option<Vec<u8>>,
    /// The security context is established
    pub established: bool,
}

/// Creates security contexts for `auth_gssapi_client`.
///
/// The crate does not link a Kerberos library; the application supplies one.
pub trait GssapiProvider: std::fmt::Debug + Send + Sync {
    fn client(&self, service_principal_name: &str, mechanism: &str)
    -> Result<Box<dyn GssapiClient>>;
}

/// One client-side security context.
pub trait GssapiClient: Send {
    /// Feed the server token (empty on the first call) and produce the next token.
    fn step(&mut self, server_token: &[u8]) -> Result<GssapiStep>;
}
