//! Credential issuance - the one capability consumed from the surrounding system

use anyhow::Result;
use async_trait::async_trait;

/// A freshly issued upstream credential pair.
#[derive(Debug, Clone)]
pub struct Credentials {
    /// Bearer token the upstream expects in the auth handshake
    pub token: String,

    /// WebSocket URL of the upstream console endpoint
    pub socket_url: String,
}

/// Issues short-lived `(token, socket_url)` pairs per server identifier.
///
/// Implemented by the surrounding panel API client. Called once per
/// establishment and once per token refresh cycle; may fail, in which case
/// establishment is rejected or the refresh is skipped for this cycle.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn credentials(&self, server_id: &str) -> Result<Credentials>;
}
