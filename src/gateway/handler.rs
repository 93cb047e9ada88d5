//! russh client handler used by every gateway connection.
//!
//! Host keys are accepted without verification (the equivalent of
//! `StrictHostKeyChecking=no`). The SHA-256 fingerprint is logged at debug
//! level.

use russh::keys::ssh_key::HashAlg;
use russh::{client, keys};
use tracing::debug;

/// Client handler for gateway connections.
pub struct GatewayClientHandler {
    target: String,
}

impl GatewayClientHandler {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            target: format!("{}:{}", host, port),
        }
    }
}

impl client::Handler for GatewayClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        debug!(
            "Accepting host key {} for {}",
            server_public_key.fingerprint(HashAlg::Sha256),
            self.target
        );
        Ok(true)
    }
}
