//! Authentication strategy trait definition.

use async_trait::async_trait;
use russh::MethodKind;
use russh::client::{self, AuthResult};

use crate::gateway::handler::GatewayClientHandler;

/// Trait for SSH authentication strategies.
///
/// Implementations must be thread-safe (`Send + Sync`) because a session's
/// connect future runs on the tokio runtime.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// Attempt to authenticate with the SSH server.
    ///
    /// A rejection carries the methods the server still accepts.
    async fn authenticate(
        &self,
        handle: &mut client::Handle<GatewayClientHandler>,
        username: &str,
    ) -> Result<AuthResult, russh::Error>;

    /// The SSH method this strategy uses.
    fn method(&self) -> MethodKind;

    /// Method whose secret this strategy submits again, if any.
    ///
    /// The chain skips the strategy once that method has been rejected.
    fn resubmits(&self) -> Option<MethodKind> {
        None
    }

    /// Name used for logging.
    fn name(&self) -> &'static str;
}
