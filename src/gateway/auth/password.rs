//! Password-based SSH authentication.

use async_trait::async_trait;
use russh::MethodKind;
use russh::client::{self, AuthResult};

use crate::gateway::handler::GatewayClientHandler;

use super::traits::AuthStrategy;

/// Password authentication strategy.
pub struct PasswordAuth {
    password: String,
}

impl PasswordAuth {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

#[async_trait]
impl AuthStrategy for PasswordAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<GatewayClientHandler>,
        username: &str,
    ) -> Result<AuthResult, russh::Error> {
        handle.authenticate_password(username, &self.password).await
    }

    fn method(&self) -> MethodKind {
        MethodKind::Password
    }

    fn name(&self) -> &'static str {
        "password"
    }
}
