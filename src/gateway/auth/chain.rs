//! Authentication chain for trying multiple strategies.

use russh::client::{self, AuthResult};
use russh::{MethodKind, MethodSet};
use tokio::sync::mpsc;
use tracing::debug;

use crate::gateway::handler::GatewayClientHandler;
use crate::gateway::protocol::{InteractivePrompt, SessionCredentials};

use super::traits::AuthStrategy;
use super::{KeyAuth, KeyboardInteractiveAuth, PasswordAuth};

/// Authentication chain that tries multiple strategies in order.
///
/// Strategies are tried in the order they were added. The first successful
/// authentication stops the chain and returns success. A `none` request first
/// learns which methods the server offers; strategies for methods it does not
/// offer are skipped, as is a strategy that would resubmit a rejected secret.
pub struct AuthChain {
    strategies: Vec<Box<dyn AuthStrategy>>,
}

impl AuthChain {
    /// Create a new empty authentication chain.
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    /// Build the chain for a browser session.
    ///
    /// Order is private key (only if it decodes), password, then
    /// keyboard-interactive. Keyboard-interactive is always present so servers
    /// that only offer it still get a chance to prompt.
    pub fn for_credentials(
        creds: &SessionCredentials,
        prompt_tx: Option<mpsc::UnboundedSender<InteractivePrompt>>,
    ) -> Self {
        let mut chain = Self::new();

        if let Some(pem) = creds.private_key.as_deref()
            && let Some(key) = KeyAuth::from_pem(pem, creds.passphrase.as_deref())
        {
            chain = chain.with_key(key);
        }

        if let Some(password) = creds.password.as_deref() {
            chain = chain.with_password(password);
        }

        chain.with_keyboard_interactive(creds.password.clone(), prompt_tx)
    }

    /// Add password authentication to the chain.
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.strategies.push(Box::new(PasswordAuth::new(password)));
        self
    }

    /// Add an already decoded private key to the chain.
    pub fn with_key(mut self, key: KeyAuth) -> Self {
        self.strategies.push(Box::new(key));
        self
    }

    /// Add keyboard-interactive authentication to the chain.
    pub fn with_keyboard_interactive(
        mut self,
        password: Option<String>,
        prompt_tx: Option<mpsc::UnboundedSender<InteractivePrompt>>,
    ) -> Self {
        self.strategies
            .push(Box::new(KeyboardInteractiveAuth::new(password, prompt_tx)));
        self
    }

    /// Check if the chain has any authentication strategies.
    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Get the number of strategies in the chain.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.strategies.len()
    }
}

impl Default for AuthChain {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthChain {
    /// Run the chain.
    ///
    /// Returns `Ok(false)` when every strategy was rejected or skipped, or the
    /// last transport error if one occurred and nothing succeeded.
    pub async fn authenticate(
        &self,
        handle: &mut client::Handle<GatewayClientHandler>,
        username: &str,
    ) -> Result<bool, russh::Error> {
        let mut offered = match handle.authenticate_none(username).await? {
            AuthResult::Success => {
                debug!("Server accepted authentication method none");
                return Ok(true);
            }
            AuthResult::Failure {
                remaining_methods, ..
            } => Some(remaining_methods),
        };
        let mut rejected = Vec::new();
        let mut last_error = None;

        for strategy in &self.strategies {
            if !should_try(strategy.as_ref(), offered.as_ref(), &rejected) {
                debug!("Skipping authentication strategy: {}", strategy.name());
                continue;
            }

            debug!("Trying authentication strategy: {}", strategy.name());

            match strategy.authenticate(handle, username).await {
                Ok(AuthResult::Success) => {
                    debug!(
                        "Authentication succeeded with strategy: {}",
                        strategy.name()
                    );
                    return Ok(true);
                }
                Ok(AuthResult::Failure {
                    remaining_methods, ..
                }) => {
                    debug!("Authentication rejected with strategy: {}", strategy.name());
                    rejected.push(strategy.method());
                    offered = Some(remaining_methods);
                }
                Err(e) => {
                    debug!(
                        "Authentication error with strategy {}: {}",
                        strategy.name(),
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(e),
            None => Ok(false),
        }
    }
}

/// Whether `strategy` is worth an attempt given what the server offers and
/// which methods have already been rejected.
fn should_try(
    strategy: &dyn AuthStrategy,
    offered: Option<&MethodSet>,
    rejected: &[MethodKind],
) -> bool {
    if let Some(methods) = offered
        && !methods.contains(&strategy.method())
    {
        return false;
    }
    match strategy.resubmits() {
        Some(method) => !rejected.contains(&method),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> SessionCredentials {
        SessionCredentials {
            host: "example.com".to_string(),
            port: 22,
            username: "alice".to_string(),
            password: None,
            private_key: None,
            passphrase: None,
        }
    }

    fn names(chain: &AuthChain) -> Vec<&'static str> {
        chain.strategies.iter().map(|s| s.name()).collect()
    }

    mod test_builder {
        use super::*;

        #[test]
        fn test_empty() {
            let chain = AuthChain::default();
            assert!(chain.is_empty());
            assert_eq!(chain.len(), 0);
        }

        #[test]
        fn test_fluent_api_preserves_order() {
            let chain = AuthChain::new()
                .with_password("p1")
                .with_keyboard_interactive(None, None)
                .with_password("p2");
            assert_eq!(
                names(&chain),
                vec!["password", "keyboard-interactive", "password"]
            );
        }

        #[test]
        fn test_is_send_sync() {
            fn assert_send_sync<T: Send + Sync>() {}
            assert_send_sync::<AuthChain>();
        }
    }

    mod test_for_credentials {
        use super::*;

        #[test]
        fn test_password_only() {
            let mut c = creds();
            c.password = Some("secret".to_string());
            let chain = AuthChain::for_credentials(&c, None);
            assert_eq!(names(&chain), vec!["password", "keyboard-interactive"]);
        }

        #[test]
        fn test_undecodable_key_is_skipped() {
            let mut c = creds();
            c.password = Some("secret".to_string());
            c.private_key = Some("garbage".to_string());
            let chain = AuthChain::for_credentials(&c, None);
            assert_eq!(names(&chain), vec!["password", "keyboard-interactive"]);
        }

        #[test]
        fn test_no_secret_still_offers_keyboard_interactive() {
            let chain = AuthChain::for_credentials(&creds(), None);
            assert_eq!(names(&chain), vec!["keyboard-interactive"]);
        }
    }

    mod test_should_try {
        use super::*;

        fn methods(kinds: &[MethodKind]) -> MethodSet {
            MethodSet::from(kinds)
        }

        #[test]
        fn test_unknown_offer_allows_everything() {
            let password = PasswordAuth::new("pw");
            assert!(should_try(&password, None, &[]));
        }

        #[test]
        fn test_skips_methods_the_server_does_not_offer() {
            let password = PasswordAuth::new("pw");
            let offered = methods(&[MethodKind::PublicKey, MethodKind::KeyboardInteractive]);
            assert!(!should_try(&password, Some(&offered), &[]));
        }

        #[test]
        fn test_rejected_password_is_not_resubmitted() {
            let kbd = KeyboardInteractiveAuth::new(Some("pw".to_string()), None);
            let offered = methods(&[MethodKind::Password, MethodKind::KeyboardInteractive]);
            assert!(!should_try(&kbd, Some(&offered), &[MethodKind::Password]));
        }

        #[test]
        fn test_keyboard_interactive_used_when_password_not_offered() {
            let kbd = KeyboardInteractiveAuth::new(Some("pw".to_string()), None);
            let offered = methods(&[MethodKind::KeyboardInteractive]);
            assert!(should_try(&kbd, Some(&offered), &[]));
        }

        #[test]
        fn test_prompt_forwarding_survives_password_rejection() {
            let kbd = KeyboardInteractiveAuth::new(None, None);
            let offered = methods(&[MethodKind::KeyboardInteractive]);
            assert!(should_try(&kbd, Some(&offered), &[MethodKind::Password]));
        }
    }
}
