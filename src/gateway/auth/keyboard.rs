//! Keyboard-interactive authentication.
//!
//! Many servers only expose `keyboard-interactive` for what is really a
//! password prompt. When the session carries a password, every prompt in
//! every round is answered with it. Without a password the prompts are
//! forwarded to the browser and answered empty, which the server rejects.

use async_trait::async_trait;
use russh::client::{self, AuthResult, KeyboardInteractiveAuthResponse};
use russh::{MethodKind, MethodSet};
use tokio::sync::mpsc;
use tracing::debug;

use crate::gateway::handler::GatewayClientHandler;
use crate::gateway::protocol::{InteractivePrompt, PromptInfo};

use super::traits::AuthStrategy;

/// Upper bound on info-request rounds before giving up.
const MAX_ROUNDS: usize = 10;

/// Build the responses for one info-request round.
///
/// Returns one copy of `password` per prompt, or no answers at all when
/// there is no password to offer.
pub fn answer_prompts(prompt_count: usize, password: Option<&str>) -> Vec<String> {
    match password {
        Some(password) => vec![password.to_string(); prompt_count],
        None => Vec::new(),
    }
}

/// Keyboard-interactive authentication strategy.
pub struct KeyboardInteractiveAuth {
    password: Option<String>,
    prompt_tx: Option<mpsc::UnboundedSender<InteractivePrompt>>,
}

impl KeyboardInteractiveAuth {
    pub fn new(
        password: Option<String>,
        prompt_tx: Option<mpsc::UnboundedSender<InteractivePrompt>>,
    ) -> Self {
        Self {
            password,
            prompt_tx,
        }
    }
}

#[async_trait]
impl AuthStrategy for KeyboardInteractiveAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<GatewayClientHandler>,
        username: &str,
    ) -> Result<AuthResult, russh::Error> {
        let mut response = handle
            .authenticate_keyboard_interactive_start(username, None::<String>)
            .await?;

        for round in 0..MAX_ROUNDS {
            match response {
                KeyboardInteractiveAuthResponse::Success => return Ok(AuthResult::Success),
                KeyboardInteractiveAuthResponse::Failure {
                    remaining_methods,
                    partial_success,
                } => {
                    return Ok(AuthResult::Failure {
                        remaining_methods,
                        partial_success,
                    });
                }
                KeyboardInteractiveAuthResponse::InfoRequest {
                    name,
                    instructions,
                    prompts,
                } => {
                    debug!(
                        "keyboard-interactive round {} with {} prompts",
                        round,
                        prompts.len()
                    );

                    if self.password.is_none()
                        && !prompts.is_empty()
                        && let Some(tx) = &self.prompt_tx
                    {
                        let prompt = InteractivePrompt {
                            name,
                            instructions,
                            prompts: prompts
                                .iter()
                                .map(|p| PromptInfo {
                                    prompt: p.prompt.clone(),
                                    echo: p.echo,
                                })
                                .collect(),
                        };
                        // Receiver gone means the session is already closing
                        let _ = tx.send(prompt);
                    }

                    let answers = answer_prompts(prompts.len(), self.password.as_deref());
                    response = handle
                        .authenticate_keyboard_interactive_respond(answers)
                        .await?;
                }
            }
        }

        debug!("keyboard-interactive gave up after {} rounds", MAX_ROUNDS);
        Ok(AuthResult::Failure {
            remaining_methods: MethodSet::from(&[] as &[MethodKind]),
            partial_success: false,
        })
    }

    fn method(&self) -> MethodKind {
        MethodKind::KeyboardInteractive
    }

    fn resubmits(&self) -> Option<MethodKind> {
        self.password.as_ref().map(|_| MethodKind::Password)
    }

    fn name(&self) -> &'static str {
        "keyboard-interactive"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod test_answer_prompts {
        use super::*;

        #[test]
        fn test_one_answer_per_prompt() {
            let answers = answer_prompts(3, Some("hunter2"));
            assert_eq!(answers, vec!["hunter2", "hunter2", "hunter2"]);
        }

        #[test]
        fn test_zero_prompts() {
            assert!(answer_prompts(0, Some("hunter2")).is_empty());
        }

        #[test]
        fn test_no_password_gives_no_answers() {
            assert!(answer_prompts(2, None).is_empty());
        }
    }

    #[test]
    fn test_name() {
        let auth = KeyboardInteractiveAuth::new(None, None);
        assert_eq!(auth.name(), "keyboard-interactive");
        assert_eq!(auth.method(), MethodKind::KeyboardInteractive);
    }

    #[test]
    fn test_resubmits_password_only_when_known() {
        let with_password = KeyboardInteractiveAuth::new(Some("pw".to_string()), None);
        assert_eq!(with_password.resubmits(), Some(MethodKind::Password));

        let without = KeyboardInteractiveAuth::new(None, None);
        assert_eq!(without.resubmits(), None);
    }
}
