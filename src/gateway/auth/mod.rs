//! Authentication strategies for gateway SSH connections.
//!
//! Each method the gateway supports is an [`AuthStrategy`]; an [`AuthChain`]
//! tries them in order and stops at the first success.
//!
//! # Available Strategies
//!
//! - [`KeyAuth`]: In-memory private key (PEM/OpenSSH), optionally encrypted
//! - [`PasswordAuth`]: Password authentication
//! - [`KeyboardInteractiveAuth`]: Answers keyboard-interactive prompts with the
//!   known password, or forwards them to the browser when there is none
//!
//! # Example
//!
//! ```ignore
//! let chain = AuthChain::new()
//!     .with_key(key)
//!     .with_password("secret")
//!     .with_keyboard_interactive(Some("secret".into()), None);
//!
//! let ok = chain.authenticate(&mut handle, "username").await?;
//! ```

mod chain;
mod key;
mod keyboard;
mod password;
mod traits;

pub use chain::AuthChain;
pub use key::KeyAuth;
pub use keyboard::{KeyboardInteractiveAuth, answer_prompts};
pub use password::PasswordAuth;
pub use traits::AuthStrategy;
