//! Sanitizing of client-supplied environment variables.
//!
//! Browsers may ask for variables to be injected into the remote shell. Only a
//! conservative subset ever reaches the SSH channel:
//!
//! 1. keys outside the configured allowlist are dropped (when one is configured)
//! 2. keys that are not plain identifiers are dropped
//! 3. oversized keys or values are dropped
//! 4. the result is truncated to [`MAX_ENV_PAIRS`] entries
//!
//! Filtering never fails and keeps the relative order of surviving entries.

use once_cell::sync::Lazy;
use regex::Regex;

/// Ordered key/value pairs as supplied by the client.
pub type EnvironmentMap = Vec<(String, String)>;

/// Longest accepted variable name.
pub const MAX_ENV_KEY_LEN: usize = 32;

/// Longest accepted variable value.
pub const MAX_ENV_VALUE_LEN: usize = 512;

/// Most variables forwarded for a single channel.
pub const MAX_ENV_PAIRS: usize = 50;

static ENV_KEY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid env key pattern"));

/// Reduce `raw` to the pairs that are safe to send to the server.
pub fn filter_env(raw: &[(String, String)], allowlist: &[String]) -> EnvironmentMap {
    raw.iter()
        .filter(|(key, _)| allowlist.is_empty() || allowlist.iter().any(|a| a == key))
        .filter(|(key, _)| ENV_KEY_PATTERN.is_match(key))
        .filter(|(key, value)| key.len() <= MAX_ENV_KEY_LEN && value.len() <= MAX_ENV_VALUE_LEN)
        .take(MAX_ENV_PAIRS)
        .cloned()
        .collect()
}

/// Parse the `FOO:bar,BAZ:qux` form used on the socket URL.
///
/// Entries without a `:` separator are skipped; the result still has to go
/// through [`filter_env`].
pub fn parse_env_list(list: &str) -> EnvironmentMap {
    list.split(',')
        .filter_map(|entry| entry.split_once(':'))
        .map(|(key, value)| (key.trim().to_string(), value.to_string()))
        .collect()
}
