//! Error types and failure classification for the gateway.
//!
//! Every failure coming out of the SSH layer is turned into an
//! [`SshConnectionError`] whose [`ErrorKind`] is decided once, at construction,
//! by [`classify`]. The kind drives two decisions in the session gateway:
//!
//! 1. **Which message template the user sees** ([`SshConnectionError::user_message`])
//! 2. **Whether cached session credentials are dropped** ([`ErrorKind::should_clear_credentials`])
//!
//! # Classification Strategy
//!
//! Structured signals are checked first, in this order:
//!
//! - **level** `client-authentication` (including a close before the handshake
//!   completed) is an authentication failure
//! - **level** `client-timeout` or a timeout **code** is a timeout
//! - connection refused / host not found / unreachable **codes** are network failures
//! - **level** `stream` (a channel ending on a signal or exit failure) is a protocol failure
//!
//! When neither code nor level is conclusive, the message text is matched
//! against known patterns. Authentication patterns take precedence so a
//! message mentioning both a timeout and a rejected password is never treated
//! as a transient network problem.

use std::fmt;

use thiserror::Error;

/// Authentication error patterns, matched case-insensitively.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "password authentication failed",
    "key authentication failed",
    "permission denied",
    "publickey",
    "auth fail",
    "no authentication",
    "all configured authentication methods failed",
];

/// Network error patterns, matched case-insensitively.
const NETWORK_ERRORS: &[&str] = &[
    "connection refused",
    "network is unreachable",
    "no route to host",
    "host is down",
    "failed to lookup address",
    "name or service not known",
    "nodename nor servname",
    "temporary failure in name resolution",
];

/// Timeout error patterns, matched case-insensitively.
const TIMEOUT_ERRORS: &[&str] = &["timed out", "timeout"];

/// Error codes that indicate the target could not be reached.
const NETWORK_CODES: &[&str] = &[
    "ECONNREFUSED",
    "ENOTFOUND",
    "ENETUNREACH",
    "EHOSTUNREACH",
    "EAI_AGAIN",
];

/// Error codes that indicate a timeout.
const TIMEOUT_CODES: &[&str] = &["ETIMEDOUT", "ETIMEOUT"];

/// Failure category used for user messaging and recovery decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Authentication,
    Network,
    Timeout,
    Protocol,
    Unknown,
}

impl ErrorKind {
    /// Whether cached session credentials are dropped after this failure.
    pub fn should_clear_credentials(self) -> bool {
        matches!(self, ErrorKind::Network)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Authentication => write!(f, "authentication"),
            ErrorKind::Network => write!(f, "network"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Protocol => write!(f, "protocol"),
            ErrorKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Where in the connection lifecycle a failure was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorLevel {
    /// Credentials were rejected, or the server closed before authentication completed.
    ClientAuthentication,
    /// The handshake or a keepalive did not complete in time.
    ClientTimeout,
    /// The underlying socket failed.
    ClientSocket,
    /// An established channel failed or ended abnormally.
    Stream,
}

impl fmt::Display for ErrorLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorLevel::ClientAuthentication => write!(f, "client-authentication"),
            ErrorLevel::ClientTimeout => write!(f, "client-timeout"),
            ErrorLevel::ClientSocket => write!(f, "client-socket"),
            ErrorLevel::Stream => write!(f, "stream"),
        }
    }
}

/// Map a raw failure to its category.
pub fn classify(code: Option<&str>, level: Option<ErrorLevel>, message: &str) -> ErrorKind {
    match level {
        Some(ErrorLevel::ClientAuthentication) => return ErrorKind::Authentication,
        Some(ErrorLevel::ClientTimeout) => return ErrorKind::Timeout,
        _ => {}
    }

    if let Some(code) = code {
        if TIMEOUT_CODES.iter().any(|c| code.eq_ignore_ascii_case(c)) {
            return ErrorKind::Timeout;
        }
        if NETWORK_CODES.iter().any(|c| code.eq_ignore_ascii_case(c)) {
            return ErrorKind::Network;
        }
    }

    if level == Some(ErrorLevel::Stream) {
        return ErrorKind::Protocol;
    }

    classify_message(message)
}

/// Fallback classification on the message text alone.
fn classify_message(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();

    if AUTH_ERRORS.iter().any(|p| lower.contains(p)) {
        return ErrorKind::Authentication;
    }
    if NETWORK_ERRORS.iter().any(|p| lower.contains(p)) {
        return ErrorKind::Network;
    }
    if TIMEOUT_ERRORS.iter().any(|p| lower.contains(p)) {
        return ErrorKind::Timeout;
    }

    ErrorKind::Unknown
}

/// A classified SSH failure.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct SshConnectionError {
    kind: ErrorKind,
    code: Option<String>,
    level: Option<ErrorLevel>,
    message: String,
}

impl SshConnectionError {
    /// Build an error and classify it.
    pub fn new(code: Option<String>, level: Option<ErrorLevel>, message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = classify(code.as_deref(), level, &message);
        Self {
            kind,
            code,
            level,
            message,
        }
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(None, Some(ErrorLevel::ClientAuthentication), message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(
            Some("ETIMEDOUT".to_string()),
            Some(ErrorLevel::ClientTimeout),
            message,
        )
    }

    /// A channel that ended on a signal or with a failing request.
    pub fn stream(message: impl Into<String>) -> Self {
        Self::new(None, Some(ErrorLevel::Stream), message)
    }

    /// Classify a socket-level I/O failure.
    pub fn from_io(err: &std::io::Error) -> Self {
        use std::io::ErrorKind as Io;

        let message = err.to_string();
        let code = match err.kind() {
            Io::ConnectionRefused => Some("ECONNREFUSED"),
            Io::TimedOut => Some("ETIMEDOUT"),
            Io::NetworkUnreachable => Some("ENETUNREACH"),
            Io::HostUnreachable => Some("EHOSTUNREACH"),
            Io::ConnectionReset => Some("ECONNRESET"),
            Io::ConnectionAborted => Some("ECONNABORTED"),
            Io::BrokenPipe => Some("EPIPE"),
            _ if is_lookup_failure(&message) => Some("ENOTFOUND"),
            _ => None,
        };

        Self::new(
            code.map(str::to_string),
            Some(ErrorLevel::ClientSocket),
            message,
        )
    }

    /// Classify a failure reported by the SSH transport.
    ///
    /// `authenticated` tells whether the handshake had completed. A server
    /// that drops an established link before that point is rejecting the
    /// client; failures to reach the server at all stay network errors.
    pub fn from_transport(err: &russh::Error, authenticated: bool) -> Self {
        match err {
            russh::Error::IO(io) if !authenticated && is_hangup(io) => {
                Self::closed_before_ready(err)
            }
            russh::Error::IO(io) => Self::from_io(io),
            russh::Error::ConnectionTimeout
            | russh::Error::KeepaliveTimeout
            | russh::Error::InactivityTimeout => Self::timeout(err.to_string()),
            russh::Error::Disconnect
            | russh::Error::HUP
            | russh::Error::SendError
            | russh::Error::RecvError
                if !authenticated =>
            {
                Self::closed_before_ready(err)
            }
            russh::Error::NotAuthenticated => Self::authentication(err.to_string()),
            _ => Self::new(None, None, err.to_string()),
        }
    }

    fn closed_before_ready(err: &russh::Error) -> Self {
        Self::authentication(format!(
            "Connection closed before authentication completed: {}",
            err
        ))
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn level(&self) -> Option<ErrorLevel> {
        self.level
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The message shown to the browser for this failure.
    pub fn user_message(&self, host: &str, port: u16) -> String {
        match self.kind {
            ErrorKind::Authentication => {
                "Authentication failed. Please check your username and credentials.".to_string()
            }
            ErrorKind::Network => format!("Unable to reach {}:{}: {}", host, port, self.message),
            ErrorKind::Timeout => format!("Connection to {}:{} timed out", host, port),
            ErrorKind::Protocol => format!("SSH stream error: {}", self.message),
            ErrorKind::Unknown => format!("SSH error: {}", self.message),
        }
    }
}

/// The peer closed an established connection.
fn is_hangup(err: &std::io::Error) -> bool {
    use std::io::ErrorKind as Io;

    matches!(
        err.kind(),
        Io::UnexpectedEof | Io::ConnectionReset | Io::ConnectionAborted | Io::BrokenPipe
    )
}

fn is_lookup_failure(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("failed to lookup address")
        || lower.contains("name or service not known")
        || lower.contains("nodename nor servname")
        || lower.contains("no such host")
}

/// A rejected inbound message. Only the first failing field is reported.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Malformed message: {0}")]
    Malformed(String),
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("Invalid {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
}

impl ValidationError {
    pub(crate) fn field(field: &'static str, reason: impl Into<String>) -> Self {
        ValidationError::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}

/// Invalid configuration detected at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid subnet '{value}' in {variable}: {reason}")]
    InvalidSubnet {
        variable: &'static str,
        value: String,
        reason: String,
    },
    #[error("Invalid listen address '{0}'")]
    InvalidListenAddr(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    mod structured_classification {
        use super::*;

        #[test]
        fn test_client_authentication_level() {
            assert_eq!(
                classify(None, Some(ErrorLevel::ClientAuthentication), "anything"),
                ErrorKind::Authentication
            );
        }

        #[test]
        fn test_authentication_level_wins_over_network_code() {
            assert_eq!(
                classify(
                    Some("ECONNREFUSED"),
                    Some(ErrorLevel::ClientAuthentication),
                    "closed"
                ),
                ErrorKind::Authentication
            );
        }

        #[test]
        fn test_network_codes() {
            for code in ["ECONNREFUSED", "ENOTFOUND", "ENETUNREACH", "EHOSTUNREACH"] {
                assert_eq!(
                    classify(Some(code), Some(ErrorLevel::ClientSocket), "boom"),
                    ErrorKind::Network,
                    "code {}",
                    code
                );
            }
        }

        #[test]
        fn test_timeout_code_and_level() {
            assert_eq!(
                classify(Some("ETIMEDOUT"), None, "boom"),
                ErrorKind::Timeout
            );
            assert_eq!(
                classify(None, Some(ErrorLevel::ClientTimeout), "boom"),
                ErrorKind::Timeout
            );
        }

        #[test]
        fn test_stream_level_is_protocol() {
            assert_eq!(
                classify(None, Some(ErrorLevel::Stream), "killed by SIGKILL"),
                ErrorKind::Protocol
            );
        }

        #[test]
        fn test_unrecognised_socket_error_is_unknown() {
            assert_eq!(
                classify(Some("ECONNRESET"), Some(ErrorLevel::ClientSocket), "reset"),
                ErrorKind::Unknown
            );
        }
    }

    mod message_fallback {
        use super::*;

        #[test]
        fn test_auth_patterns() {
            assert_eq!(classify(None, None, "Permission denied"), ErrorKind::Authentication);
            assert_eq!(
                classify(None, None, "PASSWORD AUTHENTICATION FAILED"),
                ErrorKind::Authentication
            );
        }

        #[test]
        fn test_network_patterns() {
            assert_eq!(classify(None, None, "Connection refused"), ErrorKind::Network);
            assert_eq!(classify(None, None, "No route to host"), ErrorKind::Network);
        }

        #[test]
        fn test_timeout_patterns() {
            assert_eq!(classify(None, None, "operation timed out"), ErrorKind::Timeout);
        }

        #[test]
        fn test_auth_takes_precedence() {
            assert_eq!(
                classify(None, None, "timeout while authentication failed"),
                ErrorKind::Authentication
            );
        }

        #[test]
        fn test_empty_is_unknown() {
            assert_eq!(classify(None, None, ""), ErrorKind::Unknown);
        }
    }

    mod io_errors {
        use super::*;
        use std::io;

        #[test]
        fn test_connection_refused_is_network() {
            let err = SshConnectionError::from_io(&io::Error::from(io::ErrorKind::ConnectionRefused));
            assert_eq!(err.kind(), ErrorKind::Network);
            assert_eq!(err.code(), Some("ECONNREFUSED"));
            assert_eq!(err.level(), Some(ErrorLevel::ClientSocket));
        }

        #[test]
        fn test_lookup_failure_is_network() {
            let err = SshConnectionError::from_io(&io::Error::other(
                "failed to lookup address information: Name or service not known",
            ));
            assert_eq!(err.kind(), ErrorKind::Network);
            assert_eq!(err.code(), Some("ENOTFOUND"));
        }

        #[test]
        fn test_timed_out_is_timeout() {
            let err = SshConnectionError::from_io(&io::Error::from(io::ErrorKind::TimedOut));
            assert_eq!(err.kind(), ErrorKind::Timeout);
        }
    }

    mod transport_errors {
        use super::*;
        use std::io;

        #[test]
        fn test_disconnect_before_auth_is_authentication() {
            let err = SshConnectionError::from_transport(&russh::Error::Disconnect, false);
            assert_eq!(err.kind(), ErrorKind::Authentication);
            assert_eq!(err.level(), Some(ErrorLevel::ClientAuthentication));
        }

        #[test]
        fn test_eof_before_auth_is_authentication() {
            let eof = russh::Error::IO(io::Error::new(io::ErrorKind::UnexpectedEof, "early eof"));
            let err = SshConnectionError::from_transport(&eof, false);
            assert_eq!(err.kind(), ErrorKind::Authentication);
            assert!(err.message().contains("before authentication completed"));
        }

        #[test]
        fn test_reset_before_auth_is_authentication() {
            let reset = russh::Error::IO(io::Error::from(io::ErrorKind::ConnectionReset));
            let err = SshConnectionError::from_transport(&reset, false);
            assert_eq!(err.kind(), ErrorKind::Authentication);
        }

        #[test]
        fn test_send_error_before_auth_is_authentication() {
            let err = SshConnectionError::from_transport(&russh::Error::SendError, false);
            assert_eq!(err.kind(), ErrorKind::Authentication);
        }

        #[test]
        fn test_recv_error_before_auth_is_authentication() {
            let err = SshConnectionError::from_transport(&russh::Error::RecvError, false);
            assert_eq!(err.kind(), ErrorKind::Authentication);
        }

        #[test]
        fn test_refused_before_auth_stays_network() {
            let refused = russh::Error::IO(io::Error::from(io::ErrorKind::ConnectionRefused));
            let err = SshConnectionError::from_transport(&refused, false);
            assert_eq!(err.kind(), ErrorKind::Network);
            assert_eq!(err.code(), Some("ECONNREFUSED"));
        }

        #[test]
        fn test_reset_after_auth_is_network() {
            let reset = russh::Error::IO(io::Error::from(io::ErrorKind::ConnectionReset));
            let err = SshConnectionError::from_transport(&reset, true);
            assert_eq!(err.code(), Some("ECONNRESET"));
            assert_ne!(err.kind(), ErrorKind::Authentication);
        }

        #[test]
        fn test_disconnect_after_auth_is_not_authentication() {
            let err = SshConnectionError::from_transport(&russh::Error::Disconnect, true);
            assert_ne!(err.kind(), ErrorKind::Authentication);
        }

        #[test]
        fn test_keepalive_timeout() {
            let err = SshConnectionError::from_transport(&russh::Error::KeepaliveTimeout, true);
            assert_eq!(err.kind(), ErrorKind::Timeout);
        }
    }

    mod recovery {
        use super::*;

        #[test]
        fn test_only_network_clears_credentials() {
            assert!(ErrorKind::Network.should_clear_credentials());
            assert!(!ErrorKind::Authentication.should_clear_credentials());
            assert!(!ErrorKind::Timeout.should_clear_credentials());
            assert!(!ErrorKind::Protocol.should_clear_credentials());
            assert!(!ErrorKind::Unknown.should_clear_credentials());
        }

        #[test]
        fn test_user_messages() {
            let auth = SshConnectionError::authentication("rejected");
            assert!(auth.user_message("h", 22).contains("Authentication failed"));

            let net = SshConnectionError::new(Some("ENOTFOUND".into()), None, "no such host");
            assert_eq!(net.user_message("h", 2222), "Unable to reach h:2222: no such host");

            let timeout = SshConnectionError::timeout("slow");
            assert_eq!(timeout.user_message("h", 22), "Connection to h:22 timed out");
        }
    }
}
