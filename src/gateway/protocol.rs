//! Wire messages exchanged with the browser.
//!
//! Inbound text frames are JSON envelopes `{"type": "...", "payload": {...}}`.
//! The envelope is parsed first, then the payload is decoded into the type for
//! that kind and validated; the first failing field rejects the message.
//! Inbound binary frames are terminal input and never go through JSON.
//!
//! Outbound events are serialized as `{"event": "...", "data": ...}`. Terminal
//! output is sent as binary frames by the socket layer.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use super::config::Permissions;
use super::env_filter::EnvironmentMap;
use super::error::ValidationError;

/// Smallest accepted terminal dimension.
pub const MIN_DIMENSION: u32 = 1;

/// Largest accepted terminal dimension.
pub const MAX_DIMENSION: u32 = 9999;

pub const DEFAULT_ROWS: u32 = 24;
pub const DEFAULT_COLS: u32 = 80;

/// Terminal size in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub rows: u32,
    pub cols: u32,
}

impl Default for Dimensions {
    fn default() -> Self {
        Self {
            rows: DEFAULT_ROWS,
            cols: DEFAULT_COLS,
        }
    }
}

/// Credentials for one SSH connection.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionCredentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub passphrase: Option<String>,
}

impl SessionCredentials {
    /// True when a password or a private key is available.
    pub fn has_secret(&self) -> bool {
        self.password.as_deref().is_some_and(|p| !p.is_empty())
            || self.private_key.as_deref().is_some_and(|k| !k.is_empty())
    }

    /// Footer label shown by the client.
    pub fn target_label(&self) -> String {
        if self.host.contains(':') {
            format!("ssh://[{}]:{}", self.host, self.port)
        } else {
            format!("ssh://{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Debug for SessionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCredentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Validated `auth` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthRequest {
    pub credentials: SessionCredentials,
    pub term: Option<String>,
    pub dimensions: Option<Dimensions>,
}

/// Validated `terminal` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalRequest {
    pub term: Option<String>,
    pub dimensions: Dimensions,
}

/// Validated `exec` payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub command: String,
    pub pty: bool,
    pub term: Option<String>,
    pub dimensions: Dimensions,
    pub env: EnvironmentMap,
    pub timeout_ms: Option<u64>,
}

/// Actions accepted in a `control` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ControlAction {
    #[serde(rename = "reauth")]
    Reauth,
    #[serde(rename = "clear-credentials")]
    ClearCredentials,
    #[serde(rename = "disconnect")]
    Disconnect,
    #[serde(rename = "replayCredentials")]
    ReplayCredentials,
}

/// A validated message from the browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Auth(AuthRequest),
    Terminal(TerminalRequest),
    Resize(Dimensions),
    Exec(ExecRequest),
    Control(ControlAction),
    Data(Bytes),
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAuth {
    username: Option<String>,
    host: Option<String>,
    port: Option<i64>,
    password: Option<String>,
    private_key: Option<String>,
    passphrase: Option<String>,
    term: Option<String>,
    cols: Option<i64>,
    rows: Option<i64>,
}

#[derive(Deserialize)]
struct RawTerminal {
    term: Option<String>,
    rows: Option<i64>,
    cols: Option<i64>,
}

#[derive(Deserialize)]
struct RawResize {
    rows: Option<i64>,
    cols: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawExec {
    command: Option<String>,
    pty: Option<bool>,
    term: Option<String>,
    cols: Option<i64>,
    rows: Option<i64>,
    env: Option<serde_json::Map<String, Value>>,
    timeout_ms: Option<i64>,
}

#[derive(Deserialize)]
struct RawControl {
    action: Option<String>,
}

impl ClientMessage {
    /// Parse and validate a text frame.
    pub fn parse(text: &str) -> Result<Self, ValidationError> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| ValidationError::Malformed(e.to_string()))?;

        match envelope.kind.as_str() {
            "auth" => parse_auth(decode(envelope.payload)?).map(ClientMessage::Auth),
            "terminal" => parse_terminal(decode(envelope.payload)?).map(ClientMessage::Terminal),
            "resize" => parse_resize(decode(envelope.payload)?).map(ClientMessage::Resize),
            "exec" => parse_exec(decode(envelope.payload)?).map(ClientMessage::Exec),
            "control" => parse_control(decode(envelope.payload)?).map(ClientMessage::Control),
            "data" => match envelope.payload {
                Value::String(s) => Ok(ClientMessage::Data(Bytes::from(s))),
                _ => Err(ValidationError::field("data", "must be a string")),
            },
            other => Err(ValidationError::UnknownType(other.to_string())),
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, ValidationError> {
    let payload = if payload.is_null() {
        Value::Object(Default::default())
    } else {
        payload
    };
    serde_json::from_value(payload).map_err(|e| ValidationError::Malformed(e.to_string()))
}

fn required_text(field: &'static str, value: Option<String>) -> Result<String, ValidationError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        Some(_) => Err(ValidationError::field(field, "must not be empty")),
        None => Err(ValidationError::field(field, "is required")),
    }
}

fn dimension(field: &'static str, value: i64) -> Result<u32, ValidationError> {
    if (MIN_DIMENSION as i64..=MAX_DIMENSION as i64).contains(&value) {
        Ok(value as u32)
    } else {
        Err(ValidationError::field(
            field,
            format!("must be between {} and {}", MIN_DIMENSION, MAX_DIMENSION),
        ))
    }
}

fn optional_dimension(field: &'static str, value: Option<i64>) -> Result<Option<u32>, ValidationError> {
    value.map(|v| dimension(field, v)).transpose()
}

fn port(value: Option<i64>) -> Result<u16, ValidationError> {
    match value {
        None => Ok(22),
        Some(p) if (1..=65535).contains(&p) => Ok(p as u16),
        Some(_) => Err(ValidationError::field("port", "must be between 1 and 65535")),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

/// Strip URL-style brackets from an IPv6 literal (`[::1]` becomes `::1`).
pub(crate) fn unbracket_host(host: String) -> String {
    match host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
        Some(inner) if !inner.is_empty() => inner.to_string(),
        _ => host,
    }
}

fn parse_auth(raw: RawAuth) -> Result<AuthRequest, ValidationError> {
    let username = required_text("username", raw.username)?;
    let host = unbracket_host(required_text("host", raw.host)?);
    let port = port(raw.port)?;
    let cols = optional_dimension("cols", raw.cols)?;
    let rows = optional_dimension("rows", raw.rows)?;

    let dimensions = match (rows, cols) {
        (None, None) => None,
        (rows, cols) => Some(Dimensions {
            rows: rows.unwrap_or(DEFAULT_ROWS),
            cols: cols.unwrap_or(DEFAULT_COLS),
        }),
    };

    Ok(AuthRequest {
        credentials: SessionCredentials {
            host,
            port,
            username,
            password: non_empty(raw.password),
            private_key: non_empty(raw.private_key),
            passphrase: non_empty(raw.passphrase),
        },
        term: non_empty(raw.term),
        dimensions,
    })
}

fn parse_terminal(raw: RawTerminal) -> Result<TerminalRequest, ValidationError> {
    let rows = optional_dimension("rows", raw.rows)?.unwrap_or(DEFAULT_ROWS);
    let cols = optional_dimension("cols", raw.cols)?.unwrap_or(DEFAULT_COLS);
    Ok(TerminalRequest {
        term: non_empty(raw.term),
        dimensions: Dimensions { rows, cols },
    })
}

fn parse_resize(raw: RawResize) -> Result<Dimensions, ValidationError> {
    let rows = raw.rows.ok_or_else(|| ValidationError::field("rows", "is required"))?;
    let cols = raw.cols.ok_or_else(|| ValidationError::field("cols", "is required"))?;
    Ok(Dimensions {
        rows: dimension("rows", rows)?,
        cols: dimension("cols", cols)?,
    })
}

fn parse_exec(raw: RawExec) -> Result<ExecRequest, ValidationError> {
    let command = required_text("command", raw.command)?;
    let cols = optional_dimension("cols", raw.cols)?.unwrap_or(DEFAULT_COLS);
    let rows = optional_dimension("rows", raw.rows)?.unwrap_or(DEFAULT_ROWS);

    let env = raw
        .env
        .unwrap_or_default()
        .into_iter()
        .map(|(key, value)| match value {
            Value::String(s) => Ok((key, s)),
            _ => Err(ValidationError::field("env", format!("value of {} must be a string", key))),
        })
        .collect::<Result<EnvironmentMap, _>>()?;

    let timeout_ms = match raw.timeout_ms {
        None => None,
        Some(ms) if ms > 0 => Some(ms as u64),
        Some(_) => return Err(ValidationError::field("timeoutMs", "must be positive")),
    };

    Ok(ExecRequest {
        command,
        pty: raw.pty.unwrap_or(false),
        term: non_empty(raw.term),
        dimensions: Dimensions { rows, cols },
        env,
        timeout_ms,
    })
}

fn parse_control(raw: RawControl) -> Result<ControlAction, ValidationError> {
    let action = raw
        .action
        .ok_or_else(|| ValidationError::field("action", "is required"))?;
    serde_json::from_value(Value::String(action.clone()))
        .map_err(|_| ValidationError::field("action", format!("unsupported action '{}'", action)))
}

/// One keyboard-interactive prompt forwarded to the browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptInfo {
    pub prompt: String,
    pub echo: bool,
}

/// Keyboard-interactive request the gateway could not answer itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InteractivePrompt {
    pub name: String,
    pub instructions: String,
    pub prompts: Vec<PromptInfo>,
}

/// Payload of the `authentication` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action")]
pub enum AuthenticationEvent {
    #[serde(rename = "auth_result")]
    AuthResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    #[serde(rename = "keyboard-interactive")]
    KeyboardInteractive(InteractivePrompt),
    #[serde(rename = "reauth")]
    Reauth,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UiUpdate {
    pub element: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecExit {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<String>,
    /// Set when the gateway closed the command after `timeoutMs`.
    #[serde(rename = "timedOut", skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,
}

/// Event sent to the browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "authentication")]
    Authentication(AuthenticationEvent),
    #[serde(rename = "permissions")]
    Permissions(Permissions),
    #[serde(rename = "getTerminal")]
    GetTerminal(bool),
    #[serde(rename = "updateUI")]
    UpdateUi(UiUpdate),
    #[serde(rename = "data", serialize_with = "serialize_lossy")]
    Data(Bytes),
    #[serde(rename = "ssherror")]
    SshError(String),
    #[serde(rename = "shutdownCountdownUpdate")]
    ShutdownCountdownUpdate(u64),
    #[serde(rename = "execExit")]
    ExecExit(ExecExit),
}

impl ServerEvent {
    pub fn auth_result(success: bool, message: Option<String>) -> Self {
        ServerEvent::Authentication(AuthenticationEvent::AuthResult { success, message })
    }

    pub fn footer(value: String) -> Self {
        ServerEvent::UpdateUi(UiUpdate {
            element: "footer".to_string(),
            value,
        })
    }
}

fn serialize_lossy<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    mod auth_messages {
        use super::*;

        #[test]
        fn test_minimal_auth_defaults_port() {
            let msg = ClientMessage::parse(
                r#"{"type":"auth","payload":{"username":"alice","host":"example.com","password":"pw"}}"#,
            )
            .unwrap();
            let ClientMessage::Auth(auth) = msg else {
                panic!("expected auth");
            };
            assert_eq!(auth.credentials.port, 22);
            assert_eq!(auth.credentials.password.as_deref(), Some("pw"));
            assert!(auth.dimensions.is_none());
        }

        #[test]
        fn test_missing_username() {
            let err = ClientMessage::parse(r#"{"type":"auth","payload":{"host":"h"}}"#).unwrap_err();
            assert_eq!(err, ValidationError::field("username", "is required"));
        }

        #[test]
        fn test_first_failure_short_circuits() {
            let err = ClientMessage::parse(r#"{"type":"auth","payload":{"port":0}}"#).unwrap_err();
            assert!(matches!(err, ValidationError::InvalidField { field: "username", .. }));
        }

        #[test]
        fn test_port_bounds() {
            for bad in [0, 65536, -1] {
                let text = json!({"type":"auth","payload":{"username":"u","host":"h","port":bad}}).to_string();
                assert!(matches!(
                    ClientMessage::parse(&text),
                    Err(ValidationError::InvalidField { field: "port", .. })
                ));
            }
        }

        #[test]
        fn test_private_key_camel_case() {
            let text = json!({"type":"auth","payload":{"username":"u","host":"h","privateKey":"KEY","passphrase":"pp","cols":120}}).to_string();
            let ClientMessage::Auth(auth) = ClientMessage::parse(&text).unwrap() else {
                panic!("expected auth");
            };
            assert_eq!(auth.credentials.private_key.as_deref(), Some("KEY"));
            assert_eq!(auth.dimensions, Some(Dimensions { rows: 24, cols: 120 }));
            assert!(auth.credentials.has_secret());
        }

        #[test]
        fn test_bracketed_ipv6_host_is_stored_bare() {
            let text = json!({"type":"auth","payload":{"username":"u","host":"[::1]","password":"pw"}}).to_string();
            let ClientMessage::Auth(auth) = ClientMessage::parse(&text).unwrap() else {
                panic!("expected auth");
            };
            assert_eq!(auth.credentials.host, "::1");
            assert_eq!(auth.credentials.target_label(), "ssh://[::1]:22");
        }

        #[test]
        fn test_unbracket_host() {
            assert_eq!(unbracket_host("[fe80::1]".to_string()), "fe80::1");
            assert_eq!(unbracket_host("example.com".to_string()), "example.com");
            assert_eq!(unbracket_host("[]".to_string()), "[]");
            assert_eq!(unbracket_host("[::1".to_string()), "[::1");
        }

        #[test]
        fn test_debug_redacts_secrets() {
            let creds = SessionCredentials {
                host: "h".into(),
                port: 22,
                username: "u".into(),
                password: Some("hunter2".into()),
                private_key: None,
                passphrase: None,
            };
            let out = format!("{:?}", creds);
            assert!(!out.contains("hunter2"));
            assert!(out.contains("<redacted>"));
        }
    }

    mod dimension_bounds {
        use super::*;

        #[test]
        fn test_resize_requires_both() {
            assert!(matches!(
                ClientMessage::parse(r#"{"type":"resize","payload":{"rows":10}}"#),
                Err(ValidationError::InvalidField { field: "cols", .. })
            ));
        }

        #[test]
        fn test_resize_bounds() {
            assert!(ClientMessage::parse(r#"{"type":"resize","payload":{"rows":9999,"cols":1}}"#).is_ok());
            assert!(ClientMessage::parse(r#"{"type":"resize","payload":{"rows":10000,"cols":1}}"#).is_err());
            assert!(ClientMessage::parse(r#"{"type":"resize","payload":{"rows":0,"cols":1}}"#).is_err());
        }

        #[test]
        fn test_terminal_defaults() {
            let msg = ClientMessage::parse(r#"{"type":"terminal"}"#).unwrap();
            assert_eq!(
                msg,
                ClientMessage::Terminal(TerminalRequest {
                    term: None,
                    dimensions: Dimensions { rows: 24, cols: 80 },
                })
            );
        }
    }

    mod exec_messages {
        use super::*;

        #[test]
        fn test_env_keeps_order() {
            let text = r#"{"type":"exec","payload":{"command":"env","env":{"ZED":"1","ALPHA":"2"}}}"#;
            let ClientMessage::Exec(exec) = ClientMessage::parse(text).unwrap() else {
                panic!("expected exec");
            };
            assert_eq!(
                exec.env,
                vec![("ZED".to_string(), "1".to_string()), ("ALPHA".to_string(), "2".to_string())]
            );
            assert!(!exec.pty);
        }

        #[test]
        fn test_env_values_must_be_strings() {
            let text = r#"{"type":"exec","payload":{"command":"env","env":{"N":1}}}"#;
            assert!(matches!(
                ClientMessage::parse(text),
                Err(ValidationError::InvalidField { field: "env", .. })
            ));
        }

        #[test]
        fn test_empty_command_rejected() {
            let text = r#"{"type":"exec","payload":{"command":"  "}}"#;
            assert!(ClientMessage::parse(text).is_err());
        }
    }

    mod control_and_data {
        use super::*;

        #[test]
        fn test_control_actions() {
            for (raw, action) in [
                ("reauth", ControlAction::Reauth),
                ("clear-credentials", ControlAction::ClearCredentials),
                ("disconnect", ControlAction::Disconnect),
                ("replayCredentials", ControlAction::ReplayCredentials),
            ] {
                let text = json!({"type":"control","payload":{"action":raw}}).to_string();
                assert_eq!(ClientMessage::parse(&text).unwrap(), ClientMessage::Control(action));
            }
        }

        #[test]
        fn test_unknown_control_action() {
            let text = r#"{"type":"control","payload":{"action":"reboot"}}"#;
            assert!(matches!(
                ClientMessage::parse(text),
                Err(ValidationError::InvalidField { field: "action", .. })
            ));
        }

        #[test]
        fn test_data_string() {
            let msg = ClientMessage::parse(r#"{"type":"data","payload":"ls\r"}"#).unwrap();
            assert_eq!(msg, ClientMessage::Data(Bytes::from_static(b"ls\r")));
        }

        #[test]
        fn test_unknown_type_rejected() {
            assert_eq!(
                ClientMessage::parse(r#"{"type":"sftp","payload":{}}"#),
                Err(ValidationError::UnknownType("sftp".to_string()))
            );
        }

        #[test]
        fn test_malformed_json() {
            assert!(matches!(ClientMessage::parse("{not json"), Err(ValidationError::Malformed(_))));
        }
    }

    mod outbound {
        use super::*;

        #[test]
        fn test_auth_result_shape() {
            let value = serde_json::to_value(ServerEvent::auth_result(false, Some("nope".into()))).unwrap();
            assert_eq!(
                value,
                json!({"event":"authentication","data":{"action":"auth_result","success":false,"message":"nope"}})
            );
        }

        #[test]
        fn test_permissions_shape() {
            let value = serde_json::to_value(ServerEvent::Permissions(Permissions::default())).unwrap();
            assert_eq!(
                value,
                json!({"event":"permissions","data":{"autoLog":false,"allowReplay":false,"allowReconnect":true,"allowReauth":true}})
            );
        }

        #[test]
        fn test_footer_and_countdown_shape() {
            assert_eq!(
                serde_json::to_value(ServerEvent::footer("ssh://h:22".into())).unwrap(),
                json!({"event":"updateUI","data":{"element":"footer","value":"ssh://h:22"}})
            );
            assert_eq!(
                serde_json::to_value(ServerEvent::ShutdownCountdownUpdate(7)).unwrap(),
                json!({"event":"shutdownCountdownUpdate","data":7})
            );
        }

        #[test]
        fn test_keyboard_interactive_shape() {
            let event = ServerEvent::Authentication(AuthenticationEvent::KeyboardInteractive(
                InteractivePrompt {
                    name: String::new(),
                    instructions: "OTP".into(),
                    prompts: vec![PromptInfo { prompt: "Code: ".into(), echo: false }],
                },
            ));
            assert_eq!(
                serde_json::to_value(event).unwrap(),
                json!({"event":"authentication","data":{"action":"keyboard-interactive","name":"","instructions":"OTP","prompts":[{"prompt":"Code: ","echo":false}]}})
            );
        }

        #[test]
        fn test_exec_exit_shape() {
            let exit = ServerEvent::ExecExit(ExecExit {
                code: Some(0),
                signal: None,
                timed_out: false,
            });
            assert_eq!(
                serde_json::to_value(exit).unwrap(),
                json!({"event":"execExit","data":{"code":0}})
            );

            let timed_out = ServerEvent::ExecExit(ExecExit {
                code: None,
                signal: None,
                timed_out: true,
            });
            assert_eq!(
                serde_json::to_value(timed_out).unwrap(),
                json!({"event":"execExit","data":{"timedOut":true}})
            );
        }
    }
}
