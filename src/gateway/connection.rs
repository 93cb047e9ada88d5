//! SSH connection adapter used by the session gateway.
//!
//! [`SshAdapter`] is the seam between the protocol bridge and the SSH
//! library; [`SshConnection`] implements it on top of `russh`.
//!
//! ## Connection Lifecycle
//!
//! 1. **Client Configuration**: keepalive settings from [`SshSettings`] and fixed
//!    algorithm preference lists (fast AEAD ciphers and modern key exchange first).
//!
//! 2. **Connection Establishment**: TCP connect, key exchange and authentication
//!    all run under a single `ready_timeout`.
//!
//! 3. **Authentication**: an [`AuthChain`] built from the session credentials.
//!    There are no retries; repeated authentication attempts only risk lockouts.
//!
//! 4. **Streams**: at most one shell or exec channel at a time. The channel is
//!    split; the write half stays here and a reader task forwards channel
//!    messages as [`StreamEvent`]s.
//!
//! 5. **Teardown**: [`SshAdapter::end`] closes the stream, then the connection.

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use russh::keys::Algorithm;
use russh::keys::ssh_key::{EcdsaCurve, HashAlg};
use russh::{
    ChannelMsg, ChannelReadHalf, ChannelWriteHalf, Disconnect, Preferred, Sig, client,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::auth::AuthChain;
use super::config::SshSettings;
use super::env_filter::EnvironmentMap;
use super::error::{ErrorLevel, SshConnectionError};
use super::handler::GatewayClientHandler;
use super::protocol::{Dimensions, InteractivePrompt, SessionCredentials};

/// Buffered stream events before the reader task waits on the gateway.
const STREAM_BUFFER: usize = 256;

/// PTY parameters for a shell or exec channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyOptions {
    pub term: String,
    pub dimensions: Dimensions,
}

/// Output and lifecycle events of the active stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Data(Bytes),
    ExtendedData(Bytes),
    ExitStatus(u32),
    ExitSignal(String),
    /// The channel closed normally. Always the last event.
    Closed,
    /// The channel or the connection failed. Always the last event.
    Error(SshConnectionError),
}

/// Operations the session gateway needs from an SSH connection.
#[async_trait]
pub trait SshAdapter: Send {
    /// Connect and authenticate. Ends any existing connection first.
    ///
    /// Keyboard-interactive prompts that cannot be answered locally are sent
    /// on `prompts`.
    async fn connect(
        &mut self,
        creds: &SessionCredentials,
        prompts: mpsc::UnboundedSender<InteractivePrompt>,
    ) -> Result<(), SshConnectionError>;

    /// Open an interactive shell with a PTY.
    async fn shell(
        &mut self,
        pty: &PtyOptions,
        env: &EnvironmentMap,
    ) -> Result<mpsc::Receiver<StreamEvent>, SshConnectionError>;

    /// Run a single command, with a PTY only when `pty` is given.
    async fn exec(
        &mut self,
        command: &str,
        pty: Option<&PtyOptions>,
        env: &EnvironmentMap,
    ) -> Result<mpsc::Receiver<StreamEvent>, SshConnectionError>;

    /// Write bytes to the active stream.
    async fn write(&mut self, data: &[u8]) -> Result<(), SshConnectionError>;

    /// Send a window-change for the active stream. No-op without one.
    async fn resize(&mut self, dimensions: Dimensions) -> Result<(), SshConnectionError>;

    /// Close the active stream and keep the connection.
    async fn close_stream(&mut self);

    /// Close the stream and the connection. Safe to call repeatedly.
    async fn end(&mut self);
}

/// Build russh client configuration from the SSH settings.
///
/// No inactivity timeout is set; liveness is left to keepalives so an idle
/// terminal stays open.
pub(crate) fn build_client_config(settings: &SshSettings) -> Arc<client::Config> {
    let compression = if settings.compress {
        (&[russh::compression::ZLIB, russh::compression::NONE][..]).into()
    } else {
        (&[russh::compression::NONE][..]).into()
    };

    let preferred = Preferred {
        kex: Cow::Borrowed(&[
            russh::kex::CURVE25519,
            russh::kex::CURVE25519_PRE_RFC_8731,
            russh::kex::ECDH_SHA2_NISTP256,
            russh::kex::ECDH_SHA2_NISTP384,
            russh::kex::ECDH_SHA2_NISTP521,
            russh::kex::DH_G16_SHA512,
            russh::kex::DH_G14_SHA256,
            russh::kex::DH_G14_SHA1,
        ]),
        key: Cow::Owned(vec![
            Algorithm::Ed25519,
            Algorithm::Ecdsa {
                curve: EcdsaCurve::NistP256,
            },
            Algorithm::Ecdsa {
                curve: EcdsaCurve::NistP384,
            },
            Algorithm::Ecdsa {
                curve: EcdsaCurve::NistP521,
            },
            Algorithm::Rsa {
                hash: Some(HashAlg::Sha512),
            },
            Algorithm::Rsa {
                hash: Some(HashAlg::Sha256),
            },
            Algorithm::Rsa { hash: None },
        ]),
        cipher: Cow::Borrowed(&[
            russh::cipher::CHACHA20_POLY1305,
            russh::cipher::AES_256_GCM,
            russh::cipher::AES_128_GCM,
            russh::cipher::AES_256_CTR,
            russh::cipher::AES_192_CTR,
            russh::cipher::AES_128_CTR,
        ]),
        mac: Cow::Borrowed(&[
            russh::mac::HMAC_SHA256_ETM,
            russh::mac::HMAC_SHA512_ETM,
            russh::mac::HMAC_SHA256,
            russh::mac::HMAC_SHA512,
            russh::mac::HMAC_SHA1,
        ]),
        compression,
        ..Default::default()
    };

    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(settings.keepalive_interval),
        keepalive_max: settings.keepalive_count_max,
        preferred,
        ..Default::default()
    })
}

/// The open stream: write half plus the token stopping its reader task.
struct ActiveStream {
    writer: ChannelWriteHalf<client::Msg>,
    cancel: CancellationToken,
}

/// `russh` backed [`SshAdapter`].
pub struct SshConnection {
    settings: SshSettings,
    handle: Option<client::Handle<GatewayClientHandler>>,
    stream: Option<ActiveStream>,
}

impl SshConnection {
    pub fn new(settings: SshSettings) -> Self {
        Self {
            settings,
            handle: None,
            stream: None,
        }
    }

    /// Open a session channel and apply the environment and PTY requests.
    async fn open_channel(
        &mut self,
        pty: Option<&PtyOptions>,
        env: &EnvironmentMap,
    ) -> Result<russh::Channel<client::Msg>, SshConnectionError> {
        // Only one stream per connection
        self.close_stream().await;

        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| SshConnectionError::stream("Not connected"))?;

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| SshConnectionError::from_transport(&e, true))?;

        for (key, value) in env {
            channel
                .set_env(false, key.as_str(), value.as_str())
                .await
                .map_err(|e| SshConnectionError::stream(format!("Failed to set {}: {}", key, e)))?;
        }

        if let Some(pty) = pty {
            channel
                .request_pty(
                    false,
                    &pty.term,
                    pty.dimensions.cols,
                    pty.dimensions.rows,
                    0,
                    0,
                    &[],
                )
                .await
                .map_err(|e| SshConnectionError::stream(format!("PTY request failed: {}", e)))?;
        }

        Ok(channel)
    }

    /// Split the channel and start forwarding its messages.
    fn attach(&mut self, channel: russh::Channel<client::Msg>) -> mpsc::Receiver<StreamEvent> {
        let (read_half, writer) = channel.split();
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let cancel = CancellationToken::new();

        tokio::spawn(forward_channel(read_half, tx, cancel.clone()));

        self.stream = Some(ActiveStream { writer, cancel });
        rx
    }
}

/// Establish the transport and run the authentication chain.
async fn connect_and_authenticate(
    settings: &SshSettings,
    creds: &SessionCredentials,
    prompts: mpsc::UnboundedSender<InteractivePrompt>,
) -> Result<client::Handle<GatewayClientHandler>, SshConnectionError> {
    let config = build_client_config(settings);
    let handler = GatewayClientHandler::new(&creds.host, creds.port);

    let mut handle = client::connect(config, (creds.host.as_str(), creds.port), handler)
        .await
        .map_err(|e| SshConnectionError::from_transport(&e, false))?;

    let chain = AuthChain::for_credentials(creds, Some(prompts));
    let authenticated = chain
        .authenticate(&mut handle, &creds.username)
        .await
        .map_err(|e| SshConnectionError::from_transport(&e, false))?;

    if !authenticated {
        let _ = handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
        return Err(SshConnectionError::authentication(
            "All configured authentication methods failed",
        ));
    }

    Ok(handle)
}

/// Signal name as the server reported it, without the `SIG` prefix.
fn signal_label(sig: &Sig) -> String {
    match sig {
        Sig::Custom(name) => name.clone(),
        other => format!("{:?}", other),
    }
}

/// Relay channel messages until the channel closes or the stream is cancelled.
async fn forward_channel(
    mut read_half: ChannelReadHalf,
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
) {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = read_half.wait() => msg,
        };

        let event = match msg {
            Some(ChannelMsg::Data { data }) => StreamEvent::Data(Bytes::copy_from_slice(&data)),
            Some(ChannelMsg::ExtendedData { data, ext }) => {
                debug!("extended data on stream {}", ext);
                StreamEvent::ExtendedData(Bytes::copy_from_slice(&data))
            }
            Some(ChannelMsg::ExitStatus { exit_status }) => StreamEvent::ExitStatus(exit_status),
            Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                StreamEvent::ExitSignal(signal_label(&signal_name))
            }
            Some(ChannelMsg::Close) => {
                let _ = tx.send(StreamEvent::Closed).await;
                break;
            }
            Some(ChannelMsg::Failure) => {
                let _ = tx
                    .send(StreamEvent::Error(SshConnectionError::stream(
                        "Channel request rejected by server",
                    )))
                    .await;
                break;
            }
            Some(_) => continue,
            None => {
                let _ = tx
                    .send(StreamEvent::Error(SshConnectionError::new(
                        Some("ECONNRESET".to_string()),
                        Some(ErrorLevel::ClientSocket),
                        "SSH connection lost",
                    )))
                    .await;
                break;
            }
        };

        if tx.send(event).await.is_err() {
            break;
        }
    }
}

#[async_trait]
impl SshAdapter for SshConnection {
    async fn connect(
        &mut self,
        creds: &SessionCredentials,
        prompts: mpsc::UnboundedSender<InteractivePrompt>,
    ) -> Result<(), SshConnectionError> {
        if self.handle.is_some() {
            self.end().await;
        }

        let timeout = self.settings.ready_timeout;
        let handle = tokio::time::timeout(
            timeout,
            connect_and_authenticate(&self.settings, creds, prompts),
        )
        .await
        .map_err(|_| {
            SshConnectionError::timeout(format!("Connection timed out after {:?}", timeout))
        })??;

        info!(
            "SSH connection established to {}@{}:{}",
            creds.username, creds.host, creds.port
        );
        self.handle = Some(handle);
        Ok(())
    }

    async fn shell(
        &mut self,
        pty: &PtyOptions,
        env: &EnvironmentMap,
    ) -> Result<mpsc::Receiver<StreamEvent>, SshConnectionError> {
        let channel = self.open_channel(Some(pty), env).await?;
        channel
            .request_shell(false)
            .await
            .map_err(|e| SshConnectionError::stream(format!("Shell request failed: {}", e)))?;

        debug!("Shell opened ({}x{})", pty.dimensions.cols, pty.dimensions.rows);
        Ok(self.attach(channel))
    }

    async fn exec(
        &mut self,
        command: &str,
        pty: Option<&PtyOptions>,
        env: &EnvironmentMap,
    ) -> Result<mpsc::Receiver<StreamEvent>, SshConnectionError> {
        let channel = self.open_channel(pty, env).await?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| SshConnectionError::stream(format!("Failed to execute command: {}", e)))?;

        Ok(self.attach(channel))
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), SshConnectionError> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| SshConnectionError::stream("No active stream"))?;

        stream
            .writer
            .data(data)
            .await
            .map_err(|e| SshConnectionError::stream(format!("Failed to write to stream: {}", e)))
    }

    async fn resize(&mut self, dimensions: Dimensions) -> Result<(), SshConnectionError> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };

        stream
            .writer
            .window_change(dimensions.cols, dimensions.rows, 0, 0)
            .await
            .map_err(|e| SshConnectionError::stream(format!("Failed to resize PTY: {}", e)))
    }

    async fn close_stream(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.cancel.cancel();
            if let Err(e) = stream.writer.close().await {
                debug!("Stream already closed: {}", e);
            }
        }
    }

    async fn end(&mut self) {
        self.close_stream().await;

        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await
            {
                warn!("Error while disconnecting SSH session: {}", e);
            }
            debug!("SSH connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    mod test_client_config {
        use super::*;

        #[test]
        fn test_keepalive_from_settings() {
            let settings = SshSettings {
                keepalive_interval: Duration::from_secs(15),
                keepalive_count_max: 4,
                ..Default::default()
            };
            let config = build_client_config(&settings);
            assert_eq!(config.keepalive_interval, Some(Duration::from_secs(15)));
            assert_eq!(config.keepalive_max, 4);
            assert_eq!(config.inactivity_timeout, None);
        }

        #[test]
        fn test_compression_enabled() {
            let config = build_client_config(&SshSettings::default());
            assert_eq!(config.preferred.compression.len(), 2);
            assert_eq!(
                config.preferred.compression[0],
                russh::compression::ZLIB
            );
        }

        #[test]
        fn test_compression_disabled() {
            let settings = SshSettings {
                compress: false,
                ..Default::default()
            };
            let config = build_client_config(&settings);
            assert_eq!(config.preferred.compression.len(), 1);
            assert_eq!(
                config.preferred.compression[0],
                russh::compression::NONE
            );
        }

        #[test]
        fn test_modern_algorithms_first() {
            let config = build_client_config(&SshSettings::default());
            assert_eq!(config.preferred.kex[0], russh::kex::CURVE25519);
            assert_eq!(config.preferred.cipher[0], russh::cipher::CHACHA20_POLY1305);
            assert_eq!(config.preferred.key[0], Algorithm::Ed25519);
        }
    }

    mod test_signal_label {
        use super::*;

        #[test]
        fn test_standard_signal() {
            assert_eq!(signal_label(&Sig::TERM), "TERM");
            assert_eq!(signal_label(&Sig::KILL), "KILL");
        }

        #[test]
        fn test_custom_signal_uses_bare_name() {
            assert_eq!(signal_label(&Sig::Custom("USR1".to_string())), "USR1");
        }
    }

    mod test_without_connection {
        use super::*;

        #[tokio::test]
        async fn test_resize_without_stream_is_noop() {
            let mut conn = SshConnection::new(SshSettings::default());
            assert!(conn.resize(Dimensions::default()).await.is_ok());
        }

        #[tokio::test]
        async fn test_write_without_stream_fails() {
            let mut conn = SshConnection::new(SshSettings::default());
            let err = conn.write(b"ls\n").await.unwrap_err();
            assert_eq!(err.level(), Some(ErrorLevel::Stream));
        }

        #[tokio::test]
        async fn test_shell_without_connection_fails() {
            let mut conn = SshConnection::new(SshSettings::default());
            let pty = PtyOptions {
                term: "xterm".to_string(),
                dimensions: Dimensions::default(),
            };
            assert!(conn.shell(&pty, &Vec::new()).await.is_err());
        }

        #[tokio::test]
        async fn test_end_is_idempotent() {
            let mut conn = SshConnection::new(SshSettings::default());
            conn.end().await;
            conn.end().await;
            assert!(conn.handle.is_none());
        }
    }
}
