//! Per-connection session gateway.
//!
//! A [`SessionGateway`] binds one browser socket to one SSH connection and
//! owns all of that session's mutable state; it runs as a single task, so
//! nothing in here is shared or locked.
//!
//! # States
//!
//! ```text
//! Idle -> Authenticating -> Connected -> Streaming -> Closing -> Closed
//!               |                ^           |
//!               |                +-- exec ---+
//!               +--> Closing (rejected / failed connect)
//! ```
//!
//! # Event Sources
//!
//! The run loop selects over the inbound client messages, the active
//! stream's events, the shutdown countdown and the exec deadline. Messages
//! arriving while a connect is pending are queued and handled in order once
//! it settles.
//!
//! # Errors
//!
//! Only the first failure of a session is reported to the browser. Later
//! failures, typically side effects of the teardown itself, are logged.

use std::collections::VecDeque;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use ipnet::IpNet;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::{GatewayConfig, Permissions};
use super::connection::{PtyOptions, SshAdapter, StreamEvent};
use super::env_filter::{EnvironmentMap, filter_env};
use super::error::{ErrorKind, ErrorLevel, SshConnectionError, ValidationError};
use super::protocol::{
    AuthRequest, AuthenticationEvent, ClientMessage, ControlAction, Dimensions, ExecExit,
    ExecRequest, ServerEvent, SessionCredentials, TerminalRequest,
};
use super::shutdown::SessionGuard;

/// Shown when an `auth` message carries no secret and nothing is cached.
const REFRESH_AND_RETRY: &str =
    "Your session has expired or is missing credentials. Please refresh the page and try again.";

/// Outbound half of the browser connection.
#[async_trait]
pub trait EventSink: Send {
    async fn send(&mut self, event: ServerEvent) -> io::Result<()>;

    /// Close the browser connection. Called once during teardown.
    async fn close(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Idle,
    Authenticating,
    Connected,
    Streaming,
    Closing,
    Closed,
}

/// Mutable per-session state.
#[derive(Debug, Clone)]
pub struct SessionState {
    /// Credentials of the current (or last attempted) connection.
    pub credentials: Option<SessionCredentials>,
    /// Credentials captured from HTTP Basic auth, reused when `auth` has no secret.
    pub cached_credentials: Option<SessionCredentials>,
    pub term: String,
    pub dimensions: Dimensions,
    pub permissions: Permissions,
    /// The failure reported to the browser, if any.
    pub first_error: Option<String>,
    /// A reauth prompt has already been offered.
    pub auth_failed: bool,
    /// Variables requested on the socket URL, unfiltered.
    pub env: EnvironmentMap,
    pub connected_at: Option<DateTime<Utc>>,
}

enum StreamKind {
    Shell,
    Exec { deadline: Option<Instant> },
}

struct OpenStream {
    kind: StreamKind,
    exit_code: Option<u32>,
    exit_signal: Option<String>,
}

impl OpenStream {
    fn new(kind: StreamKind) -> Self {
        Self {
            kind,
            exit_code: None,
            exit_signal: None,
        }
    }

    fn deadline(&self) -> Option<Instant> {
        match self.kind {
            StreamKind::Exec { deadline } => deadline,
            StreamKind::Shell => None,
        }
    }
}

pub struct SessionGateway<A, S> {
    id: Uuid,
    config: Arc<GatewayConfig>,
    adapter: A,
    sink: S,
    guard: Option<SessionGuard>,
    state: GatewayState,
    session: SessionState,
    stream: Option<OpenStream>,
    stream_rx: Option<mpsc::Receiver<StreamEvent>>,
    countdown_rx: Option<broadcast::Receiver<u64>>,
    backlog: VecDeque<Result<ClientMessage, ValidationError>>,
}

impl<A: SshAdapter, S: EventSink> SessionGateway<A, S> {
    pub fn new(config: Arc<GatewayConfig>, adapter: A, sink: S, guard: SessionGuard) -> Self {
        let session = SessionState {
            credentials: None,
            cached_credentials: None,
            term: config.ssh.term.clone(),
            dimensions: Dimensions::default(),
            permissions: config.permissions,
            first_error: None,
            auth_failed: false,
            env: Vec::new(),
            connected_at: None,
        };

        Self {
            id: guard.id(),
            countdown_rx: Some(guard.coordinator().subscribe()),
            config,
            adapter,
            sink,
            guard: Some(guard),
            state: GatewayState::Idle,
            session,
            stream: None,
            stream_rx: None,
            backlog: VecDeque::new(),
        }
    }

    /// Credentials from HTTP Basic auth.
    pub fn with_cached_credentials(mut self, credentials: Option<SessionCredentials>) -> Self {
        self.session.cached_credentials = credentials;
        self
    }

    /// Environment requested on the socket URL.
    pub fn with_session_env(mut self, env: EnvironmentMap) -> Self {
        self.session.env = env;
        self
    }

    pub fn state(&self) -> GatewayState {
        self.state
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// Drive the session until it closes.
    pub async fn run<I>(&mut self, mut inbound: I)
    where
        I: Stream<Item = Result<ClientMessage, ValidationError>> + Unpin + Send,
    {
        debug!("Session {} started", self.id);

        while !self.is_closing() {
            if let Some(msg) = self.backlog.pop_front() {
                self.dispatch(msg, &mut inbound).await;
                continue;
            }

            let deadline = self.stream.as_ref().and_then(OpenStream::deadline);

            tokio::select! {
                msg = inbound.next() => match msg {
                    Some(msg) => self.dispatch(msg, &mut inbound).await,
                    None => {
                        debug!("Session {}: client disconnected", self.id);
                        self.teardown().await;
                    }
                },
                event = next_stream_event(&mut self.stream_rx) => self.on_stream_event(event).await,
                remaining = next_countdown(&mut self.countdown_rx) => {
                    if let Some(remaining) = remaining {
                        self.emit(ServerEvent::ShutdownCountdownUpdate(remaining)).await;
                    }
                }
                _ = sleep_until(deadline) => self.on_exec_timeout().await,
            }
        }

        self.teardown().await;
    }

    fn is_closing(&self) -> bool {
        matches!(self.state, GatewayState::Closing | GatewayState::Closed)
    }

    async fn dispatch<I>(&mut self, msg: Result<ClientMessage, ValidationError>, inbound: &mut I)
    where
        I: Stream<Item = Result<ClientMessage, ValidationError>> + Unpin + Send,
    {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Session {}: rejected message: {}", self.id, e);
                self.emit(ServerEvent::SshError(e.to_string())).await;
                return;
            }
        };

        match msg {
            ClientMessage::Auth(req) => self.on_auth(req, inbound).await,
            ClientMessage::Terminal(req) => self.on_terminal(req).await,
            ClientMessage::Resize(dimensions) => self.on_resize(dimensions).await,
            ClientMessage::Exec(req) => self.on_exec(req).await,
            ClientMessage::Control(action) => self.on_control(action).await,
            ClientMessage::Data(data) => self.on_data(data).await,
        }
    }

    async fn on_auth<I>(&mut self, req: AuthRequest, inbound: &mut I)
    where
        I: Stream<Item = Result<ClientMessage, ValidationError>> + Unpin + Send,
    {
        if matches!(self.state, GatewayState::Connected | GatewayState::Streaming) {
            info!("Session {}: re-authenticating, closing current connection", self.id);
            self.drop_stream();
            self.adapter.end().await;
        }

        let Some(creds) = self.resolve_credentials(req.credentials) else {
            warn!("Session {}: auth without credentials and nothing cached", self.id);
            self.fail(REFRESH_AND_RETRY.to_string()).await;
            self.teardown().await;
            return;
        };

        if let Some(term) = req.term {
            self.session.term = term;
        }
        if let Some(dimensions) = req.dimensions {
            self.session.dimensions = dimensions;
        }

        self.state = GatewayState::Authenticating;
        self.session.credentials = Some(creds.clone());

        let config = Arc::clone(&self.config);
        let subnets = &config.ssh.allowed_subnets;
        if !subnets.is_empty()
            && let Err(reason) = check_subnets(&creds.host, creds.port, subnets).await
        {
            warn!("Session {}: {}", self.id, reason);
            self.fail(reason).await;
            self.teardown().await;
            return;
        }

        info!(
            "Session {}: connecting to {}@{}:{}",
            self.id, creds.username, creds.host, creds.port
        );

        let (prompt_tx, mut prompt_rx) = mpsc::unbounded_channel();
        let mut disconnected = false;
        let result = {
            let connect = self.adapter.connect(&creds, prompt_tx);
            tokio::pin!(connect);

            loop {
                tokio::select! {
                    biased;
                    result = &mut connect => break result,
                    Some(prompt) = prompt_rx.recv() => {
                        let event = ServerEvent::Authentication(
                            AuthenticationEvent::KeyboardInteractive(prompt),
                        );
                        if let Err(e) = self.sink.send(event).await {
                            debug!("Failed to forward prompt: {}", e);
                        }
                    }
                    msg = inbound.next(), if !disconnected => match msg {
                        Some(msg) => self.backlog.push_back(msg),
                        None => disconnected = true,
                    },
                }
            }
        };

        while let Ok(prompt) = prompt_rx.try_recv() {
            self.emit(ServerEvent::Authentication(
                AuthenticationEvent::KeyboardInteractive(prompt),
            ))
            .await;
        }

        if disconnected {
            debug!(
                "Session {}: client left during connect, closing connection",
                self.id
            );
            self.teardown().await;
            return;
        }

        match result {
            Ok(()) => self.on_connected(&creds).await,
            Err(e) => self.on_connect_failed(&creds, e).await,
        }
    }

    fn resolve_credentials(&self, requested: SessionCredentials) -> Option<SessionCredentials> {
        if requested.has_secret() {
            return Some(requested);
        }
        self.session
            .cached_credentials
            .clone()
            .filter(SessionCredentials::has_secret)
    }

    async fn on_connected(&mut self, creds: &SessionCredentials) {
        self.state = GatewayState::Connected;
        self.session.connected_at = Some(Utc::now());

        let label = creds.target_label();
        self.emit(ServerEvent::auth_result(true, None)).await;
        self.emit(ServerEvent::Permissions(self.session.permissions))
            .await;
        self.emit(ServerEvent::footer(label.clone())).await;
        self.emit(ServerEvent::GetTerminal(true)).await;

        if let Some(guard) = &self.guard {
            guard.coordinator().update_target(&guard.id(), label);
        }
    }

    async fn on_connect_failed(&mut self, creds: &SessionCredentials, err: SshConnectionError) {
        let kind = err.kind();
        warn!(
            "Session {}: connection to {}:{} failed ({}): {}",
            self.id, creds.host, creds.port, kind, err
        );

        if kind.should_clear_credentials() {
            debug!("Session {}: clearing cached credentials", self.id);
            self.session.cached_credentials = None;
        }

        let message = err.user_message(&creds.host, creds.port);
        if self.record_error(&message) {
            self.emit(ServerEvent::auth_result(false, Some(message)))
                .await;
        }
        if kind == ErrorKind::Authentication {
            self.offer_reauth().await;
        }
        self.teardown().await;
    }

    /// Invite the client to retry with new credentials, once per session.
    async fn offer_reauth(&mut self) -> bool {
        if !self.session.permissions.allow_reauth || self.session.auth_failed {
            return false;
        }
        self.session.auth_failed = true;
        self.emit(ServerEvent::Authentication(AuthenticationEvent::Reauth))
            .await;
        true
    }

    async fn on_terminal(&mut self, req: TerminalRequest) {
        match self.state {
            GatewayState::Connected => {}
            GatewayState::Streaming => {
                debug!("Session {}: terminal already open", self.id);
                return;
            }
            _ => {
                self.emit(ServerEvent::SshError(
                    "Terminal requested before authentication".to_string(),
                ))
                .await;
                return;
            }
        }

        if let Some(term) = req.term {
            self.session.term = term;
        }
        self.session.dimensions = req.dimensions;

        let env = filter_env(&self.session.env, &self.config.ssh.env_allowlist);
        let pty = PtyOptions {
            term: self.session.term.clone(),
            dimensions: self.session.dimensions,
        };

        match self.adapter.shell(&pty, &env).await {
            Ok(rx) => {
                self.stream_rx = Some(rx);
                self.stream = Some(OpenStream::new(StreamKind::Shell));
                self.state = GatewayState::Streaming;
                debug!(
                    "Session {}: shell open ({} {}x{})",
                    self.id, pty.term, pty.dimensions.cols, pty.dimensions.rows
                );
            }
            Err(e) => self.on_stream_error(e).await,
        }
    }

    async fn on_exec(&mut self, req: ExecRequest) {
        if self.state != GatewayState::Connected {
            self.emit(ServerEvent::SshError(
                "Exec requires an authenticated session without an open stream".to_string(),
            ))
            .await;
            return;
        }

        let mut requested = self.session.env.clone();
        requested.extend(req.env);
        let env = filter_env(&requested, &self.config.ssh.env_allowlist);

        let pty = req.pty.then(|| PtyOptions {
            term: req.term.unwrap_or_else(|| self.session.term.clone()),
            dimensions: req.dimensions,
        });

        match self.adapter.exec(&req.command, pty.as_ref(), &env).await {
            Ok(rx) => {
                let deadline = req
                    .timeout_ms
                    .map(|ms| Instant::now() + Duration::from_millis(ms));
                self.stream_rx = Some(rx);
                self.stream = Some(OpenStream::new(StreamKind::Exec { deadline }));
                self.state = GatewayState::Streaming;
                debug!("Session {}: exec started", self.id);
            }
            Err(e) => self.on_stream_error(e).await,
        }
    }

    async fn on_resize(&mut self, dimensions: Dimensions) {
        self.session.dimensions = dimensions;
        if let Err(e) = self.adapter.resize(dimensions).await {
            self.on_stream_error(e).await;
        }
    }

    async fn on_data(&mut self, data: Bytes) {
        if self.state != GatewayState::Streaming {
            debug!("Session {}: dropping input without an open stream", self.id);
            return;
        }
        if let Err(e) = self.adapter.write(&data).await {
            self.on_stream_error(e).await;
        }
    }

    async fn on_control(&mut self, action: ControlAction) {
        debug!("Session {}: control {:?}", self.id, action);
        match action {
            ControlAction::ReplayCredentials => self.replay_credentials().await,
            ControlAction::Reauth => {
                if !self.session.permissions.allow_reauth {
                    self.emit(ServerEvent::SshError(
                        "Reauthentication is not permitted".to_string(),
                    ))
                    .await;
                    return;
                }
                self.session.cached_credentials = None;
                self.emit(ServerEvent::Authentication(AuthenticationEvent::Reauth))
                    .await;
                self.teardown().await;
            }
            ControlAction::ClearCredentials => {
                info!("Session {}: cached credentials cleared", self.id);
                self.session.cached_credentials = None;
            }
            ControlAction::Disconnect => self.teardown().await,
        }
    }

    async fn replay_credentials(&mut self) {
        if !self.session.permissions.allow_replay {
            self.emit(ServerEvent::SshError(
                "Credential replay is not permitted".to_string(),
            ))
            .await;
            return;
        }

        let password = self
            .session
            .credentials
            .as_ref()
            .and_then(|c| c.password.clone())
            .filter(|p| !p.is_empty());
        let Some(password) = password else {
            self.emit(ServerEvent::SshError(
                "No password available to replay".to_string(),
            ))
            .await;
            return;
        };

        if self.state != GatewayState::Streaming {
            self.emit(ServerEvent::SshError(
                "No open terminal to replay credentials into".to_string(),
            ))
            .await;
            return;
        }

        let payload = format!("{}{}", password, self.config.replay_line_ending());
        if let Err(e) = self.adapter.write(payload.as_bytes()).await {
            let message = format!("Failed to replay credentials: {}", e);
            warn!("Session {}: {}", self.id, message);
            self.fail(message).await;
            self.teardown().await;
        }
    }

    async fn on_stream_event(&mut self, event: Option<StreamEvent>) {
        match event {
            Some(StreamEvent::Data(data)) | Some(StreamEvent::ExtendedData(data)) => {
                self.emit(ServerEvent::Data(data)).await;
            }
            Some(StreamEvent::ExitStatus(code)) => {
                if let Some(stream) = self.stream.as_mut() {
                    stream.exit_code = Some(code);
                }
            }
            Some(StreamEvent::ExitSignal(signal)) => {
                if let Some(stream) = self.stream.as_mut() {
                    stream.exit_signal = Some(signal);
                }
            }
            Some(StreamEvent::Closed) | None => self.on_stream_closed().await,
            Some(StreamEvent::Error(e)) => self.on_stream_error(e).await,
        }
    }

    async fn on_stream_closed(&mut self) {
        self.stream_rx = None;
        let Some(stream) = self.stream.take() else {
            return;
        };

        match stream.kind {
            StreamKind::Exec { .. } => {
                self.emit(ServerEvent::ExecExit(ExecExit {
                    code: stream.exit_code,
                    signal: stream.exit_signal,
                    timed_out: false,
                }))
                .await;
                self.adapter.close_stream().await;
                self.state = GatewayState::Connected;
            }
            StreamKind::Shell => match stream.exit_signal {
                Some(signal) => {
                    let err = SshConnectionError::stream(format!(
                        "Shell terminated by signal {}",
                        signal
                    ));
                    self.on_stream_error(err).await;
                }
                None => {
                    info!(
                        "Session {}: shell closed (exit code {:?})",
                        self.id, stream.exit_code
                    );
                    self.teardown().await;
                }
            },
        }
    }

    async fn on_exec_timeout(&mut self) {
        warn!("Session {}: exec timed out, closing stream", self.id);
        self.drop_stream();
        self.adapter.close_stream().await;
        self.state = GatewayState::Connected;
        self.emit(ServerEvent::ExecExit(ExecExit {
            code: None,
            signal: None,
            timed_out: true,
        }))
        .await;
    }

    async fn on_stream_error(&mut self, err: SshConnectionError) {
        self.drop_stream();

        let (host, port) = self
            .session
            .credentials
            .as_ref()
            .map(|c| (c.host.clone(), c.port))
            .unwrap_or_default();
        let message = err.user_message(&host, port);

        if !self.record_error(&message) {
            debug!("Session {}: suppressing later error: {}", self.id, err);
            self.teardown().await;
            return;
        }

        warn!("Session {}: stream failed ({}): {}", self.id, err.kind(), err);

        let reauth = err.level() == Some(ErrorLevel::ClientAuthentication)
            && self.offer_reauth().await;
        if !reauth {
            self.emit(ServerEvent::SshError(message)).await;
        }

        self.teardown().await;
    }

    /// Report `message` if it is the session's first failure.
    async fn fail(&mut self, message: String) {
        if self.record_error(&message) {
            self.emit(ServerEvent::SshError(message)).await;
        }
    }

    /// Returns true when `message` became the session's first error.
    fn record_error(&mut self, message: &str) -> bool {
        if self.session.first_error.is_some() {
            return false;
        }
        self.session.first_error = Some(message.to_string());
        true
    }

    fn drop_stream(&mut self) {
        self.stream = None;
        self.stream_rx = None;
    }

    async fn emit(&mut self, event: ServerEvent) {
        if let Err(e) = self.sink.send(event).await {
            debug!("Session {}: failed to send event: {}", self.id, e);
        }
    }

    async fn teardown(&mut self) {
        if self.is_closing() {
            return;
        }

        self.state = GatewayState::Closing;
        self.drop_stream();
        self.adapter.end().await;
        self.sink.close().await;
        self.state = GatewayState::Closed;

        if let Some(guard) = self.guard.take() {
            let duration = self
                .session
                .connected_at
                .map(|at| (Utc::now() - at).num_seconds())
                .unwrap_or_default();
            info!("Session {} closed after {}s", guard.id(), duration);
        }
    }
}

/// Check that every address of `host` falls inside one of `subnets`.
pub async fn check_subnets(host: &str, port: u16, subnets: &[IpNet]) -> Result<(), String> {
    let literal = host.trim_start_matches('[').trim_end_matches(']');
    let addrs: Vec<IpAddr> = match literal.parse::<IpAddr>() {
        Ok(ip) => vec![ip],
        Err(_) => tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| format!("Unable to resolve host {}: {}", host, e))?
            .map(|addr| addr.ip())
            .collect(),
    };

    if addrs.is_empty() {
        return Err(format!("Unable to resolve host {}", host));
    }

    match addrs
        .iter()
        .find(|ip| !subnets.iter().any(|net| net.contains(*ip)))
    {
        Some(ip) => Err(format!(
            "Connections to {} ({}) are not allowed",
            host, ip
        )),
        None => Ok(()),
    }
}

async fn next_stream_event(rx: &mut Option<mpsc::Receiver<StreamEvent>>) -> Option<StreamEvent> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Next countdown value; a lagging receiver skips to the latest.
async fn next_countdown(rx: &mut Option<broadcast::Receiver<u64>>) -> Option<u64> {
    let Some(receiver) = rx else {
        return std::future::pending().await;
    };

    match receiver.recv().await {
        Ok(remaining) => Some(remaining),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
            debug!("Missed {} countdown updates", skipped);
            None
        }
        Err(broadcast::error::RecvError::Closed) => {
            *rx = None;
            None
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
