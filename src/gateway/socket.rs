//! HTTP and WebSocket endpoints.
//!
//! `GET /ssh/socket` upgrades to a WebSocket and runs one [`SessionGateway`]
//! on it. Optional inputs on the upgrade request:
//!
//! | Source | Use |
//! |--------|-----|
//! | `Authorization: Basic` | cached session credentials |
//! | `?host=&port=` | target for the cached credentials (defaults `SSH_HOST`/`SSH_PORT`) |
//! | `?env=FOO:bar,BAZ:qux` | session environment, filtered before use |
//!
//! `GET /healthz` reports the live session count and whether the process is
//! draining. It is mounted outside the shutdown guard so it still answers
//! during a drain.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::ready;
use futures::{Sink, SinkExt, StreamExt};
use poem::web::headers::authorization::Basic;
use poem::web::headers::{Authorization, HeaderMapExt};
use poem::web::websocket::{Message, WebSocket};
use poem::web::{Data, Json, Query, RemoteAddr};
use poem::middleware::Tracing;
use poem::{Endpoint, EndpointExt, IntoResponse, Request, Route, get, handler};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::bridge::{EventSink, SessionGateway};
use super::config::{GatewayConfig, SshSettings};
use super::connection::SshConnection;
use super::env_filter::parse_env_list;
use super::error::ValidationError;
use super::protocol::{ClientMessage, ServerEvent, SessionCredentials, unbracket_host};
use super::shutdown::{ShutdownCoordinator, ShutdownGuard};

/// Shared state handed to every request.
#[derive(Clone)]
pub struct GatewayContext {
    pub config: Arc<GatewayConfig>,
    pub coordinator: Arc<ShutdownCoordinator>,
}

/// Query parameters of the socket URL.
#[derive(Debug, Default, Deserialize)]
pub struct SocketParams {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub env: Option<String>,
}

/// The gateway's HTTP routes.
pub fn routes(ctx: GatewayContext) -> impl Endpoint {
    let guard = ShutdownGuard::new(Arc::clone(&ctx.coordinator));
    Route::new()
        .at("/ssh/socket", get(ssh_socket).with(guard))
        .at("/healthz", get(healthz))
        .with(Tracing)
        .data(ctx)
}

#[handler]
pub async fn ssh_socket(
    ws: WebSocket,
    req: &Request,
    remote_addr: &RemoteAddr,
    Query(params): Query<SocketParams>,
    Data(ctx): Data<&GatewayContext>,
) -> impl IntoResponse {
    let config = Arc::clone(&ctx.config);
    let coordinator = Arc::clone(&ctx.coordinator);
    let cached = basic_credentials(req, &params, &config.ssh);
    let env = params.env.as_deref().map(parse_env_list).unwrap_or_default();
    let peer = remote_addr.to_string();

    ws.on_upgrade(move |socket| async move {
        let guard = coordinator.register(peer.clone());
        info!("WebSocket session {} opened from {}", guard.id(), peer);

        let (sink, stream) = socket.split();
        let inbound = stream
            .take_while(|frame| ready(!matches!(frame, Ok(Message::Close(_)) | Err(_))))
            .filter_map(|frame| ready(decode_frame(frame)));

        let adapter = SshConnection::new(config.ssh.clone());
        let mut gateway = SessionGateway::new(config, adapter, WebSocketSink::new(sink), guard)
            .with_cached_credentials(cached)
            .with_session_env(env);

        gateway.run(inbound).await;
    })
}

#[handler]
pub fn healthz(Data(ctx): Data<&GatewayContext>) -> Json<Value> {
    let status = if ctx.coordinator.is_shutting_down() {
        "draining"
    } else {
        "ok"
    };
    Json(json!({
        "status": status,
        "sessions": ctx.coordinator.live_sessions(),
    }))
}

/// Credentials from HTTP Basic auth, if the request carries them and a target is known.
pub(crate) fn basic_credentials(
    req: &Request,
    params: &SocketParams,
    ssh: &SshSettings,
) -> Option<SessionCredentials> {
    let auth = req.headers().typed_get::<Authorization<Basic>>()?;
    let host = params
        .host
        .clone()
        .filter(|h| !h.is_empty())
        .or_else(|| ssh.default_host.clone())?;

    Some(SessionCredentials {
        host: unbracket_host(host),
        port: params.port.filter(|p| *p != 0).unwrap_or(ssh.default_port),
        username: auth.username().to_string(),
        password: Some(auth.password().to_string()),
        private_key: None,
        passphrase: None,
    })
}

/// Turn a WebSocket frame into a client message. Control frames yield nothing.
fn decode_frame(
    frame: Result<Message, io::Error>,
) -> Option<Result<ClientMessage, ValidationError>> {
    match frame {
        Ok(Message::Text(text)) => Some(ClientMessage::parse(&text)),
        Ok(Message::Binary(data)) => Some(Ok(ClientMessage::Data(Bytes::from(data)))),
        Ok(_) => None,
        Err(e) => {
            debug!("WebSocket read failed: {}", e);
            None
        }
    }
}

/// [`EventSink`] writing to a WebSocket. Terminal output goes out as binary
/// frames, everything else as JSON text frames.
pub struct WebSocketSink<S> {
    inner: S,
}

impl<S> WebSocketSink<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl<S> EventSink for WebSocketSink<S>
where
    S: Sink<Message, Error = io::Error> + Unpin + Send,
{
    async fn send(&mut self, event: ServerEvent) -> io::Result<()> {
        let message = match event {
            ServerEvent::Data(data) => Message::Binary(data.to_vec()),
            other => Message::Text(serde_json::to_string(&other).map_err(io::Error::other)?),
        };
        self.inner.send(message).await
    }

    async fn close(&mut self) {
        if let Err(e) = self.inner.close().await {
            debug!("WebSocket close failed: {}", e);
        }
    }
}
