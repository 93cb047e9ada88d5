//! Process-wide shutdown coordination.
//!
//! The coordinator counts live sessions and drives a graceful drain:
//!
//! | Event | No live sessions | Live sessions |
//! |-------|------------------|---------------|
//! | First SIGTERM/SIGINT | exit now | enter shutdown mode, start countdown |
//! | Second signal | - | force exit |
//! | Countdown reaches 0 | - | exit |
//! | Last session leaves while draining | exit | - |
//!
//! While in shutdown mode the [`ShutdownGuard`] middleware answers every new
//! request with `503 Service Unavailable`, and each session relays the
//! remaining seconds to its browser as `shutdownCountdownUpdate` events.
//!
//! The live count and the mode flag are atomics; the session registry is a
//! `DashMap`. Nothing here takes a lock across an await point.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use poem::http::StatusCode;
use poem::{Endpoint, IntoResponse, Middleware, Request, Response};
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Countdown values buffered per subscriber.
const COUNTDOWN_CHANNEL_CAPACITY: usize = 16;

/// Why the process is exiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Signal received with no live sessions.
    Idle,
    /// The last session left during the countdown.
    Drained,
    /// The countdown reached zero.
    GraceElapsed,
    /// A second signal arrived.
    Forced,
}

/// Result of handling one termination signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    ExitNow,
    Draining,
    ForceExit,
}

/// Registry entry for one live session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub peer: String,
    pub target: Option<String>,
    pub connected_at: DateTime<Utc>,
}

pub struct ShutdownCoordinator {
    grace: Duration,
    live: AtomicUsize,
    shutdown_mode: AtomicBool,
    sessions: DashMap<Uuid, SessionInfo>,
    countdown_tx: broadcast::Sender<u64>,
    left: Notify,
    exit: CancellationToken,
    exit_reason: OnceCell<ExitReason>,
}

impl ShutdownCoordinator {
    pub fn new(grace: Duration) -> Arc<Self> {
        let (countdown_tx, _) = broadcast::channel(COUNTDOWN_CHANNEL_CAPACITY);
        Arc::new(Self {
            grace,
            live: AtomicUsize::new(0),
            shutdown_mode: AtomicBool::new(false),
            sessions: DashMap::new(),
            countdown_tx,
            left: Notify::new(),
            exit: CancellationToken::new(),
            exit_reason: OnceCell::new(),
        })
    }

    /// Register a new session. The returned guard deregisters it on drop.
    pub fn register(self: &Arc<Self>, peer: impl Into<String>) -> SessionGuard {
        let id = Uuid::new_v4();
        self.sessions.insert(
            id,
            SessionInfo {
                peer: peer.into(),
                target: None,
                connected_at: Utc::now(),
            },
        );
        self.live.fetch_add(1, Ordering::SeqCst);

        SessionGuard {
            id,
            coordinator: Arc::clone(self),
        }
    }

    fn deregister(&self, id: &Uuid) {
        self.sessions.remove(id);
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.left.notify_one();
    }

    /// Record the SSH target of a session once it is known.
    pub fn update_target(&self, id: &Uuid, target: String) {
        if let Some(mut entry) = self.sessions.get_mut(id) {
            entry.target = Some(target);
        }
    }

    pub fn live_sessions(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_mode.load(Ordering::SeqCst)
    }

    /// Snapshot of the live sessions.
    pub fn sessions(&self) -> Vec<(Uuid, SessionInfo)> {
        self.sessions
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Receive countdown values (remaining seconds).
    pub fn subscribe(&self) -> broadcast::Receiver<u64> {
        self.countdown_tx.subscribe()
    }

    /// Apply one termination signal.
    ///
    /// The caller runs [`run_countdown`](Self::run_countdown) when the outcome
    /// is [`SignalOutcome::Draining`].
    pub fn handle_signal(&self) -> SignalOutcome {
        if self
            .shutdown_mode
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Second termination signal, forcing exit");
            self.finish(ExitReason::Forced);
            return SignalOutcome::ForceExit;
        }

        let live = self.live_sessions();
        if live == 0 {
            info!("No live sessions, exiting");
            self.finish(ExitReason::Idle);
            return SignalOutcome::ExitNow;
        }

        info!(
            "Entering shutdown mode with {} live session(s), grace {}s",
            live,
            self.grace.as_secs()
        );
        for (id, session) in self.sessions() {
            info!(
                "Draining session {} from {} to {} (since {})",
                id,
                session.peer,
                session.target.as_deref().unwrap_or("-"),
                session.connected_at.to_rfc3339()
            );
        }
        SignalOutcome::Draining
    }

    /// Broadcast the remaining seconds once per second until the grace period
    /// ends or every session has left.
    pub async fn run_countdown(&self) {
        let mut remaining = self.grace.as_secs();

        if self.live_sessions() == 0 {
            self.finish(ExitReason::Drained);
            return;
        }
        if remaining == 0 {
            self.finish(ExitReason::GraceElapsed);
            return;
        }

        let _ = self.countdown_tx.send(remaining);

        let period = Duration::from_secs(1);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    remaining -= 1;
                    if remaining == 0 {
                        self.finish(ExitReason::GraceElapsed);
                        return;
                    }
                    let _ = self.countdown_tx.send(remaining);
                }
                _ = self.left.notified() => {
                    if self.live_sessions() == 0 {
                        self.finish(ExitReason::Drained);
                        return;
                    }
                }
                _ = self.exit.cancelled() => return,
            }
        }
    }

    fn finish(&self, reason: ExitReason) {
        if self.exit_reason.set(reason).is_ok() {
            info!("Shutting down: {:?}", reason);
        }
        self.exit.cancel();
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.exit_reason.get().copied()
    }

    /// Completes once the process should exit.
    pub fn exited(&self) -> WaitForCancellationFutureOwned {
        self.exit.clone().cancelled_owned()
    }
}

/// Deregisters its session from the coordinator when dropped.
pub struct SessionGuard {
    id: Uuid,
    coordinator: Arc<ShutdownCoordinator>,
}

impl SessionGuard {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.coordinator
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.coordinator.deregister(&self.id);
    }
}

/// Listen for SIGTERM and SIGINT and feed them to the coordinator.
pub fn spawn_signal_listener(coordinator: Arc<ShutdownCoordinator>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if !wait_for_signal().await {
                return;
            }

            match coordinator.handle_signal() {
                SignalOutcome::Draining => {
                    let draining = Arc::clone(&coordinator);
                    tokio::spawn(async move { draining.run_countdown().await });
                }
                SignalOutcome::ExitNow | SignalOutcome::ForceExit => return,
            }
        }
    })
}

/// Wait for the next termination signal. Returns false if none can be received.
#[cfg(unix)]
async fn wait_for_signal() -> bool {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            return false;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("SIGTERM received"),
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for SIGINT: {}", e);
                return false;
            }
            info!("SIGINT received");
        }
    }
    true
}

#[cfg(not(unix))]
async fn wait_for_signal() -> bool {
    match tokio::signal::ctrl_c().await {
        Ok(()) => true,
        Err(e) => {
            error!("Failed to listen for Ctrl-C: {}", e);
            false
        }
    }
}

/// Middleware refusing new requests while the coordinator is draining.
pub struct ShutdownGuard {
    coordinator: Arc<ShutdownCoordinator>,
}

impl ShutdownGuard {
    pub fn new(coordinator: Arc<ShutdownCoordinator>) -> Self {
        Self { coordinator }
    }
}

impl<E: Endpoint> Middleware<E> for ShutdownGuard {
    type Output = ShutdownGuardEndpoint<E>;

    fn transform(&self, ep: E) -> Self::Output {
        ShutdownGuardEndpoint {
            inner: ep,
            coordinator: Arc::clone(&self.coordinator),
        }
    }
}

pub struct ShutdownGuardEndpoint<E> {
    inner: E,
    coordinator: Arc<ShutdownCoordinator>,
}

impl<E: Endpoint> Endpoint for ShutdownGuardEndpoint<E> {
    type Output = Response;

    async fn call(&self, req: Request) -> poem::Result<Self::Output> {
        if self.coordinator.is_shutting_down() {
            return Ok(Response::builder()
                .status(StatusCode::SERVICE_UNAVAILABLE)
                .body("Server is shutting down"));
        }

        self.inner.call(req).await.map(IntoResponse::into_response)
    }
}
