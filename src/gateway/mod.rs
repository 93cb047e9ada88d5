//! Browser terminal to SSH gateway.
//!
//! This module is organized into the following submodules:
//!
//! - `protocol`: Wire messages exchanged with the browser
//! - `config`: Configuration resolution with environment variable support
//! - `error`: Error types and failure classification
//! - `env_filter`: Sanitizing of client-supplied environment variables
//! - `auth`: SSH authentication strategies
//! - `handler`: russh client handler
//! - `connection`: SSH connection adapter
//! - `bridge`: Per-connection session state machine
//! - `shutdown`: Live session tracking and graceful drain
//! - `socket`: HTTP and WebSocket endpoints

pub mod auth;
pub mod bridge;
pub mod config;
pub mod connection;
pub mod env_filter;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod shutdown;
pub mod socket;

pub use bridge::{EventSink, GatewayState, SessionGateway};
pub use config::GatewayConfig;
pub use connection::{SshAdapter, SshConnection};
pub use shutdown::{ShutdownCoordinator, ShutdownGuard, spawn_signal_listener};
pub use socket::GatewayContext;
