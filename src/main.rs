#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use dotenv::dotenv;
use poem::{Server, listener::TcpListener};
use tracing::info;

use webssh_gateway::gateway::socket::routes;
use webssh_gateway::gateway::{
    GatewayConfig, GatewayContext, ShutdownCoordinator, spawn_signal_listener,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Initialize logging with proper tracing default
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let config = Arc::new(GatewayConfig::from_env()?);
    let coordinator = ShutdownCoordinator::new(config.shutdown_grace);
    spawn_signal_listener(Arc::clone(&coordinator));

    let listen = config.listen;
    info!("Starting WebSSH gateway on {}", listen);
    match &config.ssh.default_host {
        Some(host) => info!("Default SSH target {}:{}", host, config.ssh.default_port),
        None => info!("No default SSH target, clients must supply a host"),
    }
    if !config.ssh.allowed_subnets.is_empty() {
        info!("Restricting SSH targets to {:?}", config.ssh.allowed_subnets);
    }

    let ctx = GatewayContext {
        config,
        coordinator: Arc::clone(&coordinator),
    };

    let app = routes(ctx);

    Server::new(TcpListener::bind(listen))
        .name("WebSSH Gateway")
        .run_with_graceful_shutdown(app, coordinator.exited(), Some(Duration::from_secs(1)))
        .await?;

    info!("Exited: {:?}", coordinator.exit_reason());
    Ok(())
}
