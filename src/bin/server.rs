//! labsync relay server
//!
//! Groups WebSocket connections into rooms and forwards state pushes and
//! acknowledgements between the experiment and web roles of each room.
//!
//! # Configuration
//!
//! Environment variables:
//! - `LABSYNC_PORT`: Port to listen on (default: 3000)
//! - `LABSYNC_BIND`: Address to bind (default: 0.0.0.0)
//!
//! # Endpoints
//!
//! - `GET /health`: Health check
//! - `GET /rooms`: Room membership counts
//! - `GET /ws`: WebSocket relay

use labsync::server::{app, RoomRegistry};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Server configuration
#[derive(Debug, Clone)]
struct Config {
    /// Port to listen on
    port: u16,
    /// Address to bind
    bind: IpAddr,
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Self {
        let port = std::env::var("LABSYNC_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(3000);

        let bind = std::env::var("LABSYNC_BIND")
            .ok()
            .and_then(|b| b.parse().ok())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

        Self { port, bind }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutting down");
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "labsync_server=info,labsync=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env();

    // The registry lives exactly as long as the server.
    let rooms = Arc::new(RoomRegistry::new());
    let app = app(rooms);

    let addr = SocketAddr::new(config.bind, config.port);
    tracing::info!("Starting relay on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}
