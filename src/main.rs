use std::io::IsTerminal;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{error, info};

use query_relay::api;
use query_relay::config::Config;

/// How often expired tickets and polling jobs are swept
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize logging
    let ansi = match config.logging.style.as_str() {
        "always" => true,
        "never" => false,
        _ => std::io::stdout().is_terminal(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level)),
        )
        .with_ansi(ansi)
        .init();

    info!("Starting relay {} on {}", config.relay.id, config.server_address());

    let state = api::routes::build_state(&config).await.map_err(|e| {
        error!("Failed to initialize relay: {}", e);
        e
    })?;

    let relay = state.relay.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            interval.tick().await;
            relay.purge_expired();
        }
    });

    // Create router with state
    let app = api::routes::create_router(state);

    // Start server
    let addr: SocketAddr = config.server_address().parse()?;
    info!("Relay listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
