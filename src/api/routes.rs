use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::api::handlers::{flight, query, AppState};
use crate::api::middleware::RelayError;
use crate::config::Config;
use crate::services::dispatcher::{DispatchSettings, Dispatcher};
use crate::services::peer_client::HttpPeerClient;
use crate::services::registry::SourceRegistry;
use crate::services::relay::RelayService;
use crate::services::topology::RelayGraph;

/// Build the relay behind the API from configuration
pub async fn build_state(config: &Config) -> Result<AppState, RelayError> {
    let registry = Arc::new(SourceRegistry::from_config(config)?);
    let topology = Arc::new(RelayGraph::from_config(config));
    let peers = Arc::new(HttpPeerClient::from_config(config)?);

    tracing::info!(
        "Relay {} knows {} local sources and {} peers",
        config.relay.id,
        registry.local_sources().count(),
        registry.peers().count()
    );

    let dispatcher = Dispatcher::new(
        registry,
        topology,
        peers,
        DispatchSettings::from_config(config),
    )
    .await?;

    Ok(AppState {
        relay: Arc::new(RelayService::new(Arc::new(dispatcher), config)),
        identity_header: config.relay.identity_header.clone(),
    })
}

/// Create router with application state
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/flight/info", post(flight::get_info))
        .route("/flight/get", post(flight::do_get))
        .route("/query", post(query::submit))
        .route("/query/{id}", get(query::retrieve))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}
