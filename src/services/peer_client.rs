// Peer relay client
//
// The dispatcher reaches peer relays only through this trait, so the fan-out can be
// exercised in-process without a network.

use async_trait::async_trait;
use reqwest::Client;

use crate::api::middleware::RelayError;
use crate::client::{build_http_client, RelayClient};
use crate::config::Config;
use crate::models::{FlightInfo, PeerRelay, QueryRequest};
use crate::services::result_streamer::RowStream;

#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Forward a query to a peer and collect the endpoints it answers with
    async fn get_info(&self, peer: &PeerRelay, request: &QueryRequest) -> Result<FlightInfo, RelayError>;

    /// Redeem a ticket issued by a peer
    async fn do_get(&self, location: &str, ticket: &str) -> Result<RowStream, RelayError>;
}

/// Peer client over HTTP, identifying as this relay
pub struct HttpPeerClient {
    http: Client,
    identity_header: String,
    fingerprint: String,
}

impl HttpPeerClient {
    pub fn new(http: Client, identity_header: &str, fingerprint: &str) -> Self {
        Self {
            http,
            identity_header: identity_header.to_string(),
            fingerprint: fingerprint.to_string(),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, RelayError> {
        let http = build_http_client(config.tls.as_ref())?;
        Ok(Self::new(
            http,
            &config.relay.identity_header,
            &config.relay.fingerprint,
        ))
    }

    fn client(&self, base_url: &str) -> RelayClient {
        RelayClient::new(
            self.http.clone(),
            base_url,
            self.identity_header.clone(),
            self.fingerprint.clone(),
        )
    }
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn get_info(&self, peer: &PeerRelay, request: &QueryRequest) -> Result<FlightInfo, RelayError> {
        tracing::debug!("Forwarding request to peer {} at {}", peer.id, peer.endpoint);
        self.client(&peer.endpoint).get_info(request).await
    }

    async fn do_get(&self, location: &str, ticket: &str) -> Result<RowStream, RelayError> {
        self.client(location).do_get(location, ticket).await
    }
}
