pub mod flight;
pub mod query;

use std::sync::Arc;

use crate::services::relay::RelayService;

/// Application state
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<RelayService>,
    /// Header the TLS terminator puts the client certificate fingerprint in
    pub identity_header: String,
}
