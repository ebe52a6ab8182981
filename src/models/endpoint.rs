use serde::{Deserialize, Serialize};

/// One dispatch unit on the descriptor/ticket transport
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Endpoint {
    /// Opaque ticket, redeemable at any of `locations`
    pub ticket: String,
    pub locations: Vec<String>,
}

/// Answer to a GetInfo call: every endpoint the caller should pull
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlightInfo {
    pub endpoints: Vec<Endpoint>,
}

impl FlightInfo {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    pub fn extend(&mut self, other: FlightInfo) {
        self.endpoints.extend(other.endpoints);
    }
}

/// Body of a DoGet call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TicketRequest {
    pub ticket: String,
}
