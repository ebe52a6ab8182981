use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Relay error types
#[derive(Debug, Error)]
pub enum RelayError {
    /// The request is structurally invalid and was rejected before dispatch.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Placeholder and substitution entries do not line up.
    #[error("template error: {0}")]
    Template(String),

    #[error("no matching values were found for query")]
    EmptyResolution,

    /// A single endpoint failed. Recovered by the dispatcher, never fatal on its own.
    #[error("endpoint {endpoint} failed: {message}")]
    Endpoint { endpoint: String, message: String },

    #[error("all {0} endpoints failed")]
    AllEndpointsFailed(usize),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("execution engine error: {0}")]
    Engine(String),

    #[error("Issue related to a remote relay: {0}")]
    Remote(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Stable machine readable code for the error kind
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::InvalidQuery(_) => "INVALID_QUERY",
            RelayError::Template(_) => "TEMPLATE_ERROR",
            RelayError::EmptyResolution => "EMPTY_RESOLUTION",
            RelayError::Endpoint { .. } => "ENDPOINT_ERROR",
            RelayError::AllEndpointsFailed(_) => "ALL_ENDPOINTS_FAILED",
            RelayError::Unauthenticated(_) => "UNAUTHENTICATED",
            RelayError::Forbidden(_) => "FORBIDDEN",
            RelayError::NotFound(_) => "NOT_FOUND",
            RelayError::Engine(_) => "ENGINE_ERROR",
            RelayError::Remote(_) => "REMOTE_ERROR",
            RelayError::Config(_) => "CONFIG_ERROR",
            RelayError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Errors raised while checking the request itself, before anything is dispatched
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            RelayError::InvalidQuery(_) | RelayError::Template(_) | RelayError::EmptyResolution
        )
    }

    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::InvalidQuery(_)
            | RelayError::Template(_)
            | RelayError::EmptyResolution
            | RelayError::NotFound(_) => StatusCode::BAD_REQUEST,
            RelayError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            RelayError::Forbidden(_) => StatusCode::FORBIDDEN,
            RelayError::Endpoint { .. } | RelayError::AllEndpointsFailed(_) | RelayError::Remote(_) => {
                StatusCode::BAD_GATEWAY
            }
            RelayError::Engine(_) | RelayError::Config(_) | RelayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorDetail {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut detail = ErrorDetail::new(self.code(), self.to_string());
        if let RelayError::Endpoint { endpoint, .. } = &self {
            detail = detail.with_details(format!("endpoint: {}", endpoint));
        }

        (status, Json(ErrorResponse { error: detail })).into_response()
    }
}

/// Rejection rendered for the submit/poll transport.
///
/// Body is plain text prefixed with `Relay server error: ` so clients can surface it verbatim.
#[derive(Debug)]
pub struct PollingRejection(pub RelayError);

impl From<RelayError> for PollingRejection {
    fn from(err: RelayError) -> Self {
        PollingRejection(err)
    }
}

impl IntoResponse for PollingRejection {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RelayError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            RelayError::Forbidden(_) => StatusCode::FORBIDDEN,
            RelayError::Internal(_) | RelayError::Engine(_) | RelayError::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::BAD_REQUEST,
        };
        (status, format!("Relay server error: {}", self.0)).into_response()
    }
}

/// RPC-style status for the descriptor/ticket transport
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct RpcStatus {
    pub code: String,
    pub message: String,
}

impl RpcStatus {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self {
            code: "INVALID_ARGUMENT".to_string(),
            message: message.into(),
        }
    }

    fn status_code(&self) -> StatusCode {
        match self.code.as_str() {
            "INVALID_ARGUMENT" => StatusCode::BAD_REQUEST,
            "NOT_FOUND" => StatusCode::NOT_FOUND,
            "UNAUTHENTICATED" => StatusCode::UNAUTHORIZED,
            "PERMISSION_DENIED" => StatusCode::FORBIDDEN,
            "UNAVAILABLE" => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<RelayError> for RpcStatus {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::InvalidQuery(_) | RelayError::Template(_) => {
                RpcStatus::invalid_argument(format!("Query validation failed with error {}", err))
            }
            RelayError::EmptyResolution => RpcStatus::invalid_argument(err.to_string()),
            RelayError::NotFound(msg) => RpcStatus {
                code: "NOT_FOUND".to_string(),
                message: msg,
            },
            RelayError::Unauthenticated(_) => RpcStatus {
                code: "UNAUTHENTICATED".to_string(),
                message: err.to_string(),
            },
            RelayError::Forbidden(_) => RpcStatus {
                code: "PERMISSION_DENIED".to_string(),
                message: err.to_string(),
            },
            RelayError::Endpoint { .. } | RelayError::AllEndpointsFailed(_) | RelayError::Remote(_) => {
                RpcStatus {
                    code: "UNAVAILABLE".to_string(),
                    message: err.to_string(),
                }
            }
            other => RpcStatus {
                code: "INTERNAL".to_string(),
                message: other.to_string(),
            },
        }
    }
}

impl IntoResponse for RpcStatus {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self)).into_response()
    }
}

/// Convert anyhow::Error to RelayError
impl From<anyhow::Error> for RelayError {
    fn from(err: anyhow::Error) -> Self {
        RelayError::Internal(err.to_string())
    }
}

impl From<datafusion::error::DataFusionError> for RelayError {
    fn from(err: datafusion::error::DataFusionError) -> Self {
        RelayError::Engine(err.to_string())
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        RelayError::Remote(err.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Internal(format!("JSON error: {}", err))
    }
}
