// Polling transport
//
// Submit returns a query id straight away; retrieve returns whatever rows have been
// collected so far, with a status header telling the caller whether to poll again.

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderName},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::api::auth::Authenticated;
use crate::api::handlers::AppState;
use crate::api::middleware::{PollingRejection, RelayError};
use crate::models::{QueryRequest, SubmitResponse, QUERY_STATUS_HEADER};
use crate::services::result_streamer::{encode_rows, RowFormat};

#[derive(Debug, Default, Deserialize)]
pub struct RetrieveParams {
    #[serde(default)]
    pub status_only: bool,
}

/// Submit a query for background execution
pub async fn submit(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Json(request): Json<QueryRequest>,
) -> Result<Json<SubmitResponse>, PollingRejection> {
    let id = state.relay.submit(&identity, &request)?;
    Ok(Json(SubmitResponse { id: id.to_string() }))
}

/// Rows of a submitted query, or its status with `?status_only=true`
pub async fn retrieve(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Path(id): Path<String>,
    Query(params): Query<RetrieveParams>,
) -> Result<Response, PollingRejection> {
    let query_id = Uuid::parse_str(&id)
        .map_err(|_| RelayError::NotFound(format!("No query exists with id {}", id)))?;
    let snapshot = state.relay.retrieve(&identity, &query_id)?;

    if params.status_only {
        return Ok(Json(snapshot.status).into_response());
    }

    let body = encode_rows(&snapshot.rows, RowFormat::Polling);
    let headers = [
        (header::CONTENT_TYPE, "application/x-ndjson"),
        (HeaderName::from_static(QUERY_STATUS_HEADER), snapshot.status.label()),
    ];
    Ok((headers, body).into_response())
}
