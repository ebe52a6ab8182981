// Streaming transport
//
// GetInfo resolves a query descriptor into tickets, DoGet streams the rows of one ticket
// as newline delimited JSON. Failures are reported as RPC status documents.

use axum::{
    body::Body,
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    Json,
};

use crate::api::auth::Authenticated;
use crate::api::handlers::AppState;
use crate::api::middleware::RpcStatus;
use crate::models::{FlightInfo, QueryRequest, TicketRequest};
use crate::services::result_streamer::{ndjson_body, RowFormat};

/// Resolve a query into endpoints
///
/// # Request Body
///
/// ```json
/// {
///   "sql": "select {tax} from {src}",
///   "substitution_blocks": {
///     "info_substitutions": {"tax": {"entity_name": "lineitem", "info_name": "tax"}},
///     "source_substitutions": {"src": {"AllSourcesWith": ["lineitem"]}},
///     "num_capture_braces": 1
///   }
/// }
/// ```
pub async fn get_info(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Json(request): Json<QueryRequest>,
) -> Result<Json<FlightInfo>, RpcStatus> {
    let info = state.relay.get_info(&identity, &request)?;
    tracing::info!("Answered GetInfo from {} with {} endpoints", identity.name, info.endpoints.len());
    Ok(Json(info))
}

/// Stream the rows behind a ticket
pub async fn do_get(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    Json(request): Json<TicketRequest>,
) -> Result<Response, RpcStatus> {
    let rows = state.relay.do_get(&identity, &request.ticket).await?;
    let body = Body::from_stream(ndjson_body(rows, RowFormat::Streaming));
    Ok(([(header::CONTENT_TYPE, "application/x-ndjson")], body).into_response())
}
