//! Order accept and status endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use common::{CorrelationId, SessionId};
use orders::OrderRequest;
use serde::Serialize;
use workflow::StatusReport;

use crate::AppState;
use crate::error::ApiError;

/// Header identifying the client session that should receive pushes.
pub const SESSION_HEADER: &str = "x-session-id";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedResponse {
    pub correlation_id: CorrelationId,
    pub accepted: bool,
}

fn session_from(headers: &HeaderMap) -> Result<SessionId, ApiError> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(SessionId::new)
        .ok_or_else(|| ApiError::BadRequest(format!("missing {SESSION_HEADER} header")))
}

/// POST /orders — accept an order; the final order id arrives over the push
/// channel.
#[tracing::instrument(skip_all)]
pub async fn accept(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<OrderRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let session = session_from(&headers)?;
    let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;

    let correlation_id = state.accept.accept(request, &session).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            correlation_id,
            accepted: true,
        }),
    ))
}

/// GET /orders/status/{correlation_id} — last known status of a workflow.
#[tracing::instrument(skip(state))]
pub async fn status(
    State(state): State<Arc<AppState>>,
    Path(correlation_id): Path<String>,
) -> Result<Json<StatusReport>, ApiError> {
    let correlation_id = CorrelationId::parse(&correlation_id)
        .map_err(|e| ApiError::BadRequest(format!("Invalid correlation id: {e}")))?;
    Ok(Json(state.status.status(correlation_id).await?))
}
