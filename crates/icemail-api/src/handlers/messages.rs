//! Single message handlers

use axum::{
    extract::{Path, State},
    Json,
};
use icemail_common::types::MessageId;
use icemail_common::Error;
use icemail_core::SearchResponse;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiResult;
use crate::state::AppState;

/// Result of a delivery activation
#[derive(Debug, Serialize, Deserialize)]
pub struct DeliverResponse {
    pub success: bool,
}

fn parse_id(id: &str) -> Result<MessageId, Error> {
    Uuid::parse_str(id).map_err(|_| Error::Validation(format!("Invalid message id: {}", id)))
}

/// Get a single message with its body
pub async fn get_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SearchResponse>> {
    let id = parse_id(&id)?;
    Ok(Json(state.queries.get(id).await?))
}

/// Forward a held message to its envelope recipients
pub async fn deliver_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<DeliverResponse>> {
    let id = parse_id(&id)?;
    state.activator.activate(id).await?;
    Ok(Json(DeliverResponse { success: true }))
}
