//! Search and list handlers

use axum::{extract::State, Json};
use icemail_core::{FieldsResponse, SearchRequest, SearchResponse};
use serde::Deserialize;

use crate::error::ApiResult;
use crate::state::AppState;

/// Body of a list request; every field is optional
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListRequest {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Full-text search over archived messages
pub async fn search_messages(
    State(state): State<AppState>,
    Json(request): Json<SearchRequest>,
) -> ApiResult<Json<SearchResponse>> {
    Ok(Json(state.queries.search(&request).await?))
}

/// List archived messages, most recent first
pub async fn list_messages(
    State(state): State<AppState>,
    request: Option<Json<ListRequest>>,
) -> ApiResult<Json<SearchResponse>> {
    let request = request.map(|Json(body)| body).unwrap_or_default();
    Ok(Json(state.queries.list(request.limit, request.offset).await?))
}

/// Field names accepted in `locations`
pub async fn list_fields(State(state): State<AppState>) -> ApiResult<Json<FieldsResponse>> {
    Ok(Json(state.queries.fields().await?))
}
