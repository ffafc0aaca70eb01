//! REST API handlers

use atorch_core::AccessoryId;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::state::AppState;

/// API error response
#[derive(Serialize)]
struct ApiError {
    error: String,
}

impl ApiError {
    fn new(msg: impl Into<String>) -> Self {
        Self { error: msg.into() }
    }
}

/// List all known accessories
pub async fn list_accessories(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.accessories().await)
}

/// Get a specific accessory by ID
pub async fn get_accessory(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let Some(id) = AccessoryId::parse(&id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiError::new("Invalid accessory id")),
        )
            .into_response();
    };

    match state.get_accessory(&id).await {
        Some(accessory) => Json(accessory).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiError::new("Accessory not found")),
        )
            .into_response(),
    }
}

/// Get current configuration
pub async fn get_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.config.clone())
}
