use axum::{
    extract::{Path, State},
    response::{IntoResponse, Json},
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

use crate::config::Config;
use crate::engine::{AdsEngine, AdsStatus, WatchReceipt};
use crate::error::AdsError;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub engine: Arc<AdsEngine>,
}

pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "ad-rewards-service",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchAdRequest {
    pub account_id: String,
    pub provider: String,
}

pub async fn watch_ad(
    State(state): State<AppState>,
    Json(payload): Json<WatchAdRequest>,
) -> Result<Json<WatchReceipt>, AdsError> {
    info!(
        "Watch request from {} for provider {}",
        payload.account_id, payload.provider
    );
    let receipt = state
        .engine
        .watch_ad(&payload.account_id, &payload.provider)
        .await?;
    Ok(Json(receipt))
}

pub async fn ad_status(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Result<Json<AdsStatus>, AdsError> {
    let status = state.engine.ad_status(&account_id).await?;
    Ok(Json(status))
}
