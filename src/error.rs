use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum AdsError {
    #[error("This ad provider is temporarily unavailable")]
    ProviderDisabled,

    #[error("Daily limit reached. Come back tomorrow for more ads!")]
    DailyLimitReached,

    #[error("Please wait {remaining_seconds}s before watching another ad")]
    CooldownActive { remaining_seconds: u64 },

    #[error("Another ad is already in progress")]
    AnotherWatchInProgress { provider: String },

    #[error("Ad provider is loading... Please wait a moment")]
    ProviderNotReady,

    #[error("Ad was not completed. Please watch the full ad (minimum {minimum_seconds} seconds)")]
    IncompleteWatch { minimum_seconds: u64 },

    #[error("Ad provider timed out")]
    ProviderTimedOut,

    #[error("Referrer lookup failed: {0}")]
    ReferrerLookupFailed(String),

    #[error("Persistence failure: {0}")]
    Persistence(#[from] StoreError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl IntoResponse for AdsError {
    fn into_response(self) -> Response {
        let status = match &self {
            AdsError::DailyLimitReached | AdsError::CooldownActive { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            AdsError::AnotherWatchInProgress { .. } => StatusCode::CONFLICT,
            AdsError::ProviderDisabled | AdsError::ProviderNotReady => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AdsError::IncompleteWatch { .. } | AdsError::ProviderTimedOut => {
                StatusCode::BAD_GATEWAY
            }
            AdsError::NotFound(_) => StatusCode::NOT_FOUND,
            AdsError::ReferrerLookupFailed(_)
            | AdsError::Persistence(_)
            | AdsError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let mut body = json!({
            "error": self.to_string(),
        });
        match &self {
            AdsError::CooldownActive { remaining_seconds } => {
                body["remainingSeconds"] = json!(remaining_seconds);
            }
            AdsError::AnotherWatchInProgress { provider } => {
                body["inFlightProvider"] = json!(provider);
            }
            _ => {}
        }

        (status, Json(body)).into_response()
    }
}
