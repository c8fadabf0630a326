//! Bitcoin payment endpoints

use super::{error_to_status_code, user_message, ApiResponse, ApiState};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::db::DonorMeta;
use crate::service::{CheckResult, GeneratedAddress};

/// Request body for address generation
#[derive(Debug, Deserialize)]
pub struct GenerateAddressRequest {
    /// Donation amount in USD
    pub amount_usd: f64,
    /// Browser session id
    pub session_id: String,
    /// Optional donor display metadata
    #[serde(default)]
    pub metadata: DonorMeta,
}

/// Generate (or re-fetch) a Bitcoin receive address
pub async fn generate_address(
    State(state): State<ApiState>,
    Json(req): Json<GenerateAddressRequest>,
) -> impl IntoResponse {
    info!(
        "API: Address request from session={}, amount={} USD",
        req.session_id, req.amount_usd
    );

    match state
        .app
        .service
        .generate_address(req.amount_usd, &req.session_id, req.metadata)
        .await
    {
        Ok(generated) => (
            StatusCode::OK,
            Json(ApiResponse::<GeneratedAddress>::success(generated)),
        ),
        Err(e) => {
            let status = error_to_status_code(&e);
            (status, Json(ApiResponse::error(user_message(&e))))
        }
    }
}

/// Request body for payment polling and client-side expiry
#[derive(Debug, Deserialize)]
pub struct PaymentRef {
    /// The receive address being watched
    pub address: String,
    /// Browser session id
    pub session_id: String,
}

/// Poll the payment state of a generated address
pub async fn check_payment(
    State(state): State<ApiState>,
    Json(req): Json<PaymentRef>,
) -> impl IntoResponse {
    match state
        .app
        .service
        .check_payment(&req.address, &req.session_id)
        .await
    {
        Ok(result) => (
            StatusCode::OK,
            Json(ApiResponse::<CheckResult>::success(result)),
        ),
        Err(e) => {
            let status = error_to_status_code(&e);
            (status, Json(ApiResponse::error(user_message(&e))))
        }
    }
}

/// Response for client-side expiry
#[derive(Debug, Serialize)]
pub struct ExpireResponse {
    /// Whether the attempt is now expired (also true when it already was)
    pub expired: bool,
}

/// Give up on an untouched payment attempt
pub async fn expire_payment(
    State(state): State<ApiState>,
    Json(req): Json<PaymentRef>,
) -> impl IntoResponse {
    match state
        .app
        .service
        .mark_expired(&req.address, &req.session_id)
        .await
    {
        Ok(()) => (
            StatusCode::OK,
            Json(ApiResponse::success(ExpireResponse { expired: true })),
        ),
        Err(e) => {
            let status = error_to_status_code(&e);
            (status, Json(ApiResponse::error(user_message(&e))))
        }
    }
}

/// Response for the public price endpoint
#[derive(Debug, Serialize)]
pub struct PriceResponse {
    /// USD price of one BTC
    pub price_usd: f64,
}

/// Current BTC/USD price (globally rate limited)
pub async fn get_price(State(state): State<ApiState>) -> impl IntoResponse {
    match state.app.service.price().await {
        Ok(price) => (
            StatusCode::OK,
            Json(ApiResponse::success(PriceResponse { price_usd: price })),
        ),
        Err(e) => {
            let status = error_to_status_code(&e);
            (status, Json(ApiResponse::error(user_message(&e))))
        }
    }
}
