//! HTTP API for the donation core
//!
//! This module provides a RESTful API for:
//! - Generating Bitcoin receive addresses
//! - Polling payment status
//! - Client-signalled expiry of payment attempts
//! - The public donation listing and BTC price

use crate::{DonationApp, PaymentError};
use anyhow::Context;
use axum::{
    http::StatusCode,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

mod donations;
mod health;
mod payments;

pub use donations::*;
pub use health::*;
pub use payments::*;

/// API state shared across handlers
#[derive(Clone)]
pub struct ApiState {
    /// The donation application
    pub app: DonationApp,
}

/// Wire up the routes, state, and (optionally) permissive CORS
fn build_router(app: DonationApp, enable_cors: bool) -> Router {
    let router = Router::new()
        .route("/health", get(health_check))
        .route("/v1/bitcoin/address", post(generate_address))
        .route("/v1/bitcoin/check", post(check_payment))
        .route("/v1/bitcoin/expire", post(expire_payment))
        .route("/v1/bitcoin/price", get(get_price))
        .route("/v1/donations", get(list_donations))
        .with_state(ApiState { app });

    if enable_cors {
        router.layer(CorsLayer::permissive())
    } else {
        router
    }
}

/// Serve the API with no external shutdown signal; runs until the
/// process is killed
pub async fn serve(app: DonationApp) -> anyhow::Result<()> {
    let (_shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    serve_with_shutdown(app, shutdown_rx).await
}

/// Serve the API, draining open connections once `shutdown_rx` fires
pub async fn serve_with_shutdown(
    app: DonationApp,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let config = app.config.clone();
    let router = build_router(app, config.api.enable_cors);

    let addr: std::net::SocketAddr = config
        .api
        .bind_address
        .parse()
        .with_context(|| format!("invalid api.bind_address: {}", config.api.bind_address))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Donation API listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            match shutdown_rx.await {
                Ok(()) => info!("Shutdown requested; draining API connections"),
                // Sender dropped without signalling; keep serving
                Err(_) => std::future::pending().await,
            }
        })
        .await?;

    info!("Donation API stopped");
    Ok(())
}

/// Envelope for every API reply
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// Whether the call succeeded
    pub success: bool,
    /// Payload, on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Browser-safe error text, on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    /// Wrap a successful payload
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    /// Wrap an error message
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Convert PaymentError to HTTP status code
pub fn error_to_status_code(err: &PaymentError) -> StatusCode {
    match err {
        PaymentError::Validation(_) => StatusCode::BAD_REQUEST,
        PaymentError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        PaymentError::NotOwned => StatusCode::FORBIDDEN,
        PaymentError::Expired => StatusCode::GONE,
        PaymentError::Underpayment => StatusCode::PAYMENT_REQUIRED,
        PaymentError::OracleUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        PaymentError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        PaymentError::Wallet(_) => StatusCode::INTERNAL_SERVER_ERROR,
        PaymentError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Browser-safe error message. Internal failures collapse to a generic
/// line; the specifics stay in the logs.
pub fn user_message(err: &PaymentError) -> String {
    match err {
        PaymentError::Validation(_)
        | PaymentError::RateLimited(_)
        | PaymentError::NotOwned
        | PaymentError::Expired
        | PaymentError::Underpayment
        | PaymentError::OracleUnavailable => err.to_string(),
        PaymentError::Config(_) | PaymentError::Wallet(_) | PaymentError::Database(_) => {
            error!("Internal payment error: {}", err);
            "Unable to create Bitcoin payment address. Please try again or choose another method."
                .to_string()
        }
    }
}
