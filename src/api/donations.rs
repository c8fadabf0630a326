//! Public donation listing

use super::{ApiResponse, ApiState};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::Serialize;

use crate::db::DonationQueries;

/// Browser-facing donation entry. Payment references, methods, and
/// timestamps are intentionally absent from this shape.
#[derive(Debug, Serialize)]
pub struct DonationEntry {
    /// Opaque donation id
    pub id: String,
    /// Name shown on the donation wall
    pub display_name: String,
    /// Donated amount in USD
    pub amount: f64,
}

/// List recent donations
pub async fn list_donations(State(state): State<ApiState>) -> impl IntoResponse {
    let queries = DonationQueries::new(&state.app.db);
    match queries.list_recent(100).await {
        Ok(donations) => {
            let entries: Vec<DonationEntry> = donations
                .into_iter()
                .map(|d| DonationEntry {
                    id: d.id,
                    display_name: d.display_name,
                    amount: d.amount_usd,
                })
                .collect();
            (StatusCode::OK, Json(ApiResponse::success(entries)))
        }
        Err(e) => {
            tracing::error!("Failed to list donations: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error("Unable to load donations")),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_shape_does_not_leak_payment_details() {
        let entry = DonationEntry {
            id: "d1".to_string(),
            display_name: "Anonymous".to_string(),
            amount: 100.0,
        };
        let json = serde_json::to_value(&entry).unwrap();
        let keys: Vec<&str> = json.as_object().unwrap().keys().map(|k| k.as_str()).collect();
        assert_eq!(keys.len(), 3);
        assert!(json.get("payment_id").is_none());
        assert!(json.get("payment_method").is_none());
        assert!(json.get("created_at").is_none());
    }
}
