//! Database models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a pending payment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    /// Address handed out, no transaction seen yet
    Initialized,
    /// A transaction was observed but is not final
    Pending,
    /// Confirmed and the donation record exists (terminal)
    Confirmed,
    /// Window closed or underpaid (terminal)
    Expired,
}

impl PaymentStatus {
    /// Stored text representation
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Initialized => "initialized",
            PaymentStatus::Pending => "pending",
            PaymentStatus::Confirmed => "confirmed",
            PaymentStatus::Expired => "expired",
        }
    }

    /// Parse the stored text representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initialized" => Some(PaymentStatus::Initialized),
            "pending" => Some(PaymentStatus::Pending),
            "confirmed" => Some(PaymentStatus::Confirmed),
            "expired" => Some(PaymentStatus::Expired),
            _ => None,
        }
    }

    /// Terminal statuses never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentStatus::Confirmed | PaymentStatus::Expired)
    }
}

/// Optional donor-supplied display metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DonorMeta {
    /// Name to show on the donation wall
    pub player_name: Option<String>,
    /// Whether the donor opted into showing the name
    #[serde(default)]
    pub use_player_name: bool,
    /// Free-form message
    pub message: Option<String>,
}

/// In-flight Bitcoin payment attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingPaymentModel {
    /// Receive address; unique per attempt
    pub address: String,
    /// Owning browser session
    pub session_id: String,
    /// BTC amount quoted at generation time
    pub expected_amount_btc: f64,
    /// USD amount requested by the donor
    pub expected_amount_usd: f64,
    /// USD/BTC rate locked at generation time
    pub exchange_rate: f64,
    /// BIP84 derivation index of the address
    pub derivation_index: i64,
    /// Donor display name (optional)
    pub player_name: Option<String>,
    /// Whether the donor opted into showing the name
    pub use_player_name: bool,
    /// Donor message (optional)
    pub message: Option<String>,
    /// Lifecycle status
    pub status: PaymentStatus,
    /// Transaction id, set when a payment is first seen
    pub txid: Option<String>,
    /// When the payment was first seen
    pub detected_at: Option<DateTime<Utc>>,
    /// Id of the scheduled monitor job watching this address
    pub scheduled_job_id: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// End of the payment window (creation + 24 h)
    pub expires_at: DateTime<Utc>,
}

impl PendingPaymentModel {
    /// Whether the payment window has closed
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Name to put on the donation record
    pub fn display_name(&self) -> String {
        match (&self.player_name, self.use_player_name) {
            (Some(name), true) if !name.trim().is_empty() => name.clone(),
            _ => "Anonymous".to_string(),
        }
    }
}

/// Payment method of a ledger donation
pub mod payment_method {
    /// Hosted Stripe checkout
    pub const STRIPE: &str = "stripe";
    /// Hosted PayPal checkout
    pub const PAYPAL: &str = "paypal";
    /// On-chain Bitcoin payment
    pub const BITCOIN: &str = "bitcoin";
}

/// Terminal donation ledger record. Created once, never updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DonationModel {
    /// Opaque donation id
    pub id: String,
    /// Donated amount in USD
    pub amount_usd: f64,
    /// Name shown on the donation wall
    pub display_name: String,
    /// Unique payment reference; the receive address for Bitcoin
    pub payment_id: String,
    /// Payment method (stripe, paypal, bitcoin)
    pub payment_method: String,
    /// Donor message (optional)
    pub message: Option<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}
