//! Payment orchestration
//!
//! The public entry points of the Bitcoin path: address generation,
//! client payment polling, client-signalled expiry, and the periodic
//! cleanup sweep. This layer owns validation, rate limiting, session
//! ownership, and idempotency; detection and settlement mechanics live
//! in the monitor and are shared with the background path.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::{
    CounterQueries, Database, DonorMeta, PaymentStatus, PendingPaymentModel,
    PendingPaymentQueries,
};
use crate::monitor::{settle_confirmed, PaymentMonitor, SettleOutcome};
use crate::oracle::RateOracle;
use crate::probe::{ChainProbe, ProbeResult};
use crate::ratelimit::{FixedWindowLimiter, TokenBucketLimiter};
use crate::wallet::{self, WalletError};
use crate::{PaymentError, PaymentResult};

/// Longest accepted donor display name
const MAX_PLAYER_NAME_LEN: usize = 50;
/// Longest accepted donor message
const MAX_MESSAGE_LEN: usize = 500;

/// Result of generating (or re-fetching) a receive address
#[derive(Debug, Clone, Serialize)]
pub struct GeneratedAddress {
    /// The receive address for this attempt
    pub address: String,
    /// BTC amount at the quoted rate
    pub amount_btc: f64,
    /// Requested USD amount
    pub amount_usd: f64,
    /// USD/BTC rate behind the quote
    pub exchange_rate: f64,
    /// BIP84 index of the address
    pub derivation_index: i64,
    /// BIP21 URI for wallet QR codes
    pub payment_uri: String,
}

/// Client-facing payment state
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    /// Whether any transaction to the address has been seen
    pub paid: bool,
    /// Whether the payment reached the confirmation bar and the
    /// donation exists
    pub confirmed: bool,
    /// Transaction id, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    /// Received BTC amount, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_btc: Option<f64>,
    /// Current confirmation count
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmations: Option<u32>,
    /// Confirmations needed on this network
    pub required_confirmations: u32,
    /// USD amount booked on the donation, once confirmed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_usd: Option<f64>,
}

impl CheckResult {
    fn unpaid(required: u32) -> Self {
        Self {
            paid: false,
            confirmed: false,
            tx_hash: None,
            amount_btc: None,
            confirmations: None,
            required_confirmations: required,
            amount_usd: None,
        }
    }

    fn seen(txid: Option<String>, amount_btc: f64, confirmations: u32, required: u32) -> Self {
        Self {
            paid: true,
            confirmed: false,
            tx_hash: txid,
            amount_btc: Some(amount_btc),
            confirmations: Some(confirmations),
            required_confirmations: required,
            amount_usd: None,
        }
    }

    fn settled(
        txid: Option<String>,
        amount_btc: f64,
        confirmations: u32,
        required: u32,
        amount_usd: f64,
    ) -> Self {
        Self {
            paid: true,
            confirmed: true,
            tx_hash: txid,
            amount_btc: Some(amount_btc),
            confirmations: Some(confirmations),
            required_confirmations: required,
            amount_usd: Some(amount_usd),
        }
    }
}

/// Row counts from one cleanup sweep
#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    /// Initialized rows past their window, now expired
    pub expired_initialized: usize,
    /// Pending rows whose tx never confirmed in time, now expired
    pub expired_pending: usize,
    /// Confirmed rows deleted (the donation is the record)
    pub deleted_confirmed: usize,
    /// Expired rows past the retention window, deleted
    pub deleted_expired: usize,
}

/// The payment orchestrator
pub struct PaymentService {
    config: Arc<Config>,
    db: Arc<Database>,
    oracle: Arc<RateOracle>,
    probe: Arc<ChainProbe>,
    monitor: Arc<PaymentMonitor>,
    /// Address generation: one token per 5 minutes per session
    generate_limiter: TokenBucketLimiter,
    /// Payment checks: one per 10 seconds per session
    check_limiter: FixedWindowLimiter,
    /// Public price endpoint: one per 30 seconds, global
    price_limiter: FixedWindowLimiter,
}

impl PaymentService {
    /// Create the orchestrator over shared infrastructure
    pub fn new(
        config: Arc<Config>,
        db: Arc<Database>,
        oracle: Arc<RateOracle>,
        probe: Arc<ChainProbe>,
        monitor: Arc<PaymentMonitor>,
    ) -> Self {
        Self {
            config,
            db,
            oracle,
            probe,
            monitor,
            generate_limiter: TokenBucketLimiter::new(1, Duration::from_secs(300)),
            check_limiter: FixedWindowLimiter::new(1, Duration::from_secs(10)),
            price_limiter: FixedWindowLimiter::new(1, Duration::from_secs(30)),
        }
    }

    /// Generate a receive address for a donation attempt.
    ///
    /// A repeat call with the same (session, amount) inside the payment
    /// window returns the existing address with a freshly quoted BTC
    /// amount and does not consume a rate limit token or bump the
    /// derivation counter.
    pub async fn generate_address(
        &self,
        amount_usd: f64,
        session_id: &str,
        meta: DonorMeta,
    ) -> PaymentResult<GeneratedAddress> {
        self.validate_amount(amount_usd)?;
        validate_session(session_id)?;
        validate_meta(&meta)?;

        let queries = PendingPaymentQueries::new(&self.db);
        let now = Utc::now();

        // Idempotency: an in-flight attempt for the same amount wins
        // over everything else, including the rate limiter
        if let Some(existing) = queries
            .find_active_by_session(session_id, amount_usd, now)
            .await?
        {
            // Requote so the QR stays accurate if BTC moved; fall back
            // to the locked rate when every source is down
            let rate = match self.oracle.price().await {
                Ok(price) => price,
                Err(_) => existing.exchange_rate,
            };
            let amount_btc = amount_usd / rate;
            info!(
                "Reissuing address {} for session {} ({} USD)",
                existing.address, session_id, amount_usd
            );
            return Ok(GeneratedAddress {
                payment_uri: build_payment_uri(
                    &existing.address,
                    amount_btc,
                    &existing.display_name(),
                    existing.message.as_deref(),
                ),
                address: existing.address,
                amount_btc,
                amount_usd,
                exchange_rate: rate,
                derivation_index: existing.derivation_index,
            });
        }

        if !self.generate_limiter.try_acquire(session_id) {
            return Err(PaymentError::RateLimited(
                "Address generation is limited to one every 5 minutes".to_string(),
            ));
        }

        let rate = self
            .oracle
            .price()
            .await
            .map_err(|_| PaymentError::OracleUnavailable)?;
        let amount_btc = amount_usd / rate;

        let master_key = self.config.master_key().map_err(PaymentError::Config)?;
        let network = self.config.btc_network();
        let counters = CounterQueries::new(&self.db);

        // An invalid child scalar is possible in principle; one retry
        // with the next index covers it
        let mut retried = false;
        let (index, address) = loop {
            let index = counters.next_derivation_index().await?;
            match wallet::derive_address(master_key, index as u32, network) {
                Ok(address) => break (index, address),
                Err(WalletError::DerivationFailure(e)) if !retried => {
                    warn!("Derivation failed at index {}: {}; retrying", index, e);
                    retried = true;
                }
                Err(e) => return Err(e.into()),
            }
        };

        let payment = PendingPaymentModel {
            address: address.clone(),
            session_id: session_id.to_string(),
            expected_amount_btc: amount_btc,
            expected_amount_usd: amount_usd,
            exchange_rate: rate,
            derivation_index: index,
            player_name: meta.player_name.clone(),
            use_player_name: meta.use_player_name,
            message: meta.message.clone(),
            status: PaymentStatus::Initialized,
            txid: None,
            detected_at: None,
            scheduled_job_id: None,
            created_at: now,
            expires_at: now + self.config.payment_window(),
        };
        queries.insert(&payment).await?;

        let job_id = self
            .monitor
            .schedule(&address, self.config.poll_interval());
        queries.set_job_id(&address, &job_id).await?;

        info!(
            "Generated address {} (index {}) for session {}: {} USD = {} BTC @ {}",
            address, index, session_id, amount_usd, amount_btc, rate
        );

        Ok(GeneratedAddress {
            payment_uri: build_payment_uri(
                &address,
                amount_btc,
                &payment.display_name(),
                payment.message.as_deref(),
            ),
            address,
            amount_btc,
            amount_usd,
            exchange_rate: rate,
            derivation_index: index,
        })
    }

    /// Client-side payment poll. Safe to run concurrently with the
    /// background monitor; both settle through the same idempotent
    /// donation insert.
    pub async fn check_payment(
        &self,
        address: &str,
        session_id: &str,
    ) -> PaymentResult<CheckResult> {
        if !wallet::is_valid_address_shape(address, self.config.btc_network()) {
            return Err(PaymentError::Validation(
                "Invalid Bitcoin address".to_string(),
            ));
        }

        let queries = PendingPaymentQueries::new(&self.db);
        let payment = self.owned_payment(address, session_id).await?;
        let required = self.config.required_confirmations();

        // Already settled: answer from the store without probing
        if payment.status == PaymentStatus::Confirmed {
            return Ok(CheckResult::settled(
                payment.txid.clone(),
                payment.expected_amount_btc,
                required,
                required,
                payment.expected_amount_usd,
            ));
        }
        if payment.status == PaymentStatus::Expired {
            return Err(PaymentError::Expired);
        }
        if payment.is_expired_at(Utc::now()) {
            queries
                .set_status(address, PaymentStatus::Expired)
                .await?;
            return Err(PaymentError::Expired);
        }

        if !self.check_limiter.check(session_id) {
            return Err(PaymentError::RateLimited(
                "Payment status checks are limited to one every 10 seconds".to_string(),
            ));
        }

        match self.probe.probe(address).await {
            // Transient explorer trouble looks like "not paid yet" so
            // the client simply polls again
            ProbeResult::ApiFailed | ProbeResult::NoPayment => {
                Ok(CheckResult::unpaid(required))
            }
            ProbeResult::Pending {
                txid,
                amount_btc,
                confirmations,
            } => {
                if let Some(txid) = &txid {
                    queries.attach_txid(address, txid, Utc::now()).await?;
                }
                Ok(CheckResult::seen(txid, amount_btc, confirmations, required))
            }
            ProbeResult::Confirmed {
                txid,
                amount_btc,
                confirmations,
            } => {
                queries.attach_txid(address, &txid, Utc::now()).await?;
                if confirmations < required {
                    return Ok(CheckResult::seen(
                        Some(txid),
                        amount_btc,
                        confirmations,
                        required,
                    ));
                }

                // The user-facing receipt quotes today's price; the
                // locked rate is the fallback when the oracle is down
                let rate = match self.oracle.price().await {
                    Ok(price) => price,
                    Err(_) => payment.exchange_rate,
                };
                match settle_confirmed(&self.config, &self.db, &payment, amount_btc, rate)
                    .await?
                {
                    SettleOutcome::Underpaid => Err(PaymentError::Underpayment),
                    SettleOutcome::Booked { amount_usd } => Ok(CheckResult::settled(
                        Some(txid),
                        amount_btc,
                        confirmations,
                        required,
                        amount_usd,
                    )),
                }
            }
        }
    }

    /// Client-signalled expiry of an untouched attempt. Idempotent;
    /// a no-op once a transaction has been seen.
    pub async fn mark_expired(&self, address: &str, session_id: &str) -> PaymentResult<()> {
        if !wallet::is_valid_address_shape(address, self.config.btc_network()) {
            return Err(PaymentError::Validation(
                "Invalid Bitcoin address".to_string(),
            ));
        }
        self.owned_payment(address, session_id).await?;

        let queries = PendingPaymentQueries::new(&self.db);
        queries
            .mark_expired_if_initialized(address, session_id)
            .await?;
        Ok(())
    }

    /// Hourly sweep: expire overdue attempts, drop settled and stale
    /// rows, and trim idle rate limiter state.
    pub async fn cleanup_expired(&self) -> PaymentResult<CleanupReport> {
        let queries = PendingPaymentQueries::new(&self.db);
        let now = Utc::now();

        let report = CleanupReport {
            expired_initialized: queries
                .expire_overdue(PaymentStatus::Initialized, now)
                .await?,
            expired_pending: queries.expire_overdue(PaymentStatus::Pending, now).await?,
            deleted_confirmed: queries.delete_confirmed().await?,
            deleted_expired: queries
                .delete_expired_older_than(now - chrono::Duration::days(7))
                .await?,
        };

        self.generate_limiter.prune_idle(Duration::from_secs(600));
        self.check_limiter.prune_idle(Duration::from_secs(60));

        Ok(report)
    }

    /// Current BTC/USD rate for the public price endpoint
    pub async fn price(&self) -> PaymentResult<f64> {
        if !self.price_limiter.check("global") {
            return Err(PaymentError::RateLimited(
                "Price requests are limited to one every 30 seconds".to_string(),
            ));
        }
        self.oracle
            .price()
            .await
            .map_err(|_| PaymentError::OracleUnavailable)
    }

    /// Load the pending payment and verify session ownership. A
    /// missing row and a foreign row are indistinguishable to callers.
    async fn owned_payment(
        &self,
        address: &str,
        session_id: &str,
    ) -> PaymentResult<PendingPaymentModel> {
        let queries = PendingPaymentQueries::new(&self.db);
        let Some(payment) = queries.get_by_address(address).await? else {
            return Err(PaymentError::NotOwned);
        };
        if payment.session_id != session_id {
            return Err(PaymentError::NotOwned);
        }
        Ok(payment)
    }

    fn validate_amount(&self, amount_usd: f64) -> PaymentResult<()> {
        let (min, max) = (
            self.config.donations.min_amount_usd,
            self.config.donations.max_amount_usd,
        );
        if !amount_usd.is_finite() || amount_usd < min || amount_usd > max {
            return Err(PaymentError::Validation(format!(
                "Donation amount must be between {} and {} USD",
                min, max
            )));
        }
        Ok(())
    }
}

fn validate_session(session_id: &str) -> PaymentResult<()> {
    if session_id.trim().is_empty() {
        return Err(PaymentError::Validation(
            "Session id must not be blank".to_string(),
        ));
    }
    Ok(())
}

fn validate_meta(meta: &DonorMeta) -> PaymentResult<()> {
    if let Some(name) = &meta.player_name {
        if name.trim().is_empty() {
            return Err(PaymentError::Validation(
                "Display name must not be blank".to_string(),
            ));
        }
        if name.chars().count() > MAX_PLAYER_NAME_LEN {
            return Err(PaymentError::Validation(format!(
                "Display name must be at most {} characters",
                MAX_PLAYER_NAME_LEN
            )));
        }
    }
    if let Some(message) = &meta.message {
        if message.trim().is_empty() {
            return Err(PaymentError::Validation(
                "Message must not be blank".to_string(),
            ));
        }
        if message.chars().count() > MAX_MESSAGE_LEN {
            return Err(PaymentError::Validation(format!(
                "Message must be at most {} characters",
                MAX_MESSAGE_LEN
            )));
        }
    }
    Ok(())
}

/// BIP21 payment URI for wallet QR codes
fn build_payment_uri(
    address: &str,
    amount_btc: f64,
    label: &str,
    message: Option<&str>,
) -> String {
    let mut uri = format!(
        "bitcoin:{}?amount={:.8}&label={}",
        address,
        amount_btc,
        utf8_percent_encode(label, NON_ALPHANUMERIC)
    );
    if let Some(message) = message {
        uri.push_str(&format!(
            "&message={}",
            utf8_percent_encode(message, NON_ALPHANUMERIC)
        ));
    }
    uri
}
