//! Background payment monitoring
//!
//! Each generated address gets a monitor: a scheduled job that probes
//! the blockchain, applies the pending payment state machine, and
//! either reschedules itself in ~10 seconds or stops. The chain of
//! reschedules ends when the row reaches a terminal state, its window
//! closes, or it disappears — there is no explicit cancel signal.
//!
//! Confirmation settlement is shared with the client-poll path in the
//! orchestrator; both converge on the same donation row because the
//! ledger insert is deduplicated by address.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db::{
    payment_method, Database, DonationQueries, PaymentStatus, PendingPaymentModel,
    PendingPaymentQueries,
};
use crate::probe::{ChainProbe, ProbeResult};
use crate::scheduler::JobScheduler;

/// Maximum accepted gap between expected and received BTC amounts
pub const AMOUNT_TOLERANCE_BTC: f64 = 1e-5;

/// What a monitor invocation decided to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Keep watching; another wake-up is warranted
    Reschedule,
    /// Terminal: the chain of reschedules ends here
    Done,
}

/// Result of settling a payment whose confirmations reached the bar
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SettleOutcome {
    /// Received too little; the row was expired and no donation exists
    Underpaid,
    /// Donation booked (or already existed) at this USD amount
    Booked {
        /// USD amount written to the ledger
        amount_usd: f64,
    },
}

/// Per-address blockchain watcher
pub struct PaymentMonitor {
    config: Arc<Config>,
    db: Arc<Database>,
    probe: Arc<ChainProbe>,
    scheduler: JobScheduler,
}

impl PaymentMonitor {
    /// Create a monitor over the shared probe and store
    pub fn new(
        config: Arc<Config>,
        db: Arc<Database>,
        probe: Arc<ChainProbe>,
        scheduler: JobScheduler,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            db,
            probe,
            scheduler,
        })
    }

    /// Schedule a wake-up for `address` after `delay`; returns the job id
    pub fn schedule(self: &Arc<Self>, address: &str, delay: Duration) -> String {
        let monitor = self.clone();
        let address = address.to_string();
        self.scheduler.run_after(delay, async move {
            monitor.tick(address).await;
        })
    }

    /// Re-schedule monitors for every in-flight payment in the store.
    /// Called once at startup so attempts survive a process restart.
    pub async fn reconcile_active(self: &Arc<Self>) -> anyhow::Result<usize> {
        let queries = PendingPaymentQueries::new(&self.db);
        let active = queries.list_active(Utc::now()).await?;
        let count = active.len();
        for payment in active {
            let job_id = self.schedule(&payment.address, self.config.poll_interval());
            queries.set_job_id(&payment.address, &job_id).await?;
        }
        if count > 0 {
            info!("Reconciled {} in-flight payment monitor(s)", count);
        }
        Ok(count)
    }

    /// One monitor invocation. Unexpected errors stop the chain (the
    /// hourly cleanup eventually expires the row) to avoid retry storms.
    async fn tick(self: Arc<Self>, address: String) {
        match self.run_once(&address).await {
            Ok(TickOutcome::Reschedule) => {
                let job_id = self.schedule(&address, self.config.poll_interval());
                let queries = PendingPaymentQueries::new(&self.db);
                if let Err(e) = queries.set_job_id(&address, &job_id).await {
                    warn!("Failed to persist job id for {}: {}", address, e);
                }
            }
            Ok(TickOutcome::Done) => {
                debug!("Monitor for {} finished", address);
            }
            Err(e) => {
                error!("Monitor for {} failed, not rescheduling: {}", address, e);
            }
        }
    }

    /// Load the row, guard the lifecycle, probe, and dispatch
    pub async fn run_once(&self, address: &str) -> anyhow::Result<TickOutcome> {
        let queries = PendingPaymentQueries::new(&self.db);
        let Some(payment) = queries.get_by_address(address).await? else {
            // Cleaned up or cancelled; stop quietly
            return Ok(TickOutcome::Done);
        };

        if payment.status.is_terminal() {
            return Ok(TickOutcome::Done);
        }

        if payment.is_expired_at(Utc::now()) {
            info!("Payment window for {} closed without confirmation", address);
            queries.set_status(address, PaymentStatus::Expired).await?;
            return Ok(TickOutcome::Done);
        }

        let result = self.probe.probe(address).await;
        self.process_result(&payment, result).await
    }

    /// Apply one probe result to the payment state machine
    pub async fn process_result(
        &self,
        payment: &PendingPaymentModel,
        result: ProbeResult,
    ) -> anyhow::Result<TickOutcome> {
        let queries = PendingPaymentQueries::new(&self.db);

        if payment.status.is_terminal() {
            return Ok(TickOutcome::Done);
        }
        if payment.is_expired_at(Utc::now()) {
            queries
                .set_status(&payment.address, PaymentStatus::Expired)
                .await?;
            return Ok(TickOutcome::Done);
        }

        match result {
            ProbeResult::ApiFailed => {
                debug!("All explorers failed for {}; will retry", payment.address);
                Ok(TickOutcome::Reschedule)
            }
            ProbeResult::NoPayment => Ok(TickOutcome::Reschedule),
            ProbeResult::Pending { txid, .. } => {
                if let Some(txid) = txid {
                    queries
                        .attach_txid(&payment.address, &txid, Utc::now())
                        .await?;
                }
                Ok(TickOutcome::Reschedule)
            }
            ProbeResult::Confirmed {
                txid,
                amount_btc,
                confirmations,
            } => {
                queries
                    .attach_txid(&payment.address, &txid, Utc::now())
                    .await?;

                let required = self.config.required_confirmations();
                if confirmations < required {
                    debug!(
                        "Payment {} at {}/{} confirmations",
                        payment.address, confirmations, required
                    );
                    return Ok(TickOutcome::Reschedule);
                }

                // Settle at the rate locked when the address was issued
                settle_confirmed(
                    &self.config,
                    &self.db,
                    payment,
                    amount_btc,
                    payment.exchange_rate,
                )
                .await?;
                Ok(TickOutcome::Done)
            }
        }
    }
}

/// Book the donation for a payment whose confirmations reached the bar.
///
/// Underpayment beyond the tolerance expires the row without creating a
/// donation. Overpayment is accepted but booked at the expected amount.
/// The donation insert is idempotent on the address, so concurrent
/// settlement from the monitor and the client-poll path is safe.
pub(crate) async fn settle_confirmed(
    config: &Config,
    db: &Database,
    payment: &PendingPaymentModel,
    received_btc: f64,
    rate: f64,
) -> anyhow::Result<SettleOutcome> {
    let queries = PendingPaymentQueries::new(db);
    let expected = payment.expected_amount_btc;

    if expected - received_btc > AMOUNT_TOLERANCE_BTC {
        warn!(
            "Underpayment on {}: expected {} BTC, received {} BTC",
            payment.address, expected, received_btc
        );
        queries
            .set_status(&payment.address, PaymentStatus::Expired)
            .await?;
        return Ok(SettleOutcome::Underpaid);
    }

    if received_btc - expected > AMOUNT_TOLERANCE_BTC {
        warn!(
            "Overpayment on {}: expected {} BTC, received {} BTC; crediting expected amount",
            payment.address, expected, received_btc
        );
    }

    let booked_btc = received_btc.min(expected);
    let mut amount_usd = booked_btc * rate;

    let (min, max) = (
        config.donations.min_amount_usd,
        config.donations.max_amount_usd,
    );
    if amount_usd < min || amount_usd > max {
        warn!(
            "Settled amount {} USD for {} outside [{}, {}]; clamping",
            amount_usd, payment.address, min, max
        );
        amount_usd = amount_usd.clamp(min, max);
    }

    let donations = DonationQueries::new(db);
    let created = donations
        .create(
            &payment.address,
            payment_method::BITCOIN,
            amount_usd,
            &payment.display_name(),
            payment.message.as_deref(),
        )
        .await?;
    if created {
        info!(
            "Donation booked: address={}, usd={:.2}",
            payment.address, amount_usd
        );
    } else {
        debug!(
            "Donation for {} already recorded by another worker",
            payment.address
        );
    }

    queries
        .set_status(&payment.address, PaymentStatus::Confirmed)
        .await?;
    Ok(SettleOutcome::Booked { amount_usd })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DonationQueries;

    async fn test_monitor() -> (Arc<PaymentMonitor>, Arc<Database>) {
        let mut config = Config::default();
        config.bitcoin.network = "mainnet".to_string();
        config.bitcoin.master_zprv = Some("unused".to_string());
        let config = Arc::new(config);
        let db = Arc::new(Database::connect("sqlite::memory:").await.unwrap());
        let probe = Arc::new(ChainProbe::new(
            config.btc_network(),
            Duration::from_secs(8),
        ));
        let monitor = PaymentMonitor::new(
            config.clone(),
            db.clone(),
            probe,
            JobScheduler::new(),
        );
        (monitor, db)
    }

    fn payment(address: &str) -> PendingPaymentModel {
        let now = Utc::now();
        PendingPaymentModel {
            address: address.to_string(),
            session_id: "s1".to_string(),
            expected_amount_btc: 0.00222222,
            expected_amount_usd: 100.0,
            exchange_rate: 45_000.0,
            derivation_index: 0,
            player_name: None,
            use_player_name: false,
            message: None,
            status: PaymentStatus::Initialized,
            txid: None,
            detected_at: None,
            scheduled_job_id: None,
            created_at: now,
            expires_at: now + chrono::Duration::hours(24),
        }
    }

    fn confirmed(txid: &str, amount_btc: f64, confirmations: u32) -> ProbeResult {
        ProbeResult::Confirmed {
            txid: txid.to_string(),
            amount_btc,
            confirmations,
        }
    }

    #[tokio::test]
    async fn test_missing_row_stops_chain() {
        let (monitor, _db) = test_monitor().await;
        let outcome = monitor.run_once("bc1qnowhere").await.unwrap();
        assert_eq!(outcome, TickOutcome::Done);
    }

    #[tokio::test]
    async fn test_terminal_row_is_noop() {
        let (monitor, db) = test_monitor().await;
        let queries = PendingPaymentQueries::new(&db);
        let mut p = payment("bc1qaddr0");
        p.status = PaymentStatus::Confirmed;
        queries.insert(&p).await.unwrap();

        let outcome = monitor
            .process_result(&p, confirmed("abc", 0.00222222, 3))
            .await
            .unwrap();
        assert_eq!(outcome, TickOutcome::Done);

        // No donation appears for an already-terminal row
        let donations = DonationQueries::new(&db);
        assert!(donations
            .get_by_payment_id("bc1qaddr0")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_expired_window_blocks_confirmation() {
        let (monitor, db) = test_monitor().await;
        let queries = PendingPaymentQueries::new(&db);
        let mut p = payment("bc1qaddr0");
        p.status = PaymentStatus::Pending;
        p.expires_at = Utc::now() - chrono::Duration::milliseconds(1);
        queries.insert(&p).await.unwrap();

        // A fully confirmed tx lands just after the window closed
        let outcome = monitor
            .process_result(&p, confirmed("abc", 0.00222222, 3))
            .await
            .unwrap();
        assert_eq!(outcome, TickOutcome::Done);

        let row = queries.get_by_address("bc1qaddr0").await.unwrap().unwrap();
        assert_eq!(row.status, PaymentStatus::Expired);
        let donations = DonationQueries::new(&db);
        assert!(donations
            .get_by_payment_id("bc1qaddr0")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_api_failure_reschedules() {
        let (monitor, db) = test_monitor().await;
        let queries = PendingPaymentQueries::new(&db);
        let p = payment("bc1qaddr0");
        queries.insert(&p).await.unwrap();

        let outcome = monitor
            .process_result(&p, ProbeResult::ApiFailed)
            .await
            .unwrap();
        assert_eq!(outcome, TickOutcome::Reschedule);
        let outcome = monitor
            .process_result(&p, ProbeResult::NoPayment)
            .await
            .unwrap();
        assert_eq!(outcome, TickOutcome::Reschedule);
    }

    #[tokio::test]
    async fn test_mempool_sighting_attaches_txid() {
        let (monitor, db) = test_monitor().await;
        let queries = PendingPaymentQueries::new(&db);
        let p = payment("bc1qaddr0");
        queries.insert(&p).await.unwrap();

        let outcome = monitor
            .process_result(
                &p,
                ProbeResult::Pending {
                    txid: Some("abc".to_string()),
                    amount_btc: 0.00222222,
                    confirmations: 0,
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome, TickOutcome::Reschedule);

        let row = queries.get_by_address("bc1qaddr0").await.unwrap().unwrap();
        assert_eq!(row.status, PaymentStatus::Pending);
        assert_eq!(row.txid.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_insufficient_confirmations_keep_watching() {
        let (monitor, db) = test_monitor().await;
        let queries = PendingPaymentQueries::new(&db);
        let p = payment("bc1qaddr0");
        queries.insert(&p).await.unwrap();

        // Mainnet requires 3
        let outcome = monitor
            .process_result(&p, confirmed("abc", 0.00222222, 2))
            .await
            .unwrap();
        assert_eq!(outcome, TickOutcome::Reschedule);

        let row = queries.get_by_address("bc1qaddr0").await.unwrap().unwrap();
        assert_eq!(row.status, PaymentStatus::Pending);
        assert_eq!(row.txid.as_deref(), Some("abc"));
        let donations = DonationQueries::new(&db);
        assert!(donations
            .get_by_payment_id("bc1qaddr0")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_confirmation_at_threshold_books_donation() {
        let (monitor, db) = test_monitor().await;
        let queries = PendingPaymentQueries::new(&db);
        let p = payment("bc1qaddr0");
        queries.insert(&p).await.unwrap();

        let outcome = monitor
            .process_result(&p, confirmed("abc", 0.00222222, 3))
            .await
            .unwrap();
        assert_eq!(outcome, TickOutcome::Done);

        let row = queries.get_by_address("bc1qaddr0").await.unwrap().unwrap();
        assert_eq!(row.status, PaymentStatus::Confirmed);
        assert_eq!(row.txid.as_deref(), Some("abc"));

        let donations = DonationQueries::new(&db);
        let donation = donations
            .get_by_payment_id("bc1qaddr0")
            .await
            .unwrap()
            .unwrap();
        // Booked at the stored rate: 0.00222222 * 45000 ≈ 100
        assert!((donation.amount_usd - 100.0).abs() < 0.01);
        assert_eq!(donation.display_name, "Anonymous");
    }

    #[tokio::test]
    async fn test_underpayment_expires_without_donation() {
        let (monitor, db) = test_monitor().await;
        let queries = PendingPaymentQueries::new(&db);
        let mut p = payment("bc1qaddr0");
        p.expected_amount_btc = 0.01;
        queries.insert(&p).await.unwrap();

        let outcome = monitor
            .process_result(&p, confirmed("abc", 0.005, 3))
            .await
            .unwrap();
        assert_eq!(outcome, TickOutcome::Done);

        let row = queries.get_by_address("bc1qaddr0").await.unwrap().unwrap();
        assert_eq!(row.status, PaymentStatus::Expired);
        let donations = DonationQueries::new(&db);
        assert!(donations
            .get_by_payment_id("bc1qaddr0")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_slight_shortfall_within_tolerance_is_accepted() {
        let (monitor, db) = test_monitor().await;
        let queries = PendingPaymentQueries::new(&db);
        let p = payment("bc1qaddr0");
        queries.insert(&p).await.unwrap();

        let received = p.expected_amount_btc - 9e-6;
        let outcome = monitor
            .process_result(&p, confirmed("abc", received, 3))
            .await
            .unwrap();
        assert_eq!(outcome, TickOutcome::Done);

        let row = queries.get_by_address("bc1qaddr0").await.unwrap().unwrap();
        assert_eq!(row.status, PaymentStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_overpayment_booked_at_expected_amount() {
        let (monitor, db) = test_monitor().await;
        let queries = PendingPaymentQueries::new(&db);
        let mut p = payment("bc1qaddr0");
        p.expected_amount_btc = 0.001;
        p.expected_amount_usd = 45.0;
        queries.insert(&p).await.unwrap();

        let outcome = monitor
            .process_result(&p, confirmed("abc", 0.002, 3))
            .await
            .unwrap();
        assert_eq!(outcome, TickOutcome::Done);

        let donations = DonationQueries::new(&db);
        let donation = donations
            .get_by_payment_id("bc1qaddr0")
            .await
            .unwrap()
            .unwrap();
        // Extra funds are not credited: 0.001 * 45000 = 45
        assert!((donation.amount_usd - 45.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn test_concurrent_settlement_books_one_donation() {
        let (monitor, db) = test_monitor().await;
        let queries = PendingPaymentQueries::new(&db);
        let p = payment("bc1qaddr0");
        queries.insert(&p).await.unwrap();

        // Monitor and client-poll settle the same confirmation
        let a = settle_confirmed(&monitor.config, &db, &p, 0.00222222, 45_000.0)
            .await
            .unwrap();
        let b = settle_confirmed(&monitor.config, &db, &p, 0.00222222, 45_000.0)
            .await
            .unwrap();
        assert!(matches!(a, SettleOutcome::Booked { .. }));
        assert!(matches!(b, SettleOutcome::Booked { .. }));

        let donations = DonationQueries::new(&db);
        let listed = donations.list_recent(10).await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_settlement_clamps_to_donation_bounds() {
        let (monitor, db) = test_monitor().await;
        let queries = PendingPaymentQueries::new(&db);
        let mut p = payment("bc1qaddr0");
        // Quoted at the very top of the allowed range
        p.expected_amount_btc = 3.0;
        p.expected_amount_usd = 100_000.0;
        queries.insert(&p).await.unwrap();

        // A later rate would push past the maximum; the ledger row is clamped
        let outcome = settle_confirmed(&monitor.config, &db, &p, 3.0, 40_000.0)
            .await
            .unwrap();
        match outcome {
            SettleOutcome::Booked { amount_usd } => assert_eq!(amount_usd, 100_000.0),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reconcile_schedules_active_payments() {
        let (monitor, db) = test_monitor().await;
        let queries = PendingPaymentQueries::new(&db);
        queries.insert(&payment("bc1qaddr0")).await.unwrap();
        queries.insert(&payment("bc1qaddr1")).await.unwrap();

        let mut settled = payment("bc1qaddr2");
        settled.status = PaymentStatus::Confirmed;
        queries.insert(&settled).await.unwrap();

        let count = monitor.reconcile_active().await.unwrap();
        assert_eq!(count, 2);

        let row = queries.get_by_address("bc1qaddr0").await.unwrap().unwrap();
        assert!(row.scheduled_job_id.is_some());
        let row = queries.get_by_address("bc1qaddr2").await.unwrap().unwrap();
        assert!(row.scheduled_job_id.is_none());
    }
}
