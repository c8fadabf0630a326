//! Bitcoin payment core for a small donations platform
//!
//! The platform accepts donations over hosted Stripe/PayPal checkouts
//! and over Bitcoin; this crate is the Bitcoin path:
//!
//! - **Unique receive addresses**: every donation attempt gets its own
//!   BIP84 SegWit address derived from the platform's extended key
//! - **Live pricing**: the USD amount is quoted in BTC at request time
//!   from the median of several public exchange feeds
//! - **Payment detection**: public blockchain explorers are polled
//!   until the inbound transaction reaches the confirmation bar
//! - **Exactly-once donations**: concurrent detection by the
//!   background monitor and the client poll converges on a single
//!   ledger row, deduplicated by receive address
//!
//! # Architecture
//!
//! The orchestrator ([`service::PaymentService`]) sits over a SQLite
//! store, the exchange rate oracle, and the blockchain probe. Each
//! generated address is watched by a self-rescheduling monitor job;
//! an hourly cleanup sweeps out expired and settled attempts.
//!
#![warn(missing_docs)]

pub mod api;
pub mod config;
pub mod db;
pub mod monitor;
pub mod oracle;
pub mod probe;
pub mod ratelimit;
pub mod scheduler;
pub mod service;
pub mod wallet;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

pub use config::Config;
use db::Database;
use monitor::PaymentMonitor;
use oracle::RateOracle;
use probe::ChainProbe;
use scheduler::JobScheduler;
use service::PaymentService;

/// The main donation application state
#[derive(Clone)]
pub struct DonationApp {
    /// Application configuration
    pub config: Arc<Config>,
    /// Database connection
    pub db: Arc<Database>,
    /// Payment orchestrator
    pub service: Arc<PaymentService>,
    /// Background job scheduler
    pub scheduler: JobScheduler,
    /// Per-address payment monitor
    pub monitor: Arc<PaymentMonitor>,
}

impl DonationApp {
    /// Create a new application instance
    pub async fn new(config: Config) -> Result<Self> {
        info!("Initializing donation core...");

        let config = Arc::new(config);

        // Initialize the database
        let db_url = config.resolve_database_url();
        let db = Arc::new(Database::connect(&db_url).await?);

        let oracle = Arc::new(RateOracle::new(
            Duration::from_secs(config.oracle.timeout_seconds),
            Duration::from_secs(config.oracle.cache_ttl_seconds),
        ));
        let probe = Arc::new(ChainProbe::new(
            config.btc_network(),
            Duration::from_secs(config.probe.timeout_seconds),
        ));

        let scheduler = JobScheduler::new();
        let monitor = PaymentMonitor::new(
            config.clone(),
            db.clone(),
            probe.clone(),
            scheduler.clone(),
        );
        let service = Arc::new(PaymentService::new(
            config.clone(),
            db.clone(),
            oracle,
            probe,
            monitor.clone(),
        ));

        info!(
            "Donation core initialized (network: {})",
            config.bitcoin.network
        );

        Ok(Self {
            config,
            db,
            service,
            scheduler,
            monitor,
        })
    }

    /// Start the application with a shutdown signal
    pub async fn run_with_shutdown(
        &self,
        shutdown_rx: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<()> {
        info!("Starting donation core...");

        // Resume monitors for payments that were in flight when the
        // process last stopped
        self.monitor.reconcile_active().await?;

        // Hourly cleanup of expired and settled payment attempts
        let service = self.service.clone();
        self.scheduler
            .run_every(Duration::from_secs(3600), move || {
                let service = service.clone();
                async move {
                    match service.cleanup_expired().await {
                        Ok(report) => info!("Cleanup: {:?}", report),
                        Err(e) => tracing::error!("Cleanup failed: {}", e),
                    }
                }
            });

        // Serve the HTTP API until shutdown
        api::serve_with_shutdown(self.clone(), shutdown_rx).await?;

        Ok(())
    }

    /// Shutdown the application gracefully
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down donation core...");
        self.scheduler.shutdown();
        self.db.close().await;
        info!("Donation core shutdown complete");
        Ok(())
    }
}

/// Error types surfaced by the payment orchestrator
#[derive(thiserror::Error, Debug)]
pub enum PaymentError {
    /// Amount out of range, metadata too long, malformed address.
    /// Not retryable.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Rate limit exceeded; transient, the caller should back off
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// The session does not own this payment attempt
    #[error("Session does not own this payment")]
    NotOwned,

    /// The payment window has closed
    #[error("Payment window has expired")]
    Expired,

    /// Confirmed amount fell short of the expected amount beyond the
    /// tolerance; the attempt was expired and no donation was created
    #[error("Received amount is below the expected amount")]
    Underpayment,

    /// No exchange rate source responded
    #[error("Exchange rate unavailable")]
    OracleUnavailable,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Address derivation error
    #[error("Address derivation error: {0}")]
    Wallet(#[from] wallet::WalletError),

    /// Storage error
    #[error("Database error: {0}")]
    Database(String),
}

impl From<anyhow::Error> for PaymentError {
    fn from(e: anyhow::Error) -> Self {
        PaymentError::Database(e.to_string())
    }
}

/// Result type alias for payment operations
pub type PaymentResult<T> = std::result::Result<T, PaymentError>;
