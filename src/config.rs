//! Configuration management for the donation core
//!
//! Configuration is loaded from TOML files and environment variables.
//! Deployment-sensitive values (network selection, master keys, site
//! URL) can be overridden via `BITCOIN_NETWORK`, `BITCOIN_MASTER_ZPRV`,
//! `BITCOIN_MASTER_VPRV` and `SITE_URL`.
//!
//! # Example Configuration File
//!
//! ```toml
//! [bitcoin]
//! network = "mainnet"
//! payment_window_hours = 24
//! poll_interval_seconds = 10
//!
//! [oracle]
//! cache_ttl_seconds = 300
//! timeout_seconds = 5
//!
//! [probe]
//! timeout_seconds = 8
//!
//! [donations]
//! min_amount_usd = 1.0
//! max_amount_usd = 100000.0
//!
//! [api]
//! bind_address = "0.0.0.0:8080"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bitcoin network and key configuration
    #[serde(default)]
    pub bitcoin: BitcoinConfig,

    /// Exchange rate oracle configuration
    #[serde(default)]
    pub oracle: OracleConfig,

    /// Blockchain explorer probe configuration
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Donation amount bounds
    #[serde(default)]
    pub donations: DonationConfig,

    /// API server configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Public site URL, consumed by the hosted checkout adapters
    /// (Stripe/PayPal); the Bitcoin path does not use it
    pub site_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bitcoin: BitcoinConfig::default(),
            oracle: OracleConfig::default(),
            probe: ProbeConfig::default(),
            donations: DonationConfig::default(),
            api: ApiConfig::default(),
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
            site_url: None,
        }
    }
}

/// Bitcoin network and master key configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitcoinConfig {
    /// Network to run on (mainnet or testnet)
    #[serde(default = "default_network")]
    pub network: String,

    /// BIP84 extended private key for mainnet (zprv...). Required when
    /// network is mainnet. Never logged.
    #[serde(skip_serializing)]
    pub master_zprv: Option<String>,

    /// BIP84 extended private key for testnet (vprv...). Required when
    /// network is testnet. Never logged.
    #[serde(skip_serializing)]
    pub master_vprv: Option<String>,

    /// How long a generated address stays payable (hours)
    #[serde(default = "default_payment_window_hours")]
    pub payment_window_hours: i64,

    /// Monitor poll cadence (seconds)
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
}

impl Default for BitcoinConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            master_zprv: None,
            master_vprv: None,
            payment_window_hours: default_payment_window_hours(),
            poll_interval_seconds: default_poll_interval(),
        }
    }
}

fn default_network() -> String {
    "testnet".to_string()
}

fn default_payment_window_hours() -> i64 {
    24
}

fn default_poll_interval() -> u64 {
    10
}

/// Exchange rate oracle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OracleConfig {
    /// How long a fetched price stays cached (seconds)
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_seconds: u64,

    /// Per-source request timeout (seconds)
    #[serde(default = "default_oracle_timeout")]
    pub timeout_seconds: u64,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: default_cache_ttl(),
            timeout_seconds: default_oracle_timeout(),
        }
    }
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_oracle_timeout() -> u64 {
    5
}

/// Blockchain explorer probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Per-explorer request timeout (seconds)
    #[serde(default = "default_probe_timeout")]
    pub timeout_seconds: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_probe_timeout(),
        }
    }
}

fn default_probe_timeout() -> u64 {
    8
}

/// Donation amount bounds (USD)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DonationConfig {
    /// Minimum donation amount
    #[serde(default = "default_min_amount")]
    pub min_amount_usd: f64,

    /// Maximum donation amount
    #[serde(default = "default_max_amount")]
    pub max_amount_usd: f64,
}

impl Default for DonationConfig {
    fn default() -> Self {
        Self {
            min_amount_usd: default_min_amount(),
            max_amount_usd: default_max_amount(),
        }
    }
}

fn default_min_amount() -> f64 {
    1.0
}

fn default_max_amount() -> f64 {
    100_000.0
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Address to bind the API server to
    #[serde(default = "default_api_bind")]
    pub bind_address: String,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub enable_cors: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_address: default_api_bind(),
            enable_cors: true,
        }
    }
}

fn default_api_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_true() -> bool {
    true
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL or path
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Data directory for file-based databases
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite:donation-core.db".to_string()
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("donation-core"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Config {
    /// Apply environment variable overrides for deployment-sensitive
    /// values. Called after the TOML file is parsed.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(network) = std::env::var("BITCOIN_NETWORK") {
            self.bitcoin.network = network;
        }
        if let Ok(zprv) = std::env::var("BITCOIN_MASTER_ZPRV") {
            self.bitcoin.master_zprv = Some(zprv);
        }
        if let Ok(vprv) = std::env::var("BITCOIN_MASTER_VPRV") {
            self.bitcoin.master_vprv = Some(vprv);
        }
        if let Ok(url) = std::env::var("SITE_URL") {
            self.site_url = Some(url);
        }
    }

    /// Database URL with relative sqlite paths anchored under data_dir
    pub fn resolve_database_url(&self) -> String {
        let url = &self.database.url;
        let path = url.strip_prefix("sqlite:").unwrap_or(url);

        // In-memory stores and absolute paths pass through untouched;
        // only a bare relative name gets moved under the data dir
        if path == ":memory:" || std::path::Path::new(path).is_absolute() {
            return url.clone();
        }
        format!("sqlite:{}", self.database.data_dir.join(path).display())
    }

    /// Get the API bind address
    pub fn api_bind_address(&self) -> String {
        self.api.bind_address.clone()
    }

    /// Check if running on mainnet
    pub fn is_mainnet(&self) -> bool {
        self.bitcoin.network == "mainnet"
    }

    /// The Bitcoin network as the `bitcoin` crate knows it
    pub fn btc_network(&self) -> bitcoin::Network {
        if self.is_mainnet() {
            bitcoin::Network::Bitcoin
        } else {
            bitcoin::Network::Testnet
        }
    }

    /// Confirmations required before a payment is treated as final.
    /// Testnet is set higher intentionally: test blocks are cheap.
    pub fn required_confirmations(&self) -> u32 {
        if self.is_mainnet() {
            3
        } else {
            6
        }
    }

    /// The extended private key matching the configured network
    pub fn master_key(&self) -> Result<&str, String> {
        let key = if self.is_mainnet() {
            self.bitcoin.master_zprv.as_deref()
        } else {
            self.bitcoin.master_vprv.as_deref()
        };
        key.ok_or_else(|| {
            format!(
                "No master key configured for network {}",
                self.bitcoin.network
            )
        })
    }

    /// How long a generated address stays payable
    pub fn payment_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.bitcoin.payment_window_hours)
    }

    /// Monitor poll cadence
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.bitcoin.poll_interval_seconds)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        let valid_networks = ["mainnet", "testnet"];
        if !valid_networks.contains(&self.bitcoin.network.as_str()) {
            return Err(format!(
                "Invalid network: {}. Must be one of: {:?}",
                self.bitcoin.network, valid_networks
            ));
        }

        if self.is_mainnet() && self.bitcoin.master_zprv.is_none() {
            return Err("mainnet requires BITCOIN_MASTER_ZPRV".to_string());
        }
        if !self.is_mainnet() && self.bitcoin.master_vprv.is_none() {
            return Err("testnet requires BITCOIN_MASTER_VPRV".to_string());
        }

        if self.donations.min_amount_usd <= 0.0 {
            return Err("Minimum donation amount must be positive".to_string());
        }
        if self.donations.min_amount_usd >= self.donations.max_amount_usd {
            return Err(
                "Minimum donation amount must be less than maximum donation amount".to_string(),
            );
        }

        if self.bitcoin.payment_window_hours <= 0 {
            return Err("Payment window must be positive".to_string());
        }
        if self.bitcoin.poll_interval_seconds == 0 {
            return Err("Poll interval cannot be 0".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn testnet_config() -> Config {
        let mut config = Config::default();
        config.bitcoin.master_vprv = Some("vprv-test-placeholder".to_string());
        config
    }

    #[test]
    fn test_validate_config() {
        let mut config = testnet_config();
        assert!(config.validate().is_ok());

        // Missing key for the selected network
        config.bitcoin.network = "mainnet".to_string();
        assert!(config.validate().is_err());

        // Unknown network
        config.bitcoin.network = "signet".to_string();
        assert!(config.validate().is_err());

        // Inverted donation bounds
        let mut config = testnet_config();
        config.donations.min_amount_usd = 200_000.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_required_confirmations() {
        let mut config = testnet_config();
        assert_eq!(config.required_confirmations(), 6);
        config.bitcoin.network = "mainnet".to_string();
        assert_eq!(config.required_confirmations(), 3);
    }

    #[test]
    fn test_payment_window_default() {
        let config = Config::default();
        assert_eq!(config.payment_window(), chrono::Duration::hours(24));
    }

    #[test]
    fn test_resolve_database_url_memory() {
        let mut config = Config::default();
        config.database.url = "sqlite::memory:".to_string();
        assert_eq!(config.resolve_database_url(), "sqlite::memory:");
    }
}
