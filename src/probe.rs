//! Blockchain explorer probe
//!
//! Queries public esplora-style explorers for inbound transactions to a
//! receive address and normalizes the answer into a [`ProbeResult`].
//! mempool.space is the primary explorer (testnet4 path on testnet);
//! blockstream.info is the mainnet fallback. The first explorer that
//! produces a usable answer wins.

use std::time::Duration;

use bitcoin::Network;
use serde::Deserialize;
use tracing::{debug, warn};

const SATS_PER_BTC: f64 = 100_000_000.0;

/// Normalized payment state for a single receive address
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeResult {
    /// All explorers unreachable or malformed; caller should retry
    ApiFailed,
    /// Explorer responded; nothing credits this address
    NoPayment,
    /// A transaction crediting the address is known but not buried:
    /// mempool-only, or seen indirectly via a funded balance (txid
    /// unknown in that case)
    Pending {
        /// Transaction id, when the tx endpoint reported one
        txid: Option<String>,
        /// Sum of outputs crediting the address, in BTC
        amount_btc: f64,
        /// Always 0 for mempool-only transactions
        confirmations: u32,
    },
    /// The crediting transaction is included in a block
    Confirmed {
        /// Transaction id
        txid: String,
        /// Sum of outputs crediting the address, in BTC
        amount_btc: f64,
        /// Depth of the containing block, tip inclusive
        confirmations: u32,
    },
}

/// Explorer client for payment detection
pub struct ChainProbe {
    client: reqwest::Client,
    timeout: Duration,
    /// Esplora API base URLs, in priority order
    explorers: Vec<String>,
}

impl ChainProbe {
    /// Create a probe for the given network
    pub fn new(network: Network, timeout: Duration) -> Self {
        let explorers = match network {
            Network::Bitcoin => vec![
                "https://mempool.space/api".to_string(),
                "https://blockstream.info/api".to_string(),
            ],
            _ => vec!["https://mempool.space/testnet4/api".to_string()],
        };
        Self {
            client: reqwest::Client::new(),
            timeout,
            explorers,
        }
    }

    /// Query explorers in priority order for payments to `address`
    pub async fn probe(&self, address: &str) -> ProbeResult {
        for base in &self.explorers {
            match self.probe_explorer(base, address).await {
                Ok(result) => return result,
                Err(e) => warn!("Explorer {} failed for {}: {}", base, address, e),
            }
        }
        ProbeResult::ApiFailed
    }

    /// Probe a single explorer. Errors bubble up so the next explorer
    /// gets a chance; a clean "no payment" answer does not.
    async fn probe_explorer(&self, base: &str, address: &str) -> anyhow::Result<ProbeResult> {
        let url = format!("{}/address/{}/txs", base, address);
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            // Explorers answer 404 for addresses they have never seen
            return Ok(ProbeResult::NoPayment);
        }

        if !response.status().is_success() {
            // The tx endpoint is down; fall back to the address stats
            // endpoint and report a txid-less pending payment if the
            // address holds a positive funded balance.
            warn!(
                "Explorer {} tx endpoint returned {}, trying address stats",
                base,
                response.status()
            );
            return self.probe_funded_balance(base, address).await;
        }

        let txs: Vec<EsploraTx> = response.json().await?;
        let tip_height = match self.fetch_tip_height(base).await {
            Ok(height) => Some(height),
            Err(e) => {
                warn!("Explorer {} tip height unavailable: {}", base, e);
                None
            }
        };
        Ok(classify_txs(&txs, address, tip_height))
    }

    /// Partial-response path: the address endpoint still works even
    /// when the tx listing does not.
    async fn probe_funded_balance(&self, base: &str, address: &str) -> anyhow::Result<ProbeResult> {
        let url = format!("{}/address/{}", base, address);
        let response = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(ProbeResult::NoPayment);
        }

        let stats: EsploraAddressStats = response.error_for_status()?.json().await?;
        let funded_sats =
            stats.chain_stats.funded_txo_sum + stats.mempool_stats.funded_txo_sum;
        if funded_sats == 0 {
            return Ok(ProbeResult::NoPayment);
        }

        Ok(ProbeResult::Pending {
            txid: None,
            amount_btc: funded_sats as f64 / SATS_PER_BTC,
            confirmations: 0,
        })
    }

    async fn fetch_tip_height(&self, base: &str) -> anyhow::Result<u64> {
        let url = format!("{}/blocks/tip/height", base);
        let body = self
            .client
            .get(&url)
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(body.trim().parse()?)
    }
}

/// Pick the payment state out of an explorer tx listing.
///
/// Esplora orders the listing newest-first (mempool entries before
/// confirmed ones), so the first crediting transaction is the most
/// recent. Addresses are single-use, so more than one crediting tx is
/// anomalous and logged.
fn classify_txs(txs: &[EsploraTx], address: &str, tip_height: Option<u64>) -> ProbeResult {
    let crediting: Vec<(&EsploraTx, u64)> = txs
        .iter()
        .filter_map(|tx| {
            let sats = credited_sats(tx, address);
            (sats > 0).then_some((tx, sats))
        })
        .collect();

    let Some((tx, sats)) = crediting.first() else {
        return ProbeResult::NoPayment;
    };

    if crediting.len() > 1 {
        warn!(
            "Address {} credited by {} transactions; using most recent {}",
            address,
            crediting.len(),
            tx.txid
        );
        for (other, _) in &crediting[1..] {
            debug!("Ignoring older crediting tx {} for {}", other.txid, address);
        }
    }

    let amount_btc = *sats as f64 / SATS_PER_BTC;

    match (tx.status.confirmed, tx.status.block_height, tip_height) {
        (true, Some(height), Some(tip)) => ProbeResult::Confirmed {
            txid: tx.txid.clone(),
            amount_btc,
            confirmations: confirmations(tip, height),
        },
        // Confirmed but the tip is unknown: report it as seen so the
        // caller keeps polling instead of crediting too early
        (true, _, _) => ProbeResult::Pending {
            txid: Some(tx.txid.clone()),
            amount_btc,
            confirmations: 0,
        },
        (false, _, _) => ProbeResult::Pending {
            txid: Some(tx.txid.clone()),
            amount_btc,
            confirmations: 0,
        },
    }
}

/// Sum of output values paying `address`, in satoshis
fn credited_sats(tx: &EsploraTx, address: &str) -> u64 {
    tx.vout
        .iter()
        .filter(|out| out.scriptpubkey_address.as_deref() == Some(address))
        .map(|out| out.value)
        .sum()
}

/// Block depth of a transaction, tip inclusive
fn confirmations(tip_height: u64, block_height: u64) -> u32 {
    tip_height.saturating_sub(block_height).saturating_add(1) as u32
}

/// Transaction as reported by esplora address listings
#[derive(Debug, Clone, Deserialize)]
struct EsploraTx {
    txid: String,
    status: EsploraTxStatus,
    #[serde(default)]
    vout: Vec<EsploraVout>,
}

#[derive(Debug, Clone, Deserialize)]
struct EsploraTxStatus {
    confirmed: bool,
    block_height: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct EsploraVout {
    scriptpubkey_address: Option<String>,
    value: u64,
}

/// Address stats from the esplora address endpoint
#[derive(Debug, Deserialize)]
struct EsploraAddressStats {
    chain_stats: EsploraFundingStats,
    mempool_stats: EsploraFundingStats,
}

#[derive(Debug, Deserialize)]
struct EsploraFundingStats {
    funded_txo_sum: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: &str = "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu";

    fn tx(txid: &str, confirmed: bool, height: Option<u64>, sats: u64) -> EsploraTx {
        EsploraTx {
            txid: txid.to_string(),
            status: EsploraTxStatus {
                confirmed,
                block_height: height,
            },
            vout: vec![
                EsploraVout {
                    scriptpubkey_address: Some(ADDR.to_string()),
                    value: sats,
                },
                // Change output to an unrelated address must not count
                EsploraVout {
                    scriptpubkey_address: Some("bc1qunrelated".to_string()),
                    value: 999_999,
                },
            ],
        }
    }

    #[test]
    fn test_no_transactions_is_no_payment() {
        assert_eq!(classify_txs(&[], ADDR, Some(800_000)), ProbeResult::NoPayment);
    }

    #[test]
    fn test_non_crediting_tx_is_no_payment() {
        let mut t = tx("abc", true, Some(799_998), 50_000);
        t.vout[0].scriptpubkey_address = Some("bc1qelsewhere".to_string());
        assert_eq!(
            classify_txs(&[t], ADDR, Some(800_000)),
            ProbeResult::NoPayment
        );
    }

    #[test]
    fn test_mempool_tx_is_pending() {
        let t = tx("abc", false, None, 222_222);
        assert_eq!(
            classify_txs(&[t], ADDR, Some(800_000)),
            ProbeResult::Pending {
                txid: Some("abc".to_string()),
                amount_btc: 0.00222222,
                confirmations: 0,
            }
        );
    }

    #[test]
    fn test_confirmed_tx_counts_depth_from_tip() {
        let t = tx("abc", true, Some(799_998), 1_000_000);
        assert_eq!(
            classify_txs(&[t], ADDR, Some(800_000)),
            ProbeResult::Confirmed {
                txid: "abc".to_string(),
                amount_btc: 0.01,
                confirmations: 3,
            }
        );
    }

    #[test]
    fn test_tip_at_block_height_is_one_confirmation() {
        let t = tx("abc", true, Some(800_000), 100_000);
        let result = classify_txs(&[t], ADDR, Some(800_000));
        assert!(matches!(
            result,
            ProbeResult::Confirmed {
                confirmations: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_confirmed_without_tip_downgrades_to_pending() {
        let t = tx("abc", true, Some(799_998), 100_000);
        assert!(matches!(
            classify_txs(&[t], ADDR, None),
            ProbeResult::Pending {
                confirmations: 0,
                ..
            }
        ));
    }

    #[test]
    fn test_most_recent_crediting_tx_wins() {
        // Esplora lists newest first: a mempool tx ahead of an old
        // confirmed one
        let newest = tx("new", false, None, 70_000);
        let older = tx("old", true, Some(700_000), 80_000);
        let result = classify_txs(&[newest, older], ADDR, Some(800_000));
        assert!(matches!(
            result,
            ProbeResult::Pending { txid: Some(t), .. } if t == "new"
        ));
    }

    #[test]
    fn test_credited_sum_spans_multiple_outputs() {
        let mut t = tx("abc", false, None, 30_000);
        t.vout.push(EsploraVout {
            scriptpubkey_address: Some(ADDR.to_string()),
            value: 20_000,
        });
        assert_eq!(credited_sats(&t, ADDR), 50_000);
    }

    #[test]
    fn test_parse_esplora_tx_listing() {
        let json = r#"[{
            "txid": "f4184fc596403b9d638783cf57adfe4c75c605f6356fbc91338530e9831e9e16",
            "status": {"confirmed": true, "block_height": 170, "block_time": 1231731025},
            "vout": [{"scriptpubkey_address": "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu", "value": 1000000000}]
        }]"#;
        let txs: Vec<EsploraTx> = serde_json::from_str(json).unwrap();
        assert_eq!(credited_sats(&txs[0], ADDR), 1_000_000_000);
        assert_eq!(txs[0].status.block_height, Some(170));
    }

    #[test]
    fn test_parse_address_stats() {
        let json = r#"{
            "address": "bc1qcr8te4kr609gcawutmrza0j4xv80jy8z306fyu",
            "chain_stats": {"funded_txo_count": 1, "funded_txo_sum": 5000, "spent_txo_sum": 0, "tx_count": 1},
            "mempool_stats": {"funded_txo_count": 0, "funded_txo_sum": 0, "spent_txo_sum": 0, "tx_count": 0}
        }"#;
        let stats: EsploraAddressStats = serde_json::from_str(json).unwrap();
        assert_eq!(stats.chain_stats.funded_txo_sum, 5000);
    }

    #[test]
    fn test_explorer_priority_by_network() {
        let mainnet = ChainProbe::new(Network::Bitcoin, Duration::from_secs(8));
        assert_eq!(mainnet.explorers.len(), 2);
        assert!(mainnet.explorers[0].contains("mempool.space"));
        assert!(mainnet.explorers[1].contains("blockstream.info"));

        let testnet = ChainProbe::new(Network::Testnet, Duration::from_secs(8));
        assert_eq!(testnet.explorers.len(), 1);
        assert!(testnet.explorers[0].contains("testnet4"));
    }
}
