//! BTC/USD exchange rate oracle
//!
//! Fetches the spot price from several independent public sources in
//! parallel and returns the median, so a single misbehaving feed cannot
//! skew the quote. Successful results are cached in a single slot for
//! five minutes to bound upstream load; the cache is process-local and
//! repopulates on the first call after a restart.

use std::time::{Duration, Instant};

use futures::future::{join_all, BoxFuture};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Errors from the exchange rate oracle
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    /// Every upstream source failed or timed out
    #[error("no price sources available")]
    NoPricesAvailable,
}

struct CachedPrice {
    price: f64,
    fetched_at: Instant,
}

/// Median-of-sources BTC/USD price oracle with a single-slot TTL cache
pub struct RateOracle {
    client: reqwest::Client,
    timeout: Duration,
    cache_ttl: Duration,
    cache: Mutex<Option<CachedPrice>>,
}

impl RateOracle {
    /// Create an oracle with the given per-request timeout and cache TTL
    pub fn new(timeout: Duration, cache_ttl: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
            cache_ttl,
            cache: Mutex::new(None),
        }
    }

    /// Current USD price of one BTC.
    ///
    /// Returns the cached value when it is younger than the TTL; a
    /// cache hit is indistinguishable from a miss except for latency.
    pub async fn price(&self) -> Result<f64, OracleError> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.fetched_at.elapsed() < self.cache_ttl {
                debug!("Oracle cache hit: {} USD/BTC", cached.price);
                return Ok(cached.price);
            }
        }

        let price = self.fetch_median().await?;
        *cache = Some(CachedPrice {
            price,
            fetched_at: Instant::now(),
        });
        Ok(price)
    }

    /// Fan out to all sources and take the median of the successes
    async fn fetch_median(&self) -> Result<f64, OracleError> {
        let sources: Vec<BoxFuture<'_, anyhow::Result<f64>>> = vec![
            Box::pin(self.fetch_coinbase()),
            Box::pin(self.fetch_kraken()),
            Box::pin(self.fetch_binance()),
        ];
        let results = join_all(sources).await;

        let mut prices: Vec<f64> = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(price) if price.is_finite() && price > 0.0 => prices.push(price),
                Ok(price) => warn!("Price source returned nonsense quote: {}", price),
                Err(e) => warn!("Price source failed: {}", e),
            }
        }

        if prices.is_empty() {
            return Err(OracleError::NoPricesAvailable);
        }

        let price = median(&mut prices);
        debug!(
            "Fetched BTC/USD median {} from {} source(s)",
            price,
            prices.len()
        );
        Ok(price)
    }

    async fn fetch_coinbase(&self) -> anyhow::Result<f64> {
        let response: CoinbaseSpot = self
            .client
            .get("https://api.coinbase.com/v2/prices/BTC-USD/spot")
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.data.amount.parse()?)
    }

    async fn fetch_kraken(&self) -> anyhow::Result<f64> {
        let response: KrakenTicker = self
            .client
            .get("https://api.kraken.com/0/public/Ticker?pair=XBTUSD")
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        parse_kraken(&response)
    }

    async fn fetch_binance(&self) -> anyhow::Result<f64> {
        let response: BinanceTicker = self
            .client
            .get("https://api.binance.com/api/v3/ticker/price?symbol=BTCUSDT")
            .timeout(self.timeout)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.price.parse()?)
    }

    #[cfg(test)]
    pub(crate) async fn seed_cache(&self, price: f64) {
        *self.cache.lock().await = Some(CachedPrice {
            price,
            fetched_at: Instant::now(),
        });
    }
}

/// Median of a non-empty slice; mean of the middle pair for even counts
fn median(prices: &mut [f64]) -> f64 {
    prices.sort_by(|a, b| a.partial_cmp(b).expect("no NaN prices"));
    let mid = prices.len() / 2;
    if prices.len() % 2 == 0 {
        (prices[mid - 1] + prices[mid]) / 2.0
    } else {
        prices[mid]
    }
}

/// Response from the Coinbase spot price endpoint
#[derive(Debug, serde::Deserialize)]
struct CoinbaseSpot {
    data: CoinbaseSpotData,
}

#[derive(Debug, serde::Deserialize)]
struct CoinbaseSpotData {
    amount: String,
}

/// Response from the Kraken public ticker. The result is keyed by
/// Kraken's internal pair name (XXBTZUSD), so the map is drained rather
/// than indexed.
#[derive(Debug, serde::Deserialize)]
struct KrakenTicker {
    #[serde(default)]
    result: std::collections::HashMap<String, KrakenPair>,
}

#[derive(Debug, serde::Deserialize)]
struct KrakenPair {
    /// Last trade closed: [price, lot volume]
    c: Vec<String>,
}

fn parse_kraken(ticker: &KrakenTicker) -> anyhow::Result<f64> {
    let pair = ticker
        .result
        .values()
        .next()
        .ok_or_else(|| anyhow::anyhow!("Kraken ticker result is empty"))?;
    let last = pair
        .c
        .first()
        .ok_or_else(|| anyhow::anyhow!("Kraken ticker has no last trade"))?;
    Ok(last.parse()?)
}

/// Response from the Binance ticker price endpoint
#[derive(Debug, serde::Deserialize)]
struct BinanceTicker {
    price: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median_odd() {
        let mut prices = vec![45_100.0, 44_900.0, 45_000.0];
        assert_eq!(median(&mut prices), 45_000.0);
    }

    #[test]
    fn test_median_even() {
        let mut prices = vec![45_200.0, 44_800.0, 45_000.0, 45_100.0];
        assert_eq!(median(&mut prices), 45_050.0);
    }

    #[test]
    fn test_median_single() {
        let mut prices = vec![42_000.0];
        assert_eq!(median(&mut prices), 42_000.0);
    }

    #[test]
    fn test_median_resists_outlier() {
        let mut prices = vec![45_000.0, 45_100.0, 1.0];
        assert_eq!(median(&mut prices), 45_000.0);
    }

    #[test]
    fn test_parse_coinbase() {
        let json = r#"{"data":{"base":"BTC","currency":"USD","amount":"45000.00"}}"#;
        let spot: CoinbaseSpot = serde_json::from_str(json).unwrap();
        assert_eq!(spot.data.amount.parse::<f64>().unwrap(), 45_000.0);
    }

    #[test]
    fn test_parse_kraken() {
        let json = r#"{"error":[],"result":{"XXBTZUSD":{"a":["45001.0","1","1.0"],"c":["45000.50","0.002"]}}}"#;
        let ticker: KrakenTicker = serde_json::from_str(json).unwrap();
        assert_eq!(parse_kraken(&ticker).unwrap(), 45_000.50);
    }

    #[test]
    fn test_parse_kraken_empty_result() {
        let json = r#"{"error":["EQuery:Unknown asset pair"]}"#;
        let ticker: KrakenTicker = serde_json::from_str(json).unwrap();
        assert!(parse_kraken(&ticker).is_err());
    }

    #[test]
    fn test_parse_binance() {
        let json = r#"{"symbol":"BTCUSDT","price":"44999.99"}"#;
        let ticker: BinanceTicker = serde_json::from_str(json).unwrap();
        assert_eq!(ticker.price.parse::<f64>().unwrap(), 44_999.99);
    }

    #[tokio::test]
    async fn test_cache_hit_skips_upstream() {
        let oracle = RateOracle::new(Duration::from_secs(5), Duration::from_secs(300));
        oracle.seed_cache(45_000.0).await;
        // A fresh cache entry is served without touching any source
        assert_eq!(oracle.price().await.unwrap(), 45_000.0);
    }
}
