//! Binance exchange API clients
//!
//! Public market-data client (no credentials) and the order execution
//! seam. Live order placement signs the urlencoded query with
//! HMAC-SHA256 per the exchange's signed-endpoint scheme; the simulated
//! executor is the default and never touches the network.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, info};
use url::form_urlencoded;

use crate::types::{Symbol, TradeSide};

type HmacSha256 = Hmac<Sha256>;

/// Generate an HMAC-SHA256 signature over a urlencoded query string
pub fn sign_query(query: &str, secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(query.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

// =============================================================================
// Public market data
// =============================================================================

#[derive(Debug, Deserialize)]
struct TickerPrice {
    symbol: String,
    price: String,
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SymbolInfo {
    symbol: String,
    status: String,
    quote_asset: String,
}

/// Public endpoints only: no API keys needed
#[derive(Debug, Clone)]
pub struct BinanceMarketClient {
    client: reqwest::Client,
    base_url: String,
}

impl BinanceMarketClient {
    pub fn new(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build HTTP client");

        BinanceMarketClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn get_price(&self, symbol: &Symbol) -> Result<f64> {
        let url = format!("{}/api/v3/ticker/price", self.base_url);
        let ticker: TickerPrice = self
            .client
            .get(&url)
            .query(&[("symbol", symbol.as_str())])
            .send()
            .await
            .context("failed to fetch ticker price")?
            .error_for_status()?
            .json()
            .await
            .context("failed to parse ticker price")?;

        ticker
            .price
            .parse()
            .context("ticker price is not a number")
    }

    /// Fetch multiple prices in one API call
    ///
    /// The upstream returns every symbol's last price; the result is
    /// filtered down to the requested set.
    pub async fn get_prices_batch(&self, symbols: &[Symbol]) -> Result<HashMap<String, f64>> {
        if symbols.is_empty() {
            return Ok(HashMap::new());
        }

        let url = format!("{}/api/v3/ticker/price", self.base_url);
        let tickers: Vec<TickerPrice> = self
            .client
            .get(&url)
            .send()
            .await
            .context("failed to fetch tickers")?
            .error_for_status()?
            .json()
            .await
            .context("failed to parse tickers")?;

        let wanted: HashSet<&str> = symbols.iter().map(|s| s.as_str()).collect();
        let mut prices = HashMap::new();
        for ticker in tickers {
            if wanted.contains(ticker.symbol.as_str()) {
                if let Ok(price) = ticker.price.parse() {
                    prices.insert(ticker.symbol, price);
                }
            }
        }
        Ok(prices)
    }

    /// All actively trading pairs for a quote asset, sorted
    pub async fn get_quote_symbols(&self, quote: &str) -> Result<Vec<String>> {
        let url = format!("{}/api/v3/exchangeInfo", self.base_url);
        let info: ExchangeInfo = self
            .client
            .get(&url)
            .send()
            .await
            .context("failed to fetch exchange info")?
            .error_for_status()?
            .json()
            .await
            .context("failed to parse exchange info")?;

        let mut symbols: Vec<String> = info
            .symbols
            .into_iter()
            .filter(|s| s.quote_asset == quote && s.status == "TRADING")
            .map(|s| s.symbol)
            .collect();
        symbols.sort();
        Ok(symbols)
    }
}

// =============================================================================
// Order execution
// =============================================================================

/// Order placement seam between the bot runtime and the exchange
///
/// The runtime calls this between a `decide` result and the trade-log
/// append; a failure aborts the remaining decisions for that tick.
#[async_trait]
pub trait OrderExecutor: Send + Sync {
    async fn place_market(&self, symbol: &Symbol, side: TradeSide, quantity: f64) -> Result<()>;
}

/// No-op executor for simulated trading (the default mode)
pub struct SimulatedExecutor;

#[async_trait]
impl OrderExecutor for SimulatedExecutor {
    async fn place_market(&self, symbol: &Symbol, side: TradeSide, quantity: f64) -> Result<()> {
        debug!("[SIM] {} {:.8} {}", side, quantity, symbol);
        Ok(())
    }
}

/// Authenticated client placing real market orders
pub struct BinanceOrderExecutor {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    api_secret: String,
}

impl BinanceOrderExecutor {
    pub fn new(base_url: &str, api_key: String, api_secret: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build HTTP client");

        BinanceOrderExecutor {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            api_secret,
        }
    }
}

/// Build the canonical market-order query string (unsigned)
fn market_order_query(symbol: &Symbol, side: TradeSide, quantity: f64, timestamp_ms: i64) -> String {
    form_urlencoded::Serializer::new(String::new())
        .append_pair("symbol", symbol.as_str())
        .append_pair("side", &side.as_str().to_uppercase())
        .append_pair("type", "MARKET")
        .append_pair("quantity", &format!("{quantity}"))
        .append_pair("timestamp", &format!("{timestamp_ms}"))
        .finish()
}

#[async_trait]
impl OrderExecutor for BinanceOrderExecutor {
    async fn place_market(&self, symbol: &Symbol, side: TradeSide, quantity: f64) -> Result<()> {
        let query = market_order_query(symbol, side, quantity, Utc::now().timestamp_millis());
        let signature = sign_query(&query, &self.api_secret);
        let url = format!(
            "{}/api/v3/order?{}&signature={}",
            self.base_url, query, signature
        );

        let response: serde_json::Value = self
            .client
            .post(&url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .context("failed to place order")?
            .error_for_status()
            .context("order rejected by exchange")?
            .json()
            .await
            .context("failed to parse order response")?;

        info!(
            "order executed: {} {:.8} {} - orderId={}",
            side.as_str().to_uppercase(),
            quantity,
            symbol,
            response.get("orderId").cloned().unwrap_or_default()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_query_known_vector() {
        // Signed-endpoint example from the exchange API documentation
        let secret = "NhqPtmdSJYdKjVHjA7PZj4Mge3R5YNiP1e3UZjInClVN65XAbvqqM6A7H5fATj0j";
        let query = "symbol=LTCBTC&side=BUY&type=LIMIT&timeInForce=GTC&quantity=1&price=0.1&recvWindow=5000&timestamp=1499827319559";
        assert_eq!(
            sign_query(query, secret),
            "c8db56825ae71d6d79447849e617115f4a920fa2acdcab2b053c4b2838bd6b71"
        );
    }

    #[test]
    fn test_sign_query_is_deterministic() {
        let a = sign_query("symbol=BTCUSDC&timestamp=1", "secret");
        let b = sign_query("symbol=BTCUSDC&timestamp=1", "secret");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_different_secrets_differ() {
        let query = "symbol=BTCUSDC&timestamp=1";
        assert_ne!(sign_query(query, "a"), sign_query(query, "b"));
    }

    #[test]
    fn test_market_order_query_fields() {
        let query = market_order_query(&Symbol::new("btcusdc"), TradeSide::Buy, 0.5, 1700000000000);
        assert_eq!(
            query,
            "symbol=BTCUSDC&side=BUY&type=MARKET&quantity=0.5&timestamp=1700000000000"
        );
    }

    #[test]
    fn test_market_order_query_sell_side() {
        let query = market_order_query(&Symbol::new("ETHUSDC"), TradeSide::Sell, 1.25, 1);
        assert!(query.contains("side=SELL"));
        assert!(query.contains("quantity=1.25"));
    }

    #[tokio::test]
    async fn test_simulated_executor_always_succeeds() {
        let result = SimulatedExecutor
            .place_market(&Symbol::new("BTCUSDC"), TradeSide::Buy, 0.1)
            .await;
        assert!(result.is_ok());
    }
}
