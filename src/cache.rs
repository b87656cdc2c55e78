//! Volatile price and state store
//!
//! Short-TTL Redis fanout shared by every bot runtime: the ingest worker
//! writes prices, bots read them and persist their own state blobs, the
//! screening job publishes incremental progress. All values are JSON.

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::strategy::BotState;
use crate::types::Symbol;

/// Default TTL for a single cached price, in seconds
pub const PRICE_TTL_SECS: u64 = 10;
/// Default TTL for the cached symbol universe, in seconds
pub const SYMBOLS_TTL_SECS: u64 = 3600;
/// Default TTL for a screening progress blob, in seconds
pub const PROGRESS_TTL_SECS: u64 = 3600;

/// Cached price payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedPrice {
    pub price: f64,
    /// Unix seconds at write time
    pub timestamp: f64,
    pub source: String,
}

/// Redis-backed cache client
///
/// Cheap to clone; the underlying connection manager multiplexes and
/// reconnects on its own.
#[derive(Clone)]
pub struct PriceCache {
    conn: ConnectionManager,
}

fn price_key(symbol: &str) -> String {
    format!("price:{}", symbol.to_uppercase())
}

fn symbols_key(quote: &str) -> String {
    format!("symbols:{}", quote.to_uppercase())
}

fn bot_state_key(bot_id: i64) -> String {
    format!("bot_state:{bot_id}")
}

fn progress_key(task_id: &str) -> String {
    format!("screening:{task_id}")
}

fn now_unix() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

impl PriceCache {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis URL")?;
        let conn = client
            .get_connection_manager()
            .await
            .context("failed to connect to redis")?;
        Ok(PriceCache { conn })
    }

    /// Store a single price with a TTL
    pub async fn set_price(&self, symbol: &Symbol, price: f64, ttl_secs: u64) -> Result<()> {
        let payload = serde_json::to_string(&CachedPrice {
            price,
            timestamp: now_unix(),
            source: "binance".to_string(),
        })?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(price_key(symbol.as_str()), payload, ttl_secs)
            .await
            .context("redis set_price failed")?;
        Ok(())
    }

    /// Retrieve a price, `None` when missing or expired
    pub async fn get_price(&self, symbol: &Symbol) -> Result<Option<f64>> {
        let mut conn = self.conn.clone();
        let data: Option<String> = conn
            .get(price_key(symbol.as_str()))
            .await
            .context("redis get_price failed")?;
        match data {
            Some(json) => {
                let cached: CachedPrice = serde_json::from_str(&json)?;
                Ok(Some(cached.price))
            }
            None => Ok(None),
        }
    }

    /// Store a batch of prices atomically in one pipeline
    pub async fn set_prices_batch(
        &self,
        prices: &HashMap<String, f64>,
        ttl_secs: u64,
    ) -> Result<()> {
        if prices.is_empty() {
            return Ok(());
        }

        let timestamp = now_unix();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for (symbol, &price) in prices {
            let payload = serde_json::to_string(&CachedPrice {
                price,
                timestamp,
                source: "binance".to_string(),
            })?;
            pipe.set_ex(price_key(symbol), payload, ttl_secs).ignore();
        }

        let mut conn = self.conn.clone();
        pipe.query_async::<()>(&mut conn)
            .await
            .context("redis batch price write failed")?;
        Ok(())
    }

    /// Cache the symbol universe for a quote asset
    pub async fn set_symbols(&self, quote: &str, symbols: &[String], ttl_secs: u64) -> Result<()> {
        let payload = serde_json::to_string(symbols)?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(symbols_key(quote), payload, ttl_secs)
            .await
            .context("redis set_symbols failed")?;
        Ok(())
    }

    pub async fn get_symbols(&self, quote: &str) -> Result<Option<Vec<String>>> {
        let mut conn = self.conn.clone();
        let data: Option<String> = conn
            .get(symbols_key(quote))
            .await
            .context("redis get_symbols failed")?;
        Ok(match data {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        })
    }

    /// Persist a bot's strategy state (no TTL; deleted on teardown)
    pub async fn set_bot_state(&self, bot_id: i64, state: &BotState) -> Result<()> {
        let payload = serde_json::to_string(state)?;
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(bot_state_key(bot_id), payload)
            .await
            .context("redis set_bot_state failed")?;
        Ok(())
    }

    pub async fn get_bot_state(&self, bot_id: i64) -> Result<Option<BotState>> {
        let mut conn = self.conn.clone();
        let data: Option<String> = conn
            .get(bot_state_key(bot_id))
            .await
            .context("redis get_bot_state failed")?;
        Ok(match data {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        })
    }

    pub async fn delete_bot_state(&self, bot_id: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(bot_state_key(bot_id))
            .await
            .context("redis delete_bot_state failed")?;
        Ok(())
    }

    /// Publish a screening progress blob
    pub async fn set_progress<T: Serialize>(
        &self,
        task_id: &str,
        progress: &T,
        ttl_secs: u64,
    ) -> Result<()> {
        let payload = serde_json::to_string(progress)?;
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(progress_key(task_id), payload, ttl_secs)
            .await
            .context("redis set_progress failed")?;
        Ok(())
    }

    pub async fn get_progress<T: DeserializeOwned>(&self, task_id: &str) -> Result<Option<T>> {
        let mut conn = self.conn.clone();
        let data: Option<String> = conn
            .get(progress_key(task_id))
            .await
            .context("redis get_progress failed")?;
        Ok(match data {
            Some(json) => Some(serde_json::from_str(&json)?),
            None => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_formats() {
        assert_eq!(price_key("btcusdc"), "price:BTCUSDC");
        assert_eq!(symbols_key("usdc"), "symbols:USDC");
        assert_eq!(bot_state_key(42), "bot_state:42");
        assert_eq!(progress_key("abc-123"), "screening:abc-123");
    }

    #[test]
    fn test_cached_price_payload_shape() {
        let cached = CachedPrice {
            price: 42000.5,
            timestamp: 1700000000.0,
            source: "binance".to_string(),
        };
        let json = serde_json::to_value(&cached).unwrap();
        assert_eq!(json["price"], 42000.5);
        assert_eq!(json["source"], "binance");
        let back: CachedPrice = serde_json::from_value(json).unwrap();
        assert_eq!(back.price, cached.price);
    }
}
