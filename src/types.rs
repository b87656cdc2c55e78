//! Core data types used across the trading system

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Trading pair symbol using Arc<str> for cheap cloning
///
/// Symbols are cloned on every tick when passed between the cache, the
/// strategy, and the trade log. Using Arc<str> instead of String reduces
/// heap allocations from O(n) to O(1) per clone. Construction normalizes
/// to uppercase, matching the upstream exchange's symbol format.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(#[serde(with = "arc_str_serde")] std::sync::Arc<str>);

/// Custom serde for Arc<str>
mod arc_str_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(value: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Arc::from(s.as_str()))
    }
}

impl Symbol {
    pub fn new(s: impl AsRef<str>) -> Self {
        Symbol(std::sync::Arc::from(
            s.as_ref().trim().to_uppercase().as_str(),
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "buy",
            TradeSide::Sell => "sell",
        }
    }
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TradeSide {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(TradeSide::Buy),
            "sell" => Ok(TradeSide::Sell),
            other => Err(ValidationError::UnknownTradeSide(other.to_string())),
        }
    }
}

/// Validation errors for bot parameters
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("min_price ({min}) must be less than max_price ({max})")]
    MinNotBelowMax { min: f64, max: f64 },

    #[error("prices must be positive: min={min}, max={max}")]
    NonPositivePrice { min: f64, max: f64 },

    #[error("total_amount ({0}) must be positive")]
    NonPositiveAmount(f64),

    #[error("grid_levels must be at least 1")]
    ZeroGridLevels,

    #[error("sell_percentage ({0}) must be in (0, 100]")]
    SellPercentageOutOfRange(f64),

    #[error("unknown trade side: {0}")]
    UnknownTradeSide(String),
}

/// Grid strategy parameters shared by live bots, backtests, and the optimizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridParams {
    pub min_price: f64,
    pub max_price: f64,
    pub total_amount: f64,
    pub grid_levels: u32,
    pub sell_percentage: f64,
}

impl GridParams {
    /// Validate parameter ranges
    ///
    /// The strategy itself tolerates degenerate parameters (they simply
    /// produce no grid buys); this is the rejection surface for the
    /// collaborators above the core.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.min_price <= 0.0 || self.max_price <= 0.0 {
            return Err(ValidationError::NonPositivePrice {
                min: self.min_price,
                max: self.max_price,
            });
        }
        if self.min_price >= self.max_price {
            return Err(ValidationError::MinNotBelowMax {
                min: self.min_price,
                max: self.max_price,
            });
        }
        if self.total_amount <= 0.0 {
            return Err(ValidationError::NonPositiveAmount(self.total_amount));
        }
        if self.grid_levels < 1 {
            return Err(ValidationError::ZeroGridLevels);
        }
        if self.sell_percentage <= 0.0 || self.sell_percentage > 100.0 {
            return Err(ValidationError::SellPercentageOutOfRange(
                self.sell_percentage,
            ));
        }
        Ok(())
    }
}

/// A trading bot row from the durable store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    pub id: i64,
    pub user_id: i64,
    pub symbol: Symbol,
    pub is_active: bool,
    pub max_price: f64,
    pub min_price: f64,
    pub total_amount: f64,
    pub sell_percentage: f64,
    pub grid_levels: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BotConfig {
    /// The strategy-facing view of this bot's configuration
    pub fn grid_params(&self) -> GridParams {
        GridParams {
            min_price: self.min_price,
            max_price: self.max_price,
            total_amount: self.total_amount,
            grid_levels: self.grid_levels,
            sell_percentage: self.sell_percentage,
        }
    }
}

/// A single buy/sell decision emitted by the strategy for one tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeDecision {
    pub side: TradeSide,
    pub price: f64,
    pub quantity: f64,
}

/// Append-only trade log row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: i64,
    pub bot_id: i64,
    pub side: TradeSide,
    pub price: f64,
    pub quantity: f64,
    pub created_at: DateTime<Utc>,
}

/// OHLCV candlestick from the upstream exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    /// Open time in milliseconds since the unix epoch
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Per-symbol outcome of a screening sweep
///
/// Lives both in the incremental progress blob and as a durable
/// `screening_results` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreeningRow {
    pub symbol: String,
    pub best_pnl_pct: f64,
    pub best_min_price: f64,
    pub best_max_price: f64,
    pub best_grid_levels: u32,
    pub best_sell_percentage: f64,
    pub num_trades: usize,
    pub win_rate: f64,
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub test_pnl_pct: f64,
    pub test_win_rate: f64,
}
