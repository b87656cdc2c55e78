//! Configuration management
//!
//! Environment-driven settings with `.env` support. Strategy tunables are
//! carried as a value type and injected into the strategy engine and the
//! bot runtime so tests can parameterize them without touching process
//! environment.

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Strategy constants shared by the live loop, the backtester, and the
/// optimizer
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrategyTunables {
    /// Taker fee as a fraction of trade value (0.001 = 0.1%)
    pub fee_pct: f64,
    /// Pullback above the local low required before a grid buy fires
    pub buy_pullback_pct: f64,
    /// Pullback below the position high required before a sell fires
    pub sell_pullback_pct: f64,
}

impl Default for StrategyTunables {
    fn default() -> Self {
        StrategyTunables {
            fee_pct: 0.001,
            buy_pullback_pct: 0.002,
            sell_pullback_pct: 0.002,
        }
    }
}

/// Process-level configuration
#[derive(Debug, Clone)]
pub struct Settings {
    /// SQLite database file for bots, trades, and screening results
    pub database_path: PathBuf,
    /// Redis connection URL for the price/state fanout
    pub redis_url: String,
    /// Upstream exchange REST base URL
    pub binance_base_url: String,
    /// Upstream exchange WebSocket URL for the aggregate ticker stream
    pub binance_ws_url: String,
    pub binance_api_key: Option<String>,
    pub binance_secret_key: Option<String>,
    /// When false (the default), the runtime records simulated trades and
    /// never touches the order endpoint
    pub binance_live_trading: bool,
    pub tunables: StrategyTunables,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            database_path: PathBuf::from("data/gridbot.db"),
            redis_url: "redis://localhost:6379/0".to_string(),
            binance_base_url: "https://api.binance.com".to_string(),
            binance_ws_url: "wss://stream.binance.com:9443/ws/!ticker@arr".to_string(),
            binance_api_key: None,
            binance_secret_key: None,
            binance_live_trading: false,
            tunables: StrategyTunables::default(),
        }
    }
}

impl Settings {
    /// Load settings from the environment, falling back to defaults
    ///
    /// Call `dotenv::dotenv().ok()` before this if a `.env` file should be
    /// honored (the binary does so at startup).
    pub fn from_env() -> Self {
        let defaults = Settings::default();

        Settings {
            database_path: env::var("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            redis_url: env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            binance_base_url: env::var("BINANCE_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(defaults.binance_base_url),
            binance_ws_url: env::var("BINANCE_WS_URL").unwrap_or(defaults.binance_ws_url),
            binance_api_key: env::var("BINANCE_API_KEY").ok(),
            binance_secret_key: env::var("BINANCE_SECRET_KEY").ok(),
            binance_live_trading: env_flag("BINANCE_LIVE_TRADING", false),
            tunables: StrategyTunables {
                fee_pct: env_f64("FEE_PCT", defaults.tunables.fee_pct),
                buy_pullback_pct: env_f64("BUY_PULLBACK_PCT", defaults.tunables.buy_pullback_pct),
                sell_pullback_pct: env_f64(
                    "SELL_PULLBACK_PCT",
                    defaults.tunables.sell_pullback_pct,
                ),
            },
        }
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tunables() {
        let t = StrategyTunables::default();
        assert_eq!(t.fee_pct, 0.001);
        assert_eq!(t.buy_pullback_pct, 0.002);
        assert_eq!(t.sell_pullback_pct, 0.002);
    }

    #[test]
    fn test_defaults_point_at_local_services() {
        let s = Settings::default();
        assert!(s.redis_url.starts_with("redis://"));
        assert!(s.binance_base_url.starts_with("https://"));
        assert!(!s.binance_live_trading);
    }
}
