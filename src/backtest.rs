//! Backtesting engine
//!
//! Replays a historical close-price series through the same `decide`
//! function the live bots run, with a taker-fee model and FIFO matching
//! for P&L accounting.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::config::StrategyTunables;
use crate::strategy::{decide, BotState};
use crate::types::{GridParams, TradeSide};

/// Metrics from a single backtest run, with the parameters echoed back
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub total_pnl: f64,
    pub total_pnl_pct: f64,
    pub num_trades: usize,
    pub num_buys: usize,
    pub num_sells: usize,
    /// Fraction of sells closed at a profit, in [0, 1]
    pub win_rate: f64,
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub final_open_positions: usize,
    pub unrealized_pnl: f64,

    // Parameters used
    pub min_price: f64,
    pub max_price: f64,
    pub grid_levels: u32,
    pub sell_percentage: f64,
    pub total_amount: f64,
}

impl BacktestResult {
    fn zero(params: &GridParams) -> Self {
        BacktestResult {
            total_pnl: 0.0,
            total_pnl_pct: 0.0,
            num_trades: 0,
            num_buys: 0,
            num_sells: 0,
            win_rate: 0.0,
            max_drawdown: 0.0,
            sharpe_ratio: 0.0,
            final_open_positions: 0,
            unrealized_pnl: 0.0,
            min_price: params.min_price,
            max_price: params.max_price,
            grid_levels: params.grid_levels,
            sell_percentage: params.sell_percentage,
            total_amount: params.total_amount,
        }
    }
}

/// Run a single backtest simulation
///
/// `close_prices` must be chronological, oldest first. The engine keeps
/// its own FIFO of open (price, quantity) lots mirroring the strategy's
/// positions; each sell is matched against the oldest unmatched buy.
pub fn run_backtest(
    _symbol: &str,
    close_prices: &[f64],
    params: &GridParams,
    tunables: &StrategyTunables,
) -> BacktestResult {
    if close_prices.is_empty() {
        return BacktestResult::zero(params);
    }

    let fee_pct = tunables.fee_pct;
    let total_amount = params.total_amount;

    let mut state = BotState::Idle;
    let mut previous_price: Option<f64> = None;

    // (entry_price, quantity) lots for accounting only
    let mut open_buys: VecDeque<(f64, f64)> = VecDeque::new();
    let mut realized_pnl = 0.0;
    let mut winning_sells = 0usize;
    let mut num_buys = 0usize;
    let mut num_sells = 0usize;

    let mut equity_curve: Vec<f64> = Vec::with_capacity(close_prices.len());
    let mut peak_equity = total_amount;
    let mut max_drawdown = 0.0;

    for &price in close_prices {
        let (decisions, next_state) = decide(params, tunables, price, previous_price, state);
        state = next_state;

        for decision in &decisions {
            match decision.side {
                TradeSide::Buy => {
                    num_buys += 1;
                    open_buys.push_back((decision.price, decision.quantity));
                }
                TradeSide::Sell => {
                    num_sells += 1;
                    let sell_value = decision.price * decision.quantity;
                    let sell_fee = sell_value * fee_pct;
                    if let Some((buy_price, buy_qty)) = open_buys.pop_front() {
                        let buy_cost = buy_price * buy_qty;
                        let buy_fee = buy_cost * fee_pct;
                        let trade_pnl = sell_value - sell_fee - buy_cost - buy_fee;
                        realized_pnl += trade_pnl;
                        if trade_pnl > 0.0 {
                            winning_sells += 1;
                        }
                    }
                }
            }
        }

        // Equity: budget plus realized gains plus open lots marked to price
        let invested: f64 = open_buys
            .iter()
            .map(|(bp, bq)| bp * bq + bp * bq * fee_pct)
            .sum();
        let open_value: f64 = open_buys.iter().map(|(_, bq)| bq * price).sum();
        let equity = total_amount + realized_pnl + (open_value - invested);

        equity_curve.push(equity);
        if equity > peak_equity {
            peak_equity = equity;
        }
        if peak_equity > 0.0 {
            let drawdown = (peak_equity - equity) / peak_equity;
            if drawdown > max_drawdown {
                max_drawdown = drawdown;
            }
        }

        previous_price = Some(price);
    }

    // Unrealized P&L from the lots still open at the last price
    let last_price = *close_prices.last().unwrap();
    let unrealized_pnl: f64 = open_buys
        .iter()
        .map(|(bp, bq)| bq * last_price - (bp * bq + bp * bq * fee_pct))
        .sum();

    let total_pnl = realized_pnl + unrealized_pnl;
    let win_rate = if num_sells > 0 {
        winning_sells as f64 / num_sells as f64
    } else {
        0.0
    };
    let total_pnl_pct = if total_amount > 0.0 {
        total_pnl / total_amount * 100.0
    } else {
        0.0
    };

    BacktestResult {
        total_pnl,
        total_pnl_pct,
        num_trades: num_buys + num_sells,
        num_buys,
        num_sells,
        win_rate,
        max_drawdown,
        sharpe_ratio: sharpe_ratio(&equity_curve),
        final_open_positions: open_buys.len(),
        unrealized_pnl,
        min_price: params.min_price,
        max_price: params.max_price,
        grid_levels: params.grid_levels,
        sell_percentage: params.sell_percentage,
        total_amount,
    }
}

/// Simplified Sharpe ratio over per-tick simple returns
///
/// Population variance, standard deviation floored at 1e-10, scaled by
/// the square root of the number of returns.
fn sharpe_ratio(equity_curve: &[f64]) -> f64 {
    if equity_curve.len() < 2 {
        return 0.0;
    }

    let returns: Vec<f64> = equity_curve
        .windows(2)
        .filter(|w| w[0] != 0.0)
        .map(|w| (w[1] - w[0]) / w[0])
        .collect();
    if returns.is_empty() {
        return 0.0;
    }

    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    let std_dev = if variance > 0.0 {
        variance.sqrt()
    } else {
        1e-10
    };

    mean / std_dev * n.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn params() -> GridParams {
        GridParams {
            min_price: 100.0,
            max_price: 200.0,
            total_amount: 1000.0,
            grid_levels: 10,
            sell_percentage: 2.0,
        }
    }

    fn tunables() -> StrategyTunables {
        StrategyTunables {
            fee_pct: 0.002,
            buy_pullback_pct: 0.002,
            sell_pullback_pct: 0.002,
        }
    }

    #[test]
    fn test_empty_input_yields_zero_result() {
        let result = run_backtest("BTCUSDC", &[], &params(), &tunables());
        assert_eq!(result.num_trades, 0);
        assert_eq!(result.total_pnl, 0.0);
        assert_eq!(result.sharpe_ratio, 0.0);
        assert_eq!(result.max_drawdown, 0.0);
        assert_eq!(result.final_open_positions, 0);
    }

    #[test]
    fn test_trade_counts_are_consistent() {
        let prices = [
            150.0, 142.0, 139.0, 139.5, 139.3, 122.0, 119.0, 119.5, 119.3, 124.0, 123.5, 123.0,
            143.0, 145.0, 144.5, 155.0, 154.5,
        ];
        let result = run_backtest("BTCUSDC", &prices, &params(), &tunables());

        assert_eq!(result.num_trades, result.num_buys + result.num_sells);
        assert!(result.num_sells <= result.num_buys);
        assert_eq!(
            result.final_open_positions,
            result.num_buys - result.num_sells
        );
    }

    #[test]
    fn test_full_cycle_closes_every_position() {
        // Three grid buys on the way down, three pullback sells on the
        // way back up
        let prices = [
            150.0, 142.0, 139.0, 139.5, 139.3, 122.0, 119.0, 119.5, 119.3, 124.0, 123.5, 123.0,
            143.0, 145.0, 144.5, 155.0, 154.5,
        ];
        let result = run_backtest("BTCUSDC", &prices, &params(), &tunables());

        assert_eq!(result.num_buys, 3);
        assert_eq!(result.num_sells, 3);
        assert_eq!(result.final_open_positions, 0);
        assert_eq!(result.unrealized_pnl, 0.0);
        assert!(result.total_pnl > 0.0);
        assert_eq!(result.win_rate, 1.0);
    }

    #[test]
    fn test_pnl_pct_matches_pnl() {
        let prices = [
            150.0, 142.0, 139.0, 139.5, 139.3, 122.0, 119.0, 119.5, 119.3, 124.0, 123.5, 123.0,
            143.0, 145.0, 144.5, 155.0, 154.5,
        ];
        let result = run_backtest("BTCUSDC", &prices, &params(), &tunables());
        assert_relative_eq!(
            result.total_pnl_pct * result.total_amount / 100.0,
            result.total_pnl,
            epsilon = 0.01
        );
    }

    #[test]
    fn test_drawdown_and_win_rate_bounds() {
        let prices = [150.0, 142.0, 140.0, 139.0, 139.4, 139.3, 120.0, 110.0];
        let result = run_backtest("BTCUSDC", &prices, &params(), &tunables());
        assert!(result.max_drawdown >= 0.0);
        assert!((0.0..=1.0).contains(&result.win_rate));
    }

    #[test]
    fn test_open_positions_carry_unrealized_loss() {
        // One buy, then the market drops and stays down
        let prices = [150.0, 130.0, 120.0, 110.0];
        let result = run_backtest("BTCUSDC", &prices, &params(), &tunables());
        assert!(result.num_buys >= 1);
        assert_eq!(result.num_sells, 0);
        assert!(result.unrealized_pnl < 0.0);
        assert_relative_eq!(result.total_pnl, result.unrealized_pnl);
    }

    #[test]
    fn test_out_of_band_prices_produce_no_trades() {
        let p = GridParams {
            min_price: 100.0,
            max_price: 150.0,
            ..params()
        };
        let result = run_backtest("BTCUSDC", &[200.0; 10], &p, &tunables());
        assert_eq!(result.num_trades, 0);
        assert_eq!(result.total_pnl, 0.0);
    }

    #[test]
    fn test_fees_reduce_realized_pnl() {
        let prices = [100.0, 102.5, 102.0];
        let free = StrategyTunables {
            fee_pct: 0.0,
            ..tunables()
        };
        let with_fees = run_backtest("BTCUSDC", &prices, &params(), &tunables());
        let without = run_backtest("BTCUSDC", &prices, &params(), &free);
        assert!(with_fees.total_pnl < without.total_pnl);
    }

    #[test]
    fn test_sharpe_flat_curve_is_zero() {
        assert_eq!(sharpe_ratio(&[1000.0, 1000.0, 1000.0]), 0.0);
    }
}
