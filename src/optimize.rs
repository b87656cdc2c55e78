//! Parameter optimization framework
//!
//! Enumerative grid search over backtests with a train/test split.
//! Candidate price bands are derived from percentiles of the training
//! series so the search never wastes combinations on unrealistic ranges.

use itertools::iproduct;
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use thiserror::Error;
use tracing::info;

use crate::backtest::{run_backtest, BacktestResult};
use crate::config::StrategyTunables;
use crate::types::GridParams;

pub const DEFAULT_GRID_LEVELS: &[u32] = &[3, 5, 7, 10, 15, 20];
pub const DEFAULT_SELL_PERCENTAGES: &[f64] = &[0.5, 1.0, 1.5, 2.0, 3.0, 5.0];
/// Reduced option sets for the full-market screening job
pub const SCREENING_GRID_LEVELS: &[u32] = &[5, 10, 15];
pub const SCREENING_SELL_PERCENTAGES: &[f64] = &[1.0, 2.0, 3.0, 5.0];

#[derive(Debug, Error)]
pub enum OptimizeError {
    #[error("no valid parameter combinations for {0}")]
    NoValidCombinations(String),
}

/// Best parameter set with train and test metrics
#[derive(Debug, Clone)]
pub struct OptimizationResult {
    pub best_params: BacktestResult,
    pub test_result: BacktestResult,
    pub all_results: Vec<BacktestResult>,
    pub train_size: usize,
    pub test_size: usize,
}

/// Generate parameter combinations based on the price distribution
///
/// Min-price candidates come from the 5/10/15/25th percentiles, max-price
/// candidates from the 75/85/90/95th. Combinations whose band is thinner
/// than 2% are skipped.
pub fn generate_parameter_grid(
    close_prices: &[f64],
    grid_levels_options: Option<&[u32]>,
    sell_percentage_options: Option<&[f64]>,
) -> Vec<GridParams> {
    let grid_levels_options = grid_levels_options.unwrap_or(DEFAULT_GRID_LEVELS);
    let sell_percentage_options = sell_percentage_options.unwrap_or(DEFAULT_SELL_PERCENTAGES);

    if close_prices.is_empty() {
        return Vec::new();
    }

    let mut sorted = close_prices.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let n = sorted.len();
    let percentile = |p: usize| -> f64 { sorted[(n * p / 100).min(n - 1)] };

    let mut min_candidates: Vec<f64> = [5, 10, 15, 25].iter().map(|&p| percentile(p)).collect();
    let mut max_candidates: Vec<f64> = [75, 85, 90, 95].iter().map(|&p| percentile(p)).collect();
    min_candidates.sort_by(|a, b| a.total_cmp(b));
    min_candidates.dedup();
    max_candidates.sort_by(|a, b| a.total_cmp(b));
    max_candidates.dedup();

    iproduct!(
        &min_candidates,
        &max_candidates,
        grid_levels_options,
        sell_percentage_options
    )
    .filter(|(&min_p, &max_p, _, _)| max_p > min_p * 1.02)
    .map(|(&min_p, &max_p, &levels, &sell_pct)| GridParams {
        min_price: min_p,
        max_price: max_p,
        total_amount: 0.0, // filled in by the caller
        grid_levels: levels,
        sell_percentage: sell_pct,
    })
    .collect()
}

/// Run grid-search optimization with a train/test split
///
/// The first `train_ratio` of the series selects parameters (best by
/// `total_pnl_pct`), the remainder evaluates the winner out of sample.
/// Backtests across combinations run in parallel.
#[allow(clippy::too_many_arguments)]
pub fn optimize_parameters(
    symbol: &str,
    close_prices: &[f64],
    total_amount: f64,
    train_ratio: f64,
    grid_levels_options: Option<&[u32]>,
    sell_percentage_options: Option<&[f64]>,
    top_n: usize,
    tunables: &StrategyTunables,
) -> Result<OptimizationResult, OptimizeError> {
    let train_ratio = train_ratio.clamp(0.5, 0.9);
    let split_idx = (close_prices.len() as f64 * train_ratio) as usize;
    let (train_prices, test_prices) = close_prices.split_at(split_idx);

    let combos: Vec<GridParams> =
        generate_parameter_grid(train_prices, grid_levels_options, sell_percentage_options)
            .into_iter()
            .map(|p| GridParams {
                total_amount,
                ..p
            })
            .collect();

    info!(
        "Optimizing {}: {} combinations on {} train prices",
        symbol,
        combos.len(),
        train_prices.len()
    );

    let mut results: Vec<BacktestResult> = combos
        .par_iter()
        .map(|params| run_backtest(symbol, train_prices, params, tunables))
        .collect();

    results.sort_by_key(|r| std::cmp::Reverse(OrderedFloat(r.total_pnl_pct)));

    let best = results
        .first()
        .cloned()
        .ok_or_else(|| OptimizeError::NoValidCombinations(symbol.to_string()))?;

    // Validate the winning parameters out of sample
    let best_params = GridParams {
        min_price: best.min_price,
        max_price: best.max_price,
        total_amount,
        grid_levels: best.grid_levels,
        sell_percentage: best.sell_percentage,
    };
    let test_result = run_backtest(symbol, test_prices, &best_params, tunables);

    results.truncate(top_n);

    Ok(OptimizationResult {
        best_params: best,
        test_result,
        all_results: results,
        train_size: train_prices.len(),
        test_size: test_prices.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A gently oscillating series long enough for a meaningful split
    fn wavy_prices(n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| 100.0 + 20.0 * ((i as f64) * 0.3).sin() + (i % 7) as f64)
            .collect()
    }

    #[test]
    fn test_grid_candidates_respect_band_filter() {
        let combos = generate_parameter_grid(&wavy_prices(500), None, None);
        assert!(!combos.is_empty());
        for combo in &combos {
            assert!(combo.max_price > combo.min_price * 1.02);
        }
    }

    #[test]
    fn test_grid_uses_provided_options() {
        let combos = generate_parameter_grid(&wavy_prices(500), Some(&[5]), Some(&[2.0]));
        assert!(!combos.is_empty());
        assert!(combos.iter().all(|c| c.grid_levels == 5));
        assert!(combos.iter().all(|c| c.sell_percentage == 2.0));
    }

    #[test]
    fn test_grid_empty_input() {
        assert!(generate_parameter_grid(&[], None, None).is_empty());
    }

    #[test]
    fn test_constant_prices_have_no_band() {
        // Every percentile collapses to the same value, so no combination
        // survives the 2% band filter
        let combos = generate_parameter_grid(&[100.0; 300], None, None);
        assert!(combos.is_empty());
    }

    #[test]
    fn test_optimize_splits_and_ranks() {
        let prices = wavy_prices(600);
        let result = optimize_parameters(
            "BTCUSDC",
            &prices,
            1000.0,
            0.7,
            Some(SCREENING_GRID_LEVELS),
            Some(SCREENING_SELL_PERCENTAGES),
            10,
            &StrategyTunables::default(),
        )
        .unwrap();

        assert_eq!(result.train_size, 420);
        assert_eq!(result.test_size, 180);
        assert!(result.all_results.len() <= 10);
        for pair in result.all_results.windows(2) {
            assert!(pair[0].total_pnl_pct >= pair[1].total_pnl_pct);
        }
        assert_eq!(
            result.best_params.total_pnl_pct,
            result.all_results[0].total_pnl_pct
        );
        // The echoed parameters on the test run match the winner
        assert_eq!(result.test_result.grid_levels, result.best_params.grid_levels);
        assert_eq!(
            result.test_result.sell_percentage,
            result.best_params.sell_percentage
        );
    }

    #[test]
    fn test_optimize_flat_series_fails() {
        let err = optimize_parameters(
            "FLATUSDC",
            &[100.0; 400],
            1000.0,
            0.7,
            None,
            None,
            10,
            &StrategyTunables::default(),
        )
        .unwrap_err();
        assert!(matches!(err, OptimizeError::NoValidCombinations(_)));
    }

    #[test]
    fn test_train_ratio_is_clamped() {
        let prices = wavy_prices(400);
        let result = optimize_parameters(
            "BTCUSDC",
            &prices,
            1000.0,
            0.99,
            Some(&[5]),
            Some(&[2.0]),
            5,
            &StrategyTunables::default(),
        )
        .unwrap();
        assert_eq!(result.train_size, 360);
        assert_eq!(result.test_size, 40);
    }
}
