//! Market screening job
//!
//! Long-running sweep over every eligible trading pair: fetch candles,
//! optimize grid parameters, stream incremental progress through the
//! cache, and persist the final rows durably. Runs independently of the
//! live trading path.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::cache::{PriceCache, PROGRESS_TTL_SECS, SYMBOLS_TTL_SECS};
use crate::config::StrategyTunables;
use crate::exchange::BinanceMarketClient;
use crate::klines::KlinesFetcher;
use crate::optimize::{
    optimize_parameters, OptimizationResult, SCREENING_GRID_LEVELS, SCREENING_SELL_PERCENTAGES,
};
use crate::store::Store;
use crate::types::ScreeningRow;

/// Pause between symbols (upstream rate discipline)
const BATCH_DELAY: Duration = Duration::from_millis(500);
/// Symbols with less history than this are skipped
const MIN_KLINES: usize = 200;
/// Published progress keeps only the best rows
const MAX_PUBLISHED_RESULTS: usize = 50;
const SCREENING_QUOTE: &str = "USDC";
const SCREENING_TRAIN_RATIO: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScreeningStatus {
    Pending,
    Running,
    Completed,
}

/// Incremental progress blob published to the cache while the job runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreeningProgress {
    pub task_id: String,
    pub status: ScreeningStatus,
    /// Percent complete, 0-100
    pub progress: u8,
    pub total_symbols: usize,
    pub processed_symbols: usize,
    pub results: Vec<ScreeningRow>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Assemble the published view of the current progress
///
/// Results are re-sorted by train PnL% descending and truncated on every
/// publish so a polling client always sees the current leaderboard.
fn build_progress(
    task_id: &str,
    status: ScreeningStatus,
    total: usize,
    processed: usize,
    results: &[ScreeningRow],
    started_at: DateTime<Utc>,
) -> ScreeningProgress {
    let mut published = results.to_vec();
    published.sort_by_key(|r| std::cmp::Reverse(OrderedFloat(r.best_pnl_pct)));
    published.truncate(MAX_PUBLISHED_RESULTS);

    ScreeningProgress {
        task_id: task_id.to_string(),
        status,
        progress: if total > 0 {
            (processed * 100 / total) as u8
        } else {
            0
        },
        total_symbols: total,
        processed_symbols: processed,
        results: published,
        started_at,
        completed_at: if status == ScreeningStatus::Completed {
            Some(Utc::now())
        } else {
            None
        },
    }
}

fn row_from_optimization(symbol: &str, opt: &OptimizationResult) -> ScreeningRow {
    let best = &opt.best_params;
    ScreeningRow {
        symbol: symbol.to_string(),
        best_pnl_pct: best.total_pnl_pct,
        best_min_price: best.min_price,
        best_max_price: best.max_price,
        best_grid_levels: best.grid_levels,
        best_sell_percentage: best.sell_percentage,
        num_trades: best.num_trades,
        win_rate: best.win_rate,
        max_drawdown: best.max_drawdown,
        sharpe_ratio: best.sharpe_ratio,
        test_pnl_pct: opt.test_result.total_pnl_pct,
        test_win_rate: opt.test_result.win_rate,
    }
}

pub struct ScreeningJob {
    cache: PriceCache,
    store: Arc<Store>,
    market: BinanceMarketClient,
    fetcher: KlinesFetcher,
    tunables: StrategyTunables,
}

impl ScreeningJob {
    pub fn new(
        cache: PriceCache,
        store: Arc<Store>,
        market: BinanceMarketClient,
        fetcher: KlinesFetcher,
        tunables: StrategyTunables,
    ) -> Self {
        ScreeningJob {
            cache,
            store,
            market,
            fetcher,
            tunables,
        }
    }

    /// Screen every eligible pair for grid trading profitability
    pub async fn run(
        &self,
        task_id: &str,
        user_id: i64,
        interval: &str,
        limit: usize,
        total_amount: f64,
    ) -> Result<()> {
        let symbols = self.resolve_symbols().await?;
        let total = symbols.len();
        let started_at = Utc::now();
        let mut results: Vec<ScreeningRow> = Vec::new();

        self.publish(build_progress(
            task_id,
            ScreeningStatus::Running,
            total,
            0,
            &results,
            started_at,
        ))
        .await;
        info!("screening {task_id}: starting on {total} symbols");

        for (i, symbol) in symbols.iter().enumerate() {
            match self.screen_symbol(symbol, interval, limit, total_amount).await {
                Ok(Some(row)) => results.push(row),
                Ok(None) => {}
                Err(e) => warn!("screening {task_id}: failed on {symbol}: {e:#}"),
            }

            self.publish(build_progress(
                task_id,
                ScreeningStatus::Running,
                total,
                i + 1,
                &results,
                started_at,
            ))
            .await;
            sleep(BATCH_DELAY).await;
        }

        // Durable persistence is one transaction; the progress blob stays
        // authoritative for the client if it fails
        if let Err(e) = self
            .store
            .insert_screening_results(task_id, user_id, &results)
        {
            error!("screening {task_id}: failed to persist results: {e:#}");
        } else {
            info!(
                "screening {task_id}: saved {} results to the database",
                results.len()
            );
        }

        self.publish(build_progress(
            task_id,
            ScreeningStatus::Completed,
            total,
            total,
            &results,
            started_at,
        ))
        .await;
        info!(
            "screening {task_id} completed: {}/{total} symbols yielded results",
            results.len()
        );
        Ok(())
    }

    /// Resolve the symbol universe, preferring the cached list
    async fn resolve_symbols(&self) -> Result<Vec<String>> {
        match self.cache.get_symbols(SCREENING_QUOTE).await {
            Ok(Some(symbols)) if !symbols.is_empty() => return Ok(symbols),
            Ok(_) => {}
            Err(e) => warn!("symbol cache unavailable: {e:#}"),
        }

        let symbols = self.market.get_quote_symbols(SCREENING_QUOTE).await?;
        if let Err(e) = self
            .cache
            .set_symbols(SCREENING_QUOTE, &symbols, SYMBOLS_TTL_SECS)
            .await
        {
            warn!("failed to cache symbol list: {e:#}");
        }
        Ok(symbols)
    }

    /// Fetch and optimize a single symbol; `None` means skipped
    async fn screen_symbol(
        &self,
        symbol: &str,
        interval: &str,
        limit: usize,
        total_amount: f64,
    ) -> Result<Option<ScreeningRow>> {
        let klines = self.fetcher.fetch_klines(symbol, interval, limit).await?;
        if klines.len() < MIN_KLINES {
            debug!("screening: skipping {symbol} ({} klines)", klines.len());
            return Ok(None);
        }

        let closes: Vec<f64> = klines.iter().map(|k| k.close).collect();
        let tunables = self.tunables;
        let owned_symbol = symbol.to_string();

        // The grid search saturates rayon workers; keep it off the
        // async executor
        let opt = tokio::task::spawn_blocking(move || {
            optimize_parameters(
                &owned_symbol,
                &closes,
                total_amount,
                SCREENING_TRAIN_RATIO,
                Some(SCREENING_GRID_LEVELS),
                Some(SCREENING_SELL_PERCENTAGES),
                10,
                &tunables,
            )
        })
        .await??;

        Ok(Some(row_from_optimization(symbol, &opt)))
    }

    async fn publish(&self, progress: ScreeningProgress) {
        if let Err(e) = self
            .cache
            .set_progress(&progress.task_id, &progress, PROGRESS_TTL_SECS)
            .await
        {
            warn!(
                "screening {}: failed to publish progress: {e:#}",
                progress.task_id
            );
        }
    }
}
