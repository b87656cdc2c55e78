//! Bot runtime
//!
//! One long-running task per active bot. Each tick reads the cached
//! price, runs the strategy, executes and records any decisions, and
//! persists the state snapshot. The durable trade log stays the source
//! of truth: a crash at any point is recoverable by replaying it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::cache::PriceCache;
use crate::config::StrategyTunables;
use crate::exchange::OrderExecutor;
use crate::store::Store;
use crate::strategy::{decide, reconstruct_state, BotState};
use crate::types::{BotConfig, TradeDecision};

const TICK_INTERVAL: Duration = Duration::from_secs(1);
/// Ticks between is_active polls against the durable store
const ACTIVE_CHECK_TICKS: u64 = 30;

pub struct BotRuntime {
    bot_id: i64,
    store: Arc<Store>,
    cache: PriceCache,
    executor: Arc<dyn OrderExecutor>,
    tunables: StrategyTunables,
}

impl BotRuntime {
    pub fn new(
        bot_id: i64,
        store: Arc<Store>,
        cache: PriceCache,
        executor: Arc<dyn OrderExecutor>,
        tunables: StrategyTunables,
    ) -> Self {
        BotRuntime {
            bot_id,
            store,
            cache,
            executor,
            tunables,
        }
    }

    /// Run until the bot is deactivated
    ///
    /// Tick errors are logged and swallowed; the loop stays eventually
    /// consistent with the price feed. The is_active poll is the sole
    /// termination primitive.
    pub async fn run(self) {
        info!("starting runtime for bot {}", self.bot_id);

        let mut bot = match self.store.get_active_bot(self.bot_id) {
            Ok(Some(bot)) => bot,
            Ok(None) => {
                info!("bot {} not found or inactive, exiting", self.bot_id);
                return;
            }
            Err(e) => {
                error!("bot {}: failed to load config: {e:#}", self.bot_id);
                return;
            }
        };

        let mut state = match self.load_or_recover_state(&bot).await {
            Ok(state) => state,
            Err(e) => {
                error!(
                    "bot {}: failed to load state, starting idle: {e:#}",
                    self.bot_id
                );
                BotState::Idle
            }
        };

        let mut prev_price: Option<f64> = None;
        let mut iteration: u64 = 0;
        let mut ticker = interval(TICK_INTERVAL);

        loop {
            ticker.tick().await;

            if iteration % ACTIVE_CHECK_TICKS == 0 {
                match self.store.get_active_bot(self.bot_id) {
                    Ok(Some(fresh)) => bot = fresh, // picks up config edits
                    Ok(None) => {
                        info!("bot {} is no longer active, stopping", self.bot_id);
                        if let Err(e) = self.cache.delete_bot_state(self.bot_id).await {
                            warn!("bot {}: failed to delete cached state: {e:#}", self.bot_id);
                        }
                        return;
                    }
                    Err(e) => {
                        // Durable store hiccup: keep ticking on the known config
                        error!("bot {}: active check failed: {e:#}", self.bot_id);
                    }
                }
            }
            iteration += 1;

            if let Err(e) = self.tick(&bot, &mut state, &mut prev_price, iteration).await {
                error!("bot {}: tick error: {e:#}", self.bot_id);
            }
        }
    }

    /// Load the cached state, reconstructing from the trade log on a miss
    async fn load_or_recover_state(&self, bot: &BotConfig) -> Result<BotState> {
        if let Some(state) = self.cache.get_bot_state(bot.id).await? {
            debug!("bot {}: state loaded from cache", bot.id);
            return Ok(state);
        }

        let trades = self.store.list_trades_by_bot(bot.id)?;
        let state = if trades.is_empty() {
            BotState::Idle
        } else {
            info!(
                "bot {}: reconstructing state from {} logged trades",
                bot.id,
                trades.len()
            );
            reconstruct_state(&bot.grid_params(), &self.tunables, &trades)
        };
        self.cache.set_bot_state(bot.id, &state).await?;
        Ok(state)
    }

    async fn tick(
        &self,
        bot: &BotConfig,
        state: &mut BotState,
        prev_price: &mut Option<f64>,
        iteration: u64,
    ) -> Result<()> {
        // The ingest worker is the single source of live prices; a miss
        // means wait, never fetch upstream from here
        let price = match self.cache.get_price(&bot.symbol).await {
            Ok(Some(price)) => price,
            Ok(None) => {
                if iteration % 30 == 0 {
                    warn!("bot {}: no cached price for {}, waiting", bot.id, bot.symbol);
                }
                return Ok(());
            }
            Err(e) => {
                warn!("bot {}: price cache unavailable: {e:#}", bot.id);
                return Ok(());
            }
        };

        let params = bot.grid_params();
        let (decisions, new_state) =
            decide(&params, &self.tunables, price, *prev_price, state.clone());

        let mut next_state = new_state;
        if !decisions.is_empty() {
            if let Err(e) =
                execute_and_log(self.executor.as_ref(), &self.store, bot, &decisions).await
            {
                warn!(
                    "bot {}: aborting remaining decisions this tick: {e:#}",
                    bot.id
                );
                // The log holds exactly the executed decisions; re-derive
                // the state from it so nothing phantom survives
                let trades = self.store.list_trades_by_bot(bot.id)?;
                next_state = reconstruct_state(&params, &self.tunables, &trades);
            }
        }

        *state = next_state;
        *prev_price = Some(price);

        // Persist every tick so lowest/highest tracking survives a restart
        self.cache.set_bot_state(bot.id, state).await?;
        Ok(())
    }
}

/// Execute decisions in order, appending a trade row after each fill
///
/// The first failure stops the remainder: no row is written for the
/// failed decision and nothing is retried. A retried sell against a FIFO
/// that already popped its matching buy would fabricate a position.
async fn execute_and_log(
    executor: &dyn OrderExecutor,
    store: &Store,
    bot: &BotConfig,
    decisions: &[TradeDecision],
) -> Result<()> {
    for decision in decisions {
        executor
            .place_market(&bot.symbol, decision.side, decision.quantity)
            .await
            .with_context(|| format!("{} order for {} failed", decision.side, bot.symbol))?;
        store.insert_trade(bot.id, decision.side, decision.price, decision.quantity)?;
        info!(
            "bot {}: {} {:.8} {} @ {:.8}",
            bot.id, decision.side, decision.quantity, bot.symbol, decision.price
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Symbol, TradeSide};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails every call after the first `succeed` ones
    struct FlakyExecutor {
        succeed: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl OrderExecutor for FlakyExecutor {
        async fn place_market(
            &self,
            _symbol: &Symbol,
            _side: TradeSide,
            _quantity: f64,
        ) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.succeed {
                Ok(())
            } else {
                anyhow::bail!("exchange rejected order")
            }
        }
    }

    fn bot_and_store() -> (Store, BotConfig) {
        let store = Store::open_in_memory().unwrap();
        let bot = store
            .create_bot(1, Symbol::new("BTCUSDC"), 200.0, 100.0, 1000.0, 2.0, 10)
            .unwrap();
        (store, bot)
    }

    fn decisions() -> Vec<TradeDecision> {
        vec![
            TradeDecision {
                side: TradeSide::Sell,
                price: 153.0,
                quantity: 0.66,
            },
            TradeDecision {
                side: TradeSide::Buy,
                price: 140.0,
                quantity: 0.71,
            },
        ]
    }

    #[tokio::test]
    async fn test_all_decisions_logged_on_success() {
        let (store, bot) = bot_and_store();
        let executor = FlakyExecutor {
            succeed: usize::MAX,
            calls: AtomicUsize::new(0),
        };

        execute_and_log(&executor, &store, &bot, &decisions())
            .await
            .unwrap();

        let trades = store.list_trades_by_bot(bot.id).unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].side, TradeSide::Sell);
        assert_eq!(trades[1].side, TradeSide::Buy);
    }

    #[tokio::test]
    async fn test_failure_aborts_remaining_decisions() {
        let (store, bot) = bot_and_store();
        let executor = FlakyExecutor {
            succeed: 1,
            calls: AtomicUsize::new(0),
        };

        let result = execute_and_log(&executor, &store, &bot, &decisions()).await;
        assert!(result.is_err());

        // Only the decision that filled made it into the log
        let trades = store.list_trades_by_bot(bot.id).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].side, TradeSide::Sell);
    }

    #[tokio::test]
    async fn test_failure_on_first_decision_logs_nothing() {
        let (store, bot) = bot_and_store();
        let executor = FlakyExecutor {
            succeed: 0,
            calls: AtomicUsize::new(0),
        };

        assert!(execute_and_log(&executor, &store, &bot, &decisions())
            .await
            .is_err());
        assert!(store.list_trades_by_bot(bot.id).unwrap().is_empty());
    }
}
