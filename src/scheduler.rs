//! Bot scheduler
//!
//! Owns the set of live bot runtimes. Exactly one runtime per bot id:
//! two concurrent runtimes for the same bot would double-trade, so a
//! spawn request for a bot that is already running is refused.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::PriceCache;
use crate::config::StrategyTunables;
use crate::exchange::OrderExecutor;
use crate::runtime::BotRuntime;
use crate::store::Store;

type RuntimeMap = Mutex<HashMap<i64, JoinHandle<()>>>;

/// Insert a runtime handle unless one is already live for this bot
///
/// Finished runtimes are reaped first so a deactivated bot's slot frees
/// up for reactivation. Returns false (and aborts the new handle) when a
/// live runtime already owns the slot.
fn register_runtime(running: &RuntimeMap, bot_id: i64, handle: JoinHandle<()>) -> bool {
    let mut running = running.lock().unwrap();
    running.retain(|_, h| !h.is_finished());
    if running.contains_key(&bot_id) {
        handle.abort();
        return false;
    }
    running.insert(bot_id, handle);
    true
}

pub struct BotScheduler {
    store: Arc<Store>,
    cache: PriceCache,
    executor: Arc<dyn OrderExecutor>,
    tunables: StrategyTunables,
    running: RuntimeMap,
}

impl BotScheduler {
    pub fn new(
        store: Arc<Store>,
        cache: PriceCache,
        executor: Arc<dyn OrderExecutor>,
        tunables: StrategyTunables,
    ) -> Arc<Self> {
        Arc::new(BotScheduler {
            store,
            cache,
            executor,
            tunables,
            running: Mutex::new(HashMap::new()),
        })
    }

    /// Launch a runtime for a bot (create/activate/reactivate events)
    ///
    /// Returns false when a runtime for this bot is already running.
    pub fn spawn_bot(self: &Arc<Self>, bot_id: i64) -> bool {
        let runtime = BotRuntime::new(
            bot_id,
            self.store.clone(),
            self.cache.clone(),
            self.executor.clone(),
            self.tunables,
        );
        let handle = tokio::spawn(runtime.run());

        if register_runtime(&self.running, bot_id, handle) {
            info!("spawned runtime for bot {bot_id}");
            true
        } else {
            warn!("runtime for bot {bot_id} already running, not spawning another");
            false
        }
    }

    /// Restart runtimes for every active bot (process startup)
    pub fn start_all_active(self: &Arc<Self>) -> Result<usize> {
        let ids = self.store.list_active_ids()?;
        if ids.is_empty() {
            info!("no active bots to start");
            return Ok(0);
        }

        let mut started = 0;
        for bot_id in ids {
            if self.spawn_bot(bot_id) {
                started += 1;
            }
        }
        info!("started {started} active bot runtime(s)");
        Ok(started)
    }

    /// Number of live runtimes
    pub fn running_count(&self) -> usize {
        let mut running = self.running.lock().unwrap();
        running.retain(|_, h| !h.is_finished());
        running.len()
    }
}
