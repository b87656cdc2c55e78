//! Price ingest worker
//!
//! One persistent connection to the upstream aggregate ticker stream,
//! fanned out into the Redis price store. The ingest is the single source
//! of live prices for every bot runtime; bots never fetch upstream
//! directly.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{interval, sleep, sleep_until, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::cache::{PriceCache, PRICE_TTL_SECS};
use crate::store::Store;

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(5);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
const PING_INTERVAL: Duration = Duration::from_secs(20);
const PONG_TIMEOUT: Duration = Duration::from_secs(10);
const SYMBOL_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One entry of the aggregate ticker batch
#[derive(Debug, Deserialize)]
struct TickerUpdate {
    #[serde(rename = "s")]
    symbol: String,
    /// Close price, serialized as a string upstream
    #[serde(rename = "c")]
    close_price: String,
}

/// Extract the cacheable prices from a ticker batch
///
/// When a tracked set is present, everything outside it is dropped;
/// otherwise all symbols pass through.
fn extract_prices(
    tickers: Vec<TickerUpdate>,
    tracked: Option<&HashSet<String>>,
) -> HashMap<String, f64> {
    let mut prices = HashMap::new();
    for ticker in tickers {
        if let Ok(price) = ticker.close_price.parse::<f64>() {
            let keep = tracked.map_or(true, |set| set.contains(&ticker.symbol));
            if keep {
                prices.insert(ticker.symbol, price);
            }
        }
    }
    prices
}

pub struct PriceIngestWorker {
    cache: PriceCache,
    store: Arc<Store>,
    ws_url: String,
    /// `None` tracks every symbol (no active bots)
    tracked: Arc<RwLock<Option<HashSet<String>>>>,
}

impl PriceIngestWorker {
    pub fn new(cache: PriceCache, store: Arc<Store>, ws_url: String) -> Self {
        PriceIngestWorker {
            cache,
            store,
            ws_url,
            tracked: Arc::new(RwLock::new(None)),
        }
    }

    /// Main streaming loop with automatic reconnection
    ///
    /// Runs until the shutdown signal flips. Backoff doubles from 5 s to
    /// a 60 s cap and resets on every successful connection.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        refresh_tracked(&self.store, &self.tracked);
        let refresh_handle = tokio::spawn(refresh_loop(
            self.store.clone(),
            self.tracked.clone(),
            shutdown.clone(),
        ));

        let mut delay = INITIAL_RECONNECT_DELAY;
        while !*shutdown.borrow() {
            info!("connecting to ticker stream: {}", self.ws_url);
            match connect_async(self.ws_url.as_str()).await {
                Ok((ws, _)) => {
                    info!("ticker stream connected");
                    delay = INITIAL_RECONNECT_DELAY;
                    if let Err(e) = self.stream_messages(ws, &mut shutdown).await {
                        warn!("ticker stream dropped: {e}");
                    }
                }
                Err(e) => {
                    error!("ticker stream connection failed: {e}");
                }
            }

            if *shutdown.borrow() {
                break;
            }
            warn!("reconnecting in {}s", delay.as_secs());
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown.changed() => break,
            }
            delay = (delay * 2).min(MAX_RECONNECT_DELAY);
        }

        refresh_handle.abort();
        info!("price ingest worker stopped");
        Ok(())
    }

    /// Process messages on one connection until it fails or shutdown
    async fn stream_messages(
        &self,
        mut ws: WsStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let mut ping_timer = interval(PING_INTERVAL);
        let mut pong_deadline: Option<Instant> = None;
        let mut batch_count: u64 = 0;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("shutdown requested, closing ticker stream");
                    let _ = ws.close(None).await;
                    return Ok(());
                }
                _ = ping_timer.tick() => {
                    ws.send(Message::Ping(Vec::new())).await?;
                    if pong_deadline.is_none() {
                        pong_deadline = Some(Instant::now() + PONG_TIMEOUT);
                    }
                }
                _ = async { sleep_until(pong_deadline.unwrap()).await }, if pong_deadline.is_some() => {
                    anyhow::bail!("no pong within {}s", PONG_TIMEOUT.as_secs());
                }
                msg = ws.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        batch_count += 1;
                        self.handle_batch(text.as_ref(), batch_count).await;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        pong_deadline = None;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        ws.send(Message::Pong(payload)).await?;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        anyhow::bail!("stream closed by upstream: {frame:?}");
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => anyhow::bail!("stream ended"),
                }
            }
        }
    }

    async fn handle_batch(&self, text: &str, batch_count: u64) {
        let tickers: Vec<TickerUpdate> = match serde_json::from_str(text) {
            Ok(t) => t,
            Err(e) => {
                warn!("unexpected ticker message format: {e}");
                return;
            }
        };

        let tracked = self.tracked.read().unwrap().clone();
        let prices = extract_prices(tickers, tracked.as_ref());
        if prices.is_empty() {
            return;
        }

        if let Err(e) = self.cache.set_prices_batch(&prices, PRICE_TTL_SECS).await {
            error!("failed to cache price batch: {e}");
        } else if batch_count % 10 == 0 {
            debug!("cached {} prices (batch {})", prices.len(), batch_count);
        }
    }
}

/// Periodically replace the tracked set from the active-bot symbols
async fn refresh_loop(
    store: Arc<Store>,
    tracked: Arc<RwLock<Option<HashSet<String>>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut timer = interval(SYMBOL_REFRESH_INTERVAL);
    timer.tick().await; // the initial refresh already happened
    loop {
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = timer.tick() => refresh_tracked(&store, &tracked),
        }
    }
}

fn refresh_tracked(store: &Store, tracked: &Arc<RwLock<Option<HashSet<String>>>>) {
    match store.list_active_symbols() {
        Ok(symbols) if !symbols.is_empty() => {
            let set: HashSet<String> = symbols.into_iter().map(|s| s.to_uppercase()).collect();
            info!("tracking {} active bot symbols", set.len());
            *tracked.write().unwrap() = Some(set);
        }
        Ok(_) => {
            info!("no active bots; caching all symbols");
            *tracked.write().unwrap() = None;
        }
        Err(e) => error!("error refreshing tracked symbols: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch() -> Vec<TickerUpdate> {
        serde_json::from_str(
            r#"[
                {"e":"24hrTicker","s":"BTCUSDC","c":"42000.5","o":"41000"},
                {"e":"24hrTicker","s":"ETHUSDC","c":"2500.25","o":"2400"},
                {"e":"24hrTicker","s":"DOGEUSDT","c":"0.1","o":"0.09"}
            ]"#,
        )
        .unwrap()
    }

    #[test]
    fn test_ticker_batch_parses_extra_fields() {
        let tickers = batch();
        assert_eq!(tickers.len(), 3);
        assert_eq!(tickers[0].symbol, "BTCUSDC");
        assert_eq!(tickers[0].close_price, "42000.5");
    }

    #[test]
    fn test_extract_prices_unfiltered() {
        let prices = extract_prices(batch(), None);
        assert_eq!(prices.len(), 3);
        assert_eq!(prices["BTCUSDC"], 42000.5);
    }

    #[test]
    fn test_extract_prices_respects_tracked_set() {
        let tracked: HashSet<String> = ["BTCUSDC".to_string()].into_iter().collect();
        let prices = extract_prices(batch(), Some(&tracked));
        assert_eq!(prices.len(), 1);
        assert!(prices.contains_key("BTCUSDC"));
    }

    #[test]
    fn test_extract_prices_drops_unparsable() {
        let tickers: Vec<TickerUpdate> =
            serde_json::from_str(r#"[{"s":"XUSDC","c":"not-a-price"}]"#).unwrap();
        assert!(extract_prices(tickers, None).is_empty());
    }

    #[test]
    fn test_non_array_message_is_rejected() {
        let parsed: Result<Vec<TickerUpdate>, _> =
            serde_json::from_str(r#"{"result":null,"id":1}"#);
        assert!(parsed.is_err());
    }
}
