//! Grid trading strategy engine
//!
//! The deterministic core shared by live bots, the backtester, and the
//! optimizer: a pure function from (params, price, previous price, state)
//! to trade decisions and a new state, plus state reconstruction from the
//! durable trade log after a cache loss.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::config::StrategyTunables;
use crate::types::{GridParams, TradeDecision, TradeRecord, TradeSide};

/// One open lot held by a bot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub quantity: f64,
    pub entry_price: f64,
    /// Highest price observed since entry, drives the sell pullback check
    pub highest_price: f64,
    /// Quote-currency fee paid at entry
    pub fee: f64,
}

/// State of a bot with at least one open position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveCycle {
    /// Open lots, oldest first (FIFO)
    pub positions: Vec<Position>,
    /// Lowest price observed since the last buy; drives the buy pullback
    pub lowest_price: Option<f64>,
    /// Grid target prices, decreasing; computed once at cycle open
    pub grid_prices: Vec<f64>,
    /// Index of the next unfilled grid level; equals `grid_prices.len()`
    /// when exhausted
    pub next_grid_index: usize,
}

/// Per-bot strategy state
///
/// Idle (no positions) and Running are distinct variants so the
/// "empty positions implies no pullback tracking and no grid" invariant
/// cannot be violated by construction. On the wire the state is the flat
/// blob the cache stores; an empty-positions blob maps back to `Idle`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StateBlob", into = "StateBlob")]
pub enum BotState {
    Idle,
    Running(ActiveCycle),
}

impl Default for BotState {
    fn default() -> Self {
        BotState::Idle
    }
}

impl BotState {
    pub fn is_idle(&self) -> bool {
        matches!(self, BotState::Idle)
    }

    /// Open positions, oldest first (empty when idle)
    pub fn positions(&self) -> &[Position] {
        match self {
            BotState::Idle => &[],
            BotState::Running(cycle) => &cycle.positions,
        }
    }
}

/// Flat wire representation of [`BotState`]
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateBlob {
    positions: Vec<Position>,
    lowest_price: Option<f64>,
    grid_prices: Vec<f64>,
    next_grid_index: usize,
}

impl From<BotState> for StateBlob {
    fn from(state: BotState) -> Self {
        match state {
            BotState::Idle => StateBlob {
                positions: Vec::new(),
                lowest_price: None,
                grid_prices: Vec::new(),
                next_grid_index: 0,
            },
            BotState::Running(cycle) => StateBlob {
                positions: cycle.positions,
                lowest_price: cycle.lowest_price,
                grid_prices: cycle.grid_prices,
                next_grid_index: cycle.next_grid_index,
            },
        }
    }
}

impl From<StateBlob> for BotState {
    fn from(blob: StateBlob) -> Self {
        if blob.positions.is_empty() {
            BotState::Idle
        } else {
            BotState::Running(ActiveCycle {
                positions: blob.positions,
                lowest_price: blob.lowest_price,
                grid_prices: blob.grid_prices,
                next_grid_index: blob.next_grid_index,
            })
        }
    }
}

/// Compute the grid target prices for a cycle
///
/// Returns `levels - 1` evenly spaced prices strictly between `max_price`
/// and `min_price`, in decreasing order. Empty when `levels <= 1` or the
/// range is degenerate.
pub fn compute_grid(max_price: f64, min_price: f64, levels: u32) -> Vec<f64> {
    if levels <= 1 || max_price <= min_price {
        return Vec::new();
    }
    let step = (max_price - min_price) / levels as f64;
    (1..levels).map(|i| max_price - step * i as f64).collect()
}

/// Run one tick of the grid strategy
///
/// Pure and total: never fails, never consults external state. Degenerate
/// parameters (inverted range, zero levels) produce an empty grid and
/// therefore no grid buys; rejection belongs upstream.
pub fn decide(
    params: &GridParams,
    tunables: &StrategyTunables,
    price: f64,
    prev_price: Option<f64>,
    state: BotState,
) -> (Vec<TradeDecision>, BotState) {
    match state {
        BotState::Idle => decide_idle(params, tunables, price),
        BotState::Running(cycle) => decide_running(params, tunables, price, prev_price, cycle),
    }
}

/// Idle branch: open a fresh cycle when the price is inside the band
fn decide_idle(
    params: &GridParams,
    tunables: &StrategyTunables,
    price: f64,
) -> (Vec<TradeDecision>, BotState) {
    if params.grid_levels == 0 || price < params.min_price || price > params.max_price {
        return (Vec::new(), BotState::Idle);
    }

    let quantity = params.total_amount / params.grid_levels as f64 / price;
    let grid_prices = compute_grid(params.max_price, params.min_price, params.grid_levels);
    // First unfilled level is the first one strictly below the entry price
    let next_grid_index = grid_prices
        .iter()
        .position(|&level| level < price)
        .unwrap_or(grid_prices.len());

    let decision = TradeDecision {
        side: TradeSide::Buy,
        price,
        quantity,
    };
    let cycle = ActiveCycle {
        positions: vec![Position {
            quantity,
            entry_price: price,
            highest_price: price,
            fee: quantity * price * tunables.fee_pct,
        }],
        lowest_price: None,
        grid_prices,
        next_grid_index,
    };

    (vec![decision], BotState::Running(cycle))
}

/// Running branch: sell scan first, then at most one grid buy
fn decide_running(
    params: &GridParams,
    tunables: &StrategyTunables,
    price: f64,
    prev_price: Option<f64>,
    mut cycle: ActiveCycle,
) -> (Vec<TradeDecision>, BotState) {
    cycle.lowest_price = Some(match cycle.lowest_price {
        Some(low) => low.min(price),
        None => price,
    });
    for pos in &mut cycle.positions {
        pos.highest_price = pos.highest_price.max(price);
    }

    let mut decisions = Vec::new();

    // Sell any position that has gained enough and pulled back from its high
    let min_gain = params.sell_percentage / 100.0;
    let mut remaining = Vec::with_capacity(cycle.positions.len());
    for pos in cycle.positions.drain(..) {
        let gain = price / pos.entry_price - 1.0;
        let pulled_back = price <= pos.highest_price * (1.0 - tunables.sell_pullback_pct);
        if gain >= min_gain && pulled_back {
            decisions.push(TradeDecision {
                side: TradeSide::Sell,
                price,
                quantity: pos.quantity,
            });
        } else {
            remaining.push(pos);
        }
    }
    cycle.positions = remaining;

    // All lots closed: back to idle, a fresh cycle may open next tick
    if cycle.positions.is_empty() {
        return (decisions, BotState::Idle);
    }

    if let Some(prev) = prev_price {
        if cycle.next_grid_index < cycle.grid_prices.len() && price <= params.max_price {
            let target = cycle.grid_prices[cycle.next_grid_index];
            let low = cycle.lowest_price.unwrap_or(price);
            // Pullback confirmation: falling vs the previous tick but
            // already recovered past the local low
            if price <= target
                && price < prev
                && price >= low * (1.0 + tunables.buy_pullback_pct)
            {
                let quantity = params.total_amount / params.grid_levels as f64 / price;
                decisions.push(TradeDecision {
                    side: TradeSide::Buy,
                    price,
                    quantity,
                });
                cycle.positions.push(Position {
                    quantity,
                    entry_price: price,
                    highest_price: price,
                    fee: quantity * price * tunables.fee_pct,
                });
                cycle.next_grid_index += 1;
                cycle.lowest_price = Some(price);
            }
        }
    }

    (decisions, BotState::Running(cycle))
}

/// Rebuild a bot's state from its durable trade log
///
/// Replays the log in order: buys push lots, sells pop the oldest. The
/// grid is rebuilt from the *current* parameters so operator edits to
/// `grid_levels` or the price band take effect against existing lots.
/// `highest_price` and `lowest_price` are conservative (entry prices);
/// they tighten again as ticks arrive.
pub fn reconstruct_state(
    params: &GridParams,
    tunables: &StrategyTunables,
    trades: &[TradeRecord],
) -> BotState {
    let mut ordered: Vec<&TradeRecord> = trades.iter().collect();
    ordered.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

    let mut open: VecDeque<Position> = VecDeque::new();
    for trade in ordered {
        match trade.side {
            TradeSide::Buy => open.push_back(Position {
                quantity: trade.quantity,
                entry_price: trade.price,
                highest_price: trade.price,
                fee: trade.quantity * trade.price * tunables.fee_pct,
            }),
            TradeSide::Sell => {
                open.pop_front();
            }
        }
    }

    if open.is_empty() {
        return BotState::Idle;
    }

    let positions: Vec<Position> = open.into();
    let grid_prices = compute_grid(params.max_price, params.min_price, params.grid_levels);
    // The first open lot is the cycle opener; levels above its entry were
    // never targets, levels below it were consumed by the later lots
    let start_index = grid_prices
        .iter()
        .position(|&level| level < positions[0].entry_price)
        .unwrap_or(grid_prices.len());
    let next_grid_index = start_index + (positions.len() - 1);
    let lowest_price = positions
        .iter()
        .map(|p| p.entry_price)
        .fold(f64::INFINITY, f64::min);

    BotState::Running(ActiveCycle {
        positions,
        lowest_price: Some(lowest_price),
        grid_prices,
        next_grid_index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{Duration, Utc};

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

    /// Run a price series through `decide`, returning all decisions and the
    /// final state
    fn replay(
        params: &GridParams,
        tunables: &StrategyTunables,
        prices: &[f64],
    ) -> (Vec<TradeDecision>, BotState) {
        let mut state = BotState::Idle;
        let mut prev = None;
        let mut all = Vec::new();
        for &price in prices {
            let (decisions, next) = decide(params, tunables, price, prev, state);
            all.extend(decisions);
            state = next;
            prev = Some(price);
        }
        (all, state)
    }

    #[test]
    fn test_compute_grid_spacing() {
        let grid = compute_grid(200.0, 100.0, 10);
        assert_eq!(grid.len(), 9);
        assert_relative_eq!(grid[0], 190.0);
        assert_relative_eq!(grid[8], 110.0);
        for pair in grid.windows(2) {
            assert!(pair[0] > pair[1], "grid must be strictly decreasing");
        }
    }

    #[test]
    fn test_compute_grid_degenerate() {
        assert!(compute_grid(200.0, 100.0, 1).is_empty());
        assert!(compute_grid(200.0, 100.0, 0).is_empty());
        assert!(compute_grid(100.0, 200.0, 10).is_empty());
        assert!(compute_grid(100.0, 100.0, 10).is_empty());
    }

    #[test]
    fn test_first_buy_opens_cycle() {
        let (decisions, state) = replay(&params(), &tunables(), &[150.0]);

        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].side, TradeSide::Buy);
        assert_relative_eq!(decisions[0].quantity, 1000.0 / 10.0 / 150.0);

        match state {
            BotState::Running(cycle) => {
                assert_eq!(cycle.grid_prices.len(), 9);
                assert_relative_eq!(cycle.grid_prices[0], 190.0);
                // First level strictly below 150 is 140 at index 5
                assert_eq!(cycle.next_grid_index, 5);
                assert_eq!(cycle.lowest_price, None);
                assert_relative_eq!(cycle.positions[0].highest_price, 150.0);
                assert_relative_eq!(
                    cycle.positions[0].fee,
                    decisions[0].quantity * 150.0 * 0.002
                );
            }
            BotState::Idle => panic!("expected a running cycle"),
        }
    }

    #[test]
    fn test_price_outside_band_never_trades() {
        let p = GridParams {
            min_price: 100.0,
            max_price: 150.0,
            ..params()
        };
        let (decisions, state) = replay(&p, &tunables(), &[200.0; 10]);
        assert!(decisions.is_empty());
        assert!(state.is_idle());
    }

    #[test]
    fn test_sell_after_gain_and_pullback() {
        let (decisions, state) = replay(&params(), &tunables(), &[100.0, 102.5, 102.0]);

        assert_eq!(decisions.len(), 2);
        assert_eq!(decisions[0].side, TradeSide::Buy);
        assert_relative_eq!(decisions[0].price, 100.0);
        // 102.5 is a 2.5% gain but no pullback yet (102.5 > 102.5 * 0.998);
        // 102.0 still clears 2% and sits below the pulled-back high
        assert_eq!(decisions[1].side, TradeSide::Sell);
        assert_relative_eq!(decisions[1].price, 102.0);
        assert!(state.is_idle());
    }

    #[test]
    fn test_grid_buy_requires_pullback_confirmation() {
        let prices = [150.0, 142.0, 140.0, 139.0, 139.4, 139.3];
        let (decisions, state) = replay(&params(), &tunables(), &prices);

        let buys: Vec<_> = decisions
            .iter()
            .filter(|d| d.side == TradeSide::Buy)
            .collect();
        assert_eq!(buys.len(), 2);
        assert_relative_eq!(buys[0].price, 150.0);
        // 140.0 and 139.0 hit the target but sit on the local low;
        // 139.4 rises; 139.3 falls and has recovered 0.2% above the low
        assert_relative_eq!(buys[1].price, 139.3);

        match state {
            BotState::Running(cycle) => {
                assert_eq!(cycle.next_grid_index, 6);
                assert_eq!(cycle.positions.len(), 2);
                assert_eq!(cycle.lowest_price, Some(139.3));
            }
            BotState::Idle => panic!("expected a running cycle"),
        }
    }

    #[test]
    fn test_no_grid_buy_above_target() {
        let prices = [150.0, 148.0, 147.0, 146.0, 147.0, 146.5];
        let (decisions, _) = replay(&params(), &tunables(), &prices);
        // Target after the opener is 140; the price never reaches it
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].side, TradeSide::Buy);
    }

    #[test]
    fn test_at_most_one_buy_per_tick() {
        let prices = [150.0, 142.0, 139.0, 139.5, 139.3, 122.0, 119.0, 119.5, 119.3];
        let mut state = BotState::Idle;
        let mut prev = None;
        for &price in &prices {
            let (decisions, next) = decide(&params(), &tunables(), price, prev, state);
            let buys = decisions
                .iter()
                .filter(|d| d.side == TradeSide::Buy)
                .count();
            assert!(buys <= 1, "more than one buy in a single tick");
            state = next;
            prev = Some(price);
        }
    }

    #[test]
    fn test_idle_state_has_no_residue() {
        // Whenever positions empty out, the pullback tracking and grid
        // reset with them; the enum makes the check trivial
        let (_, state) = replay(&params(), &tunables(), &[100.0, 102.5, 102.0]);
        assert_eq!(state, BotState::Idle);
        assert!(state.positions().is_empty());
    }

    #[test]
    fn test_decide_is_deterministic() {
        let cycle = ActiveCycle {
            positions: vec![Position {
                quantity: 0.5,
                entry_price: 140.0,
                highest_price: 141.0,
                fee: 0.14,
            }],
            lowest_price: Some(138.0),
            grid_prices: compute_grid(200.0, 100.0, 10),
            next_grid_index: 6,
        };
        let a = decide(
            &params(),
            &tunables(),
            139.0,
            Some(139.5),
            BotState::Running(cycle.clone()),
        );
        let b = decide(
            &params(),
            &tunables(),
            139.0,
            Some(139.5),
            BotState::Running(cycle),
        );
        assert_eq!(a, b);
    }

    #[test]
    fn test_degenerate_params_are_total() {
        let p = GridParams {
            min_price: 200.0,
            max_price: 100.0,
            ..params()
        };
        let (decisions, state) = replay(&p, &tunables(), &[150.0, 140.0, 130.0]);
        assert!(decisions.is_empty());
        assert!(state.is_idle());
    }

    #[test]
    fn test_state_blob_round_trip() {
        let state = BotState::Running(ActiveCycle {
            positions: vec![Position {
                quantity: 0.666,
                entry_price: 150.0,
                highest_price: 151.0,
                fee: 0.2,
            }],
            lowest_price: Some(149.0),
            grid_prices: vec![190.0, 180.0],
            next_grid_index: 1,
        });
        let json = serde_json::to_string(&state).unwrap();
        let back: BotState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_empty_blob_deserializes_to_idle() {
        let json = r#"{"positions":[],"lowest_price":null,"grid_prices":[],"next_grid_index":0}"#;
        let state: BotState = serde_json::from_str(json).unwrap();
        assert_eq!(state, BotState::Idle);
    }

    fn trade(id: i64, side: TradeSide, price: f64, quantity: f64) -> TradeRecord {
        TradeRecord {
            id,
            bot_id: 1,
            side,
            price,
            quantity,
            created_at: Utc::now() + Duration::seconds(id),
        }
    }

    #[test]
    fn test_reconstruct_empty_log_is_idle() {
        assert_eq!(reconstruct_state(&params(), &tunables(), &[]), BotState::Idle);
    }

    #[test]
    fn test_reconstruct_balanced_log_is_idle() {
        let trades = vec![
            trade(1, TradeSide::Buy, 150.0, 0.66),
            trade(2, TradeSide::Sell, 153.5, 0.66),
        ];
        assert_eq!(
            reconstruct_state(&params(), &tunables(), &trades),
            BotState::Idle
        );
    }

    #[test]
    fn test_reconstruct_open_positions() {
        let trades = vec![
            trade(1, TradeSide::Buy, 150.0, 0.666),
            trade(2, TradeSide::Buy, 139.3, 0.717),
            trade(3, TradeSide::Buy, 129.5, 0.772),
            trade(4, TradeSide::Sell, 153.0, 0.666),
        ];
        match reconstruct_state(&params(), &tunables(), &trades) {
            BotState::Running(cycle) => {
                // Oldest buy was consumed by the sell (FIFO)
                assert_eq!(cycle.positions.len(), 2);
                assert_relative_eq!(cycle.positions[0].entry_price, 139.3);
                assert_relative_eq!(cycle.positions[1].entry_price, 129.5);
                // First level below 139.3 is 130 at index 6; one extra lot
                assert_eq!(cycle.next_grid_index, 7);
                assert_eq!(cycle.lowest_price, Some(129.5));
                // Conservative: highs collapse to the entries
                assert_relative_eq!(cycle.positions[0].highest_price, 139.3);
            }
            BotState::Idle => panic!("expected open positions"),
        }
    }

    #[test]
    fn test_reconstruct_sorts_by_created_at() {
        let mut trades = vec![
            trade(2, TradeSide::Sell, 153.0, 0.66),
            trade(1, TradeSide::Buy, 150.0, 0.66),
            trade(3, TradeSide::Buy, 140.0, 0.71),
        ];
        trades.reverse();
        match reconstruct_state(&params(), &tunables(), &trades) {
            BotState::Running(cycle) => {
                assert_eq!(cycle.positions.len(), 1);
                assert_relative_eq!(cycle.positions[0].entry_price, 140.0);
            }
            BotState::Idle => panic!("expected one open position"),
        }
    }

    #[test]
    fn test_reconstruct_uses_current_config() {
        // Operator widened the grid after the cycle opened: the rebuilt
        // grid follows the new config, existing lots are kept
        let trades = vec![trade(1, TradeSide::Buy, 150.0, 0.666)];
        let edited = GridParams {
            grid_levels: 20,
            ..params()
        };
        match reconstruct_state(&edited, &tunables(), &trades) {
            BotState::Running(cycle) => {
                assert_eq!(cycle.grid_prices.len(), 19);
                // First level below 150 with a 5.0 step is 145 at index 10
                assert_eq!(cycle.next_grid_index, 10);
            }
            BotState::Idle => panic!("expected one open position"),
        }
    }
}
