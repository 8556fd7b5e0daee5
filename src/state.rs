//! Mutable per-run backtest state
//!
//! One engine exclusively owns one `BacktestState`. Bar observation
//! updates the clock and per-symbol price/volume maps; everything else
//! is folded in by the engine when it resolves executions.

use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

use crate::models::{Bar, EquitySnapshot, Fill, Position, Symbol};
use crate::money::Money;

#[derive(Debug, Clone)]
pub struct BacktestState {
    pub cash: Money,
    pub positions: BTreeMap<Symbol, Position>,
    pub current_bar_prices: BTreeMap<Symbol, Money>,
    pub current_bar_volumes: BTreeMap<Symbol, i64>,
    pub current_timestamp_ns: i64,
    pub trade_history: Vec<Fill>,
    pub equity_curve: Vec<EquitySnapshot>,
    pub active_buy_fills: HashSet<Uuid>,
    pub active_sell_fills: HashSet<Uuid>,
}

impl BacktestState {
    pub fn new(initial_cash: Money) -> Self {
        BacktestState {
            cash: initial_cash,
            positions: BTreeMap::new(),
            current_bar_prices: BTreeMap::new(),
            current_bar_volumes: BTreeMap::new(),
            current_timestamp_ns: 0,
            trade_history: Vec::new(),
            equity_curve: Vec::new(),
            active_buy_fills: HashSet::new(),
            active_sell_fills: HashSet::new(),
        }
    }

    /// Advance the clock and per-symbol market snapshot to this bar
    pub fn observe_bar(&mut self, bar: &Bar) {
        self.current_timestamp_ns = bar.unix_ts_ns;
        self.current_bar_prices
            .insert(bar.symbol.clone(), Money::from_dollars(bar.close));
        self.current_bar_volumes
            .insert(bar.symbol.clone(), bar.volume as i64);
    }

    /// Last observed close for a symbol
    pub fn price(&self, symbol: &Symbol) -> Option<Money> {
        self.current_bar_prices.get(symbol).copied()
    }

    /// Last observed bar volume for a symbol
    pub fn volume(&self, symbol: &Symbol) -> Option<i64> {
        self.current_bar_volumes.get(symbol).copied()
    }

    /// Signed held quantity, zero when no position exists
    pub fn position_quantity(&self, symbol: &Symbol) -> f64 {
        self.positions.get(symbol).map_or(0.0, |p| p.quantity)
    }

    /// Whether an opening fill still backs live exposure
    pub fn is_fill_active(&self, uuid: &Uuid) -> bool {
        self.active_buy_fills.contains(uuid) || self.active_sell_fills.contains(uuid)
    }
}
