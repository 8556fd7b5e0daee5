//! Signal position sizing and protective price derivation
//!
//! Signals carry no quantity; the host decides how much exposure a
//! direction-only intent is worth and where its protective exits sit.

use crate::engine::EngineError;
use crate::equity::EquityCalculator;
use crate::models::{Action, Signal};
use crate::money::Money;
use crate::plugin::manifest::{HostParams, PositionSizingMethod};
use crate::state::BacktestState;

/// Default fraction of equity committed per signal.
const DEFAULT_POSITION_SIZE_VALUE: f64 = 0.02;

pub struct PositionCalculator;

impl PositionCalculator {
    /// Quantity a signal resolves to under the configured sizing method
    pub fn signal_position_size(
        signal: &Signal,
        host_params: &HostParams,
        state: &BacktestState,
    ) -> Result<f64, EngineError> {
        let current_price = state
            .price(&signal.symbol)
            .ok_or_else(|| EngineError::MissingPrice(signal.symbol.clone()))?;
        let equity = EquityCalculator::calculate_equity(state)?;

        let sizing_method = host_params
            .position_sizing_method
            .unwrap_or(PositionSizingMethod::FixedPercentage);
        let position_size_value = host_params
            .position_size_value
            .unwrap_or(DEFAULT_POSITION_SIZE_VALUE);

        let price_dollars = current_price.to_dollars();
        if price_dollars <= 0.0 {
            return Ok(0.0);
        }

        let mut quantity = match sizing_method {
            PositionSizingMethod::FixedPercentage => {
                (equity * position_size_value).to_dollars() / price_dollars
            }
            PositionSizingMethod::FixedDollar => position_size_value / price_dollars,
            PositionSizingMethod::EqualWeight => {
                let symbol_count = host_params.symbols.len().max(1);
                (equity / symbol_count as f64).to_dollars() / price_dollars
            }
        };

        if let Some(max_position_size) = host_params.max_position_size {
            if quantity > max_position_size {
                quantity = max_position_size;
            }
        }

        Ok(quantity)
    }

    /// Stop-loss price for a signal, when the host arms stops
    pub fn signal_stop_loss_price(
        signal: &Signal,
        host_params: &HostParams,
        state: &BacktestState,
    ) -> Option<Money> {
        if !host_params.use_stop_loss.unwrap_or(false) {
            return None;
        }
        let pct = host_params.stop_loss_pct?;
        let current_price = state.price(&signal.symbol)?;

        match signal.action {
            Action::Buy => Some(current_price * (1.0 - pct)),
            Action::Sell => Some(current_price * (1.0 + pct)),
        }
    }

    /// Take-profit price for a signal, when the host arms targets
    pub fn signal_take_profit_price(
        signal: &Signal,
        host_params: &HostParams,
        state: &BacktestState,
    ) -> Option<Money> {
        if !host_params.use_take_profit.unwrap_or(false) {
            return None;
        }
        let pct = host_params.take_profit_pct?;
        let current_price = state.price(&signal.symbol)?;

        match signal.action {
            Action::Buy => Some(current_price * (1.0 + pct)),
            Action::Sell => Some(current_price * (1.0 - pct)),
        }
    }
}
