//! Equity, return and margin bookkeeping

use crate::engine::EngineError;
use crate::money::Money;
use crate::plugin::manifest::HostParams;
use crate::state::BacktestState;

pub struct EquityCalculator;

impl EquityCalculator {
    /// Cash plus the mark-to-market value of every open position.
    /// A held symbol without a current price is a fatal invariant
    /// violation, not a declinable condition.
    pub fn calculate_equity(state: &BacktestState) -> Result<Money, EngineError> {
        let mut total_assets = Money::ZERO;
        for position in state.positions.values() {
            let price = state
                .price(&position.symbol)
                .ok_or_else(|| EngineError::MissingPrice(position.symbol.clone()))?;
            total_assets += price * position.quantity;
        }
        Ok(total_assets + state.cash)
    }

    /// Fractional return on initial capital
    pub fn calculate_return(host_params: &HostParams, equity: Money) -> f64 {
        let initial_capital = Money::from_dollars(host_params.initial_capital as f64);
        if initial_capital.is_zero() {
            return 0.0;
        }
        (equity - initial_capital).to_dollars() / initial_capital.to_dollars()
    }

    /// Drawdown from the peak of the recorded curve (or the current
    /// equity, whichever is higher)
    pub fn calculate_max_drawdown(state: &BacktestState, equity: Money) -> f64 {
        let mut peak_equity = equity;
        for snapshot in &state.equity_curve {
            if snapshot.equity > peak_equity {
                peak_equity = snapshot.equity;
            }
        }
        if peak_equity <= Money::ZERO {
            return 0.0;
        }
        (peak_equity - equity).to_dollars() / peak_equity.to_dollars()
    }

    /// Cash minus the margin already committed to open positions
    pub fn calculate_available_margin(state: &BacktestState, host_params: &HostParams) -> Money {
        let margin_pct = host_params.initial_margin_pct.unwrap_or(1.0);
        let used_margin: Money = state
            .positions
            .values()
            .map(|p| (p.average_price * p.quantity.abs()) * margin_pct)
            .sum();
        state.cash - used_margin
    }
}
