//! Slippage-delay models
//!
//! Slippage is simulated as latency: the delay between an order's
//! submission and the timestamp at which it becomes fillable. Price
//! adjustment models (fixed / percentage / volume_based) carry no
//! delay.

use crate::models::Order;
use crate::plugin::manifest::{HostParams, SlippageModel};
use crate::state::BacktestState;

const NANOS_PER_SECOND: f64 = 1e9;

pub struct SlippageCalculator;

impl SlippageCalculator {
    /// Delay in nanoseconds before the order may fill
    pub fn slippage_delay_ns(
        order: &Order,
        host_params: &HostParams,
        state: &BacktestState,
    ) -> i64 {
        match host_params.slippage_model {
            Some(SlippageModel::TimeBased) => {
                let delay_seconds = host_params.slippage.unwrap_or(0.0);
                (delay_seconds * NANOS_PER_SECOND) as i64
            }
            Some(SlippageModel::TimeVolumeBased) => {
                let (Some(price), Some(volume)) =
                    (state.price(&order.symbol), state.volume(&order.symbol))
                else {
                    return 0;
                };
                let order_value_dollars = (price * order.quantity).to_dollars();
                if order_value_dollars <= 0.0 {
                    return 0;
                }
                let size_ratio = volume as f64 / order_value_dollars;
                let delay_seconds = host_params.slippage.unwrap_or(1.0) * size_ratio;
                (delay_seconds * NANOS_PER_SECOND) as i64
            }
            _ => 0,
        }
    }
}
