//! Order-fill algorithm
//!
//! Turns an order plus the current market snapshot into an `Execution`:
//! the fill, its cash effect, the post-fill position, any unfilled
//! remainder and the protective exit orders to arm. Every failure path
//! declines the order without touching state.

use crate::engine::EngineError;
use crate::exchange::Exchange;
use crate::models::{
    Action, Execution, ExitOrder, ExitTrigger, Fill, Order, OrderDeclined, OrderType, Position,
    Signal, QTY_EPSILON,
};
use crate::money::Money;
use crate::plugin::manifest::HostParams;
use crate::sizing::PositionCalculator;
use crate::state::BacktestState;

pub struct Executor;

impl Executor {
    /// Execute one order against the current bar.
    ///
    /// Steps run in a fixed sequence; the first failing step declines
    /// the order. Declines are not fatal to the run.
    pub fn execute_order(
        order: &Order,
        host_params: &HostParams,
        state: &BacktestState,
    ) -> Result<Execution, OrderDeclined> {
        if order.quantity <= 0.0 {
            return Err(OrderDeclined::NonPositiveQuantity);
        }

        let current_close = state
            .price(&order.symbol)
            .ok_or_else(|| OrderDeclined::MissingPrice(order.symbol.clone()))?;
        let bar_volume = state
            .volume(&order.symbol)
            .ok_or_else(|| OrderDeclined::MissingVolume(order.symbol.clone()))?;

        if order.is_exit_order {
            let still_active = order
                .source_fill_uuid
                .map(|uuid| state.is_fill_active(&uuid))
                .unwrap_or(false);
            if !still_active {
                return Err(OrderDeclined::StaleExitOrder);
            }
        }

        let (mut fillable_quantity, remaining_quantity) =
            Self::fillable_and_remaining_quantities(order, host_params, bar_volume);

        if !host_params.allow_fractional_shares.unwrap_or(false) {
            fillable_quantity = fillable_quantity.floor();
            if fillable_quantity <= 0.0 {
                return Err(OrderDeclined::QuantityTooSmall);
            }
        }

        let fill_price = Self::fill_price(order, current_close);

        let fill = Fill::new(
            order.symbol.clone(),
            order.action,
            fillable_quantity,
            fill_price,
            state.current_timestamp_ns,
        );

        let current_position_quantity = state.position_quantity(&order.symbol);
        let signed_fill = match order.action {
            Action::Buy => fillable_quantity,
            Action::Sell => -fillable_quantity,
        };
        let new_position_quantity = current_position_quantity + signed_fill;

        let opening_quantity = Self::position_opening_quantity(
            order,
            fillable_quantity,
            current_position_quantity,
            new_position_quantity,
        );

        let exit_orders =
            Self::create_exit_orders(order, &fill, opening_quantity, new_position_quantity);

        let commission = Exchange::calculate_commission(&fill, host_params);

        let cash_delta = Self::cash_delta(order.action, fill_price, fillable_quantity, commission);

        Self::validate_margin(
            order,
            fill_price,
            commission,
            host_params,
            state,
            opening_quantity,
            new_position_quantity,
            cash_delta,
        )?;

        let position = Self::next_position(
            order,
            fillable_quantity,
            fill_price,
            current_position_quantity,
            new_position_quantity,
            state,
        );

        let partial_order = (remaining_quantity > 0.0).then(|| {
            let mut partial = order.clone();
            partial.quantity = remaining_quantity;
            partial.created_at_ns = state.current_timestamp_ns;
            partial
        });

        Ok(Execution {
            cash_delta,
            fill,
            position,
            partial_order,
            exit_orders,
            closes_fill: order.is_exit_order.then(|| order.source_fill_uuid).flatten(),
        })
    }

    /// Turn a direction-only signal into a sized market order with
    /// derived protective prices.
    pub fn signal_to_order(
        signal: &Signal,
        host_params: &HostParams,
        state: &BacktestState,
    ) -> Result<Order, EngineError> {
        let quantity = PositionCalculator::signal_position_size(signal, host_params, state)?;
        let stop_loss_price =
            PositionCalculator::signal_stop_loss_price(signal, host_params, state);
        let take_profit_price =
            PositionCalculator::signal_take_profit_price(signal, host_params, state);

        let mut order = Order::market(
            signal.symbol.clone(),
            signal.action,
            quantity,
            state.current_timestamp_ns,
        );
        order.stop_loss_price = stop_loss_price;
        order.take_profit_price = take_profit_price;
        Ok(order)
    }

    /// Split the requested quantity at the per-bar volume cap
    fn fillable_and_remaining_quantities(
        order: &Order,
        host_params: &HostParams,
        bar_volume: i64,
    ) -> (f64, f64) {
        if let Some(cap) = host_params.fill_max_pct_of_volume {
            let max_fill_quantity = bar_volume as f64 * cap;
            if order.quantity > max_fill_quantity {
                return (max_fill_quantity, order.quantity - max_fill_quantity);
            }
        }
        (order.quantity, 0.0)
    }

    /// Market orders fill at the close; limit orders never fill at a
    /// worse price than their limit.
    fn fill_price(order: &Order, current_close: Money) -> Money {
        if order.order_type == OrderType::Limit {
            if let Some(limit_price) = order.limit_price {
                return match order.action {
                    Action::Buy => limit_price.min(current_close),
                    Action::Sell => limit_price.max(current_close),
                };
            }
        }
        current_close
    }

    /// Portion of the fill that opens exposure rather than closing it.
    /// Only this portion consumes margin and arms exit orders.
    fn position_opening_quantity(
        order: &Order,
        fillable_quantity: f64,
        current_position_quantity: f64,
        new_position_quantity: f64,
    ) -> f64 {
        if order.is_buy() {
            if current_position_quantity >= 0.0 {
                return fillable_quantity;
            }
            return new_position_quantity.max(0.0);
        }

        if current_position_quantity <= 0.0 {
            return fillable_quantity;
        }
        (-new_position_quantity).max(0.0)
    }

    fn create_exit_orders(
        order: &Order,
        fill: &Fill,
        opening_quantity: f64,
        new_position_quantity: f64,
    ) -> Vec<ExitOrder> {
        if opening_quantity <= QTY_EPSILON {
            return Vec::new();
        }

        let is_short_position_fill = order.is_sell() && new_position_quantity <= 0.0;

        let trigger = |trigger_price: Money| ExitTrigger {
            symbol: order.symbol.clone(),
            trigger_quantity: opening_quantity,
            trigger_price,
            source_fill_uuid: fill.uuid,
            is_short: is_short_position_fill,
        };

        let mut exit_orders = Vec::new();
        if let Some(stop_loss_price) = order.stop_loss_price {
            exit_orders.push(ExitOrder::StopLoss(trigger(stop_loss_price)));
        }
        if let Some(take_profit_price) = order.take_profit_price {
            exit_orders.push(ExitOrder::TakeProfit(trigger(take_profit_price)));
        }
        exit_orders
    }

    fn cash_delta(action: Action, fill_price: Money, quantity: f64, commission: Money) -> Money {
        let fill_value = fill_price * quantity;
        match action {
            Action::Buy => -(fill_value + commission),
            Action::Sell => fill_value - commission,
        }
    }

    fn margin_required(position_value: Money, leverage: f64, initial_margin_pct: f64) -> Money {
        (position_value / leverage).max(position_value * initial_margin_pct)
    }

    #[allow(clippy::too_many_arguments)]
    fn validate_margin(
        order: &Order,
        fill_price: Money,
        commission: Money,
        host_params: &HostParams,
        state: &BacktestState,
        opening_quantity: f64,
        new_position_quantity: f64,
        cash_delta: Money,
    ) -> Result<(), OrderDeclined> {
        if order.is_sell()
            && !host_params.allow_short_selling.unwrap_or(true)
            && new_position_quantity < 0.0
        {
            return Err(OrderDeclined::ShortSellingNotAllowed);
        }

        let leverage = order.leverage.unwrap_or(1.0);
        let max_leverage = host_params.max_leverage();

        if leverage < 1.0 {
            return Err(OrderDeclined::LeverageBelowMinimum(leverage));
        }
        if leverage > max_leverage {
            return Err(OrderDeclined::LeverageExceedsMaximum {
                leverage,
                max_leverage,
            });
        }

        // An order that only closes exposure consumes no margin; a
        // closing BUY still has to be payable in cash.
        if opening_quantity <= QTY_EPSILON {
            if order.is_buy() {
                let post_trade_cash = state.cash + cash_delta;
                if post_trade_cash.is_negative() {
                    return Err(OrderDeclined::InsufficientCash {
                        required: -cash_delta,
                        available: state.cash,
                    });
                }
            }
            return Ok(());
        }

        let position_value = fill_price * opening_quantity;
        let initial_margin_pct = host_params.initial_margin_pct.unwrap_or(1.0);

        let margin = Self::margin_required(position_value, leverage, initial_margin_pct);
        let required = margin + commission;
        let available =
            crate::equity::EquityCalculator::calculate_available_margin(state, host_params);

        if required > available {
            return Err(OrderDeclined::InsufficientMargin {
                required,
                margin,
                commission,
                available,
            });
        }

        Ok(())
    }

    /// Post-fill position with the weighted-average basis rule: the
    /// average tracks fills on the current side of zero, is untouched
    /// by reductions, and resets to the fill price when the position
    /// crosses through zero.
    fn next_position(
        order: &Order,
        fillable_quantity: f64,
        fill_price: Money,
        current_position_quantity: f64,
        new_position_quantity: f64,
        state: &BacktestState,
    ) -> Position {
        let current_average = state
            .positions
            .get(&order.symbol)
            .map(|p| p.average_price)
            .unwrap_or(Money::ZERO);

        let opened_from_flat = current_position_quantity.abs() <= QTY_EPSILON;
        let crossed_zero = current_position_quantity * new_position_quantity < 0.0;
        let extended = current_position_quantity.abs() > QTY_EPSILON
            && !crossed_zero
            && new_position_quantity.abs() > current_position_quantity.abs();

        let average_price = if opened_from_flat || crossed_zero {
            fill_price
        } else if extended {
            let current_value = current_average * current_position_quantity.abs();
            let fill_value = fill_price * fillable_quantity;
            (current_value + fill_value) / new_position_quantity.abs()
        } else {
            current_average
        };

        Position {
            symbol: order.symbol.clone(),
            quantity: new_position_quantity,
            average_price,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Symbol;
    use approx::assert_relative_eq;
    use uuid::Uuid;

    fn symbol() -> Symbol {
        Symbol::new("AAA")
    }

    fn state(cash: f64, price: f64, volume: i64) -> BacktestState {
        let mut state = BacktestState::new(Money::from_dollars(cash));
        state
            .current_bar_prices
            .insert(symbol(), Money::from_dollars(price));
        state.current_bar_volumes.insert(symbol(), volume);
        state.current_timestamp_ns = 1_000_000_000;
        state
    }

    fn market_order(action: Action, quantity: f64) -> Order {
        Order::market(symbol(), action, quantity, 0)
    }

    fn fractional_host() -> HostParams {
        HostParams {
            allow_fractional_shares: Some(true),
            ..HostParams::default()
        }
    }

    #[test]
    fn test_market_buy_fills_at_close() {
        let state = state(100_000.0, 100.0, 1_000_000);
        let execution =
            Executor::execute_order(&market_order(Action::Buy, 10.0), &fractional_host(), &state)
                .unwrap();

        assert_eq!(execution.fill.price, Money::from_dollars(100.0));
        assert_relative_eq!(execution.fill.quantity, 10.0);
        assert_eq!(execution.cash_delta, Money::from_dollars(-1_000.0));
        assert_relative_eq!(execution.position.quantity, 10.0);
        assert_eq!(execution.position.average_price, Money::from_dollars(100.0));
        assert!(execution.partial_order.is_none());
        assert!(execution.exit_orders.is_empty());
    }

    #[test]
    fn test_limit_buy_never_fills_above_limit() {
        let state = state(100_000.0, 100.0, 1_000_000);
        let mut order = market_order(Action::Buy, 1.0);
        order.order_type = OrderType::Limit;
        order.limit_price = Some(Money::from_dollars(95.0));
        let execution = Executor::execute_order(&order, &fractional_host(), &state).unwrap();
        assert_eq!(execution.fill.price, Money::from_dollars(95.0));

        order.limit_price = Some(Money::from_dollars(105.0));
        let execution = Executor::execute_order(&order, &fractional_host(), &state).unwrap();
        assert_eq!(execution.fill.price, Money::from_dollars(100.0));
    }

    #[test]
    fn test_limit_sell_never_fills_below_limit() {
        let mut state = state(100_000.0, 100.0, 1_000_000);
        state.positions.insert(
            symbol(),
            Position {
                symbol: symbol(),
                quantity: 10.0,
                average_price: Money::from_dollars(90.0),
            },
        );
        let mut order = market_order(Action::Sell, 5.0);
        order.order_type = OrderType::Limit;
        order.limit_price = Some(Money::from_dollars(110.0));
        let execution = Executor::execute_order(&order, &fractional_host(), &state).unwrap();
        assert_eq!(execution.fill.price, Money::from_dollars(110.0));
    }

    #[test]
    fn test_non_positive_quantity_declined() {
        let state = state(100_000.0, 100.0, 1_000_000);
        assert!(matches!(
            Executor::execute_order(&market_order(Action::Buy, 0.0), &fractional_host(), &state),
            Err(OrderDeclined::NonPositiveQuantity)
        ));
    }

    #[test]
    fn test_missing_price_declined() {
        let mut state = state(100_000.0, 100.0, 1_000_000);
        state.current_bar_prices.clear();
        assert!(matches!(
            Executor::execute_order(&market_order(Action::Buy, 1.0), &fractional_host(), &state),
            Err(OrderDeclined::MissingPrice(_))
        ));
    }

    #[test]
    fn test_volume_cap_partial_fill() {
        let host = HostParams {
            allow_fractional_shares: Some(true),
            fill_max_pct_of_volume: Some(0.1),
            ..HostParams::default()
        };
        let state = state(100_000.0, 100.0, 100);
        let execution =
            Executor::execute_order(&market_order(Action::Buy, 50.0), &host, &state).unwrap();

        assert_relative_eq!(execution.fill.quantity, 10.0);
        let partial = execution.partial_order.unwrap();
        assert_relative_eq!(partial.quantity, 40.0);
        assert_eq!(partial.created_at_ns, state.current_timestamp_ns);
    }

    #[test]
    fn test_integer_mode_floors_quantity() {
        let state = state(100_000.0, 100.0, 1_000_000);
        let execution = Executor::execute_order(
            &market_order(Action::Buy, 2.9),
            &HostParams::default(),
            &state,
        )
        .unwrap();
        assert_relative_eq!(execution.fill.quantity, 2.0);

        assert!(matches!(
            Executor::execute_order(
                &market_order(Action::Buy, 0.9),
                &HostParams::default(),
                &state
            ),
            Err(OrderDeclined::QuantityTooSmall)
        ));
    }

    #[test]
    fn test_insufficient_margin_declined() {
        // 100 shares at $100 with no leverage needs $10,000 against
        // $1,000 of cash.
        let state = state(1_000.0, 100.0, 1_000_000);
        let result =
            Executor::execute_order(&market_order(Action::Buy, 100.0), &fractional_host(), &state);
        assert!(matches!(
            result,
            Err(OrderDeclined::InsufficientMargin { .. })
        ));
    }

    #[test]
    fn test_leverage_loosens_margin() {
        let mut order = market_order(Action::Buy, 100.0);
        order.leverage = Some(5.0);
        let host = HostParams {
            allow_fractional_shares: Some(true),
            leverage: Some(5.0),
            initial_margin_pct: Some(0.2),
            ..HostParams::default()
        };
        // $10,000 of stock at 5x leverage commits $2,000.
        let state = state(2_500.0, 100.0, 1_000_000);
        assert!(Executor::execute_order(&order, &host, &state).is_ok());
    }

    #[test]
    fn test_leverage_bounds_enforced() {
        let state = state(100_000.0, 100.0, 1_000_000);

        let mut order = market_order(Action::Buy, 1.0);
        order.leverage = Some(0.5);
        assert!(matches!(
            Executor::execute_order(&order, &fractional_host(), &state),
            Err(OrderDeclined::LeverageBelowMinimum(_))
        ));

        order.leverage = Some(3.0);
        assert!(matches!(
            Executor::execute_order(&order, &fractional_host(), &state),
            Err(OrderDeclined::LeverageExceedsMaximum { .. })
        ));
    }

    #[test]
    fn test_short_selling_gate() {
        let host = HostParams {
            allow_fractional_shares: Some(true),
            allow_short_selling: Some(false),
            ..HostParams::default()
        };
        let state = state(100_000.0, 100.0, 1_000_000);
        assert!(matches!(
            Executor::execute_order(&market_order(Action::Sell, 1.0), &host, &state),
            Err(OrderDeclined::ShortSellingNotAllowed)
        ));

        // Shorts pass when permitted (the default).
        assert!(Executor::execute_order(
            &market_order(Action::Sell, 1.0),
            &fractional_host(),
            &state
        )
        .is_ok());
    }

    #[test]
    fn test_stale_exit_order_declined() {
        let state = state(100_000.0, 100.0, 1_000_000);
        let mut order = market_order(Action::Sell, 1.0);
        order.is_exit_order = true;
        order.source_fill_uuid = Some(Uuid::new_v4());
        assert!(matches!(
            Executor::execute_order(&order, &fractional_host(), &state),
            Err(OrderDeclined::StaleExitOrder)
        ));
    }

    #[test]
    fn test_exit_order_with_active_source_executes() {
        let mut state = state(100_000.0, 100.0, 1_000_000);
        let source = Uuid::new_v4();
        state.active_buy_fills.insert(source);
        state.positions.insert(
            symbol(),
            Position {
                symbol: symbol(),
                quantity: 1.0,
                average_price: Money::from_dollars(100.0),
            },
        );

        let mut order = market_order(Action::Sell, 1.0);
        order.is_exit_order = true;
        order.source_fill_uuid = Some(source);
        let execution = Executor::execute_order(&order, &fractional_host(), &state).unwrap();
        assert_eq!(execution.closes_fill, Some(source));
        assert!(execution.position.is_flat());
    }

    #[test]
    fn test_opening_buy_arms_exit_orders() {
        let state = state(100_000.0, 100.0, 1_000_000);
        let mut order = market_order(Action::Buy, 10.0);
        order.stop_loss_price = Some(Money::from_dollars(90.0));
        order.take_profit_price = Some(Money::from_dollars(120.0));

        let execution = Executor::execute_order(&order, &fractional_host(), &state).unwrap();
        assert_eq!(execution.exit_orders.len(), 2);
        for exit_order in &execution.exit_orders {
            let trigger = exit_order.trigger();
            assert_relative_eq!(trigger.trigger_quantity, 10.0);
            assert_eq!(trigger.source_fill_uuid, execution.fill.uuid);
            assert!(!trigger.is_short);
        }
    }

    #[test]
    fn test_short_fill_tags_exits_short() {
        let state = state(100_000.0, 100.0, 1_000_000);
        let mut order = market_order(Action::Sell, 5.0);
        order.stop_loss_price = Some(Money::from_dollars(110.0));

        let execution = Executor::execute_order(&order, &fractional_host(), &state).unwrap();
        assert_eq!(execution.exit_orders.len(), 1);
        assert!(execution.exit_orders[0].trigger().is_short);
    }

    #[test]
    fn test_closing_fill_arms_nothing() {
        let mut state = state(100_000.0, 100.0, 1_000_000);
        state.positions.insert(
            symbol(),
            Position {
                symbol: symbol(),
                quantity: 10.0,
                average_price: Money::from_dollars(90.0),
            },
        );
        let mut order = market_order(Action::Sell, 10.0);
        order.stop_loss_price = Some(Money::from_dollars(80.0));

        let execution = Executor::execute_order(&order, &fractional_host(), &state).unwrap();
        assert!(execution.exit_orders.is_empty());
    }

    #[test]
    fn test_average_price_extends_weighted() {
        let mut state = state(100_000.0, 120.0, 1_000_000);
        state.positions.insert(
            symbol(),
            Position {
                symbol: symbol(),
                quantity: 10.0,
                average_price: Money::from_dollars(100.0),
            },
        );

        let execution =
            Executor::execute_order(&market_order(Action::Buy, 10.0), &fractional_host(), &state)
                .unwrap();
        assert_relative_eq!(execution.position.quantity, 20.0);
        assert_eq!(execution.position.average_price, Money::from_dollars(110.0));
    }

    #[test]
    fn test_average_price_unchanged_on_reduction() {
        let mut state = state(100_000.0, 120.0, 1_000_000);
        state.positions.insert(
            symbol(),
            Position {
                symbol: symbol(),
                quantity: 10.0,
                average_price: Money::from_dollars(100.0),
            },
        );

        let execution =
            Executor::execute_order(&market_order(Action::Sell, 4.0), &fractional_host(), &state)
                .unwrap();
        assert_relative_eq!(execution.position.quantity, 6.0);
        assert_eq!(execution.position.average_price, Money::from_dollars(100.0));
    }

    #[test]
    fn test_average_price_resets_on_zero_cross() {
        let mut state = state(100_000.0, 120.0, 1_000_000);
        state.positions.insert(
            symbol(),
            Position {
                symbol: symbol(),
                quantity: 10.0,
                average_price: Money::from_dollars(100.0),
            },
        );

        // Sell 15: close 10 long, open 5 short at the fill price.
        let execution =
            Executor::execute_order(&market_order(Action::Sell, 15.0), &fractional_host(), &state)
                .unwrap();
        assert_relative_eq!(execution.position.quantity, -5.0);
        assert_eq!(execution.position.average_price, Money::from_dollars(120.0));
    }

    #[test]
    fn test_signal_to_order_derives_protective_prices() {
        let host = HostParams {
            allow_fractional_shares: Some(true),
            use_stop_loss: Some(true),
            stop_loss_pct: Some(0.1),
            use_take_profit: Some(true),
            take_profit_pct: Some(0.2),
            position_size_value: Some(0.02),
            ..HostParams::default()
        };
        let state = state(100_000.0, 100.0, 1_000_000);
        let signal = Signal {
            symbol: symbol(),
            action: Action::Buy,
        };

        let order = Executor::signal_to_order(&signal, &host, &state).unwrap();
        assert_eq!(order.order_type, OrderType::Market);
        assert_relative_eq!(order.quantity, 20.0, epsilon = 1e-9);
        assert_eq!(order.stop_loss_price, Some(Money::from_dollars(90.0)));
        assert_eq!(order.take_profit_price, Some(Money::from_dollars(120.0)));
        assert_eq!(order.created_at_ns, state.current_timestamp_ns);
    }

    #[test]
    fn test_commission_reduces_cash_on_both_sides() {
        let host = HostParams {
            allow_fractional_shares: Some(true),
            commission: Some(1.0),
            commission_type: Some(crate::plugin::manifest::CommissionType::Flat),
            ..HostParams::default()
        };
        let mut state = state(100_000.0, 100.0, 1_000_000);

        let buy =
            Executor::execute_order(&market_order(Action::Buy, 10.0), &host, &state).unwrap();
        assert_eq!(buy.cash_delta, Money::from_dollars(-1_001.0));

        state.positions.insert(
            symbol(),
            Position {
                symbol: symbol(),
                quantity: 10.0,
                average_price: Money::from_dollars(100.0),
            },
        );
        let sell =
            Executor::execute_order(&market_order(Action::Sell, 10.0), &host, &state).unwrap();
        assert_eq!(sell.cash_delta, Money::from_dollars(999.0));
    }

    #[test]
    fn test_close_only_buy_requires_cash() {
        // Short 10 at $100, price doubles; the closing buy costs more
        // cash than the account has.
        let mut state = state(100.0, 200.0, 1_000_000);
        state.positions.insert(
            symbol(),
            Position {
                symbol: symbol(),
                quantity: -10.0,
                average_price: Money::from_dollars(100.0),
            },
        );

        let result =
            Executor::execute_order(&market_order(Action::Buy, 10.0), &fractional_host(), &state);
        assert!(matches!(result, Err(OrderDeclined::InsufficientCash { .. })));
    }
}
