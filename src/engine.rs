//! Backtest engine
//!
//! Drives the primary symbol's bar stream through a loaded strategy
//! plugin: pending orders wait on a timestamp-ordered instruction heap,
//! armed stop-loss and take-profit orders wait on price-ordered heaps,
//! and every resolved execution folds into the run's `BacktestState`.
//!
//! The engine is single-threaded within one backtest; plugin callbacks
//! run synchronously on the engine's worker.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use thiserror::Error;
use uuid::Uuid;

use crate::equity::EquityCalculator;
use crate::exchange::Exchange;
use crate::executor::Executor;
use crate::models::{
    Action, Bar, EquitySnapshot, Execution, ExitOrder, ExitTrigger, Instruction, Order, Symbol,
};
use crate::money::Money;
use crate::plugin::loader::{PluginError, StrategyPlugin};
use crate::plugin::manifest::HostParams;
use crate::report::BacktestReport;
use crate::slippage::SlippageCalculator;
use crate::state::BacktestState;

/// Fatal conditions that abort a backtest
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Plugin(#[from] PluginError),

    #[error("no current price for symbol {0}")]
    MissingPrice(Symbol),
}

/// Pending order keyed by fill time; FIFO within a timestamp
struct ScheduledOrder {
    order: Order,
    seq: u64,
}

impl PartialEq for ScheduledOrder {
    fn eq(&self, other: &Self) -> bool {
        self.order.filled_at_ns == other.order.filled_at_ns && self.seq == other.seq
    }
}

impl Eq for ScheduledOrder {}

impl PartialOrd for ScheduledOrder {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledOrder {
    // Inverted so the BinaryHeap pops the earliest fill time first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .order
            .filled_at_ns
            .cmp(&self.order.filled_at_ns)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Armed stop-loss; the highest trigger price sits on top
struct ArmedStop {
    trigger: ExitTrigger,
    seq: u64,
}

impl PartialEq for ArmedStop {
    fn eq(&self, other: &Self) -> bool {
        self.trigger.trigger_price == other.trigger.trigger_price && self.seq == other.seq
    }
}

impl Eq for ArmedStop {}

impl PartialOrd for ArmedStop {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ArmedStop {
    fn cmp(&self, other: &Self) -> Ordering {
        self.trigger
            .trigger_price
            .cmp(&other.trigger.trigger_price)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Armed take-profit; the lowest trigger price sits on top
struct ArmedTarget {
    trigger: ExitTrigger,
    seq: u64,
}

impl PartialEq for ArmedTarget {
    fn eq(&self, other: &Self) -> bool {
        self.trigger.trigger_price == other.trigger.trigger_price && self.seq == other.seq
    }
}

impl Eq for ArmedTarget {}

impl PartialOrd for ArmedTarget {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ArmedTarget {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .trigger
            .trigger_price
            .cmp(&self.trigger.trigger_price)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// One backtest run over one plugin
pub struct BacktestEngine {
    host_params: HostParams,
    plugin: Box<dyn StrategyPlugin>,
    state: BacktestState,
    instruction_heap: BinaryHeap<ScheduledOrder>,
    stop_loss_heap: BinaryHeap<ArmedStop>,
    take_profit_heap: BinaryHeap<ArmedTarget>,
    seq: u64,
}

impl BacktestEngine {
    pub fn new(host_params: HostParams, plugin: Box<dyn StrategyPlugin>) -> Self {
        let initial_cash = Money::from_dollars(host_params.initial_capital as f64);
        BacktestEngine {
            host_params,
            plugin,
            state: BacktestState::new(initial_cash),
            instruction_heap: BinaryHeap::new(),
            stop_loss_heap: BinaryHeap::new(),
            take_profit_heap: BinaryHeap::new(),
            seq: 0,
        }
    }

    /// Final run state, for inspection after `run`
    pub fn state(&self) -> &BacktestState {
        &self.state
    }

    /// Run the full bar stream through the plugin and return the report
    pub fn run(&mut self, bars: &[Bar]) -> Result<BacktestReport, EngineError> {
        tracing::info!(
            plugin = self.plugin.name(),
            bars = bars.len(),
            "starting backtest"
        );

        self.plugin.on_start()?;

        for bar in bars {
            if !Exchange::is_within_market_hour_restrictions(bar.unix_ts_ns, &self.host_params) {
                tracing::trace!(symbol = %bar.symbol, ts = bar.unix_ts_ns, "bar outside market hours");
                continue;
            }

            self.state.observe_bar(bar);

            self.drain_instruction_heap()?;

            let instructions = self.plugin.on_bar(bar, &self.state)?;
            self.schedule_instructions(instructions)?;

            self.drain_stop_loss_heap();
            self.drain_take_profit_heap();

            // Zero-delay instructions emitted or triggered this bar
            // fill against this bar's close.
            self.drain_instruction_heap()?;
        }

        let summary = self.plugin.on_end()?;
        self.build_report(summary)
    }

    fn build_report(&self, summary: String) -> Result<BacktestReport, EngineError> {
        let final_equity = EquityCalculator::calculate_equity(&self.state)?;
        let final_drawdown = EquityCalculator::calculate_max_drawdown(&self.state, final_equity);
        let max_drawdown = self
            .state
            .equity_curve
            .iter()
            .map(|snapshot| snapshot.max_drawdown)
            .fold(final_drawdown, f64::max);

        Ok(BacktestReport {
            plugin_name: self.plugin.name().to_string(),
            initial_capital: Money::from_dollars(self.host_params.initial_capital as f64),
            final_equity,
            net_return: EquityCalculator::calculate_return(&self.host_params, final_equity),
            max_drawdown,
            total_fills: self.state.trade_history.len(),
            equity_curve: self.state.equity_curve.clone(),
            strategy_summary: serde_json::from_str(&summary).unwrap_or(serde_json::Value::Null),
        })
    }

    /// Stamp the fill time from the slippage model and enqueue
    fn schedule_order(&mut self, mut order: Order) {
        let delay_ns =
            SlippageCalculator::slippage_delay_ns(&order, &self.host_params, &self.state);
        order.filled_at_ns = self.state.current_timestamp_ns + delay_ns;
        self.seq += 1;
        self.instruction_heap.push(ScheduledOrder {
            order,
            seq: self.seq,
        });
    }

    fn schedule_instructions(&mut self, instructions: Vec<Instruction>) -> Result<(), EngineError> {
        for instruction in instructions {
            let mut order = match instruction {
                Instruction::Order(order) => order,
                Instruction::Signal(signal) => {
                    Executor::signal_to_order(&signal, &self.host_params, &self.state)?
                }
            };
            order.created_at_ns = self.state.current_timestamp_ns;
            self.schedule_order(order);
        }
        Ok(())
    }

    /// Execute everything whose fill time has arrived. Declined orders
    /// are dropped; partial fills are rescheduled with a fresh delay.
    fn drain_instruction_heap(&mut self) -> Result<(), EngineError> {
        while let Some(top) = self.instruction_heap.peek() {
            if top.order.filled_at_ns > self.state.current_timestamp_ns {
                break;
            }
            let Some(scheduled) = self.instruction_heap.pop() else {
                break;
            };

            match Executor::execute_order(&scheduled.order, &self.host_params, &self.state) {
                Ok(execution) => {
                    if let Some(partial_order) = execution.partial_order.clone() {
                        self.schedule_order(partial_order);
                    }
                    self.resolve_execution(execution)?;
                }
                Err(reason) => {
                    tracing::debug!(
                        symbol = %scheduled.order.symbol,
                        action = scheduled.order.action.as_str(),
                        %reason,
                        "order declined"
                    );
                }
            }
        }
        Ok(())
    }

    fn drain_stop_loss_heap(&mut self) {
        while let Some(armed) = self.stop_loss_heap.peek() {
            let Some(close) = self.state.price(&armed.trigger.symbol) else {
                break;
            };
            let fires = if armed.trigger.is_short {
                armed.trigger.trigger_price <= close
            } else {
                armed.trigger.trigger_price >= close
            };
            if !fires {
                break;
            }

            let Some(armed) = self.stop_loss_heap.pop() else {
                break;
            };
            tracing::debug!(
                symbol = %armed.trigger.symbol,
                trigger = %armed.trigger.trigger_price,
                "stop-loss triggered"
            );
            let order = armed.trigger.to_market_order(self.state.current_timestamp_ns);
            self.schedule_order(order);
        }
    }

    fn drain_take_profit_heap(&mut self) {
        while let Some(armed) = self.take_profit_heap.peek() {
            let Some(close) = self.state.price(&armed.trigger.symbol) else {
                break;
            };
            let fires = if armed.trigger.is_short {
                armed.trigger.trigger_price >= close
            } else {
                armed.trigger.trigger_price <= close
            };
            if !fires {
                break;
            }

            let Some(armed) = self.take_profit_heap.pop() else {
                break;
            };
            tracing::debug!(
                symbol = %armed.trigger.symbol,
                trigger = %armed.trigger.trigger_price,
                "take-profit triggered"
            );
            let order = armed.trigger.to_market_order(self.state.current_timestamp_ns);
            self.schedule_order(order);
        }
    }

    /// Fold a successful execution into state: cash, position, trade
    /// history, active-fill indices, armed exits and an equity snapshot.
    fn resolve_execution(&mut self, execution: Execution) -> Result<(), EngineError> {
        let Execution {
            cash_delta,
            fill,
            position,
            exit_orders,
            closes_fill,
            ..
        } = execution;

        self.state.cash += cash_delta;

        let symbol = position.symbol.clone();
        let closed_out = position.is_flat();
        if closed_out {
            self.state.positions.remove(&symbol);
        } else {
            self.state.positions.insert(symbol.clone(), position);
        }

        if let Some(source_uuid) = closes_fill {
            self.state.active_buy_fills.remove(&source_uuid);
            self.state.active_sell_fills.remove(&source_uuid);
        } else {
            match fill.action {
                Action::Buy => self.state.active_buy_fills.insert(fill.uuid),
                Action::Sell => self.state.active_sell_fills.insert(fill.uuid),
            };
        }

        self.state.trade_history.push(fill.clone());

        // A fully closed symbol leaves no live exposure behind: any
        // exit still referencing one of its fills must go stale.
        if closed_out {
            let stale: Vec<Uuid> = self
                .state
                .trade_history
                .iter()
                .filter(|recorded| recorded.symbol == symbol)
                .map(|recorded| recorded.uuid)
                .collect();
            for uuid in stale {
                self.state.active_buy_fills.remove(&uuid);
                self.state.active_sell_fills.remove(&uuid);
            }
        }

        for exit_order in exit_orders {
            self.seq += 1;
            match exit_order {
                ExitOrder::StopLoss(trigger) => self.stop_loss_heap.push(ArmedStop {
                    trigger,
                    seq: self.seq,
                }),
                ExitOrder::TakeProfit(trigger) => self.take_profit_heap.push(ArmedTarget {
                    trigger,
                    seq: self.seq,
                }),
            }
        }

        let equity = EquityCalculator::calculate_equity(&self.state)?;
        let net_return = EquityCalculator::calculate_return(&self.host_params, equity);
        let max_drawdown = EquityCalculator::calculate_max_drawdown(&self.state, equity);
        self.state.equity_curve.push(EquitySnapshot::basic(
            fill.created_at_ns,
            equity,
            net_return,
            max_drawdown,
        ));

        Ok(())
    }
}
