//! End-to-end engine scenarios
//!
//! These tests drive the full bar loop through a scripted in-process
//! plugin and assert on the resulting state: fills, cash, positions,
//! active-fill indices and the equity curve.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use stratforge::engine::BacktestEngine;
use stratforge::models::{Action, Bar, Instruction, Order, Signal, Symbol};
use stratforge::money::Money;
use stratforge::plugin::loader::{PluginError, StrategyPlugin};
use stratforge::plugin::manifest::{HostParams, PositionSizingMethod};
use stratforge::state::BacktestState;

// =============================================================================
// Test Utilities
// =============================================================================

const SECOND_NS: i64 = 1_000_000_000;

fn symbol() -> Symbol {
    Symbol::new("AAA")
}

fn bar(ts_ns: i64, close: f64, volume: f64) -> Bar {
    Bar {
        symbol: symbol(),
        unix_ts_ns: ts_ns,
        open: close,
        high: close,
        low: close,
        close,
        volume,
    }
}

fn host(initial_capital: i64) -> HostParams {
    HostParams {
        initial_capital,
        ..HostParams::default()
    }
}

fn buy(quantity: f64) -> Instruction {
    Instruction::Order(Order::market(symbol(), Action::Buy, quantity, 0))
}

fn sell(quantity: f64) -> Instruction {
    Instruction::Order(Order::market(symbol(), Action::Sell, quantity, 0))
}

/// Plugin that plays back a fixed per-timestamp script of instructions
/// and records which bars it was shown.
struct ScriptedPlugin {
    script: HashMap<i64, Vec<Instruction>>,
    bars_seen: Arc<Mutex<Vec<i64>>>,
}

impl ScriptedPlugin {
    fn new(script: Vec<(i64, Vec<Instruction>)>) -> (Self, Arc<Mutex<Vec<i64>>>) {
        let bars_seen = Arc::new(Mutex::new(Vec::new()));
        (
            ScriptedPlugin {
                script: script.into_iter().collect(),
                bars_seen: bars_seen.clone(),
            },
            bars_seen,
        )
    }
}

impl StrategyPlugin for ScriptedPlugin {
    fn name(&self) -> &str {
        "scripted"
    }

    fn on_init(&mut self, _options: &[(String, String)]) -> Result<(), PluginError> {
        Ok(())
    }

    fn on_start(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    fn on_bar(
        &mut self,
        bar: &Bar,
        _state: &BacktestState,
    ) -> Result<Vec<Instruction>, PluginError> {
        self.bars_seen.lock().unwrap().push(bar.unix_ts_ns);
        Ok(self.script.remove(&bar.unix_ts_ns).unwrap_or_default())
    }

    fn on_end(&mut self) -> Result<String, PluginError> {
        Ok(r#"{"status":"done"}"#.to_string())
    }
}

fn run_scripted(
    host_params: HostParams,
    script: Vec<(i64, Vec<Instruction>)>,
    bars: &[Bar],
) -> (BacktestEngine, stratforge::report::BacktestReport) {
    let (plugin, _) = ScriptedPlugin::new(script);
    let mut engine = BacktestEngine::new(host_params, Box::new(plugin));
    let report = engine.run(bars).expect("backtest should complete");
    (engine, report)
}

// =============================================================================
// Literal scenarios
// =============================================================================

#[test]
fn test_buy_hold_sell() {
    let bars = [
        bar(SECOND_NS, 100.0, 1_000_000.0),
        bar(2 * SECOND_NS, 110.0, 1_000_000.0),
    ];
    let script = vec![
        (SECOND_NS, vec![buy(10.0)]),
        (2 * SECOND_NS, vec![sell(10.0)]),
    ];

    let (engine, report) = run_scripted(host(100_000), script, &bars);
    let state = engine.state();

    // Buy 10 @ 100, sell 10 @ 110: a $100 round trip on $100k.
    assert_eq!(state.cash, Money::from_dollars(100_100.0));
    assert!(state.positions.is_empty());
    assert_eq!(state.trade_history.len(), 2);
    assert_eq!(state.equity_curve.len(), 2);

    assert_eq!(state.trade_history[0].price, Money::from_dollars(100.0));
    assert_eq!(state.trade_history[1].price, Money::from_dollars(110.0));

    assert_eq!(report.total_fills, 2);
    assert_eq!(report.final_equity, Money::from_dollars(100_100.0));
    assert_eq!(report.strategy_summary["status"], "done");

    // Equity timestamps never run backwards.
    for window in state.equity_curve.windows(2) {
        assert!(window[0].timestamp_ns <= window[1].timestamp_ns);
    }
}

#[test]
fn test_partial_fill_by_volume_cap() {
    let host_params = HostParams {
        fill_max_pct_of_volume: Some(0.1),
        allow_fractional_shares: Some(true),
        ..host(100_000)
    };
    let bars = [bar(SECOND_NS, 100.0, 100.0)];
    let script = vec![(SECOND_NS, vec![buy(50.0)])];

    let (engine, _) = run_scripted(host_params, script, &bars);
    let state = engine.state();

    // The cap allows 10 shares per execution; the continuation order is
    // rescheduled at the same bar and keeps filling until exhausted.
    assert_eq!(state.trade_history[0].quantity, 10.0);
    assert!(state
        .trade_history
        .iter()
        .all(|fill| fill.quantity == 10.0 && fill.created_at_ns == SECOND_NS));
    assert_eq!(state.trade_history.len(), 5);
    assert_eq!(state.positions.get(&symbol()).unwrap().quantity, 50.0);
    assert_eq!(state.cash, Money::from_dollars(95_000.0));
}

#[test]
fn test_insufficient_margin_declines_order() {
    let bars = [bar(SECOND_NS, 100.0, 1_000_000.0)];
    let script = vec![(SECOND_NS, vec![buy(100.0)])];

    let (engine, report) = run_scripted(host(1_000), script, &bars);
    let state = engine.state();

    // Order dropped, state untouched.
    assert_eq!(state.cash, Money::from_dollars(1_000.0));
    assert!(state.positions.is_empty());
    assert!(state.trade_history.is_empty());
    assert!(state.equity_curve.is_empty());
    assert_eq!(report.total_fills, 0);
    assert_eq!(report.final_equity, Money::from_dollars(1_000.0));
}

#[test]
fn test_stop_loss_trigger_closes_position() {
    let bars = [
        bar(SECOND_NS, 100.0, 1_000_000.0),
        bar(2 * SECOND_NS, 85.0, 1_000_000.0),
    ];
    let mut entry = Order::market(symbol(), Action::Buy, 1.0, 0);
    entry.stop_loss_price = Some(Money::from_dollars(90.0));
    let script = vec![(SECOND_NS, vec![Instruction::Order(entry)])];

    let (engine, _) = run_scripted(host(100_000), script, &bars);
    let state = engine.state();

    assert_eq!(state.trade_history.len(), 2);
    assert!(state.positions.is_empty());
    assert!(state.active_buy_fills.is_empty());
    assert!(state.active_sell_fills.is_empty());

    let exit_fill = &state.trade_history[1];
    assert_eq!(exit_fill.action, Action::Sell);
    assert_eq!(exit_fill.price, Money::from_dollars(85.0));
    assert_eq!(state.cash, Money::from_dollars(99_985.0));
}

#[test]
fn test_market_hours_skip() {
    // 2023-06-17 18:00 UTC: a Saturday, 14:00 in New York.
    let saturday_ns = 1_687_024_800 * SECOND_NS;
    let host_params = HostParams {
        market_hours_only: Some(true),
        timezone: Some("America/New_York".to_string()),
        ..host(100_000)
    };
    let bars = [bar(saturday_ns, 100.0, 1_000_000.0)];

    let (plugin, bars_seen) = ScriptedPlugin::new(vec![(saturday_ns, vec![buy(1.0)])]);
    let mut engine = BacktestEngine::new(host_params, Box::new(plugin));
    engine.run(&bars).unwrap();

    // The plugin never saw the bar and state never observed it.
    assert!(bars_seen.lock().unwrap().is_empty());
    let state = engine.state();
    assert_eq!(state.current_timestamp_ns, 0);
    assert!(state.current_bar_prices.is_empty());
    assert!(state.trade_history.is_empty());
}

#[test]
fn test_stale_exit_order_is_dropped() {
    let bars = [
        bar(SECOND_NS, 100.0, 1_000_000.0),
        bar(2 * SECOND_NS, 95.0, 1_000_000.0),
        bar(3 * SECOND_NS, 85.0, 1_000_000.0),
    ];
    let mut entry = Order::market(symbol(), Action::Buy, 1.0, 0);
    entry.stop_loss_price = Some(Money::from_dollars(90.0));
    let script = vec![
        (SECOND_NS, vec![Instruction::Order(entry)]),
        // Manual close before the stop fires.
        (2 * SECOND_NS, vec![sell(1.0)]),
    ];

    let (engine, _) = run_scripted(host(100_000), script, &bars);
    let state = engine.state();

    // Entry and manual close only; the synthetic stop-loss sell was
    // declined because its source fill is no longer active.
    assert_eq!(state.trade_history.len(), 2);
    assert!(state.positions.is_empty());
    assert_eq!(state.cash, Money::from_dollars(99_995.0));
}

// =============================================================================
// Additional engine behavior
// =============================================================================

#[test]
fn test_take_profit_trigger() {
    let bars = [
        bar(SECOND_NS, 100.0, 1_000_000.0),
        bar(2 * SECOND_NS, 125.0, 1_000_000.0),
    ];
    let mut entry = Order::market(symbol(), Action::Buy, 1.0, 0);
    entry.take_profit_price = Some(Money::from_dollars(120.0));
    let script = vec![(SECOND_NS, vec![Instruction::Order(entry)])];

    let (engine, _) = run_scripted(host(100_000), script, &bars);
    let state = engine.state();

    assert_eq!(state.trade_history.len(), 2);
    assert!(state.positions.is_empty());
    assert_eq!(state.trade_history[1].action, Action::Sell);
    assert_eq!(state.trade_history[1].price, Money::from_dollars(125.0));
    assert_eq!(state.cash, Money::from_dollars(100_025.0));
}

#[test]
fn test_short_stop_loss_exits_with_buy() {
    let bars = [
        bar(SECOND_NS, 100.0, 1_000_000.0),
        bar(2 * SECOND_NS, 115.0, 1_000_000.0),
    ];
    let mut entry = Order::market(symbol(), Action::Sell, 1.0, 0);
    entry.stop_loss_price = Some(Money::from_dollars(110.0));
    let script = vec![(SECOND_NS, vec![Instruction::Order(entry)])];

    let (engine, _) = run_scripted(host(100_000), script, &bars);
    let state = engine.state();

    // Short at 100, stopped out at 115 by a synthetic buy.
    assert_eq!(state.trade_history.len(), 2);
    assert_eq!(state.trade_history[1].action, Action::Buy);
    assert!(state.positions.is_empty());
    assert_eq!(state.cash, Money::from_dollars(99_985.0));
    assert!(state.active_sell_fills.is_empty());
}

#[test]
fn test_stop_not_triggered_above_trigger_price() {
    let bars = [
        bar(SECOND_NS, 100.0, 1_000_000.0),
        bar(2 * SECOND_NS, 95.0, 1_000_000.0),
    ];
    let mut entry = Order::market(symbol(), Action::Buy, 1.0, 0);
    entry.stop_loss_price = Some(Money::from_dollars(90.0));
    let script = vec![(SECOND_NS, vec![Instruction::Order(entry)])];

    let (engine, _) = run_scripted(host(100_000), script, &bars);
    let state = engine.state();

    // Price stayed above the stop; the position survives and the
    // opening fill stays active.
    assert_eq!(state.trade_history.len(), 1);
    assert_eq!(state.positions.get(&symbol()).unwrap().quantity, 1.0);
    assert_eq!(state.active_buy_fills.len(), 1);
    assert!(state
        .active_buy_fills
        .contains(&state.trade_history[0].uuid));
}

#[test]
fn test_signal_is_sized_by_host_params() {
    let host_params = HostParams {
        position_sizing_method: Some(PositionSizingMethod::FixedDollar),
        position_size_value: Some(1_000.0),
        ..host(100_000)
    };
    let bars = [bar(SECOND_NS, 100.0, 1_000_000.0)];
    let script = vec![(
        SECOND_NS,
        vec![Instruction::Signal(Signal {
            symbol: symbol(),
            action: Action::Buy,
        })],
    )];

    let (engine, _) = run_scripted(host_params, script, &bars);
    let state = engine.state();

    // $1,000 at $100 a share.
    assert_eq!(state.trade_history.len(), 1);
    assert_eq!(state.trade_history[0].quantity, 10.0);
    assert_eq!(state.cash, Money::from_dollars(99_000.0));
}

#[test]
fn test_integer_mode_floors_fills() {
    let bars = [bar(SECOND_NS, 100.0, 1_000_000.0)];
    let script = vec![(SECOND_NS, vec![buy(2.9)])];

    let (engine, _) = run_scripted(host(100_000), script, &bars);
    let state = engine.state();

    assert_eq!(state.trade_history.len(), 1);
    assert_eq!(state.trade_history[0].quantity, 2.0);
    assert_eq!(state.trade_history[0].quantity.fract(), 0.0);
}

#[test]
fn test_slippage_delays_fill_to_later_bar() {
    let host_params = HostParams {
        slippage: Some(1.5),
        slippage_model: Some(stratforge::plugin::manifest::SlippageModel::TimeBased),
        ..host(100_000)
    };
    let bars = [
        bar(SECOND_NS, 100.0, 1_000_000.0),
        bar(2 * SECOND_NS, 104.0, 1_000_000.0),
        bar(3 * SECOND_NS, 108.0, 1_000_000.0),
    ];
    let script = vec![(SECOND_NS, vec![buy(1.0)])];

    let (engine, _) = run_scripted(host_params, script, &bars);
    let state = engine.state();

    // Submitted at t=1s with a 1.5s delay: fillable from t=2.5s, so it
    // fills on the t=3s bar at that bar's close.
    assert_eq!(state.trade_history.len(), 1);
    assert_eq!(state.trade_history[0].price, Money::from_dollars(108.0));
    assert_eq!(state.trade_history[0].created_at_ns, 3 * SECOND_NS);
}

#[test]
fn test_plugin_error_aborts_run() {
    struct FailingPlugin;

    impl StrategyPlugin for FailingPlugin {
        fn name(&self) -> &str {
            "failing"
        }
        fn on_init(&mut self, _options: &[(String, String)]) -> Result<(), PluginError> {
            Ok(())
        }
        fn on_start(&mut self) -> Result<(), PluginError> {
            Ok(())
        }
        fn on_bar(
            &mut self,
            _bar: &Bar,
            _state: &BacktestState,
        ) -> Result<Vec<Instruction>, PluginError> {
            Err(PluginError::new("on_bar", 7, "strategy blew up"))
        }
        fn on_end(&mut self) -> Result<String, PluginError> {
            Ok(String::new())
        }
    }

    let mut engine = BacktestEngine::new(host(100_000), Box::new(FailingPlugin));
    let error = engine
        .run(&[bar(SECOND_NS, 100.0, 1_000_000.0)])
        .unwrap_err();
    assert!(error.to_string().contains("strategy blew up"));
}

#[test]
fn test_cash_conservation_across_run() {
    let bars: Vec<Bar> = (1..=6)
        .map(|i| bar(i * SECOND_NS, 100.0 + i as f64, 1_000_000.0))
        .collect();
    let script = vec![
        (SECOND_NS, vec![buy(5.0)]),
        (2 * SECOND_NS, vec![buy(3.0)]),
        (4 * SECOND_NS, vec![sell(6.0)]),
        (6 * SECOND_NS, vec![sell(2.0)]),
    ];

    let (engine, _) = run_scripted(host(100_000), script, &bars);
    let state = engine.state();

    // Replay the fills against the starting cash; the final balance
    // must be exactly the sum of deltas.
    let mut cash = Money::from_dollars(100_000.0);
    for fill in &state.trade_history {
        let value = fill.price * fill.quantity;
        match fill.action {
            Action::Buy => cash -= value,
            Action::Sell => cash += value,
        }
    }
    assert_eq!(state.cash, cash);
    assert!(state.positions.is_empty());

    // Every recorded fill timestamp is non-decreasing.
    for window in state.trade_history.windows(2) {
        assert!(window[0].created_at_ns <= window[1].created_at_ns);
    }
}

#[test]
fn test_active_fills_appear_in_trade_history() {
    let bars = [
        bar(SECOND_NS, 100.0, 1_000_000.0),
        bar(2 * SECOND_NS, 101.0, 1_000_000.0),
    ];
    let script = vec![
        (SECOND_NS, vec![buy(2.0)]),
        (2 * SECOND_NS, vec![buy(1.0)]),
    ];

    let (engine, _) = run_scripted(host(100_000), script, &bars);
    let state = engine.state();

    assert_eq!(state.active_buy_fills.len(), 2);
    let recorded: Vec<_> = state.trade_history.iter().map(|f| f.uuid).collect();
    for uuid in &state.active_buy_fills {
        assert!(recorded.contains(uuid));
    }
}
