//! Plugin loading and the trait seam the engine drives
//!
//! `StrategyPlugin` is the host-side view of a loaded plugin. Native
//! plugins come from dynamic libraries exporting `create_plugin`;
//! interpreted plugins go through a process-wide `InterpreterRuntime`
//! registered once at startup, so native plugins never pay for an
//! interpreter.

use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;
use std::sync::OnceLock;

use libloading::Library;
use thiserror::Error;

use crate::models::{Action, Bar, Instruction, Order, OrderType, Signal, Symbol};
use crate::money::Money;
use crate::state::BacktestState;

use super::abi::{
    CBar, CEquitySnapshot, CFill, CInstruction, CKeyValue, CPluginOptions, CPluginResult,
    CPosition, CState, CreatePluginFn, PluginExport, CREATE_PLUGIN_SYMBOL, INSTRUCTION_ORDER,
    INSTRUCTION_SIGNAL, NULL_MONEY, PLUGIN_API_VERSION,
};
use super::manifest::{PluginKind, PluginManifest};

static BUY_C: &[u8] = b"BUY\0";
static SELL_C: &[u8] = b"SELL\0";

/// Diagnostic reported by (or about) a plugin; any nonzero code from a
/// callback aborts the backtest.
#[derive(Debug, Error)]
#[error("plugin {stage} failed with code {code}: {message}")]
pub struct PluginError {
    pub stage: &'static str,
    pub code: i32,
    pub message: String,
}

impl PluginError {
    pub fn new(stage: &'static str, code: i32, message: impl Into<String>) -> Self {
        PluginError {
            stage,
            code,
            message: message.into(),
        }
    }
}

/// Host-side handle to a loaded strategy plugin
pub trait StrategyPlugin {
    fn name(&self) -> &str;

    fn on_init(&mut self, options: &[(String, String)]) -> Result<(), PluginError>;

    fn on_start(&mut self) -> Result<(), PluginError>;

    /// Observe a bar and return the instructions to schedule.
    /// Callbacks run synchronously on the engine's worker and must not
    /// block.
    fn on_bar(&mut self, bar: &Bar, state: &BacktestState) -> Result<Vec<Instruction>, PluginError>;

    /// Final callback; returns the strategy's summary JSON.
    fn on_end(&mut self) -> Result<String, PluginError>;
}

/// Process-wide runtime for interpreted plugin kinds.
///
/// Initialized lazily by the embedding binary before the first
/// interpreted plugin loads; torn down with the process.
pub trait InterpreterRuntime: Send + Sync {
    fn load(&self, manifest: &PluginManifest) -> Result<Box<dyn StrategyPlugin>, PluginError>;
}

static INTERPRETER: OnceLock<Box<dyn InterpreterRuntime>> = OnceLock::new();

/// Register the interpreter runtime backing `kind: python` plugins.
/// May be called at most once per process.
pub fn register_interpreter(runtime: Box<dyn InterpreterRuntime>) -> Result<(), PluginError> {
    INTERPRETER
        .set(runtime)
        .map_err(|_| PluginError::new("register", 1, "interpreter runtime already registered"))
}

/// Load the plugin a manifest describes.
pub fn load_plugin(manifest: &PluginManifest) -> Result<Box<dyn StrategyPlugin>, PluginError> {
    match manifest.kind {
        PluginKind::Native => Ok(Box::new(NativePlugin::load(manifest)?)),
        PluginKind::Python => match INTERPRETER.get() {
            Some(runtime) => runtime.load(manifest),
            None => Err(PluginError::new(
                "load",
                1,
                format!(
                    "no interpreter runtime registered for python plugin '{}'",
                    manifest.name
                ),
            )),
        },
    }
}

/// Strategy plugin backed by a dynamic library
pub struct NativePlugin {
    name: String,
    export: PluginExport,
    _library: Library,
}

impl NativePlugin {
    pub fn load(manifest: &PluginManifest) -> Result<Self, PluginError> {
        let library = unsafe { Library::new(&manifest.entry) }.map_err(|e| {
            PluginError::new(
                "load",
                1,
                format!("failed to open plugin library {}: {e}", manifest.entry),
            )
        })?;

        let export = {
            let create: libloading::Symbol<CreatePluginFn> =
                unsafe { library.get(CREATE_PLUGIN_SYMBOL) }.map_err(|e| {
                    PluginError::new("load", 1, format!("missing create_plugin symbol: {e}"))
                })?;
            unsafe { create() }
        };

        if export.api_version != PLUGIN_API_VERSION {
            return Err(PluginError::new(
                "load",
                1,
                format!(
                    "plugin api_version {} does not match engine api_version {}",
                    export.api_version, PLUGIN_API_VERSION
                ),
            ));
        }

        if export.instance.is_null() {
            return Err(PluginError::new("load", 1, "plugin returned a null instance"));
        }

        tracing::info!(plugin = %manifest.name, entry = %manifest.entry, "loaded native plugin");

        Ok(NativePlugin {
            name: manifest.name.clone(),
            export,
            _library: library,
        })
    }

    fn check(stage: &'static str, result: &CPluginResult) -> Result<(), PluginError> {
        if result.code != 0 {
            return Err(PluginError::new(
                stage,
                result.code,
                read_c_str(result.message).unwrap_or_else(|| "no diagnostic provided".to_string()),
            ));
        }
        Ok(())
    }
}

impl StrategyPlugin for NativePlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_init(&mut self, options: &[(String, String)]) -> Result<(), PluginError> {
        let on_init = self
            .export
            .vtable
            .on_init
            .ok_or_else(|| PluginError::new("on_init", 1, "undefined method"))?;

        let mut storage: Vec<(CString, CString)> = Vec::with_capacity(options.len());
        for (key, value) in options {
            storage.push((intern(key), intern(value)));
        }
        let items: Vec<CKeyValue> = storage
            .iter()
            .map(|(key, value)| CKeyValue {
                key: key.as_ptr(),
                value: value.as_ptr(),
            })
            .collect();
        let c_options = CPluginOptions {
            items: items.as_ptr(),
            count: items.len(),
        };

        let result = unsafe { on_init(self.export.instance, &c_options) };
        Self::check("on_init", &result)
    }

    fn on_start(&mut self) -> Result<(), PluginError> {
        let on_start = self
            .export
            .vtable
            .on_start
            .ok_or_else(|| PluginError::new("on_start", 1, "undefined method"))?;
        let result = unsafe { on_start(self.export.instance) };
        Self::check("on_start", &result)
    }

    fn on_bar(&mut self, bar: &Bar, state: &BacktestState) -> Result<Vec<Instruction>, PluginError> {
        let on_bar = self
            .export
            .vtable
            .on_bar
            .ok_or_else(|| PluginError::new("on_bar", 1, "undefined method"))?;

        let bar_symbol = intern(bar.symbol.as_str());
        let c_bar = CBar {
            symbol: bar_symbol.as_ptr(),
            unix_ts_ns: bar.unix_ts_ns,
            open: bar.open,
            high: bar.high,
            low: bar.low,
            close: bar.close,
            volume: bar.volume,
        };

        let buffers = StateBuffers::build(state);
        let c_state = buffers.as_c_state(state);

        let result = unsafe { on_bar(self.export.instance, &c_bar, &c_state) };
        Self::check("on_bar", &result)?;

        convert_instructions(&result)
    }

    fn on_end(&mut self) -> Result<String, PluginError> {
        let on_end = self
            .export
            .vtable
            .on_end
            .ok_or_else(|| PluginError::new("on_end", 1, "undefined method"))?;

        let mut json_out: *const c_char = ptr::null();
        let result = unsafe { on_end(self.export.instance, &mut json_out) };

        let summary = read_c_str(json_out).unwrap_or_default();
        if !json_out.is_null() {
            if let Some(free_string) = self.export.vtable.free_string {
                unsafe { free_string(self.export.instance, json_out) };
            }
        }

        Self::check("on_end", &result)?;
        Ok(summary)
    }
}

impl Drop for NativePlugin {
    fn drop(&mut self) {
        if let Some(destroy) = self.export.vtable.destroy {
            if !self.export.instance.is_null() {
                unsafe { destroy(self.export.instance) };
                self.export.instance = ptr::null_mut();
            }
        }
    }
}

/// Flat snapshot of `BacktestState` with the C-string storage the
/// pointers in `CState` borrow from. Must outlive the plugin call.
struct StateBuffers {
    /// Keeps the symbol strings alive for the pointers below
    _strings: Vec<CString>,
    positions: Vec<CPosition>,
    fills: Vec<CFill>,
    snapshots: Vec<CEquitySnapshot>,
}

impl StateBuffers {
    fn build(state: &BacktestState) -> Self {
        let mut strings: Vec<CString> = Vec::new();
        let mut positions: Vec<CPosition> = Vec::with_capacity(state.positions.len());
        let mut fills: Vec<CFill> = Vec::with_capacity(state.trade_history.len());
        let mut snapshots: Vec<CEquitySnapshot> = Vec::with_capacity(state.equity_curve.len());

        for (symbol, position) in &state.positions {
            let symbol_ptr = intern_into(&mut strings, symbol.as_str());
            positions.push(CPosition {
                symbol: symbol_ptr,
                quantity: position.quantity,
                average_price: position.average_price.as_microdollars(),
            });
        }

        for fill in &state.trade_history {
            let symbol_ptr = intern_into(&mut strings, fill.symbol.as_str());
            fills.push(CFill {
                symbol: symbol_ptr,
                action: action_ptr(fill.action),
                quantity: fill.quantity,
                price: fill.price.as_microdollars(),
                created_at_ns: fill.created_at_ns,
            });
        }

        for snapshot in &state.equity_curve {
            snapshots.push(CEquitySnapshot {
                timestamp_ns: snapshot.timestamp_ns,
                equity: snapshot.equity.as_microdollars(),
                net_return: snapshot.net_return,
                max_drawdown: snapshot.max_drawdown,
                sharpe_ratio: snapshot.sharpe_ratio,
                sortino_ratio: snapshot.sortino_ratio,
                calmar_ratio: snapshot.calmar_ratio,
                tail_ratio: snapshot.tail_ratio,
                value_at_risk: snapshot.value_at_risk,
                conditional_value_at_risk: snapshot.conditional_value_at_risk,
            });
        }

        StateBuffers {
            _strings: strings,
            positions,
            fills,
            snapshots,
        }
    }

    fn as_c_state(&self, state: &BacktestState) -> CState {
        CState {
            cash: state.cash.as_microdollars(),
            positions: self.positions.as_ptr(),
            positions_count: self.positions.len(),
            trade_history: self.fills.as_ptr(),
            trade_history_count: self.fills.len(),
            equity_curve: self.snapshots.as_ptr(),
            equity_curve_count: self.snapshots.len(),
        }
    }
}

fn action_ptr(action: Action) -> *const c_char {
    match action {
        Action::Buy => BUY_C.as_ptr() as *const c_char,
        Action::Sell => SELL_C.as_ptr() as *const c_char,
    }
}

/// NUL-terminate a string for the ABI; interior NULs cannot occur in
/// symbols or manifest values, so an empty string stands in on failure.
fn intern(s: &str) -> CString {
    CString::new(s).unwrap_or_default()
}

fn intern_into(store: &mut Vec<CString>, s: &str) -> *const c_char {
    let c_string = intern(s);
    let ptr = c_string.as_ptr();
    store.push(c_string);
    ptr
}

fn read_c_str(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}

fn convert_instructions(result: &CPluginResult) -> Result<Vec<Instruction>, PluginError> {
    if result.instructions.is_null() || result.instructions_count == 0 {
        return Ok(Vec::new());
    }

    let raw =
        unsafe { std::slice::from_raw_parts(result.instructions, result.instructions_count) };
    raw.iter().map(convert_instruction).collect()
}

fn convert_instruction(c: &CInstruction) -> Result<Instruction, PluginError> {
    let symbol = read_c_str(c.symbol)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| PluginError::new("on_bar", 1, "instruction missing symbol"))?;
    let action = read_c_str(c.action)
        .and_then(|s| Action::parse(&s))
        .ok_or_else(|| PluginError::new("on_bar", 1, "instruction has invalid action"))?;

    match c.instruction_type {
        INSTRUCTION_SIGNAL => Ok(Instruction::Signal(Signal {
            symbol: Symbol::new(symbol),
            action,
        })),
        INSTRUCTION_ORDER => {
            let order_type = match read_c_str(c.order_type) {
                Some(s) => OrderType::parse(&s).ok_or_else(|| {
                    PluginError::new("on_bar", 1, format!("invalid order type: {s}"))
                })?,
                None => OrderType::Market,
            };
            Ok(Instruction::Order(Order {
                symbol: Symbol::new(symbol),
                action,
                quantity: c.quantity,
                order_type,
                limit_price: money_field(c.limit_price),
                stop_loss_price: money_field(c.stop_loss_price),
                take_profit_price: money_field(c.take_profit_price),
                leverage: (c.leverage > 0.0).then_some(c.leverage),
                created_at_ns: 0,
                filled_at_ns: 0,
                is_exit_order: false,
                source_fill_uuid: None,
            }))
        }
        other => Err(PluginError::new(
            "on_bar",
            1,
            format!("unknown instruction type: {other}"),
        )),
    }
}

fn money_field(raw: i64) -> Option<Money> {
    (raw != NULL_MONEY).then(|| Money::from_microdollars(raw))
}
