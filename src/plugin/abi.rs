//! Stable C ABI shared with strategy plugins
//!
//! Everything crossing the boundary is `#[repr(C)]`. Monetary fields
//! travel as raw microdollar counts; `NULL_MONEY` marks an unset
//! monetary field. Strings handed to the plugin are owned by the host
//! and valid only for the duration of the call; strings returned by the
//! plugin are owned by the plugin and released through `free_string`.

use std::os::raw::{c_char, c_void};

/// Engine ABI revision; manifests and plugin exports must match it.
pub const PLUGIN_API_VERSION: i64 = 1;

/// Sentinel for "unset" monetary fields.
pub const NULL_MONEY: i64 = i64::MIN;

/// `CInstruction::instruction_type` discriminants.
pub const INSTRUCTION_SIGNAL: i32 = 0;
pub const INSTRUCTION_ORDER: i32 = 1;

/// Exported entry point every native plugin must provide.
pub const CREATE_PLUGIN_SYMBOL: &[u8] = b"create_plugin";

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CBar {
    pub symbol: *const c_char,
    pub unix_ts_ns: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CPosition {
    pub symbol: *const c_char,
    pub quantity: f64,
    /// Microdollars
    pub average_price: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CFill {
    pub symbol: *const c_char,
    /// "BUY" or "SELL"
    pub action: *const c_char,
    pub quantity: f64,
    /// Microdollars
    pub price: i64,
    pub created_at_ns: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CEquitySnapshot {
    pub timestamp_ns: i64,
    /// Microdollars
    pub equity: i64,
    pub net_return: f64,
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub sortino_ratio: f64,
    pub calmar_ratio: f64,
    pub tail_ratio: f64,
    pub value_at_risk: f64,
    pub conditional_value_at_risk: f64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CState {
    /// Microdollars
    pub cash: i64,
    pub positions: *const CPosition,
    pub positions_count: usize,
    pub trade_history: *const CFill,
    pub trade_history_count: usize,
    pub equity_curve: *const CEquitySnapshot,
    pub equity_curve_count: usize,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CInstruction {
    /// INSTRUCTION_SIGNAL or INSTRUCTION_ORDER
    pub instruction_type: i32,
    pub symbol: *const c_char,
    /// "BUY" or "SELL"
    pub action: *const c_char,
    pub quantity: f64,
    /// "MARKET" or "LIMIT"; may be null for signals
    pub order_type: *const c_char,
    /// Microdollars, NULL_MONEY when unset
    pub limit_price: i64,
    /// Microdollars, NULL_MONEY when unset
    pub stop_loss_price: i64,
    /// Microdollars, NULL_MONEY when unset
    pub take_profit_price: i64,
    /// Values <= 0 mean unset
    pub leverage: f64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CKeyValue {
    pub key: *const c_char,
    pub value: *const c_char,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CPluginOptions {
    pub items: *const CKeyValue,
    pub count: usize,
}

/// Result of every plugin callback; code 0 is success. `instructions`
/// remains owned by the plugin and must stay valid until its next
/// callback.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CPluginResult {
    pub code: i32,
    pub message: *const c_char,
    pub instructions: *const CInstruction,
    pub instructions_count: usize,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PluginVTable {
    pub destroy: Option<unsafe extern "C" fn(instance: *mut c_void)>,
    pub on_init:
        Option<unsafe extern "C" fn(instance: *mut c_void, options: *const CPluginOptions) -> CPluginResult>,
    pub on_start: Option<unsafe extern "C" fn(instance: *mut c_void) -> CPluginResult>,
    pub on_bar: Option<
        unsafe extern "C" fn(instance: *mut c_void, bar: *const CBar, state: *const CState) -> CPluginResult,
    >,
    pub on_end:
        Option<unsafe extern "C" fn(instance: *mut c_void, json_out: *mut *const c_char) -> CPluginResult>,
    pub free_string: Option<unsafe extern "C" fn(instance: *mut c_void, ptr: *const c_char)>,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PluginExport {
    pub api_version: i64,
    pub instance: *mut c_void,
    pub vtable: PluginVTable,
}

/// Signature of the `create_plugin` symbol.
pub type CreatePluginFn = unsafe extern "C" fn() -> PluginExport;
