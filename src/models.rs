//! Core data types shared across the backtesting engine

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::money::Money;

/// Quantities below this threshold are treated as flat.
pub(crate) const QTY_EPSILON: f64 = 1e-9;

/// Instrument identifier using Arc<str> for cheap cloning
///
/// Symbols are cloned into every order, fill and position; Arc<str>
/// keeps those clones at a refcount bump instead of a heap copy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Symbol(Arc<str>);

impl Symbol {
    pub fn new(s: impl AsRef<str>) -> Self {
        Symbol(Arc::from(s.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Symbol {
    fn from(s: String) -> Self {
        Symbol(Arc::from(s.as_str()))
    }
}

impl From<Symbol> for String {
    fn from(s: Symbol) -> Self {
        s.0.to_string()
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validation errors for bar data
#[derive(Debug, Error)]
pub enum BarValidationError {
    #[error("high ({high}) must be >= low ({low})")]
    HighLessThanLow { high: f64, low: f64 },

    #[error("volume ({0}) must be >= 0")]
    NegativeVolume(f64),

    #[error("open ({open}) must be between low ({low}) and high ({high})")]
    OpenOutOfRange { open: f64, low: f64, high: f64 },

    #[error("close ({close}) must be between low ({low}) and high ({high})")]
    CloseOutOfRange { close: f64, low: f64, high: f64 },

    #[error("prices must be positive: open={open}, high={high}, low={low}, close={close}")]
    NonPositivePrice {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    },
}

/// OHLCV bar for one symbol over a fixed time window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: Symbol,
    pub unix_ts_ns: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    /// Validate the bar data
    pub fn validate(&self) -> Result<(), BarValidationError> {
        if self.open <= 0.0 || self.high <= 0.0 || self.low <= 0.0 || self.close <= 0.0 {
            return Err(BarValidationError::NonPositivePrice {
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
            });
        }

        if self.high < self.low {
            return Err(BarValidationError::HighLessThanLow {
                high: self.high,
                low: self.low,
            });
        }

        if self.volume < 0.0 {
            return Err(BarValidationError::NegativeVolume(self.volume));
        }

        if self.open < self.low || self.open > self.high {
            return Err(BarValidationError::OpenOutOfRange {
                open: self.open,
                low: self.low,
                high: self.high,
            });
        }

        if self.close < self.low || self.close > self.high {
            return Err(BarValidationError::CloseOutOfRange {
                close: self.close,
                low: self.low,
                high: self.high,
            });
        }

        Ok(())
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Buy,
    Sell,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Buy => "BUY",
            Action::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(Action::Buy),
            "SELL" => Some(Action::Sell),
            _ => None,
        }
    }
}

/// Order pricing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "MARKET" => Some(OrderType::Market),
            "LIMIT" => Some(OrderType::Limit),
            _ => None,
        }
    }
}

/// Fully-specified trade directive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub symbol: Symbol,
    pub action: Action,
    pub quantity: f64,
    pub order_type: OrderType,
    pub limit_price: Option<Money>,
    pub stop_loss_price: Option<Money>,
    pub take_profit_price: Option<Money>,
    pub leverage: Option<f64>,
    pub created_at_ns: i64,
    pub filled_at_ns: i64,
    pub is_exit_order: bool,
    pub source_fill_uuid: Option<Uuid>,
}

impl Order {
    /// Plain market order with no protective prices
    pub fn market(symbol: Symbol, action: Action, quantity: f64, created_at_ns: i64) -> Self {
        Order {
            symbol,
            action,
            quantity,
            order_type: OrderType::Market,
            limit_price: None,
            stop_loss_price: None,
            take_profit_price: None,
            leverage: None,
            created_at_ns,
            filled_at_ns: 0,
            is_exit_order: false,
            source_fill_uuid: None,
        }
    }

    pub fn is_buy(&self) -> bool {
        self.action == Action::Buy
    }

    pub fn is_sell(&self) -> bool {
        self.action == Action::Sell
    }

    pub fn is_limit_order(&self) -> bool {
        self.order_type == OrderType::Limit
    }
}

/// Direction-only trading intent; the engine derives quantity and
/// protective prices from host parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub symbol: Symbol,
    pub action: Action,
}

/// What a plugin may hand back from `on_bar`
#[derive(Debug, Clone)]
pub enum Instruction {
    Order(Order),
    Signal(Signal),
}

/// Executed trade fragment, append-only and uniquely identified
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub uuid: Uuid,
    pub symbol: Symbol,
    pub action: Action,
    pub quantity: f64,
    pub price: Money,
    pub created_at_ns: i64,
}

impl Fill {
    pub fn new(
        symbol: Symbol,
        action: Action,
        quantity: f64,
        price: Money,
        created_at_ns: i64,
    ) -> Self {
        Fill {
            uuid: Uuid::new_v4(),
            symbol,
            action,
            quantity,
            price,
            created_at_ns,
        }
    }
}

/// Net exposure in one symbol
///
/// Quantity may be negative (short). The average price is the
/// volume-weighted mean of the fills on the current side of zero;
/// crossing through zero resets the basis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub quantity: f64,
    pub average_price: Money,
}

impl Position {
    pub fn is_flat(&self) -> bool {
        self.quantity.abs() <= QTY_EPSILON
    }
}

/// Trigger parameters of an armed exit order
#[derive(Debug, Clone)]
pub struct ExitTrigger {
    pub symbol: Symbol,
    pub trigger_quantity: f64,
    pub trigger_price: Money,
    pub source_fill_uuid: Uuid,
    pub is_short: bool,
}

impl ExitTrigger {
    /// Synthetic market order that unwinds the guarded exposure.
    /// Long exposure exits with a SELL, short exposure with a BUY.
    pub fn to_market_order(&self, created_at_ns: i64) -> Order {
        let action = if self.is_short {
            Action::Buy
        } else {
            Action::Sell
        };
        let mut order = Order::market(
            self.symbol.clone(),
            action,
            self.trigger_quantity,
            created_at_ns,
        );
        order.is_exit_order = true;
        order.source_fill_uuid = Some(self.source_fill_uuid);
        order
    }
}

/// Auto-triggering protective order tied to a specific opening fill
#[derive(Debug, Clone)]
pub enum ExitOrder {
    StopLoss(ExitTrigger),
    TakeProfit(ExitTrigger),
}

impl ExitOrder {
    pub fn trigger(&self) -> &ExitTrigger {
        match self {
            ExitOrder::StopLoss(t) | ExitOrder::TakeProfit(t) => t,
        }
    }
}

/// Point-in-time equity record, appended once per resolved execution
///
/// The rolling risk ratios are carried for forward compatibility and
/// written as 0.0 until a rolling-window configuration is surfaced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquitySnapshot {
    pub timestamp_ns: i64,
    pub equity: Money,
    pub net_return: f64,
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub sharpe_ratio_rolling: f64,
    pub sortino_ratio: f64,
    pub sortino_ratio_rolling: f64,
    pub calmar_ratio: f64,
    pub calmar_ratio_rolling: f64,
    pub tail_ratio: f64,
    pub tail_ratio_rolling: f64,
    pub value_at_risk: f64,
    pub value_at_risk_rolling: f64,
    pub conditional_value_at_risk: f64,
    pub conditional_value_at_risk_rolling: f64,
}

impl EquitySnapshot {
    /// Snapshot with the deferred risk ratios zeroed
    pub fn basic(timestamp_ns: i64, equity: Money, net_return: f64, max_drawdown: f64) -> Self {
        EquitySnapshot {
            timestamp_ns,
            equity,
            net_return,
            max_drawdown,
            sharpe_ratio: 0.0,
            sharpe_ratio_rolling: 0.0,
            sortino_ratio: 0.0,
            sortino_ratio_rolling: 0.0,
            calmar_ratio: 0.0,
            calmar_ratio_rolling: 0.0,
            tail_ratio: 0.0,
            tail_ratio_rolling: 0.0,
            value_at_risk: 0.0,
            value_at_risk_rolling: 0.0,
            conditional_value_at_risk: 0.0,
            conditional_value_at_risk_rolling: 0.0,
        }
    }
}

/// Successful outcome of executing one order
#[derive(Debug, Clone)]
pub struct Execution {
    pub cash_delta: Money,
    pub fill: Fill,
    pub position: Position,
    /// Unfilled remainder when a volume cap split the order
    pub partial_order: Option<Order>,
    /// Protective orders to arm for the opening portion of the fill
    pub exit_orders: Vec<ExitOrder>,
    /// Source fill consumed when this execution came from an exit order
    pub closes_fill: Option<Uuid>,
}

/// Reasons an order is declined without filling
///
/// Declines are non-fatal: the engine drops the order and advances.
#[derive(Debug, Error)]
pub enum OrderDeclined {
    #[error("order quantity must be positive")]
    NonPositiveQuantity,

    #[error("no price data for symbol: {0}")]
    MissingPrice(Symbol),

    #[error("no volume data for symbol: {0}")]
    MissingVolume(Symbol),

    #[error("exit order source fill no longer active")]
    StaleExitOrder,

    #[error("order quantity is too small to execute")]
    QuantityTooSmall,

    #[error("short selling is not allowed")]
    ShortSellingNotAllowed,

    #[error("leverage must be >= 1.0, got {0}")]
    LeverageBelowMinimum(f64),

    #[error("order leverage {leverage} exceeds maximum allowed {max_leverage}")]
    LeverageExceedsMaximum { leverage: f64, max_leverage: f64 },

    #[error("insufficient cash to close position: required {required}, available {available}")]
    InsufficientCash { required: Money, available: Money },

    #[error("insufficient margin: required {required} (margin {margin} + commission {commission}), available {available}")]
    InsufficientMargin {
        required: Money,
        margin: Money,
        commission: Money,
        available: Money,
    },
}
