//! Plugin manifest loading and validation
//!
//! Each plugin ships a `manifest.json` naming its entry point and the
//! host parameters the engine simulates under. Allowed enum values are
//! enforced by serde; cross-field rules live in `validate`.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

use super::abi::PLUGIN_API_VERSION;

/// Timezones the exchange calendar understands.
const ALLOWED_TIMEZONES: &[&str] = &["America/New_York"];

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("unsupported api_version {found}, engine requires {required}")]
    ApiVersionMismatch { found: i64, required: i64 },

    #[error("missing required host_params field: {0}")]
    MissingField(&'static str),

    #[error("manifest must configure at least one symbol")]
    NoSymbols,

    #[error("manifest must mark exactly one symbol as primary, found {0}")]
    PrimarySymbolCount(usize),

    #[error("invalid {field}: {value} (expected ISO-8601)")]
    InvalidDatetime { field: &'static str, value: String },

    #[error("backtest_end_datetime must not precede backtest_start_datetime")]
    EmptyBacktestWindow,

    #[error("unsupported timezone: {0}")]
    UnsupportedTimezone(String),

    #[error("initial_capital must be positive, got {0}")]
    NonPositiveCapital(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    Python,
    Native,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimespanUnit {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
    Year,
}

impl TimespanUnit {
    pub fn as_str(self) -> &'static str {
        match self {
            TimespanUnit::Second => "second",
            TimespanUnit::Minute => "minute",
            TimespanUnit::Hour => "hour",
            TimespanUnit::Day => "day",
            TimespanUnit::Week => "week",
            TimespanUnit::Month => "month",
            TimespanUnit::Year => "year",
        }
    }

    /// Short form used in data file names, e.g. `1d`, `4h`
    pub fn abbrev(self) -> &'static str {
        match self {
            TimespanUnit::Second => "s",
            TimespanUnit::Minute => "m",
            TimespanUnit::Hour => "h",
            TimespanUnit::Day => "d",
            TimespanUnit::Week => "w",
            TimespanUnit::Month => "M",
            TimespanUnit::Year => "y",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionType {
    PerShare,
    Percentage,
    Flat,
}

impl CommissionType {
    pub fn as_str(self) -> &'static str {
        match self {
            CommissionType::PerShare => "per_share",
            CommissionType::Percentage => "percentage",
            CommissionType::Flat => "flat",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlippageModel {
    None,
    Fixed,
    Percentage,
    VolumeBased,
    TimeBased,
    TimeVolumeBased,
}

impl SlippageModel {
    pub fn as_str(self) -> &'static str {
        match self {
            SlippageModel::None => "none",
            SlippageModel::Fixed => "fixed",
            SlippageModel::Percentage => "percentage",
            SlippageModel::VolumeBased => "volume_based",
            SlippageModel::TimeBased => "time_based",
            SlippageModel::TimeVolumeBased => "time_volume_based",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSizingMethod {
    FixedPercentage,
    FixedDollar,
    EqualWeight,
}

impl PositionSizingMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            PositionSizingMethod::FixedPercentage => "fixed_percentage",
            PositionSizingMethod::FixedDollar => "fixed_dollar",
            PositionSizingMethod::EqualWeight => "equal_weight",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Currency {
    #[serde(rename = "USD")]
    Usd,
}

impl Currency {
    pub fn as_str(self) -> &'static str {
        match self {
            Currency::Usd => "USD",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationMode {
    None,
    GridSearch,
    Bayesian,
    Genetic,
}

impl OptimizationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            OptimizationMode::None => "none",
            OptimizationMode::GridSearch => "grid_search",
            OptimizationMode::Bayesian => "bayesian",
            OptimizationMode::Genetic => "genetic",
        }
    }
}

/// One instrument a backtest subscribes to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolConfig {
    pub symbol: String,
    pub primary: bool,
    pub timespan: i64,
    pub timespan_unit: TimespanUnit,
}

impl SymbolConfig {
    /// `{timespan}{unit}` short form, e.g. `1d`
    pub fn timeframe(&self) -> String {
        format!("{}{}", self.timespan, self.timespan_unit.abbrev())
    }
}

/// Simulation parameters the host enforces around the strategy
///
/// `market_hours_only`, `allow_fractional_shares`, `currency`,
/// `timezone` and `optimization_mode` are required manifest keys even
/// though they stay `Option` after parsing; `PluginManifest::validate`
/// enforces their presence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostParams {
    pub market_hours_only: Option<bool>,
    pub allow_fractional_shares: Option<bool>,
    pub allow_short_selling: Option<bool>,
    pub monte_carlo_runs: i64,
    pub monte_carlo_seed: i64,
    /// Starting cash, whole dollars
    pub initial_capital: i64,
    pub backtest_start_datetime: String,
    pub backtest_end_datetime: String,
    pub leverage: Option<f64>,
    pub initial_margin_pct: Option<f64>,
    pub fill_max_pct_of_volume: Option<f64>,
    pub position_sizing_method: Option<PositionSizingMethod>,
    pub position_size_value: Option<f64>,
    pub max_position_size: Option<f64>,
    pub use_stop_loss: Option<bool>,
    pub stop_loss_pct: Option<f64>,
    pub use_take_profit: Option<bool>,
    pub take_profit_pct: Option<f64>,
    pub commission: Option<f64>,
    pub commission_type: Option<CommissionType>,
    pub slippage: Option<f64>,
    pub slippage_model: Option<SlippageModel>,
    pub tax: Option<f64>,
    pub currency: Option<Currency>,
    pub timezone: Option<String>,
    pub optimization_mode: Option<OptimizationMode>,
    pub symbols: Vec<SymbolConfig>,
}

impl HostParams {
    /// Highest leverage any single order may request
    pub fn max_leverage(&self) -> f64 {
        self.leverage.unwrap_or(1.0)
    }

    /// Exchange calendar timezone; defaults to America/New_York
    pub fn tz(&self) -> chrono_tz::Tz {
        self.timezone
            .as_deref()
            .and_then(|name| name.parse().ok())
            .unwrap_or(chrono_tz::America::New_York)
    }

    /// Backtest window as inclusive nanosecond bounds
    pub fn backtest_window_ns(&self) -> Result<(i64, i64), ManifestError> {
        let start = parse_datetime_ns("backtest_start_datetime", &self.backtest_start_datetime)?;
        let end = parse_datetime_ns("backtest_end_datetime", &self.backtest_end_datetime)?;
        if end < start {
            return Err(ManifestError::EmptyBacktestWindow);
        }
        Ok((start, end))
    }
}

fn parse_datetime_ns(field: &'static str, value: &str) -> Result<i64, ManifestError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            // Accept offset-less ISO-8601 datetimes and assume UTC
            NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
                .map(|ndt| DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc))
        })
        .ok()
        .and_then(|dt| dt.timestamp_nanos_opt())
        .ok_or_else(|| ManifestError::InvalidDatetime {
            field,
            value: value.to_string(),
        })
}

/// Per-plugin configuration document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub kind: PluginKind,
    pub entry: String,
    pub version: String,
    pub api_version: i64,
    pub description: Option<String>,
    pub author: Option<String>,
    pub host_params: HostParams,
    /// Opaque sub-document forwarded to the plugin untouched
    pub strategy_params: serde_json::Value,
}

impl PluginManifest {
    /// Load and validate a manifest from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents =
            fs::read_to_string(path.as_ref()).context("Failed to read plugin manifest")?;
        let manifest: PluginManifest =
            serde_json::from_str(&contents).context("Failed to parse plugin manifest JSON")?;
        manifest
            .validate()
            .with_context(|| format!("Invalid manifest for plugin '{}'", manifest.name))?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), ManifestError> {
        if self.api_version != PLUGIN_API_VERSION {
            return Err(ManifestError::ApiVersionMismatch {
                found: self.api_version,
                required: PLUGIN_API_VERSION,
            });
        }

        let params = &self.host_params;

        // Required keys that stay optional after parsing; a manifest
        // omitting any of them must fail to load.
        if params.market_hours_only.is_none() {
            return Err(ManifestError::MissingField("market_hours_only"));
        }
        if params.allow_fractional_shares.is_none() {
            return Err(ManifestError::MissingField("allow_fractional_shares"));
        }
        if params.currency.is_none() {
            return Err(ManifestError::MissingField("currency"));
        }
        if params.timezone.is_none() {
            return Err(ManifestError::MissingField("timezone"));
        }
        if params.optimization_mode.is_none() {
            return Err(ManifestError::MissingField("optimization_mode"));
        }

        if params.symbols.is_empty() {
            return Err(ManifestError::NoSymbols);
        }

        let primary_count = params.symbols.iter().filter(|s| s.primary).count();
        if primary_count != 1 {
            return Err(ManifestError::PrimarySymbolCount(primary_count));
        }

        if params.initial_capital <= 0 {
            return Err(ManifestError::NonPositiveCapital(params.initial_capital));
        }

        if let Some(tz) = params.timezone.as_deref() {
            if !ALLOWED_TIMEZONES.contains(&tz) {
                return Err(ManifestError::UnsupportedTimezone(tz.to_string()));
            }
        }

        params.backtest_window_ns()?;

        Ok(())
    }

    /// The symbol whose bar stream drives the loop
    pub fn primary_symbol(&self) -> Option<&SymbolConfig> {
        self.host_params.symbols.iter().find(|s| s.primary)
    }

    /// Host params flattened into the key/value list handed to
    /// `on_init`, including `symbol_{i}_*` keys, `symbol_count` and the
    /// raw `strategy_params` JSON.
    pub fn flattened_options(&self) -> Vec<(String, String)> {
        let params = &self.host_params;
        let mut options: Vec<(String, String)> = Vec::new();

        let mut add = |key: &str, value: String| options.push((key.to_string(), value));

        if let Some(v) = params.market_hours_only {
            add("market_hours_only", v.to_string());
        }
        if let Some(v) = params.allow_fractional_shares {
            add("allow_fractional_shares", v.to_string());
        }
        if let Some(v) = params.allow_short_selling {
            add("allow_short_selling", v.to_string());
        }
        add("monte_carlo_runs", params.monte_carlo_runs.to_string());
        add("monte_carlo_seed", params.monte_carlo_seed.to_string());
        add("initial_capital", params.initial_capital.to_string());
        add(
            "backtest_start_datetime",
            params.backtest_start_datetime.clone(),
        );
        add(
            "backtest_end_datetime",
            params.backtest_end_datetime.clone(),
        );
        if let Some(v) = params.leverage {
            add("leverage", v.to_string());
        }
        if let Some(v) = params.initial_margin_pct {
            add("initial_margin_pct", v.to_string());
        }
        if let Some(v) = params.fill_max_pct_of_volume {
            add("fill_max_pct_of_volume", v.to_string());
        }
        if let Some(v) = params.position_sizing_method {
            add("position_sizing_method", v.as_str().to_string());
        }
        if let Some(v) = params.position_size_value {
            add("position_size_value", v.to_string());
        }
        if let Some(v) = params.max_position_size {
            add("max_position_size", v.to_string());
        }
        if let Some(v) = params.use_stop_loss {
            add("use_stop_loss", v.to_string());
        }
        if let Some(v) = params.stop_loss_pct {
            add("stop_loss_pct", v.to_string());
        }
        if let Some(v) = params.use_take_profit {
            add("use_take_profit", v.to_string());
        }
        if let Some(v) = params.take_profit_pct {
            add("take_profit_pct", v.to_string());
        }
        if let Some(v) = params.commission {
            add("commission", v.to_string());
        }
        if let Some(v) = params.commission_type {
            add("commission_type", v.as_str().to_string());
        }
        if let Some(v) = params.slippage {
            add("slippage", v.to_string());
        }
        if let Some(v) = params.slippage_model {
            add("slippage_model", v.as_str().to_string());
        }
        if let Some(v) = params.tax {
            add("tax", v.to_string());
        }
        if let Some(v) = params.currency {
            add("currency", v.as_str().to_string());
        }
        if let Some(v) = params.timezone.as_deref() {
            add("timezone", v.to_string());
        }
        if let Some(v) = params.optimization_mode {
            add("optimization_mode", v.as_str().to_string());
        }

        for (i, sym) in params.symbols.iter().enumerate() {
            add(&format!("symbol_{i}_symbol"), sym.symbol.clone());
            add(&format!("symbol_{i}_primary"), sym.primary.to_string());
            add(&format!("symbol_{i}_timespan"), sym.timespan.to_string());
            add(
                &format!("symbol_{i}_timespan_unit"),
                sym.timespan_unit.as_str().to_string(),
            );
        }
        add("symbol_count", params.symbols.len().to_string());

        add(
            "strategy_params",
            serde_json::to_string(&self.strategy_params).unwrap_or_default(),
        );

        options
    }
}
