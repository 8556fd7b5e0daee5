//! Bar data loading and storage
//!
//! The `DataStore` is the only resource shared between backtest
//! workers; a reader-writer lock guards its maps and readers get cloned
//! series. Ingestion is CSV-based (`datetime,open,high,low,close,volume`),
//! one file per symbol and timeframe.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::RwLock;
use tracing::{info, warn};

use crate::models::{Bar, Symbol};
use crate::plugin::manifest::PluginManifest;

/// Load one symbol's bars from a CSV file
pub fn load_csv(path: impl AsRef<Path>, symbol: &Symbol) -> Result<Vec<Bar>> {
    let mut reader = csv::Reader::from_path(path.as_ref()).context("Failed to open CSV file")?;

    let mut bars = Vec::new();

    for (row_idx, result) in reader.records().enumerate() {
        let record = result.context(format!("Failed to read row {}", row_idx + 1))?;

        let dt_str = record.get(0).context("Missing datetime column")?;
        let datetime = dt_str
            .parse::<DateTime<Utc>>()
            .or_else(|_| {
                // Accept naive timestamps and assume UTC
                chrono::NaiveDateTime::parse_from_str(dt_str, "%Y-%m-%d %H:%M:%S")
                    .map(|ndt| DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc))
            })
            .context(format!("Failed to parse datetime: {}", dt_str))?;
        let unix_ts_ns = datetime
            .timestamp_nanos_opt()
            .context(format!("Datetime out of range: {}", dt_str))?;

        let open: f64 = record
            .get(1)
            .context("Missing open column")?
            .parse()
            .context("Failed to parse open")?;
        let high: f64 = record
            .get(2)
            .context("Missing high column")?
            .parse()
            .context("Failed to parse high")?;
        let low: f64 = record
            .get(3)
            .context("Missing low column")?
            .parse()
            .context("Failed to parse low")?;
        let close: f64 = record
            .get(4)
            .context("Missing close column")?
            .parse()
            .context("Failed to parse close")?;
        let volume: f64 = record
            .get(5)
            .context("Missing volume column")?
            .parse()
            .context("Failed to parse volume")?;

        let bar = Bar {
            symbol: symbol.clone(),
            unix_ts_ns,
            open,
            high,
            low,
            close,
            volume,
        };
        bar.validate()
            .context(format!("Invalid bar at row {}", row_idx + 1))?;
        bars.push(bar);
    }

    bars.sort_by_key(|bar| bar.unix_ts_ns);

    Ok(bars)
}

/// Shared bar storage keyed by plugin name then symbol
#[derive(Debug, Default)]
pub struct DataStore {
    bars: RwLock<HashMap<String, BTreeMap<Symbol, Vec<Bar>>>>,
}

impl DataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store_bars(&self, plugin_name: &str, symbol: &Symbol, series: Vec<Bar>) {
        let mut bars = self
            .bars
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        bars.entry(plugin_name.to_string())
            .or_default()
            .insert(symbol.clone(), series);
    }

    pub fn bars(&self, plugin_name: &str, symbol: &Symbol) -> Option<Vec<Bar>> {
        let bars = self
            .bars
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        bars.get(plugin_name)
            .and_then(|by_symbol| by_symbol.get(symbol))
            .cloned()
    }

    pub fn symbols_for_plugin(&self, plugin_name: &str) -> Vec<Symbol> {
        let bars = self
            .bars
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        bars.get(plugin_name)
            .map(|by_symbol| by_symbol.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_plugin_data(&self, plugin_name: &str) -> bool {
        let bars = self
            .bars
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        bars.contains_key(plugin_name)
    }

    pub fn clear(&self) {
        let mut bars = self
            .bars
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        bars.clear();
    }

    /// The bar series that drives a plugin's loop
    pub fn primary_bars(&self, manifest: &PluginManifest) -> Option<Vec<Bar>> {
        let primary = manifest.primary_symbol()?;
        self.bars(&manifest.name, &Symbol::new(&primary.symbol))
    }

    /// Load every configured symbol's CSV for a plugin, filtered to the
    /// manifest's backtest window
    pub fn load_plugin_data(
        &self,
        manifest: &PluginManifest,
        data_dir: impl AsRef<Path>,
    ) -> Result<()> {
        let (start_ns, end_ns) = manifest.host_params.backtest_window_ns()?;
        let mut loaded_any = false;

        for symbol_config in &manifest.host_params.symbols {
            let filename = format!("{}_{}.csv", symbol_config.symbol, symbol_config.timeframe());
            let path = data_dir.as_ref().join(&filename);

            if !path.exists() {
                warn!("Data file not found: {}", path.display());
                continue;
            }

            let symbol = Symbol::new(&symbol_config.symbol);
            let series = load_csv(&path, &symbol)
                .context(format!("Failed to load data for {}", symbol_config.symbol))?;
            let series: Vec<Bar> = series
                .into_iter()
                .filter(|bar| bar.unix_ts_ns >= start_ns && bar.unix_ts_ns <= end_ns)
                .collect();

            info!(
                "Loaded {} bars for {} ({})",
                series.len(),
                symbol,
                manifest.name
            );
            self.store_bars(&manifest.name, &symbol, series);
            loaded_any = true;
        }

        if !loaded_any {
            bail!("No data loaded for any symbol of plugin '{}'", manifest.name);
        }

        Ok(())
    }
}
