//! Backtest command implementation
//!
//! Discovers plugin manifests, loads their bar data, fans independent
//! backtests out on the worker pool and renders the collected reports.
//! Workers share only the DataStore and ReportStore.

use anyhow::{bail, Context, Result};
use rayon::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{error, info};

use stratforge::data::DataStore;
use stratforge::engine::BacktestEngine;
use stratforge::montecarlo::MonteCarloEngine;
use stratforge::plugin::loader::{self, PluginError, StrategyPlugin};
use stratforge::plugin::manifest::PluginManifest;
use stratforge::report::{ConsoleRenderer, Render, ReportStore};

pub fn run(
    plugins_dir: String,
    data_dir: String,
    plugin_filter: Option<String>,
    monte_carlo: bool,
) -> Result<()> {
    info!("Discovering plugins in: {}", plugins_dir);
    let manifests = discover_manifests(&plugins_dir, plugin_filter.as_deref())?;
    if manifests.is_empty() {
        bail!("No plugin manifests found under {}", plugins_dir);
    }
    info!("Found {} plugin(s)", manifests.len());

    let data_store = DataStore::new();
    for manifest in &manifests {
        data_store.load_plugin_data(manifest, &data_dir)?;
    }

    let report_store = ReportStore::new();

    manifests.par_iter().for_each(|manifest| {
        if let Err(e) = run_one(manifest, &data_store, &report_store, monte_carlo) {
            error!("Backtest for plugin '{}' failed: {e:#}", manifest.name);
        }
    });

    let renderer = ConsoleRenderer;
    for report in report_store.backtest_reports() {
        renderer.render_backtest(&report);
    }
    for report in report_store.monte_carlo_reports() {
        renderer.render_monte_carlo(&report);
    }

    Ok(())
}

fn run_one(
    manifest: &PluginManifest,
    data_store: &DataStore,
    report_store: &ReportStore,
    monte_carlo: bool,
) -> Result<()> {
    let bars = data_store
        .primary_bars(manifest)
        .context("No bar data for primary symbol")?;

    let options = manifest.flattened_options();

    let mut plugin = loader::load_plugin(manifest)?;
    plugin.on_init(&options)?;

    let mut engine = BacktestEngine::new(manifest.host_params.clone(), plugin);
    let report = engine.run(&bars)?;
    report_store.store_backtest_report(report);

    if monte_carlo {
        let factory = || -> Result<Box<dyn StrategyPlugin>, PluginError> {
            let mut plugin = loader::load_plugin(manifest)?;
            plugin.on_init(&options)?;
            Ok(plugin)
        };
        let report = MonteCarloEngine::run(manifest, &bars, &factory)?;
        report_store.store_monte_carlo_report(report);
    }

    Ok(())
}

fn discover_manifests(plugins_dir: &str, filter: Option<&str>) -> Result<Vec<PluginManifest>> {
    let mut manifests = Vec::new();

    for entry in std::fs::read_dir(Path::new(plugins_dir))
        .context(format!("Failed to read plugins directory {plugins_dir}"))?
    {
        let entry = entry?;
        if !entry.path().is_dir() {
            continue;
        }
        let manifest_path: PathBuf = entry.path().join("manifest.json");
        if !manifest_path.exists() {
            continue;
        }

        let manifest = PluginManifest::from_file(&manifest_path)
            .context(format!("Failed to load {}", manifest_path.display()))?;
        if let Some(name) = filter {
            if manifest.name != name {
                continue;
            }
        }
        manifests.push(manifest);
    }

    manifests.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(manifests)
}
