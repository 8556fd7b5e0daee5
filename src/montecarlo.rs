//! Monte Carlo wrapper around the backtest engine
//!
//! Runs the configured number of bootstrap-resampled backtests and
//! summarizes the distribution of outcomes. Each run draws bar indices
//! with replacement from the primary series (re-sorted so timestamps
//! stay non-decreasing) and gets a fresh plugin instance, so runs are
//! independent and can fan out on the worker pool.

use anyhow::{bail, Result};
use indicatif::ProgressBar;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use statrs::statistics::{Data, Median, OrderStatistics, Statistics};

use crate::engine::BacktestEngine;
use crate::models::Bar;
use crate::plugin::loader::{PluginError, StrategyPlugin};
use crate::plugin::manifest::PluginManifest;
use crate::report::MonteCarloReport;

/// Builds a fresh plugin instance per run
pub type PluginFactory<'a> = &'a (dyn Fn() -> Result<Box<dyn StrategyPlugin>, PluginError> + Sync);

pub struct MonteCarloEngine;

impl MonteCarloEngine {
    pub fn run(
        manifest: &PluginManifest,
        bars: &[Bar],
        factory: PluginFactory<'_>,
    ) -> Result<MonteCarloReport> {
        let runs = manifest.host_params.monte_carlo_runs.max(0) as usize;
        if runs == 0 {
            bail!("monte_carlo_runs is zero for plugin '{}'", manifest.name);
        }
        let seed = manifest.host_params.monte_carlo_seed;

        tracing::info!(plugin = %manifest.name, runs, seed, "starting monte carlo batch");

        let progress = ProgressBar::new(runs as u64);
        let outcomes: Result<Vec<(f64, f64)>> = (0..runs)
            .into_par_iter()
            .map(|run_index| {
                let resampled =
                    resample_bars(bars, (seed as u64).wrapping_add(run_index as u64));
                let plugin = factory()?;
                let mut engine = BacktestEngine::new(manifest.host_params.clone(), plugin);
                let report = engine.run(&resampled)?;
                progress.inc(1);
                Ok((report.final_equity.to_dollars(), report.max_drawdown))
            })
            .collect();
        progress.finish_and_clear();
        let outcomes = outcomes?;

        let final_equities: Vec<f64> = outcomes.iter().map(|(equity, _)| *equity).collect();
        let worst_max_drawdown = outcomes
            .iter()
            .map(|(_, drawdown)| *drawdown)
            .fold(0.0, f64::max);

        let mean_final_equity = final_equities.iter().mean();
        let std_dev_final_equity = final_equities.iter().std_dev();
        let mut distribution = Data::new(final_equities.clone());

        Ok(MonteCarloReport {
            plugin_name: manifest.name.clone(),
            runs,
            seed,
            mean_final_equity,
            median_final_equity: distribution.median(),
            std_dev_final_equity,
            p05_final_equity: distribution.percentile(5),
            p95_final_equity: distribution.percentile(95),
            worst_max_drawdown,
        })
    }
}

/// Bootstrap resample: indices drawn i.i.d. with replacement, then
/// sorted so the synthetic series keeps non-decreasing timestamps
fn resample_bars(bars: &[Bar], seed: u64) -> Vec<Bar> {
    if bars.is_empty() {
        return Vec::new();
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut indices: Vec<usize> = (0..bars.len())
        .map(|_| rng.gen_range(0..bars.len()))
        .collect();
    indices.sort_unstable();
    indices.into_iter().map(|i| bars[i].clone()).collect()
}
