//! Backtest reports, the shared report store and console rendering

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::models::EquitySnapshot;
use crate::money::Money;

/// Outcome of one completed backtest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestReport {
    pub plugin_name: String,
    pub initial_capital: Money,
    pub final_equity: Money,
    pub net_return: f64,
    pub max_drawdown: f64,
    pub total_fills: usize,
    pub equity_curve: Vec<EquitySnapshot>,
    /// Whatever the plugin returned from `on_end`
    pub strategy_summary: serde_json::Value,
}

/// Aggregate of repeated resampled backtests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonteCarloReport {
    pub plugin_name: String,
    pub runs: usize,
    pub seed: i64,
    pub mean_final_equity: f64,
    pub median_final_equity: f64,
    pub std_dev_final_equity: f64,
    pub p05_final_equity: f64,
    pub p95_final_equity: f64,
    pub worst_max_drawdown: f64,
}

/// Collects reports from workers; callers get cloned snapshots
#[derive(Debug, Default)]
pub struct ReportStore {
    backtest_reports: Mutex<BTreeMap<String, BacktestReport>>,
    monte_carlo_reports: Mutex<BTreeMap<String, MonteCarloReport>>,
}

impl ReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn store_backtest_report(&self, report: BacktestReport) {
        let mut reports = self
            .backtest_reports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        reports.insert(report.plugin_name.clone(), report);
    }

    pub fn store_monte_carlo_report(&self, report: MonteCarloReport) {
        let mut reports = self
            .monte_carlo_reports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        reports.insert(report.plugin_name.clone(), report);
    }

    pub fn backtest_reports(&self) -> Vec<BacktestReport> {
        let reports = self
            .backtest_reports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        reports.values().cloned().collect()
    }

    pub fn monte_carlo_reports(&self) -> Vec<MonteCarloReport> {
        let reports = self
            .monte_carlo_reports
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        reports.values().cloned().collect()
    }
}

/// Output seam so report destinations can vary
pub trait Render {
    fn render_backtest(&self, report: &BacktestReport);
    fn render_monte_carlo(&self, report: &MonteCarloReport);
}

pub struct ConsoleRenderer;

impl Render for ConsoleRenderer {
    fn render_backtest(&self, report: &BacktestReport) {
        println!("=== Backtest: {} ===", report.plugin_name);
        println!("  Initial capital: {:>14.2}", report.initial_capital.to_dollars());
        println!("  Final equity:    {:>14.2}", report.final_equity.to_dollars());
        println!("  Return:          {:>13.2}%", report.net_return * 100.0);
        println!("  Max drawdown:    {:>13.2}%", report.max_drawdown * 100.0);
        println!("  Fills:           {:>14}", report.total_fills);
        if !report.strategy_summary.is_null() {
            println!("  Strategy summary: {}", report.strategy_summary);
        }
    }

    fn render_monte_carlo(&self, report: &MonteCarloReport) {
        println!(
            "=== Monte Carlo: {} ({} runs, seed {}) ===",
            report.plugin_name, report.runs, report.seed
        );
        println!("  Mean final equity:   {:>14.2}", report.mean_final_equity);
        println!("  Median final equity: {:>14.2}", report.median_final_equity);
        println!("  Std dev:             {:>14.2}", report.std_dev_final_equity);
        println!("  5th percentile:      {:>14.2}", report.p05_final_equity);
        println!("  95th percentile:     {:>14.2}", report.p95_final_equity);
        println!(
            "  Worst max drawdown:  {:>13.2}%",
            report.worst_max_drawdown * 100.0
        );
    }
}
