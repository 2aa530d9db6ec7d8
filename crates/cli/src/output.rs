//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};
use threshold_lib::RunSummary;

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines (default)
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Row of the run summary table
#[derive(Tabled)]
struct CounterRow {
    #[tabled(rename = "Counter")]
    name: &'static str,
    #[tabled(rename = "Value")]
    value: String,
}

fn counter(name: &'static str, value: u64, bad: bool) -> CounterRow {
    let value = if bad && value > 0 {
        value.to_string().red().to_string()
    } else {
        value.to_string()
    };
    CounterRow { name, value }
}

/// Render the end-of-run counters as a table
pub fn summary_table(summary: &RunSummary) -> String {
    let rows = vec![
        counter("Services scanned", summary.services_scanned, false),
        counter("Searches executed", summary.searches_executed, false),
        counter("Search failures", summary.search_failures, true),
        counter("KPIs configured", summary.kpis_configured, false),
        counter("KPIs without policies", summary.kpis_failed, true),
        counter("KPIs reset", summary.kpis_reset, false),
        counter("Services saved", summary.services_saved, false),
        counter("Save failures", summary.persist_failures, true),
    ];
    Table::new(rows).with(Style::rounded()).to_string()
}

pub fn print_summary(summary: &RunSummary) {
    println!("{}", summary_table(summary));
}

/// One-line verdict shown under the summary table
pub fn verdict(workflow: &str, result: &threshold_lib::Result<()>, dry_run: bool) -> String {
    let status = match result {
        Ok(()) => "completed".green().bold(),
        Err(e) => format!("failed ({} errors)", e.failure_count()).red().bold(),
    };
    let mut line = format!("Threshold {} {}", workflow, status);
    if dry_run {
        line = format!("{} {}", line, "[dry run: nothing saved]".yellow());
    }
    line
}

/// Report an error that ends the process
pub fn print_fatal(err: &anyhow::Error) {
    eprintln!("{} {:#}", "kpictl:".red().bold(), err);
}
