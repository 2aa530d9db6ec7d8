//! Threshold commands

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Subcommand, ValueEnum};
use threshold_lib::{
    InsufficientDataAction, ObjectStore, RecommendOptions, RunSummary, SearchClient,
    ThresholdRecommendationWorkflow, ThresholdResetWorkflow, WorkflowOptions,
};

use crate::catalog::HttpObjectStore;
use crate::client::RestClient;
use crate::config::Config;
use crate::output::{print_summary, verdict};
use crate::search::HttpSearchClient;

#[derive(Subcommand)]
pub enum ThresholdCommands {
    /// Reset KPI thresholds to the disabled baseline
    Reset(ResetArgs),

    /// Configure KPI thresholds from ML threshold recommendations
    Recommend(RecommendArgs),
}

#[derive(Args)]
pub struct ResetArgs {
    /// Service id or title wildcard (repeatable, at least one)
    #[arg(short = 's', long = "service", required = true)]
    pub services: Vec<String>,

    /// KPI id or title wildcard (repeatable, default all KPIs)
    #[arg(short = 'k', long = "kpi")]
    pub kpis: Vec<String>,

    /// Log the changes without saving them
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args)]
pub struct RecommendArgs {
    /// Service id or title wildcard (repeatable, default all services)
    #[arg(short = 's', long = "service")]
    pub services: Vec<String>,

    /// KPI id or title wildcard (repeatable, default all KPIs)
    #[arg(short = 'k', long = "kpi")]
    pub kpis: Vec<String>,

    /// Log the changes without saving them
    #[arg(long)]
    pub dry_run: bool,

    /// Analyse the most recent data instead of each KPI's training start date
    #[arg(long)]
    pub use_latest_data: bool,

    /// What to do with KPIs that get no recommendation
    #[arg(long, value_enum, default_value_t = InsufficientDataArg::Skip)]
    pub insufficient_data_action: InsufficientDataArg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum InsufficientDataArg {
    /// Leave the stored thresholds untouched
    Skip,
    /// Reset the thresholds to the disabled baseline
    Reset,
}

impl From<InsufficientDataArg> for InsufficientDataAction {
    fn from(arg: InsufficientDataArg) -> Self {
        match arg {
            InsufficientDataArg::Skip => InsufficientDataAction::Skip,
            InsufficientDataArg::Reset => InsufficientDataAction::Reset,
        }
    }
}

/// Run a threshold command against the configured platform
pub async fn run(command: ThresholdCommands, config: &Config) -> Result<()> {
    let client = Arc::new(RestClient::new(config)?);
    let store: Arc<dyn ObjectStore> = Arc::new(HttpObjectStore::new(client.clone()));

    match command {
        ThresholdCommands::Reset(args) => {
            let options = WorkflowOptions {
                services: args.services,
                kpis: args.kpis,
                dry_run: args.dry_run,
                concurrency: config.concurrency,
            };
            reset(store, options).await
        }
        ThresholdCommands::Recommend(args) => {
            let search: Arc<dyn SearchClient> = Arc::new(HttpSearchClient::new(client));
            let options = WorkflowOptions {
                services: args.services,
                kpis: args.kpis,
                dry_run: args.dry_run,
                concurrency: config.concurrency,
            };
            let recommend = RecommendOptions {
                use_latest_data: args.use_latest_data,
                insufficient_data_action: args.insufficient_data_action.into(),
            };
            recommend_thresholds(store, search, options, recommend).await
        }
    }
}

pub async fn reset(store: Arc<dyn ObjectStore>, options: WorkflowOptions) -> Result<()> {
    let dry_run = options.dry_run;
    let workflow = ThresholdResetWorkflow::new(store, options)?;
    let result = workflow.execute().await;
    report("reset", result, &workflow.metrics().summary(), dry_run)
}

pub async fn recommend_thresholds(
    store: Arc<dyn ObjectStore>,
    search: Arc<dyn SearchClient>,
    options: WorkflowOptions,
    recommend: RecommendOptions,
) -> Result<()> {
    let dry_run = options.dry_run;
    let workflow = ThresholdRecommendationWorkflow::new(store, search, options, recommend)?;
    let result = workflow.execute().await;
    report("recommendation", result, &workflow.metrics().summary(), dry_run)
}

fn report(
    workflow: &str,
    result: threshold_lib::Result<()>,
    summary: &RunSummary,
    dry_run: bool,
) -> Result<()> {
    print_summary(summary);
    println!("{}", verdict(workflow, &result, dry_run));
    result.context("Workflow has completed with errors")
}
