use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{ThresholdWorkflow, WorkflowContext, WorkflowOptions};
use crate::analysis::{AnalysisOutcome, AnalysisRunner};
use crate::batcher::{AnalysisStart, Batch, LatestDataAnchors, TrainingConfigBatcher};
use crate::error::{Result, ThresholdError};
use crate::executor::{process_in_parallel, Processor};
use crate::models::{PoliciesByKpi, PoliciesByService, ServiceRef};
use crate::observability::{render_yaml, RunMetrics};
use crate::planner::{plan_parallelism, Parallelism, PREFERRED_SEARCH_RATIO};
use crate::search::SearchClient;
use crate::selector::display_selectors;
use crate::store::ObjectStore;
use crate::synthesis::{InsufficientDataAction, ServiceConfiguration, ServiceThresholdConfigurator};

/// Options of the recommendation workflow only
#[derive(Debug, Clone, Copy, Default)]
pub struct RecommendOptions {
    /// Analyse the most recent window instead of each KPI's stored start date
    pub use_latest_data: bool,
    pub insufficient_data_action: InsufficientDataAction,
}

/// Configures selected KPIs from ML-recommended threshold policies
pub struct ThresholdRecommendationWorkflow {
    base: ThresholdWorkflow,
    search: Arc<dyn SearchClient>,
    options: RecommendOptions,
    anchors: LatestDataAnchors,
}

impl ThresholdRecommendationWorkflow {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        search: Arc<dyn SearchClient>,
        options: WorkflowOptions,
        recommend: RecommendOptions,
    ) -> Result<Self> {
        Ok(Self {
            base: ThresholdWorkflow::new(store, options)?,
            search,
            options: recommend,
            anchors: LatestDataAnchors::now(),
        })
    }

    /// Use fixed latest-data anchors instead of ones relative to now
    pub fn with_anchors(mut self, anchors: LatestDataAnchors) -> Self {
        self.anchors = anchors;
        self
    }

    pub fn metrics(&self) -> &RunMetrics {
        self.base.metrics()
    }

    pub fn parallelism(&self) -> Parallelism {
        plan_parallelism(self.base.concurrency(), PREFERRED_SEARCH_RATIO)
    }

    pub async fn execute(&self) -> Result<()> {
        let parallelism = self.parallelism();

        info!(
            service_selectors = ?display_selectors(self.base.service_selectors()),
            kpi_selectors = ?self.base.kpi_matcher().display(),
            use_latest_data = self.options.use_latest_data,
            insufficient_data_action = %self.options.insufficient_data_action,
            parallel_batches = parallelism.batches,
            parallel_searches = parallelism.searches,
            concurrency = self.base.concurrency(),
            dry_run = self.base.dry_run(),
            "Starting threshold recommendation workflow"
        );

        let result = self.run(parallelism).await;
        self.base.finish("recommend", result)
    }

    async fn run(&self, parallelism: Parallelism) -> Result<()> {
        let start = if self.options.use_latest_data {
            AnalysisStart::LatestData(self.anchors.clone())
        } else {
            AnalysisStart::StoredStartDate
        };

        let mut batcher = TrainingConfigBatcher::new(
            self.base.services(),
            self.base.kpi_matcher(),
            start,
            parallelism.batches,
        );
        let mut scanned = 0;

        while let Some(group) = batcher.next_group().await {
            let metrics = self.base.metrics();
            metrics.inc_services_scanned((batcher.services_scanned() - scanned) as u64);
            scanned = batcher.services_scanned();

            self.process_group(group?, parallelism).await?;
        }

        let metrics = self.base.metrics();
        metrics.inc_services_scanned((batcher.services_scanned() - scanned) as u64);
        Ok(())
    }

    /// Analyse one group of batches, then commit the services it covers.
    ///
    /// Services of batches that failed analysis are not committed. Errors of
    /// both stages are joined and stop the run after the group completes.
    async fn process_group(&self, batches: Vec<Batch>, parallelism: Parallelism) -> Result<()> {
        log_batch_plan(&batches);

        let runner = Arc::new(AnalysisRunner::new(
            batches,
            parallelism.searches,
            self.search.clone(),
            self.base.metrics().clone(),
        ));
        let analysis = process_in_parallel(runner.clone(), parallelism.batches).await;
        let outcome = runner.take_outcome().await;

        let updater = Arc::new(ServiceUpdateProcessor::new(
            outcome,
            self.base.context().clone(),
            self.options.insufficient_data_action,
        ));
        let commit = process_in_parallel(updater, self.base.concurrency()).await;

        ThresholdError::join(analysis.err().into_iter().chain(commit.err()).collect())
    }
}

/// Log the searches a group of batches is about to run
fn log_batch_plan(batches: &[Batch]) {
    let mut searches = 0;
    let mut kpis = 0;
    let mut services = BTreeSet::new();
    let mut details = Vec::with_capacity(batches.len());

    for batch in batches {
        let mut batch_details: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (config, batch_kpis) in batch.iter() {
            searches += 1;
            kpis += batch_kpis.len();
            services.extend(batch_kpis.iter().map(|k| k.service.key().to_string()));
            batch_details.insert(
                config.to_string(),
                batch_kpis.iter().map(ToString::to_string).collect(),
            );
        }
        details.push(batch_details);
    }

    info!(
        batches = %render_yaml("batches", &details),
        "Running {} searches to analyze {} KPIs across {} services",
        searches,
        kpis,
        services.len()
    );
}

/// Synthesizes and saves every service analysed in one group
struct ServiceUpdateProcessor {
    services: Vec<Arc<ServiceRef>>,
    /// Service key -> KPI id -> training window size
    windows: HashMap<String, HashMap<String, u32>>,
    policies: PoliciesByService,
    context: Arc<WorkflowContext>,
    action: InsufficientDataAction,
}

impl ServiceUpdateProcessor {
    fn new(outcome: AnalysisOutcome, context: Arc<WorkflowContext>, action: InsufficientDataAction) -> Self {
        let mut services: BTreeMap<String, Arc<ServiceRef>> = BTreeMap::new();
        let mut windows: HashMap<String, HashMap<String, u32>> = HashMap::new();

        for (kpi, config) in &outcome.training_config_by_kpi {
            let key = kpi.service.key();
            if outcome.failed_services.contains(key) {
                continue;
            }
            services
                .entry(key.to_string())
                .or_insert_with(|| kpi.service.clone());
            windows
                .entry(key.to_string())
                .or_default()
                .insert(kpi.kpi_id.clone(), config.window_days);
        }

        Self {
            services: services.into_values().collect(),
            windows,
            policies: outcome.policies,
            context,
            action,
        }
    }

    fn log_summary(&self, configuration: &ServiceConfiguration) {
        let failed = configuration.failed_kpis.len();
        let configured = configuration.kpis_configured();

        let mut msg = String::new();
        if !self.context.dry_run {
            msg = format!("Service [ {} ] has been saved. ", configuration.service_title);
        }
        msg += &format!("Thresholds have been configured successfully for {} KPIs.", configured);
        if failed > 0 {
            msg += &format!(
                " {} KPIs have not been configured due to insufficient data or KPI value being constant over the training period.",
                failed
            );
        }

        let summary = render_yaml("service update summary", &configuration.change_summary);

        macro_rules! summary_event {
            ($level:ident, $failed_field:ident) => {
                $level!(
                    service_id = %configuration.service_id,
                    kpis_processed = configuration.kpis_processed,
                    kpis_configured = configured,
                    $failed_field = failed,
                    kpis_update_summary = %summary,
                    "{}",
                    msg
                )
            };
        }

        match (failed == 0, self.action) {
            (true, InsufficientDataAction::Skip) => summary_event!(info, kpis_skipped),
            (true, InsufficientDataAction::Reset) => summary_event!(info, kpis_reset),
            (false, InsufficientDataAction::Skip) => summary_event!(warn, kpis_skipped),
            (false, InsufficientDataAction::Reset) => summary_event!(warn, kpis_reset),
        }
    }
}

#[async_trait]
impl Processor for ServiceUpdateProcessor {
    type Item = Arc<ServiceRef>;

    fn items(&self) -> Vec<Arc<ServiceRef>> {
        self.services.clone()
    }

    async fn process(&self, service: Arc<ServiceRef>) -> Result<()> {
        let no_policies = PoliciesByKpi::new();
        let no_windows = HashMap::new();
        let policies = self.policies.get(service.key()).unwrap_or(&no_policies);
        let windows = self.windows.get(service.key()).unwrap_or(&no_windows);

        let configuration = ServiceThresholdConfigurator::new(policies, windows, self.action)
            .configure(&service)
            .await?;

        self.context.persist(&service).await?;

        let metrics = &self.context.metrics;
        let failed = configuration.failed_kpis.len() as u64;
        metrics.inc_kpis_configured(configuration.kpis_configured() as u64);
        metrics.inc_kpis_failed(failed);
        if self.action == InsufficientDataAction::Reset {
            metrics.inc_kpis_reset(failed);
        }

        self.log_summary(&configuration);
        Ok(())
    }
}
