//! Threshold workflows
//!
//! Both workflows resolve the same service and KPI selectors and persist
//! services the same way; they differ in how the selected KPIs are
//! rewritten:
//! - [`ThresholdResetWorkflow`] writes the disabled baseline
//! - [`ThresholdRecommendationWorkflow`] applies ML-recommended policies

mod recommend;
mod reset;

pub use recommend::{RecommendOptions, ThresholdRecommendationWorkflow};
pub use reset::ThresholdResetWorkflow;

use std::sync::Arc;

use tracing::debug;

use crate::error::{Result, ThresholdError};
use crate::models::ServiceRef;
use crate::observability::RunMetrics;
use crate::selector::SelectorMatcher;
use crate::store::{select_services, ObjectStore, ServiceStream};

/// Options shared by every threshold workflow
#[derive(Debug, Clone)]
pub struct WorkflowOptions {
    /// Service ids or title wildcards; empty selects every service
    pub services: Vec<String>,
    /// KPI ids or title wildcards; empty selects every KPI
    pub kpis: Vec<String>,
    /// Compute and log changes without saving them
    pub dry_run: bool,
    /// Upper bound on concurrent network calls
    pub concurrency: usize,
}

impl Default for WorkflowOptions {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            kpis: Vec::new(),
            dry_run: false,
            concurrency: 10,
        }
    }
}

/// State shared with the fan-out processors of a workflow
pub(crate) struct WorkflowContext {
    pub store: Arc<dyn ObjectStore>,
    pub kpi_matcher: SelectorMatcher,
    pub dry_run: bool,
    pub metrics: Arc<RunMetrics>,
}

impl WorkflowContext {
    /// Save the service document, unless this is a dry run
    pub async fn persist(&self, service: &ServiceRef) -> Result<()> {
        if self.dry_run {
            debug!(service_id = %service.key(), "Dry run, service not saved");
            return Ok(());
        }

        let document = service.snapshot().await;
        match self.store.update_service(service.key(), &document).await {
            Ok(()) => {
                self.metrics.inc_services_saved();
                Ok(())
            }
            Err(e) => {
                self.metrics.inc_persist_failures();
                Err(ThresholdError::Persist {
                    service: service.key().to_string(),
                    message: e.to_string(),
                })
            }
        }
    }
}

/// Selector resolution and persistence common to both workflows
pub(crate) struct ThresholdWorkflow {
    context: Arc<WorkflowContext>,
    service_selectors: Vec<String>,
    concurrency: usize,
}

impl ThresholdWorkflow {
    pub fn new(store: Arc<dyn ObjectStore>, options: WorkflowOptions) -> Result<Self> {
        if options.concurrency == 0 {
            return Err(ThresholdError::InvalidArgument(
                "concurrency must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            context: Arc::new(WorkflowContext {
                store,
                kpi_matcher: SelectorMatcher::new(&options.kpis)?,
                dry_run: options.dry_run,
                metrics: Arc::new(RunMetrics::new()),
            }),
            service_selectors: options.services,
            concurrency: options.concurrency,
        })
    }

    pub fn context(&self) -> &Arc<WorkflowContext> {
        &self.context
    }

    pub fn metrics(&self) -> &Arc<RunMetrics> {
        &self.context.metrics
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn dry_run(&self) -> bool {
        self.context.dry_run
    }

    pub fn service_selectors(&self) -> &[String] {
        &self.service_selectors
    }

    pub fn kpi_matcher(&self) -> &SelectorMatcher {
        &self.context.kpi_matcher
    }

    /// Stream the selected services
    pub fn services(&self) -> ServiceStream<'_> {
        select_services(self.context.store.as_ref(), &self.service_selectors)
    }

    /// Log the run counters and pass the run result through
    pub fn finish(&self, workflow: &str, result: Result<()>) -> Result<()> {
        self.metrics().log_summary(workflow);
        result
    }
}
