use std::mem;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use tracing::info;

use super::{ThresholdWorkflow, WorkflowContext, WorkflowOptions};
use crate::error::Result;
use crate::executor::{process_in_parallel, Processor};
use crate::models::{kpi_identity, kpis_mut, service_title, ServiceRef};
use crate::observability::{render_yaml, RunMetrics};
use crate::selector::display_selectors;
use crate::store::ObjectStore;
use crate::thresholds::reset_thresholding;

/// Id prefix of shared KPIs, which are never reset
const SHARED_KPI_PREFIX: &str = "SHKPI";

/// Resets the thresholds of every selected KPI to the disabled baseline
pub struct ThresholdResetWorkflow {
    base: ThresholdWorkflow,
}

impl ThresholdResetWorkflow {
    pub fn new(store: Arc<dyn ObjectStore>, options: WorkflowOptions) -> Result<Self> {
        Ok(Self {
            base: ThresholdWorkflow::new(store, options)?,
        })
    }

    pub fn metrics(&self) -> &RunMetrics {
        self.base.metrics()
    }

    pub async fn execute(&self) -> Result<()> {
        info!(
            service_selectors = ?display_selectors(self.base.service_selectors()),
            kpi_selectors = ?self.base.kpi_matcher().display(),
            concurrency = self.base.concurrency(),
            dry_run = self.base.dry_run(),
            "Starting threshold reset workflow"
        );

        let result = self.run().await;
        self.base.finish("reset", result)
    }

    /// Pull services in groups of `concurrency` and reset each group
    async fn run(&self) -> Result<()> {
        let concurrency = self.base.concurrency();
        let mut services = self.base.services();
        let mut group = Vec::with_capacity(concurrency);

        while let Some(service) = services.next().await {
            group.push(service?);
            self.base.metrics().inc_services_scanned(1);

            if group.len() == concurrency {
                self.reset_group(mem::take(&mut group)).await?;
            }
        }

        self.reset_group(group).await
    }

    async fn reset_group(&self, services: Vec<Arc<ServiceRef>>) -> Result<()> {
        let processor = Arc::new(ServiceResetProcessor {
            services,
            context: self.base.context().clone(),
        });
        process_in_parallel(processor, self.base.concurrency()).await
    }
}

struct ServiceResetProcessor {
    services: Vec<Arc<ServiceRef>>,
    context: Arc<WorkflowContext>,
}

impl ServiceResetProcessor {
    /// Reset matching KPIs in place, returning `"<title> (<id>)"` for each
    async fn reset_kpis(&self, service: &ServiceRef) -> Result<(String, Vec<String>)> {
        let mut document = service.document().await;
        let title = service_title(&document);
        let mut reset = Vec::new();

        for kpi in kpis_mut(&mut document)? {
            let (kpi_id, kpi_title) = kpi_identity(kpi)?;
            if kpi_id.starts_with(SHARED_KPI_PREFIX) {
                continue;
            }
            if self.context.kpi_matcher.matches(&kpi_id, &kpi_title) {
                reset_thresholding(kpi);
                reset.push(format!("{} ({})", kpi_title, kpi_id));
            }
        }

        Ok((title, reset))
    }
}

#[async_trait]
impl Processor for ServiceResetProcessor {
    type Item = Arc<ServiceRef>;

    fn items(&self) -> Vec<Arc<ServiceRef>> {
        self.services.clone()
    }

    async fn process(&self, service: Arc<ServiceRef>) -> Result<()> {
        let (title, reset) = self.reset_kpis(&service).await?;
        if reset.is_empty() {
            return Ok(());
        }

        self.context.persist(&service).await?;
        self.context.metrics.inc_kpis_reset(reset.len() as u64);

        let mut msg = String::new();
        if !self.context.dry_run {
            msg = format!("Service [ {} ] has been saved. ", title);
        }
        msg += &format!("Thresholds have been reset for {} KPIs.", reset.len());

        info!(
            service_id = %service.key(),
            kpis_reset = %render_yaml("reset KPIs", &reset),
            "{}",
            msg
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ThresholdError;
    use crate::testing::{plain_kpi, service_doc, MemoryStore};
    use serde_json::json;

    fn configured_kpi(id: &str, title: &str) -> serde_json::Value {
        let mut kpi = plain_kpi(id, title);
        kpi["adaptive_thresholds_is_enabled"] = json!(true);
        kpi["outlier_detection_algo"] = json!("iqr");
        kpi
    }

    fn options(services: &[&str], kpis: &[&str], concurrency: usize) -> WorkflowOptions {
        WorkflowOptions {
            services: services.iter().map(|s| s.to_string()).collect(),
            kpis: kpis.iter().map(|s| s.to_string()).collect(),
            dry_run: false,
            concurrency,
        }
    }

    #[tokio::test]
    async fn test_reset_matching_kpis_and_skip_shared() {
        let store = Arc::new(MemoryStore::new(vec![service_doc(
            "svc1",
            "Web",
            vec![
                configured_kpi("k1", "errors"),
                configured_kpi("SHKPI-abc", "ServiceHealthScore"),
                configured_kpi("k2", "latency"),
            ],
        )]));

        let workflow = ThresholdResetWorkflow::new(store.clone(), options(&["svc1"], &[], 4)).unwrap();
        workflow.execute().await.unwrap();

        let saved = store.saved_document("svc1").unwrap();
        assert_eq!(saved["kpis"][0]["adaptive_thresholds_is_enabled"], json!(false));
        assert_eq!(saved["kpis"][1]["adaptive_thresholds_is_enabled"], json!(true));
        assert_eq!(saved["kpis"][2]["adaptive_thresholds_is_enabled"], json!(false));
        assert_eq!(workflow.metrics().summary().kpis_reset, 2);
    }

    #[tokio::test]
    async fn test_services_without_matches_are_not_saved() {
        let store = Arc::new(MemoryStore::new(vec![
            service_doc("svc1", "Web", vec![configured_kpi("k1", "errors")]),
            service_doc("svc2", "Db", vec![configured_kpi("k2", "latency")]),
        ]));

        let workflow = ThresholdResetWorkflow::new(store.clone(), options(&[], &["err*"], 1)).unwrap();
        workflow.execute().await.unwrap();

        assert_eq!(store.saved_keys(), vec!["svc1"]);
        assert_eq!(workflow.metrics().summary().services_scanned, 2);
    }

    #[tokio::test]
    async fn test_services_are_reset_group_by_group() {
        let store = Arc::new(MemoryStore::new(
            (1..=5)
                .map(|i| {
                    service_doc(
                        &format!("svc{}", i),
                        &format!("Service {}", i),
                        vec![configured_kpi("k1", "errors")],
                    )
                })
                .collect(),
        ));

        let workflow = ThresholdResetWorkflow::new(store.clone(), options(&[], &[], 2)).unwrap();
        workflow.execute().await.unwrap();

        // a group is saved before the next one is pulled from the listing
        assert_eq!(
            store.listed_at_save(),
            vec![
                ("svc1".to_string(), 2),
                ("svc2".to_string(), 2),
                ("svc3".to_string(), 4),
                ("svc4".to_string(), 4),
                ("svc5".to_string(), 5),
            ]
        );
        assert_eq!(workflow.metrics().summary().services_saved, 5);
    }

    #[tokio::test]
    async fn test_dry_run_saves_nothing() {
        let store = Arc::new(MemoryStore::new(vec![service_doc(
            "svc1",
            "Web",
            vec![configured_kpi("k1", "errors")],
        )]));
        let mut opts = options(&["svc1"], &[], 2);
        opts.dry_run = true;

        ThresholdResetWorkflow::new(store.clone(), opts)
            .unwrap()
            .execute()
            .await
            .unwrap();

        assert!(store.saved().is_empty());
    }

    #[tokio::test]
    async fn test_persist_failure_is_isolated_within_group() {
        let store = Arc::new(
            MemoryStore::new(vec![
                service_doc("svc1", "Web", vec![configured_kpi("k1", "errors")]),
                service_doc("svc2", "Db", vec![configured_kpi("k2", "errors")]),
            ])
            .failing_update("svc1"),
        );

        let workflow = ThresholdResetWorkflow::new(store.clone(), options(&[], &[], 2)).unwrap();
        let err = workflow.execute().await.unwrap_err();

        assert_eq!(err.failure_count(), 1);
        assert!(err.to_string().contains("[svc1] failed to save service"));
        assert_eq!(store.saved_keys(), vec!["svc2"]);
        assert_eq!(workflow.metrics().summary().persist_failures, 1);
    }

    #[tokio::test]
    async fn test_listing_error_aborts() {
        let store = Arc::new(MemoryStore::new(vec![]).failing_listings());
        let workflow = ThresholdResetWorkflow::new(store, options(&["svc1"], &[], 2)).unwrap();

        assert!(matches!(workflow.execute().await, Err(ThresholdError::Store(_))));
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let store = Arc::new(MemoryStore::new(vec![]));
        assert!(matches!(
            ThresholdResetWorkflow::new(store, options(&[], &[], 0)),
            Err(ThresholdError::InvalidArgument(_))
        ));
    }
}
