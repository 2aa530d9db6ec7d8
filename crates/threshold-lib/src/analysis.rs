//! ML recommendation analysis
//!
//! Renders one recommendation search per training configuration of a batch,
//! runs the searches of a batch concurrently and collects the returned
//! policy rows per service and KPI.

use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::batcher::Batch;
use crate::error::{Result, ThresholdError};
use crate::executor::{process_in_parallel, Processor};
use crate::models::{KpiRef, PoliciesByService, PolicyRow, ServiceRef, TrainingConfig};
use crate::observability::RunMetrics;
use crate::search::{SearchClient, SearchRequest, SearchRow};

/// Timeout of every analysis search
pub const SEARCH_TIMEOUT: Duration = Duration::from_secs(300);

/// App context the analysis searches run in
pub const ANALYSIS_APP: &str = "itsi";

/// User context the analysis searches run as
pub const ANALYSIS_USER: &str = "nobody";

/// Flag of a row reporting that no policy could be trained
pub const INSUFFICIENT_DATA_FLAG: &str = "INSUFFICIENT_DATA";

/// KPI id the search reports when no KPI in the range had data
const NO_DATA_KPI_ID: &str = "None";

const FLAG_FIELD: &str = "Recommendation Flag";
const KPI_ID_FIELD: &str = "itsi_kpi_id";
const SERVICE_ID_FIELD: &str = "itsi_service_id";

/// Explicit `(service, kpi)` OR-filter of a search
pub fn filter_expression(kpis: &[KpiRef]) -> String {
    if kpis.is_empty() {
        return String::new();
    }

    let mut by_service: Vec<(&str, Vec<&str>)> = Vec::new();
    for kpi in kpis {
        match by_service.iter_mut().find(|(key, _)| *key == kpi.service.key()) {
            Some((_, ids)) => ids.push(&kpi.kpi_id),
            None => by_service.push((kpi.service.key(), vec![kpi.kpi_id.as_str()])),
        }
    }

    let conditions: Vec<String> = by_service
        .iter()
        .map(|(service, ids)| {
            let ids: Vec<String> = ids.iter().map(|id| format!("\"{}\"", id)).collect();
            format!(
                "(itsi_service_id=\"{}\" AND itsi_kpi_id IN ({}))",
                service,
                ids.join(",")
            )
        })
        .collect();

    format!("AND ( {} )", conditions.join(" OR "))
}

/// Recommendation search over the given KPIs of one training configuration
pub fn render_query(config: &TrainingConfig, kpis: &[KpiRef]) -> String {
    format!(
        "| mstats latest(alert_value) AS alert_value latest(alert_level) AS alert_level \
         WHERE `get_itsi_summary_metrics_index` {filter} \
         AND is_filled_gap_event!=1 AND is_null_alert_value=0 \
         `metrics_service_level_kpi_only` by itsi_kpi_id, itsi_service_id span=1m \
         | where alert_level!=-2 \
         | table _time, alert_value, alert_level, itsi_kpi_id, itsi_service_id \
         | sort 0 itsi_kpi_id \
         | recommendthresholdtemplate threshold_direction={direction}",
        filter = filter_expression(kpis),
        direction = config.direction,
    )
}

/// Search request analysing `kpis` over the window of `config`
pub fn analysis_request(config: &TrainingConfig, kpis: &[KpiRef]) -> SearchRequest {
    SearchRequest {
        query: render_query(config, kpis),
        earliest_time: config.start_time.to_string(),
        latest_time: config.end_time().to_string(),
        app: ANALYSIS_APP.to_string(),
        user: ANALYSIS_USER.to_string(),
        timeout: SEARCH_TIMEOUT,
        allow_empty: false,
        allow_partial: false,
    }
}

/// Resolves the KPI ids reported by a search back to batch services
struct KpiIndex {
    by_service_kpi: HashMap<(String, String), Arc<ServiceRef>>,
    by_kpi: HashMap<String, Arc<ServiceRef>>,
}

impl KpiIndex {
    fn new(batch: &Batch) -> Self {
        let mut by_service_kpi = HashMap::new();
        let mut by_kpi = HashMap::new();
        for kpi in batch.iter().flat_map(|(_, kpis)| kpis) {
            by_service_kpi.insert(
                (kpi.service.key().to_string(), kpi.kpi_id.clone()),
                kpi.service.clone(),
            );
            by_kpi.insert(kpi.kpi_id.clone(), kpi.service.clone());
        }
        Self {
            by_service_kpi,
            by_kpi,
        }
    }

    fn resolve(&self, service_id: Option<&str>, kpi_id: &str) -> Option<&Arc<ServiceRef>> {
        service_id
            .and_then(|svc| {
                self.by_service_kpi
                    .get(&(svc.to_string(), kpi_id.to_string()))
            })
            .or_else(|| self.by_kpi.get(kpi_id))
    }
}

fn row_field(row: &SearchRow, field: &str) -> Result<String> {
    row.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ThresholdError::InvalidRecommendation {
            context: "unexpected results from ML analysis search:".to_string(),
            message: format!("{} is missing", field),
        })
}

/// Group the rows returned for `batch` by service and KPI.
///
/// Rows keep their arrival order. The no-data marker row is dropped; any
/// other row naming a KPI outside the batch is an error.
pub fn collect_policies(batch: &Batch, rows: Vec<SearchRow>) -> Result<PoliciesByService> {
    let index = KpiIndex::new(batch);
    let mut policies = PoliciesByService::new();

    for row in rows {
        let flag = row_field(&row, FLAG_FIELD)?;
        let kpi_id = row_field(&row, KPI_ID_FIELD)?;
        let service_id = row.get(SERVICE_ID_FIELD).and_then(Value::as_str);

        let Some(service) = index.resolve(service_id, &kpi_id) else {
            if kpi_id == NO_DATA_KPI_ID && flag == INSUFFICIENT_DATA_FLAG {
                continue;
            }
            return Err(ThresholdError::UnknownServiceForKpi {
                kpi_id,
                row: Value::Object(row).to_string(),
            });
        };

        policies
            .entry(service.key().to_string())
            .or_default()
            .entry(kpi_id)
            .or_default()
            .push(PolicyRow(row));
    }

    Ok(policies)
}

/// The searches of one batch, run with bounded concurrency
struct BatchSearches {
    client: Arc<dyn SearchClient>,
    metrics: Arc<RunMetrics>,
    requests: Vec<SearchRequest>,
    rows: Mutex<Vec<SearchRow>>,
}

#[async_trait]
impl Processor for BatchSearches {
    type Item = SearchRequest;

    fn items(&self) -> Vec<SearchRequest> {
        self.requests.clone()
    }

    async fn process(&self, request: SearchRequest) -> Result<()> {
        let started = Instant::now();
        let result = self.client.execute(&request).await;
        self.metrics
            .observe_search_latency(started.elapsed().as_secs_f64());
        self.metrics.inc_searches_executed();

        match result {
            Ok(rows) => {
                debug!(
                    rows = rows.len(),
                    earliest_time = %request.earliest_time,
                    "Analysis search completed"
                );
                self.rows.lock().await.extend(rows);
                Ok(())
            }
            Err(e) => {
                self.metrics.inc_search_failures();
                Err(e)
            }
        }
    }
}

/// Everything the commit step needs from one analysed group of batches
#[derive(Debug, Default)]
pub struct AnalysisOutcome {
    pub policies: PoliciesByService,
    pub training_config_by_kpi: HashMap<KpiRef, TrainingConfig>,
    /// Services whose batch failed analysis; they must not be committed
    pub failed_services: HashSet<String>,
}

/// Runs the analysis of a group of batches, one batch per fan-out item
pub struct AnalysisRunner {
    batches: Vec<Batch>,
    search_concurrency: usize,
    client: Arc<dyn SearchClient>,
    metrics: Arc<RunMetrics>,

    training_config_by_kpi: HashMap<KpiRef, TrainingConfig>,
    results: Mutex<PoliciesByService>,
    failed_services: Mutex<HashSet<String>>,
}

impl AnalysisRunner {
    pub fn new(
        batches: Vec<Batch>,
        search_concurrency: usize,
        client: Arc<dyn SearchClient>,
        metrics: Arc<RunMetrics>,
    ) -> Self {
        let training_config_by_kpi = batches
            .iter()
            .flat_map(|batch| batch.iter())
            .flat_map(|(config, kpis)| kpis.iter().map(move |kpi| (kpi.clone(), config.clone())))
            .collect();

        Self {
            batches,
            search_concurrency,
            client,
            metrics,
            training_config_by_kpi,
            results: Mutex::new(PoliciesByService::new()),
            failed_services: Mutex::new(HashSet::new()),
        }
    }

    pub fn training_config_by_kpi(&self) -> &HashMap<KpiRef, TrainingConfig> {
        &self.training_config_by_kpi
    }

    /// Take the merged results accumulated so far
    pub async fn take_outcome(&self) -> AnalysisOutcome {
        AnalysisOutcome {
            policies: mem::take(&mut *self.results.lock().await),
            training_config_by_kpi: self.training_config_by_kpi.clone(),
            failed_services: mem::take(&mut *self.failed_services.lock().await),
        }
    }

    async fn analyse(&self, batch: &Batch) -> Result<PoliciesByService> {
        let searches = Arc::new(BatchSearches {
            client: self.client.clone(),
            metrics: self.metrics.clone(),
            requests: batch
                .iter()
                .map(|(config, kpis)| analysis_request(config, kpis))
                .collect(),
            rows: Mutex::new(Vec::new()),
        });

        process_in_parallel(searches.clone(), self.search_concurrency).await?;

        let rows = mem::take(&mut *searches.rows.lock().await);
        collect_policies(batch, rows)
    }
}

#[async_trait]
impl Processor for AnalysisRunner {
    type Item = Batch;

    fn items(&self) -> Vec<Batch> {
        self.batches.clone()
    }

    async fn process(&self, batch: Batch) -> Result<()> {
        match self.analyse(&batch).await {
            Ok(policies) => {
                let mut results = self.results.lock().await;
                for (service, by_kpi) in policies {
                    let entry = results.entry(service).or_default();
                    for (kpi_id, rows) in by_kpi {
                        entry.entry(kpi_id).or_default().extend(rows);
                    }
                }
                Ok(())
            }
            Err(e) => {
                let services = batch.services();
                warn!(
                    services = services.len(),
                    error = %e,
                    "ML analysis failed for batch, its services will not be updated"
                );
                self.failed_services
                    .lock()
                    .await
                    .extend(services.iter().map(|s| s.key().to_string()));
                Err(e)
            }
        }
    }
}
