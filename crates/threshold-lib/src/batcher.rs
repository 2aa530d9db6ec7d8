//! Training-window batching
//!
//! Groups ML-configured KPIs by training window so that KPIs sharing a
//! window share one analysis search, and packs services into batches of
//! bounded size. Batches are emitted lazily, a group at a time, while the
//! service listing is still being scanned.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use chrono::Utc;
use futures_util::StreamExt;
use serde_json::Value;
use tracing::debug;

use crate::error::{Result, ThresholdError};
use crate::models::{kpi_identity, kpis, required_str, Document, KpiRef, ServiceRef, TrainingConfig};
use crate::selector::SelectorMatcher;
use crate::store::ServiceStream;

/// Maximum KPIs analysed by one search after merging services
pub const KPIS_PER_SEARCH: usize = 10;

/// Maximum services contributing to one batch
pub const MAX_SERVICES_PER_BATCH: usize = 5;

/// Window sizes, in days, with a precomputed latest-data anchor
pub const LATEST_DATA_WINDOWS: [u32; 4] = [7, 14, 30, 60];

/// Parse a training window of the form `-<days>d`
pub fn parse_training_window_size(window: &str) -> Result<u32> {
    let invalid = || ThresholdError::ConfigParse(format!("{} is not a valid training window", window));

    let digits = window
        .strip_prefix('-')
        .and_then(|rest| rest.strip_suffix('d'))
        .filter(|d| !d.is_empty() && d.bytes().all(|b| b.is_ascii_digit()))
        .ok_or_else(invalid)?;

    digits.parse().map_err(|_| invalid())
}

/// Analysis start times shared by every KPI with the same window size.
///
/// Using one anchor per supported window lets KPIs of different services
/// share a search when analysing the latest data.
#[derive(Debug, Clone)]
pub struct LatestDataAnchors {
    anchors: HashMap<u32, i64>,
}

impl LatestDataAnchors {
    /// Anchors relative to `now` (epoch seconds)
    pub fn at(now: i64) -> Self {
        let anchors = LATEST_DATA_WINDOWS
            .iter()
            .map(|&days| (days, now - i64::from(days) * 86_400))
            .collect();
        Self { anchors }
    }

    /// Anchors relative to the current time
    pub fn now() -> Self {
        Self::at(Utc::now().timestamp())
    }

    pub fn start_for(&self, days: u32) -> Result<i64> {
        self.anchors.get(&days).copied().ok_or_else(|| {
            ThresholdError::ConfigParse(format!("unsupported training window: {}", days))
        })
    }
}

/// Where the analysed range of a KPI starts
#[derive(Debug, Clone)]
pub enum AnalysisStart {
    /// The KPI's own `recommendation_start_date`
    StoredStartDate,
    /// The most recent `window` days, via a shared anchor
    LatestData(LatestDataAnchors),
}

impl AnalysisStart {
    fn start_time(&self, kpi: &Document, window_days: u32) -> Result<i64> {
        match self {
            AnalysisStart::LatestData(anchors) => anchors.start_for(window_days),
            AnalysisStart::StoredStartDate => match kpi.get("recommendation_start_date") {
                Some(Value::Number(n)) => n
                    .as_i64()
                    .or_else(|| n.as_f64().map(|f| f as i64))
                    .ok_or_else(|| {
                        ThresholdError::MalformedDocument(format!(
                            "recommendation_start_date is not a timestamp: {}",
                            n
                        ))
                    }),
                other => Err(ThresholdError::MalformedDocument(format!(
                    "recommendation_start_date is missing or not numeric: {:?}",
                    other
                ))),
            },
        }
    }
}

/// KPIs to analyse, keyed by training configuration.
///
/// Each key becomes one analysis search.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    entries: HashMap<TrainingConfig, Vec<KpiRef>>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, config: TrainingConfig, kpi: KpiRef) {
        self.entries.entry(config).or_default().push(kpi);
    }

    /// True when merging `other` keeps every shared key within
    /// [`KPIS_PER_SEARCH`] KPIs
    pub fn has_capacity_for(&self, other: &Batch) -> bool {
        other.entries.iter().all(|(config, kpis)| {
            self.entries
                .get(config)
                .map_or(true, |existing| existing.len() + kpis.len() <= KPIS_PER_SEARCH)
        })
    }

    /// Union of KPI lists per training configuration
    pub fn merge(&mut self, other: Batch) {
        for (config, kpis) in other.entries {
            self.entries.entry(config).or_default().extend(kpis);
        }
    }

    /// Number of searches this batch needs
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn kpi_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn kpis(&self, config: &TrainingConfig) -> Option<&[KpiRef]> {
        self.entries.get(config).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TrainingConfig, &Vec<KpiRef>)> {
        self.entries.iter()
    }

    /// Distinct services contributing KPIs to this batch
    pub fn services(&self) -> Vec<Arc<ServiceRef>> {
        let mut services: Vec<Arc<ServiceRef>> = Vec::new();
        for kpi in self.entries.values().flatten() {
            if !services.iter().any(|s| s.key() == kpi.service.key()) {
                services.push(kpi.service.clone());
            }
        }
        services
    }
}

/// Group a service's selected, ML-configured KPIs by training configuration
pub async fn service_grouping(
    service: &Arc<ServiceRef>,
    kpi_matcher: &SelectorMatcher,
    start: &AnalysisStart,
) -> Result<Batch> {
    let document = service.document().await;
    let mut grouping = Batch::new();

    for kpi in kpis(&document)? {
        let (id, title) = kpi_identity(kpi)?;
        if !kpi_matcher.matches(&id, &title) {
            continue;
        }

        let ml_configured = kpi
            .get("is_recommended_time_policies")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !ml_configured {
            continue;
        }

        let direction = required_str(kpi, "threshold_direction")?;
        let window_days = parse_training_window_size(required_str(kpi, "recommendation_training_window")?)?;
        let start_time = start.start_time(kpi, window_days)?;

        grouping.push(
            TrainingConfig::new(start_time, window_days, direction),
            KpiRef::new(service.clone(), id),
        );
    }

    Ok(grouping)
}

/// Pull-driven producer of analysis batches.
///
/// Each call to [`next_group`](Self::next_group) scans just enough services
/// to complete `group_size` batches, so scanning interleaves with the
/// processing of earlier groups.
pub struct TrainingConfigBatcher<'a> {
    services: ServiceStream<'a>,
    kpi_matcher: &'a SelectorMatcher,
    start: AnalysisStart,
    group_size: usize,

    current: Batch,
    current_services: usize,
    ready: Vec<Batch>,
    done: bool,
    services_scanned: usize,
}

impl<'a> TrainingConfigBatcher<'a> {
    pub fn new(
        services: ServiceStream<'a>,
        kpi_matcher: &'a SelectorMatcher,
        start: AnalysisStart,
        group_size: usize,
    ) -> Self {
        Self {
            services,
            kpi_matcher,
            start,
            group_size: group_size.max(1),
            current: Batch::new(),
            current_services: 0,
            ready: Vec::new(),
            done: false,
            services_scanned: 0,
        }
    }

    /// Services pulled from the listing so far
    pub fn services_scanned(&self) -> usize {
        self.services_scanned
    }

    /// Next group of up to `group_size` batches; `None` once exhausted.
    ///
    /// Any listing or document error ends the sequence.
    pub async fn next_group(&mut self) -> Option<Result<Vec<Batch>>> {
        if self.done {
            return None;
        }

        while let Some(next) = self.services.next().await {
            let grouping = match next {
                Ok(service) => {
                    self.services_scanned += 1;
                    service_grouping(&service, self.kpi_matcher, &self.start).await
                }
                Err(e) => Err(e),
            };

            let grouping = match grouping {
                Ok(grouping) => grouping,
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            };

            if grouping.is_empty() {
                continue;
            }
            self.add(grouping);

            if self.ready.len() >= self.group_size {
                return Some(Ok(mem::take(&mut self.ready)));
            }
        }

        self.done = true;
        if !self.current.is_empty() {
            self.ready.push(mem::take(&mut self.current));
        }
        if self.ready.is_empty() {
            None
        } else {
            Some(Ok(mem::take(&mut self.ready)))
        }
    }

    fn add(&mut self, grouping: Batch) {
        // The service cap counts contributing services, not KPI volume.
        if self.current_services < MAX_SERVICES_PER_BATCH && self.current.has_capacity_for(&grouping) {
            self.current.merge(grouping);
            self.current_services += 1;
        } else {
            let closed = mem::replace(&mut self.current, grouping);
            debug!(searches = closed.len(), kpis = closed.kpi_count(), "Batch closed");
            self.ready.push(closed);
            self.current_services = 1;
        }
    }
}
