//! Run metrics for threshold workflows
//!
//! Provides:
//! - Prometheus counters for services, searches and KPI outcomes
//! - A search latency histogram
//! - A structured end-of-run summary event
//! - YAML rendering of audit payloads attached to log events

use std::fmt::Debug;

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};
use serde::Serialize;
use tracing::{debug, error, info};

/// Render an in-memory audit payload as YAML for a log field.
///
/// Failing to render plain maps and lists is a bug, so it aborts.
pub fn render_yaml<T: Serialize + Debug>(what: &str, value: &T) -> String {
    match serde_yaml::to_string(value) {
        Ok(yaml) => yaml,
        Err(e) => {
            error!(payload = ?value, error = %e, "Failed to render {} as YAML", what);
            panic!("failed to render {} as YAML: {}", what, e);
        }
    }
}

/// Histogram buckets for search latency (in seconds)
const SEARCH_LATENCY_BUCKETS: &[f64] = &[0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0];

/// Metrics of one workflow run.
///
/// Each run owns its own registry, so concurrent runs (and tests) never
/// share counters.
pub struct RunMetrics {
    registry: Registry,
    services_scanned: IntCounter,
    searches_executed: IntCounter,
    search_failures: IntCounter,
    kpis_configured: IntCounter,
    kpis_failed: IntCounter,
    kpis_reset: IntCounter,
    services_saved: IntCounter,
    persist_failures: IntCounter,
    search_latency_seconds: Histogram,
}

/// Counter values at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub services_scanned: u64,
    pub searches_executed: u64,
    pub search_failures: u64,
    pub kpis_configured: u64,
    pub kpis_failed: u64,
    pub kpis_reset: u64,
    pub services_saved: u64,
    pub persist_failures: u64,
}

fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
    let counter = IntCounter::new(name, help).expect("Failed to create counter");
    registry
        .register(Box::new(counter.clone()))
        .expect("Failed to register counter");
    counter
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl RunMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let search_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "kpictl_search_latency_seconds",
                "Time spent executing one analysis search",
            )
            .buckets(SEARCH_LATENCY_BUCKETS.to_vec()),
        )
        .expect("Failed to create search_latency_seconds");
        registry
            .register(Box::new(search_latency_seconds.clone()))
            .expect("Failed to register search_latency_seconds");

        Self {
            services_scanned: counter(
                &registry,
                "kpictl_services_scanned_total",
                "Services pulled from the catalog listing",
            ),
            searches_executed: counter(
                &registry,
                "kpictl_searches_executed_total",
                "Analysis searches executed",
            ),
            search_failures: counter(
                &registry,
                "kpictl_search_failures_total",
                "Analysis searches that failed",
            ),
            kpis_configured: counter(
                &registry,
                "kpictl_kpis_configured_total",
                "KPIs configured from recommended policies",
            ),
            kpis_failed: counter(
                &registry,
                "kpictl_kpis_failed_total",
                "KPIs without usable policies (insufficient data or constant value)",
            ),
            kpis_reset: counter(
                &registry,
                "kpictl_kpis_reset_total",
                "KPIs rewritten to the disabled baseline",
            ),
            services_saved: counter(
                &registry,
                "kpictl_services_saved_total",
                "Service documents persisted",
            ),
            persist_failures: counter(
                &registry,
                "kpictl_persist_failures_total",
                "Service documents that failed to persist",
            ),
            search_latency_seconds,
            registry,
        }
    }

    pub fn inc_services_scanned(&self, n: u64) {
        self.services_scanned.inc_by(n);
    }

    pub fn inc_searches_executed(&self) {
        self.searches_executed.inc();
    }

    pub fn inc_search_failures(&self) {
        self.search_failures.inc();
    }

    pub fn inc_kpis_configured(&self, n: u64) {
        self.kpis_configured.inc_by(n);
    }

    pub fn inc_kpis_failed(&self, n: u64) {
        self.kpis_failed.inc_by(n);
    }

    pub fn inc_kpis_reset(&self, n: u64) {
        self.kpis_reset.inc_by(n);
    }

    pub fn inc_services_saved(&self) {
        self.services_saved.inc();
    }

    pub fn inc_persist_failures(&self) {
        self.persist_failures.inc();
    }

    /// Record a search latency observation
    pub fn observe_search_latency(&self, duration_secs: f64) {
        self.search_latency_seconds.observe(duration_secs);
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            services_scanned: self.services_scanned.get(),
            searches_executed: self.searches_executed.get(),
            search_failures: self.search_failures.get(),
            kpis_configured: self.kpis_configured.get(),
            kpis_failed: self.kpis_failed.get(),
            kpis_reset: self.kpis_reset.get(),
            services_saved: self.services_saved.get(),
            persist_failures: self.persist_failures.get(),
        }
    }

    /// Prometheus text exposition of every metric of the run
    pub fn encode_text(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.registry.gather(), &mut buffer) {
            debug!(error = %e, "Failed to encode run metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }

    /// Log the end-of-run counters as one structured event
    pub fn log_summary(&self, workflow: &str) {
        let s = self.summary();
        info!(
            event = "workflow_finished",
            workflow = %workflow,
            services_scanned = s.services_scanned,
            searches_executed = s.searches_executed,
            search_failures = s.search_failures,
            kpis_configured = s.kpis_configured,
            kpis_failed = s.kpis_failed,
            kpis_reset = s.kpis_reset,
            services_saved = s.services_saved,
            persist_failures = s.persist_failures,
            "Workflow run summary"
        );
        debug!(metrics = %self.encode_text(), "Run metrics exposition");
    }
}
