//! Threshold policy synthesis
//!
//! Turns the recommendation rows of a KPI into its threshold configuration:
//! adaptive (stdev) or static aggregate levels, optional time-variate
//! sub-policies, and the insufficient-data / constant-KPI dispositions.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::{Result, ThresholdError};
use crate::models::{kpi_identity, kpis_mut, service_title, Document, PoliciesByKpi, PolicyRow, ServiceRef};
use crate::observability::render_yaml;
use crate::thresholds::{
    aggregate_thresholds, default_policies, entity_thresholds, reset_thresholding, threshold_level,
};

/// Flag of a KPI whose value never changed over the training window
pub const CONSTANT_KPI_FLAG: &str = "CONSTANT_KPI";

/// Cron value of the always-active aggregate policy
const NO_SCHEDULE: &str = "None";

/// Outlier detection algorithm enabled alongside adaptive thresholds
const OUTLIER_DETECTION_ALGO: &str = "iqr";

/// What to do with KPIs for which no policy could be generated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InsufficientDataAction {
    /// Leave the stored configuration untouched
    #[default]
    Skip,
    /// Rewrite the configuration to the disabled baseline
    Reset,
}

impl FromStr for InsufficientDataAction {
    type Err = ThresholdError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "skip" => Ok(InsufficientDataAction::Skip),
            "reset" => Ok(InsufficientDataAction::Reset),
            other => Err(ThresholdError::InvalidArgument(format!(
                "unsupported insufficient data action: {} (expected skip or reset)",
                other
            ))),
        }
    }
}

impl fmt::Display for InsufficientDataAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InsufficientDataAction::Skip => write!(f, "skip"),
            InsufficientDataAction::Reset => write!(f, "reset"),
        }
    }
}

/// Identity of the KPI being synthesized, used to prefix its errors
#[derive(Debug, Clone)]
pub struct KpiContext {
    pub service_id: String,
    pub service_title: String,
    pub kpi_id: String,
    pub kpi_title: String,
}

impl KpiContext {
    pub fn prefix(&self) -> String {
        format!(
            "[{}/{}] ({}/{})",
            self.service_title, self.kpi_title, self.service_id, self.kpi_id
        )
    }

    fn invalid(&self, message: impl Into<String>) -> ThresholdError {
        ThresholdError::InvalidRecommendation {
            context: self.prefix(),
            message: message.into(),
        }
    }

    fn number(&self, row: &PolicyRow, field: &str) -> Result<f64> {
        row.get_f64(field)
            .ok_or_else(|| self.invalid(format!("could not parse {}", field)))
    }
}

/// Parse a `Thresholds` payload: severity label -> one value or a list.
///
/// The payload usually arrives as a string and may use single quotes.
pub fn parse_thresholds(raw: &Value) -> Result<BTreeMap<String, Vec<f64>>> {
    let invalid = || ThresholdError::ConfigParse(format!("failed to parse thresholds: {}", raw));

    let parsed: Map<String, Value> = match raw {
        Value::String(s) => serde_json::from_str(&s.replace('\'', "\"")).map_err(|_| invalid())?,
        Value::Object(map) => map.clone(),
        _ => return Err(invalid()),
    };

    let mut thresholds = BTreeMap::new();
    for (severity, value) in parsed {
        let params = match value {
            Value::Number(n) => vec![n.as_f64().ok_or_else(invalid)?],
            Value::Array(items) => items
                .iter()
                .map(|item| item.as_f64().ok_or_else(invalid))
                .collect::<Result<Vec<f64>>>()?,
            _ => return Err(invalid()),
        };
        thresholds.insert(severity, params);
    }
    Ok(thresholds)
}

/// Content key of a time-variate policy
fn policy_key(title: &str) -> String {
    hex::encode(Sha256::digest(title.as_bytes()))
}

/// Result of synthesizing one KPI
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KpiSynthesis {
    /// Threshold fields to apply on top of the disabled baseline
    pub config: Document,
    pub adaptive: bool,
    pub time_variate: bool,
    pub constant_kpi: bool,
    pub insufficient_data: bool,
}

impl KpiSynthesis {
    /// Whether the synthesized configuration is usable
    pub fn ok(&self) -> bool {
        !(self.constant_kpi || self.insufficient_data)
    }

    /// Human-readable description of the outcome
    pub fn details(&self) -> String {
        let mut details = Vec::new();
        if self.ok() {
            if self.time_variate {
                details.push("time variate");
            }
            details.push(if self.adaptive { "adaptive (stdev)" } else { "static" });
        } else if self.constant_kpi {
            details.push("None (constant KPI)");
        } else {
            details.push("None (insufficient data / no policies generated)");
        }
        details.join(", ")
    }
}

/// Synthesize the threshold configuration of one KPI from its policy rows.
///
/// `window_days` is the KPI's training window, required when any row is
/// adaptive.
pub fn synthesize_kpi(
    context: &KpiContext,
    rows: &[PolicyRow],
    window_days: Option<u32>,
) -> Result<KpiSynthesis> {
    let mut synthesis = KpiSynthesis::default();
    let mut sensitivity = None;
    let mut policies = default_policies();

    if rows.is_empty() {
        synthesis.insufficient_data = true;
    } else {
        debug!(
            service_id = %context.service_id,
            kpi_id = %context.kpi_id,
            policies = %render_yaml("KPI policies", &rows),
            "Updating thresholding configuration for the [{} / {}] KPI",
            context.service_title,
            context.kpi_title
        );
    }

    for row in rows {
        let flag = row
            .get_str("Recommendation Flag")
            .ok_or_else(|| context.invalid("Recommendation Flag was not found"))?;
        let algorithm = row
            .get_str("Algorithm")
            .ok_or_else(|| context.invalid("Algorithm is not provided"))?
            .to_lowercase();

        match algorithm.as_str() {
            "stdev" => synthesis.adaptive = true,
            "static" => {}
            "none" if flag == CONSTANT_KPI_FLAG && rows.len() == 1 => {
                synthesis.constant_kpi = true;
                continue;
            }
            _ => {
                return Err(ThresholdError::UnsupportedAlgorithm {
                    context: context.prefix(),
                    algorithm,
                    flag: flag.to_string(),
                })
            }
        }

        let cron = row
            .get_str("Cron Expression")
            .ok_or_else(|| context.invalid("cron expression is missing"))?;
        let time_variate = cron != NO_SCHEDULE;
        synthesis.time_variate |= time_variate;

        let mean = context.number(row, "Mean")?;
        let std = context.number(row, "Std")?;
        if algorithm == "stdev" {
            sensitivity = Some(context.number(row, "Sensitivity")?);
        }

        let raw_thresholds = row
            .get("Thresholds")
            .ok_or_else(|| ThresholdError::ConfigParse(format!("{} thresholds are missing", context.prefix())))?;

        let mut levels = Vec::new();
        for (severity, params) in parse_thresholds(raw_thresholds)? {
            for param in params {
                let value = if algorithm == "stdev" { mean + std * param } else { param };
                levels.push(threshold_level(&severity, value, param));
            }
        }

        if time_variate {
            let duration = context.number(row, "Duration")?;
            let title = format!("[{}] {}", cron, duration);
            policies.insert(
                policy_key(&title),
                json!({
                    "title": title,
                    "aggregate_thresholds": aggregate_thresholds(levels),
                    "entity_thresholds": entity_thresholds(),
                    "policy_type": "stdev",
                    "time_blocks": [[cron, duration]],
                }),
            );
        } else if rows.len() == 1 {
            synthesis
                .config
                .insert("aggregate_thresholds".to_string(), aggregate_thresholds(levels));
            break;
        } else {
            return Err(context.invalid("unexpected KPI policy recommendations"));
        }
    }

    let config = &mut synthesis.config;
    config.insert("time_variate_thresholds".to_string(), json!(synthesis.time_variate));
    config.insert("adaptive_thresholds_is_enabled".to_string(), json!(synthesis.adaptive));

    if synthesis.adaptive {
        let days = window_days.ok_or_else(|| context.invalid("training window is unknown"))?;
        config.insert(
            "adaptive_thresholding_training_window".to_string(),
            json!(format!("-{}d", days)),
        );
        config.insert("aggregate_outlier_detection_enabled".to_string(), json!(true));
        config.insert("outlier_detection_algo".to_string(), json!(OUTLIER_DETECTION_ALGO));
        config.insert("outlier_detection_sensitivity".to_string(), json!(sensitivity));
    }
    if synthesis.time_variate {
        config.insert(
            "time_variate_thresholds_specification".to_string(),
            json!({ "policies": policies }),
        );
    }

    Ok(synthesis)
}

/// Apply a synthesis result to the stored KPI document
pub fn apply_synthesis(kpi: &mut Document, synthesis: &KpiSynthesis, action: InsufficientDataAction) {
    if synthesis.ok() {
        reset_thresholding(kpi);
        kpi.extend(synthesis.config.clone());
    } else if action == InsufficientDataAction::Reset {
        reset_thresholding(kpi);
    }
}

/// Outcome of configuring the selected KPIs of one service
#[derive(Debug, Clone, Default)]
pub struct ServiceConfiguration {
    pub service_id: String,
    pub service_title: String,
    pub kpis_processed: usize,
    /// Ids of KPIs without usable policies
    pub failed_kpis: BTreeSet<String>,
    /// `"<kpi title> (<kpi id>)"` -> outcome details
    pub change_summary: BTreeMap<String, String>,
}

impl ServiceConfiguration {
    pub fn kpis_configured(&self) -> usize {
        self.kpis_processed - self.failed_kpis.len()
    }
}

/// Synthesizes and applies thresholds for the selected KPIs of a service
pub struct ServiceThresholdConfigurator<'a> {
    policies: &'a PoliciesByKpi,
    /// KPI id -> training window size, for the KPIs to configure
    windows: &'a HashMap<String, u32>,
    action: InsufficientDataAction,
}

impl<'a> ServiceThresholdConfigurator<'a> {
    pub fn new(
        policies: &'a PoliciesByKpi,
        windows: &'a HashMap<String, u32>,
        action: InsufficientDataAction,
    ) -> Self {
        Self {
            policies,
            windows,
            action,
        }
    }

    /// Configure the service document in place.
    ///
    /// The document is only replaced when every KPI synthesized cleanly.
    pub async fn configure(&self, service: &ServiceRef) -> Result<ServiceConfiguration> {
        let mut document = service.document().await;
        let mut updated = document.clone();

        let mut outcome = ServiceConfiguration {
            service_id: service.key().to_string(),
            service_title: service_title(&updated),
            ..Default::default()
        };

        let selected: HashSet<&str> = self.windows.keys().map(String::as_str).collect();
        let no_rows = Vec::new();

        for kpi in kpis_mut(&mut updated)? {
            let (kpi_id, kpi_title) = kpi_identity(kpi)?;
            if !selected.contains(kpi_id.as_str()) {
                continue;
            }

            let context = KpiContext {
                service_id: outcome.service_id.clone(),
                service_title: outcome.service_title.clone(),
                kpi_id: kpi_id.clone(),
                kpi_title: kpi_title.clone(),
            };
            let rows = self.policies.get(&kpi_id).unwrap_or(&no_rows);
            let synthesis = synthesize_kpi(&context, rows, self.windows.get(&kpi_id).copied())?;

            apply_synthesis(kpi, &synthesis, self.action);

            outcome.kpis_processed += 1;
            if !synthesis.ok() {
                outcome.failed_kpis.insert(kpi_id.clone());
            }
            outcome
                .change_summary
                .insert(format!("{} ({})", kpi_title, kpi_id), synthesis.details());
        }

        *document = updated;
        Ok(outcome)
    }
}
