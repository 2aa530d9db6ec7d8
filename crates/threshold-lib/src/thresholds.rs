//! KPI threshold configuration documents
//!
//! Builders for the disabled baseline and for synthesized threshold levels.

use serde_json::{json, Map, Value};

use crate::models::Document;

/// Base severity of every generated threshold set
pub const BASE_SEVERITY: &str = "normal";

/// Display attributes of a severity label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeverityInfo {
    pub label: &'static str,
    pub value: u8,
    pub color: &'static str,
    pub color_light: &'static str,
}

const SEVERITIES: [SeverityInfo; 6] = [
    SeverityInfo { label: "critical", value: 6, color: "#B50101", color_light: "#E5A6A6" },
    SeverityInfo { label: "high", value: 5, color: "#F26A35", color_light: "#FBCBB9" },
    SeverityInfo { label: "medium", value: 4, color: "#FCB64E", color_light: "#FEE6C1" },
    SeverityInfo { label: "low", value: 3, color: "#FFE98C", color_light: "#FFF4C5" },
    SeverityInfo { label: "normal", value: 2, color: "#99D18B", color_light: "#DCEFD7" },
    SeverityInfo { label: "info", value: 1, color: "#AED3E5", color_light: "#E3F0F6" },
];

/// Severity attributes; unknown labels get value 0 and no colors
pub fn severity(label: &str) -> SeverityInfo {
    SEVERITIES
        .iter()
        .copied()
        .find(|s| s.label == label)
        .unwrap_or(SeverityInfo {
            label: "",
            value: 0,
            color: "",
            color_light: "",
        })
}

/// One severity breakpoint of a threshold set
pub fn threshold_level(severity_label: &str, threshold_value: f64, dynamic_param: f64) -> Value {
    let info = severity(severity_label);
    json!({
        "severityLabel": severity_label,
        "severityValue": info.value,
        "severityColor": info.color,
        "severityColorLight": info.color_light,
        "thresholdValue": threshold_value,
        "dynamicParam": dynamic_param,
    })
}

fn threshold_set(levels: Vec<Value>) -> Value {
    let base = severity(BASE_SEVERITY);
    json!({
        "baseSeverityLabel": BASE_SEVERITY,
        "baseSeverityValue": base.value,
        "baseSeverityColor": base.color,
        "baseSeverityColorLight": base.color_light,
        "metricField": "",
        "renderBoundaryMin": 0,
        "renderBoundaryMax": 100,
        "isMaxStatic": false,
        "isMinStatic": false,
        "gaugeMin": 0,
        "gaugeMax": 100,
        "thresholdLevels": levels,
    })
}

/// Aggregate threshold set over the given levels
pub fn aggregate_thresholds(levels: Vec<Value>) -> Value {
    threshold_set(levels)
}

/// Entity threshold set with no levels
pub fn entity_thresholds() -> Value {
    threshold_set(Vec::new())
}

/// Time-variate policy map holding only the always-active default policy
pub fn default_policies() -> Map<String, Value> {
    let mut policies = Map::new();
    policies.insert(
        "default_policy".to_string(),
        json!({
            "title": "Default",
            "aggregate_thresholds": aggregate_thresholds(Vec::new()),
            "entity_thresholds": entity_thresholds(),
            "policy_type": "static",
            "time_blocks": [],
        }),
    );
    policies
}

/// Overwrite a KPI's threshold configuration with the disabled baseline
pub fn reset_thresholding(kpi: &mut Document) {
    kpi.insert("aggregate_thresholds".to_string(), aggregate_thresholds(Vec::new()));
    kpi.insert("entity_thresholds".to_string(), entity_thresholds());

    kpi.insert("aggregate_outlier_detection_enabled".to_string(), json!(false));
    kpi.remove("outlier_detection_algo");
    kpi.remove("outlier_detection_sensitivity");

    kpi.insert("time_variate_thresholds".to_string(), json!(false));
    kpi.remove("time_variate_thresholds_specification");

    kpi.insert("adaptive_thresholds_is_enabled".to_string(), json!(false));
    kpi.remove("adaptive_thresholding_training_window");

    kpi.remove("threshold_recommendations");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_disables_everything() {
        let mut kpi = json!({
            "_key": "k1",
            "title": "errors",
            "adaptive_thresholds_is_enabled": true,
            "adaptive_thresholding_training_window": "-7d",
            "aggregate_outlier_detection_enabled": true,
            "outlier_detection_algo": "iqr",
            "outlier_detection_sensitivity": 2.0,
            "time_variate_thresholds": true,
            "time_variate_thresholds_specification": {"policies": {}},
            "threshold_recommendations": {"x": 1},
            "aggregate_thresholds": {"thresholdLevels": [{"thresholdValue": 5}]},
        })
        .as_object()
        .cloned()
        .unwrap();

        reset_thresholding(&mut kpi);

        assert_eq!(kpi["adaptive_thresholds_is_enabled"], json!(false));
        assert_eq!(kpi["time_variate_thresholds"], json!(false));
        assert_eq!(kpi["aggregate_outlier_detection_enabled"], json!(false));
        for removed in [
            "adaptive_thresholding_training_window",
            "outlier_detection_algo",
            "outlier_detection_sensitivity",
            "time_variate_thresholds_specification",
            "threshold_recommendations",
        ] {
            assert!(!kpi.contains_key(removed), "{} should be removed", removed);
        }
        assert_eq!(kpi["aggregate_thresholds"]["thresholdLevels"], json!([]));
        assert_eq!(kpi["aggregate_thresholds"]["baseSeverityLabel"], json!("normal"));
        assert_eq!(kpi["aggregate_thresholds"]["baseSeverityValue"], json!(2));
        assert_eq!(kpi["entity_thresholds"]["thresholdLevels"], json!([]));
        // untouched identity
        assert_eq!(kpi["title"], json!("errors"));
    }

    #[test]
    fn test_threshold_level_attributes() {
        let level = threshold_level("critical", 16.0, 3.0);
        assert_eq!(level["severityValue"], json!(6));
        assert_eq!(level["severityColor"], json!("#B50101"));
        assert_eq!(level["thresholdValue"], json!(16.0));
        assert_eq!(level["dynamicParam"], json!(3.0));

        let unknown = threshold_level("weird", 1.0, 1.0);
        assert_eq!(unknown["severityValue"], json!(0));
    }

    #[test]
    fn test_default_policies_shape() {
        let policies = default_policies();
        assert_eq!(policies.len(), 1);
        assert_eq!(policies["default_policy"]["policy_type"], json!("static"));
        assert_eq!(policies["default_policy"]["time_blocks"], json!([]));
    }
}
