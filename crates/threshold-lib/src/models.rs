//! Core data models for the threshold pipeline

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, MutexGuard};

use crate::error::{Result, ThresholdError};

/// Raw JSON document of a catalog object
pub type Document = Map<String, Value>;

/// A service fetched from the object store.
///
/// The document is mutated in place by synthesis and then handed to a
/// single persist call. Only one worker owns a given service per run.
#[derive(Debug)]
pub struct ServiceRef {
    key: String,
    document: Mutex<Document>,
}

impl ServiceRef {
    pub fn new(key: impl Into<String>, document: Document) -> Self {
        Self {
            key: key.into(),
            document: Mutex::new(document),
        }
    }

    /// Build a service from its raw document, reading the key from `_key`
    pub fn from_document(document: Document) -> Result<Self> {
        let key = document
            .get("_key")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ThresholdError::MalformedDocument("service document has no _key".to_string())
            })?
            .to_string();
        Ok(Self::new(key, document))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Lock the raw document for reading or in-place mutation
    pub async fn document(&self) -> MutexGuard<'_, Document> {
        self.document.lock().await
    }

    /// Copy of the current document
    pub async fn snapshot(&self) -> Document {
        self.document.lock().await.clone()
    }
}

/// Title of a service document (empty when absent)
pub fn service_title(document: &Document) -> String {
    document
        .get("title")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// KPI objects embedded in a service document
pub fn kpis(document: &Document) -> Result<Vec<&Document>> {
    match document.get("kpis") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_object().ok_or_else(|| {
                    ThresholdError::MalformedDocument(format!("KPI entry is not an object: {}", item))
                })
            })
            .collect(),
        Some(other) => Err(ThresholdError::MalformedDocument(format!(
            "kpis is not a list: {}",
            other
        ))),
    }
}

/// Mutable view of the KPI objects embedded in a service document
pub fn kpis_mut(document: &mut Document) -> Result<Vec<&mut Document>> {
    match document.get_mut("kpis") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter_mut()
            .map(|item| match item {
                Value::Object(kpi) => Ok(kpi),
                other => Err(ThresholdError::MalformedDocument(format!(
                    "KPI entry is not an object: {}",
                    other
                ))),
            })
            .collect(),
        Some(other) => Err(ThresholdError::MalformedDocument(format!(
            "kpis is not a list: {}",
            other
        ))),
    }
}

/// Required string field of a KPI document
pub fn required_str<'a>(kpi: &'a Document, field: &str) -> Result<&'a str> {
    kpi.get(field).and_then(Value::as_str).ok_or_else(|| {
        ThresholdError::MalformedDocument(format!("KPI field {} is missing or not a string", field))
    })
}

/// `(_key, title)` of a KPI document
pub fn kpi_identity(kpi: &Document) -> Result<(String, String)> {
    Ok((
        required_str(kpi, "_key")?.to_string(),
        required_str(kpi, "title")?.to_string(),
    ))
}

/// Training window and direction shared by every KPI of one analysis search
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrainingConfig {
    /// Unix timestamp in seconds
    pub start_time: i64,
    /// Number of days
    pub window_days: u32,
    pub direction: String,
}

impl TrainingConfig {
    pub fn new(start_time: i64, window_days: u32, direction: impl Into<String>) -> Self {
        Self {
            start_time,
            window_days,
            direction: direction.into(),
        }
    }

    /// Exclusive end of the analysed range, in epoch seconds
    pub fn end_time(&self) -> i64 {
        self.start_time
            .saturating_add(i64::from(self.window_days).saturating_mul(86_400))
    }
}

impl fmt::Display for TrainingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let start = DateTime::<Utc>::from_timestamp(self.start_time, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| self.start_time.to_string());
        write!(f, "{}/{}d/{}", start, self.window_days, self.direction)
    }
}

/// Globally identifies a KPI: ids are only unique within their service
#[derive(Debug, Clone)]
pub struct KpiRef {
    pub service: Arc<ServiceRef>,
    pub kpi_id: String,
}

impl KpiRef {
    pub fn new(service: Arc<ServiceRef>, kpi_id: impl Into<String>) -> Self {
        Self {
            service,
            kpi_id: kpi_id.into(),
        }
    }
}

impl PartialEq for KpiRef {
    fn eq(&self, other: &Self) -> bool {
        self.service.key() == other.service.key() && self.kpi_id == other.kpi_id
    }
}

impl Eq for KpiRef {}

impl Hash for KpiRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.service.key().hash(state);
        self.kpi_id.hash(state);
    }
}

impl fmt::Display for KpiRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service.key(), self.kpi_id)
    }
}

/// Raw field map returned by an analysis search for one KPI
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct PolicyRow(pub Map<String, Value>);

impl PolicyRow {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// String value of a field
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.0.get(field).and_then(Value::as_str)
    }

    /// Numeric value of a field; searches report numbers as strings
    pub fn get_f64(&self, field: &str) -> Option<f64> {
        match self.0.get(field)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl From<Map<String, Value>> for PolicyRow {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

/// KPI id -> recommendation rows, in arrival order
pub type PoliciesByKpi = HashMap<String, Vec<PolicyRow>>;

/// Service key -> KPI id -> recommendation rows
pub type PoliciesByService = HashMap<String, PoliciesByKpi>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_service_from_document_reads_key() {
        let svc = ServiceRef::from_document(doc(json!({"_key": "svc1", "title": "One"}))).unwrap();
        assert_eq!(svc.key(), "svc1");

        let err = ServiceRef::from_document(doc(json!({"title": "One"}))).unwrap_err();
        assert!(matches!(err, ThresholdError::MalformedDocument(_)));
    }

    #[test]
    fn test_training_config_display_and_end() {
        let tc = TrainingConfig::new(1_700_000_000, 7, "both");
        assert_eq!(tc.to_string(), "2023-11-14 22:13:20/7d/both");
        assert_eq!(tc.end_time(), 1_700_000_000 + 7 * 86_400);
    }

    #[test]
    fn test_training_config_end_saturates() {
        let tc = TrainingConfig::new(i64::MAX - 10, 30, "both");
        assert_eq!(tc.end_time(), i64::MAX);
    }

    #[test]
    fn test_training_config_structural_equality() {
        let mut by_config = HashMap::new();
        by_config.insert(TrainingConfig::new(100, 7, "upper"), 1);
        *by_config
            .entry(TrainingConfig::new(100, 7, "upper"))
            .or_insert(0) += 1;
        by_config.insert(TrainingConfig::new(100, 7, "lower"), 1);

        assert_eq!(by_config.len(), 2);
        assert_eq!(by_config[&TrainingConfig::new(100, 7, "upper")], 2);
    }

    #[test]
    fn test_kpi_ref_identity_uses_service_key() {
        let a = Arc::new(ServiceRef::new("svc1", Document::new()));
        let b = Arc::new(ServiceRef::new("svc1", Document::new()));
        let c = Arc::new(ServiceRef::new("svc2", Document::new()));

        assert_eq!(KpiRef::new(a.clone(), "k1"), KpiRef::new(b, "k1"));
        assert_ne!(KpiRef::new(a, "k1"), KpiRef::new(c, "k1"));
    }

    #[test]
    fn test_policy_row_numbers_from_strings() {
        let row = PolicyRow(doc(json!({"Mean": "10.5", "Std": 2, "Cron Expression": "None"})));
        assert_eq!(row.get_f64("Mean"), Some(10.5));
        assert_eq!(row.get_f64("Std"), Some(2.0));
        assert_eq!(row.get_f64("Cron Expression"), None);
        assert_eq!(row.get_str("Cron Expression"), Some("None"));
    }

    #[test]
    fn test_kpis_accessors() {
        let mut svc = doc(json!({"kpis": [{"_key": "k1", "title": "errors"}]}));
        let list = kpis(&svc).unwrap();
        assert_eq!(kpi_identity(list[0]).unwrap(), ("k1".to_string(), "errors".to_string()));

        for kpi in kpis_mut(&mut svc).unwrap() {
            kpi.insert("touched".to_string(), json!(true));
        }
        assert_eq!(svc["kpis"][0]["touched"], json!(true));

        assert!(kpis(&doc(json!({"kpis": "nope"}))).is_err());
        assert!(kpis(&doc(json!({}))).unwrap().is_empty());
    }
}
