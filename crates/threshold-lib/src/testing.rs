//! In-memory collaborators and document builders for tests

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use regex::Regex;
use serde_json::{json, Value};

use crate::error::{Result, ThresholdError};
use crate::models::{Document, PolicyRow, ServiceRef};
use crate::search::{SearchClient, SearchRequest, SearchRow};
use crate::store::{ObjectStore, ServiceFilter, ServiceStream};

pub fn service_doc(key: &str, title: &str, kpis: Vec<Value>) -> Document {
    json!({ "_key": key, "title": title, "kpis": kpis })
        .as_object()
        .cloned()
        .unwrap()
}

/// KPI configured for ML-recommended policies
pub fn ml_kpi(id: &str, title: &str, start_date: i64, window: &str, direction: &str) -> Value {
    json!({
        "_key": id,
        "title": title,
        "is_recommended_time_policies": true,
        "recommendation_start_date": start_date,
        "recommendation_training_window": window,
        "threshold_direction": direction,
    })
}

/// KPI without ML-recommended policies
pub fn plain_kpi(id: &str, title: &str) -> Value {
    json!({ "_key": id, "title": title, "threshold_direction": "both" })
}

pub fn search_row(value: Value) -> SearchRow {
    value.as_object().cloned().unwrap()
}

pub fn policy_row(value: Value) -> PolicyRow {
    PolicyRow(search_row(value))
}

/// Object store over a fixed list of services
pub struct MemoryStore {
    services: Vec<Arc<ServiceRef>>,
    fail_listings: bool,
    failing_updates: HashSet<String>,
    listings: Mutex<Vec<Option<ServiceFilter>>>,
    listed: AtomicUsize,
    saved: Mutex<Vec<(String, Document)>>,
    listed_at_save: Mutex<Vec<(String, usize)>>,
}

impl MemoryStore {
    pub fn new(documents: Vec<Document>) -> Self {
        Self {
            services: documents
                .into_iter()
                .map(|d| Arc::new(ServiceRef::from_document(d).unwrap()))
                .collect(),
            fail_listings: false,
            failing_updates: HashSet::new(),
            listings: Mutex::new(Vec::new()),
            listed: AtomicUsize::new(0),
            saved: Mutex::new(Vec::new()),
            listed_at_save: Mutex::new(Vec::new()),
        }
    }

    /// Every listing yields one error
    pub fn failing_listings(mut self) -> Self {
        self.fail_listings = true;
        self
    }

    /// Updates of `key` fail
    pub fn failing_update(mut self, key: &str) -> Self {
        self.failing_updates.insert(key.to_string());
        self
    }

    pub fn service(&self, key: &str) -> Arc<ServiceRef> {
        self.services
            .iter()
            .find(|s| s.key() == key)
            .cloned()
            .unwrap()
    }

    /// Filters of every listing requested so far
    pub fn listings(&self) -> Vec<Option<ServiceFilter>> {
        self.listings.lock().unwrap().clone()
    }

    /// Saved documents, in save order
    pub fn saved(&self) -> Vec<(String, Document)> {
        self.saved.lock().unwrap().clone()
    }

    pub fn saved_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.saved().into_iter().map(|(k, _)| k).collect();
        keys.sort();
        keys
    }

    /// Each saved key with the number of services listed when it was saved
    pub fn listed_at_save(&self) -> Vec<(String, usize)> {
        let mut saves = self.listed_at_save.lock().unwrap().clone();
        saves.sort();
        saves
    }

    pub fn saved_document(&self, key: &str) -> Option<Document> {
        self.saved()
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, d)| d)
    }

    async fn matches(service: &ServiceRef, filter: &Option<ServiceFilter>) -> bool {
        match filter {
            None => true,
            Some(ServiceFilter::Keys(keys)) => keys.iter().any(|k| k == service.key()),
            Some(ServiceFilter::TitleRegex(pattern)) => {
                let title = crate::models::service_title(&*service.document().await);
                Regex::new(pattern).unwrap().is_match(&title)
            }
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn list_services(&self, filter: Option<ServiceFilter>) -> ServiceStream<'_> {
        self.listings.lock().unwrap().push(filter.clone());

        if self.fail_listings {
            return stream::once(async { Err(ThresholdError::Store("listing failed".to_string())) })
                .boxed();
        }

        let listed = &self.listed;
        stream::iter(self.services.iter().cloned())
            .filter_map(move |service| {
                let filter = filter.clone();
                async move {
                    if !Self::matches(&service, &filter).await {
                        return None;
                    }
                    listed.fetch_add(1, Ordering::SeqCst);
                    Some(Ok(service))
                }
            })
            .boxed()
    }

    async fn update_service(&self, key: &str, document: &Document) -> Result<()> {
        if self.failing_updates.contains(key) {
            return Err(ThresholdError::Store(format!("update of {} rejected", key)));
        }
        self.saved
            .lock()
            .unwrap()
            .push((key.to_string(), document.clone()));
        self.listed_at_save
            .lock()
            .unwrap()
            .push((key.to_string(), self.listed.load(Ordering::SeqCst)));
        Ok(())
    }
}

type Responder = Box<dyn Fn(&SearchRequest) -> Result<Vec<SearchRow>> + Send + Sync>;

/// Search client answering from a closure and recording every request
pub struct MockSearchClient {
    responder: Responder,
    requests: Mutex<Vec<SearchRequest>>,
}

impl MockSearchClient {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&SearchRequest) -> Result<Vec<SearchRow>> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<SearchRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl SearchClient for MockSearchClient {
    async fn execute(&self, request: &SearchRequest) -> Result<Vec<SearchRow>> {
        self.requests.lock().unwrap().push(request.clone());
        (self.responder)(request)
    }
}
