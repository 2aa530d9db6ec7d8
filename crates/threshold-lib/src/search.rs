//! Search execution interface

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::Result;

/// One result row: field name -> value
pub type SearchRow = Map<String, Value>;

/// A search query together with its execution parameters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchRequest {
    pub query: String,
    /// Epoch seconds, inclusive
    pub earliest_time: String,
    /// Epoch seconds, exclusive
    pub latest_time: String,
    pub app: String,
    pub user: String,
    pub timeout: Duration,
    pub allow_empty: bool,
    pub allow_partial: bool,
}

/// Executes searches against the monitoring platform.
///
/// Implementations own authentication and retries. Returning an error means
/// the search is terminally failed, including empty or partial results when
/// the request disallows them.
#[async_trait]
pub trait SearchClient: Send + Sync {
    async fn execute(&self, request: &SearchRequest) -> Result<Vec<SearchRow>>;
}
