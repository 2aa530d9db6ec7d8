//! Service catalog access
//!
//! The object store itself is an external collaborator; this module defines
//! its interface and merges the filtered listings a set of service selectors
//! resolves to into one ordered stream.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::json;

use crate::error::Result;
use crate::models::{Document, ServiceRef};
use crate::selector::wildcard_to_regex;

/// Maximum number of ids per key-equality listing
pub const KEYS_PER_QUERY: usize = 10;

/// Stream of services, in listing order
pub type ServiceStream<'a> = BoxStream<'a, Result<Arc<ServiceRef>>>;

/// Server-side filter of a service listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceFilter {
    /// `_key` equal to any of the ids
    Keys(Vec<String>),
    /// `title` matching a regular expression
    TitleRegex(String),
}

impl ServiceFilter {
    /// JSON filter expression understood by the catalog listing endpoint
    pub fn to_query(&self) -> String {
        match self {
            ServiceFilter::Keys(keys) => {
                let conditions: Vec<_> = keys.iter().map(|k| json!({ "_key": k })).collect();
                json!({ "$or": conditions }).to_string()
            }
            ServiceFilter::TitleRegex(pattern) => {
                json!({ "title": { "$regex": pattern } }).to_string()
            }
        }
    }
}

/// Catalog of services
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Lazily list services, optionally filtered, following pagination
    fn list_services(&self, filter: Option<ServiceFilter>) -> ServiceStream<'_>;

    /// Persist a full service document
    async fn update_service(&self, key: &str, document: &Document) -> Result<()>;
}

/// Stream the services selected by a list of service selectors.
///
/// No selectors lists the whole catalog. Otherwise selectors are looked up
/// both as ids (chunked into key-equality listings) and as title patterns
/// (one regex listing each). Sub-streams are concatenated in that order and
/// not deduplicated.
pub fn select_services<'a>(store: &'a dyn ObjectStore, selectors: &[String]) -> ServiceStream<'a> {
    if selectors.is_empty() {
        return store.list_services(None);
    }

    let listings = service_filters(selectors)
        .into_iter()
        .map(move |filter| store.list_services(Some(filter)));
    stream::iter(listings).flatten().boxed()
}

/// Listing filters a non-empty selector list resolves to
pub fn service_filters(selectors: &[String]) -> Vec<ServiceFilter> {
    let by_key = selectors
        .chunks(KEYS_PER_QUERY)
        .map(|chunk| ServiceFilter::Keys(chunk.to_vec()));
    let by_title = selectors
        .iter()
        .map(|s| ServiceFilter::TitleRegex(wildcard_to_regex(s)));
    by_key.chain(by_title).collect()
}
