//! Service catalog over the ITOA REST interface

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use threshold_lib::models::{Document, ServiceRef};
use threshold_lib::{ObjectStore, Result, ServiceFilter, ServiceStream, ThresholdError};
use tracing::debug;

use crate::client::RestClient;

const SERVICE_PATH: &str = "servicesNS/nobody/SA-ITOA/itoa_interface/service";

/// Services requested per listing page
pub const PAGE_SIZE: usize = 100;

pub struct HttpObjectStore {
    client: Arc<RestClient>,
    page_size: usize,
}

impl HttpObjectStore {
    pub fn new(client: Arc<RestClient>) -> Self {
        Self {
            client,
            page_size: PAGE_SIZE,
        }
    }

    #[cfg(test)]
    fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    async fn fetch_page(&self, filter: Option<&ServiceFilter>, offset: usize) -> Result<Vec<Document>> {
        let url = self.client.url(SERVICE_PATH).map_err(store_error)?;
        let mut query = vec![
            ("sort_key", "_key".to_string()),
            ("sort_dir", "asc".to_string()),
            ("count", self.page_size.to_string()),
            ("offset", offset.to_string()),
        ];
        if let Some(filter) = filter {
            query.push(("filter", filter.to_query()));
        }

        let response = self
            .client
            .send(|http| http.get(url.clone()).query(&query))
            .await
            .map_err(store_error)?;
        let page: Vec<Document> = response.json().await.map_err(store_error)?;

        debug!(offset, services = page.len(), filter = ?filter, "Fetched service page");
        Ok(page)
    }
}

fn store_error(e: impl std::fmt::Display) -> ThresholdError {
    ThresholdError::Store(e.to_string())
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    /// Pages are fetched on demand; a short page ends the listing
    fn list_services(&self, filter: Option<ServiceFilter>) -> ServiceStream<'_> {
        let pages = stream::unfold(Some(0usize), move |offset| {
            let filter = filter.clone();
            async move {
                let offset = offset?;
                match self.fetch_page(filter.as_ref(), offset).await {
                    Ok(page) => {
                        let next = (page.len() >= self.page_size).then_some(offset + page.len());
                        Some((Ok(page), next))
                    }
                    Err(e) => Some((Err(e), None)),
                }
            }
        });

        pages
            .flat_map(|page: Result<Vec<Document>>| {
                let services: Vec<Result<Arc<ServiceRef>>> = match page {
                    Ok(documents) => documents
                        .into_iter()
                        .map(|document| ServiceRef::from_document(document).map(Arc::new))
                        .collect(),
                    Err(e) => vec![Err(e)],
                };
                stream::iter(services)
            })
            .boxed()
    }

    async fn update_service(&self, key: &str, document: &Document) -> Result<()> {
        let url = self
            .client
            .url(&format!("{}/{}", SERVICE_PATH, key))
            .map_err(store_error)?;

        let response = self
            .client
            .send(|http| {
                http.post(url.clone())
                    .query(&[("is_partial_data", "0")])
                    .json(document)
            })
            .await
            .map_err(store_error)?;
        // the save is only complete once the reply has been read
        response.text().await.map_err(store_error)?;

        debug!(service_id = %key, "Service saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{test_client, test_client_with_timeout};
    use futures_util::TryStreamExt;
    use mockito::{Matcher, Mock, Server};
    use serde_json::json;
    use std::io::Write;
    use std::time::Duration;

    fn services(range: std::ops::Range<usize>) -> String {
        let docs: Vec<_> = range
            .map(|i| json!({ "_key": format!("svc{}", i), "title": format!("Service {}", i) }))
            .collect();
        serde_json::to_string(&docs).unwrap()
    }

    fn page_matcher(offset: usize) -> Matcher {
        Matcher::AllOf(vec![
            Matcher::UrlEncoded("sort_key".into(), "_key".into()),
            Matcher::UrlEncoded("sort_dir".into(), "asc".into()),
            Matcher::UrlEncoded("count".into(), "2".into()),
            Matcher::UrlEncoded("offset".into(), offset.to_string()),
        ])
    }

    #[tokio::test]
    async fn test_listing_follows_pages_until_short_page() {
        let mut server = mockito::Server::new_async().await;
        let path = format!("/{}", SERVICE_PATH);
        let first = server
            .mock("GET", path.as_str())
            .match_query(page_matcher(0))
            .with_body(services(0..2))
            .create_async()
            .await;
        let second = server
            .mock("GET", path.as_str())
            .match_query(page_matcher(2))
            .with_body(services(2..3))
            .create_async()
            .await;

        let store = HttpObjectStore::new(Arc::new(test_client(&server))).with_page_size(2);
        let keys: Vec<String> = store
            .list_services(None)
            .map_ok(|s| s.key().to_string())
            .try_collect()
            .await
            .unwrap();

        assert_eq!(keys, vec!["svc0", "svc1", "svc2"]);
        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn test_listing_sends_filter() {
        let mut server = mockito::Server::new_async().await;
        let filter = ServiceFilter::Keys(vec!["svc1".to_string()]);
        let mock = server
            .mock("GET", format!("/{}", SERVICE_PATH).as_str())
            .match_query(Matcher::UrlEncoded(
                "filter".into(),
                r#"{"$or":[{"_key":"svc1"}]}"#.into(),
            ))
            .with_body(services(1..2))
            .create_async()
            .await;

        let store = HttpObjectStore::new(Arc::new(test_client(&server)));
        let listed: Vec<_> = store
            .list_services(Some(filter))
            .try_collect()
            .await
            .unwrap();

        assert_eq!(listed.len(), 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_listing_failure_surfaces_as_store_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", format!("/{}", SERVICE_PATH).as_str())
            .match_query(Matcher::Any)
            .with_status(403)
            .create_async()
            .await;

        let store = HttpObjectStore::new(Arc::new(test_client(&server)));
        let result: Result<Vec<_>> = store.list_services(None).try_collect().await;

        assert!(matches!(result, Err(ThresholdError::Store(_))));
    }

    /// Mock whose body arrives long after the client gives up
    async fn stalled(server: &mut Server, method: &str, path: &str, body: &'static str) -> Mock {
        server
            .mock(method, path)
            .match_query(Matcher::Any)
            .with_chunked_body(move |w| {
                std::thread::sleep(Duration::from_millis(500));
                w.write_all(body.as_bytes())
            })
            .create_async()
            .await
    }

    #[tokio::test]
    async fn test_stalled_listing_times_out() {
        let mut server = Server::new_async().await;
        stalled(&mut server, "GET", &format!("/{}", SERVICE_PATH), "[]").await;

        let client = test_client_with_timeout(&server, Duration::from_millis(50));
        let store = HttpObjectStore::new(Arc::new(client));
        let result: Result<Vec<_>> = store.list_services(None).try_collect().await;

        assert!(matches!(result, Err(ThresholdError::Store(_))));
    }

    #[tokio::test]
    async fn test_stalled_update_times_out() {
        let mut server = Server::new_async().await;
        stalled(&mut server, "POST", &format!("/{}/svc1", SERVICE_PATH), "{}").await;

        let client = test_client_with_timeout(&server, Duration::from_millis(50));
        let store = HttpObjectStore::new(Arc::new(client));
        let document = json!({ "_key": "svc1" }).as_object().cloned().unwrap();

        let err = store.update_service("svc1", &document).await.unwrap_err();
        assert!(matches!(err, ThresholdError::Store(_)));
    }

    #[tokio::test]
    async fn test_update_posts_full_document() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", format!("/{}/svc1", SERVICE_PATH).as_str())
            .match_query(Matcher::UrlEncoded("is_partial_data".into(), "0".into()))
            .match_body(Matcher::Json(json!({ "_key": "svc1", "title": "Web" })))
            .with_body(r#"{"_key":"svc1"}"#)
            .create_async()
            .await;

        let store = HttpObjectStore::new(Arc::new(test_client(&server)));
        let document = json!({ "_key": "svc1", "title": "Web" })
            .as_object()
            .cloned()
            .unwrap();

        store.update_service("svc1", &document).await.unwrap();
        mock.assert_async().await;
    }
}
