//! Search execution over the export endpoint

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use threshold_lib::{Result, SearchClient, SearchRequest, SearchRow, ThresholdError};
use tracing::{debug, warn};

use crate::client::RestClient;

const NO_RESULTS: &str = "search returned no results";
const INCOMPLETE_RESULTS: &str = "search returned incomplete results";

/// One line of the JSON-lines export stream
#[derive(Debug, Deserialize)]
struct ExportLine {
    #[serde(default)]
    result: SearchRow,
    #[serde(default)]
    lastrow: bool,
}

pub struct HttpSearchClient {
    client: Arc<RestClient>,
}

impl HttpSearchClient {
    pub fn new(client: Arc<RestClient>) -> Self {
        Self { client }
    }
}

/// Queries not starting with a pipe get an explicit `search` command
pub fn normalize_query(query: &str) -> String {
    let trimmed = query.trim_start();
    if trimmed.starts_with('|') {
        trimmed.to_string()
    } else {
        format!("search {}", trimmed)
    }
}

/// Parse an export body and apply the empty and partial result rules
pub fn parse_export(body: &str, request: &SearchRequest) -> Result<Vec<SearchRow>> {
    let mut lines = Vec::new();
    for line in body.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let parsed: ExportLine = serde_json::from_str(line)
            .map_err(|e| ThresholdError::Search(format!("malformed export line: {}", e)))?;
        lines.push(parsed);
    }

    match lines.last() {
        None if request.allow_empty => warn!("{}", NO_RESULTS),
        None => return Err(ThresholdError::Search(NO_RESULTS.to_string())),
        Some(last) if !last.lastrow && request.allow_partial => warn!("{}", INCOMPLETE_RESULTS),
        Some(last) if !last.lastrow => {
            return Err(ThresholdError::Search(INCOMPLETE_RESULTS.to_string()))
        }
        Some(_) => {}
    }

    Ok(lines.into_iter().map(|l| l.result).collect())
}

#[async_trait]
impl SearchClient for HttpSearchClient {
    async fn execute(&self, request: &SearchRequest) -> Result<Vec<SearchRow>> {
        let path = format!(
            "servicesNS/{}/{}/search/jobs/export",
            request.user, request.app
        );
        let url = self
            .client
            .url(&path)
            .map_err(|e| ThresholdError::Search(e.to_string()))?;

        let form = [
            ("search", normalize_query(&request.query)),
            ("output_mode", "json".to_string()),
            ("preview", "false".to_string()),
            ("earliest_time", request.earliest_time.clone()),
            ("latest_time", request.latest_time.clone()),
            ("allow_partial_results", request.allow_partial.to_string()),
        ];

        let response = self
            .client
            .send(|http| http.post(url.clone()).timeout(request.timeout).form(&form))
            .await
            .map_err(|e| ThresholdError::Search(e.to_string()))?;
        let body = response
            .text()
            .await
            .map_err(|e| ThresholdError::Search(e.to_string()))?;

        let rows = parse_export(&body, request)?;
        debug!(rows = rows.len(), earliest_time = %request.earliest_time, "Search completed");
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::test_client;
    use mockito::Matcher;
    use serde_json::json;
    use std::time::Duration;

    fn request(allow_empty: bool, allow_partial: bool) -> SearchRequest {
        SearchRequest {
            query: "| mstats avg(alert_value) WHERE index=itsi_summary_metrics".to_string(),
            earliest_time: "1700000000".to_string(),
            latest_time: "1700604800".to_string(),
            app: "itsi".to_string(),
            user: "nobody".to_string(),
            timeout: Duration::from_secs(5),
            allow_empty,
            allow_partial,
        }
    }

    #[test]
    fn test_normalize_query() {
        assert_eq!(normalize_query("index=main"), "search index=main");
        assert_eq!(normalize_query("  | makeresults"), "| makeresults");
    }

    #[test]
    fn test_parse_export_rows() {
        let body = concat!(
            r#"{"preview":false,"offset":0,"result":{"itsi_kpi_id":"k1"}}"#,
            "\n\n",
            r#"{"preview":false,"offset":1,"result":{"itsi_kpi_id":"k2"},"lastrow":true}"#,
            "\n"
        );

        let rows = parse_export(body, &request(false, false)).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["itsi_kpi_id"], json!("k2"));
    }

    #[test]
    fn test_empty_results() {
        assert!(matches!(
            parse_export("", &request(false, false)),
            Err(ThresholdError::Search(_))
        ));
        assert!(parse_export("\n", &request(true, false)).unwrap().is_empty());
    }

    #[test]
    fn test_partial_results() {
        let body = r#"{"preview":false,"offset":0,"result":{"a":"1"}}"#;

        let err = parse_export(body, &request(false, false)).unwrap_err();
        assert!(err.to_string().contains("incomplete"));
        assert_eq!(parse_export(body, &request(false, true)).unwrap().len(), 1);
    }

    #[test]
    fn test_malformed_line() {
        assert!(parse_export("not json", &request(true, true)).is_err());
    }

    #[tokio::test]
    async fn test_execute_posts_export_form() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/servicesNS/nobody/itsi/search/jobs/export")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded(
                    "search".into(),
                    "| mstats avg(alert_value) WHERE index=itsi_summary_metrics".into(),
                ),
                Matcher::UrlEncoded("output_mode".into(), "json".into()),
                Matcher::UrlEncoded("preview".into(), "false".into()),
                Matcher::UrlEncoded("earliest_time".into(), "1700000000".into()),
                Matcher::UrlEncoded("latest_time".into(), "1700604800".into()),
                Matcher::UrlEncoded("allow_partial_results".into(), "false".into()),
            ]))
            .with_body(r#"{"result":{"itsi_kpi_id":"k1"},"lastrow":true}"#)
            .create_async()
            .await;

        let client = HttpSearchClient::new(Arc::new(test_client(&server)));
        let rows = client.execute(&request(false, false)).await.unwrap();

        assert_eq!(rows.len(), 1);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_execute_maps_http_failure_to_search_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/servicesNS/nobody/itsi/search/jobs/export")
            .with_status(400)
            .with_body("bad search")
            .create_async()
            .await;

        let client = HttpSearchClient::new(Arc::new(test_client(&server)));
        let err = client.execute(&request(false, false)).await.unwrap_err();

        assert!(matches!(err, ThresholdError::Search(ref m) if m.contains("bad search")));
    }
}
