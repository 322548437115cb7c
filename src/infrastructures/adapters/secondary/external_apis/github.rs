use crate::domain::external_apis::github::{DeleteOutcome, GitHubApi, Repository};
use crate::domain::models::run::{PageCursor, WorkflowRun, WorkflowRunsPage};
use anyhow::{Context, Error};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, LINK, USER_AGENT};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;

const USER_AGENT_VALUE: &str = "gha-run-purger";

#[derive(Deserialize, Debug, Clone)]
struct GitHubWorkflowRunResponse {
    id: u64,
    created_at: String, // e.g. "2024-05-01T12:00:00Z"
}

// /actions/runs wraps the list in an object keyed by workflow_runs.
#[derive(Deserialize, Debug)]
struct GitHubWorkflowRunsApiResponse {
    workflow_runs: Vec<GitHubWorkflowRunResponse>,
}

pub struct GitHubApiAdapter {
    client: Client,
    base_url: String,
    github_token: String,
    per_page: Option<u8>,
}

impl GitHubApiAdapter {
    pub fn new(base_url: String, github_token: String) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            github_token,
            per_page: None,
        }
    }

    /// Replaces the default client, e.g. with one that carries a timeout.
    #[must_use]
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// Page size requested on the first page. Later pages reuse whatever the
    /// server put into its `next` link.
    #[must_use]
    pub fn with_per_page(mut self, per_page: Option<u8>) -> Self {
        self.per_page = per_page;
        self
    }

    fn runs_url(&self, repository: &Repository) -> String {
        format!(
            "{}/repos/{}/{}/actions/runs",
            self.base_url, repository.owner, repository.name
        )
    }

    fn first_page_url(&self, repository: &Repository) -> String {
        match self.per_page {
            Some(per_page) => format!("{}?per_page={per_page}", self.runs_url(repository)),
            None => self.runs_url(repository),
        }
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header(AUTHORIZATION, format!("Bearer {}", self.github_token))
            .header(ACCEPT, "application/vnd.github+json")
            .header(USER_AGENT, USER_AGENT_VALUE)
    }
}

/// Picks the `rel="next"` target out of an RFC 8288 `Link` header value.
fn next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|link| {
        let mut segments = link.split(';');
        let target = segments
            .next()?
            .trim()
            .strip_prefix('<')?
            .strip_suffix('>')?;
        let is_next = segments
            .filter_map(|param| param.trim().strip_prefix("rel="))
            .any(|rel| {
                rel.trim_matches('"')
                    .split_whitespace()
                    .any(|relation| relation.eq_ignore_ascii_case("next"))
            });
        is_next.then(|| target.to_string())
    })
}

/// Follows the first `Link` value that carries a `next` relation. Values that
/// are not valid UTF-8 are skipped with a warning.
fn next_page_url(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(LINK)
        .iter()
        .filter_map(|value| match value.to_str() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!("Ignoring Link header that is not valid UTF-8: {e}");
                None
            }
        })
        .find_map(next_link)
}

impl TryFrom<GitHubWorkflowRunResponse> for WorkflowRun {
    type Error = Error;

    fn try_from(run_res: GitHubWorkflowRunResponse) -> Result<Self, Self::Error> {
        let created_at = chrono::DateTime::parse_from_rfc3339(&run_res.created_at)
            .with_context(|| format!("Failed to parse created_at for run {}", run_res.id))?
            .with_timezone(&chrono::Utc);
        Ok(WorkflowRun {
            id: run_res.id,
            created_at,
        })
    }
}

#[async_trait]
impl GitHubApi for GitHubApiAdapter {
    #[tracing::instrument(name = "GitHubApiAdapter::fetch_workflow_runs_page", skip(self))]
    async fn fetch_workflow_runs_page(
        &self,
        repository: &Repository,
        cursor: &PageCursor,
    ) -> Result<WorkflowRunsPage, Error> {
        let url = match cursor {
            PageCursor::First => self.first_page_url(repository),
            PageCursor::Next(url) => url.clone(),
        };

        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .with_context(|| format!("Failed to send request to {url}"))?;

        let status = response.status();
        if status != StatusCode::OK {
            anyhow::bail!(
                "Failed to fetch runs from {url}. Status code: {}",
                status.as_u16()
            );
        }

        let next = next_page_url(response.headers());

        let api_response: GitHubWorkflowRunsApiResponse = response
            .json()
            .await
            .with_context(|| format!("Failed to deserialize runs from {url}"))?;

        let runs = api_response
            .workflow_runs
            .into_iter()
            .map(WorkflowRun::try_from)
            .collect::<Result<Vec<WorkflowRun>, Error>>()?;

        Ok(WorkflowRunsPage { runs, next })
    }

    #[tracing::instrument(name = "GitHubApiAdapter::delete_workflow_run", skip(self))]
    async fn delete_workflow_run(
        &self,
        repository: &Repository,
        run_id: u64,
    ) -> Result<DeleteOutcome, Error> {
        let url = format!("{}/{run_id}", self.runs_url(repository));

        let response = self
            .authorized(self.client.delete(&url))
            .send()
            .await
            .with_context(|| format!("Failed to send request to {url}"))?;

        Ok(match response.status() {
            StatusCode::NO_CONTENT => DeleteOutcome::Deleted,
            status => DeleteOutcome::Rejected {
                status: status.as_u16(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use reqwest::header::HeaderValue;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const TOKEN: &str = "test-token";

    fn repository() -> Repository {
        Repository {
            owner: "octo".to_string(),
            name: "hello".to_string(),
        }
    }

    fn runs_body() -> serde_json::Value {
        json!({
            "total_count": 2,
            "workflow_runs": [
                { "id": 11, "name": "CI", "status": "completed", "created_at": "2024-04-01T08:30:00Z" },
                { "id": 12, "name": "CI", "status": "in_progress", "created_at": "2024-04-30T23:59:59Z" }
            ]
        })
    }

    #[test]
    fn test_next_link_picks_next_relation() {
        let header = r#"<https://api.github.com/repositories/1/actions/runs?page=2>; rel="next", <https://api.github.com/repositories/1/actions/runs?page=9>; rel="last""#;
        assert_eq!(
            next_link(header).as_deref(),
            Some("https://api.github.com/repositories/1/actions/runs?page=2")
        );
    }

    #[test]
    fn test_next_link_absent_on_last_page() {
        let header = r#"<https://api.github.com/x?page=1>; rel="first", <https://api.github.com/x?page=8>; rel="prev""#;
        assert_eq!(next_link(header), None);
    }

    #[test]
    fn test_next_link_accepts_unquoted_and_multi_value_rel() {
        assert_eq!(
            next_link("<https://a/b?page=3>; rel=next").as_deref(),
            Some("https://a/b?page=3")
        );
        assert_eq!(
            next_link(r#"<https://a/b?page=4>; title="x"; rel="last next""#).as_deref(),
            Some("https://a/b?page=4")
        );
        assert_eq!(next_link("garbage; rel=next"), None);
    }

    #[test]
    fn test_non_utf8_link_value_is_skipped_not_treated_as_last_page() {
        let mut headers = HeaderMap::new();
        headers.append(
            LINK,
            HeaderValue::from_bytes(b"<https://a/b?page=\xff>; rel=\"next\"").unwrap(),
        );
        headers.append(
            LINK,
            HeaderValue::from_static(r#"<https://a/b?page=2>; rel="next""#),
        );

        assert_eq!(next_page_url(&headers).as_deref(), Some("https://a/b?page=2"));
    }

    #[test]
    fn test_only_non_utf8_link_value_yields_no_next_page() {
        let mut headers = HeaderMap::new();
        headers.insert(
            LINK,
            HeaderValue::from_bytes(b"<https://a/\xfe>; rel=\"next\"").unwrap(),
        );

        assert_eq!(next_page_url(&headers), None);
    }

    #[tokio::test]
    async fn test_fetch_first_page_parses_runs_and_next_link() {
        let mock_server = MockServer::start().await;
        let next_url = format!("{}/repositories/1/actions/runs?page=2", mock_server.uri());

        Mock::given(method("GET"))
            .and(path("/repos/octo/hello/actions/runs"))
            .and(header("Authorization", "Bearer test-token"))
            .and(header("Accept", "application/vnd.github+json"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Link", format!(r#"<{next_url}>; rel="next""#).as_str())
                    .set_body_json(runs_body()),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let adapter = GitHubApiAdapter::new(mock_server.uri(), TOKEN.to_string());
        let page = adapter
            .fetch_workflow_runs_page(&repository(), &PageCursor::First)
            .await
            .unwrap();

        assert_eq!(page.next, Some(next_url));
        assert_eq!(
            page.runs,
            vec![
                WorkflowRun {
                    id: 11,
                    created_at: Utc.with_ymd_and_hms(2024, 4, 1, 8, 30, 0).unwrap(),
                },
                WorkflowRun {
                    id: 12,
                    created_at: Utc.with_ymd_and_hms(2024, 4, 30, 23, 59, 59).unwrap(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_fetch_next_cursor_uses_url_verbatim() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/repositories/1/actions/runs"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "workflow_runs": [] })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let adapter = GitHubApiAdapter::new(mock_server.uri(), TOKEN.to_string());
        let cursor = PageCursor::Next(format!(
            "{}/repositories/1/actions/runs?page=2",
            mock_server.uri()
        ));
        let page = adapter
            .fetch_workflow_runs_page(&repository(), &cursor)
            .await
            .unwrap();

        assert!(page.runs.is_empty());
        assert_eq!(page.next, None);
    }

    #[tokio::test]
    async fn test_per_page_is_sent_on_first_page() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/repos/octo/hello/actions/runs"))
            .and(query_param("per_page", "100"))
            .respond_with(ResponseTemplate::new(200).set_body_json(runs_body()))
            .expect(1)
            .mount(&mock_server)
            .await;

        let adapter =
            GitHubApiAdapter::new(format!("{}/", mock_server.uri()), TOKEN.to_string())
                .with_per_page(Some(100));
        let page = adapter
            .fetch_workflow_runs_page(&repository(), &PageCursor::First)
            .await
            .unwrap();

        assert_eq!(page.runs.len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_unauthorized_reports_status_code() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/repos/octo/hello/actions/runs"))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "message": "Bad credentials"
            })))
            .mount(&mock_server)
            .await;

        let adapter = GitHubApiAdapter::new(mock_server.uri(), TOKEN.to_string());
        let err = adapter
            .fetch_workflow_runs_page(&repository(), &PageCursor::First)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("Status code: 401"), "{err}");
    }

    #[tokio::test]
    async fn test_fetch_rejects_unparsable_created_at() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/repos/octo/hello/actions/runs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "workflow_runs": [ { "id": 5, "created_at": "yesterday" } ]
            })))
            .mount(&mock_server)
            .await;

        let adapter = GitHubApiAdapter::new(mock_server.uri(), TOKEN.to_string());
        let err = adapter
            .fetch_workflow_runs_page(&repository(), &PageCursor::First)
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains("created_at for run 5"), "{err:#}");
    }

    #[tokio::test]
    async fn test_delete_no_content_is_deleted() {
        let mock_server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/repos/octo/hello/actions/runs/42"))
            .and(header("Authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock_server)
            .await;

        let adapter = GitHubApiAdapter::new(mock_server.uri(), TOKEN.to_string());
        let outcome = adapter
            .delete_workflow_run(&repository(), 42)
            .await
            .unwrap();

        assert_eq!(outcome, DeleteOutcome::Deleted);
    }

    #[tokio::test]
    async fn test_delete_missing_run_is_rejected_with_status() {
        let mock_server = MockServer::start().await;

        Mock::given(method("DELETE"))
            .and(path("/repos/octo/hello/actions/runs/42"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&mock_server)
            .await;

        let adapter = GitHubApiAdapter::new(mock_server.uri(), TOKEN.to_string());
        let outcome = adapter
            .delete_workflow_run(&repository(), 42)
            .await
            .unwrap();

        assert_eq!(outcome, DeleteOutcome::Rejected { status: 404 });
    }
}
