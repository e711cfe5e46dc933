//! TestRail API client.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::Value;

use super::error::{TestRailError, error_message};
use crate::http::reqwest_transport::ReqwestTransport;
use crate::http::{HttpRequest, HttpResponse, HttpTransport};
use crate::service::{
    AttachmentData, EntityKind, EntityRecord, ListFilter, Page, ServiceError, SourceService,
};

/// Records per page requested from paginated endpoints.
pub const PAGE_LIMIT: usize = 250;

/// TestRail API client.
///
/// Authenticates with basic auth (user plus API key) against
/// `<host>/index.php?/api/v2/`.
#[derive(Clone)]
pub struct TestRailClient {
    transport: Arc<dyn HttpTransport>,
    host: String,
    authorization: String,
}

impl TestRailClient {
    /// Create a client for `host`, e.g. `https://example.testrail.io`.
    pub fn new(host: &str, user: &str, api_key: &str) -> Result<Self, TestRailError> {
        if host.trim().is_empty() {
            return Err(TestRailError::Config("host is empty".to_string()));
        }
        let transport = ReqwestTransport::with_timeout(StdDuration::from_secs(60))
            .map_err(|e| TestRailError::Config(e.to_string()))?;
        Ok(Self::new_with_transport(host, user, api_key, Arc::new(transport)))
    }

    pub fn new_with_transport(
        host: &str,
        user: &str,
        api_key: &str,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        let credentials = STANDARD.encode(format!("{user}:{api_key}"));
        Self {
            transport,
            host: host.trim_end_matches('/').to_string(),
            authorization: format!("Basic {credentials}"),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn api_url(&self, endpoint: &str) -> String {
        format!("{}/index.php?/api/v2/{endpoint}", self.host)
    }

    async fn send(&self, url: String) -> Result<HttpResponse, TestRailError> {
        let request = HttpRequest::get(url)
            .header("Authorization", &self.authorization)
            .header("Accept", "application/json");

        let response = self
            .transport
            .send(request)
            .await
            .map_err(|e| TestRailError::Http(e.to_string()))?;

        if response.status == 429 {
            let retry_after = response
                .header("retry-after")
                .and_then(|v| v.trim().parse().ok());
            return Err(TestRailError::RateLimited { retry_after });
        }
        if !response.is_success() {
            return Err(TestRailError::Api {
                status: response.status,
                message: error_message(&response.body),
            });
        }
        Ok(response)
    }

    /// Endpoint and response collection key for a listing.
    ///
    /// Older TestRail versions return bare arrays for every endpoint; the key
    /// is used when the response is an object.
    fn endpoint(kind: EntityKind, filter: &ListFilter) -> Result<(String, &'static str), TestRailError> {
        let project = || {
            filter.project_id.ok_or_else(|| {
                TestRailError::Config(format!("listing {kind} requires a project id"))
            })
        };
        let suite = filter
            .suite_id
            .map(|id| format!("&suite_id={id}"))
            .unwrap_or_default();

        let endpoint = match kind {
            EntityKind::User => match filter.project_id {
                Some(id) => (format!("get_users/{id}"), "users"),
                None => ("get_users".to_string(), "users"),
            },
            EntityKind::Project => ("get_projects".to_string(), "projects"),
            EntityKind::Suite => (format!("get_suites/{}", project()?), "suites"),
            EntityKind::Attachment => (
                format!("get_attachments_for_project/{}", project()?),
                "attachments",
            ),
            EntityKind::CustomField => ("get_case_fields".to_string(), "case_fields"),
            EntityKind::ConfigurationGroup => (format!("get_configs/{}", project()?), "configs"),
            EntityKind::Milestone => (format!("get_milestones/{}", project()?), "milestones"),
            EntityKind::Section => (format!("get_sections/{}{suite}", project()?), "sections"),
            EntityKind::SharedStep => (
                format!("get_shared_steps/{}", project()?),
                "shared_steps",
            ),
            EntityKind::Case => (format!("get_cases/{}{suite}", project()?), "cases"),
            EntityKind::Run => (format!("get_runs/{}", project()?), "runs"),
            EntityKind::Test => {
                let run = filter.run_id.ok_or_else(|| {
                    TestRailError::Config("listing tests requires a run id".to_string())
                })?;
                (format!("get_tests/{run}"), "tests")
            }
            EntityKind::Configuration => {
                return Err(TestRailError::Unsupported(
                    "configurations are listed through their groups".to_string(),
                ));
            }
        };
        Ok(endpoint)
    }
}

/// Offset of the next page from a `_links.next` URL, if any.
fn next_offset(body: &Value) -> Option<usize> {
    let next = body.pointer("/_links/next")?.as_str()?;
    next.split('&')
        .find_map(|part| part.strip_prefix("offset="))
        .and_then(|v| v.parse().ok())
}

/// Parse a listing response, bare array or paginated object.
pub(crate) fn parse_page(body: Value, key: &str, offset: usize) -> Page {
    let next = next_offset(&body);
    let items = match body {
        Value::Array(items) => items,
        Value::Object(mut object) => match object.remove(key) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };

    let count = items.len();
    let records = items
        .into_iter()
        .filter_map(|item| {
            let record = EntityRecord::from_value(item);
            if record.is_none() {
                tracing::debug!(key, "Dropping record without a numeric id");
            }
            record
        })
        .collect();

    Page {
        items: records,
        next_offset: next.filter(|&n| n > offset && count > 0),
    }
}

/// Filename from a `Content-Disposition` header.
fn disposition_filename(header: &str) -> Option<String> {
    header.split(';').find_map(|part| {
        let value = part.trim().strip_prefix("filename=")?;
        let name = value.trim_matches('"');
        (!name.is_empty()).then(|| name.to_string())
    })
}

#[async_trait]
impl SourceService for TestRailClient {
    async fn list_page(
        &self,
        kind: EntityKind,
        filter: &ListFilter,
        offset: usize,
    ) -> Result<Page, ServiceError> {
        let (endpoint, key) = Self::endpoint(kind, filter)?;
        let url = format!(
            "{}&limit={PAGE_LIMIT}&offset={offset}",
            self.api_url(&endpoint)
        );
        let response = self.send(url).await?;
        let body: Value = serde_json::from_slice(&response.body).map_err(TestRailError::Json)?;
        Ok(parse_page(body, key, offset))
    }

    async fn fetch_attachment(&self, id: u64) -> Result<AttachmentData, ServiceError> {
        let response = self.send(self.api_url(&format!("get_attachment/{id}"))).await?;
        let filename = response
            .header("content-disposition")
            .and_then(disposition_filename)
            .unwrap_or_else(|| format!("attachment-{id}"));
        Ok(AttachmentData {
            filename,
            content_type: response.header("content-type").map(str::to_string),
            bytes: response.body,
        })
    }
}
