//! Qase REST API client.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use super::error::{QaseError, error_message};
use crate::http::reqwest_transport::ReqwestTransport;
use crate::http::{HttpRequest, HttpTransport};
use crate::service::{
    AttachmentData, AttachmentRef, DestinationField, DestinationService, DestinationUser,
    EntityKind, ServiceError,
};

/// Default API base URL.
pub const QASE_API_URL: &str = "https://api.qase.io/v1";

/// Records per page for listing calls.
const PAGE_LIMIT: usize = 100;

/// Send `request` and return the JSON body of a successful response.
pub(crate) async fn send_json(
    transport: &dyn HttpTransport,
    request: HttpRequest,
) -> Result<Value, QaseError> {
    let response = transport
        .send(request)
        .await
        .map_err(|e| QaseError::Http(e.to_string()))?;

    if response.status == 429 {
        let retry_after = response
            .header("retry-after")
            .and_then(|v| v.trim().parse().ok());
        return Err(QaseError::RateLimited { retry_after });
    }
    if !response.is_success() {
        return Err(QaseError::Api {
            status: response.status,
            message: error_message(&response.body),
        });
    }
    if response.body.is_empty() {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_slice(&response.body)?)
}

/// Qase API client.
#[derive(Clone)]
pub struct QaseClient {
    transport: Arc<dyn HttpTransport>,
    base_url: String,
    token: String,
}

impl QaseClient {
    /// Create a client against `base_url` (usually [`QASE_API_URL`]).
    pub fn new(base_url: &str, token: &str) -> Result<Self, QaseError> {
        if token.trim().is_empty() {
            return Err(QaseError::Config("API token is empty".to_string()));
        }
        let transport = ReqwestTransport::with_timeout(StdDuration::from_secs(60))
            .map_err(|e| QaseError::Config(e.to_string()))?;
        Ok(Self::new_with_transport(base_url, token, Arc::new(transport)))
    }

    pub fn new_with_transport(base_url: &str, token: &str, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn get(&self, path: &str) -> Result<Value, QaseError> {
        let request = HttpRequest::get(self.url(path))
            .header("Token", &self.token)
            .header("Accept", "application/json");
        send_json(self.transport.as_ref(), request).await
    }

    async fn post(&self, path: &str, payload: &Value) -> Result<Value, QaseError> {
        let request = HttpRequest::post(self.url(path))
            .header("Token", &self.token)
            .header("Accept", "application/json")
            .json(payload);
        send_json(self.transport.as_ref(), request).await
    }

    /// Every entity of a paginated listing.
    async fn list_all(&self, path: &str) -> Result<Vec<Value>, QaseError> {
        let mut entities = Vec::new();
        let mut offset = 0;

        loop {
            let body = self
                .get(&format!("{path}?limit={PAGE_LIMIT}&offset={offset}"))
                .await?;
            let page = match body.pointer("/result/entities") {
                Some(Value::Array(items)) => items.clone(),
                _ => Vec::new(),
            };
            let total = body
                .pointer("/result/total")
                .and_then(Value::as_u64)
                .map(|t| t as usize);

            let count = page.len();
            entities.extend(page);
            offset += count;

            if count == 0 || count < PAGE_LIMIT || total.is_some_and(|t| offset >= t) {
                return Ok(entities);
            }
        }
    }

    fn result_field<'a>(body: &'a Value, field: &str) -> Result<&'a Value, QaseError> {
        body.get("result")
            .and_then(|r| r.get(field))
            .ok_or_else(|| QaseError::UnexpectedResponse(format!("missing result.{field}")))
    }

    /// Creation endpoint for a numerically identified entity.
    fn create_path(kind: EntityKind, project: Option<&str>) -> Result<String, QaseError> {
        let project = || {
            project.ok_or_else(|| QaseError::Config(format!("creating {kind} requires a project")))
        };
        Ok(match kind {
            EntityKind::CustomField => "/custom_field".to_string(),
            EntityKind::ConfigurationGroup => format!("/configuration/{}/group", project()?),
            EntityKind::Configuration => format!("/configuration/{}", project()?),
            EntityKind::Milestone => format!("/milestone/{}", project()?),
            EntityKind::Suite => format!("/suite/{}", project()?),
            EntityKind::Case => format!("/case/{}", project()?),
            EntityKind::Run => format!("/run/{}", project()?),
            other => return Err(QaseError::Unsupported(other.to_string())),
        })
    }
}

/// Build a single-file `multipart/form-data` body.
///
/// Returns the content type (with boundary) and the encoded body.
pub(crate) fn multipart_file(field: &str, attachment: &AttachmentData) -> (String, Vec<u8>) {
    let boundary = format!("caseport-{}", Uuid::new_v4().simple());
    let filename = attachment.filename.replace(['"', '\r', '\n'], "_");
    let content_type = attachment
        .content_type
        .as_deref()
        .unwrap_or("application/octet-stream");

    let mut body = Vec::with_capacity(attachment.bytes.len() + 256);
    body.extend_from_slice(
        format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: {content_type}\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(&attachment.bytes);
    body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

    (format!("multipart/form-data; boundary={boundary}"), body)
}

#[async_trait]
impl DestinationService for QaseClient {
    async fn list_users(&self) -> Result<Vec<DestinationUser>, ServiceError> {
        let users = self.list_all("/user").await?;
        Ok(users
            .iter()
            .filter_map(|u| {
                Some(DestinationUser {
                    id: u.get("id")?.as_u64()?,
                    email: u.get("email").and_then(Value::as_str).map(str::to_string),
                    name: u.get("name").and_then(Value::as_str).map(str::to_string),
                })
            })
            .collect())
    }

    async fn list_project_codes(&self) -> Result<Vec<String>, ServiceError> {
        let projects = self.list_all("/project").await?;
        Ok(projects
            .iter()
            .filter_map(|p| p.get("code").and_then(Value::as_str).map(str::to_string))
            .collect())
    }

    async fn list_custom_fields(&self) -> Result<Vec<DestinationField>, ServiceError> {
        let fields = self.list_all("/custom_field").await?;
        Ok(fields
            .iter()
            .filter_map(|f| {
                Some(DestinationField {
                    id: f.get("id")?.as_u64()?,
                    title: f.get("title")?.as_str()?.to_string(),
                })
            })
            .collect())
    }

    async fn create_project(&self, payload: &Value) -> Result<String, ServiceError> {
        let body = self.post("/project", payload).await?;
        let code = Self::result_field(&body, "code")?
            .as_str()
            .ok_or_else(|| QaseError::UnexpectedResponse("result.code is not a string".into()))?;
        Ok(code.to_string())
    }

    async fn create_entity(
        &self,
        kind: EntityKind,
        project: Option<&str>,
        payload: &Value,
    ) -> Result<u64, ServiceError> {
        let path = Self::create_path(kind, project)?;
        let body = self.post(&path, payload).await?;
        let id = Self::result_field(&body, "id")?
            .as_u64()
            .ok_or_else(|| QaseError::UnexpectedResponse("result.id is not a number".into()))?;
        tracing::trace!(kind = %kind, project, id, "Created entity");
        Ok(id)
    }

    async fn create_shared_step(&self, project: &str, payload: &Value) -> Result<String, ServiceError> {
        let body = self.post(&format!("/shared_step/{project}"), payload).await?;
        let hash = Self::result_field(&body, "hash")?
            .as_str()
            .ok_or_else(|| QaseError::UnexpectedResponse("result.hash is not a string".into()))?;
        Ok(hash.to_string())
    }

    async fn upload_attachment(
        &self,
        project: &str,
        attachment: AttachmentData,
    ) -> Result<AttachmentRef, ServiceError> {
        let (content_type, body) = multipart_file("file", &attachment);
        let request = HttpRequest::post(self.url(&format!("/attachment/{project}")))
            .header("Token", &self.token)
            .header("Accept", "application/json")
            .body(content_type, body);
        let response = send_json(self.transport.as_ref(), request).await?;

        let uploaded = response
            .get("result")
            .and_then(Value::as_array)
            .and_then(|items| items.first())
            .ok_or_else(|| QaseError::UnexpectedResponse("empty attachment result".into()))?;
        let hash = uploaded
            .get("hash")
            .and_then(Value::as_str)
            .ok_or_else(|| QaseError::UnexpectedResponse("attachment without hash".into()))?;

        Ok(AttachmentRef {
            hash: hash.to_string(),
            url: uploaded.get("url").and_then(Value::as_str).map(str::to_string),
            filename: uploaded
                .get("filename")
                .and_then(Value::as_str)
                .map(str::to_string)
                .or(Some(attachment.filename)),
            attached_to: None,
        })
    }
}
