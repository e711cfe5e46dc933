//! User provisioning through the Qase SCIM endpoint.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::client::send_json;
use super::error::QaseError;
use crate::http::reqwest_transport::ReqwestTransport;
use crate::http::{HttpRequest, HttpTransport};
use crate::service::{ServiceError, UserProvisioner};

/// Default SCIM base URL.
pub const QASE_SCIM_URL: &str = "https://app.qase.io/scim/v2";

const USER_SCHEMA: &str = "urn:ietf:params:scim:schemas:core:2.0:User";

/// Creates Qase accounts for source users with no destination match.
#[derive(Clone)]
pub struct QaseScimClient {
    transport: Arc<dyn HttpTransport>,
    base_url: String,
    token: String,
}

impl QaseScimClient {
    pub fn new(base_url: &str, token: &str) -> Result<Self, QaseError> {
        if token.trim().is_empty() {
            return Err(QaseError::Config("SCIM token is empty".to_string()));
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
}

/// SCIM user resource for a source user (`{email, name}`).
pub(crate) fn scim_user(payload: &Value) -> Option<Value> {
    let email = payload.get("email")?.as_str()?.trim();
    if email.is_empty() {
        return None;
    }
    let name = payload
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .unwrap_or(email);
    let (given, family) = match name.split_once(' ') {
        Some((given, family)) => (given, family.trim()),
        None => (name, ""),
    };

    Some(json!({
        "schemas": [USER_SCHEMA],
        "userName": email,
        "name": {"givenName": given, "familyName": family},
        "emails": [{"value": email, "primary": true}],
        "active": true,
    }))
}

#[async_trait]
impl UserProvisioner for QaseScimClient {
    async fn create_user(&self, payload: &Value) -> Result<Option<u64>, ServiceError> {
        let Some(resource) = scim_user(payload) else {
            return Err(ServiceError::validation("user has no email address"));
        };

        let request = HttpRequest::post(format!("{}/Users", self.base_url))
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/scim+json")
            .json(&resource);
        let body = send_json(self.transport.as_ref(), request).await?;

        let id = match body.get("id") {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        };
        match id {
            Some(id) => Ok(Some(id)),
            None => Err(QaseError::UnexpectedResponse("SCIM user without numeric id".into()).into()),
        }
    }
}
