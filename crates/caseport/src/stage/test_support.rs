//! In-memory services for stage unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use crate::mapping::{Mappings, ProjectMapping};
use crate::migrate::{MigrationContext, MigrationOptions};
use crate::pool::{PoolConfig, Pools};
use crate::service::{
    AttachmentData, AttachmentRef, DestinationField, DestinationService, DestinationUser,
    EntityKind, EntityRecord, ListFilter, Page, Result, ServiceError, SourceService,
    UserProvisioner,
};
use crate::stage::StageKind;

pub(crate) const DEFAULT_USER: u64 = 1;

/// Source serving canned listings, paginated.
pub(crate) struct FakeSource {
    listings: Vec<(EntityKind, ListFilter, Vec<EntityRecord>)>,
    failing: HashSet<EntityKind>,
    attachments: Vec<(u64, AttachmentData)>,
    page_size: usize,
}

impl FakeSource {
    pub(crate) fn new() -> Self {
        Self {
            listings: Vec::new(),
            failing: HashSet::new(),
            attachments: Vec::new(),
            page_size: 2,
        }
    }

    pub(crate) fn with(mut self, kind: EntityKind, filter: ListFilter, items: Vec<Value>) -> Self {
        let records = items
            .into_iter()
            .map(|v| EntityRecord::from_value(v).expect("fixture needs a numeric id"))
            .collect();
        self.listings.push((kind, filter, records));
        self
    }

    pub(crate) fn failing(mut self, kind: EntityKind) -> Self {
        self.failing.insert(kind);
        self
    }

    pub(crate) fn with_attachment(mut self, id: u64, filename: &str) -> Self {
        self.attachments.push((
            id,
            AttachmentData {
                filename: filename.to_string(),
                content_type: Some("image/png".to_string()),
                bytes: vec![1, 2, 3],
            },
        ));
        self
    }
}

#[async_trait]
impl SourceService for FakeSource {
    async fn list_page(&self, kind: EntityKind, filter: &ListFilter, offset: usize) -> Result<Page> {
        if self.failing.contains(&kind) {
            return Err(ServiceError::network(format!("{kind} listing unavailable")));
        }

        let items: &[EntityRecord] = self
            .listings
            .iter()
            .find(|(k, f, _)| *k == kind && f == filter)
            .map(|(_, _, items)| items.as_slice())
            .unwrap_or_default();

        let end = (offset + self.page_size).min(items.len());
        let page_items = items.get(offset..end).unwrap_or_default().to_vec();
        Ok(Page {
            next_offset: (end < items.len()).then_some(end),
            items: page_items,
        })
    }

    async fn fetch_attachment(&self, id: u64) -> Result<AttachmentData> {
        self.attachments
            .iter()
            .find(|(aid, _)| *aid == id)
            .map(|(_, data)| data.clone())
            .ok_or_else(|| ServiceError::not_found(format!("attachment {id}")))
    }
}

#[derive(Default)]
struct DestinationState {
    users: Vec<DestinationUser>,
    project_codes: Vec<String>,
    fields: Vec<DestinationField>,
    created: Vec<(EntityKind, Option<String>, Value)>,
    failing_titles: HashSet<String>,
}

/// Destination recording every creation.
#[derive(Clone, Default)]
pub(crate) struct FakeDestination {
    state: Arc<Mutex<DestinationState>>,
    next_id: Arc<AtomicU64>,
}

impl FakeDestination {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::default(),
            next_id: Arc::new(AtomicU64::new(1000)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DestinationState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn with_users(self, users: &[(u64, &str)]) -> Self {
        self.lock().users = users
            .iter()
            .map(|&(id, email)| DestinationUser {
                id,
                email: Some(email.to_string()),
                name: None,
            })
            .collect();
        self
    }

    pub(crate) fn with_project_codes(self, codes: &[&str]) -> Self {
        self.lock().project_codes = codes.iter().map(|c| c.to_string()).collect();
        self
    }

    pub(crate) fn with_fields(self, fields: &[(u64, &str)]) -> Self {
        self.lock().fields = fields
            .iter()
            .map(|&(id, title)| DestinationField {
                id,
                title: title.to_string(),
            })
            .collect();
        self
    }

    /// Reject creations whose payload title (or name) equals `title`.
    pub(crate) fn failing_title(self, title: &str) -> Self {
        self.lock().failing_titles.insert(title.to_string());
        self
    }

    pub(crate) fn created(&self, kind: EntityKind) -> Vec<(Option<String>, Value)> {
        self.lock()
            .created
            .iter()
            .filter(|(k, _, _)| *k == kind)
            .map(|(_, project, payload)| (project.clone(), payload.clone()))
            .collect()
    }

    fn record(&self, kind: EntityKind, project: Option<&str>, payload: &Value) -> Result<u64> {
        let mut state = self.lock();
        let title = payload
            .get("title")
            .or_else(|| payload.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        if state.failing_titles.contains(title) {
            return Err(ServiceError::validation(format!("rejected '{title}'")));
        }
        state
            .created
            .push((kind, project.map(str::to_string), payload.clone()));
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl DestinationService for FakeDestination {
    async fn list_users(&self) -> Result<Vec<DestinationUser>> {
        Ok(self.lock().users.clone())
    }

    async fn list_project_codes(&self) -> Result<Vec<String>> {
        Ok(self.lock().project_codes.clone())
    }

    async fn list_custom_fields(&self) -> Result<Vec<DestinationField>> {
        Ok(self.lock().fields.clone())
    }

    async fn create_project(&self, payload: &Value) -> Result<String> {
        self.record(EntityKind::Project, None, payload)?;
        payload
            .get("code")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ServiceError::validation("code is required"))
    }

    async fn create_entity(
        &self,
        kind: EntityKind,
        project: Option<&str>,
        payload: &Value,
    ) -> Result<u64> {
        self.record(kind, project, payload)
    }

    async fn create_shared_step(&self, project: &str, payload: &Value) -> Result<String> {
        let id = self.record(EntityKind::SharedStep, Some(project), payload)?;
        Ok(format!("step-{id}"))
    }

    async fn upload_attachment(
        &self,
        project: &str,
        attachment: AttachmentData,
    ) -> Result<AttachmentRef> {
        let payload = serde_json::json!({ "title": attachment.filename });
        let id = self.record(EntityKind::Attachment, Some(project), &payload)?;
        let hash = format!("hash-{id}");
        Ok(AttachmentRef {
            url: Some(format!("https://dest.example/attachment/{hash}/{}", attachment.filename)),
            hash,
            filename: Some(attachment.filename),
            attached_to: None,
        })
    }
}

/// Provisioner handing out a fixed id and remembering emails.
#[derive(Clone)]
pub(crate) struct FakeProvisioner {
    id: u64,
    created: Arc<Mutex<Vec<String>>>,
}

impl FakeProvisioner {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            created: Arc::default(),
        }
    }

    pub(crate) fn created(&self) -> Vec<String> {
        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl UserProvisioner for FakeProvisioner {
    async fn create_user(&self, payload: &Value) -> Result<Option<u64>> {
        let email = payload
            .get("email")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.created
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(email);
        Ok(Some(self.id))
    }
}

pub(crate) fn harness(
    source: FakeSource,
    destination: FakeDestination,
    configure: impl FnOnce(&mut MigrationOptions),
) -> (MigrationContext, Pools, Mappings) {
    let mut options = MigrationOptions::default();
    configure(&mut options);
    let ctx = MigrationContext::builder()
        .source(source)
        .destination(destination)
        .options(options)
        .build()
        .expect("context");
    (ctx, Pools::from_config(&PoolConfig::default()), Mappings::new(DEFAULT_USER))
}

pub(crate) fn harness_with(
    source: FakeSource,
    destination: FakeDestination,
    provisioner: FakeProvisioner,
    configure: impl FnOnce(&mut MigrationOptions),
) -> (MigrationContext, Pools, Mappings) {
    let mut options = MigrationOptions::default();
    configure(&mut options);
    let ctx = MigrationContext::builder()
        .source(source)
        .destination(destination)
        .provisioner(provisioner)
        .options(options)
        .build()
        .expect("context");
    (ctx, Pools::from_config(&PoolConfig::default()), Mappings::new(DEFAULT_USER))
}

pub(crate) fn project(code: &str, source_id: u64) -> ProjectMapping {
    ProjectMapping {
        source_id,
        code: code.to_string(),
        name: format!("Project {code}"),
        suite_id: None,
        suite_title: None,
    }
}

/// Mark every stage up to `stage` complete for `code`, as the orchestrator
/// would have.
pub(crate) fn complete_through(mappings: &mut Mappings, stage: StageKind, code: &str) {
    for kind in StageKind::GLOBAL.into_iter().chain(StageKind::PER_PROJECT) {
        if kind == stage {
            break;
        }
        mappings.mark_complete(kind, Some(code));
    }
}
