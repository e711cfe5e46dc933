use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::Result;

/// Kinds of entity that move through a migration.
///
/// Some kinds only exist on the source side (`Section`, `Test`); they are
/// listed here because the source service is queried by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    User,
    Project,
    Suite,
    Attachment,
    CustomField,
    ConfigurationGroup,
    Configuration,
    Milestone,
    Section,
    SharedStep,
    Case,
    Run,
    Test,
}

impl EntityKind {
    /// Number of entity kinds.
    pub const COUNT: usize = 13;

    /// Every entity kind, in pipeline order.
    pub const ALL: [EntityKind; Self::COUNT] = [
        EntityKind::User,
        EntityKind::Project,
        EntityKind::Suite,
        EntityKind::Attachment,
        EntityKind::CustomField,
        EntityKind::ConfigurationGroup,
        EntityKind::Configuration,
        EntityKind::Milestone,
        EntityKind::Section,
        EntityKind::SharedStep,
        EntityKind::Case,
        EntityKind::Run,
        EntityKind::Test,
    ];

    /// Stable snake_case name.
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::User => "user",
            EntityKind::Project => "project",
            EntityKind::Suite => "suite",
            EntityKind::Attachment => "attachment",
            EntityKind::CustomField => "custom_field",
            EntityKind::ConfigurationGroup => "configuration_group",
            EntityKind::Configuration => "configuration",
            EntityKind::Milestone => "milestone",
            EntityKind::Section => "section",
            EntityKind::SharedStep => "shared_step",
            EntityKind::Case => "case",
            EntityKind::Run => "run",
            EntityKind::Test => "test",
        }
    }

    /// Position of this kind in [`EntityKind::ALL`].
    #[inline]
    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single entity as returned by the source platform.
///
/// The record keeps the raw JSON object; stages read the handful of fields
/// they need through the typed accessors.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityRecord {
    /// Source-side numeric ID.
    pub id: u64,
    /// Raw JSON object.
    pub data: Value,
}

impl EntityRecord {
    pub fn new(id: u64, data: Value) -> Self {
        Self { id, data }
    }

    /// Build a record from a JSON object carrying a numeric `id` field.
    pub fn from_value(data: Value) -> Option<Self> {
        let id = data.get("id")?.as_u64()?;
        Some(Self { id, data })
    }

    /// Raw field access.
    #[inline]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.data.get(key).filter(|v| !v.is_null())
    }

    #[inline]
    pub fn str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    #[inline]
    pub fn u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(Value::as_u64)
    }

    #[inline]
    pub fn bool(&self, key: &str) -> Option<bool> {
        self.get(key).and_then(Value::as_bool)
    }

    /// Title-like field, falling back through the usual names.
    pub fn title(&self) -> String {
        self.str("title")
            .or_else(|| self.str("name"))
            .map(str::to_string)
            .unwrap_or_else(|| format!("#{}", self.id))
    }
}

/// Narrowing filter for source list calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub project_id: Option<u64>,
    pub suite_id: Option<u64>,
    pub run_id: Option<u64>,
}

impl ListFilter {
    pub fn project(project_id: u64) -> Self {
        Self {
            project_id: Some(project_id),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_suite(mut self, suite_id: Option<u64>) -> Self {
        self.suite_id = suite_id;
        self
    }

    pub fn run(run_id: u64) -> Self {
        Self {
            run_id: Some(run_id),
            ..Self::default()
        }
    }
}

/// One page of a paginated source listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<EntityRecord>,
    /// Offset of the next page, `None` when this was the last one.
    pub next_offset: Option<usize>,
}

/// Downloaded attachment content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentData {
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Source entity an attachment belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachedTo {
    /// Source entity type, e.g. `case` or `run`.
    pub entity_type: String,
    pub entity_id: u64,
}

/// Destination-side handle for an uploaded attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub hash: String,
    pub url: Option<String>,
    pub filename: Option<String>,
    /// Filled in by the attachment stage from the source record.
    #[serde(default)]
    pub attached_to: Option<AttachedTo>,
}

/// A user account known to the destination platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationUser {
    pub id: u64,
    pub email: Option<String>,
    pub name: Option<String>,
}

/// A custom field already defined at the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationField {
    pub id: u64,
    pub title: String,
}

/// Read-only access to the platform data is migrated from.
///
/// Implementations handle authentication and wire formats. Listing is
/// paginated by offset; the stage layer walks the pages.
#[async_trait]
pub trait SourceService: Send + Sync {
    /// Fetch one page of entities of `kind`.
    async fn list_page(&self, kind: EntityKind, filter: &ListFilter, offset: usize)
    -> Result<Page>;

    /// Download an attachment by source ID.
    async fn fetch_attachment(&self, id: u64) -> Result<AttachmentData>;
}

/// Write access to the platform data is migrated to.
#[async_trait]
pub trait DestinationService: Send + Sync {
    /// Every user in the destination workspace.
    async fn list_users(&self) -> Result<Vec<DestinationUser>>;

    /// Codes of every existing destination project.
    async fn list_project_codes(&self) -> Result<Vec<String>>;

    /// Custom fields already defined at the destination.
    async fn list_custom_fields(&self) -> Result<Vec<DestinationField>>;

    /// Create a project, returning its code.
    async fn create_project(&self, payload: &Value) -> Result<String>;

    /// Create a numerically identified entity, optionally scoped to a project.
    async fn create_entity(
        &self,
        kind: EntityKind,
        project: Option<&str>,
        payload: &Value,
    ) -> Result<u64>;

    /// Create a shared step, returning its hash.
    async fn create_shared_step(&self, project: &str, payload: &Value) -> Result<String>;

    /// Upload an attachment into a project.
    async fn upload_attachment(
        &self,
        project: &str,
        attachment: AttachmentData,
    ) -> Result<AttachmentRef>;
}

/// Optional capability to create user accounts at the destination.
///
/// Returns `Ok(None)` when provisioning is not available, in which case the
/// caller falls back to the default user.
#[async_trait]
pub trait UserProvisioner: Send + Sync {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn create_user(&self, payload: &Value) -> Result<Option<u64>>;
}

/// Provisioner used when no provisioning credentials are configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledProvisioner;

#[async_trait]
impl UserProvisioner for DisabledProvisioner {
    fn is_enabled(&self) -> bool {
        false
    }

    async fn create_user(&self, _payload: &Value) -> Result<Option<u64>> {
        Ok(None)
    }
}
