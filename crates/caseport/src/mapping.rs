//! Identity mapping state threaded through every stage.
//!
//! [`Mappings`] is moved into each stage and handed back, grown, on success.
//! Tables are [`IdTable`]s: clones share storage, so worker tasks record
//! results directly and the stage returns the same value it received.

mod stats;
mod table;

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use stats::{EntityStats, FailureRecord, StatsCollector, StatsSnapshot};
pub use table::IdTable;

use crate::service::AttachmentRef;
use crate::stage::{StageKind, StageScope};

/// Key for project-scoped tables: destination project code and source id.
pub type ProjectKey = (String, u64);

#[inline]
pub fn project_key(code: &str, source_id: u64) -> ProjectKey {
    (code.to_string(), source_id)
}

/// Completion mark: stage plus destination project code for scoped stages.
pub type StageMark = (StageKind, Option<String>);

/// Destination user a source user resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMatch {
    pub id: u64,
    /// `false` when the entry is the default-user fallback.
    pub confirmed: bool,
}

/// A destination project and the source data it was built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectMapping {
    pub source_id: u64,
    /// Destination project code.
    pub code: String,
    pub name: String,
    /// Source suite for projects split out of a multi-suite source project.
    pub suite_id: Option<u64>,
    pub suite_title: Option<String>,
}

/// A destination custom field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub id: u64,
    /// Source `system_name`, used to find the value on source cases.
    pub system_name: String,
}

/// Table sizes, for reports and rerun comparisons.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MappingCounts {
    pub users: usize,
    pub projects: usize,
    pub fields: usize,
    pub attachments: usize,
    pub configuration_groups: usize,
    pub configurations: usize,
    pub milestones: usize,
    pub suites: usize,
    pub shared_steps: usize,
    pub cases: usize,
    pub runs: usize,
}

impl IdTable<u64, UserMatch> {
    /// Store a confirmed match unless one is already present.
    pub fn confirm(&self, source_id: u64, destination_id: u64) -> bool {
        self.replace_if(
            source_id,
            UserMatch {
                id: destination_id,
                confirmed: true,
            },
            |current| current.is_none_or(|m| !m.confirmed),
        )
    }
}

/// Source -> destination identity state for one migration.
#[derive(Debug, Clone)]
pub struct Mappings {
    pub default_user: u64,
    pub users: IdTable<u64, UserMatch>,
    /// Destination projects in source enumeration order.
    pub projects: Vec<ProjectMapping>,
    pub fields: IdTable<u64, FieldMapping>,
    pub attachments: IdTable<u64, AttachmentRef>,
    pub configuration_groups: IdTable<ProjectKey, u64>,
    pub configurations: IdTable<ProjectKey, u64>,
    pub milestones: IdTable<ProjectKey, u64>,
    pub suites: IdTable<ProjectKey, u64>,
    pub shared_steps: IdTable<ProjectKey, String>,
    pub cases: IdTable<ProjectKey, u64>,
    pub runs: IdTable<ProjectKey, u64>,
    pub stats: Arc<StatsCollector>,
    completed: BTreeSet<StageMark>,
}

impl Mappings {
    /// Empty mapping state falling back to `default_user` for unmatched users.
    pub fn new(default_user: u64) -> Self {
        Self::with_stats(default_user, Arc::new(StatsCollector::new()))
    }

    pub fn with_stats(default_user: u64, stats: Arc<StatsCollector>) -> Self {
        Self {
            default_user,
            users: IdTable::new(),
            projects: Vec::new(),
            fields: IdTable::new(),
            attachments: IdTable::new(),
            configuration_groups: IdTable::new(),
            configurations: IdTable::new(),
            milestones: IdTable::new(),
            suites: IdTable::new(),
            shared_steps: IdTable::new(),
            cases: IdTable::new(),
            runs: IdTable::new(),
            stats,
            completed: BTreeSet::new(),
        }
    }

    /// Destination id for a source user, or the default user.
    pub fn user(&self, source_id: u64) -> u64 {
        self.users
            .get(&source_id)
            .map_or(self.default_user, |m| m.id)
    }

    /// Like [`Mappings::user`], for optional source references.
    pub fn user_or_default(&self, source_id: Option<u64>) -> u64 {
        source_id.map_or(self.default_user, |id| self.user(id))
    }

    /// Record a confirmed match. Upgrades a fallback entry; a confirmed entry
    /// is left as is.
    pub fn map_user(&self, source_id: u64, destination_id: u64) -> bool {
        self.users.confirm(source_id, destination_id)
    }

    /// Map a source user to the default user unless already mapped.
    pub fn map_user_default(&self, source_id: u64) -> bool {
        self.users.insert_new(
            source_id,
            UserMatch {
                id: self.default_user,
                confirmed: false,
            },
        )
    }

    /// Append a project unless its code is already known.
    pub fn add_project(&mut self, project: ProjectMapping) -> bool {
        if self.project(&project.code).is_some() {
            return false;
        }
        self.projects.push(project);
        true
    }

    pub fn project(&self, code: &str) -> Option<&ProjectMapping> {
        self.projects.iter().find(|p| p.code == code)
    }

    pub fn mark_complete(&mut self, stage: StageKind, project: Option<&str>) {
        self.completed.insert(Self::mark(stage, project));
    }

    pub fn is_complete(&self, stage: StageKind, project: Option<&str>) -> bool {
        self.completed.contains(&Self::mark(stage, project))
    }

    /// Prerequisites of `stage` that have not completed for `project`.
    pub fn missing_dependencies(&self, stage: StageKind, project: Option<&str>) -> Vec<StageKind> {
        stage
            .requires()
            .iter()
            .copied()
            .filter(|&dep| !self.is_complete(dep, project))
            .collect()
    }

    pub fn completed(&self) -> impl Iterator<Item = &StageMark> {
        self.completed.iter()
    }

    pub fn counts(&self) -> MappingCounts {
        MappingCounts {
            users: self.users.len(),
            projects: self.projects.len(),
            fields: self.fields.len(),
            attachments: self.attachments.len(),
            configuration_groups: self.configuration_groups.len(),
            configurations: self.configurations.len(),
            milestones: self.milestones.len(),
            suites: self.suites.len(),
            shared_steps: self.shared_steps.len(),
            cases: self.cases.len(),
            runs: self.runs.len(),
        }
    }

    fn mark(stage: StageKind, project: Option<&str>) -> StageMark {
        match stage.scope() {
            StageScope::Global => (stage, None),
            StageScope::Project => (stage, project.map(str::to_string)),
        }
    }
}
