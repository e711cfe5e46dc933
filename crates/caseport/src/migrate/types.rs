//! Migration options.

use crate::retry::RetryConfig;
use crate::stage::StageKind;

/// Default label for reports.
pub const DEFAULT_REPORT_PREFIX: &str = "caseport";

/// Per-stage on/off switches. Everything is enabled by default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageToggles {
    pub users: bool,
    pub projects: bool,
    pub attachments: bool,
    pub fields: bool,
    pub configurations: bool,
    pub milestones: bool,
    pub suites: bool,
    pub shared_steps: bool,
    pub cases: bool,
    pub runs: bool,
}

impl Default for StageToggles {
    fn default() -> Self {
        Self {
            users: true,
            projects: true,
            attachments: true,
            fields: true,
            configurations: true,
            milestones: true,
            suites: true,
            shared_steps: true,
            cases: true,
            runs: true,
        }
    }
}

impl StageToggles {
    fn slot(&mut self, kind: StageKind) -> &mut bool {
        match kind {
            StageKind::Users => &mut self.users,
            StageKind::Projects => &mut self.projects,
            StageKind::Attachments => &mut self.attachments,
            StageKind::Fields => &mut self.fields,
            StageKind::Configurations => &mut self.configurations,
            StageKind::Milestones => &mut self.milestones,
            StageKind::Suites => &mut self.suites,
            StageKind::SharedSteps => &mut self.shared_steps,
            StageKind::Cases => &mut self.cases,
            StageKind::Runs => &mut self.runs,
        }
    }

    pub fn is_enabled(&self, kind: StageKind) -> bool {
        match kind {
            StageKind::Users => self.users,
            StageKind::Projects => self.projects,
            StageKind::Attachments => self.attachments,
            StageKind::Fields => self.fields,
            StageKind::Configurations => self.configurations,
            StageKind::Milestones => self.milestones,
            StageKind::Suites => self.suites,
            StageKind::SharedSteps => self.shared_steps,
            StageKind::Cases => self.cases,
            StageKind::Runs => self.runs,
        }
    }

    pub fn set(&mut self, kind: StageKind, enabled: bool) {
        *self.slot(kind) = enabled;
    }

    #[must_use]
    pub fn without(mut self, kind: StageKind) -> Self {
        self.set(kind, false);
        self
    }
}

/// Options for a migration run.
#[derive(Debug, Clone)]
pub struct MigrationOptions {
    pub stages: StageToggles,
    pub retry: RetryConfig,
    /// Create destination accounts for unmatched active source users when a
    /// provisioner is available.
    pub create_missing_users: bool,
    /// Migrate source projects marked completed.
    pub include_completed_projects: bool,
    /// Label used for checkpoints and report files.
    pub report_prefix: String,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            stages: StageToggles::default(),
            retry: RetryConfig::default(),
            create_missing_users: false,
            include_completed_projects: true,
            report_prefix: DEFAULT_REPORT_PREFIX.to_string(),
        }
    }
}
