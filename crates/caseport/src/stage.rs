//! Pipeline stages.
//!
//! Each stage moves one family of entities from source to destination. A
//! stage receives the [`Mappings`] by value, reads source data through the
//! source pool, creates entities through the destination pool, and returns
//! the grown mapping once every task it submitted has finished.
//!
//! Stages are always invoked through [`run_stage`], which enforces scope,
//! prerequisites and per-stage toggles.

mod attachments;
mod cases;
mod configurations;
mod create;
mod fetch;
mod fields;
mod milestones;
mod projects;
mod runs;
mod shared_steps;
mod suites;
#[cfg(test)]
pub(crate) mod test_support;
mod users;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mapping::{EntityStats, Mappings, ProjectMapping};
use crate::migrate::{MigrationContext, MigrationProgress};
use crate::pool::{PoolError, Pools};
use crate::service::{EntityKind, ServiceError};

pub use attachments::AttachmentStage;
pub use cases::{CaseStage, rewrite_attachment_links};
pub use configurations::ConfigurationStage;
pub use fields::FieldStage;
pub use milestones::MilestoneStage;
pub use projects::{ProjectStage, derive_project_code};
pub use runs::RunStage;
pub use shared_steps::SharedStepStage;
pub use suites::SuiteStage;
pub use users::UserStage;

/// Whether a stage runs once or once per destination project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageScope {
    Global,
    Project,
}

/// Identifies a pipeline stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Users,
    Projects,
    Attachments,
    Fields,
    Configurations,
    Milestones,
    Suites,
    SharedSteps,
    Cases,
    Runs,
}

impl StageKind {
    /// Stages that run once, in order.
    pub const GLOBAL: [StageKind; 4] = [
        StageKind::Users,
        StageKind::Projects,
        StageKind::Attachments,
        StageKind::Fields,
    ];

    /// Stages that run for every project, in order.
    pub const PER_PROJECT: [StageKind; 6] = [
        StageKind::Configurations,
        StageKind::Milestones,
        StageKind::Suites,
        StageKind::SharedSteps,
        StageKind::Cases,
        StageKind::Runs,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Users => "users",
            StageKind::Projects => "projects",
            StageKind::Attachments => "attachments",
            StageKind::Fields => "fields",
            StageKind::Configurations => "configurations",
            StageKind::Milestones => "milestones",
            StageKind::Suites => "suites",
            StageKind::SharedSteps => "shared_steps",
            StageKind::Cases => "cases",
            StageKind::Runs => "runs",
        }
    }

    pub fn scope(self) -> StageScope {
        match self {
            StageKind::Users | StageKind::Projects | StageKind::Attachments | StageKind::Fields => {
                StageScope::Global
            }
            _ => StageScope::Project,
        }
    }

    /// Stages that must have completed before this one may run.
    pub fn requires(self) -> &'static [StageKind] {
        match self {
            StageKind::Users => &[],
            StageKind::Projects => &[StageKind::Users],
            StageKind::Attachments
            | StageKind::Fields
            | StageKind::Configurations
            | StageKind::Milestones
            | StageKind::Suites
            | StageKind::SharedSteps => &[StageKind::Projects],
            StageKind::Cases => &[
                StageKind::Users,
                StageKind::Attachments,
                StageKind::Fields,
                StageKind::Milestones,
                StageKind::Suites,
                StageKind::SharedSteps,
            ],
            StageKind::Runs => &[
                StageKind::Users,
                StageKind::Configurations,
                StageKind::Milestones,
                StageKind::Cases,
            ],
        }
    }

    /// Entity kinds whose statistics this stage updates.
    pub fn entity_kinds(self) -> &'static [EntityKind] {
        match self {
            StageKind::Users => &[EntityKind::User],
            StageKind::Projects => &[EntityKind::Project],
            StageKind::Attachments => &[EntityKind::Attachment],
            StageKind::Fields => &[EntityKind::CustomField],
            StageKind::Configurations => {
                &[EntityKind::ConfigurationGroup, EntityKind::Configuration]
            }
            StageKind::Milestones => &[EntityKind::Milestone],
            StageKind::Suites => &[EntityKind::Suite],
            StageKind::SharedSteps => &[EntityKind::SharedStep],
            StageKind::Cases => &[EntityKind::Case],
            StageKind::Runs => &[EntityKind::Run],
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a stage name is not recognised.
#[derive(Debug, Error)]
#[error("unknown stage '{0}'")]
pub struct UnknownStage(pub String);

impl FromStr for StageKind {
    type Err = UnknownStage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        StageKind::GLOBAL
            .into_iter()
            .chain(StageKind::PER_PROJECT)
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| UnknownStage(s.to_string()))
    }
}

fn join_stages(stages: &[StageKind]) -> String {
    stages
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn project_suffix(project: &Option<String>) -> String {
    project
        .as_deref()
        .map(|code| format!(" for project {code}"))
        .unwrap_or_default()
}

/// Errors that abort a stage, and with it the migration.
///
/// Individual entity failures are not errors; they are recorded in the
/// statistics and the stage carries on.
#[derive(Debug, Error)]
pub enum StageError {
    /// A prerequisite stage has not completed.
    #[error(
        "stage '{stage}' requires [{}] to complete first{}",
        join_stages(missing),
        project_suffix(project)
    )]
    DependencyViolation {
        stage: StageKind,
        missing: Vec<StageKind>,
        project: Option<String>,
    },

    /// A project-scoped stage was invoked without a project.
    #[error("stage '{stage}' must run for a project")]
    MissingProject { stage: StageKind },

    /// The source listing could not be read.
    #[error("stage '{stage}' could not read source data: {source}")]
    Source {
        stage: StageKind,
        #[source]
        source: ServiceError,
    },

    /// Existing destination data could not be read.
    #[error("stage '{stage}' could not read destination data: {source}")]
    Destination {
        stage: StageKind,
        #[source]
        source: ServiceError,
    },

    /// A worker pool refused work.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// One unit of the migration pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    /// Migrate this stage's entities, returning the grown mapping.
    ///
    /// `project` is `Some` for project-scoped stages. Implementations must
    /// drain every task they submit before returning.
    async fn run(
        &self,
        ctx: &MigrationContext,
        pools: &Pools,
        mappings: Mappings,
        project: Option<&ProjectMapping>,
    ) -> Result<Mappings, StageError>;
}

/// The stage implementation for `kind`.
pub fn stage_for(kind: StageKind) -> Box<dyn Stage> {
    match kind {
        StageKind::Users => Box::new(UserStage),
        StageKind::Projects => Box::new(ProjectStage),
        StageKind::Attachments => Box::new(AttachmentStage),
        StageKind::Fields => Box::new(FieldStage),
        StageKind::Configurations => Box::new(ConfigurationStage),
        StageKind::Milestones => Box::new(MilestoneStage),
        StageKind::Suites => Box::new(SuiteStage),
        StageKind::SharedSteps => Box::new(SharedStepStage),
        StageKind::Cases => Box::new(CaseStage),
        StageKind::Runs => Box::new(RunStage),
    }
}

fn stage_totals(mappings: &Mappings, kind: StageKind) -> EntityStats {
    let mut totals = EntityStats::default();
    for &entity in kind.entity_kinds() {
        totals += mappings.stats.entity(entity);
    }
    totals
}

/// Run `stage` with scope, dependency and toggle checks.
///
/// Fails fast with [`StageError::DependencyViolation`] when a prerequisite
/// has not completed. A stage disabled in the options is marked complete
/// without doing any work.
#[tracing::instrument(
    skip_all,
    fields(stage = %stage.kind(), project = project.map(|p| p.code.as_str()))
)]
pub async fn run_stage(
    stage: &dyn Stage,
    ctx: &MigrationContext,
    pools: &Pools,
    mappings: Mappings,
    project: Option<&ProjectMapping>,
) -> Result<Mappings, StageError> {
    let kind = stage.kind();
    let code = match kind.scope() {
        StageScope::Global => None,
        StageScope::Project => match project {
            Some(p) => Some(p.code.as_str()),
            None => return Err(StageError::MissingProject { stage: kind }),
        },
    };

    let missing = mappings.missing_dependencies(kind, code);
    if !missing.is_empty() {
        return Err(StageError::DependencyViolation {
            stage: kind,
            missing,
            project: code.map(str::to_string),
        });
    }

    let mut mappings = mappings;

    if !ctx.options().stages.is_enabled(kind) {
        tracing::info!("Stage disabled, skipping");
        ctx.emit(MigrationProgress::StageSkipped {
            stage: kind,
            project: code.map(str::to_string),
        });
        mappings.mark_complete(kind, code);
        return Ok(mappings);
    }

    ctx.emit(MigrationProgress::StageStarted {
        stage: kind,
        project: code.map(str::to_string),
    });

    let before = stage_totals(&mappings, kind);
    let mut mappings = stage.run(ctx, pools, mappings, project).await?;
    let after = stage_totals(&mappings, kind);

    mappings.mark_complete(kind, code);

    let created = after.succeeded.saturating_sub(before.succeeded) as usize;
    let skipped = after.skipped.saturating_sub(before.skipped) as usize;
    let failed = after.failed.saturating_sub(before.failed) as usize;

    tracing::info!(created, skipped, failed, "Stage complete");
    ctx.emit(MigrationProgress::StageComplete {
        stage: kind,
        project: code.map(str::to_string),
        created,
        skipped,
        failed,
    });

    Ok(mappings)
}
