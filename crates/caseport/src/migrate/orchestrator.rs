//! Drives the stage pipeline.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::mapping::{MappingCounts, Mappings, ProjectMapping, StatsSnapshot};
use crate::pool::Pools;
use crate::stage::{StageError, StageKind, run_stage, stage_for};

use super::context::MigrationContext;
use super::progress::MigrationProgress;
use super::report::ReportSink;

/// Label of the checkpoint written once every project is done.
pub const FINAL_CHECKPOINT: &str = "final";

/// Where the orchestrator is in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MigrationState {
    Init,
    UsersImported,
    ProjectsImported,
    AttachmentsImported,
    FieldsImported,
    /// Running the per-project stages for project `index` (1-indexed).
    ProjectLoop { index: usize, total: usize },
    Done,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationState::Init => f.write_str("init"),
            MigrationState::UsersImported => f.write_str("users imported"),
            MigrationState::ProjectsImported => f.write_str("projects imported"),
            MigrationState::AttachmentsImported => f.write_str("attachments imported"),
            MigrationState::FieldsImported => f.write_str("fields imported"),
            MigrationState::ProjectLoop { index, total } => {
                write!(f, "project {index}/{total}")
            }
            MigrationState::Done => f.write_str("done"),
        }
    }
}

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration stopped at {state}: {source}")]
    Stage {
        state: MigrationState,
        #[source]
        source: StageError,
    },
}

/// Outcome of a completed migration.
#[derive(Debug)]
pub struct MigrationReport {
    pub mappings: Mappings,
    pub counts: MappingCounts,
    pub snapshot: StatsSnapshot,
    /// Destination projects processed.
    pub projects: usize,
}

impl MigrationReport {
    /// Whether every attempted entity was created.
    pub fn is_clean(&self) -> bool {
        self.snapshot.failures.is_empty()
    }
}

/// Runs the global stages once, then the per-project stages for every
/// project, strictly one after another.
///
/// Statistics are checkpointed to every [`ReportSink`] after each project
/// and at the end. A failing stage aborts the run; the last checkpoint
/// stays where the sinks put it.
pub struct Orchestrator {
    ctx: MigrationContext,
    pools: Pools,
    sinks: Vec<Box<dyn ReportSink>>,
    state: MigrationState,
}

impl Orchestrator {
    pub fn new(ctx: MigrationContext, pools: Pools) -> Self {
        Self {
            ctx,
            pools,
            sinks: Vec::new(),
            state: MigrationState::Init,
        }
    }

    #[must_use]
    pub fn with_sink(mut self, sink: impl ReportSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn state(&self) -> MigrationState {
        self.state
    }

    pub fn context(&self) -> &MigrationContext {
        &self.ctx
    }

    pub fn pools(&self) -> &Pools {
        &self.pools
    }

    /// Run the whole pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::Stage`] carrying the state the pipeline was
    /// in when a stage failed.
    #[tracing::instrument(skip_all, fields(projects = tracing::field::Empty))]
    pub async fn run(&mut self, mappings: Mappings) -> Result<MigrationReport, MigrationError> {
        self.state = MigrationState::Init;
        let mut mappings = mappings;

        for (kind, reached) in [
            (StageKind::Users, MigrationState::UsersImported),
            (StageKind::Projects, MigrationState::ProjectsImported),
            (StageKind::Attachments, MigrationState::AttachmentsImported),
            (StageKind::Fields, MigrationState::FieldsImported),
        ] {
            mappings = self.run_one(kind, mappings, None).await?;
            self.transition(reached);
        }

        let projects = mappings.projects.clone();
        let total = projects.len();
        tracing::Span::current().record("projects", total);

        for (i, project) in projects.iter().enumerate() {
            let index = i + 1;
            self.transition(MigrationState::ProjectLoop { index, total });
            self.ctx.emit(MigrationProgress::ProjectStarted {
                index,
                total,
                code: project.code.clone(),
                name: project.name.clone(),
            });

            for kind in StageKind::PER_PROJECT {
                mappings = self.run_one(kind, mappings, Some(project)).await?;
            }

            self.ctx.emit(MigrationProgress::ProjectComplete {
                index,
                total,
                code: project.code.clone(),
            });
            self.checkpoint(&project.code, &mappings);
        }

        self.transition(MigrationState::Done);
        let snapshot = self.checkpoint(FINAL_CHECKPOINT, &mappings);
        let totals = snapshot.totals();
        tracing::info!(
            projects = total,
            attempted = totals.attempted,
            succeeded = totals.succeeded,
            failed = totals.failed,
            skipped = totals.skipped,
            "Migration complete"
        );
        self.ctx.emit(MigrationProgress::MigrationComplete {
            projects: total,
            snapshot: snapshot.clone(),
        });

        Ok(MigrationReport {
            counts: mappings.counts(),
            mappings,
            snapshot,
            projects: total,
        })
    }

    async fn run_one(
        &self,
        kind: StageKind,
        mappings: Mappings,
        project: Option<&ProjectMapping>,
    ) -> Result<Mappings, MigrationError> {
        let stage = stage_for(kind);
        run_stage(stage.as_ref(), &self.ctx, &self.pools, mappings, project)
            .await
            .map_err(|source| {
                tracing::error!(state = %self.state, error = %source, "Stage failed");
                MigrationError::Stage {
                    state: self.state,
                    source,
                }
            })
    }

    fn transition(&mut self, next: MigrationState) {
        tracing::debug!(from = %self.state, to = %next, "Migration state changed");
        self.state = next;
    }

    /// Snapshot the statistics, hand them to the observer and every sink.
    fn checkpoint(&self, label: &str, mappings: &Mappings) -> StatsSnapshot {
        let snapshot = mappings.stats.snapshot();

        for sink in &self.sinks {
            if let Err(e) = sink.save(label, &snapshot) {
                tracing::warn!(label, error = %e, "Failed to save statistics checkpoint");
                self.ctx.emit(MigrationProgress::Warning {
                    message: format!("checkpoint '{label}' not saved: {e}"),
                });
            }
        }

        self.ctx.emit(MigrationProgress::Checkpoint {
            label: label.to_string(),
            snapshot: snapshot.clone(),
        });
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;
    use crate::migrate::report::ReportError;
    use crate::service::{EntityKind, ListFilter};
    use crate::stage::test_support::{FakeDestination, FakeSource, harness};

    #[derive(Clone, Default)]
    struct RecordingSink(Arc<Mutex<Vec<String>>>);

    impl ReportSink for RecordingSink {
        fn save(&self, label: &str, _snapshot: &StatsSnapshot) -> Result<(), ReportError> {
            self.0.lock().unwrap().push(label.to_string());
            Ok(())
        }
    }

    struct BrokenSink;

    impl ReportSink for BrokenSink {
        fn save(&self, _label: &str, _snapshot: &StatsSnapshot) -> Result<(), ReportError> {
            Err(ReportError::Other("disk full".to_string()))
        }
    }

    fn two_projects() -> FakeSource {
        FakeSource::new()
            .with(
                EntityKind::Project,
                ListFilter::default(),
                vec![
                    json!({"id": 1, "name": "Alpha App"}),
                    json!({"id": 2, "name": "Beta Backend"}),
                ],
            )
            .with(
                EntityKind::Milestone,
                ListFilter::project(1),
                vec![json!({"id": 10, "name": "v1"})],
            )
            .with(
                EntityKind::Milestone,
                ListFilter::project(2),
                vec![json!({"id": 20, "name": "v2"})],
            )
    }

    #[test]
    fn state_display() {
        assert_eq!(MigrationState::Init.to_string(), "init");
        assert_eq!(
            MigrationState::ProjectLoop { index: 2, total: 5 }.to_string(),
            "project 2/5"
        );
    }

    #[tokio::test]
    async fn checkpoints_after_every_project_and_at_the_end() {
        let (ctx, pools, mappings) = harness(two_projects(), FakeDestination::new(), |_| {});
        let sink = RecordingSink::default();
        let mut orchestrator = Orchestrator::new(ctx, pools)
            .with_sink(sink.clone())
            .with_sink(BrokenSink);

        let report = orchestrator.run(mappings).await.unwrap();

        assert_eq!(orchestrator.state(), MigrationState::Done);
        assert_eq!(report.projects, 2);
        assert_eq!(report.counts.milestones, 2);
        assert!(report.is_clean());
        assert_eq!(*sink.0.lock().unwrap(), ["AA", "BB", FINAL_CHECKPOINT]);
    }

    #[tokio::test]
    async fn stage_failure_reports_the_state_it_stopped_in() {
        let source = two_projects().failing(EntityKind::Section);
        let (ctx, pools, mappings) = harness(source, FakeDestination::new(), |_| {});
        let sink = RecordingSink::default();
        let mut orchestrator = Orchestrator::new(ctx, pools).with_sink(sink.clone());

        let err = orchestrator.run(mappings).await.unwrap_err();

        let MigrationError::Stage { state, source } = err;
        assert_eq!(state, MigrationState::ProjectLoop { index: 1, total: 2 });
        assert!(matches!(
            source,
            StageError::Source {
                stage: StageKind::Suites,
                ..
            }
        ));
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn disabled_stages_still_satisfy_dependencies() {
        let (ctx, pools, mappings) = harness(two_projects(), FakeDestination::new(), |options| {
            options.stages.set(StageKind::Suites, false);
            options.stages.set(StageKind::Milestones, false);
        });
        let mut orchestrator = Orchestrator::new(ctx, pools);

        let report = orchestrator.run(mappings).await.unwrap();

        assert_eq!(report.counts.milestones, 0);
        assert!(
            report
                .mappings
                .is_complete(StageKind::Cases, Some(&report.mappings.projects[0].code))
        );
    }
}
