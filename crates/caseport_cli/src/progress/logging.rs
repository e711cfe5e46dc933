use caseport::migrate::MigrationProgress;

/// Logging reporter using tracing for structured output.
pub struct LoggingReporter;

impl LoggingReporter {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, event: MigrationProgress) {
        match event {
            MigrationProgress::StageStarted { stage, project } => {
                tracing::info!(stage = %stage, project = ?project, "Stage started");
            }

            MigrationProgress::FetchedPage {
                kind,
                page,
                count,
                total_so_far,
            } => {
                tracing::debug!(kind = %kind, page, count, total_so_far, "Fetched page");
            }

            MigrationProgress::EntitiesDiscovered {
                stage,
                kind,
                project,
                total,
            } => {
                tracing::info!(stage = %stage, kind = %kind, project = ?project, total, "Discovered entities");
            }

            MigrationProgress::EntityCreated {
                kind,
                source_id,
                project,
            } => {
                tracing::debug!(kind = %kind, source_id, project = ?project, "Created");
            }

            MigrationProgress::EntitySkipped {
                kind,
                source_id,
                project,
            } => {
                tracing::debug!(kind = %kind, source_id, project = ?project, "Already migrated");
            }

            MigrationProgress::EntityFailed {
                kind,
                source_id,
                project,
                error,
            } => {
                tracing::warn!(kind = %kind, source_id, project = ?project, error = %error, "Failed to import");
            }

            MigrationProgress::UserFallback {
                source_id,
                email,
                default_user,
            } => {
                tracing::info!(source_id, email = ?email, default_user, "Mapped to default user");
            }

            MigrationProgress::StageComplete {
                stage,
                project,
                created,
                skipped,
                failed,
            } => {
                tracing::info!(stage = %stage, project = ?project, created, skipped, failed, "Stage complete");
            }

            MigrationProgress::StageSkipped { stage, project } => {
                tracing::info!(stage = %stage, project = ?project, "Stage disabled");
            }

            MigrationProgress::ProjectStarted {
                index,
                total,
                code,
                name,
            } => {
                tracing::info!(index, total, code = %code, name = %name, "Migrating project");
            }

            MigrationProgress::ProjectComplete { index, total, code } => {
                tracing::info!(index, total, code = %code, "Project complete");
            }

            MigrationProgress::RateLimitBackoff {
                kind,
                source_id,
                retry_after_ms,
                attempt,
            } => {
                tracing::warn!(
                    kind = %kind,
                    source_id,
                    retry_after_ms,
                    attempt,
                    "Rate limited, backing off"
                );
            }

            MigrationProgress::Checkpoint { label, snapshot } => {
                let totals = snapshot.totals();
                tracing::debug!(
                    label = %label,
                    succeeded = totals.succeeded,
                    failed = totals.failed,
                    "Checkpoint"
                );
            }

            MigrationProgress::Warning { message } => {
                tracing::warn!(message = %message, "Warning");
            }

            MigrationProgress::MigrationComplete { projects, snapshot } => {
                let totals = snapshot.totals();
                tracing::info!(
                    projects,
                    succeeded = totals.succeeded,
                    skipped = totals.skipped,
                    failed = totals.failed,
                    "Migration complete"
                );
            }

            _ => {}
        }
    }
}

impl Default for LoggingReporter {
    fn default() -> Self {
        Self::new()
    }
}
