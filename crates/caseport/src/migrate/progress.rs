//! Progress events emitted while a migration runs.

use crate::mapping::StatsSnapshot;
use crate::service::EntityKind;
use crate::stage::StageKind;

/// Progress events emitted during a migration.
///
/// Project-scoped events carry the destination project code.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum MigrationProgress {
    /// A stage started.
    StageStarted {
        stage: StageKind,
        project: Option<String>,
    },

    /// Fetched a page of source entities.
    FetchedPage {
        kind: EntityKind,
        /// Page number (1-indexed).
        page: u32,
        /// Number of entities on this page.
        count: usize,
        /// Running total fetched for this listing.
        total_so_far: usize,
    },

    /// Source entities a stage is about to process.
    EntitiesDiscovered {
        stage: StageKind,
        kind: EntityKind,
        project: Option<String>,
        total: usize,
    },

    /// An entity was created at the destination.
    EntityCreated {
        kind: EntityKind,
        source_id: u64,
        project: Option<String>,
    },

    /// An entity was already mapped and was not created again.
    EntitySkipped {
        kind: EntityKind,
        source_id: u64,
        project: Option<String>,
    },

    /// An entity failed to import. Processing continues.
    EntityFailed {
        kind: EntityKind,
        source_id: u64,
        project: Option<String>,
        error: String,
    },

    /// A source user had no destination match and was mapped to the default
    /// user.
    UserFallback {
        source_id: u64,
        email: Option<String>,
        default_user: u64,
    },

    /// A stage finished.
    StageComplete {
        stage: StageKind,
        project: Option<String>,
        created: usize,
        skipped: usize,
        failed: usize,
    },

    /// A stage was disabled by configuration and did no work.
    StageSkipped {
        stage: StageKind,
        project: Option<String>,
    },

    /// Starting the per-project stage sequence.
    ProjectStarted {
        /// Position in the project list (1-indexed).
        index: usize,
        total: usize,
        code: String,
        name: String,
    },

    /// Finished the per-project stage sequence.
    ProjectComplete {
        index: usize,
        total: usize,
        code: String,
    },

    /// Rate limited or transient failure, backing off before retry.
    RateLimitBackoff {
        kind: EntityKind,
        source_id: u64,
        /// Time to wait before retry (ms).
        retry_after_ms: u64,
        /// Current attempt number.
        attempt: u32,
    },

    /// Statistics persisted after a project or at the end.
    Checkpoint {
        label: String,
        snapshot: StatsSnapshot,
    },

    /// Warning message (non-fatal).
    Warning { message: String },

    /// The whole migration finished.
    MigrationComplete {
        projects: usize,
        snapshot: StatsSnapshot,
    },
}

/// Callback for progress updates during a migration.
pub type ProgressCallback = Box<dyn Fn(MigrationProgress) + Send + Sync>;

/// Emit a progress event if a callback is provided.
#[inline]
pub fn emit(on_progress: Option<&ProgressCallback>, event: MigrationProgress) {
    if let Some(cb) = on_progress {
        cb(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_emit_with_callback() {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let callback: ProgressCallback = Box::new(move |_event| {
            count_clone.fetch_add(1, Ordering::SeqCst);
        });

        emit(
            Some(&callback),
            MigrationProgress::StageStarted {
                stage: StageKind::Users,
                project: None,
            },
        );
        emit(
            Some(&callback),
            MigrationProgress::Warning {
                message: "careful".to_string(),
            },
        );

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_emit_without_callback() {
        emit(
            None,
            MigrationProgress::StageSkipped {
                stage: StageKind::Runs,
                project: Some("DEMO".to_string()),
            },
        );
    }

    #[test]
    fn test_progress_debug_includes_fields() {
        let event = MigrationProgress::EntityFailed {
            kind: EntityKind::Case,
            source_id: 17,
            project: Some("DEMO".to_string()),
            error: "Validation error: title".to_string(),
        };

        let debug_str = format!("{event:?}");
        assert!(debug_str.contains("EntityFailed"));
        assert!(debug_str.contains("DEMO"));
        assert!(debug_str.contains("17"));
    }
}
