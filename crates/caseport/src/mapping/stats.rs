use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::service::EntityKind;

#[derive(Debug, Default)]
struct Counters {
    attempted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

impl Counters {
    fn load(&self) -> EntityStats {
        EntityStats {
            attempted: self.attempted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// Counts for one entity kind.
///
/// `skipped` entries were already mapped and are not counted as attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityStats {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl EntityStats {
    pub fn is_empty(&self) -> bool {
        self.attempted == 0 && self.skipped == 0
    }

    /// Attempts that have not yet resolved either way.
    pub fn pending(&self) -> u64 {
        self.attempted
            .saturating_sub(self.succeeded)
            .saturating_sub(self.failed)
    }
}

impl std::ops::AddAssign for EntityStats {
    fn add_assign(&mut self, rhs: Self) {
        self.attempted += rhs.attempted;
        self.succeeded += rhs.succeeded;
        self.failed += rhs.failed;
        self.skipped += rhs.skipped;
    }
}

/// A single failed entity import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub kind: EntityKind,
    pub source_id: u64,
    /// Destination project code, for project-scoped entities.
    pub project: Option<String>,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Point-in-time copy of the collected statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub started_at: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    /// Kinds with any activity.
    pub entities: BTreeMap<EntityKind, EntityStats>,
    pub failures: Vec<FailureRecord>,
}

impl StatsSnapshot {
    pub fn entity(&self, kind: EntityKind) -> EntityStats {
        self.entities.get(&kind).copied().unwrap_or_default()
    }

    pub fn totals(&self) -> EntityStats {
        let mut totals = EntityStats::default();
        for stats in self.entities.values() {
            totals += *stats;
        }
        totals
    }
}

/// Migration-wide counters, shared by every worker task.
///
/// Counters are atomics; failure details sit behind a mutex that is only
/// held for a push or a clone. Nothing is ever reset.
pub struct StatsCollector {
    started_at: DateTime<Utc>,
    counters: [Counters; EntityKind::COUNT],
    failures: Mutex<Vec<FailureRecord>>,
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StatsCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatsCollector")
            .field("started_at", &self.started_at)
            .field("totals", &self.snapshot().totals())
            .finish()
    }
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            counters: std::array::from_fn(|_| Counters::default()),
            failures: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    fn counters(&self, kind: EntityKind) -> &Counters {
        &self.counters[kind.index()]
    }

    pub fn record_attempt(&self, kind: EntityKind) {
        self.counters(kind).attempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self, kind: EntityKind) {
        self.counters(kind).succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skip(&self, kind: EntityKind) {
        self.counters(kind).skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(
        &self,
        kind: EntityKind,
        source_id: u64,
        project: Option<&str>,
        error: impl fmt::Display,
    ) {
        self.counters(kind).failed.fetch_add(1, Ordering::Relaxed);
        let record = FailureRecord {
            kind,
            source_id,
            project: project.map(str::to_string),
            error: error.to_string(),
            at: Utc::now(),
        };
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }

    pub fn entity(&self, kind: EntityKind) -> EntityStats {
        self.counters(kind).load()
    }

    pub fn failure_count(&self) -> usize {
        self.failures.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let entities = EntityKind::ALL
            .iter()
            .map(|&kind| (kind, self.entity(kind)))
            .filter(|(_, stats)| !stats.is_empty())
            .collect();
        let failures = self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        StatsSnapshot {
            started_at: self.started_at,
            generated_at: Utc::now(),
            entities,
            failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counters_are_tracked_per_kind() {
        let stats = StatsCollector::new();
        stats.record_attempt(EntityKind::Case);
        stats.record_attempt(EntityKind::Case);
        stats.record_success(EntityKind::Case);
        stats.record_failure(EntityKind::Case, 9, Some("DEMO"), "Validation error: bad");
        stats.record_skip(EntityKind::Milestone);

        let case = stats.entity(EntityKind::Case);
        assert_eq!(case.attempted, 2);
        assert_eq!(case.succeeded, 1);
        assert_eq!(case.failed, 1);
        assert_eq!(case.pending(), 0);

        assert_eq!(stats.entity(EntityKind::Milestone).skipped, 1);
        assert_eq!(stats.entity(EntityKind::Run), EntityStats::default());
        assert_eq!(stats.failure_count(), 1);
    }

    #[test]
    fn snapshot_omits_idle_kinds_and_keeps_failures() {
        let stats = StatsCollector::new();
        stats.record_attempt(EntityKind::User);
        stats.record_failure(EntityKind::User, 4, None, "boom");

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.entities.len(), 1);
        assert_eq!(snapshot.entity(EntityKind::User).failed, 1);
        assert_eq!(snapshot.entity(EntityKind::Case), EntityStats::default());
        assert_eq!(snapshot.failures.len(), 1);
        assert_eq!(snapshot.failures[0].source_id, 4);
        assert_eq!(snapshot.failures[0].project, None);
        assert_eq!(snapshot.failures[0].error, "boom");
    }

    #[test]
    fn snapshot_totals_sum_every_kind() {
        let stats = StatsCollector::new();
        for kind in [EntityKind::User, EntityKind::Project, EntityKind::Milestone] {
            stats.record_attempt(kind);
            stats.record_success(kind);
        }
        stats.record_skip(EntityKind::Project);

        let totals = stats.snapshot().totals();
        assert_eq!(totals.attempted, 3);
        assert_eq!(totals.succeeded, 3);
        assert_eq!(totals.skipped, 1);
    }

    #[test]
    fn snapshot_serializes_kinds_as_keys() {
        let stats = StatsCollector::new();
        stats.record_skip(EntityKind::CustomField);
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["entities"]["custom_field"]["skipped"], 1);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let stats = Arc::new(StatsCollector::new());
        std::thread::scope(|s| {
            for _ in 0..8 {
                let stats = Arc::clone(&stats);
                s.spawn(move || {
                    for i in 0..250 {
                        stats.record_attempt(EntityKind::Case);
                        if i % 50 == 0 {
                            stats.record_failure(EntityKind::Case, i, None, "x");
                        } else {
                            stats.record_success(EntityKind::Case);
                        }
                    }
                });
            }
        });

        let case = stats.entity(EntityKind::Case);
        assert_eq!(case.attempted, 2000);
        assert_eq!(case.failed, 40);
        assert_eq!(case.succeeded, 1960);
        assert_eq!(stats.failure_count(), 40);
    }
}
