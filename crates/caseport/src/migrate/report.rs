//! Statistics checkpoints.
//!
//! The orchestrator hands a [`StatsSnapshot`] to every registered
//! [`ReportSink`] after each project and once more at the end. Sink
//! failures are logged and never abort the migration.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

use crate::mapping::StatsSnapshot;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write report {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Sink-specific failure.
    #[error("{0}")]
    Other(String),
}

/// Receives statistics checkpoints.
pub trait ReportSink: Send + Sync {
    /// Persist `snapshot`. `label` identifies the checkpoint, e.g. the
    /// project code just finished or `final`.
    fn save(&self, label: &str, snapshot: &StatsSnapshot) -> Result<(), ReportError>;
}

#[derive(Serialize)]
struct ReportDocument<'a> {
    label: &'a str,
    stats: &'a StatsSnapshot,
}

/// Writes the latest checkpoint to `<dir>/<prefix>_stats.json`,
/// replacing the previous one.
#[derive(Debug, Clone)]
pub struct JsonReportSink {
    path: PathBuf,
}

impl JsonReportSink {
    pub fn new(dir: impl AsRef<Path>, prefix: &str) -> Self {
        Self {
            path: dir.as_ref().join(format!("{prefix}_stats.json")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ReportSink for JsonReportSink {
    fn save(&self, label: &str, snapshot: &StatsSnapshot) -> Result<(), ReportError> {
        let body = serde_json::to_vec_pretty(&ReportDocument {
            label,
            stats: snapshot,
        })?;

        // Write to a sibling file first so a crash never leaves a torn report.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, body).map_err(|source| ReportError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &self.path).map_err(|source| ReportError::Io {
            path: self.path.clone(),
            source,
        })?;

        tracing::debug!(path = %self.path.display(), label, "Wrote statistics report");
        Ok(())
    }
}
