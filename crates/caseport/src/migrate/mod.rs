//! Migration orchestration.
//!
//! # Module Structure
//!
//! - [`context`] - `MigrationContext`: services, options and progress observer
//! - [`types`] - `MigrationOptions`, `StageToggles`
//! - [`progress`] - Progress reporting: `MigrationProgress`, `ProgressCallback`, `emit()`
//! - [`orchestrator`] - `Orchestrator`: global stages, then the per-project loop
//! - [`report`] - Statistics checkpoints: `ReportSink`, `JsonReportSink`
//!
//! # Example
//!
//! ```ignore
//! use caseport::mapping::Mappings;
//! use caseport::migrate::{JsonReportSink, MigrationContext, Orchestrator};
//! use caseport::pool::{PoolConfig, Pools};
//!
//! let ctx = MigrationContext::builder()
//!     .source(testrail)
//!     .destination(qase)
//!     .build()?;
//! let mut orchestrator = Orchestrator::new(ctx, Pools::from_config(&PoolConfig::default()))
//!     .with_sink(JsonReportSink::new(".", "caseport"));
//! let report = orchestrator.run(Mappings::new(default_user)).await?;
//! orchestrator.pools().shutdown().await;
//! ```

pub mod context;
pub mod orchestrator;
mod progress;
pub mod report;
mod types;

pub use context::{ContextError, MigrationContext, MigrationContextBuilder};
pub use orchestrator::{
    FINAL_CHECKPOINT, MigrationError, MigrationReport, MigrationState, Orchestrator,
};
pub use progress::{MigrationProgress, ProgressCallback, emit};
pub use report::{JsonReportSink, ReportError, ReportSink};
pub use types::{DEFAULT_REPORT_PREFIX, MigrationOptions, StageToggles};
