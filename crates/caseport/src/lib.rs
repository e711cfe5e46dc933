//! Caseport - staged migration of test-management data.
//!
//! This library copies users, projects, suites, cases, runs and their
//! supporting entities from a TestRail instance into a Qase workspace. Work
//! is split into dependency-ordered stages that share an ID mapping store, so
//! later stages can resolve references created by earlier ones and a rerun
//! skips what already made it across.
//!
//! # Features
//!
//! - `testrail` - The TestRail source adapter ([`testrail::TestRailClient`]).
//! - `qase` - The Qase destination adapter and SCIM provisioner.
//!
//! # Example
//!
//! ```ignore
//! use caseport::migrate::{MigrationContext, MigrationOptions, Orchestrator};
//! use caseport::{Mappings, PoolConfig, Pools};
//!
//! let ctx = MigrationContext::builder()
//!     .source(source)
//!     .destination(destination)
//!     .options(MigrationOptions::default())
//!     .build()?;
//!
//! let mut orchestrator = Orchestrator::new(ctx, Pools::from_config(&PoolConfig::default()));
//! let report = orchestrator.run(Mappings::new(default_user)).await?;
//! println!("{} cases migrated", report.counts.cases);
//! ```

pub mod http;
pub mod mapping;
pub mod migrate;
pub mod pool;
pub mod retry;
pub mod service;
pub mod stage;

#[cfg(feature = "testrail")]
pub mod testrail;

#[cfg(feature = "qase")]
pub mod qase;

pub use mapping::{IdTable, MappingCounts, Mappings, StatsCollector, StatsSnapshot};
pub use migrate::{MigrationError, MigrationReport, MigrationState, Orchestrator};
pub use pool::{PoolConfig, PoolError, Pools, WorkerPool};
pub use retry::RetryConfig;
pub use service::{
    DestinationService, EntityKind, ServiceError, SourceService, UserProvisioner,
};
pub use stage::{StageError, StageKind};
