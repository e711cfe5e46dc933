//! Collaborator interfaces for the two platforms.
//!
//! The migration core only talks to platforms through the traits defined
//! here: [`SourceService`] for reads, [`DestinationService`] for writes and
//! [`UserProvisioner`] for optional account creation. Concrete adapters live
//! in the `testrail` and `qase` modules.
//!
//! # Example
//!
//! ```ignore
//! use caseport::service::{EntityKind, ListFilter, SourceService};
//!
//! async fn count_projects<S: SourceService>(source: &S) -> Result<usize, ServiceError> {
//!     let page = source.list_page(EntityKind::Project, &ListFilter::default(), 0).await?;
//!     Ok(page.items.len())
//! }
//! ```

mod errors;
mod rate_limit;
mod types;

pub use errors::{Result, ServiceError, short_error_message};
pub use rate_limit::{ApiRateLimiter, RateLimitedSource};
pub use types::{
    AttachedTo, AttachmentData, AttachmentRef, DestinationField, DestinationService,
    DestinationUser, DisabledProvisioner, EntityKind, EntityRecord, ListFilter, Page,
    SourceService, UserProvisioner,
};
