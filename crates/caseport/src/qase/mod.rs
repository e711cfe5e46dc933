//! Qase destination adapter.
//!
//! [`QaseClient`] implements [`DestinationService`](crate::service::DestinationService)
//! over the Qase v1 API. [`QaseScimClient`] implements
//! [`UserProvisioner`](crate::service::UserProvisioner) when a SCIM token is
//! configured.

mod client;
mod error;
mod scim;

pub use client::{QASE_API_URL, QaseClient};
pub use error::QaseError;
pub use scim::{QASE_SCIM_URL, QaseScimClient};
