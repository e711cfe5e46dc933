//! TestRail source adapter.
//!
//! Implements [`SourceService`](crate::service::SourceService) over the
//! TestRail v2 API.
//!
//! ```ignore
//! use caseport::testrail::TestRailClient;
//!
//! let client = TestRailClient::new("https://example.testrail.io", "me@example.com", "api-key")?;
//! ```

mod client;
mod error;

pub use client::{PAGE_LIMIT, TestRailClient};
pub use error::TestRailError;
