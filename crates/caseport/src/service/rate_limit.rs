use std::num::NonZeroU32;
use std::sync::Arc;

use async_trait::async_trait;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use super::errors::Result;
use super::types::{AttachmentData, EntityKind, ListFilter, Page, SourceService};

/// Type alias for the governor rate limiter.
type GovernorRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// A standalone API rate limiter using the governor crate.
///
/// Smooths requests to a steady per-second rate. The destination pool uses a
/// strict sliding window instead (see [`crate::pool`]); this limiter is for
/// optional politeness caps on source reads.
#[derive(Clone)]
pub struct ApiRateLimiter {
    inner: Arc<GovernorRateLimiter>,
}

impl ApiRateLimiter {
    /// Create a new rate limiter with the specified requests per second.
    ///
    /// A rate of zero is treated as one request per second.
    pub fn new(requests_per_second: u32) -> Self {
        let rps = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        // A burst of one spaces every call out instead of admitting `rps` at once.
        let quota = Quota::per_second(rps).allow_burst(NonZeroU32::MIN);
        let rate_limiter = RateLimiter::direct(quota);

        Self {
            inner: Arc::new(rate_limiter),
        }
    }

    /// Wait until a request is allowed by the rate limiter.
    pub async fn wait(&self) {
        self.inner.until_ready().await;
    }
}

/// A rate-limited wrapper around any [`SourceService`].
///
/// Every call waits for the limiter before delegating to the inner service.
///
/// # Example
///
/// ```ignore
/// use caseport::service::RateLimitedSource;
///
/// let source = RateLimitedSource::new(testrail_client, 3);
/// let page = source.list_page(EntityKind::Project, &ListFilter::default(), 0).await?;
/// ```
pub struct RateLimitedSource<S> {
    inner: S,
    rate_limiter: ApiRateLimiter,
}

impl<S> RateLimitedSource<S> {
    pub fn new(inner: S, requests_per_second: u32) -> Self {
        Self {
            inner,
            rate_limiter: ApiRateLimiter::new(requests_per_second),
        }
    }

    /// Get a reference to the inner service.
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: Clone> Clone for RateLimitedSource<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            rate_limiter: self.rate_limiter.clone(),
        }
    }
}

#[async_trait]
impl<S: SourceService> SourceService for RateLimitedSource<S> {
    async fn list_page(
        &self,
        kind: EntityKind,
        filter: &ListFilter,
        offset: usize,
    ) -> Result<Page> {
        self.rate_limiter.wait().await;
        self.inner.list_page(kind, filter, offset).await
    }

    async fn fetch_attachment(&self, id: u64) -> Result<AttachmentData> {
        self.rate_limiter.wait().await;
        self.inner.fetch_attachment(id).await
    }
}
