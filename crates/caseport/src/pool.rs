//! Bounded worker pools.
//!
//! A [`WorkerPool`] runs submitted futures on the tokio runtime with at most
//! `max_workers` of them in flight. A rate-limited pool additionally admits no
//! more than `requests` dispatches in any rolling `interval`. [`Pools`] bundles
//! the two pools a migration uses: a throttled one for destination writes and
//! an unthrottled one for source reads.
//!
//! # Example
//!
//! ```ignore
//! use caseport::pool::{PoolConfig, Pools};
//!
//! let pools = Pools::from_config(&PoolConfig::default());
//! let handle = pools.destination().submit(async { 42 }).await?;
//! assert_eq!(handle.await?, 42);
//! pools.shutdown().await;
//! ```

mod window;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};

pub use window::RateWindow;
use window::SlidingWindow;

/// Errors surfaced by a worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool has been shut down and accepts no new work.
    #[error("worker pool '{pool}' is closed")]
    Closed { pool: String },

    /// The submitted task panicked.
    #[error("task in pool '{pool}' panicked: {message}")]
    TaskPanicked { pool: String, message: String },

    /// The task was aborted before completing.
    #[error("task in pool '{pool}' was cancelled")]
    TaskCancelled { pool: String },
}

impl PoolError {
    fn from_join(pool: &str, err: JoinError) -> Self {
        if err.is_panic() {
            let payload = err.into_panic();
            let message = if let Some(s) = payload.downcast_ref::<&str>() {
                (*s).to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic".to_string()
            };
            Self::TaskPanicked {
                pool: pool.to_string(),
                message,
            }
        } else {
            Self::TaskCancelled {
                pool: pool.to_string(),
            }
        }
    }
}

struct PoolInner {
    name: Arc<str>,
    max_workers: usize,
    permits: Arc<Semaphore>,
    window: Option<SlidingWindow>,
    closed: AtomicBool,
    submitted: AtomicU64,
}

/// Bounded-concurrency executor, optionally rate limited.
///
/// Cloning is cheap; clones share workers, window and lifecycle.
#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.inner.name)
            .field("max_workers", &self.inner.max_workers)
            .field("window", &self.inner.window.as_ref().map(SlidingWindow::limit))
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl WorkerPool {
    /// Create an unthrottled pool. A worker count of zero is raised to one.
    pub fn new(name: impl Into<String>, max_workers: usize) -> Self {
        Self::build(name.into(), max_workers, None)
    }

    /// Create a pool that also enforces a sliding dispatch window.
    pub fn rate_limited(name: impl Into<String>, max_workers: usize, window: RateWindow) -> Self {
        Self::build(name.into(), max_workers, Some(SlidingWindow::new(window)))
    }

    fn build(name: String, max_workers: usize, window: Option<SlidingWindow>) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            inner: Arc::new(PoolInner {
                name: Arc::from(name),
                max_workers,
                permits: Arc::new(Semaphore::new(max_workers)),
                window,
                closed: AtomicBool::new(false),
                submitted: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn max_workers(&self) -> usize {
        self.inner.max_workers
    }

    pub fn rate_window(&self) -> Option<RateWindow> {
        self.inner.window.as_ref().map(SlidingWindow::limit)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Total number of tasks dispatched so far.
    pub fn submitted(&self) -> u64 {
        self.inner.submitted.load(Ordering::Relaxed)
    }

    /// Tasks currently holding a worker slot.
    pub fn in_flight(&self) -> usize {
        self.inner
            .max_workers
            .saturating_sub(self.inner.permits.available_permits())
    }

    /// Dispatch `task` once a worker slot and, if throttled, a window slot
    /// are free.
    ///
    /// Suspends the caller while the pool is saturated. The returned handle
    /// must be awaited; dropping it detaches the task.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Closed`] after [`WorkerPool::shutdown`].
    pub async fn submit<F, T>(&self, task: F) -> Result<TaskHandle<T>, PoolError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_closed() {
            return Err(self.closed_error());
        }

        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| self.closed_error())?;

        self.throttle().await;

        self.inner.submitted.fetch_add(1, Ordering::Relaxed);

        let handle = tokio::spawn(async move {
            let _permit = permit;
            task.await
        });

        Ok(TaskHandle {
            pool: Arc::clone(&self.inner.name),
            handle,
        })
    }

    /// Take a window slot without dispatching a task.
    ///
    /// Work running inside a task that makes a further call against the
    /// throttled service (a retry) must pass through here first. No-op on an
    /// unthrottled pool.
    pub(crate) async fn throttle(&self) {
        if let Some(window) = &self.inner.window {
            let waited = window.acquire().await;
            if !waited.is_zero() {
                tracing::debug!(
                    pool = %self.inner.name,
                    waited_ms = waited.as_millis() as u64,
                    "Rate window full, call delayed"
                );
            }
        }
    }

    /// Submit `task` and wait for its output.
    pub async fn run<F, T>(&self, task: F) -> Result<T, PoolError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.submit(task).await?.await
    }

    /// Stop accepting work and wait for every in-flight task.
    ///
    /// Idempotent; only the first call waits.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let workers = u32::try_from(self.inner.max_workers).unwrap_or(u32::MAX);
        // Callers already queued on the semaphore are served first (FIFO).
        let drained = self.inner.permits.acquire_many(workers).await;
        self.inner.permits.close();
        drop(drained);

        tracing::debug!(
            pool = %self.inner.name,
            submitted = self.submitted(),
            "Worker pool shut down"
        );
    }

    fn closed_error(&self) -> PoolError {
        PoolError::Closed {
            pool: self.inner.name.to_string(),
        }
    }
}

/// Future resolving to a submitted task's output.
///
/// A panic inside the task resolves to [`PoolError::TaskPanicked`] instead of
/// propagating.
#[derive(Debug)]
pub struct TaskHandle<T> {
    pool: Arc<str>,
    handle: JoinHandle<T>,
}

impl<T> TaskHandle<T> {
    /// Abort the task. Awaiting the handle afterwards yields
    /// [`PoolError::TaskCancelled`] unless it already finished.
    pub fn abort(&self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, PoolError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match Pin::new(&mut this.handle).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(value)) => Poll::Ready(Ok(value)),
            Poll::Ready(Err(e)) => Poll::Ready(Err(PoolError::from_join(&this.pool, e))),
        }
    }
}

/// Sizing for the two migration pools.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub destination_workers: usize,
    pub destination_requests: usize,
    pub destination_interval: Duration,
    pub source_workers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            destination_workers: 8,
            destination_requests: 230,
            destination_interval: Duration::from_secs(10),
            source_workers: 16,
        }
    }
}

/// The throttled destination pool and the unthrottled source pool.
///
/// Built once per process and handed to every stage.
#[derive(Debug, Clone)]
pub struct Pools {
    destination: WorkerPool,
    source: WorkerPool,
}

impl Pools {
    pub fn from_config(config: &PoolConfig) -> Self {
        let window = RateWindow::new(config.destination_requests, config.destination_interval);
        Self {
            destination: WorkerPool::rate_limited(
                "destination",
                config.destination_workers,
                window,
            ),
            source: WorkerPool::new("source", config.source_workers),
        }
    }

    pub fn destination(&self) -> &WorkerPool {
        &self.destination
    }

    pub fn source(&self) -> &WorkerPool {
        &self.source
    }

    /// Shut down both pools, draining in-flight work.
    pub async fn shutdown(&self) {
        tokio::join!(self.destination.shutdown(), self.source.shutdown());
    }
}
