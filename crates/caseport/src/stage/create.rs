use std::future::Future;
use std::sync::Arc;

use crate::mapping::StatsCollector;
use crate::migrate::{MigrationContext, MigrationProgress};
use crate::pool::Pools;
use crate::retry::with_retry;
use crate::service::{EntityKind, ServiceError, short_error_message};

use super::StageError;

/// One entity to create at the destination.
#[derive(Debug, Clone)]
pub(super) struct CreateJob<P> {
    pub(super) source_id: u64,
    pub(super) payload: P,
}

impl<P> CreateJob<P> {
    pub(super) fn new(source_id: u64, payload: P) -> Self {
        Self { source_id, payload }
    }
}

/// Count an already mapped entity as skipped.
pub(super) fn skip(
    ctx: &MigrationContext,
    stats: &StatsCollector,
    kind: EntityKind,
    source_id: u64,
    project: Option<&str>,
) {
    stats.record_skip(kind);
    ctx.emit(MigrationProgress::EntitySkipped {
        kind,
        source_id,
        project: project.map(str::to_string),
    });
}

/// Count an entity that failed before it could be submitted.
pub(super) fn fail(
    ctx: &MigrationContext,
    stats: &StatsCollector,
    kind: EntityKind,
    source_id: u64,
    project: Option<&str>,
    error: String,
) {
    stats.record_attempt(kind);
    stats.record_failure(kind, source_id, project, &error);
    tracing::warn!(kind = %kind, source_id, error = %error, "Entity import failed");
    ctx.emit(MigrationProgress::EntityFailed {
        kind,
        source_id,
        project: project.map(str::to_string),
        error,
    });
}

/// Create every job through the destination pool.
///
/// Each task calls `op` with the job payload (services are captured by the
/// closure), and on success stores the result with `record` and
/// counts the success; on failure it records the error and the remaining
/// jobs carry on. All handles are drained before returning, so every task
/// has finished by the time this resolves.
///
/// Returns per-job results in job order (`None` for failures).
#[allow(clippy::too_many_arguments)]
pub(super) async fn create_all<P, T, Op, Fut, Rec>(
    ctx: &MigrationContext,
    pools: &Pools,
    stats: &Arc<StatsCollector>,
    kind: EntityKind,
    project: Option<&str>,
    jobs: Vec<CreateJob<P>>,
    op: Op,
    record: Rec,
) -> Result<Vec<Option<T>>, StageError>
where
    P: Clone + Send + Sync + 'static,
    T: Send + 'static,
    Op: Fn(P) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<T, ServiceError>> + Send + 'static,
    Rec: Fn(u64, &T) + Clone + Send + Sync + 'static,
{
    if jobs.is_empty() {
        return Ok(Vec::new());
    }

    let project_code = project.map(str::to_string);
    let mut handles = Vec::with_capacity(jobs.len());
    let mut submit_error = None;

    for CreateJob { source_id, payload } in jobs {
        stats.record_attempt(kind);

        let retry = ctx.options().retry.clone();
        let progress = ctx.progress_handle();
        let stats_task = Arc::clone(stats);
        let project_task = project_code.clone();
        let op = op.clone();
        let record = record.clone();
        let pool = pools.destination().clone();

        let task = async move {
            // The first attempt used the slot taken at submission.
            let mut attempts = 0u32;
            let result = with_retry(
                || {
                    attempts += 1;
                    let retrying = attempts > 1;
                    let pool = pool.clone();
                    let call = op(payload.clone());
                    async move {
                        if retrying {
                            pool.throttle().await;
                        }
                        call.await
                    }
                },
                &retry,
                kind,
                source_id,
                progress.as_deref(),
            )
            .await;

            match result {
                Ok(value) => {
                    record(source_id, &value);
                    stats_task.record_success(kind);
                    Ok(value)
                }
                Err(e) => {
                    let message = short_error_message(&e);
                    stats_task.record_failure(kind, source_id, project_task.as_deref(), &message);
                    Err(message)
                }
            }
        };

        match pools.destination().submit(task).await {
            Ok(handle) => handles.push((source_id, handle)),
            Err(e) => {
                stats.record_failure(kind, source_id, project, &e);
                submit_error = Some(e);
                break;
            }
        }
    }

    let mut results = Vec::with_capacity(handles.len());
    for (source_id, handle) in handles {
        match handle.await {
            Ok(Ok(value)) => {
                ctx.emit(MigrationProgress::EntityCreated {
                    kind,
                    source_id,
                    project: project_code.clone(),
                });
                results.push(Some(value));
            }
            Ok(Err(error)) => {
                tracing::warn!(kind = %kind, source_id, error = %error, "Entity import failed");
                ctx.emit(MigrationProgress::EntityFailed {
                    kind,
                    source_id,
                    project: project_code.clone(),
                    error,
                });
                results.push(None);
            }
            Err(e) => {
                stats.record_failure(kind, source_id, project, &e);
                tracing::error!(kind = %kind, source_id, error = %e, "Import task crashed");
                ctx.emit(MigrationProgress::EntityFailed {
                    kind,
                    source_id,
                    project: project_code.clone(),
                    error: e.to_string(),
                });
                results.push(None);
            }
        }
    }

    match submit_error {
        Some(e) => Err(e.into()),
        None => Ok(results),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use tokio::time::Instant;

    use super::*;
    use crate::pool::PoolConfig;
    use crate::retry::RetryConfig;
    use crate::stage::test_support::{FakeDestination, FakeSource, harness};

    #[tokio::test(start_paused = true)]
    async fn retries_take_their_own_window_slot() {
        let interval = Duration::from_secs(10);
        let (ctx, _, mappings) = harness(FakeSource::new(), FakeDestination::new(), |options| {
            options.retry =
                RetryConfig::new(Duration::from_millis(10), Duration::from_millis(10), 5)
                    .with_jitter(false);
        });
        let pools = Pools::from_config(&PoolConfig {
            destination_requests: 2,
            destination_interval: interval,
            ..PoolConfig::default()
        });

        let calls = Arc::new(Mutex::new(Vec::new()));
        let failures_left = Arc::new(AtomicUsize::new(6));
        let op_calls = Arc::clone(&calls);
        let op = move |source_id: u64| {
            let calls = Arc::clone(&op_calls);
            let failures_left = Arc::clone(&failures_left);
            async move {
                calls.lock().unwrap().push(Instant::now());
                let failing = failures_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if failing {
                    Err(ServiceError::network("connection reset"))
                } else {
                    Ok(source_id)
                }
            }
        };

        let stats = Arc::clone(&mappings.stats);
        let jobs = vec![CreateJob::new(1, 1u64), CreateJob::new(2, 2u64)];
        let results = create_all(
            &ctx,
            &pools,
            &stats,
            EntityKind::Milestone,
            Some("AA"),
            jobs,
            op,
            |_, _: &u64| {},
        )
        .await
        .unwrap();

        assert_eq!(results, vec![Some(1), Some(2)]);
        assert_eq!(stats.entity(EntityKind::Milestone).succeeded, 2);

        let mut calls = calls.lock().unwrap().clone();
        calls.sort();
        assert_eq!(calls.len(), 8);
        for (i, &start) in calls.iter().enumerate() {
            let in_window = calls[i..]
                .iter()
                .take_while(|&&t| t.duration_since(start) < interval)
                .count();
            assert!(in_window <= 2, "{in_window} calls within {interval:?} of call {i}");
        }
    }
}
