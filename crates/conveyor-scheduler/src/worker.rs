//! Worker pool draining the pipeline queue.
//!
//! Each worker owns one job at a time: ownership transfers at dequeue
//! and never changes. Steps run strictly in declared order and a
//! failure aborts the rest of the job. A single job's failure never
//! terminates the worker loop.

use chrono::Utc;
use conveyor_config::VariableContextBuilder;
use conveyor_core::JobId;
use conveyor_core::executor::{StepExecutor, StepExit, StepSpec, StepStreams};
use conveyor_core::job::{PipelineJob, RunStatus, Step};
use conveyor_core::log::LogKind;
use conveyor_store::JobStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collector::LogCollector;
use crate::queue::PipelineQueue;
use crate::service::StatusCache;

/// Retry policy for executor infrastructure failures.
///
/// Attempt `n` (1-based) is followed by a `backoff * 2^(n-1)` delay
/// before the next try. Step failures (nonzero exit) are never retried.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.backoff * (1u32 << exp)
    }
}

/// Cancellation tokens for queued and running jobs, shared between the
/// service (which registers and cancels) and the workers (which observe
/// and propagate).
#[derive(Default)]
pub(crate) struct CancelRegistry {
    inner: Mutex<HashMap<JobId, CancellationToken>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for a job, created on first use.
    pub fn token(&self, job_id: JobId) -> CancellationToken {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.entry(job_id).or_default().clone()
    }

    /// Cancel a job's token. Returns false if the job is unknown
    /// (never enqueued, or already finished).
    pub fn cancel(&self, job_id: JobId) -> bool {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match inner.get(&job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, job_id: JobId) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.remove(&job_id);
    }

    pub fn cancel_all(&self) {
        let inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        for token in inner.values() {
            token.cancel();
        }
    }
}

/// Everything a worker needs, wired explicitly at pool construction.
pub(crate) struct WorkerContext {
    pub queue: Arc<PipelineQueue>,
    pub executor: Arc<dyn StepExecutor>,
    pub store: Arc<dyn JobStore>,
    pub collector: Arc<LogCollector>,
    pub cache: Arc<StatusCache>,
    pub cancellations: Arc<CancelRegistry>,
    pub retry: RetryPolicy,
}

pub(crate) struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn spawn(worker_count: usize, ctx: Arc<WorkerContext>) -> Self {
        let shutdown = CancellationToken::new();
        let handles = (0..worker_count.max(1))
            .map(|worker_id| {
                let ctx = Arc::clone(&ctx);
                let shutdown = shutdown.clone();
                tokio::spawn(worker_loop(worker_id, ctx, shutdown))
            })
            .collect();
        Self { handles, shutdown }
    }

    /// Stop dequeuing and wait up to `grace` for in-flight jobs. When
    /// the grace period elapses first, cancel the remaining jobs and
    /// return; the caller treats anything still draining as abandoned.
    pub async fn shutdown(self, cancellations: &CancelRegistry, grace: Duration) {
        self.shutdown.cancel();
        let drain = futures::future::join_all(self.handles);
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("shutdown grace period elapsed, cancelling in-flight jobs");
            cancellations.cancel_all();
        }
    }
}

async fn worker_loop(worker_id: usize, ctx: Arc<WorkerContext>, shutdown: CancellationToken) {
    debug!(worker_id, "worker started");
    loop {
        let job = tokio::select! {
            biased;
            _ = shutdown.cancelled() => None,
            job = ctx.queue.dequeue() => job,
        };
        let Some(job) = job else { break };

        info!(worker_id, job_id = %job.id, name = %job.name, "picked up job");
        run_job(&ctx, job).await;
    }
    debug!(worker_id, "worker stopped");
}

/// Execute one job to completion. All failures resolve into job/step
/// status; nothing propagates out of this function.
async fn run_job(ctx: &WorkerContext, mut job: PipelineJob) {
    let cancel = ctx.cancellations.token(job.id);

    if cancel.is_cancelled() {
        // Cancelled while still queued.
        job.status = RunStatus::Cancelled;
        job.finished_at = Some(Utc::now());
        persist_job(ctx, &job).await;
        ctx.cancellations.remove(job.id);
        info!(job_id = %job.id, "job cancelled before start");
        return;
    }

    job.status = RunStatus::Running;
    job.started_at = Some(Utc::now());
    persist_job(ctx, &job).await;

    for idx in 0..job.steps.len() {
        if cancel.is_cancelled() {
            break;
        }

        let mut step = job.steps[idx].clone();
        execute_step(ctx, &job, &mut step, &cancel).await;
        let status = step.status;
        job.steps[idx] = step;

        if status != RunStatus::Succeeded {
            // Fail-fast: remaining steps stay Queued, they never start.
            break;
        }
    }

    let aggregated = PipelineJob::aggregate_status(&job.steps);
    job.status = if aggregated.is_terminal() {
        aggregated
    } else {
        // Cancellation hit before any step produced a terminal status.
        RunStatus::Cancelled
    };
    job.finished_at = Some(Utc::now());
    persist_job(ctx, &job).await;
    ctx.cancellations.remove(job.id);

    info!(job_id = %job.id, status = %job.status, "job finished");
}

/// Run a single step: acquire streams (with retries for infrastructure
/// failures), collect its output, and finalize its status.
async fn execute_step(
    ctx: &WorkerContext,
    job: &PipelineJob,
    step: &mut Step,
    cancel: &CancellationToken,
) {
    step.status = RunStatus::Running;
    step.started_at = Some(Utc::now());
    persist_step(ctx, step).await;
    ctx.collector
        .write_event(
            step.id,
            LogKind::Progress,
            format!("step {} started", step.name),
        )
        .await;

    let spec = build_spec(job, step);

    match acquire_streams(ctx, step, &spec, cancel).await {
        Acquired::Streams(streams) => match ctx.collector.collect(step.id, streams).await {
            StepExit::Code(code) => {
                step.exit_code = Some(code);
                step.status = if code == 0 {
                    RunStatus::Succeeded
                } else {
                    RunStatus::Failed
                };
            }
            StepExit::Cancelled => {
                step.status = RunStatus::Cancelled;
            }
        },
        Acquired::Cancelled => {
            step.status = RunStatus::Cancelled;
        }
        Acquired::Exhausted => {
            step.status = RunStatus::Failed;
        }
    }

    step.finished_at = Some(Utc::now());
    persist_step(ctx, step).await;
    debug!(step_id = %step.id, status = %step.status, "step finished");
}

enum Acquired {
    Streams(StepStreams),
    Cancelled,
    Exhausted,
}

async fn acquire_streams(
    ctx: &WorkerContext,
    step: &Step,
    spec: &StepSpec,
    cancel: &CancellationToken,
) -> Acquired {
    let mut attempt = 1u32;
    loop {
        match ctx.executor.run(cancel.child_token(), spec.clone()).await {
            Ok(streams) => return Acquired::Streams(streams),
            Err(e) => {
                warn!(step_id = %step.id, attempt, error = %e, "executor infrastructure failure");
                if attempt >= ctx.retry.max_attempts {
                    ctx.collector
                        .write_event(
                            step.id,
                            LogKind::Metadata,
                            format!("infrastructure failure after {} attempts: {}", attempt, e),
                        )
                        .await;
                    return Acquired::Exhausted;
                }
                ctx.collector
                    .write_event(
                        step.id,
                        LogKind::Metadata,
                        format!("attempt {} failed: {}; retrying", attempt, e),
                    )
                    .await;
                tokio::select! {
                    _ = cancel.cancelled() => return Acquired::Cancelled,
                    _ = tokio::time::sleep(ctx.retry.delay(attempt)) => {}
                }
                attempt += 1;
            }
        }
    }
}

fn build_spec(job: &PipelineJob, step: &Step) -> StepSpec {
    // Job-level env first, step-level overrides.
    let mut merged_env = job.env.clone();
    merged_env.extend(step.env.clone());

    let mut var_ctx = VariableContextBuilder::new()
        .with_git_sha(&job.source.sha)
        .with_git_branch(job.source.branch.clone().unwrap_or_default())
        .with_job(job.id.to_string(), &job.name, job.trigger.as_str())
        .with_step(&step.name, step.index as usize)
        .build();
    var_ctx.env = merged_env.clone();

    StepSpec {
        step_id: step.id,
        job_id: job.id,
        image: var_ctx.interpolate(&step.image),
        commands: var_ctx.interpolate_vec(&step.commands),
        env: var_ctx.interpolate_map(&merged_env),
        working_dir: None,
        timeout: None,
    }
}

/// Best-effort persistence: a write failure degrades observability but
/// never fails the pipeline. The cache entry is invalidated either way
/// so readers fall back to the store.
async fn persist_job(ctx: &WorkerContext, job: &PipelineJob) {
    if let Err(e) = ctx.store.save_job(job).await {
        warn!(job_id = %job.id, error = %e, "job state write failed");
    }
    ctx.cache.delete(job.id.as_uuid());
}

async fn persist_step(ctx: &WorkerContext, step: &Step) {
    if let Err(e) = ctx.store.save_step(step).await {
        warn!(step_id = %step.id, error = %e, "step state write failed");
    }
    ctx.cache.delete(step.id.as_uuid());
    ctx.cache.delete(step.job_id.as_uuid());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_doubles() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff: Duration::from_millis(100),
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
    }

    #[test]
    fn test_cancel_registry_round_trip() {
        let registry = CancelRegistry::new();
        let job_id = JobId::new();

        let token = registry.token(job_id);
        assert!(!token.is_cancelled());

        assert!(registry.cancel(job_id));
        assert!(token.is_cancelled());

        registry.remove(job_id);
        assert!(!registry.cancel(job_id));
    }

    #[test]
    fn test_cancel_all() {
        let registry = CancelRegistry::new();
        let a = registry.token(JobId::new());
        let b = registry.token(JobId::new());

        registry.cancel_all();
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
    }
}
