//! Pipeline service: lifecycle façade over the queue, worker pool,
//! collector and status cache.
//!
//! Constructed once with every collaborator and option passed
//! explicitly; there is no global registry and no ambient
//! configuration.

use conveyor_core::executor::StepExecutor;
use conveyor_core::job::{JobRequest, PipelineJob, RunStatus};
use conveyor_core::log::LogEntry;
use conveyor_core::{Error, JobId, Result, StepId};
use conveyor_store::{JobStore, StoreError};
use futures::StreamExt;
use futures::stream::BoxStream;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::TtlCache;
use crate::collector::LogCollector;
use crate::queue::PipelineQueue;
use crate::worker::{CancelRegistry, RetryPolicy, WorkerContext, WorkerPool};

/// Every recognized option, passed once at construction.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Number of workers; bounds how many jobs run at once.
    pub worker_count: usize,
    /// Queue depth; bounds how many jobs can wait.
    pub queue_capacity: usize,
    /// How long `enqueue` waits for a free slot before failing with
    /// `QueueFull`.
    pub enqueue_timeout: Duration,
    /// TTL for cached job/step status.
    pub cache_ttl: Duration,
    /// Interval of the cache's background sweep (zero disables it).
    pub cache_sweep_interval: Duration,
    /// How long `shutdown` waits for in-flight jobs before cancelling
    /// them.
    pub shutdown_grace: Duration,
    /// Retry policy for executor infrastructure failures.
    pub retry: RetryPolicy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: 64,
            enqueue_timeout: Duration::from_secs(5),
            cache_ttl: Duration::from_secs(30),
            cache_sweep_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// Cached status of a job or a step, keyed by its UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachedStatus {
    Job(RunStatus),
    Step(RunStatus),
}

pub(crate) type StatusCache = TtlCache<Uuid, CachedStatus>;

const STATE_IDLE: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_STOPPED: u8 = 2;

const LOG_PAGE: u64 = 256;

/// Lifecycle façade exposed to the HTTP layer.
///
/// Must be constructed inside a Tokio runtime (the status cache runs a
/// background sweep task).
pub struct PipelineService {
    config: ServiceConfig,
    store: Arc<dyn JobStore>,
    executor: Arc<dyn StepExecutor>,
    queue: Arc<PipelineQueue>,
    cache: Arc<StatusCache>,
    collector: Arc<LogCollector>,
    cancellations: Arc<CancelRegistry>,
    state: AtomicU8,
    pool: Mutex<Option<WorkerPool>>,
}

impl PipelineService {
    pub fn new(
        config: ServiceConfig,
        store: Arc<dyn JobStore>,
        executor: Arc<dyn StepExecutor>,
    ) -> Self {
        let queue = Arc::new(PipelineQueue::new(config.queue_capacity));
        let cache = Arc::new(TtlCache::new(config.cache_sweep_interval));
        let collector = Arc::new(LogCollector::new(Arc::clone(&store)));
        Self {
            config,
            store,
            executor,
            queue,
            cache,
            collector,
            cancellations: Arc::new(CancelRegistry::new()),
            state: AtomicU8::new(STATE_IDLE),
            pool: Mutex::new(None),
        }
    }

    /// Spin up the worker pool and begin draining the queue. Not
    /// re-entrant: a second call (including after shutdown) errors.
    pub fn start(&self) -> Result<()> {
        self.state
            .compare_exchange(
                STATE_IDLE,
                STATE_RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|_| Error::AlreadyStarted)?;

        let ctx = Arc::new(WorkerContext {
            queue: Arc::clone(&self.queue),
            executor: Arc::clone(&self.executor),
            store: Arc::clone(&self.store),
            collector: Arc::clone(&self.collector),
            cache: Arc::clone(&self.cache),
            cancellations: Arc::clone(&self.cancellations),
            retry: self.config.retry,
        });
        let pool = WorkerPool::spawn(self.config.worker_count, ctx);

        let mut slot = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
        *slot = Some(pool);
        info!(workers = self.config.worker_count, "pipeline service started");
        Ok(())
    }

    /// Signal the pool and queue to stop, wait up to the grace period,
    /// and release the cache. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        if self.state.swap(STATE_STOPPED, Ordering::AcqRel) == STATE_STOPPED {
            return Ok(());
        }
        self.queue.close();

        let pool = {
            let mut slot = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
            slot.take()
        };
        if let Some(pool) = pool {
            pool.shutdown(&self.cancellations, self.config.shutdown_grace)
                .await;
        }

        self.cache.close();
        info!("pipeline service stopped");
        Ok(())
    }

    /// Accept a new job for execution. Blocks up to the configured
    /// enqueue timeout when the queue is full.
    pub async fn enqueue(&self, req: JobRequest) -> Result<JobId> {
        let job = PipelineJob::from_request(req);
        let job_id = job.id;

        // Record the job before it is visible to workers; failures here
        // degrade observability only.
        if let Err(e) = self.store.save_job(&job).await {
            warn!(job_id = %job_id, error = %e, "job record write failed at enqueue");
        }

        // Register the cancellation token up front so a job can be
        // cancelled while still queued.
        let _ = self.cancellations.token(job_id);

        match self.queue.enqueue(job, self.config.enqueue_timeout).await {
            Ok(()) => {
                info!(job_id = %job_id, "job enqueued");
                Ok(job_id)
            }
            Err(e) => {
                self.cancellations.remove(job_id);
                Err(e)
            }
        }
    }

    /// Current status of a job, served from the cache when fresh.
    pub async fn get_job_status(&self, id: JobId) -> Result<RunStatus> {
        if let Some(CachedStatus::Job(status)) = self.cache.get(id.as_uuid()) {
            return Ok(status);
        }
        let job = self.store.load_job(id).await.map_err(store_err)?;
        self.cache.set(
            *id.as_uuid(),
            CachedStatus::Job(job.status),
            self.config.cache_ttl,
        );
        Ok(job.status)
    }

    /// Current status of a step, served from the cache when fresh.
    pub async fn get_step_status(&self, id: StepId) -> Result<RunStatus> {
        if let Some(CachedStatus::Step(status)) = self.cache.get(id.as_uuid()) {
            return Ok(status);
        }
        let step = self.store.load_step(id).await.map_err(store_err)?;
        self.cache.set(
            *id.as_uuid(),
            CachedStatus::Step(step.status),
            self.config.cache_ttl,
        );
        Ok(step.status)
    }

    /// Lazy, finite stream of a step's log entries in append order,
    /// starting at `offset`. A caller can resume from any offset
    /// without missing or duplicating entries.
    pub fn stream_logs(&self, step_id: StepId, offset: u64) -> BoxStream<'static, Result<LogEntry>> {
        struct State {
            store: Arc<dyn JobStore>,
            step_id: StepId,
            offset: u64,
            buf: VecDeque<LogEntry>,
            done: bool,
        }

        let state = State {
            store: Arc::clone(&self.store),
            step_id,
            offset,
            buf: VecDeque::new(),
            done: false,
        };

        futures::stream::unfold(state, |mut st| async move {
            loop {
                if let Some(entry) = st.buf.pop_front() {
                    return Some((Ok(entry), st));
                }
                if st.done {
                    return None;
                }
                match st.store.list_log_entries(st.step_id, st.offset, LOG_PAGE).await {
                    Ok(page) => {
                        if (page.len() as u64) < LOG_PAGE {
                            st.done = true;
                        }
                        st.offset += page.len() as u64;
                        st.buf.extend(page);
                        if st.buf.is_empty() {
                            return None;
                        }
                    }
                    Err(e) => {
                        st.done = true;
                        return Some((Err(store_err(e)), st));
                    }
                }
            }
        })
        .boxed()
    }

    /// Request cancellation of a queued or running job. The owning
    /// worker resolves the job to a terminal Cancelled status.
    pub fn cancel(&self, job_id: JobId) -> Result<()> {
        if self.cancellations.cancel(job_id) {
            info!(job_id = %job_id, "cancellation requested");
            Ok(())
        } else {
            Err(Error::NotFound(format!("job {}", job_id)))
        }
    }

    /// Number of log entries lost to persistence failures since start.
    pub fn dropped_log_writes(&self) -> u64 {
        self.collector.dropped_writes()
    }
}

fn store_err(e: StoreError) -> Error {
    match e {
        StoreError::NotFound(what) => Error::NotFound(what),
        other => Error::Store(other.to_string()),
    }
}
