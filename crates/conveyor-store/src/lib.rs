//! Persistence layer for Conveyor.
//!
//! Defines the `JobStore` trait consumed by the execution core, plus an
//! in-memory adapter (tests, local runs) and a PostgreSQL adapter.

pub mod error;
pub mod memory;
pub mod postgres;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use conveyor_core::job::{PipelineJob, Step};
use conveyor_core::log::LogEntry;
use conveyor_core::{JobId, StepId};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Durable store for job/step metadata and log entries.
///
/// Log entries are append-only; jobs and steps are written by a single
/// owner at a time (the enqueuing service, then the worker that owns the
/// job).
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn save_job(&self, job: &PipelineJob) -> StoreResult<()>;

    async fn save_step(&self, step: &Step) -> StoreResult<()>;

    async fn append_log_entry(&self, entry: &LogEntry) -> StoreResult<()>;

    async fn load_job(&self, id: JobId) -> StoreResult<PipelineJob>;

    async fn load_step(&self, id: StepId) -> StoreResult<Step>;

    /// Log entries for a step in append order, starting at `offset`,
    /// at most `limit` entries. Append order is stable, so a caller can
    /// resume from any offset without missing or duplicating entries.
    async fn list_log_entries(
        &self,
        step_id: StepId,
        offset: u64,
        limit: u64,
    ) -> StoreResult<Vec<LogEntry>>;
}

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str) -> StoreResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> StoreResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
