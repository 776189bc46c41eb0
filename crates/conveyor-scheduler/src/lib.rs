//! Pipeline execution core for Conveyor.
//!
//! Holds pending pipeline jobs in a bounded queue, drains them with a
//! fixed worker pool, collects executor output into ordered persisted
//! log entries, and fronts recently-read status with a TTL cache.

pub mod cache;
pub mod collector;
pub mod queue;
pub mod service;
pub mod worker;

pub use cache::TtlCache;
pub use collector::LogCollector;
pub use queue::PipelineQueue;
pub use service::{CachedStatus, PipelineService, ServiceConfig};
pub use worker::RetryPolicy;
