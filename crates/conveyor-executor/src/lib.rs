//! Step execution backends for Conveyor.
//!
//! Ships the local process executor. Cluster-backed executors live
//! behind the same [`conveyor_core::executor::StepExecutor`] trait and
//! are wired in by the embedding service.

pub mod local;

pub use local::LocalProcessExecutor;
