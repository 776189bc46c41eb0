//! Core domain types and traits for the Conveyor execution core.
//!
//! This crate contains:
//! - Job and step identifiers
//! - Pipeline job, step and status types
//! - Log entry types
//! - The step executor trait consumed by the worker pool
//! - The shared error taxonomy

pub mod error;
pub mod executor;
pub mod id;
pub mod job;
pub mod log;

pub use error::{Error, Result};
pub use id::{JobId, StepId};
