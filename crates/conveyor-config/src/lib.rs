//! KDL configuration parsing for Conveyor.
//!
//! This crate handles parsing of:
//! - Pipeline definitions (conveyor.kdl)
//! - Variable interpolation for step commands and environment

pub mod error;
pub mod pipeline;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use pipeline::parse_pipeline;
pub use variables::{GitContext, JobContext, StepContext, VariableContext, VariableContextBuilder};
