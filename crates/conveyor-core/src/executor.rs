//! Step executor trait and execution types.
//!
//! Executors run a single step's workload in an isolated environment
//! (process, container, pod) and hand its output back as raw byte
//! streams plus an exit future.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::{JobId, Result, StepId};

/// Specification for a single step execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    pub step_id: StepId,
    pub job_id: JobId,
    /// Container image, or an interpreter hint for local execution.
    pub image: String,
    /// Commands run in order; a nonzero exit aborts the rest.
    pub commands: Vec<String>,
    pub env: HashMap<String, String>,
    pub working_dir: Option<String>,
    /// Maximum execution time, enforced by the executor.
    pub timeout: Option<Duration>,
}

/// How a step's execution resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepExit {
    /// The workload exited with this code.
    Code(i32),
    /// Execution was cancelled before a code was produced.
    Cancelled,
}

/// Output surface of a running step.
///
/// The two byte streams are independently readable until closed; the
/// exit future resolves only after both streams have closed. Cancelling
/// the token passed to [`StepExecutor::run`] terminates the workload,
/// closes the streams and resolves the future with
/// [`StepExit::Cancelled`].
pub struct StepStreams {
    pub stdout: BoxStream<'static, std::io::Result<Bytes>>,
    pub stderr: BoxStream<'static, std::io::Result<Bytes>>,
    pub exit: BoxFuture<'static, StepExit>,
}

impl std::fmt::Debug for StepStreams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepStreams")
            .field("stdout", &"<stream>")
            .field("stderr", &"<stream>")
            .field("exit", &"<future>")
            .finish()
    }
}

/// Trait for step executors.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Start one step. An `Err` here means the executor failed before
    /// producing streams (an infrastructure failure); step failures
    /// surface through the exit future instead.
    async fn run(&self, cancel: CancellationToken, spec: StepSpec) -> Result<StepStreams>;
}
