//! Persisted log entry types.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::StepId;

/// The stream (or side channel) a log entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Stdout,
    Stderr,
    /// The step's final exit code, written once per step.
    ExitCode,
    /// Structured status updates from the executor side channel.
    Metadata,
    Progress,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogKind::Stdout => "stdout",
            LogKind::Stderr => "stderr",
            LogKind::ExitCode => "exit_code",
            LogKind::Metadata => "metadata",
            LogKind::Progress => "progress",
        }
    }
}

impl std::fmt::Display for LogKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LogKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(LogKind::Stdout),
            "stderr" => Ok(LogKind::Stderr),
            "exit_code" => Ok(LogKind::ExitCode),
            "metadata" => Ok(LogKind::Metadata),
            "progress" => Ok(LogKind::Progress),
            _ => Err(format!("unknown log kind: {}", s)),
        }
    }
}

/// One persisted, typed record of a step's output.
///
/// For a fixed `(step_id, kind)` the `line` values are strictly
/// increasing with no gaps, starting at 0. Entries of different kinds
/// are ordered against each other only by wall-clock `time`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub step_id: StepId,
    /// Wall-clock write instant, the only cross-stream ordering.
    pub time: DateTime<Utc>,
    /// Per-(step, kind) line counter.
    pub line: u64,
    pub payload: Bytes,
    pub kind: LogKind,
    pub created_at: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(step_id: StepId, kind: LogKind, line: u64, payload: Bytes) -> Self {
        let now = Utc::now();
        Self {
            step_id,
            time: now,
            line,
            payload,
            kind,
            created_at: now,
        }
    }

    /// Payload as UTF-8, replacing invalid sequences.
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}
