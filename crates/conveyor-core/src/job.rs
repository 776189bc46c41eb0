//! Pipeline job and step definitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{JobId, StepId};

/// Status of a job or step.
///
/// The lifecycle is monotonic: once a terminal status is reached, no
/// further transitions are allowed, and nothing ever moves back to
/// `Queued`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Waiting in the queue (or, for a step, waiting for its turn).
    Queued,
    /// Currently executing.
    Running,
    /// Completed successfully.
    Succeeded,
    /// Failed.
    Failed,
    /// Cancelled before completion.
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Whether moving from `self` to `next` respects the monotonic
    /// lifecycle.
    pub fn can_transition(&self, next: RunStatus) -> bool {
        if self.is_terminal() || next == *self {
            return false;
        }
        // No path leads back to Queued.
        next != RunStatus::Queued
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(RunStatus::Queued),
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            _ => Err(format!("unknown status: {}", s)),
        }
    }
}

/// What triggered a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Push,
    Tag,
    Schedule,
    Manual,
    Api,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Push => "push",
            Trigger::Tag => "tag",
            Trigger::Schedule => "schedule",
            Trigger::Manual => "manual",
            Trigger::Api => "api",
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(Trigger::Push),
            "tag" => Ok(Trigger::Tag),
            "schedule" => Ok(Trigger::Schedule),
            "manual" => Ok(Trigger::Manual),
            "api" => Ok(Trigger::Api),
            _ => Err(format!("unknown trigger: {}", s)),
        }
    }
}

/// Repository and commit a job builds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitSource {
    pub repo_url: String,
    pub sha: String,
    pub branch: Option<String>,
}

/// One end-to-end execution of a pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineJob {
    pub id: JobId,
    pub name: String,
    pub source: GitSource,
    pub trigger: Trigger,
    /// Environment shared by every step, merged under step-level env.
    pub env: HashMap<String, String>,
    /// Steps in execution order.
    pub steps: Vec<Step>,
    pub status: RunStatus,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineJob {
    /// Build a queued job from an enqueue request, assigning fresh ids
    /// and timestamps.
    pub fn from_request(req: JobRequest) -> Self {
        let job_id = JobId::new();
        let steps = req
            .steps
            .into_iter()
            .enumerate()
            .map(|(index, s)| Step {
                id: StepId::new(),
                job_id,
                index: index as u32,
                name: s.name,
                image: s.image,
                commands: s.commands,
                env: s.env,
                status: RunStatus::Queued,
                exit_code: None,
                started_at: None,
                finished_at: None,
            })
            .collect();

        Self {
            id: job_id,
            name: req.name,
            source: req.source,
            trigger: req.trigger,
            env: req.env,
            steps,
            status: RunStatus::Queued,
            queued_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Aggregate a job status from its steps: any Failed wins, then any
    /// Cancelled, then all-Succeeded; otherwise the job is still in
    /// flight.
    pub fn aggregate_status(steps: &[Step]) -> RunStatus {
        if steps.iter().any(|s| s.status == RunStatus::Failed) {
            return RunStatus::Failed;
        }
        if steps.iter().any(|s| s.status == RunStatus::Cancelled) {
            return RunStatus::Cancelled;
        }
        if steps.iter().all(|s| s.status == RunStatus::Succeeded) {
            return RunStatus::Succeeded;
        }
        if steps.iter().any(|s| s.status == RunStatus::Running) {
            return RunStatus::Running;
        }
        RunStatus::Queued
    }
}

/// One unit of work within a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub job_id: JobId,
    /// Position in the job's execution order.
    pub index: u32,
    pub name: String,
    /// Container image (or shell for local execution).
    pub image: String,
    pub commands: Vec<String>,
    pub env: HashMap<String, String>,
    pub status: RunStatus,
    /// Set only on completion.
    pub exit_code: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Request to enqueue a new job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub name: String,
    pub source: GitSource,
    pub trigger: Trigger,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub steps: Vec<StepRequest>,
}

/// One step of an enqueue request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRequest {
    pub name: String,
    pub image: String,
    pub commands: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(status: RunStatus) -> Step {
        Step {
            id: StepId::new(),
            job_id: JobId::new(),
            index: 0,
            name: "build".to_string(),
            image: "alpine".to_string(),
            commands: vec!["true".to_string()],
            env: HashMap::new(),
            status,
            exit_code: None,
            started_at: None,
            finished_at: None,
        }
    }

    #[test]
    fn test_terminal_statuses_never_transition() {
        for terminal in [RunStatus::Succeeded, RunStatus::Failed, RunStatus::Cancelled] {
            for next in [
                RunStatus::Queued,
                RunStatus::Running,
                RunStatus::Succeeded,
                RunStatus::Failed,
                RunStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition(next));
            }
        }
    }

    #[test]
    fn test_no_transition_back_to_queued() {
        assert!(!RunStatus::Running.can_transition(RunStatus::Queued));
    }

    #[test]
    fn test_forward_transitions_allowed() {
        assert!(RunStatus::Queued.can_transition(RunStatus::Running));
        assert!(RunStatus::Queued.can_transition(RunStatus::Cancelled));
        assert!(RunStatus::Running.can_transition(RunStatus::Succeeded));
        assert!(RunStatus::Running.can_transition(RunStatus::Failed));
        assert!(RunStatus::Running.can_transition(RunStatus::Cancelled));
    }

    #[test]
    fn test_aggregate_failed_wins() {
        let steps = vec![
            step(RunStatus::Succeeded),
            step(RunStatus::Failed),
            step(RunStatus::Queued),
        ];
        assert_eq!(PipelineJob::aggregate_status(&steps), RunStatus::Failed);
    }

    #[test]
    fn test_aggregate_cancelled() {
        let steps = vec![step(RunStatus::Succeeded), step(RunStatus::Cancelled)];
        assert_eq!(PipelineJob::aggregate_status(&steps), RunStatus::Cancelled);
    }

    #[test]
    fn test_aggregate_all_succeeded() {
        let steps = vec![step(RunStatus::Succeeded), step(RunStatus::Succeeded)];
        assert_eq!(PipelineJob::aggregate_status(&steps), RunStatus::Succeeded);
    }

    #[test]
    fn test_aggregate_in_flight() {
        let steps = vec![step(RunStatus::Succeeded), step(RunStatus::Running)];
        assert_eq!(PipelineJob::aggregate_status(&steps), RunStatus::Running);
    }

    #[test]
    fn test_from_request_assigns_order() {
        let req = JobRequest {
            name: "ci".to_string(),
            source: GitSource::default(),
            trigger: Trigger::Manual,
            env: HashMap::new(),
            steps: vec![
                StepRequest {
                    name: "test".to_string(),
                    image: "rust:1.85".to_string(),
                    commands: vec!["cargo test".to_string()],
                    env: HashMap::new(),
                },
                StepRequest {
                    name: "build".to_string(),
                    image: "rust:1.85".to_string(),
                    commands: vec!["cargo build".to_string()],
                    env: HashMap::new(),
                },
            ],
        };

        let job = PipelineJob::from_request(req);
        assert_eq!(job.status, RunStatus::Queued);
        assert_eq!(job.steps.len(), 2);
        assert_eq!(job.steps[0].index, 0);
        assert_eq!(job.steps[1].index, 1);
        assert!(job.steps.iter().all(|s| s.job_id == job.id));
    }
}
