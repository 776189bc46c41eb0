//! In-memory store for tests and local runs.

use async_trait::async_trait;
use conveyor_core::job::{PipelineJob, Step};
use conveyor_core::log::LogEntry;
use conveyor_core::{JobId, StepId};
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::{JobStore, StoreError, StoreResult};

/// Thread-safe in-memory implementation of [`JobStore`].
///
/// Steps are indexed both inside their job record and by step id so
/// that `load_step` does not scan jobs.
#[derive(Default)]
pub struct MemoryStore {
    jobs: RwLock<HashMap<JobId, PipelineJob>>,
    steps: RwLock<HashMap<StepId, Step>>,
    logs: RwLock<HashMap<StepId, Vec<LogEntry>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of log entries recorded for a step.
    pub async fn log_count(&self, step_id: StepId) -> usize {
        let logs = self.logs.read().await;
        logs.get(&step_id).map(Vec::len).unwrap_or(0)
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn save_job(&self, job: &PipelineJob) -> StoreResult<()> {
        let mut jobs = self.jobs.write().await;
        let mut steps = self.steps.write().await;
        for step in &job.steps {
            steps.insert(step.id, step.clone());
        }
        jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn save_step(&self, step: &Step) -> StoreResult<()> {
        let mut jobs = self.jobs.write().await;
        let mut steps = self.steps.write().await;
        if let Some(job) = jobs.get_mut(&step.job_id) {
            if let Some(slot) = job.steps.iter_mut().find(|s| s.id == step.id) {
                *slot = step.clone();
            }
        }
        steps.insert(step.id, step.clone());
        Ok(())
    }

    async fn append_log_entry(&self, entry: &LogEntry) -> StoreResult<()> {
        let mut logs = self.logs.write().await;
        logs.entry(entry.step_id).or_default().push(entry.clone());
        Ok(())
    }

    async fn load_job(&self, id: JobId) -> StoreResult<PipelineJob> {
        let jobs = self.jobs.read().await;
        jobs.get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("job {}", id)))
    }

    async fn load_step(&self, id: StepId) -> StoreResult<Step> {
        let steps = self.steps.read().await;
        steps
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("step {}", id)))
    }

    async fn list_log_entries(
        &self,
        step_id: StepId,
        offset: u64,
        limit: u64,
    ) -> StoreResult<Vec<LogEntry>> {
        let logs = self.logs.read().await;
        let entries = logs.get(&step_id).map(Vec::as_slice).unwrap_or(&[]);
        Ok(entries
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use conveyor_core::job::{GitSource, JobRequest, RunStatus, StepRequest, Trigger};
    use conveyor_core::log::LogKind;

    fn sample_job() -> PipelineJob {
        PipelineJob::from_request(JobRequest {
            name: "ci".to_string(),
            source: GitSource::default(),
            trigger: Trigger::Manual,
            env: HashMap::new(),
            steps: vec![StepRequest {
                name: "build".to_string(),
                image: "alpine".to_string(),
                commands: vec!["true".to_string()],
                env: HashMap::new(),
            }],
        })
    }

    #[tokio::test]
    async fn test_save_and_load_job() {
        let store = MemoryStore::new();
        let job = sample_job();
        store.save_job(&job).await.unwrap();

        let loaded = store.load_job(job.id).await.unwrap();
        assert_eq!(loaded.name, "ci");
        assert_eq!(loaded.steps.len(), 1);

        let step = store.load_step(job.steps[0].id).await.unwrap();
        assert_eq!(step.name, "build");
    }

    #[tokio::test]
    async fn test_save_step_updates_parent_job() {
        let store = MemoryStore::new();
        let job = sample_job();
        store.save_job(&job).await.unwrap();

        let mut step = job.steps[0].clone();
        step.status = RunStatus::Running;
        store.save_step(&step).await.unwrap();

        let loaded = store.load_job(job.id).await.unwrap();
        assert_eq!(loaded.steps[0].status, RunStatus::Running);
    }

    #[tokio::test]
    async fn test_load_missing_job() {
        let store = MemoryStore::new();
        let result = store.load_job(JobId::new()).await;
        assert!(matches!(result.unwrap_err(), StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_log_entries_paginated_in_append_order() {
        let store = MemoryStore::new();
        let step_id = StepId::new();
        for line in 0..5u64 {
            let entry = LogEntry::new(
                step_id,
                LogKind::Stdout,
                line,
                Bytes::from(format!("line {}", line)),
            );
            store.append_log_entry(&entry).await.unwrap();
        }

        let page = store.list_log_entries(step_id, 2, 2).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].line, 2);
        assert_eq!(page[1].line, 3);

        let tail = store.list_log_entries(step_id, 4, 10).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].line, 4);
    }
}
