//! PostgreSQL implementation of the job store.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use conveyor_core::job::{GitSource, PipelineJob, RunStatus, Step, Trigger};
use conveyor_core::log::{LogEntry, LogKind};
use conveyor_core::{JobId, StepId};
use sqlx::PgPool;
use std::collections::HashMap;
use uuid::Uuid;

use crate::{JobStore, StoreError, StoreResult};

/// PostgreSQL-backed [`JobStore`].
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    name: String,
    repo_url: String,
    sha: String,
    branch: Option<String>,
    trigger: String,
    env: serde_json::Value,
    status: String,
    queued_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct StepRow {
    id: Uuid,
    job_id: Uuid,
    idx: i32,
    name: String,
    image: String,
    commands: serde_json::Value,
    env: serde_json::Value,
    status: String,
    exit_code: Option<i32>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

#[derive(sqlx::FromRow)]
struct LogRow {
    step_id: Uuid,
    time: DateTime<Utc>,
    line: i64,
    payload: Vec<u8>,
    kind: String,
    created_at: DateTime<Utc>,
}

fn decode_env(value: serde_json::Value) -> StoreResult<HashMap<String, String>> {
    serde_json::from_value(value).map_err(|e| StoreError::Decode(e.to_string()))
}

fn decode_commands(value: serde_json::Value) -> StoreResult<Vec<String>> {
    serde_json::from_value(value).map_err(|e| StoreError::Decode(e.to_string()))
}

fn encode_json<T: serde::Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

impl TryFrom<StepRow> for Step {
    type Error = StoreError;

    fn try_from(row: StepRow) -> StoreResult<Step> {
        Ok(Step {
            id: StepId::from_uuid(row.id),
            job_id: JobId::from_uuid(row.job_id),
            index: row.idx as u32,
            name: row.name,
            image: row.image,
            commands: decode_commands(row.commands)?,
            env: decode_env(row.env)?,
            status: row
                .status
                .parse::<RunStatus>()
                .map_err(StoreError::Decode)?,
            exit_code: row.exit_code,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

impl TryFrom<LogRow> for LogEntry {
    type Error = StoreError;

    fn try_from(row: LogRow) -> StoreResult<LogEntry> {
        Ok(LogEntry {
            step_id: StepId::from_uuid(row.step_id),
            time: row.time,
            line: row.line as u64,
            payload: Bytes::from(row.payload),
            kind: row.kind.parse::<LogKind>().map_err(StoreError::Decode)?,
            created_at: row.created_at,
        })
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn save_job(&self, job: &PipelineJob) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO jobs (id, name, repo_url, sha, branch, trigger, env, status, queued_at, started_at, finished_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE
            SET status = EXCLUDED.status,
                started_at = EXCLUDED.started_at,
                finished_at = EXCLUDED.finished_at
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(&job.name)
        .bind(&job.source.repo_url)
        .bind(&job.source.sha)
        .bind(&job.source.branch)
        .bind(job.trigger.as_str())
        .bind(encode_json(&job.env))
        .bind(job.status.as_str())
        .bind(job.queued_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .execute(&mut *tx)
        .await?;

        for step in &job.steps {
            upsert_step(&mut tx, step).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn save_step(&self, step: &Step) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        upsert_step(&mut tx, step).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn append_log_entry(&self, entry: &LogEntry) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO step_logs (step_id, time, line, payload, kind, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.step_id.as_uuid())
        .bind(entry.time)
        .bind(entry.line as i64)
        .bind(entry.payload.as_ref())
        .bind(entry.kind.as_str())
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_job(&self, id: JobId) -> StoreResult<PipelineJob> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            SELECT id, name, repo_url, sha, branch, trigger, env, status, queued_at, started_at, finished_at
            FROM jobs
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("job {}", id)))?;

        let step_rows = sqlx::query_as::<_, StepRow>(
            r#"
            SELECT id, job_id, idx, name, image, commands, env, status, exit_code, started_at, finished_at
            FROM steps
            WHERE job_id = $1
            ORDER BY idx ASC
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        let steps = step_rows
            .into_iter()
            .map(Step::try_from)
            .collect::<StoreResult<Vec<_>>>()?;

        Ok(PipelineJob {
            id: JobId::from_uuid(row.id),
            name: row.name,
            source: GitSource {
                repo_url: row.repo_url,
                sha: row.sha,
                branch: row.branch,
            },
            trigger: row
                .trigger
                .parse::<Trigger>()
                .map_err(StoreError::Decode)?,
            env: decode_env(row.env)?,
            steps,
            status: row
                .status
                .parse::<RunStatus>()
                .map_err(StoreError::Decode)?,
            queued_at: row.queued_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }

    async fn load_step(&self, id: StepId) -> StoreResult<Step> {
        let row = sqlx::query_as::<_, StepRow>(
            r#"
            SELECT id, job_id, idx, name, image, commands, env, status, exit_code, started_at, finished_at
            FROM steps
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("step {}", id)))?;

        Step::try_from(row)
    }

    async fn list_log_entries(
        &self,
        step_id: StepId,
        offset: u64,
        limit: u64,
    ) -> StoreResult<Vec<LogEntry>> {
        let rows = sqlx::query_as::<_, LogRow>(
            r#"
            SELECT step_id, time, line, payload, kind, created_at
            FROM step_logs
            WHERE step_id = $1
            ORDER BY id ASC
            OFFSET $2 LIMIT $3
            "#,
        )
        .bind(step_id.as_uuid())
        .bind(offset as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(LogEntry::try_from).collect()
    }
}

async fn upsert_step(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    step: &Step,
) -> StoreResult<()> {
    sqlx::query(
        r#"
        INSERT INTO steps (id, job_id, idx, name, image, commands, env, status, exit_code, started_at, finished_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (id) DO UPDATE
        SET status = EXCLUDED.status,
            exit_code = EXCLUDED.exit_code,
            started_at = EXCLUDED.started_at,
            finished_at = EXCLUDED.finished_at
        "#,
    )
    .bind(step.id.as_uuid())
    .bind(step.job_id.as_uuid())
    .bind(step.index as i32)
    .bind(&step.name)
    .bind(&step.image)
    .bind(encode_json(&step.commands))
    .bind(encode_json(&step.env))
    .bind(step.status.as_str())
    .bind(step.exit_code)
    .bind(step.started_at)
    .bind(step.finished_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
