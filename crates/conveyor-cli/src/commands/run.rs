//! Local pipeline execution command.

use anyhow::{Context, Result};
use conveyor_config::parse_pipeline;
use conveyor_core::job::{PipelineJob, RunStatus};
use conveyor_core::log::LogKind;
use conveyor_executor::LocalProcessExecutor;
use conveyor_scheduler::{PipelineService, ServiceConfig};
use conveyor_store::{JobStore, MemoryStore};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;

/// Run a pipeline locally with the process executor and an in-memory
/// store, tailing logs until the job reaches a terminal status.
pub async fn run_local(config_path: &str, workers: usize, env: Vec<String>) -> Result<()> {
    let content = std::fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read config file: {}", config_path))?;

    let mut request = parse_pipeline(&content)
        .with_context(|| format!("Failed to parse pipeline config: {}", config_path))?;

    request.env.insert("CI".to_string(), "true".to_string());
    request
        .env
        .insert("CONVEYOR".to_string(), "true".to_string());
    for pair in env {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("Invalid --env value (expected KEY=VALUE): {}", pair))?;
        request.env.insert(key.to_string(), value.to_string());
    }

    println!("Running pipeline: {}", request.name);
    println!("Steps: {}", request.steps.len());

    let store = Arc::new(MemoryStore::new());
    let executor = Arc::new(LocalProcessExecutor::new());
    let config = ServiceConfig {
        worker_count: workers.max(1),
        // Short TTL so the status poll below never sits on a stale
        // cached status for long.
        cache_ttl: Duration::from_secs(1),
        ..ServiceConfig::default()
    };
    let service = PipelineService::new(config, store.clone(), executor);

    service.start()?;
    let job_id = service.enqueue(request).await?;

    println!("\n--- Starting pipeline execution ---\n");

    // Tail logs until the job settles; status is read before each drain
    // so the final drain picks up everything written before the job
    // turned terminal.
    let job = store.load_job(job_id).await?;
    let mut offsets = vec![0u64; job.steps.len()];
    let final_status = loop {
        let status = service.get_job_status(job_id).await?;
        drain_logs(&service, &job, &mut offsets).await?;
        if status.is_terminal() {
            break status;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    };

    print_summary(&store.load_job(job_id).await?);

    if service.dropped_log_writes() > 0 {
        println!(
            "(warning: {} log entries were lost to store failures)",
            service.dropped_log_writes()
        );
    }

    service.shutdown().await?;

    if final_status == RunStatus::Succeeded {
        println!("\n✓ Pipeline succeeded!");
        Ok(())
    } else {
        anyhow::bail!("Pipeline {}", final_status)
    }
}

async fn drain_logs(
    service: &PipelineService,
    job: &PipelineJob,
    offsets: &mut [u64],
) -> Result<()> {
    for (i, step) in job.steps.iter().enumerate() {
        let mut stream = service.stream_logs(step.id, offsets[i]);
        while let Some(entry) = stream.next().await {
            let entry = entry?;
            offsets[i] += 1;
            let marker = match entry.kind {
                LogKind::Stdout => ' ',
                LogKind::Stderr => '!',
                LogKind::ExitCode | LogKind::Metadata | LogKind::Progress => '*',
            };
            println!("  [{}]{} {}", step.name, marker, entry.payload_str());
        }
    }
    Ok(())
}

fn print_summary(job: &PipelineJob) {
    println!("\n--- Step Summary ---");
    for step in &job.steps {
        let status = match step.status {
            RunStatus::Succeeded => "✓ succeeded".to_string(),
            RunStatus::Failed => match step.exit_code {
                Some(code) => format!("✗ failed (exit {})", code),
                None => "✗ failed".to_string(),
            },
            RunStatus::Cancelled => "⊘ cancelled".to_string(),
            RunStatus::Queued => "○ not started".to_string(),
            RunStatus::Running => "▶ running".to_string(),
        };
        println!("  {} - {}", step.name, status);
    }
}
