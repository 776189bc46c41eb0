//! CLI command implementations.

pub mod run;

use anyhow::{Context, Result};
use conveyor_config::parse_pipeline;

/// Validate a pipeline definition without running it.
pub fn validate(path: &str) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path))?;

    let request = parse_pipeline(&content)
        .with_context(|| format!("Failed to parse pipeline config: {}", path))?;

    println!(
        "✓ {} is valid: pipeline '{}' with {} step(s)",
        path,
        request.name,
        request.steps.len()
    );
    Ok(())
}
