//! Pipeline definition parsing.
//!
//! A definition is an ordered list of steps; the worker executes them
//! strictly in the order they appear, aborting on the first failure.

use crate::{ConfigError, ConfigResult};
use conveyor_core::job::{GitSource, JobRequest, StepRequest, Trigger};
use kdl::{KdlDocument, KdlNode};
use std::collections::HashMap;

/// Parse a pipeline definition from KDL text into an enqueue request.
pub fn parse_pipeline(kdl: &str) -> ConfigResult<JobRequest> {
    let doc: KdlDocument = kdl.parse()?;

    let mut name = String::new();
    let mut source = GitSource::default();
    let mut trigger = Trigger::Manual;
    let mut env = HashMap::new();
    let mut steps = Vec::new();

    for node in doc.nodes() {
        match node.name().value() {
            "pipeline" => {
                name = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("pipeline name".to_string()))?;
            }
            "source" => {
                source = parse_source(node);
            }
            "trigger" => {
                let raw = get_first_string_arg(node).unwrap_or_default();
                trigger = raw
                    .parse()
                    .map_err(|message| ConfigError::InvalidValue {
                        field: "trigger".to_string(),
                        message,
                    })?;
            }
            "env" => {
                collect_env(node, &mut env);
            }
            "step" => {
                steps.push(parse_step(node)?);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    if name.is_empty() {
        return Err(ConfigError::MissingField("pipeline name".to_string()));
    }

    // Step names must be unique: they are how logs and status are addressed.
    let mut seen = std::collections::HashSet::new();
    for step in &steps {
        if !seen.insert(step.name.as_str()) {
            return Err(ConfigError::Duplicate(format!("step '{}'", step.name)));
        }
    }

    Ok(JobRequest {
        name,
        source,
        trigger,
        env,
        steps,
    })
}

fn parse_source(node: &KdlNode) -> GitSource {
    GitSource {
        repo_url: get_string_prop(node, "repo").unwrap_or_default(),
        sha: get_string_prop(node, "sha").unwrap_or_default(),
        branch: get_string_prop(node, "branch"),
    }
}

fn parse_step(node: &KdlNode) -> ConfigResult<StepRequest> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("step name".to_string()))?;

    let mut image = String::new();
    let mut commands = Vec::new();
    let mut env = HashMap::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "image" => {
                    image = get_first_string_arg(child).unwrap_or_default();
                }
                "run" => {
                    if let Some(cmd) = get_first_string_arg(child) {
                        commands.push(cmd);
                    }
                }
                "env" => {
                    collect_env(child, &mut env);
                }
                _ => {}
            }
        }
    }

    if image.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "image for step '{}'",
            name
        )));
    }

    Ok(StepRequest {
        name,
        image,
        commands,
        env,
    })
}

fn collect_env(node: &KdlNode, env: &mut HashMap<String, String>) {
    if let Some(children) = node.children() {
        for child in children.nodes() {
            let key = child.name().value().to_string();
            if let Some(val) = get_first_string_arg(child) {
                env.insert(key, val);
            }
        }
    }
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}
