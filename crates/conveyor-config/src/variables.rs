//! Variable interpolation for step commands and environment.
//!
//! Supports variables like:
//! - `${git.sha}` - Full git commit SHA
//! - `${git.short_sha}` - Short (7 char) git commit SHA
//! - `${git.branch}` - Branch name
//! - `${job.id}` - Job ID
//! - `${job.name}` - Job name
//! - `${job.trigger}` - What triggered the job
//! - `${step.name}` - Current step name
//! - `${step.index}` - Current step index
//! - `${env.VAR_NAME}` - Environment variable
//! - `${secrets.SECRET_NAME}` - Secret value (masked in logs)
//! - `${timestamp}` - Unix timestamp
//! - `${date}` - ISO date (YYYY-MM-DD)

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Variable context containing all available variables for interpolation.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub git: GitContext,
    pub job: JobContext,
    pub step: StepContext,
    pub env: HashMap<String, String>,
    /// Secrets (masked in logs).
    pub secrets: HashMap<String, String>,
    /// Custom variables defined by the user.
    pub custom: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct GitContext {
    pub sha: String,
    pub short_sha: String,
    pub branch: String,
}

#[derive(Debug, Clone, Default)]
pub struct JobContext {
    pub id: String,
    pub name: String,
    pub trigger: String,
}

#[derive(Debug, Clone, Default)]
pub struct StepContext {
    pub name: String,
    pub index: usize,
}

// Regex for matching ${...} variables
static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}").unwrap()
});

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a variable name to its value.
    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["git", "sha"] => Some(self.git.sha.clone()),
            ["git", "short_sha"] => Some(self.git.short_sha.clone()),
            ["git", "branch"] => Some(self.git.branch.clone()),

            ["job", "id"] => Some(self.job.id.clone()),
            ["job", "name"] => Some(self.job.name.clone()),
            ["job", "trigger"] => Some(self.job.trigger.clone()),

            ["step", "name"] => Some(self.step.name.clone()),
            ["step", "index"] => Some(self.step.index.to_string()),

            ["env", name] => self.env.get(*name).cloned(),
            ["secrets", name] => self.secrets.get(*name).cloned(),

            ["timestamp"] => Some(chrono::Utc::now().timestamp().to_string()),
            ["date"] => Some(chrono::Utc::now().format("%Y-%m-%d").to_string()),

            // Single-part names check custom variables
            [name] => self.custom.get(*name).cloned(),

            _ => None,
        }
    }

    /// Interpolate all variables in a string. Unknown variables are left
    /// as written.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    /// Interpolate variables in a list of strings.
    pub fn interpolate_vec(&self, inputs: &[String]) -> Vec<String> {
        inputs.iter().map(|s| self.interpolate(s)).collect()
    }

    /// Interpolate variables in a HashMap's values.
    pub fn interpolate_map(&self, map: &HashMap<String, String>) -> HashMap<String, String> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.interpolate(v)))
            .collect()
    }

    /// Secret values that should be masked in logs.
    pub fn secret_values(&self) -> Vec<&str> {
        self.secrets.values().map(|s| s.as_str()).collect()
    }
}

/// Builder for creating a VariableContext.
pub struct VariableContextBuilder {
    ctx: VariableContext,
}

impl VariableContextBuilder {
    pub fn new() -> Self {
        Self {
            ctx: VariableContext::new(),
        }
    }

    pub fn with_git_sha(mut self, sha: impl Into<String>) -> Self {
        let sha = sha.into();
        self.ctx.git.short_sha = sha.chars().take(7).collect();
        self.ctx.git.sha = sha;
        self
    }

    pub fn with_git_branch(mut self, branch: impl Into<String>) -> Self {
        self.ctx.git.branch = branch.into();
        self
    }

    pub fn with_job(
        mut self,
        id: impl Into<String>,
        name: impl Into<String>,
        trigger: impl Into<String>,
    ) -> Self {
        self.ctx.job.id = id.into();
        self.ctx.job.name = name.into();
        self.ctx.job.trigger = trigger.into();
        self
    }

    pub fn with_step(mut self, name: impl Into<String>, index: usize) -> Self {
        self.ctx.step.name = name.into();
        self.ctx.step.index = index;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.env.insert(key.into(), value.into());
        self
    }

    pub fn with_secret(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.secrets.insert(key.into(), value.into());
        self
    }

    pub fn with_custom(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ctx.custom.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> VariableContext {
        self.ctx
    }
}

impl Default for VariableContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_interpolation() {
        let ctx = VariableContextBuilder::new()
            .with_git_sha("abc1234567890")
            .with_git_branch("main")
            .build();

        let result = ctx.interpolate("Commit ${git.sha} on ${git.branch}");
        assert_eq!(result, "Commit abc1234567890 on main");
    }

    #[test]
    fn test_short_sha() {
        let ctx = VariableContextBuilder::new()
            .with_git_sha("abc1234567890def")
            .build();

        let result = ctx.interpolate("Short: ${git.short_sha}");
        assert_eq!(result, "Short: abc1234");
    }

    #[test]
    fn test_env_variables() {
        let ctx = VariableContextBuilder::new()
            .with_env("MY_VAR", "hello")
            .with_env("ANOTHER", "world")
            .build();

        let result = ctx.interpolate("${env.MY_VAR} ${env.ANOTHER}!");
        assert_eq!(result, "hello world!");
    }

    #[test]
    fn test_job_and_step_context() {
        let ctx = VariableContextBuilder::new()
            .with_job("job-123", "my-service", "push")
            .with_step("build", 1)
            .build();

        let result = ctx.interpolate("Job ${job.name} (${job.trigger}) step ${step.name}");
        assert_eq!(result, "Job my-service (push) step build");
    }

    #[test]
    fn test_unknown_variable_preserved() {
        let ctx = VariableContext::new();
        let result = ctx.interpolate("Unknown: ${unknown.var}");
        assert_eq!(result, "Unknown: ${unknown.var}");
    }

    #[test]
    fn test_interpolate_vec() {
        let ctx = VariableContextBuilder::new()
            .with_git_branch("develop")
            .build();

        let inputs = vec![
            "echo ${git.branch}".to_string(),
            "deploy to ${git.branch}".to_string(),
        ];
        let results = ctx.interpolate_vec(&inputs);
        assert_eq!(results[0], "echo develop");
        assert_eq!(results[1], "deploy to develop");
    }

    #[test]
    fn test_secrets_resolved_and_listed() {
        let ctx = VariableContextBuilder::new()
            .with_secret("API_KEY", "super-secret-key")
            .build();

        let result = ctx.interpolate("Key: ${secrets.API_KEY}");
        assert_eq!(result, "Key: super-secret-key");
        assert_eq!(ctx.secret_values(), vec!["super-secret-key"]);
    }

    #[test]
    fn test_custom_variables() {
        let mut ctx = VariableContext::new();
        ctx.custom.insert("version".to_string(), "1.2.3".to_string());

        let result = ctx.interpolate("v${version}");
        assert_eq!(result, "v1.2.3");
    }

    #[test]
    fn test_nested_braces() {
        let ctx = VariableContextBuilder::new().with_git_sha("abc123").build();

        // JSON-ish payloads with braces must survive interpolation
        let result = ctx.interpolate(r#"{"sha": "${git.sha}"}"#);
        assert_eq!(result, r#"{"sha": "abc123"}"#);
    }
}
