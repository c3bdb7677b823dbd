//! Variable interpolation for pipeline definitions.
//!
//! Supports variables like:
//! - `${git.sha}` - Full commit SHA
//! - `${git.short_sha}` - Short (7 char) commit SHA
//! - `${git.branch}` - Current branch name
//! - `${git.tag}` - Tag at HEAD (if any)
//! - `${git.ref}` - Tag if present, otherwise branch
//! - `${git.ref_slug}` - `${git.ref}` made safe for an image tag
//! - `${pipeline.name}` - Pipeline name
//! - `${env.VAR_NAME}` - Environment variable
//! - `${timestamp}` - Unix timestamp
//! - `${date}` - ISO date (YYYY-MM-DD)
//! - `${name}` - Custom variable (e.g. from `--var name=value`)

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

/// Values available to `${...}` references.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    pub git: GitContext,
    pub pipeline_name: String,
    pub env: HashMap<String, String>,
    pub custom: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct GitContext {
    pub sha: String,
    pub short_sha: String,
    pub branch: String,
    pub tag: Option<String>,
    pub ref_name: String,
}

static VAR_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*(?:\.[a-zA-Z_][a-zA-Z0-9_]*)?)\}")
        .expect("Invalid regex")
});

static TAG_UNSAFE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9_.-]+").expect("Invalid regex"));

/// Reduce `input` to characters valid in an image tag.
pub fn slugify(input: &str) -> String {
    let slug = TAG_UNSAFE.replace_all(input, "-");
    let slug = slug.trim_start_matches(['.', '-']);
    slug.chars().take(128).collect()
}

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for the current process: CI variables first, then the git
    /// repository at `repo_path` for anything they did not provide.
    pub fn detect(repo_path: &str) -> Self {
        let mut ctx = Self::new();
        ctx.populate_env();
        ctx.populate_git_from_env();
        if ctx.git.sha.is_empty() {
            ctx.populate_git_from_repo(repo_path);
        }
        ctx
    }

    fn env_any(&self, names: &[&str]) -> Option<String> {
        names
            .iter()
            .find_map(|n| self.env.get(*n))
            .filter(|v| !v.is_empty())
            .cloned()
    }

    /// Populate git context from CI environment variables.
    pub fn populate_git_from_env(&mut self) {
        if let Some(sha) = self.env_any(&["SHIPYARD_COMMIT_SHA", "GITHUB_SHA", "CI_COMMIT_SHA"]) {
            self.git.short_sha = sha.chars().take(7).collect();
            self.git.sha = sha;
        }

        if let Some(branch) =
            self.env_any(&["SHIPYARD_BRANCH", "GITHUB_HEAD_REF", "CI_COMMIT_BRANCH"])
        {
            self.git.branch = branch;
        }

        self.git.tag = self.env_any(&["SHIPYARD_TAG", "CI_COMMIT_TAG"]).or_else(|| {
            self.env
                .get("GITHUB_REF_TYPE")
                .filter(|t| *t == "tag")
                .and_then(|_| self.env.get("GITHUB_REF_NAME").cloned())
        });

        if self.git.branch.is_empty() && self.git.tag.is_none() {
            if let Some(name) = self.env_any(&["GITHUB_REF_NAME"]) {
                self.git.branch = name;
            }
        }

        self.git.ref_name = self
            .git
            .tag
            .clone()
            .unwrap_or_else(|| self.git.branch.clone());
    }

    /// Populate git context by running git in `repo_path`.
    pub fn populate_git_from_repo(&mut self, repo_path: &str) {
        use std::process::Command;

        let run_git = |args: &[&str]| -> Option<String> {
            Command::new("git")
                .args(args)
                .current_dir(repo_path)
                .output()
                .ok()
                .filter(|o| o.status.success())
                .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
                .filter(|s| !s.is_empty())
        };

        if let Some(sha) = run_git(&["rev-parse", "HEAD"]) {
            self.git.short_sha = sha.chars().take(7).collect();
            self.git.sha = sha;
        }

        if let Some(branch) = run_git(&["rev-parse", "--abbrev-ref", "HEAD"]) {
            if branch != "HEAD" {
                self.git.ref_name = branch.clone();
                self.git.branch = branch;
            }
        }

        if let Some(tag) = run_git(&["describe", "--tags", "--exact-match", "HEAD"]) {
            self.git.ref_name = tag.clone();
            self.git.tag = Some(tag);
        }
    }

    pub fn populate_env(&mut self) {
        self.env.extend(std::env::vars());
    }

    pub fn set(&mut self, name: &str, value: impl Into<String>) {
        self.custom.insert(name.to_string(), value.into());
    }

    pub fn resolve(&self, var_name: &str) -> Option<String> {
        let parts: Vec<&str> = var_name.split('.').collect();

        match parts.as_slice() {
            ["git", "sha"] => Some(self.git.sha.clone()),
            ["git", "short_sha"] => Some(self.git.short_sha.clone()),
            ["git", "branch"] => Some(self.git.branch.clone()),
            ["git", "tag"] => self.git.tag.clone(),
            ["git", "ref"] => Some(self.git.ref_name.clone()),
            ["git", "ref_slug"] => Some(slugify(&self.git.ref_name)),

            ["pipeline", "name"] => Some(self.pipeline_name.clone()),

            ["env", name] => self.env.get(*name).cloned(),

            ["timestamp"] => Some(chrono::Utc::now().timestamp().to_string()),
            ["date"] => Some(chrono::Utc::now().format("%Y-%m-%d").to_string()),

            [name] => self.custom.get(*name).cloned(),

            _ => None,
        }
    }

    /// Replace every resolvable `${...}`; unknown references are left as is.
    pub fn interpolate(&self, input: &str) -> String {
        VAR_REGEX
            .replace_all(input, |caps: &regex::Captures| {
                let var_name = &caps[1];
                self.resolve(var_name)
                    .unwrap_or_else(|| format!("${{{}}}", var_name))
            })
            .to_string()
    }

    /// Names referenced by `input` that this context cannot resolve.
    pub fn unresolved(&self, input: &str) -> Vec<String> {
        VAR_REGEX
            .captures_iter(input)
            .map(|caps| caps[1].to_string())
            .filter(|name| self.resolve(name).is_none())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> VariableContext {
        let mut ctx = VariableContext::new();
        ctx.git = GitContext {
            sha: "abc1234567890".to_string(),
            short_sha: "abc1234".to_string(),
            branch: "feature/login".to_string(),
            tag: None,
            ref_name: "feature/login".to_string(),
        };
        ctx.pipeline_name = "base".to_string();
        ctx
    }

    #[test]
    fn test_basic_interpolation() {
        let result = context().interpolate("ghcr.io/acme/${pipeline.name}:${git.short_sha}");
        assert_eq!(result, "ghcr.io/acme/base:abc1234");
    }

    #[test]
    fn test_ref_slug_is_tag_safe() {
        assert_eq!(context().interpolate("${git.ref_slug}"), "feature-login");
        assert_eq!(slugify("..v1/rc 2"), "v1-rc-2");
    }

    #[test]
    fn test_env_and_custom_variables() {
        let mut ctx = context();
        ctx.env.insert("RELEASE".to_string(), "2024.06".to_string());
        ctx.set("flavor", "slim");

        assert_eq!(ctx.interpolate("${env.RELEASE}-${flavor}"), "2024.06-slim");
    }

    #[test]
    fn test_unknown_variable_preserved_and_reported() {
        let ctx = context();
        assert_eq!(ctx.interpolate("v-${git.tag}"), "v-${git.tag}");
        assert_eq!(ctx.unresolved("${git.tag}-${git.sha}"), vec!["git.tag".to_string()]);
    }

    #[test]
    fn test_git_from_ci_env() {
        let mut ctx = VariableContext::new();
        ctx.env.insert("GITHUB_SHA".to_string(), "0123456789abcdef".to_string());
        ctx.env.insert("GITHUB_REF_TYPE".to_string(), "tag".to_string());
        ctx.env.insert("GITHUB_REF_NAME".to_string(), "v1.4.0".to_string());
        ctx.populate_git_from_env();

        assert_eq!(ctx.git.short_sha, "0123456");
        assert_eq!(ctx.git.tag.as_deref(), Some("v1.4.0"));
        assert_eq!(ctx.git.ref_name, "v1.4.0");
    }

    #[test]
    fn test_date_format() {
        let result = VariableContext::new().interpolate("${date}");
        assert_eq!(result.len(), 10);
        assert!(result.contains('-'));
    }
}
