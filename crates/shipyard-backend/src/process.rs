//! External tool invocation.
//!
//! Every tool process is killed when its future is dropped, so cancelling a
//! build or publish also stops the tools it started.

use shipyard_core::{Error, Secret};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// A tool run that did not succeed.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {}: {}", code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()), stderr.trim())]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
}

impl ToolError {
    /// True when the tool reported a registry authentication failure.
    pub fn is_unauthorized(&self) -> bool {
        match self {
            ToolError::Failed { stderr, .. } => {
                let stderr = stderr.to_lowercase();
                ["unauthorized", "401", "authentication required", "denied", "invalid username"]
                    .iter()
                    .any(|marker| stderr.contains(marker))
            }
            ToolError::Spawn { .. } => false,
        }
    }

    /// Registry-side failure, distinguishing rejected credentials.
    pub fn into_push_error(self, registry: &str, target: &str) -> Error {
        if self.is_unauthorized() {
            Error::Auth {
                registry: registry.to_string(),
                message: self.to_string(),
            }
        } else {
            Error::Push {
                target: target.to_string(),
                message: self.to_string(),
            }
        }
    }
}

impl From<ToolError> for Error {
    fn from(e: ToolError) -> Self {
        Error::Internal(e.to_string())
    }
}

/// Captured output of a successful run.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// stdout followed by stderr; some tools report results on stderr.
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// Command line for an external tool.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: String,
    args: Vec<OsString>,
    env: Vec<(String, String)>,
    secret_env: Vec<(String, Secret)>,
    stdin: Option<Secret>,
    current_dir: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            secret_env: Vec::new(),
            stdin: None,
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add `flag value` for every value.
    pub fn repeated<I, S>(mut self, flag: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        for value in values {
            self.args.push(flag.into());
            self.args.push(value.into());
        }
        self
    }

    /// Add `flag value` when `value` is set.
    pub fn optional(self, flag: &str, value: Option<impl Into<OsString>>) -> Self {
        match value {
            Some(value) => self.arg(flag).arg(value),
            None => self,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Environment variable holding a secret; never logged.
    pub fn secret_env(mut self, key: impl Into<String>, value: Secret) -> Self {
        self.secret_env.push((key.into(), value));
        self
    }

    /// Write `secret` to the tool's stdin, for `--password-stdin` flags.
    pub fn stdin_secret(mut self, secret: Secret) -> Self {
        self.stdin = Some(secret);
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Arguments as strings, for logging and tests.
    pub fn arg_strings(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_secret_env(&self, key: &str) -> bool {
        self.secret_env.iter().any(|(k, _)| k == key)
    }

    /// Run to completion, capturing output.
    pub async fn run(&self) -> Result<ToolOutput, ToolError> {
        debug!(program = %self.program, args = ?self.arg_strings(), "Running tool");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        for (key, value) in &self.secret_env {
            cmd.env(key, value.expose());
        }
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }

        let spawn_error = |source| ToolError::Spawn {
            program: self.program.clone(),
            source,
        };

        let mut child = cmd.spawn().map_err(spawn_error)?;

        if let (Some(secret), Some(mut stdin)) = (&self.stdin, child.stdin.take()) {
            stdin
                .write_all(secret.expose().as_bytes())
                .await
                .map_err(spawn_error)?;
            stdin.shutdown().await.map_err(spawn_error)?;
        }

        let output = child.wait_with_output().await.map_err(spawn_error)?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(ToolError::Failed {
                program: self.program.clone(),
                code: output.status.code(),
                stderr: if stderr.trim().is_empty() { stdout } else { stderr },
            });
        }

        Ok(ToolOutput { stdout, stderr })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_arguments() {
        let cmd = ToolCommand::new("apko")
            .arg("build")
            .repeated("--keyring-append", ["a.pub", "b.pub"])
            .optional("--cache-dir", Some("/cache"))
            .optional("--unused", None::<&str>)
            .env("SOURCE_DATE_EPOCH", "0");

        assert_eq!(cmd.program(), "apko");
        assert_eq!(
            cmd.arg_strings(),
            vec!["build", "--keyring-append", "a.pub", "--keyring-append", "b.pub", "--cache-dir", "/cache"]
        );
        assert_eq!(cmd.env_value("SOURCE_DATE_EPOCH"), Some("0"));
    }

    #[test]
    fn test_secrets_stay_out_of_debug() {
        let cmd = ToolCommand::new("crane")
            .secret_env("TOKEN", Secret::new("hunter2"))
            .stdin_secret(Secret::new("hunter3"));
        let debug = format!("{:?}", cmd);
        assert!(!debug.contains("hunter2"));
        assert!(!debug.contains("hunter3"));
        assert!(cmd.has_secret_env("TOKEN"));
    }

    #[test]
    fn test_unauthorized_detection() {
        let denied = ToolError::Failed {
            program: "crane".to_string(),
            code: Some(1),
            stderr: "PUT https://ghcr.io/v2/: UNAUTHORIZED: authentication required".to_string(),
        };
        assert!(denied.is_unauthorized());
        assert!(matches!(
            denied.into_push_error("ghcr.io", "ghcr.io/acme/app:v1"),
            Error::Auth { .. }
        ));

        let other = ToolError::Failed {
            program: "crane".to_string(),
            code: Some(1),
            stderr: "MANIFEST_INVALID".to_string(),
        };
        assert!(matches!(
            other.into_push_error("ghcr.io", "ghcr.io/acme/app:v1"),
            Error::Push { .. }
        ));
    }

    #[tokio::test]
    async fn test_run_captures_output_and_failure() {
        let ok = ToolCommand::new("sh").arg("-c").arg("echo hello").run().await.unwrap();
        assert_eq!(ok.stdout.trim(), "hello");

        let err = ToolCommand::new("sh")
            .arg("-c")
            .arg("echo boom >&2; exit 3")
            .run()
            .await
            .unwrap_err();
        match err {
            ToolError::Failed { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr.trim(), "boom");
            }
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stdin_secret_is_delivered() {
        let out = ToolCommand::new("cat")
            .stdin_secret(Secret::new("s3cret"))
            .run()
            .await
            .unwrap();
        assert_eq!(out.stdout, "s3cret");
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let err = ToolCommand::new("shipyard-no-such-tool").run().await.unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
    }
}
