//! Sandboxed code execution in a child process.
//!
//! Each language maps to a [`Runtime`] (interpreter plus the flag that makes
//! it read a program from argv). Runs are bounded by a wall-clock timeout;
//! the child is killed when the timeout fires.
//!
//! The session layer never calls this. Clients run code here and then
//! share the result with the room as `code_output` envelopes.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;

use crate::protocol::{Envelope, OutputStatus};

/// Shown when a run succeeds without printing anything.
pub const NO_OUTPUT_MESSAGE: &str = "Code executed successfully (no output)";

/// How to launch one language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Runtime {
    pub program: String,
    /// Arguments placed before the program text.
    pub args: Vec<String>,
}

impl Runtime {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub runtimes: HashMap<String, Runtime>,
    pub timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let mut runtimes = HashMap::new();
        runtimes.insert("python".to_string(), Runtime::new("python3", ["-c"]));
        Self {
            runtimes,
            timeout: Duration::from_secs(10),
        }
    }
}

impl ExecutorConfig {
    pub fn with_runtime(mut self, language: impl Into<String>, runtime: Runtime) -> Self {
        self.runtimes.insert(language.into(), runtime);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Output panel contents for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub output: Option<String>,
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            output: None,
            error: Some(error.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The final `code_output` frame a client shares with its room.
    pub fn to_envelope(&self) -> Envelope {
        let status = if self.is_error() {
            OutputStatus::Error
        } else {
            OutputStatus::Completed
        };
        Envelope::code_output(status, self.output.clone(), self.error.clone())
    }
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Code execution for {0} is not supported yet. Only Python is available.")]
    UnsupportedLanguage(String),
    #[error("Failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Execution timed out after {0:?}")]
    Timeout(Duration),
    #[error("I/O error while collecting output: {0}")]
    Io(#[from] std::io::Error),
}

pub struct CodeExecutor {
    config: ExecutorConfig,
}

impl Default for CodeExecutor {
    fn default() -> Self {
        Self::new(ExecutorConfig::default())
    }
}

impl CodeExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    pub fn supports(&self, language: &str) -> bool {
        self.config.runtimes.contains_key(language)
    }

    /// Run and fold every failure into the result's `error` field.
    pub async fn execute(&self, code: &str, language: &str) -> ExecutionResult {
        match self.run(code, language).await {
            Ok(result) => result,
            Err(e) => {
                log::warn!("Execution failed ({language}): {e}");
                ExecutionResult::failed(e.to_string())
            }
        }
    }

    /// Run `code` with the runtime registered for `language`.
    pub async fn run(&self, code: &str, language: &str) -> Result<ExecutionResult, ExecutorError> {
        let runtime = self
            .config
            .runtimes
            .get(language)
            .ok_or_else(|| ExecutorError::UnsupportedLanguage(language.to_string()))?;

        let child = Command::new(&runtime.program)
            .args(&runtime.args)
            .arg(code)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                program: runtime.program.clone(),
                source,
            })?;

        let output = tokio::time::timeout(self.config.timeout, child.wait_with_output())
            .await
            .map_err(|_| ExecutorError::Timeout(self.config.timeout))??;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        log::debug!(
            "{} exited with {} ({} bytes stdout, {} bytes stderr)",
            runtime.program,
            output.status,
            stdout.len(),
            stderr.len()
        );

        let result = if !stderr.is_empty() {
            ExecutionResult {
                output: (!stdout.is_empty()).then_some(stdout),
                error: Some(stderr),
            }
        } else if !output.status.success() {
            ExecutionResult {
                output: (!stdout.is_empty()).then_some(stdout),
                error: Some(format!("Process exited with {}", output.status)),
            }
        } else if stdout.is_empty() {
            ExecutionResult {
                output: Some(NO_OUTPUT_MESSAGE.to_string()),
                error: None,
            }
        } else {
            ExecutionResult {
                output: Some(stdout),
                error: None,
            }
        };
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_executor() -> CodeExecutor {
        CodeExecutor::new(
            ExecutorConfig::default()
                .with_runtime("shell", Runtime::new("sh", ["-c"]))
                .with_timeout(Duration::from_millis(500)),
        )
    }

    #[tokio::test]
    async fn test_unsupported_language() {
        let executor = CodeExecutor::default();
        let result = executor.execute("puts 1", "ruby").await;
        assert_eq!(
            result.error.as_deref(),
            Some("Code execution for ruby is not supported yet. Only Python is available.")
        );
        assert!(result.output.is_none());
    }

    #[tokio::test]
    async fn test_stdout_captured() {
        let result = shell_executor().execute("echo 2", "shell").await;
        assert_eq!(result.output.as_deref(), Some("2\n"));
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_no_output_message() {
        let result = shell_executor().execute("true", "shell").await;
        assert_eq!(result.output.as_deref(), Some(NO_OUTPUT_MESSAGE));
    }

    #[tokio::test]
    async fn test_stderr_reported() {
        let result = shell_executor()
            .execute("echo partial; echo boom >&2", "shell")
            .await;
        assert_eq!(result.output.as_deref(), Some("partial\n"));
        assert_eq!(result.error.as_deref(), Some("boom\n"));
    }

    #[tokio::test]
    async fn test_nonzero_exit_without_stderr() {
        let result = shell_executor().execute("exit 3", "shell").await;
        assert!(result.is_error());
        assert!(result.output.is_none());
    }

    #[tokio::test]
    async fn test_timeout_kills_run() {
        let executor = shell_executor();
        let err = executor.run("sleep 5", "shell").await.unwrap_err();
        assert!(matches!(err, ExecutorError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_missing_interpreter() {
        let executor = CodeExecutor::new(
            ExecutorConfig::default().with_runtime("nope", Runtime::new("/definitely/not/here", ["-c"])),
        );
        let err = executor.run("1", "nope").await.unwrap_err();
        assert!(matches!(err, ExecutorError::Spawn { .. }));
    }

    #[test]
    fn test_result_to_envelope() {
        let ok = ExecutionResult {
            output: Some("2\n".into()),
            error: None,
        };
        assert_eq!(
            ok.to_envelope(),
            Envelope::code_output(OutputStatus::Completed, Some("2\n".into()), None)
        );
        let failed = ExecutionResult::failed("NameError: x");
        assert_eq!(
            failed.to_envelope(),
            Envelope::code_output(OutputStatus::Error, None, Some("NameError: x".into()))
        );
    }

    #[test]
    fn test_default_supports_python_only() {
        let executor = CodeExecutor::default();
        assert!(executor.supports("python"));
        assert!(!executor.supports("javascript"));
    }
}
