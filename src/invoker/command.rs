//! Worker backed by an external program.
//!
//! The program receives `{"task": ..., "inputs": [...]}` as JSON on stdin
//! and prints its payload on stdout. Exit codes:
//! - 0: success
//! - 75 (`EX_TEMPFAIL`): transient failure, retried
//! - anything else: permanent failure

use crate::config::WorkerCommand;
use async_trait::async_trait;
use conductor_common::{Artifact, FailureKind, TaskFailure, TaskSpec, Worker, WorkerOutput};
use serde::Serialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

/// Exit code a command uses to ask for a retry.
pub const EXIT_TEMPFAIL: i32 = 75;

#[derive(Serialize)]
struct Request<'a> {
    task: &'a TaskSpec,
    inputs: &'a [Artifact],
}

#[derive(Debug, Clone)]
pub struct CommandWorker {
    program: String,
    args: Vec<String>,
    working_dir: PathBuf,
    timeout: Option<Duration>,
}

impl CommandWorker {
    pub fn new(program: impl Into<String>, args: Vec<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: working_dir.into(),
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build from a `[workers.<producer>]` entry; `None` if the command is empty.
    pub fn from_entry(entry: &WorkerCommand, working_dir: &Path) -> Option<Self> {
        let (program, args) = entry.command.split_first()?;
        let mut worker = Self::new(program.clone(), args.to_vec(), working_dir);
        if let Some(secs) = entry.timeout_secs {
            worker = worker.with_timeout(Duration::from_secs(secs));
        }
        Some(worker)
    }

    async fn run(&self, task: &TaskSpec, inputs: &[Artifact]) -> Result<std::process::Output, TaskFailure> {
        let request = serde_json::to_vec(&Request { task, inputs }).map_err(|e| {
            TaskFailure::permanent(FailureKind::MalformedInput, format!("cannot encode request: {}", e))
        })?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("CONDUCTOR_TASK", task.id.as_str())
            .env("CONDUCTOR_PHASE", task.phase.as_str())
            .env("CONDUCTOR_PRODUCER", &task.producer)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TaskFailure::transient(
                    FailureKind::Unavailable,
                    format!("failed to spawn '{}': {}", self.program, e),
                )
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A program that ignores its input closes the pipe early
            if let Err(e) = stdin.write_all(&request).await {
                tracing::debug!(program = %self.program, error = %e, "Worker closed stdin early");
            }
            // stdin is dropped here, closing the pipe
        }

        let output = child.wait_with_output();
        let result = match self.timeout {
            Some(limit) => timeout(limit, output).await.map_err(|_| {
                TaskFailure::timeout(format!(
                    "'{}' did not finish within {}s",
                    self.program,
                    limit.as_secs()
                ))
            })?,
            None => output.await,
        };
        result.map_err(|e| {
            TaskFailure::transient(
                FailureKind::Unavailable,
                format!("failed to wait for '{}': {}", self.program, e),
            )
        })
    }
}

#[async_trait]
impl Worker for CommandWorker {
    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn invoke(&self, task: &TaskSpec, inputs: &[Artifact]) -> Result<WorkerOutput, TaskFailure> {
        let output = self.run(task, inputs).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        match output.status.code() {
            Some(0) => {
                let trimmed = stdout.trim();
                let payload = serde_json::from_str::<Value>(trimmed)
                    .unwrap_or_else(|_| Value::String(trimmed.to_string()));
                Ok(WorkerOutput::new(task.output.clone(), payload))
            }
            Some(EXIT_TEMPFAIL) => Err(TaskFailure::transient(
                FailureKind::Unavailable,
                failure_message(&self.program, EXIT_TEMPFAIL, &stderr),
            )),
            Some(code) => Err(TaskFailure::permanent(
                FailureKind::Other,
                failure_message(&self.program, code, &stderr),
            )),
            // Killed by a signal
            None => Err(TaskFailure::permanent(
                FailureKind::Crashed,
                format!("'{}' was terminated by a signal", self.program),
            )),
        }
    }
}

fn failure_message(program: &str, code: i32, stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("'{}' exited with code {}", program, code)
    } else {
        format!("'{}' exited with code {}: {}", program, code, stderr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_common::PhaseId;
    use serde_json::json;
    use tempfile::tempdir;

    fn task() -> TaskSpec {
        TaskSpec::new(&PhaseId::new("architecture"), "architect", "architecture.design")
    }

    fn sh(script: &str, dir: &Path) -> CommandWorker {
        CommandWorker::new("sh", vec!["-c".to_string(), script.to_string()], dir)
    }

    #[tokio::test]
    async fn test_json_stdout_is_payload() {
        let dir = tempdir().unwrap();
        let worker = sh(r#"cat > /dev/null; echo '{"components": 3}'"#, dir.path());
        let output = worker.invoke(&task(), &[]).await.unwrap();
        assert_eq!(output.schema.as_str(), "architecture.design");
        assert_eq!(output.payload, json!({"components": 3}));
    }

    #[tokio::test]
    async fn test_plain_stdout_becomes_string() {
        let dir = tempdir().unwrap();
        let worker = sh("cat > /dev/null; echo 'three services'", dir.path());
        let output = worker.invoke(&task(), &[]).await.unwrap();
        assert_eq!(output.payload, json!("three services"));
    }

    #[tokio::test]
    async fn test_request_is_written_to_stdin() {
        let dir = tempdir().unwrap();
        let worker = sh("cat", dir.path());
        let output = worker.invoke(&task(), &[]).await.unwrap();
        assert_eq!(output.payload["task"]["producer"], json!("architect"));
        assert_eq!(output.payload["inputs"], json!([]));
    }

    #[tokio::test]
    async fn test_tempfail_exit_is_transient() {
        let dir = tempdir().unwrap();
        let worker = sh("echo 'rate limited' >&2; exit 75", dir.path());
        let failure = worker.invoke(&task(), &[]).await.unwrap_err();
        assert!(failure.recoverable);
        assert!(failure.message.contains("rate limited"));
    }

    #[tokio::test]
    async fn test_other_exit_is_permanent() {
        let dir = tempdir().unwrap();
        let failure = sh("exit 3", dir.path()).invoke(&task(), &[]).await.unwrap_err();
        assert!(!failure.recoverable);
        assert!(failure.message.contains("code 3"));
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let dir = tempdir().unwrap();
        let worker = sh("sleep 5", dir.path()).with_timeout(Duration::from_millis(100));
        let failure = worker.invoke(&task(), &[]).await.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Timeout);
    }

    #[test]
    fn test_from_entry() {
        let entry = WorkerCommand {
            command: vec!["./architect.sh".into(), "--fast".into()],
            timeout_secs: Some(30),
        };
        let worker = CommandWorker::from_entry(&entry, Path::new("/tmp")).unwrap();
        assert_eq!(worker.program, "./architect.sh");
        assert_eq!(worker.args, vec!["--fast"]);
        assert_eq!(worker.timeout, Some(Duration::from_secs(30)));

        let empty = WorkerCommand {
            command: vec![],
            timeout_secs: None,
        };
        assert!(CommandWorker::from_entry(&empty, Path::new("/tmp")).is_none());
    }
}
