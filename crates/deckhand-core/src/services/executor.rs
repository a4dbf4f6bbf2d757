use std::path::Path;
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use tokio::process::Command;

use crate::error::{DeckhandError, Result};
use crate::models::{TaskExecution, TaskKind};

/// Captured result of a single process run.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Seam over process execution so workflows can be driven in tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        working_dir: &Path,
        env: &[(String, String)],
        timeout: Duration,
    ) -> Result<CommandOutput>;
}

/// Runs real processes via tokio, with a hard timeout.
#[derive(Debug, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        working_dir: &Path,
        env: &[(String, String)],
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(working_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| {
                DeckhandError::NonTransientExternal(format!(
                    "{program} timed out after {}s",
                    timeout.as_secs()
                ))
            })?
            .map_err(|e| DeckhandError::NonTransientExternal(format!("failed to run {program}: {e}")))?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

static TRANSIENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)network|connection (refused|reset|closed)|could not resolve|temporar(y|ily)|timed? ?out|unreachable",
    )
    .unwrap()
});

/// Whether a failed attempt looks like a temporary condition worth retrying.
pub fn is_transient_failure(output: &CommandOutput) -> bool {
    if output.exit_code == 0 {
        return false;
    }
    TRANSIENT_RE.is_match(&output.stderr) || TRANSIENT_RE.is_match(&output.stdout)
}

/// Executes named workflow steps against a working directory with bounded
/// automatic retry for transient failures.
pub struct TaskExecutor {
    runner: std::sync::Arc<dyn CommandRunner>,
    max_attempts: u32,
    backoff_base: Duration,
    timeout: Duration,
}

impl TaskExecutor {
    pub fn new(
        runner: std::sync::Arc<dyn CommandRunner>,
        max_attempts: u32,
        backoff_base: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            max_attempts: max_attempts.max(1),
            backoff_base,
            timeout,
        }
    }

    /// One attempt, no retry. A nonzero exit is reported through the
    /// returned `TaskExecution`, not as an error.
    pub async fn run(
        &self,
        working_dir: &Path,
        program: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<TaskExecution> {
        let started = Instant::now();
        let output = self
            .runner
            .run(program, args, working_dir, env, self.timeout)
            .await?;
        Ok(TaskExecution {
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            attempts: 1,
            duration: started.elapsed(),
        })
    }

    /// Retry transient failures with exponential backoff (base, 2x, 4x...).
    ///
    /// Non-transient failures and timeouts return immediately. Intermediate
    /// failed attempts surface only as log entries; the caller sees the
    /// final `TaskExecution`.
    pub async fn run_with_retry(
        &self,
        working_dir: &Path,
        program: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<TaskExecution> {
        let started = Instant::now();
        let mut attempt = 1;
        loop {
            let output = self
                .runner
                .run(program, args, working_dir, env, self.timeout)
                .await?;

            if output.exit_code == 0 {
                if attempt > 1 {
                    tracing::info!(program, attempt, "command succeeded after retry");
                }
                return Ok(TaskExecution {
                    exit_code: output.exit_code,
                    stdout: output.stdout,
                    stderr: output.stderr,
                    attempts: attempt,
                    duration: started.elapsed(),
                });
            }

            let transient = is_transient_failure(&output);
            if !transient || attempt >= self.max_attempts {
                tracing::error!(
                    program,
                    attempt,
                    exit_code = output.exit_code,
                    transient,
                    "command failed"
                );
                return Ok(TaskExecution {
                    exit_code: output.exit_code,
                    stdout: output.stdout,
                    stderr: output.stderr,
                    attempts: attempt,
                    duration: started.elapsed(),
                });
            }

            let delay = self.backoff_base * 2u32.pow(attempt - 1);
            tracing::warn!(
                program,
                attempt,
                delay_secs = delay.as_secs_f64(),
                "transient failure, retrying"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// Run a permitted task-runner task. The closed `TaskKind` enum is the
    /// allow-list: no other task or flag can be expressed.
    pub async fn run_task(
        &self,
        working_dir: &Path,
        task: &TaskKind,
        env: &[(String, String)],
    ) -> Result<TaskExecution> {
        self.run_with_retry(working_dir, "invoke", &task.to_args(), env)
            .await
    }
}
