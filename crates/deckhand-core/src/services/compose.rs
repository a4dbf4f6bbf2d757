use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{DeckhandError, Result};

/// Observed state of a deployment's container group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservedState {
    /// No containers exist under the project namespace.
    NotFound,
    /// At least one container is running.
    Running,
    /// Containers exist but none are running.
    Stopped,
}

/// Narrow interface over the container/compose runtime, used both to drive
/// services and to discover orphans by namespace.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn up(&self, working_dir: &Path, project: &str) -> Result<()>;
    async fn stop(&self, working_dir: &Path, project: &str) -> Result<()>;
    async fn down(&self, working_dir: &Path, project: &str, volumes: bool) -> Result<()>;
    async fn project_state(&self, project: &str) -> Result<ObservedState>;
    /// All known compose project names starting with `prefix`.
    async fn list_projects(&self, prefix: &str) -> Result<Vec<String>>;
    /// Force-remove a project's containers without needing its working dir.
    async fn remove_project(&self, project: &str) -> Result<()>;
}

/// `docker compose` / `docker ps` on the PATH.
#[derive(Debug, Default)]
pub struct ComposeCli;

async fn run_docker(args: &[&str], working_dir: Option<&Path>) -> Result<String> {
    let mut cmd = Command::new("docker");
    cmd.args(args);
    if let Some(dir) = working_dir {
        cmd.current_dir(dir);
    }
    let output = cmd
        .output()
        .await
        .map_err(|e| DeckhandError::Runtime(format!("failed to run docker: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DeckhandError::Runtime(format!(
            "docker {} failed (exit {}): {stderr}",
            args.join(" "),
            output.status.code().unwrap_or(-1)
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[async_trait]
impl ContainerRuntime for ComposeCli {
    async fn up(&self, working_dir: &Path, project: &str) -> Result<()> {
        run_docker(&["compose", "-p", project, "up", "-d"], Some(working_dir)).await?;
        Ok(())
    }

    async fn stop(&self, working_dir: &Path, project: &str) -> Result<()> {
        run_docker(&["compose", "-p", project, "stop"], Some(working_dir)).await?;
        Ok(())
    }

    async fn down(&self, working_dir: &Path, project: &str, volumes: bool) -> Result<()> {
        let mut args = vec!["compose", "-p", project, "down", "--remove-orphans"];
        if volumes {
            args.push("--volumes");
        }
        run_docker(&args, Some(working_dir)).await?;
        Ok(())
    }

    async fn project_state(&self, project: &str) -> Result<ObservedState> {
        let filter = format!("label=com.docker.compose.project={project}");
        let output = run_docker(
            &["ps", "-a", "--filter", &filter, "--format", "{{.State}}"],
            None,
        )
        .await?;
        Ok(parse_states(&output))
    }

    async fn list_projects(&self, prefix: &str) -> Result<Vec<String>> {
        let output = run_docker(
            &[
                "ps",
                "-a",
                "--format",
                r#"{{.Label "com.docker.compose.project"}}"#,
            ],
            None,
        )
        .await?;
        Ok(parse_projects(&output, prefix))
    }

    async fn remove_project(&self, project: &str) -> Result<()> {
        let filter = format!("label=com.docker.compose.project={project}");
        let ids = run_docker(&["ps", "-aq", "--filter", &filter], None).await?;
        let ids: Vec<&str> = ids.lines().filter(|l| !l.is_empty()).collect();
        if ids.is_empty() {
            return Ok(());
        }
        let mut args = vec!["rm", "-f", "-v"];
        args.extend(ids);
        run_docker(&args, None).await?;
        Ok(())
    }
}

fn parse_states(output: &str) -> ObservedState {
    let states: Vec<&str> = output
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect();
    if states.is_empty() {
        ObservedState::NotFound
    } else if states.iter().any(|s| s.eq_ignore_ascii_case("running")) {
        ObservedState::Running
    } else {
        ObservedState::Stopped
    }
}

fn parse_projects(output: &str, prefix: &str) -> Vec<String> {
    let unique: BTreeSet<String> = output
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty() && l.starts_with(prefix))
        .map(|l| l.to_string())
        .collect();
    unique.into_iter().collect()
}
