use std::time::Duration;

/// The closed set of task-runner invocations a deployment may run.
///
/// Each variant carries only the flags that task accepts, so an unknown
/// task/flag pair cannot be built, let alone reach the external process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    Start { detach: bool },
    Stop,
    Restart { quick: bool },
    ResetDb,
    Snapshot,
    RestoreSnapshot { name: String },
    Logs { tail: Option<u32>, container: Option<String> },
    Install { modules: String },
    Update { modules: String },
    Test { modules: String },
    /// Pull the pinned dependency repositories into the working tree.
    Aggregate,
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::Start { .. } => "start",
            TaskKind::Stop => "stop",
            TaskKind::Restart { .. } => "restart",
            TaskKind::ResetDb => "resetdb",
            TaskKind::Snapshot => "snapshot",
            TaskKind::RestoreSnapshot { .. } => "restore-snapshot",
            TaskKind::Logs { .. } => "logs",
            TaskKind::Install { .. } => "install",
            TaskKind::Update { .. } => "update",
            TaskKind::Test { .. } => "test",
            TaskKind::Aggregate => "git-aggregate",
        }
    }

    /// Argv for the task runner, task name first.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![self.name().to_string()];
        match self {
            TaskKind::Start { detach } => {
                if *detach {
                    args.push("--detach".into());
                }
            }
            TaskKind::Restart { quick } => {
                if *quick {
                    args.push("--quick".into());
                }
            }
            TaskKind::RestoreSnapshot { name } => {
                args.push("--snapshot-name".into());
                args.push(name.clone());
            }
            TaskKind::Logs { tail, container } => {
                if let Some(tail) = tail {
                    args.push("--tail".into());
                    args.push(tail.to_string());
                }
                if let Some(container) = container {
                    args.push("--container".into());
                    args.push(container.clone());
                }
            }
            TaskKind::Install { modules }
            | TaskKind::Update { modules }
            | TaskKind::Test { modules } => {
                args.push("--modules".into());
                args.push(modules.clone());
            }
            TaskKind::Stop | TaskKind::ResetDb | TaskKind::Snapshot | TaskKind::Aggregate => {}
        }
        args
    }
}

/// Outcome of one external-command run, ephemeral to the current workflow.
#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Total attempts made, including the one that produced this outcome.
    pub attempts: u32,
    pub duration: Duration,
}

impl TaskExecution {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Best-available diagnostic for surfacing to a caller.
    pub fn diagnostic(&self) -> String {
        if !self.stderr.trim().is_empty() {
            self.stderr.trim().to_string()
        } else if !self.stdout.trim().is_empty() {
            self.stdout.trim().to_string()
        } else {
            format!("command exited with code {}", self.exit_code)
        }
    }
}
