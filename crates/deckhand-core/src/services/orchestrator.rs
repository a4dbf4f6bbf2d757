use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};

use crate::error::{DeckhandError, Result};
use crate::models::{
    Deployment, DeploymentParams, DeploymentStatus, ManagerConfig, TaskExecution, TaskKind,
    VersionSpec,
};
use crate::services::allocator::{allocate_port, check_quota, subdomain_for};
use crate::services::compose::ContainerRuntime;
use crate::services::executor::TaskExecutor;
use crate::services::proxy::ProxyManager;
use crate::services::registry::{DeploymentFilter, Registry};
use crate::services::repo_cache::RepoCache;

/// Per-deployment exclusive locks. A second workflow against the same id
/// fails fast with `Conflict` instead of queueing behind the first.
#[derive(Default)]
pub struct IdLocks {
    busy: StdMutex<HashSet<String>>,
}

impl IdLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(self: &Arc<Self>, id: &str) -> Result<IdGuard> {
        let mut busy = self.busy.lock().unwrap_or_else(|e| e.into_inner());
        if !busy.insert(id.to_string()) {
            return Err(DeckhandError::Conflict(id.to_string()));
        }
        Ok(IdGuard {
            locks: Arc::clone(self),
            id: id.to_string(),
        })
    }

    pub fn is_locked(&self, id: &str) -> bool {
        self.busy
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(id)
    }
}

/// Releases the id on drop, including on panic and early return.
pub struct IdGuard {
    locks: Arc<IdLocks>,
    id: String,
}

impl Drop for IdGuard {
    fn drop(&mut self) {
        self.locks
            .busy
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

/// Step-level progress, streamed to whoever is watching the workflow.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub deployment_id: String,
    pub step: String,
    pub detail: String,
}

/// Drives the deployment lifecycle workflows against the injected
/// runtime, cache, executor, proxy and registry.
pub struct Orchestrator {
    config: ManagerConfig,
    registry: Arc<dyn Registry>,
    runtime: Arc<dyn ContainerRuntime>,
    cache: Arc<RepoCache>,
    executor: Arc<TaskExecutor>,
    proxy: Arc<ProxyManager>,
    locks: Arc<IdLocks>,
    /// Serializes quota check + port allocation + placeholder write.
    alloc_lock: Mutex<()>,
    progress: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ManagerConfig,
        registry: Arc<dyn Registry>,
        runtime: Arc<dyn ContainerRuntime>,
        cache: Arc<RepoCache>,
        executor: Arc<TaskExecutor>,
        proxy: Arc<ProxyManager>,
        locks: Arc<IdLocks>,
    ) -> Self {
        Self {
            config,
            registry,
            runtime,
            cache,
            executor,
            proxy,
            locks,
            alloc_lock: Mutex::new(()),
            progress: None,
        }
    }

    pub fn with_progress(mut self, tx: mpsc::UnboundedSender<ProgressEvent>) -> Self {
        self.progress = Some(tx);
        self
    }

    fn emit(&self, id: &str, step: &str, detail: impl Into<String>) {
        let detail = detail.into();
        tracing::info!(deployment = id, step, "{detail}");
        if let Some(tx) = &self.progress {
            let _ = tx.send(ProgressEvent {
                deployment_id: id.to_string(),
                step: step.to_string(),
                detail,
            });
        }
    }

    fn workdir(&self, id: &str) -> PathBuf {
        self.config.deployments_dir.join(id)
    }

    fn repo_dir(&self, id: &str) -> PathBuf {
        self.workdir(id).join("stack")
    }

    fn task_env(&self, deployment: &Deployment) -> Vec<(String, String)> {
        let ports = deployment.port_map();
        let mut env = vec![
            (
                "COMPOSE_PROJECT_NAME".into(),
                deployment.project_name(&self.config.namespace_prefix),
            ),
            ("DEPLOYMENT_ID".into(), deployment.id.clone()),
            (
                "STACK_VERSION".into(),
                deployment.version_spec.version.clone(),
            ),
            ("VIRTUAL_HOST".into(), deployment.subdomain.clone()),
        ];
        for (name, port) in &ports {
            let key = format!("{}_PORT", name.to_uppercase().replace('-', "_"));
            env.push((key, port.to_string()));
        }
        env
    }

    /// Write the working directory's `.env` and dependency pin file from the
    /// deployment record. Re-run on every update so the files always mirror
    /// the stored version spec.
    async fn render_config_files(&self, deployment: &Deployment) -> Result<()> {
        let repo_dir = self.repo_dir(&deployment.id);
        let mut dotenv = String::new();
        for (key, value) in self.task_env(deployment) {
            dotenv.push_str(&format!("{key}={value}\n"));
        }
        tokio::fs::write(repo_dir.join(".env"), dotenv)
            .await
            .map_err(|e| DeckhandError::State(format!("failed to write .env: {e}")))?;

        let pins = serde_yaml::to_string(&deployment.version_spec)?;
        tokio::fs::write(repo_dir.join("pins.yaml"), pins)
            .await
            .map_err(|e| DeckhandError::State(format!("failed to write pins: {e}")))?;
        Ok(())
    }

    async fn run_task_checked(&self, deployment: &Deployment, task: &TaskKind) -> Result<()> {
        let execution = self
            .executor
            .run_task(
                &self.repo_dir(&deployment.id),
                task,
                &self.task_env(deployment),
            )
            .await?;
        if !execution.success() {
            return Err(DeckhandError::NonTransientExternal(format!(
                "task '{}' failed after {} attempt(s): {}",
                task.name(),
                execution.attempts,
                execution.diagnostic()
            )));
        }
        Ok(())
    }

    /// Provision a new deployment: reserve resources, materialize the stack,
    /// initialize the database, start containers, and publish the vhost.
    ///
    /// On failure the record stays in the registry with status `Error` and
    /// its port/subdomain reservation intact; only containers, the working
    /// directory and the vhost are cleaned up.
    pub async fn create(&self, params: DeploymentParams) -> Result<Deployment> {
        params.validate()?;
        let id = params.id();
        let _guard = self.locks.acquire(&id)?;

        if self.registry.get(&id).await.is_ok() {
            return Err(DeckhandError::AlreadyExists(id));
        }

        let mut deployment = {
            let _alloc = self.alloc_lock.lock().await;
            check_quota(&self.registry, &sanitized_owner(&params), &self.config).await?;
            let all = self.registry.list(&DeploymentFilter::default()).await?;
            let bases: Vec<u16> = all.iter().map(|d| d.port_base).collect();
            let port_base = allocate_port(
                &bases,
                self.config.port_range_start,
                self.config.port_range_end,
                self.config.port_increment,
            )?;
            let subdomain = subdomain_for(&id, &self.config.base_domain);
            let deployment = Deployment::new(&params, port_base, subdomain);
            // Placeholder record reserves the port slot and the quota count.
            self.registry.put(&deployment).await?;
            deployment
        };

        self.emit(&id, "reserve", format!("base port {}", deployment.port_base));

        match self.provision(&deployment).await {
            Ok(()) => {
                deployment.transition_to(DeploymentStatus::Running)?;
                deployment.last_action = "created".into();
                self.registry.put(&deployment).await?;
                self.emit(&id, "done", "deployment running");
                Ok(deployment)
            }
            Err(e) => {
                self.emit(&id, "failed", e.to_string());
                deployment.last_action = e.to_string();
                if let Err(transition) = deployment.transition_to(DeploymentStatus::Error) {
                    tracing::error!(deployment = %id, error = %transition, "could not mark error");
                }
                if let Err(put) = self.registry.put(&deployment).await {
                    tracing::error!(deployment = %id, error = %put, "could not persist error state");
                }
                self.cleanup_partial(&deployment).await;
                Err(e)
            }
        }
    }

    async fn provision(&self, deployment: &Deployment) -> Result<()> {
        let id = &deployment.id;
        let repo_dir = self.repo_dir(id);

        self.emit(id, "fetch", "materializing stack repository");
        self.cache
            .copy_to(
                &self.config.stack_repo_url,
                &self.config.stack_repo_ref,
                &repo_dir,
            )
            .await?;
        self.render_config_files(deployment).await?;

        self.emit(id, "aggregate", "pulling pinned dependencies");
        self.run_task_checked(deployment, &TaskKind::Aggregate)
            .await?;

        self.emit(id, "initdb", "initializing database");
        self.run_task_checked(deployment, &TaskKind::ResetDb).await?;

        self.emit(id, "start", "starting containers");
        self.runtime
            .up(
                &repo_dir,
                &deployment.project_name(&self.config.namespace_prefix),
            )
            .await?;

        self.emit(id, "publish", "publishing vhost");
        self.proxy.ensure_config(deployment).await?;
        Ok(())
    }

    /// Best-effort removal of the partial artifacts of a failed creation.
    /// The registry record and its reservations are deliberately kept.
    async fn cleanup_partial(&self, deployment: &Deployment) {
        let project = deployment.project_name(&self.config.namespace_prefix);
        if let Err(e) = self.runtime.remove_project(&project).await {
            tracing::warn!(deployment = %deployment.id, error = %e, "partial container cleanup failed");
        }
        let workdir = self.workdir(&deployment.id);
        if workdir.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&workdir).await {
                tracing::warn!(deployment = %deployment.id, error = %e, "partial workdir cleanup failed");
            }
        }
        if let Err(e) = self.proxy.remove_config(&deployment.id).await {
            tracing::warn!(deployment = %deployment.id, error = %e, "partial vhost cleanup failed");
        }
    }

    pub async fn start(&self, id: &str) -> Result<Deployment> {
        let _guard = self.locks.acquire(id)?;
        let mut deployment = self.registry.get(id).await?;
        if !deployment.status.can_transition(DeploymentStatus::Running) {
            return Err(DeckhandError::InvalidTransition {
                from: deployment.status.as_str().to_string(),
                to: DeploymentStatus::Running.as_str().to_string(),
            });
        }
        self.runtime
            .up(
                &self.repo_dir(id),
                &deployment.project_name(&self.config.namespace_prefix),
            )
            .await?;
        deployment.transition_to(DeploymentStatus::Running)?;
        deployment.last_action = "started".into();
        self.registry.put(&deployment).await?;
        self.emit(id, "start", "containers running");
        Ok(deployment)
    }

    pub async fn stop(&self, id: &str) -> Result<Deployment> {
        let _guard = self.locks.acquire(id)?;
        let mut deployment = self.registry.get(id).await?;
        if !deployment.status.can_transition(DeploymentStatus::Stopped) {
            return Err(DeckhandError::InvalidTransition {
                from: deployment.status.as_str().to_string(),
                to: DeploymentStatus::Stopped.as_str().to_string(),
            });
        }
        self.runtime
            .stop(
                &self.repo_dir(id),
                &deployment.project_name(&self.config.namespace_prefix),
            )
            .await?;
        deployment.transition_to(DeploymentStatus::Stopped)?;
        deployment.last_action = "stopped".into();
        self.registry.put(&deployment).await?;
        self.emit(id, "stop", "containers stopped");
        Ok(deployment)
    }

    /// Re-pin the deployment to a new version spec and re-run the update
    /// workflow. This is also the recovery path out of `Error`: a successful
    /// update resumes the pre-update status (or `Stopped` from `Error`).
    pub async fn update(&self, id: &str, version_spec: VersionSpec) -> Result<Deployment> {
        let _guard = self.locks.acquire(id)?;
        let mut deployment = self.registry.get(id).await?;

        let resume_to = match deployment.status {
            DeploymentStatus::Running => DeploymentStatus::Running,
            _ => DeploymentStatus::Stopped,
        };
        deployment.transition_to(DeploymentStatus::Updating)?;
        deployment.version_spec = version_spec;
        self.registry.put(&deployment).await?;

        match self.apply_update(&deployment, resume_to).await {
            Ok(()) => {
                deployment.transition_to(resume_to)?;
                deployment.last_action = "updated".into();
                self.registry.put(&deployment).await?;
                self.emit(id, "done", format!("updated, now {}", resume_to.as_str()));
                Ok(deployment)
            }
            Err(e) => {
                self.emit(id, "failed", e.to_string());
                deployment.last_action = e.to_string();
                if let Err(transition) = deployment.transition_to(DeploymentStatus::Error) {
                    tracing::error!(deployment = %id, error = %transition, "could not mark error");
                }
                if let Err(put) = self.registry.put(&deployment).await {
                    tracing::error!(deployment = %id, error = %put, "could not persist error state");
                }
                Err(e)
            }
        }
    }

    async fn apply_update(&self, deployment: &Deployment, resume_to: DeploymentStatus) -> Result<()> {
        let id = &deployment.id;
        let repo_dir = self.repo_dir(id);
        if !repo_dir.exists() {
            self.emit(id, "fetch", "re-materializing stack repository");
            self.cache
                .copy_to(
                    &self.config.stack_repo_url,
                    &self.config.stack_repo_ref,
                    &repo_dir,
                )
                .await?;
        }
        self.render_config_files(deployment).await?;

        self.emit(id, "aggregate", "pulling pinned dependencies");
        self.run_task_checked(deployment, &TaskKind::Aggregate)
            .await?;

        self.emit(id, "update", "applying module updates");
        self.run_task_checked(
            deployment,
            &TaskKind::Update {
                modules: "all".into(),
            },
        )
        .await?;

        let project = deployment.project_name(&self.config.namespace_prefix);
        match resume_to {
            DeploymentStatus::Running => self.runtime.up(&repo_dir, &project).await?,
            _ => self.runtime.stop(&repo_dir, &project).await?,
        }
        self.proxy.ensure_config(deployment).await?;
        Ok(())
    }

    /// Tear a deployment down and release every resource it holds. The
    /// record is marked `Deleting` first, so an interrupted delete leaves a
    /// breadcrumb the reconciler retries later.
    pub async fn delete(&self, id: &str) -> Result<()> {
        let _guard = self.locks.acquire(id)?;
        let mut deployment = self.registry.get(id).await?;
        deployment.transition_to(DeploymentStatus::Deleting)?;
        self.registry.put(&deployment).await?;

        self.emit(id, "delete", "tearing down");
        teardown(
            &self.config,
            &self.registry,
            &self.runtime,
            &self.proxy,
            &deployment,
        )
        .await?;
        self.emit(id, "done", "deleted");
        Ok(())
    }

    /// Run one allow-listed task against a deployment's working directory.
    pub async fn execute_task(&self, id: &str, task: TaskKind) -> Result<TaskExecution> {
        let _guard = self.locks.acquire(id)?;
        let deployment = self.registry.get(id).await?;
        let repo_dir = self.repo_dir(id);
        if !repo_dir.exists() {
            return Err(DeckhandError::State(format!(
                "working directory for '{id}' is missing; run update to restore it"
            )));
        }
        self.executor
            .run_task(&repo_dir, &task, &self.task_env(&deployment))
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Deployment> {
        self.registry.get(id).await
    }

    pub async fn list(&self, filter: &DeploymentFilter) -> Result<Vec<Deployment>> {
        self.registry.list(filter).await
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }
}

fn sanitized_owner(params: &DeploymentParams) -> String {
    crate::models::sanitize_owner(&params.owner)
}

/// Full resource teardown for a `Deleting` deployment: containers and
/// volumes, working directory, vhost, then the registry record. Shared
/// between the delete workflow and the reconciler's retry of interrupted
/// deletes. Failure leaves the `Deleting` record in place.
pub(crate) async fn teardown(
    config: &ManagerConfig,
    registry: &Arc<dyn Registry>,
    runtime: &Arc<dyn ContainerRuntime>,
    proxy: &Arc<ProxyManager>,
    deployment: &Deployment,
) -> Result<()> {
    let project = deployment.project_name(&config.namespace_prefix);
    let repo_dir = config.deployments_dir.join(&deployment.id).join("stack");
    if repo_dir.exists() {
        runtime.down(&repo_dir, &project, true).await?;
    } else {
        runtime.remove_project(&project).await?;
    }

    let workdir = config.deployments_dir.join(&deployment.id);
    if workdir.exists() {
        tokio::fs::remove_dir_all(&workdir)
            .await
            .map_err(|e| DeckhandError::State(format!("failed to remove workdir: {e}")))?;
    }

    proxy.remove_config(&deployment.id).await?;
    registry.delete(&deployment.id).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::compose::ObservedState;
    use crate::services::executor::{CommandOutput, CommandRunner};
    use crate::services::git::GitClient;
    use crate::services::proxy::ProxyGateway;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::path::Path;
    use std::sync::Mutex as TestMutex;

    struct FakeGit;

    #[async_trait]
    impl GitClient for FakeGit {
        async fn clone_repo(
            &self,
            _url: &str,
            _reference: &str,
            dest: &Path,
            _shallow: bool,
        ) -> Result<()> {
            std::fs::create_dir_all(dest.join(".git"))?;
            std::fs::write(dest.join("compose.yaml"), "services: {}\n")?;
            Ok(())
        }

        async fn fetch_ref(&self, _repo: &Path, _reference: &str) -> Result<()> {
            Ok(())
        }

        async fn checkout(&self, _repo: &Path, _reference: &str) -> Result<()> {
            Ok(())
        }

        async fn list_remote_tags(&self, _url: &str) -> Result<Vec<String>> {
            Ok(vec![])
        }

        async fn list_remote_branches(&self, _url: &str) -> Result<Vec<String>> {
            Ok(vec![])
        }

        async fn gc(&self, _repo: &Path) -> Result<()> {
            Ok(())
        }

        async fn convert_to_shallow(&self, _repo: &Path, _reference: &str) -> Result<()> {
            Ok(())
        }

        fn is_shallow(&self, _repo: &Path) -> bool {
            true
        }
    }

    #[derive(Default)]
    struct FakeRuntime {
        states: TestMutex<HashMap<String, ObservedState>>,
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn up(&self, _working_dir: &Path, project: &str) -> Result<()> {
            self.states
                .lock()
                .unwrap()
                .insert(project.into(), ObservedState::Running);
            Ok(())
        }

        async fn stop(&self, _working_dir: &Path, project: &str) -> Result<()> {
            self.states
                .lock()
                .unwrap()
                .insert(project.into(), ObservedState::Stopped);
            Ok(())
        }

        async fn down(&self, _working_dir: &Path, project: &str, _volumes: bool) -> Result<()> {
            self.states.lock().unwrap().remove(project);
            Ok(())
        }

        async fn project_state(&self, project: &str) -> Result<ObservedState> {
            Ok(*self
                .states
                .lock()
                .unwrap()
                .get(project)
                .unwrap_or(&ObservedState::NotFound))
        }

        async fn list_projects(&self, prefix: &str) -> Result<Vec<String>> {
            Ok(self
                .states
                .lock()
                .unwrap()
                .keys()
                .filter(|p| p.starts_with(prefix))
                .cloned()
                .collect())
        }

        async fn remove_project(&self, project: &str) -> Result<()> {
            self.states.lock().unwrap().remove(project);
            Ok(())
        }
    }

    /// Fails any invocation whose task name is in `fail_tasks`.
    #[derive(Default)]
    struct FakeRunner {
        fail_tasks: Vec<String>,
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(
            &self,
            _program: &str,
            args: &[String],
            _working_dir: &Path,
            _env: &[(String, String)],
            _timeout: Duration,
        ) -> Result<CommandOutput> {
            let task = args.first().cloned().unwrap_or_default();
            if self.fail_tasks.contains(&task) {
                Ok(CommandOutput {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: format!("task {task} exploded"),
                })
            } else {
                Ok(CommandOutput {
                    exit_code: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                })
            }
        }
    }

    #[derive(Default)]
    struct FakeGateway {
        files: TestMutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl ProxyGateway for FakeGateway {
        async fn read_file(&self, name: &str) -> Result<Option<String>> {
            Ok(self.files.lock().unwrap().get(name).cloned())
        }

        async fn write_file(&self, name: &str, content: &str) -> Result<()> {
            self.files
                .lock()
                .unwrap()
                .insert(name.into(), content.into());
            Ok(())
        }

        async fn remove_file(&self, name: &str) -> Result<()> {
            self.files.lock().unwrap().remove(name);
            Ok(())
        }

        async fn list_configs(&self) -> Result<Vec<String>> {
            Ok(self.files.lock().unwrap().keys().cloned().collect())
        }

        async fn test_config(&self) -> Result<()> {
            Ok(())
        }

        async fn reload(&self) -> Result<()> {
            Ok(())
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        runtime: Arc<FakeRuntime>,
        gateway: Arc<FakeGateway>,
        _root: tempfile::TempDir,
    }

    fn harness(fail_tasks: Vec<&str>) -> Harness {
        let root = tempfile::tempdir().unwrap();
        let config = ManagerConfig {
            deployments_dir: root.path().join("deployments"),
            cache_dir: root.path().join("cache"),
            registry_dir: root.path().join("registry"),
            ..Default::default()
        };
        let registry: Arc<dyn Registry> = Arc::new(crate::services::registry::MemoryRegistry::new());
        let runtime = Arc::new(FakeRuntime::default());
        let cache = Arc::new(RepoCache::new(
            config.cache_dir.clone(),
            config.cache_ttl_secs,
            config.cache_shallow_threshold_bytes,
            Arc::new(FakeGit),
        ));
        let executor = Arc::new(TaskExecutor::new(
            Arc::new(FakeRunner {
                fail_tasks: fail_tasks.into_iter().map(String::from).collect(),
            }),
            1,
            Duration::from_millis(1),
            Duration::from_secs(5),
        ));
        let gateway = Arc::new(FakeGateway::default());
        let proxy = Arc::new(ProxyManager::new(
            gateway.clone(),
            config.internal_domain_suffix.clone(),
        ));
        let orchestrator = Orchestrator::new(
            config,
            registry,
            runtime.clone() as Arc<dyn ContainerRuntime>,
            cache,
            executor,
            proxy,
            Arc::new(IdLocks::new()),
        );
        Harness {
            orchestrator,
            runtime,
            gateway,
            _root: root,
        }
    }

    fn params(owner: &str, name: &str) -> DeploymentParams {
        DeploymentParams {
            owner: owner.into(),
            name: name.into(),
            version_spec: VersionSpec {
                version: "17.0".into(),
                dependency_refs: Default::default(),
            },
            notes: String::new(),
        }
    }

    #[tokio::test]
    async fn create_provisions_everything() {
        let h = harness(vec![]);
        let d = h.orchestrator.create(params("team1", "demo")).await.unwrap();

        assert_eq!(d.status, DeploymentStatus::Running);
        assert_eq!(d.port_base, 18000);
        assert_eq!(d.subdomain, "team1-demo.test.example.org");

        let repo_dir = h.orchestrator.repo_dir(&d.id);
        assert!(repo_dir.join("compose.yaml").exists());
        assert!(repo_dir.join(".env").exists());
        assert!(repo_dir.join("pins.yaml").exists());

        let env = std::fs::read_to_string(repo_dir.join(".env")).unwrap();
        assert!(env.contains("APP_PORT=18000"));
        assert!(env.contains("DB_ADMIN_PORT=18081"));

        assert_eq!(
            h.runtime.project_state("stack_team1_demo").await.unwrap(),
            ObservedState::Running
        );
        assert!(h
            .gateway
            .files
            .lock()
            .unwrap()
            .contains_key("team1-demo.conf"));
    }

    #[tokio::test]
    async fn failed_create_keeps_record_and_reservation() {
        let h = harness(vec!["git-aggregate"]);
        assert!(h.orchestrator.create(params("team1", "demo")).await.is_err());

        let d = h.orchestrator.get("team1-demo").await.unwrap();
        assert_eq!(d.status, DeploymentStatus::Error);
        assert_eq!(d.port_base, 18000);
        assert!(d.last_action.contains("git-aggregate"));

        // Workdir and containers are cleaned up, the reservation is not.
        assert!(!h.orchestrator.workdir("team1-demo").exists());
        assert_eq!(
            h.runtime.project_state("stack_team1_demo").await.unwrap(),
            ObservedState::NotFound
        );
    }

    #[tokio::test]
    async fn error_records_still_hold_their_port() {
        let h = harness(vec!["git-aggregate"]);
        assert!(h.orchestrator.create(params("team1", "one")).await.is_err());

        // The failed record keeps 18000, so a rebuilt harness state would
        // hand the next creation the following slot.
        let all = h
            .orchestrator
            .list(&DeploymentFilter::default())
            .await
            .unwrap();
        let bases: Vec<u16> = all.iter().map(|d| d.port_base).collect();
        assert_eq!(
            allocate_port(&bases, 18000, 19000, 100).unwrap(),
            18100
        );
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let h = harness(vec![]);
        h.orchestrator.create(params("team1", "demo")).await.unwrap();
        assert!(matches!(
            h.orchestrator.create(params("team1", "demo")).await,
            Err(DeckhandError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn locked_id_conflicts_immediately() {
        let h = harness(vec![]);
        let _held = h.orchestrator.locks.acquire("team1-demo").unwrap();
        assert!(matches!(
            h.orchestrator.create(params("team1", "demo")).await,
            Err(DeckhandError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn stop_and_start_round_trip() {
        let h = harness(vec![]);
        let d = h.orchestrator.create(params("team1", "demo")).await.unwrap();

        let stopped = h.orchestrator.stop(&d.id).await.unwrap();
        assert_eq!(stopped.status, DeploymentStatus::Stopped);
        assert_eq!(
            h.runtime.project_state("stack_team1_demo").await.unwrap(),
            ObservedState::Stopped
        );

        let started = h.orchestrator.start(&d.id).await.unwrap();
        assert_eq!(started.status, DeploymentStatus::Running);
    }

    #[tokio::test]
    async fn start_from_running_is_rejected() {
        let h = harness(vec![]);
        let d = h.orchestrator.create(params("team1", "demo")).await.unwrap();
        assert!(matches!(
            h.orchestrator.start(&d.id).await,
            Err(DeckhandError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn update_resumes_prior_status() {
        let h = harness(vec![]);
        let d = h.orchestrator.create(params("team1", "demo")).await.unwrap();
        h.orchestrator.stop(&d.id).await.unwrap();

        let spec = VersionSpec {
            version: "17.1".into(),
            dependency_refs: Default::default(),
        };
        let updated = h.orchestrator.update(&d.id, spec).await.unwrap();
        assert_eq!(updated.status, DeploymentStatus::Stopped);
        assert_eq!(updated.version_spec.version, "17.1");
    }

    #[tokio::test]
    async fn update_recovers_from_error() {
        let h = harness(vec!["git-aggregate"]);
        assert!(h.orchestrator.create(params("team1", "demo")).await.is_err());
        assert_eq!(
            h.orchestrator.get("team1-demo").await.unwrap().status,
            DeploymentStatus::Error
        );

        // A fresh harness whose tasks succeed would now repair it; here the
        // same failing task keeps it in Error with a fresh diagnostic.
        let spec = VersionSpec {
            version: "17.1".into(),
            dependency_refs: Default::default(),
        };
        assert!(h.orchestrator.update("team1-demo", spec).await.is_err());
        let d = h.orchestrator.get("team1-demo").await.unwrap();
        assert_eq!(d.status, DeploymentStatus::Error);
    }

    #[tokio::test]
    async fn failed_update_marks_error() {
        let h = harness(vec!["update"]);
        let d = h.orchestrator.create(params("team1", "demo")).await.unwrap();
        let spec = VersionSpec {
            version: "17.1".into(),
            dependency_refs: Default::default(),
        };
        assert!(h.orchestrator.update(&d.id, spec).await.is_err());
        let d = h.orchestrator.get(&d.id).await.unwrap();
        assert_eq!(d.status, DeploymentStatus::Error);
        assert!(d.last_action.contains("update"));
    }

    #[tokio::test]
    async fn delete_releases_all_resources() {
        let h = harness(vec![]);
        let d = h.orchestrator.create(params("team1", "demo")).await.unwrap();
        h.orchestrator.delete(&d.id).await.unwrap();

        assert!(matches!(
            h.orchestrator.get(&d.id).await,
            Err(DeckhandError::NotFound(_))
        ));
        assert!(!h.orchestrator.workdir(&d.id).exists());
        assert_eq!(
            h.runtime.project_state("stack_team1_demo").await.unwrap(),
            ObservedState::NotFound
        );
        assert!(h.gateway.files.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn quota_blocks_fourth_deployment() {
        let h = harness(vec![]);
        h.orchestrator.create(params("team1", "one")).await.unwrap();
        h.orchestrator.create(params("team1", "two")).await.unwrap();
        h.orchestrator.create(params("team1", "three")).await.unwrap();
        assert!(matches!(
            h.orchestrator.create(params("team1", "four")).await,
            Err(DeckhandError::QuotaExceeded { .. })
        ));
        // A different owner is unaffected
        h.orchestrator.create(params("team2", "one")).await.unwrap();
    }

    #[tokio::test]
    async fn execute_task_runs_in_workdir() {
        let h = harness(vec![]);
        let d = h.orchestrator.create(params("team1", "demo")).await.unwrap();
        let execution = h
            .orchestrator
            .execute_task(&d.id, TaskKind::Logs { tail: Some(10), container: None })
            .await
            .unwrap();
        assert!(execution.success());
    }

    #[tokio::test]
    async fn ports_do_not_collide_across_creations() {
        let h = harness(vec![]);
        let a = h.orchestrator.create(params("team1", "one")).await.unwrap();
        let b = h.orchestrator.create(params("team2", "two")).await.unwrap();
        let c = h.orchestrator.create(params("team3", "three")).await.unwrap();
        let mut bases = vec![a.port_base, b.port_base, c.port_base];
        bases.sort_unstable();
        assert_eq!(bases, vec![18000, 18100, 18200]);
    }
}
