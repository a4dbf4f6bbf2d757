use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use deckhand_core::models::{
    Deployment, DeploymentParams, DeploymentStatus, ManagerConfig, TaskKind, VersionSpec,
};
use deckhand_core::services::compose::{ComposeCli, ContainerRuntime};
use deckhand_core::services::config_loader;
use deckhand_core::services::executor::{ProcessRunner, TaskExecutor};
use deckhand_core::services::git::CliGit;
use deckhand_core::services::orchestrator::{IdLocks, Orchestrator, ProgressEvent};
use deckhand_core::services::proxy::{ProxyManager, SudoProxyGateway};
use deckhand_core::services::reconciler::Reconciler;
use deckhand_core::services::registry::{DeploymentFilter, FileRegistry, Registry};
use deckhand_core::services::repo_cache::RepoCache;

#[derive(Parser)]
#[command(name = "deckhand", version, about = "Single-host deployment manager")]
struct Cli {
    /// Path to the configuration file (defaults to ./deckhand.yaml if present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create and start a new deployment.
    Create {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        version: String,
        /// Dependency ref override, NAME=REF. Repeatable.
        #[arg(long = "dep", value_name = "NAME=REF")]
        deps: Vec<String>,
        #[arg(long, default_value = "")]
        notes: String,
    },
    /// List deployments.
    List {
        #[arg(long)]
        owner: Option<String>,
        #[arg(long)]
        status: Option<String>,
    },
    /// Show one deployment in detail.
    Status { id: String },
    /// Start a stopped deployment.
    Start { id: String },
    /// Stop a running deployment.
    Stop { id: String },
    /// Re-pin a deployment to a new version and apply updates.
    Update {
        id: String,
        #[arg(long)]
        version: String,
        #[arg(long = "dep", value_name = "NAME=REF")]
        deps: Vec<String>,
    },
    /// Tear down a deployment and release its resources.
    Delete { id: String },
    /// Run a maintenance task inside a deployment.
    Task {
        id: String,
        #[command(subcommand)]
        task: TaskCommand,
    },
    /// Repair drift between records, containers and vhosts.
    Reconcile {
        /// Keep running on the configured interval instead of one pass.
        #[arg(long)]
        watch: bool,
    },
    /// List versions available from the stack repository.
    Versions,
    /// Inspect or maintain the repository cache.
    Cache {
        #[command(subcommand)]
        action: CacheCommand,
    },
}

#[derive(Subcommand)]
enum TaskCommand {
    Start {
        #[arg(long)]
        detach: bool,
    },
    Stop,
    Restart {
        #[arg(long)]
        quick: bool,
    },
    Resetdb,
    Snapshot,
    RestoreSnapshot {
        #[arg(long)]
        name: String,
    },
    Logs {
        #[arg(long)]
        tail: Option<u32>,
        #[arg(long)]
        container: Option<String>,
    },
    Install {
        #[arg(long)]
        modules: String,
    },
    Update {
        #[arg(long)]
        modules: String,
    },
    Test {
        #[arg(long)]
        modules: String,
    },
    Aggregate,
}

impl From<TaskCommand> for TaskKind {
    fn from(command: TaskCommand) -> Self {
        match command {
            TaskCommand::Start { detach } => TaskKind::Start { detach },
            TaskCommand::Stop => TaskKind::Stop,
            TaskCommand::Restart { quick } => TaskKind::Restart { quick },
            TaskCommand::Resetdb => TaskKind::ResetDb,
            TaskCommand::Snapshot => TaskKind::Snapshot,
            TaskCommand::RestoreSnapshot { name } => TaskKind::RestoreSnapshot { name },
            TaskCommand::Logs { tail, container } => TaskKind::Logs { tail, container },
            TaskCommand::Install { modules } => TaskKind::Install { modules },
            TaskCommand::Update { modules } => TaskKind::Update { modules },
            TaskCommand::Test { modules } => TaskKind::Test { modules },
            TaskCommand::Aggregate => TaskKind::Aggregate,
        }
    }
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Show cached repositories and their sizes.
    Stats,
    /// Run git gc across the cache; --aggressive also shallows large clones.
    Optimize {
        #[arg(long)]
        aggressive: bool,
    },
    /// Evict entries idle longer than the configured maximum age.
    Cleanup,
}

struct Services {
    config: ManagerConfig,
    orchestrator: Orchestrator,
    reconciler: Reconciler,
    cache: Arc<RepoCache>,
}

fn build_services(config: ManagerConfig, progress: mpsc::UnboundedSender<ProgressEvent>) -> Services {
    let registry: Arc<dyn Registry> = Arc::new(FileRegistry::new(config.registry_dir.clone()));
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(ComposeCli);
    let cache = Arc::new(RepoCache::new(
        config.cache_dir.clone(),
        config.cache_ttl_secs,
        config.cache_shallow_threshold_bytes,
        Arc::new(CliGit),
    ));
    let executor = Arc::new(TaskExecutor::new(
        Arc::new(ProcessRunner),
        config.retry_attempts,
        Duration::from_secs(config.retry_backoff_base_secs),
        Duration::from_secs(config.command_timeout_secs),
    ));
    let proxy = Arc::new(ProxyManager::new(
        Arc::new(SudoProxyGateway::new(config.proxy_config_dir.clone())),
        config.internal_domain_suffix.clone(),
    ));
    let locks = Arc::new(IdLocks::new());

    let orchestrator = Orchestrator::new(
        config.clone(),
        registry.clone(),
        runtime.clone(),
        cache.clone(),
        executor,
        proxy.clone(),
        locks.clone(),
    )
    .with_progress(progress);
    let reconciler = Reconciler::new(config.clone(), registry, runtime, proxy, locks);

    Services {
        config,
        orchestrator,
        reconciler,
        cache,
    }
}

fn parse_deps(deps: &[String]) -> color_eyre::Result<std::collections::BTreeMap<String, String>> {
    let mut refs = std::collections::BTreeMap::new();
    for dep in deps {
        let (name, reference) = dep
            .split_once('=')
            .ok_or_else(|| color_eyre::eyre::eyre!("--dep must be NAME=REF, got '{dep}'"))?;
        refs.insert(name.to_string(), reference.to_string());
    }
    Ok(refs)
}

fn parse_status(status: &str) -> color_eyre::Result<DeploymentStatus> {
    match status {
        "creating" => Ok(DeploymentStatus::Creating),
        "running" => Ok(DeploymentStatus::Running),
        "stopped" => Ok(DeploymentStatus::Stopped),
        "updating" => Ok(DeploymentStatus::Updating),
        "error" => Ok(DeploymentStatus::Error),
        "deleting" => Ok(DeploymentStatus::Deleting),
        other => Err(color_eyre::eyre::eyre!("unknown status '{other}'")),
    }
}

fn print_deployment_row(d: &Deployment) {
    println!(
        "{:<24} {:<10} {:<16} {:<6} {}",
        d.id,
        d.status.as_str(),
        d.owner,
        d.port_base,
        d.subdomain
    );
}

fn print_deployment(d: &Deployment, config: &ManagerConfig) {
    println!("id:        {}", d.id);
    println!("name:      {}", d.name);
    println!("owner:     {}", d.owner);
    println!("status:    {}", d.status.as_str());
    println!("version:   {}", d.version_spec.version);
    for (name, reference) in &d.version_spec.dependency_refs {
        println!("  dep:     {name} -> {reference}");
    }
    println!("subdomain: http://{}", d.subdomain);
    println!("internal:  http://{}.{}", d.id, config.internal_domain_suffix);
    for (service, port) in d.port_map() {
        println!("  port:    {service:<10} {port}");
    }
    println!("created:   {}", d.created_at.to_rfc3339());
    println!("updated:   {}", d.updated_at.to_rfc3339());
    if !d.last_action.is_empty() {
        println!("last:      {}", d.last_action);
    }
    if !d.notes.is_empty() {
        println!("notes:     {}", d.notes);
    }
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = config_loader::load_or_default(cli.config.as_deref())?;

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<ProgressEvent>();
    tokio::spawn(async move {
        while let Some(event) = progress_rx.recv().await {
            eprintln!("[{}] {}: {}", event.deployment_id, event.step, event.detail);
        }
    });

    let services = build_services(config, progress_tx);

    match cli.command {
        Command::Create {
            owner,
            name,
            version,
            deps,
            notes,
        } => {
            let params = DeploymentParams {
                owner,
                name,
                version_spec: VersionSpec {
                    version,
                    dependency_refs: parse_deps(&deps)?,
                },
                notes,
            };
            let deployment = services.orchestrator.create(params).await?;
            print_deployment(&deployment, &services.config);
        }
        Command::List { owner, status } => {
            let filter = DeploymentFilter {
                owner,
                status: status.as_deref().map(parse_status).transpose()?,
            };
            let deployments = services.orchestrator.list(&filter).await?;
            for deployment in &deployments {
                print_deployment_row(deployment);
            }
        }
        Command::Status { id } => {
            let deployment = services.orchestrator.get(&id).await?;
            print_deployment(&deployment, &services.config);
        }
        Command::Start { id } => {
            let deployment = services.orchestrator.start(&id).await?;
            print_deployment_row(&deployment);
        }
        Command::Stop { id } => {
            let deployment = services.orchestrator.stop(&id).await?;
            print_deployment_row(&deployment);
        }
        Command::Update { id, version, deps } => {
            let spec = VersionSpec {
                version,
                dependency_refs: parse_deps(&deps)?,
            };
            let deployment = services.orchestrator.update(&id, spec).await?;
            print_deployment_row(&deployment);
        }
        Command::Delete { id } => {
            services.orchestrator.delete(&id).await?;
            println!("deleted {id}");
        }
        Command::Task { id, task } => {
            let execution = services.orchestrator.execute_task(&id, task.into()).await?;
            print!("{}", execution.stdout);
            eprint!("{}", execution.stderr);
            if !execution.success() {
                std::process::exit(execution.exit_code.max(1));
            }
        }
        Command::Reconcile { watch } => {
            if watch {
                services.reconciler.run_loop().await;
            } else {
                let summary = services.reconciler.run_once().await;
                println!(
                    "checked {} repaired {} deletes-completed {} orphans-removed {}",
                    summary.checked,
                    summary.repaired,
                    summary.deletes_completed,
                    summary.orphans_removed
                );
                println!(
                    "vhosts: created {} updated {} removed {}",
                    summary.proxy.created, summary.proxy.updated, summary.proxy.removed
                );
                for error in &summary.errors {
                    eprintln!("error: {error}");
                }
                if !summary.errors.is_empty() {
                    std::process::exit(1);
                }
            }
        }
        Command::Versions => {
            let tags = services.cache.list_tags(&services.config.stack_repo_url).await?;
            let branches = services
                .cache
                .list_branches(&services.config.stack_repo_url)
                .await?;
            println!("tags:");
            for tag in tags {
                println!("  {tag}");
            }
            println!("branches:");
            for branch in branches {
                println!("  {branch}");
            }
        }
        Command::Cache { action } => match action {
            CacheCommand::Stats => {
                let stats = services.cache.stats().await;
                for entry in &stats.entries {
                    println!(
                        "{:<48} {:>10} KiB  {}  fetched {}",
                        format!("{}@{}", entry.url, entry.reference),
                        entry.size_bytes / 1024,
                        if entry.is_shallow { "shallow" } else { "full" },
                        entry.last_fetched_at.to_rfc3339()
                    );
                }
                println!("total: {} KiB", stats.total_size_bytes / 1024);
            }
            CacheCommand::Optimize { aggressive } => {
                let saved = services.cache.optimize(aggressive).await?;
                println!("reclaimed {} KiB", saved / 1024);
            }
            CacheCommand::Cleanup => {
                let freed = services.cache.cleanup(services.config.cache_max_age_days).await?;
                println!("freed {} KiB", freed / 1024);
            }
        },
    }
    Ok(())
}
