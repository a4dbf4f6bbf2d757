use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{DeckhandError, Result};
use crate::models::{id_from_project, DeploymentStatus, ManagerConfig};
use crate::services::compose::{ContainerRuntime, ObservedState};
use crate::services::orchestrator::{self, IdLocks};
use crate::services::proxy::{ProxyManager, ProxyReconcileSummary};
use crate::services::registry::{DeploymentFilter, Registry};

/// What one reconciliation pass observed and changed.
#[derive(Debug, Default)]
pub struct ReconcileSummary {
    pub checked: usize,
    /// Records whose stored status was corrected to match reality.
    pub repaired: usize,
    /// Interrupted deletions whose teardown was retried to completion.
    pub deletes_completed: usize,
    /// Container projects removed because no record claims them.
    pub orphans_removed: usize,
    pub proxy: ProxyReconcileSummary,
    pub errors: Vec<String>,
}

/// Periodic drift repair: observed container state is the source of truth
/// for Running/Stopped, the registry is the source of truth for existence.
///
/// Deployments currently locked by a workflow are skipped and picked up on
/// the next pass; a transient observation never outranks an in-flight
/// operation.
pub struct Reconciler {
    config: ManagerConfig,
    registry: Arc<dyn Registry>,
    runtime: Arc<dyn ContainerRuntime>,
    proxy: Arc<ProxyManager>,
    locks: Arc<IdLocks>,
}

impl Reconciler {
    pub fn new(
        config: ManagerConfig,
        registry: Arc<dyn Registry>,
        runtime: Arc<dyn ContainerRuntime>,
        proxy: Arc<ProxyManager>,
        locks: Arc<IdLocks>,
    ) -> Self {
        Self {
            config,
            registry,
            runtime,
            proxy,
            locks,
        }
    }

    /// One full pass. Per-deployment failures are collected, never fatal:
    /// the rest of the pass always runs.
    pub async fn run_once(&self) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();

        let deployments = match self.registry.list(&DeploymentFilter::default()).await {
            Ok(deployments) => deployments,
            Err(e) => {
                summary.errors.push(format!("list: {e}"));
                return summary;
            }
        };

        for deployment in &deployments {
            summary.checked += 1;
            if let Err(e) = self.sync_one(&deployment.id, &mut summary).await {
                summary.errors.push(format!("{}: {e}", deployment.id));
            }
        }

        if let Err(e) = self.cleanup_orphans(&mut summary).await {
            summary.errors.push(format!("orphans: {e}"));
        }

        // Vhosts only for deployments in a settled, serving-capable state.
        // Error records already had their vhost torn down with the rest of
        // the failed workflow; in-flight ones belong to that workflow.
        let busy: HashSet<String> = deployments
            .iter()
            .filter(|d| self.locks.is_locked(&d.id))
            .map(|d| d.id.clone())
            .collect();
        let live: Vec<_> = deployments
            .iter()
            .filter(|d| {
                matches!(
                    d.status,
                    DeploymentStatus::Running | DeploymentStatus::Stopped
                ) && !busy.contains(&d.id)
            })
            .cloned()
            .collect();
        summary.proxy = self.proxy.reconcile(&live, &busy).await;

        if summary.repaired + summary.deletes_completed + summary.orphans_removed > 0
            || summary.proxy.changed()
        {
            tracing::info!(
                repaired = summary.repaired,
                deletes_completed = summary.deletes_completed,
                orphans_removed = summary.orphans_removed,
                "reconciliation made changes"
            );
        }
        summary
    }

    /// Reconcile on a fixed interval until the task is aborted.
    pub async fn run_loop(&self) {
        let interval = Duration::from_secs(self.config.reconcile_interval_secs.max(1));
        loop {
            let summary = self.run_once().await;
            for error in &summary.errors {
                tracing::warn!(error, "reconciliation error");
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn sync_one(&self, id: &str, summary: &mut ReconcileSummary) -> Result<()> {
        // Fail-fast lock: an active workflow owns this id right now.
        let _guard = match self.locks.acquire(id) {
            Ok(guard) => guard,
            Err(DeckhandError::Conflict(_)) => {
                tracing::debug!(deployment = id, "busy, skipping");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        // Re-read under the lock; the workflow we raced may have finished.
        let mut deployment = match self.registry.get(id).await {
            Ok(deployment) => deployment,
            Err(DeckhandError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        match deployment.status {
            // Operator-attention state, never auto-repaired.
            DeploymentStatus::Error => Ok(()),

            // Id locks are in-memory, so an unlocked in-progress record
            // cannot belong to a live workflow: the process driving it is
            // gone. Park it in Error so update/delete can recover it.
            DeploymentStatus::Creating | DeploymentStatus::Updating => {
                let stalled = deployment.status.as_str();
                tracing::warn!(deployment = id, status = stalled, "abandoned in-progress record");
                deployment.last_action = format!("workflow interrupted while {stalled}");
                deployment.transition_to(DeploymentStatus::Error)?;
                self.registry.put(&deployment).await?;
                summary.repaired += 1;
                Ok(())
            }

            DeploymentStatus::Deleting => {
                tracing::info!(deployment = id, "retrying interrupted deletion");
                orchestrator::teardown(
                    &self.config,
                    &self.registry,
                    &self.runtime,
                    &self.proxy,
                    &deployment,
                )
                .await?;
                summary.deletes_completed += 1;
                Ok(())
            }

            DeploymentStatus::Running | DeploymentStatus::Stopped => {
                let project = deployment.project_name(&self.config.namespace_prefix);
                let observed = self.runtime.project_state(&project).await?;
                let actual = match observed {
                    ObservedState::Running => DeploymentStatus::Running,
                    ObservedState::Stopped | ObservedState::NotFound => DeploymentStatus::Stopped,
                };
                if actual != deployment.status {
                    tracing::info!(
                        deployment = id,
                        recorded = deployment.status.as_str(),
                        observed = actual.as_str(),
                        "repairing status drift"
                    );
                    deployment.transition_to(actual)?;
                    deployment.last_action = "status repaired by reconciliation".into();
                    self.registry.put(&deployment).await?;
                    summary.repaired += 1;
                }
                Ok(())
            }
        }
    }

    /// Remove container projects in our namespace that no record claims.
    async fn cleanup_orphans(&self, summary: &mut ReconcileSummary) -> Result<()> {
        let projects = self
            .runtime
            .list_projects(&self.config.namespace_prefix)
            .await?;
        for project in projects {
            let Some(id) = id_from_project(&self.config.namespace_prefix, &project) else {
                continue;
            };
            match self.registry.get(&id).await {
                Ok(_) => {}
                Err(DeckhandError::NotFound(_)) => {
                    tracing::warn!(project, "removing orphaned container project");
                    if let Err(e) = self.runtime.remove_project(&project).await {
                        summary.errors.push(format!("{project}: {e}"));
                    } else {
                        summary.orphans_removed += 1;
                    }
                }
                Err(e) => summary.errors.push(format!("{project}: {e}")),
            }
        }
        Ok(())
    }
}
