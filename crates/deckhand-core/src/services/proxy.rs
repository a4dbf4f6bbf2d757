use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::error::{DeckhandError, Result};
use crate::models::Deployment;

/// Privilege boundary to the reverse proxy. The surface is fixed: the core
/// can place, remove and list vhost files, validate the full configuration
/// and trigger a reload — nothing else.
#[async_trait]
pub trait ProxyGateway: Send + Sync {
    async fn read_file(&self, name: &str) -> Result<Option<String>>;
    async fn write_file(&self, name: &str, content: &str) -> Result<()>;
    async fn remove_file(&self, name: &str) -> Result<()>;
    async fn list_configs(&self) -> Result<Vec<String>>;
    async fn test_config(&self) -> Result<()>;
    async fn reload(&self) -> Result<()>;
}

/// Writes land in a temp file and are moved into the config directory via a
/// fixed `sudo` command set; validation and reload go through `nginx` itself.
pub struct SudoProxyGateway {
    config_dir: PathBuf,
}

impl SudoProxyGateway {
    pub fn new(config_dir: PathBuf) -> Self {
        Self { config_dir }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.config_dir.join(name)
    }
}

async fn run_sudo(args: &[&str]) -> Result<String> {
    let output = Command::new("sudo")
        .args(args)
        .output()
        .await
        .map_err(|e| DeckhandError::Proxy(format!("failed to run sudo: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(DeckhandError::Proxy(format!(
            "sudo {} failed (exit {}): {stderr}",
            args.join(" "),
            output.status.code().unwrap_or(-1)
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

#[async_trait]
impl ProxyGateway for SudoProxyGateway {
    async fn read_file(&self, name: &str) -> Result<Option<String>> {
        let path = self.path_for(name);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(run_sudo(&["cat", &path.to_string_lossy()]).await?))
    }

    async fn write_file(&self, name: &str, content: &str) -> Result<()> {
        let tmp = std::env::temp_dir().join(format!("deckhand-{name}.tmp"));
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| DeckhandError::Proxy(format!("failed to stage config: {e}")))?;
        let dest = self.path_for(name);
        run_sudo(&["mv", &tmp.to_string_lossy(), &dest.to_string_lossy()]).await?;
        run_sudo(&["chmod", "644", &dest.to_string_lossy()]).await?;
        Ok(())
    }

    async fn remove_file(&self, name: &str) -> Result<()> {
        let path = self.path_for(name);
        if path.exists() {
            run_sudo(&["rm", &path.to_string_lossy()]).await?;
        }
        Ok(())
    }

    async fn list_configs(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.config_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(DeckhandError::Proxy(format!("failed to list configs: {e}"))),
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| DeckhandError::Proxy(e.to_string()))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".conf") {
                names.push(name);
            }
        }
        names.sort_unstable();
        Ok(names)
    }

    async fn test_config(&self) -> Result<()> {
        run_sudo(&["nginx", "-t"])
            .await
            .map_err(|e| DeckhandError::ProxyValidation(e.to_string()))?;
        Ok(())
    }

    async fn reload(&self) -> Result<()> {
        run_sudo(&["nginx", "-s", "reload"]).await?;
        Ok(())
    }
}

/// Render the vhost file for one deployment: an internal server (no auth),
/// the external server on the public subdomain, and helper vhosts for the
/// mail and db-admin consoles. Plain text substitution.
pub fn render_config(deployment: &Deployment, internal_suffix: &str) -> String {
    let id = &deployment.id;
    let external = &deployment.subdomain;
    let internal = format!("{id}.{internal_suffix}");
    let ports = deployment.port_map();
    let app = ports["app"];
    let mail = ports["mail"];
    let db_admin = ports["db-admin"];

    let proxy_block = |port: u16| {
        format!(
            "        proxy_pass http://localhost:{port};\n\
             \x20       proxy_set_header Host $host;\n\
             \x20       proxy_set_header X-Real-IP $remote_addr;\n\
             \x20       proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n\
             \x20       proxy_set_header X-Forwarded-Proto $scheme;"
        )
    };

    format!(
        "# Managed by deckhand for {id}; do not edit by hand.\n\
         # app={app} mail={mail} db-admin={db_admin}\n\
         \n\
         server {{\n\
         \x20   listen 80;\n\
         \x20   server_name {internal};\n\
         \x20   location / {{\n{app_proxy}\n\x20   }}\n\
         }}\n\
         \n\
         server {{\n\
         \x20   listen 80;\n\
         \x20   server_name {external};\n\
         \x20   location / {{\n{app_proxy}\n\x20   }}\n\
         }}\n\
         \n\
         server {{\n\
         \x20   listen 80;\n\
         \x20   server_name mail-{external};\n\
         \x20   location / {{\n{mail_proxy}\n\x20   }}\n\
         }}\n\
         \n\
         server {{\n\
         \x20   listen 80;\n\
         \x20   server_name db-{external};\n\
         \x20   location / {{\n{db_proxy}\n\x20   }}\n\
         }}\n",
        app_proxy = proxy_block(app),
        mail_proxy = proxy_block(mail),
        db_proxy = proxy_block(db_admin),
    )
}

pub fn config_name(id: &str) -> String {
    format!("{id}.conf")
}

fn id_from_config_name(name: &str) -> Option<&str> {
    name.strip_suffix(".conf")
}

#[derive(Debug, Default)]
pub struct ProxyReconcileSummary {
    pub checked: usize,
    pub created: usize,
    pub updated: usize,
    pub removed: usize,
    pub errors: Vec<String>,
}

impl ProxyReconcileSummary {
    pub fn changed(&self) -> bool {
        self.created + self.updated + self.removed > 0
    }
}

enum Applied {
    Unchanged,
    Created,
    Updated,
}

/// Owns the proxy configuration directory as a single shared resource:
/// every read-modify-validate-reload sequence runs under one lock, and any
/// change that fails validation is rolled back before returning.
pub struct ProxyManager {
    gateway: Arc<dyn ProxyGateway>,
    internal_suffix: String,
    lock: Mutex<()>,
}

impl ProxyManager {
    pub fn new(gateway: Arc<dyn ProxyGateway>, internal_suffix: String) -> Self {
        Self {
            gateway,
            internal_suffix,
            lock: Mutex::new(()),
        }
    }

    /// Make the deployment's vhost file match the desired rendering.
    /// Returns true when a write (and reload) happened.
    pub async fn ensure_config(&self, deployment: &Deployment) -> Result<bool> {
        let _guard = self.lock.lock().await;
        match self.apply_write(deployment).await? {
            Applied::Unchanged => Ok(false),
            _ => {
                self.gateway.reload().await?;
                Ok(true)
            }
        }
    }

    /// Remove the deployment's vhost file if present.
    pub async fn remove_config(&self, id: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let removed = self.apply_remove(&config_name(id)).await?;
        if removed {
            self.gateway.reload().await?;
        }
        Ok(removed)
    }

    /// Bring the config directory in line with the given deployments:
    /// create missing vhosts, refresh changed ones, drop stale ones.
    /// Ids in `skip` are left entirely untouched, neither written nor
    /// treated as stale; an in-flight workflow keeps ownership of its
    /// vhost. A run with nothing to change performs zero writes and no
    /// reload.
    pub async fn reconcile(
        &self,
        deployments: &[Deployment],
        skip: &HashSet<String>,
    ) -> ProxyReconcileSummary {
        let _guard = self.lock.lock().await;
        let mut summary = ProxyReconcileSummary::default();

        for deployment in deployments {
            if skip.contains(&deployment.id) {
                continue;
            }
            summary.checked += 1;
            match self.apply_write(deployment).await {
                Ok(Applied::Created) => summary.created += 1,
                Ok(Applied::Updated) => summary.updated += 1,
                Ok(Applied::Unchanged) => {}
                Err(e) => summary.errors.push(format!("{}: {e}", deployment.id)),
            }
        }

        let wanted: HashSet<String> = deployments
            .iter()
            .filter(|d| !skip.contains(&d.id))
            .map(|d| config_name(&d.id))
            .collect();
        match self.gateway.list_configs().await {
            Ok(existing) => {
                for name in existing {
                    let Some(id) = id_from_config_name(&name) else {
                        continue;
                    };
                    if skip.contains(id) || wanted.contains(&name) {
                        continue;
                    }
                    match self.apply_remove(&name).await {
                        Ok(true) => summary.removed += 1,
                        Ok(false) => {}
                        Err(e) => summary.errors.push(format!("{name}: {e}")),
                    }
                }
            }
            Err(e) => summary.errors.push(format!("list: {e}")),
        }

        if summary.changed() {
            if let Err(e) = self.gateway.reload().await {
                summary.errors.push(format!("reload: {e}"));
            }
        }
        summary
    }

    /// Write-if-changed with rollback. Caller holds the lock.
    async fn apply_write(&self, deployment: &Deployment) -> Result<Applied> {
        let name = config_name(&deployment.id);
        let desired = render_config(deployment, &self.internal_suffix);
        let prior = self.gateway.read_file(&name).await?;
        if prior.as_deref() == Some(desired.as_str()) {
            return Ok(Applied::Unchanged);
        }

        self.gateway.write_file(&name, &desired).await?;
        if let Err(validation) = self.gateway.test_config().await {
            // Restore the previous state so the proxy stays loadable.
            let rollback = match &prior {
                Some(content) => self.gateway.write_file(&name, content).await,
                None => self.gateway.remove_file(&name).await,
            };
            if let Err(e) = rollback {
                tracing::error!(name, error = %e, "rollback after failed validation also failed");
            }
            return Err(DeckhandError::ProxyValidation(validation.to_string()));
        }

        Ok(if prior.is_some() {
            Applied::Updated
        } else {
            Applied::Created
        })
    }

    /// Remove-with-rollback. Caller holds the lock.
    async fn apply_remove(&self, name: &str) -> Result<bool> {
        let prior = match self.gateway.read_file(name).await? {
            Some(content) => content,
            None => return Ok(false),
        };
        self.gateway.remove_file(name).await?;
        if let Err(validation) = self.gateway.test_config().await {
            if let Err(e) = self.gateway.write_file(name, &prior).await {
                tracing::error!(name, error = %e, "rollback after failed validation also failed");
            }
            return Err(DeckhandError::ProxyValidation(validation.to_string()));
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Deployment, DeploymentParams, VersionSpec};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct FakeGateway {
        files: StdMutex<HashMap<String, String>>,
        writes: AtomicU32,
        reloads: AtomicU32,
        fail_validation: AtomicBool,
    }

    #[async_trait]
    impl ProxyGateway for FakeGateway {
        async fn read_file(&self, name: &str) -> Result<Option<String>> {
            Ok(self.files.lock().unwrap().get(name).cloned())
        }

        async fn write_file(&self, name: &str, content: &str) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.files
                .lock()
                .unwrap()
                .insert(name.to_string(), content.to_string());
            Ok(())
        }

        async fn remove_file(&self, name: &str) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            self.files.lock().unwrap().remove(name);
            Ok(())
        }

        async fn list_configs(&self) -> Result<Vec<String>> {
            let mut names: Vec<String> = self.files.lock().unwrap().keys().cloned().collect();
            names.sort_unstable();
            Ok(names)
        }

        async fn test_config(&self) -> Result<()> {
            if self.fail_validation.load(Ordering::SeqCst) {
                return Err(DeckhandError::ProxyValidation(
                    "duplicate server_name".into(),
                ));
            }
            Ok(())
        }

        async fn reload(&self) -> Result<()> {
            self.reloads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn deployment(name: &str, port_base: u16) -> Deployment {
        let params = DeploymentParams {
            owner: "team1".into(),
            name: name.into(),
            version_spec: VersionSpec {
                version: "17.0".into(),
                dependency_refs: Default::default(),
            },
            notes: String::new(),
        };
        let id = params.id();
        Deployment::new(&params, port_base, format!("{id}.test.example.org"))
    }

    #[test]
    fn rendered_config_carries_ports_and_domains() {
        let d = deployment("demo", 18200);
        let config = render_config(&d, "stack.internal");
        assert!(config.contains("server_name team1-demo.stack.internal;"));
        assert!(config.contains("server_name team1-demo.test.example.org;"));
        assert!(config.contains("proxy_pass http://localhost:18200;"));
        assert!(config.contains("proxy_pass http://localhost:18225;"));
        assert!(config.contains("proxy_pass http://localhost:18281;"));
    }

    #[tokio::test]
    async fn ensure_config_writes_once_and_reloads() {
        let gateway = Arc::new(FakeGateway::default());
        let manager = ProxyManager::new(gateway.clone(), "stack.internal".into());
        let d = deployment("demo", 18000);

        assert!(manager.ensure_config(&d).await.unwrap());
        assert_eq!(gateway.reloads.load(Ordering::SeqCst), 1);
        // Unchanged second call: no write, no reload
        assert!(!manager.ensure_config(&d).await.unwrap());
        assert_eq!(gateway.writes.load(Ordering::SeqCst), 1);
        assert_eq!(gateway.reloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_validation_rolls_back_new_file() {
        let gateway = Arc::new(FakeGateway::default());
        let manager = ProxyManager::new(gateway.clone(), "stack.internal".into());
        gateway.fail_validation.store(true, Ordering::SeqCst);

        let d = deployment("demo", 18000);
        let result = manager.ensure_config(&d).await;
        assert!(matches!(result, Err(DeckhandError::ProxyValidation(_))));
        assert!(gateway.files.lock().unwrap().is_empty());
        assert_eq!(gateway.reloads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_validation_restores_prior_content() {
        let gateway = Arc::new(FakeGateway::default());
        let manager = ProxyManager::new(gateway.clone(), "stack.internal".into());

        let mut d = deployment("demo", 18000);
        manager.ensure_config(&d).await.unwrap();
        let original = gateway
            .files
            .lock()
            .unwrap()
            .get("team1-demo.conf")
            .cloned()
            .unwrap();

        d.port_base = 18100;
        gateway.fail_validation.store(true, Ordering::SeqCst);
        assert!(manager.ensure_config(&d).await.is_err());
        assert_eq!(
            gateway.files.lock().unwrap().get("team1-demo.conf"),
            Some(&original)
        );
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let gateway = Arc::new(FakeGateway::default());
        let manager = ProxyManager::new(gateway.clone(), "stack.internal".into());
        let deployments = vec![deployment("one", 18000), deployment("two", 18100)];

        let first = manager.reconcile(&deployments, &HashSet::new()).await;
        assert_eq!(first.created, 2);
        assert!(first.errors.is_empty());

        let writes_after_first = gateway.writes.load(Ordering::SeqCst);
        let second = manager.reconcile(&deployments, &HashSet::new()).await;
        assert!(!second.changed());
        // Zero file writes on the second run
        assert_eq!(gateway.writes.load(Ordering::SeqCst), writes_after_first);
        assert_eq!(gateway.reloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reconcile_removes_stale_configs() {
        let gateway = Arc::new(FakeGateway::default());
        gateway
            .files
            .lock()
            .unwrap()
            .insert("gone-away.conf".into(), "server {}".into());
        let manager = ProxyManager::new(gateway.clone(), "stack.internal".into());

        let deployments = vec![deployment("demo", 18000)];
        let summary = manager.reconcile(&deployments, &HashSet::new()).await;
        assert_eq!(summary.created, 1);
        assert_eq!(summary.removed, 1);
        assert!(!gateway.files.lock().unwrap().contains_key("gone-away.conf"));
    }

    #[tokio::test]
    async fn skipped_ids_are_neither_written_nor_removed() {
        let gateway = Arc::new(FakeGateway::default());
        gateway
            .files
            .lock()
            .unwrap()
            .insert("team1-busy.conf".into(), "server {}".into());
        let manager = ProxyManager::new(gateway.clone(), "stack.internal".into());

        // "busy" is absent from the desired list but marked in-flight; a
        // skipped deployment in the list must not be written either.
        let deployments = vec![deployment("held", 18100)];
        let skip: HashSet<String> = ["team1-busy".to_string(), "team1-held".to_string()]
            .into_iter()
            .collect();
        let summary = manager.reconcile(&deployments, &skip).await;

        assert_eq!(summary.checked, 0);
        assert_eq!(summary.removed, 0);
        let files = gateway.files.lock().unwrap();
        assert_eq!(files.get("team1-busy.conf").map(String::as_str), Some("server {}"));
        assert!(!files.contains_key("team1-held.conf"));
    }
}
