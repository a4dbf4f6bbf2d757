use std::path::PathBuf;

use serde::Deserialize;

/// Immutable manager configuration, handed to each component at construction.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ManagerConfig {
    /// Directory holding one working directory per deployment.
    pub deployments_dir: PathBuf,
    /// Directory holding shared repository cache entries.
    pub cache_dir: PathBuf,
    /// Directory holding registry records.
    pub registry_dir: PathBuf,
    /// Reverse-proxy vhost config directory.
    pub proxy_config_dir: PathBuf,

    /// Upstream repository providing the stack skeleton.
    pub stack_repo_url: String,
    pub stack_repo_ref: String,

    pub port_range_start: u16,
    pub port_range_end: u16,
    pub port_increment: u16,

    pub base_domain: String,
    /// Suffix for internal (unauthenticated) vhost names.
    pub internal_domain_suffix: String,
    /// Container-group namespace prefix.
    pub namespace_prefix: String,

    pub max_deployments_per_owner: usize,

    pub cache_ttl_secs: u64,
    pub cache_max_age_days: u64,
    /// Entries larger than this are shallowed by aggressive optimization.
    pub cache_shallow_threshold_bytes: u64,

    pub retry_attempts: u32,
    pub retry_backoff_base_secs: u64,
    pub command_timeout_secs: u64,

    pub reconcile_interval_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            deployments_dir: PathBuf::from("./deployments"),
            cache_dir: PathBuf::from("./repo-cache"),
            registry_dir: PathBuf::from("./registry"),
            proxy_config_dir: PathBuf::from("/etc/nginx/sites-available"),
            stack_repo_url: "https://github.com/example/stack-compose.git".into(),
            stack_repo_ref: "main".into(),
            port_range_start: 18000,
            port_range_end: 19000,
            port_increment: 100,
            base_domain: "test.example.org".into(),
            internal_domain_suffix: "stack.internal".into(),
            namespace_prefix: "stack".into(),
            max_deployments_per_owner: 3,
            cache_ttl_secs: 300,
            cache_max_age_days: 30,
            cache_shallow_threshold_bytes: 100 * 1024 * 1024,
            retry_attempts: 3,
            retry_backoff_base_secs: 2,
            command_timeout_secs: 600,
            reconcile_interval_secs: 60,
        }
    }
}

impl ManagerConfig {
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.port_increment == 0 {
            return Err(crate::error::DeckhandError::InvalidConfig(
                "port_increment must be non-zero".into(),
            ));
        }
        if self.port_range_start >= self.port_range_end {
            return Err(crate::error::DeckhandError::InvalidConfig(
                "port_range_start must be below port_range_end".into(),
            ));
        }
        if self.port_range_start % self.port_increment != 0 {
            return Err(crate::error::DeckhandError::InvalidConfig(
                "port_range_start must be aligned to port_increment".into(),
            ));
        }
        if self.retry_attempts == 0 {
            return Err(crate::error::DeckhandError::InvalidConfig(
                "retry_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
