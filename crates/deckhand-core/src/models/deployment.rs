use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{DeckhandError, Result};

/// Fixed per-service port offsets from a deployment's base port.
pub const PORT_OFFSETS: &[(&str, u16)] = &[
    ("app", 0),
    ("mail", 25),
    ("db", 32),
    ("db-admin", 81),
    ("debug", 84),
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum DeploymentStatus {
    Creating,
    Running,
    Stopped,
    Updating,
    Error,
    Deleting,
}

impl DeploymentStatus {
    /// Central transition table. Anything not listed here is rejected, so
    /// callers cannot invent their own lifecycle paths.
    pub fn can_transition(self, to: DeploymentStatus) -> bool {
        use DeploymentStatus::*;
        match (self, to) {
            (Creating, Running) | (Creating, Error) | (Creating, Deleting) => true,
            (Running, Stopped) | (Running, Updating) | (Running, Error) => true,
            (Stopped, Running) | (Stopped, Updating) | (Stopped, Error) => true,
            (Updating, Running) | (Updating, Stopped) | (Updating, Error) => true,
            // Error is only left via an explicit update or delete.
            (Error, Updating) => true,
            (from, Deleting) => from != Deleting,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentStatus::Creating => "creating",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Stopped => "stopped",
            DeploymentStatus::Updating => "updating",
            DeploymentStatus::Error => "error",
            DeploymentStatus::Deleting => "deleting",
        }
    }
}

/// Primary component version plus per-dependency ref overrides.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VersionSpec {
    pub version: String,
    #[serde(default)]
    pub dependency_refs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub id: String,
    pub name: String,
    pub owner: String,
    pub version_spec: VersionSpec,
    pub status: DeploymentStatus,
    pub port_base: u16,
    pub subdomain: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Diagnostic from the last workflow step, surfaced to callers on Error.
    #[serde(default)]
    pub last_action: String,
    #[serde(default)]
    pub notes: String,
}

impl Deployment {
    pub fn new(params: &DeploymentParams, port_base: u16, subdomain: String) -> Self {
        let now = Utc::now();
        Self {
            id: params.id(),
            name: params.name.clone(),
            owner: sanitize_owner(&params.owner),
            version_spec: params.version_spec.clone(),
            status: DeploymentStatus::Creating,
            port_base,
            subdomain,
            created_at: now,
            updated_at: now,
            last_action: String::new(),
            notes: params.notes.clone(),
        }
    }

    /// Apply a status transition, enforcing the central table.
    pub fn transition_to(&mut self, to: DeploymentStatus) -> Result<()> {
        if !self.status.can_transition(to) {
            return Err(DeckhandError::InvalidTransition {
                from: self.status.as_str().to_string(),
                to: to.as_str().to_string(),
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Service name -> host port, derived from the fixed offset table.
    pub fn port_map(&self) -> BTreeMap<String, u16> {
        PORT_OFFSETS
            .iter()
            .map(|(name, offset)| (name.to_string(), self.port_base + offset))
            .collect()
    }

    pub fn app_port(&self) -> u16 {
        self.port_base
    }

    /// Container-group namespace: the compose project name.
    pub fn project_name(&self, prefix: &str) -> String {
        format!("{prefix}_{}", self.id.replace('-', "_"))
    }
}

/// Recover a deployment id from a namespaced container project name.
/// Returns None when the project does not belong to our namespace.
pub fn id_from_project(prefix: &str, project: &str) -> Option<String> {
    project
        .strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('_'))
        .filter(|rest| !rest.is_empty())
        .map(|rest| rest.replace('_', "-"))
}

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]{1,18}[a-z0-9]$").unwrap());

static OWNER_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]*$").unwrap());

/// Reduce an owner handle (possibly an email address) to a DNS-safe identifier.
pub fn sanitize_owner(owner: &str) -> String {
    let local = owner.split('@').next().unwrap_or(owner).to_lowercase();
    let mapped = local.replace('.', "-");
    mapped
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect()
}

#[derive(Debug, Clone)]
pub struct DeploymentParams {
    pub owner: String,
    pub name: String,
    pub version_spec: VersionSpec,
    pub notes: String,
}

impl DeploymentParams {
    /// Stable identifier, immutable once created: `{owner}-{name}`.
    pub fn id(&self) -> String {
        format!("{}-{}", sanitize_owner(&self.owner), self.name.to_lowercase())
    }

    pub fn validate(&self) -> Result<()> {
        let owner = sanitize_owner(&self.owner);
        if owner.is_empty() || !OWNER_RE.is_match(&owner) {
            return Err(DeckhandError::Validation(format!(
                "invalid owner '{}'",
                self.owner
            )));
        }
        if !NAME_RE.is_match(&self.name.to_lowercase()) {
            return Err(DeckhandError::Validation(
                "name must be 3-20 characters, alphanumeric and hyphens only".into(),
            ));
        }
        if self.version_spec.version.is_empty() {
            return Err(DeckhandError::Validation("version is required".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(owner: &str, name: &str) -> DeploymentParams {
        DeploymentParams {
            owner: owner.into(),
            name: name.into(),
            version_spec: VersionSpec {
                version: "17.0".into(),
                dependency_refs: BTreeMap::new(),
            },
            notes: String::new(),
        }
    }

    #[test]
    fn id_derived_from_owner_and_name() {
        assert_eq!(params("Jane.Doe@example.org", "trial").id(), "jane-doe-trial");
        assert_eq!(params("team1", "Demo").id(), "team1-demo");
    }

    #[test]
    fn name_validation_rejects_bad_names() {
        assert!(params("team1", "ok-name").validate().is_ok());
        assert!(params("team1", "ab").validate().is_err());
        assert!(params("team1", "-leading").validate().is_err());
        assert!(params("team1", "has spaces").validate().is_err());
        assert!(params("team1", "way-too-long-deployment-name").validate().is_err());
    }

    #[test]
    fn owner_validation_rejects_empty() {
        assert!(params("@@", "ok-name").validate().is_err());
    }

    #[test]
    fn port_map_uses_fixed_offsets() {
        let d = Deployment::new(&params("team1", "demo"), 18200, "team1-demo.test.example".into());
        let ports = d.port_map();
        assert_eq!(ports["app"], 18200);
        assert_eq!(ports["mail"], 18225);
        assert_eq!(ports["db"], 18232);
        assert_eq!(ports["db-admin"], 18281);
        assert_eq!(ports["debug"], 18284);
    }

    #[test]
    fn project_name_round_trips() {
        let d = Deployment::new(&params("team1", "demo"), 18000, "s".into());
        let project = d.project_name("stack");
        assert_eq!(project, "stack_team1_demo");
        assert_eq!(id_from_project("stack", &project), Some("team1-demo".into()));
        assert_eq!(id_from_project("stack", "other_thing"), None);
        assert_eq!(id_from_project("stack", "stack"), None);
    }

    #[test]
    fn transitions_follow_table() {
        use DeploymentStatus::*;
        let mut d = Deployment::new(&params("team1", "demo"), 18000, "s".into());
        assert_eq!(d.status, Creating);
        d.transition_to(Running).unwrap();
        d.transition_to(Stopped).unwrap();
        d.transition_to(Updating).unwrap();
        d.transition_to(Error).unwrap();
        // Error never resumes on its own
        assert!(d.transition_to(Running).is_err());
        d.transition_to(Deleting).unwrap();
        // Deleting is terminal
        assert!(d.transition_to(Running).is_err());
        assert!(d.transition_to(Deleting).is_err());
    }

    #[test]
    fn transition_updates_timestamp() {
        let mut d = Deployment::new(&params("team1", "demo"), 18000, "s".into());
        let before = d.updated_at;
        std::thread::sleep(std::time::Duration::from_millis(5));
        d.transition_to(DeploymentStatus::Running).unwrap();
        assert!(d.updated_at > before);
    }

    #[test]
    fn serializes_camel_case() {
        let d = Deployment::new(&params("team1", "demo"), 18000, "s".into());
        let json = serde_json::to_string(&d).unwrap();
        assert!(json.contains("\"portBase\""));
        assert!(json.contains("\"versionSpec\""));
        assert!(json.contains("\"createdAt\""));
        assert!(!json.contains("\"port_base\""));
    }
}
