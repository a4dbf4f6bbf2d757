pub mod config;
pub mod deployment;
pub mod task;

pub use config::ManagerConfig;
pub use deployment::{
    id_from_project, sanitize_owner, Deployment, DeploymentParams, DeploymentStatus, VersionSpec,
};
pub use task::{TaskExecution, TaskKind};
