pub mod allocator;
pub mod compose;
pub mod config_loader;
pub mod executor;
pub mod git;
pub mod orchestrator;
pub mod proxy;
pub mod reconciler;
pub mod registry;
pub mod repo_cache;
