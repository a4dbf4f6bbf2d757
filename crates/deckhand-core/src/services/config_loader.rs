use std::path::Path;

use crate::error::{DeckhandError, Result};
use crate::models::ManagerConfig;

pub const CONFIG_FILENAME: &str = "deckhand.yaml";

pub fn load(config_path: &Path) -> Result<ManagerConfig> {
    if !config_path.exists() {
        return Err(DeckhandError::ConfigNotFound(config_path.to_path_buf()));
    }
    let contents = std::fs::read_to_string(config_path)?;
    let config: ManagerConfig = serde_yaml::from_str(&contents)
        .map_err(|e| DeckhandError::InvalidConfig(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// Load the given path, or fall back to `deckhand.yaml` in the current
/// directory, or defaults when neither exists.
pub fn load_or_default(config_path: Option<&Path>) -> Result<ManagerConfig> {
    match config_path {
        Some(path) => load(path),
        None => {
            let default_path = Path::new(CONFIG_FILENAME);
            if default_path.exists() {
                load(default_path)
            } else {
                Ok(ManagerConfig::default())
            }
        }
    }
}
