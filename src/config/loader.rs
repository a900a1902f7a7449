use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use super::parser;
use super::{Config, ConfigError};

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = fs::read_to_string(path)
        .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
    let config = parser::parse_config(&content, &base_dir)?;
    for dup in parser::duplicate_names(&config) {
        warn!(server = %dup, "conflicting server name, first definition wins");
    }
    debug!(path = %path.display(), servers = config.servers.len(), "configuration loaded");
    Ok(config)
}
