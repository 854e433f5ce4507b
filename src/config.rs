//! Declarative project file loading.
//!
//! A project file (`convoy.yml`) is a YAML mapping of service name to
//! service options. Declaration order matters, since it breaks ties
//! between independent services during dependency ordering, so the file is
//! walked
//! as a raw mapping rather than deserialized into a map type.

use crate::service::ServiceConfig;
use std::path::Path;

/// Default project file name.
pub const DEFAULT_CONFIG_FILE: &str = "convoy.yml";

/// Project file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read project file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid YAML in project file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("project file must be a mapping of service name to options")]
    NotAMapping,

    #[error("service names must be strings, got: {0}")]
    InvalidServiceName(String),

    #[error("duplicate service name: {0}")]
    DuplicateService(String),

    #[error("service {name:?}: {source}")]
    InvalidService {
        name: String,
        source: serde_yaml::Error,
    },
}

/// Result type for config loading.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Load a project file, preserving service declaration order.
pub fn load_file(path: &Path) -> Result<Vec<(String, ServiceConfig)>> {
    let text = std::fs::read_to_string(path)?;
    load_str(&text)
}

/// Parse project file contents.
pub fn load_str(text: &str) -> Result<Vec<(String, ServiceConfig)>> {
    let document: serde_yaml::Value = serde_yaml::from_str(text)?;
    let mapping = document.as_mapping().ok_or(ConfigError::NotAMapping)?;

    let mut services: Vec<(String, ServiceConfig)> = Vec::new();
    for (key, value) in mapping {
        let name = key
            .as_str()
            .ok_or_else(|| ConfigError::InvalidServiceName(format!("{key:?}")))?
            .to_string();
        if services.iter().any(|(existing, _)| *existing == name) {
            return Err(ConfigError::DuplicateService(name));
        }
        let config: ServiceConfig = serde_yaml::from_value(value.clone())
            .map_err(|source| ConfigError::InvalidService {
                name: name.clone(),
                source,
            })?;
        services.push((name, config));
    }
    Ok(services)
}

/// Derive the default project name from a directory: the lowercased
/// basename with everything but letters and digits stripped.
pub fn project_name_from_dir(dir: &Path) -> String {
    let base = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let sanitized: String = base
        .to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    if sanitized.is_empty() {
        "default".to_string()
    } else {
        sanitized
    }
}
