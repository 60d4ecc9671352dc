//! Configuration loading and root folder resolution
//!
//! Resolution priority for every path: explicit argument → environment
//! variable → TOML config file → OS-dependent compiled default.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Top-level TOML configuration (`sonotag.toml`)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Music library root folder
    pub root_folder: Option<PathBuf>,
    /// Directory containing model sidecars and weights
    pub models_dir: Option<PathBuf>,
    /// SQLite database path (defaults to `<root_folder>/sonotag.db`)
    pub database_path: Option<PathBuf>,
    /// Log filter directive (e.g. "info", "sonotag_engine=debug")
    pub log_filter: Option<String>,
}

impl TomlConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Read TOML failed: {}", e)))?;
        toml::from_str(&content).map_err(|e| Error::Config(format!("Parse TOML failed: {}", e)))
    }

    /// Load from the default platform location, or fall back to defaults
    pub fn load_default() -> Self {
        match default_config_path() {
            Some(path) if path.exists() => match Self::load(&path) {
                Ok(config) => {
                    info!("Configuration loaded from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Ignoring unreadable config {}: {}", path.display(), e);
                    Self::default()
                }
            },
            _ => Self::default(),
        }
    }
}

/// Write configuration to a TOML file atomically (temp file + rename)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Default configuration file path for the platform
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("sonotag").join("sonotag.toml"))
}

/// Resolve the library root folder
///
/// Priority: explicit argument → `SONOTAG_ROOT` → TOML → platform default.
pub fn resolve_root_folder(explicit: Option<&Path>, config: &TomlConfig) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var("SONOTAG_ROOT") {
        return PathBuf::from(path);
    }
    if let Some(path) = &config.root_folder {
        return path.clone();
    }
    default_root_folder()
}

/// OS-dependent default root folder path
fn default_root_folder() -> PathBuf {
    dirs::audio_dir()
        .or_else(dirs::data_local_dir)
        .map(|d| d.join("sonotag"))
        .unwrap_or_else(|| PathBuf::from("./sonotag_data"))
}
