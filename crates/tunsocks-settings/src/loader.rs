//! Layered configuration loading.
//!
//! Loads and merges configuration from two locations:
//! 1. Global: `~/.config/tunsocks/tunsocks.toml`
//! 2. Project: `<workspace>/.tunsocks/tunsocks.toml`
//!
//! Project values take precedence for scalar fields.

use crate::TunsocksConfig;
use std::path::{Path, PathBuf};

const CONFIG_FILE: &str = "tunsocks.toml";

/// Loads and merges `TunsocksConfig` from global and project-level files.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load the merged configuration for the given workspace.
    ///
    /// Missing files are silently skipped. Parse errors emit a warning to
    /// stderr and the file is treated as if absent.
    pub fn load(workspace: &Path) -> TunsocksConfig {
        Self::load_layers(
            &Self::global_config_path(),
            &Self::project_config_path(workspace),
        )
    }

    /// Merge an explicit global file with an explicit project file.
    pub fn load_layers(global: &Path, project: &Path) -> TunsocksConfig {
        Self::load_optional(global).merge(Self::load_optional(project))
    }

    /// Absolute path to the global config file.
    pub fn global_config_path() -> PathBuf {
        Self::global_config_dir()
            .unwrap_or_else(|| PathBuf::from(".tunsocks"))
            .join(CONFIG_FILE)
    }

    /// Path to the project config file for the given workspace.
    pub fn project_config_path(workspace: &Path) -> PathBuf {
        workspace.join(".tunsocks").join(CONFIG_FILE)
    }

    fn global_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("tunsocks"))
    }

    fn load_optional(path: &Path) -> TunsocksConfig {
        if !path.exists() {
            return TunsocksConfig::default();
        }
        match TunsocksConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("tunsocks-settings: warning: failed to parse {path:?}: {err}");
                TunsocksConfig::default()
            }
        }
    }
}
