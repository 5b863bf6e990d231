//! Configuration file loading and root folder resolution
//!
//! Root folder priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. TOML config file value
//! 4. OS-dependent compiled default (fallback)
//!
//! A missing config file is not an error: callers fall back to defaults.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Environment variable naming the segment root folder
pub const ROOT_FOLDER_ENV: &str = "GALLERIA_ROOT_FOLDER";

/// Logging configuration section shared by all binaries
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive (overridden by `RUST_LOG`)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolve the segment root folder
///
/// # Arguments
/// * `cli_arg` - Value from the command line, if given
/// * `env_var_name` - Environment variable consulted second
/// * `toml_value` - Value from the TOML config file, if present
pub fn resolve_root_folder(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    toml_value: Option<&Path>,
) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = toml_value {
        return path.to_path_buf();
    }

    default_root_folder()
}

/// Locate the default configuration file for the platform
///
/// Linux checks `~/.config/galleria/config.toml` then
/// `/etc/galleria/config.toml`; other platforms use the user config dir only.
/// Returns `None` when no file exists.
pub fn default_config_path() -> Option<PathBuf> {
    let user_config = dirs::config_dir().map(|d| d.join("galleria").join("config.toml"));

    if let Some(path) = user_config {
        if path.exists() {
            return Some(path);
        }
    }

    if cfg!(target_os = "linux") {
        let system_config = PathBuf::from("/etc/galleria/config.toml");
        if system_config.exists() {
            return Some(system_config);
        }
    }

    None
}

/// OS-dependent default root folder path
pub fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("galleria"))
        .unwrap_or_else(|| PathBuf::from("./galleria_data"))
}

/// Parse a TOML file into `T`
pub fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
    let value = toml::from_str(&content)?;
    debug!("Loaded configuration from {}", path.display());
    Ok(value)
}

/// Parse a TOML file into `T`, falling back to `T::default()`
///
/// Used for bootstrap config: a missing or malformed file logs a warning and
/// startup continues with built-in defaults.
pub fn load_toml_or_default<T: DeserializeOwned + Default>(path: Option<&Path>) -> T {
    let Some(path) = path else {
        debug!("No config file found, using built-in defaults");
        return T::default();
    };

    match load_toml(path) {
        Ok(value) => value,
        Err(e) => {
            warn!("{} - using built-in defaults", e);
            T::default()
        }
    }
}
