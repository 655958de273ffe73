//! CLI configuration utilities

use anyhow::{Context, Result, bail};
use canvass_core::CanvassConfig;
use canvass_core::config::default_storage_dir;
use std::path::{Path, PathBuf};

/// Configuration file looked up in the data directory
pub const CONFIG_FILE: &str = "canvass.toml";

/// Data directory from the flag, `CANVASS_STATE_DIR`, or the platform default
pub fn data_dir(explicit: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(default_storage_dir)
}

/// Load configuration for a command
///
/// An explicit `--config` file must exist; otherwise `canvass.toml` in the
/// data directory is used when present. `--data-dir` also moves the session
/// mirror.
pub fn load(config_path: Option<PathBuf>, data_dir_flag: Option<PathBuf>) -> Result<CanvassConfig> {
    let file = config_path.or_else(|| {
        let candidate = data_dir(data_dir_flag.clone()).join(CONFIG_FILE);
        candidate.exists().then_some(candidate)
    });

    let mut config = CanvassConfig::load(file.as_deref()).with_context(|| match &file {
        Some(path) => format!("Failed to load configuration from {}", path.display()),
        None => "Failed to load configuration".to_string(),
    })?;
    if let Some(dir) = data_dir_flag {
        config.storage_dir = dir;
    }
    Ok(config)
}

/// Write the default configuration as TOML
pub fn generate_default_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!(
            "{} already exists; pass --force to overwrite it",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(&CanvassConfig::default())?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn generated_config_loads_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);
        generate_default_config(&path, false).unwrap();

        let loaded = load(Some(path), None).unwrap();
        let defaults = CanvassConfig::default();
        assert_eq!(loaded.api.base_url, defaults.api.base_url);
        assert_eq!(loaded.websocket.heartbeat_secs, 30);
        assert_eq!(loaded.azure.scopes, defaults.azure.scopes);
        assert_eq!(loaded.session.max_login_attempts, 5);
    }

    #[test]
    fn generate_refuses_to_overwrite() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "# mine").unwrap();

        assert!(generate_default_config(&path, false).is_err());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "# mine");
        generate_default_config(&path, true).unwrap();
        assert!(std::fs::read_to_string(&path).unwrap().contains("[api]"));
    }

    #[test]
    fn data_dir_flag_moves_storage() {
        let dir = TempDir::new().unwrap();
        let config = load(None, Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(config.storage_dir, dir.path());
    }
}
