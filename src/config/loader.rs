// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration loading from files.

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

use super::types::WorkspaceConfig;

/// Workspace config file names, first match wins.
pub const CONFIG_FILES: &[&str] = &[".forkjoin.json", ".forkjoin/config.json", ".forkjoin/config.yaml"];

/// Personal overrides, not meant to be committed.
pub const LOCAL_CONFIG_FILE: &str = ".forkjoin.local.json";

/// Global config directory under the home directory.
pub const GLOBAL_CONFIG_DIR: &str = ".forkjoin";

pub const GLOBAL_CONFIG_FILE: &str = "config.json";

pub fn get_global_config_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(GLOBAL_CONFIG_DIR))
}

pub fn get_global_config_path() -> Option<PathBuf> {
    get_global_config_dir().map(|dir| dir.join(GLOBAL_CONFIG_FILE))
}

/// Load `~/.forkjoin/config.json` if present.
pub fn load_global_config() -> Result<Option<WorkspaceConfig>, ConfigError> {
    match get_global_config_path() {
        Some(path) if path.exists() => load_config_file(&path).map(Some),
        _ => Ok(None),
    }
}

/// Load the first of [`CONFIG_FILES`] found in `workspace_root`.
pub fn load_workspace_config(workspace_root: &Path) -> Result<Option<WorkspaceConfig>, ConfigError> {
    for filename in CONFIG_FILES {
        let path = workspace_root.join(filename);
        if path.is_file() {
            return load_config_file(&path).map(Some);
        }
    }
    Ok(None)
}

pub fn load_local_config(workspace_root: &Path) -> Result<Option<WorkspaceConfig>, ConfigError> {
    let path = workspace_root.join(LOCAL_CONFIG_FILE);
    if !path.is_file() {
        return Ok(None);
    }
    load_config_file(&path).map(Some)
}

/// Parse a config file; `.yaml`/`.yml` as YAML, anything else as JSON.
pub fn load_config_file(path: &Path) -> Result<WorkspaceConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    let config: WorkspaceConfig = match extension.as_str() {
        "yaml" | "yml" => serde_yaml::from_str(&content)?,
        _ => serde_json::from_str(&content)?,
    };
    validate(&config)?;
    Ok(config)
}

fn validate(config: &WorkspaceConfig) -> Result<(), ConfigError> {
    if config.max_queue_size == Some(0) {
        return Err(ConfigError::InvalidValue {
            field: "maxQueueSize".to_string(),
            message: "must be at least 1".to_string(),
        });
    }
    if let Some(prefix) = &config.worktree_prefix {
        if prefix.contains('/') {
            return Err(ConfigError::InvalidValue {
                field: "worktreePrefix".to_string(),
                message: "must not contain '/'".to_string(),
            });
        }
    }
    Ok(())
}

/// Write `config` as pretty JSON to `.forkjoin.json` in `workspace_root`.
pub fn save_workspace_config(workspace_root: &Path, config: &WorkspaceConfig) -> Result<PathBuf, ConfigError> {
    let path = workspace_root.join(CONFIG_FILES[0]);
    std::fs::write(&path, serde_json::to_string_pretty(config)?)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::ConflictPolicy;
    use tempfile::TempDir;

    #[test]
    fn test_global_config_dir() {
        let dir = get_global_config_dir().unwrap();
        assert!(dir.ends_with(".forkjoin"));
    }

    #[test]
    fn test_load_workspace_config_not_found() {
        let temp = TempDir::new().unwrap();
        assert!(load_workspace_config(temp.path()).unwrap().is_none());
        assert!(load_local_config(temp.path()).unwrap().is_none());
    }

    #[test]
    fn test_load_workspace_config_yaml() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join(".forkjoin")).unwrap();
        std::fs::write(
            temp.path().join(".forkjoin/config.yaml"),
            "maxRetries: 1\nconflictPolicy: prefer_incoming\nremote: upstream\n",
        )
        .unwrap();

        let config = load_workspace_config(temp.path()).unwrap().unwrap();
        assert_eq!(config.max_retries, Some(1));
        assert_eq!(config.conflict_policy, Some(ConflictPolicy::PreferIncoming));
        assert_eq!(config.remote.as_deref(), Some("upstream"));
    }

    #[test]
    fn test_json_takes_precedence_over_yaml() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join(".forkjoin")).unwrap();
        std::fs::write(temp.path().join(".forkjoin/config.yaml"), "remote: yaml\n").unwrap();
        std::fs::write(temp.path().join(".forkjoin.json"), r#"{"remote": "json"}"#).unwrap();

        let config = load_workspace_config(temp.path()).unwrap().unwrap();
        assert_eq!(config.remote.as_deref(), Some("json"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(".forkjoin.json");
        std::fs::write(&path, r#"{"maxQueueSize": 0}"#).unwrap();
        assert!(matches!(
            load_config_file(&path),
            Err(ConfigError::InvalidValue { .. })
        ));

        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_config_file(&path), Err(ConfigError::JsonError(_))));
    }

    #[test]
    fn test_save_round_trip() {
        let temp = TempDir::new().unwrap();
        let config = WorkspaceConfig {
            push_on_merge: Some(false),
            ..Default::default()
        };
        let path = save_workspace_config(temp.path(), &config).unwrap();
        assert_eq!(path.file_name().unwrap(), ".forkjoin.json");
        assert_eq!(load_config_file(&path).unwrap(), config);
    }
}
