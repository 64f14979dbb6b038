// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Coordinator configuration.
//!
//! Sources, lowest precedence first:
//! - Global config: `~/.forkjoin/config.json`
//! - Workspace config: `.forkjoin.json`, `.forkjoin/config.json`, or `.forkjoin/config.yaml`
//! - Local config: `.forkjoin.local.json` (personal overrides)
//! - CLI options

mod loader;
mod merger;
mod types;

pub use loader::{
    get_global_config_dir, get_global_config_path, load_config_file, load_global_config,
    load_local_config, load_workspace_config, save_workspace_config, CONFIG_FILES,
    GLOBAL_CONFIG_DIR, GLOBAL_CONFIG_FILE, LOCAL_CONFIG_FILE,
};
pub use merger::{default_config, merge_config, CliOptions};
pub use types::{
    NamerConfig, PullRequestConfig, ResolvedConfig, WorkspaceConfig, SOCKET_FILE, STATE_DIR_NAME,
};

use std::path::Path;

use crate::error::ConfigError;

/// Load and merge every configuration source for the repository at `workspace_root`.
pub fn load_config(workspace_root: &Path, cli_options: CliOptions) -> Result<ResolvedConfig, ConfigError> {
    let global = load_global_config()?;
    let workspace = load_workspace_config(workspace_root)?;
    let local = load_local_config(workspace_root)?;
    Ok(merge_config(workspace_root, global, workspace, local, cli_options))
}
