// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Configuration merging.
//!
//! Precedence, highest first: CLI options, local config, workspace config,
//! global config, defaults.

use std::path::{Path, PathBuf};

use crate::queue::ConflictPolicy;

use super::types::{ResolvedConfig, WorkspaceConfig};

/// Command-line overrides.
#[derive(Debug, Clone, Default)]
pub struct CliOptions {
    pub socket_path: Option<PathBuf>,
    pub state_dir: Option<PathBuf>,
    pub conflict_policy: Option<ConflictPolicy>,
    pub remote: Option<String>,
    pub no_push: bool,
    pub max_retries: Option<u32>,
}

/// Defaults for `root`.
pub fn default_config(root: &Path) -> ResolvedConfig {
    ResolvedConfig::for_root(root)
}

/// Merge the config layers for the repository at `root`.
pub fn merge_config(
    root: &Path,
    global: Option<WorkspaceConfig>,
    workspace: Option<WorkspaceConfig>,
    local: Option<WorkspaceConfig>,
    cli: CliOptions,
) -> ResolvedConfig {
    let mut result = default_config(root);
    for config in [global, workspace, local].iter().flatten() {
        apply_workspace_config(&mut result, config);
    }
    apply_cli_options(&mut result, &cli);
    result
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

fn apply_workspace_config(result: &mut ResolvedConfig, config: &WorkspaceConfig) {
    let root = result.workspace_root.clone();

    // A moved state dir drags the default socket with it.
    if let Some(ref dir) = config.state_dir {
        let default_socket = result.state_dir.join(super::types::SOCKET_FILE);
        result.state_dir = resolve(&root, dir);
        if result.socket_path == default_socket {
            result.socket_path = result.state_dir.join(super::types::SOCKET_FILE);
        }
    }
    if let Some(ref socket) = config.socket_path {
        result.socket_path = resolve(&root, socket);
    }
    if let Some(ref dir) = config.worktree_root {
        result.worktree_root = Some(resolve(&root, dir));
    }
    if let Some(ref prefix) = config.worktree_prefix {
        result.worktree_prefix = prefix.clone();
    }
    if let Some(size) = config.max_queue_size {
        result.max_queue_size = size;
    }
    if let Some(retries) = config.max_retries {
        result.max_retries = retries;
    }
    if let Some(policy) = config.conflict_policy {
        result.conflict_policy = policy;
    }
    if let Some(ref remote) = config.remote {
        result.remote = remote.clone();
    }
    if let Some(push) = config.push_on_merge {
        result.push_on_merge = push;
    }
    if let Some(auto) = config.auto_finalize {
        result.auto_finalize = auto;
    }
    if let Some(ms) = config.wait_timeout_ms {
        result.wait_timeout_ms = ms;
    }
    if let Some(ms) = config.connect_timeout_ms {
        result.connect_timeout_ms = ms;
    }

    if let Some(ref pr) = config.pull_request {
        if let Some(enabled) = pr.enabled {
            result.pull_request_enabled = enabled;
        }
        if let Some(draft) = pr.draft {
            result.pull_request_draft = draft;
        }
    }

    if let Some(ref namer) = config.namer {
        if let Some(enabled) = namer.enabled {
            result.namer_enabled = enabled;
        }
        if namer.model.is_some() {
            result.namer_model = namer.model.clone();
        }
        if namer.base_url.is_some() {
            result.namer_base_url = namer.base_url.clone();
        }
        if let Some(ms) = namer.timeout_ms {
            result.namer_timeout_ms = ms;
        }
    }
}

fn apply_cli_options(result: &mut ResolvedConfig, cli: &CliOptions) {
    let root = result.workspace_root.clone();
    if let Some(ref dir) = cli.state_dir {
        result.state_dir = resolve(&root, dir);
    }
    if let Some(ref socket) = cli.socket_path {
        result.socket_path = resolve(&root, socket);
    }
    if let Some(policy) = cli.conflict_policy {
        result.conflict_policy = policy;
    }
    if let Some(ref remote) = cli.remote {
        result.remote = remote.clone();
    }
    if cli.no_push {
        result.push_on_merge = false;
    }
    if let Some(retries) = cli.max_retries {
        result.max_retries = retries;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{NamerConfig, PullRequestConfig};

    #[test]
    fn test_merge_no_configs() {
        let result = merge_config(Path::new("/r"), None, None, None, CliOptions::default());
        assert_eq!(result, default_config(Path::new("/r")));
    }

    #[test]
    fn test_layer_precedence() {
        let global = WorkspaceConfig {
            remote: Some("global".to_string()),
            max_retries: Some(9),
            ..Default::default()
        };
        let workspace = WorkspaceConfig {
            remote: Some("workspace".to_string()),
            pull_request: Some(PullRequestConfig {
                draft: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };
        let local = WorkspaceConfig {
            remote: Some("local".to_string()),
            namer: Some(NamerConfig {
                enabled: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };

        let result = merge_config(Path::new("/r"), Some(global), Some(workspace), Some(local), CliOptions::default());
        assert_eq!(result.remote, "local");
        assert_eq!(result.max_retries, 9);
        assert!(result.pull_request_draft);
        assert!(result.pull_request_enabled);
        assert!(result.namer_enabled);
    }

    #[test]
    fn test_cli_overrides() {
        let workspace = WorkspaceConfig {
            conflict_policy: Some(ConflictPolicy::PreferTarget),
            push_on_merge: Some(true),
            ..Default::default()
        };
        let cli = CliOptions {
            conflict_policy: Some(ConflictPolicy::Surface),
            no_push: true,
            ..Default::default()
        };
        let result = merge_config(Path::new("/r"), None, Some(workspace), None, cli);
        assert_eq!(result.conflict_policy, ConflictPolicy::Surface);
        assert!(!result.push_on_merge);
    }

    #[test]
    fn test_relative_paths_resolve_against_root() {
        let workspace = WorkspaceConfig {
            state_dir: Some(PathBuf::from("var/fj")),
            ..Default::default()
        };
        let result = merge_config(Path::new("/r"), None, Some(workspace), None, CliOptions::default());
        assert_eq!(result.state_dir, PathBuf::from("/r/var/fj"));
        assert_eq!(result.socket_path, PathBuf::from("/r/var/fj/coordinator.sock"));

        let cli = CliOptions {
            socket_path: Some(PathBuf::from("/tmp/fj.sock")),
            ..Default::default()
        };
        let result = merge_config(Path::new("/r"), None, None, None, cli);
        assert_eq!(result.socket_path, PathBuf::from("/tmp/fj.sock"));
    }
}
