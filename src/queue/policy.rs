// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Conflict resolution policy.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How the merger reacts when a rebase stops on conflicts.
///
/// `Surface` never resolves anything silently; the other two retry the rebase
/// once with a git strategy option and are opt-in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    Surface,
    /// Keep the agent's side of conflicting hunks.
    PreferIncoming,
    /// Keep the target's side of conflicting hunks.
    PreferTarget,
}

impl ConflictPolicy {
    /// `-X` option for the retried rebase.
    ///
    /// While rebasing, "ours" is the upstream being rebased onto (the target)
    /// and "theirs" is the commit being replayed (the agent).
    pub fn strategy_option(&self) -> Option<&'static str> {
        match self {
            Self::Surface => None,
            Self::PreferIncoming => Some("theirs"),
            Self::PreferTarget => Some("ours"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Surface => "surface",
            Self::PreferIncoming => "prefer_incoming",
            Self::PreferTarget => "prefer_target",
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.replace('-', "_").as_str() {
            "surface" => Ok(Self::Surface),
            "prefer_incoming" => Ok(Self::PreferIncoming),
            "prefer_target" => Ok(Self::PreferTarget),
            other => Err(format!(
                "unknown conflict policy '{}' (expected surface, prefer_incoming, prefer_target)",
                other
            )),
        }
    }
}
