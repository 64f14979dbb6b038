// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Merge marker persisted before destructive steps.
//!
//! The marker records everything needed to undo an interrupted merge: the
//! target tip before the merge, the source tip before the rebase, and the
//! stage that was running. It lives next to the session database and is
//! written atomically (temp file plus rename).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::types::MergeJob;

/// Marker file name inside the state directory.
pub const MARKER_FILE: &str = "merge.marker";

/// Destructive step in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStage {
    /// Rewriting the source branch in the agent's workspace.
    Rebasing,
    /// Moving the target ref.
    Advancing,
    /// Publishing the target to the remote.
    Pushing,
}

/// On-disk record of an in-flight merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeMarker {
    pub job_id: Uuid,
    pub session_id: String,
    pub agent_id: String,
    pub source_branch: String,
    pub target_branch: String,
    pub workspace: PathBuf,
    pub target_tip_before: String,
    pub source_tip_before: String,
    /// Rebased tip, known once the rebase succeeded.
    pub new_tip: Option<String>,
    /// Whether the merge only counts once the remote has `new_tip`.
    pub push_required: bool,
    pub stage: MergeStage,
    pub written_at: DateTime<Utc>,
}

impl MergeMarker {
    pub fn new(job: &MergeJob, target_tip_before: &str, source_tip_before: &str) -> Self {
        Self {
            job_id: job.id,
            session_id: job.session_id.clone(),
            agent_id: job.agent_id.clone(),
            source_branch: job.source_branch.clone(),
            target_branch: job.target_branch.clone(),
            workspace: job.source_workspace.clone(),
            target_tip_before: target_tip_before.to_string(),
            source_tip_before: source_tip_before.to_string(),
            new_tip: None,
            push_required: false,
            stage: MergeStage::Rebasing,
            written_at: Utc::now(),
        }
    }

    /// Advance to `stage`, refreshing the timestamp.
    pub fn at(mut self, stage: MergeStage) -> Self {
        self.stage = stage;
        self.written_at = Utc::now();
        self
    }
}

/// Reads and writes the merge marker.
#[derive(Debug, Clone)]
pub struct MergeJournal {
    path: PathBuf,
}

impl MergeJournal {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(MARKER_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably replace the marker.
    pub fn write(&self, marker: &MergeMarker) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(marker)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let tmp = self.path.with_extension("marker.tmp");
        fs::write(&tmp, json)?;
        fs::File::open(&tmp)?.sync_all()?;
        fs::rename(&tmp, &self.path)
    }

    /// The marker left by an interrupted merge, if any.
    pub fn read(&self) -> io::Result<Option<MergeMarker>> {
        match fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Remove the marker. Missing is fine.
    pub fn clear(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn job() -> MergeJob {
        MergeJob::new("s1", "a1", "agent/s1/a1", PathBuf::from("/tmp/ws"), "feature/x", 1)
    }

    #[test]
    fn test_write_read_clear() {
        let dir = TempDir::new().unwrap();
        let journal = MergeJournal::new(dir.path());
        assert!(journal.read().unwrap().is_none());

        let marker = MergeMarker::new(&job(), "aaa", "bbb");
        journal.write(&marker).unwrap();
        let read = journal.read().unwrap().unwrap();
        assert_eq!(read.stage, MergeStage::Rebasing);
        assert_eq!(read.target_tip_before, "aaa");

        let mut advanced = read.at(MergeStage::Advancing);
        advanced.new_tip = Some("ccc".to_string());
        journal.write(&advanced).unwrap();
        assert_eq!(journal.read().unwrap().unwrap().new_tip.as_deref(), Some("ccc"));

        journal.clear().unwrap();
        assert!(journal.read().unwrap().is_none());
        journal.clear().unwrap();
    }

    #[test]
    fn test_garbage_marker_is_an_error() {
        let dir = TempDir::new().unwrap();
        let journal = MergeJournal::new(dir.path());
        fs::write(journal.path(), "not json").unwrap();
        let err = journal.read().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
