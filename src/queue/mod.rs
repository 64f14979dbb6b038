// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The merge queue.
//!
//! Agents submit their branches as [`MergeJob`]s. A single coordinator task
//! drains them in FIFO order, rebasing each branch onto the session target
//! and fast-forwarding the target, so exactly one writer ever touches it.
//!
//! # Components
//!
//! - [`Coordinator`] / [`CoordinatorHandle`] - the actor and its client
//! - [`MergeExecutor`] / [`GitRebaseMerger`] - one merge attempt
//! - [`MergeJournal`] - crash marker for the in-flight merge
//! - [`ConflictPolicy`] - what to do when a rebase conflicts

mod coordinator;
mod journal;
mod merger;
mod policy;
mod types;

pub use coordinator::{Coordinator, CoordinatorHandle, CoordinatorSettings};
pub use journal::{MergeJournal, MergeMarker, MergeStage, MARKER_FILE};
pub use merger::{GitRebaseMerger, MergeExecutor, RecoveredMerge, Recovery};
pub use policy::ConflictPolicy;
pub use types::{
    DequeueOutcome, EnqueueReceipt, EnqueueRequest, JobKey, JobSnapshot, JobStatus, MergeJob,
    MergeOutcome, QueueError, QueueStatus,
};
