// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The merge queue actor.
//!
//! One task owns every piece of queue state. Callers talk to it through a
//! cloneable [`CoordinatorHandle`]; each request carries a oneshot reply.
//! The actor starts at most one merge (or finalization) at a time on a
//! spawned task and learns about its completion through an internal channel,
//! so requests keep being answered while git runs.
//!
//! Waiters subscribe to a per-job `watch` channel and are woken on every
//! status change; nobody polls.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
#[cfg(feature = "telemetry")]
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use crate::error::ErrorKind;
use crate::finalize::{FinalizeReport, Finalizer};
use crate::session::{AgentPatch, AgentStatus, Session, SessionState, SessionStore, StoreError};
use crate::telemetry::MergeSpan;
use crate::workspace::WorkspaceManager;

#[cfg(feature = "telemetry")]
use crate::telemetry::metrics::GLOBAL_METRICS;

use super::merger::{MergeExecutor, Recovery};
use super::types::{
    DequeueOutcome, EnqueueReceipt, EnqueueRequest, JobKey, JobSnapshot, JobStatus, MergeJob,
    MergeOutcome, QueueError, QueueStatus,
};

/// Capacity of the request channel.
const COMMAND_BUFFER: usize = 64;

/// Queue limits and behavior.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Pending jobs allowed before enqueue answers QueueFull.
    pub max_queue_size: usize,
    /// Explicit retries allowed after the first attempt.
    pub max_retries: u32,
    /// Finalize a session once its last agent is terminal.
    pub auto_finalize: bool,
    /// Repository whose current session answers requests naming no session.
    pub workspace_root: Option<PathBuf>,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            max_queue_size: 100,
            max_retries: 3,
            auto_finalize: true,
            workspace_root: None,
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, QueueError>>;

/// An agent, optionally pinned to a session.
#[derive(Debug, Clone)]
struct AgentRef {
    agent_id: String,
    session_id: Option<String>,
}

impl AgentRef {
    fn new(agent_id: &str, session_id: Option<&str>) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            session_id: session_id.map(str::to_string),
        }
    }
}

enum Command {
    Enqueue {
        request: EnqueueRequest,
        reply: Reply<EnqueueReceipt>,
    },
    Dequeue {
        target: AgentRef,
        reply: Reply<DequeueOutcome>,
    },
    Retry {
        target: AgentRef,
        reply: Reply<EnqueueReceipt>,
    },
    Status {
        reply: Reply<QueueStatus>,
    },
    Conflicts {
        target: AgentRef,
        reply: Reply<Vec<String>>,
    },
    Subscribe {
        target: AgentRef,
        reply: Reply<watch::Receiver<JobSnapshot>>,
    },
    UpdateAgent {
        target: AgentRef,
        status: AgentStatus,
        reply: Reply<()>,
    },
    Finalize {
        session_id: Option<String>,
        reply: Reply<FinalizeReport>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Completion of work running off the actor task.
enum Done {
    Merge {
        key: JobKey,
        outcome: MergeOutcome,
    },
    Finalize {
        session_id: String,
        result: Result<FinalizeReport, (ErrorKind, String)>,
    },
}

/// The single writer of the target branch.
enum InFlight {
    Merge(JobKey),
    Finalize(String),
}

/// Cloneable client of the coordinator actor.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Command>,
}

impl CoordinatorHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, QueueError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| QueueError::ChannelClosed)?;
        rx.await.map_err(|_| QueueError::ChannelClosed)?
    }

    /// Submit a job. Returns without waiting for the merge.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueReceipt, QueueError> {
        #[cfg(feature = "telemetry")]
        let start = Instant::now();

        let result = self.request(|reply| Command::Enqueue { request, reply }).await;

        #[cfg(feature = "telemetry")]
        GLOBAL_METRICS.record_operation("queue.enqueue", start.elapsed());

        result
    }

    /// Cancel an agent: drop its pending job, or clean it up if it has none.
    pub async fn dequeue(&self, agent_id: &str, session_id: Option<&str>) -> Result<DequeueOutcome, QueueError> {
        let target = AgentRef::new(agent_id, session_id);
        self.request(|reply| Command::Dequeue { target, reply }).await
    }

    /// Requeue a MERGE_FAILED job at the tail.
    pub async fn retry(&self, agent_id: &str, session_id: Option<&str>) -> Result<EnqueueReceipt, QueueError> {
        let target = AgentRef::new(agent_id, session_id);
        self.request(|reply| Command::Retry { target, reply }).await
    }

    pub async fn status(&self) -> Result<QueueStatus, QueueError> {
        self.request(|reply| Command::Status { reply }).await
    }

    /// Paths that stopped the agent's last merge.
    pub async fn conflicts(&self, agent_id: &str, session_id: Option<&str>) -> Result<Vec<String>, QueueError> {
        let target = AgentRef::new(agent_id, session_id);
        self.request(|reply| Command::Conflicts { target, reply }).await
    }

    /// Watch an agent's job state.
    pub async fn subscribe(
        &self,
        agent_id: &str,
        session_id: Option<&str>,
    ) -> Result<watch::Receiver<JobSnapshot>, QueueError> {
        let target = AgentRef::new(agent_id, session_id);
        self.request(|reply| Command::Subscribe { target, reply }).await
    }

    /// Block until the agent's job is MERGED or MERGE_FAILED.
    pub async fn wait(
        &self,
        agent_id: &str,
        session_id: Option<&str>,
        timeout: Duration,
    ) -> Result<JobSnapshot, QueueError> {
        let mut rx = self.subscribe(agent_id, session_id).await?;
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|snap| snap.status.is_terminal())
                .await
                .map(|snap| snap.clone())
        })
        .await;
        match waited {
            Ok(Ok(snapshot)) => Ok(snapshot),
            Ok(Err(_)) => Err(QueueError::Cancelled(agent_id.to_string())),
            Err(_) => Err(QueueError::Timeout(agent_id.to_string())),
        }
    }

    /// Record CHANGES_PENDING or COMMITTED reported by an agent.
    pub async fn update_agent(&self, session_id: &str, agent_id: &str, status: AgentStatus) -> Result<(), QueueError> {
        let target = AgentRef::new(agent_id, Some(session_id));
        self.request(|reply| Command::UpdateAgent { target, status, reply })
            .await
    }

    /// Finalize a session and wait for the report.
    pub async fn finalize(&self, session_id: Option<&str>) -> Result<FinalizeReport, QueueError> {
        let session_id = session_id.map(str::to_string);
        self.request(|reply| Command::Finalize { session_id, reply })
            .await
    }

    /// Stop accepting work. The in-flight job, if any, runs to completion.
    pub async fn shutdown(&self) -> Result<(), QueueError> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Merge queue state, owned by the actor task.
pub struct Coordinator {
    store: Arc<SessionStore>,
    merger: Arc<dyn MergeExecutor>,
    workspaces: Arc<dyn WorkspaceManager>,
    finalizer: Option<Arc<Finalizer>>,
    settings: CoordinatorSettings,

    jobs: HashMap<JobKey, MergeJob>,
    pending: VecDeque<JobKey>,
    watchers: HashMap<JobKey, watch::Sender<JobSnapshot>>,
    in_flight: Option<InFlight>,
    finalize_queue: VecDeque<String>,
    finalize_waiters: HashMap<String, Vec<Reply<FinalizeReport>>>,
    halted: HashSet<String>,
    /// Finished sessions that took a retry and must be finalized again.
    reopened: HashSet<String>,
    next_order: u64,
    shutting_down: bool,

    done_tx: mpsc::UnboundedSender<Done>,
    done_rx: mpsc::UnboundedReceiver<Done>,
}

impl Coordinator {
    pub fn new(
        store: Arc<SessionStore>,
        merger: Arc<dyn MergeExecutor>,
        workspaces: Arc<dyn WorkspaceManager>,
        finalizer: Option<Arc<Finalizer>>,
        settings: CoordinatorSettings,
    ) -> Self {
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        Self {
            store,
            merger,
            workspaces,
            finalizer,
            settings,
            jobs: HashMap::new(),
            pending: VecDeque::new(),
            watchers: HashMap::new(),
            in_flight: None,
            finalize_queue: VecDeque::new(),
            finalize_waiters: HashMap::new(),
            halted: HashSet::new(),
            reopened: HashSet::new(),
            next_order: 1,
            shutting_down: false,
            done_tx,
            done_rx,
        }
    }

    /// Restore persisted jobs, resolving any merge interrupted by a crash.
    ///
    /// QUEUED and MERGING jobs go back on the queue in their original order.
    /// Returns how many were requeued.
    pub async fn recover(&mut self) -> Result<usize, QueueError> {
        let recovered = self.merger.recover().await?;
        let mut requeued = 0;

        for mut job in self.store.load_jobs()? {
            self.next_order = self.next_order.max(job.queue_order + 1);
            let key = job.key();
            let mut outcome = None;

            match job.status {
                JobStatus::Merging => {
                    let completed = recovered
                        .as_ref()
                        .filter(|r| r.job_id == job.id)
                        .and_then(|r| match &r.recovery {
                            Recovery::Completed { commit_sha } => Some(commit_sha.clone()),
                            _ => None,
                        });
                    if let Some(sha) = completed {
                        job.status = JobStatus::Merged;
                        self.store.save_job(&job)?;
                        let session = self.store.get_session(&job.session_id)?;
                        let already = session
                            .agent(&job.agent_id)
                            .map(|a| a.status == AgentStatus::Merged)
                            .unwrap_or(false);
                        if !already {
                            self.store.record_merged(&job.session_id, &job.agent_id, &sha)?;
                        }
                        outcome = Some(MergeOutcome::Merged { commit_sha: sha });
                    } else {
                        job.status = JobStatus::Queued;
                        self.store.save_job(&job)?;
                        self.pending.push_back(key.clone());
                        requeued += 1;
                    }
                }
                JobStatus::Queued => {
                    self.pending.push_back(key.clone());
                    requeued += 1;
                }
                JobStatus::Merged | JobStatus::MergeFailed => {}
            }

            let merged = outcome.is_some();
            self.jobs.insert(key.clone(), job);
            self.publish(&key, outcome.as_ref());
            if merged {
                self.destroy_workspace(&key).await;
            }
        }

        if requeued > 0 {
            info!("Recovered {} queued merge job(s)", requeued);
        }
        Ok(requeued)
    }

    /// Start the actor. The returned task ends after shutdown once the
    /// in-flight job has finished.
    pub fn spawn(self) -> (CoordinatorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let task = tokio::spawn(self.run(rx));
        (CoordinatorHandle { tx }, task)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        debug!("Coordinator started with {} pending job(s)", self.pending.len());
        let mut accepting = true;

        loop {
            self.schedule();
            if self.shutting_down && self.in_flight.is_none() {
                break;
            }

            tokio::select! {
                command = commands.recv(), if accepting => match command {
                    Some(command) => self.handle(command).await,
                    None => {
                        accepting = false;
                        self.shutting_down = true;
                    }
                },
                Some(done) = self.done_rx.recv() => self.complete(done).await,
            }
        }

        for (_, waiters) in self.finalize_waiters.drain() {
            for waiter in waiters {
                let _ = waiter.send(Err(QueueError::ShuttingDown));
            }
        }
        info!("Coordinator stopped");
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::Enqueue { request, reply } => {
                let _ = reply.send(self.enqueue(request));
            }
            Command::Dequeue { target, reply } => {
                let _ = reply.send(self.dequeue(&target).await);
            }
            Command::Retry { target, reply } => {
                let _ = reply.send(self.retry(&target));
            }
            Command::Status { reply } => {
                let _ = reply.send(Ok(self.status()));
            }
            Command::Conflicts { target, reply } => {
                let _ = reply.send(self.conflicts(&target));
            }
            Command::Subscribe { target, reply } => {
                let _ = reply.send(self.subscribe(&target));
            }
            Command::UpdateAgent { target, status, reply } => {
                let _ = reply.send(self.update_agent(&target, status));
            }
            Command::Finalize { session_id, reply } => self.request_finalize(session_id, reply),
            Command::Shutdown { reply } => {
                info!("Shutdown requested; {} job(s) left queued", self.pending.len());
                self.shutting_down = true;
                let _ = reply.send(Ok(()));
            }
        }
    }

    // ========================================================================
    // Requests
    // ========================================================================

    fn enqueue(&mut self, request: EnqueueRequest) -> Result<EnqueueReceipt, QueueError> {
        if self.shutting_down {
            return Err(QueueError::ShuttingDown);
        }
        if self.halted.contains(&request.session_id) {
            return Err(QueueError::SessionHalted(request.session_id));
        }

        let session = match self.store.get_session(&request.session_id) {
            Ok(session) => session,
            Err(StoreError::SessionNotFound(id)) => {
                return Err(QueueError::Rejected(format!("unknown session {}", id)));
            }
            Err(e) => return Err(e.into()),
        };
        let Some(agent) = session.agent(&request.agent_id) else {
            return Err(QueueError::Rejected(format!(
                "unknown agent {} in session {}",
                request.agent_id, request.session_id
            )));
        };
        if request.branch != agent.branch_name {
            return Err(QueueError::Rejected(format!(
                "branch {} does not belong to agent {}",
                request.branch, request.agent_id
            )));
        }
        if request.target_branch != session.target_branch {
            return Err(QueueError::Rejected(format!(
                "session {} targets {}, not {}",
                session.session_id, session.target_branch, request.target_branch
            )));
        }

        let key = JobKey::new(&request.session_id, &request.agent_id);
        if let Some(job) = self.jobs.get(&key) {
            return match job.status {
                JobStatus::Queued => Ok(EnqueueReceipt::Queued {
                    position: self.position(&key),
                }),
                JobStatus::Merging => Ok(EnqueueReceipt::Merging),
                JobStatus::Merged => Ok(EnqueueReceipt::Merged {
                    commit_sha: agent.merged_sha.clone(),
                }),
                JobStatus::MergeFailed => Err(QueueError::Rejected(format!(
                    "agent {} failed to merge; retry it instead",
                    request.agent_id
                ))),
            };
        }
        match agent.status {
            AgentStatus::Merged => {
                return Ok(EnqueueReceipt::Merged {
                    commit_sha: agent.merged_sha.clone(),
                })
            }
            AgentStatus::CleanedUp | AgentStatus::MergeFailed => {
                return Err(QueueError::Rejected(format!(
                    "agent {} is {}",
                    request.agent_id, agent.status
                )));
            }
            _ => {}
        }
        if session.state.is_finished() {
            return Err(QueueError::Rejected(format!(
                "session {} is {}",
                session.session_id, session.state
            )));
        }
        if self.pending.len() >= self.settings.max_queue_size {
            return Err(QueueError::QueueFull(self.pending.len()));
        }

        let job = MergeJob::new(
            &request.session_id,
            &request.agent_id,
            &agent.branch_name,
            agent.workspace_path.clone(),
            &session.target_branch,
            self.next_order,
        );
        let position = self.pending.len() + 1;
        let mut patch = AgentPatch::status(AgentStatus::Queued).with_position(position as u32);
        if let Some(sha) = &request.commit_sha {
            patch = patch.with_commit(sha);
        }
        if let Some(message) = &request.commit_message {
            patch = patch.with_message(message);
        }

        self.store.save_job(&job).map_err(|e| self.store_failed(&key.session_id, e))?;
        if let Err(e) = self.store.update_agent(&key.session_id, &key.agent_id, &patch) {
            let _ = self.store.delete_job(&job.id);
            return Err(self.store_failed(&key.session_id, e));
        }

        self.next_order += 1;
        self.jobs.insert(key.clone(), job);
        self.pending.push_back(key.clone());
        self.publish(&key, None);
        info!("Queued {} at position {}", key, position);
        Ok(EnqueueReceipt::Queued { position })
    }

    async fn dequeue(&mut self, target: &AgentRef) -> Result<DequeueOutcome, QueueError> {
        let key = self.resolve_key(target)?;

        if let Some(job) = self.jobs.get(&key) {
            match job.status {
                JobStatus::Merging => return Err(QueueError::JobInFlight(key.agent_id)),
                JobStatus::Merged | JobStatus::MergeFailed => return Ok(DequeueOutcome::AlreadyComplete),
                JobStatus::Queued => {
                    let job_id = job.id;
                    self.pending.retain(|k| k != &key);
                    self.jobs.remove(&key);
                    // Dropping the sender wakes waiters with "cancelled".
                    self.watchers.remove(&key);
                    if let Err(e) = self.store.delete_job(&job_id) {
                        warn!("Could not delete job for {}: {}", key, e);
                    }
                    self.cancel_agent(&key).await?;
                    self.maybe_finalize(&key.session_id);
                    return Ok(DequeueOutcome::Removed);
                }
            }
        }

        let session = self.store.get_session(&key.session_id)?;
        let Some(agent) = session.agent(&key.agent_id) else {
            return Err(QueueError::JobNotFound(key.agent_id));
        };
        if agent.status.is_terminal() {
            return Ok(DequeueOutcome::AlreadyComplete);
        }
        self.cancel_agent(&key).await?;
        self.maybe_finalize(&key.session_id);
        Ok(DequeueOutcome::CleanedUp)
    }

    fn retry(&mut self, target: &AgentRef) -> Result<EnqueueReceipt, QueueError> {
        if self.shutting_down {
            return Err(QueueError::ShuttingDown);
        }
        let key = self.resolve_key(target)?;
        let Some(job) = self.jobs.get(&key) else {
            return Err(QueueError::JobNotFound(key.agent_id));
        };
        if job.status != JobStatus::MergeFailed {
            return Err(QueueError::NotRetryable {
                agent_id: key.agent_id,
                status: job.status,
            });
        }
        if job.attempt_count.saturating_sub(1) >= self.settings.max_retries {
            return Err(QueueError::RetryLimit {
                agent_id: key.agent_id,
                attempts: job.attempt_count,
            });
        }
        if self.halted.contains(&key.session_id) {
            return Err(QueueError::SessionHalted(key.session_id));
        }
        if self.pending.len() >= self.settings.max_queue_size {
            return Err(QueueError::QueueFull(self.pending.len()));
        }

        let session = self.store.get_session(&key.session_id)?;

        let mut job = job.clone();
        job.attempt_count += 1;
        job.status = JobStatus::Queued;
        job.last_error = None;
        job.conflict_files.clear();
        job.queue_order = self.next_order;

        let position = self.pending.len() + 1;
        let patch = AgentPatch {
            status: Some(AgentStatus::Queued),
            queue_position: Some(position as u32),
            conflict_files: Some(Vec::new()),
            ..Default::default()
        };
        self.store.save_job(&job).map_err(|e| self.store_failed(&key.session_id, e))?;
        self.store
            .update_agent(&key.session_id, &key.agent_id, &patch)
            .map_err(|e| self.store_failed(&key.session_id, e))?;

        self.reopen(&session)?;

        info!("Retrying {} (attempt {})", key, job.attempt_count);
        self.next_order += 1;
        self.jobs.insert(key.clone(), job);
        self.pending.push_back(key.clone());
        self.publish(&key, None);
        Ok(EnqueueReceipt::Queued { position })
    }

    /// Send a finished (or finishing) session back to MERGING so the next
    /// drain finalizes it again and the pull request picks up the retry.
    fn reopen(&mut self, session: &Session) -> Result<(), QueueError> {
        let session_id = session.session_id.as_str();
        let finalizing = matches!(&self.in_flight, Some(InFlight::Finalize(s)) if s == session_id);
        if !session.state.is_finished() && !finalizing {
            return Ok(());
        }
        if !self.finalize_waiters.contains_key(session_id) {
            self.finalize_queue.retain(|s| s != session_id);
        }
        if session.state.is_finished() {
            self.store
                .mark_session_state(session_id, SessionState::Merging)
                .map_err(|e| self.store_failed(session_id, e))?;
            info!("Session {} reopened for a retry", session_id);
        }
        self.reopened.insert(session_id.to_string());
        Ok(())
    }

    fn status(&self) -> QueueStatus {
        let merging = match &self.in_flight {
            Some(InFlight::Merge(key)) => Some(key.agent_id.clone()),
            _ => None,
        };
        let processing = usize::from(merging.is_some());
        QueueStatus {
            length: self.pending.len() + processing,
            pending: self.pending.len(),
            processing,
            merging,
            agents: self.pending.iter().map(|k| k.agent_id.clone()).collect(),
            shutting_down: self.shutting_down,
        }
    }

    fn conflicts(&self, target: &AgentRef) -> Result<Vec<String>, QueueError> {
        let key = self.resolve_key(target)?;
        if let Some(job) = self.jobs.get(&key) {
            return Ok(job.conflict_files.clone());
        }
        let session = self.store.get_session(&key.session_id)?;
        session
            .agent(&key.agent_id)
            .map(|a| a.conflict_files.clone())
            .ok_or(QueueError::JobNotFound(key.agent_id))
    }

    fn subscribe(&mut self, target: &AgentRef) -> Result<watch::Receiver<JobSnapshot>, QueueError> {
        let key = self.resolve_key(target)?;
        if let Some(tx) = self.watchers.get(&key) {
            return Ok(tx.subscribe());
        }
        if self.jobs.contains_key(&key) {
            self.publish(&key, None);
        } else {
            // Merged in an earlier daemon run whose job row is gone.
            let session = self.store.get_session(&key.session_id)?;
            let agent = session
                .agent(&key.agent_id)
                .filter(|a| a.status == AgentStatus::Merged)
                .ok_or_else(|| QueueError::JobNotFound(key.agent_id.clone()))?;
            let snapshot = JobSnapshot {
                agent_id: key.agent_id.clone(),
                session_id: key.session_id.clone(),
                status: JobStatus::Merged,
                attempt_count: 1,
                commit_sha: agent.merged_sha.clone(),
                conflict_files: Vec::new(),
                last_error: None,
                error_kind: None,
            };
            self.watchers.insert(key.clone(), watch::channel(snapshot).0);
        }
        self.watchers
            .get(&key)
            .map(|tx| tx.subscribe())
            .ok_or(QueueError::JobNotFound(key.agent_id))
    }

    fn update_agent(&mut self, target: &AgentRef, status: AgentStatus) -> Result<(), QueueError> {
        if !matches!(status, AgentStatus::ChangesPending | AgentStatus::Committed) {
            return Err(QueueError::Rejected(format!(
                "agents may only report CHANGES_PENDING or COMMITTED, not {}",
                status
            )));
        }
        let key = self.resolve_key(target)?;
        self.store
            .update_agent(&key.session_id, &key.agent_id, &AgentPatch::status(status))?;
        debug!("Agent {} reported {}", key, status);
        Ok(())
    }

    fn request_finalize(&mut self, session_id: Option<String>, reply: Reply<FinalizeReport>) {
        if self.finalizer.is_none() {
            let _ = reply.send(Err(QueueError::FinalizeDisabled));
            return;
        }
        let session_id = match session_id {
            Some(id) => id,
            None => match self.current_session() {
                Ok(id) => id,
                Err(e) => {
                    let _ = reply.send(Err(e));
                    return;
                }
            },
        };
        self.finalize_waiters
            .entry(session_id.clone())
            .or_default()
            .push(reply);
        if !self.finalize_scheduled(&session_id) {
            self.finalize_queue.push_back(session_id);
        }
    }

    // ========================================================================
    // Worker
    // ========================================================================

    /// Start the next unit of work if the target is idle.
    fn schedule(&mut self) {
        if self.in_flight.is_some() {
            return;
        }
        // Finalization waits for the running merge, then goes before the next one.
        if let Some(session_id) = self.finalize_queue.pop_front() {
            self.start_finalize(session_id);
            return;
        }
        if self.shutting_down {
            return;
        }
        while let Some(key) = self.pending.pop_front() {
            if self.halted.contains(&key.session_id) {
                continue;
            }
            if self.start_merge(&key) {
                return;
            }
        }
    }

    fn start_merge(&mut self, key: &JobKey) -> bool {
        let Some(job) = self.jobs.get_mut(key) else {
            return false;
        };
        if job.status != JobStatus::Queued {
            return false;
        }
        job.status = JobStatus::Merging;
        let job = job.clone();

        if let Err(e) = self.store.save_job(&job) {
            self.store_failed(&key.session_id, e);
            return false;
        }
        match self.store.get_session(&key.session_id) {
            Ok(session) if session.state == SessionState::Started => {
                if let Err(e) = self
                    .store
                    .mark_session_state(&key.session_id, SessionState::Merging)
                {
                    self.store_failed(&key.session_id, e);
                    return false;
                }
            }
            Ok(_) => {}
            Err(e) => {
                self.store_failed(&key.session_id, e);
                return false;
            }
        }
        self.publish(key, None);

        let merger = Arc::clone(&self.merger);
        let done = self.done_tx.clone();
        let key = key.clone();
        self.in_flight = Some(InFlight::Merge(key.clone()));
        tokio::spawn(async move {
            let worker = tokio::spawn(async move {
                let span = MergeSpan::start(&job.session_id, &job.agent_id, job.attempt_count);
                let outcome = merger.merge(&job).instrument(span.span().clone()).await;
                span.finish(outcome.label());
                outcome
            });
            let outcome = worker.await.unwrap_or_else(|e| {
                MergeOutcome::failed(ErrorKind::Internal, format!("merge task failed: {}", e))
            });
            let _ = done.send(Done::Merge { key, outcome });
        });
        true
    }

    fn start_finalize(&mut self, session_id: String) {
        let Some(finalizer) = self.finalizer.clone() else {
            return;
        };
        let done = self.done_tx.clone();
        let id = session_id.clone();
        self.in_flight = Some(InFlight::Finalize(session_id));
        tokio::spawn(async move {
            let worker = {
                let id = id.clone();
                tokio::spawn(async move {
                    finalizer
                        .finalize(&id)
                        .await
                        .map_err(|e| (e.kind(), e.to_string()))
                })
            };
            let result = worker
                .await
                .unwrap_or_else(|e| Err((ErrorKind::Internal, format!("finalize task failed: {}", e))));
            let _ = done.send(Done::Finalize { session_id: id, result });
        });
    }

    async fn complete(&mut self, done: Done) {
        self.in_flight = None;
        match done {
            Done::Merge { key, outcome } => self.finish_merge(key, outcome).await,
            Done::Finalize { session_id, result } => {
                match &result {
                    Ok(report) => info!("Session {} finalized as {}", session_id, report.state),
                    Err((_, message)) => warn!("Finalizing {} failed: {}", session_id, message),
                }
                for waiter in self.finalize_waiters.remove(&session_id).unwrap_or_default() {
                    let reply = match &result {
                        Ok(report) => Ok(report.clone()),
                        Err((kind, message)) => Err(QueueError::Finalize {
                            kind: *kind,
                            message: message.clone(),
                        }),
                    };
                    let _ = waiter.send(reply);
                }
            }
        }
    }

    async fn finish_merge(&mut self, key: JobKey, outcome: MergeOutcome) {
        let Some(job) = self.jobs.get_mut(&key) else {
            warn!("Merge finished for unknown job {}", key);
            return;
        };
        match &outcome {
            MergeOutcome::Merged { commit_sha } => {
                job.status = JobStatus::Merged;
                job.last_error = None;
                job.conflict_files.clear();
                info!("Merged {} as {}", key, commit_sha);
            }
            MergeOutcome::Conflict { files } => {
                job.status = JobStatus::MergeFailed;
                job.conflict_files = files.clone();
                job.last_error = Some(format!("merge conflict in {}", files.join(", ")));
                warn!("Merge of {} conflicted in {} file(s)", key, files.len());
            }
            MergeOutcome::Failed { kind, reason } => {
                job.status = JobStatus::MergeFailed;
                job.conflict_files.clear();
                job.last_error = Some(reason.clone());
                warn!("Merge of {} failed ({}): {}", key, kind, reason);
            }
        }
        let job = job.clone();

        match self.persist_outcome(&job, &outcome) {
            Ok(()) if outcome.is_merged() => self.destroy_workspace(&key).await,
            Ok(()) => {}
            Err(e) => {
                self.store_failed(&key.session_id, e);
            }
        }
        self.publish(&key, Some(&outcome));
        self.maybe_finalize(&key.session_id);
    }

    fn persist_outcome(&self, job: &MergeJob, outcome: &MergeOutcome) -> Result<(), StoreError> {
        self.store.save_job(job)?;
        match outcome {
            MergeOutcome::Merged { commit_sha } => {
                self.store
                    .record_merged(&job.session_id, &job.agent_id, commit_sha)?;
            }
            MergeOutcome::Conflict { files } => {
                self.store
                    .record_merge_failed(&job.session_id, &job.agent_id, files, true)?;
            }
            MergeOutcome::Failed { .. } => {
                self.store
                    .record_merge_failed(&job.session_id, &job.agent_id, &[], false)?;
            }
        }
        Ok(())
    }

    /// Queue finalization once a session has nothing left to merge.
    fn maybe_finalize(&mut self, session_id: &str) {
        if !self.settings.auto_finalize || self.finalizer.is_none() || self.halted.contains(session_id) {
            return;
        }
        if self.finalize_scheduled(session_id) {
            return;
        }
        let busy = self.pending.iter().any(|k| k.session_id == session_id)
            || matches!(&self.in_flight, Some(InFlight::Merge(k)) if k.session_id == session_id);
        if busy {
            return;
        }
        let reopened = self.reopened.contains(session_id);
        match self.store.get_session(session_id) {
            Ok(session)
                if !session.agents.is_empty() && session.is_drained() && (reopened || !session.state.is_finished()) =>
            {
                info!("All agents of {} are done; finalizing", session_id);
                self.reopened.remove(session_id);
                self.finalize_queue.push_back(session_id.to_string());
            }
            Ok(_) => {}
            Err(e) => warn!("Could not check session {}: {}", session_id, e),
        }
    }

    fn finalize_scheduled(&self, session_id: &str) -> bool {
        self.finalize_queue.iter().any(|s| s == session_id)
            || matches!(&self.in_flight, Some(InFlight::Finalize(s)) if s == session_id)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// 1-based position among pending jobs, 0 when not pending.
    fn position(&self, key: &JobKey) -> usize {
        self.pending
            .iter()
            .position(|k| k == key)
            .map(|i| i + 1)
            .unwrap_or(0)
    }

    fn current_session(&self) -> Result<String, QueueError> {
        let root = self
            .settings
            .workspace_root
            .as_ref()
            .ok_or_else(|| QueueError::SessionNotFound("no session given".to_string()))?;
        self.store
            .current(root)?
            .ok_or_else(|| QueueError::SessionNotFound(format!("no current session for {}", root.display())))
    }

    /// Resolve an agent reference: explicit session, else the agent's most
    /// recent job, else the current session.
    fn resolve_key(&self, target: &AgentRef) -> Result<JobKey, QueueError> {
        if let Some(session_id) = &target.session_id {
            return Ok(JobKey::new(session_id, &target.agent_id));
        }
        if let Some(job) = self
            .jobs
            .values()
            .filter(|j| j.agent_id == target.agent_id)
            .max_by_key(|j| j.queue_order)
        {
            return Ok(job.key());
        }
        match self.current_session() {
            Ok(session_id) => Ok(JobKey::new(session_id, &target.agent_id)),
            Err(_) => Err(QueueError::JobNotFound(target.agent_id.clone())),
        }
    }

    /// Push the job's current state to its watchers.
    fn publish(&mut self, key: &JobKey, outcome: Option<&MergeOutcome>) {
        let Some(job) = self.jobs.get(key) else {
            return;
        };
        let mut snapshot = job.snapshot();
        match outcome {
            Some(MergeOutcome::Merged { commit_sha }) => snapshot.commit_sha = Some(commit_sha.clone()),
            Some(MergeOutcome::Conflict { .. }) => snapshot.error_kind = Some(ErrorKind::MergeConflict),
            Some(MergeOutcome::Failed { kind, .. }) => snapshot.error_kind = Some(*kind),
            None if job.status == JobStatus::Merged => {
                snapshot.commit_sha = self
                    .store
                    .get_session(&key.session_id)
                    .ok()
                    .and_then(|s| s.agent(&key.agent_id).and_then(|a| a.merged_sha.clone()));
            }
            None => {}
        }
        match self.watchers.get(key) {
            Some(tx) => {
                tx.send_replace(snapshot);
            }
            None => {
                self.watchers.insert(key.clone(), watch::channel(snapshot).0);
            }
        }
    }

    async fn cancel_agent(&mut self, key: &JobKey) -> Result<(), QueueError> {
        let session = self.store.get_session(&key.session_id)?;
        let Some(agent) = session.agent(&key.agent_id) else {
            return Err(QueueError::JobNotFound(key.agent_id.clone()));
        };
        self.workspaces
            .destroy(&agent.workspace_path, &agent.branch_name)
            .await?;
        self.store.update_agent(
            &key.session_id,
            &key.agent_id,
            &AgentPatch::status(AgentStatus::CleanedUp),
        )?;
        info!("Agent {} cleaned up", key);
        Ok(())
    }

    async fn destroy_workspace(&self, key: &JobKey) {
        let agent = match self.store.get_session(&key.session_id) {
            Ok(session) => session.agent(&key.agent_id).cloned(),
            Err(e) => {
                warn!("Could not load session {}: {}", key.session_id, e);
                None
            }
        };
        if let Some(agent) = agent {
            if let Err(e) = self
                .workspaces
                .destroy(&agent.workspace_path, &agent.branch_name)
                .await
            {
                warn!("Could not remove workspace of {}: {}", key, e);
            }
        }
    }

    /// Log a store failure and halt the session.
    fn store_failed(&mut self, session_id: &str, err: StoreError) -> QueueError {
        error!("Session store failure; halting session {}: {}", session_id, err);
        self.halted.insert(session_id.to_string());
        QueueError::Store(err)
    }
}
