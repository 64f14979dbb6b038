// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! fork-join entry point - coordinator daemon and session commands.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::warn;

use forkjoin::completion::{AgentContext, CompletionClient, CompletionReport};
use forkjoin::config::{self, CliOptions, ResolvedConfig};
use forkjoin::finalize::{FinalizeReport, FinalizeSettings, Finalizer, GhCliSink, PullRequestSink};
use forkjoin::ipc::{IpcClient, IpcError, IpcServer};
use forkjoin::namer::{HttpNamer, Namer, NoopNamer};
use forkjoin::queue::{
    ConflictPolicy, Coordinator, CoordinatorSettings, EnqueueReceipt, GitRebaseMerger, JobSnapshot, JobStatus,
    QueueStatus,
};
use forkjoin::session::{Session, SessionService, SessionStore, StartOptions};
use forkjoin::telemetry::{init_telemetry, TelemetryConfig};
use forkjoin::workspace::{find_repo_root, GitWorktreeManager, WorkspaceManager};
use forkjoin::{kind_of, ErrorKind, VERSION};

/// fork-join - merge coordinator for parallel coding agents.
#[derive(Parser)]
#[command(name = "fork-join")]
#[command(author, version, about = "Merge coordinator for parallel coding agents", long_about = None)]
struct Cli {
    /// Repository root (defaults to the enclosing git repository)
    #[arg(long, global = true, env = "FORKJOIN_ROOT")]
    root: Option<PathBuf>,

    /// Coordinator socket path
    #[arg(long, global = true, env = "FORKJOIN_SOCKET")]
    socket: Option<PathBuf>,

    /// State directory (session database, merge markers)
    #[arg(long, global = true, env = "FORKJOIN_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    json: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

/// Subcommands for fork-join.
#[derive(Subcommand)]
enum Commands {
    /// Run the coordinator and IPC server in the foreground
    Daemon {
        /// How rebase conflicts are handled (surface, prefer-incoming, prefer-target)
        #[arg(long)]
        conflict_policy: Option<ConflictPolicy>,
        /// Remote to push merged targets to
        #[arg(long)]
        remote: Option<String>,
        /// Never push after a merge
        #[arg(long)]
        no_push: bool,
        /// Attempts allowed per job before it is terminal
        #[arg(long)]
        max_retries: Option<u32>,
    },

    /// Fork a task: create the target branch and one workspace per agent
    Start {
        /// Branch the agents fork from
        #[arg(long, default_value = "main")]
        base: String,
        /// Integration branch (derived from the prompt when omitted)
        #[arg(long)]
        target: Option<String>,
        /// Task description
        #[arg(long)]
        prompt: Option<String>,
        /// Agent identifiers
        #[arg(long = "agent", required = true, num_args = 1..)]
        agents: Vec<String>,
    },

    /// Show the session and queue status
    Status {
        #[arg(long)]
        session: Option<String>,
    },

    /// Commit an agent's work and submit it for merging
    Complete {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        session: Option<String>,
        /// Commit message for uncommitted changes
        #[arg(short, long)]
        message: Option<String>,
        /// Block until the merge finishes
        #[arg(long)]
        wait: bool,
        /// Wait bound in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Cancel an agent and drop its queued merge
    Dequeue {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        session: Option<String>,
    },

    /// Requeue a failed merge
    Retry {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        session: Option<String>,
    },

    /// List the files that stopped an agent's merge
    Conflicts {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        session: Option<String>,
    },

    /// Join a session: push the target and open the pull request
    Finalize {
        #[arg(long)]
        session: Option<String>,
    },

    /// Delete a finished session record and its leftover workspaces
    Cleanup {
        #[arg(long)]
        session: String,
        /// Also remove sessions that are still running
        #[arg(long)]
        force: bool,
    },

    /// Stop the coordinator daemon
    Shutdown,

    /// Show configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },

    /// Show version information
    Version,
}

/// Config subcommand actions.
#[derive(Subcommand)]
enum ConfigAction {
    /// Show the resolved configuration
    Show,
}

// ============================================================================
// Entry point
// ============================================================================

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let daemon = reports_metrics(&cli.command);
    let telemetry = if daemon {
        TelemetryConfig::production()
    } else {
        TelemetryConfig::default()
    }
    .with_verbosity(cli.verbose);
    let guard = match init_telemetry(&telemetry) {
        Ok(guard) if daemon => Some(guard.report_on_drop()),
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("{} could not initialize logging: {}", "warning:".yellow(), e);
            None
        }
    };

    let json = cli.json;
    let result = handle_command(cli).await;
    drop(guard);

    if let Err(err) = result {
        let kind = kind_of(&err);
        if json {
            let body = serde_json::json!({ "status": "ERROR", "code": kind, "reason": format!("{:#}", err) });
            println!("{}", body);
        } else {
            eprintln!("{} {:#}", "error:".red().bold(), err);
        }
        std::process::exit(kind.exit_code());
    }
}

/// Only the long-running daemon logs a metrics report at exit.
fn reports_metrics(command: &Commands) -> bool {
    matches!(command, Commands::Daemon { .. })
}

/// Resolved repository, configuration, and output mode for one command.
struct Context {
    root: PathBuf,
    config: ResolvedConfig,
    json: bool,
}

impl Context {
    fn load(cli: &Cli, overrides: CliOptions) -> anyhow::Result<Self> {
        let root = match &cli.root {
            Some(root) => root.clone(),
            None => {
                let cwd = std::env::current_dir().context("reading current directory")?;
                find_repo_root(&cwd).unwrap_or(cwd)
            }
        };
        let options = CliOptions {
            socket_path: cli.socket.clone(),
            state_dir: cli.state_dir.clone(),
            ..overrides
        };
        let config = config::load_config(&root, options)?;
        Ok(Self {
            root,
            config,
            json: cli.json,
        })
    }

    fn client(&self) -> IpcClient {
        IpcClient::new(&self.config.socket_path).with_connect_timeout(self.config.connect_timeout())
    }

    fn store(&self) -> anyhow::Result<Arc<SessionStore>> {
        Ok(Arc::new(SessionStore::open(&self.config.state_dir)?))
    }

    fn namer(&self) -> Arc<dyn Namer> {
        if !self.config.namer_enabled {
            return Arc::new(NoopNamer);
        }
        match HttpNamer::from_env(
            self.config.namer_model.as_deref(),
            self.config.namer_base_url.as_deref(),
            self.config.namer_timeout(),
        ) {
            Ok(namer) => Arc::new(namer),
            Err(e) => {
                warn!("Namer disabled: {}", e);
                Arc::new(NoopNamer)
            }
        }
    }

    fn workspaces(&self) -> Arc<dyn WorkspaceManager> {
        let mut manager = GitWorktreeManager::new(&self.root).with_prefix(self.config.worktree_prefix.clone());
        if let Some(dir) = &self.config.worktree_root {
            manager = manager.with_worktree_root(dir);
        }
        Arc::new(manager)
    }

    /// The named session, or the repository's current one.
    fn session(&self, store: &SessionStore, explicit: Option<&str>) -> anyhow::Result<Session> {
        let session_id = match explicit {
            Some(id) => id.to_string(),
            None => store
                .current(&self.root)?
                .context("no current session; pass --session or run `fork-join start`")?,
        };
        Ok(store.get_session(&session_id)?)
    }

    /// Print `value` as JSON when `--json` is set; returns whether it did.
    fn emit_json<T: serde::Serialize>(&self, value: &T) -> anyhow::Result<bool> {
        if self.json {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        Ok(self.json)
    }
}

async fn handle_command(cli: Cli) -> anyhow::Result<()> {
    let overrides = match &cli.command {
        Commands::Daemon {
            conflict_policy,
            remote,
            no_push,
            max_retries,
        } => CliOptions {
            conflict_policy: *conflict_policy,
            remote: remote.clone(),
            no_push: *no_push,
            max_retries: *max_retries,
            ..Default::default()
        },
        _ => CliOptions::default(),
    };

    if let Commands::Version = cli.command {
        println!("fork-join version {}", VERSION);
        return Ok(());
    }

    let ctx = Context::load(&cli, overrides)?;

    match cli.command {
        Commands::Daemon { .. } => run_daemon(&ctx).await,
        Commands::Start {
            base,
            target,
            prompt,
            agents,
        } => {
            let service = SessionService::new(&ctx.root, ctx.store()?, ctx.workspaces(), ctx.namer());
            let session = service
                .start(StartOptions {
                    base_branch: base,
                    target_branch: target,
                    prompt,
                    agent_ids: agents,
                })
                .await?;
            if !ctx.emit_json(&session)? {
                println!(
                    "{} {} ({} -> {})",
                    "Started session".green().bold(),
                    session.session_id.cyan(),
                    session.base_branch,
                    session.target_branch.cyan()
                );
                print_agents(&session);
            }
            Ok(())
        }
        Commands::Status { session } => {
            let store = ctx.store()?;
            let session = ctx.session(&store, session.as_deref())?;
            let client = ctx.client();
            let queue = if client.ping().await {
                Some(client.status().await?)
            } else {
                None
            };
            if !ctx.emit_json(&serde_json::json!({ "session": session, "queue": queue }))? {
                print_session(&session);
                match queue {
                    Some(queue) => print_queue(&queue),
                    None => println!("\n{}", "Coordinator is not running".dimmed()),
                }
            }
            Ok(())
        }
        Commands::Complete {
            agent,
            session,
            message,
            wait,
            timeout_ms,
        } => {
            let store = ctx.store()?;
            let session = ctx.session(&store, session.as_deref())?;
            let agent_ctx = AgentContext::from_session(&session, &agent)?;
            let client = ctx.client();
            let completion = CompletionClient::new(Arc::new(client.clone()), ctx.namer());
            let report = completion.complete(&agent_ctx, message.as_deref()).await?;

            if !ctx.json {
                print_completion(&agent, &report);
            }
            if !(wait && matches!(report, CompletionReport::Enqueued { .. })) {
                if ctx.json {
                    println!("{}", serde_json::to_string_pretty(&report.to_json())?);
                }
                return Ok(());
            }

            let timeout = timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| ctx.config.wait_timeout());
            let snapshot = wait_for_merge(&client, &agent, &session.session_id, timeout, ctx.json).await?;
            if ctx.json {
                let mut body = report.to_json();
                body["merge"] = serde_json::to_value(&snapshot)?;
                println!("{}", serde_json::to_string_pretty(&body)?);
            } else {
                print_snapshot(&snapshot);
            }
            merge_result(snapshot)
        }
        Commands::Dequeue { agent, session } => {
            let outcome = ctx.client().dequeue(&agent, session.as_deref()).await?;
            if !ctx.emit_json(&serde_json::json!({ "agent_id": agent, "outcome": outcome }))? {
                println!("{} {}: {:?}", "Dequeued".green(), agent.cyan(), outcome);
            }
            Ok(())
        }
        Commands::Retry { agent, session } => {
            let receipt = ctx.client().retry(&agent, session.as_deref()).await?;
            if !ctx.emit_json(&receipt)? {
                println!("{} {}: {}", "Requeued".green(), agent.cyan(), describe_receipt(&receipt));
            }
            Ok(())
        }
        Commands::Conflicts { agent, session } => {
            let files = ctx.client().conflicts(&agent, session.as_deref()).await?;
            if !ctx.emit_json(&serde_json::json!({ "agent_id": agent, "files": files }))? {
                if files.is_empty() {
                    println!("No conflicts recorded for {}", agent.cyan());
                } else {
                    println!("{} {}:", "Conflicts for".yellow().bold(), agent.cyan());
                    for file in files {
                        println!("  {}", file);
                    }
                }
            }
            Ok(())
        }
        Commands::Finalize { session } => {
            let report = ctx.client().session_end(session.as_deref()).await?;
            if !ctx.emit_json(&report)? {
                print_finalize(&report);
            }
            Ok(())
        }
        Commands::Cleanup { session, force } => {
            let service = SessionService::new(&ctx.root, ctx.store()?, ctx.workspaces(), ctx.namer());
            let removed = service.cleanup(&session, force).await?;
            if !ctx.emit_json(&serde_json::json!({ "session_id": session, "workspaces_removed": removed }))? {
                println!(
                    "{} {} ({} workspace(s) removed)",
                    "Cleaned up".green(),
                    session.cyan(),
                    removed
                );
            }
            Ok(())
        }
        Commands::Shutdown => {
            ctx.client().shutdown().await?;
            if !ctx.emit_json(&serde_json::json!({ "status": "OK" }))? {
                println!("{}", "Coordinator shutting down".green());
            }
            Ok(())
        }
        Commands::Config { action } => match action {
            Some(ConfigAction::Show) | None => {
                if !ctx.json {
                    println!("{}", "Resolved configuration".bold());
                }
                println!("{}", serde_json::to_string_pretty(&ctx.config)?);
                Ok(())
            }
        },
        Commands::Version => Ok(()),
    }
}

// ============================================================================
// Daemon
// ============================================================================

async fn run_daemon(ctx: &Context) -> anyhow::Result<()> {
    let config = &ctx.config;
    let store = ctx.store()?;
    let namer = ctx.namer();

    let merger = GitRebaseMerger::new(&ctx.root, &config.state_dir)
        .with_policy(config.conflict_policy)
        .with_remote(config.remote.clone())
        .with_push(config.push_on_merge);
    let sink: Option<Arc<dyn PullRequestSink>> = if config.pull_request_enabled {
        Some(Arc::new(GhCliSink::new(&ctx.root)))
    } else {
        None
    };
    let finalizer = Finalizer::new(
        &ctx.root,
        Arc::clone(&store),
        sink,
        namer,
        FinalizeSettings {
            remote: config.remote.clone(),
            push: config.push_on_merge,
            draft: config.pull_request_draft,
        },
    );
    let settings = CoordinatorSettings {
        max_queue_size: config.max_queue_size,
        max_retries: config.max_retries,
        auto_finalize: config.auto_finalize,
        workspace_root: Some(ctx.root.clone()),
    };

    // A live daemon already owns the queue; refuse before recovery touches it.
    if ctx.client().ping().await {
        return Err(IpcError::AlreadyRunning(config.socket_path.clone()).into());
    }

    let mut coordinator = Coordinator::new(
        store,
        Arc::new(merger),
        ctx.workspaces(),
        Some(Arc::new(finalizer)),
        settings,
    );
    let recovered = coordinator.recover().await.context("recovering merge queue")?;
    let (handle, mut task) = coordinator.spawn();

    let mut server = IpcServer::new(&config.socket_path, handle.clone()).with_wait_timeout(config.wait_timeout());
    if let Err(e) = server.start().await {
        let _ = handle.shutdown().await;
        let _ = task.await;
        return Err(e.into());
    }

    println!(
        "{} on {} ({} job(s) recovered)",
        "Coordinator listening".green().bold(),
        server.socket_path().display(),
        recovered
    );

    let stop_handle = handle.clone();
    server
        .serve(async {
            tokio::select! {
                _ = &mut task => {}
                _ = tokio::signal::ctrl_c() => {
                    println!("{}", "Interrupted, draining in-flight merge".yellow());
                    let _ = stop_handle.shutdown().await;
                }
            }
        })
        .await?;

    // An in-flight merge completes before the process exits.
    if !task.is_finished() {
        task.await.context("coordinator task panicked")?;
    }
    println!("{}", "Coordinator stopped".green());
    Ok(())
}

/// Block on WAIT with a spinner on stderr.
async fn wait_for_merge(
    client: &IpcClient,
    agent: &str,
    session_id: &str,
    timeout: Duration,
    quiet: bool,
) -> anyhow::Result<JobSnapshot> {
    let spinner = if quiet {
        ProgressBar::hidden()
    } else {
        ProgressBar::new_spinner()
    };
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.cyan} {msg} [{elapsed}]")?);
    spinner.set_message(format!("Waiting for {} to merge", agent));
    spinner.enable_steady_tick(Duration::from_millis(100));

    let result = client.wait(agent, Some(session_id), timeout).await;
    spinner.finish_and_clear();
    Ok(result?)
}

/// Map a terminal snapshot to the command result.
fn merge_result(snapshot: JobSnapshot) -> anyhow::Result<()> {
    match snapshot.status {
        JobStatus::MergeFailed => Err(IpcError::Remote {
            code: Some(snapshot.error_kind.unwrap_or(ErrorKind::MergeFailedTerminal)),
            reason: snapshot
                .last_error
                .unwrap_or_else(|| format!("merge of {} failed", snapshot.agent_id)),
        }
        .into()),
        _ => Ok(()),
    }
}

// ============================================================================
// Output
// ============================================================================

fn print_session(session: &Session) {
    println!("{} {}", "Session".bold(), session.session_id.cyan());
    println!("  State:     {}", session.state);
    println!("  Base:      {}", session.base_branch);
    println!("  Target:    {}", session.target_branch.cyan());
    for line in count_lines(session) {
        println!("{}", line);
    }
    if let Some(url) = &session.pr_url {
        println!("  PR:        {}", url.underline());
    }
    print_agents(session);
}

fn count_lines(session: &Session) -> [String; 2] {
    [
        format!("  Merged:    {}", session.merged_count),
        format!("  Conflicts: {}", session.conflict_count),
    ]
}

fn print_agents(session: &Session) {
    println!("\n{}", "Agents".bold());
    for agent in &session.agents {
        let status = agent.status.as_str();
        let status = if agent.status.is_terminal() {
            status.green()
        } else {
            status.yellow()
        };
        println!(
            "  {:<16} {:<14} {}",
            agent.agent_id.cyan(),
            status,
            short_path(&agent.workspace_path).dimmed()
        );
        if !agent.conflict_files.is_empty() {
            println!("    conflicts: {}", agent.conflict_files.join(", ").red());
        }
    }
}

fn print_queue(queue: &QueueStatus) {
    println!("\n{}", "Merge queue".bold());
    println!("  Pending:    {}", queue.pending);
    println!("  Processing: {}", queue.processing);
    if let Some(agent) = &queue.merging {
        println!("  Merging:    {}", agent.cyan());
    }
    if !queue.agents.is_empty() {
        println!("  Order:      {}", queue.agents.join(" -> "));
    }
    if queue.shutting_down {
        println!("  {}", "Shutting down".yellow());
    }
}

fn print_completion(agent: &str, report: &CompletionReport) {
    match report {
        CompletionReport::NoChanges { outcome } => {
            println!("{} {} had no changes ({:?})", "Done:".green(), agent.cyan(), outcome);
        }
        CompletionReport::NeedsCommitMessage {
            changed_paths,
            suggested_message,
        } => {
            println!("{} {} changed {} file(s):", "Pending:".yellow().bold(), agent.cyan(), changed_paths.len());
            for path in changed_paths {
                println!("  {}", path);
            }
            println!("\nRe-run with --message, for example:");
            println!("  fork-join complete --agent {} --message {:?}", agent, suggested_message);
        }
        CompletionReport::Enqueued { commit_sha, receipt } => {
            println!(
                "{} {} at {}: {}",
                "Submitted".green().bold(),
                agent.cyan(),
                short_sha(commit_sha),
                describe_receipt(receipt)
            );
        }
    }
}

fn print_snapshot(snapshot: &JobSnapshot) {
    match snapshot.status {
        JobStatus::Merged => println!(
            "{} {} as {}",
            "Merged".green().bold(),
            snapshot.agent_id.cyan(),
            snapshot.commit_sha.as_deref().map(short_sha).unwrap_or("-")
        ),
        JobStatus::MergeFailed => {
            println!(
                "{} {} after {} attempt(s): {}",
                "Merge failed".red().bold(),
                snapshot.agent_id.cyan(),
                snapshot.attempt_count,
                snapshot.last_error.as_deref().unwrap_or("unknown error")
            );
            for file in &snapshot.conflict_files {
                println!("  {}", file.red());
            }
        }
        status => println!("{} is {}", snapshot.agent_id.cyan(), status),
    }
}

fn print_finalize(report: &FinalizeReport) {
    println!("{} {} ({})", "Finalized".green().bold(), report.session_id.cyan(), report.state);
    println!("  Merged:    {}", list_or_dash(&report.merged));
    println!("  Failed:    {}", list_or_dash(&report.failed));
    println!("  Cancelled: {}", list_or_dash(&report.cancelled));
    println!("  Pushed:    {}", if report.pushed { "yes" } else { "no" });
    if let Some(pr) = &report.pull_request {
        println!("  PR #{}:    {}", pr.number, pr.url.underline());
    }
}

fn describe_receipt(receipt: &EnqueueReceipt) -> String {
    match receipt {
        EnqueueReceipt::Queued { position } => format!("queued at position {}", position),
        EnqueueReceipt::Merging => "merging now".to_string(),
        EnqueueReceipt::Merged { commit_sha } => format!(
            "already merged{}",
            commit_sha.as_deref().map(|s| format!(" as {}", short_sha(s))).unwrap_or_default()
        ),
    }
}

fn list_or_dash(items: &[String]) -> String {
    if items.is_empty() {
        "-".to_string()
    } else {
        items.join(", ")
    }
}

fn short_sha(sha: &str) -> &str {
    sha.get(..8).unwrap_or(sha)
}

fn short_path(path: &Path) -> String {
    match dirs::home_dir().and_then(|home| path.strip_prefix(home).ok().map(Path::to_path_buf)) {
        Some(rel) => format!("~/{}", rel.display()),
        None => path.display().to_string(),
    }
}
