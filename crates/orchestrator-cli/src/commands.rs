//! Command implementations.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use orchestrator_models::{Address, CheckInId, GapId, Message, MessageId, WorkerId, WorkerState};
use orchestrator_persistence::StateStore;
use orchestrator_runtime::{
    Delivery, Orchestrator, OrchestratorError, Receipt, Runtime, RuntimeConfig, RuntimeEvent, SpawnOptions,
};
use orchestrator_tmux::{MemoryBackend, SessionBackend, TmuxBackend};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cli::{
    AgentCommand, CheckinCommand, Cli, Commands, GapCommand, MessageCommand, OutputFormat, SessionCommand,
};

/// Sender name used for messages typed at the command line.
const CLI_SENDER: &str = "cli";

/// Errors surfaced to the user.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error("output error: {0}")]
    Output(#[from] serde_json::Error),
}

impl CliError {
    /// Process exit code: 2 for unknown targets, 3 for protocol violations.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Orchestrator(e) => e.exit_code(),
            CliError::Output(_) => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, CliError>;

/// Executes a parsed command line.
pub async fn execute(cli: Cli) -> Result<()> {
    let root = cli.root_dir();
    let orch = open(&root, cli.dry_run)?;

    match cli.command {
        Commands::Status => cmd_status(&orch).await,
        Commands::Session { action } => cmd_session(&orch, action).await,
        Commands::Agent { action } => cmd_agent(&orch, action).await,
        Commands::Message { action } => cmd_message(&orch, action).await,
        Commands::Schedule {
            worker_id,
            delay,
            note,
            recurring,
            interval,
        } => cmd_schedule(&orch, &worker_id, delay, &note, recurring, interval).await,
        Commands::Checkins { action } => cmd_checkins(&orch, action).await,
        Commands::Gaps { action } => cmd_gaps(&orch, action).await,
        Commands::Run { once } => cmd_run(orch, once).await,
    }
}

/// Opens the orchestrator over `root` with tmux, or with an in-memory
/// backend mirroring the persisted table when `dry_run` is set.
pub fn open(root: &Path, dry_run: bool) -> Result<Orchestrator> {
    let config = RuntimeConfig::load(root)?;
    let backend: Arc<dyn SessionBackend> = if dry_run {
        Arc::new(mirror_backend(root)?)
    } else {
        Arc::new(TmuxBackend::new().map_err(OrchestratorError::from)?)
    };
    debug!(root = %root.display(), dry_run, "opening orchestrator");
    Ok(Orchestrator::open(root, config, backend)?)
}

/// Builds a memory backend holding the live sessions of the persisted table.
fn mirror_backend(root: &Path) -> Result<MemoryBackend> {
    let table = StateStore::new(root)
        .load_worker_table()
        .map_err(OrchestratorError::from)?;
    let backend = MemoryBackend::new();
    for session in table.sessions.iter().filter(|s| s.is_alive()) {
        let windows: Vec<(u32, String)> = session
            .windows
            .iter()
            .map(|w| (w.index, w.title.clone()))
            .collect();
        backend.seed_session(&session.id, &windows);
    }
    Ok(backend)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn cmd_status(orch: &Orchestrator) -> Result<()> {
    let sessions = orch.supervisor().sessions()?;
    let workers = orch.supervisor().workers()?;
    let open_gaps = orch.health().gaps(true).await;
    let pending = orch.scheduler().pending().await?;

    println!("Root: {}", orch.root().display());
    println!(
        "Sessions: {} ({} alive)",
        sessions.len(),
        sessions.iter().filter(|s| s.is_alive()).count()
    );
    println!("Workers: {}", workers.len());
    for state in [
        WorkerState::Starting,
        WorkerState::Running,
        WorkerState::Unresponsive,
        WorkerState::Stopped,
    ] {
        let count = workers.iter().filter(|w| w.state == state).count();
        if count > 0 {
            println!("  {:<14} {}", state.as_str(), count);
        }
    }
    println!("Open gaps: {}", open_gaps.len());
    for gap in &open_gaps {
        let flag = if gap.escalated { " (escalated)" } else { "" };
        println!("  {} silent {}s{}", gap.worker_id, gap.duration_seconds, flag);
    }
    println!("Pending check-ins: {}", pending.len());
    if let Some(next) = pending.first() {
        println!("  next: {} at {}", next.target_worker_id, next.fire_at.format("%Y-%m-%d %H:%M:%S"));
    }
    Ok(())
}

async fn cmd_session(orch: &Orchestrator, action: SessionCommand) -> Result<()> {
    match action {
        SessionCommand::List { format } => {
            let sessions = orch.supervisor().sessions()?;
            match format {
                OutputFormat::Json => print_json(&sessions)?,
                OutputFormat::Table => {
                    if sessions.is_empty() {
                        println!("No sessions.");
                        return Ok(());
                    }
                    println!("{:<24} {:<12} {:<8} CREATED", "NAME", "STATUS", "WINDOWS");
                    println!("{}", "-".repeat(68));
                    for s in sessions {
                        println!(
                            "{:<24} {:<12} {:<8} {}",
                            truncate(&s.id, 24),
                            s.status.to_string(),
                            s.windows.len(),
                            s.created_at.format("%Y-%m-%d %H:%M")
                        );
                    }
                }
            }
        }
        SessionCommand::Create { name } => {
            let session = orch.supervisor().create_session(&name).await?;
            println!("Session '{}' ready ({} windows)", session.id, session.windows.len());
        }
        SessionCommand::Kill { name } => {
            let stopped = orch.supervisor().kill_session(&name).await?;
            println!("Killed session '{}'", name);
            for id in stopped {
                orch.router().forget(&id)?;
                println!("  stopped {}", id);
            }
        }
    }
    Ok(())
}

async fn cmd_agent(orch: &Orchestrator, action: AgentCommand) -> Result<()> {
    let supervisor = orch.supervisor();
    match action {
        AgentCommand::Spawn {
            role,
            session,
            manager,
            command,
        } => {
            let options = SpawnOptions {
                manager: manager.map(WorkerId::from_string),
                launch_command: command,
            };
            let worker = supervisor.spawn(role, &session, options).await?;
            println!("Spawned {} ({}) at {}", worker.id, worker.role, worker.target());
        }
        AgentCommand::List { format } => {
            let workers = supervisor.workers()?;
            match format {
                OutputFormat::Json => print_json(&workers)?,
                OutputFormat::Table => {
                    if workers.is_empty() {
                        println!("No workers.");
                        return Ok(());
                    }
                    let now = Utc::now();
                    println!(
                        "{:<36} {:<12} {:<20} {:<13} {:>8} {:>9}",
                        "ID", "ROLE", "TARGET", "STATE", "RESTARTS", "SILENT"
                    );
                    println!("{}", "-".repeat(103));
                    for w in workers {
                        println!(
                            "{:<36} {:<12} {:<20} {:<13} {:>8} {:>8}s",
                            truncate(w.id.as_str(), 36),
                            w.role.as_str(),
                            truncate(&w.target(), 20),
                            w.state.as_str(),
                            w.restart_count,
                            w.silence_secs(now)
                        );
                    }
                }
            }
        }
        AgentCommand::Restart { worker_id } => {
            let worker = supervisor.restart(&WorkerId::from_string(worker_id)).await?;
            println!("Restarted {} (restart #{})", worker.id, worker.restart_count);
        }
        AgentCommand::Terminate { worker_id } => {
            let worker = supervisor.terminate(&WorkerId::from_string(worker_id)).await?;
            println!("Terminated {}", worker.id);
        }
        AgentCommand::Archive { worker_id } => {
            let worker = supervisor.archive(&WorkerId::from_string(worker_id)).await?;
            orch.router().forget(&worker.id)?;
            println!("Archived {}", worker.id);
        }
        AgentCommand::Reconcile => {
            let report = supervisor.reconcile().await?;
            if report.stopped_workers.is_empty() && report.terminated_sessions.is_empty() {
                println!("Worker table matches the backend.");
            }
            for id in report.stopped_workers {
                println!("stopped {} (window gone)", id);
            }
            for name in report.terminated_sessions {
                println!("session '{}' gone", name);
            }
        }
    }
    Ok(())
}

async fn cmd_message(orch: &Orchestrator, action: MessageCommand) -> Result<()> {
    match action {
        MessageCommand::Send {
            worker_id,
            text,
            kind,
            priority,
            from,
            reply_to,
        } => {
            let sender = match from {
                Some(id) => Address::Worker(WorkerId::from_string(id)),
                None => Address::external(CLI_SENDER),
            };
            let mut message = Message::new(sender, WorkerId::from_string(worker_id), kind, text);
            if let Some(priority) = priority {
                message = message.with_priority(priority);
            }
            if let Some(reply_to) = reply_to {
                message = message.in_reply_to(MessageId::from_string(reply_to));
            }
            let receipt = orch.router().send(message).await?;
            print_receipt(&receipt);
        }
        MessageCommand::Broadcast { text, role } => {
            let receipts = orch
                .router()
                .broadcast(Address::external(CLI_SENDER), &text, role)
                .await?;
            if receipts.is_empty() {
                println!("No live workers to broadcast to.");
            }
            for receipt in &receipts {
                print_receipt(receipt);
            }
        }
        MessageCommand::History {
            worker_id,
            limit,
            format,
        } => {
            let history = orch
                .conversations()
                .history(&WorkerId::from_string(worker_id), limit)
                .await
                .map_err(OrchestratorError::from)?;
            match format {
                OutputFormat::Json => print_json(&history)?,
                OutputFormat::Table => {
                    if history.is_empty() {
                        println!("No messages.");
                    }
                    for m in history {
                        println!(
                            "[{}] {} {} from {} ({})",
                            m.timestamp.format("%Y-%m-%d %H:%M:%S"),
                            m.priority.as_str().to_uppercase(),
                            m.kind,
                            m.from,
                            m.id
                        );
                        println!("  {}", truncate(&m.body.replace('\n', " "), 100));
                    }
                }
            }
        }
        MessageCommand::Summarize { worker_id } => {
            let worker_id = WorkerId::from_string(worker_id);
            match orch
                .conversations()
                .compact(&worker_id)
                .await
                .map_err(OrchestratorError::from)?
            {
                Some(compaction) => println!(
                    "Compacted {} messages of {} into {}",
                    compaction.replaced, worker_id, compaction.summary_id
                ),
                None => println!("Nothing to compact for {}.", worker_id),
            }
        }
        MessageCommand::Stats { days, format } => {
            let stats = orch.router().stats(days, Utc::now())?;
            match format {
                OutputFormat::Json => print_json(&stats)?,
                OutputFormat::Table => {
                    match stats.since {
                        Some(since) => println!("Since {}", since.format("%Y-%m-%d %H:%M")),
                        None => println!("All time"),
                    }
                    println!("Messages: {} ({} delivered)", stats.total, stats.delivered);
                    println!("By kind:");
                    for (kind, count) in &stats.by_kind {
                        println!("  {:<16} {}", kind.as_str(), count);
                    }
                    println!("By priority:");
                    for (priority, count) in &stats.by_priority {
                        println!("  {:<16} {}", priority.as_str(), count);
                    }
                    if let Some((sender, count)) = &stats.most_active {
                        println!("Most active sender: {} ({})", sender, count);
                    }
                }
            }
        }
    }
    Ok(())
}

fn print_receipt(receipt: &Receipt) {
    match &receipt.delivery {
        Delivery::Delivered => println!("Delivered {} to {}", receipt.message_id, receipt.recipient),
        Delivery::Deferred(reason) => println!(
            "Recorded {} for {}; delivery deferred: {}",
            receipt.message_id, receipt.recipient, reason
        ),
    }
}

async fn cmd_schedule(
    orch: &Orchestrator,
    worker_id: &str,
    delay: u64,
    note: &str,
    recurring: bool,
    interval: Option<u64>,
) -> Result<()> {
    let check_in = orch
        .scheduler()
        .schedule(&WorkerId::from(worker_id), delay, note, recurring, interval, Utc::now())
        .await?;
    println!(
        "Scheduled {} for {} at {}{}",
        check_in.id,
        check_in.target_worker_id,
        check_in.fire_at.format("%Y-%m-%d %H:%M:%S UTC"),
        if check_in.recurring { " (recurring)" } else { "" }
    );
    Ok(())
}

async fn cmd_checkins(orch: &Orchestrator, action: CheckinCommand) -> Result<()> {
    match action {
        CheckinCommand::List { format } => {
            let pending = orch.scheduler().pending().await?;
            match format {
                OutputFormat::Json => print_json(&pending)?,
                OutputFormat::Table => {
                    if pending.is_empty() {
                        println!("No pending check-ins.");
                        return Ok(());
                    }
                    println!("{:<36} {:<36} {:<20} NOTE", "ID", "WORKER", "FIRES AT");
                    println!("{}", "-".repeat(110));
                    for c in pending {
                        let note = if c.recurring {
                            format!("{} (every {}s)", c.note, c.interval_seconds.unwrap_or_default())
                        } else {
                            c.note.clone()
                        };
                        println!(
                            "{:<36} {:<36} {:<20} {}",
                            truncate(c.id.as_str(), 36),
                            truncate(c.target_worker_id.as_str(), 36),
                            c.fire_at.format("%Y-%m-%d %H:%M:%S"),
                            truncate(&note, 40)
                        );
                    }
                }
            }
        }
        CheckinCommand::Cancel { id } => {
            if orch.scheduler().cancel(&CheckInId::from_string(id.clone())).await? {
                println!("Cancelled {}", id);
            } else {
                println!("No pending check-in {}", id);
            }
        }
    }
    Ok(())
}

async fn cmd_gaps(orch: &Orchestrator, action: GapCommand) -> Result<()> {
    match action {
        GapCommand::List { open, format } => print_gaps(orch, open, format).await,
        GapCommand::Ack { id } => {
            let gap = orch.health().acknowledge(&GapId::from_string(id), Utc::now()).await?;
            println!("Acknowledged {} ({})", gap.id, gap.worker_id);
            Ok(())
        }
        GapCommand::Stats { format } => {
            let stats = orch.health().recovery_stats().await?;
            match format {
                OutputFormat::Json => print_json(&stats)?,
                OutputFormat::Table => {
                    println!("Gaps:              {}", stats.total_gaps);
                    println!("  open:            {}", stats.open);
                    println!("  resolved:        {}", stats.resolved);
                    println!("  escalated:       {}", stats.escalated);
                    println!("  acknowledged:    {}", stats.acknowledged);
                    println!("Recovery attempts: {}", stats.recovery_attempts);
                    if let Some(rate) = stats.recovery_rate {
                        println!("Recovery rate:     {:.0}%", rate * 100.0);
                    }
                    if let Some(secs) = stats.mean_seconds_to_resolve {
                        println!("Mean time to resolve: {}s", secs);
                    }
                    if !stats.by_worker.is_empty() {
                        println!("\nBy worker:");
                        for (worker_id, count) in &stats.by_worker {
                            println!("  {:<36} {:>5}", truncate(worker_id.as_str(), 36), count);
                        }
                    }
                }
            }
            Ok(())
        }
    }
}

async fn print_gaps(orch: &Orchestrator, open_only: bool, format: OutputFormat) -> Result<()> {
    let gaps = orch.health().gaps(open_only).await;
    match format {
        OutputFormat::Json => print_json(&gaps)?,
        OutputFormat::Table => {
            if gaps.is_empty() {
                println!("No gaps.");
                return Ok(());
            }
            println!(
                "{:<14} {:<36} {:<20} {:>8} {:>8} {:<12}",
                "ID", "WORKER", "DETECTED", "SILENT", "ATTEMPTS", "STATUS"
            );
            println!("{}", "-".repeat(103));
            for g in gaps {
                let status = if g.resolved {
                    "resolved"
                } else if g.is_acknowledged() {
                    "acknowledged"
                } else if g.escalated {
                    "escalated"
                } else {
                    "open"
                };
                println!(
                    "{:<14} {:<36} {:<20} {:>7}s {:>8} {:<12}",
                    g.id.as_str(),
                    truncate(g.worker_id.as_str(), 36),
                    g.detected_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                    g.duration_seconds,
                    g.recovery_attempts,
                    status
                );
            }
        }
    }
    Ok(())
}

async fn cmd_run(orch: Orchestrator, once: bool) -> Result<()> {
    let orch = Arc::new(orch);
    let reconciled = orch.supervisor().reconcile().await?;
    for id in &reconciled.stopped_workers {
        warn!(worker_id = %id, "window gone; worker stopped");
    }

    if once {
        let now = Utc::now();
        let polled = orch.poller().poll_once(now).await?;
        let sweep = orch.health().sweep(now).await?;
        let tick = orch.scheduler().tick(now).await?;
        orch.supervisor().checkpoint()?;
        println!(
            "Polled {} active, {} unresponsive, {} gaps detected, {} resolved, {} escalated, {} check-ins fired",
            polled.len(),
            sweep.unresponsive.len(),
            sweep.detected.len(),
            sweep.resolved.len(),
            sweep.escalated.len(),
            tick.fired.len()
        );
        return Ok(());
    }

    let mut events = orch.subscribe();
    let logger = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            log_event(&event);
        }
    });

    let mut runtime = Runtime::new(orch.clone());
    runtime.start().await?;
    println!("Running. Press Ctrl-C to stop.");

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
    }
    runtime.shutdown().await?;
    logger.abort();
    Ok(())
}

fn log_event(event: &RuntimeEvent) {
    match event {
        RuntimeEvent::GapDetected {
            worker_id,
            duration_seconds,
            ..
        } => warn!(worker_id = %worker_id, duration_seconds, "gap detected"),
        RuntimeEvent::GapResolved { worker_id, .. } => info!(worker_id = %worker_id, "gap resolved"),
        RuntimeEvent::Escalated { worker_id, reason, .. } => {
            warn!(worker_id = %worker_id, reason = %reason, "escalated")
        }
        RuntimeEvent::WorkerRestarted {
            worker_id,
            restart_count,
        } => info!(worker_id = %worker_id, restart_count, "worker restarted"),
        RuntimeEvent::MessageRejected { message_id, reason } => {
            warn!(message_id = %message_id, reason = %reason, "message rejected")
        }
        RuntimeEvent::CheckInFired { worker_id, .. } => info!(worker_id = %worker_id, "check-in fired"),
        other => debug!(event = ?other, "runtime event"),
    }
}

/// Truncates a string to max chars, appending "..." when cut.
fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
