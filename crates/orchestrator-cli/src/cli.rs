//! CLI argument parsing with clap.

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use orchestrator_models::{MessageKind, Priority, Role};

/// Supervise workers in tmux windows and route messages between them.
#[derive(Parser, Debug)]
#[command(name = "orchestrator")]
#[command(author, version = version_string(), about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// State directory (defaults to the current directory)
    #[arg(long, global = true, env = "ORCHESTRATOR_ROOT")]
    pub root: Option<PathBuf>,

    /// Use an in-memory backend instead of tmux
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

/// Returns the version string with git hash and build date.
pub fn version_string() -> &'static str {
    concat!(
        env!("CARGO_PKG_VERSION"),
        " (",
        env!("GIT_HASH"),
        " ",
        env!("BUILD_DATE"),
        ")"
    )
}

impl Cli {
    /// Returns the log level based on verbosity.
    pub fn log_level(&self) -> tracing::Level {
        match self.verbose {
            0 => tracing::Level::WARN,
            1 => tracing::Level::INFO,
            2 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    }

    /// Resolves the state directory.
    pub fn root_dir(&self) -> PathBuf {
        self.root
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show sessions, workers, open gaps and pending check-ins
    Status,

    /// Manage sessions
    Session {
        #[command(subcommand)]
        action: SessionCommand,
    },

    /// Manage workers
    Agent {
        #[command(subcommand)]
        action: AgentCommand,
    },

    /// Send and inspect messages
    Message {
        #[command(subcommand)]
        action: MessageCommand,
    },

    /// Schedule a check-in for a worker
    Schedule {
        /// Target worker ID
        worker_id: String,

        /// Delay in seconds
        delay: u64,

        /// Note sent when the check-in fires
        note: String,

        /// Fire repeatedly
        #[arg(long)]
        recurring: bool,

        /// Repeat interval in seconds (defaults to the delay)
        #[arg(long, requires = "recurring")]
        interval: Option<u64>,
    },

    /// Manage pending check-ins
    Checkins {
        #[command(subcommand)]
        action: CheckinCommand,
    },

    /// Inspect and acknowledge gap events
    Gaps {
        #[command(subcommand)]
        action: GapCommand,
    },

    /// Run health sweeps, check-ins and output polling
    Run {
        /// Run one pass of each task and exit
        #[arg(long)]
        once: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum SessionCommand {
    /// List sessions
    List {
        #[arg(long, short, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Create a session (no-op if it is already managed)
    Create {
        /// Session name
        name: String,
    },

    /// Kill a session and stop its workers
    Kill {
        /// Session name
        name: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum AgentCommand {
    /// Spawn a worker
    Spawn {
        /// Role (orchestrator, manager, executor, monitor)
        #[arg(long, short)]
        role: Role,

        /// Session to host the worker
        #[arg(long, short)]
        session: String,

        /// Manager the worker reports to
        #[arg(long)]
        manager: Option<String>,

        /// Launch command (overrides the configured one for the role)
        #[arg(long)]
        command: Option<String>,
    },

    /// List workers
    List {
        #[arg(long, short, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Restart a worker in place
    Restart {
        /// Worker ID
        worker_id: String,
    },

    /// Stop a worker and free its window
    Terminate {
        /// Worker ID
        worker_id: String,
    },

    /// Stop a worker and drop it from the table
    Archive {
        /// Worker ID
        worker_id: String,
    },

    /// Stop workers whose windows have disappeared
    Reconcile,
}

#[derive(Subcommand, Debug)]
pub enum MessageCommand {
    /// Send a message to a worker
    Send {
        /// Recipient worker ID
        worker_id: String,

        /// Message body
        text: String,

        /// Message kind
        #[arg(long, short, default_value = "coordination")]
        kind: MessageKind,

        /// Priority (defaults to the kind's priority)
        #[arg(long, short)]
        priority: Option<Priority>,

        /// Sending worker ID (defaults to an external sender)
        #[arg(long)]
        from: Option<String>,

        /// Message this one replies to
        #[arg(long)]
        reply_to: Option<String>,
    },

    /// Send a message to every live worker
    Broadcast {
        /// Message body
        text: String,

        /// Only workers with this role
        #[arg(long, short)]
        role: Option<Role>,
    },

    /// Show a worker's conversation
    History {
        /// Worker ID
        worker_id: String,

        /// Show only the last N messages
        #[arg(long, short = 'n')]
        limit: Option<usize>,

        #[arg(long, short, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Compact a worker's conversation now
    Summarize {
        /// Worker ID
        worker_id: String,
    },

    /// Show communication statistics
    Stats {
        /// Look back this many days (0 for all)
        #[arg(long, short, default_value_t = 7)]
        days: u32,

        #[arg(long, short, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
}

#[derive(Subcommand, Debug)]
pub enum CheckinCommand {
    /// List pending check-ins
    List {
        #[arg(long, short, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Cancel a pending check-in
    Cancel {
        /// Check-in ID
        id: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum GapCommand {
    /// List gap events
    List {
        /// Only unresolved gaps
        #[arg(long)]
        open: bool,

        #[arg(long, short, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },

    /// Acknowledge a gap; it gets no further automatic recovery
    Ack {
        /// Gap ID
        id: String,
    },

    /// Show recovery statistics over all gaps
    Stats {
        #[arg(long, short, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}
