//! Async runtime for the session orchestrator.
//!
//! This crate provides the components that supervise workers running in
//! terminal-multiplexer windows:
//! - `ProcessSupervisor` - owns the worker table; spawns, restarts and
//!   terminates workers
//! - `MessageRouter` - validates, records and delivers messages along the
//!   hub-and-spoke routes
//! - `HealthMonitor` - turns silence into unresponsive states and gaps, and
//!   drives a pluggable `RecoveryStrategy`
//! - `Scheduler` - fires scheduled check-ins
//! - `OutputPoller` - treats changed pane output as activity
//! - `Runtime` - runs the above as independent background tasks
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use orchestrator_models::{Address, Message, Role};
//! use orchestrator_runtime::{Orchestrator, Runtime, RuntimeConfig, SpawnOptions};
//! use orchestrator_tmux::TmuxBackend;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let root = std::env::current_dir()?;
//!     let config = RuntimeConfig::load(&root)?;
//!     let orch = Arc::new(Orchestrator::open(&root, config, Arc::new(TmuxBackend::new()?))?);
//!
//!     let worker = orch
//!         .supervisor()
//!         .spawn(Role::Executor, "proj", SpawnOptions::default())
//!         .await?;
//!     orch.router()
//!         .send(Message::task(Address::external("cli"), worker.id.clone(), "implement X"))
//!         .await?;
//!
//!     let mut runtime = Runtime::new(orch.clone());
//!     runtime.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```
//!
//! # Key Concepts
//!
//! ## Worker lifecycle
//!
//! `Starting -> Running <-> Unresponsive`, and `Stopped` after terminate or
//! a failed start. `restart_count` only ever grows.
//!
//! ## Delivery
//!
//! Messages are recorded before delivery. A message that cannot be typed into
//! its recipient's window stays in the conversation and is re-delivered when
//! the worker recovers.

pub mod backend;
pub mod config;
pub mod error;
pub mod event;
pub mod health;
pub mod orchestrator;
pub mod poller;
pub mod router;
pub mod runtime;
pub mod scheduler;
pub mod supervisor;

pub use backend::TimedBackend;
pub use config::RuntimeConfig;
pub use error::{OrchestratorError, Result, ViolationReason};
pub use event::RuntimeEvent;
pub use health::{DefaultRecovery, HealthMonitor, RecoveryOutcome, RecoveryStats, RecoveryStrategy, SweepReport};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use poller::OutputPoller;
pub use router::{
    format_delivery, route_allowed, CommunicationStats, Delivery, DeliveryObserver, MessageRouter, Receipt,
};
pub use runtime::Runtime;
pub use scheduler::{FiredCheckIn, Scheduler, TickReport};
pub use supervisor::{ProcessSupervisor, ReconcileReport, SpawnOptions};
