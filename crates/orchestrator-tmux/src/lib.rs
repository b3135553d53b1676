//! Terminal multiplexer backends for the orchestrator.
//!
//! [`SessionBackend`] is the only seam through which the rest of the system
//! touches terminal sessions. [`TmuxBackend`] drives a real tmux server;
//! [`MemoryBackend`] keeps everything in process for tests and dry runs.
//!
//! # Example
//!
//! ```no_run
//! use orchestrator_tmux::{SessionBackend, TmuxBackend};
//!
//! let tmux = TmuxBackend::new()?;
//! let session = tmux.create_session("project")?;
//! let window = tmux.create_window(&session.name, "executor-1a2b3c4d")?;
//! tmux.send_input(&session.name, window.index, "cargo test")?;
//! let output = tmux.capture_pane(&session.name, window.index, 50)?;
//! println!("{}", output);
//! # Ok::<(), orchestrator_tmux::BackendError>(())
//! ```

pub mod backend;
pub mod error;
pub mod memory;
pub mod parse;
pub mod tmux;

pub use backend::{target, validate_name, BackendSession, BackendWindow, SessionBackend};
pub use error::{BackendError, Result};
pub use memory::MemoryBackend;
pub use tmux::TmuxBackend;
