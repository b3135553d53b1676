//! Orchestrator CLI library.
//!
//! Argument parsing and the command implementations behind the
//! `orchestrator` binary.

pub mod cli;
pub mod commands;
