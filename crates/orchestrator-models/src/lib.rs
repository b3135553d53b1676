//! Core data models for the session orchestrator.
//!
//! This crate provides the fundamental data types shared by every other
//! orchestrator crate: sessions and windows, supervised workers, structured
//! messages, gap events and scheduled check-ins.

pub mod checkin;
pub mod gap;
pub mod ids;
pub mod message;
pub mod session;
pub mod worker;

// Re-export main types
pub use checkin::ScheduledCheckIn;
pub use gap::GapEvent;
pub use ids::{CheckInId, GapId, MessageId, WorkerId};
pub use message::{Address, Message, MessageKind, ParseEnumError, Priority};
pub use session::{Session, SessionStatus, Window};
pub use worker::{Role, Worker, WorkerState};
