//! Per-input build messages with severity levels.
//!
//! This crate provides the [`Message`] records the engine persists alongside
//! each input file, the two-level [`Severity`] scale that decides whether a
//! build fails, and the default rendering used when messages are routed to a
//! log.

#![warn(missing_docs)]

pub mod message;
pub mod severity;

pub use message::{format_message, Message};
pub use severity::Severity;
