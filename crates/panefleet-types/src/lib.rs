//! Shared domain types for Panefleet.
//!
//! Workflow declarations, run-time execution state, structural errors and
//! engine configuration. Only serde, chrono and thiserror; no I/O.

pub mod config;
pub mod duration;
pub mod error;
pub mod execution;
pub mod workflow;
