//! Workflow engine for Panefleet.
//!
//! This crate holds the engine and its ports (the `WorkerDriver` trait). It
//! depends only on `panefleet-types`, never on `panefleet-infra` or any
//! process/terminal crate.

pub mod workflow;
