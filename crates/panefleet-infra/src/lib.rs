//! Infrastructure layer for Panefleet.
//!
//! Implements the ports defined in `panefleet-core` against the local
//! machine: the `config.toml` loader, workflow file discovery, and a worker
//! driver backed by local processes.

pub mod config;
pub mod process;
pub mod workflow;
