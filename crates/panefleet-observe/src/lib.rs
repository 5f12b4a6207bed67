//! Observability setup for Panefleet binaries.

pub mod tracing_setup;
