//! Workflow engine core: parsing, scheduling and execution.
//!
//! - `value` -- path navigation over JSON values and text rendering
//! - `substitution` -- `${...}` template resolution against run state
//! - `condition` -- `when` expression evaluator
//! - `output` -- raw worker output to structured data
//! - `dag` -- dependency graph, cycle detection, leveled plans
//! - `retry` -- retry attempts and backoff delays
//! - `driver` -- worker driver port and output diffing
//! - `progress` -- broadcast progress events
//! - `executor` -- wave-based step executor
//! - `registry` -- process-wide table of running pipelines
//! - `definition` -- YAML/TOML loading, validation, run variables

pub mod condition;
pub mod dag;
pub mod definition;
pub mod driver;
pub mod executor;
pub mod output;
pub mod progress;
pub mod registry;
pub mod retry;
pub mod substitution;
pub mod value;
