//! Process-wide registry of pipeline runs for status queries.
//!
//! `PipelineRegistry` is an explicit object owned by the process entry point
//! and shared by `Arc`. Entries are summaries derived from `ExecutionState`,
//! so readers never touch a run's live state. All access goes through a
//! `DashMap` and never waits on step dispatch.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use panefleet_types::execution::{ExecutionState, ExecutionStatus};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Summary types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineExecution {
    pub run_id: String,
    pub workflow_id: String,
    pub session: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    pub progress: PipelineProgress,
    pub steps: BTreeMap<String, PipelineStep>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineExecution {
    /// A freshly started run expecting `total` steps.
    pub fn new(
        run_id: impl Into<String>,
        workflow_id: impl Into<String>,
        session: impl Into<String>,
        total: usize,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            workflow_id: workflow_id.into(),
            session: session.into(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            current_step: None,
            progress: PipelineProgress {
                pending: total,
                total,
                ..Default::default()
            },
            steps: BTreeMap::new(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineProgress {
    pub completed: usize,
    pub running: usize,
    pub pending: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total: usize,
    pub percent: f64,
}

impl PipelineProgress {
    fn recompute_percent(&mut self) {
        self.percent = if self.total > 0 {
            (self.completed + self.failed + self.skipped) as f64 / self.total as f64 * 100.0
        } else {
            0.0
        };
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineStep {
    pub id: String,
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pane_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    pub output_lines: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-status counts over the state's step and group results.
pub fn calculate_progress(state: &ExecutionState) -> PipelineProgress {
    let mut progress = PipelineProgress::default();
    for result in state.all_results() {
        match result.status {
            ExecutionStatus::Completed => progress.completed += 1,
            ExecutionStatus::Running => progress.running += 1,
            ExecutionStatus::Failed => progress.failed += 1,
            ExecutionStatus::Skipped => progress.skipped += 1,
            ExecutionStatus::Pending => progress.pending += 1,
            ExecutionStatus::Paused | ExecutionStatus::Cancelled => {}
        }
        progress.total += 1;
    }
    progress.recompute_percent();
    progress
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn convert_steps(state: &ExecutionState) -> BTreeMap<String, PipelineStep> {
    state
        .steps
        .iter()
        .map(|(id, result)| {
            let duration_ms = match (result.started_at, result.finished_at) {
                (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
                _ => None,
            };
            let step = PipelineStep {
                id: id.clone(),
                status: result.status,
                agent: result.agent_type.clone(),
                pane_used: result.pane_used.clone(),
                started_at: result.started_at.map(rfc3339),
                finished_at: result.finished_at.map(rfc3339),
                duration_ms,
                output_lines: count_lines(&result.output),
                error: result.error.as_ref().map(|e| e.message.clone()),
            };
            (id.clone(), step)
        })
        .collect()
}

/// Newline-separated line count; empty text has zero lines.
pub fn count_lines(s: &str) -> usize {
    if s.is_empty() {
        0
    } else {
        1 + s.bytes().filter(|b| *b == b'\n').count()
    }
}

// ---------------------------------------------------------------------------
// PipelineRegistry
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("pipeline run not found: {0}")]
    NotFound(String),

    #[error("pipeline run {run_id} already finished with status {status}")]
    AlreadyFinished { run_id: String, status: ExecutionStatus },
}

struct Entry {
    execution: PipelineExecution,
    cancel: Option<CancellationToken>,
}

#[derive(Default)]
pub struct PipelineRegistry {
    runs: DashMap<String, Entry>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a run. `cancel` lets [`PipelineRegistry::cancel`] stop it.
    pub fn register(&self, execution: PipelineExecution, cancel: Option<CancellationToken>) {
        tracing::debug!(run_id = %execution.run_id, "registered pipeline run");
        self.runs
            .insert(execution.run_id.clone(), Entry { execution, cancel });
    }

    pub fn get(&self, run_id: &str) -> Option<PipelineExecution> {
        self.runs.get(run_id).map(|e| e.execution.clone())
    }

    /// All runs, oldest first.
    pub fn list(&self) -> Vec<PipelineExecution> {
        let mut runs: Vec<PipelineExecution> =
            self.runs.iter().map(|e| e.execution.clone()).collect();
        runs.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.run_id.cmp(&b.run_id)));
        runs
    }

    /// Refresh a run's summary. A larger total recorded at registration is
    /// kept, since results only appear once steps start.
    pub fn update_from_state(&self, state: &ExecutionState) {
        let Some(mut entry) = self.runs.get_mut(&state.run_id) else {
            return;
        };
        let exec = &mut entry.execution;

        exec.status = state.status;
        exec.current_step = state.current_step.clone();

        let mut progress = calculate_progress(state);
        if exec.progress.total > progress.total {
            progress.pending += exec.progress.total - progress.total;
            progress.total = exec.progress.total;
            progress.recompute_percent();
        }
        exec.progress = progress;
        exec.steps = convert_steps(state);

        if state.finished_at.is_some() {
            exec.finished_at = state.finished_at;
        }
        if let Some(last) = state.errors.last() {
            exec.error = Some(last.message.clone());
        }
    }

    pub fn remove(&self, run_id: &str) -> Option<PipelineExecution> {
        self.runs.remove(run_id).map(|(_, e)| e.execution)
    }

    pub fn clear(&self) {
        self.runs.clear();
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Signal a running pipeline to stop.
    pub fn cancel(&self, run_id: &str) -> Result<(), RegistryError> {
        let mut entry = self
            .runs
            .get_mut(run_id)
            .ok_or_else(|| RegistryError::NotFound(run_id.to_string()))?;

        if entry.execution.status.is_terminal() {
            return Err(RegistryError::AlreadyFinished {
                run_id: run_id.to_string(),
                status: entry.execution.status,
            });
        }
        if let Some(token) = &entry.cancel {
            token.cancel();
        }
        entry.execution.status = ExecutionStatus::Cancelled;
        tracing::info!(run_id, "pipeline run cancelled");
        Ok(())
    }
}

impl std::fmt::Debug for PipelineRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRegistry")
            .field("runs", &self.runs.len())
            .finish()
    }
}
