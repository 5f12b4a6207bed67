//! Run-time execution types: per-run state, step results, errors and
//! progress events.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status shared by runs and steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl ExecutionStatus {
    /// Completed, failed, cancelled or skipped.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed
                | ExecutionStatus::Failed
                | ExecutionStatus::Cancelled
                | ExecutionStatus::Skipped
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// StepResult / StepError
// ---------------------------------------------------------------------------

/// Outcome of one step. Retries overwrite output and error in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: ExecutionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Worker that served the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pane_used: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsed_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(default)]
    pub attempts: u32,
}

impl StepResult {
    /// A fresh result for a step about to start.
    pub fn started(step_id: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            status: ExecutionStatus::Running,
            started_at: Some(Utc::now()),
            finished_at: None,
            pane_used: None,
            agent_type: None,
            output: String::new(),
            parsed_data: None,
            error: None,
            skip_reason: None,
            attempts: 0,
        }
    }

    /// Mark terminal with the given status and stamp the finish time.
    pub fn finish(&mut self, status: ExecutionStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    /// Fail with the given error.
    pub fn fail(&mut self, error: StepError) {
        self.error = Some(error);
        self.finish(ExecutionStatus::Failed);
    }

    /// Wall time between start and finish, if both are known.
    pub fn duration(&self) -> Option<Duration> {
        let (start, end) = (self.started_at?, self.finished_at?);
        (end - start).to_std().ok()
    }
}

/// Classification of a step failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    /// The wait phase exceeded the step or group timeout.
    Timeout,
    /// The worker could not be driven (send or capture failed).
    AgentError,
    /// The step's task died unexpectedly.
    Crash,
    /// The step declaration could not be acted on.
    Validation,
    /// The `when` condition failed to evaluate.
    Condition,
    /// The prompt could not be resolved (unreadable file, strict substitution).
    Prompt,
    /// No worker could be selected.
    Routing,
    /// A parallel group or loop failed because of its members.
    Group,
}

impl std::fmt::Display for StepErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepErrorKind::Timeout => "timeout",
            StepErrorKind::AgentError => "agent_error",
            StepErrorKind::Crash => "crash",
            StepErrorKind::Validation => "validation",
            StepErrorKind::Condition => "condition",
            StepErrorKind::Prompt => "prompt",
            StepErrorKind::Routing => "routing",
            StepErrorKind::Group => "group",
        };
        f.write_str(s)
    }
}

/// Error attached to a terminal step result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    #[serde(rename = "type")]
    pub kind: StepErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(default)]
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

impl StepError {
    pub fn new(kind: StepErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
            attempt: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

// ---------------------------------------------------------------------------
// ExecutionState
// ---------------------------------------------------------------------------

/// Everything known about one run. Owned by the executor while running and
/// returned to the caller afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub run_id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,
    /// Results for prompt steps, nested members included.
    #[serde(default)]
    pub steps: BTreeMap<String, StepResult>,
    /// Aggregate results for parallel groups and loops.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub groups: BTreeMap<String, StepResult>,
    /// Run-scoped variables: declared vars, `steps.<id>.output`, `loop.*`.
    #[serde(default)]
    pub variables: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ExecutionError>,
}

impl ExecutionState {
    pub fn new(run_id: impl Into<String>, workflow_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            workflow_id: workflow_id.into(),
            status: ExecutionStatus::Pending,
            started_at: now,
            updated_at: now,
            finished_at: None,
            current_step: None,
            steps: BTreeMap::new(),
            groups: BTreeMap::new(),
            variables: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    /// Look up a result among leaf steps first, then groups.
    pub fn result(&self, step_id: &str) -> Option<&StepResult> {
        self.steps.get(step_id).or_else(|| self.groups.get(step_id))
    }

    /// All results, leaf steps and groups.
    pub fn all_results(&self) -> impl Iterator<Item = &StepResult> {
        self.steps.values().chain(self.groups.values())
    }

    /// Number of results with a status that counts towards progress.
    pub fn finished_count(&self) -> usize {
        self.all_results()
            .filter(|r| {
                matches!(
                    r.status,
                    ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Skipped
                )
            })
            .count()
    }

    pub fn push_error(&mut self, error: ExecutionError) {
        self.errors.push(error);
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Category of a run-level error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    Dependency,
    Timeout,
    Step,
    Parse,
    Substitution,
    Cancelled,
}

/// Run-level error entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(rename = "type")]
    pub kind: ExecutionErrorKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// `true` when the run cannot continue.
    pub fatal: bool,
}

impl ExecutionError {
    pub fn fatal(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        Self {
            step_id: None,
            kind,
            message: message.into(),
            timestamp: Utc::now(),
            fatal: true,
        }
    }

    pub fn warning(kind: ExecutionErrorKind, message: impl Into<String>) -> Self {
        Self {
            fatal: false,
            ..Self::fatal(kind, message)
        }
    }

    pub fn for_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Progress events
// ---------------------------------------------------------------------------

/// Kind of progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressEventKind {
    WorkflowStart,
    WorkflowComplete,
    WorkflowError,
    StepStart,
    StepComplete,
    StepRetry,
    StepError,
    StepSkip,
    StepWarning,
    ParallelStart,
    LoopIteration,
}

/// One entry in the progress stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub kind: ProgressEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub message: String,
    /// Run completion fraction in `0.0..=1.0`.
    pub progress: f64,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(
        kind: ProgressEventKind,
        step_id: Option<&str>,
        message: impl Into<String>,
        progress: f64,
    ) -> Self {
        Self {
            kind,
            step_id: step_id.map(str::to_string),
            message: message.into(),
            progress,
            timestamp: Utc::now(),
        }
    }
}
