//! Workflow executor: wave-based scheduling of steps onto workers.
//!
//! The `Executor` validates the dependency graph, then repeatedly dispatches
//! every top-level step whose dependencies (including those of its nested
//! members) are satisfied. Steps of one wave run concurrently in a
//! `tokio::task::JoinSet`; the next wave starts only after every step of the
//! current one has reached a terminal state.
//!
//! # Step flow
//!
//! 1. Evaluate the `when` condition (skip when false).
//! 2. Resolve the prompt (inline or file) and substitute references.
//! 3. Claim a worker through the [`BoxWorkerDriver`], send the prompt.
//! 4. Wait per the step's wait mode, bounded by the step timeout.
//! 5. Capture and diff the worker output, parse it, publish it to variables.
//!
//! Failures follow the step's error action (or the workflow default):
//! `retry` re-dispatches with backoff, `continue` records and proceeds,
//! `fail`/`fail_fast` stop the run. Parallel groups aggregate their members
//! according to their own error action.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use panefleet_types::config::EngineConfig;
use panefleet_types::duration::format_duration;
use panefleet_types::error::DependencyError;
use panefleet_types::execution::{
    ExecutionError, ExecutionErrorKind, ExecutionState, ExecutionStatus, ProgressEvent,
    ProgressEventKind, StepError, StepErrorKind, StepResult,
};
use panefleet_types::workflow::{AgentType, ErrorAction, Step, StepKind, WaitMode, Workflow};
use serde_json::{Map, Value, json};
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::condition::ConditionEvaluator;
use super::dag::DependencyGraph;
use super::driver::{BoxWorkerDriver, DriverError, WorkerHandle, WorkerRequest, extract_new_output};
use super::output::parse_output;
use super::progress::ProgressBus;
use super::registry::{PipelineExecution, PipelineRegistry};
use super::retry::RetryPolicy;
use super::substitution::{
    Substitutor, clear_loop_vars, parse_default, set_loop_vars, store_step_output,
};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default workflow-level timeout (30 minutes).
pub const DEFAULT_WORKFLOW_TIMEOUT_SECS: u64 = 1800;

/// Default step-level timeout (5 minutes).
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

/// Iteration cap for loops that declare none.
pub const DEFAULT_MAX_ITERATIONS: u32 = 100;

const DRY_RUN_PANE: &str = "dry-run-pane";
const DRY_RUN_AGENT: &str = "dry-run-agent";
const DRY_RUN_PREVIEW_CHARS: usize = 100;

type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

// ---------------------------------------------------------------------------
// ExecutorConfig
// ---------------------------------------------------------------------------

/// Runtime knobs for one executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Worker session name, exposed to templates as `${session}`.
    pub session: String,
    /// Fixed run id; generated per run when absent.
    pub run_id: Option<String>,
    pub dry_run: bool,
    pub default_step_timeout: Duration,
    pub global_timeout: Duration,
    pub poll_interval: Duration,
    pub initial_debounce: Duration,
    pub default_retry_delay: Duration,
    pub progress_capacity: usize,
    /// Base directory for relative `prompt_file` paths.
    pub base_dir: Option<PathBuf>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for ExecutorConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            session: config.session.clone(),
            run_id: None,
            dry_run: config.dry_run,
            default_step_timeout: config.default_step_timeout,
            global_timeout: config.global_timeout,
            poll_interval: config.poll_interval,
            initial_debounce: config.initial_debounce,
            default_retry_delay: config.default_retry_delay,
            progress_capacity: config.progress_capacity,
            base_dir: None,
        }
    }
}

// ---------------------------------------------------------------------------
// ExecutorError / ExecutionResult
// ---------------------------------------------------------------------------

/// Why a run did not complete.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutorError {
    #[error("workflow has dependency errors: {}", summarize_dependency_errors(.0))]
    Dependency(Vec<DependencyError>),

    #[error("step '{step_id}' failed: {error}")]
    StepFailed { step_id: String, error: String },

    #[error("workflow exceeded global timeout of {}", format_duration(*.0))]
    WorkflowTimeout(Duration),

    #[error("workflow cancelled")]
    Cancelled,

    #[error("no steps ready but workflow incomplete: {}", .0.join(", "))]
    Unschedulable(Vec<String>),

    #[error("run not found: {0}")]
    RunNotFound(String),
}

fn summarize_dependency_errors(errors: &[DependencyError]) -> String {
    errors
        .iter()
        .map(|e| e.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Final state of a run plus the reason it stopped early, if it did.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub state: ExecutionState,
    pub error: Option<ExecutorError>,
}

impl ExecutionResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.state.status == ExecutionStatus::Completed
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct Executor {
    config: ExecutorConfig,
    driver: BoxWorkerDriver,
    progress: ProgressBus,
    registry: Option<Arc<PipelineRegistry>>,
    /// Cancellation tokens keyed by run id.
    cancellation_tokens: DashMap<String, CancellationToken>,
}

impl Executor {
    pub fn new(config: ExecutorConfig, driver: BoxWorkerDriver) -> Self {
        let progress = ProgressBus::new(config.progress_capacity);
        Self {
            config,
            driver,
            progress,
            registry: None,
            cancellation_tokens: DashMap::new(),
        }
    }

    /// Mirror every run into `registry`.
    pub fn with_registry(mut self, registry: Arc<PipelineRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress.subscribe()
    }

    /// Ids of runs currently in flight.
    pub fn active_runs(&self) -> Vec<String> {
        let mut runs: Vec<String> = self
            .cancellation_tokens
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        runs.sort();
        runs
    }

    /// Execute `workflow` to completion. `vars` override declared defaults.
    pub async fn run(&self, workflow: &Workflow, vars: BTreeMap<String, Value>) -> ExecutionResult {
        self.run_with_cancel(workflow, vars, CancellationToken::new()).await
    }

    /// Execute `workflow`, stopping early when `cancel` fires.
    pub async fn run_with_cancel(
        &self,
        workflow: &Workflow,
        vars: BTreeMap<String, Value>,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let run_id = self.config.run_id.clone().unwrap_or_else(generate_run_id);
        let mut state = ExecutionState::new(&run_id, &workflow.name);
        state.status = ExecutionStatus::Running;
        for (name, def) in &workflow.vars {
            if let Some(default) = &def.default {
                state.variables.insert(name.clone(), default.clone());
            }
        }
        state.variables.extend(vars);

        let graph = DependencyGraph::build(workflow);
        let total = graph.size();

        if let Some(registry) = &self.registry {
            registry.register(
                PipelineExecution::new(&run_id, &workflow.name, &self.config.session, total),
                Some(cancel.clone()),
            );
        }

        let dependency_errors = graph.validate();
        if !dependency_errors.is_empty() {
            for err in &dependency_errors {
                let mut error =
                    ExecutionError::fatal(ExecutionErrorKind::Dependency, err.message.clone());
                if let Some(step) = err.steps.first() {
                    error = error.for_step(step.clone());
                }
                state.push_error(error);
            }
            let error = ExecutorError::Dependency(dependency_errors);
            tracing::warn!(
                run_id = %run_id,
                workflow = %workflow.name,
                error = %error,
                "workflow rejected"
            );
            state.status = ExecutionStatus::Failed;
            state.finished_at = Some(Utc::now());
            state.touch();
            self.progress.emit(
                ProgressEventKind::WorkflowError,
                None,
                error.to_string(),
                0.0,
            );
            if let Some(registry) = &self.registry {
                registry.update_from_state(&state);
            }
            return ExecutionResult {
                state,
                error: Some(error),
            };
        }

        let workflow_timeout = workflow.settings.timeout.unwrap_or(self.config.global_timeout);
        self.cancellation_tokens.insert(run_id.clone(), cancel.clone());

        let ctx = Arc::new(RunContext {
            run_id: run_id.clone(),
            workflow_name: workflow.name.clone(),
            config: self.config.clone(),
            default_action: workflow.settings.on_error.unwrap_or_default(),
            driver: self.driver.clone(),
            progress: self.progress.clone(),
            registry: self.registry.clone(),
            state: RwLock::new(state),
            claimed: Arc::new(Mutex::new(BTreeSet::new())),
            cancel: cancel.clone(),
            total,
        });

        tracing::info!(
            run_id = %run_id,
            workflow = %workflow.name,
            steps = total,
            "workflow started"
        );
        ctx.emit(
            ProgressEventKind::WorkflowStart,
            None,
            format!("Starting workflow: {}", workflow.name),
        )
        .await;

        let outcome = tokio::time::timeout(workflow_timeout, ctx.drive(graph)).await;
        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(err)) => Some(err),
            Err(_elapsed) => {
                // Stop anything the aborted tasks left waiting.
                cancel.cancel();
                Some(ExecutorError::WorkflowTimeout(workflow_timeout))
            }
        };
        self.cancellation_tokens.remove(&run_id);

        let state = ctx.finish(error.as_ref()).await;
        match &error {
            None => tracing::info!(run_id = %run_id, "workflow completed"),
            Some(err) => {
                tracing::warn!(run_id = %run_id, error = %err, "workflow did not complete")
            }
        }
        ExecutionResult { state, error }
    }

    /// Signal cancellation for an in-flight run.
    pub fn cancel(&self, run_id: &str) -> Result<(), ExecutorError> {
        let token = self
            .cancellation_tokens
            .get(run_id)
            .ok_or_else(|| ExecutorError::RunNotFound(run_id.to_string()))?;
        token.cancel();
        tracing::info!(run_id, "workflow cancellation requested");
        Ok(())
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("config", &self.config)
            .field("active_runs", &self.cancellation_tokens.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// RunContext
// ---------------------------------------------------------------------------

/// Everything one run shares across its tasks.
struct RunContext {
    run_id: String,
    workflow_name: String,
    config: ExecutorConfig,
    default_action: ErrorAction,
    driver: BoxWorkerDriver,
    progress: ProgressBus,
    registry: Option<Arc<PipelineRegistry>>,
    /// Never held across an await.
    state: RwLock<ExecutionState>,
    /// Worker ids held by in-flight steps of this run.
    claimed: Arc<Mutex<BTreeSet<String>>>,
    cancel: CancellationToken,
    total: usize,
}

/// How a claim or wait stopped short.
enum Interrupted {
    Cancelled,
    Timeout,
    Driver(DriverError),
}

impl RunContext {
    // -- scheduling ---------------------------------------------------------

    async fn drive(self: &Arc<Self>, mut graph: DependencyGraph) -> Result<(), ExecutorError> {
        let mut wave = 0usize;
        loop {
            if self.cancel.is_cancelled() {
                return Err(ExecutorError::Cancelled);
            }

            let pending: Vec<String> = graph
                .roots()
                .iter()
                .filter(|id| !graph.is_executed(id))
                .cloned()
                .collect();
            if pending.is_empty() {
                return Ok(());
            }

            let ready: Vec<String> = pending
                .iter()
                .filter(|id| {
                    graph
                        .external_dependencies(id)
                        .iter()
                        .all(|dep| graph.is_executed(dep))
                })
                .cloned()
                .collect();
            if ready.is_empty() {
                return Err(ExecutorError::Unschedulable(pending));
            }

            tracing::debug!(
                run_id = %self.run_id,
                wave,
                steps = ready.len(),
                "processing wave"
            );

            // A fail_fast failure cancels the rest of its wave only.
            let wave_cancel = self.cancel.child_token();
            let mut join_set = JoinSet::new();
            for id in &ready {
                let Some(step) = graph.get_step(id).cloned() else {
                    continue;
                };
                let ctx = Arc::clone(self);
                let token = wave_cancel.clone();
                join_set.spawn(async move { ctx.run_step(&step, token).await });
            }

            let mut finished: HashSet<String> = HashSet::new();
            let mut crashes = Vec::new();
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(result) => {
                        if result.status == ExecutionStatus::Failed
                            && self.fails_fast(&graph, &result.step_id)
                            && !wave_cancel.is_cancelled()
                        {
                            tracing::info!(
                                run_id = %self.run_id,
                                step_id = %result.step_id,
                                "fail_fast step failed, cancelling wave"
                            );
                            wave_cancel.cancel();
                        }
                        finished.insert(result.step_id.clone());
                    }
                    Err(err) => crashes.push(err.to_string()),
                }
            }

            // A task that died never reported; record it as crashed.
            let mut crash_messages = crashes.into_iter();
            for id in ready.iter().filter(|id| !finished.contains(*id)) {
                let detail = crash_messages
                    .next()
                    .unwrap_or_else(|| "task ended without a result".to_string());
                tracing::warn!(
                    run_id = %self.run_id,
                    step_id = %id,
                    detail = %detail,
                    "step task crashed"
                );
                let mut result = StepResult::started(id.as_str());
                result.fail(
                    StepError::new(StepErrorKind::Crash, "step task crashed").with_details(detail),
                );
                if let Some(step) = graph.get_step(id).cloned() {
                    self.record(&step, &result).await;
                }
            }

            let mut failure = None;
            for id in &ready {
                let _ = graph.mark_executed(id);
                for descendant in graph.descendants(id) {
                    let _ = graph.mark_executed(&descendant);
                }
                if let Some(step) = graph.get_step(id) {
                    if let Some(err) = self.assess(step).await {
                        failure.get_or_insert(err);
                    }
                }
            }

            if self.cancel.is_cancelled() {
                return Err(ExecutorError::Cancelled);
            }
            if let Some(err) = failure {
                return Err(err);
            }
            wave += 1;
        }
    }

    fn fails_fast(&self, graph: &DependencyGraph, step_id: &str) -> bool {
        graph
            .get_step(step_id)
            .and_then(|step| step.on_error)
            .unwrap_or(self.default_action)
            == ErrorAction::FailFast
    }

    /// Apply the error action of a finished top-level step.
    async fn assess(&self, step: &Step) -> Option<ExecutorError> {
        let mut state = self.state.write().await;
        let result = state.result(&step.id)?;
        if result.status != ExecutionStatus::Failed {
            return None;
        }
        let message = result
            .error
            .as_ref()
            .map(|e| e.message.clone())
            .unwrap_or_else(|| "step failed".to_string());

        match step.on_error.unwrap_or(self.default_action) {
            ErrorAction::Continue => {
                state.push_error(
                    ExecutionError::warning(
                        ExecutionErrorKind::Step,
                        format!("step failed: {message}"),
                    )
                    .for_step(step.id.clone()),
                );
                None
            }
            ErrorAction::Fail | ErrorAction::FailFast | ErrorAction::Retry => {
                state.push_error(
                    ExecutionError::fatal(
                        ExecutionErrorKind::Step,
                        format!("step failed: {message}"),
                    )
                    .for_step(step.id.clone()),
                );
                Some(ExecutorError::StepFailed {
                    step_id: step.id.clone(),
                    error: message,
                })
            }
        }
    }

    /// Settle the final run status and hand back a snapshot of the state.
    async fn finish(&self, error: Option<&ExecutorError>) -> ExecutionState {
        let (kind, message) = {
            let mut state = self.state.write().await;
            let outcome = match error {
                None => {
                    state.status = ExecutionStatus::Completed;
                    (
                        ProgressEventKind::WorkflowComplete,
                        "Workflow completed successfully".to_string(),
                    )
                }
                Some(ExecutorError::Cancelled) => {
                    state.status = ExecutionStatus::Cancelled;
                    state.push_error(ExecutionError::fatal(
                        ExecutionErrorKind::Cancelled,
                        "workflow cancelled",
                    ));
                    (ProgressEventKind::WorkflowError, "workflow cancelled".to_string())
                }
                Some(ExecutorError::WorkflowTimeout(_)) => {
                    state.status = ExecutionStatus::Failed;
                    state.push_error(ExecutionError::fatal(
                        ExecutionErrorKind::Timeout,
                        "workflow exceeded global timeout",
                    ));
                    (ProgressEventKind::WorkflowError, error_message(error))
                }
                Some(ExecutorError::Unschedulable(_)) => {
                    state.status = ExecutionStatus::Failed;
                    state.push_error(ExecutionError::fatal(
                        ExecutionErrorKind::Dependency,
                        error_message(error),
                    ));
                    (ProgressEventKind::WorkflowError, error_message(error))
                }
                Some(_) => {
                    state.status = ExecutionStatus::Failed;
                    (ProgressEventKind::WorkflowError, error_message(error))
                }
            };
            state.current_step = None;
            state.finished_at = Some(Utc::now());
            state.touch();
            outcome
        };

        let progress = if kind == ProgressEventKind::WorkflowComplete {
            1.0
        } else {
            self.fraction().await
        };
        self.progress.emit(kind, None, message, progress);

        let state = self.state.read().await;
        if let Some(registry) = &self.registry {
            registry.update_from_state(&state);
        }
        state.clone()
    }

    // -- steps --------------------------------------------------------------

    /// Run any kind of step, record its result and return it.
    fn run_step<'a>(
        self: &'a Arc<Self>,
        step: &'a Step,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, StepResult> {
        Box::pin(async move {
            {
                let mut state = self.state.write().await;
                state.current_step = Some(step.id.clone());
                state.touch();
            }

            if cancel.is_cancelled() {
                let result = cancelled_result(&step.id, "cancelled before start");
                self.record(step, &result).await;
                return result;
            }

            if let Some(condition) = step.when.as_deref().filter(|c| !c.trim().is_empty()) {
                let outcome = {
                    let state = self.state.read().await;
                    let substitutor =
                        Substitutor::new(&state, &self.config.session, &self.workflow_name);
                    ConditionEvaluator::new(substitutor).evaluate(condition)
                };
                match outcome {
                    Err(err) => {
                        let mut result = StepResult::started(step.id.as_str());
                        result.fail(StepError::new(
                            StepErrorKind::Condition,
                            format!("failed to evaluate when condition: {err}"),
                        ));
                        tracing::warn!(
                            step_id = %step.id,
                            error = %err,
                            "condition evaluation failed"
                        );
                        self.record(step, &result).await;
                        self.emit(
                            ProgressEventKind::StepError,
                            Some(step.id.as_str()),
                            format!(
                                "Step {} failed: failed to evaluate when condition: {err}",
                                step.id
                            ),
                        )
                        .await;
                        return result;
                    }
                    Ok(outcome) if !outcome.proceed => {
                        let reason = format!("condition '{condition}' evaluated to false");
                        tracing::debug!(step_id = %step.id, %reason, "step skipped");
                        let result = self.skip(step, &reason).await;
                        self.emit(
                            ProgressEventKind::StepSkip,
                            Some(step.id.as_str()),
                            format!("Step {} skipped: {reason}", step.id),
                        )
                        .await;
                        return result;
                    }
                    Ok(_) => {}
                }
            }

            let result = self.run_with_retry(step, cancel).await;
            self.record(step, &result).await;
            result
        })
    }

    /// Dispatch `step` until it succeeds or its attempts run out.
    async fn run_with_retry(
        self: &Arc<Self>,
        step: &Step,
        cancel: CancellationToken,
    ) -> StepResult {
        let action = step.on_error.unwrap_or(self.default_action);
        let max_attempts = RetryPolicy::max_attempts(step, action);
        let base_delay = RetryPolicy::base_delay(step, self.config.default_retry_delay);
        let first_started = Utc::now();
        let mut attempt = 1;

        loop {
            self.emit(
                ProgressEventKind::StepStart,
                Some(step.id.as_str()),
                format!("Executing step {} (attempt {attempt}/{max_attempts})", step.id),
            )
            .await;
            tracing::debug!(step_id = %step.id, attempt, max_attempts, "step started");

            let mut result = match step.kind() {
                StepKind::Prompt => self.run_prompt(step, &cancel).await,
                StepKind::Parallel => self.run_parallel(step, action, &cancel).await,
                StepKind::Loop => self.run_loop(step, action, &cancel).await,
            };
            result.started_at = Some(first_started);
            result.attempts = attempt;

            match result.status {
                ExecutionStatus::Completed => {
                    tracing::debug!(step_id = %step.id, attempt, "step completed");
                    self.emit(
                        ProgressEventKind::StepComplete,
                        Some(step.id.as_str()),
                        format!("Step {} completed", step.id),
                    )
                    .await;
                    return result;
                }
                ExecutionStatus::Failed => {}
                _ => return result,
            }

            if let Some(error) = result.error.as_mut() {
                error.attempt = attempt;
            }
            let message = result
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_default();

            if !RetryPolicy::should_retry(attempt, max_attempts) {
                tracing::warn!(
                    step_id = %step.id,
                    attempts = attempt,
                    error = %message,
                    "step failed"
                );
                self.emit(
                    ProgressEventKind::StepError,
                    Some(step.id.as_str()),
                    format!("Step {} failed after {attempt} attempts: {message}", step.id),
                )
                .await;
                return result;
            }

            let delay = RetryPolicy::calculate_retry_delay(base_delay, attempt, step.retry_backoff);
            tracing::debug!(
                step_id = %step.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying step"
            );
            self.emit(
                ProgressEventKind::StepRetry,
                Some(step.id.as_str()),
                format!("Step {} failed, retrying in {}", step.id, format_duration(delay)),
            )
            .await;

            tokio::select! {
                _ = cancel.cancelled() => {
                    let mut cancelled =
                        cancelled_result(&step.id, "cancelled while waiting to retry");
                    cancelled.started_at = Some(first_started);
                    cancelled.attempts = attempt;
                    return cancelled;
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    /// One attempt of a prompt step.
    async fn run_prompt(&self, step: &Step, cancel: &CancellationToken) -> StepResult {
        let mut result = StepResult::started(step.id.as_str());
        let timeout = step.timeout.unwrap_or(self.config.default_step_timeout);

        let template = match self.resolve_prompt(step).await {
            Ok(template) => template,
            Err(message) => {
                result.fail(StepError::new(
                    StepErrorKind::Prompt,
                    format!("failed to resolve prompt: {message}"),
                ));
                return result;
            }
        };

        let (prompt, unresolved) = {
            let state = self.state.read().await;
            Substitutor::new(&state, &self.config.session, &self.workflow_name)
                .substitute(&template)
        };
        if let Some(err) = unresolved {
            self.warn(&step.id, ExecutionErrorKind::Substitution, err.to_string())
                .await;
        }

        if self.config.dry_run {
            result.pane_used = Some(DRY_RUN_PANE.to_string());
            result.agent_type = Some(DRY_RUN_AGENT.to_string());
            result.output = format!(
                "[DRY RUN] Would execute: {}",
                truncate_prompt(&prompt, DRY_RUN_PREVIEW_CHARS)
            );
            result.finish(ExecutionStatus::Completed);
            return result;
        }

        let claim = match self.claim_worker(step, cancel, timeout).await {
            Ok(claim) => claim,
            Err(Interrupted::Cancelled) => {
                return cancelled_result(&step.id, "cancelled during execution");
            }
            Err(Interrupted::Timeout) => {
                result.fail(StepError::new(
                    StepErrorKind::Routing,
                    format!(
                        "failed to select worker: no worker became free within {}",
                        format_duration(timeout)
                    ),
                ));
                return result;
            }
            Err(Interrupted::Driver(err)) => {
                result.fail(StepError::new(
                    StepErrorKind::Routing,
                    format!("failed to select worker: {err}"),
                ));
                return result;
            }
        };
        let worker = claim.worker.clone();
        result.pane_used = Some(worker.id.clone());
        result.agent_type = Some(worker.agent_type.clone());
        tracing::debug!(step_id = %step.id, worker = %worker.id, "worker selected");

        let before = self.driver.capture_output(&worker).await.unwrap_or_default();

        let sent = tokio::select! {
            _ = cancel.cancelled() => {
                return cancelled_result(&step.id, "cancelled during execution");
            }
            sent = self.driver.send_prompt(&worker, &prompt) => sent,
        };
        if let Err(err) = sent {
            result.fail(StepError::new(
                StepErrorKind::AgentError,
                format!("failed to send prompt: {err}"),
            ));
            return result;
        }

        let wait = step.wait.unwrap_or_default();
        match wait {
            WaitMode::None => {
                result.finish(ExecutionStatus::Completed);
                return result;
            }
            WaitMode::Time => {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return cancelled_result(&step.id, "cancelled during execution");
                    }
                    _ = tokio::time::sleep(timeout) => {}
                }
            }
            WaitMode::Completion | WaitMode::Idle => {
                match self.wait_for_idle(&worker, timeout, cancel).await {
                    Ok(()) => {}
                    Err(Interrupted::Cancelled) => {
                        return cancelled_result(&step.id, "cancelled during execution");
                    }
                    Err(Interrupted::Timeout) => {
                        result.fail(StepError::new(
                            StepErrorKind::Timeout,
                            format!(
                                "timeout waiting for completion: timeout after {}",
                                format_duration(timeout)
                            ),
                        ));
                        return result;
                    }
                    Err(Interrupted::Driver(err)) => {
                        result.fail(StepError::new(StepErrorKind::AgentError, err.to_string()));
                        return result;
                    }
                }
            }
        }

        let after = match self.driver.capture_output(&worker).await {
            Ok(after) => after,
            Err(err) => {
                result.fail(StepError::new(
                    StepErrorKind::AgentError,
                    format!("failed to capture output: {err}"),
                ));
                return result;
            }
        };
        drop(claim);

        result.output = extract_new_output(&before, &after);
        if !step.output_parse.is_passthrough() {
            match parse_output(&result.output, &step.output_parse) {
                Ok(parsed) => result.parsed_data = Some(parsed),
                Err(err) => {
                    let message = format!("output parse warning: {err}");
                    self.warn(&step.id, ExecutionErrorKind::Parse, message).await;
                }
            }
        }
        result.finish(ExecutionStatus::Completed);
        result
    }

    /// One attempt of a parallel group.
    ///
    /// Members start together unless they depend on a sibling (or on a step
    /// nested in one); such members start once that sibling has finished.
    async fn run_parallel(
        self: &Arc<Self>,
        step: &Step,
        action: ErrorAction,
        cancel: &CancellationToken,
    ) -> StepResult {
        let mut group = StepResult::started(step.id.as_str());
        let members = step.parallel.len();
        let group_cancel = cancel.child_token();
        let waits_on = sibling_dependencies(step);

        self.emit(
            ProgressEventKind::ParallelStart,
            Some(step.id.as_str()),
            format!("Starting parallel group with {members} steps (on_error={action})"),
        )
        .await;

        let deadline = step.timeout.map(|t| Instant::now() + t);
        let mut timed_out = false;
        let mut fail_fast_triggered = false;
        let mut started = vec![false; members];
        let mut finished: BTreeSet<usize> = BTreeSet::new();
        let mut results: BTreeMap<String, StepResult> = BTreeMap::new();
        let mut join_set = JoinSet::new();

        loop {
            for (index, member) in step.parallel.iter().enumerate() {
                if started[index] || !waits_on[index].is_subset(&finished) {
                    continue;
                }
                started[index] = true;
                let ctx = Arc::clone(self);
                let member = member.clone();
                let token = group_cancel.clone();
                // The inner task isolates a panicking member so its index survives.
                join_set.spawn(async move {
                    let outcome = tokio::spawn(async move {
                        if token.is_cancelled() {
                            let reason = "cancelled due to parallel group failure";
                            let result = cancelled_result(&member.id, reason);
                            ctx.record(&member, &result).await;
                            return result;
                        }
                        ctx.run_step(&member, token).await
                    })
                    .await;
                    (index, outcome)
                });
            }

            let joined = match deadline.filter(|_| !timed_out) {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, join_set.join_next()).await {
                        Ok(joined) => joined,
                        Err(_elapsed) => {
                            timed_out = true;
                            group_cancel.cancel();
                            continue;
                        }
                    }
                }
                None => join_set.join_next().await,
            };
            let Some(joined) = joined else {
                break;
            };
            let (index, outcome) = match joined {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::warn!(group = %step.id, error = %err, "parallel member lost");
                    continue;
                }
            };
            finished.insert(index);

            let result = match outcome {
                Ok(result) => result,
                Err(err) => {
                    let member = &step.parallel[index];
                    tracing::warn!(
                        group = %step.id,
                        member = %member.id,
                        error = %err,
                        "step task crashed"
                    );
                    let mut result = StepResult::started(member.id.as_str());
                    result.fail(
                        StepError::new(StepErrorKind::Crash, "step task crashed")
                            .with_details(err.to_string()),
                    );
                    self.record(member, &result).await;
                    result
                }
            };
            if result.status == ExecutionStatus::Failed
                && action == ErrorAction::FailFast
                && !fail_fast_triggered
            {
                fail_fast_triggered = true;
                tracing::debug!(group = %step.id, member = %result.step_id, "cancelling siblings");
                group_cancel.cancel();
            }
            results.insert(result.step_id.clone(), result);
        }

        let missing: Vec<&Step> = step
            .parallel
            .iter()
            .filter(|m| !results.contains_key(&m.id))
            .collect();
        for member in missing {
            let mut result = StepResult::started(member.id.as_str());
            result.fail(
                StepError::new(StepErrorKind::Crash, "step task crashed")
                    .with_details("task ended without a result"),
            );
            self.record(member, &result).await;
            results.insert(member.id.clone(), result);
        }

        let count = |status: ExecutionStatus| {
            results.values().filter(|r| r.status == status).count()
        };
        let completed = count(ExecutionStatus::Completed) + count(ExecutionStatus::Skipped);
        let failed = count(ExecutionStatus::Failed);
        let cancelled = count(ExecutionStatus::Cancelled);

        let summary: Map<String, Value> = step
            .parallel
            .iter()
            .filter_map(|member| results.get(&member.id))
            .map(|r| {
                (
                    r.step_id.clone(),
                    json!({
                        "output": r.output,
                        "status": r.status,
                        "parsed_data": r.parsed_data,
                    }),
                )
            })
            .collect();
        group.parsed_data = Some(Value::Object(summary));

        if failed > 0 || fail_fast_triggered {
            match action {
                ErrorAction::Continue => {
                    group.output =
                        format!("Parallel group completed with {completed}/{members} successful");
                    group.finish(ExecutionStatus::Completed);
                }
                ErrorAction::FailFast => group.fail(StepError::new(
                    StepErrorKind::Group,
                    format!("{failed} failed, {cancelled} cancelled (fail_fast mode)"),
                )),
                ErrorAction::Fail | ErrorAction::Retry => group.fail(StepError::new(
                    StepErrorKind::Group,
                    format!("{failed} of {members} parallel steps failed"),
                )),
            }
        } else if timed_out {
            let limit = step.timeout.map(format_duration).unwrap_or_default();
            group.fail(StepError::new(
                StepErrorKind::Timeout,
                format!("parallel group timed out after {limit}"),
            ));
        } else if cancel.is_cancelled() {
            return cancelled_result(&step.id, "cancelled during execution");
        } else {
            group.output = format!("All {members} parallel steps completed");
            group.finish(ExecutionStatus::Completed);
        }
        group
    }

    /// One attempt of a loop: iterate the resolved items sequentially.
    async fn run_loop(
        self: &Arc<Self>,
        step: &Step,
        action: ErrorAction,
        cancel: &CancellationToken,
    ) -> StepResult {
        let mut group = StepResult::started(step.id.as_str());
        let Some(config) = step.loop_config.as_ref() else {
            group.fail(StepError::new(StepErrorKind::Validation, "loop configuration missing"));
            return group;
        };

        let items = {
            let state = self.state.read().await;
            let substitutor = Substitutor::new(&state, &self.config.session, &self.workflow_name);
            resolve_loop_items(&substitutor, &config.items)
        };
        let mut items = match items {
            Ok(items) => items,
            Err(message) => {
                group.fail(StepError::new(
                    StepErrorKind::Validation,
                    format!("failed to resolve loop items: {message}"),
                ));
                return group;
            }
        };

        let max = config.max_iterations.unwrap_or(DEFAULT_MAX_ITERATIONS) as usize;
        if items.len() > max {
            self.warn(
                &step.id,
                ExecutionErrorKind::Step,
                format!("loop has {} items, truncated to max_iterations {max}", items.len()),
            )
            .await;
            items.truncate(max);
        }

        let var_name = config.var_name.as_deref().unwrap_or("item");
        let total = items.len();
        let mut iterations = Vec::with_capacity(total);
        let mut failure: Option<String> = None;
        let mut interrupted = false;

        for (index, item) in items.into_iter().enumerate() {
            if cancel.is_cancelled() {
                interrupted = true;
                break;
            }
            {
                let mut state = self.state.write().await;
                set_loop_vars(&mut state, var_name, item.clone(), index, total);
            }
            self.emit(
                ProgressEventKind::LoopIteration,
                Some(step.id.as_str()),
                format!("Loop {} iteration {}/{total}", step.id, index + 1),
            )
            .await;

            let mut body_results = Map::new();
            for body in &config.steps {
                let result = self.run_step(body, cancel.clone()).await;
                body_results.insert(
                    body.id.clone(),
                    json!({ "status": result.status, "output": result.output }),
                );
                match result.status {
                    ExecutionStatus::Cancelled => interrupted = true,
                    ExecutionStatus::Failed
                        if body.on_error.unwrap_or(self.default_action) != ErrorAction::Continue =>
                    {
                        let message = result.error.map(|e| e.message).unwrap_or_default();
                        failure = Some(format!(
                            "iteration {} failed at step {}: {message}",
                            index + 1,
                            body.id
                        ));
                    }
                    _ => {}
                }
                if interrupted || failure.is_some() {
                    break;
                }
            }
            iterations.push(json!({ "index": index, "item": item, "steps": body_results }));
            if interrupted || failure.is_some() {
                break;
            }
        }

        {
            let mut state = self.state.write().await;
            clear_loop_vars(&mut state, var_name);
        }

        let done = iterations.len();
        group.parsed_data = Some(Value::Array(iterations));
        if interrupted {
            return cancelled_result(&step.id, "cancelled during execution");
        }
        match failure {
            Some(message) if action != ErrorAction::Continue => {
                group.fail(StepError::new(StepErrorKind::Group, format!("loop {message}")));
            }
            _ => {
                group.output = format!("Loop completed {done}/{total} iterations");
                group.finish(ExecutionStatus::Completed);
            }
        }
        group
    }

    // -- workers ------------------------------------------------------------

    async fn resolve_prompt(&self, step: &Step) -> Result<String, String> {
        if let Some(prompt) = step.prompt.as_deref().filter(|p| !p.is_empty()) {
            return Ok(prompt.to_string());
        }
        let Some(file) = &step.prompt_file else {
            return Err("step has no prompt or prompt_file".to_string());
        };
        let path = match &self.config.base_dir {
            Some(base) if file.is_relative() => base.join(file),
            _ => file.clone(),
        };
        tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| format!("failed to read prompt file {}: {e}", path.display()))
    }

    /// Select and claim a worker no concurrent step of this run holds.
    async fn claim_worker(
        &self,
        step: &Step,
        cancel: &CancellationToken,
        patience: Duration,
    ) -> Result<WorkerClaim, Interrupted> {
        let agent_type = match step.agent.as_deref() {
            Some(name) => Some(AgentType::normalize(name).ok_or_else(|| {
                Interrupted::Driver(DriverError::NoWorker(format!("unknown agent type: {name}")))
            })?),
            None => None,
        };
        let deadline = Instant::now() + patience;

        loop {
            let request = WorkerRequest {
                agent_type,
                pane: step.pane,
                route: step.route,
                exclude: lock(&self.claimed).clone(),
            };
            match self.driver.select_worker(&request).await {
                Ok(worker) => {
                    if lock(&self.claimed).insert(worker.id.clone()) {
                        return Ok(WorkerClaim {
                            worker,
                            claimed: Arc::clone(&self.claimed),
                        });
                    }
                }
                Err(DriverError::AllBusy) => {}
                Err(err) => return Err(Interrupted::Driver(err)),
            }

            if Instant::now() >= deadline {
                return Err(Interrupted::Timeout);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Interrupted::Cancelled),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Debounce, then poll until the worker is idle.
    async fn wait_for_idle(
        &self,
        worker: &WorkerHandle,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), Interrupted> {
        let deadline = Instant::now() + timeout;
        tokio::select! {
            _ = cancel.cancelled() => return Err(Interrupted::Cancelled),
            _ = tokio::time::sleep(self.config.initial_debounce.min(timeout)) => {}
        }

        loop {
            match self.driver.is_idle(worker).await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(err) => tracing::debug!(worker = %worker.id, error = %err, "idle check failed"),
            }
            if Instant::now() >= deadline {
                return Err(Interrupted::Timeout);
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Interrupted::Cancelled),
                _ = tokio::time::sleep_until(deadline) => return Err(Interrupted::Timeout),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    // -- state --------------------------------------------------------------

    /// Store a result and publish a completed step's output.
    async fn record(&self, step: &Step, result: &StepResult) {
        {
            let mut state = self.state.write().await;
            if result.status == ExecutionStatus::Completed {
                store_step_output(
                    &mut state,
                    &step.id,
                    &result.output,
                    result.parsed_data.as_ref(),
                );
                if let Some(var) = step.output_var.as_deref().filter(|v| !v.is_empty()) {
                    state
                        .variables
                        .insert(var.to_string(), Value::String(result.output.clone()));
                    if let Some(parsed) = &result.parsed_data {
                        state.variables.insert(format!("{var}_parsed"), parsed.clone());
                    }
                }
            }
            match step.kind() {
                StepKind::Prompt => state.steps.insert(step.id.clone(), result.clone()),
                StepKind::Parallel | StepKind::Loop => {
                    state.groups.insert(step.id.clone(), result.clone())
                }
            };
            state.touch();
        }
        self.sync_registry().await;
    }

    /// Record `step` and everything nested in it as skipped.
    async fn skip(&self, step: &Step, reason: &str) -> StepResult {
        let mut result = StepResult::started(step.id.as_str());
        result.skip_reason = Some(reason.to_string());
        result.finish(ExecutionStatus::Skipped);

        let mut nested = Vec::new();
        collect_nested(step, &mut nested);
        for child in nested {
            let mut child_result = StepResult::started(child.id.as_str());
            child_result.skip_reason = Some(format!("parent step '{}' skipped", step.id));
            child_result.finish(ExecutionStatus::Skipped);
            self.record(child, &child_result).await;
        }
        self.record(step, &result).await;
        result
    }

    /// Publish a non-fatal problem as an error entry and a warning event.
    async fn warn(&self, step_id: &str, kind: ExecutionErrorKind, message: String) {
        tracing::warn!(step_id, error = %message, "step warning");
        {
            let mut state = self.state.write().await;
            state.push_error(ExecutionError::warning(kind, message.clone()).for_step(step_id));
        }
        self.emit(ProgressEventKind::StepWarning, Some(step_id), message).await;
    }

    async fn emit(&self, kind: ProgressEventKind, step_id: Option<&str>, message: String) {
        let progress = self.fraction().await;
        self.progress.emit(kind, step_id, message, progress);
    }

    /// Share of the flattened graph that has finished.
    async fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        let finished = self.state.read().await.finished_count();
        (finished as f64 / self.total as f64).min(1.0)
    }

    async fn sync_registry(&self) {
        if let Some(registry) = &self.registry {
            let state = self.state.read().await;
            registry.update_from_state(&state);
        }
    }
}

fn error_message(error: Option<&ExecutorError>) -> String {
    error.map(ToString::to_string).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Worker claims
// ---------------------------------------------------------------------------

/// A worker held by one in-flight step; released on drop.
struct WorkerClaim {
    worker: WorkerHandle,
    claimed: Arc<Mutex<BTreeSet<String>>>,
}

impl Drop for WorkerClaim {
    fn drop(&mut self) {
        lock(&self.claimed).remove(&self.worker.id);
    }
}

fn lock(set: &Mutex<BTreeSet<String>>) -> MutexGuard<'_, BTreeSet<String>> {
    set.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn cancelled_result(step_id: &str, reason: &str) -> StepResult {
    let mut result = StepResult::started(step_id);
    result.skip_reason = Some(reason.to_string());
    result.finish(ExecutionStatus::Cancelled);
    result
}

/// For each direct member of a parallel group, the indices of the sibling
/// members it has to wait for.
fn sibling_dependencies(group: &Step) -> Vec<BTreeSet<usize>> {
    let mut owner: BTreeMap<&str, usize> = BTreeMap::new();
    let mut subtrees: Vec<Vec<&Step>> = Vec::with_capacity(group.parallel.len());
    for (index, member) in group.parallel.iter().enumerate() {
        let mut subtree = vec![member];
        collect_nested(member, &mut subtree);
        for node in &subtree {
            owner.insert(node.id.as_str(), index);
        }
        subtrees.push(subtree);
    }

    subtrees
        .iter()
        .enumerate()
        .map(|(index, subtree)| {
            subtree
                .iter()
                .flat_map(|node| node.depends_on.iter())
                .filter_map(|dep| owner.get(dep.as_str()).copied())
                .filter(|owner_index| *owner_index != index)
                .collect()
        })
        .collect()
}

fn collect_nested<'a>(step: &'a Step, out: &mut Vec<&'a Step>) {
    for child in step.children() {
        out.push(child);
        collect_nested(child, out);
    }
}

/// Resolve a loop's `items` reference (`${vars.files}` or `vars.files`) to
/// a list. Strings holding a JSON array are decoded; other strings are split
/// into non-blank lines.
fn resolve_loop_items(
    substitutor: &Substitutor<'_>,
    reference: &str,
) -> Result<Vec<Value>, String> {
    let trimmed = reference.trim();
    let inner = trimmed
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .unwrap_or(trimmed);
    let (path, _) = parse_default(inner);

    let value = match substitutor.resolve(path) {
        Ok(value) => value,
        Err(err) if !path.contains('.') => substitutor
            .resolve(&format!("vars.{path}"))
            .map_err(|_| err.to_string())?,
        Err(err) => return Err(err.to_string()),
    };

    match value {
        Value::Array(items) => Ok(items),
        Value::Null => Ok(Vec::new()),
        Value::String(text) => {
            if let Ok(Value::Array(items)) = serde_json::from_str::<Value>(&text) {
                return Ok(items);
            }
            Ok(text
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(|line| Value::String(line.to_string()))
                .collect())
        }
        Value::Object(_) => Err(format!("'{path}' is an object, not a list")),
        other => Ok(vec![other]),
    }
}

/// `run-YYYYMMDD-HHMMSS-xxxxxxxx`.
pub fn generate_run_id() -> String {
    let hex = Uuid::now_v7().simple().to_string();
    let suffix = &hex[hex.len() - 8..];
    format!("run-{}-{suffix}", Utc::now().format("%Y%m%d-%H%M%S"))
}

/// Flatten whitespace and cut `prompt` to at most `max` characters.
pub fn truncate_prompt(prompt: &str, max: usize) -> String {
    let flat: String = prompt
        .chars()
        .map(|c| if c == '\n' || c == '\t' || c == '\r' { ' ' } else { c })
        .collect();
    if flat.chars().count() <= max {
        return flat;
    }
    let keep = max.saturating_sub(3);
    let mut cut: String = flat.chars().take(keep).collect();
    cut.push_str("...");
    cut
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    use panefleet_types::workflow::{LoopConfig, OutputParse, ParseMode, WorkflowSettings};

    use super::*;
    use crate::workflow::driver::WorkerDriver;

    // -- stub driver ----------------------------------------------------------

    /// Prompts containing `FAIL` are rejected, `SLOW` never go idle and
    /// `PANIC` panic. Every other prompt appends `done: <prompt>` to the
    /// worker's screen.
    #[derive(Default)]
    struct StubDriver {
        workers: Vec<String>,
        fail_first: AtomicU32,
        sent: Mutex<Vec<(String, String)>>,
        screens: Mutex<HashMap<String, String>>,
        slow: Mutex<HashSet<String>>,
    }

    impl StubDriver {
        fn with_workers(ids: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                workers: ids.iter().map(|id| id.to_string()).collect(),
                ..Default::default()
            })
        }

        fn failing_first(ids: &[&str], failures: u32) -> Arc<Self> {
            Arc::new(Self {
                workers: ids.iter().map(|id| id.to_string()).collect(),
                fail_first: AtomicU32::new(failures),
                ..Default::default()
            })
        }

        fn sent_prompts(&self) -> Vec<String> {
            self.sent.lock().unwrap().iter().map(|(_, p)| p.clone()).collect()
        }
    }

    struct SharedStub(Arc<StubDriver>);

    impl WorkerDriver for SharedStub {
        async fn select_worker(
            &self,
            request: &WorkerRequest,
        ) -> Result<WorkerHandle, DriverError> {
            if let Some(pane) = request.pane {
                return Ok(WorkerHandle {
                    id: pane.to_string(),
                    agent_type: "claude".into(),
                });
            }
            if self.0.workers.is_empty() {
                return Err(DriverError::NoWorker("no workers".into()));
            }
            self.0
                .workers
                .iter()
                .find(|id| !request.exclude.contains(*id))
                .map(|id| WorkerHandle {
                    id: id.clone(),
                    agent_type: "claude".into(),
                })
                .ok_or(DriverError::AllBusy)
        }

        async fn send_prompt(
            &self,
            worker: &WorkerHandle,
            prompt: &str,
        ) -> Result<(), DriverError> {
            if prompt.contains("PANIC") {
                panic!("worker exploded");
            }
            self.0
                .sent
                .lock()
                .unwrap()
                .push((worker.id.clone(), prompt.to_string()));
            let injected = self
                .0
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if injected || prompt.contains("FAIL") {
                return Err(DriverError::Send {
                    worker: worker.id.clone(),
                    message: "rejected".into(),
                });
            }
            let mut slow = self.0.slow.lock().unwrap();
            if prompt.contains("SLOW") {
                slow.insert(worker.id.clone());
            } else {
                slow.remove(&worker.id);
            }
            self.0
                .screens
                .lock()
                .unwrap()
                .entry(worker.id.clone())
                .or_default()
                .push_str(&format!("done: {prompt}\n"));
            Ok(())
        }

        async fn is_idle(&self, worker: &WorkerHandle) -> Result<bool, DriverError> {
            Ok(!self.0.slow.lock().unwrap().contains(&worker.id))
        }

        async fn capture_output(&self, worker: &WorkerHandle) -> Result<String, DriverError> {
            Ok(self
                .0
                .screens
                .lock()
                .unwrap()
                .get(&worker.id)
                .cloned()
                .unwrap_or_default())
        }
    }

    // -- fixtures -------------------------------------------------------------

    fn fast_config() -> ExecutorConfig {
        ExecutorConfig {
            session: "test".into(),
            default_step_timeout: Duration::from_secs(5),
            global_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(5),
            initial_debounce: Duration::ZERO,
            default_retry_delay: Duration::from_millis(1),
            ..ExecutorConfig::default()
        }
    }

    fn executor(stub: &Arc<StubDriver>) -> Executor {
        Executor::new(fast_config(), BoxWorkerDriver::new(SharedStub(Arc::clone(stub))))
    }

    fn prompt_step(id: &str, prompt: &str) -> Step {
        Step {
            id: id.into(),
            prompt: Some(prompt.into()),
            ..Default::default()
        }
    }

    fn after(mut step: Step, deps: &[&str]) -> Step {
        step.depends_on = deps.iter().map(|d| d.to_string()).collect();
        step
    }

    fn group(id: &str, action: ErrorAction, members: Vec<Step>) -> Step {
        Step {
            id: id.into(),
            on_error: Some(action),
            parallel: members,
            ..Default::default()
        }
    }

    fn workflow(steps: Vec<Step>) -> Workflow {
        Workflow {
            schema_version: "2.0".into(),
            name: "wf".into(),
            steps,
            ..Default::default()
        }
    }

    fn drain(rx: &mut broadcast::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    // -- error / result types ---------------------------------------------------

    #[test]
    fn executor_error_display() {
        let err = ExecutorError::StepFailed {
            step_id: "build".to_string(),
            error: "exit code 1".to_string(),
        };
        assert_eq!(err.to_string(), "step 'build' failed: exit code 1");

        let err = ExecutorError::WorkflowTimeout(Duration::from_secs(90));
        assert_eq!(err.to_string(), "workflow exceeded global timeout of 1m30s");

        let err = ExecutorError::Cancelled;
        assert_eq!(err.to_string(), "workflow cancelled");

        let err = ExecutorError::RunNotFound("run-x".into());
        assert_eq!(err.to_string(), "run not found: run-x");
    }

    #[test]
    fn run_id_format() {
        let id = generate_run_id();
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 4, "{id}");
        assert_eq!(parts[0], "run");
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 6);
        assert_eq!(parts[3].len(), 8);
        assert!(parts[3].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn truncate_prompt_flattens_and_cuts() {
        assert_eq!(truncate_prompt("a\nb\tc", 100), "a b c");
        let long = "x".repeat(150);
        let cut = truncate_prompt(&long, 100);
        assert_eq!(cut.chars().count(), 100);
        assert!(cut.ends_with("..."));
        assert_eq!(truncate_prompt(&"é".repeat(10), 5), "éé...");
    }

    #[test]
    fn config_from_engine_config() {
        let engine = EngineConfig {
            session: "fleet".into(),
            dry_run: true,
            ..EngineConfig::default()
        };
        let config = ExecutorConfig::from(&engine);
        assert_eq!(config.session, "fleet");
        assert!(config.dry_run);
        assert_eq!(config.default_step_timeout, Duration::from_secs(DEFAULT_STEP_TIMEOUT_SECS));
        assert_eq!(config.global_timeout, Duration::from_secs(DEFAULT_WORKFLOW_TIMEOUT_SECS));
        assert!(config.run_id.is_none());
    }

    // -- scheduling -------------------------------------------------------------

    #[tokio::test]
    async fn sequential_then_parallel_completes() {
        let stub = StubDriver::with_workers(&["1", "2"]);
        let exec = executor(&stub);
        let mut rx = exec.subscribe();
        let wf = workflow(vec![
            prompt_step("a", "hello"),
            after(prompt_step("b", "use ${steps.a.output}"), &["a"]),
            after(
                group(
                    "c",
                    ErrorAction::Fail,
                    vec![prompt_step("c1", "left"), prompt_step("c2", "right")],
                ),
                &["b"],
            ),
        ]);

        let result = exec.run(&wf, BTreeMap::new()).await;
        assert!(result.is_success(), "{:?}", result.error);
        let state = &result.state;
        assert_eq!(state.steps.len(), 4);
        assert!(state.steps.values().all(|r| r.status == ExecutionStatus::Completed));
        assert_eq!(state.groups["c"].status, ExecutionStatus::Completed);
        assert_eq!(state.groups["c"].output, "All 2 parallel steps completed");
        assert_eq!(state.steps["a"].output, "done: hello\n");
        assert!(state.finished_at.is_some());

        let prompts = stub.sent_prompts();
        assert_eq!(prompts[0], "hello");
        assert!(prompts[1].contains("done: hello"), "{prompts:?}");

        let events = drain(&mut rx);
        assert_eq!(events.first().map(|e| e.kind), Some(ProgressEventKind::WorkflowStart));
        let last = events.last().unwrap();
        assert_eq!(last.kind, ProgressEventKind::WorkflowComplete);
        assert_eq!(last.progress, 1.0);
        assert!(events.iter().any(|e| e.kind == ProgressEventKind::ParallelStart));
    }

    #[tokio::test]
    async fn parallel_members_never_share_a_worker() {
        let stub = StubDriver::with_workers(&["only"]);
        let exec = executor(&stub);
        let wf = workflow(vec![group(
            "g",
            ErrorAction::Fail,
            vec![prompt_step("m1", "one"), prompt_step("m2", "two")],
        )]);

        let result = exec.run(&wf, BTreeMap::new()).await;
        assert!(result.is_success(), "{:?}", result.error);
        // Serialized on the single worker, each member sees only its own output.
        assert_eq!(result.state.steps["m1"].output, "done: one\n");
        assert_eq!(result.state.steps["m2"].output, "done: two\n");
    }

    #[tokio::test]
    async fn dependency_errors_fail_before_dispatch() {
        let stub = StubDriver::with_workers(&["1"]);
        let exec = executor(&stub);
        let wf = workflow(vec![after(prompt_step("a", "hi"), &["ghost"])]);

        let result = exec.run(&wf, BTreeMap::new()).await;
        assert_eq!(result.state.status, ExecutionStatus::Failed);
        assert!(matches!(result.error, Some(ExecutorError::Dependency(_))));
        assert!(
            result
                .state
                .errors
                .iter()
                .any(|e| e.kind == ExecutionErrorKind::Dependency && e.fatal)
        );
        assert!(stub.sent_prompts().is_empty());
    }

    #[tokio::test]
    async fn var_defaults_and_overrides() {
        let stub = StubDriver::with_workers(&["1"]);
        let exec = executor(&stub);
        let mut wf = workflow(vec![prompt_step("a", "${vars.greeting} ${vars.name}")]);
        for (name, default) in [("greeting", "hi"), ("name", "nobody")] {
            wf.vars.insert(
                name.into(),
                panefleet_types::workflow::VarDef {
                    default: Some(Value::String(default.into())),
                    ..Default::default()
                },
            );
        }
        let overrides = BTreeMap::from([("name".to_string(), Value::String("ana".into()))]);

        let result = exec.run(&wf, overrides).await;
        assert!(result.is_success());
        assert_eq!(stub.sent_prompts(), vec!["hi ana".to_string()]);
    }

    // -- failures -----------------------------------------------------------------

    #[tokio::test]
    async fn retry_until_success_counts_attempts() {
        let stub = StubDriver::failing_first(&["1"], 2);
        let exec = executor(&stub);
        let mut rx = exec.subscribe();
        let mut step = prompt_step("a", "hello");
        step.on_error = Some(ErrorAction::Retry);
        step.retry_count = 2;

        let result = exec.run(&workflow(vec![step]), BTreeMap::new()).await;
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.state.steps["a"].attempts, 3);

        let retries = drain(&mut rx)
            .into_iter()
            .filter(|e| e.kind == ProgressEventKind::StepRetry)
            .count();
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn retry_exhausted_fails_run() {
        let stub = StubDriver::failing_first(&["1"], 10);
        let exec = executor(&stub);
        let mut step = prompt_step("a", "hello");
        step.on_error = Some(ErrorAction::Retry);
        step.retry_count = 1;

        let result = exec.run(&workflow(vec![step]), BTreeMap::new()).await;
        assert_eq!(result.state.status, ExecutionStatus::Failed);
        let a = &result.state.steps["a"];
        assert_eq!(a.status, ExecutionStatus::Failed);
        assert_eq!(a.attempts, 2);
        let error = a.error.as_ref().unwrap();
        assert_eq!(error.kind, StepErrorKind::AgentError);
        assert_eq!(error.attempt, 2);
        assert!(matches!(
            result.error,
            Some(ExecutorError::StepFailed { ref step_id, .. }) if step_id == "a"
        ));
    }

    #[tokio::test]
    async fn continue_keeps_going_after_failure() {
        let stub = StubDriver::with_workers(&["1"]);
        let exec = executor(&stub);
        let mut bad = prompt_step("a", "FAIL please");
        bad.on_error = Some(ErrorAction::Continue);
        let wf = workflow(vec![bad, after(prompt_step("b", "next"), &["a"])]);

        let result = exec.run(&wf, BTreeMap::new()).await;
        assert_eq!(result.state.status, ExecutionStatus::Completed);
        assert_eq!(result.state.steps["a"].status, ExecutionStatus::Failed);
        assert_eq!(result.state.steps["b"].status, ExecutionStatus::Completed);
        assert!(result.state.errors.iter().any(|e| !e.fatal && e.step_id.as_deref() == Some("a")));
    }

    #[tokio::test]
    async fn failure_stops_later_waves() {
        let stub = StubDriver::with_workers(&["1"]);
        let exec = executor(&stub);
        let wf = workflow(vec![
            prompt_step("a", "FAIL"),
            after(prompt_step("b", "never"), &["a"]),
        ]);

        let result = exec.run(&wf, BTreeMap::new()).await;
        assert_eq!(result.state.status, ExecutionStatus::Failed);
        assert!(!result.state.steps.contains_key("b"));
        assert_eq!(stub.sent_prompts(), vec!["FAIL".to_string()]);
    }

    #[tokio::test]
    async fn fail_fast_cancels_running_sibling() {
        let stub = StubDriver::with_workers(&["1", "2"]);
        let exec = executor(&stub);
        let wf = workflow(vec![group(
            "g",
            ErrorAction::FailFast,
            vec![prompt_step("slow", "SLOW work"), prompt_step("bad", "FAIL now")],
        )]);

        let result = exec.run(&wf, BTreeMap::new()).await;
        assert_eq!(result.state.status, ExecutionStatus::Failed);
        let group = &result.state.groups["g"];
        assert_eq!(group.status, ExecutionStatus::Failed);
        assert!(group.error.as_ref().unwrap().message.contains("fail_fast"));
        assert_eq!(result.state.steps["bad"].status, ExecutionStatus::Failed);
        assert_eq!(result.state.steps["slow"].status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn fail_fast_step_cancels_its_wave() {
        let stub = StubDriver::with_workers(&["1", "2"]);
        let exec = executor(&stub);
        let mut bad = prompt_step("a", "FAIL now");
        bad.on_error = Some(ErrorAction::FailFast);
        let mut slow = prompt_step("b", "SLOW work");
        slow.timeout = Some(Duration::from_secs(3));
        let wf = workflow(vec![bad, slow]);

        let started = Instant::now();
        let result = exec.run(&wf, BTreeMap::new()).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(result.state.status, ExecutionStatus::Failed);
        assert!(matches!(
            result.error,
            Some(ExecutorError::StepFailed { ref step_id, .. }) if step_id == "a"
        ));
        assert_eq!(result.state.steps["a"].status, ExecutionStatus::Failed);
        assert_eq!(result.state.steps["b"].status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn group_member_waits_for_sibling_dependency() {
        let stub = StubDriver::with_workers(&["1", "2"]);
        let exec = executor(&stub);
        let wf = workflow(vec![group(
            "g",
            ErrorAction::Fail,
            vec![
                after(prompt_step("m2", "use ${steps.m1.output}"), &["m1"]),
                prompt_step("m1", "first"),
            ],
        )]);

        let result = exec.run(&wf, BTreeMap::new()).await;
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.state.groups["g"].status, ExecutionStatus::Completed);
        let prompts = stub.sent_prompts();
        assert_eq!(prompts.len(), 2);
        assert_eq!(prompts[0], "first");
        assert!(prompts[1].starts_with("use done: first"), "{prompts:?}");
        assert!(result.state.steps["m2"].output.contains("use done: first"));
    }

    #[test]
    fn sibling_dependencies_follow_nested_steps() {
        let inner = group(
            "inner",
            ErrorAction::Fail,
            vec![prompt_step("x", "x"), after(prompt_step("y", "y"), &["a"])],
        );
        let outer = group(
            "g",
            ErrorAction::Fail,
            vec![
                prompt_step("a", "a"),
                inner,
                after(prompt_step("z", "z"), &["x", "outside"]),
            ],
        );

        let waits = sibling_dependencies(&outer);
        assert!(waits[0].is_empty());
        assert_eq!(waits[1], BTreeSet::from([0]));
        assert_eq!(waits[2], BTreeSet::from([1]));
    }

    #[tokio::test]
    async fn continue_group_reports_partial_success() {
        let stub = StubDriver::with_workers(&["1", "2"]);
        let exec = executor(&stub);
        let wf = workflow(vec![group(
            "g",
            ErrorAction::Continue,
            vec![prompt_step("ok", "fine"), prompt_step("bad", "FAIL")],
        )]);

        let result = exec.run(&wf, BTreeMap::new()).await;
        assert!(result.is_success(), "{:?}", result.error);
        let group = &result.state.groups["g"];
        assert_eq!(group.output, "Parallel group completed with 1/2 successful");
        let data = group.parsed_data.as_ref().unwrap();
        assert_eq!(data["bad"]["status"], "failed");
        assert_eq!(data["ok"]["status"], "completed");
    }

    #[tokio::test]
    async fn fail_group_waits_for_all_members() {
        let stub = StubDriver::with_workers(&["1", "2", "3"]);
        let exec = executor(&stub);
        let wf = workflow(vec![group(
            "g",
            ErrorAction::Fail,
            vec![
                prompt_step("bad1", "FAIL a"),
                prompt_step("bad2", "FAIL b"),
                prompt_step("ok", "fine"),
            ],
        )]);

        let result = exec.run(&wf, BTreeMap::new()).await;
        let group = &result.state.groups["g"];
        assert_eq!(group.error.as_ref().unwrap().message, "2 of 3 parallel steps failed");
        assert_eq!(result.state.steps["ok"].status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn step_timeout_while_waiting() {
        let stub = StubDriver::with_workers(&["1"]);
        let exec = executor(&stub);
        let mut step = prompt_step("a", "SLOW");
        step.timeout = Some(Duration::from_millis(30));

        let result = exec.run(&workflow(vec![step]), BTreeMap::new()).await;
        let error = result.state.steps["a"].error.clone().unwrap();
        assert_eq!(error.kind, StepErrorKind::Timeout);
        assert!(error.message.starts_with("timeout waiting for completion"));
    }

    #[tokio::test]
    async fn global_timeout_fails_run() {
        let stub = StubDriver::with_workers(&["1"]);
        let exec = executor(&stub);
        let mut wf = workflow(vec![prompt_step("a", "SLOW")]);
        wf.settings = WorkflowSettings {
            timeout: Some(Duration::from_millis(50)),
            ..Default::default()
        };

        let result = exec.run(&wf, BTreeMap::new()).await;
        assert_eq!(result.state.status, ExecutionStatus::Failed);
        assert!(matches!(result.error, Some(ExecutorError::WorkflowTimeout(_))));
        assert!(
            result
                .state
                .errors
                .iter()
                .any(|e| e.kind == ExecutionErrorKind::Timeout && e.fatal)
        );
        assert!(exec.active_runs().is_empty());
    }

    #[tokio::test]
    async fn panicking_step_is_recorded_as_crash() {
        let stub = StubDriver::with_workers(&["1"]);
        let exec = executor(&stub);

        let result = exec.run(&workflow(vec![prompt_step("a", "PANIC")]), BTreeMap::new()).await;
        assert_eq!(result.state.status, ExecutionStatus::Failed);
        let error = result.state.steps["a"].error.clone().unwrap();
        assert_eq!(error.kind, StepErrorKind::Crash);
    }

    #[tokio::test]
    async fn unknown_agent_is_routing_failure() {
        let stub = StubDriver::with_workers(&["1"]);
        let exec = executor(&stub);
        let mut step = prompt_step("a", "hi");
        step.agent = Some("mystery".into());

        let result = exec.run(&workflow(vec![step]), BTreeMap::new()).await;
        let error = result.state.steps["a"].error.clone().unwrap();
        assert_eq!(error.kind, StepErrorKind::Routing);
        assert!(error.message.contains("unknown agent type: mystery"));
    }

    // -- conditions -----------------------------------------------------------------

    #[tokio::test]
    async fn false_condition_skips_step() {
        let stub = StubDriver::with_workers(&["1"]);
        let exec = executor(&stub);
        let mut step = prompt_step("deploy", "ship it");
        step.when = Some("${vars.env} == prod".into());
        let vars = BTreeMap::from([("env".to_string(), Value::String("dev".into()))]);

        let result = exec.run(&workflow(vec![step]), vars).await;
        assert!(result.is_success());
        let deploy = &result.state.steps["deploy"];
        assert_eq!(deploy.status, ExecutionStatus::Skipped);
        assert_eq!(
            deploy.skip_reason.as_deref(),
            Some("condition '${vars.env} == prod' evaluated to false")
        );
        assert!(stub.sent_prompts().is_empty());
    }

    #[tokio::test]
    async fn condition_error_fails_step() {
        let stub = StubDriver::with_workers(&["1"]);
        let exec = executor(&stub);
        let mut step = prompt_step("a", "hi");
        step.when = Some("${vars.env} > 3".into());
        let vars = BTreeMap::from([("env".to_string(), Value::String("dev".into()))]);

        let result = exec.run(&workflow(vec![step]), vars).await;
        let error = result.state.steps["a"].error.clone().unwrap();
        assert_eq!(error.kind, StepErrorKind::Condition);
        assert!(error.message.starts_with("failed to evaluate when condition"));
    }

    #[tokio::test]
    async fn skipped_group_skips_members() {
        let stub = StubDriver::with_workers(&["1"]);
        let exec = executor(&stub);
        let mut g = group("g", ErrorAction::Fail, vec![prompt_step("m", "hi")]);
        g.when = Some("false".into());

        let result = exec.run(&workflow(vec![g]), BTreeMap::new()).await;
        assert!(result.is_success());
        assert_eq!(result.state.groups["g"].status, ExecutionStatus::Skipped);
        assert_eq!(result.state.steps["m"].status, ExecutionStatus::Skipped);
    }

    // -- outputs --------------------------------------------------------------------

    #[tokio::test]
    async fn output_var_publishes_raw_and_parsed() {
        let stub = StubDriver::with_workers(&["1"]);
        let exec = executor(&stub);
        let mut step = prompt_step("a", r#"{"ok": true}"#);
        step.output_var = Some("res".into());
        step.output_parse = OutputParse::new(ParseMode::Json);
        let wf = workflow(vec![
            step,
            after(
                prompt_step("b", "flag=${vars.res_parsed.ok} nested=${steps.a.output.ok}"),
                &["a"],
            ),
        ]);

        let result = exec.run(&wf, BTreeMap::new()).await;
        assert!(result.is_success(), "{:?}", result.error);
        let vars = &result.state.variables;
        assert_eq!(vars["res"], Value::String("done: {\"ok\": true}\n".into()));
        assert_eq!(vars["res_parsed"]["ok"], Value::Bool(true));
        assert_eq!(stub.sent_prompts()[1], "flag=true nested=true");
    }

    #[tokio::test]
    async fn parse_failure_is_only_a_warning() {
        let stub = StubDriver::with_workers(&["1"]);
        let exec = executor(&stub);
        let mut step = prompt_step("a", "no json here");
        step.output_parse = OutputParse::new(ParseMode::Json);

        let result = exec.run(&workflow(vec![step]), BTreeMap::new()).await;
        assert!(result.is_success());
        assert!(result.state.steps["a"].parsed_data.is_none());
        assert!(
            result
                .state
                .errors
                .iter()
                .any(|e| e.kind == ExecutionErrorKind::Parse && !e.fatal)
        );
    }

    #[tokio::test]
    async fn dry_run_never_touches_driver() {
        let stub = StubDriver::with_workers(&[]);
        let config = ExecutorConfig {
            dry_run: true,
            ..fast_config()
        };
        let exec = Executor::new(config, BoxWorkerDriver::new(SharedStub(Arc::clone(&stub))));

        let wf = workflow(vec![prompt_step("a", "line one\nline two")]);
        let result = exec.run(&wf, BTreeMap::new()).await;
        assert!(result.is_success());
        let a = &result.state.steps["a"];
        assert_eq!(a.output, "[DRY RUN] Would execute: line one line two");
        assert_eq!(a.pane_used.as_deref(), Some("dry-run-pane"));
        assert!(stub.sent_prompts().is_empty());
    }

    #[tokio::test]
    async fn prompt_file_is_read_relative_to_base_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("p.md"), "from file ${session}").unwrap();
        let stub = StubDriver::with_workers(&["1"]);
        let config = ExecutorConfig {
            base_dir: Some(dir.path().to_path_buf()),
            ..fast_config()
        };
        let exec = Executor::new(config, BoxWorkerDriver::new(SharedStub(Arc::clone(&stub))));
        let step = Step {
            id: "a".into(),
            prompt_file: Some("p.md".into()),
            ..Default::default()
        };
        let missing = Step {
            id: "b".into(),
            prompt_file: Some("missing.md".into()),
            on_error: Some(ErrorAction::Continue),
            ..Default::default()
        };

        let result = exec.run(&workflow(vec![step, missing]), BTreeMap::new()).await;
        assert_eq!(stub.sent_prompts(), vec!["from file test".to_string()]);
        let error = result.state.steps["b"].error.clone().unwrap();
        assert_eq!(error.kind, StepErrorKind::Prompt);
    }

    // -- loops ----------------------------------------------------------------------

    #[tokio::test]
    async fn loop_iterates_items_in_order() {
        let stub = StubDriver::with_workers(&["1"]);
        let exec = executor(&stub);
        let mut rx = exec.subscribe();
        let looped = Step {
            id: "each".into(),
            loop_config: Some(LoopConfig {
                items: "${vars.files}".into(),
                var_name: Some("file".into()),
                steps: vec![prompt_step("review", "review ${loop.file} (${loop.index})")],
                max_iterations: None,
            }),
            ..Default::default()
        };
        let vars = BTreeMap::from([("files".to_string(), json!(["a.rs", "b.rs"]))]);

        let result = exec.run(&workflow(vec![looped]), vars).await;
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(
            stub.sent_prompts(),
            vec!["review a.rs (0)".to_string(), "review b.rs (1)".to_string()]
        );
        assert_eq!(result.state.groups["each"].output, "Loop completed 2/2 iterations");
        assert!(!result.state.variables.contains_key("loop.file"));
        let iterations = drain(&mut rx)
            .into_iter()
            .filter(|e| e.kind == ProgressEventKind::LoopIteration)
            .count();
        assert_eq!(iterations, 2);
    }

    #[tokio::test]
    async fn loop_respects_max_iterations() {
        let stub = StubDriver::with_workers(&["1"]);
        let exec = executor(&stub);
        let looped = Step {
            id: "each".into(),
            loop_config: Some(LoopConfig {
                items: "files".into(),
                var_name: None,
                steps: vec![prompt_step("body", "item ${loop.item}")],
                max_iterations: Some(2),
            }),
            ..Default::default()
        };
        let vars = BTreeMap::from([("files".to_string(), json!([1, 2, 3, 4]))]);

        let result = exec.run(&workflow(vec![looped]), vars).await;
        assert!(result.is_success());
        assert_eq!(stub.sent_prompts().len(), 2);
    }

    // -- cancellation ---------------------------------------------------------------

    #[tokio::test]
    async fn external_token_cancels_run() {
        let stub = StubDriver::with_workers(&["1"]);
        let exec = executor(&stub);
        let wf = workflow(vec![prompt_step("a", "SLOW"), after(prompt_step("b", "next"), &["a"])]);
        let token = CancellationToken::new();

        let run = exec.run_with_cancel(&wf, BTreeMap::new(), token.clone());
        let (result, ()) = tokio::join!(run, async {
            tokio::time::sleep(Duration::from_millis(40)).await;
            token.cancel();
        });

        assert_eq!(result.state.status, ExecutionStatus::Cancelled);
        assert!(matches!(result.error, Some(ExecutorError::Cancelled)));
        assert_eq!(result.state.steps["a"].status, ExecutionStatus::Cancelled);
        assert!(!result.state.steps.contains_key("b"));
    }

    #[tokio::test]
    async fn cancellation_keeps_finished_steps() {
        let stub = StubDriver::with_workers(&["1"]);
        let exec = executor(&stub);
        let mut rx = exec.subscribe();
        let wf = workflow(vec![
            prompt_step("a", "hello"),
            after(prompt_step("b", "SLOW"), &["a"]),
            after(prompt_step("c", "never"), &["b"]),
        ]);
        let token = CancellationToken::new();

        let run = exec.run_with_cancel(&wf, BTreeMap::new(), token.clone());
        let (result, ()) = tokio::join!(run, async {
            while let Ok(event) = rx.recv().await {
                let is_b = event.step_id.as_deref() == Some("b");
                if event.kind == ProgressEventKind::StepStart && is_b {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        assert_eq!(result.state.status, ExecutionStatus::Cancelled);
        assert!(matches!(result.error, Some(ExecutorError::Cancelled)));
        let a = &result.state.steps["a"];
        assert_eq!(a.status, ExecutionStatus::Completed);
        assert_eq!(a.output, "done: hello\n");
        assert_eq!(result.state.steps["b"].status, ExecutionStatus::Cancelled);
        assert!(!result.state.steps.contains_key("c"));
        assert_eq!(stub.sent_prompts(), vec!["hello".to_string(), "SLOW".to_string()]);
    }

    #[tokio::test]
    async fn cancel_by_run_id() {
        let stub = StubDriver::with_workers(&["1"]);
        let config = ExecutorConfig {
            run_id: Some("run-fixed".into()),
            ..fast_config()
        };
        let exec = Executor::new(config, BoxWorkerDriver::new(SharedStub(Arc::clone(&stub))));
        let wf = workflow(vec![prompt_step("a", "SLOW")]);

        let (result, cancelled) = tokio::join!(exec.run(&wf, BTreeMap::new()), async {
            tokio::time::sleep(Duration::from_millis(40)).await;
            exec.cancel("run-fixed")
        });

        assert!(cancelled.is_ok());
        assert_eq!(result.state.run_id, "run-fixed");
        assert_eq!(result.state.status, ExecutionStatus::Cancelled);
        assert!(matches!(exec.cancel("run-fixed"), Err(ExecutorError::RunNotFound(_))));
    }

    // -- registry -------------------------------------------------------------------

    #[tokio::test]
    async fn registry_mirrors_run() {
        let stub = StubDriver::with_workers(&["1"]);
        let registry = Arc::new(PipelineRegistry::new());
        let exec = executor(&stub).with_registry(Arc::clone(&registry));
        let wf = workflow(vec![prompt_step("a", "hi"), after(prompt_step("b", "there"), &["a"])]);

        let result = exec.run(&wf, BTreeMap::new()).await;
        let execution = registry.get(&result.state.run_id).unwrap();
        assert_eq!(execution.status, ExecutionStatus::Completed);
        assert_eq!(execution.progress.total, 2);
        assert_eq!(execution.progress.completed, 2);
        assert!(execution.finished_at.is_some());
    }

    #[tokio::test]
    async fn registry_progress_includes_groups() {
        let stub = StubDriver::with_workers(&["1", "2"]);
        let registry = Arc::new(PipelineRegistry::new());
        let exec = executor(&stub).with_registry(Arc::clone(&registry));
        let wf = workflow(vec![
            prompt_step("a", "hi"),
            after(
                group(
                    "c",
                    ErrorAction::Fail,
                    vec![prompt_step("c1", "left"), prompt_step("c2", "right")],
                ),
                &["a"],
            ),
        ]);

        let result = exec.run(&wf, BTreeMap::new()).await;
        assert!(result.is_success(), "{:?}", result.error);
        let progress = registry.get(&result.state.run_id).unwrap().progress;
        assert_eq!(progress.total, 4);
        assert_eq!(progress.completed, 4);
        assert_eq!(progress.pending, 0);
        assert_eq!(progress.percent, 100.0);
    }
}
