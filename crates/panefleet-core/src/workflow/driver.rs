//! Worker driver port.
//!
//! The executor talks to workers only through [`WorkerDriver`]: pick a
//! worker, send it a prompt, poll whether it is idle, capture its recent
//! output. Implementations live in panefleet-infra (process workers) and in
//! tests (stub drivers).
//!
//! `WorkerDriver` uses RPITIT, so a blanket-implemented object-safe
//! [`WorkerDriverDyn`] plus a [`BoxWorkerDriver`] wrapper give runtime
//! selection and sharing across spawned tasks.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use panefleet_types::workflow::{AgentType, RoutingStrategy};

// ---------------------------------------------------------------------------
// Request / handle / error
// ---------------------------------------------------------------------------

/// What a step asks of the driver when it needs a worker.
///
/// Precedence: an explicit `pane` wins over `agent_type`, which narrows the
/// candidates `route` chooses among.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerRequest {
    pub agent_type: Option<AgentType>,
    pub pane: Option<u32>,
    pub route: Option<RoutingStrategy>,
    /// Worker ids already claimed by concurrently running steps.
    pub exclude: BTreeSet<String>,
}

/// A selected worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    pub id: String,
    pub agent_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    /// Candidates exist but every one is in the exclusion set.
    #[error("all matching workers are busy")]
    AllBusy,

    #[error("no suitable worker: {0}")]
    NoWorker(String),

    #[error("failed to send prompt to worker {worker}: {message}")]
    Send { worker: String, message: String },

    #[error("failed to capture output from worker {worker}: {message}")]
    Capture { worker: String, message: String },

    #[error("worker {worker} unavailable: {message}")]
    Unavailable { worker: String, message: String },
}

// ---------------------------------------------------------------------------
// WorkerDriver
// ---------------------------------------------------------------------------

pub trait WorkerDriver: Send + Sync {
    fn select_worker(
        &self,
        request: &WorkerRequest,
    ) -> impl Future<Output = Result<WorkerHandle, DriverError>> + Send;

    /// Deliver `prompt` followed by "enter".
    fn send_prompt(
        &self,
        worker: &WorkerHandle,
        prompt: &str,
    ) -> impl Future<Output = Result<(), DriverError>> + Send;

    /// Whether the worker has finished and is waiting for input.
    fn is_idle(
        &self,
        worker: &WorkerHandle,
    ) -> impl Future<Output = Result<bool, DriverError>> + Send;

    /// The worker's recent output (a scrollback capture).
    fn capture_output(
        &self,
        worker: &WorkerHandle,
    ) -> impl Future<Output = Result<String, DriverError>> + Send;
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe version of [`WorkerDriver`] with boxed futures.
pub trait WorkerDriverDyn: Send + Sync {
    fn select_worker_boxed<'a>(
        &'a self,
        request: &'a WorkerRequest,
    ) -> BoxFuture<'a, Result<WorkerHandle, DriverError>>;

    fn send_prompt_boxed<'a>(
        &'a self,
        worker: &'a WorkerHandle,
        prompt: &'a str,
    ) -> BoxFuture<'a, Result<(), DriverError>>;

    fn is_idle_boxed<'a>(
        &'a self,
        worker: &'a WorkerHandle,
    ) -> BoxFuture<'a, Result<bool, DriverError>>;

    fn capture_output_boxed<'a>(
        &'a self,
        worker: &'a WorkerHandle,
    ) -> BoxFuture<'a, Result<String, DriverError>>;
}

impl<T: WorkerDriver> WorkerDriverDyn for T {
    fn select_worker_boxed<'a>(
        &'a self,
        request: &'a WorkerRequest,
    ) -> BoxFuture<'a, Result<WorkerHandle, DriverError>> {
        Box::pin(self.select_worker(request))
    }

    fn send_prompt_boxed<'a>(
        &'a self,
        worker: &'a WorkerHandle,
        prompt: &'a str,
    ) -> BoxFuture<'a, Result<(), DriverError>> {
        Box::pin(self.send_prompt(worker, prompt))
    }

    fn is_idle_boxed<'a>(
        &'a self,
        worker: &'a WorkerHandle,
    ) -> BoxFuture<'a, Result<bool, DriverError>> {
        Box::pin(self.is_idle(worker))
    }

    fn capture_output_boxed<'a>(
        &'a self,
        worker: &'a WorkerHandle,
    ) -> BoxFuture<'a, Result<String, DriverError>> {
        Box::pin(self.capture_output(worker))
    }
}

/// Type-erased, cheaply clonable worker driver.
#[derive(Clone)]
pub struct BoxWorkerDriver {
    inner: Arc<dyn WorkerDriverDyn>,
}

impl BoxWorkerDriver {
    pub fn new<T: WorkerDriver + 'static>(driver: T) -> Self {
        Self {
            inner: Arc::new(driver),
        }
    }

    pub async fn select_worker(
        &self,
        request: &WorkerRequest,
    ) -> Result<WorkerHandle, DriverError> {
        self.inner.select_worker_boxed(request).await
    }

    pub async fn send_prompt(
        &self,
        worker: &WorkerHandle,
        prompt: &str,
    ) -> Result<(), DriverError> {
        self.inner.send_prompt_boxed(worker, prompt).await
    }

    pub async fn is_idle(&self, worker: &WorkerHandle) -> Result<bool, DriverError> {
        self.inner.is_idle_boxed(worker).await
    }

    pub async fn capture_output(&self, worker: &WorkerHandle) -> Result<String, DriverError> {
        self.inner.capture_output_boxed(worker).await
    }
}

impl std::fmt::Debug for BoxWorkerDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxWorkerDriver").finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Output diffing
// ---------------------------------------------------------------------------

/// Bytes of the earlier capture used to find the overlap with a later one.
const OVERLAP_WINDOW: usize = 100;

/// The part of `after` produced since `before` was captured.
///
/// Scrollback captures are windows over the same stream: when `before` is a
/// prefix of `after` the suffix is new; otherwise the tail of `before` is
/// located in `after` and everything past the overlap is new. Without any
/// overlap the whole of `after` is returned.
pub fn extract_new_output(before: &str, after: &str) -> String {
    if before.is_empty() {
        return after.to_string();
    }
    if after.is_empty() {
        return String::new();
    }
    if let Some(new) = after.strip_prefix(before) {
        return new.to_string();
    }

    let mut tail_start = before.len().saturating_sub(OVERLAP_WINDOW);
    while !before.is_char_boundary(tail_start) {
        tail_start += 1;
    }
    let tail = &before[tail_start..];
    if tail.is_empty() {
        return after.to_string();
    }

    let mut start = 0;
    while let Some(pos) = after[start..].find(tail) {
        let idx = start + pos;
        let end = idx + tail.len();
        if before.ends_with(&after[..end]) {
            return after[end..].to_string();
        }
        start = idx + 1;
        while !after.is_char_boundary(start) {
            start += 1;
        }
    }
    after.to_string()
}
