//! Worker driver backed by local processes.
//!
//! Each configured [`WorkerSpec`] is a command that reads a prompt on stdin
//! and answers on stdout. Every `send_prompt` spawns the command once; its
//! output is appended to the worker's transcript, which plays the role of a
//! pane's scrollback for `capture_output`.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use panefleet_core::workflow::driver::{DriverError, WorkerDriver, WorkerHandle, WorkerRequest};
use panefleet_types::config::WorkerSpec;
use panefleet_types::workflow::{AgentType, RoutingStrategy};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Default)]
struct WorkerState {
    transcript: String,
    running: bool,
    dispatched: u64,
}

/// Drives a fixed set of local command workers.
#[derive(Debug)]
pub struct ProcessWorkerDriver {
    workers: Vec<WorkerSpec>,
    state: Arc<DashMap<String, WorkerState>>,
    cursor: AtomicUsize,
}

impl ProcessWorkerDriver {
    pub fn new(workers: Vec<WorkerSpec>) -> Self {
        let state = DashMap::new();
        for worker in &workers {
            state.insert(worker.id.clone(), WorkerState::default());
        }
        Self {
            workers,
            state: Arc::new(state),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn workers(&self) -> &[WorkerSpec] {
        &self.workers
    }

    fn spec(&self, id: &str) -> Result<&WorkerSpec, DriverError> {
        self.workers
            .iter()
            .find(|w| w.id == id)
            .ok_or_else(|| DriverError::Unavailable {
                worker: id.to_string(),
                message: "not configured".to_string(),
            })
    }

    fn handle(spec: &WorkerSpec) -> WorkerHandle {
        let agent_type = AgentType::normalize(&spec.agent_type)
            .map(|a| a.as_str().to_string())
            .unwrap_or_else(|| spec.agent_type.clone());
        WorkerHandle {
            id: spec.id.clone(),
            agent_type,
        }
    }

    fn is_running(&self, id: &str) -> bool {
        self.state.get(id).is_some_and(|s| s.running)
    }

    fn dispatched(&self, id: &str) -> u64 {
        self.state.get(id).map(|s| s.dispatched).unwrap_or(0)
    }

    /// Explicit pane: match by id, else by 1-based position.
    fn select_pane(&self, pane: u32) -> Result<WorkerHandle, DriverError> {
        let by_id = self.workers.iter().find(|w| w.id == pane.to_string());
        let by_index = (pane as usize)
            .checked_sub(1)
            .and_then(|i| self.workers.get(i));
        by_id
            .or(by_index)
            .map(Self::handle)
            .ok_or_else(|| DriverError::NoWorker(format!("pane {pane} is not configured")))
    }
}

impl WorkerDriver for ProcessWorkerDriver {
    async fn select_worker(&self, request: &WorkerRequest) -> Result<WorkerHandle, DriverError> {
        if let Some(pane) = request.pane {
            return self.select_pane(pane);
        }

        let matching: Vec<&WorkerSpec> = self
            .workers
            .iter()
            .filter(|w| match request.agent_type {
                Some(wanted) => AgentType::normalize(&w.agent_type) == Some(wanted),
                None => true,
            })
            .collect();
        if matching.is_empty() {
            let wanted = request
                .agent_type
                .map(|a| a.as_str().to_string())
                .unwrap_or_else(|| "any".to_string());
            return Err(DriverError::NoWorker(format!("no worker serves agent type {wanted}")));
        }

        let available: Vec<&WorkerSpec> = matching
            .into_iter()
            .filter(|w| !request.exclude.contains(&w.id))
            .collect();
        if available.is_empty() {
            return Err(DriverError::AllBusy);
        }

        let chosen = match request.route.unwrap_or(RoutingStrategy::FirstAvailable) {
            RoutingStrategy::FirstAvailable => available
                .iter()
                .find(|w| !self.is_running(&w.id))
                .unwrap_or(&available[0]),
            RoutingStrategy::LeastLoaded => available
                .iter()
                .min_by_key(|w| self.dispatched(&w.id))
                .unwrap_or(&available[0]),
            RoutingStrategy::RoundRobin => {
                let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % available.len();
                &available[idx]
            }
        };
        tracing::debug!(worker = %chosen.id, agent = %chosen.agent_type, "selected worker");
        Ok(Self::handle(chosen))
    }

    async fn send_prompt(&self, worker: &WorkerHandle, prompt: &str) -> Result<(), DriverError> {
        let spec = self.spec(&worker.id)?;
        let send_err = |message: String| DriverError::Send {
            worker: worker.id.clone(),
            message,
        };

        {
            let mut state = self.state.entry(worker.id.clone()).or_default();
            if state.running {
                return Err(send_err("worker is still processing a prompt".to_string()));
            }
            state.running = true;
            state.dispatched += 1;
        }

        let spawned = tokio::process::Command::new(&spec.command)
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(err) => {
                self.release(&worker.id);
                return Err(send_err(format!("failed to spawn '{}': {err}", spec.command)));
            }
        };

        if let Some(mut stdin) = child.stdin.take() {
            let written = stdin.write_all(prompt.as_bytes()).await;
            // A command that exits without reading its input is not a send failure.
            if let Err(err) = ignore_broken_pipe(written) {
                self.release(&worker.id);
                return Err(send_err(format!("failed to write prompt: {err}")));
            }
            // Closing stdin signals end of input.
            drop(stdin);
        }

        let state = Arc::clone(&self.state);
        let id = worker.id.clone();
        tokio::spawn(async move {
            let captured = match child.wait_with_output().await {
                Ok(output) => {
                    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                    if !output.status.success() {
                        text.push_str(&String::from_utf8_lossy(&output.stderr));
                        tracing::warn!(
                            worker = %id,
                            status = %output.status,
                            "worker process exited with failure"
                        );
                    }
                    text
                }
                Err(err) => {
                    tracing::warn!(worker = %id, "failed to collect worker output: {err}");
                    String::new()
                }
            };
            if let Some(mut s) = state.get_mut(&id) {
                s.transcript.push_str(&captured);
                if !captured.is_empty() && !captured.ends_with('\n') {
                    s.transcript.push('\n');
                }
                s.running = false;
            }
        });
        Ok(())
    }

    async fn is_idle(&self, worker: &WorkerHandle) -> Result<bool, DriverError> {
        self.state
            .get(&worker.id)
            .map(|s| !s.running)
            .ok_or_else(|| DriverError::Unavailable {
                worker: worker.id.clone(),
                message: "not configured".to_string(),
            })
    }

    async fn capture_output(&self, worker: &WorkerHandle) -> Result<String, DriverError> {
        self.state
            .get(&worker.id)
            .map(|s| s.transcript.clone())
            .ok_or_else(|| DriverError::Capture {
                worker: worker.id.clone(),
                message: "not configured".to_string(),
            })
    }
}

impl ProcessWorkerDriver {
    fn release(&self, id: &str) {
        if let Some(mut s) = self.state.get_mut(id) {
            s.running = false;
        }
    }
}

fn ignore_broken_pipe(result: std::io::Result<()>) -> std::io::Result<()> {
    match result {
        Err(err) if err.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
        other => other,
    }
}
