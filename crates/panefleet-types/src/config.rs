//! Engine configuration types.
//!
//! `EngineConfig` represents the `config.toml` in the data directory. Every
//! field has a default so an empty file is valid.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the engine and the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Worker session the runs target.
    #[serde(default = "default_session")]
    pub session: String,

    /// Step timeout when a step declares none.
    #[serde(default = "default_step_timeout", with = "crate::duration::required")]
    pub default_step_timeout: Duration,

    /// Run timeout when the workflow declares none.
    #[serde(default = "default_global_timeout", with = "crate::duration::required")]
    pub global_timeout: Duration,

    /// Interval between idle checks while waiting on a worker.
    #[serde(default = "default_poll_interval", with = "crate::duration::required")]
    pub poll_interval: Duration,

    /// Pause after sending a prompt before the first idle check.
    #[serde(default = "default_initial_debounce", with = "crate::duration::required")]
    pub initial_debounce: Duration,

    /// Retry delay when a retrying step declares none.
    #[serde(default = "default_retry_delay", with = "crate::duration::required")]
    pub default_retry_delay: Duration,

    /// Buffer size of the progress broadcast channel.
    #[serde(default = "default_progress_capacity")]
    pub progress_capacity: usize,

    #[serde(default)]
    pub dry_run: bool,

    /// Directory scanned for workflow files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflows_dir: Option<PathBuf>,

    /// Local worker processes for the process driver.
    #[serde(default)]
    pub workers: Vec<WorkerSpec>,
}

fn default_session() -> String {
    "default".to_string()
}

fn default_step_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_global_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_initial_debounce() -> Duration {
    Duration::from_millis(500)
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_progress_capacity() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            session: default_session(),
            default_step_timeout: default_step_timeout(),
            global_timeout: default_global_timeout(),
            poll_interval: default_poll_interval(),
            initial_debounce: default_initial_debounce(),
            default_retry_delay: default_retry_delay(),
            progress_capacity: default_progress_capacity(),
            dry_run: false,
            workflows_dir: None,
            workers: Vec::new(),
        }
    }
}

/// A worker backed by a local command that reads the prompt on stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSpec {
    /// Pane-like identifier, e.g. `"1"` or `"reviewer"`.
    pub id: String,
    /// Agent type served (`claude`, `codex`, `gemini` or an alias).
    pub agent_type: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.session, "default");
        assert_eq!(config.default_step_timeout, Duration::from_secs(300));
        assert_eq!(config.global_timeout, Duration::from_secs(1800));
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.default_retry_delay, Duration::from_secs(5));
        assert!(!config.dry_run);
        assert!(config.workers.is_empty());
    }

    #[test]
    fn engine_config_deserialize_empty_uses_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config.session, "default");
        assert_eq!(config.progress_capacity, 256);
    }

    #[test]
    fn engine_config_deserialize_with_values() {
        let toml_str = r#"
session = "fleet"
default_step_timeout = "90s"
poll_interval = "250ms"

[[workers]]
id = "1"
agent_type = "claude"
command = "cat"

[[workers]]
id = "2"
agent_type = "codex"
command = "sh"
args = ["-c", "tr a-z A-Z"]
"#;
        let config: EngineConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.session, "fleet");
        assert_eq!(config.default_step_timeout, Duration::from_secs(90));
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.global_timeout, Duration::from_secs(1800));
        assert_eq!(config.workers.len(), 2);
        assert_eq!(config.workers[1].args, vec!["-c", "tr a-z A-Z"]);
    }

    #[test]
    fn engine_config_rejects_bad_duration() {
        let err = toml::from_str::<EngineConfig>("global_timeout = \"soon\"").unwrap_err();
        assert!(err.to_string().contains("soon"), "got: {err}");
    }
}
