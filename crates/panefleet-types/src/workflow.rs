//! Workflow declaration types.
//!
//! A `Workflow` is what a YAML or TOML workflow file deserializes into. It is
//! immutable once loaded: the engine derives its own indices (dependency
//! graph, execution state) and never mutates the declaration.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Schema version understood by this engine.
pub const SCHEMA_VERSION: &str = "2.0";

// ---------------------------------------------------------------------------
// Workflow
// ---------------------------------------------------------------------------

/// A workflow declaration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Workflow {
    /// File format version (current: "2.0").
    #[serde(default)]
    pub schema_version: String,
    /// Unique workflow name; doubles as the workflow id of a run.
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Author-controlled version of the workflow itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Declared variables, addressable as `${vars.<name>}`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: BTreeMap<String, VarDef>,
    #[serde(default)]
    pub settings: WorkflowSettings,
    /// Top-level steps in declaration order.
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// A declared workflow variable.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct VarDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub var_type: Option<VarType>,
}

/// The declared type of a variable, used to coerce string overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum VarType {
    String,
    #[serde(alias = "int", alias = "integer", alias = "float")]
    Number,
    #[serde(alias = "bool")]
    Boolean,
    #[serde(alias = "list")]
    Array,
    #[serde(alias = "map")]
    Object,
}

/// Workflow-wide settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowSettings {
    /// Run-level timeout; the engine default applies when absent.
    #[serde(default, with = "crate::duration::option", skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub timeout: Option<Duration>,
    /// Default error action for steps that declare none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<ErrorAction>,
    #[serde(default)]
    pub notify_on_complete: bool,
    #[serde(default)]
    pub notify_on_error: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notify_channels: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mail_recipient: Option<String>,
}

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// One unit of work: a single prompt, a parallel group, or a loop.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct Step {
    /// Globally unique id (`[A-Za-z0-9_-]+`), nested steps included.
    #[serde(default)]
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Agent type (`claude`, `codex`, `gemini` or an alias).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Explicit pane index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pane: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<RoutingStrategy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_file: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<WaitMode>,
    #[serde(default, with = "crate::duration::option", skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub timeout: Option<Duration>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<ErrorAction>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retry_count: u32,
    #[serde(default, with = "crate::duration::option", skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub retry_delay: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_backoff: Option<BackoffMode>,

    /// Condition expression; the step is skipped when it evaluates false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_var: Option<String>,
    #[serde(default, skip_serializing_if = "OutputParse::is_passthrough")]
    pub output_parse: OutputParse,

    /// Sub-steps run concurrently as one group.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parallel: Vec<Step>,
    #[serde(rename = "loop", default, skip_serializing_if = "Option::is_none")]
    pub loop_config: Option<LoopConfig>,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

/// Structural kind of a step, derived from which body fields are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Prompt,
    Parallel,
    Loop,
}

impl Step {
    /// Whether the step sends a prompt (inline or from a file).
    pub fn has_prompt(&self) -> bool {
        self.prompt.as_deref().is_some_and(|p| !p.is_empty()) || self.prompt_file.is_some()
    }

    /// The step's body kind. Parallel wins over loop, loop over prompt.
    pub fn kind(&self) -> StepKind {
        if !self.parallel.is_empty() {
            StepKind::Parallel
        } else if self.loop_config.is_some() {
            StepKind::Loop
        } else {
            StepKind::Prompt
        }
    }

    /// Directly nested steps (parallel members or loop body).
    pub fn children(&self) -> impl Iterator<Item = &Step> {
        self.parallel
            .iter()
            .chain(self.loop_config.iter().flat_map(|l| l.steps.iter()))
    }

    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Loop iteration settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct LoopConfig {
    /// Reference to the list to iterate (`${vars.files}` or `vars.files`).
    pub items: String,
    /// Loop variable name; the item is published as `loop.<as>`.
    #[serde(rename = "as", default, skip_serializing_if = "Option::is_none")]
    pub var_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<Step>,
    /// Safety cap on iterations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
}

// ---------------------------------------------------------------------------
// Closed enumerations
// ---------------------------------------------------------------------------

/// How a step (or group) reacts to failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorAction {
    /// Stop the run; a group waits for every member before reporting.
    #[default]
    Fail,
    /// Cancel running siblings on the first failure.
    FailFast,
    /// Record the failure and keep going.
    Continue,
    /// Re-dispatch up to `retry_count` more times.
    Retry,
}

impl std::fmt::Display for ErrorAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorAction::Fail => "fail",
            ErrorAction::FailFast => "fail_fast",
            ErrorAction::Continue => "continue",
            ErrorAction::Retry => "retry",
        };
        f.write_str(s)
    }
}

/// Delay growth between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BackoffMode {
    #[default]
    None,
    Linear,
    Exponential,
}

/// When a dispatched step counts as finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum WaitMode {
    #[default]
    Completion,
    Idle,
    /// Sleep for the full timeout.
    Time,
    /// Fire and forget.
    None,
}

/// Worker routing strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingStrategy {
    LeastLoaded,
    FirstAvailable,
    RoundRobin,
}

impl std::fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RoutingStrategy::LeastLoaded => "least-loaded",
            RoutingStrategy::FirstAvailable => "first-available",
            RoutingStrategy::RoundRobin => "round-robin",
        };
        f.write_str(s)
    }
}

/// Canonical agent types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Claude,
    Codex,
    Gemini,
}

impl AgentType {
    /// Resolve an agent name or alias, case-insensitively.
    pub fn normalize(name: &str) -> Option<AgentType> {
        match name.trim().to_ascii_lowercase().as_str() {
            "claude" | "cc" | "claude-code" => Some(AgentType::Claude),
            "codex" | "cod" | "openai" => Some(AgentType::Codex),
            "gemini" | "gmi" | "google" => Some(AgentType::Gemini),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Claude => "claude",
            AgentType::Codex => "codex",
            AgentType::Gemini => "gemini",
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Output parsing
// ---------------------------------------------------------------------------

/// Output parsing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ParseMode {
    #[default]
    #[serde(alias = "")]
    None,
    FirstLine,
    Lines,
    Json,
    Yaml,
    Regex,
}

impl std::fmt::Display for ParseMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ParseMode::None => "none",
            ParseMode::FirstLine => "first_line",
            ParseMode::Lines => "lines",
            ParseMode::Json => "json",
            ParseMode::Yaml => "yaml",
            ParseMode::Regex => "regex",
        };
        f.write_str(s)
    }
}

/// How to turn a step's raw output into structured data.
///
/// Accepts either a bare mode string (`output_parse: json`) or a table
/// (`output_parse: { type: regex, pattern: "..." }`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, JsonSchema)]
pub struct OutputParse {
    #[serde(rename = "type")]
    pub mode: ParseMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl OutputParse {
    pub fn new(mode: ParseMode) -> Self {
        Self { mode, pattern: None }
    }

    pub fn regex(pattern: impl Into<String>) -> Self {
        Self {
            mode: ParseMode::Regex,
            pattern: Some(pattern.into()),
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.mode == ParseMode::None
    }
}

impl<'de> Deserialize<'de> for OutputParse {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Mode(ParseMode),
            Table {
                #[serde(rename = "type", default)]
                mode: ParseMode,
                #[serde(default)]
                pattern: Option<String>,
            },
        }

        Ok(match Repr::deserialize(deserializer)? {
            Repr::Mode(mode) => OutputParse { mode, pattern: None },
            Repr::Table { mode, pattern } => OutputParse { mode, pattern },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_YAML: &str = r#"
schema_version: "2.0"
name: review
vars:
  target:
    required: true
    type: string
  depth:
    default: 2
settings:
  timeout: 45m
  on_error: continue
steps:
  - id: analyze
    agent: cc
    prompt: "Analyze ${vars.target}"
    timeout: 5m
    output_parse: json
  - id: fanout
    depends_on: [analyze]
    on_error: fail_fast
    parallel:
      - id: lint
        route: least-loaded
        prompt: lint it
        output_parse:
          type: regex
          pattern: "(?P<count>\\d+) issues"
      - id: test
        pane: 2
        prompt: test it
        on_error: retry
        retry_count: 2
        retry_delay: 1s
        retry_backoff: exponential
  - id: each
    depends_on: [fanout]
    loop:
      items: "${vars.files}"
      as: file
      max_iterations: 10
      steps:
        - id: per_file
          prompt: "Review ${loop.file}"
"#;

    #[test]
    fn deserializes_full_workflow_from_yaml() {
        let wf: Workflow = serde_yaml_ng::from_str(SAMPLE_YAML).unwrap();
        assert_eq!(wf.schema_version, SCHEMA_VERSION);
        assert_eq!(wf.steps.len(), 3);
        assert_eq!(wf.settings.timeout, Some(Duration::from_secs(45 * 60)));
        assert_eq!(wf.settings.on_error, Some(ErrorAction::Continue));
        assert!(wf.vars["target"].required);
        assert_eq!(wf.vars["depth"].default, Some(serde_json::json!(2)));

        let analyze = &wf.steps[0];
        assert_eq!(analyze.kind(), StepKind::Prompt);
        assert_eq!(analyze.output_parse.mode, ParseMode::Json);
        assert_eq!(analyze.timeout, Some(Duration::from_secs(300)));

        let fanout = &wf.steps[1];
        assert_eq!(fanout.kind(), StepKind::Parallel);
        assert_eq!(fanout.on_error, Some(ErrorAction::FailFast));
        assert_eq!(fanout.parallel[0].route, Some(RoutingStrategy::LeastLoaded));
        assert_eq!(fanout.parallel[0].output_parse.mode, ParseMode::Regex);
        assert!(fanout.parallel[0].output_parse.pattern.is_some());
        assert_eq!(fanout.parallel[1].retry_backoff, Some(BackoffMode::Exponential));
        assert_eq!(fanout.parallel[1].retry_delay, Some(Duration::from_secs(1)));

        let each = &wf.steps[2];
        assert_eq!(each.kind(), StepKind::Loop);
        let lp = each.loop_config.as_ref().unwrap();
        assert_eq!(lp.var_name.as_deref(), Some("file"));
        assert_eq!(lp.max_iterations, Some(10));
        assert_eq!(each.children().count(), 1);
    }

    #[test]
    fn deserializes_workflow_from_toml() {
        let toml_str = r#"
schema_version = "2.0"
name = "simple"

[[steps]]
id = "one"
prompt = "hello"
wait = "none"

[[steps]]
id = "two"
prompt = "world"
depends_on = ["one"]
output_parse = { type = "lines" }
"#;
        let wf: Workflow = toml::from_str(toml_str).unwrap();
        assert_eq!(wf.steps[0].wait, Some(WaitMode::None));
        assert_eq!(wf.steps[1].depends_on, vec!["one".to_string()]);
        assert_eq!(wf.steps[1].output_parse.mode, ParseMode::Lines);
    }

    #[test]
    fn unknown_error_action_is_rejected_at_load() {
        let yaml = "name: x\nsteps:\n  - id: a\n    prompt: p\n    on_error: explode\n";
        let err = serde_yaml_ng::from_str::<Workflow>(yaml).unwrap_err();
        assert!(err.to_string().contains("explode"), "got: {err}");
    }

    #[test]
    fn agent_aliases_normalize() {
        assert_eq!(AgentType::normalize("cc"), Some(AgentType::Claude));
        assert_eq!(AgentType::normalize("Claude-Code"), Some(AgentType::Claude));
        assert_eq!(AgentType::normalize("openai"), Some(AgentType::Codex));
        assert_eq!(AgentType::normalize("gmi"), Some(AgentType::Gemini));
        assert_eq!(AgentType::normalize("llama"), None);
    }

    #[test]
    fn step_serialization_omits_defaults() {
        let step = Step {
            id: "a".into(),
            prompt: Some("p".into()),
            ..Default::default()
        };
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json, serde_json::json!({"id": "a", "prompt": "p"}));
    }
}
