//! `${namespace.path | default}` template substitution.
//!
//! Templates are split by a single-pass tokenizer into literal text, escaped
//! references (`\${...}`, emitted verbatim without the backslash) and live
//! references. Live references are resolved against an `ExecutionState`:
//!
//! | Reference                    | Source                                        |
//! |------------------------------|-----------------------------------------------|
//! | `vars.<name>[.path]`         | run variables                                 |
//! | `steps.<id>.<field>[.path]`  | `steps.<id>.<field>` variable, then results   |
//! | `env.<NAME>`                 | process environment (unset is empty)          |
//! | `loop.<field>[.path]`        | `loop.<field>` variable                       |
//! | `session`, `run_id`, `timestamp`, `workflow` | run metadata                  |
//!
//! A reference that fails to resolve uses its default when one is given.
//! Otherwise the original `${...}` text stays in place and the first failure
//! is reported next to the rendered text.

use chrono::Utc;
use panefleet_types::duration::format_duration;
use panefleet_types::execution::ExecutionState;
use serde_json::Value;

use super::value::{render_value, resolve_path};

/// A reference that could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("variable substitution error for '{reference}': {message}")]
pub struct SubstitutionError {
    pub reference: String,
    pub message: String,
}

impl SubstitutionError {
    fn new(reference: &str, message: impl Into<String>) -> Self {
        Self {
            reference: reference.to_string(),
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<'a> {
    Text(&'a str),
    /// `${...}` text that was written as `\${...}`.
    Escaped(&'a str),
    /// A live `${expr}`; `raw` includes the delimiters.
    Reference { raw: &'a str, expr: &'a str },
}

fn tokenize(template: &str) -> Vec<Segment<'_>> {
    let bytes = template.as_bytes();
    let mut segments = Vec::new();
    let mut text_start = 0;
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && template[i + 1..].starts_with("${") {
            if text_start < i {
                segments.push(Segment::Text(&template[text_start..i]));
            }
            let end = template[i + 3..]
                .find('}')
                .map(|close| i + 3 + close + 1)
                .unwrap_or(bytes.len());
            segments.push(Segment::Escaped(&template[i + 1..end]));
            i = end;
            text_start = end;
            continue;
        }

        if bytes[i] == b'$' && bytes.get(i + 1) == Some(&b'{') {
            if let Some(close) = template[i + 2..].find('}').filter(|c| *c > 0) {
                if text_start < i {
                    segments.push(Segment::Text(&template[text_start..i]));
                }
                let end = i + 2 + close + 1;
                segments.push(Segment::Reference {
                    raw: &template[i..end],
                    expr: &template[i + 2..end - 1],
                });
                i = end;
                text_start = end;
                continue;
            }
        }

        i += 1;
    }

    if text_start < bytes.len() {
        segments.push(Segment::Text(&template[text_start..]));
    }
    segments
}

/// Split `expr` on the first `|` into a trimmed path and an optional default
/// with one layer of matching quotes removed.
pub fn parse_default(expr: &str) -> (&str, Option<&str>) {
    let Some((path, default)) = expr.split_once('|') else {
        return (expr.trim(), None);
    };
    let default = default.trim();
    let unquoted = if default.len() >= 2
        && ((default.starts_with('"') && default.ends_with('"'))
            || (default.starts_with('\'') && default.ends_with('\'')))
    {
        &default[1..default.len() - 1]
    } else {
        default
    };
    (path.trim(), Some(unquoted))
}

// ---------------------------------------------------------------------------
// Substitutor
// ---------------------------------------------------------------------------

/// Resolves references against one run's state.
#[derive(Debug, Clone, Copy)]
pub struct Substitutor<'a> {
    state: &'a ExecutionState,
    session: &'a str,
    workflow: &'a str,
}

impl<'a> Substitutor<'a> {
    pub fn new(state: &'a ExecutionState, session: &'a str, workflow: &'a str) -> Self {
        Self {
            state,
            session,
            workflow,
        }
    }

    /// Render `template`, leaving unresolved references in place.
    ///
    /// Returns the text and the first resolution failure, if any.
    pub fn substitute(&self, template: &str) -> (String, Option<SubstitutionError>) {
        let mut out = String::with_capacity(template.len());
        let mut first_error = None;

        for segment in tokenize(template) {
            match segment {
                Segment::Text(text) | Segment::Escaped(text) => out.push_str(text),
                Segment::Reference { raw, expr } => {
                    let (path, default) = parse_default(expr);
                    match (self.resolve(path), default) {
                        (Ok(value), _) => out.push_str(&render_value(&value)),
                        (Err(_), Some(default)) => out.push_str(default),
                        (Err(err), None) => {
                            first_error.get_or_insert(err);
                            out.push_str(raw);
                        }
                    }
                }
            }
        }

        (out, first_error)
    }

    /// Render `template`, failing on the first unresolved reference.
    pub fn substitute_strict(&self, template: &str) -> Result<String, SubstitutionError> {
        match self.substitute(template) {
            (text, None) => Ok(text),
            (_, Some(err)) => Err(err),
        }
    }

    /// Resolve a bare reference path such as `vars.user.name`.
    pub fn resolve(&self, path: &str) -> Result<Value, SubstitutionError> {
        let path = path.trim();
        let parts: Vec<&str> = path.split('.').collect();
        match parts.as_slice() {
            [""] => Err(SubstitutionError::new(path, "empty variable reference")),
            ["vars", rest @ ..] => self.resolve_vars(path, rest),
            ["steps", rest @ ..] => self.resolve_steps(path, rest),
            ["env", rest @ ..] => {
                let name = rest
                    .first()
                    .ok_or_else(|| SubstitutionError::new(path, "env requires a variable name"))?;
                Ok(Value::String(std::env::var(name).unwrap_or_default()))
            }
            ["loop", rest @ ..] => self.resolve_loop(path, rest),
            ["session"] => Ok(Value::String(self.session.to_string())),
            ["run_id"] => Ok(Value::String(self.state.run_id.clone())),
            ["timestamp"] => Ok(Value::String(Utc::now().to_rfc3339())),
            ["workflow"] => Ok(Value::String(self.workflow.to_string())),
            [namespace, ..] => Err(SubstitutionError::new(
                path,
                format!("unknown variable namespace: {namespace}"),
            )),
            [] => Err(SubstitutionError::new(path, "empty variable reference")),
        }
    }

    fn resolve_vars(&self, path: &str, parts: &[&str]) -> Result<Value, SubstitutionError> {
        let (name, rest) = parts
            .split_first()
            .ok_or_else(|| SubstitutionError::new(path, "vars requires a variable name"))?;
        let root = self
            .state
            .variables
            .get(*name)
            .ok_or_else(|| SubstitutionError::new(path, format!("undefined variable: {name}")))?;
        navigate(path, root, rest)
    }

    fn resolve_steps(&self, path: &str, parts: &[&str]) -> Result<Value, SubstitutionError> {
        let [step_id, field, rest @ ..] = parts else {
            return Err(SubstitutionError::new(path, "steps requires step ID and field"));
        };

        let flat_key = format!("steps.{step_id}.{field}");
        // A published raw-text output has no fields; nested paths go to the
        // parsed data on the result instead.
        if let Some(value) = self.state.variables.get(&flat_key) {
            if rest.is_empty() || !value.is_string() {
                return navigate(path, value, rest);
            }
        }

        let result = self
            .state
            .result(step_id)
            .ok_or_else(|| SubstitutionError::new(path, format!("step not found: {step_id}")))?;

        let no_data = || SubstitutionError::new(path, format!("step {step_id} has no parsed data"));
        match *field {
            "output" if rest.is_empty() => Ok(Value::String(result.output.clone())),
            "output" | "data" => {
                let data = result.parsed_data.as_ref().ok_or_else(no_data)?;
                navigate(path, data, rest)
            }
            "pane" => Ok(Value::String(result.pane_used.clone().unwrap_or_default())),
            "duration" => Ok(Value::String(
                result
                    .duration()
                    .map(format_duration)
                    .unwrap_or_else(|| "0s".to_string()),
            )),
            "status" => Ok(Value::String(result.status.to_string())),
            "agent" => Ok(Value::String(result.agent_type.clone().unwrap_or_default())),
            other => Err(SubstitutionError::new(path, format!("unknown step field: {other}"))),
        }
    }

    fn resolve_loop(&self, path: &str, parts: &[&str]) -> Result<Value, SubstitutionError> {
        let (field, rest) = parts
            .split_first()
            .ok_or_else(|| SubstitutionError::new(path, "loop requires a field name"))?;
        let value = self
            .state
            .variables
            .get(&format!("loop.{field}"))
            .ok_or_else(|| {
                SubstitutionError::new(path, format!("loop variable not set: {field}"))
            })?;
        navigate(path, value, rest)
    }
}

fn navigate(path: &str, root: &Value, rest: &[&str]) -> Result<Value, SubstitutionError> {
    resolve_path(root, rest)
        .cloned()
        .map_err(|e| SubstitutionError::new(path, e.to_string()))
}

// ---------------------------------------------------------------------------
// State helpers
// ---------------------------------------------------------------------------

/// Install loop variables for one iteration: `loop.<var_name>`, `loop.item`,
/// `loop.index`, `loop.count`, `loop.first`, `loop.last`.
pub fn set_loop_vars(
    state: &mut ExecutionState,
    var_name: &str,
    item: Value,
    index: usize,
    total: usize,
) {
    let vars = &mut state.variables;
    vars.insert(format!("loop.{var_name}"), item.clone());
    vars.insert("loop.item".to_string(), item);
    vars.insert("loop.index".to_string(), Value::from(index));
    vars.insert("loop.count".to_string(), Value::from(total));
    vars.insert("loop.first".to_string(), Value::Bool(index == 0));
    vars.insert("loop.last".to_string(), Value::Bool(index + 1 == total));
}

/// Remove the variables installed by [`set_loop_vars`].
pub fn clear_loop_vars(state: &mut ExecutionState, var_name: &str) {
    let vars = &mut state.variables;
    vars.remove(&format!("loop.{var_name}"));
    for key in ["loop.item", "loop.index", "loop.count", "loop.first", "loop.last"] {
        vars.remove(key);
    }
}

/// Publish a step's output as `steps.<id>.output` and, when present, its
/// parsed data as `steps.<id>.data`.
pub fn store_step_output(
    state: &mut ExecutionState,
    step_id: &str,
    output: &str,
    parsed: Option<&Value>,
) {
    state
        .variables
        .insert(format!("steps.{step_id}.output"), Value::String(output.to_string()));
    if let Some(data) = parsed {
        state
            .variables
            .insert(format!("steps.{step_id}.data"), data.clone());
    }
}

/// Every live `${...}` reference in `template`, as `(raw, path)` pairs.
pub fn references(template: &str) -> Vec<(&str, &str)> {
    tokenize(template)
        .into_iter()
        .filter_map(|segment| match segment {
            Segment::Reference { raw, expr } => Some((raw, parse_default(expr).0)),
            _ => None,
        })
        .collect()
}

/// Return the references in `template` that cannot be valid: unknown
/// namespaces, and `vars.<name>` where `name` is not in `available`.
///
/// `available` entries may be bare names or `vars.<name>`. Built-in
/// namespaces and `steps.*` are not checked here.
pub fn validate_var_refs(template: &str, available: &[String]) -> Vec<String> {
    let mut invalid = Vec::new();
    for (raw, path) in references(template) {
        let mut parts = path.split('.');
        match parts.next().unwrap_or_default() {
            "env" | "session" | "run_id" | "timestamp" | "workflow" | "loop" | "steps" => {}
            "vars" => {
                if let Some(name) = parts.next() {
                    let qualified = format!("vars.{name}");
                    if !available.iter().any(|v| v == name || *v == qualified) {
                        invalid.push(raw.to_string());
                    }
                }
            }
            _ => invalid.push(raw.to_string()),
        }
    }
    invalid
}
