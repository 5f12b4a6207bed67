//! Workflow definition parsing and validation.
//!
//! Parses YAML or TOML into the `Workflow` schema and checks the structural
//! rules a run relies on (unique ids, one body kind per step, one worker
//! selection method, a sound dependency graph) plus softer lints reported as
//! warnings (schema version drift, unknown agents, suspicious references).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use panefleet_types::error::{DependencyErrorKind, ParseError, ValidationReport};
use panefleet_types::workflow::{
    AgentType, ErrorAction, ParseMode, SCHEMA_VERSION, Step, VarType, Workflow,
};
use serde_json::Value;

use super::condition::validate_condition;
use super::dag::DependencyGraph;
use super::substitution::{references, validate_var_refs};

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse `content` as `format` (`yaml`, `yml` or `toml`).
pub fn parse_workflow(content: &str, format: &str) -> Result<Workflow, ParseError> {
    match format.to_ascii_lowercase().as_str() {
        "yaml" | "yml" => serde_yaml_ng::from_str(content).map_err(|e| {
            let mut err = ParseError::new(format!("YAML parse error: {e}"));
            if let Some(location) = e.location() {
                err = err.with_line(location.line());
            }
            err.with_hint("Check YAML syntax - indentation and colons matter")
        }),
        "toml" => toml::from_str(content).map_err(|e| {
            let mut err = ParseError::new(format!("TOML parse error: {}", e.message()));
            if let Some(span) = e.span() {
                err = err.with_line(line_of(content, span.start));
            }
            err.with_hint("Check TOML syntax - keys and values must be properly formatted")
        }),
        other => Err(ParseError::new(format!("unsupported format: {other}"))
            .with_hint("Use 'yaml' or 'toml'")),
    }
}

/// Read and parse a workflow file, choosing the format by extension.
pub fn load_workflow_file(path: &Path) -> Result<Workflow, ParseError> {
    let file = path.display().to_string();
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    if !matches!(ext.as_str(), "yaml" | "yml" | "toml") {
        return Err(ParseError::new(format!("unsupported file extension: .{ext}"))
            .with_file(file)
            .with_hint("Use .yaml, .yml, or .toml extension"));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ParseError::new(format!("failed to read file: {e}")).with_file(file.clone()))?;
    parse_workflow(&content, &ext).map_err(|e| e.with_file(file))
}

/// Load a workflow file and validate it.
pub fn load_and_validate(path: &Path) -> Result<(Workflow, ValidationReport), ParseError> {
    let workflow = load_workflow_file(path)?;
    let mut report = validate_workflow(&workflow);
    let file = path.display().to_string();
    for issue in report.errors.iter_mut().chain(report.warnings.iter_mut()) {
        issue.file.get_or_insert_with(|| file.clone());
    }
    Ok((workflow, report))
}

fn line_of(content: &str, offset: usize) -> usize {
    let end = offset.min(content.len());
    content.as_bytes()[..end].iter().filter(|b| **b == b'\n').count() + 1
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate `workflow`, collecting every problem rather than stopping early.
pub fn validate_workflow(workflow: &Workflow) -> ValidationReport {
    let mut report = ValidationReport::default();

    if workflow.schema_version.is_empty() {
        report.add_error(
            ParseError::at_field("schema_version", "schema_version is required")
                .with_hint(format!("Add schema_version: \"{SCHEMA_VERSION}\"")),
        );
    } else if workflow.schema_version != SCHEMA_VERSION {
        report.add_warning(
            ParseError::at_field(
                "schema_version",
                format!(
                    "schema version {} differs from current {SCHEMA_VERSION}",
                    workflow.schema_version
                ),
            )
            .with_hint("Workflow may use features not available in this version"),
        );
    }

    if workflow.name.is_empty() {
        report.add_error(
            ParseError::at_field("name", "name is required")
                .with_hint("Add a unique name for this workflow"),
        );
    }
    if workflow.steps.is_empty() {
        report.add_error(
            ParseError::at_field("steps", "at least one step is required")
                .with_hint("Add steps to define the workflow"),
        );
    }

    let mut fields: HashMap<String, String> = HashMap::new();
    let mut seen = HashSet::new();
    for (i, step) in workflow.steps.iter().enumerate() {
        validate_step(step, &format!("steps[{i}]"), &mut seen, &mut fields, &mut report);
    }

    validate_dependencies(workflow, &fields, &mut report);
    validate_references(workflow, &seen, &mut report);
    report
}

fn validate_step(
    step: &Step,
    field: &str,
    seen: &mut HashSet<String>,
    fields: &mut HashMap<String, String>,
    report: &mut ValidationReport,
) {
    let id_field = format!("{field}.id");
    if step.id.is_empty() {
        report.add_error(
            ParseError::at_field(&id_field, "step id is required")
                .with_hint("Add a unique id for this step"),
        );
    } else {
        if !is_valid_id(&step.id) {
            report.add_error(
                ParseError::at_field(&id_field, format!("invalid step id: {}", step.id))
                    .with_hint("Use alphanumeric characters, underscores, and hyphens only"),
            );
        }
        if !seen.insert(step.id.clone()) {
            report.add_error(
                ParseError::at_field(&id_field, format!("duplicate step id: {}", step.id))
                    .with_hint("Each step must have a unique id"),
            );
        }
        fields.entry(step.id.clone()).or_insert_with(|| field.to_string());
    }

    let has_prompt = step.has_prompt();
    let has_parallel = !step.parallel.is_empty();
    if has_prompt && has_parallel {
        report.add_error(
            ParseError::at_field(field, "step cannot have both prompt and parallel")
                .with_hint("Use prompt for single-agent steps, parallel for concurrent steps"),
        );
    }
    if (has_prompt || has_parallel) && step.loop_config.is_some() {
        report.add_error(
            ParseError::at_field(field, "step cannot combine loop with prompt or parallel")
                .with_hint("Move the loop body into loop.steps"),
        );
    }
    if !has_prompt && !has_parallel && step.loop_config.is_none() {
        report.add_error(
            ParseError::at_field(field, "step must have prompt, prompt_file, parallel, or loop")
                .with_hint("Add a prompt, parallel steps, or loop for this step"),
        );
    }

    let mut selectors = 0;
    if let Some(agent) = &step.agent {
        selectors += 1;
        if AgentType::normalize(agent).is_none() {
            report.add_warning(
                ParseError::at_field(
                    format!("{field}.agent"),
                    format!("unknown agent type: {agent}"),
                )
                .with_hint("Valid types: claude, codex, gemini (and aliases)"),
            );
        }
    }
    if step.pane.is_some() {
        selectors += 1;
    }
    if step.route.is_some() {
        selectors += 1;
    }
    if selectors > 1 {
        report.add_error(
            ParseError::at_field(field, "step can only use one of: agent, pane, route")
                .with_hint("Choose one agent selection method"),
        );
    }

    if let Some(path) = &step.prompt_file {
        let text = path.to_string_lossy();
        if text.is_empty() || text.contains('\0') {
            report.add_warning(ParseError::at_field(
                format!("{field}.prompt_file"),
                format!("prompt_file path may be invalid: {text}"),
            ));
        }
    }

    if step.on_error == Some(ErrorAction::Retry) && step.retry_count == 0 {
        report.add_warning(
            ParseError::at_field(
                format!("{field}.retry_count"),
                "on_error is retry but retry_count is 0",
            )
            .with_hint("Set retry_count > 0 for retry to work"),
        );
    }

    if step.output_parse.mode == ParseMode::Regex {
        let pattern_field = format!("{field}.output_parse.pattern");
        match step.output_parse.pattern.as_deref() {
            None | Some("") => report.add_error(ParseError::at_field(
                pattern_field,
                "regex output parsing requires a pattern",
            )),
            Some(pattern) => {
                if let Err(e) = regex::Regex::new(pattern) {
                    report.add_error(ParseError::at_field(
                        pattern_field,
                        format!("invalid regex pattern: {e}"),
                    ));
                }
            }
        }
    }

    if let Some(condition) = &step.when {
        for problem in validate_condition(condition) {
            report.add_error(ParseError::at_field(format!("{field}.when"), problem));
        }
    }

    for (j, member) in step.parallel.iter().enumerate() {
        validate_step(member, &format!("{field}.parallel[{j}]"), seen, fields, report);
    }

    if let Some(config) = &step.loop_config {
        if config.items.trim().is_empty() {
            report.add_error(
                ParseError::at_field(format!("{field}.loop.items"), "loop items is required")
                    .with_hint("Specify the variable to iterate over"),
            );
        }
        if config.steps.is_empty() {
            report.add_warning(ParseError::at_field(
                format!("{field}.loop.steps"),
                "loop has no steps",
            ));
        }
        for (j, body) in config.steps.iter().enumerate() {
            validate_step(body, &format!("{field}.loop.steps[{j}]"), seen, fields, report);
        }
    }
}

fn validate_dependencies(
    workflow: &Workflow,
    fields: &HashMap<String, String>,
    report: &mut ValidationReport,
) {
    let graph = DependencyGraph::build(workflow);
    for err in graph.validate() {
        let step_field = |id: Option<&String>| {
            id.and_then(|id| fields.get(id))
                .map(|f| format!("{f}.depends_on"))
                .unwrap_or_else(|| "depends_on".to_string())
        };
        let issue = match err.kind {
            DependencyErrorKind::Cycle => {
                let path = err
                    .message
                    .strip_prefix("circular dependency: ")
                    .unwrap_or(&err.message);
                ParseError::at_field("depends_on", format!("circular dependency detected: {path}"))
                    .with_hint("Remove one of the dependencies to break the cycle")
            }
            DependencyErrorKind::MissingDep => {
                ParseError::at_field(step_field(err.steps.first()), err.message.clone())
                    .with_hint("Check the step id or remove the dependency")
            }
            DependencyErrorKind::Unreachable | DependencyErrorKind::Unschedulable => {
                ParseError::at_field(step_field(err.steps.first()), err.message.clone())
            }
        };
        report.add_error(issue);
    }
}

const REFERENCE_TYPES_HINT: &str =
    "Valid types: vars, steps, env, loop, session, timestamp, run_id, workflow";

fn validate_references(
    workflow: &Workflow,
    step_ids: &HashSet<String>,
    report: &mut ValidationReport,
) {
    let declared: Vec<String> = workflow.vars.keys().cloned().collect();
    let check = |text: &str, field: String, report: &mut ValidationReport| {
        for (raw, path) in references(text) {
            let parts: Vec<&str> = path.split('.').collect();
            match parts[0] {
                "vars" if parts.len() < 2 => report.add_warning(
                    ParseError::at_field(&field, format!("incomplete variable reference: {raw}"))
                        .with_hint("Use ${vars.variable_name}"),
                ),
                "steps" if parts.len() < 3 => report.add_warning(
                    ParseError::at_field(&field, format!("incomplete step reference: {raw}"))
                        .with_hint("Use ${steps.step_id.output}"),
                ),
                "steps" if !step_ids.contains(parts[1]) => report.add_warning(ParseError::at_field(
                    &field,
                    format!("reference to unknown step: {}", parts[1]),
                )),
                "vars" | "steps" | "env" | "session" | "timestamp" | "run_id" | "workflow"
                | "loop" => {}
                _ => report.add_warning(
                    ParseError::at_field(&field, format!("unknown reference type: {raw}"))
                        .with_hint(REFERENCE_TYPES_HINT),
                ),
            }
        }
        for raw in validate_var_refs(text, &declared) {
            if raw.starts_with("${vars.") {
                report.add_warning(
                    ParseError::at_field(&field, format!("undeclared variable: {raw}"))
                        .with_hint("Declare it under vars or pass it with --var"),
                );
            }
        }
    };

    fn walk(steps: &[Step], prefix: &str, visit: &mut dyn FnMut(&str, String)) {
        for (i, step) in steps.iter().enumerate() {
            let field = format!("{prefix}[{i}]");
            if let Some(prompt) = &step.prompt {
                visit(prompt, format!("{field}.prompt"));
            }
            if let Some(when) = &step.when {
                visit(when, format!("{field}.when"));
            }
            walk(&step.parallel, &format!("{field}.parallel"), visit);
            if let Some(config) = &step.loop_config {
                visit(&config.items, format!("{field}.loop.items"));
                walk(&config.steps, &format!("{field}.loop.steps"), visit);
            }
        }
    }

    walk(&workflow.steps, "steps", &mut |text, field| check(text, field, report));
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

// ---------------------------------------------------------------------------
// Run variables
// ---------------------------------------------------------------------------

/// Parse a JSON object of variable overrides.
pub fn parse_vars_json(json: &str) -> Result<BTreeMap<String, Value>, ParseError> {
    match serde_json::from_str::<Value>(json) {
        Ok(Value::Object(map)) => Ok(map.into_iter().collect()),
        Ok(_) => Err(ParseError::new("invalid JSON for vars: expected an object")),
        Err(e) => Err(ParseError::new(format!("invalid JSON for vars: {e}"))),
    }
}

/// Split a `key=value` assignment.
pub fn parse_var_assignment(assignment: &str) -> Result<(String, String), ParseError> {
    match assignment.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(ParseError::new(format!("invalid variable assignment: {assignment}"))
            .with_hint("Use --var key=value")),
    }
}

/// Convert a string override to the variable's declared type.
pub fn coerce_var(raw: &str, var_type: Option<VarType>) -> Result<Value, String> {
    match var_type {
        None | Some(VarType::String) => Ok(Value::String(raw.to_string())),
        Some(VarType::Number) => {
            if let Ok(n) = raw.trim().parse::<i64>() {
                return Ok(Value::from(n));
            }
            raw.trim()
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("'{raw}' is not a number"))
        }
        Some(VarType::Boolean) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" | "on" => Ok(Value::Bool(true)),
            "false" | "no" | "0" | "off" => Ok(Value::Bool(false)),
            _ => Err(format!("'{raw}' is not a boolean")),
        },
        Some(VarType::Array) => match serde_json::from_str::<Value>(raw) {
            Ok(value @ Value::Array(_)) => Ok(value),
            _ => Ok(Value::Array(
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(|s| Value::String(s.to_string()))
                    .collect(),
            )),
        },
        Some(VarType::Object) => match serde_json::from_str::<Value>(raw) {
            Ok(value @ Value::Object(_)) => Ok(value),
            _ => Err(format!("'{raw}' is not a JSON object")),
        },
    }
}

/// Build run overrides from `key=value` assignments and an optional JSON
/// object, coercing assignments to declared types. JSON entries win.
pub fn resolve_run_vars(
    workflow: &Workflow,
    assignments: &[String],
    json: Option<&str>,
) -> Result<BTreeMap<String, Value>, ParseError> {
    let mut vars = BTreeMap::new();
    for assignment in assignments {
        let (key, raw) = parse_var_assignment(assignment)?;
        let var_type = workflow.vars.get(&key).and_then(|def| def.var_type);
        let value = coerce_var(&raw, var_type)
            .map_err(|e| ParseError::at_field(format!("vars.{key}"), e))?;
        vars.insert(key, value);
    }
    if let Some(json) = json {
        vars.extend(parse_vars_json(json)?);
    }
    Ok(vars)
}

/// Names of required variables with neither a default nor an override.
pub fn missing_required_vars(
    workflow: &Workflow,
    overrides: &BTreeMap<String, Value>,
) -> Vec<String> {
    workflow
        .vars
        .iter()
        .filter(|(name, def)| {
            def.required && def.default.is_none() && !overrides.contains_key(*name)
        })
        .map(|(name, _)| name.clone())
        .collect()
}
