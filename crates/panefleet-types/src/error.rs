use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// ParseError / ValidationReport
// ---------------------------------------------------------------------------

/// A located problem in a workflow declaration.
///
/// Renders as `file:line N:field: message`, omitting absent parts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{}", self.render())]
pub struct ParseError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl ParseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn at_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: Some(field.into()),
            ..Self::new(message)
        }
    }

    pub fn with_file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(file.into());
        self
    }

    pub fn with_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    fn render(&self) -> String {
        let mut parts = Vec::new();
        if let Some(file) = &self.file {
            parts.push(file.clone());
        }
        if let Some(line) = self.line.filter(|l| *l > 0) {
            parts.push(format!("line {line}"));
        }
        if let Some(field) = &self.field {
            parts.push(field.clone());
        }
        if parts.is_empty() {
            self.message.clone()
        } else {
            format!("{}: {}", parts.join(":"), self.message)
        }
    }
}

/// Outcome of validating a workflow declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ParseError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<ParseError>,
}

impl Default for ValidationReport {
    fn default() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }
}

impl ValidationReport {
    pub fn add_error(&mut self, error: ParseError) {
        self.valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ParseError) {
        self.warnings.push(warning);
    }
}

// ---------------------------------------------------------------------------
// DependencyError
// ---------------------------------------------------------------------------

/// Structural dependency problem kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyErrorKind {
    MissingDep,
    Cycle,
    Unreachable,
    Unschedulable,
}

impl std::fmt::Display for DependencyErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DependencyErrorKind::MissingDep => "missing_dep",
            DependencyErrorKind::Cycle => "cycle",
            DependencyErrorKind::Unreachable => "unreachable",
            DependencyErrorKind::Unschedulable => "unschedulable",
        };
        f.write_str(s)
    }
}

/// A structural dependency error naming the offending step ids.
///
/// For `missing_dep` the ids are `[step, missing dependency]`; for `cycle`
/// they are the cycle members.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct DependencyError {
    #[serde(rename = "type")]
    pub kind: DependencyErrorKind,
    pub steps: Vec<String>,
    pub message: String,
}
