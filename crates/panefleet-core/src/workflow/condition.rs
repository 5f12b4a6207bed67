//! `when` condition evaluation.
//!
//! A condition is first rendered through the [`Substitutor`], then evaluated
//! with this precedence, lowest first:
//!
//! 1. `OR` (short-circuit)
//! 2. `AND` (short-circuit)
//! 3. `NOT ` / `!` prefix
//! 4. `( ... )`
//! 5. one comparison: `>=`, `<=`, `!=`, `==`, `>`, `<`, ` contains `,
//!    tried in that order, or a bare truthiness test
//!
//! Logical operators are located outside quotes and parentheses. Because they
//! split the text before comparisons are parsed, `!a == b` negates the whole
//! comparison.

use super::substitution::{SubstitutionError, Substitutor};

/// Failure to evaluate a condition.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConditionError {
    #[error("variable substitution failed: {0}")]
    Substitution(#[from] SubstitutionError),

    #[error("cannot compare: {side} operand '{operand}' is not a number")]
    NotANumber { side: &'static str, operand: String },
}

/// Result of evaluating a condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionOutcome {
    /// `true` when the step should run.
    pub proceed: bool,
    pub reason: String,
}

/// Evaluates `when` expressions against a run's variables.
#[derive(Debug, Clone, Copy)]
pub struct ConditionEvaluator<'a> {
    substitutor: Substitutor<'a>,
}

impl<'a> ConditionEvaluator<'a> {
    pub fn new(substitutor: Substitutor<'a>) -> Self {
        Self { substitutor }
    }

    /// Substitute and evaluate `condition`. An empty condition proceeds.
    pub fn evaluate(&self, condition: &str) -> Result<ConditionOutcome, ConditionError> {
        if condition.trim().is_empty() {
            return Ok(ConditionOutcome {
                proceed: true,
                reason: "no condition".to_string(),
            });
        }

        let (substituted, error) = self.substitutor.substitute(condition);
        if let Some(err) = error {
            return Err(err.into());
        }

        let proceed = evaluate_expression(&substituted)?;
        Ok(ConditionOutcome {
            proceed,
            reason: format!("condition '{condition}' evaluated to {proceed}"),
        })
    }
}

/// Evaluate an already-substituted expression.
pub fn evaluate_expression(expr: &str) -> Result<bool, ConditionError> {
    if expr.trim().is_empty() {
        return Ok(false);
    }

    if let Some((left, right)) = split_logical(expr, "OR") {
        if evaluate_expression(left)? {
            return Ok(true);
        }
        return evaluate_expression(right);
    }

    if let Some((left, right)) = split_logical(expr, "AND") {
        if !evaluate_expression(left)? {
            return Ok(false);
        }
        return evaluate_expression(right);
    }

    let expr = expr.trim();

    if let Some(inner) = expr.strip_prefix("NOT ") {
        return Ok(!evaluate_expression(inner)?);
    }
    if let Some(inner) = expr.strip_prefix('!') {
        return Ok(!evaluate_expression(inner)?);
    }

    if let Some(inner) = strip_outer_parens(expr) {
        return evaluate_expression(inner);
    }

    evaluate_comparison(expr)
}

// ---------------------------------------------------------------------------
// Scanning
// ---------------------------------------------------------------------------

/// Byte offsets of characters outside string literals, with their paren
/// depth. Quote characters and parentheses themselves are not reported.
fn scan(expr: &str) -> Vec<(usize, i32)> {
    let bytes = expr.as_bytes();
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut quote: Option<char> = None;

    for (i, c) in expr.char_indices() {
        let escaped = i > 0 && bytes[i - 1] == b'\\';
        if let Some(q) = quote {
            if c == q && !escaped {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => quote = Some(c),
            '(' => depth += 1,
            ')' => depth -= 1,
            _ => out.push((i, depth)),
        }
    }
    out
}

/// Split on the first top-level ` OP ` or a trailing ` OP`.
fn split_logical<'e>(expr: &'e str, op: &str) -> Option<(&'e str, &'e str)> {
    let top_level: Vec<usize> = scan(expr)
        .into_iter()
        .filter(|(_, depth)| *depth == 0)
        .map(|(i, _)| i)
        .collect();

    let padded = format!(" {op} ");
    if let Some(&i) = top_level.iter().find(|&&i| expr[i..].starts_with(&padded)) {
        return Some((&expr[..i], &expr[i + padded.len()..]));
    }

    let trailing = format!(" {op}");
    let trimmed = expr.trim_end();
    if trimmed.ends_with(&trailing) {
        let i = trimmed.len() - trailing.len();
        if top_level.contains(&i) {
            return Some((&expr[..i], ""));
        }
    }
    None
}

/// `Some(inner)` when the whole expression is one parenthesized group.
fn strip_outer_parens(expr: &str) -> Option<&str> {
    if !(expr.starts_with('(') && expr.ends_with(')')) {
        return None;
    }
    let bytes = expr.as_bytes();
    let mut depth = 0i32;
    let mut quote: Option<u8> = None;
    for (i, &c) in bytes.iter().enumerate() {
        if let Some(q) = quote {
            if c == q && bytes.get(i.wrapping_sub(1)) != Some(&b'\\') {
                quote = None;
            }
            continue;
        }
        match c {
            b'"' | b'\'' => quote = Some(c),
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 {
                    return (i == bytes.len() - 1).then(|| &expr[1..i]);
                }
            }
            _ => {}
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Comparisons
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Comparison {
    GreaterEqual,
    LessEqual,
    NotEqual,
    Equal,
    Greater,
    Less,
    Contains,
}

const COMPARISONS: [(&str, Comparison); 7] = [
    (">=", Comparison::GreaterEqual),
    ("<=", Comparison::LessEqual),
    ("!=", Comparison::NotEqual),
    ("==", Comparison::Equal),
    (">", Comparison::Greater),
    ("<", Comparison::Less),
    (" contains ", Comparison::Contains),
];

fn evaluate_comparison(expr: &str) -> Result<bool, ConditionError> {
    let offsets: Vec<usize> = scan(expr).into_iter().map(|(i, _)| i).collect();

    for (token, comparison) in COMPARISONS {
        let Some(&idx) = offsets.iter().find(|&&i| expr[i..].starts_with(token)) else {
            continue;
        };
        let left = clean_value(&expr[..idx]);
        let right = clean_value(&expr[idx + token.len()..]);

        return match comparison {
            Comparison::Equal => Ok(left == right),
            Comparison::NotEqual => Ok(left != right),
            Comparison::Contains => Ok(left.contains(right)),
            numeric => {
                let (l, r) = numeric_pair(left, right)?;
                Ok(match numeric {
                    Comparison::GreaterEqual => l >= r,
                    Comparison::LessEqual => l <= r,
                    Comparison::Greater => l > r,
                    _ => l < r,
                })
            }
        };
    }

    Ok(is_truthy(expr))
}

fn numeric_pair(left: &str, right: &str) -> Result<(f64, f64), ConditionError> {
    let l = left.parse::<f64>().map_err(|_| ConditionError::NotANumber {
        side: "left",
        operand: left.to_string(),
    })?;
    let r = right.parse::<f64>().map_err(|_| ConditionError::NotANumber {
        side: "right",
        operand: right.to_string(),
    })?;
    Ok((l, r))
}

/// Trim and strip one layer of matching single or double quotes.
pub fn clean_value(s: &str) -> &str {
    let s = s.trim();
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        &s[1..s.len() - 1]
    } else {
        s
    }
}

/// Falsy: `""`, `false`, `0`, `no`, `null`, `nil`, `none`, `undefined`
/// (case-insensitive, after cleaning). Everything else is truthy.
pub fn is_truthy(value: &str) -> bool {
    let cleaned = clean_value(value).to_ascii_lowercase();
    !matches!(
        cleaned.as_str(),
        "" | "false" | "0" | "no" | "null" | "nil" | "none" | "undefined"
    )
}

/// Syntax lint for a condition: balanced parentheses and quotes.
pub fn validate_condition(condition: &str) -> Vec<String> {
    let mut issues = Vec::new();
    if condition.is_empty() {
        return issues;
    }

    let mut depth = 0i32;
    for c in condition.chars() {
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            _ => {}
        }
        if depth < 0 {
            issues.push("unbalanced parentheses: too many closing ')'".to_string());
            break;
        }
    }
    if depth > 0 {
        issues.push("unbalanced parentheses: missing closing ')'".to_string());
    }

    let bytes = condition.as_bytes();
    let (mut in_double, mut in_single) = (false, false);
    for (i, c) in condition.char_indices() {
        let escaped = i > 0 && bytes[i - 1] == b'\\';
        match c {
            '"' if !in_single && !escaped => in_double = !in_double,
            '\'' if !in_double && !escaped => in_single = !in_single,
            _ => {}
        }
    }
    if in_double {
        issues.push("unbalanced double quotes".to_string());
    }
    if in_single {
        issues.push("unbalanced single quotes".to_string());
    }
    issues
}
