//! Step output parsing.
//!
//! Raw worker output is trimmed, then converted according to the step's
//! [`OutputParse`] declaration.

use panefleet_types::workflow::{OutputParse, ParseMode};
use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum OutputParseError {
    #[error("no JSON object or array found in output")]
    NoJson,

    #[error("failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("regex pattern is required")]
    MissingPattern,

    #[error("invalid regex pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Parse `output` per `parse`. Passthrough mode returns the trimmed text.
pub fn parse_output(output: &str, parse: &OutputParse) -> Result<Value, OutputParseError> {
    let output = output.trim();
    match parse.mode {
        ParseMode::None => Ok(Value::String(output.to_string())),
        ParseMode::FirstLine => Ok(Value::String(first_line(output).to_string())),
        ParseMode::Lines => Ok(Value::Array(
            non_blank_lines(output)
                .map(|l| Value::String(l.to_string()))
                .collect(),
        )),
        ParseMode::Json => parse_json(output),
        ParseMode::Yaml => Ok(serde_yaml_ng::from_str::<Value>(output)?),
        ParseMode::Regex => parse_regex(output, parse.pattern.as_deref().unwrap_or_default()),
    }
}

fn non_blank_lines(output: &str) -> impl Iterator<Item = &str> {
    output.lines().map(str::trim).filter(|l| !l.is_empty())
}

fn first_line(output: &str) -> &str {
    non_blank_lines(output).next().unwrap_or_default()
}

fn parse_json(output: &str) -> Result<Value, OutputParseError> {
    let start = output.find(['{', '[']).ok_or(OutputParseError::NoJson)?;
    let candidate = &output[start..];

    match serde_json::from_str::<Value>(candidate) {
        Ok(value) => Ok(value),
        Err(first_err) => serde_json::from_str::<Value>(extract_json_block(candidate))
            .map_err(|_| OutputParseError::Json(first_err)),
    }
}

/// The balanced `{...}` or `[...]` block at the start of `s`, honoring
/// string literals and backslash escapes. Returns `s` unchanged when no
/// balanced block closes.
pub fn extract_json_block(s: &str) -> &str {
    let bytes = s.as_bytes();
    let (open, close) = match bytes.first() {
        Some(b'{') => (b'{', b'}'),
        Some(b'[') => (b'[', b']'),
        _ => return s,
    };

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &c) in bytes.iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        if in_string {
            match c {
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        if c == b'"' {
            in_string = true;
        } else if c == open {
            depth += 1;
        } else if c == close {
            depth = depth.saturating_sub(1);
            if depth == 0 {
                return &s[..=i];
            }
        }
    }
    s
}

fn parse_regex(output: &str, pattern: &str) -> Result<Value, OutputParseError> {
    if pattern.is_empty() {
        return Err(OutputParseError::MissingPattern);
    }
    let re = regex::Regex::new(pattern)?;

    let Some(caps) = re.captures(output) else {
        return Ok(Value::Null);
    };
    let text = |m: Option<regex::Match<'_>>| {
        Value::String(m.map(|m| m.as_str()).unwrap_or_default().to_string())
    };

    let named: Vec<&str> = re.capture_names().flatten().collect();
    if !named.is_empty() {
        let map: Map<String, Value> = named
            .into_iter()
            .map(|name| (name.to_string(), text(caps.name(name))))
            .collect();
        return Ok(Value::Object(map));
    }

    if caps.len() == 1 {
        return Ok(text(caps.get(0)));
    }
    Ok(Value::Array((1..caps.len()).map(|i| text(caps.get(i))).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(output: &str, mode: ParseMode) -> Value {
        parse_output(output, &OutputParse::new(mode)).unwrap()
    }

    #[test]
    fn passthrough_trims() {
        assert_eq!(parse("  hello world \n", ParseMode::None), json!("hello world"));
    }

    #[test]
    fn first_line_skips_blank_lines() {
        assert_eq!(parse("\n\n  first \nsecond", ParseMode::FirstLine), json!("first"));
        assert_eq!(parse("   ", ParseMode::FirstLine), json!(""));
    }

    #[test]
    fn lines_drops_blanks_and_keeps_order() {
        assert_eq!(
            parse("a\n\n b \r\nc\n", ParseMode::Lines),
            json!(["a", "b", "c"])
        );
    }

    #[test]
    fn json_with_surrounding_text() {
        let out = "Here is the result:\n{\"count\": 3, \"ok\": true}\nDone.";
        assert_eq!(parse(out, ParseMode::Json), json!({"count": 3, "ok": true}));
    }

    #[test]
    fn json_array_before_object() {
        let out = "items: [1, 2, {\"a\": 1}] trailing";
        assert_eq!(parse(out, ParseMode::Json), json!([1, 2, {"a": 1}]));
    }

    #[test]
    fn json_block_ignores_braces_in_strings() {
        let out = r#"{"msg": "close } and \" quote", "n": 1} extra }"#;
        assert_eq!(
            parse(out, ParseMode::Json),
            json!({"msg": "close } and \" quote", "n": 1})
        );
    }

    #[test]
    fn json_missing_is_error() {
        let err =
            parse_output("no structure here", &OutputParse::new(ParseMode::Json)).unwrap_err();
        assert!(matches!(err, OutputParseError::NoJson));
    }

    #[test]
    fn json_unbalanced_is_error() {
        let err = parse_output("{\"a\": ", &OutputParse::new(ParseMode::Json)).unwrap_err();
        assert!(err.to_string().starts_with("failed to parse JSON"), "got: {err}");
    }

    #[test]
    fn yaml_whole_text() {
        let out = "name: demo\ncount: 2\ntags:\n  - x\n  - y\n";
        assert_eq!(
            parse(out, ParseMode::Yaml),
            json!({"name": "demo", "count": 2, "tags": ["x", "y"]})
        );
    }

    #[test]
    fn regex_named_groups_become_map() {
        let parse = OutputParse::regex(r"(?P<passed>\d+) passed, (?P<failed>\d+) failed");
        let value = parse_output("tests: 12 passed, 1 failed", &parse).unwrap();
        assert_eq!(value, json!({"passed": "12", "failed": "1"}));
    }

    #[test]
    fn regex_positional_groups_become_list() {
        let parse = OutputParse::regex(r"(\w+)=(\d+)");
        assert_eq!(parse_output("x=10", &parse).unwrap(), json!(["x", "10"]));
    }

    #[test]
    fn regex_without_groups_returns_whole_match() {
        let parse = OutputParse::regex(r"v\d+\.\d+");
        assert_eq!(parse_output("release v1.4 ready", &parse).unwrap(), json!("v1.4"));
    }

    #[test]
    fn regex_no_match_is_null() {
        let parse = OutputParse::regex(r"\d+");
        assert_eq!(parse_output("none", &parse).unwrap(), Value::Null);
    }

    #[test]
    fn regex_requires_valid_pattern() {
        let missing = OutputParse::new(ParseMode::Regex);
        assert!(matches!(
            parse_output("x", &missing).unwrap_err(),
            OutputParseError::MissingPattern
        ));
        let bad = OutputParse::regex("(unclosed");
        assert!(matches!(
            parse_output("x", &bad).unwrap_err(),
            OutputParseError::InvalidPattern(_)
        ));
    }

    #[test]
    fn extract_block_without_close_returns_input() {
        assert_eq!(extract_json_block("{\"a\": 1"), "{\"a\": 1");
        assert_eq!(extract_json_block("plain"), "plain");
    }
}
