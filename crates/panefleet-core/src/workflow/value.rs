//! Path navigation and canonical text rendering over `serde_json::Value`.
//!
//! `Value` is the engine's dynamic variant for variable contents, parsed
//! output and loop items (null, bool, number, string, list, map).

use serde_json::Value;

/// Failure to navigate a value by path.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("path not found: '{segment}' in '{path}'")]
    NotFound { path: String, segment: String },

    #[error("index error: '{segment}' in '{path}': {reason}")]
    Index {
        path: String,
        segment: String,
        reason: String,
    },
}

/// Navigate `value` by pre-split path segments.
///
/// Maps are indexed by exact key; lists by numeric index. Scalars cannot be
/// navigated into. No coercion is applied (a map with key `"0"` is looked up
/// by key, a list is never looked up by name).
pub fn resolve_path<'a, S: AsRef<str>>(
    value: &'a Value,
    segments: &[S],
) -> Result<&'a Value, PathError> {
    let full = || {
        segments
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join(".")
    };

    let mut current = value;
    for segment in segments {
        let segment = segment.as_ref();
        current = match current {
            Value::Object(map) => map.get(segment).ok_or_else(|| PathError::NotFound {
                path: full(),
                segment: segment.to_string(),
            })?,
            Value::Array(items) => {
                let index: usize = segment.parse().map_err(|_| PathError::Index {
                    path: full(),
                    segment: segment.to_string(),
                    reason: "not a numeric index".to_string(),
                })?;
                items.get(index).ok_or_else(|| PathError::Index {
                    path: full(),
                    segment: segment.to_string(),
                    reason: format!("out of range (len {})", items.len()),
                })?
            }
            _ => {
                return Err(PathError::NotFound {
                    path: full(),
                    segment: segment.to_string(),
                });
            }
        };
    }
    Ok(current)
}

/// Navigate `value` by a dotted path (`"a.b.0.c"`). An empty path returns
/// the value itself.
pub fn resolve_dotted<'a>(value: &'a Value, path: &str) -> Result<&'a Value, PathError> {
    if path.is_empty() {
        return Ok(value);
    }
    let segments: Vec<&str> = path.split('.').collect();
    resolve_path(value, &segments)
}

/// Render a value as substitution text.
///
/// Null is empty, booleans and numbers use their plain form (floats never in
/// exponent notation), strings are raw, lists and maps are compact JSON.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else {
                n.as_f64().map(|f| f.to_string()).unwrap_or_else(|| n.to_string())
            }
        }
        Value::String(s) => s.clone(),
        Value::Array(_) | Value::Object(_) => serde_json::to_string(value).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "user": {"name": "Alice", "roles": ["admin", "dev"]},
            "items": [{"id": 1}, {"id": 2}],
            "0": "zero-key"
        })
    }

    #[test]
    fn navigates_maps_and_lists() {
        let v = sample();
        assert_eq!(resolve_dotted(&v, "user.name").unwrap(), "Alice");
        assert_eq!(resolve_dotted(&v, "user.roles.1").unwrap(), "dev");
        assert_eq!(resolve_dotted(&v, "items.1.id").unwrap(), 2);
        assert_eq!(resolve_dotted(&v, "").unwrap(), &v);
    }

    #[test]
    fn numeric_key_on_map_is_exact_key_lookup() {
        let v = sample();
        assert_eq!(resolve_dotted(&v, "0").unwrap(), "zero-key");
    }

    #[test]
    fn missing_key_is_not_found() {
        let err = resolve_dotted(&sample(), "user.email").unwrap_err();
        assert!(matches!(err, PathError::NotFound { ref segment, .. } if segment == "email"));
    }

    #[test]
    fn bad_list_index_is_index_error() {
        let v = sample();
        assert!(matches!(
            resolve_dotted(&v, "items.first").unwrap_err(),
            PathError::Index { .. }
        ));
        let err = resolve_dotted(&v, "items.5").unwrap_err();
        assert!(err.to_string().contains("out of range"), "got: {err}");
    }

    #[test]
    fn scalars_cannot_be_navigated() {
        let err = resolve_dotted(&sample(), "user.name.first").unwrap_err();
        assert!(matches!(err, PathError::NotFound { .. }));
    }

    #[test]
    fn renders_canonical_text() {
        assert_eq!(render_value(&Value::Null), "");
        assert_eq!(render_value(&json!(true)), "true");
        assert_eq!(render_value(&json!(42)), "42");
        assert_eq!(render_value(&json!(-7)), "-7");
        assert_eq!(render_value(&json!(3.25)), "3.25");
        assert_eq!(render_value(&json!(1.0e20)), "100000000000000000000");
        assert_eq!(render_value(&json!("raw text")), "raw text");
        assert_eq!(render_value(&json!(["a", 1])), r#"["a",1]"#);
        assert_eq!(render_value(&json!({"k": "v"})), r#"{"k":"v"}"#);
    }
}
