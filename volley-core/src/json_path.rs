use serde_json::Value;

/// Resolves a dotted path such as `pr.assigned_reviewers.0` (or `pr.assigned_reviewers[0]`).
///
/// Numeric segments index arrays; on objects they are plain keys. An empty path is the value
/// itself. Returns `None` on any miss, including JSON `null` at the end of the path.
pub fn lookup<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    let mut cur = value;
    for segment in segments(path) {
        cur = match cur {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    (!cur.is_null()).then_some(cur)
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split(['.', '[', ']']).filter(|s| !s.is_empty())
}

/// Checks a path is well-formed at plan load time.
pub fn validate(path: &str) -> Result<(), String> {
    let open = path.matches('[').count();
    let close = path.matches(']').count();
    if open != close {
        return Err(format!("unbalanced brackets in path `{path}`"));
    }
    if path.contains("..") {
        return Err(format!("empty segment in path `{path}`"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_nested_objects_and_arrays() {
        let v = json!({
            "pr": {
                "pull_request_id": "pr-1",
                "assigned_reviewers": ["u2", "u3"],
                "status": "OPEN"
            }
        });

        assert_eq!(lookup(&v, "pr.pull_request_id"), Some(&json!("pr-1")));
        assert_eq!(lookup(&v, "pr.assigned_reviewers.0"), Some(&json!("u2")));
        assert_eq!(lookup(&v, "pr.assigned_reviewers[1]"), Some(&json!("u3")));
        assert_eq!(lookup(&v, ""), Some(&v));
    }

    #[test]
    fn misses_are_none() {
        let v = json!({ "pr": { "assigned_reviewers": [], "merged_at": null } });
        assert_eq!(lookup(&v, "pr.assigned_reviewers.0"), None);
        assert_eq!(lookup(&v, "pr.assigned_reviewers.x"), None);
        assert_eq!(lookup(&v, "pr.merged_at"), None);
        assert_eq!(lookup(&v, "pr.missing.deeper"), None);
        assert_eq!(lookup(&json!("scalar"), "a"), None);
    }

    #[test]
    fn validate_rejects_malformed_paths() {
        assert!(validate("a.b[0]").is_ok());
        assert!(validate("a.b[0").is_err());
        assert!(validate("a..b").is_err());
    }
}
