//! Shared utility functions for the worker crate.

use chrono::Utc;

/// Alphabet used for opaque record identifiers. URL-safe, no lookalikes
/// beyond what nanoid's default already allows.
const ID_ALPHABET: [char; 62] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i',
    'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', 'A', 'B',
    'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S', 'T', 'U',
    'V', 'W', 'X', 'Y', 'Z',
];

/// Generate a fresh opaque identifier for a stored record.
pub fn new_id() -> String {
    nanoid::nanoid!(16, &ID_ALPHABET)
}

/// Current time as integer seconds since the epoch.
pub fn epoch_seconds() -> i64 {
    Utc::now().timestamp()
}

/// Current time as integer milliseconds since the epoch.
pub fn epoch_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Derive the per-project database name: `turbobackend_proj_` followed by the
/// project id lowercased with hyphens replaced by underscores.
pub fn database_name_for(project_id: &str) -> String {
    format!(
        "turbobackend_proj_{}",
        project_id.to_lowercase().replace('-', "_")
    )
}

/// Derive the deployment app name: `turbobackend-` followed by the project id
/// lowercased.
pub fn app_name_for(project_id: &str) -> String {
    format!("turbobackend-{}", project_id.to_lowercase())
}

/// Derive the public URL of a deployed app.
pub fn deployment_url_for(project_id: &str) -> String {
    format!("https://{}.fly.dev", app_name_for(project_id))
}

/// Derive the source repository name for a project.
pub fn repo_name_for(project_id: &str) -> String {
    format!("turbobackend-{}", project_id)
}

/// Truncate a string to at most `max` characters, appending an ellipsis
/// marker when anything was cut.
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{}...", cut)
    }
}

/// Extract a JSON object from text that may contain other content.
/// Uses brace-counting to find the outermost JSON object.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0;
    let mut end = start;

    for (i, ch) in text[start..].char_indices() {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = start + i + 1;
                    break;
                }
            }
            _ => {}
        }
    }

    if depth == 0 && end > start {
        Some(text[start..end].to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_id_length_and_uniqueness() {
        let a = new_id();
        let b = new_id();
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }

    #[test]
    fn test_database_name_determinism() {
        assert_eq!(database_name_for("p2"), "turbobackend_proj_p2");
        assert_eq!(
            database_name_for("AbC-123-xyz"),
            "turbobackend_proj_abc_123_xyz"
        );
        // Same input, same output
        assert_eq!(database_name_for("p2"), database_name_for("p2"));
    }

    #[test]
    fn test_app_name_and_url() {
        assert_eq!(app_name_for("P1"), "turbobackend-p1");
        assert_eq!(deployment_url_for("p1"), "https://turbobackend-p1.fly.dev");
    }

    #[test]
    fn test_repo_name_preserves_case() {
        assert_eq!(repo_name_for("aB3"), "turbobackend-aB3");
    }

    #[test]
    fn test_truncate_short_input_untouched() {
        assert_eq!(truncate("hello", 10), "hello");
    }

    #[test]
    fn test_truncate_long_input() {
        assert_eq!(truncate("hello world", 5), "hello...");
    }

    #[test]
    fn test_extract_json_object_simple() {
        let text = r#"{"key": "value"}"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"key": "value"}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_object_with_prefix() {
        let text = r#"Here is the JSON: {"key": "value"}"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"key": "value"}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_object_nested() {
        let text = r#"{"outer": {"inner": "value"}}"#;
        assert_eq!(
            extract_json_object(text),
            Some(r#"{"outer": {"inner": "value"}}"#.to_string())
        );
    }

    #[test]
    fn test_extract_json_object_no_json() {
        assert_eq!(extract_json_object("No JSON here"), None);
    }

    #[test]
    fn test_extract_json_object_unclosed() {
        assert_eq!(extract_json_object(r#"{"key": "value""#), None);
    }
}
