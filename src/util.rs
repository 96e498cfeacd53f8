//! Helpers for turning free-form model output into typed values.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

/// Extract the first balanced JSON object from text that may contain prose or
/// markdown fences around it. Braces inside string literals are ignored.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse a JSON object embedded in `text` into `T`.
pub fn parse_json_response<T: DeserializeOwned>(text: &str) -> Result<T> {
    let json = extract_json_object(text).context("No JSON object found in response")?;
    serde_json::from_str(json).context("Response JSON did not match the expected shape")
}

/// First `max` characters of `s`, for log markers and prompt excerpts.
pub fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn test_extract_json_object_with_prefix_and_suffix() {
        let text = r#"Here is the plan: {"key": "value"} hope that helps"#;
        assert_eq!(extract_json_object(text), Some(r#"{"key": "value"}"#));
    }

    #[test]
    fn test_extract_json_object_nested() {
        let text = r#"{"outer": {"inner": "value"}}"#;
        assert_eq!(extract_json_object(text), Some(text));
    }

    #[test]
    fn test_extract_json_object_ignores_braces_in_strings() {
        let text = r#"```json
{"code": "fn main() { println!(\"}\"); }", "n": 1}
```"#;
        let json = extract_json_object(text).unwrap();
        let value: serde_json::Value = serde_json::from_str(json).unwrap();
        assert_eq!(value["n"], 1);
    }

    #[test]
    fn test_extract_json_object_none_cases() {
        assert_eq!(extract_json_object("No JSON here"), None);
        assert_eq!(extract_json_object(r#"{"key": "value""#), None);
    }

    #[test]
    fn test_parse_json_response_typed() {
        #[derive(Deserialize)]
        struct Shape {
            objectives: Vec<String>,
        }
        let parsed: Shape = parse_json_response(r#"ok: {"objectives": ["a", "b"]}"#).unwrap();
        assert_eq!(parsed.objectives, vec!["a", "b"]);

        assert!(parse_json_response::<Shape>("nothing").is_err());
        assert!(parse_json_response::<Shape>(r#"{"other": 1}"#).is_err());
    }

    #[test]
    fn test_truncate_chars_multibyte() {
        assert_eq!(truncate_chars("héllo wörld", 4), "héll");
        assert_eq!(truncate_chars("ab", 10), "ab");
    }
}
