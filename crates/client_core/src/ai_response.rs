//! Decoding of text-generation output.
//!
//! The provider answers either with already-parsed JSON or with a string that
//! may wrap JSON in a single markdown code fence.

use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("generation output is a JSON {0}, expected an object, array or string")]
    UnsupportedShape(&'static str),
    #[error("generation output is not the expected JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Shape requested from the model for invoice descriptions.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GeneratedDescription {
    pub description: String,
}

/// Removes one leading fence line (```` ```json ```` or ```` ``` ````) and one
/// trailing ```` ``` ````, then trims. Text without a fence is only trimmed.
pub fn strip_json_fence(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```") {
        text = match rest.find('\n') {
            Some(newline) => &rest[newline + 1..],
            None => rest.trim_start_matches("json"),
        };
    }
    if let Some(rest) = text.trim_end().strip_suffix("```") {
        text = rest;
    }
    text.trim()
}

pub fn decode_ai_response<T: DeserializeOwned>(raw: &Value) -> Result<T, DecodeError> {
    match raw {
        Value::Object(_) | Value::Array(_) => Ok(T::deserialize(raw)?),
        Value::String(text) => Ok(serde_json::from_str(strip_json_fence(text))?),
        Value::Null => Err(DecodeError::UnsupportedShape("null")),
        Value::Bool(_) => Err(DecodeError::UnsupportedShape("boolean")),
        Value::Number(_) => Err(DecodeError::UnsupportedShape("number")),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn fenced_json_string_is_parsed() {
        let raw = json!("```json\n{\"description\": \"Discovery workshop\"}\n```");
        let decoded: GeneratedDescription = decode_ai_response(&raw).expect("decoded");
        assert_eq!(decoded.description, "Discovery workshop");
    }

    #[test]
    fn bare_fence_and_unfenced_strings_are_parsed() {
        let bare = json!("```\n{\"description\": \"a\"}\n```");
        let plain = json!("  {\"description\": \"b\"}  ");
        let inline = json!("```json {\"description\": \"c\"}```");
        for (raw, expected) in [(bare, "a"), (plain, "b"), (inline, "c")] {
            let decoded: GeneratedDescription = decode_ai_response(&raw).expect("decoded");
            assert_eq!(decoded.description, expected);
        }
    }

    #[test]
    fn pre_parsed_json_passes_through() {
        let raw = json!({ "description": "Already parsed" });
        let decoded: GeneratedDescription = decode_ai_response(&raw).expect("decoded");
        assert_eq!(decoded.description, "Already parsed");
    }

    #[test]
    fn malformed_output_is_an_error() {
        let cases = [
            json!("```json\n{\"description\": \n```"),
            json!("not json at all"),
            json!({ "summary": "wrong key" }),
            json!(42),
            Value::Null,
        ];
        for raw in cases {
            assert!(decode_ai_response::<GeneratedDescription>(&raw).is_err(), "{raw}");
        }
    }

    #[test]
    fn strip_leaves_unfenced_text_alone() {
        assert_eq!(strip_json_fence("  [1, 2]\n"), "[1, 2]");
        assert_eq!(strip_json_fence("```json\n[1]\n```\n"), "[1]");
    }
}
