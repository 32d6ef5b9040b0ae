//! Reviewer reply status interpretation
//!
//! Reviewer personas report their verdict in a `status` field when they
//! behave, and in prose when they do not. This interpreter is the shared
//! fallback; steps first honor a pre-resolved status variable, then a
//! structured field, then this keyword scan.

use ensemble_core::wire::PersonaStatus;
use serde_json::Value;

/// Words in a raw reply that read as approval
const PASS_HINTS: [&str; 5] = ["pass", "approved", "approve", "lgtm", "looks good"];
/// Words in a raw reply that read as rejection
const FAIL_HINTS: [&str; 5] = ["fail", "failed", "reject", "blocked", "changes requested"];

/// Interpret a reviewer reply of any shape into a normalized status.
///
/// Objects are checked for a `status` field (directly, then under `result`);
/// strings are scanned for verdict keywords, with rejection hints taking
/// precedence over approval hints so "passes except ... failed" reads as a
/// failure.
pub fn interpret_reply_status(reply: &Value) -> PersonaStatus {
    match reply {
        Value::Object(map) => {
            if let Some(status) = map.get("status").and_then(Value::as_str) {
                return PersonaStatus::parse(status);
            }
            if let Some(inner) = map.get("result") {
                return interpret_reply_status(inner);
            }
            PersonaStatus::Unknown
        }
        Value::String(raw) => {
            let lower = raw.to_ascii_lowercase();
            if FAIL_HINTS.iter().any(|h| lower.contains(h)) {
                PersonaStatus::Fail
            } else if PASS_HINTS.iter().any(|h| lower.contains(h)) {
                PersonaStatus::Pass
            } else {
                PersonaStatus::Unknown
            }
        }
        _ => PersonaStatus::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_structured_status() {
        assert_eq!(
            interpret_reply_status(&json!({"status": "approved"})),
            PersonaStatus::Pass
        );
        assert_eq!(
            interpret_reply_status(&json!({"status": "failed"})),
            PersonaStatus::Fail
        );
        assert_eq!(
            interpret_reply_status(&json!({"result": {"status": "pass"}})),
            PersonaStatus::Pass
        );
    }

    #[test]
    fn test_raw_keyword_scan() {
        assert_eq!(
            interpret_reply_status(&json!("LGTM, ship it")),
            PersonaStatus::Pass
        );
        assert_eq!(
            interpret_reply_status(&json!("Review failed: null deref in handler")),
            PersonaStatus::Fail
        );
        // Fail hints outrank pass hints
        assert_eq!(
            interpret_reply_status(&json!("mostly passes but the build failed")),
            PersonaStatus::Fail
        );
    }

    #[test]
    fn test_unknown() {
        assert_eq!(interpret_reply_status(&json!(42)), PersonaStatus::Unknown);
        assert_eq!(
            interpret_reply_status(&json!("no verdict here")),
            PersonaStatus::Unknown
        );
    }
}
