//! Edit specification model
//!
//! The wire shape personas produce:
//!
//! ```json
//! {"ops": [
//!   {"action": "upsert", "path": "src/lib.rs", "content": "...",
//!    "hunks": [{"oldStart": 1, "oldCount": 2, "lines": [" a", "-b", "+B"]}]},
//!   {"action": "delete", "path": "obsolete.txt"}
//! ]}
//! ```
//!
//! Persona output does not always arrive as a clean object, so
//! [`EditSpec::from_output`] also unwraps common envelope keys and parses
//! JSON out of strings and fenced markdown blocks.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A unified-diff style change region. `lines` carry a one-character prefix:
/// `' '` context, `'+'` addition, `'-'` removal; any other prefix is treated
/// as context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hunk {
    /// 1-based first line of the region in the old file
    pub old_start: usize,
    /// Number of old-file lines the region covers
    pub old_count: usize,
    pub lines: Vec<String>,
}

/// One mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Op {
    /// Create or replace a file, by whole content and/or hunks
    Upsert {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hunks: Option<Vec<Hunk>>,
    },
    /// Remove a file
    Delete { path: String },
}

impl Op {
    pub fn path(&self) -> &str {
        match self {
            Op::Upsert { path, .. } | Op::Delete { path } => path,
        }
    }
}

/// A batch of ops applied together and committed as one change
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EditSpec {
    #[serde(default)]
    pub ops: Vec<Op>,
}

/// Envelope keys under which persona steps have been observed to nest the
/// spec. Checked in order, up to four levels deep.
const WRAPPER_KEYS: [&str; 6] = ["edit_spec", "editSpec", "spec", "output", "result", "data"];

impl EditSpec {
    /// Best-effort extraction of an edit spec from arbitrary step output.
    ///
    /// Returns `None` when no `ops` array can be found anywhere in the value.
    pub fn from_output(value: &Value) -> Option<EditSpec> {
        Self::from_value(value, 0)
    }

    fn from_value(value: &Value, depth: usize) -> Option<EditSpec> {
        if depth > 4 {
            return None;
        }
        match value {
            Value::String(raw) => Self::from_text(raw, depth),
            Value::Object(map) => {
                if map.contains_key("ops") {
                    if let Ok(spec) = serde_json::from_value::<EditSpec>(value.clone()) {
                        if !spec.ops.is_empty() {
                            return Some(spec);
                        }
                    }
                }
                for key in WRAPPER_KEYS {
                    if let Some(inner) = map.get(key) {
                        if let Some(spec) = Self::from_value(inner, depth + 1) {
                            return Some(spec);
                        }
                    }
                }
                None
            }
            _ => None,
        }
    }

    fn from_text(raw: &str, depth: usize) -> Option<EditSpec> {
        if let Ok(value) = serde_json::from_str::<Value>(raw) {
            return Self::from_value(&value, depth + 1);
        }
        // Fall back to the first fenced ```json block
        let block = extract_fenced_json(raw)?;
        let value = serde_json::from_str::<Value>(&block).ok()?;
        Self::from_value(&value, depth + 1)
    }
}

/// First ```json … ``` (or bare ``` … ```) block in a markdown string
pub(crate) fn extract_fenced_json(raw: &str) -> Option<String> {
    let start = raw.find("```")?;
    let after_fence = &raw[start + 3..];
    let body_start = after_fence.find('\n')?;
    let body = &after_fence[body_start + 1..];
    let end = body.find("```")?;
    Some(body[..end].trim().to_string())
}
