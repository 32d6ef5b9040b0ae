//! Tiered decision extraction
//!
//! Replies arrive as strings, objects, or envelopes around either. The
//! extractor applies tiers in order until one yields meaningful data:
//! non-empty tasks or issue lists, non-empty reasoning, or an explicit defer.
//!
//! 1. Strings: full JSON parse, else the first fenced ```json block, else
//!    keyword extraction from the prose.
//! 2. Objects: the fields themselves, else unwrapping (at most four levels)
//!    through `pm_decision` / `decision_object` / `json`, then
//!    `output` / `data` / `result` / `response`. A string found inside an
//!    envelope re-enters tier 1. Sibling `raw` / `text` / `content` /
//!    `message` strings are kept as a last-resort source.
//!
//! Extraction never hard-fails on a non-empty reply; the caller falls back
//! to a minimum defer decision with warnings.

use serde_json::Value;
use tracing::debug;

use crate::decision::{DecisionKind, PmDecision, RouteContext};
use crate::normalize::normalize_and_route;

const MAX_UNWRAP_DEPTH: usize = 4;

/// Envelope keys tried first at each level
const WRAPPER_KEYS: [&str; 3] = ["pm_decision", "decision_object", "json"];
/// Generic envelope keys tried second
const GENERIC_KEYS: [&str; 4] = ["output", "data", "result", "response"];
/// Sibling keys preserving the original reply text
const RAW_KEYS: [&str; 4] = ["raw", "text", "content", "message"];

/// Follow-up task field names, in resolution order
const TASK_KEYS: [&str; 6] = [
    "follow_up_tasks",
    "followUpTasks",
    "followupTasks",
    "followUp",
    "follow_up",
    "tasks",
];

/// A task as captured from the reply, before normalization
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawTask {
    pub title: String,
    pub description: String,
    pub priority_label: Option<String>,
    pub milestone_id: Option<String>,
}

/// Decision fields as captured from the reply, before normalization
#[derive(Debug, Clone, Default)]
pub struct RawDecision {
    pub decision: Option<DecisionKind>,
    pub reasoning: String,
    pub detected_stage: Option<String>,
    pub immediate_issues: Vec<String>,
    pub deferred_issues: Vec<String>,
    pub tasks: Vec<RawTask>,
}

impl RawDecision {
    /// Whether this capture carries enough signal to stop the tier walk
    pub fn is_meaningful(&self) -> bool {
        !self.tasks.is_empty()
            || !self.immediate_issues.is_empty()
            || !self.deferred_issues.is_empty()
            || !self.reasoning.trim().is_empty()
            || self.decision == Some(DecisionKind::Defer)
    }
}

/// Parse a heterogeneous PM reply into the canonical decision record.
///
/// Never fails on a non-empty reply: when nothing can be extracted, a
/// minimum `defer` decision is returned with a warning.
pub fn parse_decision(input: &Value, ctx: &RouteContext) -> PmDecision {
    let mut warnings = Vec::new();
    match extract(input, &mut warnings, 0) {
        Some(raw) => normalize_and_route(raw, warnings, ctx),
        None => {
            debug!("no decision fields found in PM reply");
            warnings.push("could not extract a PM decision from the reply".to_string());
            PmDecision::minimum(warnings)
        }
    }
}

fn extract(value: &Value, warnings: &mut Vec<String>, depth: usize) -> Option<RawDecision> {
    match value {
        Value::String(raw) => extract_from_text(raw, warnings, depth),
        Value::Object(_) => extract_from_object(value, warnings, depth),
        _ => None,
    }
}

fn extract_from_text(raw: &str, warnings: &mut Vec<String>, depth: usize) -> Option<RawDecision> {
    if raw.trim().is_empty() {
        return None;
    }

    // Tier 1a: the whole string is JSON
    if let Ok(parsed) = serde_json::from_str::<Value>(raw) {
        if let Some(found) = extract(&parsed, warnings, depth + 1) {
            return Some(found);
        }
    }

    // Tier 1b: first fenced block
    if let Some(block) = extract_fenced_block(raw) {
        if let Ok(parsed) = serde_json::from_str::<Value>(&block) {
            if let Some(found) = extract(&parsed, warnings, depth + 1) {
                return Some(found);
            }
        }
    }

    // Tier 1c: regex extraction from prose. A quoted decision/status field
    // buried in non-JSON text wins over bare keywords.
    static DECISION_RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = DECISION_RE.get_or_init(|| {
        regex::Regex::new(r#"(?i)"?(?:decision|status)"?\s*[:=]\s*"?(immediate_fix|defer)"#)
            .expect("decision regex must compile")
    });

    let lower = raw.to_ascii_lowercase();
    let decision = match re.captures(raw) {
        Some(captures) => match captures[1].to_ascii_lowercase().as_str() {
            "defer" => Some(DecisionKind::Defer),
            _ => Some(DecisionKind::ImmediateFix),
        },
        None if lower.contains("immediate_fix") => Some(DecisionKind::ImmediateFix),
        None if lower.contains("defer") => Some(DecisionKind::Defer),
        None => None,
    };
    decision.map(|decision| {
        warnings.push("PM reply was not JSON; extracted decision from text".to_string());
        RawDecision {
            decision: Some(decision),
            reasoning: raw.trim().to_string(),
            ..RawDecision::default()
        }
    })
}

fn extract_from_object(
    value: &Value,
    warnings: &mut Vec<String>,
    depth: usize,
) -> Option<RawDecision> {
    let map = value.as_object()?;

    let direct = capture_fields(value, warnings);
    if direct.as_ref().is_some_and(RawDecision::is_meaningful) {
        return direct;
    }

    if depth < MAX_UNWRAP_DEPTH {
        for key in WRAPPER_KEYS.iter().chain(GENERIC_KEYS.iter()) {
            if let Some(inner) = map.get(*key) {
                if let Some(found) = extract(inner, warnings, depth + 1) {
                    if found.is_meaningful() {
                        return Some(found);
                    }
                }
            }
        }
    }

    // Last resort: the original reply text preserved beside the envelope
    for key in RAW_KEYS {
        if let Some(Value::String(raw)) = map.get(key) {
            if let Some(found) = extract_from_text(raw, warnings, depth + 1) {
                if found.is_meaningful() {
                    return Some(found);
                }
            }
        }
    }

    direct
}

/// Capture the decision fields present directly on an object. Returns `None`
/// when the object carries no recognized field at all.
fn capture_fields(value: &Value, warnings: &mut Vec<String>) -> Option<RawDecision> {
    let map = value.as_object()?;
    let mut raw = RawDecision::default();
    let mut any = false;

    // Decision resolution order: a status matching /immediate_fix/i, then a
    // boolean immediate_fix flag, then decision == "defer". Anything else in
    // a decision field counts as immediate_fix.
    if let Some(status) = map.get("status").and_then(Value::as_str) {
        if status.to_ascii_lowercase().contains("immediate_fix") {
            raw.decision = Some(DecisionKind::ImmediateFix);
            any = true;
        }
    }
    if raw.decision.is_none() {
        if let Some(flag) = map.get("immediate_fix").and_then(Value::as_bool) {
            raw.decision = Some(if flag {
                DecisionKind::ImmediateFix
            } else {
                DecisionKind::Defer
            });
            any = true;
        }
    }
    if raw.decision.is_none() {
        if let Some(decision) = map.get("decision").and_then(Value::as_str) {
            raw.decision = Some(if decision.eq_ignore_ascii_case("defer") {
                DecisionKind::Defer
            } else {
                DecisionKind::ImmediateFix
            });
            any = true;
        }
    }

    if let Some(reasoning) = map.get("reasoning").and_then(Value::as_str) {
        raw.reasoning = reasoning.to_string();
        any = true;
    }
    if let Some(stage) = map.get("detected_stage").and_then(Value::as_str) {
        raw.detected_stage = Some(stage.to_string());
        any = true;
    }

    if let Some(issues) = map.get("immediate_issues") {
        raw.immediate_issues = string_list(issues);
        any = true;
    }
    if let Some(issues) = map.get("deferred_issues") {
        raw.deferred_issues = string_list(issues);
        any = true;
    }

    // Follow-up task resolution ladder
    let mut tasks: Vec<RawTask> = Vec::new();
    for key in TASK_KEYS {
        if let Some(value) = map.get(key) {
            let parsed = task_list(value);
            if !parsed.is_empty() {
                tasks = parsed;
                any = true;
                break;
            }
        }
    }

    if tasks.is_empty() {
        if let Some(updates) = map.get("milestone_updates") {
            let promoted = task_list(updates);
            if !promoted.is_empty() {
                warnings
                    .push("PM returned milestone_updates; promoted to follow-up tasks".to_string());
                tasks = promoted;
                any = true;
            }
        }
    }

    // Deprecated backlog field is always merged in
    if let Some(backlog_value) = map.get("backlog") {
        let backlog = task_list(backlog_value);
        if !backlog.is_empty() {
            warnings.push(crate::decision::WARN_DEPRECATED_BACKLOG.to_string());
            if !tasks.is_empty() {
                warnings.push(crate::decision::WARN_BOTH_BACKLOG_AND_TASKS.to_string());
            }
            tasks.extend(backlog);
            any = true;
        }
    }

    raw.tasks = tasks;
    any.then_some(raw)
}

/// Accept an array, or a JSON-stringified array, of strings or
/// title-carrying objects.
fn string_list(value: &Value) -> Vec<String> {
    let items = match value {
        Value::Array(items) => items.clone(),
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Array(items)) => items,
            _ => return Vec::new(),
        },
        _ => return Vec::new(),
    };
    items
        .into_iter()
        .filter_map(|item| match item {
            Value::String(s) => Some(s),
            Value::Object(map) => map
                .get("title")
                .or_else(|| map.get("description"))
                .and_then(Value::as_str)
                .map(String::from),
            _ => None,
        })
        .collect()
}

/// Accept an array, or a JSON-stringified array, of task objects or bare
/// title strings.
fn task_list(value: &Value) -> Vec<RawTask> {
    let items = match value {
        Value::Array(items) => items.clone(),
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Array(items)) => items,
            _ => return Vec::new(),
        },
        _ => return Vec::new(),
    };

    items
        .into_iter()
        .filter_map(|item| match item {
            Value::String(title) => Some(RawTask {
                title,
                ..RawTask::default()
            }),
            Value::Object(map) => {
                let title = map
                    .get("title")
                    .or_else(|| map.get("name"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let description = map
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                if title.is_empty() && description.is_empty() {
                    return None;
                }
                let priority_label = match map.get("priority") {
                    Some(Value::String(s)) => Some(s.clone()),
                    Some(Value::Number(n)) => Some(n.to_string()),
                    _ => None,
                };
                Some(RawTask {
                    title,
                    description,
                    priority_label,
                    milestone_id: map
                        .get("milestone_id")
                        .and_then(Value::as_str)
                        .map(String::from),
                })
            }
            _ => None,
        })
        .collect()
}

/// First fenced code block in a markdown string
fn extract_fenced_block(raw: &str) -> Option<String> {
    let start = raw.find("```")?;
    let after = &raw[start + 3..];
    let body_start = after.find('\n')?;
    let body = &after[body_start + 1..];
    let end = body.find("```")?;
    Some(body[..end].trim().to_string())
}
