//! Template interpolation and condition evaluation
//!
//! The only expression language workflows get:
//!
//! - `${name}` - a variable, or a step output when `name` is a step name
//! - `${step.dot.path}` - a dot path, step outputs first, then variables
//! - `${lhs || fallback}` - `fallback` (a literal or another expression)
//!   when `lhs` is undefined; note this is an *undefined* check, so a
//!   resolved `false` stays `false`
//!
//! A string that is exactly one `${…}` resolves to the referenced value with
//! its type preserved; any other string is returned unchanged. Conditions
//! additionally support `==` / `!=` with JavaScript-like loose equality and
//! plain truthiness of a single reference.

use serde_json::Value;

use crate::context::WorkflowContext;

/// Resolve a configuration string. Exactly one `${…}` returns the resolved
/// value (`null` when the reference is undefined); everything else passes
/// through untouched.
pub fn resolve_string(ctx: &WorkflowContext, input: &str) -> Value {
    match sole_template(input) {
        Some(expr) => resolve_expr(ctx, expr).unwrap_or(Value::Null),
        None => Value::String(input.to_string()),
    }
}

/// Resolve every string inside a JSON value through [`resolve_string`]
pub fn resolve_json(ctx: &WorkflowContext, input: &Value) -> Value {
    match input {
        Value::String(s) => resolve_string(ctx, s),
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_json(ctx, v)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_json(ctx, v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Evaluate a step condition. Accepts the expression with or without a
/// surrounding `${…}`.
pub fn evaluate_condition(ctx: &WorkflowContext, condition: &str) -> bool {
    let trimmed = condition.trim();
    let expr = sole_template(trimmed).unwrap_or(trimmed);

    if let Some((lhs, rhs)) = split_operator(expr, "!=") {
        return !loose_eq(resolve_operand(ctx, lhs), resolve_operand(ctx, rhs));
    }
    if let Some((lhs, rhs)) = split_operator(expr, "==") {
        return loose_eq(resolve_operand(ctx, lhs), resolve_operand(ctx, rhs));
    }
    truthy(resolve_expr(ctx, expr))
}

/// `Some(expr)` when the whole string is a single `${expr}`
fn sole_template(input: &str) -> Option<&str> {
    let inner = input.strip_prefix("${")?.strip_suffix('}')?;
    // A second `${` means the string is not one single template
    if inner.contains("${") {
        return None;
    }
    Some(inner.trim())
}

fn split_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    expr.split_once(op).map(|(l, r)| (l.trim(), r.trim()))
}

/// Resolve one expression: `lhs || fallback` chains, then single references.
/// `None` means undefined.
fn resolve_expr(ctx: &WorkflowContext, expr: &str) -> Option<Value> {
    let mut parts = expr.splitn(2, "||");
    let head = parts.next()?.trim();
    let rest = parts.next().map(str::trim);

    match resolve_operand(ctx, head) {
        Some(value) => Some(value),
        None => rest.and_then(|fallback| resolve_expr(ctx, fallback)),
    }
}

/// Resolve a single operand: a literal, or a reference into step outputs /
/// variables. A stray `${…}` wrapper around one operand is tolerated.
fn resolve_operand(ctx: &WorkflowContext, operand: &str) -> Option<Value> {
    let operand = sole_template(operand).unwrap_or(operand);
    if let Some(literal) = parse_literal(operand) {
        return Some(literal);
    }
    resolve_reference(ctx, operand)
}

/// Literal forms the fallback grammar allows: booleans, `[]`, numbers, and
/// quoted strings.
fn parse_literal(raw: &str) -> Option<Value> {
    match raw {
        "true" => return Some(Value::Bool(true)),
        "false" => return Some(Value::Bool(false)),
        "[]" => return Some(Value::Array(Vec::new())),
        "null" => return Some(Value::Null),
        _ => {}
    }
    if (raw.starts_with('"') && raw.ends_with('"') && raw.len() >= 2)
        || (raw.starts_with('\'') && raw.ends_with('\'') && raw.len() >= 2)
    {
        return Some(Value::String(raw[1..raw.len() - 1].to_string()));
    }
    if let Ok(n) = raw.parse::<i64>() {
        return Some(Value::Number(n.into()));
    }
    if let Ok(f) = raw.parse::<f64>() {
        return serde_json::Number::from_f64(f).map(Value::Number);
    }
    None
}

/// Dot-notation reference: step outputs first, then a flat variable under
/// the full name, then a variable descended by the remaining path.
fn resolve_reference(ctx: &WorkflowContext, reference: &str) -> Option<Value> {
    let mut segments = reference.split('.');
    let head = segments.next()?.trim();
    if head.is_empty() {
        return None;
    }
    let rest: Vec<&str> = segments.collect();

    if let Some(output) = ctx.get_step_output(head) {
        return descend(output, &rest).cloned();
    }
    if let Some(value) = ctx.get_variable(reference) {
        return Some(value.clone());
    }
    if let Some(value) = ctx.get_variable(head) {
        return descend(value, &rest).cloned();
    }
    None
}

fn descend<'a>(mut value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    for segment in path {
        value = match value {
            Value::Object(map) => map.get(*segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(value)
}

/// JavaScript-like loose equality over resolved operands. Undefined is not
/// equal to any value.
fn loose_eq(a: Option<Value>, b: Option<Value>) -> bool {
    let (Some(a), Some(b)) = (a, b) else {
        return false;
    };
    if a == b {
        return true;
    }
    // Boolean-ish strings
    if let (Some(a_bool), Some(b_bool)) = (boolish(&a), boolish(&b)) {
        return a_bool == b_bool;
    }
    // Numeric strings compare as numbers
    if let (Some(a_num), Some(b_num)) = (numberish(&a), numberish(&b)) {
        return a_num == b_num;
    }
    false
}

fn boolish(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn numberish(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Truthiness of a resolved reference: undefined, `null`, `false`, `0`,
/// and `""` are falsy, everything else truthy.
fn truthy(value: Option<Value>) -> bool {
    match value {
        None | Some(Value::Null) | Some(Value::Bool(false)) => false,
        Some(Value::String(s)) => !s.is_empty() && s != "false" && s != "0",
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::Array(items)) => !items.is_empty(),
        Some(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> WorkflowContext {
        let mut ctx = WorkflowContext::new("wf", "p", "/tmp/repo", "main");
        ctx.set_variable("branch", json!("feature/x"));
        ctx.set_variable("count", json!(3));
        ctx.set_variable("enabled", json!(false));
        ctx.set_step_output(
            "scan",
            json!({"reused_existing": true, "stats": {"files": 12}}),
        );
        ctx
    }

    #[test]
    fn test_sole_template_returns_typed_value() {
        let ctx = ctx();
        assert_eq!(resolve_string(&ctx, "${count}"), json!(3));
        assert_eq!(resolve_string(&ctx, "${scan.stats.files}"), json!(12));
        assert_eq!(resolve_string(&ctx, "${enabled}"), json!(false));
    }

    #[test]
    fn test_non_template_strings_pass_through() {
        let ctx = ctx();
        assert_eq!(
            resolve_string(&ctx, "branch is ${branch}"),
            json!("branch is ${branch}")
        );
        assert_eq!(resolve_string(&ctx, "plain"), json!("plain"));
    }

    #[test]
    fn test_undefined_resolves_to_null() {
        let ctx = ctx();
        assert_eq!(resolve_string(&ctx, "${missing}"), Value::Null);
        assert_eq!(resolve_string(&ctx, "${scan.missing.deep}"), Value::Null);
    }

    #[test]
    fn test_fallback_fires_only_on_undefined() {
        let ctx = ctx();
        // undefined -> fallback literal, type preserved
        assert_eq!(resolve_string(&ctx, "${missing || 0}"), json!(0));
        // a resolved false is NOT replaced
        assert_eq!(resolve_string(&ctx, "${enabled || 0}"), json!(false));
        // chained fallbacks
        assert_eq!(
            resolve_string(&ctx, "${missing || also_missing || \"last\"}"),
            json!("last")
        );
        assert_eq!(resolve_string(&ctx, "${missing || []}"), json!([]));
        assert_eq!(resolve_string(&ctx, "${missing || branch}"), json!("feature/x"));
    }

    #[test]
    fn test_step_outputs_shadow_variables() {
        let mut ctx = ctx();
        ctx.set_variable("scan", json!("the variable"));
        assert_eq!(resolve_string(&ctx, "${scan.reused_existing}"), json!(true));
    }

    #[test]
    fn test_flat_variable_with_dotted_name() {
        let mut ctx = ctx();
        ctx.set_variable("a.b", json!("flat"));
        assert_eq!(resolve_string(&ctx, "${a.b}"), json!("flat"));
    }

    #[test]
    fn test_resolve_json_walks_structures() {
        let ctx = ctx();
        let resolved = resolve_json(
            &ctx,
            &json!({"files": "${scan.stats.files}", "list": ["${count}", "keep"]}),
        );
        assert_eq!(resolved, json!({"files": 12, "list": [3, "keep"]}));
    }

    #[test]
    fn test_condition_equality_loose() {
        let mut ctx = ctx();
        ctx.set_variable("flag", json!("true"));
        ctx.set_variable("n", json!("5"));

        assert!(evaluate_condition(&ctx, "flag == true"));
        assert!(evaluate_condition(&ctx, "${flag == true}"));
        assert!(evaluate_condition(&ctx, "n == 5"));
        assert!(evaluate_condition(&ctx, "n != 6"));
        assert!(evaluate_condition(&ctx, "scan.reused_existing == true"));
        assert!(!evaluate_condition(&ctx, "scan.reused_existing == false"));
        assert!(evaluate_condition(&ctx, "branch == \"feature/x\""));
    }

    #[test]
    fn test_condition_undefined_never_equals() {
        let ctx = ctx();
        assert!(!evaluate_condition(&ctx, "missing == true"));
        assert!(!evaluate_condition(&ctx, "missing == false"));
        // != against undefined is true (it is not equal to the value)
        assert!(evaluate_condition(&ctx, "missing != true"));
    }

    #[test]
    fn test_condition_truthiness() {
        let mut ctx = ctx();
        assert!(evaluate_condition(&ctx, "branch"));
        assert!(evaluate_condition(&ctx, "${count}"));
        assert!(!evaluate_condition(&ctx, "enabled"));
        assert!(!evaluate_condition(&ctx, "missing"));
        ctx.set_variable("empty", json!(""));
        assert!(!evaluate_condition(&ctx, "empty"));
        ctx.set_variable("zero", json!(0));
        assert!(!evaluate_condition(&ctx, "zero"));
    }
}
