//! `#operationId` placeholder substitution.
//!
//! Runs once over a formula before it reaches the evaluator. Every token must
//! resolve; a leftover `#id` is reported instead of being passed through.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use rulebook_types::{Result, RulebookError};

use crate::format_number;

/// Every `#` token, well-formed or not. Malformed ones (`#1abc`, a bare `#`)
/// capture an id that fails [`is_placeholder_id`].
fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"#([A-Za-z0-9_]*)").expect("placeholder pattern is valid"))
}

/// Whether `id` can be written as a `#id` placeholder: a letter or `_`,
/// then letters, digits, or `_`.
pub fn is_placeholder_id(id: &str) -> bool {
    let mut chars = id.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Ids referenced by `#` tokens in `formula`, in first-seen order.
/// Malformed tokens are included as written.
pub fn placeholder_ids(formula: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for caps in placeholder_re().captures_iter(formula) {
        let id = caps[1].to_string();
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}

/// Render a recorded value for splicing into a formula.
///
/// Numbers drop a trailing `.0`, booleans become `1`/`0`, strings are used
/// verbatim. Null, arrays, and objects have no formula representation.
pub fn render_value(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => n.as_f64().map(format_number),
        Value::Bool(b) => Some(if *b { "1".into() } else { "0".into() }),
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

/// Replace every `#id` in `formula` with `resolve(id)`. No `#` survives:
/// a malformed or unresolved token is an error.
///
/// `operation` names the operation owning the formula, for error reporting.
pub fn substitute_placeholders(
    formula: &str,
    operation: &str,
    resolve: &dyn Fn(&str) -> Option<Value>,
) -> Result<String> {
    let re = placeholder_re();
    let mut out = String::with_capacity(formula.len());
    let mut last = 0;
    for caps in re.captures_iter(formula) {
        let whole = caps.get(0).map(|m| m.range()).unwrap_or(0..0);
        let id = &caps[1];
        let rendered = Some(id)
            .filter(|id| is_placeholder_id(id))
            .and_then(|id| resolve(id))
            .as_ref()
            .and_then(render_value)
            .ok_or_else(|| RulebookError::UnresolvedPlaceholder {
                operation: operation.to_string(),
                placeholder: id.to_string(),
            })?;
        out.push_str(&formula[last..whole.start]);
        out.push_str(&rendered);
        last = whole.end;
    }
    out.push_str(&formula[last..]);
    Ok(out)
}
