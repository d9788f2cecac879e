//! Predicates of the `condition` operation and their comparison semantics.
//!
//! A predicate reads one value from a [`PredicateSource`], compares it with a
//! literal using a [`Comparison`], and passes or fails. Resolution of the
//! source is left to the caller through a resolver function.

use rulebook_types::value_as_number;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where a predicate reads its left-hand value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PredicateSource {
    /// The acting entity's flattened roll data.
    RollData,
    /// The acting entity's raw system tree.
    System,
    /// The activity's own system data.
    Activity,
    /// Another operation's record: `opId` or `opId.field`.
    Operation,
    /// A flag persisted on the acting entity.
    Flag,
}

impl PredicateSource {
    pub const ALL: [PredicateSource; 5] = [
        PredicateSource::RollData,
        PredicateSource::System,
        PredicateSource::Activity,
        PredicateSource::Operation,
        PredicateSource::Flag,
    ];

    pub fn label(self) -> &'static str {
        match self {
            PredicateSource::RollData => "Roll data",
            PredicateSource::System => "System data",
            PredicateSource::Activity => "Activity data",
            PredicateSource::Operation => "Operation value",
            PredicateSource::Flag => "Flag",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    NotEq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "has")]
    Has,
    #[serde(rename = "!has")]
    NotHas,
}

impl Comparison {
    pub const ALL: [Comparison; 8] = [
        Comparison::Eq,
        Comparison::NotEq,
        Comparison::Lt,
        Comparison::Gt,
        Comparison::Le,
        Comparison::Ge,
        Comparison::Has,
        Comparison::NotHas,
    ];

    pub fn symbol(self) -> &'static str {
        match self {
            Comparison::Eq => "==",
            Comparison::NotEq => "!=",
            Comparison::Lt => "<",
            Comparison::Gt => ">",
            Comparison::Le => "<=",
            Comparison::Ge => ">=",
            Comparison::Has => "has",
            Comparison::NotHas => "!has",
        }
    }
}

/// One `key comparison value` test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Predicate {
    pub source: PredicateSource,
    pub key: String,
    pub comparison: Comparison,
    /// Literal right-hand side; `#id` placeholders are substituted first.
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub priority: i32,
}

impl Predicate {
    pub fn describe(&self) -> String {
        format!("{} {} {}", self.key, self.comparison.symbol(), self.value)
    }
}

/// Interpret a predicate literal: JSON when it parses, otherwise a plain
/// string with surrounding quotes stripped.
pub fn parse_literal(raw: &str) -> Value {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return value;
    }
    Value::String(strip_quotes(trimmed))
}

fn strip_quotes(s: &str) -> String {
    if s.len() >= 2 {
        let bytes = s.as_bytes();
        if (bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\'')
        {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}

/// Compare an actual value with an expected one.
///
/// Numbers (and numeric strings) compare numerically; other strings compare
/// lexically; `has` tests array membership, substring, or object key.
pub fn compare(actual: &Value, comparison: Comparison, expected: &Value) -> bool {
    match comparison {
        Comparison::Eq => loosely_equal(actual, expected),
        Comparison::NotEq => !loosely_equal(actual, expected),
        Comparison::Lt => ordering(actual, expected).is_some_and(|o| o.is_lt()),
        Comparison::Gt => ordering(actual, expected).is_some_and(|o| o.is_gt()),
        Comparison::Le => ordering(actual, expected).is_some_and(|o| o.is_le()),
        Comparison::Ge => ordering(actual, expected).is_some_and(|o| o.is_ge()),
        Comparison::Has => contains(actual, expected),
        Comparison::NotHas => !contains(actual, expected),
    }
}

fn loosely_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    match (number(a), number(b)) {
        (Some(x), Some(y)) => x == y,
        _ => match (a, b) {
            (Value::String(x), Value::String(y)) => x == y,
            (Value::String(x), other) | (other, Value::String(x)) if !other.is_null() => {
                *x == render(other)
            }
            _ => false,
        },
    }
}

fn ordering(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (number(a), number(b)) {
        (Some(x), Some(y)) => x.partial_cmp(&y),
        _ => match (a, b) {
            (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
            _ => None,
        },
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|item| loosely_equal(item, needle)),
        Value::String(s) => s.contains(render(needle).as_str()),
        Value::Object(map) => map.contains_key(render(needle).as_str()),
        _ => false,
    }
}

/// Numeric view that does not treat booleans as numbers.
fn number(v: &Value) -> Option<f64> {
    match v {
        Value::Bool(_) => None,
        other => value_as_number(other),
    }
}

fn render(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
