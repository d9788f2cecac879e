//! Activity validation: lint rules and diagnostics.
//!
//! Call [`validate`] for advisory diagnostics or [`validate_or_raise`] to
//! fail on the first `Error`-severity issue. The runner calls the latter
//! before every new run.

use std::collections::{HashMap, HashSet};

use rulebook_formula::{is_placeholder_id, placeholder_ids};
use rulebook_types::{OperationData, Result, RulebookError};
use serde::Serialize;

use crate::activity::Activity;
use crate::operation::{Operation, OperationKind};

// ---------------------------------------------------------------------------
// Diagnostic types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub rule: String,
    pub severity: Severity,
    pub message: String,
    pub operation: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        })
    }
}

// ---------------------------------------------------------------------------
// LintRule trait
// ---------------------------------------------------------------------------

pub trait LintRule: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, activity: &Activity) -> Vec<Diagnostic>;
}

fn diagnostic(
    rule: &dyn LintRule,
    severity: Severity,
    op: &Operation,
    message: String,
) -> Diagnostic {
    Diagnostic {
        rule: rule.name().into(),
        severity,
        message,
        operation: Some(op.id.clone()),
    }
}

/// Every formula-bearing field of an operation, costs included.
fn formulas(op: &Operation) -> impl Iterator<Item = &str> {
    op.kind
        .formulas()
        .into_iter()
        .chain([op.costs.actions.as_str(), op.costs.stamina.as_str()])
}

/// Operation id -> position in execution order.
fn positions(activity: &Activity) -> HashMap<&str, usize> {
    activity
        .execution_order()
        .into_iter()
        .enumerate()
        .map(|(position, index)| (activity.operations[index].id.as_str(), position))
        .collect()
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

struct UniqueIdsRule;
impl LintRule for UniqueIdsRule {
    fn name(&self) -> &str { "unique_ids" }
    fn apply(&self, activity: &Activity) -> Vec<Diagnostic> {
        let mut seen = HashSet::new();
        let mut diags = Vec::new();
        for op in &activity.operations {
            if op.id.trim().is_empty() {
                diags.push(diagnostic(self, Severity::Error, op, "Operation has an empty id".into()));
            } else if !is_placeholder_id(&op.id) {
                diags.push(diagnostic(
                    self,
                    Severity::Error,
                    op,
                    format!(
                        "Operation id '{}' must start with a letter or '_' and contain only letters, digits, or '_'",
                        op.id
                    ),
                ));
            } else if op.id == OperationData::TARGET_KEY {
                diags.push(diagnostic(
                    self,
                    Severity::Error,
                    op,
                    format!("Operation id '{}' is reserved for the bound target", op.id),
                ));
            } else if !seen.insert(op.id.as_str()) {
                diags.push(diagnostic(
                    self,
                    Severity::Error,
                    op,
                    format!("Operation id '{}' is used more than once", op.id),
                ));
            }
        }
        diags
    }
}

struct PlaceholderRefsRule;
impl LintRule for PlaceholderRefsRule {
    fn name(&self) -> &str { "placeholder_refs" }
    fn apply(&self, activity: &Activity) -> Vec<Diagnostic> {
        let known = positions(activity);
        let mut diags = Vec::new();
        for op in &activity.operations {
            for formula in formulas(op) {
                for id in placeholder_ids(formula) {
                    if !is_placeholder_id(&id) {
                        diags.push(diagnostic(
                            self,
                            Severity::Error,
                            op,
                            format!("'{}' has a malformed placeholder '#{id}'", op.label()),
                        ));
                    } else if !known.contains_key(id.as_str()) {
                        diags.push(diagnostic(
                            self,
                            Severity::Error,
                            op,
                            format!("'{}' references unknown operation '#{id}'", op.label()),
                        ));
                    }
                }
            }
        }
        diags
    }
}

struct ForwardPlaceholderRule;
impl LintRule for ForwardPlaceholderRule {
    fn name(&self) -> &str { "forward_placeholder" }
    fn apply(&self, activity: &Activity) -> Vec<Diagnostic> {
        let known = positions(activity);
        let mut diags = Vec::new();
        for op in &activity.operations {
            let Some(&own) = known.get(op.id.as_str()) else { continue };
            for formula in formulas(op) {
                for id in placeholder_ids(formula) {
                    match known.get(id.as_str()) {
                        Some(&referenced) if referenced >= own => diags.push(diagnostic(
                            self,
                            Severity::Warning,
                            op,
                            format!(
                                "'{}' uses '#{id}', which does not run before it",
                                op.label()
                            ),
                        )),
                        _ => {}
                    }
                }
            }
        }
        diags
    }
}

struct SelectRefsRule;
impl LintRule for SelectRefsRule {
    fn name(&self) -> &str { "select_refs" }
    fn apply(&self, activity: &Activity) -> Vec<Diagnostic> {
        let known = positions(activity);
        let mut diags = Vec::new();
        for op in &activity.operations {
            let refs: Vec<&str> = match &op.kind {
                OperationKind::SelectOperation(s) => {
                    s.operations.iter().map(String::as_str).collect()
                }
                OperationKind::SelectOption(s) => s
                    .options
                    .iter()
                    .filter_map(|o| o.continue_from.as_deref())
                    .collect(),
                _ => continue,
            };
            for id in refs {
                if id == op.id {
                    diags.push(diagnostic(
                        self,
                        Severity::Error,
                        op,
                        format!("'{}' offers itself as a choice", op.label()),
                    ));
                } else if !known.contains_key(id) {
                    diags.push(diagnostic(
                        self,
                        Severity::Error,
                        op,
                        format!("'{}' offers unknown operation '{id}'", op.label()),
                    ));
                }
            }
        }
        diags
    }
}

struct ResourceRefsRule;
impl LintRule for ResourceRefsRule {
    fn name(&self) -> &str { "resource_refs" }
    fn apply(&self, activity: &Activity) -> Vec<Diagnostic> {
        let creators: HashSet<&str> = activity
            .operations
            .iter()
            .filter(|op| matches!(op.kind, OperationKind::CreateResource(_)))
            .map(|op| op.id.as_str())
            .collect();
        activity
            .operations
            .iter()
            .filter_map(|op| match &op.kind {
                OperationKind::ConsumeResource(c)
                    if !creators.contains(c.resource.as_str())
                        && !activity.ledger.contains(&c.resource) =>
                {
                    Some(diagnostic(
                        self,
                        Severity::Error,
                        op,
                        format!(
                            "'{}' consumes '{}', which no createResource operation creates",
                            op.label(),
                            c.resource
                        ),
                    ))
                }
                _ => None,
            })
            .collect()
    }
}

struct DanglingForkRule;
impl LintRule for DanglingForkRule {
    fn name(&self) -> &str { "dangling_fork" }
    fn apply(&self, activity: &Activity) -> Vec<Diagnostic> {
        let order = activity.execution_order();
        let Some(&last) = order.last() else { return vec![] };
        let op = &activity.operations[last];
        if matches!(op.kind, OperationKind::Target(_) | OperationKind::Test(_)) {
            vec![diagnostic(
                self,
                Severity::Info,
                op,
                format!("'{}' forks but nothing runs after it", op.label()),
            )]
        } else {
            vec![]
        }
    }
}

struct EmptyDamagesRule;
impl LintRule for EmptyDamagesRule {
    fn name(&self) -> &str { "empty_damages" }
    fn apply(&self, activity: &Activity) -> Vec<Diagnostic> {
        activity
            .operations
            .iter()
            .filter_map(|op| match &op.kind {
                OperationKind::Attack(a) if a.damages.is_empty() => Some(diagnostic(
                    self,
                    Severity::Warning,
                    op,
                    format!("Attack '{}' has no damage entries", op.label()),
                )),
                _ => None,
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Run all built-in lint rules and return collected diagnostics.
pub fn validate(activity: &Activity) -> Vec<Diagnostic> {
    let rules: Vec<Box<dyn LintRule>> = vec![
        Box::new(UniqueIdsRule),
        Box::new(PlaceholderRefsRule),
        Box::new(ForwardPlaceholderRule),
        Box::new(SelectRefsRule),
        Box::new(ResourceRefsRule),
        Box::new(DanglingForkRule),
        Box::new(EmptyDamagesRule),
    ];

    let mut diagnostics = Vec::new();
    for rule in &rules {
        diagnostics.extend(rule.apply(activity));
    }
    diagnostics
}

/// Run all lint rules; return `Err` if any `Error`-severity diagnostic found.
pub fn validate_or_raise(activity: &Activity) -> Result<Vec<Diagnostic>> {
    let diagnostics = validate(activity);
    let errors: Vec<_> = diagnostics
        .iter()
        .filter(|d| d.severity == Severity::Error)
        .map(|d| d.message.clone())
        .collect();
    if !errors.is_empty() {
        return Err(RulebookError::Validation(errors.join("; ")));
    }
    Ok(diagnostics)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn activity(operations: serde_json::Value) -> Activity {
        Activity::from_json(&json!({ "id": "a", "name": "Test", "operations": operations }).to_string())
            .unwrap()
    }

    fn rules_hit(diags: &[Diagnostic]) -> Vec<&str> {
        diags.iter().map(|d| d.rule.as_str()).collect()
    }

    #[test]
    fn valid_activity_passes() {
        let a = activity(json!([
            { "id": "base", "priority": 0, "type": "check", "check": "agi" },
            { "id": "hit", "priority": 1, "type": "attack",
              "damages": [{ "formula": "1d6 + #base" }] }
        ]));
        assert!(validate(&a).is_empty());
        assert!(validate_or_raise(&a).is_ok());
    }

    #[test]
    fn duplicate_ids_error() {
        let a = activity(json!([
            { "id": "m", "type": "message", "text": "one" },
            { "id": "m", "type": "message", "text": "two" }
        ]));
        let diags = validate(&a);
        assert_eq!(rules_hit(&diags), vec!["unique_ids"]);
        assert_eq!(diags[0].severity, Severity::Error);
    }

    #[test]
    fn ids_follow_the_placeholder_grammar() {
        for bad in ["dmg-base", "1abc", "two words"] {
            let a = activity(json!([{ "id": bad, "type": "check", "check": "agi" }]));
            let diags = validate(&a);
            assert_eq!(rules_hit(&diags), vec!["unique_ids"], "id {bad:?}");
            assert!(diags[0].message.contains(bad));
        }
    }

    #[test]
    fn target_id_is_reserved() {
        let a = activity(json!([{ "id": "target", "type": "check", "check": "agi" }]));
        let err = validate_or_raise(&a).unwrap_err();
        assert!(matches!(err, RulebookError::Validation(m) if m.contains("reserved")));
    }

    #[test]
    fn malformed_placeholder_error() {
        let a = activity(json!([
            { "id": "base", "priority": 0, "type": "check", "check": "agi" },
            { "id": "t", "priority": 1, "type": "travel", "modifier": "#1abc + 2" }
        ]));
        let diags = validate(&a);
        assert_eq!(rules_hit(&diags), vec!["placeholder_refs"]);
        assert!(diags[0].message.contains("malformed placeholder '#1abc'"));
    }

    #[test]
    fn unknown_placeholder_error() {
        let a = activity(json!([
            { "id": "hit", "type": "attack", "damages": [{ "formula": "#nope + 1" }] }
        ]));
        let err = validate_or_raise(&a).unwrap_err();
        assert!(matches!(err, RulebookError::Validation(m) if m.contains("#nope")));
    }

    #[test]
    fn forward_placeholder_warns() {
        let a = activity(json!([
            { "id": "hit", "priority": 0, "type": "attack",
              "damages": [{ "formula": "#later" }] },
            { "id": "later", "priority": 5, "type": "check", "check": "agi" }
        ]));
        let diags = validate(&a);
        assert_eq!(rules_hit(&diags), vec!["forward_placeholder"]);
        assert_eq!(diags[0].severity, Severity::Warning);
        assert!(validate_or_raise(&a).is_ok());
    }

    #[test]
    fn placeholder_in_costs_is_checked() {
        let a = activity(json!([
            { "id": "m", "type": "message", "text": "hi",
              "costs": { "actions": "#ghost" } }
        ]));
        assert_eq!(rules_hit(&validate(&a)), vec!["placeholder_refs"]);
    }

    #[test]
    fn select_refs_must_exist() {
        let a = activity(json!([
            { "id": "pick", "type": "selectOperation", "operations": ["missing"] },
            { "id": "opt", "type": "selectOption",
              "options": [{ "label": "Go", "value": "go", "continueFrom": "gone" }] }
        ]));
        let diags = validate(&a);
        assert_eq!(rules_hit(&diags), vec!["select_refs", "select_refs"]);
    }

    #[test]
    fn consume_needs_a_creator() {
        let a = activity(json!([
            { "id": "spend", "type": "consumeResource", "resource": "ki", "amount": "1" }
        ]));
        assert_eq!(rules_hit(&validate(&a)), vec!["resource_refs"]);
    }

    #[test]
    fn trailing_target_is_info() {
        let a = activity(json!([
            { "id": "t", "type": "target", "appliesTo": "each" }
        ]));
        let diags = validate(&a);
        assert_eq!(rules_hit(&diags), vec!["dangling_fork"]);
        assert_eq!(diags[0].severity, Severity::Info);
    }

    #[test]
    fn attack_without_damages_warns() {
        let a = activity(json!([
            { "id": "hit", "type": "attack", "damages": [] },
            { "id": "m", "type": "message", "text": "done" }
        ]));
        assert_eq!(rules_hit(&validate(&a)), vec!["empty_damages"]);
    }
}
