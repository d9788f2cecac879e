//! Shared types, errors, operation data, and outcomes for the Rulebook engine.
//!
//! This crate provides the foundational types used across all other Rulebook crates:
//! - `RulebookError`: unified error taxonomy
//! - `OperationData`: the per-activity scratch map used to pass values between steps
//! - `RollData`: flat dotted-key data context handed to the expression evaluator
//! - `Outcome`: result of executing one operation
//! - `PendingResume`: serializable suspension state for re-entrant resumption

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifier of an actor, item, or any other document in the state store.
pub type EntityId = String;

/// Unified error type for all Rulebook subsystems.
#[derive(Debug, thiserror::Error)]
pub enum RulebookError {
    // === Gated failures (reported to the user, halt the current branch) ===
    #[error("Operation '{operation}' cannot run: {message}")]
    Precondition { operation: String, message: String },

    #[error("Operation '{operation}' was cancelled by the user")]
    Cancelled { operation: String },

    // === Formula errors ===
    #[error("Failed to evaluate '{formula}': {message}")]
    Evaluation { formula: String, message: String },

    #[error("Formula parse error in '{formula}' at {position}: {message}")]
    FormulaParse {
        formula: String,
        position: usize,
        message: String,
    },

    // === Configuration errors ===
    #[error("Operation '{operation}' references unresolved placeholder '#{placeholder}'")]
    UnresolvedPlaceholder {
        operation: String,
        placeholder: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Activity validation failed: {0}")]
    Validation(String),

    // === Resumption errors ===
    #[error("Invalid input for operation '{operation}': {message}")]
    InvalidInput { operation: String, message: String },

    #[error("No pending prompt matches resume token '{0}'")]
    UnknownResumeToken(String),

    #[error("Activity has no pending prompt")]
    NothingPending,

    // === Store errors ===
    #[error("Entity '{0}' not found")]
    EntityNotFound(EntityId),

    // === Generic ===
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Coarse classification of a [`RulebookError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Precondition,
    Evaluation,
    Cancellation,
    Configuration,
    Internal,
}

impl RulebookError {
    pub fn precondition(operation: impl Into<String>, message: impl Into<String>) -> Self {
        RulebookError::Precondition {
            operation: operation.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            RulebookError::Precondition { .. } | RulebookError::EntityNotFound(_) => {
                FailureKind::Precondition
            }
            RulebookError::Evaluation { .. } | RulebookError::FormulaParse { .. } => {
                FailureKind::Evaluation
            }
            RulebookError::Cancelled { .. } => FailureKind::Cancellation,
            RulebookError::UnresolvedPlaceholder { .. }
            | RulebookError::Configuration(_)
            | RulebookError::Validation(_) => FailureKind::Configuration,
            _ => FailureKind::Internal,
        }
    }

    /// Returns `true` if the error should stop the current branch.
    ///
    /// Malformed expressions degrade to a zero value instead.
    pub fn halts_branch(&self) -> bool {
        self.kind() != FailureKind::Evaluation
    }
}

/// A convenience alias for `Result<T, RulebookError>`.
pub type Result<T> = std::result::Result<T, RulebookError>;

// ---------------------------------------------------------------------------
// RollData: flat key/value context for formula evaluation
// ---------------------------------------------------------------------------

/// Flat data context keyed by dotted paths (`attributes.agi.value`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RollData {
    values: BTreeMap<String, Value>,
}

impl RollData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flatten a nested JSON tree into dotted keys. Arrays are kept as leaves.
    pub fn from_json(tree: &Value) -> Self {
        let mut data = Self::new();
        data.extend_from_json("", tree);
        data
    }

    /// Flatten `tree` under `prefix` (no prefix when empty).
    pub fn extend_from_json(&mut self, prefix: &str, tree: &Value) {
        match tree {
            Value::Object(map) => {
                for (key, child) in map {
                    let path = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{prefix}.{key}")
                    };
                    self.extend_from_json(&path, child);
                }
            }
            leaf if !prefix.is_empty() => {
                self.values.insert(prefix.to_string(), leaf.clone());
            }
            _ => {}
        }
    }

    pub fn insert(&mut self, path: impl Into<String>, value: Value) {
        self.values.insert(path.into(), value);
    }

    pub fn get(&self, path: &str) -> Option<&Value> {
        self.values.get(path)
    }

    /// Numeric view of a path. Booleans count as 1/0, numeric strings are parsed.
    pub fn get_number(&self, path: &str) -> Option<f64> {
        self.values.get(path).and_then(value_as_number)
    }

    /// Copy every entry of `other` into this context under `prefix.`.
    pub fn merge_prefixed(&mut self, prefix: &str, other: &RollData) {
        for (key, value) in &other.values {
            self.values.insert(format!("{prefix}.{key}"), value.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Interpret a JSON value as a number where that is unambiguous.
pub fn value_as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Targets
// ---------------------------------------------------------------------------

/// How a target is disposed towards the acting entity's side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Friendly,
    #[default]
    Neutral,
    Hostile,
    Secret,
}

/// The evaluated data of one target, bound to `operation_data.target` for the
/// duration of a forked continuation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSnapshot {
    pub id: EntityId,
    pub name: String,
    pub disposition: Disposition,
    pub roll_data: RollData,
}

// ---------------------------------------------------------------------------
// OperationData: scratch map shared by the steps of one activity
// ---------------------------------------------------------------------------

/// Scratch map keyed by operation id. Each operation owns one JSON object
/// (`{"value": ..., ...}`); the reserved key `target` holds the bound target.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationData {
    values: BTreeMap<String, Value>,
}

impl OperationData {
    /// Reserved key for the target bound by the current fork.
    pub const TARGET_KEY: &'static str = "target";

    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a key.
    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// The last `value` recorded for an operation.
    pub fn value_of(&self, operation_id: &str) -> Option<&Value> {
        self.values
            .get(operation_id)
            .and_then(|record| record.get("value"))
            .filter(|v| !v.is_null())
    }

    /// Record `value` for an operation, keeping the other fields of its record.
    pub fn set_value(&mut self, operation_id: &str, value: Value) {
        self.record_mut(operation_id).insert("value".into(), value);
    }

    /// Merge extra fields into an operation's record.
    pub fn merge_record(&mut self, operation_id: &str, fields: Map<String, Value>) {
        let record = self.record_mut(operation_id);
        record.extend(fields);
    }

    fn record_mut(&mut self, operation_id: &str) -> &mut Map<String, Value> {
        let slot = self
            .values
            .entry(operation_id.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            let previous = std::mem::take(slot);
            let mut map = Map::new();
            map.insert("value".into(), previous);
            *slot = Value::Object(map);
        }
        match slot {
            Value::Object(map) => map,
            _ => unreachable!("record slot was normalised to an object"),
        }
    }

    /// Bind (or clear) the target of the current fork.
    pub fn bind_target(&mut self, target: Option<&TargetSnapshot>) {
        match target.and_then(|t| serde_json::to_value(t).ok()) {
            Some(value) => {
                self.values.insert(Self::TARGET_KEY.into(), value);
            }
            None => {
                self.values.remove(Self::TARGET_KEY);
            }
        }
    }

    /// The target bound by the current fork, if any.
    pub fn target(&self) -> Option<TargetSnapshot> {
        self.values
            .get(Self::TARGET_KEY)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Merge `updates` into the map. Existing keys not present in `updates`
    /// are preserved.
    pub fn apply_updates(&mut self, updates: HashMap<String, Value>) {
        self.values.extend(updates);
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.values.keys()
    }

    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.values.clone()
    }
}

// ---------------------------------------------------------------------------
// StepStatus / Outcome: result of executing one operation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Advance to the next operation.
    Success,
    /// The operation did not run (gating); the walk advances.
    Skipped,
    /// Stop the current branch.
    Halted,
    /// Re-run the rest of the pipeline once per listed target.
    Forked,
    /// Wait for user input.
    Suspended,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub status: StepStatus,
    /// Value recorded under `operation_data[id].value`.
    pub value: Option<Value>,
    /// Extra fields merged into the operation's record.
    pub record: Map<String, Value>,
    /// Fork targets, for `Forked`.
    pub targets: Vec<TargetSnapshot>,
    /// Prompt to present, for `Suspended`.
    pub prompt: Option<Prompt>,
    /// Continue from this operation id instead of the next one.
    pub jump_to: Option<String>,
    pub notes: String,
    pub failure_reason: Option<String>,
}

impl Outcome {
    fn with_status(status: StepStatus) -> Self {
        Self {
            status,
            value: None,
            record: Map::new(),
            targets: Vec::new(),
            prompt: None,
            jump_to: None,
            notes: String::new(),
            failure_reason: None,
        }
    }

    /// Create a successful outcome with the given notes.
    pub fn success(notes: impl Into<String>) -> Self {
        let mut outcome = Self::with_status(StepStatus::Success);
        outcome.notes = notes.into();
        outcome
    }

    /// Create a skipped outcome with the given reason.
    pub fn skipped(reason: impl Into<String>) -> Self {
        let mut outcome = Self::with_status(StepStatus::Skipped);
        outcome.notes = reason.into();
        outcome
    }

    /// Create a halted outcome with the given reason.
    pub fn halted(reason: impl Into<String>) -> Self {
        let mut outcome = Self::with_status(StepStatus::Halted);
        outcome.failure_reason = Some(reason.into());
        outcome
    }

    /// Fork the remaining pipeline over `targets`.
    pub fn forked(targets: Vec<TargetSnapshot>, notes: impl Into<String>) -> Self {
        let mut outcome = Self::with_status(StepStatus::Forked);
        outcome.targets = targets;
        outcome.notes = notes.into();
        outcome
    }

    /// Suspend until the user answers `prompt`.
    pub fn suspended(prompt: Prompt) -> Self {
        let mut outcome = Self::with_status(StepStatus::Suspended);
        outcome.notes = prompt.title.clone();
        outcome.prompt = Some(prompt);
        outcome
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.record.insert(key.into(), value);
        self
    }

    pub fn jump(mut self, operation_id: impl Into<String>) -> Self {
        self.jump_to = Some(operation_id.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Prompts and user input
// ---------------------------------------------------------------------------

/// One selectable entry offered to the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    pub value: String,
    pub label: String,
}

impl Choice {
    pub fn new(value: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            label: label.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PromptKind {
    /// Pick one of the listed entries.
    Select { choices: Vec<Choice> },
    /// Enter a number.
    Number {
        default: Option<f64>,
        min: Option<f64>,
        max: Option<f64>,
    },
    /// Wait for an external routine to finish.
    Acknowledge,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prompt {
    pub title: String,
    #[serde(flatten)]
    pub kind: PromptKind,
}

impl Prompt {
    pub fn select(title: impl Into<String>, choices: Vec<Choice>) -> Self {
        Self {
            title: title.into(),
            kind: PromptKind::Select { choices },
        }
    }

    pub fn number(
        title: impl Into<String>,
        default: Option<f64>,
        min: Option<f64>,
        max: Option<f64>,
    ) -> Self {
        Self {
            title: title.into(),
            kind: PromptKind::Number { default, min, max },
        }
    }

    pub fn acknowledge(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            kind: PromptKind::Acknowledge,
        }
    }
}

/// What the user answered to a pending prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum UserInput {
    Choice(String),
    Number(f64),
    Acknowledge,
    Dismiss,
}

// ---------------------------------------------------------------------------
// PendingResume: persisted continuation for a suspended run
// ---------------------------------------------------------------------------

/// A fork point still owed continuations for some targets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkFrame {
    /// Id of the operation that forked.
    pub origin: String,
    /// Position (in execution order) each continuation starts at.
    pub resume_at: usize,
    /// Targets whose continuation has not started yet.
    pub remaining: VecDeque<TargetSnapshot>,
    /// Target bound when the fork happened, restored once it is exhausted.
    pub outer_target: Option<TargetSnapshot>,
}

/// Everything needed to re-enter a suspended run by token after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingResume {
    pub token: String,
    pub operation_id: String,
    pub position: usize,
    pub prompt: Prompt,
    pub target: Option<TargetSnapshot>,
    pub forks: Vec<ForkFrame>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl PendingResume {
    /// Generate a fresh, unguessable resume token.
    pub fn new_token() -> String {
        uuid::Uuid::new_v4().to_string()
    }
}
