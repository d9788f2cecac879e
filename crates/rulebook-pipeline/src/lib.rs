//! Operation pipeline runner, operation variants, and their collaborators.
//!
//! This crate implements the core Rulebook activity engine: priority-ordered
//! operation walks with per-target forks, cost and performance gating,
//! suspension and resume by token, the resource ledger, validation lints,
//! and activity persistence.

pub mod activity;
pub mod condition;
pub mod config;
pub mod context;
pub mod engine;
pub mod events;
mod handlers;
pub mod ledger;
pub mod operation;
pub mod persistence;
pub mod prompter;
pub mod store;
pub mod validation;

pub use activity::Activity;
pub use condition::{compare, parse_literal, Comparison, Predicate, PredicateSource};
pub use config::{AttributePaths, Role, RulesConfig, TieBreak};
pub use context::{CombatState, ConsumeOnUse, ExecutionContext, ItemUse, ItemUser};
pub use engine::{HaltRecord, PipelineRunner, RunOptions, RunReport, RunStatus, StepRecord};
pub use events::{ActivityEvent, DamageInstance, EventEmitter, NotificationLevel};
pub use ledger::{LedgerError, ResetTrigger, ResourceLedger, ResourceRecord};
pub use operation::{CostCategory, Costs, Operation, OperationKind, Performance, ToggleEffects};
pub use persistence::{clear_pending, load_activity, save_activity, SavedActivity};
pub use prompter::{AutoPrompter, ConsolePrompter, Prompter, RecordingPrompter};
pub use store::{Change, Deriver, Entity, Item, MemoryStore, StateStore};
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity};
