//! Pipeline runner: the walk over an activity's operations.
//!
//! The walk visits operations in priority order. Forks are an explicit stack
//! of [`ForkFrame`]s: each frame remembers where the continuation starts and
//! which targets still owe one, so a suspension inside a fork can be
//! persisted on the activity and resumed by token after a restart.

use rulebook_types::{
    FailureKind, ForkFrame, PendingResume, Prompt, Result, RulebookError, StepStatus,
    TargetSnapshot, UserInput,
};
use serde::Serialize;

use crate::activity::Activity;
use crate::context::ExecutionContext;
use crate::events::{ActivityEvent, NotificationLevel};
use crate::handlers::{self, num, Step};
use crate::operation::{CostCategory, Operation};
use crate::prompter::Prompter;
use crate::store::Change;
use crate::validation::validate_or_raise;

/// Invalid answers tolerated from a prompter before the prompt is dismissed.
const MAX_INVALID_ANSWERS: usize = 3;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Start at this operation instead of the first one.
    pub start_operation: Option<String>,
}

impl RunOptions {
    pub fn starting_at(operation_id: impl Into<String>) -> Self {
        Self {
            start_operation: Some(operation_id.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    /// Every branch ran to the end.
    Completed,
    /// At least one branch stopped early.
    Halted,
    /// Waiting for input; pass `token` to [`PipelineRunner::resume`].
    Suspended { token: String, prompt: Prompt },
}

/// One executed (or skipped) operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRecord {
    pub operation: String,
    pub target: Option<String>,
    pub status: StepStatus,
    pub notes: String,
}

/// One branch that stopped early.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HaltRecord {
    pub operation: String,
    pub target: Option<String>,
    pub kind: FailureKind,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub steps: Vec<StepRecord>,
    pub halts: Vec<HaltRecord>,
}

impl RunReport {
    fn new() -> Self {
        Self {
            status: RunStatus::Completed,
            steps: Vec::new(),
            halts: Vec::new(),
        }
    }

    /// How many times an operation ran (skips excluded).
    pub fn executions(&self, operation_id: &str) -> usize {
        self.steps
            .iter()
            .filter(|s| s.operation == operation_id && s.status != StepStatus::Skipped)
            .count()
    }

    /// Targets bound while an operation ran, in execution order.
    pub fn targets_of(&self, operation_id: &str) -> Vec<Option<String>> {
        self.steps
            .iter()
            .filter(|s| s.operation == operation_id && s.status != StepStatus::Skipped)
            .map(|s| s.target.clone())
            .collect()
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self.status, RunStatus::Suspended { .. })
    }

    /// Fold the report of a resumed continuation into this one.
    fn absorb(&mut self, next: RunReport) {
        self.steps.extend(next.steps);
        self.halts.extend(next.halts);
        self.status = next.status;
    }
}

/// Where the walk is.
struct Cursor {
    position: usize,
    target: Option<TargetSnapshot>,
    forks: Vec<ForkFrame>,
}

// ---------------------------------------------------------------------------
// PipelineRunner
// ---------------------------------------------------------------------------

/// Drives activities within one execution context.
pub struct PipelineRunner {
    ctx: ExecutionContext,
}

impl PipelineRunner {
    pub fn new(ctx: ExecutionContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    /// Start a new invocation. Clears any pending prompt and the set of
    /// already-charged operations.
    pub async fn run(&self, activity: &mut Activity, options: RunOptions) -> Result<RunReport> {
        validate_or_raise(activity)?;

        if let Some(stale) = activity.pending.take() {
            tracing::warn!(operation = %stale.operation_id, "Discarding unanswered prompt");
        }
        activity.charged.clear();
        activity.operation_data.bind_target(None);

        let position = match &options.start_operation {
            Some(id) => self.position_of(activity, id)?,
            None => 0,
        };

        tracing::info!(
            activity = %activity.id,
            operations = activity.operations.len(),
            actor = %self.ctx.actor,
            "Running activity"
        );
        self.ctx.events.emit(ActivityEvent::RunStarted {
            activity: activity.id.clone(),
            operation_count: activity.operations.len(),
        });

        let cursor = Cursor {
            position,
            target: None,
            forks: Vec::new(),
        };
        self.drive(activity, cursor, options.start_operation.is_some(), None)
            .await
    }

    /// Walk from `operation_id` (which runs even when deferred) to the end,
    /// within the current invocation.
    pub async fn continue_execution_from(
        &self,
        activity: &mut Activity,
        operation_id: &str,
    ) -> Result<RunReport> {
        let position = self.position_of(activity, operation_id)?;
        activity.pending = None;
        let cursor = Cursor {
            position,
            target: activity.operation_data.target(),
            forks: Vec::new(),
        };
        self.drive(activity, cursor, true, None).await
    }

    /// Answer the pending prompt and continue the suspended walk.
    ///
    /// An answer the operation rejects returns [`RulebookError::InvalidInput`]
    /// and leaves the prompt pending.
    pub async fn resume(
        &self,
        activity: &mut Activity,
        token: &str,
        input: UserInput,
    ) -> Result<RunReport> {
        let pending = activity.pending.clone().ok_or(RulebookError::NothingPending)?;
        if pending.token != token {
            return Err(RulebookError::UnknownResumeToken(token.to_string()));
        }
        let order = activity.execution_order();
        let still_there = order
            .get(pending.position)
            .is_some_and(|&i| activity.operations[i].id == pending.operation_id);
        if !still_there {
            return Err(RulebookError::Configuration(format!(
                "suspended operation '{}' is no longer at its position",
                pending.operation_id
            )));
        }

        tracing::info!(operation = %pending.operation_id, "Resuming activity");
        activity.operation_data.bind_target(pending.target.as_ref());
        let cursor = Cursor {
            position: pending.position,
            target: pending.target,
            forks: pending.forks,
        };
        self.drive(activity, cursor, true, Some(input)).await
    }

    /// Run, answering every prompt through `prompter` until the walk ends.
    pub async fn run_with_prompter(
        &self,
        activity: &mut Activity,
        options: RunOptions,
        prompter: &dyn Prompter,
    ) -> Result<RunReport> {
        let mut report = self.run(activity, options).await?;
        let mut invalid = 0;
        while let RunStatus::Suspended { token, prompt } = report.status.clone() {
            let input = if invalid >= MAX_INVALID_ANSWERS {
                UserInput::Dismiss
            } else {
                prompter.ask(&prompt).await?
            };
            match self.resume(activity, &token, input).await {
                Ok(next) => {
                    invalid = 0;
                    report.absorb(next);
                }
                Err(RulebookError::InvalidInput { message, .. }) => {
                    invalid += 1;
                    self.ctx.notify(NotificationLevel::Warning, message);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    fn position_of(&self, activity: &Activity, operation_id: &str) -> Result<usize> {
        activity.position_of(operation_id).ok_or_else(|| {
            RulebookError::Configuration(format!("unknown operation '{operation_id}'"))
        })
    }

    // -----------------------------------------------------------------------
    // The walk
    // -----------------------------------------------------------------------

    async fn drive(
        &self,
        activity: &mut Activity,
        mut cursor: Cursor,
        mut explicit: bool,
        mut input: Option<UserInput>,
    ) -> Result<RunReport> {
        let order = activity.execution_order();
        let end = order.len();
        let mut report = RunReport::new();

        loop {
            if cursor.position >= end {
                if self.next_branch(activity, &mut cursor) {
                    continue;
                }
                break;
            }

            let op = activity.operations[order[cursor.position]].clone();
            let target_id = cursor.target.as_ref().map(|t| t.id.clone());
            let answer = input.take();
            let resuming = answer.is_some();
            let selected = std::mem::take(&mut explicit);

            if !resuming {
                if !op.execute_immediately && !selected {
                    tracing::debug!(operation = %op.id, "Deferred operation not selected");
                    cursor.position += 1;
                    continue;
                }

                if let Some(reason) = self.performance_block(&op) {
                    tracing::info!(operation = %op.id, %reason, "Operation skipped");
                    self.ctx.events.emit(ActivityEvent::OperationSkipped {
                        operation: op.id.clone(),
                        reason: reason.clone(),
                    });
                    report.steps.push(StepRecord {
                        operation: op.id.clone(),
                        target: target_id,
                        status: StepStatus::Skipped,
                        notes: reason,
                    });
                    cursor.position += 1;
                    continue;
                }

                if let Err(e) = self.charge_costs(activity, &op).await {
                    self.halt(&mut report, &op, target_id, e.kind(), e.to_string());
                    cursor.position = end;
                    continue;
                }
            }

            if answer == Some(UserInput::Dismiss) {
                activity.pending = None;
                let cancelled = RulebookError::Cancelled {
                    operation: op.id.clone(),
                };
                self.halt(&mut report, &op, target_id, cancelled.kind(), cancelled.to_string());
                cursor.position = end;
                continue;
            }

            tracing::debug!(
                operation = %op.id,
                kind = op.kind.name(),
                target = ?target_id,
                "Executing operation"
            );
            self.ctx.events.emit(ActivityEvent::OperationStarted {
                operation: op.id.clone(),
                kind: op.kind.name().to_string(),
                target: target_id.clone(),
            });

            let result = match handlers::execute(&op, activity, &self.ctx, answer).await {
                Err(e @ RulebookError::InvalidInput { .. }) if resuming => {
                    tracing::warn!(operation = %op.id, error = %e, "Answer rejected");
                    return Err(e);
                }
                other => other,
            };
            if resuming {
                activity.pending = None;
            }

            let outcome = match result {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.halt(&mut report, &op, target_id, e.kind(), e.to_string());
                    cursor.position = end;
                    continue;
                }
            };

            if let Some(value) = &outcome.value {
                activity.operation_data.set_value(&op.id, value.clone());
            }
            if !outcome.record.is_empty() {
                activity
                    .operation_data
                    .merge_record(&op.id, outcome.record.clone());
            }
            self.ctx.events.emit(ActivityEvent::OperationCompleted {
                operation: op.id.clone(),
                status: outcome.status,
                value: outcome.value.clone(),
            });
            report.steps.push(StepRecord {
                operation: op.id.clone(),
                target: target_id.clone(),
                status: outcome.status,
                notes: outcome.notes.clone(),
            });

            match outcome.status {
                StepStatus::Success => {
                    self.toggle_effects(&op).await;
                    match &outcome.jump_to {
                        None => cursor.position += 1,
                        Some(next) => {
                            match order.iter().position(|&i| activity.operations[i].id == *next) {
                                Some(position) => {
                                    cursor.position = position;
                                    explicit = true;
                                }
                                None => {
                                    self.halt(
                                        &mut report,
                                        &op,
                                        target_id,
                                        FailureKind::Configuration,
                                        format!("continues from unknown operation '{next}'"),
                                    );
                                    cursor.position = end;
                                }
                            }
                        }
                    }
                }
                StepStatus::Skipped => cursor.position += 1,
                StepStatus::Halted => {
                    let reason = outcome.failure_reason.unwrap_or_else(|| "halted".into());
                    self.halt(&mut report, &op, target_id, FailureKind::Precondition, reason);
                    cursor.position = end;
                }
                StepStatus::Forked => {
                    self.toggle_effects(&op).await;
                    let ids: Vec<String> = outcome.targets.iter().map(|t| t.id.clone()).collect();
                    tracing::info!(operation = %op.id, targets = ?ids, "Forking");
                    self.ctx.events.emit(ActivityEvent::Forked {
                        operation: op.id.clone(),
                        targets: ids,
                    });
                    if !outcome.targets.is_empty() {
                        cursor.forks.push(ForkFrame {
                            origin: op.id.clone(),
                            resume_at: cursor.position + 1,
                            remaining: outcome.targets.into(),
                            outer_target: cursor.target.clone(),
                        });
                    }
                    // The continuations start from the frame.
                    cursor.position = end;
                }
                StepStatus::Suspended => {
                    let prompt = outcome
                        .prompt
                        .unwrap_or_else(|| Prompt::acknowledge(op.label()));
                    let token = PendingResume::new_token();
                    tracing::info!(operation = %op.id, %token, "Waiting for input");
                    self.ctx.events.emit(ActivityEvent::Suspended {
                        operation: op.id.clone(),
                        token: token.clone(),
                    });
                    activity.pending = Some(PendingResume {
                        token: token.clone(),
                        operation_id: op.id.clone(),
                        position: cursor.position,
                        prompt: prompt.clone(),
                        target: cursor.target,
                        forks: cursor.forks,
                        created_at: chrono::Utc::now(),
                    });
                    report.status = RunStatus::Suspended { token, prompt };
                    return Ok(report);
                }
            }
        }

        report.status = if report.halts.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::Halted
        };
        let status = match report.status {
            RunStatus::Completed => "completed",
            _ => "halted",
        };
        tracing::info!(activity = %activity.id, status, "Activity finished");
        self.ctx.events.emit(ActivityEvent::RunFinished {
            activity: activity.id.clone(),
            status: status.into(),
        });
        Ok(report)
    }

    /// Move to the next target owed a continuation, unwinding exhausted
    /// frames. Returns `false` when no fork has work left.
    fn next_branch(&self, activity: &mut Activity, cursor: &mut Cursor) -> bool {
        while let Some(mut frame) = cursor.forks.pop() {
            if let Some(target) = frame.remaining.pop_front() {
                tracing::debug!(origin = %frame.origin, target = %target.id, "Starting branch");
                activity.operation_data.bind_target(Some(&target));
                cursor.position = frame.resume_at;
                cursor.target = Some(target);
                cursor.forks.push(frame);
                return true;
            }
            activity
                .operation_data
                .bind_target(frame.outer_target.as_ref());
            cursor.target = frame.outer_target;
        }
        false
    }

    fn halt(
        &self,
        report: &mut RunReport,
        op: &Operation,
        target: Option<String>,
        kind: FailureKind,
        reason: String,
    ) {
        tracing::warn!(operation = %op.id, target = ?target, ?kind, %reason, "Branch halted");
        let level = match kind {
            FailureKind::Cancellation => NotificationLevel::Info,
            FailureKind::Internal => NotificationLevel::Error,
            _ => NotificationLevel::Warning,
        };
        self.ctx
            .events
            .notify(level, format!("{}: {reason}", op.label()));
        self.ctx.events.emit(ActivityEvent::BranchHalted {
            operation: op.id.clone(),
            target: target.clone(),
            kind,
            reason: reason.clone(),
        });
        report.halts.push(HaltRecord {
            operation: op.id.clone(),
            target,
            kind,
            reason,
        });
    }

    /// Why the operation may not run now, if it may not.
    fn performance_block(&self, op: &Operation) -> Option<String> {
        let performance = &op.performance;
        match self.ctx.actors_turn() {
            None if performance.combat_only => Some("only usable in combat".into()),
            Some(true) if !performance.own_turn => Some("not usable on your own turn".into()),
            Some(false) if !performance.others_turn => {
                Some("not usable on another combatant's turn".into())
            }
            _ => None,
        }
    }

    /// Deduct action points and stamina, once per operation per invocation.
    async fn charge_costs(&self, activity: &mut Activity, op: &Operation) -> Result<()> {
        let rules = &self.ctx.rules;
        if !rules.enforce_costs || op.costs.is_free() || activity.charged.contains(&op.id) {
            return Ok(());
        }
        if rules.costs_in_combat_only && self.ctx.combat.is_none() {
            return Ok(());
        }

        let step = Step { op, ctx: &self.ctx };
        let actor = step.actor().await?;
        let roll = step.roll_data(&actor, activity);
        let actions = step
            .evaluate(&activity.operation_data, &op.costs.actions, &roll)?
            .total
            .max(0.0);
        let stamina = step
            .evaluate(&activity.operation_data, &op.costs.stamina, &roll)?
            .total
            .max(0.0);

        let paths = &rules.paths;
        let pool = match op.costs.category {
            CostCategory::Turn => &paths.turn_points,
            CostCategory::Interrupt => &paths.interrupt_points,
            CostCategory::Current if self.ctx.actors_turn() == Some(true) => &paths.turn_points,
            CostCategory::Current => &paths.interrupt_points,
        };

        let mut changes = Vec::new();
        for (path, cost, what) in [(pool, actions, "action points"), (&paths.stamina, stamina, "stamina")] {
            if cost <= 0.0 {
                continue;
            }
            let value_path = format!("{path}.value");
            let available = actor.number(&value_path).unwrap_or(0.0);
            if cost > available {
                return Err(step.precondition(format!(
                    "needs {} {what}, {} has {}",
                    rulebook_formula::format_number(cost),
                    actor.name,
                    rulebook_formula::format_number(available)
                )));
            }
            changes.push(Change::set(value_path, num(available - cost)));
        }
        if !changes.is_empty() {
            self.ctx.store.update(&actor.id, changes).await?;
        }
        activity.charged.insert(op.id.clone());

        tracing::info!(operation = %op.id, pool = %pool, actions, stamina, "Costs charged");
        self.ctx.events.emit(ActivityEvent::CostCharged {
            operation: op.id.clone(),
            pool: pool.clone(),
            actions,
            stamina,
        });
        Ok(())
    }

    /// Flip the operation's status effects on the actor. Failures only warn.
    async fn toggle_effects(&self, op: &Operation) {
        let toggles = &op.toggle_active_effects;
        if toggles.statuses.is_empty() {
            return;
        }
        let store = &self.ctx.store;
        let actor = match store.entity(&self.ctx.actor).await {
            Ok(actor) => actor,
            Err(e) => {
                tracing::warn!(operation = %op.id, error = %e, "Cannot toggle effects");
                return;
            }
        };
        let changes = toggles
            .statuses
            .iter()
            .map(|status| Change::ToggleStatus {
                status: status.clone(),
            })
            .collect();
        if let Err(e) = store.update(&actor.id, changes).await {
            tracing::warn!(operation = %op.id, error = %e, "Cannot toggle effects");
            return;
        }
        if toggles.notify {
            for status in &toggles.statuses {
                let verb = if actor.statuses.contains(status) {
                    "loses"
                } else {
                    "gains"
                };
                self.ctx
                    .notify(NotificationLevel::Info, format!("{} {verb} {status}", actor.name));
            }
        }
    }
}
