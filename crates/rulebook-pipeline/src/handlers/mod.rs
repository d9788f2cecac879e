//! Executors for every operation kind, dispatched by one exhaustive match.

mod actor;
mod combat;
mod flow;
mod resources;

use rulebook_formula::{substitute_placeholders, Evaluation};
use rulebook_types::{
    OperationData, Outcome, Result, RollData, RulebookError, TargetSnapshot, UserInput,
};
use serde_json::{json, Value};

use crate::activity::Activity;
use crate::context::ExecutionContext;
use crate::events::NotificationLevel;
use crate::operation::{Operation, OperationKind};
use crate::store::Entity;

/// Run one operation. `input` is the user's answer when re-entering a
/// suspended operation.
pub(crate) async fn execute(
    op: &Operation,
    activity: &mut Activity,
    ctx: &ExecutionContext,
    input: Option<UserInput>,
) -> Result<Outcome> {
    let step = Step { op, ctx };
    match &op.kind {
        OperationKind::Attack(a) => combat::attack(&step, a, activity).await,
        OperationKind::Check(c) => combat::check(&step, c, activity).await,
        OperationKind::Test(t) => combat::test(&step, t, activity).await,
        OperationKind::Condition(c) => flow::condition(&step, c, activity).await,
        OperationKind::Target(t) => flow::target(&step, t).await,
        OperationKind::Use(u) => actor::use_item(&step, u, activity, input).await,
        OperationKind::CreateResource(c) => resources::create(&step, c, activity).await,
        OperationKind::ConsumeResource(c) => resources::consume(&step, c, activity).await,
        OperationKind::Heal(h) => resources::heal(&step, h, activity).await,
        OperationKind::Consumption(c) => resources::consumption(&step, c, activity).await,
        OperationKind::SetFlag(s) => actor::set_flag(&step, s, activity).await,
        OperationKind::Variable(v) => flow::variable(&step, v, input),
        OperationKind::Travel(t) => actor::travel(&step, t, activity).await,
        OperationKind::SelectOperation(s) => flow::select_operation(&step, s, activity, input),
        OperationKind::SelectOption(s) => flow::select_option(&step, s, input),
        OperationKind::Message(m) => flow::message(&step, m, activity),
    }
}

/// The operation being executed and its context.
pub(crate) struct Step<'a> {
    pub op: &'a Operation,
    pub ctx: &'a ExecutionContext,
}

impl Step<'_> {
    pub fn precondition(&self, message: impl Into<String>) -> RulebookError {
        RulebookError::precondition(self.op.id.clone(), message)
    }

    pub fn invalid_input(&self, message: impl Into<String>) -> RulebookError {
        RulebookError::InvalidInput {
            operation: self.op.id.clone(),
            message: message.into(),
        }
    }

    pub fn notify(&self, level: NotificationLevel, message: impl Into<String>) {
        self.ctx.notify(level, message);
    }

    pub async fn actor(&self) -> Result<Entity> {
        self.ctx.actor_entity(&self.op.id).await
    }

    /// Replace `#id` tokens with recorded operation values.
    pub fn substitute(&self, data: &OperationData, formula: &str) -> Result<String> {
        substitute_placeholders(formula, &self.op.id, &|id: &str| data.value_of(id).cloned())
    }

    /// Substitute placeholders, then evaluate. A malformed formula counts as
    /// zero after a warning; an unresolved placeholder is an error.
    pub fn evaluate(&self, data: &OperationData, formula: &str, roll: &RollData) -> Result<Evaluation> {
        let resolved = self.substitute(data, formula)?;
        match self.ctx.evaluator.evaluate(&resolved, roll) {
            Ok(evaluation) => Ok(evaluation),
            Err(e) if !e.halts_branch() => {
                tracing::warn!(operation = %self.op.id, error = %e, "Formula failed, using 0");
                self.ctx.events.notify(
                    NotificationLevel::Warning,
                    format!("{}: {e}; using 0", self.op.label()),
                );
                Ok(Evaluation {
                    total: 0.0,
                    formula: "0".into(),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// The actor's roll data plus `target.*` for a bound target and
    /// `activity.*` for the activity's own data.
    pub fn roll_data(&self, actor: &Entity, activity: &Activity) -> RollData {
        let mut data = actor.roll_data();
        if let Some(target) = activity.operation_data.target() {
            data.merge_prefixed("target", &target.roll_data);
        }
        data.extend_from_json("activity", &activity.system);
        data
    }

    /// The target bound by the current fork, otherwise every selected target.
    pub async fn targets(&self, activity: &Activity) -> Result<Vec<TargetSnapshot>> {
        match activity.operation_data.target() {
            Some(bound) => Ok(vec![bound]),
            None => self.selected_targets().await,
        }
    }

    /// Snapshots of the user-selected targets. Vanished targets are dropped
    /// with a warning.
    pub async fn selected_targets(&self) -> Result<Vec<TargetSnapshot>> {
        let mut snapshots = Vec::with_capacity(self.ctx.targets.len());
        for id in &self.ctx.targets {
            match self.ctx.store.entity(id).await {
                Ok(entity) => snapshots.push(entity.snapshot()),
                Err(RulebookError::EntityNotFound(_)) => self.notify(
                    NotificationLevel::Warning,
                    format!("Target '{id}' no longer exists"),
                ),
                Err(e) => return Err(e),
            }
        }
        Ok(snapshots)
    }
}

/// JSON number that stays integral when the value is.
pub(crate) fn num(n: f64) -> Value {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        json!(n as i64)
    } else {
        json!(n)
    }
}

#[cfg(test)]
pub(crate) mod testkit {
    use std::sync::Arc;

    use rulebook_formula::{DiceEvaluator, FixedRoller};
    use serde_json::json;

    use crate::context::ExecutionContext;
    use crate::store::{Entity, Item, MemoryStore};

    pub fn hero() -> Entity {
        Entity::new("hero", "Hero")
            .with_system(json!({
                "hp": {"value": 95, "max": 100},
                "stamina": {"value": 5, "max": 5},
                "actionPoints": {"turn": {"value": 3, "max": 3}, "interrupt": {"value": 1, "max": 1}},
                "checks": {"agi": 2, "will": 1},
                "travel": {"speed": 6}
            }))
            .with_item(Item {
                id: "herb".into(),
                name: "Healing Herb".into(),
                slot: Some("pouch".into()),
                quantity: 2,
                consumable: true,
            })
    }

    pub fn goblin(id: &str) -> Entity {
        Entity::new(id, format!("Goblin {id}"))
            .with_disposition(rulebook_types::Disposition::Hostile)
            .with_system(json!({"hp": {"value": 7, "max": 7}, "armor": 1, "checks": {"agi": 0}}))
    }

    /// Context over a store with the hero and the given goblins, rolling the
    /// scripted faces (then 1s).
    pub fn context(goblins: &[&str], faces: Vec<u32>) -> (ExecutionContext, Arc<MemoryStore>) {
        let mut entities = vec![hero()];
        entities.extend(goblins.iter().map(|id| goblin(id)));
        let store = Arc::new(MemoryStore::with_entities(entities));
        let ctx = ExecutionContext::new("hero", store.clone())
            .with_targets(goblins.iter().copied())
            .with_evaluator(Arc::new(DiceEvaluator::new(FixedRoller::new(faces).with_fallback(1))));
        (ctx, store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{Message, OperationKind};

    #[test]
    fn num_keeps_integers_integral() {
        assert_eq!(num(6.0), json!(6));
        assert_eq!(num(2.5), json!(2.5));
        assert_eq!(num(-1.0), json!(-1));
    }

    #[tokio::test]
    async fn malformed_formula_degrades_to_zero() {
        let (ctx, _) = testkit::context(&[], vec![]);
        let op = Operation::new("m", OperationKind::Message(Message::default()));
        let step = Step { op: &op, ctx: &ctx };
        let ev = step
            .evaluate(&OperationData::new(), "2 +", &RollData::new())
            .unwrap();
        assert_eq!(ev.total, 0.0);
    }

    #[tokio::test]
    async fn unresolved_placeholder_is_an_error() {
        let (ctx, _) = testkit::context(&[], vec![]);
        let op = Operation::new("m", OperationKind::Message(Message::default()));
        let step = Step { op: &op, ctx: &ctx };
        let err = step
            .evaluate(&OperationData::new(), "#missing + 1", &RollData::new())
            .unwrap_err();
        assert!(matches!(err, RulebookError::UnresolvedPlaceholder { .. }));
    }

    #[tokio::test]
    async fn roll_data_exposes_target_and_activity() {
        let (ctx, _) = testkit::context(&["g1"], vec![]);
        let op = Operation::new("m", OperationKind::Message(Message::default()));
        let step = Step { op: &op, ctx: &ctx };
        let mut activity = Activity::new("a", "A").with_system(json!({"tier": 2}));
        activity
            .operation_data
            .bind_target(Some(&testkit::goblin("g1").snapshot()));

        let data = step.roll_data(&testkit::hero(), &activity);
        assert_eq!(data.get_number("hp.value"), Some(95.0));
        assert_eq!(data.get_number("target.hp.value"), Some(7.0));
        assert_eq!(data.get_number("activity.tier"), Some(2.0));

        let targets = step.targets(&activity).await.unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].id, "g1");
    }
}
