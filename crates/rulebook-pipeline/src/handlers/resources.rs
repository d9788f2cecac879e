//! Ledger resources and restoration: `createResource`, `consumeResource`,
//! `heal`, and `consumption`.

use rulebook_formula::format_number;
use rulebook_types::{Outcome, Result};
use serde::Serialize;
use serde_json::json;

use super::{num, Step};
use crate::activity::Activity;
use crate::events::{ActivityEvent, NotificationLevel};
use crate::ledger::ResourceRecord;
use crate::operation::{Component, ConsumeResource, Consumption, CreateResource, Heal, Recipient};
use crate::store::{Change, Entity};

pub(super) async fn create(
    step: &Step<'_>,
    create: &CreateResource,
    activity: &mut Activity,
) -> Result<Outcome> {
    if let Some(existing) = activity.ledger.get(&step.op.id) {
        tracing::debug!(operation = %step.op.id, "Resource already created");
        return Ok(Outcome::success(format!("{} already exists", existing.resource_name))
            .with_value(num(existing.value))
            .with_field("created", json!(false)));
    }

    let actor = step.actor().await?;
    let roll = step.roll_data(&actor, activity);
    let maximum = step
        .evaluate(&activity.operation_data, &create.maximum, &roll)?
        .total;

    activity.ledger.create(ResourceRecord {
        id: step.op.id.clone(),
        resource_name: create.resource_name.clone(),
        maximum_formula: create.maximum.clone(),
        maximum,
        value: maximum,
        negative_allowed: create.negative_allowed,
        reset: create.reset,
    });
    step.ctx.events.emit(ActivityEvent::ResourceChanged {
        operation: step.op.id.clone(),
        resource: create.resource_name.clone(),
        value: maximum,
    });

    Ok(Outcome::success(format!(
        "{} created with {}",
        create.resource_name,
        format_number(maximum)
    ))
    .with_value(num(maximum))
    .with_field("maximum", num(maximum))
    .with_field("created", json!(true)))
}

pub(super) async fn consume(
    step: &Step<'_>,
    consume: &ConsumeResource,
    activity: &mut Activity,
) -> Result<Outcome> {
    let Some(record) = activity.ledger.get(&consume.resource) else {
        return Err(step.precondition(format!(
            "resource '{}' has not been created",
            consume.resource
        )));
    };
    let name = record.resource_name.clone();

    let actor = step.actor().await?;
    let roll = step.roll_data(&actor, activity);
    let amount = step
        .evaluate(&activity.operation_data, &consume.amount, &roll)?
        .total;

    let remaining = activity
        .ledger
        .consume(&consume.resource, amount)
        .map_err(|e| step.precondition(e.to_string()))?;
    // The owning createResource's value mirrors the pool for `#id` lookups.
    activity
        .operation_data
        .set_value(&consume.resource, num(remaining));
    step.ctx.events.emit(ActivityEvent::ResourceChanged {
        operation: step.op.id.clone(),
        resource: name.clone(),
        value: remaining,
    });

    Ok(Outcome::success(format!(
        "spent {} {name}, {} left",
        format_number(amount),
        format_number(remaining)
    ))
    .with_value(num(amount))
    .with_field("remaining", num(remaining)))
}

#[derive(Debug, Serialize)]
struct Restored {
    resource: String,
    before: f64,
    after: f64,
}

pub(super) async fn heal(step: &Step<'_>, heal: &Heal, activity: &mut Activity) -> Result<Outcome> {
    let actor = step.actor().await?;
    let recipient = recipient_id(step, heal.recipient, activity).await?;
    let components = spend_components(step, &actor, &heal.components)?;

    let roll = step.roll_data(&actor, activity);
    let amount = step
        .evaluate(&activity.operation_data, &heal.formula, &roll)?
        .total;
    let pool = heal
        .resource
        .clone()
        .unwrap_or_else(|| step.ctx.rules.paths.hp.clone());

    let restored = restore(step, &actor, &recipient, &[(pool, amount)], components).await?;
    let gained: f64 = restored.iter().map(|r| r.after - r.before).sum();
    let resulting = restored.first().map(|r| r.after).unwrap_or_default();
    let notes = format!("restored {}", format_number(gained));
    step.notify(NotificationLevel::Info, notes.clone());

    Ok(Outcome::success(notes)
        .with_value(num(gained))
        .with_field("resulting", num(resulting))
        .with_field("restored", serde_json::to_value(&restored)?))
}

pub(super) async fn consumption(
    step: &Step<'_>,
    consumption: &Consumption,
    activity: &mut Activity,
) -> Result<Outcome> {
    let actor = step.actor().await?;
    let recipient = recipient_id(step, consumption.recipient, activity).await?;
    let components = spend_components(step, &actor, &consumption.components)?;

    let roll = step.roll_data(&actor, activity);
    let mut pools = Vec::with_capacity(consumption.restores.len());
    for entry in &consumption.restores {
        let amount = step
            .evaluate(&activity.operation_data, &entry.formula, &roll)?
            .total;
        pools.push((entry.resource.clone(), amount));
    }

    let restored = restore(step, &actor, &recipient, &pools, components).await?;
    let gained: f64 = restored.iter().map(|r| r.after - r.before).sum();
    let notes = restored
        .iter()
        .map(|r| format!("{} +{}", r.resource, format_number(r.after - r.before)))
        .collect::<Vec<_>>()
        .join(", ");
    step.notify(NotificationLevel::Info, format!("{}: {notes}", step.op.label()));

    Ok(Outcome::success(notes)
        .with_value(num(gained))
        .with_field("restored", serde_json::to_value(&restored)?))
}

async fn recipient_id(step: &Step<'_>, recipient: Recipient, activity: &Activity) -> Result<String> {
    match recipient {
        Recipient::Actor => Ok(step.ctx.actor.clone()),
        Recipient::Target => {
            let mut targets = step.targets(activity).await?;
            match targets.len() {
                1 => Ok(targets.remove(0).id),
                0 => Err(step.precondition("no target to restore")),
                n => Err(step.precondition(format!(
                    "{n} targets selected, restoring needs exactly one"
                ))),
            }
        }
    }
}

/// Quantity changes for the components, or a failure when stock is short.
fn spend_components(step: &Step<'_>, actor: &Entity, components: &[Component]) -> Result<Vec<Change>> {
    let mut changes = Vec::with_capacity(components.len());
    for component in components {
        let item = actor.item(&component.item).ok_or_else(|| {
            step.precondition(format!("{} has no {}", actor.name, component.item))
        })?;
        if item.quantity < component.quantity {
            return Err(step.precondition(format!(
                "not enough {}: need {}, have {}",
                item.name, component.quantity, item.quantity
            )));
        }
        changes.push(Change::ItemQuantity {
            item: item.id.clone(),
            quantity: item.quantity - component.quantity,
        });
    }
    Ok(changes)
}

/// Raise each pool by its amount, never past its maximum, and commit the
/// component spend alongside. Another recipient is restored before the
/// actor's components are spent, so a failed restore costs nothing.
async fn restore(
    step: &Step<'_>,
    actor: &Entity,
    recipient: &str,
    pools: &[(String, f64)],
    components: Vec<Change>,
) -> Result<Vec<Restored>> {
    let target = if recipient == actor.id {
        actor.clone()
    } else {
        step.ctx.store.entity(recipient).await?
    };

    let mut changes = Vec::with_capacity(pools.len());
    let mut restored = Vec::with_capacity(pools.len());
    for (pool, amount) in pools {
        let value_path = format!("{pool}.value");
        let before = target.number(&value_path).ok_or_else(|| {
            step.precondition(format!("{} has no '{pool}' to restore", target.name))
        })?;
        let mut after = before + amount.max(0.0);
        if let Some(max) = target.number(&format!("{pool}.max")) {
            after = after.min(max.max(before));
        }
        changes.push(Change::set(value_path, num(after)));
        restored.push(Restored {
            resource: pool.clone(),
            before,
            after,
        });
    }

    let store = &step.ctx.store;
    if recipient == actor.id {
        changes.extend(components);
        store.update(&actor.id, changes).await?;
    } else {
        store.update(recipient, changes).await?;
        if !components.is_empty() {
            store.update(&actor.id, components).await?;
        }
    }
    Ok(restored)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use rulebook_types::{RulebookError, StepStatus};
    use serde_json::json;

    use super::super::{execute, testkit};
    use crate::activity::Activity;
    use crate::context::ExecutionContext;
    use crate::ledger::ResetTrigger;
    use crate::operation::*;
    use crate::store::{Change, Entity, MemoryStore, StateStore};

    fn pool() -> Operation {
        Operation::new(
            "ki",
            OperationKind::CreateResource(CreateResource {
                resource_name: "Ki".into(),
                maximum: "@checks.agi + 1".into(),
                negative_allowed: false,
                reset: ResetTrigger::ShortRest,
            }),
        )
    }

    fn spend(amount: &str) -> Operation {
        Operation::new(
            "spend",
            OperationKind::ConsumeResource(ConsumeResource {
                resource: "ki".into(),
                amount: amount.into(),
            }),
        )
    }

    #[tokio::test]
    async fn create_then_consume() {
        let (ctx, _) = testkit::context(&[], vec![]);
        let mut activity = Activity::new("a", "A");

        let created = execute(&pool(), &mut activity, &ctx, None).await.unwrap();
        assert_eq!(created.value, Some(json!(3)));
        assert_eq!(activity.ledger.get("ki").unwrap().value, 3.0);

        let spent = execute(&spend("2"), &mut activity, &ctx, None).await.unwrap();
        assert_eq!(spent.record["remaining"], json!(1));
        assert_eq!(activity.operation_data.value_of("ki"), Some(&json!(1)));

        let again = execute(&pool(), &mut activity, &ctx, None).await.unwrap();
        assert_eq!(again.record["created"], json!(false));
        assert_eq!(activity.ledger.get("ki").unwrap().value, 1.0);
    }

    #[tokio::test]
    async fn consume_rejects_overdraw() {
        let (ctx, _) = testkit::context(&[], vec![]);
        let mut activity = Activity::new("a", "A");
        execute(&pool(), &mut activity, &ctx, None).await.unwrap();

        let err = execute(&spend("5"), &mut activity, &ctx, None).await.unwrap_err();
        assert!(matches!(err, RulebookError::Precondition { .. }));
        let err = execute(&spend("-1"), &mut activity, &ctx, None).await.unwrap_err();
        assert!(matches!(err, RulebookError::Precondition { .. }));
        assert_eq!(activity.ledger.get("ki").unwrap().value, 3.0);
    }

    #[tokio::test]
    async fn consume_before_create_fails() {
        let (ctx, _) = testkit::context(&[], vec![]);
        let err = execute(&spend("1"), &mut Activity::new("a", "A"), &ctx, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("has not been created"));
    }

    fn heal(formula: &str, components: Vec<Component>) -> Operation {
        Operation::new(
            "mend",
            OperationKind::Heal(Heal {
                formula: formula.into(),
                resource: None,
                recipient: Recipient::Actor,
                components,
            }),
        )
    }

    #[tokio::test]
    async fn heal_clamps_to_maximum_and_spends_components() {
        let (ctx, store) = testkit::context(&[], vec![]);
        let op = heal(
            "10",
            vec![Component {
                item: "herb".into(),
                quantity: 1,
            }],
        );
        let outcome = execute(&op, &mut Activity::new("a", "A"), &ctx, None)
            .await
            .unwrap();

        assert_eq!(outcome.status, StepStatus::Success);
        assert_eq!(outcome.value, Some(json!(5)));
        assert_eq!(outcome.record["resulting"], json!(100));
        let hero = store.entity("hero").await.unwrap();
        assert_eq!(hero.number("hp.value"), Some(100.0));
        assert_eq!(hero.item("herb").unwrap().quantity, 1);
    }

    #[tokio::test]
    async fn heal_refuses_when_components_are_short() {
        let (ctx, store) = testkit::context(&[], vec![]);
        let op = heal(
            "10",
            vec![Component {
                item: "herb".into(),
                quantity: 3,
            }],
        );
        let err = execute(&op, &mut Activity::new("a", "A"), &ctx, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RulebookError::Precondition { .. }));
        assert_eq!(
            store.entity("hero").await.unwrap().number("hp.value"),
            Some(95.0)
        );
    }

    /// Delegates to a memory store but refuses every update to `locked`.
    struct LockedStore {
        inner: MemoryStore,
        locked: &'static str,
    }

    #[async_trait]
    impl StateStore for LockedStore {
        async fn entity(&self, id: &str) -> rulebook_types::Result<Entity> {
            self.inner.entity(id).await
        }

        async fn update(&self, id: &str, changes: Vec<Change>) -> rulebook_types::Result<()> {
            if id == self.locked {
                return Err(RulebookError::Other(format!("'{id}' is locked")));
            }
            self.inner.update(id, changes).await
        }
    }

    #[tokio::test]
    async fn failed_target_restore_keeps_the_components() {
        let inner = MemoryStore::with_entities([testkit::hero(), testkit::goblin("g1")]);
        let store = Arc::new(LockedStore {
            inner: inner.clone(),
            locked: "g1",
        });
        let ctx = ExecutionContext::new("hero", store).with_targets(["g1"]);

        let mut op = heal(
            "3",
            vec![Component {
                item: "herb".into(),
                quantity: 1,
            }],
        );
        if let OperationKind::Heal(h) = &mut op.kind {
            h.recipient = Recipient::Target;
        }
        let err = execute(&op, &mut Activity::new("a", "A"), &ctx, None)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("locked"));
        assert_eq!(
            inner.entity("hero").await.unwrap().item("herb").unwrap().quantity,
            2
        );
    }

    #[tokio::test]
    async fn heal_target_and_consumption() {
        let (ctx, store) = testkit::context(&["g1"], vec![]);
        let mut activity = Activity::new("a", "A");
        store
            .update("g1", vec![Change::set("hp.value", json!(2))])
            .await
            .unwrap();

        let mut op = heal("3", vec![]);
        if let OperationKind::Heal(h) = &mut op.kind {
            h.recipient = Recipient::Target;
        }
        execute(&op, &mut activity, &ctx, None).await.unwrap();
        assert_eq!(store.entity("g1").await.unwrap().number("hp.value"), Some(5.0));

        let drink = Operation::new(
            "drink",
            OperationKind::Consumption(Consumption {
                restores: vec![
                    Restore {
                        resource: "hp".into(),
                        formula: "2".into(),
                    },
                    Restore {
                        resource: "stamina".into(),
                        formula: "4".into(),
                    },
                ],
                components: vec![],
                recipient: Recipient::Actor,
            }),
        );
        let outcome = execute(&drink, &mut activity, &ctx, None).await.unwrap();
        // hp 95 -> 97; stamina already full.
        assert_eq!(outcome.value, Some(json!(2)));
    }
}
