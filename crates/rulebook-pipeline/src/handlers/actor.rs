//! Operations acting on the acting entity itself: `use`, `setFlag`, `travel`.

use rulebook_formula::format_number;
use rulebook_types::{Outcome, Prompt, Result, UserInput};
use serde_json::{json, Value};

use super::{num, Step};
use crate::activity::Activity;
use crate::condition::parse_literal;
use crate::context::ItemUse;
use crate::events::NotificationLevel;
use crate::operation::{SetFlag, SlotPolicy, Travel, Use, UseSource};
use crate::store::{Change, Entity};

pub(super) async fn use_item(
    step: &Step<'_>,
    use_op: &Use,
    activity: &mut Activity,
    input: Option<UserInput>,
) -> Result<Outcome> {
    let (mut used, queue) = match input {
        None => {
            let actor = step.actor().await?;
            (Vec::new(), resolve_items(step, &actor, &use_op.source)?)
        }
        // The item that suspended finished; pick up with the rest.
        Some(UserInput::Acknowledge) => {
            let record = activity.operation_data.get(&step.op.id);
            (ids(record, "used"), ids(record, "remaining"))
        }
        Some(_) => return Err(step.invalid_input("expected an acknowledgement")),
    };

    for (index, item_id) in queue.iter().enumerate() {
        let actor = step.actor().await?;
        let item = actor
            .item(item_id)
            .ok_or_else(|| step.precondition(format!("{} no longer owns '{item_id}'", actor.name)))?
            .clone();

        let result = step
            .ctx
            .item_user
            .use_item(&actor, &item, step.ctx.store.as_ref())
            .await?;
        used.push(item.id.clone());
        if result == ItemUse::Pending {
            tracing::debug!(operation = %step.op.id, item = %item.id, "Item use pending");
            return Ok(
                Outcome::suspended(Prompt::acknowledge(format!("Waiting for {} to finish", item.name)))
                    .with_field("used", json!(used))
                    .with_field("remaining", json!(&queue[index + 1..])),
            );
        }
    }

    Ok(Outcome::success(format!("used {}", used.join(", ")))
        .with_value(json!(used.len()))
        .with_field("used", json!(used))
        .with_field("remaining", json!([])))
}

fn ids(record: Option<&Value>, field: &str) -> Vec<String> {
    record
        .and_then(|r| r.get(field))
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

fn resolve_items(step: &Step<'_>, actor: &Entity, source: &UseSource) -> Result<Vec<String>> {
    match source {
        UseSource::Item(reference) => actor
            .item(reference)
            .map(|item| vec![item.id.clone()])
            .ok_or_else(|| step.precondition(format!("{} does not own '{reference}'", actor.name))),
        UseSource::Slot { slot, policy } => {
            let items = actor.items_in_slot(slot);
            let chosen: Vec<String> = match policy {
                SlotPolicy::Single if items.len() > 1 => {
                    return Err(step.precondition(format!(
                        "{} items in slot '{slot}', expected exactly one",
                        items.len()
                    )))
                }
                SlotPolicy::Single | SlotPolicy::All => items.iter().map(|i| i.id.clone()).collect(),
                SlotPolicy::UpTo(n) => items
                    .iter()
                    .take(*n as usize)
                    .map(|i| i.id.clone())
                    .collect(),
            };
            if chosen.is_empty() {
                return Err(step.precondition(format!("nothing to use in slot '{slot}'")));
            }
            Ok(chosen)
        }
    }
}

pub(super) async fn set_flag(step: &Step<'_>, flag: &SetFlag, activity: &mut Activity) -> Result<Outcome> {
    let actor = step.actor().await?;
    let raw = step.substitute(&activity.operation_data, &flag.value)?;
    let value = parse_literal(&raw);

    step.ctx
        .store
        .update(
            &actor.id,
            vec![Change::SetFlag {
                key: flag.key.clone(),
                value: value.clone(),
            }],
        )
        .await?;
    Ok(Outcome::success(format!("{} set on {}", flag.key, actor.name)).with_value(value))
}

pub(super) async fn travel(step: &Step<'_>, travel: &Travel, activity: &mut Activity) -> Result<Outcome> {
    let actor = step.actor().await?;
    let speed_path = &step.ctx.rules.paths.travel_speed;
    let speed = match actor.number(speed_path) {
        Some(speed) => speed,
        None => {
            step.notify(
                NotificationLevel::Warning,
                format!("{} has no travel speed at '{speed_path}'", actor.name),
            );
            0.0
        }
    };
    let roll = step.roll_data(&actor, activity);
    let modifier = step
        .evaluate(&activity.operation_data, &travel.modifier, &roll)?
        .total;
    let distance = (speed + modifier).max(0.0);

    let notes = format!("{} can travel {}", actor.name, format_number(distance));
    step.notify(NotificationLevel::Info, notes.clone());
    Ok(Outcome::success(notes)
        .with_value(num(distance))
        .with_field("speed", num(speed))
        .with_field("modifier", num(modifier)))
}
