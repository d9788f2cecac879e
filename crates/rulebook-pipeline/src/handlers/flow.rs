//! Control-flow operations: branching, targeting, prompts, and messages.

use rulebook_formula::format_number;
use rulebook_types::{Choice, Outcome, Prompt, Result, RollData, RulebookError, UserInput};
use serde_json::{json, Value};

use super::{num, Step};
use crate::activity::Activity;
use crate::condition::{compare, parse_literal, Predicate, PredicateSource};
use crate::events::NotificationLevel;
use crate::operation::{
    AppliesTo, Condition, Message, SelectOperation, SelectOption, Target, Variable,
};
use crate::store::{get_path, Entity};

pub(super) async fn condition(
    step: &Step<'_>,
    condition: &Condition,
    activity: &mut Activity,
) -> Result<Outcome> {
    let actor = step.actor().await?;
    let roll = step.roll_data(&actor, activity);

    let mut predicates: Vec<&Predicate> = condition.conditions.iter().collect();
    predicates.sort_by_key(|p| p.priority);

    let mut results = Vec::with_capacity(predicates.len());
    let mut failed = None;
    for predicate in predicates {
        let actual = resolve(predicate, &actor, &roll, activity);
        let expected = parse_literal(&step.substitute(&activity.operation_data, &predicate.value)?);
        let passed = compare(&actual, predicate.comparison, &expected);
        tracing::debug!(
            operation = %step.op.id,
            predicate = %predicate.describe(),
            actual = %actual,
            passed,
            "Predicate evaluated"
        );
        results.push(json!({"predicate": predicate.describe(), "passed": passed}));
        if !passed && failed.is_none() {
            failed = Some(predicate.describe());
        }
    }

    let passed = failed.is_none();
    match failed {
        Some(predicate) if !condition.proceed_anyway => {
            Ok(Outcome::halted(format!("condition not met: {predicate}"))
                .with_value(json!(false))
                .with_field("results", json!(results)))
        }
        _ => Ok(Outcome::success(if passed {
            "all conditions met"
        } else {
            "conditions not met, proceeding anyway"
        })
        .with_value(json!(passed))
        .with_field("results", json!(results))),
    }
}

fn resolve(predicate: &Predicate, actor: &Entity, roll: &RollData, activity: &Activity) -> Value {
    let key = predicate.key.as_str();
    let found = match predicate.source {
        PredicateSource::RollData => roll.get(key).cloned(),
        PredicateSource::System => actor.get(key).cloned(),
        PredicateSource::Activity => get_path(&activity.system, key).cloned(),
        PredicateSource::Operation => {
            let (id, field) = key.split_once('.').unwrap_or((key, "value"));
            activity
                .operation_data
                .get(id)
                .and_then(|record| get_path(record, field))
                .cloned()
        }
        PredicateSource::Flag => actor.flags.get(key).cloned(),
    };
    found.unwrap_or(Value::Null)
}

pub(super) async fn target(step: &Step<'_>, target: &Target) -> Result<Outcome> {
    let mut selected = step.selected_targets().await?;
    if selected.is_empty() {
        return Err(step.precondition("no targets selected"));
    }

    let chosen = match target.applies_to {
        AppliesTo::Each => selected,
        AppliesTo::Random => {
            let population = selected.len();
            let roll = step
                .ctx
                .evaluator
                .evaluate(&format!("1d{population}"), &RollData::new())?;
            let index = (roll.total as usize).clamp(1, population) - 1;
            vec![selected.swap_remove(index)]
        }
    };

    let names: Vec<&str> = chosen.iter().map(|t| t.name.as_str()).collect();
    let notes = format!("targeting {}", names.join(", "));
    Ok(Outcome::forked(chosen.clone(), notes).with_value(json!(chosen.len())))
}

pub(super) fn variable(step: &Step<'_>, variable: &Variable, input: Option<UserInput>) -> Result<Outcome> {
    let title = if variable.label.is_empty() {
        step.op.label().to_string()
    } else {
        variable.label.clone()
    };
    let Some(input) = input else {
        return Ok(Outcome::suspended(Prompt::number(
            title,
            variable.default,
            variable.min,
            variable.max,
        )));
    };

    let n = match input {
        UserInput::Number(n) => n,
        UserInput::Choice(text) => text
            .trim()
            .parse::<f64>()
            .map_err(|_| step.invalid_input(format!("'{text}' is not a number")))?,
        UserInput::Acknowledge => variable
            .default
            .ok_or_else(|| step.invalid_input("a number is required"))?,
        UserInput::Dismiss => {
            return Err(RulebookError::Cancelled {
                operation: step.op.id.clone(),
            })
        }
    };
    if !n.is_finite() {
        return Err(step.invalid_input("a finite number is required"));
    }
    if let Some(min) = variable.min.filter(|min| n < *min) {
        return Err(step.invalid_input(format!("must be at least {}", format_number(min))));
    }
    if let Some(max) = variable.max.filter(|max| n > *max) {
        return Err(step.invalid_input(format!("must be at most {}", format_number(max))));
    }

    Ok(Outcome::success(format!("{title} = {}", format_number(n))).with_value(num(n)))
}

pub(super) fn select_operation(
    step: &Step<'_>,
    select: &SelectOperation,
    activity: &Activity,
    input: Option<UserInput>,
) -> Result<Outcome> {
    let candidates: Vec<Choice> = if select.operations.is_empty() {
        activity
            .operations
            .iter()
            .filter(|op| !op.execute_immediately && op.id != step.op.id)
            .map(|op| Choice::new(op.id.clone(), op.label()))
            .collect()
    } else {
        select
            .operations
            .iter()
            .filter_map(|id| activity.operation(id))
            .map(|op| Choice::new(op.id.clone(), op.label()))
            .collect()
    };
    if candidates.is_empty() {
        return Err(step.precondition("there is nothing to choose from"));
    }

    match input {
        None => {
            let title = select
                .title
                .clone()
                .unwrap_or_else(|| format!("{}: choose an operation", step.op.label()));
            Ok(Outcome::suspended(Prompt::select(title, candidates)))
        }
        Some(UserInput::Choice(id)) if candidates.iter().any(|c| c.value == id) => {
            Ok(Outcome::success(format!("chose {id}"))
                .with_value(json!(id))
                .jump(id))
        }
        Some(UserInput::Choice(id)) => {
            Err(step.invalid_input(format!("'{id}' is not one of the offered operations")))
        }
        Some(_) => Err(step.invalid_input("expected a choice")),
    }
}

pub(super) fn select_option(
    step: &Step<'_>,
    select: &SelectOption,
    input: Option<UserInput>,
) -> Result<Outcome> {
    if select.options.is_empty() {
        return Err(step.precondition("there is nothing to choose from"));
    }

    let choice = match input {
        None => {
            let choices = select
                .options
                .iter()
                .enumerate()
                .map(|(i, o)| Choice::new(i.to_string(), o.label.clone()))
                .collect();
            let title = select
                .title
                .clone()
                .unwrap_or_else(|| format!("{}: choose an option", step.op.label()));
            return Ok(Outcome::suspended(Prompt::select(title, choices)));
        }
        Some(UserInput::Choice(choice)) => choice,
        Some(_) => return Err(step.invalid_input("expected a choice")),
    };

    let entry = choice
        .parse::<usize>()
        .ok()
        .and_then(|i| select.options.get(i))
        .or_else(|| select.options.iter().find(|o| o.label == choice))
        .ok_or_else(|| step.invalid_input(format!("'{choice}' is not one of the options")))?;

    let value = if entry.value.is_null() {
        json!(entry.label)
    } else {
        entry.value.clone()
    };
    let outcome = Outcome::success(format!("chose {}", entry.label))
        .with_value(value)
        .with_field("label", json!(entry.label));
    Ok(match &entry.continue_from {
        Some(next) => outcome.jump(next.clone()),
        None => outcome,
    })
}

pub(super) fn message(step: &Step<'_>, message: &Message, activity: &Activity) -> Result<Outcome> {
    let text = step.substitute(&activity.operation_data, &message.text)?;
    step.notify(NotificationLevel::Info, text.clone());
    Ok(Outcome::success(text))
}

#[cfg(test)]
mod tests {
    use super::super::{execute, testkit};
    use crate::activity::Activity;
    use crate::condition::{Comparison, Predicate, PredicateSource};
    use crate::operation::*;
    use rulebook_types::{PromptKind, RulebookError, StepStatus, UserInput};
    use serde_json::json;

    fn predicate(source: PredicateSource, key: &str, comparison: Comparison, value: &str) -> Predicate {
        Predicate {
            source,
            key: key.into(),
            comparison,
            value: value.into(),
            priority: 0,
        }
    }

    fn condition_op(conditions: Vec<Predicate>, proceed_anyway: bool) -> Operation {
        Operation::new(
            "cond",
            OperationKind::Condition(Condition {
                conditions,
                proceed_anyway,
            }),
        )
    }

    #[tokio::test]
    async fn condition_passes_halts_or_proceeds() {
        let (ctx, _) = testkit::context(&[], vec![]);
        let mut activity = Activity::new("a", "A");
        activity.operation_data.set_value("c1", json!(12));

        let ok = condition_op(
            vec![
                predicate(PredicateSource::RollData, "hp.value", Comparison::Ge, "50"),
                predicate(PredicateSource::Operation, "c1", Comparison::Gt, "10"),
            ],
            false,
        );
        let outcome = execute(&ok, &mut activity, &ctx, None).await.unwrap();
        assert_eq!(outcome.status, StepStatus::Success);
        assert_eq!(outcome.value, Some(json!(true)));

        let failing = vec![predicate(PredicateSource::System, "hp.value", Comparison::Lt, "10")];
        let halted = execute(&condition_op(failing.clone(), false), &mut activity, &ctx, None)
            .await
            .unwrap();
        assert_eq!(halted.status, StepStatus::Halted);

        let anyway = execute(&condition_op(failing, true), &mut activity, &ctx, None)
            .await
            .unwrap();
        assert_eq!(anyway.status, StepStatus::Success);
        assert_eq!(anyway.value, Some(json!(false)));
    }

    #[tokio::test]
    async fn condition_reads_activity_and_flags() {
        let (ctx, store) = testkit::context(&[], vec![]);
        let mut hero = testkit::hero();
        hero.flags.insert("oaths".into(), json!(["sun", "moon"]));
        store.insert(hero).await;
        let mut activity = Activity::new("a", "A").with_system(json!({"school": "fire"}));

        let op = condition_op(
            vec![
                predicate(PredicateSource::Activity, "school", Comparison::Eq, "fire"),
                predicate(PredicateSource::Flag, "oaths", Comparison::Has, "moon"),
                predicate(PredicateSource::Flag, "oaths", Comparison::NotHas, "star"),
            ],
            false,
        );
        let outcome = execute(&op, &mut activity, &ctx, None).await.unwrap();
        assert_eq!(outcome.status, StepStatus::Success);
    }

    #[tokio::test]
    async fn target_each_and_random() {
        let (ctx, _) = testkit::context(&["g1", "g2", "g3"], vec![2]);
        let mut activity = Activity::new("a", "A");

        let each = Operation::new("t", OperationKind::Target(Target::default()));
        let outcome = execute(&each, &mut activity, &ctx, None).await.unwrap();
        assert_eq!(outcome.status, StepStatus::Forked);
        assert_eq!(outcome.targets.len(), 3);

        let random = Operation::new(
            "r",
            OperationKind::Target(Target {
                applies_to: AppliesTo::Random,
            }),
        );
        let outcome = execute(&random, &mut activity, &ctx, None).await.unwrap();
        assert_eq!(outcome.targets.len(), 1);
        assert_eq!(outcome.targets[0].id, "g2");
    }

    #[tokio::test]
    async fn target_without_selection_fails() {
        let (ctx, _) = testkit::context(&[], vec![]);
        let op = Operation::new("t", OperationKind::Target(Target::default()));
        let err = execute(&op, &mut Activity::new("a", "A"), &ctx, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RulebookError::Precondition { .. }));
    }

    #[tokio::test]
    async fn variable_prompts_then_validates() {
        let (ctx, _) = testkit::context(&[], vec![]);
        let op = Operation::new(
            "v",
            OperationKind::Variable(Variable {
                label: "Charges".into(),
                default: Some(1.0),
                min: Some(1.0),
                max: Some(3.0),
            }),
        );
        let mut activity = Activity::new("a", "A");

        let suspended = execute(&op, &mut activity, &ctx, None).await.unwrap();
        assert_eq!(suspended.status, StepStatus::Suspended);
        assert!(matches!(
            suspended.prompt.unwrap().kind,
            PromptKind::Number { max: Some(_), .. }
        ));

        let err = execute(&op, &mut activity, &ctx, Some(UserInput::Number(5.0)))
            .await
            .unwrap_err();
        assert!(matches!(err, RulebookError::InvalidInput { .. }));

        let done = execute(&op, &mut activity, &ctx, Some(UserInput::Choice("2".into())))
            .await
            .unwrap();
        assert_eq!(done.value, Some(json!(2)));
    }

    #[tokio::test]
    async fn select_operation_offers_deferred_and_jumps() {
        let (ctx, _) = testkit::context(&[], vec![]);
        let select = Operation::new("pick", OperationKind::SelectOperation(SelectOperation::default()));
        let mut activity = Activity::new("a", "A")
            .with_operation(select.clone())
            .with_operation(
                Operation::new("blast", OperationKind::Message(Message::default())).deferred(),
            );

        let outcome = execute(&select, &mut activity, &ctx, None).await.unwrap();
        match outcome.prompt.unwrap().kind {
            PromptKind::Select { choices } => {
                assert_eq!(choices.len(), 1);
                assert_eq!(choices[0].value, "blast");
            }
            other => panic!("expected select prompt, got {other:?}"),
        }

        let chosen = execute(&select, &mut activity, &ctx, Some(UserInput::Choice("blast".into())))
            .await
            .unwrap();
        assert_eq!(chosen.jump_to.as_deref(), Some("blast"));

        let err = execute(&select, &mut activity, &ctx, Some(UserInput::Choice("pick".into())))
            .await
            .unwrap_err();
        assert!(matches!(err, RulebookError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn select_option_stores_value_and_jumps() {
        let (ctx, _) = testkit::context(&[], vec![]);
        let op = Operation::new(
            "mode",
            OperationKind::SelectOption(SelectOption {
                options: vec![
                    OptionEntry {
                        label: "Fire".into(),
                        value: json!("fire"),
                        continue_from: None,
                    },
                    OptionEntry {
                        label: "Ice".into(),
                        value: json!("ice"),
                        continue_from: Some("freeze".into()),
                    },
                ],
                title: None,
            }),
        );
        let mut activity = Activity::new("a", "A");
        let outcome = execute(&op, &mut activity, &ctx, Some(UserInput::Choice("1".into())))
            .await
            .unwrap();
        assert_eq!(outcome.value, Some(json!("ice")));
        assert_eq!(outcome.jump_to.as_deref(), Some("freeze"));

        let by_label = execute(&op, &mut activity, &ctx, Some(UserInput::Choice("Fire".into())))
            .await
            .unwrap();
        assert_eq!(by_label.value, Some(json!("fire")));
        assert!(by_label.jump_to.is_none());
    }

    #[tokio::test]
    async fn message_substitutes_placeholders() {
        let (ctx, _) = testkit::context(&[], vec![]);
        let mut activity = Activity::new("a", "A");
        activity.operation_data.set_value("dmg", json!(7));
        let op = Operation::new(
            "m",
            OperationKind::Message(Message {
                text: "The blast deals #dmg damage".into(),
            }),
        );
        let outcome = execute(&op, &mut activity, &ctx, None).await.unwrap();
        assert_eq!(outcome.notes, "The blast deals 7 damage");
    }
}
