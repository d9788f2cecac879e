//! `attack`, `check`, and `test`.

use rulebook_formula::format_number;
use rulebook_types::{OperationData, Outcome, Result, RollData};
use serde_json::json;

use super::{num, Step};
use crate::activity::Activity;
use crate::config::TieBreak;
use crate::events::{ActivityEvent, DamageInstance, NotificationLevel};
use crate::operation::{Attack, Check, OverrideStage, RollOverride, Test, TestAgainst};
use crate::store::Change;

pub(super) async fn attack(step: &Step<'_>, attack: &Attack, activity: &mut Activity) -> Result<Outcome> {
    let targets = step.targets(activity).await?;
    if targets.is_empty() && step.ctx.rules.target_required && !step.ctx.is_privileged() {
        return Err(step.precondition("select at least one target"));
    }

    let actor = step.actor().await?;
    let roll = step.roll_data(&actor, activity);

    let mut total = 0.0;
    let mut rolls = Vec::with_capacity(attack.damages.len());
    let mut instances = Vec::new();
    for damage in &attack.damages {
        // One roll per damage entry, shared by every target.
        let evaluation = step.evaluate(&activity.operation_data, &damage.formula, &roll)?;
        let amount = evaluation.total.max(0.0);
        total += amount;
        rolls.push(json!({
            "type": damage.damage_type,
            "formula": evaluation.formula,
            "amount": num(amount),
        }));

        let recipients: Vec<Option<String>> = if targets.is_empty() {
            vec![None]
        } else {
            targets.iter().map(|t| Some(t.id.clone())).collect()
        };
        for target in recipients {
            instances.push(DamageInstance {
                target,
                damage_type: damage.damage_type.clone(),
                amount,
                penetrate: damage.penetrate,
                non_lethal: damage.non_lethal,
            });
        }
    }

    for instance in &instances {
        step.ctx.events.emit(ActivityEvent::DamageDealt {
            operation: step.op.id.clone(),
            damage: instance.clone(),
        });
        if let (true, Some(target)) = (attack.apply_damage, &instance.target) {
            apply_damage(step, instance, target).await?;
        }
    }

    let notes = format!(
        "{} deals {} damage to {} target(s)",
        actor.name,
        format_number(total),
        targets.len()
    );
    tracing::info!(operation = %step.op.id, total, targets = targets.len(), "Attack resolved");
    Ok(Outcome::success(notes)
        .with_value(num(total))
        .with_field("rolls", json!(rolls))
        .with_field("damages", serde_json::to_value(&instances)?))
}

/// Reduce the target's hp by the damage left after armor.
async fn apply_damage(step: &Step<'_>, damage: &DamageInstance, target: &str) -> Result<()> {
    let paths = &step.ctx.rules.paths;
    let entity = step.ctx.store.entity(target).await?;
    let hp_path = format!("{}.value", paths.hp);
    let Some(hp) = entity.number(&hp_path) else {
        step.notify(
            NotificationLevel::Warning,
            format!("{} has no hit points to damage", entity.name),
        );
        return Ok(());
    };

    let armor = if damage.penetrate {
        0.0
    } else {
        entity.number(&paths.armor).unwrap_or(0.0)
    };
    let dealt = (damage.amount - armor).max(0.0);
    let floor = if damage.non_lethal { hp.min(1.0) } else { 0.0 };
    let next = (hp - dealt).max(floor);

    step.ctx
        .store
        .update(target, vec![Change::set(hp_path, num(next))])
        .await?;
    tracing::debug!(entity = %target, before = hp, after = next, "Damage applied");
    Ok(())
}

/// One evaluated check roll.
struct CheckRoll {
    die: f64,
    modifier: f64,
    total: f64,
}

fn roll_check(
    step: &Step<'_>,
    data: &OperationData,
    check: &str,
    roll: &RollData,
    roll_override: Option<&RollOverride>,
) -> Result<CheckRoll> {
    let rules = &step.ctx.rules;
    let mut die = step.evaluate(data, &rules.check_die, roll)?.total;
    let modifier = roll.get_number(&rules.modifier_path(check)).unwrap_or(0.0);

    if let Some(o) = roll_override {
        if o.stage == OverrideStage::BeforeModifiers && die < o.threshold {
            die = o.value;
        }
    }
    let mut total = die + modifier;
    if let Some(o) = roll_override {
        if o.stage == OverrideStage::AfterModifiers && total < o.threshold {
            total = o.value;
        }
    }
    Ok(CheckRoll {
        die,
        modifier,
        total,
    })
}

pub(super) async fn check(step: &Step<'_>, check: &Check, activity: &mut Activity) -> Result<Outcome> {
    let actor = step.actor().await?;
    let roll = step.roll_data(&actor, activity);
    let result = roll_check(
        step,
        &activity.operation_data,
        &check.check,
        &roll,
        check.roll_override.as_ref(),
    )?;

    let success = match &check.difficulty {
        Some(difficulty) => {
            let target = step.evaluate(&activity.operation_data, difficulty, &roll)?.total;
            Some(result.total >= target)
        }
        None => None,
    };

    let notes = format!(
        "{} rolls {}: {}",
        actor.name,
        check.check,
        format_number(result.total)
    );
    step.notify(NotificationLevel::Info, notes.clone());
    Ok(Outcome::success(notes)
        .with_value(num(result.total))
        .with_field("die", num(result.die))
        .with_field("modifier", num(result.modifier))
        .with_field("success", json!(success)))
}

pub(super) async fn test(step: &Step<'_>, test: &Test, activity: &mut Activity) -> Result<Outcome> {
    let targets = step.targets(activity).await?;
    if targets.is_empty() {
        return Err(step.precondition("no targets to test against"));
    }
    let actor = step.actor().await?;
    let actor_roll = step.roll_data(&actor, activity);
    let data = &activity.operation_data;

    let mut results = Vec::with_capacity(targets.len());
    let mut successes = Vec::new();
    for target in &targets {
        let Some(spec) = test.spec_for(target.disposition) else {
            step.notify(
                NotificationLevel::Warning,
                format!("{}: no test configured against {}", step.op.label(), target.name),
            );
            continue;
        };

        let defence = roll_check(step, data, &spec.target_check, &target.roll_data, None)?;
        let attack = match &spec.against {
            TestAgainst::ActorCheck(check) => roll_check(step, data, check, &actor_roll, None)?.total,
            TestAgainst::Difficulty(formula) => step.evaluate(data, formula, &actor_roll)?.total,
        };
        let success = match attack.partial_cmp(&defence.total) {
            Some(std::cmp::Ordering::Greater) => true,
            Some(std::cmp::Ordering::Equal) => step.ctx.rules.test_ties_favor == TieBreak::Actor,
            _ => false,
        };

        step.ctx.events.emit(ActivityEvent::TestResolved {
            operation: step.op.id.clone(),
            target: target.id.clone(),
            success,
            actor_total: attack,
            target_total: defence.total,
        });
        results.push(json!({
            "target": target.id,
            "success": success,
            "actorTotal": num(attack),
            "targetTotal": num(defence.total),
        }));
        if success {
            successes.push(target.clone());
        }
    }

    let passed = successes.len();
    let aggregate = if passed == 0 {
        "none"
    } else if passed == targets.len() {
        "total"
    } else {
        "partial"
    };
    let notes = format!(
        "{}: {} success ({}/{})",
        step.op.label(),
        aggregate,
        passed,
        targets.len()
    );
    step.notify(NotificationLevel::Info, notes.clone());

    Ok(Outcome::forked(successes, notes)
        .with_value(json!(passed))
        .with_field("outcome", json!(aggregate))
        .with_field("results", json!(results)))
}

#[cfg(test)]
mod tests {
    use super::super::{execute, testkit};
    use crate::activity::Activity;
    use crate::config::Role;
    use crate::operation::{
        Attack, Check, Damage, Operation, OperationKind, OverrideStage, RollOverride, Test,
        TestAgainst, TestSpec,
    };
    use crate::store::StateStore;
    use rulebook_types::{RulebookError, StepStatus};
    use serde_json::json;

    fn strike(formula: &str, apply: bool) -> Operation {
        Operation::new(
            "strike",
            OperationKind::Attack(Attack {
                damages: vec![Damage::new(formula, "physical")],
                apply_damage: apply,
            }),
        )
    }

    #[tokio::test]
    async fn attack_rolls_once_per_entry_and_emits_per_target() {
        let (ctx, _) = testkit::context(&["g1", "g2"], vec![4]);
        let mut rx = ctx.events.subscribe();
        let op = strike("1d6 + 1", false);
        let mut activity = Activity::new("a", "A").with_operation(op.clone());

        let outcome = execute(&op, &mut activity, &ctx, None).await.unwrap();
        assert_eq!(outcome.status, StepStatus::Success);
        assert_eq!(outcome.value, Some(json!(5)));
        assert_eq!(outcome.record["damages"].as_array().unwrap().len(), 2);

        let mut dealt = 0;
        while let Ok(event) = rx.try_recv() {
            if let crate::events::ActivityEvent::DamageDealt { damage, .. } = event {
                assert_eq!(damage.amount, 5.0);
                dealt += 1;
            }
        }
        assert_eq!(dealt, 2);
    }

    #[tokio::test]
    async fn attack_without_target_needs_privilege() {
        let (ctx, _) = testkit::context(&[], vec![]);
        let op = strike("3", false);
        let mut activity = Activity::new("a", "A").with_operation(op.clone());

        let err = execute(&op, &mut activity, &ctx, None).await.unwrap_err();
        assert!(matches!(err, RulebookError::Precondition { .. }));

        let gm = ctx.with_role(Role::GameMaster);
        let outcome = execute(&op, &mut activity, &gm, None).await.unwrap();
        assert_eq!(outcome.value, Some(json!(3)));
    }

    #[tokio::test]
    async fn applied_damage_respects_armor_and_non_lethal() {
        let (ctx, store) = testkit::context(&["g1"], vec![]);
        let op = strike("4", true);
        let mut activity = Activity::new("a", "A").with_operation(op.clone());
        execute(&op, &mut activity, &ctx, None).await.unwrap();
        // 4 damage minus 1 armor.
        assert_eq!(store.entity("g1").await.unwrap().number("hp.value"), Some(4.0));

        let mut op = strike("100", true);
        if let OperationKind::Attack(a) = &mut op.kind {
            a.damages[0].non_lethal = true;
        }
        execute(&op, &mut activity, &ctx, None).await.unwrap();
        assert_eq!(store.entity("g1").await.unwrap().number("hp.value"), Some(1.0));
    }

    #[tokio::test]
    async fn check_adds_modifier_and_applies_override() {
        let (ctx, _) = testkit::context(&[], vec![3]);
        let op = Operation::new(
            "c1",
            OperationKind::Check(Check {
                check: "agi".into(),
                roll_override: Some(RollOverride {
                    threshold: 10.0,
                    value: 10.0,
                    stage: OverrideStage::BeforeModifiers,
                }),
                difficulty: Some("12".into()),
            }),
        );
        let mut activity = Activity::new("a", "A").with_operation(op.clone());
        let outcome = execute(&op, &mut activity, &ctx, None).await.unwrap();

        assert_eq!(outcome.record["die"], json!(10));
        assert_eq!(outcome.record["modifier"], json!(2));
        assert_eq!(outcome.value, Some(json!(12)));
        assert_eq!(outcome.record["success"], json!(true));
    }

    #[tokio::test]
    async fn test_forks_over_successful_targets_only() {
        // g1 rolls 15 and resists difficulty 10; g2 rolls 5 and does not.
        let (ctx, _) = testkit::context(&["g1", "g2"], vec![15, 5]);
        let op = Operation::new(
            "t",
            OperationKind::Test(Test {
                default: Some(TestSpec {
                    target_check: "agi".into(),
                    against: TestAgainst::Difficulty("10".into()),
                }),
                ..Default::default()
            }),
        );
        let mut activity = Activity::new("a", "A").with_operation(op.clone());
        let outcome = execute(&op, &mut activity, &ctx, None).await.unwrap();

        assert_eq!(outcome.status, StepStatus::Forked);
        assert_eq!(outcome.targets.len(), 1);
        assert_eq!(outcome.targets[0].id, "g2");
        assert_eq!(outcome.record["outcome"], "partial");
    }
}
