//! The operation model: common fields plus one payload per variant.
//!
//! Operations serialize as an internally tagged enum (`"type": "attack"`)
//! flattened into the common fields, with camelCase keys.

use std::collections::BTreeMap;

use rulebook_types::Choice;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::activity::Activity;
use crate::condition::{Comparison, Predicate, PredicateSource};
use crate::ledger::ResetTrigger;

fn default_true() -> bool {
    true
}

/// Which action-point pool a cost is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CostCategory {
    #[default]
    Turn,
    Interrupt,
    /// The turn pool on the actor's own turn, the interrupt pool otherwise.
    Current,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Costs {
    /// Action-point formula. Blank means free.
    pub actions: String,
    pub category: CostCategory,
    /// Stamina formula. Blank means free.
    pub stamina: String,
}

impl Costs {
    pub fn is_free(&self) -> bool {
        self.actions.trim().is_empty() && self.stamina.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Performance {
    pub combat_only: bool,
    pub own_turn: bool,
    pub others_turn: bool,
}

impl Default for Performance {
    fn default() -> Self {
        Self {
            combat_only: false,
            own_turn: true,
            others_turn: true,
        }
    }
}

/// Status effects flipped on the acting entity after the operation succeeds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ToggleEffects {
    pub statuses: Vec<String>,
    pub notify: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub costs: Costs,
    #[serde(default)]
    pub performance: Performance,
    /// When false the walk skips this operation unless it is selected.
    #[serde(default = "default_true")]
    pub execute_immediately: bool,
    #[serde(default)]
    pub toggle_active_effects: ToggleEffects,
    #[serde(flatten)]
    pub kind: OperationKind,
}

impl Operation {
    pub fn new(id: impl Into<String>, kind: OperationKind) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            priority: 0,
            costs: Costs::default(),
            performance: Performance::default(),
            execute_immediately: true,
            toggle_active_effects: ToggleEffects::default(),
            kind,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_costs(mut self, costs: Costs) -> Self {
        self.costs = costs;
        self
    }

    pub fn with_performance(mut self, performance: Performance) -> Self {
        self.performance = performance;
        self
    }

    pub fn deferred(mut self) -> Self {
        self.execute_immediately = false;
        self
    }

    pub fn toggling(mut self, statuses: &[&str], notify: bool) -> Self {
        self.toggle_active_effects = ToggleEffects {
            statuses: statuses.iter().map(|s| s.to_string()).collect(),
            notify,
        };
        self
    }

    /// Display name, falling back to the id.
    pub fn label(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }
}

/// One payload per operation kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OperationKind {
    Attack(Attack),
    Check(Check),
    Test(Test),
    Condition(Condition),
    Target(Target),
    Use(Use),
    CreateResource(CreateResource),
    ConsumeResource(ConsumeResource),
    Heal(Heal),
    Consumption(Consumption),
    SetFlag(SetFlag),
    Variable(Variable),
    Travel(Travel),
    SelectOperation(SelectOperation),
    SelectOption(SelectOption),
    Message(Message),
}

// --- payloads ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Damage {
    pub formula: String,
    #[serde(default = "default_damage_type", alias = "type")]
    pub damage_type: String,
    #[serde(default)]
    pub penetrate: bool,
    #[serde(default)]
    pub non_lethal: bool,
}

fn default_damage_type() -> String {
    "physical".into()
}

impl Damage {
    pub fn new(formula: impl Into<String>, damage_type: impl Into<String>) -> Self {
        Self {
            formula: formula.into(),
            damage_type: damage_type.into(),
            penetrate: false,
            non_lethal: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Attack {
    pub damages: Vec<Damage>,
    /// Reduce each target's hp by the damage dealt.
    pub apply_damage: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OverrideStage {
    #[default]
    BeforeModifiers,
    AfterModifiers,
}

/// If the roll is below `threshold`, force it to `value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RollOverride {
    pub threshold: f64,
    pub value: f64,
    #[serde(default)]
    pub stage: OverrideStage,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Check {
    pub check: String,
    #[serde(default)]
    pub roll_override: Option<RollOverride>,
    /// Formula the total must reach for `success`.
    #[serde(default)]
    pub difficulty: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TestAgainst {
    /// The actor rolls this check against the target's roll.
    ActorCheck(String),
    /// The target's roll must reach this formula to resist.
    Difficulty(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSpec {
    pub target_check: String,
    pub against: TestAgainst,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Test {
    pub friendly: Option<TestSpec>,
    pub neutral: Option<TestSpec>,
    pub hostile: Option<TestSpec>,
    pub secret: Option<TestSpec>,
    pub default: Option<TestSpec>,
}

impl Test {
    pub fn spec_for(&self, disposition: rulebook_types::Disposition) -> Option<&TestSpec> {
        use rulebook_types::Disposition::*;
        let specific = match disposition {
            Friendly => self.friendly.as_ref(),
            Neutral => self.neutral.as_ref(),
            Hostile => self.hostile.as_ref(),
            Secret => self.secret.as_ref(),
        };
        specific.or(self.default.as_ref())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Condition {
    pub conditions: Vec<Predicate>,
    pub proceed_anyway: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AppliesTo {
    #[default]
    Each,
    Random,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Target {
    pub applies_to: AppliesTo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SlotPolicy {
    /// Exactly one item must occupy the slot.
    #[default]
    Single,
    UpTo(u32),
    All,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UseSource {
    Item(String),
    Slot {
        slot: String,
        #[serde(default)]
        policy: SlotPolicy,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Use {
    pub source: UseSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateResource {
    pub resource_name: String,
    pub maximum: String,
    #[serde(default)]
    pub negative_allowed: bool,
    #[serde(default)]
    pub reset: ResetTrigger,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeResource {
    /// Id of the `createResource` operation owning the pool.
    pub resource: String,
    pub amount: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Recipient {
    #[default]
    #[serde(rename = "self")]
    Actor,
    Target,
}

/// Crafting material spent from the actor's inventory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Component {
    /// Item id or name.
    pub item: String,
    #[serde(default = "one")]
    pub quantity: u32,
}

fn one() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heal {
    pub formula: String,
    /// Pool path; defaults to the rules' hp path.
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub recipient: Recipient,
    #[serde(default)]
    pub components: Vec<Component>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Restore {
    pub resource: String,
    pub formula: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Consumption {
    pub restores: Vec<Restore>,
    pub components: Vec<Component>,
    pub recipient: Recipient,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetFlag {
    pub key: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Variable {
    pub label: String,
    pub default: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Travel {
    pub modifier: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SelectOperation {
    /// Candidate ids; empty means every deferred operation.
    pub operations: Vec<String>,
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionEntry {
    pub label: String,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub continue_from: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SelectOption {
    pub options: Vec<OptionEntry>,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Message {
    pub text: String,
}

impl OperationKind {
    /// Wire tag of the variant.
    pub fn name(&self) -> &'static str {
        match self {
            OperationKind::Attack(_) => "attack",
            OperationKind::Check(_) => "check",
            OperationKind::Test(_) => "test",
            OperationKind::Condition(_) => "condition",
            OperationKind::Target(_) => "target",
            OperationKind::Use(_) => "use",
            OperationKind::CreateResource(_) => "createResource",
            OperationKind::ConsumeResource(_) => "consumeResource",
            OperationKind::Heal(_) => "heal",
            OperationKind::Consumption(_) => "consumption",
            OperationKind::SetFlag(_) => "setFlag",
            OperationKind::Variable(_) => "variable",
            OperationKind::Travel(_) => "travel",
            OperationKind::SelectOperation(_) => "selectOperation",
            OperationKind::SelectOption(_) => "selectOption",
            OperationKind::Message(_) => "message",
        }
    }

    /// Every formula-bearing field, for placeholder validation.
    pub fn formulas(&self) -> Vec<&str> {
        match self {
            OperationKind::Attack(a) => a.damages.iter().map(|d| d.formula.as_str()).collect(),
            OperationKind::Check(c) => c.difficulty.iter().map(String::as_str).collect(),
            OperationKind::Test(t) => [&t.friendly, &t.neutral, &t.hostile, &t.secret, &t.default]
                .into_iter()
                .flatten()
                .filter_map(|spec| match &spec.against {
                    TestAgainst::Difficulty(f) => Some(f.as_str()),
                    TestAgainst::ActorCheck(_) => None,
                })
                .collect(),
            OperationKind::Condition(c) => c.conditions.iter().map(|p| p.value.as_str()).collect(),
            OperationKind::CreateResource(c) => vec![c.maximum.as_str()],
            OperationKind::ConsumeResource(c) => vec![c.amount.as_str()],
            OperationKind::Heal(h) => vec![h.formula.as_str()],
            OperationKind::Consumption(c) => c.restores.iter().map(|r| r.formula.as_str()).collect(),
            OperationKind::SetFlag(s) => vec![s.value.as_str()],
            OperationKind::Travel(t) => vec![t.modifier.as_str()],
            OperationKind::Message(m) => vec![m.text.as_str()],
            OperationKind::Target(_)
            | OperationKind::Use(_)
            | OperationKind::Variable(_)
            | OperationKind::SelectOperation(_)
            | OperationKind::SelectOption(_) => Vec::new(),
        }
    }

    /// Grouped choices for a configuration UI. The runner never calls this.
    pub fn choices(&self, activity: &Activity) -> BTreeMap<String, Vec<Choice>> {
        let mut groups = BTreeMap::new();
        match self {
            OperationKind::Attack(_) => {
                let mut types: Vec<String> = activity
                    .operations
                    .iter()
                    .filter_map(|op| match &op.kind {
                        OperationKind::Attack(a) => Some(a.damages.iter()),
                        _ => None,
                    })
                    .flatten()
                    .map(|d| d.damage_type.clone())
                    .collect();
                types.sort();
                types.dedup();
                groups.insert(
                    "damageTypes".into(),
                    types.into_iter().map(|t| Choice::new(t.clone(), t)).collect(),
                );
            }
            OperationKind::Condition(_) => {
                groups.insert(
                    "sources".into(),
                    PredicateSource::ALL
                        .iter()
                        .map(|s| Choice::new(wire_name(s), s.label()))
                        .collect(),
                );
                groups.insert(
                    "comparisons".into(),
                    Comparison::ALL
                        .iter()
                        .map(|c| Choice::new(c.symbol(), c.symbol()))
                        .collect(),
                );
                groups.insert("operations".into(), operation_choices(activity, |_| true));
            }
            OperationKind::Target(_) => {
                groups.insert(
                    "appliesTo".into(),
                    vec![
                        Choice::new("each", "Each target"),
                        Choice::new("random", "One random target"),
                    ],
                );
            }
            OperationKind::Use(_) => {
                groups.insert(
                    "policies".into(),
                    vec![
                        Choice::new("single", "The single item in the slot"),
                        Choice::new("upTo", "Up to N items"),
                        Choice::new("all", "Every item in the slot"),
                    ],
                );
            }
            OperationKind::CreateResource(_) => {
                groups.insert(
                    "resetTriggers".into(),
                    [
                        ResetTrigger::Never,
                        ResetTrigger::Turn,
                        ResetTrigger::ShortRest,
                        ResetTrigger::LongRest,
                        ResetTrigger::CombatEnd,
                    ]
                    .iter()
                    .map(|t| {
                        let name = wire_name(t);
                        Choice::new(name.clone(), name)
                    })
                    .collect(),
                );
            }
            OperationKind::ConsumeResource(_) => {
                groups.insert(
                    "resources".into(),
                    operation_choices(activity, |op| {
                        matches!(op.kind, OperationKind::CreateResource(_))
                    }),
                );
            }
            OperationKind::Heal(_) | OperationKind::Consumption(_) => {
                groups.insert(
                    "recipients".into(),
                    vec![
                        Choice::new("self", "Acting entity"),
                        Choice::new("target", "Current target"),
                    ],
                );
            }
            OperationKind::SelectOperation(_) => {
                groups.insert(
                    "operations".into(),
                    operation_choices(activity, |op| !op.execute_immediately),
                );
            }
            OperationKind::SelectOption(s) => {
                groups.insert(
                    "continueFrom".into(),
                    operation_choices(activity, |_| true),
                );
                groups.insert(
                    "options".into(),
                    s.options
                        .iter()
                        .enumerate()
                        .map(|(i, o)| Choice::new(i.to_string(), o.label.clone()))
                        .collect(),
                );
            }
            OperationKind::Check(_)
            | OperationKind::Test(_)
            | OperationKind::SetFlag(_)
            | OperationKind::Variable(_)
            | OperationKind::Travel(_)
            | OperationKind::Message(_) => {}
        }
        groups
    }
}

fn operation_choices(activity: &Activity, keep: impl Fn(&Operation) -> bool) -> Vec<Choice> {
    activity
        .operations
        .iter()
        .filter(|op| keep(op))
        .map(|op| Choice::new(op.id.clone(), op.label()))
        .collect()
}

fn wire_name<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(Value::String(s)) => s,
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_tagged_operation_with_defaults() {
        let op: Operation = serde_json::from_value(json!({
            "id": "strike",
            "type": "attack",
            "damages": [{"formula": "1d6+#c1", "type": "physical"}]
        }))
        .unwrap();

        assert_eq!(op.id, "strike");
        assert!(op.execute_immediately);
        assert!(op.performance.own_turn);
        assert!(op.costs.is_free());
        match &op.kind {
            OperationKind::Attack(a) => {
                assert_eq!(a.damages[0].damage_type, "physical");
                assert!(!a.apply_damage);
            }
            other => panic!("expected attack, got {other:?}"),
        }
        assert_eq!(op.kind.name(), "attack");
    }

    #[test]
    fn serializes_with_type_tag() {
        let op = Operation::new(
            "pool",
            OperationKind::CreateResource(CreateResource {
                resource_name: "Ki".into(),
                maximum: "3".into(),
                negative_allowed: false,
                reset: ResetTrigger::ShortRest,
            }),
        );
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["type"], "createResource");
        assert_eq!(json["resourceName"], "Ki");
        assert_eq!(json["reset"], "shortRest");
        assert_eq!(json["executeImmediately"], true);
    }

    #[test]
    fn use_and_test_payloads() {
        let op: Operation = serde_json::from_value(json!({
            "id": "quaff",
            "type": "use",
            "source": {"slot": {"slot": "belt", "policy": {"upTo": 2}}}
        }))
        .unwrap();
        assert_eq!(
            op.kind,
            OperationKind::Use(Use {
                source: UseSource::Slot {
                    slot: "belt".into(),
                    policy: SlotPolicy::UpTo(2)
                }
            })
        );

        let test: Operation = serde_json::from_value(json!({
            "id": "t",
            "type": "test",
            "hostile": {"targetCheck": "will", "against": {"actorCheck": "charm"}},
            "default": {"targetCheck": "agi", "against": {"difficulty": "12"}}
        }))
        .unwrap();
        let OperationKind::Test(spec) = &test.kind else {
            panic!("expected test");
        };
        assert_eq!(
            spec.spec_for(rulebook_types::Disposition::Hostile).unwrap().target_check,
            "will"
        );
        assert_eq!(
            spec.spec_for(rulebook_types::Disposition::Friendly).unwrap().target_check,
            "agi"
        );
    }

    #[test]
    fn recipient_self_wire_name() {
        let heal: Heal = serde_json::from_value(json!({"formula": "5", "recipient": "self"})).unwrap();
        assert_eq!(heal.recipient, Recipient::Actor);
    }

    #[test]
    fn formulas_lists_placeholder_fields() {
        let kind = OperationKind::Attack(Attack {
            damages: vec![Damage::new("#a + 1", "fire"), Damage::new("2", "cold")],
            apply_damage: false,
        });
        assert_eq!(kind.formulas(), vec!["#a + 1", "2"]);
    }

    #[test]
    fn choices_for_select_operation_lists_deferred() {
        let activity = Activity::new("a", "Ability")
            .with_operation(Operation::new("m", OperationKind::Message(Message::default())))
            .with_operation(
                Operation::new("later", OperationKind::Message(Message::default())).deferred(),
            );
        let kind = OperationKind::SelectOperation(SelectOperation::default());
        let groups = kind.choices(&activity);
        assert_eq!(groups["operations"], vec![Choice::new("later", "later")]);

        let cond = OperationKind::Condition(Condition::default()).choices(&activity);
        assert_eq!(cond["comparisons"].len(), 8);
        assert_eq!(cond["sources"][0].value, "rollData");
    }
}
