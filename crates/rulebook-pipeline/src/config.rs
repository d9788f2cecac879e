//! System-wide rules settings consulted by the runner and the operations.

use serde::{Deserialize, Serialize};

/// Role of the user driving the activity. Ordered from least to most trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    #[default]
    Player,
    Trusted,
    Assistant,
    GameMaster,
}

/// Who wins an opposed test when both sides roll the same total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TieBreak {
    Actor,
    #[default]
    Target,
}

/// Dotted paths into an entity's system data.
///
/// Pools (`turn_points`, `interrupt_points`, `stamina`, `hp`) are objects with
/// `value` and `max`; `armor` and `travel_speed` are plain numbers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AttributePaths {
    pub turn_points: String,
    pub interrupt_points: String,
    pub stamina: String,
    pub hp: String,
    pub armor: String,
    pub travel_speed: String,
}

impl Default for AttributePaths {
    fn default() -> Self {
        Self {
            turn_points: "actionPoints.turn".into(),
            interrupt_points: "actionPoints.interrupt".into(),
            stamina: "stamina".into(),
            hp: "hp".into(),
            armor: "armor".into(),
            travel_speed: "travel.speed".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RulesConfig {
    /// Attacks need at least one target unless the user is privileged.
    pub target_required: bool,
    /// Lowest role that may attack without a target.
    pub privileged_role: Role,
    /// Only charge action points and stamina while in combat.
    pub costs_in_combat_only: bool,
    /// Master switch for cost gating.
    pub enforce_costs: bool,
    pub paths: AttributePaths,
    /// Die rolled by `check` and `test`.
    pub check_die: String,
    /// Roll data path of a check modifier; `{check}` is replaced by the check key.
    pub check_modifier: String,
    pub test_ties_favor: TieBreak,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            target_required: true,
            privileged_role: Role::GameMaster,
            costs_in_combat_only: true,
            enforce_costs: true,
            paths: AttributePaths::default(),
            check_die: "1d20".into(),
            check_modifier: "checks.{check}".into(),
            test_ties_favor: TieBreak::Target,
        }
    }
}

impl RulesConfig {
    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> rulebook_types::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn modifier_path(&self, check: &str) -> String {
        self.check_modifier.replace("{check}", check)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let rules = RulesConfig::from_json(r#"{"targetRequired": false, "paths": {"hp": "health"}}"#)
            .unwrap();
        assert!(!rules.target_required);
        assert_eq!(rules.paths.hp, "health");
        assert_eq!(rules.paths.stamina, "stamina");
        assert_eq!(rules.check_die, "1d20");
        assert!(rules.enforce_costs);
    }

    #[test]
    fn roles_are_ordered() {
        assert!(Role::GameMaster > Role::Assistant);
        assert!(Role::Player < Role::Trusted);
    }

    #[test]
    fn modifier_path_substitutes_check_key() {
        let rules = RulesConfig::default();
        assert_eq!(rules.modifier_path("agi"), "checks.agi");
    }
}
