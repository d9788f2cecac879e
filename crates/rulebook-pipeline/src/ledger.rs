//! Resource ledger: named numeric pools owned by one activity.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Event that restores a resource to its maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResetTrigger {
    #[default]
    Never,
    Turn,
    ShortRest,
    LongRest,
    CombatEnd,
}

impl std::str::FromStr for ResetTrigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "never" => Ok(Self::Never),
            "turn" => Ok(Self::Turn),
            "shortRest" | "short-rest" => Ok(Self::ShortRest),
            "longRest" | "long-rest" => Ok(Self::LongRest),
            "combatEnd" | "combat-end" => Ok(Self::CombatEnd),
            other => Err(format!("unknown reset trigger '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRecord {
    /// Id of the `createResource` operation that owns this entry.
    pub id: String,
    pub resource_name: String,
    pub maximum_formula: String,
    pub maximum: f64,
    pub value: f64,
    pub negative_allowed: bool,
    pub reset: ResetTrigger,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LedgerError {
    #[error("resource '{0}' has not been created")]
    Missing(String),
    #[error("cannot consume a negative amount ({0})")]
    NegativeAmount(f64),
    #[error("needs {needed} {resource}, only {available} left")]
    Insufficient {
        resource: String,
        needed: f64,
        available: f64,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceLedger {
    entries: BTreeMap<String, ResourceRecord>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&ResourceRecord> {
        self.entries.get(id)
    }

    /// Insert a record unless one with the same id exists. Returns `false`
    /// (and leaves the ledger untouched) on the second call.
    pub fn create(&mut self, record: ResourceRecord) -> bool {
        if self.entries.contains_key(&record.id) {
            return false;
        }
        self.entries.insert(record.id.clone(), record);
        true
    }

    /// Drain `amount`; returns the new value. On error the entry is unchanged.
    pub fn consume(&mut self, id: &str, amount: f64) -> Result<f64, LedgerError> {
        let record = self
            .entries
            .get_mut(id)
            .ok_or_else(|| LedgerError::Missing(id.to_string()))?;
        if amount < 0.0 {
            return Err(LedgerError::NegativeAmount(amount));
        }
        if !record.negative_allowed && amount > record.value {
            return Err(LedgerError::Insufficient {
                resource: record.resource_name.clone(),
                needed: amount,
                available: record.value,
            });
        }
        record.value -= amount;
        Ok(record.value)
    }

    /// Restore every entry with a matching trigger. Returns the ids reset.
    pub fn reset(&mut self, trigger: ResetTrigger) -> Vec<String> {
        if trigger == ResetTrigger::Never {
            return Vec::new();
        }
        self.entries
            .values_mut()
            .filter(|r| r.reset == trigger)
            .map(|r| {
                r.value = r.maximum;
                r.id.clone()
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceRecord> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn charges(negative_allowed: bool) -> ResourceRecord {
        ResourceRecord {
            id: "charges".into(),
            resource_name: "Charges".into(),
            maximum_formula: "3".into(),
            maximum: 3.0,
            value: 3.0,
            negative_allowed,
            reset: ResetTrigger::LongRest,
        }
    }

    #[test]
    fn create_is_idempotent() {
        let mut ledger = ResourceLedger::new();
        assert!(ledger.create(charges(false)));
        ledger.consume("charges", 1.0).unwrap();

        let mut again = charges(false);
        again.value = 99.0;
        assert!(!ledger.create(again));
        assert_eq!(ledger.get("charges").unwrap().value, 2.0);
    }

    #[test]
    fn consume_rejects_overdraw_and_negative() {
        let mut ledger = ResourceLedger::new();
        ledger.create(charges(false));

        assert_eq!(
            ledger.consume("charges", 4.0),
            Err(LedgerError::Insufficient {
                resource: "Charges".into(),
                needed: 4.0,
                available: 3.0
            })
        );
        assert_eq!(ledger.consume("charges", -1.0), Err(LedgerError::NegativeAmount(-1.0)));
        assert_eq!(ledger.get("charges").unwrap().value, 3.0);
        assert_eq!(ledger.consume("charges", 3.0), Ok(0.0));
    }

    #[test]
    fn negative_allowed_may_go_below_zero() {
        let mut ledger = ResourceLedger::new();
        ledger.create(charges(true));
        assert_eq!(ledger.consume("charges", 5.0), Ok(-2.0));
    }

    #[test]
    fn consume_unknown_resource() {
        let mut ledger = ResourceLedger::new();
        assert!(matches!(ledger.consume("nope", 1.0), Err(LedgerError::Missing(_))));
    }

    #[test]
    fn reset_restores_matching_entries() {
        let mut ledger = ResourceLedger::new();
        ledger.create(charges(false));
        ledger.consume("charges", 2.0).unwrap();

        assert!(ledger.reset(ResetTrigger::ShortRest).is_empty());
        assert_eq!(ledger.reset(ResetTrigger::LongRest), vec!["charges".to_string()]);
        assert_eq!(ledger.get("charges").unwrap().value, 3.0);
    }

    #[test]
    fn trigger_from_str() {
        assert_eq!("longRest".parse::<ResetTrigger>(), Ok(ResetTrigger::LongRest));
        assert_eq!("short-rest".parse::<ResetTrigger>(), Ok(ResetTrigger::ShortRest));
        assert!("dawn".parse::<ResetTrigger>().is_err());
    }
}
