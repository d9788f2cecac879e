//! The activity document: operations plus everything persisted between runs.

use std::collections::BTreeSet;

use rulebook_types::{OperationData, PendingResume, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::ledger::{ResetTrigger, ResourceLedger};
use crate::operation::Operation;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Activity-level data readable by `condition` predicates and formulas
    /// (as `@activity.*`).
    #[serde(default)]
    pub system: Value,
    #[serde(default)]
    pub operations: Vec<Operation>,
    #[serde(default)]
    pub operation_data: OperationData,
    #[serde(default)]
    pub ledger: ResourceLedger,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingResume>,
    /// Operations whose costs were charged in the current invocation.
    #[serde(default)]
    pub charged: BTreeSet<String>,
}

impl Activity {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            system: Value::Object(Default::default()),
            operations: Vec::new(),
            operation_data: OperationData::new(),
            ledger: ResourceLedger::new(),
            pending: None,
            charged: BTreeSet::new(),
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn with_system(mut self, system: Value) -> Self {
        self.system = system;
        self
    }

    /// Indices into `operations`, sorted by priority. Ties keep declaration
    /// order.
    pub fn execution_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.operations.len()).collect();
        order.sort_by_key(|&i| self.operations[i].priority);
        order
    }

    pub fn operation(&self, id: &str) -> Option<&Operation> {
        self.operations.iter().find(|op| op.id == id)
    }

    /// Position of an operation within [`execution_order`](Self::execution_order).
    pub fn position_of(&self, id: &str) -> Option<usize> {
        self.execution_order()
            .iter()
            .position(|&i| self.operations[i].id == id)
    }

    /// Restore ledger entries for `trigger` and mirror their values into
    /// `operation_data`. Returns the ids reset.
    pub fn reset_resources(&mut self, trigger: ResetTrigger) -> Vec<String> {
        let reset = self.ledger.reset(trigger);
        for id in &reset {
            if let Some(record) = self.ledger.get(id) {
                self.operation_data.set_value(id, json!(record.value));
            }
        }
        reset
    }
}
