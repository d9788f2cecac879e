//! Everything an operation may consult besides the activity itself.

use std::sync::Arc;

use async_trait::async_trait;
use rulebook_formula::{DiceEvaluator, Evaluator};
use rulebook_types::{EntityId, Result, RulebookError};
use serde::{Deserialize, Serialize};

use crate::config::{Role, RulesConfig};
use crate::events::{EventEmitter, NotificationLevel};
use crate::store::{Change, Entity, Item, StateStore};

/// The encounter the actor is part of, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CombatState {
    pub active_combatant: EntityId,
    #[serde(default)]
    pub round: u32,
}

/// Result of an item's own use routine.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemUse {
    Used { value: Option<f64> },
    /// The routine needs the host to finish something first.
    Pending,
}

/// Runs an owned item's own use routine.
#[async_trait]
pub trait ItemUser: Send + Sync {
    async fn use_item(&self, actor: &Entity, item: &Item, store: &dyn StateStore) -> Result<ItemUse>;
}

/// Default item routine: consumables lose one unit; anything else is used
/// as-is.
pub struct ConsumeOnUse;

#[async_trait]
impl ItemUser for ConsumeOnUse {
    async fn use_item(&self, actor: &Entity, item: &Item, store: &dyn StateStore) -> Result<ItemUse> {
        if item.consumable {
            if item.quantity == 0 {
                return Err(RulebookError::precondition(
                    item.id.clone(),
                    format!("{} has no {} left", actor.name, item.name),
                ));
            }
            store
                .update(
                    &actor.id,
                    vec![Change::ItemQuantity {
                        item: item.id.clone(),
                        quantity: item.quantity - 1,
                    }],
                )
                .await?;
        }
        Ok(ItemUse::Used { value: None })
    }
}

/// Explicit execution context threaded through every operation.
#[derive(Clone)]
pub struct ExecutionContext {
    pub actor: EntityId,
    /// User-selected targets.
    pub targets: Vec<EntityId>,
    pub combat: Option<CombatState>,
    pub role: Role,
    pub rules: RulesConfig,
    pub store: Arc<dyn StateStore>,
    pub evaluator: Arc<dyn Evaluator>,
    pub item_user: Arc<dyn ItemUser>,
    pub events: EventEmitter,
}

impl ExecutionContext {
    pub fn new(actor: impl Into<EntityId>, store: Arc<dyn StateStore>) -> Self {
        Self {
            actor: actor.into(),
            targets: Vec::new(),
            combat: None,
            role: Role::default(),
            rules: RulesConfig::default(),
            store,
            evaluator: Arc::new(DiceEvaluator::default()),
            item_user: Arc::new(ConsumeOnUse),
            events: EventEmitter::default(),
        }
    }

    pub fn with_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<EntityId>,
    {
        self.targets = targets.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_combat(mut self, combat: CombatState) -> Self {
        self.combat = Some(combat);
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    pub fn with_rules(mut self, rules: RulesConfig) -> Self {
        self.rules = rules;
        self
    }

    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn with_item_user(mut self, item_user: Arc<dyn ItemUser>) -> Self {
        self.item_user = item_user;
        self
    }

    pub fn with_events(mut self, events: EventEmitter) -> Self {
        self.events = events;
        self
    }

    pub fn is_privileged(&self) -> bool {
        self.role >= self.rules.privileged_role
    }

    /// `Some(true)` on the actor's own turn, `Some(false)` on someone else's,
    /// `None` outside combat.
    pub fn actors_turn(&self) -> Option<bool> {
        self.combat
            .as_ref()
            .map(|c| c.active_combatant == self.actor)
    }

    /// The acting entity, or a precondition failure naming `operation`.
    pub async fn actor_entity(&self, operation: &str) -> Result<Entity> {
        match self.store.entity(&self.actor).await {
            Ok(entity) => Ok(entity),
            Err(RulebookError::EntityNotFound(_)) => Err(RulebookError::precondition(
                operation,
                format!("acting entity '{}' does not exist", self.actor),
            )),
            Err(e) => Err(e),
        }
    }

    /// Send a user-visible message, mirrored to the log.
    pub fn notify(&self, level: NotificationLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            NotificationLevel::Info => tracing::info!(actor = %self.actor, "{message}"),
            NotificationLevel::Warning => tracing::warn!(actor = %self.actor, "{message}"),
            NotificationLevel::Error => tracing::error!(actor = %self.actor, "{message}"),
        }
        self.events.notify(level, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn potion(quantity: u32) -> Item {
        Item {
            id: "potion".into(),
            name: "Potion".into(),
            slot: None,
            quantity,
            consumable: true,
        }
    }

    #[test]
    fn privilege_and_turn_detection() {
        let store = Arc::new(MemoryStore::new());
        let ctx = ExecutionContext::new("hero", store.clone());
        assert!(!ctx.is_privileged());
        assert_eq!(ctx.actors_turn(), None);

        let ctx = ctx.with_role(Role::GameMaster).with_combat(CombatState {
            active_combatant: "goblin".into(),
            round: 1,
        });
        assert!(ctx.is_privileged());
        assert_eq!(ctx.actors_turn(), Some(false));
    }

    #[tokio::test]
    async fn missing_actor_is_a_precondition_failure() {
        let ctx = ExecutionContext::new("nobody", Arc::new(MemoryStore::new()));
        let err = ctx.actor_entity("strike").await.unwrap_err();
        assert!(matches!(err, RulebookError::Precondition { .. }));
    }

    #[tokio::test]
    async fn consume_on_use_decrements_consumables() {
        let hero = Entity::new("hero", "Hero").with_item(potion(2));
        let store = MemoryStore::with_entities([hero.clone()]);

        let used = ConsumeOnUse
            .use_item(&hero, &potion(2), &store)
            .await
            .unwrap();
        assert_eq!(used, ItemUse::Used { value: None });
        assert_eq!(store.item("hero", "potion").await.unwrap().unwrap().quantity, 1);

        let err = ConsumeOnUse.use_item(&hero, &potion(0), &store).await;
        assert!(err.is_err());
    }
}
