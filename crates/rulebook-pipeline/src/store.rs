//! Actor/target state store: the documents operations read and mutate.
//!
//! [`StateStore`] is the collaborator boundary. [`MemoryStore`] is the
//! in-process implementation used by the CLI and the tests.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use rulebook_types::{
    value_as_number, Disposition, EntityId, Result, RollData, RulebookError, TargetSnapshot,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub slot: Option<String>,
    #[serde(default = "one")]
    pub quantity: u32,
    #[serde(default)]
    pub consumable: bool,
}

fn one() -> u32 {
    1
}

/// An actor document: nested system data plus flags, statuses, and items.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entity {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub disposition: Disposition,
    #[serde(default)]
    pub system: Value,
    #[serde(default)]
    pub flags: Map<String, Value>,
    #[serde(default)]
    pub statuses: BTreeSet<String>,
    #[serde(default)]
    pub items: Vec<Item>,
}

impl Entity {
    pub fn new(id: impl Into<EntityId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            disposition: Disposition::default(),
            system: Value::Object(Map::new()),
            flags: Map::new(),
            statuses: BTreeSet::new(),
            items: Vec::new(),
        }
    }

    pub fn with_system(mut self, system: Value) -> Self {
        self.system = system;
        self
    }

    pub fn with_disposition(mut self, disposition: Disposition) -> Self {
        self.disposition = disposition;
        self
    }

    pub fn with_item(mut self, item: Item) -> Self {
        self.items.push(item);
        self
    }

    /// Raw system value at a dotted path.
    pub fn get(&self, path: &str) -> Option<&Value> {
        get_path(&self.system, path)
    }

    pub fn number(&self, path: &str) -> Option<f64> {
        self.get(path).and_then(value_as_number)
    }

    /// Flattened data handed to the evaluator. Flags appear under `flags.`.
    pub fn roll_data(&self) -> RollData {
        let mut data = RollData::from_json(&self.system);
        data.extend_from_json("flags", &Value::Object(self.flags.clone()));
        data
    }

    pub fn snapshot(&self) -> TargetSnapshot {
        TargetSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            disposition: self.disposition,
            roll_data: self.roll_data(),
        }
    }

    /// Look an item up by id, falling back to its name.
    pub fn item(&self, reference: &str) -> Option<&Item> {
        self.items
            .iter()
            .find(|i| i.id == reference)
            .or_else(|| self.items.iter().find(|i| i.name == reference))
    }

    pub fn items_in_slot(&self, slot: &str) -> Vec<&Item> {
        self.items
            .iter()
            .filter(|i| i.slot.as_deref() == Some(slot))
            .collect()
    }
}

/// One change within an atomic [`StateStore::update`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Change {
    /// Write a value at a dotted system path, creating intermediate objects.
    Set { path: String, value: Value },
    SetFlag { key: String, value: Value },
    /// Set an owned item's quantity.
    ItemQuantity { item: String, quantity: u32 },
    ToggleStatus { status: String },
}

impl Change {
    pub fn set(path: impl Into<String>, value: Value) -> Self {
        Change::Set {
            path: path.into(),
            value,
        }
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// A snapshot of the entity.
    async fn entity(&self, id: &str) -> Result<Entity>;

    /// Apply every change or none of them.
    async fn update(&self, id: &str, changes: Vec<Change>) -> Result<()>;

    async fn get(&self, id: &str, path: &str) -> Result<Option<Value>> {
        Ok(self.entity(id).await?.get(path).cloned())
    }

    async fn item(&self, id: &str, item: &str) -> Result<Option<Item>> {
        Ok(self.entity(id).await?.item(item).cloned())
    }
}

/// Hook run after every successful update to recompute derived fields.
pub type Deriver = Arc<dyn Fn(&mut Entity) + Send + Sync>;

/// In-memory [`StateStore`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    entities: Arc<RwLock<HashMap<EntityId, Entity>>>,
    deriver: Option<Deriver>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entities(entities: impl IntoIterator<Item = Entity>) -> Self {
        let map = entities.into_iter().map(|e| (e.id.clone(), e)).collect();
        Self {
            entities: Arc::new(RwLock::new(map)),
            deriver: None,
        }
    }

    pub fn with_deriver(mut self, deriver: Deriver) -> Self {
        self.deriver = Some(deriver);
        self
    }

    pub async fn insert(&self, entity: Entity) {
        self.entities.write().await.insert(entity.id.clone(), entity);
    }

    pub async fn all(&self) -> Vec<Entity> {
        let mut all: Vec<Entity> = self.entities.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn entity(&self, id: &str) -> Result<Entity> {
        self.entities
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RulebookError::EntityNotFound(id.to_string()))
    }

    async fn update(&self, id: &str, changes: Vec<Change>) -> Result<()> {
        let mut entities = self.entities.write().await;
        let current = entities
            .get(id)
            .ok_or_else(|| RulebookError::EntityNotFound(id.to_string()))?;

        // Work on a copy so a failing change leaves the document untouched.
        let mut next = current.clone();
        for change in changes {
            apply_change(&mut next, change)?;
        }
        if let Some(derive) = &self.deriver {
            derive(&mut next);
        }
        tracing::debug!(entity = %id, "Entity updated");
        entities.insert(id.to_string(), next);
        Ok(())
    }
}

fn apply_change(entity: &mut Entity, change: Change) -> Result<()> {
    match change {
        Change::Set { path, value } => set_path(&mut entity.system, &path, value),
        Change::SetFlag { key, value } => {
            entity.flags.insert(key, value);
        }
        Change::ItemQuantity { item, quantity } => {
            let owned = entity
                .items
                .iter_mut()
                .find(|i| i.id == item)
                .ok_or_else(|| {
                    RulebookError::Other(format!("'{}' does not own item '{}'", entity.id, item))
                })?;
            owned.quantity = quantity;
        }
        Change::ToggleStatus { status } => {
            if !entity.statuses.remove(&status) {
                entity.statuses.insert(status);
            }
        }
    }
    Ok(())
}

/// Walk a dotted path through nested objects.
pub fn get_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(root);
    }
    path.split('.').try_fold(root, |node, key| node.get(key))
}

/// Write at a dotted path, replacing non-object intermediates with objects.
pub fn set_path(root: &mut Value, path: &str, value: Value) {
    let mut node = root;
    let mut keys = path.split('.').peekable();
    while let Some(key) = keys.next() {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else {
            return;
        };
        if keys.peek().is_none() {
            map.insert(key.to_string(), value);
            return;
        }
        node = map
            .entry(key.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hero() -> Entity {
        Entity::new("hero", "Hero")
            .with_system(json!({"hp": {"value": 10, "max": 12}, "checks": {"agi": 3}}))
            .with_item(Item {
                id: "potion".into(),
                name: "Potion".into(),
                slot: Some("belt".into()),
                quantity: 2,
                consumable: true,
            })
    }

    #[test]
    fn path_helpers() {
        let mut root = json!({"a": {"b": 1}});
        assert_eq!(get_path(&root, "a.b"), Some(&json!(1)));
        assert!(get_path(&root, "a.c").is_none());

        set_path(&mut root, "a.c.d", json!(2));
        assert_eq!(root["a"]["c"]["d"], 2);
        set_path(&mut root, "a.b.x", json!(3));
        assert_eq!(root["a"]["b"]["x"], 3);
    }

    #[test]
    fn roll_data_includes_flags() {
        let mut entity = hero();
        entity.flags.insert("blessed".into(), json!(true));
        let data = entity.roll_data();
        assert_eq!(data.get_number("hp.value"), Some(10.0));
        assert_eq!(data.get_number("flags.blessed"), Some(1.0));
    }

    #[test]
    fn item_lookup_by_id_name_and_slot() {
        let entity = hero();
        assert!(entity.item("potion").is_some());
        assert!(entity.item("Potion").is_some());
        assert_eq!(entity.items_in_slot("belt").len(), 1);
        assert!(entity.items_in_slot("back").is_empty());
    }

    #[tokio::test]
    async fn update_applies_all_changes() {
        let store = MemoryStore::with_entities([hero()]);
        store
            .update(
                "hero",
                vec![
                    Change::set("hp.value", json!(4)),
                    Change::SetFlag {
                        key: "mood".into(),
                        value: json!("grim"),
                    },
                    Change::ItemQuantity {
                        item: "potion".into(),
                        quantity: 1,
                    },
                    Change::ToggleStatus {
                        status: "prone".into(),
                    },
                ],
            )
            .await
            .unwrap();

        let hero = store.entity("hero").await.unwrap();
        assert_eq!(hero.number("hp.value"), Some(4.0));
        assert_eq!(hero.flags["mood"], "grim");
        assert_eq!(hero.item("potion").unwrap().quantity, 1);
        assert!(hero.statuses.contains("prone"));
    }

    #[tokio::test]
    async fn failed_update_is_atomic() {
        let store = MemoryStore::with_entities([hero()]);
        let err = store
            .update(
                "hero",
                vec![
                    Change::set("hp.value", json!(0)),
                    Change::ItemQuantity {
                        item: "sword".into(),
                        quantity: 0,
                    },
                ],
            )
            .await;
        assert!(err.is_err());
        let hero = store.entity("hero").await.unwrap();
        assert_eq!(hero.number("hp.value"), Some(10.0));
    }

    #[tokio::test]
    async fn deriver_runs_after_update() {
        let store = MemoryStore::with_entities([hero()]).with_deriver(Arc::new(|e: &mut Entity| {
            let hp = e.number("hp.value").unwrap_or(0.0);
            set_path(&mut e.system, "bloodied", json!(hp <= 6.0));
        }));
        store
            .update("hero", vec![Change::set("hp.value", json!(5))])
            .await
            .unwrap();
        assert_eq!(store.get("hero", "bloodied").await.unwrap(), Some(json!(true)));
    }

    #[tokio::test]
    async fn missing_entity_is_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.entity("ghost").await,
            Err(RulebookError::EntityNotFound(_))
        ));
    }
}
