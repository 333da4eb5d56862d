//! Inventory
//!
//! Item definitions are static data; item instances carry per-item stat tag stacks (ammo in
//! the magazine, spare ammo, charges). Equipment and costs refer to instances by id.

use bevy::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::ability::asc::ItemStackSource;
use crate::data_registry::RegistryItem;
use crate::message_bus::GameplayMessageBus;
use crate::replication::FastArray;
use crate::tag_stack::TagStackContainer;
use crate::tags::{names, tag, GameplayTag};

// =============================================================================
// ITEM DEFINITIONS
// =============================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemInstanceId(pub u32);

impl ItemInstanceId {
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemDefinition {
    pub id: String,
    pub display_name: String,
    pub max_stack: i32,
    /// Stat tag stacks every new instance starts with.
    pub initial_stats: BTreeMap<GameplayTag, i32>,
    /// Equipment definition id, if this item can go on the quick bar.
    pub equipment: Option<String>,
}

impl Default for ItemDefinition {
    fn default() -> Self {
        Self {
            id: String::new(),
            display_name: String::new(),
            max_stack: 1,
            initial_stats: BTreeMap::new(),
            equipment: None,
        }
    }
}

impl RegistryItem for ItemDefinition {
    fn registry_id(&self) -> &str {
        &self.id
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemInstance {
    pub id: ItemInstanceId,
    pub definition_id: String,
    pub stat_tags: TagStackContainer,
}

impl ItemInstance {
    pub fn stat_tag_stack_count(&self, stat: &GameplayTag) -> i32 {
        self.stat_tags.stack_count(stat)
    }

    pub fn has_stat_tag(&self, stat: &GameplayTag) -> bool {
        self.stat_tags.contains(stat)
    }
}

// =============================================================================
// MESSAGES
// =============================================================================

/// Broadcast on `Yc.Inventory.Message.StackChanged`.
#[derive(Clone, Debug, PartialEq)]
pub struct InventoryChangeMessage {
    pub owner: Option<u64>,
    pub item_instance: ItemInstanceId,
    pub new_count: i32,
    pub delta: i32,
}

// =============================================================================
// INVENTORY MANAGER
// =============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub instance: ItemInstance,
    pub stack_count: i32,
    /// Last count the receiving side saw; used to compute broadcast deltas.
    #[serde(skip)]
    last_observed_count: i32,
}

/// The owning client's copy of its inventory.
#[derive(Component, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicatedInventory(pub FastArray<InventoryEntry>);

#[derive(Component, Clone, Default)]
pub struct InventoryManager {
    owner: Option<u64>,
    entries: FastArray<InventoryEntry>,
    next_instance_id: u32,
    bus: Option<GameplayMessageBus>,
}

impl std::fmt::Debug for InventoryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InventoryManager")
            .field("owner", &self.owner)
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl InventoryManager {
    pub fn new(owner: Option<u64>) -> Self {
        Self {
            owner,
            ..Default::default()
        }
    }

    pub fn with_bus(mut self, bus: GameplayMessageBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn entries(&self) -> &FastArray<InventoryEntry> {
        &self.entries
    }

    pub fn replicated(&self) -> ReplicatedInventory {
        ReplicatedInventory(self.entries.clone())
    }

    pub fn item(&self, id: ItemInstanceId) -> Option<&ItemInstance> {
        self.entries.iter().find(|e| e.instance.id == id).map(|e| &e.instance)
    }

    pub fn item_mut(&mut self, id: ItemInstanceId) -> Option<&mut ItemInstance> {
        let index = self.entries.position(|e| e.instance.id == id)?;
        self.entries.get_mut(index).map(|e| &mut e.instance)
    }

    pub fn all_items(&self) -> Vec<ItemInstanceId> {
        self.entries.iter().map(|e| e.instance.id).collect()
    }

    /// Create an instance of `definition` holding `stack_count` and return its id.
    pub fn add_item_definition(&mut self, definition: &Arc<ItemDefinition>, stack_count: i32) -> ItemInstanceId {
        self.next_instance_id += 1;
        let id = ItemInstanceId(self.next_instance_id);
        let mut stat_tags = TagStackContainer::default();
        for (stat, count) in &definition.initial_stats {
            stat_tags.add_stack(stat, *count);
        }
        self.entries.push(InventoryEntry {
            instance: ItemInstance {
                id,
                definition_id: definition.id.clone(),
                stat_tags,
            },
            stack_count,
            last_observed_count: stack_count,
        });
        self.broadcast_change(id, stack_count, stack_count);
        debug!("Added {} x{} as item {}", definition.id, stack_count, id.0);
        id
    }

    pub fn remove_item(&mut self, id: ItemInstanceId) -> bool {
        let Some(index) = self.entries.position(|e| e.instance.id == id) else {
            return false;
        };
        let Some(entry) = self.entries.remove(index) else {
            return false;
        };
        self.broadcast_change(id, 0, -entry.stack_count);
        true
    }

    pub fn find_first_item_by_definition(&self, definition_id: &str) -> Option<ItemInstanceId> {
        self.entries
            .iter()
            .find(|e| e.instance.definition_id == definition_id)
            .map(|e| e.instance.id)
    }

    /// Number of instances of `definition_id`.
    pub fn total_item_count_by_definition(&self, definition_id: &str) -> usize {
        self.entries.iter().filter(|e| e.instance.definition_id == definition_id).count()
    }

    /// Remove `count` whole instances of `definition_id`. Returns false (and removes nothing
    /// beyond what was found) when fewer than `count` exist.
    pub fn consume_items_by_definition(&mut self, definition_id: &str, count: usize) -> bool {
        let mut consumed = 0;
        while consumed < count {
            let Some(id) = self.find_first_item_by_definition(definition_id) else {
                break;
            };
            self.remove_item(id);
            consumed += 1;
        }
        consumed == count
    }

    pub fn add_stat_tag_stack(&mut self, id: ItemInstanceId, stat: &GameplayTag, count: i32) {
        let Some(index) = self.entries.position(|e| e.instance.id == id) else {
            warn!("add_stat_tag_stack on unknown item {}", id.0);
            return;
        };
        if let Some(entry) = self.entries.get_mut(index) {
            entry.instance.stat_tags.add_stack(stat, count);
        }
    }

    /// Run the receiving-side change callbacks for an updated snapshot.
    pub fn apply_replicated(&mut self, snapshot: FastArray<InventoryEntry>) {
        let delta = snapshot.delta_from(&self.entries);
        for removed in &delta.removed {
            self.broadcast_change(removed.instance.id, 0, -removed.last_observed_count);
        }
        let previous: Vec<(ItemInstanceId, i32)> = self
            .entries
            .iter()
            .map(|e| (e.instance.id, e.last_observed_count))
            .collect();
        self.entries = snapshot;
        let mut changes = Vec::new();
        for (index, entry) in self.entries.iter_mut_untracked().enumerate() {
            entry.instance.stat_tags.rebuild_lookup();
            let id = entry.instance.id;
            let count = entry.stack_count;
            let before = previous.iter().find(|(p, _)| *p == id).map(|(_, c)| *c).unwrap_or(0);
            entry.last_observed_count = count;
            if delta.added.contains(&index) || delta.changed.contains(&index) {
                changes.push((id, count, count - before));
            }
        }
        for (id, count, change) in changes {
            self.broadcast_change(id, count, change);
        }
    }

    fn broadcast_change(&self, item: ItemInstanceId, new_count: i32, delta: i32) {
        let Some(bus) = &self.bus else {
            return;
        };
        bus.broadcast_message(
            &tag(names::INVENTORY_MESSAGE_STACK_CHANGED),
            &InventoryChangeMessage {
                owner: self.owner,
                item_instance: item,
                new_count,
                delta,
            },
        );
    }
}

impl ItemStackSource for InventoryManager {
    fn stat_tag_stack_count(&self, item: ItemInstanceId, stat: &GameplayTag) -> i32 {
        self.item(item).map(|i| i.stat_tag_stack_count(stat)).unwrap_or(0)
    }

    fn remove_stat_tag_stack(&mut self, item: ItemInstanceId, stat: &GameplayTag, count: i32) {
        let Some(index) = self.entries.position(|e| e.instance.id == item) else {
            warn!("remove_stat_tag_stack on unknown item {}", item.0);
            return;
        };
        if let Some(entry) = self.entries.get_mut(index) {
            entry.instance.stat_tags.remove_stack(stat, count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_bus::MessageMatch;

    fn rifle() -> Arc<ItemDefinition> {
        let mut initial_stats = BTreeMap::new();
        initial_stats.insert(tag("Weapon.MagazineAmmo"), 30);
        Arc::new(ItemDefinition {
            id: "ID_Rifle".into(),
            display_name: "Rifle".into(),
            initial_stats,
            equipment: Some("WID_Rifle".into()),
            ..Default::default()
        })
    }

    #[test]
    fn test_add_find_and_stat_tags() {
        let mut inventory = InventoryManager::new(Some(7));
        let id = inventory.add_item_definition(&rifle(), 1);
        assert!(id.is_valid());
        assert_eq!(inventory.find_first_item_by_definition("ID_Rifle"), Some(id));
        assert_eq!(inventory.stat_tag_stack_count(id, &tag("Weapon.MagazineAmmo")), 30);

        inventory.remove_stat_tag_stack(id, &tag("Weapon.MagazineAmmo"), 5);
        assert_eq!(inventory.stat_tag_stack_count(id, &tag("Weapon.MagazineAmmo")), 25);
    }

    #[test]
    fn test_consume_removes_whole_instances() {
        let mut inventory = InventoryManager::new(None);
        let def = rifle();
        inventory.add_item_definition(&def, 5);
        inventory.add_item_definition(&def, 5);
        assert_eq!(inventory.total_item_count_by_definition("ID_Rifle"), 2);

        assert!(inventory.consume_items_by_definition("ID_Rifle", 1));
        assert_eq!(inventory.total_item_count_by_definition("ID_Rifle"), 1);
        assert!(!inventory.consume_items_by_definition("ID_Rifle", 2));
        assert_eq!(inventory.total_item_count_by_definition("ID_Rifle"), 0);
    }

    #[test]
    fn test_stack_changed_broadcasts() {
        let bus = GameplayMessageBus::new();
        let (_handle, inbox) = bus.register_inbox::<InventoryChangeMessage>(
            tag(names::INVENTORY_MESSAGE_STACK_CHANGED),
            MessageMatch::ExactMatch,
        );
        let mut inventory = InventoryManager::new(Some(3)).with_bus(bus);
        let id = inventory.add_item_definition(&rifle(), 2);
        inventory.remove_item(id);

        let messages: Vec<_> = inbox.drain().into_iter().map(|(_, m)| m).collect();
        assert_eq!(messages.len(), 2);
        assert_eq!((messages[0].new_count, messages[0].delta), (2, 2));
        assert_eq!((messages[1].new_count, messages[1].delta), (0, -2));
        assert_eq!(messages[1].owner, Some(3));
    }

    #[test]
    fn test_client_mirror_broadcasts_deltas() {
        let mut server = InventoryManager::new(Some(1));
        let id = server.add_item_definition(&rifle(), 4);

        let bus = GameplayMessageBus::new();
        let (_handle, inbox) = bus.register_inbox::<InventoryChangeMessage>(
            tag(names::INVENTORY_MESSAGE_STACK_CHANGED),
            MessageMatch::ExactMatch,
        );
        let mut client = InventoryManager::new(Some(1)).with_bus(bus);
        client.apply_replicated(server.entries().clone());
        assert_eq!(client.stat_tag_stack_count(id, &tag("Weapon.MagazineAmmo")), 30);

        server.remove_item(id);
        client.apply_replicated(server.entries().clone());
        let deltas: Vec<i32> = inbox.drain().into_iter().map(|(_, m)| m.delta).collect();
        assert_eq!(deltas, vec![4, -4]);
    }
}
