//! Quick bar
//!
//! A fixed row of inventory items. Selecting a slot unequips whatever the previous slot equipped
//! and equips the new slot's item through the pawn's `EquipmentManager`. Removing an item from
//! the bar destroys its equipment instance.

use bevy::prelude::*;
use serde::{Deserialize, Serialize};

use super::manager::{EquipmentContext, EquipmentManager};
use super::EquipmentInstanceId;
use crate::inventory::{InventoryManager, ItemInstanceId};
use crate::message_bus::GameplayMessageBus;
use crate::tags::{names, tag};

pub const DEFAULT_NUM_SLOTS: usize = 3;

/// Broadcast on `Yc.QuickBar.Message.SlotsChanged`.
#[derive(Clone, Debug, PartialEq)]
pub struct QuickBarSlotsChangedMessage {
    pub owner: Option<u64>,
    pub slots: Vec<Option<ItemInstanceId>>,
}

/// Broadcast on `Yc.QuickBar.Message.ActiveIndexChanged`.
#[derive(Clone, Debug, PartialEq)]
pub struct QuickBarActiveIndexChangedMessage {
    pub owner: Option<u64>,
    pub active_index: Option<usize>,
}

/// What receivers see of a quick bar.
#[derive(Component, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicatedQuickBar {
    pub slots: Vec<Option<ItemInstanceId>>,
    pub active_slot_index: Option<usize>,
}

#[derive(Component, Clone)]
pub struct QuickBar {
    authority: bool,
    owner: Option<u64>,
    bus: Option<GameplayMessageBus>,
    slots: Vec<Option<ItemInstanceId>>,
    active_slot_index: Option<usize>,
    last_active_slot_index: Option<usize>,
    equipped: Option<EquipmentInstanceId>,
}

impl Default for QuickBar {
    fn default() -> Self {
        Self::new(true, None, DEFAULT_NUM_SLOTS)
    }
}

impl QuickBar {
    pub fn new(authority: bool, owner: Option<u64>, num_slots: usize) -> Self {
        Self {
            authority,
            owner,
            bus: None,
            slots: vec![None; num_slots],
            active_slot_index: None,
            last_active_slot_index: None,
            equipped: None,
        }
    }

    pub fn with_bus(mut self, bus: GameplayMessageBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn slots(&self) -> &[Option<ItemInstanceId>] {
        &self.slots
    }

    pub fn active_slot_index(&self) -> Option<usize> {
        self.active_slot_index
    }

    pub fn last_active_slot_index(&self) -> Option<usize> {
        self.last_active_slot_index
    }

    pub fn equipped(&self) -> Option<EquipmentInstanceId> {
        self.equipped
    }

    pub fn slot_item(&self, index: usize) -> Option<ItemInstanceId> {
        self.slots.get(index).copied().flatten()
    }

    pub fn active_slot_item(&self) -> Option<ItemInstanceId> {
        self.active_slot_index.and_then(|i| self.slot_item(i))
    }

    pub fn next_free_item_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_none())
    }

    // ===== SELECTION =====

    pub fn set_active_slot_index(
        &mut self,
        index: usize,
        inventory: &InventoryManager,
        equipment: &mut EquipmentManager,
        ctx: &mut EquipmentContext<'_>,
    ) {
        if index >= self.slots.len() || self.active_slot_index == Some(index) {
            return;
        }
        self.unequip_item_in_slot(equipment, ctx);
        self.set_active_slot_index_internal(Some(index));
        self.equip_item_in_slot(inventory, equipment, ctx);
    }

    pub fn deactivate_slot_index(&mut self, index: usize, equipment: &mut EquipmentManager, ctx: &mut EquipmentContext<'_>) {
        if index >= self.slots.len() || self.active_slot_index != Some(index) {
            return;
        }
        self.unequip_item_in_slot(equipment, ctx);
        self.set_active_slot_index_internal(None);
    }

    pub fn cycle_active_slot_forward(
        &mut self,
        inventory: &InventoryManager,
        equipment: &mut EquipmentManager,
        ctx: &mut EquipmentContext<'_>,
    ) {
        if let Some(index) = self.cycle_target(true) {
            self.set_active_slot_index(index, inventory, equipment, ctx);
        }
    }

    pub fn cycle_active_slot_backward(
        &mut self,
        inventory: &InventoryManager,
        equipment: &mut EquipmentManager,
        ctx: &mut EquipmentContext<'_>,
    ) {
        if let Some(index) = self.cycle_target(false) {
            self.set_active_slot_index(index, inventory, equipment, ctx);
        }
    }

    /// Next occupied slot in the given direction, wrapping once around the bar.
    fn cycle_target(&self, forward: bool) -> Option<usize> {
        let len = self.slots.len();
        if len < 2 {
            return None;
        }
        let start = self.active_slot_index.unwrap_or(if forward { len - 1 } else { 0 });
        let mut index = start;
        loop {
            index = if forward { (index + 1) % len } else { (index + len - 1) % len };
            if self.slots[index].is_some() {
                return Some(index);
            }
            if index == start {
                return None;
            }
        }
    }

    fn equip_item_in_slot(
        &mut self,
        inventory: &InventoryManager,
        equipment: &mut EquipmentManager,
        ctx: &mut EquipmentContext<'_>,
    ) {
        let Some(item_id) = self.active_slot_item() else {
            return;
        };
        let Some(item) = inventory.item(item_id) else {
            warn!("Quick bar item {:?} is not in the inventory", item_id);
            return;
        };
        let Some(definition) = ctx.data.equipment_for_item(&item.definition_id) else {
            debug!("Item {} has no equipment", item.definition_id);
            return;
        };
        self.equipped = equipment.equip_item_by_definition(definition, item_id, ctx);
    }

    fn unequip_item_in_slot(&mut self, equipment: &mut EquipmentManager, ctx: &mut EquipmentContext<'_>) {
        if let Some(id) = self.equipped.take() {
            equipment.unequip_item(id, ctx);
        }
    }

    // ===== SLOTS =====

    /// Put `item` into an empty slot.
    pub fn add_item_to_slot(&mut self, index: usize, item: ItemInstanceId) -> bool {
        if !self.authority {
            warn!("add_item_to_slot must be called on the authority");
            return false;
        }
        match self.slots.get(index) {
            Some(None) if item.is_valid() => {
                self.set_slot_internal(index, Some(item));
                true
            }
            _ => false,
        }
    }

    /// Take the item out of its slot, unequipping it first if it is active, and destroy its
    /// equipment instance.
    pub fn remove_item_from_slot(
        &mut self,
        index: usize,
        equipment: &mut EquipmentManager,
        ctx: &mut EquipmentContext<'_>,
    ) -> Option<ItemInstanceId> {
        if self.active_slot_index == Some(index) {
            self.unequip_item_in_slot(equipment, ctx);
            self.set_active_slot_index_internal(None);
        }
        let item = self.slot_item(index)?;
        self.set_slot_internal(index, None);
        if let Some(id) = equipment.find_equipment_by_item(item) {
            equipment.destroy_equipment(id, ctx);
        }
        Some(item)
    }

    fn set_slot_internal(&mut self, index: usize, item: Option<ItemInstanceId>) {
        if !self.authority {
            return;
        }
        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };
        if *slot == item {
            return;
        }
        *slot = item;
        self.on_rep_slots();
    }

    fn set_active_slot_index_internal(&mut self, index: Option<usize>) {
        let old = self.active_slot_index;
        self.active_slot_index = index;
        if old != index {
            self.on_rep_active_slot_index(old);
        }
    }

    // ===== REPLICATION =====

    fn on_rep_slots(&self) {
        if let Some(bus) = &self.bus {
            bus.broadcast_message(
                &tag(names::QUICKBAR_MESSAGE_SLOTS_CHANGED),
                &QuickBarSlotsChangedMessage {
                    owner: self.owner,
                    slots: self.slots.clone(),
                },
            );
        }
    }

    fn on_rep_active_slot_index(&mut self, old: Option<usize>) {
        self.last_active_slot_index = old;
        if let Some(bus) = &self.bus {
            bus.broadcast_message(
                &tag(names::QUICKBAR_MESSAGE_ACTIVE_INDEX_CHANGED),
                &QuickBarActiveIndexChangedMessage {
                    owner: self.owner,
                    active_index: self.active_slot_index,
                },
            );
        }
    }

    pub fn replicated(&self) -> ReplicatedQuickBar {
        ReplicatedQuickBar {
            slots: self.slots.clone(),
            active_slot_index: self.active_slot_index,
        }
    }

    /// Receiver side: adopt the authority's slots and index, broadcasting what changed.
    pub fn apply_replicated(&mut self, snapshot: &ReplicatedQuickBar) {
        if self.authority {
            return;
        }
        if self.slots != snapshot.slots {
            self.slots = snapshot.slots.clone();
            self.on_rep_slots();
        }
        if self.active_slot_index != snapshot.active_slot_index {
            let old = self.active_slot_index;
            self.active_slot_index = snapshot.active_slot_index;
            self.on_rep_active_slot_index(old);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equipment::actors::EquipmentActorRegistry;
    use crate::equipment::EquipmentDefinition;
    use crate::game_data::GameData;
    use crate::inventory::ItemDefinition;
    use crate::message_bus::MessageMatch;
    use std::sync::{Arc, Mutex};

    fn item(id: &str, equipment: Option<&str>) -> ItemDefinition {
        ItemDefinition {
            id: id.into(),
            equipment: equipment.map(str::to_string),
            ..Default::default()
        }
    }

    struct Fixture {
        data: GameData,
        inventory: InventoryManager,
        items: Vec<ItemInstanceId>,
    }

    fn fixture() -> Fixture {
        let mut data = GameData::default();
        data.equipment.insert(EquipmentDefinition::new("pistol"));
        data.equipment.insert(EquipmentDefinition::new("rifle"));
        let pistol = data.items.insert(item("item_pistol", Some("pistol")));
        let rifle = data.items.insert(item("item_rifle", Some("rifle")));
        let mut inventory = InventoryManager::new(Some(1));
        let items = vec![
            inventory.add_item_definition(&pistol, 1),
            inventory.add_item_definition(&rifle, 1),
        ];
        Fixture { data, inventory, items }
    }

    #[test]
    fn test_selecting_slots_swaps_equipment() {
        let f = fixture();
        let mut host = EquipmentActorRegistry::new();
        let mut equipment = EquipmentManager::new(1, true, false);
        let mut bar = QuickBar::default();
        assert!(bar.add_item_to_slot(0, f.items[0]));
        assert!(!bar.add_item_to_slot(0, f.items[1]));
        assert!(bar.add_item_to_slot(2, f.items[1]));
        assert_eq!(bar.next_free_item_slot(), Some(1));

        let mut ctx = EquipmentContext::new(&f.data, &mut host);
        bar.set_active_slot_index(0, &f.inventory, &mut equipment, &mut ctx);
        let pistol = bar.equipped().unwrap();
        assert!(equipment.instance(pistol).unwrap().is_equipped());

        bar.cycle_active_slot_forward(&f.inventory, &mut equipment, &mut ctx);
        assert_eq!(bar.active_slot_index(), Some(2));
        assert_eq!(bar.last_active_slot_index(), Some(0));
        assert!(!equipment.instance(pistol).unwrap().is_equipped());

        bar.cycle_active_slot_backward(&f.inventory, &mut equipment, &mut ctx);
        assert_eq!(bar.equipped(), Some(pistol));

        assert_eq!(bar.remove_item_from_slot(0, &mut equipment, &mut ctx), Some(f.items[0]));
        assert_eq!(bar.active_slot_index(), None);
        assert!(equipment.instance(pistol).is_none());
    }

    #[test]
    fn test_cycle_needs_two_slots_and_an_item() {
        let f = fixture();
        let mut host = EquipmentActorRegistry::new();
        let mut equipment = EquipmentManager::new(1, true, false);
        let mut ctx = EquipmentContext::new(&f.data, &mut host);

        let mut single = QuickBar::new(true, None, 1);
        single.add_item_to_slot(0, f.items[0]);
        single.cycle_active_slot_forward(&f.inventory, &mut equipment, &mut ctx);
        assert_eq!(single.active_slot_index(), None);

        let mut empty = QuickBar::default();
        empty.cycle_active_slot_backward(&f.inventory, &mut equipment, &mut ctx);
        assert_eq!(empty.active_slot_index(), None);
    }

    #[test]
    fn test_receiver_broadcasts_changes() {
        let bus = GameplayMessageBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.register_listener::<QuickBarActiveIndexChangedMessage, _>(
            tag("Yc.QuickBar.Message"),
            MessageMatch::PartialMatch,
            move |_, message| sink.lock().unwrap().push(message.active_index),
        );

        let mut client = QuickBar::new(false, Some(1), 3).with_bus(bus);
        assert!(!client.add_item_to_slot(0, ItemInstanceId(1)));
        client.apply_replicated(&ReplicatedQuickBar {
            slots: vec![Some(ItemInstanceId(1)), None, None],
            active_slot_index: Some(0),
        });
        assert_eq!(client.active_slot_item(), Some(ItemInstanceId(1)));
        assert_eq!(*seen.lock().unwrap(), vec![Some(0)]);
    }
}
