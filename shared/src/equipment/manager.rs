//! Equipment list of one pawn
//!
//! The authority creates, equips, unequips and destroys entries; every mutation is mirrored into
//! a `FastArray` of `ReplicatedEquipmentEntry` that travels as the `ReplicatedEquipment`
//! component. Receivers diff each snapshot against the last one and rebuild instances locally.

use bevy::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::actors::EquipmentActorHost;
use super::definition::EquipmentDefinition;
use super::instance::{EquipmentInstance, EquipmentState};
use super::EquipmentInstanceId;
use crate::ability::{AbilitySetGrantedHandles, AbilitySource, AbilitySystemComponent, ActivationEnv, ItemStackSource};
use crate::game_data::GameData;
use crate::inventory::ItemInstanceId;
use crate::message_bus::GameplayMessageBus;
use crate::replication::FastArray;
use crate::weapons::attachments::AttachmentInstance;
use crate::weapons::trace::ActorId;

/// Collaborators equipment operations reach into.
pub struct EquipmentContext<'a> {
    pub data: &'a GameData,
    pub asc: Option<&'a mut AbilitySystemComponent>,
    pub host: &'a mut dyn EquipmentActorHost,
    pub items: Option<&'a mut dyn ItemStackSource>,
}

impl<'a> EquipmentContext<'a> {
    pub fn new(data: &'a GameData, host: &'a mut dyn EquipmentActorHost) -> Self {
        Self {
            data,
            asc: None,
            host,
            items: None,
        }
    }

    pub fn with_asc(mut self, asc: &'a mut AbilitySystemComponent) -> Self {
        self.asc = Some(asc);
        self
    }

    pub fn with_items(mut self, items: &'a mut dyn ItemStackSource) -> Self {
        self.items = Some(items);
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplicatedEquipmentEntry {
    pub instance: EquipmentInstanceId,
    pub definition: String,
    pub owner_item: Option<ItemInstanceId>,
    pub state: EquipmentState,
    /// Actor id and the index of the descriptor that spawned it.
    pub spawned_actors: Vec<(ActorId, usize)>,
    pub attachments: FastArray<AttachmentInstance>,
}

impl ReplicatedEquipmentEntry {
    fn from_entry(entry: &EquipmentEntry) -> Self {
        Self {
            instance: entry.instance.id(),
            definition: entry.instance.definition().id.clone(),
            owner_item: entry.owner_item,
            state: entry.instance.state(),
            spawned_actors: entry.instance.spawned_actors().to_vec(),
            attachments: entry
                .instance
                .attachments()
                .map(|a| a.attachments().clone())
                .unwrap_or_default(),
        }
    }
}

/// What receivers see of a pawn's equipment.
#[derive(Component, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplicatedEquipment {
    pub entries: FastArray<ReplicatedEquipmentEntry>,
}

#[derive(Clone, Debug)]
struct EquipmentEntry {
    instance: EquipmentInstance,
    owner_item: Option<ItemInstanceId>,
    /// Authority only.
    granted: AbilitySetGrantedHandles,
}

#[derive(Component, Clone, Default)]
pub struct EquipmentManager {
    authority: bool,
    locally_controlled: bool,
    pawn: ActorId,
    bus: Option<GameplayMessageBus>,
    next_instance_id: u32,
    entries: Vec<EquipmentEntry>,
    /// Authority: the list receivers get. Receiver: the last snapshot applied.
    replicated: FastArray<ReplicatedEquipmentEntry>,
}

impl EquipmentManager {
    pub fn new(pawn: ActorId, authority: bool, locally_controlled: bool) -> Self {
        Self {
            authority,
            locally_controlled,
            pawn,
            ..Default::default()
        }
    }

    pub fn with_bus(mut self, bus: GameplayMessageBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn is_authority(&self) -> bool {
        self.authority
    }

    pub fn pawn(&self) -> ActorId {
        self.pawn
    }

    fn entry_index(&self, id: EquipmentInstanceId) -> Option<usize> {
        self.entries.iter().position(|e| e.instance.id() == id)
    }

    fn new_instance(&mut self, id: EquipmentInstanceId, definition: Arc<EquipmentDefinition>) -> EquipmentInstance {
        let instance = EquipmentInstance::new(id, definition, self.pawn, self.authority, self.locally_controlled);
        match &self.bus {
            Some(bus) => instance.with_bus(bus.clone()),
            None => instance,
        }
    }

    // ===== AUTHORITY =====

    /// Create the instance for `item`, or return the one it already has. Actors spawn hidden.
    pub fn create_equipment(
        &mut self,
        definition: Arc<EquipmentDefinition>,
        item: ItemInstanceId,
        ctx: &mut EquipmentContext<'_>,
    ) -> Option<EquipmentInstanceId> {
        if !self.authority {
            warn!("create_equipment({}) called without authority", definition.id);
            return None;
        }
        if !item.is_valid() {
            error!("create_equipment({}): item instance is not valid", definition.id);
            return None;
        }
        if let Some(existing) = self.find_equipment_by_item(item) {
            warn!("create_equipment: equipment already exists for item {:?}", item);
            return Some(existing);
        }

        self.next_instance_id += 1;
        let id = EquipmentInstanceId(self.next_instance_id);
        let mut instance = self.new_instance(id, definition);
        instance.set_instigator(Some(item));
        instance.initialize_attachments(&ctx.data.attachments);
        instance.spawn_equipment_actors(&mut *ctx.host);
        instance.set_actors_hidden(true, &mut *ctx.host);

        info!("Created equipment {} ({:?}) for item {:?}", instance.definition().id, id, item);
        let entry = EquipmentEntry {
            instance,
            owner_item: Some(item),
            granted: AbilitySetGrantedHandles::default(),
        };
        self.replicated.push(ReplicatedEquipmentEntry::from_entry(&entry));
        self.entries.push(entry);
        Some(id)
    }

    /// Grant the definition's ability sets and switch to `Equipped`.
    pub fn equip_item(&mut self, id: EquipmentInstanceId, ctx: &mut EquipmentContext<'_>) -> bool {
        if !self.authority {
            warn!("equip_item called without authority");
            return false;
        }
        let Some(index) = self.entry_index(id) else {
            error!("equip_item: equipment instance {:?} not found", id);
            return false;
        };
        let entry = &mut self.entries[index];
        if entry.instance.is_equipped() {
            warn!("equip_item: {:?} already equipped", id);
            return false;
        }

        if let Some(asc) = ctx.asc.as_deref_mut() {
            let source = AbilitySource {
                equipment: Some(id),
                item: entry.owner_item,
            };
            let sources = ctx.data.ability_set_sources();
            let mut env = match ctx.items.as_mut() {
                Some(items) => ActivationEnv::with_items(&mut **items),
                None => ActivationEnv::none(),
            };
            for set_id in &entry.instance.definition().ability_sets_to_grant {
                match ctx.data.ability_sets.get_cached_item(set_id) {
                    Some(set) => set.give_to_ability_system(asc, Some(&mut entry.granted), source, &sources, &mut env),
                    None => error!("Ability set {} on equipment {} is not valid", set_id, entry.instance.definition().id),
                }
            }
        }

        entry
            .instance
            .set_equipment_state(EquipmentState::Equipped, ctx.asc.as_deref_mut(), &mut *ctx.host);
        info!("Equipped {:?}", id);
        self.refresh_replicated();
        true
    }

    /// Revoke granted abilities and switch to `Unequipped`. The instance stays alive.
    pub fn unequip_item(&mut self, id: EquipmentInstanceId, ctx: &mut EquipmentContext<'_>) -> bool {
        if !self.authority {
            warn!("unequip_item called without authority");
            return false;
        }
        let Some(index) = self.entry_index(id) else {
            error!("unequip_item: equipment instance {:?} not found", id);
            return false;
        };
        let entry = &mut self.entries[index];
        if !entry.instance.is_equipped() {
            warn!("unequip_item: {:?} already unequipped", id);
            return false;
        }
        Self::revoke_and_unequip(entry, ctx);
        info!("Unequipped {:?}", id);
        self.refresh_replicated();
        true
    }

    fn revoke_and_unequip(entry: &mut EquipmentEntry, ctx: &mut EquipmentContext<'_>) {
        if let Some(asc) = ctx.asc.as_deref_mut() {
            entry.granted.take_from_ability_system(asc);
        }
        entry
            .instance
            .set_equipment_state(EquipmentState::Unequipped, ctx.asc.as_deref_mut(), &mut *ctx.host);
    }

    /// Unequip if needed, destroy every spawned actor and drop the entry.
    pub fn destroy_equipment(&mut self, id: EquipmentInstanceId, ctx: &mut EquipmentContext<'_>) -> bool {
        if !self.authority {
            warn!("destroy_equipment called without authority");
            return false;
        }
        let Some(index) = self.entry_index(id) else {
            return false;
        };
        let mut entry = self.entries.remove(index);
        if entry.instance.is_equipped() {
            Self::revoke_and_unequip(&mut entry, ctx);
        }
        entry.instance.destroy_equipment_actors(&mut *ctx.host);
        if let Some(rep_index) = self.replicated.position(|e| e.instance == id) {
            self.replicated.remove(rep_index);
        }
        info!("Destroyed equipment {} ({:?})", entry.instance.definition().id, id);
        true
    }

    /// Create (or reuse) the item's instance and equip it.
    pub fn equip_item_by_definition(
        &mut self,
        definition: Arc<EquipmentDefinition>,
        item: ItemInstanceId,
        ctx: &mut EquipmentContext<'_>,
    ) -> Option<EquipmentInstanceId> {
        let id = self.create_equipment(definition, item, ctx)?;
        self.equip_item(id, ctx);
        Some(id)
    }

    /// Copy live state into the replicated list, marking changed entries dirty. Returns true if
    /// anything changed.
    pub fn refresh_replicated(&mut self) -> bool {
        if !self.authority {
            return false;
        }
        let mut changed = false;
        for entry in &self.entries {
            let fresh = ReplicatedEquipmentEntry::from_entry(entry);
            let Some(index) = self.replicated.position(|e| e.instance == fresh.instance) else {
                continue;
            };
            if self.replicated.get(index) != Some(&fresh) {
                if let Some(slot) = self.replicated.get_mut(index) {
                    *slot = fresh;
                    changed = true;
                }
            }
        }
        changed
    }

    pub fn replicated(&self) -> ReplicatedEquipment {
        ReplicatedEquipment {
            entries: self.replicated.clone(),
        }
    }

    // ===== RECEIVER =====

    /// Run remove, add and change handling for a new authoritative snapshot.
    pub fn apply_replicated(&mut self, snapshot: &ReplicatedEquipment, ctx: &mut EquipmentContext<'_>) {
        if self.authority {
            warn!("apply_replicated ignored on the authority");
            return;
        }
        let delta = snapshot.entries.delta_from(&self.replicated);
        if delta.is_empty() {
            return;
        }

        for removed in &delta.removed {
            let Some(index) = self.entry_index(removed.instance) else {
                continue;
            };
            let mut entry = self.entries.remove(index);
            if entry.instance.is_equipped() {
                entry.instance.on_unequipped(ctx.asc.as_deref_mut(), &mut *ctx.host);
            }
            entry.instance.destroy_equipment_actors(&mut *ctx.host);
            debug!("Replicated remove of equipment {:?}", removed.instance);
        }

        for &index in &delta.added {
            let Some(rep) = snapshot.entries.get(index) else {
                continue;
            };
            let Some(definition) = ctx.data.equipment.get_cached_item(&rep.definition) else {
                warn!("Replicated equipment {} is not in the registry", rep.definition);
                continue;
            };
            let mut instance = self.new_instance(rep.instance, definition);
            instance.set_instigator(rep.owner_item);
            instance.initialize_attachments(&ctx.data.attachments);
            instance.with_attachments(&ctx.data.attachments, |attachments, attachment_ctx| {
                attachments.apply_replicated(rep.attachments.clone(), attachment_ctx)
            });
            instance.spawn_equipment_actors(&mut *ctx.host);
            instance.bind_replicated_actors(&rep.spawned_actors, &mut *ctx.host);
            if rep.state == EquipmentState::Equipped {
                instance.on_rep_equipment_state(EquipmentState::Equipped, ctx.asc.as_deref_mut(), &mut *ctx.host);
            } else {
                instance.set_actors_hidden(true, &mut *ctx.host);
            }
            debug!("Replicated add of equipment {} ({:?})", rep.definition, rep.instance);
            self.entries.push(EquipmentEntry {
                instance,
                owner_item: rep.owner_item,
                granted: AbilitySetGrantedHandles::default(),
            });
        }

        for &index in &delta.changed {
            let Some(rep) = snapshot.entries.get(index) else {
                continue;
            };
            let Some(entry_index) = self.entry_index(rep.instance) else {
                continue;
            };
            let entry = &mut self.entries[entry_index];
            entry.owner_item = rep.owner_item;
            entry.instance.bind_replicated_actors(&rep.spawned_actors, &mut *ctx.host);
            entry.instance.with_attachments(&ctx.data.attachments, |attachments, attachment_ctx| {
                attachments.apply_replicated(rep.attachments.clone(), attachment_ctx)
            });
            entry
                .instance
                .on_rep_equipment_state(rep.state, ctx.asc.as_deref_mut(), &mut *ctx.host);
            if let Some(asc) = ctx.asc.as_deref_mut() {
                entry.instance.refresh_attachment_tags(asc);
            }
        }

        self.replicated = snapshot.entries.clone();
    }

    // ===== QUERIES =====

    pub fn instance(&self, id: EquipmentInstanceId) -> Option<&EquipmentInstance> {
        self.entries.iter().find(|e| e.instance.id() == id).map(|e| &e.instance)
    }

    pub fn instance_mut(&mut self, id: EquipmentInstanceId) -> Option<&mut EquipmentInstance> {
        self.entries.iter_mut().find(|e| e.instance.id() == id).map(|e| &mut e.instance)
    }

    pub fn instances(&self) -> impl Iterator<Item = &EquipmentInstance> {
        self.entries.iter().map(|e| &e.instance)
    }

    pub fn find_equipment_by_item(&self, item: ItemInstanceId) -> Option<EquipmentInstanceId> {
        self.entries
            .iter()
            .find(|e| e.owner_item == Some(item))
            .map(|e| e.instance.id())
    }

    pub fn granted_handles(&self, id: EquipmentInstanceId) -> Option<&AbilitySetGrantedHandles> {
        self.entries.iter().find(|e| e.instance.id() == id).map(|e| &e.granted)
    }

    /// The equipped weapon, if any.
    pub fn equipped_weapon(&self) -> Option<&EquipmentInstance> {
        self.instances().find(|i| i.is_equipped() && i.weapon().is_some())
    }

    pub fn equipped_weapon_mut(&mut self) -> Option<&mut EquipmentInstance> {
        self.entries
            .iter_mut()
            .map(|e| &mut e.instance)
            .find(|i| i.is_equipped() && i.weapon().is_some())
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
    use crate::ability::AbilityDefinition;
    use crate::equipment::actors::EquipmentActorRegistry;
    use crate::equipment::definition::EquipmentActorToSpawn;
    use crate::tags::{names, tag};
    use crate::weapons::attachments::{AttachmentDefinition, AttachmentSlotDef, WeaponAttachmentsConfig};
    use crate::weapons::HitScanWeaponStats;

    fn data() -> GameData {
        let mut data = GameData::default();
        data.abilities.insert(AbilityDefinition::new("GA_Weapon_Fire"));
        data.ability_sets.insert(
            ron::from_str(r#"(id: "AbilitySet_Rifle", granted_abilities: [(ability: "GA_Weapon_Fire", input_tag: "InputTag.Weapon.Fire")])"#)
                .unwrap(),
        );
        data.attachments
            .insert(AttachmentDefinition::new("scope", tag(names::ATTACHMENT_SLOT_OPTIC)));
        data.equipment.insert(
            EquipmentDefinition::hit_scan_weapon("rifle", HitScanWeaponStats::default())
                .with_ability_set("AbilitySet_Rifle")
                .with_actor(EquipmentActorToSpawn {
                    actor_class: "RifleMesh".into(),
                    ..Default::default()
                })
                .with_actor(EquipmentActorToSpawn {
                    actor_class: "RifleFirstPerson".into(),
                    replicate: false,
                    ..Default::default()
                })
                .with_attachments(WeaponAttachmentsConfig {
                    slots: vec![AttachmentSlotDef::new(tag(names::ATTACHMENT_SLOT_OPTIC))],
                    max_attachments: 0,
                }),
        );
        data
    }

    #[test]
    fn test_equip_grants_and_unequip_revokes() {
        let data = data();
        let mut host = EquipmentActorRegistry::new();
        let mut asc = AbilitySystemComponent::default();
        let mut manager = EquipmentManager::new(1, true, false);
        let rifle = data.equipment.get_cached_item("rifle").unwrap();

        let mut ctx = EquipmentContext::new(&data, &mut host).with_asc(&mut asc);
        let id = manager.create_equipment(rifle.clone(), ItemInstanceId(5), &mut ctx).unwrap();
        assert_eq!(manager.create_equipment(rifle, ItemInstanceId(5), &mut ctx), Some(id));
        assert!(manager.equip_item(id, &mut ctx));
        assert!(!manager.equip_item(id, &mut ctx));
        assert_eq!(manager.granted_handles(id).unwrap().ability_spec_handles.len(), 1);
        assert!(manager.equipped_weapon().is_some());

        assert!(manager.unequip_item(id, &mut ctx));
        assert!(manager.granted_handles(id).unwrap().is_empty());
        assert!(manager.destroy_equipment(id, &mut ctx));
        drop(ctx);

        assert!(asc.specs().is_empty());
        assert!(host.is_empty());
        assert!(manager.is_empty());
        assert!(manager.replicated().entries.is_empty());
    }

    #[test]
    fn test_receiver_mirrors_authority() {
        let data = data();
        let rifle = data.equipment.get_cached_item("rifle").unwrap();
        let mut server_host = EquipmentActorRegistry::new();
        let mut server = EquipmentManager::new(1, true, false);
        let mut client_host = EquipmentActorRegistry::new();
        let mut client = EquipmentManager::new(1, false, true);

        let id = {
            let mut ctx = EquipmentContext::new(&data, &mut server_host);
            server.equip_item_by_definition(rifle, ItemInstanceId(5), &mut ctx).unwrap()
        };
        server
            .instance_mut(id)
            .unwrap()
            .with_attachments(&data.attachments, |a, c| a.install_attachment("scope", None, c))
            .unwrap()
            .unwrap();
        assert!(server.refresh_replicated());

        client.apply_replicated(&server.replicated(), &mut EquipmentContext::new(&data, &mut client_host));
        let mirrored = client.instance(id).unwrap();
        assert!(mirrored.is_equipped());
        assert_eq!(mirrored.owner_client_spawned_actors().len(), 1);
        assert_eq!(mirrored.spawned_actors().len(), 1);
        assert!(mirrored.attachments().unwrap().has_attachment_in_slot(&tag(names::ATTACHMENT_SLOT_OPTIC)));
        assert_eq!(client_host.len(), 2);

        {
            let mut ctx = EquipmentContext::new(&data, &mut server_host);
            server.unequip_item(id, &mut ctx);
        }
        client.apply_replicated(&server.replicated(), &mut EquipmentContext::new(&data, &mut client_host));
        assert!(!client.instance(id).unwrap().is_equipped());

        {
            let mut ctx = EquipmentContext::new(&data, &mut server_host);
            server.destroy_equipment(id, &mut ctx);
        }
        client.apply_replicated(&server.replicated(), &mut EquipmentContext::new(&data, &mut client_host));
        assert!(client.is_empty());
        // Local actors go with the instance; replicated ones are removed by their own replication.
        assert!(client_host.actors().all(|a| a.request.replicated));
    }
}
