//! Live equipment instances
//!
//! An instance exists from the moment its item enters the active quick bar slot until it leaves.
//! Only the authority changes `state`; receivers run the same show/hide path from
//! `on_rep_equipment_state`.

use bevy::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::actors::{ActorSpawnRequest, EquipmentActorHost};
use super::definition::{EquipmentActorToSpawn, EquipmentDefinition};
use super::EquipmentInstanceId;
use crate::ability::AbilitySystemComponent;
use crate::data_registry::DataRegistry;
use crate::inventory::ItemInstanceId;
use crate::message_bus::GameplayMessageBus;
use crate::weapons::attachments::{AttachmentContext, AttachmentDefinition, WeaponAttachmentComponent};
use crate::weapons::trace::ActorId;
use crate::weapons::HitScanWeaponInstance;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EquipmentState {
    #[default]
    Unequipped,
    Equipped,
}

#[derive(Clone, Debug)]
pub struct EquipmentInstance {
    id: EquipmentInstanceId,
    definition: Arc<EquipmentDefinition>,
    instigator: Option<ItemInstanceId>,
    pawn: ActorId,
    authority: bool,
    locally_controlled: bool,
    state: EquipmentState,
    /// Replicated actors with the index of the descriptor that produced them.
    spawned_actors: Vec<(ActorId, usize)>,
    owner_client_spawned_actors: Vec<ActorId>,
    weapon: Option<HitScanWeaponInstance>,
    attachments: Option<WeaponAttachmentComponent>,
}

impl EquipmentInstance {
    pub fn new(
        id: EquipmentInstanceId,
        definition: Arc<EquipmentDefinition>,
        pawn: ActorId,
        authority: bool,
        locally_controlled: bool,
    ) -> Self {
        let weapon = match (&definition.weapon_stats, definition.is_weapon()) {
            (Some(stats), true) => Some(HitScanWeaponInstance::new(stats.clone())),
            (None, true) => {
                warn!("Equipment {} is a weapon without weapon stats", definition.id);
                None
            }
            _ => None,
        };
        let attachments = match (&definition.attachments, &weapon) {
            (Some(_), Some(_)) => Some(WeaponAttachmentComponent::new(authority).with_weapon(id, Some(pawn))),
            _ => None,
        };
        Self {
            id,
            definition,
            instigator: None,
            pawn,
            authority,
            locally_controlled,
            state: EquipmentState::Unequipped,
            spawned_actors: Vec::new(),
            owner_client_spawned_actors: Vec::new(),
            weapon,
            attachments,
        }
    }

    pub fn with_bus(mut self, bus: GameplayMessageBus) -> Self {
        self.attachments = self.attachments.take().map(|a| a.with_bus(bus));
        self
    }

    /// Bind the attachment component to the definition's slot layout. The authority installs
    /// slot defaults here.
    pub fn initialize_attachments(&mut self, registry: &DataRegistry<AttachmentDefinition>) {
        let Some(config) = self.definition.attachments.clone() else {
            return;
        };
        self.with_attachments(registry, |attachments, ctx| attachments.initialize(Arc::new(config), ctx));
    }

    pub fn id(&self) -> EquipmentInstanceId {
        self.id
    }

    pub fn definition(&self) -> &Arc<EquipmentDefinition> {
        &self.definition
    }

    pub fn instigator(&self) -> Option<ItemInstanceId> {
        self.instigator
    }

    pub fn set_instigator(&mut self, item: Option<ItemInstanceId>) {
        self.instigator = item;
    }

    pub fn pawn(&self) -> ActorId {
        self.pawn
    }

    pub fn state(&self) -> EquipmentState {
        self.state
    }

    pub fn is_equipped(&self) -> bool {
        self.state == EquipmentState::Equipped
    }

    pub fn spawned_actors(&self) -> &[(ActorId, usize)] {
        &self.spawned_actors
    }

    pub fn owner_client_spawned_actors(&self) -> &[ActorId] {
        &self.owner_client_spawned_actors
    }

    pub fn weapon(&self) -> Option<&HitScanWeaponInstance> {
        self.weapon.as_ref()
    }

    pub fn weapon_mut(&mut self) -> Option<&mut HitScanWeaponInstance> {
        self.weapon.as_mut()
    }

    pub fn attachments(&self) -> Option<&WeaponAttachmentComponent> {
        self.attachments.as_ref()
    }

    /// Run `f` against the attachment component with a context that recalculates this weapon.
    /// `None` when the equipment has no attachment layout.
    pub fn with_attachments<R>(
        &mut self,
        registry: &DataRegistry<AttachmentDefinition>,
        f: impl FnOnce(&mut WeaponAttachmentComponent, &mut AttachmentContext<'_>) -> R,
    ) -> Option<R> {
        let attachments = self.attachments.as_mut()?;
        let mut ctx = AttachmentContext::new(registry);
        if let Some(weapon) = self.weapon.as_mut() {
            ctx = ctx.with_weapon(weapon);
        }
        Some(f(attachments, &mut ctx))
    }

    /// Re-push attachment blocked tags after the installed set changed while equipped.
    pub fn refresh_attachment_tags(&mut self, asc: &mut AbilitySystemComponent) {
        if !self.is_equipped() {
            return;
        }
        if let (Some(weapon), Some(attachments)) = (self.weapon.as_mut(), self.attachments.as_ref()) {
            weapon.apply_attachment_tags_to_asc(asc, attachments);
        }
    }

    // ===== ACTORS =====

    pub fn actor_request(&self, descriptor: &EquipmentActorToSpawn, host: &dyn EquipmentActorHost) -> ActorSpawnRequest {
        ActorSpawnRequest {
            class: descriptor.actor_class.clone(),
            pawn: self.pawn,
            parent: host.find_parent_component(self.pawn, descriptor.parent_component_tag.as_deref()),
            socket: descriptor.attach_socket.clone(),
            relative_transform: descriptor.relative_transform(),
            tags: descriptor.actor_tags.clone(),
            replicated: descriptor.replicate,
        }
    }

    /// Replicated descriptors spawn on the authority, local ones on the owning client; every
    /// other combination is skipped.
    pub fn spawn_equipment_actors(&mut self, host: &mut dyn EquipmentActorHost) {
        let definition = self.definition.clone();
        for (index, descriptor) in definition.actors_to_spawn.iter().enumerate() {
            if descriptor.replicate && self.authority {
                let request = self.actor_request(descriptor, host);
                let actor = host.spawn_actor(request);
                self.spawned_actors.push((actor, index));
            } else if !descriptor.replicate && self.locally_controlled {
                let request = self.actor_request(descriptor, host);
                let actor = host.spawn_actor(request);
                self.owner_client_spawned_actors.push(actor);
            }
        }
    }

    /// Receiver side of the replicated actor list.
    pub fn bind_replicated_actors(&mut self, actors: &[(ActorId, usize)], host: &mut dyn EquipmentActorHost) {
        if self.authority {
            return;
        }
        let definition = self.definition.clone();
        for &(actor, index) in actors {
            if self.spawned_actors.iter().any(|(a, _)| *a == actor) {
                continue;
            }
            let Some(descriptor) = definition.actors_to_spawn.get(index) else {
                warn!("Replicated actor {} refers to missing descriptor {} on {}", actor, index, definition.id);
                continue;
            };
            let request = self.actor_request(descriptor, host);
            host.bind_replicated_actor(actor, request, self.id, self.state);
            self.spawned_actors.push((actor, index));
        }
    }

    pub fn destroy_equipment_actors(&mut self, host: &mut dyn EquipmentActorHost) {
        if self.authority {
            for (actor, _) in self.spawned_actors.drain(..) {
                host.destroy_actor(actor);
            }
        } else {
            self.spawned_actors.clear();
        }
        // Local actors left behind overlap the next weapon's.
        for actor in self.owner_client_spawned_actors.drain(..) {
            host.destroy_actor(actor);
        }
    }

    pub fn set_actors_hidden(&self, hidden: bool, host: &mut dyn EquipmentActorHost) {
        for &(actor, _) in &self.spawned_actors {
            host.set_actor_hidden(actor, hidden);
            if !hidden && !self.authority {
                host.set_actor_hidden_locally(actor, false);
            }
        }
        for &actor in &self.owner_client_spawned_actors {
            host.set_actor_hidden_locally(actor, hidden);
        }
    }

    // ===== STATE =====

    /// Returns true if the state changed.
    pub fn set_equipment_state(
        &mut self,
        state: EquipmentState,
        asc: Option<&mut AbilitySystemComponent>,
        host: &mut dyn EquipmentActorHost,
    ) -> bool {
        if !self.authority {
            warn!("set_equipment_state on {} called without authority", self.definition.id);
            return false;
        }
        if self.state == state {
            return false;
        }
        let old = self.state;
        self.state = state;
        self.on_state_changed(old, asc, host);
        true
    }

    pub fn on_rep_equipment_state(
        &mut self,
        state: EquipmentState,
        asc: Option<&mut AbilitySystemComponent>,
        host: &mut dyn EquipmentActorHost,
    ) {
        if self.authority || self.state == state {
            return;
        }
        let old = self.state;
        self.state = state;
        self.on_state_changed(old, asc, host);
    }

    fn on_state_changed(
        &mut self,
        old: EquipmentState,
        asc: Option<&mut AbilitySystemComponent>,
        host: &mut dyn EquipmentActorHost,
    ) {
        match (old, self.state) {
            (EquipmentState::Unequipped, EquipmentState::Equipped) => self.on_equipped(asc, host),
            (EquipmentState::Equipped, EquipmentState::Unequipped) => self.on_unequipped(asc, host),
            _ => {}
        }
    }

    pub fn on_equipped(&mut self, asc: Option<&mut AbilitySystemComponent>, host: &mut dyn EquipmentActorHost) {
        if self.definition.auto_show_on_equip {
            self.set_actors_hidden(false, host);
        }
        if let Some(weapon) = self.weapon.as_mut() {
            weapon.on_equipped(asc, self.attachments.as_ref());
        }
        debug!("Equipped {} ({:?})", self.definition.id, self.id);
    }

    pub fn on_unequipped(&mut self, asc: Option<&mut AbilitySystemComponent>, host: &mut dyn EquipmentActorHost) {
        if self.definition.auto_hide_on_unequip {
            self.set_actors_hidden(true, host);
        }
        if let Some(weapon) = self.weapon.as_mut() {
            weapon.on_unequipped(asc);
        }
        debug!("Unequipped {} ({:?})", self.definition.id, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::equipment::actors::EquipmentActorRegistry;
    use crate::tags::{names, tag, tag_container};
    use crate::weapons::attachments::{AttachmentSlotDef, WeaponAttachmentsConfig};
    use crate::weapons::HitScanWeaponStats;

    fn definition() -> Arc<EquipmentDefinition> {
        Arc::new(
            EquipmentDefinition::hit_scan_weapon("rifle", HitScanWeaponStats::default())
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
                    slots: vec![AttachmentSlotDef::new(tag(names::ATTACHMENT_SLOT_OPTIC)).with_default("scope")],
                    max_attachments: 0,
                }),
        )
    }

    fn spawned(authority: bool, local: bool) -> (usize, usize) {
        let mut host = EquipmentActorRegistry::new();
        let mut instance = EquipmentInstance::new(EquipmentInstanceId(1), definition(), 1, authority, local);
        instance.spawn_equipment_actors(&mut host);
        (instance.spawned_actors().len(), instance.owner_client_spawned_actors().len())
    }

    #[test]
    fn test_spawn_rules_follow_role() {
        assert_eq!(spawned(true, false), (1, 0));
        assert_eq!(spawned(true, true), (1, 1));
        assert_eq!(spawned(false, true), (0, 1));
        assert_eq!(spawned(false, false), (0, 0));
    }

    #[test]
    fn test_equip_shows_and_unequip_hides() {
        let mut host = EquipmentActorRegistry::new();
        let mut instance = EquipmentInstance::new(EquipmentInstanceId(1), definition(), 1, true, true);
        instance.spawn_equipment_actors(&mut host);

        assert!(instance.set_equipment_state(EquipmentState::Equipped, None, &mut host));
        assert!(!instance.set_equipment_state(EquipmentState::Equipped, None, &mut host));
        assert!(host.actors().all(|a| a.is_visible()));

        instance.set_equipment_state(EquipmentState::Unequipped, None, &mut host);
        let (replicated, _) = instance.spawned_actors()[0];
        assert!(host.actor(replicated).unwrap().hidden);
        let local = instance.owner_client_spawned_actors()[0];
        assert!(host.actor(local).unwrap().locally_hidden);

        instance.destroy_equipment_actors(&mut host);
        assert!(host.is_empty());
    }

    #[test]
    fn test_receiver_ignores_direct_state_changes() {
        let mut host = EquipmentActorRegistry::new();
        let mut instance = EquipmentInstance::new(EquipmentInstanceId(1), definition(), 1, false, false);
        assert!(!instance.set_equipment_state(EquipmentState::Equipped, None, &mut host));
        instance.on_rep_equipment_state(EquipmentState::Equipped, None, &mut host);
        assert!(instance.is_equipped());
    }

    #[test]
    fn test_blocked_tags_follow_equip_state() {
        let mut registry = DataRegistry::new();
        let mut scope = AttachmentDefinition::new("scope", tag(names::ATTACHMENT_SLOT_OPTIC));
        scope.blocked_ability_tags = tag_container(&["Ability.Type.Action.Sprint"]);
        registry.insert(scope);

        let mut host = EquipmentActorRegistry::new();
        let mut asc = AbilitySystemComponent::default();
        let mut instance = EquipmentInstance::new(EquipmentInstanceId(1), definition(), 1, true, false);
        instance.initialize_attachments(&registry);
        assert_eq!(instance.attachments().unwrap().installed_attachment_count(), 1);

        instance.set_equipment_state(EquipmentState::Equipped, Some(&mut asc), &mut host);
        assert!(asc.has_matching_gameplay_tag(&tag("Ability.Type.Action.Sprint")));
        instance.set_equipment_state(EquipmentState::Unequipped, Some(&mut asc), &mut host);
        assert!(!asc.has_matching_gameplay_tag(&tag("Ability.Type.Action.Sprint")));
    }
}
