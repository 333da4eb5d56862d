//! Actors spawned for equipment
//!
//! The world side of equipment is reached through `EquipmentActorHost`. The authority spawns
//! replicated actors; the owning client spawns its local-only ones. `EquipmentActorRegistry` is
//! the host used by both apps: it keeps one record per actor and the render side mirrors it.

use bevy::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

use super::instance::EquipmentState;
use super::EquipmentInstanceId;
use crate::weapons::trace::ActorId;

/// Equipment actor ids live above every pawn id.
pub const EQUIPMENT_ACTOR_ID_BASE: ActorId = 1 << 32;

/// Where on the pawn a spawned actor is parented.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttachParent {
    Tagged(String),
    CharacterMesh,
    Root,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ActorSpawnRequest {
    pub class: String,
    pub pawn: ActorId,
    pub parent: AttachParent,
    pub socket: String,
    pub relative_transform: Transform,
    pub tags: Vec<String>,
    pub replicated: bool,
}

/// Sits on every spawned equipment actor. The equipment reference arrives once; when it does the
/// actor is known to exist and can be hidden without touching replicated visibility.
#[derive(Component, Clone, Debug, Default, PartialEq)]
pub struct EquipmentActorComponent {
    pub actor: ActorId,
    equipment: Option<EquipmentInstanceId>,
}

impl EquipmentActorComponent {
    pub fn new(actor: ActorId) -> Self {
        Self { actor, equipment: None }
    }

    pub fn equipment(&self) -> Option<EquipmentInstanceId> {
        self.equipment
    }

    /// Returns true when the actor should be hidden locally.
    pub fn on_rep_equipment_inst(&mut self, equipment: EquipmentInstanceId, state: EquipmentState) -> bool {
        if self.equipment.is_some() {
            return false;
        }
        self.equipment = Some(equipment);
        state == EquipmentState::Unequipped
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EquipmentActorRecord {
    pub id: ActorId,
    pub request: ActorSpawnRequest,
    /// Replicated visibility set by the authority.
    pub hidden: bool,
    /// Local visibility; never replicated.
    pub locally_hidden: bool,
    pub tick_enabled: bool,
    pub collision_enabled: bool,
    pub component: EquipmentActorComponent,
}

impl EquipmentActorRecord {
    pub fn is_visible(&self) -> bool {
        !self.hidden && !self.locally_hidden
    }
}

pub trait EquipmentActorHost {
    fn find_parent_component(&self, pawn: ActorId, component_tag: Option<&str>) -> AttachParent;

    fn spawn_actor(&mut self, request: ActorSpawnRequest) -> ActorId;

    fn destroy_actor(&mut self, actor: ActorId);

    /// Replicated hide, set on the authority.
    fn set_actor_hidden(&mut self, actor: ActorId, hidden: bool);

    /// Local hide that also stops ticking and collision.
    fn set_actor_hidden_locally(&mut self, actor: ActorId, hidden: bool);

    /// A replicated actor of `equipment` reached this endpoint.
    fn bind_replicated_actor(
        &mut self,
        actor: ActorId,
        request: ActorSpawnRequest,
        equipment: EquipmentInstanceId,
        state: EquipmentState,
    );
}

#[derive(Resource, Clone, Debug, Default)]
pub struct EquipmentActorRegistry {
    next_id: u64,
    actors: BTreeMap<ActorId, EquipmentActorRecord>,
    pawn_component_tags: BTreeMap<ActorId, Vec<String>>,
    pawns_with_mesh: BTreeSet<ActorId>,
}

impl EquipmentActorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare the scene components a pawn carries.
    pub fn register_pawn(&mut self, pawn: ActorId, has_mesh: bool, component_tags: Vec<String>) {
        if has_mesh {
            self.pawns_with_mesh.insert(pawn);
        } else {
            self.pawns_with_mesh.remove(&pawn);
        }
        self.pawn_component_tags.insert(pawn, component_tags);
    }

    /// Record an actor that replicated from the authority.
    pub fn insert_replicated(&mut self, id: ActorId, request: ActorSpawnRequest) {
        self.actors.entry(id).or_insert_with(|| EquipmentActorRecord {
            id,
            request,
            hidden: false,
            locally_hidden: false,
            tick_enabled: true,
            collision_enabled: true,
            component: EquipmentActorComponent::new(id),
        });
    }

    pub fn actor(&self, actor: ActorId) -> Option<&EquipmentActorRecord> {
        self.actors.get(&actor)
    }

    pub fn actors(&self) -> impl Iterator<Item = &EquipmentActorRecord> {
        self.actors.values()
    }

    pub fn actors_of_pawn(&self, pawn: ActorId) -> impl Iterator<Item = &EquipmentActorRecord> {
        self.actors.values().filter(move |a| a.request.pawn == pawn)
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }
}

impl EquipmentActorHost for EquipmentActorRegistry {
    fn find_parent_component(&self, pawn: ActorId, component_tag: Option<&str>) -> AttachParent {
        if let Some(wanted) = component_tag {
            let found = self
                .pawn_component_tags
                .get(&pawn)
                .is_some_and(|tags| tags.iter().any(|t| t == wanted));
            if found {
                return AttachParent::Tagged(wanted.to_string());
            }
        }
        if self.pawns_with_mesh.contains(&pawn) {
            AttachParent::CharacterMesh
        } else {
            AttachParent::Root
        }
    }

    fn spawn_actor(&mut self, request: ActorSpawnRequest) -> ActorId {
        self.next_id += 1;
        let id = EQUIPMENT_ACTOR_ID_BASE + self.next_id;
        debug!("Spawned equipment actor {} ({}) on pawn {}", id, request.class, request.pawn);
        self.actors.insert(
            id,
            EquipmentActorRecord {
                id,
                request,
                hidden: false,
                locally_hidden: false,
                tick_enabled: true,
                collision_enabled: true,
                component: EquipmentActorComponent::new(id),
            },
        );
        id
    }

    fn destroy_actor(&mut self, actor: ActorId) {
        if self.actors.remove(&actor).is_none() {
            debug!("destroy_actor: {} already gone", actor);
        }
    }

    fn set_actor_hidden(&mut self, actor: ActorId, hidden: bool) {
        if let Some(record) = self.actors.get_mut(&actor) {
            record.hidden = hidden;
        }
    }

    fn set_actor_hidden_locally(&mut self, actor: ActorId, hidden: bool) {
        if let Some(record) = self.actors.get_mut(&actor) {
            record.locally_hidden = hidden;
            record.tick_enabled = !hidden;
            record.collision_enabled = !hidden;
        }
    }

    fn bind_replicated_actor(
        &mut self,
        actor: ActorId,
        request: ActorSpawnRequest,
        equipment: EquipmentInstanceId,
        state: EquipmentState,
    ) {
        self.insert_replicated(actor, request);
        let Some(record) = self.actors.get_mut(&actor) else {
            return;
        };
        if record.component.on_rep_equipment_inst(equipment, state) {
            self.set_actor_hidden_locally(actor, true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(pawn: ActorId) -> ActorSpawnRequest {
        ActorSpawnRequest {
            class: "RifleMesh".into(),
            pawn,
            parent: AttachParent::Root,
            socket: String::new(),
            relative_transform: Transform::IDENTITY,
            tags: Vec::new(),
            replicated: true,
        }
    }

    #[test]
    fn test_parent_component_fallbacks() {
        let mut host = EquipmentActorRegistry::new();
        host.register_pawn(1, true, vec!["WeaponHolster".into()]);
        host.register_pawn(2, false, Vec::new());

        assert_eq!(
            host.find_parent_component(1, Some("WeaponHolster")),
            AttachParent::Tagged("WeaponHolster".into())
        );
        assert_eq!(host.find_parent_component(1, Some("Backpack")), AttachParent::CharacterMesh);
        assert_eq!(host.find_parent_component(2, None), AttachParent::Root);
    }

    #[test]
    fn test_unequipped_proxy_actor_hides_locally_once() {
        let mut host = EquipmentActorRegistry::new();
        let actor = EQUIPMENT_ACTOR_ID_BASE + 7;

        host.bind_replicated_actor(actor, request(1), EquipmentInstanceId(3), EquipmentState::Unequipped);
        let record = host.actor(actor).unwrap();
        assert!(!record.hidden);
        assert!(record.locally_hidden && !record.tick_enabled && !record.collision_enabled);
        assert_eq!(record.component.equipment(), Some(EquipmentInstanceId(3)));

        // Initial-only: later bindings are ignored.
        host.set_actor_hidden_locally(actor, false);
        host.bind_replicated_actor(actor, request(1), EquipmentInstanceId(3), EquipmentState::Unequipped);
        assert!(host.actor(actor).unwrap().is_visible());
    }
}
