//! Runtime records for granted abilities

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::definition::{AbilityDefinition, ActivationGroup};
use super::tasks::PlayMontageTask;
use crate::equipment::EquipmentInstanceId;
use crate::inventory::ItemInstanceId;
use crate::tags::{GameplayTag, GameplayTagContainer};
use crate::weapons::firing::FireController;

/// Handle to a granted ability. Stays valid until the ability is cleared; every API tolerates
/// stale handles.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AbilitySpecHandle(pub u32);

impl AbilitySpecHandle {
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

/// Token scoping optimistic client work until the server accepts or rejects it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PredictionKey(pub u32);

impl PredictionKey {
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

pub type InstanceId = u32;

/// Instance id used for non-instanced abilities (they run on the shared definition).
pub const SHARED_INSTANCE: InstanceId = 0;

/// What granted an ability.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbilitySource {
    pub equipment: Option<EquipmentInstanceId>,
    pub item: Option<ItemInstanceId>,
}

/// Data carried by a gameplay event.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GameplayEventData {
    pub event_tag: GameplayTag,
    pub instigator: Option<u64>,
    pub target: Option<u64>,
    pub magnitude: f32,
    pub instigator_tags: GameplayTagContainer,
}

/// Per-activation behaviour state, keyed by the definition's `AbilityKind`.
#[derive(Clone, Debug, Default)]
pub enum InstanceBehavior {
    #[default]
    None,
    Fire(FireController),
    Montage(PlayMontageTask),
    Death { death_started: bool },
}

#[derive(Clone, Debug)]
pub struct AbilityInstance {
    pub id: InstanceId,
    pub active: bool,
    /// Current group; may differ from the definition after `change_activation_group`.
    pub activation_group: ActivationGroup,
    pub can_be_canceled: bool,
    pub prediction_key: PredictionKey,
    pub trigger_event: Option<GameplayEventData>,
    pub behavior: InstanceBehavior,
    /// Cost with `only_apply_cost_on_hit` still owed.
    pub committed: bool,
}

impl AbilityInstance {
    pub fn new(id: InstanceId, group: ActivationGroup) -> Self {
        Self {
            id,
            active: false,
            activation_group: group,
            can_be_canceled: true,
            prediction_key: PredictionKey::default(),
            trigger_event: None,
            behavior: InstanceBehavior::None,
            committed: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AbilitySpec {
    pub handle: AbilitySpecHandle,
    pub definition: Arc<AbilityDefinition>,
    pub level: i32,
    /// Input tags are stamped here by ability sets.
    pub dynamic_source_tags: GameplayTagContainer,
    pub source: AbilitySource,
    pub instances: Vec<AbilityInstance>,
    /// Number of running activations.
    pub active_count: u32,
    pub input_pressed: bool,
    pub pending_remove: bool,
}

impl AbilitySpec {
    pub fn new(definition: Arc<AbilityDefinition>, level: i32) -> Self {
        Self {
            handle: AbilitySpecHandle::default(),
            definition,
            level,
            dynamic_source_tags: GameplayTagContainer::new(),
            source: AbilitySource::default(),
            instances: Vec::new(),
            active_count: 0,
            input_pressed: false,
            pending_remove: false,
        }
    }

    pub fn with_input_tag(mut self, tag: GameplayTag) -> Self {
        self.dynamic_source_tags.add_tag(tag);
        self
    }

    pub fn with_source(mut self, source: AbilitySource) -> Self {
        self.source = source;
        self
    }

    pub fn is_active(&self) -> bool {
        self.active_count > 0
    }

    pub fn instance(&self, id: InstanceId) -> Option<&AbilityInstance> {
        self.instances.iter().find(|i| i.id == id)
    }

    pub fn instance_mut(&mut self, id: InstanceId) -> Option<&mut AbilityInstance> {
        self.instances.iter_mut().find(|i| i.id == id)
    }

    pub fn active_instances(&self) -> impl Iterator<Item = &AbilityInstance> {
        self.instances.iter().filter(|i| i.active)
    }
}
