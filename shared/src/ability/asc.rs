//! Ability System Component
//!
//! Owns granted abilities, attribute sets, active effects and owned tag counts for one actor.
//! Arbitrates activation groups, routes input tags to abilities and propagates activation
//! failures. Everything that must reach another system (network RPCs, behaviour drivers,
//! attribute side effects) is queued as an `AbilityNotification` and drained by systems, so
//! no caller mutates this component from inside one of its own callbacks.

use bevy::prelude::*;
use std::sync::Arc;

use super::definition::{
    AbilityCost, AbilityDefinition, AbilityKind, ActivationGroup, ActivationPolicy, InstancingPolicy,
    NetExecutionPolicy,
};
use super::montage::{LocalMontageRecord, MontageRpc, PredictedMontage, RepAnimMontageForMesh};
use super::relationship::AbilityTagRelationshipMapping;
use super::spec::{
    AbilityInstance, AbilitySource, AbilitySpec, AbilitySpecHandle, GameplayEventData, InstanceBehavior, InstanceId,
    PredictionKey, SHARED_INSTANCE,
};
use super::tasks::{MontageTaskOutcome, PendingMontageStop};
use crate::attributes::{AttributeEvent, AttributeSet, AttributeSetClass, EffectModCallbackData, GameplayAttribute};
use crate::effects::{
    aggregate, ActiveGameplayEffect, ActiveGameplayEffectHandle, EffectContext, EffectDuration, GameplayEffect,
    ModifierOp,
};
use crate::error::AbilityError;
use crate::inventory::ItemInstanceId;
use crate::message_bus::{GameVerbMessage, GameplayMessageBus};
use crate::tags::{names, tag, GameplayTag, GameplayTagContainer, GameplayTagCountContainer};

/// Network role of the actor owning this component.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NetRole {
    #[default]
    Authority,
    AutonomousProxy,
    SimulatedProxy,
}

/// The pawn the abilities act through.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AvatarInfo {
    pub id: u64,
    pub torn_off: bool,
    /// Seconds until destruction; 0 when not expiring.
    pub life_span: f32,
}

impl AvatarInfo {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            torn_off: false,
            life_span: 0.0,
        }
    }
}

/// Activation result: the running instance, or the failure reasons.
pub type ActivationResult = Result<InstanceId, GameplayTagContainer>;

/// Read/write access to per-item tag stacks for item costs.
pub trait ItemStackSource {
    fn stat_tag_stack_count(&self, item: ItemInstanceId, tag: &GameplayTag) -> i32;
    fn remove_stat_tag_stack(&mut self, item: ItemInstanceId, tag: &GameplayTag, count: i32);
}

/// Collaborators an activation may need beyond the component itself.
#[derive(Default)]
pub struct ActivationEnv<'a> {
    pub items: Option<&'a mut dyn ItemStackSource>,
}

impl<'a> ActivationEnv<'a> {
    pub fn none() -> Self {
        Self { items: None }
    }

    pub fn with_items(items: &'a mut dyn ItemStackSource) -> Self {
        Self { items: Some(items) }
    }
}

/// Work queued for systems outside the component.
#[derive(Clone, Debug, PartialEq)]
pub enum AbilityNotification {
    Activated {
        handle: AbilitySpecHandle,
        instance: InstanceId,
    },
    Ended {
        handle: AbilitySpecHandle,
        instance: InstanceId,
        was_cancelled: bool,
    },
    /// Generic "input pressed" event for an already running ability.
    InputPressed {
        handle: AbilitySpecHandle,
        instance: InstanceId,
    },
    InputReleased {
        handle: AbilitySpecHandle,
        instance: InstanceId,
    },
    /// Client -> server: activate a predicted ability.
    ServerTryActivate {
        definition_id: String,
        prediction_key: PredictionKey,
    },
    /// Client -> server: replicated generic input event.
    ServerInputEvent {
        definition_id: String,
        pressed: bool,
    },
    /// Replicate an end or cancel to the other endpoint.
    ReplicateEnd {
        definition_id: String,
        was_cancelled: bool,
    },
    /// Server -> owning client.
    ClientAbilityFailed {
        definition_id: String,
        failure_tags: GameplayTagContainer,
    },
    ClientPredictionRejected {
        prediction_key: PredictionKey,
    },
    ClientPredictionAccepted {
        prediction_key: PredictionKey,
    },
    ServerMontage(MontageRpc),
    MontageTask {
        handle: AbilitySpecHandle,
        instance: InstanceId,
        outcome: MontageTaskOutcome,
    },
    Attribute(AttributeEvent),
}

#[derive(Component)]
pub struct AbilitySystemComponent {
    role: NetRole,
    locally_controlled: bool,
    avatar: Option<AvatarInfo>,
    /// Controller identity used in failure messages.
    player_id: Option<u64>,
    bus: Option<GameplayMessageBus>,

    specs: Vec<AbilitySpec>,
    next_handle: u32,
    next_instance_id: InstanceId,
    scope_lock_count: u32,

    owned_tags: GameplayTagCountContainer,
    blocked_ability_tags: GameplayTagCountContainer,
    tag_relationship_mapping: Option<Arc<AbilityTagRelationshipMapping>>,
    activation_group_counts: [i32; ActivationGroup::COUNT],
    /// Set while a death ability runs.
    death_blocks_activation: bool,

    input_pressed: Vec<AbilitySpecHandle>,
    input_released: Vec<AbilitySpecHandle>,
    input_held: Vec<AbilitySpecHandle>,
    /// Pressed handles that have not seen a release yet.
    pressed_waiting_release: Vec<AbilitySpecHandle>,

    attribute_sets: Vec<AttributeSet>,
    active_effects: Vec<ActiveGameplayEffect>,
    next_effect_handle: u32,

    cooldowns: Vec<(String, f64)>,
    world_time: f64,

    next_prediction_key: u32,
    pub(crate) local_montages: Vec<LocalMontageRecord>,
    pub(crate) replicated_montages: Vec<RepAnimMontageForMesh>,
    pub(crate) predicted_montages: Vec<PredictedMontage>,
    pub(crate) replicated_montages_dirty: bool,
    pub(crate) pending_montage_stops: Vec<PendingMontageStop>,

    notifications: Vec<AbilityNotification>,
}

impl Default for AbilitySystemComponent {
    fn default() -> Self {
        Self::new(NetRole::Authority, true)
    }
}

impl AbilitySystemComponent {
    pub fn new(role: NetRole, locally_controlled: bool) -> Self {
        Self {
            role,
            locally_controlled,
            avatar: None,
            player_id: None,
            bus: None,
            specs: Vec::new(),
            next_handle: 1,
            next_instance_id: 1,
            scope_lock_count: 0,
            owned_tags: GameplayTagCountContainer::default(),
            blocked_ability_tags: GameplayTagCountContainer::default(),
            tag_relationship_mapping: None,
            activation_group_counts: [0; ActivationGroup::COUNT],
            death_blocks_activation: false,
            input_pressed: Vec::new(),
            input_released: Vec::new(),
            input_held: Vec::new(),
            pressed_waiting_release: Vec::new(),
            attribute_sets: Vec::new(),
            active_effects: Vec::new(),
            next_effect_handle: 1,
            cooldowns: Vec::new(),
            world_time: 0.0,
            next_prediction_key: 1,
            local_montages: Vec::new(),
            replicated_montages: Vec::new(),
            predicted_montages: Vec::new(),
            replicated_montages_dirty: false,
            pending_montage_stops: Vec::new(),
            notifications: Vec::new(),
        }
    }

    pub fn with_bus(mut self, bus: GameplayMessageBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_player_id(mut self, player_id: u64) -> Self {
        self.player_id = Some(player_id);
        self
    }

    pub fn role(&self) -> NetRole {
        self.role
    }

    pub fn is_authority(&self) -> bool {
        self.role == NetRole::Authority
    }

    pub fn is_locally_controlled(&self) -> bool {
        self.locally_controlled
    }

    pub fn player_id(&self) -> Option<u64> {
        self.player_id
    }

    pub fn bus(&self) -> Option<&GameplayMessageBus> {
        self.bus.as_ref()
    }

    pub fn world_time(&self) -> f64 {
        self.world_time
    }

    pub fn avatar(&self) -> Option<AvatarInfo> {
        self.avatar
    }

    /// Assign the avatar. A new avatar runs on-spawn abilities.
    pub fn set_avatar(&mut self, avatar: AvatarInfo, env: &mut ActivationEnv<'_>) {
        let is_new = self.avatar.map(|a| a.id) != Some(avatar.id);
        self.avatar = Some(avatar);
        if is_new {
            self.try_activate_abilities_on_spawn(env);
        }
    }

    pub fn clear_avatar(&mut self) {
        self.avatar = None;
        self.clear_ability_input();
    }

    pub fn set_tag_relationship_mapping(&mut self, mapping: Option<Arc<AbilityTagRelationshipMapping>>) {
        self.tag_relationship_mapping = mapping;
    }

    pub fn get_additional_activation_tag_requirements(
        &self,
        ability_tags: &GameplayTagContainer,
        out_required: &mut GameplayTagContainer,
        out_blocked: &mut GameplayTagContainer,
    ) {
        if let Some(mapping) = &self.tag_relationship_mapping {
            mapping.get_required_and_blocked_activation_tags(ability_tags, out_required, out_blocked);
        }
    }

    pub fn drain_notifications(&mut self) -> Vec<AbilityNotification> {
        std::mem::take(&mut self.notifications)
    }

    pub(crate) fn notify(&mut self, notification: AbilityNotification) {
        self.notifications.push(notification);
    }

    // ===== TAGS =====

    pub fn owned_tags(&self) -> &GameplayTagContainer {
        self.owned_tags.explicit_tags()
    }

    pub fn has_matching_gameplay_tag(&self, tag: &GameplayTag) -> bool {
        self.owned_tags.has_matching_tag(tag)
    }

    pub fn tag_count(&self, tag: &GameplayTag) -> i32 {
        self.owned_tags.tag_count(tag)
    }

    pub fn add_loose_gameplay_tag(&mut self, tag: &GameplayTag, count: i32) {
        self.owned_tags.update_tag_count(tag, count);
    }

    pub fn remove_loose_gameplay_tag(&mut self, tag: &GameplayTag, count: i32) {
        self.owned_tags.update_tag_count(tag, -count);
    }

    pub fn add_loose_gameplay_tags(&mut self, tags: &GameplayTagContainer, count: i32) {
        self.owned_tags.update_container(tags, count);
    }

    pub fn remove_loose_gameplay_tags(&mut self, tags: &GameplayTagContainer, count: i32) {
        self.owned_tags.update_container(tags, -count);
    }

    pub fn are_ability_tags_blocked(&self, tags: &GameplayTagContainer) -> bool {
        self.blocked_ability_tags.has_any_matching(tags)
    }

    // ===== SPECS =====

    pub fn specs(&self) -> &[AbilitySpec] {
        &self.specs
    }

    pub fn find_spec(&self, handle: AbilitySpecHandle) -> Option<&AbilitySpec> {
        self.specs.iter().find(|s| s.handle == handle && !s.pending_remove)
    }

    pub fn find_spec_mut(&mut self, handle: AbilitySpecHandle) -> Option<&mut AbilitySpec> {
        self.specs.iter_mut().find(|s| s.handle == handle && !s.pending_remove)
    }

    fn spec_index(&self, handle: AbilitySpecHandle) -> Option<usize> {
        self.specs.iter().position(|s| s.handle == handle && !s.pending_remove)
    }

    pub fn find_ability_spec_handle_for_id(&self, id: &str, source: Option<AbilitySource>) -> Option<AbilitySpecHandle> {
        self.specs
            .iter()
            .filter(|s| !s.pending_remove && s.definition.id == id)
            .find(|s| source.map_or(true, |src| s.source == src))
            .map(|s| s.handle)
    }

    /// Grant an ability. Authority only; returns an invalid handle otherwise.
    pub fn grant_ability(&mut self, mut spec: AbilitySpec, env: &mut ActivationEnv<'_>) -> AbilitySpecHandle {
        if !self.is_authority() {
            warn!("grant_ability called on a non-authoritative ability system for {}", spec.definition.id);
            return AbilitySpecHandle::default();
        }
        let handle = AbilitySpecHandle(self.next_handle);
        self.next_handle += 1;
        spec.handle = handle;
        if spec.definition.instancing_policy == InstancingPolicy::InstancedPerActor {
            let id = self.allocate_instance_id();
            spec.instances.push(AbilityInstance::new(id, spec.definition.activation_group));
        }
        debug!("Granted ability {} ({:?})", spec.definition.id, handle);
        self.specs.push(spec);
        self.try_activate_ability_on_spawn(handle, env);
        handle
    }

    /// Mirror a spec granted by the server onto a client component (keeps the server handle).
    pub fn mirror_granted_spec(&mut self, mut spec: AbilitySpec, handle: AbilitySpecHandle) {
        if self.specs.iter().any(|s| s.handle == handle) {
            return;
        }
        spec.handle = handle;
        if spec.definition.instancing_policy == InstancingPolicy::InstancedPerActor {
            let id = self.allocate_instance_id();
            spec.instances.push(AbilityInstance::new(id, spec.definition.activation_group));
        }
        self.next_handle = self.next_handle.max(handle.0 + 1);
        self.specs.push(spec);
    }

    /// Drop a mirrored spec after the server removed it.
    pub fn remove_mirrored_spec(&mut self, handle: AbilitySpecHandle) {
        if self.is_authority() {
            warn!("remove_mirrored_spec called on the authority; use clear_ability");
            return;
        }
        self.remove_spec(handle);
    }

    /// Remove an ability; active instances are cancelled first.
    pub fn clear_ability(&mut self, handle: AbilitySpecHandle) {
        if !self.is_authority() {
            warn!("clear_ability called on a non-authoritative ability system");
            return;
        }
        self.remove_spec(handle);
    }

    pub(crate) fn remove_spec(&mut self, handle: AbilitySpecHandle) {
        let Some(index) = self.spec_index(handle) else {
            return;
        };
        let active: Vec<InstanceId> = self.specs[index].active_instances().map(|i| i.id).collect();
        for instance in active {
            self.force_end(handle, instance, true);
        }
        self.input_pressed.retain(|h| *h != handle);
        self.input_released.retain(|h| *h != handle);
        self.input_held.retain(|h| *h != handle);
        self.pressed_waiting_release.retain(|h| *h != handle);
        if self.scope_lock_count > 0 {
            if let Some(spec) = self.specs.get_mut(index) {
                spec.pending_remove = true;
            }
        } else {
            self.specs.remove(index);
        }
    }

    fn flush_pending_removals(&mut self) {
        if self.scope_lock_count == 0 {
            self.specs.retain(|s| !s.pending_remove);
        }
    }

    fn allocate_instance_id(&mut self) -> InstanceId {
        let id = self.next_instance_id;
        self.next_instance_id += 1;
        id
    }

    fn allocate_prediction_key(&mut self) -> PredictionKey {
        let key = PredictionKey(self.next_prediction_key);
        self.next_prediction_key += 1;
        key
    }

    // ===== ACTIVATION =====

    pub fn try_activate_ability(&mut self, handle: AbilitySpecHandle, env: &mut ActivationEnv<'_>) -> ActivationResult {
        self.internal_try_activate(handle, PredictionKey::default(), None, env)
    }

    /// Server-side activation of a client-predicted ability.
    pub fn server_try_activate_ability(
        &mut self,
        handle: AbilitySpecHandle,
        prediction_key: PredictionKey,
        env: &mut ActivationEnv<'_>,
    ) -> ActivationResult {
        let result = self.internal_try_activate(handle, prediction_key, None, env);
        if prediction_key.is_valid() {
            match &result {
                Ok(_) => self.notify(AbilityNotification::ClientPredictionAccepted { prediction_key }),
                Err(_) => self.notify(AbilityNotification::ClientPredictionRejected { prediction_key }),
            }
        }
        result
    }

    pub fn try_activate_ability_with_event(
        &mut self,
        handle: AbilitySpecHandle,
        event: GameplayEventData,
        env: &mut ActivationEnv<'_>,
    ) -> ActivationResult {
        self.internal_try_activate(handle, PredictionKey::default(), Some(event), env)
    }

    fn role_allows(&self, policy: NetExecutionPolicy) -> bool {
        match self.role {
            NetRole::SimulatedProxy => false,
            NetRole::AutonomousProxy => policy.is_local_execution(),
            NetRole::Authority => policy != NetExecutionPolicy::LocalOnly || self.locally_controlled,
        }
    }

    fn internal_try_activate(
        &mut self,
        handle: AbilitySpecHandle,
        server_key: PredictionKey,
        event: Option<GameplayEventData>,
        env: &mut ActivationEnv<'_>,
    ) -> ActivationResult {
        let Some(index) = self.spec_index(handle) else {
            warn!("try_activate_ability called with invalid handle {:?}", handle);
            return Err(GameplayTagContainer::new());
        };
        let definition = self.specs[index].definition.clone();

        if !self.role_allows(definition.net_execution_policy) {
            let mut tags = GameplayTagContainer::new();
            tags.add_tag(tag(names::ABILITY_ACTIVATE_FAIL_NETWORKING));
            return Err(tags);
        }

        if self.specs[index].is_active() && definition.instancing_policy != InstancingPolicy::InstancedPerExecution {
            if !definition.retrigger_instanced_ability {
                return Err(GameplayTagContainer::new());
            }
            let running: Vec<InstanceId> = self.specs[index].active_instances().map(|i| i.id).collect();
            for instance in running {
                self.end_ability(handle, instance);
            }
        }

        let mut failure = GameplayTagContainer::new();
        if !self.can_activate_ability(handle, &mut failure, env) {
            self.notify_ability_failed(handle, &failure);
            return Err(failure);
        }

        let Some(index) = self.spec_index(handle) else {
            return Err(GameplayTagContainer::new());
        };

        let prediction_key = if server_key.is_valid() {
            server_key
        } else if self.role == NetRole::AutonomousProxy && definition.net_execution_policy == NetExecutionPolicy::LocalPredicted {
            self.allocate_prediction_key()
        } else {
            PredictionKey::default()
        };

        let instance_id = match definition.instancing_policy {
            InstancingPolicy::NonInstanced => {
                if self.specs[index].instance(SHARED_INSTANCE).is_none() {
                    self.specs[index]
                        .instances
                        .push(AbilityInstance::new(SHARED_INSTANCE, definition.activation_group));
                }
                SHARED_INSTANCE
            }
            InstancingPolicy::InstancedPerActor => match self.specs[index].instances.first() {
                Some(i) => i.id,
                None => {
                    let id = self.allocate_instance_id();
                    self.specs[index]
                        .instances
                        .push(AbilityInstance::new(id, definition.activation_group));
                    id
                }
            },
            InstancingPolicy::InstancedPerExecution => {
                let id = self.allocate_instance_id();
                self.specs[index]
                    .instances
                    .push(AbilityInstance::new(id, definition.activation_group));
                id
            }
        };

        {
            let spec = &mut self.specs[index];
            spec.active_count += 1;
            if let Some(instance) = spec.instance_mut(instance_id) {
                instance.active = true;
                instance.activation_group = definition.activation_group;
                instance.can_be_canceled = true;
                instance.prediction_key = prediction_key;
                instance.trigger_event = event;
                instance.committed = false;
                instance.behavior = InstanceBehavior::None;
            }
        }

        self.owned_tags.update_container(&definition.activation_owned_tags, 1);
        self.apply_ability_block_and_cancel_tags(&definition, handle, instance_id, true);
        self.add_ability_to_activation_group(definition.activation_group, handle, instance_id);

        if prediction_key.is_valid() && self.role == NetRole::AutonomousProxy {
            self.notify(AbilityNotification::ServerTryActivate {
                definition_id: definition.id.clone(),
                prediction_key,
            });
        }

        debug!("Activated ability {} instance {}", definition.id, instance_id);
        self.notify(AbilityNotification::Activated {
            handle,
            instance: instance_id,
        });

        self.activate_behavior(handle, instance_id, &definition, env);
        Ok(instance_id)
    }

    /// Built-in behaviour for kinds the component can run on its own.
    fn activate_behavior(
        &mut self,
        handle: AbilitySpecHandle,
        instance: InstanceId,
        definition: &AbilityDefinition,
        env: &mut ActivationEnv<'_>,
    ) {
        match &definition.kind {
            AbilityKind::Instant => {
                self.commit_ability(handle, instance, env, false);
                self.end_ability(handle, instance);
            }
            AbilityKind::Generic | AbilityKind::Aim | AbilityKind::Hold => {
                self.commit_ability(handle, instance, env, false);
            }
            AbilityKind::Death { auto_start_death } => {
                let auto_start = *auto_start_death;
                self.activate_death(handle, instance, auto_start);
            }
            AbilityKind::PlayMontage { mesh, montage, rate, event_tags } => {
                self.commit_ability(handle, instance, env, false);
                let task = super::tasks::PlayMontageTask::new(mesh.clone(), montage.clone(), *rate, event_tags.clone());
                if let Some(inst) = self.find_spec_mut(handle).and_then(|s| s.instance_mut(instance)) {
                    inst.behavior = InstanceBehavior::Montage(task);
                }
            }
            // Driven by the firing systems once a weapon is resolved
            AbilityKind::HitScanWeapon => {}
        }
    }

    /// Checks in order: death block, cooldown, cost, tag requirements, activation group.
    pub fn can_activate_ability(
        &self,
        handle: AbilitySpecHandle,
        out_tags: &mut GameplayTagContainer,
        env: &mut ActivationEnv<'_>,
    ) -> bool {
        let Some(spec) = self.find_spec(handle) else {
            return false;
        };
        let definition = &spec.definition;

        if self.death_blocks_activation
            && !definition.ability_tags.has_tag(&tag(names::ABILITY_BEHAVIOR_SURVIVES_DEATH))
        {
            out_tags.add_tag(tag(names::ABILITY_ACTIVATE_FAIL_IS_DEAD));
            return false;
        }

        if self.cooldown_remaining(&definition.id) > 0.0 {
            out_tags.add_tag(tag(names::ABILITY_ACTIVATE_FAIL_COOLDOWN));
            return false;
        }

        if !self.check_cost(spec, out_tags, env) {
            return false;
        }

        if !self.does_ability_satisfy_tag_requirements(definition, &spec.dynamic_source_tags, out_tags) {
            return false;
        }

        if self.is_activation_group_blocked(definition.activation_group) {
            out_tags.add_tag(tag(names::ABILITY_ACTIVATE_FAIL_ACTIVATION_GROUP));
            return false;
        }
        true
    }

    fn check_cost(&self, spec: &AbilitySpec, out_tags: &mut GameplayTagContainer, env: &mut ActivationEnv<'_>) -> bool {
        for cost in &spec.definition.additional_costs {
            match cost {
                AbilityCost::ItemTagStack {
                    quantity,
                    tag: stack_tag,
                    failure_tag,
                    ..
                } => {
                    let needed = quantity.value_at_level(spec.level).trunc() as i32;
                    let available = match (spec.source.item, env.items.as_deref()) {
                        (Some(item), Some(items)) => items.stat_tag_stack_count(item, stack_tag),
                        _ => return false,
                    };
                    if available < needed {
                        if failure_tag.is_valid() {
                            out_tags.add_tag(failure_tag.clone());
                        }
                        return false;
                    }
                }
            }
        }
        true
    }

    fn does_ability_satisfy_tag_requirements(
        &self,
        definition: &AbilityDefinition,
        source_tags: &GameplayTagContainer,
        out_tags: &mut GameplayTagContainer,
    ) -> bool {
        let mut blocked = self.are_ability_tags_blocked(&definition.ability_tags);
        let mut missing = false;

        let mut all_required = definition.activation_required_tags.clone();
        let mut all_blocked = definition.activation_blocked_tags.clone();
        self.get_additional_activation_tag_requirements(&definition.ability_tags, &mut all_required, &mut all_blocked);

        if !all_blocked.is_empty() || !all_required.is_empty() {
            if self.owned_tags.has_any_matching(&all_blocked) {
                if self.has_matching_gameplay_tag(&tag(names::STATUS_DEATH)) {
                    out_tags.add_tag(tag(names::ABILITY_ACTIVATE_FAIL_IS_DEAD));
                }
                blocked = true;
            }
            if !self.owned_tags.has_all_matching(&all_required) {
                missing = true;
            }
        }

        if !definition.source_blocked_tags.is_empty() || !definition.source_required_tags.is_empty() {
            if source_tags.has_any(&definition.source_blocked_tags) {
                blocked = true;
            }
            if !source_tags.has_all(&definition.source_required_tags) {
                missing = true;
            }
        }

        if blocked {
            out_tags.add_tag(tag(names::ABILITY_ACTIVATE_FAIL_TAGS_BLOCKED));
            return false;
        }
        if missing {
            out_tags.add_tag(tag(names::ABILITY_ACTIVATE_FAIL_TAGS_MISSING));
            return false;
        }
        true
    }

    pub fn cooldown_remaining(&self, definition_id: &str) -> f32 {
        self.cooldowns
            .iter()
            .find(|(id, _)| id == definition_id)
            .map(|(_, end)| (*end - self.world_time).max(0.0) as f32)
            .unwrap_or(0.0)
    }

    /// Apply cooldown and costs. Costs flagged `only_apply_cost_on_hit` are skipped unless
    /// `hit_target` is set (the firing pipeline passes whether the target data hit anything).
    pub fn commit_ability(
        &mut self,
        handle: AbilitySpecHandle,
        instance: InstanceId,
        env: &mut ActivationEnv<'_>,
        hit_target: bool,
    ) -> bool {
        let Some(spec) = self.find_spec(handle) else {
            return false;
        };
        let definition = spec.definition.clone();
        let level = spec.level;
        let item = spec.source.item;

        if definition.cooldown > 0.0 {
            let end = self.world_time + definition.cooldown as f64;
            self.cooldowns.retain(|(id, _)| id != &definition.id);
            self.cooldowns.push((definition.id.clone(), end));
        }

        if self.is_authority() {
            for cost in &definition.additional_costs {
                if cost.only_apply_cost_on_hit() && !hit_target {
                    continue;
                }
                match cost {
                    AbilityCost::ItemTagStack { quantity, tag: stack_tag, .. } => {
                        let count = quantity.value_at_level(level).trunc() as i32;
                        if let (Some(item), Some(items)) = (item, env.items.as_deref_mut()) {
                            items.remove_stat_tag_stack(item, stack_tag, count);
                        }
                    }
                }
            }
        }

        if let Some(inst) = self.find_spec_mut(handle).and_then(|s| s.instance_mut(instance)) {
            inst.committed = true;
        }
        true
    }

    /// End a running instance normally.
    pub fn end_ability(&mut self, handle: AbilitySpecHandle, instance: InstanceId) {
        self.internal_end(handle, instance, false, true);
    }

    /// End without consulting `can_be_canceled`.
    fn force_end(&mut self, handle: AbilitySpecHandle, instance: InstanceId, was_cancelled: bool) {
        self.internal_end(handle, instance, was_cancelled, false);
    }

    fn internal_end(&mut self, handle: AbilitySpecHandle, instance_id: InstanceId, was_cancelled: bool, replicate: bool) {
        let Some(index) = self.specs.iter().position(|s| s.handle == handle) else {
            return;
        };
        let definition = self.specs[index].definition.clone();
        let (group, behavior) = {
            let spec = &mut self.specs[index];
            let Some(instance) = spec.instance_mut(instance_id) else {
                return;
            };
            if !instance.active {
                return;
            }
            instance.active = false;
            instance.trigger_event = None;
            let group = instance.activation_group;
            instance.activation_group = definition.activation_group;
            let behavior = std::mem::take(&mut instance.behavior);
            spec.active_count = spec.active_count.saturating_sub(1);
            if definition.instancing_policy == InstancingPolicy::InstancedPerExecution {
                spec.instances.retain(|i| i.id != instance_id);
            }
            (group, behavior)
        };
        if let InstanceBehavior::Montage(task) = behavior {
            self.on_montage_task_destroyed(handle, instance_id, task, was_cancelled);
        }

        self.owned_tags.update_container(&definition.activation_owned_tags, -1);
        self.apply_ability_block_and_cancel_tags(&definition, handle, instance_id, false);
        self.remove_ability_from_activation_group(group, handle, instance_id);
        self.clear_animating_ability(handle, instance_id);

        if matches!(definition.kind, AbilityKind::Death { .. }) {
            self.end_death();
        }

        if replicate
            && definition.net_execution_policy == NetExecutionPolicy::LocalPredicted
            && self.role == NetRole::AutonomousProxy
        {
            self.notify(AbilityNotification::ReplicateEnd {
                definition_id: definition.id.clone(),
                was_cancelled,
            });
        }

        debug!("Ended ability {} instance {} (cancelled: {})", definition.id, instance_id, was_cancelled);
        self.notify(AbilityNotification::Ended {
            handle,
            instance: instance_id,
            was_cancelled,
        });
    }

    /// Cancel one running instance. Returns false if it cannot be canceled.
    pub fn cancel_ability_instance(&mut self, handle: AbilitySpecHandle, instance: InstanceId, replicate: bool) -> bool {
        let Some(spec) = self.find_spec(handle) else {
            return false;
        };
        let Some(inst) = spec.instance(instance) else {
            return false;
        };
        if !inst.active || !inst.can_be_canceled {
            return false;
        }
        let definition_id = spec.definition.id.clone();
        self.internal_end(handle, instance, true, false);
        if replicate {
            self.notify(AbilityNotification::ReplicateEnd {
                definition_id,
                was_cancelled: true,
            });
        }
        true
    }

    /// Cancel every running instance for which `should_cancel` returns true. Structural
    /// removals requested while iterating are deferred until the loop completes.
    pub fn cancel_abilities_by_predicate<F>(&mut self, should_cancel: F, replicate: bool)
    where
        F: Fn(&AbilityDefinition, AbilitySpecHandle, &AbilityInstance) -> bool,
    {
        self.scope_lock_count += 1;
        let mut targets = Vec::new();
        for spec in self.specs.iter().filter(|s| s.is_active() && !s.pending_remove) {
            for instance in spec.active_instances() {
                if should_cancel(&spec.definition, spec.handle, instance) {
                    targets.push((spec.handle, instance.id));
                }
            }
        }
        for (handle, instance) in targets {
            self.cancel_ability_instance(handle, instance, replicate);
        }
        self.scope_lock_count -= 1;
        self.flush_pending_removals();
    }

    /// Cancel abilities matching `with_tags` (any), skipping those matching `without_tags` and
    /// the `ignore` instance.
    pub fn cancel_abilities(
        &mut self,
        with_tags: Option<&GameplayTagContainer>,
        without_tags: Option<&GameplayTagContainer>,
        ignore: Option<(AbilitySpecHandle, InstanceId)>,
    ) {
        let with_tags = with_tags.cloned();
        let without_tags = without_tags.cloned();
        self.cancel_abilities_by_predicate(
            |def, handle, instance| {
                if ignore == Some((handle, instance.id)) {
                    return false;
                }
                let with_ok = with_tags.as_ref().map_or(true, |t| def.ability_tags.has_any(t));
                let without_ok = without_tags.as_ref().map_or(true, |t| !def.ability_tags.has_any(t));
                with_ok && without_ok
            },
            true,
        );
    }

    pub fn try_cancel_ability_by_id(&mut self, id: &str) -> bool {
        let Some(handle) = self.find_ability_spec_handle_for_id(id, None) else {
            return false;
        };
        let mut cancelled = false;
        let active: Vec<InstanceId> = self
            .find_spec(handle)
            .map(|s| s.active_instances().map(|i| i.id).collect())
            .unwrap_or_default();
        for instance in active {
            cancelled |= self.cancel_ability_instance(handle, instance, true);
        }
        cancelled
    }

    fn cancel_input_activated_abilities(&mut self, replicate: bool) {
        self.cancel_abilities_by_predicate(
            |def, _, _| {
                matches!(
                    def.activation_policy,
                    ActivationPolicy::OnInputTriggered | ActivationPolicy::WhileInputActive
                )
            },
            replicate,
        );
    }

    fn apply_ability_block_and_cancel_tags(
        &mut self,
        definition: &AbilityDefinition,
        handle: AbilitySpecHandle,
        instance: InstanceId,
        enable: bool,
    ) {
        let mut block = definition.block_abilities_with_tag.clone();
        let mut cancel = definition.cancel_abilities_with_tag.clone();
        if let Some(mapping) = &self.tag_relationship_mapping {
            mapping.get_ability_tags_to_block_and_cancel(&definition.ability_tags, &mut block, &mut cancel);
        }
        self.blocked_ability_tags.update_container(&block, if enable { 1 } else { -1 });
        if enable && !cancel.is_empty() {
            self.cancel_abilities(Some(&cancel), None, Some((handle, instance)));
        }
    }

    // ===== ACTIVATION GROUPS =====

    pub fn activation_group_count(&self, group: ActivationGroup) -> i32 {
        self.activation_group_counts[group.index()]
    }

    pub fn is_activation_group_blocked(&self, group: ActivationGroup) -> bool {
        match group {
            ActivationGroup::Independent => false,
            ActivationGroup::ExclusiveReplaceable | ActivationGroup::ExclusiveBlocking => {
                self.activation_group_counts[ActivationGroup::ExclusiveBlocking.index()] > 0
            }
        }
    }

    pub fn add_ability_to_activation_group(&mut self, group: ActivationGroup, handle: AbilitySpecHandle, instance: InstanceId) {
        self.activation_group_counts[group.index()] += 1;
        if group.is_exclusive() {
            self.cancel_activation_group_abilities(ActivationGroup::ExclusiveReplaceable, Some((handle, instance)), false);
        }
        let exclusive = self.activation_group_counts[ActivationGroup::ExclusiveReplaceable.index()]
            + self.activation_group_counts[ActivationGroup::ExclusiveBlocking.index()];
        if exclusive > 1 {
            error!(
                "add_ability_to_activation_group: Multiple exclusive abilities are running ({} active)",
                exclusive
            );
        }
    }

    pub fn remove_ability_from_activation_group(&mut self, group: ActivationGroup, _handle: AbilitySpecHandle, _instance: InstanceId) {
        let count = &mut self.activation_group_counts[group.index()];
        if *count <= 0 {
            error!("remove_ability_from_activation_group: no abilities in group {:?}", group);
            return;
        }
        *count -= 1;
    }

    pub fn cancel_activation_group_abilities(
        &mut self,
        group: ActivationGroup,
        ignore: Option<(AbilitySpecHandle, InstanceId)>,
        replicate: bool,
    ) {
        self.cancel_abilities_by_predicate(
            |_, handle, instance| instance.activation_group == group && ignore != Some((handle, instance.id)),
            replicate,
        );
    }

    pub fn can_change_activation_group(&self, handle: AbilitySpecHandle, instance: InstanceId, new_group: ActivationGroup) -> bool {
        self.check_change_activation_group(handle, instance, new_group).is_ok()
    }

    fn check_change_activation_group(
        &self,
        handle: AbilitySpecHandle,
        instance: InstanceId,
        new_group: ActivationGroup,
    ) -> Result<ActivationGroup, AbilityError> {
        let spec = self.find_spec(handle).ok_or(AbilityError::InvalidHandle)?;
        if !spec.definition.instancing_policy.is_instanced() {
            return Err(AbilityError::NotInstanced);
        }
        let inst = spec.instance(instance).ok_or(AbilityError::InvalidHandle)?;
        if !inst.active {
            return Err(AbilityError::NotActive);
        }
        let current = inst.activation_group;
        if current == new_group {
            return Ok(current);
        }
        if current != ActivationGroup::ExclusiveBlocking && self.is_activation_group_blocked(new_group) {
            return Err(AbilityError::GroupBlocked);
        }
        if new_group == ActivationGroup::ExclusiveReplaceable && !inst.can_be_canceled {
            return Err(AbilityError::ReplaceableMustBeCancelable);
        }
        Ok(current)
    }

    pub fn change_activation_group(
        &mut self,
        handle: AbilitySpecHandle,
        instance: InstanceId,
        new_group: ActivationGroup,
    ) -> Result<(), AbilityError> {
        let current = self.check_change_activation_group(handle, instance, new_group).map_err(|e| {
            if e == AbilityError::NotInstanced {
                error!("change_activation_group cannot be called on a non-instanced ability");
            }
            e
        })?;
        if current != new_group {
            self.remove_ability_from_activation_group(current, handle, instance);
            if let Some(inst) = self.find_spec_mut(handle).and_then(|s| s.instance_mut(instance)) {
                inst.activation_group = new_group;
            }
            self.add_ability_to_activation_group(new_group, handle, instance);
        }
        Ok(())
    }

    pub fn set_can_be_canceled(&mut self, handle: AbilitySpecHandle, instance: InstanceId, can_be_canceled: bool) -> Result<(), AbilityError> {
        let inst = self
            .find_spec_mut(handle)
            .and_then(|s| s.instance_mut(instance))
            .ok_or(AbilityError::InvalidHandle)?;
        if !can_be_canceled && inst.activation_group == ActivationGroup::ExclusiveReplaceable {
            error!("set_can_be_canceled: ability can not block canceling because its activation group is replaceable");
            return Err(AbilityError::ReplaceableMustBeCancelable);
        }
        inst.can_be_canceled = can_be_canceled;
        Ok(())
    }

    // ===== INPUT =====

    pub fn ability_input_tag_pressed(&mut self, input_tag: &GameplayTag) {
        let handles = self.handles_for_input_tag(input_tag, |_| true);
        self.press_handles(handles);
    }

    pub fn ability_input_tag_released(&mut self, input_tag: &GameplayTag) {
        let handles = self.handles_for_input_tag(input_tag, |_| true);
        self.release_handles(handles);
    }

    /// Input tag forwarded by the owning client. Only abilities the server executes itself
    /// respond; predicted ones arrive through `server_try_activate_ability`.
    pub fn server_ability_input_tag(&mut self, input_tag: &GameplayTag, pressed: bool) {
        let handles =
            self.handles_for_input_tag(input_tag, |def| def.net_execution_policy.is_server_execution());
        if pressed {
            self.press_handles(handles);
        } else {
            self.release_handles(handles);
        }
    }

    fn handles_for_input_tag(
        &self,
        input_tag: &GameplayTag,
        filter: impl Fn(&AbilityDefinition) -> bool,
    ) -> Vec<AbilitySpecHandle> {
        if !input_tag.is_valid() {
            return Vec::new();
        }
        self.specs
            .iter()
            .filter(|s| !s.pending_remove && s.dynamic_source_tags.has_tag_exact(input_tag))
            .filter(|s| filter(&s.definition))
            .map(|s| s.handle)
            .collect()
    }

    fn press_handles(&mut self, handles: Vec<AbilitySpecHandle>) {
        for handle in handles {
            if self.pressed_waiting_release.contains(&handle) {
                continue;
            }
            push_unique(&mut self.input_pressed, handle);
            push_unique(&mut self.input_held, handle);
        }
    }

    fn release_handles(&mut self, handles: Vec<AbilitySpecHandle>) {
        for handle in handles {
            push_unique(&mut self.input_released, handle);
            self.input_held.retain(|h| *h != handle);
            self.pressed_waiting_release.retain(|h| *h != handle);
        }
    }

    pub fn input_held(&self) -> &[AbilitySpecHandle] {
        &self.input_held
    }

    /// Run one tick of input arbitration: held, then pressed, then released.
    pub fn process_ability_input(&mut self, game_paused: bool, env: &mut ActivationEnv<'_>) {
        if self.has_matching_gameplay_tag(&tag(names::ABILITY_INPUT_BLOCKED)) {
            self.clear_ability_input();
            return;
        }
        let mut to_activate: Vec<AbilitySpecHandle> = Vec::new();

        // Paused: nothing new starts, but releases still reach running abilities.
        let held = if game_paused { Vec::new() } else { self.input_held.clone() };
        let pressed = if game_paused { Vec::new() } else { self.input_pressed.clone() };

        for handle in held {
            if let Some(spec) = self.find_spec(handle) {
                if !spec.is_active() && spec.definition.activation_policy == ActivationPolicy::WhileInputActive {
                    push_unique(&mut to_activate, handle);
                }
            }
        }

        for handle in pressed {
            let Some(spec) = self.find_spec_mut(handle) else {
                continue;
            };
            spec.input_pressed = true;
            let active = spec.is_active();
            let policy = spec.definition.activation_policy;
            if active {
                self.ability_spec_input_pressed(handle);
            } else if policy == ActivationPolicy::OnInputTriggered {
                push_unique(&mut to_activate, handle);
            }
            push_unique(&mut self.pressed_waiting_release, handle);
        }

        // Released in the same tick as pressed: the press must not linger as a wait marker
        for handle in &self.input_released {
            if !self.input_held.contains(handle) {
                self.pressed_waiting_release.retain(|h| h != handle);
            }
        }

        for handle in to_activate {
            let _ = self.try_activate_ability(handle, env);
        }

        for handle in self.input_released.clone() {
            let Some(spec) = self.find_spec_mut(handle) else {
                continue;
            };
            spec.input_pressed = false;
            if spec.is_active() {
                self.ability_spec_input_released(handle);
            }
        }

        self.input_pressed.clear();
        self.input_released.clear();
    }

    pub fn clear_ability_input(&mut self) {
        self.input_pressed.clear();
        self.input_released.clear();
        self.input_held.clear();
        self.pressed_waiting_release.clear();
    }

    /// Deliver "input pressed" to the running ability. Reads the most recent instance.
    fn ability_spec_input_pressed(&mut self, handle: AbilitySpecHandle) {
        let Some(spec) = self.find_spec(handle) else {
            return;
        };
        let Some(instance) = spec.instances.last().map(|i| i.id) else {
            error!("ability_spec_input_pressed: active ability {} has no instances", spec.definition.id);
            return;
        };
        let replicate = spec.definition.net_execution_policy == NetExecutionPolicy::LocalPredicted
            && self.role == NetRole::AutonomousProxy;
        let definition_id = spec.definition.id.clone();
        self.notify(AbilityNotification::InputPressed { handle, instance });
        if replicate {
            self.notify(AbilityNotification::ServerInputEvent {
                definition_id,
                pressed: true,
            });
        }
    }

    fn ability_spec_input_released(&mut self, handle: AbilitySpecHandle) {
        let Some(spec) = self.find_spec(handle) else {
            return;
        };
        let Some(instance) = spec.instances.last().map(|i| i.id) else {
            return;
        };
        let replicate = spec.definition.net_execution_policy == NetExecutionPolicy::LocalPredicted
            && self.role == NetRole::AutonomousProxy;
        let definition_id = spec.definition.id.clone();
        let ends_on_release = spec.definition.kind.ends_on_release();
        self.notify(AbilityNotification::InputReleased { handle, instance });
        if replicate {
            self.notify(AbilityNotification::ServerInputEvent {
                definition_id,
                pressed: false,
            });
        }
        if ends_on_release {
            self.end_ability(handle, instance);
        }
    }

    /// Server side of a replicated generic input event.
    pub fn invoke_replicated_input_event(&mut self, handle: AbilitySpecHandle, pressed: bool) {
        let Some(spec) = self.find_spec(handle) else {
            return;
        };
        if !spec.is_active() {
            return;
        }
        let Some(instance) = spec.instances.last().map(|i| i.id) else {
            return;
        };
        let ends_on_release = !pressed && spec.definition.kind.ends_on_release();
        self.notify(if pressed {
            AbilityNotification::InputPressed { handle, instance }
        } else {
            AbilityNotification::InputReleased { handle, instance }
        });
        if ends_on_release {
            self.end_ability(handle, instance);
        }
    }

    // ===== EVENTS =====

    /// Trigger abilities whose trigger tag matches `event_tag` (or a parent of it) and
    /// forward the event to running tasks. Returns how many abilities activated.
    pub fn handle_gameplay_event(&mut self, event_tag: &GameplayTag, mut data: GameplayEventData, env: &mut ActivationEnv<'_>) -> usize {
        data.event_tag = event_tag.clone();

        for spec in self.specs.iter_mut() {
            for instance in spec.instances.iter_mut().filter(|i| i.active) {
                if let InstanceBehavior::Montage(task) = &mut instance.behavior {
                    task.on_gameplay_event(event_tag, &data);
                }
            }
        }

        let triggered: Vec<AbilitySpecHandle> = self
            .specs
            .iter()
            .filter(|s| !s.pending_remove)
            .filter(|s| s.definition.trigger_tags.iter().any(|t| event_tag.matches_tag(t)))
            .filter(|s| self.role_allows(s.definition.net_execution_policy))
            .map(|s| s.handle)
            .collect();

        let mut activated = 0;
        for handle in triggered {
            if self.try_activate_ability_with_event(handle, data.clone(), env).is_ok() {
                activated += 1;
            }
        }
        activated
    }

    pub fn try_activate_abilities_on_spawn(&mut self, env: &mut ActivationEnv<'_>) {
        let handles: Vec<AbilitySpecHandle> = self.specs.iter().map(|s| s.handle).collect();
        for handle in handles {
            self.try_activate_ability_on_spawn(handle, env);
        }
    }

    fn try_activate_ability_on_spawn(&mut self, handle: AbilitySpecHandle, env: &mut ActivationEnv<'_>) {
        let Some(spec) = self.find_spec(handle) else {
            return;
        };
        if spec.is_active() || spec.definition.activation_policy != ActivationPolicy::OnSpawn {
            return;
        }
        let Some(avatar) = self.avatar else {
            return;
        };
        if avatar.torn_off || avatar.life_span > 0.0 {
            return;
        }
        let policy = spec.definition.net_execution_policy;
        let client_should_activate = self.locally_controlled && policy.is_local_execution();
        let server_should_activate = self.is_authority() && policy.is_server_execution();
        if client_should_activate || server_should_activate {
            let _ = self.try_activate_ability(handle, env);
        }
    }

    // ===== FAILURE =====

    fn notify_ability_failed(&mut self, handle: AbilitySpecHandle, failure: &GameplayTagContainer) {
        let Some(spec) = self.find_spec(handle) else {
            return;
        };
        let definition = spec.definition.clone();
        if self.is_authority() && !self.locally_controlled && definition.supports_network_failure() {
            self.notify(AbilityNotification::ClientAbilityFailed {
                definition_id: definition.id.clone(),
                failure_tags: failure.clone(),
            });
        } else {
            self.on_ability_failed_to_activate(&definition, failure);
        }
    }

    /// Client side of the failure RPC.
    pub fn client_ability_failed(&mut self, definition_id: &str, failure: &GameplayTagContainer) {
        let Some(definition) = self
            .specs
            .iter()
            .find(|s| s.definition.id == definition_id)
            .map(|s| s.definition.clone())
        else {
            warn!("client_ability_failed: unknown ability {}", definition_id);
            return;
        };
        self.on_ability_failed_to_activate(&definition, failure);
    }

    /// Map the first failure tag with a user-facing message and broadcast it.
    fn on_ability_failed_to_activate(&self, definition: &AbilityDefinition, failure: &GameplayTagContainer) {
        let Some(text) = failure
            .iter()
            .find_map(|reason| definition.failure_tag_to_user_facing_messages.get(reason))
        else {
            return;
        };
        let message = AbilitySimpleFailureMessage {
            player_controller: self.player_id,
            failure_tags: failure.clone(),
            user_facing_reason: text.clone(),
        };
        if let Some(bus) = &self.bus {
            bus.broadcast_message(&tag(names::ABILITY_INTERACTION_UPDATE_INTERACTIONS), &message);
        }
    }

    // ===== PREDICTION =====

    /// Server rejected a predicted activation: end the predicted instance and fade montages.
    pub fn on_prediction_key_rejected(&mut self, key: PredictionKey) -> Vec<(String, String)> {
        let running: Vec<(AbilitySpecHandle, InstanceId)> = self
            .specs
            .iter()
            .flat_map(|s| s.active_instances().filter(|i| i.prediction_key == key).map(move |i| (s.handle, i.id)))
            .collect();
        for (handle, instance) in running {
            self.force_end(handle, instance, true);
        }
        let rejected: Vec<PredictedMontage> = self
            .predicted_montages
            .iter()
            .filter(|p| p.prediction_key == key)
            .cloned()
            .collect();
        self.predicted_montages.retain(|p| p.prediction_key != key);
        rejected.into_iter().map(|p| (p.mesh, p.montage_id)).collect()
    }

    pub fn on_prediction_key_accepted(&mut self, key: PredictionKey) {
        self.predicted_montages.retain(|p| p.prediction_key != key);
    }

    // ===== ATTRIBUTES =====

    /// Add an attribute set; if one of that class exists it is returned instead.
    pub fn add_attribute_set(&mut self, class: AttributeSetClass) -> &AttributeSet {
        if let Some(index) = self.attribute_sets.iter().position(|s| s.class() == class) {
            warn!("add_attribute_set: attribute set {:?} already exists, returning existing instance", class);
            return &self.attribute_sets[index];
        }
        self.attribute_sets.push(class.instantiate());
        debug!("Added attribute set {:?}", class);
        let last = self.attribute_sets.len() - 1;
        &self.attribute_sets[last]
    }

    pub fn remove_attribute_set(&mut self, class: AttributeSetClass) -> bool {
        let before = self.attribute_sets.len();
        self.attribute_sets.retain(|s| s.class() != class);
        before != self.attribute_sets.len()
    }

    pub fn attribute_set(&self, class: AttributeSetClass) -> Option<&AttributeSet> {
        self.attribute_sets.iter().find(|s| s.class() == class)
    }

    pub fn attribute_set_mut(&mut self, class: AttributeSetClass) -> Option<&mut AttributeSet> {
        self.attribute_sets.iter_mut().find(|s| s.class() == class)
    }

    pub fn attribute_sets(&self) -> &[AttributeSet] {
        &self.attribute_sets
    }

    pub fn get_numeric_attribute(&self, attribute: GameplayAttribute) -> Option<f32> {
        self.attribute_set(attribute.set_class())
            .and_then(|s| s.get(attribute))
            .map(|d| d.current)
    }

    pub fn set_numeric_attribute_base(&mut self, attribute: GameplayAttribute, value: f32) {
        let current = self.compute_current(attribute, value);
        if let Some(set) = self.attribute_set_mut(attribute.set_class()) {
            set.set_base_and_current(attribute, value, current);
        }
    }

    fn compute_current(&self, attribute: GameplayAttribute, base: f32) -> f32 {
        let mods = self.active_effects.iter().flat_map(|e| {
            let level = e.level;
            e.effect
                .modifiers
                .iter()
                .filter(move |m| m.attribute == attribute)
                .map(move |m| (m.op, m.magnitude.value_at_level(level)))
        });
        aggregate(base, mods)
    }

    fn refresh_attribute(&mut self, attribute: GameplayAttribute) {
        let Some(base) = self
            .attribute_set(attribute.set_class())
            .and_then(|s| s.get(attribute))
            .map(|d| d.base)
        else {
            return;
        };
        let current = self.compute_current(attribute, base);
        if let Some(set) = self.attribute_set_mut(attribute.set_class()) {
            set.set_base_and_current(attribute, base, current);
        }
    }

    // ===== EFFECTS =====

    /// Apply an effect to this component. Authority only. Instant effects return an invalid
    /// handle.
    pub fn apply_gameplay_effect_to_self(
        &mut self,
        effect: Arc<GameplayEffect>,
        level: i32,
        context: EffectContext,
    ) -> ActiveGameplayEffectHandle {
        if !self.is_authority() {
            warn!("apply_gameplay_effect_to_self called without authority ({})", effect.id);
            return ActiveGameplayEffectHandle::default();
        }
        match effect.duration {
            EffectDuration::Instant => {
                self.execute_instant_effect(&effect, level, &context);
                ActiveGameplayEffectHandle::default()
            }
            EffectDuration::Infinite | EffectDuration::HasDuration(_) => {
                let handle = ActiveGameplayEffectHandle(self.next_effect_handle);
                self.next_effect_handle += 1;
                let remaining = match effect.duration {
                    EffectDuration::HasDuration(secs) => Some(secs),
                    _ => None,
                };
                self.owned_tags.update_container(&effect.granted_tags, 1);
                let attributes: Vec<GameplayAttribute> = effect.modifiers.iter().map(|m| m.attribute).collect();
                self.active_effects.push(ActiveGameplayEffect {
                    handle,
                    effect,
                    level,
                    context,
                    remaining,
                });
                for attribute in attributes {
                    self.refresh_attribute(attribute);
                }
                handle
            }
        }
    }

    fn execute_instant_effect(&mut self, effect: &GameplayEffect, level: i32, context: &EffectContext) {
        let target_tags = self.owned_tags().clone();
        for modifier in &effect.modifiers {
            let mut data = EffectModCallbackData {
                attribute: modifier.attribute,
                magnitude: modifier.magnitude.value_at_level(level),
                instigator: context.instigator,
                causer: context.causer,
                effect_tags: effect.asset_tags.clone(),
                target_tags: target_tags.clone(),
            };
            let class = modifier.attribute.set_class();
            let Some(set) = self.attribute_set_mut(class) else {
                warn!("Effect {} modifies {:?} but no {:?} set is present", effect.id, modifier.attribute, class);
                continue;
            };
            if !set.pre_gameplay_effect_execute(&mut data) {
                continue;
            }
            let base = set.get(modifier.attribute).map(|d| d.base).unwrap_or(0.0);
            let new_base = match modifier.op {
                ModifierOp::Add => base + data.magnitude,
                ModifierOp::Multiply => base * data.magnitude,
                ModifierOp::Override => data.magnitude,
            };
            let current = self.compute_current(modifier.attribute, new_base);
            let events = match self.attribute_set_mut(class) {
                Some(set) => {
                    set.set_base_and_current(modifier.attribute, new_base, current);
                    set.post_gameplay_effect_execute(&data)
                }
                None => Vec::new(),
            };
            for event in events {
                self.broadcast_attribute_event(&event);
                self.notify(AbilityNotification::Attribute(event));
            }
        }
    }

    fn broadcast_attribute_event(&self, event: &AttributeEvent) {
        let (Some(bus), AttributeEvent::Damaged { instigator, magnitude }) = (&self.bus, event) else {
            return;
        };
        bus.broadcast_message(
            &tag(names::DAMAGE_MESSAGE),
            &GameVerbMessage {
                verb: tag(names::DAMAGE_MESSAGE),
                instigator: *instigator,
                target: self.avatar.map(|a| a.id),
                magnitude: *magnitude,
            },
        );
    }

    pub fn remove_active_gameplay_effect(&mut self, handle: ActiveGameplayEffectHandle) -> bool {
        let Some(index) = self.active_effects.iter().position(|e| e.handle == handle) else {
            return false;
        };
        let removed = self.active_effects.remove(index);
        self.owned_tags.update_container(&removed.effect.granted_tags, -1);
        for modifier in &removed.effect.modifiers {
            self.refresh_attribute(modifier.attribute);
        }
        true
    }

    pub fn active_effects(&self) -> &[ActiveGameplayEffect] {
        &self.active_effects
    }

    /// Advance time: cooldowns and duration effects.
    pub fn tick(&mut self, dt: f32) {
        self.world_time += dt as f64;
        let now = self.world_time;
        self.cooldowns.retain(|(_, end)| *end > now);

        let mut expired = Vec::new();
        for effect in self.active_effects.iter_mut() {
            if let Some(remaining) = effect.remaining.as_mut() {
                *remaining -= dt;
                if *remaining <= 0.0 {
                    expired.push(effect.handle);
                }
            }
        }
        for handle in expired {
            self.remove_active_gameplay_effect(handle);
        }
    }

    // ===== DEATH =====

    pub(crate) fn set_death_blocks_activation(&mut self, value: bool) {
        self.death_blocks_activation = value;
    }

    pub fn is_death_blocking_activation(&self) -> bool {
        self.death_blocks_activation
    }
}

/// Payload broadcast when an activation failure maps to a user-facing message.
#[derive(Clone, Debug, PartialEq)]
pub struct AbilitySimpleFailureMessage {
    pub player_controller: Option<u64>,
    pub failure_tags: GameplayTagContainer,
    pub user_facing_reason: String,
}

fn push_unique<T: PartialEq>(list: &mut Vec<T>, value: T) {
    if !list.contains(&value) {
        list.push(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ability::definition::{ActivationGroup, ActivationPolicy};
    use crate::message_bus::MessageMatch;
    use crate::tags::tag_container;

    fn def(id: &str) -> AbilityDefinition {
        AbilityDefinition::new(id)
    }

    fn grant(asc: &mut AbilitySystemComponent, definition: AbilityDefinition, input: Option<&str>) -> AbilitySpecHandle {
        let mut spec = AbilitySpec::new(Arc::new(definition), 1);
        if let Some(input) = input {
            spec = spec.with_input_tag(tag(input));
        }
        asc.grant_ability(spec, &mut ActivationEnv::none())
    }

    #[test]
    fn test_activation_groups_scenario() {
        let mut asc = AbilitySystemComponent::default();
        let a = grant(&mut asc, def("A").with_group(ActivationGroup::ExclusiveBlocking), None);
        let b = grant(&mut asc, def("B").with_group(ActivationGroup::ExclusiveReplaceable), None);
        let env = &mut ActivationEnv::none();

        assert!(asc.try_activate_ability(b, env).is_ok());
        assert_eq!(asc.activation_group_count(ActivationGroup::ExclusiveReplaceable), 1);

        assert!(asc.try_activate_ability(a, env).is_ok());
        assert_eq!(asc.activation_group_count(ActivationGroup::ExclusiveReplaceable), 0);
        assert_eq!(asc.activation_group_count(ActivationGroup::ExclusiveBlocking), 1);
        assert!(!asc.find_spec(b).unwrap().is_active());

        let reasons = asc.try_activate_ability(b, env).unwrap_err();
        assert!(reasons.has_tag(&tag(names::ABILITY_ACTIVATE_FAIL_ACTIVATION_GROUP)));
    }

    #[test]
    fn test_press_and_release_same_tick_activates_once() {
        let mut asc = AbilitySystemComponent::default();
        let h = grant(&mut asc, def("Jump"), Some("InputTag.Jump"));
        asc.ability_input_tag_pressed(&tag("InputTag.Jump"));
        asc.ability_input_tag_released(&tag("InputTag.Jump"));
        asc.process_ability_input(false, &mut ActivationEnv::none());

        assert!(asc.input_held().is_empty());
        let activations = asc
            .drain_notifications()
            .into_iter()
            .filter(|n| matches!(n, AbilityNotification::Activated { .. }))
            .count();
        assert_eq!(activations, 1);
        assert!(asc.find_spec(h).unwrap().is_active());

        // Next press is honoured again after the release
        asc.end_ability(h, asc.find_spec(h).unwrap().instances[0].id);
        asc.ability_input_tag_pressed(&tag("InputTag.Jump"));
        asc.process_ability_input(false, &mut ActivationEnv::none());
        assert!(asc.find_spec(h).unwrap().is_active());
    }

    #[test]
    fn test_while_input_active_reactivates_while_held() {
        let mut asc = AbilitySystemComponent::default();
        let h = grant(
            &mut asc,
            def("Fire").with_policy(ActivationPolicy::WhileInputActive),
            Some("InputTag.Weapon.Fire"),
        );
        let env = &mut ActivationEnv::none();
        asc.ability_input_tag_pressed(&tag("InputTag.Weapon.Fire"));
        asc.process_ability_input(false, env);
        let instance = asc.find_spec(h).unwrap().instances[0].id;
        asc.end_ability(h, instance);
        asc.process_ability_input(false, env);
        assert!(asc.find_spec(h).unwrap().is_active());
    }

    #[test]
    fn test_input_blocked_clears_lists() {
        let mut asc = AbilitySystemComponent::default();
        let h = grant(&mut asc, def("Jump"), Some("InputTag.Jump"));
        asc.add_loose_gameplay_tag(&tag(names::ABILITY_INPUT_BLOCKED), 1);
        asc.ability_input_tag_pressed(&tag("InputTag.Jump"));
        asc.process_ability_input(false, &mut ActivationEnv::none());
        assert!(!asc.find_spec(h).unwrap().is_active());
        assert!(asc.input_held().is_empty());
    }

    #[test]
    fn test_pressed_delivered_to_active_ability() {
        let mut asc = AbilitySystemComponent::default();
        let h = grant(&mut asc, def("Hold"), Some("InputTag.Hold"));
        let env = &mut ActivationEnv::none();
        asc.try_activate_ability(h, env).unwrap();
        asc.drain_notifications();
        asc.ability_input_tag_pressed(&tag("InputTag.Hold"));
        asc.ability_input_tag_released(&tag("InputTag.Hold"));
        asc.process_ability_input(false, env);
        let n = asc.drain_notifications();
        assert!(n.iter().any(|n| matches!(n, AbilityNotification::InputPressed { .. })));
        assert!(n.iter().any(|n| matches!(n, AbilityNotification::InputReleased { .. })));
    }

    #[test]
    fn test_blocked_tags_and_is_dead() {
        let mut asc = AbilitySystemComponent::default();
        let mut d = def("Sprint");
        d.activation_blocked_tags = tag_container(&[names::STATUS_DEATH]);
        let h = grant(&mut asc, d, None);
        asc.add_loose_gameplay_tag(&tag(names::STATUS_DEATH_DYING), 1);
        let reasons = asc.try_activate_ability(h, &mut ActivationEnv::none()).unwrap_err();
        assert!(reasons.has_tag(&tag(names::ABILITY_ACTIVATE_FAIL_TAGS_BLOCKED)));
        assert!(reasons.has_tag(&tag(names::ABILITY_ACTIVATE_FAIL_IS_DEAD)));
    }

    #[test]
    fn test_block_and_cancel_tags() {
        let mut asc = AbilitySystemComponent::default();
        let reload = grant(
            &mut asc,
            def("Reload").with_ability_tags(tag_container(&["Ability.Type.Action.Reload"])),
            None,
        );
        let mut sprint = def("Sprint");
        sprint.cancel_abilities_with_tag = tag_container(&["Ability.Type.Action.Reload"]);
        sprint.block_abilities_with_tag = tag_container(&["Ability.Type.Action.Reload"]);
        let sprint = grant(&mut asc, sprint, None);
        let env = &mut ActivationEnv::none();

        asc.try_activate_ability(reload, env).unwrap();
        asc.try_activate_ability(sprint, env).unwrap();
        assert!(!asc.find_spec(reload).unwrap().is_active());
        let reasons = asc.try_activate_ability(reload, env).unwrap_err();
        assert!(reasons.has_tag(&tag(names::ABILITY_ACTIVATE_FAIL_TAGS_BLOCKED)));
    }

    #[test]
    fn test_change_activation_group_rules() {
        let mut asc = AbilitySystemComponent::default();
        let h = grant(&mut asc, def("Emote"), None);
        let env = &mut ActivationEnv::none();
        let inst = asc.try_activate_ability(h, env).unwrap();
        asc.set_can_be_canceled(h, inst, false).unwrap();
        assert_eq!(
            asc.change_activation_group(h, inst, ActivationGroup::ExclusiveReplaceable),
            Err(AbilityError::ReplaceableMustBeCancelable)
        );
        asc.change_activation_group(h, inst, ActivationGroup::ExclusiveBlocking).unwrap();
        assert_eq!(asc.activation_group_count(ActivationGroup::Independent), 0);
        assert_eq!(asc.activation_group_count(ActivationGroup::ExclusiveBlocking), 1);
        asc.end_ability(h, inst);
        assert_eq!(asc.activation_group_count(ActivationGroup::ExclusiveBlocking), 0);
    }

    #[test]
    fn test_replaceable_cannot_refuse_cancel() {
        let mut asc = AbilitySystemComponent::default();
        let h = grant(&mut asc, def("Aim").with_group(ActivationGroup::ExclusiveReplaceable), None);
        let inst = asc.try_activate_ability(h, &mut ActivationEnv::none()).unwrap();
        assert!(asc.set_can_be_canceled(h, inst, false).is_err());
    }

    #[test]
    fn test_on_spawn_activates_once_with_avatar() {
        let mut asc = AbilitySystemComponent::default();
        let d = def("Passive")
            .with_policy(ActivationPolicy::OnSpawn)
            .with_net_execution(NetExecutionPolicy::ServerInitiated);
        let h = grant(&mut asc, d, None);
        assert!(!asc.find_spec(h).unwrap().is_active());

        let env = &mut ActivationEnv::none();
        asc.set_avatar(AvatarInfo::new(9), env);
        asc.set_avatar(AvatarInfo::new(9), env);
        let activations = asc
            .drain_notifications()
            .into_iter()
            .filter(|n| matches!(n, AbilityNotification::Activated { .. }))
            .count();
        assert_eq!(activations, 1);
    }

    #[test]
    fn test_on_spawn_skips_expiring_avatar() {
        let mut asc = AbilitySystemComponent::default();
        let d = def("Passive")
            .with_policy(ActivationPolicy::OnSpawn)
            .with_net_execution(NetExecutionPolicy::ServerOnly);
        let h = grant(&mut asc, d, None);
        asc.set_avatar(
            AvatarInfo {
                id: 1,
                torn_off: false,
                life_span: 3.0,
            },
            &mut ActivationEnv::none(),
        );
        assert!(!asc.find_spec(h).unwrap().is_active());
    }

    #[test]
    fn test_failure_message_broadcast() {
        let bus = GameplayMessageBus::new();
        let (_, inbox) = bus.register_inbox::<AbilitySimpleFailureMessage>(
            tag(names::ABILITY_INTERACTION_UPDATE_INTERACTIONS),
            MessageMatch::ExactMatch,
        );
        let mut asc = AbilitySystemComponent::default().with_bus(bus).with_player_id(4);
        let a = grant(&mut asc, def("A").with_group(ActivationGroup::ExclusiveBlocking), None);
        let b = grant(
            &mut asc,
            def("B")
                .with_group(ActivationGroup::ExclusiveReplaceable)
                .with_failure_message(tag(names::ABILITY_ACTIVATE_FAIL_ACTIVATION_GROUP), "Busy"),
            None,
        );
        let env = &mut ActivationEnv::none();
        asc.try_activate_ability(a, env).unwrap();
        assert!(asc.try_activate_ability(b, env).is_err());
        let got = inbox.drain();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].1.user_facing_reason, "Busy");
        assert_eq!(got[0].1.player_controller, Some(4));
    }

    #[test]
    fn test_server_forwards_failure_for_remote_client() {
        let mut asc = AbilitySystemComponent::new(NetRole::Authority, false);
        let a = grant(&mut asc, def("A").with_group(ActivationGroup::ExclusiveBlocking), None);
        let b = grant(&mut asc, def("B").with_group(ActivationGroup::ExclusiveBlocking), None);
        let env = &mut ActivationEnv::none();
        asc.try_activate_ability(a, env).unwrap();
        let _ = asc.server_try_activate_ability(b, PredictionKey(5), env);
        let n = asc.drain_notifications();
        assert!(n.iter().any(|n| matches!(n, AbilityNotification::ClientAbilityFailed { definition_id, .. } if definition_id == "B")));
        assert!(n.contains(&AbilityNotification::ClientPredictionRejected {
            prediction_key: PredictionKey(5)
        }));
    }

    #[test]
    fn test_server_input_tag_skips_predicted_abilities() {
        let mut asc = AbilitySystemComponent::new(NetRole::Authority, false);
        let predicted = grant(&mut asc, def("Predicted"), Some("InputTag.Shared"));
        let server = grant(
            &mut asc,
            def("Server").with_net_execution(NetExecutionPolicy::ServerInitiated),
            Some("InputTag.Shared"),
        );
        asc.server_ability_input_tag(&tag("InputTag.Shared"), true);
        asc.process_ability_input(false, &mut ActivationEnv::none());
        assert!(!asc.find_spec(predicted).unwrap().is_active());
        assert!(asc.find_spec(server).unwrap().is_active());
    }

    #[test]
    fn test_autonomous_proxy_predicts_and_cannot_run_server_only() {
        let mut asc = AbilitySystemComponent::new(NetRole::AutonomousProxy, true);
        // Clients mirror specs the server granted
        asc.mirror_granted_spec(AbilitySpec::new(Arc::new(def("Predicted")), 1), AbilitySpecHandle(3));
        asc.mirror_granted_spec(
            AbilitySpec::new(Arc::new(def("ServerOnly").with_net_execution(NetExecutionPolicy::ServerOnly)), 1),
            AbilitySpecHandle(4),
        );
        let env = &mut ActivationEnv::none();
        assert!(asc.try_activate_ability(AbilitySpecHandle(3), env).is_ok());
        let n = asc.drain_notifications();
        assert!(n.iter().any(|n| matches!(n, AbilityNotification::ServerTryActivate { .. })));
        let reasons = asc.try_activate_ability(AbilitySpecHandle(4), env).unwrap_err();
        assert!(reasons.has_tag(&tag(names::ABILITY_ACTIVATE_FAIL_NETWORKING)));
    }

    #[test]
    fn test_gameplay_event_triggers_parent_match() {
        let mut asc = AbilitySystemComponent::default();
        let h = grant(&mut asc, def("OnHit").with_trigger(tag("GameplayEvent.Hit")), None);
        let n = asc.handle_gameplay_event(
            &tag("GameplayEvent.Hit.Head"),
            GameplayEventData::default(),
            &mut ActivationEnv::none(),
        );
        assert_eq!(n, 1);
        let spec = asc.find_spec(h).unwrap();
        assert_eq!(
            spec.instances[0].trigger_event.as_ref().map(|e| e.event_tag.clone()),
            Some(tag("GameplayEvent.Hit.Head"))
        );
    }

    #[test]
    fn test_cooldown_blocks_until_expired() {
        let mut asc = AbilitySystemComponent::default();
        let mut d = def("Dash").with_kind(AbilityKind::Instant);
        d.cooldown = 1.0;
        let h = grant(&mut asc, d, None);
        let env = &mut ActivationEnv::none();
        asc.try_activate_ability(h, env).unwrap();
        let reasons = asc.try_activate_ability(h, env).unwrap_err();
        assert!(reasons.has_tag(&tag(names::ABILITY_ACTIVATE_FAIL_COOLDOWN)));
        asc.tick(1.1);
        assert!(asc.try_activate_ability(h, env).is_ok());
    }

    #[test]
    fn test_duration_effect_grants_tags_and_expires() {
        let mut asc = AbilitySystemComponent::default();
        asc.add_attribute_set(AttributeSetClass::Movement);
        let effect = Arc::new(GameplayEffect {
            id: "GE_Slow".into(),
            duration: EffectDuration::HasDuration(2.0),
            modifiers: vec![crate::effects::EffectModifier {
                attribute: GameplayAttribute::MaxWalkSpeedMultiplier,
                op: ModifierOp::Multiply,
                magnitude: crate::ability::definition::ScalableFloat::new(0.5),
            }],
            granted_tags: tag_container(&["Status.Slowed"]),
            ..Default::default()
        });
        let handle = asc.apply_gameplay_effect_to_self(effect, 1, EffectContext::default());
        assert!(handle.is_valid());
        assert!(asc.has_matching_gameplay_tag(&tag("Status.Slowed")));
        assert_eq!(asc.get_numeric_attribute(GameplayAttribute::MaxWalkSpeedMultiplier), Some(0.5));
        asc.tick(2.5);
        assert!(!asc.has_matching_gameplay_tag(&tag("Status.Slowed")));
        assert_eq!(asc.get_numeric_attribute(GameplayAttribute::MaxWalkSpeedMultiplier), Some(1.0));
    }

    #[test]
    fn test_attribute_set_added_once() {
        let mut asc = AbilitySystemComponent::default();
        asc.add_attribute_set(AttributeSetClass::Health);
        asc.add_attribute_set(AttributeSetClass::Health);
        assert_eq!(asc.attribute_sets().len(), 1);
    }

    #[test]
    fn test_instant_damage_raises_out_of_health() {
        let mut asc = AbilitySystemComponent::default();
        asc.add_attribute_set(AttributeSetClass::Health);
        asc.apply_gameplay_effect_to_self(
            Arc::new(GameplayEffect::damage("GE_Damage", 150.0)),
            1,
            EffectContext {
                instigator: Some(2),
                ..Default::default()
            },
        );
        assert_eq!(asc.get_numeric_attribute(GameplayAttribute::Health), Some(0.0));
        let n = asc.drain_notifications();
        assert!(n.iter().any(|n| matches!(n, AbilityNotification::Attribute(AttributeEvent::OutOfHealth { instigator: Some(2), .. }))));
    }

    #[test]
    fn test_clear_ability_during_cancel_is_deferred() {
        let mut asc = AbilitySystemComponent::default();
        let h = grant(&mut asc, def("X"), None);
        let env = &mut ActivationEnv::none();
        asc.try_activate_ability(h, env).unwrap();
        asc.scope_lock_count += 1;
        asc.clear_ability(h);
        assert!(asc.find_spec(h).is_none());
        assert_eq!(asc.specs().len(), 1);
        asc.scope_lock_count -= 1;
        asc.flush_pending_removals();
        assert!(asc.specs().is_empty());
    }
}
