//! Installed attachments of one weapon
//!
//! Base slots come from the weapon's `WeaponAttachmentsConfig`; dynamic slots appear while an
//! attachment that provides them is installed and vanish, taking their own attachments with
//! them, when it is removed. Only the authority mutates the array. Receivers rebuild their
//! dynamic slots and stats from replicated snapshots, processing providers before dependents.

use bevy::prelude::*;
use std::sync::Arc;

use super::definition::{
    AttachmentDefinition, AttachmentInstance, AttachmentSlotDef, StatModifier, StatModifierOp, WeaponAttachmentsConfig,
};
use crate::data_registry::DataRegistry;
use crate::equipment::EquipmentInstanceId;
use crate::error::AttachmentError;
use crate::message_bus::GameplayMessageBus;
use crate::replication::FastArray;
use crate::tags::{names, tag, GameplayTag, GameplayTagContainer};
use crate::weapons::{HitScanWeaponInstance, WeaponStatsChangedMessage};

/// Tuning modifiers apply after every authored modifier.
const TUNING_MODIFIER_PRIORITY: i32 = 100;

/// Change notifications for tightly coupled listeners (weapon visuals).
#[derive(Clone, Debug, PartialEq)]
pub enum AttachmentEvent {
    Installed { slot_type: GameplayTag, attachment_id: String },
    Uninstalled { slot_type: GameplayTag, attachment_id: String },
    SlotAvailabilityChanged { slot_type: GameplayTag, available: bool },
    StatsRecalculated,
}

/// Broadcast on `Yc.Weapon.Message.AttachmentInstalled` / `...Uninstalled`.
#[derive(Clone, Debug, PartialEq)]
pub struct AttachmentChangedMessage {
    pub weapon: Option<EquipmentInstanceId>,
    pub owner: Option<u64>,
    pub slot_type: GameplayTag,
    pub attachment_id: String,
}

/// What attachment operations need besides the component itself.
pub struct AttachmentContext<'a> {
    pub registry: &'a DataRegistry<AttachmentDefinition>,
    /// Recalculated after every change.
    pub weapon: Option<&'a mut HitScanWeaponInstance>,
}

impl<'a> AttachmentContext<'a> {
    pub fn new(registry: &'a DataRegistry<AttachmentDefinition>) -> Self {
        Self { registry, weapon: None }
    }

    pub fn with_weapon(mut self, weapon: &'a mut HitScanWeaponInstance) -> Self {
        self.weapon = Some(weapon);
        self
    }
}

#[derive(Clone, Default)]
pub struct WeaponAttachmentComponent {
    authority: bool,
    weapon: Option<EquipmentInstanceId>,
    owner: Option<u64>,
    bus: Option<GameplayMessageBus>,

    config: Option<Arc<WeaponAttachmentsConfig>>,
    attachments: FastArray<AttachmentInstance>,
    dynamic_slots: Vec<AttachmentSlotDef>,
    initialized: bool,

    /// Snapshot received before `initialize`.
    pending_snapshot: Option<FastArray<AttachmentInstance>>,
    /// Replicated installs whose slot does not exist yet.
    deferred_adds: Vec<GameplayTag>,

    events: Vec<AttachmentEvent>,
}

impl std::fmt::Debug for WeaponAttachmentComponent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeaponAttachmentComponent")
            .field("authority", &self.authority)
            .field("weapon", &self.weapon)
            .field("installed", &self.installed_attachment_count())
            .field("dynamic_slots", &self.dynamic_slots.len())
            .finish()
    }
}

impl WeaponAttachmentComponent {
    pub fn new(authority: bool) -> Self {
        Self {
            authority,
            ..Default::default()
        }
    }

    pub fn with_weapon(mut self, weapon: EquipmentInstanceId, owner: Option<u64>) -> Self {
        self.weapon = Some(weapon);
        self.owner = owner;
        self
    }

    pub fn with_bus(mut self, bus: GameplayMessageBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn is_authority(&self) -> bool {
        self.authority
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Bind to the weapon's slot layout. The authority allocates the base slots and installs
    /// their defaults; a receiver processes any snapshot that arrived early.
    pub fn initialize(&mut self, config: Arc<WeaponAttachmentsConfig>, ctx: &mut AttachmentContext<'_>) {
        self.config = Some(config.clone());
        self.initialized = true;

        if !self.authority {
            debug!("Attachment component initialized on receiver, waiting for replication");
            if let Some(snapshot) = self.pending_snapshot.take() {
                self.apply_replicated(snapshot, ctx);
            } else {
                self.notify_stats_changed(ctx);
            }
            return;
        }

        self.attachments.clear();
        for slot in &config.slots {
            self.attachments.push(AttachmentInstance::empty(slot.slot_type.clone()));
        }
        for slot in &config.slots {
            let Some(default) = &slot.default_attachment else {
                continue;
            };
            if let Err(err) = self.internal_install(default, Some(slot.slot_type.clone()), ctx) {
                warn!(
                    "Failed to install default attachment '{}' in slot '{}': {}",
                    default, slot.slot_type, err
                );
            }
        }
    }

    // ===== INSTALL / UNINSTALL =====

    pub fn install_attachment(
        &mut self,
        attachment_id: &str,
        slot_type: Option<GameplayTag>,
        ctx: &mut AttachmentContext<'_>,
    ) -> Result<(), AttachmentError> {
        if !self.authority {
            warn!("install_attachment called without authority ({})", attachment_id);
            return Err(AttachmentError::NotAuthority);
        }
        self.internal_install(attachment_id, slot_type, ctx)
    }

    pub fn uninstall_attachment(&mut self, slot_type: &GameplayTag, ctx: &mut AttachmentContext<'_>) -> Result<(), AttachmentError> {
        if !self.authority {
            warn!("uninstall_attachment called without authority ({})", slot_type);
            return Err(AttachmentError::NotAuthority);
        }
        self.internal_uninstall(slot_type, false, ctx)
    }

    pub fn clear_all_attachments(&mut self, ctx: &mut AttachmentContext<'_>) {
        if !self.authority {
            warn!("clear_all_attachments: only the authority can clear attachments");
            return;
        }
        let slots: Vec<GameplayTag> = self
            .attachments
            .iter()
            .filter(|a| a.is_valid())
            .map(|a| a.slot_type.clone())
            .collect();
        for slot in slots {
            // Dependents may already be gone with their provider.
            if self.has_attachment_in_slot(&slot) {
                let _ = self.internal_uninstall(&slot, false, ctx);
            }
        }
    }

    /// Checks in order: slot exists, attachment limit, incompatibilities, prerequisites.
    pub fn can_install_attachment(
        &self,
        definition: &AttachmentDefinition,
        slot_type: Option<&GameplayTag>,
    ) -> Result<(), AttachmentError> {
        if !self.initialized || self.config.is_none() {
            return Err(AttachmentError::SlotUnavailable(definition.slot_type.clone()));
        }
        let target = slot_type.unwrap_or(&definition.slot_type);
        if !self.is_slot_available(target) {
            return Err(AttachmentError::SlotUnavailable(target.clone()));
        }

        let max = self.config.as_ref().map(|c| c.max_attachments).unwrap_or(0);
        if max > 0 && !self.has_attachment_in_slot(target) && self.installed_attachment_count() >= max {
            return Err(AttachmentError::MaxAttachmentsReached(max));
        }

        let installed = self.installed_attachment_ids();
        if let Some(conflict) = installed.iter().find(|id| definition.is_incompatible_with(id)) {
            return Err(AttachmentError::Incompatible {
                attachment: definition.id.clone(),
                installed: conflict.to_string(),
            });
        }

        if !definition.has_required_attachments(&installed) {
            return Err(AttachmentError::MissingPrerequisites(definition.id.clone()));
        }
        Ok(())
    }

    fn internal_install(
        &mut self,
        attachment_id: &str,
        slot_type: Option<GameplayTag>,
        ctx: &mut AttachmentContext<'_>,
    ) -> Result<(), AttachmentError> {
        let Some(definition) = ctx.registry.get_cached_item(attachment_id) else {
            warn!("Attachment not found in registry: {}", attachment_id);
            return Err(AttachmentError::UnknownAttachment(attachment_id.to_string()));
        };
        let slot_type = slot_type
            .filter(|s| s.is_valid())
            .unwrap_or_else(|| definition.slot_type.clone());

        if let Err(err) = self.can_install_attachment(&definition, Some(&slot_type)) {
            warn!("Cannot install attachment {}: {}", attachment_id, err);
            return Err(err);
        }
        if self.find_slot_index(&slot_type).is_none() {
            return Err(AttachmentError::SlotUnavailable(slot_type));
        }

        if self.has_attachment_in_slot(&slot_type) {
            self.internal_uninstall(&slot_type, false, ctx)?;
        }

        // The uninstall above may have shifted dynamic entries.
        let index = self
            .find_slot_index(&slot_type)
            .ok_or_else(|| AttachmentError::SlotUnavailable(slot_type.clone()))?;
        if let Some(instance) = self.attachments.get_mut(index) {
            instance.attachment_id = attachment_id.to_string();
            instance.cached_def = Some(definition.clone());
            instance.slot_type = slot_type.clone();
            instance.is_installed = true;
            instance.tuning_values.clear();
            if definition.supports_tuning {
                for param in &definition.tuning_params {
                    instance.tuning_values.insert(param.stat_tag.clone(), param.default_value);
                }
            }
        }

        if !definition.provided_slots.is_empty() {
            self.add_dynamic_slots(&definition, &slot_type, ctx);
        }

        info!("Installed attachment {} in slot {}", attachment_id, slot_type);
        self.events.push(AttachmentEvent::Installed {
            slot_type: slot_type.clone(),
            attachment_id: attachment_id.to_string(),
        });
        self.broadcast_attachment_message(&slot_type, attachment_id, true);
        self.notify_stats_changed(ctx);
        Ok(())
    }

    fn internal_uninstall(
        &mut self,
        slot_type: &GameplayTag,
        remove_from_array: bool,
        ctx: &mut AttachmentContext<'_>,
    ) -> Result<(), AttachmentError> {
        let Some(index) = self.find_slot_index(slot_type) else {
            return Err(AttachmentError::SlotEmpty(slot_type.clone()));
        };
        let Some(instance) = self.attachments.get(index).cloned() else {
            return Err(AttachmentError::SlotEmpty(slot_type.clone()));
        };
        if !instance.is_valid() {
            if remove_from_array {
                self.attachments.remove(index);
                return Ok(());
            }
            return Err(AttachmentError::SlotEmpty(slot_type.clone()));
        }

        if instance.cached_def.as_ref().is_some_and(|d| !d.provided_slots.is_empty()) {
            self.remove_dynamic_slots(slot_type, ctx);
        }

        let index = self
            .find_slot_index(slot_type)
            .ok_or_else(|| AttachmentError::SlotEmpty(slot_type.clone()))?;
        if remove_from_array {
            self.attachments.remove(index);
        } else if let Some(entry) = self.attachments.get_mut(index) {
            entry.mark_uninstalled();
        }

        info!("Uninstalled attachment {} from slot {}", instance.attachment_id, slot_type);
        self.events.push(AttachmentEvent::Uninstalled {
            slot_type: slot_type.clone(),
            attachment_id: instance.attachment_id.clone(),
        });
        self.broadcast_attachment_message(slot_type, &instance.attachment_id, false);
        self.notify_stats_changed(ctx);
        Ok(())
    }

    // ===== DYNAMIC SLOTS =====

    fn add_dynamic_slots(&mut self, definition: &AttachmentDefinition, provider_slot: &GameplayTag, ctx: &mut AttachmentContext<'_>) {
        let mut defaults = Vec::new();
        for provided in &definition.provided_slots {
            if self.is_dynamic_slot(&provided.slot_type) {
                continue;
            }
            let mut slot = provided.clone();
            slot.is_dynamic = true;
            slot.provider_slot_type = Some(provider_slot.clone());
            if self.authority {
                self.attachments.push(AttachmentInstance::empty(slot.slot_type.clone()));
                if let Some(default) = &provided.default_attachment {
                    defaults.push((slot.slot_type.clone(), default.clone()));
                }
            }
            debug!("Added dynamic slot {} provided by {}", slot.slot_type, provider_slot);
            self.events.push(AttachmentEvent::SlotAvailabilityChanged {
                slot_type: slot.slot_type.clone(),
                available: true,
            });
            self.dynamic_slots.push(slot);
        }
        for (slot, attachment) in defaults {
            if let Err(err) = self.internal_install(&attachment, Some(slot.clone()), ctx) {
                warn!("Failed to install default attachment '{}' in dynamic slot '{}': {}", attachment, slot, err);
            }
        }
    }

    /// Remove every slot provided by the attachment in `provider_slot`, uninstalling whatever
    /// sits in them first (depth-first).
    fn remove_dynamic_slots(&mut self, provider_slot: &GameplayTag, ctx: &mut AttachmentContext<'_>) {
        let to_remove: Vec<GameplayTag> = self
            .dynamic_slots
            .iter()
            .filter(|s| s.provider_slot_type.as_ref() == Some(provider_slot))
            .map(|s| s.slot_type.clone())
            .collect();

        for slot in &to_remove {
            if self.authority {
                let _ = self.internal_uninstall(slot, true, ctx);
            }
            debug!("Removed dynamic slot {}", slot);
            self.events.push(AttachmentEvent::SlotAvailabilityChanged {
                slot_type: slot.clone(),
                available: false,
            });
        }
        self.dynamic_slots
            .retain(|s| s.provider_slot_type.as_ref() != Some(provider_slot));
    }

    fn is_dynamic_slot(&self, slot_type: &GameplayTag) -> bool {
        self.dynamic_slots.iter().any(|s| s.slot_type.matches_tag_exact(slot_type))
    }

    // ===== QUERIES =====

    fn find_slot_index(&self, slot_type: &GameplayTag) -> Option<usize> {
        self.attachments.position(|a| a.slot_type.matches_tag_exact(slot_type))
    }

    pub fn attachments(&self) -> &FastArray<AttachmentInstance> {
        &self.attachments
    }

    pub fn all_attachments(&self) -> impl Iterator<Item = &AttachmentInstance> {
        self.attachments.iter().filter(|a| a.is_valid())
    }

    pub fn attachment_in_slot(&self, slot_type: &GameplayTag) -> Option<&AttachmentInstance> {
        self.attachments
            .iter()
            .find(|a| a.slot_type.matches_tag_exact(slot_type) && a.is_valid())
    }

    pub fn attachment_def_in_slot(&self, slot_type: &GameplayTag) -> Option<Arc<AttachmentDefinition>> {
        self.attachment_in_slot(slot_type).and_then(|a| a.cached_def.clone())
    }

    pub fn has_attachment_in_slot(&self, slot_type: &GameplayTag) -> bool {
        self.attachment_in_slot(slot_type).is_some()
    }

    pub fn installed_attachment_count(&self) -> usize {
        self.attachments.iter().filter(|a| a.is_valid()).count()
    }

    pub fn installed_attachment_ids(&self) -> Vec<GameplayTag> {
        self.attachments
            .iter()
            .filter(|a| a.is_valid())
            .filter_map(|a| a.cached_def.as_ref().map(|d| d.attachment_id.clone()))
            .collect()
    }

    pub fn base_slots(&self) -> &[AttachmentSlotDef] {
        self.config.as_ref().map(|c| c.slots.as_slice()).unwrap_or(&[])
    }

    pub fn dynamic_slots(&self) -> &[AttachmentSlotDef] {
        &self.dynamic_slots
    }

    pub fn all_available_slots(&self) -> Vec<AttachmentSlotDef> {
        let mut slots = self.base_slots().to_vec();
        slots.extend(self.dynamic_slots.iter().cloned());
        slots
    }

    pub fn is_slot_available(&self, slot_type: &GameplayTag) -> bool {
        self.config.as_ref().is_some_and(|c| c.has_slot(slot_type)) || self.is_dynamic_slot(slot_type)
    }

    pub fn slot_def(&self, slot_type: &GameplayTag) -> Option<&AttachmentSlotDef> {
        self.config
            .as_ref()
            .and_then(|c| c.slot_def(slot_type))
            .or_else(|| self.dynamic_slots.iter().find(|s| s.slot_type.matches_tag_exact(slot_type)))
    }

    pub fn slots_provided_by_attachment(&self, slot_type: &GameplayTag) -> Vec<AttachmentSlotDef> {
        self.dynamic_slots
            .iter()
            .filter(|s| s.provider_slot_type.as_ref() == Some(slot_type))
            .cloned()
            .collect()
    }

    pub fn drain_events(&mut self) -> Vec<AttachmentEvent> {
        std::mem::take(&mut self.events)
    }

    // ===== STATS =====

    /// Authored and tuning modifiers on `stat_tag`, sorted by priority (stable).
    pub fn modifiers_for_stat(&self, stat_tag: &GameplayTag) -> Vec<StatModifier> {
        let mut result = Vec::new();
        for instance in self.attachments.iter().filter(|a| a.is_valid()) {
            let Some(definition) = &instance.cached_def else {
                continue;
            };
            result.extend(definition.modifiers_for_stat(stat_tag).cloned());
            if definition.supports_tuning {
                for param in definition.tuning_params.iter().filter(|p| p.stat_tag.matches_tag(stat_tag)) {
                    let Some(value) = instance.tuning_values.get(&param.stat_tag) else {
                        continue;
                    };
                    if value.abs() <= f32::EPSILON {
                        continue;
                    }
                    result.push(StatModifier::new(
                        param.stat_tag.clone(),
                        param.operation,
                        *value,
                        TUNING_MODIFIER_PRIORITY,
                    ));
                }
            }
        }
        result.sort_by_key(|m| m.priority);
        result
    }

    /// Last override wins; otherwise `(base + sum(add)) * (1 + sum(multiply))`.
    pub fn calculate_final_stat_value(&self, stat_tag: &GameplayTag, base_value: f32) -> f32 {
        compose_stat(base_value, &self.modifiers_for_stat(stat_tag))
    }

    pub fn granted_tags(&self) -> GameplayTagContainer {
        self.collect_tags(|d| &d.granted_weapon_tags)
    }

    pub fn removed_tags(&self) -> GameplayTagContainer {
        self.collect_tags(|d| &d.removed_weapon_tags)
    }

    pub fn blocked_ability_tags(&self) -> GameplayTagContainer {
        self.collect_tags(|d| &d.blocked_ability_tags)
    }

    fn collect_tags(&self, pick: impl Fn(&AttachmentDefinition) -> &GameplayTagContainer) -> GameplayTagContainer {
        let mut tags = GameplayTagContainer::new();
        for definition in self.attachments.iter().filter(|a| a.is_valid()).filter_map(|a| a.cached_def.as_ref()) {
            tags.append(pick(definition));
        }
        tags
    }

    // ===== TUNING =====

    /// Set one tuning value, clamped to the parameter's range. Returns the stored value.
    pub fn set_tuning_value(
        &mut self,
        slot_type: &GameplayTag,
        stat_tag: &GameplayTag,
        value: f32,
        ctx: &mut AttachmentContext<'_>,
    ) -> Result<f32, AttachmentError> {
        if !self.authority {
            return Err(AttachmentError::NotAuthority);
        }
        let index = self
            .attachments
            .position(|a| a.slot_type.matches_tag_exact(slot_type) && a.is_valid())
            .ok_or_else(|| AttachmentError::SlotEmpty(slot_type.clone()))?;
        let definition = self
            .attachments
            .get(index)
            .and_then(|a| a.cached_def.clone())
            .ok_or_else(|| AttachmentError::SlotEmpty(slot_type.clone()))?;
        if !definition.supports_tuning {
            return Err(AttachmentError::TuningNotSupported(slot_type.clone()));
        }
        let param = definition
            .tuning_param(stat_tag)
            .ok_or_else(|| AttachmentError::UnknownTuningParam(stat_tag.clone()))?;
        let clamped = value.clamp(param.min_value, param.max_value);
        if let Some(instance) = self.attachments.get_mut(index) {
            instance.tuning_values.insert(stat_tag.clone(), clamped);
        }
        self.notify_stats_changed(ctx);
        Ok(clamped)
    }

    pub fn tuning_value(&self, slot_type: &GameplayTag, stat_tag: &GameplayTag) -> f32 {
        self.attachment_in_slot(slot_type)
            .and_then(|a| a.tuning_values.get(stat_tag).copied())
            .unwrap_or(0.0)
    }

    pub fn reset_tuning_values(&mut self, slot_type: &GameplayTag, ctx: &mut AttachmentContext<'_>) -> Result<(), AttachmentError> {
        if !self.authority {
            return Err(AttachmentError::NotAuthority);
        }
        let index = self
            .attachments
            .position(|a| a.slot_type.matches_tag_exact(slot_type) && a.is_valid())
            .ok_or_else(|| AttachmentError::SlotEmpty(slot_type.clone()))?;
        let definition = self
            .attachments
            .get(index)
            .and_then(|a| a.cached_def.clone())
            .ok_or_else(|| AttachmentError::SlotEmpty(slot_type.clone()))?;
        if !definition.supports_tuning {
            return Err(AttachmentError::TuningNotSupported(slot_type.clone()));
        }
        if let Some(instance) = self.attachments.get_mut(index) {
            instance.tuning_values = definition
                .tuning_params
                .iter()
                .map(|p| (p.stat_tag.clone(), p.default_value))
                .collect();
        }
        self.notify_stats_changed(ctx);
        Ok(())
    }

    // ===== REPLICATION (receiver) =====

    /// Turn a new authoritative snapshot into remove / add / change handling. Adds run in
    /// dependency order; an add whose slot does not exist yet waits for its provider.
    pub fn apply_replicated(&mut self, snapshot: FastArray<AttachmentInstance>, ctx: &mut AttachmentContext<'_>) {
        if self.authority {
            warn!("apply_replicated ignored on the authority");
            return;
        }
        if !self.initialized {
            debug!("Attachment snapshot arrived before weapon initialization, deferring");
            self.pending_snapshot = Some(snapshot);
            return;
        }

        let delta = snapshot.delta_from(&self.attachments);
        if delta.is_empty() && self.deferred_adds.is_empty() {
            return;
        }
        let previous = std::mem::replace(&mut self.attachments, snapshot);
        for instance in self.attachments.iter_mut_untracked() {
            let carried = previous
                .iter()
                .find(|p| p.slot_type == instance.slot_type && p.attachment_id == instance.attachment_id)
                .and_then(|p| p.cached_def.clone());
            instance.cached_def = carried.or_else(|| {
                if instance.attachment_id.is_empty() {
                    None
                } else {
                    let def = ctx.registry.get_cached_item(&instance.attachment_id);
                    if def.is_none() {
                        warn!("Attachment not found in registry: {}", instance.attachment_id);
                    }
                    def
                }
            });
        }

        for removed in delta.removed.iter().filter(|r| r.is_valid()) {
            debug!("Replicated remove: {}", removed.debug_string());
            self.handle_attachment_removed(removed, ctx);
        }

        for &index in &delta.changed {
            let Some(instance) = self.attachments.get(index).cloned() else {
                continue;
            };
            let before = previous.iter().find(|p| p.slot_type == instance.slot_type).cloned();
            if instance.is_valid() {
                debug!("Replicated change: {}", instance.debug_string());
                if !self.is_slot_available(&instance.slot_type) {
                    self.defer(&instance.slot_type);
                    continue;
                }
                self.handle_attachment_changed(&instance, ctx);
            } else if let Some(before) = before.filter(|b| b.is_valid()) {
                debug!("Replicated clear: slot {}", instance.slot_type);
                self.handle_attachment_removed(&before, ctx);
            }
        }

        let mut adds: Vec<AttachmentInstance> = delta
            .added
            .iter()
            .filter_map(|&i| self.attachments.get(i).cloned())
            .filter(|a| a.is_valid())
            .collect();
        adds.extend(
            std::mem::take(&mut self.deferred_adds)
                .iter()
                .filter_map(|slot| self.attachment_in_slot(slot).cloned()),
        );
        for instance in sort_by_dependency(adds) {
            self.defer(&instance.slot_type);
        }
        self.process_deferred_adds(ctx);
    }

    fn defer(&mut self, slot_type: &GameplayTag) {
        if !self.deferred_adds.contains(slot_type) {
            self.deferred_adds.push(slot_type.clone());
        }
    }

    /// Apply every deferred add whose slot exists, repeating while progress is made.
    fn process_deferred_adds(&mut self, ctx: &mut AttachmentContext<'_>) {
        loop {
            let ready = self
                .deferred_adds
                .iter()
                .position(|slot| self.is_slot_available(slot));
            let Some(position) = ready else {
                break;
            };
            let slot = self.deferred_adds.remove(position);
            if let Some(instance) = self.attachment_in_slot(&slot).cloned() {
                debug!("Replicated add: {}", instance.debug_string());
                self.handle_attachment_added(&instance, ctx);
            }
        }
        if !self.deferred_adds.is_empty() {
            debug!("{} replicated attachments waiting for their slot provider", self.deferred_adds.len());
        }
    }

    fn handle_attachment_added(&mut self, instance: &AttachmentInstance, ctx: &mut AttachmentContext<'_>) {
        if let Some(definition) = instance.cached_def.clone() {
            if !definition.provided_slots.is_empty() {
                self.add_dynamic_slots(&definition, &instance.slot_type, ctx);
            }
        }
        self.events.push(AttachmentEvent::Installed {
            slot_type: instance.slot_type.clone(),
            attachment_id: instance.attachment_id.clone(),
        });
        self.broadcast_attachment_message(&instance.slot_type, &instance.attachment_id, true);
        self.notify_stats_changed(ctx);
    }

    fn handle_attachment_removed(&mut self, instance: &AttachmentInstance, ctx: &mut AttachmentContext<'_>) {
        if instance.cached_def.as_ref().is_some_and(|d| !d.provided_slots.is_empty()) {
            self.remove_dynamic_slots(&instance.slot_type, ctx);
        }
        self.events.push(AttachmentEvent::Uninstalled {
            slot_type: instance.slot_type.clone(),
            attachment_id: instance.attachment_id.clone(),
        });
        self.broadcast_attachment_message(&instance.slot_type, &instance.attachment_id, false);
        self.notify_stats_changed(ctx);
    }

    fn handle_attachment_changed(&mut self, instance: &AttachmentInstance, ctx: &mut AttachmentContext<'_>) {
        self.remove_dynamic_slots(&instance.slot_type, ctx);
        self.handle_attachment_added(instance, ctx);
    }

    // ===== NOTIFICATIONS =====

    fn notify_stats_changed(&mut self, ctx: &mut AttachmentContext<'_>) {
        if let Some(weapon) = ctx.weapon.as_deref_mut() {
            weapon.recalculate_stats(Some(self));
            if let Some(bus) = &self.bus {
                bus.broadcast_message(
                    &tag(names::WEAPON_MESSAGE_STATS_CHANGED),
                    &WeaponStatsChangedMessage {
                        weapon: self.weapon,
                        owner: self.owner,
                        new_computed_stats: weapon.computed_stats().clone(),
                    },
                );
            }
        }
        self.events.push(AttachmentEvent::StatsRecalculated);
    }

    fn broadcast_attachment_message(&self, slot_type: &GameplayTag, attachment_id: &str, installed: bool) {
        let Some(bus) = &self.bus else {
            return;
        };
        let channel = if installed {
            names::WEAPON_MESSAGE_ATTACHMENT_INSTALLED
        } else {
            names::WEAPON_MESSAGE_ATTACHMENT_UNINSTALLED
        };
        bus.broadcast_message(
            &tag(channel),
            &AttachmentChangedMessage {
                weapon: self.weapon,
                owner: self.owner,
                slot_type: slot_type.clone(),
                attachment_id: attachment_id.to_string(),
            },
        );
    }
}

/// Compose a stat from priority-sorted modifiers.
pub fn compose_stat(base_value: f32, modifiers: &[StatModifier]) -> f32 {
    if modifiers.is_empty() {
        return base_value;
    }
    let mut add = 0.0;
    let mut multiply = 0.0;
    let mut last_override = None;
    for modifier in modifiers {
        match modifier.operation {
            StatModifierOp::Add => add += modifier.value,
            StatModifierOp::Multiply => multiply += modifier.value,
            StatModifierOp::Override => last_override = Some(modifier.value),
        }
    }
    match last_override {
        Some(value) => value,
        None => (base_value + add) * (1.0 + multiply),
    }
}

/// Order installs so that an attachment comes after the one providing its slot or hosting
/// its mesh. Cycles fall back to arrival order.
fn sort_by_dependency(mut pending: Vec<AttachmentInstance>) -> Vec<AttachmentInstance> {
    let depends_on = |b: &AttachmentInstance, a: &AttachmentInstance| -> bool {
        let Some(a_def) = &a.cached_def else {
            return false;
        };
        let provides = a_def.has_provided_slot(&b.slot_type);
        let mounts = b
            .cached_def
            .as_ref()
            .and_then(|d| d.target_slot())
            .is_some_and(|t| t.matches_tag_exact(&a.slot_type));
        provides || mounts
    };

    let mut ordered = Vec::with_capacity(pending.len());
    while !pending.is_empty() {
        let next = pending
            .iter()
            .position(|b| !pending.iter().any(|a| !std::ptr::eq(a, b) && depends_on(b, a)))
            .unwrap_or(0);
        ordered.push(pending.remove(next));
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::tag_container;
    use crate::weapons::attachments::definition::TuningParam;
    use crate::weapons::{stat, HitScanWeaponStats};

    fn barrel_slot() -> GameplayTag {
        tag(names::ATTACHMENT_SLOT_BARREL)
    }

    fn muzzle_slot() -> GameplayTag {
        tag(names::ATTACHMENT_SLOT_MUZZLE)
    }

    fn registry() -> DataRegistry<AttachmentDefinition> {
        let mut registry = DataRegistry::new();
        registry.insert(
            AttachmentDefinition::new("barrel_long", barrel_slot())
                .with_modifier(StatModifier::new(tag(stat::DAMAGE_BASE), StatModifierOp::Add, 5.0, 0))
                .with_provided_slot(AttachmentSlotDef::new(muzzle_slot())),
        );
        registry.insert(
            AttachmentDefinition::new("suppressor", muzzle_slot())
                .with_modifier(StatModifier::new(tag(stat::DAMAGE_BASE), StatModifierOp::Multiply, 0.2, 10)),
        );
        let mut optic = AttachmentDefinition::new("optic_red_dot", tag(names::ATTACHMENT_SLOT_OPTIC));
        optic.blocked_ability_tags = tag_container(&["Ability.Type.Action.Melee"]);
        optic.granted_weapon_tags = tag_container(&["Weapon.Trait.Optic"]);
        registry.insert(optic.with_tuning(TuningParam {
            stat_tag: tag(stat::ADS_TIME),
            min_value: -0.1,
            max_value: 0.1,
            ..Default::default()
        }));
        let mut thermal = AttachmentDefinition::new("optic_thermal", tag(names::ATTACHMENT_SLOT_OPTIC));
        thermal.incompatible_attachments.add_tag(tag("Attachment.Id.suppressor"));
        registry.insert(thermal);
        let mut stock = AttachmentDefinition::new("stock_heavy", tag(names::ATTACHMENT_SLOT_STOCK));
        stock.required_attachments.add_tag(tag("Attachment.Id.barrel_long"));
        registry.insert(stock);
        registry
    }

    fn config() -> Arc<WeaponAttachmentsConfig> {
        Arc::new(WeaponAttachmentsConfig {
            slots: vec![
                AttachmentSlotDef::new(barrel_slot()),
                AttachmentSlotDef::new(tag(names::ATTACHMENT_SLOT_OPTIC)),
                AttachmentSlotDef::new(tag(names::ATTACHMENT_SLOT_STOCK)),
            ],
            max_attachments: 5,
        })
    }

    fn server(registry: &DataRegistry<AttachmentDefinition>) -> WeaponAttachmentComponent {
        let mut component = WeaponAttachmentComponent::new(true);
        component.initialize(config(), &mut AttachmentContext::new(registry));
        component
    }

    #[test]
    fn test_stat_composition_order() {
        let modifiers = vec![
            StatModifier::new(tag(stat::DAMAGE_BASE), StatModifierOp::Add, 5.0, 0),
            StatModifier::new(tag(stat::DAMAGE_BASE), StatModifierOp::Multiply, 0.2, 10),
        ];
        assert!((compose_stat(30.0, &modifiers) - 42.0).abs() < 1e-4);

        let mut with_override = modifiers.clone();
        with_override.push(StatModifier::new(tag(stat::DAMAGE_BASE), StatModifierOp::Override, 100.0, 5));
        with_override.sort_by_key(|m| m.priority);
        assert_eq!(compose_stat(30.0, &with_override), 100.0);
    }

    #[test]
    fn test_equal_priority_modifiers_compose_in_any_order() {
        let damage = || tag(stat::DAMAGE_BASE);
        let modifiers = vec![
            StatModifier::new(damage(), StatModifierOp::Add, 4.0, 0),
            StatModifier::new(damage(), StatModifierOp::Add, 2.5, 0),
            StatModifier::new(damage(), StatModifierOp::Multiply, 0.25, 0),
            StatModifier::new(damage(), StatModifierOp::Add, -1.5, 0),
            StatModifier::new(damage(), StatModifierOp::Multiply, 0.5, 0),
        ];
        let expected = compose_stat(20.0, &modifiers);
        assert!((expected - 43.75).abs() < 1e-4);

        let mut reversed = modifiers.clone();
        reversed.reverse();
        assert_eq!(compose_stat(20.0, &reversed), expected);

        let mut rotated = modifiers.clone();
        rotated.rotate_left(2);
        assert_eq!(compose_stat(20.0, &rotated), expected);
    }

    #[test]
    fn test_each_positive_add_raises_the_stat() {
        let mut modifiers = vec![StatModifier::new(
            tag(stat::DAMAGE_BASE),
            StatModifierOp::Multiply,
            0.1,
            10,
        )];
        let mut previous = compose_stat(30.0, &modifiers);
        for value in [0.5, 3.0, 12.0] {
            modifiers.insert(0, StatModifier::new(tag(stat::DAMAGE_BASE), StatModifierOp::Add, value, 0));
            let next = compose_stat(30.0, &modifiers);
            assert!(next > previous, "{next} should exceed {previous}");
            previous = next;
        }
    }

    #[test]
    fn test_install_adds_dynamic_slot_and_modifies_stats() {
        let registry = registry();
        let mut component = server(&registry);
        let mut weapon = HitScanWeaponInstance::new(HitScanWeaponStats {
            base_damage: 30.0,
            ..Default::default()
        });
        {
            let mut ctx = AttachmentContext::new(&registry).with_weapon(&mut weapon);
            assert!(!component.is_slot_available(&muzzle_slot()));
            component.install_attachment("barrel_long", None, &mut ctx).unwrap();
            assert!(component.is_slot_available(&muzzle_slot()));
            component.install_attachment("suppressor", None, &mut ctx).unwrap();
        }
        assert_eq!(
            component.attachment_in_slot(&barrel_slot()).map(|a| a.attachment_id.as_str()),
            Some("barrel_long")
        );
        assert!((weapon.computed_stats().base_damage - 42.0).abs() < 1e-4);
    }

    #[test]
    fn test_uninstall_provider_cascades() {
        let registry = registry();
        let mut component = server(&registry);
        let mut ctx = AttachmentContext::new(&registry);
        component.install_attachment("barrel_long", None, &mut ctx).unwrap();
        component.install_attachment("suppressor", None, &mut ctx).unwrap();
        component.drain_events();

        component.uninstall_attachment(&barrel_slot(), &mut ctx).unwrap();
        assert!(!component.is_slot_available(&muzzle_slot()));
        assert!(!component.has_attachment_in_slot(&muzzle_slot()));
        assert_eq!(component.installed_attachment_count(), 0);
        let events = component.drain_events();
        let uninstalled: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                AttachmentEvent::Uninstalled { attachment_id, .. } => Some(attachment_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(uninstalled, vec!["suppressor", "barrel_long"]);
    }

    #[test]
    fn test_install_then_uninstall_restores_stats() {
        let registry = registry();
        let mut component = server(&registry);
        let mut weapon = HitScanWeaponInstance::new(HitScanWeaponStats::default());
        weapon.recalculate_stats(Some(&component));
        let before = weapon.computed_stats().clone();
        let mut ctx = AttachmentContext::new(&registry).with_weapon(&mut weapon);
        component.install_attachment("barrel_long", None, &mut ctx).unwrap();
        component.uninstall_attachment(&barrel_slot(), &mut ctx).unwrap();
        assert!(!component.has_attachment_in_slot(&barrel_slot()));
        assert_eq!(weapon.computed_stats(), &before);
    }

    #[test]
    fn test_rule_failures() {
        let registry = registry();
        let mut component = server(&registry);
        let mut ctx = AttachmentContext::new(&registry);

        assert_eq!(
            component.install_attachment("suppressor", None, &mut ctx),
            Err(AttachmentError::SlotUnavailable(muzzle_slot()))
        );
        assert!(matches!(
            component.install_attachment("stock_heavy", None, &mut ctx),
            Err(AttachmentError::MissingPrerequisites(_))
        ));
        assert!(matches!(
            component.install_attachment("nope", None, &mut ctx),
            Err(AttachmentError::UnknownAttachment(_))
        ));

        component.install_attachment("barrel_long", None, &mut ctx).unwrap();
        component.install_attachment("suppressor", None, &mut ctx).unwrap();
        assert!(matches!(
            component.install_attachment("optic_thermal", None, &mut ctx),
            Err(AttachmentError::Incompatible { .. })
        ));
        component.install_attachment("stock_heavy", None, &mut ctx).unwrap();
    }

    #[test]
    fn test_max_attachments_allows_replacement() {
        let registry = registry();
        let mut component = WeaponAttachmentComponent::new(true);
        let mut ctx = AttachmentContext::new(&registry);
        component.initialize(
            Arc::new(WeaponAttachmentsConfig {
                slots: config().slots.clone(),
                max_attachments: 1,
            }),
            &mut ctx,
        );
        component.install_attachment("optic_red_dot", None, &mut ctx).unwrap();
        assert_eq!(
            component.install_attachment("barrel_long", None, &mut ctx),
            Err(AttachmentError::MaxAttachmentsReached(1))
        );
        component.install_attachment("optic_thermal", None, &mut ctx).unwrap();
        assert_eq!(component.installed_attachment_count(), 1);
    }

    #[test]
    fn test_tuning_clamped_and_reset() {
        let registry = registry();
        let mut component = server(&registry);
        let mut ctx = AttachmentContext::new(&registry);
        let optic = tag(names::ATTACHMENT_SLOT_OPTIC);
        component.install_attachment("optic_red_dot", None, &mut ctx).unwrap();

        let stored = component.set_tuning_value(&optic, &tag(stat::ADS_TIME), 0.5, &mut ctx).unwrap();
        assert_eq!(stored, 0.1);
        assert!((component.calculate_final_stat_value(&tag(stat::ADS_TIME), 0.2) - 0.3).abs() < 1e-5);

        component.reset_tuning_values(&optic, &mut ctx).unwrap();
        assert_eq!(component.tuning_value(&optic, &tag(stat::ADS_TIME)), 0.0);
        assert_eq!(component.calculate_final_stat_value(&tag(stat::ADS_TIME), 0.2), 0.2);

        assert_eq!(
            component.set_tuning_value(&barrel_slot(), &tag(stat::ADS_TIME), 0.1, &mut ctx),
            Err(AttachmentError::SlotEmpty(barrel_slot()))
        );
    }

    #[test]
    fn test_attachment_tags_collected() {
        let registry = registry();
        let mut component = server(&registry);
        let mut ctx = AttachmentContext::new(&registry);
        component.install_attachment("optic_red_dot", None, &mut ctx).unwrap();
        assert!(component.blocked_ability_tags().has_tag(&tag("Ability.Type.Action.Melee")));
        assert!(component.granted_tags().has_tag(&tag("Weapon.Trait.Optic")));
        assert!(component.removed_tags().is_empty());
    }

    #[test]
    fn test_receiver_processes_reverse_order() {
        let registry = registry();
        let mut authority = server(&registry);
        let mut ctx = AttachmentContext::new(&registry);
        authority.install_attachment("barrel_long", None, &mut ctx).unwrap();
        authority.install_attachment("suppressor", None, &mut ctx).unwrap();

        let mut receiver = WeaponAttachmentComponent::new(false);
        receiver.apply_replicated(authority.attachments().clone(), &mut ctx);
        assert!(!receiver.has_attachment_in_slot(&muzzle_slot()));

        receiver.initialize(config(), &mut ctx);
        assert!(receiver.is_slot_available(&muzzle_slot()));
        assert!(receiver.has_attachment_in_slot(&muzzle_slot()));
        assert_eq!(receiver.dynamic_slots().len(), 1);

        authority.uninstall_attachment(&barrel_slot(), &mut ctx).unwrap();
        receiver.apply_replicated(authority.attachments().clone(), &mut ctx);
        assert!(!receiver.is_slot_available(&muzzle_slot()));
        assert_eq!(receiver.installed_attachment_count(), 0);
    }

    #[test]
    fn test_dependency_sort_puts_provider_first() {
        let registry = registry();
        let make = |id: &str, slot: GameplayTag| AttachmentInstance {
            attachment_id: id.into(),
            slot_type: slot,
            tuning_values: Default::default(),
            is_installed: true,
            cached_def: registry.get_cached_item(id),
        };
        let ordered = sort_by_dependency(vec![make("suppressor", muzzle_slot()), make("barrel_long", barrel_slot())]);
        assert_eq!(ordered[0].attachment_id, "barrel_long");
        assert_eq!(ordered[1].attachment_id, "suppressor");
    }
}
