//! Attachment data: definitions, slots, modifiers and tuning ranges

use bevy::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::data_registry::RegistryItem;
use crate::tags::{GameplayTag, GameplayTagContainer};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatModifierOp {
    /// `base + value`
    #[default]
    Add,
    /// `base * (1 + value)`; 0.1 is +10%
    Multiply,
    /// `value`
    Override,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatModifier {
    pub stat_tag: GameplayTag,
    #[serde(default)]
    pub operation: StatModifierOp,
    pub value: f32,
    /// Lower applies first.
    #[serde(default)]
    pub priority: i32,
}

impl StatModifier {
    pub fn new(stat_tag: GameplayTag, operation: StatModifierOp, value: f32, priority: i32) -> Self {
        Self {
            stat_tag,
            operation,
            value,
            priority,
        }
    }
}

/// A continuous adjustment the player may dial within `[min_value, max_value]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningParam {
    pub display_name: String,
    pub stat_tag: GameplayTag,
    pub min_value: f32,
    pub max_value: f32,
    pub default_value: f32,
    pub operation: StatModifierOp,
}

impl Default for TuningParam {
    fn default() -> Self {
        Self {
            display_name: String::new(),
            stat_tag: GameplayTag::none(),
            min_value: -1.0,
            max_value: 1.0,
            default_value: 0.0,
            operation: StatModifierOp::Add,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachmentSlotDef {
    pub slot_type: GameplayTag,
    pub display_name: String,
    /// Registry ids of attachments offered in this slot.
    pub available_attachments: Vec<String>,
    pub default_attachment: Option<String>,
    pub sort_order: i32,
    /// Set at runtime for slots contributed by an installed attachment.
    #[serde(skip)]
    pub is_dynamic: bool,
    /// For dynamic slots: the slot holding the attachment that provides this one.
    #[serde(skip)]
    pub provider_slot_type: Option<GameplayTag>,
}

impl AttachmentSlotDef {
    pub fn new(slot_type: GameplayTag) -> Self {
        Self {
            slot_type,
            ..Default::default()
        }
    }

    pub fn with_default(mut self, attachment: impl Into<String>) -> Self {
        self.default_attachment = Some(attachment.into());
        self
    }
}

/// Where an attachment's mesh is parented.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum AttachTarget {
    #[default]
    WeaponSocket,
    /// On the mesh of the attachment installed in this slot (a suppressor on a barrel).
    AttachmentSlot(GameplayTag),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachmentDefinition {
    /// Registry id; what replicates.
    pub id: String,
    /// Identity tag used by incompatibility and prerequisite rules.
    pub attachment_id: GameplayTag,
    pub display_name: String,
    pub description: String,
    pub slot_type: GameplayTag,

    pub stat_modifiers: Vec<StatModifier>,

    pub mesh: String,
    pub attach_target: AttachTarget,
    pub attach_socket_name: String,
    pub attach_offset: Vec3,
    /// Weapon part slots hidden while this is installed.
    pub hidden_slots: Vec<GameplayTag>,

    pub incompatible_attachments: GameplayTagContainer,
    pub required_attachments: GameplayTagContainer,

    pub unlock_weapon_level: u32,

    pub supports_tuning: bool,
    pub tuning_params: Vec<TuningParam>,

    pub provided_slots: Vec<AttachmentSlotDef>,

    pub granted_weapon_tags: GameplayTagContainer,
    pub removed_weapon_tags: GameplayTagContainer,
    /// Added to the owner's ability system as loose tags while the weapon is equipped.
    pub blocked_ability_tags: GameplayTagContainer,
}

impl RegistryItem for AttachmentDefinition {
    fn registry_id(&self) -> &str {
        &self.id
    }
}

impl AttachmentDefinition {
    pub fn new(id: impl Into<String>, slot_type: GameplayTag) -> Self {
        let id = id.into();
        Self {
            attachment_id: GameplayTag::new(&format!("Attachment.Id.{}", id)),
            id,
            slot_type,
            unlock_weapon_level: 1,
            ..Default::default()
        }
    }

    pub fn with_modifier(mut self, modifier: StatModifier) -> Self {
        self.stat_modifiers.push(modifier);
        self
    }

    pub fn with_provided_slot(mut self, slot: AttachmentSlotDef) -> Self {
        self.provided_slots.push(slot);
        self
    }

    pub fn with_tuning(mut self, param: TuningParam) -> Self {
        self.supports_tuning = true;
        self.tuning_params.push(param);
        self
    }

    pub fn has_provided_slot(&self, slot_type: &GameplayTag) -> bool {
        self.provided_slots.iter().any(|s| s.slot_type.matches_tag_exact(slot_type))
    }

    pub fn provided_slot_types(&self) -> Vec<GameplayTag> {
        self.provided_slots.iter().map(|s| s.slot_type.clone()).collect()
    }

    pub fn modifiers_for_stat(&self, stat_tag: &GameplayTag) -> impl Iterator<Item = &StatModifier> {
        let stat_tag = stat_tag.clone();
        self.stat_modifiers.iter().filter(move |m| m.stat_tag.matches_tag(&stat_tag))
    }

    pub fn is_incompatible_with(&self, other_attachment_id: &GameplayTag) -> bool {
        self.incompatible_attachments.has_tag(other_attachment_id)
    }

    /// Every required tag is matched by some installed attachment id.
    pub fn has_required_attachments(&self, installed_ids: &[GameplayTag]) -> bool {
        self.required_attachments
            .iter()
            .all(|required| installed_ids.iter().any(|installed| installed.matches_tag(required)))
    }

    pub fn tuning_param(&self, stat_tag: &GameplayTag) -> Option<&TuningParam> {
        self.tuning_params.iter().find(|p| p.stat_tag.matches_tag_exact(stat_tag))
    }

    /// Slot whose attachment this one physically mounts on, if any.
    pub fn target_slot(&self) -> Option<&GameplayTag> {
        match &self.attach_target {
            AttachTarget::AttachmentSlot(slot) if slot.is_valid() => Some(slot),
            _ => None,
        }
    }
}

/// Attachment layout of one weapon, authored with its equipment definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeaponAttachmentsConfig {
    pub slots: Vec<AttachmentSlotDef>,
    /// Zero means unlimited.
    pub max_attachments: usize,
}

impl Default for WeaponAttachmentsConfig {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            max_attachments: 5,
        }
    }
}

impl WeaponAttachmentsConfig {
    pub fn has_slot(&self, slot_type: &GameplayTag) -> bool {
        self.slots.iter().any(|s| s.slot_type.matches_tag_exact(slot_type))
    }

    pub fn slot_def(&self, slot_type: &GameplayTag) -> Option<&AttachmentSlotDef> {
        self.slots.iter().find(|s| s.slot_type.matches_tag_exact(slot_type))
    }
}

/// One slot's runtime record. Registry id and slot survive an uninstall so receivers can
/// still tell what was removed.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AttachmentInstance {
    pub attachment_id: String,
    pub slot_type: GameplayTag,
    pub tuning_values: BTreeMap<GameplayTag, f32>,
    pub is_installed: bool,
    /// Resolved lazily from the registry on each endpoint.
    #[serde(skip)]
    pub cached_def: Option<Arc<AttachmentDefinition>>,
}

impl PartialEq for AttachmentInstance {
    fn eq(&self, other: &Self) -> bool {
        self.attachment_id == other.attachment_id
            && self.slot_type == other.slot_type
            && self.tuning_values == other.tuning_values
            && self.is_installed == other.is_installed
    }
}

impl AttachmentInstance {
    pub fn empty(slot_type: GameplayTag) -> Self {
        Self {
            slot_type,
            ..Default::default()
        }
    }

    pub fn is_valid(&self) -> bool {
        self.is_installed && !self.attachment_id.is_empty()
    }

    pub fn definition(&self) -> Option<&Arc<AttachmentDefinition>> {
        self.cached_def.as_ref()
    }

    pub fn mark_uninstalled(&mut self) {
        self.is_installed = false;
        self.tuning_values.clear();
    }

    pub fn debug_string(&self) -> String {
        format!("Attachment[{}] in Slot[{}]", self.attachment_id, self.slot_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::{names, tag};

    #[test]
    fn test_prerequisites_use_tag_hierarchy() {
        let mut def = AttachmentDefinition::new("suppressor", tag(names::ATTACHMENT_SLOT_MUZZLE));
        def.required_attachments.add_tag(tag("Attachment.Id.Barrel"));
        assert!(!def.has_required_attachments(&[]));
        assert!(def.has_required_attachments(&[tag("Attachment.Id.Barrel.Long")]));
        assert!(!def.has_required_attachments(&[tag("Attachment.Id.Optic")]));
    }

    #[test]
    fn test_definition_from_ron() {
        let text = r#"(
            id: "barrel_long",
            attachment_id: "Attachment.Id.Barrel.Long",
            slot_type: "Attachment.Slot.Barrel",
            stat_modifiers: [
                (stat_tag: "Weapon.Stat.Range.Max", operation: Multiply, value: 0.25),
            ],
            attach_target: WeaponSocket,
            provided_slots: [
                (slot_type: "Attachment.Slot.Muzzle", default_attachment: Some("muzzle_brake")),
            ],
        )"#;
        let def: AttachmentDefinition = ron::from_str(text).unwrap();
        assert!(def.has_provided_slot(&tag(names::ATTACHMENT_SLOT_MUZZLE)));
        assert_eq!(def.stat_modifiers[0].priority, 0);
        assert!(def.provided_slots[0].provider_slot_type.is_none());
        assert!(def.target_slot().is_none());
    }
}
