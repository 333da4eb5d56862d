//! Static equipment data

use bevy::prelude::*;
use serde::{Deserialize, Serialize};

use crate::data_registry::RegistryItem;
use crate::weapons::attachments::WeaponAttachmentsConfig;
use crate::weapons::HitScanWeaponStats;

/// Runtime variant created for a definition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum EquipmentInstanceType {
    #[default]
    Generic,
    HitScanWeapon,
}

/// An actor spawned on the pawn while the equipment exists.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EquipmentActorToSpawn {
    pub actor_class: String,
    /// Component tag on the pawn to attach to; falls back to the character mesh, then the root.
    pub parent_component_tag: Option<String>,
    pub attach_socket: String,
    pub attach_offset: Vec3,
    pub attach_rotation: Quat,
    pub actor_tags: Vec<String>,
    /// Spawned by the authority and replicated, or spawned locally by the owning client.
    pub replicate: bool,
}

impl Default for EquipmentActorToSpawn {
    fn default() -> Self {
        Self {
            actor_class: String::new(),
            parent_component_tag: None,
            attach_socket: String::new(),
            attach_offset: Vec3::ZERO,
            attach_rotation: Quat::IDENTITY,
            actor_tags: Vec::new(),
            replicate: true,
        }
    }
}

impl EquipmentActorToSpawn {
    pub fn relative_transform(&self) -> Transform {
        Transform::from_translation(self.attach_offset).with_rotation(self.attach_rotation)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EquipmentDefinition {
    pub id: String,
    pub instance_type: EquipmentInstanceType,
    /// Registry ids of ability sets granted while the equipment exists.
    pub ability_sets_to_grant: Vec<String>,
    pub actors_to_spawn: Vec<EquipmentActorToSpawn>,
    /// Required for `HitScanWeapon`.
    pub weapon_stats: Option<HitScanWeaponStats>,
    pub attachments: Option<WeaponAttachmentsConfig>,
    pub auto_show_on_equip: bool,
    pub auto_hide_on_unequip: bool,
}

impl Default for EquipmentDefinition {
    fn default() -> Self {
        Self {
            id: String::new(),
            instance_type: EquipmentInstanceType::Generic,
            ability_sets_to_grant: Vec::new(),
            actors_to_spawn: Vec::new(),
            weapon_stats: None,
            attachments: None,
            auto_show_on_equip: true,
            auto_hide_on_unequip: true,
        }
    }
}

impl RegistryItem for EquipmentDefinition {
    fn registry_id(&self) -> &str {
        &self.id
    }
}

impl EquipmentDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn hit_scan_weapon(id: impl Into<String>, stats: HitScanWeaponStats) -> Self {
        Self {
            id: id.into(),
            instance_type: EquipmentInstanceType::HitScanWeapon,
            weapon_stats: Some(stats),
            ..Default::default()
        }
    }

    pub fn with_ability_set(mut self, set: impl Into<String>) -> Self {
        self.ability_sets_to_grant.push(set.into());
        self
    }

    pub fn with_actor(mut self, actor: EquipmentActorToSpawn) -> Self {
        self.actors_to_spawn.push(actor);
        self
    }

    pub fn with_attachments(mut self, config: WeaponAttachmentsConfig) -> Self {
        self.attachments = Some(config);
        self
    }

    pub fn is_weapon(&self) -> bool {
        self.instance_type == EquipmentInstanceType::HitScanWeapon
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weapon_definition_from_ron() {
        let text = r#"(
            id: "rifle",
            instance_type: HitScanWeapon,
            ability_sets_to_grant: ["AbilitySet_Rifle"],
            actors_to_spawn: [
                (actor_class: "RifleMesh", attach_socket: "weapon_r", actor_tags: ["Weapon"]),
                (actor_class: "RifleHolster", replicate: false),
            ],
            weapon_stats: Some((base_damage: 25.0)),
            attachments: Some((slots: [(slot_type: "Attachment.Slot.Barrel")])),
        )"#;
        let def: EquipmentDefinition = ron::from_str(text).unwrap();
        assert!(def.is_weapon());
        assert!(def.auto_show_on_equip && def.auto_hide_on_unequip);
        assert!(def.actors_to_spawn[0].replicate);
        assert!(!def.actors_to_spawn[1].replicate);
        assert_eq!(def.actors_to_spawn[0].relative_transform(), Transform::IDENTITY);
        assert_eq!(def.attachments.unwrap().max_attachments, 5);
    }
}
