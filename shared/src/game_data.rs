//! Every static data registry, loaded together

use bevy::prelude::*;
use std::path::Path;

use crate::ability::montage::AnimMontage;
use crate::ability::{AbilityDefinition, AbilitySet, AbilitySetSources};
use crate::data_registry::DataRegistry;
use crate::effects::GameplayEffect;
use crate::equipment::EquipmentDefinition;
use crate::inventory::ItemDefinition;
use crate::weapons::attachments::AttachmentDefinition;

pub const DATA_DIR: &str = "assets/data";

#[derive(Resource, Clone, Debug, Default)]
pub struct GameData {
    pub abilities: DataRegistry<AbilityDefinition>,
    pub effects: DataRegistry<GameplayEffect>,
    pub ability_sets: DataRegistry<AbilitySet>,
    pub montages: DataRegistry<AnimMontage>,
    pub attachments: DataRegistry<AttachmentDefinition>,
    pub equipment: DataRegistry<EquipmentDefinition>,
    pub items: DataRegistry<ItemDefinition>,
}

impl GameData {
    /// Load each `<name>.ron` list under `dir`. Missing or broken files leave that registry empty.
    pub fn load_from_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            abilities: DataRegistry::load_or_empty(dir.join("abilities.ron")),
            effects: DataRegistry::load_or_empty(dir.join("effects.ron")),
            ability_sets: DataRegistry::load_or_empty(dir.join("ability_sets.ron")),
            montages: DataRegistry::load_or_empty(dir.join("montages.ron")),
            attachments: DataRegistry::load_or_empty(dir.join("attachments.ron")),
            equipment: DataRegistry::load_or_empty(dir.join("equipment.ron")),
            items: DataRegistry::load_or_empty(dir.join("items.ron")),
        }
    }

    pub fn ability_set_sources(&self) -> AbilitySetSources<'_> {
        AbilitySetSources {
            abilities: &self.abilities,
            effects: &self.effects,
        }
    }

    /// Equipment an item turns into, if any.
    pub fn equipment_for_item(&self, item_definition: &str) -> Option<std::sync::Arc<EquipmentDefinition>> {
        let item = self.items.get_cached_item(item_definition)?;
        let equipment = item.equipment.as_deref()?;
        self.equipment.get_cached_item(equipment)
    }
}
