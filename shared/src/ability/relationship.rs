//! Ability tag relationship rules
//!
//! Extends an ability's own block/cancel/required/blocked tag lists based on the tags it
//! carries. Several entries may name the same ability tag; all of them are appended.

use serde::{Deserialize, Serialize};

use crate::tags::{GameplayTag, GameplayTagContainer};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbilityTagRelationship {
    pub ability_tag: GameplayTag,
    pub ability_tags_to_block: GameplayTagContainer,
    pub ability_tags_to_cancel: GameplayTagContainer,
    pub activation_required_tags: GameplayTagContainer,
    pub activation_blocked_tags: GameplayTagContainer,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AbilityTagRelationshipMapping {
    pub relationships: Vec<AbilityTagRelationship>,
}

impl AbilityTagRelationshipMapping {
    pub fn get_ability_tags_to_block_and_cancel(
        &self,
        ability_tags: &GameplayTagContainer,
        out_block: &mut GameplayTagContainer,
        out_cancel: &mut GameplayTagContainer,
    ) {
        for rel in self.relationships.iter().filter(|r| ability_tags.has_tag(&r.ability_tag)) {
            out_block.append(&rel.ability_tags_to_block);
            out_cancel.append(&rel.ability_tags_to_cancel);
        }
    }

    pub fn get_required_and_blocked_activation_tags(
        &self,
        ability_tags: &GameplayTagContainer,
        out_required: &mut GameplayTagContainer,
        out_blocked: &mut GameplayTagContainer,
    ) {
        for rel in self.relationships.iter().filter(|r| ability_tags.has_tag(&r.ability_tag)) {
            out_required.append(&rel.activation_required_tags);
            out_blocked.append(&rel.activation_blocked_tags);
        }
    }

    /// Whether the action tagged `action_tag` cancels an ability carrying `ability_tags`.
    pub fn is_ability_cancelled_by_tag(&self, ability_tags: &GameplayTagContainer, action_tag: &GameplayTag) -> bool {
        self.relationships
            .iter()
            .any(|r| &r.ability_tag == action_tag && r.ability_tags_to_cancel.has_any(ability_tags))
    }
}
