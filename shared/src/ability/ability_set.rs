//! Ability sets
//!
//! A data bundle of abilities, effects and attribute sets granted together. Granting records
//! every handle so the bundle can be revoked as a unit later.

use bevy::prelude::*;
use serde::{Deserialize, Serialize};

use super::asc::{ActivationEnv, AbilitySystemComponent};
use super::definition::AbilityDefinition;
use super::spec::{AbilitySource, AbilitySpec, AbilitySpecHandle};
use crate::attributes::AttributeSetClass;
use crate::data_registry::{DataRegistry, RegistryItem};
use crate::effects::{ActiveGameplayEffectHandle, EffectContext, GameplayEffect};
use crate::tags::GameplayTag;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AbilitySetGrantedAbility {
    /// Ability definition registry id.
    pub ability: String,
    #[serde(default = "default_level")]
    pub ability_level: i32,
    #[serde(default)]
    pub input_tag: GameplayTag,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AbilitySetGrantedEffect {
    pub effect: String,
    #[serde(default = "default_level")]
    pub effect_level: i32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AbilitySetGrantedAttributes {
    pub attribute_set: AttributeSetClass,
}

fn default_level() -> i32 {
    1
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbilitySet {
    pub id: String,
    pub granted_abilities: Vec<AbilitySetGrantedAbility>,
    pub granted_effects: Vec<AbilitySetGrantedEffect>,
    pub granted_attributes: Vec<AbilitySetGrantedAttributes>,
}

impl RegistryItem for AbilitySet {
    fn registry_id(&self) -> &str {
        &self.id
    }
}

/// What one grant of an `AbilitySet` produced.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AbilitySetGrantedHandles {
    pub ability_spec_handles: Vec<AbilitySpecHandle>,
    pub effect_handles: Vec<ActiveGameplayEffectHandle>,
    pub attribute_sets: Vec<AttributeSetClass>,
}

impl AbilitySetGrantedHandles {
    pub fn add_ability_spec_handle(&mut self, handle: AbilitySpecHandle) {
        if handle.is_valid() {
            self.ability_spec_handles.push(handle);
        }
    }

    pub fn add_gameplay_effect_handle(&mut self, handle: ActiveGameplayEffectHandle) {
        if handle.is_valid() {
            self.effect_handles.push(handle);
        }
    }

    pub fn add_attribute_set(&mut self, class: AttributeSetClass) {
        self.attribute_sets.push(class);
    }

    pub fn is_empty(&self) -> bool {
        self.ability_spec_handles.is_empty() && self.effect_handles.is_empty() && self.attribute_sets.is_empty()
    }

    /// Revoke everything recorded here. Invalid entries are skipped.
    pub fn take_from_ability_system(&mut self, asc: &mut AbilitySystemComponent) {
        if !asc.is_authority() {
            warn!("take_from_ability_system called without authority");
            return;
        }
        for handle in self.ability_spec_handles.drain(..) {
            asc.clear_ability(handle);
        }
        for handle in self.effect_handles.drain(..) {
            asc.remove_active_gameplay_effect(handle);
        }
        for class in self.attribute_sets.drain(..) {
            asc.remove_attribute_set(class);
        }
    }
}

/// Registries an ability set resolves its entries against.
pub struct AbilitySetSources<'a> {
    pub abilities: &'a DataRegistry<AbilityDefinition>,
    pub effects: &'a DataRegistry<GameplayEffect>,
}

impl AbilitySet {
    /// Grant every entry. Entries that fail to resolve are logged and skipped.
    pub fn give_to_ability_system(
        &self,
        asc: &mut AbilitySystemComponent,
        out_handles: Option<&mut AbilitySetGrantedHandles>,
        source: AbilitySource,
        sources: &AbilitySetSources<'_>,
        env: &mut ActivationEnv<'_>,
    ) {
        if !asc.is_authority() {
            warn!("give_to_ability_system called without authority for ability set {}", self.id);
            return;
        }
        let mut scratch = AbilitySetGrantedHandles::default();
        let out = out_handles.unwrap_or(&mut scratch);

        for (index, entry) in self.granted_abilities.iter().enumerate() {
            let Some(definition) = sources.abilities.get_cached_item(&entry.ability) else {
                error!(
                    "GrantedAbilities[{}] on ability set [{}] is not valid ({})",
                    index, self.id, entry.ability
                );
                continue;
            };
            let mut spec = AbilitySpec::new(definition, entry.ability_level).with_source(source);
            if entry.input_tag.is_valid() {
                spec = spec.with_input_tag(entry.input_tag.clone());
            }
            out.add_ability_spec_handle(asc.grant_ability(spec, env));
        }

        for (index, entry) in self.granted_effects.iter().enumerate() {
            let Some(effect) = sources.effects.get_cached_item(&entry.effect) else {
                error!(
                    "GrantedGameplayEffects[{}] on ability set [{}] is not valid ({})",
                    index, self.id, entry.effect
                );
                continue;
            };
            let context = EffectContext {
                instigator: asc.avatar().map(|a| a.id),
                causer: asc.avatar().map(|a| a.id),
                source_level: entry.effect_level as f32,
            };
            out.add_gameplay_effect_handle(asc.apply_gameplay_effect_to_self(effect, entry.effect_level, context));
        }

        for entry in &self.granted_attributes {
            asc.add_attribute_set(entry.attribute_set);
            out.add_attribute_set(entry.attribute_set);
        }
        debug!("Granted ability set {}", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::GameplayAttribute;
    use crate::effects::{EffectDuration, EffectModifier, ModifierOp};
    use crate::ability::definition::ScalableFloat;
    use crate::tags::{tag, tag_container};

    fn registries() -> (DataRegistry<AbilityDefinition>, DataRegistry<GameplayEffect>) {
        let mut abilities = DataRegistry::new();
        abilities.insert(AbilityDefinition::new("GA_Jump"));
        let mut effects = DataRegistry::new();
        effects.insert(GameplayEffect {
            id: "GE_Haste".into(),
            duration: EffectDuration::Infinite,
            modifiers: vec![EffectModifier {
                attribute: GameplayAttribute::MaxWalkSpeedMultiplier,
                op: ModifierOp::Multiply,
                magnitude: ScalableFloat::new(1.5),
            }],
            granted_tags: tag_container(&["Status.Haste"]),
            ..Default::default()
        });
        (abilities, effects)
    }

    fn set() -> AbilitySet {
        ron::from_str(
            r#"(
                id: "AbilitySet_Hero",
                granted_abilities: [
                    (ability: "GA_Jump", input_tag: "InputTag.Jump"),
                    (ability: "GA_Missing"),
                ],
                granted_effects: [(effect: "GE_Haste")],
                granted_attributes: [(attribute_set: Movement)],
            )"#,
        )
        .unwrap()
    }

    #[test]
    fn test_give_and_take() {
        let (abilities, effects) = registries();
        let sources = AbilitySetSources {
            abilities: &abilities,
            effects: &effects,
        };
        let mut asc = AbilitySystemComponent::default();
        let mut handles = AbilitySetGrantedHandles::default();
        set().give_to_ability_system(
            &mut asc,
            Some(&mut handles),
            AbilitySource::default(),
            &sources,
            &mut ActivationEnv::none(),
        );

        assert_eq!(handles.ability_spec_handles.len(), 1);
        assert_eq!(handles.effect_handles.len(), 1);
        assert_eq!(handles.attribute_sets, vec![AttributeSetClass::Movement]);
        let spec = asc.find_spec(handles.ability_spec_handles[0]).unwrap();
        assert!(spec.dynamic_source_tags.has_tag(&tag("InputTag.Jump")));
        assert!(asc.has_matching_gameplay_tag(&tag("Status.Haste")));

        handles.take_from_ability_system(&mut asc);
        assert!(handles.is_empty());
        assert!(asc.specs().is_empty());
        assert!(!asc.has_matching_gameplay_tag(&tag("Status.Haste")));
        assert!(asc.attribute_set(AttributeSetClass::Movement).is_none());
    }

    #[test]
    fn test_non_authority_grants_nothing() {
        let (abilities, effects) = registries();
        let sources = AbilitySetSources {
            abilities: &abilities,
            effects: &effects,
        };
        let mut asc = AbilitySystemComponent::new(crate::ability::asc::NetRole::AutonomousProxy, true);
        let mut handles = AbilitySetGrantedHandles::default();
        set().give_to_ability_system(
            &mut asc,
            Some(&mut handles),
            AbilitySource::default(),
            &sources,
            &mut ActivationEnv::none(),
        );
        assert!(handles.is_empty());
    }
}
