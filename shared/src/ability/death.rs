//! Death handling
//!
//! The death ability is triggered by `GameplayEvent.Death`. While it runs every other ability
//! is cancelled (unless tagged `Ability.Behavior.SurvivesDeath`) and activation is refused
//! with `Ability.ActivateFail.IsDead`. Death state is carried as loose tags so it replicates
//! with the rest of the owned tags.

use bevy::prelude::*;

use super::asc::{AbilitySystemComponent, ActivationEnv};
use super::definition::{AbilityDefinition, AbilityKind, ActivationGroup, InstancingPolicy, NetExecutionPolicy};
use super::spec::{AbilitySpecHandle, GameplayEventData, InstanceBehavior, InstanceId};
use crate::tags::{names, tag, tag_container};

pub const DEATH_ABILITY_ID: &str = "GA_Death";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeathState {
    NotDead,
    DeathStarted,
    DeathFinished,
}

impl AbilityDefinition {
    /// The stock death ability.
    pub fn death() -> Self {
        let mut definition = AbilityDefinition::new(DEATH_ABILITY_ID)
            .with_kind(AbilityKind::Death { auto_start_death: true })
            .with_instancing(InstancingPolicy::InstancedPerActor)
            .with_net_execution(NetExecutionPolicy::ServerInitiated)
            .with_trigger(tag(names::GAMEPLAY_EVENT_DEATH))
            .with_ability_tags(tag_container(&["Ability.Type.StatusChange.Death"]));
        definition.activation_owned_tags = tag_container(&[names::STATUS_DEATH]);
        definition
    }
}

impl AbilitySystemComponent {
    pub fn death_state(&self) -> DeathState {
        if self.has_matching_gameplay_tag(&tag(names::STATUS_DEATH_DEAD)) {
            DeathState::DeathFinished
        } else if self.has_matching_gameplay_tag(&tag(names::STATUS_DEATH_DYING)) {
            DeathState::DeathStarted
        } else {
            DeathState::NotDead
        }
    }

    pub(crate) fn activate_death(&mut self, handle: AbilitySpecHandle, instance: InstanceId, auto_start_death: bool) {
        let survivors = tag_container(&[names::ABILITY_BEHAVIOR_SURVIVES_DEATH]);
        self.cancel_abilities(None, Some(&survivors), Some((handle, instance)));

        if let Err(e) = self.set_can_be_canceled(handle, instance, false) {
            error!("Death ability could not become non-cancelable: {}", e);
        }
        if let Err(e) = self.change_activation_group(handle, instance, ActivationGroup::ExclusiveBlocking) {
            error!("Death ability failed to change activation group to ExclusiveBlocking: {}", e);
        }
        self.set_death_blocks_activation(true);

        let started = auto_start_death && self.start_death();
        if let Some(inst) = self.find_spec_mut(handle).and_then(|s| s.instance_mut(instance)) {
            inst.behavior = InstanceBehavior::Death { death_started: started };
            inst.committed = true;
        }
        info!("Death ability activated (death started: {})", started);
    }

    /// Health ran out: send `GameplayEvent.Death` so the granted death ability starts.
    /// Returns the number of abilities the event triggered.
    pub fn handle_out_of_health(
        &mut self,
        instigator: Option<u64>,
        magnitude: f32,
        env: &mut ActivationEnv<'_>,
    ) -> usize {
        if self.death_state() != DeathState::NotDead {
            return 0;
        }
        let data = GameplayEventData {
            instigator,
            target: self.avatar().map(|a| a.id),
            magnitude,
            ..Default::default()
        };
        self.handle_gameplay_event(&tag(names::GAMEPLAY_EVENT_DEATH), data, env)
    }

    /// Enter the dying state. Returns false if already dying or dead.
    pub fn start_death(&mut self) -> bool {
        if self.death_state() != DeathState::NotDead {
            return false;
        }
        self.add_loose_gameplay_tag(&tag(names::STATUS_DEATH_DYING), 1);
        true
    }

    pub fn finish_death(&mut self) {
        if self.death_state() != DeathState::DeathStarted {
            return;
        }
        self.remove_loose_gameplay_tag(&tag(names::STATUS_DEATH_DYING), 1);
        self.add_loose_gameplay_tag(&tag(names::STATUS_DEATH_DEAD), 1);
    }

    pub(crate) fn end_death(&mut self) {
        self.set_death_blocks_activation(false);
        self.finish_death();
    }

    /// Clear death tags, e.g. on respawn.
    pub fn reset_death(&mut self) {
        let dying = tag(names::STATUS_DEATH_DYING);
        let dead = tag(names::STATUS_DEATH_DEAD);
        let dying_count = self.tag_count(&dying);
        let dead_count = self.tag_count(&dead);
        self.remove_loose_gameplay_tag(&dying, dying_count);
        self.remove_loose_gameplay_tag(&dead, dead_count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ability::asc::ActivationEnv;
    use crate::ability::spec::{AbilitySpec, GameplayEventData};
    use std::sync::Arc;

    #[test]
    fn test_death_cancels_and_blocks() {
        let mut asc = AbilitySystemComponent::default();
        let env = &mut ActivationEnv::none();
        let run = asc.grant_ability(AbilitySpec::new(Arc::new(AbilityDefinition::new("Run")), 1), env);
        let spectate = asc.grant_ability(
            AbilitySpec::new(
                Arc::new(
                    AbilityDefinition::new("Spectate")
                        .with_ability_tags(tag_container(&[names::ABILITY_BEHAVIOR_SURVIVES_DEATH])),
                ),
                1,
            ),
            env,
        );
        let death = asc.grant_ability(AbilitySpec::new(Arc::new(AbilityDefinition::death()), 1), env);

        asc.try_activate_ability(run, env).unwrap();
        asc.try_activate_ability(spectate, env).unwrap();

        let triggered = asc.handle_gameplay_event(&tag(names::GAMEPLAY_EVENT_DEATH), GameplayEventData::default(), env);
        assert_eq!(triggered, 1);
        assert!(!asc.find_spec(run).unwrap().is_active());
        assert!(asc.find_spec(spectate).unwrap().is_active());
        assert_eq!(asc.death_state(), DeathState::DeathStarted);
        assert_eq!(asc.activation_group_count(ActivationGroup::ExclusiveBlocking), 1);

        let reasons = asc.try_activate_ability(run, env).unwrap_err();
        assert!(reasons.has_tag(&tag(names::ABILITY_ACTIVATE_FAIL_IS_DEAD)));

        // Death cannot be cancelled by others
        let instance = asc.find_spec(death).unwrap().instances[0].id;
        assert!(!asc.cancel_ability_instance(death, instance, false));

        asc.end_ability(death, instance);
        assert_eq!(asc.death_state(), DeathState::DeathFinished);
        assert!(!asc.is_death_blocking_activation());

        asc.reset_death();
        assert_eq!(asc.death_state(), DeathState::NotDead);
    }
}
