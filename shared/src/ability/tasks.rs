//! Ability tasks
//!
//! Cooperative state machines owned by a running ability instance. They never block: the
//! ability system drives them from `tick_montage_tasks` and from gameplay events, and their
//! results surface as `AbilityNotification::MontageTask`.

use bevy::prelude::*;

use super::asc::{AbilityNotification, AbilitySystemComponent};
use super::montage::{AnimInstance, AnimMontage, AnimationHost, MontageEvent};
use super::spec::{AbilitySpecHandle, GameplayEventData, InstanceBehavior, InstanceId};
use crate::data_registry::DataRegistry;
use crate::tags::{GameplayTag, GameplayTagContainer};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MontageTaskState {
    #[default]
    Pending,
    Playing,
    Finished,
}

#[derive(Clone, Debug, PartialEq)]
pub enum MontageTaskOutcome {
    Completed,
    BlendOut,
    Interrupted,
    Cancelled,
    EventReceived { event_tag: GameplayTag, data: GameplayEventData },
}

/// Play a montage on one mesh and wait for it to finish or for a matching gameplay event.
#[derive(Clone, Debug)]
pub struct PlayMontageTask {
    pub mesh: String,
    pub montage_id: String,
    pub rate: f32,
    /// Empty matches every event.
    pub event_tags: GameplayTagContainer,
    pub start_section: Option<String>,
    pub stop_when_ability_ends: bool,
    pub override_blend_out: Option<f32>,
    state: MontageTaskState,
    play_serial: u32,
    interrupted: bool,
    outcomes: Vec<MontageTaskOutcome>,
}

impl PlayMontageTask {
    pub fn new(mesh: String, montage_id: String, rate: f32, event_tags: GameplayTagContainer) -> Self {
        Self {
            mesh,
            montage_id,
            rate,
            event_tags,
            start_section: None,
            stop_when_ability_ends: true,
            override_blend_out: None,
            state: MontageTaskState::Pending,
            play_serial: 0,
            interrupted: false,
            outcomes: Vec::new(),
        }
    }

    pub fn state(&self) -> MontageTaskState {
        self.state
    }

    pub fn is_playing(&self) -> bool {
        self.state == MontageTaskState::Playing
    }

    pub fn on_gameplay_event(&mut self, event_tag: &GameplayTag, data: &GameplayEventData) {
        if self.state == MontageTaskState::Finished {
            return;
        }
        if self.event_tags.is_empty() || self.event_tags.iter().any(|t| event_tag.matches_tag(t)) {
            self.outcomes.push(MontageTaskOutcome::EventReceived {
                event_tag: event_tag.clone(),
                data: data.clone(),
            });
        }
    }

    fn finish(&mut self, outcome: MontageTaskOutcome) {
        self.outcomes.push(outcome);
        self.state = MontageTaskState::Finished;
    }

    fn take_outcomes(&mut self) -> Vec<MontageTaskOutcome> {
        std::mem::take(&mut self.outcomes)
    }

    /// Apply one anim event; returns true when the task is done.
    fn on_montage_event(&mut self, event: &MontageEvent) -> bool {
        if self.state != MontageTaskState::Playing || event.serial() != self.play_serial {
            return false;
        }
        match event {
            MontageEvent::BlendingOut { interrupted, .. } => {
                self.interrupted = *interrupted;
                self.outcomes.push(if *interrupted {
                    MontageTaskOutcome::Interrupted
                } else {
                    MontageTaskOutcome::BlendOut
                });
                false
            }
            MontageEvent::Ended { interrupted, .. } => {
                if !*interrupted && !self.interrupted {
                    self.outcomes.push(MontageTaskOutcome::Completed);
                }
                self.state = MontageTaskState::Finished;
                true
            }
        }
    }
}

/// A montage that must be stopped because its ability ended.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct PendingMontageStop {
    pub mesh: String,
    pub montage_id: String,
    pub blend_out: Option<f32>,
}

impl AbilitySystemComponent {
    /// Called when an instance owning `task` ends.
    pub(crate) fn on_montage_task_destroyed(
        &mut self,
        handle: AbilitySpecHandle,
        instance: InstanceId,
        task: PlayMontageTask,
        was_cancelled: bool,
    ) {
        if task.state == MontageTaskState::Finished {
            return;
        }
        if was_cancelled {
            if task.is_playing() {
                self.pending_montage_stops.push(PendingMontageStop {
                    mesh: task.mesh.clone(),
                    montage_id: task.montage_id.clone(),
                    blend_out: task.override_blend_out,
                });
            }
            self.notify(AbilityNotification::MontageTask {
                handle,
                instance,
                outcome: MontageTaskOutcome::Cancelled,
            });
        } else if task.is_playing() && task.stop_when_ability_ends {
            self.pending_montage_stops.push(PendingMontageStop {
                mesh: task.mesh,
                montage_id: task.montage_id,
                blend_out: None,
            });
        }
    }

    /// Start pending montage tasks, feed anim events to playing ones and end abilities whose
    /// task finished.
    pub fn tick_montage_tasks(&mut self, host: &mut AnimationHost, montages: &DataRegistry<AnimMontage>) {
        for stop in std::mem::take(&mut self.pending_montage_stops) {
            if let Some(anim) = host.anim_instance_mut(&stop.mesh) {
                self.stop_montage_if_current_for_mesh(&stop.mesh, anim, &stop.montage_id, stop.blend_out);
            }
        }

        let events = host.drain_all_events();
        let running: Vec<(AbilitySpecHandle, InstanceId, PlayMontageTask)> = self
            .specs()
            .iter()
            .flat_map(|s| {
                s.active_instances().filter_map(move |i| match &i.behavior {
                    InstanceBehavior::Montage(task) => Some((s.handle, i.id, task.clone())),
                    _ => None,
                })
            })
            .collect();

        let mut to_end = Vec::new();
        for (handle, instance, mut task) in running {
            match task.state {
                MontageTaskState::Pending => {
                    let Some(anim) = host.anim_instance_mut(&task.mesh) else {
                        error!("PlayMontageTask: no mesh tagged {} on the avatar", task.mesh);
                        task.finish(MontageTaskOutcome::Cancelled);
                        to_end.push((handle, instance));
                        self.store_task(handle, instance, task);
                        continue;
                    };
                    let Some(montage) = montages.get_cached_item(&task.montage_id) else {
                        error!("PlayMontageTask: montage {} is not registered", task.montage_id);
                        task.finish(MontageTaskOutcome::Cancelled);
                        to_end.push((handle, instance));
                        self.store_task(handle, instance, task);
                        continue;
                    };
                    let duration = self.play_montage_for_mesh(
                        Some((handle, instance)),
                        &task.mesh,
                        anim,
                        montage,
                        task.rate,
                        task.start_section.as_deref(),
                        true,
                    );
                    if duration > 0.0 {
                        task.state = MontageTaskState::Playing;
                        task.play_serial = anim.play_serial();
                    } else {
                        task.finish(MontageTaskOutcome::Cancelled);
                        to_end.push((handle, instance));
                    }
                }
                MontageTaskState::Playing => {
                    let task_mesh = task.mesh.clone();
                    for (_, event) in events.iter().filter(|(mesh, _)| *mesh == task_mesh) {
                        if matches!(event, MontageEvent::BlendingOut { .. }) && event.serial() == task.play_serial {
                            self.clear_animating_ability(handle, instance);
                        }
                        if task.on_montage_event(event) {
                            to_end.push((handle, instance));
                            break;
                        }
                    }
                }
                MontageTaskState::Finished => {}
            }
            self.store_task(handle, instance, task);
        }

        for (handle, instance) in to_end {
            self.end_ability(handle, instance);
        }
    }

    /// Write a task back and publish its outcomes.
    fn store_task(&mut self, handle: AbilitySpecHandle, instance: InstanceId, mut task: PlayMontageTask) {
        let outcomes = task.take_outcomes();
        if let Some(InstanceBehavior::Montage(slot)) = self
            .find_spec_mut(handle)
            .and_then(|s| s.instance_mut(instance))
            .map(|i| &mut i.behavior)
        {
            *slot = task;
        }
        for outcome in outcomes {
            self.notify(AbilityNotification::MontageTask {
                handle,
                instance,
                outcome,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ability::asc::ActivationEnv;
    use crate::ability::definition::{AbilityDefinition, AbilityKind};
    use crate::ability::montage::{MontageSection, SimAnimInstance};
    use crate::ability::spec::AbilitySpec;
    use crate::tags::{tag, tag_container};
    use std::sync::Arc;

    fn setup() -> (AbilitySystemComponent, AbilitySpecHandle, AnimationHost, DataRegistry<AnimMontage>) {
        let mut asc = AbilitySystemComponent::default();
        let definition = AbilityDefinition::new("Emote").with_kind(AbilityKind::PlayMontage {
            mesh: "Body".into(),
            montage: "AM_Wave".into(),
            rate: 1.0,
            event_tags: tag_container(&["GameplayEvent.Montage"]),
        });
        let handle = asc.grant_ability(AbilitySpec::new(Arc::new(definition), 1), &mut ActivationEnv::none());
        let mut montages = DataRegistry::new();
        montages.insert(AnimMontage {
            id: "AM_Wave".into(),
            length: 1.0,
            sections: vec![MontageSection {
                name: "Default".into(),
                start_time: 0.0,
            }],
            blend_in: 0.0,
            blend_out: 0.2,
            notifies: Vec::new(),
        });
        (asc, handle, AnimationHost::with_meshes(&["Body"]), montages)
    }

    fn outcomes(asc: &mut AbilitySystemComponent) -> Vec<MontageTaskOutcome> {
        asc.drain_notifications()
            .into_iter()
            .filter_map(|n| match n {
                AbilityNotification::MontageTask { outcome, .. } => Some(outcome),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_montage_task_completes_and_ends_ability() {
        let (mut asc, handle, mut host, montages) = setup();
        asc.try_activate_ability(handle, &mut ActivationEnv::none()).unwrap();
        asc.tick_montage_tasks(&mut host, &montages);
        assert_eq!(host.anim_instance("Body").and_then(|a| a.active_montage_id()), Some("AM_Wave"));

        for _ in 0..15 {
            host.advance(0.1);
            asc.tick_montage_tasks(&mut host, &montages);
        }
        let got = outcomes(&mut asc);
        assert_eq!(got, vec![MontageTaskOutcome::BlendOut, MontageTaskOutcome::Completed]);
        assert!(!asc.find_spec(handle).unwrap().is_active());
    }

    #[test]
    fn test_montage_task_receives_matching_events() {
        let (mut asc, handle, mut host, montages) = setup();
        let env = &mut ActivationEnv::none();
        asc.try_activate_ability(handle, env).unwrap();
        asc.tick_montage_tasks(&mut host, &montages);
        asc.handle_gameplay_event(&tag("GameplayEvent.Montage.Hit"), GameplayEventData::default(), env);
        asc.handle_gameplay_event(&tag("GameplayEvent.Other"), GameplayEventData::default(), env);
        asc.tick_montage_tasks(&mut host, &montages);
        let got = outcomes(&mut asc);
        assert_eq!(got.len(), 1);
        assert!(matches!(&got[0], MontageTaskOutcome::EventReceived { event_tag, .. } if *event_tag == tag("GameplayEvent.Montage.Hit")));
    }

    #[test]
    fn test_cancel_stops_montage() {
        let (mut asc, handle, mut host, montages) = setup();
        let instance = asc.try_activate_ability(handle, &mut ActivationEnv::none()).unwrap();
        asc.tick_montage_tasks(&mut host, &montages);
        assert!(asc.cancel_ability_instance(handle, instance, false));
        assert!(outcomes(&mut asc).contains(&MontageTaskOutcome::Cancelled));
        asc.tick_montage_tasks(&mut host, &montages);
        assert!(host.anim_instance("Body").is_some_and(|a| a.is_montage_stopped()));
    }

    #[test]
    fn test_missing_mesh_cancels_task() {
        let (mut asc, handle, _, montages) = setup();
        let mut host = AnimationHost::with_meshes(&["Arms"]);
        asc.try_activate_ability(handle, &mut ActivationEnv::none()).unwrap();
        asc.tick_montage_tasks(&mut host, &montages);
        assert_eq!(outcomes(&mut asc), vec![MontageTaskOutcome::Cancelled]);
        assert!(!asc.find_spec(handle).unwrap().is_active());
    }

    #[test]
    fn test_interrupted_by_other_montage() {
        let (mut asc, handle, mut host, montages) = setup();
        asc.try_activate_ability(handle, &mut ActivationEnv::none()).unwrap();
        asc.tick_montage_tasks(&mut host, &montages);
        let other = montages.get_cached_item("AM_Wave").unwrap();
        let anim: &mut SimAnimInstance = host.anim_instance_mut("Body").unwrap();
        anim.montage_play(other, 1.0);
        asc.tick_montage_tasks(&mut host, &montages);
        assert_eq!(outcomes(&mut asc), vec![MontageTaskOutcome::Interrupted]);
        assert!(!asc.find_spec(handle).unwrap().is_active());
    }
}
