//! Hit-scan fire ability driver
//!
//! A `HitScanWeapon` ability does nothing on its own when it activates. This module gives each
//! running instance a `FireController`, feeds it the input and the clock, and hands every shot
//! back to the caller, which owns tracing and networking.

use super::firing::{FireController, FireEvents, FireTiming};
use super::instance::HitScanWeaponInstance;
use crate::ability::definition::AbilityKind;
use crate::ability::spec::InstanceBehavior;
use crate::ability::{AbilityNotification, AbilitySpecHandle, AbilitySystemComponent, InstanceId};
use crate::tags::{names, tag};

/// One shot the controller released.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WeaponShot {
    pub handle: AbilitySpecHandle,
    pub instance: InstanceId,
    pub time: f64,
    pub is_aiming: bool,
    pub is_crouching: bool,
}

/// An aim ability is running.
pub fn is_aiming(asc: &AbilitySystemComponent) -> bool {
    asc.specs()
        .iter()
        .any(|s| s.definition.kind == AbilityKind::Aim && s.is_active())
}

pub fn is_crouching(asc: &AbilitySystemComponent) -> bool {
    asc.has_matching_gameplay_tag(&tag(names::STATUS_CROUCHING))
}

fn is_fire_ability(asc: &AbilitySystemComponent, handle: AbilitySpecHandle) -> bool {
    asc.find_spec(handle)
        .is_some_and(|s| s.definition.kind == AbilityKind::HitScanWeapon)
}

fn controller_mut(
    asc: &mut AbilitySystemComponent,
    handle: AbilitySpecHandle,
    instance: InstanceId,
) -> Option<&mut FireController> {
    let inst = asc.find_spec_mut(handle)?.instance_mut(instance)?;
    match &mut inst.behavior {
        InstanceBehavior::Fire(controller) => Some(controller),
        _ => None,
    }
}

/// React to the notifications drained from `asc` this frame, then run every fire controller up
/// to `now`. Ability ends requested by the controllers are applied before returning.
pub fn drive_fire_abilities(
    asc: &mut AbilitySystemComponent,
    notifications: &[AbilityNotification],
    weapon: Option<&HitScanWeaponInstance>,
    now: f64,
) -> Vec<WeaponShot> {
    let mut shots = Vec::new();
    let mut to_end: Vec<(AbilitySpecHandle, InstanceId)> = Vec::new();

    let Some(weapon) = weapon else {
        // Nothing to fire with: running fire abilities end immediately.
        for n in notifications {
            if let AbilityNotification::Activated { handle, instance } = n {
                if is_fire_ability(asc, *handle) {
                    to_end.push((*handle, *instance));
                }
            }
        }
        for (handle, instance) in to_end {
            asc.end_ability(handle, instance);
        }
        return shots;
    };

    let timing = FireTiming::from_stats(weapon.computed_stats());
    let aiming = is_aiming(asc);
    let crouching = is_crouching(asc);

    let collect = |handle, instance, events: FireEvents, shots: &mut Vec<WeaponShot>, to_end: &mut Vec<_>| {
        shots.extend(events.shots.iter().map(|&time| WeaponShot {
            handle,
            instance,
            time,
            is_aiming: aiming,
            is_crouching: crouching,
        }));
        if events.end_ability {
            to_end.push((handle, instance));
        }
    };

    for n in notifications {
        match n {
            AbilityNotification::Activated { handle, instance } if is_fire_ability(asc, *handle) => {
                let Some(inst) = asc.find_spec_mut(*handle).and_then(|s| s.instance_mut(*instance)) else {
                    continue;
                };
                let mut controller = FireController::with_last_shot_time(weapon.last_fire_time());
                let events = controller.start_firing(aiming, crouching, now, &timing);
                inst.behavior = InstanceBehavior::Fire(controller);
                collect(*handle, *instance, events, &mut shots, &mut to_end);
            }
            AbilityNotification::InputReleased { handle, instance } => {
                if let Some(controller) = controller_mut(asc, *handle, *instance) {
                    let events = controller.stop_firing(true, &timing);
                    collect(*handle, *instance, events, &mut shots, &mut to_end);
                }
            }
            AbilityNotification::InputPressed { handle, instance } => {
                // Re-press while a burst or semi-auto cycle is still winding down.
                if let Some(controller) = controller_mut(asc, *handle, *instance) {
                    if !controller.is_firing() {
                        let events = controller.start_firing(aiming, crouching, now, &timing);
                        collect(*handle, *instance, events, &mut shots, &mut to_end);
                    }
                }
            }
            _ => {}
        }
    }

    let running: Vec<(AbilitySpecHandle, InstanceId)> = asc
        .specs()
        .iter()
        .filter(|s| s.definition.kind == AbilityKind::HitScanWeapon)
        .flat_map(|s| s.active_instances().map(move |i| (s.handle, i.id)))
        .collect();
    for (handle, instance) in running {
        if let Some(controller) = controller_mut(asc, handle, instance) {
            controller.set_aim_state(aiming, crouching);
            let events = controller.tick(now, &timing);
            collect(handle, instance, events, &mut shots, &mut to_end);
        }
    }

    for (handle, instance) in to_end {
        asc.end_ability(handle, instance);
    }
    shots
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ability::{AbilityDefinition, AbilitySpec, ActivationEnv, ActivationPolicy};
    use crate::weapons::{FireMode, HitScanWeaponStats};
    use std::sync::Arc;

    fn rifle(mode: FireMode) -> HitScanWeaponInstance {
        HitScanWeaponInstance::new(HitScanWeaponStats {
            fire_mode: mode,
            fire_rate: 600.0,
            ..Default::default()
        })
    }

    fn fire_asc() -> (AbilitySystemComponent, AbilitySpecHandle) {
        let mut asc = AbilitySystemComponent::default();
        let def = AbilityDefinition::new("GA_Weapon_Fire")
            .with_kind(AbilityKind::HitScanWeapon)
            .with_policy(ActivationPolicy::OnInputTriggered);
        let spec = AbilitySpec::new(Arc::new(def), 1).with_input_tag(tag(names::INPUT_TAG_WEAPON_FIRE));
        let handle = asc.grant_ability(spec, &mut ActivationEnv::none());
        (asc, handle)
    }

    fn press(asc: &mut AbilitySystemComponent, pressed: bool) -> Vec<AbilityNotification> {
        press_with_pause(asc, pressed, false)
    }

    fn press_with_pause(asc: &mut AbilitySystemComponent, pressed: bool, paused: bool) -> Vec<AbilityNotification> {
        let input = tag(names::INPUT_TAG_WEAPON_FIRE);
        if pressed {
            asc.ability_input_tag_pressed(&input);
        } else {
            asc.ability_input_tag_released(&input);
        }
        asc.process_ability_input(paused, &mut ActivationEnv::none());
        asc.drain_notifications()
    }

    #[test]
    fn test_auto_fires_while_held_and_ends_on_release() {
        let weapon = rifle(FireMode::Auto);
        let (mut asc, handle) = fire_asc();

        let n = press(&mut asc, true);
        let shots = drive_fire_abilities(&mut asc, &n, Some(&weapon), 0.0);
        assert_eq!(shots.len(), 1);
        assert!(asc.find_spec(handle).unwrap().is_active());

        let shots = drive_fire_abilities(&mut asc, &[], Some(&weapon), 0.25);
        assert_eq!(shots.len(), 2);

        let n = press(&mut asc, false);
        drive_fire_abilities(&mut asc, &n, Some(&weapon), 0.26);
        assert!(!asc.find_spec(handle).unwrap().is_active());
    }

    #[test]
    fn test_release_while_paused_stops_auto_fire() {
        let weapon = rifle(FireMode::Auto);
        let (mut asc, handle) = fire_asc();

        let n = press(&mut asc, true);
        assert_eq!(drive_fire_abilities(&mut asc, &n, Some(&weapon), 0.0).len(), 1);

        let n = press_with_pause(&mut asc, false, true);
        assert!(n
            .iter()
            .any(|n| matches!(n, AbilityNotification::InputReleased { handle: h, .. } if *h == handle)));
        drive_fire_abilities(&mut asc, &n, Some(&weapon), 0.01);

        assert!(drive_fire_abilities(&mut asc, &[], Some(&weapon), 2.0).is_empty());
        assert!(!asc.find_spec(handle).unwrap().is_active());
    }

    #[test]
    fn test_press_while_paused_starts_nothing() {
        let weapon = rifle(FireMode::Auto);
        let (mut asc, handle) = fire_asc();

        let n = press_with_pause(&mut asc, true, true);
        assert!(drive_fire_abilities(&mut asc, &n, Some(&weapon), 0.0).is_empty());
        assert!(!asc.find_spec(handle).unwrap().is_active());
    }

    #[test]
    fn test_no_weapon_ends_fire_ability() {
        let (mut asc, handle) = fire_asc();
        let n = press(&mut asc, true);
        let shots = drive_fire_abilities(&mut asc, &n, None, 0.0);
        assert!(shots.is_empty());
        assert!(!asc.find_spec(handle).unwrap().is_active());
    }

    #[test]
    fn test_reactivation_keeps_fire_rate() {
        let mut weapon = rifle(FireMode::SemiAuto);
        let (mut asc, _) = fire_asc();

        let n = press(&mut asc, true);
        let shots = drive_fire_abilities(&mut asc, &n, Some(&weapon), 1.0);
        assert_eq!(shots.len(), 1);
        weapon.on_fired(false, 1.0);
        let n = press(&mut asc, false);
        drive_fire_abilities(&mut asc, &n, Some(&weapon), 1.01);

        // Clicked again before the 0.1 s interval: the shot waits for the cooldown.
        let n = press(&mut asc, true);
        assert!(drive_fire_abilities(&mut asc, &n, Some(&weapon), 1.02).is_empty());
        let shots = drive_fire_abilities(&mut asc, &[], Some(&weapon), 1.2);
        assert_eq!(shots.len(), 1);
    }
}
