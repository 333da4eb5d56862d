//! Server-side ability RPCs and state mirrors
//!
//! Client ability messages are applied to the pawn's authoritative `AbilitySystemComponent`;
//! what the component queues for the owning client is sent back over the reliable channel.

use bevy::prelude::*;
use lightyear::prelude::*;
use lightyear::prelude::server::*;
use std::collections::HashSet;

use shared::ability::{AbilityNotification, AbilitySystemComponent, ActivationEnv, AnimationHost};
use shared::attributes::AttributeEvent;
use shared::equipment::{EquipmentManager, QuickBar, ReplicatedEquipment, ReplicatedQuickBar};
use shared::inventory::{InventoryManager, ReplicatedInventory};
use shared::{
    AbilityInputTag, ClientAbilityFailed, ClientAbilityGranted, ClientAbilityRemoved, ClientPredictionAccepted,
    ClientPredictionRejected, HealthAttributes, NetActor, ReliableChannel, ReplicatedMontages, ServerAbilityInputEvent,
    ServerCurrentMontageRpc, ServerEndAbility, ServerTryActivateAbility,
};

use crate::systems::GrantedAbilityMirror;

/// Notification handling can queue more notifications (a death event activating an ability);
/// drain at most this many rounds per tick.
const MAX_NOTIFICATION_PASSES: usize = 4;

/// Input tags forwarded by clients. Predicted abilities are ignored here, they arrive as
/// `ServerTryActivateAbility`.
pub fn handle_ability_input_tags(
    mut client_links: Query<(Entity, &mut MessageReceiver<AbilityInputTag>), With<ClientOf>>,
    mut pawns: Query<(&ControlledBy, &mut AbilitySystemComponent)>,
) {
    for (link, mut receiver) in client_links.iter_mut() {
        for message in receiver.receive() {
            let Some((_, mut asc)) = pawns.iter_mut().find(|(owner, _)| owner.owner == link) else {
                continue;
            };
            asc.server_ability_input_tag(&message.tag, message.pressed);
        }
    }
}

/// Activate what the server-executed input tags asked for.
pub fn process_server_ability_input(mut pawns: Query<(&mut AbilitySystemComponent, &mut InventoryManager)>) {
    for (mut asc, mut inventory) in pawns.iter_mut() {
        asc.process_ability_input(false, &mut ActivationEnv::with_items(&mut *inventory));
    }
}

/// Follow a client's predicted activation. The verdict goes back through the component's
/// notifications; an unknown ability is rejected right away.
pub fn handle_try_activate(
    mut client_links: Query<
        (
            Entity,
            &mut MessageReceiver<ServerTryActivateAbility>,
            &mut MessageSender<ClientPredictionRejected>,
        ),
        With<ClientOf>,
    >,
    mut pawns: Query<(&ControlledBy, &mut AbilitySystemComponent, &mut InventoryManager)>,
) {
    for (link, mut receiver, mut rejected) in client_links.iter_mut() {
        for message in receiver.receive() {
            let Some((_, mut asc, mut inventory)) = pawns.iter_mut().find(|(owner, ..)| owner.owner == link) else {
                continue;
            };
            let Some(handle) = asc.find_ability_spec_handle_for_id(&message.ability_class_path, None) else {
                warn!("Client asked to activate {} which the pawn does not have", message.ability_class_path);
                rejected.send::<ReliableChannel>(ClientPredictionRejected {
                    prediction_key: message.prediction_key,
                });
                continue;
            };
            let mut env = ActivationEnv::with_items(&mut *inventory);
            if let Err(tags) = asc.server_try_activate_ability(handle, message.prediction_key, &mut env) {
                debug!("Predicted {} refused: {:?}", message.ability_class_path, tags);
            }
        }
    }
}

pub fn handle_ability_input_events(
    mut client_links: Query<(Entity, &mut MessageReceiver<ServerAbilityInputEvent>), With<ClientOf>>,
    mut pawns: Query<(&ControlledBy, &mut AbilitySystemComponent)>,
) {
    for (link, mut receiver) in client_links.iter_mut() {
        for message in receiver.receive() {
            let Some((_, mut asc)) = pawns.iter_mut().find(|(owner, _)| owner.owner == link) else {
                continue;
            };
            if let Some(handle) = asc.find_ability_spec_handle_for_id(&message.ability_class_path, None) {
                asc.invoke_replicated_input_event(handle, message.pressed);
            }
        }
    }
}

/// The client ended or cancelled a predicted ability; do the same here.
pub fn handle_end_ability(
    mut client_links: Query<(Entity, &mut MessageReceiver<ServerEndAbility>), With<ClientOf>>,
    mut pawns: Query<(&ControlledBy, &mut AbilitySystemComponent)>,
) {
    for (link, mut receiver) in client_links.iter_mut() {
        for message in receiver.receive() {
            let Some((_, mut asc)) = pawns.iter_mut().find(|(owner, _)| owner.owner == link) else {
                continue;
            };
            end_ability_by_id(&mut asc, &message);
        }
    }
}

pub fn end_ability_by_id(asc: &mut AbilitySystemComponent, message: &ServerEndAbility) {
    if message.was_cancelled {
        asc.try_cancel_ability_by_id(&message.ability_class_path);
        return;
    }
    let Some(handle) = asc.find_ability_spec_handle_for_id(&message.ability_class_path, None) else {
        return;
    };
    let running: Vec<_> = asc
        .find_spec(handle)
        .map(|s| s.active_instances().map(|i| i.id).collect())
        .unwrap_or_default();
    for instance in running {
        asc.end_ability(handle, instance);
    }
}

/// Section and play-rate changes of the owner's predicted montages.
pub fn handle_montage_rpcs(
    mut client_links: Query<(Entity, &mut MessageReceiver<ServerCurrentMontageRpc>), With<ClientOf>>,
    mut pawns: Query<(&ControlledBy, &mut AbilitySystemComponent, &mut AnimationHost)>,
) {
    for (link, mut receiver) in client_links.iter_mut() {
        for ServerCurrentMontageRpc(rpc) in receiver.receive() {
            let Some((_, mut asc, mut host)) = pawns.iter_mut().find(|(owner, ..)| owner.owner == link) else {
                continue;
            };
            let Some(anim) = host.anim_instance_mut(rpc.mesh()) else {
                warn!("Montage RPC for unknown mesh {}", rpc.mesh());
                continue;
            };
            asc.server_handle_montage_rpc(&rpc, anim);
        }
    }
}

/// Messages for the owning client produced by one drain of an ability system.
#[derive(Default, Debug)]
pub struct OwnerMessages {
    pub failed: Vec<ClientAbilityFailed>,
    pub rejected: Vec<ClientPredictionRejected>,
    pub accepted: Vec<ClientPredictionAccepted>,
}

/// Drain `asc` until quiet: collect what the owner must hear and start death on empty health.
pub fn process_notifications(asc: &mut AbilitySystemComponent, env: &mut ActivationEnv<'_>) -> OwnerMessages {
    let mut out = OwnerMessages::default();
    for _ in 0..MAX_NOTIFICATION_PASSES {
        let notifications = asc.drain_notifications();
        if notifications.is_empty() {
            break;
        }
        for notification in notifications {
            match notification {
                AbilityNotification::ClientAbilityFailed {
                    definition_id,
                    failure_tags,
                } => out.failed.push(ClientAbilityFailed {
                    ability_class_path: definition_id,
                    failure_tags,
                }),
                AbilityNotification::ClientPredictionRejected { prediction_key } => {
                    out.rejected.push(ClientPredictionRejected { prediction_key })
                }
                AbilityNotification::ClientPredictionAccepted { prediction_key } => {
                    out.accepted.push(ClientPredictionAccepted { prediction_key })
                }
                AbilityNotification::Attribute(AttributeEvent::OutOfHealth {
                    instigator, magnitude, ..
                }) => {
                    let triggered = asc.handle_out_of_health(instigator, magnitude, env);
                    if triggered == 0 {
                        warn!("Out of health but no death ability responded");
                    }
                }
                _ => {}
            }
        }
    }
    out
}

#[allow(clippy::type_complexity)]
pub fn dispatch_ability_notifications(
    mut owners: Query<
        (
            &mut MessageSender<ClientAbilityFailed>,
            &mut MessageSender<ClientPredictionRejected>,
            &mut MessageSender<ClientPredictionAccepted>,
        ),
        With<ClientOf>,
    >,
    mut ascs: Query<(
        &NetActor,
        &mut AbilitySystemComponent,
        Option<&ControlledBy>,
        Option<&mut InventoryManager>,
    )>,
) {
    for (actor, mut asc, owner, inventory) in ascs.iter_mut() {
        let messages = match inventory {
            Some(mut inventory) => process_notifications(&mut asc, &mut ActivationEnv::with_items(&mut *inventory)),
            None => process_notifications(&mut asc, &mut ActivationEnv::none()),
        };
        let Some(owner) = owner else {
            continue;
        };
        let Ok((mut failed, mut rejected, mut accepted)) = owners.get_mut(owner.owner) else {
            if !messages.failed.is_empty() {
                debug!("Actor {} has no owner link for its ability messages", actor.0);
            }
            continue;
        };
        for m in messages.failed {
            failed.send::<ReliableChannel>(m);
        }
        for m in messages.rejected {
            rejected.send::<ReliableChannel>(m);
        }
        for m in messages.accepted {
            accepted.send::<ReliableChannel>(m);
        }
    }
}

/// Specs the owning client does not know about yet, and handles it should drop.
pub fn granted_ability_diff(
    asc: &AbilitySystemComponent,
    mirror: &mut GrantedAbilityMirror,
) -> (Vec<ClientAbilityGranted>, Vec<ClientAbilityRemoved>) {
    let live: HashSet<_> = asc.specs().iter().filter(|s| !s.pending_remove).map(|s| s.handle).collect();
    let granted = asc
        .specs()
        .iter()
        .filter(|s| !s.pending_remove && !mirror.0.contains(&s.handle))
        .map(|s| ClientAbilityGranted {
            handle: s.handle,
            ability_class_path: s.definition.id.clone(),
            level: s.level,
            dynamic_source_tags: s.dynamic_source_tags.clone(),
            source: s.source,
        })
        .collect();
    let mut removed: Vec<_> = mirror
        .0
        .difference(&live)
        .map(|&handle| ClientAbilityRemoved { handle })
        .collect();
    removed.sort_by_key(|r| r.handle);
    mirror.0 = live;
    (granted, removed)
}

pub fn sync_granted_abilities(
    mut owners: Query<
        (
            &mut MessageSender<ClientAbilityGranted>,
            &mut MessageSender<ClientAbilityRemoved>,
        ),
        With<ClientOf>,
    >,
    mut pawns: Query<(&ControlledBy, &AbilitySystemComponent, &mut GrantedAbilityMirror)>,
) {
    for (owner, asc, mut mirror) in pawns.iter_mut() {
        let Ok((mut granted_sender, mut removed_sender)) = owners.get_mut(owner.owner) else {
            continue;
        };
        let (granted, removed) = granted_ability_diff(asc, &mut mirror);
        // Removals first so a re-grant under the same definition lands cleanly
        for m in removed {
            removed_sender.send::<ReliableChannel>(m);
        }
        for m in granted {
            granted_sender.send::<ReliableChannel>(m);
        }
    }
}

/// Copy health and montage records into their replicated components.
pub fn sync_ability_state(
    mut actors: Query<(
        &mut AbilitySystemComponent,
        &mut HealthAttributes,
        Option<&mut ReplicatedMontages>,
    )>,
) {
    for (mut asc, mut health, montages) in actors.iter_mut() {
        if let Some(fresh) = HealthAttributes::from_asc(&asc) {
            health.set_if_neq(fresh);
        }
        if let Some(mut montages) = montages {
            if asc.take_replicated_montages_dirty() {
                montages.0 = asc.replicated_montages().to_vec();
            }
        }
    }
}

/// Copy inventory, quick bar and equipment into their replicated components.
#[allow(clippy::type_complexity)]
pub fn sync_equipment_state(
    mut pawns: Query<(
        &InventoryManager,
        &mut ReplicatedInventory,
        &QuickBar,
        &mut ReplicatedQuickBar,
        &mut EquipmentManager,
        &mut ReplicatedEquipment,
    )>,
) {
    for (inventory, mut rep_inventory, quickbar, mut rep_quickbar, mut equipment, mut rep_equipment) in
        pawns.iter_mut()
    {
        rep_inventory.set_if_neq(inventory.replicated());
        rep_quickbar.set_if_neq(quickbar.replicated());
        equipment.bypass_change_detection().refresh_replicated();
        rep_equipment.set_if_neq(equipment.replicated());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::ability::{AbilitySource, AvatarInfo, DeathState, NetRole, PredictionKey, DEATH_ABILITY_ID};
    use shared::game_data::GameData;
    use shared::weapons::hitscan::{apply_pending_damage, PendingDamage};

    fn data() -> GameData {
        GameData::load_from_dir(concat!(env!("CARGO_MANIFEST_DIR"), "/../assets/data"))
    }

    fn pawn_asc(data: &GameData, set: &str) -> AbilitySystemComponent {
        let mut asc = AbilitySystemComponent::new(NetRole::Authority, false).with_player_id(5);
        let set = data.ability_sets.get_cached_item(set).unwrap();
        set.give_to_ability_system(&mut asc, None, AbilitySource::default(), &data.ability_set_sources(), &mut ActivationEnv::none());
        asc.set_avatar(AvatarInfo::new(2), &mut ActivationEnv::none());
        asc
    }

    #[test]
    fn test_predicted_activation_is_accepted() {
        let data = data();
        let mut asc = pawn_asc(&data, "AbilitySet_Pawn");
        asc.drain_notifications();
        let handle = asc.find_ability_spec_handle_for_id("GA_Crouch", None).unwrap();
        asc.server_try_activate_ability(handle, PredictionKey(8), &mut ActivationEnv::none()).unwrap();

        let out = process_notifications(&mut asc, &mut ActivationEnv::none());
        assert_eq!(out.accepted, vec![ClientPredictionAccepted { prediction_key: PredictionKey(8) }]);
        assert!(out.rejected.is_empty());
    }

    #[test]
    fn test_out_of_health_starts_death() {
        let data = data();
        let mut asc = pawn_asc(&data, "AbilitySet_TrainingDummy");
        let lethal = PendingDamage {
            target: 2,
            damage: 500.0,
            hit_zone: None,
            distance: 1.0,
            cartridge_id: 3,
        };
        apply_pending_damage(&mut asc, &lethal, 1, 1);
        process_notifications(&mut asc, &mut ActivationEnv::none());

        assert_eq!(asc.death_state(), DeathState::DeathStarted);
        let death = asc.find_ability_spec_handle_for_id(DEATH_ABILITY_ID, None).unwrap();
        assert!(asc.find_spec(death).unwrap().is_active());
    }

    #[test]
    fn test_end_ability_message_ends_running_instances() {
        let data = data();
        let mut asc = pawn_asc(&data, "AbilitySet_Pawn");
        let handle = asc.find_ability_spec_handle_for_id("GA_Crouch", None).unwrap();
        asc.server_try_activate_ability(handle, PredictionKey(2), &mut ActivationEnv::none()).unwrap();
        assert!(asc.find_spec(handle).unwrap().is_active());

        end_ability_by_id(
            &mut asc,
            &ServerEndAbility {
                ability_class_path: "GA_Crouch".into(),
                was_cancelled: false,
            },
        );
        assert!(!asc.find_spec(handle).unwrap().is_active());
    }

    #[test]
    fn test_granted_diff_reports_each_spec_once() {
        let data = data();
        let mut asc = pawn_asc(&data, "AbilitySet_Pawn");
        let mut mirror = GrantedAbilityMirror::default();

        let (granted, removed) = granted_ability_diff(&asc, &mut mirror);
        assert_eq!(granted.len(), asc.specs().len());
        assert!(removed.is_empty());
        assert!(granted.iter().any(|g| g.ability_class_path == "GA_Crouch"));

        let (granted, _) = granted_ability_diff(&asc, &mut mirror);
        assert!(granted.is_empty());

        let crouch = asc.find_ability_spec_handle_for_id("GA_Crouch", None).unwrap();
        asc.clear_ability(crouch);
        let (_, removed) = granted_ability_diff(&asc, &mut mirror);
        assert_eq!(removed, vec![ClientAbilityRemoved { handle: crouch }]);
    }
}
