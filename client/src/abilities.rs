//! Owning-client side of the ability system
//!
//! The local pawn's `AbilitySystemComponent` is an autonomous proxy: it mirrors the specs the
//! server grants, predicts activations from local input and forwards what the server has to
//! follow. Server verdicts come back here.

use bevy::prelude::*;
use lightyear::prelude::*;

use shared::ability::{
    AbilityNotification, AbilitySimpleFailureMessage, AbilitySpec, AbilitySpecHandle, AbilitySystemComponent,
    ActivationEnv, AnimationHost,
};
use shared::game_data::GameData;
use shared::inventory::InventoryManager;
use shared::message_bus::{GameplayMessageBus, MessageInbox, MessageMatch};
use shared::tags::{names, tag};
use shared::{
    ClientAbilityFailed, ClientAbilityGranted, ClientAbilityRemoved, ClientPredictionAccepted,
    ClientPredictionRejected, LocalPlayer, ReliableChannel, ServerAbilityInputEvent, ServerCurrentMontageRpc,
    ServerEndAbility, ServerTryActivateAbility,
};

use crate::states::GameState;

/// Seconds a failure reason stays on the HUD.
pub const FAILURE_MESSAGE_TIME: f64 = 2.0;

/// Notifications drained from the local ability system this tick.
#[derive(Component, Default, Debug)]
pub struct LocalNotifications(pub Vec<AbilityNotification>);

/// Grant changes that arrived before the local pawn could take them.
#[derive(Resource, Default, Debug)]
pub struct PendingGrants {
    pub granted: Vec<ClientAbilityGranted>,
    pub removed: Vec<AbilitySpecHandle>,
}

impl PendingGrants {
    pub fn is_empty(&self) -> bool {
        self.granted.is_empty() && self.removed.is_empty()
    }
}

/// User-facing activation failures broadcast on the message bus.
#[derive(Resource)]
pub struct AbilityFailureFeed {
    inbox: MessageInbox<AbilitySimpleFailureMessage>,
    pub latest: Option<(String, f64)>,
}

impl AbilityFailureFeed {
    /// Text to show at `now`, if the last failure is recent enough.
    pub fn current(&self, now: f64) -> Option<&str> {
        self.latest
            .as_ref()
            .filter(|(_, at)| now - at < FAILURE_MESSAGE_TIME)
            .map(|(text, _)| text.as_str())
    }
}

pub fn setup_failure_feed(mut commands: Commands, bus: Res<GameplayMessageBus>) {
    let (_handle, inbox) = bus.register_inbox::<AbilitySimpleFailureMessage>(
        tag(names::ABILITY_INTERACTION_UPDATE_INTERACTIONS),
        MessageMatch::ExactMatch,
    );
    commands.insert_resource(AbilityFailureFeed { inbox, latest: None });
}

pub fn collect_failure_messages(time: Res<Time>, mut feed: ResMut<AbilityFailureFeed>) {
    for (_, message) in feed.inbox.drain() {
        info!("Ability failed: {}", message.user_facing_reason);
        feed.latest = Some((message.user_facing_reason, time.elapsed_secs_f64()));
    }
}

// =============================================================================
// GRANTS
// =============================================================================

/// Apply queued removals, then grants. Grants for abilities missing from the local registry
/// are dropped with a warning.
pub fn apply_grant_changes(asc: &mut AbilitySystemComponent, data: &GameData, pending: &mut PendingGrants) {
    for handle in pending.removed.drain(..) {
        pending.granted.retain(|g| g.handle != handle);
        asc.remove_mirrored_spec(handle);
        debug!("Ability {:?} removed", handle);
    }
    for grant in pending.granted.drain(..) {
        let Some(definition) = data.abilities.get_cached_item(&grant.ability_class_path) else {
            warn!("Granted ability {} is not in the local registry", grant.ability_class_path);
            continue;
        };
        let mut spec = AbilitySpec::new(definition, grant.level).with_source(grant.source);
        spec.dynamic_source_tags = grant.dynamic_source_tags;
        asc.mirror_granted_spec(spec, grant.handle);
        debug!("Ability {} granted as {:?}", grant.ability_class_path, grant.handle);
    }
}

/// Mirror server grants onto the local pawn, buffering until it exists.
pub fn receive_ability_grants(
    data: Res<GameData>,
    mut pending: ResMut<PendingGrants>,
    mut client_query: Query<
        (&mut MessageReceiver<ClientAbilityGranted>, &mut MessageReceiver<ClientAbilityRemoved>),
        With<crate::GameClient>,
    >,
    mut local: Query<&mut AbilitySystemComponent, With<LocalPlayer>>,
) {
    if let Ok((mut granted, mut removed)) = client_query.single_mut() {
        pending.removed.extend(removed.receive().map(|m| m.handle));
        pending.granted.extend(granted.receive());
    }
    if pending.is_empty() {
        return;
    }
    let Ok(mut asc) = local.single_mut() else {
        return;
    };
    apply_grant_changes(&mut asc, &data, &mut pending);
}

// =============================================================================
// LOCAL PREDICTION
// =============================================================================

/// Activate what local input asked for and keep the notifications for this tick's forwarding
/// and firing.
pub fn process_local_ability_input(
    game_state: Res<State<GameState>>,
    mut local: Query<
        (&mut AbilitySystemComponent, &mut InventoryManager, &mut LocalNotifications),
        With<LocalPlayer>,
    >,
) {
    let paused = game_state.get() == &GameState::Paused;
    for (mut asc, mut inventory, mut notifications) in local.iter_mut() {
        asc.process_ability_input(paused, &mut ActivationEnv::with_items(&mut *inventory));
        notifications.0 = asc.drain_notifications();
    }
}

/// Send the server what it must follow: predicted activations, input events, ends and montage
/// changes.
#[allow(clippy::type_complexity)]
pub fn forward_ability_notifications(
    local: Query<&LocalNotifications, With<LocalPlayer>>,
    mut client_query: Query<
        (
            &mut MessageSender<ServerTryActivateAbility>,
            &mut MessageSender<ServerAbilityInputEvent>,
            &mut MessageSender<ServerEndAbility>,
            &mut MessageSender<ServerCurrentMontageRpc>,
        ),
        (With<crate::GameClient>, With<Connected>),
    >,
) {
    let Ok(notifications) = local.single() else {
        return;
    };
    let Ok((mut activate, mut input, mut end, mut montage)) = client_query.single_mut() else {
        return;
    };

    for notification in &notifications.0 {
        match notification {
            AbilityNotification::ServerTryActivate {
                definition_id,
                prediction_key,
            } => {
                activate.send::<ReliableChannel>(ServerTryActivateAbility {
                    ability_class_path: definition_id.clone(),
                    prediction_key: *prediction_key,
                });
            }
            AbilityNotification::ServerInputEvent { definition_id, pressed } => {
                input.send::<ReliableChannel>(ServerAbilityInputEvent {
                    ability_class_path: definition_id.clone(),
                    pressed: *pressed,
                });
            }
            AbilityNotification::ReplicateEnd {
                definition_id,
                was_cancelled,
            } => {
                end.send::<ReliableChannel>(ServerEndAbility {
                    ability_class_path: definition_id.clone(),
                    was_cancelled: *was_cancelled,
                });
            }
            AbilityNotification::ServerMontage(rpc) => {
                montage.send::<ReliableChannel>(ServerCurrentMontageRpc(rpc.clone()));
            }
            _ => {}
        }
    }
}

// =============================================================================
// SERVER VERDICTS
// =============================================================================

/// Undo a rejected prediction: end its instances and fade the montages it started.
pub fn reject_prediction(asc: &mut AbilitySystemComponent, host: &mut AnimationHost, message: &ClientPredictionRejected) {
    let montages = asc.on_prediction_key_rejected(message.prediction_key);
    for (mesh, montage_id) in montages {
        if let Some(anim) = host.anim_instance_mut(&mesh) {
            asc.fade_out_rejected_montage(&mesh, anim, &montage_id);
        }
    }
}

#[allow(clippy::type_complexity)]
pub fn receive_ability_verdicts(
    mut client_query: Query<
        (
            &mut MessageReceiver<ClientAbilityFailed>,
            &mut MessageReceiver<ClientPredictionRejected>,
            &mut MessageReceiver<ClientPredictionAccepted>,
        ),
        With<crate::GameClient>,
    >,
    mut local: Query<(&mut AbilitySystemComponent, &mut AnimationHost), With<LocalPlayer>>,
) {
    let Ok((mut failed, mut rejected, mut accepted)) = client_query.single_mut() else {
        return;
    };
    let Ok((mut asc, mut host)) = local.single_mut() else {
        // Nothing predicted yet; drop stale verdicts.
        failed.receive().for_each(drop);
        rejected.receive().for_each(drop);
        accepted.receive().for_each(drop);
        return;
    };

    for message in failed.receive() {
        asc.client_ability_failed(&message.ability_class_path, &message.failure_tags);
    }
    for message in rejected.receive() {
        warn!("Server rejected prediction {:?}", message.prediction_key);
        reject_prediction(&mut asc, &mut host, &message);
    }
    for message in accepted.receive() {
        asc.on_prediction_key_accepted(message.prediction_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::ability::{AbilitySource, AvatarInfo, NetRole};
    use shared::tags::GameplayTagContainer;

    fn data() -> GameData {
        GameData::load_from_dir(concat!(env!("CARGO_MANIFEST_DIR"), "/../assets/data"))
    }

    fn grant(handle: u32, path: &str, input_tag: &str) -> ClientAbilityGranted {
        ClientAbilityGranted {
            handle: AbilitySpecHandle(handle),
            ability_class_path: path.to_string(),
            level: 1,
            dynamic_source_tags: GameplayTagContainer::from_tag(tag(input_tag)),
            source: AbilitySource::default(),
        }
    }

    fn local_asc() -> AbilitySystemComponent {
        let mut asc = AbilitySystemComponent::new(NetRole::AutonomousProxy, true).with_player_id(7);
        asc.set_avatar(AvatarInfo::new(3), &mut ActivationEnv::none());
        asc
    }

    #[test]
    fn test_grants_keep_server_handles() {
        let data = data();
        let mut asc = local_asc();
        let mut pending = PendingGrants::default();
        pending.granted.push(grant(12, "GA_Crouch", names::INPUT_TAG_CROUCH));

        apply_grant_changes(&mut asc, &data, &mut pending);

        assert!(pending.is_empty());
        assert_eq!(asc.find_ability_spec_handle_for_id("GA_Crouch", None), Some(AbilitySpecHandle(12)));
    }

    #[test]
    fn test_removal_cancels_a_buffered_grant() {
        let data = data();
        let mut asc = local_asc();
        let mut pending = PendingGrants::default();
        pending.granted.push(grant(4, "GA_Emote_Wave", names::INPUT_TAG_EMOTE));
        pending.removed.push(AbilitySpecHandle(4));

        apply_grant_changes(&mut asc, &data, &mut pending);

        assert!(asc.find_ability_spec_handle_for_id("GA_Emote_Wave", None).is_none());
    }

    #[test]
    fn test_unknown_grant_is_dropped() {
        let data = data();
        let mut asc = local_asc();
        let mut pending = PendingGrants::default();
        pending.granted.push(grant(1, "GA_DoesNotExist", names::INPUT_TAG_EMOTE));

        apply_grant_changes(&mut asc, &data, &mut pending);

        assert!(asc.specs().is_empty());
    }

    #[test]
    fn test_predicted_crouch_asks_the_server() {
        let data = data();
        let mut asc = local_asc();
        let mut pending = PendingGrants::default();
        pending.granted.push(grant(2, "GA_Crouch", names::INPUT_TAG_CROUCH));
        apply_grant_changes(&mut asc, &data, &mut pending);

        asc.ability_input_tag_pressed(&tag(names::INPUT_TAG_CROUCH));
        asc.process_ability_input(false, &mut ActivationEnv::none());

        let notifications = asc.drain_notifications();
        let key = notifications.iter().find_map(|n| match n {
            AbilityNotification::ServerTryActivate {
                definition_id,
                prediction_key,
            } if definition_id == "GA_Crouch" => Some(*prediction_key),
            _ => None,
        });
        let key = key.expect("crouch is predicted");

        let mut host = AnimationHost::with_meshes(shared::PAWN_MESHES);
        reject_prediction(&mut asc, &mut host, &ClientPredictionRejected { prediction_key: key });
        let handle = asc.find_ability_spec_handle_for_id("GA_Crouch", None).unwrap();
        assert!(!asc.find_spec(handle).unwrap().is_active());
    }

    #[test]
    fn test_failure_text_expires() {
        let bus = GameplayMessageBus::new();
        let (_handle, inbox) = bus.register_inbox::<AbilitySimpleFailureMessage>(
            tag(names::ABILITY_INTERACTION_UPDATE_INTERACTIONS),
            MessageMatch::ExactMatch,
        );
        let feed = AbilityFailureFeed {
            inbox,
            latest: Some(("Out of ammo".to_string(), 10.0)),
        };
        assert_eq!(feed.current(11.0), Some("Out of ammo"));
        assert_eq!(feed.current(10.0 + FAILURE_MESSAGE_TIME + 0.1), None);
    }
}
