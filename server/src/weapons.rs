//! Server-side weapon systems
//!
//! Validates client target data, applies weapon damage, and runs quick bar and attachment
//! requests on the authoritative equipment.

use bevy::prelude::*;
use lightyear::prelude::*;
use lightyear::prelude::server::*;

use shared::ability::{AbilitySystemComponent, ActivationEnv, InstanceId};
use shared::equipment::{EquipmentActorRegistry, EquipmentContext, EquipmentInstanceId, EquipmentManager, QuickBar};
use shared::error::AttachmentError;
use shared::game_data::GameData;
use shared::inventory::InventoryManager;
use shared::team::TeamSubsystem;
use shared::weapons::attachments::{AttachmentContext, WeaponAttachmentComponent};
use shared::weapons::hitscan::{
    apply_pending_damage, commit_target_data, damage_from_target_data, validate_target_data, MaxRangeValidator,
    PendingDamage,
};
use shared::weapons::trace::ActorId;
use shared::{
    ApplyLoadoutRequest, AttachmentRequestResult, ClientConfirmTargetData, InstallAttachmentRequest, NetActor,
    PlayerPosition, ReliableChannel, SelectQuickbarSlot, ServerSetReplicatedTargetData, SetAttachmentTuningRequest,
    UninstallAttachmentRequest, WeaponStatsChanged, EYE_HEIGHT,
};

use crate::persistence::LoadoutStore;

/// Slack on the range check for movement between the client's shot and our check.
const HIT_RANGE_TOLERANCE: f32 = 2.0;

/// Damage from this tick's confirmed shots, applied after every shooter has been processed.
#[derive(Resource, Default)]
pub struct PendingWeaponDamage {
    pub hits: Vec<(ActorId, PendingDamage)>,
}

/// Validate, commit and turn one target data batch into damage.
///
/// Returns the confirmation for the shooter and the damage to deal. The fire instance is the
/// one started under the message's prediction key, or the newest running one.
#[allow(clippy::too_many_arguments)]
pub fn process_target_data(
    asc: &mut AbilitySystemComponent,
    inventory: &mut InventoryManager,
    equipment: &EquipmentManager,
    teams: &TeamSubsystem,
    instigator: ActorId,
    feet: Vec3,
    message: ServerSetReplicatedTargetData,
) -> (ClientConfirmTargetData, Vec<PendingDamage>) {
    let mut data = message.data;
    let rejected = |unique_id| ClientConfirmTargetData {
        unique_id,
        success: false,
        hit_replaces: Vec::new(),
    };

    let Some(handle) = asc.find_ability_spec_handle_for_id(&message.ability_class_path, None) else {
        warn!("Target data for ability {} the pawn does not have", message.ability_class_path);
        return (rejected(data.unique_id), Vec::new());
    };
    let instance: Option<InstanceId> = asc.find_spec(handle).and_then(|spec| {
        spec.active_instances()
            .find(|i| i.prediction_key == message.prediction_key)
            .or_else(|| spec.active_instances().last())
            .map(|i| i.id)
    });
    let Some(instance) = instance else {
        debug!("Target data {} arrived after {} ended", data.unique_id, message.ability_class_path);
        return (rejected(data.unique_id), Vec::new());
    };
    let Some(weapon) = equipment.equipped_weapon().and_then(|e| e.weapon()) else {
        asc.end_ability(handle, instance);
        return (rejected(data.unique_id), Vec::new());
    };

    let validator = MaxRangeValidator {
        max_range: weapon.computed_stats().max_damage_range,
        tolerance: HIT_RANGE_TOLERANCE,
    };
    let (valid, hit_replaces) = validate_target_data(&mut data, feet + Vec3::Y * EYE_HEIGHT, &validator);
    let committed = commit_target_data(
        asc,
        handle,
        instance,
        &data,
        valid,
        &mut ActivationEnv::with_items(inventory),
    );

    let damage = if committed {
        damage_from_target_data(weapon, &data, instigator, teams)
    } else {
        Vec::new()
    };
    let confirm = ClientConfirmTargetData {
        unique_id: data.unique_id,
        success: committed,
        hit_replaces,
    };
    (confirm, damage)
}

/// Handle `ServerSetReplicatedTargetData` from every client link.
pub fn handle_target_data(
    teams: Res<TeamSubsystem>,
    mut pending: ResMut<PendingWeaponDamage>,
    mut client_links: Query<
        (
            Entity,
            &mut MessageReceiver<ServerSetReplicatedTargetData>,
            &mut MessageSender<ClientConfirmTargetData>,
        ),
        With<ClientOf>,
    >,
    mut pawns: Query<(
        &ControlledBy,
        &NetActor,
        &PlayerPosition,
        &mut AbilitySystemComponent,
        &mut InventoryManager,
        &EquipmentManager,
    )>,
) {
    for (link, mut receiver, mut sender) in client_links.iter_mut() {
        let messages: Vec<_> = receiver.receive().collect();
        if messages.is_empty() {
            continue;
        }
        let Some((_, actor, position, mut asc, mut inventory, equipment)) =
            pawns.iter_mut().find(|(owner, ..)| owner.owner == link)
        else {
            continue;
        };
        for message in messages {
            let (confirm, damage) =
                process_target_data(&mut asc, &mut inventory, equipment, &teams, actor.0, position.0, message);
            sender.send::<ReliableChannel>(confirm);
            pending.hits.extend(damage.into_iter().map(|d| (actor.0, d)));
        }
    }
}

/// Apply queued weapon damage to whatever actor each hit names.
pub fn apply_weapon_damage(
    mut pending: ResMut<PendingWeaponDamage>,
    mut targets: Query<(&NetActor, &mut AbilitySystemComponent)>,
) {
    if pending.hits.is_empty() {
        return;
    }
    for (instigator, damage) in pending.hits.drain(..) {
        let Some((_, mut asc)) = targets.iter_mut().find(|(actor, _)| actor.0 == damage.target) else {
            continue;
        };
        debug!("Actor {} hit {} for {:.1}", instigator, damage.target, damage.damage);
        apply_pending_damage(&mut asc, &damage, instigator, 1);
    }
}

/// Switch the active quick bar slot, or put the weapon away.
pub fn handle_quickbar_select(
    data: Res<GameData>,
    mut host: ResMut<EquipmentActorRegistry>,
    mut client_links: Query<(Entity, &mut MessageReceiver<SelectQuickbarSlot>), With<ClientOf>>,
    mut pawns: Query<(
        &ControlledBy,
        &mut AbilitySystemComponent,
        &InventoryManager,
        &mut QuickBar,
        &mut EquipmentManager,
    )>,
) {
    for (link, mut receiver) in client_links.iter_mut() {
        for request in receiver.receive() {
            let Some((_, mut asc, inventory, mut quickbar, mut equipment)) =
                pawns.iter_mut().find(|(owner, ..)| owner.owner == link)
            else {
                continue;
            };
            let mut ctx = EquipmentContext::new(&data, &mut *host).with_asc(&mut asc);
            match request.slot {
                Some(index) => quickbar.set_active_slot_index(index, inventory, &mut equipment, &mut ctx),
                None => {
                    if let Some(active) = quickbar.active_slot_index() {
                        quickbar.deactivate_slot_index(active, &mut equipment, &mut ctx);
                    }
                }
            }
        }
    }
}

/// One attachment change asked for by a client.
#[derive(Clone, Debug)]
pub enum AttachmentRequest {
    Install(InstallAttachmentRequest),
    Uninstall(UninstallAttachmentRequest),
    Tuning(SetAttachmentTuningRequest),
    Loadout(ApplyLoadoutRequest),
}

/// Run `f` against the equipped weapon's attachments.
fn with_equipped_attachments(
    equipment: &mut EquipmentManager,
    data: &GameData,
    f: impl FnOnce(&mut WeaponAttachmentComponent, &mut AttachmentContext<'_>) -> Result<(), AttachmentError>,
) -> Result<EquipmentInstanceId, String> {
    let instance = equipment.equipped_weapon_mut().ok_or("no weapon equipped")?;
    let id = instance.id();
    match instance.with_attachments(&data.attachments, f) {
        Some(result) => result.map(|_| id).map_err(|e| e.to_string()),
        None => Err(format!("{} has no attachment slots", instance.definition().id)),
    }
}

/// Apply one request to the equipped weapon. On success the weapon's new tags are pushed to the
/// ability system and the replicated equipment list is refreshed.
pub fn apply_attachment_request(
    request: &AttachmentRequest,
    equipment: &mut EquipmentManager,
    asc: &mut AbilitySystemComponent,
    data: &GameData,
) -> Result<EquipmentInstanceId, String> {
    let id = match request {
        AttachmentRequest::Install(r) => with_equipped_attachments(equipment, data, |a, ctx| {
            a.install_attachment(&r.attachment_id, r.slot.clone(), ctx)
        }),
        AttachmentRequest::Uninstall(r) => {
            with_equipped_attachments(equipment, data, |a, ctx| a.uninstall_attachment(&r.slot, ctx))
        }
        AttachmentRequest::Tuning(r) => with_equipped_attachments(equipment, data, |a, ctx| {
            a.set_tuning_value(&r.slot, &r.stat_tag, r.value, ctx).map(|_| ())
        }),
        AttachmentRequest::Loadout(r) => {
            let mut complete = true;
            let id = with_equipped_attachments(equipment, data, |a, ctx| {
                complete = a.apply_loadout(&r.loadout, ctx);
                Ok(())
            })?;
            if !complete {
                warn!("Loadout '{}' applied partially", r.loadout.name);
            }
            Ok(id)
        }
    }?;

    if let Some(instance) = equipment.instance_mut(id) {
        instance.refresh_attachment_tags(asc);
    }
    equipment.refresh_replicated();
    Ok(id)
}

/// Install, uninstall, tuning and loadout requests. Each gets an `AttachmentRequestResult`; a
/// change that went through also sends the weapon's new stats.
#[allow(clippy::type_complexity)]
pub fn handle_attachment_requests(
    data: Res<GameData>,
    store: Res<LoadoutStore>,
    mut client_links: Query<
        (
            Entity,
            &mut MessageReceiver<InstallAttachmentRequest>,
            &mut MessageReceiver<UninstallAttachmentRequest>,
            &mut MessageReceiver<SetAttachmentTuningRequest>,
            &mut MessageReceiver<ApplyLoadoutRequest>,
            &mut MessageSender<AttachmentRequestResult>,
            &mut MessageSender<WeaponStatsChanged>,
        ),
        With<ClientOf>,
    >,
    mut pawns: Query<(&ControlledBy, &mut AbilitySystemComponent, &mut EquipmentManager)>,
) {
    for (link, mut install, mut uninstall, mut tuning, mut loadouts, mut results, mut stats) in client_links.iter_mut() {
        let mut requests: Vec<AttachmentRequest> = install.receive().map(AttachmentRequest::Install).collect();
        requests.extend(uninstall.receive().map(AttachmentRequest::Uninstall));
        requests.extend(tuning.receive().map(AttachmentRequest::Tuning));
        requests.extend(loadouts.receive().map(AttachmentRequest::Loadout));
        if requests.is_empty() {
            continue;
        }
        let Some((_, mut asc, mut equipment)) = pawns.iter_mut().find(|(owner, ..)| owner.owner == link) else {
            continue;
        };

        for request in requests {
            match apply_attachment_request(&request, &mut equipment, &mut asc, &data) {
                Ok(id) => {
                    if let AttachmentRequest::Loadout(ApplyLoadoutRequest { loadout, save: true }) = &request {
                        save_loadout(&store, asc.player_id(), &equipment, id, loadout);
                    }
                    if let Some(weapon) = equipment.instance(id).and_then(|e| e.weapon()) {
                        stats.send::<ReliableChannel>(WeaponStatsChanged {
                            equipment: id,
                            stats: weapon.computed_stats().clone(),
                        });
                    }
                    results.send::<ReliableChannel>(AttachmentRequestResult {
                        success: true,
                        reason: None,
                    });
                }
                Err(reason) => {
                    info!("Attachment request {:?} refused: {}", request, reason);
                    results.send::<ReliableChannel>(AttachmentRequestResult {
                        success: false,
                        reason: Some(reason),
                    });
                }
            }
        }
    }
}

fn save_loadout(
    store: &LoadoutStore,
    player: Option<u64>,
    equipment: &EquipmentManager,
    id: EquipmentInstanceId,
    loadout: &shared::weapons::WeaponLoadout,
) {
    let (Some(player), Some(instance)) = (player, equipment.instance(id)) else {
        return;
    };
    if let Err(e) = store.save(player, &instance.definition().id, loadout) {
        error!("Failed to save loadout '{}': {}", loadout.name, e);
    }
}

/// Install each weapon's saved loadout, if the player has one.
pub fn apply_saved_loadouts(store: &LoadoutStore, player: u64, equipment: &mut EquipmentManager, data: &GameData) {
    let ids: Vec<_> = equipment.instances().map(|i| i.id()).collect();
    for id in ids {
        let Some(instance) = equipment.instance_mut(id) else {
            continue;
        };
        let definition = instance.definition().id.clone();
        let loadout = match store.load(player, &definition) {
            Ok(Some(loadout)) => loadout,
            Ok(None) => continue,
            Err(e) => {
                warn!("Ignoring saved loadout for {} of player {}: {}", definition, player, e);
                continue;
            }
        };
        if instance.with_attachments(&data.attachments, |a, ctx| a.apply_loadout(&loadout, ctx)) == Some(false) {
            warn!("Saved loadout '{}' for {} applied partially", loadout.name, definition);
        }
    }
    equipment.refresh_replicated();
}
