//! Server-side connection, pawn and movement systems
//!
//! Updated for Lightyear 0.25

use bevy::prelude::*;
use lightyear::prelude::*;
use lightyear::prelude::server::*;
use std::collections::{HashMap, HashSet};

use shared::ability::{
    AbilitySource, AbilitySpecHandle, AbilitySystemComponent, ActivationEnv, AnimationHost, AvatarInfo, NetRole,
};
use shared::equipment::{EquipmentActorRegistry, EquipmentContext, EquipmentManager, QuickBar, DEFAULT_NUM_SLOTS};
use shared::game_data::GameData;
use shared::inventory::InventoryManager;
use shared::message_bus::GameplayMessageBus;
use shared::team::{TeamId, TeamSubsystem};
use shared::weapons::trace::ActorId;
use shared::weapons::WeaponStateComponent;
use shared::{
    apply_movement, AbilityInputTag, ApplyLoadoutRequest, AttachmentRequestResult, ClientAbilityFailed,
    ClientAbilityGranted, ClientAbilityRemoved, ClientConfirmTargetData, ClientPredictionAccepted,
    ClientPredictionRejected, HealthAttributes, InstallAttachmentRequest, NetActor, Player, PlayerInput,
    PlayerPosition, PlayerRotation, PreviousPosition, ReplicatedMontages, SelectQuickbarSlot,
    ServerAbilityInputEvent, ServerCurrentMontageRpc, ServerEndAbility, ServerSetReplicatedTargetData,
    ServerTryActivateAbility, SetAttachmentTuningRequest, TeamMember, UninstallAttachmentRequest,
    WeaponStatsChanged, PAWN_ABILITY_SET, PAWN_COMPONENT_TAGS, PAWN_MESHES,
};

use crate::persistence::LoadoutStore;
use crate::weapons::apply_saved_loadouts;
use crate::world::{pawn_spawn_point, ActorIds, RespawnTimer, SpawnPoint};

/// Items every pawn starts with, in quick bar order.
const STARTING_WEAPONS: &[(&str, i32)] = &[("ID_Rifle", 1), ("ID_Shotgun", 1)];

/// Stores the latest input for each connected client.
/// We use PeerId in Lightyear 0.25
#[derive(Resource, Default)]
pub struct ClientInputs {
    pub latest: HashMap<PeerId, PlayerInput>,
}

/// Spec handles the owning client has been told about.
#[derive(Component, Default)]
pub struct GrantedAbilityMirror(pub HashSet<AbilitySpecHandle>);

/// Pawns alternate between the two teams.
pub fn team_for_actor(actor: ActorId) -> TeamId {
    if actor % 2 == 1 {
        1
    } else {
        2
    }
}

/// Handle new client connections: open message channels and spawn the pawn.
/// In Lightyear 0.25, we query for newly added ClientOf + Connected entities
#[allow(clippy::too_many_arguments)]
pub fn handle_connections(
    mut commands: Commands,
    // Query for client links that just got Connected
    new_clients: Query<(Entity, &RemoteId), Added<Connected>>,
    // Filter to only get client links (not the server itself)
    client_filter: Query<(), With<ClientOf>>,
    data: Res<GameData>,
    bus: Res<GameplayMessageBus>,
    store: Res<LoadoutStore>,
    mut host: ResMut<EquipmentActorRegistry>,
    mut teams: ResMut<TeamSubsystem>,
    mut ids: ResMut<ActorIds>,
) {
    for (client_entity, remote_id) in new_clients.iter() {
        // Skip if this isn't a client link
        if client_filter.get(client_entity).is_err() {
            continue;
        }

        let peer_id = remote_id.0;
        info!("Client connected: {:?}", peer_id);

        // Lightyear 0.25 requires these components on the connection entity (the entity with
        // `ClientOf` + `Connected`). Split into multiple inserts to avoid tuple size limit.
        commands.entity(client_entity).insert((
            // Replication out: server -> this client
            ReplicationSender::new(shared::protocol::tick_duration(), SendUpdatesMode::SinceLastAck, false),
            // Client -> Server (movement and abilities)
            MessageReceiver::<PlayerInput>::default(),
            MessageReceiver::<AbilityInputTag>::default(),
            MessageReceiver::<ServerTryActivateAbility>::default(),
            MessageReceiver::<ServerAbilityInputEvent>::default(),
            MessageReceiver::<ServerEndAbility>::default(),
            MessageReceiver::<ServerSetReplicatedTargetData>::default(),
            MessageReceiver::<ServerCurrentMontageRpc>::default(),
        ));

        commands.entity(client_entity).insert((
            // Client -> Server (equipment)
            MessageReceiver::<SelectQuickbarSlot>::default(),
            MessageReceiver::<InstallAttachmentRequest>::default(),
            MessageReceiver::<UninstallAttachmentRequest>::default(),
            MessageReceiver::<SetAttachmentTuningRequest>::default(),
            MessageReceiver::<ApplyLoadoutRequest>::default(),
        ));

        commands.entity(client_entity).insert((
            // Server -> Client
            MessageSender::<ClientAbilityFailed>::default(),
            MessageSender::<ClientConfirmTargetData>::default(),
            MessageSender::<ClientPredictionRejected>::default(),
            MessageSender::<ClientPredictionAccepted>::default(),
            MessageSender::<ClientAbilityGranted>::default(),
            MessageSender::<ClientAbilityRemoved>::default(),
            MessageSender::<WeaponStatsChanged>::default(),
            MessageSender::<AttachmentRequestResult>::default(),
        ));

        let actor = ids.allocate();
        let team = team_for_actor(actor);
        teams.set_team(actor, team);
        host.register_pawn(actor, true, PAWN_COMPONENT_TAGS.iter().map(|s| s.to_string()).collect());

        let player_id = peer_id_to_u64(peer_id);
        let pawn = build_pawn(actor, player_id, &data, &bus, &store, &mut *host);
        let spawn = pawn_spawn_point(actor);
        let health = HealthAttributes::from_asc(&pawn.asc).unwrap_or_default();
        let snapshots = (
            pawn.inventory.replicated(),
            pawn.quickbar.replicated(),
            pawn.equipment.replicated(),
        );

        commands
            .spawn((
                Player { client_id: peer_id },
                NetActor(actor),
                TeamMember(team),
                PlayerPosition(spawn),
                PlayerRotation(0.0),
                PreviousPosition(spawn),
                SpawnPoint(spawn),
                health,
                ReplicatedMontages::default(),
                GrantedAbilityMirror::default(),
                WeaponStateComponent::new(),
                AnimationHost::with_meshes(PAWN_MESHES),
            ))
            .insert((pawn.asc, pawn.inventory, pawn.quickbar, pawn.equipment))
            .insert(snapshots)
            .insert((
                Replicate::new(ReplicationMode::SingleServer(NetworkTarget::All)),
                ControlledBy {
                    owner: client_entity,
                    lifetime: Lifetime::default(),
                },
            ));

        info!("Spawned pawn {} (team {}) for client {:?} at {:?}", actor, team, peer_id, spawn);
    }
}

/// The gameplay components of a freshly spawned pawn.
pub struct PawnParts {
    pub asc: AbilitySystemComponent,
    pub inventory: InventoryManager,
    pub quickbar: QuickBar,
    pub equipment: EquipmentManager,
}

/// Grant the pawn ability set, hand out the starting weapons with their saved loadouts and
/// equip the first quick bar slot.
pub fn build_pawn(
    actor: ActorId,
    player_id: u64,
    data: &GameData,
    bus: &GameplayMessageBus,
    store: &LoadoutStore,
    host: &mut EquipmentActorRegistry,
) -> PawnParts {
    let mut asc = AbilitySystemComponent::new(NetRole::Authority, false)
        .with_bus(bus.clone())
        .with_player_id(player_id);
    let mut inventory = InventoryManager::new(Some(player_id)).with_bus(bus.clone());
    let mut quickbar = QuickBar::new(true, Some(player_id), DEFAULT_NUM_SLOTS).with_bus(bus.clone());
    let mut equipment = EquipmentManager::new(actor, true, false).with_bus(bus.clone());

    match data.ability_sets.get_cached_item(PAWN_ABILITY_SET) {
        Some(set) => set.give_to_ability_system(
            &mut asc,
            None,
            AbilitySource::default(),
            &data.ability_set_sources(),
            &mut ActivationEnv::with_items(&mut inventory),
        ),
        None => error!("Ability set {} is missing", PAWN_ABILITY_SET),
    }
    asc.set_avatar(AvatarInfo::new(actor), &mut ActivationEnv::with_items(&mut inventory));

    for (slot, (item_id, count)) in STARTING_WEAPONS.iter().enumerate() {
        let Some(definition) = data.items.get_cached_item(item_id) else {
            warn!("Starting item {} is missing", item_id);
            continue;
        };
        let item = inventory.add_item_definition(&definition, *count);
        quickbar.add_item_to_slot(slot, item);
        if let Some(equipment_def) = data.equipment_for_item(item_id) {
            let mut ctx = EquipmentContext::new(data, &mut *host).with_asc(&mut asc);
            equipment.create_equipment(equipment_def, item, &mut ctx);
        }
    }

    apply_saved_loadouts(store, player_id, &mut equipment, data);

    let mut ctx = EquipmentContext::new(data, &mut *host).with_asc(&mut asc);
    quickbar.set_active_slot_index(0, &inventory, &mut equipment, &mut ctx);
    equipment.refresh_replicated();

    PawnParts {
        asc,
        inventory,
        quickbar,
        equipment,
    }
}

/// Handle client disconnections using an observer.
/// In Lightyear 0.25, Disconnected is a component that gets added when a client disconnects.
#[allow(clippy::too_many_arguments)]
pub fn handle_disconnections(
    trigger: On<Add, Disconnected>,
    mut commands: Commands,
    client_entities: Query<&RemoteId>,
    mut pawns: Query<(
        Entity,
        &Player,
        &NetActor,
        &mut AbilitySystemComponent,
        &mut EquipmentManager,
        &mut InventoryManager,
    )>,
    data: Res<GameData>,
    store: Res<LoadoutStore>,
    mut host: ResMut<EquipmentActorRegistry>,
    mut teams: ResMut<TeamSubsystem>,
    mut inputs: ResMut<ClientInputs>,
) {
    let client_entity = trigger.entity;

    // Get peer ID from client entity
    let Ok(remote_id) = client_entities.get(client_entity) else {
        warn!("Disconnect trigger for entity {:?} but no RemoteId found", client_entity);
        return;
    };
    let peer_id = remote_id.0;
    info!("Client {:?} disconnected: {:?}", client_entity, peer_id);
    inputs.latest.remove(&peer_id);

    let player_id = peer_id_to_u64(peer_id);
    for (entity, player, actor, mut asc, mut equipment, mut inventory) in pawns.iter_mut() {
        if player.client_id != peer_id {
            continue;
        }

        for instance in equipment.instances() {
            let Some(attachments) = instance.attachments() else {
                continue;
            };
            let name = format!("{} (last used)", instance.definition().id);
            let loadout = attachments.create_loadout_from_current(name);
            if let Err(e) = store.save(player_id, &instance.definition().id, &loadout) {
                error!("Failed to save loadout for player {}: {}", player_id, e);
            }
        }

        let ids: Vec<_> = equipment.instances().map(|i| i.id()).collect();
        let mut ctx = EquipmentContext::new(&data, &mut *host)
            .with_asc(&mut asc)
            .with_items(&mut *inventory);
        for id in ids {
            equipment.destroy_equipment(id, &mut ctx);
        }

        teams.remove_actor(actor.0);
        commands.entity(entity).despawn();
        info!("Despawned pawn {} of {:?}", actor.0, peer_id);
    }
}

/// Receive inputs from clients and store them
pub fn receive_client_input(
    mut inputs: ResMut<ClientInputs>,
    // Query client link entities that have a MessageReceiver for PlayerInput
    mut client_links: Query<(&RemoteId, &mut MessageReceiver<PlayerInput>), With<ClientOf>>,
) {
    for (remote_id, mut receiver) in client_links.iter_mut() {
        for input in receiver.receive() {
            inputs.latest.insert(remote_id.0, input);
        }
    }
}

/// Move live pawns from their latest input.
pub fn simulate_players(
    time: Res<Time>,
    inputs: Res<ClientInputs>,
    mut players: Query<(&Player, &mut PlayerPosition, &mut PlayerRotation), Without<RespawnTimer>>,
) {
    let dt = time.delta_secs();
    for (player, mut position, mut rotation) in players.iter_mut() {
        let Some(input) = inputs.latest.get(&player.client_id) else {
            continue;
        };
        apply_movement(input, &mut position, &mut rotation, dt);
    }
}

/// Helper to convert PeerId to u64 for ability and loadout ownership
pub fn peer_id_to_u64(peer_id: PeerId) -> u64 {
    match peer_id {
        PeerId::Netcode(id) => id,
        PeerId::Steam(id) => id,
        PeerId::Local(id) => id,
        PeerId::Entity(id) => id,
        PeerId::Raw(addr) => {
            // Hash the socket address to a u64
            use std::hash::{Hash, Hasher};
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            addr.hash(&mut hasher);
            hasher.finish()
        }
        PeerId::Server => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::weapons::WeaponLoadout;
    use shared::tags::tag;

    fn data() -> GameData {
        GameData::load_from_dir(concat!(env!("CARGO_MANIFEST_DIR"), "/../assets/data"))
    }

    fn temp_store(name: &str) -> LoadoutStore {
        let dir = std::env::temp_dir().join(format!("yc_pawn_{}_{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        LoadoutStore::new(dir)
    }

    #[test]
    fn test_teams_alternate() {
        assert_ne!(team_for_actor(1), team_for_actor(2));
        assert_eq!(team_for_actor(1), team_for_actor(3));
    }

    #[test]
    fn test_pawn_starts_with_rifle_equipped() {
        let data = data();
        let mut host = EquipmentActorRegistry::new();
        host.register_pawn(1, true, PAWN_COMPONENT_TAGS.iter().map(|s| s.to_string()).collect());
        let pawn = build_pawn(1, 42, &data, &GameplayMessageBus::new(), &temp_store("rifle"), &mut host);

        assert_eq!(pawn.quickbar.active_slot_index(), Some(0));
        assert_eq!(pawn.equipment.len(), STARTING_WEAPONS.len());
        let equipped = pawn.equipment.equipped_weapon().unwrap();
        assert_eq!(Some(equipped.id()), pawn.quickbar.equipped());
        assert!(equipped.weapon().is_some());
        assert!(pawn.asc.find_ability_spec_handle_for_id("GA_Weapon_Fire", None).is_some());
        assert!(pawn.asc.find_ability_spec_handle_for_id("GA_Crouch", None).is_some());
    }

    #[test]
    fn test_saved_loadout_is_applied_on_spawn() {
        let data = data();
        let store = temp_store("saved");
        let mut host = EquipmentActorRegistry::new();
        host.register_pawn(3, true, Vec::new());

        let optic = tag("Attachment.Slot.Optic");
        store
            .save(7, "rifle", &WeaponLoadout::new("Saved").with_attachment(optic.clone(), "optic_thermal"))
            .unwrap();

        let pawn = build_pawn(3, 7, &data, &GameplayMessageBus::new(), &store, &mut host);
        let installed = pawn
            .equipment
            .equipped_weapon()
            .and_then(|e| e.attachments())
            .and_then(|a| a.attachment_in_slot(&optic))
            .and_then(|a| a.definition().map(|d| d.id.clone()));
        assert_eq!(installed.as_deref(), Some("optic_thermal"));
    }
}
