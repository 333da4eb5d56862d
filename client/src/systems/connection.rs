//! Connection systems
//!
//! Networking, connection handling, cursor management, and menu transitions.

use bevy::prelude::*;
use bevy::window::{CursorGrabMode, CursorOptions, PrimaryWindow};
use lightyear::prelude::client::*;
use lightyear::prelude::*;
use shared::team::TeamSubsystem;
use shared::{
    AbilityInputTag, ApplyLoadoutRequest, AttachmentRequestResult, ClientAbilityFailed, ClientAbilityGranted,
    ClientAbilityRemoved, ClientConfirmTargetData, ClientPredictionAccepted, ClientPredictionRejected,
    InstallAttachmentRequest, NetActor, PlayerInput, SelectQuickbarSlot, ServerAbilityInputEvent,
    ServerCurrentMontageRpc, ServerEndAbility, ServerSetReplicatedTargetData, ServerTryActivateAbility,
    SetAttachmentTuningRequest, UninstallAttachmentRequest, WeaponStatsChanged, PRIVATE_KEY, PROTOCOL_ID,
};
use std::net::SocketAddr;

use super::world::ClientWorldRoot;
use crate::abilities::PendingGrants;
use crate::config::{ClientSettings, CLIENT_SETTINGS_PATH};
use crate::states::GameState;

// =============================================================================
// CONNECTION
// =============================================================================

/// Spawn the client entity with UDP + Netcode and every message sender/receiver, then
/// trigger `Connect`.
pub fn start_connection(
    mut commands: Commands,
    existing_clients: Query<Entity, With<crate::GameClient>>,
    settings: Res<ClientSettings>,
    mut next_state: ResMut<NextState<GameState>>,
) {
    info!("Initiating connection to server at {}:{}...", settings.server_ip, settings.server_port);

    // Only ever one GameClient entity; `single()` lookups depend on it.
    for e in existing_clients.iter() {
        commands.entity(e).despawn();
    }

    let server_addr: SocketAddr = match format!("{}:{}", settings.server_ip, settings.server_port).parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("Invalid server address {}:{}: {}", settings.server_ip, settings.server_port, e);
            next_state.set(GameState::MainMenu);
            return;
        }
    };
    let local_addr = SocketAddr::from(([0, 0, 0, 0], 0));

    if let Err(e) = settings.save(CLIENT_SETTINGS_PATH) {
        warn!("Unable to save client settings: {}", e);
    }

    let auth = Authentication::Manual {
        server_addr,
        protocol_id: PROTOCOL_ID,
        private_key: PRIVATE_KEY,
        client_id: settings.client_id,
    };
    let netcode = match NetcodeClient::new(auth, NetcodeConfig::default()) {
        Ok(netcode) => netcode,
        Err(e) => {
            error!("Failed to create netcode client: {:?}", e);
            next_state.set(GameState::MainMenu);
            return;
        }
    };

    let client_entity = commands
        .spawn((
            crate::GameClient,
            Client::default(),
            UdpIo::default(),
            LocalAddr(local_addr),
            PeerAddr(server_addr),
            netcode,
            ReplicationReceiver::default(),
        ))
        .id();

    // Added explicitly so a missing required component never turns a send into a no-op.
    commands.entity(client_entity).insert((
        // Client -> Server
        MessageSender::<PlayerInput>::default(),
        MessageSender::<AbilityInputTag>::default(),
        MessageSender::<ServerTryActivateAbility>::default(),
        MessageSender::<ServerAbilityInputEvent>::default(),
        MessageSender::<ServerEndAbility>::default(),
        MessageSender::<ServerSetReplicatedTargetData>::default(),
        MessageSender::<ServerCurrentMontageRpc>::default(),
        MessageSender::<SelectQuickbarSlot>::default(),
        MessageSender::<InstallAttachmentRequest>::default(),
        MessageSender::<UninstallAttachmentRequest>::default(),
        MessageSender::<SetAttachmentTuningRequest>::default(),
        MessageSender::<ApplyLoadoutRequest>::default(),
    ));
    commands.entity(client_entity).insert((
        // Server -> Client
        MessageReceiver::<ClientAbilityFailed>::default(),
        MessageReceiver::<ClientConfirmTargetData>::default(),
        MessageReceiver::<ClientPredictionRejected>::default(),
        MessageReceiver::<ClientPredictionAccepted>::default(),
        MessageReceiver::<ClientAbilityGranted>::default(),
        MessageReceiver::<ClientAbilityRemoved>::default(),
        MessageReceiver::<WeaponStatsChanged>::default(),
        MessageReceiver::<AttachmentRequestResult>::default(),
    ));

    commands.trigger(Connect { entity: client_entity });

    info!("Client entity spawned, client_id: {}", settings.client_id);
}

/// In Lightyear 0.25, we query for Connected/Disconnected components on the client entity
pub fn check_connection(
    mut next_state: ResMut<NextState<GameState>>,
    new_connections: Query<Entity, (With<crate::GameClient>, Added<Connected>)>,
    new_disconnections: Query<Entity, (With<crate::GameClient>, Added<Disconnected>)>,
) {
    for _entity in new_connections.iter() {
        info!("Connected to server!");
        next_state.set(GameState::Playing);
    }

    for _entity in new_disconnections.iter() {
        warn!("Connection failed or disconnected");
        next_state.set(GameState::MainMenu);
    }
}

/// Dropped while in game: back to the menu.
pub fn watch_disconnect(
    mut next_state: ResMut<NextState<GameState>>,
    lost: Query<Entity, (With<crate::GameClient>, Added<Disconnected>)>,
) {
    if !lost.is_empty() {
        warn!("Lost connection to server");
        next_state.set(GameState::MainMenu);
    }
}

// =============================================================================
// CURSOR
// =============================================================================

/// Grab cursor for FPS controls
pub fn grab_cursor(
    windows: Query<Entity, With<PrimaryWindow>>,
    mut cursor_opts: Query<&mut CursorOptions>,
    mouse_button: Res<ButtonInput<MouseButton>>,
) {
    let Ok(window_entity) = windows.single() else {
        return;
    };

    if mouse_button.just_pressed(MouseButton::Left) {
        if let Ok(mut cursor) = cursor_opts.get_mut(window_entity) {
            cursor.grab_mode = CursorGrabMode::Locked;
            cursor.visible = false;
        }
    }
}

pub fn release_cursor(windows: Query<Entity, With<PrimaryWindow>>, mut cursor_opts: Query<&mut CursorOptions>) {
    if let Ok(window_entity) = windows.single() {
        if let Ok(mut cursor) = cursor_opts.get_mut(window_entity) {
            cursor.grab_mode = CursorGrabMode::None;
            cursor.visible = true;
        }
    }
}

// =============================================================================
// MENU TRANSITIONS
// =============================================================================

/// Entering the main menu: drop the connection and everything it replicated.
#[allow(clippy::too_many_arguments)]
pub fn enter_main_menu(
    mut commands: Commands,
    windows: Query<Entity, With<PrimaryWindow>>,
    cursor_opts: Query<&mut CursorOptions>,
    clients: Query<Entity, With<crate::GameClient>>,
    world_roots: Query<Entity, With<ClientWorldRoot>>,
    actors: Query<Entity, With<NetActor>>,
    mut teams: ResMut<TeamSubsystem>,
    mut pending: ResMut<PendingGrants>,
) {
    release_cursor(windows, cursor_opts);

    for entity in clients.iter().chain(world_roots.iter()).chain(actors.iter()) {
        commands.entity(entity).despawn();
    }

    *teams = TeamSubsystem::default();
    *pending = PendingGrants::default();
    commands.insert_resource(ClearColor(Color::BLACK));
}
