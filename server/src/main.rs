//! Game Server - Headless Bevy app that owns every pawn's ability system, equipment and health
//!
//! Updated for Lightyear 0.25 / Bevy 0.17

mod abilities;
mod persistence;
mod systems;
mod weapons;
mod world;

use bevy::app::ScheduleRunnerPlugin;
use bevy::prelude::*;
use lightyear::prelude::server::*;
use lightyear::prelude::*;
// UDP/Netcode types re-exported through prelude::server (when features enabled)
use shared::{get_server_bind_addr, protocol::*, GameplayPlugin, GameplaySet, ProtocolPlugin, PRIVATE_KEY, PROTOCOL_ID, SERVER_PORT};
use std::net::SocketAddr;

use persistence::LoadoutStore;
use systems::ClientInputs;
use weapons::PendingWeaponDamage;
use world::ActorIds;

/// Marker for our server entity
#[derive(Component)]
struct GameServer;

/// Spawn the server entity with all required networking components
fn spawn_server(mut commands: Commands) {
    let bind_addr = get_server_bind_addr();
    let server_addr: SocketAddr = format!("{}:{}", bind_addr, SERVER_PORT)
        .parse()
        .expect("Invalid server bind address");

    info!("Spawning server entity, binding to {:?}", server_addr);

    // Spawn server entity with UDP + Netcode
    commands.spawn((
        GameServer,
        Server::default(),
        ServerUdpIo::default(),
        LocalAddr(server_addr),
        NetcodeServer::new(NetcodeConfig {
            protocol_id: PROTOCOL_ID,
            private_key: PRIVATE_KEY,
            ..default()
        }),
    ));
}

/// Start the server after it's spawned
fn start_server(
    mut commands: Commands,
    server_query: Query<Entity, (With<GameServer>, Without<Started>, Without<Starting>)>,
) {
    for server_entity in server_query.iter() {
        info!("Starting server...");
        // In Bevy 0.17 + Lightyear 0.25, trigger an EntityEvent
        commands.trigger(Start { entity: server_entity });
    }
}

/// Check if server is started (run condition)
fn server_is_started(server_query: Query<(), (With<GameServer>, With<Started>)>) -> bool {
    !server_query.is_empty()
}

fn main() {
    let mut app = App::new();

    // Headless plugins (no rendering)
    // IMPORTANT: run the main loop at the same rate as our fixed tick.
    //
    // If the headless app runs "as fast as possible", Bevy clears `MessageReceiver` buffers every
    // frame (in `Last`), but our gameplay systems read messages in `FixedUpdate`. When frames >>
    // fixed ticks, most ability and target-data messages get cleared before `FixedUpdate` runs.
    app.add_plugins(MinimalPlugins.set(ScheduleRunnerPlugin::run_loop(tick_duration())));
    app.add_plugins(bevy::log::LogPlugin::default());
    app.add_plugins(bevy::state::app::StatesPlugin);

    // Lightyear server plugins (tick_duration = 60Hz)
    app.add_plugins(ServerPlugins {
        tick_duration: tick_duration(),
    });

    // Protocol plugin (component/message registration)
    app.add_plugins(ProtocolPlugin);

    // Data registries, trace world, teams and the per-tick ability/weapon systems
    app.add_plugins(GameplayPlugin::default());

    app.init_resource::<ClientInputs>()
        .init_resource::<ActorIds>()
        .init_resource::<PendingWeaponDamage>()
        .insert_resource(LoadoutStore::from_env());

    app.add_systems(Startup, spawn_server);
    app.add_systems(Update, start_server);
    app.add_systems(Update, world::spawn_training_dummies_once.run_if(server_is_started));

    app.add_observer(systems::handle_disconnections);

    // Fixed tick: read client messages before the shared tick, mirror state after it.
    app.add_systems(
        FixedUpdate,
        (
            systems::handle_connections,
            systems::receive_client_input,
            systems::simulate_players,
            weapons::handle_quickbar_select,
            weapons::handle_attachment_requests,
            abilities::handle_ability_input_tags,
            abilities::process_server_ability_input,
            abilities::handle_try_activate,
            abilities::handle_ability_input_events,
            abilities::handle_end_ability,
            abilities::handle_montage_rpcs,
        )
            .chain()
            .before(GameplaySet::World)
            .run_if(server_is_started),
    );
    app.add_systems(
        FixedUpdate,
        (
            weapons::handle_target_data,
            weapons::apply_weapon_damage,
            abilities::dispatch_ability_notifications,
            world::start_respawn_timers,
            world::tick_respawn_timers,
            abilities::sync_granted_abilities,
            abilities::sync_ability_state,
            abilities::sync_equipment_state,
        )
            .chain()
            .after(GameplaySet::Tick)
            .run_if(server_is_started),
    );

    info!("Starting server on port {}", SERVER_PORT);
    app.run();
}
