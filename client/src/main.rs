//! Game Client - Renders the arena, predicts local abilities and fires hit-scan weapons
//!
//! Updated for Lightyear 0.25 / Bevy 0.17

mod abilities;
mod camera;
mod config;
mod crosshair;
mod input;
mod states;
mod systems;
mod ui;
mod weapons;

use bevy::asset::AssetPlugin;
use bevy::prelude::*;
use bevy::render::settings::{RenderCreation, WgpuFeatures, WgpuSettings};
use bevy::render::RenderPlugin;
use bevy::window::WindowResolution;
use lightyear::prelude::client::ClientPlugins;
use shared::{protocol::*, GameplayPlugin, GameplaySet, ProtocolPlugin};
use states::{in_game, GameState};

/// Marker component for our client entity
#[derive(Component)]
pub struct GameClient;

/// Get the asset path - for bundled macOS apps, use path relative to executable
fn get_asset_path() -> String {
    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            let bundled_assets = exe_dir.join("assets");
            if bundled_assets.exists() {
                info!("Using bundled assets at: {:?}", bundled_assets);
                return bundled_assets.to_string_lossy().to_string();
            }
        }
    }
    // Fall back to default "assets" folder (for development)
    "assets".to_string()
}

fn main() {
    let asset_path = get_asset_path();
    let settings = config::ClientSettings::load_or_create(config::CLIENT_SETTINGS_PATH);

    let mut app = App::new();

    app.add_plugins(
        DefaultPlugins
            .set(WindowPlugin {
                primary_window: Some(Window {
                    title: "YC Shooter".to_string(),
                    resolution: WindowResolution::new(1280, 720),
                    ..default()
                }),
                ..default()
            })
            .set(AssetPlugin {
                file_path: asset_path,
                ..default()
            })
            .set(RenderPlugin {
                render_creation: RenderCreation::Automatic(WgpuSettings {
                    features: WgpuFeatures::INDIRECT_FIRST_INSTANCE,
                    ..default()
                }),
                ..default()
            }),
    );

    // Game state machine
    app.init_state::<GameState>();

    // Lightyear client plugins (tick_duration = 60Hz)
    app.add_plugins(ClientPlugins {
        tick_duration: tick_duration(),
    });
    app.add_plugins(ProtocolPlugin);
    app.add_plugins(GameplayPlugin::default());

    // UI plugins
    app.add_plugins(ui::MainMenuPlugin);
    app.add_plugins(ui::PauseMenuPlugin);
    app.add_plugins(ui::HudPlugin);

    info!(
        "Starting client, server at {}:{}, client_id: {}",
        settings.server_ip, settings.server_port, settings.client_id
    );
    app.insert_resource(settings);
    app.init_resource::<input::InputState>();
    app.init_resource::<abilities::PendingGrants>();
    app.init_resource::<weapons::BulletTraces>();

    app.add_systems(
        Startup,
        (
            camera::spawn_camera,
            systems::setup_actor_materials,
            abilities::setup_failure_feed,
        ),
    );

    // Clean up everything the last session left when entering the menu
    app.add_systems(
        OnEnter(GameState::MainMenu),
        (
            systems::enter_main_menu,
            crosshair::despawn_crosshair,
            crosshair::despawn_death_screen,
        ),
    );

    // Connection systems
    app.add_systems(OnEnter(GameState::Connecting), systems::start_connection);
    app.add_systems(
        Update,
        systems::check_connection.run_if(in_state(GameState::Connecting)),
    );

    app.add_systems(
        OnEnter(GameState::Playing),
        (
            systems::spawn_world,
            crosshair::spawn_crosshair,
            crosshair::spawn_death_screen,
        ),
    );

    // Replication-driven setup must not be gated to `Playing`: the first snapshots can arrive
    // while we're still in `Connecting`.
    app.add_systems(
        Update,
        (
            systems::setup_replicated_pawns,
            systems::sync_teams,
            systems::spawn_actor_visuals,
            abilities::receive_ability_grants,
        )
            .chain()
            .run_if(in_state(GameState::Connecting).or(in_game)),
    );

    // Server messages are read every frame; receivers are cleared each frame.
    app.add_systems(
        Update,
        (
            systems::watch_disconnect,
            abilities::receive_ability_verdicts,
            abilities::collect_failure_messages,
            weapons::receive_weapon_messages,
        )
            .run_if(in_game),
    );

    app.add_systems(
        Update,
        (
            input::handle_keyboard_input,
            input::handle_mouse_input,
            input::select_quickbar_slot,
            input::attachment_hotkeys,
            systems::grab_cursor,
        )
            .run_if(in_state(GameState::Playing)),
    );

    app.add_systems(
        Update,
        (
            input::send_ability_inputs,
            (systems::sync_actor_transforms, camera::update_camera).chain(),
            camera::update_camera_fov,
            systems::tint_dead_actors,
            systems::update_local_player_visibility,
            weapons::draw_bullet_traces,
        )
            .run_if(in_game),
    );

    app.add_systems(
        Update,
        (
            crosshair::update_crosshair_visibility,
            crosshair::update_crosshair_spread,
            crosshair::spawn_confirmed_hit_markers,
            crosshair::update_hit_markers,
            crosshair::update_death_screen,
        )
            .run_if(in_game),
    );

    // Fixed tick: movement input, then local prediction and firing once the shared ability and
    // weapon ticks have run.
    app.add_systems(FixedUpdate, input::send_input_to_server.run_if(in_game));
    app.add_systems(
        FixedUpdate,
        (
            abilities::process_local_ability_input,
            abilities::forward_ability_notifications,
            weapons::fire_local_weapons,
            weapons::apply_recoil_recovery,
        )
            .chain()
            .after(GameplaySet::Tick)
            .run_if(in_game),
    );

    app.run();
}
