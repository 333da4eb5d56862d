//! World systems
//!
//! Arena visuals, pawn and dummy models, and transform sync.

use bevy::light::{light_consts::lux, CascadeShadowConfigBuilder};
use bevy::prelude::*;
use shared::arena::{arena_bodies, ARENA_HALF_SIZE};
use shared::weapons::trace::TraceShape;
use shared::{HealthAttributes, LocalPlayer, NetActor, PlayerPosition, PlayerRotation, TeamMember, TrainingDummy};
use shared::{PLAYER_HEIGHT, PLAYER_RADIUS};

use crate::input::{CameraMode, InputState};

// =============================================================================
// COMPONENTS
// =============================================================================

/// Root entity for all client-side world visuals
#[derive(Component)]
pub struct ClientWorldRoot;

/// The capsule child drawn for a pawn or dummy.
#[derive(Component)]
pub struct ActorModel;

/// Material handles per look, shared by every actor.
#[derive(Resource, Clone)]
pub struct ActorMaterials {
    pub capsule: Handle<Mesh>,
    pub team_one: Handle<StandardMaterial>,
    pub team_two: Handle<StandardMaterial>,
    pub dummy: Handle<StandardMaterial>,
    pub dead: Handle<StandardMaterial>,
}

pub fn setup_actor_materials(
    mut commands: Commands,
    mut meshes: ResMut<Assets<Mesh>>,
    mut materials: ResMut<Assets<StandardMaterial>>,
) {
    let mut material = |color: Color| {
        materials.add(StandardMaterial {
            base_color: color,
            perceptual_roughness: 0.8,
            ..default()
        })
    };
    let team_one = material(Color::srgb(0.25, 0.45, 0.9));
    let team_two = material(Color::srgb(0.9, 0.55, 0.2));
    let dummy = material(Color::srgb(0.75, 0.2, 0.2));
    let dead = material(Color::srgb(0.2, 0.2, 0.2));
    commands.insert_resource(ActorMaterials {
        capsule: meshes.add(Capsule3d::new(PLAYER_RADIUS, PLAYER_HEIGHT - 2.0 * PLAYER_RADIUS)),
        team_one,
        team_two,
        dummy,
        dead,
    });
}

// =============================================================================
// ARENA
// =============================================================================

/// Spawn lights, the floor and one box per static trace body.
pub fn spawn_world(
    mut commands: Commands,
    world_roots: Query<Entity, With<ClientWorldRoot>>,
    mut meshes: ResMut<Assets<Mesh>>,
    mut materials: ResMut<Assets<StandardMaterial>>,
) {
    if !world_roots.is_empty() {
        return;
    }

    // Parent of lights and geometry; needs GlobalTransform for its children.
    let root = commands
        .spawn((
            ClientWorldRoot,
            Transform::default(),
            GlobalTransform::default(),
            Visibility::default(),
            InheritedVisibility::default(),
        ))
        .id();

    let sun = commands
        .spawn((
            DirectionalLight {
                illuminance: lux::OVERCAST_DAY,
                shadows_enabled: true,
                ..default()
            },
            CascadeShadowConfigBuilder {
                num_cascades: 2,
                maximum_distance: 90.0,
                first_cascade_far_bound: 15.0,
                ..default()
            }
            .build(),
            Transform::from_rotation(Quat::from_euler(EulerRot::XYZ, -0.9, 0.4, 0.0)),
        ))
        .id();
    commands.entity(root).add_child(sun);

    commands.insert_resource(AmbientLight {
        color: Color::srgb(0.85, 0.87, 0.9),
        brightness: 250.0,
        affects_lightmapped_meshes: true,
    });
    commands.insert_resource(ClearColor(Color::srgb(0.55, 0.65, 0.75)));

    let floor = commands
        .spawn((
            Mesh3d(meshes.add(Plane3d::default().mesh().size(ARENA_HALF_SIZE * 2.0, ARENA_HALF_SIZE * 2.0))),
            MeshMaterial3d(materials.add(StandardMaterial {
                base_color: Color::srgb(0.42, 0.42, 0.4),
                perceptual_roughness: 0.95,
                ..default()
            })),
            Transform::default(),
        ))
        .id();
    commands.entity(root).add_child(floor);

    let concrete = materials.add(StandardMaterial {
        base_color: Color::srgb(0.62, 0.6, 0.56),
        perceptual_roughness: 0.9,
        ..default()
    });
    for body in arena_bodies() {
        let TraceShape::Aabb { min, max } = body.shape else {
            continue;
        };
        let size = max - min;
        let block = commands
            .spawn((
                Mesh3d(meshes.add(Cuboid::new(size.x, size.y, size.z))),
                MeshMaterial3d(concrete.clone()),
                Transform::from_translation((min + max) * 0.5),
            ))
            .id();
        commands.entity(root).add_child(block);
    }
}

// =============================================================================
// ACTORS
// =============================================================================

/// Give newly replicated pawns and dummies a transform and a capsule model.
pub fn spawn_actor_visuals(
    mut commands: Commands,
    assets: Option<Res<ActorMaterials>>,
    new_actors: Query<(Entity, &PlayerPosition, Option<&TeamMember>, Has<TrainingDummy>), Added<NetActor>>,
) {
    let Some(assets) = assets else {
        return;
    };

    for (entity, position, team, is_dummy) in new_actors.iter() {
        commands.entity(entity).insert((
            Transform::from_translation(position.0),
            GlobalTransform::from_translation(position.0),
            Visibility::Inherited,
            InheritedVisibility::default(),
        ));

        let material = match (is_dummy, team) {
            (true, _) => assets.dummy.clone(),
            (false, Some(TeamMember(1))) => assets.team_one.clone(),
            _ => assets.team_two.clone(),
        };
        // PlayerPosition is the feet; the capsule mesh is centred.
        let model = commands
            .spawn((
                ActorModel,
                Mesh3d(assets.capsule.clone()),
                MeshMaterial3d(material),
                Transform::from_xyz(0.0, PLAYER_HEIGHT * 0.5, 0.0),
            ))
            .id();
        commands.entity(entity).add_child(model);
    }
}

/// Smoothly follow the replicated position and yaw.
pub fn sync_actor_transforms(
    time: Res<Time>,
    mut actors: Query<(&PlayerPosition, Option<&PlayerRotation>, &mut Transform), With<NetActor>>,
) {
    let dt = time.delta_secs();
    let t_pos = 1.0_f32 - (-22.0 * dt).exp();
    let t_rot = 1.0_f32 - (-26.0 * dt).exp();

    for (position, rotation, mut transform) in actors.iter_mut() {
        // Large corrections (respawn) snap.
        if transform.translation.distance_squared(position.0) > 25.0 {
            transform.translation = position.0;
        } else {
            transform.translation = transform.translation.lerp(position.0, t_pos);
        }
        if let Some(rotation) = rotation {
            let target = Quat::from_rotation_y(rotation.0);
            transform.rotation = transform.rotation.slerp(target, t_rot);
        }
    }
}

/// Grey out dead actors, restore the team colour on respawn.
pub fn tint_dead_actors(
    assets: Option<Res<ActorMaterials>>,
    actors: Query<
        (&HealthAttributes, Option<&TeamMember>, Has<TrainingDummy>, &Children),
        Changed<HealthAttributes>,
    >,
    mut models: Query<&mut MeshMaterial3d<StandardMaterial>, With<ActorModel>>,
) {
    let Some(assets) = assets else {
        return;
    };
    for (health, team, is_dummy, children) in actors.iter() {
        let material = match (health.is_dead(), is_dummy, team) {
            (true, ..) => assets.dead.clone(),
            (false, true, _) => assets.dummy.clone(),
            (false, false, Some(TeamMember(1))) => assets.team_one.clone(),
            _ => assets.team_two.clone(),
        };
        for child in children.iter() {
            if let Ok(mut handle) = models.get_mut(child) {
                handle.0 = material.clone();
            }
        }
    }
}

/// The local capsule blocks the first-person view; show it only in third person.
pub fn update_local_player_visibility(
    input_state: Res<InputState>,
    local: Query<&Children, With<LocalPlayer>>,
    mut models: Query<&mut Visibility, With<ActorModel>>,
) {
    let Ok(children) = local.single() else {
        return;
    };
    let visible = match input_state.camera_mode {
        CameraMode::FirstPerson => Visibility::Hidden,
        CameraMode::ThirdPerson => Visibility::Inherited,
    };
    for child in children.iter() {
        if let Ok(mut visibility) = models.get_mut(child) {
            visibility.set_if_neq(visible);
        }
    }
}
