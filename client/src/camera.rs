//! First-person and third-person camera system
//!
//! Updated for Lightyear 0.25 / Bevy 0.17

use bevy::prelude::*;
use shared::ability::AbilitySystemComponent;
use shared::equipment::EquipmentManager;
use shared::weapons::fire_ability::is_aiming;
use shared::{LocalPlayer, EYE_HEIGHT, PLAYER_HEIGHT};

use crate::config::ClientSettings;
use crate::input::{CameraMode, InputState};

/// Third person orbit settings
const THIRD_PERSON_DISTANCE: f32 = 4.5;
const THIRD_PERSON_DEFAULT_PITCH: f32 = 0.25;

/// Zoomed FOV when aiming, before the weapon's own zoom
const FOV_ADS_FACTOR: f32 = 0.65;

pub fn spawn_camera(mut commands: Commands, settings: Res<ClientSettings>) {
    commands.spawn((
        Camera3d::default(),
        Projection::Perspective(PerspectiveProjection {
            fov: settings.fov_degrees.to_radians(),
            ..default()
        }),
        Transform::from_xyz(0.0, EYE_HEIGHT, 6.0).looking_at(Vec3::new(0.0, 1.0, 0.0), Vec3::Y),
    ));
}

/// Update camera to follow local player
pub fn update_camera(
    player_query: Query<&Transform, (With<LocalPlayer>, Without<Camera3d>)>,
    mut camera_query: Query<&mut Transform, (With<Camera3d>, Without<LocalPlayer>)>,
    input_state: Res<InputState>,
) {
    let Some(player_transform) = player_query.iter().next() else {
        return;
    };
    let Ok(mut camera_transform) = camera_query.single_mut() else {
        return;
    };

    // Look rotation is applied unsmoothed; recoil kicks must land on the frame they happen.
    let (translation, rotation) = match input_state.camera_mode {
        CameraMode::FirstPerson => first_person_target(player_transform.translation, &input_state),
        CameraMode::ThirdPerson => third_person_target(player_transform.translation, &input_state),
    };
    camera_transform.translation = translation;
    camera_transform.rotation = rotation;
}

fn first_person_target(feet: Vec3, input_state: &InputState) -> (Vec3, Quat) {
    let pos = feet + Vec3::Y * EYE_HEIGHT;
    let rot = Quat::from_euler(EulerRot::YXZ, input_state.yaw, input_state.pitch, 0.0);
    (pos, rot)
}

fn third_person_target(feet: Vec3, input_state: &InputState) -> (Vec3, Quat) {
    // Looking down orbits the camera up and over.
    let orbit_pitch = (THIRD_PERSON_DEFAULT_PITCH - input_state.pitch * 0.6).clamp(-0.2, 1.3);
    let pivot = feet + Vec3::Y * (PLAYER_HEIGHT * 0.8);
    let eye = orbit_position(pivot, input_state.yaw, orbit_pitch, THIRD_PERSON_DISTANCE);
    (eye, Transform::from_translation(eye).looking_at(pivot, Vec3::Y).rotation)
}

/// Camera position orbiting around a pivot point
fn orbit_position(pivot: Vec3, yaw: f32, pitch: f32, distance: f32) -> Vec3 {
    let behind_dir = Vec3::new(yaw.sin(), 0.0, yaw.cos());
    pivot + behind_dir * (distance * pitch.cos()) + Vec3::Y * (distance * pitch.sin())
}

/// Field of view for the current aim state; the equipped weapon's ADS multiplier narrows it
/// further.
pub fn target_fov(base_degrees: f32, aiming: bool, ads_fov_multiplier: Option<f32>) -> f32 {
    if !aiming {
        return base_degrees.to_radians();
    }
    let weapon_zoom = ads_fov_multiplier.unwrap_or(1.0).clamp(0.1, 1.0);
    (base_degrees * FOV_ADS_FACTOR * weapon_zoom).to_radians()
}

/// Update camera FOV for ADS zoom effect
pub fn update_camera_fov(
    mut camera_query: Query<&mut Projection, With<Camera3d>>,
    input_state: Res<InputState>,
    settings: Res<ClientSettings>,
    local: Query<(&AbilitySystemComponent, &EquipmentManager), With<LocalPlayer>>,
    time: Res<Time>,
) {
    let Ok(mut projection) = camera_query.single_mut() else {
        return;
    };
    let Projection::Perspective(ref mut persp) = *projection else {
        return;
    };

    let (aiming, zoom) = match local.single() {
        Ok((asc, equipment)) => (
            is_aiming(asc) && input_state.camera_mode == CameraMode::FirstPerson,
            equipment
                .equipped_weapon()
                .and_then(|e| e.weapon())
                .map(|w| w.computed_stats().ads_fov_multiplier),
        ),
        Err(_) => (false, None),
    };
    let target = target_fov(settings.fov_degrees, aiming, zoom);

    let zoom_speed = 12.0;
    let t = 1.0 - (-zoom_speed * time.delta_secs()).exp();
    persp.fov += (target - persp.fov) * t;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aiming_narrows_the_view() {
        let hip = target_fov(70.0, false, Some(0.5));
        let ads = target_fov(70.0, true, None);
        let scoped = target_fov(70.0, true, Some(0.5));
        assert!(ads < hip);
        assert!(scoped < ads);
    }

    #[test]
    fn test_third_person_sits_behind_the_player() {
        let state = InputState::default();
        let (eye, _) = third_person_target(Vec3::ZERO, &state);
        // Yaw 0 looks down -Z, so behind is +Z.
        assert!(eye.z > 0.0);
        assert!(eye.y > 0.0);
    }
}
