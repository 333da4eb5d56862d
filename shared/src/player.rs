//! Player pawn constants and movement shared by server and client prediction

use bevy::prelude::*;

use crate::components::{PlayerPosition, PlayerRotation};
use crate::protocol::PlayerInput;

/// Movement speed (metres per second)
pub const PLAYER_SPEED: f32 = 6.0;

/// Capsule height, feet to crown
pub const PLAYER_HEIGHT: f32 = 1.8;

pub const PLAYER_RADIUS: f32 = 0.35;

/// Camera height above the feet
pub const EYE_HEIGHT: f32 = 1.6;

/// Mouse sensitivity for look
pub const MOUSE_SENSITIVITY: f32 = 0.003;

pub const SPAWN_POSITION: [f32; 3] = [0.0, 0.0, 0.0];

/// Meshes every pawn animates, by mesh tag.
pub const PAWN_MESHES: &[&str] = &["Body", "Arms"];

/// Scene components equipment actors can attach to.
pub const PAWN_COMPONENT_TAGS: &[&str] = &["WeaponHand", "FirstPersonArms"];

/// Ability set every pawn starts with.
pub const PAWN_ABILITY_SET: &str = "AbilitySet_Pawn";

/// Apply one tick of movement input. Used by the server and by client prediction.
pub fn apply_movement(input: &PlayerInput, position: &mut PlayerPosition, rotation: &mut PlayerRotation, delta_seconds: f32) {
    rotation.0 = input.yaw;

    // +X is right, +Y is up, -Z is forward
    let forward = Vec3::new(-rotation.0.sin(), 0.0, -rotation.0.cos());
    let right = Vec3::new(rotation.0.cos(), 0.0, -rotation.0.sin());

    let mut direction = Vec3::ZERO;
    if input.forward {
        direction += forward;
    }
    if input.backward {
        direction -= forward;
    }
    if input.right {
        direction += right;
    }
    if input.left {
        direction -= right;
    }

    if direction.length_squared() > 0.0 {
        position.0 += direction.normalize() * PLAYER_SPEED * delta_seconds;
    }
}

/// Eye position and look direction from feet, yaw and pitch.
pub fn eye_and_forward(feet: Vec3, yaw: f32, pitch: f32) -> (Vec3, Vec3) {
    let rotation = Quat::from_euler(EulerRot::YXZ, yaw, pitch, 0.0);
    (feet + Vec3::Y * EYE_HEIGHT, rotation * Vec3::NEG_Z)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_moves_along_negative_z() {
        let input = PlayerInput {
            forward: true,
            ..Default::default()
        };
        let mut position = PlayerPosition::default();
        let mut rotation = PlayerRotation::default();
        apply_movement(&input, &mut position, &mut rotation, 0.5);
        assert!((position.0 - Vec3::new(0.0, 0.0, -3.0)).length() < 1e-5);
    }

    #[test]
    fn test_diagonal_is_normalized() {
        let input = PlayerInput {
            forward: true,
            right: true,
            ..Default::default()
        };
        let mut position = PlayerPosition::default();
        let mut rotation = PlayerRotation::default();
        apply_movement(&input, &mut position, &mut rotation, 1.0);
        assert!((position.0.length() - PLAYER_SPEED).abs() < 1e-4);
    }

    #[test]
    fn test_eye_looks_down_negative_z() {
        let (eye, forward) = eye_and_forward(Vec3::ZERO, 0.0, 0.0);
        assert_eq!(eye, Vec3::new(0.0, EYE_HEIGHT, 0.0));
        assert!((forward - Vec3::NEG_Z).length() < 1e-5);
    }
}
