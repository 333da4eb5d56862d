//! Aim and spread geometry
//!
//! Hit-scan shots are straight rays. This module builds the ray origin and direction from the
//! camera, and scatters pellets inside a cone.

use bevy::prelude::*;
use rand::Rng;

/// Look-ahead distance (m) of the aim focus point.
pub const FOCAL_DISTANCE: f32 = 10.0;

/// Origin and direction for one trigger pull.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AimRay {
    pub origin: Vec3,
    pub direction: Vec3,
}

impl AimRay {
    pub fn end(&self, range: f32) -> Vec3 {
        self.origin + self.direction * range
    }
}

/// Camera-towards-focus targeting.
///
/// The focus sits `FOCAL_DISTANCE` ahead of the camera. The origin is then slid along the aim
/// axis onto the plane through the weapon, so the ray never starts behind the shooter's body.
pub fn camera_towards_focus(camera_position: Vec3, camera_forward: Vec3, weapon_position: Vec3) -> AimRay {
    let direction = camera_forward.normalize_or_zero();
    if direction == Vec3::ZERO {
        return AimRay {
            origin: weapon_position,
            direction: Vec3::NEG_Z,
        };
    }
    let focal = camera_position + direction * FOCAL_DISTANCE;
    let origin = focal + (weapon_position - focal).dot(direction) * direction;
    AimRay { origin, direction }
}

/// Random direction inside a cone around `direction`.
///
/// The cone is split into an angle away from the centre line and an angle around it. The
/// around angle is uniform in `[0, 360)`; the away angle is `U^exponent x half_angle`, so
/// exponents above 1 pull pellets toward the centre.
pub fn vrand_cone(direction: Vec3, half_angle_degrees: f32, exponent: f32, rng: &mut impl Rng) -> Vec3 {
    let forward = direction.normalize_or_zero();
    if half_angle_degrees <= 0.0 || forward == Vec3::ZERO {
        return forward;
    }
    let from_center = rng.gen::<f32>().powf(exponent.max(f32::EPSILON)) * half_angle_degrees;
    let around = rng.gen::<f32>() * 360.0;
    cone_direction(forward, from_center, around)
}

/// Rotate `forward` away from itself by `from_center` degrees, with the tilt axis spun
/// `around` degrees about `forward`.
pub fn cone_direction(forward: Vec3, from_center_degrees: f32, around_degrees: f32) -> Vec3 {
    let up = if forward.y.abs() < 0.9 { Vec3::Y } else { Vec3::X };
    let right = forward.cross(up).normalize();
    let spin = Quat::from_axis_angle(forward, around_degrees.to_radians());
    let tilt_axis = spin * right;
    let tilt = Quat::from_axis_angle(tilt_axis, from_center_degrees.to_radians());
    (tilt * forward).normalize()
}

/// Angle in degrees between two directions.
pub fn angle_between_degrees(a: Vec3, b: Vec3) -> f32 {
    a.normalize_or_zero().angle_between(b.normalize_or_zero()).to_degrees()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_zero_spread_keeps_direction() {
        let mut rng = StdRng::seed_from_u64(1);
        let dir = vrand_cone(Vec3::new(0.0, 0.0, -2.0), 0.0, 1.0, &mut rng);
        assert!((dir - Vec3::NEG_Z).length() < 1e-6);
    }

    #[test]
    fn test_cone_samples_stay_inside() {
        let mut rng = StdRng::seed_from_u64(42);
        let forward = Vec3::new(1.0, 0.2, -0.3).normalize();
        for _ in 0..500 {
            let dir = vrand_cone(forward, 3.0, 1.0, &mut rng);
            assert!(angle_between_degrees(forward, dir) <= 3.0 + 1e-3);
            assert!((dir.length() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_exponent_concentrates_toward_centre() {
        let forward = Vec3::X;
        let mean = |exponent: f32| {
            let mut rng = StdRng::seed_from_u64(9);
            (0..2000)
                .map(|_| angle_between_degrees(forward, vrand_cone(forward, 10.0, exponent, &mut rng)))
                .sum::<f32>()
                / 2000.0
        };
        assert!(mean(3.0) < mean(1.0));
    }

    #[test]
    fn test_cone_direction_exact_angle() {
        let dir = cone_direction(Vec3::NEG_Z, 5.0, 123.0);
        assert!((angle_between_degrees(Vec3::NEG_Z, dir) - 5.0).abs() < 1e-3);
    }

    #[test]
    fn test_focus_origin_moves_to_weapon_plane() {
        let camera = Vec3::new(0.0, 2.0, 3.0);
        let weapon = Vec3::new(0.3, 1.5, 0.0);
        let ray = camera_towards_focus(camera, Vec3::NEG_Z, weapon);
        assert_eq!(ray.direction, Vec3::NEG_Z);
        // Same lateral position as the camera, same depth as the weapon
        assert!((ray.origin - Vec3::new(0.0, 2.0, 0.0)).length() < 1e-5);
        assert!((ray.end(100.0) - Vec3::new(0.0, 2.0, -100.0)).length() < 1e-4);
    }
}
