//! Damage calculation
//!
//! Distance attenuation through an optional falloff curve, hit-zone multipliers looked up
//! from the hit surface's tags, and armor absorption.

use serde::{Deserialize, Serialize};

use super::HitScanWeaponStats;
use crate::tags::{names, tag, GameplayTag, GameplayTagContainer};

/// Piecewise-linear curve over `[0, 1]` with constant extrapolation at both ends.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FalloffCurve {
    /// `(x, y)` keys sorted by `x`
    pub keys: Vec<(f32, f32)>,
}

impl FalloffCurve {
    pub fn new(mut keys: Vec<(f32, f32)>) -> Self {
        keys.sort_by(|a, b| a.0.total_cmp(&b.0));
        Self { keys }
    }

    pub fn evaluate(&self, x: f32) -> f32 {
        let (Some(first), Some(last)) = (self.keys.first(), self.keys.last()) else {
            return 1.0;
        };
        if x <= first.0 {
            return first.1;
        }
        if x >= last.0 {
            return last.1;
        }
        for pair in self.keys.windows(2) {
            let (x0, y0) = pair[0];
            let (x1, y1) = pair[1];
            if x >= x0 && x <= x1 {
                if (x1 - x0).abs() < f32::EPSILON {
                    return y1;
                }
                let t = (x - x0) / (x1 - x0);
                return y0 + (y1 - y0) * t;
            }
        }
        last.1
    }
}

/// Damage fraction at `distance`, clamped to `[0, 1]`. No curve means no falloff.
pub fn distance_attenuation(stats: &HitScanWeaponStats, distance: f32) -> f32 {
    let Some(curve) = &stats.damage_falloff_curve else {
        return 1.0;
    };
    if stats.max_damage_range <= 0.0 {
        return 1.0;
    }
    let fraction = (distance / stats.max_damage_range).clamp(0.0, 1.0);
    curve.evaluate(fraction).clamp(0.0, 1.0)
}

/// Multiplier for the first surface tag present in the zone table; 1.0 if none match.
pub fn physical_material_attenuation(stats: &HitScanWeaponStats, surface_tags: &GameplayTagContainer) -> f32 {
    for surface_tag in surface_tags {
        if let Some(multiplier) = stats.hit_zone_damage_multipliers.get(surface_tag) {
            return *multiplier;
        }
    }
    1.0
}

/// The hit zone among a surface's tags (`Gameplay.Zone.*` or `Gameplay.Character.Zone.*`).
pub fn hit_zone_from_tags(surface_tags: &GameplayTagContainer) -> Option<GameplayTag> {
    let zone = tag(names::GAMEPLAY_ZONE);
    let character_zone = tag(names::GAMEPLAY_CHARACTER_ZONE);
    surface_tags
        .iter()
        .find(|t| t.matches_tag(&zone) || t.matches_tag(&character_zone))
        .cloned()
}

/// Zone tag for a hit on a standing capsule. `relative_height` is 0 at the feet, 1 at the top.
pub fn zone_from_relative_height(relative_height: f32) -> GameplayTag {
    if relative_height > 0.85 {
        tag(names::GAMEPLAY_CHARACTER_ZONE_HEAD)
    } else if relative_height > 0.45 {
        tag(names::GAMEPLAY_CHARACTER_ZONE_CHEST)
    } else {
        tag(names::GAMEPLAY_CHARACTER_ZONE_LEGS)
    }
}

/// Final damage for one pellet.
pub fn calculate_damage(stats: &HitScanWeaponStats, distance: f32, surface_tags: &GameplayTagContainer) -> f32 {
    stats.base_damage * distance_attenuation(stats, distance) * physical_material_attenuation(stats, surface_tags)
}

/// Damage after armor. Armor absorbs `protection` of the hit, reduced by the weapon's
/// armor penetration. Returns `(damage_to_health, remaining_armor)`.
pub fn calculate_damage_with_armor(raw_damage: f32, armor_penetration: f32, armor: f32, protection: f32) -> (f32, f32) {
    if armor <= 0.0 {
        return (raw_damage, 0.0);
    }
    let effective_protection = (protection * (1.0 - armor_penetration.clamp(0.0, 1.0))).clamp(0.0, 1.0);
    let absorbed = (raw_damage * effective_protection).min(armor);
    ((raw_damage - absorbed).max(0.0), (armor - absorbed).max(0.0))
}

/// Result of a damage calculation
#[derive(Clone, Debug, PartialEq)]
pub struct DamageResult {
    pub damage: f32,
    pub hit_zone: Option<GameplayTag>,
    pub is_headshot: bool,
    pub is_kill: bool,
    pub distance: f32,
}

impl DamageResult {
    pub fn new(damage: f32, hit_zone: Option<GameplayTag>, distance: f32, victim_health: f32) -> Self {
        let is_headshot = hit_zone
            .as_ref()
            .is_some_and(|z| z.matches_tag(&tag(names::GAMEPLAY_CHARACTER_ZONE_HEAD)));
        Self {
            damage,
            hit_zone,
            is_headshot,
            is_kill: damage >= victim_health,
            distance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::tag_container;

    fn rifle() -> HitScanWeaponStats {
        let mut stats = HitScanWeaponStats {
            base_damage: 30.0,
            max_damage_range: 100.0,
            damage_falloff_curve: Some(FalloffCurve::new(vec![(0.0, 1.0), (0.5, 1.0), (1.0, 0.5)])),
            ..Default::default()
        };
        stats
            .hit_zone_damage_multipliers
            .insert(tag(names::GAMEPLAY_CHARACTER_ZONE_HEAD), 2.0);
        stats
    }

    #[test]
    fn test_no_falloff_close_range() {
        let stats = rifle();
        assert!((calculate_damage(&stats, 10.0, &GameplayTagContainer::new()) - 30.0).abs() < 1e-4);
    }

    #[test]
    fn test_falloff_interpolates_and_clamps() {
        let stats = rifle();
        assert!((distance_attenuation(&stats, 75.0) - 0.75).abs() < 1e-4);
        assert!((distance_attenuation(&stats, 5000.0) - 0.5).abs() < 1e-4);
        let flat = HitScanWeaponStats::default();
        assert_eq!(distance_attenuation(&flat, 5000.0), 1.0);
    }

    #[test]
    fn test_zone_multiplier_first_match() {
        let stats = rifle();
        let head = tag_container(&[names::GAMEPLAY_CHARACTER_ZONE_HEAD]);
        assert!((calculate_damage(&stats, 0.0, &head) - 60.0).abs() < 1e-4);
        let chest = tag_container(&[names::GAMEPLAY_CHARACTER_ZONE_CHEST]);
        assert_eq!(physical_material_attenuation(&stats, &chest), 1.0);
        assert_eq!(hit_zone_from_tags(&head), Some(tag(names::GAMEPLAY_CHARACTER_ZONE_HEAD)));
    }

    #[test]
    fn test_armor_penetration() {
        let (damage, armor) = calculate_damage_with_armor(40.0, 0.0, 100.0, 0.5);
        assert_eq!((damage, armor), (20.0, 80.0));
        let (damage, _) = calculate_damage_with_armor(40.0, 1.0, 100.0, 0.5);
        assert_eq!(damage, 40.0);
    }
}
