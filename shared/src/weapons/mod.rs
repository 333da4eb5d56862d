//! Weapon system - stats, runtime state, attachments and the hit-scan pipeline
//!
//! Stats are data: a weapon's `HitScanWeaponStats` is authored in RON as part of its
//! equipment definition, and every number in it is addressable by a `Weapon.Stat.*` tag so
//! attachments can modify it.

pub mod attachments;
pub mod ballistics;
pub mod damage;
pub mod fire_ability;
pub mod firing;
pub mod hitscan;
pub mod instance;
pub mod loadout;
pub mod state;
pub mod trace;

use bevy::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::tags::{tag, GameplayTag, GameplayTagContainer};
use damage::FalloffCurve;

pub use attachments::{
    AttachTarget, AttachmentDefinition, AttachmentInstance, AttachmentSlotDef, StatModifier, StatModifierOp,
    TuningParam, WeaponAttachmentComponent, WeaponAttachmentsConfig,
};
pub use firing::{FireController, FireState};
pub use instance::HitScanWeaponInstance;
pub use loadout::WeaponLoadout;
pub use state::WeaponStateComponent;

/// Stat tag names. Every field of `HitScanWeaponStats` that attachments may touch has one.
pub mod stat {
    pub const FIRE_RATE: &str = "Weapon.Stat.FireRate";
    pub const RANGE_MAX: &str = "Weapon.Stat.Range.Max";
    pub const BULLET_RADIUS: &str = "Weapon.Stat.BulletRadius";

    pub const DAMAGE_BASE: &str = "Weapon.Stat.Damage.Base";
    pub const DAMAGE_HEADSHOT_MULTIPLIER: &str = "Weapon.Stat.Damage.HeadshotMultiplier";
    pub const DAMAGE_ARMOR_PENETRATION: &str = "Weapon.Stat.Damage.ArmorPenetration";
    /// Parent of the per-zone multipliers (`Weapon.Stat.Damage.Zone.Head`, ...).
    pub const DAMAGE_ZONE: &str = "Weapon.Stat.Damage.Zone";

    pub const MAGAZINE_SIZE: &str = "Weapon.Stat.Magazine.Size";
    pub const MAGAZINE_RESERVE_MAX: &str = "Weapon.Stat.Magazine.ReserveMax";
    pub const RELOAD_TIME: &str = "Weapon.Stat.Reload.Time";
    pub const RELOAD_TACTICAL_TIME: &str = "Weapon.Stat.Reload.TacticalTime";

    pub const SPREAD_HIPFIRE_BASE: &str = "Weapon.Stat.Spread.HipFire.Base";
    pub const SPREAD_HIPFIRE_MAX: &str = "Weapon.Stat.Spread.HipFire.Max";
    pub const SPREAD_HIPFIRE_PER_SHOT: &str = "Weapon.Stat.Spread.HipFire.PerShot";
    pub const SPREAD_ADS_BASE: &str = "Weapon.Stat.Spread.ADS.Base";
    pub const SPREAD_ADS_MAX: &str = "Weapon.Stat.Spread.ADS.Max";
    pub const SPREAD_ADS_PER_SHOT: &str = "Weapon.Stat.Spread.ADS.PerShot";
    pub const SPREAD_RECOVERY: &str = "Weapon.Stat.Spread.Recovery";

    pub const RECOIL_VERTICAL_MIN: &str = "Weapon.Stat.Recoil.Vertical.Min";
    pub const RECOIL_VERTICAL_MAX: &str = "Weapon.Stat.Recoil.Vertical.Max";
    pub const RECOIL_HORIZONTAL_MIN: &str = "Weapon.Stat.Recoil.Horizontal.Min";
    pub const RECOIL_HORIZONTAL_MAX: &str = "Weapon.Stat.Recoil.Horizontal.Max";
    pub const RECOIL_ADS_MULTIPLIER: &str = "Weapon.Stat.Recoil.ADSMultiplier";
    pub const RECOIL_HIPFIRE_MULTIPLIER: &str = "Weapon.Stat.Recoil.HipFireMultiplier";
    pub const RECOIL_RECOVERY: &str = "Weapon.Stat.Recoil.Recovery";

    pub const ADS_TIME: &str = "Weapon.Stat.ADS.Time";
    pub const ADS_FOV_MULTIPLIER: &str = "Weapon.Stat.ADS.FOVMultiplier";
    pub const ADS_MOVE_SPEED: &str = "Weapon.Stat.ADS.MoveSpeed";

    /// Scalar stats recomputed on every attachment change, in a stable order.
    pub const TRACKED: &[&str] = &[
        FIRE_RATE,
        RANGE_MAX,
        BULLET_RADIUS,
        DAMAGE_BASE,
        DAMAGE_HEADSHOT_MULTIPLIER,
        DAMAGE_ARMOR_PENETRATION,
        MAGAZINE_SIZE,
        MAGAZINE_RESERVE_MAX,
        RELOAD_TIME,
        RELOAD_TACTICAL_TIME,
        SPREAD_HIPFIRE_BASE,
        SPREAD_HIPFIRE_MAX,
        SPREAD_HIPFIRE_PER_SHOT,
        SPREAD_ADS_BASE,
        SPREAD_ADS_MAX,
        SPREAD_ADS_PER_SHOT,
        SPREAD_RECOVERY,
        RECOIL_VERTICAL_MIN,
        RECOIL_VERTICAL_MAX,
        RECOIL_HORIZONTAL_MIN,
        RECOIL_HORIZONTAL_MAX,
        RECOIL_ADS_MULTIPLIER,
        RECOIL_HIPFIRE_MULTIPLIER,
        RECOIL_RECOVERY,
        ADS_TIME,
        ADS_FOV_MULTIPLIER,
        ADS_MOVE_SPEED,
    ];
}

/// Trigger behaviour
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FireMode {
    /// Fires while the trigger is held
    #[default]
    Auto,
    /// One shot per press
    SemiAuto,
    /// Bursts repeat while the trigger is held
    BurstAuto,
    /// One burst per press
    BurstSingle,
}

impl FireMode {
    pub fn is_burst(self) -> bool {
        matches!(self, FireMode::BurstAuto | FireMode::BurstSingle)
    }
}

/// One step of a fixed recoil pattern, in degrees. Positive pitch looks up, positive yaw right.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoilPatternPoint {
    pub pitch: f32,
    pub yaw: f32,
}

impl RecoilPatternPoint {
    pub const ZERO: Self = Self { pitch: 0.0, yaw: 0.0 };

    pub fn new(pitch: f32, yaw: f32) -> Self {
        Self { pitch, yaw }
    }
}

impl std::ops::Add for RecoilPatternPoint {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.pitch + rhs.pitch, self.yaw + rhs.yaw)
    }
}

impl std::ops::Mul<f32> for RecoilPatternPoint {
    type Output = Self;
    fn mul(self, rhs: f32) -> Self {
        Self::new(self.pitch * rhs, self.yaw * rhs)
    }
}

/// Complete stats for a hit-scan weapon.
///
/// Distances are metres, angles degrees, times seconds. The same record is used for the
/// authored base values and for the computed values after attachment modifiers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HitScanWeaponStats {
    // ===== FIRING =====
    /// Pellets per trigger pull (shotguns > 1)
    pub bullets_per_cartridge: u32,
    /// Maximum trace distance
    pub max_damage_range: f32,
    /// 0 = precise line trace only; > 0 enables the swept second stage
    pub bullet_trace_sweep_radius: f32,
    /// Rounds per minute
    pub fire_rate: f32,
    pub fire_mode: FireMode,
    pub burst_count: u32,
    /// Gap between bursts = fire interval x this
    pub burst_interval_multiplier: f32,

    // ===== DAMAGE =====
    pub base_damage: f32,
    /// X = distance / max range, Y = damage fraction. `None` means no falloff.
    pub damage_falloff_curve: Option<FalloffCurve>,
    /// Keyed by `Gameplay.Character.Zone.*`; first match wins, 1.0 otherwise.
    pub hit_zone_damage_multipliers: BTreeMap<GameplayTag, f32>,
    pub headshot_multiplier: f32,
    pub armor_penetration: f32,

    // ===== AMMO =====
    pub magazine_size: u32,
    pub max_reserve_ammo: u32,
    pub reload_time: f32,
    pub tactical_reload_time: f32,

    // ===== SPREAD =====
    pub hipfire_base_spread: f32,
    pub hipfire_max_spread: f32,
    pub hipfire_spread_per_shot: f32,
    pub ads_base_spread: f32,
    pub ads_max_spread: f32,
    pub ads_spread_per_shot: f32,
    /// Degrees per second back toward base
    pub spread_recovery_rate: f32,
    pub spread_recovery_delay: f32,
    /// Cone sampling exponent; > 1 concentrates pellets toward the centre
    pub spread_exponent: f32,
    pub moving_spread_multiplier: f32,
    pub jumping_spread_multiplier: f32,
    pub crouching_spread_multiplier: f32,

    // ===== RECOIL =====
    /// Empty means random recoil within the min/max ranges
    pub recoil_pattern: Vec<RecoilPatternPoint>,
    pub recoil_pattern_loop_start: usize,
    pub recoil_vertical_min: f32,
    pub recoil_vertical_max: f32,
    pub recoil_horizontal_min: f32,
    pub recoil_horizontal_max: f32,
    pub ads_recoil_multiplier: f32,
    pub hipfire_recoil_multiplier: f32,
    pub crouch_recoil_multiplier: f32,
    pub recoil_recovery_rate: f32,
    pub recoil_recovery_delay: f32,
    /// Fraction of accumulated recoil that recovery may undo
    pub recoil_recovery_percent: f32,

    // ===== FIRST SHOT ACCURACY =====
    pub has_first_shot_accuracy: bool,
    /// Seconds standing still before the first shot becomes perfectly accurate
    pub first_shot_accuracy_time: f32,
    pub first_shot_accuracy_hipfire_only: bool,

    // ===== AIM DOWN SIGHTS =====
    pub ads_time: f32,
    pub ads_fov_multiplier: f32,
    pub ads_move_speed_multiplier: f32,

    /// Tags the weapon itself carries; attachments add and remove on top of these.
    pub weapon_tags: GameplayTagContainer,
}

impl Default for HitScanWeaponStats {
    fn default() -> Self {
        Self {
            bullets_per_cartridge: 1,
            max_damage_range: 250.0,
            bullet_trace_sweep_radius: 0.0,
            fire_rate: 600.0,
            fire_mode: FireMode::Auto,
            burst_count: 3,
            burst_interval_multiplier: 2.0,

            base_damage: 25.0,
            damage_falloff_curve: None,
            hit_zone_damage_multipliers: BTreeMap::new(),
            headshot_multiplier: 2.0,
            armor_penetration: 0.0,

            magazine_size: 30,
            max_reserve_ammo: 120,
            reload_time: 2.0,
            tactical_reload_time: 1.5,

            hipfire_base_spread: 2.0,
            hipfire_max_spread: 6.0,
            hipfire_spread_per_shot: 0.5,
            ads_base_spread: 0.0,
            ads_max_spread: 0.0,
            ads_spread_per_shot: 0.0,
            spread_recovery_rate: 8.0,
            spread_recovery_delay: 0.1,
            spread_exponent: 1.0,
            moving_spread_multiplier: 1.5,
            jumping_spread_multiplier: 3.0,
            crouching_spread_multiplier: 0.7,

            recoil_pattern: Vec::new(),
            recoil_pattern_loop_start: 0,
            recoil_vertical_min: 0.3,
            recoil_vertical_max: 0.5,
            recoil_horizontal_min: -0.2,
            recoil_horizontal_max: 0.2,
            ads_recoil_multiplier: 1.0,
            hipfire_recoil_multiplier: 0.6,
            crouch_recoil_multiplier: 0.8,
            recoil_recovery_rate: 10.0,
            recoil_recovery_delay: 0.15,
            recoil_recovery_percent: 0.5,

            has_first_shot_accuracy: true,
            first_shot_accuracy_time: 0.2,
            first_shot_accuracy_hipfire_only: true,

            ads_time: 0.2,
            ads_fov_multiplier: 0.8,
            ads_move_speed_multiplier: 0.8,

            weapon_tags: GameplayTagContainer::new(),
        }
    }
}

impl HitScanWeaponStats {
    /// Seconds between shots.
    pub fn fire_interval(&self) -> f32 {
        if self.fire_rate > 0.0 {
            60.0 / self.fire_rate
        } else {
            0.0
        }
    }

    pub fn has_recoil_pattern(&self) -> bool {
        !self.recoil_pattern.is_empty()
    }

    /// Pattern entry for a 0-based shot index. Past the end the pattern loops from
    /// `recoil_pattern_loop_start`.
    pub fn recoil_pattern_point(&self, shot_index: usize) -> RecoilPatternPoint {
        let len = self.recoil_pattern.len();
        if len == 0 {
            return RecoilPatternPoint::ZERO;
        }
        if shot_index < len {
            return self.recoil_pattern[shot_index];
        }
        let loop_start = self.recoil_pattern_loop_start.min(len - 1);
        let loop_len = len - loop_start;
        self.recoil_pattern[loop_start + (shot_index - len) % loop_len]
    }

    /// Read a scalar stat by tag. Zone tags read from the zone multiplier table.
    pub fn stat_value(&self, stat_tag: &GameplayTag) -> Option<f32> {
        let value = match stat_tag.as_str() {
            stat::FIRE_RATE => self.fire_rate,
            stat::RANGE_MAX => self.max_damage_range,
            stat::BULLET_RADIUS => self.bullet_trace_sweep_radius,
            stat::DAMAGE_BASE => self.base_damage,
            stat::DAMAGE_HEADSHOT_MULTIPLIER => self.headshot_multiplier,
            stat::DAMAGE_ARMOR_PENETRATION => self.armor_penetration,
            stat::MAGAZINE_SIZE => self.magazine_size as f32,
            stat::MAGAZINE_RESERVE_MAX => self.max_reserve_ammo as f32,
            stat::RELOAD_TIME => self.reload_time,
            stat::RELOAD_TACTICAL_TIME => self.tactical_reload_time,
            stat::SPREAD_HIPFIRE_BASE => self.hipfire_base_spread,
            stat::SPREAD_HIPFIRE_MAX => self.hipfire_max_spread,
            stat::SPREAD_HIPFIRE_PER_SHOT => self.hipfire_spread_per_shot,
            stat::SPREAD_ADS_BASE => self.ads_base_spread,
            stat::SPREAD_ADS_MAX => self.ads_max_spread,
            stat::SPREAD_ADS_PER_SHOT => self.ads_spread_per_shot,
            stat::SPREAD_RECOVERY => self.spread_recovery_rate,
            stat::RECOIL_VERTICAL_MIN => self.recoil_vertical_min,
            stat::RECOIL_VERTICAL_MAX => self.recoil_vertical_max,
            stat::RECOIL_HORIZONTAL_MIN => self.recoil_horizontal_min,
            stat::RECOIL_HORIZONTAL_MAX => self.recoil_horizontal_max,
            stat::RECOIL_ADS_MULTIPLIER => self.ads_recoil_multiplier,
            stat::RECOIL_HIPFIRE_MULTIPLIER => self.hipfire_recoil_multiplier,
            stat::RECOIL_RECOVERY => self.recoil_recovery_rate,
            stat::ADS_TIME => self.ads_time,
            stat::ADS_FOV_MULTIPLIER => self.ads_fov_multiplier,
            stat::ADS_MOVE_SPEED => self.ads_move_speed_multiplier,
            _ => return self.zone_multiplier_for_stat(stat_tag),
        };
        Some(value)
    }

    /// Write a scalar stat by tag. Returns false for unknown tags.
    pub fn set_stat_value(&mut self, stat_tag: &GameplayTag, value: f32) -> bool {
        match stat_tag.as_str() {
            stat::FIRE_RATE => self.fire_rate = value,
            stat::RANGE_MAX => self.max_damage_range = value,
            stat::BULLET_RADIUS => self.bullet_trace_sweep_radius = value,
            stat::DAMAGE_BASE => self.base_damage = value,
            stat::DAMAGE_HEADSHOT_MULTIPLIER => self.headshot_multiplier = value,
            stat::DAMAGE_ARMOR_PENETRATION => self.armor_penetration = value,
            stat::MAGAZINE_SIZE => self.magazine_size = value.round().max(0.0) as u32,
            stat::MAGAZINE_RESERVE_MAX => self.max_reserve_ammo = value.round().max(0.0) as u32,
            stat::RELOAD_TIME => self.reload_time = value,
            stat::RELOAD_TACTICAL_TIME => self.tactical_reload_time = value,
            stat::SPREAD_HIPFIRE_BASE => self.hipfire_base_spread = value,
            stat::SPREAD_HIPFIRE_MAX => self.hipfire_max_spread = value,
            stat::SPREAD_HIPFIRE_PER_SHOT => self.hipfire_spread_per_shot = value,
            stat::SPREAD_ADS_BASE => self.ads_base_spread = value,
            stat::SPREAD_ADS_MAX => self.ads_max_spread = value,
            stat::SPREAD_ADS_PER_SHOT => self.ads_spread_per_shot = value,
            stat::SPREAD_RECOVERY => self.spread_recovery_rate = value,
            stat::RECOIL_VERTICAL_MIN => self.recoil_vertical_min = value,
            stat::RECOIL_VERTICAL_MAX => self.recoil_vertical_max = value,
            stat::RECOIL_HORIZONTAL_MIN => self.recoil_horizontal_min = value,
            stat::RECOIL_HORIZONTAL_MAX => self.recoil_horizontal_max = value,
            stat::RECOIL_ADS_MULTIPLIER => self.ads_recoil_multiplier = value,
            stat::RECOIL_HIPFIRE_MULTIPLIER => self.hipfire_recoil_multiplier = value,
            stat::RECOIL_RECOVERY => self.recoil_recovery_rate = value,
            stat::ADS_TIME => self.ads_time = value,
            stat::ADS_FOV_MULTIPLIER => self.ads_fov_multiplier = value,
            stat::ADS_MOVE_SPEED => self.ads_move_speed_multiplier = value,
            _ => {
                let Some(zone) = zone_for_stat_tag(stat_tag) else {
                    return false;
                };
                self.hit_zone_damage_multipliers.insert(zone, value);
            }
        }
        true
    }

    fn zone_multiplier_for_stat(&self, stat_tag: &GameplayTag) -> Option<f32> {
        let zone = zone_for_stat_tag(stat_tag)?;
        self.hit_zone_damage_multipliers.get(&zone).copied()
    }
}

/// `Gameplay.Character.Zone.Head` -> `Weapon.Stat.Damage.Zone.Head`
pub fn stat_tag_for_zone(zone: &GameplayTag) -> Option<GameplayTag> {
    zone.replace_prefix(&tag(crate::tags::names::GAMEPLAY_CHARACTER_ZONE), &tag(stat::DAMAGE_ZONE))
}

/// `Weapon.Stat.Damage.Zone.Head` -> `Gameplay.Character.Zone.Head`
pub fn zone_for_stat_tag(stat_tag: &GameplayTag) -> Option<GameplayTag> {
    stat_tag.replace_prefix(&tag(stat::DAMAGE_ZONE), &tag(crate::tags::names::GAMEPLAY_CHARACTER_ZONE))
}

/// Broadcast on `Yc.Weapon.Message.StatsChanged` after a recalculation.
#[derive(Clone, Debug, PartialEq)]
pub struct WeaponStatsChangedMessage {
    pub weapon: Option<crate::equipment::EquipmentInstanceId>,
    pub owner: Option<u64>,
    pub new_computed_stats: HitScanWeaponStats,
}

/// Debug drawing toggle for bullet traces (mirrors the `Yc.Weapon.DrawBullet*` console variables)
#[derive(Resource, Default)]
pub struct WeaponDebugMode(pub bool);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_interval() {
        let stats = HitScanWeaponStats::default();
        assert_eq!(stats.bullets_per_cartridge, 1);
        assert!((stats.fire_interval() - 0.1).abs() < 1e-6);
        assert!(!stats.has_recoil_pattern());
    }

    #[test]
    fn test_recoil_pattern_loops_from_start() {
        let stats = HitScanWeaponStats {
            recoil_pattern: (0..4).map(|i| RecoilPatternPoint::new(i as f32, 0.0)).collect(),
            recoil_pattern_loop_start: 2,
            ..Default::default()
        };
        let pitches: Vec<f32> = (0..8).map(|i| stats.recoil_pattern_point(i).pitch).collect();
        assert_eq!(pitches, vec![0.0, 1.0, 2.0, 3.0, 2.0, 3.0, 2.0, 3.0]);
    }

    #[test]
    fn test_recoil_pattern_clamps_bad_loop_start() {
        let stats = HitScanWeaponStats {
            recoil_pattern: vec![RecoilPatternPoint::new(1.0, 0.0), RecoilPatternPoint::new(2.0, 0.0)],
            recoil_pattern_loop_start: 10,
            ..Default::default()
        };
        assert_eq!(stats.recoil_pattern_point(5).pitch, 2.0);
    }

    #[test]
    fn test_stat_access_by_tag() {
        let mut stats = HitScanWeaponStats::default();
        assert_eq!(stats.stat_value(&tag(stat::DAMAGE_BASE)), Some(25.0));
        assert!(stats.set_stat_value(&tag(stat::MAGAZINE_SIZE), 40.4));
        assert_eq!(stats.magazine_size, 40);
        assert!(!stats.set_stat_value(&tag("Weapon.Stat.Unknown"), 1.0));

        let head_stat = tag("Weapon.Stat.Damage.Zone.Head");
        assert!(stats.set_stat_value(&head_stat, 2.5));
        assert_eq!(
            stats.hit_zone_damage_multipliers.get(&tag(crate::tags::names::GAMEPLAY_CHARACTER_ZONE_HEAD)),
            Some(&2.5)
        );
        assert_eq!(stats.stat_value(&head_stat), Some(2.5));
    }

    #[test]
    fn test_stats_from_ron() {
        let stats: HitScanWeaponStats = ron::from_str(
            r#"(
                fire_rate: 900.0,
                fire_mode: BurstSingle,
                hit_zone_damage_multipliers: {"Gameplay.Character.Zone.Head": 2.0},
                recoil_pattern: [(pitch: 0.5, yaw: 0.1)],
            )"#,
        )
        .unwrap();
        assert_eq!(stats.fire_mode, FireMode::BurstSingle);
        assert_eq!(stats.base_damage, 25.0);
        assert_eq!(stats.recoil_pattern.len(), 1);
    }
}
