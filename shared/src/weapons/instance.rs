//! Hit-scan weapon runtime state
//!
//! Spread, recoil, first-shot accuracy and the shot counter live here. Nothing in this struct
//! replicates; each endpoint ticks its own copy. Computed stats are rebuilt from the authored
//! base stats plus installed attachment modifiers whenever attachments change.

use bevy::prelude::*;
use rand::Rng;

use super::attachments::WeaponAttachmentComponent;
use super::damage;
use super::{stat, stat_tag_for_zone, zone_for_stat_tag, HitScanWeaponStats, RecoilPatternPoint};
use crate::ability::AbilitySystemComponent;
use crate::tags::{tag, GameplayTag, GameplayTagContainer};

/// Owner speed (m/s) above which the moving spread multiplier applies.
pub const MOVING_SPEED_THRESHOLD: f32 = 0.1;
/// Owner speed squared below which the owner counts as standing still.
pub const STATIONARY_SPEED_SQ: f32 = 0.01;

const NEARLY_EQUAL: f32 = 1.0e-4;

fn nearly_equal(a: f32, b: f32) -> bool {
    (a - b).abs() <= NEARLY_EQUAL
}

/// What the weapon needs to know about its owner each tick.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct OwnerMotion {
    pub velocity: Vec3,
    pub is_falling: bool,
    pub is_crouching: bool,
}

#[derive(Clone, Debug)]
pub struct HitScanWeaponInstance {
    base_stats: HitScanWeaponStats,
    computed_stats: HitScanWeaponStats,

    current_hipfire_spread: f32,
    current_ads_spread: f32,
    spread_multiplier: f32,

    accumulated_recoil: RecoilPatternPoint,
    /// How much of the accumulated recoil recovery may still undo, per axis.
    recoverable_recoil: RecoilPatternPoint,

    current_shot_count: u32,
    last_fire_time: f64,
    stationary_time: f32,
    has_first_shot_accuracy: bool,

    weapon_tags: GameplayTagContainer,
    /// Blocked ability tags currently pushed onto the owner's ASC.
    applied_blocked_tags: GameplayTagContainer,
}

impl HitScanWeaponInstance {
    pub fn new(base_stats: HitScanWeaponStats) -> Self {
        let mut instance = Self {
            computed_stats: base_stats.clone(),
            weapon_tags: base_stats.weapon_tags.clone(),
            base_stats,
            current_hipfire_spread: 0.0,
            current_ads_spread: 0.0,
            spread_multiplier: 1.0,
            accumulated_recoil: RecoilPatternPoint::ZERO,
            recoverable_recoil: RecoilPatternPoint::ZERO,
            current_shot_count: 0,
            last_fire_time: f64::NEG_INFINITY,
            stationary_time: 0.0,
            has_first_shot_accuracy: true,
            applied_blocked_tags: GameplayTagContainer::new(),
        };
        instance.recalculate_stats(None);
        instance.reset_spread();
        instance
    }

    // ===== STATS =====

    pub fn base_stats(&self) -> &HitScanWeaponStats {
        &self.base_stats
    }

    pub fn computed_stats(&self) -> &HitScanWeaponStats {
        &self.computed_stats
    }

    /// Rebuild computed stats from the base stats and every installed attachment modifier.
    /// Spread is re-clamped into the new `[base, max]` window.
    pub fn recalculate_stats(&mut self, attachments: Option<&WeaponAttachmentComponent>) {
        let mut computed = self.base_stats.clone();
        if let Some(attachments) = attachments {
            for name in stat::TRACKED {
                let stat_tag = tag(name);
                if let Some(base) = computed.stat_value(&stat_tag) {
                    let value = attachments.calculate_final_stat_value(&stat_tag, base);
                    computed.set_stat_value(&stat_tag, value);
                }
            }
            let zones: Vec<(GameplayTag, f32)> = computed
                .hit_zone_damage_multipliers
                .iter()
                .filter_map(|(zone, value)| stat_tag_for_zone(zone).map(|s| (s, *value)))
                .collect();
            for (stat_tag, base) in zones {
                let value = attachments.calculate_final_stat_value(&stat_tag, base);
                if let Some(zone) = zone_for_stat_tag(&stat_tag) {
                    computed.hit_zone_damage_multipliers.insert(zone, value);
                }
            }
        }
        self.computed_stats = computed;
        self.update_weapon_tags(attachments);
        self.clamp_spread_to_window();
    }

    fn clamp_spread_to_window(&mut self) {
        let s = &self.computed_stats;
        self.current_hipfire_spread = self
            .current_hipfire_spread
            .clamp(s.hipfire_base_spread, s.hipfire_max_spread.max(s.hipfire_base_spread));
        self.current_ads_spread = self
            .current_ads_spread
            .clamp(s.ads_base_spread, s.ads_max_spread.max(s.ads_base_spread));
    }

    fn reset_spread(&mut self) {
        self.current_hipfire_spread = self.computed_stats.hipfire_base_spread;
        self.current_ads_spread = self.computed_stats.ads_base_spread;
    }

    pub fn distance_attenuation(&self, distance: f32) -> f32 {
        damage::distance_attenuation(&self.computed_stats, distance)
    }

    pub fn physical_material_attenuation(&self, surface_tags: &GameplayTagContainer) -> f32 {
        damage::physical_material_attenuation(&self.computed_stats, surface_tags)
    }

    // ===== LIFECYCLE =====

    pub fn on_equipped(&mut self, asc: Option<&mut AbilitySystemComponent>, attachments: Option<&WeaponAttachmentComponent>) {
        self.has_first_shot_accuracy = true;
        self.current_shot_count = 0;
        self.stationary_time = 0.0;
        if let (Some(asc), Some(attachments)) = (asc, attachments) {
            self.apply_attachment_tags_to_asc(asc, attachments);
        }
    }

    pub fn on_unequipped(&mut self, asc: Option<&mut AbilitySystemComponent>) {
        self.reset_spread();
        self.current_shot_count = 0;
        self.accumulated_recoil = RecoilPatternPoint::ZERO;
        self.recoverable_recoil = RecoilPatternPoint::ZERO;
        if let Some(asc) = asc {
            self.remove_attachment_tags_from_asc(asc);
        }
    }

    /// Push installed attachments' blocked ability tags onto the owner as loose tags.
    pub fn apply_attachment_tags_to_asc(&mut self, asc: &mut AbilitySystemComponent, attachments: &WeaponAttachmentComponent) {
        self.remove_attachment_tags_from_asc(asc);
        let blocked = attachments.blocked_ability_tags();
        if blocked.is_empty() {
            return;
        }
        asc.add_loose_gameplay_tags(&blocked, 1);
        self.applied_blocked_tags = blocked;
    }

    pub fn remove_attachment_tags_from_asc(&mut self, asc: &mut AbilitySystemComponent) {
        if self.applied_blocked_tags.is_empty() {
            return;
        }
        asc.remove_loose_gameplay_tags(&self.applied_blocked_tags, 1);
        self.applied_blocked_tags.reset();
    }

    pub fn applied_blocked_tags(&self) -> &GameplayTagContainer {
        &self.applied_blocked_tags
    }

    // ===== TAGS =====

    fn update_weapon_tags(&mut self, attachments: Option<&WeaponAttachmentComponent>) {
        let mut tags = self.base_stats.weapon_tags.clone();
        if let Some(attachments) = attachments {
            tags.append(&attachments.granted_tags());
            tags.remove_tags(&attachments.removed_tags());
        }
        self.weapon_tags = tags;
    }

    pub fn weapon_tags(&self) -> &GameplayTagContainer {
        &self.weapon_tags
    }

    pub fn has_weapon_tag(&self, t: &GameplayTag) -> bool {
        self.weapon_tags.has_tag(t)
    }

    pub fn has_any_weapon_tags(&self, tags: &GameplayTagContainer) -> bool {
        self.weapon_tags.has_any(tags)
    }

    pub fn has_all_weapon_tags(&self, tags: &GameplayTagContainer) -> bool {
        self.weapon_tags.has_all(tags)
    }

    pub fn weapon_tags_by_category(&self, category: &GameplayTag) -> GameplayTagContainer {
        self.weapon_tags.filter(category)
    }

    // ===== FIRING =====

    /// Record a shot: spread grows on the active aim state, first-shot accuracy is spent.
    pub fn on_fired(&mut self, is_aiming: bool, now: f64) {
        self.last_fire_time = now;
        self.stationary_time = 0.0;
        self.has_first_shot_accuracy = false;
        self.current_shot_count += 1;

        let s = &self.computed_stats;
        if is_aiming {
            self.current_ads_spread = (self.current_ads_spread + s.ads_spread_per_shot).min(s.ads_max_spread.max(s.ads_base_spread));
        } else {
            self.current_hipfire_spread =
                (self.current_hipfire_spread + s.hipfire_spread_per_shot).min(s.hipfire_max_spread.max(s.hipfire_base_spread));
        }
    }

    /// Last-fire timestamp without spending a shot, used when a firing ability activates.
    pub fn update_firing_time(&mut self, now: f64) {
        self.last_fire_time = now;
    }

    /// Recoil for the shot just fired, scaled by aim and stance, and accumulated.
    pub fn recoil_for_current_shot(&mut self, is_aiming: bool, is_crouching: bool, rng: &mut impl Rng) -> RecoilPatternPoint {
        let s = &self.computed_stats;
        let raw = if s.has_recoil_pattern() {
            s.recoil_pattern_point(self.current_shot_count.saturating_sub(1) as usize)
        } else {
            RecoilPatternPoint::new(
                random_range(rng, s.recoil_vertical_min, s.recoil_vertical_max),
                random_range(rng, s.recoil_horizontal_min, s.recoil_horizontal_max),
            )
        };
        let mut multiplier = if is_aiming {
            s.ads_recoil_multiplier
        } else {
            s.hipfire_recoil_multiplier
        };
        if is_crouching {
            multiplier *= s.crouch_recoil_multiplier;
        }
        let recoil = raw * multiplier;
        let percent = s.recoil_recovery_percent.clamp(0.0, 1.0);
        self.accumulated_recoil = self.accumulated_recoil + recoil;
        self.recoverable_recoil = self.recoverable_recoil
            + RecoilPatternPoint::new(recoil.pitch.abs() * percent, recoil.yaw.abs() * percent);
        recoil
    }

    /// Recoil already applied to the view that the caller has undone some other way.
    pub fn consume_accumulated_recoil(&mut self, amount: RecoilPatternPoint) {
        self.accumulated_recoil.pitch = (self.accumulated_recoil.pitch - amount.pitch).max(0.0);
        self.accumulated_recoil.yaw -= amount.yaw;
    }

    /// Effective cone half-angle for the next pellet, in degrees.
    pub fn effective_spread(&self, is_aiming: bool) -> f32 {
        if self.has_first_shot_accuracy(is_aiming) {
            return 0.0;
        }
        if is_aiming {
            self.current_ads_spread
        } else {
            self.current_hipfire_spread * self.spread_multiplier
        }
    }

    pub fn current_spread_angle(&self, is_aiming: bool) -> f32 {
        if is_aiming {
            self.current_ads_spread
        } else {
            self.current_hipfire_spread
        }
    }

    pub fn current_spread_multiplier(&self) -> f32 {
        self.spread_multiplier
    }

    pub fn has_first_shot_accuracy(&self, is_aiming: bool) -> bool {
        let s = &self.computed_stats;
        if !s.has_first_shot_accuracy {
            return false;
        }
        if s.first_shot_accuracy_hipfire_only && is_aiming {
            return false;
        }
        self.has_first_shot_accuracy
    }

    pub fn accumulated_recoil(&self) -> RecoilPatternPoint {
        self.accumulated_recoil
    }

    pub fn current_shot_count(&self) -> u32 {
        self.current_shot_count
    }

    pub fn last_fire_time(&self) -> f64 {
        self.last_fire_time
    }

    // ===== TICK =====

    /// Order matters: spread recovery, recoil recovery, first-shot accuracy, state multiplier.
    /// Returns the recoil recovered this tick so the caller can rotate the view back.
    pub fn tick(&mut self, dt: f32, now: f64, motion: Option<OwnerMotion>) -> RecoilPatternPoint {
        self.update_spread(dt, now);
        let recovered = self.update_recoil_recovery(dt, now);
        self.update_first_shot_accuracy(dt, motion);
        self.update_state_multiplier(motion);
        recovered
    }

    fn update_spread(&mut self, dt: f32, now: f64) {
        let s = &self.computed_stats;
        if (now - self.last_fire_time) as f32 <= s.spread_recovery_delay {
            return;
        }
        let step = s.spread_recovery_rate * dt;
        self.current_hipfire_spread = (self.current_hipfire_spread - step).max(s.hipfire_base_spread);
        self.current_ads_spread = (self.current_ads_spread - step).max(s.ads_base_spread);
        if nearly_equal(self.current_hipfire_spread, s.hipfire_base_spread) && nearly_equal(self.current_ads_spread, s.ads_base_spread) {
            self.current_hipfire_spread = s.hipfire_base_spread;
            self.current_ads_spread = s.ads_base_spread;
            self.current_shot_count = 0;
        }
    }

    fn update_recoil_recovery(&mut self, dt: f32, now: f64) -> RecoilPatternPoint {
        let s = &self.computed_stats;
        if (now - self.last_fire_time) as f32 <= s.recoil_recovery_delay {
            return RecoilPatternPoint::ZERO;
        }
        let step = s.recoil_recovery_rate * dt;
        let mut recovered = RecoilPatternPoint::ZERO;

        if self.accumulated_recoil.pitch > 0.0 {
            let amount = step.min(self.accumulated_recoil.pitch).min(self.recoverable_recoil.pitch);
            self.accumulated_recoil.pitch -= amount;
            self.recoverable_recoil.pitch -= amount;
            recovered.pitch = amount;
        }
        if self.accumulated_recoil.yaw.abs() > 0.01 {
            let amount = step.min(self.accumulated_recoil.yaw.abs()).min(self.recoverable_recoil.yaw);
            let signed = amount * self.accumulated_recoil.yaw.signum();
            self.accumulated_recoil.yaw -= signed;
            self.recoverable_recoil.yaw -= amount;
            recovered.yaw = signed;
        }
        recovered
    }

    fn update_first_shot_accuracy(&mut self, dt: f32, motion: Option<OwnerMotion>) {
        if !self.computed_stats.has_first_shot_accuracy {
            self.has_first_shot_accuracy = false;
            return;
        }
        let Some(motion) = motion else {
            return;
        };
        if motion.velocity.length_squared() < STATIONARY_SPEED_SQ {
            self.stationary_time += dt;
            let s = &self.computed_stats;
            if self.stationary_time >= s.first_shot_accuracy_time
                && nearly_equal(self.current_hipfire_spread, s.hipfire_base_spread)
                && nearly_equal(self.current_ads_spread, s.ads_base_spread)
            {
                self.has_first_shot_accuracy = true;
            }
        } else {
            self.stationary_time = 0.0;
            self.has_first_shot_accuracy = false;
        }
    }

    fn update_state_multiplier(&mut self, motion: Option<OwnerMotion>) {
        let Some(motion) = motion else {
            self.spread_multiplier = 1.0;
            return;
        };
        let s = &self.computed_stats;
        let mut multiplier = 1.0;
        if motion.velocity.length() > MOVING_SPEED_THRESHOLD {
            multiplier *= s.moving_spread_multiplier;
        }
        if motion.is_falling {
            multiplier *= s.jumping_spread_multiplier;
        } else if motion.is_crouching {
            multiplier *= s.crouching_spread_multiplier;
        }
        self.spread_multiplier = multiplier;
    }
}

fn random_range(rng: &mut impl Rng, min: f32, max: f32) -> f32 {
    if max > min {
        rng.gen_range(min..=max)
    } else {
        min
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn s3_stats() -> HitScanWeaponStats {
        HitScanWeaponStats {
            hipfire_base_spread: 2.0,
            hipfire_max_spread: 6.0,
            hipfire_spread_per_shot: 1.0,
            spread_recovery_rate: 8.0,
            spread_recovery_delay: 0.1,
            ..Default::default()
        }
    }

    fn still() -> Option<OwnerMotion> {
        Some(OwnerMotion::default())
    }

    #[test]
    fn test_spread_grows_and_recovers() {
        let mut weapon = HitScanWeaponInstance::new(s3_stats());
        let mut now = 0.0;
        let dt = 1.0 / 60.0;
        let mut expected = 2.0;
        for shot in 0..4 {
            weapon.on_fired(false, now);
            expected += 1.0;
            assert!((weapon.current_spread_angle(false) - expected).abs() < 1e-4, "shot {shot}");
            // Ticks between shots stay inside the recovery delay
            for _ in 0..3 {
                now += dt;
                weapon.tick(dt as f32, now, still());
            }
        }
        assert_eq!(weapon.current_shot_count(), 4);
        assert!((weapon.current_spread_angle(false) - 6.0).abs() < 1e-4);

        for _ in 0..60 {
            now += dt;
            weapon.tick(dt as f32, now, still());
        }
        assert_eq!(weapon.current_spread_angle(false), 2.0);
        assert_eq!(weapon.current_shot_count(), 0);
    }

    #[test]
    fn test_spread_clamped_at_max() {
        let mut weapon = HitScanWeaponInstance::new(s3_stats());
        for i in 0..20 {
            weapon.on_fired(false, i as f64 * 0.01);
        }
        assert_eq!(weapon.current_spread_angle(false), 6.0);
    }

    #[test]
    fn test_first_shot_accuracy_cycle() {
        let mut weapon = HitScanWeaponInstance::new(s3_stats());
        assert_eq!(weapon.effective_spread(false), 0.0);

        weapon.on_fired(false, 0.0);
        assert!(!weapon.has_first_shot_accuracy(false));
        assert!(weapon.effective_spread(false) > 0.0);

        // Moving resets the stationary timer
        let moving = Some(OwnerMotion {
            velocity: Vec3::new(3.0, 0.0, 0.0),
            ..Default::default()
        });
        let mut now = 0.0;
        for _ in 0..120 {
            now += 0.01;
            weapon.tick(0.01, now, moving);
        }
        assert!(!weapon.has_first_shot_accuracy(false));
        assert!((weapon.current_spread_multiplier() - 1.5).abs() < 1e-6);

        for _ in 0..30 {
            now += 0.01;
            weapon.tick(0.01, now, still());
        }
        assert!(weapon.has_first_shot_accuracy(false));
        // Hip-fire only by default
        assert!(!weapon.has_first_shot_accuracy(true));
    }

    #[test]
    fn test_state_multiplier_falling_and_crouching() {
        let mut weapon = HitScanWeaponInstance::new(HitScanWeaponStats::default());
        weapon.tick(
            0.01,
            1.0,
            Some(OwnerMotion {
                is_falling: true,
                is_crouching: true,
                ..Default::default()
            }),
        );
        assert!((weapon.current_spread_multiplier() - 3.0).abs() < 1e-6);
        weapon.tick(
            0.01,
            1.0,
            Some(OwnerMotion {
                is_crouching: true,
                ..Default::default()
            }),
        );
        assert!((weapon.current_spread_multiplier() - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_pattern_recoil_scaled_and_accumulated() {
        let stats = HitScanWeaponStats {
            recoil_pattern: vec![RecoilPatternPoint::new(1.0, 0.5), RecoilPatternPoint::new(2.0, -0.5)],
            hipfire_recoil_multiplier: 0.5,
            crouch_recoil_multiplier: 0.5,
            ..Default::default()
        };
        let mut weapon = HitScanWeaponInstance::new(stats);
        let mut rng = StdRng::seed_from_u64(7);
        weapon.on_fired(false, 0.0);
        let first = weapon.recoil_for_current_shot(false, false, &mut rng);
        assert_eq!(first, RecoilPatternPoint::new(0.5, 0.25));
        weapon.on_fired(true, 0.1);
        let second = weapon.recoil_for_current_shot(true, true, &mut rng);
        assert_eq!(second, RecoilPatternPoint::new(1.0, -0.25));
        assert_eq!(weapon.accumulated_recoil(), RecoilPatternPoint::new(1.5, 0.0));
    }

    #[test]
    fn test_random_recoil_within_range() {
        let mut weapon = HitScanWeaponInstance::new(HitScanWeaponStats {
            ads_recoil_multiplier: 1.0,
            ..Default::default()
        });
        let mut rng = StdRng::seed_from_u64(1);
        for i in 0..50 {
            weapon.on_fired(true, i as f64);
            let r = weapon.recoil_for_current_shot(true, false, &mut rng);
            assert!((0.3..=0.5).contains(&r.pitch));
            assert!((-0.2..=0.2).contains(&r.yaw));
        }
    }

    #[test]
    fn test_recoil_recovery_limited_to_percent() {
        let stats = HitScanWeaponStats {
            recoil_pattern: vec![RecoilPatternPoint::new(4.0, 0.0)],
            hipfire_recoil_multiplier: 1.0,
            recoil_recovery_percent: 0.5,
            recoil_recovery_rate: 10.0,
            recoil_recovery_delay: 0.15,
            ..Default::default()
        };
        let mut weapon = HitScanWeaponInstance::new(stats);
        let mut rng = StdRng::seed_from_u64(3);
        weapon.on_fired(false, 0.0);
        weapon.recoil_for_current_shot(false, false, &mut rng);

        // Inside the delay nothing recovers
        assert_eq!(weapon.tick(0.1, 0.1, still()), RecoilPatternPoint::ZERO);

        let mut total = 0.0;
        let mut now = 0.1;
        for _ in 0..100 {
            now += 0.05;
            total += weapon.tick(0.05, now, still()).pitch;
        }
        assert!((total - 2.0).abs() < 1e-4);
        assert!((weapon.accumulated_recoil().pitch - 2.0).abs() < 1e-4);
    }

    #[test]
    fn test_unequip_resets_runtime_state() {
        let mut weapon = HitScanWeaponInstance::new(s3_stats());
        let mut rng = StdRng::seed_from_u64(5);
        weapon.on_fired(false, 0.0);
        weapon.recoil_for_current_shot(false, false, &mut rng);
        weapon.on_unequipped(None);
        assert_eq!(weapon.current_spread_angle(false), 2.0);
        assert_eq!(weapon.current_shot_count(), 0);
        assert_eq!(weapon.accumulated_recoil(), RecoilPatternPoint::ZERO);
    }
}
