//! Hit-scan shot pipeline
//!
//! Local side: trace every pellet of a cartridge, package the hits as target data tagged with
//! one cartridge id, and queue hit markers until the server answers. Server side: validate the
//! target data, answer with the hits it replaced, commit the ability and turn surviving hits
//! into damage.

use bevy::prelude::*;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::ballistics::{vrand_cone, AimRay};
use super::damage::{calculate_damage, hit_zone_from_tags};
use super::instance::HitScanWeaponInstance;
use super::state::ScreenSpaceHitLocation;
use super::trace::{do_single_bullet_trace, ActorId, TraceHit, TraceWorld};
use super::RecoilPatternPoint;
use crate::ability::{AbilitySpecHandle, AbilitySystemComponent, ActivationEnv, InstanceId};
use crate::effects::{EffectContext, GameplayEffect};
use crate::team::TeamSubsystem;

/// Id of the instant effect that carries weapon damage.
pub const WEAPON_DAMAGE_EFFECT_ID: &str = "GE_Damage_Weapon";

/// Actor id carried by the placeholder hit of a shot that hit nothing.
pub const NO_ACTOR: ActorId = 0;

/// Target data entries past this index cannot be named in a confirmation.
pub const MAX_CONFIRMABLE_HITS: usize = u8::MAX as usize;

/// One pellet hit, tagged with the trigger pull that produced it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TargetDataEntry {
    pub hit: TraceHit,
    pub cartridge_id: i32,
    /// Set by server validation when it discards this hit.
    #[serde(default)]
    pub hit_replaced: bool,
}

/// Everything one trigger pull hit.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TargetDataHandle {
    /// Matches the unconfirmed hit-marker batch on the shooting client.
    pub unique_id: u8,
    pub entries: Vec<TargetDataEntry>,
}

impl TargetDataHandle {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Any surviving blocking hit on a real actor.
    pub fn has_hit_target(&self) -> bool {
        self.entries
            .iter()
            .any(|e| !e.hit_replaced && e.hit.blocking && e.hit.actor != NO_ACTOR)
    }

    pub fn hit_replaces(&self) -> Vec<u8> {
        self.entries
            .iter()
            .take(MAX_CONFIRMABLE_HITS)
            .enumerate()
            .filter(|(_, e)| e.hit_replaced)
            .map(|(i, _)| i as u8)
            .collect()
    }
}

/// Result of the local side of one trigger pull.
#[derive(Clone, Debug, PartialEq)]
pub struct LocalShot {
    pub hits: Vec<TraceHit>,
    /// Recoil to apply to the view (pitch up positive).
    pub recoil: RecoilPatternPoint,
}

/// Trace every pellet of one cartridge. A shot that hits nothing still yields one non-blocking
/// hit at the end of the first pellet's trace, for tracer effects.
pub fn trace_bullets_in_cartridge(
    world: &dyn TraceWorld,
    weapon: &HitScanWeaponInstance,
    aim: AimRay,
    is_aiming: bool,
    ignore: &[ActorId],
    rng: &mut impl Rng,
) -> Vec<TraceHit> {
    let stats = weapon.computed_stats();
    let spread = weapon.effective_spread(is_aiming);
    let mut out = Vec::new();

    for _ in 0..stats.bullets_per_cartridge.max(1) {
        let direction = vrand_cone(aim.direction, spread, stats.spread_exponent, rng);
        let end = aim.origin + direction * stats.max_damage_range;
        let (impact, all_impacts) =
            do_single_bullet_trace(world, aim.origin, end, stats.bullet_trace_sweep_radius, ignore);

        if impact.is_some() {
            out.extend(all_impacts);
        }
        if out.is_empty() {
            let mut fake = impact.unwrap_or_else(|| TraceHit::new(NO_ACTOR, end));
            if !fake.blocking {
                fake.location = end;
                fake.distance = stats.max_damage_range;
            }
            fake.blocking = false;
            out.push(fake);
        }
    }
    out
}

/// Local targeting for one trigger pull: trace, then advance the weapon's spread and recoil.
#[allow(clippy::too_many_arguments)]
pub fn perform_local_targeting(
    world: &dyn TraceWorld,
    weapon: &mut HitScanWeaponInstance,
    aim: AimRay,
    is_aiming: bool,
    is_crouching: bool,
    ignore: &[ActorId],
    now: f64,
    rng: &mut impl Rng,
) -> LocalShot {
    let hits = trace_bullets_in_cartridge(world, weapon, aim, is_aiming, ignore, rng);
    weapon.on_fired(is_aiming, now);
    let recoil = weapon.recoil_for_current_shot(is_aiming, is_crouching, rng);
    LocalShot { hits, recoil }
}

/// Package hits as target data. All entries share one random cartridge id.
pub fn package_target_data(hits: &[TraceHit], unique_id: u8, rng: &mut impl Rng) -> TargetDataHandle {
    let mut handle = TargetDataHandle {
        unique_id,
        entries: Vec::with_capacity(hits.len()),
    };
    if hits.is_empty() {
        return handle;
    }
    let cartridge_id: i32 = rng.gen_range(0..i32::MAX);
    handle.entries.extend(hits.iter().map(|hit| TargetDataEntry {
        hit: hit.clone(),
        cartridge_id,
        hit_replaced: false,
    }));
    handle
}

/// Hit markers for the shooter's HUD. `project` maps a world location to screen pixels.
pub fn hit_markers_for(
    hits: &[TraceHit],
    instigator: ActorId,
    teams: &TeamSubsystem,
    project: impl Fn(Vec3) -> Option<Vec2>,
) -> Vec<ScreenSpaceHitLocation> {
    hits.iter()
        .filter(|h| h.actor != NO_ACTOR && h.blocking)
        .filter_map(|hit| {
            let location = project(hit.location)?;
            Some(ScreenSpaceHitLocation {
                location,
                hit_zone: hit_zone_from_tags(&hit.surface_tags),
                show_as_success: teams.can_cause_damage(instigator, hit.actor, false),
            })
        })
        .collect()
}

/// Server-side check of client target data.
pub trait HitValidator {
    fn is_hit_valid(&self, shooter_position: Vec3, entry: &TargetDataEntry) -> bool;
}

/// Trusts the client.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAllHits;

impl HitValidator for AcceptAllHits {
    fn is_hit_valid(&self, _shooter_position: Vec3, _entry: &TargetDataEntry) -> bool {
        true
    }
}

/// Rejects hits further from the shooter than the weapon can reach.
#[derive(Clone, Copy, Debug)]
pub struct MaxRangeValidator {
    pub max_range: f32,
    /// Allowance for movement between the client's shot and the server's check.
    pub tolerance: f32,
}

impl HitValidator for MaxRangeValidator {
    fn is_hit_valid(&self, shooter_position: Vec3, entry: &TargetDataEntry) -> bool {
        !entry.hit.blocking || entry.hit.location.distance(shooter_position) <= self.max_range + self.tolerance
    }
}

/// Run `validator` over every entry, marking rejected hits as replaced. Returns whether the
/// data as a whole is valid and the indices to report back to the client.
pub fn validate_target_data(
    data: &mut TargetDataHandle,
    shooter_position: Vec3,
    validator: &dyn HitValidator,
) -> (bool, Vec<u8>) {
    for entry in data.entries.iter_mut() {
        if !validator.is_hit_valid(shooter_position, entry) {
            debug!("Rejected hit on actor {} at {:?}", entry.hit.actor, entry.hit.location);
            entry.hit_replaced = true;
        }
    }
    let cartridge = data.entries.first().map(|e| e.cartridge_id);
    let consistent = data.entries.iter().all(|e| Some(e.cartridge_id) == cartridge);
    if !consistent {
        warn!("Target data {} mixes cartridge ids", data.unique_id);
    }
    (consistent, data.hit_replaces())
}

/// Commit the firing ability for validated target data. Ends the ability when the commit
/// fails (out of ammo).
pub fn commit_target_data(
    asc: &mut AbilitySystemComponent,
    handle: AbilitySpecHandle,
    instance: InstanceId,
    data: &TargetDataHandle,
    data_valid: bool,
    env: &mut ActivationEnv<'_>,
) -> bool {
    if data_valid && asc.commit_ability(handle, instance, env, data.has_hit_target()) {
        return true;
    }
    warn!("Weapon ability {:?} failed to commit (target data valid: {})", handle, data_valid);
    asc.end_ability(handle, instance);
    false
}

/// Damage one surviving hit should deal.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingDamage {
    pub target: ActorId,
    pub damage: f32,
    pub hit_zone: Option<crate::tags::GameplayTag>,
    pub distance: f32,
    pub cartridge_id: i32,
}

/// Turn validated target data into per-pellet damage against actors the instigator may hurt.
pub fn damage_from_target_data(
    weapon: &HitScanWeaponInstance,
    data: &TargetDataHandle,
    instigator: ActorId,
    teams: &TeamSubsystem,
) -> Vec<PendingDamage> {
    data.entries
        .iter()
        .filter(|e| !e.hit_replaced && e.hit.blocking && e.hit.actor != NO_ACTOR)
        .filter(|e| teams.can_cause_damage(instigator, e.hit.actor, false))
        .map(|e| PendingDamage {
            target: e.hit.actor,
            damage: calculate_damage(weapon.computed_stats(), e.hit.distance, &e.hit.surface_tags),
            hit_zone: hit_zone_from_tags(&e.hit.surface_tags),
            distance: e.hit.distance,
            cartridge_id: e.cartridge_id,
        })
        .collect()
}

/// Apply one pellet's damage to the target through an instant damage effect. Authority only.
pub fn apply_pending_damage(target: &mut AbilitySystemComponent, damage: &PendingDamage, instigator: ActorId, level: i32) {
    let effect = Arc::new(GameplayEffect::damage(WEAPON_DAMAGE_EFFECT_ID, damage.damage));
    target.apply_gameplay_effect_to_self(
        effect,
        level,
        EffectContext {
            instigator: Some(instigator),
            causer: Some(instigator),
            source_level: level as f32,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weapons::trace::{AnalyticTraceWorld, ScriptedTraceWorld, TraceBody};
    use crate::weapons::HitScanWeaponStats;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn shotgun() -> HitScanWeaponInstance {
        HitScanWeaponInstance::new(HitScanWeaponStats {
            bullets_per_cartridge: 8,
            hipfire_base_spread: 4.0,
            hipfire_max_spread: 8.0,
            has_first_shot_accuracy: false,
            max_damage_range: 50.0,
            ..Default::default()
        })
    }

    fn aim() -> AimRay {
        AimRay {
            origin: Vec3::ZERO,
            direction: Vec3::X,
        }
    }

    #[test]
    fn test_all_pellets_share_cartridge_id() {
        let mut world = AnalyticTraceWorld::default();
        world.add(TraceBody::wall(7, Vec3::new(10.0, -5.0, -5.0), Vec3::new(11.0, 5.0, 5.0)));
        let mut rng = StdRng::seed_from_u64(3);
        let hits = trace_bullets_in_cartridge(&world, &shotgun(), aim(), false, &[], &mut rng);
        assert_eq!(hits.len(), 8);

        let data = package_target_data(&hits, 2, &mut rng);
        assert_eq!(data.unique_id, 2);
        let id = data.entries[0].cartridge_id;
        assert!(data.entries.iter().all(|e| e.cartridge_id == id));
    }

    #[test]
    fn test_each_cartridge_gets_a_fresh_id() {
        let mut world = AnalyticTraceWorld::default();
        world.add(TraceBody::wall(7, Vec3::new(10.0, -5.0, -5.0), Vec3::new(11.0, 5.0, 5.0)));
        let mut rng = StdRng::seed_from_u64(11);
        let weapon = shotgun();

        let mut seen = std::collections::HashSet::new();
        for shot in 0..16u8 {
            let hits = trace_bullets_in_cartridge(&world, &weapon, aim(), false, &[], &mut rng);
            let data = package_target_data(&hits, shot, &mut rng);
            assert!(seen.insert(data.entries[0].cartridge_id), "cartridge id reused on shot {shot}");
        }
    }

    #[test]
    fn test_miss_yields_single_fake_hit() {
        let world = ScriptedTraceWorld::default();
        let mut rng = StdRng::seed_from_u64(1);
        let hits = trace_bullets_in_cartridge(&world, &shotgun(), aim(), false, &[], &mut rng);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].actor, NO_ACTOR);
        assert!(!hits[0].blocking);
        assert!((hits[0].location.length() - 50.0).abs() < 1e-3);

        let data = package_target_data(&hits, 0, &mut rng);
        assert!(!data.has_hit_target());
    }

    #[test]
    fn test_local_targeting_advances_spread() {
        let world = ScriptedTraceWorld::default();
        let mut weapon = shotgun();
        let before = weapon.current_spread_angle(false);
        let mut rng = StdRng::seed_from_u64(9);
        perform_local_targeting(&world, &mut weapon, aim(), false, false, &[], 1.0, &mut rng);
        assert_eq!(weapon.current_shot_count(), 1);
        assert!(weapon.current_spread_angle(false) >= before);
    }

    #[test]
    fn test_markers_use_team_rules() {
        let mut teams = TeamSubsystem::default();
        teams.set_team(1, 0);
        teams.set_team(2, 1);
        teams.set_team(3, 0);
        let hits = vec![
            TraceHit::new(2, Vec3::new(5.0, 0.0, 0.0)).pawn(),
            TraceHit::new(3, Vec3::new(6.0, 0.0, 0.0)).pawn(),
        ];
        let markers = hit_markers_for(&hits, 1, &teams, |p| Some(Vec2::new(p.x, p.y)));
        assert_eq!(markers.len(), 2);
        assert!(markers[0].show_as_success);
        assert!(!markers[1].show_as_success);
    }

    #[test]
    fn test_range_validation_marks_replaced() {
        let mut rng = StdRng::seed_from_u64(4);
        let hits = vec![
            TraceHit::new(2, Vec3::new(5.0, 0.0, 0.0)).pawn(),
            TraceHit::new(3, Vec3::new(500.0, 0.0, 0.0)).pawn(),
        ];
        let mut data = package_target_data(&hits, 0, &mut rng);
        let validator = MaxRangeValidator {
            max_range: 100.0,
            tolerance: 1.0,
        };
        let (valid, replaces) = validate_target_data(&mut data, Vec3::ZERO, &validator);
        assert!(valid);
        assert_eq!(replaces, vec![1]);

        let mut teams = TeamSubsystem::default();
        teams.set_team(1, 0);
        teams.set_team(2, 1);
        teams.set_team(3, 1);
        let damage = damage_from_target_data(&shotgun(), &data, 1, &teams);
        assert_eq!(damage.len(), 1);
        assert_eq!(damage[0].target, 2);
    }
}
