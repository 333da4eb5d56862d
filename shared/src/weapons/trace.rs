//! Weapon traces
//!
//! A `TraceWorld` answers multi-hit line and sphere-sweep queries. Bullet traces run in two
//! stages: a precise line first, then a swept sphere if the line found no pawn, with an
//! occlusion check so the sweep cannot reach through geometry the line already hit.

use bevy::prelude::*;
use serde::{Deserialize, Serialize};

use super::damage::zone_from_relative_height;
use crate::tags::GameplayTagContainer;

pub type ActorId = u64;

/// One hit of a multi-trace, ordered by distance from the trace start.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TraceHit {
    pub actor: ActorId,
    pub location: Vec3,
    pub normal: Vec3,
    pub distance: f32,
    pub blocking: bool,
    /// The actor is a pawn, or is attached to one.
    pub is_pawn: bool,
    /// Surface tags of the physical material hit (hit zones live here).
    pub surface_tags: GameplayTagContainer,
}

impl TraceHit {
    pub fn new(actor: ActorId, location: Vec3) -> Self {
        Self {
            actor,
            location,
            normal: Vec3::ZERO,
            distance: 0.0,
            blocking: true,
            is_pawn: false,
            surface_tags: GameplayTagContainer::new(),
        }
    }

    pub fn pawn(mut self) -> Self {
        self.is_pawn = true;
        self
    }

    pub fn with_surface_tags(mut self, tags: GameplayTagContainer) -> Self {
        self.surface_tags = tags;
        self
    }
}

/// Scene query service. Implementations ignore every actor in `ignore`.
pub trait TraceWorld {
    fn line_trace_multi(&self, start: Vec3, end: Vec3, ignore: &[ActorId]) -> Vec<TraceHit>;
    fn sweep_sphere_multi(&self, start: Vec3, end: Vec3, radius: f32, ignore: &[ActorId]) -> Vec<TraceHit>;
}

/// Index of the first hit on a pawn (or something attached to one).
pub fn find_first_pawn_hit(hits: &[TraceHit]) -> Option<usize> {
    hits.iter().position(|h| h.is_pawn)
}

/// One multi-trace, appending hits to `out` while keeping at most one hit per actor.
/// Returns the last kept hit.
pub fn weapon_trace(
    world: &dyn TraceWorld,
    start: Vec3,
    end: Vec3,
    sweep_radius: f32,
    ignore: &[ActorId],
    out: &mut Vec<TraceHit>,
) -> Option<TraceHit> {
    let hits = if sweep_radius > 0.0 {
        world.sweep_sphere_multi(start, end, sweep_radius, ignore)
    } else {
        world.line_trace_multi(start, end, ignore)
    };
    if hits.is_empty() {
        return None;
    }
    for hit in hits {
        if !out.iter().any(|h| h.actor == hit.actor) {
            out.push(hit);
        }
    }
    out.last().cloned()
}

/// Two-stage bullet trace.
///
/// Returns the impact used for effects plus the merged hit list. The swept result replaces the
/// line result only if it found a pawn and nothing blocking ahead of that pawn was also hit by
/// the line (the pawn would be behind it).
pub fn do_single_bullet_trace(
    world: &dyn TraceWorld,
    start: Vec3,
    end: Vec3,
    sweep_radius: f32,
    ignore: &[ActorId],
) -> (Option<TraceHit>, Vec<TraceHit>) {
    let mut hits = Vec::new();
    let mut impact = weapon_trace(world, start, end, 0.0, ignore, &mut hits);

    if find_first_pawn_hit(&hits).is_none() && sweep_radius > 0.0 {
        let mut sweep_hits = Vec::new();
        let sweep_impact = weapon_trace(world, start, end, sweep_radius, ignore, &mut sweep_hits);
        if let Some(first_pawn) = find_first_pawn_hit(&sweep_hits) {
            let occluded = sweep_hits[..first_pawn]
                .iter()
                .any(|h| h.blocking && hits.iter().any(|l| l.actor == h.actor));
            if !occluded {
                hits = sweep_hits;
                impact = sweep_impact;
            }
        }
    }
    (impact, hits)
}

// =============================================================================
// ANALYTIC WORLD
// =============================================================================

#[derive(Clone, Debug, PartialEq)]
pub enum TraceShape {
    Sphere { center: Vec3, radius: f32 },
    /// Vertical capsule from `base` (feet) up `height`.
    Capsule { base: Vec3, height: f32, radius: f32 },
    Aabb { min: Vec3, max: Vec3 },
}

#[derive(Clone, Debug)]
pub struct TraceBody {
    pub actor: ActorId,
    pub shape: TraceShape,
    pub is_pawn: bool,
    pub blocking: bool,
    pub surface_tags: GameplayTagContainer,
}

impl TraceBody {
    pub fn wall(actor: ActorId, min: Vec3, max: Vec3) -> Self {
        Self {
            actor,
            shape: TraceShape::Aabb { min, max },
            is_pawn: false,
            blocking: true,
            surface_tags: GameplayTagContainer::new(),
        }
    }

    pub fn pawn(actor: ActorId, feet: Vec3, height: f32, radius: f32) -> Self {
        Self {
            actor,
            shape: TraceShape::Capsule { base: feet, height, radius },
            is_pawn: true,
            blocking: true,
            surface_tags: GameplayTagContainer::new(),
        }
    }
}

/// Geometry-only world made of spheres, vertical capsules and boxes. Used by the headless
/// server and by tests; results stop after the first blocking hit.
#[derive(Resource, Clone, Debug, Default)]
pub struct AnalyticTraceWorld {
    pub bodies: Vec<TraceBody>,
}

impl AnalyticTraceWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, body: TraceBody) {
        self.bodies.push(body);
    }

    pub fn remove_actor(&mut self, actor: ActorId) {
        self.bodies.retain(|b| b.actor != actor);
    }

    /// Move a pawn capsule (no-op for other shapes).
    pub fn set_pawn_feet(&mut self, actor: ActorId, feet: Vec3) {
        for body in self.bodies.iter_mut().filter(|b| b.actor == actor) {
            if let TraceShape::Capsule { base, .. } = &mut body.shape {
                *base = feet;
            }
        }
    }

    fn query(&self, start: Vec3, end: Vec3, inflate: f32, ignore: &[ActorId]) -> Vec<TraceHit> {
        let length = (end - start).length();
        if length <= f32::EPSILON {
            return Vec::new();
        }
        let dir = (end - start) / length;
        let mut hits: Vec<TraceHit> = self
            .bodies
            .iter()
            .filter(|b| !ignore.contains(&b.actor))
            .filter_map(|body| {
                let (t, normal) = intersect(&body.shape, start, dir, length, inflate)?;
                let location = start + dir * t;
                let mut surface_tags = body.surface_tags.clone();
                if let TraceShape::Capsule { base, height, .. } = &body.shape {
                    if body.is_pawn && *height > 0.0 {
                        let relative = ((location.y - base.y) / height).clamp(0.0, 1.0);
                        surface_tags.add_tag(zone_from_relative_height(relative));
                    }
                }
                Some(TraceHit {
                    actor: body.actor,
                    location,
                    normal,
                    distance: t,
                    blocking: body.blocking,
                    is_pawn: body.is_pawn,
                    surface_tags,
                })
            })
            .collect();
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        if let Some(first_block) = hits.iter().position(|h| h.blocking) {
            hits.truncate(first_block + 1);
        }
        hits
    }
}

impl TraceWorld for AnalyticTraceWorld {
    fn line_trace_multi(&self, start: Vec3, end: Vec3, ignore: &[ActorId]) -> Vec<TraceHit> {
        self.query(start, end, 0.0, ignore)
    }

    fn sweep_sphere_multi(&self, start: Vec3, end: Vec3, radius: f32, ignore: &[ActorId]) -> Vec<TraceHit> {
        self.query(start, end, radius.max(0.0), ignore)
    }
}

/// Entry distance and normal of a ray against a shape grown by `inflate`.
fn intersect(shape: &TraceShape, origin: Vec3, dir: Vec3, length: f32, inflate: f32) -> Option<(f32, Vec3)> {
    match shape {
        TraceShape::Sphere { center, radius } => ray_sphere(origin, dir, length, *center, radius + inflate),
        TraceShape::Capsule { base, height, radius } => {
            let r = radius + inflate;
            let a = *base + Vec3::Y * r.min(height * 0.5);
            let b = *base + Vec3::Y * (height - r).max(height * 0.5);
            ray_capsule(origin, dir, length, a, b, r)
        }
        TraceShape::Aabb { min, max } => {
            let grow = Vec3::splat(inflate);
            segment_aabb(origin, origin + dir * length, *min - grow, *max + grow).map(|(t, n)| (t * length, n))
        }
    }
}

fn ray_sphere(origin: Vec3, dir: Vec3, length: f32, center: Vec3, radius: f32) -> Option<(f32, Vec3)> {
    let oc = origin - center;
    let b = oc.dot(dir);
    let c = oc.length_squared() - radius * radius;
    if c <= 0.0 {
        return Some((0.0, (-dir).normalize_or_zero()));
    }
    let disc = b * b - c;
    if disc < 0.0 {
        return None;
    }
    let t = -b - disc.sqrt();
    if !(0.0..=length).contains(&t) {
        return None;
    }
    let point = origin + dir * t;
    Some((t, (point - center).normalize_or_zero()))
}

/// Closest-approach test against the capsule segment, refined with a sphere test at the
/// closest segment point.
fn ray_capsule(origin: Vec3, dir: Vec3, length: f32, a: Vec3, b: Vec3, radius: f32) -> Option<(f32, Vec3)> {
    let samples = 16;
    let mut best: Option<(f32, Vec3)> = None;
    for i in 0..=samples {
        let center = a.lerp(b, i as f32 / samples as f32);
        if let Some(hit) = ray_sphere(origin, dir, length, center, radius) {
            if best.is_none_or(|(t, _)| hit.0 < t) {
                best = Some(hit);
            }
        }
    }
    best
}

/// Segment vs AABB. Returns the entry fraction along the segment and the face normal.
fn segment_aabb(start: Vec3, end: Vec3, aabb_min: Vec3, aabb_max: Vec3) -> Option<(f32, Vec3)> {
    let dir = end - start;
    let mut tmin = 0.0_f32;
    let mut tmax = 1.0_f32;
    let mut hit_normal = Vec3::ZERO;

    for axis in 0..3 {
        let s = start[axis];
        let d = dir[axis];
        let min = aabb_min[axis];
        let max = aabb_max[axis];

        if d.abs() < 1e-6 {
            if s < min || s > max {
                return None;
            }
            continue;
        }

        let inv_d = 1.0 / d;
        let mut t1 = (min - s) * inv_d;
        let mut t2 = (max - s) * inv_d;
        let mut n = Vec3::ZERO;
        n[axis] = if d > 0.0 { -1.0 } else { 1.0 };
        if t1 > t2 {
            std::mem::swap(&mut t1, &mut t2);
            n = -n;
        }
        if t1 > tmin {
            tmin = t1;
            hit_normal = n;
        }
        tmax = tmax.min(t2);
        if tmin > tmax {
            return None;
        }
    }
    (0.0..=1.0).contains(&tmin).then_some((tmin, hit_normal))
}

// =============================================================================
// SCRIPTED WORLD
// =============================================================================

/// Returns fixed hit lists, for exercising trace logic without geometry.
#[derive(Clone, Debug, Default)]
pub struct ScriptedTraceWorld {
    pub line_hits: Vec<TraceHit>,
    pub sweep_hits: Vec<TraceHit>,
}

impl TraceWorld for ScriptedTraceWorld {
    fn line_trace_multi(&self, _start: Vec3, _end: Vec3, ignore: &[ActorId]) -> Vec<TraceHit> {
        self.line_hits.iter().filter(|h| !ignore.contains(&h.actor)).cloned().collect()
    }

    fn sweep_sphere_multi(&self, _start: Vec3, _end: Vec3, _radius: f32, ignore: &[ActorId]) -> Vec<TraceHit> {
        self.sweep_hits.iter().filter(|h| !ignore.contains(&h.actor)).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::{names, tag};

    const WALL: ActorId = 1;
    const PAWN: ActorId = 2;

    #[test]
    fn test_swept_pawn_behind_wall_is_occluded() {
        let world = ScriptedTraceWorld {
            line_hits: vec![TraceHit::new(WALL, Vec3::new(500.0, 0.0, 0.0))],
            sweep_hits: vec![
                TraceHit::new(WALL, Vec3::new(500.0, 0.0, 0.0)),
                TraceHit::new(PAWN, Vec3::new(510.0, 0.0, 0.0)).pawn(),
            ],
        };
        let (impact, hits) = do_single_bullet_trace(&world, Vec3::ZERO, Vec3::new(1000.0, 0.0, 0.0), 20.0, &[]);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].actor, WALL);
        assert_eq!(impact.map(|h| h.actor), Some(WALL));
    }

    #[test]
    fn test_swept_pawn_promoted_when_clear() {
        let world = ScriptedTraceWorld {
            line_hits: vec![TraceHit::new(WALL, Vec3::new(900.0, 0.0, 0.0))],
            sweep_hits: vec![TraceHit::new(PAWN, Vec3::new(400.0, 0.0, 0.0)).pawn()],
        };
        let (_, hits) = do_single_bullet_trace(&world, Vec3::ZERO, Vec3::new(1000.0, 0.0, 0.0), 20.0, &[]);
        assert_eq!(hits.iter().map(|h| h.actor).collect::<Vec<_>>(), vec![PAWN]);
    }

    #[test]
    fn test_no_sweep_without_radius() {
        let world = ScriptedTraceWorld {
            line_hits: vec![],
            sweep_hits: vec![TraceHit::new(PAWN, Vec3::X).pawn()],
        };
        let (impact, hits) = do_single_bullet_trace(&world, Vec3::ZERO, Vec3::X * 10.0, 0.0, &[]);
        assert!(impact.is_none());
        assert!(hits.is_empty());
    }

    #[test]
    fn test_weapon_trace_dedupes_actors() {
        let world = ScriptedTraceWorld {
            line_hits: vec![
                TraceHit::new(PAWN, Vec3::X).pawn(),
                TraceHit::new(PAWN, Vec3::X * 1.1).pawn(),
                TraceHit::new(WALL, Vec3::X * 3.0),
            ],
            sweep_hits: vec![],
        };
        let mut out = Vec::new();
        weapon_trace(&world, Vec3::ZERO, Vec3::X * 10.0, 0.0, &[], &mut out);
        assert_eq!(out.iter().map(|h| h.actor).collect::<Vec<_>>(), vec![PAWN, WALL]);
    }

    #[test]
    fn test_analytic_world_line_hits_head() {
        let mut world = AnalyticTraceWorld::new();
        world.add(TraceBody::pawn(PAWN, Vec3::new(0.0, 0.0, -20.0), 1.8, 0.4));
        let hits = world.line_trace_multi(Vec3::new(0.0, 1.7, 0.0), Vec3::new(0.0, 1.7, -100.0), &[]);
        assert_eq!(hits.len(), 1);
        assert!(hits[0].is_pawn);
        assert!(hits[0].surface_tags.has_tag(&tag(names::GAMEPLAY_CHARACTER_ZONE_HEAD)));
        assert!((hits[0].distance - 19.6).abs() < 0.05);
    }

    #[test]
    fn test_analytic_world_wall_blocks_and_sweep_grazes() {
        let mut world = AnalyticTraceWorld::new();
        world.add(TraceBody::wall(WALL, Vec3::new(-5.0, 0.0, -11.0), Vec3::new(5.0, 5.0, -10.0)));
        world.add(TraceBody::pawn(PAWN, Vec3::new(0.0, 0.0, -20.0), 1.8, 0.4));
        let line = world.line_trace_multi(Vec3::new(0.0, 1.0, 0.0), Vec3::new(0.0, 1.0, -50.0), &[]);
        assert_eq!(line.iter().map(|h| h.actor).collect::<Vec<_>>(), vec![WALL]);

        // A line passing just beside a pawn misses; a sweep with radius picks it up
        let mut open = AnalyticTraceWorld::new();
        open.add(TraceBody::pawn(PAWN, Vec3::new(0.6, 0.0, -20.0), 1.8, 0.4));
        let start = Vec3::new(0.0, 1.0, 0.0);
        let end = Vec3::new(0.0, 1.0, -50.0);
        assert!(open.line_trace_multi(start, end, &[]).is_empty());
        let (_, hits) = do_single_bullet_trace(&open, start, end, 0.3, &[]);
        assert_eq!(hits.len(), 1);
        assert!(hits[0].is_pawn);

        assert!(open.line_trace_multi(start, end, &[PAWN]).is_empty());
    }
}
