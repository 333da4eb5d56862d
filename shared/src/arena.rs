//! The arena layout both endpoints trace against

use bevy::prelude::*;

use crate::tags::{tag_container, GameplayTagContainer};
use crate::weapons::trace::{ActorId, AnalyticTraceWorld, TraceBody};

/// Static geometry ids sit above every pawn and equipment actor id.
pub const ARENA_ACTOR_BASE: ActorId = 1 << 48;

/// Half extent of the square floor.
pub const ARENA_HALF_SIZE: f32 = 40.0;

const WALL_HEIGHT: f32 = 4.0;
const WALL_THICKNESS: f32 = 0.5;

/// Where training dummies stand.
pub const TRAINING_DUMMY_POSITIONS: &[[f32; 3]] = &[[-6.0, 0.0, -15.0], [0.0, 0.0, -18.0], [6.0, 0.0, -15.0]];

fn concrete() -> GameplayTagContainer {
    tag_container(&["Gameplay.Surface.Concrete"])
}

/// Boundary walls plus a few cover blocks.
pub fn arena_bodies() -> Vec<TraceBody> {
    let h = ARENA_HALF_SIZE;
    let t = WALL_THICKNESS;
    let boxes = [
        // Boundary
        (Vec3::new(-h - t, 0.0, -h - t), Vec3::new(h + t, WALL_HEIGHT, -h)),
        (Vec3::new(-h - t, 0.0, h), Vec3::new(h + t, WALL_HEIGHT, h + t)),
        (Vec3::new(-h - t, 0.0, -h), Vec3::new(-h, WALL_HEIGHT, h)),
        (Vec3::new(h, 0.0, -h), Vec3::new(h + t, WALL_HEIGHT, h)),
        // Cover
        (Vec3::new(-10.0, 0.0, -8.0), Vec3::new(-7.0, 1.2, -7.0)),
        (Vec3::new(7.0, 0.0, -8.0), Vec3::new(10.0, 1.2, -7.0)),
        (Vec3::new(-1.5, 0.0, 8.0), Vec3::new(1.5, 2.5, 9.0)),
    ];
    boxes
        .iter()
        .enumerate()
        .map(|(i, (min, max))| {
            let mut body = TraceBody::wall(ARENA_ACTOR_BASE + i as ActorId, *min, *max);
            body.surface_tags = concrete();
            body
        })
        .collect()
}

pub fn add_arena_to_trace_world(mut world: ResMut<AnalyticTraceWorld>) {
    let bodies = arena_bodies();
    info!("Arena: {} static trace bodies", bodies.len());
    for body in bodies {
        world.add(body);
    }
}
