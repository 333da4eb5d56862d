//! Crosshair, hit markers and the death screen
//!
//! The crosshair widens with the equipped weapon's current spread and tightens when aiming.
//! Hit markers appear where confirmed hits landed on screen.

use bevy::prelude::*;
use shared::ability::AbilitySystemComponent;
use shared::equipment::EquipmentManager;
use shared::tags::{names, tag};
use shared::weapons::fire_ability::is_aiming;
use shared::weapons::state::ScreenSpaceHitLocation;
use shared::weapons::WeaponStateComponent;
use shared::{HealthAttributes, LocalPlayer};

use crate::input::{CameraMode, InputState};

/// Seconds a hit marker stays up
const HIT_MARKER_DURATION: f32 = 0.25;
/// Screen pixels per degree of spread half-angle
const SPREAD_PIXELS_PER_DEGREE: f32 = 6.0;
const MIN_LINE_OFFSET: f32 = 6.0;

/// Marker component for the crosshair UI
#[derive(Component)]
pub struct Crosshair;

#[derive(Component)]
pub struct CrosshairDot;

#[derive(Component)]
pub struct CrosshairLine {
    pub direction: CrosshairLineDir,
}

#[derive(Clone, Copy)]
pub enum CrosshairLineDir {
    Top,
    Bottom,
    Left,
    Right,
}

/// One confirmed hit drawn on screen
#[derive(Component)]
pub struct HitMarker {
    pub spawn_time: f32,
}

/// Spawn the crosshair UI
pub fn spawn_crosshair(mut commands: Commands, existing: Query<(), With<Crosshair>>) {
    if !existing.is_empty() {
        return;
    }
    commands
        .spawn((
            Crosshair,
            Node {
                width: Val::Percent(100.0),
                height: Val::Percent(100.0),
                position_type: PositionType::Absolute,
                justify_content: JustifyContent::Center,
                align_items: AlignItems::Center,
                ..default()
            },
        ))
        .with_children(|parent| {
            parent.spawn((
                CrosshairDot,
                Node {
                    width: Val::Px(4.0),
                    height: Val::Px(4.0),
                    ..default()
                },
                BackgroundColor(Color::srgba(1.0, 1.0, 1.0, 0.85)),
                BorderRadius::all(Val::Px(2.0)),
            ));
            for direction in [
                CrosshairLineDir::Top,
                CrosshairLineDir::Bottom,
                CrosshairLineDir::Left,
                CrosshairLineDir::Right,
            ] {
                let (width, height) = match direction {
                    CrosshairLineDir::Top | CrosshairLineDir::Bottom => (2.0, 8.0),
                    CrosshairLineDir::Left | CrosshairLineDir::Right => (8.0, 2.0),
                };
                parent.spawn((
                    CrosshairLine { direction },
                    Node {
                        width: Val::Px(width),
                        height: Val::Px(height),
                        position_type: PositionType::Absolute,
                        ..default()
                    },
                    BackgroundColor(Color::srgba(1.0, 1.0, 1.0, 0.7)),
                ));
            }
        });
}

/// Hide the crosshair in third person
pub fn update_crosshair_visibility(
    mut crosshair_query: Query<&mut Visibility, With<Crosshair>>,
    input_state: Res<InputState>,
) {
    for mut visibility in crosshair_query.iter_mut() {
        visibility.set_if_neq(match input_state.camera_mode {
            CameraMode::FirstPerson => Visibility::Visible,
            CameraMode::ThirdPerson => Visibility::Hidden,
        });
    }
}

/// Distance of the crosshair lines from the centre for a spread half-angle in degrees.
pub fn line_offset_for_spread(spread_degrees: f32) -> f32 {
    MIN_LINE_OFFSET + spread_degrees.max(0.0) * SPREAD_PIXELS_PER_DEGREE
}

/// Open the lines with the weapon's spread; turn red while aiming.
pub fn update_crosshair_spread(
    local: Query<(&AbilitySystemComponent, &EquipmentManager), With<LocalPlayer>>,
    mut dot_query: Query<&mut BackgroundColor, With<CrosshairDot>>,
    mut line_query: Query<(&CrosshairLine, &mut Node, &mut BackgroundColor), Without<CrosshairDot>>,
) {
    let Ok((asc, equipment)) = local.single() else {
        return;
    };
    let aiming = is_aiming(asc);
    let spread = equipment
        .equipped_weapon()
        .and_then(|e| e.weapon())
        .map(|w| w.effective_spread(aiming))
        .unwrap_or(0.0);
    let offset = line_offset_for_spread(spread);

    let color = if aiming {
        Color::srgba(1.0, 0.4, 0.4, 0.9)
    } else {
        Color::srgba(1.0, 1.0, 1.0, 0.7)
    };
    for mut bg in dot_query.iter_mut() {
        *bg = BackgroundColor(color);
    }
    for (line, mut node, mut bg) in line_query.iter_mut() {
        match line.direction {
            CrosshairLineDir::Top => node.top = Val::Px(-offset),
            CrosshairLineDir::Bottom => node.bottom = Val::Px(-offset),
            CrosshairLineDir::Left => node.left = Val::Px(-offset),
            CrosshairLineDir::Right => node.right = Val::Px(-offset),
        }
        *bg = BackgroundColor(color);
    }
}

fn hit_marker_color(hit: &ScreenSpaceHitLocation) -> Color {
    let head = tag(names::GAMEPLAY_CHARACTER_ZONE_HEAD);
    match &hit.hit_zone {
        Some(zone) if zone.matches_tag(&head) => Color::srgba(1.0, 0.2, 0.2, 1.0),
        _ => Color::WHITE,
    }
}

/// Four ticks around a confirmed hit's screen position.
pub fn spawn_hit_marker(commands: &mut Commands, hit: &ScreenSpaceHitLocation, now: f32) {
    let color = hit_marker_color(hit);
    let half = 8.0;
    commands
        .spawn((
            HitMarker { spawn_time: now },
            Node {
                position_type: PositionType::Absolute,
                left: Val::Px(hit.location.x - half),
                top: Val::Px(hit.location.y - half),
                width: Val::Px(half * 2.0),
                height: Val::Px(half * 2.0),
                ..default()
            },
        ))
        .with_children(|parent| {
            let ticks = [
                (Val::Px(half - 1.0), Val::Px(0.0), 2.0, 5.0),
                (Val::Px(half - 1.0), Val::Px(half * 2.0 - 5.0), 2.0, 5.0),
                (Val::Px(0.0), Val::Px(half - 1.0), 5.0, 2.0),
                (Val::Px(half * 2.0 - 5.0), Val::Px(half - 1.0), 5.0, 2.0),
            ];
            for (left, top, width, height) in ticks {
                parent.spawn((
                    Node {
                        position_type: PositionType::Absolute,
                        left,
                        top,
                        width: Val::Px(width),
                        height: Val::Px(height),
                        ..default()
                    },
                    BackgroundColor(color),
                ));
            }
        });
}

/// Spawn markers when the server confirms a new group of hits.
pub fn spawn_confirmed_hit_markers(
    mut commands: Commands,
    time: Res<Time>,
    local: Query<&WeaponStateComponent, (With<LocalPlayer>, Changed<WeaponStateComponent>)>,
    mut last_seen: Local<Option<f64>>,
) {
    let Ok(state) = local.single() else {
        return;
    };
    let now = time.elapsed_secs_f64();
    let instigated_at = now - state.time_since_last_hit_notification(now);
    if !instigated_at.is_finite() || *last_seen == Some(instigated_at) {
        return;
    }
    *last_seen = Some(instigated_at);
    for hit in state.last_weapon_damage_screen_locations() {
        spawn_hit_marker(&mut commands, hit, time.elapsed_secs());
    }
}

/// Update and cleanup hit markers
pub fn update_hit_markers(mut commands: Commands, hit_markers: Query<(Entity, &HitMarker)>, time: Res<Time>) {
    let now = time.elapsed_secs();
    for (entity, marker) in hit_markers.iter() {
        if now - marker.spawn_time > HIT_MARKER_DURATION {
            commands.entity(entity).despawn();
        }
    }
}

/// Despawn crosshair and hit markers when leaving gameplay
pub fn despawn_crosshair(
    mut commands: Commands,
    crosshairs: Query<Entity, With<Crosshair>>,
    hit_markers: Query<Entity, With<HitMarker>>,
) {
    for entity in crosshairs.iter().chain(hit_markers.iter()) {
        commands.entity(entity).despawn();
    }
}

// =============================================================================
// DEATH SCREEN UI
// =============================================================================

/// Marker for the death screen overlay
#[derive(Component)]
pub struct DeathScreen;

pub fn spawn_death_screen(mut commands: Commands, existing: Query<(), With<DeathScreen>>) {
    if !existing.is_empty() {
        return;
    }
    commands
        .spawn((
            DeathScreen,
            Node {
                width: Val::Percent(100.0),
                height: Val::Percent(100.0),
                position_type: PositionType::Absolute,
                flex_direction: FlexDirection::Column,
                justify_content: JustifyContent::Center,
                align_items: AlignItems::Center,
                ..default()
            },
            BackgroundColor(Color::srgba(0.15, 0.0, 0.0, 0.5)),
            Visibility::Hidden,
        ))
        .with_children(|parent| {
            parent.spawn((
                Text::new("ELIMINATED"),
                TextFont {
                    font_size: 64.0,
                    ..default()
                },
                TextColor(Color::srgba(0.9, 0.2, 0.2, 1.0)),
            ));
        });
}

/// Show the death screen while the local pawn has no health
pub fn update_death_screen(
    local: Query<&HealthAttributes, With<LocalPlayer>>,
    mut death_screen: Query<&mut Visibility, With<DeathScreen>>,
) {
    let is_dead = local.single().is_ok_and(|h| h.is_dead());
    for mut visibility in death_screen.iter_mut() {
        visibility.set_if_neq(if is_dead { Visibility::Visible } else { Visibility::Hidden });
    }
}

pub fn despawn_death_screen(mut commands: Commands, death_screens: Query<Entity, With<DeathScreen>>) {
    for entity in death_screens.iter() {
        commands.entity(entity).despawn();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wider_spread_pushes_lines_out() {
        assert_eq!(line_offset_for_spread(0.0), MIN_LINE_OFFSET);
        assert!(line_offset_for_spread(2.0) > line_offset_for_spread(1.0));
    }

    #[test]
    fn test_headshots_are_red() {
        let hit = ScreenSpaceHitLocation {
            location: Vec2::ZERO,
            hit_zone: Some(tag(names::GAMEPLAY_CHARACTER_ZONE_HEAD)),
            show_as_success: true,
        };
        assert_ne!(hit_marker_color(&hit), Color::WHITE);
    }
}
