//! In-game HUD: health, magazine, quick bar and the ability failure line

use bevy::prelude::*;
use shared::equipment::QuickBar;
use shared::game_data::GameData;
use shared::inventory::InventoryManager;
use shared::tags::tag;
use shared::{HealthAttributes, LocalPlayer};

use super::styles::*;
use crate::abilities::AbilityFailureFeed;
use crate::states::{in_game, GameState};

/// Item stat holding the rounds left in a weapon.
const MAGAZINE_STAT: &str = "Weapon.Ammo.Magazine";
const HEALTH_BAR_WIDTH: f32 = 240.0;

pub struct HudPlugin;

impl Plugin for HudPlugin {
    fn build(&self, app: &mut App) {
        app.add_systems(OnEnter(GameState::Playing), spawn_hud);
        app.add_systems(OnEnter(GameState::MainMenu), despawn_hud);
        app.add_systems(
            Update,
            (update_health, update_ammo, update_quickbar, update_failure_text).run_if(in_game),
        );
    }
}

#[derive(Component)]
struct HudRoot;

#[derive(Component)]
struct HealthFill;

#[derive(Component)]
struct HealthText;

#[derive(Component)]
struct AmmoText;

#[derive(Component)]
struct QuickbarSlotUi(usize);

#[derive(Component)]
struct QuickbarSlotLabel(usize);

#[derive(Component)]
struct FailureText;

fn spawn_hud(mut commands: Commands, existing: Query<(), With<HudRoot>>) {
    // Resuming from pause re-enters Playing.
    if !existing.is_empty() {
        return;
    }
    commands
        .spawn((
            HudRoot,
            Node {
                width: Val::Percent(100.0),
                height: Val::Percent(100.0),
                position_type: PositionType::Absolute,
                ..default()
            },
        ))
        .with_children(|root| {
            // Health, bottom left
            root.spawn((
                Node {
                    position_type: PositionType::Absolute,
                    left: Val::Px(24.0),
                    bottom: Val::Px(24.0),
                    flex_direction: FlexDirection::Column,
                    padding: UiRect::all(Val::Px(8.0)),
                    ..default()
                },
                BackgroundColor(HUD_PANEL),
            ))
            .with_children(|panel| {
                panel.spawn((HealthText, Text::new("100"), hud_text_style(), TextColor(TEXT_COLOR)));
                panel
                    .spawn((
                        Node {
                            width: Val::Px(HEALTH_BAR_WIDTH),
                            height: Val::Px(10.0),
                            margin: UiRect::top(Val::Px(4.0)),
                            ..default()
                        },
                        BackgroundColor(BUTTON_NORMAL),
                    ))
                    .with_children(|bar| {
                        bar.spawn((
                            HealthFill,
                            Node {
                                width: Val::Percent(100.0),
                                height: Val::Percent(100.0),
                                ..default()
                            },
                            BackgroundColor(HEALTH_FULL),
                        ));
                    });
            });

            // Magazine, bottom right
            root.spawn((
                AmmoText,
                Text::new(""),
                TextFont {
                    font_size: 32.0,
                    ..default()
                },
                TextColor(TEXT_COLOR),
                Node {
                    position_type: PositionType::Absolute,
                    right: Val::Px(32.0),
                    bottom: Val::Px(24.0),
                    ..default()
                },
            ));

            // Quick bar, bottom centre
            root.spawn(Node {
                position_type: PositionType::Absolute,
                bottom: Val::Px(24.0),
                width: Val::Percent(100.0),
                justify_content: JustifyContent::Center,
                ..default()
            })
            .with_children(|row| {
                for index in 0..shared::equipment::DEFAULT_NUM_SLOTS {
                    row.spawn((
                        QuickbarSlotUi(index),
                        Node {
                            width: Val::Px(110.0),
                            height: Val::Px(44.0),
                            margin: UiRect::horizontal(Val::Px(4.0)),
                            border: UiRect::all(Val::Px(2.0)),
                            justify_content: JustifyContent::Center,
                            align_items: AlignItems::Center,
                            ..default()
                        },
                        BackgroundColor(HUD_PANEL),
                        BorderColor::from(BUTTON_BORDER),
                    ))
                    .with_children(|slot| {
                        slot.spawn((
                            QuickbarSlotLabel(index),
                            Text::new(format!("{}", index + 1)),
                            TextFont {
                                font_size: 14.0,
                                ..default()
                            },
                            TextColor(TEXT_MUTED),
                        ));
                    });
                }
            });

            // Failure line, top centre
            root.spawn(Node {
                position_type: PositionType::Absolute,
                top: Val::Px(80.0),
                width: Val::Percent(100.0),
                justify_content: JustifyContent::Center,
                ..default()
            })
            .with_children(|row| {
                row.spawn((FailureText, Text::new(""), hud_text_style(), TextColor(FAILURE_TEXT)));
            });
        });
}

fn despawn_hud(mut commands: Commands, roots: Query<Entity, With<HudRoot>>) {
    for entity in roots.iter() {
        commands.entity(entity).despawn();
    }
}

fn health_color(fraction: f32) -> Color {
    let low = HEALTH_LOW.to_srgba();
    low.mix(&HEALTH_FULL.to_srgba(), fraction.clamp(0.0, 1.0)).into()
}

fn update_health(
    local: Query<&HealthAttributes, (With<LocalPlayer>, Changed<HealthAttributes>)>,
    mut fill: Query<(&mut Node, &mut BackgroundColor), With<HealthFill>>,
    mut text: Query<&mut Text, With<HealthText>>,
) {
    let Ok(health) = local.single() else {
        return;
    };
    let fraction = health.fraction();
    for (mut node, mut color) in fill.iter_mut() {
        node.width = Val::Percent(fraction * 100.0);
        *color = BackgroundColor(health_color(fraction));
    }
    for mut text in text.iter_mut() {
        **text = format!("{:.0}", health.health.max(0.0));
    }
}

/// Rounds left in the item on the active slot, if it carries a magazine.
fn active_magazine(quickbar: &QuickBar, inventory: &InventoryManager) -> Option<i32> {
    let item = inventory.item(quickbar.active_slot_item()?)?;
    let stat = tag(MAGAZINE_STAT);
    item.has_stat_tag(&stat).then(|| item.stat_tag_stack_count(&stat))
}

fn update_ammo(
    local: Query<(&QuickBar, &InventoryManager), With<LocalPlayer>>,
    mut text: Query<&mut Text, With<AmmoText>>,
) {
    let Ok((quickbar, inventory)) = local.single() else {
        return;
    };
    let display = active_magazine(quickbar, inventory)
        .map(|rounds| rounds.to_string())
        .unwrap_or_default();
    for mut text in text.iter_mut() {
        if **text != display {
            **text = display.clone();
        }
    }
}

fn update_quickbar(
    data: Res<GameData>,
    local: Query<(&QuickBar, &InventoryManager), With<LocalPlayer>>,
    mut slots: Query<(&QuickbarSlotUi, &mut BorderColor)>,
    mut labels: Query<(&QuickbarSlotLabel, &mut Text, &mut TextColor)>,
) {
    let Ok((quickbar, inventory)) = local.single() else {
        return;
    };
    let active = quickbar.active_slot_index();
    for (slot, mut border) in slots.iter_mut() {
        let color = if active == Some(slot.0) { ACCENT_COLOR } else { BUTTON_BORDER };
        *border = BorderColor::from(color);
    }
    for (label, mut text, mut color) in labels.iter_mut() {
        let name = quickbar
            .slot_item(label.0)
            .and_then(|id| inventory.item(id))
            .and_then(|item| data.items.get_cached_item(&item.definition_id))
            .map(|def| def.display_name.clone());
        let display = match name {
            Some(name) => format!("{} {}", label.0 + 1, name),
            None => format!("{}", label.0 + 1),
        };
        if **text != display {
            **text = display;
        }
        *color = TextColor(if active == Some(label.0) { TEXT_COLOR } else { TEXT_MUTED });
    }
}

fn update_failure_text(
    time: Res<Time>,
    feed: Res<AbilityFailureFeed>,
    mut text: Query<&mut Text, With<FailureText>>,
) {
    let message = feed.current(time.elapsed_secs_f64()).unwrap_or("");
    for mut text in text.iter_mut() {
        if **text != message {
            **text = message.to_string();
        }
    }
}
