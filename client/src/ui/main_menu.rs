//! Main menu UI
//!
//! Updated for Bevy 0.17

use bevy::app::AppExit;
use bevy::input::keyboard::{Key, KeyboardInput};
use bevy::input::ButtonState;
use bevy::prelude::*;

use super::styles::*;
use crate::config::ClientSettings;
use crate::states::GameState;

const MAX_IP_LEN: usize = 15;

pub struct MainMenuPlugin;

impl Plugin for MainMenuPlugin {
    fn build(&self, app: &mut App) {
        app.add_systems(OnEnter(GameState::MainMenu), spawn_main_menu);
        app.add_systems(OnExit(GameState::MainMenu), despawn_main_menu);
        app.add_systems(
            Update,
            (
                button_interactions,
                handle_menu_actions,
                handle_ip_input_focus,
                handle_ip_keyboard_input,
                update_ip_display,
            )
                .run_if(in_state(GameState::MainMenu)),
        );
    }
}

#[derive(Component)]
struct MainMenuRoot;

#[derive(Component)]
struct IpInputField {
    focused: bool,
}

#[derive(Component)]
struct IpTextDisplay;

#[derive(Component, Clone, Copy)]
enum MenuButton {
    Connect,
    Exit,
}

fn spawn_main_menu(mut commands: Commands, settings: Res<ClientSettings>) {
    commands
        .spawn((
            MainMenuRoot,
            Node {
                width: Val::Percent(100.0),
                height: Val::Percent(100.0),
                flex_direction: FlexDirection::Column,
                justify_content: JustifyContent::Center,
                align_items: AlignItems::Center,
                ..default()
            },
            BackgroundColor(MENU_BACKGROUND),
        ))
        .with_children(|parent| {
            parent.spawn((
                Text::new("YC SHOOTER"),
                title_text_style(),
                TextColor(ACCENT_COLOR),
                Node {
                    margin: UiRect::bottom(Val::Px(40.0)),
                    ..default()
                },
            ));

            parent
                .spawn(Node {
                    flex_direction: FlexDirection::Column,
                    align_items: AlignItems::Center,
                    margin: UiRect::bottom(Val::Px(20.0)),
                    ..default()
                })
                .with_children(|ip_section| {
                    ip_section.spawn((
                        Text::new("SERVER IP"),
                        TextFont {
                            font_size: 14.0,
                            ..default()
                        },
                        TextColor(TEXT_MUTED),
                        Node {
                            margin: UiRect::bottom(Val::Px(8.0)),
                            ..default()
                        },
                    ));

                    ip_section
                        .spawn((
                            IpInputField { focused: false },
                            Button,
                            Node {
                                width: Val::Px(280.0),
                                height: Val::Px(45.0),
                                justify_content: JustifyContent::Center,
                                align_items: AlignItems::Center,
                                border: UiRect::all(Val::Px(2.0)),
                                padding: UiRect::horizontal(Val::Px(12.0)),
                                ..default()
                            },
                            BackgroundColor(INPUT_BACKGROUND),
                            BorderColor::from(BUTTON_BORDER),
                            BorderRadius::all(Val::Px(4.0)),
                        ))
                        .with_children(|input_box| {
                            input_box.spawn((
                                IpTextDisplay,
                                Text::new(format!("{}:{}", settings.server_ip, settings.server_port)),
                                TextFont {
                                    font_size: 20.0,
                                    ..default()
                                },
                                TextColor(TEXT_COLOR),
                            ));
                        });
                });

            parent
                .spawn(Node {
                    flex_direction: FlexDirection::Column,
                    align_items: AlignItems::Center,
                    padding: UiRect::all(Val::Px(10.0)),
                    ..default()
                })
                .with_children(|buttons| {
                    spawn_button(buttons, "CONNECT", MenuButton::Connect);
                    spawn_button(buttons, "EXIT", MenuButton::Exit);
                });

            parent.spawn((
                Text::new(format!("Player id {}", settings.client_id)),
                TextFont {
                    font_size: 14.0,
                    ..default()
                },
                TextColor(TEXT_MUTED),
                Node {
                    position_type: PositionType::Absolute,
                    bottom: Val::Px(20.0),
                    ..default()
                },
            ));
        });
}

fn spawn_button(parent: &mut ChildSpawnerCommands<'_>, text: &str, action: MenuButton) {
    parent
        .spawn((
            Button,
            action,
            button_style(),
            BackgroundColor(BUTTON_NORMAL),
            BorderColor::from(BUTTON_BORDER),
            BorderRadius::all(Val::Px(6.0)),
        ))
        .with_children(|btn| {
            btn.spawn((Text::new(text), button_text_style(), TextColor(TEXT_COLOR)));
        });
}

fn despawn_main_menu(mut commands: Commands, query: Query<Entity, With<MainMenuRoot>>) {
    for entity in query.iter() {
        commands.entity(entity).despawn();
    }
}

fn button_interactions(
    mut buttons: Query<
        (&Interaction, &mut BackgroundColor, &mut BorderColor),
        (Changed<Interaction>, With<MenuButton>),
    >,
) {
    for (interaction, mut bg_color, mut border_color) in buttons.iter_mut() {
        let (bg, border) = match interaction {
            Interaction::Pressed => (BUTTON_PRESSED, ACCENT_COLOR),
            Interaction::Hovered => (BUTTON_HOVERED, ACCENT_COLOR),
            Interaction::None => (BUTTON_NORMAL, BUTTON_BORDER),
        };
        *bg_color = BackgroundColor(bg);
        *border_color = BorderColor::from(border);
    }
}

fn handle_menu_actions(
    buttons: Query<(&Interaction, &MenuButton), Changed<Interaction>>,
    mut next_state: ResMut<NextState<GameState>>,
    mut exit_writer: MessageWriter<AppExit>,
) {
    for (interaction, action) in buttons.iter() {
        if *interaction != Interaction::Pressed {
            continue;
        }
        match action {
            MenuButton::Connect => {
                info!("Connect pressed");
                next_state.set(GameState::Connecting);
            }
            MenuButton::Exit => {
                info!("Exit pressed");
                exit_writer.write(AppExit::Success);
            }
        }
    }
}

fn handle_ip_input_focus(
    mut input_fields: Query<(&Interaction, &mut IpInputField, &mut BorderColor)>,
    mouse_button: Res<ButtonInput<MouseButton>>,
) {
    let mut any_clicked = false;
    for (interaction, mut field, mut border) in input_fields.iter_mut() {
        if *interaction == Interaction::Pressed {
            field.focused = true;
            any_clicked = true;
            *border = BorderColor::from(ACCENT_COLOR);
        }
    }

    if mouse_button.just_pressed(MouseButton::Left) && !any_clicked {
        for (_, mut field, mut border) in input_fields.iter_mut() {
            if field.focused {
                field.focused = false;
                *border = BorderColor::from(BUTTON_BORDER);
            }
        }
    }
}

/// Append a typed character to the IP; only digits and dots up to a dotted quad's length.
fn push_ip_char(ip: &mut String, ch: char) -> bool {
    if (ch.is_ascii_digit() || ch == '.') && ip.len() < MAX_IP_LEN {
        ip.push(ch);
        return true;
    }
    false
}

fn handle_ip_keyboard_input(
    mut input_fields: Query<&mut IpInputField>,
    mut settings: ResMut<ClientSettings>,
    mut keyboard_events: MessageReader<KeyboardInput>,
) {
    let Some(mut field) = input_fields.iter_mut().find(|f| f.focused) else {
        return;
    };

    for event in keyboard_events.read() {
        if event.state != ButtonState::Pressed {
            continue;
        }
        match &event.logical_key {
            Key::Backspace => {
                settings.server_ip.pop();
            }
            Key::Escape | Key::Enter => field.focused = false,
            Key::Character(c) => {
                let mut chars = c.chars();
                if let (Some(ch), None) = (chars.next(), chars.next()) {
                    push_ip_char(&mut settings.server_ip, ch);
                }
            }
            _ => {}
        }
    }
}

fn update_ip_display(
    settings: Res<ClientSettings>,
    input_fields: Query<&IpInputField>,
    mut text_query: Query<&mut Text, With<IpTextDisplay>>,
    time: Res<Time>,
    mut cursor_timer: Local<f32>,
) {
    let is_focused = input_fields.iter().any(|f| f.focused);
    *cursor_timer += time.delta_secs();
    let cursor = if is_focused && (*cursor_timer % 1.0) < 0.5 { "|" } else { "" };

    let ip = if settings.server_ip.is_empty() {
        "_"
    } else {
        settings.server_ip.as_str()
    };
    for mut text in text_query.iter_mut() {
        **text = format!("{}:{}{}", ip, settings.server_port, cursor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ip_field_takes_digits_and_dots_only() {
        let mut ip = String::new();
        assert!(push_ip_char(&mut ip, '1'));
        assert!(push_ip_char(&mut ip, '.'));
        assert!(!push_ip_char(&mut ip, 'a'));
        assert_eq!(ip, "1.");
    }

    #[test]
    fn test_ip_field_stops_at_dotted_quad_length() {
        let mut ip = "255.255.255.255".to_string();
        assert!(!push_ip_char(&mut ip, '1'));
        assert_eq!(ip.len(), MAX_IP_LEN);
    }
}
