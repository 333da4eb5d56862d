//! Shared UI styles: dark slate with a signal-orange accent

use bevy::prelude::*;

pub const MENU_BACKGROUND: Color = Color::srgb(0.05, 0.06, 0.07);
pub const INPUT_BACKGROUND: Color = Color::srgb(0.08, 0.09, 0.10);

pub const BUTTON_NORMAL: Color = Color::srgb(0.11, 0.12, 0.14);
pub const BUTTON_HOVERED: Color = Color::srgb(0.18, 0.20, 0.23);
pub const BUTTON_PRESSED: Color = Color::srgb(0.85, 0.45, 0.12);
pub const BUTTON_BORDER: Color = Color::srgb(0.25, 0.28, 0.32);

/// Accent color, also used for the active quick bar slot
pub const ACCENT_COLOR: Color = Color::srgb(0.95, 0.55, 0.15);

pub const TEXT_COLOR: Color = Color::srgb(0.90, 0.92, 0.94);
pub const TEXT_MUTED: Color = Color::srgb(0.48, 0.52, 0.56);

/// HUD colors
pub const HEALTH_FULL: Color = Color::srgb(0.30, 0.80, 0.35);
pub const HEALTH_LOW: Color = Color::srgb(0.85, 0.20, 0.15);
pub const HUD_PANEL: Color = Color::srgba(0.0, 0.0, 0.0, 0.45);
pub const FAILURE_TEXT: Color = Color::srgb(1.0, 0.65, 0.3);

/// Standard button style
pub fn button_style() -> Node {
    Node {
        width: Val::Px(280.0),
        height: Val::Px(55.0),
        justify_content: JustifyContent::Center,
        align_items: AlignItems::Center,
        margin: UiRect::all(Val::Px(8.0)),
        border: UiRect::all(Val::Px(2.0)),
        ..default()
    }
}

pub fn button_text_style() -> TextFont {
    TextFont {
        font_size: 22.0,
        ..default()
    }
}

pub fn title_text_style() -> TextFont {
    TextFont {
        font_size: 72.0,
        ..default()
    }
}

pub fn hud_text_style() -> TextFont {
    TextFont {
        font_size: 18.0,
        ..default()
    }
}
