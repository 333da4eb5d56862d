//! UI module

pub mod hud;
pub mod main_menu;
pub mod pause_menu;
pub mod styles;

pub use hud::HudPlugin;
pub use main_menu::MainMenuPlugin;
pub use pause_menu::PauseMenuPlugin;
