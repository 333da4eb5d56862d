//! Gameplay framework shared by the server and the client
//!
//! Tag-driven abilities and attributes, equipment with ability-set grants, weapons with
//! modular attachments and the predicted hit-scan pipeline. Everything here is plain data and
//! functions over it; `GameplayPlugin` wires the per-tick parts into a Bevy app.

pub mod ability;
pub mod arena;
pub mod attributes;
pub mod components;
pub mod config;
pub mod data_registry;
pub mod effects;
pub mod equipment;
pub mod error;
pub mod game_data;
pub mod inventory;
pub mod message_bus;
pub mod player;
pub mod plugin;
pub mod protocol;
pub mod replication;
pub mod tag_stack;
pub mod tags;
pub mod team;
pub mod weapons;

pub use components::*;
pub use player::*;
pub use plugin::*;
pub use protocol::*;
