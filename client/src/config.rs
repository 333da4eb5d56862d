//! Client settings
//!
//! Server address, the persistent client id and view preferences, stored as RON next to the
//! console variables.

use bevy::prelude::*;
use serde::{Deserialize, Serialize};
use shared::error::ConfigError;
use shared::{MOUSE_SENSITIVITY, SERVER_ADDR, SERVER_PORT};
use std::fs;
use std::path::Path;

pub const CLIENT_SETTINGS_PATH: &str = "config/client.ron";

#[derive(Resource, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub server_ip: String,
    pub server_port: u16,
    /// Netcode client id; 0 until the first launch picks one.
    pub client_id: u64,
    pub mouse_sensitivity: f32,
    /// Hip-fire field of view in degrees
    pub fov_degrees: f32,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            server_ip: SERVER_ADDR.to_string(),
            server_port: SERVER_PORT,
            client_id: 0,
            mouse_sensitivity: MOUSE_SENSITIVITY,
            fov_degrees: 70.0,
        }
    }
}

impl ClientSettings {
    /// Load from `path`; a missing file yields defaults.
    pub fn read(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        Ok(ron::from_str(&content)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = ron::ser::to_string_pretty(self, Default::default())?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Give this install a client id if it has none yet. Returns true when one was picked.
    pub fn ensure_client_id(&mut self) -> bool {
        if self.client_id != 0 {
            return false;
        }
        while self.client_id == 0 {
            self.client_id = rand::random::<u64>();
        }
        true
    }

    /// Load, pick a client id on first launch and write it back so reconnects keep the same
    /// identity (saved loadouts are keyed by it).
    pub fn load_or_create(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let mut settings = match Self::read(path) {
            Ok(settings) => settings,
            Err(e) => {
                warn!("Unable to load client settings from {:?}, using defaults: {}", path, e);
                Self::default()
            }
        };
        if settings.ensure_client_id() {
            info!("Assigned client id {}", settings.client_id);
            if let Err(e) = settings.save(path) {
                warn!("Unable to save client settings to {:?}: {}", path, e);
            }
        }
        settings
    }
}
