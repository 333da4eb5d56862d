//! Console variables
//!
//! Every tunable debug/behaviour switch lives in one RON file so a dedicated server and a client
//! can be configured the same way. Names accepted by `set_by_name` are the public contract.

use bevy::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::ConfigError;

pub const CVARS_PATH: &str = "config/cvars.ron";

pub const CVAR_DRAW_BULLET_TRACE_DURATION: &str = "Yc.Weapon.DrawBulletTraceDuration";
pub const CVAR_DRAW_BULLET_HIT_DURATION: &str = "Yc.Weapon.DrawBulletHitDuration";
pub const CVAR_DRAW_BULLET_HIT_RADIUS: &str = "Yc.Weapon.DrawBulletHitRadius";
pub const CVAR_INTERACT_DRAW_DEBUG_SHAPE: &str = "Yc.Interact.DrawDebugShape";
pub const CVAR_REPLAY_MONTAGE_ERROR_THRESHOLD: &str = "Yc.Replay.MontageErrorThreshold";
pub const CVAR_FIX_CLIENT_MONTAGE_BLEND_OUT: &str = "AbilitySystem.Fix.ClientSideMontageBlendOutTimeSpecAnimInstance";
pub const CVAR_LOG_MESSAGES: &str = "GameplayMessageSubsystem.LogMessages";

#[derive(Resource, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleVariables {
    /// Seconds bullet trace lines stay visible (0 = off)
    pub draw_bullet_trace_duration: f32,
    /// Seconds bullet hit points stay visible (0 = off)
    pub draw_bullet_hit_duration: f32,
    pub draw_bullet_hit_radius: f32,
    pub interact_draw_debug_shape: bool,
    /// Position error (seconds) tolerated before a replay montage snaps
    pub replay_montage_error_threshold: f32,
    /// Live montage drift threshold
    pub montage_error_threshold: f32,
    pub fix_client_side_montage_blend_out_time: bool,
    pub log_messages: i32,
}

impl Default for ConsoleVariables {
    fn default() -> Self {
        Self {
            draw_bullet_trace_duration: 0.0,
            draw_bullet_hit_duration: 0.0,
            draw_bullet_hit_radius: 8.0,
            interact_draw_debug_shape: false,
            replay_montage_error_threshold: 0.5,
            montage_error_threshold: 0.1,
            fix_client_side_montage_blend_out_time: true,
            log_messages: 0,
        }
    }
}

impl ConsoleVariables {
    /// Load from `path`; a missing file yields defaults.
    pub fn read(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        Ok(ron::from_str(&content)?)
    }

    /// Load, logging and falling back to defaults on any error.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::read(path) {
            Ok(cvars) => {
                info!("Loaded console variables from {:?}", path);
                cvars
            }
            Err(e) => {
                warn!("Unable to load console variables from {:?}, using defaults: {}", path, e);
                Self::default()
            }
        }
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

    /// Set a variable by its console name, e.g. `Yc.Weapon.DrawBulletHitRadius 12`.
    pub fn set_by_name(&mut self, name: &str, value: &str) -> Result<(), ConfigError> {
        let value = value.trim();
        match name {
            CVAR_DRAW_BULLET_TRACE_DURATION => self.draw_bullet_trace_duration = parse_float(name, value)?,
            CVAR_DRAW_BULLET_HIT_DURATION => self.draw_bullet_hit_duration = parse_float(name, value)?,
            CVAR_DRAW_BULLET_HIT_RADIUS => self.draw_bullet_hit_radius = parse_float(name, value)?,
            CVAR_INTERACT_DRAW_DEBUG_SHAPE => self.interact_draw_debug_shape = parse_bool(name, value)?,
            CVAR_REPLAY_MONTAGE_ERROR_THRESHOLD => self.replay_montage_error_threshold = parse_float(name, value)?,
            CVAR_FIX_CLIENT_MONTAGE_BLEND_OUT => self.fix_client_side_montage_blend_out_time = parse_bool(name, value)?,
            CVAR_LOG_MESSAGES => {
                self.log_messages = value.parse().map_err(|_| ConfigError::InvalidValue {
                    name: name.to_string(),
                    value: value.to_string(),
                })?
            }
            _ => return Err(ConfigError::UnknownVariable(name.to_string())),
        }
        Ok(())
    }

    /// Parse a `Name Value` console line.
    pub fn apply_console_line(&mut self, line: &str) -> Result<(), ConfigError> {
        let mut parts = line.trim().splitn(2, char::is_whitespace);
        let name = parts.next().unwrap_or_default();
        let value = parts.next().unwrap_or_default();
        self.set_by_name(name, value)
    }
}

fn parse_float(name: &str, value: &str) -> Result<f32, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        name: name.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "1" | "true" | "True" => Ok(true),
        "0" | "false" | "False" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_console_contract() {
        let c = ConsoleVariables::default();
        assert_eq!(c.draw_bullet_trace_duration, 0.0);
        assert_eq!(c.draw_bullet_hit_radius, 8.0);
        assert_eq!(c.replay_montage_error_threshold, 0.5);
    }

    #[test]
    fn test_set_by_name() {
        let mut c = ConsoleVariables::default();
        c.apply_console_line("Yc.Weapon.DrawBulletHitRadius 12.5").unwrap();
        c.set_by_name(CVAR_INTERACT_DRAW_DEBUG_SHAPE, "1").unwrap();
        c.set_by_name(CVAR_LOG_MESSAGES, "2").unwrap();
        assert_eq!(c.draw_bullet_hit_radius, 12.5);
        assert!(c.interact_draw_debug_shape);
        assert_eq!(c.log_messages, 2);
        assert!(matches!(
            c.set_by_name("Yc.Nope", "1"),
            Err(ConfigError::UnknownVariable(_))
        ));
        assert!(c.set_by_name(CVAR_DRAW_BULLET_HIT_DURATION, "abc").is_err());
    }

    #[test]
    fn test_ron_partial_file_uses_defaults() {
        let c: ConsoleVariables = ron::from_str("(draw_bullet_hit_duration: 3.0)").unwrap();
        assert_eq!(c.draw_bullet_hit_duration, 3.0);
        assert_eq!(c.draw_bullet_hit_radius, 8.0);
    }
}
