//! Loadout persistence - disk I/O for saved weapon loadouts
//!
//! One file per player and weapon, in the binary loadout format. Uses atomic writes
//! (temp file + rename) to prevent corruption.

use bevy::prelude::*;
use std::path::{Path, PathBuf};

use shared::error::LoadoutError;
use shared::weapons::WeaponLoadout;

/// Where loadouts live unless `YC_LOADOUT_DIR` says otherwise.
pub const DEFAULT_LOADOUT_DIR: &str = "data/loadouts";

#[derive(Resource)]
pub struct LoadoutStore {
    pub storage_dir: PathBuf,
}

impl LoadoutStore {
    /// Create the store, making the directory if needed. A directory that cannot be created is
    /// logged; saves will then fail individually.
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        let storage_dir = storage_dir.into();
        if let Err(e) = std::fs::create_dir_all(&storage_dir) {
            error!("Failed to create loadout directory {:?}: {}", storage_dir, e);
        }
        info!("Weapon loadouts will be saved to: {:?}", storage_dir);
        Self { storage_dir }
    }

    pub fn from_env() -> Self {
        let dir = std::env::var("YC_LOADOUT_DIR").unwrap_or_else(|_| DEFAULT_LOADOUT_DIR.to_string());
        Self::new(dir)
    }

    fn path_for(&self, player: u64, equipment: &str) -> PathBuf {
        self.storage_dir.join(format!("player_{}_{}.bin", player, sanitize(equipment)))
    }

    /// Saved loadout for this player's weapon, if any.
    ///
    /// Returns:
    /// - Ok(Some(loadout)) if the file exists and is valid
    /// - Ok(None) if nothing was saved
    /// - Err if the file is unreadable or corrupted
    pub fn load(&self, player: u64, equipment: &str) -> Result<Option<WeaponLoadout>, LoadoutError> {
        let path = self.path_for(player, equipment);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)?;
        Ok(Some(WeaponLoadout::from_bytes(&bytes)?))
    }

    /// Save a loadout (atomic write via temp file).
    pub fn save(&self, player: u64, equipment: &str, loadout: &WeaponLoadout) -> Result<(), LoadoutError> {
        let final_path = self.path_for(player, equipment);
        let temp_path = final_path.with_extension("tmp");

        let bytes = loadout.to_bytes()?;
        write_atomic(&temp_path, &final_path, &bytes)?;

        info!(
            "Saved loadout '{}' for player {} ({}, {} bytes)",
            loadout.name,
            player,
            equipment,
            bytes.len()
        );
        Ok(())
    }
}

fn write_atomic(temp_path: &Path, final_path: &Path, bytes: &[u8]) -> Result<(), LoadoutError> {
    std::fs::write(temp_path, bytes)?;
    std::fs::rename(temp_path, final_path)?;
    Ok(())
}

/// Keep file names to `[A-Za-z0-9_-]`.
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}
