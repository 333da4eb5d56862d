//! Per-controller weapon state
//!
//! Drives the equipped weapon's tick and owns hit-marker bookkeeping: predicted markers wait
//! here, keyed by target-data id, until the server confirms which hits stand.

use bevy::prelude::*;

use super::instance::{HitScanWeaponInstance, OwnerMotion};
use super::RecoilPatternPoint;
use crate::tags::GameplayTag;

/// Markers older than this are cleared when a new confirmed hit arrives.
const HIT_MARKER_GROUP_WINDOW: f64 = 0.1;

/// A hit shown on the HUD.
#[derive(Clone, Debug, PartialEq)]
pub struct ScreenSpaceHitLocation {
    /// Screen position in pixels.
    pub location: Vec2,
    pub hit_zone: Option<GameplayTag>,
    pub show_as_success: bool,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ServerSideHitMarkerBatch {
    pub unique_id: u8,
    pub markers: Vec<ScreenSpaceHitLocation>,
}

#[derive(Component, Clone, Debug)]
pub struct WeaponStateComponent {
    unconfirmed_server_side_hit_markers: Vec<ServerSideHitMarkerBatch>,
    last_weapon_damage_screen_locations: Vec<ScreenSpaceHitLocation>,
    last_weapon_damage_instigated_time: f64,
}

impl Default for WeaponStateComponent {
    fn default() -> Self {
        Self {
            unconfirmed_server_side_hit_markers: Vec::new(),
            last_weapon_damage_screen_locations: Vec::new(),
            last_weapon_damage_instigated_time: f64::NEG_INFINITY,
        }
    }
}

impl WeaponStateComponent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the equipped weapon. Returns the recoil recovered this frame.
    pub fn tick_weapon(
        &self,
        weapon: Option<&mut HitScanWeaponInstance>,
        dt: f32,
        now: f64,
        motion: Option<OwnerMotion>,
    ) -> RecoilPatternPoint {
        match weapon {
            Some(weapon) => weapon.tick(dt, now, motion),
            None => RecoilPatternPoint::ZERO,
        }
    }

    /// Id the next target-data batch will carry.
    pub fn unconfirmed_server_side_hit_marker_count(&self) -> u8 {
        self.unconfirmed_server_side_hit_markers.len().min(u8::MAX as usize) as u8
    }

    pub fn unconfirmed_batches(&self) -> &[ServerSideHitMarkerBatch] {
        &self.unconfirmed_server_side_hit_markers
    }

    pub fn add_unconfirmed_server_side_hit_markers(&mut self, unique_id: u8, markers: Vec<ScreenSpaceHitLocation>) {
        self.unconfirmed_server_side_hit_markers
            .push(ServerSideHitMarkerBatch { unique_id, markers });
    }

    /// Server verdict on a predicted batch. Surviving successful markers move to the confirmed
    /// list; the batch is dropped either way.
    pub fn client_confirm_target_data(&mut self, unique_id: u8, success: bool, hit_replaces: &[u8], now: f64) {
        let Some(index) = self
            .unconfirmed_server_side_hit_markers
            .iter()
            .position(|b| b.unique_id == unique_id)
        else {
            debug!("No unconfirmed hit markers for target data {}", unique_id);
            return;
        };
        let batch = self.unconfirmed_server_side_hit_markers.remove(index);

        if !success || hit_replaces.len() == batch.markers.len() {
            return;
        }
        let mut found_success = false;
        for (marker_index, marker) in batch.markers.into_iter().enumerate() {
            let replaced = hit_replaces.iter().any(|&i| i as usize == marker_index);
            if replaced || !marker.show_as_success {
                continue;
            }
            if !found_success {
                self.actually_update_damage_instigated_time(now);
                found_success = true;
            }
            self.last_weapon_damage_screen_locations.push(marker);
        }
    }

    /// Damage landed by one of our weapons outside the predicted path.
    pub fn update_damage_instigated_time(&mut self, now: f64, caused_by_weapon: bool) {
        if caused_by_weapon {
            self.actually_update_damage_instigated_time(now);
        }
    }

    fn actually_update_damage_instigated_time(&mut self, now: f64) {
        if now - self.last_weapon_damage_instigated_time > HIT_MARKER_GROUP_WINDOW {
            self.last_weapon_damage_screen_locations.clear();
        }
        self.last_weapon_damage_instigated_time = now;
    }

    pub fn last_weapon_damage_screen_locations(&self) -> &[ScreenSpaceHitLocation] {
        &self.last_weapon_damage_screen_locations
    }

    pub fn time_since_last_hit_notification(&self, now: f64) -> f64 {
        now - self.last_weapon_damage_instigated_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker(x: f32, success: bool) -> ScreenSpaceHitLocation {
        ScreenSpaceHitLocation {
            location: Vec2::new(x, 0.0),
            hit_zone: None,
            show_as_success: success,
        }
    }

    #[test]
    fn test_confirm_promotes_successful_markers() {
        let mut state = WeaponStateComponent::new();
        let id = state.unconfirmed_server_side_hit_marker_count();
        assert_eq!(id, 0);
        state.add_unconfirmed_server_side_hit_markers(id, vec![marker(1.0, true)]);

        state.client_confirm_target_data(0, true, &[], 5.0);
        assert!(state.unconfirmed_batches().is_empty());
        assert_eq!(state.last_weapon_damage_screen_locations().len(), 1);
        assert!(state.time_since_last_hit_notification(5.0).abs() < 1e-9);
    }

    #[test]
    fn test_replaced_and_unsuccessful_markers_dropped() {
        let mut state = WeaponStateComponent::new();
        state.add_unconfirmed_server_side_hit_markers(0, vec![marker(1.0, true), marker(2.0, false), marker(3.0, true)]);
        state.client_confirm_target_data(0, true, &[0], 1.0);
        let locations = state.last_weapon_damage_screen_locations();
        assert_eq!(locations.len(), 1);
        assert_eq!(locations[0].location.x, 3.0);
    }

    #[test]
    fn test_rejected_batch_removed_without_markers() {
        let mut state = WeaponStateComponent::new();
        state.add_unconfirmed_server_side_hit_markers(0, vec![marker(1.0, true)]);
        state.client_confirm_target_data(0, false, &[], 1.0);
        assert!(state.unconfirmed_batches().is_empty());
        assert!(state.last_weapon_damage_screen_locations().is_empty());

        state.add_unconfirmed_server_side_hit_markers(0, vec![marker(1.0, true)]);
        state.client_confirm_target_data(0, true, &[0], 1.0);
        assert!(state.last_weapon_damage_screen_locations().is_empty());
    }

    #[test]
    fn test_stale_markers_cleared_after_window() {
        let mut state = WeaponStateComponent::new();
        state.add_unconfirmed_server_side_hit_markers(0, vec![marker(1.0, true)]);
        state.client_confirm_target_data(0, true, &[], 1.0);
        state.add_unconfirmed_server_side_hit_markers(0, vec![marker(2.0, true)]);
        state.client_confirm_target_data(0, true, &[], 1.05);
        assert_eq!(state.last_weapon_damage_screen_locations().len(), 2);

        state.add_unconfirmed_server_side_hit_markers(0, vec![marker(3.0, true)]);
        state.client_confirm_target_data(0, true, &[], 2.0);
        assert_eq!(state.last_weapon_damage_screen_locations().len(), 1);
    }
}
