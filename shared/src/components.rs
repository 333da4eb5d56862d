//! Replicated ECS components shared by server and client

use bevy::prelude::*;
use lightyear::prelude::PeerId;
use serde::{Deserialize, Serialize};

use crate::ability::{AbilitySystemComponent, RepAnimMontageForMesh};
use crate::attributes::GameplayAttribute;
use crate::team::TeamId;
use crate::weapons::trace::ActorId;

// =============================================================================
// ACTORS
// =============================================================================

/// Marker component for player pawns
#[derive(Component, Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Player {
    pub client_id: PeerId,
}

/// Stable id of a pawn or target as seen by traces, teams and equipment actors.
#[derive(Component, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NetActor(pub ActorId);

/// A damageable target that belongs to no team.
#[derive(Component, Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct TrainingDummy;

/// Feet position - replicated across network
#[derive(Component, Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct PlayerPosition(pub Vec3);

/// Yaw - replicated across network
#[derive(Component, Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct PlayerRotation(pub f32);

#[derive(Component, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct TeamMember(pub TeamId);

/// Marker for the local player (client-side only)
#[derive(Component)]
pub struct LocalPlayer;

// =============================================================================
// ABILITY STATE MIRRORS
// =============================================================================

/// Health as other endpoints see it, copied from the pawn's health set.
#[derive(Component, Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct HealthAttributes {
    pub health: f32,
    pub max_health: f32,
}

impl Default for HealthAttributes {
    fn default() -> Self {
        Self {
            health: 100.0,
            max_health: 100.0,
        }
    }
}

impl HealthAttributes {
    pub fn from_asc(asc: &AbilitySystemComponent) -> Option<Self> {
        Some(Self {
            health: asc.get_numeric_attribute(GameplayAttribute::Health)?,
            max_health: asc.get_numeric_attribute(GameplayAttribute::MaxHealth)?,
        })
    }

    pub fn is_dead(&self) -> bool {
        self.health <= 0.0
    }

    pub fn fraction(&self) -> f32 {
        if self.max_health <= 0.0 {
            return 0.0;
        }
        (self.health / self.max_health).clamp(0.0, 1.0)
    }
}

/// Per-mesh montage state replicated to simulated proxies.
#[derive(Component, Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct ReplicatedMontages(pub Vec<RepAnimMontageForMesh>);
