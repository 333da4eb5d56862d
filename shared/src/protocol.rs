//! Lightyear network protocol definition
//!
//! Lightyear 0.25: messages declare their direction so the matching `MessageSender` /
//! `MessageReceiver` components can be added to links; replicated components are registered
//! with prediction for the owning client.

use bevy::prelude::*;
use lightyear::prelude::*;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ability::montage::MontageRpc;
use crate::ability::PredictionKey;
use crate::components::{
    HealthAttributes, NetActor, Player, PlayerPosition, PlayerRotation, ReplicatedMontages, TeamMember, TrainingDummy,
};
use crate::equipment::{EquipmentInstanceId, ReplicatedEquipment, ReplicatedQuickBar};
use crate::inventory::ReplicatedInventory;
use crate::tags::{GameplayTag, GameplayTagContainer};
use crate::weapons::hitscan::TargetDataHandle;
use crate::weapons::{HitScanWeaponStats, WeaponLoadout};

// --- Input (for server-authoritative movement) ---

/// Movement input sent from client to server each tick
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone, Default)]
pub struct PlayerInput {
    pub forward: bool,
    pub backward: bool,
    pub left: bool,
    pub right: bool,
    /// Facing direction (yaw) for movement
    pub yaw: f32,
}

// --- Client -> Server ---

/// An ability input tag was pressed or released.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct AbilityInputTag {
    pub tag: GameplayTag,
    pub pressed: bool,
}

/// A locally predicted activation the server should follow.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct ServerTryActivateAbility {
    pub ability_class_path: String,
    pub prediction_key: PredictionKey,
}

/// Generic input event for an ability already running on both ends.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct ServerAbilityInputEvent {
    pub ability_class_path: String,
    pub pressed: bool,
}

/// The owning client ended or cancelled a predicted ability.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct ServerEndAbility {
    pub ability_class_path: String,
    pub was_cancelled: bool,
}

/// Target data of one trigger pull.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct ServerSetReplicatedTargetData {
    pub ability_class_path: String,
    pub prediction_key: PredictionKey,
    pub data: TargetDataHandle,
}

/// `ServerCurrentMontageSetNextSection`, `ServerCurrentMontageSetPlayRate` and
/// `ServerCurrentMontageJumpToSection`, one variant each.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct ServerCurrentMontageRpc(pub MontageRpc);

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct SelectQuickbarSlot {
    /// `None` puts the active weapon away.
    pub slot: Option<usize>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct InstallAttachmentRequest {
    pub attachment_id: String,
    /// Explicit slot; the attachment's own slot when `None`.
    pub slot: Option<GameplayTag>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct UninstallAttachmentRequest {
    pub slot: GameplayTag,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct SetAttachmentTuningRequest {
    pub slot: GameplayTag,
    pub stat_tag: GameplayTag,
    pub value: f32,
}

/// Apply a loadout to the active weapon. With `save`, the server also stores it.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct ApplyLoadoutRequest {
    pub loadout: WeaponLoadout,
    pub save: bool,
}

// --- Server -> Client ---

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct ClientAbilityFailed {
    pub ability_class_path: String,
    pub failure_tags: GameplayTagContainer,
}

/// Server verdict on one target-data batch.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct ClientConfirmTargetData {
    pub unique_id: u8,
    pub success: bool,
    pub hit_replaces: Vec<u8>,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct ClientPredictionRejected {
    pub prediction_key: PredictionKey,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct ClientPredictionAccepted {
    pub prediction_key: PredictionKey,
}

/// Server-granted ability mirrored on the owning client.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct ClientAbilityGranted {
    pub handle: crate::ability::AbilitySpecHandle,
    pub ability_class_path: String,
    pub level: i32,
    pub dynamic_source_tags: GameplayTagContainer,
    pub source: crate::ability::AbilitySource,
}

#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct ClientAbilityRemoved {
    pub handle: crate::ability::AbilitySpecHandle,
}

/// Computed stats of an equipped weapon changed (attachments or tuning).
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct WeaponStatsChanged {
    pub equipment: EquipmentInstanceId,
    pub stats: HitScanWeaponStats,
}

/// Result of an attachment or loadout request that the client cannot predict.
#[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
pub struct AttachmentRequestResult {
    pub success: bool,
    pub reason: Option<String>,
}

// --- Channels ---

/// Reliable channel for gameplay messages
pub struct ReliableChannel;

/// Unreliable channel for frequent input (lowest latency)
pub struct InputChannel;

// --- Protocol Plugin ---

pub struct ProtocolPlugin;

impl Plugin for ProtocolPlugin {
    fn build(&self, app: &mut App) {
        // === PAWN COMPONENTS ===
        app.register_component::<Player>().add_prediction();
        app.register_component::<NetActor>().add_prediction();
        app.register_component::<PlayerPosition>().add_prediction();
        app.register_component::<PlayerRotation>().add_prediction();
        app.register_component::<TeamMember>().add_prediction();
        app.register_component::<TrainingDummy>().add_prediction();

        // === ABILITY / EQUIPMENT STATE ===
        app.register_component::<HealthAttributes>().add_prediction();
        app.register_component::<ReplicatedMontages>().add_prediction();
        app.register_component::<ReplicatedEquipment>().add_prediction();
        app.register_component::<ReplicatedQuickBar>().add_prediction();
        app.register_component::<ReplicatedInventory>().add_prediction();

        // === MESSAGES ===

        // Client -> Server
        app.register_message::<PlayerInput>()
            .add_direction(NetworkDirection::ClientToServer);
        app.register_message::<AbilityInputTag>()
            .add_direction(NetworkDirection::ClientToServer);
        app.register_message::<ServerTryActivateAbility>()
            .add_direction(NetworkDirection::ClientToServer);
        app.register_message::<ServerAbilityInputEvent>()
            .add_direction(NetworkDirection::ClientToServer);
        app.register_message::<ServerEndAbility>()
            .add_direction(NetworkDirection::ClientToServer);
        app.register_message::<ServerSetReplicatedTargetData>()
            .add_direction(NetworkDirection::ClientToServer);
        app.register_message::<ServerCurrentMontageRpc>()
            .add_direction(NetworkDirection::ClientToServer);
        app.register_message::<SelectQuickbarSlot>()
            .add_direction(NetworkDirection::ClientToServer);
        app.register_message::<InstallAttachmentRequest>()
            .add_direction(NetworkDirection::ClientToServer);
        app.register_message::<UninstallAttachmentRequest>()
            .add_direction(NetworkDirection::ClientToServer);
        app.register_message::<SetAttachmentTuningRequest>()
            .add_direction(NetworkDirection::ClientToServer);
        app.register_message::<ApplyLoadoutRequest>()
            .add_direction(NetworkDirection::ClientToServer);

        // Server -> Client
        app.register_message::<ClientAbilityFailed>()
            .add_direction(NetworkDirection::ServerToClient);
        app.register_message::<ClientConfirmTargetData>()
            .add_direction(NetworkDirection::ServerToClient);
        app.register_message::<ClientPredictionRejected>()
            .add_direction(NetworkDirection::ServerToClient);
        app.register_message::<ClientPredictionAccepted>()
            .add_direction(NetworkDirection::ServerToClient);
        app.register_message::<ClientAbilityGranted>()
            .add_direction(NetworkDirection::ServerToClient);
        app.register_message::<ClientAbilityRemoved>()
            .add_direction(NetworkDirection::ServerToClient);
        app.register_message::<WeaponStatsChanged>()
            .add_direction(NetworkDirection::ServerToClient);
        app.register_message::<AttachmentRequestResult>()
            .add_direction(NetworkDirection::ServerToClient);

        // === CHANNELS ===

        app.add_channel::<ReliableChannel>(ChannelSettings {
            mode: ChannelMode::OrderedReliable(ReliableSettings::default()),
            ..default()
        })
        // Abilities, target data, confirmations
        .add_direction(NetworkDirection::Bidirectional);

        app.add_channel::<InputChannel>(ChannelSettings {
            mode: ChannelMode::UnorderedUnreliable,
            ..default()
        })
        // Movement only; input tags ride the reliable channel
        .add_direction(NetworkDirection::ClientToServer);
    }
}

// --- Network Configuration ---

pub const SERVER_PORT: u16 = 5000;
pub const SERVER_ADDR: &str = "127.0.0.1";
pub const PROTOCOL_ID: u64 = 0x5943_5348_4F4F_5452;

/// Address the server binds to.
pub fn get_server_bind_addr() -> &'static str {
    "0.0.0.0"
}

/// Shared private key for local development
pub const PRIVATE_KEY: [u8; 32] = [
    0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08,
    0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e, 0x0f, 0x10,
    0x11, 0x12, 0x13, 0x14, 0x15, 0x16, 0x17, 0x18,
    0x19, 0x1a, 0x1b, 0x1c, 0x1d, 0x1e, 0x1f, 0x20,
];

/// Fixed timestep for game logic (60 Hz)
pub const FIXED_TIMESTEP_HZ: f64 = 60.0;

/// Tick duration for lightyear plugins
pub fn tick_duration() -> Duration {
    Duration::from_secs_f64(1.0 / FIXED_TIMESTEP_HZ)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weapons::hitscan::TargetDataEntry;
    use crate::weapons::trace::TraceHit;

    #[test]
    fn test_target_data_fits_one_packet() {
        let entries = (0..8)
            .map(|i| TargetDataEntry {
                hit: TraceHit::new(i, Vec3::new(i as f32, 0.0, 10.0)).pawn(),
                cartridge_id: 77,
                hit_replaced: false,
            })
            .collect();
        let message = ServerSetReplicatedTargetData {
            ability_class_path: "GA_Weapon_Fire_Shotgun".into(),
            prediction_key: PredictionKey(4),
            data: TargetDataHandle { unique_id: 3, entries },
        };
        let bytes = bincode::serialize(&message).unwrap();
        assert!(bytes.len() < 1200, "target data is {} bytes", bytes.len());
        let back: ServerSetReplicatedTargetData = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, message);
    }

    #[test]
    fn test_tick_duration_matches_rate() {
        assert!((tick_duration().as_secs_f64() * FIXED_TIMESTEP_HZ - 1.0).abs() < 1e-9);
    }
}
