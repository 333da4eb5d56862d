//! Equipment
//!
//! An equipment definition describes what an item turns into while it sits in the quick bar:
//! ability sets to grant, actors to spawn on the pawn and, for weapons, base stats plus an
//! attachment layout. The `EquipmentManager` owns the live instances on the authority and
//! rebuilds them on receivers from the replicated list.

pub mod actors;
pub mod definition;
pub mod instance;
pub mod manager;
pub mod quickbar;

use serde::{Deserialize, Serialize};

pub use actors::{
    ActorSpawnRequest, AttachParent, EquipmentActorComponent, EquipmentActorHost, EquipmentActorRecord,
    EquipmentActorRegistry,
};
pub use definition::{EquipmentActorToSpawn, EquipmentDefinition, EquipmentInstanceType};
pub use instance::{EquipmentInstance, EquipmentState};
pub use manager::{EquipmentContext, EquipmentManager, ReplicatedEquipment, ReplicatedEquipmentEntry};
pub use quickbar::{QuickBar, QuickBarActiveIndexChangedMessage, QuickBarSlotsChangedMessage, ReplicatedQuickBar, DEFAULT_NUM_SLOTS};

/// Stable id of an equipment instance, unique per owning manager.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EquipmentInstanceId(pub u32);

impl EquipmentInstanceId {
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}
