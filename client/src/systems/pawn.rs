//! Gameplay components for replicated pawns
//!
//! The server replicates identity, position, health and snapshots. Each client builds its own
//! ability system, inventory and equipment mirrors next to them: the owning client gets an
//! autonomous proxy that predicts, everyone else a simulated proxy that follows.

use bevy::prelude::*;
use lightyear::prelude::*;
use shared::ability::{AbilitySystemComponent, ActivationEnv, AnimationHost, AvatarInfo, NetRole};
use shared::equipment::{
    EquipmentActorRegistry, EquipmentContext, EquipmentManager, QuickBar, ReplicatedEquipment, ReplicatedQuickBar,
    DEFAULT_NUM_SLOTS,
};
use shared::game_data::GameData;
use shared::inventory::{InventoryManager, ReplicatedInventory};
use shared::message_bus::GameplayMessageBus;
use shared::team::TeamSubsystem;
use shared::weapons::WeaponStateComponent;
use shared::{
    LocalPlayer, NetActor, PendingRecoilRecovery, PlayerPosition, PreviousPosition, TeamMember, TrainingDummy,
    PAWN_COMPONENT_TAGS, PAWN_MESHES,
};

use crate::abilities::LocalNotifications;
use crate::config::ClientSettings;

/// Whether a pawn is ours, a remote player or a target.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PawnRole {
    Local,
    Remote,
    Dummy,
}

impl PawnRole {
    pub fn net_role(self) -> NetRole {
        match self {
            PawnRole::Local => NetRole::AutonomousProxy,
            PawnRole::Remote | PawnRole::Dummy => NetRole::SimulatedProxy,
        }
    }
}

/// A fresh ability system for a pawn seen by this client.
pub fn pawn_asc(role: PawnRole, actor: u64, player_id: Option<u64>, bus: &GameplayMessageBus) -> AbilitySystemComponent {
    let mut asc = AbilitySystemComponent::new(role.net_role(), role == PawnRole::Local).with_bus(bus.clone());
    if let Some(id) = player_id {
        asc = asc.with_player_id(id);
    }
    asc.set_avatar(AvatarInfo::new(actor), &mut ActivationEnv::none());
    asc
}

/// Build gameplay components for replicated pawns that do not have them yet.
///
/// Runs every frame rather than on `Added<Player>`: the first snapshot can land before the
/// client knows its own peer id.
#[allow(clippy::too_many_arguments, clippy::type_complexity)]
pub fn setup_replicated_pawns(
    mut commands: Commands,
    data: Res<GameData>,
    bus: Res<GameplayMessageBus>,
    settings: Res<ClientSettings>,
    mut host: ResMut<EquipmentActorRegistry>,
    client_query: Query<&LocalId, (With<crate::GameClient>, With<Connected>)>,
    players: Query<
        (
            Entity,
            &shared::Player,
            &NetActor,
            &PlayerPosition,
            Option<&ReplicatedInventory>,
            Option<&ReplicatedQuickBar>,
            Option<&ReplicatedEquipment>,
        ),
        Without<AbilitySystemComponent>,
    >,
    dummies: Query<(Entity, &NetActor), (With<TrainingDummy>, Without<AbilitySystemComponent>)>,
) {
    let Ok(local_id) = client_query.single() else {
        return;
    };

    for (entity, player, actor, position, inventory_snapshot, quickbar_snapshot, equipment_snapshot) in players.iter() {
        let role = if player.client_id == local_id.0 {
            PawnRole::Local
        } else {
            PawnRole::Remote
        };
        let player_id = (role == PawnRole::Local).then_some(settings.client_id);
        let mut asc = pawn_asc(role, actor.0, player_id, &bus);
        let mut equipment = EquipmentManager::new(actor.0, false, role == PawnRole::Local);
        host.register_pawn(actor.0, true, PAWN_COMPONENT_TAGS.iter().map(|s| s.to_string()).collect());

        // Snapshots already present will not show up as changed again.
        if let Some(snapshot) = equipment_snapshot {
            let mut ctx = EquipmentContext::new(&data, &mut *host).with_asc(&mut asc);
            equipment.apply_replicated(snapshot, &mut ctx);
        }

        let mut pawn = commands.entity(entity);
        pawn.insert((asc, equipment, AnimationHost::with_meshes(PAWN_MESHES)));

        if role == PawnRole::Local {
            let mut inventory = InventoryManager::new(Some(settings.client_id));
            if let Some(snapshot) = inventory_snapshot {
                inventory.apply_replicated(snapshot.0.clone());
            }
            let mut quickbar = QuickBar::new(false, Some(settings.client_id), DEFAULT_NUM_SLOTS);
            if let Some(snapshot) = quickbar_snapshot {
                quickbar.apply_replicated(snapshot);
            }
            pawn.insert((
                LocalPlayer,
                inventory,
                quickbar,
                WeaponStateComponent::new(),
                PendingRecoilRecovery::default(),
                PreviousPosition(position.0),
                LocalNotifications::default(),
            ));
            info!("Local pawn {} ready", actor.0);
        } else {
            debug!("Remote pawn {} ready", actor.0);
        }
    }

    for (entity, actor) in dummies.iter() {
        let asc = pawn_asc(PawnRole::Dummy, actor.0, None, &bus);
        commands
            .entity(entity)
            .insert((asc, AnimationHost::with_meshes(PAWN_MESHES)));
    }
}

/// Keep the local team table in step with replicated team membership.
pub fn sync_teams(
    mut teams: ResMut<TeamSubsystem>,
    members: Query<(&NetActor, &TeamMember), Changed<TeamMember>>,
    dummies: Query<&NetActor, Added<TrainingDummy>>,
) {
    for (actor, team) in members.iter() {
        teams.set_team(actor.0, team.0);
    }
    for actor in dummies.iter() {
        teams.register_damageable(actor.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_the_local_pawn_predicts() {
        let bus = GameplayMessageBus::new();
        let local = pawn_asc(PawnRole::Local, 1, Some(42), &bus);
        let remote = pawn_asc(PawnRole::Remote, 2, None, &bus);
        let dummy = pawn_asc(PawnRole::Dummy, 3, None, &bus);

        assert!(local.is_locally_controlled());
        assert!(!local.is_authority());
        assert!(!remote.is_locally_controlled());
        assert!(!dummy.is_authority());
    }
}
