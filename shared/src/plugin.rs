//! Systems both endpoints run
//!
//! `GameplayPlugin` installs the world services (data registries, console variables, message
//! bus, teams, trace world, equipment actors) and ticks the per-pawn components. Endpoint
//! specific work (RPC handling, firing, HUD) is added by the server and client apps.

use bevy::prelude::*;
use std::collections::HashMap;

use crate::ability::{AbilitySystemComponent, AnimationHost};
use crate::arena::add_arena_to_trace_world;
use crate::components::{NetActor, PlayerPosition, ReplicatedMontages};
use crate::config::{ConsoleVariables, CVARS_PATH};
use crate::equipment::{
    EquipmentActorRegistry, EquipmentContext, EquipmentManager, QuickBar, ReplicatedEquipment, ReplicatedQuickBar,
};
use crate::game_data::{GameData, DATA_DIR};
use crate::inventory::{InventoryManager, ReplicatedInventory};
use crate::message_bus::GameplayMessageBus;
use crate::player::{PLAYER_HEIGHT, PLAYER_RADIUS};
use crate::team::TeamSubsystem;
use crate::weapons::fire_ability::is_crouching;
use crate::weapons::instance::OwnerMotion;
use crate::weapons::trace::{ActorId, AnalyticTraceWorld, TraceBody};
use crate::weapons::{RecoilPatternPoint, WeaponStateComponent};

/// Ordering of the shared fixed-tick work.
#[derive(SystemSet, Debug, Clone, PartialEq, Eq, Hash)]
pub enum GameplaySet {
    /// Trace bodies follow pawns.
    World,
    /// Ability, animation and weapon ticks.
    Tick,
}

/// Recoil the weapon recovered this tick; the client camera consumes it.
#[derive(Component, Clone, Copy, Debug, Default, PartialEq)]
pub struct PendingRecoilRecovery(pub RecoilPatternPoint);

/// Where each pawn was last tick, for owner-motion spread.
#[derive(Component, Clone, Copy, Debug, Default, PartialEq)]
pub struct PreviousPosition(pub Vec3);

pub struct GameplayPlugin {
    /// Skip loading `assets/data` and the arena (tests insert their own `GameData`).
    pub load_data: bool,
}

impl Default for GameplayPlugin {
    fn default() -> Self {
        Self { load_data: true }
    }
}

impl Plugin for GameplayPlugin {
    fn build(&self, app: &mut App) {
        let cvars = if self.load_data {
            ConsoleVariables::load_or_default(CVARS_PATH)
        } else {
            ConsoleVariables::default()
        };
        let bus = GameplayMessageBus::new();
        bus.set_log_messages(cvars.log_messages);

        if !app.world().contains_resource::<GameData>() {
            let data = if self.load_data {
                GameData::load_from_dir(DATA_DIR)
            } else {
                GameData::default()
            };
            info!(
                "Loaded game data: {} abilities, {} equipment, {} attachments, {} items",
                data.abilities.len(),
                data.equipment.len(),
                data.attachments.len(),
                data.items.len()
            );
            app.insert_resource(data);
        }

        app.insert_resource(cvars)
            .insert_resource(bus)
            .init_resource::<TeamSubsystem>()
            .init_resource::<AnalyticTraceWorld>()
            .init_resource::<EquipmentActorRegistry>();

        if self.load_data {
            app.add_systems(Startup, add_arena_to_trace_world);
        }

        app.configure_sets(FixedUpdate, (GameplaySet::World, GameplaySet::Tick).chain());
        app.add_systems(
            FixedUpdate,
            (
                track_trace_bodies.in_set(GameplaySet::World),
                (tick_ability_systems, tick_montage_tasks, tick_equipped_weapons)
                    .chain()
                    .in_set(GameplaySet::Tick),
            ),
        );
        app.add_systems(
            Update,
            (
                apply_replicated_inventory,
                apply_replicated_equipment,
                apply_replicated_quickbar,
                apply_replicated_montages,
            )
                .chain(),
        );
    }
}

/// Keep one capsule per pawn in the trace world.
pub fn track_trace_bodies(
    mut world: ResMut<AnalyticTraceWorld>,
    mut known: Local<HashMap<Entity, ActorId>>,
    pawns: Query<(Entity, &NetActor, &PlayerPosition)>,
    mut removed: RemovedComponents<NetActor>,
) {
    for entity in removed.read() {
        if let Some(actor) = known.remove(&entity) {
            world.remove_actor(actor);
        }
    }
    for (entity, actor, position) in pawns.iter() {
        if known.insert(entity, actor.0).is_none() {
            world.add(TraceBody::pawn(actor.0, position.0, PLAYER_HEIGHT, PLAYER_RADIUS));
        } else {
            world.set_pawn_feet(actor.0, position.0);
        }
    }
}

pub fn tick_ability_systems(time: Res<Time>, mut ascs: Query<&mut AbilitySystemComponent>) {
    let dt = time.delta_secs();
    for mut asc in ascs.iter_mut() {
        asc.tick(dt);
    }
}

pub fn tick_montage_tasks(
    time: Res<Time>,
    data: Res<GameData>,
    mut pawns: Query<(&mut AbilitySystemComponent, &mut AnimationHost)>,
) {
    let dt = time.delta_secs();
    for (mut asc, mut host) in pawns.iter_mut() {
        host.advance(dt);
        asc.tick_montage_tasks(&mut host, &data.montages);
    }
}

/// Advance spread and recoil recovery of each pawn's equipped weapon.
pub fn tick_equipped_weapons(
    time: Res<Time>,
    mut pawns: Query<(
        &WeaponStateComponent,
        &mut EquipmentManager,
        Option<&AbilitySystemComponent>,
        Option<&PlayerPosition>,
        Option<&mut PreviousPosition>,
        Option<&mut PendingRecoilRecovery>,
    )>,
) {
    let dt = time.delta_secs();
    let now = time.elapsed_secs_f64();
    for (state, mut equipment, asc, position, previous, recovery) in pawns.iter_mut() {
        let motion = match (position, previous) {
            (Some(position), Some(mut previous)) => {
                let velocity = if dt > 0.0 { (position.0 - previous.0) / dt } else { Vec3::ZERO };
                previous.0 = position.0;
                Some(OwnerMotion {
                    velocity,
                    is_falling: velocity.y < -0.5,
                    is_crouching: asc.is_some_and(is_crouching),
                })
            }
            _ => None,
        };
        let weapon = equipment.equipped_weapon_mut().and_then(|e| e.weapon_mut());
        let recovered = state.tick_weapon(weapon, dt, now, motion);
        if let Some(mut pending) = recovery {
            pending.0.pitch += recovered.pitch;
            pending.0.yaw += recovered.yaw;
        }
    }
}

/// The owning client mirrors its inventory so costs can be checked before predicting.
pub fn apply_replicated_inventory(
    mut pawns: Query<(&ReplicatedInventory, &mut InventoryManager, &AbilitySystemComponent), Changed<ReplicatedInventory>>,
) {
    for (snapshot, mut inventory, asc) in pawns.iter_mut() {
        if asc.is_authority() {
            continue;
        }
        inventory.apply_replicated(snapshot.0.clone());
    }
}

/// Receivers rebuild equipment from the authority's list.
pub fn apply_replicated_equipment(
    data: Res<GameData>,
    mut host: ResMut<EquipmentActorRegistry>,
    mut pawns: Query<
        (&ReplicatedEquipment, &mut EquipmentManager, Option<&mut AbilitySystemComponent>),
        Changed<ReplicatedEquipment>,
    >,
) {
    for (snapshot, mut manager, asc) in pawns.iter_mut() {
        if manager.is_authority() {
            continue;
        }
        let mut ctx = EquipmentContext::new(&data, &mut *host);
        if let Some(asc) = asc {
            ctx = ctx.with_asc(asc.into_inner());
        }
        manager.apply_replicated(snapshot, &mut ctx);
    }
}

pub fn apply_replicated_quickbar(mut pawns: Query<(&ReplicatedQuickBar, &mut QuickBar), Changed<ReplicatedQuickBar>>) {
    for (snapshot, mut quickbar) in pawns.iter_mut() {
        quickbar.apply_replicated(snapshot);
    }
}

/// Simulated proxies follow the authority's montage records.
pub fn apply_replicated_montages(
    data: Res<GameData>,
    cvars: Res<ConsoleVariables>,
    mut pawns: Query<
        (&ReplicatedMontages, &mut AbilitySystemComponent, &mut AnimationHost),
        Changed<ReplicatedMontages>,
    >,
) {
    for (records, mut asc, mut host) in pawns.iter_mut() {
        if asc.is_authority() || asc.is_locally_controlled() {
            continue;
        }
        for record in &records.0 {
            let Some(anim) = host.anim_instance_mut(&record.mesh) else {
                warn!("Replicated montage for unknown mesh {}", record.mesh);
                continue;
            };
            asc.on_rep_replicated_montage(&record.mesh, &record.info, anim, &data.montages, &cvars, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::weapons::trace::TraceWorld;

    #[test]
    fn test_trace_bodies_follow_pawns() {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        app.add_plugins(GameplayPlugin { load_data: false });
        app.add_systems(Update, track_trace_bodies);

        let pawn = app
            .world_mut()
            .spawn((NetActor(5), PlayerPosition(Vec3::new(10.0, 0.0, 0.0))))
            .id();
        app.update();
        let hits = app
            .world()
            .resource::<AnalyticTraceWorld>()
            .line_trace_multi(Vec3::new(0.0, 1.0, 0.0), Vec3::new(20.0, 1.0, 0.0), &[]);
        assert_eq!(hits.first().map(|h| h.actor), Some(5));

        app.world_mut().entity_mut(pawn).despawn();
        app.update();
        assert!(app.world().resource::<AnalyticTraceWorld>().bodies.is_empty());
    }
}
