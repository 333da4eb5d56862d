//! Arena population and respawning
//!
//! Updated for Lightyear 0.25

use bevy::prelude::*;
use lightyear::prelude::*;

use shared::ability::{
    AbilitySource, AbilitySystemComponent, ActivationEnv, AvatarInfo, DeathState, NetRole, DEATH_ABILITY_ID,
};
use shared::arena::TRAINING_DUMMY_POSITIONS;
use shared::effects::EffectContext;
use shared::game_data::GameData;
use shared::message_bus::GameplayMessageBus;
use shared::team::TeamSubsystem;
use shared::weapons::trace::ActorId;
use shared::{HealthAttributes, NetActor, PlayerPosition, TrainingDummy, SPAWN_POSITION};

/// Seconds a dead pawn waits before coming back
pub const RESPAWN_TIME: f32 = 4.0;

const DUMMY_ABILITY_SET: &str = "AbilitySet_TrainingDummy";
const HEAL_FULL_EFFECT: &str = "GE_Heal_Full";
const SPAWN_PROTECTION_EFFECT: &str = "GE_SpawnProtection";

/// Hands out pawn and dummy ids. Zero is never used.
#[derive(Resource, Debug)]
pub struct ActorIds {
    next: ActorId,
}

impl Default for ActorIds {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl ActorIds {
    pub fn allocate(&mut self) -> ActorId {
        let id = self.next;
        self.next += 1;
        id
    }
}

/// Added to dead pawns while waiting to respawn
#[derive(Component)]
pub struct RespawnTimer {
    pub time_remaining: f32,
}

/// Where a pawn respawns
#[derive(Component, Clone, Copy, Debug)]
pub struct SpawnPoint(pub Vec3);

/// Spawn point for the n-th pawn: a row along +X.
pub fn pawn_spawn_point(actor: ActorId) -> Vec3 {
    Vec3::from_array(SPAWN_POSITION) + Vec3::X * ((actor % 8) as f32 * 2.5 - 8.75)
}

/// One-shot resource to ensure we only spawn dummies once.
#[derive(Resource)]
pub struct DummiesSpawned;

/// Spawn the training dummies replicated to all clients.
///
/// This should run **after** the server has started networking, so clients actually receive them.
pub fn spawn_training_dummies_once(
    mut commands: Commands,
    spawned: Option<Res<DummiesSpawned>>,
    data: Res<GameData>,
    bus: Res<GameplayMessageBus>,
    mut teams: ResMut<TeamSubsystem>,
    mut ids: ResMut<ActorIds>,
) {
    if spawned.is_some() {
        return;
    }
    commands.insert_resource(DummiesSpawned);

    let Some(set) = data.ability_sets.get_cached_item(DUMMY_ABILITY_SET) else {
        error!("Ability set {} is missing; no training dummies", DUMMY_ABILITY_SET);
        return;
    };

    for position in TRAINING_DUMMY_POSITIONS {
        let actor = ids.allocate();
        let feet = Vec3::from_array(*position);
        let mut asc = AbilitySystemComponent::new(NetRole::Authority, false).with_bus(bus.clone());
        set.give_to_ability_system(
            &mut asc,
            None,
            AbilitySource::default(),
            &data.ability_set_sources(),
            &mut ActivationEnv::none(),
        );
        asc.set_avatar(AvatarInfo::new(actor), &mut ActivationEnv::none());
        teams.register_damageable(actor);

        commands.spawn((
            TrainingDummy,
            NetActor(actor),
            PlayerPosition(feet),
            SpawnPoint(feet),
            HealthAttributes::from_asc(&asc).unwrap_or_default(),
            asc,
            Replicate::new(ReplicationMode::SingleServer(NetworkTarget::All)),
        ));
    }

    info!("Spawned {} training dummies", TRAINING_DUMMY_POSITIONS.len());
}

/// Start the respawn countdown for anything whose death just began.
pub fn start_respawn_timers(
    mut commands: Commands,
    dying: Query<(Entity, &NetActor, &AbilitySystemComponent), Without<RespawnTimer>>,
) {
    for (entity, actor, asc) in dying.iter() {
        if asc.death_state() == DeathState::NotDead {
            continue;
        }
        info!("Actor {} died - respawning in {}s", actor.0, RESPAWN_TIME);
        commands.entity(entity).insert(RespawnTimer {
            time_remaining: RESPAWN_TIME,
        });
    }
}

/// Count down and bring actors back at their spawn point with full health.
pub fn tick_respawn_timers(
    mut commands: Commands,
    time: Res<Time>,
    data: Res<GameData>,
    mut dead: Query<(
        Entity,
        &NetActor,
        &SpawnPoint,
        &mut RespawnTimer,
        &mut AbilitySystemComponent,
        &mut PlayerPosition,
    )>,
) {
    let dt = time.delta_secs();
    for (entity, actor, spawn, mut timer, mut asc, mut position) in dead.iter_mut() {
        timer.time_remaining -= dt;
        if timer.time_remaining > 0.0 {
            continue;
        }
        respawn(&mut asc, &data);
        position.0 = spawn.0;
        commands.entity(entity).remove::<RespawnTimer>();
        info!("Actor {} respawned", actor.0);
    }
}

/// End the death ability, clear death tags, heal and re-apply spawn protection.
pub fn respawn(asc: &mut AbilitySystemComponent, data: &GameData) {
    if let Some(handle) = asc.find_ability_spec_handle_for_id(DEATH_ABILITY_ID, None) {
        let running: Vec<_> = asc
            .find_spec(handle)
            .map(|s| s.active_instances().map(|i| i.id).collect())
            .unwrap_or_default();
        for instance in running {
            asc.end_ability(handle, instance);
        }
    }
    asc.reset_death();

    for id in [HEAL_FULL_EFFECT, SPAWN_PROTECTION_EFFECT] {
        match data.effects.get_cached_item(id) {
            Some(effect) => {
                asc.apply_gameplay_effect_to_self(effect, 1, EffectContext::default());
            }
            None => warn!("Respawn effect {} is missing", id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::attributes::GameplayAttribute;
    use shared::tags::{names, tag};
    use shared::weapons::hitscan::{apply_pending_damage, PendingDamage};

    fn data() -> GameData {
        GameData::load_from_dir(concat!(env!("CARGO_MANIFEST_DIR"), "/../assets/data"))
    }

    #[test]
    fn test_actor_ids_skip_zero() {
        let mut ids = ActorIds::default();
        assert_eq!(ids.allocate(), 1);
        assert_eq!(ids.allocate(), 2);
    }

    #[test]
    fn test_respawn_restores_a_dead_dummy() {
        let data = data();
        let mut asc = AbilitySystemComponent::new(NetRole::Authority, false);
        let set = data.ability_sets.get_cached_item(DUMMY_ABILITY_SET).unwrap();
        set.give_to_ability_system(&mut asc, None, AbilitySource::default(), &data.ability_set_sources(), &mut ActivationEnv::none());
        asc.set_avatar(AvatarInfo::new(9), &mut ActivationEnv::none());

        let hit = PendingDamage {
            target: 9,
            damage: 150.0,
            hit_zone: None,
            distance: 5.0,
            cartridge_id: 1,
        };
        apply_pending_damage(&mut asc, &hit, 1, 1);
        asc.handle_out_of_health(Some(1), 150.0, &mut ActivationEnv::none());
        assert_eq!(asc.death_state(), DeathState::DeathStarted);

        respawn(&mut asc, &data);
        assert_eq!(asc.death_state(), DeathState::NotDead);
        assert_eq!(asc.get_numeric_attribute(GameplayAttribute::Health), Some(100.0));
        assert!(asc.has_matching_gameplay_tag(&tag(names::GAMEPLAY_DAMAGE_IMMUNITY)));
        let death = asc.find_ability_spec_handle_for_id(DEATH_ABILITY_ID, None).unwrap();
        assert!(!asc.find_spec(death).unwrap().is_active());
    }

    #[test]
    fn test_spawn_points_are_distinct() {
        assert_ne!(pawn_spawn_point(1), pawn_spawn_point(2));
    }
}
