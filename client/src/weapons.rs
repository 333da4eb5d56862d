//! Local side of the hit-scan pipeline
//!
//! Fire abilities run their controllers on the owning client. Each released shot is traced
//! here, packaged as target data for the server, and shown right away as predicted hit markers
//! and view recoil. The server's confirmation decides which markers stand.

use bevy::prelude::*;
use lightyear::prelude::*;
use rand::Rng;

use shared::ability::AbilitySystemComponent;
use shared::config::ConsoleVariables;
use shared::equipment::EquipmentManager;
use shared::team::TeamSubsystem;
use shared::weapons::ballistics::AimRay;
use shared::weapons::fire_ability::{drive_fire_abilities, WeaponShot};
use shared::weapons::hitscan::{hit_markers_for, package_target_data, perform_local_targeting, TargetDataHandle};
use shared::weapons::trace::{ActorId, AnalyticTraceWorld, TraceHit};
use shared::weapons::{HitScanWeaponInstance, RecoilPatternPoint, WeaponStateComponent};
use shared::{
    eye_and_forward, AttachmentRequestResult, ClientConfirmTargetData, LocalPlayer, NetActor, PendingRecoilRecovery,
    PlayerPosition, ReliableChannel, ServerSetReplicatedTargetData, WeaponStatsChanged,
};

use crate::abilities::{AbilityFailureFeed, LocalNotifications};
use crate::input::InputState;

/// Recoil in degrees (pitch up, yaw right) as a look delta in radians.
pub fn recoil_to_look(recoil: RecoilPatternPoint) -> (f32, f32) {
    (recoil.pitch.to_radians(), -recoil.yaw.to_radians())
}

/// Bullet lines drawn while `Yc.Weapon.DrawBulletTraceDuration` is set.
#[derive(Resource, Default)]
pub struct BulletTraces {
    traces: Vec<(Vec3, Vec3, f64)>,
    hits: Vec<(Vec3, f64)>,
}

impl BulletTraces {
    fn record(&mut self, origin: Vec3, hits: &[TraceHit], now: f64, cvars: &ConsoleVariables) {
        if cvars.draw_bullet_trace_duration > 0.0 {
            let until = now + cvars.draw_bullet_trace_duration as f64;
            self.traces.extend(hits.iter().map(|h| (origin, h.location, until)));
        }
        if cvars.draw_bullet_hit_duration > 0.0 {
            let until = now + cvars.draw_bullet_hit_duration as f64;
            self.hits
                .extend(hits.iter().filter(|h| h.blocking).map(|h| (h.location, until)));
        }
    }
}

/// Everything the server needs to follow one predicted trigger pull.
pub struct PreparedShot {
    pub message: ServerSetReplicatedTargetData,
    pub recoil: RecoilPatternPoint,
    pub hits: Vec<TraceHit>,
}

/// Trace one shot and package it under the firing instance's prediction key.
#[allow(clippy::too_many_arguments)]
pub fn prepare_shot(
    asc: &AbilitySystemComponent,
    weapon: &mut HitScanWeaponInstance,
    world: &AnalyticTraceWorld,
    shooter: ActorId,
    aim: AimRay,
    shot: &WeaponShot,
    unique_id: u8,
    rng: &mut impl Rng,
) -> Option<PreparedShot> {
    let spec = asc.find_spec(shot.handle)?;
    let prediction_key = spec.instance(shot.instance)?.prediction_key;
    let local = perform_local_targeting(
        world,
        weapon,
        aim,
        shot.is_aiming,
        shot.is_crouching,
        &[shooter],
        shot.time,
        rng,
    );
    let data: TargetDataHandle = package_target_data(&local.hits, unique_id, rng);
    Some(PreparedShot {
        message: ServerSetReplicatedTargetData {
            ability_class_path: spec.definition.id.clone(),
            prediction_key,
            data,
        },
        recoil: local.recoil,
        hits: local.hits,
    })
}

/// Drive the local fire abilities with this tick's notifications and send every shot.
#[allow(clippy::too_many_arguments, clippy::type_complexity)]
pub fn fire_local_weapons(
    time: Res<Time>,
    world: Res<AnalyticTraceWorld>,
    teams: Res<TeamSubsystem>,
    cvars: Res<ConsoleVariables>,
    mut input_state: ResMut<InputState>,
    mut traces: ResMut<BulletTraces>,
    mut local: Query<
        (
            &NetActor,
            &PlayerPosition,
            &LocalNotifications,
            &mut AbilitySystemComponent,
            &mut EquipmentManager,
            &mut WeaponStateComponent,
        ),
        With<LocalPlayer>,
    >,
    camera: Query<(&Camera, &GlobalTransform), With<Camera3d>>,
    mut client_query: Query<&mut MessageSender<ServerSetReplicatedTargetData>, (With<crate::GameClient>, With<Connected>)>,
) {
    let Ok((actor, position, notifications, mut asc, mut equipment, mut state)) = local.single_mut() else {
        return;
    };
    let now = time.elapsed_secs_f64();

    let weapon = equipment.equipped_weapon().and_then(|e| e.weapon());
    let shots = drive_fire_abilities(&mut asc, &notifications.0, weapon, now);
    if shots.is_empty() {
        return;
    }
    let Some(weapon) = equipment.equipped_weapon_mut().and_then(|e| e.weapon_mut()) else {
        return;
    };
    let Ok(mut sender) = client_query.single_mut() else {
        return;
    };

    let mut rng = rand::thread_rng();
    for shot in &shots {
        let (eye, forward) = eye_and_forward(position.0, input_state.yaw, input_state.pitch);
        let aim = AimRay {
            origin: eye,
            direction: forward,
        };
        let unique_id = state.unconfirmed_server_side_hit_marker_count();
        let Some(prepared) = prepare_shot(&asc, weapon, &world, actor.0, aim, shot, unique_id, &mut rng) else {
            warn!("Shot from an ability instance that no longer exists");
            continue;
        };

        let markers = hit_markers_for(&prepared.hits, actor.0, &teams, |location| {
            let (camera, camera_transform) = camera.single().ok()?;
            camera.world_to_viewport(camera_transform, location).ok()
        });
        state.add_unconfirmed_server_side_hit_markers(unique_id, markers);
        traces.record(eye, &prepared.hits, now, &cvars);

        let (pitch, yaw) = recoil_to_look(prepared.recoil);
        input_state.add_look(pitch, yaw);

        sender.send::<ReliableChannel>(prepared.message);
    }
}

/// Rotate the view back by whatever recoil the weapon recovered.
pub fn apply_recoil_recovery(
    mut input_state: ResMut<InputState>,
    mut local: Query<&mut PendingRecoilRecovery, With<LocalPlayer>>,
) {
    let Ok(mut pending) = local.single_mut() else {
        return;
    };
    if pending.0 == RecoilPatternPoint::ZERO {
        return;
    }
    let (pitch, yaw) = recoil_to_look(pending.0);
    input_state.add_look(-pitch, -yaw);
    pending.0 = RecoilPatternPoint::ZERO;
}

/// Server verdicts on target data, weapon stat changes and attachment request results.
pub fn receive_weapon_messages(
    time: Res<Time>,
    mut feed: ResMut<AbilityFailureFeed>,
    mut client_query: Query<
        (
            &mut MessageReceiver<ClientConfirmTargetData>,
            &mut MessageReceiver<WeaponStatsChanged>,
            &mut MessageReceiver<AttachmentRequestResult>,
        ),
        With<crate::GameClient>,
    >,
    mut local: Query<&mut WeaponStateComponent, With<LocalPlayer>>,
) {
    let Ok((mut confirms, mut stats, mut results)) = client_query.single_mut() else {
        return;
    };
    let now = time.elapsed_secs_f64();

    let mut state = local.single_mut().ok();
    for confirm in confirms.receive() {
        if let Some(state) = state.as_deref_mut() {
            state.client_confirm_target_data(confirm.unique_id, confirm.success, &confirm.hit_replaces, now);
        }
    }
    for changed in stats.receive() {
        info!(
            "Weapon {:?} stats: {:.0} rpm, {:.0} m range",
            changed.equipment,
            60.0 / changed.stats.fire_interval().max(f32::EPSILON),
            changed.stats.max_damage_range
        );
    }
    for result in results.receive() {
        if result.success {
            info!("Attachment request applied");
        } else {
            let reason = result.reason.unwrap_or_else(|| "Attachment request refused".to_string());
            warn!("{}", reason);
            feed.latest = Some((reason, now));
        }
    }
}

pub fn draw_bullet_traces(
    time: Res<Time>,
    cvars: Res<ConsoleVariables>,
    mut traces: ResMut<BulletTraces>,
    mut gizmos: Gizmos,
) {
    let now = time.elapsed_secs_f64();
    traces.traces.retain(|(_, _, until)| *until > now);
    traces.hits.retain(|(_, until)| *until > now);
    for (start, end, _) in &traces.traces {
        gizmos.line(*start, *end, Color::srgb(1.0, 0.85, 0.3));
    }
    // Radius is authored in centimetres.
    let radius = cvars.draw_bullet_hit_radius * 0.01;
    for (location, _) in &traces.hits {
        gizmos.sphere(Isometry3d::from_translation(*location), radius, Color::srgb(1.0, 0.2, 0.2));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::ability::{AbilitySource, AbilitySpec, AbilitySpecHandle, ActivationEnv, AvatarInfo, NetRole};
    use shared::game_data::GameData;
    use shared::weapons::trace::TraceBody;

    fn data() -> GameData {
        GameData::load_from_dir(concat!(env!("CARGO_MANIFEST_DIR"), "/../assets/data"))
    }

    #[test]
    fn test_recoil_up_and_right_turns_the_view_up_and_right() {
        let (pitch, yaw) = recoil_to_look(RecoilPatternPoint::new(1.0, 1.0));
        assert!(pitch > 0.0);
        // Positive yaw turns left in our camera convention.
        assert!(yaw < 0.0);
    }

    #[test]
    fn test_prepared_shot_carries_the_prediction_key() {
        let data = data();
        let mut asc = AbilitySystemComponent::new(NetRole::AutonomousProxy, true);
        asc.set_avatar(AvatarInfo::new(1), &mut ActivationEnv::none());
        let definition = data.abilities.get_cached_item("GA_Weapon_Fire").unwrap();
        asc.mirror_granted_spec(
            AbilitySpec::new(definition, 1).with_source(AbilitySource::default()),
            AbilitySpecHandle(5),
        );
        let handle = AbilitySpecHandle(5);
        let instance = asc.find_spec(handle).unwrap().instances[0].id;

        let equipment = data.equipment.get_cached_item("rifle").unwrap();
        let stats = equipment.weapon_stats.clone().unwrap();
        let mut weapon = HitScanWeaponInstance::new(stats);

        let mut world = AnalyticTraceWorld::new();
        world.add(TraceBody::pawn(2, Vec3::new(0.0, 0.0, -10.0), 1.8, 0.35));
        let shot = WeaponShot {
            handle,
            instance,
            time: 1.0,
            is_aiming: true,
            is_crouching: false,
        };
        let aim = AimRay {
            origin: Vec3::new(0.0, 1.0, 0.0),
            direction: Vec3::NEG_Z,
        };
        let prepared = prepare_shot(&asc, &mut weapon, &world, 1, aim, &shot, 3, &mut rand::thread_rng()).unwrap();

        assert_eq!(prepared.message.ability_class_path, "GA_Weapon_Fire");
        assert_eq!(prepared.message.data.unique_id, 3);
        let expected_key = asc.find_spec(handle).unwrap().instance(instance).unwrap().prediction_key;
        assert_eq!(prepared.message.prediction_key, expected_key);
        assert!(!prepared.message.data.entries.is_empty());
    }
}
