//! Player input handling
//!
//! Movement and look feed `PlayerInput`; ability bindings feed the local ability system and the
//! server as input tags; number keys pick quick bar slots; a few hotkeys drive attachments.
//!
//! Updated for Lightyear 0.25 / Bevy 0.17

use bevy::input::mouse::MouseMotion;
use bevy::prelude::*;
use lightyear::prelude::*;
use shared::ability::AbilitySystemComponent;
use shared::equipment::EquipmentManager;
use shared::tags::{names, tag, GameplayTag};
use shared::weapons::fire_ability::is_aiming;
use shared::{
    AbilityInputTag, ApplyLoadoutRequest, InputChannel, InstallAttachmentRequest, LocalPlayer, PlayerInput,
    ReliableChannel, SelectQuickbarSlot,
};
use std::f32::consts::FRAC_PI_2;

use crate::config::ClientSettings;
use crate::states::GameState;

/// Camera view mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CameraMode {
    #[default]
    FirstPerson,
    ThirdPerson,
}

/// Client-side input state
#[derive(Resource, Default)]
pub struct InputState {
    pub forward: bool,
    pub backward: bool,
    pub left: bool,
    pub right: bool,
    /// Mouse-controlled yaw
    pub yaw: f32,
    /// Mouse-controlled pitch
    pub pitch: f32,
    /// Camera mode (toggle with P)
    pub camera_mode: CameraMode,
}

impl InputState {
    pub fn to_player_input(&self, paused: bool) -> PlayerInput {
        if paused {
            return PlayerInput {
                yaw: self.yaw,
                ..Default::default()
            };
        }
        PlayerInput {
            forward: self.forward,
            backward: self.backward,
            left: self.left,
            right: self.right,
            yaw: self.yaw,
        }
    }

    /// Add a view kick; pitch stays short of straight up or down.
    pub fn add_look(&mut self, pitch: f32, yaw: f32) {
        self.yaw += yaw;
        self.pitch = (self.pitch + pitch).clamp(-FRAC_PI_2 + 0.01, FRAC_PI_2 - 0.01);
    }
}

#[derive(Clone, Copy, Debug)]
pub enum InputBinding {
    Key(KeyCode),
    Mouse(MouseButton),
}

impl InputBinding {
    fn just_pressed(self, keys: &ButtonInput<KeyCode>, mouse: &ButtonInput<MouseButton>) -> bool {
        match self {
            InputBinding::Key(k) => keys.just_pressed(k),
            InputBinding::Mouse(b) => mouse.just_pressed(b),
        }
    }

    fn just_released(self, keys: &ButtonInput<KeyCode>, mouse: &ButtonInput<MouseButton>) -> bool {
        match self {
            InputBinding::Key(k) => keys.just_released(k),
            InputBinding::Mouse(b) => mouse.just_released(b),
        }
    }
}

/// Ability input tags and what triggers them.
pub const ABILITY_BINDINGS: &[(InputBinding, &str)] = &[
    (InputBinding::Mouse(MouseButton::Left), names::INPUT_TAG_WEAPON_FIRE),
    (InputBinding::Mouse(MouseButton::Right), names::INPUT_TAG_WEAPON_ADS),
    (InputBinding::Key(KeyCode::KeyC), names::INPUT_TAG_CROUCH),
    (InputBinding::Key(KeyCode::KeyG), names::INPUT_TAG_EMOTE),
];

const QUICKBAR_KEYS: &[KeyCode] = &[KeyCode::Digit1, KeyCode::Digit2, KeyCode::Digit3];

const RED_DOT_OPTIC: &str = "optic_red_dot";
const THERMAL_OPTIC: &str = "optic_thermal";

/// Handle keyboard input for movement
pub fn handle_keyboard_input(keyboard: Res<ButtonInput<KeyCode>>, mut input_state: ResMut<InputState>) {
    input_state.forward = keyboard.pressed(KeyCode::KeyW);
    input_state.backward = keyboard.pressed(KeyCode::KeyS);
    input_state.left = keyboard.pressed(KeyCode::KeyA);
    input_state.right = keyboard.pressed(KeyCode::KeyD);

    if keyboard.just_pressed(KeyCode::KeyP) {
        input_state.camera_mode = match input_state.camera_mode {
            CameraMode::FirstPerson => CameraMode::ThirdPerson,
            CameraMode::ThirdPerson => CameraMode::FirstPerson,
        };
        info!("Camera mode: {:?}", input_state.camera_mode);
    }
}

/// Handle mouse input for looking around
pub fn handle_mouse_input(
    mut mouse_motion: MessageReader<MouseMotion>,
    mut input_state: ResMut<InputState>,
    settings: Res<ClientSettings>,
    local: Query<&AbilitySystemComponent, With<LocalPlayer>>,
) {
    let mut delta = Vec2::ZERO;
    for motion in mouse_motion.read() {
        delta += motion.delta;
    }
    if delta == Vec2::ZERO {
        return;
    }

    // Finer control while aiming down sights
    let aiming = local.single().is_ok_and(is_aiming);
    let sensitivity = if aiming {
        settings.mouse_sensitivity * 0.5
    } else {
        settings.mouse_sensitivity
    };
    input_state.add_look(-delta.y * sensitivity, -delta.x * sensitivity);
}

/// Send movement to the server every fixed tick
pub fn send_input_to_server(
    input_state: Res<InputState>,
    game_state: Res<State<GameState>>,
    mut client_query: Query<&mut MessageSender<PlayerInput>, (With<crate::GameClient>, With<Connected>)>,
    time: Res<Time>,
    mut last_warn_time: Local<f32>,
) {
    let Ok(mut sender) = client_query.single_mut() else {
        // Without a sender, input never reaches the server and movement freezes.
        let now = time.elapsed_secs();
        if now - *last_warn_time > 1.0 {
            warn!("send_input_to_server: missing GameClient+Connected+MessageSender<PlayerInput>; not sending inputs");
            *last_warn_time = now;
        }
        return;
    };

    let paused = game_state.get() == &GameState::Paused;
    sender.send::<InputChannel>(input_state.to_player_input(paused));
}

/// Bound ability inputs go to the local ability system and to the server as input tags.
/// While paused only releases go through, so nothing stays held.
pub fn send_ability_inputs(
    keys: Res<ButtonInput<KeyCode>>,
    mouse: Res<ButtonInput<MouseButton>>,
    game_state: Res<State<GameState>>,
    mut local: Query<&mut AbilitySystemComponent, With<LocalPlayer>>,
    mut client_query: Query<&mut MessageSender<AbilityInputTag>, (With<crate::GameClient>, With<Connected>)>,
) {
    let Ok(mut asc) = local.single_mut() else {
        return;
    };
    let Ok(mut sender) = client_query.single_mut() else {
        return;
    };
    let paused = game_state.get() == &GameState::Paused;

    for (binding, tag_name) in ABILITY_BINDINGS {
        let input_tag = tag(tag_name);
        if !paused && binding.just_pressed(&keys, &mouse) {
            asc.ability_input_tag_pressed(&input_tag);
            send_tag(&mut sender, input_tag.clone(), true);
        }
        if binding.just_released(&keys, &mouse) {
            asc.ability_input_tag_released(&input_tag);
            send_tag(&mut sender, input_tag, false);
        }
    }
}

fn send_tag(sender: &mut MessageSender<AbilityInputTag>, tag: GameplayTag, pressed: bool) {
    sender.send::<ReliableChannel>(AbilityInputTag { tag, pressed });
}

/// 1-3 pick a quick bar slot, H puts the weapon away.
pub fn select_quickbar_slot(
    keys: Res<ButtonInput<KeyCode>>,
    mut client_query: Query<&mut MessageSender<SelectQuickbarSlot>, (With<crate::GameClient>, With<Connected>)>,
) {
    let Ok(mut sender) = client_query.single_mut() else {
        return;
    };
    for (index, key) in QUICKBAR_KEYS.iter().enumerate() {
        if keys.just_pressed(*key) {
            sender.send::<ReliableChannel>(SelectQuickbarSlot { slot: Some(index) });
        }
    }
    if keys.just_pressed(KeyCode::KeyH) {
        sender.send::<ReliableChannel>(SelectQuickbarSlot { slot: None });
    }
}

/// The optic to install when the player swaps optics.
pub fn next_optic(current: Option<&str>) -> &'static str {
    match current {
        Some(RED_DOT_OPTIC) => THERMAL_OPTIC,
        _ => RED_DOT_OPTIC,
    }
}

/// T swaps the optic on the equipped weapon; L saves the current attachments as a loadout.
pub fn attachment_hotkeys(
    keys: Res<ButtonInput<KeyCode>>,
    local: Query<&EquipmentManager, With<LocalPlayer>>,
    mut client_query: Query<
        (&mut MessageSender<InstallAttachmentRequest>, &mut MessageSender<ApplyLoadoutRequest>),
        (With<crate::GameClient>, With<Connected>),
    >,
) {
    let swap = keys.just_pressed(KeyCode::KeyT);
    let save = keys.just_pressed(KeyCode::KeyL);
    if !swap && !save {
        return;
    }
    let Ok(equipment) = local.single() else {
        return;
    };
    let Some(weapon) = equipment.equipped_weapon() else {
        info!("No weapon equipped");
        return;
    };
    let Some(attachments) = weapon.attachments() else {
        info!("{} takes no attachments", weapon.definition().id);
        return;
    };
    let Ok((mut install, mut apply)) = client_query.single_mut() else {
        return;
    };

    if swap {
        let optic_slot = tag(names::ATTACHMENT_SLOT_OPTIC);
        let current = attachments.attachment_in_slot(&optic_slot).map(|a| a.attachment_id.as_str());
        install.send::<ReliableChannel>(InstallAttachmentRequest {
            attachment_id: next_optic(current).to_string(),
            slot: Some(optic_slot),
        });
    }
    if save {
        let loadout = attachments.create_loadout_from_current(weapon.definition().id.clone());
        info!("Saving loadout for {}", loadout.name);
        apply.send::<ReliableChannel>(ApplyLoadoutRequest { loadout, save: true });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paused_input_keeps_only_yaw() {
        let state = InputState {
            forward: true,
            left: true,
            yaw: 1.25,
            ..Default::default()
        };
        let input = state.to_player_input(true);
        assert!(!input.forward && !input.left);
        assert_eq!(input.yaw, 1.25);
        assert!(state.to_player_input(false).forward);
    }

    #[test]
    fn test_pitch_is_clamped() {
        let mut state = InputState::default();
        state.add_look(10.0, 0.5);
        assert!(state.pitch < FRAC_PI_2);
        assert_eq!(state.yaw, 0.5);
    }

    #[test]
    fn test_optic_swap_alternates() {
        assert_eq!(next_optic(None), RED_DOT_OPTIC);
        assert_eq!(next_optic(Some(RED_DOT_OPTIC)), THERMAL_OPTIC);
        assert_eq!(next_optic(Some(THERMAL_OPTIC)), RED_DOT_OPTIC);
    }
}
