//! Per-mesh montage playback
//!
//! A character carries several animated meshes (first-person arms, third-person body, weapon).
//! The ability system keeps one local record and one replicated record per mesh. Authority
//! writes the replicated record; simulated proxies only ever play what arrives through
//! `on_rep_replicated_montage`.

use bevy::prelude::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::asc::{AbilityNotification, AbilitySystemComponent, NetRole};
use super::definition::NetExecutionPolicy;
use super::spec::{AbilitySpecHandle, InstanceId, PredictionKey};
use crate::config::ConsoleVariables;
use crate::data_registry::{DataRegistry, RegistryItem};

/// Blend-out used when the server rejects a predicted montage.
pub const PREDICTION_REJECT_BLEND_OUT: f32 = 0.25;

// =============================================================================
// MONTAGE ASSETS
// =============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MontageSection {
    pub name: String,
    pub start_time: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MontageNotify {
    pub name: String,
    pub time: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnimMontage {
    pub id: String,
    /// Seconds at play rate 1.
    pub length: f32,
    /// Ordered by start time; the first starts at 0.
    pub sections: Vec<MontageSection>,
    pub blend_in: f32,
    pub blend_out: f32,
    pub notifies: Vec<MontageNotify>,
}

impl Default for AnimMontage {
    fn default() -> Self {
        Self {
            id: String::new(),
            length: 1.0,
            sections: vec![MontageSection {
                name: "Default".into(),
                start_time: 0.0,
            }],
            blend_in: 0.25,
            blend_out: 0.25,
            notifies: Vec::new(),
        }
    }
}

impl RegistryItem for AnimMontage {
    fn registry_id(&self) -> &str {
        &self.id
    }
}

impl AnimMontage {
    pub fn section_index_at(&self, position: f32) -> Option<usize> {
        self.sections.iter().rposition(|s| s.start_time <= position)
    }

    pub fn section_index(&self, name: &str) -> Option<usize> {
        self.sections.iter().position(|s| s.name == name)
    }

    pub fn section_end(&self, index: usize) -> f32 {
        self.sections.get(index + 1).map(|s| s.start_time).unwrap_or(self.length)
    }

    pub fn section_start(&self, name: &str) -> Option<f32> {
        self.section_index(name).map(|i| self.sections[i].start_time)
    }
}

// =============================================================================
// ANIM INSTANCE
// =============================================================================

/// Raised by an anim instance as playback progresses.
#[derive(Clone, Debug, PartialEq)]
pub enum MontageEvent {
    BlendingOut {
        montage_id: String,
        serial: u32,
        interrupted: bool,
    },
    Ended {
        montage_id: String,
        serial: u32,
        interrupted: bool,
    },
}

impl MontageEvent {
    pub fn serial(&self) -> u32 {
        match self {
            MontageEvent::BlendingOut { serial, .. } | MontageEvent::Ended { serial, .. } => *serial,
        }
    }
}

/// Montage playback primitives of one animated mesh.
pub trait AnimInstance {
    /// Start playing; returns the duration, or 0 if nothing plays.
    fn montage_play(&mut self, montage: Arc<AnimMontage>, play_rate: f32) -> f32;
    fn montage_stop(&mut self, blend_out: f32);
    fn montage_jump_to_section(&mut self, section: &str) -> bool;
    fn montage_set_next_section(&mut self, from: &str, to: &str) -> bool;
    fn montage_set_play_rate(&mut self, play_rate: f32);
    /// Move the play head; notifies between the old and new positions fire only when
    /// `fire_notifies` is set and the move is forward.
    fn montage_set_position(&mut self, position: f32, fire_notifies: bool);
    fn active_montage(&self) -> Option<&Arc<AnimMontage>>;
    fn montage_position(&self) -> f32;
    fn montage_play_rate(&self) -> f32;
    fn is_montage_stopped(&self) -> bool;
    fn current_section(&self) -> Option<String>;
    fn next_section(&self, from: &str) -> Option<String>;
    fn advance(&mut self, dt: f32);
    fn drain_events(&mut self) -> Vec<MontageEvent>;
    /// Incremented on every successful play; tags the events of that play.
    fn play_serial(&self) -> u32;

    fn active_montage_id(&self) -> Option<&str> {
        self.active_montage().map(|m| m.id.as_str())
    }
}

/// Headless anim instance that advances montages by time.
#[derive(Clone, Debug, Default)]
pub struct SimAnimInstance {
    montage: Option<Arc<AnimMontage>>,
    position: f32,
    play_rate: f32,
    stopped: bool,
    interrupted: bool,
    blend_remaining: Option<f32>,
    serial: u32,
    next_links: Vec<(String, String)>,
    events: Vec<MontageEvent>,
    fired_notifies: Vec<String>,
}

impl SimAnimInstance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_fired_notifies(&mut self) -> Vec<String> {
        std::mem::take(&mut self.fired_notifies)
    }

    fn fire_notifies(&mut self, from: f32, to: f32) {
        let Some(montage) = &self.montage else {
            return;
        };
        for notify in montage.notifies.iter().filter(|n| n.time > from && n.time <= to) {
            self.fired_notifies.push(notify.name.clone());
        }
    }

    fn begin_blend_out(&mut self, blend_out: f32, interrupted: bool) {
        let Some(id) = self.montage.as_ref().map(|m| m.id.clone()) else {
            return;
        };
        self.stopped = true;
        self.interrupted = interrupted;
        self.events.push(MontageEvent::BlendingOut {
            montage_id: id.clone(),
            serial: self.serial,
            interrupted,
        });
        if blend_out <= 0.0 {
            self.events.push(MontageEvent::Ended {
                montage_id: id,
                serial: self.serial,
                interrupted,
            });
            self.montage = None;
            self.blend_remaining = None;
        } else {
            self.blend_remaining = Some(blend_out);
        }
    }
}

impl AnimInstance for SimAnimInstance {
    fn montage_play(&mut self, montage: Arc<AnimMontage>, play_rate: f32) -> f32 {
        if play_rate <= 0.0 || montage.length <= 0.0 {
            return 0.0;
        }
        if self.montage.is_some() {
            if !self.stopped {
                self.begin_blend_out(0.0, true);
            } else if let Some(old) = self.montage.take() {
                self.events.push(MontageEvent::Ended {
                    montage_id: old.id.clone(),
                    serial: self.serial,
                    interrupted: self.interrupted,
                });
            }
        }
        self.serial = self.serial.wrapping_add(1);
        let duration = montage.length / play_rate;
        self.montage = Some(montage);
        self.position = 0.0;
        self.play_rate = play_rate;
        self.stopped = false;
        self.interrupted = false;
        self.blend_remaining = None;
        self.next_links.clear();
        duration
    }

    fn montage_stop(&mut self, blend_out: f32) {
        if self.montage.is_some() && !self.stopped {
            self.begin_blend_out(blend_out, true);
        }
    }

    fn montage_jump_to_section(&mut self, section: &str) -> bool {
        let Some(start) = self.montage.as_ref().and_then(|m| m.section_start(section)) else {
            return false;
        };
        self.position = start;
        true
    }

    fn montage_set_next_section(&mut self, from: &str, to: &str) -> bool {
        let valid = self
            .montage
            .as_ref()
            .is_some_and(|m| m.section_index(from).is_some() && m.section_index(to).is_some());
        if !valid {
            return false;
        }
        self.next_links.retain(|(f, _)| f != from);
        self.next_links.push((from.to_string(), to.to_string()));
        true
    }

    fn montage_set_play_rate(&mut self, play_rate: f32) {
        self.play_rate = play_rate;
    }

    fn montage_set_position(&mut self, position: f32, fire_notifies: bool) {
        if fire_notifies && position > self.position {
            self.fire_notifies(self.position, position);
        }
        self.position = position;
    }

    fn active_montage(&self) -> Option<&Arc<AnimMontage>> {
        self.montage.as_ref()
    }

    fn montage_position(&self) -> f32 {
        self.position
    }

    fn montage_play_rate(&self) -> f32 {
        self.play_rate
    }

    fn is_montage_stopped(&self) -> bool {
        self.montage.is_none() || self.stopped
    }

    fn current_section(&self) -> Option<String> {
        let montage = self.montage.as_ref()?;
        montage
            .section_index_at(self.position)
            .map(|i| montage.sections[i].name.clone())
    }

    fn next_section(&self, from: &str) -> Option<String> {
        if let Some((_, to)) = self.next_links.iter().find(|(f, _)| f == from) {
            return Some(to.clone());
        }
        let montage = self.montage.as_ref()?;
        let index = montage.section_index(from)?;
        montage.sections.get(index + 1).map(|s| s.name.clone())
    }

    fn advance(&mut self, dt: f32) {
        if let Some(remaining) = self.blend_remaining.as_mut() {
            *remaining -= dt;
            if *remaining <= 0.0 {
                if let Some(montage) = self.montage.take() {
                    self.events.push(MontageEvent::Ended {
                        montage_id: montage.id.clone(),
                        serial: self.serial,
                        interrupted: self.interrupted,
                    });
                }
                self.blend_remaining = None;
            }
            return;
        }
        let Some(montage) = self.montage.clone() else {
            return;
        };
        if self.stopped {
            return;
        }
        let old = self.position;
        let new = old + dt * self.play_rate;
        let Some(index) = montage.section_index_at(old) else {
            return;
        };
        let end = montage.section_end(index);
        if new < end {
            self.fire_notifies(old, new);
            self.position = new;
            return;
        }

        self.fire_notifies(old, end);
        let current = montage.sections[index].name.clone();
        let link = self.next_links.iter().find(|(f, _)| *f == current).map(|(_, t)| t.clone());
        match link.and_then(|to| montage.section_start(&to)) {
            Some(start) => self.position = start + (new - end),
            None if index + 1 < montage.sections.len() => {
                self.fire_notifies(end, new);
                self.position = new;
            }
            None => {
                self.position = montage.length;
                self.begin_blend_out(montage.blend_out, false);
            }
        }
    }

    fn drain_events(&mut self) -> Vec<MontageEvent> {
        std::mem::take(&mut self.events)
    }

    fn play_serial(&self) -> u32 {
        self.serial
    }
}

/// Animated meshes of one character, keyed by mesh tag.
#[derive(Component, Default)]
pub struct AnimationHost {
    meshes: Vec<(String, SimAnimInstance)>,
}

impl AnimationHost {
    pub fn with_meshes(names: &[&str]) -> Self {
        Self {
            meshes: names.iter().map(|n| (n.to_string(), SimAnimInstance::new())).collect(),
        }
    }

    pub fn anim_instance(&self, mesh: &str) -> Option<&SimAnimInstance> {
        self.meshes.iter().find(|(m, _)| m == mesh).map(|(_, a)| a)
    }

    pub fn anim_instance_mut(&mut self, mesh: &str) -> Option<&mut SimAnimInstance> {
        self.meshes.iter_mut().find(|(m, _)| m == mesh).map(|(_, a)| a)
    }

    pub fn mesh_names(&self) -> impl Iterator<Item = &str> {
        self.meshes.iter().map(|(m, _)| m.as_str())
    }

    pub fn advance(&mut self, dt: f32) {
        for (_, anim) in self.meshes.iter_mut() {
            anim.advance(dt);
        }
    }

    pub fn drain_all_events(&mut self) -> Vec<(String, MontageEvent)> {
        let mut out = Vec::new();
        for (mesh, anim) in self.meshes.iter_mut() {
            out.extend(anim.drain_events().into_iter().map(|e| (mesh.clone(), e)));
        }
        out
    }
}

// =============================================================================
// RECORDS
// =============================================================================

/// What this endpoint is playing on a mesh.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LocalMontageRecord {
    pub mesh: String,
    pub montage_id: Option<String>,
    pub animating_ability: Option<(AbilitySpecHandle, InstanceId)>,
    pub play_instance_id: bool,
}

/// Replicated montage state of one mesh.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RepAnimMontageInfo {
    pub montage_id: Option<String>,
    pub play_rate: f32,
    pub position: f32,
    pub blend_time: f32,
    pub section: Option<String>,
    pub next_section: Option<String>,
    /// Toggled on every play so proxies can tell "same montage, new play".
    pub play_instance_id: bool,
    pub is_stopped: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RepAnimMontageForMesh {
    pub mesh: String,
    pub info: RepAnimMontageInfo,
}

/// A montage started under a prediction key, faded out if the key is rejected.
#[derive(Clone, Debug, PartialEq)]
pub struct PredictedMontage {
    pub prediction_key: PredictionKey,
    pub mesh: String,
    pub montage_id: String,
}

/// Client -> server montage requests.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MontageRpc {
    SetNextSection {
        mesh: String,
        montage_id: String,
        client_position: f32,
        section: String,
        next_section: String,
    },
    SetPlayRate {
        mesh: String,
        montage_id: String,
        play_rate: f32,
    },
    JumpToSection {
        mesh: String,
        montage_id: String,
        section: String,
    },
}

impl MontageRpc {
    pub fn mesh(&self) -> &str {
        match self {
            MontageRpc::SetNextSection { mesh, .. }
            | MontageRpc::SetPlayRate { mesh, .. }
            | MontageRpc::JumpToSection { mesh, .. } => mesh,
        }
    }
}

// =============================================================================
// ABILITY SYSTEM MONTAGE API
// =============================================================================

impl AbilitySystemComponent {
    fn local_record_mut(&mut self, mesh: &str) -> &mut LocalMontageRecord {
        if let Some(index) = self.local_montages.iter().position(|r| r.mesh == mesh) {
            return &mut self.local_montages[index];
        }
        self.local_montages.push(LocalMontageRecord {
            mesh: mesh.to_string(),
            ..Default::default()
        });
        let last = self.local_montages.len() - 1;
        &mut self.local_montages[last]
    }

    fn replicated_record_mut(&mut self, mesh: &str) -> &mut RepAnimMontageInfo {
        if let Some(index) = self.replicated_montages.iter().position(|r| r.mesh == mesh) {
            return &mut self.replicated_montages[index].info;
        }
        self.replicated_montages.push(RepAnimMontageForMesh {
            mesh: mesh.to_string(),
            info: RepAnimMontageInfo::default(),
        });
        let last = self.replicated_montages.len() - 1;
        &mut self.replicated_montages[last].info
    }

    pub fn local_montage(&self, mesh: &str) -> Option<&LocalMontageRecord> {
        self.local_montages.iter().find(|r| r.mesh == mesh)
    }

    pub fn replicated_montage(&self, mesh: &str) -> Option<&RepAnimMontageInfo> {
        self.replicated_montages.iter().find(|r| r.mesh == mesh).map(|r| &r.info)
    }

    pub fn replicated_montages(&self) -> &[RepAnimMontageForMesh] {
        &self.replicated_montages
    }

    /// Returns whether the replicated records changed since the last call.
    pub fn take_replicated_montages_dirty(&mut self) -> bool {
        std::mem::take(&mut self.replicated_montages_dirty)
    }

    pub fn get_animating_ability_from_any_mesh(&self) -> Option<(AbilitySpecHandle, InstanceId)> {
        self.local_montages.iter().find_map(|r| r.animating_ability)
    }

    pub(crate) fn clear_animating_ability(&mut self, handle: AbilitySpecHandle, instance: InstanceId) {
        for record in self.local_montages.iter_mut() {
            if record.animating_ability == Some((handle, instance)) {
                record.animating_ability = None;
            }
        }
    }

    /// Play a montage on `mesh` for an ability. Runs on authority or on a locally predicting
    /// autonomous proxy; simulated proxies never play through here.
    #[allow(clippy::too_many_arguments)]
    pub fn play_montage_for_mesh(
        &mut self,
        ability: Option<(AbilitySpecHandle, InstanceId)>,
        mesh: &str,
        anim: &mut dyn AnimInstance,
        montage: Arc<AnimMontage>,
        play_rate: f32,
        start_section: Option<&str>,
        replicate: bool,
    ) -> f32 {
        let prediction_key = match self.role() {
            NetRole::SimulatedProxy => {
                debug!("play_montage_for_mesh ignored on simulated proxy ({})", montage.id);
                return 0.0;
            }
            NetRole::AutonomousProxy => {
                let Some((handle, instance)) = ability else {
                    return 0.0;
                };
                let Some(spec) = self.find_spec(handle) else {
                    return 0.0;
                };
                if spec.definition.net_execution_policy != NetExecutionPolicy::LocalPredicted {
                    return 0.0;
                }
                spec.instance(instance).map(|i| i.prediction_key).unwrap_or_default()
            }
            NetRole::Authority => PredictionKey::default(),
        };

        let montage_id = montage.id.clone();
        let blend_in = montage.blend_in;
        let duration = anim.montage_play(montage, play_rate);
        if duration <= 0.0 {
            return 0.0;
        }
        if let Some(section) = start_section {
            anim.montage_jump_to_section(section);
        }

        let record = self.local_record_mut(mesh);
        record.montage_id = Some(montage_id.clone());
        record.animating_ability = ability;
        record.play_instance_id = !record.play_instance_id;

        if self.is_authority() {
            if replicate {
                let section = anim.current_section();
                let next_section = section.as_deref().and_then(|s| anim.next_section(s));
                let position = anim.montage_position();
                let rep = self.replicated_record_mut(mesh);
                rep.montage_id = Some(montage_id);
                rep.play_rate = play_rate;
                rep.position = position;
                rep.blend_time = blend_in;
                rep.section = section;
                rep.next_section = next_section;
                rep.play_instance_id = !rep.play_instance_id;
                rep.is_stopped = false;
                self.replicated_montages_dirty = true;
            }
        } else if prediction_key.is_valid() {
            self.predicted_montages.push(PredictedMontage {
                prediction_key,
                mesh: mesh.to_string(),
                montage_id,
            });
        }
        duration
    }

    /// Stop whatever plays on `mesh`. `blend_out` defaults to the montage's own blend-out.
    pub fn current_montage_stop_for_mesh(&mut self, mesh: &str, anim: &mut dyn AnimInstance, blend_out: Option<f32>) {
        let Some(montage) = anim.active_montage().cloned() else {
            return;
        };
        if anim.is_montage_stopped() {
            return;
        }
        let blend = blend_out.unwrap_or(montage.blend_out);
        anim.montage_stop(blend);
        if self.is_authority() {
            if let Some(rep) = self
                .replicated_montages
                .iter_mut()
                .find(|r| r.mesh == mesh && r.info.montage_id.as_deref() == Some(montage.id.as_str()))
            {
                rep.info.is_stopped = true;
                rep.info.blend_time = blend;
                self.replicated_montages_dirty = true;
            }
        }
    }

    pub fn stop_montage_if_current_for_mesh(
        &mut self,
        mesh: &str,
        anim: &mut dyn AnimInstance,
        montage_id: &str,
        blend_out: Option<f32>,
    ) {
        if anim.active_montage_id() == Some(montage_id) {
            self.current_montage_stop_for_mesh(mesh, anim, blend_out);
        }
    }

    /// Called on the predicting client when the server rejects `key`.
    pub fn fade_out_rejected_montage(&mut self, mesh: &str, anim: &mut dyn AnimInstance, montage_id: &str) {
        if anim.active_montage_id() == Some(montage_id) && !anim.is_montage_stopped() {
            anim.montage_stop(PREDICTION_REJECT_BLEND_OUT);
        }
        let record = self.local_record_mut(mesh);
        if record.montage_id.as_deref() == Some(montage_id) {
            record.animating_ability = None;
        }
    }

    pub fn current_montage_jump_to_section_for_mesh(&mut self, mesh: &str, anim: &mut dyn AnimInstance, section: &str) {
        let Some(montage_id) = anim.active_montage_id().map(str::to_string) else {
            return;
        };
        if !anim.montage_jump_to_section(section) {
            return;
        }
        if self.is_authority() {
            self.refresh_replicated_montage(mesh, anim);
        } else {
            self.notify(AbilityNotification::ServerMontage(MontageRpc::JumpToSection {
                mesh: mesh.to_string(),
                montage_id,
                section: section.to_string(),
            }));
        }
    }

    pub fn current_montage_set_next_section_for_mesh(
        &mut self,
        mesh: &str,
        anim: &mut dyn AnimInstance,
        from_section: &str,
        to_section: &str,
    ) {
        let Some(montage_id) = anim.active_montage_id().map(str::to_string) else {
            return;
        };
        if !anim.montage_set_next_section(from_section, to_section) {
            return;
        }
        if self.is_authority() {
            self.refresh_replicated_montage(mesh, anim);
        } else {
            self.notify(AbilityNotification::ServerMontage(MontageRpc::SetNextSection {
                mesh: mesh.to_string(),
                montage_id,
                client_position: anim.montage_position(),
                section: from_section.to_string(),
                next_section: to_section.to_string(),
            }));
        }
    }

    pub fn current_montage_set_play_rate_for_mesh(&mut self, mesh: &str, anim: &mut dyn AnimInstance, play_rate: f32) {
        let Some(montage_id) = anim.active_montage_id().map(str::to_string) else {
            return;
        };
        anim.montage_set_play_rate(play_rate);
        if self.is_authority() {
            self.refresh_replicated_montage(mesh, anim);
        } else {
            self.notify(AbilityNotification::ServerMontage(MontageRpc::SetPlayRate {
                mesh: mesh.to_string(),
                montage_id,
                play_rate,
            }));
        }
    }

    /// Server side of the montage RPCs. Requests for a montage the server is not playing on
    /// that mesh are dropped.
    pub fn server_handle_montage_rpc(&mut self, rpc: &MontageRpc, anim: &mut dyn AnimInstance) {
        if !self.is_authority() {
            warn!("server_handle_montage_rpc called without authority");
            return;
        }
        let (MontageRpc::SetNextSection { montage_id, .. }
        | MontageRpc::SetPlayRate { montage_id, .. }
        | MontageRpc::JumpToSection { montage_id, .. }) = rpc;
        if anim.active_montage_id() != Some(montage_id.as_str()) {
            debug!("Montage RPC for {} does not match the server's montage", montage_id);
            return;
        }
        match rpc {
            MontageRpc::SetNextSection {
                client_position,
                section,
                next_section,
                ..
            } => {
                anim.montage_set_next_section(section, next_section);
                if anim.current_section().as_deref() != Some(section.as_str()) {
                    anim.montage_set_position(*client_position, false);
                }
            }
            MontageRpc::SetPlayRate { play_rate, .. } => anim.montage_set_play_rate(*play_rate),
            MontageRpc::JumpToSection { section, .. } => {
                anim.montage_jump_to_section(section);
            }
        }
        self.refresh_replicated_montage(rpc.mesh(), anim);
    }

    /// Copy the authority's playback state into the replicated record of `mesh`.
    pub fn refresh_replicated_montage(&mut self, mesh: &str, anim: &dyn AnimInstance) {
        if !self.is_authority() {
            return;
        }
        let Some(montage_id) = anim.active_montage_id().map(str::to_string) else {
            return;
        };
        let section = anim.current_section();
        let next_section = section.as_deref().and_then(|s| anim.next_section(s));
        let position = anim.montage_position();
        let play_rate = anim.montage_play_rate();
        let is_stopped = anim.is_montage_stopped();
        let rep = self.replicated_record_mut(mesh);
        if rep.montage_id.as_deref() != Some(montage_id.as_str()) {
            return;
        }
        let structural = rep.section != section
            || rep.next_section != next_section
            || rep.play_rate != play_rate
            || rep.is_stopped != is_stopped;
        rep.section = section;
        rep.next_section = next_section;
        rep.position = position;
        rep.play_rate = play_rate;
        rep.is_stopped = is_stopped;
        if structural {
            self.replicated_montages_dirty = true;
        }
    }

    /// Simulated proxy: reconcile local playback with a replicated record.
    pub fn on_rep_replicated_montage(
        &mut self,
        mesh: &str,
        info: &RepAnimMontageInfo,
        anim: &mut dyn AnimInstance,
        montages: &DataRegistry<AnimMontage>,
        cvars: &ConsoleVariables,
        is_replay: bool,
    ) {
        let previous = self.replicated_montage(mesh).cloned();
        *self.replicated_record_mut(mesh) = info.clone();

        let Some(montage_id) = info.montage_id.as_deref() else {
            return;
        };
        let toggled = previous.is_some_and(|p| p.play_instance_id != info.play_instance_id);
        let changed = self.local_montage(mesh).and_then(|r| r.montage_id.as_deref()) != Some(montage_id);

        if (changed || toggled) && !info.is_stopped {
            let Some(montage) = montages.get_cached_item(montage_id) else {
                warn!("Replicated montage {} is not in the montage registry", montage_id);
                return;
            };
            if anim.montage_play(montage, info.play_rate) <= 0.0 {
                return;
            }
            let record = self.local_record_mut(mesh);
            record.montage_id = Some(montage_id.to_string());
            record.animating_ability = None;
        }

        let Some(montage) = anim.active_montage().cloned() else {
            return;
        };
        if montage.id != montage_id {
            return;
        }

        if (anim.montage_play_rate() - info.play_rate).abs() > f32::EPSILON {
            anim.montage_set_play_rate(info.play_rate);
        }

        if info.is_stopped {
            if !anim.is_montage_stopped() {
                let blend = if cvars.fix_client_side_montage_blend_out_time {
                    info.blend_time
                } else {
                    montage.blend_out
                };
                anim.montage_stop(blend);
            }
            return;
        }

        let Some(rep_section) = info.section.as_deref() else {
            return;
        };
        let local_section = anim.current_section();
        if local_section.as_deref() != Some(rep_section) && local_section.as_deref() != info.next_section.as_deref() {
            anim.montage_jump_to_section(rep_section);
        } else if let Some(next) = info.next_section.as_deref() {
            anim.montage_set_next_section(rep_section, next);
        }

        if anim.current_section().as_deref() == Some(rep_section) {
            let threshold = if is_replay {
                cvars.replay_montage_error_threshold
            } else {
                cvars.montage_error_threshold
            };
            let local = anim.montage_position();
            if (local - info.position).abs() > threshold {
                anim.montage_set_position(info.position, info.position > local);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ability::definition::AbilityDefinition;
    use crate::ability::spec::AbilitySpec;
    use crate::ability::asc::ActivationEnv;

    fn montage() -> Arc<AnimMontage> {
        Arc::new(AnimMontage {
            id: "AM_Reload".into(),
            length: 2.0,
            sections: vec![
                MontageSection {
                    name: "Start".into(),
                    start_time: 0.0,
                },
                MontageSection {
                    name: "Loop".into(),
                    start_time: 1.0,
                },
                MontageSection {
                    name: "End".into(),
                    start_time: 1.5,
                },
            ],
            blend_in: 0.1,
            blend_out: 0.2,
            notifies: vec![MontageNotify {
                name: "MagOut".into(),
                time: 0.5,
            }],
        })
    }

    fn registry() -> DataRegistry<AnimMontage> {
        let mut reg = DataRegistry::new();
        reg.insert((*montage()).clone());
        reg
    }

    #[test]
    fn test_sim_anim_plays_to_end() {
        let mut anim = SimAnimInstance::new();
        assert_eq!(anim.montage_play(montage(), 2.0), 1.0);
        anim.advance(0.3);
        assert_eq!(anim.current_section().as_deref(), Some("Start"));
        assert_eq!(anim.take_fired_notifies(), vec!["MagOut".to_string()]);
        for _ in 0..10 {
            anim.advance(0.1);
        }
        let events = anim.drain_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, MontageEvent::BlendingOut { interrupted: false, serial: 1, .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, MontageEvent::Ended { interrupted: false, serial: 1, .. })));
        assert!(anim.active_montage().is_none());
    }

    #[test]
    fn test_next_section_link_loops() {
        let mut anim = SimAnimInstance::new();
        anim.montage_play(montage(), 1.0);
        anim.montage_jump_to_section("Loop");
        anim.montage_set_next_section("Loop", "Loop");
        anim.advance(0.6);
        assert_eq!(anim.current_section().as_deref(), Some("Loop"));
        assert!((anim.montage_position() - 1.1).abs() < 1e-4);
    }

    #[test]
    fn test_simulated_proxy_never_plays_locally() {
        let mut asc = AbilitySystemComponent::new(NetRole::SimulatedProxy, false);
        let mut anim = SimAnimInstance::new();
        let d = asc.play_montage_for_mesh(None, "Body", &mut anim, montage(), 1.0, None, true);
        assert_eq!(d, 0.0);
        assert!(anim.active_montage().is_none());
    }

    #[test]
    fn test_authority_play_updates_replicated_record() {
        let mut asc = AbilitySystemComponent::default();
        let mut anim = SimAnimInstance::new();
        asc.play_montage_for_mesh(None, "Body", &mut anim, montage(), 1.0, None, true);
        let first = asc.replicated_montage("Body").cloned().unwrap();
        assert_eq!(first.montage_id.as_deref(), Some("AM_Reload"));
        assert_eq!(first.section.as_deref(), Some("Start"));
        assert!(asc.take_replicated_montages_dirty());

        asc.play_montage_for_mesh(None, "Body", &mut anim, montage(), 1.0, None, true);
        let second = asc.replicated_montage("Body").unwrap();
        assert_ne!(first.play_instance_id, second.play_instance_id);
    }

    #[test]
    fn test_on_rep_starts_and_stops_playback() {
        let mut server = AbilitySystemComponent::default();
        let mut server_anim = SimAnimInstance::new();
        server.play_montage_for_mesh(None, "Body", &mut server_anim, montage(), 1.0, None, true);

        let mut proxy = AbilitySystemComponent::new(NetRole::SimulatedProxy, false);
        let mut proxy_anim = SimAnimInstance::new();
        let cvars = ConsoleVariables::default();
        let reg = registry();
        let info = server.replicated_montage("Body").cloned().unwrap();
        proxy.on_rep_replicated_montage("Body", &info, &mut proxy_anim, &reg, &cvars, false);
        assert_eq!(proxy_anim.active_montage_id(), Some("AM_Reload"));

        server.current_montage_stop_for_mesh("Body", &mut server_anim, Some(0.3));
        let info = server.replicated_montage("Body").cloned().unwrap();
        assert!(info.is_stopped);
        proxy.on_rep_replicated_montage("Body", &info, &mut proxy_anim, &reg, &cvars, false);
        assert!(proxy_anim.is_montage_stopped());
    }

    #[test]
    fn test_on_rep_snaps_drift_and_jumps_sections() {
        let mut proxy = AbilitySystemComponent::new(NetRole::SimulatedProxy, false);
        let mut anim = SimAnimInstance::new();
        let cvars = ConsoleVariables::default();
        let reg = registry();
        let mut info = RepAnimMontageInfo {
            montage_id: Some("AM_Reload".into()),
            play_rate: 1.0,
            position: 0.0,
            section: Some("Start".into()),
            next_section: Some("Loop".into()),
            ..Default::default()
        };
        proxy.on_rep_replicated_montage("Body", &info, &mut anim, &reg, &cvars, false);

        info.position = 0.6;
        proxy.on_rep_replicated_montage("Body", &info, &mut anim, &reg, &cvars, false);
        assert!((anim.montage_position() - 0.6).abs() < 1e-4);
        assert_eq!(anim.take_fired_notifies(), vec!["MagOut".to_string()]);

        // Small drift stays under the threshold
        info.position = 0.65;
        proxy.on_rep_replicated_montage("Body", &info, &mut anim, &reg, &cvars, false);
        assert!((anim.montage_position() - 0.6).abs() < 1e-4);

        info.section = Some("End".into());
        info.next_section = None;
        info.position = 1.6;
        proxy.on_rep_replicated_montage("Body", &info, &mut anim, &reg, &cvars, false);
        assert_eq!(anim.current_section().as_deref(), Some("End"));
    }

    #[test]
    fn test_predicted_montage_rejection_fades_out() {
        let mut client = AbilitySystemComponent::new(NetRole::AutonomousProxy, true);
        client.mirror_granted_spec(AbilitySpec::new(Arc::new(AbilityDefinition::new("Reload")), 1), AbilitySpecHandle(1));
        let instance = client
            .try_activate_ability(AbilitySpecHandle(1), &mut ActivationEnv::none())
            .unwrap();
        let key = client.find_spec(AbilitySpecHandle(1)).unwrap().instance(instance).unwrap().prediction_key;
        assert!(key.is_valid());

        let mut anim = SimAnimInstance::new();
        let d = client.play_montage_for_mesh(
            Some((AbilitySpecHandle(1), instance)),
            "Arms",
            &mut anim,
            montage(),
            1.0,
            None,
            true,
        );
        assert!(d > 0.0);
        assert!(client.replicated_montage("Arms").is_none());

        let rejected = client.on_prediction_key_rejected(key);
        assert_eq!(rejected, vec![("Arms".to_string(), "AM_Reload".to_string())]);
        client.fade_out_rejected_montage("Arms", &mut anim, "AM_Reload");
        assert!(anim.is_montage_stopped());
        assert!(!client.find_spec(AbilitySpecHandle(1)).unwrap().is_active());
    }

    #[test]
    fn test_client_section_change_sends_rpc_and_server_applies() {
        let mut client = AbilitySystemComponent::new(NetRole::AutonomousProxy, true);
        let mut client_anim = SimAnimInstance::new();
        client_anim.montage_play(montage(), 1.0);
        client.current_montage_jump_to_section_for_mesh("Arms", &mut client_anim, "End");
        let rpc = client
            .drain_notifications()
            .into_iter()
            .find_map(|n| match n {
                AbilityNotification::ServerMontage(rpc) => Some(rpc),
                _ => None,
            })
            .unwrap();

        let mut server = AbilitySystemComponent::default();
        let mut server_anim = SimAnimInstance::new();
        server.play_montage_for_mesh(None, "Arms", &mut server_anim, montage(), 1.0, None, true);
        server.server_handle_montage_rpc(&rpc, &mut server_anim);
        assert_eq!(server_anim.current_section().as_deref(), Some("End"));
        assert_eq!(server.replicated_montage("Arms").unwrap().section.as_deref(), Some("End"));
    }
}
