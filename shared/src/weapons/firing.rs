//! Fire-mode state machine
//!
//! One `FireController` lives inside each running fire-ability instance. It never traces or
//! touches the weapon itself; callers feed it the clock and act on the returned `FireEvents`.

use super::{FireMode, HitScanWeaponStats};

/// Upper bound on shots resolved in one `tick`, so a long hitch cannot spin forever.
const MAX_SHOTS_PER_TICK: u32 = 32;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FireState {
    #[default]
    Idle,
    Firing,
    /// Between two bursts of a `BurstAuto` weapon.
    BurstWaiting,
}

/// Timing inputs derived from the weapon's computed stats.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FireTiming {
    pub fire_mode: FireMode,
    pub fire_interval: f64,
    pub burst_count: u32,
    pub burst_interval_multiplier: f64,
}

impl FireTiming {
    pub fn from_stats(stats: &HitScanWeaponStats) -> Self {
        Self {
            fire_mode: stats.fire_mode,
            fire_interval: stats.fire_interval() as f64,
            burst_count: stats.burst_count.max(1),
            burst_interval_multiplier: stats.burst_interval_multiplier.max(0.0) as f64,
        }
    }

    fn burst_interval(&self) -> f64 {
        self.fire_interval * self.burst_interval_multiplier
    }
}

/// What happened during one controller call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FireEvents {
    /// Times of the shots fired, oldest first.
    pub shots: Vec<f64>,
    pub firing_started: bool,
    pub firing_stopped: bool,
    /// The owning ability should end now.
    pub end_ability: bool,
}

impl FireEvents {
    fn merge(&mut self, other: FireEvents) {
        self.shots.extend(other.shots);
        self.firing_started |= other.firing_started;
        self.firing_stopped |= other.firing_stopped;
        self.end_ability |= other.end_ability;
    }
}

#[derive(Clone, Debug)]
pub struct FireController {
    state: FireState,
    is_firing: bool,
    wants_stop_firing: bool,
    end_when_stopped: bool,
    is_aiming: bool,
    is_crouching: bool,
    current_burst_shot_count: u32,
    last_shot_time: f64,
    next_shot_time: Option<f64>,
}

impl Default for FireController {
    fn default() -> Self {
        Self {
            state: FireState::Idle,
            is_firing: false,
            wants_stop_firing: false,
            end_when_stopped: false,
            is_aiming: false,
            is_crouching: false,
            current_burst_shot_count: 0,
            last_shot_time: f64::NEG_INFINITY,
            next_shot_time: None,
        }
    }
}

impl FireController {
    pub fn new() -> Self {
        Self::default()
    }

    /// A controller that keeps the fire-rate cooldown of an earlier activation.
    pub fn with_last_shot_time(last_shot_time: f64) -> Self {
        Self {
            last_shot_time,
            ..Self::default()
        }
    }

    pub fn state(&self) -> FireState {
        self.state
    }

    pub fn is_firing(&self) -> bool {
        self.is_firing
    }

    pub fn is_aiming(&self) -> bool {
        self.is_aiming
    }

    pub fn is_crouching(&self) -> bool {
        self.is_crouching
    }

    pub fn set_aim_state(&mut self, aiming: bool, crouching: bool) {
        self.is_aiming = aiming;
        self.is_crouching = crouching;
    }

    pub fn current_burst_shot_count(&self) -> u32 {
        self.current_burst_shot_count
    }

    pub fn last_shot_time(&self) -> f64 {
        self.last_shot_time
    }

    pub fn next_shot_time(&self) -> Option<f64> {
        self.next_shot_time
    }

    /// Begin firing. Ignored while already firing. Shoots immediately if the weapon has cooled
    /// down since the last shot, otherwise schedules the first shot for when it has.
    pub fn start_firing(&mut self, aiming: bool, crouching: bool, now: f64, timing: &FireTiming) -> FireEvents {
        let mut events = FireEvents::default();
        if self.is_firing {
            return events;
        }
        self.is_aiming = aiming;
        self.is_crouching = crouching;
        self.is_firing = true;
        self.wants_stop_firing = false;
        self.end_when_stopped = false;
        self.current_burst_shot_count = 0;
        self.state = FireState::Firing;
        events.firing_started = true;

        let since_last = now - self.last_shot_time;
        if since_last >= timing.fire_interval {
            events.merge(self.fire_shot(now, timing));
        } else {
            self.next_shot_time = Some(self.last_shot_time + timing.fire_interval);
        }
        events
    }

    /// Stop firing. Burst modes finish the running burst first. With `end_when_done` the
    /// owning ability ends on the final transition.
    pub fn stop_firing(&mut self, end_when_done: bool, timing: &FireTiming) -> FireEvents {
        let mut events = FireEvents::default();
        if !self.is_firing {
            events.end_ability = end_when_done;
            return events;
        }
        match timing.fire_mode {
            FireMode::Auto | FireMode::SemiAuto => {
                self.halt(&mut events);
                events.end_ability = end_when_done;
            }
            FireMode::BurstAuto | FireMode::BurstSingle => {
                if self.state == FireState::BurstWaiting {
                    self.halt(&mut events);
                    events.end_ability = end_when_done;
                } else {
                    self.wants_stop_firing = true;
                    self.end_when_stopped |= end_when_done;
                }
            }
        }
        events
    }

    /// Fire every shot scheduled at or before `now`.
    pub fn tick(&mut self, now: f64, timing: &FireTiming) -> FireEvents {
        let mut events = FireEvents::default();
        let mut guard = 0;
        while let Some(at) = self.next_shot_time {
            if at > now || guard >= MAX_SHOTS_PER_TICK {
                break;
            }
            guard += 1;
            self.next_shot_time = None;
            events.merge(self.fire_shot(at, timing));
        }
        events
    }

    /// Drop any schedule without emitting events, e.g. when the ability is cancelled.
    pub fn reset(&mut self) {
        let last = self.last_shot_time;
        *self = Self::default();
        self.last_shot_time = last;
    }

    fn halt(&mut self, events: &mut FireEvents) {
        self.is_firing = false;
        self.wants_stop_firing = false;
        self.end_when_stopped = false;
        self.current_burst_shot_count = 0;
        self.next_shot_time = None;
        self.state = FireState::Idle;
        events.firing_stopped = true;
    }

    fn fire_shot(&mut self, now: f64, timing: &FireTiming) -> FireEvents {
        let mut events = FireEvents::default();
        self.last_shot_time = now;
        self.current_burst_shot_count += 1;
        events.shots.push(now);

        match timing.fire_mode {
            FireMode::Auto => {
                if self.is_firing {
                    self.state = FireState::Firing;
                    self.next_shot_time = Some(now + timing.fire_interval);
                }
            }
            FireMode::SemiAuto => {
                self.halt(&mut events);
            }
            FireMode::BurstAuto => {
                if self.current_burst_shot_count >= timing.burst_count {
                    self.current_burst_shot_count = 0;
                    if self.wants_stop_firing {
                        let end = self.end_when_stopped;
                        self.halt(&mut events);
                        events.end_ability = end;
                    } else {
                        self.state = FireState::BurstWaiting;
                        self.next_shot_time = Some(now + timing.burst_interval());
                    }
                } else {
                    self.state = FireState::Firing;
                    self.next_shot_time = Some(now + timing.fire_interval);
                }
            }
            FireMode::BurstSingle => {
                if self.current_burst_shot_count >= timing.burst_count {
                    let end = self.end_when_stopped;
                    self.halt(&mut events);
                    events.end_ability = end;
                } else {
                    self.state = FireState::Firing;
                    self.next_shot_time = Some(now + timing.fire_interval);
                }
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing(mode: FireMode) -> FireTiming {
        FireTiming {
            fire_mode: mode,
            fire_interval: 0.1,
            burst_count: 3,
            burst_interval_multiplier: 2.0,
        }
    }

    #[test]
    fn test_auto_fires_until_stopped() {
        let t = timing(FireMode::Auto);
        let mut fc = FireController::new();
        let ev = fc.start_firing(false, false, 0.0, &t);
        assert!(ev.firing_started);
        assert_eq!(ev.shots, vec![0.0]);

        let ev = fc.tick(0.35, &t);
        assert_eq!(ev.shots.len(), 3);
        assert_eq!(fc.state(), FireState::Firing);

        let ev = fc.stop_firing(true, &t);
        assert!(ev.firing_stopped && ev.end_ability);
        assert!(fc.tick(1.0, &t).shots.is_empty());
    }

    #[test]
    fn test_start_respects_cooldown() {
        let t = timing(FireMode::SemiAuto);
        let mut fc = FireController::new();
        fc.start_firing(false, false, 0.0, &t);
        assert!(!fc.is_firing());

        let ev = fc.start_firing(false, false, 0.04, &t);
        assert!(ev.shots.is_empty());
        assert_eq!(fc.next_shot_time(), Some(0.1));
        let ev = fc.tick(0.1, &t);
        assert_eq!(ev.shots, vec![0.1]);
        assert!(ev.firing_stopped);
    }

    #[test]
    fn test_semi_auto_release_ends_ability() {
        let t = timing(FireMode::SemiAuto);
        let mut fc = FireController::new();
        let ev = fc.start_firing(false, false, 0.0, &t);
        assert_eq!(ev.shots.len(), 1);
        assert!(ev.firing_stopped);
        let ev = fc.stop_firing(true, &t);
        assert!(ev.end_ability);
    }

    #[test]
    fn test_burst_auto_waits_between_bursts() {
        let t = timing(FireMode::BurstAuto);
        let mut fc = FireController::new();
        fc.start_firing(false, false, 0.0, &t);
        let ev = fc.tick(0.2, &t);
        assert_eq!(ev.shots, vec![0.1, 0.2]);
        assert_eq!(fc.state(), FireState::BurstWaiting);
        assert_eq!(fc.next_shot_time(), Some(0.4));
        let ev = fc.tick(0.4, &t);
        assert_eq!(ev.shots, vec![0.4]);
        assert_eq!(fc.state(), FireState::Firing);
    }

    #[test]
    fn test_burst_stop_finishes_burst() {
        let t = timing(FireMode::BurstAuto);
        let mut fc = FireController::new();
        fc.start_firing(false, false, 0.0, &t);
        let ev = fc.stop_firing(true, &t);
        assert!(!ev.end_ability);
        assert!(fc.is_firing());

        let ev = fc.tick(1.0, &t);
        assert_eq!(ev.shots.len(), 2);
        assert!(ev.firing_stopped && ev.end_ability);
        assert_eq!(fc.state(), FireState::Idle);
    }

    #[test]
    fn test_burst_single_stops_after_one_burst() {
        let t = timing(FireMode::BurstSingle);
        let mut fc = FireController::new();
        fc.start_firing(false, false, 0.0, &t);
        let ev = fc.tick(5.0, &t);
        assert_eq!(ev.shots.len(), 2);
        assert!(ev.firing_stopped);
        assert!(!ev.end_ability);
        assert!(!fc.is_firing());
    }

    #[test]
    fn test_stop_while_idle_only_ends() {
        let t = timing(FireMode::Auto);
        let mut fc = FireController::new();
        let ev = fc.stop_firing(true, &t);
        assert!(ev.end_ability && !ev.firing_stopped);
        assert!(!fc.stop_firing(false, &t).end_ability);
    }
}
