//! Attribute sets
//!
//! Attributes are named scalars with a base and a current value. Sets are a closed set of
//! variants owned by the ability system; `pre_*` hooks clamp, `post_gameplay_effect_execute`
//! turns meta attributes (damage, healing) into health changes.

use serde::{Deserialize, Serialize};

use crate::tags::{names, tag, GameplayTagContainer};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GameplayAttribute {
    Health,
    MaxHealth,
    /// Meta attribute: pending healing, folded into health.
    Healing,
    /// Meta attribute: pending damage, folded into health.
    Damage,
    BaseDamage,
    BaseHeal,
    MaxWalkSpeed,
    MaxWalkSpeedMultiplier,
}

impl GameplayAttribute {
    pub fn set_class(self) -> AttributeSetClass {
        match self {
            GameplayAttribute::Health
            | GameplayAttribute::MaxHealth
            | GameplayAttribute::Healing
            | GameplayAttribute::Damage => AttributeSetClass::Health,
            GameplayAttribute::BaseDamage | GameplayAttribute::BaseHeal => AttributeSetClass::Combat,
            GameplayAttribute::MaxWalkSpeed | GameplayAttribute::MaxWalkSpeedMultiplier => AttributeSetClass::Movement,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GameplayAttributeData {
    pub base: f32,
    pub current: f32,
}

impl GameplayAttributeData {
    pub const fn new(value: f32) -> Self {
        Self { base: value, current: value }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AttributeSetClass {
    Health,
    Combat,
    Movement,
}

/// Who receives an attribute set's values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttributeReplication {
    Full,
    OwnerOnly,
}

impl AttributeSetClass {
    pub fn replication(self) -> AttributeReplication {
        match self {
            AttributeSetClass::Combat => AttributeReplication::OwnerOnly,
            AttributeSetClass::Health | AttributeSetClass::Movement => AttributeReplication::Full,
        }
    }

    pub fn instantiate(self) -> AttributeSet {
        match self {
            AttributeSetClass::Health => AttributeSet::Health(HealthSet::default()),
            AttributeSetClass::Combat => AttributeSet::Combat(CombatSet::default()),
            AttributeSetClass::Movement => AttributeSet::Movement(MovementSet::default()),
        }
    }
}

/// Context handed to the effect-execution hooks.
#[derive(Clone, Debug)]
pub struct EffectModCallbackData {
    pub attribute: GameplayAttribute,
    pub magnitude: f32,
    pub instigator: Option<u64>,
    pub causer: Option<u64>,
    pub effect_tags: GameplayTagContainer,
    /// Tags owned by the target at execution time.
    pub target_tags: GameplayTagContainer,
}

/// Side effects raised by attribute hooks, drained by the owning ability system.
#[derive(Clone, Debug, PartialEq)]
pub enum AttributeEvent {
    HealthChanged {
        instigator: Option<u64>,
        magnitude: f32,
        old_value: f32,
        new_value: f32,
    },
    MaxHealthChanged {
        old_value: f32,
        new_value: f32,
    },
    OutOfHealth {
        instigator: Option<u64>,
        causer: Option<u64>,
        magnitude: f32,
    },
    /// Broadcast as `Yc.Damage.Message`.
    Damaged {
        instigator: Option<u64>,
        magnitude: f32,
    },
}

// =============================================================================
// HEALTH
// =============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthSet {
    pub health: GameplayAttributeData,
    pub max_health: GameplayAttributeData,
    pub healing: GameplayAttributeData,
    pub damage: GameplayAttributeData,
    #[serde(skip)]
    out_of_health: bool,
    #[serde(skip)]
    health_before_change: f32,
    #[serde(skip)]
    max_health_before_change: f32,
}

impl Default for HealthSet {
    fn default() -> Self {
        Self {
            health: GameplayAttributeData::new(100.0),
            max_health: GameplayAttributeData::new(100.0),
            healing: GameplayAttributeData::new(0.0),
            damage: GameplayAttributeData::new(0.0),
            out_of_health: false,
            health_before_change: 0.0,
            max_health_before_change: 0.0,
        }
    }
}

impl HealthSet {
    pub fn health(&self) -> f32 {
        self.health.current
    }

    pub fn max_health(&self) -> f32 {
        self.max_health.current
    }

    pub fn is_out_of_health(&self) -> bool {
        self.out_of_health
    }

    fn set_health(&mut self, value: f32) {
        self.health.base = value;
        self.health.current = value;
    }

    fn clamp(&self, attribute: GameplayAttribute, value: &mut f32) {
        match attribute {
            GameplayAttribute::Health => *value = value.clamp(0.0, self.max_health()),
            GameplayAttribute::MaxHealth => *value = value.max(1.0),
            _ => {}
        }
    }

    fn pre_gameplay_effect_execute(&mut self, data: &mut EffectModCallbackData) -> bool {
        if data.attribute == GameplayAttribute::Damage && data.magnitude > 0.0 {
            let self_destruct = data.effect_tags.has_tag_exact(&tag("Gameplay.Damage.SelfDestruct"));
            if data.target_tags.has_tag(&tag(names::GAMEPLAY_DAMAGE_IMMUNITY)) && !self_destruct {
                data.magnitude = 0.0;
                return false;
            }
        }
        self.health_before_change = self.health();
        self.max_health_before_change = self.max_health();
        true
    }

    fn post_gameplay_effect_execute(&mut self, data: &EffectModCallbackData) -> Vec<AttributeEvent> {
        let mut events = Vec::new();
        let max = self.max_health();
        match data.attribute {
            GameplayAttribute::Damage => {
                if data.magnitude > 0.0 {
                    events.push(AttributeEvent::Damaged {
                        instigator: data.instigator,
                        magnitude: data.magnitude,
                    });
                }
                let value = (self.health() - self.damage.current).clamp(0.0, max);
                self.set_health(value);
                self.damage = GameplayAttributeData::new(0.0);
            }
            GameplayAttribute::Healing => {
                let value = (self.health() + self.healing.current).clamp(0.0, max);
                self.set_health(value);
                self.healing = GameplayAttributeData::new(0.0);
            }
            GameplayAttribute::Health => {
                let value = self.health().clamp(0.0, max);
                self.set_health(value);
            }
            GameplayAttribute::MaxHealth => events.push(AttributeEvent::MaxHealthChanged {
                old_value: self.max_health_before_change,
                new_value: self.max_health(),
            }),
            _ => {}
        }

        if self.health() != self.health_before_change {
            events.push(AttributeEvent::HealthChanged {
                instigator: data.instigator,
                magnitude: data.magnitude,
                old_value: self.health_before_change,
                new_value: self.health(),
            });
        }
        if self.health() <= 0.0 && !self.out_of_health {
            events.push(AttributeEvent::OutOfHealth {
                instigator: data.instigator,
                causer: data.causer,
                magnitude: data.magnitude,
            });
        }
        self.out_of_health = self.health() <= 0.0;
        events
    }

    fn post_attribute_change(&mut self, attribute: GameplayAttribute, new_value: f32) {
        if attribute == GameplayAttribute::MaxHealth && self.health() > new_value {
            self.set_health(new_value);
        }
        if self.out_of_health && self.health() > 0.0 {
            self.out_of_health = false;
        }
    }

    /// Mirror a replicated value on a client; raises the same events the server saw.
    pub fn on_rep_health(&mut self, new_health: f32, new_max: f32) -> Vec<AttributeEvent> {
        let mut events = Vec::new();
        let old = self.health();
        if new_max != self.max_health() {
            events.push(AttributeEvent::MaxHealthChanged {
                old_value: self.max_health(),
                new_value: new_max,
            });
            self.max_health = GameplayAttributeData::new(new_max);
        }
        self.set_health(new_health);
        if new_health != old {
            events.push(AttributeEvent::HealthChanged {
                instigator: None,
                magnitude: new_health - old,
                old_value: old,
                new_value: new_health,
            });
        }
        if !self.out_of_health && new_health <= 0.0 {
            events.push(AttributeEvent::OutOfHealth {
                instigator: None,
                causer: None,
                magnitude: new_health - old,
            });
        }
        self.out_of_health = new_health <= 0.0;
        events
    }
}

// =============================================================================
// COMBAT / MOVEMENT
// =============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CombatSet {
    pub base_damage: GameplayAttributeData,
    pub base_heal: GameplayAttributeData,
}

impl Default for CombatSet {
    fn default() -> Self {
        Self {
            base_damage: GameplayAttributeData::new(0.0),
            base_heal: GameplayAttributeData::new(0.0),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MovementSet {
    pub max_walk_speed: GameplayAttributeData,
    pub max_walk_speed_multiplier: GameplayAttributeData,
}

impl Default for MovementSet {
    fn default() -> Self {
        Self {
            max_walk_speed: GameplayAttributeData::new(500.0),
            max_walk_speed_multiplier: GameplayAttributeData::new(1.0),
        }
    }
}

impl MovementSet {
    pub fn effective_walk_speed(&self) -> f32 {
        self.max_walk_speed.current * self.max_walk_speed_multiplier.current
    }
}

// =============================================================================
// SET
// =============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AttributeSet {
    Health(HealthSet),
    Combat(CombatSet),
    Movement(MovementSet),
}

impl AttributeSet {
    pub fn class(&self) -> AttributeSetClass {
        match self {
            AttributeSet::Health(_) => AttributeSetClass::Health,
            AttributeSet::Combat(_) => AttributeSetClass::Combat,
            AttributeSet::Movement(_) => AttributeSetClass::Movement,
        }
    }

    pub fn get(&self, attribute: GameplayAttribute) -> Option<GameplayAttributeData> {
        match (self, attribute) {
            (AttributeSet::Health(s), GameplayAttribute::Health) => Some(s.health),
            (AttributeSet::Health(s), GameplayAttribute::MaxHealth) => Some(s.max_health),
            (AttributeSet::Health(s), GameplayAttribute::Healing) => Some(s.healing),
            (AttributeSet::Health(s), GameplayAttribute::Damage) => Some(s.damage),
            (AttributeSet::Combat(s), GameplayAttribute::BaseDamage) => Some(s.base_damage),
            (AttributeSet::Combat(s), GameplayAttribute::BaseHeal) => Some(s.base_heal),
            (AttributeSet::Movement(s), GameplayAttribute::MaxWalkSpeed) => Some(s.max_walk_speed),
            (AttributeSet::Movement(s), GameplayAttribute::MaxWalkSpeedMultiplier) => Some(s.max_walk_speed_multiplier),
            _ => None,
        }
    }

    fn data_mut(&mut self, attribute: GameplayAttribute) -> Option<&mut GameplayAttributeData> {
        match (self, attribute) {
            (AttributeSet::Health(s), GameplayAttribute::Health) => Some(&mut s.health),
            (AttributeSet::Health(s), GameplayAttribute::MaxHealth) => Some(&mut s.max_health),
            (AttributeSet::Health(s), GameplayAttribute::Healing) => Some(&mut s.healing),
            (AttributeSet::Health(s), GameplayAttribute::Damage) => Some(&mut s.damage),
            (AttributeSet::Combat(s), GameplayAttribute::BaseDamage) => Some(&mut s.base_damage),
            (AttributeSet::Combat(s), GameplayAttribute::BaseHeal) => Some(&mut s.base_heal),
            (AttributeSet::Movement(s), GameplayAttribute::MaxWalkSpeed) => Some(&mut s.max_walk_speed),
            (AttributeSet::Movement(s), GameplayAttribute::MaxWalkSpeedMultiplier) => {
                Some(&mut s.max_walk_speed_multiplier)
            }
            _ => None,
        }
    }

    /// Clamp hook for both base and current changes.
    pub fn pre_attribute_change(&self, attribute: GameplayAttribute, value: &mut f32) {
        match self {
            AttributeSet::Health(s) => s.clamp(attribute, value),
            AttributeSet::Movement(_) => match attribute {
                GameplayAttribute::MaxWalkSpeed => *value = value.clamp(50.0, 2000.0),
                GameplayAttribute::MaxWalkSpeedMultiplier => *value = value.clamp(0.1, 5.0),
                _ => {}
            },
            AttributeSet::Combat(_) => {}
        }
    }

    /// Clamp and store both values. Returns `(old_current, new_current)`.
    pub fn set_base_and_current(&mut self, attribute: GameplayAttribute, base: f32, current: f32) -> Option<(f32, f32)> {
        let mut base = base;
        let mut current = current;
        self.pre_attribute_change(attribute, &mut base);
        self.pre_attribute_change(attribute, &mut current);
        let data = self.data_mut(attribute)?;
        let old = data.current;
        data.base = base;
        data.current = current;
        if let AttributeSet::Health(s) = self {
            s.post_attribute_change(attribute, current);
        }
        Some((old, current))
    }

    pub fn pre_gameplay_effect_execute(&mut self, data: &mut EffectModCallbackData) -> bool {
        match self {
            AttributeSet::Health(s) => s.pre_gameplay_effect_execute(data),
            _ => true,
        }
    }

    pub fn post_gameplay_effect_execute(&mut self, data: &EffectModCallbackData) -> Vec<AttributeEvent> {
        match self {
            AttributeSet::Health(s) => s.post_gameplay_effect_execute(data),
            _ => Vec::new(),
        }
    }

    pub fn as_health(&self) -> Option<&HealthSet> {
        match self {
            AttributeSet::Health(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_health_mut(&mut self) -> Option<&mut HealthSet> {
        match self {
            AttributeSet::Health(s) => Some(s),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn damage(magnitude: f32) -> EffectModCallbackData {
        EffectModCallbackData {
            attribute: GameplayAttribute::Damage,
            magnitude,
            instigator: Some(7),
            causer: None,
            effect_tags: GameplayTagContainer::new(),
            target_tags: GameplayTagContainer::new(),
        }
    }

    fn run_damage(set: &mut AttributeSet, magnitude: f32) -> Vec<AttributeEvent> {
        let mut data = damage(magnitude);
        if !set.pre_gameplay_effect_execute(&mut data) {
            return Vec::new();
        }
        let base = set.get(GameplayAttribute::Damage).map(|d| d.base).unwrap_or(0.0) + data.magnitude;
        set.set_base_and_current(GameplayAttribute::Damage, base, base);
        set.post_gameplay_effect_execute(&data)
    }

    #[test]
    fn test_damage_folds_into_health_and_signals_out_of_health_once() {
        let mut set = AttributeSetClass::Health.instantiate();
        let events = run_damage(&mut set, 60.0);
        assert_eq!(set.as_health().unwrap().health(), 40.0);
        assert!(events.iter().any(|e| matches!(e, AttributeEvent::Damaged { .. })));

        let events = run_damage(&mut set, 60.0);
        assert_eq!(set.as_health().unwrap().health(), 0.0);
        assert!(events.iter().any(|e| matches!(e, AttributeEvent::OutOfHealth { .. })));

        let events = run_damage(&mut set, 10.0);
        assert!(!events.iter().any(|e| matches!(e, AttributeEvent::OutOfHealth { .. })));
    }

    #[test]
    fn test_damage_immunity() {
        let mut set = AttributeSetClass::Health.instantiate();
        let mut data = damage(50.0);
        data.target_tags.add_tag(tag(names::GAMEPLAY_DAMAGE_IMMUNITY));
        assert!(!set.pre_gameplay_effect_execute(&mut data));
        assert_eq!(data.magnitude, 0.0);
    }

    #[test]
    fn test_max_health_clamps_health() {
        let mut set = AttributeSetClass::Health.instantiate();
        set.set_base_and_current(GameplayAttribute::MaxHealth, 50.0, 50.0);
        assert_eq!(set.as_health().unwrap().health(), 50.0);
        set.set_base_and_current(GameplayAttribute::MaxHealth, -3.0, -3.0);
        assert_eq!(set.get(GameplayAttribute::MaxHealth).unwrap().current, 1.0);
    }

    #[test]
    fn test_movement_clamp_and_replication_policy() {
        let mut set = AttributeSetClass::Movement.instantiate();
        set.set_base_and_current(GameplayAttribute::MaxWalkSpeed, 9000.0, 9000.0);
        assert_eq!(set.get(GameplayAttribute::MaxWalkSpeed).unwrap().current, 2000.0);
        assert_eq!(AttributeSetClass::Combat.replication(), AttributeReplication::OwnerOnly);
        assert_eq!(AttributeSetClass::Movement.replication(), AttributeReplication::Full);
    }
}
