//! Gameplay effects
//!
//! A minimal effect primitive: instant effects rewrite base values, duration and infinite
//! effects contribute modifiers to the current value and grant tags while active.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::ability::definition::ScalableFloat;
use crate::attributes::GameplayAttribute;
use crate::data_registry::RegistryItem;
use crate::tags::GameplayTagContainer;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum EffectDuration {
    #[default]
    Instant,
    Infinite,
    /// Seconds
    HasDuration(f32),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModifierOp {
    Add,
    /// Magnitude is a factor (1.2 = +20%).
    Multiply,
    Override,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EffectModifier {
    pub attribute: GameplayAttribute,
    pub op: ModifierOp,
    pub magnitude: ScalableFloat,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameplayEffect {
    pub id: String,
    pub duration: EffectDuration,
    pub modifiers: Vec<EffectModifier>,
    /// Owned by the target while the effect is active.
    pub granted_tags: GameplayTagContainer,
    /// Describe the effect itself (e.g. `Gameplay.Damage.SelfDestruct`).
    pub asset_tags: GameplayTagContainer,
}

impl RegistryItem for GameplayEffect {
    fn registry_id(&self) -> &str {
        &self.id
    }
}

impl GameplayEffect {
    /// Instant damage of `amount` through the health set's meta attribute.
    pub fn damage(id: impl Into<String>, amount: f32) -> Self {
        Self {
            id: id.into(),
            duration: EffectDuration::Instant,
            modifiers: vec![EffectModifier {
                attribute: GameplayAttribute::Damage,
                op: ModifierOp::Add,
                magnitude: ScalableFloat::new(amount),
            }],
            ..Default::default()
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActiveGameplayEffectHandle(pub u32);

impl ActiveGameplayEffectHandle {
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

/// Who applied an effect and with what.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EffectContext {
    pub instigator: Option<u64>,
    pub causer: Option<u64>,
    /// Ability source level (e.g. weapon level).
    pub source_level: f32,
}

#[derive(Clone, Debug)]
pub struct ActiveGameplayEffect {
    pub handle: ActiveGameplayEffectHandle,
    pub effect: Arc<GameplayEffect>,
    pub level: i32,
    pub context: EffectContext,
    /// `None` for infinite effects.
    pub remaining: Option<f32>,
}

/// Fold modifiers into a value: the last override wins, otherwise
/// `(base + Σadd) × Πmultiply`.
pub fn aggregate(base: f32, modifiers: impl IntoIterator<Item = (ModifierOp, f32)>) -> f32 {
    let mut add = 0.0;
    let mut mul = 1.0;
    let mut overridden = None;
    for (op, magnitude) in modifiers {
        match op {
            ModifierOp::Add => add += magnitude,
            ModifierOp::Multiply => mul *= magnitude,
            ModifierOp::Override => overridden = Some(magnitude),
        }
    }
    overridden.unwrap_or((base + add) * mul)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate() {
        assert_eq!(aggregate(10.0, []), 10.0);
        assert_eq!(aggregate(10.0, [(ModifierOp::Add, 5.0), (ModifierOp::Multiply, 2.0)]), 30.0);
        assert_eq!(
            aggregate(10.0, [(ModifierOp::Override, 1.0), (ModifierOp::Add, 5.0)]),
            1.0
        );
    }

    #[test]
    fn test_damage_effect_ron() {
        let e = GameplayEffect::damage("GE_Damage", 25.0);
        let text = ron::to_string(&e).unwrap();
        let back: GameplayEffect = ron::from_str(&text).unwrap();
        assert_eq!(back, e);
    }
}
