//! Static ability policy
//!
//! An `AbilityDefinition` is immutable per ability class and shared through `Arc`. Runtime state
//! lives in `AbilitySpec` / `AbilityInstance`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::data_registry::RegistryItem;
use crate::tags::{GameplayTag, GameplayTagContainer};

/// How an ability is activated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActivationPolicy {
    /// Activate once when the input is pressed.
    #[default]
    OnInputTriggered,
    /// Activate every tick while the input is held and the ability is not running.
    WhileInputActive,
    /// Activate when the avatar is assigned.
    OnSpawn,
}

/// Exclusivity bucket an ability occupies while it runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivationGroup {
    /// Runs alongside everything.
    #[default]
    Independent,
    /// Cancelled by any other exclusive ability.
    ExclusiveReplaceable,
    /// Blocks every other exclusive ability.
    ExclusiveBlocking,
}

impl ActivationGroup {
    pub const COUNT: usize = 3;

    pub fn index(self) -> usize {
        match self {
            ActivationGroup::Independent => 0,
            ActivationGroup::ExclusiveReplaceable => 1,
            ActivationGroup::ExclusiveBlocking => 2,
        }
    }

    pub fn is_exclusive(self) -> bool {
        self != ActivationGroup::Independent
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstancingPolicy {
    /// Runs on the shared definition; one activation at a time.
    NonInstanced,
    #[default]
    InstancedPerActor,
    InstancedPerExecution,
}

impl InstancingPolicy {
    pub fn is_instanced(self) -> bool {
        self != InstancingPolicy::NonInstanced
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetExecutionPolicy {
    /// Client activates immediately and the server follows.
    #[default]
    LocalPredicted,
    LocalOnly,
    ServerInitiated,
    ServerOnly,
}

impl NetExecutionPolicy {
    pub fn is_local_execution(self) -> bool {
        matches!(self, NetExecutionPolicy::LocalPredicted | NetExecutionPolicy::LocalOnly)
    }

    pub fn is_server_execution(self) -> bool {
        matches!(self, NetExecutionPolicy::ServerOnly | NetExecutionPolicy::ServerInitiated)
    }
}

/// A float that scales with ability level.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScalableFloat {
    pub value: f32,
    #[serde(default)]
    pub per_level: f32,
}

impl ScalableFloat {
    pub const fn new(value: f32) -> Self {
        Self { value, per_level: 0.0 }
    }

    pub fn value_at_level(&self, level: i32) -> f32 {
        self.value + self.per_level * (level.max(1) - 1) as f32
    }
}

impl Default for ScalableFloat {
    fn default() -> Self {
        Self::new(1.0)
    }
}

/// Extra activation cost beyond cooldowns.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AbilityCost {
    /// Consume stacks of `tag` on the item the ability was granted from.
    ItemTagStack {
        quantity: ScalableFloat,
        tag: GameplayTag,
        failure_tag: GameplayTag,
        #[serde(default)]
        only_apply_cost_on_hit: bool,
    },
}

impl AbilityCost {
    pub fn only_apply_cost_on_hit(&self) -> bool {
        match self {
            AbilityCost::ItemTagStack { only_apply_cost_on_hit, .. } => *only_apply_cost_on_hit,
        }
    }
}

/// Behaviour dispatch. Each variant is driven by the system that owns that behaviour.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum AbilityKind {
    /// Runs until ended or cancelled.
    #[default]
    Generic,
    /// Commits and ends during activation.
    Instant,
    /// Aim down sights while held; ends on release.
    Aim,
    /// Holds its owned tags (crouch, sprint) while the input is held; ends on release.
    Hold,
    /// Hit-scan weapon fire driven by `weapons::firing`.
    HitScanWeapon,
    /// Cancels everything that does not survive death and blocks further activation.
    Death {
        #[serde(default = "default_true")]
        auto_start_death: bool,
    },
    /// Plays a montage on a mesh and ends when it completes.
    PlayMontage {
        mesh: String,
        montage: String,
        #[serde(default = "default_rate")]
        rate: f32,
        #[serde(default)]
        event_tags: GameplayTagContainer,
    },
}

impl AbilityKind {
    pub fn ends_on_release(&self) -> bool {
        matches!(self, AbilityKind::Aim | AbilityKind::Hold)
    }
}

fn default_true() -> bool {
    true
}

fn default_rate() -> f32 {
    1.0
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbilityDefinition {
    /// Class path; stable across the network.
    pub id: String,
    pub kind: AbilityKind,
    pub ability_tags: GameplayTagContainer,
    pub cancel_abilities_with_tag: GameplayTagContainer,
    pub block_abilities_with_tag: GameplayTagContainer,
    pub activation_owned_tags: GameplayTagContainer,
    pub activation_required_tags: GameplayTagContainer,
    pub activation_blocked_tags: GameplayTagContainer,
    pub source_required_tags: GameplayTagContainer,
    pub source_blocked_tags: GameplayTagContainer,
    /// Gameplay events that activate this ability.
    pub trigger_tags: Vec<GameplayTag>,
    pub activation_policy: ActivationPolicy,
    pub activation_group: ActivationGroup,
    pub instancing_policy: InstancingPolicy,
    pub net_execution_policy: NetExecutionPolicy,
    pub retrigger_instanced_ability: bool,
    /// Seconds; zero means no cooldown.
    pub cooldown: f32,
    pub additional_costs: Vec<AbilityCost>,
    pub failure_tag_to_user_facing_messages: BTreeMap<GameplayTag, String>,
}

impl Default for AbilityDefinition {
    fn default() -> Self {
        Self {
            id: String::new(),
            kind: AbilityKind::Generic,
            ability_tags: GameplayTagContainer::new(),
            cancel_abilities_with_tag: GameplayTagContainer::new(),
            block_abilities_with_tag: GameplayTagContainer::new(),
            activation_owned_tags: GameplayTagContainer::new(),
            activation_required_tags: GameplayTagContainer::new(),
            activation_blocked_tags: GameplayTagContainer::new(),
            source_required_tags: GameplayTagContainer::new(),
            source_blocked_tags: GameplayTagContainer::new(),
            trigger_tags: Vec::new(),
            activation_policy: ActivationPolicy::OnInputTriggered,
            activation_group: ActivationGroup::Independent,
            instancing_policy: InstancingPolicy::InstancedPerActor,
            net_execution_policy: NetExecutionPolicy::LocalPredicted,
            retrigger_instanced_ability: false,
            cooldown: 0.0,
            additional_costs: Vec::new(),
            failure_tag_to_user_facing_messages: BTreeMap::new(),
        }
    }
}

impl RegistryItem for AbilityDefinition {
    fn registry_id(&self) -> &str {
        &self.id
    }
}

impl AbilityDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_kind(mut self, kind: AbilityKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_group(mut self, group: ActivationGroup) -> Self {
        self.activation_group = group;
        self
    }

    pub fn with_policy(mut self, policy: ActivationPolicy) -> Self {
        self.activation_policy = policy;
        self
    }

    pub fn with_net_execution(mut self, policy: NetExecutionPolicy) -> Self {
        self.net_execution_policy = policy;
        self
    }

    pub fn with_instancing(mut self, policy: InstancingPolicy) -> Self {
        self.instancing_policy = policy;
        self
    }

    pub fn with_ability_tags(mut self, tags: GameplayTagContainer) -> Self {
        self.ability_tags = tags;
        self
    }

    pub fn with_trigger(mut self, tag: GameplayTag) -> Self {
        self.trigger_tags.push(tag);
        self
    }

    pub fn with_cost(mut self, cost: AbilityCost) -> Self {
        self.additional_costs.push(cost);
        self
    }

    pub fn with_failure_message(mut self, tag: GameplayTag, text: impl Into<String>) -> Self {
        self.failure_tag_to_user_facing_messages.insert(tag, text.into());
        self
    }

    /// Whether this ability's failures should be forwarded to the owning client.
    pub fn supports_network_failure(&self) -> bool {
        self.net_execution_policy != NetExecutionPolicy::LocalOnly
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalable_float_levels() {
        let f = ScalableFloat { value: 2.0, per_level: 0.5 };
        assert_eq!(f.value_at_level(1), 2.0);
        assert_eq!(f.value_at_level(3), 3.0);
        assert_eq!(f.value_at_level(0), 2.0);
    }

    #[test]
    fn test_definition_from_ron() {
        let text = r#"(
            id: "GA_Weapon_Fire_Rifle",
            kind: HitScanWeapon,
            activation_policy: WhileInputActive,
            activation_group: ExclusiveReplaceable,
            additional_costs: [ItemTagStack(
                quantity: (value: 1.0),
                tag: "Weapon.Ammo.Magazine",
                failure_tag: "Ability.ActivateFail.Cost",
            )],
        )"#;
        let def: AbilityDefinition = ron::from_str(text).unwrap();
        assert_eq!(def.kind, AbilityKind::HitScanWeapon);
        assert_eq!(def.activation_group, ActivationGroup::ExclusiveReplaceable);
        assert_eq!(def.instancing_policy, InstancingPolicy::InstancedPerActor);
        assert_eq!(def.additional_costs.len(), 1);
    }
}
