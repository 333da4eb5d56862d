//! Ability system
//!
//! Definitions are static data; specs are what an `AbilitySystemComponent` grants; instances
//! carry per-activation state.

pub mod ability_set;
pub mod asc;
pub mod death;
pub mod definition;
pub mod montage;
pub mod relationship;
pub mod spec;
pub mod tasks;

pub use ability_set::{AbilitySet, AbilitySetGrantedHandles, AbilitySetSources};
pub use asc::{
    AbilityNotification, AbilitySimpleFailureMessage, AbilitySystemComponent, ActivationEnv, ActivationResult,
    AvatarInfo, ItemStackSource, NetRole,
};
pub use death::{DeathState, DEATH_ABILITY_ID};
pub use definition::{
    AbilityCost, AbilityDefinition, AbilityKind, ActivationGroup, ActivationPolicy, InstancingPolicy,
    NetExecutionPolicy, ScalableFloat,
};
pub use montage::{AnimInstance, AnimMontage, AnimationHost, RepAnimMontageForMesh, RepAnimMontageInfo, SimAnimInstance};
pub use relationship::{AbilityTagRelationship, AbilityTagRelationshipMapping};
pub use spec::{AbilitySource, AbilitySpec, AbilitySpecHandle, GameplayEventData, InstanceId, PredictionKey};
pub use tasks::{MontageTaskOutcome, PlayMontageTask};
