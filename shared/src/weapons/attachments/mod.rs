//! Weapon attachments
//!
//! `definition` holds the authored data, `component` the per-weapon installed state.

mod component;
pub mod definition;

pub use component::{compose_stat, AttachmentChangedMessage, AttachmentContext, AttachmentEvent, WeaponAttachmentComponent};
pub use definition::{
    AttachTarget, AttachmentDefinition, AttachmentInstance, AttachmentSlotDef, StatModifier, StatModifierOp, TuningParam,
    WeaponAttachmentsConfig,
};
