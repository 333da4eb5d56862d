//! Error types surfaced by the framework
//!
//! Activation failures are not errors; they travel as tag containers (see `ability::asc`).

use thiserror::Error;

use crate::tags::GameplayTag;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("failed to parse RON: {0}")]
    Parse(#[from] ron::error::SpannedError),
    #[error("failed to write RON: {0}")]
    Serialize(#[from] ron::Error),
    #[error("unknown console variable {0}")]
    UnknownVariable(String),
    #[error("invalid value '{value}' for {name}")]
    InvalidValue { name: String, value: String },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AttachmentError {
    #[error("attachment definition {0} not found in registry")]
    UnknownAttachment(String),
    #[error("slot {0} is not available on this weapon")]
    SlotUnavailable(GameplayTag),
    #[error("weapon already carries the maximum of {0} attachments")]
    MaxAttachmentsReached(usize),
    #[error("{attachment} is incompatible with installed {installed}")]
    Incompatible { attachment: String, installed: String },
    #[error("{0} is missing required attachments")]
    MissingPrerequisites(String),
    #[error("no attachment installed in slot {0}")]
    SlotEmpty(GameplayTag),
    #[error("attachment in slot {0} does not support tuning")]
    TuningNotSupported(GameplayTag),
    #[error("stat {0} is not tunable on this attachment")]
    UnknownTuningParam(GameplayTag),
    #[error("attachment changes are authority only")]
    NotAuthority,
}

#[derive(Error, Debug)]
pub enum LoadoutError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("failed to parse loadout: {0}")]
    Parse(#[from] ron::error::SpannedError),
    #[error("failed to write loadout: {0}")]
    Serialize(#[from] ron::Error),
    #[error("binary loadout error: {0}")]
    Binary(#[from] bincode::Error),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AbilityError {
    #[error("ability spec handle is no longer valid")]
    InvalidHandle,
    #[error("ability must be instanced for this operation")]
    NotInstanced,
    #[error("ability is not active")]
    NotActive,
    #[error("activation group change is blocked")]
    GroupBlocked,
    #[error("exclusive replaceable abilities must stay cancelable")]
    ReplaceableMustBeCancelable,
    #[error("operation requires network authority")]
    NotAuthority,
    #[error("no avatar for montage playback")]
    NoAvatar,
}
