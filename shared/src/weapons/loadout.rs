//! Weapon loadouts
//!
//! A loadout names an attachment per slot plus tuning values per slot. It is the save format
//! for a player's weapon setup: RON when a human edits it, bincode when the server stores it.

use bevy::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::attachments::{AttachmentContext, WeaponAttachmentComponent};
use crate::error::LoadoutError;
use crate::tags::GameplayTag;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeaponLoadout {
    pub name: String,
    /// Slot type -> attachment registry id
    pub slot_attachments: BTreeMap<GameplayTag, String>,
    /// Slot type -> stat tag -> tuning value
    pub slot_tuning: BTreeMap<GameplayTag, BTreeMap<GameplayTag, f32>>,
}

impl WeaponLoadout {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_attachment(mut self, slot_type: GameplayTag, attachment_id: impl Into<String>) -> Self {
        self.slot_attachments.insert(slot_type, attachment_id.into());
        self
    }

    pub fn with_tuning(mut self, slot_type: GameplayTag, stat_tag: GameplayTag, value: f32) -> Self {
        self.slot_tuning.entry(slot_type).or_default().insert(stat_tag, value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.slot_attachments.is_empty()
    }

    pub fn to_ron_string(&self) -> Result<String, LoadoutError> {
        Ok(ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())?)
    }

    pub fn from_ron_str(text: &str) -> Result<Self, LoadoutError> {
        Ok(ron::from_str(text)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, LoadoutError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, LoadoutError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl WeaponAttachmentComponent {
    /// Replace every installed attachment with the loadout's. Installs run in passes so an
    /// attachment whose slot is provided by another one in the loadout waits for it. Returns
    /// true iff every entry installed.
    pub fn apply_loadout(&mut self, loadout: &WeaponLoadout, ctx: &mut AttachmentContext<'_>) -> bool {
        if !self.is_authority() {
            warn!("apply_loadout: only the authority can apply loadouts");
            return false;
        }
        self.clear_all_attachments(ctx);

        let mut pending: Vec<(&GameplayTag, &String)> = Vec::new();
        let mut fail_count = 0;
        for (slot_type, attachment_id) in &loadout.slot_attachments {
            if attachment_id.is_empty() {
                warn!("apply_loadout: skipping empty attachment id for slot {}", slot_type);
                fail_count += 1;
                continue;
            }
            pending.push((slot_type, attachment_id));
        }

        let mut success_count = 0;
        loop {
            let before = pending.len();
            pending.retain(|(slot_type, attachment_id)| {
                if !self.is_slot_available(slot_type) {
                    return true;
                }
                match self.install_attachment(attachment_id, Some((*slot_type).clone()), ctx) {
                    Ok(()) => {
                        success_count += 1;
                        if let Some(tuning) = loadout.slot_tuning.get(*slot_type) {
                            for (stat_tag, value) in tuning {
                                if let Err(e) = self.set_tuning_value(slot_type, stat_tag, *value, ctx) {
                                    warn!("apply_loadout: tuning {} on {} rejected: {}", stat_tag, slot_type, e);
                                }
                            }
                        }
                    }
                    Err(e) => {
                        warn!("apply_loadout: failed to install {} to slot {}: {}", attachment_id, slot_type, e);
                        fail_count += 1;
                    }
                }
                false
            });
            if pending.is_empty() || pending.len() == before {
                break;
            }
        }
        for (slot_type, attachment_id) in &pending {
            warn!("apply_loadout: slot {} never became available for {}", slot_type, attachment_id);
            fail_count += 1;
        }

        info!(
            "apply_loadout '{}': installed {} attachments, {} failed",
            loadout.name, success_count, fail_count
        );
        fail_count == 0
    }

    /// Snapshot the installed attachments and their non-empty tuning.
    pub fn create_loadout_from_current(&self, name: impl Into<String>) -> WeaponLoadout {
        let mut loadout = WeaponLoadout::new(name);
        for instance in self.all_attachments() {
            loadout
                .slot_attachments
                .insert(instance.slot_type.clone(), instance.attachment_id.clone());
            if !instance.tuning_values.is_empty() {
                loadout
                    .slot_tuning
                    .insert(instance.slot_type.clone(), instance.tuning_values.clone());
            }
        }
        loadout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_registry::DataRegistry;
    use crate::tags::{names, tag};
    use crate::weapons::attachments::{AttachmentDefinition, AttachmentSlotDef, TuningParam, WeaponAttachmentsConfig};
    use crate::weapons::stat;
    use std::sync::Arc;

    fn registry() -> DataRegistry<AttachmentDefinition> {
        let mut registry = DataRegistry::new();
        registry.insert(
            AttachmentDefinition::new("barrel_long", tag(names::ATTACHMENT_SLOT_BARREL))
                .with_provided_slot(AttachmentSlotDef::new(tag(names::ATTACHMENT_SLOT_MUZZLE))),
        );
        registry.insert(
            AttachmentDefinition::new("compensator", tag(names::ATTACHMENT_SLOT_MUZZLE)).with_tuning(TuningParam {
                stat_tag: tag(stat::RECOIL_VERTICAL_MAX),
                ..Default::default()
            }),
        );
        registry
    }

    fn component(registry: &DataRegistry<AttachmentDefinition>) -> WeaponAttachmentComponent {
        let mut component = WeaponAttachmentComponent::new(true);
        component.initialize(
            Arc::new(WeaponAttachmentsConfig {
                slots: vec![AttachmentSlotDef::new(tag(names::ATTACHMENT_SLOT_BARREL))],
                max_attachments: 0,
            }),
            &mut AttachmentContext::new(registry),
        );
        component
    }

    fn loadout() -> WeaponLoadout {
        // The muzzle slot sorts before the barrel that provides it.
        WeaponLoadout::new("long range")
            .with_attachment(tag(names::ATTACHMENT_SLOT_MUZZLE), "compensator")
            .with_attachment(tag(names::ATTACHMENT_SLOT_BARREL), "barrel_long")
            .with_tuning(tag(names::ATTACHMENT_SLOT_MUZZLE), tag(stat::RECOIL_VERTICAL_MAX), -0.5)
    }

    #[test]
    fn test_apply_then_export_round_trips() {
        let registry = registry();
        let mut component = component(&registry);
        let mut ctx = AttachmentContext::new(&registry);
        assert!(component.apply_loadout(&loadout(), &mut ctx));
        assert_eq!(component.create_loadout_from_current("long range"), loadout());
    }

    #[test]
    fn test_unknown_attachment_reports_failure() {
        let registry = registry();
        let mut component = component(&registry);
        let mut ctx = AttachmentContext::new(&registry);
        let bad = loadout().with_attachment(tag(names::ATTACHMENT_SLOT_OPTIC), "missing");
        assert!(!component.apply_loadout(&bad, &mut ctx));
        assert_eq!(component.installed_attachment_count(), 2);
    }

    #[test]
    fn test_text_and_binary_formats() {
        let original = loadout();
        let text = original.to_ron_string().unwrap();
        assert_eq!(WeaponLoadout::from_ron_str(&text).unwrap(), original);
        let bytes = original.to_bytes().unwrap();
        assert_eq!(WeaponLoadout::from_bytes(&bytes).unwrap(), original);
        assert!(WeaponLoadout::from_ron_str("(name: ").is_err());
    }
}
