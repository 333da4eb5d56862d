//! Hierarchical gameplay tags
//!
//! A tag is a dotted path like `Ability.ActivateFail.TagsBlocked`. `a.b.c` matches `a`, `a.b`
//! and `a.b.c`. Containers keep an expanded parent set next to the explicit tags so
//! `has_tag` is a single ordered-set lookup.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

// =============================================================================
// TAG
// =============================================================================

/// Interned hierarchical identifier. Cloning only bumps a refcount.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct GameplayTag(Arc<str>);

impl GameplayTag {
    pub fn new(name: &str) -> Self {
        Self(Arc::from(name.trim()))
    }

    /// The empty tag. Never matches anything.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
    }

    /// True if `self == parent` or `self` is a descendant of `parent`.
    pub fn matches_tag(&self, parent: &GameplayTag) -> bool {
        if !self.is_valid() || !parent.is_valid() {
            return false;
        }
        let me = self.as_str();
        let other = parent.as_str();
        me == other || (me.len() > other.len() && me.starts_with(other) && me.as_bytes()[other.len()] == b'.')
    }

    pub fn matches_tag_exact(&self, other: &GameplayTag) -> bool {
        self.is_valid() && self == other
    }

    /// Direct parent (`a.b.c` -> `a.b`), `None` for a root tag.
    pub fn parent(&self) -> Option<GameplayTag> {
        self.as_str().rfind('.').map(|idx| GameplayTag::new(&self.as_str()[..idx]))
    }

    /// This tag followed by every ancestor up to the root.
    pub fn self_and_parents(&self) -> Vec<GameplayTag> {
        let mut out = Vec::new();
        if !self.is_valid() {
            return out;
        }
        out.push(self.clone());
        let mut current = self.parent();
        while let Some(tag) = current {
            current = tag.parent();
            out.push(tag);
        }
        out
    }

    /// Replace a leading tag prefix, e.g. `Gameplay.Character.Zone.Head` ->
    /// `Weapon.Stat.Damage.Zone.Head`. Returns `None` when `from` does not match.
    pub fn replace_prefix(&self, from: &GameplayTag, to: &GameplayTag) -> Option<GameplayTag> {
        if !self.matches_tag(from) {
            return None;
        }
        let rest = &self.as_str()[from.as_str().len()..];
        Some(GameplayTag::new(&format!("{}{}", to.as_str(), rest)))
    }
}

impl fmt::Debug for GameplayTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Display for GameplayTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for GameplayTag {
    fn from(value: &str) -> Self {
        GameplayTag::new(value)
    }
}

impl Serialize for GameplayTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for GameplayTag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(GameplayTag::new(&name))
    }
}

// =============================================================================
// CONTAINER
// =============================================================================

/// Set of tags supporting hierarchical queries.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<GameplayTag>", into = "Vec<GameplayTag>")]
pub struct GameplayTagContainer {
    explicit: BTreeSet<GameplayTag>,
    /// Explicit tags plus all their ancestors.
    expanded: BTreeSet<GameplayTag>,
}

impl GameplayTagContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tag(tag: GameplayTag) -> Self {
        let mut c = Self::new();
        c.add_tag(tag);
        c
    }

    pub fn add_tag(&mut self, tag: GameplayTag) {
        if !tag.is_valid() {
            return;
        }
        for t in tag.self_and_parents() {
            self.expanded.insert(t);
        }
        self.explicit.insert(tag);
    }

    pub fn remove_tag(&mut self, tag: &GameplayTag) -> bool {
        let removed = self.explicit.remove(tag);
        if removed {
            self.rebuild_expanded();
        }
        removed
    }

    pub fn append(&mut self, other: &GameplayTagContainer) {
        for tag in other.iter() {
            self.add_tag(tag.clone());
        }
    }

    pub fn remove_tags(&mut self, other: &GameplayTagContainer) {
        let before = self.explicit.len();
        self.explicit.retain(|t| !other.explicit.contains(t));
        if self.explicit.len() != before {
            self.rebuild_expanded();
        }
    }

    pub fn reset(&mut self) {
        self.explicit.clear();
        self.expanded.clear();
    }

    fn rebuild_expanded(&mut self) {
        self.expanded.clear();
        for tag in &self.explicit {
            for t in tag.self_and_parents() {
                self.expanded.insert(t);
            }
        }
    }

    /// True if any tag in the container matches `tag` (equal or descendant).
    pub fn has_tag(&self, tag: &GameplayTag) -> bool {
        tag.is_valid() && self.expanded.contains(tag)
    }

    pub fn has_tag_exact(&self, tag: &GameplayTag) -> bool {
        self.explicit.contains(tag)
    }

    /// An empty query never matches.
    pub fn has_any(&self, other: &GameplayTagContainer) -> bool {
        other.explicit.iter().any(|t| self.has_tag(t))
    }

    pub fn has_any_exact(&self, other: &GameplayTagContainer) -> bool {
        other.explicit.iter().any(|t| self.has_tag_exact(t))
    }

    /// An empty query always matches.
    pub fn has_all(&self, other: &GameplayTagContainer) -> bool {
        other.explicit.iter().all(|t| self.has_tag(t))
    }

    pub fn has_all_exact(&self, other: &GameplayTagContainer) -> bool {
        other.explicit.iter().all(|t| self.has_tag_exact(t))
    }

    /// Tags of this container that match `category`.
    pub fn filter(&self, category: &GameplayTag) -> GameplayTagContainer {
        self.explicit
            .iter()
            .filter(|t| t.matches_tag(category))
            .cloned()
            .collect()
    }

    /// First explicit tag matching `category`, in sorted order.
    pub fn first_matching(&self, category: &GameplayTag) -> Option<&GameplayTag> {
        self.explicit.iter().find(|t| t.matches_tag(category))
    }

    pub fn iter(&self) -> impl Iterator<Item = &GameplayTag> {
        self.explicit.iter()
    }

    pub fn len(&self) -> usize {
        self.explicit.len()
    }

    pub fn is_empty(&self) -> bool {
        self.explicit.is_empty()
    }

    pub fn to_string_simple(&self) -> String {
        self.explicit
            .iter()
            .map(|t| t.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl fmt::Debug for GameplayTagContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.explicit.iter()).finish()
    }
}

impl From<Vec<GameplayTag>> for GameplayTagContainer {
    fn from(tags: Vec<GameplayTag>) -> Self {
        tags.into_iter().collect()
    }
}

impl From<GameplayTagContainer> for Vec<GameplayTag> {
    fn from(container: GameplayTagContainer) -> Self {
        container.explicit.into_iter().collect()
    }
}

impl FromIterator<GameplayTag> for GameplayTagContainer {
    fn from_iter<I: IntoIterator<Item = GameplayTag>>(iter: I) -> Self {
        let mut c = GameplayTagContainer::new();
        for tag in iter {
            c.add_tag(tag);
        }
        c
    }
}

impl<'a> IntoIterator for &'a GameplayTagContainer {
    type Item = &'a GameplayTag;
    type IntoIter = std::collections::btree_set::Iter<'a, GameplayTag>;

    fn into_iter(self) -> Self::IntoIter {
        self.explicit.iter()
    }
}

/// Build a container from tag names.
pub fn tag_container(names: &[&str]) -> GameplayTagContainer {
    names.iter().map(|n| GameplayTag::new(n)).collect()
}

// =============================================================================
// COUNTED CONTAINER
// =============================================================================

/// Reference-counted tags as owned by an ability system: loose tags, tags granted by
/// active effects and activation-owned tags all add and remove counts here.
#[derive(Clone, Debug, Default)]
pub struct GameplayTagCountContainer {
    explicit_counts: BTreeMap<GameplayTag, i32>,
    expanded_counts: BTreeMap<GameplayTag, i32>,
    explicit_tags: GameplayTagContainer,
}

impl GameplayTagCountContainer {
    /// Adjust the count of `tag` by `delta`. Returns true when the tag's explicit
    /// presence changed (added or fully removed).
    pub fn update_tag_count(&mut self, tag: &GameplayTag, delta: i32) -> bool {
        if !tag.is_valid() || delta == 0 {
            return false;
        }
        let old = self.explicit_counts.get(tag).copied().unwrap_or(0);
        let new = (old + delta).max(0);
        let applied = new - old;
        if applied == 0 {
            return false;
        }
        if new == 0 {
            self.explicit_counts.remove(tag);
            self.explicit_tags.remove_tag(tag);
        } else {
            self.explicit_counts.insert(tag.clone(), new);
            if old == 0 {
                self.explicit_tags.add_tag(tag.clone());
            }
        }
        for t in tag.self_and_parents() {
            let entry = self.expanded_counts.entry(t.clone()).or_insert(0);
            *entry += applied;
            if *entry <= 0 {
                self.expanded_counts.remove(&t);
            }
        }
        (old == 0) != (new == 0)
    }

    pub fn update_container(&mut self, tags: &GameplayTagContainer, delta: i32) {
        for tag in tags.iter() {
            self.update_tag_count(tag, delta);
        }
    }

    /// Force the explicit count of `tag` to `count`.
    pub fn set_tag_count(&mut self, tag: &GameplayTag, count: i32) {
        let current = self.tag_count(tag);
        self.update_tag_count(tag, count.max(0) - current);
    }

    pub fn tag_count(&self, tag: &GameplayTag) -> i32 {
        self.explicit_counts.get(tag).copied().unwrap_or(0)
    }

    pub fn has_matching_tag(&self, tag: &GameplayTag) -> bool {
        self.expanded_counts.get(tag).copied().unwrap_or(0) > 0
    }

    pub fn has_any_matching(&self, tags: &GameplayTagContainer) -> bool {
        tags.iter().any(|t| self.has_matching_tag(t))
    }

    pub fn has_all_matching(&self, tags: &GameplayTagContainer) -> bool {
        tags.iter().all(|t| self.has_matching_tag(t))
    }

    pub fn explicit_tags(&self) -> &GameplayTagContainer {
        &self.explicit_tags
    }
}

// =============================================================================
// WELL-KNOWN TAG NAMES
// =============================================================================

/// Tag names that form the public surface of the framework.
pub mod names {
    pub const ABILITY_ACTIVATE_FAIL_IS_DEAD: &str = "Ability.ActivateFail.IsDead";
    pub const ABILITY_ACTIVATE_FAIL_COOLDOWN: &str = "Ability.ActivateFail.Cooldown";
    pub const ABILITY_ACTIVATE_FAIL_COST: &str = "Ability.ActivateFail.Cost";
    pub const ABILITY_ACTIVATE_FAIL_TAGS_BLOCKED: &str = "Ability.ActivateFail.TagsBlocked";
    pub const ABILITY_ACTIVATE_FAIL_TAGS_MISSING: &str = "Ability.ActivateFail.TagsMissing";
    pub const ABILITY_ACTIVATE_FAIL_NETWORKING: &str = "Ability.ActivateFail.Networking";
    pub const ABILITY_ACTIVATE_FAIL_ACTIVATION_GROUP: &str = "Ability.ActivateFail.ActivationGroup";

    pub const ABILITY_BEHAVIOR_SURVIVES_DEATH: &str = "Ability.Behavior.SurvivesDeath";
    pub const ABILITY_INPUT_BLOCKED: &str = "Gameplay.AbilityInputBlocked";
    pub const ABILITY_INTERACTION_ACTIVATE: &str = "Ability.Interaction.Activate";
    pub const ABILITY_INTERACTION_UPDATE_INTERACTIONS: &str = "Ability.Interaction.UpdateInteractions";
    pub const ABILITY_SIMPLE_FAILURE_MESSAGE: &str = "Ability.UserFacingSimpleActivateFail.Message";
    pub const ABILITY_WEAPON_NO_FIRING: &str = "Ability.Weapon.NoFiring";

    pub const GAMEPLAY_EVENT_DEATH: &str = "GameplayEvent.Death";
    pub const GAMEPLAY_EVENT_INPUT_PRESSED: &str = "GameplayEvent.Input.Pressed";
    pub const GAMEPLAY_EVENT_INPUT_RELEASED: &str = "GameplayEvent.Input.Released";

    pub const STATUS_CROUCHING: &str = "Status.Crouching";
    pub const STATUS_DEATH: &str = "Status.Death";
    pub const STATUS_DEATH_DYING: &str = "Status.Death.Dying";
    pub const STATUS_DEATH_DEAD: &str = "Status.Death.Dead";

    pub const GAMEPLAY_ZONE: &str = "Gameplay.Zone";
    pub const GAMEPLAY_CHARACTER_ZONE: &str = "Gameplay.Character.Zone";
    pub const GAMEPLAY_CHARACTER_ZONE_HEAD: &str = "Gameplay.Character.Zone.Head";
    pub const GAMEPLAY_CHARACTER_ZONE_CHEST: &str = "Gameplay.Character.Zone.Chest";
    pub const GAMEPLAY_CHARACTER_ZONE_LEGS: &str = "Gameplay.Character.Zone.Legs";
    pub const GAMEPLAY_DAMAGE_IMMUNITY: &str = "Gameplay.DamageImmunity";

    pub const INVENTORY_MESSAGE_STACK_CHANGED: &str = "Yc.Inventory.Message.StackChanged";
    pub const QUICKBAR_MESSAGE_ACTIVE_INDEX_CHANGED: &str = "Yc.QuickBar.Message.ActiveIndexChanged";
    pub const QUICKBAR_MESSAGE_SLOTS_CHANGED: &str = "Yc.QuickBar.Message.SlotsChanged";
    pub const WEAPON_MESSAGE_STATS_CHANGED: &str = "Yc.Weapon.Message.StatsChanged";
    pub const WEAPON_MESSAGE_ATTACHMENT_INSTALLED: &str = "Yc.Weapon.Message.AttachmentInstalled";
    pub const WEAPON_MESSAGE_ATTACHMENT_UNINSTALLED: &str = "Yc.Weapon.Message.AttachmentUninstalled";
    pub const DAMAGE_MESSAGE: &str = "Yc.Damage.Message";
    pub const ELIMINATION_MESSAGE: &str = "Yc.Elimination.Message";

    pub const INPUT_TAG_WEAPON_FIRE: &str = "InputTag.Weapon.Fire";
    pub const INPUT_TAG_WEAPON_ADS: &str = "InputTag.Weapon.ADS";
    pub const INPUT_TAG_WEAPON_RELOAD: &str = "InputTag.Weapon.Reload";
    pub const INPUT_TAG_CROUCH: &str = "InputTag.Crouch";
    pub const INPUT_TAG_EMOTE: &str = "InputTag.Emote";

    pub const ATTACHMENT_SLOT_BARREL: &str = "Attachment.Slot.Barrel";
    pub const ATTACHMENT_SLOT_MUZZLE: &str = "Attachment.Slot.Muzzle";
    pub const ATTACHMENT_SLOT_OPTIC: &str = "Attachment.Slot.Optic";
    pub const ATTACHMENT_SLOT_UNDERBARREL: &str = "Attachment.Slot.Underbarrel";
    pub const ATTACHMENT_SLOT_MAGAZINE: &str = "Attachment.Slot.Magazine";
    pub const ATTACHMENT_SLOT_STOCK: &str = "Attachment.Slot.Stock";
    pub const ATTACHMENT_SLOT_LASER: &str = "Attachment.Slot.Laser";
}

/// Shorthand for a well-known tag.
pub fn tag(name: &str) -> GameplayTag {
    GameplayTag::new(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_parent_and_self() {
        let t = tag("Ability.ActivateFail.TagsBlocked");
        assert!(t.matches_tag(&tag("Ability")));
        assert!(t.matches_tag(&tag("Ability.ActivateFail")));
        assert!(t.matches_tag(&t));
        assert!(!t.matches_tag(&tag("Ability.Activate")));
        assert!(!tag("Ability").matches_tag(&t));
        assert!(!GameplayTag::none().matches_tag(&GameplayTag::none()));
    }

    #[test]
    fn test_container_hierarchy_queries() {
        let c = tag_container(&["Status.Death.Dying", "Weapon.Type.Rifle"]);
        assert!(c.has_tag(&tag("Status.Death")));
        assert!(!c.has_tag_exact(&tag("Status.Death")));
        assert!(c.has_all(&tag_container(&["Status", "Weapon.Type"])));
        assert!(!c.has_any(&GameplayTagContainer::new()));
        assert!(c.has_all(&GameplayTagContainer::new()));
    }

    #[test]
    fn test_remove_rebuilds_parents() {
        let mut c = tag_container(&["A.B.C", "A.X"]);
        c.remove_tag(&tag("A.B.C"));
        assert!(!c.has_tag(&tag("A.B")));
        assert!(c.has_tag(&tag("A")));
    }

    #[test]
    fn test_count_container_presence_changes() {
        let mut counts = GameplayTagCountContainer::default();
        let t = tag("Gameplay.AbilityInputBlocked");
        assert!(counts.update_tag_count(&t, 1));
        assert!(!counts.update_tag_count(&t, 1));
        assert!(counts.has_matching_tag(&tag("Gameplay")));
        assert!(!counts.update_tag_count(&t, -1));
        assert!(counts.update_tag_count(&t, -1));
        assert!(!counts.has_matching_tag(&tag("Gameplay")));
        // Never goes negative
        assert!(!counts.update_tag_count(&t, -3));
        assert_eq!(counts.tag_count(&t), 0);
    }

    #[test]
    fn test_replace_prefix() {
        let zone = tag("Gameplay.Character.Zone.Head");
        let stat = zone
            .replace_prefix(&tag("Gameplay.Character.Zone"), &tag("Weapon.Stat.Damage.Zone"))
            .unwrap();
        assert_eq!(stat.as_str(), "Weapon.Stat.Damage.Zone.Head");
        assert!(tag("Other.Head").replace_prefix(&tag("Gameplay"), &tag("X")).is_none());
    }

    #[test]
    fn test_container_serde_keeps_hierarchy() {
        let c = tag_container(&["A.B"]);
        let text = ron::to_string(&c).unwrap();
        let back: GameplayTagContainer = ron::from_str(&text).unwrap();
        assert!(back.has_tag(&tag("A")));
        assert_eq!(back, c);
    }
}
