//! Counted tag stacks (ammo, charges, durability...)
//!
//! Replicated as a `FastArray` with a lookup map rebuilt on the receiving side.

use bevy::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::replication::FastArray;
use crate::tags::GameplayTag;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TagStack {
    pub tag: GameplayTag,
    pub count: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TagStackContainer {
    stacks: FastArray<TagStack>,
    #[serde(skip)]
    counts: HashMap<GameplayTag, i32>,
}

impl TagStackContainer {
    /// Add `count` stacks of `tag`. Non-positive counts are ignored.
    pub fn add_stack(&mut self, tag: &GameplayTag, count: i32) {
        if !tag.is_valid() {
            warn!("An invalid tag was passed to add_stack");
            return;
        }
        if count <= 0 {
            return;
        }
        if let Some(index) = self.stacks.position(|s| &s.tag == tag) {
            if let Some(stack) = self.stacks.get_mut(index) {
                stack.count += count;
                self.counts.insert(tag.clone(), stack.count);
            }
            return;
        }
        self.stacks.push(TagStack { tag: tag.clone(), count });
        self.counts.insert(tag.clone(), count);
    }

    /// Remove `count` stacks; the entry disappears when it reaches zero.
    pub fn remove_stack(&mut self, tag: &GameplayTag, count: i32) {
        if !tag.is_valid() {
            warn!("An invalid tag was passed to remove_stack");
            return;
        }
        if count <= 0 {
            return;
        }
        let Some(index) = self.stacks.position(|s| &s.tag == tag) else {
            return;
        };
        let current = self.stacks.get(index).map(|s| s.count).unwrap_or(0);
        if current <= count {
            self.stacks.remove(index);
            self.counts.remove(tag);
        } else if let Some(stack) = self.stacks.get_mut(index) {
            stack.count -= count;
            self.counts.insert(tag.clone(), stack.count);
        }
    }

    pub fn stack_count(&self, tag: &GameplayTag) -> i32 {
        if let Some(count) = self.counts.get(tag) {
            return *count;
        }
        // Freshly deserialized containers have no lookup map yet
        self.stacks
            .iter()
            .find(|s| &s.tag == tag)
            .map(|s| s.count)
            .unwrap_or(0)
    }

    pub fn contains(&self, tag: &GameplayTag) -> bool {
        self.stack_count(tag) > 0
    }

    /// Rebuild the lookup map after a replicated snapshot arrives.
    pub fn rebuild_lookup(&mut self) {
        self.counts = self.stacks.iter().map(|s| (s.tag.clone(), s.count)).collect();
    }

    pub fn iter(&self) -> impl Iterator<Item = &TagStack> {
        self.stacks.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::tag;

    #[test]
    fn test_add_and_remove_stacks() {
        let ammo = tag("Weapon.Ammo.Magazine");
        let mut c = TagStackContainer::default();
        c.add_stack(&ammo, 30);
        c.add_stack(&ammo, 5);
        assert_eq!(c.stack_count(&ammo), 35);
        c.remove_stack(&ammo, 10);
        assert_eq!(c.stack_count(&ammo), 25);
        c.remove_stack(&ammo, 100);
        assert!(!c.contains(&ammo));
        assert_eq!(c.iter().count(), 0);
    }

    #[test]
    fn test_ignores_non_positive_counts() {
        let t = tag("Item.Charges");
        let mut c = TagStackContainer::default();
        c.add_stack(&t, 0);
        c.add_stack(&t, -4);
        assert_eq!(c.stack_count(&t), 0);
    }
}
