//! Delta-tracked replicated arrays
//!
//! Lightyear replicates whole component values. `FastArray` stamps every entry with a stable
//! replication id and a per-entry change key so the receiving side can turn two snapshots
//! into add / change / remove callbacks, the way delta-serialized lists behave.

use serde::{Deserialize, Serialize};

/// One replicated entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FastArrayEntry<T> {
    pub replication_id: u32,
    pub replication_key: u32,
    pub item: T,
}

/// Ordered list with stable entry ids and dirty tracking.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FastArray<T> {
    entries: Vec<FastArrayEntry<T>>,
    next_id: u32,
    /// Bumped on every structural or item change.
    array_key: u32,
}

impl<T> Default for FastArray<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
            array_key: 0,
        }
    }
}

impl<T> FastArray<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an item and mark it dirty. Returns its replication id.
    pub fn push(&mut self, item: T) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.entries.push(FastArrayEntry {
            replication_id: id,
            replication_key: 1,
            item,
        });
        self.array_key = self.array_key.wrapping_add(1);
        id
    }

    pub fn mark_item_dirty(&mut self, index: usize) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.replication_key = entry.replication_key.wrapping_add(1);
            self.array_key = self.array_key.wrapping_add(1);
        }
    }

    pub fn mark_array_dirty(&mut self) {
        self.array_key = self.array_key.wrapping_add(1);
    }

    pub fn remove(&mut self, index: usize) -> Option<T> {
        if index >= self.entries.len() {
            return None;
        }
        self.array_key = self.array_key.wrapping_add(1);
        Some(self.entries.remove(index).item)
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) {
        let before = self.entries.len();
        self.entries.retain(|e| keep(&e.item));
        if before != self.entries.len() {
            self.mark_array_dirty();
        }
    }

    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            self.entries.clear();
            self.mark_array_dirty();
        }
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.entries.get(index).map(|e| &e.item)
    }

    /// Mutable access; the entry is marked dirty.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.mark_item_dirty(index);
        self.entries.get_mut(index).map(|e| &mut e.item)
    }

    /// Mutable iteration that leaves change keys alone, for receiving-side fix-ups.
    pub fn iter_mut_untracked(&mut self) -> impl Iterator<Item = &mut T> {
        self.entries.iter_mut().map(|e| &mut e.item)
    }

    pub fn position(&self, pred: impl Fn(&T) -> bool) -> Option<usize> {
        self.entries.iter().position(|e| pred(&e.item))
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|e| &e.item)
    }

    pub fn entries(&self) -> &[FastArrayEntry<T>] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn array_key(&self) -> u32 {
        self.array_key
    }
}

/// Callbacks derived from two snapshots of the same array.
#[derive(Clone, Debug, PartialEq)]
pub struct FastArrayDelta<T> {
    /// Entries present before and gone now.
    pub removed: Vec<T>,
    /// Indices into the new snapshot.
    pub added: Vec<usize>,
    /// Indices into the new snapshot whose change key moved.
    pub changed: Vec<usize>,
}

impl<T> Default for FastArrayDelta<T> {
    fn default() -> Self {
        Self {
            removed: Vec::new(),
            added: Vec::new(),
            changed: Vec::new(),
        }
    }
}

impl<T> FastArrayDelta<T> {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty() && self.changed.is_empty()
    }
}

impl<T: Clone> FastArray<T> {
    /// Compute the callbacks a receiver holding `old` must run to reach `self`.
    pub fn delta_from(&self, old: &FastArray<T>) -> FastArrayDelta<T> {
        let mut delta = FastArrayDelta::default();
        if old.array_key == self.array_key && old.entries.len() == self.entries.len() {
            return delta;
        }
        for entry in &old.entries {
            if !self.entries.iter().any(|e| e.replication_id == entry.replication_id) {
                delta.removed.push(entry.item.clone());
            }
        }
        for (index, entry) in self.entries.iter().enumerate() {
            match old.entries.iter().find(|e| e.replication_id == entry.replication_id) {
                None => delta.added.push(index),
                Some(prev) if prev.replication_key != entry.replication_key => delta.changed.push(index),
                Some(_) => {}
            }
        }
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_add_change_remove() {
        let mut server: FastArray<&'static str> = FastArray::new();
        server.push("a");
        server.push("b");
        let client_snapshot = server.clone();

        server.remove(0);
        if let Some(b) = server.get_mut(0) {
            *b = "b2";
        }
        server.push("c");

        let delta = server.delta_from(&client_snapshot);
        assert_eq!(delta.removed, vec!["a"]);
        assert_eq!(delta.changed, vec![0]);
        assert_eq!(delta.added, vec![1]);
    }

    #[test]
    fn test_unchanged_snapshot_is_empty_delta() {
        let mut arr = FastArray::new();
        arr.push(1u8);
        assert!(arr.delta_from(&arr.clone()).is_empty());
    }
}
