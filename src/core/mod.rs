//! CRDT primitives backing the reference replicated document.
//!
//! - [`OpId`] - Unique operation identifiers using Lamport timestamps
//! - [`StateVector`] - Per-peer change counters for causal delivery
//! - [`Sequence`] - RGA ordered sequence with tombstones
//! - [`LwwRegister`] - Last-writer-wins register for single values
//! - [`mark`] - Mark values and anchored mark operations

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod mark;

pub type PeerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub counter: u64,
    pub peer: PeerId,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateVector {
    peers: BTreeMap<PeerId, u64>,
}

impl StateVector {
    pub fn new() -> Self {
        Self {
            peers: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, peer: PeerId) -> Option<u64> {
        self.peers.get(&peer).copied()
    }

    pub fn set(&mut self, peer: PeerId, counter: u64) {
        self.peers.insert(peer, counter);
    }

    pub fn iter(&self) -> impl Iterator<Item = (PeerId, u64)> + '_ {
        self.peers.iter().map(|(peer, counter)| (*peer, *counter))
    }

    /// True when every entry of `other` has been reached by `self`.
    pub fn dominates(&self, other: &StateVector) -> bool {
        other
            .iter()
            .all(|(peer, counter)| self.get(peer).unwrap_or(0) >= counter)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SequenceError {
    #[error("element {0:?} already integrated")]
    Duplicate(OpId),
    #[error("anchor element {0:?} is unknown")]
    MissingAnchor(OpId),
    #[error("element {0:?} is unknown")]
    MissingTarget(OpId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element<T> {
    pub id: OpId,
    pub value: T,
    pub after: Option<OpId>,
    pub deleted: bool,
}

/// Replicated growable array. Elements are never removed, only tombstoned,
/// so anchors stay resolvable for late operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sequence<T> {
    elements: Vec<Element<T>>,
    index: BTreeMap<OpId, usize>,
}

impl<T> Default for Sequence<T> {
    fn default() -> Self {
        Self {
            elements: Vec::new(),
            index: BTreeMap::new(),
        }
    }
}

impl<T> Sequence<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Integrates `value` directly after `after` (or at the head), skipping
    /// concurrent siblings with a greater id. Returns the element position.
    pub fn insert(
        &mut self,
        after: Option<OpId>,
        id: OpId,
        value: T,
    ) -> Result<usize, SequenceError> {
        if self.index.contains_key(&id) {
            return Err(SequenceError::Duplicate(id));
        }
        let mut position = match after {
            None => 0,
            Some(anchor) => {
                self.index
                    .get(&anchor)
                    .copied()
                    .ok_or(SequenceError::MissingAnchor(anchor))?
                    + 1
            }
        };
        while position < self.elements.len() && self.elements[position].id > id {
            position += 1;
        }
        self.elements.insert(
            position,
            Element {
                id,
                value,
                after,
                deleted: false,
            },
        );
        self.rebuild_index(position);
        Ok(position)
    }

    /// Tombstones `target`. Returns whether it was visible before the call.
    pub fn delete(&mut self, target: OpId) -> Result<bool, SequenceError> {
        let position = self
            .index
            .get(&target)
            .copied()
            .ok_or(SequenceError::MissingTarget(target))?;
        let element = &mut self.elements[position];
        let was_visible = !element.deleted;
        element.deleted = true;
        Ok(was_visible)
    }

    pub fn get(&self, id: &OpId) -> Option<&Element<T>> {
        self.index.get(id).and_then(|idx| self.elements.get(*idx))
    }

    pub fn get_mut(&mut self, id: &OpId) -> Option<&mut Element<T>> {
        let idx = self.index.get(id).copied()?;
        self.elements.get_mut(idx)
    }

    /// Position of `id` in the full element order, tombstones included.
    pub fn position(&self, id: &OpId) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Index of `id` among visible elements, if it is visible.
    pub fn visible_index(&self, id: &OpId) -> Option<usize> {
        let position = self.position(id)?;
        if self.elements[position].deleted {
            return None;
        }
        Some(
            self.elements[..position]
                .iter()
                .filter(|elem| !elem.deleted)
                .count(),
        )
    }

    pub fn visible_id(&self, visible_index: usize) -> Option<OpId> {
        self.iter_visible()
            .nth(visible_index)
            .map(|elem| elem.id)
    }

    pub fn iter_visible(&self) -> impl Iterator<Item = &Element<T>> {
        self.elements.iter().filter(|elem| !elem.deleted)
    }

    pub fn iter_all(&self) -> impl Iterator<Item = &Element<T>> {
        self.elements.iter()
    }

    pub fn len_visible(&self) -> usize {
        self.elements.iter().filter(|elem| !elem.deleted).count()
    }

    pub fn len_all(&self) -> usize {
        self.elements.len()
    }

    pub fn element_ids(&self) -> Vec<OpId> {
        self.elements.iter().map(|elem| elem.id).collect()
    }

    fn rebuild_index(&mut self, from: usize) {
        for (idx, elem) in self.elements.iter().enumerate().skip(from) {
            self.index.insert(elem.id, idx);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwwRegister<T> {
    value: T,
    op_id: OpId,
}

impl<T: Clone> LwwRegister<T> {
    pub fn new(value: T, op_id: OpId) -> Self {
        Self { value, op_id }
    }

    /// Returns true when the write won.
    pub fn set(&mut self, value: T, op_id: OpId) -> bool {
        if op_id >= self.op_id {
            self.value = value;
            self.op_id = op_id;
            true
        } else {
            false
        }
    }

    /// Returns a clone of the current value. Consider using `get_ref()` to avoid allocation.
    pub fn get(&self) -> T {
        self.value.clone()
    }

    /// Returns a reference to the current value (zero-cost).
    #[inline]
    pub fn get_ref(&self) -> &T {
        &self.value
    }

    pub fn op_id(&self) -> OpId {
        self.op_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(counter: u64, peer: PeerId) -> OpId {
        OpId { counter, peer }
    }

    fn values(seq: &Sequence<char>) -> String {
        seq.iter_visible().map(|elem| elem.value).collect()
    }

    #[test]
    fn test_insert_chain_preserves_order() {
        let mut seq = Sequence::new();
        seq.insert(None, id(1, 1), 'a').unwrap();
        seq.insert(Some(id(1, 1)), id(2, 1), 'b').unwrap();
        seq.insert(Some(id(2, 1)), id(3, 1), 'c').unwrap();
        assert_eq!(values(&seq), "abc");
    }

    #[test]
    fn test_concurrent_siblings_order_by_descending_id() {
        let mut left = Sequence::new();
        let mut right = Sequence::new();
        let base = id(1, 1);
        left.insert(None, base, 'x').unwrap();
        right.insert(None, base, 'x').unwrap();

        left.insert(Some(base), id(2, 1), 'a').unwrap();
        left.insert(Some(base), id(2, 2), 'b').unwrap();
        right.insert(Some(base), id(2, 2), 'b').unwrap();
        right.insert(Some(base), id(2, 1), 'a').unwrap();

        assert_eq!(values(&left), values(&right));
        assert_eq!(values(&left), "xba");
    }

    #[test]
    fn test_descendants_stay_with_their_sibling() {
        let mut seq = Sequence::new();
        let base = id(1, 1);
        seq.insert(None, base, 'x').unwrap();
        seq.insert(Some(base), id(2, 2), 'b').unwrap();
        seq.insert(Some(id(2, 2)), id(3, 2), 'c').unwrap();
        // Concurrent with 'b', lower priority.
        seq.insert(Some(base), id(2, 1), 'a').unwrap();
        assert_eq!(values(&seq), "xbca");
    }

    #[test]
    fn test_delete_tombstones_and_reports_visibility() {
        let mut seq = Sequence::new();
        seq.insert(None, id(1, 1), 'a').unwrap();
        seq.insert(Some(id(1, 1)), id(2, 1), 'b').unwrap();
        assert_eq!(seq.delete(id(1, 1)), Ok(true));
        assert_eq!(seq.delete(id(1, 1)), Ok(false));
        assert_eq!(values(&seq), "b");
        assert_eq!(seq.len_all(), 2);
        assert_eq!(seq.visible_index(&id(2, 1)), Some(0));
        assert_eq!(seq.visible_index(&id(1, 1)), None);
    }

    #[test]
    fn test_missing_anchor_and_duplicate_are_errors() {
        let mut seq = Sequence::new();
        seq.insert(None, id(1, 1), 'a').unwrap();
        assert_eq!(
            seq.insert(Some(id(9, 9)), id(2, 1), 'b'),
            Err(SequenceError::MissingAnchor(id(9, 9)))
        );
        assert_eq!(
            seq.insert(None, id(1, 1), 'a'),
            Err(SequenceError::Duplicate(id(1, 1)))
        );
    }

    #[test]
    fn test_lww_register_keeps_latest() {
        let mut reg = LwwRegister::new("a", id(1, 1));
        assert!(reg.set("b", id(3, 1)));
        assert!(!reg.set("c", id(2, 2)));
        assert_eq!(reg.get(), "b");
        assert_eq!(reg.op_id(), id(3, 1));
    }

    #[test]
    fn test_state_vector_dominates() {
        let mut a = StateVector::new();
        a.set(1, 3);
        a.set(2, 1);
        let mut b = StateVector::new();
        b.set(1, 2);
        assert!(a.dominates(&b));
        b.set(3, 1);
        assert!(!a.dominates(&b));
    }
}
