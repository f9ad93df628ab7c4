//! Reference replicated backend.
//!
//! A [`ReplicaDoc`] stores the document as one flat RGA sequence of block
//! markers and characters. Block kinds live in last-writer-wins registers on
//! the markers; marks are anchored interval operations resolved per
//! character. Local edits become a [`Change`] to broadcast, and every change
//! applied, local or remote, is described to the editor as a [`Delivery`]:
//! the patches in visible-index space plus the snapshots around them.

pub mod translate;

use crate::core::mark::{Anchor, Mark, MarkAction, MarkKind, MarkOp, MarkOpSet, MarkSet};
use crate::core::{LwwRegister, OpId, PeerId, Sequence, SequenceError, StateVector};
use crate::doc::mark_ops::group_runs;
use crate::doc::step::Token;
use crate::doc::{Block, BlockKind, Doc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

pub use translate::{PatchTranslator, TranslateError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaConfig {
    pub peer: PeerId,
    /// Early remote changes held back until their dependencies arrive.
    pub max_pending_changes: usize,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            peer: 1,
            max_pending_changes: 10_000,
        }
    }
}

impl ReplicaConfig {
    pub fn for_peer(peer: PeerId) -> Self {
        Self {
            peer,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplicaError {
    #[error("range {start}..{end} out of bounds for length {len}")]
    InvalidRange { start: usize, end: usize, len: usize },
    #[error("element at index {0} is not a block marker")]
    NotAMarker(usize),
    #[error(transparent)]
    Sequence(#[from] SequenceError),
    #[error("change {seq} from peer {peer} rejected: {reason}")]
    Malformed {
        peer: PeerId,
        seq: u64,
        reason: String,
    },
    #[error("pending change buffer full ({capacity} changes)")]
    PendingOverflow { capacity: usize },
}

/// Visible element of the flat sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "elem", rename_all = "snake_case")]
pub enum FlatElem {
    Marker(BlockKind),
    Char {
        ch: char,
        #[serde(default, skip_serializing_if = "MarkSet::is_empty")]
        marks: MarkSet,
    },
}

impl FlatElem {
    pub fn is_marker(&self) -> bool {
        matches!(self, FlatElem::Marker(_))
    }
}

/// Value carried by an insert operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ItemValue {
    Marker { kind: BlockKind },
    Char { ch: char },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ReplicaOp {
    Insert {
        id: OpId,
        after: Option<OpId>,
        item: ItemValue,
    },
    Delete {
        id: OpId,
        target: OpId,
    },
    Mark(MarkOp),
    SetBlock {
        id: OpId,
        target: OpId,
        kind: BlockKind,
    },
}

impl ReplicaOp {
    pub fn id(&self) -> OpId {
        match self {
            ReplicaOp::Insert { id, .. }
            | ReplicaOp::Delete { id, .. }
            | ReplicaOp::SetBlock { id, .. } => *id,
            ReplicaOp::Mark(op) => op.id,
        }
    }
}

/// Unit of replication: every op one local edit produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub peer: PeerId,
    pub seq: u64,
    /// Changes that must be applied before this one.
    pub deps: StateVector,
    pub ops: Vec<ReplicaOp>,
}

/// Local edit in visible-index space.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum LocalChange {
    Splice {
        index: usize,
        delete: usize,
        insert: Vec<FlatElem>,
    },
    Mark {
        start: usize,
        end: usize,
        mark: Mark,
    },
    Unmark {
        start: usize,
        end: usize,
        kind: MarkKind,
    },
    SetBlock {
        index: usize,
        kind: BlockKind,
    },
}

/// What changed, in visible-index space of the sequence as each patch
/// finds it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "patch", rename_all = "snake_case")]
pub enum Patch {
    Insert { index: usize, elems: Vec<FlatElem> },
    Delete { index: usize, length: usize },
    Mark { start: usize, end: usize, mark: Mark },
    Unmark { start: usize, end: usize, kind: MarkKind },
    SetBlock { index: usize, kind: BlockKind },
}

/// Materialized visible sequence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSnapshot {
    pub elems: Vec<FlatElem>,
}

impl ReplicaSnapshot {
    pub fn from_doc(doc: &Doc) -> Self {
        let elems = doc
            .to_tokens()
            .into_iter()
            .filter_map(|token| match token {
                Token::Open(kind) => Some(FlatElem::Marker(kind)),
                Token::Char { ch, marks } => Some(FlatElem::Char { ch, marks }),
                Token::Close => None,
            })
            .collect();
        Self { elems }
    }

    pub fn len(&self) -> usize {
        self.elems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    /// Projects the sequence onto a tree. Characters before the first
    /// marker form a paragraph.
    pub fn to_doc(&self) -> Doc {
        let mut blocks = Vec::new();
        let mut current: Option<(BlockKind, Vec<(char, MarkSet)>)> = None;
        for elem in &self.elems {
            match elem {
                FlatElem::Marker(kind) => {
                    if let Some((kind, chars)) = current.take() {
                        blocks.push(Block::new(kind, group_runs(chars)));
                    }
                    current = Some((kind.clone(), Vec::new()));
                }
                FlatElem::Char { ch, marks } => current
                    .get_or_insert_with(|| (BlockKind::Paragraph, Vec::new()))
                    .1
                    .push((*ch, marks.clone())),
            }
        }
        if let Some((kind, chars)) = current {
            blocks.push(Block::new(kind, group_runs(chars)));
        }
        Doc::new(blocks)
    }

    /// Block texts joined by newlines.
    pub fn text(&self) -> String {
        self.to_doc().text_content()
    }
}

/// One applied change as the editor sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub peer: PeerId,
    pub seq: u64,
    pub patches: Vec<Patch>,
    pub before: ReplicaSnapshot,
    pub after: ReplicaSnapshot,
}

/// Result of a local edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    /// The change to broadcast, `None` when the edit produced no ops.
    pub change: Option<Change>,
    pub delivery: Delivery,
}

#[derive(Debug, Clone)]
enum Item {
    Marker(LwwRegister<BlockKind>),
    Char(char),
}

#[derive(Debug, Clone)]
pub struct ReplicaDoc {
    config: ReplicaConfig,
    items: Sequence<Item>,
    marks: MarkOpSet,
    clock: u64,
    local_seq: u64,
    seen: StateVector,
    pending: BTreeMap<(PeerId, u64), Change>,
    log: Vec<Change>,
}

impl ReplicaDoc {
    pub fn new(config: ReplicaConfig) -> Self {
        Self {
            config,
            items: Sequence::new(),
            marks: MarkOpSet::new(),
            clock: 0,
            local_seq: 0,
            seen: StateVector::new(),
            pending: BTreeMap::new(),
            log: Vec::new(),
        }
    }

    pub fn peer(&self) -> PeerId {
        self.config.peer
    }

    pub fn state_vector(&self) -> &StateVector {
        &self.seen
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn len(&self) -> usize {
        self.items.len_visible()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> ReplicaSnapshot {
        let resolved = self.marks.resolve(&self.items);
        let elems = self
            .items
            .iter_all()
            .zip(resolved)
            .filter(|(elem, _)| !elem.deleted)
            .map(|(elem, marks)| match &elem.value {
                Item::Marker(kind) => FlatElem::Marker(kind.get()),
                Item::Char(ch) => FlatElem::Char { ch: *ch, marks },
            })
            .collect();
        ReplicaSnapshot { elems }
    }

    /// Changes a peer at `since` has not seen, in application order.
    pub fn changes_since(&self, since: &StateVector) -> Vec<Change> {
        self.log
            .iter()
            .filter(|change| change.seq > since.get(change.peer).unwrap_or(0))
            .cloned()
            .collect()
    }

    /// Applies a local edit. Either every change applies or none does.
    pub fn apply_local_change(&mut self, changes: &[LocalChange]) -> Result<Committed, ReplicaError> {
        let checkpoint = self.clone();
        let before = self.snapshot();
        let mut ops = Vec::new();
        let mut patches = Vec::new();
        for change in changes {
            if let Err(err) = self.integrate_local(change, &mut ops, &mut patches) {
                *self = checkpoint;
                return Err(err);
            }
        }

        let peer = self.config.peer;
        let change = if ops.is_empty() {
            None
        } else {
            self.local_seq += 1;
            let change = Change {
                peer,
                seq: self.local_seq,
                deps: self.seen.clone(),
                ops,
            };
            self.seen.set(peer, self.local_seq);
            self.log.push(change.clone());
            Some(change)
        };
        debug!(
            peer,
            seq = self.local_seq,
            patches = patches.len(),
            "applied local change"
        );
        Ok(Committed {
            change,
            delivery: Delivery {
                peer,
                seq: self.local_seq,
                patches,
                before,
                after: self.snapshot(),
            },
        })
    }

    /// Applies a change from another replica, together with any buffered
    /// changes it unblocks. Early changes are buffered and yield nothing.
    pub fn apply_remote(&mut self, change: Change) -> Result<Vec<Delivery>, ReplicaError> {
        let key = (change.peer, change.seq);
        if change.seq <= self.seen.get(change.peer).unwrap_or(0) || self.pending.contains_key(&key) {
            debug!(peer = change.peer, seq = change.seq, "ignoring duplicate change");
            return Ok(Vec::new());
        }
        if !self.is_ready(&change) {
            if self.pending.len() >= self.config.max_pending_changes {
                return Err(ReplicaError::PendingOverflow {
                    capacity: self.config.max_pending_changes,
                });
            }
            debug!(peer = change.peer, seq = change.seq, "buffering early change");
            self.pending.insert(key, change);
            return Ok(Vec::new());
        }

        let mut deliveries = vec![self.integrate_remote(change)?];
        self.drain_pending(&mut deliveries);
        Ok(deliveries)
    }

    fn is_ready(&self, change: &Change) -> bool {
        change.seq == self.seen.get(change.peer).unwrap_or(0) + 1 && self.seen.dominates(&change.deps)
    }

    fn drain_pending(&mut self, deliveries: &mut Vec<Delivery>) {
        loop {
            let ready = self
                .pending
                .iter()
                .find(|(_, change)| self.is_ready(change))
                .map(|(key, _)| *key);
            let Some(key) = ready else {
                break;
            };
            let Some(change) = self.pending.remove(&key) else {
                break;
            };
            match self.integrate_remote(change) {
                Ok(delivery) => deliveries.push(delivery),
                Err(err) => warn!(error = %err, "dropping buffered change"),
            }
        }
    }

    fn integrate_remote(&mut self, change: Change) -> Result<Delivery, ReplicaError> {
        let checkpoint = self.clone();
        let before = self.snapshot();
        let mut patches = Vec::new();
        for op in &change.ops {
            if let Err(err) = self.apply_op(op, &mut patches) {
                *self = checkpoint;
                return Err(ReplicaError::Malformed {
                    peer: change.peer,
                    seq: change.seq,
                    reason: err.to_string(),
                });
            }
        }
        self.seen.set(change.peer, change.seq);
        debug!(
            peer = change.peer,
            seq = change.seq,
            ops = change.ops.len(),
            "applied remote change"
        );
        let delivery = Delivery {
            peer: change.peer,
            seq: change.seq,
            patches,
            before,
            after: self.snapshot(),
        };
        self.log.push(change);
        Ok(delivery)
    }

    fn next_id(&mut self) -> OpId {
        self.clock += 1;
        OpId {
            counter: self.clock,
            peer: self.config.peer,
        }
    }

    fn push_op(
        &mut self,
        op: ReplicaOp,
        ops: &mut Vec<ReplicaOp>,
        patches: &mut Vec<Patch>,
    ) -> Result<(), ReplicaError> {
        self.apply_op(&op, patches)?;
        ops.push(op);
        Ok(())
    }

    fn visible_ids(&self, start: usize, end: usize) -> Result<Vec<OpId>, ReplicaError> {
        let len = self.len();
        if start > end || end > len {
            return Err(ReplicaError::InvalidRange { start, end, len });
        }
        Ok(self
            .items
            .iter_visible()
            .skip(start)
            .take(end - start)
            .map(|elem| elem.id)
            .collect())
    }

    fn char_ids(&self, start: usize, end: usize) -> Result<Vec<OpId>, ReplicaError> {
        Ok(self
            .visible_ids(start, end)?
            .into_iter()
            .filter(|id| matches!(self.items.get(id).map(|elem| &elem.value), Some(Item::Char(_))))
            .collect())
    }

    fn integrate_local(
        &mut self,
        change: &LocalChange,
        ops: &mut Vec<ReplicaOp>,
        patches: &mut Vec<Patch>,
    ) -> Result<(), ReplicaError> {
        match change {
            LocalChange::Splice {
                index,
                delete,
                insert,
            } => {
                for target in self.visible_ids(*index, index + delete)? {
                    let id = self.next_id();
                    self.push_op(ReplicaOp::Delete { id, target }, ops, patches)?;
                }

                let mut after = match index.checked_sub(1) {
                    Some(prev) => Some(self.items.visible_id(prev).ok_or(ReplicaError::InvalidRange {
                        start: *index,
                        end: *index,
                        len: self.len(),
                    })?),
                    None => None,
                };
                let mut inserted = Vec::new();
                for elem in insert {
                    let id = self.next_id();
                    let item = match elem {
                        FlatElem::Marker(kind) => ItemValue::Marker { kind: kind.clone() },
                        FlatElem::Char { ch, marks } => {
                            inserted.push((id, marks.clone()));
                            ItemValue::Char { ch: *ch }
                        }
                    };
                    self.push_op(ReplicaOp::Insert { id, after, item }, ops, patches)?;
                    after = Some(id);
                }
                self.fix_up_marks(&inserted, ops, patches)
            }
            LocalChange::Mark { start, end, mark } => {
                self.mark_range(*start, *end, MarkAction::Add(mark.clone()), ops, patches)
            }
            LocalChange::Unmark { start, end, kind } => {
                self.mark_range(*start, *end, MarkAction::Remove(kind.clone()), ops, patches)
            }
            LocalChange::SetBlock { index, kind } => {
                let target = self
                    .items
                    .visible_id(*index)
                    .ok_or(ReplicaError::InvalidRange {
                        start: *index,
                        end: index + 1,
                        len: self.len(),
                    })?;
                if !matches!(self.items.get(&target).map(|elem| &elem.value), Some(Item::Marker(_))) {
                    return Err(ReplicaError::NotAMarker(*index));
                }
                let id = self.next_id();
                self.push_op(
                    ReplicaOp::SetBlock {
                        id,
                        target,
                        kind: kind.clone(),
                    },
                    ops,
                    patches,
                )
            }
        }
    }

    fn mark_range(
        &mut self,
        start: usize,
        end: usize,
        action: MarkAction,
        ops: &mut Vec<ReplicaOp>,
        patches: &mut Vec<Patch>,
    ) -> Result<(), ReplicaError> {
        let chars = self.char_ids(start, end)?;
        let (Some(first), Some(last)) = (chars.first(), chars.last()) else {
            return Ok(());
        };
        let op = MarkOp {
            id: self.next_id(),
            start: Anchor::before(*first),
            end: Anchor::after(*last),
            action,
        };
        self.push_op(ReplicaOp::Mark(op), ops, patches)
    }

    /// Emits mark ops so inserted characters resolve to the marks they were
    /// inserted with, rather than whatever ranges they landed in.
    fn fix_up_marks(
        &mut self,
        inserted: &[(OpId, MarkSet)],
        ops: &mut Vec<ReplicaOp>,
        patches: &mut Vec<Patch>,
    ) -> Result<(), ReplicaError> {
        let resolved: Vec<MarkSet> = inserted
            .iter()
            .map(|(id, _)| {
                self.items
                    .position(id)
                    .map(|position| self.marks.resolve_at(&self.items, position))
                    .unwrap_or_default()
            })
            .collect();
        let kinds: BTreeSet<MarkKind> = inserted
            .iter()
            .flat_map(|(_, marks)| marks.iter())
            .chain(resolved.iter().flat_map(|marks| marks.iter()))
            .map(|mark| mark.kind.clone())
            .collect();

        for kind in kinds {
            let mut run: Option<(OpId, OpId, MarkAction)> = None;
            let mut actions = Vec::new();
            for ((id, wanted), current) in inserted.iter().zip(&resolved) {
                let action = match (wanted.get(&kind), current.get(&kind)) {
                    (Some(want), have) if have != Some(want) => Some(MarkAction::Add(want.clone())),
                    (None, Some(_)) => Some(MarkAction::Remove(kind.clone())),
                    _ => None,
                };
                let extends = matches!(
                    (&run, &action),
                    (Some((_, _, current)), Some(action)) if current == action
                );
                if extends {
                    if let Some((_, last, _)) = run.as_mut() {
                        *last = *id;
                    }
                } else {
                    actions.extend(run.take());
                    run = action.map(|action| (*id, *id, action));
                }
            }
            actions.extend(run);

            for (first, last, action) in actions {
                let op = MarkOp {
                    id: self.next_id(),
                    start: Anchor::before(first),
                    end: Anchor::after(last),
                    action,
                };
                self.push_op(ReplicaOp::Mark(op), ops, patches)?;
            }
        }
        Ok(())
    }

    fn observe(&mut self, id: OpId) {
        self.clock = self.clock.max(id.counter);
    }

    fn apply_op(&mut self, op: &ReplicaOp, patches: &mut Vec<Patch>) -> Result<(), ReplicaError> {
        self.observe(op.id());
        match op {
            ReplicaOp::Insert { id, after, item } => {
                let (value, flat) = match item {
                    ItemValue::Marker { kind } => (
                        Item::Marker(LwwRegister::new(kind.clone(), *id)),
                        FlatElem::Marker(kind.clone()),
                    ),
                    ItemValue::Char { ch } => (Item::Char(*ch), FlatElem::Char { ch: *ch, marks: MarkSet::new() }),
                };
                let position = self.items.insert(*after, *id, value)?;
                let flat = match flat {
                    FlatElem::Char { ch, .. } => FlatElem::Char {
                        ch,
                        marks: self.marks.resolve_at(&self.items, position),
                    },
                    marker => marker,
                };
                let index = self.items.visible_index(id).unwrap_or_default();
                match patches.last_mut() {
                    Some(Patch::Insert { index: start, elems }) if *start + elems.len() == index => {
                        elems.push(flat)
                    }
                    _ => patches.push(Patch::Insert {
                        index,
                        elems: vec![flat],
                    }),
                }
            }
            ReplicaOp::Delete { target, .. } => {
                let index = self.items.visible_index(target);
                self.items.delete(*target)?;
                if let Some(index) = index {
                    match patches.last_mut() {
                        Some(Patch::Delete { index: start, length }) if *start == index => *length += 1,
                        Some(Patch::Delete { index: start, length }) if *start == index + 1 => {
                            *start = index;
                            *length += 1;
                        }
                        _ => patches.push(Patch::Delete { index, length: 1 }),
                    }
                }
            }
            ReplicaOp::Mark(mark_op) => {
                let before = self.visible_marks();
                if !self.marks.insert(mark_op.clone()) {
                    return Ok(());
                }
                let after = self.visible_marks();
                diff_marks(&before, &after, patches);
            }
            ReplicaOp::SetBlock { id, target, kind } => {
                let index = self.items.visible_index(target);
                let element = self
                    .items
                    .get_mut(target)
                    .ok_or(SequenceError::MissingTarget(*target))?;
                let Item::Marker(register) = &mut element.value else {
                    return Err(ReplicaError::NotAMarker(index.unwrap_or_default()));
                };
                if register.set(kind.clone(), *id)
                    && let Some(index) = index
                {
                    patches.push(Patch::SetBlock {
                        index,
                        kind: kind.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Marks of every visible element, `None` for markers.
    fn visible_marks(&self) -> Vec<Option<MarkSet>> {
        let resolved = self.marks.resolve(&self.items);
        self.items
            .iter_all()
            .zip(resolved)
            .filter(|(elem, _)| !elem.deleted)
            .map(|(elem, marks)| matches!(elem.value, Item::Char(_)).then_some(marks))
            .collect()
    }
}

/// Describes the per-character mark differences as mark and unmark
/// patches, one per kind and contiguous run. Markers do not break a run.
fn diff_marks(before: &[Option<MarkSet>], after: &[Option<MarkSet>], patches: &mut Vec<Patch>) {
    let kinds: BTreeSet<MarkKind> = before
        .iter()
        .chain(after)
        .flatten()
        .flat_map(|marks| marks.iter().map(|mark| mark.kind.clone()))
        .collect();

    for kind in kinds {
        let mut run: Option<(usize, usize, Option<Mark>)> = None;
        let flush = |run: Option<(usize, usize, Option<Mark>)>, patches: &mut Vec<Patch>| {
            if let Some((start, last, mark)) = run {
                patches.push(match mark {
                    Some(mark) => Patch::Mark {
                        start,
                        end: last + 1,
                        mark,
                    },
                    None => Patch::Unmark {
                        start,
                        end: last + 1,
                        kind: kind.clone(),
                    },
                });
            }
        };
        for (index, (old, new)) in before.iter().zip(after).enumerate() {
            let (Some(old), Some(new)) = (old, new) else {
                continue;
            };
            let (old, new) = (old.get(&kind), new.get(&kind));
            if old == new {
                flush(run.take(), patches);
                continue;
            }
            let change = new.cloned();
            match run.as_mut() {
                Some((_, last, current)) if *current == change => *last = index,
                _ => {
                    flush(run.take(), patches);
                    run = Some((index, index, change));
                }
            }
        }
        flush(run.take(), patches);
    }
}
