//! Translation between tree steps and replica changes.
//!
//! The replica addresses the document as a flat sequence where every block
//! contributes a marker followed by its characters. In token positions a
//! block is `Open chars.. Close`, so a flat index is the number of non-close
//! tokens before a position.

use super::{Delivery, FlatElem, LocalChange, Patch, ReplicaSnapshot};
use crate::core::PeerId;
use crate::doc::step::{Edit, Slice, Step, StepError, Token, Transaction};
use crate::doc::{BlockKind, Doc};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranslateError {
    #[error("translated tree diverged from change {seq} of peer {peer}")]
    Diverged { peer: PeerId, seq: u64 },
    #[error(transparent)]
    Step(#[from] StepError),
}

/// Why one patch could not be translated.
#[derive(Debug)]
enum PatchFault {
    /// Indexes or element types do not fit the document.
    Malformed(&'static str),
    /// The sequence would start with characters, which has no tree form
    /// that keeps indexes aligned.
    Unrepresentable,
    Step(StepError),
}

impl From<StepError> for PatchFault {
    fn from(err: StepError) -> Self {
        PatchFault::Step(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchTranslator {
    resync_on_divergence: bool,
}

impl Default for PatchTranslator {
    fn default() -> Self {
        Self::new(true)
    }
}

impl PatchTranslator {
    pub fn new(resync_on_divergence: bool) -> Self {
        Self {
            resync_on_divergence,
        }
    }

    /// Changes that write `doc` into an empty replica.
    pub fn seed(&self, doc: &Doc) -> Vec<LocalChange> {
        let snapshot = ReplicaSnapshot::from_doc(doc);
        if snapshot.is_empty() {
            return Vec::new();
        }
        vec![LocalChange::Splice {
            index: 0,
            delete: 0,
            insert: snapshot.elems,
        }]
    }

    /// Translates `steps`, applied in order starting from `before`, into
    /// replica changes.
    pub fn outbound(&self, before: &Doc, steps: &[Step]) -> Result<Vec<LocalChange>, TranslateError> {
        let mut doc = before.clone();
        let mut changes = Vec::new();
        for step in steps {
            let tokens = doc.to_tokens();
            let flat = |pos: usize| flat_index(&tokens, pos);
            match step {
                Step::Replace { from, to, slice } => {
                    let from_index = flat(*from);
                    let delete = flat(*to) - from_index;
                    let insert: Vec<FlatElem> = slice
                        .tokens()
                        .iter()
                        .filter_map(|token| match token {
                            Token::Open(kind) => Some(FlatElem::Marker(kind.clone())),
                            Token::Char { ch, marks } => Some(FlatElem::Char {
                                ch: *ch,
                                marks: marks.clone(),
                            }),
                            Token::Close => None,
                        })
                        .collect();
                    if delete > 0 || !insert.is_empty() {
                        changes.push(LocalChange::Splice {
                            index: from_index,
                            delete,
                            insert,
                        });
                    }
                }
                Step::AddMark { from, to, mark } => changes.push(LocalChange::Mark {
                    start: flat(*from),
                    end: flat(*to),
                    mark: mark.clone(),
                }),
                Step::RemoveMark { from, to, kind } => changes.push(LocalChange::Unmark {
                    start: flat(*from),
                    end: flat(*to),
                    kind: kind.clone(),
                }),
                Step::SetBlockKind { pos, kind } => changes.push(LocalChange::SetBlock {
                    index: flat(*pos),
                    kind: kind.clone(),
                }),
            }
            doc = step.apply(&doc)?;
        }
        Ok(changes)
    }

    /// Translates the patches of `delivery` into an edit of `doc`, the tree
    /// matching `delivery.before`.
    ///
    /// Patches are translated one by one in delivery order. Malformed ones
    /// are dropped. When the result does not match `delivery.after` the edit
    /// ends with a replacement of the whole document, or fails if resync is
    /// off.
    pub fn inbound(&self, doc: &Doc, delivery: &Delivery) -> Result<Edit, TranslateError> {
        let mut tx = Transaction::new(doc);
        let mut shadow: Vec<bool> = delivery.before.elems.iter().map(FlatElem::is_marker).collect();

        if doc.structurally_eq(&delivery.before.to_doc()) {
            for patch in &delivery.patches {
                match translate_patch(&mut tx, &mut shadow, patch) {
                    Ok(()) => {}
                    Err(PatchFault::Malformed(reason)) => {
                        warn!(?patch, reason, "dropping malformed patch");
                    }
                    Err(PatchFault::Step(err)) => {
                        warn!(?patch, error = %err, "dropping patch that does not apply");
                    }
                    Err(PatchFault::Unrepresentable) => {
                        debug!(?patch, "patch leaves leading characters");
                        break;
                    }
                }
            }
        } else {
            warn!(
                peer = delivery.peer,
                seq = delivery.seq,
                "tree does not match the pre-change snapshot"
            );
        }

        let expected = delivery.after.to_doc();
        if !tx.doc().structurally_eq(&expected) {
            if !self.resync_on_divergence {
                return Err(TranslateError::Diverged {
                    peer: delivery.peer,
                    seq: delivery.seq,
                });
            }
            warn!(
                peer = delivery.peer,
                seq = delivery.seq,
                "resyncing tree from replica snapshot"
            );
            let size = tx.doc().size();
            tx.step(Step::Replace {
                from: 0,
                to: size,
                slice: Slice::new(expected.to_tokens()),
            })?;
        }
        Ok(tx.finish())
    }
}

fn flat_index(tokens: &[Token], pos: usize) -> usize {
    tokens[..pos.min(tokens.len())]
        .iter()
        .filter(|token| !token.is_close())
        .count()
}

/// Token position just before flat element `index`, for `index > 0`.
/// The end of the sequence maps to the end of the last block.
fn inside(doc: &Doc, index: usize) -> Option<usize> {
    let mut flat = 0;
    for entry in doc.block_entries() {
        if index == flat {
            return (entry.index > 0).then(|| entry.pos - 1);
        }
        let len = entry.block.len();
        if index <= flat + len {
            return Some(entry.pos + 1 + (index - flat - 1));
        }
        flat += len + 1;
    }
    (index == flat && !doc.is_empty()).then(|| doc.size() - 1)
}

fn elem_tokens(elems: &[FlatElem]) -> Vec<Token> {
    let mut tokens = Vec::with_capacity(elems.len() + 1);
    for elem in elems {
        match elem {
            FlatElem::Marker(kind) => {
                tokens.push(Token::Close);
                tokens.push(Token::Open(kind.clone()));
            }
            FlatElem::Char { ch, marks } => tokens.push(Token::Char {
                ch: *ch,
                marks: marks.clone(),
            }),
        }
    }
    tokens
}

fn translate_patch(
    tx: &mut Transaction,
    shadow: &mut Vec<bool>,
    patch: &Patch,
) -> Result<(), PatchFault> {
    if shadow.first() == Some(&false) {
        return Err(PatchFault::Unrepresentable);
    }
    let len = shadow.len();
    match patch {
        Patch::Insert { index, elems } => {
            if *index > len {
                return Err(PatchFault::Malformed("insert index out of range"));
            }
            if elems.is_empty() {
                return Ok(());
            }
            let mut tokens = elem_tokens(elems);
            let pos = if *index == 0 {
                if !elems[0].is_marker() {
                    return Err(PatchFault::Unrepresentable);
                }
                // Drop the close that would end the block before the first marker.
                tokens.remove(0);
                tokens.push(Token::Close);
                0
            } else {
                inside(tx.doc(), *index).ok_or(PatchFault::Malformed("insert index out of range"))?
            };
            tx.step(Step::Replace {
                from: pos,
                to: pos,
                slice: Slice::new(tokens),
            })?;
            shadow.splice(*index..*index, elems.iter().map(FlatElem::is_marker));
        }
        Patch::Delete { index, length } => {
            let end = index + length;
            if end > len {
                return Err(PatchFault::Malformed("delete range out of bounds"));
            }
            if *length == 0 {
                return Ok(());
            }
            let doc = tx.doc();
            let step = if *index > 0 {
                let from = inside(doc, *index).ok_or(PatchFault::Malformed("delete start"))?;
                let to = inside(doc, end).ok_or(PatchFault::Malformed("delete end"))?;
                Step::Replace {
                    from,
                    to,
                    slice: Slice::empty(),
                }
            } else if end == len {
                Step::Replace {
                    from: 0,
                    to: doc.size(),
                    slice: Slice::empty(),
                }
            } else {
                // Deleting from the head: the survivor at `end` is either a
                // marker, or a character left without one.
                let block = shadow[..end].iter().filter(|marker| **marker).count() - 1;
                let positions = doc.block_positions();
                if shadow[end] {
                    Step::Replace {
                        from: 0,
                        to: positions[block + 1],
                        slice: Slice::empty(),
                    }
                } else {
                    let marker = shadow[..end]
                        .iter()
                        .rposition(|marker| *marker)
                        .ok_or(PatchFault::Malformed("delete start"))?;
                    let offset = end - marker - 1;
                    Step::Replace {
                        from: 0,
                        to: positions[block] + 1 + offset,
                        slice: Slice::new(vec![Token::Open(BlockKind::Paragraph)]),
                    }
                }
            };
            tx.step(step)?;
            shadow.drain(*index..end);
        }
        Patch::Mark { start, end, mark } => {
            if let Some((from, to)) = mark_range(tx.doc(), *start, *end, len)? {
                tx.step(Step::AddMark {
                    from,
                    to,
                    mark: mark.clone(),
                })?;
            }
        }
        Patch::Unmark { start, end, kind } => {
            if let Some((from, to)) = mark_range(tx.doc(), *start, *end, len)? {
                tx.step(Step::RemoveMark {
                    from,
                    to,
                    kind: kind.clone(),
                })?;
            }
        }
        Patch::SetBlock { index, kind } => {
            if shadow.get(*index) != Some(&true) {
                return Err(PatchFault::Malformed("set block target is not a marker"));
            }
            let block = shadow[..*index].iter().filter(|marker| **marker).count();
            let pos = tx
                .doc()
                .block_positions()
                .get(block)
                .copied()
                .ok_or(PatchFault::Malformed("set block target is not a marker"))?;
            tx.step(Step::SetBlockKind {
                pos,
                kind: kind.clone(),
            })?;
        }
    }
    Ok(())
}

fn mark_range(
    doc: &Doc,
    start: usize,
    end: usize,
    len: usize,
) -> Result<Option<(usize, usize)>, PatchFault> {
    if start > end || end > len {
        return Err(PatchFault::Malformed("mark range out of bounds"));
    }
    if start == end {
        return Ok(None);
    }
    let from = if start == 0 {
        0
    } else {
        inside(doc, start).ok_or(PatchFault::Malformed("mark start"))?
    };
    let to = inside(doc, end).ok_or(PatchFault::Malformed("mark end"))?;
    Ok(Some((from, to)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::mark::{Mark, MarkKind};
    use crate::doc::Block;
    use crate::sync::{ReplicaConfig, ReplicaDoc};

    fn replica_with(doc: &Doc) -> ReplicaDoc {
        let mut replica = ReplicaDoc::new(ReplicaConfig::default());
        replica
            .apply_local_change(&PatchTranslator::default().seed(doc))
            .unwrap();
        replica
    }

    /// Runs a local edit through the replica and back into a tree.
    fn round_trip(doc: &Doc, build: impl FnOnce(&mut Transaction)) -> (Doc, Doc) {
        let translator = PatchTranslator::new(false);
        let mut replica = replica_with(doc);
        let mut tx = Transaction::new(doc);
        build(&mut tx);
        let changes = translator.outbound(doc, tx.steps()).unwrap();
        let committed = replica.apply_local_change(&changes).unwrap();
        let edit = translator.inbound(doc, &committed.delivery).unwrap();
        (tx.doc().clone(), edit.after)
    }

    #[test]
    fn test_inside_positions() {
        let doc = Doc::from_paragraphs(&["ab", "c"]);
        // flat: [P a b P c], tokens: O a b C O c C
        assert_eq!(inside(&doc, 1), Some(1));
        assert_eq!(inside(&doc, 2), Some(2));
        assert_eq!(inside(&doc, 3), Some(3));
        assert_eq!(inside(&doc, 4), Some(5));
        assert_eq!(inside(&doc, 5), Some(6));
        assert_eq!(inside(&doc, 6), None);
        assert_eq!(inside(&doc, 0), None);
    }

    #[test]
    fn test_outbound_splice_counts_flat_elements() {
        let doc = Doc::from_paragraphs(&["ab", "c"]);
        let mut tx = Transaction::new(&doc);
        tx.insert_text(5, "x").unwrap();
        let changes = PatchTranslator::default()
            .outbound(&doc, tx.steps())
            .unwrap();
        assert_eq!(
            changes,
            vec![LocalChange::Splice {
                index: 4,
                delete: 0,
                insert: vec![FlatElem::Char {
                    ch: 'x',
                    marks: Default::default()
                }],
            }]
        );
    }

    #[test]
    fn test_round_trip_typing() {
        let doc = Doc::from_paragraphs(&["Hello", "World"]);
        let (local, remote) = round_trip(&doc, |tx| {
            tx.insert_text(6, "!").unwrap();
        });
        assert!(remote.structurally_eq(&local));
    }

    #[test]
    fn test_round_trip_split_and_join() {
        let doc = Doc::from_paragraphs(&["Hello world"]);
        let (local, remote) = round_trip(&doc, |tx| {
            tx.split_block(6).unwrap();
        });
        assert!(remote.structurally_eq(&local));
        assert_eq!(remote.block_count(), 2);

        let (local, remote) = round_trip(&local, |tx| {
            tx.join_backward(8).unwrap();
        });
        assert!(remote.structurally_eq(&local));
        assert_eq!(remote.block_count(), 1);
    }

    #[test]
    fn test_round_trip_marks_and_kinds() {
        let doc = Doc::from_paragraphs(&["Hello", "World"]);
        let (local, remote) = round_trip(&doc, |tx| {
            tx.add_mark(2, 10, Mark::new(MarkKind::Bold))
                .unwrap()
                .set_block_kind(7, BlockKind::heading(2))
                .unwrap();
        });
        assert!(remote.structurally_eq(&local));
    }

    #[test]
    fn test_round_trip_removing_the_first_block() {
        let doc = Doc::from_paragraphs(&["one", "two"]);
        let (local, remote) = round_trip(&doc, |tx| {
            tx.remove_block(0).unwrap();
        });
        assert!(remote.structurally_eq(&local));
        assert_eq!(remote.blocks()[0].text(), "two");
    }

    #[test]
    fn test_round_trip_inserting_a_first_block() {
        let doc = Doc::from_paragraphs(&["two"]);
        let (local, remote) = round_trip(&doc, |tx| {
            tx.insert_block(0, BlockKind::heading(1), "one").unwrap();
        });
        assert!(remote.structurally_eq(&local));
    }

    #[test]
    fn test_malformed_patch_triggers_resync() {
        let doc = Doc::from_paragraphs(&["ab"]);
        let after = Doc::from_paragraphs(&["abc"]);
        let delivery = Delivery {
            peer: 2,
            seq: 1,
            patches: vec![Patch::SetBlock {
                index: 1,
                kind: BlockKind::BulletItem,
            }],
            before: ReplicaSnapshot::from_doc(&doc),
            after: ReplicaSnapshot::from_doc(&after),
        };
        let edit = PatchTranslator::default().inbound(&doc, &delivery).unwrap();
        assert!(edit.after.structurally_eq(&after));

        assert_eq!(
            PatchTranslator::new(false)
                .inbound(&doc, &delivery)
                .unwrap_err(),
            TranslateError::Diverged { peer: 2, seq: 1 }
        );
    }

    #[test]
    fn test_leading_characters_are_resynced() {
        let doc = Doc::new([Block::paragraph("ab"), Block::paragraph("cd")]);
        // Deleting the first marker and one character leaves "b" unmarked.
        let mut after = ReplicaSnapshot::from_doc(&doc);
        after.elems.drain(0..2);
        let delivery = Delivery {
            peer: 2,
            seq: 1,
            patches: vec![Patch::Delete {
                index: 0,
                length: 2,
            }],
            before: ReplicaSnapshot::from_doc(&doc),
            after: after.clone(),
        };
        let edit = PatchTranslator::new(false).inbound(&doc, &delivery).unwrap();
        assert!(edit.after.structurally_eq(&after.to_doc()));
        assert_eq!(edit.after.blocks()[0].text(), "b");
    }
}
