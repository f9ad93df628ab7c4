//! Naive reference projections for differential testing.
//!
//! Everything here is computed the slow, obvious way: trees are read token
//! by token, stores table by table, and positions are mapped one operation
//! at a time.
use fika_reconcile::doc::mapping::{Bias, EditOp, OpKind};
use fika_reconcile::store::{Row, RowStore, StoreError, Table};
use fika_reconcile::sync::{FlatElem, Patch, ReplicaSnapshot};
use fika_reconcile::{BlockKind, Doc, MarkSet, Token};
use std::collections::BTreeMap;

/// A block as it should appear in the store, without ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NaiveBlock {
    pub kind: String,
    pub attrs: BTreeMap<String, String>,
    pub text: String,
    pub inlines: Vec<NaiveInline>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NaiveInline {
    pub content: String,
    /// `(kind, attrs)` pairs sorted by kind.
    pub marks: Vec<(String, BTreeMap<String, String>)>,
}

fn mark_pairs(marks: &MarkSet) -> Vec<(String, BTreeMap<String, String>)> {
    let mut pairs: Vec<_> = marks
        .iter()
        .map(|mark| (mark.kind.name().to_string(), mark.attrs.clone()))
        .collect();
    pairs.sort();
    pairs
}

/// Projects a tree by walking its tokens and cutting a new run whenever the
/// mark set changes.
pub fn project_doc(doc: &Doc) -> Vec<NaiveBlock> {
    let mut blocks = Vec::new();
    let mut current: Option<(BlockKind, Vec<(char, MarkSet)>)> = None;
    for token in doc.to_tokens() {
        match token {
            Token::Open(kind) => current = Some((kind, Vec::new())),
            Token::Char { ch, marks } => {
                if let Some((_, chars)) = current.as_mut() {
                    chars.push((ch, marks));
                }
            }
            Token::Close => {
                if let Some((kind, chars)) = current.take() {
                    blocks.push(close_block(kind, &chars));
                }
            }
        }
    }
    blocks
}

fn close_block(kind: BlockKind, chars: &[(char, MarkSet)]) -> NaiveBlock {
    let mut inlines: Vec<NaiveInline> = Vec::new();
    let mut last: Option<&MarkSet> = None;
    for (ch, marks) in chars {
        match inlines.last_mut() {
            Some(inline) if last == Some(marks) => inline.content.push(*ch),
            _ => inlines.push(NaiveInline {
                content: ch.to_string(),
                marks: mark_pairs(marks),
            }),
        }
        last = Some(marks);
    }
    NaiveBlock {
        kind: kind.name().to_string(),
        attrs: kind.attrs(),
        text: chars.iter().map(|(ch, _)| ch).collect(),
        inlines,
    }
}

/// Reads every row of `document_id` back into blocks, ordering siblings by
/// their `order` cell.
pub fn project_store<S: RowStore + ?Sized>(
    store: &S,
    document_id: &str,
) -> Result<Vec<NaiveBlock>, StoreError> {
    let blocks = store.rows(Table::Blocks)?;
    let inlines = store.rows(Table::Inlines)?;
    let marks = store.rows(Table::Marks)?;

    let mut out = Vec::new();
    let mut block_rows: Vec<_> = blocks
        .iter()
        .filter_map(|(id, row)| match row {
            Row::Block(block) if block.document_id == document_id => Some((id, block)),
            _ => None,
        })
        .collect();
    block_rows.sort_by_key(|(_, block)| block.order);

    for (block_id, block) in block_rows {
        let mut inline_rows: Vec<_> = inlines
            .iter()
            .filter_map(|(id, row)| match row {
                Row::Inline(inline) if &inline.block_id == block_id => Some((id, inline)),
                _ => None,
            })
            .collect();
        inline_rows.sort_by_key(|(_, inline)| inline.order);

        let mut naive_inlines = Vec::new();
        for (inline_id, inline) in inline_rows {
            let mut pairs: Vec<_> = marks
                .iter()
                .filter_map(|(_, row)| match row {
                    Row::Mark(mark) if &mark.inline_id == inline_id => {
                        Some((mark.kind.clone(), mark.attrs.clone()))
                    }
                    _ => None,
                })
                .collect();
            pairs.sort();
            naive_inlines.push(NaiveInline {
                content: inline.content.clone(),
                marks: pairs,
            });
        }
        out.push(NaiveBlock {
            kind: block.kind.clone(),
            attrs: block.attrs.clone(),
            text: block.text.clone(),
            inlines: naive_inlines,
        });
    }
    Ok(out)
}

/// True when the children of every parent are ordered exactly `0..n`.
pub fn order_is_contiguous<S: RowStore + ?Sized>(store: &S) -> Result<bool, StoreError> {
    let mut orders: BTreeMap<String, Vec<u64>> = BTreeMap::new();
    for (_, row) in store.rows(Table::Blocks)? {
        if let Row::Block(block) = row {
            orders.entry(format!("doc:{}", block.document_id)).or_default().push(block.order);
        }
    }
    for (_, row) in store.rows(Table::Inlines)? {
        if let Row::Inline(inline) = row {
            orders
                .entry(format!("block:{}", inline.block_id))
                .or_default()
                .push(inline.order);
        }
    }
    Ok(orders.values_mut().all(|siblings| {
        siblings.sort_unstable();
        siblings.iter().enumerate().all(|(index, order)| *order == index as u64)
    }))
}

/// Rows whose parent no longer exists.
pub fn dangling_rows<S: RowStore + ?Sized>(store: &S) -> Result<usize, StoreError> {
    let blocks = store.rows(Table::Blocks)?;
    let inlines = store.rows(Table::Inlines)?;
    let mut dangling = 0;
    for (_, row) in &inlines {
        if let Row::Inline(inline) = row
            && !blocks.iter().any(|(id, _)| id == &inline.block_id)
        {
            dangling += 1;
        }
    }
    for (_, row) in store.rows(Table::Marks)? {
        if let Row::Mark(mark) = row
            && !inlines.iter().any(|(id, _)| id == &mark.inline_id)
        {
            dangling += 1;
        }
    }
    Ok(dangling)
}

/// Maps `pos` through `ops` one at a time. Returns the new position and
/// whether any operation deleted the content around it.
pub fn naive_map(ops: &[EditOp], pos: usize, bias: Bias) -> (usize, bool) {
    let mut pos = pos;
    let mut deleted = false;
    for op in ops {
        if op.kind == OpKind::Format {
            continue;
        }
        let start = op.range_before.start;
        let end = op.range_before.end;
        if pos < start {
            continue;
        }
        if pos > end {
            pos = pos - (end - start) + op.size_after;
            continue;
        }
        if start < end {
            deleted |= match bias {
                Bias::Start => pos != start,
                Bias::End => pos != end,
            };
        }
        pos = match bias {
            Bias::Start => start,
            Bias::End => start + op.size_after,
        };
    }
    (pos, deleted)
}

/// Applies patches to a plain vector of elements.
pub fn apply_patches(before: &ReplicaSnapshot, patches: &[Patch]) -> Vec<FlatElem> {
    let mut elems = before.elems.clone();
    for patch in patches {
        match patch {
            Patch::Insert { index, elems: inserted } => {
                let at = (*index).min(elems.len());
                for (offset, elem) in inserted.iter().enumerate() {
                    elems.insert(at + offset, elem.clone());
                }
            }
            Patch::Delete { index, length } => {
                for _ in 0..*length {
                    if *index < elems.len() {
                        elems.remove(*index);
                    }
                }
            }
            Patch::Mark { start, end, mark } => {
                for elem in elems.iter_mut().take(*end).skip(*start) {
                    if let FlatElem::Char { marks, .. } = elem {
                        marks.insert(mark.clone());
                    }
                }
            }
            Patch::Unmark { start, end, kind } => {
                for elem in elems.iter_mut().take(*end).skip(*start) {
                    if let FlatElem::Char { marks, .. } = elem {
                        marks.remove(kind);
                    }
                }
            }
            Patch::SetBlock { index, kind } => {
                if let Some(elem) = elems.get_mut(*index)
                    && elem.is_marker()
                {
                    *elem = FlatElem::Marker(kind.clone());
                }
            }
        }
    }
    elems
}
