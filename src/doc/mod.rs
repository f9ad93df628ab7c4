//! Immutable document tree.
//!
//! A [`Doc`] is an ordered list of [`Block`]s, each holding maximal
//! [`Inline`] runs of text sharing one mark set. Nodes are values: every
//! constructed node carries a fresh [`NodeKey`], so two structurally equal
//! nodes built by independent edits are still distinct entities.
//!
//! Positions follow a token model. A block contributes an opening token,
//! one token per `char` of its text, and a closing token:
//!
//! ```text
//!  0   1 2 3   4   5   6 7   8
//!  <p> a b c </p> <h1> x y </h1>
//! ```

use crate::core::mark::MarkSet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub mod input_rules;
pub mod mapping;
pub mod mark_ops;
pub mod step;

static NEXT_NODE_KEY: AtomicU64 = AtomicU64::new(1);

/// Value identity of a tree node. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeKey(u64);

impl NodeKey {
    pub fn fresh() -> Self {
        NodeKey(NEXT_NODE_KEY.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockKind {
    Paragraph,
    Heading {
        level: u8,
    },
    BulletItem,
    OrderedItem {
        start: u64,
    },
    CodeFence {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        info: Option<String>,
    },
    Custom {
        name: String,
    },
}

pub const MAX_HEADING_LEVEL: u8 = 6;

impl BlockKind {
    pub fn heading(level: u8) -> Self {
        BlockKind::Heading {
            level: level.clamp(1, MAX_HEADING_LEVEL),
        }
    }

    /// Kind name as stored in the `kind` cell of a block row.
    pub fn name(&self) -> &str {
        match self {
            BlockKind::Paragraph => "paragraph",
            BlockKind::Heading { .. } => "heading",
            BlockKind::BulletItem => "bullet_item",
            BlockKind::OrderedItem { .. } => "ordered_item",
            BlockKind::CodeFence { .. } => "code_fence",
            BlockKind::Custom { name } => name,
        }
    }

    /// Structural attributes as stored next to the kind name.
    pub fn attrs(&self) -> BTreeMap<String, String> {
        let mut attrs = BTreeMap::new();
        match self {
            BlockKind::Heading { level } => {
                attrs.insert("level".to_string(), level.to_string());
            }
            BlockKind::OrderedItem { start } => {
                attrs.insert("start".to_string(), start.to_string());
            }
            BlockKind::CodeFence { info: Some(info) } => {
                attrs.insert("info".to_string(), info.clone());
            }
            _ => {}
        }
        attrs
    }

    /// Rebuilds a kind from its row projection. Unknown names become
    /// [`BlockKind::Custom`]; unparsable attributes fall back to defaults.
    pub fn from_row(name: &str, attrs: &BTreeMap<String, String>) -> Self {
        match name {
            "paragraph" => BlockKind::Paragraph,
            "heading" => BlockKind::heading(
                attrs
                    .get("level")
                    .and_then(|level| level.parse().ok())
                    .unwrap_or(1),
            ),
            "bullet_item" => BlockKind::BulletItem,
            "ordered_item" => BlockKind::OrderedItem {
                start: attrs
                    .get("start")
                    .and_then(|start| start.parse().ok())
                    .unwrap_or(1),
            },
            "code_fence" => BlockKind::CodeFence {
                info: attrs.get("info").cloned(),
            },
            other => BlockKind::Custom {
                name: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct Inline {
    key: NodeKey,
    text: String,
    marks: MarkSet,
}

impl Inline {
    pub fn new(text: impl Into<String>, marks: MarkSet) -> Self {
        Self {
            key: NodeKey::fresh(),
            text: text.into(),
            marks,
        }
    }

    pub fn plain(text: impl Into<String>) -> Self {
        Self::new(text, MarkSet::new())
    }

    pub fn key(&self) -> NodeKey {
        self.key
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn marks(&self) -> &MarkSet {
        &self.marks
    }

    /// Length in position units (chars).
    pub fn len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Block {
    key: NodeKey,
    kind: BlockKind,
    content: Vec<Arc<Inline>>,
}

impl Block {
    /// Builds a block from `runs`, dropping empty runs and merging adjacent
    /// runs with equal mark sets.
    pub fn new(kind: BlockKind, runs: impl IntoIterator<Item = Inline>) -> Self {
        let mut content: Vec<Inline> = Vec::new();
        for run in runs {
            if run.is_empty() {
                continue;
            }
            match content.last_mut() {
                Some(last) if last.marks == run.marks => {
                    let mut text = std::mem::take(&mut last.text);
                    text.push_str(&run.text);
                    *last = Inline::new(text, run.marks);
                }
                _ => content.push(run),
            }
        }
        Self::from_raw(kind, content.into_iter().map(Arc::new).collect())
    }

    pub fn paragraph(text: &str) -> Self {
        Self::with_text(BlockKind::Paragraph, text)
    }

    pub fn with_text(kind: BlockKind, text: &str) -> Self {
        Self::new(kind, [Inline::plain(text)])
    }

    /// Builds a block around existing runs without normalizing them.
    pub(crate) fn from_raw(kind: BlockKind, content: Vec<Arc<Inline>>) -> Self {
        Self {
            key: NodeKey::fresh(),
            kind,
            content,
        }
    }

    pub fn key(&self) -> NodeKey {
        self.key
    }

    pub fn kind(&self) -> &BlockKind {
        &self.kind
    }

    pub fn content(&self) -> &[Arc<Inline>] {
        &self.content
    }

    pub fn text(&self) -> String {
        self.content.iter().map(|run| run.text()).collect()
    }

    /// Content length in position units.
    pub fn len(&self) -> usize {
        self.content.iter().map(|run| run.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Marks a character typed at `offset` inherits: those of the preceding
    /// character, or of the first character when typing at the start.
    pub fn marks_at(&self, offset: usize) -> MarkSet {
        let target = offset.saturating_sub(1);
        let mut start = 0;
        for run in &self.content {
            let end = start + run.len();
            if target < end {
                return run.marks.clone();
            }
            start = end;
        }
        self.content
            .last()
            .map(|run| run.marks.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct Doc {
    key: NodeKey,
    blocks: Vec<Arc<Block>>,
}

#[derive(Debug, Clone, Copy)]
pub struct BlockEntry<'a> {
    pub pos: usize,
    pub index: usize,
    pub block: &'a Arc<Block>,
}

#[derive(Debug, Clone, Copy)]
pub struct InlineEntry<'a> {
    pub pos: usize,
    pub block_index: usize,
    pub index: usize,
    pub inline: &'a Arc<Inline>,
}

/// A position resolved against the block structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved {
    /// Before block `n` (or the end of the document when `n` equals the block count).
    Boundary(usize),
    /// Inside the content of `block`, `offset` chars from its start.
    Inside { block: usize, offset: usize },
}

impl Doc {
    pub fn new(blocks: impl IntoIterator<Item = Block>) -> Self {
        Self::from_arcs(blocks.into_iter().map(Arc::new).collect())
    }

    pub fn empty() -> Self {
        Self::from_arcs(Vec::new())
    }

    pub fn from_paragraphs<S: AsRef<str>>(texts: &[S]) -> Self {
        Self::new(texts.iter().map(|text| Block::paragraph(text.as_ref())))
    }

    pub(crate) fn from_arcs(blocks: Vec<Arc<Block>>) -> Self {
        Self {
            key: NodeKey::fresh(),
            blocks,
        }
    }

    /// Identity of this document version.
    pub fn key(&self) -> NodeKey {
        self.key
    }

    pub fn blocks(&self) -> &[Arc<Block>] {
        &self.blocks
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn size(&self) -> usize {
        self.blocks.iter().map(|block| block.len() + 2).sum()
    }

    pub fn block_positions(&self) -> Vec<usize> {
        self.block_entries().iter().map(|entry| entry.pos).collect()
    }

    pub fn block_entries(&self) -> Vec<BlockEntry<'_>> {
        let mut pos = 0;
        let mut entries = Vec::with_capacity(self.blocks.len());
        for (index, block) in self.blocks.iter().enumerate() {
            entries.push(BlockEntry { pos, index, block });
            pos += block.len() + 2;
        }
        entries
    }

    pub fn inline_entries(&self) -> Vec<InlineEntry<'_>> {
        let mut entries = Vec::new();
        for block in self.block_entries() {
            let mut pos = block.pos + 1;
            for (index, inline) in block.block.content.iter().enumerate() {
                entries.push(InlineEntry {
                    pos,
                    block_index: block.index,
                    index,
                    inline,
                });
                pos += inline.len();
            }
        }
        entries
    }

    pub fn resolve(&self, pos: usize) -> Option<Resolved> {
        let mut start = 0;
        for (index, block) in self.blocks.iter().enumerate() {
            if pos == start {
                return Some(Resolved::Boundary(index));
            }
            let len = block.len();
            if pos <= start + 1 + len {
                return Some(Resolved::Inside {
                    block: index,
                    offset: pos - start - 1,
                });
            }
            start += len + 2;
        }
        (pos == start).then_some(Resolved::Boundary(self.blocks.len()))
    }

    /// Keys of every block and inline node in this version.
    pub fn node_keys(&self) -> HashSet<NodeKey> {
        let mut keys = HashSet::new();
        for block in &self.blocks {
            keys.insert(block.key);
            keys.extend(block.content.iter().map(|run| run.key));
        }
        keys
    }

    pub fn text_content(&self) -> String {
        self.blocks
            .iter()
            .map(|block| block.text())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Compares kinds, texts and marks, ignoring node keys.
    pub fn structurally_eq(&self, other: &Doc) -> bool {
        self.blocks.len() == other.blocks.len()
            && self.blocks.iter().zip(&other.blocks).all(|(a, b)| {
                a.kind == b.kind
                    && a.content.len() == b.content.len()
                    && a
                        .content
                        .iter()
                        .zip(&b.content)
                        .all(|(x, y)| x.text == y.text && x.marks == y.marks)
            })
    }
}

impl Default for Doc {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Display for Doc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for block in &self.blocks {
            write!(f, "[{}]", block.kind.name())?;
            for run in &block.content {
                if run.marks.is_empty() {
                    write!(f, " {:?}", run.text)?;
                } else {
                    let names: Vec<&str> = run.marks.iter().map(|m| m.kind.name()).collect();
                    write!(f, " {:?}<{}>", run.text, names.join(","))?;
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::mark::{Mark, MarkKind};

    fn bold() -> MarkSet {
        MarkSet::new().with(Mark::new(MarkKind::Bold))
    }

    #[test]
    fn test_positions_follow_token_model() {
        let doc = Doc::from_paragraphs(&["abc", "", "xy"]);
        assert_eq!(doc.size(), 5 + 2 + 4);
        assert_eq!(doc.block_positions(), vec![0, 5, 7]);
        let inline_positions: Vec<usize> =
            doc.inline_entries().iter().map(|entry| entry.pos).collect();
        assert_eq!(inline_positions, vec![1, 8]);
    }

    #[test]
    fn test_resolve_boundaries_and_offsets() {
        let doc = Doc::from_paragraphs(&["abc", "xy"]);
        assert_eq!(doc.resolve(0), Some(Resolved::Boundary(0)));
        assert_eq!(doc.resolve(1), Some(Resolved::Inside { block: 0, offset: 0 }));
        assert_eq!(doc.resolve(4), Some(Resolved::Inside { block: 0, offset: 3 }));
        assert_eq!(doc.resolve(5), Some(Resolved::Boundary(1)));
        assert_eq!(doc.resolve(8), Some(Resolved::Inside { block: 1, offset: 2 }));
        assert_eq!(doc.resolve(9), Some(Resolved::Boundary(2)));
        assert_eq!(doc.resolve(10), None);
    }

    #[test]
    fn test_block_new_merges_and_drops_runs() {
        let block = Block::new(
            BlockKind::Paragraph,
            [
                Inline::new("ab", bold()),
                Inline::plain(""),
                Inline::new("cd", bold()),
                Inline::plain("e"),
            ],
        );
        assert_eq!(block.content().len(), 2);
        assert_eq!(block.content()[0].text(), "abcd");
        assert_eq!(block.text(), "abcde");
    }

    #[test]
    fn test_every_node_gets_a_fresh_key() {
        let a = Doc::from_paragraphs(&["same"]);
        let b = Doc::from_paragraphs(&["same"]);
        assert!(a.structurally_eq(&b));
        assert_ne!(a.key(), b.key());
        assert_ne!(a.blocks()[0].key(), b.blocks()[0].key());
        assert!(a.node_keys().is_disjoint(&b.node_keys()));
    }

    #[test]
    fn test_marks_at_inherits_previous_char() {
        let block = Block::new(
            BlockKind::Paragraph,
            [Inline::new("ab", bold()), Inline::plain("cd")],
        );
        assert_eq!(block.marks_at(0), bold());
        assert_eq!(block.marks_at(2), bold());
        assert_eq!(block.marks_at(3), MarkSet::new());
        assert_eq!(block.marks_at(4), MarkSet::new());
    }

    #[test]
    fn test_kind_row_projection_round_trips() {
        for kind in [
            BlockKind::Paragraph,
            BlockKind::heading(3),
            BlockKind::BulletItem,
            BlockKind::OrderedItem { start: 4 },
            BlockKind::CodeFence {
                info: Some("rust".to_string()),
            },
            BlockKind::CodeFence { info: None },
            BlockKind::Custom {
                name: "callout".to_string(),
            },
        ] {
            assert_eq!(BlockKind::from_row(kind.name(), &kind.attrs()), kind);
        }
    }

    #[test]
    fn test_heading_level_is_clamped() {
        assert_eq!(BlockKind::heading(0), BlockKind::Heading { level: 1 });
        assert_eq!(BlockKind::heading(9), BlockKind::Heading { level: 6 });
    }
}
