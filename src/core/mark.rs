//! Rich text marks.
//!
//! [`Mark`] and [`MarkSet`] are the plain values carried by inline runs.
//! [`MarkOp`] and [`MarkOpSet`] are their replicated form: anchored intervals
//! that resolve last-writer-wins per element and mark kind.

use super::{OpId, Sequence};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkKind {
    Bold,
    Italic,
    Code,
    Highlight,
    Link,
    Custom(String),
}

impl MarkKind {
    pub fn name(&self) -> &str {
        match self {
            MarkKind::Bold => "bold",
            MarkKind::Italic => "italic",
            MarkKind::Code => "code",
            MarkKind::Highlight => "highlight",
            MarkKind::Link => "link",
            MarkKind::Custom(name) => name,
        }
    }

    pub fn from_name(name: &str) -> Self {
        match name {
            "bold" => MarkKind::Bold,
            "italic" => MarkKind::Italic,
            "code" => MarkKind::Code,
            "highlight" => MarkKind::Highlight,
            "link" => MarkKind::Link,
            other => MarkKind::Custom(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Mark {
    pub kind: MarkKind,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, String>,
}

impl Mark {
    pub fn new(kind: MarkKind) -> Self {
        Self {
            kind,
            attrs: BTreeMap::new(),
        }
    }

    pub fn link(href: impl Into<String>) -> Self {
        Self::new(MarkKind::Link).with_attr("href", href)
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }
}

/// Unordered set of marks, at most one per kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<Mark>", into = "Vec<Mark>")]
pub struct MarkSet {
    marks: Vec<Mark>,
}

impl MarkSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `mark`, replacing any mark of the same kind.
    pub fn insert(&mut self, mark: Mark) {
        match self.marks.binary_search_by(|m| m.kind.cmp(&mark.kind)) {
            Ok(idx) => self.marks[idx] = mark,
            Err(idx) => self.marks.insert(idx, mark),
        }
    }

    pub fn remove(&mut self, kind: &MarkKind) -> Option<Mark> {
        let idx = self.marks.binary_search_by(|m| m.kind.cmp(kind)).ok()?;
        Some(self.marks.remove(idx))
    }

    pub fn get(&self, kind: &MarkKind) -> Option<&Mark> {
        self.marks
            .binary_search_by(|m| m.kind.cmp(kind))
            .ok()
            .map(|idx| &self.marks[idx])
    }

    pub fn contains(&self, kind: &MarkKind) -> bool {
        self.get(kind).is_some()
    }

    pub fn with(mut self, mark: Mark) -> Self {
        self.insert(mark);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mark> {
        self.marks.iter()
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }
}

impl FromIterator<Mark> for MarkSet {
    fn from_iter<I: IntoIterator<Item = Mark>>(iter: I) -> Self {
        let mut set = MarkSet::new();
        for mark in iter {
            set.insert(mark);
        }
        set
    }
}

impl From<Vec<Mark>> for MarkSet {
    fn from(marks: Vec<Mark>) -> Self {
        marks.into_iter().collect()
    }
}

impl From<MarkSet> for Vec<Mark> {
    fn from(set: MarkSet) -> Self {
        set.marks
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnchorBias {
    Before,
    After,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    pub elem_id: OpId,
    pub bias: AnchorBias,
}

impl Anchor {
    pub fn before(elem_id: OpId) -> Self {
        Self {
            elem_id,
            bias: AnchorBias::Before,
        }
    }

    pub fn after(elem_id: OpId) -> Self {
        Self {
            elem_id,
            bias: AnchorBias::After,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkAction {
    Add(Mark),
    Remove(MarkKind),
}

impl MarkAction {
    pub fn kind(&self) -> &MarkKind {
        match self {
            MarkAction::Add(mark) => &mark.kind,
            MarkAction::Remove(kind) => kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkOp {
    pub id: OpId,
    pub start: Anchor,
    pub end: Anchor,
    pub action: MarkAction,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkOpSet {
    ops: BTreeMap<OpId, MarkOp>,
}

impl MarkOpSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if an op with the same id was already recorded.
    pub fn insert(&mut self, op: MarkOp) -> bool {
        if self.ops.contains_key(&op.id) {
            return false;
        }
        self.ops.insert(op.id, op);
        true
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MarkOp> {
        self.ops.values()
    }

    /// Resolves the mark set of every element of `seq`, tombstones included.
    ///
    /// Ops apply in ascending id order, so for each element and kind the
    /// covering op with the greatest id wins.
    pub fn resolve<T>(&self, seq: &Sequence<T>) -> Vec<MarkSet> {
        let mut resolved = vec![MarkSet::new(); seq.len_all()];
        for op in self.ops.values() {
            let (Some(start), Some(end)) = (
                resolve_anchor(&op.start, seq),
                resolve_anchor(&op.end, seq),
            ) else {
                continue;
            };
            for marks in resolved.iter_mut().take(end).skip(start) {
                match &op.action {
                    MarkAction::Add(mark) => marks.insert(mark.clone()),
                    MarkAction::Remove(kind) => {
                        marks.remove(kind);
                    }
                }
            }
        }
        resolved
    }

    /// Mark set of the element at full `position`.
    pub fn resolve_at<T>(&self, seq: &Sequence<T>, position: usize) -> MarkSet {
        let mut marks = MarkSet::new();
        for op in self.ops.values() {
            let (Some(start), Some(end)) = (
                resolve_anchor(&op.start, seq),
                resolve_anchor(&op.end, seq),
            ) else {
                continue;
            };
            if (start..end).contains(&position) {
                match &op.action {
                    MarkAction::Add(mark) => marks.insert(mark.clone()),
                    MarkAction::Remove(kind) => {
                        marks.remove(kind);
                    }
                }
            }
        }
        marks
    }
}

fn resolve_anchor<T>(anchor: &Anchor, seq: &Sequence<T>) -> Option<usize> {
    let base = seq.position(&anchor.elem_id)?;
    match anchor.bias {
        AnchorBias::Before => Some(base),
        AnchorBias::After => Some(base + 1),
    }
}
