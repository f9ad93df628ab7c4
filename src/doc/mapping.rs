//! Position mapping through replaced ranges.
//!
//! A [`StepMap`] describes the ranges one step replaced; a [`Mapping`]
//! composes step maps left to right. Positions inside a replaced range land
//! on its start or end depending on [`Bias`] and are flagged as deleted.

use serde::{Deserialize, Serialize};
use std::ops::Range;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bias {
    /// Prefer the start of a replacement.
    Start,
    /// Prefer the end of a replacement.
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapResult {
    pub pos: usize,
    pub deleted: bool,
}

/// `old_size` positions starting at `start` replaced by `new_size` positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplacedRange {
    pub start: usize,
    pub old_size: usize,
    pub new_size: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepMap {
    ranges: Vec<ReplacedRange>,
}

impl StepMap {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Ranges must not overlap; they are kept sorted by start.
    pub fn new(mut ranges: Vec<ReplacedRange>) -> Self {
        ranges.sort_by_key(|range| range.start);
        Self { ranges }
    }

    pub fn replace(start: usize, old_size: usize, new_size: usize) -> Self {
        Self::new(vec![ReplacedRange {
            start,
            old_size,
            new_size,
        }])
    }

    pub fn ranges(&self) -> &[ReplacedRange] {
        &self.ranges
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn map(&self, pos: usize, bias: Bias) -> MapResult {
        let mut added = 0;
        let mut removed = 0;
        for range in &self.ranges {
            if pos < range.start {
                break;
            }
            let end = range.start + range.old_size;
            if pos <= end {
                let start = range.start + added - removed;
                let after = start + range.new_size;
                let (mapped, deleted) = match bias {
                    Bias::Start => (start, range.old_size > 0 && pos != range.start),
                    Bias::End => (after, range.old_size > 0 && pos != end),
                };
                return MapResult {
                    pos: mapped,
                    deleted,
                };
            }
            added += range.new_size;
            removed += range.old_size;
        }
        MapResult {
            pos: pos + added - removed,
            deleted: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mapping {
    maps: Vec<StepMap>,
}

impl Mapping {
    pub fn new(maps: Vec<StepMap>) -> Self {
        Self { maps }
    }

    /// Builds a mapping from range operations reported by an editing surface.
    pub fn from_operations(ops: &[EditOp]) -> Self {
        Self::new(ops.iter().map(EditOp::step_map).collect())
    }

    pub fn push(&mut self, map: StepMap) {
        self.maps.push(map);
    }

    pub fn maps(&self) -> &[StepMap] {
        &self.maps
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    pub fn map(&self, pos: usize, bias: Bias) -> MapResult {
        self.maps.iter().fold(
            MapResult {
                pos,
                deleted: false,
            },
            |acc, map| {
                let next = map.map(acc.pos, bias);
                MapResult {
                    pos: next.pos,
                    deleted: acc.deleted || next.deleted,
                }
            },
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Insert,
    Delete,
    Replace,
    /// Marks or block attributes changed; no position moved.
    Format,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditOp {
    pub kind: OpKind,
    pub range_before: Range<usize>,
    pub size_after: usize,
}

impl EditOp {
    pub fn replaced(from: usize, to: usize, size_after: usize) -> Self {
        let kind = match (to - from, size_after) {
            (0, n) if n > 0 => OpKind::Insert,
            (n, 0) if n > 0 => OpKind::Delete,
            _ => OpKind::Replace,
        };
        Self {
            kind,
            range_before: from..to,
            size_after,
        }
    }

    pub fn format(from: usize, to: usize) -> Self {
        Self {
            kind: OpKind::Format,
            range_before: from..to,
            size_after: to - from,
        }
    }

    pub fn step_map(&self) -> StepMap {
        match self.kind {
            OpKind::Format => StepMap::empty(),
            _ => StepMap::replace(
                self.range_before.start,
                self.range_before.len(),
                self.size_after,
            ),
        }
    }
}
