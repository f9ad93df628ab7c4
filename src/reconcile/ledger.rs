//! Last committed rows, kept so passes can detect changes without reading
//! the store.

use crate::core::mark::MarkSet;
use crate::store::{BlockRow, ExternalId, InlineRow};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineEntry {
    pub row: InlineRow,
    pub marks: MarkSet,
    /// Ids of the mark rows written for `marks`.
    pub mark_rows: Vec<ExternalId>,
}

#[derive(Debug, Default, Clone)]
pub struct RowLedger {
    blocks: BTreeMap<ExternalId, BlockRow>,
    inlines: BTreeMap<ExternalId, InlineEntry>,
}

impl RowLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block(&self, id: &ExternalId) -> Option<&BlockRow> {
        self.blocks.get(id)
    }

    pub fn inline(&self, id: &ExternalId) -> Option<&InlineEntry> {
        self.inlines.get(id)
    }

    pub fn record_block(&mut self, id: ExternalId, row: BlockRow) {
        self.blocks.insert(id, row);
    }

    pub fn record_inline(&mut self, id: ExternalId, entry: InlineEntry) {
        self.inlines.insert(id, entry);
    }

    pub fn forget_block(&mut self, id: &ExternalId) -> Option<BlockRow> {
        self.blocks.remove(id)
    }

    pub fn forget_inline(&mut self, id: &ExternalId) -> Option<InlineEntry> {
        self.inlines.remove(id)
    }

    pub fn block_ids(&self) -> impl Iterator<Item = &ExternalId> {
        self.blocks.keys()
    }

    pub fn inline_ids(&self) -> impl Iterator<Item = &ExternalId> {
        self.inlines.keys()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn inline_count(&self) -> usize {
        self.inlines.len()
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
        self.inlines.clear();
    }
}
