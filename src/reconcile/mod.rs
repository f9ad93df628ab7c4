//! Reconciliation of document versions against the row store.
//!
//! Every accepted edit produces a new tree whose nodes are fresh values. A
//! pass maps each node position of the old tree through the edit's
//! [`Mapping`], pairs the mapped positions with nodes of the new tree, and
//! carries the external id of each old node over to its successor. Nodes
//! without a predecessor become inserts, ids nobody claimed become deletes,
//! and matched rows are written only when their content changed.
//!
//! A pass validates everything before touching the store. Writes are
//! committed deletes first, then adds and updates in document order so that
//! a child's parent id is always known when the child is written.

pub mod identity;
pub mod ledger;

use crate::core::mark::{Mark, MarkKind, MarkSet};
use crate::doc::mapping::{Bias, EditOp, Mapping};
use crate::doc::step::Edit;
use crate::doc::{Block, BlockKind, Doc, Inline, NodeKey};
use crate::store::{
    self, BlockRow, ExternalId, InlineRow, MarkRow, Row, RowStore, StoreError, Table,
};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use identity::IdentityRegistry;
pub use ledger::{InlineEntry, RowLedger};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Bias used when mapping block positions.
    pub block_bias: Bias,
    /// Bias used when mapping inline positions.
    pub inline_bias: Bias,
    /// Re-read the store after each clean pass and check sibling order.
    pub verify_order: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            block_bias: Bias::End,
            inline_bias: Bias::Start,
            verify_order: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditOrigin {
    Local,
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub origin: EditOrigin,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// The edit carried no steps and the pass was skipped.
    pub noop: bool,
}

impl ReconcileReport {
    pub fn noop(origin: EditOrigin) -> Self {
        Self {
            origin,
            created: 0,
            updated: 0,
            deleted: 0,
            noop: true,
        }
    }

    pub fn mutations(&self) -> usize {
        self.created + self.updated + self.deleted
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityFault {
    #[error("node has no registered id")]
    Unbound,
    #[error("id {0} claimed twice in one pass")]
    DuplicateVisit(ExternalId),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    #[error("identity violation at {node}: {fault}")]
    IdentityViolation { node: NodeKey, fault: IdentityFault },
    #[error("{failed} store write(s) failed, first: {source}")]
    Store { failed: usize, source: StoreError },
    #[error("children of {parent} are not ordered 0..n")]
    OrderCorrupted { parent: String },
    #[error("failed to read rows: {0}")]
    Read(StoreError),
}

/// Parent reference of a row that may not exist yet.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RowRef {
    Existing(ExternalId),
    Pending(usize),
}

impl RowRef {
    fn resolve(&self, slots: &[Option<ExternalId>]) -> Option<ExternalId> {
        match self {
            RowRef::Existing(id) => Some(id.clone()),
            RowRef::Pending(slot) => slots.get(*slot).cloned().flatten(),
        }
    }
}

#[derive(Debug, Clone)]
enum Draft {
    Block(BlockRow),
    Inline {
        block: RowRef,
        content: String,
        order: u64,
    },
    Mark {
        inline: RowRef,
        mark: Mark,
    },
}

impl Draft {
    fn table(&self) -> Table {
        match self {
            Draft::Block(_) => Table::Blocks,
            Draft::Inline { .. } => Table::Inlines,
            Draft::Mark { .. } => Table::Marks,
        }
    }

    fn resolve(&self, slots: &[Option<ExternalId>]) -> Option<Row> {
        Some(match self {
            Draft::Block(row) => Row::Block(row.clone()),
            Draft::Inline {
                block,
                content,
                order,
            } => Row::Inline(InlineRow {
                block_id: block.resolve(slots)?,
                content: content.clone(),
                order: *order,
            }),
            Draft::Mark { inline, mark } => Row::Mark(MarkRow {
                inline_id: inline.resolve(slots)?,
                kind: mark.kind.name().to_string(),
                attrs: mark.attrs.clone(),
            }),
        })
    }
}

#[derive(Debug)]
enum Write {
    Add { slot: usize, draft: Draft },
    Set { id: ExternalId, draft: Draft },
}

#[derive(Debug, Default)]
struct Batch {
    deletes: Vec<(Table, ExternalId)>,
    writes: Vec<Write>,
    slots: usize,
}

#[derive(Debug, Default)]
struct Outcome {
    slots: Vec<Option<ExternalId>>,
    failed_sets: HashSet<ExternalId>,
    failed_deletes: Vec<(Table, ExternalId)>,
    failures: usize,
    first_error: Option<StoreError>,
    created: usize,
    updated: usize,
    deleted: usize,
}

impl Outcome {
    fn fail(&mut self, err: StoreError) {
        warn!(error = %err, "store write failed");
        self.failures += 1;
        self.first_error.get_or_insert(err);
    }
}

impl Batch {
    fn add(&mut self, draft: Draft) -> usize {
        let slot = self.slots;
        self.slots += 1;
        self.writes.push(Write::Add { slot, draft });
        slot
    }

    fn set(&mut self, id: ExternalId, draft: Draft) {
        self.writes.push(Write::Set { id, draft });
    }

    fn delete(&mut self, table: Table, id: ExternalId) {
        self.deletes.push((table, id));
    }

    fn commit<S: RowStore + ?Sized>(mut self, store: &mut S) -> Outcome {
        let mut outcome = Outcome {
            slots: vec![None; self.slots],
            ..Outcome::default()
        };

        // Children before parents.
        self.deletes.sort_by_key(|(table, _)| Reverse(*table));
        for (table, id) in self.deletes {
            match store.del_row(table, &id) {
                Ok(()) => outcome.deleted += 1,
                Err(StoreError::NotFound { .. }) => {}
                Err(err) => {
                    outcome.failed_deletes.push((table, id));
                    outcome.fail(err);
                }
            }
        }

        for write in self.writes {
            match write {
                Write::Add { slot, draft } => {
                    // A missing parent was already reported when its add failed.
                    let Some(row) = draft.resolve(&outcome.slots) else {
                        continue;
                    };
                    match store.add_row(draft.table(), row) {
                        Ok(id) => {
                            outcome.slots[slot] = Some(id);
                            outcome.created += 1;
                        }
                        Err(err) => outcome.fail(err),
                    }
                }
                Write::Set { id, draft } => {
                    let Some(row) = draft.resolve(&outcome.slots) else {
                        outcome.failed_sets.insert(id);
                        continue;
                    };
                    match store.set_row(draft.table(), &id, row) {
                        Ok(()) => outcome.updated += 1,
                        Err(err) => {
                            outcome.failed_sets.insert(id);
                            outcome.fail(err);
                        }
                    }
                }
            }
        }
        outcome
    }
}

struct BlockPlan {
    node: NodeKey,
    target: RowRef,
    row: BlockRow,
}

struct InlinePlan {
    node: NodeKey,
    target: RowRef,
    block: RowRef,
    content: String,
    order: u64,
    marks: MarkSet,
    /// Slots of rewritten mark rows, `None` when the marks were left alone.
    mark_slots: Option<Vec<usize>>,
}

#[derive(Default)]
struct Plan {
    batch: Batch,
    blocks: Vec<BlockPlan>,
    inlines: Vec<InlinePlan>,
    reaped_blocks: Vec<ExternalId>,
    reaped_inlines: Vec<ExternalId>,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    key: NodeKey,
    deleted: bool,
}

/// Keeps the row store of one document in step with its tree.
#[derive(Debug)]
pub struct Reconciler {
    document_id: String,
    config: ReconcileConfig,
    registry: IdentityRegistry,
    ledger: RowLedger,
    /// Ids whose last write failed and must be rewritten.
    unreconciled: BTreeSet<ExternalId>,
    pending_deletes: Vec<(Table, ExternalId)>,
    /// Nodes of the current tree whose insert failed.
    orphans: HashSet<NodeKey>,
}

impl Reconciler {
    pub fn new(document_id: impl Into<String>, config: ReconcileConfig) -> Self {
        Self {
            document_id: document_id.into(),
            config,
            registry: IdentityRegistry::new(),
            ledger: RowLedger::new(),
            unreconciled: BTreeSet::new(),
            pending_deletes: Vec::new(),
            orphans: HashSet::new(),
        }
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub fn registry(&self) -> &IdentityRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &RowLedger {
        &self.ledger
    }

    pub fn id_of(&self, node: NodeKey) -> Option<&ExternalId> {
        self.registry.lookup(node)
    }

    pub fn unreconciled(&self) -> impl Iterator<Item = &ExternalId> {
        self.unreconciled.iter()
    }

    pub fn pending_deletes(&self) -> &[(Table, ExternalId)] {
        &self.pending_deletes
    }

    /// Whether an earlier pass left failed writes behind.
    pub fn has_pending_work(&self) -> bool {
        !self.unreconciled.is_empty() || !self.pending_deletes.is_empty() || !self.orphans.is_empty()
    }

    /// Writes every node of `doc` as a new row, deleting rows this
    /// reconciler knew about before.
    #[tracing::instrument(level = "debug", skip_all, fields(document = %self.document_id))]
    pub fn bootstrap<S: RowStore + ?Sized>(
        &mut self,
        store: &mut S,
        doc: &Doc,
    ) -> Result<ReconcileReport, ReconcileError> {
        info!(blocks = doc.block_count(), "bootstrapping document rows");
        self.registry = IdentityRegistry::new();
        self.orphans.clear();
        self.run_pass(store, &Doc::empty(), doc, &Mapping::default(), EditOrigin::Local)
    }

    /// Rebuilds the tree from the store, binding every node to its row.
    ///
    /// Rows are taken as stored: runs are not merged and sibling orders may
    /// be sparse. The next pass rewrites whatever differs.
    #[tracing::instrument(level = "debug", skip_all, fields(document = %self.document_id))]
    pub fn hydrate<S: RowStore + ?Sized>(&mut self, store: &S) -> Result<Doc, ReconcileError> {
        self.registry = IdentityRegistry::new();
        self.ledger.clear();
        self.unreconciled.clear();
        self.pending_deletes.clear();
        self.orphans.clear();

        let mut blocks = Vec::new();
        for (block_id, block_row) in
            store::document_blocks(store, &self.document_id).map_err(ReconcileError::Read)?
        {
            let kind = BlockKind::from_row(&block_row.kind, &block_row.attrs);
            let mut runs = Vec::new();
            for (inline_id, inline_row) in
                store::block_inlines(store, &block_id).map_err(ReconcileError::Read)?
            {
                let mark_rows = store::inline_marks(store, &inline_id).map_err(ReconcileError::Read)?;
                let marks: MarkSet = mark_rows
                    .iter()
                    .map(|(_, row)| Mark {
                        kind: MarkKind::from_name(&row.kind),
                        attrs: row.attrs.clone(),
                    })
                    .collect();
                let inline = Arc::new(Inline::new(inline_row.content.clone(), marks.clone()));
                self.registry.bind(inline.key(), inline_id.clone());
                self.ledger.record_inline(
                    inline_id,
                    InlineEntry {
                        row: inline_row,
                        marks,
                        mark_rows: mark_rows.into_iter().map(|(id, _)| id).collect(),
                    },
                );
                runs.push(inline);
            }
            let block = Block::from_raw(kind, runs);
            self.registry.bind(block.key(), block_id.clone());
            self.ledger.record_block(block_id, block_row);
            blocks.push(Arc::new(block));
        }

        info!(
            blocks = self.ledger.block_count(),
            inlines = self.ledger.inline_count(),
            "hydrated document"
        );
        Ok(Doc::from_arcs(blocks))
    }

    /// Persists `edit.after`, given that the store currently holds `edit.before`.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(document = %self.document_id, steps = edit.steps.len(), ?origin)
    )]
    pub fn reconcile<S: RowStore + ?Sized>(
        &mut self,
        store: &mut S,
        edit: &Edit,
        origin: EditOrigin,
    ) -> Result<ReconcileReport, ReconcileError> {
        if edit.is_noop() {
            debug!("edit has no steps");
            return Ok(ReconcileReport::noop(origin));
        }
        self.run_pass(store, &edit.before, &edit.after, &edit.mapping(), origin)
    }

    /// Like [`reconcile`](Self::reconcile) for editors that report range
    /// operations instead of steps.
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(document = %self.document_id, ops = ops.len(), ?origin)
    )]
    pub fn reconcile_operations<S: RowStore + ?Sized>(
        &mut self,
        store: &mut S,
        before: &Doc,
        after: &Doc,
        ops: &[EditOp],
        origin: EditOrigin,
    ) -> Result<ReconcileReport, ReconcileError> {
        if ops.is_empty() {
            debug!("no operations");
            return Ok(ReconcileReport::noop(origin));
        }
        self.run_pass(store, before, after, &Mapping::from_operations(ops), origin)
    }

    /// Rewrites rows left stale by failed writes. `doc` must be the tree the
    /// last pass reconciled.
    #[tracing::instrument(level = "debug", skip_all, fields(document = %self.document_id))]
    pub fn retry_pending<S: RowStore + ?Sized>(
        &mut self,
        store: &mut S,
        doc: &Doc,
    ) -> Result<ReconcileReport, ReconcileError> {
        if !self.has_pending_work() {
            return Ok(ReconcileReport::noop(EditOrigin::Local));
        }
        info!(
            unreconciled = self.unreconciled.len(),
            pending_deletes = self.pending_deletes.len(),
            orphans = self.orphans.len(),
            "retrying failed writes"
        );
        self.run_pass(store, doc, doc, &Mapping::default(), EditOrigin::Local)
    }

    fn run_pass<S: RowStore + ?Sized>(
        &mut self,
        store: &mut S,
        before: &Doc,
        after: &Doc,
        mapping: &Mapping,
        origin: EditOrigin,
    ) -> Result<ReconcileReport, ReconcileError> {
        self.check_bound(before)?;

        // Orphans never got a row, so they have no id to hand over.
        let bound = |(_, key): &(usize, NodeKey)| !self.orphans.contains(key);
        let block_targets = map_positions(
            before
                .block_entries()
                .iter()
                .map(|entry| (entry.pos, entry.block.key()))
                .filter(bound),
            mapping,
            self.config.block_bias,
            after.size(),
        );
        let inline_targets = map_positions(
            before
                .inline_entries()
                .iter()
                .map(|entry| (entry.pos, entry.inline.key()))
                .filter(bound),
            mapping,
            self.config.inline_bias,
            after.size(),
        );

        let mut plan = self.plan(after, &block_targets, &inline_targets)?;
        let outcome = std::mem::take(&mut plan.batch).commit(store);
        self.settle(plan, &outcome, after);
        self.finish(store, outcome, origin)
    }

    fn finish<S: RowStore + ?Sized>(
        &self,
        store: &S,
        outcome: Outcome,
        origin: EditOrigin,
    ) -> Result<ReconcileReport, ReconcileError> {
        if let Some(source) = outcome.first_error {
            warn!(
                failed = outcome.failures,
                unreconciled = self.unreconciled.len(),
                pending_deletes = self.pending_deletes.len(),
                orphans = self.orphans.len(),
                "reconciliation pass incomplete"
            );
            return Err(ReconcileError::Store {
                failed: outcome.failures,
                source,
            });
        }
        if self.config.verify_order {
            verify_order(store, &self.document_id)?;
        }
        debug!(
            created = outcome.created,
            updated = outcome.updated,
            deleted = outcome.deleted,
            "reconciliation pass committed"
        );
        Ok(ReconcileReport {
            origin,
            created: outcome.created,
            updated: outcome.updated,
            deleted: outcome.deleted,
            noop: false,
        })
    }

    fn check_bound(&self, before: &Doc) -> Result<(), ReconcileError> {
        for block in before.blocks() {
            let keys = std::iter::once(block.key()).chain(block.content().iter().map(|run| run.key()));
            for key in keys {
                if self.registry.lookup(key).is_none() && !self.orphans.contains(&key) {
                    return Err(ReconcileError::IdentityViolation {
                        node: key,
                        fault: IdentityFault::Unbound,
                    });
                }
            }
        }
        Ok(())
    }

    /// The id carried over to `node` from the old node mapped onto its position.
    fn claim(
        &self,
        candidate: Option<&Candidate>,
        node: NodeKey,
        visited: &mut HashSet<ExternalId>,
    ) -> Result<Option<ExternalId>, ReconcileError> {
        let Some(candidate) = candidate else {
            return Ok(None);
        };
        let id = self
            .registry
            .lookup(candidate.key)
            .cloned()
            .ok_or(ReconcileError::IdentityViolation {
                node: candidate.key,
                fault: IdentityFault::Unbound,
            })?;
        if !visited.insert(id.clone()) {
            return Err(ReconcileError::IdentityViolation {
                node,
                fault: IdentityFault::DuplicateVisit(id),
            });
        }
        Ok(Some(id))
    }

    fn plan(
        &self,
        after: &Doc,
        block_targets: &HashMap<usize, Candidate>,
        inline_targets: &HashMap<usize, Candidate>,
    ) -> Result<Plan, ReconcileError> {
        let mut plan = Plan::default();
        let mut visited_blocks = HashSet::new();
        let mut visited_inlines = HashSet::new();

        for entry in after.block_entries() {
            let block = entry.block;
            let row = BlockRow {
                document_id: self.document_id.clone(),
                kind: block.kind().name().to_string(),
                attrs: block.kind().attrs(),
                text: block.text(),
                order: entry.index as u64,
            };
            let target = match self.claim(block_targets.get(&entry.pos), block.key(), &mut visited_blocks)? {
                Some(id) => {
                    let changed = self.unreconciled.contains(&id)
                        || self.ledger.block(&id) != Some(&row);
                    if changed {
                        plan.batch.set(id.clone(), Draft::Block(row.clone()));
                    }
                    RowRef::Existing(id)
                }
                None => RowRef::Pending(plan.batch.add(Draft::Block(row.clone()))),
            };

            let mut pos = entry.pos + 1;
            for (order, inline) in block.content().iter().enumerate() {
                let candidate = inline_targets.get(&pos);
                self.plan_inline(&mut plan, inline, candidate, order as u64, &target, &mut visited_inlines)?;
                pos += inline.len();
            }

            plan.blocks.push(BlockPlan {
                node: block.key(),
                target,
                row,
            });
        }

        for id in self.ledger.inline_ids() {
            if visited_inlines.contains(id) {
                continue;
            }
            if let Some(entry) = self.ledger.inline(id) {
                for mark_id in &entry.mark_rows {
                    plan.batch.delete(Table::Marks, mark_id.clone());
                }
            }
            plan.batch.delete(Table::Inlines, id.clone());
            plan.reaped_inlines.push(id.clone());
        }
        for id in self.ledger.block_ids() {
            if !visited_blocks.contains(id) {
                plan.batch.delete(Table::Blocks, id.clone());
                plan.reaped_blocks.push(id.clone());
            }
        }
        for (table, id) in &self.pending_deletes {
            plan.batch.delete(*table, id.clone());
        }

        Ok(plan)
    }

    fn plan_inline(
        &self,
        plan: &mut Plan,
        inline: &Inline,
        candidate: Option<&Candidate>,
        order: u64,
        block: &RowRef,
        visited: &mut HashSet<ExternalId>,
    ) -> Result<(), ReconcileError> {
        let content = inline.text().to_string();
        let marks = inline.marks().clone();

        let (target, mark_slots) = match self.claim(candidate, inline.key(), visited)? {
            Some(id) => {
                let entry = self.ledger.inline(&id);
                let forced = self.unreconciled.contains(&id);
                let row_changed = forced
                    || match (entry, block) {
                        (Some(entry), RowRef::Existing(block_id)) => {
                            entry.row.block_id != *block_id
                                || entry.row.content != content
                                || entry.row.order != order
                        }
                        _ => true,
                    };
                if row_changed {
                    plan.batch.set(
                        id.clone(),
                        Draft::Inline {
                            block: block.clone(),
                            content: content.clone(),
                            order,
                        },
                    );
                }

                let rewrite_marks =
                    forced || entry.is_none_or(|entry| entry.row.content != content || entry.marks != marks);
                let mark_slots = rewrite_marks.then(|| {
                    for mark_id in entry.map(|entry| entry.mark_rows.as_slice()).unwrap_or_default() {
                        plan.batch.delete(Table::Marks, mark_id.clone());
                    }
                    add_marks(&mut plan.batch, &marks, RowRef::Existing(id.clone()))
                });
                (RowRef::Existing(id), mark_slots)
            }
            None => {
                let slot = plan.batch.add(Draft::Inline {
                    block: block.clone(),
                    content: content.clone(),
                    order,
                });
                let mark_slots = add_marks(&mut plan.batch, &marks, RowRef::Pending(slot));
                (RowRef::Pending(slot), Some(mark_slots))
            }
        };

        plan.inlines.push(InlinePlan {
            node: inline.key(),
            target,
            block: block.clone(),
            content,
            order,
            marks,
            mark_slots,
        });
        Ok(())
    }

    /// Applies the commit outcome to the registry and ledger.
    fn settle(&mut self, plan: Plan, outcome: &Outcome, after: &Doc) {
        let mut orphans = HashSet::new();

        for block in plan.blocks {
            let Some(id) = block.target.resolve(&outcome.slots) else {
                orphans.insert(block.node);
                continue;
            };
            if outcome.failed_sets.contains(&id) {
                self.unreconciled.insert(id.clone());
            } else {
                self.unreconciled.remove(&id);
                self.ledger.record_block(id.clone(), block.row);
            }
            self.registry.bind(block.node, id);
        }

        for inline in plan.inlines {
            let Some(id) = inline.target.resolve(&outcome.slots) else {
                orphans.insert(inline.node);
                continue;
            };
            let previous = self.ledger.inline(&id).cloned();
            let marks_written = inline
                .mark_slots
                .as_ref()
                .is_none_or(|slots| slots.iter().all(|slot| outcome.slots[*slot].is_some()));
            let block_id = inline.block.resolve(&outcome.slots);
            let failed = outcome.failed_sets.contains(&id) || !marks_written || block_id.is_none();
            if failed {
                self.unreconciled.insert(id.clone());
            } else {
                self.unreconciled.remove(&id);
            }

            let mark_rows = match &inline.mark_slots {
                Some(slots) => slots
                    .iter()
                    .filter_map(|slot| outcome.slots[*slot].clone())
                    .collect(),
                None => previous
                    .as_ref()
                    .map(|entry| entry.mark_rows.clone())
                    .unwrap_or_default(),
            };
            let row = match (block_id, previous) {
                (Some(block_id), _) => InlineRow {
                    block_id,
                    content: inline.content,
                    order: inline.order,
                },
                (None, Some(previous)) => previous.row,
                (None, None) => {
                    self.registry.bind(inline.node, id);
                    continue;
                }
            };
            self.ledger.record_inline(
                id.clone(),
                InlineEntry {
                    row,
                    marks: inline.marks,
                    mark_rows,
                },
            );
            self.registry.bind(inline.node, id);
        }

        for id in plan.reaped_inlines {
            self.ledger.forget_inline(&id);
            self.registry.release_id(&id);
            self.unreconciled.remove(&id);
        }
        for id in plan.reaped_blocks {
            self.ledger.forget_block(&id);
            self.registry.release_id(&id);
            self.unreconciled.remove(&id);
        }

        self.pending_deletes = outcome.failed_deletes.clone();
        self.orphans = orphans;
        let dropped = self.registry.retain_live(&after.node_keys());
        if dropped > 0 {
            debug!(dropped, "released registry entries of dead nodes");
        }
    }
}

fn add_marks(batch: &mut Batch, marks: &MarkSet, inline: RowRef) -> Vec<usize> {
    marks
        .iter()
        .map(|mark| {
            batch.add(Draft::Mark {
                inline: inline.clone(),
                mark: mark.clone(),
            })
        })
        .collect()
}

/// Maps old node positions into the new document. When two nodes land on
/// one position a surviving node beats a deleted one, otherwise the first
/// in document order wins. A node survives when the content right after its
/// start was kept, whatever `bias` places it at.
fn map_positions(
    entries: impl Iterator<Item = (usize, NodeKey)>,
    mapping: &Mapping,
    bias: Bias,
    size: usize,
) -> HashMap<usize, Candidate> {
    let mut targets: HashMap<usize, Candidate> = HashMap::new();
    for (pos, key) in entries {
        let mapped = mapping.map(pos, bias);
        if mapped.pos > size {
            warn!(pos, mapped = mapped.pos, size, "mapped position out of range");
            continue;
        }
        let candidate = Candidate {
            key,
            deleted: mapping.map(pos, Bias::End).deleted,
        };
        targets
            .entry(mapped.pos)
            .and_modify(|existing| {
                if existing.deleted && !candidate.deleted {
                    *existing = candidate;
                }
            })
            .or_insert(candidate);
    }
    targets
}

/// Checks that the blocks of `document_id`, and the inlines of each block,
/// carry orders `0..n` with no gaps.
pub fn verify_order<S: RowStore + ?Sized>(store: &S, document_id: &str) -> Result<(), ReconcileError> {
    let blocks = store::document_blocks(store, document_id).map_err(ReconcileError::Read)?;
    if !is_contiguous(blocks.iter().map(|(_, row)| row.order)) {
        return Err(ReconcileError::OrderCorrupted {
            parent: document_id.to_string(),
        });
    }
    for (block_id, _) in &blocks {
        let inlines = store::block_inlines(store, block_id).map_err(ReconcileError::Read)?;
        if !is_contiguous(inlines.iter().map(|(_, row)| row.order)) {
            return Err(ReconcileError::OrderCorrupted {
                parent: block_id.to_string(),
            });
        }
    }
    Ok(())
}

fn is_contiguous(orders: impl Iterator<Item = u64>) -> bool {
    orders.enumerate().all(|(index, order)| order == index as u64)
}
