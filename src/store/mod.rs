//! Normalized row store.
//!
//! Documents persist as four tables: documents, blocks, inlines and marks. The
//! reconciler only talks to a store through [`RowStore`]; [`MemoryStore`]
//! is the reference implementation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[cfg(feature = "storage")]
pub mod snapshot;

/// Store-assigned row key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalId(String);

impl ExternalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExternalId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Documents,
    Blocks,
    Inlines,
    Marks,
}

impl Table {
    pub const ALL: [Table; 4] = [Table::Documents, Table::Blocks, Table::Inlines, Table::Marks];

    pub fn name(self) -> &'static str {
        match self {
            Table::Documents => "documents",
            Table::Blocks => "blocks",
            Table::Inlines => "inlines",
            Table::Marks => "marks",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRow {
    pub document_id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRow {
    pub document_id: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, String>,
    pub text: String,
    pub order: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineRow {
    pub block_id: ExternalId,
    pub content: String,
    pub order: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkRow {
    pub inline_id: ExternalId,
    pub kind: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "table", rename_all = "snake_case")]
pub enum Row {
    Document(DocumentRow),
    Block(BlockRow),
    Inline(InlineRow),
    Mark(MarkRow),
}

impl Row {
    pub fn table(&self) -> Table {
        match self {
            Row::Document(_) => Table::Documents,
            Row::Block(_) => Table::Blocks,
            Row::Inline(_) => Table::Inlines,
            Row::Mark(_) => Table::Marks,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowChange {
    pub table: Table,
    pub id: ExternalId,
    pub kind: ChangeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(u64);

pub type Listener = Box<dyn FnMut(&RowChange)>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("row {id} not found in {table}")]
    NotFound { table: Table, id: ExternalId },
    #[error("row for {found} written to {expected}")]
    TableMismatch { expected: Table, found: Table },
    #[error("write to {table} rejected: {reason}")]
    Rejected { table: Table, reason: String },
}

pub trait RowStore {
    fn add_row(&mut self, table: Table, row: Row) -> Result<ExternalId, StoreError>;
    fn set_row(&mut self, table: Table, id: &ExternalId, row: Row) -> Result<(), StoreError>;
    fn del_row(&mut self, table: Table, id: &ExternalId) -> Result<(), StoreError>;
    fn get_row(&self, table: Table, id: &ExternalId) -> Result<Option<Row>, StoreError>;
    fn rows(&self, table: Table) -> Result<Vec<(ExternalId, Row)>, StoreError>;
    fn subscribe(&mut self, listener: Listener) -> ListenerId;
    fn unsubscribe(&mut self, id: ListenerId) -> bool;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdStrategy {
    /// Random v4 UUIDs.
    #[default]
    Uuid,
    /// `b1, b2, ...` / `i1, ...` / `m1, ...` per table.
    Sequential,
}

#[derive(Default)]
pub struct MemoryStore {
    strategy: IdStrategy,
    tables: BTreeMap<Table, BTreeMap<ExternalId, Row>>,
    counters: BTreeMap<Table, u64>,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener: u64,
    mutations: u64,
    faults: BTreeMap<Table, usize>,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("strategy", &self.strategy)
            .field("tables", &self.tables)
            .field("listeners", &self.listeners.len())
            .field("mutations", &self.mutations)
            .finish()
    }
}

impl MemoryStore {
    pub fn new(strategy: IdStrategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    pub fn sequential() -> Self {
        Self::new(IdStrategy::Sequential)
    }

    pub fn strategy(&self) -> IdStrategy {
        self.strategy
    }

    /// Number of successful writes since creation.
    pub fn mutation_count(&self) -> u64 {
        self.mutations
    }

    pub fn len(&self, table: Table) -> usize {
        self.tables.get(&table).map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.tables.values().all(BTreeMap::is_empty)
    }

    /// Rejects the next `count` writes to `table`.
    pub fn fail_next_writes(&mut self, table: Table, count: usize) {
        self.faults.insert(table, count);
    }

    #[cfg(feature = "storage")]
    pub(crate) fn counters(&self) -> &BTreeMap<Table, u64> {
        &self.counters
    }

    #[cfg(feature = "storage")]
    pub(crate) fn restore(
        strategy: IdStrategy,
        tables: BTreeMap<Table, BTreeMap<ExternalId, Row>>,
        counters: BTreeMap<Table, u64>,
    ) -> Self {
        Self {
            strategy,
            tables,
            counters,
            ..Self::default()
        }
    }

    fn check_write(&mut self, table: Table, row: Option<&Row>) -> Result<(), StoreError> {
        if let Some(row) = row
            && row.table() != table
        {
            return Err(StoreError::TableMismatch {
                expected: table,
                found: row.table(),
            });
        }
        if let Some(remaining) = self.faults.get_mut(&table)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(StoreError::Rejected {
                table,
                reason: "injected fault".to_string(),
            });
        }
        Ok(())
    }

    fn allocate_id(&mut self, table: Table) -> ExternalId {
        match self.strategy {
            IdStrategy::Uuid => ExternalId::new(uuid::Uuid::new_v4().to_string()),
            IdStrategy::Sequential => {
                let counter = self.counters.entry(table).or_insert(0);
                *counter += 1;
                let prefix = match table {
                    Table::Documents => 'd',
                    Table::Blocks => 'b',
                    Table::Inlines => 'i',
                    Table::Marks => 'm',
                };
                ExternalId::new(format!("{prefix}{counter}"))
            }
        }
    }

    fn notify(&mut self, table: Table, id: &ExternalId, kind: ChangeKind) {
        self.mutations += 1;
        let change = RowChange {
            table,
            id: id.clone(),
            kind,
        };
        for (_, listener) in &mut self.listeners {
            listener(&change);
        }
    }
}

impl RowStore for MemoryStore {
    fn add_row(&mut self, table: Table, row: Row) -> Result<ExternalId, StoreError> {
        self.check_write(table, Some(&row))?;
        let id = self.allocate_id(table);
        self.tables.entry(table).or_default().insert(id.clone(), row);
        self.notify(table, &id, ChangeKind::Added);
        Ok(id)
    }

    fn set_row(&mut self, table: Table, id: &ExternalId, row: Row) -> Result<(), StoreError> {
        self.check_write(table, Some(&row))?;
        let slot = self
            .tables
            .get_mut(&table)
            .and_then(|rows| rows.get_mut(id))
            .ok_or_else(|| StoreError::NotFound {
                table,
                id: id.clone(),
            })?;
        *slot = row;
        self.notify(table, id, ChangeKind::Updated);
        Ok(())
    }

    fn del_row(&mut self, table: Table, id: &ExternalId) -> Result<(), StoreError> {
        self.check_write(table, None)?;
        self.tables
            .get_mut(&table)
            .and_then(|rows| rows.remove(id))
            .ok_or_else(|| StoreError::NotFound {
                table,
                id: id.clone(),
            })?;
        self.notify(table, id, ChangeKind::Deleted);
        Ok(())
    }

    fn get_row(&self, table: Table, id: &ExternalId) -> Result<Option<Row>, StoreError> {
        Ok(self.tables.get(&table).and_then(|rows| rows.get(id)).cloned())
    }

    fn rows(&self, table: Table) -> Result<Vec<(ExternalId, Row)>, StoreError> {
        Ok(self
            .tables
            .get(&table)
            .map(|rows| {
                rows.iter()
                    .map(|(id, row)| (id.clone(), row.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn subscribe(&mut self, listener: Listener) -> ListenerId {
        self.next_listener += 1;
        let id = ListenerId(self.next_listener);
        self.listeners.push((id, listener));
        id
    }

    fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
        self.listeners.len() != before
    }
}

/// The row describing `document_id`, if one was written.
pub fn document_row<S: RowStore + ?Sized>(
    store: &S,
    document_id: &str,
) -> Result<Option<(ExternalId, DocumentRow)>, StoreError> {
    Ok(store
        .rows(Table::Documents)?
        .into_iter()
        .find_map(|(id, row)| match row {
            Row::Document(document) if document.document_id == document_id => Some((id, document)),
            _ => None,
        }))
}

/// Block rows of `document_id`, in `order`.
pub fn document_blocks<S: RowStore + ?Sized>(
    store: &S,
    document_id: &str,
) -> Result<Vec<(ExternalId, BlockRow)>, StoreError> {
    let mut blocks: Vec<(ExternalId, BlockRow)> = store
        .rows(Table::Blocks)?
        .into_iter()
        .filter_map(|(id, row)| match row {
            Row::Block(block) if block.document_id == document_id => Some((id, block)),
            _ => None,
        })
        .collect();
    blocks.sort_by(|a, b| a.1.order.cmp(&b.1.order).then_with(|| a.0.cmp(&b.0)));
    Ok(blocks)
}

/// Inline rows of `block_id`, in `order`.
pub fn block_inlines<S: RowStore + ?Sized>(
    store: &S,
    block_id: &ExternalId,
) -> Result<Vec<(ExternalId, InlineRow)>, StoreError> {
    let mut inlines: Vec<(ExternalId, InlineRow)> = store
        .rows(Table::Inlines)?
        .into_iter()
        .filter_map(|(id, row)| match row {
            Row::Inline(inline) if &inline.block_id == block_id => Some((id, inline)),
            _ => None,
        })
        .collect();
    inlines.sort_by(|a, b| a.1.order.cmp(&b.1.order).then_with(|| a.0.cmp(&b.0)));
    Ok(inlines)
}

/// Mark rows of `inline_id`, sorted by kind.
pub fn inline_marks<S: RowStore + ?Sized>(
    store: &S,
    inline_id: &ExternalId,
) -> Result<Vec<(ExternalId, MarkRow)>, StoreError> {
    let mut marks: Vec<(ExternalId, MarkRow)> = store
        .rows(Table::Marks)?
        .into_iter()
        .filter_map(|(id, row)| match row {
            Row::Mark(mark) if &mark.inline_id == inline_id => Some((id, mark)),
            _ => None,
        })
        .collect();
    marks.sort_by(|a, b| a.1.kind.cmp(&b.1.kind).then_with(|| a.0.cmp(&b.0)));
    Ok(marks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn block(order: u64) -> Row {
        Row::Block(BlockRow {
            document_id: "doc".to_string(),
            kind: "paragraph".to_string(),
            attrs: BTreeMap::new(),
            text: String::new(),
            order,
        })
    }

    #[test]
    fn test_sequential_ids_are_per_table() {
        let mut store = MemoryStore::sequential();
        assert_eq!(store.add_row(Table::Blocks, block(0)).unwrap().as_str(), "b1");
        assert_eq!(store.add_row(Table::Blocks, block(1)).unwrap().as_str(), "b2");
        let inline = Row::Inline(InlineRow {
            block_id: "b1".into(),
            content: "x".to_string(),
            order: 0,
        });
        assert_eq!(store.add_row(Table::Inlines, inline).unwrap().as_str(), "i1");
    }

    #[test]
    fn test_uuid_ids_are_unique() {
        let mut store = MemoryStore::new(IdStrategy::Uuid);
        let a = store.add_row(Table::Blocks, block(0)).unwrap();
        let b = store.add_row(Table::Blocks, block(1)).unwrap();
        assert_ne!(a, b);
        assert!(uuid::Uuid::parse_str(a.as_str()).is_ok());
    }

    #[test]
    fn test_table_mismatch_is_rejected() {
        let mut store = MemoryStore::sequential();
        let err = store.add_row(Table::Inlines, block(0)).unwrap_err();
        assert_eq!(
            err,
            StoreError::TableMismatch {
                expected: Table::Inlines,
                found: Table::Blocks,
            }
        );
        assert!(store.is_empty());
    }

    #[test]
    fn test_set_and_delete_missing_rows() {
        let mut store = MemoryStore::sequential();
        let missing = ExternalId::new("b9");
        assert!(matches!(
            store.set_row(Table::Blocks, &missing, block(0)),
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            store.del_row(Table::Blocks, &missing),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn test_listeners_observe_changes() {
        let mut store = MemoryStore::sequential();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        let listener = store.subscribe(Box::new(move |change: &RowChange| {
            sink.borrow_mut().push(change.kind);
        }));
        let id = store.add_row(Table::Blocks, block(0)).unwrap();
        store.set_row(Table::Blocks, &id, block(1)).unwrap();
        store.del_row(Table::Blocks, &id).unwrap();
        assert!(store.unsubscribe(listener));
        store.add_row(Table::Blocks, block(2)).unwrap();

        assert_eq!(
            *seen.borrow(),
            vec![ChangeKind::Added, ChangeKind::Updated, ChangeKind::Deleted]
        );
        assert_eq!(store.mutation_count(), 4);
    }

    #[test]
    fn test_injected_faults_are_consumed() {
        let mut store = MemoryStore::sequential();
        store.fail_next_writes(Table::Blocks, 1);
        assert!(matches!(
            store.add_row(Table::Blocks, block(0)),
            Err(StoreError::Rejected { .. })
        ));
        assert!(store.add_row(Table::Blocks, block(0)).is_ok());
        assert_eq!(store.mutation_count(), 1);
    }

    #[test]
    fn test_document_blocks_sorted_by_order() {
        let mut store = MemoryStore::sequential();
        store.add_row(Table::Blocks, block(2)).unwrap();
        store.add_row(Table::Blocks, block(0)).unwrap();
        let mut other = block(1);
        if let Row::Block(row) = &mut other {
            row.document_id = "other".to_string();
        }
        store.add_row(Table::Blocks, other).unwrap();

        let ids: Vec<String> = document_blocks(&store, "doc")
            .unwrap()
            .into_iter()
            .map(|(id, _)| id.to_string())
            .collect();
        assert_eq!(ids, vec!["b2", "b1"]);
    }

    #[test]
    fn test_document_row_is_found_by_document_id() {
        let mut store = MemoryStore::sequential();
        for (document_id, title) in [("notes", "Notes"), ("doc", "Untitled")] {
            let row = Row::Document(DocumentRow {
                document_id: document_id.to_string(),
                title: title.to_string(),
            });
            store.add_row(Table::Documents, row).unwrap();
        }
        let (id, row) = document_row(&store, "doc").unwrap().unwrap();
        assert_eq!(id.as_str(), "d2");
        assert_eq!(row.title, "Untitled");
        assert!(document_row(&store, "missing").unwrap().is_none());
    }

    #[test]
    fn test_row_serializes_with_table_tag() {
        let json = serde_json::to_value(block(3)).unwrap();
        assert_eq!(json["table"], "block");
        assert_eq!(json["order"], 3);
    }
}
