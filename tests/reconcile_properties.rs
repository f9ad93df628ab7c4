use fika_naive_oracle::{dangling_rows, order_is_contiguous, project_doc, project_store};
use fika_reconcile::{
    BlockKind, Doc, Edit, EditOrigin, ExternalId, Mark, MarkKind, MemoryStore, ReconcileConfig,
    Reconciler, RowStore, Table, Transaction,
};
use proptest::collection::vec;
use proptest::prelude::*;
use proptest::sample::Index;
mod proptest_config;

const DOC: &str = "doc";

#[derive(Clone, Debug)]
enum EditSpec {
    Type { at: Index, text: String },
    Delete { from: Index, to: Index },
    Split { at: Index },
    Join { block: Index },
    InsertBlock { block: Index, text: String },
    RemoveBlock { block: Index },
    Mark { from: Index, to: Index, kind: u8 },
    Unmark { from: Index, to: Index, kind: u8 },
    SetKind { block: Index, kind: u8 },
}

fn mark_kind(kind: u8) -> MarkKind {
    match kind % 3 {
        0 => MarkKind::Bold,
        1 => MarkKind::Italic,
        _ => MarkKind::Code,
    }
}

fn block_kind(kind: u8) -> BlockKind {
    match kind % 4 {
        0 => BlockKind::Paragraph,
        1 => BlockKind::heading(1 + kind % 3),
        2 => BlockKind::BulletItem,
        _ => BlockKind::OrderedItem { start: 1 },
    }
}

fn edit_spec() -> impl Strategy<Value = EditSpec> {
    let text = "[a-z ]{1,4}";
    prop_oneof![
        (any::<Index>(), text).prop_map(|(at, text)| EditSpec::Type { at, text }),
        (any::<Index>(), any::<Index>()).prop_map(|(from, to)| EditSpec::Delete { from, to }),
        any::<Index>().prop_map(|at| EditSpec::Split { at }),
        any::<Index>().prop_map(|block| EditSpec::Join { block }),
        (any::<Index>(), text).prop_map(|(block, text)| EditSpec::InsertBlock { block, text }),
        any::<Index>().prop_map(|block| EditSpec::RemoveBlock { block }),
        (any::<Index>(), any::<Index>(), any::<u8>())
            .prop_map(|(from, to, kind)| EditSpec::Mark { from, to, kind }),
        (any::<Index>(), any::<Index>(), any::<u8>())
            .prop_map(|(from, to, kind)| EditSpec::Unmark { from, to, kind }),
        (any::<Index>(), any::<u8>()).prop_map(|(block, kind)| EditSpec::SetKind { block, kind }),
    ]
}

fn formatting_spec() -> impl Strategy<Value = EditSpec> {
    prop_oneof![
        (any::<Index>(), any::<Index>(), any::<u8>())
            .prop_map(|(from, to, kind)| EditSpec::Mark { from, to, kind }),
        (any::<Index>(), any::<Index>(), any::<u8>())
            .prop_map(|(from, to, kind)| EditSpec::Unmark { from, to, kind }),
        (any::<Index>(), any::<u8>()).prop_map(|(block, kind)| EditSpec::SetKind { block, kind }),
    ]
}

fn initial_doc() -> impl Strategy<Value = Doc> {
    vec("[a-z ]{0,8}", 1..5).prop_map(|texts| Doc::from_paragraphs(&texts))
}

/// Every position that lies inside some block's content.
fn content_positions(doc: &Doc) -> Vec<usize> {
    doc.block_entries()
        .iter()
        .flat_map(|entry| entry.pos + 1..=entry.pos + 1 + entry.block.len())
        .collect()
}

/// Builds the edit, or `None` when the generated op does not fit the document.
fn build(doc: &Doc, spec: &EditSpec) -> Option<Edit> {
    let positions = content_positions(doc);
    let blocks = doc.block_positions();
    let mut tx = Transaction::new(doc);
    let ordered = |a: &Index, b: &Index| {
        let a = *a.get(&positions);
        let b = *b.get(&positions);
        (a.min(b), a.max(b))
    };
    let result = match spec {
        EditSpec::Type { at, text } => tx.insert_text(*at.get(&positions), text).map(drop),
        EditSpec::Delete { from, to } => {
            let (from, to) = ordered(from, to);
            tx.delete(from, to).map(drop)
        }
        EditSpec::Split { at } => tx.split_block(*at.get(&positions)).map(drop),
        EditSpec::Join { block } => {
            let index = block.index(blocks.len());
            if index == 0 {
                return None;
            }
            tx.join_backward(blocks[index] + 1).map(drop)
        }
        EditSpec::InsertBlock { block, text } => tx
            .insert_block(block.index(blocks.len() + 1), BlockKind::Paragraph, text)
            .map(drop),
        EditSpec::RemoveBlock { block } => {
            if blocks.len() < 2 {
                return None;
            }
            tx.remove_block(block.index(blocks.len())).map(drop)
        }
        EditSpec::Mark { from, to, kind } => {
            let (from, to) = ordered(from, to);
            tx.add_mark(from, to, Mark::new(mark_kind(*kind))).map(drop)
        }
        EditSpec::Unmark { from, to, kind } => {
            let (from, to) = ordered(from, to);
            tx.remove_mark(from, to, mark_kind(*kind)).map(drop)
        }
        EditSpec::SetKind { block, kind } => tx
            .set_block_kind(*block.get(&blocks), block_kind(*kind))
            .map(drop),
    };
    result.ok()?;
    Some(tx.finish())
}

fn run(doc: Doc, specs: &[EditSpec], origin: EditOrigin) -> (Reconciler, MemoryStore, Doc) {
    let mut store = MemoryStore::sequential();
    let mut reconciler = Reconciler::new(DOC, ReconcileConfig::default());
    reconciler.bootstrap(&mut store, &doc).unwrap();
    let mut doc = doc;
    for spec in specs {
        if let Some(edit) = build(&doc, spec) {
            reconciler.reconcile(&mut store, &edit, origin).unwrap();
            doc = edit.after;
        }
    }
    (reconciler, store, doc)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(proptest_config::cases()))]

    #[test]
    fn prop_store_tracks_tree(doc in initial_doc(), specs in vec(edit_spec(), 0..24)) {
        let mut store = MemoryStore::sequential();
        let mut reconciler = Reconciler::new(DOC, ReconcileConfig::default());
        reconciler.bootstrap(&mut store, &doc).unwrap();
        let mut doc = doc;
        for spec in &specs {
            let Some(edit) = build(&doc, spec) else { continue };
            reconciler.reconcile(&mut store, &edit, EditOrigin::Local).unwrap();
            doc = edit.after;

            prop_assert_eq!(project_store(&store, DOC).unwrap(), project_doc(&doc));
            prop_assert!(order_is_contiguous(&store).unwrap());
            prop_assert_eq!(dangling_rows(&store).unwrap(), 0);
            // Every live node is bound, and nothing else is.
            prop_assert_eq!(reconciler.registry().len(), doc.node_keys().len());
            for key in doc.node_keys() {
                prop_assert!(reconciler.id_of(key).is_some());
            }
        }
    }

    #[test]
    fn prop_noop_edits_write_nothing(doc in initial_doc(), specs in vec(edit_spec(), 0..8)) {
        let (mut reconciler, mut store, doc) = run(doc, &specs, EditOrigin::Local);
        let before = store.mutation_count();
        let report = reconciler
            .reconcile(&mut store, &Edit::identity(&doc), EditOrigin::Local)
            .unwrap();
        prop_assert!(report.noop);
        prop_assert_eq!(store.mutation_count(), before);
    }

    #[test]
    fn prop_formatting_keeps_block_ids(doc in initial_doc(), specs in vec(formatting_spec(), 0..16)) {
        let mut store = MemoryStore::sequential();
        let mut reconciler = Reconciler::new(DOC, ReconcileConfig::default());
        reconciler.bootstrap(&mut store, &doc).unwrap();
        let ids: Vec<ExternalId> = doc
            .blocks()
            .iter()
            .map(|block| reconciler.id_of(block.key()).cloned().unwrap())
            .collect();

        let mut doc = doc;
        for spec in &specs {
            let Some(edit) = build(&doc, spec) else { continue };
            reconciler.reconcile(&mut store, &edit, EditOrigin::Local).unwrap();
            doc = edit.after;
            let current: Vec<ExternalId> = doc
                .blocks()
                .iter()
                .map(|block| reconciler.id_of(block.key()).cloned().unwrap())
                .collect();
            prop_assert_eq!(&current, &ids);
        }
    }

    #[test]
    fn prop_origin_does_not_change_rows(doc in initial_doc(), specs in vec(edit_spec(), 0..16)) {
        let (_, local, _) = run(doc.clone(), &specs, EditOrigin::Local);
        let (_, remote, _) = run(doc, &specs, EditOrigin::Remote);
        prop_assert_eq!(
            local.rows(Table::Blocks).unwrap(),
            remote.rows(Table::Blocks).unwrap()
        );
        prop_assert_eq!(
            local.rows(Table::Inlines).unwrap(),
            remote.rows(Table::Inlines).unwrap()
        );
        prop_assert_eq!(
            local.rows(Table::Marks).unwrap(),
            remote.rows(Table::Marks).unwrap()
        );
    }
}
