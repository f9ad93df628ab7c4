use fika_naive_oracle::apply_patches;
use fika_reconcile::{
    BlockKind, Doc, Mark, MarkKind, PatchTranslator, ReplicaConfig, ReplicaDoc, Transaction,
};
use proptest::collection::vec;
use proptest::prelude::*;
use proptest::sample::Index;
mod proptest_config;

#[derive(Clone, Debug)]
enum LocalEdit {
    Type(Index, String),
    Delete(Index, Index),
    Split(Index),
    Join(Index),
    InsertBlock(Index, String),
    RemoveBlock(Index),
    Bold(Index, Index),
    Unbold(Index, Index),
    Heading(Index),
}

fn local_edit() -> impl Strategy<Value = LocalEdit> {
    prop_oneof![
        (any::<Index>(), "[a-z]{1,3}").prop_map(|(at, text)| LocalEdit::Type(at, text)),
        (any::<Index>(), any::<Index>()).prop_map(|(a, b)| LocalEdit::Delete(a, b)),
        any::<Index>().prop_map(LocalEdit::Split),
        any::<Index>().prop_map(LocalEdit::Join),
        (any::<Index>(), "[a-z]{0,3}").prop_map(|(at, text)| LocalEdit::InsertBlock(at, text)),
        any::<Index>().prop_map(LocalEdit::RemoveBlock),
        (any::<Index>(), any::<Index>()).prop_map(|(a, b)| LocalEdit::Bold(a, b)),
        (any::<Index>(), any::<Index>()).prop_map(|(a, b)| LocalEdit::Unbold(a, b)),
        any::<Index>().prop_map(LocalEdit::Heading),
    ]
}

fn transaction(doc: &Doc, edit: &LocalEdit) -> Option<Transaction> {
    let content: Vec<usize> = doc
        .block_entries()
        .iter()
        .flat_map(|entry| entry.pos + 1..=entry.pos + 1 + entry.block.len())
        .collect();
    let blocks = doc.block_positions();
    let span = |a: &Index, b: &Index| {
        let (a, b) = (*a.get(&content), *b.get(&content));
        (a.min(b), a.max(b))
    };
    let mut tx = Transaction::new(doc);
    let result = match edit {
        LocalEdit::Type(at, text) => tx.insert_text(*at.get(&content), text).map(drop),
        LocalEdit::Delete(a, b) => {
            let (from, to) = span(a, b);
            tx.delete(from, to).map(drop)
        }
        LocalEdit::Split(at) => tx.split_block(*at.get(&content)).map(drop),
        LocalEdit::Join(block) => match block.index(blocks.len()) {
            0 => return None,
            index => tx.join_backward(blocks[index] + 1).map(drop),
        },
        LocalEdit::InsertBlock(at, text) => tx
            .insert_block(at.index(blocks.len() + 1), BlockKind::Paragraph, text)
            .map(drop),
        LocalEdit::RemoveBlock(block) if blocks.len() > 1 => {
            tx.remove_block(block.index(blocks.len())).map(drop)
        }
        LocalEdit::RemoveBlock(_) => return None,
        LocalEdit::Bold(a, b) => {
            let (from, to) = span(a, b);
            tx.add_mark(from, to, Mark::new(MarkKind::Bold)).map(drop)
        }
        LocalEdit::Unbold(a, b) => {
            let (from, to) = span(a, b);
            tx.remove_mark(from, to, MarkKind::Bold).map(drop)
        }
        LocalEdit::Heading(block) => tx
            .set_block_kind(*block.get(&blocks), BlockKind::heading(2))
            .map(drop),
    };
    result.ok().map(|_| tx)
}

fn seeded(doc: &Doc) -> ReplicaDoc {
    let mut replica = ReplicaDoc::new(ReplicaConfig::default());
    replica
        .apply_local_change(&PatchTranslator::default().seed(doc))
        .unwrap();
    replica
}

#[test]
fn test_typing_round_trip() {
    let translator = PatchTranslator::new(false);
    let doc = Doc::from_paragraphs(&["Hello", "World"]);
    let mut replica = seeded(&doc);

    let mut tx = Transaction::new(&doc);
    tx.insert_text(6, ", there").unwrap();
    let changes = translator.outbound(&doc, tx.steps()).unwrap();
    let committed = replica.apply_local_change(&changes).unwrap();
    let edit = translator.inbound(&doc, &committed.delivery).unwrap();

    assert!(edit.after.structurally_eq(tx.doc()));
    assert_eq!(replica.snapshot().text(), "Hello, there\nWorld");
}

#[test]
fn test_bold_inside_bold_keeps_one_run() {
    let translator = PatchTranslator::new(false);
    let doc = Doc::from_paragraphs(&["abcdef"]);
    let mut replica = seeded(&doc);

    let mut tx = Transaction::new(&doc);
    tx.add_mark(2, 6, Mark::new(MarkKind::Bold))
        .unwrap()
        .insert_text(4, "XY")
        .unwrap();
    let changes = translator.outbound(&doc, tx.steps()).unwrap();
    let committed = replica.apply_local_change(&changes).unwrap();
    let edit = translator.inbound(&doc, &committed.delivery).unwrap();

    assert!(edit.after.structurally_eq(tx.doc()));
    assert_eq!(edit.after.blocks()[0].content().len(), 3);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(proptest_config::cases()))]

    #[test]
    fn prop_outbound_then_inbound_reproduces_local_tree(
        texts in vec("[a-z]{0,6}", 1..4),
        edits in vec(local_edit(), 1..12),
    ) {
        let translator = PatchTranslator::new(false);
        let mut doc = Doc::from_paragraphs(&texts);
        let mut replica = seeded(&doc);

        for edit in &edits {
            let Some(tx) = transaction(&doc, edit) else { continue };
            let changes = translator.outbound(&doc, tx.steps()).unwrap();
            let committed = replica.apply_local_change(&changes).unwrap();

            let delivery = &committed.delivery;
            prop_assert_eq!(
                &apply_patches(&delivery.before, &delivery.patches),
                &delivery.after.elems
            );

            let translated = translator.inbound(&doc, delivery).unwrap();
            prop_assert!(
                translated.after.structurally_eq(tx.doc()),
                "local {} vs translated {}",
                tx.doc(),
                translated.after
            );
            doc = translated.after;
        }
    }
}
