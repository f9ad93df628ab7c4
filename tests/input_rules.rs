use fika_reconcile::store::document_blocks;
use fika_reconcile::{
    BlockKind, Doc, MemoryStore, ReplicaConfig, Session, SessionConfig, Transaction,
};

fn session(texts: &[&str]) -> Session<MemoryStore> {
    Session::create(
        MemoryStore::sequential(),
        SessionConfig::default(),
        Doc::from_paragraphs(texts),
    )
    .unwrap()
}

/// Types `keys` at the end of the last block.
fn type_at_end(session: &mut Session<MemoryStore>, keys: &str) {
    for key in keys.chars() {
        let entries = session.doc().block_entries();
        let Some(last) = entries.last() else {
            panic!("document has no blocks");
        };
        let caret = last.pos + 1 + last.block.len();
        session.handle_key(caret, key).unwrap();
    }
}

#[test]
fn test_heading_shortcut_then_text() {
    let mut session = session(&[""]);
    type_at_end(&mut session, "## Title");

    let block = &session.doc().blocks()[0];
    assert_eq!(block.kind(), &BlockKind::heading(2));
    assert_eq!(block.text(), "Title");

    let rows = document_blocks(session.store(), "doc").unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].0.as_str(), "b1");
    assert_eq!(rows[0].1.kind, "heading");
    assert_eq!(rows[0].1.attrs.get("level").map(String::as_str), Some("2"));
    assert_eq!(rows[0].1.text, "Title");
}

#[test]
fn test_ordered_shortcut_in_second_block() {
    let mut session = session(&["intro", ""]);
    type_at_end(&mut session, "3. item");

    let block = &session.doc().blocks()[1];
    assert_eq!(block.kind(), &BlockKind::OrderedItem { start: 3 });
    assert_eq!(block.text(), "item");
    let rows = document_blocks(session.store(), "doc").unwrap();
    assert_eq!(rows[1].1.kind, "ordered_item");
    assert_eq!(rows[1].1.attrs.get("start").map(String::as_str), Some("3"));
}

#[test]
fn test_bullet_needs_an_empty_prefix() {
    let mut session = session(&["x"]);
    type_at_end(&mut session, "- y");
    assert_eq!(session.doc().blocks()[0].kind(), &BlockKind::Paragraph);
    assert_eq!(session.doc().blocks()[0].text(), "x- y");
}

#[test]
fn test_edit_between_keys_cancels_the_shortcut() {
    let mut session = session(&[""]);
    type_at_end(&mut session, "#");
    // Someone else rewrites the block before the space arrives.
    let mut tx = Transaction::new(session.doc());
    tx.delete(1, 2).unwrap().insert_text(1, "a").unwrap();
    session.apply_local(tx).unwrap();

    type_at_end(&mut session, " ");
    assert_eq!(session.doc().blocks()[0].kind(), &BlockKind::Paragraph);
    assert_eq!(session.doc().blocks()[0].text(), "a ");
}

#[test]
fn test_shortcut_reaches_peers() {
    let mut alice = Session::create(
        MemoryStore::sequential(),
        SessionConfig::default(),
        Doc::from_paragraphs(&[""]),
    )
    .unwrap()
    .replicated(ReplicaConfig::for_peer(1))
    .unwrap();
    let mut bob = Session::create(MemoryStore::sequential(), SessionConfig::default(), Doc::empty())
        .unwrap()
        .replicated(ReplicaConfig::for_peer(2))
        .unwrap();

    type_at_end(&mut alice, "- milk");
    for change in alice.take_outbox() {
        for outcome in bob.receive_remote(change) {
            outcome.result.unwrap();
        }
    }

    assert_eq!(bob.doc().blocks()[0].kind(), &BlockKind::BulletItem);
    assert_eq!(bob.doc().blocks()[0].text(), "milk");
    let rows = document_blocks(bob.store(), "doc").unwrap();
    assert_eq!(rows[0].1.kind, "bullet_item");
}
