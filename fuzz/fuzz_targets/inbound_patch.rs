#![no_main]

use fika_naive_oracle::apply_patches;
use fika_reconcile::sync::{Delivery, FlatElem, Patch, ReplicaSnapshot};
use fika_reconcile::{BlockKind, Doc, Mark, MarkKind, MarkSet, PatchTranslator};
use libfuzzer_sys::fuzz_target;

fn patch(chunk: &[u8], len: usize) -> Patch {
    let index = usize::from(chunk[1]) % (len + 1);
    let size = usize::from(chunk[2] % 4);
    match chunk[0] % 5 {
        0 => Patch::Insert {
            index,
            elems: (0..size.max(1))
                .map(|i| match chunk[3] % 4 {
                    0 if i == 0 => FlatElem::Marker(BlockKind::Paragraph),
                    _ => FlatElem::Char {
                        ch: char::from(b'a' + chunk[3] % 26),
                        marks: MarkSet::new(),
                    },
                })
                .collect(),
        },
        1 => Patch::Delete {
            index,
            length: size,
        },
        2 => Patch::Mark {
            start: index,
            end: index + size,
            mark: Mark::new(MarkKind::Bold),
        },
        3 => Patch::Unmark {
            start: index,
            end: index + size,
            kind: MarkKind::Bold,
        },
        _ => Patch::SetBlock {
            index,
            kind: BlockKind::heading(chunk[3] % 7),
        },
    }
}

fuzz_target!(|data: &[u8]| {
    let doc = Doc::from_paragraphs(&["Hello", "", "world"]);
    let before = ReplicaSnapshot::from_doc(&doc);
    let mut patches = Vec::new();
    let mut after = before.clone();
    for chunk in data.chunks_exact(4) {
        let next = patch(chunk, after.len());
        after = ReplicaSnapshot {
            elems: apply_patches(&after, std::slice::from_ref(&next)),
        };
        patches.push(next);
    }
    let delivery = Delivery {
        peer: 2,
        seq: 1,
        patches,
        before,
        after: after.clone(),
    };

    // With resync on, translation never fails and always lands on the
    // replica's view.
    let edit = PatchTranslator::new(true)
        .inbound(&doc, &delivery)
        .expect("resync never fails");
    assert!(edit.after.structurally_eq(&after.to_doc()));

    let _ = PatchTranslator::new(false).inbound(&doc, &delivery);
});
