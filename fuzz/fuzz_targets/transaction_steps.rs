#![no_main]

use fika_reconcile::{
    Doc, EditOrigin, MemoryStore, ReconcileConfig, Reconciler, Step, Transaction,
};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(steps) = serde_json::from_slice::<Vec<Step>>(data) else {
        return;
    };
    let doc = Doc::from_paragraphs(&["ab", "cd"]);
    let mut store = MemoryStore::sequential();
    let mut reconciler = Reconciler::new("doc", ReconcileConfig::default());
    reconciler.bootstrap(&mut store, &doc).expect("bootstrap");

    let mut tx = Transaction::new(&doc);
    for step in steps {
        let _ = tx.step(step);
    }
    let edit = tx.finish();
    reconciler
        .reconcile(&mut store, &edit, EditOrigin::Local)
        .expect("valid steps reconcile");
    assert_eq!(
        fika_naive_oracle::project_store(&store, "doc").expect("rows"),
        fika_naive_oracle::project_doc(&edit.after)
    );
});
