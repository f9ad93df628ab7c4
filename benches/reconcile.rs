use criterion::{BatchSize, Criterion, black_box, criterion_group, criterion_main};
use fika_reconcile::{
    Doc, EditOrigin, MemoryStore, PatchTranslator, ReconcileConfig, Reconciler, ReplicaConfig,
    ReplicaDoc, Transaction,
};

fn long_doc(blocks: usize) -> Doc {
    let texts: Vec<String> = (0..blocks)
        .map(|i| format!("paragraph {i} with a little bit of text"))
        .collect();
    Doc::from_paragraphs(&texts)
}

fn bench_keystroke(c: &mut Criterion) {
    let doc = long_doc(1_000);
    let caret = doc.block_positions()[500] + 3;

    c.bench_function("reconcile_keystroke_1k_blocks", |b| {
        b.iter_batched(
            || {
                let mut store = MemoryStore::sequential();
                let mut reconciler = Reconciler::new("doc", ReconcileConfig::default());
                let _ = reconciler.bootstrap(&mut store, &doc);
                let mut tx = Transaction::new(&doc);
                let _ = tx.insert_text(caret, "x");
                (reconciler, store, tx.finish())
            },
            |(mut reconciler, mut store, edit)| {
                black_box(reconciler.reconcile(&mut store, &edit, EditOrigin::Local))
            },
            BatchSize::LargeInput,
        )
    });
}

fn bench_bootstrap(c: &mut Criterion) {
    let doc = long_doc(1_000);
    c.bench_function("bootstrap_1k_blocks", |b| {
        b.iter(|| {
            let mut store = MemoryStore::sequential();
            let mut reconciler = Reconciler::new("doc", ReconcileConfig::default());
            let result = reconciler.bootstrap(&mut store, black_box(&doc));
            black_box(result)
        })
    });
}

fn bench_round_trip(c: &mut Criterion) {
    let doc = long_doc(200);
    let translator = PatchTranslator::default();
    let mut replica = ReplicaDoc::new(ReplicaConfig::default());
    if replica.apply_local_change(&translator.seed(&doc)).is_err() {
        return;
    }
    let caret = doc.block_positions()[100] + 3;

    c.bench_function("patch_round_trip_200_blocks", |b| {
        b.iter(|| {
            let mut tx = Transaction::new(&doc);
            let _ = tx.insert_text(caret, "x");
            let mut working = replica.clone();
            let Ok(changes) = translator.outbound(&doc, tx.steps()) else {
                return;
            };
            if let Ok(committed) = working.apply_local_change(&changes) {
                black_box(translator.inbound(&doc, &committed.delivery).is_ok());
            }
        })
    });
}

criterion_group!(benches, bench_keystroke, bench_bootstrap, bench_round_trip);
criterion_main!(benches);
