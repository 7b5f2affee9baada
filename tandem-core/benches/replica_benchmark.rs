use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tandem_core::codec;
use tandem_core::{TextReplica, Update};
use uuid::Uuid;

fn seeded_doc(chars: usize) -> TextReplica {
    let mut doc = TextReplica::new(Uuid::new_v4());
    for i in 0..chars {
        let ch = (b'a' + (i % 26) as u8) as char;
        doc.insert_at(i, ch);
    }
    doc
}

fn bench_local_insert(c: &mut Criterion) {
    c.bench_function("local_insert_append_1k", |b| {
        b.iter(|| {
            let mut doc = TextReplica::new(Uuid::new_v4());
            for i in 0..1000 {
                doc.insert_at(black_box(i), 'x');
            }
            black_box(doc.len());
        })
    });
}

fn bench_remote_apply(c: &mut Criterion) {
    let mut source = TextReplica::new(Uuid::new_v4());
    let updates: Vec<Update> = source.insert_str_at(0, &"y".repeat(1000));

    c.bench_function("remote_apply_1k", |b| {
        b.iter(|| {
            let mut doc = TextReplica::new(Uuid::new_v4());
            for update in &updates {
                doc.apply_remote(black_box(update)).unwrap();
            }
            black_box(doc.len());
        })
    });
}

fn bench_render(c: &mut Criterion) {
    let doc = seeded_doc(2000);
    c.bench_function("render_2k", |b| {
        b.iter(|| black_box(doc.render()))
    });
}

fn bench_update_encode(c: &mut Criterion) {
    let mut doc = TextReplica::new(Uuid::new_v4());
    let update = doc.insert_at(0, 'z');

    c.bench_function("update_encode", |b| {
        b.iter(|| black_box(codec::encode_update(black_box(&update)).unwrap()))
    });
}

fn bench_snapshot_encode(c: &mut Criterion) {
    let doc = seeded_doc(2000);
    c.bench_function("snapshot_encode_2k", |b| {
        b.iter(|| black_box(codec::encode_snapshot(black_box(&doc)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_local_insert,
    bench_remote_apply,
    bench_render,
    bench_update_encode,
    bench_snapshot_encode
);
criterion_main!(benches);
