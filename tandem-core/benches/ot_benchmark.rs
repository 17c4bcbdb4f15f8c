use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::hint::black_box;
use tandem_core::{encode, transform, Component, Operation, Side};

fn sample_text(len: usize) -> String {
    "lorem ipsum dolor sit amet ".chars().cycle().take(len).collect()
}

fn bench_diff_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("Diff Encoder");

    for len in [1_000usize, 100_000] {
        let old = sample_text(len);
        let mut new = old.clone();
        new.insert_str(len / 2, "typed");

        group.throughput(Throughput::Bytes(len as u64));
        group.bench_function(format!("keystroke_{len}"), |b| {
            b.iter(|| black_box(encode(black_box(&old), black_box(&new))))
        });
    }

    group.finish();
}

fn bench_transform(c: &mut Criterion) {
    let a = Operation::new([
        Component::Delete { pos: 40, len: 10 },
        Component::Insert {
            pos: 40,
            text: "replacement".into(),
        },
    ]);
    let b = Operation::new([
        Component::Insert {
            pos: 45,
            text: "concurrent".into(),
        },
        Component::Delete { pos: 100, len: 5 },
    ]);

    c.bench_function("transform_two_component", |bench| {
        bench.iter(|| black_box(transform(black_box(&a), black_box(&b), Side::Left)))
    });
}

fn bench_compose_buffer(c: &mut Criterion) {
    // Folding 100 keystrokes into one buffered operation.
    let keystrokes: Vec<Operation> = (0..100)
        .map(|i| Operation::insert(10 + i, "k"))
        .collect();

    c.bench_function("compose_100_keystrokes", |b| {
        b.iter(|| {
            let folded = keystrokes
                .iter()
                .fold(Operation::noop(), |acc, op| acc.compose(op));
            black_box(folded)
        })
    });
}

fn bench_apply(c: &mut Criterion) {
    let text = sample_text(100_000);
    let op = Operation::new([
        Component::Delete { pos: 50_000, len: 20 },
        Component::Insert {
            pos: 50_000,
            text: "patched".into(),
        },
    ]);

    c.bench_function("apply_100k", |b| {
        b.iter(|| black_box(op.apply_to(black_box(&text)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_diff_encode,
    bench_transform,
    bench_compose_buffer,
    bench_apply
);
criterion_main!(benches);
