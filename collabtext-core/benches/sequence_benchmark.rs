use collabtext_core::{generate_between, Char, Message, Operation, PeerClock, Position, Sequence};
use criterion::{criterion_group, criterion_main, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::hint::black_box;

/// Build a document of `n` characters typed left to right.
fn typed_document(n: usize) -> Sequence {
    let mut rng = StdRng::seed_from_u64(42);
    let mut clock = PeerClock::new("bench");
    let mut seq = Sequence::new();
    for i in 0..n {
        let slot = i + 1;
        let prev = seq.chars()[slot - 1].position.clone();
        let next = seq.chars()[slot].position.clone();
        let pos = generate_between(&prev, &next, &mut rng).unwrap();
        seq.apply_insert(Char::new(clock.tick(), "x", pos));
    }
    seq
}

fn bench_generate_between_sentinels(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(1);
    let lo = Position::min();
    let hi = Position::max();

    c.bench_function("generate_between_sentinels", |b| {
        b.iter(|| black_box(generate_between(black_box(&lo), black_box(&hi), &mut rng).unwrap()))
    });
}

fn bench_generate_between_deep(c: &mut Criterion) {
    let lo = Position::new(vec![4, 9999, 9999, 9999, 3]);
    let hi = Position::new(vec![5]);
    let mut rng = StdRng::seed_from_u64(2);

    c.bench_function("generate_between_depth_5", |b| {
        b.iter(|| black_box(generate_between(&lo, &hi, &mut rng).unwrap()))
    });
}

fn bench_append_1000(c: &mut Criterion) {
    c.bench_function("sequence_append_1000", |b| {
        b.iter(|| black_box(typed_document(1000)))
    });
}

fn bench_random_insert_into_10k(c: &mut Criterion) {
    let base = typed_document(10_000);
    let mut rng = StdRng::seed_from_u64(3);
    let mut clock = PeerClock::new("other");

    c.bench_function("sequence_random_insert_10k", |b| {
        b.iter_batched(
            || base.clone(),
            |mut seq| {
                let slot = rng.gen_range(1..seq.len());
                let prev = seq.chars()[slot - 1].position.clone();
                let next = seq.chars()[slot].position.clone();
                let pos = generate_between(&prev, &next, &mut rng).unwrap();
                black_box(seq.apply_insert(Char::new(clock.tick(), "y", pos)))
            },
            criterion::BatchSize::LargeInput,
        )
    });
}

fn bench_duplicate_insert_10k(c: &mut Criterion) {
    let mut seq = typed_document(10_000);
    let existing = seq.chars()[5_000].clone();

    c.bench_function("sequence_duplicate_insert_10k", |b| {
        b.iter(|| black_box(seq.apply_insert(black_box(existing.clone()))))
    });
}

fn bench_load_frame_encode_1k(c: &mut Criterion) {
    let seq = typed_document(1000);

    c.bench_function("load_frame_encode_1k", |b| {
        b.iter(|| black_box(Message::load(&seq).encode().unwrap()))
    });
}

fn bench_crdt_frame_decode(c: &mut Criterion) {
    let seq = typed_document(10);
    let op = Operation::Insert(seq.chars()[5].clone());
    let text = op.to_message("client-1").encode().unwrap();

    c.bench_function("crdt_insert_decode", |b| {
        b.iter(|| black_box(Message::decode(black_box(&text)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_generate_between_sentinels,
    bench_generate_between_deep,
    bench_append_1000,
    bench_random_insert_into_10k,
    bench_duplicate_insert_10k,
    bench_load_frame_encode_1k,
    bench_crdt_frame_decode,
);
criterion_main!(benches);
