//! Benchmarks for the delta input codec
//!
//! Run with: cargo bench --bench compression
//!
//! Input patterns approximate what a real game sends: idle players repeat the same bits,
//! fighting games flip several buttons every other frame.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rampart_rollback::__internal::{decode, encode, MAX_COMPRESSED_BITS};
use rampart_rollback::{Frame, GameInput};
use std::hint::black_box;

const INPUT_SIZE: usize = 4;

fn inputs(frames: usize, pattern: impl Fn(usize) -> [u8; INPUT_SIZE]) -> Vec<GameInput> {
    (0..frames)
        .filter_map(|i| GameInput::new(Frame::new(i as i32), &pattern(i)))
        .collect()
}

/// Same input repeated
fn idle_inputs(frames: usize) -> Vec<GameInput> {
    inputs(frames, |_| [0; INPUT_SIZE])
}

/// Button press every 5 frames
fn active_inputs(frames: usize) -> Vec<GameInput> {
    inputs(frames, |i| {
        let mut input = [0; INPUT_SIZE];
        if i % 5 == 0 {
            input[0] = 1 << (i % 8);
        }
        input
    })
}

/// Half of the frames change several buttons
fn fighting_game_inputs(frames: usize) -> Vec<GameInput> {
    inputs(frames, |i| {
        let mut input = [0; INPUT_SIZE];
        if i % 2 == 0 {
            input[0] = ((i * 7) % 256) as u8;
            input[1] = ((i * 13) % 256) as u8;
        }
        input
    })
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("compression/encode");
    let baseline = GameInput::blank(Frame::NULL, INPUT_SIZE);

    for frames in [8usize, 32, 128] {
        let patterns = [
            ("idle", idle_inputs(frames)),
            ("active", active_inputs(frames)),
            ("fighting", fighting_game_inputs(frames)),
        ];
        group.throughput(Throughput::Elements(frames as u64));
        for (name, pending) in &patterns {
            group.bench_with_input(BenchmarkId::new(*name, frames), pending, |b, pending| {
                b.iter(|| {
                    encode(
                        black_box(&baseline),
                        black_box(pending.iter()),
                        MAX_COMPRESSED_BITS,
                    )
                });
            });
        }
    }

    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("compression/decode");
    let baseline = GameInput::blank(Frame::NULL, INPUT_SIZE);

    for frames in [8usize, 32, 128] {
        let patterns = [
            ("idle", idle_inputs(frames)),
            ("active", active_inputs(frames)),
            ("fighting", fighting_game_inputs(frames)),
        ];
        group.throughput(Throughput::Elements(frames as u64));
        for (name, pending) in &patterns {
            let encoded = encode(&baseline, pending.iter(), MAX_COMPRESSED_BITS);
            group.bench_with_input(BenchmarkId::new(*name, frames), &encoded, |b, encoded| {
                b.iter(|| {
                    decode(
                        black_box(&baseline),
                        black_box(&encoded.bits),
                        encoded.num_bits,
                    )
                });
            });
        }
    }

    group.finish();
}

fn bench_overflowing_budget(c: &mut Criterion) {
    let baseline = GameInput::blank(Frame::NULL, INPUT_SIZE);
    let pending = fighting_game_inputs(512);
    c.bench_function("compression/encode_overflow", |b| {
        b.iter(|| encode(black_box(&baseline), pending.iter(), black_box(256)));
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_overflowing_budget);
criterion_main!(benches);
