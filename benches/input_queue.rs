//! Benchmarks for InputQueue operations
//!
//! Run with: cargo bench --bench input_queue

#![allow(clippy::unwrap_used, clippy::expect_used)]

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use rampart_rollback::__internal::{InputQueue, INPUT_QUEUE_LENGTH};
use rampart_rollback::{Frame, GameInput};
use std::hint::black_box;

const INPUT_SIZE: usize = 4;

fn input(frame: i32) -> GameInput {
    let value = (frame % 7) as u8;
    GameInput::new(Frame::new(frame), &[value, 0, value, 0]).unwrap()
}

fn mispredicted(frame: i32) -> GameInput {
    GameInput::new(Frame::new(frame), &[0xFF; INPUT_SIZE]).unwrap()
}

fn filled_queue(frames: i32) -> InputQueue {
    let mut queue = InputQueue::new(0, INPUT_SIZE).expect("valid queue");
    for frame in 0..frames {
        queue.add_input(&input(frame));
    }
    queue
}

fn bench_add_input(c: &mut Criterion) {
    let mut group = c.benchmark_group("InputQueue/add_input");

    for delay in [0usize, 2, 8] {
        group.bench_with_input(BenchmarkId::new("delay", delay), &delay, |b, &delay| {
            b.iter_batched(
                || {
                    let mut queue =
                        InputQueue::new(0, INPUT_SIZE).expect("valid queue");
                    let _ = queue.set_frame_delay(delay);
                    queue
                },
                |mut queue| {
                    for frame in 0..64 {
                        black_box(queue.add_input(&input(frame)));
                    }
                    queue
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_confirmed_reads(c: &mut Criterion) {
    let queue = filled_queue(64);
    c.bench_function("InputQueue/confirmed_input", |b| {
        b.iter(|| {
            for frame in 0..64 {
                black_box(queue.confirmed_input(Frame::new(frame)));
            }
        });
    });
}

fn bench_prediction(c: &mut Criterion) {
    // ask past the last confirmed frame, then confirm with a different input to force a mismatch
    c.bench_function("InputQueue/predict_and_confirm", |b| {
        b.iter_batched(
            || filled_queue(32),
            |mut queue| {
                for frame in 32..48 {
                    black_box(queue.input(Frame::new(frame)));
                }
                for frame in 32..48 {
                    queue.add_input(&mispredicted(frame));
                }
                let first_incorrect = queue.first_incorrect_frame();
                queue.reset_prediction(first_incorrect);
                black_box(first_incorrect)
            },
            BatchSize::SmallInput,
        );
    });
}

fn bench_steady_state(c: &mut Criterion) {
    // a long session: add, read and discard without ever filling the ring
    c.bench_function("InputQueue/steady_state", |b| {
        b.iter_batched(
            || InputQueue::new(0, INPUT_SIZE).expect("valid queue"),
            |mut queue| {
                let window = (INPUT_QUEUE_LENGTH / 2) as i32;
                for frame in 0..(INPUT_QUEUE_LENGTH as i32 * 4) {
                    queue.add_input(&input(frame));
                    black_box(queue.input(Frame::new(frame)));
                    if frame >= window {
                        queue.discard_confirmed_frames(Frame::new(frame - window));
                    }
                }
                queue
            },
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(
    benches,
    bench_add_input,
    bench_confirmed_reads,
    bench_prediction,
    bench_steady_state
);
criterion_main!(benches);
