//! Benchmarks for orderbook operations.
//!
//! Run with: `cargo bench`

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use orderbook_sync::clock::ManualClock;
use orderbook_sync::config::ManagedBookConfig;
use orderbook_sync::orderbook::{ManagedOrderBook, OrderBook, RecordingSource};
use orderbook_sync::types::{BookData, BookLevel, Side};

fn populated(size: usize) -> OrderBook {
    let mut book = OrderBook::new("BENCH");
    let bids: Vec<BookLevel> = (0..size)
        .map(|i| BookLevel::new(10_000.0 - i as f64 * 0.5, 1.0 + (i % 7) as f64))
        .collect();
    let asks: Vec<BookLevel> = (0..size)
        .map(|i| BookLevel::new(10_000.5 + i as f64 * 0.5, 1.0 + (i % 5) as f64))
        .collect();
    book.apply_snapshot(&bids, &asks, 1);
    book
}

fn bench_orderbook_delta(c: &mut Criterion) {
    let mut group = c.benchmark_group("orderbook_delta");

    for size in [10, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let mut book = populated(size);
            let mut seq = book.sequence();

            b.iter(|| {
                // Simulate a typical top-of-book update
                seq += 1;
                let qty = (seq % 10) as f64;
                black_box(book.apply_delta(
                    black_box(BookLevel::new(9_999.0, qty)),
                    black_box(Side::Bid),
                    seq,
                ));
            });
        });
    }

    group.finish();
}

fn bench_orderbook_gap_fill(c: &mut Criterion) {
    c.bench_function("orderbook_gap_fill_10", |b| {
        b.iter_batched(
            || populated(100),
            |mut book| {
                let base = book.sequence();
                // Deliver ten updates in reverse so all but the last are buffered
                for offset in (1..=10u64).rev() {
                    let level = BookLevel::new(9_990.0 + offset as f64, 1.0);
                    black_box(book.apply_delta(level, Side::Bid, base + offset));
                }
                book
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

fn bench_orderbook_best_bid(c: &mut Criterion) {
    let mut group = c.benchmark_group("orderbook_best_bid");

    for size in [10, 100, 1000].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let book = populated(size);

            b.iter(|| {
                black_box(book.best_bid());
            });
        });
    }

    group.finish();
}

fn bench_orderbook_reads(c: &mut Criterion) {
    let book = populated(500);

    c.bench_function("orderbook_spread", |b| {
        b.iter(|| {
            black_box(book.spread());
        });
    });

    c.bench_function("orderbook_imbalance_20", |b| {
        b.iter(|| {
            black_box(book.imbalance(black_box(20)));
        });
    });

    c.bench_function("orderbook_snapshot_20", |b| {
        b.iter(|| {
            black_box(book.snapshot(black_box(20)));
        });
    });
}

fn bench_managed_replay(c: &mut Criterion) {
    let mut group = c.benchmark_group("managed_replay");

    for pending in [10u64, 100, 1000].iter() {
        group.bench_with_input(
            BenchmarkId::from_parameter(pending),
            pending,
            |b, &pending| {
                let snapshot_bids: Vec<BookLevel> =
                    (0..50i32).map(|i| BookLevel::new(100.0 - f64::from(i), 1.0)).collect();
                let snapshot_asks: Vec<BookLevel> =
                    (0..50i32).map(|i| BookLevel::new(101.0 + f64::from(i), 1.0)).collect();

                b.iter_batched(
                    || {
                        let mut book = ManagedOrderBook::new(
                            "BENCH",
                            ManagedBookConfig::default().with_max_buffer_size(2_000),
                            Arc::new(RecordingSource::new()),
                            Arc::new(ManualClock::new(0)),
                        );
                        book.start();
                        for id in 1..=pending {
                            let price = 90.0 + (id % 10) as f64;
                            book.on_delta(BookData::delta(
                                id,
                                id,
                                vec![BookLevel::new(price, id as f64)],
                                vec![],
                            ));
                        }
                        book
                    },
                    |mut book| {
                        book.on_snapshot(&snapshot_bids, &snapshot_asks, pending / 2);
                        book
                    },
                    criterion::BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_orderbook_delta,
    bench_orderbook_gap_fill,
    bench_orderbook_best_bid,
    bench_orderbook_reads,
    bench_managed_replay
);
criterion_main!(benches);
