//! Fan-out hot path benchmarks
//!
//! - Annex-B normalization with and without key-frame repair
//! - Bounded queue push under overflow
//! - Per-sender enqueue with timestamp mapping

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use scopecast_webrtc::media::{normalize, ParameterSetCache, TimeBase};
use scopecast_webrtc::playout::{EncodedItem, FrameQueue};

fn access_unit(slice_len: usize, with_params: bool) -> Vec<u8> {
    let mut au = vec![0, 0, 0, 1, 0x09, 0xf0];
    if with_params {
        au.extend_from_slice(&[0, 0, 0, 1, 0x67, 0x42, 0xc0, 0x1f, 0xda]);
        au.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xce, 0x3c, 0x80]);
    }
    au.extend_from_slice(&[0, 0, 1, 0x65]);
    au.extend((0..slice_len).map(|i| (i % 251) as u8 | 0x04));
    au
}

fn bench_normalize(c: &mut Criterion) {
    let mut group = c.benchmark_group("normalize");

    for size in [1_000usize, 20_000, 200_000].iter() {
        group.throughput(Throughput::Bytes(*size as u64));

        let full = access_unit(*size, true);
        group.bench_with_input(BenchmarkId::new("inline_params", size), &full, |b, au| {
            let mut cache = ParameterSetCache::new();
            b.iter(|| black_box(normalize(black_box(au), &mut cache)));
        });

        let bare = access_unit(*size, false);
        group.bench_with_input(BenchmarkId::new("repaired", size), &bare, |b, au| {
            let mut cache = ParameterSetCache::new();
            normalize(&full, &mut cache);
            b.iter(|| black_box(normalize(black_box(au), &mut cache)));
        });
    }

    group.finish();
}

fn bench_queue_overflow(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_queue");
    let data = Bytes::from(access_unit(10_000, false));

    for pushes in [90u64, 900, 9_000].iter() {
        group.throughput(Throughput::Elements(*pushes));
        group.bench_with_input(BenchmarkId::new("push", pushes), pushes, |b, &pushes| {
            b.iter(|| {
                let mut queue = FrameQueue::new(90);
                for ts in 0..pushes {
                    queue.push(EncodedItem {
                        data: data.clone(),
                        timestamp: ts * 3003,
                        is_keyframe: false,
                    });
                }
                black_box(queue.evicted())
            });
        });
    }

    group.finish();
}

fn bench_rescale(c: &mut Criterion) {
    let tb = TimeBase::new(1001, 30_000);
    c.bench_function("timebase_rescale", |b| {
        b.iter(|| {
            let mut acc = 0i64;
            for pts in 0..1_000i64 {
                acc += tb.rescale(black_box(pts), 90_000).unwrap_or(0);
            }
            acc
        });
    });
}

criterion_group!(benches, bench_normalize, bench_queue_overflow, bench_rescale);
criterion_main!(benches);
