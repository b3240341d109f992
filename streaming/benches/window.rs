use bytes::Bytes;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use streaming::buffer::TICKS_PER_SECOND;
use streaming::heuristics::SlidingWindow;
use streaming::{ChunkTiming, MediaChunkQueue, MediaType};

fn sliding_window(c: &mut Criterion) {
    let mut group = c.benchmark_group("SlidingWindow");
    let samples: Vec<f64> = (0..1024)
        .map(|i| 2_000_000.0 + ((i * 7919) % 400_000) as f64)
        .collect();

    group.throughput(Throughput::Elements(samples.len() as u64));
    group.bench_function("bandwidth", |b| {
        b.iter(|| {
            let mut window = SlidingWindow::bandwidth();
            for sample in &samples {
                black_box(window.add(*sample));
            }
        });
    });
    group.finish();
}

fn buffer_accounting(c: &mut Criterion) {
    let mut group = c.benchmark_group("MediaChunkQueue");
    let window_configs = [8, 32, 128];

    for buffered in window_configs {
        group.throughput(Throughput::Elements(buffered as u64));
        group.bench_with_input(
            BenchmarkId::new("Buffered", buffered),
            &buffered,
            |b, &buffered| {
                let timings = ChunkTiming::uniform(buffered, 2 * TICKS_PER_SECOND);
                let queue = MediaChunkQueue::new(1, MediaType::Video, &timings, buffered).unwrap();
                for id in 0..buffered {
                    let chunk = queue.get(id).unwrap();
                    chunk.try_claim(1, 300_000);
                    chunk.install(1, Bytes::from(vec![0u8; 1024]));
                    queue.add(chunk).unwrap();
                }

                b.iter(|| {
                    queue.update_buffer_sizes();
                    black_box(queue.buffer_time())
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, sliding_window, buffer_accounting);
criterion_main!(benches);
