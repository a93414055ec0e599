//! Benchmarks for the device memory allocators.
//!
//! Run with: cargo bench

use std::sync::Arc;

use ash::vk;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ddisplay::allocators::{DeallocationQueue, DeviceMemory, Interval, IntervalAllocator, MemoryPool};
use ddisplay::gpu::DummyDevice;
use ddisplay::DeviceMask;

const PAGE: vk::DeviceSize = 64 * 1024 * 1024;

// =============================================================================
// INTERVAL ALLOCATOR
// =============================================================================

fn bench_interval_request_return(c: &mut Criterion) {
    let mut group = c.benchmark_group("interval_allocator");

    for &count in &[16u64, 256, 4096] {
        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::new("request_return", count), &count, |b, &count| {
            let mut allocator = IntervalAllocator::new(PAGE);
            let mut taken = Vec::with_capacity(count as usize);
            b.iter(|| {
                for i in 0..count {
                    let size = 256 + (i % 7) * 64;
                    if let Some(begin) = allocator.request_interval(size, 256) {
                        taken.push(Interval::new(begin, begin + size));
                    }
                }
                for interval in taken.drain(..) {
                    allocator.return_interval(interval);
                }
                black_box(allocator.is_fully_free());
            });
        });
    }

    group.finish();
}

fn bench_interval_fragmented(c: &mut Criterion) {
    let mut group = c.benchmark_group("interval_allocator_fragmented");

    group.bench_function("first_fit_after_holes", |b| {
        let mut allocator = IntervalAllocator::new(PAGE);
        // every other block returned: a long free list of small holes
        let mut blocks = Vec::new();
        while let Some(begin) = allocator.request_interval(4096, 4096) {
            blocks.push(Interval::new(begin, begin + 4096));
            if blocks.len() == 4096 {
                break;
            }
        }
        for block in blocks.iter().step_by(2) {
            allocator.return_interval(*block);
        }

        b.iter(|| {
            // larger than every hole: first fit walks past all of them to the tail
            let begin = allocator.request_interval(8192, 4096);
            if let Some(begin) = black_box(begin) {
                allocator.return_interval(Interval::new(begin, begin + 8192));
            }
        });
    });

    group.finish();
}

// =============================================================================
// MEMORY POOL
// =============================================================================

fn bench_pool_alloc_free(c: &mut Criterion) {
    let gpu = Arc::new(DummyDevice::new(1));
    let mut group = c.benchmark_group("memory_pool");

    for &size in &[256u64, 64 * 1024, 1024 * 1024] {
        group.throughput(Throughput::Bytes(size));
        group.bench_with_input(BenchmarkId::new("alloc_free", size), &size, |b, &size| {
            let pool = MemoryPool::new(gpu.clone(), 0, DeviceMask::none(), false, PAGE);
            b.iter(|| {
                let mut allocation = pool.alloc(size, 256).unwrap();
                black_box(allocation.offset());
                allocation.free();
            });
        });
    }

    group.bench_function("alloc_mapped_write_1kb", |b| {
        let pool = MemoryPool::new(gpu.clone(), 1, DeviceMask::none(), true, PAGE);
        let data = [0xABu8; 1024];
        b.iter(|| {
            let mut allocation = pool.alloc(1024, 16).unwrap();
            allocation.write_bytes(&data).unwrap();
            black_box(&allocation);
        });
    });

    group.finish();
}

// =============================================================================
// FRAME-DELAYED DESTRUCTION
// =============================================================================

fn bench_deferred_staging(c: &mut Criterion) {
    let gpu = Arc::new(DummyDevice::new(1));
    let memory = DeviceMemory::new(gpu, 4 * 1024 * 1024).unwrap();
    let queue = DeallocationQueue::new();

    c.bench_function("staging_buffer_per_frame_keep_2", |b| {
        let mut frame = 0;
        b.iter(|| {
            let staging = memory.create_staging_buffer(4096).unwrap();
            queue.schedule(staging, frame, 2);
            black_box(queue.collect(frame));
            frame += 1;
        });
    });
    queue.clear();
}

criterion_group!(
    benches,
    bench_interval_request_return,
    bench_interval_fragmented,
    bench_pool_alloc_free,
    bench_deferred_staging,
);
criterion_main!(benches);
