//! 해체 집계기 벤치마크
//!
//! 정리 액션 등록(중복 검사 포함)과 역순 해제 비용을 측정합니다.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use lifecheck_core::types::ResourceHandle;
use lifecheck_lifecycle::{CleanupAction, LifecycleError, ResourceReleaser, TeardownAggregator};

/// 모든 해제를 즉시 성공시키는 해제기
struct NoopReleaser;

impl ResourceReleaser for NoopReleaser {
    async fn release(&self, _action: &CleanupAction) -> Result<(), LifecycleError> {
        Ok(())
    }
}

fn populated(resources: usize) -> TeardownAggregator {
    let mut teardown = TeardownAggregator::new();
    for i in 0..resources {
        let handle = match i % 3 {
            0 => ResourceHandle::vm(format!("vm-{i}")),
            1 => ResourceHandle::disk(format!("vol-{i}")),
            _ => ResourceHandle::snapshot(format!("snap-{i}")),
        };
        // 벤치 입력은 ID가 모두 다름
        let _ = teardown.register_release(&handle);
    }
    teardown
}

fn bench_register(c: &mut Criterion) {
    let mut group = c.benchmark_group("teardown_register");
    for size in [3usize, 30, 300] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| black_box(populated(size)));
        });
    }
    group.finish();
}

fn bench_unwind(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("tokio runtime");
    let mut group = c.benchmark_group("teardown_unwind");
    for size in [3usize, 30, 300] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_batched(
                || populated(size),
                |mut teardown| runtime.block_on(async { black_box(teardown.unwind(&NoopReleaser).await) }),
                criterion::BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_register, bench_unwind);
criterion_main!(benches);
