use criterion::BenchmarkGroup;
use criterion::BenchmarkId;
use criterion::Criterion;
use criterion::criterion_group;
use criterion::criterion_main;
use std::hint::black_box;
use std::time::Duration;
use std::time::Instant;
use strand::core::Cause;
use strand::core::Exit;
use strand::core::Never;
use strand::fiber;
use strand::fiber::Runtime;
use strand::fiber::RuntimeConfig;
use strand::stm::TRef;

const FIBERS: &[usize] = &[2, 4, 6, 8, 10];

fn runtime() -> Runtime {
  match Runtime::new(RuntimeConfig::new().worker_threads(4)) {
    Ok(runtime) => runtime,
    Err(error) => panic!("failed to build runtime: {error}"),
  }
}

fn bench_stm_commit(criterion: &mut Criterion) {
  let runtime: Runtime = runtime();
  let mut group: BenchmarkGroup<_> = criterion.benchmark_group("stm_commit");

  group.bench_function("uncontended", |bench| {
    bench.iter_custom(|iters| {
      let exit: Exit<Duration, Never> = runtime.block_on(async move {
        let counter: TRef<u64> = TRef::new(0);
        let start: Instant = Instant::now();

        for _ in 0..iters {
          black_box(counter.update_and_get::<Never, _>(|n| n + 1).commit().await?);
        }

        Ok(start.elapsed())
      });

      exit.into_result().unwrap_or_default()
    })
  });

  for fibers in FIBERS {
    let id: BenchmarkId = BenchmarkId::new("contended", fibers);

    group.bench_with_input(id, fibers, |bench, &fibers| {
      bench.iter_custom(|iters| {
        let exit: Exit<Duration, Never> = runtime.block_on(async move {
          let counter: TRef<u64> = TRef::new(0);
          let start: Instant = Instant::now();

          fiber::for_each_par(0..fibers, |_| {
            let counter: TRef<u64> = counter.clone();

            async move {
              for _ in 0..iters {
                counter.update::<Never, _>(|n| n + 1).commit().await?;
              }

              Ok::<(), Cause<Never>>(())
            }
          })
          .await?;

          Ok(start.elapsed())
        });

        exit.into_result().unwrap_or_default()
      })
    });
  }

  group.finish();
}

criterion_group! {
  name = benches;
  config = Criterion::default();
  targets = bench_stm_commit
}

criterion_main!(benches);
