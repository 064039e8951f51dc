use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use strand::core::Cause;
use strand::core::Exit;
use strand::core::Never;
use strand::fiber;
use strand::fiber::Fiber;
use strand::fiber::FiberRef;
use strand::fiber::Runtime;
use strand::fiber::RuntimeConfig;

fn runtime() -> Runtime {
  Runtime::new(RuntimeConfig::new().worker_threads(2)).unwrap()
}

async fn forever() -> Result<(), Cause<Never>> {
  loop {
    fiber::sleep(Duration::from_millis(5)).await;
  }
}

#[test]
fn test_fork_join() {
  let exit: Exit<u32, Never> = runtime().block_on(async {
    let child: Fiber<u32, Never> = fiber::fork(async { Ok(20) });
    let value: u32 = child.join().await.into_result()?;

    Ok(value + 1)
  });

  assert_eq!(exit.into_result().ok(), Some(21));
}

#[test]
fn test_interrupt_suspended_fiber() {
  let stopped: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
  let flag: Arc<AtomicBool> = Arc::clone(&stopped);

  let exit: Exit<bool, Never> = runtime().block_on(async move {
    let child: Fiber<(), Never> = fiber::fork(fiber::on_interrupt(forever(), move |_by| async move {
      flag.store(true, Ordering::SeqCst);
    }));

    fiber::sleep(Duration::from_millis(10)).await;

    Ok(child.interrupt().await.is_interrupted())
  });

  assert_eq!(exit.into_result().ok(), Some(true));
  assert!(stopped.load(Ordering::SeqCst));
}

#[test]
fn test_children_stop_with_parent() {
  let stopped: Arc<AtomicUsize> = Arc::new(AtomicUsize::new(0));
  let count: Arc<AtomicUsize> = Arc::clone(&stopped);

  let exit: Exit<usize, Never> = runtime().block_on(async move {
    let parent: Fiber<usize, Never> = fiber::fork(async move {
      for _ in 0..3 {
        let count: Arc<AtomicUsize> = Arc::clone(&count);

        let _child: Fiber<(), Never> = fiber::fork(fiber::ensuring(forever(), async move {
          count.fetch_add(1, Ordering::SeqCst);
        }));
      }

      fiber::yield_now().await;

      Ok(fiber::children().len())
    });

    parent.join().await.into_result()
  });

  assert_eq!(exit.into_result().ok(), Some(3));
  assert_eq!(stopped.load(Ordering::SeqCst), 3);
}

#[test]
fn test_daemon_outlives_parent() {
  let exit: Exit<u32, Never> = runtime().block_on(async {
    let parent: Fiber<Fiber<u32, Never>, Never> = fiber::fork(async {
      Ok(fiber::fork_daemon(async {
        fiber::sleep(Duration::from_millis(20)).await;
        Ok(7)
      }))
    });

    let daemon: Fiber<u32, Never> = parent.join().await.into_result()?;

    daemon.join().await.into_result()
  });

  assert_eq!(exit.into_result().ok(), Some(7));
}

#[test]
fn test_uninterruptible_region_completes() {
  let finished: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
  let flag: Arc<AtomicBool> = Arc::clone(&finished);

  let exit: Exit<bool, Never> = runtime().block_on(async move {
    let child: Fiber<(), Never> = fiber::fork(async move {
      fiber::uninterruptible(async {
        fiber::sleep(Duration::from_millis(30)).await;
        flag.store(true, Ordering::SeqCst);
      })
      .await;

      forever().await
    });

    fiber::sleep(Duration::from_millis(10)).await;

    Ok(child.interrupt().await.is_interrupted())
  });

  assert_eq!(exit.into_result().ok(), Some(true));
  assert!(finished.load(Ordering::SeqCst));
}

#[test]
fn test_for_each_par_first_failure_interrupts_rest() {
  let exit: Exit<Vec<u32>, &'static str> = runtime().block_on(async {
    fiber::for_each_par(0..4_u32, |index| async move {
      if index == 2 {
        return Err(Cause::fail("boom"));
      }

      forever().await.map_err(Cause::widen::<&'static str>)?;

      Ok::<u32, Cause<&'static str>>(index)
    })
    .await
  });

  assert_eq!(exit.into_result().err().and_then(|cause| cause.first_failure().copied()), Some("boom"));
}

#[test]
fn test_race_returns_winner() {
  let exit: Exit<u32, Never> = runtime().block_on(async {
    fiber::race(
      async {
        fiber::sleep(Duration::from_millis(50)).await;
        Ok(1)
      },
      async { Ok(2) },
    )
    .await
  });

  assert_eq!(exit.into_result().ok(), Some(2));
}

#[test]
fn test_fiber_ref_merges_on_join() {
  let exit: Exit<(u32, u32), Never> = runtime().block_on(async {
    let counter: FiberRef<u32> = FiberRef::new(1);
    let child_ref: FiberRef<u32> = counter.clone();

    let child: Fiber<u32, Never> = fiber::fork(async move {
      let seen: u32 = child_ref.get();
      child_ref.set(seen + 10);
      Ok(seen)
    });

    let seen: u32 = child.join().await.into_result()?;

    Ok((seen, counter.get()))
  });

  assert_eq!(exit.into_result().ok(), Some((1, 11)));
}

#[test]
fn test_panic_becomes_defect() {
  let exit: Exit<(), Never> = runtime().block_on(async {
    let child: Fiber<(), Never> = fiber::fork(async {
      if fiber::id().is_none() {
        return Ok(());
      }

      panic!("kaboom")
    });
    child.join().await.into_result()
  });

  let cause: Cause<Never> = exit.into_result().unwrap_err();

  assert!(cause.is_die());
  assert_eq!(cause.defects()[0].message(), "kaboom");
}
