use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use strand::core::Cause;
use strand::core::Exit;
use strand::core::Never;
use strand::fiber;
use strand::fiber::Fiber;
use strand::fiber::Runtime;
use strand::fiber::RuntimeConfig;
use strand::scope;
use strand::scope::Scope;

type Log = Arc<Mutex<Vec<&'static str>>>;

fn runtime() -> Runtime {
  Runtime::new(RuntimeConfig::new().worker_threads(2)).unwrap()
}

async fn forever() -> Result<(), Cause<Never>> {
  loop {
    fiber::sleep(Duration::from_millis(5)).await;
  }
}

fn record(log: &Log, entry: &'static str) -> impl FnOnce(Exit<(), ()>) -> std::future::Ready<()> + Send + 'static {
  let log: Log = Arc::clone(log);

  move |_exit| {
    log.lock().push(entry);
    std::future::ready(())
  }
}

#[test]
fn test_interrupted_scope_runs_finalizers_in_reverse() {
  let log: Log = Arc::new(Mutex::new(Vec::new()));
  let inner: Log = Arc::clone(&log);

  let exit: Exit<bool, Never> = runtime().block_on(async move {
    let child: Fiber<(), Never> = fiber::fork(scope::scoped(move |scope: Scope| async move {
      scope.add_finalizer(record(&inner, "first")).unwrap();
      scope.add_finalizer(record(&inner, "second")).unwrap();
      scope.add_finalizer(record(&inner, "third")).unwrap();

      forever().await
    }));

    fiber::sleep(Duration::from_millis(15)).await;

    Ok(child.interrupt().await.is_interrupted())
  });

  assert_eq!(exit.into_result().ok(), Some(true));
  assert_eq!(*log.lock(), vec!["third", "second", "first"]);
}

#[test]
fn test_acquire_release_pairs_with_exit() {
  let log: Log = Arc::new(Mutex::new(Vec::new()));
  let inner: Log = Arc::clone(&log);

  let exit: Exit<u32, &'static str> = runtime().block_on(async move {
    scope::scoped(move |scope: Scope| async move {
      let released: Log = Arc::clone(&inner);

      let resource: u32 = scope
        .acquire_release(async { Ok::<u32, Cause<&'static str>>(5) }, move |_value: u32, exit: Exit<(), ()>| async move {
          released.lock().push(if exit.is_success() { "ok" } else { "failed" });
        })
        .await?;

      if resource == 5 {
        return Err(Cause::fail("rejected"));
      }

      Ok::<u32, Cause<&'static str>>(resource)
    })
    .await
  });

  assert_eq!(exit.into_result().err(), Some(Cause::fail("rejected")));
  assert_eq!(*log.lock(), vec!["failed"]);
}

#[test]
fn test_fork_in_scope_stops_with_scope() {
  let exit: Exit<bool, Never> = runtime().block_on(async {
    let scope: Scope = Scope::new();

    let child: Fiber<(), Never> = fiber::fork_in(&scope, forever()).map_err(|closed| Cause::<Never>::die(closed.to_string()))?;

    scope.close(&Exit::UNIT).await?;

    Ok(child.is_done() && child.join().await.is_interrupted())
  });

  assert_eq!(exit.into_result().ok(), Some(true));
}

#[test]
fn test_closed_scope_rejects_finalizers() {
  let exit: Exit<bool, Never> = runtime().block_on(async {
    let scope: Scope = Scope::new();

    scope.close(&Exit::UNIT).await?;

    Ok(scope.is_closed() && scope.add_finalizer(|_exit| async {}).is_err())
  });

  assert_eq!(exit.into_result().ok(), Some(true));
}
