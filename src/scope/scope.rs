use parking_lot::Mutex;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::mem;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Weak;

use crate::core::Cause;
use crate::core::Defect;
use crate::core::Exit;
use crate::core::Never;
use crate::fiber;
use crate::scope::ScopeClosed;
use crate::utils::CatchUnwind;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;
type Finalizer = Box<dyn FnOnce(Exit<(), ()>) -> BoxFuture<Cause<Never>> + Send>;

// -----------------------------------------------------------------------------
// Finalizer Key
// -----------------------------------------------------------------------------

/// Identifies a finalizer registered with a [`Scope`].
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct FinalizerKey(u64);

// -----------------------------------------------------------------------------
// Scope
// -----------------------------------------------------------------------------

/// A resource-lifecycle boundary.
///
/// Finalizers registered with a scope run when it closes, most recently
/// added first, each receiving the exit that closed the scope. Every
/// finalizer is awaited before the next one starts. Failures of individual
/// finalizers never stop the remaining ones; they are collected into the
/// cause returned by [`Scope::close`].
///
/// A scope closes exactly once. Later calls to [`Scope::close`] do nothing,
/// and registering new finalizers fails with [`ScopeClosed`].
///
/// Every fiber owns a root scope that is closed with the fiber's exit after
/// its body stops, whether it completed, failed, or was interrupted.
#[derive(Clone)]
pub struct Scope {
  inner: Arc<Inner>,
}

struct Inner {
  state: Mutex<State>,
  parent: Mutex<Option<(Weak<Inner>, FinalizerKey)>>,
}

enum State {
  Open {
    finalizers: Vec<(FinalizerKey, Finalizer)>,
    next: u64,
  },
  Closed,
}

impl Scope {
  /// Creates a new open scope.
  pub fn new() -> Self {
    Self {
      inner: Arc::new(Inner {
        state: Mutex::new(State::Open {
          finalizers: Vec::new(),
          next: 0,
        }),
        parent: Mutex::new(None),
      }),
    }
  }

  /// Returns `true` if the scope was closed.
  #[inline]
  pub fn is_closed(&self) -> bool {
    matches!(*self.inner.state.lock(), State::Closed)
  }

  /// Registers a finalizer to run when the scope closes.
  ///
  /// A panicking finalizer is recorded as a defect in the close cause.
  pub fn add_finalizer<F, Fut>(&self, finalizer: F) -> Result<FinalizerKey, ScopeClosed>
  where
    F: FnOnce(Exit<(), ()>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    self
      .try_add(Box::new(move |exit: Exit<(), ()>| -> BoxFuture<Cause<Never>> {
        let future: Fut = finalizer(exit);

        Box::pin(async move {
          future.await;
          Cause::Empty
        })
      }))
      .map_err(|_| ScopeClosed)
  }

  /// Removes a finalizer without running it.
  ///
  /// Returns `false` if the key is unknown or the scope is closed.
  pub fn remove_finalizer(&self, key: FinalizerKey) -> bool {
    self.take(key).is_some()
  }

  /// Removes a finalizer and runs it now with the given exit.
  ///
  /// Does nothing if the key is unknown or the scope is closed.
  pub async fn release(&self, key: FinalizerKey, exit: &Exit<(), ()>) -> Result<(), Cause<Never>> {
    let Some(finalizer) = self.take(key) else {
      return Ok(());
    };

    into_result(run_finalizers(vec![finalizer], exit.clone()).await)
  }

  /// Closes the scope, running every finalizer in reverse registration order.
  ///
  /// Finalizers run uninterruptibly. Closing an already closed scope does
  /// nothing and succeeds.
  pub async fn close(&self, exit: &Exit<(), ()>) -> Result<(), Cause<Never>> {
    let finalizers: Vec<(FinalizerKey, Finalizer)> = {
      let mut state = self.inner.state.lock();

      match mem::replace(&mut *state, State::Closed) {
        State::Open { finalizers, .. } => finalizers,
        State::Closed => return Ok(()),
      }
    };

    if let Some((parent, key)) = self.inner.parent.lock().take() {
      if let Some(parent) = parent.upgrade() {
        Scope { inner: parent }.remove_finalizer(key);
      }
    }

    tracing::trace!(
      target: "strand",
      finalizers = finalizers.len(),
      success = exit.is_success(),
      "Scope Close",
    );

    let finalizers: Vec<Finalizer> = finalizers
      .into_iter()
      .rev()
      .map(|(_, finalizer)| finalizer)
      .collect();

    into_result(run_finalizers(finalizers, exit.clone()).await)
  }

  /// Creates a child scope that is closed when this scope closes.
  ///
  /// Closing the child first detaches it from this scope.
  pub fn fork(&self) -> Result<Scope, ScopeClosed> {
    let child: Scope = Scope::new();
    let finalize: Scope = child.clone();

    let key: FinalizerKey = self
      .try_add(Box::new(move |exit: Exit<(), ()>| -> BoxFuture<Cause<Never>> {
        Box::pin(async move {
          match finalize.close(&exit).await {
            Ok(()) => Cause::Empty,
            Err(cause) => cause,
          }
        })
      }))
      .map_err(|_| ScopeClosed)?;

    *child.inner.parent.lock() = Some((Arc::downgrade(&self.inner), key));

    Ok(child)
  }

  /// Acquires a resource uninterruptibly and registers its release with this
  /// scope.
  ///
  /// If the scope is already closed the resource is released immediately
  /// and the call dies.
  pub async fn acquire_release<A, E, Acq, Rel, Fut>(
    &self,
    acquire: Acq,
    release: Rel,
  ) -> Result<A, Cause<E>>
  where
    Acq: Future<Output = Result<A, Cause<E>>>,
    A: Clone + Send + 'static,
    Rel: FnOnce(A, Exit<(), ()>) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
  {
    fiber::uninterruptible(async move {
      let resource: A = acquire.await?;
      let value: A = resource.clone();

      let finalizer: Finalizer = Box::new(move |exit: Exit<(), ()>| -> BoxFuture<Cause<Never>> {
        let future: Fut = release(value, exit);

        Box::pin(async move {
          future.await;
          Cause::Empty
        })
      });

      match self.try_add(finalizer) {
        Ok(_) => Ok(resource),
        Err(finalizer) => {
          let closed: String = ScopeClosed.to_string();
          let cause: Cause<Never> = run_finalizers(vec![finalizer], Exit::die(closed.clone())).await;

          Err(Cause::die(closed).then(cause.widen()))
        }
      }
    })
    .await
  }

  fn try_add(&self, finalizer: Finalizer) -> Result<FinalizerKey, Finalizer> {
    let mut state = self.inner.state.lock();

    match &mut *state {
      State::Open { finalizers, next } => {
        let key: FinalizerKey = FinalizerKey(*next);

        *next += 1;
        finalizers.push((key, finalizer));

        Ok(key)
      }
      State::Closed => Err(finalizer),
    }
  }

  fn take(&self, key: FinalizerKey) -> Option<Finalizer> {
    let mut state = self.inner.state.lock();

    let State::Open { finalizers, .. } = &mut *state else {
      return None;
    };

    let index: usize = finalizers.iter().position(|(known, _)| *known == key)?;

    Some(finalizers.remove(index).1)
  }
}

impl Default for Scope {
  #[inline]
  fn default() -> Self {
    Self::new()
  }
}

impl Debug for Scope {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match &*self.inner.state.lock() {
      State::Open { finalizers, .. } => f
        .debug_struct("Scope")
        .field("finalizers", &finalizers.len())
        .finish(),
      State::Closed => f.write_str("Scope(closed)"),
    }
  }
}

/// Runs finalizers in the given order, uninterruptibly, folding failures
/// together sequentially.
async fn run_finalizers(finalizers: Vec<Finalizer>, exit: Exit<(), ()>) -> Cause<Never> {
  fiber::uninterruptible(async move {
    let mut cause: Cause<Never> = Cause::Empty;

    for finalizer in finalizers {
      let exit: Exit<(), ()> = exit.clone();

      let future: BoxFuture<Cause<Never>> =
        match panic::catch_unwind(AssertUnwindSafe(move || finalizer(exit))) {
          Ok(future) => future,
          Err(payload) => {
            cause = cause.then(Cause::Die(Defect::from_panic(payload)));
            continue;
          }
        };

      match CatchUnwind::new(AssertUnwindSafe(future)).await {
        Ok(failure) => cause = cause.then(failure),
        Err(defect) => cause = cause.then(Cause::Die(defect)),
      }
    }

    cause
  })
  .await
}

#[inline]
fn into_result(cause: Cause<Never>) -> Result<(), Cause<Never>> {
  if cause.is_empty() { Ok(()) } else { Err(cause) }
}

// -----------------------------------------------------------------------------
// Scoped
// -----------------------------------------------------------------------------

/// Runs `f` with a fresh scope that is closed with the outcome of `f`.
///
/// Inside a fiber the scope is a child of the fiber's root scope, so it is
/// closed even when the fiber is interrupted while `f` runs. Finalizer
/// failures are appended to the result with [`Cause::then`].
pub async fn scoped<F, Fut, A, E>(f: F) -> Result<A, Cause<E>>
where
  F: FnOnce(Scope) -> Fut,
  Fut: Future<Output = Result<A, Cause<E>>>,
{
  let scope: Scope = match fiber::root_scope() {
    Some(root) => match root.fork() {
      Ok(scope) => scope,
      Err(closed) => return Err(Cause::die(closed.to_string())),
    },
    None => Scope::new(),
  };

  let result: Result<A, Cause<E>> = f(scope.clone()).await;

  let exit: Exit<(), ()> = match &result {
    Ok(_) => Exit::UNIT,
    Err(cause) => Exit::Failure(cause.erase()),
  };

  match scope.close(&exit).await {
    Ok(()) => result,
    Err(cause) => match result {
      Ok(_) => Err(cause.widen()),
      Err(failure) => Err(failure.then(cause.widen())),
    },
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use parking_lot::Mutex;
  use std::sync::Arc;

  use crate::core::Cause;
  use crate::core::Exit;
  use crate::core::Never;
  use crate::scope::FinalizerKey;
  use crate::scope::Scope;
  use crate::scope::ScopeClosed;

  fn record(log: &Arc<Mutex<Vec<u32>>>, scope: &Scope, value: u32) -> FinalizerKey {
    let log: Arc<Mutex<Vec<u32>>> = Arc::clone(log);

    scope
      .add_finalizer(move |_| async move { log.lock().push(value) })
      .unwrap()
  }

  #[tokio::test]
  async fn test_finalizers_run_in_reverse() {
    let log: Arc<Mutex<Vec<u32>>> = Arc::default();
    let scope: Scope = Scope::new();

    record(&log, &scope, 1);
    record(&log, &scope, 2);
    record(&log, &scope, 3);

    assert!(scope.close(&Exit::UNIT).await.is_ok());
    assert_eq!(*log.lock(), vec![3, 2, 1]);
  }

  #[tokio::test]
  async fn test_close_is_idempotent() {
    let log: Arc<Mutex<Vec<u32>>> = Arc::default();
    let scope: Scope = Scope::new();

    record(&log, &scope, 1);

    assert!(scope.close(&Exit::UNIT).await.is_ok());
    assert!(scope.close(&Exit::UNIT).await.is_ok());
    assert!(scope.is_closed());
    assert_eq!(*log.lock(), vec![1]);
  }

  #[tokio::test]
  async fn test_add_after_close_fails() {
    let scope: Scope = Scope::new();

    assert!(scope.close(&Exit::UNIT).await.is_ok());
    assert_eq!(scope.add_finalizer(|_| async {}), Err(ScopeClosed));
    assert!(scope.fork().is_err());
  }

  #[tokio::test]
  async fn test_finalizers_receive_exit() {
    let seen: Arc<Mutex<Option<Exit<(), ()>>>> = Arc::default();
    let scope: Scope = Scope::new();
    let slot: Arc<Mutex<Option<Exit<(), ()>>>> = Arc::clone(&seen);

    scope
      .add_finalizer(move |exit| async move { *slot.lock() = Some(exit) })
      .unwrap();

    let exit: Exit<(), ()> = Exit::fail(());

    assert!(scope.close(&exit).await.is_ok());
    assert_eq!(*seen.lock(), Some(exit));
  }

  #[tokio::test]
  async fn test_failing_finalizer_does_not_stop_others() {
    let log: Arc<Mutex<Vec<u32>>> = Arc::default();
    let scope: Scope = Scope::new();

    record(&log, &scope, 1);

    scope
      .add_finalizer(|_| async { panic!("finalizer 2"); })
      .unwrap();

    scope
      .add_finalizer(|_| async { panic!("finalizer 3"); })
      .unwrap();

    let cause: Cause<Never> = scope.close(&Exit::UNIT).await.unwrap_err();

    assert_eq!(*log.lock(), vec![1]);
    assert_eq!(
      cause,
      Cause::die("finalizer 3").then(Cause::die("finalizer 2")),
    );
  }

  #[tokio::test]
  async fn test_remove_and_release() {
    let log: Arc<Mutex<Vec<u32>>> = Arc::default();
    let scope: Scope = Scope::new();

    let one: FinalizerKey = record(&log, &scope, 1);
    let two: FinalizerKey = record(&log, &scope, 2);

    assert!(scope.remove_finalizer(one));
    assert!(!scope.remove_finalizer(one));
    assert!(scope.release(two, &Exit::UNIT).await.is_ok());
    assert_eq!(*log.lock(), vec![2]);

    assert!(scope.close(&Exit::UNIT).await.is_ok());
    assert_eq!(*log.lock(), vec![2]);
  }

  #[tokio::test]
  async fn test_child_scope_closes_with_parent() {
    let log: Arc<Mutex<Vec<u32>>> = Arc::default();
    let parent: Scope = Scope::new();

    record(&log, &parent, 1);

    let child: Scope = parent.fork().unwrap();

    record(&log, &child, 2);
    record(&log, &parent, 3);

    assert!(parent.close(&Exit::UNIT).await.is_ok());
    assert!(child.is_closed());
    assert_eq!(*log.lock(), vec![3, 2, 1]);
  }

  #[tokio::test]
  async fn test_closed_child_detaches_from_parent() {
    let log: Arc<Mutex<Vec<u32>>> = Arc::default();
    let parent: Scope = Scope::new();
    let child: Scope = parent.fork().unwrap();

    record(&log, &child, 1);

    assert!(child.close(&Exit::UNIT).await.is_ok());
    assert!(parent.close(&Exit::UNIT).await.is_ok());
    assert_eq!(*log.lock(), vec![1]);
  }

  #[tokio::test]
  async fn test_acquire_release() {
    let log: Arc<Mutex<Vec<u32>>> = Arc::default();
    let scope: Scope = Scope::new();
    let sink: Arc<Mutex<Vec<u32>>> = Arc::clone(&log);

    let resource: Result<u32, Cause<()>> = scope
      .acquire_release(async { Ok(7) }, move |value, _| async move {
        sink.lock().push(value)
      })
      .await;

    assert_eq!(resource.unwrap(), 7);
    assert!(log.lock().is_empty());
    assert!(scope.close(&Exit::UNIT).await.is_ok());
    assert_eq!(*log.lock(), vec![7]);
  }

  #[tokio::test]
  async fn test_acquire_failure_registers_nothing() {
    let scope: Scope = Scope::new();

    let resource: Result<u32, Cause<&str>> = scope
      .acquire_release(async { Err(Cause::fail("nope")) }, |_, _| async {})
      .await;

    assert_eq!(resource.unwrap_err(), Cause::fail("nope"));
    assert!(format!("{scope:?}").contains("finalizers: 0"));
  }

  #[tokio::test]
  async fn test_acquire_on_closed_scope_releases_immediately() {
    let log: Arc<Mutex<Vec<u32>>> = Arc::default();
    let scope: Scope = Scope::new();
    let sink: Arc<Mutex<Vec<u32>>> = Arc::clone(&log);

    assert!(scope.close(&Exit::UNIT).await.is_ok());

    let resource: Result<u32, Cause<()>> = scope
      .acquire_release(async { Ok(9) }, move |value, _| async move {
        sink.lock().push(value)
      })
      .await;

    assert!(resource.unwrap_err().is_die());
    assert_eq!(*log.lock(), vec![9]);
  }
}
