use parking_lot::Mutex;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::core::Cause;
use crate::core::Exit;
use crate::fiber;

/// A one-shot promise that fibers can wait on.
///
/// The first call to [`Deferred::done`] (or one of its shorthands) decides the
/// outcome; later calls are ignored. Clones share the same outcome.
pub struct Deferred<A, E> {
  inner: Arc<Inner<A, E>>,
}

struct Inner<A, E> {
  exit: Mutex<Option<Exit<A, E>>>,
  notify: Notify,
}

impl<A, E> Deferred<A, E> {
  /// Creates a deferred that is not done yet.
  pub fn new() -> Self {
    Self {
      inner: Arc::new(Inner {
        exit: Mutex::new(None),
        notify: Notify::new(),
      }),
    }
  }

  /// Completes with `exit`.
  ///
  /// Returns `false` if the deferred was already done.
  pub fn done(&self, exit: Exit<A, E>) -> bool {
    {
      let mut slot = self.inner.exit.lock();

      if slot.is_some() {
        return false;
      }

      *slot = Some(exit);
    }

    self.inner.notify.notify_waiters();
    true
  }

  #[inline]
  pub fn succeed(&self, value: A) -> bool {
    self.done(Exit::Success(value))
  }

  #[inline]
  pub fn fail(&self, error: E) -> bool {
    self.done(Exit::Failure(Cause::Fail(error)))
  }

  #[inline]
  pub fn fail_cause(&self, cause: Cause<E>) -> bool {
    self.done(Exit::Failure(cause))
  }

  #[inline]
  pub fn is_done(&self) -> bool {
    self.inner.exit.lock().is_some()
  }
}

impl<A, E> Deferred<A, E>
where
  A: Clone,
  E: Clone,
{
  /// Returns the outcome if the deferred is done, without waiting.
  pub fn poll(&self) -> Option<Exit<A, E>> {
    self.inner.exit.lock().clone()
  }

  /// Waits until the deferred is done and returns its outcome.
  pub async fn await_exit(&self) -> Exit<A, E> {
    fiber::checkpoint().await;

    'wait: loop {
      let notified = self.inner.notify.notified();

      if let Some(exit) = self.poll() {
        break 'wait exit;
      }

      notified.await;
    }
  }
}

impl<A, E> Clone for Deferred<A, E> {
  #[inline]
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<A, E> Default for Deferred<A, E> {
  #[inline]
  fn default() -> Self {
    Self::new()
  }
}

impl<A, E> Debug for Deferred<A, E> {
  fn fmt(&self, f: &mut Formatter<'_>) -> Result {
    f.debug_struct("Deferred")
      .field("done", &self.is_done())
      .finish()
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use crate::core::Cause;
  use crate::core::Exit;
  use crate::sync::Deferred;

  #[test]
  fn test_first_completion_wins() {
    let deferred: Deferred<u32, &str> = Deferred::new();

    assert!(deferred.poll().is_none());
    assert!(deferred.succeed(1));
    assert!(!deferred.fail("late"));
    assert_eq!(deferred.poll(), Some(Exit::Success(1)));
  }

  #[tokio::test]
  async fn test_await_wakes_waiters() {
    let deferred: Deferred<u32, &str> = Deferred::new();
    let waiter: Deferred<u32, &str> = deferred.clone();

    let task = tokio::spawn(async move { waiter.await_exit().await });

    tokio::task::yield_now().await;
    deferred.fail_cause(Cause::fail("boom"));

    assert_eq!(task.await.unwrap(), Exit::Failure(Cause::fail("boom")));
  }
}
