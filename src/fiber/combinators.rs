use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::UnboundedSender;
use triomphe::Arc;

use crate::core::Cause;
use crate::core::Exit;
use crate::core::FiberId;
use crate::core::Never;
use crate::fiber::Fiber;
use crate::fiber::context::FiberContext;
use crate::fiber::context::FiberCore;
use crate::fiber::fork;
use crate::fiber::fork_daemon;
use crate::fiber::root_scope;
use crate::scope::FinalizerKey;
use crate::scope::Scope;
use crate::supervisor;
use crate::supervisor::Supervisor;

// -----------------------------------------------------------------------------
// Hooks
// -----------------------------------------------------------------------------

/// Runs `finalizer` after `future`, however it ends.
///
/// Inside a fiber the finalizer also runs when the fiber is interrupted
/// while `future` is suspended. It always runs uninterruptibly.
pub async fn ensuring<F, A, E, G>(future: F, finalizer: G) -> Result<A, Cause<E>>
where
  F: Future<Output = Result<A, Cause<E>>>,
  G: Future<Output = ()> + Send + 'static,
{
  on_exit(future, move |_exit: Exit<(), ()>| finalizer).await
}

/// Runs `hook` with the outcome of `future`, however it ends.
///
/// Failures of the hook itself are appended to the result with
/// [`Cause::then`]. If `future` is dropped inside a running fiber before it
/// completes, the hook runs in a detached fiber with an interruption by the
/// current fiber.
pub async fn on_exit<F, A, E, H, G>(future: F, hook: H) -> Result<A, Cause<E>>
where
  F: Future<Output = Result<A, Cause<E>>>,
  H: FnOnce(Exit<(), ()>) -> G + Send + 'static,
  G: Future<Output = ()> + Send + 'static,
{
  let Some(scope) = root_scope() else {
    let result: Result<A, Cause<E>> = future.await;
    hook(erase(&result)).await;
    return result;
  };

  let key: FinalizerKey = match scope.add_finalizer(hook) {
    Ok(key) => key,
    Err(closed) => return Err(Cause::die(closed.to_string())),
  };

  let guard: HookGuard = HookGuard {
    scope,
    key: Some(key),
  };

  let result: Result<A, Cause<E>> = future.await;

  guard.release(result).await
}

/// Runs `hook` with the interruptors if `future` ends by interruption.
pub async fn on_interrupt<F, A, E, H, G>(future: F, hook: H) -> Result<A, Cause<E>>
where
  F: Future<Output = Result<A, Cause<E>>>,
  H: FnOnce(FiberId) -> G + Send + 'static,
  G: Future<Output = ()> + Send + 'static,
{
  on_exit(future, move |exit: Exit<(), ()>| async move {
    if let Exit::Failure(cause) = exit {
      if cause.is_interrupted() {
        hook(cause.interruptors()).await;
      }
    }
  })
  .await
}

/// A hook registered with the root scope by [`on_exit`].
///
/// Taken out of the scope when the guarded future completes, or when the
/// guard is dropped while the fiber keeps running.
struct HookGuard {
  scope: Scope,
  key: Option<FinalizerKey>,
}

impl HookGuard {
  async fn release<A, E>(mut self, result: Result<A, Cause<E>>) -> Result<A, Cause<E>> {
    let Some(key) = self.key.take() else {
      return result;
    };

    match self.scope.release(key, &erase(&result)).await {
      Ok(()) => result,
      Err(cause) => match result {
        Ok(_) => Err(cause.widen()),
        Err(failure) => Err(failure.then(cause.widen())),
      },
    }
  }
}

impl Drop for HookGuard {
  fn drop(&mut self) {
    let Some(key) = self.key.take() else {
      return;
    };

    // The driver closes the root scope right after dropping the body.
    if FiberContext::try_with(FiberContext::is_stopping).unwrap_or(true) || Handle::try_current().is_err() {
      return;
    }

    let scope: Scope = self.scope.clone();
    let exit: Exit<(), ()> = Exit::interrupt(FiberContext::current_id());

    let _cleanup: Fiber<(), Never> = fork_daemon(async move {
      if let Err(cause) = scope.release(key, &exit).await {
        tracing::debug!(target: "strand", %cause, "Hook Failed");
      }

      Ok(())
    });
  }
}

#[inline]
fn erase<A, E>(result: &Result<A, Cause<E>>) -> Exit<(), ()> {
  match result {
    Ok(_) => Exit::UNIT,
    Err(cause) => Exit::Failure(cause.erase()),
  }
}

// -----------------------------------------------------------------------------
// Concurrency
// -----------------------------------------------------------------------------

/// Interrupts the listed fibers if dropped before they finish, so a combinator
/// that is itself interrupted never leaks running children.
struct Abandon {
  cores: Vec<Arc<FiberCore>>,
}

impl Abandon {
  fn new<A, E>(fibers: &[&Fiber<A, E>]) -> Self {
    Self {
      cores: fibers.iter().map(|fiber| Arc::clone(&fiber.core)).collect(),
    }
  }

  fn interrupt(&self) {
    let this: FiberId = FiberContext::current_id();

    for core in self.cores.iter() {
      core.request_interrupt(this.clone());
    }
  }
}

impl Drop for Abandon {
  fn drop(&mut self) {
    self.interrupt();
  }
}

/// Runs both futures concurrently and returns both results.
///
/// The first failure interrupts the other side. Failures of both sides are
/// combined with [`Cause::both`]; an interruption caused by the other side's
/// failure is not reported.
pub async fn zip_par<L, R, A, B, E>(left: L, right: R) -> Result<(A, B), Cause<E>>
where
  L: Future<Output = Result<A, Cause<E>>> + Send + 'static,
  R: Future<Output = Result<B, Cause<E>>> + Send + 'static,
  A: Clone + Send + 'static,
  B: Clone + Send + 'static,
  E: Clone + Send + 'static,
{
  let lhs: Fiber<A, E> = fork(left);
  let rhs: Fiber<B, E> = fork(right);
  let guard: Abandon = Abandon {
    cores: vec![Arc::clone(&lhs.core), Arc::clone(&rhs.core)],
  };

  let (left, right): (Exit<A, E>, Exit<B, E>) = tokio::select! {
    left = lhs.join() => {
      if left.is_failure() {
        rhs.interrupt_fork();
      }

      (left, rhs.join().await)
    }
    right = rhs.join() => {
      if right.is_failure() {
        lhs.interrupt_fork();
      }

      (lhs.join().await, right)
    }
  };

  drop(guard);

  match (left, right) {
    (Exit::Success(left), Exit::Success(right)) => Ok((left, right)),
    (Exit::Failure(cause), Exit::Success(_)) | (Exit::Success(_), Exit::Failure(cause)) => Err(cause),
    (Exit::Failure(left), Exit::Failure(right)) => Err(parallel(left, right)),
  }
}

/// Runs both futures concurrently and returns the first success.
///
/// The loser is interrupted and awaited before this returns. When both sides
/// fail, the failures are combined with [`Cause::both`].
pub async fn race<L, R, A, E>(left: L, right: R) -> Result<A, Cause<E>>
where
  L: Future<Output = Result<A, Cause<E>>> + Send + 'static,
  R: Future<Output = Result<A, Cause<E>>> + Send + 'static,
  A: Clone + Send + 'static,
  E: Clone + Send + 'static,
{
  let lhs: Fiber<A, E> = fork(left);
  let rhs: Fiber<A, E> = fork(right);
  let guard: Abandon = Abandon::new(&[&lhs, &rhs]);

  let result: Result<A, Cause<E>> = tokio::select! {
    left = lhs.join() => settle(left, &rhs).await,
    right = rhs.join() => settle(right, &lhs).await,
  };

  drop(guard);

  result
}

async fn settle<A, E>(first: Exit<A, E>, other: &Fiber<A, E>) -> Result<A, Cause<E>>
where
  A: Clone,
  E: Clone,
{
  match first {
    Exit::Success(value) => {
      let _loser: Exit<A, E> = other.interrupt().await;
      Ok(value)
    }
    Exit::Failure(first) => match other.join().await {
      Exit::Success(value) => Ok(value),
      Exit::Failure(second) => Err(first.both(second)),
    },
  }
}

/// Runs `f` for every item concurrently, collecting results in input order.
///
/// The first failure interrupts every other fiber. Failures are combined
/// with [`Cause::both`], leaving out interruptions caused by that first
/// failure.
pub async fn for_each_par<I, F, Fut, B, E>(items: I, mut f: F) -> Result<Vec<B>, Cause<E>>
where
  I: IntoIterator,
  F: FnMut(I::Item) -> Fut,
  Fut: Future<Output = Result<B, Cause<E>>> + Send + 'static,
  B: Clone + Send + 'static,
  E: Clone + Send + 'static,
{
  let (send, mut recv): (UnboundedSender<bool>, UnboundedReceiver<bool>) = mpsc::unbounded_channel();

  let fibers: Vec<Fiber<B, E>> = items
    .into_iter()
    .map(|item| {
      let future: Fut = f(item);
      let report: Report = Report {
        send: send.clone(),
        success: false,
      };

      fork(async move {
        // Bind the whole guard so it lives inside the fiber, not just the field.
        let mut report: Report = report;
        let result: Result<B, Cause<E>> = future.await;
        report.success = result.is_ok();
        result
      })
    })
    .collect();

  drop(send);

  let guard: Abandon = Abandon {
    cores: fibers.iter().map(|fiber| Arc::clone(&fiber.core)).collect(),
  };

  let mut pending: usize = fibers.len();
  let mut interrupted: bool = false;

  'wait: while pending > 0 {
    match recv.recv().await {
      Some(true) => pending -= 1,
      Some(false) => {
        guard.interrupt();
        interrupted = true;
        break 'wait;
      }
      None => break 'wait,
    }
  }

  let mut values: Vec<B> = Vec::with_capacity(fibers.len());
  let mut failure: Cause<E> = Cause::Empty;
  let mut collateral: Cause<E> = Cause::Empty;

  for fiber in fibers.iter() {
    match fiber.join().await {
      Exit::Success(value) => values.push(value),
      Exit::Failure(cause) if interrupted && cause.is_interrupted_only() => {
        collateral = collateral.both(cause);
      }
      Exit::Failure(cause) => failure = failure.both(cause),
    }
  }

  drop(guard);

  if !failure.is_empty() {
    Err(failure)
  } else if !collateral.is_empty() {
    Err(collateral)
  } else {
    Ok(values)
  }
}

/// Reports the outcome of one `for_each_par` fiber, even when it panics or is
/// interrupted.
struct Report {
  send: UnboundedSender<bool>,
  success: bool,
}

impl Drop for Report {
  fn drop(&mut self) {
    let _ignore: Result<(), _> = self.send.send(self.success);
  }
}

#[inline]
fn parallel<E>(left: Cause<E>, right: Cause<E>) -> Cause<E> {
  match (left.is_interrupted_only(), right.is_interrupted_only()) {
    (false, true) => left,
    (true, false) => right,
    (_, _) => left.both(right),
  }
}

// -----------------------------------------------------------------------------
// Supervision
// -----------------------------------------------------------------------------

/// Runs `future` with `supervisor` added to the current supervisor tree.
///
/// Fibers forked inside `future` inherit the extended tree. The previous
/// tree is restored afterwards.
pub async fn supervised<F>(supervisor: Supervisor, future: F) -> F::Output
where
  F: Future,
{
  if FiberContext::try_with(|_| ()).is_none() {
    return future.await;
  }

  let current: Supervisor = supervisor::CURRENT.get();

  supervisor::CURRENT
    .locally(current.and(supervisor), future)
    .await
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
