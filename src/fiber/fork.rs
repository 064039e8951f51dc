use std::future::poll_fn;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::Poll;
use tokio::runtime::Handle;
use triomphe::Arc;

use crate::core::Cause;
use crate::core::Exit;
use crate::core::FiberId;
use crate::fiber::Fiber;
use crate::fiber::FiberRefs;
use crate::fiber::context::FiberConfig;
use crate::fiber::context::FiberContext;
use crate::fiber::context::FiberCore;
use crate::fiber::context::FiberFlags;
use crate::fiber::handle::FiberSlot;
use crate::fiber::mask;
use crate::raise;
use crate::scope::FinalizerKey;
use crate::scope::Scope;
use crate::scope::ScopeClosed;
use crate::supervisor;
use crate::supervisor::Supervisor;
use crate::utils::CatchUnwind;

// -----------------------------------------------------------------------------
// Fork API
// -----------------------------------------------------------------------------

/// Starts `future` as a child of the current fiber.
///
/// The child inherits the fiber refs of the current fiber and is interrupted
/// when the current fiber ends, unless it finished first. Outside of a fiber
/// this behaves like [`fork_daemon`].
///
/// Must be called from inside a tokio runtime.
pub fn fork<F, A, E>(future: F) -> Fiber<A, E>
where
  F: Future<Output = Result<A, Cause<E>>> + Send + 'static,
  A: Send + 'static,
  E: Send + 'static,
{
  Spawn::new(true).start(future, None)
}

/// Starts `future` as a detached fiber that may outlive the current fiber.
///
/// The fiber still inherits the fiber refs of the current fiber.
pub fn fork_daemon<F, A, E>(future: F) -> Fiber<A, E>
where
  F: Future<Output = Result<A, Cause<E>>> + Send + 'static,
  A: Send + 'static,
  E: Send + 'static,
{
  Spawn::new(false).start(future, None)
}

/// Starts `future` as a fiber whose lifetime is bound to `scope`.
///
/// Closing the scope interrupts the fiber and waits for it to unwind. The
/// fiber is not attached to the current fiber. Fails without starting the
/// fiber if the scope is already closed.
pub fn fork_in<F, A, E>(scope: &Scope, future: F) -> Result<Fiber<A, E>, ScopeClosed>
where
  F: Future<Output = Result<A, Cause<E>>> + Send + 'static,
  A: Send + 'static,
  E: Send + 'static,
{
  let spawn: Spawn = Spawn::new(false);
  let child: Arc<FiberCore> = Arc::clone(&spawn.core);

  let key: FinalizerKey = scope.add_finalizer(move |_exit: Exit<(), ()>| async move {
    child.request_interrupt(FiberContext::current_id());
    child.await_done().await;
  })?;

  Ok(spawn.start(future, Some((scope.clone(), key))))
}

// -----------------------------------------------------------------------------
// Spawn
// -----------------------------------------------------------------------------

/// Everything needed to start a fiber, captured from the forking context.
pub(crate) struct Spawn {
  core: Arc<FiberCore>,
  parent: Option<Arc<FiberCore>>,
  config: FiberConfig,
  refs: FiberRefs,
}

impl Spawn {
  fn new(attach: bool) -> Self {
    let inherited: Option<(Arc<FiberCore>, FiberConfig, FiberRefs)> =
      FiberContext::try_with(|fiber| (Arc::clone(&fiber.core), fiber.config, fiber.refs().fork()));

    let Some((parent, config, refs)) = inherited else {
      return Self::root(FiberConfig::default(), FiberRefs::new());
    };

    let flags: FiberFlags = if attach {
      FiberFlags::empty()
    } else {
      FiberFlags::DAEMON
    };

    let core: FiberCore = FiberCore::new(FiberId::next(), parent.id.clone(), flags);

    Self {
      core: Arc::new(core),
      parent: attach.then_some(parent),
      config,
      refs,
    }
  }

  /// A fiber with no parent, used for runtime entry points.
  pub(crate) fn root(config: FiberConfig, refs: FiberRefs) -> Self {
    let core: FiberCore = FiberCore::new(FiberId::next(), FiberId::NONE, FiberFlags::DAEMON);

    Self {
      core: Arc::new(core),
      parent: None,
      config,
      refs,
    }
  }

  pub(crate) fn start<F, A, E>(self, future: F, binding: Option<(Scope, FinalizerKey)>) -> Fiber<A, E>
  where
    F: Future<Output = Result<A, Cause<E>>> + Send + 'static,
    A: Send + 'static,
    E: Send + 'static,
  {
    let handle: Handle = match Handle::try_current() {
      Ok(handle) => handle,
      Err(error) => raise!(Error, SysInv, error),
    };

    let fiber: Fiber<A, E> = Fiber {
      core: Arc::clone(&self.core),
      slot: std::sync::Arc::new(FiberSlot::new()),
    };

    if let Some(parent) = self.parent.as_ref() {
      parent.attach(Arc::clone(&self.core));
    }

    let supervisor: Supervisor = self.refs.get(&*supervisor::CURRENT);

    if !supervisor
      .on_start(&self.core.id, &self.core.parent)
      .is_stop()
    {
      tracing::debug!(
        target: "strand",
        fiber = %self.core.id,
        parent = %self.core.parent,
        daemon = self.parent.is_none(),
        "Fiber Spawn",
      );
    }

    let driver: Driver<A, E> = Driver {
      core: self.core,
      slot: std::sync::Arc::clone(&fiber.slot),
      parent: self.parent,
      binding,
      supervisor,
    };

    let context: FiberContext = FiberContext::new(Arc::clone(&driver.core), self.config, self.refs);

    let _ignore: _ = handle.spawn(FiberContext::scope(context, driver.run(future)));

    fiber
  }
}

// -----------------------------------------------------------------------------
// Driver
// -----------------------------------------------------------------------------

/// Runs a fiber body to completion and publishes its exit.
///
/// Lifecycle:
///
/// 1. Poll the body until it completes or an interruption request is
///    honored. Panics become [`Cause::Die`].
/// 2. Drop the body, then close the root scope with the body's exit.
/// 3. Interrupt attached children and wait for them.
/// 4. Notify the supervisor, detach from parent and scope, publish the exit.
struct Driver<A, E> {
  core: Arc<FiberCore>,
  slot: std::sync::Arc<FiberSlot<A, E>>,
  parent: Option<Arc<FiberCore>>,
  binding: Option<(Scope, FinalizerKey)>,
  supervisor: Supervisor,
}

impl<A, E> Driver<A, E>
where
  A: Send + 'static,
  E: Send + 'static,
{
  async fn run<F>(self, future: F)
  where
    F: Future<Output = Result<A, Cause<E>>> + Send + 'static,
  {
    let exit: Exit<A, E> = self.poll_body(future).await;
    let exit: Exit<A, E> = mask::uninterruptible(self.finalize(exit)).await;
    let erased: Exit<(), ()> = exit.erase();

    if !self.supervisor.on_end(&erased, &self.core.id).is_stop() {
      tracing::debug!(
        target: "strand",
        fiber = %self.core.id,
        success = erased.is_success(),
        interrupted = erased.is_interrupted(),
        "Fiber Exit",
      );
    }

    if let Some((scope, key)) = self.binding {
      scope.remove_finalizer(key);
    }

    if let Some(parent) = self.parent.as_ref() {
      parent.detach(&self.core.id);
    }

    self.slot.store(exit, FiberContext::with(FiberContext::take_refs));
    self.core.complete(erased);
  }

  async fn poll_body<F>(&self, future: F) -> Exit<A, E>
  where
    F: Future<Output = Result<A, Cause<E>>>,
  {
    let mut body: Pin<Box<CatchUnwind<AssertUnwindSafe<F>>>> =
      Box::pin(CatchUnwind::new(AssertUnwindSafe(future)));

    let exit: Exit<A, E> = poll_fn(|context| {
      self.core.register(context.waker());

      if let Some(by) = FiberContext::with(FiberContext::should_interrupt) {
        return Poll::Ready(Exit::Failure(Cause::Interrupt(by)));
      }

      match body.as_mut().poll(context) {
        Poll::Ready(Ok(Ok(value))) => Poll::Ready(Exit::Success(value)),
        Poll::Ready(Ok(Err(cause))) => Poll::Ready(Exit::Failure(cause)),
        Poll::Ready(Err(defect)) => {
          if defect.is_exception() {
            tracing::warn!(target: "strand", fiber = %self.core.id, %defect, "Fiber Exception");
          }

          Poll::Ready(Exit::Failure(Cause::Die(defect)))
        }
        Poll::Pending => match FiberContext::with(FiberContext::should_interrupt) {
          Some(by) => Poll::Ready(Exit::Failure(Cause::Interrupt(by))),
          None => Poll::Pending,
        },
      }
    })
    .await;

    // Dropping the body runs the synchronous cleanup of every suspended
    // future inside it, with the fiber context still in place.
    FiberContext::with(FiberContext::mark_stopping);
    drop(body);

    exit
  }

  async fn finalize(&self, exit: Exit<A, E>) -> Exit<A, E> {
    let root: Scope = FiberContext::with(|fiber| fiber.root_scope.clone());

    let exit: Exit<A, E> = match root.close(&exit.erase()).await {
      Ok(()) => exit,
      Err(cause) => match exit {
        Exit::Success(_) => Exit::Failure(cause.widen()),
        Exit::Failure(failure) => Exit::Failure(failure.then(cause.widen())),
      },
    };

    let children: Vec<Arc<FiberCore>> = self.core.take_children();

    for child in children.iter() {
      child.request_interrupt(self.core.id.clone());
    }

    for child in children.iter() {
      let _ignore: Exit<(), ()> = child.await_done().await;
    }

    exit
  }
}
