use parking_lot::Mutex;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result;
use std::sync::OnceLock;
use triomphe::Arc;

use crate::core::Exit;
use crate::core::FiberId;
use crate::fiber::FiberRefs;
use crate::fiber::context::FiberContext;
use crate::fiber::context::FiberCore;
use crate::raise;

// -----------------------------------------------------------------------------
// Fiber Slot
// -----------------------------------------------------------------------------

/// The typed result of a fiber, written once by its driver.
pub(crate) struct FiberSlot<A, E> {
  exit: Mutex<Option<Exit<A, E>>>,
  refs: OnceLock<FiberRefs>,
}

impl<A, E> FiberSlot<A, E> {
  #[inline]
  pub(crate) const fn new() -> Self {
    Self {
      exit: Mutex::new(None),
      refs: OnceLock::new(),
    }
  }

  /// Stores the final exit and fiber refs.
  ///
  /// Must happen before the core is completed so that anyone woken by the
  /// core finds the typed exit.
  pub(crate) fn store(&self, exit: Exit<A, E>, refs: FiberRefs) {
    let mut slot = self.exit.lock();

    if slot.is_some() {
      raise!(Error, SysInv, "duplicate fiber exit");
    }

    *slot = Some(exit);

    drop(slot);

    let _ignore: std::result::Result<(), FiberRefs> = self.refs.set(refs);
  }

  /// Moves the exit out of the slot.
  ///
  /// Only for owners of the sole handle to a fiber; other handles would
  /// find the slot empty.
  pub(crate) fn take(&self) -> Option<Exit<A, E>> {
    self.exit.lock().take()
  }
}

// -----------------------------------------------------------------------------
// Fiber
// -----------------------------------------------------------------------------

/// A handle to a running fiber.
///
/// Handles are cheap to clone; every clone refers to the same fiber. Dropping
/// all handles does not stop the fiber.
pub struct Fiber<A, E> {
  pub(crate) core: Arc<FiberCore>,
  pub(crate) slot: std::sync::Arc<FiberSlot<A, E>>,
}

impl<A, E> Fiber<A, E> {
  /// Returns the id of the fiber.
  #[inline]
  pub fn id(&self) -> &FiberId {
    &self.core.id
  }

  /// Returns the id of the fiber that forked this one.
  #[inline]
  pub fn parent(&self) -> &FiberId {
    &self.core.parent
  }

  /// Returns `true` once the fiber stored its exit.
  #[inline]
  pub fn is_done(&self) -> bool {
    self.core.is_done()
  }

  /// Requests interruption without waiting for the fiber to stop.
  ///
  /// The request is attributed to the current fiber.
  pub fn interrupt_fork(&self) {
    self.core.request_interrupt(FiberContext::current_id());
  }
}

impl<A, E> Fiber<A, E>
where
  A: Clone,
  E: Clone,
{
  /// Returns the exit of the fiber if it is done, without waiting.
  pub fn poll(&self) -> Option<Exit<A, E>> {
    if self.core.is_done() {
      self.slot.exit.lock().clone()
    } else {
      None
    }
  }

  /// Waits for the fiber to finish and returns its exit.
  ///
  /// Unlike [`Fiber::join`], the fiber refs of the target are not merged into
  /// the current fiber.
  pub async fn await_exit(&self) -> Exit<A, E> {
    let _ignore: Exit<(), ()> = self.core.await_done().await;

    match self.slot.exit.lock().as_ref() {
      Some(exit) => exit.clone(),
      None => raise!(Error, SysInv, "fiber exit is unavailable"),
    }
  }

  /// Waits for the fiber to finish, merges its fiber refs into the current
  /// fiber, and returns its exit.
  pub async fn join(&self) -> Exit<A, E> {
    let exit: Exit<A, E> = self.await_exit().await;

    if let Some(refs) = self.slot.refs.get() {
      FiberContext::try_with(|fiber| fiber.refs_mut().join(refs));
    }

    exit
  }

  /// Interrupts the fiber on behalf of the current fiber and waits until it
  /// fully unwound, finalizers included.
  #[inline]
  pub async fn interrupt(&self) -> Exit<A, E> {
    self.interrupt_as(FiberContext::current_id()).await
  }

  /// Interrupts the fiber on behalf of `by` and waits until it fully
  /// unwound, finalizers included.
  pub async fn interrupt_as(&self, by: FiberId) -> Exit<A, E> {
    self.core.request_interrupt(by);
    self.await_exit().await
  }
}

impl<A, E> Fiber<A, E> {
  /// Waits for the fiber and moves its exit out, see [`FiberSlot::take`].
  pub(crate) async fn into_exit(self) -> Exit<A, E> {
    let _ignore: Exit<(), ()> = self.core.await_done().await;

    match self.slot.take() {
      Some(exit) => exit,
      None => raise!(Error, SysInv, "fiber exit is unavailable"),
    }
  }
}

impl<A, E> Clone for Fiber<A, E> {
  #[inline]
  fn clone(&self) -> Self {
    Self {
      core: Arc::clone(&self.core),
      slot: std::sync::Arc::clone(&self.slot),
    }
  }
}

impl<A, E> Debug for Fiber<A, E> {
  fn fmt(&self, f: &mut Formatter<'_>) -> Result {
    f.debug_struct("Fiber")
      .field("id", &self.core.id)
      .field("parent", &self.core.parent)
      .field("flags", &self.core.flags())
      .finish()
  }
}
