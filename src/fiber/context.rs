use bitflags::bitflags;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::cell::Cell;
use std::cell::Ref;
use std::cell::RefCell;
use std::cell::RefMut;
use std::task::Waker;
use tokio::sync::Notify;
use tokio::sync::futures::Notified;
use tokio::task::futures::TaskLocalFuture;
use triomphe::Arc;

use crate::consts;
use crate::core::Exit;
use crate::core::FiberId;
use crate::fiber::FiberRefs;
use crate::loom::sync::atomic::AtomicU32;
use crate::loom::sync::atomic::Ordering;
use crate::raise;
use crate::scope::Scope;

// -----------------------------------------------------------------------------
// Task Globals
// -----------------------------------------------------------------------------

tokio::task_local! {
  static CONTEXT: FiberContext;
}

// -----------------------------------------------------------------------------
// Fiber Flags
// -----------------------------------------------------------------------------

bitflags! {
  #[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
  pub(crate) struct FiberFlags: u32 {
    /// Interruption was requested at least once.
    const INTERRUPTED = 1 << 0;
    /// The fiber stored its exit.
    const DONE = 1 << 1;
    /// The fiber is not attached to its parent.
    const DAEMON = 1 << 2;
  }
}

// -----------------------------------------------------------------------------
// Fiber Config
// -----------------------------------------------------------------------------

/// Scheduling knobs inherited by every fiber forked from a runtime.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FiberConfig {
  pub(crate) ops_budget: u32,
  pub(crate) stm_yield_op_count: u32,
}

impl Default for FiberConfig {
  #[inline]
  fn default() -> Self {
    Self {
      ops_budget: consts::DEFAULT_FIBER_OPS_BUDGET,
      stm_yield_op_count: consts::DEFAULT_STM_YIELD_OP_COUNT,
    }
  }
}

// -----------------------------------------------------------------------------
// Fiber Core
// -----------------------------------------------------------------------------

/// The type-erased, shared half of a fiber.
///
/// Handles, parents, and scopes hold this to interrupt and await a fiber
/// without knowing its result type.
pub(crate) struct FiberCore {
  pub(crate) id: FiberId,
  pub(crate) parent: FiberId,
  flags: AtomicU32,
  state: Mutex<CoreState>,
  done: Notify,
}

struct CoreState {
  interruptors: FiberId,
  waker: Option<Waker>,
  exit: Option<Exit<(), ()>>,
  children: HashMap<FiberId, Arc<FiberCore>>,
}

impl FiberCore {
  pub(crate) fn new(id: FiberId, parent: FiberId, flags: FiberFlags) -> Self {
    Self {
      id,
      parent,
      flags: AtomicU32::new(flags.bits()),
      state: Mutex::new(CoreState {
        interruptors: FiberId::NONE,
        waker: None,
        exit: None,
        children: HashMap::new(),
      }),
      done: Notify::new(),
    }
  }

  #[inline]
  pub(crate) fn flags(&self) -> FiberFlags {
    FiberFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
  }

  #[inline]
  pub(crate) fn is_done(&self) -> bool {
    self.flags().contains(FiberFlags::DONE)
  }

  /// Records an interruption request and wakes the fiber.
  ///
  /// Requests made after the fiber is done are ignored.
  pub(crate) fn request_interrupt(&self, by: FiberId) {
    let mut state = self.state.lock();

    if self.is_done() {
      return;
    }

    state.interruptors = state.interruptors.combine(&by);
    self.flags.fetch_or(FiberFlags::INTERRUPTED.bits(), Ordering::AcqRel);

    let waker: Option<Waker> = state.waker.clone();

    drop(state);

    tracing::debug!(target: "strand", fiber = %self.id, by = %by, "Fiber Interrupt");

    if let Some(waker) = waker {
      waker.wake();
    }
  }

  /// Returns the combined id of every interruptor, if interruption was
  /// requested.
  pub(crate) fn interruptors(&self) -> Option<FiberId> {
    if self.flags().contains(FiberFlags::INTERRUPTED) {
      Some(self.state.lock().interruptors.clone())
    } else {
      None
    }
  }

  /// Stores the waker used to resume the fiber after an interruption request.
  pub(crate) fn register(&self, waker: &Waker) {
    let mut state = self.state.lock();

    match state.waker.as_ref() {
      Some(known) if known.will_wake(waker) => {}
      _ => state.waker = Some(waker.clone()),
    }
  }

  /// Publishes the final exit and releases every waiter.
  pub(crate) fn complete(&self, exit: Exit<(), ()>) {
    let mut state = self.state.lock();

    if state.exit.is_some() {
      raise!(Error, SysInv, "duplicate fiber exit");
    }

    state.exit = Some(exit);
    state.waker = None;

    self.flags.fetch_or(FiberFlags::DONE.bits(), Ordering::AcqRel);

    drop(state);

    self.done.notify_waiters();
  }

  /// Returns the erased exit, if the fiber is done.
  #[inline]
  pub(crate) fn exit(&self) -> Option<Exit<(), ()>> {
    self.state.lock().exit.clone()
  }

  /// Waits until the fiber is done and returns its erased exit.
  pub(crate) async fn await_done(&self) -> Exit<(), ()> {
    'wait: loop {
      let notified: Notified<'_> = self.done.notified();

      tokio::pin!(notified);

      notified.as_mut().enable();

      if let Some(exit) = self.exit() {
        break 'wait exit;
      }

      notified.await;
    }
  }

  pub(crate) fn attach(&self, child: Arc<FiberCore>) {
    self.state.lock().children.insert(child.id.clone(), child);
  }

  pub(crate) fn detach(&self, child: &FiberId) {
    self.state.lock().children.remove(child);
  }

  pub(crate) fn children(&self) -> Vec<FiberId> {
    self.state.lock().children.keys().cloned().collect()
  }

  pub(crate) fn take_children(&self) -> Vec<Arc<FiberCore>> {
    self
      .state
      .lock()
      .children
      .drain()
      .map(|(_, child)| child)
      .collect()
  }
}

// -----------------------------------------------------------------------------
// Fiber Context
// -----------------------------------------------------------------------------

#[derive(Clone, Copy)]
struct Mask {
  id: u64,
  interruptible: bool,
}

/// Task-local state of the running fiber.
///
/// Only the owning task ever touches the cells, so plain `RefCell`s are
/// enough; borrows are never held across an `.await`.
pub(crate) struct FiberContext {
  pub(crate) core: Arc<FiberCore>,
  pub(crate) config: FiberConfig,
  pub(crate) root_scope: Scope,
  masks: RefCell<Vec<Mask>>,
  refs: RefCell<FiberRefs>,
  ops: Cell<u32>,
  next_mask: Cell<u64>,
  stopping: Cell<bool>,
}

impl FiberContext {
  pub(crate) fn new(core: Arc<FiberCore>, config: FiberConfig, refs: FiberRefs) -> Self {
    Self {
      core,
      config,
      root_scope: Scope::new(),
      masks: RefCell::new(Vec::new()),
      refs: RefCell::new(refs),
      ops: Cell::new(0),
      next_mask: Cell::new(0),
      stopping: Cell::new(false),
    }
  }

  /// Sets the task-local fiber context.
  #[inline]
  pub(crate) fn scope<F>(context: Self, future: F) -> TaskLocalFuture<Self, F>
  where
    F: Future,
  {
    CONTEXT.scope(context, future)
  }

  /// Accesses the current fiber context and runs the given function.
  ///
  /// Raises `BadArg` when called outside of a fiber.
  #[inline]
  pub(crate) fn with<F, R>(f: F) -> R
  where
    F: FnOnce(&Self) -> R,
  {
    match CONTEXT.try_with(f) {
      Ok(result) => result,
      Err(_) => raise!(Error, BadArg, "not running inside of a fiber"),
    }
  }

  /// Like [`FiberContext::with`], returning `None` outside of a fiber.
  #[inline]
  pub(crate) fn try_with<F, R>(f: F) -> Option<R>
  where
    F: FnOnce(&Self) -> R,
  {
    CONTEXT.try_with(f).ok()
  }

  /// Returns the id of the current fiber, or [`FiberId::NONE`].
  #[inline]
  pub(crate) fn current_id() -> FiberId {
    Self::try_with(|this| this.core.id.clone()).unwrap_or_default()
  }

  /// Marks the body as being torn down by the fiber driver.
  #[inline]
  pub(crate) fn mark_stopping(&self) {
    self.stopping.set(true);
  }

  /// Returns `true` once the driver has started dropping the fiber body.
  ///
  /// Cleanup left in the root scope at that point still runs when the
  /// driver closes it.
  #[inline]
  pub(crate) fn is_stopping(&self) -> bool {
    self.stopping.get()
  }

  // ---------------------------------------------------------------------------
  // Interruption
  // ---------------------------------------------------------------------------

  #[inline]
  pub(crate) fn is_interruptible(&self) -> bool {
    self
      .masks
      .borrow()
      .last()
      .is_none_or(|mask| mask.interruptible)
  }

  /// Returns the interruptors if the fiber should stop at the next
  /// suspension point.
  #[inline]
  pub(crate) fn should_interrupt(&self) -> Option<FiberId> {
    if self.is_interruptible() {
      self.core.interruptors()
    } else {
      None
    }
  }

  pub(crate) fn push_mask(&self, interruptible: bool) -> u64 {
    let id: u64 = self.next_mask.get() + 1;

    self.next_mask.set(id);
    self.masks.borrow_mut().push(Mask { id, interruptible });

    id
  }

  /// Removes the mask region with the given id.
  ///
  /// Regions normally end innermost first, but a dropped future may end an
  /// outer region early, so lookup is by id rather than by position.
  pub(crate) fn pop_mask(&self, id: u64) {
    let mut masks: RefMut<'_, Vec<Mask>> = self.masks.borrow_mut();

    if let Some(index) = masks.iter().rposition(|mask| mask.id == id) {
      masks.remove(index);
    }
  }

  // ---------------------------------------------------------------------------
  // Budget
  // ---------------------------------------------------------------------------

  /// Counts one runtime operation, returning `true` when the fiber spent its
  /// budget and should yield.
  #[inline]
  pub(crate) fn tick(&self) -> bool {
    let ops: u32 = self.ops.get() + 1;

    if ops >= self.config.ops_budget {
      self.ops.set(0);
      true
    } else {
      self.ops.set(ops);
      false
    }
  }

  // ---------------------------------------------------------------------------
  // Fiber Refs
  // ---------------------------------------------------------------------------

  #[inline]
  pub(crate) fn refs(&self) -> Ref<'_, FiberRefs> {
    self.refs.borrow()
  }

  #[inline]
  pub(crate) fn refs_mut(&self) -> RefMut<'_, FiberRefs> {
    self.refs.borrow_mut()
  }

  #[inline]
  pub(crate) fn take_refs(&self) -> FiberRefs {
    self.refs.take()
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use triomphe::Arc;

  use crate::core::Exit;
  use crate::core::FiberId;
  use crate::fiber::FiberRefs;
  use crate::fiber::context::FiberConfig;
  use crate::fiber::context::FiberContext;
  use crate::fiber::context::FiberCore;
  use crate::fiber::context::FiberFlags;

  fn context() -> FiberContext {
    let core: FiberCore = FiberCore::new(FiberId::next(), FiberId::NONE, FiberFlags::empty());
    let config: FiberConfig = FiberConfig {
      ops_budget: 3,
      stm_yield_op_count: 1,
    };

    FiberContext::new(Arc::new(core), config, FiberRefs::new())
  }

  #[test]
  fn test_masks_are_a_stack() {
    let context: FiberContext = context();

    assert!(context.is_interruptible());

    let outer: u64 = context.push_mask(false);
    let inner: u64 = context.push_mask(true);

    assert!(context.is_interruptible());

    context.pop_mask(inner);

    assert!(!context.is_interruptible());

    context.pop_mask(outer);

    assert!(context.is_interruptible());
  }

  #[test]
  fn test_masks_pop_out_of_order() {
    let context: FiberContext = context();

    let outer: u64 = context.push_mask(true);
    let inner: u64 = context.push_mask(false);

    context.pop_mask(outer);

    assert!(!context.is_interruptible());

    context.pop_mask(inner);

    assert!(context.is_interruptible());
  }

  #[test]
  fn test_should_interrupt_respects_mask() {
    let context: FiberContext = context();
    let by: FiberId = FiberId::next();

    assert!(context.should_interrupt().is_none());

    let mask: u64 = context.push_mask(false);

    context.core.request_interrupt(by.clone());

    assert!(context.should_interrupt().is_none());

    context.pop_mask(mask);

    assert_eq!(context.should_interrupt(), Some(by));
  }

  #[test]
  fn test_tick_budget() {
    let context: FiberContext = context();

    assert!(!context.tick());
    assert!(!context.tick());
    assert!(context.tick());
    assert!(!context.tick());
  }

  #[test]
  fn test_interrupt_after_done_is_ignored() {
    let core: FiberCore = FiberCore::new(FiberId::next(), FiberId::NONE, FiberFlags::empty());

    core.complete(Exit::UNIT);
    core.request_interrupt(FiberId::next());

    assert!(core.is_done());
    assert!(core.interruptors().is_none());
    assert_eq!(core.exit(), Some(Exit::UNIT));
  }
}
