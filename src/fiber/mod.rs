//! Fibers and the runtime that drives them.
//!
//! A fiber is a lightweight unit of concurrent work: a future returning
//! `Result<A, Cause<E>>`, run on a tokio task by a driver that adds
//! structured-concurrency semantics on top:
//!
//! - **Interruption** is cooperative. [`Fiber::interrupt`] flags the target,
//!   which stops at its next suspension point unless it is inside an
//!   [`uninterruptible`] region. Regions form a stack, so nested regions
//!   restore exactly the interruptibility that was in effect before them.
//! - **Finalization** runs after the body stops. Every fiber owns a root
//!   [`Scope`] that is closed with the fiber's exit, which is what makes
//!   [`ensuring`], [`on_exit`], and [`scoped`] reliable under interruption.
//! - **Children** forked with [`fork`] are interrupted and awaited when their
//!   parent ends. [`fork_daemon`] opts out, [`fork_in`] binds a child to a
//!   scope instead.
//! - **Fiber-local state** lives in [`FiberRef`]s, inherited on fork and
//!   merged back on [`Fiber::join`].
//! - **Fairness** comes from [`checkpoint`], which every runtime primitive
//!   passes through; a fiber yields to the host scheduler after a fixed number
//!   of operations.
//!
//! # Examples
//!
//! ```no_run
//! use strand::core::Cause;
//! use strand::core::Exit;
//! use strand::core::Never;
//! use strand::fiber;
//! use strand::fiber::Runtime;
//! use strand::fiber::RuntimeConfig;
//!
//! let runtime: Runtime = Runtime::new(RuntimeConfig::default()).unwrap();
//!
//! let exit: Exit<u32, Never> = runtime.block_on(async {
//!   let child = fiber::fork(async { Ok::<u32, Cause<Never>>(21) });
//!   let exit: Exit<u32, Never> = child.join().await;
//!
//!   exit.map(|value| value * 2).into_result()
//! });
//!
//! assert_eq!(exit.into_result().ok(), Some(42));
//! ```
//!
//! [`Scope`]: crate::scope::Scope
//! [`scoped`]: crate::scope::scoped

mod checkpoint;
mod combinators;
mod context;
mod fiber_ref;
mod fork;
mod handle;
mod mask;
mod runtime;
mod signal;

pub use self::checkpoint::Checkpoint;
pub use self::checkpoint::checkpoint;
pub use self::checkpoint::children;
pub use self::checkpoint::id;
pub use self::checkpoint::interrupt;
pub use self::checkpoint::sleep;
pub use self::checkpoint::yield_now;
pub use self::combinators::ensuring;
pub use self::combinators::for_each_par;
pub use self::combinators::on_exit;
pub use self::combinators::on_interrupt;
pub use self::combinators::race;
pub use self::combinators::supervised;
pub use self::combinators::zip_par;
pub use self::fiber_ref::Differ;
pub use self::fiber_ref::FiberRef;
pub use self::fork::fork;
pub use self::fork::fork_daemon;
pub use self::fork::fork_in;
pub use self::handle::Fiber;
pub use self::mask::Masked;
pub use self::mask::Restore;
pub use self::mask::interruptible;
pub use self::mask::is_interruptible;
pub use self::mask::uninterruptible;
pub use self::mask::uninterruptible_mask;
pub use self::runtime::Flavor;
pub use self::runtime::Runtime;
pub use self::runtime::RuntimeConfig;

pub(crate) use self::fiber_ref::FiberRefs;

use crate::fiber::context::FiberContext;
use crate::scope::Scope;

/// Returns the root scope of the current fiber, or `None` outside of a fiber.
#[inline]
pub(crate) fn root_scope() -> Option<Scope> {
  FiberContext::try_with(|fiber| fiber.root_scope.clone())
}

/// Returns the number of interpreted STM steps between re-validations for the
/// current fiber.
#[inline]
pub(crate) fn stm_yield_op_count() -> u32 {
  FiberContext::try_with(|fiber| fiber.config.stm_yield_op_count)
    .unwrap_or(crate::consts::DEFAULT_STM_YIELD_OP_COUNT)
}
