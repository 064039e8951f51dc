use std::pin::Pin;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;
use tokio::time;

use crate::core::Cause;
use crate::core::FiberId;
use crate::fiber::context::FiberContext;

// -----------------------------------------------------------------------------
// Checkpoint
// -----------------------------------------------------------------------------

/// Future returned by [`checkpoint`].
#[must_use = "futures do nothing unless you `.await` or poll them"]
#[derive(Debug)]
pub struct Checkpoint {
  yielded: bool,
  force: bool,
}

impl Future for Checkpoint {
  type Output = ();

  fn poll(mut self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Self::Output> {
    if self.yielded {
      return Poll::Ready(());
    }

    let force: bool = self.force;
    let park: bool = FiberContext::try_with(|fiber| {
      fiber.should_interrupt().is_some() || fiber.tick() || force
    })
    .unwrap_or(force);

    if park {
      self.yielded = true;
      context.waker().wake_by_ref();
      Poll::Pending
    } else {
      Poll::Ready(())
    }
  }
}

/// Counts one operation against the current fiber's budget.
///
/// Yields to the host scheduler once the budget is spent, and is the point
/// at which a pending interruption request stops an interruptible fiber.
/// Outside of a fiber this completes immediately.
#[inline]
pub fn checkpoint() -> Checkpoint {
  Checkpoint {
    yielded: false,
    force: false,
  }
}

/// Yields to the host scheduler unconditionally.
///
/// Also an interruption point.
#[inline]
pub fn yield_now() -> Checkpoint {
  Checkpoint {
    yielded: false,
    force: true,
  }
}

/// Suspends the current fiber for `duration`.
pub async fn sleep(duration: Duration) {
  checkpoint().await;
  time::sleep(duration).await;
}

// -----------------------------------------------------------------------------
// Current Fiber
// -----------------------------------------------------------------------------

/// Returns the id of the current fiber, or [`FiberId::NONE`] outside of a
/// fiber.
#[inline]
pub fn id() -> FiberId {
  FiberContext::current_id()
}

/// Returns the ids of the live children attached to the current fiber.
pub fn children() -> Vec<FiberId> {
  FiberContext::try_with(|fiber| fiber.core.children()).unwrap_or_default()
}

/// Interrupts the current fiber.
///
/// Returns the interruption as a failure so that `?` unwinds the body right
/// away. The fiber stays flagged, so even if the failure is caught the fiber
/// stops at its next interruptible suspension point.
pub async fn interrupt<A, E>() -> Result<A, Cause<E>> {
  let this: FiberId = FiberContext::current_id();

  FiberContext::try_with(|fiber| fiber.core.request_interrupt(this.clone()));

  checkpoint().await;

  Err(Cause::Interrupt(this))
}
