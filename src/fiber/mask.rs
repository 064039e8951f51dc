use pin_project_lite::pin_project;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;
use std::task::ready;

use crate::fiber::context::FiberContext;

// -----------------------------------------------------------------------------
// Masked
// -----------------------------------------------------------------------------

pin_project! {
  /// A future running inside an interruptibility region.
  ///
  /// The region is entered on first poll and left when the future completes
  /// or is dropped. Leaving the region restores exactly the interruptibility
  /// that was in effect before it.
  ///
  /// Created by [`uninterruptible`], [`interruptible`], and [`Restore::apply`].
  #[must_use = "futures do nothing unless you `.await` or poll them"]
  pub struct Masked<F> where F: Future {
    #[pin]
    future: F,
    interruptible: bool,
    entry: Option<u64>,
    output: Option<F::Output>,
  }

  impl<F> PinnedDrop for Masked<F> where F: Future {
    fn drop(this: Pin<&mut Self>) {
      let this = this.project();

      if let Some(entry) = this.entry.take() {
        FiberContext::try_with(|context| context.pop_mask(entry));
      }
    }
  }
}

impl<F> Masked<F>
where
  F: Future,
{
  #[inline]
  const fn new(future: F, interruptible: bool) -> Self {
    Self {
      future,
      interruptible,
      entry: None,
      output: None,
    }
  }
}

impl<F> Future for Masked<F>
where
  F: Future,
{
  type Output = F::Output;

  fn poll(self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Self::Output> {
    let this = self.project();

    if let Some(output) = this.output.take() {
      return Poll::Ready(output);
    }

    if this.entry.is_none() {
      *this.entry = FiberContext::try_with(|fiber| fiber.push_mask(*this.interruptible));
    }

    let output: F::Output = ready!(this.future.poll(context));

    let Some(entry) = this.entry.take() else {
      return Poll::Ready(output);
    };

    // An interruption that arrived inside an uninterruptible region takes
    // effect as soon as the region ends.
    let interrupted: bool = FiberContext::with(|fiber| {
      fiber.pop_mask(entry);
      fiber.should_interrupt().is_some()
    });

    if interrupted {
      *this.output = Some(output);
      context.waker().wake_by_ref();
      Poll::Pending
    } else {
      Poll::Ready(output)
    }
  }
}

// -----------------------------------------------------------------------------
// Restore
// -----------------------------------------------------------------------------

/// Restores the interruptibility captured by [`uninterruptible_mask`].
#[derive(Clone, Copy, Debug)]
pub struct Restore {
  interruptible: bool,
}

impl Restore {
  /// Runs `future` with the interruptibility in effect when the enclosing
  /// mask was entered.
  #[inline]
  pub fn apply<F>(self, future: F) -> Masked<F>
  where
    F: Future,
  {
    Masked::new(future, self.interruptible)
  }
}

// -----------------------------------------------------------------------------
// Region Builders
// -----------------------------------------------------------------------------

/// Runs `future` without honoring interruption requests.
///
/// A request that arrives while the future runs is held until the region
/// ends; the fiber then stops at its next suspension point.
#[inline]
pub fn uninterruptible<F>(future: F) -> Masked<F>
where
  F: Future,
{
  Masked::new(future, false)
}

/// Runs `future` honoring interruption requests, even inside an enclosing
/// uninterruptible region.
#[inline]
pub fn interruptible<F>(future: F) -> Masked<F>
where
  F: Future,
{
  Masked::new(future, true)
}

/// Runs the future built by `f` uninterruptibly, handing `f` a [`Restore`]
/// that reopens the interruptibility of the caller for selected parts.
///
/// ```no_run
/// use strand::fiber;
///
/// # async fn example() {
/// fiber::uninterruptible_mask(|restore| async move {
///   // acquire: never interrupted
///   restore.apply(async { /* use: interruptible if the caller was */ }).await;
///   // release: never interrupted
/// })
/// .await;
/// # }
/// ```
pub async fn uninterruptible_mask<F, Fut>(f: F) -> Fut::Output
where
  F: FnOnce(Restore) -> Fut,
  Fut: Future,
{
  let restore: Restore = Restore {
    interruptible: is_interruptible(),
  };

  uninterruptible(f(restore)).await
}

/// Returns `true` if the current fiber honors interruption right now.
///
/// Outside of a fiber this is always `true`.
#[inline]
pub fn is_interruptible() -> bool {
  FiberContext::try_with(FiberContext::is_interruptible).unwrap_or(true)
}
