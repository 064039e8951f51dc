// Adapted from the `CatchUnwind` combinator of the `futures` crate:
//
// https://docs.rs/futures/0.3.31/futures/future/struct.CatchUnwind.html

use pin_project_lite::pin_project;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::Context;
use std::task::Poll;

use crate::core::Defect;

pin_project! {
  /// Polls the inner future, turning a panic raised while polling into a
  /// [`Defect`].
  #[derive(Debug)]
  #[repr(transparent)]
  pub(crate) struct CatchUnwind<F> {
    #[pin]
    future: F,
  }
}

impl<F> CatchUnwind<F>
where
  F: Future,
{
  #[inline]
  pub(crate) const fn new(future: F) -> Self {
    Self { future }
  }
}

impl<F> Future for CatchUnwind<F>
where
  F: Future,
{
  type Output = Result<F::Output, Defect>;

  fn poll(self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Self::Output> {
    let future: Pin<&mut F> = self.project().future;
    let assert: AssertUnwindSafe<_> = AssertUnwindSafe(|| future.poll(context));

    match panic::catch_unwind(assert) {
      Ok(poll) => poll.map(Ok),
      Err(payload) => Poll::Ready(Err(Defect::from_panic(payload))),
    }
  }
}
