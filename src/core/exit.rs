use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result;

use crate::core::Cause;
use crate::core::FiberId;

/// The final outcome of a fiber or effect.
#[derive(Clone, PartialEq)]
pub enum Exit<A, E> {
  /// The computation produced a value.
  Success(A),
  /// The computation failed with the given cause.
  Failure(Cause<E>),
}

impl<A, E> Exit<A, E> {
  /// Creates a successful exit.
  #[inline]
  pub const fn succeed(value: A) -> Self {
    Self::Success(value)
  }

  /// Creates an exit that failed with a typed error.
  #[inline]
  pub const fn fail(error: E) -> Self {
    Self::Failure(Cause::Fail(error))
  }

  /// Creates an exit that failed with the given cause.
  #[inline]
  pub const fn fail_cause(cause: Cause<E>) -> Self {
    Self::Failure(cause)
  }

  /// Creates an exit that died with a defect.
  #[inline]
  pub fn die(message: impl Into<String>) -> Self {
    Self::Failure(Cause::die(message.into()))
  }

  /// Creates an exit interrupted by the given fiber.
  #[inline]
  pub const fn interrupt(by: FiberId) -> Self {
    Self::Failure(Cause::Interrupt(by))
  }

  #[inline]
  pub const fn is_success(&self) -> bool {
    matches!(self, Self::Success(_))
  }

  #[inline]
  pub const fn is_failure(&self) -> bool {
    matches!(self, Self::Failure(_))
  }

  /// Returns `true` if this exit failed because of interruption.
  #[inline]
  pub fn is_interrupted(&self) -> bool {
    matches!(self, Self::Failure(cause) if cause.is_interrupted())
  }

  /// Returns the success value, if any.
  #[inline]
  pub const fn value(&self) -> Option<&A> {
    match self {
      Self::Success(value) => Some(value),
      Self::Failure(_) => None,
    }
  }

  /// Returns the failure cause, if any.
  #[inline]
  pub const fn cause(&self) -> Option<&Cause<E>> {
    match self {
      Self::Success(_) => None,
      Self::Failure(cause) => Some(cause),
    }
  }

  #[inline]
  pub fn map<F, B>(self, f: F) -> Exit<B, E>
  where
    F: FnOnce(A) -> B,
  {
    match self {
      Self::Success(value) => Exit::Success(f(value)),
      Self::Failure(cause) => Exit::Failure(cause),
    }
  }

  #[inline]
  pub fn map_err<F, T>(self, f: F) -> Exit<A, T>
  where
    F: FnMut(E) -> T,
  {
    match self {
      Self::Success(value) => Exit::Success(value),
      Self::Failure(cause) => Exit::Failure(cause.map(f)),
    }
  }

  /// Converts the exit into a `Result` over the full cause.
  #[inline]
  pub fn into_result(self) -> std::result::Result<A, Cause<E>> {
    match self {
      Self::Success(value) => Ok(value),
      Self::Failure(cause) => Err(cause),
    }
  }

  /// Erases both channels, keeping only the shape of the outcome.
  ///
  /// This is the form observed by finalizers and supervisors.
  #[inline]
  pub fn erase(&self) -> Exit<(), ()> {
    match self {
      Self::Success(_) => Exit::Success(()),
      Self::Failure(cause) => Exit::Failure(cause.erase()),
    }
  }

  /// Combines two exits that ran one after the other.
  ///
  /// Fails if either side failed; when both failed the causes compose with
  /// [`Cause::then`].
  pub fn zip<B>(self, other: Exit<B, E>) -> Exit<(A, B), E> {
    match (self, other) {
      (Self::Success(lhs), Exit::Success(rhs)) => Exit::Success((lhs, rhs)),
      (Self::Success(_), Exit::Failure(rhs)) => Exit::Failure(rhs),
      (Self::Failure(lhs), Exit::Success(_)) => Exit::Failure(lhs),
      (Self::Failure(lhs), Exit::Failure(rhs)) => Exit::Failure(lhs.then(rhs)),
    }
  }

  /// Combines two exits that ran concurrently.
  ///
  /// Like [`Exit::zip`], but failures compose with [`Cause::both`].
  pub fn zip_par<B>(self, other: Exit<B, E>) -> Exit<(A, B), E> {
    match (self, other) {
      (Self::Success(lhs), Exit::Success(rhs)) => Exit::Success((lhs, rhs)),
      (Self::Success(_), Exit::Failure(rhs)) => Exit::Failure(rhs),
      (Self::Failure(lhs), Exit::Success(_)) => Exit::Failure(lhs),
      (Self::Failure(lhs), Exit::Failure(rhs)) => Exit::Failure(lhs.both(rhs)),
    }
  }
}

impl<E> Exit<(), E> {
  /// The unit success.
  pub const UNIT: Self = Self::Success(());
}

impl<A, E> From<std::result::Result<A, Cause<E>>> for Exit<A, E> {
  #[inline]
  fn from(other: std::result::Result<A, Cause<E>>) -> Self {
    match other {
      Ok(value) => Self::Success(value),
      Err(cause) => Self::Failure(cause),
    }
  }
}

impl<A, E> Debug for Exit<A, E>
where
  A: Debug,
  E: Debug,
{
  fn fmt(&self, f: &mut Formatter<'_>) -> Result {
    match self {
      Self::Success(value) => f.debug_tuple("Success").field(value).finish(),
      Self::Failure(cause) => f.debug_tuple("Failure").field(cause).finish(),
    }
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use crate::core::Cause;
  use crate::core::Exit;
  use crate::core::FiberId;

  #[test]
  fn test_zip_sequential() {
    let lhs: Exit<u32, &str> = Exit::fail("a");
    let rhs: Exit<u32, &str> = Exit::fail("b");

    assert_eq!(
      lhs.zip(rhs),
      Exit::fail_cause(Cause::fail("a").then(Cause::fail("b"))),
    );
  }

  #[test]
  fn test_zip_parallel() {
    let lhs: Exit<u32, &str> = Exit::fail("a");
    let rhs: Exit<u32, &str> = Exit::fail("b");

    assert_eq!(
      lhs.zip_par(rhs),
      Exit::fail_cause(Cause::fail("b").both(Cause::fail("a"))),
    );
  }

  #[test]
  fn test_zip_success() {
    let lhs: Exit<u32, ()> = Exit::succeed(1);
    let rhs: Exit<&str, ()> = Exit::succeed("x");

    assert_eq!(lhs.zip(rhs), Exit::succeed((1, "x")));
  }

  #[test]
  fn test_erase() {
    let exit: Exit<u32, &str> = Exit::fail("a");

    assert_eq!(exit.erase(), Exit::fail(()));
    assert!(Exit::<u32, ()>::interrupt(FiberId::next()).is_interrupted());
  }

  #[test]
  fn test_result_conversion() {
    let exit: Exit<u32, &str> = Exit::from(Ok(5));

    assert_eq!(exit.value(), Some(&5));
    assert_eq!(exit.into_result().unwrap(), 5);

    let exit: Exit<u32, &str> = Exit::from(Err(Cause::fail("x")));

    assert!(exit.cause().is_some_and(Cause::is_failure));
  }
}
