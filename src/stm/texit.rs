use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result;

use crate::core::Cause;
use crate::core::Defect;
use crate::core::Exit;
use crate::core::FiberId;

/// The outcome of a single run of a transaction.
///
/// Unlike [`Exit`], a transaction may also end with [`TExit::Retry`], which
/// never escapes [`Stm::commit`]: the committing fiber suspends until one of
/// the refs the transaction read changes and then runs it again.
///
/// [`Stm::commit`]: crate::stm::Stm::commit
#[derive(Clone, PartialEq)]
pub enum TExit<A, E> {
  /// The transaction failed with a typed error.
  Fail(E),
  /// The transaction hit a defect.
  Die(Defect),
  /// The transaction interrupted the committing fiber.
  Interrupt(FiberId),
  /// The transaction produced a value.
  Succeed(A),
  /// The transaction asked to run again once its inputs change.
  Retry,
}

impl<A, E> TExit<A, E> {
  #[inline]
  pub const fn is_succeed(&self) -> bool {
    matches!(self, Self::Succeed(_))
  }

  #[inline]
  pub const fn is_retry(&self) -> bool {
    matches!(self, Self::Retry)
  }

  /// Transforms the success value.
  pub fn map<F, B>(self, f: F) -> TExit<B, E>
  where
    F: FnOnce(A) -> B,
  {
    match self {
      Self::Fail(error) => TExit::Fail(error),
      Self::Die(defect) => TExit::Die(defect),
      Self::Interrupt(by) => TExit::Interrupt(by),
      Self::Succeed(value) => TExit::Succeed(f(value)),
      Self::Retry => TExit::Retry,
    }
  }

  /// Transforms the typed error.
  pub fn map_err<F, T>(self, f: F) -> TExit<A, T>
  where
    F: FnOnce(E) -> T,
  {
    match self {
      Self::Fail(error) => TExit::Fail(f(error)),
      Self::Die(defect) => TExit::Die(defect),
      Self::Interrupt(by) => TExit::Interrupt(by),
      Self::Succeed(value) => TExit::Succeed(value),
      Self::Retry => TExit::Retry,
    }
  }

  /// Converts a terminal outcome into an [`Exit`].
  ///
  /// Returns `None` for [`TExit::Retry`].
  pub fn into_exit(self) -> Option<Exit<A, E>> {
    match self {
      Self::Fail(error) => Some(Exit::Failure(Cause::Fail(error))),
      Self::Die(defect) => Some(Exit::Failure(Cause::Die(defect))),
      Self::Interrupt(by) => Some(Exit::Failure(Cause::Interrupt(by))),
      Self::Succeed(value) => Some(Exit::Success(value)),
      Self::Retry => None,
    }
  }
}

impl<A, E> Debug for TExit<A, E>
where
  A: Debug,
  E: Debug,
{
  fn fmt(&self, f: &mut Formatter<'_>) -> Result {
    match self {
      Self::Fail(error) => f.debug_tuple("Fail").field(error).finish(),
      Self::Die(defect) => f.debug_tuple("Die").field(defect).finish(),
      Self::Interrupt(by) => f.debug_tuple("Interrupt").field(by).finish(),
      Self::Succeed(value) => f.debug_tuple("Succeed").field(value).finish(),
      Self::Retry => f.write_str("Retry"),
    }
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
