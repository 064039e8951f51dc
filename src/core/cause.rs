use std::convert::Infallible;
use std::fmt::Debug;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result;

use crate::core::Defect;
use crate::core::FiberId;

/// The full story of why a computation failed.
///
/// A cause is a tree whose leaves are typed failures, defects, and
/// interruptions, and whose branches record how those leaves relate in time:
///
/// - [`Cause::Then`]: the right side happened after the left side finished
///   unwinding (e.g. a finalizer failing after the body failed).
/// - [`Cause::Both`]: the two sides happened concurrently (e.g. both arms of
///   a parallel zip failed).
///
/// # Equivalence
///
/// `PartialEq` compares causes structurally, not syntactically. Both
/// composition operators are associative, [`Cause::Empty`] is their identity,
/// and [`Cause::Both`] is also commutative. [`Cause::Then`] is not.
///
/// ```
/// use strand::core::Cause;
///
/// let a: Cause<&str> = Cause::fail("a");
/// let b: Cause<&str> = Cause::fail("b");
/// let c: Cause<&str> = Cause::fail("c");
///
/// assert_eq!(
///   a.clone().then(b.clone()).then(c.clone()),
///   a.clone().then(b.clone().then(c.clone())),
/// );
///
/// assert_eq!(a.clone().both(b.clone()), b.clone().both(a.clone()));
/// assert_ne!(a.clone().then(b.clone()), b.then(a));
/// ```
#[derive(Clone)]
pub enum Cause<E> {
  /// No failure.
  Empty,
  /// An expected, typed failure.
  Fail(E),
  /// An unexpected defect.
  Die(Defect),
  /// Interruption requested by the given fiber.
  Interrupt(FiberId),
  /// Sequential composition.
  Then(Box<Cause<E>>, Box<Cause<E>>),
  /// Parallel composition.
  Both(Box<Cause<E>>, Box<Cause<E>>),
}

impl<E> Cause<E> {
  // ---------------------------------------------------------------------------
  // Constructors
  // ---------------------------------------------------------------------------

  /// Creates a typed failure.
  #[inline]
  pub const fn fail(error: E) -> Self {
    Self::Fail(error)
  }

  /// Creates a defect with the given message.
  #[inline]
  pub fn die(defect: impl Into<Defect>) -> Self {
    Self::Die(defect.into())
  }

  /// Creates an interruption by the given fiber.
  #[inline]
  pub const fn interrupt(by: FiberId) -> Self {
    Self::Interrupt(by)
  }

  /// Composes `self` and `next` sequentially, skipping empty sides.
  pub fn then(self, next: Self) -> Self {
    match (self, next) {
      (Self::Empty, next) => next,
      (this, Self::Empty) => this,
      (this, next) => Self::Then(Box::new(this), Box::new(next)),
    }
  }

  /// Composes `self` and `other` in parallel, skipping empty sides.
  pub fn both(self, other: Self) -> Self {
    match (self, other) {
      (Self::Empty, other) => other,
      (this, Self::Empty) => this,
      (this, other) => Self::Both(Box::new(this), Box::new(other)),
    }
  }

  // ---------------------------------------------------------------------------
  // Queries
  // ---------------------------------------------------------------------------

  /// Returns an iterator over the leaves of this cause, left to right.
  #[inline]
  pub fn leaves(&self) -> Leaves<'_, E> {
    Leaves { stack: vec![self] }
  }

  /// Returns `true` if this cause contains no failures at all.
  #[inline]
  pub fn is_empty(&self) -> bool {
    self.leaves().next().is_none()
  }

  /// Returns `true` if this cause contains a typed failure.
  #[inline]
  pub fn is_failure(&self) -> bool {
    self.leaves().any(|leaf| matches!(leaf, Self::Fail(_)))
  }

  /// Returns `true` if this cause contains a defect.
  #[inline]
  pub fn is_die(&self) -> bool {
    self.leaves().any(|leaf| matches!(leaf, Self::Die(_)))
  }

  /// Returns `true` if this cause contains an interruption.
  #[inline]
  pub fn is_interrupted(&self) -> bool {
    self.leaves().any(|leaf| matches!(leaf, Self::Interrupt(_)))
  }

  /// Returns `true` if this cause is non-empty and contains only
  /// interruptions.
  #[inline]
  pub fn is_interrupted_only(&self) -> bool {
    let mut seen: bool = false;

    for leaf in self.leaves() {
      if !matches!(leaf, Self::Interrupt(_)) {
        return false;
      }

      seen = true;
    }

    seen
  }

  /// Returns every typed failure, left to right.
  pub fn failures(&self) -> Vec<&E> {
    self
      .leaves()
      .filter_map(|leaf| match leaf {
        Self::Fail(error) => Some(error),
        _ => None,
      })
      .collect()
  }

  /// Returns every defect, left to right.
  pub fn defects(&self) -> Vec<&Defect> {
    self
      .leaves()
      .filter_map(|leaf| match leaf {
        Self::Die(defect) => Some(defect),
        _ => None,
      })
      .collect()
  }

  /// Returns the combined id of every interrupting fiber.
  pub fn interruptors(&self) -> FiberId {
    let ids: Vec<&FiberId> = self
      .leaves()
      .filter_map(|leaf| match leaf {
        Self::Interrupt(id) => Some(id),
        _ => None,
      })
      .collect();

    FiberId::combine_all(ids)
  }

  /// Returns the first typed failure, if any.
  #[inline]
  pub fn first_failure(&self) -> Option<&E> {
    self.failures().into_iter().next()
  }

  // ---------------------------------------------------------------------------
  // Transformations
  // ---------------------------------------------------------------------------

  /// Transforms every typed failure with `f`, preserving the tree shape.
  pub fn map<F, T>(self, mut f: F) -> Cause<T>
  where
    F: FnMut(E) -> T,
  {
    self.map_inner(&mut f)
  }

  fn map_inner<F, T>(self, f: &mut F) -> Cause<T>
  where
    F: FnMut(E) -> T,
  {
    match self {
      Self::Empty => Cause::Empty,
      Self::Fail(error) => Cause::Fail(f(error)),
      Self::Die(defect) => Cause::Die(defect),
      Self::Interrupt(id) => Cause::Interrupt(id),
      Self::Then(left, right) => {
        let left: Cause<T> = left.map_inner(f);
        let right: Cause<T> = right.map_inner(f);
        Cause::Then(Box::new(left), Box::new(right))
      }
      Self::Both(left, right) => {
        let left: Cause<T> = left.map_inner(f);
        let right: Cause<T> = right.map_inner(f);
        Cause::Both(Box::new(left), Box::new(right))
      }
    }
  }

  /// Returns the first typed failure, or the whole cause if there is none.
  pub fn failure_or_cause(self) -> std::result::Result<E, Self> {
    let index: Option<usize> = self
      .leaves()
      .position(|leaf| matches!(leaf, Self::Fail(_)));

    match index {
      Some(index) => match self.into_leaves().into_iter().nth(index) {
        Some(Self::Fail(error)) => Ok(error),
        _ => unreachable!(),
      },
      None => Err(self),
    }
  }

  /// Erases typed failures, keeping only the shape of the cause.
  #[inline]
  pub fn erase(&self) -> Cause<()> {
    match self {
      Self::Empty => Cause::Empty,
      Self::Fail(_) => Cause::Fail(()),
      Self::Die(defect) => Cause::Die(defect.clone()),
      Self::Interrupt(id) => Cause::Interrupt(id.clone()),
      Self::Then(left, right) => Cause::Then(Box::new(left.erase()), Box::new(right.erase())),
      Self::Both(left, right) => Cause::Both(Box::new(left.erase()), Box::new(right.erase())),
    }
  }

  /// Removes every typed failure.
  ///
  /// Returns `None` if nothing but typed failures remained.
  pub fn strip_failures(self) -> Option<Cause<Infallible>> {
    let stripped: Cause<Infallible> = self.strip_inner();

    if stripped.is_empty() {
      None
    } else {
      Some(stripped)
    }
  }

  fn strip_inner(self) -> Cause<Infallible> {
    match self {
      Self::Empty | Self::Fail(_) => Cause::Empty,
      Self::Die(defect) => Cause::Die(defect),
      Self::Interrupt(id) => Cause::Interrupt(id),
      Self::Then(left, right) => left.strip_inner().then(right.strip_inner()),
      Self::Both(left, right) => left.strip_inner().both(right.strip_inner()),
    }
  }

  fn into_leaves(self) -> Vec<Self> {
    let mut leaves: Vec<Self> = Vec::new();
    let mut stack: Vec<Self> = vec![self];

    while let Some(next) = stack.pop() {
      match next {
        Self::Empty => {}
        Self::Then(left, right) | Self::Both(left, right) => {
          stack.push(*right);
          stack.push(*left);
        }
        leaf => leaves.push(leaf),
      }
    }

    leaves
  }

  /// Linearizes the cause into sequential steps of parallel leaf sets.
  ///
  /// `Then` concatenates steps; `Both` merges the steps of each side
  /// index-wise. Duplicate leaves within a step collapse.
  fn linearize(&self) -> Vec<Vec<&Self>>
  where
    E: PartialEq,
  {
    match self {
      Self::Empty => Vec::new(),
      Self::Fail(_) | Self::Die(_) | Self::Interrupt(_) => vec![vec![self]],
      Self::Then(left, right) => {
        let mut steps: Vec<Vec<&Self>> = left.linearize();
        steps.extend(right.linearize());
        steps
      }
      Self::Both(left, right) => {
        let mut steps: Vec<Vec<&Self>> = left.linearize();

        for (index, step) in right.linearize().into_iter().enumerate() {
          if index == steps.len() {
            steps.push(Vec::new());
          }

          for leaf in step {
            if !steps[index].iter().any(|known| leaf_eq(known, leaf)) {
              steps[index].push(leaf);
            }
          }
        }

        steps
      }
    }
  }
}

impl Cause<Infallible> {
  /// Widens an error-free cause into any error type.
  #[inline]
  pub fn widen<E>(self) -> Cause<E> {
    self.map(|never| match never {})
  }
}

impl<E> Default for Cause<E> {
  #[inline]
  fn default() -> Self {
    Self::Empty
  }
}

impl<E> From<E> for Cause<E> {
  #[inline]
  fn from(other: E) -> Self {
    Self::Fail(other)
  }
}

impl<E> PartialEq for Cause<E>
where
  E: PartialEq,
{
  fn eq(&self, other: &Self) -> bool {
    let lhs: Vec<Vec<&Self>> = self.linearize();
    let rhs: Vec<Vec<&Self>> = other.linearize();

    lhs.len() == rhs.len()
      && lhs.iter().zip(rhs.iter()).all(|(lhs, rhs)| {
        lhs.len() == rhs.len()
          && lhs
            .iter()
            .all(|leaf| rhs.iter().any(|other| leaf_eq(leaf, other)))
      })
  }
}

impl<E> Debug for Cause<E>
where
  E: Debug,
{
  fn fmt(&self, f: &mut Formatter<'_>) -> Result {
    match self {
      Self::Empty => f.write_str("Empty"),
      Self::Fail(error) => f.debug_tuple("Fail").field(error).finish(),
      Self::Die(defect) => f.debug_tuple("Die").field(defect).finish(),
      Self::Interrupt(id) => f.debug_tuple("Interrupt").field(id).finish(),
      Self::Then(left, right) => f.debug_tuple("Then").field(left).field(right).finish(),
      Self::Both(left, right) => f.debug_tuple("Both").field(left).field(right).finish(),
    }
  }
}

impl<E> Display for Cause<E>
where
  E: Display,
{
  fn fmt(&self, f: &mut Formatter<'_>) -> Result {
    match self {
      Self::Empty => f.write_str("<empty>"),
      Self::Fail(error) => write!(f, "fail: {error}"),
      Self::Die(defect) => write!(f, "die: {defect}"),
      Self::Interrupt(id) => write!(f, "interrupted by {id}"),
      Self::Then(left, right) => write!(f, "({left} ; {right})"),
      Self::Both(left, right) => write!(f, "({left} | {right})"),
    }
  }
}

#[inline]
fn leaf_eq<E>(lhs: &Cause<E>, rhs: &Cause<E>) -> bool
where
  E: PartialEq,
{
  match (lhs, rhs) {
    (Cause::Fail(lhs), Cause::Fail(rhs)) => lhs == rhs,
    (Cause::Die(lhs), Cause::Die(rhs)) => lhs == rhs,
    (Cause::Interrupt(lhs), Cause::Interrupt(rhs)) => lhs == rhs,
    (_, _) => false,
  }
}

// -----------------------------------------------------------------------------
// Leaves
// -----------------------------------------------------------------------------

/// Iterator over the leaves of a [`Cause`], created by [`Cause::leaves`].
#[derive(Debug)]
pub struct Leaves<'a, E> {
  stack: Vec<&'a Cause<E>>,
}

impl<'a, E> Iterator for Leaves<'a, E> {
  type Item = &'a Cause<E>;

  fn next(&mut self) -> Option<Self::Item> {
    while let Some(next) = self.stack.pop() {
      match next {
        Cause::Empty => {}
        Cause::Then(left, right) | Cause::Both(left, right) => {
          self.stack.push(right);
          self.stack.push(left);
        }
        leaf => return Some(leaf),
      }
    }

    None
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use crate::core::Cause;
  use crate::core::Defect;
  use crate::core::FiberId;

  fn raw_then(lhs: Cause<u32>, rhs: Cause<u32>) -> Cause<u32> {
    Cause::Then(Box::new(lhs), Box::new(rhs))
  }

  fn raw_both(lhs: Cause<u32>, rhs: Cause<u32>) -> Cause<u32> {
    Cause::Both(Box::new(lhs), Box::new(rhs))
  }

  #[test]
  fn test_then_is_associative() {
    let a: Cause<u32> = Cause::fail(1);
    let b: Cause<u32> = Cause::die("b");
    let c: Cause<u32> = Cause::interrupt(FiberId::Runtime { id: 1, started_at: 0 });

    assert_eq!(
      raw_then(raw_then(a.clone(), b.clone()), c.clone()),
      raw_then(a, raw_then(b, c)),
    );
  }

  #[test]
  fn test_both_is_associative() {
    let a: Cause<u32> = Cause::fail(1);
    let b: Cause<u32> = Cause::fail(2);
    let c: Cause<u32> = Cause::fail(3);

    assert_eq!(
      raw_both(raw_both(a.clone(), b.clone()), c.clone()),
      raw_both(a, raw_both(b, c)),
    );
  }

  #[test]
  fn test_then_is_not_commutative() {
    let a: Cause<u32> = Cause::fail(1);
    let b: Cause<u32> = Cause::fail(2);

    assert_ne!(raw_then(a.clone(), b.clone()), raw_then(b, a));
  }

  #[test]
  fn test_both_is_commutative() {
    let a: Cause<u32> = Cause::fail(1);
    let b: Cause<u32> = Cause::die("b");

    assert_eq!(raw_both(a.clone(), b.clone()), raw_both(b, a));
  }

  #[test]
  fn test_empty_is_identity() {
    let a: Cause<u32> = Cause::fail(1);

    assert_eq!(raw_then(Cause::Empty, a.clone()), a);
    assert_eq!(raw_both(a.clone(), Cause::Empty), a);
    assert!(matches!(Cause::Empty.then(a.clone()), Cause::Fail(1)));
    assert!(matches!(a.both(Cause::Empty), Cause::Fail(1)));
  }

  #[test]
  fn test_both_distributes_over_steps() {
    let a: Cause<u32> = Cause::fail(1);
    let b: Cause<u32> = Cause::fail(2);
    let c: Cause<u32> = Cause::fail(3);

    // (a ; b) | c  ==  (a | c) ; b
    assert_eq!(
      raw_both(raw_then(a.clone(), b.clone()), c.clone()),
      raw_then(raw_both(a, c), b),
    );
  }

  #[test]
  fn test_queries() {
    let id: FiberId = FiberId::Runtime { id: 9, started_at: 0 };
    let cause: Cause<u32> = Cause::fail(1)
      .then(Cause::die("boom"))
      .both(Cause::interrupt(id.clone()));

    assert!(!cause.is_empty());
    assert!(cause.is_failure());
    assert!(cause.is_die());
    assert!(cause.is_interrupted());
    assert!(!cause.is_interrupted_only());
    assert_eq!(cause.failures(), vec![&1]);
    assert_eq!(cause.defects(), vec![&Defect::new("boom")]);
    assert_eq!(cause.interruptors(), id);
  }

  #[test]
  fn test_is_interrupted_only() {
    let id: FiberId = FiberId::next();

    assert!(Cause::<u32>::interrupt(id.clone()).is_interrupted_only());
    assert!(!Cause::<u32>::Empty.is_interrupted_only());
    assert!(!Cause::<u32>::interrupt(id).then(Cause::fail(1)).is_interrupted_only());
  }

  #[test]
  fn test_failure_or_cause() {
    let cause: Cause<u32> = Cause::die("x").then(Cause::fail(7)).then(Cause::fail(8));

    assert_eq!(cause.failure_or_cause().unwrap(), 7);
    assert!(Cause::<u32>::die("x").failure_or_cause().is_err());
  }

  #[test]
  fn test_map_preserves_shape() {
    let cause: Cause<String> = Cause::fail(1_u32)
      .both(Cause::fail(2))
      .map(|error| error.to_string());

    assert_eq!(cause, Cause::fail("1".to_owned()).both(Cause::fail("2".to_owned())));
  }

  #[test]
  fn test_strip_failures() {
    assert!(Cause::fail(1_u32).strip_failures().is_none());

    let stripped = Cause::fail(1_u32).then(Cause::die("d")).strip_failures();

    assert!(stripped.is_some_and(|cause| cause.is_die()));
  }

  #[test]
  fn test_display() {
    let cause: Cause<&str> = Cause::fail("a").then(Cause::die("b"));

    assert_eq!(cause.to_string(), "(fail: a ; die: b)");
  }
}
