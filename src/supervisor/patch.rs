use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result;
use std::sync::LazyLock;

use crate::fiber::Differ;
use crate::fiber::FiberRef;
use crate::supervisor::Supervisor;
use crate::supervisor::supervisor::Leaf;

/// The supervisor tree of the current fiber.
///
/// Children inherit it on fork. On join, only the leaves a child added or
/// removed are applied to the parent, so concurrent changes on both sides
/// survive.
pub(crate) static CURRENT: LazyLock<FiberRef<Supervisor>> =
  LazyLock::new(|| FiberRef::with_differ::<SupervisorDiffer>(Supervisor::none()));

// -----------------------------------------------------------------------------
// Supervisor Patch
// -----------------------------------------------------------------------------

/// A change to a supervisor tree, described by the leaves it adds and
/// removes.
#[derive(Clone, Default)]
pub enum SupervisorPatch {
  /// Changes nothing.
  #[default]
  Empty,
  /// Composes a supervisor into the tree with [`Supervisor::zip`].
  Add(Supervisor),
  /// Removes the leaf with the given id.
  Remove(u64),
  /// Applies the first patch, then the second.
  AndThen(Box<SupervisorPatch>, Box<SupervisorPatch>),
}

impl SupervisorPatch {
  #[inline]
  pub const fn empty() -> Self {
    Self::Empty
  }

  /// Returns a patch that applies `self` and then `next`.
  pub fn combine(self, next: Self) -> Self {
    match (self, next) {
      (Self::Empty, next) => next,
      (this, Self::Empty) => this,
      (this, next) => Self::AndThen(Box::new(this), Box::new(next)),
    }
  }

  /// Computes the patch that turns `old` into `new`.
  ///
  /// Trees are compared by the set of leaves they contain: leaves only in
  /// `new` are added, leaves only in `old` are removed. The structure of
  /// either tree is not preserved.
  pub fn diff(old: &Supervisor, new: &Supervisor) -> Self {
    let old: BTreeMap<u64, Leaf> = old.leaves();
    let new: BTreeMap<u64, Leaf> = new.leaves();

    let removed: Self = old
      .keys()
      .filter(|id| !new.contains_key(id))
      .fold(Self::Empty, |patch, id| patch.combine(Self::Remove(*id)));

    new
      .into_iter()
      .filter(|(id, _)| !old.contains_key(id))
      .fold(removed, |patch, (_, leaf)| {
        patch.combine(Self::Add(Supervisor::from_leaf(leaf)))
      })
  }

  /// Applies this patch to `supervisor`.
  pub fn apply(&self, supervisor: &Supervisor) -> Supervisor {
    let mut output: Supervisor = supervisor.clone();
    let mut stack: Vec<&SupervisorPatch> = vec![self];

    while let Some(next) = stack.pop() {
      match next {
        Self::Empty => {}
        Self::Add(added) => output = output.zip(added.clone()),
        Self::Remove(id) => output = output.remove(*id),
        Self::AndThen(first, second) => {
          stack.push(second);
          stack.push(first);
        }
      }
    }

    output
  }

  /// Returns `true` if the patch changes nothing.
  pub fn is_empty(&self) -> bool {
    match self {
      Self::Empty => true,
      Self::Add(_) | Self::Remove(_) => false,
      Self::AndThen(first, second) => first.is_empty() && second.is_empty(),
    }
  }
}

impl Debug for SupervisorPatch {
  fn fmt(&self, f: &mut Formatter<'_>) -> Result {
    match self {
      Self::Empty => f.write_str("Empty"),
      Self::Add(supervisor) => f.debug_tuple("Add").field(supervisor).finish(),
      Self::Remove(id) => f.debug_tuple("Remove").field(id).finish(),
      Self::AndThen(first, second) => f.debug_tuple("AndThen").field(first).field(second).finish(),
    }
  }
}

// -----------------------------------------------------------------------------
// Supervisor Differ
// -----------------------------------------------------------------------------

/// Diffs supervisor trees with [`SupervisorPatch`].
#[derive(Clone, Copy, Debug)]
pub struct SupervisorDiffer;

impl Differ for SupervisorDiffer {
  type Value = Supervisor;
  type Patch = SupervisorPatch;

  #[inline]
  fn empty() -> Self::Patch {
    SupervisorPatch::Empty
  }

  #[inline]
  fn combine(first: Self::Patch, second: Self::Patch) -> Self::Patch {
    first.combine(second)
  }

  #[inline]
  fn diff(old: &Self::Value, new: &Self::Value) -> Self::Patch {
    SupervisorPatch::diff(old, new)
  }

  #[inline]
  fn patch(patch: &Self::Patch, old: &Self::Value) -> Self::Value {
    patch.apply(old)
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
