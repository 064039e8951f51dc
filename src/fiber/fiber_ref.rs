use dyn_clone::DynClone;
use hashbrown::HashMap;
use std::any::Any;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result;
use std::sync::Arc;
use std::sync::LazyLock;

use crate::consts::CAP_FIBER_REFS;
use crate::fiber::context::FiberContext;
use crate::raise;
use crate::utils::Sequence;

static FIBER_REF_IDS: LazyLock<Sequence> = LazyLock::new(Sequence::new);

// -----------------------------------------------------------------------------
// Differ
// -----------------------------------------------------------------------------

/// Describes how to compute and apply patches between two values.
///
/// Patch-based fiber refs use a differ to merge a child's changes back into
/// its parent on join: the join computes the child's patch relative to the
/// value it was forked with and applies that patch to the parent's current
/// value. Concurrent changes made by the parent are therefore preserved.
pub trait Differ: Send + Sync + 'static {
  type Value: Clone + Send + Sync + 'static;
  type Patch: Clone + Send + Sync + 'static;

  /// A patch that changes nothing.
  fn empty() -> Self::Patch;

  /// A patch that applies `first` and then `second`.
  fn combine(first: Self::Patch, second: Self::Patch) -> Self::Patch;

  /// A patch that turns `old` into `new`.
  fn diff(old: &Self::Value, new: &Self::Value) -> Self::Patch;

  /// Applies `patch` to `old`.
  fn patch(patch: &Self::Patch, old: &Self::Value) -> Self::Value;
}

// -----------------------------------------------------------------------------
// Erased Values
// -----------------------------------------------------------------------------

trait Value: Any + DynClone + Send + Sync {
  fn as_any(&self) -> &dyn Any;
}

dyn_clone::clone_trait_object!(Value);

impl<T> Value for T
where
  T: Any + Clone + Send + Sync,
{
  #[inline]
  fn as_any(&self) -> &dyn Any {
    self
  }
}

/// Fork and join behavior of a single fiber ref, with values erased.
trait Policy: Send + Sync {
  fn initial(&self) -> Box<dyn Value>;

  fn fork(&self, value: &dyn Value) -> Box<dyn Value>;

  /// Merges a child's value into its parent's.
  ///
  /// `forked` is the value the child started with.
  fn join(&self, parent: &dyn Value, forked: &dyn Value, child: &dyn Value) -> Box<dyn Value>;
}

type ForkFn<T> = Box<dyn Fn(&T) -> T + Send + Sync>;
type JoinFn<T> = Box<dyn Fn(&T, &T, &T) -> T + Send + Sync>;

struct Rules<T> {
  id: u64,
  initial: T,
  fork: ForkFn<T>,
  join: JoinFn<T>,
}

impl<T> Policy for Rules<T>
where
  T: Clone + Send + Sync + 'static,
{
  fn initial(&self) -> Box<dyn Value> {
    Box::new(self.initial.clone())
  }

  fn fork(&self, value: &dyn Value) -> Box<dyn Value> {
    Box::new((self.fork)(downcast(value)))
  }

  fn join(&self, parent: &dyn Value, forked: &dyn Value, child: &dyn Value) -> Box<dyn Value> {
    Box::new((self.join)(
      downcast(parent),
      downcast(forked),
      downcast(child),
    ))
  }
}

#[inline]
fn downcast<T>(value: &dyn Value) -> &T
where
  T: 'static,
{
  match value.as_any().downcast_ref::<T>() {
    Some(value) => value,
    None => raise!(Error, SysInv, "fiber ref type mismatch"),
  }
}

// -----------------------------------------------------------------------------
// Fiber Ref
// -----------------------------------------------------------------------------

/// A fiber-local variable.
///
/// Every fiber sees its own copy. A forked child starts from its parent's
/// value (as transformed by the ref's fork rule) and, when joined, merges its
/// value back into the parent with the ref's join rule. Only refs the child
/// actually changed are merged.
///
/// The operations below must be called from inside a fiber.
pub struct FiberRef<T> {
  rules: Arc<Rules<T>>,
}

impl<T> FiberRef<T>
where
  T: Clone + Send + Sync + 'static,
{
  /// Creates a ref whose children copy the parent's value on fork and whose
  /// value wins on join.
  pub fn new(initial: T) -> Self {
    Self::with_join(initial, T::clone, |_, child| child.clone())
  }

  /// Creates a ref with custom fork and join rules.
  ///
  /// `join` receives the parent's and the child's current values.
  pub fn with_join<F, J>(initial: T, fork: F, join: J) -> Self
  where
    F: Fn(&T) -> T + Send + Sync + 'static,
    J: Fn(&T, &T) -> T + Send + Sync + 'static,
  {
    Self::from_rules(
      initial,
      Box::new(fork),
      Box::new(move |parent: &T, _: &T, child: &T| join(parent, child)),
    )
  }

  /// Creates a patch-based ref: on join, the child's changes since fork are
  /// diffed with `D` and applied to the parent's current value.
  pub fn with_differ<D>(initial: T) -> Self
  where
    D: Differ<Value = T>,
  {
    let join: JoinFn<T> = Box::new(|parent: &T, forked: &T, child: &T| {
      let patch: D::Patch = D::diff(forked, child);
      D::patch(&patch, parent)
    });

    Self::from_rules(initial, Box::new(T::clone), join)
  }

  fn from_rules(initial: T, fork: ForkFn<T>, join: JoinFn<T>) -> Self {
    Self {
      rules: Arc::new(Rules {
        id: FIBER_REF_IDS.next(),
        initial,
        fork,
        join,
      }),
    }
  }

  /// Returns the initial value of this ref.
  #[inline]
  pub fn initial(&self) -> &T {
    &self.rules.initial
  }

  /// Returns the current fiber's value.
  pub fn get(&self) -> T {
    FiberContext::with(|this| this.refs().get(self))
  }

  /// Sets the current fiber's value.
  pub fn set(&self, value: T) {
    FiberContext::with(|this| this.refs_mut().set(self, value));
  }

  /// Sets the current fiber's value and returns the previous one.
  pub fn get_and_set(&self, value: T) -> T {
    self.modify(|old| (old.clone(), value))
  }

  /// Updates the current fiber's value with `f`.
  pub fn update<F>(&self, f: F)
  where
    F: FnOnce(&T) -> T,
  {
    self.modify(|old| ((), f(old)));
  }

  /// Updates the current fiber's value with `f`, returning the computed
  /// output.
  pub fn modify<F, B>(&self, f: F) -> B
  where
    F: FnOnce(&T) -> (B, T),
  {
    let old: T = self.get();
    let (output, new): (B, T) = f(&old);

    self.set(new);

    output
  }

  /// Restores the initial value in the current fiber.
  pub fn reset(&self) {
    self.set(self.initial().clone());
  }

  /// Runs `future` with the ref temporarily set to `value`.
  ///
  /// The previous value is restored when the future completes or is dropped.
  pub async fn locally<F>(&self, value: T, future: F) -> F::Output
  where
    F: Future,
  {
    let previous: T = self.get_and_set(value);
    let _guard: Locally<'_, T> = Locally {
      fiber_ref: self,
      previous: Some(previous),
    };

    future.await
  }

  #[inline]
  fn id(&self) -> u64 {
    self.rules.id
  }

  #[inline]
  fn policy(&self) -> Arc<dyn Policy> {
    self.rules.clone()
  }
}

impl<T> Clone for FiberRef<T> {
  #[inline]
  fn clone(&self) -> Self {
    Self {
      rules: Arc::clone(&self.rules),
    }
  }
}

impl<T> Debug for FiberRef<T>
where
  T: Debug,
{
  fn fmt(&self, f: &mut Formatter<'_>) -> Result {
    f.debug_struct("FiberRef")
      .field("id", &self.rules.id)
      .field("initial", &self.rules.initial)
      .finish()
  }
}

struct Locally<'a, T>
where
  T: Clone + Send + Sync + 'static,
{
  fiber_ref: &'a FiberRef<T>,
  previous: Option<T>,
}

impl<T> Drop for Locally<'_, T>
where
  T: Clone + Send + Sync + 'static,
{
  fn drop(&mut self) {
    if let Some(previous) = self.previous.take() {
      FiberContext::try_with(|this| this.refs_mut().set(self.fiber_ref, previous));
    }
  }
}

// -----------------------------------------------------------------------------
// Fiber Refs
// -----------------------------------------------------------------------------

#[derive(Clone)]
struct Entry {
  value: Box<dyn Value>,
  forked: Option<Box<dyn Value>>,
  modified: bool,
  policy: Arc<dyn Policy>,
}

/// The set of fiber ref values owned by one fiber.
///
/// Refs that were never set are absent and read as their initial value.
#[derive(Clone, Default)]
pub(crate) struct FiberRefs {
  entries: HashMap<u64, Entry>,
}

impl FiberRefs {
  #[inline]
  pub(crate) fn new() -> Self {
    Self {
      entries: HashMap::with_capacity(CAP_FIBER_REFS),
    }
  }

  pub(crate) fn get<T>(&self, fiber_ref: &FiberRef<T>) -> T
  where
    T: Clone + Send + Sync + 'static,
  {
    match self.entries.get(&fiber_ref.id()) {
      Some(entry) => downcast::<T>(&*entry.value).clone(),
      None => fiber_ref.initial().clone(),
    }
  }

  pub(crate) fn set<T>(&mut self, fiber_ref: &FiberRef<T>, value: T)
  where
    T: Clone + Send + Sync + 'static,
  {
    match self.entries.get_mut(&fiber_ref.id()) {
      Some(entry) => {
        entry.value = Box::new(value);
        entry.modified = true;
      }
      None => {
        let entry: Entry = Entry {
          value: Box::new(value),
          forked: None,
          modified: true,
          policy: fiber_ref.policy(),
        };

        self.entries.insert(fiber_ref.id(), entry);
      }
    }
  }

  /// Produces the refs of a child forked from this fiber.
  pub(crate) fn fork(&self) -> Self {
    let mut entries: HashMap<u64, Entry> = HashMap::with_capacity(self.entries.len());

    for (id, entry) in self.entries.iter() {
      let value: Box<dyn Value> = entry.policy.fork(&*entry.value);

      entries.insert(
        *id,
        Entry {
          forked: Some(dyn_clone::clone_box(&*value)),
          value,
          modified: false,
          policy: Arc::clone(&entry.policy),
        },
      );
    }

    Self { entries }
  }

  /// Merges the refs of a joined child into this fiber.
  pub(crate) fn join(&mut self, child: &Self) {
    for (id, theirs) in child.entries.iter() {
      if !theirs.modified {
        continue;
      }

      let initial: Box<dyn Value>;
      let forked: &dyn Value = match theirs.forked.as_deref() {
        Some(forked) => forked,
        None => {
          initial = theirs.policy.initial();
          &*initial
        }
      };

      let merged: Box<dyn Value> = match self.entries.get(id) {
        Some(ours) => theirs.policy.join(&*ours.value, forked, &*theirs.value),
        None => {
          let base: Box<dyn Value> = theirs.policy.initial();
          theirs.policy.join(&*base, forked, &*theirs.value)
        }
      };

      match self.entries.get_mut(id) {
        Some(ours) => {
          ours.value = merged;
          ours.modified = true;
        }
        None => {
          let entry: Entry = Entry {
            value: merged,
            forked: None,
            modified: true,
            policy: Arc::clone(&theirs.policy),
          };

          self.entries.insert(*id, entry);
        }
      }
    }
  }
}

impl Debug for FiberRefs {
  fn fmt(&self, f: &mut Formatter<'_>) -> Result {
    f.debug_set().entries(self.entries.keys()).finish()
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use crate::fiber::Differ;
  use crate::fiber::FiberRef;
  use crate::fiber::FiberRefs;

  struct Counter;

  impl Differ for Counter {
    type Value = i64;
    type Patch = i64;

    fn empty() -> Self::Patch {
      0
    }

    fn combine(first: Self::Patch, second: Self::Patch) -> Self::Patch {
      first + second
    }

    fn diff(old: &Self::Value, new: &Self::Value) -> Self::Patch {
      new - old
    }

    fn patch(patch: &Self::Patch, old: &Self::Value) -> Self::Value {
      old + patch
    }
  }

  #[test]
  fn test_unset_reads_initial() {
    let fiber_ref: FiberRef<u32> = FiberRef::new(7);
    let refs: FiberRefs = FiberRefs::new();

    assert_eq!(refs.get(&fiber_ref), 7);
  }

  #[test]
  fn test_child_wins_on_join() {
    let fiber_ref: FiberRef<&str> = FiberRef::new("init");
    let mut parent: FiberRefs = FiberRefs::new();

    parent.set(&fiber_ref, "parent");

    let mut child: FiberRefs = parent.fork();

    assert_eq!(child.get(&fiber_ref), "parent");

    child.set(&fiber_ref, "child");
    parent.join(&child);

    assert_eq!(parent.get(&fiber_ref), "child");
  }

  #[test]
  fn test_unchanged_child_does_not_join() {
    let fiber_ref: FiberRef<u32> = FiberRef::new(0);
    let mut parent: FiberRefs = FiberRefs::new();

    parent.set(&fiber_ref, 1);

    let child: FiberRefs = parent.fork();

    parent.set(&fiber_ref, 2);
    parent.join(&child);

    assert_eq!(parent.get(&fiber_ref), 2);
  }

  #[test]
  fn test_custom_fork_and_join() {
    let fiber_ref: FiberRef<u32> = FiberRef::with_join(1, |value| value * 10, |parent, child| parent + child);
    let mut parent: FiberRefs = FiberRefs::new();

    parent.set(&fiber_ref, 2);

    let mut child: FiberRefs = parent.fork();

    assert_eq!(child.get(&fiber_ref), 20);

    child.set(&fiber_ref, 21);
    parent.join(&child);

    assert_eq!(parent.get(&fiber_ref), 23);
  }

  #[test]
  fn test_differ_preserves_parent_changes() {
    let fiber_ref: FiberRef<i64> = FiberRef::with_differ::<Counter>(100);
    let mut parent: FiberRefs = FiberRefs::new();

    parent.set(&fiber_ref, 10);

    let mut child: FiberRefs = parent.fork();

    child.set(&fiber_ref, 15);
    parent.set(&fiber_ref, 12);
    parent.join(&child);

    assert_eq!(parent.get(&fiber_ref), 17);
  }

  #[test]
  fn test_child_created_entry_joins_against_initial() {
    let fiber_ref: FiberRef<i64> = FiberRef::with_differ::<Counter>(100);
    let mut parent: FiberRefs = FiberRefs::new();
    let mut child: FiberRefs = parent.fork();

    child.set(&fiber_ref, 103);
    parent.join(&child);

    assert_eq!(parent.get(&fiber_ref), 103);
    assert_eq!(Counter::combine(Counter::empty(), 3), 3);
  }

  #[test]
  fn test_grandchild_changes_propagate() {
    let fiber_ref: FiberRef<u32> = FiberRef::new(0);
    let mut parent: FiberRefs = FiberRefs::new();
    let mut child: FiberRefs = parent.fork();
    let mut grandchild: FiberRefs = child.fork();

    grandchild.set(&fiber_ref, 5);
    child.join(&grandchild);
    parent.join(&child);

    assert_eq!(parent.get(&fiber_ref), 5);
  }
}
