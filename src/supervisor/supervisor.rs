use std::collections::BTreeMap;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result;
use std::panic;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::LazyLock;

use crate::core::Defect;
use crate::core::Exit;
use crate::core::FiberId;
use crate::utils::Sequence;

static SUPERVISOR_IDS: LazyLock<Sequence> = LazyLock::new(Sequence::new);

// -----------------------------------------------------------------------------
// Propagation
// -----------------------------------------------------------------------------

/// Whether a supervision event should keep propagating after a supervisor
/// observed it.
///
/// The runtime treats [`Propagation::Stop`] as "fully handled" and skips its
/// own start/end logging for that event.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum Propagation {
  #[default]
  Continue,
  Stop,
}

impl Propagation {
  /// Stops only if both sides stop.
  #[inline]
  pub const fn and(self, other: Self) -> Self {
    match (self, other) {
      (Self::Stop, Self::Stop) => Self::Stop,
      (_, _) => Self::Continue,
    }
  }

  /// Stops if either side stops.
  #[inline]
  pub const fn or(self, other: Self) -> Self {
    match (self, other) {
      (Self::Continue, Self::Continue) => Self::Continue,
      (_, _) => Self::Stop,
    }
  }

  #[inline]
  pub const fn is_stop(self) -> bool {
    matches!(self, Self::Stop)
  }
}

// -----------------------------------------------------------------------------
// Supervise
// -----------------------------------------------------------------------------

/// An observer of fiber lifecycle events.
///
/// Callbacks run on the fiber being observed, synchronously, so they should
/// be short. A panicking callback is logged and treated as
/// [`Propagation::Continue`].
pub trait Supervise: Send + Sync + 'static {
  /// Called after `fiber` is created, before it first runs.
  fn on_start(&self, fiber: &FiberId, parent: &FiberId) -> Propagation {
    let _ = (fiber, parent);
    Propagation::Continue
  }

  /// Called after `fiber` finished unwinding, right before its exit becomes
  /// visible to joiners.
  fn on_end(&self, exit: &Exit<(), ()>, fiber: &FiberId) -> Propagation {
    let _ = (exit, fiber);
    Propagation::Continue
  }
}

// -----------------------------------------------------------------------------
// Supervisor
// -----------------------------------------------------------------------------

/// A composable tree of [`Supervise`] observers.
///
/// Leaves are identified by a unique id, assigned when the leaf is created.
/// Cloning a supervisor keeps the ids, so two trees can be compared by the
/// leaves they contain; see [`SupervisorPatch::diff`].
///
/// [`SupervisorPatch::diff`]: crate::supervisor::SupervisorPatch::diff
#[derive(Clone, Default)]
pub struct Supervisor {
  node: Node,
}

#[derive(Clone, Default)]
enum Node {
  #[default]
  None,
  Leaf(Leaf),
  And(Arc<Supervisor>, Arc<Supervisor>),
  Or(Arc<Supervisor>, Arc<Supervisor>),
}

/// A single observer with a stable identity.
#[derive(Clone)]
pub(crate) struct Leaf {
  pub(crate) id: u64,
  pub(crate) inner: Arc<dyn Supervise>,
}

impl Supervisor {
  /// A supervisor that observes nothing.
  #[inline]
  pub const fn none() -> Self {
    Self { node: Node::None }
  }

  /// Wraps an observer into a single-leaf supervisor.
  pub fn new<S>(supervise: S) -> Self
  where
    S: Supervise,
  {
    Self::from_arc(Arc::new(supervise))
  }

  pub(crate) fn from_arc(inner: Arc<dyn Supervise>) -> Self {
    Self {
      node: Node::Leaf(Leaf {
        id: SUPERVISOR_IDS.next(),
        inner,
      }),
    }
  }

  #[inline]
  pub(crate) fn from_leaf(leaf: Leaf) -> Self {
    Self {
      node: Node::Leaf(leaf),
    }
  }

  /// Builds a supervisor from a pair of callbacks.
  pub fn from_fn<S, E>(on_start: S, on_end: E) -> Self
  where
    S: Fn(&FiberId, &FiberId) -> Propagation + Send + Sync + 'static,
    E: Fn(&Exit<(), ()>, &FiberId) -> Propagation + Send + Sync + 'static,
  {
    struct FromFn<S, E> {
      on_start: S,
      on_end: E,
    }

    impl<S, E> Supervise for FromFn<S, E>
    where
      S: Fn(&FiberId, &FiberId) -> Propagation + Send + Sync + 'static,
      E: Fn(&Exit<(), ()>, &FiberId) -> Propagation + Send + Sync + 'static,
    {
      fn on_start(&self, fiber: &FiberId, parent: &FiberId) -> Propagation {
        (self.on_start)(fiber, parent)
      }

      fn on_end(&self, exit: &Exit<(), ()>, fiber: &FiberId) -> Propagation {
        (self.on_end)(exit, fiber)
      }
    }

    Self::new(FromFn { on_start, on_end })
  }

  /// Combines two supervisors; an event stops propagating only if both stop.
  pub fn and(self, other: Self) -> Self {
    match (self.node, other.node) {
      (Node::None, node) | (node, Node::None) => Self { node },
      (lhs, rhs) => Self {
        node: Node::And(Arc::new(Self { node: lhs }), Arc::new(Self { node: rhs })),
      },
    }
  }

  /// Combines two supervisors; an event stops propagating if either stops.
  pub fn or(self, other: Self) -> Self {
    match (self.node, other.node) {
      (Node::None, node) | (node, Node::None) => Self { node },
      (lhs, rhs) => Self {
        node: Node::Or(Arc::new(Self { node: lhs }), Arc::new(Self { node: rhs })),
      },
    }
  }

  /// Structural composition, same as [`Supervisor::and`].
  #[inline]
  pub fn zip(self, other: Self) -> Self {
    self.and(other)
  }

  #[inline]
  pub const fn is_none(&self) -> bool {
    matches!(self.node, Node::None)
  }

  /// Returns the ids of every leaf in this tree.
  pub fn ids(&self) -> Vec<u64> {
    self.leaves().into_keys().collect()
  }

  pub(crate) fn leaves(&self) -> BTreeMap<u64, Leaf> {
    let mut leaves: BTreeMap<u64, Leaf> = BTreeMap::new();
    let mut stack: Vec<&Supervisor> = vec![self];

    while let Some(next) = stack.pop() {
      match &next.node {
        Node::None => {}
        Node::Leaf(leaf) => {
          leaves.insert(leaf.id, leaf.clone());
        }
        Node::And(lhs, rhs) | Node::Or(lhs, rhs) => {
          stack.push(rhs);
          stack.push(lhs);
        }
      }
    }

    leaves
  }

  /// Returns this tree without the leaf `id`.
  pub(crate) fn remove(&self, id: u64) -> Self {
    match &self.node {
      Node::None => Self::none(),
      Node::Leaf(leaf) if leaf.id == id => Self::none(),
      Node::Leaf(_) => self.clone(),
      Node::And(lhs, rhs) => lhs.remove(id).and(rhs.remove(id)),
      Node::Or(lhs, rhs) => lhs.remove(id).or(rhs.remove(id)),
    }
  }

  /// Notifies the tree that `fiber` started.
  pub fn on_start(&self, fiber: &FiberId, parent: &FiberId) -> Propagation {
    match &self.node {
      Node::None => Propagation::Continue,
      Node::Leaf(leaf) => guard(leaf.id, || leaf.inner.on_start(fiber, parent)),
      Node::And(lhs, rhs) => {
        let lhs: Propagation = lhs.on_start(fiber, parent);
        let rhs: Propagation = rhs.on_start(fiber, parent);
        lhs.and(rhs)
      }
      Node::Or(lhs, rhs) => {
        let lhs: Propagation = lhs.on_start(fiber, parent);
        let rhs: Propagation = rhs.on_start(fiber, parent);
        lhs.or(rhs)
      }
    }
  }

  /// Notifies the tree that `fiber` ended with `exit`.
  pub fn on_end(&self, exit: &Exit<(), ()>, fiber: &FiberId) -> Propagation {
    match &self.node {
      Node::None => Propagation::Continue,
      Node::Leaf(leaf) => guard(leaf.id, || leaf.inner.on_end(exit, fiber)),
      Node::And(lhs, rhs) => {
        let lhs: Propagation = lhs.on_end(exit, fiber);
        let rhs: Propagation = rhs.on_end(exit, fiber);
        lhs.and(rhs)
      }
      Node::Or(lhs, rhs) => {
        let lhs: Propagation = lhs.on_end(exit, fiber);
        let rhs: Propagation = rhs.on_end(exit, fiber);
        lhs.or(rhs)
      }
    }
  }
}

impl Debug for Supervisor {
  fn fmt(&self, f: &mut Formatter<'_>) -> Result {
    match &self.node {
      Node::None => f.write_str("None"),
      Node::Leaf(leaf) => write!(f, "Leaf({})", leaf.id),
      Node::And(lhs, rhs) => f.debug_tuple("And").field(lhs).field(rhs).finish(),
      Node::Or(lhs, rhs) => f.debug_tuple("Or").field(lhs).field(rhs).finish(),
    }
  }
}

#[inline]
fn guard<F>(id: u64, f: F) -> Propagation
where
  F: FnOnce() -> Propagation,
{
  match panic::catch_unwind(AssertUnwindSafe(f)) {
    Ok(propagation) => propagation,
    Err(payload) => {
      let defect: Defect = Defect::from_panic(payload);
      tracing::error!(target: "strand", supervisor = id, %defect, "Supervisor Panic");
      Propagation::Continue
    }
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use crate::core::Exit;
  use crate::core::FiberId;
  use crate::supervisor::Propagation;
  use crate::supervisor::Supervisor;

  fn fixed(start: Propagation) -> Supervisor {
    Supervisor::from_fn(move |_, _| start, |_, _| Propagation::Continue)
  }

  #[test]
  fn test_propagation_algebra() {
    use Propagation::*;

    assert_eq!(Stop.and(Stop), Stop);
    assert_eq!(Stop.and(Continue), Continue);
    assert_eq!(Continue.or(Stop), Stop);
    assert_eq!(Continue.or(Continue), Continue);
  }

  #[test]
  fn test_and_requires_both() {
    let fiber: FiberId = FiberId::next();
    let both: Supervisor = fixed(Propagation::Stop).and(fixed(Propagation::Continue));

    assert_eq!(both.on_start(&fiber, &FiberId::NONE), Propagation::Continue);
  }

  #[test]
  fn test_or_requires_either() {
    let fiber: FiberId = FiberId::next();
    let either: Supervisor = fixed(Propagation::Stop).or(fixed(Propagation::Continue));

    assert_eq!(either.on_start(&fiber, &FiberId::NONE), Propagation::Stop);
  }

  #[test]
  fn test_none_is_identity() {
    let leaf: Supervisor = fixed(Propagation::Stop);
    let ids: Vec<u64> = leaf.ids();

    assert_eq!(Supervisor::none().and(leaf.clone()).ids(), ids);
    assert_eq!(leaf.or(Supervisor::none()).ids(), ids);
    assert!(Supervisor::none().ids().is_empty());
  }

  #[test]
  fn test_remove_leaf() {
    let a: Supervisor = fixed(Propagation::Continue);
    let b: Supervisor = fixed(Propagation::Continue);
    let tree: Supervisor = a.clone().zip(b.clone());

    assert_eq!(tree.remove(a.ids()[0]).ids(), b.ids());
    assert!(tree.remove(a.ids()[0]).remove(b.ids()[0]).is_none());
  }

  #[test]
  fn test_panicking_callback_continues() {
    let panics: Supervisor = Supervisor::from_fn(
      |_, _| panic!("observer bug"),
      |_, _| Propagation::Stop,
    );

    assert_eq!(
      panics.on_start(&FiberId::next(), &FiberId::NONE),
      Propagation::Continue,
    );

    assert_eq!(
      panics.on_end(&Exit::UNIT, &FiberId::next()),
      Propagation::Stop,
    );
  }
}
