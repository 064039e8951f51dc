use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result;
use std::marker::PhantomData;
use triomphe::Arc;

use crate::error::fatal;
use crate::stm::Stm;
use crate::stm::TExit;
use crate::stm::driver::Node;
use crate::stm::journal::Journal;
use crate::stm::journal::Slot;
use crate::stm::journal::Value;

/// A transactional reference.
///
/// Reads and writes are only possible inside an [`Stm`] transaction, with the
/// exception of [`TRef::peek`]. Clones share the same underlying value.
pub struct TRef<A> {
  slot: Arc<Slot>,
  marker: PhantomData<fn() -> A>,
}

impl<A> TRef<A>
where
  A: Clone + Send + Sync + 'static,
{
  /// Creates a ref outside of a transaction.
  pub fn new(value: A) -> Self {
    let value: Value = std::sync::Arc::new(value);

    Self {
      slot: Arc::new(Slot::new(value)),
      marker: PhantomData,
    }
  }

  /// A transaction that creates a fresh ref on every attempt.
  pub fn make<E>(value: A) -> Stm<Self, E>
  where
    E: Send + 'static,
  {
    Stm::sync(move || Self::new(value.clone()))
  }

  /// Returns the id of the underlying ref.
  #[inline]
  pub fn id(&self) -> u64 {
    self.slot.id()
  }

  /// Reads the last committed value, outside of any transaction.
  pub fn peek(&self) -> A {
    read(&self.slot.load().1)
  }

  // ---------------------------------------------------------------------------
  // Transactional Operations
  // ---------------------------------------------------------------------------

  pub fn get<E>(&self) -> Stm<A, E>
  where
    E: Send + 'static,
  {
    let slot: Arc<Slot> = Arc::clone(&self.slot);

    Stm::from_node(Node::primitive(move |journal| {
      TExit::Succeed(Box::new(read::<A>(&journal.read(&slot))))
    }))
  }

  pub fn set<E>(&self, value: A) -> Stm<(), E>
  where
    E: Send + 'static,
  {
    let slot: Arc<Slot> = Arc::clone(&self.slot);

    Stm::from_node(Node::primitive(move |journal| {
      journal.write(&slot, std::sync::Arc::new(value.clone()));
      TExit::Succeed(Box::new(()))
    }))
  }

  /// Replaces the value with the second half of `f`'s output and produces
  /// the first half.
  pub fn modify<B, E, F>(&self, f: F) -> Stm<B, E>
  where
    B: Send + 'static,
    E: Send + 'static,
    F: Fn(A) -> (B, A) + Send + Sync + 'static,
  {
    let slot: Arc<Slot> = Arc::clone(&self.slot);

    Stm::from_node(Node::primitive(move |journal| {
      let (output, value): (B, A) = f(load(journal, &slot));
      journal.write(&slot, std::sync::Arc::new(value));
      TExit::Succeed(Box::new(output))
    }))
  }

  pub fn update<E, F>(&self, f: F) -> Stm<(), E>
  where
    E: Send + 'static,
    F: Fn(A) -> A + Send + Sync + 'static,
  {
    self.modify(move |value| ((), f(value)))
  }

  /// Sets a new value, producing the previous one.
  pub fn get_and_set<E>(&self, value: A) -> Stm<A, E>
  where
    E: Send + 'static,
  {
    self.modify(move |previous| (previous, value.clone()))
  }

  /// Updates the value, producing the previous one.
  pub fn get_and_update<E, F>(&self, f: F) -> Stm<A, E>
  where
    E: Send + 'static,
    F: Fn(A) -> A + Send + Sync + 'static,
  {
    self.modify(move |previous| {
      let next: A = f(previous.clone());
      (previous, next)
    })
  }

  /// Updates the value, producing the new one.
  pub fn update_and_get<E, F>(&self, f: F) -> Stm<A, E>
  where
    E: Send + 'static,
    F: Fn(A) -> A + Send + Sync + 'static,
  {
    self.modify(move |previous| {
      let next: A = f(previous);
      (next.clone(), next)
    })
  }
}

#[inline]
fn load<A>(journal: &mut Journal, slot: &Arc<Slot>) -> A
where
  A: Clone + 'static,
{
  read(&journal.read(slot))
}

#[inline]
fn read<A>(value: &Value) -> A
where
  A: Clone + 'static,
{
  match value.downcast_ref::<A>() {
    Some(value) => value.clone(),
    None => fatal!("transactional ref holds an unexpected type"),
  }
}

impl<A> Clone for TRef<A> {
  #[inline]
  fn clone(&self) -> Self {
    Self {
      slot: Arc::clone(&self.slot),
      marker: PhantomData,
    }
  }
}

impl<A> PartialEq for TRef<A> {
  #[inline]
  fn eq(&self, other: &Self) -> bool {
    Arc::ptr_eq(&self.slot, &other.slot)
  }
}

impl<A> Eq for TRef<A> {}

impl<A> Debug for TRef<A> {
  fn fmt(&self, f: &mut Formatter<'_>) -> Result {
    f.debug_struct("TRef")
      .field("id", &self.slot.id())
      .field("version", &self.slot.version())
      .finish()
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
