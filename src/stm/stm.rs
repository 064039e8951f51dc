use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::LazyLock;
use tracing::debug;
use tracing::trace;

use crate::core::Cause;
use crate::core::Defect;
use crate::error::fatal;
use crate::fiber;
use crate::stm::TExit;
use crate::stm::driver::Driver;
use crate::stm::driver::Erased;
use crate::stm::driver::Node;
use crate::stm::driver::Step;
use crate::stm::journal::Journal;
use crate::utils::Sequence;

/// Source of transaction ids, used to key retry registrations.
static TXN_IDS: LazyLock<Sequence> = LazyLock::new(Sequence::new);

/// Recovers a typed value from the driver.
#[inline]
pub(crate) fn cast<T>(value: Erased) -> T
where
  T: 'static,
{
  match value.downcast::<T>() {
    Ok(value) => *value,
    Err(_) => fatal!("transaction value has an unexpected type"),
  }
}

// -----------------------------------------------------------------------------
// Either
// -----------------------------------------------------------------------------

/// The outcome of [`Stm::or_else_either`].
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Either<L, R> {
  Left(L),
  Right(R),
}

// -----------------------------------------------------------------------------
// Stm
// -----------------------------------------------------------------------------

/// A transaction that produces an `A` or fails with an `E`.
///
/// An `Stm` is a description, not a running computation. Nothing happens
/// until [`Stm::commit`], which runs the description against a private
/// journal and publishes every write at once, or none of them. The same
/// value may be committed any number of times.
///
/// # Examples
///
/// ```no_run
/// use strand::core::Never;
/// use strand::stm::Stm;
/// use strand::stm::TRef;
///
/// # async fn transfer() {
/// let from: TRef<u32> = TRef::new(100);
/// let into: TRef<u32> = TRef::new(0);
///
/// let target: TRef<u32> = into.clone();
/// let transfer: Stm<(), Never> = from
///   .get()
///   .flat_map(|balance| Stm::check(balance >= 40))
///   .flat_map(move |()| from.update(|balance| balance - 40))
///   .flat_map(move |()| target.update(|balance| balance + 40));
///
/// transfer.commit().await.unwrap();
/// assert_eq!(into.peek(), 40);
/// # }
/// ```
pub struct Stm<A, E> {
  node: Arc<Node>,
  marker: PhantomData<fn() -> (A, E)>,
}

impl<A, E> Stm<A, E>
where
  A: Send + 'static,
  E: Send + 'static,
{
  #[inline]
  pub(crate) fn from_node(node: Arc<Node>) -> Self {
    Self {
      node,
      marker: PhantomData,
    }
  }

  // ---------------------------------------------------------------------------
  // Constructors
  // ---------------------------------------------------------------------------

  /// A transaction that produces `value`.
  pub fn succeed(value: A) -> Self
  where
    A: Clone + Sync,
  {
    Self::from_node(Node::primitive(move |_| TExit::Succeed(Box::new(value.clone()))))
  }

  /// A transaction that fails with `error`.
  pub fn fail(error: E) -> Self
  where
    E: Clone + Sync,
  {
    Self::from_node(Node::primitive(move |_| TExit::Fail(Box::new(error.clone()))))
  }

  /// A transaction that dies with `defect`.
  pub fn die(defect: impl Into<Defect>) -> Self {
    let defect: Defect = defect.into();
    Self::from_node(Node::primitive(move |_| TExit::Die(defect.clone())))
  }

  /// A transaction that runs again once any ref it read has changed.
  ///
  /// A transaction that retries without having read anything suspends until
  /// it is interrupted.
  pub fn retry() -> Self {
    Self::from_node(Node::primitive(|_| TExit::Retry))
  }

  /// A transaction that interrupts the committing fiber.
  pub fn interrupt() -> Self {
    Self::from_node(Node::primitive(|_| TExit::Interrupt(fiber::id())))
  }

  /// A transaction that produces the result of `f`, called on every attempt.
  pub fn sync<F>(f: F) -> Self
  where
    F: Fn() -> A + Send + Sync + 'static,
  {
    Self::from_node(Node::primitive(move |_| TExit::Succeed(Box::new(f()))))
  }

  /// A transaction built by `f` on every attempt.
  pub fn suspend<F>(f: F) -> Self
  where
    F: Fn() -> Self + Send + Sync + 'static,
  {
    Self::from_node(Node::flat_map(
      Node::primitive(|_| TExit::Succeed(Box::new(()))),
      move |_| f().node,
    ))
  }

  // ---------------------------------------------------------------------------
  // Combinators
  // ---------------------------------------------------------------------------

  /// Transforms the value produced by this transaction.
  pub fn map<F, B>(self, f: F) -> Stm<B, E>
  where
    F: Fn(A) -> B + Send + Sync + 'static,
    B: Send + 'static,
  {
    Stm::from_node(Node::map(self.node, move |value| Box::new(f(cast::<A>(value)))))
  }

  /// Continues with the transaction built from the value of this one.
  pub fn flat_map<F, B>(self, f: F) -> Stm<B, E>
  where
    F: Fn(A) -> Stm<B, E> + Send + Sync + 'static,
    B: Send + 'static,
  {
    Stm::from_node(Node::flat_map(self.node, move |value| f(cast::<A>(value)).node))
  }

  /// Runs both transactions in order and pairs their values.
  pub fn zip<B>(self, that: Stm<B, E>) -> Stm<(A, B), E>
  where
    A: Clone + Sync,
    B: Send + 'static,
  {
    self.zip_with(that, |lhs, rhs| (lhs, rhs))
  }

  /// Runs both transactions in order and combines their values with `f`.
  pub fn zip_with<B, C, F>(self, that: Stm<B, E>, f: F) -> Stm<C, E>
  where
    A: Clone + Sync,
    B: Send + 'static,
    C: Send + 'static,
    F: Fn(A, B) -> C + Send + Sync + 'static,
  {
    let f: Arc<F> = Arc::new(f);

    self.flat_map(move |lhs| {
      let f: Arc<F> = Arc::clone(&f);
      that.clone().map(move |rhs| f(lhs.clone(), rhs))
    })
  }

  /// Runs `that` if this transaction retries.
  ///
  /// Writes made by this transaction are discarded before `that` runs.
  /// Typed failures and defects do not trigger the alternative.
  pub fn or_else(self, that: Self) -> Self {
    Self::from_node(Node::or_else(self.node, that.node))
  }

  /// Like [`Stm::or_else`], tagging which side produced the value.
  pub fn or_else_either<B>(self, that: Stm<B, E>) -> Stm<Either<A, B>, E>
  where
    B: Send + 'static,
  {
    self.map(Either::Left).or_else(that.map(Either::Right))
  }

  /// Recovers from any typed failure.
  pub fn catch_all<F, T>(self, f: F) -> Stm<A, T>
  where
    F: Fn(E) -> Stm<A, T> + Send + Sync + 'static,
    T: Send + 'static,
  {
    Stm::from_node(Node::catch(self.node, move |error| f(cast::<E>(error)).node))
  }

  /// Transforms the typed failure of this transaction.
  pub fn map_err<F, T>(self, f: F) -> Stm<A, T>
  where
    F: Fn(E) -> T + Send + Sync + 'static,
    T: Send + 'static,
  {
    Stm::from_node(Node::map_err(self.node, move |error| Box::new(f(cast::<E>(error)))))
  }

  /// Runs this transaction, then `count` more times, producing the last
  /// value.
  pub fn repeat_n(self, count: usize) -> Self {
    let once: Arc<Node> = Arc::clone(&self.node);
    let mut node: Arc<Node> = self.node;

    for _ in 0..count {
      let next: Arc<Node> = Arc::clone(&once);
      node = Node::flat_map(node, move |_| Arc::clone(&next));
    }

    Self::from_node(node)
  }

  // ---------------------------------------------------------------------------
  // Commit
  // ---------------------------------------------------------------------------

  /// Runs the transaction atomically.
  ///
  /// Attempts that observed a concurrent commit are restarted from the
  /// beginning. A transaction that retries suspends the fiber until one of
  /// the refs it read changes. Typed failures, defects and interruption end
  /// the commit without publishing any write.
  pub async fn commit(self) -> std::result::Result<A, Cause<E>> {
    let txn: u64 = TXN_IDS.next();
    let yield_op_count: u32 = fiber::stm_yield_op_count();
    let mut attempts: u32 = 0;

    'attempt: loop {
      attempts = attempts.saturating_add(1);

      fiber::checkpoint().await;

      let mut journal: Journal = Journal::new();
      let step: Step = Driver::new(&mut journal, yield_op_count).run(&self.node);

      if step.is_retry() {
        if !journal.is_valid() {
          trace!(target: "strand", txn, attempts, "STM Conflict");
          continue 'attempt;
        }

        trace!(target: "strand", txn, attempts, refs = journal.len(), "STM Retry");
        journal.wait(txn).await;
        continue 'attempt;
      }

      if !journal.commit(step.is_succeed()) {
        trace!(target: "strand", txn, attempts, "STM Conflict");
        continue 'attempt;
      }

      debug!(target: "strand", txn, attempts, "STM Commit");

      break 'attempt match step {
        TExit::Succeed(value) => Ok(cast::<A>(value)),
        TExit::Fail(error) => Err(Cause::Fail(cast::<E>(error))),
        TExit::Die(defect) => Err(Cause::Die(defect)),
        TExit::Interrupt(_) => fiber::interrupt().await,
        TExit::Retry => continue 'attempt,
      };
    }
  }
}

impl<E> Stm<(), E>
where
  E: Send + 'static,
{
  /// A transaction that succeeds if `condition` holds and retries otherwise.
  pub fn check(condition: bool) -> Self {
    Self::from_node(Node::primitive(move |_| {
      if condition {
        TExit::Succeed(Box::new(()))
      } else {
        TExit::Retry
      }
    }))
  }

  /// A transaction that does nothing.
  #[inline]
  pub fn unit() -> Self {
    Self::succeed(())
  }
}

impl<B, E> Stm<Vec<B>, E>
where
  B: Clone + Send + Sync + 'static,
  E: Send + 'static,
{
  /// Runs the transaction built by `f` for every item, in order, collecting
  /// the values.
  pub fn for_each<I, F>(items: I, f: F) -> Self
  where
    I: IntoIterator,
    F: FnMut(I::Item) -> Stm<B, E>,
  {
    let steps: Vec<Stm<B, E>> = items.into_iter().map(f).collect();
    let count: usize = steps.len();

    steps
      .into_iter()
      .fold(Self::sync(move || Vec::with_capacity(count)), |output, step| {
        output.zip_with(step, |mut values, value| {
          values.push(value);
          values
        })
      })
  }
}

impl<A, E> Clone for Stm<A, E> {
  #[inline]
  fn clone(&self) -> Self {
    Self {
      node: Arc::clone(&self.node),
      marker: PhantomData,
    }
  }
}

impl<A, E> Debug for Stm<A, E> {
  fn fmt(&self, f: &mut Formatter<'_>) -> Result {
    f.write_str("Stm(..)")
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use crate::core::Cause;
  use crate::core::Never;
  use crate::stm::Either;
  use crate::stm::Stm;
  use crate::stm::TRef;

  #[tokio::test]
  async fn test_succeed_and_map() {
    let stm: Stm<u32, Never> = Stm::succeed(20).map(|value| value + 1);

    assert_eq!(stm.clone().commit().await, Ok(21));
    assert_eq!(stm.commit().await, Ok(21));
  }

  #[tokio::test]
  async fn test_failure_discards_writes() {
    let tref: TRef<u32> = TRef::new(1);
    let stm: Stm<(), &str> = tref.set(2).flat_map(|()| Stm::fail("boom"));

    assert_eq!(stm.commit().await, Err(Cause::fail("boom")));
    assert_eq!(tref.peek(), 1);
  }

  #[tokio::test]
  async fn test_die_discards_writes() {
    let tref: TRef<u32> = TRef::new(1);
    let stm: Stm<(), Never> = tref.set(2).map(|()| panic!("kaboom"));

    let cause: Cause<Never> = stm.commit().await.unwrap_err();

    assert!(cause.is_die());
    assert_eq!(tref.peek(), 1);
  }

  #[tokio::test]
  async fn test_or_else_rolls_back_first_branch() {
    let tref: TRef<u32> = TRef::new(1);
    let first: Stm<u32, Never> = tref.set(5).flat_map(|()| Stm::retry());
    let second: Stm<u32, Never> = tref.get();

    assert_eq!(first.or_else(second).commit().await, Ok(1));
    assert_eq!(tref.peek(), 1);
  }

  #[tokio::test]
  async fn test_or_else_ignores_failures() {
    let stm: Stm<u32, &str> = Stm::fail("boom").or_else(Stm::succeed(1));

    assert_eq!(stm.commit().await, Err(Cause::fail("boom")));
  }

  #[tokio::test]
  async fn test_or_else_either() {
    let stm: Stm<Either<u32, &str>, Never> = Stm::retry().or_else_either(Stm::succeed("right"));

    assert_eq!(stm.commit().await, Ok(Either::Right("right")));
  }

  #[tokio::test]
  async fn test_catch_all_and_map_err() {
    let recovered: Stm<u32, Never> = Stm::<u32, &str>::fail("boom").catch_all(|error| Stm::succeed(error.len() as u32));
    let mapped: Stm<u32, usize> = Stm::<u32, &str>::fail("boom").map_err(str::len);

    assert_eq!(recovered.commit().await, Ok(4));
    assert_eq!(mapped.commit().await, Err(Cause::fail(4)));
  }

  #[tokio::test]
  async fn test_zip_and_for_each() {
    let zipped: Stm<(u32, &str), Never> = Stm::succeed(1).zip(Stm::succeed("one"));
    let each: Stm<Vec<u32>, Never> = Stm::for_each(1..=3, |value| Stm::succeed(value * 10));

    assert_eq!(zipped.commit().await, Ok((1, "one")));
    assert_eq!(each.commit().await, Ok(vec![10, 20, 30]));
  }

  #[tokio::test]
  async fn test_repeat_n_runs_once_more_than_count() {
    let tref: TRef<u32> = TRef::new(10);
    let stm: Stm<(), Never> = tref.update(|value| value - 1).repeat_n(3);

    stm.commit().await.unwrap();

    assert_eq!(tref.peek(), 6);
  }

  #[tokio::test]
  async fn test_check_passes() {
    let stm: Stm<(), Never> = Stm::check(true);

    assert_eq!(stm.commit().await, Ok(()));
  }

  #[tokio::test]
  async fn test_suspend_runs_on_every_commit() {
    let tref: TRef<u32> = TRef::new(0);
    let target: TRef<u32> = tref.clone();
    let stm: Stm<u32, Never> = Stm::suspend(move || target.update_and_get(|value| value + 1));

    assert_eq!(stm.clone().commit().await, Ok(1));
    assert_eq!(stm.commit().await, Ok(2));
  }
}
