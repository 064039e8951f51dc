use parking_lot::Mutex;
use parking_lot::MutexGuard;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result;
use std::mem;
use std::sync::Arc;
use std::sync::LazyLock;
use tokio::sync::Notify;
use tracing::debug;

use crate::consts;
use crate::core::Cause;
use crate::core::Exit;
use crate::fiber;
use crate::raise;
use crate::utils::Sequence;

static MAILBOX_IDS: LazyLock<Sequence> = LazyLock::new(Sequence::new);

// -----------------------------------------------------------------------------
// Strategy
// -----------------------------------------------------------------------------

/// What a bounded mailbox does with an offer when its buffer is full.
#[derive(Clone, Copy, Debug, Default, Hash, PartialEq, Eq)]
pub enum Strategy {
  /// Suspend the offering fiber until there is room.
  #[default]
  Suspend,
  /// Reject the new message.
  Dropping,
  /// Discard the oldest buffered message to make room.
  Sliding,
}

// -----------------------------------------------------------------------------
// Mailbox State
// -----------------------------------------------------------------------------

enum Status<E> {
  Open,
  /// Completed while suspended offers were still waiting. They are delivered
  /// before the mailbox is done.
  Closing(Exit<(), E>),
  Done(Exit<(), E>),
}

/// Settles a suspended offer with the number of messages it delivered.
struct Ticket {
  accepted: Mutex<Option<usize>>,
  notify: Notify,
}

impl Ticket {
  fn settle(&self, accepted: usize) {
    *self.accepted.lock() = Some(accepted);
    self.notify.notify_one();
  }

  #[inline]
  fn settled(&self) -> Option<usize> {
    *self.accepted.lock()
  }
}

struct Offer<A> {
  ticket: Arc<Ticket>,
  values: VecDeque<A>,
  accepted: usize,
}

struct State<A, E> {
  buffer: VecDeque<A>,
  offers: VecDeque<Offer<A>>,
  status: Status<E>,
}

impl<A, E> State<A, E> {
  #[inline]
  fn is_open(&self) -> bool {
    matches!(self.status, Status::Open)
  }

  /// Number of messages a taker could get right now.
  fn available(&self) -> usize {
    self
      .offers
      .iter()
      .fold(self.buffer.len(), |total, offer| total + offer.values.len())
  }
}

struct Shared<A, E> {
  id: u64,
  capacity: Option<usize>,
  strategy: Strategy,
  state: Mutex<State<A, E>>,
  readers: Notify,
  done: Notify,
}

impl<A, E> Shared<A, E> {
  #[inline]
  fn has_room(&self, buffer: &VecDeque<A>) -> bool {
    self.capacity.is_none_or(|capacity| buffer.len() < capacity)
  }

  /// Moves messages of suspended offers into the buffer, oldest offer first.
  fn refill(&self, state: &mut State<A, E>) {
    let State { buffer, offers, .. } = &mut *state;

    'refill: while let Some(offer) = offers.front_mut() {
      while self.has_room(buffer) {
        let Some(value) = offer.values.pop_front() else {
          break;
        };

        buffer.push_back(value);
        offer.accepted += 1;
      }

      if !offer.values.is_empty() {
        break 'refill;
      }

      if let Some(offer) = offers.pop_front() {
        offer.ticket.settle(offer.accepted);
      }
    }

    self.finish_closing(state);
  }

  /// Completes a closing mailbox once its last suspended offer is delivered.
  fn finish_closing(&self, state: &mut State<A, E>) {
    if !state.offers.is_empty() {
      return;
    }

    if let Status::Closing(_) = state.status {
      let Status::Closing(exit) = mem::replace(&mut state.status, Status::Open) else {
        return;
      };

      self.set_done(state, exit);
    }
  }

  fn set_done(&self, state: &mut State<A, E>, exit: Exit<(), E>) {
    debug!(
      target: "strand",
      mailbox = self.id,
      buffered = state.buffer.len(),
      failed = exit.is_failure(),
      "Mailbox Done",
    );

    state.status = Status::Done(exit);

    self.readers.notify_waiters();
    self.done.notify_waiters();
  }

  /// Removes up to `limit` messages in order, refilling from suspended
  /// offers as room frees up.
  fn pop(&self, state: &mut State<A, E>, limit: usize) -> Vec<A> {
    let mut batch: Vec<A> = Vec::with_capacity(limit.min(state.available()));

    'pop: while batch.len() < limit {
      if state.buffer.is_empty() {
        self.refill(state);
      }

      let Some(value) = state.buffer.pop_front() else {
        break 'pop;
      };

      batch.push(value);
    }

    self.refill(state);

    batch
  }

  /// Whether a taker that just emptied the mailbox has seen everything.
  #[inline]
  fn is_drained(&self, state: &State<A, E>) -> bool {
    matches!(state.status, Status::Done(Exit::Success(_))) && state.buffer.is_empty()
  }
}

// -----------------------------------------------------------------------------
// Mailbox
// -----------------------------------------------------------------------------

/// A multi-producer queue with completion, the standard backpressure point
/// between a producing fiber and a consuming one.
///
/// A mailbox is open until it is ended with [`Mailbox::end`] or failed with
/// [`Mailbox::fail`]. After that, offers are rejected but buffered messages
/// stay drainable; a failure is reported to takers only once the buffer is
/// empty.
///
/// # Examples
///
/// ```no_run
/// use strand::core::Never;
/// use strand::sync::Mailbox;
///
/// # async fn pipeline() {
/// let mailbox: Mailbox<u32, Never> = Mailbox::bounded(2);
///
/// mailbox.offer(1).await;
/// mailbox.end();
///
/// assert_eq!(mailbox.take().await, Ok((vec![1], true)));
/// # }
/// ```
pub struct Mailbox<A, E> {
  shared: Arc<Shared<A, E>>,
}

impl<A, E> Mailbox<A, E> {
  /// Creates a mailbox without a capacity bound.
  pub fn unbounded() -> Self {
    Self::create(None, Strategy::Suspend)
  }

  /// Creates a mailbox that suspends offers while `capacity` messages are
  /// buffered.
  pub fn bounded(capacity: usize) -> Self {
    Self::with_strategy(capacity, Strategy::Suspend)
  }

  /// Creates a bounded mailbox with the given full-buffer `strategy`.
  ///
  /// # Panics
  ///
  /// Panics if `capacity` is zero.
  pub fn with_strategy(capacity: usize, strategy: Strategy) -> Self {
    if capacity == 0 {
      raise!(Error, BadArg, "mailbox capacity must be non-zero");
    }

    Self::create(Some(capacity), strategy)
  }

  fn create(capacity: Option<usize>, strategy: Strategy) -> Self {
    let buffer: usize = capacity.map_or(consts::CAP_MAILBOX_BUFFER, |capacity| {
      capacity.min(consts::CAP_MAILBOX_BUFFER)
    });

    Self {
      shared: Arc::new(Shared {
        id: MAILBOX_IDS.next(),
        capacity,
        strategy,
        state: Mutex::new(State {
          buffer: VecDeque::with_capacity(buffer),
          offers: VecDeque::new(),
          status: Status::Open,
        }),
        readers: Notify::new(),
        done: Notify::new(),
      }),
    }
  }

  #[inline]
  fn lock(&self) -> MutexGuard<'_, State<A, E>> {
    self.shared.state.lock()
  }

  #[inline]
  pub fn capacity(&self) -> Option<usize> {
    self.shared.capacity
  }

  #[inline]
  pub fn strategy(&self) -> Strategy {
    self.shared.strategy
  }

  /// Number of buffered messages.
  pub fn size(&self) -> usize {
    self.lock().buffer.len()
  }

  /// Returns `true` once the mailbox is done and no more messages can
  /// arrive.
  pub fn is_done(&self) -> bool {
    matches!(self.lock().status, Status::Done(_))
  }

  // ---------------------------------------------------------------------------
  // Producer API
  // ---------------------------------------------------------------------------

  /// Offers one message, suspending while a [`Strategy::Suspend`] buffer is
  /// full.
  ///
  /// Returns `false` if the message was rejected because the mailbox is no
  /// longer open, or because the buffer was full with [`Strategy::Dropping`].
  pub async fn offer(&self, value: A) -> bool {
    fiber::checkpoint().await;
    self.offer_many(VecDeque::from([value])).await == 1
  }

  /// Offers every message in order and returns how many were accepted.
  pub async fn offer_all<I>(&self, values: I) -> usize
  where
    I: IntoIterator<Item = A>,
  {
    fiber::checkpoint().await;
    self.offer_many(values.into_iter().collect()).await
  }

  /// Offers one message without ever suspending.
  ///
  /// Returns `false` if the message was not buffered.
  pub fn try_offer(&self, value: A) -> bool {
    let mut state = self.lock();

    if !state.is_open() {
      return false;
    }

    if state.offers.is_empty() && self.shared.has_room(&state.buffer) {
      state.buffer.push_back(value);
      drop(state);
      self.shared.readers.notify_waiters();
      return true;
    }

    if self.shared.strategy == Strategy::Sliding {
      state.buffer.pop_front();
      state.buffer.push_back(value);
      drop(state);
      self.shared.readers.notify_waiters();
      return true;
    }

    false
  }

  async fn offer_many(&self, mut values: VecDeque<A>) -> usize {
    let total: usize = values.len();

    let ticket: Arc<Ticket> = {
      let mut state = self.lock();

      if !state.is_open() {
        return 0;
      }

      let mut accepted: usize = 0;

      if state.offers.is_empty() {
        while self.shared.has_room(&state.buffer) {
          let Some(value) = values.pop_front() else {
            break;
          };

          state.buffer.push_back(value);
          accepted += 1;
        }
      }

      if values.is_empty() || self.shared.strategy == Strategy::Dropping {
        drop(state);

        if accepted > 0 {
          self.shared.readers.notify_waiters();
        }

        return accepted;
      }

      if self.shared.strategy == Strategy::Sliding {
        for value in values {
          state.buffer.pop_front();
          state.buffer.push_back(value);
        }

        drop(state);
        self.shared.readers.notify_waiters();

        return total;
      }

      let ticket: Arc<Ticket> = Arc::new(Ticket {
        accepted: Mutex::new(None),
        notify: Notify::new(),
      });

      state.offers.push_back(Offer {
        ticket: Arc::clone(&ticket),
        values,
        accepted,
      });

      ticket
    };

    self.shared.readers.notify_waiters();

    let cancel: Cancel<'_, A, E> = Cancel {
      shared: &self.shared,
      ticket: &ticket,
    };

    let accepted: usize = 'wait: loop {
      let notified = ticket.notify.notified();

      if let Some(accepted) = ticket.settled() {
        break 'wait accepted;
      }

      notified.await;
    };

    drop(cancel);

    accepted
  }

  // ---------------------------------------------------------------------------
  // Completion
  // ---------------------------------------------------------------------------

  /// Completes the mailbox with `exit`.
  ///
  /// Suspended offers made before this call are still delivered. Returns
  /// `false` if the mailbox was already completed.
  pub fn done(&self, exit: Exit<(), E>) -> bool {
    let mut state = self.lock();

    if !state.is_open() {
      return false;
    }

    if state.offers.is_empty() {
      self.shared.set_done(&mut state, exit);
    } else {
      state.status = Status::Closing(exit);
    }

    true
  }

  /// Ends the mailbox without an error.
  #[inline]
  pub fn end(&self) -> bool {
    self.done(Exit::UNIT)
  }

  /// Fails the mailbox with `error` once the buffer is drained.
  #[inline]
  pub fn fail(&self, error: E) -> bool {
    self.done(Exit::Failure(Cause::Fail(error)))
  }

  #[inline]
  pub fn fail_cause(&self, cause: Cause<E>) -> bool {
    self.done(Exit::Failure(cause))
  }

  /// Discards every buffered message, rejects suspended offers, and ends the
  /// mailbox.
  ///
  /// Returns `false` if the mailbox was already done.
  pub fn shutdown(&self) -> bool {
    let mut state = self.lock();

    let exit: Exit<(), E> = match mem::replace(&mut state.status, Status::Open) {
      Status::Open => Exit::UNIT,
      Status::Closing(exit) => exit,
      Status::Done(exit) => {
        state.status = Status::Done(exit);
        return false;
      }
    };

    state.buffer.clear();

    for offer in state.offers.drain(..) {
      offer.ticket.settle(offer.accepted);
    }

    self.shared.set_done(&mut state, exit);

    true
  }

  /// Discards every buffered message and returns them.
  pub fn clear(&self) -> Vec<A> {
    let mut state = self.lock();
    let cleared: Vec<A> = state.buffer.drain(..).collect();

    self.shared.refill(&mut state);

    cleared
  }
}

impl<A, E> Mailbox<A, E>
where
  E: Clone,
{
  // ---------------------------------------------------------------------------
  // Consumer API
  // ---------------------------------------------------------------------------

  /// Takes every message available right now, suspending while there is
  /// none.
  ///
  /// The flag is `true` once the mailbox has ended and everything was
  /// drained. A failed mailbox reports its cause once it is empty.
  pub async fn take(&self) -> std::result::Result<(Vec<A>, bool), Cause<E>> {
    self.take_up_to(1, usize::MAX).await
  }

  /// Waits for `count` messages, or for the mailbox to complete, and takes at
  /// most `count`.
  pub async fn take_n(&self, count: usize) -> std::result::Result<(Vec<A>, bool), Cause<E>> {
    self.take_up_to(count, count).await
  }

  /// Takes a single message.
  ///
  /// Returns `None` once the mailbox has ended and everything was drained.
  pub async fn take_one(&self) -> std::result::Result<Option<A>, Cause<E>> {
    let (mut batch, _done): (Vec<A>, bool) = self.take_up_to(1, 1).await?;
    Ok(batch.pop())
  }

  async fn take_up_to(&self, wanted: usize, limit: usize) -> std::result::Result<(Vec<A>, bool), Cause<E>> {
    fiber::checkpoint().await;

    'take: loop {
      let notified = self.shared.readers.notified();

      {
        let mut state = self.lock();
        let available: usize = state.available();

        if available > 0 && (available >= wanted || !state.is_open()) {
          let batch: Vec<A> = self.shared.pop(&mut state, limit);
          let drained: bool = self.shared.is_drained(&state);

          break 'take Ok((batch, drained));
        }

        match &state.status {
          Status::Done(Exit::Success(())) => break 'take Ok((Vec::new(), true)),
          Status::Done(Exit::Failure(cause)) => break 'take Err(cause.clone()),
          Status::Open | Status::Closing(_) => {}
        }
      }

      notified.await;
    }
  }

  /// Waits until the mailbox is done and returns how it completed.
  pub async fn await_done(&self) -> std::result::Result<(), Cause<E>> {
    fiber::checkpoint().await;

    'wait: loop {
      let notified = self.shared.done.notified();

      let done: Option<Exit<(), E>> = match &self.lock().status {
        Status::Done(exit) => Some(exit.clone()),
        Status::Open | Status::Closing(_) => None,
      };

      if let Some(exit) = done {
        break 'wait exit.into_result();
      }

      notified.await;
    }
  }
}

/// Withdraws an unsettled offer when the offering fiber stops waiting.
struct Cancel<'a, A, E> {
  shared: &'a Shared<A, E>,
  ticket: &'a Arc<Ticket>,
}

impl<A, E> Drop for Cancel<'_, A, E> {
  fn drop(&mut self) {
    if self.ticket.settled().is_some() {
      return;
    }

    let mut state = self.shared.state.lock();

    state
      .offers
      .retain(|offer| !Arc::ptr_eq(&offer.ticket, self.ticket));

    self.shared.finish_closing(&mut state);
  }
}

impl<A, E> Clone for Mailbox<A, E> {
  #[inline]
  fn clone(&self) -> Self {
    Self {
      shared: Arc::clone(&self.shared),
    }
  }
}

impl<A, E> Debug for Mailbox<A, E> {
  fn fmt(&self, f: &mut Formatter<'_>) -> Result {
    let state = self.lock();

    f.debug_struct("Mailbox")
      .field("id", &self.shared.id)
      .field("capacity", &self.shared.capacity)
      .field("strategy", &self.shared.strategy)
      .field("size", &state.buffer.len())
      .field("open", &state.is_open())
      .finish()
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use crate::core::Cause;
  use crate::core::Never;
  use crate::sync::Mailbox;
  use crate::sync::Strategy;

  #[tokio::test]
  async fn test_take_drains_in_one_batch() {
    let mailbox: Mailbox<u32, Never> = Mailbox::unbounded();

    assert_eq!(mailbox.offer_all([1, 2, 3]).await, 3);
    assert_eq!(mailbox.take().await, Ok((vec![1, 2, 3], false)));
  }

  #[tokio::test]
  async fn test_offer_rejected_after_end() {
    let mailbox: Mailbox<u32, Never> = Mailbox::unbounded();

    assert!(mailbox.offer(1).await);
    assert!(mailbox.end());
    assert!(!mailbox.end());
    assert!(!mailbox.offer(2).await);
    assert!(!mailbox.try_offer(3));
    assert_eq!(mailbox.take().await, Ok((vec![1], true)));
    assert_eq!(mailbox.take().await, Ok((vec![], true)));
  }

  #[tokio::test]
  async fn test_failure_after_drain() {
    let mailbox: Mailbox<u32, &str> = Mailbox::unbounded();

    mailbox.offer_all([1, 2]).await;
    mailbox.fail("boom");

    assert_eq!(mailbox.take().await, Ok((vec![1, 2], false)));
    assert_eq!(mailbox.take().await, Err(Cause::fail("boom")));
    assert_eq!(mailbox.await_done().await, Err(Cause::fail("boom")));
  }

  #[tokio::test]
  async fn test_dropping_strategy() {
    let mailbox: Mailbox<u32, Never> = Mailbox::with_strategy(2, Strategy::Dropping);

    assert_eq!(mailbox.offer_all([1, 2, 3]).await, 2);
    assert!(!mailbox.offer(4).await);
    assert_eq!(mailbox.take().await, Ok((vec![1, 2], false)));
  }

  #[tokio::test]
  async fn test_sliding_strategy() {
    let mailbox: Mailbox<u32, Never> = Mailbox::with_strategy(2, Strategy::Sliding);

    assert_eq!(mailbox.offer_all([1, 2, 3]).await, 3);
    assert!(mailbox.try_offer(4));
    assert_eq!(mailbox.take().await, Ok((vec![3, 4], false)));
  }

  #[tokio::test]
  async fn test_take_n_and_take_one() {
    let mailbox: Mailbox<u32, Never> = Mailbox::unbounded();

    mailbox.offer_all([1, 2, 3]).await;
    mailbox.end();

    assert_eq!(mailbox.take_n(2).await, Ok((vec![1, 2], false)));
    assert_eq!(mailbox.take_one().await, Ok(Some(3)));
    assert_eq!(mailbox.take_one().await, Ok(None));
    assert!(mailbox.is_done());
  }

  #[tokio::test]
  async fn test_clear_and_shutdown() {
    let mailbox: Mailbox<u32, Never> = Mailbox::unbounded();

    mailbox.offer_all([1, 2]).await;

    assert_eq!(mailbox.clear(), vec![1, 2]);
    assert_eq!(mailbox.size(), 0);

    mailbox.offer(3).await;

    assert!(mailbox.shutdown());
    assert!(!mailbox.shutdown());
    assert_eq!(mailbox.size(), 0);
    assert_eq!(mailbox.take().await, Ok((vec![], true)));
  }

  #[test]
  fn test_zero_capacity_panics() {
    assert!(std::panic::catch_unwind(|| Mailbox::<u32, Never>::bounded(0)).is_err());
  }
}
