use parking_lot::Mutex;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::fmt::Result;
use std::mem;
use std::sync::Arc;

use crate::core::Exit;
use crate::core::Never;
use crate::fiber;
use crate::sync::Deferred;

/// A wait signal between the two sides of a handoff.
type Signal = Deferred<(), Never>;

enum State<A> {
  /// No value is waiting. Completed when a producer puts one in.
  Empty(Signal),
  /// A value is waiting. Completed when a consumer takes it out.
  Full(A, Signal),
}

/// An unbuffered rendezvous between one producer and one consumer.
///
/// Every successful exchange pairs exactly one [`Handoff::offer`] with exactly
/// one [`Handoff::take`]. Both sides suspend until the other arrives.
pub struct Handoff<A> {
  state: Arc<Mutex<State<A>>>,
}

impl<A> Handoff<A> {
  pub fn new() -> Self {
    Self {
      state: Arc::new(Mutex::new(State::Empty(Signal::new()))),
    }
  }

  /// Hands `value` over, suspending until a consumer has taken it.
  ///
  /// Producers that arrive while another value is waiting queue up behind
  /// it. If the producer stops waiting after its value was placed, the value
  /// is still delivered to the next consumer.
  pub async fn offer(&self, value: A) {
    fiber::checkpoint().await;

    let mut value: A = value;

    'offer: loop {
      match self.place(value) {
        Ok(taken) => {
          wait(taken).await;
          break 'offer;
        }
        Err((returned, taken)) => {
          value = returned;
          wait(taken).await;
        }
      }
    }
  }

  /// Takes a value, suspending until a producer hands one over.
  pub async fn take(&self) -> A {
    fiber::checkpoint().await;

    'take: loop {
      match self.remove() {
        Ok(value) => break 'take value,
        Err(arrived) => wait(arrived).await,
      }
    }
  }

  /// Takes a value if a producer is waiting, without suspending.
  pub fn poll(&self) -> Option<A> {
    self.remove().ok()
  }

  /// Moves `value` into an empty handoff and wakes waiting consumers.
  ///
  /// When the handoff is full, returns the value with the signal completed
  /// by the next take.
  fn place(&self, value: A) -> std::result::Result<Signal, (A, Signal)> {
    let mut state = self.state.lock();

    if let State::Full(_, taken) = &*state {
      return Err((value, taken.clone()));
    }

    let taken: Signal = Signal::new();

    if let State::Empty(arrived) = mem::replace(&mut *state, State::Full(value, taken.clone())) {
      arrived.succeed(());
    }

    Ok(taken)
  }

  /// Moves the waiting value out and wakes its producer.
  ///
  /// When the handoff is empty, returns the signal completed by the next
  /// offer.
  fn remove(&self) -> std::result::Result<A, Signal> {
    let mut state = self.state.lock();

    if let State::Empty(arrived) = &*state {
      return Err(arrived.clone());
    }

    match mem::replace(&mut *state, State::Empty(Signal::new())) {
      State::Full(value, taken) => {
        taken.succeed(());
        Ok(value)
      }
      State::Empty(arrived) => {
        *state = State::Empty(arrived.clone());
        Err(arrived)
      }
    }
  }

  /// Returns `true` if a value is waiting to be taken.
  pub fn is_full(&self) -> bool {
    matches!(&*self.state.lock(), State::Full(_, _))
  }
}

async fn wait(signal: Signal) {
  let _ignore: Exit<(), Never> = signal.await_exit().await;
}

impl<A> Clone for Handoff<A> {
  #[inline]
  fn clone(&self) -> Self {
    Self {
      state: Arc::clone(&self.state),
    }
  }
}

impl<A> Default for Handoff<A> {
  #[inline]
  fn default() -> Self {
    Self::new()
  }
}

impl<A> Debug for Handoff<A> {
  fn fmt(&self, f: &mut Formatter<'_>) -> Result {
    f.debug_struct("Handoff")
      .field("full", &self.is_full())
      .finish()
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------
