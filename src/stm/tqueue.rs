use std::collections::VecDeque;

use crate::raise;
use crate::stm::Stm;
use crate::stm::TRef;

/// A bounded FIFO queue managed transactionally.
///
/// [`TQueue::offer`] retries while the queue is full and [`TQueue::take`]
/// retries while it is empty, so both suspend the committing fiber.
#[derive(Debug)]
pub struct TQueue<A> {
  items: TRef<VecDeque<A>>,
  capacity: usize,
}

impl<A> TQueue<A>
where
  A: Clone + Send + Sync + 'static,
{
  /// Creates an empty queue holding at most `capacity` items.
  ///
  /// # Panics
  ///
  /// Panics if `capacity` is zero.
  pub fn bounded(capacity: usize) -> Self {
    if capacity == 0 {
      raise!(Error, BadArg, "queue capacity must be non-zero");
    }

    Self {
      items: TRef::new(VecDeque::with_capacity(capacity)),
      capacity,
    }
  }

  #[inline]
  pub const fn capacity(&self) -> usize {
    self.capacity
  }

  /// Appends `value`, retrying while the queue is full.
  pub fn offer<E>(&self, value: A) -> Stm<(), E>
  where
    E: Send + 'static,
  {
    let items: TRef<VecDeque<A>> = self.items.clone();
    let capacity: usize = self.capacity;

    self.items.get().flat_map(move |mut queue| {
      if queue.len() >= capacity {
        return Stm::retry();
      }

      queue.push_back(value.clone());
      items.set(queue)
    })
  }

  /// Removes the oldest item, retrying while the queue is empty.
  pub fn take<E>(&self) -> Stm<A, E>
  where
    E: Send + 'static,
  {
    let items: TRef<VecDeque<A>> = self.items.clone();

    self.items.get().flat_map(move |mut queue| match queue.pop_front() {
      Some(value) => items.set(queue).map(move |()| value.clone()),
      None => Stm::retry(),
    })
  }

  /// Removes the oldest item if there is one.
  pub fn poll<E>(&self) -> Stm<Option<A>, E>
  where
    E: Send + 'static,
  {
    self.take().map(Some).or_else(Stm::succeed(None))
  }

  pub fn size<E>(&self) -> Stm<usize, E>
  where
    E: Send + 'static,
  {
    self.items.get().map(|queue| queue.len())
  }
}

impl<A> Clone for TQueue<A> {
  #[inline]
  fn clone(&self) -> Self {
    Self {
      items: self.items.clone(),
      capacity: self.capacity,
    }
  }
}

// -----------------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
  use crate::core::Never;
  use crate::stm::Stm;
  use crate::stm::TQueue;

  #[tokio::test]
  async fn test_fifo_order() {
    let queue: TQueue<u32> = TQueue::bounded(4);
    let offers: Stm<Vec<()>, Never> = Stm::for_each(1..=3, |value| queue.offer(value));

    offers.commit().await.unwrap();

    assert_eq!(queue.size::<Never>().commit().await, Ok(3));
    assert_eq!(queue.take::<Never>().commit().await, Ok(1));
    assert_eq!(queue.take::<Never>().commit().await, Ok(2));
    assert_eq!(queue.poll::<Never>().commit().await, Ok(Some(3)));
    assert_eq!(queue.poll::<Never>().commit().await, Ok(None));
  }

  #[tokio::test]
  async fn test_offer_retries_when_full() {
    let queue: TQueue<u32> = TQueue::bounded(1);

    queue.offer::<Never>(1).commit().await.unwrap();

    let full: Stm<bool, Never> = queue.offer(2).map(|()| true).or_else(Stm::succeed(false));

    assert_eq!(full.commit().await, Ok(false));
    assert_eq!(queue.size::<Never>().commit().await, Ok(1));
  }

  #[test]
  fn test_zero_capacity_panics() {
    assert!(std::panic::catch_unwind(|| TQueue::<u32>::bounded(0)).is_err());
  }
}
